//! Bounded per-session replay buffer for streamed execution events.
//!
//! Best-effort replay, not a durable log: eviction is silent, and a
//! subscriber whose last seen id has already been evicted receives
//! only what remains.

use std::collections::{HashMap, VecDeque};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;

pub const DEFAULT_CAPACITY: usize = 100;

#[derive(Debug, Clone, Serialize)]
pub struct BufferedEvent {
    pub session_id: String,
    pub event_id: u64,
    pub event_name: String,
    pub payload: Value,
}

#[derive(Debug, Default)]
struct SessionBuffer {
    next_id: u64,
    events: VecDeque<BufferedEvent>,
}

#[derive(Debug)]
pub struct EventBuffer {
    capacity: usize,
    sessions: RwLock<HashMap<String, SessionBuffer>>,
}

impl EventBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Append an event, allocating the session's next monotonic id.
    /// Evicts oldest entries once the session exceeds capacity.
    pub async fn push(&self, session_id: &str, event_name: &str, payload: Value) -> u64 {
        let mut sessions = self.sessions.write().await;
        let buffer = sessions.entry(session_id.to_string()).or_default();
        buffer.next_id += 1;
        let event_id = buffer.next_id;
        buffer.events.push_back(BufferedEvent {
            session_id: session_id.to_string(),
            event_id,
            event_name: event_name.to_string(),
            payload,
        });
        while buffer.events.len() > self.capacity {
            buffer.events.pop_front();
        }
        event_id
    }

    /// All buffered events with id strictly greater than
    /// `last_event_id`, in order. Empty for unknown sessions.
    pub async fn get_since(&self, session_id: &str, last_event_id: u64) -> Vec<BufferedEvent> {
        let sessions = self.sessions.read().await;
        match sessions.get(session_id) {
            Some(buffer) => buffer
                .events
                .iter()
                .filter(|event| event.event_id > last_event_id)
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    pub async fn clear(&self, session_id: &str) {
        self.sessions.write().await.remove(session_id);
    }
}

impl Default for EventBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn ids_are_monotonic_and_gapless_under_capacity() {
        let buffer = EventBuffer::new(10);
        for i in 0..5 {
            let id = buffer.push("s1", "text_chunk", json!({ "i": i })).await;
            assert_eq!(id, i + 1);
        }
        let events = buffer.get_since("s1", 0).await;
        let ids: Vec<u64> = events.iter().map(|e| e.event_id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn overflow_evicts_oldest() {
        let buffer = EventBuffer::new(3);
        for i in 0..4 {
            buffer.push("s1", "text_chunk", json!({ "i": i })).await;
        }
        let events = buffer.get_since("s1", 0).await;
        let ids: Vec<u64> = events.iter().map(|e| e.event_id).collect();
        assert_eq!(ids, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn get_since_is_strictly_greater() {
        let buffer = EventBuffer::default();
        assert_eq!(buffer.push("s1", "message", json!({"text": "a"})).await, 1);
        assert_eq!(buffer.push("s1", "message", json!({"text": "b"})).await, 2);
        let events = buffer.get_since("s1", 1).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_id, 2);
        assert_eq!(events[0].payload["text"], "b");
    }

    #[tokio::test]
    async fn unknown_session_returns_empty() {
        let buffer = EventBuffer::default();
        assert!(buffer.get_since("nope", 0).await.is_empty());
    }

    #[tokio::test]
    async fn sessions_are_independent() {
        let buffer = EventBuffer::default();
        assert_eq!(buffer.push("s1", "message", json!({})).await, 1);
        assert_eq!(buffer.push("s2", "message", json!({})).await, 1);
        buffer.clear("s1").await;
        assert!(buffer.get_since("s1", 0).await.is_empty());
        assert_eq!(buffer.get_since("s2", 0).await.len(), 1);
    }
}
