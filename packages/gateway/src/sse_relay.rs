//! Fan-out registry from sessions to live HTTP push connections.
//!
//! The relay knows nothing about HTTP: `send` and `close` are opaque
//! callbacks supplied by whoever owns the connection. A failing send
//! removes only that connection; the rest keep receiving.

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::Mutex;

pub type SendFn = Box<dyn Fn(u64, &str, &Value) -> bool + Send + Sync>;
pub type CloseFn = Box<dyn Fn() + Send + Sync>;

struct Subscriber {
    send: SendFn,
    close: CloseFn,
}

#[derive(Default)]
struct RelayState {
    sessions: HashMap<String, HashMap<String, Subscriber>>,
    connection_sessions: HashMap<String, String>,
}

#[derive(Default)]
pub struct SseRelay {
    state: Mutex<RelayState>,
}

impl std::fmt::Debug for SseRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SseRelay").finish_non_exhaustive()
    }
}

impl SseRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(
        &self,
        connection_id: &str,
        session_id: &str,
        send: SendFn,
        close: CloseFn,
    ) {
        let mut state = self.state.lock().await;
        state
            .connection_sessions
            .insert(connection_id.to_string(), session_id.to_string());
        state
            .sessions
            .entry(session_id.to_string())
            .or_default()
            .insert(connection_id.to_string(), Subscriber { send, close });
    }

    /// Deliver one event to every subscriber of the session. Returns
    /// the number of connections that received it.
    pub async fn forward(
        &self,
        session_id: &str,
        event_id: u64,
        event_name: &str,
        payload: &Value,
    ) -> usize {
        let mut state = self.state.lock().await;
        let Some(subscribers) = state.sessions.get_mut(session_id) else {
            return 0;
        };

        let mut dead = Vec::new();
        let mut delivered = 0;
        for (connection_id, subscriber) in subscribers.iter() {
            if (subscriber.send)(event_id, event_name, payload) {
                delivered += 1;
            } else {
                dead.push(connection_id.clone());
            }
        }

        for connection_id in &dead {
            if let Some(subscriber) = subscribers.remove(connection_id) {
                (subscriber.close)();
            }
        }
        let session_empty = subscribers.is_empty();
        for connection_id in dead {
            state.connection_sessions.remove(&connection_id);
            tracing::debug!(connection_id, session_id, "removed dead sse subscriber");
        }
        if session_empty {
            state.sessions.remove(session_id);
        }
        delivered
    }

    /// Close every subscriber for a session and clear its entry.
    /// Used when the execution stream terminates.
    pub async fn close_all(&self, session_id: &str) {
        let mut state = self.state.lock().await;
        if let Some(subscribers) = state.sessions.remove(session_id) {
            for (connection_id, subscriber) in subscribers {
                (subscriber.close)();
                state.connection_sessions.remove(&connection_id);
            }
        }
    }

    /// Remove one connection directly, on normal client disconnect.
    pub async fn unregister(&self, connection_id: &str) {
        let mut state = self.state.lock().await;
        let Some(session_id) = state.connection_sessions.remove(connection_id) else {
            return;
        };
        if let Some(subscribers) = state.sessions.get_mut(&session_id) {
            subscribers.remove(connection_id);
            if subscribers.is_empty() {
                state.sessions.remove(&session_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting_subscriber(
        counter: Arc<AtomicUsize>,
        healthy: Arc<AtomicBool>,
        closed: Arc<AtomicBool>,
    ) -> (SendFn, CloseFn) {
        let send: SendFn = Box::new(move |_, _, _| {
            if healthy.load(Ordering::SeqCst) {
                counter.fetch_add(1, Ordering::SeqCst);
                true
            } else {
                false
            }
        });
        let close: CloseFn = Box::new(move || closed.store(true, Ordering::SeqCst));
        (send, close)
    }

    #[tokio::test]
    async fn forward_reaches_all_subscribers() {
        let relay = SseRelay::new();
        let a = Arc::new(AtomicUsize::new(0));
        let b = Arc::new(AtomicUsize::new(0));
        let up = Arc::new(AtomicBool::new(true));
        let closed = Arc::new(AtomicBool::new(false));

        let (send, close) = counting_subscriber(a.clone(), up.clone(), closed.clone());
        relay.register("c1", "s1", send, close).await;
        let (send, close) = counting_subscriber(b.clone(), up.clone(), closed.clone());
        relay.register("c2", "s1", send, close).await;

        let delivered = relay.forward("s1", 1, "text_chunk", &json!({})).await;
        assert_eq!(delivered, 2);
        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dead_subscriber_is_removed_and_others_survive() {
        let relay = SseRelay::new();
        let a = Arc::new(AtomicUsize::new(0));
        let b = Arc::new(AtomicUsize::new(0));
        let a_up = Arc::new(AtomicBool::new(false));
        let b_up = Arc::new(AtomicBool::new(true));
        let a_closed = Arc::new(AtomicBool::new(false));
        let b_closed = Arc::new(AtomicBool::new(false));

        let (send, close) = counting_subscriber(a.clone(), a_up.clone(), a_closed.clone());
        relay.register("c1", "s1", send, close).await;
        let (send, close) = counting_subscriber(b.clone(), b_up.clone(), b_closed.clone());
        relay.register("c2", "s1", send, close).await;

        assert_eq!(relay.forward("s1", 1, "text_chunk", &json!({})).await, 1);
        assert!(a_closed.load(Ordering::SeqCst));
        assert!(!b_closed.load(Ordering::SeqCst));

        // Healthy subscriber keeps receiving after the dead one is gone.
        assert_eq!(relay.forward("s1", 2, "text_chunk", &json!({})).await, 1);
        assert_eq!(b.load(Ordering::SeqCst), 2);
        assert_eq!(a.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn close_all_invokes_every_close() {
        let relay = SseRelay::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let up = Arc::new(AtomicBool::new(true));
        let c1 = Arc::new(AtomicBool::new(false));
        let c2 = Arc::new(AtomicBool::new(false));

        let (send, close) = counting_subscriber(counter.clone(), up.clone(), c1.clone());
        relay.register("c1", "s1", send, close).await;
        let (send, close) = counting_subscriber(counter.clone(), up.clone(), c2.clone());
        relay.register("c2", "s1", send, close).await;

        relay.close_all("s1").await;
        assert!(c1.load(Ordering::SeqCst));
        assert!(c2.load(Ordering::SeqCst));
        assert_eq!(relay.forward("s1", 1, "text_chunk", &json!({})).await, 0);
    }

    #[tokio::test]
    async fn unregister_removes_single_connection() {
        let relay = SseRelay::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let up = Arc::new(AtomicBool::new(true));
        let closed = Arc::new(AtomicBool::new(false));

        let (send, close) = counting_subscriber(counter.clone(), up.clone(), closed.clone());
        relay.register("c1", "s1", send, close).await;
        relay.unregister("c1").await;
        assert_eq!(relay.forward("s1", 1, "text_chunk", &json!({})).await, 0);
    }
}
