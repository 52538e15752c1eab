//! Idempotency gate for mutating endpoints.
//!
//! Keyed on the `Idempotency-Key` request header. The first request
//! claims the key atomically; concurrent duplicates get 409 while the
//! original is in flight, and later retries replay the cached response
//! byte for byte. A broken store degrades to pass-through so the
//! gateway keeps serving.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use http_body_util::BodyExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use exec_gateway_error::GatewayError;

use crate::scheduler::now_ms;

pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";
pub const REPLAY_HEADER: &str = "idempotency-replayed";

/// Response captured after a handler completes, replayed verbatim for
/// retries of the same key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CachedResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum IdempotencyEntry {
    InFlight,
    Completed { response: CachedResponse },
}

/// Outcome of attempting to claim a key.
#[derive(Debug)]
pub enum ClaimOutcome {
    /// Key was free; this request owns it now.
    Claimed,
    /// Another request holds the key and has not finished.
    InFlight,
    /// A previous request finished; replay its response.
    Completed(CachedResponse),
}

/// Atomic claim/complete/release over some shared keyspace. The redis
/// implementation makes the gate safe across gateway replicas.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn claim(&self, key: &str, ttl: Duration) -> Result<ClaimOutcome, GatewayError>;
    async fn complete(
        &self,
        key: &str,
        response: CachedResponse,
        ttl: Duration,
    ) -> Result<(), GatewayError>;
    /// Drop an in-flight claim so the caller may retry. Used when the
    /// response body cannot be captured for replay.
    async fn release(&self, key: &str) -> Result<(), GatewayError>;
}

#[derive(Debug, Default)]
pub struct InMemoryIdempotencyStore {
    entries: Mutex<HashMap<String, (IdempotencyEntry, i64)>>,
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn claim(&self, key: &str, ttl: Duration) -> Result<ClaimOutcome, GatewayError> {
        let mut entries = self.entries.lock().await;
        let now = now_ms();
        entries.retain(|_, (_, expires_at)| *expires_at > now);

        match entries.get(key) {
            Some((IdempotencyEntry::InFlight, _)) => Ok(ClaimOutcome::InFlight),
            Some((IdempotencyEntry::Completed { response }, _)) => {
                Ok(ClaimOutcome::Completed(response.clone()))
            }
            None => {
                entries.insert(
                    key.to_string(),
                    (IdempotencyEntry::InFlight, now + ttl.as_millis() as i64),
                );
                Ok(ClaimOutcome::Claimed)
            }
        }
    }

    async fn complete(
        &self,
        key: &str,
        response: CachedResponse,
        ttl: Duration,
    ) -> Result<(), GatewayError> {
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_string(),
            (
                IdempotencyEntry::Completed { response },
                now_ms() + ttl.as_millis() as i64,
            ),
        );
        Ok(())
    }

    async fn release(&self, key: &str) -> Result<(), GatewayError> {
        self.entries.lock().await.remove(key);
        Ok(())
    }
}

/// Redis-backed store: `SET NX PX` for the claim so replicas race
/// safely, plain `SET PX` for completion overwrite.
pub struct RedisIdempotencyStore {
    connection: redis::aio::ConnectionManager,
    key_prefix: String,
}

impl std::fmt::Debug for RedisIdempotencyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisIdempotencyStore")
            .field("key_prefix", &self.key_prefix)
            .finish_non_exhaustive()
    }
}

impl RedisIdempotencyStore {
    pub async fn connect(url: &str) -> Result<Self, GatewayError> {
        let client = redis::Client::open(url).map_err(store_error)?;
        let connection = client
            .get_connection_manager()
            .await
            .map_err(store_error)?;
        Ok(Self {
            connection,
            key_prefix: "exec-gateway:idempotency:".to_string(),
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }
}

fn store_error(err: redis::RedisError) -> GatewayError {
    GatewayError::StoreUnavailable {
        message: err.to_string(),
    }
}

fn entry_error(err: serde_json::Error) -> GatewayError {
    GatewayError::StoreUnavailable {
        message: format!("corrupt idempotency entry: {err}"),
    }
}

#[async_trait]
impl IdempotencyStore for RedisIdempotencyStore {
    async fn claim(&self, key: &str, ttl: Duration) -> Result<ClaimOutcome, GatewayError> {
        let mut connection = self.connection.clone();
        let marker = serde_json::to_string(&IdempotencyEntry::InFlight).map_err(entry_error)?;

        let claimed: Option<String> = redis::cmd("SET")
            .arg(self.key(key))
            .arg(&marker)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut connection)
            .await
            .map_err(store_error)?;
        if claimed.is_some() {
            return Ok(ClaimOutcome::Claimed);
        }

        let existing: Option<String> = redis::cmd("GET")
            .arg(self.key(key))
            .query_async(&mut connection)
            .await
            .map_err(store_error)?;
        match existing {
            // Claim raced with expiry; treat as in flight and let the
            // client retry.
            None => Ok(ClaimOutcome::InFlight),
            Some(raw) => match serde_json::from_str(&raw).map_err(entry_error)? {
                IdempotencyEntry::InFlight => Ok(ClaimOutcome::InFlight),
                IdempotencyEntry::Completed { response } => Ok(ClaimOutcome::Completed(response)),
            },
        }
    }

    async fn complete(
        &self,
        key: &str,
        response: CachedResponse,
        ttl: Duration,
    ) -> Result<(), GatewayError> {
        let mut connection = self.connection.clone();
        let entry =
            serde_json::to_string(&IdempotencyEntry::Completed { response }).map_err(entry_error)?;
        redis::cmd("SET")
            .arg(self.key(key))
            .arg(entry)
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async::<()>(&mut connection)
            .await
            .map_err(store_error)
    }

    async fn release(&self, key: &str) -> Result<(), GatewayError> {
        let mut connection = self.connection.clone();
        redis::cmd("DEL")
            .arg(self.key(key))
            .query_async::<()>(&mut connection)
            .await
            .map_err(store_error)
    }
}

#[derive(Clone)]
pub struct IdempotencyGate {
    pub store: Arc<dyn IdempotencyStore>,
    pub ttl: Duration,
}

impl std::fmt::Debug for IdempotencyGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdempotencyGate")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

/// Route middleware. Requests without the header pass straight
/// through; the gate never rejects a request it cannot track.
pub async fn idempotency_middleware(
    State(gate): State<IdempotencyGate>,
    request: Request,
    next: Next,
) -> Response {
    let Some(key) = request
        .headers()
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
    else {
        return next.run(request).await;
    };

    match gate.store.claim(&key, gate.ttl).await {
        Ok(ClaimOutcome::Claimed) => {}
        Ok(ClaimOutcome::InFlight) => {
            return crate::router::ApiError(GatewayError::DuplicateRequest { key })
                .into_response();
        }
        Ok(ClaimOutcome::Completed(cached)) => {
            return replay_response(cached);
        }
        Err(err) => {
            // Degrade to pass-through rather than refuse service.
            tracing::warn!(key, error = %err, "idempotency store unavailable, passing through");
            return next.run(request).await;
        }
    }

    let response = next.run(request).await;
    let (parts, body) = response.into_parts();
    let bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            let _ = gate.store.release(&key).await;
            tracing::warn!(key, error = %err, "failed to buffer response body");
            return crate::router::ApiError(GatewayError::StreamError {
                message: "response body unavailable".to_string(),
            })
            .into_response();
        }
    };

    // The handler's final response overwrites the claim whatever its
    // status; a retried key replays the first outcome verbatim instead
    // of re-executing the handler.
    let cached = CachedResponse {
        status: parts.status.as_u16(),
        content_type: parts
            .headers
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string),
        body: bytes.to_vec(),
    };
    if let Err(err) = gate.store.complete(&key, cached, gate.ttl).await {
        tracing::warn!(key, error = %err, "failed to cache idempotent response");
    }

    Response::from_parts(parts, Body::from(bytes))
}

fn replay_response(cached: CachedResponse) -> Response {
    let mut response = Response::builder().status(
        StatusCode::from_u16(cached.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
    );
    if let Some(content_type) = &cached.content_type {
        if let Ok(value) = HeaderValue::from_str(content_type) {
            response = response.header(header::CONTENT_TYPE, value);
        }
    }
    response = response.header(REPLAY_HEADER, HeaderValue::from_static("true"));
    response
        .body(Body::from(cached.body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response_ok() -> CachedResponse {
        CachedResponse {
            status: 200,
            content_type: Some("application/json".to_string()),
            body: br#"{"ok":true}"#.to_vec(),
        }
    }

    #[tokio::test]
    async fn first_claim_wins_duplicates_see_in_flight() {
        let store = InMemoryIdempotencyStore::default();
        let ttl = Duration::from_secs(60);

        assert!(matches!(
            store.claim("k1", ttl).await.unwrap(),
            ClaimOutcome::Claimed
        ));
        assert!(matches!(
            store.claim("k1", ttl).await.unwrap(),
            ClaimOutcome::InFlight
        ));
    }

    #[tokio::test]
    async fn completed_entry_replays() {
        let store = InMemoryIdempotencyStore::default();
        let ttl = Duration::from_secs(60);

        store.claim("k1", ttl).await.unwrap();
        store.complete("k1", response_ok(), ttl).await.unwrap();

        match store.claim("k1", ttl).await.unwrap() {
            ClaimOutcome::Completed(cached) => assert_eq!(cached, response_ok()),
            other => panic!("expected replay, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn released_claim_can_be_retried() {
        let store = InMemoryIdempotencyStore::default();
        let ttl = Duration::from_secs(60);

        store.claim("k1", ttl).await.unwrap();
        store.release("k1").await.unwrap();
        assert!(matches!(
            store.claim("k1", ttl).await.unwrap(),
            ClaimOutcome::Claimed
        ));
    }

    #[tokio::test]
    async fn expired_entries_are_evicted() {
        let store = InMemoryIdempotencyStore::default();

        store.claim("k1", Duration::ZERO).await.unwrap();
        assert!(matches!(
            store.claim("k1", Duration::from_secs(60)).await.unwrap(),
            ClaimOutcome::Claimed
        ));
    }
}
