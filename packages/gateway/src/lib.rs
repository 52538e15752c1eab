//! Control-plane gateway for per-user execution instances: lifecycle
//! scheduling, the authenticated control channel, event relay, and
//! request idempotency.

pub mod channel;
pub mod cli;
pub mod collaborators;
pub mod config;
pub mod crypto;
pub mod event_buffer;
pub mod idempotency;
pub mod router;
pub mod scheduler;
pub mod sse_relay;
