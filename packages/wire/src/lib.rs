//! Control-channel wire protocol.
//!
//! Every message on the channel is a JSON envelope with a `type`
//! discriminator. Unknown discriminators decode to the `Ignored`
//! variant so a newer execution plane never kills an older gateway
//! connection.

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

/// Messages sent by an execution instance to the gateway.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InstanceMessage {
    /// Handshake credential. Exactly one of `ticket` / `token` is
    /// expected; a single-use connect ticket takes precedence.
    Auth {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ticket: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    /// Correlated RPC call into the control plane.
    Request {
        id: String,
        #[serde(flatten)]
        call: RpcCall,
    },
    /// One-way notification; the gateway never replies, and failures
    /// handling it are never surfaced back.
    FireAndForget {
        #[serde(flatten)]
        notice: Notice,
    },
    /// Reconnect support: ask for the fate of previously issued
    /// request ids.
    Resume { ids: Vec<String> },
    /// A streamed execution event destined for HTTP subscribers.
    SseEvent {
        session_id: String,
        event_name: String,
        #[serde(default)]
        payload: Value,
    },
    Heartbeat,
    #[serde(other)]
    Ignored,
}

/// RPC methods an execution instance may call.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "method")]
pub enum RpcCall {
    #[serde(rename = "memory.search")]
    MemorySearch {
        query: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<usize>,
    },
    #[serde(rename = "skill.load")]
    SkillLoad { skill_id: String },
    /// Method the gateway does not implement. Kept parseable so the
    /// caller gets a structured error instead of a dropped frame.
    #[serde(other)]
    Unsupported,
}

/// Fire-and-forget notification kinds.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notice {
    UsageReport {
        session_id: String,
        #[serde(default)]
        input_tokens: u64,
        #[serde(default)]
        output_tokens: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cost_usd: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
    },
    AuditLog {
        action: String,
        #[serde(default)]
        detail: Value,
    },
    /// Candidate reusable skill extracted from a completed run,
    /// persisted for later governance review.
    SkillEvolved {
        session_id: String,
        name: String,
        instructions: String,
        #[serde(default)]
        metadata: Value,
    },
    #[serde(other)]
    Ignored,
}

/// Messages sent by the gateway to an execution instance.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayMessage {
    /// One-time post-auth payload. Provider secrets are individually
    /// encrypted; the raw values never cross the channel.
    Init {
        user_id: String,
        org_id: String,
        credentials: BTreeMap<String, EncryptedSecret>,
        routing: RoutingConfig,
    },
    Response {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<RpcError>,
    },
    ResumeResponse { statuses: Vec<RequestStatus> },
    /// A run request handed to the instance for execution.
    Execute {
        session_id: String,
        message: Value,
    },
    #[serde(other)]
    Ignored,
}

/// Authenticated-cipher output for one provider secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct EncryptedSecret {
    pub ciphertext: String,
    pub iv: String,
    pub tag: String,
}

/// Non-secret routing configuration delivered alongside credentials.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct RoutingConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_model: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub provider_base_urls: BTreeMap<String, String>,
}

/// Structured error carried inside a `response` envelope. RPC
/// failures never close the connection.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct RpcError {
    pub code: String,
    pub message: String,
}

/// Fate of a previously issued request id, reported on `resume`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct RequestStatus {
    pub id: String,
    pub state: RequestState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Completed,
    Failed,
    Lost,
}

/// Ingestion classification for a streamed event name.
///
/// Durable events are persisted individually as they arrive; process
/// events are accumulated into the session's scratch trace; terminal
/// events flush the trace and end the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventClass {
    Durable,
    Process,
    Terminal,
}

pub fn classify_event(event_name: &str) -> EventClass {
    match event_name {
        "execution_complete" | "execution_error" => EventClass::Terminal,
        "file_created" | "final_response" => EventClass::Durable,
        _ => EventClass::Process,
    }
}
