use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    InvalidRequest,
    Conflict,
    DuplicateRequest,
    TokenInvalid,
    TicketInvalid,
    InstanceNotFound,
    InstanceFailed,
    InstanceUnavailable,
    SessionNotFound,
    StoreUnavailable,
    CryptoFailure,
    StreamError,
    Timeout,
}

impl ErrorType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "urn:exec-gateway:error:invalid_request",
            Self::Conflict => "urn:exec-gateway:error:conflict",
            Self::DuplicateRequest => "urn:exec-gateway:error:duplicate_request",
            Self::TokenInvalid => "urn:exec-gateway:error:token_invalid",
            Self::TicketInvalid => "urn:exec-gateway:error:ticket_invalid",
            Self::InstanceNotFound => "urn:exec-gateway:error:instance_not_found",
            Self::InstanceFailed => "urn:exec-gateway:error:instance_failed",
            Self::InstanceUnavailable => "urn:exec-gateway:error:instance_unavailable",
            Self::SessionNotFound => "urn:exec-gateway:error:session_not_found",
            Self::StoreUnavailable => "urn:exec-gateway:error:store_unavailable",
            Self::CryptoFailure => "urn:exec-gateway:error:crypto_failure",
            Self::StreamError => "urn:exec-gateway:error:stream_error",
            Self::Timeout => "urn:exec-gateway:error:timeout",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "Invalid Request",
            Self::Conflict => "Conflict",
            Self::DuplicateRequest => "Duplicate Request",
            Self::TokenInvalid => "Token Invalid",
            Self::TicketInvalid => "Ticket Invalid",
            Self::InstanceNotFound => "Instance Not Found",
            Self::InstanceFailed => "Instance Failed",
            Self::InstanceUnavailable => "Instance Unavailable",
            Self::SessionNotFound => "Session Not Found",
            Self::StoreUnavailable => "Store Unavailable",
            Self::CryptoFailure => "Crypto Failure",
            Self::StreamError => "Stream Error",
            Self::Timeout => "Timeout",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest => 400,
            Self::Conflict => 409,
            Self::DuplicateRequest => 409,
            Self::TokenInvalid => 401,
            Self::TicketInvalid => 401,
            Self::InstanceNotFound => 404,
            Self::InstanceFailed => 503,
            Self::InstanceUnavailable => 503,
            Self::SessionNotFound => 404,
            Self::StoreUnavailable => 503,
            Self::CryptoFailure => 500,
            Self::StreamError => 502,
            Self::Timeout => 504,
        }
    }
}

/// RFC 7807 problem document returned by every failing HTTP endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl ProblemDetails {
    pub fn new(error_type: ErrorType, detail: Option<String>) -> Self {
        Self {
            type_: error_type.as_urn().to_string(),
            title: error_type.title().to_string(),
            status: error_type.status_code(),
            detail,
            instance: None,
            extensions: Map::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("conflict: {message}")]
    Conflict { message: String },
    #[error("duplicate in-flight request: {key}")]
    DuplicateRequest { key: String },
    #[error("token invalid")]
    TokenInvalid { message: Option<String> },
    #[error("connect ticket invalid")]
    TicketInvalid { message: Option<String> },
    #[error("no execution instance for user {user_id}")]
    InstanceNotFound { user_id: String },
    #[error("execution instance failed: {instance_id}")]
    InstanceFailed {
        instance_id: String,
        last_error: Option<String>,
    },
    #[error("execution instance not connected for user {user_id}")]
    InstanceUnavailable {
        user_id: String,
        retry_after_ms: Option<u64>,
    },
    #[error("session not found: {session_id}")]
    SessionNotFound { session_id: String },
    #[error("shared store unavailable: {message}")]
    StoreUnavailable { message: String },
    #[error("credential encryption failed: {message}")]
    CryptoFailure { message: String },
    #[error("stream error: {message}")]
    StreamError { message: String },
    #[error("timeout")]
    Timeout { message: Option<String> },
}

impl GatewayError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::InvalidRequest { .. } => ErrorType::InvalidRequest,
            Self::Conflict { .. } => ErrorType::Conflict,
            Self::DuplicateRequest { .. } => ErrorType::DuplicateRequest,
            Self::TokenInvalid { .. } => ErrorType::TokenInvalid,
            Self::TicketInvalid { .. } => ErrorType::TicketInvalid,
            Self::InstanceNotFound { .. } => ErrorType::InstanceNotFound,
            Self::InstanceFailed { .. } => ErrorType::InstanceFailed,
            Self::InstanceUnavailable { .. } => ErrorType::InstanceUnavailable,
            Self::SessionNotFound { .. } => ErrorType::SessionNotFound,
            Self::StoreUnavailable { .. } => ErrorType::StoreUnavailable,
            Self::CryptoFailure { .. } => ErrorType::CryptoFailure,
            Self::StreamError { .. } => ErrorType::StreamError,
            Self::Timeout { .. } => ErrorType::Timeout,
        }
    }

    pub fn to_problem_details(&self) -> ProblemDetails {
        let mut problem = ProblemDetails::new(self.error_type(), Some(self.to_string()));
        let mut extensions = Map::new();

        match self {
            Self::DuplicateRequest { key } => {
                extensions.insert("idempotencyKey".to_string(), Value::String(key.clone()));
            }
            Self::InstanceNotFound { user_id } => {
                extensions.insert("userId".to_string(), Value::String(user_id.clone()));
            }
            Self::InstanceFailed {
                instance_id,
                last_error,
            } => {
                extensions.insert("instanceId".to_string(), Value::String(instance_id.clone()));
                if let Some(last_error) = last_error {
                    extensions.insert("lastError".to_string(), Value::String(last_error.clone()));
                }
            }
            Self::InstanceUnavailable {
                user_id,
                retry_after_ms,
            } => {
                extensions.insert("userId".to_string(), Value::String(user_id.clone()));
                if let Some(retry_after_ms) = retry_after_ms {
                    extensions.insert(
                        "retryAfterMs".to_string(),
                        Value::Number(serde_json::Number::from(*retry_after_ms)),
                    );
                }
            }
            Self::SessionNotFound { session_id } => {
                extensions.insert("sessionId".to_string(), Value::String(session_id.clone()));
            }
            _ => {}
        }

        problem.extensions = extensions;
        problem
    }
}

impl From<GatewayError> for ProblemDetails {
    fn from(value: GatewayError) -> Self {
        value.to_problem_details()
    }
}

impl From<&GatewayError> for ProblemDetails {
    fn from(value: &GatewayError) -> Self {
        value.to_problem_details()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn problem_details_carry_extensions() {
        let err = GatewayError::InstanceUnavailable {
            user_id: "u1".to_string(),
            retry_after_ms: Some(1500),
        };
        let problem = err.to_problem_details();
        assert_eq!(problem.status, 503);
        assert_eq!(problem.type_, "urn:exec-gateway:error:instance_unavailable");
        assert_eq!(problem.extensions["userId"], Value::String("u1".into()));
        assert_eq!(problem.extensions["retryAfterMs"], Value::from(1500u64));
    }

    #[test]
    fn duplicate_request_maps_to_409() {
        let err = GatewayError::DuplicateRequest {
            key: "req-1".to_string(),
        };
        assert_eq!(err.error_type().status_code(), 409);
    }
}
