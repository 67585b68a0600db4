//! The gateway's boundary error type (spec §7): one variant per error kind,
//! with dialect-specific wire rendering and HTTP status mapping, following
//! [`crate::session::store::SessionStoreError`]'s `thiserror` idiom rather
//! than [`crate::error::LLMError`]'s older hand-rolled `Display` style.

use http::StatusCode;
use serde_json::{json, Value};
use thiserror::Error;

use crate::dialect::Dialect;
use crate::error::LLMError;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unauthenticated")]
    Unauthenticated,

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("rate limited")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("quota exceeded")]
    QuotaExceeded,

    #[error("queue timeout")]
    QueueTimeout,

    #[error("context too large: {est_tokens} tokens exceeds max {max_tokens}")]
    ContextTooLarge { est_tokens: u32, max_tokens: u32 },

    #[error("upstream error ({status}): {body_preview}")]
    Upstream { status: u16, body_preview: String },

    #[error("infinite tool-call loop detected for tool `{tool_name}`")]
    InfiniteLoop { tool_name: String },

    #[error("request cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Provider(#[from] LLMError),
}

impl GatewayError {
    pub fn http_status(&self) -> StatusCode {
        match self {
            GatewayError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            GatewayError::Unauthenticated => StatusCode::UNAUTHORIZED,
            GatewayError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::Unsupported(_) => StatusCode::BAD_REQUEST,
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::QuotaExceeded => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::QueueTimeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::ContextTooLarge { .. } => StatusCode::BAD_REQUEST,
            GatewayError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::InfiniteLoop { .. } => StatusCode::BAD_REQUEST,
            GatewayError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Provider(_) => StatusCode::BAD_GATEWAY,
        }
    }

    fn type_tag(&self) -> &'static str {
        match self {
            GatewayError::InvalidArgument(_) => "invalid_request_error",
            GatewayError::Unauthenticated => "authentication_error",
            GatewayError::PermissionDenied(_) => "permission_error",
            GatewayError::NotFound(_) => "not_found_error",
            GatewayError::Unsupported(_) => "invalid_request_error",
            GatewayError::RateLimited { .. } => "rate_limit_error",
            GatewayError::QuotaExceeded => "rate_limit_error",
            GatewayError::QueueTimeout => "timeout_error",
            GatewayError::ContextTooLarge { .. } => "invalid_request_error",
            GatewayError::Upstream { .. } => "api_error",
            GatewayError::InfiniteLoop { .. } => "invalid_request_error",
            GatewayError::Cancelled => "overloaded_error",
            GatewayError::Internal(_) => "api_error",
            GatewayError::Provider(_) => "api_error",
        }
    }

    /// The dialect-specific error wire body (spec §6): Anthropic-style
    /// `{error:{type,message}}` or OpenAI-style `{error:{message,type,code}}`.
    pub fn wire_body(&self, dialect: Dialect) -> Value {
        let message = self.to_string();
        match dialect {
            Dialect::Anthropic => json!({ "type": "error", "error": { "type": self.type_tag(), "message": message } }),
            Dialect::OpenAiChat | Dialect::Responses => json!({
                "error": { "message": message, "type": self.type_tag(), "code": self.http_status().as_u16() }
            }),
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::InvalidArgument(err.to_string())
    }
}

impl From<http::Error> for GatewayError {
    fn from(err: http::Error) -> Self {
        GatewayError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anthropic_wire_body_uses_type_message_shape() {
        let err = GatewayError::InfiniteLoop { tool_name: "shell".into() };
        let body = err.wire_body(Dialect::Anthropic);
        assert_eq!(body["type"], "error");
        assert!(body["error"]["message"].as_str().unwrap().contains("shell"));
    }

    #[test]
    fn openai_wire_body_carries_code() {
        let err = GatewayError::QueueTimeout;
        let body = err.wire_body(Dialect::OpenAiChat);
        assert_eq!(body["error"]["code"], 504);
    }

    #[test]
    fn status_codes_match_spec_table() {
        assert_eq!(GatewayError::InvalidArgument("x".into()).http_status(), StatusCode::BAD_REQUEST);
        assert_eq!(GatewayError::Unauthenticated.http_status(), StatusCode::UNAUTHORIZED);
        assert_eq!(GatewayError::QuotaExceeded.http_status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            GatewayError::Upstream { status: 500, body_preview: "x".into() }.http_status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(GatewayError::QueueTimeout.http_status(), StatusCode::GATEWAY_TIMEOUT);
    }
}
