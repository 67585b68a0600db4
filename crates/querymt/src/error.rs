use thiserror::Error;

/// Error types that can occur when interacting with LLM providers.
#[derive(Debug, Error)]
pub enum LLMError {
    /// HTTP request/response errors
    #[error("HTTP Error: {0}")]
    HttpError(String),
    /// Authentication and authorization errors
    #[error("Auth Error: {0}")]
    AuthError(String),
    /// Invalid request parameters or format
    #[error("Invalid Request: {0}")]
    InvalidRequest(String),
    /// Errors returned by the LLM provider
    #[error("Provider Error: {0}")]
    ProviderError(String),
    /// API response parsing or format error
    #[error("Response Format Error: {message}. Raw response: {raw_response}")]
    ResponseFormatError {
        message: String,
        raw_response: String,
    },
    /// JSON serialization/deserialization errors
    #[error("JSON Parse Error: {0}")]
    JsonError(String),
    /// Tool configuration error
    #[error("Tool Configuration Error: {0}")]
    ToolConfigError(String),
    /// Plugin error
    #[error("Plugin Error: {0}")]
    PluginError(String),
    /// Upstream signaled a rate limit (HTTP 429)
    #[error("Rate Limited: {message}")]
    RateLimited {
        message: String,
        retry_after_secs: Option<u64>,
    },
    /// A capability (streaming, embeddings, tool calling, ...) is not implemented
    /// by this adapter.
    #[error("Not Implemented: {0}")]
    NotImplemented(String),
    /// Local filesystem I/O error (cache files, config files).
    #[error("I/O Error: {0}")]
    IoError(String),
}

impl From<std::io::Error> for LLMError {
    fn from(err: std::io::Error) -> Self {
        LLMError::IoError(err.to_string())
    }
}

/// Converts reqwest HTTP errors into LlmErrors
#[cfg(feature = "reqwest-client")]
impl From<reqwest::Error> for LLMError {
    fn from(err: reqwest::Error) -> Self {
        LLMError::HttpError(err.to_string())
    }
}

impl From<http::Error> for LLMError {
    fn from(err: http::Error) -> Self {
        LLMError::HttpError(err.to_string())
    }
}

impl From<serde_json::Error> for LLMError {
    fn from(err: serde_json::Error) -> Self {
        LLMError::JsonError(format!(
            "{} at line {} column {}",
            err,
            err.line(),
            err.column()
        ))
    }
}

impl From<url::ParseError> for LLMError {
    fn from(err: url::ParseError) -> Self {
        LLMError::InvalidRequest(format!("Error parsing provided url: {}", err))
    }
}

impl From<std::string::FromUtf8Error> for LLMError {
    fn from(err: std::string::FromUtf8Error) -> Self {
        LLMError::ResponseFormatError {
            message: "response body was not valid UTF-8".to_string(),
            raw_response: err.to_string(),
        }
    }
}
