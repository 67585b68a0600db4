//! The factory contract every HTTP-backed adapter registers under the Adapter
//! Router, plus the shared status-code-to-[`LLMError`] mapping used by all of
//! them when talking to an upstream provider.

use crate::{error::LLMError, HTTPLLMProvider};
use http::{HeaderMap, Request, Response};
use serde_json::Value;

/// Extracts a retry-after duration (seconds) from a 429 response's headers,
/// preferring the standard `Retry-After` header and falling back to OpenAI's
/// `x-ratelimit-reset-requests` duration format (e.g. `"6m0s"`, `"1s"`).
pub fn parse_retry_after(headers: &HeaderMap) -> Option<u64> {
    headers
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
        .or_else(|| {
            headers
                .get("x-ratelimit-reset-requests")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| {
                    if s.ends_with('s') {
                        let num_part = s.trim_end_matches('s');
                        if let Some(m_pos) = num_part.find('m') {
                            num_part[..m_pos].parse::<u64>().ok().map(|m| m * 60)
                        } else {
                            num_part.parse::<u64>().ok()
                        }
                    } else {
                        None
                    }
                })
        })
}

/// Builds an [`HTTPLLMProvider`] for a named upstream from a config `Value`.
///
/// Each upstream adapter (OpenAI, Anthropic, the self-hosted local engine, the
/// pass-through loopback) registers one of these with the Adapter Router so
/// that a request's resolved model name can be turned into a live provider
/// without the router needing to know the adapter's wire format.
pub trait HTTPLLMProviderFactory: Send + Sync {
    fn name(&self) -> &str;

    fn api_key_name(&self) -> Option<String> {
        None
    }

    /// Schema for the adapter's config.
    fn config_schema(&self) -> Value;

    /// Build the HTTP request that lists models.
    fn list_models_request(&self, cfg: &Value) -> Result<Request<Vec<u8>>, LLMError>;

    /// Turn the raw HTTP response into a `Vec<String>`.
    fn parse_list_models(&self, resp: Response<Vec<u8>>) -> Result<Vec<String>, LLMError>;

    /// Given a chosen model name, build an `HTTPLLMProvider`.
    #[allow(clippy::wrong_self_convention)]
    fn from_config(&self, cfg: &Value) -> Result<Box<dyn HTTPLLMProvider>, LLMError>;
}

/// Maps a non-2xx `http::Response` into the matching [`LLMError`] variant and
/// returns early from the enclosing function. A no-op when the response is
/// successful.
#[macro_export]
macro_rules! handle_http_error {
    ($resp:expr) => {{
        if !$resp.status().is_success() {
            let status = $resp.status();
            let status_code = status.as_u16();

            let retry_after_secs = if status_code == 429 {
                $crate::factory::parse_retry_after($resp.headers())
            } else {
                None
            };

            let error_text: String = String::from_utf8($resp.into_body())?;

            let clean_message =
                if let Ok(json) = serde_json::from_str::<serde_json::Value>(&error_text) {
                    json.pointer("/error/message")
                        .and_then(|v| v.as_str())
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| format!("API returned error status: {}", status))
                } else {
                    format!("API returned error status: {}", status)
                };

            return Err(match status_code {
                401 | 403 => LLMError::AuthError(clean_message),
                429 => LLMError::RateLimited {
                    message: clean_message,
                    retry_after_secs,
                },
                400 => LLMError::InvalidRequest(clean_message),
                500 | 529 => LLMError::ProviderError(format!("Server error: {}", clean_message)),
                _ => LLMError::ProviderError(clean_message),
            });
        }
    }};
}
