use thiserror::Error;

/// Error kinds the dispatch core distinguishes.
///
/// `ProviderUnavailable` and `KeyTimeout` are consumed by the chain loop and
/// never reach the client directly; `BadRequest` is recoverable by the agent
/// drivers before it surfaces as a 400.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Requested model alias is not configured
    #[error("model alias '{0}' not found")]
    AliasNotFound(String),

    /// A provider's key pool is exhausted, or the provider fail-fasted (429/5xx)
    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// Provider rejected the payload (HTTP 400, malformed tool call, ...)
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Waiting for a pooled key exceeded the acquire deadline
    #[error("timed out waiting for a key from '{0}'")]
    KeyTimeout(String),

    /// A native or remote tool failed
    #[error("tool error: {0}")]
    ToolError(String),

    /// A provider chunk or payload could not be decoded
    #[error("parse error: {0}")]
    ParseError(String),

    /// The session is already owned by another worker
    #[error("session lease lost: {0}")]
    LeaseLost(String),

    /// Provider replied with a non-success status other than 400
    #[error("provider returned HTTP {status}: {message}")]
    Status { status: u16, message: String },

    /// Transport-level HTTP failure
    #[error("HTTP error: {0}")]
    Http(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid or missing configuration
    #[error("configuration error: {0}")]
    Config(String),
}

impl GatewayError {
    /// Maps a non-success provider status to the right error kind.
    ///
    /// 400 becomes [`GatewayError::BadRequest`] so the agent drivers can
    /// attempt recovery; everything else keeps its status for the key
    /// lifecycle decision in the engine.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        if status == 400 {
            GatewayError::BadRequest(message)
        } else {
            GatewayError::Status { status, message }
        }
    }

    /// True for errors the streaming peek is allowed to swallow before the
    /// first byte has been committed to the client.
    pub fn is_silenceable(&self) -> bool {
        matches!(
            self,
            GatewayError::ProviderUnavailable(_) | GatewayError::KeyTimeout(_)
        )
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        GatewayError::Http(err.to_string())
    }
}

impl From<url::ParseError> for GatewayError {
    fn from(err: url::ParseError) -> Self {
        GatewayError::BadRequest(format!("error parsing provided url: {}", err))
    }
}
