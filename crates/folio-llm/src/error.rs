#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parse failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("rate limited")]
    RateLimited,

    #[error("provider unavailable")]
    Unavailable,

    #[error("{provider} returned status {status}")]
    Status { provider: String, status: u16 },

    #[error("empty response from {provider}")]
    EmptyResponse { provider: String },

    #[error("embedding not supported by {provider}")]
    EmbedUnsupported { provider: String },

    #[error("{0}")]
    Other(String),
}

impl LlmError {
    /// Whether a failed call is worth repeating with the same input.
    ///
    /// Transport failures, rate limits and 5xx responses are transient. Malformed payloads,
    /// 4xx responses and capability errors are not.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(e) => !e.is_builder() && !e.is_decode(),
            Self::RateLimited | Self::Unavailable | Self::EmptyResponse { .. } => true,
            Self::Status { status, .. } => *status >= 500,
            Self::Json(_) | Self::EmbedUnsupported { .. } | Self::Other(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, LlmError>;
