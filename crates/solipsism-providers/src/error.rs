//! Provider error type.
//!
//! Errors never escape [`LlmProvider::generate`](crate::LlmProvider::generate):
//! they drive the retry decision and end up rendered into `<error>` text.

/// Everything that can go wrong while talking to a model endpoint.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("API returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("HTTP request failed: {0}")]
    Request(String),

    #[error("invalid response body: {0}")]
    Decode(String),

    #[error("failed to attach {path}: {reason}")]
    Attachment { path: String, reason: String },

    #[error(
        "no configured provider found for model '{0}'; set the matching API key (e.g. GEMINI_API_KEY, OPENROUTER_API_KEY)"
    )]
    NotConfigured(String),
}

impl ProviderError {
    /// Transient failures worth another attempt: timeouts, connection
    /// errors, rate limiting, and server-side errors.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Timeout | ProviderError::Connect(_) => true,
            ProviderError::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProviderError::Timeout
        } else if e.is_connect() {
            ProviderError::Connect(e.to_string())
        } else if e.is_decode() {
            ProviderError::Decode(e.to_string())
        } else {
            ProviderError::Request(e.to_string())
        }
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, ProviderError>;
