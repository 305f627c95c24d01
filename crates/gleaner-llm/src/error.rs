use gleaner_core::error::ErrorClass;

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("provider unavailable: {0}")]
    Unavailable(String),
}

impl LlmError {
    /// Whether the processing retry loop may try again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(_) | Self::RateLimited { .. } | Self::Parse(_) | Self::Unavailable(_) => {
                true
            }
            Self::Api { status, .. } => *status >= 500 || *status == 408,
        }
    }

    /// Stable class string for the failure tables.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Http(e) if e.is_timeout() => ErrorClass::Timeout,
            Self::Http(_) => ErrorClass::Network,
            Self::RateLimited { .. } => ErrorClass::RateLimited,
            Self::Parse(_) => ErrorClass::Parse,
            Self::Unavailable(_) => ErrorClass::Network,
            Self::Api { status, .. } => match status {
                401 | 403 => ErrorClass::Auth,
                402 | 429 => ErrorClass::Quota,
                _ => ErrorClass::Http,
            },
        }
    }
}
