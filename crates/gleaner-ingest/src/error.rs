use gleaner_core::error::ErrorClass;
use gleaner_store::StoreError;

/// Classified chat-transport failure. The retry decision is a pure
/// function of the variant; the engine never inspects provider payloads.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    /// Transient: network, timeout, 5xx. Worth retrying with backoff.
    #[error("transient chat error ({class}): {message}")]
    Retryable { class: ErrorClass, message: String },

    /// Provider asked us to back off; `reset_at` is ISO-8601 when known.
    #[error("rate limited")]
    RateLimited { reset_at: Option<String> },

    /// Auth, permission, unknown channel, malformed config. Not retried.
    #[error("fatal chat error ({class}): {message}")]
    Fatal { class: ErrorClass, message: String },

    /// The channel's discussion group cannot be read; posts still can.
    #[error("comments unavailable for this channel")]
    CommentsUnavailable,
}

impl ChatError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Retryable { class, .. } | Self::Fatal { class, .. } => *class,
            Self::RateLimited { .. } => ErrorClass::RateLimited,
            Self::CommentsUnavailable => ErrorClass::UnknownChannel,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("unknown source: {0}")]
    UnknownSource(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Chat(#[from] ChatError),

    #[error(transparent)]
    Ident(#[from] gleaner_core::ident::IdentError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
