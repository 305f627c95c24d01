use gleaner_core::error::ErrorClass;
use gleaner_llm::LlmError;
use gleaner_store::StoreError;

/// Batch-level failure. Per-message failures never become one of these;
/// they land in the `processing_failures` table instead.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// One failed processing attempt for one message.
#[derive(Debug, thiserror::Error)]
pub enum AttemptError {
    #[error(transparent)]
    Llm(#[from] LlmError),

    /// The response was not a JSON object.
    #[error("response parse failed: {0}")]
    Parse(String),

    /// The response was JSON but missed a required field.
    #[error("response validation failed: {0}")]
    Validation(String),
}

impl AttemptError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Llm(e) => e.is_retryable(),
            // A fresh generation can come back well-formed.
            Self::Parse(_) | Self::Validation(_) => true,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Llm(e) => e.class(),
            Self::Parse(_) => ErrorClass::Parse,
            Self::Validation(_) => ErrorClass::Validation,
        }
    }
}
