use gleaner_llm::LlmError;
use gleaner_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum TopicsError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    /// The topicization response was not in the expected shape.
    #[error("malformed topicization response: {0}")]
    Response(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("export I/O error: {0}")]
    Io(#[from] std::io::Error),
}
