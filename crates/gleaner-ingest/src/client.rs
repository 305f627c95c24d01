use async_trait::async_trait;

use crate::error::ChatError;

/// One channel post as observed at the transport.
#[derive(Debug, Clone)]
pub struct PostObservation {
    pub message_id: i64,
    /// ISO-8601 UTC with Z suffix.
    pub date: String,
    pub text: String,
    /// Discussion thread id when the post opens one.
    pub thread_id: Option<i64>,
    pub language: Option<String>,
    /// Opaque provider payload; persisted verbatim (capped).
    pub raw_payload: serde_json::Value,
}

/// One discussion comment as observed at the transport.
#[derive(Debug, Clone)]
pub struct CommentObservation {
    pub message_id: i64,
    pub date: String,
    pub text: String,
    pub thread_id: i64,
    pub parent_message_id: Option<i64>,
    pub language: Option<String>,
    pub raw_payload: serde_json::Value,
}

/// Narrow chat-transport capability the ingestion engine consumes.
/// Implementations classify their failures into [`ChatError`] variants;
/// the engine never sees provider-specific shapes.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Posts with `message_id > since_id`, ascending, at most `limit`.
    /// `until_id`, when set, bounds the id range from above.
    async fn fetch_posts(
        &self,
        channel_id: &str,
        since_id: i64,
        until_id: Option<i64>,
        limit: u32,
    ) -> Result<Vec<PostObservation>, ChatError>;

    /// Comments of one thread with `message_id > since_id`, ascending.
    async fn fetch_comments(
        &self,
        channel_id: &str,
        thread_id: i64,
        since_id: i64,
        limit: u32,
    ) -> Result<Vec<CommentObservation>, ChatError>;
}
