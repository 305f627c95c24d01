use serde::{Deserialize, Serialize};

/// Kind of Telegram message a snapshot was taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Post,
    Comment,
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Post => write!(f, "post"),
            Self::Comment => write!(f, "comment"),
        }
    }
}

impl std::str::FromStr for MessageType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "post" => Ok(Self::Post),
            "comment" => Ok(Self::Comment),
            other => Err(format!("unknown message type: {other}")),
        }
    }
}

/// Lifecycle status of a registered source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceStatus {
    Active,
    Paused,
    Error,
}

impl std::fmt::Display for SourceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Paused => write!(f, "paused"),
            Self::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for SourceStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown source status: {other}")),
        }
    }
}

/// Immutable snapshot of one message at ingestion time.
///
/// `text` and `date` never change once inserted; later observations that
/// disagree land in the conflict journal instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawMessage {
    pub source_ref: String,
    pub message_id: i64,
    pub message_type: MessageType,
    pub channel_id: String,
    /// ISO-8601 UTC with Z suffix.
    pub date: String,
    pub text: String,
    pub thread_id: Option<i64>,
    pub parent_message_id: Option<i64>,
    pub language: Option<String>,
    /// Opaque provider payload as JSON text, capped at `MAX_PAYLOAD_BYTES`.
    pub raw_payload: String,
    pub payload_truncated: bool,
    /// Original payload length in bytes (pre-truncation).
    pub payload_size: i64,
    pub inserted_at: String,
}

/// Hard cap on the stored provider payload.
pub const MAX_PAYLOAD_BYTES: usize = 64 * 1024;

/// Per-source ingestion state. Created on registration, mutated by the
/// ingestion engine, paused rather than deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceState {
    pub source_id: String,
    pub channel_id: String,
    pub channel_username: Option<String>,
    pub status: SourceStatus,
    pub include_comments: bool,
    pub history_from: Option<String>,
    pub history_to: Option<String>,
    pub batch_size: Option<u32>,
    pub poll_interval_secs: Option<u64>,
    /// Post high-watermark; monotonic non-decreasing.
    pub last_post_id: i64,
    pub backfill_completed_at: Option<String>,
    pub last_attempt_at: Option<String>,
    pub last_success_at: Option<String>,
    pub fail_count: u32,
    pub last_error: Option<String>,
    pub rate_limit_until: Option<String>,
    pub comments_unavailable: bool,
    pub created_at: String,
    pub updated_at: String,
}

/// Comment high-watermark for one discussion thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommentCursor {
    pub source_id: String,
    pub thread_id: i64,
    pub last_comment_id: i64,
    pub updated_at: String,
}

/// Append-only record of one ingestion attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceAttempt {
    pub id: i64,
    pub source_id: String,
    pub success: bool,
    pub error_class: Option<String>,
    pub error_message: Option<String>,
    pub detail: Option<serde_json::Value>,
    pub attempted_at: String,
}

/// Why a repeated raw observation was journaled instead of stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictReason {
    ContentMismatch,
    DuplicateSeen,
    PayloadTruncated,
}

impl std::fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ContentMismatch => write!(f, "content_mismatch"),
            Self::DuplicateSeen => write!(f, "duplicate_seen"),
            Self::PayloadTruncated => write!(f, "payload_truncated"),
        }
    }
}

impl std::str::FromStr for ConflictReason {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "content_mismatch" => Ok(Self::ContentMismatch),
            "duplicate_seen" => Ok(Self::DuplicateSeen),
            "payload_truncated" => Ok(Self::PayloadTruncated),
            other => Err(format!("unknown conflict reason: {other}")),
        }
    }
}

/// Journal row for a raw observation that could not be applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawConflict {
    pub source_ref: String,
    pub reason: ConflictReason,
    pub new_text: Option<String>,
    pub new_date: Option<String>,
    pub observed_at: String,
}

/// Named entity extracted from a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityMention {
    #[serde(rename = "type")]
    pub entity_type: String,
    pub value: String,
    /// Clamped to [0, 1] during validation.
    pub confidence: f64,
}

/// Provenance stamped into every processed document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub pipeline_version: String,
    pub model_id: String,
    pub prompt_id: String,
    pub prompt_name: String,
    pub parameters: serde_json::Value,
}

/// Structured document produced from one raw message by the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedDocument {
    /// Always `doc:<source_ref>`.
    pub id: String,
    pub source_ref: String,
    pub source_message_id: i64,
    pub channel_id: String,
    pub processed_at: String,
    pub text_clean: String,
    pub summary: Option<String>,
    pub topics: Vec<String>,
    pub entities: Vec<EntityMention>,
    pub language: Option<String>,
    pub metadata: DocumentMetadata,
}

/// Bookkeeping row for a message whose processing exhausted its retries.
/// Mutually exclusive with a processed row for the same `source_ref`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingFailure {
    pub source_ref: String,
    pub channel_id: String,
    pub attempts: u32,
    pub last_attempt_at: String,
    pub error_class: String,
    pub error_message: String,
    pub error_details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopicType {
    Singleton,
    Cluster,
}

impl std::fmt::Display for TopicType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Singleton => write!(f, "singleton"),
            Self::Cluster => write!(f, "cluster"),
        }
    }
}

impl std::str::FromStr for TopicType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "singleton" => Ok(Self::Singleton),
            "cluster" => Ok(Self::Cluster),
            other => Err(format!("unknown topic type: {other}")),
        }
    }
}

/// A message selected as a primary representative of a topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicAnchor {
    pub channel_id: String,
    pub message_id: i64,
    pub message_type: MessageType,
    pub anchor_ref: String,
    pub score: f64,
}

/// Topic card: identity, scope and anchors of one topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicCard {
    /// Always `topic:<anchors[0].anchor_ref>`.
    pub id: String,
    pub title: String,
    pub summary: String,
    pub scope_in: Vec<String>,
    pub scope_out: Vec<String>,
    #[serde(rename = "type")]
    pub topic_type: TopicType,
    /// Deduplicated by `anchor_ref`, sorted by `(-score, anchor_ref)`.
    pub anchors: Vec<TopicAnchor>,
    pub sources: Vec<String>,
    pub updated_at: String,
    pub tags: Vec<String>,
    pub related_topics: Vec<String>,
    pub status: String,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemRole {
    Anchor,
    Supporting,
}

impl ItemRole {
    /// Anchors sort ahead of supporting items.
    pub fn rank(self) -> u8 {
        match self {
            Self::Anchor => 0,
            Self::Supporting => 1,
        }
    }
}

impl std::fmt::Display for ItemRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Anchor => write!(f, "anchor"),
            Self::Supporting => write!(f, "supporting"),
        }
    }
}

impl std::str::FromStr for ItemRole {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "anchor" => Ok(Self::Anchor),
            "supporting" => Ok(Self::Supporting),
            other => Err(format!("unknown item role: {other}")),
        }
    }
}

/// One member of a topic bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleItem {
    pub channel_id: String,
    pub message_id: i64,
    pub message_type: MessageType,
    pub source_ref: String,
    pub role: ItemRole,
    pub score: f64,
    pub justification: Option<String>,
}

/// Membership snapshot for one topic. `time_from`/`time_to` both null marks
/// the single "current" bundle; ranged snapshots are reserved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicBundle {
    pub topic_id: String,
    pub updated_at: String,
    pub time_from: Option<String>,
    pub time_to: Option<String>,
    /// Unique by `source_ref`; anchors precede supporting items.
    pub items: Vec<BundleItem>,
    pub channels: Vec<String>,
    pub metadata: serde_json::Value,
}

/// Origin descriptor of a knowledge-base entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KbSource {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic_id: Option<String>,
}

/// Export-only knowledge-base entry; never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KbEntry {
    pub id: String,
    pub source: KbSource,
    pub created_at: String,
    pub title: String,
    pub content: String,
    pub topics: Vec<String>,
    pub tags: Vec<String>,
    pub metadata: serde_json::Value,
}
