//! Offline chat transport backed by Telegram Desktop JSON exports.
//!
//! Looks for `<export_dir>/<channel_id>.json` in the shape produced by
//! tdesktop's "Export chat history" (`{"name": ..., "messages": [...]}`).
//! Channel exports carry no discussion comments, so `fetch_comments`
//! reports the comments-unavailable condition and the engine downgrades
//! the source to posts-only.

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::debug;

use gleaner_core::error::ErrorClass;
use gleaner_core::time::{parse_iso, to_iso};

use crate::client::{ChatClient, CommentObservation, PostObservation};
use crate::error::ChatError;

pub struct ExportChatClient {
    export_dir: PathBuf,
}

impl ExportChatClient {
    pub fn new(export_dir: impl Into<PathBuf>) -> Self {
        Self {
            export_dir: export_dir.into(),
        }
    }

    fn channel_file(&self, channel_id: &str) -> PathBuf {
        self.export_dir.join(format!("{channel_id}.json"))
    }

    fn load_messages(&self, channel_id: &str) -> Result<Vec<serde_json::Value>, ChatError> {
        let path = self.channel_file(channel_id);
        if !path.exists() {
            return Err(ChatError::Fatal {
                class: ErrorClass::UnknownChannel,
                message: format!("no export file for channel {channel_id}"),
            });
        }
        let text = std::fs::read_to_string(&path).map_err(|e| ChatError::Retryable {
            class: ErrorClass::Io,
            message: format!("reading {}: {e}", path.display()),
        })?;
        let root: serde_json::Value =
            serde_json::from_str(&text).map_err(|e| ChatError::Fatal {
                class: ErrorClass::Parse,
                message: format!("malformed export {}: {e}", path.display()),
            })?;
        let messages = root
            .get("messages")
            .and_then(|m| m.as_array())
            .ok_or_else(|| ChatError::Fatal {
                class: ErrorClass::Parse,
                message: format!("export {} has no messages array", path.display()),
            })?;
        Ok(messages.clone())
    }
}

#[async_trait]
impl ChatClient for ExportChatClient {
    async fn fetch_posts(
        &self,
        channel_id: &str,
        since_id: i64,
        until_id: Option<i64>,
        limit: u32,
    ) -> Result<Vec<PostObservation>, ChatError> {
        let messages = self.load_messages(channel_id)?;
        let mut posts: Vec<PostObservation> = messages
            .iter()
            .filter(|m| m.get("type").and_then(|t| t.as_str()) == Some("message"))
            .filter_map(observe_post)
            .filter(|p| p.message_id > since_id)
            .filter(|p| until_id.map(|u| p.message_id <= u).unwrap_or(true))
            .collect();
        posts.sort_by_key(|p| p.message_id);
        posts.truncate(limit as usize);
        debug!(
            channel_id,
            since_id,
            count = posts.len(),
            "served posts from export file"
        );
        Ok(posts)
    }

    async fn fetch_comments(
        &self,
        _channel_id: &str,
        _thread_id: i64,
        _since_id: i64,
        _limit: u32,
    ) -> Result<Vec<CommentObservation>, ChatError> {
        Err(ChatError::CommentsUnavailable)
    }
}

fn observe_post(msg: &serde_json::Value) -> Option<PostObservation> {
    let message_id = msg.get("id")?.as_i64()?;
    let date = normalize_date(msg.get("date")?.as_str()?)?;
    let text = flatten_text(msg.get("text")?);
    Some(PostObservation {
        message_id,
        date,
        text,
        thread_id: None,
        language: None,
        raw_payload: msg.clone(),
    })
}

/// tdesktop writes naive local timestamps (`2025-01-01T12:00:00`); treat
/// them as UTC and normalize to the Z form the pipeline stores.
fn normalize_date(raw: &str) -> Option<String> {
    if let Some(dt) = parse_iso(raw) {
        return Some(to_iso(dt));
    }
    let naive = chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S").ok()?;
    Some(to_iso(naive.and_utc()))
}

/// The export's `text` field is either a plain string or an array mixing
/// strings and `{"type": ..., "text": ...}` entity objects.
fn flatten_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(parts) => parts
            .iter()
            .map(|p| match p {
                serde_json::Value::String(s) => s.as_str(),
                other => other.get("text").and_then(|t| t.as_str()).unwrap_or(""),
            })
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn write_export(dir: &Path, channel: &str, body: &str) {
        std::fs::write(dir.join(format!("{channel}.json")), body).unwrap();
    }

    #[tokio::test]
    async fn serves_posts_in_id_order() {
        let dir = tempfile::tempdir().unwrap();
        write_export(
            dir.path(),
            "@demo",
            r#"{"name":"demo","messages":[
                {"id":2,"type":"message","date":"2025-01-02T00:00:00","text":"two"},
                {"id":1,"type":"message","date":"2025-01-01T00:00:00","text":"one"},
                {"id":3,"type":"service","date":"2025-01-03T00:00:00","text":"joined"}
            ]}"#,
        );
        let client = ExportChatClient::new(dir.path());
        let posts = client.fetch_posts("@demo", 0, None, 10).await.unwrap();
        assert_eq!(posts.len(), 2);
        assert_eq!(posts[0].message_id, 1);
        assert_eq!(posts[0].date, "2025-01-01T00:00:00Z");
        assert_eq!(posts[1].text, "two");
    }

    #[tokio::test]
    async fn since_id_and_limit_bound_the_batch() {
        let dir = tempfile::tempdir().unwrap();
        write_export(
            dir.path(),
            "@demo",
            r#"{"messages":[
                {"id":1,"type":"message","date":"2025-01-01T00:00:00","text":"a"},
                {"id":2,"type":"message","date":"2025-01-01T00:00:01","text":"b"},
                {"id":3,"type":"message","date":"2025-01-01T00:00:02","text":"c"}
            ]}"#,
        );
        let client = ExportChatClient::new(dir.path());
        let posts = client.fetch_posts("@demo", 1, None, 1).await.unwrap();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].message_id, 2);
    }

    #[tokio::test]
    async fn entity_text_arrays_are_flattened() {
        let dir = tempfile::tempdir().unwrap();
        write_export(
            dir.path(),
            "@demo",
            r#"{"messages":[
                {"id":1,"type":"message","date":"2025-01-01T00:00:00",
                 "text":["see ",{"type":"link","text":"https://example.com"}," now"]}
            ]}"#,
        );
        let client = ExportChatClient::new(dir.path());
        let posts = client.fetch_posts("@demo", 0, None, 10).await.unwrap();
        assert_eq!(posts[0].text, "see https://example.com now");
    }

    #[tokio::test]
    async fn missing_file_is_unknown_channel() {
        let dir = tempfile::tempdir().unwrap();
        let client = ExportChatClient::new(dir.path());
        let err = client.fetch_posts("@nope", 0, None, 10).await.unwrap_err();
        assert!(matches!(err, ChatError::Fatal { class: ErrorClass::UnknownChannel, .. }));
    }

    #[tokio::test]
    async fn comments_are_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let client = ExportChatClient::new(dir.path());
        let err = client.fetch_comments("@demo", 1, 0, 10).await.unwrap_err();
        assert!(matches!(err, ChatError::CommentsUnavailable));
    }
}
