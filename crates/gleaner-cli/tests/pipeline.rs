//! Full-pipeline test: export file → ingest → process → topicize → export,
//! with a scripted LLM standing in for the provider.

use std::sync::Arc;

use async_trait::async_trait;

use gleaner_ingest::{ExportChatClient, IngestOptions, IngestionEngine, RawSink};
use gleaner_llm::prompts::{MESSAGE_EXTRACT, TOPIC_DISCOVERY, TOPIC_SUPPORT};
use gleaner_llm::{GenerationParams, LlmClient, LlmError};
use gleaner_store::ingest_state::NewSource;
use gleaner_store::{IngestionStateStore, ProcessingStore, RawStore};
use gleaner_topics::{Exporter, TopicizeEngine, TopicizeOptions};
use gleaner_process::{ProcessOptions, ProcessingEngine};

/// Extraction echoes the message text back as `text_clean`; discovery
/// proposes one singleton on post 1; support attaches post 2.
struct ScriptedLlm;

#[async_trait]
impl LlmClient for ScriptedLlm {
    fn model_id(&self) -> &str {
        "scripted-model"
    }

    async fn generate(
        &self,
        system: &str,
        user: &str,
        _params: &GenerationParams,
    ) -> Result<String, LlmError> {
        if system == MESSAGE_EXTRACT.system {
            let text = user.split("\n\n").last().unwrap_or_default();
            return Ok(serde_json::json!({
                "text_clean": text,
                "summary": "a summary",
                "topics": ["updates"],
                "language": "en",
            })
            .to_string());
        }
        if system == TOPIC_DISCOVERY.system {
            return Ok(r#"{"topics":[{
                "title":"Long updates",
                "summary":"Posts with substance",
                "scope_in":["long posts"],
                "scope_out":["chatter"],
                "type":"singleton",
                "anchors":[{"anchor_ref":"tg:@demo:post:1","score":0.9}]
            }]}"#
                .to_string());
        }
        if system == TOPIC_SUPPORT.system {
            return Ok(r#"{"items":[
                {"source_ref":"tg:@demo:post:2","score":0.7,"justification":"follow-up"}
            ]}"#
                .to_string());
        }
        Err(LlmError::Api {
            status: 400,
            message: "unexpected prompt".to_string(),
        })
    }
}

fn export_json(long_text: &str) -> String {
    serde_json::json!({
        "name": "demo",
        "messages": [
            {"id": 1, "type": "message", "date": "2025-01-01T09:00:00", "text": long_text},
            {"id": 2, "type": "message", "date": "2025-01-02T09:00:00", "text": "short follow-up"},
            {"id": 3, "type": "service", "date": "2025-01-02T10:00:00", "text": "pinned"}
        ]
    })
    .to_string()
}

#[tokio::test]
async fn pipeline_end_to_end() {
    let export_dir = tempfile::tempdir().unwrap();
    let long_text = "substance ".repeat(40);
    std::fs::write(
        export_dir.path().join("@demo.json"),
        export_json(long_text.trim_end()),
    )
    .unwrap();

    let state = Arc::new(IngestionStateStore::open_in_memory().unwrap());
    let raw = Arc::new(RawStore::open_in_memory().unwrap());
    let processing = Arc::new(ProcessingStore::open_in_memory().unwrap());

    state
        .register_source(&NewSource {
            source_id: "@demo".to_string(),
            channel_id: "@demo".to_string(),
            channel_username: Some("demo".to_string()),
            include_comments: true,
            history_from: None,
            history_to: None,
            batch_size: None,
            poll_interval_secs: None,
        })
        .unwrap();

    // Ingest from the export file.
    let sink: Arc<dyn RawSink> = raw.clone();
    let chat = Arc::new(ExportChatClient::new(export_dir.path()));
    let ingest = IngestionEngine::new(state.clone(), sink, chat, IngestOptions::default());
    let report = ingest.ingest_source("@demo").await.unwrap();
    assert_eq!(report.posts_written, 2);
    assert_eq!(state.load_source("@demo").unwrap().unwrap().last_post_id, 2);
    // Channel exports carry no comments; the source downgraded itself.
    assert!(state.load_source("@demo").unwrap().unwrap().comments_unavailable);

    // Idempotent re-ingest: same rows, nothing new written.
    let again = ingest.ingest_source("@demo").await.unwrap();
    assert_eq!(again.posts_written, 0);

    // Process with the scripted extractor.
    let llm: Arc<dyn LlmClient> = Arc::new(ScriptedLlm);
    let process = Arc::new(ProcessingEngine::new(
        raw.clone(),
        processing.clone(),
        llm.clone(),
        ProcessOptions {
            backoff_base_ms: 1,
            ..Default::default()
        },
    ));
    let report = process.process_pending(None).await.unwrap();
    assert_eq!(report.processed, 2);
    assert_eq!(report.failed, 0);

    let doc = processing.get_processed("tg:@demo:post:1").unwrap().unwrap();
    assert_eq!(doc.id, "doc:tg:@demo:post:1");
    assert!(doc.text_clean.len() >= 300);
    assert!(processing.list_failures().unwrap().is_empty());

    // Topicize.
    let topics = TopicizeEngine::new(processing.clone(), llm, TopicizeOptions::default());
    let report = topics.topicize(None).await.unwrap();
    assert_eq!(report.accepted, 1);

    let cards = processing.list_topic_cards().unwrap();
    assert_eq!(cards[0].id, "topic:tg:@demo:post:1");
    let bundle = processing
        .get_current_bundle("topic:tg:@demo:post:1")
        .unwrap()
        .unwrap();
    assert_eq!(bundle.items.len(), 2);
    assert_eq!(bundle.items[0].source_ref, "tg:@demo:post:1");
    assert_eq!(bundle.items[1].justification.as_deref(), Some("follow-up"));

    // Export twice; the stable artifacts must not move a byte.
    let out_dir = tempfile::tempdir().unwrap();
    let exporter = Exporter::new(processing.clone(), state.clone(), out_dir.path());
    let report = exporter.export().unwrap();
    assert_eq!(report.message_entries, 2);
    assert_eq!(report.topic_entries, 1);

    let entries = std::fs::read_to_string(out_dir.path().join("kb_entries.ndjson")).unwrap();
    let lines: Vec<&str> = entries.lines().collect();
    assert_eq!(lines.len(), 3);
    assert!(lines[0].contains(r#""id":"kb:msg:tg:@demo:post:1""#));
    assert!(lines[0].contains(r#""telegram_url":"https://t.me/demo/1""#));
    assert!(lines[2].contains(r#""id":"kb:topic:topic:tg:@demo:post:1""#));
    assert!(lines[2].contains("**Scope In:** long posts"));

    let first_entries = std::fs::read(out_dir.path().join("kb_entries.ndjson")).unwrap();
    let first_topics = std::fs::read(out_dir.path().join("topics.json")).unwrap();
    exporter.export().unwrap();
    assert_eq!(
        std::fs::read(out_dir.path().join("kb_entries.ndjson")).unwrap(),
        first_entries
    );
    assert_eq!(
        std::fs::read(out_dir.path().join("topics.json")).unwrap(),
        first_topics
    );
    assert!(out_dir
        .path()
        .join("topic_topic_tg_@demo_post_1.json")
        .exists());
}
