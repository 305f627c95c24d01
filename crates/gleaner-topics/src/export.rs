//! Deterministic knowledge-base export.
//!
//! Three artifacts: `kb_entries.ndjson` (message entries then topic
//! entries, each group sorted by id), `topics.json` (all cards sorted by
//! id), and one `topic_<id>.json` detail file per topic. The first two are
//! byte-identical across runs on the same state; detail files additionally
//! carry the export timestamp.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use gleaner_core::ident::{kb_msg_id, kb_topic_id, ranked_order};
use gleaner_core::json::canonical_string;
use gleaner_core::time::now_iso;
use gleaner_core::types::{
    ItemRole, KbEntry, KbSource, MessageType, ProcessedDocument, TopicBundle, TopicCard,
};
use gleaner_store::{IngestionStateStore, ProcessingStore};

use crate::error::TopicsError;
use crate::url::resolve_telegram_url;

pub const EXPORT_VERSION: &str = "1";

#[derive(Debug, Clone, Default)]
pub struct ExportReport {
    pub message_entries: u64,
    pub topic_entries: u64,
    pub topic_files: u64,
    pub out_dir: PathBuf,
}

/// One row of a topic's `resolved_sources`: the union of its card anchors
/// and bundle items keyed by `source_ref`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedSource {
    pub channel_id: String,
    pub message_id: i64,
    pub message_type: MessageType,
    pub source_ref: String,
    pub role: ItemRole,
    pub score: f64,
    pub justification: Option<String>,
}

pub struct Exporter {
    processing: Arc<ProcessingStore>,
    state: Arc<IngestionStateStore>,
    out_dir: PathBuf,
}

impl Exporter {
    pub fn new(
        processing: Arc<ProcessingStore>,
        state: Arc<IngestionStateStore>,
        out_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            processing,
            state,
            out_dir: out_dir.into(),
        }
    }

    pub fn export(&self) -> Result<ExportReport, TopicsError> {
        std::fs::create_dir_all(&self.out_dir)?;

        // channel_id → username, for URL resolution.
        let usernames: HashMap<String, Option<String>> = self
            .state
            .list_sources()?
            .into_iter()
            .map(|s| (s.channel_id, s.channel_username))
            .collect();

        let docs = self.processing.list_processed(None)?;
        let cards = self.processing.list_topic_cards()?;

        let mut message_entries: Vec<KbEntry> = docs
            .iter()
            .map(|d| message_entry(d, &usernames))
            .collect();
        message_entries.sort_by(|a, b| a.id.cmp(&b.id));

        let mut details: Vec<(&TopicCard, Option<TopicBundle>, Vec<ResolvedSource>)> = Vec::new();
        let mut topic_entries: Vec<KbEntry> = Vec::new();
        for card in &cards {
            let bundle = self.processing.get_current_bundle(&card.id)?;
            let resolved = resolved_sources(card, bundle.as_ref());
            topic_entries.push(topic_entry(card, &resolved));
            details.push((card, bundle, resolved));
        }
        topic_entries.sort_by(|a, b| a.id.cmp(&b.id));

        let mut ndjson = String::new();
        for entry in message_entries.iter().chain(topic_entries.iter()) {
            ndjson.push_str(&canonical_string(entry)?);
            ndjson.push('\n');
        }
        std::fs::write(self.out_dir.join("kb_entries.ndjson"), ndjson)?;

        std::fs::write(self.out_dir.join("topics.json"), canonical_string(&cards)?)?;

        let exported_at = now_iso();
        for (card, bundle, resolved) in &details {
            let detail = serde_json::json!({
                "topic_card": card,
                "topic_bundle": bundle,
                "resolved_sources": resolved,
                "exported_at": exported_at,
                "export_version": EXPORT_VERSION,
            });
            let filename = format!("topic_{}.json", card.id.replace(':', "_"));
            std::fs::write(self.out_dir.join(filename), canonical_string(&detail)?)?;
        }

        let report = ExportReport {
            message_entries: message_entries.len() as u64,
            topic_entries: topic_entries.len() as u64,
            topic_files: details.len() as u64,
            out_dir: self.out_dir.clone(),
        };
        info!(
            messages = report.message_entries,
            topics = report.topic_entries,
            out_dir = %report.out_dir.display(),
            "export written"
        );
        Ok(report)
    }
}

fn message_entry(doc: &ProcessedDocument, usernames: &HashMap<String, Option<String>>) -> KbEntry {
    let username = usernames
        .get(&doc.channel_id)
        .and_then(|u| u.as_deref());
    let url = resolve_telegram_url(username, &doc.channel_id, doc.source_message_id);
    let content = match &doc.summary {
        Some(s) if !s.is_empty() => format!("{s}\n\n{}", doc.text_clean),
        _ => doc.text_clean.clone(),
    };
    KbEntry {
        id: kb_msg_id(&doc.source_ref),
        source: KbSource {
            kind: "telegram_message".to_string(),
            channel_id: Some(doc.channel_id.clone()),
            message_id: Some(doc.source_message_id),
            topic_id: None,
        },
        created_at: doc.processed_at.clone(),
        title: format!("Message {}", doc.source_message_id),
        content,
        topics: doc.topics.clone(),
        tags: Vec::new(),
        metadata: serde_json::json!({
            "source_ref": doc.source_ref,
            "telegram_url": url,
        }),
    }
}

fn topic_entry(card: &TopicCard, resolved: &[ResolvedSource]) -> KbEntry {
    let content = format!(
        "{}\n\n**Scope In:** {}\n**Scope Out:** {}",
        card.summary,
        card.scope_in.join(", "),
        card.scope_out.join(", "),
    );
    KbEntry {
        id: kb_topic_id(&card.id),
        source: KbSource {
            kind: "topic".to_string(),
            channel_id: None,
            message_id: None,
            topic_id: Some(card.id.clone()),
        },
        created_at: card.updated_at.clone(),
        title: card.title.clone(),
        content,
        topics: vec![card.id.clone()],
        tags: card.tags.clone(),
        metadata: serde_json::json!({ "resolved_sources": resolved }),
    }
}

/// Union of card anchors and bundle items keyed by `source_ref`. On
/// collision the anchor wins the role, the score is the maximum of the
/// two, and the justification comes from the bundle item (anchors carry
/// none). Anchors sort first, then `(-score, source_ref)`.
pub fn resolved_sources(card: &TopicCard, bundle: Option<&TopicBundle>) -> Vec<ResolvedSource> {
    let mut by_ref: HashMap<String, ResolvedSource> = HashMap::new();
    for a in &card.anchors {
        by_ref.insert(
            a.anchor_ref.clone(),
            ResolvedSource {
                channel_id: a.channel_id.clone(),
                message_id: a.message_id,
                message_type: a.message_type,
                source_ref: a.anchor_ref.clone(),
                role: ItemRole::Anchor,
                score: a.score,
                justification: None,
            },
        );
    }
    if let Some(bundle) = bundle {
        for item in &bundle.items {
            match by_ref.get_mut(&item.source_ref) {
                Some(existing) => {
                    existing.score = existing.score.max(item.score);
                    if item.justification.is_some() {
                        existing.justification = item.justification.clone();
                    }
                }
                None => {
                    by_ref.insert(
                        item.source_ref.clone(),
                        ResolvedSource {
                            channel_id: item.channel_id.clone(),
                            message_id: item.message_id,
                            message_type: item.message_type,
                            source_ref: item.source_ref.clone(),
                            role: item.role,
                            score: item.score,
                            justification: item.justification.clone(),
                        },
                    );
                }
            }
        }
    }
    let mut out: Vec<ResolvedSource> = by_ref.into_values().collect();
    out.sort_by(|a, b| {
        ranked_order(
            a.role,
            a.score,
            &a.source_ref,
            b.role,
            b.score,
            &b.source_ref,
        )
    });
    out
}
