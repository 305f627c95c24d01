use std::collections::HashSet;
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension};
use tracing::debug;

use gleaner_core::json::canonical_string;
use gleaner_core::types::{ProcessedDocument, ProcessingFailure, TopicBundle, TopicCard};

use crate::error::Result;
use crate::{parse_json_col, parse_text_enum};

/// Processed documents, per-message failure bookkeeping, and topic output.
///
/// A processed row and a pending failure row for the same `source_ref`
/// cannot coexist: the document upsert deletes the failure in the same
/// transaction.
pub struct ProcessingStore {
    db: Mutex<Connection>,
}

fn init_db(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS processed_documents (
            source_ref        TEXT    NOT NULL PRIMARY KEY,
            id                TEXT    NOT NULL UNIQUE,
            source_message_id INTEGER NOT NULL,
            channel_id        TEXT    NOT NULL,
            processed_at      TEXT    NOT NULL,
            text_clean        TEXT    NOT NULL,
            summary           TEXT,
            topics            TEXT    NOT NULL,   -- JSON array
            entities          TEXT    NOT NULL,   -- JSON array
            language          TEXT,
            metadata          TEXT    NOT NULL    -- JSON object
        );
        CREATE INDEX IF NOT EXISTS idx_processed_channel
            ON processed_documents(channel_id, source_ref);

        CREATE TABLE IF NOT EXISTS processing_failures (
            source_ref      TEXT    NOT NULL PRIMARY KEY,
            channel_id      TEXT    NOT NULL,
            attempts        INTEGER NOT NULL,
            last_attempt_at TEXT    NOT NULL,
            error_class     TEXT    NOT NULL,
            error_message   TEXT    NOT NULL,
            error_details   TEXT
        );

        CREATE TABLE IF NOT EXISTS topic_cards (
            id             TEXT NOT NULL PRIMARY KEY,
            title          TEXT NOT NULL,
            summary        TEXT NOT NULL,
            scope_in       TEXT NOT NULL,   -- JSON array
            scope_out      TEXT NOT NULL,   -- JSON array
            type           TEXT NOT NULL,
            anchors        TEXT NOT NULL,   -- JSON array
            sources        TEXT NOT NULL,   -- JSON array
            updated_at     TEXT NOT NULL,
            tags           TEXT NOT NULL,   -- JSON array
            related_topics TEXT NOT NULL,   -- JSON array
            status         TEXT NOT NULL,
            metadata       TEXT NOT NULL    -- JSON object
        );

        CREATE TABLE IF NOT EXISTS topic_bundles (
            id         INTEGER PRIMARY KEY AUTOINCREMENT,
            topic_id   TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            time_from  TEXT,
            time_to    TEXT,
            items      TEXT NOT NULL,   -- JSON array
            channels   TEXT NOT NULL,   -- JSON array
            metadata   TEXT NOT NULL    -- JSON object
        );
        -- One current (NULL-window) bundle per topic.
        CREATE UNIQUE INDEX IF NOT EXISTS idx_bundles_current
            ON topic_bundles(topic_id)
            WHERE time_from IS NULL AND time_to IS NULL;",
    )
}

impl ProcessingStore {
    pub fn open(path: &str) -> Result<Self> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    // --- processed documents -----------------------------------------------

    /// Replace-by-`source_ref`; clears any pending failure for the same ref
    /// in the same transaction.
    pub fn upsert_processed(&self, doc: &ProcessedDocument) -> Result<()> {
        let topics = canonical_string(&doc.topics)?;
        let entities = canonical_string(&doc.entities)?;
        let metadata = canonical_string(&doc.metadata)?;

        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO processed_documents
             (source_ref, id, source_message_id, channel_id, processed_at,
              text_clean, summary, topics, entities, language, metadata)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
            rusqlite::params![
                doc.source_ref,
                doc.id,
                doc.source_message_id,
                doc.channel_id,
                doc.processed_at,
                doc.text_clean,
                doc.summary,
                topics,
                entities,
                doc.language,
                metadata,
            ],
        )?;
        tx.execute(
            "DELETE FROM processing_failures WHERE source_ref = ?1",
            [&doc.source_ref],
        )?;
        tx.commit()?;
        debug!(source_ref = %doc.source_ref, "processed document upserted");
        Ok(())
    }

    pub fn get_processed(&self, source_ref: &str) -> Result<Option<ProcessedDocument>> {
        let db = self.db.lock().unwrap();
        let row = db
            .query_row(
                &format!("{SELECT_DOC} WHERE source_ref = ?1"),
                [source_ref],
                row_to_doc,
            )
            .optional()?;
        Ok(row)
    }

    /// Processed documents, ordered by `source_ref` for deterministic
    /// batches. Optionally scoped to one channel.
    pub fn list_processed(&self, channel_id: Option<&str>) -> Result<Vec<ProcessedDocument>> {
        let db = self.db.lock().unwrap();
        let mut out = Vec::new();
        match channel_id {
            Some(ch) => {
                let mut stmt =
                    db.prepare(&format!("{SELECT_DOC} WHERE channel_id = ?1 ORDER BY source_ref"))?;
                let rows = stmt.query_map([ch], row_to_doc)?;
                for r in rows {
                    out.push(r?);
                }
            }
            None => {
                let mut stmt = db.prepare(&format!("{SELECT_DOC} ORDER BY source_ref"))?;
                let rows = stmt.query_map([], row_to_doc)?;
                for r in rows {
                    out.push(r?);
                }
            }
        }
        Ok(out)
    }

    /// Set of refs that already have a processed row.
    pub fn processed_refs(&self) -> Result<HashSet<String>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare("SELECT source_ref FROM processed_documents")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = HashSet::new();
        for r in rows {
            out.insert(r?);
        }
        Ok(out)
    }

    // --- failures ----------------------------------------------------------

    /// Upsert by `source_ref`; attempt counts accumulate across runs.
    pub fn record_failure(&self, f: &ProcessingFailure) -> Result<()> {
        let details = match &f.error_details {
            Some(v) => Some(canonical_string(v)?),
            None => None,
        };
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO processing_failures
             (source_ref, channel_id, attempts, last_attempt_at,
              error_class, error_message, error_details)
             VALUES (?1,?2,?3,?4,?5,?6,?7)
             ON CONFLICT(source_ref) DO UPDATE SET
                attempts = attempts + excluded.attempts,
                last_attempt_at = excluded.last_attempt_at,
                error_class = excluded.error_class,
                error_message = excluded.error_message,
                error_details = excluded.error_details",
            rusqlite::params![
                f.source_ref,
                f.channel_id,
                f.attempts,
                f.last_attempt_at,
                f.error_class,
                f.error_message,
                details,
            ],
        )?;
        Ok(())
    }

    pub fn get_failure(&self, source_ref: &str) -> Result<Option<ProcessingFailure>> {
        let db = self.db.lock().unwrap();
        let row = db
            .query_row(
                "SELECT source_ref, channel_id, attempts, last_attempt_at,
                        error_class, error_message, error_details
                 FROM processing_failures WHERE source_ref = ?1",
                [source_ref],
                row_to_failure,
            )
            .optional()?;
        Ok(row)
    }

    pub fn list_failures(&self) -> Result<Vec<ProcessingFailure>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT source_ref, channel_id, attempts, last_attempt_at,
                    error_class, error_message, error_details
             FROM processing_failures ORDER BY source_ref",
        )?;
        let rows = stmt.query_map([], row_to_failure)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    // --- topics ------------------------------------------------------------

    /// Replace-by-id.
    pub fn upsert_topic_card(&self, card: &TopicCard) -> Result<()> {
        let anchors = canonical_string(&card.anchors)?;
        let scope_in = canonical_string(&card.scope_in)?;
        let scope_out = canonical_string(&card.scope_out)?;
        let sources = canonical_string(&card.sources)?;
        let tags = canonical_string(&card.tags)?;
        let related = canonical_string(&card.related_topics)?;
        let metadata = canonical_string(&card.metadata)?;

        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT OR REPLACE INTO topic_cards
             (id, title, summary, scope_in, scope_out, type, anchors, sources,
              updated_at, tags, related_topics, status, metadata)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)",
            rusqlite::params![
                card.id,
                card.title,
                card.summary,
                scope_in,
                scope_out,
                card.topic_type.to_string(),
                anchors,
                sources,
                card.updated_at,
                tags,
                related,
                card.status,
                metadata,
            ],
        )?;
        Ok(())
    }

    /// Replace the current (NULL-window) bundle for `bundle.topic_id`.
    /// Ranged snapshots are reserved; nothing writes them yet.
    pub fn upsert_topic_bundle(&self, bundle: &TopicBundle) -> Result<()> {
        let items = canonical_string(&bundle.items)?;
        let channels = canonical_string(&bundle.channels)?;
        let metadata = canonical_string(&bundle.metadata)?;

        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        tx.execute(
            "DELETE FROM topic_bundles
             WHERE topic_id = ?1 AND time_from IS NULL AND time_to IS NULL",
            [&bundle.topic_id],
        )?;
        tx.execute(
            "INSERT INTO topic_bundles
             (topic_id, updated_at, time_from, time_to, items, channels, metadata)
             VALUES (?1,?2,?3,?4,?5,?6,?7)",
            rusqlite::params![
                bundle.topic_id,
                bundle.updated_at,
                bundle.time_from,
                bundle.time_to,
                items,
                channels,
                metadata,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_topic_card(&self, id: &str) -> Result<Option<TopicCard>> {
        let db = self.db.lock().unwrap();
        let row = db
            .query_row(&format!("{SELECT_CARD} WHERE id = ?1"), [id], row_to_card)
            .optional()?;
        Ok(row)
    }

    /// All cards ordered by id, the canonical export order.
    pub fn list_topic_cards(&self) -> Result<Vec<TopicCard>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(&format!("{SELECT_CARD} ORDER BY id"))?;
        let rows = stmt.query_map([], row_to_card)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub fn get_current_bundle(&self, topic_id: &str) -> Result<Option<TopicBundle>> {
        let db = self.db.lock().unwrap();
        let row = db
            .query_row(
                "SELECT topic_id, updated_at, time_from, time_to, items, channels, metadata
                 FROM topic_bundles
                 WHERE topic_id = ?1 AND time_from IS NULL AND time_to IS NULL",
                [topic_id],
                row_to_bundle,
            )
            .optional()?;
        Ok(row)
    }
}

const SELECT_DOC: &str = "SELECT source_ref, id, source_message_id, channel_id,
        processed_at, text_clean, summary, topics, entities, language, metadata
    FROM processed_documents";

const SELECT_CARD: &str = "SELECT id, title, summary, scope_in, scope_out, type,
        anchors, sources, updated_at, tags, related_topics, status, metadata
    FROM topic_cards";

fn row_to_doc(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProcessedDocument> {
    let topics: String = row.get(7)?;
    let entities: String = row.get(8)?;
    let metadata: String = row.get(10)?;
    Ok(ProcessedDocument {
        source_ref: row.get(0)?,
        id: row.get(1)?,
        source_message_id: row.get(2)?,
        channel_id: row.get(3)?,
        processed_at: row.get(4)?,
        text_clean: row.get(5)?,
        summary: row.get(6)?,
        topics: parse_json_col(7, topics)?,
        entities: parse_json_col(8, entities)?,
        language: row.get(9)?,
        metadata: parse_json_col(10, metadata)?,
    })
}

fn row_to_failure(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProcessingFailure> {
    let details: Option<String> = row.get(6)?;
    let error_details = match details {
        Some(raw) => Some(parse_json_col(6, raw)?),
        None => None,
    };
    Ok(ProcessingFailure {
        source_ref: row.get(0)?,
        channel_id: row.get(1)?,
        attempts: row.get(2)?,
        last_attempt_at: row.get(3)?,
        error_class: row.get(4)?,
        error_message: row.get(5)?,
        error_details,
    })
}

fn row_to_card(row: &rusqlite::Row<'_>) -> rusqlite::Result<TopicCard> {
    let scope_in: String = row.get(3)?;
    let scope_out: String = row.get(4)?;
    let topic_type: String = row.get(5)?;
    let anchors: String = row.get(6)?;
    let sources: String = row.get(7)?;
    let tags: String = row.get(9)?;
    let related: String = row.get(10)?;
    let metadata: String = row.get(12)?;
    Ok(TopicCard {
        id: row.get(0)?,
        title: row.get(1)?,
        summary: row.get(2)?,
        scope_in: parse_json_col(3, scope_in)?,
        scope_out: parse_json_col(4, scope_out)?,
        topic_type: parse_text_enum(5, topic_type)?,
        anchors: parse_json_col(6, anchors)?,
        sources: parse_json_col(7, sources)?,
        updated_at: row.get(8)?,
        tags: parse_json_col(9, tags)?,
        related_topics: parse_json_col(10, related)?,
        status: row.get(11)?,
        metadata: parse_json_col(12, metadata)?,
    })
}

fn row_to_bundle(row: &rusqlite::Row<'_>) -> rusqlite::Result<TopicBundle> {
    let items: String = row.get(4)?;
    let channels: String = row.get(5)?;
    let metadata: String = row.get(6)?;
    Ok(TopicBundle {
        topic_id: row.get(0)?,
        updated_at: row.get(1)?,
        time_from: row.get(2)?,
        time_to: row.get(3)?,
        items: parse_json_col(4, items)?,
        channels: parse_json_col(5, channels)?,
        metadata: parse_json_col(6, metadata)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use gleaner_core::types::{
        DocumentMetadata, ItemRole, MessageType, TopicAnchor, TopicType,
    };

    fn doc(source_ref: &str) -> ProcessedDocument {
        ProcessedDocument {
            id: format!("doc:{source_ref}"),
            source_ref: source_ref.to_string(),
            source_message_id: 1,
            channel_id: "@demo".to_string(),
            processed_at: "2025-01-01T00:00:00Z".to_string(),
            text_clean: "hello".to_string(),
            summary: None,
            topics: vec![],
            entities: vec![],
            language: Some("en".to_string()),
            metadata: DocumentMetadata {
                pipeline_version: "0.1.0".to_string(),
                model_id: "stub".to_string(),
                prompt_id: "sha256:0000000000000000".to_string(),
                prompt_name: "message_extract".to_string(),
                parameters: serde_json::json!({"temperature": 0.0}),
            },
        }
    }

    fn failure(source_ref: &str, attempts: u32) -> ProcessingFailure {
        ProcessingFailure {
            source_ref: source_ref.to_string(),
            channel_id: "@demo".to_string(),
            attempts,
            last_attempt_at: "2025-01-01T00:00:00Z".to_string(),
            error_class: "parse".to_string(),
            error_message: "bad json".to_string(),
            error_details: None,
        }
    }

    fn card(id_ref: &str) -> TopicCard {
        TopicCard {
            id: format!("topic:{id_ref}"),
            title: "T".to_string(),
            summary: "S".to_string(),
            scope_in: vec!["a".to_string()],
            scope_out: vec![],
            topic_type: TopicType::Singleton,
            anchors: vec![TopicAnchor {
                channel_id: "@demo".to_string(),
                message_id: 1,
                message_type: MessageType::Post,
                anchor_ref: id_ref.to_string(),
                score: 0.9,
            }],
            sources: vec!["@demo".to_string()],
            updated_at: "2025-01-01T00:00:00Z".to_string(),
            tags: vec![],
            related_topics: vec![],
            status: "active".to_string(),
            metadata: serde_json::json!({}),
        }
    }

    #[test]
    fn upsert_processed_is_idempotent() {
        let store = ProcessingStore::open_in_memory().unwrap();
        let d = doc("tg:@demo:post:1");
        store.upsert_processed(&d).unwrap();
        store.upsert_processed(&d).unwrap();
        assert_eq!(store.list_processed(None).unwrap().len(), 1);
        let got = store.get_processed("tg:@demo:post:1").unwrap().unwrap();
        assert_eq!(got.id, "doc:tg:@demo:post:1");
        assert_eq!(got.metadata.prompt_name, "message_extract");
    }

    #[test]
    fn success_clears_pending_failure() {
        let store = ProcessingStore::open_in_memory().unwrap();
        store.record_failure(&failure("tg:@demo:post:1", 3)).unwrap();
        assert!(store.get_failure("tg:@demo:post:1").unwrap().is_some());

        store.upsert_processed(&doc("tg:@demo:post:1")).unwrap();
        assert!(store.get_failure("tg:@demo:post:1").unwrap().is_none());
        assert!(store.get_processed("tg:@demo:post:1").unwrap().is_some());
    }

    #[test]
    fn failure_attempts_accumulate() {
        let store = ProcessingStore::open_in_memory().unwrap();
        store.record_failure(&failure("tg:@demo:post:1", 3)).unwrap();
        store.record_failure(&failure("tg:@demo:post:1", 3)).unwrap();
        let f = store.get_failure("tg:@demo:post:1").unwrap().unwrap();
        assert_eq!(f.attempts, 6);
        assert_eq!(store.list_failures().unwrap().len(), 1);
    }

    #[test]
    fn card_replaces_by_id() {
        let store = ProcessingStore::open_in_memory().unwrap();
        let mut c = card("tg:@demo:post:1");
        store.upsert_topic_card(&c).unwrap();
        c.title = "renamed".to_string();
        store.upsert_topic_card(&c).unwrap();
        let cards = store.list_topic_cards().unwrap();
        assert_eq!(cards.len(), 1);
        assert_eq!(cards[0].title, "renamed");
    }

    #[test]
    fn current_bundle_replaces_not_duplicates() {
        let store = ProcessingStore::open_in_memory().unwrap();
        let mut b = TopicBundle {
            topic_id: "topic:tg:@demo:post:1".to_string(),
            updated_at: "2025-01-01T00:00:00Z".to_string(),
            time_from: None,
            time_to: None,
            items: vec![gleaner_core::types::BundleItem {
                channel_id: "@demo".to_string(),
                message_id: 1,
                message_type: MessageType::Post,
                source_ref: "tg:@demo:post:1".to_string(),
                role: ItemRole::Anchor,
                score: 0.9,
                justification: None,
            }],
            channels: vec!["@demo".to_string()],
            metadata: serde_json::json!({}),
        };
        store.upsert_topic_bundle(&b).unwrap();
        b.updated_at = "2025-01-02T00:00:00Z".to_string();
        store.upsert_topic_bundle(&b).unwrap();
        let got = store.get_current_bundle("topic:tg:@demo:post:1").unwrap().unwrap();
        assert_eq!(got.updated_at, "2025-01-02T00:00:00Z");
        assert_eq!(got.items.len(), 1);
    }

    #[test]
    fn cards_listed_in_id_order() {
        let store = ProcessingStore::open_in_memory().unwrap();
        store.upsert_topic_card(&card("tg:@demo:post:2")).unwrap();
        store.upsert_topic_card(&card("tg:@demo:post:1")).unwrap();
        let ids: Vec<String> = store
            .list_topic_cards()
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids, ["topic:tg:@demo:post:1", "topic:tg:@demo:post:2"]);
    }
}
