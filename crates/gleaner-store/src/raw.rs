use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension};
use tracing::debug;

use gleaner_core::time::now_iso;
use gleaner_core::types::{ConflictReason, MessageType, RawConflict, RawMessage};

use crate::error::Result;
use crate::parse_text_enum;

/// Outcome of one raw upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawUpsertOutcome {
    Inserted,
    /// Row already present with identical content (payload differences from
    /// truncation included).
    Duplicate,
    /// Row already present with different `text`/`date`; the observation was
    /// journaled, the stored row untouched.
    Conflict,
}

/// Append-only snapshot store. Rows are never mutated after insert;
/// disagreeing re-observations go to the `raw_conflicts` journal.
pub struct RawStore {
    db: Mutex<Connection>,
}

fn init_db(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS raw_messages (
            source_ref        TEXT    NOT NULL PRIMARY KEY,
            message_id        INTEGER NOT NULL,
            message_type      TEXT    NOT NULL,
            channel_id        TEXT    NOT NULL,
            date              TEXT    NOT NULL,
            text              TEXT    NOT NULL,
            thread_id         INTEGER,
            parent_message_id INTEGER,
            language          TEXT,
            raw_payload       TEXT    NOT NULL,
            payload_truncated INTEGER NOT NULL DEFAULT 0,
            payload_size      INTEGER NOT NULL,
            inserted_at       TEXT    NOT NULL
        ) STRICT;
        CREATE INDEX IF NOT EXISTS idx_raw_channel
            ON raw_messages(channel_id, message_id);

        CREATE TABLE IF NOT EXISTS raw_conflicts (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            source_ref  TEXT NOT NULL,
            reason      TEXT NOT NULL,
            new_text    TEXT,
            new_date    TEXT,
            observed_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_conflicts_ref
            ON raw_conflicts(source_ref);",
    )
}

impl RawStore {
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

    /// Insert a snapshot, or journal the observation when a row already
    /// exists. The stored row is never modified on conflict.
    pub fn upsert(&self, raw: &RawMessage) -> Result<RawUpsertOutcome> {
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;

        let existing: Option<(String, String, String)> = tx
            .query_row(
                "SELECT text, date, raw_payload FROM raw_messages WHERE source_ref = ?1",
                [&raw.source_ref],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let outcome = match existing {
            None => {
                tx.execute(
                    "INSERT INTO raw_messages
                     (source_ref, message_id, message_type, channel_id, date, text,
                      thread_id, parent_message_id, language, raw_payload,
                      payload_truncated, payload_size, inserted_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)",
                    rusqlite::params![
                        raw.source_ref,
                        raw.message_id,
                        raw.message_type.to_string(),
                        raw.channel_id,
                        raw.date,
                        raw.text,
                        raw.thread_id,
                        raw.parent_message_id,
                        raw.language,
                        raw.raw_payload,
                        raw.payload_truncated as i64,
                        raw.payload_size,
                        raw.inserted_at,
                    ],
                )?;
                RawUpsertOutcome::Inserted
            }
            Some((text, date, payload)) => {
                let (reason, outcome) = if text == raw.text && date == raw.date {
                    if payload == raw.raw_payload {
                        (ConflictReason::DuplicateSeen, RawUpsertOutcome::Duplicate)
                    } else {
                        (ConflictReason::PayloadTruncated, RawUpsertOutcome::Duplicate)
                    }
                } else {
                    (ConflictReason::ContentMismatch, RawUpsertOutcome::Conflict)
                };
                let (new_text, new_date) = match reason {
                    ConflictReason::ContentMismatch => {
                        (Some(raw.text.as_str()), Some(raw.date.as_str()))
                    }
                    _ => (None, None),
                };
                tx.execute(
                    "INSERT INTO raw_conflicts
                     (source_ref, reason, new_text, new_date, observed_at)
                     VALUES (?1,?2,?3,?4,?5)",
                    rusqlite::params![
                        raw.source_ref,
                        reason.to_string(),
                        new_text,
                        new_date,
                        now_iso(),
                    ],
                )?;
                debug!(source_ref = %raw.source_ref, reason = %reason, "raw re-observation journaled");
                outcome
            }
        };

        tx.commit()?;
        Ok(outcome)
    }

    pub fn get(&self, source_ref: &str) -> Result<Option<RawMessage>> {
        let db = self.db.lock().unwrap();
        let row = db
            .query_row(
                "SELECT source_ref, message_id, message_type, channel_id, date, text,
                        thread_id, parent_message_id, language, raw_payload,
                        payload_truncated, payload_size, inserted_at
                 FROM raw_messages WHERE source_ref = ?1",
                [source_ref],
                row_to_raw,
            )
            .optional()?;
        Ok(row)
    }

    /// All snapshot refs, ordered for deterministic scans. Optionally scoped
    /// to one channel.
    pub fn list_source_refs(&self, channel_id: Option<&str>) -> Result<Vec<String>> {
        let db = self.db.lock().unwrap();
        let mut out = Vec::new();
        match channel_id {
            Some(ch) => {
                let mut stmt = db.prepare(
                    "SELECT source_ref FROM raw_messages
                     WHERE channel_id = ?1 ORDER BY source_ref",
                )?;
                let rows = stmt.query_map([ch], |row| row.get::<_, String>(0))?;
                for r in rows {
                    out.push(r?);
                }
            }
            None => {
                let mut stmt =
                    db.prepare("SELECT source_ref FROM raw_messages ORDER BY source_ref")?;
                let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
                for r in rows {
                    out.push(r?);
                }
            }
        }
        Ok(out)
    }

    pub fn list_conflicts(&self, source_ref: Option<&str>) -> Result<Vec<RawConflict>> {
        let db = self.db.lock().unwrap();
        let mut out = Vec::new();
        let map = |row: &rusqlite::Row<'_>| -> rusqlite::Result<RawConflict> {
            let reason: String = row.get(1)?;
            Ok(RawConflict {
                source_ref: row.get(0)?,
                reason: parse_text_enum(1, reason)?,
                new_text: row.get(2)?,
                new_date: row.get(3)?,
                observed_at: row.get(4)?,
            })
        };
        match source_ref {
            Some(r) => {
                let mut stmt = db.prepare(
                    "SELECT source_ref, reason, new_text, new_date, observed_at
                     FROM raw_conflicts WHERE source_ref = ?1 ORDER BY id",
                )?;
                let rows = stmt.query_map([r], map)?;
                for r in rows {
                    out.push(r?);
                }
            }
            None => {
                let mut stmt = db.prepare(
                    "SELECT source_ref, reason, new_text, new_date, observed_at
                     FROM raw_conflicts ORDER BY id",
                )?;
                let rows = stmt.query_map([], map)?;
                for r in rows {
                    out.push(r?);
                }
            }
        }
        Ok(out)
    }
}

fn row_to_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawMessage> {
    let message_type: String = row.get(2)?;
    let message_type: MessageType = parse_text_enum(2, message_type)?;
    Ok(RawMessage {
        source_ref: row.get(0)?,
        message_id: row.get(1)?,
        message_type,
        channel_id: row.get(3)?,
        date: row.get(4)?,
        text: row.get(5)?,
        thread_id: row.get(6)?,
        parent_message_id: row.get(7)?,
        language: row.get(8)?,
        raw_payload: row.get(9)?,
        payload_truncated: row.get::<_, i64>(10)? != 0,
        payload_size: row.get(11)?,
        inserted_at: row.get(12)?,
    })
}
