use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension};
use tracing::info;

use gleaner_core::error::ErrorClass;
use gleaner_core::json::canonical_string;
use gleaner_core::time::now_iso;
use gleaner_core::types::{SourceAttempt, SourceState, SourceStatus};

use crate::error::{Result, StoreError};
use crate::parse_text_enum;

/// Fields of a new (or re-registered) source. `source_id` equals
/// `channel_id` for now; the split is kept because exports address channels
/// while cursors address sources.
#[derive(Debug, Clone)]
pub struct NewSource {
    pub source_id: String,
    pub channel_id: String,
    pub channel_username: Option<String>,
    pub include_comments: bool,
    pub history_from: Option<String>,
    pub history_to: Option<String>,
    pub batch_size: Option<u32>,
    pub poll_interval_secs: Option<u64>,
}

/// Partial update for a source row. `None` leaves the column untouched;
/// for nullable columns the inner `Option` distinguishes "set NULL" from
/// "set value". Cursor columns are absent on purpose; they move only
/// through the `advance_*` methods.
#[derive(Debug, Clone, Default)]
pub struct SourcePatch {
    pub status: Option<SourceStatus>,
    pub fail_count: Option<u32>,
    pub last_error: Option<Option<String>>,
    pub rate_limit_until: Option<Option<String>>,
    pub backfill_completed_at: Option<Option<String>>,
    pub comments_unavailable: Option<bool>,
    pub last_attempt_at: Option<String>,
    pub last_success_at: Option<String>,
}

/// Per-source cursors, status and the append-only attempt journal.
pub struct IngestionStateStore {
    db: Mutex<Connection>,
}

fn init_db(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS sources (
            source_id             TEXT    NOT NULL PRIMARY KEY,
            channel_id            TEXT    NOT NULL,
            channel_username      TEXT,
            status                TEXT    NOT NULL DEFAULT 'active',
            include_comments      INTEGER NOT NULL DEFAULT 0,
            history_from          TEXT,
            history_to            TEXT,
            batch_size            INTEGER,
            poll_interval_secs    INTEGER,
            last_post_id          INTEGER NOT NULL DEFAULT 0,
            backfill_completed_at TEXT,
            last_attempt_at       TEXT,
            last_success_at       TEXT,
            fail_count            INTEGER NOT NULL DEFAULT 0,
            last_error            TEXT,
            rate_limit_until      TEXT,
            comments_unavailable  INTEGER NOT NULL DEFAULT 0,
            created_at            TEXT    NOT NULL,
            updated_at            TEXT    NOT NULL
        );

        CREATE TABLE IF NOT EXISTS comment_cursors (
            source_id       TEXT    NOT NULL,
            thread_id       INTEGER NOT NULL,
            last_comment_id INTEGER NOT NULL DEFAULT 0,
            updated_at      TEXT    NOT NULL,
            PRIMARY KEY (source_id, thread_id)
        );

        CREATE TABLE IF NOT EXISTS source_attempts (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            source_id     TEXT    NOT NULL,
            success       INTEGER NOT NULL,
            error_class   TEXT,
            error_message TEXT,
            detail        TEXT,
            attempted_at  TEXT    NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_attempts_source
            ON source_attempts(source_id, id);",
    )
}

impl IngestionStateStore {
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

    /// Create the source if absent, otherwise refresh its descriptive
    /// fields. Cursors and status survive re-registration.
    pub fn register_source(&self, src: &NewSource) -> Result<SourceState> {
        let db = self.db.lock().unwrap();
        let now = now_iso();
        let updated = db.execute(
            "UPDATE sources SET channel_id = ?2, channel_username = ?3,
                include_comments = ?4, history_from = ?5, history_to = ?6,
                batch_size = ?7, poll_interval_secs = ?8, updated_at = ?9
             WHERE source_id = ?1",
            rusqlite::params![
                src.source_id,
                src.channel_id,
                src.channel_username,
                src.include_comments as i64,
                src.history_from,
                src.history_to,
                src.batch_size,
                src.poll_interval_secs,
                now,
            ],
        )?;
        if updated == 0 {
            db.execute(
                "INSERT INTO sources
                 (source_id, channel_id, channel_username, status, include_comments,
                  history_from, history_to, batch_size, poll_interval_secs,
                  created_at, updated_at)
                 VALUES (?1,?2,?3,'active',?4,?5,?6,?7,?8,?9,?9)",
                rusqlite::params![
                    src.source_id,
                    src.channel_id,
                    src.channel_username,
                    src.include_comments as i64,
                    src.history_from,
                    src.history_to,
                    src.batch_size,
                    src.poll_interval_secs,
                    now,
                ],
            )?;
            info!(source_id = %src.source_id, "source registered");
        }
        drop(db);
        self.load_source(&src.source_id)?
            .ok_or_else(|| StoreError::SourceNotFound(src.source_id.clone()))
    }

    pub fn load_source(&self, source_id: &str) -> Result<Option<SourceState>> {
        let db = self.db.lock().unwrap();
        let row = db
            .query_row(
                &format!("{SELECT_SOURCE} WHERE source_id = ?1"),
                [source_id],
                row_to_source,
            )
            .optional()?;
        Ok(row)
    }

    pub fn list_sources(&self) -> Result<Vec<SourceState>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(&format!("{SELECT_SOURCE} ORDER BY source_id"))?;
        let rows = stmt.query_map([], row_to_source)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Apply a partial update. Fails on an unknown source.
    pub fn update_source(&self, source_id: &str, patch: &SourcePatch) -> Result<()> {
        let mut state = self
            .load_source(source_id)?
            .ok_or_else(|| StoreError::SourceNotFound(source_id.to_string()))?;

        if let Some(status) = patch.status {
            state.status = status;
        }
        if let Some(fail_count) = patch.fail_count {
            state.fail_count = fail_count;
        }
        if let Some(ref last_error) = patch.last_error {
            state.last_error = last_error.clone();
        }
        if let Some(ref until) = patch.rate_limit_until {
            state.rate_limit_until = until.clone();
        }
        if let Some(ref done) = patch.backfill_completed_at {
            state.backfill_completed_at = done.clone();
        }
        if let Some(flag) = patch.comments_unavailable {
            state.comments_unavailable = flag;
        }
        if let Some(ref at) = patch.last_attempt_at {
            state.last_attempt_at = Some(at.clone());
        }
        if let Some(ref at) = patch.last_success_at {
            state.last_success_at = Some(at.clone());
        }

        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE sources SET status = ?2, fail_count = ?3, last_error = ?4,
                rate_limit_until = ?5, backfill_completed_at = ?6,
                comments_unavailable = ?7, last_attempt_at = ?8,
                last_success_at = ?9, updated_at = ?10
             WHERE source_id = ?1",
            rusqlite::params![
                source_id,
                state.status.to_string(),
                state.fail_count,
                state.last_error,
                state.rate_limit_until,
                state.backfill_completed_at,
                state.comments_unavailable as i64,
                state.last_attempt_at,
                state.last_success_at,
                now_iso(),
            ],
        )?;
        Ok(())
    }

    /// Move the post high-watermark forward. Never regresses.
    pub fn advance_post_cursor(&self, source_id: &str, new_last_post_id: i64) -> Result<()> {
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE sources
             SET last_post_id = MAX(last_post_id, ?2), updated_at = ?3
             WHERE source_id = ?1",
            rusqlite::params![source_id, new_last_post_id, now_iso()],
        )?;
        if n == 0 {
            return Err(StoreError::SourceNotFound(source_id.to_string()));
        }
        Ok(())
    }

    /// Comment high-watermark for one thread; 0 when the thread is new.
    pub fn comment_cursor(&self, source_id: &str, thread_id: i64) -> Result<i64> {
        let db = self.db.lock().unwrap();
        let id: Option<i64> = db
            .query_row(
                "SELECT last_comment_id FROM comment_cursors
                 WHERE source_id = ?1 AND thread_id = ?2",
                rusqlite::params![source_id, thread_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id.unwrap_or(0))
    }

    pub fn advance_comment_cursor(
        &self,
        source_id: &str,
        thread_id: i64,
        new_last_comment_id: i64,
    ) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO comment_cursors (source_id, thread_id, last_comment_id, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(source_id, thread_id) DO UPDATE SET
                last_comment_id = MAX(last_comment_id, excluded.last_comment_id),
                updated_at = excluded.updated_at",
            rusqlite::params![source_id, thread_id, new_last_comment_id, now_iso()],
        )?;
        Ok(())
    }

    /// Append one line to the attempt journal.
    pub fn record_attempt(
        &self,
        source_id: &str,
        success: bool,
        error_class: Option<ErrorClass>,
        error_message: Option<&str>,
        detail: Option<&serde_json::Value>,
    ) -> Result<()> {
        let detail_json = match detail {
            Some(v) => Some(canonical_string(v)?),
            None => None,
        };
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO source_attempts
             (source_id, success, error_class, error_message, detail, attempted_at)
             VALUES (?1,?2,?3,?4,?5,?6)",
            rusqlite::params![
                source_id,
                success as i64,
                error_class.map(|c| c.as_str()),
                error_message,
                detail_json,
                now_iso(),
            ],
        )?;
        Ok(())
    }

    /// Most recent attempts first.
    pub fn list_attempts(&self, source_id: &str, limit: usize) -> Result<Vec<SourceAttempt>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, source_id, success, error_class, error_message, detail, attempted_at
             FROM source_attempts WHERE source_id = ?1
             ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(rusqlite::params![source_id, limit as i64], |row| {
            let detail: Option<String> = row.get(5)?;
            let detail = match detail {
                Some(raw) => Some(crate::parse_json_col(5, raw)?),
                None => None,
            };
            Ok(SourceAttempt {
                id: row.get(0)?,
                source_id: row.get(1)?,
                success: row.get::<_, i64>(2)? != 0,
                error_class: row.get(3)?,
                error_message: row.get(4)?,
                detail,
                attempted_at: row.get(6)?,
            })
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }
}

const SELECT_SOURCE: &str = "SELECT source_id, channel_id, channel_username, status,
        include_comments, history_from, history_to, batch_size, poll_interval_secs,
        last_post_id, backfill_completed_at, last_attempt_at, last_success_at,
        fail_count, last_error, rate_limit_until, comments_unavailable,
        created_at, updated_at
    FROM sources";

fn row_to_source(row: &rusqlite::Row<'_>) -> rusqlite::Result<SourceState> {
    let status: String = row.get(3)?;
    Ok(SourceState {
        source_id: row.get(0)?,
        channel_id: row.get(1)?,
        channel_username: row.get(2)?,
        status: parse_text_enum(3, status)?,
        include_comments: row.get::<_, i64>(4)? != 0,
        history_from: row.get(5)?,
        history_to: row.get(6)?,
        batch_size: row.get(7)?,
        poll_interval_secs: row.get(8)?,
        last_post_id: row.get(9)?,
        backfill_completed_at: row.get(10)?,
        last_attempt_at: row.get(11)?,
        last_success_at: row.get(12)?,
        fail_count: row.get(13)?,
        last_error: row.get(14)?,
        rate_limit_until: row.get(15)?,
        comments_unavailable: row.get::<_, i64>(16)? != 0,
        created_at: row.get(17)?,
        updated_at: row.get(18)?,
    })
}
