//! Durable state for the pipeline: three SQLite files, one store each.
//!
//! - ingestion-state: `sources`, `comment_cursors`, `source_attempts`
//! - raw: `raw_messages`, `raw_conflicts`
//! - processing: `processed_documents`, `processing_failures`,
//!   `topic_cards`, `topic_bundles`
//!
//! Uniqueness is enforced by the schema; JSON columns hold the canonical
//! (sorted-key, minified) form so rows can be diffed byte-for-byte.

pub mod error;
pub mod ingest_state;
pub mod processing;
pub mod raw;

pub use error::StoreError;
pub use ingest_state::{IngestionStateStore, SourcePatch};
pub use processing::ProcessingStore;
pub use raw::{RawStore, RawUpsertOutcome};

pub(crate) fn parse_text_enum<T>(idx: usize, raw: String) -> rusqlite::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse::<T>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("{e}").into(),
        )
    })
}

pub(crate) fn parse_json_col<T: serde::de::DeserializeOwned>(
    idx: usize,
    raw: String,
) -> rusqlite::Result<T> {
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("{e}").into(),
        )
    })
}
