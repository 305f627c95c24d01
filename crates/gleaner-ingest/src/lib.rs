pub mod client;
pub mod engine;
pub mod error;
pub mod export_file;

pub use client::{ChatClient, CommentObservation, PostObservation};
pub use engine::{IngestOptions, IngestReport, IngestionEngine, RawSink};
pub use error::{ChatError, IngestError};
pub use export_file::ExportChatClient;
