pub mod error;
pub mod export;
pub mod topicize;
pub mod url;

pub use error::TopicsError;
pub use export::{ExportReport, Exporter, EXPORT_VERSION};
pub use topicize::{TopicizeEngine, TopicizeOptions, TopicizeReport};
pub use url::resolve_telegram_url;
