pub mod engine;
pub mod error;

pub use engine::{ProcessOptions, ProcessReport, ProcessingEngine};
pub use error::ProcessError;
