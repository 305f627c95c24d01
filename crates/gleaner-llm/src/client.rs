use async_trait::async_trait;
use serde::Serialize;

use crate::error::LlmError;

/// Generation parameters. The pipeline always runs deterministic settings
/// (temperature 0, JSON-object responses); the struct is serialized verbatim
/// into document metadata for reproducibility.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationParams {
    pub temperature: f64,
    pub max_tokens: u32,
    /// Ask the provider for a single JSON object response.
    pub json_object: bool,
}

impl GenerationParams {
    pub fn deterministic(max_tokens: u32) -> Self {
        Self {
            temperature: 0.0,
            max_tokens,
            json_object: true,
        }
    }
}

/// Narrow LLM capability the pipeline consumes. Implemented by the HTTP
/// provider and by test stubs.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Model identifier stamped into document metadata.
    fn model_id(&self) -> &str;

    /// One-shot completion: system prompt + user prompt in, text out.
    async fn generate(
        &self,
        system: &str,
        user: &str,
        params: &GenerationParams,
    ) -> Result<String, LlmError>;
}
