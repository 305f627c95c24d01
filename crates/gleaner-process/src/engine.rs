use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use gleaner_core::backoff::delay_with_jitter;
use gleaner_core::ident::doc_id;
use gleaner_core::time::now_iso;
use gleaner_core::types::{
    DocumentMetadata, EntityMention, ProcessedDocument, ProcessingFailure, RawMessage,
};
use gleaner_llm::prompts::{PromptDef, MESSAGE_EXTRACT};
use gleaner_llm::{GenerationParams, LlmClient};
use gleaner_store::{ProcessingStore, RawStore};

use crate::error::{AttemptError, ProcessError};

#[derive(Debug, Clone)]
pub struct ProcessOptions {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    /// Concurrent LLM requests.
    pub llm_concurrency: usize,
    pub max_tokens: u32,
    pub pipeline_version: String,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 1000,
            llm_concurrency: 4,
            max_tokens: 1024,
            pipeline_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProcessReport {
    pub pending: u64,
    pub processed: u64,
    pub failed: u64,
}

/// Turns raw snapshots into processed documents, one LLM call per message.
///
/// Failures are bookkept per message and never abort the batch; a success
/// for a ref clears its failure row in the same transaction.
pub struct ProcessingEngine {
    raw: Arc<RawStore>,
    store: Arc<ProcessingStore>,
    llm: Arc<dyn LlmClient>,
    opts: ProcessOptions,
    shutdown: Option<watch::Receiver<bool>>,
}

impl ProcessingEngine {
    pub fn new(
        raw: Arc<RawStore>,
        store: Arc<ProcessingStore>,
        llm: Arc<dyn LlmClient>,
        opts: ProcessOptions,
    ) -> Self {
        Self {
            raw,
            store,
            llm,
            opts,
            shutdown: None,
        }
    }

    pub fn with_shutdown(mut self, rx: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(rx);
        self
    }

    fn cancelled(&self) -> bool {
        self.shutdown.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
    }

    /// Process every raw ref without a processed row, optionally scoped to
    /// one channel. Previously failed refs are picked up again.
    pub async fn process_pending(
        self: &Arc<Self>,
        channel_id: Option<&str>,
    ) -> Result<ProcessReport, ProcessError> {
        let raw_refs = self.raw.list_source_refs(channel_id)?;
        let done = self.store.processed_refs()?;
        let pending: Vec<String> = raw_refs
            .into_iter()
            .filter(|r| !done.contains(r))
            .collect();

        let mut report = ProcessReport {
            pending: pending.len() as u64,
            ..Default::default()
        };
        info!(pending = report.pending, "processing batch started");

        let sem = Arc::new(tokio::sync::Semaphore::new(self.opts.llm_concurrency));
        let mut join = tokio::task::JoinSet::new();
        for source_ref in pending {
            if self.cancelled() {
                info!("processing cancelled");
                break;
            }
            let engine = Arc::clone(self);
            let sem = Arc::clone(&sem);
            join.spawn(async move {
                let _permit = sem.acquire_owned().await.expect("semaphore closed");
                engine.process_one(&source_ref).await
            });
        }

        while let Some(res) = join.join_next().await {
            match res {
                Ok(Ok(true)) => report.processed += 1,
                Ok(Ok(false)) => report.failed += 1,
                Ok(Err(e)) => return Err(e),
                Err(e) => warn!("processing task panicked: {e}"),
            }
        }

        info!(
            processed = report.processed,
            failed = report.failed,
            "processing batch finished"
        );
        Ok(report)
    }

    /// Run the retry loop for one message. Returns whether it ended in a
    /// processed document (`true`) or a recorded failure (`false`).
    async fn process_one(&self, source_ref: &str) -> Result<bool, ProcessError> {
        let Some(raw) = self.raw.get(source_ref)? else {
            warn!(source_ref, "pending ref vanished from the raw store");
            return Ok(false);
        };

        let prompt = &MESSAGE_EXTRACT;
        let user = prompt.render_user(&[("text", &raw.text)]);
        let params = GenerationParams::deterministic(self.opts.max_tokens);

        let mut attempt = 1u32;
        let outcome = loop {
            match self.attempt_once(&raw, prompt, &user, &params).await {
                Ok(doc) => break Ok(doc),
                Err(e) if e.is_retryable() && attempt < self.opts.max_attempts => {
                    let delay = delay_with_jitter(self.opts.backoff_base_ms, attempt);
                    debug!(
                        source_ref,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "retrying message: {e}"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => break Err(e),
            }
        };

        match outcome {
            Ok(doc) => {
                self.store.upsert_processed(&doc)?;
                Ok(true)
            }
            Err(e) => {
                warn!(source_ref, attempts = attempt, "message failed: {e}");
                self.store.record_failure(&ProcessingFailure {
                    source_ref: source_ref.to_string(),
                    channel_id: raw.channel_id.clone(),
                    attempts: attempt,
                    last_attempt_at: now_iso(),
                    error_class: e.class().as_str().to_string(),
                    error_message: e.to_string(),
                    error_details: Some(serde_json::json!({
                        "prompt_id": prompt.prompt_id(),
                        "model_id": self.llm.model_id(),
                    })),
                })?;
                Ok(false)
            }
        }
    }

    async fn attempt_once(
        &self,
        raw: &RawMessage,
        prompt: &'static PromptDef,
        user: &str,
        params: &GenerationParams,
    ) -> Result<ProcessedDocument, AttemptError> {
        let text = self.llm.generate(prompt.system, user, params).await?;
        let parsed: Extraction =
            serde_json::from_str(&text).map_err(|e| AttemptError::Parse(e.to_string()))?;

        let text_clean = match parsed.text_clean {
            Some(t) if !t.trim().is_empty() => t,
            _ => {
                return Err(AttemptError::Validation(
                    "text_clean missing or empty".to_string(),
                ))
            }
        };

        let entities = parsed
            .entities
            .into_iter()
            .filter_map(|e| {
                Some(EntityMention {
                    entity_type: e.entity_type?,
                    value: e.value?,
                    confidence: e.confidence.unwrap_or(0.5).clamp(0.0, 1.0),
                })
            })
            .collect();

        Ok(ProcessedDocument {
            id: doc_id(&raw.source_ref),
            source_ref: raw.source_ref.clone(),
            source_message_id: raw.message_id,
            channel_id: raw.channel_id.clone(),
            processed_at: now_iso(),
            text_clean,
            summary: parsed.summary,
            topics: parsed.topics,
            entities,
            language: parsed.language.or_else(|| raw.language.clone()),
            metadata: DocumentMetadata {
                pipeline_version: self.opts.pipeline_version.clone(),
                model_id: self.llm.model_id().to_string(),
                prompt_id: prompt.prompt_id().to_string(),
                prompt_name: prompt.name.to_string(),
                parameters: serde_json::to_value(params)
                    .map_err(|e| AttemptError::Parse(e.to_string()))?,
            },
        })
    }
}

/// Wire shape of the extraction response. Everything but `text_clean` is
/// optional and defaulted.
#[derive(Deserialize)]
struct Extraction {
    text_clean: Option<String>,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    topics: Vec<String>,
    #[serde(default)]
    entities: Vec<WireEntity>,
    #[serde(default)]
    language: Option<String>,
}

#[derive(Deserialize)]
struct WireEntity {
    #[serde(rename = "type")]
    entity_type: Option<String>,
    value: Option<String>,
    confidence: Option<f64>,
}
