use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
#[error("configuration error: {0}")]
pub struct ConfigError(pub String);

/// Top-level config (gleaner.toml + GLEANER_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GleanerConfig {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub stores: StoresConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub processing: ProcessingConfig,
    #[serde(default)]
    pub topics: TopicsConfig,
    #[serde(default)]
    pub export: ExportConfig,
    /// Sources synced into the ingestion-state store on startup.
    #[serde(default)]
    pub sources: Vec<SourceEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Provider tag; only OpenAI-compatible endpoints for now.
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: default_llm_base_url(),
            api_key: String::new(),
            max_tokens: default_max_tokens(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// File-per-store layout: three SQLite files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoresConfig {
    #[serde(default = "default_ingest_db")]
    pub ingest_path: String,
    #[serde(default = "default_raw_db")]
    pub raw_path: String,
    #[serde(default = "default_processing_db")]
    pub processing_path: String,
}

impl Default for StoresConfig {
    fn default() -> Self {
        Self {
            ingest_path: default_ingest_db(),
            raw_path: default_raw_db(),
            processing_path: default_processing_db(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Sources ingested concurrently; each source is sequential inside.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_ingest_backoff")]
    pub backoff_base_ms: u64,
    /// Directory of Telegram Desktop export files (<channel_id>.json) served
    /// by the offline chat client.
    pub export_dir: Option<String>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            poll_interval_secs: default_poll_interval(),
            parallelism: default_parallelism(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_ingest_backoff(),
            export_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_processing_backoff")]
    pub backoff_base_ms: u64,
    /// Concurrent LLM requests (semaphore permits).
    #[serde(default = "default_llm_concurrency")]
    pub llm_concurrency: usize,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_processing_backoff(),
            llm_concurrency: default_llm_concurrency(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicsConfig {
    /// Anchors kept per cluster topic.
    #[serde(default = "default_anchor_cap")]
    pub anchor_cap: usize,
    #[serde(default = "default_singleton_min_score")]
    pub singleton_min_score: f64,
    #[serde(default = "default_cluster_min_score")]
    pub cluster_min_score: f64,
    #[serde(default = "default_supporting_min_score")]
    pub supporting_min_score: f64,
    #[serde(default = "default_singleton_min_text_len")]
    pub singleton_min_text_len: usize,
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            anchor_cap: default_anchor_cap(),
            singleton_min_score: default_singleton_min_score(),
            cluster_min_score: default_cluster_min_score(),
            supporting_min_score: default_supporting_min_score(),
            singleton_min_text_len: default_singleton_min_text_len(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    #[serde(default = "default_out_dir")]
    pub out_dir: String,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            out_dir: default_out_dir(),
        }
    }
}

/// One source to register. `channel_id` doubles as the source id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceEntry {
    pub channel_id: String,
    pub channel_username: Option<String>,
    #[serde(default)]
    pub include_comments: bool,
    pub history_from: Option<String>,
    pub history_to: Option<String>,
}

fn default_provider() -> String {
    "openai".to_string()
}
fn default_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_llm_base_url() -> String {
    "https://api.openai.com".to_string()
}
fn default_max_tokens() -> u32 {
    1024
}
fn default_request_timeout() -> u64 {
    60
}
fn default_ingest_db() -> String {
    data_file("ingest.db")
}
fn default_raw_db() -> String {
    data_file("raw.db")
}
fn default_processing_db() -> String {
    data_file("processing.db")
}
fn default_batch_size() -> u32 {
    100
}
fn default_poll_interval() -> u64 {
    300
}
fn default_parallelism() -> usize {
    2
}
fn default_max_retries() -> u32 {
    3
}
fn default_ingest_backoff() -> u64 {
    500
}
fn default_max_attempts() -> u32 {
    3
}
fn default_processing_backoff() -> u64 {
    1000
}
fn default_llm_concurrency() -> usize {
    4
}
fn default_anchor_cap() -> usize {
    3
}
fn default_singleton_min_score() -> f64 {
    0.75
}
fn default_cluster_min_score() -> f64 {
    0.6
}
fn default_supporting_min_score() -> f64 {
    0.5
}
fn default_singleton_min_text_len() -> usize {
    300
}
fn default_out_dir() -> String {
    "./kb_export".to_string()
}

fn data_file(name: &str) -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.gleaner/{name}")
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.gleaner/gleaner.toml")
}

impl GleanerConfig {
    /// Load config from a TOML file with GLEANER_* env var overrides.
    pub fn load(config_path: Option<&str>) -> Result<Self, ConfigError> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: GleanerConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("GLEANER_").split("_"))
            .extract()
            .map_err(|e| ConfigError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ingest.batch_size == 0 {
            return Err(ConfigError("ingest.batch_size must be >= 1".into()));
        }
        if self.ingest.parallelism == 0 {
            return Err(ConfigError("ingest.parallelism must be >= 1".into()));
        }
        if self.processing.max_attempts == 0 {
            return Err(ConfigError("processing.max_attempts must be >= 1".into()));
        }
        if self.processing.llm_concurrency == 0 {
            return Err(ConfigError("processing.llm_concurrency must be >= 1".into()));
        }
        if self.topics.anchor_cap == 0 {
            return Err(ConfigError("topics.anchor_cap must be >= 1".into()));
        }
        for (name, v) in [
            ("topics.singleton_min_score", self.topics.singleton_min_score),
            ("topics.cluster_min_score", self.topics.cluster_min_score),
            ("topics.supporting_min_score", self.topics.supporting_min_score),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(ConfigError(format!("{name} must be within [0, 1]")));
            }
        }
        for src in &self.sources {
            if src.channel_id.is_empty() || src.channel_id.contains(':') {
                return Err(ConfigError(format!(
                    "sources: bad channel_id {:?}",
                    src.channel_id
                )));
            }
        }
        Ok(())
    }
}
