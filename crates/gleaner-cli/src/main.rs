use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info};

use gleaner_core::GleanerConfig;
use gleaner_ingest::{ExportChatClient, IngestOptions, IngestionEngine, RawSink};
use gleaner_llm::{LlmClient, OpenAiClient};
use gleaner_process::{ProcessOptions, ProcessingEngine};
use gleaner_store::ingest_state::NewSource;
use gleaner_store::{IngestionStateStore, ProcessingStore, RawStore};
use gleaner_topics::{Exporter, TopicizeEngine, TopicizeOptions};

#[derive(Parser)]
#[command(name = "gleaner", version, about = "Distill Telegram channels into a knowledge base")]
struct Cli {
    /// Config file (default: ~/.gleaner/gleaner.toml, GLEANER_* env overrides)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch new posts (and comments) into the raw store
    Ingest {
        /// Source to ingest; all registered sources when omitted
        source: Option<String>,
    },
    /// Turn pending raw messages into processed documents
    Process {
        #[arg(long)]
        channel: Option<String>,
    },
    /// Group processed documents into topic cards and bundles
    Topicize {
        #[arg(long)]
        channel: Option<String>,
    },
    /// Write kb_entries.ndjson, topics.json and per-topic files
    Export {
        #[arg(long)]
        out_dir: Option<String>,
    },
    /// End to end: ingest, process, topicize, export
    Run,
}

#[derive(Debug, thiserror::Error)]
enum RunError {
    #[error("{0}")]
    Config(String),

    #[error(transparent)]
    Op(#[from] anyhow::Error),
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gleaner=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = match GleanerConfig::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            error!("{e}");
            return ExitCode::from(2);
        }
    };

    match run(cli.command, config).await {
        // Partial failures (failure rows, per-source errors) exit 1.
        Ok(clean) => {
            if clean {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(1)
            }
        }
        Err(RunError::Config(msg)) => {
            error!("configuration error: {msg}");
            ExitCode::from(2)
        }
        Err(RunError::Op(e)) => {
            error!("{e:#}");
            ExitCode::from(1)
        }
    }
}

async fn run(command: Command, config: GleanerConfig) -> Result<bool, RunError> {
    let app = App::open(config)?;

    let (tx, shutdown) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested, finishing current unit");
            let _ = tx.send(true);
        }
    });

    match command {
        Command::Ingest { source } => app.ingest(source, shutdown).await,
        Command::Process { channel } => app.process(channel.as_deref(), shutdown).await,
        Command::Topicize { channel } => app.topicize(channel.as_deref()).await,
        Command::Export { out_dir } => app.export(out_dir),
        Command::Run => {
            let mut clean = app.ingest(None, shutdown.clone()).await?;
            clean &= app.process(None, shutdown).await?;
            clean &= app.topicize(None).await?;
            clean &= app.export(None)?;
            Ok(clean)
        }
    }
}

struct App {
    config: GleanerConfig,
    state: Arc<IngestionStateStore>,
    raw: Arc<RawStore>,
    processing: Arc<ProcessingStore>,
}

impl App {
    fn open(config: GleanerConfig) -> Result<Self, RunError> {
        let state = Arc::new(
            IngestionStateStore::open(&config.stores.ingest_path).map_err(anyhow::Error::from)?,
        );
        let raw =
            Arc::new(RawStore::open(&config.stores.raw_path).map_err(anyhow::Error::from)?);
        let processing = Arc::new(
            ProcessingStore::open(&config.stores.processing_path).map_err(anyhow::Error::from)?,
        );

        let app = Self {
            config,
            state,
            raw,
            processing,
        };
        app.sync_sources()?;
        Ok(app)
    }

    /// Mirror `[[sources]]` config entries into the ingestion-state store.
    fn sync_sources(&self) -> Result<(), RunError> {
        for entry in &self.config.sources {
            self.state
                .register_source(&NewSource {
                    source_id: entry.channel_id.clone(),
                    channel_id: entry.channel_id.clone(),
                    channel_username: entry.channel_username.clone(),
                    include_comments: entry.include_comments,
                    history_from: entry.history_from.clone(),
                    history_to: entry.history_to.clone(),
                    batch_size: None,
                    poll_interval_secs: None,
                })
                .map_err(anyhow::Error::from)?;
        }
        Ok(())
    }

    fn chat_client(&self) -> Result<Arc<dyn gleaner_ingest::ChatClient>, RunError> {
        match &self.config.ingest.export_dir {
            Some(dir) => Ok(Arc::new(ExportChatClient::new(dir.clone()))),
            None => Err(RunError::Config(
                "no chat transport configured; set ingest.export_dir".to_string(),
            )),
        }
    }

    fn llm_client(&self) -> Result<Arc<dyn LlmClient>, RunError> {
        let llm = &self.config.llm;
        match llm.provider.as_str() {
            "openai" | "openai-compat" => {
                let client = OpenAiClient::new(
                    llm.api_key.clone(),
                    llm.base_url.clone(),
                    llm.model.clone(),
                    llm.request_timeout_secs,
                )
                .map_err(|e| RunError::Config(e.to_string()))?;
                Ok(Arc::new(client))
            }
            other => Err(RunError::Config(format!("unknown LLM provider: {other}"))),
        }
    }

    async fn ingest(
        &self,
        source: Option<String>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<bool, RunError> {
        let chat = self.chat_client()?;
        let sink: Arc<dyn RawSink> = self.raw.clone();
        let opts = IngestOptions {
            batch_size: self.config.ingest.batch_size,
            max_retries: self.config.ingest.max_retries,
            backoff_base_ms: self.config.ingest.backoff_base_ms,
            parallelism: self.config.ingest.parallelism,
        };
        let engine = Arc::new(
            IngestionEngine::new(self.state.clone(), sink, chat, opts).with_shutdown(shutdown),
        );

        match source {
            Some(id) => match engine.ingest_source(&id).await {
                Ok(report) => {
                    info!(
                        source_id = %id,
                        posts = report.posts_written,
                        comments = report.comments_written,
                        "ingest done"
                    );
                    Ok(true)
                }
                Err(e) => {
                    error!(source_id = %id, "ingest failed: {e}");
                    Ok(false)
                }
            },
            None => {
                let mut clean = true;
                for (id, result) in engine.ingest_all().await {
                    match result {
                        Ok(report) => info!(
                            source_id = %id,
                            posts = report.posts_written,
                            comments = report.comments_written,
                            skipped = report.skipped.as_deref().unwrap_or(""),
                            "ingest done"
                        ),
                        Err(e) => {
                            error!(source_id = %id, "ingest failed: {e}");
                            clean = false;
                        }
                    }
                }
                Ok(clean)
            }
        }
    }

    async fn process(
        &self,
        channel: Option<&str>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<bool, RunError> {
        let llm = self.llm_client()?;
        let opts = ProcessOptions {
            max_attempts: self.config.processing.max_attempts,
            backoff_base_ms: self.config.processing.backoff_base_ms,
            llm_concurrency: self.config.processing.llm_concurrency,
            max_tokens: self.config.llm.max_tokens,
            ..Default::default()
        };
        let engine = Arc::new(
            ProcessingEngine::new(self.raw.clone(), self.processing.clone(), llm, opts)
                .with_shutdown(shutdown),
        );
        let report = engine
            .process_pending(channel)
            .await
            .map_err(anyhow::Error::from)?;
        info!(
            pending = report.pending,
            processed = report.processed,
            failed = report.failed,
            "processing done"
        );
        Ok(report.failed == 0)
    }

    async fn topicize(&self, channel: Option<&str>) -> Result<bool, RunError> {
        let llm = self.llm_client()?;
        let opts = TopicizeOptions {
            anchor_cap: self.config.topics.anchor_cap,
            singleton_min_score: self.config.topics.singleton_min_score,
            cluster_min_score: self.config.topics.cluster_min_score,
            supporting_min_score: self.config.topics.supporting_min_score,
            singleton_min_text_len: self.config.topics.singleton_min_text_len,
            max_tokens: self.config.llm.max_tokens,
        };
        let engine = TopicizeEngine::new(self.processing.clone(), llm, opts);
        let report = engine
            .topicize(channel)
            .await
            .map_err(anyhow::Error::from)?;
        info!(
            candidates = report.candidates,
            accepted = report.accepted,
            rejected = report.rejected,
            "topicization done"
        );
        Ok(true)
    }

    fn export(&self, out_dir: Option<String>) -> Result<bool, RunError> {
        let out_dir = out_dir.unwrap_or_else(|| self.config.export.out_dir.clone());
        let exporter = Exporter::new(self.processing.clone(), self.state.clone(), out_dir);
        let report = exporter.export().map_err(anyhow::Error::from)?;
        info!(
            messages = report.message_entries,
            topics = report.topic_entries,
            out_dir = %report.out_dir.display(),
            "export done"
        );
        Ok(true)
    }
}
