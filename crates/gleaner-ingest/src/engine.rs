use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use gleaner_core::backoff::delay_with_jitter;
use gleaner_core::error::ErrorClass;
use gleaner_core::ident::canonical_ref;
use gleaner_core::json::canonical_string;
use gleaner_core::time::now_iso;
use gleaner_core::types::{
    MessageType, RawMessage, SourceState, SourceStatus, MAX_PAYLOAD_BYTES,
};
use gleaner_store::{
    IngestionStateStore, RawStore, RawUpsertOutcome, SourcePatch, StoreError,
};

use crate::client::{ChatClient, CommentObservation, PostObservation};
use crate::error::{ChatError, IngestError};

/// Write seam over the raw store so failure paths can be exercised without
/// a real database.
pub trait RawSink: Send + Sync {
    fn upsert(&self, raw: &RawMessage) -> Result<RawUpsertOutcome, StoreError>;
}

impl RawSink for RawStore {
    fn upsert(&self, raw: &RawMessage) -> Result<RawUpsertOutcome, StoreError> {
        RawStore::upsert(self, raw)
    }
}

#[derive(Debug, Clone)]
pub struct IngestOptions {
    pub batch_size: u32,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub parallelism: usize,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_retries: 3,
            backoff_base_ms: 500,
            parallelism: 2,
        }
    }
}

/// Counters for one `ingest_source` run.
#[derive(Debug, Clone, Default)]
pub struct IngestReport {
    pub source_id: String,
    pub posts_written: u64,
    pub comments_written: u64,
    pub duplicates: u64,
    pub conflicts: u64,
    pub backfill_completed: bool,
    /// Why the source was skipped, when it was.
    pub skipped: Option<String>,
}

/// Per-source ingestion state machine.
///
/// Raw writes always commit before the cursor that points at them moves;
/// a failure between the two leaves the cursor unchanged and the next run
/// re-fetches and re-upserts idempotently.
pub struct IngestionEngine {
    state: Arc<IngestionStateStore>,
    raw: Arc<dyn RawSink>,
    client: Arc<dyn ChatClient>,
    opts: IngestOptions,
    shutdown: Option<watch::Receiver<bool>>,
}

impl IngestionEngine {
    pub fn new(
        state: Arc<IngestionStateStore>,
        raw: Arc<dyn RawSink>,
        client: Arc<dyn ChatClient>,
        opts: IngestOptions,
    ) -> Self {
        Self {
            state,
            raw,
            client,
            opts,
            shutdown: None,
        }
    }

    /// Install a cooperative cancel signal. In-flight batches finish their
    /// current unit before the engine exits.
    pub fn with_shutdown(mut self, rx: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(rx);
        self
    }

    fn cancelled(&self) -> bool {
        self.shutdown.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
    }

    /// Ingest every registered source with bounded parallelism. One source
    /// is always sequential inside. Results come back sorted by source id.
    pub async fn ingest_all(
        self: &Arc<Self>,
    ) -> Vec<(String, Result<IngestReport, IngestError>)> {
        let sources = match self.state.list_sources() {
            Ok(s) => s,
            Err(e) => return vec![("<sources>".to_string(), Err(e.into()))],
        };

        let sem = Arc::new(tokio::sync::Semaphore::new(self.opts.parallelism));
        let mut join = tokio::task::JoinSet::new();
        for src in sources {
            if self.cancelled() {
                break;
            }
            let engine = Arc::clone(self);
            let sem = Arc::clone(&sem);
            join.spawn(async move {
                let _permit = sem.acquire_owned().await.expect("semaphore closed");
                let id = src.source_id;
                let result = engine.ingest_source(&id).await;
                (id, result)
            });
        }

        let mut out = Vec::new();
        while let Some(res) = join.join_next().await {
            match res {
                Ok(pair) => out.push(pair),
                Err(e) => warn!("ingest task panicked: {e}"),
            }
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Run the state machine for one source until it is caught up, rate
    /// limited, cancelled, or failed.
    pub async fn ingest_source(&self, source_id: &str) -> Result<IngestReport, IngestError> {
        let src = self
            .state
            .load_source(source_id)?
            .ok_or_else(|| IngestError::UnknownSource(source_id.to_string()))?;

        let mut report = IngestReport {
            source_id: source_id.to_string(),
            ..Default::default()
        };

        if src.status != SourceStatus::Active {
            report.skipped = Some(format!("status is {}", src.status));
            return Ok(report);
        }
        if let Some(until) = &src.rate_limit_until {
            if now_iso() < *until {
                debug!(source_id, %until, "source still rate limited");
                report.skipped = Some(format!("rate limited until {until}"));
                return Ok(report);
            }
        }

        self.state.update_source(
            source_id,
            &SourcePatch {
                last_attempt_at: Some(now_iso()),
                ..Default::default()
            },
        )?;

        let backfill = src.backfill_completed_at.is_none() && src.history_from.is_some();
        let batch_size = src.batch_size.unwrap_or(self.opts.batch_size);
        let mut cursor = src.last_post_id;
        let mut comments_enabled = src.include_comments && !src.comments_unavailable;

        info!(
            source_id,
            mode = if backfill { "backfill" } else { "online" },
            since = cursor,
            "ingesting source"
        );

        loop {
            if self.cancelled() {
                info!(source_id, "ingest cancelled");
                break;
            }

            let posts = match self
                .fetch_posts_with_retry(&src.channel_id, cursor, batch_size)
                .await
            {
                Ok(p) => p,
                Err(ChatError::RateLimited { reset_at }) => {
                    self.state.record_attempt(
                        source_id,
                        false,
                        Some(ErrorClass::RateLimited),
                        Some("rate limited"),
                        None,
                    )?;
                    self.state.update_source(
                        source_id,
                        &SourcePatch {
                            rate_limit_until: Some(reset_at.clone()),
                            ..Default::default()
                        },
                    )?;
                    warn!(source_id, reset_at = ?reset_at, "post fetch rate limited");
                    report.skipped = Some("rate limited".to_string());
                    return Ok(report);
                }
                Err(e) => {
                    let fatal = matches!(e, ChatError::Fatal { .. });
                    self.state.record_attempt(
                        source_id,
                        false,
                        Some(e.class()),
                        Some(&e.to_string()),
                        None,
                    )?;
                    self.state.update_source(
                        source_id,
                        &SourcePatch {
                            status: fatal.then_some(SourceStatus::Error),
                            last_error: Some(Some(e.to_string())),
                            fail_count: Some(src.fail_count + 1),
                            ..Default::default()
                        },
                    )?;
                    return Err(e.into());
                }
            };

            if posts.is_empty() {
                if backfill {
                    self.complete_backfill(source_id, &mut report)?;
                }
                break;
            }

            let fetched = posts.len();
            let mut window_consumed = false;
            let mut batch_max_id = cursor;
            let mut to_write: Vec<&PostObservation> = Vec::new();
            for p in &posts {
                if backfill {
                    // Past the window end: stop before this post so the
                    // cursor stays behind it for the first online run.
                    if let Some(to) = &src.history_to {
                        if p.date > *to {
                            window_consumed = true;
                            break;
                        }
                    }
                }
                batch_max_id = batch_max_id.max(p.message_id);
                if backfill {
                    if let Some(from) = &src.history_from {
                        if p.date < *from {
                            continue;
                        }
                    }
                }
                to_write.push(p);
            }

            let mut written: Vec<(i64, Option<i64>)> = Vec::new();
            for p in &to_write {
                let raw = self.normalize_post(&src, p)?;
                match self.raw.upsert(&raw) {
                    Ok(outcome) => {
                        count_outcome(outcome, &mut report, true);
                        written.push((p.message_id, p.thread_id));
                    }
                    Err(e) => {
                        // Cursor stays put: the next run re-fetches this batch.
                        self.state.record_attempt(
                            source_id,
                            false,
                            Some(ErrorClass::Io),
                            Some(&e.to_string()),
                            None,
                        )?;
                        return Err(e.into());
                    }
                }
            }

            let detail = serde_json::json!({
                "fetched": fetched,
                "written": written.len(),
                "batch_max_id": batch_max_id,
            });
            self.state
                .record_attempt(source_id, true, None, None, Some(&detail))?;
            self.state.advance_post_cursor(source_id, batch_max_id)?;
            cursor = batch_max_id;

            if comments_enabled {
                for (post_id, thread) in &written {
                    let thread_id = thread.unwrap_or(*post_id);
                    match self.ingest_thread(&src, thread_id, &mut report).await {
                        Ok(()) => {}
                        Err(IngestError::Chat(ChatError::CommentsUnavailable)) => {
                            warn!(source_id, "comments unavailable, continuing with posts only");
                            self.state.update_source(
                                source_id,
                                &SourcePatch {
                                    comments_unavailable: Some(true),
                                    ..Default::default()
                                },
                            )?;
                            comments_enabled = false;
                            break;
                        }
                        Err(IngestError::Chat(ChatError::RateLimited { reset_at })) => {
                            self.state.update_source(
                                source_id,
                                &SourcePatch {
                                    rate_limit_until: Some(reset_at.clone()),
                                    ..Default::default()
                                },
                            )?;
                            report.skipped = Some("rate limited".to_string());
                            return Ok(report);
                        }
                        Err(e) => return Err(e),
                    }
                }
            }

            if window_consumed {
                self.complete_backfill(source_id, &mut report)?;
                break;
            }
            if fetched < batch_size as usize {
                if backfill {
                    self.complete_backfill(source_id, &mut report)?;
                }
                break;
            }
        }

        self.state.update_source(
            source_id,
            &SourcePatch {
                last_success_at: Some(now_iso()),
                fail_count: Some(0),
                last_error: Some(None),
                ..Default::default()
            },
        )?;
        info!(
            source_id,
            posts = report.posts_written,
            comments = report.comments_written,
            conflicts = report.conflicts,
            "ingest finished"
        );
        Ok(report)
    }

    /// Walk one discussion thread from its comment cursor.
    async fn ingest_thread(
        &self,
        src: &SourceState,
        thread_id: i64,
        report: &mut IngestReport,
    ) -> Result<(), IngestError> {
        let batch_size = src.batch_size.unwrap_or(self.opts.batch_size);
        loop {
            let since = self.state.comment_cursor(&src.source_id, thread_id)?;
            let comments = self
                .fetch_comments_with_retry(&src.channel_id, thread_id, since, batch_size)
                .await?;
            if comments.is_empty() {
                return Ok(());
            }

            let fetched = comments.len();
            let mut max_id = since;
            for c in &comments {
                let raw = self.normalize_comment(src, c)?;
                match self.raw.upsert(&raw) {
                    Ok(outcome) => {
                        count_outcome(outcome, report, false);
                        max_id = max_id.max(c.message_id);
                    }
                    Err(e) => {
                        self.state.record_attempt(
                            &src.source_id,
                            false,
                            Some(ErrorClass::Io),
                            Some(&e.to_string()),
                            None,
                        )?;
                        return Err(e.into());
                    }
                }
            }
            self.state
                .advance_comment_cursor(&src.source_id, thread_id, max_id)?;

            if fetched < batch_size as usize {
                return Ok(());
            }
        }
    }

    fn complete_backfill(
        &self,
        source_id: &str,
        report: &mut IngestReport,
    ) -> Result<(), IngestError> {
        info!(source_id, "backfill window consumed");
        self.state.update_source(
            source_id,
            &SourcePatch {
                backfill_completed_at: Some(Some(now_iso())),
                ..Default::default()
            },
        )?;
        report.backfill_completed = true;
        Ok(())
    }

    async fn fetch_posts_with_retry(
        &self,
        channel_id: &str,
        since_id: i64,
        limit: u32,
    ) -> Result<Vec<PostObservation>, ChatError> {
        let mut attempt = 1u32;
        loop {
            match self
                .client
                .fetch_posts(channel_id, since_id, None, limit)
                .await
            {
                Ok(v) => return Ok(v),
                Err(e @ ChatError::Retryable { .. }) if attempt < self.opts.max_retries => {
                    let delay = delay_with_jitter(self.opts.backoff_base_ms, attempt);
                    warn!(
                        channel_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "retrying post fetch: {e}"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn fetch_comments_with_retry(
        &self,
        channel_id: &str,
        thread_id: i64,
        since_id: i64,
        limit: u32,
    ) -> Result<Vec<CommentObservation>, ChatError> {
        let mut attempt = 1u32;
        loop {
            match self
                .client
                .fetch_comments(channel_id, thread_id, since_id, limit)
                .await
            {
                Ok(v) => return Ok(v),
                Err(e @ ChatError::Retryable { .. }) if attempt < self.opts.max_retries => {
                    let delay = delay_with_jitter(self.opts.backoff_base_ms, attempt);
                    warn!(
                        channel_id,
                        thread_id,
                        attempt,
                        "retrying comment fetch: {e}"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn normalize_post(
        &self,
        src: &SourceState,
        p: &PostObservation,
    ) -> Result<RawMessage, IngestError> {
        let source_ref = canonical_ref(&src.channel_id, MessageType::Post, p.message_id)?;
        let (raw_payload, payload_truncated, payload_size) =
            cap_payload(canonical_string(&p.raw_payload)?);
        Ok(RawMessage {
            source_ref,
            message_id: p.message_id,
            message_type: MessageType::Post,
            channel_id: src.channel_id.clone(),
            date: p.date.clone(),
            text: p.text.clone(),
            thread_id: p.thread_id,
            parent_message_id: None,
            language: p.language.clone(),
            raw_payload,
            payload_truncated,
            payload_size,
            inserted_at: now_iso(),
        })
    }

    fn normalize_comment(
        &self,
        src: &SourceState,
        c: &CommentObservation,
    ) -> Result<RawMessage, IngestError> {
        let source_ref = canonical_ref(&src.channel_id, MessageType::Comment, c.message_id)?;
        let (raw_payload, payload_truncated, payload_size) =
            cap_payload(canonical_string(&c.raw_payload)?);
        Ok(RawMessage {
            source_ref,
            message_id: c.message_id,
            message_type: MessageType::Comment,
            channel_id: src.channel_id.clone(),
            date: c.date.clone(),
            text: c.text.clone(),
            thread_id: Some(c.thread_id),
            parent_message_id: c.parent_message_id,
            language: c.language.clone(),
            raw_payload,
            payload_truncated,
            payload_size,
            inserted_at: now_iso(),
        })
    }
}

fn count_outcome(outcome: RawUpsertOutcome, report: &mut IngestReport, post: bool) {
    match outcome {
        RawUpsertOutcome::Inserted => {
            if post {
                report.posts_written += 1;
            } else {
                report.comments_written += 1;
            }
        }
        RawUpsertOutcome::Duplicate => report.duplicates += 1,
        RawUpsertOutcome::Conflict => report.conflicts += 1,
    }
}

/// Cap the stored payload, keeping the original size on the row.
fn cap_payload(payload: String) -> (String, bool, i64) {
    let size = payload.len() as i64;
    if payload.len() <= MAX_PAYLOAD_BYTES {
        return (payload, false, size);
    }
    let mut cut = MAX_PAYLOAD_BYTES;
    while !payload.is_char_boundary(cut) {
        cut -= 1;
    }
    (payload[..cut].to_string(), true, size)
}
