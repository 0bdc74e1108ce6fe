//! Batch lifecycle: submission, reconciliation and validation fan-in.
//!
//! ```text
//!             submit                 poll                   poll
//! documents ─────────▶ PENDING ─────────────▶ PROCESSING ─────────▶ COMPLETED
//!                                                        └────────▶ FAILED | CANCELLED | EXPIRED
//! ```
//!
//! Local status only ever follows the remote job; nothing is advanced
//! optimistically. On completion `completed_at` is claimed with a
//! compare-and-set before any output is read, so of two pollers racing on
//! the same job exactly one ingests it.
//!
//! With `validate_extractions` on, a completed EXTRACTION job does not
//! ingest its output. It hands each decoded invoice to a VALIDATION job,
//! linked to the parent by document key, and stays PROCESSING until every
//! child is terminal. The children's statuses are then rolled up into the
//! parent by [`rollup_status`].

pub mod aggregate;
pub mod chunk;
pub mod status;

pub use aggregate::{AggregateSummary, Aggregator, DecodedOutput};
pub use chunk::{plan_chunks, Chunk};
pub use status::BatchProgressInfo;

use crate::codec::batch_line::{encode_request, to_inline, RequestContent, RequestContext};
use crate::codec::encode_invoice;
use crate::config::PipelineConfig;
use crate::document::Document;
use crate::error::{BatchErrorEntry, DocumentError, ErrorKind, PipelineError, ServiceError};
use crate::ingest::IngestionEngine;
use crate::ledger::Ledger;
use crate::model::{
    AccountId, BatchItem, BatchJob, BatchLink, BatchPurpose, BatchStatus, CounterDelta,
    PendingInvoice,
};
use crate::notify::{notify_quietly, NotificationKind, Notifier};
use crate::prompts::{COMPACT_EXTRACTION_PROMPT, VALIDATION_PROMPT};
use crate::retry::{Exhausted, RetryPolicy};
use crate::service::{BatchService, JobInput, RemoteJob};
use chrono::Utc;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// What [`BatchManager::submit_documents`] created.
#[derive(Debug, Clone, Serialize)]
pub struct SubmitReceipt {
    /// First accepted batch; the handle most callers need.
    pub batch_id: String,
    /// Every batch created, one per chunk, failed chunks included.
    pub batch_ids: Vec<String>,
    pub documents: usize,
    pub failed_chunks: usize,
}

/// Result of reconciling one batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ReconcileOutcome {
    /// Terminal, or output already claimed; nothing to do.
    Unchanged(BatchStatus),
    /// Remote job still queued or running.
    InFlight(BatchStatus),
    /// Another poller claimed the completion first.
    AlreadyCompleting,
    /// Output ingested.
    Completed(AggregateSummary),
    /// Decoded invoices handed to validation jobs.
    ValidationSpawned {
        children: Vec<String>,
        summary: AggregateSummary,
    },
    /// Remote job ended without output; open items were failed.
    Terminated { status: BatchStatus, failed: u32 },
}

impl ReconcileOutcome {
    fn finished(&self) -> bool {
        matches!(
            self,
            ReconcileOutcome::Completed(_)
                | ReconcileOutcome::ValidationSpawned { .. }
                | ReconcileOutcome::Terminated { .. }
        )
    }
}

/// Counts from one reconciliation sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub users: usize,
    pub checked: usize,
    pub finished: usize,
    pub errors: usize,
}

struct ChunkSubmission {
    batch_id: String,
    accepted: bool,
    detail: Option<String>,
}

/// Parent status once every linked validation job is terminal.
///
/// Any success wins; then any cancellation; then expiry, provided nothing
/// failed; otherwise the parent failed.
pub fn rollup_status(children: &[BatchStatus]) -> BatchStatus {
    let any = |s: BatchStatus| children.contains(&s);
    if any(BatchStatus::Completed) {
        BatchStatus::Completed
    } else if any(BatchStatus::Cancelled) {
        BatchStatus::Cancelled
    } else if any(BatchStatus::Expired) && !any(BatchStatus::Failed) {
        BatchStatus::Expired
    } else {
        BatchStatus::Failed
    }
}

/// Submits documents as remote jobs and reconciles them into the ledger.
pub struct BatchManager {
    config: PipelineConfig,
    ledger: Arc<dyn Ledger>,
    service: Arc<dyn BatchService>,
    engine: IngestionEngine,
    notifier: Arc<dyn Notifier>,
    retry: RetryPolicy,
}

impl BatchManager {
    pub fn new(
        config: PipelineConfig,
        ledger: Arc<dyn Ledger>,
        service: Arc<dyn BatchService>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            engine: IngestionEngine::from_config(&config),
            retry: RetryPolicy::from_config(&config),
            config,
            ledger,
            service,
            notifier,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn aggregator(&self) -> Aggregator<'_> {
        Aggregator {
            config: &self.config,
            ledger: self.ledger.as_ref(),
            service: self.service.as_ref(),
            engine: &self.engine,
            notifier: &self.notifier,
            retry: &self.retry,
        }
    }

    // ── Submission ───────────────────────────────────────────────────────

    /// Submit documents as one or more remote EXTRACTION jobs.
    ///
    /// Returns once the jobs exist; extraction and ingestion happen later,
    /// through [`BatchManager::reconcile`]. Documents owned by different
    /// accounts never share a batch.
    ///
    /// # Errors
    /// [`PipelineError::EmptySubmission`] for no documents, and
    /// [`PipelineError::JobSubmissionFailed`] when no chunk could be
    /// submitted at all. Failed chunks are still recorded as FAILED batches.
    pub async fn submit_documents(
        &self,
        user_id: &str,
        documents: Vec<Document>,
    ) -> Result<SubmitReceipt, PipelineError> {
        if documents.is_empty() {
            return Err(PipelineError::EmptySubmission);
        }
        let total = documents.len();
        let ctx = RequestContext {
            prompt: self
                .config
                .system_prompt
                .as_deref()
                .unwrap_or(COMPACT_EXTRACTION_PROMPT),
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };
        let names: HashMap<String, String> = documents
            .iter()
            .map(|d| (d.key.clone(), d.file_name.clone()))
            .collect();

        // A batch carries one account, so documents are chunked per account.
        let mut groups: Vec<(Option<AccountId>, Vec<(String, serde_json::Value)>)> = Vec::new();
        for d in &documents {
            let request = (
                d.key.clone(),
                encode_request(&d.key, RequestContent::Pdf(&d.bytes), &ctx),
            );
            match groups.iter_mut().find(|(account, _)| *account == d.account) {
                Some((_, requests)) => requests.push(request),
                None => groups.push((d.account, vec![request])),
            }
        }
        drop(documents);

        let mut chunks: Vec<(Option<AccountId>, Chunk)> = Vec::new();
        for (account, requests) in groups {
            for chunk in plan_chunks(requests, self.config.chunk_max_bytes) {
                chunks.push((account, chunk));
            }
        }
        for (index, (_, chunk)) in chunks.iter_mut().enumerate() {
            chunk.index = index;
        }
        info!(user = user_id, documents = total, chunks = chunks.len(), "Submitting batch");

        let mut batch_ids = Vec::with_capacity(chunks.len());
        let mut accepted = Vec::new();
        let mut last_failure = None;
        for (account, chunk) in &chunks {
            let sub = self
                .submit_chunk(
                    user_id,
                    *account,
                    BatchPurpose::Extraction,
                    chunk,
                    &names,
                    &HashMap::new(),
                )
                .await?;
            if sub.accepted {
                accepted.push(sub.batch_id.clone());
            } else {
                last_failure = sub.detail.clone();
            }
            batch_ids.push(sub.batch_id);
        }

        let Some(first) = accepted.first().cloned() else {
            return Err(PipelineError::JobSubmissionFailed {
                chunk: 0,
                documents: total,
                detail: last_failure.unwrap_or_else(|| "no chunk was accepted".to_string()),
            });
        };
        Ok(SubmitReceipt {
            batch_id: first,
            failed_chunks: batch_ids.len() - accepted.len(),
            batch_ids,
            documents: total,
        })
    }

    /// Run [`BatchManager::submit_documents`] on a background task.
    pub fn submit_documents_detached(
        self: &Arc<Self>,
        user_id: String,
        documents: Vec<Document>,
    ) -> JoinHandle<Result<SubmitReceipt, PipelineError>> {
        let manager = Arc::clone(self);
        tokio::spawn(async move { manager.submit_documents(&user_id, documents).await })
    }

    /// Create the remote job for one chunk and its local records.
    ///
    /// A chunk the service would not take is recorded as a FAILED batch
    /// under a local id, with every item failed.
    async fn submit_chunk(
        &self,
        user_id: &str,
        account: Option<AccountId>,
        purpose: BatchPurpose,
        chunk: &Chunk,
        names: &HashMap<String, String>,
        payloads: &HashMap<String, String>,
    ) -> Result<ChunkSubmission, PipelineError> {
        let display_name = format!(
            "{}-{}-{}",
            purpose.as_str().to_lowercase(),
            Utc::now().format("%Y%m%d%H%M%S"),
            chunk.index
        );
        let created = self.create_remote(&display_name, chunk).await;

        let items_for = |batch_id: &str| -> Vec<BatchItem> {
            chunk
                .keys
                .iter()
                .map(|key| {
                    let mut item = BatchItem::new(
                        batch_id,
                        key.clone(),
                        names.get(key).cloned().unwrap_or_else(|| key.clone()),
                    );
                    item.extracted_payload = payloads.get(key).cloned();
                    item
                })
                .collect()
        };
        let size = chunk.len() as u32;

        match created {
            Ok(remote) => {
                let mut job = BatchJob::new(remote.id.clone(), user_id, account, purpose, size);
                let status = remote.state.local();
                if !status.is_terminal() {
                    job.status = status;
                }
                if job.status == BatchStatus::Processing {
                    job.started_at = Some(Utc::now());
                }
                let items = items_for(&job.id);
                self.ledger.insert_batch(&job).await?;
                self.ledger.insert_items(&items).await?;
                if purpose == BatchPurpose::Extraction {
                    let now = Utc::now();
                    let pending: Vec<PendingInvoice> = items
                        .iter()
                        .map(|i| PendingInvoice {
                            document_key: i.document_key.clone(),
                            batch_id: job.id.clone(),
                            user_id: user_id.to_string(),
                            file_name: i.file_name.clone(),
                            created_at: now,
                        })
                        .collect();
                    self.ledger.insert_pending(&pending).await?;
                }
                info!(
                    batch_id = %job.id,
                    purpose = purpose.as_str(),
                    documents = size,
                    bytes = chunk.bytes,
                    "Batch job created"
                );
                Ok(ChunkSubmission {
                    batch_id: job.id,
                    accepted: true,
                    detail: None,
                })
            }
            Err(exhausted) => {
                let detail = exhausted.to_string();
                let mut job = BatchJob::new(
                    Uuid::new_v4().to_string(),
                    user_id,
                    account,
                    purpose,
                    size,
                );
                job.status = BatchStatus::Failed;
                error!(
                    batch_id = %job.id,
                    chunk = chunk.index,
                    documents = size,
                    error = %detail,
                    "Chunk submission failed"
                );
                self.ledger.insert_batch(&job).await?;
                self.ledger.insert_items(&items_for(&job.id)).await?;
                let entry = BatchErrorEntry::new(
                    ErrorKind::ExtractionError,
                    format!("Job submission failed: {detail}"),
                );
                self.ledger.fail_unprocessed_items(&job.id, &entry).await?;
                self.ledger.force_batch_status(&job.id, BatchStatus::Failed).await?;
                notify_quietly(
                    &self.notifier,
                    user_id,
                    &format!("{size} documents could not be submitted: {detail}"),
                    NotificationKind::BatchFailed,
                    Some(&job.id),
                )
                .await;
                Ok(ChunkSubmission {
                    batch_id: job.id,
                    accepted: false,
                    detail: Some(detail),
                })
            }
        }
    }

    /// Upload (unless the chunk fits inline) and create the remote job.
    async fn create_remote(
        &self,
        display_name: &str,
        chunk: &Chunk,
    ) -> Result<RemoteJob, Exhausted<ServiceError>> {
        let input = if chunk.bytes <= self.config.inline_payload_max_bytes {
            JobInput::Inline {
                requests: chunk.requests.iter().map(to_inline).collect(),
            }
        } else {
            let file_name = self
                .retry
                .run(
                    "upload_file",
                    || self.service.upload_file(display_name, chunk.to_jsonl()),
                    ServiceError::class,
                )
                .await?;
            JobInput::File { file_name }
        };
        self.retry
            .run(
                "create_job",
                || self.service.create_job(display_name, input.clone()),
                ServiceError::class,
            )
            .await
    }

    // ── Reconciliation ───────────────────────────────────────────────────

    /// Bring one batch in line with its remote job.
    pub async fn reconcile(&self, batch_id: &str) -> Result<ReconcileOutcome, PipelineError> {
        let job = self
            .ledger
            .get_batch(batch_id)
            .await?
            .ok_or_else(|| PipelineError::BatchNotFound {
                id: batch_id.to_string(),
            })?;
        if job.status.is_terminal() || job.completed_at.is_some() {
            return Ok(ReconcileOutcome::Unchanged(job.status));
        }

        let remote = self
            .retry
            .run(
                "get_job",
                || self.service.get_job(&job.id),
                ServiceError::class,
            )
            .await
            .map_err(|e| PipelineError::Service(e.error))?;

        match remote.state.local() {
            BatchStatus::Pending => Ok(ReconcileOutcome::InFlight(BatchStatus::Pending)),
            BatchStatus::Processing => {
                if job.status != BatchStatus::Processing {
                    self.ledger
                        .set_batch_status(&job.id, BatchStatus::Processing)
                        .await?;
                    info!(batch_id = %job.id, "Batch processing");
                }
                Ok(ReconcileOutcome::InFlight(BatchStatus::Processing))
            }
            BatchStatus::Completed => self.complete(&job, &remote).await,
            terminal => self.terminate(&job, terminal, remote.error.as_deref()).await,
        }
    }

    async fn complete(
        &self,
        job: &BatchJob,
        remote: &RemoteJob,
    ) -> Result<ReconcileOutcome, PipelineError> {
        if !self
            .ledger
            .mark_completed_at_if_unset(&job.id, Utc::now())
            .await?
        {
            debug!(batch_id = %job.id, "Completion already claimed");
            return Ok(ReconcileOutcome::AlreadyCompleting);
        }
        info!(batch_id = %job.id, purpose = job.purpose.as_str(), "Remote job completed, aggregating");

        match self.aggregate_output(job, remote).await {
            Ok(ReconcileOutcome::Completed(summary)) => {
                let status = if summary.circuit_breaker_tripped {
                    BatchStatus::Failed
                } else {
                    BatchStatus::Completed
                };
                self.ledger.set_batch_status(&job.id, status).await?;
                self.ledger.clear_pending_for_batch(&job.id).await?;
                if status == BatchStatus::Failed {
                    notify_quietly(
                        &self.notifier,
                        &job.user_id,
                        "Batch stopped after repeated failures",
                        NotificationKind::BatchFailed,
                        Some(&job.id),
                    )
                    .await;
                }
                info!(batch_id = %job.id, status = %status, "Batch finished");
                if job.purpose == BatchPurpose::Validation {
                    self.rollup_parent(&job.id).await?;
                }
                Ok(ReconcileOutcome::Completed(summary))
            }
            Ok(spawned) => Ok(spawned),
            Err(fatal) => {
                error!(batch_id = %job.id, error = %fatal, "Job output could not be processed");
                let entry = BatchErrorEntry::new(
                    ErrorKind::Unknown,
                    format!("Job output could not be processed: {fatal}"),
                );
                self.ledger.fail_unprocessed_items(&job.id, &entry).await?;
                self.ledger
                    .set_batch_status(&job.id, BatchStatus::Completed)
                    .await?;
                self.ledger.clear_pending_for_batch(&job.id).await?;
                notify_quietly(
                    &self.notifier,
                    &job.user_id,
                    &format!("Batch output could not be processed: {fatal}"),
                    NotificationKind::BatchFailed,
                    Some(&job.id),
                )
                .await;
                if job.purpose == BatchPurpose::Validation {
                    self.rollup_parent(&job.id).await?;
                }
                Err(fatal)
            }
        }
    }

    /// Decode the output, then either ingest it or hand it to validation.
    async fn aggregate_output(
        &self,
        job: &BatchJob,
        remote: &RemoteJob,
    ) -> Result<ReconcileOutcome, PipelineError> {
        let aggregator = self.aggregator();
        let mut decoded = aggregator.decode(job, remote).await?;
        if job.purpose == BatchPurpose::Extraction && self.config.validate_extractions {
            let (children, rest) = self.spawn_validation(job, decoded).await?;
            if !children.is_empty() {
                self.ledger
                    .set_batch_status(&job.id, BatchStatus::Processing)
                    .await?;
                let summary = aggregator.ingest(job, rest).await?;
                return Ok(ReconcileOutcome::ValidationSpawned { children, summary });
            }
            decoded = rest;
        }
        let summary = aggregator.ingest(job, decoded).await?;
        Ok(ReconcileOutcome::Completed(summary))
    }

    /// Submit validation jobs for every decoded invoice.
    ///
    /// Returns the accepted child batch ids and the entries the parent must
    /// still ingest itself: failures, plus successes whose validation chunk
    /// was refused.
    async fn spawn_validation(
        &self,
        job: &BatchJob,
        decoded: DecodedOutput,
    ) -> Result<(Vec<String>, DecodedOutput), PipelineError> {
        let (ok, mut rest): (Vec<_>, Vec<_>) =
            decoded.entries.into_iter().partition(|e| e.result.is_ok());
        let mut children = Vec::new();

        if !ok.is_empty() {
            let ctx = RequestContext {
                prompt: VALIDATION_PROMPT,
                temperature: self.config.temperature,
                max_tokens: self.config.max_tokens,
            };
            let mut names = HashMap::new();
            let mut payloads = HashMap::new();
            let mut requests = Vec::with_capacity(ok.len());
            for entry in &ok {
                if let Ok(invoice) = &entry.result {
                    let key = entry.item.document_key.clone();
                    let payload = encode_invoice(invoice);
                    requests.push((
                        key.clone(),
                        encode_request(&key, RequestContent::Text(&payload), &ctx),
                    ));
                    names.insert(key.clone(), entry.item.file_name.clone());
                    payloads.insert(key, payload);
                }
            }

            let mut handed_off: HashSet<String> = HashSet::new();
            for chunk in plan_chunks(requests, self.config.chunk_max_bytes) {
                let sub = self
                    .submit_chunk(
                        &job.user_id,
                        job.account,
                        BatchPurpose::Validation,
                        &chunk,
                        &names,
                        &payloads,
                    )
                    .await?;
                if !sub.accepted {
                    warn!(parent = %job.id, documents = chunk.len(), "Validation chunk refused, ingesting extraction directly");
                    continue;
                }
                let links: Vec<BatchLink> = chunk
                    .keys
                    .iter()
                    .map(|key| BatchLink {
                        parent_batch_id: job.id.clone(),
                        child_batch_id: sub.batch_id.clone(),
                        document_key: key.clone(),
                    })
                    .collect();
                self.ledger.insert_links(&links).await?;
                handed_off.extend(chunk.keys.iter().cloned());
                children.push(sub.batch_id);
            }

            for entry in ok {
                if handed_off.contains(&entry.item.document_key) {
                    self.ledger
                        .record_item_outcome(
                            &job.id,
                            &entry.item.document_key,
                            CounterDelta::success(),
                            None,
                        )
                        .await?;
                } else {
                    rest.push(entry);
                }
            }
            info!(parent = %job.id, children = children.len(), documents = handed_off.len(), "Validation jobs spawned");
        }

        Ok((
            children,
            DecodedOutput {
                entries: rest,
                stray: decoded.stray,
                artifact: decoded.artifact,
            },
        ))
    }

    async fn terminate(
        &self,
        job: &BatchJob,
        status: BatchStatus,
        remote_error: Option<&str>,
    ) -> Result<ReconcileOutcome, PipelineError> {
        if !self.ledger.set_batch_status(&job.id, status).await? {
            return Ok(ReconcileOutcome::Unchanged(job.status));
        }
        let mut entry = BatchErrorEntry::from_document_error(
            &DocumentError::BatchTerminated {
                status: status.to_string(),
            },
            None,
        );
        if let Some(detail) = remote_error {
            entry.message = format!("{} ({detail})", entry.message);
        }
        let failed = self.ledger.fail_unprocessed_items(&job.id, &entry).await?;
        self.ledger
            .mark_completed_at_if_unset(&job.id, Utc::now())
            .await?;
        self.ledger.clear_pending_for_batch(&job.id).await?;
        for item in self.ledger.list_items(&job.id).await? {
            self.ledger.clear_pending(&item.document_key).await?;
        }
        warn!(batch_id = %job.id, status = %status, failed, "Batch terminated remotely");

        if status != BatchStatus::Cancelled {
            notify_quietly(
                &self.notifier,
                &job.user_id,
                &format!("Batch {status}: {failed} documents were not processed"),
                NotificationKind::BatchFailed,
                Some(&job.id),
            )
            .await;
        }
        if job.purpose == BatchPurpose::Validation {
            self.rollup_parent(&job.id).await?;
        }
        Ok(ReconcileOutcome::Terminated { status, failed })
    }

    /// Fold the children's statuses into the parent once all are terminal.
    async fn rollup_parent(&self, child_id: &str) -> Result<Option<BatchStatus>, PipelineError> {
        let Some(parent_id) = self.ledger.parent_of(child_id).await? else {
            return Ok(None);
        };
        let mut seen = HashSet::new();
        let mut statuses = Vec::new();
        for link in self.ledger.links_for_parent(&parent_id).await? {
            if !seen.insert(link.child_batch_id.clone()) {
                continue;
            }
            match self.ledger.get_batch(&link.child_batch_id).await? {
                Some(child) if !child.status.is_terminal() => {
                    debug!(parent = %parent_id, child = %child.id, "Validation still running");
                    return Ok(None);
                }
                Some(child) => statuses.push(child.status),
                None => warn!(parent = %parent_id, child = %link.child_batch_id, "Linked validation batch missing"),
            }
        }
        let status = rollup_status(&statuses);
        self.ledger.force_batch_status(&parent_id, status).await?;
        info!(parent = %parent_id, status = %status, children = statuses.len(), "Validation rolled up");
        if status != BatchStatus::Completed {
            if let Some(parent) = self.ledger.get_batch(&parent_id).await? {
                notify_quietly(
                    &self.notifier,
                    &parent.user_id,
                    &format!("Validation {status} for batch {parent_id}"),
                    NotificationKind::BatchFailed,
                    Some(&parent_id),
                )
                .await;
            }
        }
        Ok(Some(status))
    }

    /// Reconcile every active batch, user by user with a pause between users.
    ///
    /// Errors on one batch are logged and counted; the sweep carries on.
    pub async fn reconcile_all(&self) -> Result<SweepReport, PipelineError> {
        let active = self.ledger.list_active_batches().await?;
        let mut by_user: Vec<(String, Vec<BatchJob>)> = Vec::new();
        for job in active {
            match by_user.iter_mut().find(|(user, _)| *user == job.user_id) {
                Some((_, jobs)) => jobs.push(job),
                None => by_user.push((job.user_id.clone(), vec![job])),
            }
        }

        let mut report = SweepReport {
            users: by_user.len(),
            ..SweepReport::default()
        };
        let stagger = Duration::from_millis(self.config.admin_stagger_ms);
        for (i, (user, jobs)) in by_user.into_iter().enumerate() {
            if i > 0 && !stagger.is_zero() {
                tokio::time::sleep(stagger).await;
            }
            debug!(user = %user, batches = jobs.len(), "Reconciling user batches");
            for job in jobs {
                report.checked += 1;
                match self.reconcile(&job.id).await {
                    Ok(outcome) if outcome.finished() => report.finished += 1,
                    Ok(_) => {}
                    Err(e) => {
                        report.errors += 1;
                        error!(batch_id = %job.id, user = %user, error = %e, "Reconciliation failed");
                    }
                }
            }
        }
        if report.checked > 0 {
            info!(
                users = report.users,
                checked = report.checked,
                finished = report.finished,
                errors = report.errors,
                "Reconciliation sweep done"
            );
        }
        Ok(report)
    }

    /// Sweep every `poll_interval_secs` until `shutdown` resolves.
    pub async fn run_poller<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.poll_interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);
        info!(interval_secs = self.config.poll_interval_secs, "Poller started");
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Poller stopping");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.reconcile_all().await {
                        error!(error = %e, "Reconciliation sweep failed");
                    }
                }
            }
        }
    }

    /// Request remote cancellation and close the batch locally.
    ///
    /// Returns `false` when the batch was already terminal. Work already in
    /// flight is not aborted; its late results no longer change counters.
    pub async fn cancel_batch(&self, batch_id: &str) -> Result<bool, PipelineError> {
        let job = self
            .ledger
            .get_batch(batch_id)
            .await?
            .ok_or_else(|| PipelineError::BatchNotFound {
                id: batch_id.to_string(),
            })?;
        if job.status.is_terminal() {
            return Ok(false);
        }
        self.retry
            .run(
                "cancel_job",
                || self.service.cancel_job(&job.id),
                ServiceError::class,
            )
            .await
            .map_err(|e| PipelineError::Service(e.error))?;
        let outcome = self
            .terminate(&job, BatchStatus::Cancelled, Some("cancelled by user"))
            .await?;
        Ok(matches!(outcome, ReconcileOutcome::Terminated { .. }))
    }

    // ── Status views ─────────────────────────────────────────────────────

    /// Non-terminal batches of a user, newest first.
    pub async fn get_active_batches(
        &self,
        user_id: &str,
    ) -> Result<Vec<BatchProgressInfo>, PipelineError> {
        let jobs = self.ledger.list_batches_for_user(user_id).await?;
        Ok(status::active_view(&jobs))
    }

    /// Terminal batches of a user, grouped into upload sessions.
    pub async fn get_batch_history(
        &self,
        user_id: &str,
    ) -> Result<Vec<BatchProgressInfo>, PipelineError> {
        let jobs = self.ledger.list_batches_for_user(user_id).await?;
        Ok(status::history_view(
            &jobs,
            chrono::Duration::seconds(self.config.history_group_window_secs as i64),
        ))
    }

    pub async fn pending_invoices(
        &self,
        user_id: &str,
    ) -> Result<Vec<PendingInvoice>, PipelineError> {
        Ok(self.ledger.list_pending(user_id).await?)
    }
}
