//! Integration tests for invoice-pipeline.
//!
//! Everything runs against the in-memory ledger, a table-driven extractor
//! and a scripted batch service, so no API key or database is needed:
//!
//!   cargo test --test pipeline

use async_trait::async_trait;
use chrono::NaiveDate;
use invoice_pipeline::codec::{encode_invoice, ExtractedProvider};
use invoice_pipeline::error::ServiceError;
use invoice_pipeline::notify::{NotificationKind, NotifyError};
use invoice_pipeline::service::{JobInput, JobOutput, RemoteJob, RemoteState};
use invoice_pipeline::{
    BatchManager, BatchPurpose, BatchService, BatchStatus, Document, DocumentError,
    DocumentExtractor, ErrorKind, ExtractedInvoice, ExtractedItem, Ledger, MemoryLedger,
    Notifier, OutcomeStatus, PipelineConfig, PipelineError, ReconcileOutcome, SyncUploader,
};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

// ── Test helpers ─────────────────────────────────────────────────────────────

fn invoice(code: &str, provider: &str, issued: &str, price: &str) -> ExtractedInvoice {
    let price = Decimal::from_str(price).unwrap();
    ExtractedInvoice {
        invoice_code: code.into(),
        issue_date: NaiveDate::parse_from_str(issued, "%Y-%m-%d").unwrap(),
        total_amount: price,
        provider: ExtractedProvider {
            name: provider.into(),
            cif: Some(format!("B{:08}", provider.len())),
            ..Default::default()
        },
        client: None,
        items: vec![ExtractedItem {
            material_name: Some("Cemento gris".into()),
            is_material: true,
            quantity: Some(Decimal::ONE),
            unit_price: Some(price),
            total_price: Some(price),
            ..Default::default()
        }],
    }
}

fn pdf(key: &str, account: Uuid) -> Document {
    Document::from_bytes(format!("{key}.pdf"), b"%PDF-1.7\n%test".to_vec())
        .unwrap()
        .with_key(key)
        .with_account(account)
}

/// `RUST_LOG=invoice_pipeline=debug cargo test` shows the pipeline's logs.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn config() -> invoice_pipeline::PipelineConfigBuilder {
    init_tracing();
    PipelineConfig::builder()
        .max_retries(0)
        .admin_stagger_ms(0)
        .output_stability(2, 10, 2_000)
        .blocked_providers(["Bloqueado SA"])
}

#[derive(Default)]
struct Recorder(Mutex<Vec<NotificationKind>>);

impl Recorder {
    fn kinds(&self) -> Vec<NotificationKind> {
        self.0.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for Recorder {
    async fn notify(
        &self,
        _user_id: &str,
        _message: &str,
        kind: NotificationKind,
        _related_id: Option<&str>,
    ) -> Result<(), NotifyError> {
        self.0.lock().unwrap().push(kind);
        Ok(())
    }
}

/// Extractor answering from a table keyed by document key.
struct TableExtractor {
    answers: HashMap<String, ExtractedInvoice>,
    calls: AtomicUsize,
}

#[async_trait]
impl DocumentExtractor for TableExtractor {
    async fn extract(&self, document: &Document) -> Result<ExtractedInvoice, DocumentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.answers
            .get(&document.key)
            .cloned()
            .ok_or_else(|| DocumentError::Extraction {
                retries: 0,
                detail: "model returned nothing".into(),
            })
    }
}

/// Batch service whose jobs only move when the test says so.
#[derive(Default)]
struct ScriptedService {
    /// Response text per document key.
    answers: HashMap<String, String>,
    /// Keys answered with an error record.
    error_keys: HashSet<String>,
    /// Serve output as a downloadable file instead of inline.
    file_output: bool,
    refuse_jobs: AtomicBool,
    jobs: Mutex<HashMap<String, (RemoteState, Vec<String>)>>,
    uploads: Mutex<HashMap<String, Vec<u8>>>,
    next_id: AtomicUsize,
    cancelled: Mutex<Vec<String>>,
}

impl ScriptedService {
    fn answering(answers: &[(&str, ExtractedInvoice)]) -> Self {
        Self {
            answers: answers
                .iter()
                .map(|(k, inv)| (k.to_string(), encode_invoice(inv)))
                .collect(),
            ..Self::default()
        }
    }

    fn set_state(&self, id: &str, state: RemoteState) {
        if let Some(job) = self.jobs.lock().unwrap().get_mut(id) {
            job.0 = state;
        }
    }

    fn succeed_all(&self) {
        for job in self.jobs.lock().unwrap().values_mut() {
            job.0 = RemoteState::Succeeded;
        }
    }

    fn job_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.jobs.lock().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn record(&self, key: &str, inline: bool) -> Value {
        let mut record = match (self.error_keys.contains(key), self.answers.get(key)) {
            (false, Some(text)) => json!({
                "response": {
                    "candidates": [{
                        "content": { "parts": [{ "text": text }] },
                        "finishReason": "STOP"
                    }]
                }
            }),
            _ => json!({ "error": { "message": "document could not be read" } }),
        };
        if inline {
            record["metadata"] = json!({ "key": key });
        } else {
            record["key"] = json!(key);
        }
        record
    }

    fn keys_of(&self, id: &str) -> Vec<String> {
        self.jobs
            .lock()
            .unwrap()
            .get(id)
            .map(|j| j.1.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl BatchService for ScriptedService {
    async fn upload_file(&self, display_name: &str, content: Vec<u8>) -> Result<String, ServiceError> {
        let name = format!("files/{display_name}");
        self.uploads.lock().unwrap().insert(name.clone(), content);
        Ok(name)
    }

    async fn create_job(&self, _display_name: &str, input: JobInput) -> Result<RemoteJob, ServiceError> {
        if self.refuse_jobs.load(Ordering::SeqCst) {
            return Err(ServiceError::Api("quota for batch jobs reached".into()));
        }
        let keys: Vec<String> = match input {
            JobInput::Inline { requests } => requests
                .iter()
                .filter_map(|r| r.pointer("/metadata/key").and_then(Value::as_str))
                .map(str::to_string)
                .collect(),
            JobInput::File { file_name } => {
                let uploads = self.uploads.lock().unwrap();
                let content = uploads.get(&file_name).cloned().unwrap_or_default();
                String::from_utf8(content)
                    .unwrap()
                    .lines()
                    .filter_map(|l| serde_json::from_str::<Value>(l).ok())
                    .filter_map(|v| v.get("key").and_then(Value::as_str).map(str::to_string))
                    .collect()
            }
        };
        let id = format!("batches/job-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.jobs
            .lock()
            .unwrap()
            .insert(id.clone(), (RemoteState::Pending, keys));
        Ok(RemoteJob {
            id,
            state: RemoteState::Pending,
            output: None,
            error: None,
        })
    }

    async fn get_job(&self, id: &str) -> Result<RemoteJob, ServiceError> {
        let state = self
            .jobs
            .lock()
            .unwrap()
            .get(id)
            .map(|j| j.0)
            .ok_or_else(|| ServiceError::Api(format!("no job {id}")))?;
        let output = (state == RemoteState::Succeeded).then(|| {
            if self.file_output {
                JobOutput::File {
                    file_name: format!("files/out-{id}"),
                }
            } else {
                JobOutput::Inline {
                    responses: self.keys_of(id).iter().map(|k| self.record(k, true)).collect(),
                }
            }
        });
        Ok(RemoteJob {
            id: id.to_string(),
            state,
            output,
            error: None,
        })
    }

    async fn cancel_job(&self, id: &str) -> Result<(), ServiceError> {
        self.cancelled.lock().unwrap().push(id.to_string());
        self.set_state(id, RemoteState::Cancelled);
        Ok(())
    }

    async fn download_file(&self, file_name: &str, dest: &Path) -> Result<u64, ServiceError> {
        let id = file_name.trim_start_matches("files/out-");
        let body: String = self
            .keys_of(id)
            .iter()
            .map(|k| format!("{}\n", self.record(k, false)))
            .collect();
        tokio::fs::write(dest, body.as_bytes())
            .await
            .map_err(|e| ServiceError::Transient(e.to_string()))?;
        Ok(body.len() as u64)
    }
}

fn manager(
    config: PipelineConfig,
    ledger: &Arc<MemoryLedger>,
    service: &Arc<ScriptedService>,
    notes: &Arc<Recorder>,
) -> BatchManager {
    BatchManager::new(config, ledger.clone(), service.clone(), notes.clone())
}

// ── Synchronous uploads ──────────────────────────────────────────────────────

#[tokio::test]
async fn sync_upload_reports_blocked_providers_per_file() {
    let account = Uuid::new_v4();
    let ledger = Arc::new(MemoryLedger::new());
    let mut answers = HashMap::new();
    let mut docs = Vec::new();
    for i in 0..10 {
        let key = format!("doc-{i}");
        let provider = if i % 3 == 1 { "Bloqueado SA" } else { "Acme Suministros" };
        answers.insert(
            key.clone(),
            invoice(&format!("F-{i}"), provider, &format!("2024-03-{:02}", i + 1), "10"),
        );
        docs.push(pdf(&key, account));
    }
    let extractor = Arc::new(TableExtractor {
        answers,
        calls: AtomicUsize::new(0),
    });
    let notes = Arc::new(Recorder::default());
    let uploader = SyncUploader::new(config().build().unwrap(), ledger.clone(), extractor, notes.clone());

    let report = uploader.submit_documents_sync("u1", docs).await.unwrap();

    assert_eq!(report.results.len(), 10);
    assert_eq!(report.successful, 7);
    assert_eq!(report.blocked, 3);
    assert_eq!(report.failed, 3);
    assert!(!report.circuit_breaker_tripped);
    for (i, r) in report.results.iter().enumerate() {
        let expected = if i % 3 == 1 { OutcomeStatus::Blocked } else { OutcomeStatus::Created };
        assert_eq!(r.status, expected, "{}", r.file_name);
    }
    assert_eq!(ledger.invoices().await.len(), 7);
    assert_eq!(
        notes.kinds().iter().filter(|k| **k == NotificationKind::BlockedProvider).count(),
        3
    );
}

#[tokio::test]
async fn blocked_failures_do_not_trip_the_breaker() {
    let account = Uuid::new_v4();
    let answers: HashMap<String, ExtractedInvoice> = (0..8)
        .map(|i| {
            (
                format!("b{i}"),
                invoice(&format!("X-{i}"), "Bloqueado SA", "2024-01-01", "1"),
            )
        })
        .collect();
    let docs = (0..8).map(|i| pdf(&format!("b{i}"), account)).collect();
    let extractor = Arc::new(TableExtractor {
        answers,
        calls: AtomicUsize::new(0),
    });
    let uploader = SyncUploader::new(
        config().circuit_breaker_threshold(5).build().unwrap(),
        Arc::new(MemoryLedger::new()),
        extractor.clone(),
        Arc::new(Recorder::default()),
    );

    let report = uploader.submit_documents_sync("u1", docs).await.unwrap();

    assert!(!report.circuit_breaker_tripped);
    assert_eq!(report.blocked, 8);
    assert_eq!(extractor.calls.load(Ordering::SeqCst), 8);
}

// ── Batch lifecycle ──────────────────────────────────────────────────────────

#[tokio::test]
async fn inline_batch_follows_the_remote_job() {
    let account = Uuid::new_v4();
    let ledger = Arc::new(MemoryLedger::new());
    let service = Arc::new(ScriptedService::answering(&[
        ("a", invoice("F-2", "Acme", "2024-02-01", "110")),
        ("b", invoice("F-1", "Acme", "2024-01-01", "100")),
        ("c", invoice("X-1", "Bloqueado SA", "2024-01-15", "5")),
    ]));
    let notes = Arc::new(Recorder::default());
    let mgr = manager(config().build().unwrap(), &ledger, &service, &notes);

    let receipt = mgr
        .submit_documents("u1", vec![pdf("a", account), pdf("b", account), pdf("c", account)])
        .await
        .unwrap();
    assert_eq!(receipt.batch_ids.len(), 1);
    assert_eq!(receipt.failed_chunks, 0);
    let id = receipt.batch_id.clone();
    assert_eq!(mgr.pending_invoices("u1").await.unwrap().len(), 3);

    assert_eq!(
        mgr.reconcile(&id).await.unwrap(),
        ReconcileOutcome::InFlight(BatchStatus::Pending)
    );
    service.set_state(&id, RemoteState::Running);
    assert_eq!(
        mgr.reconcile(&id).await.unwrap(),
        ReconcileOutcome::InFlight(BatchStatus::Processing)
    );
    let job = ledger.get_batch(&id).await.unwrap().unwrap();
    assert_eq!(job.status, BatchStatus::Processing);

    service.set_state(&id, RemoteState::Succeeded);
    let ReconcileOutcome::Completed(summary) = mgr.reconcile(&id).await.unwrap() else {
        panic!("expected completion");
    };
    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.blocked, 1);
    assert_eq!(summary.alerts_created, 1);

    let job = ledger.get_batch(&id).await.unwrap().unwrap();
    assert_eq!(job.status, BatchStatus::Completed);
    assert_eq!(job.processed_files, 3);
    assert_eq!(job.successful_files, 2);
    assert_eq!(job.failed_files, 1);
    assert_eq!(job.blocked_files, 1);
    assert!(job.completed_at.is_some());
    assert!(job.errors.iter().any(|e| e.kind == ErrorKind::BlockedProvider));
    assert!(mgr.pending_invoices("u1").await.unwrap().is_empty());

    // Ingested in issue-date order even though "a" came first.
    let alerts = ledger.price_alerts().await;
    assert_eq!(alerts[0].old_price, Decimal::from(100));
    assert_eq!(alerts[0].new_price, Decimal::from(110));

    assert_eq!(
        mgr.reconcile(&id).await.unwrap(),
        ReconcileOutcome::Unchanged(BatchStatus::Completed)
    );
}

#[tokio::test]
async fn racing_pollers_ingest_once() {
    let account = Uuid::new_v4();
    let ledger = Arc::new(MemoryLedger::new());
    let service = Arc::new(ScriptedService::answering(&[(
        "a",
        invoice("F-1", "Acme", "2024-01-01", "100"),
    )]));
    let notes = Arc::new(Recorder::default());
    let mgr = manager(config().build().unwrap(), &ledger, &service, &notes);
    let id = mgr
        .submit_documents("u1", vec![pdf("a", account)])
        .await
        .unwrap()
        .batch_id;
    service.succeed_all();

    let (first, second) = tokio::join!(mgr.reconcile(&id), mgr.reconcile(&id));
    let outcomes = [first.unwrap(), second.unwrap()];
    let completed = outcomes
        .iter()
        .filter(|o| matches!(o, ReconcileOutcome::Completed(_)))
        .count();
    assert_eq!(completed, 1);
    assert_eq!(ledger.invoices().await.len(), 1);
    let job = ledger.get_batch(&id).await.unwrap().unwrap();
    assert_eq!(job.processed_files, 1);
}

#[tokio::test]
async fn file_output_is_removed_after_a_clean_run() {
    let scratch = tempfile::tempdir().unwrap();
    let account = Uuid::new_v4();
    let ledger = Arc::new(MemoryLedger::new());
    let mut service = ScriptedService::answering(&[
        ("a", invoice("F-1", "Acme", "2024-01-01", "100")),
        ("b", invoice("F-2", "Acme", "2024-01-02", "100")),
    ]);
    service.file_output = true;
    let service = Arc::new(service);
    let notes = Arc::new(Recorder::default());
    let cfg = config()
        .inline_payload_max_bytes(0)
        .scratch_dir(scratch.path())
        .build()
        .unwrap();
    let mgr = manager(cfg, &ledger, &service, &notes);

    let id = mgr
        .submit_documents("u1", vec![pdf("a", account), pdf("b", account)])
        .await
        .unwrap()
        .batch_id;
    assert_eq!(service.uploads.lock().unwrap().len(), 1);
    service.succeed_all();

    let ReconcileOutcome::Completed(summary) = mgr.reconcile(&id).await.unwrap() else {
        panic!("expected completion");
    };
    assert_eq!(summary.succeeded, 2);
    let artifact = summary.artifact.clone().unwrap();
    assert!(summary.artifact_removed);
    assert!(!artifact.exists());
}

#[tokio::test]
async fn file_output_is_kept_when_a_record_failed() {
    let scratch = tempfile::tempdir().unwrap();
    let account = Uuid::new_v4();
    let ledger = Arc::new(MemoryLedger::new());
    let mut service = ScriptedService::answering(&[
        ("a", invoice("F-1", "Acme", "2024-01-01", "100")),
        ("b", invoice("F-2", "Acme", "2024-01-02", "100")),
    ]);
    service.file_output = true;
    service.error_keys.insert("b".into());
    let service = Arc::new(service);
    let notes = Arc::new(Recorder::default());
    let cfg = config()
        .inline_payload_max_bytes(0)
        .scratch_dir(scratch.path())
        .build()
        .unwrap();
    let mgr = manager(cfg, &ledger, &service, &notes);

    let id = mgr
        .submit_documents("u1", vec![pdf("a", account), pdf("b", account)])
        .await
        .unwrap()
        .batch_id;
    service.succeed_all();

    let ReconcileOutcome::Completed(summary) = mgr.reconcile(&id).await.unwrap() else {
        panic!("expected completion");
    };
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.failed, 1);
    assert!(!summary.artifact_removed);
    assert!(summary.artifact.unwrap().exists());
    let job = ledger.get_batch(&id).await.unwrap().unwrap();
    assert_eq!(job.status, BatchStatus::Completed);
    assert!(job.errors.iter().any(|e| e.kind == ErrorKind::ExtractionError));
    assert!(notes.kinds().contains(&NotificationKind::ExtractionFailed));
}

#[tokio::test]
async fn expired_job_fails_its_open_items() {
    let account = Uuid::new_v4();
    let ledger = Arc::new(MemoryLedger::new());
    let service = Arc::new(ScriptedService::default());
    let notes = Arc::new(Recorder::default());
    let mgr = manager(config().build().unwrap(), &ledger, &service, &notes);
    let id = mgr
        .submit_documents("u1", vec![pdf("a", account), pdf("b", account)])
        .await
        .unwrap()
        .batch_id;
    service.set_state(&id, RemoteState::Expired);

    assert_eq!(
        mgr.reconcile(&id).await.unwrap(),
        ReconcileOutcome::Terminated {
            status: BatchStatus::Expired,
            failed: 2
        }
    );
    let job = ledger.get_batch(&id).await.unwrap().unwrap();
    assert_eq!(job.status, BatchStatus::Expired);
    assert_eq!(job.failed_files, 2);
    assert!(job.completed_at.is_some());
    assert!(mgr.pending_invoices("u1").await.unwrap().is_empty());
    assert!(notes.kinds().contains(&NotificationKind::BatchFailed));

    // A late success changes nothing.
    service.set_state(&id, RemoteState::Succeeded);
    assert_eq!(
        mgr.reconcile(&id).await.unwrap(),
        ReconcileOutcome::Unchanged(BatchStatus::Expired)
    );
}

#[tokio::test]
async fn cancelling_closes_the_batch_once() {
    let account = Uuid::new_v4();
    let ledger = Arc::new(MemoryLedger::new());
    let service = Arc::new(ScriptedService::default());
    let notes = Arc::new(Recorder::default());
    let mgr = manager(config().build().unwrap(), &ledger, &service, &notes);
    let id = mgr
        .submit_documents("u1", vec![pdf("a", account)])
        .await
        .unwrap()
        .batch_id;

    assert!(mgr.cancel_batch(&id).await.unwrap());
    assert!(!mgr.cancel_batch(&id).await.unwrap());
    assert_eq!(service.cancelled.lock().unwrap().len(), 1);

    let job = ledger.get_batch(&id).await.unwrap().unwrap();
    assert_eq!(job.status, BatchStatus::Cancelled);
    assert_eq!(job.failed_files, 1);
    assert!(!notes.kinds().contains(&NotificationKind::BatchFailed));
    assert!(matches!(
        mgr.cancel_batch("nope").await,
        Err(PipelineError::BatchNotFound { .. })
    ));
}

#[tokio::test]
async fn refused_submission_is_recorded_as_failed() {
    let account = Uuid::new_v4();
    let ledger = Arc::new(MemoryLedger::new());
    let service = Arc::new(ScriptedService::default());
    service.refuse_jobs.store(true, Ordering::SeqCst);
    let notes = Arc::new(Recorder::default());
    let mgr = manager(config().build().unwrap(), &ledger, &service, &notes);

    let err = mgr
        .submit_documents("u1", vec![pdf("a", account), pdf("b", account)])
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::JobSubmissionFailed { documents: 2, .. }));

    let history = mgr.get_batch_history("u1").await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, BatchStatus::Failed);
    assert_eq!(history[0].failed_files, 2);
    assert!(history[0].completed_at.is_some());
    assert!(mgr.get_active_batches("u1").await.unwrap().is_empty());
    assert!(notes.kinds().contains(&NotificationKind::BatchFailed));

    assert!(matches!(
        mgr.submit_documents("u1", Vec::new()).await,
        Err(PipelineError::EmptySubmission)
    ));
}

#[tokio::test]
async fn chunks_split_on_the_byte_cap() {
    let account = Uuid::new_v4();
    let ledger = Arc::new(MemoryLedger::new());
    let service = Arc::new(ScriptedService::default());
    let notes = Arc::new(Recorder::default());
    let mgr = manager(
        config()
            .chunk_max_bytes(4 * 1024)
            .inline_payload_max_bytes(4 * 1024)
            .build()
            .unwrap(),
        &ledger,
        &service,
        &notes,
    );
    // The extraction prompt alone is close to the cap, so no two requests share a chunk.
    let receipt = mgr
        .submit_documents(
            "u1",
            vec![pdf("a", account), pdf("b", account), pdf("c", account)],
        )
        .await
        .unwrap();

    assert_eq!(receipt.batch_ids.len(), 3);
    assert_eq!(receipt.documents, 3);
    let active = mgr.get_active_batches("u1").await.unwrap();
    assert_eq!(active.len(), 3);
    assert!(active.iter().all(|b| b.total_files == 1));
}

#[tokio::test]
async fn sweep_finishes_every_user() {
    let account = Uuid::new_v4();
    let ledger = Arc::new(MemoryLedger::new());
    let service = Arc::new(ScriptedService::answering(&[
        ("a", invoice("F-1", "Acme", "2024-01-01", "100")),
        ("b", invoice("F-2", "Acme", "2024-01-02", "100")),
    ]));
    let notes = Arc::new(Recorder::default());
    let mgr = manager(config().build().unwrap(), &ledger, &service, &notes);
    mgr.submit_documents("u1", vec![pdf("a", account)]).await.unwrap();
    mgr.submit_documents("u2", vec![pdf("b", account)]).await.unwrap();

    let idle = mgr.reconcile_all().await.unwrap();
    assert_eq!(idle.users, 2);
    assert_eq!(idle.finished, 0);

    service.succeed_all();
    let done = mgr.reconcile_all().await.unwrap();
    assert_eq!(done.checked, 2);
    assert_eq!(done.finished, 2);
    assert_eq!(done.errors, 0);
    assert!(ledger.list_active_batches().await.unwrap().is_empty());

    assert_eq!(mgr.get_batch_history("u1").await.unwrap().len(), 1);
    assert_eq!(mgr.get_batch_history("u2").await.unwrap().len(), 1);
}

// ── Validation round-trip ────────────────────────────────────────────────────

#[tokio::test]
async fn validation_children_roll_up_into_the_parent() {
    let account = Uuid::new_v4();
    let ledger = Arc::new(MemoryLedger::new());
    let service = Arc::new(ScriptedService::answering(&[
        ("a", invoice("F-1", "Acme", "2024-01-01", "100")),
        ("b", invoice("F-2", "Acme", "2024-01-02", "120")),
    ]));
    let notes = Arc::new(Recorder::default());
    let mgr = manager(
        config().validate_extractions(true).build().unwrap(),
        &ledger,
        &service,
        &notes,
    );
    let parent = mgr
        .submit_documents("u1", vec![pdf("a", account), pdf("b", account)])
        .await
        .unwrap()
        .batch_id;
    service.set_state(&parent, RemoteState::Succeeded);

    let ReconcileOutcome::ValidationSpawned { children, .. } = mgr.reconcile(&parent).await.unwrap()
    else {
        panic!("expected validation hand-off");
    };
    assert_eq!(children.len(), 1);
    let child = children[0].clone();
    assert!(ledger.invoices().await.is_empty());

    let parent_job = ledger.get_batch(&parent).await.unwrap().unwrap();
    assert_eq!(parent_job.status, BatchStatus::Processing);
    assert_eq!(parent_job.successful_files, 2);
    let child_job = ledger.get_batch(&child).await.unwrap().unwrap();
    assert_eq!(child_job.purpose, BatchPurpose::Validation);
    assert!(ledger
        .list_items(&child)
        .await
        .unwrap()
        .iter()
        .all(|i| i.extracted_payload.is_some()));

    // The parent's output is claimed; polling it again does nothing.
    assert_eq!(
        mgr.reconcile(&parent).await.unwrap(),
        ReconcileOutcome::Unchanged(BatchStatus::Processing)
    );

    service.set_state(&child, RemoteState::Succeeded);
    let ReconcileOutcome::Completed(summary) = mgr.reconcile(&child).await.unwrap() else {
        panic!("expected child completion");
    };
    assert_eq!(summary.succeeded, 2);
    assert_eq!(ledger.invoices().await.len(), 2);
    assert_eq!(ledger.price_alerts().await.len(), 1);

    let parent_job = ledger.get_batch(&parent).await.unwrap().unwrap();
    assert_eq!(parent_job.status, BatchStatus::Completed);
}

#[tokio::test]
async fn failed_validation_fails_the_parent() {
    let account = Uuid::new_v4();
    let ledger = Arc::new(MemoryLedger::new());
    let service = Arc::new(ScriptedService::answering(&[(
        "a",
        invoice("F-1", "Acme", "2024-01-01", "100"),
    )]));
    let notes = Arc::new(Recorder::default());
    let mgr = manager(
        config().validate_extractions(true).build().unwrap(),
        &ledger,
        &service,
        &notes,
    );
    let parent = mgr
        .submit_documents("u1", vec![pdf("a", account)])
        .await
        .unwrap()
        .batch_id;
    service.set_state(&parent, RemoteState::Succeeded);
    mgr.reconcile(&parent).await.unwrap();

    let child = service
        .job_ids()
        .into_iter()
        .find(|id| *id != parent)
        .unwrap();
    service.set_state(&child, RemoteState::Failed);
    assert!(matches!(
        mgr.reconcile(&child).await.unwrap(),
        ReconcileOutcome::Terminated {
            status: BatchStatus::Failed,
            failed: 1
        }
    ));

    let parent_job = ledger.get_batch(&parent).await.unwrap().unwrap();
    assert_eq!(parent_job.status, BatchStatus::Failed);
    assert!(ledger.invoices().await.is_empty());
}

// ── Background work ──────────────────────────────────────────────────────────

#[tokio::test]
async fn detached_submission_is_picked_up_by_the_poller() {
    let account = Uuid::new_v4();
    let ledger = Arc::new(MemoryLedger::new());
    let service = Arc::new(ScriptedService::answering(&[(
        "a",
        invoice("F-1", "Acme", "2024-01-01", "100"),
    )]));
    let notes = Arc::new(Recorder::default());
    let mgr = Arc::new(manager(config().build().unwrap(), &ledger, &service, &notes));

    let receipt = mgr
        .submit_documents_detached("u1".into(), vec![pdf("a", account)])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(mgr.get_active_batches("u1").await.unwrap().len(), 1);

    service.succeed_all();
    let drained = {
        let ledger = ledger.clone();
        async move {
            while !ledger.list_active_batches().await.unwrap().is_empty() {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        }
    };
    tokio::time::timeout(std::time::Duration::from_secs(5), mgr.run_poller(drained))
        .await
        .expect("poller should stop once nothing is active");

    let job = ledger.get_batch(&receipt.batch_id).await.unwrap().unwrap();
    assert_eq!(job.status, BatchStatus::Completed);
    assert_eq!(ledger.invoices().await.len(), 1);
}

// ── Circuit breaker in batches ───────────────────────────────────────────────

#[tokio::test]
async fn repeated_ingestion_failures_fail_the_batch() {
    let account = Uuid::new_v4();
    let ledger = Arc::new(MemoryLedger::new());
    let service = Arc::new(ScriptedService::answering(&[
        ("a", invoice("F-1", "Acme", "2024-01-01", "100")),
        ("b", invoice("F-2", "Acme", "2024-01-02", "100")),
        ("c", invoice("F-3", "Acme", "2024-01-03", "100")),
        ("d", invoice("F-4", "Acme", "2024-01-04", "100")),
    ]));
    let notes = Arc::new(Recorder::default());
    let mgr = manager(
        config().circuit_breaker_threshold(2).build().unwrap(),
        &ledger,
        &service,
        &notes,
    );
    let docs = ["a", "b", "c", "d"].iter().map(|k| pdf(k, account)).collect();
    let id = mgr.submit_documents("u1", docs).await.unwrap().batch_id;

    ledger.fail_next_commits(2);
    service.set_state(&id, RemoteState::Succeeded);
    let ReconcileOutcome::Completed(summary) = mgr.reconcile(&id).await.unwrap() else {
        panic!("expected completion");
    };
    assert!(summary.circuit_breaker_tripped);

    let job = ledger.get_batch(&id).await.unwrap().unwrap();
    assert_eq!(job.status, BatchStatus::Failed);
    assert_eq!(job.processed_files, job.total_files);
    assert_eq!(job.failed_files, 4);
    let skipped: Vec<_> = job
        .errors
        .iter()
        .filter(|e| e.message.contains("circuit breaker"))
        .collect();
    assert_eq!(skipped.len(), 2);
    assert!(ledger.invoices().await.is_empty());
    assert!(notes.kinds().contains(&NotificationKind::BatchFailed));
}

#[tokio::test]
async fn unreadable_outputs_count_toward_the_breaker() {
    let account = Uuid::new_v4();
    let ledger = Arc::new(MemoryLedger::new());
    // "a" and "b" have no answer and come back as error records.
    let service = Arc::new(ScriptedService::answering(&[
        ("c", invoice("F-3", "Acme", "2024-01-03", "100")),
        ("d", invoice("F-4", "Acme", "2024-01-04", "100")),
    ]));
    let notes = Arc::new(Recorder::default());
    let mgr = manager(
        config().circuit_breaker_threshold(2).build().unwrap(),
        &ledger,
        &service,
        &notes,
    );
    let docs = ["a", "b", "c", "d"].iter().map(|k| pdf(k, account)).collect();
    let id = mgr.submit_documents("u1", docs).await.unwrap().batch_id;

    service.set_state(&id, RemoteState::Succeeded);
    let ReconcileOutcome::Completed(summary) = mgr.reconcile(&id).await.unwrap() else {
        panic!("expected completion");
    };
    assert!(summary.circuit_breaker_tripped);

    let job = ledger.get_batch(&id).await.unwrap().unwrap();
    assert_eq!(job.status, BatchStatus::Failed);
    assert_eq!(job.processed_files, 4);
    assert_eq!(job.successful_files, 0);
    assert!(ledger.invoices().await.is_empty());
}

// ── Accounts ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn documents_of_different_accounts_get_separate_batches() {
    let (first, second) = (Uuid::new_v4(), Uuid::new_v4());
    let ledger = Arc::new(MemoryLedger::new());
    let service = Arc::new(ScriptedService::answering(&[
        ("a", invoice("F-1", "Acme", "2024-01-01", "100")),
        ("b", invoice("F-2", "Acme", "2024-01-02", "100")),
        ("c", invoice("F-3", "Acme", "2024-01-03", "100")),
    ]));
    let notes = Arc::new(Recorder::default());
    let mgr = manager(config().build().unwrap(), &ledger, &service, &notes);

    let receipt = mgr
        .submit_documents("u1", vec![pdf("a", first), pdf("b", second), pdf("c", first)])
        .await
        .unwrap();
    assert_eq!(receipt.batch_ids.len(), 2);

    let one = ledger.get_batch(&receipt.batch_ids[0]).await.unwrap().unwrap();
    let two = ledger.get_batch(&receipt.batch_ids[1]).await.unwrap().unwrap();
    assert_eq!((one.account, one.total_files), (Some(first), 2));
    assert_eq!((two.account, two.total_files), (Some(second), 1));
    assert_eq!(service.keys_of(&one.id), vec!["a", "c"]);

    service.succeed_all();
    mgr.reconcile_all().await.unwrap();
    assert_eq!(ledger.invoices().await.len(), 3);
}
