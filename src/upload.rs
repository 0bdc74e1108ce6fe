//! Synchronous upload sessions.
//!
//! [`SyncUploader::submit_documents_sync`] is the small-upload path: every
//! document is extracted right away and ingested before the call returns.
//!
//! ```text
//! documents ─▶ extraction waves (adaptive cap, buffer_unordered)
//!           ─▶ sort by issue date
//!           ─▶ serial ingestion (one transaction per document)
//!           ─▶ per-file outcomes
//! ```
//!
//! Extraction runs concurrently; ingestion never does. Price alerts compare
//! against the previous price in date order, so two invoices ingested out of
//! order would produce the wrong alert.
//!
//! A [`CircuitBreaker`] spans both phases. Once it opens, documents not yet
//! started are failed with `CircuitBreakerOpen` without another extraction
//! call being made.

use crate::codec::ExtractedInvoice;
use crate::concurrency::{AdaptiveConcurrency, CircuitBreaker, MemoryProbe, ProcMemoryProbe};
use crate::config::PipelineConfig;
use crate::document::Document;
use crate::error::{BatchErrorEntry, DocumentError, ErrorKind, PipelineError};
use crate::extract::DocumentExtractor;
use crate::ingest::{IngestOutcome, IngestionEngine};
use crate::ledger::Ledger;
use crate::notify::{notify_quietly, NotificationKind, Notifier};
use crate::resolver::ResolutionCache;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Documents per extraction wave, as a multiple of the current cap.
const WAVE_FACTOR: usize = 4;

/// Final state of one document in a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutcomeStatus {
    Created,
    Duplicate,
    Unassigned,
    Blocked,
    Failed,
}

impl OutcomeStatus {
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            OutcomeStatus::Created | OutcomeStatus::Duplicate | OutcomeStatus::Unassigned
        )
    }
}

/// Per-file result returned by a synchronous upload.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentOutcome {
    pub document_key: String,
    pub file_name: String,
    pub status: OutcomeStatus,
    pub invoice_code: Option<String>,
    pub invoice_id: Option<Uuid>,
    pub items_created: u32,
    pub alerts_created: u32,
    /// Set for failures, and for duplicates as an informational entry.
    pub error: Option<BatchErrorEntry>,
}

impl DocumentOutcome {
    fn failed(document: &Document, error: &DocumentError) -> Self {
        let status = if error.is_blocked() {
            OutcomeStatus::Blocked
        } else {
            OutcomeStatus::Failed
        };
        Self {
            document_key: document.key.clone(),
            file_name: document.file_name.clone(),
            status,
            invoice_code: None,
            invoice_id: None,
            items_created: 0,
            alerts_created: 0,
            error: Some(BatchErrorEntry::from_document_error(
                error,
                Some(&document.file_name),
            )),
        }
    }

    fn ingested(document: &Document, invoice: &ExtractedInvoice, outcome: &IngestOutcome) -> Self {
        let (status, error) = if outcome.duplicate {
            let entry = BatchErrorEntry::new(
                ErrorKind::DuplicateInvoice,
                format!("Invoice {} already stored", invoice.invoice_code),
            )
            .with_file_name(document.file_name.clone())
            .with_invoice_code(invoice.invoice_code.clone());
            (OutcomeStatus::Duplicate, Some(entry))
        } else if outcome.unassigned {
            (OutcomeStatus::Unassigned, None)
        } else {
            (OutcomeStatus::Created, None)
        };
        Self {
            document_key: document.key.clone(),
            file_name: document.file_name.clone(),
            status,
            invoice_code: Some(invoice.invoice_code.clone()),
            invoice_id: outcome.invoice_id,
            items_created: outcome.items_created,
            alerts_created: outcome.alerts_created,
            error,
        }
    }
}

/// Result of one synchronous upload, in submission order.
#[derive(Debug, Clone, Serialize)]
pub struct UploadReport {
    pub results: Vec<DocumentOutcome>,
    /// Created, duplicate and unassigned documents.
    pub successful: usize,
    /// Every non-successful document, blocked ones included.
    pub failed: usize,
    pub blocked: usize,
    pub duplicates: usize,
    pub circuit_breaker_tripped: bool,
    pub elapsed_ms: u64,
}

impl UploadReport {
    fn from_results(results: Vec<DocumentOutcome>, tripped: bool, started: Instant) -> Self {
        let count = |s: OutcomeStatus| results.iter().filter(|r| r.status == s).count();
        let successful = results.iter().filter(|r| r.status.is_success()).count();
        Self {
            successful,
            failed: results.len() - successful,
            blocked: count(OutcomeStatus::Blocked),
            duplicates: count(OutcomeStatus::Duplicate),
            circuit_breaker_tripped: tripped,
            elapsed_ms: started.elapsed().as_millis() as u64,
            results,
        }
    }
}

/// Runs synchronous upload sessions against one ledger.
pub struct SyncUploader {
    config: PipelineConfig,
    ledger: Arc<dyn Ledger>,
    extractor: Arc<dyn DocumentExtractor>,
    engine: IngestionEngine,
    notifier: Arc<dyn Notifier>,
    probe: Arc<dyn MemoryProbe>,
}

impl SyncUploader {
    pub fn new(
        config: PipelineConfig,
        ledger: Arc<dyn Ledger>,
        extractor: Arc<dyn DocumentExtractor>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            engine: IngestionEngine::from_config(&config),
            config,
            ledger,
            extractor,
            notifier,
            probe: Arc::new(ProcMemoryProbe),
        }
    }

    pub fn with_memory_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Extract and ingest every document, returning one outcome per file.
    ///
    /// Per-document failures are reported in the outcomes, never as `Err`.
    ///
    /// # Errors
    /// [`PipelineError::EmptySubmission`] when `documents` is empty.
    pub async fn submit_documents_sync(
        &self,
        user_id: &str,
        documents: Vec<Document>,
    ) -> Result<UploadReport, PipelineError> {
        if documents.is_empty() {
            return Err(PipelineError::EmptySubmission);
        }
        let started = Instant::now();
        let total = documents.len();
        let callback = self.config.progress_callback.as_ref();
        info!(user = user_id, documents = total, "Starting synchronous upload");
        if let Some(cb) = callback {
            cb.on_session_start(total);
        }

        let breaker = CircuitBreaker::new(self.config.circuit_breaker_threshold);
        let mut outcomes: Vec<Option<DocumentOutcome>> = (0..total).map(|_| None).collect();

        // ── Phase 1: concurrent extraction ───────────────────────────────
        let extracted = self
            .extract_all(user_id, &documents, &breaker, &mut outcomes)
            .await;

        // ── Phase 2: serial ingestion in issue-date order ────────────────
        let mut ordered = extracted;
        ordered.sort_by_key(|(idx, invoice)| (invoice.sort_key(), *idx));
        let mut cache = ResolutionCache::new();
        for (idx, invoice) in ordered {
            let document = &documents[idx];
            if breaker.is_open() {
                outcomes[idx] = Some(self.fail(user_id, idx, total, document, &breaker.skip_error()).await);
                continue;
            }
            let result = self
                .engine
                .ingest(
                    self.ledger.as_ref(),
                    &invoice,
                    &document.key,
                    document.account,
                    &mut cache,
                )
                .await;
            outcomes[idx] = Some(match result {
                Ok(outcome) => {
                    breaker.record_success();
                    if outcome.duplicate {
                        notify_quietly(
                            &self.notifier,
                            user_id,
                            &format!(
                                "Invoice {} from {} was already stored",
                                invoice.invoice_code, document.file_name
                            ),
                            NotificationKind::DuplicateInvoice,
                            outcome.invoice_id.map(|id| id.to_string()).as_deref(),
                        )
                        .await;
                    }
                    if let Some(cb) = callback {
                        cb.on_document_ingested(idx, total, &invoice.invoice_code);
                    }
                    DocumentOutcome::ingested(document, &invoice, &outcome)
                }
                Err(e) => {
                    breaker.record_failure(&e);
                    self.fail(user_id, idx, total, document, &e).await
                }
            });
        }

        let results: Vec<DocumentOutcome> = outcomes
            .into_iter()
            .zip(documents.iter())
            .map(|(slot, document)| {
                slot.unwrap_or_else(|| DocumentOutcome::failed(document, &breaker.skip_error()))
            })
            .collect();
        let report = UploadReport::from_results(results, breaker.is_open(), started);
        if let Some(cb) = callback {
            cb.on_session_complete(total, report.successful);
        }
        info!(
            user = user_id,
            successful = report.successful,
            failed = report.failed,
            blocked = report.blocked,
            duplicates = report.duplicates,
            breaker_tripped = report.circuit_breaker_tripped,
            elapsed_ms = report.elapsed_ms,
            "Synchronous upload finished"
        );
        Ok(report)
    }

    /// Extract in waves, re-reading the adaptive cap before each one.
    /// Failed documents get their outcome slot filled here.
    async fn extract_all(
        &self,
        user_id: &str,
        documents: &[Document],
        breaker: &CircuitBreaker,
        outcomes: &mut [Option<DocumentOutcome>],
    ) -> Vec<(usize, ExtractedInvoice)> {
        let total = documents.len();
        let limiter = AdaptiveConcurrency::new(&self.config, Arc::clone(&self.probe));
        let callback = self.config.progress_callback.as_ref();
        let extractor = &self.extractor;
        let mut extracted = Vec::with_capacity(total);
        let mut next = 0;

        while next < total && !breaker.is_open() {
            let cap = limiter.current(total);
            let end = (next + cap * WAVE_FACTOR).min(total);
            debug!(from = next, to = end, cap, "Extraction wave");

            let wave: Vec<(usize, Option<Result<ExtractedInvoice, DocumentError>>)> =
                stream::iter(next..end)
                    .map(|idx| async move {
                        if breaker.is_open() {
                            return (idx, None);
                        }
                        if let Some(cb) = callback {
                            cb.on_extraction_start(idx, total);
                        }
                        let result = extractor.extract(&documents[idx]).await;
                        match &result {
                            Ok(_) => breaker.record_success(),
                            Err(e) => {
                                breaker.record_failure(e);
                            }
                        }
                        (idx, Some(result))
                    })
                    .buffer_unordered(cap)
                    .collect()
                    .await;

            for (idx, result) in wave {
                let document = &documents[idx];
                match result {
                    Some(Ok(invoice)) => {
                        if let Some(cb) = callback {
                            cb.on_extraction_complete(idx, total, invoice.items.len());
                        }
                        extracted.push((idx, invoice));
                    }
                    Some(Err(e)) => {
                        outcomes[idx] = Some(self.fail(user_id, idx, total, document, &e).await);
                    }
                    None => {
                        outcomes[idx] =
                            Some(self.fail(user_id, idx, total, document, &breaker.skip_error()).await);
                    }
                }
            }
            next = end;
        }

        if next < total {
            warn!(
                skipped = total - next,
                failures = breaker.failures(),
                "Circuit breaker open, skipping remaining documents"
            );
            for (idx, document) in documents.iter().enumerate().skip(next) {
                outcomes[idx] = Some(self.fail(user_id, idx, total, document, &breaker.skip_error()).await);
            }
        }
        extracted
    }

    async fn fail(
        &self,
        user_id: &str,
        idx: usize,
        total: usize,
        document: &Document,
        error: &DocumentError,
    ) -> DocumentOutcome {
        warn!(
            document = %document.key,
            file = %document.file_name,
            kind = error.kind().as_str(),
            error = %error,
            "Document failed"
        );
        if let Some(cb) = self.config.progress_callback.as_ref() {
            cb.on_document_error(idx, total, error.kind().as_str(), &error.to_string());
        }
        let kind = if error.is_blocked() {
            NotificationKind::BlockedProvider
        } else {
            NotificationKind::ExtractionFailed
        };
        if !matches!(error, DocumentError::CircuitBreakerOpen { .. }) {
            notify_quietly(
                &self.notifier,
                user_id,
                &format!("{}: {error}", document.file_name),
                kind,
                Some(&document.key),
            )
            .await;
        }
        DocumentOutcome::failed(document, error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{ExtractedItem, ExtractedProvider};
    use crate::ledger::MemoryLedger;
    use crate::notify::{NotifyError, NoopNotifier};
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use rust_decimal::Decimal;
    use std::collections::HashMap;
    use std::str::FromStr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Extractor answering from a table keyed by file name.
    struct TableExtractor {
        answers: HashMap<String, Result<ExtractedInvoice, DocumentError>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DocumentExtractor for TableExtractor {
        async fn extract(&self, document: &Document) -> Result<ExtractedInvoice, DocumentError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answers
                .get(&document.file_name)
                .cloned()
                .unwrap_or(Err(DocumentError::Unknown {
                    detail: "no answer".into(),
                }))
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<NotificationKind>>);

    #[async_trait]
    impl Notifier for Recorder {
        async fn notify(
            &self,
            _: &str,
            _: &str,
            kind: NotificationKind,
            _: Option<&str>,
        ) -> Result<(), NotifyError> {
            self.0.lock().unwrap().push(kind);
            Ok(())
        }
    }

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
                material_name: Some("Cemento".into()),
                is_material: true,
                quantity: Some(Decimal::ONE),
                unit_price: Some(price),
                total_price: Some(price),
                ..Default::default()
            }],
        }
    }

    fn doc(name: &str, account: Uuid) -> Document {
        Document::from_bytes(name, b"%PDF-1.7".to_vec())
            .unwrap()
            .with_account(account)
    }

    fn config() -> PipelineConfig {
        PipelineConfig::builder()
            .concurrency(2)
            .max_retries(0)
            .blocked_providers(["Bloqueado SA"])
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn ingests_in_issue_date_order() {
        let account = Uuid::new_v4();
        let ledger = Arc::new(MemoryLedger::new());
        // Submitted newest first; the alert must still read 100 -> 110.
        let answers = HashMap::from([
            ("b.pdf".to_string(), Ok(invoice("F-2", "Acme", "2024-02-01", "110"))),
            ("a.pdf".to_string(), Ok(invoice("F-1", "Acme", "2024-01-01", "100"))),
        ]);
        let extractor = Arc::new(TableExtractor {
            answers,
            calls: AtomicUsize::new(0),
        });
        let uploader = SyncUploader::new(config(), ledger.clone(), extractor, Arc::new(NoopNotifier));

        let report = uploader
            .submit_documents_sync("u1", vec![doc("b.pdf", account), doc("a.pdf", account)])
            .await
            .unwrap();

        assert_eq!(report.successful, 2);
        assert_eq!(report.results[0].file_name, "b.pdf");
        let alerts = ledger.price_alerts().await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].old_price, Decimal::from(100));
        assert_eq!(alerts[0].new_price, Decimal::from(110));
    }

    #[tokio::test]
    async fn breaker_stops_extraction_calls() {
        let ledger = Arc::new(MemoryLedger::new());
        let extractor = Arc::new(TableExtractor {
            answers: HashMap::new(),
            calls: AtomicUsize::new(0),
        });
        let config = PipelineConfig::builder()
            .concurrency(1)
            .concurrency_bounds(1, 1)
            .small_batch_threshold(0)
            .circuit_breaker_threshold(5)
            .build()
            .unwrap();
        let uploader = SyncUploader::new(config, ledger, extractor.clone(), Arc::new(NoopNotifier));
        let account = Uuid::new_v4();
        let docs = (0..12).map(|i| doc(&format!("{i}.pdf"), account)).collect();

        let report = uploader.submit_documents_sync("u1", docs).await.unwrap();

        assert!(report.circuit_breaker_tripped);
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 5);
        assert_eq!(report.failed, 12);
        let skipped = report
            .results
            .iter()
            .filter(|r| r.error.as_ref().is_some_and(|e| e.message.contains("circuit breaker")))
            .count();
        assert_eq!(skipped, 7);
    }

    #[tokio::test]
    async fn blocked_and_duplicate_documents_are_reported() {
        let account = Uuid::new_v4();
        let ledger = Arc::new(MemoryLedger::new());
        let answers = HashMap::from([
            ("a.pdf".to_string(), Ok(invoice("F-1", "Acme", "2024-01-01", "100"))),
            ("b.pdf".to_string(), Ok(invoice("F-1", "Acme", "2024-01-01", "100"))),
            ("c.pdf".to_string(), Ok(invoice("X-9", "Bloqueado SA", "2024-01-02", "5"))),
        ]);
        let extractor = Arc::new(TableExtractor {
            answers,
            calls: AtomicUsize::new(0),
        });
        let notes = Arc::new(Recorder::default());
        let uploader = SyncUploader::new(config(), ledger.clone(), extractor, notes.clone());

        let report = uploader
            .submit_documents_sync(
                "u1",
                vec![doc("a.pdf", account), doc("b.pdf", account), doc("c.pdf", account)],
            )
            .await
            .unwrap();

        assert_eq!(report.successful, 2);
        assert_eq!(report.duplicates, 1);
        assert_eq!(report.blocked, 1);
        assert_eq!(ledger.invoices().await.len(), 1);
        let kinds = notes.0.lock().unwrap().clone();
        assert!(kinds.contains(&NotificationKind::DuplicateInvoice));
        assert!(kinds.contains(&NotificationKind::BlockedProvider));
    }

    #[tokio::test]
    async fn empty_upload_is_rejected() {
        let uploader = SyncUploader::new(
            config(),
            Arc::new(MemoryLedger::new()),
            Arc::new(TableExtractor {
                answers: HashMap::new(),
                calls: AtomicUsize::new(0),
            }),
            Arc::new(NoopNotifier),
        );
        assert!(matches!(
            uploader.submit_documents_sync("u1", Vec::new()).await,
            Err(PipelineError::EmptySubmission)
        ));
    }
}
