//! Folding a finished job's output back into the ledger.
//!
//! Output arrives either as a JSONL file (downloaded into the shared scratch
//! directory) or as an inline response list. Files are only trusted once
//! their size has stopped changing, and are located by their expected name
//! or, failing that, as the single recent file with the same extension.
//! Two or more candidates is an error: the aggregator never guesses.
//!
//! The file is removed afterwards unless an actual error was recorded.
//! Duplicates alone do not keep it.

use crate::codec::batch_line::{decode_output_line, decode_record, OutputRecord};
use crate::codec::{ExtractedInvoice, PartialInvoice};
use crate::concurrency::CircuitBreaker;
use crate::config::PipelineConfig;
use crate::error::{BatchErrorEntry, DocumentError, ErrorKind, PipelineError, ServiceError};
use crate::extract::{finish_extraction, parse_text};
use crate::ingest::IngestionEngine;
use crate::ledger::Ledger;
use crate::model::{BatchItem, BatchJob, BatchPurpose, CounterDelta};
use crate::notify::{notify_quietly, NotificationKind, Notifier};
use crate::resolver::ResolutionCache;
use crate::retry::RetryPolicy;
use crate::service::{BatchService, JobOutput, RemoteJob};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::time::sleep;
use tracing::{debug, info, warn};

const OUTPUT_EXTENSION: &str = "jsonl";

/// One batch item and what its output record decoded to.
#[derive(Debug, Clone)]
pub struct DecodedEntry {
    pub item: BatchItem,
    pub result: Result<ExtractedInvoice, DocumentError>,
}

/// Every output record of a job, matched to its items.
#[derive(Debug, Clone, Default)]
pub struct DecodedOutput {
    pub entries: Vec<DecodedEntry>,
    /// Errors that cannot be attributed to an item (unreadable lines,
    /// records without a key).
    pub stray: Vec<BatchErrorEntry>,
    /// Downloaded output file, if the job produced one.
    pub artifact: Option<PathBuf>,
}

/// Outcome counts of one aggregation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AggregateSummary {
    /// Created, duplicate and unassigned documents.
    pub succeeded: u32,
    pub duplicates: u32,
    pub unassigned: u32,
    pub blocked: u32,
    /// Failed documents, blocked ones excluded.
    pub failed: u32,
    pub alerts_created: u32,
    /// Results that arrived after the item was already closed.
    pub discarded: u32,
    pub circuit_breaker_tripped: bool,
    pub artifact: Option<PathBuf>,
    pub artifact_removed: bool,
}

/// Reads, decodes and ingests the output of one job.
pub struct Aggregator<'a> {
    pub config: &'a PipelineConfig,
    pub ledger: &'a dyn Ledger,
    pub service: &'a dyn BatchService,
    pub engine: &'a IngestionEngine,
    pub notifier: &'a Arc<dyn Notifier>,
    pub retry: &'a RetryPolicy,
}

impl Aggregator<'_> {
    /// Decode and ingest in one go.
    pub async fn aggregate(
        &self,
        job: &BatchJob,
        remote: &RemoteJob,
    ) -> Result<AggregateSummary, PipelineError> {
        let decoded = self.decode(job, remote).await?;
        self.ingest(job, decoded).await
    }

    /// Fetch the job's output records and match them to the batch items.
    pub async fn decode(
        &self,
        job: &BatchJob,
        remote: &RemoteJob,
    ) -> Result<DecodedOutput, PipelineError> {
        let (records, artifact) = self.read_records(job, remote).await?;
        let items = self.ledger.list_items(&job.id).await?;
        let by_key: HashMap<&str, &BatchItem> = items
            .iter()
            .filter(|i| !i.processed)
            .map(|i| (i.document_key.as_str(), i))
            .collect();

        let mut output = DecodedOutput {
            artifact,
            ..DecodedOutput::default()
        };
        let mut seen: HashSet<String> = HashSet::new();
        for (line_no, record) in records.into_iter().enumerate() {
            let record = match record {
                Ok(r) => r,
                Err(e) => {
                    warn!(batch_id = %job.id, line = line_no + 1, error = %e, "Unreadable output line");
                    output.stray.push(BatchErrorEntry::new(
                        ErrorKind::ParsingError,
                        format!("Unreadable output line {}: {e}", line_no + 1),
                    ));
                    continue;
                }
            };
            let Some(key) = record.key.clone() else {
                warn!(batch_id = %job.id, line = line_no + 1, "Output record without a key");
                output.stray.push(BatchErrorEntry::new(
                    ErrorKind::ParsingError,
                    format!("Output record {} carries no document key", line_no + 1),
                ));
                continue;
            };
            let Some(item) = by_key.get(key.as_str()) else {
                debug!(batch_id = %job.id, document = %key, "Output for unknown or closed item");
                continue;
            };
            if !seen.insert(key.clone()) {
                debug!(batch_id = %job.id, document = %key, "Repeated output record ignored");
                continue;
            }
            output.entries.push(DecodedEntry {
                item: (*item).clone(),
                result: decode_one(&record, item, job.purpose),
            });
        }

        for item in items.iter().filter(|i| !i.processed) {
            if !seen.contains(&item.document_key) {
                output.entries.push(DecodedEntry {
                    item: item.clone(),
                    result: Err(DocumentError::Extraction {
                        retries: 0,
                        detail: "no output record for document".to_string(),
                    }),
                });
            }
        }
        Ok(output)
    }

    /// Ingest decoded entries serially in issue-date order and record every
    /// item's outcome on the batch.
    pub async fn ingest(
        &self,
        job: &BatchJob,
        decoded: DecodedOutput,
    ) -> Result<AggregateSummary, PipelineError> {
        let mut summary = AggregateSummary {
            artifact: decoded.artifact.clone(),
            ..AggregateSummary::default()
        };
        let mut actual_errors = decoded.stray.iter().any(BatchErrorEntry::is_actual_error);
        if !decoded.stray.is_empty() {
            self.ledger
                .apply_counters(&job.id, CounterDelta::default(), &decoded.stray)
                .await?;
        }

        // Extraction failures count toward the breaker, in output order.
        let breaker = CircuitBreaker::new(self.config.circuit_breaker_threshold);
        let mut ready: Vec<(BatchItem, ExtractedInvoice)> = Vec::new();
        for entry in decoded.entries {
            match entry.result {
                Ok(invoice) => ready.push((entry.item, invoice)),
                Err(e) => {
                    actual_errors = true;
                    breaker.record_failure(&e);
                    self.record_failure(job, &entry.item, &e, &mut summary).await?;
                }
            }
        }
        ready.sort_by_key(|(_, invoice)| invoice.sort_key());

        let mut cache = ResolutionCache::new();
        for (item, invoice) in ready {
            if breaker.is_open() {
                actual_errors = true;
                self.record_failure(job, &item, &breaker.skip_error(), &mut summary)
                    .await?;
                continue;
            }
            let result = self
                .engine
                .ingest(self.ledger, &invoice, &item.document_key, job.account, &mut cache)
                .await;
            match result {
                Ok(outcome) => {
                    breaker.record_success();
                    let entry = if outcome.duplicate {
                        summary.duplicates += 1;
                        notify_quietly(
                            self.notifier,
                            &job.user_id,
                            &format!(
                                "Invoice {} from {} was already stored",
                                invoice.invoice_code, item.file_name
                            ),
                            NotificationKind::DuplicateInvoice,
                            Some(&job.id),
                        )
                        .await;
                        Some(
                            BatchErrorEntry::new(
                                ErrorKind::DuplicateInvoice,
                                format!("Invoice {} already stored", invoice.invoice_code),
                            )
                            .with_file_name(item.file_name.clone())
                            .with_invoice_code(invoice.invoice_code.clone()),
                        )
                    } else {
                        None
                    };
                    if outcome.unassigned {
                        summary.unassigned += 1;
                    }
                    summary.alerts_created += outcome.alerts_created;
                    if self
                        .ledger
                        .record_item_outcome(
                            &job.id,
                            &item.document_key,
                            CounterDelta::success(),
                            entry.as_ref(),
                        )
                        .await?
                    {
                        summary.succeeded += 1;
                    } else {
                        summary.discarded += 1;
                    }
                    self.ledger.clear_pending(&item.document_key).await?;
                }
                Err(e) => {
                    breaker.record_failure(&e);
                    actual_errors = true;
                    self.record_failure(job, &item, &e, &mut summary).await?;
                }
            }
        }
        summary.circuit_breaker_tripped = breaker.is_open();

        if let Some(path) = &decoded.artifact {
            if actual_errors {
                info!(batch_id = %job.id, path = %path.display(), "Keeping job output for inspection");
            } else {
                match tokio::fs::remove_file(path).await {
                    Ok(()) => summary.artifact_removed = true,
                    Err(e) => warn!(path = %path.display(), error = %e, "Could not remove job output"),
                }
            }
        }

        info!(
            batch_id = %job.id,
            succeeded = summary.succeeded,
            duplicates = summary.duplicates,
            blocked = summary.blocked,
            failed = summary.failed,
            alerts = summary.alerts_created,
            "Aggregated job output"
        );
        Ok(summary)
    }

    async fn record_failure(
        &self,
        job: &BatchJob,
        item: &BatchItem,
        error: &DocumentError,
        summary: &mut AggregateSummary,
    ) -> Result<(), PipelineError> {
        warn!(
            batch_id = %job.id,
            document = %item.document_key,
            kind = error.kind().as_str(),
            error = %error,
            "Document failed"
        );
        let entry = BatchErrorEntry::from_document_error(error, Some(&item.file_name));
        let delta = if error.is_blocked() {
            CounterDelta::blocked()
        } else {
            CounterDelta::failure()
        };
        let recorded = self
            .ledger
            .record_item_outcome(&job.id, &item.document_key, delta, Some(&entry))
            .await?;
        self.ledger.clear_pending(&item.document_key).await?;
        if !recorded {
            summary.discarded += 1;
            return Ok(());
        }
        if error.is_blocked() {
            summary.blocked += 1;
        } else {
            summary.failed += 1;
        }
        if !matches!(error, DocumentError::CircuitBreakerOpen { .. }) {
            let kind = if error.is_blocked() {
                NotificationKind::BlockedProvider
            } else {
                NotificationKind::ExtractionFailed
            };
            notify_quietly(
                self.notifier,
                &job.user_id,
                &format!("{}: {error}", item.file_name),
                kind,
                Some(&job.id),
            )
            .await;
        }
        Ok(())
    }

    /// Output records of a finished job, with the file they were read from.
    pub async fn read_records(
        &self,
        job: &BatchJob,
        remote: &RemoteJob,
    ) -> Result<(Vec<Result<OutputRecord, String>>, Option<PathBuf>), PipelineError> {
        let dir = &self.config.scratch_dir;
        match &remote.output {
            Some(JobOutput::Inline { responses }) => {
                debug!(batch_id = %job.id, records = responses.len(), "Inline job output");
                Ok((responses.iter().map(|r| Ok(decode_record(r))).collect(), None))
            }
            Some(JobOutput::File { file_name }) => {
                tokio::fs::create_dir_all(dir)
                    .await
                    .map_err(|e| scratch_error(dir, e))?;
                let expected = output_file_name(&job.id);
                let dest = dir.join(&expected);
                let written = self
                    .retry
                    .run(
                        "download_output",
                        || self.service.download_file(file_name, &dest),
                        ServiceError::class,
                    )
                    .await
                    .map_err(|e| PipelineError::Service(e.error))?;
                debug!(batch_id = %job.id, bytes = written, "Downloaded job output");

                let path = locate_output(
                    dir,
                    &expected,
                    Duration::from_secs(self.config.output_recency_window_secs),
                )
                .await?;
                wait_for_stable(
                    &path,
                    self.config.output_stability_checks,
                    Duration::from_millis(self.config.output_stability_interval_ms),
                    Duration::from_millis(self.config.output_stability_timeout_ms),
                )
                .await?;
                let text = tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|e| scratch_error(&path, e))?;
                let records = text
                    .lines()
                    .filter(|l| !l.trim().is_empty())
                    .map(|l| decode_output_line(l).map_err(|e| e.to_string()))
                    .collect();
                Ok((records, Some(path)))
            }
            None => Err(PipelineError::OutputMissing {
                dir: dir.clone(),
                expected: job.id.clone(),
            }),
        }
    }
}

fn decode_one(
    record: &OutputRecord,
    item: &BatchItem,
    purpose: BatchPurpose,
) -> Result<ExtractedInvoice, DocumentError> {
    let result = if let Some(err) = &record.error {
        Err(DocumentError::Extraction {
            retries: 0,
            detail: err.clone(),
        })
    } else if record.truncated {
        Err(DocumentError::NeedsManualProcessing)
    } else {
        finish_extraction(parse_text(record.text.as_deref().unwrap_or_default()))
    };

    match (result, purpose, item.extracted_payload.as_deref()) {
        (Err(e), BatchPurpose::Validation, Some(payload)) => {
            warn!(
                document = %item.document_key,
                error = %e,
                "Validation output unusable, falling back to the original extraction"
            );
            finish_extraction(PartialInvoice::parse(payload))
        }
        (result, _, _) => result,
    }
}

/// Scratch file name for a job's output.
pub fn output_file_name(job_id: &str) -> String {
    let stem: String = job_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    format!("{stem}.{OUTPUT_EXTENSION}")
}

fn scratch_error(path: &Path, source: std::io::Error) -> PipelineError {
    PipelineError::Scratch {
        path: path.to_path_buf(),
        source,
    }
}

/// Find a job's output file in a shared directory.
///
/// The expected name wins. Otherwise exactly one file with the same
/// extension modified within `recency` is accepted; more than one is
/// [`PipelineError::AmbiguousOutput`].
pub async fn locate_output(
    dir: &Path,
    expected: &str,
    recency: Duration,
) -> Result<PathBuf, PipelineError> {
    let exact = dir.join(expected);
    if tokio::fs::try_exists(&exact).await.unwrap_or(false) {
        return Ok(exact);
    }
    let extension = Path::new(expected).extension().map(|e| e.to_os_string());
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| scratch_error(dir, e))?;
    let now = SystemTime::now();
    let mut candidates = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| scratch_error(dir, e))?
    {
        let path = entry.path();
        if path.extension().map(|e| e.to_os_string()) != extension {
            continue;
        }
        let meta = entry.metadata().await.map_err(|e| scratch_error(&path, e))?;
        if !meta.is_file() {
            continue;
        }
        let recent = match meta.modified() {
            Ok(modified) => now
                .duration_since(modified)
                .map(|age| age <= recency)
                .unwrap_or(true),
            Err(_) => false,
        };
        if recent {
            candidates.push(path);
        }
    }

    match candidates.len() {
        0 => Err(PipelineError::OutputMissing {
            dir: dir.to_path_buf(),
            expected: expected.to_string(),
        }),
        1 => {
            let path = candidates.remove(0);
            warn!(expected, found = %path.display(), "Expected output missing, using the only recent candidate");
            Ok(path)
        }
        _ => {
            candidates.sort();
            Err(PipelineError::AmbiguousOutput {
                dir: dir.to_path_buf(),
                candidates,
            })
        }
    }
}

/// Wait until `checks` consecutive size readings agree.
pub async fn wait_for_stable(
    path: &Path,
    checks: u32,
    interval: Duration,
    timeout: Duration,
) -> Result<u64, PipelineError> {
    let started = Instant::now();
    let mut last: Option<u64> = None;
    let mut agreeing = 0u32;
    loop {
        let len = tokio::fs::metadata(path)
            .await
            .map_err(|e| scratch_error(path, e))?
            .len();
        if last == Some(len) {
            agreeing += 1;
        } else {
            last = Some(len);
            agreeing = 1;
        }
        if agreeing >= checks.max(1) {
            return Ok(len);
        }
        if started.elapsed() >= timeout {
            return Err(PipelineError::OutputUnstable {
                path: path.to_path_buf(),
                waited_ms: started.elapsed().as_millis() as u64,
            });
        }
        sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_names_are_flat() {
        assert_eq!(output_file_name("batches/abc-1"), "batches_abc-1.jsonl");
    }

    #[tokio::test]
    async fn expected_name_wins_over_other_candidates() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("job_a.jsonl"), "{}").unwrap();
        std::fs::write(dir.path().join("job_b.jsonl"), "{}").unwrap();
        let found = locate_output(dir.path(), "job_a.jsonl", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(found.ends_with("job_a.jsonl"));
    }

    #[tokio::test]
    async fn single_recent_candidate_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("other.jsonl"), "{}").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "x").unwrap();
        let found = locate_output(dir.path(), "job_a.jsonl", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(found.ends_with("other.jsonl"));
    }

    #[tokio::test]
    async fn two_candidates_are_ambiguous() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("x.jsonl"), "{}").unwrap();
        std::fs::write(dir.path().join("y.jsonl"), "{}").unwrap();
        match locate_output(dir.path(), "job_a.jsonl", Duration::from_secs(60)).await {
            Err(PipelineError::AmbiguousOutput { candidates, .. }) => assert_eq!(candidates.len(), 2),
            other => panic!("expected ambiguity, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn nothing_to_find() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            locate_output(dir.path(), "job_a.jsonl", Duration::from_secs(60)).await,
            Err(PipelineError::OutputMissing { .. })
        ));
    }

    #[tokio::test]
    async fn stable_file_passes_probe() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.jsonl");
        std::fs::write(&path, "line\n").unwrap();
        let len = wait_for_stable(&path, 3, Duration::from_millis(1), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(len, 5);
    }

    #[test]
    fn truncated_record_needs_manual_processing() {
        let item = BatchItem::new("b1", "k1", "a.pdf");
        let record = OutputRecord {
            key: Some("k1".into()),
            text: Some("HEADER|F-1|2024-01-01|10.00".into()),
            truncated: true,
            error: None,
        };
        assert_eq!(
            decode_one(&record, &item, BatchPurpose::Extraction),
            Err(DocumentError::NeedsManualProcessing)
        );
    }
}
