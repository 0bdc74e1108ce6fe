//! # invoice-pipeline
//!
//! Extract supplier invoices from PDFs with an LLM and reconcile them into a
//! price ledger: providers, materials, invoices, line items and price alerts.
//!
//! ## Why this crate?
//!
//! Supplier invoices are the only reliable record of what a material cost
//! and when. Reading them by hand does not scale, and a naive "one LLM call,
//! one insert" loop breaks down quickly: providers come back under three
//! spellings, the same material gets a new code on every invoice, and price
//! alerts fire in the wrong direction when invoices are ingested out of
//! date order. This crate resolves entities against what the ledger already
//! knows, ingests serially in issue-date order, and keeps per-document
//! failures from sinking the rest of an upload.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDFs
//!  │
//!  ├─ 1. Submit    sync: extraction waves now │ batch: JSONL chunks → remote jobs
//!  ├─ 2. Extract   compact line protocol (or JSON) → ExtractedInvoice
//!  ├─ 3. Reconcile poll remote jobs, claim completion, decode output
//!  ├─ 4. Resolve   provider / material / account lookups (+ creation)
//!  ├─ 5. Ingest    one transaction per invoice, date-ordered, price alerts
//!  └─ 6. Report    per-file outcomes, batch counters, notifications
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use invoice_pipeline::{
//!     Document, LlmCompletionClient, LlmExtractor, MemoryLedger, NoopNotifier,
//!     PipelineConfig, SyncUploader,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Provider auto-detected from OPENAI_API_KEY / ANTHROPIC_API_KEY / GEMINI_API_KEY
//!     let config = PipelineConfig::default();
//!     let client = Arc::new(LlmCompletionClient::from_config(&config)?);
//!     let extractor = Arc::new(LlmExtractor::from_config(client, &config));
//!     let uploader = SyncUploader::new(
//!         config,
//!         Arc::new(MemoryLedger::new()),
//!         extractor,
//!         Arc::new(NoopNotifier),
//!     );
//!
//!     let doc = Document::from_path("invoice.pdf").await?;
//!     let report = uploader.submit_documents_sync("user-1", vec![doc]).await?;
//!     eprintln!("{} stored, {} failed", report.successful, report.failed);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature    | Default | Description |
//! |------------|---------|-------------|
//! | `cli`      | on      | Enables the `invoice-pipeline` binary (clap + anyhow + tracing-subscriber + indicatif) |
//! | `postgres` | off     | [`PgLedger`], a PostgreSQL-backed ledger via sqlx |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! invoice-pipeline = { version = "0.3", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod batch;
pub mod codec;
pub mod concurrency;
pub mod config;
pub mod document;
pub mod error;
pub mod extract;
pub mod ingest;
pub mod ledger;
pub mod model;
pub mod notify;
pub mod progress;
pub mod prompts;
pub mod resolver;
pub mod retry;
pub mod service;
pub mod upload;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use batch::{BatchManager, BatchProgressInfo, ReconcileOutcome, SubmitReceipt, SweepReport};
pub use codec::{ExtractedInvoice, ExtractedItem};
pub use config::{ExtractionMode, PipelineConfig, PipelineConfigBuilder};
pub use document::Document;
pub use error::{BatchErrorEntry, DocumentError, ErrorKind, PipelineError};
pub use extract::{DocumentExtractor, LlmCompletionClient, LlmExtractor};
pub use ingest::{IngestOutcome, IngestionEngine};
pub use ledger::{Ledger, MemoryLedger};
#[cfg(feature = "postgres")]
pub use ledger::PgLedger;
pub use model::{BatchJob, BatchPurpose, BatchStatus};
pub use notify::{NoopNotifier, Notifier, TracingNotifier};
pub use progress::{IngestProgressCallback, ProgressCallback};
pub use resolver::EntityResolver;
pub use service::{BatchService, GeminiBatchService};
pub use upload::{DocumentOutcome, OutcomeStatus, SyncUploader, UploadReport};
