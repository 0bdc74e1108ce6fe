//! Error types for the invoice-pipeline library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`PipelineError`]: **Fatal**: the operation cannot proceed at all
//!   (bad configuration, the remote job cannot be created, the ledger stays
//!   unavailable after every retry, the job output cannot be located).
//!   Returned as `Err(PipelineError)` from the top-level entry points.
//!
//! * [`DocumentError`]: **Non-fatal**: a single document failed (extraction
//!   error, blocked provider, malformed output) but every other document in
//!   the batch is fine. Stored inside per-document outcomes and folded into
//!   the batch's structured error list, never propagated upward.
//!
//! Remote-call and store failures ([`ServiceError`], [`LedgerError`]) carry a
//! classification consumed by [`crate::retry::RetryPolicy`].

use crate::retry::ErrorClass;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the invoice-pipeline library.
#[derive(Debug, Error)]
pub enum PipelineError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("Document not found: '{path}'")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'")]
    PermissionDenied { path: PathBuf },

    /// The file exists and was read, but is not a PDF.
    #[error("File is not a valid PDF: '{path}'\nFirst bytes: {magic:?}")]
    NotAPdf { path: PathBuf, magic: [u8; 4] },

    /// Nothing to do: the submission carried no documents.
    #[error("No documents submitted")]
    EmptySubmission,

    // ── Extraction service errors ─────────────────────────────────────────
    /// The configured provider is not initialised (missing API key etc.).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    /// A remote call failed after the retry budget was spent.
    #[error("Extraction service error: {0}")]
    Service(#[from] ServiceError),

    /// The remote job for a payload chunk could not be created at all.
    #[error("Failed to submit chunk {chunk} ({documents} documents): {detail}")]
    JobSubmissionFailed {
        chunk: usize,
        documents: usize,
        detail: String,
    },

    // ── Ledger errors ─────────────────────────────────────────────────────
    /// The ledger store failed after the retry budget was spent.
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// No local batch record exists for the given id.
    #[error("Batch '{id}' not found")]
    BatchNotFound { id: String },

    // ── Job output errors ─────────────────────────────────────────────────
    /// More than one candidate output file matched; never guess between them.
    #[error("Ambiguous job output in '{dir}': {} candidates ({candidates:?})", .candidates.len())]
    AmbiguousOutput {
        dir: PathBuf,
        candidates: Vec<PathBuf>,
    },

    /// No candidate output file could be found for a completed job.
    #[error("No output file matching '{expected}' found in '{dir}'")]
    OutputMissing { dir: PathBuf, expected: String },

    /// The output file kept growing past the stability probe budget.
    #[error("Output file '{path}' did not stabilise after {waited_ms}ms")]
    OutputUnstable { path: PathBuf, waited_ms: u64 },

    /// Reading or writing the scratch area failed.
    #[error("Scratch area I/O failed for '{path}': {source}")]
    Scratch {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Failure of a call to the remote extraction service.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ServiceError {
    /// HTTP 429 or an equivalent quota message; back off exponentially.
    #[error("Rate limit exceeded for '{service}'")]
    RateLimited {
        service: String,
        retry_after_secs: Option<u64>,
    },

    /// The call did not answer within the configured timeout.
    #[error("Call to '{service}' timed out after {secs}s")]
    Timeout { service: String, secs: u64 },

    /// 5xx, connection reset and similar; retry with a short fixed delay.
    #[error("Transient service error: {0}")]
    Transient(String),

    /// 401/403; retrying will not help.
    #[error("Authentication error from '{service}': {detail}")]
    Auth { service: String, detail: String },

    /// The service or the local process ran out of memory on this document.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Any other non-retryable API error.
    #[error("Service API error: {0}")]
    Api(String),

    /// The service answered, but not in a shape we understand.
    #[error("Malformed service response: {0}")]
    Malformed(String),
}

impl ServiceError {
    /// Retry classification of this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            ServiceError::RateLimited { .. } => ErrorClass::RateLimited,
            ServiceError::Timeout { .. } | ServiceError::Transient(_) => ErrorClass::Transient,
            ServiceError::Auth { .. }
            | ServiceError::ResourceExhausted(_)
            | ServiceError::Api(_)
            | ServiceError::Malformed(_) => ErrorClass::Fatal,
        }
    }

    /// Classify a free-form provider error message.
    ///
    /// Provider SDKs surface most failures as strings; the patterns below
    /// cover the wording used by OpenAI, Anthropic and Gemini.
    pub fn from_message(service: &str, message: &str) -> Self {
        let lower = message.to_lowercase();
        if lower.contains("429")
            || lower.contains("rate limit")
            || lower.contains("resource_exhausted")
            || lower.contains("quota")
        {
            ServiceError::RateLimited {
                service: service.to_string(),
                retry_after_secs: None,
            }
        } else if lower.contains("out of memory") || lower.contains("heap") {
            ServiceError::ResourceExhausted(message.to_string())
        } else if lower.contains("401") || lower.contains("403") || lower.contains("api key") {
            ServiceError::Auth {
                service: service.to_string(),
                detail: message.to_string(),
            }
        } else if lower.contains("timeout")
            || lower.contains("timed out")
            || lower.contains("500")
            || lower.contains("502")
            || lower.contains("503")
            || lower.contains("504")
            || lower.contains("unavailable")
            || lower.contains("overloaded")
            || lower.contains("connection")
        {
            ServiceError::Transient(message.to_string())
        } else {
            ServiceError::Api(message.to_string())
        }
    }
}

/// Failure of the ledger store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LedgerError {
    /// Connection lost, pool timeout, serialization failure: retryable.
    #[error("Ledger unavailable: {0}")]
    Unavailable(String),

    /// A row the caller relies on does not exist.
    #[error("{entity} '{id}' not found in ledger")]
    NotFound { entity: &'static str, id: String },

    /// A stored value could not be decoded.
    #[error("Corrupt ledger row: {0}")]
    Corrupt(String),

    /// Any other store error.
    #[error("Ledger backend error: {0}")]
    Backend(String),
}

impl LedgerError {
    /// Retry classification of this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            LedgerError::Unavailable(_) => ErrorClass::Transient,
            _ => ErrorClass::Fatal,
        }
    }
}

/// The externally visible error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Service or codec failure before a candidate invoice exists.
    ExtractionError,
    /// Malformed output line.
    ParsingError,
    /// Not a failure; recorded for visibility only.
    DuplicateInvoice,
    /// Policy rejection, never retried.
    BlockedProvider,
    /// Store failure that outlived its retry budget.
    DatabaseError,
    /// Catch-all.
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ExtractionError => "EXTRACTION_ERROR",
            ErrorKind::ParsingError => "PARSING_ERROR",
            ErrorKind::DuplicateInvoice => "DUPLICATE_INVOICE",
            ErrorKind::BlockedProvider => "BLOCKED_PROVIDER",
            ErrorKind::DatabaseError => "DATABASE_ERROR",
            ErrorKind::Unknown => "UNKNOWN",
        }
    }
}

/// A non-fatal error for a single document.
///
/// The batch continues; the error is counted and recorded as a
/// [`BatchErrorEntry`].
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
pub enum DocumentError {
    /// The extraction call failed after retries.
    #[error("Extraction failed after {retries} retries: {detail}")]
    Extraction { retries: u32, detail: String },

    /// A batch-mode response was cut at the token limit; no continuation is
    /// possible inside a batch, so the document is rejected outright.
    #[error("Response truncated at the output limit; document needs manual processing")]
    NeedsManualProcessing,

    /// The response could not be decoded into an invoice.
    #[error("Could not parse extraction output: {detail}")]
    Parsing { detail: String },

    /// No invoice number and no items: nothing worth an invoice row.
    #[error("Empty extraction: no invoice number and no items")]
    EmptyExtraction,

    /// The provider is on the denylist.
    #[error("Provider '{provider}' is blocked")]
    BlockedProvider { provider: String },

    /// The ledger failed after the retry budget.
    #[error("Database error after {attempts} attempts: {detail}")]
    Database { attempts: u32, detail: String },

    /// Memory exhaustion while handling this document; not retried.
    #[error("Resource exhausted: {detail}")]
    ResourceExhausted { detail: String },

    /// Skipped because the upload's circuit breaker tripped.
    #[error("Not attempted: circuit breaker open after {failures} consecutive failures")]
    CircuitBreakerOpen { failures: u32 },

    /// The batch reached a terminal failure state before this document was processed.
    #[error("Batch {status}: document was not processed")]
    BatchTerminated { status: String },

    /// Anything else.
    #[error("{detail}")]
    Unknown { detail: String },
}

impl DocumentError {
    /// Taxonomy bucket of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DocumentError::Extraction { .. }
            | DocumentError::NeedsManualProcessing
            | DocumentError::EmptyExtraction
            | DocumentError::ResourceExhausted { .. } => ErrorKind::ExtractionError,
            DocumentError::Parsing { .. } => ErrorKind::ParsingError,
            DocumentError::BlockedProvider { .. } => ErrorKind::BlockedProvider,
            DocumentError::Database { .. } => ErrorKind::DatabaseError,
            DocumentError::CircuitBreakerOpen { .. }
            | DocumentError::BatchTerminated { .. }
            | DocumentError::Unknown { .. } => ErrorKind::Unknown,
        }
    }

    /// Blocked-provider rejections never count towards the circuit breaker.
    pub fn is_blocked(&self) -> bool {
        matches!(self, DocumentError::BlockedProvider { .. })
    }

    /// Map a service failure that survived the retry policy.
    pub fn from_service(err: &ServiceError, retries: u32) -> Self {
        match err {
            ServiceError::ResourceExhausted(detail) => DocumentError::ResourceExhausted {
                detail: detail.clone(),
            },
            other => DocumentError::Extraction {
                retries,
                detail: other.to_string(),
            },
        }
    }
}

/// One user-visible entry in a batch's structured error list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchErrorEntry {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invoice_code: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl BatchErrorEntry {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            file_name: None,
            invoice_code: None,
            timestamp: Utc::now(),
        }
    }

    pub fn from_document_error(err: &DocumentError, file_name: Option<&str>) -> Self {
        Self {
            file_name: file_name.map(str::to_string),
            ..Self::new(err.kind(), err.to_string())
        }
    }

    pub fn with_file_name(mut self, name: impl Into<String>) -> Self {
        self.file_name = Some(name.into());
        self
    }

    pub fn with_invoice_code(mut self, code: impl Into<String>) -> Self {
        self.invoice_code = Some(code.into());
        self
    }

    /// Duplicates are informational; every other kind is an actual error.
    pub fn is_actual_error(&self) -> bool {
        self.kind != ErrorKind::DuplicateInvoice
    }
}
