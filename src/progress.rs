//! Progress-callback trait for per-document upload events.
//!
//! Inject an [`Arc<dyn IngestProgressCallback>`] via
//! [`crate::config::PipelineConfigBuilder::progress_callback`] to receive
//! events as a synchronous upload session extracts and ingests each document.
//!
//! Callers can forward events to a channel, a WebSocket or a terminal
//! progress bar without the library knowing how the host communicates. The
//! trait is `Send + Sync` because extraction runs concurrently.
//!
//! # Example
//!
//! ```rust
//! use invoice_pipeline::{IngestProgressCallback, PipelineConfig};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     ingested: Arc<AtomicUsize>,
//! }
//!
//! impl IngestProgressCallback for CountingCallback {
//!     fn on_document_ingested(&self, index: usize, total: usize, invoice_code: &str) {
//!         self.ingested.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("Document {}/{} stored as {}", index + 1, total, invoice_code);
//!     }
//! }
//!
//! let counter = Arc::new(CountingCallback {
//!     ingested: Arc::new(AtomicUsize::new(0)),
//! });
//!
//! let config = PipelineConfig::builder()
//!     .progress_callback(counter as Arc<dyn IngestProgressCallback>)
//!     .build()
//!     .unwrap();
//! ```

use std::sync::Arc;

/// Called by an upload session as it processes each document.
///
/// All methods have default no-op implementations so callers only override
/// what they care about.
///
/// # Thread safety
///
/// `on_extraction_start` and `on_extraction_complete` may be called
/// concurrently from different tasks. Ingestion callbacks are serialised.
pub trait IngestProgressCallback: Send + Sync {
    /// Called once before any document is extracted.
    fn on_session_start(&self, total: usize) {
        let _ = total;
    }

    /// Called just before the extraction request is sent.
    ///
    /// # Arguments
    /// * `index`: 0-based position in the submission
    /// * `total`: documents in the submission
    fn on_extraction_start(&self, index: usize, total: usize) {
        let _ = (index, total);
    }

    /// Called when extraction produced a candidate invoice.
    fn on_extraction_complete(&self, index: usize, total: usize, item_count: usize) {
        let _ = (index, total, item_count);
    }

    /// Called when the invoice was committed to the ledger (or found to be a
    /// duplicate of a stored one).
    fn on_document_ingested(&self, index: usize, total: usize, invoice_code: &str) {
        let _ = (index, total, invoice_code);
    }

    /// Called when a document failed at any stage.
    ///
    /// # Arguments
    /// * `kind` : error taxonomy bucket, e.g. `"BLOCKED_PROVIDER"`
    /// * `error`: human-readable description
    fn on_document_error(&self, index: usize, total: usize, kind: &str, error: &str) {
        let _ = (index, total, kind, error);
    }

    /// Called once after every document has been attempted or skipped.
    fn on_session_complete(&self, total: usize, success_count: usize) {
        let _ = (total, success_count);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl IngestProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::PipelineConfig`].
pub type ProgressCallback = Arc<dyn IngestProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct TrackingCallback {
        extracted: AtomicUsize,
        ingested: AtomicUsize,
        errors: Mutex<Vec<String>>,
        completed_total: AtomicUsize,
    }

    impl IngestProgressCallback for TrackingCallback {
        fn on_extraction_complete(&self, _index: usize, _total: usize, _item_count: usize) {
            self.extracted.fetch_add(1, Ordering::SeqCst);
        }

        fn on_document_ingested(&self, _index: usize, _total: usize, _invoice_code: &str) {
            self.ingested.fetch_add(1, Ordering::SeqCst);
        }

        fn on_document_error(&self, _index: usize, _total: usize, kind: &str, _error: &str) {
            self.errors.lock().unwrap().push(kind.to_string());
        }

        fn on_session_complete(&self, _total: usize, success_count: usize) {
            self.completed_total.store(success_count, Ordering::SeqCst);
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        cb.on_session_start(3);
        cb.on_extraction_start(0, 3);
        cb.on_extraction_complete(0, 3, 12);
        cb.on_document_ingested(0, 3, "F-001");
        cb.on_document_error(1, 3, "PARSING_ERROR", "bad line");
        cb.on_session_complete(3, 1);
    }

    #[test]
    fn tracking_callback_receives_events() {
        let tracker = TrackingCallback::default();
        tracker.on_extraction_complete(0, 2, 4);
        tracker.on_document_ingested(0, 2, "F-001");
        tracker.on_document_error(1, 2, "BLOCKED_PROVIDER", "blocked");
        tracker.on_session_complete(2, 1);

        assert_eq!(tracker.extracted.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.ingested.load(Ordering::SeqCst), 1);
        assert_eq!(*tracker.errors.lock().unwrap(), vec!["BLOCKED_PROVIDER"]);
        assert_eq!(tracker.completed_total.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn arc_dyn_callback_works() {
        let cb: Arc<dyn IngestProgressCallback> = Arc::new(NoopProgressCallback);
        cb.on_session_start(10);
        cb.on_extraction_start(0, 10);
    }
}
