//! Backpressure for upload sessions: an adaptive extraction cap and a
//! circuit breaker.
//!
//! The cap starts from `concurrency`, widens to `max_concurrency` for small
//! uploads, and shrinks while resident memory has grown past the soft or
//! hard threshold relative to the session baseline. It is re-read before
//! every extraction wave, so pressure observed mid-session narrows the next
//! wave.

use crate::config::PipelineConfig;
use crate::error::DocumentError;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Source of the process's resident memory.
pub trait MemoryProbe: Send + Sync {
    /// Resident set size in MiB, if it can be measured.
    fn resident_mb(&self) -> Option<u64>;
}

/// Reads `/proc/self/statm`; reports nothing on other platforms.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcMemoryProbe;

impl MemoryProbe for ProcMemoryProbe {
    fn resident_mb(&self) -> Option<u64> {
        const PAGE_SIZE: u64 = 4096;
        let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
        let pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
        Some(pages * PAGE_SIZE / (1024 * 1024))
    }
}

/// Extraction concurrency cap for one session.
pub struct AdaptiveConcurrency {
    base: usize,
    min: usize,
    max: usize,
    small_batch_threshold: usize,
    soft_limit_mb: u64,
    hard_limit_mb: u64,
    baseline_mb: Option<u64>,
    probe: Arc<dyn MemoryProbe>,
}

impl AdaptiveConcurrency {
    pub fn new(config: &PipelineConfig, probe: Arc<dyn MemoryProbe>) -> Self {
        let baseline_mb = probe.resident_mb();
        Self {
            base: config.concurrency,
            min: config.min_concurrency.max(1),
            max: config.max_concurrency.max(1),
            small_batch_threshold: config.small_batch_threshold,
            soft_limit_mb: config.memory_soft_limit_mb,
            hard_limit_mb: config.memory_hard_limit_mb,
            baseline_mb,
            probe,
        }
    }

    /// Cap before any memory pressure is taken into account.
    pub fn initial(&self, documents: usize) -> usize {
        if documents <= self.small_batch_threshold {
            documents.clamp(1, self.max)
        } else {
            self.base.clamp(self.min, self.max)
        }
    }

    /// Cap for the next wave.
    pub fn current(&self, documents: usize) -> usize {
        let cap = self.initial(documents);
        let growth = match (self.baseline_mb, self.probe.resident_mb()) {
            (Some(base), Some(now)) => now.saturating_sub(base),
            _ => return cap,
        };
        if growth >= self.hard_limit_mb {
            warn!(growth_mb = growth, cap = self.min, "Memory hard limit reached, narrowing extraction");
            self.min
        } else if growth >= self.soft_limit_mb {
            let reduced = (cap / 2).max(self.min);
            warn!(growth_mb = growth, cap = reduced, "Memory soft limit reached, narrowing extraction");
            reduced
        } else {
            debug!(growth_mb = growth, cap, "Extraction cap");
            cap
        }
    }
}

/// Halts an upload after too many consecutive failures.
///
/// Blocked-provider rejections are policy, not failure: they neither count
/// nor reset the streak. A threshold of zero disables the breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    consecutive: AtomicU32,
    open: AtomicBool,
}

impl CircuitBreaker {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            consecutive: AtomicU32::new(0),
            open: AtomicBool::new(false),
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Consecutive failures counted so far.
    pub fn failures(&self) -> u32 {
        self.consecutive.load(Ordering::SeqCst)
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Success or duplicate.
    pub fn record_success(&self) {
        if !self.is_open() {
            self.consecutive.store(0, Ordering::SeqCst);
        }
    }

    /// Returns `true` when this failure opened the breaker.
    pub fn record_failure(&self, error: &DocumentError) -> bool {
        if error.is_blocked() || self.threshold == 0 || self.is_open() {
            return false;
        }
        let n = self.consecutive.fetch_add(1, Ordering::SeqCst) + 1;
        if n >= self.threshold && !self.open.swap(true, Ordering::SeqCst) {
            warn!(failures = n, "Circuit breaker opened, remaining documents will not be attempted");
            return true;
        }
        false
    }

    /// Error recorded for documents skipped while open.
    pub fn skip_error(&self) -> DocumentError {
        DocumentError::CircuitBreakerOpen {
            failures: self.failures(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    struct FakeProbe(AtomicU64);

    impl MemoryProbe for FakeProbe {
        fn resident_mb(&self) -> Option<u64> {
            Some(self.0.load(Ordering::SeqCst))
        }
    }

    fn config() -> PipelineConfig {
        PipelineConfig::builder()
            .concurrency(6)
            .concurrency_bounds(1, 10)
            .small_batch_threshold(3)
            .memory_limits_mb(100, 200)
            .build()
            .unwrap()
    }

    #[test]
    fn small_batches_widen_and_memory_narrows() {
        let probe = Arc::new(FakeProbe(AtomicU64::new(50)));
        let limiter = AdaptiveConcurrency::new(&config(), probe.clone());
        assert_eq!(limiter.current(2), 2);
        assert_eq!(limiter.current(40), 6);

        probe.0.store(160, Ordering::SeqCst);
        assert_eq!(limiter.current(40), 3);
        probe.0.store(400, Ordering::SeqCst);
        assert_eq!(limiter.current(40), 1);
    }

    #[test]
    fn breaker_opens_after_threshold_and_ignores_blocked() {
        let breaker = CircuitBreaker::new(3);
        let fail = DocumentError::Unknown { detail: "x".into() };
        let blocked = DocumentError::BlockedProvider { provider: "p".into() };

        assert!(!breaker.record_failure(&fail));
        assert!(!breaker.record_failure(&blocked));
        breaker.record_success();
        assert_eq!(breaker.failures(), 0);

        assert!(!breaker.record_failure(&fail));
        assert!(!breaker.record_failure(&blocked));
        assert!(!breaker.record_failure(&fail));
        assert!(breaker.record_failure(&fail));
        assert!(breaker.is_open());
        assert!(!breaker.record_failure(&fail));
        assert_eq!(
            breaker.skip_error(),
            DocumentError::CircuitBreakerOpen { failures: 3 }
        );
    }

    #[test]
    fn zero_threshold_disables() {
        let breaker = CircuitBreaker::new(0);
        for _ in 0..10 {
            breaker.record_failure(&DocumentError::EmptyExtraction);
        }
        assert!(!breaker.is_open());
    }
}
