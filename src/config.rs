//! Configuration types for the extraction and reconciliation pipeline.
//!
//! All behaviour is controlled through [`PipelineConfig`], built via its
//! [`PipelineConfigBuilder`] or overlaid from the environment with
//! [`PipelineConfig::from_env`]. One struct for every knob keeps sessions,
//! the batch manager and the poller looking at the same limits.

use crate::error::PipelineError;
use crate::progress::ProgressCallback;
use edgequake_llm::LLMProvider;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Configuration for extraction sessions, batch submission and reconciliation.
///
/// # Example
/// ```rust
/// use invoice_pipeline::PipelineConfig;
///
/// let config = PipelineConfig::builder()
///     .concurrency(4)
///     .circuit_breaker_threshold(5)
///     .model("gemini-2.5-flash")
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    // ── Single-document extraction ───────────────────────────────────────
    /// LLM model identifier used for single-document calls.
    /// If None, uses the provider default.
    pub model: Option<String>,

    /// LLM provider name (e.g. "openai", "gemini").
    /// If None along with `provider`, the provider is auto-detected.
    pub provider_name: Option<String>,

    /// Pre-constructed LLM provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Sampling temperature. Default: 0.1.
    ///
    /// Extraction is transcription, not generation; low temperature keeps
    /// the model faithful to the printed figures.
    pub temperature: f32,

    /// Maximum tokens the model may generate per call. Default: 8192.
    ///
    /// A response that reaches this cap is treated as truncated.
    pub max_tokens: usize,

    /// Output encoding requested from the model. Default: [`ExtractionMode::Compact`].
    pub extraction_mode: ExtractionMode,

    /// Custom extraction prompt. If None, uses the built-in prompt.
    pub system_prompt: Option<String>,

    /// Per-call timeout in seconds. Default: 120.
    pub api_timeout_secs: u64,

    // ── Retry ────────────────────────────────────────────────────────────
    /// Retries after the first attempt at every remote call site. Default: 3.
    pub max_retries: u32,

    /// Fixed delay between transient retries, in milliseconds. Default: 500.
    pub retry_backoff_ms: u64,

    /// Base delay for rate-limit backoff, doubling per attempt. Default: 2000.
    pub rate_limit_backoff_ms: u64,

    /// Cap for a single rate-limit delay. Default: 60 000.
    pub rate_limit_backoff_cap_ms: u64,

    // ── Concurrency & backpressure ───────────────────────────────────────
    /// Base number of concurrent extraction calls. Default: 5.
    pub concurrency: usize,

    /// Floor the adaptive cap never drops below. Default: 1.
    pub min_concurrency: usize,

    /// Ceiling the adaptive cap may widen to for small batches. Default: 10.
    pub max_concurrency: usize,

    /// Uploads at or below this many documents run fully in parallel
    /// (bounded by `max_concurrency`). Default: 3.
    pub small_batch_threshold: usize,

    /// Resident-memory growth (MiB) above the session baseline that halves
    /// the cap. Default: 512.
    pub memory_soft_limit_mb: u64,

    /// Growth (MiB) that drops the cap to `min_concurrency`. Default: 1024.
    pub memory_hard_limit_mb: u64,

    /// Consecutive non-blocked failures that halt an upload. Default: 5.
    pub circuit_breaker_threshold: u32,

    // ── Batch service ────────────────────────────────────────────────────
    /// Model used for asynchronous batch jobs. Default: "gemini-2.5-flash".
    pub batch_model: String,

    /// Base URL of the batch REST service.
    pub service_base_url: String,

    /// API key for the batch REST service.
    pub service_api_key: Option<String>,

    /// Maximum serialized size of one job payload chunk. Default: 100 MiB.
    pub chunk_max_bytes: usize,

    /// Chunks at or below this size are sent inline instead of as an
    /// uploaded file. Default: 15 MiB.
    pub inline_payload_max_bytes: usize,

    /// Spawn a VALIDATION round-trip after extraction. Default: false.
    pub validate_extractions: bool,

    /// Seconds between reconciliation sweeps. Default: 30.
    pub poll_interval_secs: u64,

    /// Delay between admins within one sweep, in milliseconds. Default: 1000.
    pub admin_stagger_ms: u64,

    // ── Job output artefacts ─────────────────────────────────────────────
    /// Shared scratch directory for downloaded job output.
    pub scratch_dir: PathBuf,

    /// Consecutive equal size readings required before a download is
    /// trusted. Default: 3.
    pub output_stability_checks: u32,

    /// Delay between size readings, in milliseconds. Default: 250.
    pub output_stability_interval_ms: u64,

    /// Give up waiting for a stable size after this long. Default: 30 000.
    pub output_stability_timeout_ms: u64,

    /// A lone recent file of the expected extension is accepted when it was
    /// modified within this window. Default: 120.
    pub output_recency_window_secs: u64,

    /// History rows created within this many seconds of each other are
    /// shown as one session. Default: 300.
    pub history_group_window_secs: u64,

    // ── Entity resolution ────────────────────────────────────────────────
    /// Provider names (any spelling) that must never be ingested.
    pub blocked_providers: Vec<String>,

    /// Known alternative provider names, mapped to the provider's CIF.
    pub provider_aliases: HashMap<String, String>,

    /// Suffix attempts when a generated material code collides. Default: 5.
    pub material_code_max_attempts: u32,

    // ── Callbacks ────────────────────────────────────────────────────────
    /// Per-document progress events for synchronous sessions.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            model: None,
            provider_name: None,
            provider: None,
            temperature: 0.1,
            max_tokens: 8192,
            extraction_mode: ExtractionMode::default(),
            system_prompt: None,
            api_timeout_secs: 120,
            max_retries: 3,
            retry_backoff_ms: 500,
            rate_limit_backoff_ms: 2_000,
            rate_limit_backoff_cap_ms: 60_000,
            concurrency: 5,
            min_concurrency: 1,
            max_concurrency: 10,
            small_batch_threshold: 3,
            memory_soft_limit_mb: 512,
            memory_hard_limit_mb: 1024,
            circuit_breaker_threshold: 5,
            batch_model: "gemini-2.5-flash".to_string(),
            service_base_url: "https://generativelanguage.googleapis.com".to_string(),
            service_api_key: None,
            chunk_max_bytes: 100 * 1024 * 1024,
            inline_payload_max_bytes: 15 * 1024 * 1024,
            validate_extractions: false,
            poll_interval_secs: 30,
            admin_stagger_ms: 1_000,
            scratch_dir: std::env::temp_dir().join("invoice-pipeline"),
            output_stability_checks: 3,
            output_stability_interval_ms: 250,
            output_stability_timeout_ms: 30_000,
            output_recency_window_secs: 120,
            history_group_window_secs: 300,
            blocked_providers: Vec::new(),
            provider_aliases: HashMap::new(),
            material_code_max_attempts: 5,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("extraction_mode", &self.extraction_mode)
            .field("max_retries", &self.max_retries)
            .field("concurrency", &self.concurrency)
            .field("min_concurrency", &self.min_concurrency)
            .field("max_concurrency", &self.max_concurrency)
            .field("circuit_breaker_threshold", &self.circuit_breaker_threshold)
            .field("batch_model", &self.batch_model)
            .field("service_base_url", &self.service_base_url)
            .field("service_api_key", &self.service_api_key.as_ref().map(|_| "<redacted>"))
            .field("chunk_max_bytes", &self.chunk_max_bytes)
            .field("validate_extractions", &self.validate_extractions)
            .field("scratch_dir", &self.scratch_dir)
            .field("blocked_providers", &self.blocked_providers)
            .finish()
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    /// Defaults overlaid with `INVOICE_PIPELINE_*` environment variables.
    ///
    /// Unparseable values are ignored and the default kept.
    pub fn from_env() -> Result<Self, PipelineError> {
        let mut b = Self::builder();

        if let Some(v) = env_string("INVOICE_PIPELINE_MODEL") {
            b = b.model(v);
        }
        if let Some(v) = env_string("INVOICE_PIPELINE_PROVIDER") {
            b = b.provider_name(v);
        }
        if let Some(v) = env_parse::<usize>("INVOICE_PIPELINE_MAX_TOKENS") {
            b = b.max_tokens(v);
        }
        if let Some(v) = env_string("INVOICE_PIPELINE_EXTRACTION_MODE") {
            if let Ok(mode) = v.parse() {
                b = b.extraction_mode(mode);
            }
        }
        if let Some(v) = env_parse::<u32>("INVOICE_PIPELINE_MAX_RETRIES") {
            b = b.max_retries(v);
        }
        if let Some(v) = env_parse::<usize>("INVOICE_PIPELINE_CONCURRENCY") {
            b = b.concurrency(v);
        }
        if let Some(v) = env_parse::<u32>("INVOICE_PIPELINE_CIRCUIT_BREAKER") {
            b = b.circuit_breaker_threshold(v);
        }
        if let Some(v) = env_string("INVOICE_PIPELINE_BATCH_MODEL") {
            b = b.batch_model(v);
        }
        if let Some(v) = env_string("INVOICE_PIPELINE_SERVICE_URL") {
            b = b.service_base_url(v);
        }
        if let Some(v) =
            env_string("INVOICE_PIPELINE_SERVICE_API_KEY").or_else(|| env_string("GEMINI_API_KEY"))
        {
            b = b.service_api_key(v);
        }
        if let Some(v) = env_parse::<usize>("INVOICE_PIPELINE_CHUNK_MAX_BYTES") {
            b = b.chunk_max_bytes(v);
        }
        if let Some(v) = env_parse::<bool>("INVOICE_PIPELINE_VALIDATE") {
            b = b.validate_extractions(v);
        }
        if let Some(v) = env_parse::<u64>("INVOICE_PIPELINE_POLL_INTERVAL") {
            b = b.poll_interval_secs(v);
        }
        if let Some(v) = env_string("INVOICE_PIPELINE_SCRATCH_DIR") {
            b = b.scratch_dir(v);
        }
        if let Some(v) = env_string("INVOICE_PIPELINE_BLOCKED_PROVIDERS") {
            b = b.blocked_providers(
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string),
            );
        }

        b.build()
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|v| v.trim().parse().ok())
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn extraction_mode(mut self, mode: ExtractionMode) -> Self {
        self.config.extraction_mode = mode;
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(prompt.into());
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn rate_limit_backoff_ms(mut self, base_ms: u64, cap_ms: u64) -> Self {
        self.config.rate_limit_backoff_ms = base_ms;
        self.config.rate_limit_backoff_cap_ms = cap_ms.max(base_ms);
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    pub fn concurrency_bounds(mut self, min: usize, max: usize) -> Self {
        self.config.min_concurrency = min.max(1);
        self.config.max_concurrency = max.max(self.config.min_concurrency);
        self
    }

    pub fn small_batch_threshold(mut self, n: usize) -> Self {
        self.config.small_batch_threshold = n;
        self
    }

    pub fn memory_limits_mb(mut self, soft: u64, hard: u64) -> Self {
        self.config.memory_soft_limit_mb = soft;
        self.config.memory_hard_limit_mb = hard.max(soft);
        self
    }

    pub fn circuit_breaker_threshold(mut self, n: u32) -> Self {
        self.config.circuit_breaker_threshold = n.max(1);
        self
    }

    pub fn batch_model(mut self, model: impl Into<String>) -> Self {
        self.config.batch_model = model.into();
        self
    }

    pub fn service_base_url(mut self, url: impl Into<String>) -> Self {
        self.config.service_base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn service_api_key(mut self, key: impl Into<String>) -> Self {
        self.config.service_api_key = Some(key.into());
        self
    }

    pub fn chunk_max_bytes(mut self, n: usize) -> Self {
        self.config.chunk_max_bytes = n;
        self
    }

    pub fn inline_payload_max_bytes(mut self, n: usize) -> Self {
        self.config.inline_payload_max_bytes = n;
        self
    }

    pub fn validate_extractions(mut self, v: bool) -> Self {
        self.config.validate_extractions = v;
        self
    }

    pub fn poll_interval_secs(mut self, secs: u64) -> Self {
        self.config.poll_interval_secs = secs.max(1);
        self
    }

    pub fn admin_stagger_ms(mut self, ms: u64) -> Self {
        self.config.admin_stagger_ms = ms;
        self
    }

    pub fn scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.scratch_dir = dir.into();
        self
    }

    pub fn output_stability(mut self, checks: u32, interval_ms: u64, timeout_ms: u64) -> Self {
        self.config.output_stability_checks = checks.max(1);
        self.config.output_stability_interval_ms = interval_ms;
        self.config.output_stability_timeout_ms = timeout_ms;
        self
    }

    pub fn output_recency_window_secs(mut self, secs: u64) -> Self {
        self.config.output_recency_window_secs = secs;
        self
    }

    pub fn history_group_window_secs(mut self, secs: u64) -> Self {
        self.config.history_group_window_secs = secs;
        self
    }

    pub fn blocked_providers<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.blocked_providers = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn provider_alias(mut self, alias: impl Into<String>, cif: impl Into<String>) -> Self {
        self.config
            .provider_aliases
            .insert(alias.into(), cif.into());
        self
    }

    pub fn material_code_max_attempts(mut self, n: u32) -> Self {
        self.config.material_code_max_attempts = n.max(1);
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, PipelineError> {
        let c = &self.config;
        if c.max_tokens < 256 {
            return Err(PipelineError::InvalidConfig(format!(
                "max_tokens must be ≥ 256, got {}",
                c.max_tokens
            )));
        }
        if c.min_concurrency > c.max_concurrency {
            return Err(PipelineError::InvalidConfig(format!(
                "min_concurrency ({}) exceeds max_concurrency ({})",
                c.min_concurrency, c.max_concurrency
            )));
        }
        if c.inline_payload_max_bytes > c.chunk_max_bytes {
            return Err(PipelineError::InvalidConfig(
                "inline_payload_max_bytes must not exceed chunk_max_bytes".into(),
            ));
        }
        if c.chunk_max_bytes < 1024 {
            return Err(PipelineError::InvalidConfig(format!(
                "chunk_max_bytes must be ≥ 1024, got {}",
                c.chunk_max_bytes
            )));
        }
        Ok(self.config)
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// Output encoding requested from the extraction model.
///
/// | Mode | Use case |
/// |------|----------|
/// | `Compact` | Pipe-delimited lines; lowest token overhead, truncation recovery (default) |
/// | `Json`    | Schema-checked JSON at temperature 0; single-document calls only |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionMode {
    #[default]
    Compact,
    Json,
}

impl std::str::FromStr for ExtractionMode {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "compact" | "lines" => Ok(ExtractionMode::Compact),
            "json" => Ok(ExtractionMode::Json),
            other => Err(PipelineError::InvalidConfig(format!(
                "unknown extraction mode '{other}'"
            ))),
        }
    }
}
