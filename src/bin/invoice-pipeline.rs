//! CLI binary for invoice-pipeline.
//!
//! A thin shim over the library crate that maps CLI flags
//! to `PipelineConfig` and prints results.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use invoice_pipeline::{
    BatchManager, BatchProgressInfo, Document, DocumentOutcome, GeminiBatchService,
    IngestProgressCallback, Ledger, LlmCompletionClient, LlmExtractor, MemoryLedger,
    OutcomeStatus, PipelineConfig, ProgressCallback, SyncUploader, TracingNotifier, UploadReport,
};
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress callback for `ingest`: one bar over extraction, then
/// one log line per document as it is ingested.
struct CliProgressCallback {
    bar: ProgressBar,
    /// Extraction start times, keyed by submission index.
    start_times: Mutex<HashMap<usize, Instant>>,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(TICKS),
        );
        bar.set_prefix("Preparing");
        bar.set_message("Reading documents…");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
        })
    }

    fn take_start(&self, index: usize) -> Option<Instant> {
        self.start_times.lock().ok().and_then(|mut m| m.remove(&index))
    }
}

impl IngestProgressCallback for CliProgressCallback {
    fn on_session_start(&self, total: usize) {
        self.bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.cyan} {prefix:.bold}  \
                 [{bar:42.green/238}] {pos:>3}/{len} invoices  \
                 ⏱ {elapsed_precise}  ETA {eta_precise}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▉▊▋▌▍▎▏  ")
            .tick_strings(TICKS),
        );
        self.bar.set_length(total as u64);
        self.bar.set_prefix("Extracting");
        self.bar.reset_eta();
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Processing {total} invoices…"))
        ));
    }

    fn on_extraction_start(&self, index: usize, _total: usize) {
        if let Ok(mut m) = self.start_times.lock() {
            m.insert(index, Instant::now());
        }
    }

    fn on_extraction_complete(&self, index: usize, _total: usize, item_count: usize) {
        let elapsed = self
            .take_start(index)
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        self.bar.set_message(format!(
            "#{} {} items {}",
            index + 1,
            item_count,
            dim(&format!("{elapsed:.1}s"))
        ));
        self.bar.inc(1);
    }

    fn on_document_ingested(&self, index: usize, total: usize, invoice_code: &str) {
        self.bar.set_prefix("Ingesting");
        self.bar.println(format!(
            "  {} {:>3}/{:<3}  {}",
            green("✓"),
            index + 1,
            total,
            invoice_code
        ));
    }

    fn on_document_error(&self, index: usize, total: usize, kind: &str, error: &str) {
        // Extraction failures never reach on_extraction_complete.
        if self.take_start(index).is_some() {
            self.bar.inc(1);
        }
        let msg: String = if error.chars().count() > 80 {
            format!("{}\u{2026}", error.chars().take(79).collect::<String>())
        } else {
            error.to_string()
        };
        self.bar.println(format!(
            "  {} {:>3}/{:<3}  {}  {}",
            red("✗"),
            index + 1,
            total,
            dim(kind),
            red(&msg)
        ));
    }

    fn on_session_complete(&self, total: usize, success_count: usize) {
        self.bar.finish_and_clear();
        let failed = total.saturating_sub(success_count);
        if failed == 0 {
            eprintln!(
                "{} {} invoices stored",
                green("✔"),
                bold(&success_count.to_string())
            );
        } else {
            eprintln!(
                "{} {}/{} invoices stored  ({} failed)",
                if failed == total { red("✘") } else { cyan("⚠") },
                bold(&success_count.to_string()),
                total,
                red(&failed.to_string()),
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Extract and store invoices right away
  invoice-pipeline ingest invoices/*.pdf

  # Submit a large upload as remote batch jobs and wait for the result
  invoice-pipeline submit --user ops invoices/2024/*.pdf

  # Submit with a validation round-trip, return immediately
  invoice-pipeline submit --validate --no-wait invoices/*.pdf

  # Batch status (needs a persistent ledger)
  invoice-pipeline --database-url postgres://localhost/ledger status --user ops

  # JSON output
  invoice-pipeline --json ingest invoice.pdf > report.json

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY                      OpenAI API key (single-document extraction)
  ANTHROPIC_API_KEY                   Anthropic API key
  GEMINI_API_KEY                      Google Gemini API key (also used for batch jobs)
  EDGEQUAKE_LLM_PROVIDER              Override provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL                     Override model ID
  INVOICE_PIPELINE_SERVICE_API_KEY    API key for the batch service
  INVOICE_PIPELINE_BLOCKED_PROVIDERS  Comma-separated provider names never ingested
  DATABASE_URL                        PostgreSQL ledger (requires the `postgres` feature)
"#;

/// Extract supplier invoices from PDFs and reconcile them into a price ledger.
#[derive(Parser, Debug)]
#[command(
    name = "invoice-pipeline",
    version,
    about = "Extract supplier invoices from PDFs and reconcile them into a price ledger",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// LLM model ID for single-document extraction.
    #[arg(long, global = true, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// LLM provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, global = true, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// PostgreSQL connection string for a persistent ledger.
    #[arg(long, global = true, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Provider name that must never be ingested (repeatable).
    #[arg(long = "blocked-provider", global = true)]
    blocked_providers: Vec<String>,

    /// Output structured JSON instead of a human summary.
    #[arg(long, global = true, env = "INVOICE_PIPELINE_JSON")]
    json: bool,

    /// Disable progress bar.
    #[arg(long, global = true, env = "INVOICE_PIPELINE_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "INVOICE_PIPELINE_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "INVOICE_PIPELINE_QUIET")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Extract and ingest documents now, returning one outcome per file.
    Ingest(IngestArgs),
    /// Submit documents as remote batch jobs.
    Submit(SubmitArgs),
    /// Show active batches and grouped history for a user.
    Status(StatusArgs),
}

#[derive(Args, Debug)]
struct Owner {
    /// User the upload belongs to.
    #[arg(long, env = "INVOICE_PIPELINE_USER", default_value = "cli")]
    user: String,

    /// Account the invoices are booked against; resolved from the client CIF if omitted.
    #[arg(long)]
    account: Option<Uuid>,
}

#[derive(Args, Debug)]
struct IngestArgs {
    /// PDF files to process.
    #[arg(required = true)]
    files: Vec<PathBuf>,

    #[command(flatten)]
    owner: Owner,

    /// Base number of concurrent extraction calls.
    #[arg(short, long, env = "INVOICE_PIPELINE_CONCURRENCY", default_value_t = 5)]
    concurrency: usize,

    /// Consecutive failures that stop the upload.
    #[arg(long, default_value_t = 5)]
    circuit_breaker: u32,
}

#[derive(Args, Debug)]
struct SubmitArgs {
    /// PDF files to submit.
    #[arg(required = true)]
    files: Vec<PathBuf>,

    #[command(flatten)]
    owner: Owner,

    /// Run a validation round-trip on every extraction before ingesting.
    #[arg(long, env = "INVOICE_PIPELINE_VALIDATE")]
    validate: bool,

    /// Return once the jobs are created instead of polling to completion.
    #[arg(long)]
    no_wait: bool,

    /// Seconds between polls while waiting.
    #[arg(long, env = "INVOICE_PIPELINE_POLL_INTERVAL", default_value_t = 30)]
    poll_interval: u64,
}

#[derive(Args, Debug)]
struct StatusArgs {
    #[arg(long, env = "INVOICE_PIPELINE_USER", default_value = "cli")]
    user: String,

    /// Reconcile active batches with the service before reporting.
    #[arg(long)]
    refresh: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // INFO-level library logs are suppressed while the progress bar is
    // active; the bar carries the feedback.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let ledger = open_ledger(&cli).await?;

    match &cli.command {
        Command::Ingest(args) => run_ingest(&cli, args, ledger, show_progress).await,
        Command::Submit(args) => run_submit(&cli, args, ledger, show_progress).await,
        Command::Status(args) => run_status(&cli, args, ledger).await,
    }
}

async fn open_ledger(cli: &Cli) -> Result<Arc<dyn Ledger>> {
    #[cfg(feature = "postgres")]
    if let Some(ref url) = cli.database_url {
        let ledger = invoice_pipeline::PgLedger::connect(url)
            .await
            .context("Failed to connect to the ledger database")?;
        ledger.migrate().await.context("Failed to migrate the ledger schema")?;
        return Ok(Arc::new(ledger));
    }
    #[cfg(not(feature = "postgres"))]
    if cli.database_url.is_some() {
        bail!("--database-url requires a build with the `postgres` feature");
    }
    Ok(Arc::new(MemoryLedger::new()))
}

/// Map CLI args shared by every subcommand onto `PipelineConfig`.
fn base_config(cli: &Cli) -> Result<invoice_pipeline::PipelineConfigBuilder> {
    // Environment first, flags on top.
    let env = PipelineConfig::from_env().context("Invalid configuration in environment")?;
    let mut blocked = env.blocked_providers.clone();
    blocked.extend(cli.blocked_providers.iter().cloned());

    let mut builder = PipelineConfig::builder()
        .max_tokens(env.max_tokens)
        .extraction_mode(env.extraction_mode)
        .max_retries(env.max_retries)
        .batch_model(env.batch_model.clone())
        .service_base_url(env.service_base_url.clone())
        .chunk_max_bytes(env.chunk_max_bytes)
        .scratch_dir(env.scratch_dir.clone())
        .blocked_providers(blocked);
    if let Some(key) = env.service_api_key {
        builder = builder.service_api_key(key);
    }
    if let Some(model) = cli.model.clone().or(env.model) {
        builder = builder.model(model);
    }
    if let Some(provider) = cli.provider.clone().or(env.provider_name) {
        builder = builder.provider_name(provider);
    }
    Ok(builder)
}

async fn read_documents(files: &[PathBuf], owner: &Owner) -> Result<Vec<Document>> {
    let mut documents = Vec::with_capacity(files.len());
    for path in files {
        let mut doc = Document::from_path(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        if let Some(account) = owner.account {
            doc = doc.with_account(account);
        }
        documents.push(doc);
    }
    Ok(documents)
}

async fn run_ingest(
    cli: &Cli,
    args: &IngestArgs,
    ledger: Arc<dyn Ledger>,
    show_progress: bool,
) -> Result<()> {
    let mut builder = base_config(cli)?
        .concurrency(args.concurrency)
        .circuit_breaker_threshold(args.circuit_breaker);
    if show_progress {
        builder = builder.progress_callback(CliProgressCallback::new() as ProgressCallback);
    }
    let config = builder.build().context("Invalid configuration")?;

    let client = LlmCompletionClient::from_config(&config)
        .context("Failed to initialise the extraction provider")?;
    let extractor = Arc::new(LlmExtractor::from_config(Arc::new(client), &config));
    let uploader = SyncUploader::new(config, ledger, extractor, Arc::new(TracingNotifier));

    let documents = read_documents(&args.files, &args.owner).await?;
    let report = uploader
        .submit_documents_sync(&args.owner.user, documents)
        .await
        .context("Upload failed")?;

    if cli.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to serialise report")?
        );
    } else if !cli.quiet {
        print_report(&report, show_progress);
    }
    if report.successful == 0 {
        bail!("No invoice could be stored");
    }
    Ok(())
}

fn print_report(report: &UploadReport, progress_shown: bool) {
    if !progress_shown {
        for outcome in &report.results {
            eprintln!("{}", outcome_line(outcome));
        }
    }
    eprintln!(
        "   {} stored  /  {} duplicates  /  {} blocked  /  {} failed  in  {}ms",
        report.successful - report.duplicates,
        report.duplicates,
        report.blocked,
        report.failed - report.blocked,
        report.elapsed_ms
    );
    if report.circuit_breaker_tripped {
        eprintln!(
            "   {}",
            yellow("Stopped early after repeated failures; remaining files were not attempted")
        );
    }
}

fn outcome_line(outcome: &DocumentOutcome) -> String {
    let mark = match outcome.status {
        OutcomeStatus::Created => green("✓"),
        OutcomeStatus::Duplicate | OutcomeStatus::Unassigned => yellow("●"),
        OutcomeStatus::Blocked | OutcomeStatus::Failed => red("✗"),
    };
    let detail = match (&outcome.invoice_code, &outcome.error) {
        (_, Some(e)) if e.is_actual_error() => red(&e.message),
        (Some(code), _) => format!(
            "{code}  {}",
            dim(&format!(
                "{} items, {} alerts",
                outcome.items_created, outcome.alerts_created
            ))
        ),
        (None, _) => String::new(),
    };
    format!("  {mark} {:<32}  {detail}", outcome.file_name)
}

async fn run_submit(
    cli: &Cli,
    args: &SubmitArgs,
    ledger: Arc<dyn Ledger>,
    show_progress: bool,
) -> Result<()> {
    let config = base_config(cli)?
        .validate_extractions(args.validate)
        .poll_interval_secs(args.poll_interval)
        .admin_stagger_ms(0)
        .build()
        .context("Invalid configuration")?;
    let service =
        GeminiBatchService::from_config(&config).context("Failed to initialise the batch service")?;
    let manager = BatchManager::new(
        config,
        ledger,
        Arc::new(service),
        Arc::new(TracingNotifier),
    );

    let documents = read_documents(&args.files, &args.owner).await?;
    let receipt = manager
        .submit_documents(&args.owner.user, documents)
        .await
        .context("Submission failed")?;
    if !cli.quiet && !cli.json {
        eprintln!(
            "{} {} documents submitted in {} job(s){}",
            cyan("◆"),
            bold(&receipt.documents.to_string()),
            receipt.batch_ids.len(),
            if receipt.failed_chunks > 0 {
                red(&format!("  ({} failed to submit)", receipt.failed_chunks))
            } else {
                String::new()
            }
        );
    }
    if args.no_wait {
        if cli.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&receipt).context("Failed to serialise receipt")?
            );
        }
        return Ok(());
    }

    let bar = show_progress.then(|| {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}  ⏱ {elapsed_precise}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(TICKS),
        );
        bar.set_prefix("Waiting");
        bar.enable_steady_tick(Duration::from_millis(80));
        bar
    });
    let interval = Duration::from_secs(args.poll_interval.max(1));
    loop {
        let sweep = manager.reconcile_all().await.context("Reconciliation failed")?;
        let active = manager.get_active_batches(&args.owner.user).await?;
        if let Some(bar) = &bar {
            let processed: u32 = active.iter().map(|a| a.processed_files).sum();
            let total: u32 = active.iter().map(|a| a.total_files).sum();
            bar.set_message(format!(
                "{} job(s) running  {processed}/{total} documents  {} errors",
                active.len(),
                sweep.errors
            ));
        }
        if active.is_empty() {
            break;
        }
        tokio::time::sleep(interval).await;
    }
    if let Some(bar) = bar {
        bar.finish_and_clear();
    }

    let history = manager.get_batch_history(&args.owner.user).await?;
    print_batches(cli, &[], &history)
}

async fn run_status(cli: &Cli, args: &StatusArgs, ledger: Arc<dyn Ledger>) -> Result<()> {
    if cli.database_url.is_none() && !cli.quiet {
        eprintln!(
            "{}",
            yellow("No --database-url given: the in-memory ledger starts empty")
        );
    }
    let config = base_config(cli)?
        .admin_stagger_ms(0)
        .build()
        .context("Invalid configuration")?;
    let service = if args.refresh {
        GeminiBatchService::from_config(&config)
            .context("Failed to initialise the batch service")?
    } else {
        // Read-only views never reach the service.
        GeminiBatchService::new(&config.service_base_url, "", &config.batch_model, 1)
            .context("Failed to initialise the batch service")?
    };
    let manager = BatchManager::new(config, ledger, Arc::new(service), Arc::new(TracingNotifier));
    if args.refresh {
        manager.reconcile_all().await.context("Reconciliation failed")?;
    }
    let active = manager.get_active_batches(&args.user).await?;
    let history = manager.get_batch_history(&args.user).await?;
    print_batches(cli, &active, &history)
}

fn print_batches(cli: &Cli, active: &[BatchProgressInfo], history: &[BatchProgressInfo]) -> Result<()> {
    if cli.json {
        let value = serde_json::json!({ "active": active, "history": history });
        println!(
            "{}",
            serde_json::to_string_pretty(&value).context("Failed to serialise batches")?
        );
        return Ok(());
    }
    if cli.quiet {
        return Ok(());
    }
    if !active.is_empty() {
        println!("{}", bold("Active"));
        for info in active {
            println!("{}", batch_line(info));
        }
    }
    if !history.is_empty() {
        println!("{}", bold("History"));
        for info in history {
            println!("{}", batch_line(info));
            for e in info.errors.iter().filter(|e| e.is_actual_error()).take(5) {
                println!(
                    "      {} {}  {}",
                    red("✗"),
                    e.file_name.as_deref().unwrap_or("-"),
                    dim(&e.message)
                );
            }
        }
    }
    if active.is_empty() && history.is_empty() {
        println!("{}", dim("No batches"));
    }
    Ok(())
}

fn batch_line(info: &BatchProgressInfo) -> String {
    let status = info.status.as_str();
    let status = match info.status {
        invoice_pipeline::BatchStatus::Completed => green(status),
        s if !s.is_terminal() => cyan(status),
        _ => red(status),
    };
    format!(
        "  {:<11} {:<10} {:>5.1}%  {}/{} ok  {} failed  {} blocked  {}",
        status,
        info.purpose.as_str(),
        info.progress_percent,
        info.successful_files,
        info.total_files,
        info.failed_files,
        info.blocked_files,
        dim(&info.batch_ids.join(", "))
    )
}
