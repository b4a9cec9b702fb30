//! `tillmatch`: run reconciliation chunks and chunked jobs.

mod exit_codes;
mod logging;
mod remote;

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use clap::{Args, Parser, Subcommand};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{info, warn};

use tillmatch_recon::model::{ChunkJob, ChunkSummary, ReconciliationSubType, ReconciliationType};
use tillmatch_recon::tracker::plan_chunks;
use tillmatch_recon::{
    process_chunk, run_chunk, ChunkReport, ChunkRequest, DateRange, JobStore, JobTracker,
    LedgerQuery, MemoryJobStore, MemoryLedger, MemoryResultSink, PipelineConfig, ReconContext,
    ReconError, ResultPublisher, ResultStore,
};

use exit_codes::*;
use remote::{resolve_token, HttpJobStore, HttpLedger, HttpResultSink, RemoteClient};

#[derive(Parser)]
#[command(name = "tillmatch")]
#[command(about = "Reconcile sales, settlement and procurement ledgers stage by stage")]
#[command(version)]
struct Cli {
    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse and validate a pipeline config
    #[command(after_help = "\
Examples:
  tillmatch validate --config card-sales.recon.toml")]
    Validate {
        /// Pipeline config (TOML)
        #[arg(long)]
        config: PathBuf,
    },

    /// Reconcile one chunk and print its report
    #[command(after_help = "\
Examples:
  tillmatch run --config card-sales.recon.toml --data-dir exports/ \\
      --tenant m-1 --from 2026-01-15 --to 2026-01-15 \\
      --type salesAmount --sub-type creditCard --channel credit_card
  TILLMATCH_TOKEN=... tillmatch run --config po.recon.toml \\
      --ledger-url https://ledger.internal --results-url https://results.internal \\
      --tenant m-1 --from 2026-03-01 --to 2026-03-31 --type threeWayMatch --sub-type purchaseOrder")]
    Run {
        #[command(flatten)]
        chunk: ChunkArgs,

        #[command(flatten)]
        stores: StoreArgs,

        /// Write the JSON report here instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Split a date range into chunks and reconcile them concurrently
    #[command(after_help = "\
Examples:
  tillmatch job --job-id jan-close --config card-sales.recon.toml --data-dir exports/ \\
      --tenant m-1 --from 2026-01-01 --to 2026-01-31 \\
      --type salesAmount --sub-type creditCard --chunk-days 1 --workers 8")]
    Job {
        /// Job identifier used by the job store
        #[arg(long)]
        job_id: String,

        #[command(flatten)]
        chunk: ChunkArgs,

        #[command(flatten)]
        stores: StoreArgs,

        /// Days per chunk
        #[arg(long, default_value_t = 1)]
        chunk_days: u32,

        /// Concurrent chunk workers
        #[arg(long, default_value_t = 4)]
        workers: usize,

        /// Job store base URL (default: in-process)
        #[arg(long, env = "TILLMATCH_JOBS_URL")]
        jobs_url: Option<String>,

        /// Write the JSON job report here instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[derive(Args)]
struct ChunkArgs {
    /// Pipeline config (TOML)
    #[arg(long)]
    config: PathBuf,

    /// Tenant (merchant) id
    #[arg(long)]
    tenant: String,

    /// Range start, inclusive (YYYY-MM-DD or timestamp)
    #[arg(long)]
    from: String,

    /// Range end, inclusive (YYYY-MM-DD or timestamp)
    #[arg(long)]
    to: String,

    /// Reconciliation type (salesAmount, settlementAmount, threeWayMatch)
    #[arg(long = "type")]
    recon_type: String,

    /// Reconciliation sub-type (foodMarketplace, creditCard, purchaseOrder)
    #[arg(long)]
    sub_type: String,

    /// Payment channel filter
    #[arg(long)]
    channel: Option<String>,
}

#[derive(Args)]
struct StoreArgs {
    /// Directory of `<index>.csv` ledger exports
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Ledger store base URL
    #[arg(long, env = "TILLMATCH_LEDGER_URL")]
    ledger_url: Option<String>,

    /// Result store / queue base URL (default: in-process, no cross-run dedup)
    #[arg(long, env = "TILLMATCH_RESULTS_URL")]
    results_url: Option<String>,

    /// Bearer token for remote stores (default: TILLMATCH_TOKEN env)
    #[arg(long)]
    token: Option<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.log_json);

    let result = match cli.command {
        Commands::Validate { config } => cmd_validate(&config),
        Commands::Run { chunk, stores, out } => cmd_run(chunk, stores, out),
        Commands::Job {
            job_id,
            chunk,
            stores,
            chunk_days,
            workers,
            jobs_url,
            out,
        } => cmd_job(job_id, chunk, stores, chunk_days, workers, jobs_url, out),
    };

    match result {
        Ok(()) => ExitCode::from(EXIT_SUCCESS),
        Err(CliError {
            code,
            message,
            hint,
        }) => {
            if !message.is_empty() {
                eprintln!("error: {}", message);
            }
            if let Some(hint) = hint {
                eprintln!("hint:  {}", hint);
            }
            ExitCode::from(code)
        }
    }
}

#[derive(Debug)]
pub struct CliError {
    pub code: u8,
    pub message: String,
    pub hint: Option<String>,
}

impl CliError {
    pub fn usage(msg: impl Into<String>) -> Self {
        Self {
            code: EXIT_USAGE,
            message: msg.into(),
            hint: None,
        }
    }

    pub fn io(msg: impl Into<String>) -> Self {
        Self {
            code: EXIT_IO,
            message: msg.into(),
            hint: None,
        }
    }

    /// Add a hint to an existing error.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

impl From<ReconError> for CliError {
    fn from(err: ReconError) -> Self {
        let (code, hint) = match &err {
            ReconError::ConfigParse(_)
            | ReconError::ConfigValidation(_)
            | ReconError::UnknownSource(_) => {
                (EXIT_CONFIG, Some("run `tillmatch validate --config <file>`"))
            }
            ReconError::InvalidRequest(_) => (EXIT_USAGE, None),
            ReconError::SourceUnavailable { .. } | ReconError::Pagination { .. } => {
                (EXIT_SOURCE, Some("the chunk can be re-run once the ledger store recovers"))
            }
            ReconError::PublishFailure { .. } | ReconError::ResultStore { .. } => {
                (EXIT_PUBLISH, None)
            }
            ReconError::Tracker { .. } => (EXIT_TRACKER, None),
            ReconError::Io(_) => (EXIT_IO, None),
            ReconError::AmountOverflow { .. } | ReconError::VarianceOverflow { .. } => {
                (EXIT_ENGINE, None)
            }
        };
        Self {
            code,
            message: err.to_string(),
            hint: hint.map(str::to_string),
        }
    }
}

// ============================================================================
// Shared setup
// ============================================================================

fn load_config(path: &Path) -> Result<PipelineConfig, CliError> {
    let text = fs::read_to_string(path)
        .map_err(|e| CliError::io(format!("cannot read {}: {}", path.display(), e)))?;
    Ok(PipelineConfig::from_toml(&text)?)
}

/// Parse a camelCase wire name into one of the engine's enums.
fn parse_wire_name<T: DeserializeOwned>(value: &str, what: &str) -> Result<T, CliError> {
    serde_json::from_value(serde_json::Value::String(value.to_string()))
        .map_err(|_| CliError::usage(format!("unknown {what} '{value}'")))
}

fn chunk_request(args: &ChunkArgs) -> Result<ChunkRequest, CliError> {
    let reconciliation_type: ReconciliationType =
        parse_wire_name(&args.recon_type, "reconciliation type").map_err(|e| {
            e.with_hint("expected one of: salesAmount, settlementAmount, threeWayMatch")
        })?;
    let sub_type: ReconciliationSubType = parse_wire_name(&args.sub_type, "sub-type")
        .map_err(|e| e.with_hint("expected one of: foodMarketplace, creditCard, purchaseOrder"))?;

    Ok(ChunkRequest {
        tenant_id: args.tenant.clone(),
        range: DateRange::parse(&args.from, &args.to)?,
        reconciliation_type,
        sub_type,
        channel: args.channel.clone(),
    })
}

/// Result store and publisher behind one handle.
enum ResultSink {
    Memory(MemoryResultSink),
    Http(HttpResultSink),
}

impl ResultSink {
    fn store(&self) -> &dyn ResultStore {
        match self {
            Self::Memory(sink) => sink,
            Self::Http(sink) => sink,
        }
    }

    fn publisher(&self) -> &dyn ResultPublisher {
        match self {
            Self::Memory(sink) => sink,
            Self::Http(sink) => sink,
        }
    }
}

struct Stores {
    ledger: Box<dyn LedgerQuery>,
    results: ResultSink,
    token: Option<String>,
}

fn open_stores(
    args: StoreArgs,
    config: &PipelineConfig,
    request: &ChunkRequest,
    needs_token: bool,
) -> Result<Stores, CliError> {
    let token = if needs_token || args.ledger_url.is_some() || args.results_url.is_some() {
        Some(resolve_token(args.token)?)
    } else {
        None
    };

    let ledger: Box<dyn LedgerQuery> = match (&args.data_dir, &args.ledger_url, &token) {
        (Some(dir), _, _) => {
            let indexes = pipeline_indexes(config, request);
            info!(dir = %dir.display(), indexes = indexes.len(), "loading ledger exports");
            Box::new(MemoryLedger::from_csv_dir(dir, indexes.iter().map(String::as_str))?)
        }
        (None, Some(url), Some(token)) => Box::new(HttpLedger::new(RemoteClient::new(
            "ledger",
            url,
            token.clone(),
        )?)),
        _ => {
            return Err(CliError::usage("no ledger source given")
                .with_hint("pass --data-dir <dir> or --ledger-url <url>"))
        }
    };

    let results = match (&args.results_url, &token) {
        (Some(url), Some(token)) => ResultSink::Http(HttpResultSink::new(RemoteClient::new(
            "results",
            url,
            token.clone(),
        )?)),
        _ => {
            warn!("no --results-url; results stay in memory and are not de-duplicated across runs");
            ResultSink::Memory(MemoryResultSink::new())
        }
    };

    Ok(Stores {
        ledger,
        results,
        token,
    })
}

/// Index names read by the requested pipeline.
fn pipeline_indexes(config: &PipelineConfig, request: &ChunkRequest) -> Vec<String> {
    config
        .pipeline_for(request.reconciliation_type, request.sub_type)
        .map(|pipeline| {
            pipeline
                .stages
                .iter()
                .filter_map(|name| {
                    config
                        .sources
                        .get(name)
                        .map(|source| source.index_name(name).to_string())
                })
                .collect()
        })
        .unwrap_or_default()
}

fn write_json(out: Option<&Path>, value: &impl Serialize) -> Result<(), CliError> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| CliError::io(format!("cannot serialize report: {e}")))?;
    match out {
        Some(path) => fs::write(path, format!("{json}\n"))
            .map_err(|e| CliError::io(format!("cannot write {}: {}", path.display(), e))),
        None => {
            let stdout = io::stdout();
            let mut handle = stdout.lock();
            writeln!(handle, "{json}").map_err(|e| CliError::io(e.to_string()))
        }
    }
}

/// Groups that need a human: mismatched, failed, or not published.
fn needs_review(summary: &ChunkSummary) -> usize {
    summary.mismatched + summary.failed + summary.publish_failures
}

// ============================================================================
// validate
// ============================================================================

fn cmd_validate(path: &Path) -> Result<(), CliError> {
    let config = load_config(path)?;
    let stdout = io::stdout();
    let mut handle = stdout.lock();
    let mut emit = |line: String| writeln!(handle, "{line}").map_err(|e| CliError::io(e.to_string()));

    emit(format!(
        "ok: {} ({} sources, {} pipelines)",
        config.name,
        config.sources.len(),
        config.pipelines.len()
    ))?;
    for pipeline in &config.pipelines {
        emit(format!(
            "  {}/{}: {}",
            pipeline.reconciliation_type,
            pipeline.sub_type,
            pipeline.stages.join(" -> ")
        ))?;
    }
    Ok(())
}

// ============================================================================
// run
// ============================================================================

fn cmd_run(chunk: ChunkArgs, stores: StoreArgs, out: Option<PathBuf>) -> Result<(), CliError> {
    let config = load_config(&chunk.config)?;
    let request = chunk_request(&chunk)?;
    let stores = open_stores(stores, &config, &request, false)?;

    let ctx = ReconContext {
        config: &config,
        ledger: stores.ledger.as_ref(),
        results: stores.results.store(),
        publisher: stores.results.publisher(),
    };
    let report = run_chunk(&ctx, &request)?;
    write_json(out.as_deref(), &report)?;

    if !report.supported {
        warn!(
            recon_type = %request.reconciliation_type,
            sub_type = %request.sub_type,
            "no pipeline configured for this type/sub-type"
        );
    }

    let review = needs_review(&report.summary);
    if review > 0 {
        return Err(CliError {
            code: EXIT_EXCEPTIONS,
            message: format!(
                "{review} of {} groups need review",
                report.summary.total_groups
            ),
            hint: None,
        });
    }
    Ok(())
}

// ============================================================================
// job
// ============================================================================

/// Job store behind one handle.
enum Jobs {
    Memory(MemoryJobStore),
    Http(HttpJobStore),
}

impl Jobs {
    fn store(&self) -> &dyn JobStore {
        match self {
            Self::Memory(store) => store,
            Self::Http(store) => store,
        }
    }

    fn create(&self, job_id: &str, total_chunks: u64) -> Result<(), CliError> {
        match self {
            Self::Memory(store) => {
                store.create_job(job_id, total_chunks);
                Ok(())
            }
            Self::Http(store) => store
                .create_job(job_id, total_chunks)
                .map_err(|e| {
                    CliError::from(ReconError::Tracker {
                        job_id: job_id.to_string(),
                        message: e.to_string(),
                    })
                }),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ChunkOutcome {
    range: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    report: Option<ChunkReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tracking_error: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JobReport {
    job: ChunkJob,
    chunks: Vec<ChunkOutcome>,
}

#[allow(clippy::too_many_arguments)]
fn cmd_job(
    job_id: String,
    chunk: ChunkArgs,
    stores: StoreArgs,
    chunk_days: u32,
    workers: usize,
    jobs_url: Option<String>,
    out: Option<PathBuf>,
) -> Result<(), CliError> {
    if chunk_days == 0 {
        return Err(CliError::usage("--chunk-days must be at least 1"));
    }
    if workers == 0 {
        return Err(CliError::usage("--workers must be at least 1"));
    }

    let config = load_config(&chunk.config)?;
    let base = chunk_request(&chunk)?;
    let stores = open_stores(stores, &config, &base, jobs_url.is_some())?;

    let jobs = match (&jobs_url, &stores.token) {
        (Some(url), Some(token)) => {
            Jobs::Http(HttpJobStore::new(RemoteClient::new("jobs", url, token.clone())?))
        }
        _ => Jobs::Memory(MemoryJobStore::new()),
    };

    let chunks = plan_chunks(&base.range, chunk_days);
    jobs.create(&job_id, chunks.len() as u64)?;
    info!(
        job = %job_id,
        chunks = chunks.len(),
        workers,
        range = %base.range,
        "job planned"
    );

    let ctx = ReconContext {
        config: &config,
        ledger: stores.ledger.as_ref(),
        results: stores.results.store(),
        publisher: stores.results.publisher(),
    };
    let tracker = JobTracker::new(jobs.store());
    let next = AtomicUsize::new(0);
    let finished: Mutex<Vec<(usize, ChunkOutcome)>> = Mutex::new(Vec::with_capacity(chunks.len()));

    thread::scope(|s| {
        for _ in 0..workers.min(chunks.len()) {
            s.spawn(|| loop {
                let index = next.fetch_add(1, Ordering::Relaxed);
                let Some(range) = chunks.get(index) else {
                    break;
                };
                let request = ChunkRequest {
                    range: *range,
                    ..base.clone()
                };
                let chunk = process_chunk(&ctx, &tracker, &job_id, &request);
                let (report, error) = match chunk.outcome {
                    Ok(report) => (Some(report), None),
                    Err(err) => (None, Some(err.to_string())),
                };
                let outcome = ChunkOutcome {
                    range: range.to_string(),
                    report,
                    error,
                    tracking_error: chunk.tracking_error.map(|e| e.to_string()),
                };
                finished.lock().push((index, outcome));
            });
        }
    });

    let mut finished = finished.into_inner();
    finished.sort_by_key(|(index, _)| *index);
    let chunks: Vec<ChunkOutcome> = finished.into_iter().map(|(_, outcome)| outcome).collect();

    // An unrecorded chunk would leave the job in progress forever.
    let untracked = chunks.iter().filter(|c| c.tracking_error.is_some()).count();
    if untracked > 0 {
        if let Err(e) = tracker.fail_job(&job_id) {
            warn!(job = %job_id, error = %e, "could not mark job failed");
        }
    }

    let job = jobs.store().get_job(&job_id).map_err(|e| {
        CliError::from(ReconError::Tracker {
            job_id: job_id.clone(),
            message: e.to_string(),
        })
    })?;
    info!(
        job = %job_id,
        status = %job.status,
        completed = job.completed_chunks,
        failed = job.failed_chunks,
        "job finished"
    );

    let failed_chunks = chunks.iter().filter(|c| c.error.is_some()).count();
    let review: usize = chunks
        .iter()
        .filter_map(|c| c.report.as_ref())
        .map(|r| needs_review(&r.summary))
        .sum();

    write_json(out.as_deref(), &JobReport { job, chunks })?;

    if failed_chunks > 0 {
        return Err(CliError {
            code: EXIT_CHUNK_FAILED,
            message: format!("{failed_chunks} chunk(s) failed"),
            hint: Some("failed chunks can be re-run; published groups are skipped".to_string()),
        });
    }
    if untracked > 0 {
        return Err(CliError {
            code: EXIT_TRACKER,
            message: format!("progress of {untracked} chunk(s) could not be recorded; job marked failed"),
            hint: Some("published groups are kept; re-running the job skips them".to_string()),
        });
    }
    if review > 0 {
        return Err(CliError {
            code: EXIT_EXCEPTIONS,
            message: format!("{review} group(s) need review"),
            hint: None,
        });
    }
    Ok(())
}
