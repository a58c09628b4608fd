//! alphactl - drive candidate alphas through simulation and submission
//!
//! ## Commands
//!
//! - `run`: simulate candidates, evaluate results, submit accepted alphas
//! - `validate`: check an expressions file without touching the platform
//! - `report`: render the report for an existing state file
//! - `reset-submission`: re-open a failed submission so the next run retries it

use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use alpha_core::telemetry::{init_tracing, level_from_verbosity};
use alpha_core::{
    CandidateId, CandidateSource, ExpressionFileSource, FileStateStore, ParameterSweepSource,
    Pipeline, PipelineConfig, RegionFanOutSource, RunReport, SimulationGateway, SimulationSettings,
    StopHandle, SubmissionLedger, ValidatingSource, Validator,
};
use anyhow::{bail, Context, Result};
use brain_client::{BrainClient, BrainConfig};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::{info, warn};

const DEFAULT_STATE_PATH: &str = ".alpha/state.json";

#[derive(Parser)]
#[command(name = "alphactl")]
#[command(version = alpha_core::VERSION)]
#[command(about = "Alpha simulation and submission orchestrator", long_about = None)]
struct Cli {
    /// More log output (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Simulate candidates, evaluate them and submit accepted alphas
    Run(RunArgs),

    /// Check expressions and settings without contacting the platform
    Validate {
        /// Expressions file, one per line
        file: PathBuf,

        #[command(flatten)]
        settings: SettingsArgs,
    },

    /// Render the report for an existing state file
    Report {
        #[arg(long, default_value = DEFAULT_STATE_PATH)]
        state: PathBuf,

        #[arg(long, value_enum, default_value_t = ReportFormat::Markdown)]
        format: ReportFormat,

        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Re-open a FAILED submission so the next run submits it again
    ResetSubmission {
        /// Candidate id or a unique prefix of it
        id: String,

        #[arg(long, default_value = DEFAULT_STATE_PATH)]
        state: PathBuf,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Expressions file, one per line
    #[arg(long, conflicts_with = "sweep", required_unless_present = "sweep")]
    expressions: Option<PathBuf>,

    /// Base expression whose integer windows are swept
    #[arg(long)]
    sweep: Option<String>,

    /// Window values for --sweep
    #[arg(long, value_delimiter = ',', default_values_t = [5u32, 10, 20, 60])]
    values: Vec<u32>,

    /// Tag recorded on every candidate of this run
    #[arg(long, default_value = "cli")]
    tag: String,

    #[command(flatten)]
    settings: SettingsArgs,

    /// Simulate every candidate once in each of these regions instead of --region
    #[arg(long, value_delimiter = ',')]
    regions: Vec<String>,

    /// TOML file with orchestrator, submission and threshold settings
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Durable state file
    #[arg(long, default_value = DEFAULT_STATE_PATH)]
    state: PathBuf,

    /// Evaluate but never submit
    #[arg(long)]
    dry_run: bool,

    /// Override orchestrator.max_concurrent
    #[arg(long)]
    max_concurrent: Option<usize>,

    /// Write the JSON report here
    #[arg(long)]
    report_json: Option<PathBuf>,

    /// Write the Markdown report here
    #[arg(long)]
    report_md: Option<PathBuf>,

    #[command(flatten)]
    credentials: CredentialArgs,
}

#[derive(Args)]
struct SettingsArgs {
    #[arg(long, default_value = "USA")]
    region: String,

    #[arg(long, default_value = "TOP3000")]
    universe: String,

    #[arg(long, default_value_t = 1)]
    delay: u32,

    #[arg(long, default_value_t = 0)]
    decay: u32,

    #[arg(long, default_value = "INDUSTRY")]
    neutralization: String,

    #[arg(long, default_value_t = 0.08)]
    truncation: f64,
}

impl SettingsArgs {
    fn to_settings(&self) -> SimulationSettings {
        SimulationSettings {
            delay: self.delay,
            decay: self.decay,
            neutralization: self.neutralization.to_ascii_uppercase(),
            truncation: self.truncation,
            ..SimulationSettings::default()
        }
        .with_region(self.region.to_ascii_uppercase())
        .with_universe(self.universe.to_ascii_uppercase())
    }
}

#[derive(Args)]
struct CredentialArgs {
    #[arg(long, env = "WQ_USERNAME")]
    username: Option<String>,

    #[arg(long, env = "WQ_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    #[arg(long, env = "WQ_BASE_URL", default_value = brain_client::DEFAULT_BASE_URL)]
    base_url: String,

    /// Per-request timeout in seconds
    #[arg(long, env = "WQ_TIMEOUT", default_value_t = 30)]
    timeout: u64,
}

impl CredentialArgs {
    fn to_config(&self) -> Result<BrainConfig> {
        let username = self
            .username
            .as_deref()
            .context("WQ_USERNAME is not set (pass --username or use a .env file)")?;
        let password = self
            .password
            .as_deref()
            .context("WQ_PASSWORD is not set (pass --password or use a .env file)")?;
        let mut config = BrainConfig::new(username, password).with_base_url(&self.base_url);
        config.timeout_secs = self.timeout;
        Ok(config)
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum ReportFormat {
    Markdown,
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Credentials may live in .env; load before clap reads the environment.
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.json, level_from_verbosity(cli.quiet, cli.verbose));

    match cli.command {
        Commands::Run(args) => cmd_run(args).await,
        Commands::Validate { file, settings } => cmd_validate(&file, &settings.to_settings()),
        Commands::Report {
            state,
            format,
            output,
        } => cmd_report(&state, format, output.as_deref()),
        Commands::ResetSubmission { id, state } => cmd_reset_submission(&state, &id),
    }
}

/// Load the pipeline config file, or defaults when none is given.
fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    let Some(path) = path else {
        return Ok(PipelineConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("Failed to parse config file: {}", path.display()))
}

fn build_source(args: &RunArgs) -> Result<Box<dyn CandidateSource>> {
    let settings = args.settings.to_settings();
    let source: Box<dyn CandidateSource> = if let Some(path) = &args.expressions {
        let source = ExpressionFileSource::open(path, settings, args.tag.clone())
            .with_context(|| format!("Failed to open expressions file: {}", path.display()))?;
        Box::new(source)
    } else {
        let Some(base) = &args.sweep else {
            bail!("either --expressions or --sweep is required");
        };
        let source =
            ParameterSweepSource::new(base.clone(), args.values.clone(), settings, args.tag.clone())?;
        if source.parameter_count() == 0 {
            warn!("Sweep base has no integer windows; only the base expression will run");
        }
        Box::new(source)
    };

    if args.regions.is_empty() {
        return Ok(source);
    }
    let regions: Vec<String> = args
        .regions
        .iter()
        .map(|r| r.trim().to_ascii_uppercase())
        .filter(|r| !r.is_empty())
        .collect();
    info!(regions = ?regions, "Fanning candidates out across regions");
    Ok(Box::new(RegionFanOutSource::new(source, regions)))
}

fn stop_on_ctrl_c(stop: StopHandle) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; cancelling in-flight jobs");
            stop.stop();
        }
    });
}

/// Run the full pipeline against the platform
async fn cmd_run(args: RunArgs) -> Result<()> {
    let mut config = load_config(args.config.as_deref())?;
    if args.dry_run {
        config.submission.dry_run = true;
    }
    if let Some(n) = args.max_concurrent {
        config.orchestrator.max_concurrent = n;
    }

    let source = ValidatingSource::new(build_source(&args)?, Validator::new()?);
    let client = BrainClient::new(args.credentials.to_config()?)
        .context("Failed to create platform client")?;
    let gateway: Arc<dyn SimulationGateway> = Arc::new(client);
    let store = Arc::new(
        FileStateStore::open(&args.state)
            .with_context(|| format!("Failed to open state file: {}", args.state.display()))?,
    );

    info!(
        state = %args.state.display(),
        dry_run = config.submission.dry_run,
        max_concurrent = config.orchestrator.max_concurrent,
        "Starting run"
    );
    let pipeline = Pipeline::new(store, gateway, config)?;
    let stop = StopHandle::new();
    stop_on_ctrl_c(stop.clone());
    let report = pipeline.run(source, stop).await?;

    if let Some(path) = &args.report_json {
        report.write_json(path)?;
        println!("JSON report: {}", path.display());
    }
    if let Some(path) = &args.report_md {
        report.write_markdown(path)?;
        println!("Markdown report: {}", path.display());
    }
    print_summary(&report);
    Ok(())
}

fn print_summary(report: &RunReport) {
    let t = &report.totals;
    if let Some(ms) = report.duration_ms {
        println!("Run finished in {:.1}s", ms as f64 / 1000.0);
    }
    println!(
        "  candidates: {}  succeeded: {}  failed: {}  cancelled: {}  pending: {}",
        t.candidates, t.succeeded, t.failed, t.cancelled, t.pending
    );
    println!(
        "  accepted: {}  rejected: {}  submitted: {}  submission failures: {}",
        t.accepted, t.rejected, t.submitted, t.submission_failed
    );
}

/// Check every expression in a file; fails if any line is invalid
fn cmd_validate(path: &Path, settings: &SimulationSettings) -> Result<()> {
    let validator = Validator::new()?;
    validator
        .validate_settings(settings)
        .context("Settings are not valid")?;

    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open expressions file: {}", path.display()))?;
    let mut checked = 0usize;
    let mut invalid = 0usize;
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        let expr = line.trim();
        if expr.is_empty() || expr.starts_with('#') {
            continue;
        }
        checked += 1;
        if let Err(e) = validator.validate_expression(expr) {
            invalid += 1;
            println!("line {}: {}  ({})", idx + 1, e, expr);
        }
    }

    println!("{} expressions checked, {} invalid", checked, invalid);
    if invalid > 0 {
        bail!("{invalid} invalid expressions in {}", path.display());
    }
    Ok(())
}

/// Render the report for a state file
fn cmd_report(state: &Path, format: ReportFormat, output: Option<&Path>) -> Result<()> {
    if !state.exists() {
        bail!("State file not found: {}", state.display());
    }
    let store = FileStateStore::open(state)?;
    let report = RunReport::from_store(&store, &store)?;

    match (format, output) {
        (ReportFormat::Json, Some(path)) => report.write_json(path)?,
        (ReportFormat::Markdown, Some(path)) => report.write_markdown(path)?,
        (ReportFormat::Json, None) => println!("{}", serde_json::to_string_pretty(&report)?),
        (ReportFormat::Markdown, None) => print!("{}", report.render_markdown()),
    }
    if let Some(path) = output {
        println!("Report written to {}", path.display());
    }
    Ok(())
}

/// Find the one submission record whose id starts with `prefix`.
fn resolve_submission(ledger: &dyn SubmissionLedger, prefix: &str) -> Result<CandidateId> {
    let prefix = prefix.trim().to_ascii_lowercase();
    if prefix.len() < 4 {
        bail!("Candidate id prefix must be at least 4 characters");
    }
    let matches: Vec<CandidateId> = ledger
        .all_submissions()?
        .into_iter()
        .map(|r| r.candidate_id)
        .filter(|id| id.as_str().starts_with(&prefix))
        .collect();
    match matches.as_slice() {
        [] => bail!("No submission record matches {prefix}"),
        [id] => Ok(id.clone()),
        many => bail!("{} submission records match {prefix}; use a longer prefix", many.len()),
    }
}

/// Re-open a failed submission
fn cmd_reset_submission(state: &Path, id: &str) -> Result<()> {
    let store = FileStateStore::open(state)
        .with_context(|| format!("Failed to open state file: {}", state.display()))?;
    let id = resolve_submission(&store, id)?;
    let record = store.reset_failed(&id)?;
    println!("Submission {} is now {}", id.short(), record.state);
    Ok(())
}
