//! CLI command definitions, routing, and tracing setup.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr, eyre};
use contactforge_core::{
    EnrichmentService, OrgMatcher, Orchestrator, PatternEnricher, PipelineReport,
    ProgressReporter, SubmitRequest, WorkerPool,
};
use contactforge_discovery::SourceRegistry;
use contactforge_queue::open_queue;
use contactforge_shared::{
    AppConfig, JobId, JobStatus, PipelineStage, expand_home, init_config, load_config,
    load_config_from,
};
use contactforge_storage::Storage;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// ContactForge: discover and enrich B2B decision-maker contacts.
#[derive(Parser)]
#[command(
    name = "contactforge",
    version,
    about = "Discover, deduplicate and enrich B2B contacts through a durable job queue.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(flatten)]
    pub overrides: ConfigOverrides,

    #[command(subcommand)]
    pub command: Command,
}

/// Flags that take precedence over the config file.
#[derive(Args, Debug, Default)]
pub(crate) struct ConfigOverrides {
    /// Config file (defaults to ~/.contactforge/contactforge.toml).
    #[arg(long, env = "CONTACTFORGE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Job record database path.
    #[arg(long, env = "CONTACTFORGE_DATABASE", global = true)]
    pub database: Option<String>,

    /// Queue connection target: "memory" or a database path.
    #[arg(long, env = "CONTACTFORGE_QUEUE", global = true)]
    pub queue: Option<String>,

    /// Worker pool size.
    #[arg(long, env = "CONTACTFORGE_WORKERS", global = true)]
    pub workers: Option<usize>,

    /// Per-adapter call timeout in seconds.
    #[arg(long, env = "CONTACTFORGE_ADAPTER_TIMEOUT", global = true)]
    pub adapter_timeout: Option<u64>,

    /// Minimum candidate confidence (0-100).
    #[arg(long, env = "CONTACTFORGE_MIN_CONFIDENCE", global = true)]
    pub min_confidence: Option<u8>,

    /// Deliveries allowed per job.
    #[arg(long, env = "CONTACTFORGE_MAX_ATTEMPTS", global = true)]
    pub max_attempts: Option<u32>,

    /// Backoff base delay in milliseconds.
    #[arg(long, env = "CONTACTFORGE_BASE_DELAY_MS", global = true)]
    pub base_delay_ms: Option<u64>,

    /// Restricted region codes (comma-separated).
    #[arg(long, env = "CONTACTFORGE_RESTRICTED_REGIONS", value_delimiter = ',', global = true)]
    pub restricted_regions: Option<Vec<String>>,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Submit an enrichment job for an organization.
    Submit {
        /// Organization name.
        name: String,

        /// Company website (used for team pages and the email domain).
        #[arg(long)]
        website: Option<String>,

        /// Company social profile URL.
        #[arg(long)]
        social_profile: Option<String>,

        /// Region code checked against the restriction list.
        #[arg(long)]
        region: Option<String>,

        /// Organization id in the host application.
        #[arg(long)]
        organization_id: Option<String>,

        /// Requesting actor id.
        #[arg(long, env = "CONTACTFORGE_ACTOR", default_value = "cli")]
        actor: String,

        /// Queue priority; lower runs first.
        #[arg(long)]
        priority: Option<i64>,

        /// Process the queue in this process until it is empty.
        #[arg(long)]
        wait: bool,
    },

    /// Show one job, or list jobs when no id is given.
    Status {
        job_id: Option<String>,

        /// Filter the list by status.
        #[arg(long)]
        status: Option<String>,

        #[arg(long)]
        json: bool,
    },

    /// List the contacts of a job with their email candidates.
    Contacts {
        job_id: String,

        #[arg(long)]
        json: bool,
    },

    /// Approve contacts for outreach.
    Approve {
        job_id: String,

        /// Contact ids to approve.
        #[arg(required = true)]
        contact_ids: Vec<String>,

        #[arg(long, env = "CONTACTFORGE_ACTOR", default_value = "cli")]
        actor: String,
    },

    /// Re-run a completed or failed job.
    Retry {
        job_id: String,

        /// Reset attempt bookkeeping when attempts are exhausted.
        #[arg(long)]
        force: bool,

        #[arg(long, env = "CONTACTFORGE_ACTOR", default_value = "cli")]
        actor: String,
    },

    /// Cancel a queued or running job.
    Cancel {
        job_id: String,

        #[arg(long, env = "CONTACTFORGE_ACTOR", default_value = "cli")]
        actor: String,
    },

    /// Print the audit log of a job.
    Audit {
        job_id: String,

        #[arg(long)]
        json: bool,
    },

    /// Run the worker pool.
    Work {
        /// Exit once no job is pending or running.
        #[arg(long)]
        drain: bool,
    },

    /// Group near-duplicate organization names.
    MatchOrgs {
        /// Names to compare.
        names: Vec<String>,

        /// Read names from a file, one per line.
        #[arg(long)]
        file: Option<PathBuf>,

        /// Similarity threshold (0.0-1.0).
        #[arg(long, default_value_t = contactforge_core::matching::DEFAULT_ORG_THRESHOLD)]
        threshold: f64,

        #[arg(long)]
        json: bool,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "contactforge=info",
        1 => "contactforge=debug",
        _ => "contactforge=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let overrides = cli.overrides;
    match cli.command {
        Command::Submit {
            name,
            website,
            social_profile,
            region,
            organization_id,
            actor,
            priority,
            wait,
        } => {
            let request = SubmitRequest {
                organization_name: name,
                website,
                social_profile_url: social_profile,
                region_code: region,
                organization_id,
                requested_by: actor,
                priority,
            };
            cmd_submit(&overrides, request, wait).await
        }
        Command::Status {
            job_id,
            status,
            json,
        } => cmd_status(&overrides, job_id.as_deref(), status.as_deref(), json).await,
        Command::Contacts { job_id, json } => cmd_contacts(&overrides, &job_id, json).await,
        Command::Approve {
            job_id,
            contact_ids,
            actor,
        } => cmd_approve(&overrides, &job_id, &contact_ids, &actor).await,
        Command::Retry {
            job_id,
            force,
            actor,
        } => cmd_retry(&overrides, &job_id, force, &actor).await,
        Command::Cancel { job_id, actor } => cmd_cancel(&overrides, &job_id, &actor).await,
        Command::Audit { job_id, json } => cmd_audit(&overrides, &job_id, json).await,
        Command::Work { drain } => cmd_work(&overrides, drain).await,
        Command::MatchOrgs {
            names,
            file,
            threshold,
            json,
        } => cmd_match_orgs(names, file.as_deref(), threshold, json),
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(&overrides),
        },
    }
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Load the config file and apply flag/env overrides.
fn resolve_config(overrides: &ConfigOverrides) -> Result<AppConfig> {
    let mut config = match &overrides.config {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };

    if let Some(database) = &overrides.database {
        config.storage.database_path = database.clone();
    }
    if let Some(queue) = &overrides.queue {
        config.queue.target = queue.clone();
    }
    if let Some(workers) = overrides.workers {
        config.workers.pool_size = workers;
    }
    if let Some(secs) = overrides.adapter_timeout {
        config.pipeline.adapter_timeout_secs = secs;
    }
    if let Some(min) = overrides.min_confidence {
        config.pipeline.min_confidence = min;
    }
    if let Some(max) = overrides.max_attempts {
        config.retry.max_attempts = max;
    }
    if let Some(base) = overrides.base_delay_ms {
        config.retry.base_delay_ms = base;
    }
    if let Some(regions) = &overrides.restricted_regions {
        config.pipeline.restricted_regions = regions
            .iter()
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .collect();
    }

    config.validate()?;
    Ok(config)
}

struct Context {
    config: AppConfig,
    service: EnrichmentService,
}

async fn open_context(overrides: &ConfigOverrides) -> Result<Context> {
    let config = resolve_config(overrides)?;
    let db_path = expand_home(&config.storage.database_path)?;
    let store = Arc::new(
        Storage::open(&db_path)
            .await
            .wrap_err_with(|| format!("opening job database {}", db_path.display()))?,
    );
    let queue = open_queue(&config.queue, &config.retry)
        .await
        .wrap_err_with(|| format!("opening queue '{}'", config.queue.target))?;
    let service = EnrichmentService::new(store, queue, &config);
    Ok(Context { config, service })
}

fn build_pool(ctx: &Context, progress: Arc<dyn ProgressReporter>) -> Result<WorkerPool> {
    let config = &ctx.config;
    let sources = SourceRegistry::from_config(&config.sources, config.pipeline.adapter_timeout())?;
    if sources.is_empty() {
        return Err(eyre!(
            "no source adapters are enabled; check the [sources] section of the config"
        ));
    }
    let enricher = PatternEnricher::from_config(&config.verification, config.pipeline.enrich_timeout())?;
    let orchestrator = Orchestrator::new(
        Arc::clone(ctx.service.store()),
        sources,
        Arc::new(enricher),
        config.pipeline.clone(),
    )
    .with_progress(progress);

    Ok(WorkerPool::new(
        Arc::clone(ctx.service.queue()),
        Arc::clone(ctx.service.store()),
        Arc::new(orchestrator),
        config.workers.clone(),
    ))
}

fn parse_job_id(raw: &str) -> Result<JobId> {
    raw.trim()
        .parse()
        .map_err(|e| eyre!("invalid job id '{raw}': {e}"))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_submit(overrides: &ConfigOverrides, request: SubmitRequest, wait: bool) -> Result<()> {
    let ctx = open_context(overrides).await?;
    let job_id = ctx.service.submit_enrichment_job(request).await?;
    println!("{job_id}");

    if wait {
        let progress = Arc::new(CliProgress::new());
        build_pool(&ctx, progress.clone())?.run_until_drained().await?;
        progress.finish();
        print_status(&ctx, &job_id).await?;
    }
    Ok(())
}

async fn cmd_status(
    overrides: &ConfigOverrides,
    job_id: Option<&str>,
    status: Option<&str>,
    json: bool,
) -> Result<()> {
    let ctx = open_context(overrides).await?;

    if let Some(raw) = job_id {
        let job_id = parse_job_id(raw)?;
        if json {
            return print_json(&ctx.service.get_job_status(&job_id).await?);
        }
        return print_status(&ctx, &job_id).await;
    }

    let filter = status.map(str::parse::<JobStatus>).transpose()?;
    let jobs = ctx.service.list_jobs(filter).await?;
    if json {
        return print_json(&jobs);
    }

    println!("Queue: {}", ctx.service.queue_depth().await?);
    println!();
    if jobs.is_empty() {
        println!("No jobs.");
        return Ok(());
    }
    println!("  {:<36}  {:<9}  {:>7}  ORGANIZATION", "JOB", "STATUS", "ATTEMPT");
    for job in &jobs {
        println!(
            "  {:<36}  {:<9}  {:>3}/{:<3}  {}",
            job.id.to_string(),
            job.status.to_string(),
            job.attempt,
            job.max_attempts,
            job.org.name
        );
    }
    Ok(())
}

async fn print_status(ctx: &Context, job_id: &JobId) -> Result<()> {
    let report = ctx.service.get_job_status(job_id).await?;
    println!();
    println!("  Job:        {}", report.job_id);
    println!("  Status:     {}", report.status);
    println!("  Attempt:    {}/{}", report.attempt, report.max_attempts);
    if let Some(stage) = report.last_stage {
        println!("  Stage:      {stage}");
    }
    println!("  Discovered: {}", report.contacts_discovered);
    println!("  Enriched:   {}", report.contacts_enriched);
    if let Some(error) = &report.error_message {
        println!("  Error:      {error}");
    }
    println!();
    Ok(())
}

async fn cmd_contacts(overrides: &ConfigOverrides, job_id: &str, json: bool) -> Result<()> {
    let ctx = open_context(overrides).await?;
    let job_id = parse_job_id(job_id)?;
    let contacts = ctx.service.list_contacts(&job_id).await?;
    if json {
        return print_json(&contacts);
    }
    if contacts.is_empty() {
        println!("No contacts.");
        return Ok(());
    }

    for entry in &contacts {
        let c = &entry.contact;
        let approved = if c.approved_at.is_some() { " [approved]" } else { "" };
        println!(
            "{}  {} ({}) confidence={} sources={}{approved}",
            c.id,
            c.full_name(),
            c.job_title.as_deref().unwrap_or("-"),
            c.confidence,
            c.sources.join(","),
        );
        for email in &entry.emails {
            println!("    {:<40} {:<10} {:.2}", email.email, email.status.to_string(), email.score);
        }
    }
    Ok(())
}

async fn cmd_approve(
    overrides: &ConfigOverrides,
    job_id: &str,
    contact_ids: &[String],
    actor: &str,
) -> Result<()> {
    let ctx = open_context(overrides).await?;
    let job_id = parse_job_id(job_id)?;
    let approved = ctx.service.approve_contacts(&job_id, contact_ids, actor).await?;
    println!("Approved {approved} of {} contact(s).", contact_ids.len());
    Ok(())
}

async fn cmd_retry(overrides: &ConfigOverrides, job_id: &str, force: bool, actor: &str) -> Result<()> {
    let ctx = open_context(overrides).await?;
    let job_id = parse_job_id(job_id)?;
    let ticket = ctx.service.retry_job(&job_id, actor, force).await?;
    println!(
        "Job {job_id} requeued (next attempt {}/{}).",
        ticket.attempt, ticket.max_attempts
    );
    Ok(())
}

async fn cmd_cancel(overrides: &ConfigOverrides, job_id: &str, actor: &str) -> Result<()> {
    let ctx = open_context(overrides).await?;
    let job_id = parse_job_id(job_id)?;
    match ctx.service.cancel_job(&job_id, actor).await? {
        contactforge_core::CancelOutcome::Dequeued => {
            println!("Job {job_id} removed from the queue.")
        }
        contactforge_core::CancelOutcome::Flagged => {
            println!("Job {job_id} is running; it stops at the next stage boundary.")
        }
    }
    Ok(())
}

async fn cmd_audit(overrides: &ConfigOverrides, job_id: &str, json: bool) -> Result<()> {
    let ctx = open_context(overrides).await?;
    let job_id = parse_job_id(job_id)?;
    let events = ctx.service.list_audit_events(&job_id).await?;
    if json {
        return print_json(&events);
    }
    for event in &events {
        println!(
            "{:>5}  {}  {:<21}  {:<16}  {}",
            event.id,
            event.timestamp.format("%Y-%m-%d %H:%M:%S"),
            event.event_type.to_string(),
            event.actor_id,
            event.metadata
        );
    }
    Ok(())
}

async fn cmd_work(overrides: &ConfigOverrides, drain: bool) -> Result<()> {
    let ctx = open_context(overrides).await?;
    let progress = Arc::new(CliProgress::new());
    let pool = build_pool(&ctx, progress.clone())?;

    info!(
        workers = ctx.config.workers.pool_size,
        queue = %ctx.config.queue.target,
        drain,
        "starting workers"
    );

    if drain {
        pool.run_until_drained().await?;
    } else {
        let handle = pool.start();
        tokio::signal::ctrl_c()
            .await
            .wrap_err("waiting for shutdown signal")?;
        progress.message("Shutting down, waiting for in-flight jobs");
        handle.shutdown().await;
    }

    progress.finish();
    println!("Queue: {}", ctx.service.queue_depth().await?);
    Ok(())
}

fn cmd_match_orgs(
    mut names: Vec<String>,
    file: Option<&std::path::Path>,
    threshold: f64,
    json: bool,
) -> Result<()> {
    if let Some(path) = file {
        let content = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("reading {}", path.display()))?;
        names.extend(content.lines().map(str::to_string));
    }
    if names.is_empty() {
        return Err(eyre!("no organization names given"));
    }

    let groups = OrgMatcher::new(threshold).group_duplicates(&names);
    if json {
        return print_json(&groups);
    }
    if groups.is_empty() {
        println!("No likely duplicates.");
        return Ok(());
    }
    for group in &groups {
        println!("{} (min similarity {:.2})", group.canonical, group.score);
        for member in &group.members {
            println!("  - {member}");
        }
    }
    Ok(())
}

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(overrides: &ConfigOverrides) -> Result<()> {
    let config = resolve_config(overrides)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg}") {
            spinner.set_style(
                style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
            );
        }
        spinner.enable_steady_tick(Duration::from_millis(80));
        spinner.set_message("Waiting for jobs");
        Self { spinner }
    }

    fn message(&self, msg: &str) {
        self.spinner.set_message(msg.to_string());
    }

    fn finish(&self) {
        self.spinner.finish_and_clear();
    }
}

impl ProgressReporter for CliProgress {
    fn stage(&self, job_id: &JobId, stage: PipelineStage) {
        self.spinner.set_message(format!("{job_id}: {stage}"));
    }

    fn done(&self, report: &PipelineReport) {
        self.spinner.println(format!(
            "✓ {} contacts={} emails={} in {:.1}s",
            report.job_id,
            report.contacts,
            report.emails,
            report.elapsed.as_secs_f64()
        ));
    }
}
