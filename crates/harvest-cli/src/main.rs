use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use url::Url;

use harvest_client::HttpPortal;
use harvest_core::{
    CheckpointStore, EgressIdentity, EgressPool, HarvestConfig, InstanceSlice, KeyAlphabet,
    Orchestrator, RunSummary, SystemClock, ThrottleConfig, TracingRunReporter,
};

#[derive(Parser)]
#[command(
    name = "harvest",
    version,
    about = "Partitioned, resumable bulk extraction from rate-limited search portals"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Harvest every partition assigned to this instance
    Run {
        #[command(flatten)]
        portal: PortalArgs,

        #[command(flatten)]
        harvest: HarvestArgs,
    },

    /// Print the partitions this instance would process and exit
    Plan {
        #[command(flatten)]
        portal: PortalArgs,

        #[command(flatten)]
        harvest: HarvestArgs,
    },

    /// Print a summary of this instance's checkpoint
    Status {
        #[command(flatten)]
        output: OutputArgs,
    },
}

#[derive(Args)]
struct PortalArgs {
    /// Portal API base URL
    #[arg(short, long, env = "HARVEST_PORTAL_URL")]
    url: String,

    /// Portal account name
    #[arg(long, env = "HARVEST_USERNAME")]
    username: String,

    /// Portal account password
    #[arg(long, env = "HARVEST_PASSWORD", hide_env_values = true)]
    password: String,

    /// Per-request timeout in seconds
    #[arg(long, env = "HARVEST_TIMEOUT_SECS", default_value_t = 30)]
    timeout_secs: u64,

    /// Proxy URL, `scheme://[user:pass@]host:port` (repeatable)
    #[arg(long = "proxy", env = "HARVEST_PROXIES", value_delimiter = ',')]
    proxies: Vec<String>,

    /// File with one proxy URL per line
    #[arg(long, env = "HARVEST_PROXY_FILE")]
    proxy_file: Option<PathBuf>,
}

#[derive(Args)]
struct OutputArgs {
    /// Directory for NDJSON output files
    #[arg(short, long, env = "HARVEST_OUTPUT_DIR", default_value = "output")]
    output: PathBuf,

    /// Checkpoint file (defaults to `<output>/.checkpoint-<instance>.json`)
    #[arg(long, env = "HARVEST_CHECKPOINT")]
    checkpoint: Option<PathBuf>,

    /// This process's share of the work, as INDEX/COUNT (0-based)
    #[arg(long, env = "HARVEST_INSTANCE", default_value = "0/1")]
    instance: InstanceSlice,
}

#[derive(Args)]
struct HarvestArgs {
    #[command(flatten)]
    output: OutputArgs,

    /// Region ids to harvest (default: every region the portal lists)
    #[arg(short, long = "region", env = "HARVEST_REGIONS", value_delimiter = ',')]
    regions: Vec<String>,

    /// Records requested per page
    #[arg(long, env = "HARVEST_PAGE_SIZE", default_value_t = 100)]
    page_size: u64,

    /// Partitions walked concurrently
    #[arg(short, long, env = "HARVEST_WORKERS", default_value_t = 4)]
    workers: usize,

    /// Minimum delay between pages of one partition, in milliseconds
    #[arg(long, env = "HARVEST_DELAY_MS", default_value_t = 1000)]
    delay_ms: u64,

    /// Random extra delay between pages, up to this many milliseconds
    #[arg(long, env = "HARVEST_JITTER_MS", default_value_t = 500)]
    jitter_ms: u64,

    /// Records written between checkpoint flushes
    #[arg(long, env = "HARVEST_FLUSH_EVERY", default_value_t = 500)]
    flush_every: u64,

    /// Leading-key symbols, one partition per symbol
    #[arg(long, env = "HARVEST_ALPHABET")]
    alphabet: Option<String>,

    /// Also walk one unfiltered partition per region and category
    #[arg(long, env = "HARVEST_CATCH_ALL", default_value_t = false)]
    catch_all: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("harvest=info".parse()?),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { portal, harvest } => cmd_run(&portal, &harvest).await,
        Commands::Plan { portal, harvest } => cmd_plan(&portal, &harvest).await,
        Commands::Status { output } => cmd_status(&output).await,
    }
}

async fn cmd_run(portal_args: &PortalArgs, harvest: &HarvestArgs) -> Result<()> {
    let config = build_config(portal_args, harvest)?;
    let pool = build_pool(portal_args, config.instance)?;
    let portal = build_portal(portal_args)?;

    tracing::info!(
        instance = %config.instance,
        identities = pool.len(),
        output = %config.output_dir.display(),
        "Starting harvest"
    );

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, finishing current pages");
            on_signal.cancel();
        }
    });

    let summary = Orchestrator::new(portal, config, pool, SystemClock)
        .run(cancel, Arc::new(TracingRunReporter))
        .await
        .context("Harvest run failed")?;

    print_summary(&summary);
    if summary.abandoned > 0 {
        anyhow::bail!(
            "{} partition(s) abandoned after repeated failures; rerun to resume them",
            summary.abandoned
        );
    }
    Ok(())
}

async fn cmd_plan(portal_args: &PortalArgs, harvest: &HarvestArgs) -> Result<()> {
    let config = build_config(portal_args, harvest)?;
    let pool = build_pool(portal_args, config.instance)?;
    let portal = build_portal(portal_args)?;
    let instance = config.instance;

    let plan = Orchestrator::new(portal, config, pool, SystemClock)
        .plan()
        .await
        .context("Failed to plan partitions")?;

    println!(
        "Instance {} owns {} of {} partitions:\n",
        instance,
        plan.partitions.len(),
        plan.total_partitions
    );
    for partition in &plan.partitions {
        println!("  {}", partition.key());
    }
    Ok(())
}

async fn cmd_status(output: &OutputArgs) -> Result<()> {
    let mut config = HarvestConfig::new(&output.output).with_instance(output.instance);
    if let Some(path) = &output.checkpoint {
        config = config.with_checkpoint_path(path);
    }
    let path = config.resolved_checkpoint_path();

    let checkpoint = CheckpointStore::new(&path)
        .load()
        .await
        .with_context(|| format!("Failed to read checkpoint: {}", path.display()))?;

    let Some(checkpoint) = checkpoint else {
        println!("No checkpoint at {}", path.display());
        return Ok(());
    };

    println!("Checkpoint {} (instance {}):\n", path.display(), checkpoint.instance);
    println!("  run id:        {}", checkpoint.run_id);
    println!("  updated at:    {}", checkpoint.updated_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!("  completed:     {}", checkpoint.completed.len());
    println!("  in flight:     {}", checkpoint.in_flight.len());
    println!("  records:       {}", checkpoint.total_records);
    for (key, offset) in &checkpoint.in_flight {
        println!("    {key} (next offset {offset})");
    }
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!("Planned:    {}", summary.planned);
    println!("Skipped:    {}", summary.skipped);
    println!("Completed:  {}", summary.completed);
    println!("Abandoned:  {}", summary.abandoned);
    println!("Interrupted: {}", summary.interrupted);
    println!("Records:    {}", summary.records_emitted);
    println!("Duplicates: {}", summary.duplicates_suppressed);
}

fn build_config(portal: &PortalArgs, args: &HarvestArgs) -> Result<HarvestConfig> {
    let mut config = HarvestConfig::new(&args.output.output)
        .with_regions(args.regions.clone())
        .with_page_size(args.page_size)
        .with_workers(args.workers)
        .with_throttle(
            ThrottleConfig::new(Duration::from_millis(args.delay_ms))
                .with_jitter(Duration::from_millis(args.jitter_ms)),
        )
        .with_flush_every(args.flush_every)
        .with_request_timeout(Duration::from_secs(portal.timeout_secs))
        .with_catch_all(args.catch_all)
        .with_instance(args.output.instance);

    if let Some(path) = &args.output.checkpoint {
        config = config.with_checkpoint_path(path);
    }
    if let Some(symbols) = &args.alphabet {
        config = config.with_alphabet(KeyAlphabet::from_chars(symbols)?);
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn build_portal(args: &PortalArgs) -> Result<HttpPortal> {
    let portal = HttpPortal::new(&args.url, &args.username, &args.password)
        .context("Failed to configure portal client")?
        .with_timeout(Duration::from_secs(args.timeout_secs));
    Ok(portal)
}

/// Egress pool for this instance: every configured proxy, dealt across
/// instances, or a single direct identity when none are configured.
fn build_pool(args: &PortalArgs, instance: InstanceSlice) -> Result<EgressPool> {
    let mut lines: Vec<String> = args.proxies.clone();
    if let Some(path) = &args.proxy_file {
        lines.extend(read_proxy_file(path)?);
    }

    let identities = lines
        .iter()
        .map(|line| parse_proxy(line))
        .collect::<Result<Vec<_>>>()?;

    let pool = if identities.is_empty() {
        EgressPool::direct()
    } else {
        EgressPool::new(identities)?
    };
    Ok(pool.for_instance(instance.index, instance.count)?)
}

fn read_proxy_file(path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read proxy file: {}", path.display()))?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(String::from)
        .collect())
}

/// Parse `scheme://[user:pass@]host:port` into an identity, moving any
/// credentials out of the address so they never show up in logs.
fn parse_proxy(raw: &str) -> Result<EgressIdentity> {
    let mut url =
        Url::parse(raw.trim()).with_context(|| format!("Invalid proxy URL: {raw}"))?;
    if url.host_str().is_none() {
        anyhow::bail!("Proxy URL has no host: {raw}");
    }

    let username = url.username().to_string();
    let password = url.password().unwrap_or_default().to_string();
    // Clearing userinfo only fails for cannot-be-a-base URLs, ruled out above.
    let _ = url.set_username("");
    let _ = url.set_password(None);

    let address = url.as_str().trim_end_matches('/').to_string();
    let identity = EgressIdentity::proxy(address);
    if username.is_empty() {
        Ok(identity)
    } else {
        Ok(identity.with_credentials(username, password))
    }
}
