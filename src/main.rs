//! Drawkeeper — provably fair draw execution
//!
//! Runs the phase scheduler and payout queue over a local store, and
//! exposes the operator commands: manual execution, verification and
//! seal key generation.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use drawkeeper::{
    Admin, Config, DrawEngine, DryRunSender, LogNotifier, MemoryStorage, Notifier, PayoutQueue,
    Repository, Scheduler, SeedVault, SledStorage, verify_draw,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Drawkeeper version
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "drawkeeper", version, about = "Drawkeeper: provably fair draw execution")]
struct Args {
    /// Config file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Data directory, overrides storage.data_dir
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler until ctrl-c
    Run {
        /// Log transfers instead of sending them
        #[arg(long)]
        dry_run: bool,

        /// Dry-run wallet balance, e.g. TON=5000000000 (repeatable)
        #[arg(long = "balance", value_parser = parse_balance)]
        balances: Vec<(String, u64)>,
    },
    /// Print the verification report of a draw as JSON
    Verify { draw_id: u64 },
    /// Execute the earliest scheduled draw of a lottery now
    ExecuteNow { lottery_id: u64 },
    /// Print a fresh seal key
    GenSealKey,
}

fn parse_balance(s: &str) -> Result<(String, u64), String> {
    let (currency, amount) = s
        .split_once('=')
        .ok_or_else(|| format!("expected CURRENCY=AMOUNT, got {}", s))?;
    let amount = amount.parse().map_err(|e| format!("bad amount {}: {}", amount, e))?;
    Ok((currency.trim().to_uppercase(), amount))
}

/// Open storage. The sled handle is returned separately for flushing.
fn open_storage(config: &Config) -> anyhow::Result<(Arc<dyn Repository>, Option<Arc<SledStorage>>)> {
    if config.storage.in_memory {
        warn!("In-memory storage: nothing survives a restart");
        let repo: Arc<dyn Repository> = Arc::new(MemoryStorage::new());
        return Ok((repo, None));
    }
    let path = &config.storage.data_dir;
    std::fs::create_dir_all(path).with_context(|| format!("create {}", path.display()))?;
    let sled = Arc::new(SledStorage::open(path.join("drawkeeper.sled"))?);
    info!("Storage: {}", path.display());
    let repo: Arc<dyn Repository> = sled.clone();
    Ok((repo, Some(sled)))
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path).with_context(|| format!("load {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(dir) = &args.data_dir {
        config.storage.data_dir = dir.clone();
    }
    Ok(config)
}

fn build(
    config: &Config,
    repo: Arc<dyn Repository>,
    sender: Arc<DryRunSender>,
) -> anyhow::Result<(Arc<DrawEngine>, Arc<PayoutQueue<DryRunSender>>)> {
    let vault = config.seed_vault()?;
    let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);
    let engine = Arc::new(DrawEngine::new(
        Arc::clone(&repo),
        vault,
        Arc::clone(&notifier),
        config.engine.clone(),
    ));
    let payouts = Arc::new(PayoutQueue::new(repo, sender, notifier, config.payout.clone()));
    Ok((engine, payouts))
}

async fn run(config: Config, dry_run: bool, balances: Vec<(String, u64)>) -> anyhow::Result<()> {
    if !dry_run {
        bail!("no transaction sender is configured for this build, use --dry-run");
    }

    info!("════════════════════════════════════════════════════════════");
    info!("  Drawkeeper v{} — draw execution engine", VERSION);
    info!("════════════════════════════════════════════════════════════");

    let (repo, sled) = open_storage(&config)?;
    let balances: HashMap<String, u64> = balances.into_iter().collect();
    info!("Dry-run sender, balances: {:?}", balances);
    let sender = Arc::new(DryRunSender::new(balances));
    let (engine, payouts) = build(&config, repo, sender)?;

    let scheduler = Arc::new(Scheduler::new(engine, payouts, config.schedule.clone()));
    let shutdown = CancellationToken::new();
    let handles = scheduler.spawn(shutdown.clone());
    info!("Scheduler running ({} phases)", handles.len());

    tokio::signal::ctrl_c().await.ok();
    info!("Shutting down...");
    shutdown.cancel();
    for handle in handles {
        if let Err(e) = handle.await {
            error!("Phase task ended abnormally: {}", e);
        }
    }

    if let Some(sled) = sled {
        sled.flush()?;
    }
    info!("Stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("drawkeeper=info".parse()?),
        )
        .init();

    let args = Args::parse();

    match &args.command {
        Command::GenSealKey => {
            println!("{}", SeedVault::generate_key_hex());
        }
        Command::Verify { draw_id } => {
            let config = load_config(&args)?;
            let (repo, _) = open_storage(&config)?;
            let report = verify_draw(repo.as_ref(), &LogNotifier, *draw_id)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::ExecuteNow { lottery_id } => {
            let config = load_config(&args)?;
            let (repo, sled) = open_storage(&config)?;
            let sender = Arc::new(DryRunSender::new(HashMap::new()));
            let (engine, payouts) = build(&config, repo, sender)?;
            let summary = Admin::new(engine, payouts).execute_draw_now(*lottery_id).await?;
            if let Some(sled) = sled {
                sled.flush()?;
            }
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::Run { dry_run, balances } => {
            let config = load_config(&args)?;
            run(config, *dry_run, balances.clone()).await?;
        }
    }
    Ok(())
}
