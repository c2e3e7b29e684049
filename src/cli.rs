//! Magpie CLI - maintenance tool for the agent memory store
//!
//! Usage:
//!   magpie path                      Show which database would be used
//!   magpie stats                     Show row counts
//!   magpie check                     Verify the keyword mirror
//!   magpie decay                     Recompute decay scores
//!   magpie gc                        Remove decayed fragments
//!   magpie maintain                  Decay, then GC

use clap::{Parser, Subcommand};
use colored::*;
use magpie::{
    resolve_db_path, run_maintenance, FragmentStore, MaintenanceConfigBuilder, StoreConfig,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "magpie")]
#[command(about = "Magpie - memory store maintenance for AI agents")]
#[command(version)]
struct Cli {
    /// Database path, or :memory:
    #[arg(long, global = true, env = "MAGPIE_DB")]
    db: Option<String>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the resolved database location
    Path,

    /// Show row counts
    Stats {
        /// Only count this agent's rows
        #[arg(short, long)]
        agent: Option<String>,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Compare fragments with the keyword mirror
    Check {
        /// Rebuild the mirror if it has drifted
        #[arg(long)]
        repair: bool,
    },

    /// Recompute decay scores from last activity
    Decay {
        #[arg(short, long)]
        agent: Option<String>,

        /// Half-life in days
        #[arg(long)]
        half_life: Option<f64>,
    },

    /// Remove unpinned fragments whose score fell below the threshold
    Gc {
        #[arg(short, long)]
        agent: Option<String>,

        /// Only report what would be removed
        #[arg(long)]
        dry_run: bool,
    },

    /// Run decay and GC in one pass
    Maintain {
        #[arg(short, long)]
        agent: Option<String>,

        /// Half-life in days
        #[arg(long)]
        half_life: Option<f64>,

        /// Recompute scores but delete nothing
        #[arg(long)]
        dry_run: bool,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "info,magpie=debug" } else { "warn" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut config = StoreConfig::from_env()?;
    if let Some(db) = &cli.db {
        config.db_path = Some(db.clone());
    }

    match cli.command {
        Commands::Path => cmd_path(&config),
        Commands::Stats { agent, json } => cmd_stats(&config, agent, json).await,
        Commands::Check { repair } => cmd_check(&config, repair).await,
        Commands::Decay { agent, half_life } => cmd_decay(&config, agent, half_life).await,
        Commands::Gc { agent, dry_run } => cmd_gc(&config, agent, dry_run).await,
        Commands::Maintain {
            agent,
            half_life,
            dry_run,
            json,
        } => cmd_maintain(&config, agent, half_life, dry_run, json).await,
    }
}

fn cmd_path(config: &StoreConfig) -> anyhow::Result<()> {
    let location = resolve_db_path(config.db_path.as_deref())?;
    println!("{}", location);
    Ok(())
}

async fn cmd_stats(config: &StoreConfig, agent: Option<String>, json: bool) -> anyhow::Result<()> {
    let store = FragmentStore::open(config).await?;
    let stats = store.stats(agent.as_deref()).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!("{}", "Magpie Statistics".bold().underline());
    println!("  Database: {}", store.location());
    if let Some(agent) = &agent {
        println!("  Agent: {}", agent.cyan());
    }
    println!("  Fragments: {}", stats.fragments);
    println!("  Pinned: {}", stats.pinned);
    println!("  Embeddings: {}", stats.embeddings);
    println!("  Mining sessions: {}", stats.mining_sessions);
    println!("  GC candidates: {}", stats.gc_candidates);

    let last_mined = store.last_mined_per_agent().await?;
    if !last_mined.is_empty() {
        println!("\n{}", "Last mined:".bold());
        for (agent, at) in last_mined {
            println!("  {}: {}", agent.cyan(), at.to_rfc3339());
        }
    }

    Ok(())
}

async fn cmd_check(config: &StoreConfig, repair: bool) -> anyhow::Result<()> {
    let store = FragmentStore::open(config).await?;
    let report = store.check_mirror().await?;

    if report.is_consistent() {
        println!("{}", "Keyword mirror is consistent".green());
        return Ok(());
    }

    println!("{}", "Keyword mirror has drifted".yellow());
    println!("  Missing entries: {:?}", report.missing);
    println!("  Orphaned entries: {:?}", report.orphaned);
    println!("  Stale entries: {:?}", report.stale);

    if !repair {
        anyhow::bail!("mirror check failed; rerun with --repair to rebuild");
    }

    let indexed = store.rebuild_mirror().await?;
    println!("{}", format!("Rebuilt mirror ({} fragments)", indexed).green());
    Ok(())
}

async fn cmd_decay(
    config: &StoreConfig,
    agent: Option<String>,
    half_life: Option<f64>,
) -> anyhow::Result<()> {
    let store = FragmentStore::open(config).await?;
    let half_life = half_life.unwrap_or(config.half_life_days);

    let touched = store.recalculate_decay(agent.as_deref(), half_life).await?;
    println!(
        "{}",
        format!("Recalculated {} fragments (half-life {} days)", touched, half_life).green()
    );
    Ok(())
}

async fn cmd_gc(config: &StoreConfig, agent: Option<String>, dry_run: bool) -> anyhow::Result<()> {
    let store = FragmentStore::open(config).await?;

    if dry_run {
        let candidates = store.count_gc_candidates(agent.as_deref()).await?;
        println!("{}", "Dry run - no changes will be made".yellow());
        println!("  Would remove {} fragments", candidates);
        return Ok(());
    }

    let removed = store.gc(agent.as_deref()).await?;
    println!("{}", format!("Removed {} fragments", removed).green());
    Ok(())
}

async fn cmd_maintain(
    config: &StoreConfig,
    agent: Option<String>,
    half_life: Option<f64>,
    dry_run: bool,
    json: bool,
) -> anyhow::Result<()> {
    let store = FragmentStore::open(config).await?;

    let mut builder = MaintenanceConfigBuilder::new()
        .half_life_days(half_life.unwrap_or(config.half_life_days))
        .dry_run(dry_run);
    if let Some(agent) = agent {
        builder = builder.agent(agent);
    }

    if dry_run && !json {
        println!("{}", "Dry run - scores are recomputed, nothing is deleted".yellow());
    }

    let report = run_maintenance(&store, &builder.build()).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("{}", "Maintenance complete".green());
    println!("  Decayed: {}", report.decayed);
    println!("  GC candidates: {}", report.gc_candidates);
    println!("  Collected: {}", report.collected);
    Ok(())
}
