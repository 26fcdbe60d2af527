//! mirrorprobed — the mirrorprobe daemon.
//!
//! Single binary that assembles:
//! - Change-feed source and calendar scheduler
//! - Collector with the configured probes
//! - Result store (redb), when `[cache]` is configured
//! - Bounded in-memory history
//! - Status API
//!
//! # Usage
//!
//! ```text
//! mirrorprobed init --package-dir /var/lib/mirrorprobe/publish
//! mirrorprobed check-config --config mirrorprobe.toml
//! mirrorprobed run --config mirrorprobe.toml --port 8480
//! ```

mod history;
mod wiring;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use mirrorprobe_collector::{Collector, CollectorOptions, HttpFeedSource, TokioScheduler};
use mirrorprobe_core::{Cache, MirrorprobeConfig};
use mirrorprobe_store::ResultStore;

use crate::history::RecentHistory;

const DEFAULT_LOG_FILTER: &str = "info,mirrorprobe=debug,mirrorprobed=debug";

#[derive(Parser)]
#[command(name = "mirrorprobed", about = "Registry and mirror health daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the collector and the status API.
    Run {
        /// Path to mirrorprobe.toml. Built-in defaults when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Port for the status API.
        #[arg(long, default_value = "8480")]
        port: u16,
    },
    /// Validate a config file and print what would run.
    CheckConfig {
        #[arg(long, default_value = "mirrorprobe.toml")]
        config: PathBuf,
    },
    /// Write a config with every probe enabled.
    Init {
        /// Directory holding the publish probe's package.json.
        #[arg(long)]
        package_dir: PathBuf,

        #[arg(long, default_value = "mirrorprobe.toml")]
        output: PathBuf,

        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    if cli.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    match cli.command {
        Command::Run { config, port } => run(config.as_deref(), port).await,
        Command::CheckConfig { config } => check_config(&config),
        Command::Init {
            package_dir,
            output,
            force,
        } => write_scaffold(&output, &package_dir, force),
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<MirrorprobeConfig> {
    let Some(path) = path else {
        return Ok(MirrorprobeConfig::default());
    };
    MirrorprobeConfig::from_file(path).with_context(|| format!("loading {}", path.display()))
}

async fn run(config_path: Option<&Path>, port: u16) -> anyhow::Result<()> {
    info!("mirrorprobe daemon starting");
    let config = load_config(config_path)?;
    let endpoints = config.endpoints();
    info!(
        registries = ?endpoints.names(),
        canonical = %config.collector.canonical,
        "registries loaded"
    );

    // ── History and cache ──────────────────────────────────────

    let history = Arc::new(RecentHistory::default());
    let factories = wiring::probe_factories(&config);
    let probe_names: Vec<&str> = factories.iter().map(|(name, _)| *name).collect();

    let cache: Option<Arc<dyn Cache>> = match &config.cache {
        Some(cache) => {
            if let Some(parent) = cache.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let store = ResultStore::open(&cache.path)?;
            info!(path = ?cache.path, "result store opened");
            wiring::seed_history(&store, &config, &probe_names, &history);
            Some(Arc::new(store))
        }
        None => None,
    };

    // ── Collector ──────────────────────────────────────────────

    let source = HttpFeedSource::new(&config.collector.feed_url);
    let collector = Collector::new(
        endpoints,
        Arc::new(source),
        Arc::new(TokioScheduler::new()),
        CollectorOptions {
            probes: factories.into_iter().map(|(_, factory)| factory).collect(),
            cache,
            npm_auth: config.npm.clone(),
            silent: config.collector.silent,
            feed_interval: config.collector.feed_interval(),
        },
    );
    info!(probes = ?probe_names, "collector initialized");

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Start background tasks ─────────────────────────────────

    let pump_handle = tokio::spawn(wiring::pump_events(collector.subscribe(), history.clone()));

    let collector_handle = {
        let collector = collector.clone();
        tokio::spawn(async move {
            collector.run(shutdown_rx).await;
        })
    };

    // ── Start API server ───────────────────────────────────────

    let router = mirrorprobe_api::build_router(collector, history);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "API server starting");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Graceful shutdown on Ctrl-C.
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.await?;

    // The collector closes its event bus on shutdown, which ends the pump.
    let _ = collector_handle.await;
    let _ = pump_handle.await;

    info!("mirrorprobe daemon stopped");
    Ok(())
}

fn check_config(path: &Path) -> anyhow::Result<()> {
    let config = load_config(Some(path))?;

    println!("config ok: {}", path.display());
    println!("canonical: {}", config.collector.canonical);
    let feed = &config.collector;
    println!("feed: {} every {:?}", feed.feed_url, feed.feed_interval());
    for endpoint in config.endpoints().iter() {
        let (name, href) = (&endpoint.name, &endpoint.href);
        println!("registry {name}: {href} (timeout {:?})", endpoint.timeout());
    }
    let probes = &config.probes;
    if let Some(ping) = &probes.ping {
        println!("probe ping: {}", ping.schedule);
    }
    if let Some(delta) = &probes.delta {
        println!("probe delta: {}", delta.schedule);
    }
    if let Some(publish) = &probes.publish {
        let dir = publish.package_dir.display();
        println!("probe publish: {} from {dir}", publish.schedule);
    }
    match &config.cache {
        Some(cache) => println!("cache: {}", cache.path.display()),
        None => println!("cache: none"),
    }
    Ok(())
}

fn write_scaffold(output: &Path, package_dir: &Path, force: bool) -> anyhow::Result<()> {
    if output.exists() && !force {
        anyhow::bail!("{} already exists, pass --force to overwrite", output.display());
    }
    let config = MirrorprobeConfig::scaffold(package_dir);
    let toml = config.to_toml_string()?;
    std::fs::write(output, toml).with_context(|| format!("writing {}", output.display()))?;
    println!("wrote {}", output.display());
    Ok(())
}
