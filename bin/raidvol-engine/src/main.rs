#![allow(clippy::result_large_err)]
//! raidvol engine daemon
//!
//! Recovers every stored volume against the local data plane, then serves
//! JSON-lines requests on stdin with one response line per request on
//! stdout. Stops on Ctrl-C or end of input.

mod serve;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use raidvol_common::Config;
use raidvol_engine::{EngineDeps, EngineRegistry, Facade, LocalDataPlane};
use raidvol_meta_store::{MemoryStore, MetaStore, VolumeSpecStore};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(name = "raidvol-engine", about = "raidvol RAID assembly engine")]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/raidvol/engine.toml")]
    config: PathBuf,

    /// Data directory for the metadata database (overrides config)
    #[arg(long, env = "RAIDVOL_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Directory replica backing stores are created in (overrides config)
    #[arg(long, env = "RAIDVOL_REPLICA_DIR")]
    replica_dir: Option<PathBuf>,

    /// Log level (trace / debug / info / warn / error)
    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON log lines
    #[arg(long)]
    log_json: bool,

    /// Keep volume specs in memory only
    #[arg(long)]
    ephemeral: bool,
}

fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read config {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("parse config {}", path.display()))
}

fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    // Logs go to stderr; stdout carries responses
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Merge CLI args with config file (CLI takes precedence)
    let mut config = load_config(&args.config)?;
    if let Some(dir) = args.data_dir {
        config.storage.data_dir = dir;
    }
    if let Some(dir) = args.replica_dir {
        config.storage.replica_dir = dir;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    config.logging.json |= args.log_json;

    init_tracing(&config.logging.level, config.logging.json);
    info!("Starting raidvol engine");
    info!("Config file: {}", args.config.display());

    // ── Metadata store ────────────────────────────────────────────────────────
    let store: Arc<dyn VolumeSpecStore> = if args.ephemeral {
        warn!("Ephemeral mode: volume specs will not survive a restart");
        Arc::new(MemoryStore::new())
    } else {
        let db_path = config.storage.data_dir.join("raidvol.db");
        info!("Metadata database: {}", db_path.display());
        Arc::new(MetaStore::open(&db_path).context("open metadata store")?)
    };

    // ── Data plane ────────────────────────────────────────────────────────────
    std::fs::create_dir_all(&config.storage.replica_dir).with_context(|| {
        format!("create replica_dir {}", config.storage.replica_dir.display())
    })?;
    let plane = Arc::new(LocalDataPlane::new(
        &config.storage.replica_dir,
        config.frontend.clone(),
    ));

    // ── Engines ───────────────────────────────────────────────────────────────
    let config = Arc::new(config);
    let registry = Arc::new(EngineRegistry::new(EngineDeps {
        driver: plane.clone(),
        plane,
        store,
        config: Arc::clone(&config),
    }));
    let recovered = registry.start().await.context("recover volumes")?;
    info!("Recovered {recovered} volume(s)");

    // ── Background reconcile loop ─────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reconcile_handle = config.engine.reconcile_interval().map(|interval| {
        info!("Reconciling every {}s", interval.as_secs());
        Arc::clone(&registry).spawn_reconcile_loop(interval, shutdown_rx)
    });

    // ── Requests ──────────────────────────────────────────────────────────────
    let facade = Facade::new(Arc::clone(&registry), config.storage.default_volume_size);
    let interrupted = tokio::select! {
        result = serve::serve_stdio(&facade) => {
            result.context("request loop")?;
            false
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
            true
        }
    };

    shutdown_tx.send(true).ok();
    if let Some(handle) = reconcile_handle {
        handle.await.ok();
    }
    registry.shutdown().await;
    info!("raidvol engine stopped");

    if interrupted {
        // A pending stdin read cannot be cancelled and would block runtime shutdown
        std::process::exit(0);
    }
    Ok(())
}
