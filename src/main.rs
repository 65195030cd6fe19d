//! Command-line client for 360 cameras.
//!
//! Usage:
//!   camctl photo ./shots
//!   camctl --storage /media/cam copy-storage /data/backup
//!   camctl -c ~/.config/camctl.conf interactive

mod camera;
mod commands;
mod config;
mod error;
mod shutdown;
mod transfer;
mod util;

use std::path::PathBuf;
use std::process;

use clap::Parser;
use log::{debug, error};

use crate::camera::osc::OscCamera;
use crate::camera::storage::StorageCamera;
use crate::config::{BackendType, ClientConfig};
use crate::shutdown::ShutdownFlag;

const DEFAULT_CONFIG: &str = "/etc/camctl/camctl.conf";

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(name = "camctl", version, about = "Capture, transfer and manage files on a 360 camera")]
struct Cli {
    /// Path to the configuration file (missing default file is not an error).
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Log to stderr even when the config enables syslog.
    #[arg(long)]
    stderr: bool,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,

    /// Camera host for the OSC backend (overrides camera_host).
    #[arg(long)]
    host: Option<String>,

    /// Use camera storage mounted at this path instead of the OSC API.
    #[arg(long, value_name = "MOUNT")]
    storage: Option<PathBuf>,

    #[command(subcommand)]
    command: commands::Command,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let cfg = match load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("camctl: config error: {e}");
            process::exit(1);
        }
    };

    let use_syslog = cfg.log_syslog && !cli.stderr;
    if let Err(e) = setup_logging(use_syslog, cli.debug) {
        eprintln!("camctl: {e:#}");
        process::exit(1);
    }
    debug!("backend {:?}", cfg.backend);

    let shutdown = ShutdownFlag::new();
    if let Err(e) = shutdown::install_signal_handlers(shutdown.clone()) {
        error!("cannot install signal handlers: {e}");
    }

    let ctx = commands::Context { cfg: &cfg, shutdown: &shutdown };
    let result = match cfg.backend {
        BackendType::Osc => match OscCamera::new(&cfg) {
            Ok(cam) => commands::run(cam, &cli.command, &ctx).await,
            Err(e) => Err(e),
        },
        BackendType::Storage => {
            commands::run(StorageCamera::new(&cfg.storage_root), &cli.command, &ctx).await
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

/// Read the config file, apply command-line overrides and validate.
fn load(cli: &Cli) -> error::Result<ClientConfig> {
    let (path, required) = match &cli.config {
        Some(p) => (p.clone(), true),
        None => (PathBuf::from(DEFAULT_CONFIG), false),
    };
    let mut cfg = config::load_config(&path, required)?;

    if let Some(host) = &cli.host {
        cfg.camera_host = host.clone();
        cfg.backend = BackendType::Osc;
    }
    if let Some(root) = &cli.storage {
        cfg.storage_root = root.clone();
        cfg.backend = BackendType::Storage;
    }

    config::validate_config(&cfg)?;
    Ok(cfg)
}

// ── Logging setup ─────────────────────────────────────────────────────────────

fn setup_logging(use_syslog: bool, debug: bool) -> anyhow::Result<()> {
    let level = if debug { log::LevelFilter::Debug } else { log::LevelFilter::Info };
    if use_syslog {
        let formatter = syslog::Formatter3164 {
            facility: syslog::Facility::LOG_USER,
            hostname: None,
            process:  "camctl".into(),
            pid:      process::id(),
        };
        let logger = syslog::unix(formatter)
            .map_err(|e| anyhow::anyhow!("syslog connect failed: {e}"))?;
        log::set_boxed_logger(Box::new(syslog::BasicLogger::new(logger)))
            .map(|()| log::set_max_level(level))
            .map_err(|e| anyhow::anyhow!("set_logger: {e}"))?;
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level.as_str()))
            .format_timestamp(None)
            .init();
    }
    Ok(())
}
