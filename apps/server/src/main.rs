//! EchoRoute Server - standalone headless audio router.
//!
//! Binds the Scream and RTP ingress ports, applies a desired-state YAML
//! through the reconciler, and runs until a shutdown signal arrives. An
//! external configuration store (or a human with an editor) owns the state
//! file; this binary only feeds it to the engine.

mod config;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{Context, Result};
use clap::Parser;
use echoroute_core::{AudioManager, ConfigApplier, DesiredEngineState};
use tokio::signal;

use crate::config::ServerConfig;

/// EchoRoute Server - headless LAN PCM audio router.
#[derive(Parser, Debug)]
#[command(name = "echoroute-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "ECHOROUTE_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// Desired-state file (overrides config file).
    #[arg(short, long, env = "ECHOROUTE_STATE_FILE")]
    state: Option<PathBuf>,

    /// Scream ingress port (overrides config file).
    #[arg(long, env = "ECHOROUTE_SCREAM_PORT")]
    scream_port: Option<u16>,

    /// RTP ingress port (overrides config file).
    #[arg(long, env = "ECHOROUTE_RTP_PORT")]
    rtp_port: Option<u16>,

    /// Re-apply the state file every N seconds (overrides config file).
    #[arg(short, long)]
    watch: Option<u64>,
}

/// Reads and parses the desired-state YAML.
fn load_desired_state(path: &Path) -> Result<DesiredEngineState> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read state file: {}", path.display()))?;
    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse state file: {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("EchoRoute Server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let mut config =
        ServerConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    // Apply CLI overrides
    if let Some(port) = args.scream_port {
        config.scream_port = port;
    }
    if let Some(port) = args.rtp_port {
        config.rtp_port = port;
    }
    if let Some(state) = args.state {
        config.state_file = Some(state);
    }
    if let Some(watch) = args.watch {
        config.watch_interval_secs = Some(watch);
    }

    log::info!(
        "Configuration: scream_port={}, rtp_port={}, state_file={:?}",
        config.scream_port,
        config.rtp_port,
        config.state_file
    );

    // Bring the engine up. A bind failure is fatal: no partial engine.
    let manager = Arc::new(
        AudioManager::initialize(config.to_engine_config())
            .await
            .context("Failed to initialize audio engine")?,
    );
    let mut applier = ConfigApplier::new(manager.clone());

    // Apply the initial desired state.
    if let Some(ref state_path) = config.state_file {
        let desired = load_desired_state(state_path)?;
        if !applier.apply_state(desired).await {
            log::warn!("Initial state applied with errors; see log for details");
        } else {
            log::info!(
                "Applied state: {} sinks, {} paths",
                applier.active_sinks().len(),
                applier.active_source_paths().len()
            );
        }
    } else {
        log::info!("No state file configured - engine starts empty");
    }

    // Optionally re-apply the state file when it changes.
    let watch = config
        .watch_interval_secs
        .zip(config.state_file.clone());
    let watcher = async move {
        let Some((interval_secs, state_path)) = watch else {
            return std::future::pending::<()>().await;
        };
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
        let mut last_modified: Option<SystemTime> = None;
        loop {
            interval.tick().await;
            let modified = std::fs::metadata(&state_path)
                .and_then(|m| m.modified())
                .ok();
            if modified == last_modified {
                continue;
            }
            last_modified = modified;
            match load_desired_state(&state_path) {
                Ok(desired) => {
                    log::info!("State file changed, re-applying");
                    if !applier.apply_state(desired).await {
                        log::warn!("State re-applied with errors");
                    }
                }
                Err(e) => log::error!("Ignoring unreadable state file: {e:#}"),
            }
        }
    };

    // Run until a shutdown signal arrives.
    tokio::select! {
        _ = watcher => {}
        _ = shutdown_signal() => {}
    }

    log::info!("Shutdown signal received, cleaning up...");
    manager.shutdown().await;
    log::info!("Shutdown complete");
    Ok(())
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
