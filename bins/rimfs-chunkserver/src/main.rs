use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};

use rimfs_chunk_engine::HddEngine;
use rimfs_config::{ConfigManager, HddConfig};
use rimfs_logging::LogConfig;

/// rimfs data node
#[derive(Parser, Debug)]
#[command(name = "rimfs-chunkserver", version, about)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "chunkserver.toml")]
    config: String,

    /// Dump default configuration and exit
    #[arg(long)]
    dump_default_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.dump_default_config {
        print!("{}", toml::to_string_pretty(&HddConfig::default())?);
        return Ok(());
    }

    let _log_guard = rimfs_logging::init_logging(&LogConfig::default());

    let manager = Arc::new(ConfigManager::load(&args.config)?);
    let config = manager.snapshot();

    tracing::info!(config = %args.config, "starting rimfs chunkserver");
    let engine = HddEngine::new(&config)?;
    engine.start();

    // Rotate per-folder minute statistics once a minute until shutdown.
    let stats_engine = engine.clone();
    let stats_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            stats_engine.move_stats();
        }
    });

    // SIGHUP re-reads the configuration; the engine only has to act when
    // something it consumes actually changed.
    let reload_manager = Arc::clone(&manager);
    let reload_engine = engine.clone();
    let reload_task = tokio::spawn(async move {
        let mut sighup = signal(SignalKind::hangup()).expect("failed to register SIGHUP handler");
        while sighup.recv().await.is_some() {
            match reload_manager.reload() {
                Ok(summary) => {
                    if summary.options_changed || summary.folder_list_moved {
                        let config = reload_manager.snapshot();
                        if let Err(e) = reload_engine.reload(&config) {
                            tracing::error!(error = %e, "engine reload failed");
                        }
                    } else {
                        tracing::info!("configuration unchanged");
                    }
                }
                Err(e) => tracing::error!(error = %e, "config reload failed"),
            }
        }
    });

    wait_for_shutdown_signal().await;
    tracing::info!("shutting down");
    stats_task.abort();
    reload_task.abort();
    engine.terminate();
    Ok(())
}

/// Wait for a shutdown signal (CTRL+C or SIGTERM).
async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
    tokio::select! {
        _ = ctrl_c => { tracing::info!("received CTRL+C"); }
        _ = sigterm.recv() => { tracing::info!("received SIGTERM"); }
    }
}
