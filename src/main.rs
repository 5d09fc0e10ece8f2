//! Dispatch proxy binary.
//!
//! Loads the configuration, starts every listener and applies config file
//! changes until Ctrl+C.

use clap::Parser;
use std::path::PathBuf;

use dispatch_proxy::config::load_config;
use dispatch_proxy::config::watcher::ConfigWatcher;
use dispatch_proxy::lifecycle::signals::shutdown_on_ctrl_c;
use dispatch_proxy::observability::{logging, metrics};
use dispatch_proxy::{ProxyRuntime, Shutdown};

#[derive(Parser)]
#[command(name = "dispatch-proxy")]
#[command(about = "HTTP, TCP and UDP reverse proxy", long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "proxy.toml")]
    config: PathBuf,

    /// Override the configured log level
    #[arg(long)]
    log_level: Option<String>,

    /// Do not reload when the configuration file changes
    #[arg(long)]
    no_watch: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = load_config(&cli.config)?;
    if let Some(level) = cli.log_level {
        config.observability.log_level = level;
    }
    logging::init_logging(&config.observability);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = ?cli.config,
        listeners = config.listeners.len(),
        routes = config.routes.len(),
        clusters = config.clusters.len(),
        "dispatch-proxy starting"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let shutdown = Shutdown::new();
    let listeners = config.listeners.clone();
    let runtime = ProxyRuntime::new(config, shutdown.clone()).await?;
    let bound = runtime.start_listeners(&listeners).await?;

    // Keep the watcher alive for the life of the process.
    let _watcher = if cli.no_watch {
        None
    } else {
        let (watcher, mut updates) = ConfigWatcher::new(&cli.config);
        let watcher = watcher.run()?;
        let runtime = runtime.clone();
        tokio::spawn(async move {
            while let Some(config) = updates.recv().await {
                if config.listeners != listeners {
                    tracing::warn!("Listener changes require a restart and were ignored");
                }
                if let Err(e) = runtime.apply_config(config).await {
                    tracing::error!(error = %e, "Reload rejected, keeping current configuration");
                }
            }
        });
        Some(watcher)
    };

    shutdown_on_ctrl_c(shutdown).await;
    for listener in bound {
        if let Err(e) = listener.task.await {
            tracing::error!(listener = %listener.name, error = %e, "Listener task failed");
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
