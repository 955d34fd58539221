//! vdqmd - Volume & Drive Queue Manager daemon
//!
//! Loads the reference data and drive inventory from a YAML file, starts
//! the scheduler workers and the liveness monitor, and serves the REST API
//! until interrupted.

use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::{filter::Directive, fmt, prelude::*, EnvFilter};

use vdqm::{ApiServer, ApiServerConfig, Vdqm, VdqmConfig};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Volume & Drive Queue Manager - schedules tape mounts onto tape drives
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file (reference data, drives, tunables)
    #[arg(long, env = "VDQM_CONFIG")]
    config: Option<String>,

    /// REST API bind address, overrides the configuration file
    #[arg(long, env = "API_ADDR")]
    api_addr: Option<String>,

    /// Scheduler workers, overrides the configuration file
    #[arg(long, env = "WORKERS")]
    workers: Option<usize>,

    /// Allow cross-origin API requests
    #[arg(long, env = "PERMISSIVE_CORS")]
    permissive_cors: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let mut config = match &args.config {
        Some(path) => VdqmConfig::load(path).with_context(|| format!("loading {}", path))?,
        None => VdqmConfig::default(),
    };
    if let Some(addr) = &args.api_addr {
        config.api_addr = addr.clone();
    }
    if let Some(workers) = args.workers {
        config.workers = workers;
    }

    info!("Starting VDQM");
    info!("  Version: {}", vdqm::VERSION);
    info!("  REST API: {}", config.api_addr);
    info!("  Workers: {}", config.workers);
    info!("  Drive daemon port: {}", config.daemon.port);

    let rest_addr: SocketAddr = config
        .api_addr
        .parse()
        .with_context(|| format!("invalid REST API address {}", config.api_addr))?;

    let vdqm = Vdqm::from_config(config)
        .await
        .context("initialising scheduler")?;
    vdqm.start();

    let api_server = Arc::new(ApiServer::new(
        ApiServerConfig {
            rest_addr,
            permissive_cors: args.permissive_cors,
        },
        vdqm.clone(),
    ));

    let server = api_server.clone();
    let api = tokio::spawn(async move { server.run().await });

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("waiting for shutdown signal")?;
            info!("Shutdown signal received");
            api_server.shutdown();
        }
        result = api => {
            match result {
                Ok(Err(e)) => error!("REST server failed: {}", e),
                Err(e) => error!("REST server task panicked: {}", e),
                Ok(Ok(())) => {}
            }
        }
    }

    vdqm.shutdown().await;
    info!("VDQM shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "reqwest=warn", "tower_http=info", "axum=info"] {
        if let Ok(d) = directive.parse::<Directive>() {
            filter = filter.add_directive(d);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
