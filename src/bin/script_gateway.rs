//! script_gateway - HTTP service running restricted scripts
//!
//! This daemon:
//! 1. Loads configuration (file + environment) and fails fast on missing credentials
//! 2. Serves POST /execute and GET /health
//! 3. Runs each script in its own interpreter, one thread per connection

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};

use script_gateway::api::{ApiConfig, ApiServer};
use script_gateway::config::GatewayConfig;
use script_gateway::Gateway;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// JSON configuration file.
    #[arg(long, env = "GATEWAY_CONFIG")]
    config: Option<PathBuf>,
    /// Listen address (overrides the configuration file).
    #[arg(long, env = "GATEWAY_ADDR")]
    addr: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut config = GatewayConfig::load_from(args.config.as_deref())?;
    if let Some(addr) = args.addr.filter(|addr| !addr.trim().is_empty()) {
        config.api_addr = addr;
    }
    log::info!(
        "data bridge: tenant {} via {}",
        config.bridge.credentials.tenant_id,
        config.bridge.api_base
    );

    let gateway = Arc::new(Gateway::from_config(&config)?);
    let api_handle = ApiServer::new(ApiConfig::from_gateway_config(&config), gateway).spawn()?;
    log::info!("script api listening on {}", api_handle.addr);

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("error setting Ctrl-C handler");

    log::info!("script_gateway waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping API server...");
    api_handle.stop()?;

    Ok(())
}
