//! roadwatchd - detection API service
//!
//! Loads configuration, builds one detector backend per model and serves
//! the HTTP API until Ctrl-C.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::{mpsc, Arc};

use roadwatch::api::{ApiConfig, ApiServer};
use roadwatch::config::ServiceConfig;
use roadwatch::DetectionService;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Config file (JSON, or TOML by extension).
    #[arg(long, env = "ROADWATCH_CONFIG", value_name = "PATH")]
    config: Option<String>,
    /// Override the listen address.
    #[arg(long, value_name = "ADDR")]
    addr: Option<String>,
    /// Run each backend once on a blank frame before serving.
    #[arg(long)]
    warm_up: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    if let Some(path) = &args.config {
        std::env::set_var("ROADWATCH_CONFIG", path);
    }

    let config = ServiceConfig::load()?;
    let registry = config.build_registry()?;
    let served = registry.list();
    if served.is_empty() {
        log::warn!("roadwatchd: no model files configured, every detection request will fail");
    }
    for (model, backend) in served {
        log::info!("roadwatchd: {} served by {} backend", model, backend);
    }
    if args.warm_up {
        registry.warm_up_all().context("backend warm-up")?;
    }
    let service = Arc::new(DetectionService::new(
        Arc::new(registry),
        Arc::new(config.build_annotator()?),
        Arc::new(config.build_stats()),
    ));

    let mut api_config = ApiConfig::from(&config);
    if let Some(addr) = args.addr {
        api_config.addr = addr;
    }
    let api_handle = ApiServer::new(api_config, service).spawn()?;
    log::info!(
        "roadwatchd running on {}, uploads in {}",
        api_handle.addr,
        config.storage.upload_dir.display()
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("error setting Ctrl-C handler")?;

    log::info!("roadwatchd waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping API server...");
    api_handle.stop()?;

    Ok(())
}
