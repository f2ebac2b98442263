// src/main.rs

//! The main entry point for the sqlgate proxy.

use anyhow::Result;
use sqlgate::config::Config;
use sqlgate::server;
use std::env;
use std::sync::Arc;
use tracing::error;
use tracing_subscriber::{filter::EnvFilter, prelude::*, reload};

#[tokio::main]
async fn main() -> Result<()> {
    run_app().await
}

async fn run_app() -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    let args: Vec<String> = env::args().collect();

    if args.contains(&"--version".to_string()) {
        println!("sqlgate version {VERSION}");
        return Ok(());
    }

    // The configuration path can be provided via a --config flag;
    // otherwise it defaults to "sqlgate.toml".
    let config_path = args
        .iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
        .unwrap_or("sqlgate.toml");

    let config = match Config::from_file(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration from \"{config_path}\": {e:#}");
            std::process::exit(1);
        }
    };

    // Setup logging with reloading capabilities so the level can be
    // changed at runtime through the admin surface.
    let initial_log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());
    let (filter, reload_handle) = reload::Layer::new(EnvFilter::new(initial_log_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .compact() // Single-line format.
                .with_ansi(true),
        )
        .init();

    let reload_handle = Arc::new(reload_handle);
    if let Err(e) = server::run(config, reload_handle).await {
        error!("Server runtime error: {e:#}");
        return Err(e);
    }
    Ok(())
}
