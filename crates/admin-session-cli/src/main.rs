//! admin-session - session gate for the food-ordering admin dashboard.
//!
//! Stores the bearer token issued at login, refuses to use it once its
//! `exp` claim has passed, and can watch the session to log out the moment
//! it expires.

mod commands;
mod config;

use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use admin_session_core::{storage, SessionGuard};
use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use commands::Commands;
use config::{Config, API_URL_ENV};

#[derive(Parser, Debug)]
#[command(name = "admin-session")]
#[command(about = "Session gate for the food-ordering admin dashboard")]
#[command(version)]
struct Cli {
    /// Config file to use instead of the default location
    #[arg(short = 'c', long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Initialize the tracing subscriber for logging
fn init_tracing() {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    init_tracing();
    info!("admin-session starting");

    let config = match cli.config {
        Some(ref path) => Config::load_from(path)?
            .with_api_url_override(std::env::var(API_URL_ENV).ok()),
        None => Config::load()?,
    };
    let data_dir = config.data_dir()?;
    debug!(?config, ?data_dir, "Config loaded");

    let storage = storage::open(config.storage, &data_dir)
        .context("Failed to open credential storage")?;
    let guard = SessionGuard::new(storage)
        .with_expiry_margin(Duration::from_millis(config.expiry_margin_ms));

    cli.command.execute(Arc::new(guard), &config).await
}
