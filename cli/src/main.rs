//! `cls` - language server entry point.
//!
//! ```text
//! main() -> load config -> init_tracing() -> serve(transport)
//!                                              |
//!                                              v
//!                          Connection::run(LanguageService) until exit/EOF
//! ```
//!
//! stdout carries the protocol, so logs go to `~/.cls/logs/cls.log` (or
//! stderr with `--log-stderr`) and never to stdout. The exit status follows
//! LSP: success only if `shutdown` was received before the stream ended.

mod config;

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Mutex;
use std::sync::atomic::Ordering;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use cls_rpc::{Connection, StdioTransport, Transport};
use cls_service::LanguageService;

use crate::config::{ClsConfig, ConfigError};

#[derive(Debug, Parser)]
#[command(name = "cls", version)]
#[command(about = "C/C++ language server speaking JSON-RPC over stdio")]
struct Cli {
    /// Read configuration from this file instead of ~/.cls/config.toml
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Serve a single editor connection on this TCP address instead of stdio
    #[arg(long, value_name = "ADDR")]
    listen: Option<String>,

    /// Write logs to stderr instead of the log file
    #[arg(long)]
    log_stderr: bool,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let (config, config_error) = match load_config(cli.config.as_deref()) {
        Ok(config) => (config.unwrap_or_default(), None),
        Err(err) => (ClsConfig::default(), Some(err)),
    };
    init_tracing(&config.log.level, cli.log_stderr);
    if let Some(err) = config_error {
        tracing::warn!(path = %err.path().display(), error = %err, "using default configuration");
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start the async runtime")?;
    let result = runtime.block_on(run(cli.listen.as_deref(), &config));
    // A stdin read may still be parked on a blocking thread.
    runtime.shutdown_background();

    match result {
        Ok(true) => Ok(ExitCode::SUCCESS),
        Ok(false) => Ok(ExitCode::FAILURE),
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "language server failed");
            Err(err)
        }
    }
}

fn load_config(explicit: Option<&Path>) -> Result<Option<ClsConfig>, ConfigError> {
    match explicit {
        Some(path) => ClsConfig::load_from(path).map(Some),
        None => ClsConfig::load(),
    }
}

async fn run(listen: Option<&str>, config: &ClsConfig) -> Result<bool> {
    match listen {
        Some(addr) => {
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind {addr}"))?;
            tracing::info!(addr = %listener.local_addr()?, "waiting for an editor");
            let (stream, peer) = listener.accept().await.context("accept failed")?;
            tracing::info!(%peer, "editor connected");
            serve(stream, &peer.to_string(), config).await
        }
        None => serve(StdioTransport, "stdio", config).await,
    }
}

/// Runs one session; `Ok(true)` if the editor shut the server down cleanly.
async fn serve<T: Transport>(transport: T, name: &str, config: &ClsConfig) -> Result<bool> {
    let connection = Connection::new(transport, config.rpc.connection_config(name));
    let service = LanguageService::new(connection.client(), config.service.clone());
    let shutdown = service.shutdown_flag();

    connection.run(service).await.context("connection failed")?;

    let clean = shutdown.load(Ordering::SeqCst);
    tracing::info!(clean, "language server stopped");
    Ok(clean)
}

fn init_tracing(level: &str, log_stderr: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if log_stderr {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(std::io::stderr),
            )
            .with(env_filter)
            .init();
        return;
    }

    let (log_file, init_warnings) = open_log_file();

    if let Some((log_path, file)) = log_file {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
            .with(env_filter)
            .init();

        tracing::info!(path = %log_path.display(), "Logging initialized");
        for warning in init_warnings {
            tracing::warn!("{warning}");
        }
        return;
    }

    // Without a log file, stay silent rather than write next to the protocol.
    tracing_subscriber::registry().with(env_filter).init();
}

fn open_log_file() -> (Option<(PathBuf, fs::File)>, Vec<String>) {
    let mut warnings = Vec::new();

    for candidate in log_file_candidates() {
        if let Some(parent) = candidate.parent()
            && let Err(e) = fs::create_dir_all(parent)
        {
            warnings.push(format!(
                "Failed to create log dir {}: {e}",
                parent.display()
            ));
            continue;
        }

        match OpenOptions::new()
            .create(true)
            .append(true)
            .open(&candidate)
        {
            Ok(file) => return (Some((candidate, file)), warnings),
            Err(e) => {
                warnings.push(format!(
                    "Failed to open log file {}: {e}",
                    candidate.display()
                ));
            }
        }
    }

    (None, warnings)
}

fn log_file_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();

    // ~/.cls/logs/cls.log
    if let Some(config_path) = ClsConfig::path()
        && let Some(config_dir) = config_path.parent()
    {
        candidates.push(config_dir.join("logs").join("cls.log"));
    }

    // ./.cls/logs/cls.log
    candidates.push(PathBuf::from(".cls").join("logs").join("cls.log"));

    candidates
}
