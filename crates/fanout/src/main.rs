//! # fanout
//!
//! Fanout binary: runs the broadcast server, or connects to a server's
//! ingest endpoint and publishes values.

#![deny(unsafe_code)]

mod logging;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fanout_server::{EventSource, FanoutServer, PublisherClient};
use fanout_settings::FanoutSettings;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Value-change fan-out over WebSocket.
#[derive(Parser, Debug)]
#[command(name = "fanout", about = "Value-change fan-out over WebSocket")]
struct Cli {
    /// Settings file (defaults to `~/.fanout/settings.json`).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Log filter (overrides settings; `RUST_LOG` still wins).
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Emit JSON log lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Accept subscribers and broadcast every value to them.
    Serve {
        /// Host to bind.
        #[arg(long)]
        host: Option<String>,

        /// Port to bind (0 for auto-assign).
        #[arg(long)]
        port: Option<u16>,

        /// Publish each line read from stdin.
        #[arg(long)]
        stdin: bool,
    },

    /// Connect to an ingest endpoint and publish values.
    Emit {
        /// Ingest URL (overrides `client.url`).
        #[arg(long)]
        url: Option<String>,

        /// Values to publish. Reads lines from stdin when empty.
        values: Vec<String>,
    },
}

impl Cli {
    /// Load settings and fold the CLI overrides in.
    fn resolve_settings(&self) -> Result<FanoutSettings> {
        let path = self
            .settings
            .clone()
            .unwrap_or_else(fanout_settings::settings_path);
        let mut settings = fanout_settings::load_settings_from_path(&path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?;

        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
        if self.json_logs {
            settings.logging.json = true;
        }
        match &self.command {
            Command::Serve { host, port, .. } => {
                if let Some(host) = host {
                    settings.server.host.clone_from(host);
                }
                if let Some(port) = port {
                    settings.server.port = *port;
                }
            }
            Command::Emit { url, .. } => {
                if let Some(url) = url {
                    settings.client.url.clone_from(url);
                }
            }
        }
        Ok(settings)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = cli.resolve_settings()?;
    logging::init(&settings.logging.level, settings.logging.json)
        .context("Failed to initialize logging")?;

    match cli.command {
        Command::Serve { stdin, .. } => serve(settings, stdin).await,
        Command::Emit { values, .. } => emit(&settings, values).await,
    }
}

async fn serve(settings: FanoutSettings, from_stdin: bool) -> Result<()> {
    let metrics = match fanout_server::metrics::install_recorder() {
        Ok(handle) => handle,
        Err(e) => {
            tracing::warn!(error = %e, "metrics recorder unavailable, /metrics will be empty");
            fanout_server::metrics::detached_handle()
        }
    };

    let server = FanoutServer::new(settings.server, metrics);
    let (addr, handle) = server.listen().await.context("Failed to bind server")?;
    tracing::info!(
        "fanout listening on ws://{addr}{}",
        server.settings().endpoint_path
    );

    if from_stdin {
        let source = server.source().clone();
        let _stdin_task = tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                source.emit(line);
            }
            tracing::debug!("stdin closed");
        });
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    if !server.stop().await {
        tracing::warn!("shutdown timed out with connections still open");
    }
    let _ = handle.await;

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn emit(settings: &FanoutSettings, values: Vec<String>) -> Result<()> {
    let url = &settings.client.url;
    let client = PublisherClient::connect(url, settings.client.connect_timeout())
        .await
        .with_context(|| format!("Failed to connect to {url}"))?;

    let mut sent: u64 = 0;
    if values.is_empty() {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
            client.emit(line);
            sent += 1;
        }
    } else {
        for value in values {
            client.emit(value);
            sent += 1;
        }
    }

    client.close().await.context("Publisher connection lost")?;
    tracing::info!(sent, "values published");
    Ok(())
}
