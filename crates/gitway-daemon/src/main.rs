//! Gitway daemon - git smart protocol server.
//!
//! This is the main entry point for running a `git://` daemon.

use anyhow::Context;
use clap::Parser;
use gitway_daemon::logging::{init_logging, LogFormat};
use gitway_daemon::{Daemon, DaemonConfig, Overrides};
use gitway_git::Dispatcher;
use gitway_storage::{BasicPackCodec, MemoryStore};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

/// Gitway daemon - serves repositories over git://
#[derive(Parser, Debug)]
#[command(name = "gitway-daemon")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (YAML or TOML)
    #[arg(short, long, env = "GITWAY_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Log format (pretty, json)
    #[arg(long)]
    log_format: Option<String>,

    /// Repository to create at start-up; repeatable
    #[arg(long = "repo")]
    repositories: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let overrides = Overrides {
        listen: args.listen,
        log_level: args.log_level,
        log_format: args.log_format.as_deref().map(LogFormat::parse),
        repositories: args.repositories,
    };
    let config = DaemonConfig::load(args.config.as_deref(), overrides)
        .context("failed to load configuration")?;

    init_logging(&config.log_level, config.log_format);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting Gitway daemon");

    let store = Arc::new(MemoryStore::new());
    for path in &config.repositories {
        store
            .create_with_algorithm(path, config.hash_algorithm)
            .with_context(|| format!("failed to create repository {}", path))?;
        tracing::info!(repo = %path, algorithm = %config.hash_algorithm, "Repository ready");
    }

    let dispatcher = Dispatcher::new(store, Arc::new(BasicPackCodec), config.session.clone());
    let daemon = Daemon::new(dispatcher, &config);
    let shutdown = daemon.shutdown_token();

    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested");
            shutdown.cancel();
        }
    });

    daemon.run(listener).await?;
    Ok(())
}
