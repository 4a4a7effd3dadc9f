use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use pharvest::core::config::Config;
use pharvest::crawler::Crawler;
use pharvest::harvester::Harvester;
use pharvest::storage::Storage;
use pharvest::validator::Validator;

const PROXY_DB_PATH: &str = "proxy.db";

/// Window granted to in-flight validations after a shutdown signal.
const DRAIN_WINDOW: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(
    name = "pharvest",
    version,
    about = "Harvest proxy endpoints from configured web sources and continuously validate them"
)]
struct Cli {
    /// Path to the configuration file (YAML or JSON, detected by extension)
    #[arg(short = 'c', long = "cfg", default_value = "config.yml")]
    cfg: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();
    let cfg = Config::load(&cli.cfg)?;

    let cancel = CancellationToken::new();
    let storage = Arc::new(Storage::open(PROXY_DB_PATH)?);
    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .connect_timeout(Duration::from_secs(10))
        .build()?;
    let crawler = Crawler::new(http_client, Arc::clone(&storage));
    let validator = Arc::new(Validator::new(
        cfg.validator_config.clone(),
        Arc::clone(&storage),
        cancel.clone(),
    ));
    let harvester = Harvester::new(cfg, crawler, validator, storage);

    info!("Starting harvest");
    let mut harvest = tokio::spawn(async move { harvester.harvest().await });

    tokio::select! {
        finished = &mut harvest => finished?,
        _ = shutdown_signal() => {
            info!("shutdown signal received, draining in-flight validations");
            cancel.cancel();
            match tokio::time::timeout(DRAIN_WINDOW, &mut harvest).await {
                Ok(finished) => finished?,
                Err(_) => {
                    warn!("drain window elapsed, aborting remaining work");
                    harvest.abort();
                    Ok(())
                }
            }
        }
    }
}

/// Resolves on SIGHUP, SIGINT, SIGTERM or SIGQUIT. All four mean full stop;
/// there is no runtime configuration reload.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sighup = signal(SignalKind::hangup()).ok();
        let mut sigterm = signal(SignalKind::terminate()).ok();
        let mut sigquit = signal(SignalKind::quit()).ok();

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = recv_or_pending(&mut sighup) => {},
            _ = recv_or_pending(&mut sigterm) => {},
            _ = recv_or_pending(&mut sigquit) => {},
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(unix)]
async fn recv_or_pending(sig: &mut Option<tokio::signal::unix::Signal>) {
    match sig {
        Some(sig) => {
            sig.recv().await;
        }
        None => futures::future::pending::<()>().await,
    }
}
