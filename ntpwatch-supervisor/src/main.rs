//! ntpwatch service entry point
//!
//! Usage: `ntpwatch [config.yaml]` (falls back to `NTPWATCH_CONFIG`, then `ntpwatch.yaml`).
//! Runs until Ctrl-C / SIGTERM or until the configuration disappears.

use anyhow::{Context, Result};
use ntpwatch::{Supervisor, SystemResolver, YamlConfigSource};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[cfg(unix)]
async fn terminate_signal() -> Result<()> {
    let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("Failed to install SIGTERM handler")?;
    term.recv().await;
    Ok(())
}

#[cfg(not(unix))]
async fn terminate_signal() -> Result<()> {
    std::future::pending::<()>().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Charger les variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ntpwatch=info")),
        )
        .init();

    let source = YamlConfigSource::from_env(std::env::args().nth(1));
    info!("ntpwatch starting with configuration {}", source.path().display());

    let supervisor = Supervisor::start(Arc::new(source), Arc::new(SystemResolver))
        .await
        .context("Failed to start supervisor")?;

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.context("Failed to listen for Ctrl-C")?;
            info!("interrupt received");
        }
        res = terminate_signal() => {
            res?;
            info!("SIGTERM received");
        }
        reason = supervisor.fatal() => {
            warn!("stopping on configuration error: {reason}");
        }
    }

    let report = supervisor.stop().await;
    info!("drained {} sampler(s), aborted {}", report.stopped, report.aborted);
    Ok(())
}
