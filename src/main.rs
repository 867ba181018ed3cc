//! OcBot - option-chain level watcher and paper trader
//!
//! Loads configuration, restores same-day state, then runs one evaluation
//! loop per symbol. Control commands are read line by line from stdin.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tokio_stream::{wrappers::LinesStream, StreamExt};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use ocbot::config::AppConfig;
use ocbot::control::Controller;
use ocbot::engine::Engine;
use ocbot::persistence::{CsvTabStore, MemoryTabStore, TabStore};
use ocbot::provider::{HttpSnapshotProvider, SnapshotProvider, StaticSnapshotProvider};

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

fn build_store(cfg: &AppConfig) -> Result<Arc<dyn TabStore>> {
    if cfg.persistence.csv_enabled {
        Ok(Arc::new(CsvTabStore::new(&cfg.persistence.data_dir)?))
    } else {
        warn!("🗄️ [STORE] CSV disabled, tabs are kept in memory only");
        Ok(Arc::new(MemoryTabStore::new()))
    }
}

fn build_provider(cfg: &AppConfig) -> Result<Arc<dyn SnapshotProvider>> {
    if !cfg.provider.base_url.trim().is_empty() {
        info!(url = %cfg.provider.base_url, "📡 [PROVIDER] HTTP snapshots");
        return Ok(Arc::new(HttpSnapshotProvider::from_config(&cfg.provider)?));
    }
    let path = Path::new(&cfg.provider.snapshot_file);
    if !path.exists() {
        bail!(
            "provider.base_url is empty and replay file {} does not exist",
            path.display()
        );
    }
    Ok(Arc::new(StaticSnapshotProvider::from_file(path)?))
}

async fn console_loop(controller: Arc<Controller>, mut shutdown: watch::Receiver<bool>) {
    let mut lines = LinesStream::new(BufReader::new(tokio::io::stdin()).lines());
    loop {
        tokio::select! {
            line = lines.next() => match line {
                Some(Ok(line)) if line.trim().is_empty() => continue,
                Some(Ok(line)) => {
                    let reply = controller.handle("console", &line, Utc::now()).await;
                    println!("{}\n", reply);
                }
                Some(Err(e)) => {
                    warn!(error = %e, "⌨️ [CONTROL] stdin read failed");
                    break;
                }
                None => break,
            },
            _ = shutdown.changed() => break,
        }
    }
}

/// Flip the shutdown flag once `signal` fires. If the handler cannot be
/// installed the sender is held forever: dropping it would wake every
/// receiver as if shutdown had been requested.
async fn forward_shutdown<F>(signal: F, shutdown_tx: watch::Sender<bool>)
where
    F: Future<Output = std::io::Result<()>>,
{
    match signal.await {
        Ok(()) => {
            info!("🛑 Shutdown requested");
            let _ = shutdown_tx.send(true);
        }
        Err(e) => {
            error!(error = %e, "Failed to listen for ctrl-c, running until killed");
            std::future::pending::<()>().await;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = AppConfig::load().context("Failed to load configuration")?;
    init_tracing(cfg.bot.log_json);
    info!(config = %cfg, "🚀 OcBot {} starting", cfg.bot.tag);

    let state_dir = PathBuf::from(&cfg.persistence.data_dir);
    std::fs::create_dir_all(&state_dir)
        .with_context(|| format!("Failed to create {}", state_dir.display()))?;

    let store = build_store(&cfg)?;
    let provider = build_provider(&cfg)?;
    let admins = cfg.control.admin_ids.clone();

    let engine = Arc::new(Engine::new(cfg, store, provider, Some(state_dir))?);
    engine.restore(Utc::now()).await?;
    let controller = Arc::new(Controller::new(Arc::clone(&engine), admins));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(forward_shutdown(tokio::signal::ctrl_c(), shutdown_tx));

    let (run, _) = futures_util::join!(
        Arc::clone(&engine).run(shutdown_rx.clone()),
        console_loop(controller, shutdown_rx),
    );
    run
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn signal_sets_shutdown_flag() {
        let (tx, mut rx) = watch::channel(false);
        tokio::spawn(forward_shutdown(async { Ok(()) }, tx));

        tokio::time::timeout(Duration::from_secs(1), rx.changed())
            .await
            .unwrap()
            .unwrap();
        assert!(*rx.borrow());
    }

    #[tokio::test]
    async fn failed_signal_handler_keeps_running() {
        let (tx, mut rx) = watch::channel(false);
        tokio::spawn(forward_shutdown(
            async { Err(std::io::Error::new(std::io::ErrorKind::Other, "no handler")) },
            tx,
        ));

        let waited = tokio::time::timeout(Duration::from_millis(100), rx.changed()).await;
        assert!(waited.is_err(), "shutdown fired without a signal");
        assert!(!*rx.borrow());
    }
}
