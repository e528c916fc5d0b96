//! Daemon mode: message router plus certificate monitor.
//!
//! The transport speaks newline-delimited JSON over stdin/stdout; the
//! cloud connector process owns the socket and pipes messages through
//! here. The certificate monitor and filesystem observer run on their
//! own tasks until a shutdown signal arrives.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
use tokio::sync::watch;

use mefedge_certmgr::{CertMonitor, CertObserver, DEFAULT_CHECK_INTERVAL_SECS};
use mefedge_common::paths::PathLayout;
use mefedge_lifecycle::modelfiles::ModelFileManager;
use mefedge_lifecycle::netconfig::NetConfigManager;
use mefedge_router::handlers::register_all;
use mefedge_router::{Dispatcher, HandlerCtx, Message, OpLog};

use crate::commands::{cert_engine, open_keystore, open_registry, NET_KEY_DOMAIN};

pub async fn run(layout: PathLayout) -> anyhow::Result<()> {
    let keys = open_keystore(&layout)?;
    let engine = Arc::new(cert_engine(&layout, keys.clone()));
    let registry = Arc::new(open_registry(&layout)?);
    let net_config = Arc::new(NetConfigManager::new(
        registry.clone(),
        engine.clone(),
        keys.clone(),
        NET_KEY_DOMAIN,
    ));
    let models = Arc::new(ModelFileManager::new(&layout));
    let ctx = Arc::new(HandlerCtx::new(
        engine.clone(),
        registry,
        net_config,
        models,
        layout.clone(),
    ));

    let oplog = Arc::new(OpLog::new());
    let mut dispatcher = Dispatcher::new(oplog);
    register_all(&mut dispatcher, ctx);
    let dispatcher = Arc::new(dispatcher);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let monitor = Arc::new(CertMonitor::new(
        engine.clone(),
        keys.clone(),
        crate::commands::CERT_KEY_DOMAIN,
    ));
    let monitor_task = tokio::spawn(Arc::clone(&monitor).run(
        Duration::from_secs(DEFAULT_CHECK_INTERVAL_SECS),
        shutdown_rx,
    ));

    let observer = Arc::new(CertObserver::new());
    {
        let engine = engine.clone();
        observer.register("monitor-recheck", move |_event| engine.signal_recheck());
    }
    let cert_root = layout
        .config_dir(crate::commands::OWNER_COMPONENT)
        .join("certs");
    std::fs::create_dir_all(&cert_root)?;
    // Watcher stops when dropped; hold it for the daemon's lifetime.
    let _watcher = observer.watch(&cert_root).context("watch cert tree")?;

    tracing::info!("daemon ready");
    serve_stdio(&dispatcher).await?;

    let _ = shutdown_tx.send(true);
    let _ = monitor_task.await;
    keys.finalize();
    tracing::info!("daemon stopped");
    Ok(())
}

/// Pump messages until stdin closes or a termination signal arrives.
async fn serve_stdio(dispatcher: &Dispatcher) -> anyhow::Result<()> {
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => line.context("read transport")?,
        };
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        let msg: Message = match serde_json::from_str(&line) {
            Ok(msg) => msg,
            Err(err) => {
                tracing::warn!(error = %err, "dropping malformed message");
                continue;
            }
        };
        if let Some(reply) = dispatcher.dispatch(msg).await {
            let mut payload = serde_json::to_vec(&reply)?;
            payload.push(b'\n');
            stdout.write_all(&payload).await?;
            stdout.flush().await?;
        }
    }
    Ok(())
}
