use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};

use warden_host::engine::EngineVersionStager;
use warden_host::interop::{InteropDispatcher, InteropSession};
use warden_host::logbuf::LogSink;
use warden_host::metrics::SharedSample;
use warden_host::notify::TracingNotifier;
use warden_host::reattach::JsonFileStore;
use warden_host::staging::StagingSwapper;
use warden_host::supervisor::{Watchdog, WatchdogConfig};

fn env_port(name: &str, default: u16) -> u16 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_flag(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => matches!(v.as_str(), "1" | "true" | "yes"),
        Err(_) => default,
    }
}

async fn wait_for_shutdown() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context("install SIGTERM handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let data_root = PathBuf::from(
        std::env::var("WARDEN_DATA_ROOT").unwrap_or_else(|_| "/var/lib/warden".to_string()),
    );
    let game_port = env_port("WARDEN_GAME_PORT", 6000);
    let interop_port = env_port("WARDEN_INTEROP_PORT", 6001);
    let reattach_enabled = env_flag("WARDEN_REATTACH", true);

    let staging = Arc::new(StagingSwapper::new(data_root.join("game")));
    staging
        .ensure_layout()
        .context("prepare build slot layout")?;
    let engine = Arc::new(EngineVersionStager::new(data_root.join("engine")));
    engine
        .ensure_layout()
        .context("prepare engine version layout")?;
    let store = Arc::new(JsonFileStore::new(data_root.join("reattach.json")));
    let notifier = Arc::new(TracingNotifier::default());

    let (session_tx, session_rx) = watch::channel(InteropSession::default());
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    let listener = TcpListener::bind(("127.0.0.1", interop_port))
        .await
        .with_context(|| format!("bind interop callback port {interop_port}"))?;
    tracing::info!(port = interop_port, "interop callback listener ready");
    let dispatcher = Arc::new(InteropDispatcher::new(
        session_rx,
        events_tx,
        notifier.clone(),
    ));
    tokio::spawn(dispatcher.serve(listener));

    let watchdog = Watchdog::spawn(
        WatchdogConfig {
            game_port,
            interop_port,
            reattach_enabled,
        },
        staging,
        engine,
        store,
        notifier,
        session_tx,
        events_rx,
        LogSink::default(),
        SharedSample::default(),
    );
    tracing::info!(%game_port, data_root = %data_root.display(), "warden host running");

    wait_for_shutdown().await?;
    if reattach_enabled {
        tracing::info!("service shutdown, detaching from server");
        if let Err(e) = watchdog.detach().await {
            tracing::warn!(error = %e, "detach failed, stopping server instead");
            watchdog.shutdown().await;
        }
    } else {
        tracing::info!("service shutdown, stopping server");
        watchdog.shutdown().await;
    }
    watchdog.join().await;
    Ok(())
}
