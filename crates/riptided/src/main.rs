//! riptided — realtime run streaming daemon.
//!
//! Tails the change-feed table over logical replication, keeps the
//! materialized view warm, and serves filtered server-sent-event streams.

use std::sync::Arc;
use std::time::Duration;

use riptide_cdc::{ReplicationConfig, ReplicationDriver};
use riptide_core::{Checkpoint, SnapshotStore, StateEngine};
use riptided::{router, AdmissionCounter, AppState, Config};
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Pause between replication session restarts after a transport failure.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

/// How long shutdown waits for background tasks to drain.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    info!(?config, "starting riptided");

    let engine = Arc::new(StateEngine::new());
    let checkpoint = Arc::new(Checkpoint::new());
    let store = SnapshotStore::new(&config.snapshot_path);

    if riptided::snapshots::restore_at_startup(&store, &engine, &checkpoint).is_none() {
        info!("no snapshot, starting cold");
    }

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // Replication pump with restart backoff.
    let replication = {
        let driver = ReplicationDriver::new(
            ReplicationConfig {
                database_url: config.database_url.clone(),
                slot: config.replication_slot.clone(),
                publication: config.publication_name.clone(),
                table: config.replication_table.clone(),
            },
            engine.clone(),
            checkpoint.clone(),
        )?;
        let mut shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = driver.run() => match result {
                        Ok(()) => warn!("replication stream ended, reconnecting"),
                        Err(e) => error!(error = %e, "replication failed, reconnecting"),
                    },
                    _ = shutdown.recv() => {
                        info!("replication task stopping");
                        return;
                    }
                }
                tokio::select! {
                    _ = tokio::time::sleep(RECONNECT_BACKOFF) => {}
                    _ = shutdown.recv() => {
                        info!("replication task stopping");
                        return;
                    }
                }
            }
        })
    };

    let snapshots = tokio::spawn(riptided::snapshots::run_snapshot_worker(
        engine.clone(),
        checkpoint.clone(),
        store,
        shutdown_tx.subscribe(),
    ));

    let admission = AdmissionCounter::connect(config.redis_url.as_deref(), config.concurrency_limit).await;
    if admission.disabled() && config.redis_url.is_some() {
        warn!("admission counter configured but unavailable, running fail-open");
    }

    let state = AppState {
        engine,
        admission,
        checkpoint,
    };

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!(port = config.port, "listening");

    let mut shutdown_rx = shutdown_tx.subscribe();
    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("shutdown signal received");
        let _ = signal_tx.send(());
    });

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
        })
        .await?;

    // Give background tasks a bounded window to finish.
    let _ = shutdown_tx.send(());
    let drain = async {
        let _ = replication.await;
        let _ = snapshots.await;
    };
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, drain).await.is_err() {
        warn!(timeout = ?SHUTDOWN_TIMEOUT, "shutdown drain timed out, forcing exit");
    }

    info!("goodbye");
    Ok(())
}

/// Ctrl+C or SIGTERM.
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C"),
        _ = terminate => info!("received SIGTERM"),
    }
}
