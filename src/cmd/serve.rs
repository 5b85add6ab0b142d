//! Long-running processes — `relay serve` and `relay worker`.

use std::sync::Arc;

use anyhow::{Context, Result};
use relay::config::RelayConfig;
use relay::coordinator::spawn_sweeper;
use relay::server::{AppState, serve};
use relay::worker::{CallbackClient, CompletionSink, WorkerPool};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::{build_coordinator, build_registry, open_store, process_owner};

/// Callback server plus barrier sweeper, and the worker pool unless
/// `with_workers` is false.
pub async fn cmd_serve(config: &RelayConfig, with_workers: bool) -> Result<()> {
    let secret = config.secret();
    if secret.is_none() {
        tracing::warn!(
            env = %config.server.secret_env,
            "No internal secret configured; internal endpoints will refuse every request"
        );
    }

    let store = open_store(config)?;
    let coordinator = build_coordinator(config, store.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut tasks: Vec<JoinHandle<()>> = vec![spawn_sweeper(
        coordinator.clone(),
        config.sweep_interval(),
        shutdown_rx.clone(),
    )];
    if with_workers {
        let sink: Arc<dyn CompletionSink> = coordinator.clone();
        let pool = Arc::new(WorkerPool::new(
            store,
            build_registry(config, &coordinator),
            Some(sink),
            config.pool_config(process_owner()),
        ));
        tasks.extend(pool.spawn(shutdown_rx.clone()));
    }

    let bind = config.bind();
    let listener = TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;
    println!(
        "relay listening on http://{}",
        listener.local_addr().context("Failed to get server address")?
    );

    tokio::spawn(forward_ctrl_c(shutdown_tx));
    let state = Arc::new(AppState::new(coordinator, secret.as_deref()));
    let mut server_shutdown = shutdown_rx.clone();
    serve(listener, state, async move {
        let _ = server_shutdown.wait_for(|stop| *stop).await;
    })
    .await?;

    join_all(tasks).await;
    println!("relay shut down gracefully.");
    Ok(())
}

/// Worker pool only. Completions go to `worker.callback_url` when set,
/// otherwise straight to the store.
pub async fn cmd_worker(config: &RelayConfig) -> Result<()> {
    let store = open_store(config)?;
    let coordinator = build_coordinator(config, store.clone());
    let sink: Arc<dyn CompletionSink> = match &config.worker.callback_url {
        Some(url) => {
            let secret = config.secret().with_context(|| {
                format!(
                    "{} must be set to report to {}",
                    config.server.secret_env, url
                )
            })?;
            Arc::new(CallbackClient::new(url, secret, config.callback_timeout())?)
        }
        None => coordinator.clone(),
    };

    let pool = Arc::new(WorkerPool::new(
        store,
        build_registry(config, &coordinator),
        Some(sink),
        config.pool_config(process_owner()),
    ));
    println!(
        "relay worker {} running {} slot(s)",
        pool.config().worker_id,
        pool.config().concurrency.max(1)
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let tasks = pool.spawn(shutdown_rx);
    forward_ctrl_c(shutdown_tx).await;
    join_all(tasks).await;
    println!("relay worker stopped.");
    Ok(())
}

async fn forward_ctrl_c(shutdown: watch::Sender<bool>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl+C; running until killed");
        std::future::pending::<()>().await;
    }
    println!("\nShutting down...");
    let _ = shutdown.send(true);
}

async fn join_all(tasks: Vec<JoinHandle<()>>) {
    for result in futures::future::join_all(tasks).await {
        if let Err(e) = result {
            tracing::error!(error = %e, "Background task panicked");
        }
    }
}
