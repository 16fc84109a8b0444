//! Supervisor module
//!
//! Owns the application lifecycle: builds the shared context, restores
//! persisted Q-learning state, starts the server / health prober /
//! persistence tasks, waits for SIGINT or SIGTERM, and runs the
//! graceful drain before the final state persist.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::{debug, error, info, warn};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout};

use crate::config::Config;
use crate::constants::{GRACEFUL_SHUTDOWN_TIMEOUT_SECS, Q_PERSIST_INTERVAL_SECS};
use crate::health::HealthProber;
use crate::policy::Policy;
use crate::server;
use crate::state::AppContext;
use crate::tls;

/// Run the proxy until a termination signal arrives.
pub async fn run(config: Config, config_path: PathBuf) -> Result<()> {
    let (shutdown_tx, _) = broadcast::channel(16);
    let ctx = Arc::new(AppContext::new(config, config_path, shutdown_tx)?);

    let runtime = ctx.runtime();
    info!("Configuration loaded: {}", runtime.config_path.display());
    info!("  - Listen port: {}", runtime.config.port);
    info!("  - Algorithm: {}", ctx.algorithm());
    info!("  - Backends: {}", ctx.policy().backends().len());

    restore_q_state(&ctx);

    // TLS identity problems and bind failures are startup-fatal.
    let tls_acceptor = if runtime.config.ssl.enabled {
        let cert = runtime
            .config
            .ssl
            .cert_file
            .as_ref()
            .context("ssl.cert_file missing")?;
        let key = runtime
            .config
            .ssl
            .key_file
            .as_ref()
            .context("ssl.key_file missing")?;
        Some(tls::acceptor(cert, key)?)
    } else {
        None
    };

    let listener = server::bind(runtime.config.port).await?;

    let server_ctx = Arc::clone(&ctx);
    let server_shutdown = ctx.subscribe_shutdown();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server::serve(server_ctx, listener, tls_acceptor, server_shutdown).await {
            error!("Proxy server error: {}", e);
        }
    });

    let health_ctx = Arc::clone(&ctx);
    let health_shutdown = ctx.subscribe_shutdown();
    let health_handle = tokio::spawn(async move {
        if let Err(e) = HealthProber::new(health_ctx).run(health_shutdown).await {
            error!("Health prober error: {}", e);
        }
    });

    let persist_ctx = Arc::clone(&ctx);
    let persist_shutdown = ctx.subscribe_shutdown();
    let persist_handle = tokio::spawn(async move {
        persistence_loop(persist_ctx, persist_shutdown).await;
    });

    info!("All service tasks started");

    let mut sigterm = signal(SignalKind::terminate())
        .context("Failed to register SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt())
        .context("Failed to register SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => info!("SIGTERM received - starting graceful shutdown"),
        _ = sigint.recv() => info!("SIGINT received - starting graceful shutdown"),
    }

    graceful_shutdown(ctx, vec![server_handle, health_handle, persist_handle]).await
}

/// Load persisted Q-learning state at startup. A missing or unreadable
/// file means starting fresh, never a startup failure.
fn restore_q_state(ctx: &AppContext) {
    let policy = ctx.policy();
    if let Some(q) = policy.as_q_learning() {
        let path = ctx.runtime().config.q_learning.state_path.clone();
        match q.load(&path) {
            Ok(()) => info!("Q-table loaded from {}", path.display()),
            Err(e) => info!("Could not load Q-table (starting fresh): {:#}", e),
        }
    }
}

/// Periodic background persist of the Q-table. Re-resolves the policy
/// each tick so it keeps working across reloads that switch algorithms.
async fn persistence_loop(ctx: Arc<AppContext>, mut shutdown: broadcast::Receiver<()>) {
    let mut ticker = interval(Duration::from_secs(Q_PERSIST_INTERVAL_SECS));
    // Consume the immediate tick; the first persist happens one full
    // interval after startup.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => persist_q_state(&ctx),
            _ = shutdown.recv() => break,
        }
    }
}

fn persist_q_state(ctx: &AppContext) {
    let policy = ctx.policy();
    if let Some(q) = policy.as_q_learning() {
        let path = ctx.runtime().config.q_learning.state_path.clone();
        match q.persist(&path) {
            Ok(()) => info!("Q-table persisted to {}", path.display()),
            Err(e) => warn!("Failed to persist Q-table: {:#}", e),
        }
    }
}

/// Stop accepting, wait for in-flight requests within the drain window,
/// then write the final Q-state. A drain that overruns the window is a
/// forced shutdown and surfaces as an error so the process exits
/// non-zero.
async fn graceful_shutdown(ctx: Arc<AppContext>, handles: Vec<JoinHandle<()>>) -> Result<()> {
    info!("Sending shutdown signal to all services");
    ctx.trigger_shutdown();

    let drained = timeout(Duration::from_secs(GRACEFUL_SHUTDOWN_TIMEOUT_SECS), async {
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Task termination error: {}", e);
            }
        }

        while ctx.inflight() > 0 {
            debug!("{} in-flight requests remaining...", ctx.inflight());
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await;

    // The final persist happens on both outcomes; what was learned is
    // kept even when the drain is cut short.
    persist_q_state(&ctx);

    if drained.is_err() {
        warn!(
            "Graceful shutdown timeout ({} seconds). Forcing exit.",
            GRACEFUL_SHUTDOWN_TIMEOUT_SECS
        );
        bail!(
            "forced shutdown: in-flight requests did not drain within {} seconds",
            GRACEFUL_SHUTDOWN_TIMEOUT_SECS
        );
    }

    info!("All in-flight requests completed");
    info!("{} shutdown complete", crate::constants::APP_NAME);
    Ok(())
}
