//! Health check module
//!
//! Periodically probes every backend of the active policy with a plain
//! TCP connect and forces its liveness flag accordingly. A recovered
//! probe is one of the two ways a tripped backend comes back (the other
//! is the breaker cooldown trial).

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use log::{debug, error, info, warn};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::time::{interval, timeout};

use crate::constants::HEALTH_PROBE_TIMEOUT_SECS;
use crate::policy::Policy;
use crate::state::AppContext;

/// Health prober
///
/// Re-reads the probe interval and the policy handle every sweep so a
/// reload takes effect without restarting the loop.
pub struct HealthProber {
    ctx: Arc<AppContext>,
}

impl HealthProber {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self { ctx }
    }

    /// Run the probe loop until shutdown.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let mut period = self.ctx.runtime().config.health_check_interval;
        let mut ticker = interval(period);
        info!("Health prober started: {:?} interval", period);

        // First tick fires immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep().await;

                    let current = self.ctx.runtime().config.health_check_interval;
                    if current != period {
                        info!("Health probe interval changed to {:?}", current);
                        period = current;
                        ticker = interval(period);
                        ticker.tick().await;
                    }
                }
                _ = shutdown.recv() => {
                    info!("Health prober received shutdown signal");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Probe every backend of the current policy in parallel.
    async fn sweep(&self) {
        let policy = self.ctx.policy();
        let mut probes = Vec::new();

        for backend in policy.backends() {
            let policy = Arc::clone(&policy);
            probes.push(tokio::spawn(async move {
                let Some(addr) = backend.probe_addr() else {
                    warn!("Backend {} has no probeable address", backend.key());
                    return;
                };

                let alive = probe(&addr).await;
                let was_alive = backend.alive_flag();
                policy.update_backend_status(backend.key(), alive);

                if alive != was_alive {
                    if alive {
                        info!("Backend {} recovered [UP]", backend.key());
                    } else {
                        warn!("Backend {} failed probe [DOWN]", backend.key());
                    }
                } else {
                    debug!(
                        "Backend {} [{}]",
                        backend.key(),
                        if alive { "UP" } else { "DOWN" }
                    );
                }
            }));
        }

        for task in probes {
            if let Err(e) = task.await {
                error!("Health probe task error: {}", e);
            }
        }
    }
}

/// TCP connect within the probe timeout.
async fn probe(addr: &str) -> bool {
    matches!(
        timeout(
            Duration::from_secs(HEALTH_PROBE_TIMEOUT_SECS),
            TcpStream::connect(addr),
        )
        .await,
        Ok(Ok(_))
    )
}
