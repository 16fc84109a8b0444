//! Application state management module
//!
//! Bundles the process-wide pieces into one `AppContext` threaded through
//! the request pipeline and the background tasks: the hot-swappable
//! policy handle, the runtime configuration, the ingress rate limiter,
//! the metrics registry, the shared upstream client, the in-flight
//! request counter used by the drain, and the shutdown channel.
//!
//! Uses arc-swap so the pipeline copies the policy reference without
//! holding any lock across the proxy call.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use hyper::body::Incoming;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tokio::sync::broadcast;

use crate::config::{Algorithm, Config};
use crate::constants::{
    UPSTREAM_IDLE_PER_HOST, UPSTREAM_IDLE_TIMEOUT_SECS, UPSTREAM_KEEPALIVE_SECS,
};
use crate::error::ConfigError;
use crate::metrics::MetricsRegistry;
use crate::policy::{self, Policy};
use crate::rate_limiter::RateLimiter;

/// Pooled upstream transport shared by every request.
pub type UpstreamClient = Client<HttpConnector, Incoming>;

/// Sized wrapper so the trait object can live inside an `ArcSwap`.
pub struct ActivePolicy(pub Arc<dyn Policy>);

/// Configuration as applied, plus where it came from. Replaced as a
/// whole on reload.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub config: Config,
    pub config_path: PathBuf,
}

/// Application global state
pub struct AppContext {
    policy: ArcSwap<ActivePolicy>,
    runtime: ArcSwap<RuntimeConfig>,
    rate_limiter: Option<RateLimiter>,
    metrics: MetricsRegistry,
    upstream: UpstreamClient,
    inflight: AtomicUsize,
    shutdown: broadcast::Sender<()>,
}

impl AppContext {
    pub fn new(
        config: Config,
        config_path: PathBuf,
        shutdown: broadcast::Sender<()>,
    ) -> Result<Self, ConfigError> {
        let algorithm = config.algorithm()?;
        let active = policy::build_policy(&config, algorithm);

        let rate_limiter = config
            .rate_limiter
            .enabled
            .then(|| RateLimiter::new(config.rate_limiter.limit, config.rate_limiter.burst));

        Ok(Self {
            policy: ArcSwap::new(Arc::new(ActivePolicy(active))),
            runtime: ArcSwap::new(Arc::new(RuntimeConfig {
                config,
                config_path,
            })),
            rate_limiter,
            metrics: MetricsRegistry::new(),
            upstream: build_upstream_client(),
            inflight: AtomicUsize::new(0),
            shutdown,
        })
    }

    /// Copy of the active policy handle. Lock-free; callers keep the
    /// clone for the whole request so a concurrent reload cannot pull
    /// the policy out from under them.
    pub fn policy(&self) -> Arc<dyn Policy> {
        Arc::clone(&self.policy.load().0)
    }

    pub fn swap_policy(&self, policy: Arc<dyn Policy>) {
        self.policy.store(Arc::new(ActivePolicy(policy)));
    }

    pub fn runtime(&self) -> Arc<RuntimeConfig> {
        self.runtime.load_full()
    }

    pub fn swap_runtime(&self, runtime: RuntimeConfig) {
        self.runtime.store(Arc::new(runtime));
    }

    pub fn algorithm(&self) -> Algorithm {
        // The stored config was validated; round-robin is an unreachable
        // fallback rather than a silent default for bad input.
        self.runtime()
            .config
            .algorithm()
            .unwrap_or(Algorithm::RoundRobin)
    }

    pub fn rate_limiter(&self) -> Option<&RateLimiter> {
        self.rate_limiter.as_ref()
    }

    pub fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }

    pub fn upstream(&self) -> &UpstreamClient {
        &self.upstream
    }

    /// Track a request for the shutdown drain.
    pub fn begin_request(&self) {
        self.inflight.fetch_add(1, Ordering::Relaxed);
    }

    pub fn end_request(&self) {
        self.inflight.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::Relaxed)
    }

    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown.send(());
    }
}

/// Build the pooled HTTP client used for every upstream call:
/// keep-alives on, a bounded idle pool per host, and a 90 second idle
/// expiry.
fn build_upstream_client() -> UpstreamClient {
    let mut connector = HttpConnector::new();
    connector.set_keepalive(Some(Duration::from_secs(UPSTREAM_KEEPALIVE_SECS)));
    connector.set_nodelay(true);

    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(Duration::from_secs(UPSTREAM_IDLE_TIMEOUT_SECS))
        .pool_max_idle_per_host(UPSTREAM_IDLE_PER_HOST)
        .build(connector)
}
