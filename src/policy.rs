//! Routing policy seam
//!
//! Every routing strategy implements [`Policy`]: pick a backend for a
//! request, receive completion feedback, and expose the pool for the
//! prober and the sticky-session scan. The request pipeline only ever
//! talks to the trait object, which is what lets `/reload` swap the
//! strategy atomically underneath live traffic.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::algorithms::{IpHash, LeastConnections, LeastResponseTime, RoundRobin, WeightedRoundRobin};
use crate::backend_pool::{Backend, ServerPool};
use crate::config::{Algorithm, Config};
use crate::q_learning::QLearning;

/// Why a forwarded request counts as failed.
///
/// Present iff the response was a transport failure or carried a
/// status of 500 or above.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionError {
    /// The upstream connection failed outright (mapped to 502).
    Transport,
    /// The upstream answered with the given ≥500 status.
    UpstreamStatus(u16),
}

/// Routing strategy contract shared by all six policies.
pub trait Policy: Send + Sync {
    /// Select a routable backend, or `None` when no backend is routable.
    /// Must not mutate per-backend counters.
    fn next_backend(&self, client: SocketAddr) -> Option<Arc<Backend>>;

    /// Completion feedback for a forwarded request, keyed by the
    /// backend's URL string.
    fn on_request_completion(&self, backend_key: &str, duration: Duration, error: Option<CompletionError>);

    /// Externally force a backend's liveness flag (health prober).
    fn update_backend_status(&self, backend_key: &str, alive: bool);

    /// Append a backend to the underlying pool.
    fn add_backend(&self, backend: Arc<Backend>);

    /// Current backend list, in pool order.
    fn backends(&self) -> Vec<Arc<Backend>>;

    /// Downcast hook for Q-state transfer across reloads.
    fn as_q_learning(&self) -> Option<&QLearning> {
        None
    }
}

/// Build the configured policy over a fresh pool.
pub fn build_policy(config: &Config, algorithm: Algorithm) -> Arc<dyn Policy> {
    let pool = Arc::new(ServerPool::from_entries(
        &config.backends,
        &config.circuit_breaker,
    ));

    match algorithm {
        Algorithm::RoundRobin => Arc::new(RoundRobin::new(pool)),
        Algorithm::WeightedRoundRobin => Arc::new(WeightedRoundRobin::new(pool)),
        Algorithm::LeastConnections => Arc::new(LeastConnections::new(pool)),
        Algorithm::LeastResponseTime => Arc::new(LeastResponseTime::new(pool)),
        Algorithm::IpHash => Arc::new(IpHash::new(pool)),
        Algorithm::QLearning => Arc::new(QLearning::new(pool, &config.q_learning)),
    }
}
