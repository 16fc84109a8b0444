//! Backend pool management module
//!
//! Holds the runtime state of each upstream server: its URL, weight,
//! liveness flag, active-connection counter, and circuit breaker. A
//! backend is routable only while the liveness flag is set and its
//! breaker admits traffic. The pool keeps backends in configuration
//! order and owns the shared cursor used by the round-robin walks.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use log::warn;
use parking_lot::RwLock;
use url::Url;

use crate::circuit_breaker::CircuitBreaker;
use crate::config::{BackendEntry, CircuitBreakerConfig};

/// Runtime state of one upstream server.
///
/// The URL is immutable for the backend's lifetime; everything else is
/// shared mutable state with lock-free access on the request path.
#[derive(Debug)]
pub struct Backend {
    url: Url,
    /// Canonical URL string. Doubles as the session-cookie value and the
    /// Q-table key, so it must be stable for the backend's lifetime.
    key: String,
    weight: u32,
    alive: AtomicBool,
    active_connections: AtomicI64,
    breaker: CircuitBreaker,
}

impl Backend {
    pub fn new(url: Url, weight: i64, breaker: CircuitBreaker) -> Self {
        let key = url.to_string();
        Self {
            url,
            key,
            weight: weight.max(1) as u32,
            // Considered alive until a probe or a failure says otherwise
            alive: AtomicBool::new(true),
            active_connections: AtomicI64::new(0),
            breaker,
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    #[inline]
    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::Relaxed);
    }

    /// The raw liveness flag, before breaker fusion.
    #[inline]
    pub fn alive_flag(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    /// Eligibility for selection: alive and the breaker admits traffic.
    #[inline]
    pub fn is_routable(&self) -> bool {
        self.alive_flag() && self.breaker.allow()
    }

    #[inline]
    pub fn active_connections(&self) -> i64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    #[inline]
    fn increment_connections(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn decrement_connections(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// `host:port` for the TCP health probe, with scheme-default ports
    /// filled in.
    pub fn probe_addr(&self) -> Option<String> {
        let host = self.url.host_str()?;
        let port = self.url.port_or_known_default()?;
        Some(format!("{}:{}", host, port))
    }
}

/// Active connection counter RAII guard
///
/// Increments when a request is assigned to a backend, automatically
/// decrements when the request finishes (on Drop), covering every exit
/// path including panics in the forward call.
pub struct ConnectionGuard {
    backend: Arc<Backend>,
}

impl ConnectionGuard {
    pub fn new(backend: Arc<Backend>) -> Self {
        backend.increment_connections();
        Self { backend }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.backend.decrement_connections();
    }
}

/// Ordered collection of backends plus the shared round-robin cursor.
///
/// Ordering is stable and matches the configuration order. Policies hold
/// the pool behind an `Arc` and read snapshots of the backend list.
#[derive(Debug)]
pub struct ServerPool {
    backends: RwLock<Vec<Arc<Backend>>>,
    cursor: AtomicU64,
}

impl ServerPool {
    pub fn new(backends: Vec<Arc<Backend>>) -> Self {
        Self {
            backends: RwLock::new(backends),
            cursor: AtomicU64::new(0),
        }
    }

    /// Build a pool from configuration entries. Malformed URLs are
    /// dropped with a log line; validation normally catches them first.
    pub fn from_entries(entries: &[BackendEntry], breaker: &CircuitBreakerConfig) -> Self {
        let backends = entries
            .iter()
            .filter_map(|entry| match Url::parse(&entry.url) {
                Ok(url) => Some(Arc::new(Backend::new(
                    url,
                    entry.weight,
                    CircuitBreaker::new(breaker.threshold, breaker.timeout),
                ))),
                Err(e) => {
                    warn!("Dropping backend with invalid URL {}: {}", entry.url, e);
                    None
                }
            })
            .collect();

        Self::new(backends)
    }

    /// Snapshot of the backend list in configuration order.
    pub fn snapshot(&self) -> Vec<Arc<Backend>> {
        self.backends.read().clone()
    }

    pub fn len(&self) -> usize {
        self.backends.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.read().is_empty()
    }

    pub fn push(&self, backend: Arc<Backend>) {
        self.backends.write().push(backend);
    }

    /// Find a backend by its canonical URL string.
    pub fn find(&self, key: &str) -> Option<Arc<Backend>> {
        self.backends
            .read()
            .iter()
            .find(|b| b.key() == key)
            .cloned()
    }

    /// Force a backend's liveness flag, keyed by URL string.
    pub fn set_alive_by_key(&self, key: &str, alive: bool) {
        if let Some(backend) = self.find(key) {
            backend.set_alive(alive);
        }
    }

    /// Advance the shared cursor and return its previous value.
    pub fn next_cursor(&self) -> u64 {
        self.cursor.fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::time::Duration;

    /// Backend on 127.0.0.1 with the default breaker, for policy tests.
    pub fn backend(port: u16) -> Arc<Backend> {
        backend_weighted(port, 1)
    }

    pub fn backend_weighted(port: u16, weight: i64) -> Arc<Backend> {
        let url = Url::parse(&format!("http://127.0.0.1:{}", port)).unwrap();
        Arc::new(Backend::new(
            url,
            weight,
            CircuitBreaker::new(3, Duration::from_secs(10)),
        ))
    }

    pub fn pool(ports: &[u16]) -> Arc<ServerPool> {
        Arc::new(ServerPool::new(ports.iter().map(|p| backend(*p)).collect()))
    }
}
