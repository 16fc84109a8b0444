//! Classic routing policies
//!
//! Round-robin, weighted round-robin, least-connections, ip-hash, and
//! least-response-time. All of them walk pool snapshots and skip
//! non-routable backends; none of them mutate backend counters during
//! selection.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use crate::backend_pool::{Backend, ServerPool};
use crate::policy::{CompletionError, Policy};

/// Walk `len` positions starting at `start`, returning the first
/// routable backend produced by `at`.
fn first_routable(
    len: usize,
    start: u64,
    at: impl Fn(usize) -> Option<Arc<Backend>>,
) -> Option<Arc<Backend>> {
    for i in 0..len {
        let idx = ((start + i as u64) % len as u64) as usize;
        if let Some(backend) = at(idx) {
            if backend.is_routable() {
                return Some(backend);
            }
        }
    }
    None
}

/// Sequential rotation over the pool using the shared cursor.
///
/// The cursor is a starting position, not a selection: dead backends are
/// skipped by walking forward without advancing it again.
pub struct RoundRobin {
    pool: Arc<ServerPool>,
}

impl RoundRobin {
    pub fn new(pool: Arc<ServerPool>) -> Self {
        Self { pool }
    }
}

impl Policy for RoundRobin {
    fn next_backend(&self, _client: SocketAddr) -> Option<Arc<Backend>> {
        let backends = self.pool.snapshot();
        if backends.is_empty() {
            return None;
        }
        let start = self.pool.next_cursor();
        first_routable(backends.len(), start, |i| Some(Arc::clone(&backends[i])))
    }

    fn on_request_completion(&self, _key: &str, _duration: Duration, _error: Option<CompletionError>) {}

    fn update_backend_status(&self, key: &str, alive: bool) {
        self.pool.set_alive_by_key(key, alive);
    }

    fn add_backend(&self, backend: Arc<Backend>) {
        self.pool.push(backend);
    }

    fn backends(&self) -> Vec<Arc<Backend>> {
        self.pool.snapshot()
    }
}

/// Round-robin over an index sequence with each backend repeated
/// `weight` times, giving proportional selection frequencies.
pub struct WeightedRoundRobin {
    pool: Arc<ServerPool>,
    indices: RwLock<Vec<usize>>,
}

impl WeightedRoundRobin {
    pub fn new(pool: Arc<ServerPool>) -> Self {
        let wrr = Self {
            pool,
            indices: RwLock::new(Vec::new()),
        };
        wrr.rebuild_indices();
        wrr
    }

    fn rebuild_indices(&self) {
        let backends = self.pool.snapshot();
        let mut indices = Vec::new();
        for (i, backend) in backends.iter().enumerate() {
            for _ in 0..backend.weight() {
                indices.push(i);
            }
        }
        *self.indices.write() = indices;
    }
}

impl Policy for WeightedRoundRobin {
    fn next_backend(&self, _client: SocketAddr) -> Option<Arc<Backend>> {
        let backends = self.pool.snapshot();
        let indices = self.indices.read().clone();
        if indices.is_empty() {
            return None;
        }
        let start = self.pool.next_cursor();
        first_routable(indices.len(), start, |i| {
            backends.get(indices[i]).cloned()
        })
    }

    fn on_request_completion(&self, _key: &str, _duration: Duration, _error: Option<CompletionError>) {}

    fn update_backend_status(&self, key: &str, alive: bool) {
        self.pool.set_alive_by_key(key, alive);
    }

    fn add_backend(&self, backend: Arc<Backend>) {
        self.pool.push(backend);
        self.rebuild_indices();
    }

    fn backends(&self) -> Vec<Arc<Backend>> {
        self.pool.snapshot()
    }
}

/// Chooses the routable backend with the fewest in-flight requests,
/// first-in-order on ties.
pub struct LeastConnections {
    pool: Arc<ServerPool>,
}

impl LeastConnections {
    pub fn new(pool: Arc<ServerPool>) -> Self {
        Self { pool }
    }
}

impl Policy for LeastConnections {
    fn next_backend(&self, _client: SocketAddr) -> Option<Arc<Backend>> {
        let mut best: Option<Arc<Backend>> = None;
        let mut min = i64::MAX;

        for backend in self.pool.snapshot() {
            if !backend.is_routable() {
                continue;
            }
            let conns = backend.active_connections();
            if best.is_none() || conns < min {
                min = conns;
                best = Some(backend);
            }
        }
        best
    }

    fn on_request_completion(&self, _key: &str, _duration: Duration, _error: Option<CompletionError>) {}

    fn update_backend_status(&self, key: &str, alive: bool) {
        self.pool.set_alive_by_key(key, alive);
    }

    fn add_backend(&self, backend: Arc<Backend>) {
        self.pool.push(backend);
    }

    fn backends(&self) -> Vec<Arc<Backend>> {
        self.pool.snapshot()
    }
}

/// Hashes the client host with CRC32-IEEE so a given client keeps
/// landing on the same backend while every candidate stays healthy.
pub struct IpHash {
    pool: Arc<ServerPool>,
}

impl IpHash {
    pub fn new(pool: Arc<ServerPool>) -> Self {
        Self { pool }
    }
}

impl Policy for IpHash {
    fn next_backend(&self, client: SocketAddr) -> Option<Arc<Backend>> {
        let backends = self.pool.snapshot();
        if backends.is_empty() {
            return None;
        }

        let host = client.ip().to_string();
        let checksum = crc32fast::hash(host.as_bytes());
        let start = (checksum as u64) % backends.len() as u64;

        first_routable(backends.len(), start, |i| Some(Arc::clone(&backends[i])))
    }

    fn on_request_completion(&self, _key: &str, _duration: Duration, _error: Option<CompletionError>) {}

    fn update_backend_status(&self, key: &str, alive: bool) {
        self.pool.set_alive_by_key(key, alive);
    }

    fn add_backend(&self, backend: Arc<Backend>) {
        self.pool.push(backend);
    }

    fn backends(&self) -> Vec<Arc<Backend>> {
        self.pool.snapshot()
    }
}

/// Tracks a smoothed completion-time estimate per backend and routes to
/// the smallest one.
///
/// The first sample is stored raw; later samples halve toward the new
/// value. A never-sampled backend reads as zero, which makes it look
/// fastest until its first completion lands.
pub struct LeastResponseTime {
    pool: Arc<ServerPool>,
    estimates_ns: RwLock<HashMap<String, u64>>,
}

impl LeastResponseTime {
    pub fn new(pool: Arc<ServerPool>) -> Self {
        Self {
            pool,
            estimates_ns: RwLock::new(HashMap::new()),
        }
    }

    #[cfg(test)]
    pub fn estimate_ns(&self, key: &str) -> u64 {
        self.estimates_ns.read().get(key).copied().unwrap_or(0)
    }
}

impl Policy for LeastResponseTime {
    fn next_backend(&self, _client: SocketAddr) -> Option<Arc<Backend>> {
        let estimates = self.estimates_ns.read();
        let mut best: Option<Arc<Backend>> = None;
        let mut min = u64::MAX;

        for backend in self.pool.snapshot() {
            if !backend.is_routable() {
                continue;
            }
            let estimate = estimates.get(backend.key()).copied().unwrap_or(0);
            if best.is_none() || estimate < min {
                min = estimate;
                best = Some(backend);
            }
        }
        best
    }

    fn on_request_completion(&self, key: &str, duration: Duration, _error: Option<CompletionError>) {
        let sample = duration.as_nanos() as u64;
        let mut estimates = self.estimates_ns.write();
        let entry = estimates.entry(key.to_string()).or_insert(0);
        *entry = if *entry == 0 {
            sample
        } else {
            (*entry + sample) / 2
        };
    }

    fn update_backend_status(&self, key: &str, alive: bool) {
        self.pool.set_alive_by_key(key, alive);
    }

    fn add_backend(&self, backend: Arc<Backend>) {
        self.pool.push(backend);
    }

    fn backends(&self) -> Vec<Arc<Backend>> {
        self.pool.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend_pool::testing::{backend, backend_weighted, pool};
    use crate::backend_pool::ConnectionGuard;

    fn client() -> SocketAddr {
        "10.0.0.1:50000".parse().unwrap()
    }

    #[test]
    fn round_robin_visits_each_backend_once_per_rotation() {
        let p = pool(&[9001, 9002, 9003]);
        let rr = RoundRobin::new(Arc::clone(&p));
        let keys: Vec<String> = p.snapshot().iter().map(|b| b.key().to_string()).collect();

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(rr.next_backend(client()).unwrap().key().to_string());
        }
        seen.sort();
        let mut expected = keys.clone();
        expected.sort();
        assert_eq!(seen, expected);

        // The next rotation repeats the same order.
        let first = rr.next_backend(client()).unwrap().key().to_string();
        let _ = rr.next_backend(client());
        let _ = rr.next_backend(client());
        let again = rr.next_backend(client()).unwrap().key().to_string();
        assert_eq!(first, again);
    }

    #[test]
    fn round_robin_alternates_between_two_backends() {
        let p = pool(&[9001, 9002]);
        let rr = RoundRobin::new(p);

        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..6 {
            let key = rr.next_backend(client()).unwrap().key().to_string();
            *counts.entry(key).or_insert(0) += 1;
        }
        assert_eq!(counts.len(), 2);
        assert!(counts.values().all(|&c| c == 3));
    }

    #[test]
    fn round_robin_skips_dead_backends() {
        let p = pool(&[9001, 9002]);
        p.snapshot()[0].set_alive(false);
        let rr = RoundRobin::new(Arc::clone(&p));
        let alive_key = p.snapshot()[1].key().to_string();

        for _ in 0..4 {
            assert_eq!(rr.next_backend(client()).unwrap().key(), alive_key);
        }
    }

    #[test]
    fn round_robin_returns_none_when_pool_is_down() {
        let p = pool(&[9001, 9002]);
        for b in p.snapshot() {
            b.set_alive(false);
        }
        let rr = RoundRobin::new(p);
        assert!(rr.next_backend(client()).is_none());
    }

    #[test]
    fn weighted_frequencies_follow_weights() {
        let p = Arc::new(ServerPool::new(vec![
            backend_weighted(9001, 2),
            backend_weighted(9002, 1),
        ]));
        let heavy = p.snapshot()[0].key().to_string();
        let wrr = WeightedRoundRobin::new(p);

        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..6 {
            let key = wrr.next_backend(client()).unwrap().key().to_string();
            *counts.entry(key).or_insert(0) += 1;
        }
        assert_eq!(counts[&heavy], 4);
    }

    #[test]
    fn weighted_add_backend_rebuilds_indices() {
        let p = Arc::new(ServerPool::new(vec![backend_weighted(9001, 1)]));
        let wrr = WeightedRoundRobin::new(Arc::clone(&p));

        wrr.add_backend(backend_weighted(9002, 3));
        let added = p.snapshot()[1].key().to_string();

        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..8 {
            let key = wrr.next_backend(client()).unwrap().key().to_string();
            *counts.entry(key).or_insert(0) += 1;
        }
        assert_eq!(counts[&added], 6);
    }

    #[test]
    fn least_connections_prefers_idle_backend() {
        let p = pool(&[9001, 9002, 9003]);
        let lc = LeastConnections::new(Arc::clone(&p));
        let backends = p.snapshot();

        let _g1 = ConnectionGuard::new(Arc::clone(&backends[0]));
        let _g2 = ConnectionGuard::new(Arc::clone(&backends[0]));
        let _g3 = ConnectionGuard::new(Arc::clone(&backends[1]));

        assert_eq!(lc.next_backend(client()).unwrap().key(), backends[2].key());
    }

    #[test]
    fn least_connections_breaks_ties_in_pool_order() {
        let p = pool(&[9001, 9002]);
        let lc = LeastConnections::new(Arc::clone(&p));
        assert_eq!(
            lc.next_backend(client()).unwrap().key(),
            p.snapshot()[0].key()
        );
    }

    #[test]
    fn ip_hash_is_deterministic_per_client() {
        let p = pool(&[9001, 9002, 9003]);
        let iph = IpHash::new(p);

        let first = iph.next_backend(client()).unwrap().key().to_string();
        for _ in 0..10 {
            assert_eq!(iph.next_backend(client()).unwrap().key(), first);
        }

        // The source port must not influence placement.
        let same_ip: SocketAddr = "10.0.0.1:60123".parse().unwrap();
        assert_eq!(iph.next_backend(same_ip).unwrap().key(), first);
    }

    #[test]
    fn ip_hash_fails_over_deterministically() {
        let p = pool(&[9001, 9002, 9003]);
        let iph = IpHash::new(Arc::clone(&p));

        let first = iph.next_backend(client()).unwrap();
        first.set_alive(false);

        let second = iph.next_backend(client()).unwrap();
        assert_ne!(second.key(), first.key());
        for _ in 0..10 {
            assert_eq!(iph.next_backend(client()).unwrap().key(), second.key());
        }
    }

    #[test]
    fn least_response_time_halves_toward_new_samples() {
        let p = pool(&[9001]);
        let key = p.snapshot()[0].key().to_string();
        let lrt = LeastResponseTime::new(p);

        lrt.on_request_completion(&key, Duration::from_millis(100), None);
        assert_eq!(lrt.estimate_ns(&key), 100_000_000);

        lrt.on_request_completion(&key, Duration::from_millis(50), None);
        assert_eq!(lrt.estimate_ns(&key), 75_000_000);
    }

    #[test]
    fn least_response_time_prefers_unsampled_backend() {
        let p = pool(&[9001, 9002]);
        let sampled = p.snapshot()[0].key().to_string();
        let fresh = p.snapshot()[1].key().to_string();
        let lrt = LeastResponseTime::new(p);

        lrt.on_request_completion(&sampled, Duration::from_millis(1), None);
        assert_eq!(lrt.next_backend(client()).unwrap().key(), fresh);
    }

    #[test]
    fn least_response_time_picks_fastest_sampled() {
        let p = pool(&[9001, 9002]);
        let slow = p.snapshot()[0].key().to_string();
        let fast = p.snapshot()[1].key().to_string();
        let lrt = LeastResponseTime::new(p);

        lrt.on_request_completion(&slow, Duration::from_millis(200), None);
        lrt.on_request_completion(&fast, Duration::from_millis(20), None);
        assert_eq!(lrt.next_backend(client()).unwrap().key(), fast);
    }

    #[test]
    fn update_backend_status_reaches_the_pool() {
        let p = pool(&[9001]);
        let rr = RoundRobin::new(Arc::clone(&p));
        let key = p.snapshot()[0].key().to_string();

        rr.update_backend_status(&key, false);
        assert!(!p.snapshot()[0].alive_flag());
        assert!(rr.next_backend(client()).is_none());
    }

    #[test]
    fn add_backend_appends_in_order() {
        let p = pool(&[9001]);
        let rr = RoundRobin::new(Arc::clone(&p));
        rr.add_backend(backend(9002));

        let backends = rr.backends();
        assert_eq!(backends.len(), 2);
        assert!(backends[1].key().contains("9002"));
    }
}
