//! Q-learning routing policy
//!
//! Learns a per-backend value estimate from live completions and routes
//! ε-greedily against it: with probability ε a uniformly random routable
//! backend, otherwise the routable backend with the highest Q-value.
//! Rewards derive from completion latency (errors are punished flat),
//! the Bellman update discounts against a cached running maximum, and ε
//! decays toward a floor as the table stabilizes.
//!
//! The table and visit counts live in concurrent maps so selections can
//! read while completions write; the scalar aggregates (ε, α, γ, maxima)
//! sit behind one read/write lock.

use std::collections::HashMap;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dashmap::DashMap;
use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::backend_pool::{Backend, ServerPool};
use crate::config::QLearningConfig;
use crate::constants::EPSILON_FLOOR;
use crate::policy::{CompletionError, Policy};

/// Flat penalty for transport failures and upstream 5xx responses.
const ERROR_REWARD: f64 = -50.0;

/// Scalar learning state. `cached_max_q` is the running maximum used by
/// the Bellman update; `max_q` is the all-time maximum that gates ε
/// decay and is persisted.
#[derive(Debug, Clone, Copy)]
struct Scalars {
    epsilon: f64,
    alpha: f64,
    gamma: f64,
    max_q: f64,
    last_delta: f64,
    cached_max_q: f64,
}

/// On-disk and reload-transfer form of the learned state.
///
/// α is deliberately absent: it always comes from configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QStateDocument {
    pub q_table: HashMap<String, f64>,
    pub counts: HashMap<String, i64>,
    pub epsilon: f64,
    pub gamma: f64,
    pub max_q_value: f64,
    pub last_q_delta: f64,
}

pub struct QLearning {
    pool: Arc<ServerPool>,
    q_table: DashMap<String, f64>,
    counts: DashMap<String, i64>,
    scalars: RwLock<Scalars>,
}

impl QLearning {
    pub fn new(pool: Arc<ServerPool>, config: &QLearningConfig) -> Self {
        Self {
            pool,
            q_table: DashMap::new(),
            counts: DashMap::new(),
            scalars: RwLock::new(Scalars {
                epsilon: config.epsilon,
                alpha: config.alpha,
                gamma: config.gamma,
                max_q: 0.0,
                last_delta: 0.0,
                cached_max_q: 0.0,
            }),
        }
    }

    /// An unseen backend reads as neutral.
    fn q_value(&self, key: &str) -> f64 {
        self.q_table.get(key).map(|v| *v).unwrap_or(0.0)
    }

    fn reward(duration: Duration, error: Option<CompletionError>) -> f64 {
        if error.is_some() {
            return ERROR_REWARD;
        }
        // Sub-microsecond completions would blow the latency term up;
        // clamp the input instead of the output alone.
        let seconds = duration.as_secs_f64().max(0.0001);
        let latency_ms = seconds * 1000.0;
        (100.0 - latency_ms / 10.0).clamp(ERROR_REWARD, 100.0)
    }

    /// Shrink ε once the table has seen a positive maximum. A large
    /// recent |ΔQ| relative to that maximum means learning is still in
    /// flux, so the decay factor stays close to 1.
    fn decay_epsilon(scalars: &mut Scalars) {
        if scalars.epsilon <= EPSILON_FLOOR || scalars.max_q <= 0.0 {
            return;
        }
        let factor = 1.0 - scalars.last_delta / scalars.max_q;
        if factor > 0.0 && factor < 1.0 {
            scalars.epsilon *= factor;
        } else {
            scalars.epsilon *= 0.99;
        }
        if scalars.epsilon < EPSILON_FLOOR {
            scalars.epsilon = EPSILON_FLOOR;
        }
    }

    pub fn epsilon(&self) -> f64 {
        self.scalars.read().epsilon
    }

    #[cfg(test)]
    pub fn q_of(&self, key: &str) -> f64 {
        self.q_value(key)
    }

    #[cfg(test)]
    pub fn count_of(&self, key: &str) -> i64 {
        self.counts.get(key).map(|v| *v).unwrap_or(0)
    }

    /// Snapshot the full learned state, e.g. ahead of a policy swap.
    pub fn export_state(&self) -> QStateDocument {
        let scalars = self.scalars.read();
        QStateDocument {
            q_table: self
                .q_table
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
            counts: self
                .counts
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
            epsilon: scalars.epsilon,
            gamma: scalars.gamma,
            max_q_value: scalars.max_q,
            last_q_delta: scalars.last_delta,
        }
    }

    /// Overwrite tables and scalars with a snapshot. α is kept from
    /// this policy's configuration, and the cached maximum is rebuilt
    /// from the imported table.
    pub fn import_state(&self, document: QStateDocument) {
        let mut scalars = self.scalars.write();

        for (key, value) in document.q_table {
            if value > scalars.cached_max_q {
                scalars.cached_max_q = value;
            }
            self.q_table.insert(key, value);
        }
        for (key, value) in document.counts {
            self.counts.insert(key, value);
        }

        scalars.epsilon = document.epsilon;
        scalars.gamma = document.gamma;
        scalars.max_q = document.max_q_value;
        scalars.last_delta = document.last_q_delta;
    }

    /// Write the learned state as pretty-printed JSON.
    pub fn persist(&self, path: &Path) -> Result<()> {
        let document = self.export_state();
        let json = serde_json::to_string_pretty(&document)
            .context("failed to encode Q-learning state")?;
        fs::write(path, json)
            .with_context(|| format!("failed to write Q-learning state to {}", path.display()))?;
        Ok(())
    }

    /// Read state written by [`persist`]. The caller decides whether a
    /// missing file matters; on any error the in-memory state is left
    /// untouched.
    pub fn load(&self, path: &Path) -> Result<()> {
        let json = fs::read_to_string(path)
            .with_context(|| format!("failed to read Q-learning state from {}", path.display()))?;
        let document: QStateDocument =
            serde_json::from_str(&json).context("failed to decode Q-learning state")?;
        self.import_state(document);
        Ok(())
    }
}

impl Policy for QLearning {
    fn next_backend(&self, _client: SocketAddr) -> Option<Arc<Backend>> {
        let backends = self.pool.snapshot();
        if backends.is_empty() {
            return None;
        }

        let routable: Vec<Arc<Backend>> = backends
            .into_iter()
            .filter(|b| b.is_routable())
            .collect();
        if routable.is_empty() {
            return None;
        }

        let epsilon = self.scalars.read().epsilon;
        let mut rng = rand::thread_rng();
        if rng.gen::<f64>() < epsilon {
            let idx = rng.gen_range(0..routable.len());
            return Some(Arc::clone(&routable[idx]));
        }

        // Exploit: highest Q wins, first-in-order on ties.
        let mut best = Arc::clone(&routable[0]);
        let mut best_q = self.q_value(best.key());
        for backend in routable.iter().skip(1) {
            let q = self.q_value(backend.key());
            if q > best_q {
                best_q = q;
                best = Arc::clone(backend);
            }
        }
        Some(best)
    }

    fn on_request_completion(&self, key: &str, duration: Duration, error: Option<CompletionError>) {
        let mut scalars = self.scalars.write();

        let reward = Self::reward(duration, error);
        let old_q = self.q_value(key);
        let new_q = (1.0 - scalars.alpha) * old_q
            + scalars.alpha * (reward + scalars.gamma * scalars.cached_max_q);

        self.q_table.insert(key.to_string(), new_q);
        scalars.last_delta = (new_q - old_q).abs();
        if new_q > scalars.max_q {
            scalars.max_q = new_q;
        }
        if new_q > scalars.cached_max_q {
            scalars.cached_max_q = new_q;
        }

        *self.counts.entry(key.to_string()).or_insert(0) += 1;

        Self::decay_epsilon(&mut scalars);
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

    fn as_q_learning(&self) -> Option<&QLearning> {
        Some(self)
    }
}
