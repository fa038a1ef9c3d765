//! Time-bounded duplicate-share detection.
//!
//! Keyed by `"{job_id}:{nonce}:{worker_id}"`; entries age out after the
//! configured TTL via a periodic pruning pass.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

pub struct DedupStore {
    entries: RwLock<HashMap<String, Instant>>,
    ttl: Duration,
}

impl DedupStore {
    pub fn new(ttl: Duration) -> Self {
        Self { entries: RwLock::new(HashMap::new()), ttl }
    }

    pub fn key(worker_id: &str, job_id: &str, nonce: &str) -> String {
        format!("{}:{}:{}", job_id, nonce, worker_id)
    }

    /// Returns `true` when the key is fresh (and records it); `false` when
    /// it was already seen within the TTL.
    pub async fn check_and_insert(&self, key: String) -> bool {
        self.check_and_insert_at(key, Instant::now()).await
    }

    async fn check_and_insert_at(&self, key: String, now: Instant) -> bool {
        let mut entries = self.entries.write().await;
        match entries.get(&key) {
            Some(seen) if now.saturating_duration_since(*seen) < self.ttl => false,
            _ => {
                entries.insert(key, now);
                true
            }
        }
    }

    /// Drop entries older than the TTL. Called from a periodic task.
    pub async fn prune(&self) {
        self.prune_at(Instant::now()).await;
    }

    async fn prune_at(&self, now: Instant) {
        let ttl = self.ttl;
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, seen| now.saturating_duration_since(*seen) < ttl);
        let pruned = before - entries.len();
        if pruned > 0 {
            tracing::debug!("dedup store pruned {} entries ({} remain)", pruned, entries.len());
        }
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}
