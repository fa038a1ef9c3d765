//! Worker registry: membership, nonce slab assignment, liveness.
//!
//! Workers that time out are marked `Offline` but never forgotten; their
//! slab stays reserved so a returning worker resumes the exact nonce range
//! it had. Only explicit deregistration frees a slab.

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::config::WorkerSettings;
use crate::error::RegistryError;

/// Slab width exponent: each worker owns 2^24 consecutive nonces.
pub const NONCE_SLAB_BITS: u32 = 24;
/// Number of slabs in the 32-bit nonce space.
pub const NONCE_SLAB_COUNT: u32 = 1 << (32 - NONCE_SLAB_BITS);

/// Contiguous nonce sub-range `[lo, hi)`.
///
/// `hi` is exclusive; the top slab ends at 2^32, which does not fit in u32.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NonceRange {
    pub lo: u32,
    pub hi: u64,
}

impl NonceRange {
    fn from_slab(slab: u32) -> Self {
        let lo = slab << NONCE_SLAB_BITS;
        Self { lo, hi: lo as u64 + (1u64 << NONCE_SLAB_BITS) }
    }

    fn slab(&self) -> u32 {
        self.lo >> NONCE_SLAB_BITS
    }

    pub fn contains(&self, nonce: u32) -> bool {
        (nonce as u64) >= (self.lo as u64) && (nonce as u64) < self.hi
    }
}

/// Smallest-first slab allocator over the 32-bit nonce space.
struct NonceAllocator {
    free: BTreeSet<u32>,
    next_fresh: u32,
}

impl NonceAllocator {
    fn new() -> Self {
        Self { free: BTreeSet::new(), next_fresh: 0 }
    }

    fn allocate(&mut self) -> Result<NonceRange, RegistryError> {
        if let Some(slab) = self.free.pop_first() {
            return Ok(NonceRange::from_slab(slab));
        }
        if self.next_fresh >= NONCE_SLAB_COUNT {
            return Err(RegistryError::NonceSpaceExhausted);
        }
        let slab = self.next_fresh;
        self.next_fresh += 1;
        Ok(NonceRange::from_slab(slab))
    }

    fn release(&mut self, range: NonceRange) {
        self.free.insert(range.slab());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Registered,
    Mining,
    Idle,
    Offline,
}

impl WorkerStatus {
    pub fn is_online(&self) -> bool {
        matches!(self, WorkerStatus::Mining | WorkerStatus::Idle)
    }
}

#[derive(Debug, Clone)]
pub struct Worker {
    pub id: String,
    pub name: String,
    pub address: String,
    pub agent: Option<String>,
    pub status: WorkerStatus,
    pub range: NonceRange,
    /// Last reported hashrate, H/s.
    pub hashrate: f64,
    pub last_seen: Instant,
    /// Wall-clock counterpart of `last_seen`, for the stats feed.
    pub last_seen_ts: i64,
    pub submitted: u64,
    pub accepted: u64,
    pub rejected: u64,
}

/// Minimal per-worker copy for stats; taken under the read lock.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub id: String,
    pub name: String,
    pub agent: Option<String>,
    pub status: WorkerStatus,
    pub hashrate: f64,
    pub submitted: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub last_seen: i64,
}

struct Inner {
    workers: HashMap<String, Worker>,
    alloc: NonceAllocator,
    exhausted_warned: bool,
}

pub struct WorkerRegistry {
    inner: RwLock<Inner>,
    settings: WorkerSettings,
}

impl WorkerRegistry {
    pub fn new(settings: WorkerSettings) -> Self {
        Self {
            inner: RwLock::new(Inner {
                workers: HashMap::new(),
                alloc: NonceAllocator::new(),
                exhausted_warned: false,
            }),
            settings,
        }
    }

    /// Register a worker and assign its nonce slab.
    ///
    /// Re-registering an `Offline` id revives it with the range it already
    /// holds. An active id is refused.
    pub async fn register(
        &self,
        id: &str,
        name: &str,
        address: &str,
        agent: Option<String>,
    ) -> Result<NonceRange, RegistryError> {
        let mut inner = self.inner.write().await;

        if let Some(existing) = inner.workers.get_mut(id) {
            if existing.status != WorkerStatus::Offline {
                return Err(RegistryError::IdInUse(id.to_string()));
            }
            existing.status = WorkerStatus::Registered;
            existing.name = name.to_string();
            existing.address = address.to_string();
            existing.agent = agent;
            existing.last_seen = Instant::now();
            existing.last_seen_ts = Utc::now().timestamp();
            tracing::info!("worker {} re-registered (slab preserved)", id);
            return Ok(existing.range);
        }

        let range = match inner.alloc.allocate() {
            Ok(r) => r,
            Err(e) => {
                if !inner.exhausted_warned {
                    inner.exhausted_warned = true;
                    tracing::warn!(
                        "nonce space exhausted: all {} slabs assigned",
                        NONCE_SLAB_COUNT
                    );
                }
                return Err(e);
            }
        };

        inner.workers.insert(
            id.to_string(),
            Worker {
                id: id.to_string(),
                name: name.to_string(),
                address: address.to_string(),
                agent,
                status: WorkerStatus::Registered,
                range,
                hashrate: 0.0,
                last_seen: Instant::now(),
                last_seen_ts: Utc::now().timestamp(),
                submitted: 0,
                accepted: 0,
                rejected: 0,
            },
        );

        tracing::info!(
            "worker {} registered: nonces [{:#010x}, {:#011x})",
            id,
            range.lo,
            range.hi
        );
        Ok(range)
    }

    /// Record a heartbeat and drive the status machine.
    pub async fn heartbeat(&self, id: &str, hashrate: f64) -> Result<WorkerStatus, RegistryError> {
        let mut inner = self.inner.write().await;
        let min_hashrate = self.settings.min_hashrate;
        let worker = inner
            .workers
            .get_mut(id)
            .ok_or_else(|| RegistryError::UnknownWorker(id.to_string()))?;

        worker.hashrate = hashrate;
        worker.last_seen = Instant::now();
        worker.last_seen_ts = Utc::now().timestamp();

        worker.status = match worker.status {
            WorkerStatus::Registered | WorkerStatus::Offline => WorkerStatus::Mining,
            WorkerStatus::Mining if hashrate < min_hashrate => WorkerStatus::Idle,
            WorkerStatus::Idle if hashrate >= min_hashrate => WorkerStatus::Mining,
            other => other,
        };

        Ok(worker.status)
    }

    /// Remove a worker and free its slab.
    pub async fn deregister(&self, id: &str) -> Result<(), RegistryError> {
        let mut inner = self.inner.write().await;
        let worker = inner
            .workers
            .remove(id)
            .ok_or_else(|| RegistryError::UnknownWorker(id.to_string()))?;
        inner.alloc.release(worker.range);
        inner.exhausted_warned = false;
        tracing::info!("worker {} deregistered, slab {} freed", id, worker.range.slab());
        Ok(())
    }

    pub async fn range_of(&self, id: &str) -> Option<NonceRange> {
        self.inner.read().await.workers.get(id).map(|w| w.range)
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.inner.read().await.workers.contains_key(id)
    }

    pub async fn status_of(&self, id: &str) -> Option<WorkerStatus> {
        self.inner.read().await.workers.get(id).map(|w| w.status)
    }

    /// Account a classified submission. Accepted here means "queued for
    /// upstream"; a later upstream reject reclassifies it.
    pub async fn record_outcome(&self, id: &str, accepted: bool) {
        let mut inner = self.inner.write().await;
        if let Some(worker) = inner.workers.get_mut(id) {
            worker.submitted += 1;
            if accepted {
                worker.accepted += 1;
            } else {
                worker.rejected += 1;
            }
        }
    }

    /// An upstream reject arrived for a share already counted accepted.
    pub async fn reclassify_rejected(&self, id: &str) {
        let mut inner = self.inner.write().await;
        if let Some(worker) = inner.workers.get_mut(id) {
            worker.accepted = worker.accepted.saturating_sub(1);
            worker.rejected += 1;
        }
    }

    /// Demote workers whose last heartbeat is older than the timeout.
    /// Returns the demoted ids.
    pub async fn sweep(&self, now: Instant) -> Vec<String> {
        let timeout = self.settings.timeout;
        let mut demoted = Vec::new();
        let mut inner = self.inner.write().await;
        for worker in inner.workers.values_mut() {
            if worker.status == WorkerStatus::Offline {
                continue;
            }
            if now.saturating_duration_since(worker.last_seen) > timeout {
                worker.status = WorkerStatus::Offline;
                demoted.push(worker.id.clone());
            }
        }
        drop(inner);
        if !demoted.is_empty() {
            tracing::info!("🧹 liveness sweep: {} worker(s) marked offline", demoted.len());
        }
        demoted
    }

    /// Copy the fields stats needs; never holds the lock across I/O.
    pub async fn snapshot(&self) -> Vec<WorkerSnapshot> {
        let inner = self.inner.read().await;
        inner
            .workers
            .values()
            .map(|w| WorkerSnapshot {
                id: w.id.clone(),
                name: w.name.clone(),
                agent: w.agent.clone(),
                status: w.status,
                hashrate: w.hashrate,
                submitted: w.submitted,
                accepted: w.accepted,
                rejected: w.rejected,
                last_seen: w.last_seen_ts,
            })
            .collect()
    }

    /// Ids of workers eligible for job pushes (`Mining` or `Idle`).
    pub async fn online_ids(&self) -> Vec<String> {
        let inner = self.inner.read().await;
        inner
            .workers
            .values()
            .filter(|w| w.status.is_online())
            .map(|w| w.id.clone())
            .collect()
    }

    /// Shutdown path: free every slab.
    pub async fn release_all(&self) {
        let mut inner = self.inner.write().await;
        let ranges: Vec<NonceRange> = inner.workers.values().map(|w| w.range).collect();
        for range in ranges {
            inner.alloc.release(range);
        }
        inner.workers.clear();
    }
}
