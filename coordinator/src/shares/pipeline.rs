//! Share pipeline: classify every submission into exactly one outcome and
//! forward the accepted ones upstream.
//!
//! Ingress checks run in a fixed order (worker, job, range, duplicate,
//! difficulty) so rejection reasons are deterministic. Accepted shares enter
//! a bounded queue; overflow is backpressure, never unbounded memory.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::timeout;

use crate::config::ShareSettings;
use crate::hashing::{meets_target, HashEngine};
use crate::jobs::JobRegistry;
use crate::upstream::UpstreamClient;
use crate::workers::WorkerRegistry;

/// Candidate proof submitted by a worker. Ephemeral: once classified it
/// survives only in counters.
#[derive(Debug, Clone)]
pub struct Share {
    pub worker_id: String,
    pub job_id: String,
    /// 8 hex chars (32-bit).
    pub nonce: String,
    /// Result hash, hex.
    pub result: String,
    pub submitted_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ShareOutcome {
    Accepted,
    UnknownWorker,
    Stale,
    OutOfRange,
    Duplicate,
    LowDifficulty,
    Backpressure,
}

impl ShareOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShareOutcome::Accepted => "accepted",
            ShareOutcome::UnknownWorker => "rejected/unknown-worker",
            ShareOutcome::Stale => "rejected/stale",
            ShareOutcome::OutOfRange => "rejected/out-of-range",
            ShareOutcome::Duplicate => "rejected/duplicate",
            ShareOutcome::LowDifficulty => "rejected/low-difficulty",
            ShareOutcome::Backpressure => "rejected/backpressure",
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, ShareOutcome::Accepted)
    }
}

/// Cluster-wide share counters for the stats feed.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ShareCounters {
    pub valid: u64,
    pub invalid: u64,
    pub forwarded: u64,
    pub blocks_found: u64,
}

pub struct SharePipeline {
    workers: Arc<WorkerRegistry>,
    jobs: Arc<JobRegistry>,
    dedup: super::DedupStore,
    forward_tx: mpsc::Sender<Share>,
    forward_rx: Mutex<Option<mpsc::Receiver<Share>>>,
    queue_depth: AtomicUsize,
    valid: AtomicU64,
    invalid: AtomicU64,
    forwarded: AtomicU64,
    blocks_found: AtomicU64,
    validate_hashes: bool,
    engine: Box<dyn HashEngine>,
}

impl SharePipeline {
    pub fn new(
        workers: Arc<WorkerRegistry>,
        jobs: Arc<JobRegistry>,
        settings: &ShareSettings,
        engine: Box<dyn HashEngine>,
    ) -> Arc<Self> {
        let (forward_tx, forward_rx) = mpsc::channel(settings.forward_queue.max(1));
        Arc::new(Self {
            workers,
            jobs,
            dedup: super::DedupStore::new(settings.dedup_ttl),
            forward_tx,
            forward_rx: Mutex::new(Some(forward_rx)),
            queue_depth: AtomicUsize::new(0),
            valid: AtomicU64::new(0),
            invalid: AtomicU64::new(0),
            forwarded: AtomicU64::new(0),
            blocks_found: AtomicU64::new(0),
            validate_hashes: settings.validate_hashes,
            engine,
        })
    }

    /// Classify a submission. Every call lands on exactly one outcome and
    /// keeps `submitted == accepted + rejected` for the worker.
    pub async fn submit(&self, share: Share) -> ShareOutcome {
        let Some(range) = self.workers.range_of(&share.worker_id).await else {
            return ShareOutcome::UnknownWorker;
        };

        let job = match self.jobs.lookup(&share.job_id).await {
            Ok(job) => job,
            Err(_) => {
                return self.reject(&share.worker_id, ShareOutcome::Stale).await;
            }
        };

        let nonce = match u32::from_str_radix(&share.nonce, 16) {
            Ok(n) if range.contains(n) => n,
            _ => {
                return self.reject(&share.worker_id, ShareOutcome::OutOfRange).await;
            }
        };

        let key = super::DedupStore::key(&share.worker_id, &share.job_id, &share.nonce);
        if !self.dedup.check_and_insert(key).await {
            return self.reject(&share.worker_id, ShareOutcome::Duplicate).await;
        }

        if self.validate_hashes && !self.result_meets_target(&job.blob, nonce, &job.target) {
            return self.reject(&share.worker_id, ShareOutcome::LowDifficulty).await;
        }

        match self.forward_tx.try_send(share.clone()) {
            Ok(()) => {
                self.queue_depth.fetch_add(1, Ordering::SeqCst);
                self.workers.record_outcome(&share.worker_id, true).await;
                self.valid.fetch_add(1, Ordering::Relaxed);
                ShareOutcome::Accepted
            }
            Err(_) => self.reject(&share.worker_id, ShareOutcome::Backpressure).await,
        }
    }

    async fn reject(&self, worker_id: &str, outcome: ShareOutcome) -> ShareOutcome {
        self.workers.record_outcome(worker_id, false).await;
        self.invalid.fetch_add(1, Ordering::Relaxed);
        outcome
    }

    fn result_meets_target(&self, blob_hex: &str, nonce: u32, target_hex: &str) -> bool {
        let Ok(blob) = hex::decode(blob_hex.trim_start_matches("0x")) else {
            return false;
        };
        let Ok(target) = hex::decode(target_hex.trim_start_matches("0x")) else {
            return false;
        };
        let hash = self.engine.hash(&blob, nonce);
        meets_target(&hash, &target)
    }

    pub fn counters(&self) -> ShareCounters {
        ShareCounters {
            valid: self.valid.load(Ordering::Relaxed),
            invalid: self.invalid.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            blocks_found: self.blocks_found.load(Ordering::Relaxed),
        }
    }

    pub fn queue_depth(&self) -> usize {
        self.queue_depth.load(Ordering::SeqCst)
    }

    /// Periodic dedup pruning.
    pub fn spawn_maintenance(self: &Arc<Self>) {
        let pipeline = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(60));
            loop {
                tick.tick().await;
                pipeline.dedup.prune().await;
            }
        });
    }

    /// The single forwarder task. Pulls one share at a time, in submission
    /// order, and only while the upstream session is up — a down pool means
    /// the queue holds (property: no forwarding while disconnected).
    pub async fn run_forwarder(
        self: Arc<Self>,
        upstream: Arc<UpstreamClient>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut rx = match self.forward_rx.lock().await.take() {
            Some(rx) => rx,
            None => {
                tracing::error!("share forwarder started twice");
                return;
            }
        };
        let mut state = upstream.state();

        loop {
            if *shutdown.borrow() && self.queue_depth() == 0 {
                break;
            }

            if !upstream.is_connected() {
                if *shutdown.borrow() {
                    // Shutdown with no upstream: the queue cannot drain.
                    break;
                }
                tokio::select! {
                    r = state.changed() => { if r.is_err() { break; } }
                    _ = shutdown.changed() => {}
                }
                continue;
            }

            // Bounded recv so shutdown and disconnects are noticed.
            match timeout(Duration::from_millis(250), rx.recv()).await {
                Ok(Some(share)) => {
                    self.queue_depth.fetch_sub(1, Ordering::SeqCst);
                    self.forward_one(&upstream, share).await;
                }
                Ok(None) => break,
                Err(_) => continue,
            }
        }
        tracing::debug!("share forwarder stopped");
    }

    async fn forward_one(&self, upstream: &UpstreamClient, share: Share) {
        let nonce = u32::from_str_radix(&share.nonce, 16).unwrap_or(0);
        match upstream.submit_share(&share.job_id, nonce, &share.result).await {
            Ok(ack) if ack.accepted => {
                self.forwarded.fetch_add(1, Ordering::Relaxed);
                if ack.block_found {
                    self.blocks_found.fetch_add(1, Ordering::Relaxed);
                    tracing::info!("⛏️  block found by worker {}", share.worker_id);
                }
            }
            Ok(_) => {
                // Counted accepted at ingress; the pool disagreed.
                self.workers.reclassify_rejected(&share.worker_id).await;
                self.valid.fetch_sub(1, Ordering::Relaxed);
                self.invalid.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                // Session dropped with the response in flight. At-most-once:
                // the share is not replayed on the next connection.
                tracing::debug!("share from {} lost in transit: {}", share.worker_id, e);
                self.workers.reclassify_rejected(&share.worker_id).await;
                self.valid.fetch_sub(1, Ordering::Relaxed);
                self.invalid.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Wait for the forward queue to empty, bounded by `deadline`.
    /// Returns `true` when fully drained.
    pub async fn drain(&self, deadline: Duration) -> bool {
        let drained = timeout(deadline, async {
            while self.queue_depth() > 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        drained.is_ok()
    }
}
