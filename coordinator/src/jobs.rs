//! Job registry: the authoritative answer to "is this job still valid?".
//!
//! The upstream reader is the single writer; worker RPC handlers and the
//! stats path are readers. Superseded jobs stay in a bounded history ring so
//! late shares keep validating until they go stale.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock};

use crate::error::JobLookupError;

/// Immutable work unit from the upstream pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    /// Opaque work blob, hex.
    pub blob: String,
    /// Big-endian difficulty threshold, hex.
    pub target: String,
    pub height: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed_hash: Option<String>,
    /// Unix seconds.
    pub received_at: i64,
    pub expires_at: i64,
}

struct HistoryEntry {
    job: Job,
    /// Set when a newer job at the same height arrived; the entry goes
    /// stale once the grace period elapses past this instant.
    superseded_same_height_at: Option<i64>,
}

struct Inner {
    current: Option<Job>,
    history: VecDeque<HistoryEntry>,
}

pub struct JobRegistry {
    inner: RwLock<Inner>,
    capacity: usize,
    grace_secs: i64,
    changed_tx: watch::Sender<Option<Job>>,
}

impl JobRegistry {
    pub fn new(capacity: usize, grace: Duration) -> Self {
        let (changed_tx, _) = watch::channel(None);
        Self {
            inner: RwLock::new(Inner { current: None, history: VecDeque::new() }),
            capacity: capacity.max(1),
            grace_secs: grace.as_secs() as i64,
            changed_tx,
        }
    }

    /// Subscribe to job changes. The receiver sees the latest job only.
    pub fn subscribe(&self) -> watch::Receiver<Option<Job>> {
        self.changed_tx.subscribe()
    }

    /// Replace the current job and retire the predecessor into history.
    pub async fn set_job(&self, job: Job) {
        let now = Utc::now().timestamp();
        self.set_job_at(job, now).await;
    }

    async fn set_job_at(&self, job: Job, now: i64) {
        {
            let mut inner = self.inner.write().await;

            for entry in inner.history.iter_mut() {
                if entry.job.height == job.height && entry.superseded_same_height_at.is_none() {
                    entry.superseded_same_height_at = Some(now);
                }
            }

            if let Some(old) = inner.current.take() {
                let superseded_same_height_at =
                    if old.height == job.height { Some(now) } else { None };
                inner.history.push_back(HistoryEntry { job: old, superseded_same_height_at });
                while inner.history.len() > self.capacity {
                    inner.history.pop_front();
                }
            }

            inner.current = Some(job.clone());
        }

        tracing::debug!("job registry: current job now {} (height {})", job.job_id, job.height);
        let _ = self.changed_tx.send(Some(job));
    }

    pub async fn current(&self) -> Option<Job> {
        self.inner.read().await.current.clone()
    }

    /// Look up a job by id for share validation.
    pub async fn lookup(&self, job_id: &str) -> Result<Job, JobLookupError> {
        self.lookup_at(job_id, Utc::now().timestamp()).await
    }

    async fn lookup_at(&self, job_id: &str, now: i64) -> Result<Job, JobLookupError> {
        let inner = self.inner.read().await;

        if let Some(current) = &inner.current {
            if current.job_id == job_id {
                if current.expires_at <= now {
                    return Err(JobLookupError::Stale);
                }
                return Ok(current.clone());
            }
        }

        for entry in inner.history.iter().rev() {
            if entry.job.job_id != job_id {
                continue;
            }
            if entry.job.expires_at <= now {
                return Err(JobLookupError::Stale);
            }
            if let Some(at) = entry.superseded_same_height_at {
                if now - at >= self.grace_secs {
                    return Err(JobLookupError::Stale);
                }
            }
            return Ok(entry.job.clone());
        }

        Err(JobLookupError::Unknown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(id: &str, height: u64, received_at: i64, ttl: i64) -> Job {
        Job {
            job_id: id.to_string(),
            blob: "aa".repeat(32),
            target: "00ffffff".to_string(),
            height,
            seed_hash: None,
            received_at,
            expires_at: received_at + ttl,
        }
    }

    #[tokio::test]
    async fn current_job_is_observable_until_superseded() {
        let reg = JobRegistry::new(4, Duration::from_secs(300));
        reg.set_job_at(job("j1", 10, 0, 600), 0).await;
        assert_eq!(reg.current().await.unwrap().job_id, "j1");
        assert_eq!(reg.lookup_at("j1", 1).await.unwrap().job_id, "j1");

        reg.set_job_at(job("j2", 11, 5, 600), 5).await;
        assert_eq!(reg.current().await.unwrap().job_id, "j2");
        // j1 moved to history but is still live (different height, not expired).
        assert!(reg.lookup_at("j1", 6).await.is_ok());
    }

    #[tokio::test]
    async fn unknown_and_stale_are_distinguished() {
        let reg = JobRegistry::new(4, Duration::from_secs(300));
        reg.set_job_at(job("j1", 10, 0, 100), 0).await;

        assert_eq!(reg.lookup_at("nope", 1).await.unwrap_err(), JobLookupError::Unknown);
        assert_eq!(reg.lookup_at("j1", 100).await.unwrap_err(), JobLookupError::Stale);
    }

    #[tokio::test]
    async fn same_height_supersede_goes_stale_after_grace() {
        let grace = Duration::from_secs(60);
        let reg = JobRegistry::new(4, grace);
        reg.set_job_at(job("j1", 10, 0, 10_000), 0).await;
        reg.set_job_at(job("j1b", 10, 5, 10_000), 5).await;

        // Within the grace window the old same-height job still validates.
        assert!(reg.lookup_at("j1", 30).await.is_ok());
        // Past the grace window it is stale even though not expired.
        assert_eq!(reg.lookup_at("j1", 70).await.unwrap_err(), JobLookupError::Stale);
    }

    #[tokio::test]
    async fn history_ring_is_bounded() {
        let reg = JobRegistry::new(2, Duration::from_secs(300));
        for i in 0..5 {
            reg.set_job_at(job(&format!("j{i}"), 100 + i as u64, i, 10_000), i).await;
        }
        // j0 and j1 fell out of the ring; j2, j3 remain plus current j4.
        assert_eq!(reg.lookup_at("j0", 10).await.unwrap_err(), JobLookupError::Unknown);
        assert_eq!(reg.lookup_at("j1", 10).await.unwrap_err(), JobLookupError::Unknown);
        assert!(reg.lookup_at("j2", 10).await.is_ok());
        assert!(reg.lookup_at("j3", 10).await.is_ok());
        assert!(reg.lookup_at("j4", 10).await.is_ok());
    }

    #[tokio::test]
    async fn set_job_notifies_subscribers() {
        let reg = JobRegistry::new(4, Duration::from_secs(300));
        let mut rx = reg.subscribe();
        assert!(rx.borrow().is_none());

        reg.set_job_at(job("j1", 10, 0, 600), 0).await;
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().as_ref().unwrap().job_id, "j1");
    }
}
