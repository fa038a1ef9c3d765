//! Upstream pool client.
//!
//! One duplex session to the Stratum-style pool. The reader task owns the
//! read half; every write goes through the single mutex-held write half.
//! Responses are matched to requests by monotonically increasing id via a
//! pending map of oneshot senders. Jobs flow out through a watch channel in
//! arrival order.

pub mod messages;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::time::timeout;

use crate::config::PoolSettings;
use crate::error::UpstreamError;
use crate::jobs::Job;
use self::messages::{parse_submit_ack, JobParams, PoolMessage, PoolRequest, SubmitAck};

const RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Dialing,
    LoggingIn,
    Connected,
}

pub struct UpstreamClient {
    settings: PoolSettings,
    /// Stamped onto incoming jobs as `expires_at - received_at`.
    job_ttl: Duration,
    writer: Arc<Mutex<Option<OwnedWriteHalf>>>,
    last_write: Arc<Mutex<Instant>>,
    session_id: Arc<Mutex<Option<String>>>,
    state_tx: watch::Sender<ConnState>,
    job_tx: watch::Sender<Option<Job>>,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<PoolMessage>>>>,
    next_id: AtomicU64,
    /// Bumped on every dial so a stale reader cannot tear down a newer
    /// session's state.
    generation: Arc<AtomicU64>,
}

impl UpstreamClient {
    pub fn new(settings: PoolSettings, job_ttl: Duration) -> Self {
        let (state_tx, _) = watch::channel(ConnState::Disconnected);
        let (job_tx, _) = watch::channel(None);
        Self {
            settings,
            job_ttl,
            writer: Arc::new(Mutex::new(None)),
            last_write: Arc::new(Mutex::new(Instant::now())),
            session_id: Arc::new(Mutex::new(None)),
            state_tx,
            job_tx,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn state(&self) -> watch::Receiver<ConnState> {
        self.state_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        *self.state_tx.borrow() == ConnState::Connected
    }

    /// Jobs in upstream arrival order; the receiver sees the latest.
    pub fn jobs(&self) -> watch::Receiver<Option<Job>> {
        self.job_tx.subscribe()
    }

    fn next_request_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Supervisor loop: dial, login, stay connected, back off and retry on
    /// loss. Returns `Err` only when the configured attempt budget runs out.
    pub async fn run(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), UpstreamError> {
        let mut backoff = self.settings.reconnect_delay;
        let mut attempts: u32 = 0;

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            match self.connect_once().await {
                Ok(()) => {
                    attempts = 0;
                    backoff = self.settings.reconnect_delay;

                    // Hold here until the session drops or shutdown begins.
                    let mut state = self.state();
                    loop {
                        if *state.borrow() == ConnState::Disconnected || *shutdown.borrow() {
                            break;
                        }
                        tokio::select! {
                            r = state.changed() => { if r.is_err() { break; } }
                            r = shutdown.changed() => { if r.is_err() { break; } }
                        }
                    }
                    if *shutdown.borrow() {
                        return Ok(());
                    }
                    tracing::warn!(
                        "upstream session lost, reconnecting in {:?}",
                        self.settings.reconnect_delay
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(self.settings.reconnect_delay) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Err(e) => {
                    attempts += 1;
                    let max = self.settings.max_reconnect_attempts;
                    if max > 0 && attempts >= max {
                        tracing::error!("upstream unreachable after {} attempts: {}", attempts, e);
                        return Err(e);
                    }
                    tracing::warn!(
                        "upstream connect attempt {} failed: {} (retrying in {:?})",
                        attempts,
                        e,
                        backoff
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = shutdown.changed() => {}
                    }
                    backoff = (backoff * 2).min(PoolSettings::RECONNECT_CEILING);
                }
            }
        }
    }

    /// One dial + login cycle, bounded by `pool.connect_timeout`.
    async fn connect_once(&self) -> Result<(), UpstreamError> {
        let _ = self.state_tx.send(ConnState::Dialing);

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let dial_and_login = async {
            let stream = TcpStream::connect(&self.settings.address).await?;
            let (read_half, write_half) = stream.into_split();
            *self.writer.lock().await = Some(write_half);
            self.spawn_read_loop(read_half, generation);

            let _ = self.state_tx.send(ConnState::LoggingIn);
            self.login().await
        };

        match timeout(self.settings.connect_timeout, dial_and_login).await {
            Ok(Ok(())) => {
                let _ = self.state_tx.send(ConnState::Connected);
                self.spawn_keepalive(generation);
                tracing::info!("✅ logged in to upstream pool {}", self.settings.address);
                Ok(())
            }
            Ok(Err(e)) => {
                self.teardown().await;
                Err(e)
            }
            Err(_) => {
                self.teardown().await;
                Err(UpstreamError::Timeout)
            }
        }
    }

    async fn login(&self) -> Result<(), UpstreamError> {
        let id = self.next_request_id();
        let req = PoolRequest::login(id, &self.settings.wallet, &self.settings.password);
        let resp = self.send_request(&req).await?;

        let result = resp
            .result
            .ok_or_else(|| UpstreamError::Protocol("login result missing".to_string()))?;
        let obj = result
            .as_object()
            .ok_or_else(|| UpstreamError::Protocol("login result is not an object".to_string()))?;

        let session = match obj.get("id") {
            Some(v) if v.is_string() => v.as_str().unwrap_or_default().to_string(),
            Some(v) if v.is_u64() => v.as_u64().unwrap_or_default().to_string(),
            _ => return Err(UpstreamError::Protocol("login result has no session id".to_string())),
        };
        *self.session_id.lock().await = Some(session);

        // Most pools embed the first job in the login result.
        if let Some(job_val) = obj.get("job") {
            match serde_json::from_value::<JobParams>(job_val.clone()) {
                Ok(params) => self.publish_job(params),
                Err(e) => tracing::debug!("login result carried an unparsable job: {}", e),
            }
        }

        Ok(())
    }

    /// Submit one share. A rejected-with-status share comes back as
    /// `Ok(ack)` with `accepted == false`; transport loss surfaces as `Err`
    /// and is final for this share (at-most-once per connection).
    pub async fn submit_share(
        &self,
        job_id: &str,
        nonce: u32,
        result_hex: &str,
    ) -> Result<SubmitAck, UpstreamError> {
        let session = self
            .session_id
            .lock()
            .await
            .clone()
            .ok_or(UpstreamError::NotConnected)?;

        let id = self.next_request_id();
        let req = PoolRequest::submit(id, &session, job_id, nonce, result_hex);
        match self.send_request(&req).await {
            Ok(resp) => match resp.result {
                Some(result) => Ok(parse_submit_ack(&result)),
                None => Ok(SubmitAck { accepted: false, block_found: false }),
            },
            Err(UpstreamError::Rpc { code, message }) => {
                tracing::debug!("upstream rejected share on {}: {} ({})", job_id, message, code);
                Ok(SubmitAck { accepted: false, block_found: false })
            }
            Err(e) => Err(e),
        }
    }

    /// Best-effort goodbye, then drop the session.
    pub async fn disconnect(&self) {
        if let Some(session) = self.session_id.lock().await.clone() {
            let req = PoolRequest::disconnect(self.next_request_id(), &session);
            if let Ok(line) = serde_json::to_string(&req) {
                let _ = self.write_line(&line).await;
            }
        }
        self.teardown().await;
    }

    async fn teardown(&self) {
        *self.writer.lock().await = None;
        *self.session_id.lock().await = None;
        self.pending.lock().await.clear();
        let _ = self.state_tx.send(ConnState::Disconnected);
    }

    async fn send_request(&self, request: &PoolRequest) -> Result<PoolMessage, UpstreamError> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request.id, tx);

        let line = serde_json::to_string(request)
            .map_err(|e| UpstreamError::Protocol(e.to_string()))?;
        if let Err(e) = self.write_line(&line).await {
            self.pending.lock().await.remove(&request.id);
            return Err(e);
        }

        match timeout(RESPONSE_TIMEOUT, rx).await {
            Ok(Ok(resp)) => {
                if let Some(err) = resp.error.clone() {
                    return Err(UpstreamError::Rpc { code: err.code, message: err.message });
                }
                Ok(resp)
            }
            // Sender dropped: the session died with the response in flight.
            Ok(Err(_)) => Err(UpstreamError::NotConnected),
            Err(_) => {
                self.pending.lock().await.remove(&request.id);
                Err(UpstreamError::Timeout)
            }
        }
    }

    async fn write_line(&self, line: &str) -> Result<(), UpstreamError> {
        let mut writer = self.writer.lock().await;
        let stream = writer.as_mut().ok_or(UpstreamError::NotConnected)?;
        stream.write_all(line.as_bytes()).await?;
        stream.write_all(b"\n").await?;
        stream.flush().await?;
        *self.last_write.lock().await = Instant::now();
        Ok(())
    }

    fn publish_job(&self, params: JobParams) {
        let now = Utc::now().timestamp();
        let job = Job {
            job_id: params.job_id,
            blob: params.blob,
            target: params.target,
            height: params.height,
            seed_hash: params.seed_hash,
            received_at: now,
            expires_at: now + self.job_ttl.as_secs() as i64,
        };
        tracing::debug!("upstream job {} (height {})", job.job_id, job.height);
        let _ = self.job_tx.send(Some(job));
    }

    fn spawn_read_loop(&self, read_half: OwnedReadHalf, generation: u64) {
        let state_tx = self.state_tx.clone();
        let job_tx = self.job_tx.clone();
        let pending = self.pending.clone();
        let current_generation = self.generation.clone();
        let job_ttl = self.job_ttl;

        tokio::spawn(async move {
            let mut reader = BufReader::new(read_half);
            let mut line = String::new();
            loop {
                line.clear();
                let bytes = match reader.read_line(&mut line).await {
                    Ok(n) => n,
                    Err(e) => {
                        tracing::debug!("upstream read error: {}", e);
                        break;
                    }
                };
                if bytes == 0 {
                    break;
                }
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }

                let parsed: PoolMessage = match serde_json::from_str(trimmed) {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::debug!("unparsable upstream line: {}", e);
                        continue;
                    }
                };

                if parsed.method.as_deref() == Some("job") {
                    if let Some(params) = parsed.params.clone() {
                        match serde_json::from_value::<JobParams>(params) {
                            Ok(p) => {
                                let now = Utc::now().timestamp();
                                let job = Job {
                                    job_id: p.job_id,
                                    blob: p.blob,
                                    target: p.target,
                                    height: p.height,
                                    seed_hash: p.seed_hash,
                                    received_at: now,
                                    expires_at: now + job_ttl.as_secs() as i64,
                                };
                                let _ = job_tx.send(Some(job));
                            }
                            Err(e) => tracing::debug!("bad job notification: {}", e),
                        }
                    }
                    continue;
                }

                if let Some(id) = parsed.id {
                    if let Some(tx) = pending.lock().await.remove(&id) {
                        let _ = tx.send(parsed);
                    }
                }
            }

            // Dropping the pending senders fails every in-flight request;
            // those shares are never retried on the next session.
            if current_generation.load(Ordering::SeqCst) == generation {
                pending.lock().await.clear();
                let _ = state_tx.send(ConnState::Disconnected);
            }
        });
    }

    fn spawn_keepalive(&self, generation: u64) {
        let mut state = self.state();
        let writer = self.writer.clone();
        let last_write = self.last_write.clone();
        let session_id = self.session_id.clone();
        let current_generation = self.generation.clone();
        let next_id = Arc::new(AtomicU64::new(u64::MAX / 2));

        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(5));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                if current_generation.load(Ordering::SeqCst) != generation {
                    break;
                }
                if *state.borrow_and_update() != ConnState::Connected {
                    break;
                }
                let idle = last_write.lock().await.elapsed();
                if idle < PoolSettings::KEEPALIVE_AFTER {
                    continue;
                }
                let Some(session) = session_id.lock().await.clone() else { continue };
                let req =
                    PoolRequest::keepalived(next_id.fetch_add(1, Ordering::Relaxed), &session);
                let Ok(line) = serde_json::to_string(&req) else { continue };

                let mut guard = writer.lock().await;
                if let Some(stream) = guard.as_mut() {
                    let _ = stream.write_all(line.as_bytes()).await;
                    let _ = stream.write_all(b"\n").await;
                    let _ = stream.flush().await;
                    *last_write.lock().await = Instant::now();
                }
            }
        });
    }
}
