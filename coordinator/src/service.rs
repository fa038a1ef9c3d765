//! Coordinator service: worker RPC surface, job fan-out, liveness sweep,
//! stats aggregation, lifecycle.
//!
//! The service is the only owner: registries, pipeline, and upstream client
//! are handed in as `Arc`s and communicate through channels, never through a
//! back-reference.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, RwLock};
use uuid::Uuid;

use crate::config::Config;
use crate::jobs::JobRegistry;
use crate::protocol::{
    job_notification, HeartbeatParams, JobPayload, RegisterParams, RegisterResult, RpcError,
    RpcRequest, RpcResponse, SubmitParams, WorkerIdParams,
};
use crate::shares::{Share, SharePipeline};
use crate::upstream::UpstreamClient;
use crate::workers::{WorkerRegistry, WorkerStatus};

/// Malformed lines tolerated before the session is closed.
const MAX_PARSE_ERRORS: u32 = 3;

struct ConnHandle {
    worker_id: Option<String>,
    subscribed: bool,
    outbound: mpsc::UnboundedSender<String>,
}

pub struct CoordinatorService {
    cfg: Config,
    workers: Arc<WorkerRegistry>,
    jobs: Arc<JobRegistry>,
    pipeline: Arc<SharePipeline>,
    upstream: Arc<UpstreamClient>,
    connections: RwLock<HashMap<String, Arc<RwLock<ConnHandle>>>>,
    connection_count: AtomicUsize,
    started_at: Instant,
    started_at_ts: i64,
    shutdown_tx: watch::Sender<bool>,
}

/// Immutable stats snapshot; serialized outside all locks.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterStats {
    pub cluster_id: String,
    pub cluster_name: String,
    pub uptime_seconds: u64,
    pub workers_total: usize,
    pub workers_online: usize,
    pub total_hashrate: f64,
    pub shares_valid: u64,
    pub shares_invalid: u64,
    pub blocks_found: u64,
    pub pool_connected: bool,
    pub workers: Vec<WorkerStatsEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatsEntry {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    pub status: WorkerStatus,
    pub hashrate: f64,
    pub shares: u64,
    pub last_seen: i64,
}

impl CoordinatorService {
    pub fn new(
        cfg: Config,
        workers: Arc<WorkerRegistry>,
        jobs: Arc<JobRegistry>,
        pipeline: Arc<SharePipeline>,
        upstream: Arc<UpstreamClient>,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            cfg,
            workers,
            jobs,
            pipeline,
            upstream,
            connections: RwLock::new(HashMap::new()),
            connection_count: AtomicUsize::new(0),
            started_at: Instant::now(),
            started_at_ts: chrono::Utc::now().timestamp(),
            shutdown_tx,
        })
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Bind the RPC listener and run until shutdown. Spawns the liveness
    /// sweeper, the upstream→registry job pump, the job fan-out, the dedup
    /// maintenance, and the share forwarder.
    pub async fn start(self: Arc<Self>) -> Result<()> {
        let listener = bind_reuse(&self.cfg.rpc.listen)?;
        tracing::info!("🌐 worker RPC listening on {}", self.cfg.rpc.listen);

        self.spawn_sweeper();
        self.spawn_job_pump();
        self.spawn_job_fanout();
        self.pipeline.spawn_maintenance();
        tokio::spawn(
            self.pipeline
                .clone()
                .run_forwarder(self.upstream.clone(), self.shutdown_signal()),
        );

        let mut shutdown = self.shutdown_signal();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((socket, peer_addr)) => {
                            let count = self.connection_count.load(Ordering::Relaxed);
                            if count >= self.cfg.rpc.max_workers {
                                tracing::warn!(
                                    "connection cap ({}) reached, rejecting {}",
                                    self.cfg.rpc.max_workers,
                                    peer_addr
                                );
                                drop(socket);
                                continue;
                            }
                            let service = Arc::clone(&self);
                            tokio::spawn(async move {
                                if let Err(e) = service.handle_connection(socket, peer_addr).await {
                                    tracing::debug!("worker session {} ended: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => tracing::error!("accept failed: {}", e),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!("RPC listener stopping");
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn handle_connection(&self, socket: TcpStream, peer_addr: SocketAddr) -> Result<()> {
        let session_id = Uuid::new_v4().to_string();
        let (reader, mut writer) = socket.into_split();
        let mut reader = BufReader::new(reader);

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let handle = Arc::new(RwLock::new(ConnHandle {
            worker_id: None,
            subscribed: false,
            outbound: tx,
        }));

        {
            let mut connections = self.connections.write().await;
            connections.insert(session_id.clone(), Arc::clone(&handle));
        }
        self.connection_count.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("worker connection {} from {}", session_id, peer_addr);

        // Writer task: responses and job pushes share one ordered channel,
        // so per-worker job delivery stays monotonic.
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if writer.write_all(msg.as_bytes()).await.is_err() {
                    break;
                }
                if writer.write_all(b"\n").await.is_err() {
                    break;
                }
                let _ = writer.flush().await;
            }
        });

        // Dead-session guard: a worker that stays silent for two liveness
        // timeouts has long since been swept Offline.
        let read_timeout = self.cfg.workers.timeout * 2;
        let mut shutdown = self.shutdown_signal();
        let mut parse_errors: u32 = 0;
        let mut line = String::new();
        let result = loop {
            line.clear();
            let read = tokio::select! {
                r = tokio::time::timeout(read_timeout, reader.read_line(&mut line)) => r,
                _ = shutdown.changed() => break Ok(()),
            };

            match read {
                Ok(Ok(0)) => break Ok(()),
                Ok(Ok(_)) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    let response = match serde_json::from_str::<RpcRequest>(trimmed) {
                        Ok(request) => self.handle_request(&handle, request).await,
                        Err(e) => {
                            parse_errors += 1;
                            if parse_errors >= MAX_PARSE_ERRORS {
                                break Err(anyhow::anyhow!("too many malformed requests"));
                            }
                            RpcResponse::error(
                                Value::Null,
                                RpcError::invalid_params(format!("malformed request: {}", e)),
                            )
                        }
                    };
                    let payload = match serde_json::to_string(&response) {
                        Ok(p) => p,
                        Err(e) => break Err(e.into()),
                    };
                    let sender = handle.read().await.outbound.clone();
                    if sender.send(payload).is_err() {
                        break Ok(());
                    }
                }
                Ok(Err(e)) => break Err(e.into()),
                Err(_) => break Err(anyhow::anyhow!("read timeout")),
            }
        };

        {
            let mut connections = self.connections.write().await;
            connections.remove(&session_id);
        }
        self.connection_count.fetch_sub(1, Ordering::Relaxed);
        tracing::debug!("worker connection {} closed", session_id);
        result
    }

    async fn handle_request(
        &self,
        handle: &Arc<RwLock<ConnHandle>>,
        request: RpcRequest,
    ) -> RpcResponse {
        let id = request.id.clone();
        let params = request.params.unwrap_or(Value::Null);

        match request.method.as_str() {
            "register" => self.handle_register(handle, id, params).await,
            "heartbeat" => self.handle_heartbeat(id, params).await,
            "getjob" => self.handle_getjob(id, params).await,
            "submit" => self.handle_submit(id, params).await,
            "deregister" => self.handle_deregister(handle, id, params).await,
            "subscribe" => self.handle_subscribe(handle, id, params).await,
            other => RpcResponse::error(id, RpcError::invalid_method(other)),
        }
    }

    async fn handle_register(
        &self,
        handle: &Arc<RwLock<ConnHandle>>,
        id: Value,
        params: Value,
    ) -> RpcResponse {
        let params: RegisterParams = match serde_json::from_value(params) {
            Ok(p) => p,
            Err(e) => return RpcResponse::error(id, RpcError::invalid_params(e.to_string())),
        };

        match self
            .workers
            .register(&params.worker_id, &params.name, &params.address, params.agent)
            .await
        {
            Ok(range) => {
                {
                    let mut conn = handle.write().await;
                    conn.worker_id = Some(params.worker_id.clone());
                }
                let current = self.jobs.current().await;
                let result = RegisterResult::new(range, current.as_ref());
                match serde_json::to_value(result) {
                    Ok(v) => RpcResponse::success(id, v),
                    Err(e) => RpcResponse::error(
                        id,
                        RpcError::new(RpcError::INTERNAL_ERROR, e.to_string()),
                    ),
                }
            }
            Err(crate::error::RegistryError::IdInUse(_)) => {
                RpcResponse::error(id, RpcError::id_in_use(&params.worker_id))
            }
            Err(crate::error::RegistryError::NonceSpaceExhausted) => {
                RpcResponse::error(id, RpcError::no_capacity())
            }
            Err(e) => RpcResponse::error(id, RpcError::new(RpcError::INTERNAL_ERROR, e.to_string())),
        }
    }

    async fn handle_heartbeat(&self, id: Value, params: Value) -> RpcResponse {
        let params: HeartbeatParams = match serde_json::from_value(params) {
            Ok(p) => p,
            Err(e) => return RpcResponse::error(id, RpcError::invalid_params(e.to_string())),
        };

        match self.workers.heartbeat(&params.worker_id, params.hashrate).await {
            Ok(status) => RpcResponse::success(id, serde_json::json!({ "status": status })),
            Err(_) => RpcResponse::error(id, RpcError::unknown_worker(&params.worker_id)),
        }
    }

    async fn handle_getjob(&self, id: Value, params: Value) -> RpcResponse {
        let params: WorkerIdParams = match serde_json::from_value(params) {
            Ok(p) => p,
            Err(e) => return RpcResponse::error(id, RpcError::invalid_params(e.to_string())),
        };
        if !self.workers.contains(&params.worker_id).await {
            return RpcResponse::error(id, RpcError::unknown_worker(&params.worker_id));
        }

        match self.jobs.current().await {
            Some(job) => match serde_json::to_value(JobPayload::from(&job)) {
                Ok(v) => RpcResponse::success(id, v),
                Err(e) => {
                    RpcResponse::error(id, RpcError::new(RpcError::INTERNAL_ERROR, e.to_string()))
                }
            },
            None => RpcResponse::error(id, RpcError::no_job_yet()),
        }
    }

    async fn handle_submit(&self, id: Value, params: Value) -> RpcResponse {
        let params: SubmitParams = match serde_json::from_value(params) {
            Ok(p) => p,
            Err(e) => return RpcResponse::error(id, RpcError::invalid_params(e.to_string())),
        };

        let share = Share {
            worker_id: params.worker_id,
            job_id: params.job_id,
            nonce: params.nonce,
            result: params.result,
            submitted_at: chrono::Utc::now().timestamp(),
        };
        let outcome = self.pipeline.submit(share).await;
        RpcResponse::success(
            id,
            serde_json::json!({
                "outcome": outcome.as_str(),
                "accepted": outcome.is_accepted(),
            }),
        )
    }

    async fn handle_deregister(
        &self,
        handle: &Arc<RwLock<ConnHandle>>,
        id: Value,
        params: Value,
    ) -> RpcResponse {
        let params: WorkerIdParams = match serde_json::from_value(params) {
            Ok(p) => p,
            Err(e) => return RpcResponse::error(id, RpcError::invalid_params(e.to_string())),
        };

        match self.workers.deregister(&params.worker_id).await {
            Ok(()) => {
                let mut conn = handle.write().await;
                if conn.worker_id.as_deref() == Some(params.worker_id.as_str()) {
                    conn.worker_id = None;
                    conn.subscribed = false;
                }
                RpcResponse::success(id, serde_json::json!({ "status": "ok" }))
            }
            Err(_) => RpcResponse::error(id, RpcError::unknown_worker(&params.worker_id)),
        }
    }

    async fn handle_subscribe(
        &self,
        handle: &Arc<RwLock<ConnHandle>>,
        id: Value,
        params: Value,
    ) -> RpcResponse {
        let params: WorkerIdParams = match serde_json::from_value(params) {
            Ok(p) => p,
            Err(e) => return RpcResponse::error(id, RpcError::invalid_params(e.to_string())),
        };
        if !self.workers.contains(&params.worker_id).await {
            return RpcResponse::error(id, RpcError::unknown_worker(&params.worker_id));
        }

        let mut conn = handle.write().await;
        conn.worker_id = Some(params.worker_id);
        conn.subscribed = true;
        RpcResponse::success(id, serde_json::json!({ "status": "ok" }))
    }

    /// Upstream jobs flow into the registry in arrival order.
    fn spawn_job_pump(self: &Arc<Self>) {
        let service = self.clone();
        let mut jobs_rx = self.upstream.jobs();
        let mut shutdown = self.shutdown_signal();
        tokio::spawn(async move {
            // A job may already be present from a login that beat us here.
            let initial = jobs_rx.borrow_and_update().clone();
            if let Some(job) = initial {
                service.jobs.set_job(job).await;
            }
            loop {
                tokio::select! {
                    r = jobs_rx.changed() => {
                        if r.is_err() {
                            break;
                        }
                        let job = jobs_rx.borrow_and_update().clone();
                        if let Some(job) = job {
                            service.jobs.set_job(job).await;
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() { break; }
                    }
                }
            }
        });
    }

    /// Push job changes to subscribed connections of online workers.
    fn spawn_job_fanout(self: &Arc<Self>) {
        let service = self.clone();
        let mut changes = self.jobs.subscribe();
        let mut shutdown = self.shutdown_signal();
        tokio::spawn(async move {
            let initial = changes.borrow_and_update().clone();
            if let Some(job) = initial {
                service.push_job(&job).await;
            }
            loop {
                tokio::select! {
                    r = changes.changed() => {
                        if r.is_err() {
                            break;
                        }
                        let job = changes.borrow_and_update().clone();
                        if let Some(job) = job {
                            service.push_job(&job).await;
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() { break; }
                    }
                }
            }
        });
    }

    async fn push_job(&self, job: &crate::jobs::Job) {
        let notification = match serde_json::to_string(&job_notification(job)) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("job notification serialization failed: {}", e);
                return;
            }
        };

        // Clone handles out of the map; no lock held across sends.
        let handles: Vec<Arc<RwLock<ConnHandle>>> = {
            let connections = self.connections.read().await;
            connections.values().cloned().collect()
        };

        let mut sent = 0usize;
        for handle in handles {
            let (subscribed, worker_id, outbound) = {
                let conn = handle.read().await;
                (conn.subscribed, conn.worker_id.clone(), conn.outbound.clone())
            };
            if !subscribed {
                continue;
            }
            let Some(worker_id) = worker_id else { continue };
            match self.workers.status_of(&worker_id).await {
                Some(status) if status.is_online() => {}
                _ => continue,
            }
            if outbound.send(notification.clone()).is_ok() {
                sent += 1;
            }
        }
        if sent > 0 {
            tracing::info!("📢 pushed job {} to {} worker(s)", job.job_id, sent);
        }
    }

    fn spawn_sweeper(self: &Arc<Self>) {
        let service = self.clone();
        let period = self.cfg.workers.heartbeat_interval;
        let mut shutdown = self.shutdown_signal();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        service.workers.sweep(Instant::now()).await;
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() { break; }
                    }
                }
            }
        });
    }

    /// Snapshot everything the stats feed needs. Locks are released before
    /// the caller serializes.
    pub async fn stats(&self) -> ClusterStats {
        let snapshot = self.workers.snapshot().await;
        let counters = self.pipeline.counters();

        let workers_total = snapshot.len();
        let workers_online = snapshot.iter().filter(|w| w.status.is_online()).count();
        let total_hashrate: f64 =
            snapshot.iter().filter(|w| w.status.is_online()).map(|w| w.hashrate).sum();

        ClusterStats {
            cluster_id: self.cfg.cluster.id.clone(),
            cluster_name: self.cfg.cluster.name.clone(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
            workers_total,
            workers_online,
            total_hashrate,
            shares_valid: counters.valid,
            shares_invalid: counters.invalid,
            blocks_found: counters.blocks_found,
            pool_connected: self.upstream.is_connected(),
            workers: snapshot
                .into_iter()
                .map(|w| WorkerStatsEntry {
                    id: w.id,
                    name: w.name,
                    agent: w.agent,
                    status: w.status,
                    hashrate: w.hashrate,
                    shares: w.accepted,
                    last_seen: w.last_seen,
                })
                .collect(),
        }
    }

    pub fn started_at_ts(&self) -> i64 {
        self.started_at_ts
    }

    /// Orderly stop: refuse new RPCs, drain the forward queue within the
    /// configured deadline, say goodbye upstream, release every slab.
    pub async fn shutdown(&self) {
        tracing::info!("coordinator shutting down");
        let _ = self.shutdown_tx.send(true);

        if self.upstream.is_connected() {
            if !self.pipeline.drain(self.cfg.drain_timeout).await {
                tracing::warn!(
                    "forward queue not drained within {:?}; dropping {} share(s)",
                    self.cfg.drain_timeout,
                    self.pipeline.queue_depth()
                );
            }
        } else if self.pipeline.queue_depth() > 0 {
            tracing::warn!(
                "upstream down at shutdown; dropping {} queued share(s)",
                self.pipeline.queue_depth()
            );
        }

        self.upstream.disconnect().await;
        self.workers.release_all().await;
        tracing::info!("🏁 coordinator stopped");
    }
}

/// SO_REUSEADDR bind so restarts do not trip over TIME_WAIT sockets.
fn bind_reuse(addr: &str) -> Result<TcpListener> {
    let sock_addr: SocketAddr = addr
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid listen address '{}': {}", addr, e))?;
    let domain = if sock_addr.is_ipv4() { socket2::Domain::IPV4 } else { socket2::Domain::IPV6 };
    let socket =
        socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&socket2::SockAddr::from(sock_addr))?;
    socket.listen(1024)?;
    let std_listener: std::net::TcpListener = socket.into();
    Ok(TcpListener::from_std(std_listener)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashing::Sha3Engine;

    fn service() -> Arc<CoordinatorService> {
        let mut cfg = Config::default();
        cfg.pool.wallet = "w".to_string();
        let workers = Arc::new(WorkerRegistry::new(cfg.workers.clone()));
        let jobs = Arc::new(JobRegistry::new(cfg.jobs.history_size, cfg.jobs.timeout));
        let pipeline =
            SharePipeline::new(workers.clone(), jobs.clone(), &cfg.shares, Box::new(Sha3Engine));
        let upstream = Arc::new(UpstreamClient::new(cfg.pool.clone(), cfg.jobs.timeout));
        CoordinatorService::new(cfg, workers, jobs, pipeline, upstream)
    }

    #[tokio::test]
    async fn stats_aggregate_online_hashrate() {
        let svc = service();
        svc.workers.register("w1", "rig1", "a:1", None).await.unwrap();
        svc.workers.register("w2", "rig2", "a:2", None).await.unwrap();
        svc.workers.register("w3", "rig3", "a:3", None).await.unwrap();
        svc.workers.heartbeat("w1", 1000.0).await.unwrap();
        svc.workers.heartbeat("w2", 1000.0).await.unwrap();
        svc.workers.heartbeat("w3", 1000.0).await.unwrap();

        let stats = svc.stats().await;
        assert_eq!(stats.workers_total, 3);
        assert_eq!(stats.workers_online, 3);
        assert!((stats.total_hashrate - 3000.0).abs() < f64::EPSILON);
        assert!(!stats.pool_connected);
    }

    #[tokio::test]
    async fn registered_workers_do_not_count_as_online() {
        let svc = service();
        svc.workers.register("w1", "rig1", "a:1", None).await.unwrap();
        let stats = svc.stats().await;
        assert_eq!(stats.workers_total, 1);
        assert_eq!(stats.workers_online, 0);
        assert!((stats.total_hashrate - 0.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn stats_echo_the_worker_agent() {
        let svc = service();
        svc.workers
            .register("w1", "rig1", "a:1", Some("xmrig/6.21".to_string()))
            .await
            .unwrap();

        let stats = svc.stats().await;
        assert_eq!(stats.workers[0].agent.as_deref(), Some("xmrig/6.21"));
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["workers"][0]["agent"], "xmrig/6.21");
    }

    #[tokio::test]
    async fn unknown_method_gets_structured_error() {
        let svc = service();
        let (tx, _rx) = mpsc::unbounded_channel();
        let handle = Arc::new(RwLock::new(ConnHandle {
            worker_id: None,
            subscribed: false,
            outbound: tx,
        }));
        let request = RpcRequest {
            jsonrpc: None,
            id: serde_json::json!(1),
            method: "mine_harder".to_string(),
            params: None,
        };
        let resp = svc.handle_request(&handle, request).await;
        assert_eq!(resp.error.unwrap().code, RpcError::INVALID_METHOD);
    }
}
