// CoopMine Coordinator — aggregates cluster hashrate into one upstream miner.
//
// Tasks: upstream session supervisor, worker RPC server, liveness sweeper,
// share forwarder, stats API. Exit codes: 0 normal, 1 bad config, 2 fatal
// runtime error, 130 signal-initiated shutdown.

use std::process::ExitCode;
use std::sync::Arc;

use axum::{extract::State, routing::get, Json};
use serde_json::json;

use coopmine_coordinator::config::Config;
use coopmine_coordinator::hashing::Sha3Engine;
use coopmine_coordinator::jobs::JobRegistry;
use coopmine_coordinator::service::CoordinatorService;
use coopmine_coordinator::shares::SharePipeline;
use coopmine_coordinator::upstream::UpstreamClient;
use coopmine_coordinator::workers::WorkerRegistry;

#[derive(Clone)]
struct ApiState {
    service: Arc<CoordinatorService>,
}

async fn api_stats(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let stats = state.service.stats().await;
    Json(serde_json::to_value(stats).unwrap_or_else(|_| json!({"ok": false})))
}

async fn api_health(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let stats = state.service.stats().await;
    Json(json!({
        "status": "ok",
        "pool_connected": stats.pool_connected,
        "workers_online": stats.workers_online,
        "started_at": state.service.started_at_ts(),
    }))
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("Failed to register SIGTERM handler");
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::select! {
            _ = sigterm.recv() => tracing::info!("SIGTERM — shutting down"),
            _ = ctrl_c => tracing::info!("SIGINT — shutting down"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("Failed to register Ctrl+C handler");
        tracing::info!("Ctrl+C — shutting down");
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cfg = Config::load();
    if let Err(e) = cfg.validate() {
        tracing::error!("invalid configuration: {}", e);
        return ExitCode::from(1);
    }

    tracing::info!(
        "🚀 CoopMine coordinator '{}' — upstream {}, RPC {}, stats {}",
        cfg.cluster.name,
        cfg.pool.address,
        cfg.rpc.listen,
        cfg.stats_listen
    );

    let workers = Arc::new(WorkerRegistry::new(cfg.workers.clone()));
    let jobs = Arc::new(JobRegistry::new(cfg.jobs.history_size, cfg.jobs.timeout));
    let pipeline =
        SharePipeline::new(workers.clone(), jobs.clone(), &cfg.shares, Box::new(Sha3Engine));
    let upstream = Arc::new(UpstreamClient::new(cfg.pool.clone(), cfg.jobs.timeout));

    let service =
        CoordinatorService::new(cfg.clone(), workers, jobs, pipeline, upstream.clone());

    // Upstream session supervisor. Exhausting the reconnect budget is fatal.
    let (fatal_tx, mut fatal_rx) = tokio::sync::mpsc::channel::<String>(1);
    {
        let upstream = upstream.clone();
        let shutdown = service.shutdown_signal();
        let fatal_tx = fatal_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = upstream.run(shutdown).await {
                let _ = fatal_tx.send(format!("upstream: {}", e)).await;
            }
        });
    }

    // Worker RPC server.
    {
        let service = service.clone();
        let fatal_tx = fatal_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = service.start().await {
                let _ = fatal_tx.send(format!("rpc server: {}", e)).await;
            }
        });
    }

    // Stats feed.
    let api = axum::Router::new()
        .route("/api/stats", get(api_stats))
        .route("/api/health", get(api_health))
        .with_state(ApiState { service: service.clone() });

    let listener = match tokio::net::TcpListener::bind(&cfg.stats_listen).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("cannot bind stats listener {}: {}", cfg.stats_listen, e);
            return ExitCode::from(2);
        }
    };
    tracing::info!("📡 stats feed listening on {}", cfg.stats_listen);

    let (stats_stop_tx, stats_stop_rx) = tokio::sync::oneshot::channel::<()>();
    let api_task = tokio::spawn(async move {
        let _ = axum::serve(listener, api)
            .with_graceful_shutdown(async {
                let _ = stats_stop_rx.await;
            })
            .await;
    });

    // Run until a signal or a fatal subsystem error.
    let exit_code = tokio::select! {
        _ = shutdown_signal() => ExitCode::from(130),
        msg = fatal_rx.recv() => {
            tracing::error!("fatal: {}", msg.unwrap_or_else(|| "subsystem died".to_string()));
            ExitCode::from(2)
        }
    };

    service.shutdown().await;
    let _ = stats_stop_tx.send(());
    let _ = api_task.await;

    exit_code
}
