//! Coordinator configuration.
//!
//! Defaults cover a single-node test cluster; every knob can be overridden
//! through `COOPMINE_*` environment variables. Invalid configuration is a
//! startup failure (exit code 1), never a runtime surprise.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ClusterSettings {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Upstream Stratum address, `host:port`.
    pub address: String,
    pub wallet: String,
    pub password: String,
    /// Initial reconnect delay; doubles up to [`PoolSettings::RECONNECT_CEILING`].
    pub reconnect_delay: Duration,
    /// 0 = retry forever.
    pub max_reconnect_attempts: u32,
    /// Bounds dial + login together.
    pub connect_timeout: Duration,
}

impl PoolSettings {
    pub const RECONNECT_CEILING: Duration = Duration::from_secs(60);
    /// Outbound silence before a `keepalived` is sent.
    pub const KEEPALIVE_AFTER: Duration = Duration::from_secs(60);
}

#[derive(Debug, Clone)]
pub struct RpcSettings {
    /// Worker-facing RPC listener, `host:port`.
    pub listen: String,
    pub max_workers: usize,
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Liveness sweep period.
    pub heartbeat_interval: Duration,
    /// No heartbeat for this long marks a worker `Offline`.
    pub timeout: Duration,
    /// Reported hashrate below this demotes `Mining` to `Idle`.
    pub min_hashrate: f64,
}

#[derive(Debug, Clone)]
pub struct JobSettings {
    /// Job lifetime, and the grace period before a superseded same-height
    /// job stops validating late shares.
    pub timeout: Duration,
    pub history_size: usize,
}

#[derive(Debug, Clone)]
pub struct ShareSettings {
    /// Re-hash submitted shares against the job target.
    pub validate_hashes: bool,
    /// Forward queue bound; overflow is classified as backpressure.
    pub forward_queue: usize,
    /// Duplicate detection window.
    pub dedup_ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub cluster: ClusterSettings,
    pub pool: PoolSettings,
    pub rpc: RpcSettings,
    pub stats_listen: String,
    pub workers: WorkerSettings,
    pub jobs: JobSettings,
    pub shares: ShareSettings,
    /// Shutdown waits this long for the forward queue to drain.
    pub drain_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cluster: ClusterSettings {
                id: "coopmine-local".to_string(),
                name: "CoopMine Cluster".to_string(),
            },
            pool: PoolSettings {
                address: "127.0.0.1:3333".to_string(),
                wallet: String::new(),
                password: "x".to_string(),
                reconnect_delay: Duration::from_secs(5),
                max_reconnect_attempts: 0,
                connect_timeout: Duration::from_secs(30),
            },
            rpc: RpcSettings {
                listen: "0.0.0.0:4400".to_string(),
                max_workers: 256,
            },
            stats_listen: "0.0.0.0:8484".to_string(),
            workers: WorkerSettings {
                heartbeat_interval: Duration::from_secs(30),
                timeout: Duration::from_secs(90),
                min_hashrate: 1.0,
            },
            jobs: JobSettings {
                timeout: Duration::from_secs(300),
                history_size: 100,
            },
            shares: ShareSettings {
                validate_hashes: false,
                forward_queue: 1024,
                dedup_ttl: Duration::from_secs(300),
            },
            drain_timeout: Duration::from_secs(10),
        }
    }
}

fn env_string(key: &str, into: &mut String) {
    if let Ok(v) = std::env::var(key) {
        *into = v;
    }
}

fn env_secs(key: &str, into: &mut Duration) {
    if let Ok(v) = std::env::var(key) {
        if let Ok(n) = v.parse::<u64>() {
            *into = Duration::from_secs(n);
        }
    }
}

impl Config {
    /// Load defaults, then apply environment overrides.
    pub fn load() -> Self {
        let mut cfg = Self::default();

        env_string("COOPMINE_CLUSTER_ID", &mut cfg.cluster.id);
        env_string("COOPMINE_CLUSTER_NAME", &mut cfg.cluster.name);

        env_string("COOPMINE_POOL_ADDRESS", &mut cfg.pool.address);
        env_string("COOPMINE_POOL_WALLET", &mut cfg.pool.wallet);
        env_string("COOPMINE_POOL_PASSWORD", &mut cfg.pool.password);
        env_secs("COOPMINE_POOL_RECONNECT_DELAY", &mut cfg.pool.reconnect_delay);
        if let Ok(v) = std::env::var("COOPMINE_POOL_MAX_RECONNECT_ATTEMPTS") {
            cfg.pool.max_reconnect_attempts = v.parse().unwrap_or(0);
        }
        env_secs("COOPMINE_POOL_CONNECT_TIMEOUT", &mut cfg.pool.connect_timeout);

        env_string("COOPMINE_RPC_LISTEN", &mut cfg.rpc.listen);
        if let Ok(v) = std::env::var("COOPMINE_RPC_MAX_WORKERS") {
            cfg.rpc.max_workers = v.parse().unwrap_or(cfg.rpc.max_workers);
        }
        env_string("COOPMINE_STATS_LISTEN", &mut cfg.stats_listen);

        env_secs("COOPMINE_WORKER_HEARTBEAT_INTERVAL", &mut cfg.workers.heartbeat_interval);
        env_secs("COOPMINE_WORKER_TIMEOUT", &mut cfg.workers.timeout);
        if let Ok(v) = std::env::var("COOPMINE_WORKER_MIN_HASHRATE") {
            if let Ok(n) = v.parse::<f64>() {
                if n.is_finite() && n >= 0.0 {
                    cfg.workers.min_hashrate = n;
                }
            }
        }

        env_secs("COOPMINE_JOB_TIMEOUT", &mut cfg.jobs.timeout);
        if let Ok(v) = std::env::var("COOPMINE_JOB_HISTORY_SIZE") {
            cfg.jobs.history_size = v.parse().unwrap_or(cfg.jobs.history_size);
        }

        if let Ok(v) = std::env::var("COOPMINE_VALIDATE_HASHES") {
            cfg.shares.validate_hashes = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Ok(v) = std::env::var("COOPMINE_FORWARD_QUEUE") {
            cfg.shares.forward_queue = v.parse().unwrap_or(cfg.shares.forward_queue);
        }
        env_secs("COOPMINE_DEDUP_TTL", &mut cfg.shares.dedup_ttl);
        env_secs("COOPMINE_DRAIN_TIMEOUT", &mut cfg.drain_timeout);

        cfg
    }

    /// Reject configurations that cannot possibly run.
    pub fn validate(&self) -> Result<(), String> {
        if self.pool.address.trim().is_empty() || !self.pool.address.contains(':') {
            return Err(format!("pool.address '{}' is not host:port", self.pool.address));
        }
        if self.pool.wallet.trim().is_empty() {
            return Err("pool.wallet must be set (COOPMINE_POOL_WALLET)".to_string());
        }
        if self.rpc.listen.trim().is_empty() || !self.rpc.listen.contains(':') {
            return Err(format!("rpc.listen '{}' is not host:port", self.rpc.listen));
        }
        if self.workers.timeout.is_zero() || self.workers.heartbeat_interval.is_zero() {
            return Err("worker timeout and heartbeat interval must be non-zero".to_string());
        }
        if self.jobs.history_size == 0 {
            return Err("jobs.history_size must be at least 1".to_string());
        }
        if self.shares.forward_queue == 0 {
            return Err("shares.forward_queue must be at least 1".to_string());
        }
        if self.rpc.max_workers == 0 {
            return Err("rpc.max_workers must be at least 1".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Config {
        let mut cfg = Config::default();
        cfg.pool.wallet = "wallet-1".to_string();
        cfg
    }

    #[test]
    fn default_config_needs_wallet() {
        assert!(Config::default().validate().is_err());
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_sizes() {
        let mut cfg = valid();
        cfg.jobs.history_size = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = valid();
        cfg.shares.forward_queue = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = valid();
        cfg.workers.timeout = Duration::ZERO;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_addresses() {
        let mut cfg = valid();
        cfg.pool.address = "no-port".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = valid();
        cfg.rpc.listen = "".to_string();
        assert!(cfg.validate().is_err());
    }
}
