//! Worker-facing RPC message types.
//!
//! Line-delimited JSON-RPC over TCP. Each coordinator operation is one
//! method; `subscribe` flips the connection into push mode and the server
//! emits `job` notifications as they arrive.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::jobs::Job;
use crate::workers::NonceRange;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<String>,
    pub id: Value,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<String>,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self { jsonrpc: Some("2.0".to_string()), id, result: Some(result), error: None }
    }

    pub fn error(id: Value, error: RpcError) -> Self {
        Self { jsonrpc: Some("2.0".to_string()), id, result: None, error: Some(error) }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub const INVALID_METHOD: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;

    pub const ID_IN_USE: i32 = 20;
    pub const UNKNOWN_WORKER: i32 = 21;
    pub const NO_JOB_YET: i32 = 22;
    pub const NO_CAPACITY: i32 = 23;

    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), data: None }
    }

    pub fn invalid_method(method: &str) -> Self {
        Self::new(Self::INVALID_METHOD, format!("unknown method '{}'", method))
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(Self::INVALID_PARAMS, message)
    }

    pub fn id_in_use(worker_id: &str) -> Self {
        Self::new(Self::ID_IN_USE, format!("worker id '{}' is already in use", worker_id))
    }

    pub fn unknown_worker(worker_id: &str) -> Self {
        Self::new(Self::UNKNOWN_WORKER, format!("unknown worker '{}'", worker_id))
    }

    pub fn no_job_yet() -> Self {
        Self::new(Self::NO_JOB_YET, "no job received from upstream yet")
    }

    pub fn no_capacity() -> Self {
        Self::new(Self::NO_CAPACITY, "nonce space exhausted")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterParams {
    pub worker_id: String,
    pub name: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub agent: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatParams {
    pub worker_id: String,
    pub hashrate: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerIdParams {
    pub worker_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitParams {
    pub worker_id: String,
    pub job_id: String,
    pub nonce: String,
    pub result: String,
}

/// Job as pushed to workers, nested under `register`/`getjob` results and
/// `job` notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPayload {
    pub job_id: String,
    pub blob: String,
    pub target: String,
    pub height: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed_hash: Option<String>,
}

impl From<&Job> for JobPayload {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.job_id.clone(),
            blob: job.blob.clone(),
            target: job.target.clone(),
            height: job.height,
            seed_hash: job.seed_hash.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResult {
    pub nonce_lo: u32,
    /// Exclusive; the top slab ends at 2^32.
    pub nonce_hi: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job: Option<JobPayload>,
}

impl RegisterResult {
    pub fn new(range: NonceRange, job: Option<&Job>) -> Self {
        Self { nonce_lo: range.lo, nonce_hi: range.hi, job: job.map(JobPayload::from) }
    }
}

/// Server-push notification carrying a new job.
pub fn job_notification(job: &Job) -> Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "method": "job",
        "params": JobPayload::from(job),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_roundtrip() {
        let raw = r#"{"id":1,"method":"heartbeat","params":{"worker_id":"w1","hashrate":1000.0}}"#;
        let req: RpcRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(req.method, "heartbeat");
        let params: HeartbeatParams = serde_json::from_value(req.params.unwrap()).unwrap();
        assert_eq!(params.worker_id, "w1");
        assert!((params.hashrate - 1000.0).abs() < f64::EPSILON);
    }

    #[test]
    fn error_response_carries_code() {
        let resp = RpcResponse::error(serde_json::json!(7), RpcError::unknown_worker("w9"));
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["error"]["code"], RpcError::UNKNOWN_WORKER);
        assert!(json.get("result").is_none());
    }

    #[test]
    fn register_result_embeds_current_job() {
        let range = NonceRange { lo: 0x0100_0000, hi: 0x0200_0000 };
        let job = Job {
            job_id: "j1".to_string(),
            blob: "ab".to_string(),
            target: "ff".to_string(),
            height: 9,
            seed_hash: None,
            received_at: 0,
            expires_at: 60,
        };
        let result = RegisterResult::new(range, Some(&job));
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["nonce_lo"], 0x0100_0000);
        assert_eq!(json["nonce_hi"], 0x0200_0000);
        assert_eq!(json["job"]["job_id"], "j1");

        let bare = RegisterResult::new(range, None);
        let json = serde_json::to_value(&bare).unwrap();
        assert!(json.get("job").is_none());
    }

    #[test]
    fn job_notification_shape() {
        let job = Job {
            job_id: "j2".to_string(),
            blob: "aa".to_string(),
            target: "0f".to_string(),
            height: 10,
            seed_hash: Some("55".to_string()),
            received_at: 0,
            expires_at: 60,
        };
        let notif = job_notification(&job);
        assert_eq!(notif["method"], "job");
        assert_eq!(notif["params"]["job_id"], "j2");
        assert_eq!(notif["params"]["seed_hash"], "55");
    }
}
