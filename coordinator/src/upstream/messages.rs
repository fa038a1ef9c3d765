//! Upstream pool wire types: line-delimited JSON-RPC.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const AGENT: &str = concat!("coopmine-coordinator/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<String>,
    pub id: u64,
    pub method: String,
    pub params: Value,
}

impl PoolRequest {
    pub fn login(id: u64, wallet: &str, pass: &str) -> Self {
        Self {
            jsonrpc: Some("2.0".to_string()),
            id,
            method: "login".to_string(),
            params: serde_json::json!({
                "login": wallet,
                "pass": pass,
                "agent": AGENT,
            }),
        }
    }

    pub fn submit(id: u64, session_id: &str, job_id: &str, nonce: u32, result: &str) -> Self {
        Self {
            jsonrpc: Some("2.0".to_string()),
            id,
            method: "submit".to_string(),
            params: serde_json::json!({
                "id": session_id,
                "job_id": job_id,
                "nonce": format!("{:08x}", nonce),
                "result": result,
            }),
        }
    }

    pub fn keepalived(id: u64, session_id: &str) -> Self {
        Self {
            jsonrpc: Some("2.0".to_string()),
            id,
            method: "keepalived".to_string(),
            params: serde_json::json!({ "id": session_id }),
        }
    }

    pub fn disconnect(id: u64, session_id: &str) -> Self {
        Self {
            jsonrpc: Some("2.0".to_string()),
            id,
            method: "disconnect".to_string(),
            params: serde_json::json!({ "id": session_id }),
        }
    }
}

/// Anything the pool sends back: a response (`id` + `result`/`error`) or a
/// notification (`method` + `params`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolMessage {
    pub id: Option<u64>,
    pub result: Option<Value>,
    pub error: Option<PoolRpcError>,
    pub method: Option<String>,
    pub params: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolRpcError {
    pub code: i32,
    pub message: String,
}

/// Payload of a `job` notification (and of the job object embedded in a
/// login result).
#[derive(Debug, Clone, Deserialize)]
pub struct JobParams {
    pub job_id: String,
    pub blob: String,
    pub target: String,
    #[serde(default)]
    pub height: u64,
    #[serde(default)]
    pub seed_hash: Option<String>,
}

/// Outcome of an upstream `submit`.
#[derive(Debug, Clone, Copy)]
pub struct SubmitAck {
    pub accepted: bool,
    /// Set when the pool flags the share as a full block solve.
    pub block_found: bool,
}

/// Pools answer `submit` with `{"status": "OK"}` (optionally `"block": true`);
/// some older ones reply with a bare boolean.
pub fn parse_submit_ack(result: &Value) -> SubmitAck {
    match result {
        Value::Bool(b) => SubmitAck { accepted: *b, block_found: false },
        Value::Object(obj) => {
            let accepted = obj
                .get("status")
                .and_then(|s| s.as_str())
                .map(|s| s.eq_ignore_ascii_case("ok"))
                .unwrap_or(false);
            let block_found =
                accepted && obj.get("block").and_then(|b| b.as_bool()).unwrap_or(false);
            SubmitAck { accepted, block_found }
        }
        _ => SubmitAck { accepted: false, block_found: false },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_request_shape() {
        let req = PoolRequest::login(1, "wallet-x", "secret");
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["method"], "login");
        assert_eq!(json["params"]["login"], "wallet-x");
        assert_eq!(json["params"]["pass"], "secret");
        assert!(json["params"]["agent"].as_str().unwrap().starts_with("coopmine-coordinator/"));
    }

    #[test]
    fn submit_nonce_is_eight_hex_chars() {
        let req = PoolRequest::submit(2, "sess", "j1", 0x1a2b, "cafe");
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["params"]["nonce"], "00001a2b");
    }

    #[test]
    fn notification_and_response_both_parse() {
        let notif: PoolMessage = serde_json::from_str(
            r#"{"method":"job","params":{"job_id":"j2","blob":"ab","target":"ff","height":7,"seed_hash":"00"}}"#,
        )
        .unwrap();
        assert_eq!(notif.method.as_deref(), Some("job"));
        let params: JobParams = serde_json::from_value(notif.params.unwrap()).unwrap();
        assert_eq!(params.job_id, "j2");
        assert_eq!(params.height, 7);

        let resp: PoolMessage =
            serde_json::from_str(r#"{"id":4,"result":{"status":"OK"},"error":null}"#).unwrap();
        assert_eq!(resp.id, Some(4));
        assert!(parse_submit_ack(resp.result.as_ref().unwrap()).accepted);
    }

    #[test]
    fn submit_ack_shapes() {
        assert!(!parse_submit_ack(&serde_json::json!({"status": "INVALID"})).accepted);
        assert!(!parse_submit_ack(&serde_json::json!(false)).accepted);
        assert!(parse_submit_ack(&serde_json::json!(true)).accepted);
        assert!(parse_submit_ack(&serde_json::json!({"status": "ok"})).accepted);
        assert!(!parse_submit_ack(&serde_json::json!("OK")).accepted);

        let block = parse_submit_ack(&serde_json::json!({"status": "OK", "block": true}));
        assert!(block.accepted && block.block_found);
        // A rejected share is never a block, whatever the pool claims.
        let odd = parse_submit_ack(&serde_json::json!({"status": "NO", "block": true}));
        assert!(!odd.accepted && !odd.block_found);
    }
}
