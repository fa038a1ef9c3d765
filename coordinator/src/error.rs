//! Error taxonomy for the coordinator.
//!
//! Domain-level share classifications are NOT errors — see
//! [`crate::shares::ShareOutcome`]. The types here cover registry lookups,
//! upstream transport, and protocol faults that propagate as `Result`s.

use thiserror::Error;

/// Why a job lookup failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum JobLookupError {
    /// The job was known but is no longer accepted (expired or superseded
    /// past the stale-job grace period).
    #[error("stale job")]
    Stale,

    /// The job id was never seen (or fell out of the history ring).
    #[error("unknown job")]
    Unknown,
}

/// Worker registry failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// Registration attempted for an id that is active (not `Offline`).
    #[error("worker id '{0}' is already in use")]
    IdInUse(String),

    #[error("unknown worker '{0}'")]
    UnknownWorker(String),

    /// All nonce slabs are assigned.
    #[error("nonce space exhausted")]
    NonceSpaceExhausted,
}

/// Upstream client failures.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("not connected to upstream pool")]
    NotConnected,

    /// The request was written but no response arrived in time. For submits
    /// this is final: the share is never retried on a later session.
    #[error("upstream request timed out")]
    Timeout,

    /// The pool answered with a structured JSON-RPC error.
    #[error("upstream error {code}: {message}")]
    Rpc { code: i32, message: String },

    #[error("upstream protocol violation: {0}")]
    Protocol(String),

    #[error("upstream i/o: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_is_stable() {
        assert_eq!(JobLookupError::Stale.to_string(), "stale job");
        assert_eq!(
            RegistryError::IdInUse("rig-7".into()).to_string(),
            "worker id 'rig-7' is already in use"
        );
        let e = UpstreamError::Rpc { code: 23, message: "low difficulty".into() };
        assert_eq!(e.to_string(), "upstream error 23: low difficulty");
    }
}
