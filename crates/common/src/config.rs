use serde::{Deserialize, Serialize};

use crate::error::{DfqError, Result};

/// Fetch push-down runtime configuration shared by initiator and node sides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Max fetch ids per table in one node request.
    pub fetch_size: usize,
    /// Executor slots on a node; sheddable actions are rejected once exhausted.
    pub max_concurrent_requests: usize,
    /// Number of closed (job, phase) tombstones a node remembers.
    pub closed_context_retention: usize,
    /// Per node-call timeout in milliseconds; `0` disables the timeout.
    pub request_timeout_ms: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            fetch_size: 500,
            max_concurrent_requests: 16,
            closed_context_retention: 4096,
            request_timeout_ms: 30_000,
        }
    }
}

impl FetchConfig {
    /// Reject settings that would stall fetch phases.
    pub fn validate(&self) -> Result<()> {
        if self.fetch_size == 0 {
            return Err(DfqError::InvalidConfig(
                "fetch_size must be greater than zero".to_string(),
            ));
        }
        if self.max_concurrent_requests == 0 {
            return Err(DfqError::InvalidConfig(
                "max_concurrent_requests must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::FetchConfig;

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg: FetchConfig =
            serde_json::from_str(r#"{"fetch_size": 32}"#).expect("parse config");
        assert_eq!(cfg.fetch_size, 32);
        assert_eq!(cfg.max_concurrent_requests, 16);
        cfg.validate().expect("valid");
    }

    #[test]
    fn zero_fetch_size_is_rejected() {
        let cfg = FetchConfig {
            fetch_size: 0,
            ..FetchConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
