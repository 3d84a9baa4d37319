//! Bounded request admission for node-side actions.
//!
//! Sheddable actions take a slot or fail fast with `Overloaded`. Forced
//! actions always run: they take a slot when one is free and otherwise run
//! outside the bound. Node fetch requests are always forced, because a shed
//! close request would leave the job fetch context open.

use std::sync::Arc;

use dfq_common::metrics::global_metrics;
use dfq_common::{DfqError, NodeId, Result};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// Held for the duration of one admitted request.
#[derive(Debug)]
pub struct AdmissionPermit(Option<OwnedSemaphorePermit>);

impl AdmissionPermit {
    /// Whether this request occupies one of the bounded slots.
    pub fn is_bounded(&self) -> bool {
        self.0.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct RequestAdmission {
    node: NodeId,
    capacity: usize,
    slots: Arc<Semaphore>,
}

impl RequestAdmission {
    pub fn new(node: NodeId, max_concurrent_requests: usize) -> Self {
        Self {
            node,
            capacity: max_concurrent_requests,
            slots: Arc::new(Semaphore::new(max_concurrent_requests)),
        }
    }

    pub fn admit(&self, action: &str, force: bool) -> Result<AdmissionPermit> {
        match Arc::clone(&self.slots).try_acquire_owned() {
            Ok(permit) => Ok(AdmissionPermit(Some(permit))),
            Err(_) if force => {
                debug!(
                    node = %self.node,
                    action,
                    "all request slots busy; running forced action"
                );
                Ok(AdmissionPermit(None))
            }
            Err(_) => {
                global_metrics().inc_requests_rejected(&self.node.0, action);
                Err(DfqError::Overloaded(format!(
                    "node {} rejected {action}: all {} request slots busy",
                    self.node, self.capacity
                )))
            }
        }
    }

    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forced_actions_bypass_a_full_executor() {
        let admission = RequestAdmission::new(NodeId::new("n1"), 1);
        let held = admission.admit("dfq/setup", false).expect("first slot");
        assert!(held.is_bounded());
        assert_eq!(admission.available(), 0);

        let err = admission.admit("dfq/setup", false).expect_err("shed");
        assert!(matches!(err, DfqError::Overloaded(_)));
        assert!(err.is_retryable());

        let forced = admission.admit("dfq/fetch/node", true).expect("forced");
        assert!(!forced.is_bounded());

        drop(held);
        assert_eq!(admission.available(), 1);
    }
}
