//! Initiator-to-node transport contract.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dfq_common::{DfqError, JobId, NodeId, Result};
use dfq_planner::FetchPhase;

use crate::node_fetch::NodeFetchService;
use crate::protocol::{NodeFetchRequest, NodeFetchResponse};

#[async_trait]
/// Delivery of fetch phase setup and node fetch requests to nodes.
pub trait FetchTransport: Send + Sync {
    /// Send one node fetch request and wait for its response.
    async fn node_fetch(&self, node: &NodeId, request: NodeFetchRequest)
    -> Result<NodeFetchResponse>;
    /// Register a fetch phase definition on `node` at job setup.
    async fn setup_phase(&self, node: &NodeId, job_id: JobId, phase: &FetchPhase) -> Result<()>;
}

#[derive(Debug, Clone, Default)]
/// In-process adapter for embedded clusters and tests.
pub struct InProcessFetchTransport {
    nodes: HashMap<NodeId, Arc<NodeFetchService>>,
}

impl InProcessFetchTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_node(mut self, service: Arc<NodeFetchService>) -> Self {
        self.nodes.insert(service.node().clone(), service);
        self
    }

    fn service(&self, node: &NodeId) -> Result<&Arc<NodeFetchService>> {
        self.nodes
            .get(node)
            .ok_or_else(|| DfqError::Transport(format!("node {node} is not reachable")))
    }
}

#[async_trait]
impl FetchTransport for InProcessFetchTransport {
    async fn node_fetch(
        &self,
        node: &NodeId,
        request: NodeFetchRequest,
    ) -> Result<NodeFetchResponse> {
        self.service(node)?.handle(request).await
    }

    async fn setup_phase(&self, node: &NodeId, job_id: JobId, phase: &FetchPhase) -> Result<()> {
        self.service(node)?.setup_phase(job_id, phase)
    }
}
