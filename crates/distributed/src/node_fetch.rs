//! Node fetch executor.
//!
//! Entry point for node fetch requests on one node: lazily opens the job
//! fetch context on the first resolve, resolves requested ids per table, and
//! tears the context down on a close request.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use dfq_common::metrics::global_metrics;
use dfq_common::{FetchPhaseId, JobId, NodeId, Result, Row, TableIdent};
use dfq_planner::FetchPhase;
use tracing::{debug, warn};

use crate::admission::RequestAdmission;
use crate::context::{JobFetchContext, JobFetchContextService};
use crate::protocol::{IdsByTable, NODE_FETCH_ACTION, NodeFetchRequest, NodeFetchResponse};

/// Name the fetch phase setup action is registered under.
pub const SETUP_PHASE_ACTION: &str = "dfq/fetch/setup";

#[derive(Debug, Clone)]
pub struct NodeFetchOperation {
    contexts: Arc<JobFetchContextService>,
}

impl NodeFetchOperation {
    pub fn new(contexts: Arc<JobFetchContextService>) -> Self {
        Self { contexts }
    }

    pub fn contexts(&self) -> &Arc<JobFetchContextService> {
        &self.contexts
    }

    pub fn setup_phase(&self, job_id: JobId, phase: &FetchPhase) -> Result<()> {
        self.contexts.setup_phase(job_id, phase)
    }

    /// Resolve `to_fetch`, or destroy the context when `close` is set.
    ///
    /// A close returns no buckets and succeeds whether or not the context
    /// exists.
    pub async fn fetch(
        &self,
        job_id: JobId,
        fetch_phase_id: FetchPhaseId,
        to_fetch: &IdsByTable,
        close: bool,
    ) -> Result<BTreeMap<TableIdent, Vec<Row>>> {
        Ok(self
            .run(job_id, fetch_phase_id, to_fetch, close)
            .await?
            .map(|(_, rows)| rows)
            .unwrap_or_default())
    }

    /// Same as [`Self::fetch`], with buckets encoded for the wire.
    pub async fn fetch_response(&self, request: &NodeFetchRequest) -> Result<NodeFetchResponse> {
        match self
            .run(
                request.job_id,
                request.fetch_phase_id,
                &request.to_fetch,
                request.close_context,
            )
            .await?
        {
            Some((ctx, rows)) => NodeFetchResponse::for_sending(&rows, ctx.streamers()),
            None => Ok(NodeFetchResponse::empty()),
        }
    }

    async fn run(
        &self,
        job_id: JobId,
        fetch_phase_id: FetchPhaseId,
        to_fetch: &IdsByTable,
        close: bool,
    ) -> Result<Option<(Arc<JobFetchContext>, BTreeMap<TableIdent, Vec<Row>>)>> {
        let node = self.contexts.node().0.as_str();
        let started = Instant::now();
        if close {
            if to_fetch.values().any(|ids| !ids.is_empty()) {
                warn!(
                    node,
                    job_id = %job_id,
                    fetch_phase_id = %fetch_phase_id,
                    "close request carried fetch ids; ignoring them"
                );
            }
            self.contexts.close(job_id, fetch_phase_id).await;
            global_metrics().record_fetch_request(node, "close", started.elapsed().as_secs_f64());
            return Ok(None);
        }

        let ctx = self.contexts.get_or_open(job_id, fetch_phase_id)?;
        let rows = ctx.resolve(to_fetch).await?;
        let metrics = global_metrics();
        for (table, bucket) in &rows {
            metrics.record_fetch_rows(node, &table.to_string(), bucket.len() as u64);
        }
        metrics.record_fetch_request(node, "resolve", started.elapsed().as_secs_f64());
        debug!(
            node,
            job_id = %job_id,
            fetch_phase_id = %fetch_phase_id,
            tables = rows.len(),
            rows = rows.values().map(Vec::len).sum::<usize>(),
            "resolved fetch ids"
        );
        Ok(Some((ctx, rows)))
    }
}

/// Node-side handler combining admission with the fetch operation.
#[derive(Debug, Clone)]
pub struct NodeFetchService {
    operation: NodeFetchOperation,
    admission: RequestAdmission,
}

impl NodeFetchService {
    pub fn new(operation: NodeFetchOperation, admission: RequestAdmission) -> Self {
        Self {
            operation,
            admission,
        }
    }

    pub fn node(&self) -> &NodeId {
        self.operation.contexts().node()
    }

    pub fn operation(&self) -> &NodeFetchOperation {
        &self.operation
    }

    /// Handle one node fetch request. Never shed.
    pub async fn handle(&self, request: NodeFetchRequest) -> Result<NodeFetchResponse> {
        let _permit = self.admission.admit(NODE_FETCH_ACTION, true)?;
        self.operation.fetch_response(&request).await
    }

    pub fn setup_phase(&self, job_id: JobId, phase: &FetchPhase) -> Result<()> {
        let _permit = self.admission.admit(SETUP_PHASE_ACTION, false)?;
        self.operation.setup_phase(job_id, phase)
    }
}
