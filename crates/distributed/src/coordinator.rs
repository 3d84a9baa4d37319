//! Initiator-side fetch coordination.
//!
//! A [`FetchPhaseSession`] covers one (job, fetch phase) at the initiator:
//! - `fetch` sends one node fetch request per target node in parallel and
//!   unions the decoded buckets per table;
//! - `close` sends a close request to every node that was contacted or that
//!   took part in the query phase, exactly once per session.
//!
//! Failure of any node fails the whole `fetch` call; the session still has to
//! be closed by the caller.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dfq_common::{DfqError, FetchConfig, FetchPhaseId, JobId, NodeId, Result, Row, TableIdent};
use dfq_planner::FetchPhase;
use futures::future::{join_all, try_join_all};
use tracing::{debug, info, warn};

use crate::protocol::{IdsByTable, NodeFetchRequest};
use crate::streamer::TableStreamers;
use crate::transport::FetchTransport;

/// Fetch ids to resolve, grouped by target node and table.
pub type IdsByNode = BTreeMap<NodeId, IdsByTable>;

#[derive(Debug)]
pub struct FetchCoordinator<T: FetchTransport> {
    transport: Arc<T>,
    config: FetchConfig,
}

impl<T: FetchTransport> Clone for FetchCoordinator<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            config: self.config.clone(),
        }
    }
}

impl<T: FetchTransport + 'static> FetchCoordinator<T> {
    pub fn new(transport: Arc<T>, config: FetchConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { transport, config })
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// Register the phase definition on every node at job setup.
    pub async fn setup_phase(
        &self,
        job_id: JobId,
        phase: &FetchPhase,
        nodes: &BTreeSet<NodeId>,
    ) -> Result<()> {
        try_join_all(
            nodes
                .iter()
                .map(|node| self.transport.setup_phase(node, job_id, phase)),
        )
        .await?;
        debug!(
            job_id = %job_id,
            fetch_phase_id = %phase.phase_id,
            nodes = nodes.len(),
            "fetch phase set up"
        );
        Ok(())
    }

    /// Start a session for one fetch phase.
    ///
    /// `execution_nodes` are the nodes that ran the query phase; they receive
    /// a close request even if no id is ever fetched from them.
    pub fn session(
        &self,
        job_id: JobId,
        fetch_phase_id: FetchPhaseId,
        streamers: TableStreamers,
        execution_nodes: BTreeSet<NodeId>,
    ) -> FetchPhaseSession<T> {
        FetchPhaseSession {
            transport: Arc::clone(&self.transport),
            job_id,
            fetch_phase_id,
            streamers,
            timeout: (self.config.request_timeout_ms > 0)
                .then(|| Duration::from_millis(self.config.request_timeout_ms)),
            contacted: Mutex::new(execution_nodes),
            closed: AtomicBool::new(false),
        }
    }
}

#[derive(Debug)]
pub struct FetchPhaseSession<T: FetchTransport> {
    transport: Arc<T>,
    job_id: JobId,
    fetch_phase_id: FetchPhaseId,
    streamers: TableStreamers,
    timeout: Option<Duration>,
    contacted: Mutex<BTreeSet<NodeId>>,
    closed: AtomicBool,
}

impl<T: FetchTransport> FetchPhaseSession<T> {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn fetch_phase_id(&self) -> FetchPhaseId {
        self.fetch_phase_id
    }

    pub fn streamers(&self) -> &TableStreamers {
        &self.streamers
    }

    /// Nodes that will receive a close request.
    pub fn contacted_nodes(&self) -> BTreeSet<NodeId> {
        self.contacted
            .lock()
            .expect("session lock poisoned")
            .clone()
    }

    /// Resolve ids on every node in parallel.
    ///
    /// Buckets from different nodes are appended per table in node order; each
    /// node's bucket keeps its request order.
    pub async fn fetch(&self, ids_by_node: &IdsByNode) -> Result<BTreeMap<TableIdent, Vec<Row>>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DfqError::Execution(format!(
                "fetch phase {} of job {} already closed",
                self.fetch_phase_id, self.job_id
            )));
        }
        {
            let mut contacted = self.contacted.lock().expect("session lock poisoned");
            contacted.extend(ids_by_node.keys().cloned());
        }
        let calls = ids_by_node
            .iter()
            .map(|(node, to_fetch)| self.fetch_from(node, to_fetch));
        let per_node = try_join_all(calls).await?;

        let mut out: BTreeMap<TableIdent, Vec<Row>> = BTreeMap::new();
        for buckets in per_node {
            for (table, rows) in buckets {
                out.entry(table).or_default().extend(rows);
            }
        }
        Ok(out)
    }

    async fn fetch_from(
        &self,
        node: &NodeId,
        to_fetch: &IdsByTable,
    ) -> Result<BTreeMap<TableIdent, Vec<Row>>> {
        let request = NodeFetchRequest::resolve(self.job_id, self.fetch_phase_id, to_fetch.clone());
        let response = self.call(node, request).await?;
        let buckets = response.decode(&self.streamers)?;
        for (table, ids) in to_fetch {
            let got = buckets.get(table).map_or(0, Vec::len);
            if got != ids.len() {
                return Err(DfqError::Resolution(format!(
                    "node {node} returned {got} rows for {} requested ids of {table}",
                    ids.len()
                )));
            }
        }
        debug!(
            node = %node,
            job_id = %self.job_id,
            fetch_phase_id = %self.fetch_phase_id,
            ids = to_fetch.values().map(Vec::len).sum::<usize>(),
            "node fetch completed"
        );
        Ok(buckets)
    }

    async fn call(
        &self,
        node: &NodeId,
        request: NodeFetchRequest,
    ) -> Result<crate::protocol::NodeFetchResponse> {
        let call = self.transport.node_fetch(node, request);
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, call).await.map_err(|_| {
                DfqError::Transport(format!(
                    "node fetch to {node} timed out after {}ms",
                    limit.as_millis()
                ))
            })?,
            None => call.await,
        }
    }

    /// Send a close request to every contacted node.
    ///
    /// Only the first call sends anything. All nodes are asked even if some
    /// fail; the first failure is returned.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let nodes = self.contacted_nodes();
        let results = join_all(nodes.iter().map(|node| async move {
            let request = NodeFetchRequest::close(self.job_id, self.fetch_phase_id);
            (node, self.call(node, request).await)
        }))
        .await;

        let mut first_err = None;
        for (node, result) in results {
            if let Err(e) = result {
                warn!(
                    node = %node,
                    job_id = %self.job_id,
                    fetch_phase_id = %self.fetch_phase_id,
                    error = %e,
                    "failed to close job fetch context"
                );
                first_err.get_or_insert(e);
            }
        }
        info!(
            job_id = %self.job_id,
            fetch_phase_id = %self.fetch_phase_id,
            nodes = nodes.len(),
            "fetch phase closed"
        );
        first_err.map_or(Ok(()), Err)
    }
}
