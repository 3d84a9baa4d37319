//! Server-side job fetch contexts.
//!
//! One context per (job, fetch phase) per node, with the lifecycle
//! `UNCREATED -> OPEN -> CLOSED`:
//! - setup registers the phase definition but opens nothing;
//! - the first resolve request creates the context (`OPEN`); readers are
//!   opened per table, on the first request that names the table;
//! - a close request destroys the context and leaves a `CLOSED` tombstone, so
//!   a late resolve is answered with `ContextNotFound` instead of reopening.
//!
//! Slot transitions happen under one short node-wide lock that never covers
//! reader I/O. Each resolve holds a shared guard on the context until its last
//! blocking task finishes, and `close` takes the guard exclusively, so readers
//! are never released under a running resolve.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use dfq_common::metrics::global_metrics;
use dfq_common::{DfqError, FetchPhaseId, JobId, NodeId, Result, Row, TableIdent};
use dfq_planner::{FetchPhase, Reference};
use futures::future::try_join_all;
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, info, warn};

use crate::protocol::IdsByTable;
use crate::reader::{FetchReader, FetchReaderFactory};
use crate::streamer::{TableStreamers, table_streamers};

type ContextKey = (JobId, FetchPhaseId);

/// Observable lifecycle state of one (job, fetch phase) on a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Uncreated,
    Open,
    Closed,
}

struct TableReader {
    columns: Vec<Reference>,
    reader: OnceCell<Arc<dyn FetchReader>>,
}

/// Readers for one (job, fetch phase), opened on demand.
pub struct JobFetchContext {
    node: NodeId,
    job_id: JobId,
    fetch_phase_id: FetchPhaseId,
    factory: Arc<dyn FetchReaderFactory>,
    tables: BTreeMap<TableIdent, TableReader>,
    streamers: TableStreamers,
    closed: Arc<RwLock<bool>>,
}

impl std::fmt::Debug for JobFetchContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobFetchContext")
            .field("node", &self.node)
            .field("job_id", &self.job_id)
            .field("fetch_phase_id", &self.fetch_phase_id)
            .field("tables", &self.tables.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl JobFetchContext {
    pub fn streamers(&self) -> &TableStreamers {
        &self.streamers
    }

    fn not_found(&self) -> DfqError {
        DfqError::ContextNotFound {
            job_id: self.job_id,
            fetch_phase_id: self.fetch_phase_id,
        }
    }

    /// Reader for `table`, opened at most once per context.
    async fn reader(&self, table: &TableIdent) -> Result<Arc<dyn FetchReader>> {
        let entry = self.tables.get(table).ok_or_else(|| {
            DfqError::Resolution(format!(
                "table {table} is not part of fetch phase {} of job {}",
                self.fetch_phase_id, self.job_id
            ))
        })?;
        let reader = entry
            .reader
            .get_or_try_init(|| async {
                let factory = Arc::clone(&self.factory);
                let (job_id, fetch_phase_id) = (self.job_id, self.fetch_phase_id);
                let owned_table = table.clone();
                let columns = entry.columns.clone();
                let opened = tokio::task::spawn_blocking(move || {
                    factory.open(job_id, fetch_phase_id, &owned_table, &columns)
                })
                .await
                .map_err(|e| DfqError::Execution(format!("reader open task failed: {e}")))?;
                match &opened {
                    Ok(_) => debug!(
                        node = %self.node,
                        job_id = %job_id,
                        fetch_phase_id = %fetch_phase_id,
                        table = %table,
                        "fetch reader opened"
                    ),
                    Err(e) => warn!(
                        node = %self.node,
                        job_id = %job_id,
                        fetch_phase_id = %fetch_phase_id,
                        table = %table,
                        error = %e,
                        "failed to open fetch reader"
                    ),
                }
                opened
            })
            .await?;
        Ok(Arc::clone(reader))
    }

    /// Resolve every requested id against its owning table.
    ///
    /// Tables are resolved concurrently; each bucket keeps the request order.
    /// Any failure fails the whole call and no partial rows are returned.
    pub async fn resolve(&self, to_fetch: &IdsByTable) -> Result<BTreeMap<TableIdent, Vec<Row>>> {
        let guard = Arc::new(Arc::clone(&self.closed).read_owned().await);
        if **guard {
            return Err(self.not_found());
        }
        let tasks = to_fetch.iter().map(|(table, ids)| {
            let guard = Arc::clone(&guard);
            async move {
                let reader = self.reader(table).await?;
                let ids = ids.clone();
                // the blocking task keeps the context open even if this future is dropped
                let rows = tokio::task::spawn_blocking(move || {
                    let _guard = guard;
                    reader.resolve_many(&ids)
                })
                .await
                .map_err(|e| DfqError::Execution(format!("resolve task failed: {e}")))??;
                Ok::<_, DfqError>((table.clone(), rows))
            }
        });
        let buckets = try_join_all(tasks).await?;
        Ok(buckets.into_iter().collect())
    }

    /// Release the readers opened so far; returns `false` if already closed.
    ///
    /// Waits for running resolves to finish.
    pub async fn close(&self) -> bool {
        let mut closed = self.closed.write().await;
        if *closed {
            return false;
        }
        *closed = true;
        for entry in self.tables.values() {
            if let Some(reader) = entry.reader.get() {
                reader.close();
            }
        }
        true
    }

    /// Number of tables whose reader has been opened.
    pub fn opened_tables(&self) -> usize {
        self.tables
            .values()
            .filter(|t| t.reader.initialized())
            .count()
    }
}

enum Slot {
    Open(Arc<JobFetchContext>),
    Closed,
}

#[derive(Default)]
struct ServiceState {
    phases: HashMap<ContextKey, Arc<PhaseDefinition>>,
    slots: HashMap<ContextKey, Slot>,
    closed_order: VecDeque<ContextKey>,
}

struct PhaseDefinition {
    columns: BTreeMap<TableIdent, Vec<Reference>>,
    streamers: TableStreamers,
}

/// All job fetch contexts of one node.
pub struct JobFetchContextService {
    node: NodeId,
    factory: Arc<dyn FetchReaderFactory>,
    closed_retention: usize,
    state: Mutex<ServiceState>,
}

impl std::fmt::Debug for JobFetchContextService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobFetchContextService")
            .field("node", &self.node)
            .field("closed_retention", &self.closed_retention)
            .finish()
    }
}

impl JobFetchContextService {
    /// `closed_retention` bounds how many `CLOSED` tombstones are remembered.
    pub fn new(
        node: NodeId,
        factory: Arc<dyn FetchReaderFactory>,
        closed_retention: usize,
    ) -> Self {
        Self {
            node,
            factory,
            closed_retention,
            state: Mutex::new(ServiceState::default()),
        }
    }

    pub fn node(&self) -> &NodeId {
        &self.node
    }

    /// Register the table columns of a fetch phase; opens nothing.
    ///
    /// Setup for a key that is already open or closed is ignored.
    pub fn setup_phase(&self, job_id: JobId, phase: &FetchPhase) -> Result<()> {
        let columns = phase.columns_by_table();
        let streamers = table_streamers(&columns)?;
        let key = (job_id, phase.phase_id);
        let mut state = self.state.lock().expect("fetch context lock poisoned");
        if state.slots.contains_key(&key) {
            debug!(
                node = %self.node,
                job_id = %job_id,
                fetch_phase_id = %phase.phase_id,
                "ignoring fetch phase setup for an existing context"
            );
            return Ok(());
        }
        state
            .phases
            .insert(key, Arc::new(PhaseDefinition { columns, streamers }));
        debug!(
            node = %self.node,
            job_id = %job_id,
            fetch_phase_id = %phase.phase_id,
            tables = phase.sources.len(),
            "fetch phase registered"
        );
        Ok(())
    }

    /// Return the context for the key, creating it on first use.
    ///
    /// A closed key, or one that was never set up, is `ContextNotFound`.
    /// Creation does no reader I/O.
    pub fn get_or_open(
        &self,
        job_id: JobId,
        fetch_phase_id: FetchPhaseId,
    ) -> Result<Arc<JobFetchContext>> {
        let key = (job_id, fetch_phase_id);
        let not_found = DfqError::ContextNotFound {
            job_id,
            fetch_phase_id,
        };
        let mut state = self.state.lock().expect("fetch context lock poisoned");
        match state.slots.get(&key) {
            Some(Slot::Open(ctx)) => return Ok(Arc::clone(ctx)),
            Some(Slot::Closed) => return Err(not_found),
            None => {}
        }
        let Some(definition) = state.phases.remove(&key) else {
            return Err(not_found);
        };
        let tables = definition
            .columns
            .iter()
            .map(|(table, columns)| {
                (
                    table.clone(),
                    TableReader {
                        columns: columns.clone(),
                        reader: OnceCell::new(),
                    },
                )
            })
            .collect();
        let ctx = Arc::new(JobFetchContext {
            node: self.node.clone(),
            job_id,
            fetch_phase_id,
            factory: Arc::clone(&self.factory),
            tables,
            streamers: definition.streamers.clone(),
            closed: Arc::new(RwLock::new(false)),
        });
        state.slots.insert(key, Slot::Open(Arc::clone(&ctx)));
        drop(state);

        global_metrics().inc_fetch_contexts_open(&self.node.0);
        info!(
            node = %self.node,
            job_id = %job_id,
            fetch_phase_id = %fetch_phase_id,
            "job fetch context opened"
        );
        Ok(ctx)
    }

    /// Destroy the context for the key if present.
    ///
    /// Closing an unknown or already closed key succeeds; every key ends up
    /// `CLOSED` so later resolves are rejected.
    pub async fn close(&self, job_id: JobId, fetch_phase_id: FetchPhaseId) {
        let key = (job_id, fetch_phase_id);
        let previous = {
            let mut state = self.state.lock().expect("fetch context lock poisoned");
            state.phases.remove(&key);
            let previous = state.slots.insert(key, Slot::Closed);
            if !matches!(previous, Some(Slot::Closed)) {
                state.closed_order.push_back(key);
                self.evict_tombstones(&mut state);
            }
            previous
        };
        match previous {
            Some(Slot::Open(ctx)) => {
                if ctx.close().await {
                    global_metrics().record_fetch_context_closed(&self.node.0);
                    info!(
                        node = %self.node,
                        job_id = %job_id,
                        fetch_phase_id = %fetch_phase_id,
                        "job fetch context closed"
                    );
                }
            }
            Some(Slot::Closed) => {
                debug!(
                    node = %self.node,
                    job_id = %job_id,
                    fetch_phase_id = %fetch_phase_id,
                    "job fetch context already closed"
                );
            }
            None => {
                debug!(
                    node = %self.node,
                    job_id = %job_id,
                    fetch_phase_id = %fetch_phase_id,
                    "closing job fetch context that was never opened"
                );
            }
        }
    }

    fn evict_tombstones(&self, state: &mut ServiceState) {
        while state.closed_order.len() > self.closed_retention {
            let Some(oldest) = state.closed_order.pop_front() else {
                break;
            };
            if matches!(state.slots.get(&oldest), Some(Slot::Closed)) {
                state.slots.remove(&oldest);
            }
        }
    }

    pub fn state(&self, job_id: JobId, fetch_phase_id: FetchPhaseId) -> ContextState {
        let state = self.state.lock().expect("fetch context lock poisoned");
        match state.slots.get(&(job_id, fetch_phase_id)) {
            Some(Slot::Open(_)) => ContextState::Open,
            Some(Slot::Closed) => ContextState::Closed,
            None => ContextState::Uncreated,
        }
    }

    pub fn open_contexts(&self) -> usize {
        let state = self.state.lock().expect("fetch context lock poisoned");
        state
            .slots
            .values()
            .filter(|s| matches!(s, Slot::Open(_)))
            .count()
    }
}
