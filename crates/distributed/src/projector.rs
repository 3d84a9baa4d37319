//! Fetch projector: resolves deferred columns of query-phase rows.
//!
//! Input rows follow the flattened output layout of a push-down plan, with
//! raw fetch ids at each fetch source's fetch id positions. Output rows
//! follow the plan's rewritten top-level outputs.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use dfq_common::{DfqError, FetchId, NodeId, Result, Row, ScalarValue, TableIdent};
use dfq_planner::{FetchPushDownPlan, FetchSource, RowGranularity, Symbol};
use tracing::debug;

use crate::allocations::ReaderAllocations;
use crate::coordinator::{FetchPhaseSession, IdsByNode};
use crate::streamer::{TableStreamers, table_streamers};
use crate::transport::FetchTransport;

#[derive(Debug, Clone, PartialEq)]
enum OutputExpr {
    Input(usize),
    Doc {
        fetch_col: usize,
        table: TableIdent,
        index: usize,
    },
    Partition {
        fetch_col: usize,
        index: usize,
    },
    Constant(ScalarValue),
}

#[derive(Debug)]
pub struct FetchProjector {
    program: Vec<OutputExpr>,
    sources: BTreeMap<TableIdent, FetchSource>,
    allocations: ReaderAllocations,
    streamers: TableStreamers,
    fetch_size: usize,
}

impl FetchProjector {
    pub fn new(
        plan: &FetchPushDownPlan,
        allocations: ReaderAllocations,
        fetch_size: usize,
    ) -> Result<Self> {
        if fetch_size == 0 {
            return Err(DfqError::InvalidConfig(
                "fetch_size must be greater than zero".to_string(),
            ));
        }
        let program = plan
            .remaining_outputs
            .iter()
            .map(|s| compile(s, &plan.fetch_sources))
            .collect::<Result<Vec<_>>>()?;
        let columns = plan
            .fetch_sources
            .iter()
            .map(|(t, s)| (t.clone(), s.references().to_vec()))
            .collect();
        Ok(Self {
            program,
            sources: plan.fetch_sources.clone(),
            allocations,
            streamers: table_streamers(&columns)?,
            fetch_size,
        })
    }

    /// Streamers the fetch phase session must decode responses with.
    pub fn streamers(&self) -> &TableStreamers {
        &self.streamers
    }

    /// Resolve and project `rows`, then close the session whatever the outcome.
    pub async fn execute<T: FetchTransport>(
        &self,
        session: &FetchPhaseSession<T>,
        rows: &[Row],
    ) -> Result<Vec<Row>> {
        let projected = self.project(session, rows).await;
        let closed = session.close().await;
        let projected = projected?;
        closed?;
        Ok(projected)
    }

    /// Resolve and project `rows` without closing the session.
    pub async fn project<T: FetchTransport>(
        &self,
        session: &FetchPhaseSession<T>,
        rows: &[Row],
    ) -> Result<Vec<Row>> {
        let wanted = self.collect_ids(rows)?;
        let resolved = self.resolve(session, wanted).await?;
        rows.iter()
            .map(|row| {
                self.program
                    .iter()
                    .map(|expr| self.evaluate(expr, row, &resolved))
                    .collect::<Result<Row>>()
            })
            .collect()
    }

    fn collect_ids(&self, rows: &[Row]) -> Result<BTreeMap<TableIdent, BTreeSet<FetchId>>> {
        let mut wanted: BTreeMap<TableIdent, BTreeSet<FetchId>> = BTreeMap::new();
        for (table, source) in &self.sources {
            if source.references().is_empty() {
                continue;
            }
            let ids = wanted.entry(table.clone()).or_default();
            for &col in source.fetch_id_cols() {
                for row in rows {
                    if let Some(id) = fetch_id_at(row, col)? {
                        ids.insert(id);
                    }
                }
            }
        }
        wanted.retain(|_, ids| !ids.is_empty());
        Ok(wanted)
    }

    async fn resolve<T: FetchTransport>(
        &self,
        session: &FetchPhaseSession<T>,
        wanted: BTreeMap<TableIdent, BTreeSet<FetchId>>,
    ) -> Result<HashMap<(TableIdent, FetchId), Row>> {
        let mut by_node: BTreeMap<NodeId, BTreeMap<TableIdent, Vec<FetchId>>> = BTreeMap::new();
        for (table, ids) in wanted {
            for id in ids {
                let owner = self.allocations.locate(id)?;
                if owner.table != table {
                    return Err(DfqError::Execution(format!(
                        "fetch id {id} belongs to {} but was read from a {table} fetch id column",
                        owner.table
                    )));
                }
                by_node
                    .entry(owner.node.clone())
                    .or_default()
                    .entry(table.clone())
                    .or_default()
                    .push(id);
            }
        }

        let mut resolved = HashMap::new();
        let mut round = 0;
        loop {
            let batch: IdsByNode = by_node
                .iter()
                .filter_map(|(node, tables)| {
                    let chunk: BTreeMap<TableIdent, Vec<FetchId>> = tables
                        .iter()
                        .filter_map(|(table, ids)| {
                            ids.chunks(self.fetch_size)
                                .nth(round)
                                .map(|c| (table.clone(), c.to_vec()))
                        })
                        .collect();
                    (!chunk.is_empty()).then(|| (node.clone(), chunk))
                })
                .collect();
            if batch.is_empty() {
                break;
            }
            let rows = session.fetch(&batch).await?;
            let mut requested: BTreeMap<&TableIdent, Vec<FetchId>> = BTreeMap::new();
            for tables in batch.values() {
                for (table, ids) in tables {
                    requested.entry(table).or_default().extend(ids);
                }
            }
            for (table, ids) in requested {
                let bucket = rows.get(table).map(Vec::as_slice).unwrap_or_default();
                if bucket.len() != ids.len() {
                    return Err(DfqError::Resolution(format!(
                        "expected {} rows for {table}, got {}",
                        ids.len(),
                        bucket.len()
                    )));
                }
                for (id, row) in ids.into_iter().zip(bucket) {
                    resolved.insert((table.clone(), id), row.clone());
                }
            }
            round += 1;
        }
        debug!(
            job_id = %session.job_id(),
            fetch_phase_id = %session.fetch_phase_id(),
            rounds = round,
            rows = resolved.len(),
            "fetch ids resolved"
        );
        Ok(resolved)
    }

    fn evaluate(
        &self,
        expr: &OutputExpr,
        row: &Row,
        resolved: &HashMap<(TableIdent, FetchId), Row>,
    ) -> Result<ScalarValue> {
        match expr {
            OutputExpr::Input(index) => cell(row, *index).cloned(),
            OutputExpr::Constant(v) => Ok(v.clone()),
            OutputExpr::Doc {
                fetch_col,
                table,
                index,
            } => {
                let Some(id) = fetch_id_at(row, *fetch_col)? else {
                    return Ok(ScalarValue::Null);
                };
                let doc = resolved.get(&(table.clone(), id)).ok_or_else(|| {
                    DfqError::Resolution(format!("fetch id {id} of {table} was not resolved"))
                })?;
                cell(doc, *index).cloned()
            }
            OutputExpr::Partition { fetch_col, index } => {
                let Some(id) = fetch_id_at(row, *fetch_col)? else {
                    return Ok(ScalarValue::Null);
                };
                cell(self.allocations.partition_values(id)?, *index).cloned()
            }
        }
    }
}

fn compile(symbol: &Symbol, sources: &BTreeMap<TableIdent, FetchSource>) -> Result<OutputExpr> {
    match symbol {
        Symbol::InputColumn { index, .. } => Ok(OutputExpr::Input(*index)),
        Symbol::Literal(v) => Ok(OutputExpr::Constant(v.clone())),
        Symbol::FetchReference {
            fetch_id,
            reference,
        } => {
            let Symbol::InputColumn {
                index: fetch_col, ..
            } = fetch_id.as_ref()
            else {
                return Err(DfqError::PlanningInconsistency(format!(
                    "fetch reference {symbol} is not bound to an input column"
                )));
            };
            let table = reference.table();
            let source = sources.get(table).ok_or_else(|| {
                DfqError::PlanningInconsistency(format!("no fetch source for {table}"))
            })?;
            if !source.fetch_id_cols().contains(fetch_col) {
                return Err(DfqError::PlanningInconsistency(format!(
                    "input column {fetch_col} is not a fetch id column of {table}"
                )));
            }
            let missing = || {
                DfqError::PlanningInconsistency(format!(
                    "{} is not registered in the fetch source of {table}",
                    reference.column()
                ))
            };
            match reference.granularity {
                RowGranularity::Doc => Ok(OutputExpr::Doc {
                    fetch_col: *fetch_col,
                    table: table.clone(),
                    index: source.reference_index(reference).ok_or_else(missing)?,
                }),
                RowGranularity::Partition => Ok(OutputExpr::Partition {
                    fetch_col: *fetch_col,
                    index: source.partition_index(reference).ok_or_else(missing)?,
                }),
            }
        }
        Symbol::RelationColumn { .. } | Symbol::Reference(_) | Symbol::Field(_) => Err(
            DfqError::PlanningInconsistency(format!("cannot project unresolved symbol {symbol}")),
        ),
    }
}

fn cell(row: &Row, index: usize) -> Result<&ScalarValue> {
    row.get(index).ok_or_else(|| {
        DfqError::Execution(format!(
            "row has {} columns, column {index} requested",
            row.len()
        ))
    })
}

/// Fetch id stored at `index`; `None` for the null padding of outer joins.
fn fetch_id_at(row: &Row, index: usize) -> Result<Option<FetchId>> {
    let value = cell(row, index)?;
    if value.is_null() {
        return Ok(None);
    }
    value.as_fetch_id().map(Some).ok_or_else(|| {
        DfqError::Execution(format!("column {index} holds {value:?}, not a fetch id"))
    })
}
