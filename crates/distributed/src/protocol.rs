//! Node fetch wire messages.

use std::collections::BTreeMap;

use dfq_common::{DfqError, FetchId, FetchPhaseId, JobId, Result, Row, TableIdent};
use serde::{Deserialize, Serialize};

use crate::streamer::{TableStreamers, decode_bucket, encode_bucket};

/// Name the node fetch action is registered under.
pub const NODE_FETCH_ACTION: &str = "dfq/fetch/node";

/// Fetch ids grouped by the table that owns them.
pub type IdsByTable = BTreeMap<TableIdent, Vec<FetchId>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeFetchRequest {
    pub job_id: JobId,
    pub fetch_phase_id: FetchPhaseId,
    pub to_fetch: IdsByTable,
    /// When set, `to_fetch` is ignored and the job fetch context is torn down.
    pub close_context: bool,
}

impl NodeFetchRequest {
    pub fn resolve(job_id: JobId, fetch_phase_id: FetchPhaseId, to_fetch: IdsByTable) -> Self {
        Self {
            job_id,
            fetch_phase_id,
            to_fetch,
            close_context: false,
        }
    }

    pub fn close(job_id: JobId, fetch_phase_id: FetchPhaseId) -> Self {
        Self {
            job_id,
            fetch_phase_id,
            to_fetch: IdsByTable::new(),
            close_context: true,
        }
    }
}

/// Encoded row buckets keyed like the request's `to_fetch`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeFetchResponse {
    pub buckets: BTreeMap<TableIdent, Vec<u8>>,
}

impl NodeFetchResponse {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn for_sending(
        rows: &BTreeMap<TableIdent, Vec<Row>>,
        streamers: &TableStreamers,
    ) -> Result<Self> {
        let mut buckets = BTreeMap::new();
        for (table, table_rows) in rows {
            let table_streamers = streamers.get(table).ok_or_else(|| {
                DfqError::Execution(format!("no streamers for fetched table {table}"))
            })?;
            buckets.insert(table.clone(), encode_bucket(table_rows, table_streamers)?);
        }
        Ok(Self { buckets })
    }

    /// Decode every bucket with the caller's streamers.
    pub fn decode(&self, streamers: &TableStreamers) -> Result<BTreeMap<TableIdent, Vec<Row>>> {
        let mut out = BTreeMap::new();
        for (table, payload) in &self.buckets {
            let table_streamers = streamers.get(table).ok_or_else(|| {
                DfqError::Execution(format!("response bucket for unexpected table {table}"))
            })?;
            out.insert(table.clone(), decode_bucket(payload, table_streamers)?);
        }
        Ok(out)
    }
}
