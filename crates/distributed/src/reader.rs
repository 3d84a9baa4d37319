//! Underlying row resolver boundary.
//!
//! A [`FetchReader`] resolves fetch ids of one table into rows of raw column
//! values. How bytes are read is up to the implementation; the node fetch
//! path only relies on `resolve` being callable from several threads and on
//! `close` being called exactly once, when the owning job fetch context is
//! destroyed.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dfq_common::{
    DfqError, FetchId, FetchPhaseId, JobId, ReaderId, Result, Row, ScalarValue, TableIdent,
};
use dfq_planner::Reference;
use serde::Deserialize;

/// Open reader for one table within one (job, fetch phase).
pub trait FetchReader: Send + Sync {
    /// Resolve one fetch id into a row laid out like the reader's columns.
    fn resolve(&self, fetch_id: FetchId) -> Result<Row>;

    /// Resolve `ids` in order; any single failure fails the whole call.
    fn resolve_many(&self, ids: &[FetchId]) -> Result<Vec<Row>> {
        ids.iter().map(|id| self.resolve(*id)).collect()
    }

    /// Release whatever the reader holds open.
    fn close(&self);
}

/// Opens [`FetchReader`]s when a job fetch context is materialized.
pub trait FetchReaderFactory: Send + Sync {
    fn open(
        &self,
        job_id: JobId,
        fetch_phase_id: FetchPhaseId,
        table: &TableIdent,
        columns: &[Reference],
    ) -> Result<Arc<dyn FetchReader>>;
}

/// Document store keyed by fetch id, with one named-column map per document.
///
/// Tracks reader open/close counts so tests can check that contexts release
/// exactly what they opened.
#[derive(Debug, Default)]
pub struct InMemoryTableStore {
    tables: HashMap<TableIdent, HashMap<FetchId, HashMap<String, ScalarValue>>>,
    opened: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
}

#[derive(Debug, Deserialize)]
struct StoreFile {
    tables: Vec<StoreTable>,
}

#[derive(Debug, Deserialize)]
struct StoreTable {
    table: String,
    reader_id: u32,
    docs: Vec<HashMap<String, ScalarValue>>,
}

impl InMemoryTableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert one document; columns missing from `doc` resolve to null.
    pub fn insert(
        &mut self,
        table: &TableIdent,
        fetch_id: FetchId,
        doc: impl IntoIterator<Item = (String, ScalarValue)>,
    ) {
        self.tables
            .entry(table.clone())
            .or_default()
            .insert(fetch_id, doc.into_iter().collect());
    }

    /// Load a store from a JSON file of the form
    /// `{"tables": [{"table": "doc.t", "reader_id": 1, "docs": [{"col": {"Int64": 1}}]}]}`.
    ///
    /// Documents get doc ids `0..n` within their reader.
    pub fn load_json(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path)?;
        let file: StoreFile = serde_json::from_slice(&raw).map_err(|e| {
            DfqError::InvalidConfig(format!("invalid store file {}: {e}", path.display()))
        })?;
        let mut store = Self::new();
        for t in file.tables {
            let table = TableIdent::parse(&t.table);
            for (doc_id, doc) in t.docs.into_iter().enumerate() {
                store.insert(&table, FetchId::new(ReaderId(t.reader_id), doc_id as u32), doc);
            }
        }
        Ok(store)
    }

    pub fn opened_readers(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed_readers(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

impl FetchReaderFactory for InMemoryTableStore {
    fn open(
        &self,
        _job_id: JobId,
        _fetch_phase_id: FetchPhaseId,
        table: &TableIdent,
        columns: &[Reference],
    ) -> Result<Arc<dyn FetchReader>> {
        let docs = self
            .tables
            .get(table)
            .cloned()
            .ok_or_else(|| DfqError::Resolution(format!("table {table} is not stored on this node")))?;
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(InMemoryReader {
            table: table.clone(),
            columns: columns.iter().map(|c| c.column().sql_fqn()).collect(),
            docs,
            closed: Arc::clone(&self.closed),
        }))
    }
}

struct InMemoryReader {
    table: TableIdent,
    columns: Vec<String>,
    docs: HashMap<FetchId, HashMap<String, ScalarValue>>,
    closed: Arc<AtomicUsize>,
}

impl FetchReader for InMemoryReader {
    fn resolve(&self, fetch_id: FetchId) -> Result<Row> {
        let doc = self.docs.get(&fetch_id).ok_or_else(|| {
            DfqError::Resolution(format!("fetch id {fetch_id} not found in {}", self.table))
        })?;
        Ok(self
            .columns
            .iter()
            .map(|c| doc.get(c).cloned().unwrap_or(ScalarValue::Null))
            .collect())
    }

    fn close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use arrow_schema::DataType;
    use dfq_planner::{ColumnIdent, RowGranularity};

    use super::*;

    fn col(table: &TableIdent, name: &str, dt: DataType) -> Reference {
        Reference::new(table.clone(), ColumnIdent::new(name), RowGranularity::Doc, dt)
    }

    #[test]
    fn reader_projects_requested_columns_in_order() {
        let t = TableIdent::new("doc", "t");
        let mut store = InMemoryTableStore::new();
        let id = FetchId::new(ReaderId(1), 7);
        store.insert(
            &t,
            id,
            [
                ("a".to_string(), ScalarValue::Int64(1)),
                ("b".to_string(), ScalarValue::Utf8("x".to_string())),
            ],
        );
        let reader = store
            .open(
                JobId(1),
                FetchPhaseId(1),
                &t,
                &[
                    col(&t, "b", DataType::Utf8),
                    col(&t, "missing", DataType::Int64),
                    col(&t, "a", DataType::Int64),
                ],
            )
            .expect("open");
        assert_eq!(
            reader.resolve(id).expect("resolve"),
            vec![
                ScalarValue::Utf8("x".to_string()),
                ScalarValue::Null,
                ScalarValue::Int64(1)
            ]
        );
        assert!(matches!(
            reader.resolve(FetchId::new(ReaderId(1), 8)),
            Err(DfqError::Resolution(_))
        ));
        reader.close();
        assert_eq!(store.opened_readers(), 1);
        assert_eq!(store.closed_readers(), 1);
    }

    #[test]
    fn load_json_assigns_doc_ids_per_reader() {
        let path = std::env::temp_dir().join(format!("dfq_store_{}.json", std::process::id()));
        let mut f = std::fs::File::create(&path).expect("create");
        f.write_all(
            br#"{"tables":[{"table":"doc.users","reader_id":3,"docs":[{"name":{"Utf8":"ann"}},{"name":{"Utf8":"bob"}}]}]}"#,
        )
        .expect("write");
        let store = InMemoryTableStore::load_json(&path).expect("load");
        let _ = std::fs::remove_file(&path);

        let t = TableIdent::new("doc", "users");
        let reader = store
            .open(JobId(1), FetchPhaseId(1), &t, &[col(&t, "name", DataType::Utf8)])
            .expect("open");
        assert_eq!(
            reader.resolve(FetchId::new(ReaderId(3), 1)).expect("resolve"),
            vec![ScalarValue::Utf8("bob".to_string())]
        );
    }
}
