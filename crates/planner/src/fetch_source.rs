//! Per-table record of what the fetch phase must resolve.

use std::collections::{BTreeMap, HashMap};

use dfq_common::{DfqError, FetchPhaseId, Result, TableIdent};
use serde::{Deserialize, Serialize};

use crate::symbol::{Reference, RowGranularity, Symbol};

/// What one table contributes to a fetch phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchSource {
    /// Flattened positions holding this table's fetch ids, in allocation order.
    fetch_id_cols: Vec<usize>,
    /// Document-granularity columns read from storage, in registration order.
    references: Vec<Reference>,
    /// Partition-identity columns, known from the fetch id's partition without I/O.
    partitioned_by: Vec<Reference>,
}

impl FetchSource {
    fn new(partitioned_by: &[Reference]) -> Self {
        Self {
            fetch_id_cols: Vec::new(),
            references: Vec::new(),
            partitioned_by: partitioned_by.to_vec(),
        }
    }

    pub fn fetch_id_cols(&self) -> &[usize] {
        &self.fetch_id_cols
    }

    pub fn references(&self) -> &[Reference] {
        &self.references
    }

    pub fn partitioned_by(&self) -> &[Reference] {
        &self.partitioned_by
    }

    /// Position of `reference` within a resolved row of this source.
    pub fn reference_index(&self, reference: &Reference) -> Option<usize> {
        self.references.iter().position(|r| r == reference)
    }

    /// Position of a partition column within the partition values of a reader.
    pub fn partition_index(&self, reference: &Reference) -> Option<usize> {
        self.partitioned_by.iter().position(|r| r == reference)
    }
}

/// Builds one [`FetchSource`] per table during a single push-down pass.
#[derive(Debug, Default)]
pub struct FetchSourceRegistry {
    sources: BTreeMap<TableIdent, FetchSource>,
    fetch_id_owner: HashMap<usize, TableIdent>,
}

impl FetchSourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind flattened position `fetch_id_col` to `table`'s fetch id, creating the
    /// table's fetch source on first use.
    pub fn open_source(
        &mut self,
        table: &TableIdent,
        partitioned_by: &[Reference],
        fetch_id_col: usize,
    ) -> Result<()> {
        if let Some(owner) = self.fetch_id_owner.get(&fetch_id_col) {
            if owner != table {
                return Err(DfqError::PlanningInconsistency(format!(
                    "fetch id position {fetch_id_col} already belongs to {owner}, not {table}"
                )));
            }
        }
        let source = self
            .sources
            .entry(table.clone())
            .or_insert_with(|| FetchSource::new(partitioned_by));
        if !source.fetch_id_cols.contains(&fetch_id_col) {
            source.fetch_id_cols.push(fetch_id_col);
        }
        self.fetch_id_owner.insert(fetch_id_col, table.clone());
        Ok(())
    }

    /// Register a fetch reference with the fetch source of its table.
    ///
    /// The source must already be open and the fetch id position must belong
    /// to the same table as the referenced column.
    pub fn allocate(&mut self, fetch_ref: &Symbol) -> Result<()> {
        let Symbol::FetchReference {
            fetch_id,
            reference,
        } = fetch_ref
        else {
            return Err(DfqError::PlanningInconsistency(format!(
                "expected a fetch reference, got {fetch_ref}"
            )));
        };
        let Symbol::InputColumn { index, .. } = fetch_id.as_ref() else {
            return Err(DfqError::PlanningInconsistency(format!(
                "fetch id of {fetch_ref} is not bound to a flattened position"
            )));
        };
        let table = reference.table();
        match self.fetch_id_owner.get(index) {
            Some(owner) if owner == table => {}
            Some(owner) => {
                return Err(DfqError::PlanningInconsistency(format!(
                    "fetch reference to {table} uses the fetch id of {owner}"
                )));
            }
            None => {
                return Err(DfqError::PlanningInconsistency(format!(
                    "no active fetch source for {table}"
                )));
            }
        }
        let source = self.sources.get_mut(table).ok_or_else(|| {
            DfqError::PlanningInconsistency(format!("no active fetch source for {table}"))
        })?;
        if reference.granularity == RowGranularity::Doc && !source.references.contains(reference)
        {
            source.references.push(reference.clone());
        }
        Ok(())
    }

    pub fn get(&self, table: &TableIdent) -> Result<&FetchSource> {
        self.sources.get(table).ok_or_else(|| {
            DfqError::PlanningInconsistency(format!("no active fetch source for {table}"))
        })
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn into_sources(self) -> BTreeMap<TableIdent, FetchSource> {
        self.sources
    }
}

/// The fetch phase definition shipped to nodes at job setup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchPhase {
    pub phase_id: FetchPhaseId,
    pub sources: BTreeMap<TableIdent, FetchSource>,
}

impl FetchPhase {
    pub fn new(phase_id: FetchPhaseId, sources: BTreeMap<TableIdent, FetchSource>) -> Self {
        Self { phase_id, sources }
    }

    /// Columns a node reads per table, in resolved-row order.
    pub fn columns_by_table(&self) -> BTreeMap<TableIdent, Vec<Reference>> {
        self.sources
            .iter()
            .map(|(t, s)| (t.clone(), s.references.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use arrow_schema::DataType;

    use super::*;
    use crate::symbol::ColumnIdent;

    fn reference(table: &str, col: &str, granularity: RowGranularity) -> Reference {
        Reference::new(
            TableIdent::new("doc", table),
            ColumnIdent::new(col),
            granularity,
            DataType::Utf8,
        )
    }

    fn fetch_ref(index: usize, r: Reference) -> Symbol {
        Symbol::FetchReference {
            fetch_id: Box::new(Symbol::input_column(index, DataType::Int64)),
            reference: r,
        }
    }

    #[test]
    fn one_source_per_table_with_deduplicated_references() {
        let t = TableIdent::new("doc", "t");
        let mut reg = FetchSourceRegistry::new();
        reg.open_source(&t, &[], 0).expect("open");
        reg.open_source(&t, &[], 0).expect("reopen is idempotent");
        reg.allocate(&fetch_ref(0, reference("t", "y", RowGranularity::Doc)))
            .expect("allocate y");
        reg.allocate(&fetch_ref(0, reference("t", "y", RowGranularity::Doc)))
            .expect("allocate y again");

        let source = reg.get(&t).expect("source");
        assert_eq!(source.fetch_id_cols(), &[0]);
        assert_eq!(source.references().len(), 1);
    }

    #[test]
    fn partition_references_are_not_read_from_storage() {
        let t = TableIdent::new("doc", "p");
        let day = reference("p", "day", RowGranularity::Partition);
        let mut reg = FetchSourceRegistry::new();
        reg.open_source(&t, std::slice::from_ref(&day), 3).expect("open");
        reg.allocate(&fetch_ref(3, day.clone())).expect("allocate");

        let source = reg.get(&t).expect("source");
        assert!(source.references().is_empty());
        assert_eq!(source.partition_index(&day), Some(0));
    }

    #[test]
    fn fetch_reference_without_open_source_is_inconsistent() {
        let mut reg = FetchSourceRegistry::new();
        let err = reg
            .allocate(&fetch_ref(0, reference("t", "y", RowGranularity::Doc)))
            .expect_err("no source");
        assert!(matches!(err, DfqError::PlanningInconsistency(_)));
    }

    #[test]
    fn fetch_id_of_other_table_is_inconsistent() {
        let mut reg = FetchSourceRegistry::new();
        reg.open_source(&TableIdent::new("doc", "a"), &[], 0)
            .expect("open a");
        reg.open_source(&TableIdent::new("doc", "b"), &[], 1)
            .expect("open b");
        let err = reg
            .allocate(&fetch_ref(1, reference("a", "y", RowGranularity::Doc)))
            .expect_err("mismatched table");
        assert!(matches!(err, DfqError::PlanningInconsistency(_)));
        let err = reg
            .open_source(&TableIdent::new("doc", "b"), &[], 0)
            .expect_err("position owned by a");
        assert!(matches!(err, DfqError::PlanningInconsistency(_)));
    }
}
