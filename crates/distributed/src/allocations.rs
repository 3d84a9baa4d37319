//! Reader allocations: where each fetch id lives.
//!
//! The query phase assigns a reader id to every (table, partition) source it
//! opens on a node. The initiator uses the allocations to route fetch ids to
//! nodes and as the partition-identity lookup: partition column values come
//! from the allocation, without a node round trip.

use std::collections::{BTreeMap, BTreeSet};

use dfq_common::{DfqError, FetchId, NodeId, ReaderId, Result, Row, TableIdent};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReaderAllocation {
    pub node: NodeId,
    pub table: TableIdent,
    /// Values of the table's partition columns, in `partitioned_by` order.
    pub partition_values: Row,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReaderAllocations {
    readers: BTreeMap<ReaderId, ReaderAllocation>,
}

impl ReaderAllocations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a reader; re-registering an id with different data is an error.
    pub fn add(
        &mut self,
        reader: ReaderId,
        node: NodeId,
        table: TableIdent,
        partition_values: Row,
    ) -> Result<()> {
        let allocation = ReaderAllocation {
            node,
            table,
            partition_values,
        };
        if let Some(existing) = self.readers.get(&reader) {
            if existing != &allocation {
                return Err(DfqError::Execution(format!(
                    "reader {reader} already allocated to {} on {}",
                    existing.table, existing.node
                )));
            }
            return Ok(());
        }
        self.readers.insert(reader, allocation);
        Ok(())
    }

    pub fn get(&self, reader: ReaderId) -> Option<&ReaderAllocation> {
        self.readers.get(&reader)
    }

    /// Allocation owning `fetch_id`.
    pub fn locate(&self, fetch_id: FetchId) -> Result<&ReaderAllocation> {
        self.readers.get(&fetch_id.reader_id()).ok_or_else(|| {
            DfqError::Execution(format!(
                "fetch id {fetch_id} refers to unknown reader {}",
                fetch_id.reader_id()
            ))
        })
    }

    pub fn partition_values(&self, fetch_id: FetchId) -> Result<&Row> {
        Ok(&self.locate(fetch_id)?.partition_values)
    }

    /// Every node holding at least one reader.
    pub fn nodes(&self) -> BTreeSet<NodeId> {
        self.readers.values().map(|a| a.node.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use dfq_common::ScalarValue;

    use super::*;

    #[test]
    fn locates_owner_and_partition_values() {
        let mut allocations = ReaderAllocations::new();
        let t = TableIdent::new("doc", "events");
        allocations
            .add(
                ReaderId(4),
                NodeId::new("n2"),
                t.clone(),
                vec![ScalarValue::Utf8("2024-01".to_string())],
            )
            .expect("add");
        let id = FetchId::new(ReaderId(4), 17);
        let owner = allocations.locate(id).expect("locate");
        assert_eq!(owner.node, NodeId::new("n2"));
        assert_eq!(owner.table, t);
        assert_eq!(
            allocations.partition_values(id).expect("partition"),
            &vec![ScalarValue::Utf8("2024-01".to_string())]
        );
        assert!(allocations.locate(FetchId::new(ReaderId(5), 0)).is_err());
    }

    #[test]
    fn conflicting_registration_is_rejected() {
        let mut allocations = ReaderAllocations::new();
        let t = TableIdent::new("doc", "t");
        allocations
            .add(ReaderId(1), NodeId::new("n1"), t.clone(), Vec::new())
            .expect("add");
        allocations
            .add(ReaderId(1), NodeId::new("n1"), t.clone(), Vec::new())
            .expect("same registration");
        assert!(
            allocations
                .add(ReaderId(1), NodeId::new("n2"), t, Vec::new())
                .is_err()
        );
        assert_eq!(allocations.nodes().len(), 1);
    }
}
