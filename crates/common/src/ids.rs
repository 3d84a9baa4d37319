//! Typed identifiers shared across planner, coordinator, and node components.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Distributed query execution identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId(
    /// Raw numeric id value.
    pub u64,
);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Fetch phase identifier within one job. A job may run several fetch phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FetchPhaseId(
    /// Raw numeric id value.
    pub u32,
);

impl fmt::Display for FetchPhaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Cluster node identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(
    /// Node name as registered with cluster membership.
    pub String,
);

impl NodeId {
    /// Build a node id from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of a physical table (`schema.name`).
///
/// Serialized as its `schema.name` string so it can key JSON maps.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub struct TableIdent {
    /// Schema the table lives in.
    pub schema: String,
    /// Table name.
    pub name: String,
}

impl TableIdent {
    /// Build a table identity.
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// Parse `schema.name`; a bare name lands in the `doc` schema.
    pub fn parse(fqn: &str) -> Self {
        match fqn.split_once('.') {
            Some((schema, name)) => Self::new(schema, name),
            None => Self::new("doc", fqn),
        }
    }
}

impl fmt::Display for TableIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

impl From<TableIdent> for String {
    fn from(table: TableIdent) -> Self {
        table.to_string()
    }
}

impl From<String> for TableIdent {
    fn from(fqn: String) -> Self {
        Self::parse(&fqn)
    }
}

/// Identifies one (table, partition) source opened for fetching on one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReaderId(
    /// Raw numeric id value.
    pub u32,
);

impl fmt::Display for ReaderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque per-row locator produced by the query phase.
///
/// Layout: upper 32 bits are the [`ReaderId`], lower 32 bits the document id
/// within that reader. Only valid within the (job, fetch phase) that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FetchId(
    /// Raw encoded value.
    pub u64,
);

impl FetchId {
    /// Encode a reader id and document id.
    pub fn new(reader: ReaderId, doc: u32) -> Self {
        Self((u64::from(reader.0) << 32) | u64::from(doc))
    }

    /// Reader that issued this fetch id.
    pub fn reader_id(self) -> ReaderId {
        ReaderId((self.0 >> 32) as u32)
    }

    /// Document id within the issuing reader.
    pub fn doc_id(self) -> u32 {
        self.0 as u32
    }
}

impl fmt::Display for FetchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.reader_id(), self.doc_id())
    }
}

#[cfg(test)]
mod tests {
    use super::{FetchId, ReaderId, TableIdent};

    #[test]
    fn fetch_id_splits_reader_and_doc() {
        let id = FetchId::new(ReaderId(3), 42);
        assert_eq!(id.reader_id(), ReaderId(3));
        assert_eq!(id.doc_id(), 42);
        assert_eq!(id.0, (3_u64 << 32) | 42);
        assert_eq!(id.to_string(), "3:42");
    }

    #[test]
    fn table_ident_keys_json_maps() {
        let tables = std::collections::BTreeMap::from([(TableIdent::new("doc", "users"), 3_u32)]);
        let json = serde_json::to_string(&tables).expect("encode");
        assert_eq!(json, r#"{"doc.users":3}"#);
        let back: std::collections::BTreeMap<TableIdent, u32> =
            serde_json::from_str(&json).expect("decode");
        assert_eq!(back, tables);
    }

    #[test]
    fn bare_table_name_defaults_to_doc_schema() {
        assert_eq!(TableIdent::parse("t1"), TableIdent::new("doc", "t1"));
        assert_eq!(TableIdent::parse("sys.nodes").to_string(), "sys.nodes");
    }
}
