//! Analyzed relations consumed by fetch push-down.
//!
//! A [`MultiSourceSelect`] joins several named sources; each source is either a
//! queried table ([`QueriedRelation::DocTable`]) or a sub-query exposing only
//! logical columns ([`QueriedRelation::SubQuery`]). Sources are kept in a
//! `BTreeMap` so that iteration order is the sorted qualified-name order.

use std::collections::{BTreeMap, HashSet};

use arrow_schema::DataType;
use dfq_common::TableIdent;
use serde::{Deserialize, Serialize};

use crate::symbol::{
    ColumnIdent, FETCH_ID_COLUMN, Field, QualifiedName, Reference, RowGranularity, Symbol,
};

/// Physical table metadata needed to build fetch references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocTableInfo {
    ident: TableIdent,
    columns: Vec<Reference>,
    partitioned_by: Vec<Reference>,
}

impl DocTableInfo {
    pub fn new(ident: TableIdent) -> Self {
        Self {
            ident,
            columns: Vec::new(),
            partitioned_by: Vec::new(),
        }
    }

    /// Add a document-granularity column.
    pub fn column(mut self, name: &str, data_type: DataType) -> Self {
        self.columns.push(Reference::new(
            self.ident.clone(),
            ColumnIdent::new(name),
            RowGranularity::Doc,
            data_type,
        ));
        self
    }

    /// Add a partition-identity column.
    pub fn partition_column(mut self, name: &str, data_type: DataType) -> Self {
        self.partitioned_by.push(Reference::new(
            self.ident.clone(),
            ColumnIdent::new(name),
            RowGranularity::Partition,
            data_type,
        ));
        self
    }

    pub fn ident(&self) -> &TableIdent {
        &self.ident
    }

    pub fn partitioned_by(&self) -> &[Reference] {
        &self.partitioned_by
    }

    pub fn reference(&self, column: &ColumnIdent) -> Option<&Reference> {
        self.columns
            .iter()
            .chain(self.partitioned_by.iter())
            .find(|r| r.column() == column)
    }

    pub fn fetch_id_reference(&self) -> Reference {
        Reference::new(
            self.ident.clone(),
            ColumnIdent::new(FETCH_ID_COLUMN),
            RowGranularity::Doc,
            DataType::Int64,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
    pub symbols: Vec<Symbol>,
    pub reverse: Vec<bool>,
}

impl OrderBy {
    pub fn new(symbols: Vec<Symbol>, reverse: Vec<bool>) -> Self {
        Self { symbols, reverse }
    }

    pub fn ascending(symbols: Vec<Symbol>) -> Self {
        let reverse = vec![false; symbols.len()];
        Self { symbols, reverse }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QuerySpec {
    pub outputs: Vec<Symbol>,
    pub order_by: Option<OrderBy>,
    pub limit: Option<usize>,
}

impl QuerySpec {
    pub fn new(outputs: Vec<Symbol>) -> Self {
        Self {
            outputs,
            order_by: None,
            limit: None,
        }
    }

    pub fn with_order_by(mut self, order_by: OrderBy) -> Self {
        self.order_by = Some(order_by);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_outputs(&self, outputs: Vec<Symbol>) -> Self {
        Self {
            outputs,
            order_by: self.order_by.clone(),
            limit: self.limit,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum QueriedRelation {
    DocTable {
        table: DocTableInfo,
        query_spec: QuerySpec,
    },
    SubQuery {
        query_spec: QuerySpec,
    },
}

impl QueriedRelation {
    pub fn query_spec(&self) -> &QuerySpec {
        match self {
            Self::DocTable { query_spec, .. } | Self::SubQuery { query_spec } => query_spec,
        }
    }

    pub fn with_outputs(&self, outputs: Vec<Symbol>) -> Self {
        match self {
            Self::DocTable { table, query_spec } => Self::DocTable {
                table: table.clone(),
                query_spec: query_spec.with_outputs(outputs),
            },
            Self::SubQuery { query_spec } => Self::SubQuery {
                query_spec: query_spec.with_outputs(outputs),
            },
        }
    }
}

/// A select over several named sources (joins), as produced by the analyzer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiSourceSelect {
    sources: BTreeMap<QualifiedName, QueriedRelation>,
    query_spec: QuerySpec,
    can_be_fetched: HashSet<Field>,
    required_for_query: HashSet<Field>,
}

impl MultiSourceSelect {
    pub fn new(
        sources: impl IntoIterator<Item = (QualifiedName, QueriedRelation)>,
        query_spec: QuerySpec,
    ) -> Self {
        Self {
            sources: sources.into_iter().collect(),
            query_spec,
            can_be_fetched: HashSet::new(),
            required_for_query: HashSet::new(),
        }
    }

    /// Fields the query needs materialized before the fetch phase (join
    /// conditions, filters, grouping keys).
    pub fn with_required_for_query(mut self, fields: impl IntoIterator<Item = Field>) -> Self {
        self.required_for_query = fields.into_iter().collect();
        self
    }

    /// Explicitly mark fields as eligible for deferral.
    pub fn with_can_be_fetched(mut self, fields: impl IntoIterator<Item = Field>) -> Self {
        self.can_be_fetched = fields.into_iter().collect();
        self
    }

    /// Mark every field returned by [`MultiSourceSelect::fetchable_fields`].
    pub fn with_computed_fetchable(self) -> Self {
        let fields = self.fetchable_fields();
        self.with_can_be_fetched(fields)
    }

    pub fn sources(&self) -> &BTreeMap<QualifiedName, QueriedRelation> {
        &self.sources
    }

    pub fn query_spec(&self) -> &QuerySpec {
        &self.query_spec
    }

    pub fn can_be_fetched(&self) -> &HashSet<Field> {
        &self.can_be_fetched
    }

    pub fn required_for_query(&self) -> &HashSet<Field> {
        &self.required_for_query
    }

    /// Deferral eligibility: top-level output fields of table sources that are
    /// neither required by the query phase nor used for ordering.
    pub fn fetchable_fields(&self) -> Vec<Field> {
        let ordered: HashSet<&Field> = self
            .query_spec
            .order_by
            .iter()
            .flat_map(|o| o.symbols.iter())
            .flat_map(Symbol::unresolved_fields)
            .collect();
        let mut out = Vec::new();
        for output in &self.query_spec.outputs {
            let Symbol::Field(field) = output else {
                continue;
            };
            let is_table = matches!(
                self.sources.get(&field.relation),
                Some(QueriedRelation::DocTable { .. })
            );
            if is_table
                && !self.required_for_query.contains(field)
                && !ordered.contains(field)
                && !out.contains(field)
            {
                out.push(field.clone());
            }
        }
        out
    }

    pub(crate) fn rebuild(
        &self,
        sources: BTreeMap<QualifiedName, QueriedRelation>,
        query_spec: QuerySpec,
    ) -> Self {
        Self {
            sources,
            query_spec,
            can_be_fetched: self.can_be_fetched.clone(),
            required_for_query: self.required_for_query.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_table_select() -> MultiSourceSelect {
        let a = DocTableInfo::new(TableIdent::new("doc", "a"))
            .column("x", DataType::Int64)
            .column("y", DataType::Utf8);
        let b_spec = QuerySpec::new(vec![Symbol::field("b", "z", DataType::Int64)]);
        let a_spec = QuerySpec::new(vec![
            Symbol::field("a", "x", DataType::Int64),
            Symbol::field("a", "y", DataType::Utf8),
        ]);
        let top = QuerySpec::new(vec![
            Symbol::field("a", "x", DataType::Int64),
            Symbol::field("a", "y", DataType::Utf8),
            Symbol::field("b", "z", DataType::Int64),
        ])
        .with_order_by(OrderBy::ascending(vec![Symbol::field(
            "a",
            "x",
            DataType::Int64,
        )]));
        MultiSourceSelect::new(
            vec![
                (
                    QualifiedName::of("a"),
                    QueriedRelation::DocTable {
                        table: a,
                        query_spec: a_spec,
                    },
                ),
                (
                    QualifiedName::of("b"),
                    QueriedRelation::SubQuery { query_spec: b_spec },
                ),
            ],
            top,
        )
    }

    #[test]
    fn ordered_and_sub_query_fields_are_not_fetchable() {
        let select = two_table_select();
        let fetchable = select.fetchable_fields();
        assert_eq!(
            fetchable,
            vec![Field::new(
                QualifiedName::of("a"),
                ColumnIdent::new("y"),
                DataType::Utf8
            )]
        );
    }

    #[test]
    fn required_fields_are_not_fetchable() {
        let y = Field::new(QualifiedName::of("a"), ColumnIdent::new("y"), DataType::Utf8);
        let select = two_table_select().with_required_for_query(vec![y]);
        assert!(select.fetchable_fields().is_empty());
    }

    #[test]
    fn partition_columns_resolve_through_table_info() {
        let t = DocTableInfo::new(TableIdent::new("doc", "p"))
            .column("x", DataType::Int64)
            .partition_column("day", DataType::Utf8);
        let day = t.reference(&ColumnIdent::new("day")).expect("day column");
        assert_eq!(day.granularity, RowGranularity::Partition);
        assert!(t.reference(&ColumnIdent::new("missing")).is_none());
        assert_eq!(t.fetch_id_reference().data_type, DataType::Int64);
    }
}
