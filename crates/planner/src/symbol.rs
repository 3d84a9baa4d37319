use std::collections::HashMap;
use std::fmt;

use arrow_schema::DataType;
use dfq_common::{ScalarValue, TableIdent};
use serde::{Deserialize, Serialize};

/// System column carrying the per-row fetch id of a table.
pub const FETCH_ID_COLUMN: &str = "_fetchid";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RowGranularity {
    /// Stored per document; resolving it requires reading the row.
    Doc,
    /// Known from the partition a row lives in; resolvable without I/O.
    Partition,
}

/// Column name plus optional object subscript path (`obj['a']['b']`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ColumnIdent {
    pub name: String,
    pub path: Vec<String>,
}

impl ColumnIdent {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: Vec::new(),
        }
    }

    pub fn with_path(name: impl Into<String>, path: Vec<String>) -> Self {
        Self {
            name: name.into(),
            path,
        }
    }

    pub fn sql_fqn(&self) -> String {
        let mut out = self.name.clone();
        for p in &self.path {
            out.push_str(&format!("['{p}']"));
        }
        out
    }
}

impl fmt::Display for ColumnIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sql_fqn())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReferenceIdent {
    pub table: TableIdent,
    pub column: ColumnIdent,
}

/// A physical column of a table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reference {
    pub ident: ReferenceIdent,
    pub granularity: RowGranularity,
    pub data_type: DataType,
}

impl Reference {
    pub fn new(
        table: TableIdent,
        column: ColumnIdent,
        granularity: RowGranularity,
        data_type: DataType,
    ) -> Self {
        Self {
            ident: ReferenceIdent { table, column },
            granularity,
            data_type,
        }
    }

    pub fn table(&self) -> &TableIdent {
        &self.ident.table
    }

    pub fn column(&self) -> &ColumnIdent {
        &self.ident.column
    }
}

/// Name a relation is addressed by inside a multi-source select (`a`, `doc.t1`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub struct QualifiedName(pub Vec<String>);

impl QualifiedName {
    pub fn of(name: &str) -> Self {
        Self(name.split('.').map(str::to_string).collect())
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

impl From<QualifiedName> for String {
    fn from(name: QualifiedName) -> Self {
        name.to_string()
    }
}

impl From<String> for QualifiedName {
    fn from(name: String) -> Self {
        Self::of(&name)
    }
}

/// A logical column exposed by a sub-relation, before flattening.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Field {
    pub relation: QualifiedName,
    pub path: ColumnIdent,
    pub data_type: DataType,
}

impl Field {
    pub fn new(relation: QualifiedName, path: ColumnIdent, data_type: DataType) -> Self {
        Self {
            relation,
            path,
            data_type,
        }
    }
}

/// Where a column's value comes from.
///
/// Every rewrite over symbols is an exhaustive `match`, so a new variant has to
/// be handled at each call site.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Symbol {
    /// Value at a fixed position of a flattened row.
    InputColumn { index: usize, data_type: DataType },
    /// Value from a specific source relation, before flattening.
    RelationColumn {
        relation: QualifiedName,
        index: usize,
        data_type: DataType,
    },
    /// Physical column of a table.
    Reference(Reference),
    /// Logical column of a sub-relation.
    Field(Field),
    /// Deferred value: resolve `reference` using the row's fetch id.
    FetchReference {
        fetch_id: Box<Symbol>,
        reference: Reference,
    },
    Literal(ScalarValue),
}

/// Substitution mapping applied by [`Symbol::apply_mapping`].
pub type SymbolMapping = HashMap<Symbol, Symbol>;

impl Symbol {
    pub fn input_column(index: usize, data_type: DataType) -> Self {
        Self::InputColumn { index, data_type }
    }

    pub fn field(relation: &str, column: &str, data_type: DataType) -> Self {
        Self::Field(Field::new(
            QualifiedName::of(relation),
            ColumnIdent::new(column),
            data_type,
        ))
    }

    pub fn value_type(&self) -> DataType {
        match self {
            Self::InputColumn { data_type, .. } => data_type.clone(),
            Self::RelationColumn { data_type, .. } => data_type.clone(),
            Self::Reference(r) => r.data_type.clone(),
            Self::Field(f) => f.data_type.clone(),
            Self::FetchReference { reference, .. } => reference.data_type.clone(),
            Self::Literal(v) => literal_type(v),
        }
    }

    /// Replace every sub-symbol found in `mapping`; unmapped symbols are kept.
    pub fn apply_mapping(&self, mapping: &SymbolMapping) -> Symbol {
        if let Some(replacement) = mapping.get(self) {
            return replacement.clone();
        }
        match self {
            Self::FetchReference {
                fetch_id,
                reference,
            } => Self::FetchReference {
                fetch_id: Box::new(fetch_id.apply_mapping(mapping)),
                reference: reference.clone(),
            },
            Self::InputColumn { .. }
            | Self::RelationColumn { .. }
            | Self::Reference(_)
            | Self::Field(_)
            | Self::Literal(_) => self.clone(),
        }
    }

    /// Fields still referenced by this symbol, i.e. not yet bound to a position.
    pub fn unresolved_fields(&self) -> Vec<&Field> {
        match self {
            Self::Field(f) => vec![f],
            Self::FetchReference { fetch_id, .. } => fetch_id.unresolved_fields(),
            Self::InputColumn { .. }
            | Self::RelationColumn { .. }
            | Self::Reference(_)
            | Self::Literal(_) => Vec::new(),
        }
    }
}

fn literal_type(v: &ScalarValue) -> DataType {
    match v {
        ScalarValue::Null => DataType::Null,
        ScalarValue::Boolean(_) => DataType::Boolean,
        ScalarValue::Int32(_) => DataType::Int32,
        ScalarValue::Int64(_) => DataType::Int64,
        ScalarValue::Float64(_) => DataType::Float64,
        ScalarValue::Utf8(_) => DataType::Utf8,
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InputColumn { index, .. } => write!(f, "INPUT({index})"),
            Self::RelationColumn {
                relation, index, ..
            } => write!(f, "RELCOL({relation}, {index})"),
            Self::Reference(r) => write!(f, "{}.{}", r.table(), r.column()),
            Self::Field(fl) => write!(f, "{}.{}", fl.relation, fl.path),
            Self::FetchReference {
                fetch_id,
                reference,
            } => write!(
                f,
                "FETCH({fetch_id}, {}.{})",
                reference.table(),
                reference.column()
            ),
            Self::Literal(v) => match v {
                ScalarValue::Null => f.write_str("NULL"),
                ScalarValue::Boolean(b) => write!(f, "{b}"),
                ScalarValue::Int32(i) => write!(f, "{i}"),
                ScalarValue::Int64(i) => write!(f, "{i}"),
                ScalarValue::Float64(x) => write!(f, "{x}"),
                ScalarValue::Utf8(s) => write!(f, "'{s}'"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc_ref(col: &str) -> Reference {
        Reference::new(
            TableIdent::new("doc", "t1"),
            ColumnIdent::new(col),
            RowGranularity::Doc,
            DataType::Utf8,
        )
    }

    #[test]
    fn mapping_replaces_whole_symbol_before_descending() {
        let x = Symbol::field("a", "x", DataType::Int64);
        let mut mapping = SymbolMapping::new();
        mapping.insert(x.clone(), Symbol::input_column(2, DataType::Int64));

        assert_eq!(
            x.apply_mapping(&mapping),
            Symbol::input_column(2, DataType::Int64)
        );
        let untouched = Symbol::field("a", "other", DataType::Int64);
        assert_eq!(untouched.apply_mapping(&mapping), untouched);
    }

    #[test]
    fn mapping_descends_into_fetch_id_symbol() {
        let fetch_id_field = Symbol::field("a", "_fetchid", DataType::Int64);
        let fetch = Symbol::FetchReference {
            fetch_id: Box::new(fetch_id_field.clone()),
            reference: doc_ref("y"),
        };
        assert_eq!(fetch.unresolved_fields().len(), 1);

        let mut mapping = SymbolMapping::new();
        mapping.insert(fetch_id_field, Symbol::input_column(0, DataType::Int64));
        let rewritten = fetch.apply_mapping(&mapping);

        assert!(rewritten.unresolved_fields().is_empty());
        assert_eq!(rewritten.to_string(), "FETCH(INPUT(0), doc.t1.y)");
        assert_eq!(rewritten.value_type(), DataType::Utf8);
    }

    #[test]
    fn nested_column_renders_subscripts() {
        let c = ColumnIdent::with_path("obj", vec!["a".to_string(), "b".to_string()]);
        assert_eq!(c.sql_fqn(), "obj['a']['b']");
    }
}
