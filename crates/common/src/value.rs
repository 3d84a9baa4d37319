//! Row cell values exchanged between the query phase, fetch readers, and projector.

use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::ids::FetchId;

/// One materialized cell.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ScalarValue {
    Null,
    Boolean(bool),
    Int32(i32),
    Int64(i64),
    Float64(f64),
    Utf8(String),
}

/// One materialized row.
pub type Row = Vec<ScalarValue>;

impl ScalarValue {
    /// Whether this cell is SQL `NULL`.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Interpret the cell as a fetch id column value.
    ///
    /// Returns `None` for `NULL` (outer-join padding); any other non-`Int64`
    /// value is not a fetch id.
    pub fn as_fetch_id(&self) -> Option<FetchId> {
        match self {
            Self::Int64(v) => Some(FetchId(*v as u64)),
            _ => None,
        }
    }
}

impl From<FetchId> for ScalarValue {
    fn from(id: FetchId) -> Self {
        Self::Int64(id.0 as i64)
    }
}

impl PartialEq for ScalarValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Boolean(a), Self::Boolean(b)) => a == b,
            (Self::Int32(a), Self::Int32(b)) => a == b,
            (Self::Int64(a), Self::Int64(b)) => a == b,
            // Bitwise so that NaN literals stay usable as map keys.
            (Self::Float64(a), Self::Float64(b)) => a.to_bits() == b.to_bits(),
            (Self::Utf8(a), Self::Utf8(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for ScalarValue {}

impl Hash for ScalarValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Self::Null => 0_u8.hash(state),
            Self::Boolean(v) => {
                1_u8.hash(state);
                v.hash(state);
            }
            Self::Int32(v) => {
                2_u8.hash(state);
                v.hash(state);
            }
            Self::Int64(v) => {
                3_u8.hash(state);
                v.hash(state);
            }
            Self::Float64(v) => {
                4_u8.hash(state);
                v.to_bits().hash(state);
            }
            Self::Utf8(v) => {
                5_u8.hash(state);
                v.hash(state);
            }
        }
    }
}
