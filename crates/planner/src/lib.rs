//! Symbol model and fetch push-down planning.
//!
//! Key modules:
//! - [`symbol`]: where a column value comes from ([`Symbol`])
//! - [`relation`]: analyzed multi-source selects consumed by the planner
//! - [`fetch_source`]: per-table fetch sources and the fetch phase definition
//! - [`fetch_pushdown`]: the push-down rewrite itself
//! - [`explain`]: text rendering for debugging and golden tests

pub mod explain;
pub mod fetch_pushdown;
pub mod fetch_source;
pub mod relation;
pub mod symbol;

pub use explain::explain_fetch_plan;
pub use fetch_pushdown::{FetchPushDownPlan, plan_fetch_pushdown};
pub use fetch_source::{FetchPhase, FetchSource, FetchSourceRegistry};
pub use relation::{DocTableInfo, MultiSourceSelect, OrderBy, QueriedRelation, QuerySpec};
pub use symbol::{
    ColumnIdent, FETCH_ID_COLUMN, Field, QualifiedName, Reference, ReferenceIdent,
    RowGranularity, Symbol, SymbolMapping,
};
