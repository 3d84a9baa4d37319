//! Fetch push-down over multi-source selects.
//!
//! Rewrites the query spec of a [`MultiSourceSelect`] into a flattened,
//! position-addressed output list. Columns eligible for deferral are dropped
//! from the query phase and replaced by [`Symbol::FetchReference`]s bound to
//! the table's fetch id position; one [`FetchSource`] per table records what
//! the fetch phase must resolve.
//!
//! Positions are assigned while walking sources in sorted qualified-name
//! order, so planning the same select twice yields the same `InputColumn`
//! indices. The input select is never mutated; a new one is returned inside
//! [`FetchPushDownPlan`].

use std::collections::{BTreeMap, HashSet};

use arrow_schema::DataType;
use dfq_common::{DfqError, FetchPhaseId, Result, TableIdent};
use tracing::debug;

use crate::fetch_source::{FetchPhase, FetchSource, FetchSourceRegistry};
use crate::relation::{DocTableInfo, MultiSourceSelect, OrderBy, QueriedRelation, QuerySpec};
use crate::symbol::{Field, QualifiedName, Symbol, SymbolMapping};

/// Result of one push-down pass.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchPushDownPlan {
    /// Rewritten select: flattened outputs, rewritten order-by, and sources
    /// whose table outputs start with the fetch id column.
    pub select: MultiSourceSelect,
    /// Original top-level outputs rewritten to `InputColumn`s and `FetchReference`s.
    pub remaining_outputs: Vec<Symbol>,
    pub fetch_sources: BTreeMap<TableIdent, FetchSource>,
}

impl FetchPushDownPlan {
    /// Flattened output list of the query phase.
    pub fn outputs(&self) -> &[Symbol] {
        &self.select.query_spec().outputs
    }

    pub fn requires_fetch(&self) -> bool {
        !self.fetch_sources.is_empty()
    }

    pub fn fetch_phase(&self, phase_id: FetchPhaseId) -> FetchPhase {
        FetchPhase::new(phase_id, self.fetch_sources.clone())
    }
}

/// Plan fetch push-down for `select` using its `can_be_fetched` fields.
pub fn plan_fetch_pushdown(select: &MultiSourceSelect) -> Result<FetchPushDownPlan> {
    MultiSourceFetchPushDown::new(select).process()
}

struct MultiSourceFetchPushDown<'a> {
    select: &'a MultiSourceSelect,
    registry: FetchSourceRegistry,
    flattened: Vec<Symbol>,
    // old symbol -> InputColumn / FetchReference, for the top-level outputs
    top_level_map: SymbolMapping,
    // old symbol -> RelationColumn, for order-by; deferred fields never land here
    relation_map: SymbolMapping,
    sources: BTreeMap<QualifiedName, QueriedRelation>,
}

impl<'a> MultiSourceFetchPushDown<'a> {
    fn new(select: &'a MultiSourceSelect) -> Self {
        let capacity = select.sources().len() + select.query_spec().outputs.len();
        Self {
            select,
            registry: FetchSourceRegistry::new(),
            flattened: Vec::with_capacity(capacity),
            top_level_map: SymbolMapping::with_capacity(capacity),
            relation_map: SymbolMapping::with_capacity(capacity),
            sources: BTreeMap::new(),
        }
    }

    fn process(mut self) -> Result<FetchPushDownPlan> {
        self.validate_fetchable()?;
        let select = self.select;

        for (name, relation) in select.sources() {
            match relation {
                QueriedRelation::SubQuery { query_spec } => {
                    let deferred = self.fetchable_for(name, query_spec);
                    if !deferred.is_empty() {
                        debug!(
                            relation = %name,
                            fields = deferred.len(),
                            "sub-query fields cannot be deferred; materializing"
                        );
                    }
                    self.expose_all(name, relation);
                }
                QueriedRelation::DocTable { table, query_spec } => {
                    let deferred = self.fetchable_for(name, query_spec);
                    if deferred.is_empty() {
                        self.expose_all(name, relation);
                    } else {
                        self.push_down_table(name, relation, table, &deferred)?;
                    }
                }
            }
        }

        let top = select.query_spec();
        let remaining_outputs = top
            .outputs
            .iter()
            .map(|s| s.apply_mapping(&self.top_level_map))
            .collect::<Vec<_>>();
        ensure_resolved(&remaining_outputs, "output")?;

        let order_by = match &top.order_by {
            Some(order_by) => {
                let symbols = order_by
                    .symbols
                    .iter()
                    .map(|s| s.apply_mapping(&self.relation_map))
                    .collect::<Vec<_>>();
                ensure_resolved(&symbols, "order by")?;
                Some(OrderBy::new(symbols, order_by.reverse.clone()))
            }
            None => None,
        };

        let query_spec = QuerySpec {
            outputs: self.flattened,
            order_by,
            limit: top.limit,
        };
        let fetch_sources = self.registry.into_sources();
        debug!(
            relations = self.sources.len(),
            outputs = query_spec.outputs.len(),
            fetch_sources = fetch_sources.len(),
            "fetch push-down planned"
        );
        Ok(FetchPushDownPlan {
            select: select.rebuild(self.sources, query_spec),
            remaining_outputs,
            fetch_sources,
        })
    }

    // A deferred value cannot serve the query phase; reject such inputs before
    // any position is assigned.
    fn validate_fetchable(&self) -> Result<()> {
        let ordered: HashSet<&Field> = self
            .select
            .query_spec()
            .order_by
            .iter()
            .flat_map(|o| o.symbols.iter())
            .flat_map(Symbol::unresolved_fields)
            .collect();
        for field in self.select.can_be_fetched() {
            if !self.select.sources().contains_key(&field.relation) {
                return Err(DfqError::PlanningInconsistency(format!(
                    "fetchable field {} does not belong to any relation",
                    Symbol::Field(field.clone())
                )));
            }
            if self.select.required_for_query().contains(field) {
                return Err(DfqError::PlanningInconsistency(format!(
                    "field {} is required by the query phase and cannot be deferred",
                    Symbol::Field(field.clone())
                )));
            }
            if ordered.contains(field) {
                return Err(DfqError::PlanningInconsistency(format!(
                    "field {} is used for ordering and cannot be deferred",
                    Symbol::Field(field.clone())
                )));
            }
        }
        Ok(())
    }

    /// Fetchable fields of one relation, in output order.
    fn fetchable_for(&self, name: &QualifiedName, query_spec: &QuerySpec) -> Vec<Field> {
        let mut fields = self
            .select
            .can_be_fetched()
            .iter()
            .filter(|f| &f.relation == name)
            .cloned()
            .collect::<Vec<_>>();
        fields.sort_by_key(|f| {
            let pos = query_spec
                .outputs
                .iter()
                .position(|o| matches!(o, Symbol::Field(of) if of == f))
                .unwrap_or(usize::MAX);
            (pos, f.path.clone())
        });
        fields
    }

    fn expose_all(&mut self, name: &QualifiedName, relation: &QueriedRelation) {
        for (index, output) in relation.query_spec().outputs.iter().enumerate() {
            self.expose(name, index, output);
        }
        self.sources.insert(name.clone(), relation.clone());
    }

    fn expose(&mut self, name: &QualifiedName, index: usize, output: &Symbol) {
        let data_type = output.value_type();
        let rc = Symbol::RelationColumn {
            relation: name.clone(),
            index,
            data_type: data_type.clone(),
        };
        self.flattened.push(rc.clone());
        self.relation_map.insert(output.clone(), rc);
        self.top_level_map.insert(
            output.clone(),
            Symbol::input_column(self.flattened.len() - 1, data_type),
        );
    }

    fn push_down_table(
        &mut self,
        name: &QualifiedName,
        relation: &QueriedRelation,
        table: &DocTableInfo,
        deferred: &[Field],
    ) -> Result<()> {
        let fetch_id_pos = self.flattened.len();
        self.flattened.push(Symbol::RelationColumn {
            relation: name.clone(),
            index: 0,
            data_type: DataType::Int64,
        });
        self.registry
            .open_source(table.ident(), table.partitioned_by(), fetch_id_pos)?;
        let fetch_id_input = Symbol::input_column(fetch_id_pos, DataType::Int64);

        let mut table_outputs = vec![Symbol::Reference(table.fetch_id_reference())];
        for output in &relation.query_spec().outputs {
            let is_deferred = matches!(output, Symbol::Field(f) if deferred.contains(f));
            if is_deferred {
                continue;
            }
            table_outputs.push(output.clone());
            self.expose(name, table_outputs.len() - 1, output);
        }

        for field in deferred {
            let reference = table.reference(&field.path).ok_or_else(|| {
                DfqError::PlanningInconsistency(format!(
                    "fetchable field {} has no column in {}",
                    Symbol::Field(field.clone()),
                    table.ident()
                ))
            })?;
            let fetch_ref = Symbol::FetchReference {
                fetch_id: Box::new(fetch_id_input.clone()),
                reference: reference.clone(),
            };
            self.registry.allocate(&fetch_ref)?;
            self.top_level_map.insert(Symbol::Field(field.clone()), fetch_ref);
        }

        self.sources
            .insert(name.clone(), relation.with_outputs(table_outputs));
        Ok(())
    }
}

fn ensure_resolved(symbols: &[Symbol], context: &str) -> Result<()> {
    for symbol in symbols {
        if let Some(field) = symbol.unresolved_fields().first() {
            return Err(DfqError::PlanningInconsistency(format!(
                "{context} symbol {} has no rewrite target",
                Symbol::Field((*field).clone())
            )));
        }
    }
    Ok(())
}
