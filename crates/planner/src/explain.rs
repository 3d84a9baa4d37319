use crate::fetch_pushdown::FetchPushDownPlan;
use crate::relation::QueriedRelation;

/// Render a push-down plan as human-readable multiline text.
pub fn explain_fetch_plan(plan: &FetchPushDownPlan) -> String {
    let mut out = String::new();
    out.push_str("FetchPushDown\n");
    out.push_str("  outputs\n");
    for (i, s) in plan.outputs().iter().enumerate() {
        out.push_str(&format!("    {i}: {s}\n"));
    }
    out.push_str("  remaining_outputs\n");
    for s in &plan.remaining_outputs {
        out.push_str(&format!("    {s}\n"));
    }
    if let Some(order_by) = &plan.select.query_spec().order_by {
        out.push_str("  order_by\n");
        for (s, reverse) in order_by.symbols.iter().zip(order_by.reverse.iter()) {
            let dir = if *reverse { "DESC" } else { "ASC" };
            out.push_str(&format!("    {s} {dir}\n"));
        }
    }
    out.push_str("  sources\n");
    for (name, relation) in plan.select.sources() {
        let kind = match relation {
            QueriedRelation::DocTable { table, .. } => format!("table={}", table.ident()),
            QueriedRelation::SubQuery { .. } => "subquery".to_string(),
        };
        let outputs = relation
            .query_spec()
            .outputs
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        out.push_str(&format!("    {name} {kind} [{outputs}]\n"));
    }
    out.push_str(&format!("  fetch_sources={}\n", plan.fetch_sources.len()));
    for (table, source) in &plan.fetch_sources {
        let refs = source
            .references()
            .iter()
            .map(|r| r.column().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        let partitions = source
            .partitioned_by()
            .iter()
            .map(|r| r.column().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        out.push_str(&format!(
            "    {table} fetch_ids={:?} refs=[{refs}] partitioned_by=[{partitions}]\n",
            source.fetch_id_cols()
        ));
    }
    out
}
