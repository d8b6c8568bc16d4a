use std::fmt::Write;

use spoolplan_common::Result;

use crate::graph::{NodeId, OperatorKind, PlanGraph, PlanNode};
use crate::stage::{StageDependencyGraph, StageId};

/// Renders the full plan as an indented operator tree. The root pipeline
/// comes first; each spool's producer follows under its write header, so
/// shared subtrees are printed once.
pub fn format_plan(graph: &PlanGraph) -> Result<String> {
    let mut out = String::new();
    write_subtree(graph, graph.root(), 0, &mut out)?;
    for node in graph.iter() {
        if let OperatorKind::SpoolWrite { .. } = &node.op {
            out.push('\n');
            let _ = writeln!(out, "{}", op_label(node));
            let child = graph.children_of(node.id)?[0];
            write_subtree(graph, child, 1, &mut out)?;
        }
    }
    Ok(out)
}

/// Renders the plan as SQL-flavoured text: one `WITH <spool> AS
/// MATERIALIZED (...)` binding per surviving spool in dependency order,
/// then the root pipeline with reads shown as scans of the binding.
pub fn render_with_clauses(
    graph: &PlanGraph,
    stages: &StageDependencyGraph,
    order: &[StageId],
) -> Result<String> {
    let mut out = String::new();
    let mut first = true;
    for id in order {
        let stage = stages
            .stage(*id)
            .ok_or_else(|| spoolplan_common::Error::internal(format!("{} not in stage graph", id)))?;
        let Some(spool_id) = stage.produces else {
            continue;
        };
        if first {
            out.push_str("WITH ");
            first = false;
        } else {
            out.push_str(",\n");
        }
        let _ = writeln!(out, "{} AS MATERIALIZED (", spool_id);
        let producer = graph.children_of(stage.head)?[0];
        write_subtree(graph, producer, 1, &mut out)?;
        out.push(')');
    }
    if !first {
        out.push('\n');
    }
    write_subtree(graph, graph.root(), 0, &mut out)?;
    Ok(out)
}

fn write_subtree(graph: &PlanGraph, id: NodeId, depth: usize, out: &mut String) -> Result<()> {
    let node = graph.node(id)?;
    for _ in 0..depth {
        out.push_str("  ");
    }
    let _ = writeln!(out, "{}", op_label(node));
    // Reads are leaves here; the producer prints under its own write.
    if !matches!(node.op, OperatorKind::SpoolRead { .. }) {
        for &child in &node.children {
            write_subtree(graph, child, depth + 1, out)?;
        }
    }
    Ok(())
}

fn op_label(node: &PlanNode) -> String {
    let mut label = match &node.op {
        OperatorKind::Scan { table_name, .. } => format!("Scan: {}", table_name),
        OperatorKind::Filter { predicate } => format!("Filter: {}", predicate),
        OperatorKind::Project { expressions, .. } => {
            format!("Project: {}", join_rendered(expressions))
        }
        OperatorKind::Aggregate {
            group_by,
            aggregates,
            ..
        } => format!(
            "Aggregate: group=[{}] agg=[{}]",
            join_rendered(group_by),
            join_rendered(aggregates)
        ),
        OperatorKind::Join {
            join_type,
            condition,
            ..
        } => match condition {
            Some(cond) => format!("Join({}): {}", join_type.as_str(), cond),
            None => format!("Join({})", join_type.as_str()),
        },
        OperatorKind::Sort { sort_exprs } => format!("Sort: {}", join_rendered(sort_exprs)),
        OperatorKind::Limit { limit, offset } => match limit {
            Some(n) => format!("Limit: {} offset {}", n, offset),
            None => format!("Limit: ALL offset {}", offset),
        },
        OperatorKind::Union { all } => {
            format!("Union({})", if *all { "ALL" } else { "DISTINCT" })
        }
        OperatorKind::Values { rows, .. } => format!("Values: {} rows", rows.len()),
        OperatorKind::SpoolWrite { spool_id, mode } => {
            format!("SpoolWrite({}, {:?})", spool_id, mode)
        }
        OperatorKind::SpoolRead { spool_id, .. } => format!("Scan {}", spool_id),
    };
    if let Some(cost) = node.estimated_cost {
        let _ = write!(label, " [cost={}]", cost);
    }
    label
}

fn join_rendered<T: std::fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
