use rustc_hash::FxHashMap;
use spoolplan_ir::{BinaryOp, Expr};

use crate::graph::{NodeId, OperatorKind, PlanGraph};
use crate::stats::{ColumnStats, TableStats};

/// Per-row cost charged for writing a spooled row out.
const WRITE_COST_PER_ROW: f64 = 1.0;

/// Cost estimation capability injected by the caller.
///
/// `None` means "no estimate available" and must be treated conservatively
/// by consumers: a candidate is never materialized without cost
/// justification.
pub trait CostModel {
    /// Estimated cost of evaluating the subtree rooted at `node` once.
    fn subtree_cost(&self, graph: &PlanGraph, node: NodeId) -> Option<f64>;

    /// Estimated one-time overhead of materializing that subtree's output.
    fn write_overhead(&self, graph: &PlanGraph, node: NodeId) -> Option<f64>;

    /// Whether a spool over this producer should populate fully up front
    /// rather than on first pull.
    fn prefer_eager_write(&self, _graph: &PlanGraph, _node: NodeId) -> bool {
        false
    }
}

/// Table-statistics-backed cost model: cardinality is estimated bottom-up
/// and cost is the total number of rows flowing through the subtree.
pub struct StatsCostModel {
    table_stats: FxHashMap<String, TableStats>,
    default_row_count: usize,
}

impl StatsCostModel {
    pub fn new() -> Self {
        Self {
            table_stats: FxHashMap::default(),
            default_row_count: 1000,
        }
    }

    pub fn with_stats(table_stats: FxHashMap<String, TableStats>) -> Self {
        let normalized: FxHashMap<String, TableStats> = table_stats
            .into_iter()
            .map(|(k, v)| (k.to_uppercase(), v))
            .collect();
        Self {
            table_stats: normalized,
            default_row_count: 1000,
        }
    }

    pub fn get_table_stats(&self, table_name: &str) -> Option<&TableStats> {
        self.table_stats.get(&table_name.to_uppercase())
    }

    pub fn get_column_stats(&self, table_name: &str, column_name: &str) -> Option<&ColumnStats> {
        self.table_stats
            .get(&table_name.to_uppercase())
            .and_then(|ts| ts.column_stats.get(column_name))
    }

    /// Estimated output rows of one node.
    pub fn estimate_cardinality(&self, graph: &PlanGraph, id: NodeId) -> Option<f64> {
        let node = graph.node(id).ok()?;
        match &node.op {
            OperatorKind::Scan { table_name, .. } => Some(
                self.get_table_stats(table_name)
                    .map(|s| s.row_count)
                    .unwrap_or(self.default_row_count) as f64,
            ),
            OperatorKind::Filter { predicate } => {
                let input = self.estimate_cardinality(graph, node.children[0])?;
                Some((input * self.predicate_selectivity(predicate)).max(1.0))
            }
            OperatorKind::Project { .. } => {
                self.estimate_cardinality(graph, node.children[0])
            }
            OperatorKind::Aggregate { group_by, .. } => {
                let input = self.estimate_cardinality(graph, node.children[0])?;
                if group_by.is_empty() {
                    Some(1.0)
                } else {
                    Some((input / 10.0).max(1.0))
                }
            }
            OperatorKind::Join { condition, .. } => {
                let left = self.estimate_cardinality(graph, node.children[0])?;
                let right = self.estimate_cardinality(graph, node.children[1])?;
                let selectivity = match condition {
                    Some(cond) => self.join_selectivity(cond),
                    None => 1.0,
                };
                Some((left * right * selectivity).max(1.0))
            }
            OperatorKind::Sort { .. } => self.estimate_cardinality(graph, node.children[0]),
            OperatorKind::Limit { limit, .. } => {
                let input = self.estimate_cardinality(graph, node.children[0])?;
                Some(match limit {
                    Some(n) => input.min(*n as f64),
                    None => input,
                })
            }
            OperatorKind::Union { .. } => {
                let left = self.estimate_cardinality(graph, node.children[0])?;
                let right = self.estimate_cardinality(graph, node.children[1])?;
                Some(left + right)
            }
            OperatorKind::Values { rows, .. } => Some(rows.len() as f64),
            // A spool's output is its producer's output.
            OperatorKind::SpoolWrite { .. } | OperatorKind::SpoolRead { .. } => {
                self.estimate_cardinality(graph, node.children[0])
            }
        }
    }

    fn predicate_selectivity(&self, predicate: &Expr) -> f64 {
        match predicate {
            Expr::BinaryOp { left, op, right } => match op {
                BinaryOp::And => {
                    self.predicate_selectivity(left) * self.predicate_selectivity(right)
                }
                BinaryOp::Or => (self.predicate_selectivity(left)
                    + self.predicate_selectivity(right))
                .min(1.0),
                BinaryOp::Eq
                | BinaryOp::NotEq
                | BinaryOp::Lt
                | BinaryOp::LtEq
                | BinaryOp::Gt
                | BinaryOp::GtEq => self.comparison_selectivity(left, right, op),
                BinaryOp::Plus
                | BinaryOp::Minus
                | BinaryOp::Multiply
                | BinaryOp::Divide => 0.5,
            },
            Expr::Column { .. }
            | Expr::Literal(_)
            | Expr::Not(_)
            | Expr::ScalarFunction { .. }
            | Expr::Aggregate { .. } => 0.5,
        }
    }

    fn comparison_selectivity(&self, left: &Expr, right: &Expr, op: &BinaryOp) -> f64 {
        let column = match (left, right) {
            (Expr::Column { table, name }, _) | (_, Expr::Column { table, name }) => {
                table.as_deref().map(|t| (t, name.as_str()))
            }
            (
                Expr::Literal(_)
                | Expr::BinaryOp { .. }
                | Expr::Not(_)
                | Expr::ScalarFunction { .. }
                | Expr::Aggregate { .. },
                Expr::Literal(_)
                | Expr::BinaryOp { .. }
                | Expr::Not(_)
                | Expr::ScalarFunction { .. }
                | Expr::Aggregate { .. },
            ) => None,
        };
        match column {
            Some((table, name)) => match self.get_table_stats(table) {
                Some(stats) => stats.estimate_selectivity(name, op.symbol()),
                None => default_selectivity(op),
            },
            None => default_selectivity(op),
        }
    }

    fn join_selectivity(&self, condition: &Expr) -> f64 {
        match condition {
            Expr::BinaryOp {
                left,
                op: BinaryOp::Eq,
                right,
            } => match (left.as_ref(), right.as_ref()) {
                (
                    Expr::Column {
                        table: Some(lt),
                        name: ln,
                    },
                    Expr::Column {
                        table: Some(rt),
                        name: rn,
                    },
                ) => {
                    let left_distinct = self
                        .get_column_stats(lt, ln)
                        .map(|s| s.distinct_count)
                        .unwrap_or(100);
                    let right_distinct = self
                        .get_column_stats(rt, rn)
                        .map(|s| s.distinct_count)
                        .unwrap_or(100);
                    1.0 / (left_distinct.max(right_distinct).max(1) as f64)
                }
                _ => 0.01,
            },
            Expr::BinaryOp {
                left,
                op: BinaryOp::And,
                right,
            } => self.join_selectivity(left) * self.join_selectivity(right),
            _ => 0.1,
        }
    }

    /// Rows flowing through the whole subtree: the sum of every operator's
    /// output cardinality. Nested spool reads are charged their output
    /// only — their producer is paid for in its own stage.
    fn subtree_rows(&self, graph: &PlanGraph, id: NodeId) -> Option<f64> {
        let node = graph.node(id).ok()?;
        let own = self.estimate_cardinality(graph, id)?;
        match &node.op {
            OperatorKind::SpoolRead { .. } => Some(own),
            OperatorKind::Scan { .. }
            | OperatorKind::Filter { .. }
            | OperatorKind::Project { .. }
            | OperatorKind::Aggregate { .. }
            | OperatorKind::Join { .. }
            | OperatorKind::Sort { .. }
            | OperatorKind::Limit { .. }
            | OperatorKind::Union { .. }
            | OperatorKind::Values { .. }
            | OperatorKind::SpoolWrite { .. } => {
                let mut total = own;
                for &child in &node.children {
                    total += self.subtree_rows(graph, child)?;
                }
                Some(total)
            }
        }
    }
}

impl CostModel for StatsCostModel {
    fn subtree_cost(&self, graph: &PlanGraph, node: NodeId) -> Option<f64> {
        self.subtree_rows(graph, node)
    }

    fn write_overhead(&self, graph: &PlanGraph, node: NodeId) -> Option<f64> {
        self.estimate_cardinality(graph, node)
            .map(|rows| rows * WRITE_COST_PER_ROW)
    }

    fn prefer_eager_write(&self, graph: &PlanGraph, node: NodeId) -> bool {
        // Pipeline breakers buffer their full output before emitting, so
        // populating the spool up front costs nothing extra.
        match graph.node(node) {
            Ok(n) => matches!(
                n.op,
                OperatorKind::Aggregate { .. } | OperatorKind::Sort { .. }
            ),
            Err(_) => false,
        }
    }
}

impl Default for StatsCostModel {
    fn default() -> Self {
        Self::new()
    }
}

fn default_selectivity(op: &BinaryOp) -> f64 {
    match op {
        BinaryOp::Eq => 0.1,
        BinaryOp::Lt | BinaryOp::LtEq | BinaryOp::Gt | BinaryOp::GtEq => 0.33,
        BinaryOp::NotEq => 0.9,
        BinaryOp::Plus
        | BinaryOp::Minus
        | BinaryOp::Multiply
        | BinaryOp::Divide
        | BinaryOp::And
        | BinaryOp::Or => 0.5,
    }
}
