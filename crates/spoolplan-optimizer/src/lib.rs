//! Spool planning for logical query plans.
//!
//! The optimizer takes a [`spoolplan_ir::LogicalPlan`] tree, folds repeated
//! relational subtrees into shared nodes, and decides per shared subtree
//! whether to re-evaluate it at every use site (inline) or evaluate it once
//! into a spool and read it back (materialize). The result carries the
//! rewritten plan graph, the per-spool decisions, and an execution-ordered
//! stage graph in which every spool is populated before its first read.
//!
//! ```
//! use spoolplan_optimizer::{StatsCostModel, optimize};
//! # use spoolplan_common::DataType;
//! # use spoolplan_ir::{BinaryOp, Expr, JoinType, LogicalPlan, PlanField, PlanSchema};
//! # fn scan(name: &str) -> LogicalPlan {
//! #     LogicalPlan::Scan {
//! #         table_name: name.to_string(),
//! #         schema: PlanSchema::from_fields(vec![
//! #             PlanField::new("id", DataType::Int64).with_table(name),
//! #         ]),
//! #     }
//! # }
//! # fn cross(left: LogicalPlan, right: LogicalPlan) -> LogicalPlan {
//! #     let schema = left.schema().merge(right.schema());
//! #     LogicalPlan::Join {
//! #         left: Box::new(left),
//! #         right: Box::new(right),
//! #         join_type: JoinType::Cross,
//! #         condition: None,
//! #         schema,
//! #     }
//! # }
//! let side = cross(scan("emps"), scan("depts"));
//! let plan = cross(side.clone(), side);
//!
//! let optimized = optimize(&plan, &StatsCostModel::new()).unwrap();
//! assert_eq!(optimized.decisions.len(), 1);
//! ```

pub mod cost;
pub mod detect;
pub mod explain;
pub mod graph;
pub mod materialize;
pub mod spool;
pub mod stage;
pub mod stats;

mod signature;
#[cfg(test)]
mod test_utils;
#[cfg(test)]
mod tests;

use spoolplan_common::Result;
use spoolplan_ir::LogicalPlan;

pub use cost::{CostModel, StatsCostModel};
pub use detect::{Detection, SharedSubtree, SubexpressionDetector};
pub use explain::{format_plan, render_with_clauses};
pub use graph::{GraphBuilder, NodeId, OperatorKind, PlanGraph, PlanNode, SpoolId, SpoolMode};
pub use materialize::{
    DecidedPlan, DecisionOutcome, MaterializationDecision, MaterializationPlanner,
};
pub use spool::{SpoolCandidate, SpoolInserter, SpooledGraph};
pub use stage::{OrderResult, PhysicalOrderer, Stage, StageDependencyGraph, StageId};
pub use stats::{ColumnStats, TableStats};

/// Knobs for the materialization decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpoolSettings {
    /// Minimum reader count before a candidate may be materialized.
    /// Clamped to at least 1; below that nothing would ever spool.
    pub materialize_threshold: usize,
    /// Materialize only candidates whose producer is a full aggregation.
    /// Useful for engines whose spool storage is tuned for small results.
    pub full_aggregate_only: bool,
}

impl SpoolSettings {
    pub fn new(materialize_threshold: usize, full_aggregate_only: bool) -> Self {
        Self {
            materialize_threshold: materialize_threshold.max(1),
            full_aggregate_only,
        }
    }
}

impl Default for SpoolSettings {
    fn default() -> Self {
        Self {
            materialize_threshold: 2,
            full_aggregate_only: false,
        }
    }
}

/// Everything the optimizer decided about one plan.
#[derive(Debug, Clone)]
pub struct OptimizedPlan {
    pub graph: PlanGraph,
    pub decisions: Vec<MaterializationDecision>,
    /// Spools that survived as materialized.
    pub spools: Vec<SpoolCandidate>,
    pub stages: StageDependencyGraph,
    /// Stage execution order; producers always precede their readers.
    pub stage_order: Vec<StageId>,
}

impl OptimizedPlan {
    /// Indented operator-tree rendering of the final plan.
    pub fn explain(&self) -> Result<String> {
        explain::format_plan(&self.graph)
    }

    /// SQL-flavoured rendering with one WITH binding per materialized spool.
    pub fn render_with_clauses(&self) -> Result<String> {
        explain::render_with_clauses(&self.graph, &self.stages, &self.stage_order)
    }
}

/// Runs the full spool planning pipeline with default settings.
pub fn optimize(plan: &LogicalPlan, cost: &dyn CostModel) -> Result<OptimizedPlan> {
    optimize_with_settings(plan, cost, &SpoolSettings::default())
}

pub fn optimize_with_settings(
    plan: &LogicalPlan,
    cost: &dyn CostModel,
    settings: &SpoolSettings,
) -> Result<OptimizedPlan> {
    let graph = PlanGraph::from_logical(plan)?;
    let detection = SubexpressionDetector::detect(&graph)?;
    let spooled = SpoolInserter::insert(&detection, cost)?;
    let mut decided = MaterializationPlanner::plan(&spooled, cost, settings)?;

    // Each retry inlines one spool, so the loop runs at most once per
    // materialized candidate.
    loop {
        match PhysicalOrderer::try_order(&decided)? {
            OrderResult::Ordered { stages, order } => {
                return Ok(OptimizedPlan {
                    graph: decided.graph,
                    decisions: decided.decisions,
                    spools: decided.spools,
                    stages,
                    stage_order: order,
                });
            }
            OrderResult::SelfReferential(spool_id) => {
                log::warn!(
                    "{} cannot run before its own readers; falling back to inline",
                    spool_id
                );
                decided = MaterializationPlanner::force_inline(&decided, spool_id)?;
            }
        }
    }
}
