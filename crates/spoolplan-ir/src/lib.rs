//! SpoolPlan intermediate representation.
//!
//! The input to the optimizer is a [`LogicalPlan`]: an acyclic relational
//! operator tree with schemas, predicates and join conditions, supplied by
//! an upstream query planner and consumed read-only. Sharing is not
//! representable here; the optimizer's own plan graph introduces it.

#![warn(rustdoc::broken_intra_doc_links)]

mod expr;
mod plan;
mod schema;

pub use expr::{AggregateFunc, BinaryOp, Expr, Literal, SortExpr};
pub use plan::{JoinType, LogicalPlan};
pub use schema::{PlanField, PlanSchema};
