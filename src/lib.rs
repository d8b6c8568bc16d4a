//! SpoolPlan detects repeated relational sub-computations in a logical
//! query plan and plans their reuse: each repeated subtree is either
//! inlined (re-evaluated per use) or materialized into a spool that is
//! written once and read many times, with stages ordered so every spool is
//! populated before its first read.
//!
//! This crate is a facade over the workspace members; most users only need
//! [`optimize`] plus the [`ir`] types to describe their plan.

pub use spoolplan_common as common;
pub use spoolplan_ir as ir;
pub use spoolplan_optimizer as optimizer;

pub use spoolplan_common::{Error, Result};
pub use spoolplan_optimizer::{
    CostModel, DecisionOutcome, MaterializationDecision, OptimizedPlan, SpoolSettings,
    StatsCostModel, optimize, optimize_with_settings,
};
