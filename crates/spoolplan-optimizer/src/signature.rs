use std::hash::{Hash, Hasher};

use rustc_hash::FxHasher;
use spoolplan_ir::{Expr, JoinType, PlanField, PlanSchema};

use crate::graph::{NodeId, OperatorKind};

/// Canonical structural content of one plan node: operator parameters in
/// normalized form plus the (already canonical) child node ids.
///
/// Two nodes merge only when their keys are fully equal; the u64
/// fingerprint is just the bucket index, so a hash collision can never
/// cause an incorrect merge.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct SignatureKey {
    op: OperatorKind,
    children: Vec<NodeId>,
}

impl SignatureKey {
    /// Builds the canonical key for a node whose children have already been
    /// unified. Commutative forms are normalized so operand order cannot
    /// defeat matching:
    /// - inner joins with a symmetric equi-condition (or none) get their
    ///   operands, key order and schema field order sorted;
    /// - commutative expression operands are sorted (`Expr::normalized`);
    /// - group-by expressions are order-insensitive.
    pub(crate) fn canonical(op: &OperatorKind, children: &[NodeId]) -> SignatureKey {
        let mut children = children.to_vec();
        let op = match op {
            OperatorKind::Scan { .. }
            | OperatorKind::Limit { .. }
            | OperatorKind::Union { .. }
            | OperatorKind::Values { .. }
            | OperatorKind::SpoolWrite { .. }
            | OperatorKind::SpoolRead { .. } => op.clone(),
            OperatorKind::Filter { predicate } => OperatorKind::Filter {
                predicate: predicate.normalized(),
            },
            OperatorKind::Project {
                expressions,
                schema,
            } => OperatorKind::Project {
                expressions: expressions.iter().map(Expr::normalized).collect(),
                schema: schema.clone(),
            },
            OperatorKind::Aggregate {
                group_by,
                aggregates,
                schema,
            } => {
                let mut group_by: Vec<Expr> = group_by.iter().map(Expr::normalized).collect();
                group_by.sort();
                OperatorKind::Aggregate {
                    group_by,
                    aggregates: aggregates.iter().map(Expr::normalized).collect(),
                    schema: schema.clone(),
                }
            }
            OperatorKind::Sort { sort_exprs } => OperatorKind::Sort {
                sort_exprs: sort_exprs
                    .iter()
                    .map(|s| spoolplan_ir::SortExpr {
                        expr: s.expr.normalized(),
                        ascending: s.ascending,
                    })
                    .collect(),
            },
            OperatorKind::Join {
                join_type,
                condition,
                schema,
            } => {
                let condition = condition.as_ref().map(Expr::normalized);
                let symmetric = *join_type == JoinType::Inner
                    && condition
                        .as_ref()
                        .is_none_or(Expr::is_symmetric_equi_condition);
                if symmetric {
                    children.sort();
                    OperatorKind::Join {
                        join_type: *join_type,
                        condition,
                        schema: sorted_schema(schema),
                    }
                } else {
                    OperatorKind::Join {
                        join_type: *join_type,
                        condition,
                        schema: schema.clone(),
                    }
                }
            }
        };
        SignatureKey { op, children }
    }

    pub(crate) fn fingerprint(&self) -> u64 {
        let mut hasher = FxHasher::default();
        self.hash(&mut hasher);
        hasher.finish()
    }
}

/// Column references in this IR are by name, so field order may be
/// canonicalized when join operands are.
fn sorted_schema(schema: &PlanSchema) -> PlanSchema {
    let mut fields: Vec<PlanField> = schema.fields.clone();
    fields.sort_by(|a, b| (&a.table, &a.name).cmp(&(&b.table, &b.name)));
    PlanSchema::from_fields(fields)
}

/// Subtree eligibility for deduplication: every expression the operator
/// carries must be deterministic. Side-effecting operators do not exist in
/// this closed set, so expressions are the only volatility source.
pub(crate) fn op_is_deterministic(op: &OperatorKind) -> bool {
    match op {
        OperatorKind::Scan { .. }
        | OperatorKind::Limit { .. }
        | OperatorKind::Union { .. }
        | OperatorKind::Values { .. } => true,
        OperatorKind::Filter { predicate } => predicate.is_deterministic(),
        OperatorKind::Project { expressions, .. } => {
            expressions.iter().all(Expr::is_deterministic)
        }
        OperatorKind::Aggregate {
            group_by,
            aggregates,
            ..
        } => {
            group_by.iter().all(Expr::is_deterministic)
                && aggregates.iter().all(Expr::is_deterministic)
        }
        OperatorKind::Join { condition, .. } => {
            condition.as_ref().is_none_or(Expr::is_deterministic)
        }
        OperatorKind::Sort { sort_exprs } => {
            sort_exprs.iter().all(|s| s.expr.is_deterministic())
        }
        // Spools are planner-introduced and never re-enter detection.
        OperatorKind::SpoolWrite { .. } | OperatorKind::SpoolRead { .. } => false,
    }
}
