use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use spoolplan_common::{Error, Result};

use crate::SpoolSettings;
use crate::cost::CostModel;
use crate::graph::{GraphBuilder, NodeId, OperatorKind, PlanGraph, SpoolId};
use crate::spool::{SpoolCandidate, SpooledGraph};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecisionOutcome {
    /// Re-evaluate the producer at every use site.
    Inline,
    /// Evaluate the producer once into a spool and read it back.
    Materialize,
}

/// Record of one inline-or-materialize choice, kept for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaterializationDecision {
    pub spool_id: SpoolId,
    pub producer: NodeId,
    pub outcome: DecisionOutcome,
    pub readers: usize,
    /// `r * c - (c + overhead)`: the estimated cost saved by materializing.
    /// `None` when the cost service had no estimate, which forces Inline.
    pub cost_delta: Option<f64>,
}

/// Final shape of the plan after every spool has been decided: inlined
/// spools are gone, materialized ones remain as write/read pairs.
#[derive(Debug, Clone)]
pub struct DecidedPlan {
    pub graph: PlanGraph,
    /// Surviving (materialized) spools with their post-rewrite read sites.
    pub spools: Vec<SpoolCandidate>,
    pub decisions: Vec<MaterializationDecision>,
}

/// Decides each spool candidate and rewrites the graph accordingly.
///
/// The rule: a candidate is materialized only when the producer is eligible
/// under the settings, its reader count reaches the threshold, and the cost
/// service estimates that one evaluation plus the write overhead beats `r`
/// re-evaluations. Anything the cost service cannot price is inlined.
pub struct MaterializationPlanner;

impl MaterializationPlanner {
    pub fn plan(
        spooled: &SpooledGraph,
        cost: &dyn CostModel,
        settings: &SpoolSettings,
    ) -> Result<DecidedPlan> {
        let mut decisions = Vec::with_capacity(spooled.candidates.len());
        for cand in &spooled.candidates {
            let producer_op = &spooled.graph.node(cand.producer)?.op;
            let subtree = cost.subtree_cost(&spooled.graph, cand.producer);
            let overhead = cost.write_overhead(&spooled.graph, cand.producer);
            let cost_delta = match (subtree, overhead) {
                (Some(c), Some(w)) => Some(cand.readers as f64 * c - (c + w)),
                _ => None,
            };

            let outcome = if settings.full_aggregate_only
                && !matches!(producer_op, OperatorKind::Aggregate { .. })
            {
                DecisionOutcome::Inline
            } else if cand.readers < settings.materialize_threshold {
                DecisionOutcome::Inline
            } else {
                match cost_delta {
                    Some(delta) if delta > 0.0 => DecisionOutcome::Materialize,
                    _ => DecisionOutcome::Inline,
                }
            };

            log::debug!(
                "{}: {:?} (producer {}, {} readers, delta {:?})",
                cand.spool_id,
                outcome,
                cand.producer,
                cand.readers,
                cost_delta
            );
            decisions.push(MaterializationDecision {
                spool_id: cand.spool_id,
                producer: cand.producer,
                outcome,
                readers: cand.readers,
                cost_delta,
            });
        }

        let mut builder = GraphBuilder::from_graph(&spooled.graph);
        for (cand, decision) in spooled.candidates.iter().zip(&decisions) {
            match decision.outcome {
                DecisionOutcome::Inline => {
                    expand_spool(&mut builder, cand.spool_id, cand.producer)?;
                }
                DecisionOutcome::Materialize => {
                    builder.set_cost(cand.producer, cost.subtree_cost(&spooled.graph, cand.producer))?;
                }
            }
        }
        let graph = builder.finish(spooled.graph.root())?;

        let spools = spooled
            .candidates
            .iter()
            .zip(&decisions)
            .filter(|(_, d)| d.outcome == DecisionOutcome::Materialize)
            .map(|(cand, _)| refresh_candidate(&graph, cand))
            .collect();
        Ok(DecidedPlan {
            graph,
            spools,
            decisions,
        })
    }

    /// Converts one already-materialized spool to Inline and re-applies the
    /// rewrite. Used when physical ordering finds the spool unschedulable.
    pub fn force_inline(decided: &DecidedPlan, spool_id: SpoolId) -> Result<DecidedPlan> {
        let cand = decided
            .spools
            .iter()
            .find(|c| c.spool_id == spool_id)
            .ok_or_else(|| {
                Error::internal(format!("{} is not a materialized spool", spool_id))
            })?;

        let mut builder = GraphBuilder::from_graph(&decided.graph);
        expand_spool(&mut builder, spool_id, cand.producer)?;
        let graph = builder.finish(decided.graph.root())?;

        let decisions = decided
            .decisions
            .iter()
            .cloned()
            .map(|mut d| {
                if d.spool_id == spool_id {
                    d.outcome = DecisionOutcome::Inline;
                }
                d
            })
            .collect();
        // Inlining one spool can duplicate read sites of the others, so
        // every survivor is refreshed against the new graph.
        let spools = decided
            .spools
            .iter()
            .filter(|c| c.spool_id != spool_id)
            .map(|c| refresh_candidate(&graph, c))
            .collect();
        Ok(DecidedPlan {
            graph,
            spools,
            decisions,
        })
    }
}

/// Replaces every current read of `spool_id` with the producer subtree. The
/// first use site reuses the original producer nodes; every further site
/// gets a fresh copy so each use re-evaluates independently. The orphaned
/// write is pruned when the builder seals.
fn expand_spool(builder: &mut GraphBuilder, spool_id: SpoolId, producer: NodeId) -> Result<()> {
    let reads: FxHashSet<NodeId> = builder
        .node_ids()
        .into_iter()
        .filter(|id| {
            builder.node(*id).is_some_and(|n| {
                matches!(&n.op, OperatorKind::SpoolRead { spool_id: sid, .. } if *sid == spool_id)
            })
        })
        .collect();

    let mut sites: Vec<(NodeId, usize)> = Vec::new();
    for id in builder.node_ids() {
        if let Some(node) = builder.node(id) {
            for (slot, child) in node.children.iter().enumerate() {
                if reads.contains(child) {
                    sites.push((id, slot));
                }
            }
        }
    }

    let mut first = true;
    for (parent, slot) in sites {
        let replacement = if first {
            first = false;
            producer
        } else {
            copy_subtree(builder, producer)?
        };
        builder.set_child(parent, slot, replacement)?;
    }
    Ok(())
}

/// Deep-copies a subtree with fresh node ids. Copying stops at spool reads:
/// the copy is a fresh read over the same write, so sharing of other spools
/// inside the subtree is preserved.
fn copy_subtree(builder: &mut GraphBuilder, root: NodeId) -> Result<NodeId> {
    let mut memo: FxHashMap<NodeId, NodeId> = FxHashMap::default();
    copy_rec(builder, root, &mut memo)
}

fn copy_rec(
    builder: &mut GraphBuilder,
    id: NodeId,
    memo: &mut FxHashMap<NodeId, NodeId>,
) -> Result<NodeId> {
    if let Some(&copied) = memo.get(&id) {
        return Ok(copied);
    }
    let node = builder
        .node(id)
        .ok_or_else(|| Error::dangling_node(format!("{} is not in the builder", id)))?
        .clone();
    let new_id = if matches!(node.op, OperatorKind::SpoolRead { .. }) {
        builder.add_node(node.op, node.children)
    } else {
        let mut children = Vec::with_capacity(node.children.len());
        for &child in &node.children {
            children.push(copy_rec(builder, child, memo)?);
        }
        builder.add_node(node.op, children)
    };
    memo.insert(id, new_id);
    Ok(new_id)
}

/// Recomputes a candidate's read sites against a rewritten graph.
fn refresh_candidate(graph: &PlanGraph, cand: &SpoolCandidate) -> SpoolCandidate {
    let read_nodes: Vec<NodeId> = graph
        .iter()
        .filter(|n| {
            matches!(&n.op, OperatorKind::SpoolRead { spool_id, .. } if *spool_id == cand.spool_id)
        })
        .map(|n| n.id)
        .collect();
    SpoolCandidate {
        spool_id: cand.spool_id,
        write_node: cand.write_node,
        producer: cand.producer,
        readers: read_nodes.len(),
        read_nodes,
        mode: cand.mode,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::SubexpressionDetector;
    use crate::spool::SpoolInserter;
    use crate::test_utils::{
        FixedCostModel, make_aggregate, make_cross, make_scan, scenario_plan, to_graph,
    };
    use spoolplan_ir::LogicalPlan;

    fn spooled(plan: &LogicalPlan, cost: &dyn CostModel) -> SpooledGraph {
        let detection = SubexpressionDetector::detect(&to_graph(plan)).unwrap();
        SpoolInserter::insert(&detection, cost).unwrap()
    }

    fn count_ops(graph: &PlanGraph, name: &str) -> usize {
        graph.iter().filter(|n| n.op.name() == name).count()
    }

    #[test]
    fn profitable_spool_is_materialized() {
        let cost = FixedCostModel::new(100.0, 10.0);
        let spooled = spooled(&scenario_plan(), &cost);

        let decided =
            MaterializationPlanner::plan(&spooled, &cost, &SpoolSettings::default()).unwrap();

        assert_eq!(decided.decisions.len(), 1);
        let decision = &decided.decisions[0];
        assert_eq!(decision.outcome, DecisionOutcome::Materialize);
        // 2 * 100 - (100 + 10)
        assert_eq!(decision.cost_delta, Some(90.0));

        assert_eq!(decided.spools.len(), 1);
        assert_eq!(count_ops(&decided.graph, "SpoolWrite"), 1);
        assert_eq!(count_ops(&decided.graph, "SpoolRead"), 2);
    }

    #[test]
    fn materialized_producer_carries_cost_estimate() {
        let cost = FixedCostModel::new(100.0, 10.0);
        let spooled = spooled(&scenario_plan(), &cost);

        let decided =
            MaterializationPlanner::plan(&spooled, &cost, &SpoolSettings::default()).unwrap();

        let producer = decided.graph.node(decided.spools[0].producer).unwrap();
        assert_eq!(producer.estimated_cost, Some(100.0));
    }

    #[test]
    fn expensive_write_is_inlined() {
        // 2 * 100 = 200 re-evaluation vs 100 + 150 = 250 spooled.
        let cost = FixedCostModel::new(100.0, 150.0);
        let spooled = spooled(&scenario_plan(), &cost);

        let decided =
            MaterializationPlanner::plan(&spooled, &cost, &SpoolSettings::default()).unwrap();

        assert_eq!(decided.decisions[0].outcome, DecisionOutcome::Inline);
        assert_eq!(decided.decisions[0].cost_delta, Some(-50.0));
        assert!(decided.spools.is_empty());
        assert_eq!(count_ops(&decided.graph, "SpoolWrite"), 0);
        assert_eq!(count_ops(&decided.graph, "SpoolRead"), 0);
    }

    #[test]
    fn inlining_duplicates_the_producer() {
        let cost = FixedCostModel::new(100.0, 150.0);
        let spooled = spooled(&scenario_plan(), &cost);
        let joins_before = count_ops(&spooled.graph, "Join");

        let decided =
            MaterializationPlanner::plan(&spooled, &cost, &SpoolSettings::default()).unwrap();

        // The shared emps-depts join is evaluated twice again; the cross
        // join on top is unchanged.
        assert_eq!(count_ops(&decided.graph, "Join"), joins_before + 1);
        assert!(decided.graph.validate().is_ok());
    }

    #[test]
    fn missing_estimate_forces_inline() {
        let cost = FixedCostModel::without_estimates();
        let spooled = spooled(&scenario_plan(), &cost);

        let decided =
            MaterializationPlanner::plan(&spooled, &cost, &SpoolSettings::default()).unwrap();

        assert_eq!(decided.decisions[0].outcome, DecisionOutcome::Inline);
        assert_eq!(decided.decisions[0].cost_delta, None);
        assert!(decided.spools.is_empty());
    }

    #[test]
    fn threshold_above_reader_count_forces_inline() {
        let cost = FixedCostModel::new(100.0, 10.0);
        let spooled = spooled(&scenario_plan(), &cost);

        let settings = SpoolSettings::new(3, false);
        let decided = MaterializationPlanner::plan(&spooled, &cost, &settings).unwrap();

        assert_eq!(decided.decisions[0].outcome, DecisionOutcome::Inline);
        assert!(decided.spools.is_empty());
    }

    #[test]
    fn full_aggregate_only_rejects_join_producer() {
        let cost = FixedCostModel::new(100.0, 10.0);
        let spooled = spooled(&scenario_plan(), &cost);

        let settings = SpoolSettings::new(2, true);
        let decided = MaterializationPlanner::plan(&spooled, &cost, &settings).unwrap();

        assert_eq!(decided.decisions[0].outcome, DecisionOutcome::Inline);
        assert!(decided.spools.is_empty());
    }

    #[test]
    fn full_aggregate_only_accepts_aggregate_producer() {
        let agg = make_aggregate(make_scan("emps"));
        let plan = make_cross(agg.clone(), agg);
        let cost = FixedCostModel::new(100.0, 10.0);
        let spooled = spooled(&plan, &cost);

        let settings = SpoolSettings::new(2, true);
        let decided = MaterializationPlanner::plan(&spooled, &cost, &settings).unwrap();

        assert_eq!(decided.decisions[0].outcome, DecisionOutcome::Materialize);
        assert_eq!(decided.spools.len(), 1);
    }

    #[test]
    fn force_inline_removes_the_spool() {
        let cost = FixedCostModel::new(100.0, 10.0);
        let spooled = spooled(&scenario_plan(), &cost);
        let decided =
            MaterializationPlanner::plan(&spooled, &cost, &SpoolSettings::default()).unwrap();
        assert_eq!(decided.spools.len(), 1);
        let sid = decided.spools[0].spool_id;

        let forced = MaterializationPlanner::force_inline(&decided, sid).unwrap();

        assert!(forced.spools.is_empty());
        assert_eq!(count_ops(&forced.graph, "SpoolRead"), 0);
        assert_eq!(forced.decisions[0].outcome, DecisionOutcome::Inline);
        assert!(forced.graph.validate().is_ok());
    }

    #[test]
    fn force_inline_rejects_unknown_spool() {
        let cost = FixedCostModel::new(100.0, 150.0);
        let spooled = spooled(&scenario_plan(), &cost);
        let decided =
            MaterializationPlanner::plan(&spooled, &cost, &SpoolSettings::default()).unwrap();

        let err = MaterializationPlanner::force_inline(&decided, SpoolId(7)).unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }
}
