use std::fmt;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use spoolplan_common::{Error, Result};

use crate::graph::{NodeId, OperatorKind, SpoolId};
use crate::materialize::DecidedPlan;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct StageId(pub u32);

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stage_{}", self.0)
    }
}

/// A maximal pipeline of operators delimited by spool boundaries. Stage 0
/// is always the stage that delivers the final result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub id: StageId,
    pub head: NodeId,
    /// Nodes of the stage in top-down traversal order, head first.
    pub nodes: Vec<NodeId>,
    /// Set when the stage head is a spool write.
    pub produces: Option<SpoolId>,
    /// Spools read anywhere inside the stage, in first-encounter order.
    pub consumes: Vec<SpoolId>,
}

/// Stages plus their must-run-before edges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDependencyGraph {
    pub stages: Vec<Stage>,
    /// (producer stage, consumer stage) pairs.
    pub edges: Vec<(StageId, StageId)>,
}

impl StageDependencyGraph {
    pub fn stage(&self, id: StageId) -> Option<&Stage> {
        self.stages.iter().find(|s| s.id == id)
    }

    /// Kahn's algorithm with smallest-id-first tie breaking, so the order
    /// is total and reproducible. `None` when the edges contain a cycle.
    pub fn topological_order(&self) -> Option<Vec<StageId>> {
        let mut in_degree: FxHashMap<StageId, usize> =
            self.stages.iter().map(|s| (s.id, 0)).collect();
        for (_, consumer) in &self.edges {
            *in_degree.get_mut(consumer)? += 1;
        }

        let mut ready: Vec<StageId> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        ready.sort_unstable();

        let mut order = Vec::with_capacity(self.stages.len());
        while let Some(&next) = ready.first() {
            ready.remove(0);
            order.push(next);
            for (producer, consumer) in &self.edges {
                if *producer == next {
                    let degree = in_degree.get_mut(consumer)?;
                    *degree -= 1;
                    if *degree == 0 {
                        let pos = ready.partition_point(|id| *id < *consumer);
                        ready.insert(pos, *consumer);
                    }
                }
            }
        }
        (order.len() == self.stages.len()).then_some(order)
    }
}

/// Outcome of one ordering attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum OrderResult {
    Ordered {
        stages: StageDependencyGraph,
        /// Execution order: every producer stage before its consumers.
        order: Vec<StageId>,
    },
    /// A spool whose stages cannot be linearized; the caller is expected to
    /// inline it and retry.
    SelfReferential(SpoolId),
}

/// Cuts the decided plan into stages at spool boundaries and linearizes
/// them so every spool is fully defined before its first read.
pub struct PhysicalOrderer;

impl PhysicalOrderer {
    pub fn try_order(decided: &DecidedPlan) -> Result<OrderResult> {
        let writes: FxHashMap<NodeId, SpoolId> = decided
            .spools
            .iter()
            .map(|c| (c.write_node, c.spool_id))
            .collect();

        // Stage 0 runs the root pipeline, then one stage per spool.
        let mut heads: Vec<(NodeId, Option<SpoolId>)> = vec![(decided.graph.root(), None)];
        heads.extend(decided.spools.iter().map(|c| (c.write_node, Some(c.spool_id))));

        let mut stages = Vec::with_capacity(heads.len());
        for (index, (head, produces)) in heads.into_iter().enumerate() {
            let id = StageId(index as u32);
            let mut nodes = Vec::new();
            let mut consumes = Vec::new();
            let mut stack = vec![head];
            while let Some(node_id) = stack.pop() {
                nodes.push(node_id);
                let node = decided.graph.node(node_id)?;
                match &node.op {
                    // A read's child is the back-reference to the write; the
                    // producer pipeline belongs to the write's own stage.
                    OperatorKind::SpoolRead { spool_id, .. } => {
                        if !consumes.contains(spool_id) {
                            consumes.push(*spool_id);
                        }
                    }
                    _ => {
                        for &child in node.children.iter().rev() {
                            // Does not recurse into another stage's head;
                            // only the initial head may be a write.
                            debug_assert!(
                                !writes.contains_key(&child) || node_id == head,
                                "write reachable other than through a read"
                            );
                            stack.push(child);
                        }
                    }
                }
            }
            stages.push(Stage {
                id,
                head,
                nodes,
                produces,
                consumes,
            });
        }

        let producer_stage: FxHashMap<SpoolId, StageId> = stages
            .iter()
            .filter_map(|s| s.produces.map(|sid| (sid, s.id)))
            .collect();
        let mut edges = Vec::new();
        for stage in &stages {
            for sid in &stage.consumes {
                if stage.produces == Some(*sid) {
                    return Ok(OrderResult::SelfReferential(*sid));
                }
                let producer = producer_stage.get(sid).ok_or_else(|| {
                    Error::internal(format!("{} has no producer stage", sid))
                })?;
                edges.push((*producer, stage.id));
            }
        }

        let graph = StageDependencyGraph { stages, edges };
        match graph.topological_order() {
            Some(order) => Ok(OrderResult::Ordered {
                stages: graph,
                order,
            }),
            None => {
                // A stage cycle that is not a direct self-reference; break
                // it at the smallest involved spool.
                let sid = graph
                    .stages
                    .iter()
                    .filter_map(|s| s.produces)
                    .min()
                    .ok_or_else(|| Error::cyclic_plan("stage graph cycle without any spool"))?;
                Ok(OrderResult::SelfReferential(sid))
            }
        }
    }

    /// Like [`PhysicalOrderer::try_order`] but treats an unschedulable
    /// spool as an error instead of asking for a retry.
    pub fn order(decided: &DecidedPlan) -> Result<(StageDependencyGraph, Vec<StageId>)> {
        match Self::try_order(decided)? {
            OrderResult::Ordered { stages, order } => Ok((stages, order)),
            OrderResult::SelfReferential(sid) => Err(Error::cyclic_plan(format!(
                "{} cannot run before its own readers",
                sid
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SpoolSettings;
    use crate::cost::CostModel;
    use crate::detect::SubexpressionDetector;
    use crate::materialize::MaterializationPlanner;
    use crate::spool::SpoolInserter;
    use crate::test_utils::{
        FixedCostModel, emps_depts_join, make_aggregate, make_cross, make_scan, scenario_plan,
        to_graph,
    };
    use spoolplan_ir::LogicalPlan;

    fn decide(plan: &LogicalPlan, cost: &dyn CostModel) -> DecidedPlan {
        let detection = SubexpressionDetector::detect(&to_graph(plan)).unwrap();
        let spooled = SpoolInserter::insert(&detection, cost).unwrap();
        MaterializationPlanner::plan(&spooled, cost, &SpoolSettings::default()).unwrap()
    }

    #[test]
    fn spool_free_plan_is_one_stage() {
        let cost = FixedCostModel::new(100.0, 10.0);
        let decided = decide(&emps_depts_join(), &cost);

        let (stages, order) = PhysicalOrderer::order(&decided).unwrap();
        assert_eq!(stages.stages.len(), 1);
        assert_eq!(order, vec![StageId(0)]);

        let root_stage = &stages.stages[0];
        assert_eq!(root_stage.head, decided.graph.root());
        assert_eq!(root_stage.produces, None);
        assert!(root_stage.consumes.is_empty());
        assert_eq!(root_stage.nodes.len(), decided.graph.len());
    }

    #[test]
    fn materialized_spool_splits_into_two_stages() {
        let cost = FixedCostModel::new(100.0, 10.0);
        let decided = decide(&scenario_plan(), &cost);
        assert_eq!(decided.spools.len(), 1);
        let sid = decided.spools[0].spool_id;

        let (stages, order) = PhysicalOrderer::order(&decided).unwrap();
        assert_eq!(stages.stages.len(), 2);

        let root_stage = stages.stage(StageId(0)).unwrap();
        assert_eq!(root_stage.produces, None);
        assert_eq!(root_stage.consumes, vec![sid]);

        let spool_stage = stages.stage(StageId(1)).unwrap();
        assert_eq!(spool_stage.produces, Some(sid));
        assert!(spool_stage.consumes.is_empty());

        // The producer stage must run first.
        assert_eq!(order, vec![StageId(1), StageId(0)]);
        assert_eq!(stages.edges, vec![(StageId(1), StageId(0))]);
    }

    #[test]
    fn stages_partition_the_graph() {
        let cost = FixedCostModel::new(100.0, 10.0);
        let decided = decide(&scenario_plan(), &cost);

        let (stages, _) = PhysicalOrderer::order(&decided).unwrap();
        let mut seen: Vec<_> = stages
            .stages
            .iter()
            .flat_map(|s| s.nodes.iter().copied())
            .collect();
        seen.sort_unstable();
        let mut all: Vec<_> = decided.graph.iter().map(|n| n.id).collect();
        all.sort_unstable();
        assert_eq!(seen, all);
    }

    #[test]
    fn independent_spools_order_before_the_root_stage() {
        let join_side = make_cross(emps_depts_join(), emps_depts_join());
        let agg = make_aggregate(make_scan("ts"));
        let agg_side = make_cross(agg.clone(), agg);
        let plan = make_cross(join_side, agg_side);
        let cost = FixedCostModel::new(100.0, 10.0);
        let decided = decide(&plan, &cost);
        assert_eq!(decided.spools.len(), 2);

        let (stages, order) = PhysicalOrderer::order(&decided).unwrap();
        assert_eq!(stages.stages.len(), 3);
        assert_eq!(order.last(), Some(&StageId(0)));
        for stage in &stages.stages {
            for sid in &stage.consumes {
                let producer = stages
                    .stages
                    .iter()
                    .find(|s| s.produces == Some(*sid))
                    .unwrap();
                let producer_pos = order.iter().position(|id| *id == producer.id).unwrap();
                let consumer_pos = order.iter().position(|id| *id == stage.id).unwrap();
                assert!(producer_pos < consumer_pos);
            }
        }
    }

    #[test]
    fn ordering_is_deterministic() {
        let cost = FixedCostModel::new(100.0, 10.0);
        let decided = decide(&scenario_plan(), &cost);

        let first = PhysicalOrderer::order(&decided).unwrap();
        let second = PhysicalOrderer::order(&decided).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn topological_order_rejects_cycles() {
        let stage = |n: u32, produces| Stage {
            id: StageId(n),
            head: NodeId(n),
            nodes: vec![NodeId(n)],
            produces,
            consumes: vec![],
        };
        let graph = StageDependencyGraph {
            stages: vec![stage(0, None), stage(1, Some(SpoolId(0)))],
            edges: vec![(StageId(0), StageId(1)), (StageId(1), StageId(0))],
        };
        assert_eq!(graph.topological_order(), None);
    }
}
