use serde::{Deserialize, Serialize};
use spoolplan_common::Result;

use crate::cost::CostModel;
use crate::detect::Detection;
use crate::graph::{GraphBuilder, NodeId, OperatorKind, PlanGraph, SpoolId, SpoolMode};

/// One shared subtree made explicit as a write/read pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpoolCandidate {
    pub spool_id: SpoolId,
    pub write_node: NodeId,
    pub read_nodes: Vec<NodeId>,
    /// Root of the producer subtree the write evaluates.
    pub producer: NodeId,
    pub readers: usize,
    pub mode: SpoolMode,
}

/// Graph with all sharing made explicit through spools, ready for the
/// materialization decision.
#[derive(Debug, Clone)]
pub struct SpooledGraph {
    pub graph: PlanGraph,
    pub candidates: Vec<SpoolCandidate>,
}

/// Wraps every shared node in a spool: one SpoolWrite as the node's sole
/// parent-side proxy, one SpoolRead per former use site. Purely structural;
/// nothing is materialized here.
pub struct SpoolInserter;

impl SpoolInserter {
    pub fn insert(detection: &Detection, cost: &dyn CostModel) -> Result<SpooledGraph> {
        let mut builder = GraphBuilder::from_graph(&detection.graph);
        let mut candidates = Vec::with_capacity(detection.shared.len());

        for (index, shared) in detection.shared.iter().enumerate() {
            let spool_id = SpoolId(index as u32);
            let schema = detection.graph.output_schema(shared.node)?;
            let mode = if cost.prefer_eager_write(&detection.graph, shared.node) {
                SpoolMode::Eager
            } else {
                SpoolMode::Lazy
            };

            let write_node = builder.add_node(
                OperatorKind::SpoolWrite { spool_id, mode },
                vec![shared.node],
            );

            // Rewire every use site. Parents come from the pre-insertion
            // graph so the write we just added is not seen as one.
            let mut read_nodes = Vec::with_capacity(shared.readers);
            for parent in detection.graph.parents_of(shared.node) {
                let slots: Vec<usize> = builder
                    .node(parent)
                    .map(|n| {
                        n.children
                            .iter()
                            .enumerate()
                            .filter(|(_, c)| **c == shared.node)
                            .map(|(i, _)| i)
                            .collect()
                    })
                    .unwrap_or_default();
                for slot in slots {
                    let read = builder.add_node(
                        OperatorKind::SpoolRead {
                            spool_id,
                            schema: schema.clone(),
                        },
                        vec![write_node],
                    );
                    builder.set_child(parent, slot, read)?;
                    read_nodes.push(read);
                }
            }

            log::debug!(
                "inserted {} over {} ({} readers, {:?} write)",
                spool_id,
                shared.node,
                read_nodes.len(),
                mode
            );
            candidates.push(SpoolCandidate {
                spool_id,
                write_node,
                producer: shared.node,
                readers: read_nodes.len(),
                read_nodes,
                mode,
            });
        }

        let graph = builder.finish(detection.graph.root())?;
        Ok(SpooledGraph { graph, candidates })
    }
}
