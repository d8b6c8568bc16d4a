use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use spoolplan_common::Result;

use crate::graph::{GraphBuilder, NodeId, PlanGraph};
use crate::signature::{SignatureKey, op_is_deterministic};

/// One unified subtree and how many parent edges now reference it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedSubtree {
    pub node: NodeId,
    pub readers: usize,
}

/// Output of subexpression detection: a graph where structurally equal
/// subtrees have been folded into single shared nodes, plus the shared
/// nodes themselves.
#[derive(Debug, Clone)]
pub struct Detection {
    pub graph: PlanGraph,
    pub shared: Vec<SharedSubtree>,
}

/// Folds structurally equivalent subtrees of a plan into shared nodes.
///
/// Works bottom-up: children are unified before their parents, so when two
/// large subtrees match, their interiors collapse into the same
/// representative and the match surfaces at the largest common root —
/// smaller shared pieces are subsumed without special handling.
pub struct SubexpressionDetector;

struct DetectState {
    builder: GraphBuilder,
    /// fingerprint -> representative node ids sharing that fingerprint.
    /// More than one entry per bucket only on fingerprint collision.
    buckets: FxHashMap<u64, Vec<NodeId>>,
    /// Full canonical content per representative, compared before any
    /// merge; equality by fingerprint alone is never trusted.
    rep_keys: FxHashMap<NodeId, SignatureKey>,
    ref_counts: FxHashMap<NodeId, usize>,
    deterministic: FxHashMap<NodeId, bool>,
}

impl SubexpressionDetector {
    pub fn detect(input: &PlanGraph) -> Result<Detection> {
        input.validate()?;
        let mut state = DetectState {
            builder: GraphBuilder::new(),
            buckets: FxHashMap::default(),
            rep_keys: FxHashMap::default(),
            ref_counts: FxHashMap::default(),
            deterministic: FxHashMap::default(),
        };
        let root = Self::unify(input, input.root(), &mut state)?;
        let graph = state.builder.finish(root)?;

        let mut shared: Vec<SharedSubtree> = graph
            .iter()
            .filter(|node| node.id != root)
            .filter_map(|node| {
                let readers = *state.ref_counts.get(&node.id).unwrap_or(&0);
                (readers >= 2).then_some(SharedSubtree {
                    node: node.id,
                    readers,
                })
            })
            .collect();
        shared.sort_by_key(|s| s.node);

        log::debug!(
            "subexpression detection: {} input nodes folded to {}, {} shared subtrees",
            input.len(),
            graph.len(),
            shared.len()
        );
        Ok(Detection { graph, shared })
    }

    /// Rebuilds the subtree rooted at `old_id` inside the new graph,
    /// returning the (possibly pre-existing) representative node id.
    fn unify(input: &PlanGraph, old_id: NodeId, state: &mut DetectState) -> Result<NodeId> {
        let old = input.node(old_id)?;
        let mut children = Vec::with_capacity(old.children.len());
        for &child in &old.children {
            children.push(Self::unify(input, child, state)?);
        }

        let self_deterministic = op_is_deterministic(&old.op);
        let eligible = self_deterministic
            && children
                .iter()
                .all(|c| *state.deterministic.get(c).unwrap_or(&false));

        let key = SignatureKey::canonical(&old.op, &children);
        if eligible {
            let fingerprint = key.fingerprint();
            if let Some(candidates) = state.buckets.get(&fingerprint) {
                for &rep in candidates {
                    // Structural confirmation guards against fingerprint
                    // collisions; unconfirmed equality means no merge.
                    if state.rep_keys.get(&rep) == Some(&key) {
                        *state.ref_counts.entry(rep).or_insert(0) += 1;
                        return Ok(rep);
                    }
                }
            }
        }

        let id = state.builder.add_node(old.op.clone(), children);
        state.deterministic.insert(id, eligible);
        state.ref_counts.insert(id, 1);
        if eligible {
            state
                .buckets
                .entry(key.fingerprint())
                .or_default()
                .push(id);
            state.rep_keys.insert(id, key);
        }
        Ok(id)
    }
}
