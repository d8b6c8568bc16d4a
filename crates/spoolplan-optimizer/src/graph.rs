use std::fmt;

use indexmap::IndexMap;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use spoolplan_common::{Error, Result};
use spoolplan_ir::{Expr, JoinType, Literal, LogicalPlan, PlanSchema, SortExpr};

/// Stable identity of a plan node within one graph lineage. Ids are never
/// reused, so a node kept across graph versions keeps its id.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct SpoolId(pub u32);

impl fmt::Display for SpoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "spool_{}", self.0)
    }
}

/// When a spool's producer runs relative to its first reader.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum SpoolMode {
    /// Populate on first pull.
    Lazy,
    /// Populate fully before any read may start.
    Eager,
}

/// Closed set of relational operators the planner understands. Every pass
/// matches this exhaustively, so a new operator is a compile-time obligation
/// everywhere.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperatorKind {
    Scan {
        table_name: String,
        schema: PlanSchema,
    },
    Filter {
        predicate: Expr,
    },
    Project {
        expressions: Vec<Expr>,
        schema: PlanSchema,
    },
    Aggregate {
        group_by: Vec<Expr>,
        aggregates: Vec<Expr>,
        schema: PlanSchema,
    },
    Join {
        join_type: JoinType,
        condition: Option<Expr>,
        schema: PlanSchema,
    },
    Sort {
        sort_exprs: Vec<SortExpr>,
    },
    Limit {
        limit: Option<u64>,
        offset: u64,
    },
    Union {
        all: bool,
    },
    Values {
        rows: Vec<Vec<Literal>>,
        schema: PlanSchema,
    },
    /// Producer side of a spool; its single child is the shared subtree.
    SpoolWrite { spool_id: SpoolId, mode: SpoolMode },
    /// Consumer side of a spool; its single child is the SpoolWrite it
    /// reads from (an id back-reference, not ownership of the producer).
    SpoolRead { spool_id: SpoolId, schema: PlanSchema },
}

impl OperatorKind {
    pub fn name(&self) -> &'static str {
        match self {
            OperatorKind::Scan { .. } => "Scan",
            OperatorKind::Filter { .. } => "Filter",
            OperatorKind::Project { .. } => "Project",
            OperatorKind::Aggregate { .. } => "Aggregate",
            OperatorKind::Join { .. } => "Join",
            OperatorKind::Sort { .. } => "Sort",
            OperatorKind::Limit { .. } => "Limit",
            OperatorKind::Union { .. } => "Union",
            OperatorKind::Values { .. } => "Values",
            OperatorKind::SpoolWrite { .. } => "SpoolWrite",
            OperatorKind::SpoolRead { .. } => "SpoolRead",
        }
    }

    /// Number of child edges the operator must carry.
    fn arity(&self) -> usize {
        match self {
            OperatorKind::Scan { .. } | OperatorKind::Values { .. } => 0,
            OperatorKind::Filter { .. }
            | OperatorKind::Project { .. }
            | OperatorKind::Aggregate { .. }
            | OperatorKind::Sort { .. }
            | OperatorKind::Limit { .. }
            | OperatorKind::SpoolWrite { .. }
            | OperatorKind::SpoolRead { .. } => 1,
            OperatorKind::Join { .. } | OperatorKind::Union { .. } => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanNode {
    pub id: NodeId,
    pub op: OperatorKind,
    pub children: Vec<NodeId>,
    /// Estimated evaluation cost of the subtree rooted here, filled in from
    /// the external cost service during planning. `None` until then.
    pub estimated_cost: Option<f64>,
}

/// Immutable DAG of plan nodes in a single owning arena. Multiple parents
/// per node are permitted (that is what makes sharing representable);
/// cycles are rejected. Rewrites go through [`GraphBuilder`] and produce a
/// new graph version that reuses unchanged nodes by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanGraph {
    nodes: IndexMap<NodeId, PlanNode>,
    root: NodeId,
    next_id: u32,
}

impl PlanGraph {
    /// Imports an external logical plan (a tree, no sharing yet).
    pub fn from_logical(plan: &LogicalPlan) -> Result<PlanGraph> {
        let mut builder = GraphBuilder::new();
        let root = import_logical(&mut builder, plan);
        builder.finish(root)
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> Result<&PlanNode> {
        self.nodes
            .get(&id)
            .ok_or_else(|| Error::dangling_node(format!("{} is not in the plan arena", id)))
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Nodes in arena insertion order; stable across runs.
    pub fn iter(&self) -> impl Iterator<Item = &PlanNode> {
        self.nodes.values()
    }

    pub fn children_of(&self, id: NodeId) -> Result<&[NodeId]> {
        Ok(&self.node(id)?.children)
    }

    /// All nodes holding a child edge to `id`, in arena order.
    pub fn parents_of(&self, id: NodeId) -> Vec<NodeId> {
        self.nodes
            .values()
            .filter(|n| n.children.contains(&id))
            .map(|n| n.id)
            .collect()
    }

    /// Output schema of a node. Row-preserving operators take their child's
    /// schema; a SpoolRead exposes the schema of the subtree it wraps.
    pub fn output_schema(&self, id: NodeId) -> Result<PlanSchema> {
        let node = self.node(id)?;
        match &node.op {
            OperatorKind::Scan { schema, .. }
            | OperatorKind::Project { schema, .. }
            | OperatorKind::Aggregate { schema, .. }
            | OperatorKind::Join { schema, .. }
            | OperatorKind::Values { schema, .. }
            | OperatorKind::SpoolRead { schema, .. } => Ok(schema.clone()),
            OperatorKind::Filter { .. }
            | OperatorKind::Sort { .. }
            | OperatorKind::Limit { .. }
            | OperatorKind::Union { .. }
            | OperatorKind::SpoolWrite { .. } => {
                let child = *node.children.first().ok_or_else(|| {
                    Error::internal(format!("{} has no child to take a schema from", id))
                })?;
                self.output_schema(child)
            }
        }
    }

    /// Node ids with children ordered before parents. Every node appears
    /// exactly once even when shared.
    pub fn post_order(&self) -> Result<Vec<NodeId>> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut done: FxHashSet<NodeId> = FxHashSet::default();
        // (id, children already pushed)
        let mut stack = vec![(self.root, false)];
        while let Some((id, expanded)) = stack.pop() {
            if done.contains(&id) {
                continue;
            }
            if expanded {
                done.insert(id);
                order.push(id);
            } else {
                stack.push((id, true));
                for &child in self.children_of(id)?.iter().rev() {
                    if !done.contains(&child) {
                        stack.push((child, false));
                    }
                }
            }
        }
        Ok(order)
    }

    /// Structural soundness: all child references resolve, operator arities
    /// hold, spool pairs agree, and the graph is acyclic.
    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(Error::EmptyPlan);
        }
        if !self.contains(self.root) {
            return Err(Error::dangling_node(format!(
                "root {} is not in the plan arena",
                self.root
            )));
        }
        for node in self.nodes.values() {
            if node.children.len() != node.op.arity() {
                return Err(Error::internal(format!(
                    "{} ({}) has {} children, expected {}",
                    node.id,
                    node.op.name(),
                    node.children.len(),
                    node.op.arity()
                )));
            }
            for &child in &node.children {
                let child_node = self.node(child)?;
                if let OperatorKind::SpoolRead { spool_id, .. } = &node.op {
                    match &child_node.op {
                        OperatorKind::SpoolWrite {
                            spool_id: write_id, ..
                        } if write_id == spool_id => {}
                        OperatorKind::Scan { .. }
                        | OperatorKind::Filter { .. }
                        | OperatorKind::Project { .. }
                        | OperatorKind::Aggregate { .. }
                        | OperatorKind::Join { .. }
                        | OperatorKind::Sort { .. }
                        | OperatorKind::Limit { .. }
                        | OperatorKind::Union { .. }
                        | OperatorKind::Values { .. }
                        | OperatorKind::SpoolWrite { .. }
                        | OperatorKind::SpoolRead { .. } => {
                            return Err(Error::internal(format!(
                                "{} reads {} but its child {} is not that spool's write",
                                node.id, spool_id, child
                            )));
                        }
                    }
                }
            }
        }
        self.check_acyclic()?;
        // Schema agreement needs acyclicity first; output_schema recurses
        // through child edges.
        for node in self.nodes.values() {
            if let OperatorKind::SpoolRead { spool_id, schema } = &node.op {
                let produced = self.output_schema(node.children[0])?;
                if produced != *schema {
                    return Err(Error::schema_mismatch(format!(
                        "{} does not expose what {} produces",
                        node.id, spool_id
                    )));
                }
            }
        }
        Ok(())
    }

    fn check_acyclic(&self) -> Result<()> {
        // Iterative three-color DFS from the root.
        let mut visiting: FxHashSet<NodeId> = FxHashSet::default();
        let mut done: FxHashSet<NodeId> = FxHashSet::default();
        let mut stack = vec![(self.root, false)];
        while let Some((id, expanded)) = stack.pop() {
            if expanded {
                visiting.remove(&id);
                done.insert(id);
                continue;
            }
            if done.contains(&id) {
                continue;
            }
            if !visiting.insert(id) {
                return Err(Error::cyclic_plan(format!("{} reaches itself", id)));
            }
            stack.push((id, true));
            for &child in self.children_of(id)? {
                if visiting.contains(&child) {
                    return Err(Error::cyclic_plan(format!("{} reaches itself", child)));
                }
                if !done.contains(&child) {
                    stack.push((child, false));
                }
            }
        }
        Ok(())
    }

    pub(crate) fn next_id(&self) -> u32 {
        self.next_id
    }
}

fn import_logical(builder: &mut GraphBuilder, plan: &LogicalPlan) -> NodeId {
    match plan {
        LogicalPlan::Scan { table_name, schema } => builder.add_node(
            OperatorKind::Scan {
                table_name: table_name.clone(),
                schema: schema.clone(),
            },
            vec![],
        ),
        LogicalPlan::Filter { input, predicate } => {
            let child = import_logical(builder, input);
            builder.add_node(
                OperatorKind::Filter {
                    predicate: predicate.clone(),
                },
                vec![child],
            )
        }
        LogicalPlan::Project {
            input,
            expressions,
            schema,
        } => {
            let child = import_logical(builder, input);
            builder.add_node(
                OperatorKind::Project {
                    expressions: expressions.clone(),
                    schema: schema.clone(),
                },
                vec![child],
            )
        }
        LogicalPlan::Aggregate {
            input,
            group_by,
            aggregates,
            schema,
        } => {
            let child = import_logical(builder, input);
            builder.add_node(
                OperatorKind::Aggregate {
                    group_by: group_by.clone(),
                    aggregates: aggregates.clone(),
                    schema: schema.clone(),
                },
                vec![child],
            )
        }
        LogicalPlan::Join {
            left,
            right,
            join_type,
            condition,
            schema,
        } => {
            let left = import_logical(builder, left);
            let right = import_logical(builder, right);
            builder.add_node(
                OperatorKind::Join {
                    join_type: *join_type,
                    condition: condition.clone(),
                    schema: schema.clone(),
                },
                vec![left, right],
            )
        }
        LogicalPlan::Sort { input, sort_exprs } => {
            let child = import_logical(builder, input);
            builder.add_node(
                OperatorKind::Sort {
                    sort_exprs: sort_exprs.clone(),
                },
                vec![child],
            )
        }
        LogicalPlan::Limit {
            input,
            limit,
            offset,
        } => {
            let child = import_logical(builder, input);
            builder.add_node(
                OperatorKind::Limit {
                    limit: *limit,
                    offset: *offset,
                },
                vec![child],
            )
        }
        LogicalPlan::Union { left, right, all } => {
            let left = import_logical(builder, left);
            let right = import_logical(builder, right);
            builder.add_node(OperatorKind::Union { all: *all }, vec![left, right])
        }
        LogicalPlan::Values { rows, schema } => builder.add_node(
            OperatorKind::Values {
                rows: rows.clone(),
                schema: schema.clone(),
            },
            vec![],
        ),
    }
}

/// Construction site for the next graph version. Nodes carried over keep
/// their ids; new nodes get fresh ones. [`GraphBuilder::finish`] prunes
/// anything unreachable from the chosen root and validates the result, so
/// rewrites can leave stale subtrees behind without leaking them.
#[derive(Debug, Default)]
pub struct GraphBuilder {
    nodes: IndexMap<NodeId, PlanNode>,
    next_id: u32,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the builder with every node of an existing graph, ids intact.
    pub fn from_graph(graph: &PlanGraph) -> Self {
        Self {
            nodes: graph.nodes.clone(),
            next_id: graph.next_id(),
        }
    }

    pub fn add_node(&mut self, op: OperatorKind, children: Vec<NodeId>) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        self.nodes.insert(
            id,
            PlanNode {
                id,
                op,
                children,
                estimated_cost: None,
            },
        );
        id
    }

    pub fn node(&self, id: NodeId) -> Option<&PlanNode> {
        self.nodes.get(&id)
    }

    /// Node ids in insertion order.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.keys().copied().collect()
    }

    /// Rewires one child slot of `parent`. Slots are addressed by index so
    /// a parent holding the same child twice can be rewired per use site.
    pub fn set_child(&mut self, parent: NodeId, slot: usize, child: NodeId) -> Result<()> {
        let node = self
            .nodes
            .get_mut(&parent)
            .ok_or_else(|| Error::dangling_node(format!("{} is not in the builder", parent)))?;
        let slot_ref = node.children.get_mut(slot).ok_or_else(|| {
            Error::internal(format!("{} has no child slot {}", parent, slot))
        })?;
        *slot_ref = child;
        Ok(())
    }

    pub fn set_cost(&mut self, id: NodeId, cost: Option<f64>) -> Result<()> {
        let node = self
            .nodes
            .get_mut(&id)
            .ok_or_else(|| Error::dangling_node(format!("{} is not in the builder", id)))?;
        node.estimated_cost = cost;
        Ok(())
    }

    /// Seals the version: drops nodes unreachable from `root`, validates,
    /// and returns the immutable graph.
    pub fn finish(self, root: NodeId) -> Result<PlanGraph> {
        if !self.nodes.contains_key(&root) {
            return Err(Error::dangling_node(format!(
                "root {} is not in the builder",
                root
            )));
        }
        let mut reachable: FxHashSet<NodeId> = FxHashSet::default();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if !reachable.insert(id) {
                continue;
            }
            if let Some(node) = self.nodes.get(&id) {
                stack.extend(node.children.iter().copied());
            }
        }
        let nodes: IndexMap<NodeId, PlanNode> = self
            .nodes
            .into_iter()
            .filter(|(id, _)| reachable.contains(id))
            .collect();
        let graph = PlanGraph {
            nodes,
            root,
            next_id: self.next_id,
        };
        graph.validate()?;
        Ok(graph)
    }
}
