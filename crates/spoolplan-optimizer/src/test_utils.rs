use spoolplan_common::DataType;
use spoolplan_ir::{AggregateFunc, BinaryOp, Expr, JoinType, LogicalPlan, PlanField, PlanSchema};

use crate::cost::CostModel;
use crate::graph::{NodeId, PlanGraph};

pub(crate) fn emps_schema() -> PlanSchema {
    PlanSchema::from_fields(vec![
        PlanField::new("id", DataType::Int64).with_table("emps"),
        PlanField::new("dept_id", DataType::Int64).with_table("emps"),
        PlanField::new("salary", DataType::Float64).with_table("emps"),
    ])
}

pub(crate) fn depts_schema() -> PlanSchema {
    PlanSchema::from_fields(vec![
        PlanField::new("id", DataType::Int64).with_table("depts"),
        PlanField::new("budget", DataType::Float64).with_table("depts"),
    ])
}

pub(crate) fn make_scan(name: &str) -> LogicalPlan {
    let schema = match name {
        "emps" => emps_schema(),
        "depts" => depts_schema(),
        other => PlanSchema::from_fields(vec![
            PlanField::new("id", DataType::Int64).with_table(other),
        ]),
    };
    LogicalPlan::Scan {
        table_name: name.to_string(),
        schema,
    }
}

/// `emps INNER JOIN depts ON emps.dept_id = depts.id`
pub(crate) fn emps_depts_join() -> LogicalPlan {
    let left = make_scan("emps");
    let right = make_scan("depts");
    let schema = left.schema().merge(right.schema());
    LogicalPlan::Join {
        left: Box::new(left),
        right: Box::new(right),
        join_type: JoinType::Inner,
        condition: Some(Expr::binary(
            Expr::table_column("emps", "dept_id"),
            BinaryOp::Eq,
            Expr::table_column("depts", "id"),
        )),
        schema,
    }
}

pub(crate) fn make_cross(left: LogicalPlan, right: LogicalPlan) -> LogicalPlan {
    let schema = left.schema().merge(right.schema());
    LogicalPlan::Join {
        left: Box::new(left),
        right: Box::new(right),
        join_type: JoinType::Cross,
        condition: None,
        schema,
    }
}

pub(crate) fn make_filter(input: LogicalPlan, predicate: Expr) -> LogicalPlan {
    LogicalPlan::Filter {
        input: Box::new(input),
        predicate,
    }
}

/// `SELECT dept_id, SUM(salary) FROM <input> GROUP BY dept_id`
pub(crate) fn make_aggregate(input: LogicalPlan) -> LogicalPlan {
    LogicalPlan::Aggregate {
        input: Box::new(input),
        group_by: vec![Expr::column("dept_id")],
        aggregates: vec![Expr::Aggregate {
            func: AggregateFunc::Sum,
            arg: Some(Box::new(Expr::column("salary"))),
            distinct: false,
        }],
        schema: PlanSchema::from_fields(vec![
            PlanField::new("dept_id", DataType::Int64),
            PlanField::new("total_salary", DataType::Float64),
        ]),
    }
}

pub(crate) fn make_volatile_filter(input: LogicalPlan) -> LogicalPlan {
    make_filter(
        input,
        Expr::binary(
            Expr::ScalarFunction {
                name: "RAND".to_string(),
                args: vec![],
            },
            BinaryOp::Lt,
            Expr::Literal(spoolplan_ir::Literal::Float64(0.5.into())),
        ),
    )
}

/// The motivating plan: two identical `emps ⋈ depts` subtrees feeding a
/// cross product, filtered by a salary comparison.
pub(crate) fn scenario_plan() -> LogicalPlan {
    make_filter(
        make_cross(emps_depts_join(), emps_depts_join()),
        Expr::binary(
            Expr::table_column("emps", "salary"),
            BinaryOp::Gt,
            Expr::table_column("depts", "budget"),
        ),
    )
}

pub(crate) fn to_graph(plan: &LogicalPlan) -> PlanGraph {
    PlanGraph::from_logical(plan).expect("failed to import logical plan")
}

/// Cost model returning the same figures for every subtree; lets tests pin
/// the decision rule's arithmetic exactly.
pub(crate) struct FixedCostModel {
    pub subtree: Option<f64>,
    pub overhead: Option<f64>,
}

impl FixedCostModel {
    pub(crate) fn new(subtree: f64, overhead: f64) -> Self {
        Self {
            subtree: Some(subtree),
            overhead: Some(overhead),
        }
    }

    pub(crate) fn without_estimates() -> Self {
        Self {
            subtree: None,
            overhead: None,
        }
    }
}

impl CostModel for FixedCostModel {
    fn subtree_cost(&self, _graph: &PlanGraph, _node: NodeId) -> Option<f64> {
        self.subtree
    }

    fn write_overhead(&self, _graph: &PlanGraph, _node: NodeId) -> Option<f64> {
        self.overhead
    }
}
