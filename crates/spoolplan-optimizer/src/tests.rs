//! End-to-end pipeline tests: logical plan in, ordered stage graph out.

use crate::test_utils::{
    FixedCostModel, emps_depts_join, make_cross, make_scan, make_volatile_filter, scenario_plan,
};
use crate::{
    DecisionOutcome, SpoolSettings, StatsCostModel, TableStats, optimize, optimize_with_settings,
};

fn count_ops(graph: &crate::PlanGraph, name: &str) -> usize {
    graph.iter().filter(|n| n.op.name() == name).count()
}

#[test]
fn repeated_join_is_materialized_with_default_settings() {
    let optimized = optimize(&scenario_plan(), &StatsCostModel::new()).unwrap();

    assert_eq!(optimized.decisions.len(), 1);
    let decision = &optimized.decisions[0];
    assert_eq!(decision.outcome, DecisionOutcome::Materialize);
    assert_eq!(decision.readers, 2);
    // Re-evaluating twice costs 24000 rows of work; one evaluation plus
    // the 10000-row write costs 22000.
    assert_eq!(decision.cost_delta, Some(2000.0));

    assert_eq!(optimized.spools.len(), 1);
    assert_eq!(count_ops(&optimized.graph, "SpoolWrite"), 1);
    assert_eq!(count_ops(&optimized.graph, "SpoolRead"), 2);
}

#[test]
fn producer_stage_runs_before_its_readers() {
    let optimized = optimize(&scenario_plan(), &StatsCostModel::new()).unwrap();

    assert_eq!(optimized.stages.stages.len(), 2);
    let spool_id = optimized.spools[0].spool_id;
    let producer = optimized
        .stages
        .stages
        .iter()
        .find(|s| s.produces == Some(spool_id))
        .unwrap();
    let consumer = optimized
        .stages
        .stages
        .iter()
        .find(|s| s.consumes.contains(&spool_id))
        .unwrap();

    let order = &optimized.stage_order;
    let producer_pos = order.iter().position(|id| *id == producer.id).unwrap();
    let consumer_pos = order.iter().position(|id| *id == consumer.id).unwrap();
    assert!(producer_pos < consumer_pos);
}

#[test]
fn raised_threshold_inlines_the_duplicate_join() {
    let settings = SpoolSettings::new(3, false);
    let optimized =
        optimize_with_settings(&scenario_plan(), &StatsCostModel::new(), &settings).unwrap();

    assert_eq!(optimized.decisions[0].outcome, DecisionOutcome::Inline);
    assert!(optimized.spools.is_empty());
    assert_eq!(count_ops(&optimized.graph, "SpoolRead"), 0);
    // The join runs twice again.
    assert_eq!(
        optimized
            .graph
            .iter()
            .filter(|n| matches!(
                &n.op,
                crate::OperatorKind::Join { join_type, .. }
                    if *join_type == spoolplan_ir::JoinType::Inner
            ))
            .count(),
        2
    );
    assert_eq!(optimized.stages.stages.len(), 1);
}

#[test]
fn full_aggregate_only_keeps_join_producers_inline() {
    let settings = SpoolSettings::new(2, true);
    let optimized =
        optimize_with_settings(&scenario_plan(), &StatsCostModel::new(), &settings).unwrap();

    assert_eq!(optimized.decisions[0].outcome, DecisionOutcome::Inline);
    assert!(optimized.spools.is_empty());
}

#[test]
fn materialized_spools_shrink_as_the_threshold_rises() {
    let cost = StatsCostModel::new();
    let mut previous = usize::MAX;
    for threshold in [1, 2, 3] {
        let settings = SpoolSettings::new(threshold, false);
        let optimized = optimize_with_settings(&scenario_plan(), &cost, &settings).unwrap();
        assert!(optimized.spools.len() <= previous);
        previous = optimized.spools.len();
    }
}

#[test]
fn optimized_graph_is_always_valid() {
    let cost = StatsCostModel::new();
    for threshold in [1, 2, 3] {
        let settings = SpoolSettings::new(threshold, false);
        let optimized = optimize_with_settings(&scenario_plan(), &cost, &settings).unwrap();
        assert!(optimized.graph.validate().is_ok());
    }
}

#[test]
fn optimization_is_deterministic() {
    let cost = StatsCostModel::new();
    let first = optimize(&scenario_plan(), &cost).unwrap();
    let second = optimize(&scenario_plan(), &cost).unwrap();

    assert_eq!(first.decisions, second.decisions);
    assert_eq!(first.stage_order, second.stage_order);
    assert_eq!(first.explain().unwrap(), second.explain().unwrap());
}

#[test]
fn missing_estimates_disable_materialization() {
    let optimized = optimize(&scenario_plan(), &FixedCostModel::without_estimates()).unwrap();

    assert_eq!(optimized.decisions[0].outcome, DecisionOutcome::Inline);
    assert_eq!(optimized.decisions[0].cost_delta, None);
    assert!(optimized.spools.is_empty());
}

#[test]
fn volatile_producers_are_never_spooled() {
    let left = make_volatile_filter(make_scan("emps"));
    let right = make_volatile_filter(make_scan("emps"));
    let plan = make_cross(left, right);

    let optimized = optimize(&plan, &StatsCostModel::new()).unwrap();

    // Only the deterministic scan underneath may be shared; both volatile
    // filters survive as distinct nodes.
    assert_eq!(count_ops(&optimized.graph, "Filter"), 2);
    for decision in &optimized.decisions {
        let producer = optimized.graph.node(decision.producer).unwrap();
        assert_eq!(producer.op.name(), "Scan");
    }
}

#[test]
fn plan_without_duplicates_passes_through() {
    let optimized = optimize(&emps_depts_join(), &StatsCostModel::new()).unwrap();

    assert!(optimized.decisions.is_empty());
    assert!(optimized.spools.is_empty());
    assert_eq!(optimized.stages.stages.len(), 1);
    assert_eq!(optimized.graph.len(), 3);
}

#[test]
fn shared_scan_is_not_worth_spooling() {
    // Spooling a bare scan saves nothing: one write costs exactly what the
    // second scan would have.
    let plan = make_cross(make_scan("emps"), make_scan("emps"));
    let optimized = optimize(&plan, &StatsCostModel::new()).unwrap();

    assert_eq!(optimized.decisions.len(), 1);
    assert_eq!(optimized.decisions[0].outcome, DecisionOutcome::Inline);
    assert_eq!(optimized.decisions[0].cost_delta, Some(0.0));
    assert!(optimized.spools.is_empty());
}

#[test]
fn table_stats_steer_the_decision() {
    let mut table_stats = rustc_hash::FxHashMap::default();
    let mut emps = TableStats::new(10000);
    emps.column_stats.insert(
        "dept_id".to_string(),
        crate::ColumnStats {
            distinct_count: 100,
            null_count: 0,
            min_value: None,
            max_value: None,
        },
    );
    table_stats.insert("EMPS".to_string(), emps);
    table_stats.insert("DEPTS".to_string(), TableStats::new(100));
    let cost = StatsCostModel::with_stats(table_stats);

    let optimized = optimize(&scenario_plan(), &cost).unwrap();
    let decision = &optimized.decisions[0];
    assert_eq!(decision.outcome, DecisionOutcome::Materialize);
    // Join subtree costs 20100 rows, its output 10000: 2 * 20100 against
    // 20100 + 10000.
    assert_eq!(decision.cost_delta, Some(10100.0));
}

#[test]
fn rendering_reflects_the_decision() {
    let optimized = optimize(&scenario_plan(), &StatsCostModel::new()).unwrap();
    let sql = optimized.render_with_clauses().unwrap();
    assert!(sql.starts_with("WITH spool_0 AS MATERIALIZED ("));
    assert_eq!(sql.matches("Scan spool_0").count(), 2);

    let settings = SpoolSettings::new(3, false);
    let inlined =
        optimize_with_settings(&scenario_plan(), &StatsCostModel::new(), &settings).unwrap();
    let sql = inlined.render_with_clauses().unwrap();
    assert!(!sql.contains("WITH"));
    assert!(!sql.contains("spool_0"));
}
