mod common;

use std::sync::Arc;

use common::{assert_same_after_resume, init_logging, run, run_phase, strided_range_check};
use prism_loops::ir::{
    CmpOp, DeoptimizationReason, Graph, MethodId, NodeFlags, Operator, Outcome, SpeculationGroup,
    SpeculationReason,
};
use prism_loops::opt::phases::{GuardMovementPhase, LoopPredicationPhase};
use prism_loops::opt::{LoopConfig, LoopsData, StaticProfile};
use prism_loops::speculation::{SpeculationLog, SpeculationLogRegistry};

fn predication_key() -> SpeculationReason {
    SpeculationReason::new(
        SpeculationGroup::LoopPredication,
        MethodId(3),
        7,
        DeoptimizationReason::BoundsCheckException,
    )
}

fn range_guards(g: &Graph) -> usize {
    g.nodes_where(|op| op.is_guard())
        .into_iter()
        .filter(|&n| g.op(g.input(n, 0)) == &Operator::IntCmp(CmpOp::Below))
        .count()
}

fn predicated(g: &Graph) -> usize {
    g.live_nodes()
        .filter(|&n| g.node(n).flags().contains(NodeFlags::PREDICATED))
        .count()
}

#[test]
fn test_strided_loop_is_predicated() {
    init_logging();
    let log = Arc::new(SpeculationLog::new(MethodId(3)));
    let original = strided_range_check(2, Some(log.clone()));
    let mut g = original.clone();
    assert!(log.may_speculate(&predication_key()));

    let (result, metrics) = run_phase(
        &mut LoopPredicationPhase::new(),
        &mut g,
        &LoopConfig::default(),
        &StaticProfile::new(),
    );
    assert_eq!(result, Ok(true));
    assert_eq!(metrics.guards_predicated, 1);
    g.verify().expect("predicated graph is valid");

    assert_eq!(predicated(&g), 2);
    assert_eq!(range_guards(&g), 0);
    assert!(log.contains(&predication_key()));
    let data = LoopsData::compute(&g);
    for guard in g.nodes_where(|op| matches!(op, Operator::FixedGuard { .. })) {
        if g.node(guard).flags().contains(NodeFlags::PREDICATED) {
            assert!(data.innermost_loop_of(guard).is_none());
        }
    }

    let inputs: Vec<Vec<i64>> = [0, 1, 8, 9, 10, 20].iter().map(|&n| vec![n]).collect();
    assert_same_after_resume(&original, &g, &inputs, &[vec![0; 9]]);
}

#[test]
fn test_second_predication_run_adds_nothing() {
    init_logging();
    let log = Arc::new(SpeculationLog::new(MethodId(3)));
    let mut g = strided_range_check(1, Some(log.clone()));
    let config = LoopConfig::default();
    let (first, _) = run_phase(&mut LoopPredicationPhase::new(), &mut g, &config, &StaticProfile::new());
    assert_eq!(first, Ok(true));
    let registered = log.len();
    let size = g.live_count();

    let (second, metrics) =
        run_phase(&mut LoopPredicationPhase::new(), &mut g, &config, &StaticProfile::new());
    assert_eq!(second, Ok(false));
    assert_eq!(metrics.guards_predicated, 0);
    assert_eq!(log.len(), registered);
    assert_eq!(g.live_count(), size);
    assert_eq!(predicated(&g), 2);
}

/// A failing predicated guard disables predication in the next
/// compilation of the same method.
#[test]
fn test_failed_predication_is_not_repeated_on_recompile() {
    init_logging();
    let registry = SpeculationLogRegistry::new();
    let config = LoopConfig::default();
    let heap = [vec![0; 9]];

    let mut first = strided_range_check(1, Some(registry.log_for(MethodId(3))));
    let (result, _) = run_phase(&mut LoopPredicationPhase::new(), &mut first, &config, &StaticProfile::new());
    assert_eq!(result, Ok(true));

    let token = match run(&first, &[12], &heap).outcome {
        Outcome::Deoptimized {
            speculation: Some(token),
            ..
        } => token,
        other => panic!("expected a speculative deopt, got {other:?}"),
    };
    assert_eq!(token.reason, predication_key());
    registry.log_for(MethodId(3)).record_failure(&token);

    let mut second = strided_range_check(1, Some(registry.log_for(MethodId(3))));
    let (result, metrics) =
        run_phase(&mut LoopPredicationPhase::new(), &mut second, &config, &StaticProfile::new());
    assert_eq!(result, Ok(false));
    assert_eq!(metrics.guards_predicated, 0);
    assert_eq!(range_guards(&second), 1);
    assert_eq!(registry.len(), 1);
}

#[test]
fn test_range_check_hoisted_by_guard_movement() {
    init_logging();
    let log = Arc::new(SpeculationLog::new(MethodId(3)));
    let original = strided_range_check(1, Some(log.clone()));
    let mut g = original.clone();
    let (result, metrics) = run_phase(
        &mut GuardMovementPhase::new(),
        &mut g,
        &LoopConfig::default(),
        &StaticProfile::new(),
    );
    assert_eq!(result, Ok(true));
    assert_eq!(metrics.compares_rewritten, 1);
    assert_eq!(metrics.guards_moved, 1);
    g.verify().expect("graph stays valid");

    let key = SpeculationReason::new(
        SpeculationGroup::GuardMovement,
        MethodId(3),
        7,
        DeoptimizationReason::BoundsCheckException,
    );
    assert!(log.contains(&key));
    let inputs: Vec<Vec<i64>> = [0, 1, 8, 9, 10].iter().map(|&n| vec![n]).collect();
    assert_same_after_resume(&original, &g, &inputs, &[vec![0; 9]]);
}
