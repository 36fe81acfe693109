mod common;

use std::sync::Arc;

use common::{
    assert_same_after_resume, assert_same_effects, init_logging, nested_flag_loops, run,
    strided_range_check, sum_loop,
};
use prism_loops::ir::{
    CmpOp, ControlBuilder, DeoptimizationAction, DeoptimizationReason, Graph, GraphBuilder,
    GuardBuilder, MethodId, Operator, ValueType,
};
use prism_loops::opt::{optimize_loops, LoopConfig, StaticProfile};
use prism_loops::speculation::SpeculationLog;
use prism_loops::LoopPipeline;

fn verifying(config: LoopConfig) -> LoopPipeline {
    LoopPipeline::with_config(LoopConfig {
        verify: true,
        ..config
    })
}

fn grid(ns: &[i64], rest: &[i64]) -> Vec<Vec<i64>> {
    let mut inputs = Vec::new();
    for &n in ns {
        for &r in rest {
            inputs.push(vec![n, r]);
        }
    }
    inputs
}

/// `for i in 0..n { if i >= limit { deopt } a[i] = i }`.
fn early_deopt_loop() -> Graph {
    let mut b = GraphBuilder::new(4);
    let n = b.parameter_in(ValueType::Int32, 0, 16);
    let limit = b.parameter(ValueType::Int32);
    let arr = b.parameter(ValueType::Array);
    let zero = b.int(0);
    let one = b.int(1);
    let mut lp = b.begin_loop(&[zero], 16.0);
    let i = lp.phi(0);
    let c = b.compare(CmpOp::Lt, i, n);
    b.exit_unless(&mut lp, c);
    let over = b.compare(CmpOp::Ge, i, limit);
    b.deopt_if(
        over,
        DeoptimizationReason::RuntimeConstraint,
        DeoptimizationAction::InvalidateReprofile,
        0.01,
    );
    b.store(arr, i, i);
    let i1 = b.add(i, one);
    b.end_loop(lp, &[i1], &[]);
    b.return_value(None);
    b.finish()
}

#[test]
fn test_default_pipeline_preserves_sum_loops() {
    init_logging();
    for (init, op, stride) in [(0, CmpOp::Lt, 1), (5, CmpOp::Le, 2), (30, CmpOp::Gt, -3)] {
        let original = sum_loop(init, op, stride);
        let mut g = original.clone();
        let stats = verifying(LoopConfig::default())
            .run(&mut g, &StaticProfile::new())
            .expect("no invariant violation");
        assert_eq!(stats.phases_run, 8);
        let inputs: Vec<Vec<i64>> = [-7, 0, 1, 2, 3, 8, 31, 64, 100].iter().map(|&n| vec![n]).collect();
        assert_same_effects(&original, &g, &inputs, &[vec![0]]);
    }
}

#[test]
fn test_default_pipeline_preserves_nested_loops() {
    init_logging();
    let original = nested_flag_loops();
    let mut g = original.clone();
    let stats = verifying(LoopConfig::default())
        .run(&mut g, &StaticProfile::new())
        .expect("no invariant violation");
    assert!(stats.metrics.transformations() > 0);

    let heap = [vec![0; 16]];
    for n in [0, 1, 7, 16] {
        for m in [0, 2, 4] {
            for flag in [-2, 3] {
                let (a, b) = (run(&original, &[n, m, flag], &heap), run(&g, &[n, m, flag], &heap));
                assert!(a.same_effects(&b), "n = {n}, m = {m}, flag = {flag}");
            }
        }
    }
}

#[test]
fn test_deopt_branch_becomes_guard() {
    init_logging();
    let original = early_deopt_loop();
    let mut g = original.clone();
    let stats = verifying(LoopConfig::conservative())
        .run(&mut g, &StaticProfile::new())
        .expect("no invariant violation");
    assert_eq!(stats.metrics.deopts_converted, 1);
    assert!(g.nodes_where(|op| matches!(op, Operator::Deoptimize(_))).is_empty());
    assert_same_after_resume(&original, &g, &grid(&[0, 3, 16], &[-1, 0, 2, 16, 40]), &[vec![0; 16]]);
}

#[test]
fn test_speculative_pipeline_registers_speculations() {
    init_logging();
    let log = Arc::new(SpeculationLog::new(MethodId(3)));
    let original = strided_range_check(1, Some(log.clone()));
    let mut g = original.clone();
    let stats = optimize_loops(&mut g, &StaticProfile::new()).expect("no invariant violation");
    assert!(stats.metrics.guard_rewrites() > 0);
    assert!(!log.is_empty());
    let inputs: Vec<Vec<i64>> = [0, 1, 5, 8, 9, 10, 30].iter().map(|&n| vec![n]).collect();
    assert_same_after_resume(&original, &g, &inputs, &[vec![0; 9]]);
}

#[test]
fn test_tiers_agree_on_results() {
    init_logging();
    let original = sum_loop(0, CmpOp::Lt, 1);
    for config in [LoopConfig::tier1(), LoopConfig::tier2(), LoopConfig::aggressive()] {
        let mut g = original.clone();
        verifying(config)
            .run(&mut g, &StaticProfile::new())
            .expect("no invariant violation");
        let inputs: Vec<Vec<i64>> = [0, 1, 9, 33].iter().map(|&n| vec![n]).collect();
        assert_same_effects(&original, &g, &inputs, &[vec![0]]);
    }
}
