//! Fixtures shared by the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use prism_loops::ir::{
    CmpOp, ControlBuilder, DeoptimizationAction, DeoptimizationReason, Execution, Graph,
    GraphBuilder, GuardBuilder, Interpreter, Value, ValueType,
};
use prism_loops::opt::{
    DefaultLoopPolicies, LoopConfig, LoopMetrics, LoopPhase, PhaseContext, SimpleCanonicalizer,
    StaticProfile,
};
use prism_loops::speculation::SpeculationLog;
use prism_loops::LoopResult;

/// Route `log` output through the test harness.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Run `graph` on integer arguments followed by one array per heap entry.
pub fn run(graph: &Graph, ints: &[i64], heap: &[Vec<i64>]) -> Execution {
    let args: Vec<Value> = ints
        .iter()
        .map(|&v| Value::Int(v))
        .chain((0..heap.len()).map(Value::Array))
        .collect();
    Interpreter::new(graph)
        .run(&args, heap.to_vec())
        .expect("interpretation succeeds")
}

/// Same effects on every argument list.
pub fn assert_same_effects(before: &Graph, after: &Graph, inputs: &[Vec<i64>], heap: &[Vec<i64>]) {
    for ints in inputs {
        let (a, b) = (run(before, ints, heap), run(after, ints, heap));
        assert!(
            a.same_effects(&b),
            "inputs {ints:?}: {:?} before, {:?} after",
            a.outcome,
            b.outcome
        );
    }
}

/// Equivalent once a deopt hands over to the interpreter.
pub fn assert_same_after_resume(before: &Graph, after: &Graph, inputs: &[Vec<i64>], heap: &[Vec<i64>]) {
    for ints in inputs {
        let (a, b) = (run(before, ints, heap), run(after, ints, heap));
        assert!(
            a.same_after_resume(&b),
            "inputs {ints:?}: {:?} before, {:?} after",
            a.outcome,
            b.outcome
        );
    }
}

/// Run one phase with the default policies.
pub fn run_phase(
    phase: &mut dyn LoopPhase,
    graph: &mut Graph,
    config: &LoopConfig,
    profile: &StaticProfile,
) -> (LoopResult<bool>, LoopMetrics) {
    let policies = DefaultLoopPolicies::new(config);
    let canonicalizer = SimpleCanonicalizer::new();
    let mut metrics = LoopMetrics::new();
    let mut ctx = PhaseContext {
        config,
        policies: &policies,
        canonicalizer: &canonicalizer,
        profile,
        metrics: &mut metrics,
    };
    let result = phase.run(graph, &mut ctx);
    (result, metrics)
}

/// `for (i = 0; i < n; i += stride) { guard(i |<| a.length); a[i] += 1 }`
/// in method 3, loop at bci 7.
pub fn strided_range_check(stride: i64, log: Option<Arc<SpeculationLog>>) -> Graph {
    let mut b = GraphBuilder::new(3);
    if let Some(log) = log {
        b = b.with_speculation_log(log);
    }
    let n = b.parameter_in(ValueType::Int32, 0, 64);
    let arr = b.parameter(ValueType::Array);
    let zero = b.int(0);
    let one = b.int(1);
    let step = b.int(stride);
    let len = b.array_length(arr);
    b.set_bci(7);
    let mut lp = b.begin_loop(&[zero], 16.0);
    let i = lp.phi(0);
    let c = b.compare(CmpOp::Lt, i, n);
    b.exit_unless(&mut lp, c);
    let in_bounds = b.compare(CmpOp::Below, i, len);
    b.guard(
        in_bounds,
        DeoptimizationReason::BoundsCheckException,
        DeoptimizationAction::InvalidateRecompile,
    );
    let v = b.load(arr, i);
    let v1 = b.add(v, one);
    b.store(arr, i, v1);
    let i1 = b.add(i, step);
    b.end_loop(lp, &[i1], &[]);
    b.return_value(None);
    b.finish()
}

/// `sum = 0; for (i = init; i op n; i += stride) sum += i; a[0] = i; return sum`.
pub fn sum_loop(init: i64, op: CmpOp, stride: i64) -> Graph {
    let mut b = GraphBuilder::new(1).with_frame_states();
    let n = b.parameter_in(ValueType::Int32, -100, 100);
    let arr = b.parameter(ValueType::Array);
    let start = b.int(init);
    let zero = b.int(0);
    let step = b.int(stride);
    let mut lp = b.begin_loop(&[start, zero], 20.0);
    let (i, sum) = (lp.phi(0), lp.phi(1));
    let c = b.compare(op, i, n);
    b.exit_unless(&mut lp, c);
    let s1 = b.add(sum, i);
    let i1 = b.add(i, step);
    let after = b.end_loop(lp, &[i1, s1], &[i, sum]);
    b.store(arr, zero, after[0]);
    b.return_value(Some(after[1]));
    b.finish()
}

/// Outer loop over `j < m` around an inner loop over `i < n` that tests
/// the invariant `flag > 0` and writes `a[i]`.
pub fn nested_flag_loops() -> Graph {
    let mut b = GraphBuilder::new(2);
    let n = b.parameter_in(ValueType::Int32, 0, 16);
    let m = b.parameter_in(ValueType::Int32, 0, 4);
    let flag = b.parameter(ValueType::Int32);
    let arr = b.parameter(ValueType::Array);
    let zero = b.int(0);
    let one = b.int(1);
    let positive = b.compare(CmpOp::Gt, flag, zero);

    b.set_bci(2);
    let mut outer = b.begin_loop(&[zero], 4.0);
    let j = outer.phi(0);
    let c = b.compare(CmpOp::Lt, j, m);
    b.exit_unless(&mut outer, c);

    b.set_bci(6);
    let mut inner = b.begin_loop(&[zero], 16.0);
    let i = inner.phi(0);
    let c = b.compare(CmpOp::Lt, i, n);
    b.exit_unless(&mut inner, c);
    b.set_bci(9);
    let br = b.begin_if(positive, 0.5);
    let v = b.load(arr, i);
    let v1 = b.add(v, j);
    b.store(arr, i, v1);
    b.end_if(br, &[]);
    let i1 = b.add(i, one);
    b.end_loop(inner, &[i1], &[]);

    let j1 = b.add(j, one);
    b.end_loop(outer, &[j1], &[]);
    b.return_value(None);
    b.finish()
}
