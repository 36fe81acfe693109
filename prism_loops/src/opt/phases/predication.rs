//! Loop predication.
//!
//! A range check `index |<| length` inside a counted loop, where `index`
//! is an induction variable and `length` is invariant and non-negative,
//! holds in every iteration iff it holds for the first and the last value
//! of `index`, provided `index` cannot wrap on the way. Both are checked
//! once in front of the loop and the check in the body goes away:
//!
//! ```text
//!   FixedGuard(!entered || sext(init)  |<| sext(length))
//!   FixedGuard(!entered || extremum    |<| sext(length))
//!   F ─► LB ─► ... (no range check) ...
//! ```
//!
//! The new guards carry a speculation keyed by the loop position; once one
//! of them fails, the loop is no longer predicated.

use log::debug;

use super::canonicalize;
use crate::error::LoopResult;
use crate::ir::{
    BlockId, CmpOp, DeoptInfo, DeoptimizationAction, DeoptimizationReason, Graph, LogicOp, NodeFlags,
    NodeId, Operator, SpeculationGroup, SpeculationReason, ValueType,
};
use crate::opt::loops::{InductionVariable, LoopEx, LoopsData};
use crate::opt::{LoopPhase, PhaseContext};

/// Replaces range checks in innermost counted loops by checks in front
/// of the loop.
#[derive(Debug, Default)]
pub struct LoopPredicationPhase;

impl LoopPredicationPhase {
    pub fn new() -> Self {
        Self
    }
}

/// A range check found in a loop body.
struct RangeCheck {
    guard: NodeId,
    index: InductionVariable,
    length: NodeId,
}

impl LoopPhase for LoopPredicationPhase {
    fn name(&self) -> &'static str {
        "predication"
    }

    fn run(&mut self, graph: &mut Graph, ctx: &mut PhaseContext<'_>) -> LoopResult<bool> {
        let begins: Vec<NodeId> = {
            let data = LoopsData::compute(graph);
            data.loops()
                .iter()
                .filter(|lp| lp.is_innermost() && lp.is_counted())
                .map(|lp| lp.begin())
                .collect()
        };
        let mut changed = false;
        for begin in begins {
            changed |= predicate_loop(graph, ctx, begin);
        }
        if changed {
            canonicalize(graph, ctx, &[]);
        }
        Ok(changed)
    }
}

/// Key of the speculation made for the loop headed by `begin`.
pub(crate) fn predication_key(graph: &Graph, begin: NodeId) -> SpeculationReason {
    SpeculationReason::new(
        SpeculationGroup::LoopPredication,
        graph.method(),
        graph.node(begin).bci(),
        DeoptimizationReason::BoundsCheckException,
    )
}

fn predicate_loop(graph: &mut Graph, ctx: &mut PhaseContext<'_>, begin: NodeId) -> bool {
    let data = LoopsData::compute(graph);
    let Some(lp) = data.loop_for(begin) else {
        return false;
    };
    let Some(counted) = lp.counted().cloned() else {
        return false;
    };
    if lp.exits().len() != 1 {
        return false;
    }
    let key = predication_key(graph, begin);
    let log = graph.speculation_log().cloned();
    if log.as_ref().is_some_and(|log| !log.may_speculate(&key)) {
        debug!("predication of {begin:?} failed before, skipping");
        return false;
    }
    let checks = range_checks(graph, &data, lp);
    if checks.is_empty() {
        return false;
    }

    if !counted.counter_never_overflows(graph) {
        let mark = graph.mark();
        match counted.create_overflow_guard(graph) {
            Some(guard) if guard.index() >= mark.index() => ctx.metrics.overflow_guards += 1,
            Some(_) => {}
            None => return false,
        }
    }

    let mut info = DeoptInfo::new(
        DeoptimizationReason::BoundsCheckException,
        DeoptimizationAction::InvalidateRecompile,
    );
    if let Some(log) = &log {
        info = info.with_speculation(log.speculate(key));
    }
    let forward = graph.forward_end(begin);
    let bci = graph.node(begin).bci();

    for check in checks {
        let entered = counted.entered_condition(graph);
        let skipped = graph.not(entered);
        let length = graph.sign_extend(check.length);
        let init = check.index.init_node(graph);
        let first = graph.sign_extend(init);
        let last = counted.extremum_node(graph, &check.index);
        for value in [first, last] {
            let in_bounds = graph.compare(CmpOp::Below, value, length);
            let condition = graph.logic(LogicOp::Or, skipped, in_bounds);
            let guard = graph.add(
                Operator::FixedGuard {
                    info,
                    negated: false,
                },
                &[condition],
                ValueType::Void,
            );
            graph.set_bci(guard, bci);
            graph.add_flags(guard, NodeFlags::PREDICATED);
            graph.insert_before(forward, guard);
        }
        remove_guard(graph, check.guard);
        ctx.metrics.guards_predicated += 1;
        debug!("predicated {:?} in {begin:?}", check.guard);
    }
    true
}

/// Unnegated `index |<| length` guards that run in every iteration of `lp`.
fn range_checks(graph: &Graph, data: &LoopsData, lp: &LoopEx) -> Vec<RangeCheck> {
    let cfg = data.cfg();
    let latches: Vec<BlockId> = graph
        .loop_ends(lp.begin())
        .iter()
        .filter_map(|&end| cfg.block_for(end))
        .collect();
    let mut checks = Vec::new();
    for &node in lp.whole().nodes() {
        let position = match graph.op(node) {
            Operator::Guard { negated: false, .. } => graph.input(node, 1),
            Operator::FixedGuard { negated: false, .. } => node,
            _ => continue,
        };
        let condition = graph.input(node, 0);
        if graph.op(condition) != &Operator::IntCmp(CmpOp::Below) {
            continue;
        }
        let (index, length) = (graph.input(condition, 0), graph.input(condition, 1));
        let Some(iv) = lp.induction_variable(index) else {
            continue;
        };
        if !lp.counted().is_some_and(|counted| counted.iv_never_wraps(graph, iv)) {
            continue;
        }
        if !lp.is_invariant(length) || !graph.stamp(length).is_some_and(|s| s.is_non_negative()) {
            continue;
        }
        let Some(block) = cfg.block_for(position) else {
            continue;
        };
        if !latches.iter().all(|&latch| cfg.dominates(block, latch)) {
            continue;
        }
        checks.push(RangeCheck {
            guard: node,
            index: iv.clone(),
            length,
        });
    }
    checks
}

fn remove_guard(graph: &mut Graph, guard: NodeId) {
    let condition = graph.input(guard, 0);
    if graph.op(guard).is_fixed() {
        graph.remove_fixed(guard);
    } else {
        graph.kill(guard);
    }
    if graph.is_live(condition) && graph.is_collectable(condition) && !graph.has_usages(condition) {
        graph.kill_with_unused_inputs(condition);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::ir::{
        ControlBuilder, Execution, GraphBuilder, GuardBuilder, Interpreter, MethodId, Value,
    };
    use crate::opt::phases::testing::run_phase;
    use crate::opt::{LoopConfig, StaticProfile};
    use crate::speculation::SpeculationLog;

    /// `for (i = 0; i < n; i += stride) { guard(i |<| a.length); a[i] += 1 }`.
    fn strided(stride: i64, log: Option<Arc<SpeculationLog>>, fixed: bool) -> Graph {
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
        if fixed {
            b.fixed_guard(
                in_bounds,
                DeoptimizationReason::BoundsCheckException,
                DeoptimizationAction::InvalidateRecompile,
                false,
            );
        } else {
            b.guard(
                in_bounds,
                DeoptimizationReason::BoundsCheckException,
                DeoptimizationAction::InvalidateRecompile,
            );
        }
        let v = b.load(arr, i);
        let v1 = b.add(v, one);
        b.store(arr, i, v1);
        let i1 = b.add(i, step);
        b.end_loop(lp, &[i1], &[]);
        b.return_value(None);
        b.finish()
    }

    fn exec(graph: &Graph, n: i64) -> Execution {
        Interpreter::new(graph)
            .run(&[Value::Int(n), Value::Array(0)], vec![vec![0; 9]])
            .unwrap()
    }

    fn range_guards(g: &Graph) -> usize {
        g.nodes_where(|op| op.is_guard())
            .into_iter()
            .filter(|&n| g.op(g.input(n, 0)) == &Operator::IntCmp(CmpOp::Below))
            .count()
    }

    #[test]
    fn test_strided_range_check_is_predicated() {
        let log = Arc::new(SpeculationLog::new(MethodId(3)));
        let original = strided(2, Some(log.clone()), false);
        let mut g = original.clone();
        let begin = g.loop_begins()[0];
        let key = predication_key(&g, begin);
        assert!(log.may_speculate(&key));

        let (result, metrics) =
            run_phase(&mut LoopPredicationPhase::new(), &mut g, &LoopConfig::default(), &StaticProfile::new());
        assert_eq!(result, Ok(true));
        assert_eq!(metrics.guards_predicated, 1);
        assert_eq!(g.verify(), Ok(()));
        assert!(log.contains(&key));

        let predicated: Vec<NodeId> = g
            .live_nodes()
            .filter(|&n| g.node(n).flags().contains(NodeFlags::PREDICATED))
            .collect();
        assert_eq!(predicated.len(), 2);
        let data = LoopsData::compute(&g);
        for &guard in &predicated {
            assert!(data.innermost_loop_of(guard).is_none());
            let info = g.op(guard).deopt_info().copied().unwrap();
            assert_eq!(info.speculation.map(|t| t.reason), Some(key));
        }
        assert_eq!(range_guards(&g), 0);

        for n in [0, 1, 8, 9, 10, 20] {
            let (before, after) = (exec(&original, n), exec(&g, n));
            assert!(before.same_after_resume(&after), "n = {n}");
            assert_eq!(before.outcome.is_deopt(), after.outcome.is_deopt(), "n = {n}");
        }
    }

    #[test]
    fn test_fixed_range_check_without_log() {
        let original = strided(1, None, true);
        let mut g = original.clone();
        let (result, metrics) =
            run_phase(&mut LoopPredicationPhase::new(), &mut g, &LoopConfig::default(), &StaticProfile::new());
        assert_eq!(result, Ok(true));
        assert_eq!(metrics.guards_predicated, 1);
        assert_eq!(range_guards(&g), 0);
        for n in [0, 5, 9, 10] {
            assert!(exec(&original, n).same_after_resume(&exec(&g, n)));
        }
    }

    #[test]
    fn test_failed_speculation_is_not_repeated() {
        let log = Arc::new(SpeculationLog::new(MethodId(3)));
        let mut g = strided(2, Some(log.clone()), false);
        let key = predication_key(&g, g.loop_begins()[0]);
        log.record_failure(&log.speculate(key));

        let before = g.live_count();
        let (result, metrics) =
            run_phase(&mut LoopPredicationPhase::new(), &mut g, &LoopConfig::default(), &StaticProfile::new());
        assert_eq!(result, Ok(false));
        assert_eq!(metrics.guards_predicated, 0);
        assert_eq!(g.live_count(), before);
        assert_eq!(range_guards(&g), 1);
    }

    /// `for i in 0..n { guard(i + x |<| a.length); a[i] = i }`.
    fn offset_index(x_range: Option<(i64, i64)>) -> Graph {
        let mut b = GraphBuilder::new(3);
        let n = b.parameter_in(ValueType::Int32, 0, 64);
        let x = match x_range {
            Some((lower, upper)) => b.parameter_in(ValueType::Int32, lower, upper),
            None => b.parameter(ValueType::Int32),
        };
        let arr = b.parameter(ValueType::Array);
        let zero = b.int(0);
        let one = b.int(1);
        let len = b.array_length(arr);
        b.set_bci(7);
        let mut lp = b.begin_loop(&[zero], 16.0);
        let i = lp.phi(0);
        let c = b.compare(CmpOp::Lt, i, n);
        b.exit_unless(&mut lp, c);
        let j = b.add(i, x);
        let in_bounds = b.compare(CmpOp::Below, j, len);
        b.guard(
            in_bounds,
            DeoptimizationReason::BoundsCheckException,
            DeoptimizationAction::InvalidateRecompile,
        );
        b.store(arr, i, i);
        let i1 = b.add(i, one);
        b.end_loop(lp, &[i1], &[]);
        b.return_value(None);
        b.finish()
    }

    #[test]
    fn test_offset_index_needs_bounded_offset() {
        let mut g = offset_index(Some((0, 8)));
        let (result, metrics) =
            run_phase(&mut LoopPredicationPhase::new(), &mut g, &LoopConfig::default(), &StaticProfile::new());
        assert_eq!(result, Ok(true));
        assert_eq!(metrics.guards_predicated, 1);

        let original = offset_index(None);
        let mut g = original.clone();
        let (result, metrics) =
            run_phase(&mut LoopPredicationPhase::new(), &mut g, &LoopConfig::default(), &StaticProfile::new());
        assert_eq!(result, Ok(false));
        assert_eq!(metrics.guards_predicated, 0);
        assert_eq!(range_guards(&g), 1);
    }
}
