//! Deopt-to-guard conversion.
//!
//! A branch that unconditionally ends in a `Deoptimize` is replaced by a
//! `FixedGuard` on the branch condition, so that later phases see a guard
//! they can hoist or predicate instead of control flow:
//!
//! ```text
//!   If(c) ─┬─► Begin ─► ... ─► Deoptimize(r)
//!          └─► Begin ─► S                       =>  FixedGuard(c, r, negated) ─► Begin ─► S
//! ```
//!
//! The walk from a deopt towards its split stops at side effects and at
//! loop boundaries. When it meets a `FixedGuard` of higher priority, the
//! deopt is moved right behind that guard instead.

use log::{debug, trace};

use super::canonicalize;
use crate::error::LoopResult;
use crate::ir::{DeoptInfo, Graph, NodeId, Operator, ValueType};
use crate::opt::{LoopPhase, PhaseContext};

/// Turns branches that end in a deopt into fixed guards.
#[derive(Debug, Default)]
pub struct ConvertDeoptimizePhase;

impl ConvertDeoptimizePhase {
    pub fn new() -> Self {
        Self
    }
}

impl LoopPhase for ConvertDeoptimizePhase {
    fn name(&self) -> &'static str {
        "convert_deopt"
    }

    fn run(&mut self, graph: &mut Graph, ctx: &mut PhaseContext<'_>) -> LoopResult<bool> {
        let deopts = graph.nodes_where(|op| matches!(op, Operator::Deoptimize(_)));
        let mut changed = false;
        for deopt in deopts {
            if !graph.is_live(deopt) {
                continue;
            }
            let info = match graph.op(deopt) {
                Operator::Deoptimize(info) => *info,
                _ => continue,
            };
            let mut converted = 0;
            changed |= propagate(graph, deopt, &info, &mut converted);
            ctx.metrics.deopts_converted += converted;
        }
        if changed {
            canonicalize(graph, ctx, &[]);
        }
        Ok(changed)
    }
}

/// Walk up from `from` and rewrite the split that leads to it.
fn propagate(graph: &mut Graph, from: NodeId, info: &DeoptInfo, converted: &mut u32) -> bool {
    let mut current = from;
    loop {
        if !graph.is_live(current) {
            return false;
        }
        match graph.op(current) {
            Operator::Merge => {
                let ends = graph.inputs(current).to_vec();
                let mut changed = false;
                for end in ends {
                    changed |= propagate(graph, end, info, converted);
                }
                return changed;
            }
            Operator::Begin => {
                if let Some(split) = graph.predecessor(current) {
                    match graph.op(split) {
                        Operator::If { .. } => return convert_if(graph, split, current, info, converted),
                        Operator::Switch(_) => return move_deopt_after(graph, current, info),
                        _ => {}
                    }
                }
            }
            Operator::Start | Operator::LoopBegin(_) | Operator::LoopExit => return false,
            Operator::FixedGuard { info: other, .. }
                if other.priority().is_higher_than(info.priority()) =>
            {
                return move_deopt_after(graph, current, info);
            }
            op if op.has_side_effect() => return false,
            _ => {}
        }
        let Some(pred) = graph.predecessor(current) else {
            return false;
        };
        current = pred;
    }
}

/// Replace `split` by a guard that deopts when control would enter `dead`.
fn convert_if(graph: &mut Graph, split: NodeId, dead: NodeId, info: &DeoptInfo, converted: &mut u32) -> bool {
    let Some(dead_index) = graph.successor_index(split, dead) else {
        return false;
    };
    let survivor_index = 1 - dead_index;
    let Some(survivor) = graph.successor(split, survivor_index) else {
        return false;
    };
    if graph.op(survivor) != &Operator::Begin {
        trace!("{split:?} continues into {:?}, not converting", graph.op(survivor).name());
        return false;
    }

    let condition = graph.input(split, 0);
    let guard = graph.add(
        Operator::FixedGuard {
            info: *info,
            negated: survivor_index == 1,
        },
        &[condition],
        ValueType::Void,
    );
    graph.set_bci(guard, graph.node(split).bci());
    graph.set_successor(split, survivor_index, NodeId::INVALID);
    graph.replace_at_predecessor(split, guard);
    graph.set_next(guard, survivor);
    graph.kill(split);
    *converted += 1;
    debug!("converted {split:?} into guard {guard:?} ({})", info.reason.name());
    true
}

/// Deopt right after `node`, dropping whatever followed it.
fn move_deopt_after(graph: &mut Graph, node: NodeId, info: &DeoptInfo) -> bool {
    if let Some(next) = graph.next(node) {
        if matches!(graph.op(next), Operator::Deoptimize(_)) {
            return false;
        }
        graph.set_next(node, NodeId::INVALID);
    }
    let deopt = graph.add(Operator::Deoptimize(*info), &[], ValueType::Void);
    graph.set_bci(deopt, graph.node(node).bci());
    graph.set_next(node, deopt);
    trace!("moved deopt behind {node:?}");
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{
        CmpOp, ControlBuilder, DeoptimizationAction, DeoptimizationReason, GraphBuilder, GuardBuilder,
    };
    use crate::opt::phases::testing::run_phase;
    use crate::opt::transform::testing::assert_equivalent;
    use crate::opt::{LoopConfig, StaticProfile};

    fn count(g: &Graph, pred: impl Fn(&Operator) -> bool) -> usize {
        g.nodes_where(pred).len()
    }

    /// `for i in 0..n { if i >= len(a) { deopt } a[i] = i }`.
    fn checked_loop() -> Graph {
        let mut b = GraphBuilder::new(0);
        let n = b.parameter_in(ValueType::Int32, 0, 16);
        let arr = b.parameter(ValueType::Array);
        let zero = b.int(0);
        let one = b.int(1);
        let len = b.array_length(arr);
        let mut lp = b.begin_loop(&[zero], 10.0);
        let i = lp.phi(0);
        let c = b.compare(CmpOp::Lt, i, n);
        b.exit_unless(&mut lp, c);
        let oob = b.compare(CmpOp::Ge, i, len);
        b.deopt_if(
            oob,
            DeoptimizationReason::BoundsCheckException,
            DeoptimizationAction::InvalidateRecompile,
            0.01,
        );
        b.store(arr, i, i);
        let i1 = b.add(i, one);
        b.end_loop(lp, &[i1], &[]);
        b.return_value(None);
        b.finish()
    }

    #[test]
    fn test_branch_becomes_guard() {
        let original = checked_loop();
        let mut g = original.clone();
        let (result, metrics) =
            run_phase(&mut ConvertDeoptimizePhase::new(), &mut g, &LoopConfig::default(), &StaticProfile::new());
        assert_eq!(result, Ok(true));
        assert_eq!(metrics.deopts_converted, 1);
        assert_eq!(g.verify(), Ok(()));
        assert_eq!(count(&g, |op| matches!(op, Operator::Deoptimize(_))), 0);
        let guards = g.nodes_where(|op| matches!(op, Operator::FixedGuard { .. }));
        assert_eq!(guards.len(), 1);
        assert_eq!(
            g.op(guards[0]),
            &Operator::FixedGuard {
                info: DeoptInfo::new(
                    DeoptimizationReason::BoundsCheckException,
                    DeoptimizationAction::InvalidateRecompile
                ),
                negated: true,
            }
        );
        // Within bounds, and past the end of an 8-element array.
        assert_equivalent(&original, &g, &[0, 3, 8, 12], &[vec![0; 8]]);
    }

    #[test]
    fn test_side_effect_blocks_conversion() {
        let mut b = GraphBuilder::new(0);
        let x = b.parameter(ValueType::Int32);
        let arr = b.parameter(ValueType::Array);
        let zero = b.int(0);
        let neg = b.compare(CmpOp::Lt, x, zero);
        let br = b.begin_if(neg, 0.1);
        b.store(arr, zero, x);
        b.deoptimize(DeoptimizationReason::UnreachedCode, DeoptimizationAction::None);
        b.end_if(br, &[]);
        b.return_value(Some(x));
        let mut g = b.finish();

        let (result, metrics) =
            run_phase(&mut ConvertDeoptimizePhase::new(), &mut g, &LoopConfig::default(), &StaticProfile::new());
        assert_eq!(result, Ok(false));
        assert_eq!(metrics.deopts_converted, 0);
        assert_eq!(count(&g, |op| matches!(op, Operator::If { .. })), 1);
    }

    #[test]
    fn test_higher_priority_guard_takes_over() {
        let mut b = GraphBuilder::new(0);
        let x = b.parameter(ValueType::Int32);
        let arr = b.parameter(ValueType::Array);
        let zero = b.int(0);
        let neg = b.compare(CmpOp::Lt, x, zero);
        let big = b.compare(CmpOp::Gt, x, zero);
        let br = b.begin_if(neg, 0.1);
        b.fixed_guard(
            big,
            DeoptimizationReason::RuntimeConstraint,
            DeoptimizationAction::InvalidateRecompile,
            false,
        );
        b.load(arr, zero);
        b.deoptimize(DeoptimizationReason::UnreachedCode, DeoptimizationAction::None);
        b.end_if(br, &[]);
        b.return_value(Some(x));
        let original = b.finish();

        let mut g = original.clone();
        let (result, metrics) =
            run_phase(&mut ConvertDeoptimizePhase::new(), &mut g, &LoopConfig::default(), &StaticProfile::new());
        assert_eq!(result, Ok(true));
        assert_eq!(metrics.deopts_converted, 0);
        assert_eq!(g.verify(), Ok(()));
        // The split stays; the load between guard and deopt is gone.
        assert_eq!(count(&g, |op| matches!(op, Operator::If { .. })), 1);
        assert_eq!(count(&g, |op| op == &Operator::LoadIndexed), 0);
        assert_equivalent(&original, &g, &[-4, 0, 4], &[vec![0]]);
    }

    #[test]
    fn test_deopt_after_merge_converts_both_paths() {
        let mut b = GraphBuilder::new(0);
        let x = b.parameter(ValueType::Int32);
        let zero = b.int(0);
        let ten = b.int(10);
        let neg = b.compare(CmpOp::Lt, x, zero);
        let big = b.compare(CmpOp::Gt, x, ten);
        let mut ends = Vec::new();
        let br = b.begin_if(neg, 0.1);
        ends.extend(b.close_with_end());
        b.position_at(br.false_begin());
        let br2 = b.begin_if(big, 0.1);
        ends.extend(b.close_with_end());
        b.position_at(br2.false_begin());
        b.return_value(Some(x));
        b.merge(&ends, &[]);
        b.deoptimize(DeoptimizationReason::RuntimeConstraint, DeoptimizationAction::InvalidateRecompile);
        let original = b.finish();

        let mut g = original.clone();
        let (result, metrics) =
            run_phase(&mut ConvertDeoptimizePhase::new(), &mut g, &LoopConfig::default(), &StaticProfile::new());
        assert_eq!(result, Ok(true));
        assert_eq!(metrics.deopts_converted, 2);
        assert_eq!(g.verify(), Ok(()));
        assert_eq!(count(&g, |op| matches!(op, Operator::If { .. })), 0);
        assert_equivalent(&original, &g, &[-1, 0, 5, 10, 11], &[]);
    }
}
