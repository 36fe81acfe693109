//! Speculative guard movement.
//!
//! Floating guards are moved towards the earliest block their condition
//! allows, as long as that lowers their loop depth and does not increase
//! how often they execute. Leaving a loop is speculative: the guard may now
//! fail in executions where the loop body would not have run it. Each loop
//! left is therefore checked against the speculation log (or, without a
//! log, against the deopt history of the method) and the moved guard
//! carries a speculation for it.
//!
//! # Compare rewriting
//!
//! A guard `iv < bound` (or `iv |<| bound`) whose `bound` is invariant in
//! the loop of `iv` depends on the loop only through `iv`. Since `iv` is
//! monotonic, the test holds in every iteration iff it holds for the first
//! and the last value. Monotonic means the stamps must rule out wrapping,
//! which matters for derived IVs such as `i + x`:
//!
//! ```text
//!   Guard(iv < bound)   =>   Guard(!entered || (extremum < bound && init < bound))
//! ```
//!
//! The rewritten guard is placed in front of the loop.

use log::{debug, trace};
use rustc_hash::FxHashMap;

use super::canonicalize;
use crate::error::LoopResult;
use crate::ir::{
    BlockId, CmpOp, ControlFlowGraph, DeoptInfo, DeoptimizationAction, DeoptimizationReason, Graph,
    LogicOp, NodeFlags, NodeId, Operator, SpeculationGroup, SpeculationReason,
};
use crate::opt::loops::{LoopEx, LoopsData};
use crate::opt::profile::ProfilingInfo;
use crate::opt::{LoopPhase, PhaseContext};

/// Hoists floating guards out of loops over several rounds.
#[derive(Debug, Default)]
pub struct GuardMovementPhase;

impl GuardMovementPhase {
    pub fn new() -> Self {
        Self
    }
}

impl LoopPhase for GuardMovementPhase {
    fn name(&self) -> &'static str {
        "guard_movement"
    }

    fn run(&mut self, graph: &mut Graph, ctx: &mut PhaseContext<'_>) -> LoopResult<bool> {
        let mut changed = false;
        for round in 0..ctx.config.guard_movement_rounds {
            let moved = move_guards(graph, ctx);
            debug!("guard movement round {round}: {moved} guards left a loop");
            if moved == 0 {
                break;
            }
            changed = true;
        }
        if changed {
            canonicalize(graph, ctx, &[]);
        }
        Ok(changed)
    }
}

// =============================================================================
// Rounds
// =============================================================================

/// Key of a guard leaving the loop headed by `loop_begin`.
pub(crate) fn movement_key(graph: &Graph, reason: DeoptimizationReason, loop_begin: NodeId) -> SpeculationReason {
    SpeculationReason::new(
        SpeculationGroup::GuardMovement,
        graph.method(),
        graph.node(loop_begin).bci(),
        reason,
    )
}

/// Whether a guard with `reason` may leave the loop headed by `loop_begin`.
///
/// Without a speculation log the deopt history decides, and only when
/// `check_deopts` is set.
fn allows(
    graph: &Graph,
    profile: &dyn ProfilingInfo,
    reason: DeoptimizationReason,
    loop_begin: NodeId,
    check_deopts: bool,
) -> bool {
    match graph.speculation_log() {
        Some(log) => log.may_speculate(&movement_key(graph, reason, loop_begin)),
        None if check_deopts => {
            profile.deopt_count(DeoptimizationReason::LoopLimitCheck) <= 1
                && profile.deopt_count(reason) <= 2
        }
        None => true,
    }
}

/// One pass over every floating guard; returns how many left a loop.
fn move_guards(graph: &mut Graph, ctx: &mut PhaseContext<'_>) -> u32 {
    let data = LoopsData::compute(graph);
    let mut earliest = Earliest::default();
    let guards = graph.nodes_where(|op| matches!(op, Operator::Guard { .. }));
    let mut moved = 0;
    for guard in guards {
        if graph.is_live(guard) && move_guard(graph, ctx, &data, &mut earliest, guard) {
            moved += 1;
        }
    }
    moved
}

fn move_guard(
    graph: &mut Graph,
    ctx: &mut PhaseContext<'_>,
    data: &LoopsData,
    earliest: &mut Earliest,
    guard: NodeId,
) -> bool {
    let cfg = data.cfg();
    let Some(anchor_block) = cfg.block_for(graph.input(guard, 1)) else {
        return false;
    };
    let info = match graph.op(guard) {
        Operator::Guard { info, .. } => *info,
        _ => return false,
    };

    let rewritten = try_rewrite_compare(graph, ctx, data, earliest, guard, anchor_block);
    let (start, mut left) = match rewritten {
        Some((block, iv_loop)) => (block, Some(iv_loop)),
        None => (anchor_block, None),
    };

    let condition = graph.input(guard, 0);
    let condition_block = earliest.block(graph, cfg, condition);
    let mut target = start;
    let mut min_frequency = cfg.block(start).frequency;
    let mut block = start;
    let mut crossed = None;
    while cfg.strictly_dominates(condition_block, block) {
        let Some(candidate) = cfg.dominator_skip_loops(block) else {
            break;
        };
        if cfg.is_loop_header(block) && cfg.loop_depth(candidate) < cfg.loop_depth(block) {
            let loop_begin = cfg.block(block).begin;
            if !allows(graph, ctx.profile, info.reason, loop_begin, true) {
                trace!("{guard:?} may not leave {loop_begin:?}");
                break;
            }
            crossed = Some(loop_begin);
        }
        let frequency = cfg.block(candidate).frequency;
        if frequency <= min_frequency {
            target = candidate;
            min_frequency = frequency;
            left = crossed.or(left);
        }
        block = candidate;
    }

    if cfg.loop_depth(target) >= cfg.loop_depth(anchor_block) {
        return false;
    }
    let Some(loop_begin) = left else {
        return false;
    };

    let new_anchor = cfg.block(target).begin;
    let mut moved_info = DeoptInfo {
        action: match info.action {
            DeoptimizationAction::None => DeoptimizationAction::InvalidateRecompile,
            action => action,
        },
        ..info
    };
    if let Some(log) = graph.speculation_log() {
        moved_info.speculation = Some(log.speculate(movement_key(graph, info.reason, loop_begin)));
    }
    if let Some(slot) = graph.op_mut(guard).deopt_info_mut() {
        *slot = moved_info;
    }
    graph.set_input(guard, 1, new_anchor);
    graph.add_flags(guard, NodeFlags::HOISTED);
    ctx.metrics.guards_moved += 1;
    debug!("moved {guard:?} out of {loop_begin:?} to {new_anchor:?}");
    true
}

// =============================================================================
// Compare Rewriting
// =============================================================================

/// Rewrite the condition of `guard` in terms of the extremum of an
/// induction variable. Returns the block in front of the IV's loop and
/// that loop's begin.
fn try_rewrite_compare(
    graph: &mut Graph,
    ctx: &mut PhaseContext<'_>,
    data: &LoopsData,
    earliest: &mut Earliest,
    guard: NodeId,
    anchor_block: BlockId,
) -> Option<(BlockId, NodeId)> {
    let cfg = data.cfg();
    let (info, negated) = match graph.op(guard) {
        Operator::Guard { info, negated } => (*info, *negated),
        _ => return None,
    };
    let compare = graph.input(guard, 0);
    let op = match graph.op(compare) {
        Operator::IntCmp(op @ (CmpOp::Lt | CmpOp::Below)) => *op,
        _ => return None,
    };
    if negated && op == CmpOp::Below {
        return None;
    }
    let (x, y) = (graph.input(compare, 0), graph.input(compare, 1));

    // The IV of the deeper loop wins; `mirrored` when it is the right operand.
    let left_iv = data.induction_variable(x);
    let right_iv = data.induction_variable(y);
    let (lp, iv, bound, mirrored) = match (left_iv, right_iv) {
        (Some((l, iv)), Some((r, _))) if l.depth() >= r.depth() => (l, iv.clone(), y, false),
        (Some((l, iv)), None) => (l, iv.clone(), y, false),
        (_, Some((r, iv))) => (r, iv.clone(), x, true),
        (None, None) => return None,
    };
    if mirrored && op == CmpOp::Below {
        return None;
    }
    let counted = lp.counted()?.clone();

    let body_block = cfg.block_for(counted.body())?;
    if !cfg.dominates(body_block, anchor_block) || !lp.whole().contains(iv.node) {
        return None;
    }
    let bound_block = earliest.block(graph, cfg, bound);
    if !cfg.strictly_dominates(bound_block, lp.header()) {
        return None;
    }

    if ctx.profile.is_trusted() {
        let mut threshold = 1.0;
        let init_constant = iv.const_init(graph).is_some();
        if !(init_constant && graph.node(bound).is_constant()) {
            threshold += 2.0;
        }
        if !(counted.iv().const_init(graph).is_some() && graph.node(counted.limit()).is_constant()) {
            threshold += 1.0;
        }
        if lp.frequency(graph) < threshold {
            trace!("{:?} runs too rarely to rewrite {guard:?}", lp.begin());
            return None;
        }
    }
    if !loops_allow(graph, ctx.profile, data, info.reason, anchor_block, lp) {
        return None;
    }

    let preheader = cfg.idom(lp.header())?;
    if cfg.block(preheader).frequency > cfg.block(anchor_block).frequency {
        return None;
    }
    if !graph.fits_in_int(bound) || !iv.ty.bits().is_some_and(|bits| bits <= 32) {
        return None;
    }
    if op == CmpOp::Below && !graph.stamp(bound).is_some_and(|s| s.is_non_negative()) {
        return None;
    }
    if !counted.iv_never_wraps(graph, &iv) {
        trace!("{:?} may wrap, keeping {guard:?}", iv.node);
        return None;
    }
    let test_op = if negated { op.negate()? } else { op };
    if let (Some(init), Some(b)) = (iv.const_init(graph), graph.node(bound).as_int()) {
        let holds = if mirrored {
            test_op.eval(64, b, init)
        } else {
            test_op.eval(64, init, b)
        };
        if !holds {
            trace!("{guard:?} would always fail");
            return None;
        }
    }

    if !counted.counter_never_overflows(graph) {
        let mark = graph.mark();
        let overflow_guard = counted.create_overflow_guard(graph)?;
        if overflow_guard.index() >= mark.index() {
            ctx.metrics.overflow_guards += 1;
        }
    }

    let bound64 = graph.sign_extend(bound);
    let extremum = counted.extremum_node(graph, &iv);
    let init = iv.init_node(graph);
    let init64 = graph.sign_extend(init);
    let (last_test, first_test) = if mirrored {
        (
            graph.compare(test_op, bound64, extremum),
            graph.compare(test_op, bound64, init64),
        )
    } else {
        (
            graph.compare(test_op, extremum, bound64),
            graph.compare(test_op, init64, bound64),
        )
    };
    let both = graph.logic(LogicOp::And, last_test, first_test);
    let entered = counted.entered_condition(graph);
    let skipped = graph.not(entered);
    let condition = graph.logic(LogicOp::Or, skipped, both);

    graph.set_input(guard, 0, condition);
    if let Operator::Guard { negated, .. } = graph.op_mut(guard) {
        *negated = false;
    }
    if graph.is_live(compare) && !graph.has_usages(compare) {
        graph.kill_with_unused_inputs(compare);
    }
    ctx.metrics.compares_rewritten += 1;
    debug!("rewrote {guard:?} over the extremum of {:?}", iv.node);
    Some((preheader, lp.begin()))
}

/// Whether the guard may leave every loop from the one around
/// `anchor_block` out to `iv_loop`.
fn loops_allow(
    graph: &Graph,
    profile: &dyn ProfilingInfo,
    data: &LoopsData,
    reason: DeoptimizationReason,
    anchor_block: BlockId,
    iv_loop: &LoopEx,
) -> bool {
    let mut current = data.cfg().block(anchor_block).innermost_loop;
    while let Some(index) = current {
        let lp = data.get(index);
        if !allows(graph, profile, reason, lp.begin(), true) {
            return false;
        }
        if lp.index() == iv_loop.index() {
            return true;
        }
        current = lp.parent();
    }
    // The anchor is not inside the IV's loop.
    false
}

// =============================================================================
// Earliest Blocks
// =============================================================================

/// Earliest block in which a value can be computed, memoized.
#[derive(Debug, Default)]
struct Earliest {
    cache: FxHashMap<NodeId, BlockId>,
}

impl Earliest {
    fn block(&mut self, graph: &Graph, cfg: &ControlFlowGraph, node: NodeId) -> BlockId {
        if let Some(&block) = self.cache.get(&node) {
            return block;
        }
        let op = graph.op(node);
        let block = if op.is_fixed() {
            cfg.block_for(node).unwrap_or(cfg.entry())
        } else {
            match op {
                Operator::Phi | Operator::Proxy | Operator::Guard { .. } => {
                    let owner = match op {
                        Operator::Guard { .. } => graph.input(node, 1),
                        _ => graph.input(node, 0),
                    };
                    cfg.block_for(owner).unwrap_or(cfg.entry())
                }
                Operator::ConstInt(_) | Operator::ConstBool(_) | Operator::Parameter(_) => cfg.entry(),
                _ => {
                    let inputs = graph.inputs(node).to_vec();
                    let mut deepest = cfg.entry();
                    for input in inputs {
                        let b = self.block(graph, cfg, input);
                        if cfg.dominator_depth(b) > cfg.dominator_depth(deepest) {
                            deepest = b;
                        }
                    }
                    deepest
                }
            }
        };
        self.cache.insert(node, block);
        block
    }
}
