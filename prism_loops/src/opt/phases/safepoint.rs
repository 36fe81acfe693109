//! Loop safepoint elimination.
//!
//! Two cases lose their back-edge poll:
//!
//! 1. Innermost counted loops whose counter stays in 32-bit range run a
//!    bounded number of iterations; when the counter might wrap, an
//!    overflow guard in front of the loop makes the bound hold.
//! 2. A back edge dominated, within its loop, by a call that always polls
//!    does not need a poll of its own.

use log::debug;

use crate::error::LoopResult;
use crate::ir::{BlockId, ControlFlowGraph, Graph, NodeId, Operator};
use crate::opt::loops::{LoopEx, LoopsData};
use crate::opt::{LoopPhase, PhaseContext};

/// Drops back-edge polls that bounded loops or dominating calls make
/// redundant.
#[derive(Debug, Default)]
pub struct SafepointEliminationPhase;

impl SafepointEliminationPhase {
    pub fn new() -> Self {
        Self
    }
}

/// Rewrites decided on one snapshot of the loop analysis.
#[derive(Debug, Default)]
struct Plan {
    /// Counted loops, and whether they need an overflow guard first.
    bounded: Vec<(NodeId, bool)>,
    /// Back edges covered by a polling call.
    covered: Vec<NodeId>,
}

impl LoopPhase for SafepointEliminationPhase {
    fn name(&self) -> &'static str {
        "safepoint_elimination"
    }

    fn run(&mut self, graph: &mut Graph, ctx: &mut PhaseContext<'_>) -> LoopResult<bool> {
        let data = LoopsData::compute(graph);
        let plan = plan(graph, &data);
        let mut changed = false;

        for (begin, needs_guard) in plan.bounded {
            let Some(counted) = data.loop_for(begin).and_then(|lp| lp.counted()) else {
                continue;
            };
            if needs_guard {
                let mark = graph.mark();
                match counted.create_overflow_guard(graph) {
                    Some(guard) => {
                        if guard.index() >= mark.index() {
                            ctx.metrics.overflow_guards += 1;
                        }
                    }
                    None => continue,
                }
            }
            let polls = polling_ends(graph, begin);
            graph.disable_safepoints(begin);
            debug!("{begin:?} is bounded, removed {polls} safepoints");
            ctx.metrics.safepoints_removed += polls;
            changed = true;
        }

        for end in plan.covered {
            if let Operator::LoopEnd { safepoint } = graph.op_mut(end) {
                if *safepoint {
                    *safepoint = false;
                    ctx.metrics.safepoints_removed += 1;
                    changed = true;
                }
            }
        }
        Ok(changed)
    }
}

fn plan(graph: &Graph, data: &LoopsData) -> Plan {
    let mut plan = Plan::default();
    for lp in data.loops() {
        let begin = lp.begin();
        if polling_ends(graph, begin) == 0 {
            continue;
        }
        if let Some(needs_guard) = bounded_counter(graph, lp) {
            plan.bounded.push((begin, needs_guard));
            continue;
        }
        for &end in graph.loop_ends(begin) {
            if graph.op(end) == &(Operator::LoopEnd { safepoint: true })
                && polls_on_the_way(graph, data.cfg(), end, lp.header())
            {
                plan.covered.push(end);
            }
        }
    }
    plan
}

fn polling_ends(graph: &Graph, begin: NodeId) -> u32 {
    graph
        .loop_ends(begin)
        .iter()
        .filter(|&&e| graph.op(e) == &Operator::LoopEnd { safepoint: true })
        .count() as u32
}

/// For an innermost counted loop in 32-bit range, whether an overflow
/// guard is needed to bound it. `None` when the loop cannot be bounded.
fn bounded_counter(graph: &Graph, lp: &LoopEx) -> Option<bool> {
    let counted = lp.counted()?;
    if !lp.is_innermost() {
        return None;
    }
    let iv = counted.iv();
    let in_int_range = iv.ty.bits().is_some_and(|bits| bits <= 32)
        || (graph.fits_in_int(counted.limit())
            && iv.init_stamp(graph).is_some_and(|s| s.fits_in(32)));
    if !in_int_range {
        return None;
    }
    if counted.counter_never_overflows(graph) {
        Some(false)
    } else if counted.can_create_overflow_guard(graph) {
        Some(true)
    } else {
        None
    }
}

/// Whether a polling call dominates `end` inside the loop headed by
/// `header`.
fn polls_on_the_way(graph: &Graph, cfg: &ControlFlowGraph, end: NodeId, header: BlockId) -> bool {
    let mut block = cfg.block_for(end);
    while let Some(b) = block {
        let polls = cfg.block(b).nodes.iter().any(|&n| {
            matches!(
                graph.op(n),
                Operator::Invoke {
                    safepoint: true,
                    ..
                }
            )
        });
        if polls {
            return true;
        }
        if b == header {
            break;
        }
        block = cfg.idom(b);
    }
    false
}
