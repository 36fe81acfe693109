//! Partial unrolling phase.
//!
//! A round splits every eligible normal loop into pre/main/post loops and
//! doubles the body of every eligible main loop. A loop split in one round
//! is unrolled from the next round on, until the policies refuse.

use log::debug;

use super::{canonicalize, check_budget, growth_budget};
use crate::error::LoopResult;
use crate::ir::{Graph, LoopKind, NodeId};
use crate::opt::loops::LoopsData;
use crate::opt::transform::{insert_pre_post_loops, is_unrollable_loop, partial_unroll};
use crate::opt::{LoopPhase, PhaseContext};

/// Splits loops into pre/main/post and unrolls main loops, within the
/// growth budget of the phase.
#[derive(Debug, Default)]
pub struct PartialUnrollPhase;

impl PartialUnrollPhase {
    pub fn new() -> Self {
        Self
    }
}

impl LoopPhase for PartialUnrollPhase {
    fn name(&self) -> &'static str {
        "partial_unroll"
    }

    fn run(&mut self, graph: &mut Graph, ctx: &mut PhaseContext<'_>) -> LoopResult<bool> {
        let budget = growth_budget(ctx, graph.live_count());
        let mut changed = false;
        for round in 0..ctx.config.partial_unroll_rounds {
            let candidates: Vec<NodeId> = {
                let data = LoopsData::compute(graph);
                data.inner_first()
                    .into_iter()
                    .filter(|lp| {
                        is_unrollable_loop(graph, lp) && ctx.policies.should_partially_unroll(graph, lp)
                    })
                    .map(|lp| lp.begin())
                    .collect()
            };
            if candidates.is_empty() {
                break;
            }
            debug!("partial unroll round {round}: {} candidates", candidates.len());

            for begin in candidates {
                let data = LoopsData::compute(graph);
                let Some(lp) = data.loop_for(begin) else {
                    continue;
                };
                if !is_unrollable_loop(graph, lp) || !ctx.policies.should_partially_unroll(graph, lp) {
                    continue;
                }
                match lp.info(graph).kind {
                    LoopKind::Normal => {
                        insert_pre_post_loops(graph, lp);
                        ctx.metrics.pre_post_splits += 1;
                        canonicalize(graph, ctx, &[]);
                    }
                    LoopKind::Main => {
                        let touched = partial_unroll(graph, lp)?;
                        ctx.metrics.partially_unrolled += 1;
                        canonicalize(graph, ctx, &touched);
                    }
                    LoopKind::Pre | LoopKind::Post => continue,
                }
                changed = true;
                check_budget(graph, budget)?;
            }
        }
        Ok(changed)
    }
}
