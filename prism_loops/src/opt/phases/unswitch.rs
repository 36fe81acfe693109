//! Loop unswitching phase.

use log::{debug, trace};

use super::canonicalize;
use crate::error::LoopResult;
use crate::ir::{Graph, NodeId};
use crate::opt::loops::LoopsData;
use crate::opt::transform::{find_unswitchable, unswitch};
use crate::opt::{LoopPhase, PhaseContext};

/// Hoists invariant splits out of loops, one group per loop and round.
#[derive(Debug, Default)]
pub struct UnswitchPhase;

impl UnswitchPhase {
    pub fn new() -> Self {
        Self
    }
}

impl LoopPhase for UnswitchPhase {
    fn name(&self) -> &'static str {
        "unswitch"
    }

    fn run(&mut self, graph: &mut Graph, ctx: &mut PhaseContext<'_>) -> LoopResult<bool> {
        let mut changed = false;
        for round in 0..ctx.config.unswitch_iterations {
            let candidates: Vec<NodeId> = {
                let data = LoopsData::compute(graph);
                data.inner_first()
                    .into_iter()
                    .filter(|lp| ctx.policies.should_try_unswitch(graph, lp))
                    .map(|lp| lp.begin())
                    .collect()
            };

            let mut round_changed = false;
            for begin in candidates {
                let data = LoopsData::compute(graph);
                let Some(lp) = data.loop_for(begin) else {
                    continue;
                };
                if !ctx.policies.should_try_unswitch(graph, lp) {
                    continue;
                }
                let groups = find_unswitchable(graph, lp, ctx.profile);
                let Some(splits) = groups
                    .into_iter()
                    .find(|splits| ctx.policies.should_unswitch(graph, lp, splits))
                else {
                    trace!("no unswitch candidate in {begin:?}");
                    continue;
                };
                let versions = unswitch(graph, lp, &splits);
                debug!("round {round}: unswitched {begin:?} into {versions:?}");
                ctx.metrics.unswitched += 1;
                canonicalize(graph, ctx, &[]);
                round_changed = true;
            }
            if !round_changed {
                break;
            }
            changed = true;
        }
        Ok(changed)
    }
}
