//! Full unrolling phase.

use log::debug;

use super::{check_budget, growth_budget};
use crate::error::LoopResult;
use crate::ir::{Graph, NodeId};
use crate::opt::loops::LoopsData;
use crate::opt::transform::full_unroll;
use crate::opt::{LoopPhase, PhaseContext};

/// Removes counted loops with a small constant trip count.
///
/// The whole phase shares one node budget derived from the graph size when
/// it starts; each loop is additionally limited by the per-loop budget of
/// [`full_unroll`].
#[derive(Debug, Default)]
pub struct FullUnrollPhase;

impl FullUnrollPhase {
    pub fn new() -> Self {
        Self
    }
}

impl LoopPhase for FullUnrollPhase {
    fn name(&self) -> &'static str {
        "full_unroll"
    }

    fn run(&mut self, graph: &mut Graph, ctx: &mut PhaseContext<'_>) -> LoopResult<bool> {
        let budget = growth_budget(ctx, graph.live_count());
        let candidates: Vec<NodeId> = {
            let data = LoopsData::compute(graph);
            data.inner_first()
                .into_iter()
                .filter(|lp| ctx.policies.should_full_unroll(graph, lp))
                .map(|lp| lp.begin())
                .collect()
        };

        let mut changed = false;
        for begin in candidates {
            {
                let data = LoopsData::compute(graph);
                match data.loop_for(begin) {
                    Some(lp) if ctx.policies.should_full_unroll(graph, lp) => {}
                    _ => continue,
                }
            }
            let peels = full_unroll(graph, begin, ctx.config, ctx.canonicalizer)?;
            debug!("fully unrolled {begin:?} ({peels} peels)");
            ctx.metrics.fully_unrolled += 1;
            changed = true;
            check_budget(graph, budget)?;
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{BailoutReason, LoopError};
    use crate::ir::{CmpOp, ControlBuilder, GraphBuilder, ValueType};
    use crate::opt::phases::testing::run_phase;
    use crate::opt::transform::testing::assert_equivalent;
    use crate::opt::{LoopConfig, StaticProfile};

    /// `for i in 0..trips { a[i] = i * k }`.
    fn constant_loop(trips: i64) -> Graph {
        let mut b = GraphBuilder::new(0);
        let k = b.parameter(ValueType::Int32);
        let arr = b.parameter(ValueType::Array);
        let zero = b.int(0);
        let one = b.int(1);
        let limit = b.int(trips);
        let mut lp = b.begin_loop(&[zero], trips as f64);
        let i = lp.phi(0);
        let c = b.compare(CmpOp::Lt, i, limit);
        b.exit_unless(&mut lp, c);
        let v = b.mul(i, k);
        b.store(arr, i, v);
        let i1 = b.add(i, one);
        b.end_loop(lp, &[i1], &[]);
        b.return_value(None);
        b.finish()
    }

    #[test]
    fn test_small_loop_disappears() {
        let original = constant_loop(4);
        let mut g = original.clone();
        let (result, metrics) = run_phase(
            &mut FullUnrollPhase::new(),
            &mut g,
            &LoopConfig::default(),
            &StaticProfile::new(),
        );
        assert_eq!(result, Ok(true));
        assert_eq!(metrics.fully_unrolled, 1);
        assert!(g.loop_begins().is_empty());
        assert_equivalent(&original, &g, &[-3, 0, 7], &[vec![0; 4]]);
    }

    #[test]
    fn test_trip_count_above_threshold_is_kept() {
        let mut g = constant_loop(40);
        let (result, metrics) = run_phase(
            &mut FullUnrollPhase::new(),
            &mut g,
            &LoopConfig::default(),
            &StaticProfile::new(),
        );
        assert_eq!(result, Ok(false));
        assert_eq!(metrics.fully_unrolled, 0);
        assert_eq!(g.loop_begins().len(), 1);
    }

    #[test]
    fn test_budget_exhaustion_bails_out() {
        let config = LoopConfig {
            small_graph_growth: 1.1,
            ..LoopConfig::default()
        };
        let mut g = constant_loop(12);
        let (result, _) = run_phase(&mut FullUnrollPhase::new(), &mut g, &config, &StaticProfile::new());
        assert!(matches!(
            result,
            Err(LoopError::Bailout(BailoutReason::GraphSizeLimit { .. }))
        ));
        assert_eq!(g.verify(), Ok(()));
    }
}
