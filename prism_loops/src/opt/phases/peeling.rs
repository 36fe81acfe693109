//! Loop peeling phase.

use log::debug;

use super::canonicalize;
use crate::error::LoopResult;
use crate::ir::{Graph, NodeId};
use crate::opt::loops::LoopsData;
use crate::opt::transform::peel;
use crate::opt::{LoopPhase, PhaseContext};

/// Peels one iteration off loops the policies pick, innermost first.
#[derive(Debug, Default)]
pub struct PeelingPhase;

impl PeelingPhase {
    pub fn new() -> Self {
        Self
    }
}

impl LoopPhase for PeelingPhase {
    fn name(&self) -> &'static str {
        "peeling"
    }

    fn run(&mut self, graph: &mut Graph, ctx: &mut PhaseContext<'_>) -> LoopResult<bool> {
        let mut changed = false;
        for iteration in 0..ctx.config.peeling_iterations {
            let candidates: Vec<NodeId> = {
                let data = LoopsData::compute(graph);
                data.inner_first()
                    .into_iter()
                    .filter(|lp| ctx.policies.should_peel(graph, lp, iteration))
                    .map(|lp| lp.begin())
                    .collect()
            };
            if candidates.is_empty() {
                break;
            }
            for begin in candidates {
                let data = LoopsData::compute(graph);
                let Some(lp) = data.loop_for(begin) else {
                    continue;
                };
                if !ctx.policies.should_peel(graph, lp, iteration) {
                    continue;
                }
                let touched = peel(graph, lp);
                debug!("peeled {begin:?} in round {iteration}");
                ctx.metrics.peeled += 1;
                canonicalize(graph, ctx, &touched);
                changed = true;
            }
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{CmpOp, ControlBuilder, GraphBuilder, ValueType};
    use crate::opt::phases::testing::run_phase;
    use crate::opt::transform::testing::assert_equivalent;
    use crate::opt::{LoopConfig, StaticProfile};

    fn nested(outer_freq: f64, inner_freq: f64) -> Graph {
        let mut b = GraphBuilder::new(0);
        let n = b.parameter_in(ValueType::Int32, 0, 8);
        let arr = b.parameter(ValueType::Array);
        let zero = b.int(0);
        let one = b.int(1);
        let mut outer = b.begin_loop(&[zero], outer_freq);
        let i = outer.phi(0);
        let c = b.compare(CmpOp::Lt, i, n);
        b.exit_unless(&mut outer, c);
        let mut inner = b.begin_loop(&[zero], inner_freq);
        let j = inner.phi(0);
        let c = b.compare(CmpOp::Lt, j, i);
        b.exit_unless(&mut inner, c);
        let v = b.load(arr, j);
        let v1 = b.add(v, one);
        b.store(arr, j, v1);
        let j1 = b.add(j, one);
        b.end_loop(inner, &[j1], &[]);
        let i1 = b.add(i, one);
        b.end_loop(outer, &[i1], &[]);
        b.return_value(None);
        b.finish()
    }

    #[test]
    fn test_peels_every_hot_loop_once() {
        let original = nested(10.0, 10.0);
        let mut g = original.clone();
        let (result, metrics) =
            run_phase(&mut PeelingPhase::new(), &mut g, &LoopConfig::default(), &StaticProfile::new());
        assert_eq!(result, Ok(true));
        assert_eq!(g.verify(), Ok(()));
        // Both loops once; the copy of the inner loop inside the peeled
        // outer iteration was itself never peeled.
        assert!(metrics.peeled >= 2);
        for begin in g.loop_begins() {
            assert!(g.loop_info(begin).map_or(0, |i| i.peelings) <= 1);
        }
        assert_equivalent(&original, &g, &[0, 1, 3, 8], &[vec![0; 8]]);
    }

    #[test]
    fn test_cold_loops_are_left_alone() {
        let original = nested(1.0, 1.0);
        let mut g = original.clone();
        let (result, metrics) =
            run_phase(&mut PeelingPhase::new(), &mut g, &LoopConfig::default(), &StaticProfile::new());
        assert_eq!(result, Ok(false));
        assert_eq!(metrics.peeled, 0);
        assert_eq!(g.live_count(), original.live_count());
    }
}
