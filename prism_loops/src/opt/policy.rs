//! Cost model of the loop phases.
//!
//! The phase drivers ask a [`LoopPolicies`] implementation before every
//! transformation and treat the answer as opaque. [`DefaultLoopPolicies`]
//! derives its answers from [`LoopConfig`] thresholds.

use log::trace;

use super::config::LoopConfig;
use super::loops::LoopEx;
use crate::ir::{Graph, LoopKind, NodeId};

/// Decides which loops are worth transforming.
pub trait LoopPolicies {
    /// Peel `lp` during round `iteration` of the peeling phase.
    fn should_peel(&self, graph: &Graph, lp: &LoopEx, iteration: u32) -> bool;

    /// Fully unroll the counted loop `lp`.
    fn should_full_unroll(&self, graph: &Graph, lp: &LoopEx) -> bool;

    /// Split `lp` into pre/main/post loops, or unroll an existing main loop.
    fn should_partially_unroll(&self, graph: &Graph, lp: &LoopEx) -> bool;

    /// Look for unswitch candidates in `lp` at all.
    fn should_try_unswitch(&self, graph: &Graph, lp: &LoopEx) -> bool;

    /// Unswitch `lp` on the given group of equivalent splits.
    fn should_unswitch(&self, graph: &Graph, lp: &LoopEx, splits: &[NodeId]) -> bool;
}

/// Threshold-based policies.
#[derive(Debug, Clone, Default)]
pub struct DefaultLoopPolicies {
    config: LoopConfig,
}

impl DefaultLoopPolicies {
    /// Policies reading thresholds from `config`.
    pub fn new(config: &LoopConfig) -> Self {
        DefaultLoopPolicies {
            config: config.clone(),
        }
    }

    /// Thresholds in use.
    pub fn config(&self) -> &LoopConfig {
        &self.config
    }
}

impl LoopPolicies for DefaultLoopPolicies {
    fn should_peel(&self, graph: &Graph, lp: &LoopEx, iteration: u32) -> bool {
        let info = lp.info(graph);
        let ok = info.kind == LoopKind::Normal
            && info.peelings < self.config.max_peelings_per_loop
            && lp.size() <= self.config.peeling_max_size
            && info.frequency >= self.config.peeling_min_frequency
            && iteration < self.config.peeling_iterations;
        if !ok {
            trace!("not peeling {:?}: {:?}, size {}", lp.begin(), info, lp.size());
        }
        ok
    }

    fn should_full_unroll(&self, graph: &Graph, lp: &LoopEx) -> bool {
        let Some(trip) = lp.counted().and_then(|c| c.constant_trip_count(graph)) else {
            return false;
        };
        let nodes = (trip as usize).saturating_mul(lp.size());
        trip <= self.config.full_unroll_max_trip && nodes <= self.config.full_unroll_max_nodes
    }

    fn should_partially_unroll(&self, graph: &Graph, lp: &LoopEx) -> bool {
        let info = lp.info(graph);
        match info.kind {
            LoopKind::Normal => {
                lp.size() <= self.config.partial_unroll_max_body
                    && info.frequency >= self.config.partial_unroll_min_frequency
            }
            LoopKind::Main => {
                info.frequency >= self.config.partial_unroll_min_frequency
                    && info.unroll_factor.saturating_mul(2) <= self.config.max_unroll_factor
                    && lp.size().saturating_mul(2) <= self.config.partial_unroll_max_body
            }
            LoopKind::Pre | LoopKind::Post => false,
        }
    }

    fn should_try_unswitch(&self, graph: &Graph, lp: &LoopEx) -> bool {
        lp.info(graph).unswitches < self.config.max_unswitches_per_loop
            && lp.size() <= self.config.unswitch_max_size
    }

    fn should_unswitch(&self, graph: &Graph, lp: &LoopEx, splits: &[NodeId]) -> bool {
        let Some(&first) = splits.first() else {
            return false;
        };
        let copies = graph.successors(first).len().saturating_sub(1);
        let growth = lp.size().saturating_mul(copies);
        let ok = growth <= self.config.unswitch_max_growth;
        if !ok {
            trace!("not unswitching {:?}: growth {}", lp.begin(), growth);
        }
        ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{CmpOp, ControlBuilder, GraphBuilder, ValueType};
    use crate::opt::loops::LoopsData;

    fn loop_graph(limit: Option<i64>, frequency: f64) -> Graph {
        let mut b = GraphBuilder::new(0);
        let n = match limit {
            Some(c) => b.int(c),
            None => b.parameter(ValueType::Int32),
        };
        let zero = b.int(0);
        let one = b.int(1);
        let mut lp = b.begin_loop(&[zero], frequency);
        let i = lp.phi(0);
        let c = b.compare(CmpOp::Lt, i, n);
        b.exit_unless(&mut lp, c);
        let next = b.add(i, one);
        b.end_loop(lp, &[next], &[]);
        b.return_value(None);
        b.finish()
    }

    #[test]
    fn test_full_unroll_needs_small_constant_trip() {
        let policies = DefaultLoopPolicies::new(&LoopConfig::default());
        let g = loop_graph(Some(4), 4.0);
        let data = LoopsData::compute(&g);
        assert!(policies.should_full_unroll(&g, &data.loops()[0]));

        let g = loop_graph(Some(1000), 1000.0);
        let data = LoopsData::compute(&g);
        assert!(!policies.should_full_unroll(&g, &data.loops()[0]));

        let g = loop_graph(None, 10.0);
        let data = LoopsData::compute(&g);
        assert!(!policies.should_full_unroll(&g, &data.loops()[0]));
    }

    #[test]
    fn test_peeling_respects_frequency_and_rounds() {
        let policies = DefaultLoopPolicies::new(&LoopConfig::default());
        let g = loop_graph(None, 10.0);
        let data = LoopsData::compute(&g);
        assert!(policies.should_peel(&g, &data.loops()[0], 0));
        assert!(!policies.should_peel(&g, &data.loops()[0], 5));

        let g = loop_graph(None, 1.0);
        let data = LoopsData::compute(&g);
        assert!(!policies.should_peel(&g, &data.loops()[0], 0));
    }
}
