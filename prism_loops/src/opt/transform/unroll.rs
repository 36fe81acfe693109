//! Full and partial unrolling.
//!
//! Full unrolling peels a loop with a known small trip count until the
//! canonicalizer folds the exit test of a copy and the loop disappears.
//!
//! Partial unrolling doubles the body of a main loop:
//!
//! ```text
//!   LB ─► If(iv < L) ─► body ─► LE          LB ─► If(iv < L') ─► body ─► body' ─► LE
//! ```
//!
//! The second copy reads the values the first one computed. The limit is
//! pulled in by one stride so that both copies run in bounds; the post loop
//! behind the main loop runs the remaining iterations.

use log::debug;

use super::peel::peel;
use crate::error::{BailoutReason, LoopError, LoopResult};
use crate::ir::{ArithOp, Graph, IntegerStamp, NodeId, ValueType};
use crate::opt::loops::{prune_unused_copies, Direction, DuplicationMap, LoopEx, LoopsData};
use crate::opt::{Canonicalizer, LoopConfig};

/// Peel the loop headed by `begin` until it is gone.
///
/// The graph is canonicalized after every peel. Fails with a bailout when
/// more than `full_unroll_max_iterations` peels are needed or the graph
/// outgrows its budget; the peels done so far stay in place and the graph
/// remains valid. Returns the number of peels.
pub fn full_unroll(
    graph: &mut Graph,
    begin: NodeId,
    config: &LoopConfig,
    canonicalizer: &dyn Canonicalizer,
) -> LoopResult<u32> {
    let size_before = graph.live_count();
    let budget = (size_before as f64 * config.full_unroll_growth(size_before)) as usize;
    let mut peels = 0u32;
    loop {
        let data = LoopsData::compute(graph);
        let Some(lp) = data.loop_for(begin) else {
            break;
        };
        if peels >= config.full_unroll_max_iterations {
            return Err(LoopError::Bailout(BailoutReason::UnrollIterationLimit {
                iterations: peels,
                limit: config.full_unroll_max_iterations,
            }));
        }
        let touched = peel(graph, lp);
        peels += 1;
        canonicalizer.canonicalize(graph, &touched);

        let size = graph.live_count();
        if size > budget {
            return Err(LoopError::Bailout(BailoutReason::GraphSizeLimit {
                size,
                limit: budget,
            }));
        }
    }
    debug!("fully unrolled {begin:?} with {peels} peels");
    Ok(peels)
}

/// Whether `lp` can be partially unrolled.
///
/// The loop must be innermost and counted, with a single exit and a single
/// back edge, and doubling its unroll factor must not overflow the stride.
pub fn is_unrollable_loop(graph: &Graph, lp: &LoopEx) -> bool {
    let Some(counted) = lp.counted() else {
        return false;
    };
    if !lp.is_innermost() || lp.exits().len() != 1 || graph.loop_ends(lp.begin()).len() != 1 {
        return false;
    }
    let factor = i64::from(lp.info(graph).unroll_factor).saturating_mul(2);
    counted
        .stride()
        .checked_mul(factor)
        .is_some_and(|s| fits(counted.iv().ty, s))
}

fn fits(ty: ValueType, value: i64) -> bool {
    ty.bits().is_some_and(|bits| {
        IntegerStamp::min_value(bits) <= value && value <= IntegerStamp::max_value(bits)
    })
}

/// Double the body of the main loop `lp`.
///
/// `lp` must satisfy [`is_unrollable_loop`]. Fails with
/// [`BailoutReason::StrideOverflow`] when the doubled stride does not fit
/// the counter's type.
pub fn partial_unroll(graph: &mut Graph, lp: &LoopEx) -> LoopResult<Vec<NodeId>> {
    let Some(counted) = lp.counted() else {
        panic!("partial unroll of uncounted loop {:?}", lp.begin());
    };
    assert!(
        lp.exits().len() == 1 && graph.loop_ends(lp.begin()).len() == 1,
        "partial unroll of {:?} needs one exit and one back edge",
        lp.begin()
    );
    let begin = lp.begin();
    let stride = counted.stride();
    let ty = counted.iv().ty;
    let factor = lp.info(graph).unroll_factor.saturating_mul(2);
    if !stride.checked_mul(2).is_some_and(|s| fits(ty, s)) {
        return Err(LoopError::Bailout(BailoutReason::StrideOverflow { stride, factor }));
    }

    let if_node = counted.if_node();
    let exit = counted.exit();
    let loop_end = graph.loop_ends(begin)[0];
    let phis = graph.phis(begin);
    let proxies = graph.proxies(exit);
    let guards = graph.anchored_guards(begin);
    let states = [graph.node(begin).state(), graph.node(exit).state()];
    let body = lp.whole().without(|n| {
        n == begin
            || n == if_node
            || n == exit
            || phis.contains(&n)
            || proxies.contains(&n)
            || guards.contains(&n)
            || states.contains(&Some(n))
    });

    // The copy starts from the values the first body hands to the back edge.
    let mut replacements = DuplicationMap::default();
    for &phi in &phis {
        replacements.insert(phi, graph.phi_value(phi, 1));
    }
    let map = body.duplicate(graph, &replacements);

    let copy_begin = map[&counted.body()];
    let copy_end = map[&loop_end];
    graph.replace_at_predecessor(loop_end, copy_begin);
    graph.replace_at_predecessor(copy_end, loop_end);
    graph.kill(copy_end);

    for &phi in &phis {
        let value = graph.phi_value(phi, 1);
        let back = match map.get(&value) {
            Some(&copy) => copy,
            None => replacements.get(&value).copied().unwrap_or(value),
        };
        graph.set_input(phi, 2, back);
    }
    prune_unused_copies(graph, &map);

    // Leave room for the second copy: L' = clamp(L) - stride.
    let bits = ty.bits().unwrap_or(64);
    let step = graph.const_int(stride, ty);
    let limit = counted.limit();
    let clamped = match counted.direction() {
        Direction::Up => {
            let floor = graph.const_int(IntegerStamp::min_value(bits) + stride, ty);
            graph.arith(ArithOp::Max, limit, floor, ty)
        }
        Direction::Down => {
            let ceiling = graph.const_int(IntegerStamp::max_value(bits) + stride, ty);
            graph.arith(ArithOp::Min, limit, ceiling, ty)
        }
    };
    let new_limit = graph.arith(ArithOp::Sub, clamped, step, ty);
    let condition = counted.stay_condition(graph, counted.iv().node, new_limit);
    let old_condition = graph.input(if_node, 0);
    graph.set_input(if_node, 0, condition);
    if !graph.has_usages(old_condition) {
        graph.kill_with_unused_inputs(old_condition);
    }

    if let Some(info) = graph.loop_info_mut(begin) {
        info.unroll_factor = factor;
        info.frequency = (info.frequency / 2.0).max(1.0);
    }
    debug!("unrolled {begin:?} to factor {factor}");

    let mut touched: Vec<NodeId> = map.values().copied().filter(|&n| graph.is_live(n)).collect();
    touched.extend([begin, if_node, condition]);
    touched.extend(phis);
    Ok(touched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{CmpOp, ControlBuilder, GraphBuilder, LoopKind, Operator};
    use crate::opt::transform::insert_pre_post_loops;
    use crate::opt::transform::testing::{assert_equivalent, clean, run};
    use crate::opt::SimpleCanonicalizer;

    /// `a[i] = a[i] + i` for `i` in `init..limit` step `stride`, returning
    /// the final counter.
    fn array_loop(init: i64, limit: Option<i64>, stride: i64) -> Graph {
        let mut b = GraphBuilder::new(0);
        let n = match limit {
            Some(c) => b.int(c),
            None => b.parameter_in(ValueType::Int32, -100, 100),
        };
        let arr = b.parameter(ValueType::Array);
        let start = b.int(init);
        let step = b.int(stride);
        let mut lp = b.begin_loop(&[start], 16.0);
        let i = lp.phi(0);
        let op = if stride > 0 { CmpOp::Lt } else { CmpOp::Gt };
        let c = b.compare(op, i, n);
        b.exit_unless(&mut lp, c);
        let old = b.load(arr, i);
        let new = b.add(old, i);
        b.store(arr, i, new);
        let next = b.add(i, step);
        let after = b.end_loop(lp, &[next], &[i]);
        b.return_value(Some(after[0]));
        b.finish()
    }

    #[test]
    fn test_full_unroll_removes_loop() {
        let original = array_loop(0, Some(4), 1);
        let mut g = original.clone();
        let begin = g.loop_begins()[0];
        let config = LoopConfig::default();
        let peels = full_unroll(&mut g, begin, &config, &SimpleCanonicalizer::new()).unwrap();
        assert_eq!(peels, 5);
        assert_eq!(g.verify(), Ok(()));
        assert!(g.loop_begins().is_empty());

        let heap = vec![vec![10; 8]];
        let before = run(&original, &[], &heap);
        let after = run(&g, &[], &heap);
        assert!(before.same_effects(&after));
        assert_eq!(after.heap[0][..5], [10, 11, 12, 13, 10]);
    }

    #[test]
    fn test_full_unroll_iteration_limit() {
        let mut g = array_loop(0, Some(40), 1);
        let begin = g.loop_begins()[0];
        let config = LoopConfig {
            full_unroll_max_iterations: 3,
            ..LoopConfig::default()
        };
        let err = full_unroll(&mut g, begin, &config, &SimpleCanonicalizer::new()).unwrap_err();
        assert_eq!(
            err,
            LoopError::Bailout(BailoutReason::UnrollIterationLimit {
                iterations: 3,
                limit: 3
            })
        );
        // The partially peeled graph is still a valid program.
        assert_eq!(g.verify(), Ok(()));
        assert_eq!(g.loop_begins().len(), 1);
    }

    #[test]
    fn test_full_unroll_size_limit() {
        let mut g = array_loop(0, Some(40), 1);
        let begin = g.loop_begins()[0];
        let config = LoopConfig {
            small_graph_growth: 1.1,
            ..LoopConfig::default()
        };
        let err = full_unroll(&mut g, begin, &config, &SimpleCanonicalizer::new()).unwrap_err();
        assert!(matches!(
            err,
            LoopError::Bailout(BailoutReason::GraphSizeLimit { .. })
        ));
        assert_eq!(g.verify(), Ok(()));
    }

    #[test]
    fn test_full_unroll_of_unknown_trip_count_bails_out() {
        let original = array_loop(0, None, 1);
        let mut g = original.clone();
        let begin = g.loop_begins()[0];
        let err = full_unroll(&mut g, begin, &LoopConfig::default(), &SimpleCanonicalizer::new())
            .unwrap_err();
        assert!(matches!(err, LoopError::Bailout(_)), "{err:?}");
        assert_eq!(g.verify(), Ok(()));
        assert_eq!(g.loop_begins().len(), 1);

        assert_equivalent(&original, &g, &[-4, 0, 1, 3, 8], &[vec![1; 8]]);
    }

    fn split_and_unroll(graph: &mut Graph, rounds: usize) -> NodeId {
        let data = LoopsData::compute(graph);
        let loops = insert_pre_post_loops(graph, &data.loops()[0]);
        clean(graph);
        for _ in 0..rounds {
            let data = LoopsData::compute(graph);
            let main = data.loop_for(loops.main).expect("main loop survives");
            assert!(is_unrollable_loop(graph, main));
            partial_unroll(graph, main).unwrap();
            clean(graph);
        }
        loops.main
    }

    #[test]
    fn test_partial_unroll_upward() {
        let original = array_loop(0, None, 1);
        let mut g = original.clone();
        let main = split_and_unroll(&mut g, 2);
        let info = g.loop_info(main).copied().unwrap();
        assert_eq!(info.kind, LoopKind::Main);
        assert_eq!(info.unroll_factor, 4);

        let heap = vec![vec![0; 128]];
        assert_equivalent(&original, &g, &[-5, 0, 1, 2, 3, 4, 5, 6, 7, 9, 17, 100], &heap);

        let data = LoopsData::compute(&g);
        let counted = data.loop_for(main).and_then(|lp| lp.counted()).unwrap();
        assert_eq!(counted.stride(), 4);
    }

    #[test]
    fn test_partial_unroll_downward_stride() {
        let original = array_loop(99, None, -2);
        let mut g = original.clone();
        split_and_unroll(&mut g, 1);
        let heap = vec![vec![0; 128]];
        assert_equivalent(&original, &g, &[-1, 0, 50, 93, 94, 95, 96, 97, 98, 99, 100], &heap);
    }

    #[test]
    fn test_main_loop_runs_fewer_headers() {
        let original = array_loop(0, None, 1);
        let mut g = original.clone();
        let main = split_and_unroll(&mut g, 1);
        let heap = vec![vec![0; 128]];
        let exec = run(&g, &[41], &heap);
        // One pre iteration, then pairs of iterations.
        assert_eq!(exec.header_entries[&main], 21);
    }

    #[test]
    fn test_stride_overflow_bails_out() {
        let mut b = GraphBuilder::new(0);
        let n = b.parameter(ValueType::Int32);
        let zero = b.int(0);
        let step = b.int(1 << 30);
        let mut lp = b.begin_loop(&[zero], 16.0);
        let i = lp.phi(0);
        let c = b.compare(CmpOp::Lt, i, n);
        b.exit_unless(&mut lp, c);
        let next = b.add(i, step);
        b.end_loop(lp, &[next], &[]);
        b.return_value(None);
        let mut g = b.finish();

        let data = LoopsData::compute(&g);
        let lp = &data.loops()[0];
        assert!(!is_unrollable_loop(&g, lp));
        let err = partial_unroll(&mut g, lp).unwrap_err();
        assert!(matches!(
            err,
            LoopError::Bailout(BailoutReason::StrideOverflow { stride: 1073741824, .. })
        ));
    }

    #[test]
    fn test_loops_with_two_exits_are_not_unrollable() {
        let mut b = GraphBuilder::new(0);
        let n = b.parameter(ValueType::Int32);
        let zero = b.int(0);
        let one = b.int(1);
        let mut lp = b.begin_loop(&[zero], 16.0);
        let i = lp.phi(0);
        let c = b.compare(CmpOp::Lt, i, n);
        b.exit_unless(&mut lp, c);
        let stop = b.compare(CmpOp::Eq, i, one);
        b.exit_if(&mut lp, stop);
        let next = b.add(i, one);
        b.end_loop(lp, &[next], &[]);
        b.return_value(None);
        let g = b.finish();
        let data = LoopsData::compute(&g);
        assert!(data.loops()[0].is_counted());
        assert!(!is_unrollable_loop(&g, &data.loops()[0]));
        assert_eq!(g.nodes_where(|op| matches!(op, Operator::LoopExit)).len(), 2);
    }
}
