//! Pre/main/post splitting.
//!
//! ```text
//!   P ─► F ─► LB_pre ─► X ─► F_main ─► LB_main ─► X_main ─► F_post ─► LB_post ─► X_post ─► C
//! ```
//!
//! The pre loop runs at most one iteration, the main loop is the one later
//! unrolled, the post loop runs whatever the main loop leaves. Each loop
//! starts from the values of the previous one at its exit; only the post
//! loop's exit feeds the code after the original loop.

use log::debug;

use super::{privatize_exit_state, reanchor_guards};
use crate::ir::{ArithOp, Graph, LoopKind, NodeId, Operator};
use crate::opt::loops::{Direction, DuplicationMap, LoopEx, LoopFragment};

/// Loop begins of a split loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrePostLoops {
    /// The original loop, now running at most one iteration.
    pub pre: NodeId,
    /// The loop to unroll.
    pub main: NodeId,
    /// Runs the remaining iterations.
    pub post: NodeId,
}

/// Split the counted loop `lp` into pre, main and post loops.
///
/// `lp` must be counted and have a single exit.
pub fn insert_pre_post_loops(graph: &mut Graph, lp: &LoopEx) -> PrePostLoops {
    let Some(counted) = lp.counted() else {
        panic!("pre/main/post split of uncounted loop {:?}", lp.begin());
    };
    assert_eq!(lp.exits().len(), 1, "loop {:?} has several exits", lp.begin());
    let begin = lp.begin();
    let exit = counted.exit();

    let whole = match privatize_exit_state(graph, exit) {
        Some((shared, private)) => LoopFragment::from_nodes(
            lp.whole()
                .nodes()
                .iter()
                .copied()
                .filter(|&n| n != shared)
                .chain(std::iter::once(private)),
        ),
        None => lp.whole().clone(),
    };
    let phis = graph.phis(begin);
    let proxies = graph.proxies(exit);
    let exit_state = graph.node(exit).state();
    let forward = graph.forward_end(begin);

    let main_map = whole.duplicate(graph, &DuplicationMap::default());
    let post_map = whole.duplicate(graph, &DuplicationMap::default());
    let (main, post) = (main_map[&begin], post_map[&begin]);
    let (main_exit, post_exit) = (main_map[&exit], post_map[&exit]);

    let continuation = graph.next(exit);
    if continuation.is_some() {
        graph.set_next(exit, NodeId::INVALID);
    }
    graph.set_next(exit, main_map[&forward]);
    graph.set_next(main_exit, post_map[&forward]);
    if let Some(c) = continuation {
        graph.set_next(post_exit, c);
    }

    for &phi in &phis {
        let ty = graph.ty(phi);
        let after_pre = graph.add(Operator::Proxy, &[exit, phi], ty);
        graph.set_input(main_map[&phi], 1, after_pre);
        let after_main = graph.add(Operator::Proxy, &[main_exit, main_map[&phi]], ty);
        graph.set_input(post_map[&phi], 1, after_main);
    }
    for &proxy in &proxies {
        graph.replace_at_usages_where(proxy, post_map[&proxy], |u| Some(u) != exit_state);
    }
    reanchor_guards(graph, exit, post_exit);

    // At most one pre iteration: clamp the limit to the first step.
    let iv = counted.iv().clone();
    let ty = iv.ty;
    let init = iv.init_node(graph);
    let bound = if counted.limit_included() {
        init
    } else {
        let step = graph.const_int(iv.stride, ty);
        graph.arith(ArithOp::Add, init, step, ty)
    };
    let clamp = match counted.direction() {
        Direction::Up => ArithOp::Min,
        Direction::Down => ArithOp::Max,
    };
    let pre_limit = graph.arith(clamp, counted.limit(), bound, ty);
    let condition = counted.stay_condition(graph, iv.node, pre_limit);
    let if_node = counted.if_node();
    let old_condition = graph.input(if_node, 0);
    graph.set_input(if_node, 0, condition);
    if !graph.has_usages(old_condition) {
        graph.kill_with_unused_inputs(old_condition);
    }

    graph.disable_safepoints(begin);
    graph.disable_safepoints(post);
    let frequency = lp.frequency(graph);
    for (loop_begin, kind, freq) in [
        (begin, LoopKind::Pre, 1.0),
        (main, LoopKind::Main, (frequency - 2.0).max(1.0)),
        (post, LoopKind::Post, 1.0),
    ] {
        if let Some(info) = graph.loop_info_mut(loop_begin) {
            info.kind = kind;
            info.frequency = freq;
        }
    }
    debug!("split {begin:?} into pre/main/post, main {main:?}, post {post:?}");

    PrePostLoops {
        pre: begin,
        main,
        post,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{CmpOp, ControlBuilder, GraphBuilder, LoopInfo, ValueType};
    use crate::opt::loops::LoopsData;
    use crate::opt::transform::testing::{assert_equivalent, clean, run};

    /// Sum of `i` over a counted loop, returning the sum and leaving the
    /// final counter in `a[0]`.
    fn sum_loop(init: i64, op: CmpOp, stride: i64, frame_states: bool) -> Graph {
        let mut b = GraphBuilder::new(0);
        if frame_states {
            b = b.with_frame_states();
        }
        let n = b.parameter_in(ValueType::Int32, -1000, 1000);
        let arr = b.parameter(ValueType::Array);
        let start = b.int(init);
        let zero = b.int(0);
        let step = b.int(stride);
        let mut lp = b.begin_loop(&[start, zero], 20.0);
        let (i, sum) = (lp.phi(0), lp.phi(1));
        let c = b.compare(op, i, n);
        b.exit_unless(&mut lp, c);
        let s1 = b.add(sum, i);
        let i1 = b.add(i, step);
        let after = b.end_loop(lp, &[i1, s1], &[i, sum]);
        b.store(arr, zero, after[0]);
        b.return_value(Some(after[1]));
        b.finish()
    }

    fn split(graph: &mut Graph) -> PrePostLoops {
        let data = LoopsData::compute(graph);
        let loops = insert_pre_post_loops(graph, &data.loops()[0]);
        assert_eq!(graph.verify(), Ok(()));
        loops
    }

    #[test]
    fn test_split_preserves_semantics() {
        let shapes = [
            (0, CmpOp::Lt, 1),
            (0, CmpOp::Le, 1),
            (0, CmpOp::Lt, 3),
            (10, CmpOp::Gt, -1),
            (10, CmpOp::Ge, -2),
        ];
        for (init, op, stride) in shapes {
            for frame_states in [false, true] {
                let original = sum_loop(init, op, stride, frame_states);
                let mut g = original.clone();
                split(&mut g);
                assert_equivalent(&original, &g, &[-5, 0, 1, 2, 3, 9, 10, 11], &[vec![0]]);
                clean(&mut g);
                assert_equivalent(&original, &g, &[-5, 0, 1, 2, 3, 9, 10, 11], &[vec![0]]);
            }
        }
    }

    #[test]
    fn test_pre_loop_runs_once() {
        let original = sum_loop(0, CmpOp::Lt, 1, false);
        let mut g = original.clone();
        let loops = split(&mut g);
        let exec = run(&g, &[7], &[vec![0]]);
        // Forward entry plus one back edge each for pre; main does the rest.
        assert_eq!(exec.header_entries[&loops.pre], 2);
        assert_eq!(exec.header_entries[&loops.main], 7);
        assert_eq!(exec.header_entries[&loops.post], 1);

        let empty = run(&g, &[0], &[vec![0]]);
        assert_eq!(empty.header_entries[&loops.pre], 1);
    }

    #[test]
    fn test_kinds_safepoints_and_frequencies() {
        let mut g = sum_loop(0, CmpOp::Lt, 1, true);
        let loops = split(&mut g);
        let info = |g: &Graph, b: NodeId| g.loop_info(b).copied().unwrap_or_default();
        assert_eq!(info(&g, loops.pre).kind, LoopKind::Pre);
        assert_eq!(info(&g, loops.main).kind, LoopKind::Main);
        assert_eq!(info(&g, loops.post).kind, LoopKind::Post);
        assert_eq!(info(&g, loops.pre).frequency, 1.0);
        assert_eq!(info(&g, loops.main).frequency, 18.0);
        assert_eq!(info(&g, loops.post).frequency, 1.0);
        assert_eq!(info(&g, loops.main).unroll_factor, LoopInfo::default().unroll_factor);

        let polls = |g: &Graph, b: NodeId| {
            g.loop_ends(b)
                .iter()
                .all(|&e| g.op(e) == &Operator::LoopEnd { safepoint: true })
        };
        assert!(!polls(&g, loops.pre));
        assert!(polls(&g, loops.main));
        assert!(!polls(&g, loops.post));

        let exec = run(&g, &[5], &[vec![0]]);
        assert_eq!(exec.safepoint_polls, 4);
    }

    #[test]
    fn test_main_and_post_stay_counted() {
        let mut g = sum_loop(0, CmpOp::Lt, 1, true);
        let loops = split(&mut g);
        clean(&mut g);
        let data = LoopsData::compute(&g);
        for begin in [loops.pre, loops.main, loops.post] {
            let lp = data.loop_for(begin).expect("loop survives cleanup");
            assert!(lp.is_counted(), "{begin:?} lost its counted shape");
            assert_eq!(lp.exits().len(), 1);
        }
    }
}
