mod common;

use common::{assert_same_effects, init_logging, nested_flag_loops, run, sum_loop};
use prism_loops::ir::{CmpOp, Graph, LoopKind, Operator};
use prism_loops::opt::transform::{
    find_unswitchable, insert_pre_post_loops, is_unrollable_loop, partial_unroll, peel, unswitch,
};
use prism_loops::opt::{Canonicalizer, LoopsData, SimpleCanonicalizer, StaticProfile};

fn clean(graph: &mut Graph) {
    SimpleCanonicalizer::new().canonicalize(graph, &[]);
    graph.verify().expect("graph stays valid");
}

fn inputs(values: &[i64]) -> Vec<Vec<i64>> {
    values.iter().map(|&v| vec![v]).collect()
}

#[test]
fn test_value_after_loop_comes_from_post_loop() {
    init_logging();
    let original = sum_loop(0, CmpOp::Lt, 1);
    let mut g = original.clone();
    let data = LoopsData::compute(&g);
    let loops = insert_pre_post_loops(&mut g, &data.loops()[0]);
    g.verify().expect("split graph is valid");

    let ret = g.nodes_where(|op| matches!(op, Operator::Return))[0];
    let value = g.input(ret, 0);
    assert_eq!(g.op(value), &Operator::Proxy);
    let post_exit = g.loop_exits(loops.post)[0];
    assert_eq!(g.input(value, 0), post_exit);

    assert_same_effects(&original, &g, &inputs(&[-3, 0, 1, 2, 5, 17]), &[vec![0]]);
}

#[test]
fn test_split_then_unroll_twice() {
    init_logging();
    for (init, op, stride) in [(0, CmpOp::Lt, 1), (0, CmpOp::Le, 3), (40, CmpOp::Gt, -2)] {
        let original = sum_loop(init, op, stride);
        let mut g = original.clone();
        let data = LoopsData::compute(&g);
        let loops = insert_pre_post_loops(&mut g, &data.loops()[0]);
        clean(&mut g);

        for _ in 0..2 {
            let data = LoopsData::compute(&g);
            let main = data.loop_for(loops.main).expect("main loop survives");
            assert!(is_unrollable_loop(&g, main));
            partial_unroll(&mut g, main).expect("stride does not overflow");
            clean(&mut g);
        }
        let main = g.loop_info(loops.main).copied().unwrap_or_default();
        assert_eq!(main.kind, LoopKind::Main);
        assert_eq!(main.unroll_factor, 4);
        assert_same_effects(
            &original,
            &g,
            &inputs(&[-20, -1, 0, 1, 2, 3, 4, 5, 9, 13, 41, 64]),
            &[vec![0]],
        );
    }
}

#[test]
fn test_peel_then_unswitch_inner_loop() {
    init_logging();
    let original = nested_flag_loops();
    let mut g = original.clone();

    let data = LoopsData::compute(&g);
    let inner = data.inner_first()[0].begin();
    let touched = peel(&mut g, data.loop_for(inner).expect("inner loop"));
    SimpleCanonicalizer::new().canonicalize(&mut g, &touched);
    g.verify().expect("peeled graph is valid");

    let data = LoopsData::compute(&g);
    let lp = data.loop_for(inner).expect("inner loop survives peeling");
    let groups = find_unswitchable(&g, lp, &StaticProfile::new());
    assert_eq!(groups.len(), 1);
    let versions = unswitch(&mut g, lp, &groups[0]);
    assert_eq!(versions.len(), 2);
    clean(&mut g);

    let heap = [vec![0; 16]];
    for n in [0, 1, 5, 16] {
        for m in [0, 1, 3] {
            for flag in [-1, 0, 2] {
                let (a, b) = (run(&original, &[n, m, flag], &heap), run(&g, &[n, m, flag], &heap));
                assert!(a.same_effects(&b), "n = {n}, m = {m}, flag = {flag}");
            }
        }
    }
}
