//! Loop unswitching.
//!
//! A split inside the loop whose condition is loop-invariant is hoisted in
//! front of the loop. Each of its successors enters its own copy of the
//! loop in which the split is folded to that successor:
//!
//! ```text
//!                                           ┌─► S0 ─► F  ─► LB  (split → 0) ─► X  ─┐
//!   P ─► F ─► LB (split) ─► X ─► C   =>  P ─► H                                      ├─► MX ─► C
//!                                           └─► S1 ─► F' ─► LB' (split → 1) ─► X' ─┘
//! ```
//!
//! Splits testing the same condition the same way are unswitched together.

use log::debug;
use rustc_hash::FxHashMap;

use super::merge_exit_paths;
use crate::ir::{Graph, NodeId, Operator, ValueType};
use crate::opt::canonicalize::fold_split;
use crate::opt::loops::{DuplicationMap, LoopEx};
use crate::opt::profile::ProfilingInfo;

/// Groups of invariant splits of `lp` that can be unswitched, most
/// balanced first.
///
/// A split qualifies when its condition is computed outside the loop and
/// none of its successors leaves the loop. Within a group all splits test
/// the same condition and, for switches, the same keys.
pub fn find_unswitchable(graph: &Graph, lp: &LoopEx, profile: &dyn ProfilingInfo) -> Vec<Vec<NodeId>> {
    let mut groups: Vec<Vec<NodeId>> = Vec::new();
    let mut by_key: FxHashMap<(NodeId, Option<Vec<i64>>), usize> = FxHashMap::default();
    for &node in lp.whole().nodes() {
        let keys = match graph.op(node) {
            Operator::If { .. } => None,
            Operator::Switch(info) => Some(info.keys.clone()),
            _ => continue,
        };
        let condition = graph.input(node, 0);
        if !lp.is_invariant(condition) {
            continue;
        }
        let stays_inside = graph
            .successors(node)
            .iter()
            .all(|&s| graph.op(s) == &Operator::Begin);
        if !stays_inside {
            continue;
        }
        match by_key.get(&(condition, keys.clone())) {
            Some(&index) => groups[index].push(node),
            None => {
                by_key.insert((condition, keys), groups.len());
                groups.push(vec![node]);
            }
        }
    }
    groups.sort_by(|a, b| {
        let (ba, bb) = (balance(graph, a[0], profile), balance(graph, b[0], profile));
        bb.total_cmp(&ba).then(a[0].cmp(&b[0]))
    });
    groups
}

/// Probability of the least likely successor.
fn balance(graph: &Graph, split: NodeId, profile: &dyn ProfilingInfo) -> f64 {
    match graph.op(split) {
        Operator::If { true_probability } => {
            let p = profile
                .branch_probability(graph.node(split).bci())
                .unwrap_or(*true_probability);
            p.min(1.0 - p)
        }
        Operator::Switch(info) => info.probabilities.iter().copied().fold(1.0, f64::min),
        _ => 0.0,
    }
}

/// Unswitch `lp` on a group returned by [`find_unswitchable`].
///
/// Returns the loop begins of the versions, in successor order of the
/// split; the original loop is the first version. The folded splits leave
/// dead branches behind for canonicalization.
pub fn unswitch(graph: &mut Graph, lp: &LoopEx, splits: &[NodeId]) -> Vec<NodeId> {
    let Some(&first) = splits.first() else {
        panic!("unswitch of {:?} without splits", lp.begin());
    };
    let condition = graph.input(first, 0);
    assert!(
        splits.iter().all(|&s| graph.input(s, 0) == condition),
        "unswitched splits disagree on the condition"
    );
    let begin = lp.begin();
    let forward = graph.forward_end(begin);
    assert!(
        graph.predecessor(forward).is_some(),
        "loop {begin:?} has no entry"
    );

    let count = graph.successors(first).len();
    let copies: Vec<DuplicationMap> = (1..count)
        .map(|_| lp.whole().duplicate(graph, &DuplicationMap::default()))
        .collect();

    let hoisted = graph.add(graph.op(first).clone(), &[condition], ValueType::Void);
    graph.set_bci(hoisted, graph.node(first).bci());
    graph.replace_at_predecessor(forward, hoisted);
    for index in 0..count {
        let entry = graph.add(Operator::Begin, &[], ValueType::Void);
        graph.set_successor(hoisted, index, entry);
        let loop_entry = match index {
            0 => forward,
            _ => copies[index - 1][&forward],
        };
        graph.set_next(entry, loop_entry);
    }

    let mut created = Vec::new();
    for &exit in lp.exits() {
        let tails: Vec<NodeId> = copies.iter().map(|map| map[&exit]).collect();
        merge_exit_paths(
            graph,
            exit,
            &tails,
            |_, copy, proxy| copies[copy][&proxy],
            &mut created,
        );
    }

    for &split in splits {
        for version in 0..count {
            let node = match version {
                0 => split,
                _ => copies[version - 1][&split],
            };
            fold_split(graph, node, version);
        }
    }

    let versions: Vec<NodeId> = std::iter::once(begin)
        .chain(copies.iter().map(|map| map[&begin]))
        .collect();
    for &version in &versions {
        if let Some(info) = graph.loop_info_mut(version) {
            info.unswitches += 1;
        }
    }
    debug!("unswitched {begin:?} on {condition:?} into {} versions", versions.len());
    versions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{CmpOp, ControlBuilder, Execution, GraphBuilder, Interpreter, Value};
    use crate::opt::loops::LoopsData;
    use crate::opt::profile::StaticProfile;
    use crate::opt::{Canonicalizer, SimpleCanonicalizer};

    fn exec(graph: &Graph, n: i64, flag: i64) -> Execution {
        Interpreter::new(graph)
            .run(&[Value::Int(n), Value::Int(flag), Value::Array(0)], vec![vec![0; 16]])
            .unwrap()
    }

    /// `for i in 0..n { if flag > 0 { a[i] = i } else { a[i] = -i } }`,
    /// with a second test of the same flag at the end of the body.
    fn flag_loop() -> Graph {
        let mut b = GraphBuilder::new(0);
        let n = b.parameter_in(ValueType::Int32, 0, 16);
        let flag = b.parameter(ValueType::Int32);
        let arr = b.parameter(ValueType::Array);
        let zero = b.int(0);
        let one = b.int(1);
        let positive = b.compare(CmpOp::Gt, flag, zero);
        let mut lp = b.begin_loop(&[zero, zero], 10.0);
        let (i, acc) = (lp.phi(0), lp.phi(1));
        let c = b.compare(CmpOp::Lt, i, n);
        b.exit_unless(&mut lp, c);
        b.set_bci(5);
        let mut br = b.begin_if(positive, 0.9);
        b.store(arr, i, i);
        b.begin_else(&mut br);
        let neg = b.sub(zero, i);
        b.store(arr, i, neg);
        b.end_if(br, &[]);
        b.set_bci(9);
        let br = b.begin_if(positive, 0.9);
        let plus = b.add(acc, one);
        let minus = b.sub(acc, one);
        let acc1 = b.end_if(br, &[(plus, minus)]);
        let i1 = b.add(i, one);
        let after = b.end_loop(lp, &[i1, acc1[0]], &[acc]);
        b.return_value(Some(after[0]));
        b.finish()
    }

    #[test]
    fn test_find_groups_same_condition() {
        let g = flag_loop();
        let data = LoopsData::compute(&g);
        let lp = &data.loops()[0];
        let groups = find_unswitchable(&g, lp, &StaticProfile::new());
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].len(), 2);
        // The exit test depends on the counter and is never a candidate.
        let exit_test = g.next(lp.begin()).unwrap();
        assert!(!groups[0].contains(&exit_test));
    }

    #[test]
    fn test_unswitch_preserves_semantics() {
        let original = flag_loop();
        let mut g = original.clone();
        let data = LoopsData::compute(&g);
        let lp = &data.loops()[0];
        let group = find_unswitchable(&g, lp, &StaticProfile::new()).remove(0);
        let versions = unswitch(&mut g, lp, &group);
        assert_eq!(versions.len(), 2);
        SimpleCanonicalizer::new().canonicalize(&mut g, &[]);
        assert_eq!(g.verify(), Ok(()));

        assert_eq!(g.loop_begins().len(), 2);
        for &v in &versions {
            assert_eq!(g.loop_info(v).map(|i| i.unswitches), Some(1));
        }
        for n in [0, 1, 5, 16] {
            for flag in [-3, 0, 4] {
                assert!(exec(&original, n, flag).same_effects(&exec(&g, n, flag)));
            }
        }

        // No copy tests the flag any more: the only If left outside the
        // loops is the hoisted one.
        let data = LoopsData::compute(&g);
        for lp in data.loops() {
            assert!(find_unswitchable(&g, lp, &StaticProfile::new()).is_empty());
        }
    }

    #[test]
    fn test_unswitch_switch() {
        let mut b = GraphBuilder::new(0);
        let n = b.parameter_in(ValueType::Int32, 0, 16);
        let mode = b.parameter(ValueType::Int32);
        let arr = b.parameter(ValueType::Array);
        let zero = b.int(0);
        let one = b.int(1);
        let mut lp = b.begin_loop(&[zero], 10.0);
        let i = lp.phi(0);
        let c = b.compare(CmpOp::Lt, i, n);
        b.exit_unless(&mut lp, c);
        let arms = b.switch(mode, &[1, 2], &[0.3, 0.3, 0.4]);
        let mut ends = Vec::new();
        for (k, &arm) in arms.iter().enumerate() {
            b.position_at(arm);
            let v = b.int(10 * (k as i64 + 1));
            b.store(arr, i, v);
            ends.extend(b.close_with_end());
        }
        b.merge(&ends, &[]);
        let i1 = b.add(i, one);
        b.end_loop(lp, &[i1], &[]);
        b.return_value(None);
        let original = b.finish();

        let mut g = original.clone();
        let data = LoopsData::compute(&g);
        let lp = &data.loops()[0];
        let groups = find_unswitchable(&g, lp, &StaticProfile::new());
        assert_eq!(groups.len(), 1);
        let versions = unswitch(&mut g, lp, &groups[0]);
        assert_eq!(versions.len(), 3);
        SimpleCanonicalizer::new().canonicalize(&mut g, &[]);
        assert_eq!(g.verify(), Ok(()));
        for n in [0, 3] {
            for mode in [0, 1, 2, 7] {
                assert!(exec(&original, n, mode).same_effects(&exec(&g, n, mode)));
            }
        }
    }

    #[test]
    fn test_profile_orders_candidates() {
        let mut b = GraphBuilder::new(0);
        let n = b.parameter_in(ValueType::Int32, 0, 16);
        let flag = b.parameter(ValueType::Int32);
        let arr = b.parameter(ValueType::Array);
        let zero = b.int(0);
        let one = b.int(1);
        let positive = b.compare(CmpOp::Gt, flag, zero);
        let big = b.compare(CmpOp::Gt, flag, one);
        let mut lp = b.begin_loop(&[zero], 10.0);
        let i = lp.phi(0);
        let c = b.compare(CmpOp::Lt, i, n);
        b.exit_unless(&mut lp, c);
        b.set_bci(3);
        let br = b.begin_if(positive, 0.5);
        b.store(arr, i, one);
        b.end_if(br, &[]);
        b.set_bci(4);
        let br = b.begin_if(big, 0.5);
        b.store(arr, i, zero);
        b.end_if(br, &[]);
        let i1 = b.add(i, one);
        b.end_loop(lp, &[i1], &[]);
        b.return_value(None);
        let g = b.finish();

        let data = LoopsData::compute(&g);
        let lp = &data.loops()[0];
        let skewed_first = StaticProfile::new().with_branch(3, 0.99).with_branch(4, 0.4);
        let groups = find_unswitchable(&g, lp, &skewed_first);
        assert_eq!(groups.len(), 2);
        assert_eq!(g.input(groups[0][0], 0), big);

        let skewed_second = StaticProfile::new().with_branch(3, 0.5).with_branch(4, 0.01);
        let groups = find_unswitchable(&g, lp, &skewed_second);
        assert_eq!(g.input(groups[0][0], 0), positive);
    }
}
