//! Loop peeling.
//!
//! Peeling copies the first iteration in front of the loop:
//!
//! ```text
//!   before:  P ─► F ─► LB ◄─ LE               after:  P ─► B ─► body' ─► F ─► LB ◄─ LE
//!                      │                                        │               │
//!                      └─► X ─► C                               └─► Bx ─┐       └─► X ─┐
//!                                                                       └──► MX ◄──────┘ ─► C
//! ```
//!
//! The copy reads the initial values of the loop's phis; the loop's phis
//! start from the values the copy computed. Each exit joins the matching
//! exit of the copy in a merge whose phis replace the exit's proxies.

use log::debug;
use rustc_hash::FxHashMap;

use super::{kill_with_state, merge_exit_paths, reanchor_guards, take_over_next};
use crate::ir::{Graph, NodeId, Operator, ValueType};
use crate::opt::loops::{DuplicationMap, LoopEx};

/// Peel one iteration off `lp`.
///
/// Works on any loop, counted or not. Returns the nodes created or
/// modified; the copied exit tests are left for canonicalization.
pub fn peel(graph: &mut Graph, lp: &LoopEx) -> Vec<NodeId> {
    let begin = lp.begin();
    let forward = graph.forward_end(begin);
    assert!(
        graph.predecessor(forward).is_some(),
        "loop {begin:?} has no entry"
    );
    let loop_ends = graph.loop_ends(begin).to_vec();
    assert!(!loop_ends.is_empty(), "loop {begin:?} has no back edge");
    let phis = graph.phis(begin);

    let map = lp.whole().duplicate(graph, &DuplicationMap::default());
    let mut created: Vec<NodeId> = map.values().copied().collect();
    let copy_begin = map[&begin];

    // Values of the phis after the peeled iteration, one per back edge.
    let back_values: Vec<Vec<NodeId>> = phis
        .iter()
        .map(|&phi| {
            (1..=loop_ends.len())
                .map(|i| {
                    let v = graph.phi_value(phi, i);
                    if graph.op(v) == &Operator::Phi && graph.input(v, 0) == begin {
                        graph.phi_value(v, 0)
                    } else {
                        map.get(&v).copied().unwrap_or(v)
                    }
                })
                .collect()
        })
        .collect();

    for &phi in &phis {
        let copy = map[&phi];
        let init = graph.phi_value(copy, 0);
        graph.replace_at_usages(copy, init);
        graph.kill(copy);
    }

    // Enter the copy instead of the loop.
    let entry = graph.add(Operator::Begin, &[], ValueType::Void);
    graph.replace_at_predecessor(forward, entry);
    take_over_next(graph, copy_begin, entry);
    reanchor_guards(graph, copy_begin, entry);
    created.push(entry);

    // Back edges of the copy enter the loop.
    let copy_ends: Vec<NodeId> = loop_ends.iter().map(|e| map[e]).collect();
    if let [copy_end] = copy_ends.as_slice() {
        graph.replace_at_predecessor(*copy_end, forward);
        for (&phi, values) in phis.iter().zip(&back_values) {
            graph.set_input(phi, 1, values[0]);
        }
    } else {
        let mut ends = Vec::with_capacity(copy_ends.len());
        for &copy_end in &copy_ends {
            let end = graph.add(Operator::End, &[], ValueType::Void);
            graph.replace_at_predecessor(copy_end, end);
            ends.push(end);
        }
        let merge = graph.add(Operator::Merge, &ends, ValueType::Void);
        graph.set_next(merge, forward);
        for (&phi, values) in phis.iter().zip(&back_values) {
            let mut inputs = Vec::with_capacity(values.len() + 1);
            inputs.push(merge);
            inputs.extend_from_slice(values);
            let entry_phi = graph.add(Operator::Phi, &inputs, graph.ty(phi));
            graph.set_input(phi, 1, entry_phi);
            created.push(entry_phi);
        }
        created.extend(ends);
        created.push(merge);
    }

    // Exits of the copy become plain begins joined with the loop's exits.
    for &exit in lp.exits() {
        let copy_exit = map[&exit];
        let mut exit_values = FxHashMap::default();
        for copy_proxy in graph.proxies(copy_exit) {
            let value = graph.input(copy_proxy, 1);
            graph.replace_at_usages(copy_proxy, value);
            graph.kill(copy_proxy);
            exit_values.insert(copy_proxy, value);
        }
        let tail = graph.add(Operator::Begin, &[], ValueType::Void);
        graph.replace_at_predecessor(copy_exit, tail);
        reanchor_guards(graph, copy_exit, tail);
        kill_with_state(graph, copy_exit);
        created.push(tail);

        merge_exit_paths(
            graph,
            exit,
            &[tail],
            |_, _, proxy| exit_values[&map[&proxy]],
            &mut created,
        );
    }

    kill_with_state(graph, copy_begin);
    graph.kill(map[&forward]);
    for copy_end in copy_ends {
        graph.kill(copy_end);
    }

    if let Some(info) = graph.loop_info_mut(begin) {
        info.peelings += 1;
        info.frequency = (info.frequency - 1.0).max(1.0);
    }
    debug!("peeled {begin:?}: {} nodes copied", map.len());

    created.push(begin);
    created.extend(phis);
    created.retain(|&n| graph.is_live(n));
    created
}
