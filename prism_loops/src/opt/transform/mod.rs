//! Loop transformation primitives.
//!
//! Each primitive rewrites one loop and returns the nodes it created or
//! modified. None of them simplifies its result: constant exit tests of
//! copies, unreachable branches and single-input merges are left for the
//! [`Canonicalizer`](super::Canonicalizer).
//!
//! Preconditions are checked with `assert!`; calling a primitive on a loop
//! that does not satisfy them is a bug in the caller.

pub mod peel;
pub mod pre_post;
pub mod unroll;
pub mod unswitch;

pub use peel::peel;
pub use pre_post::{insert_pre_post_loops, PrePostLoops};
pub use unroll::{full_unroll, is_unrollable_loop, partial_unroll};
pub use unswitch::{find_unswitchable, unswitch};

use crate::ir::{Graph, NodeId, Operator, ValueType};

/// Join the original loop exit `exit` with the paths ending at `tails`
/// in a new merge placed in front of the exit's continuation.
///
/// `tails` are begin nodes whose `next` is unset. Every proxy of `exit`
/// becomes a phi over the proxy itself and `value_for(tail, proxy)` for
/// each tail; its users outside the exit's frame state read the phi.
/// Guards anchored at `exit` move to the merge.
pub(crate) fn merge_exit_paths(
    graph: &mut Graph,
    exit: NodeId,
    tails: &[NodeId],
    value_for: impl Fn(&Graph, usize, NodeId) -> NodeId,
    created: &mut Vec<NodeId>,
) -> NodeId {
    assert!(
        matches!(graph.op(exit), Operator::LoopExit),
        "{exit:?} is not a loop exit"
    );
    let continuation = graph.next(exit);
    if continuation.is_some() {
        graph.set_next(exit, NodeId::INVALID);
    }

    let mut ends = Vec::with_capacity(tails.len() + 1);
    for &tail in std::iter::once(&exit).chain(tails) {
        let end = graph.add(Operator::End, &[], ValueType::Void);
        graph.set_next(tail, end);
        ends.push(end);
    }
    let merge = graph.add(Operator::Merge, &ends, ValueType::Void);
    if let Some(c) = continuation {
        graph.set_next(merge, c);
    }
    created.extend(ends.iter().copied());
    created.push(merge);

    let state = graph.node(exit).state();
    for proxy in graph.proxies(exit) {
        let mut inputs = Vec::with_capacity(tails.len() + 2);
        inputs.push(merge);
        inputs.push(proxy);
        inputs.extend((0..tails.len()).map(|i| value_for(graph, i, proxy)));
        let phi = graph.add(Operator::Phi, &inputs, graph.ty(proxy));
        graph.replace_at_usages_where(proxy, phi, |u| u != phi && Some(u) != state);
        created.push(phi);
    }
    for guard in graph.anchored_guards(exit) {
        graph.set_input(guard, 1, merge);
        created.push(guard);
    }
    merge
}

/// Give `exit` a frame state of its own so that copies of the loop do not
/// share it with other nodes. Returns the replaced and the new state.
pub(crate) fn privatize_exit_state(graph: &mut Graph, exit: NodeId) -> Option<(NodeId, NodeId)> {
    let state = graph.node(exit).state()?;
    if graph.users(state).len() <= 1 {
        return None;
    }
    let private = graph.duplicate_state(state);
    graph.set_state(exit, Some(private));
    Some((state, private))
}

/// Move the code following `from` behind `to`.
pub(crate) fn take_over_next(graph: &mut Graph, from: NodeId, to: NodeId) {
    if let Some(next) = graph.next(from) {
        graph.set_next(from, NodeId::INVALID);
        graph.set_next(to, next);
    }
}

/// Move every floating guard anchored at `from` to `to`.
pub(crate) fn reanchor_guards(graph: &mut Graph, from: NodeId, to: NodeId) {
    for guard in graph.anchored_guards(from) {
        graph.set_input(guard, 1, to);
    }
}

/// Delete `node` and its frame state when nothing else reads the state.
pub(crate) fn kill_with_state(graph: &mut Graph, node: NodeId) {
    let state = graph.node(node).state();
    graph.kill(node);
    if let Some(state) = state {
        if graph.is_live(state) && !graph.has_usages(state) {
            graph.kill_with_unused_inputs(state);
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Differential checks shared by the primitive tests.

    use crate::ir::{Execution, Graph, Interpreter, Value};
    use crate::opt::{Canonicalizer, SimpleCanonicalizer};

    /// Run `graph` on one integer argument and fresh arrays.
    pub fn run(graph: &Graph, args: &[i64], heap: &[Vec<i64>]) -> Execution {
        let args: Vec<Value> = args
            .iter()
            .map(|&a| Value::Int(a))
            .chain((0..heap.len()).map(Value::Array))
            .collect();
        Interpreter::new(graph)
            .run(&args, heap.to_vec())
            .expect("interpretation succeeds")
    }

    /// Assert that `before` and `after` behave the same on every input.
    pub fn assert_equivalent(before: &Graph, after: &Graph, inputs: &[i64], heap: &[Vec<i64>]) {
        for &n in inputs {
            let a = run(before, &[n], heap);
            let b = run(after, &[n], heap);
            assert!(
                a.same_effects(&b),
                "input {n}: {:?} before, {:?} after",
                a.outcome,
                b.outcome
            );
        }
    }

    /// Canonicalize and verify.
    pub fn clean(graph: &mut Graph) {
        graph.verify().expect("graph valid before cleanup");
        SimpleCanonicalizer::new().canonicalize(graph, &[]);
        graph.verify().expect("graph valid after cleanup");
    }
}
