//! Node sets of loops and their duplication.
//!
//! The *whole* fragment of a loop holds:
//!
//! - every fixed node of the loop's blocks (nested loops included)
//! - the loop's own exits, their proxies and their frame states
//! - every floating node that transitively reads one of the above,
//!   except through the proxies of the loop's own exits
//!
//! Floating nodes that read nothing inside the loop (constants,
//! parameters, invariant arithmetic) are not members; copies share them.

use rustc_hash::FxHashMap;

use crate::ir::{BitSet, ControlFlowGraph, Graph, NaturalLoop, NodeFlags, NodeId, Operator, ValueType};

/// Maps an original node to its copy.
pub type DuplicationMap = FxHashMap<NodeId, NodeId>;

/// A set of nodes, iterable in ascending order.
#[derive(Debug, Clone, Default)]
pub struct LoopFragment {
    members: BitSet,
    nodes: Vec<NodeId>,
}

impl LoopFragment {
    /// Fragment of the given nodes.
    pub fn from_nodes(nodes: impl IntoIterator<Item = NodeId>) -> Self {
        let mut members = BitSet::new();
        let mut list: Vec<NodeId> = nodes
            .into_iter()
            .filter(|id| members.insert(id.as_usize()))
            .collect();
        list.sort_unstable();
        LoopFragment {
            members,
            nodes: list,
        }
    }

    /// Whole fragment of `lp`.
    pub fn whole(graph: &Graph, cfg: &ControlFlowGraph, lp: &NaturalLoop) -> Self {
        let mut members = BitSet::with_capacity(graph.capacity());
        let mut worklist = Vec::new();
        for &block in &lp.blocks {
            for &node in &cfg.block(block).nodes {
                if members.insert(node.as_usize()) {
                    worklist.push(node);
                }
            }
        }
        // Own exits are boundary nodes: members, but not propagated from.
        for exit in graph.loop_exits(lp.begin) {
            members.insert(exit.as_usize());
            for proxy in graph.proxies(exit) {
                members.insert(proxy.as_usize());
            }
            if let Some(state) = graph.node(exit).state() {
                members.insert(state.as_usize());
            }
        }
        while let Some(id) = worklist.pop() {
            for user in graph.users(id) {
                if graph.op(user).is_floating() && members.insert(user.as_usize()) {
                    worklist.push(user);
                }
            }
        }
        let nodes = members.iter().map(|i| NodeId::new(i as u32)).collect();
        LoopFragment { members, nodes }
    }

    /// Whether `id` is a member.
    #[inline]
    pub fn contains(&self, id: NodeId) -> bool {
        self.members.contains(id.as_usize())
    }

    /// Members in ascending order.
    #[inline]
    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    /// Number of members.
    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether there are no members.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The members not selected by `excluded`.
    pub fn without(&self, excluded: impl Fn(NodeId) -> bool) -> Self {
        Self::from_nodes(self.nodes.iter().copied().filter(|&n| !excluded(n)))
    }

    /// Copy every member.
    ///
    /// Inputs of a copy resolve to `replacements`, then to copies, then to
    /// the original input. Successors pointing inside the fragment point at
    /// copies; successors leaving it stay unset. A merge copy gets a fresh,
    /// dangling `End` for each end input outside the fragment, recorded in
    /// the map under the original end. Copies carry
    /// [`NodeFlags::DUPLICATE`].
    pub fn duplicate(&self, graph: &mut Graph, replacements: &DuplicationMap) -> DuplicationMap {
        let mut map = DuplicationMap::default();
        map.reserve(self.nodes.len());
        for &id in &self.nodes {
            let node = graph.node(id);
            let (op, ty, bci, flags) = (node.op().clone(), node.ty(), node.bci(), node.flags());
            let copy = graph.add(op, &[], ty);
            graph.set_bci(copy, bci);
            graph.add_flags(copy, (flags - NodeFlags::DEAD) | NodeFlags::DUPLICATE);
            map.insert(id, copy);
        }
        for &id in &self.nodes {
            if !graph.op(id).is_merge() {
                continue;
            }
            for &end in graph.inputs(id).to_vec().iter() {
                if !self.contains(end) && !replacements.contains_key(&end) && !map.contains_key(&end) {
                    let fresh = graph.add(Operator::End, &[], ValueType::Void);
                    map.insert(end, fresh);
                }
            }
        }

        let resolve = |id: NodeId| {
            replacements
                .get(&id)
                .or_else(|| map.get(&id))
                .copied()
                .unwrap_or(id)
        };
        let mut edges = Vec::with_capacity(self.nodes.len());
        for &id in &self.nodes {
            let inputs: Vec<NodeId> = graph.inputs(id).iter().map(|&i| resolve(i)).collect();
            let state = graph.node(id).state().map(resolve);
            let successors: Vec<(usize, NodeId)> = graph
                .successors(id)
                .iter()
                .enumerate()
                .filter(|&(_, &s)| s.is_valid() && self.contains(s))
                .map(|(i, s)| (i, map[s]))
                .collect();
            edges.push((map[&id], inputs, state, successors));
        }
        for (copy, inputs, state, successors) in edges {
            for input in inputs {
                graph.push_input(copy, input);
            }
            graph.set_state(copy, state);
            for (index, succ) in successors {
                graph.set_successor(copy, index, succ);
            }
        }
        map
    }
}

/// Delete copies that ended up unused.
pub fn prune_unused_copies(graph: &mut Graph, map: &DuplicationMap) {
    let mut copies: Vec<NodeId> = map.values().copied().collect();
    copies.sort_unstable();
    for copy in copies {
        if graph.is_live(copy) && graph.is_collectable(copy) && !graph.has_usages(copy) {
            graph.kill_with_unused_inputs(copy);
        }
    }
}
