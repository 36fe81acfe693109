//! The mutable IR graph.
//!
//! The graph owns every node and is the only place edges change. Each
//! mutation entry point updates the usage index and the
//! predecessor/successor pairing together, so callers never patch reverse
//! edges by hand.
//!
//! # Invariants
//!
//! - `b ∈ uses(a)` exactly as many times as `a` appears among the inputs
//!   and state slot of `b`
//! - `predecessor(s) == Some(n)` iff `s ∈ successors(n)`
//! - phi inputs are `[merge, v0, .., vk]` with one value per merge input
//! - a `LoopBegin` has exactly one forward end at input 0
//!
//! [`Graph::verify`](super::verify) checks all of these.

use std::fmt;
use std::sync::Arc;

use rustc_hash::FxHashMap;

use super::arena::{Arena, SecondaryMap};
use super::deopt::MethodId;
use super::node::{Node, NodeFlags, NodeId};
use super::operators::{ArithOp, CmpOp, FrameStateInfo, LogicOp, LoopInfo, Operator};
use super::stamp::IntegerStamp;
use super::types::ValueType;
use crate::speculation::SpeculationLog;

/// Declared type and range of a method parameter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParameterInfo {
    /// Node standing for the parameter.
    pub node: NodeId,
    /// Declared type.
    pub ty: ValueType,
    /// Known range for integer parameters.
    pub stamp: Option<IntegerStamp>,
}

// =============================================================================
// Graph
// =============================================================================

/// A method's IR graph.
#[derive(Clone)]
pub struct Graph {
    nodes: Arena<Node>,
    uses: SecondaryMap<Node, Vec<NodeId>>,
    start: NodeId,
    method: MethodId,
    parameters: Vec<ParameterInfo>,
    speculation_log: Option<Arc<SpeculationLog>>,
    live: usize,
    int_constants: FxHashMap<(i64, ValueType), NodeId>,
    bool_constants: [Option<NodeId>; 2],
}

impl Graph {
    /// Create a graph holding only its start node.
    pub fn new(method: MethodId) -> Self {
        let mut graph = Graph {
            nodes: Arena::with_capacity(128),
            uses: SecondaryMap::new(),
            start: NodeId::INVALID,
            method,
            parameters: Vec::new(),
            speculation_log: None,
            live: 0,
            int_constants: FxHashMap::default(),
            bool_constants: [None; 2],
        };
        graph.start = graph.add(Operator::Start, &[], ValueType::Void);
        graph
    }

    /// Attach the speculation log shared by compilations of this method.
    pub fn with_speculation_log(mut self, log: Arc<SpeculationLog>) -> Self {
        self.speculation_log = Some(log);
        self
    }

    /// Replace the speculation log handle.
    pub fn set_speculation_log(&mut self, log: Option<Arc<SpeculationLog>>) {
        self.speculation_log = log;
    }

    /// Speculation log, if speculation is enabled for this compilation.
    pub fn speculation_log(&self) -> Option<&Arc<SpeculationLog>> {
        self.speculation_log.as_ref()
    }

    /// Method the graph belongs to.
    #[inline]
    pub fn method(&self) -> MethodId {
        self.method
    }

    /// Entry node.
    #[inline]
    pub fn start(&self) -> NodeId {
        self.start
    }

    // =========================================================================
    // Node Access
    // =========================================================================

    /// Node by handle.
    #[inline]
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    /// Operator of a node.
    #[inline]
    pub fn op(&self, id: NodeId) -> &Operator {
        &self.nodes[id].op
    }

    /// Mutable operator payload.
    ///
    /// Only payload fields may change; the operator kind and the number
    /// of successor slots must stay as they are.
    #[inline]
    pub fn op_mut(&mut self, id: NodeId) -> &mut Operator {
        &mut self.nodes[id].op
    }

    /// Result type of a node.
    #[inline]
    pub fn ty(&self, id: NodeId) -> ValueType {
        self.nodes[id].ty
    }

    /// Input `index` of `id`.
    #[inline]
    pub fn input(&self, id: NodeId, index: usize) -> NodeId {
        self.nodes[id].inputs[index]
    }

    /// Inputs of `id`.
    #[inline]
    pub fn inputs(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id].inputs
    }

    /// Whether `id` addresses a node that is not deleted.
    #[inline]
    pub fn is_live(&self, id: NodeId) -> bool {
        id.is_valid() && self.nodes.get(id).is_some_and(|n| !n.is_dead())
    }

    /// Number of slots ever allocated.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.nodes.len()
    }

    /// Number of live nodes; the size measure budgets are based on.
    #[inline]
    pub fn live_count(&self) -> usize {
        self.live
    }

    /// Watermark for [`Graph::nodes_since`].
    #[inline]
    pub fn mark(&self) -> NodeId {
        self.nodes.next_id()
    }

    /// Live nodes created after `mark` was taken.
    pub fn nodes_since(&self, mark: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        (mark.index()..self.nodes.len() as u32)
            .map(NodeId::new)
            .filter(move |&id| self.is_live(id))
    }

    /// All live nodes in creation order.
    pub fn live_nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes
            .iter()
            .filter(|(_, n)| !n.is_dead())
            .map(|(id, _)| id)
    }

    /// Set the bytecode index of a node.
    pub fn set_bci(&mut self, id: NodeId, bci: u32) {
        self.nodes[id].bci = bci;
    }

    /// Add marks to a node.
    pub fn add_flags(&mut self, id: NodeId, flags: NodeFlags) {
        self.nodes[id].flags |= flags;
    }

    // =========================================================================
    // Node Creation
    // =========================================================================

    /// Create a node. Successor slots start unset.
    pub fn add(&mut self, op: Operator, inputs: &[NodeId], ty: ValueType) -> NodeId {
        let id = self.nodes.alloc(Node::new(op, inputs, ty));
        self.uses.grow(self.nodes.len());
        for &input in inputs {
            self.add_use(input, id);
        }
        self.live += 1;
        id
    }

    /// Create a parameter node with an optional known range.
    pub fn add_parameter(&mut self, ty: ValueType, stamp: Option<IntegerStamp>) -> NodeId {
        let index = self.parameters.len() as u16;
        let node = self.add(Operator::Parameter(index), &[], ty);
        self.parameters.push(ParameterInfo { node, ty, stamp });
        node
    }

    /// Declared parameters in order.
    pub fn parameters(&self) -> &[ParameterInfo] {
        &self.parameters
    }

    /// Integer constant, shared per value and type while alive.
    pub fn const_int(&mut self, value: i64, ty: ValueType) -> NodeId {
        let value = ty.wrap(value);
        if let Some(&id) = self.int_constants.get(&(value, ty)) {
            if self.is_live(id) {
                return id;
            }
        }
        let id = self.add(Operator::ConstInt(value), &[], ty);
        self.int_constants.insert((value, ty), id);
        id
    }

    /// Boolean constant, shared while alive.
    pub fn const_bool(&mut self, value: bool) -> NodeId {
        let slot = value as usize;
        if let Some(id) = self.bool_constants[slot] {
            if self.is_live(id) {
                return id;
            }
        }
        let id = self.add(Operator::ConstBool(value), &[], ValueType::Bool);
        self.bool_constants[slot] = Some(id);
        id
    }

    /// Binary arithmetic of type `ty`.
    pub fn arith(&mut self, op: ArithOp, a: NodeId, b: NodeId, ty: ValueType) -> NodeId {
        self.add(Operator::IntOp(op), &[a, b], ty)
    }

    /// Integer comparison.
    pub fn compare(&mut self, op: CmpOp, a: NodeId, b: NodeId) -> NodeId {
        self.add(Operator::IntCmp(op), &[a, b], ValueType::Bool)
    }

    /// Boolean combination.
    pub fn logic(&mut self, op: LogicOp, a: NodeId, b: NodeId) -> NodeId {
        self.add(Operator::Logic(op), &[a, b], ValueType::Bool)
    }

    /// Boolean negation.
    pub fn not(&mut self, value: NodeId) -> NodeId {
        self.add(Operator::Not, &[value], ValueType::Bool)
    }

    /// Widen to 64 bits; 64-bit values are returned unchanged.
    pub fn sign_extend(&mut self, value: NodeId) -> NodeId {
        if self.ty(value) == ValueType::Int64 {
            return value;
        }
        if let Some(c) = self.node(value).as_int() {
            return self.const_int(c, ValueType::Int64);
        }
        self.add(Operator::SignExtend, &[value], ValueType::Int64)
    }

    /// Frame state with the given values and outer frame.
    pub fn frame_state(
        &mut self,
        info: FrameStateInfo,
        values: &[NodeId],
        outer: Option<NodeId>,
    ) -> NodeId {
        let id = self.add(Operator::FrameState(info), values, ValueType::State);
        self.nodes[id].bci = info.bci;
        self.set_state(id, outer);
        id
    }

    /// Copy of a frame state sharing its values and outer frame.
    pub fn duplicate_state(&mut self, state: NodeId) -> NodeId {
        let node = self.nodes[state].clone();
        let id = self.add(node.op, &node.inputs, node.ty);
        self.nodes[id].bci = node.bci;
        self.set_state(id, node.state);
        id
    }

    // =========================================================================
    // Usages
    // =========================================================================

    /// Nodes reading `id` through an input or the state slot.
    ///
    /// A user appears once per edge.
    #[inline]
    pub fn uses(&self, id: NodeId) -> &[NodeId] {
        self.uses.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Whether anything reads `id`.
    #[inline]
    pub fn has_usages(&self, id: NodeId) -> bool {
        !self.uses(id).is_empty()
    }

    /// Distinct users of `id` in ascending order.
    pub fn users(&self, id: NodeId) -> Vec<NodeId> {
        let mut users = self.uses(id).to_vec();
        users.sort_unstable();
        users.dedup();
        users
    }

    fn add_use(&mut self, def: NodeId, user: NodeId) {
        self.uses.entry(def).push(user);
    }

    fn remove_use(&mut self, def: NodeId, user: NodeId) {
        let uses = self.uses.entry(def);
        if let Some(pos) = uses.iter().position(|&u| u == user) {
            uses.swap_remove(pos);
        }
    }

    // =========================================================================
    // Data Edges
    // =========================================================================

    /// Replace input `index` of `node`.
    pub fn set_input(&mut self, node: NodeId, index: usize, value: NodeId) {
        let old = self.nodes[node].inputs[index];
        if old == value {
            return;
        }
        self.remove_use(old, node);
        self.nodes[node].inputs[index] = value;
        self.add_use(value, node);
    }

    /// Append an input.
    pub fn push_input(&mut self, node: NodeId, value: NodeId) {
        self.nodes[node].inputs.push(value);
        self.add_use(value, node);
    }

    /// Remove input `index`, shifting later inputs down.
    pub fn remove_input(&mut self, node: NodeId, index: usize) {
        let old = self.nodes[node].inputs.remove(index);
        self.remove_use(old, node);
    }

    /// Set or clear the state slot.
    pub fn set_state(&mut self, node: NodeId, state: Option<NodeId>) {
        let old = self.nodes[node].state;
        if old == state {
            return;
        }
        if let Some(old) = old {
            self.remove_use(old, node);
        }
        self.nodes[node].state = state;
        if let Some(new) = state {
            self.add_use(new, node);
        }
    }

    /// Redirect every reader of `old` to `new`.
    pub fn replace_at_usages(&mut self, old: NodeId, new: NodeId) {
        self.replace_at_usages_where(old, new, |_| true);
    }

    /// Redirect the readers of `old` selected by `filter` to `new`.
    pub fn replace_at_usages_where(
        &mut self,
        old: NodeId,
        new: NodeId,
        filter: impl Fn(NodeId) -> bool,
    ) {
        debug_assert_ne!(old, new, "replacing a node by itself");
        for user in self.users(old) {
            if !filter(user) {
                continue;
            }
            let count = self.nodes[user].inputs.len();
            for i in 0..count {
                if self.nodes[user].inputs[i] == old {
                    self.set_input(user, i, new);
                }
            }
            if self.nodes[user].state == Some(old) {
                self.set_state(user, Some(new));
            }
        }
    }

    // =========================================================================
    // Control Edges
    // =========================================================================

    /// Successor slots of a fixed node.
    #[inline]
    pub fn successors(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id].successors
    }

    /// Successor in slot `index`, if set.
    #[inline]
    pub fn successor(&self, id: NodeId, index: usize) -> Option<NodeId> {
        self.nodes[id]
            .successors
            .get(index)
            .copied()
            .filter(|s| s.is_valid())
    }

    /// `next` of a straight-line fixed node.
    #[inline]
    pub fn next(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id].next()
    }

    /// Control predecessor.
    #[inline]
    pub fn predecessor(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id].predecessor
    }

    /// Point successor slot `index` of `node` at `succ` (or clear it with
    /// [`NodeId::INVALID`]).
    ///
    /// `succ` must not already have a predecessor.
    pub fn set_successor(&mut self, node: NodeId, index: usize, succ: NodeId) {
        let old = self.nodes[node].successors[index];
        if old == succ {
            return;
        }
        if old.is_valid() && self.nodes[old].predecessor == Some(node) {
            self.nodes[old].predecessor = None;
        }
        if succ.is_valid() {
            debug_assert!(
                self.nodes[succ].predecessor.is_none(),
                "{:?} already has predecessor {:?}",
                succ,
                self.nodes[succ].predecessor
            );
            self.nodes[succ].predecessor = Some(node);
        }
        self.nodes[node].successors[index] = succ;
    }

    /// Set `next` of a straight-line fixed node.
    pub fn set_next(&mut self, node: NodeId, succ: NodeId) {
        debug_assert!(self.op(node).has_next(), "{:?} has no next slot", node);
        self.set_successor(node, 0, succ);
    }

    /// Index of `succ` among the successors of `node`.
    pub fn successor_index(&self, node: NodeId, succ: NodeId) -> Option<usize> {
        self.nodes[node].successors.iter().position(|&s| s == succ)
    }

    /// Make `new` take the control position of `old` under its predecessor.
    ///
    /// `old` is left without a predecessor.
    pub fn replace_at_predecessor(&mut self, old: NodeId, new: NodeId) {
        if let Some(pred) = self.nodes[old].predecessor {
            if let Some(index) = self.successor_index(pred, old) {
                self.set_successor(pred, index, NodeId::INVALID);
                if self.predecessor(new).is_some() {
                    self.detach_from_predecessor(new);
                }
                self.set_successor(pred, index, new);
            }
        }
    }

    /// Clear the slot pointing at `node` in its predecessor.
    pub fn detach_from_predecessor(&mut self, node: NodeId) {
        if let Some(pred) = self.nodes[node].predecessor {
            if let Some(index) = self.successor_index(pred, node) {
                self.set_successor(pred, index, NodeId::INVALID);
            }
        }
    }

    /// Insert the detached straight-line node `node` right before `at`.
    pub fn insert_before(&mut self, at: NodeId, node: NodeId) {
        debug_assert!(self.op(node).has_next());
        self.replace_at_predecessor(at, node);
        self.set_next(node, at);
    }

    /// Unlink a straight-line fixed node, connecting its predecessor to its
    /// `next`, and delete it. Usages must already be gone.
    pub fn remove_fixed(&mut self, node: NodeId) {
        let next = self.next(node);
        if let Some(next) = next {
            self.set_next(node, NodeId::INVALID);
            self.replace_at_predecessor(node, next);
        }
        self.kill(node);
    }

    // =========================================================================
    // Deletion
    // =========================================================================

    /// Delete a node and drop all its edges.
    ///
    /// Users of `id` keep pointing at it; callers redirect or delete them.
    pub fn kill(&mut self, id: NodeId) {
        if self.nodes[id].is_dead() {
            return;
        }
        let inputs: Vec<NodeId> = self.nodes[id].all_inputs().collect();
        for input in inputs {
            self.remove_use(input, id);
        }
        self.nodes[id].inputs.clear();
        self.nodes[id].state = None;

        self.detach_from_predecessor(id);
        let successors = self.nodes[id].successors.clone();
        for succ in successors.into_iter().filter(|s| s.is_valid()) {
            if self.nodes[succ].predecessor == Some(id) {
                self.nodes[succ].predecessor = None;
            }
        }
        self.nodes[id].successors.iter_mut().for_each(|s| *s = NodeId::INVALID);

        self.nodes[id].flags |= NodeFlags::DEAD;
        self.live -= 1;
    }

    /// Delete a node, then every floating input left without readers.
    pub fn kill_with_unused_inputs(&mut self, id: NodeId) {
        let mut inputs: Vec<NodeId> = self.nodes[id].all_inputs().collect();
        self.kill(id);
        while let Some(input) = inputs.pop() {
            if self.is_live(input) && self.is_collectable(input) && !self.has_usages(input) {
                inputs.extend(self.nodes[input].all_inputs());
                self.kill(input);
            }
        }
    }

    /// Floating nodes that may be deleted once nothing reads them.
    pub fn is_collectable(&self, id: NodeId) -> bool {
        let op = self.op(id);
        op.is_floating() && !matches!(op, Operator::Guard { .. } | Operator::Parameter(_))
    }

    // =========================================================================
    // Structural Queries
    // =========================================================================

    /// Begin node of the block containing fixed node `id`.
    pub fn block_begin(&self, mut id: NodeId) -> NodeId {
        while !self.op(id).is_begin() {
            match self.predecessor(id) {
                Some(pred) => id = pred,
                None => break,
            }
        }
        id
    }

    /// Merge or loop begin an end node flows into.
    pub fn merge_of(&self, end: NodeId) -> Option<NodeId> {
        self.uses(end)
            .iter()
            .copied()
            .find(|&u| self.op(u).is_merge() && self.inputs(u).contains(&end))
    }

    /// Position of `end` among the inputs of `merge`.
    pub fn end_index(&self, merge: NodeId, end: NodeId) -> Option<usize> {
        self.inputs(merge).iter().position(|&e| e == end)
    }

    /// Phis attached to a merge or loop begin, ascending.
    pub fn phis(&self, merge: NodeId) -> Vec<NodeId> {
        self.users(merge)
            .into_iter()
            .filter(|&u| matches!(self.op(u), Operator::Phi) && self.input(u, 0) == merge)
            .collect()
    }

    /// Value of `phi` along merge input `index`.
    #[inline]
    pub fn phi_value(&self, phi: NodeId, index: usize) -> NodeId {
        self.input(phi, index + 1)
    }

    /// Proxies attached to a loop exit, ascending.
    pub fn proxies(&self, exit: NodeId) -> Vec<NodeId> {
        self.users(exit)
            .into_iter()
            .filter(|&u| matches!(self.op(u), Operator::Proxy) && self.input(u, 0) == exit)
            .collect()
    }

    /// Floating guards anchored at a begin node, ascending.
    pub fn anchored_guards(&self, begin: NodeId) -> Vec<NodeId> {
        self.users(begin)
            .into_iter()
            .filter(|&u| matches!(self.op(u), Operator::Guard { .. }) && self.input(u, 1) == begin)
            .collect()
    }

    /// Forward end of a loop begin.
    #[inline]
    pub fn forward_end(&self, loop_begin: NodeId) -> NodeId {
        self.input(loop_begin, 0)
    }

    /// Back edges of a loop begin.
    #[inline]
    pub fn loop_ends(&self, loop_begin: NodeId) -> &[NodeId] {
        &self.inputs(loop_begin)[1..]
    }

    /// Exits of a loop begin, ascending.
    pub fn loop_exits(&self, loop_begin: NodeId) -> Vec<NodeId> {
        self.users(loop_begin)
            .into_iter()
            .filter(|&u| matches!(self.op(u), Operator::LoopExit))
            .collect()
    }

    /// Loop metadata of a loop begin.
    pub fn loop_info(&self, loop_begin: NodeId) -> Option<&LoopInfo> {
        match self.op(loop_begin) {
            Operator::LoopBegin(info) => Some(info),
            _ => None,
        }
    }

    /// Mutable loop metadata.
    pub fn loop_info_mut(&mut self, loop_begin: NodeId) -> Option<&mut LoopInfo> {
        match self.op_mut(loop_begin) {
            Operator::LoopBegin(info) => Some(info),
            _ => None,
        }
    }

    /// Live loop begins, ascending.
    pub fn loop_begins(&self) -> Vec<NodeId> {
        self.live_nodes()
            .filter(|&id| matches!(self.op(id), Operator::LoopBegin(_)))
            .collect()
    }

    /// Live nodes matching `pred`, ascending.
    pub fn nodes_where(&self, pred: impl Fn(&Operator) -> bool) -> Vec<NodeId> {
        self.live_nodes().filter(|&id| pred(self.op(id))).collect()
    }

    // =========================================================================
    // Merge Maintenance
    // =========================================================================

    /// Append `end` to `merge`, extending each phi with the value chosen by
    /// `value_for`.
    pub fn add_end(
        &mut self,
        merge: NodeId,
        end: NodeId,
        value_for: impl Fn(&Graph, NodeId) -> NodeId,
    ) {
        let extensions: Vec<(NodeId, NodeId)> = self
            .phis(merge)
            .into_iter()
            .map(|phi| (phi, value_for(self, phi)))
            .collect();
        self.push_input(merge, end);
        for (phi, value) in extensions {
            self.push_input(phi, value);
        }
    }

    /// Remove merge input `index` and the matching phi values.
    ///
    /// The end node itself is left alone.
    pub fn remove_end_at(&mut self, merge: NodeId, index: usize) {
        for phi in self.phis(merge) {
            self.remove_input(phi, index + 1);
        }
        self.remove_input(merge, index);
    }

    /// Set the safepoint flag of every back edge of a loop.
    pub fn disable_safepoints(&mut self, loop_begin: NodeId) {
        let ends = self.loop_ends(loop_begin).to_vec();
        for end in ends {
            if let Operator::LoopEnd { safepoint } = self.op_mut(end) {
                *safepoint = false;
            }
        }
    }
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Graph {} ({} live nodes):", self.method, self.live)?;
        for id in self.live_nodes() {
            let node = self.node(id);
            write!(f, "  {:?} {}", id, node.op.name())?;
            match &node.op {
                Operator::ConstInt(v) => write!(f, " {}", v)?,
                Operator::ConstBool(v) => write!(f, " {}", v)?,
                Operator::IntOp(op) => write!(f, " {}", op.symbol())?,
                Operator::IntCmp(op) => write!(f, " {}", op.symbol())?,
                _ => {}
            }
            write!(f, " : {} {:?}", node.ty, node.inputs.as_slice())?;
            if let Some(state) = node.state {
                write!(f, " state={:?}", state)?;
            }
            if !node.successors.is_empty() {
                write!(f, " -> {:?}", node.successors.as_slice())?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph() -> Graph {
        Graph::new(MethodId(1))
    }

    #[test]
    fn test_new_graph_has_start() {
        let g = graph();
        assert_eq!(g.op(g.start()), &Operator::Start);
        assert_eq!(g.live_count(), 1);
        assert_eq!(g.successors(g.start()).len(), 1);
    }

    #[test]
    fn test_constants_are_shared() {
        let mut g = graph();
        let a = g.const_int(5, ValueType::Int32);
        let b = g.const_int(5, ValueType::Int32);
        let c = g.const_int(5, ValueType::Int64);
        assert_eq!(a, b);
        assert_ne!(a, c);
        g.kill(a);
        let d = g.const_int(5, ValueType::Int32);
        assert_ne!(a, d);
    }

    #[test]
    fn test_usages_track_inputs() {
        let mut g = graph();
        let x = g.add_parameter(ValueType::Int32, None);
        let one = g.const_int(1, ValueType::Int32);
        let add = g.arith(ArithOp::Add, x, x, ValueType::Int32);
        assert_eq!(g.uses(x), &[add, add]);

        g.set_input(add, 1, one);
        assert_eq!(g.uses(x), &[add]);
        assert_eq!(g.uses(one), &[add]);

        let two = g.const_int(2, ValueType::Int32);
        g.replace_at_usages(one, two);
        assert!(!g.has_usages(one));
        assert_eq!(g.inputs(add), &[x, two]);
    }

    #[test]
    fn test_state_slot_is_a_usage() {
        let mut g = graph();
        let x = g.add_parameter(ValueType::Int32, None);
        let info = FrameStateInfo {
            bci: 3,
            locals: 1,
            stack: 0,
            locks: 0,
        };
        let fs = g.frame_state(info, &[x], None);
        let begin = g.add(Operator::Begin, &[], ValueType::Void);
        g.set_state(begin, Some(fs));
        assert_eq!(g.uses(fs), &[begin]);

        let copy = g.duplicate_state(fs);
        g.replace_at_usages(fs, copy);
        assert_eq!(g.node(begin).state(), Some(copy));
        assert_eq!(g.uses(x).len(), 2);
    }

    #[test]
    fn test_control_edges() {
        let mut g = graph();
        let a = g.add(Operator::Begin, &[], ValueType::Void);
        let ret = g.add(Operator::Return, &[], ValueType::Void);
        g.set_next(g.start(), a);
        g.set_next(a, ret);
        assert_eq!(g.predecessor(ret), Some(a));

        let b = g.add(Operator::Begin, &[], ValueType::Void);
        g.insert_before(ret, b);
        assert_eq!(g.next(a), Some(b));
        assert_eq!(g.next(b), Some(ret));

        g.remove_fixed(b);
        assert_eq!(g.next(a), Some(ret));
        assert_eq!(g.predecessor(ret), Some(a));
        assert!(!g.is_live(b));
    }

    #[test]
    fn test_kill_with_unused_inputs() {
        let mut g = graph();
        let x = g.add_parameter(ValueType::Int32, None);
        let one = g.const_int(1, ValueType::Int32);
        let add = g.arith(ArithOp::Add, x, one, ValueType::Int32);
        let cmp = g.compare(CmpOp::Lt, add, x);
        g.kill_with_unused_inputs(cmp);
        assert!(!g.is_live(add));
        assert!(!g.is_live(one));
        assert!(g.is_live(x));
    }

    #[test]
    fn test_merge_ends_and_phis() {
        let mut g = graph();
        let e1 = g.add(Operator::End, &[], ValueType::Void);
        let e2 = g.add(Operator::End, &[], ValueType::Void);
        let merge = g.add(Operator::Merge, &[e1], ValueType::Void);
        let one = g.const_int(1, ValueType::Int32);
        let two = g.const_int(2, ValueType::Int32);
        let phi = g.add(Operator::Phi, &[merge, one], ValueType::Int32);

        g.add_end(merge, e2, |_, _| two);
        assert_eq!(g.inputs(phi), &[merge, one, two]);
        assert_eq!(g.merge_of(e2), Some(merge));
        assert_eq!(g.end_index(merge, e2), Some(1));

        g.remove_end_at(merge, 0);
        assert_eq!(g.inputs(merge), &[e2]);
        assert_eq!(g.inputs(phi), &[merge, two]);
        assert_eq!(g.phis(merge), vec![phi]);
    }
}
