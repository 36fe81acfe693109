//! IR node representation.
//!
//! A node stores its operator, its data inputs, an optional state slot and,
//! for fixed nodes, its control edges. Usage lists are *not* stored here:
//! the [`Graph`](super::graph::Graph) keeps them as a reverse index and
//! updates it on every mutation, which is why the edge fields are only
//! writable from inside the `ir` module.
//!
//! # Edge kinds
//!
//! - **inputs**: values (and, for merges, the end nodes joining them)
//! - **state**: frame state of a fixed node, or the outer frame of a frame
//!   state; tracked as a usage like an input
//! - **successors / predecessor**: control flow between fixed nodes

use smallvec::SmallVec;

use super::arena::Id;
use super::operators::Operator;
use super::types::ValueType;

/// Handle of a node in its graph.
pub type NodeId = Id<Node>;

/// Input list; most nodes have at most four inputs.
pub type InputList = SmallVec<[NodeId; 4]>;

/// Successor list; only switches exceed two.
pub type SuccessorList = SmallVec<[NodeId; 2]>;

bitflags::bitflags! {
    /// Per-node marks.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct NodeFlags: u8 {
        /// Deleted; the slot is never reused.
        const DEAD = 0b0000_0001;
        /// Created by duplicating a loop fragment.
        const DUPLICATE = 0b0000_0010;
        /// Guard moved out of at least one loop.
        const HOISTED = 0b0000_0100;
        /// Guard synthesized by loop predication.
        const PREDICATED = 0b0000_1000;
    }
}

/// A node of the loop IR.
#[derive(Debug, Clone)]
pub struct Node {
    pub(crate) op: Operator,
    pub(crate) inputs: InputList,
    pub(crate) state: Option<NodeId>,
    pub(crate) successors: SuccessorList,
    pub(crate) predecessor: Option<NodeId>,
    pub(crate) ty: ValueType,
    pub(crate) bci: u32,
    pub(crate) flags: NodeFlags,
}

impl Node {
    pub(crate) fn new(op: Operator, inputs: &[NodeId], ty: ValueType) -> Self {
        let successors = SmallVec::from_elem(NodeId::INVALID, op.successor_count());
        Node {
            op,
            inputs: SmallVec::from_slice(inputs),
            state: None,
            successors,
            predecessor: None,
            ty,
            bci: 0,
            flags: NodeFlags::empty(),
        }
    }

    /// Operator payload.
    #[inline]
    pub fn op(&self) -> &Operator {
        &self.op
    }

    /// Data inputs.
    #[inline]
    pub fn inputs(&self) -> &[NodeId] {
        &self.inputs
    }

    /// Input at `index`.
    ///
    /// # Panics
    ///
    /// When `index` is out of range; operators have fixed input layouts.
    #[inline]
    pub fn input(&self, index: usize) -> NodeId {
        self.inputs[index]
    }

    /// State slot.
    #[inline]
    pub fn state(&self) -> Option<NodeId> {
        self.state
    }

    /// Control successors; unset slots hold [`NodeId::INVALID`].
    #[inline]
    pub fn successors(&self) -> &[NodeId] {
        &self.successors
    }

    /// Single control successor of a straight-line fixed node.
    #[inline]
    pub fn next(&self) -> Option<NodeId> {
        if self.op.has_next() {
            self.successors.first().copied().filter(|s| s.is_valid())
        } else {
            None
        }
    }

    /// Control predecessor.
    #[inline]
    pub fn predecessor(&self) -> Option<NodeId> {
        self.predecessor
    }

    /// Result type.
    #[inline]
    pub fn ty(&self) -> ValueType {
        self.ty
    }

    /// Bytecode index the node was created for.
    #[inline]
    pub fn bci(&self) -> u32 {
        self.bci
    }

    /// Marks.
    #[inline]
    pub fn flags(&self) -> NodeFlags {
        self.flags
    }

    /// Whether the node was deleted.
    #[inline]
    pub fn is_dead(&self) -> bool {
        self.flags.contains(NodeFlags::DEAD)
    }

    /// Integer constant value.
    #[inline]
    pub fn as_int(&self) -> Option<i64> {
        match self.op {
            Operator::ConstInt(v) => Some(v),
            _ => None,
        }
    }

    /// Boolean constant value.
    #[inline]
    pub fn as_bool(&self) -> Option<bool> {
        match self.op {
            Operator::ConstBool(v) => Some(v),
            _ => None,
        }
    }

    /// Constant of either kind.
    #[inline]
    pub fn is_constant(&self) -> bool {
        matches!(self.op, Operator::ConstInt(_) | Operator::ConstBool(_))
    }

    /// All nodes this node reads: inputs followed by the state slot.
    pub fn all_inputs(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.inputs.iter().copied().chain(self.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::operators::ArithOp;

    #[test]
    fn test_successor_slots_follow_operator() {
        let node = Node::new(Operator::If { true_probability: 0.5 }, &[Id::new(3)], ValueType::Void);
        assert_eq!(node.successors().len(), 2);
        assert!(node.successors().iter().all(|s| !s.is_valid()));
        assert_eq!(node.next(), None);

        let add = Node::new(
            Operator::IntOp(ArithOp::Add),
            &[Id::new(1), Id::new(2)],
            ValueType::Int32,
        );
        assert!(add.successors().is_empty());
        assert_eq!(add.all_inputs().collect::<Vec<_>>(), vec![Id::new(1), Id::new(2)]);
    }

    #[test]
    fn test_all_inputs_includes_state() {
        let mut node = Node::new(Operator::LoopExit, &[Id::new(4)], ValueType::Void);
        node.state = Some(Id::new(9));
        assert_eq!(node.all_inputs().collect::<Vec<_>>(), vec![Id::new(4), Id::new(9)]);
    }

    #[test]
    fn test_flags() {
        let mut node = Node::new(Operator::ConstInt(3), &[], ValueType::Int32);
        assert!(!node.is_dead());
        node.flags |= NodeFlags::DEAD | NodeFlags::DUPLICATE;
        assert!(node.is_dead());
        assert_eq!(node.as_int(), Some(3));
        assert!(node.is_constant());
    }
}
