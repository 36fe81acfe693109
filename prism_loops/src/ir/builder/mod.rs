//! Graph builder.
//!
//! Builds well-formed loop IR graphs from structured calls. Used by the
//! tests, the benches, and callers that assemble small graphs by hand.
//!
//! The builder tracks one *open* control position: the last fixed node
//! whose `next` is still unset. Straight-line nodes are appended there;
//! splits, ends and terminals close it.
//!
//! Functionality is split into extension traits like the rest of the IR:
//!
//! - [`ControlBuilder`]: branches, switches, merges and loops
//! - [`GuardBuilder`]: guards, deopts and frame states
//!
//! # Example
//!
//! ```
//! use prism_loops::ir::builder::{ControlBuilder, GraphBuilder};
//! use prism_loops::ir::{CmpOp, ValueType};
//!
//! let mut b = GraphBuilder::new(0);
//! let n = b.parameter(ValueType::Int32);
//! let (zero, one) = (b.int(0), b.int(1));
//! let mut lp = b.begin_loop(&[zero], 10.0);
//! let i = lp.phi(0);
//! let cond = b.compare(CmpOp::Lt, i, n);
//! b.exit_unless(&mut lp, cond);
//! let next = b.add(i, one);
//! let after = b.end_loop(lp, &[next], &[i]);
//! b.return_value(Some(after[0]));
//! assert!(b.finish().verify().is_ok());
//! ```

use std::sync::Arc;

use crate::ir::deopt::MethodId;
use crate::ir::graph::Graph;
use crate::ir::node::NodeId;
use crate::ir::operators::{ArithOp, CmpOp, LogicOp, Operator};
use crate::ir::stamp::IntegerStamp;
use crate::ir::types::ValueType;
use crate::speculation::SpeculationLog;

pub mod control;
pub mod guards;


pub use control::{Branch, ControlBuilder, LoopScope};
pub use guards::GuardBuilder;

// =============================================================================
// Graph Builder
// =============================================================================

/// Incremental constructor for [`Graph`]s.
pub struct GraphBuilder {
    /// The graph being built.
    pub(crate) graph: Graph,

    /// Open control position, `None` after a terminal or end.
    pub(crate) current: Option<NodeId>,

    /// Bytecode index given to new fixed nodes.
    pub(crate) bci: u32,

    /// Attach frame states to loop headers and exits.
    pub(crate) frame_states: bool,
}

impl GraphBuilder {
    /// Start building a graph for method `method`.
    pub fn new(method: u32) -> Self {
        let graph = Graph::new(MethodId(method));
        let start = graph.start();
        GraphBuilder {
            graph,
            current: Some(start),
            bci: 0,
            frame_states: false,
        }
    }

    /// Share a speculation log with the built graph.
    pub fn with_speculation_log(mut self, log: Arc<SpeculationLog>) -> Self {
        self.graph.set_speculation_log(Some(log));
        self
    }

    /// Give loop headers and exits frame states over the loop phis.
    pub fn with_frame_states(mut self) -> Self {
        self.frame_states = true;
        self
    }

    /// Graph under construction.
    #[inline]
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Mutable graph under construction.
    #[inline]
    pub fn graph_mut(&mut self) -> &mut Graph {
        &mut self.graph
    }

    /// Open control position.
    #[inline]
    pub fn current(&self) -> Option<NodeId> {
        self.current
    }

    /// Whether straight-line nodes can be appended.
    #[inline]
    pub fn is_open(&self) -> bool {
        self.current.is_some()
    }

    /// Bytecode index for subsequently created fixed nodes.
    pub fn set_bci(&mut self, bci: u32) {
        self.bci = bci;
    }

    /// Continue building after `node`, a fixed node with an unset `next`.
    pub fn position_at(&mut self, node: NodeId) {
        assert!(
            self.graph.op(node).has_next() && self.graph.next(node).is_none(),
            "cannot continue after {:?}",
            node
        );
        self.current = Some(node);
    }

    /// Hand out the finished graph.
    pub fn finish(self) -> Graph {
        self.graph
    }

    // =========================================================================
    // Fixed Node Plumbing
    // =========================================================================

    pub(crate) fn open(&self) -> NodeId {
        match self.current {
            Some(node) => node,
            None => panic!("no open control position"),
        }
    }

    /// Create a fixed node stamped with the current bci.
    pub(crate) fn fixed(&mut self, op: Operator, inputs: &[NodeId], ty: ValueType) -> NodeId {
        let id = self.graph.add(op, inputs, ty);
        self.graph.set_bci(id, self.bci);
        id
    }

    /// Link `node` after the open position. Straight-line nodes become the
    /// new open position; anything else closes it.
    pub(crate) fn attach(&mut self, node: NodeId) -> NodeId {
        let at = self.open();
        self.graph.set_successor(at, 0, node);
        self.current = self.graph.op(node).has_next().then_some(node);
        node
    }

    // =========================================================================
    // Values
    // =========================================================================

    /// Parameter without a known range.
    pub fn parameter(&mut self, ty: ValueType) -> NodeId {
        self.graph.add_parameter(ty, None)
    }

    /// Integer parameter known to lie in `[lower, upper]`.
    pub fn parameter_in(&mut self, ty: ValueType, lower: i64, upper: i64) -> NodeId {
        let bits = ty.bits().unwrap_or(64);
        let stamp = IntegerStamp::new(bits, lower, upper);
        self.graph.add_parameter(ty, Some(stamp))
    }

    /// 32-bit constant.
    pub fn int(&mut self, value: i64) -> NodeId {
        self.graph.const_int(value, ValueType::Int32)
    }

    /// 64-bit constant.
    pub fn long(&mut self, value: i64) -> NodeId {
        self.graph.const_int(value, ValueType::Int64)
    }

    /// Boolean constant.
    pub fn boolean(&mut self, value: bool) -> NodeId {
        self.graph.const_bool(value)
    }

    /// Arithmetic typed after its first operand.
    pub fn arith(&mut self, op: ArithOp, a: NodeId, b: NodeId) -> NodeId {
        let ty = self.graph.ty(a);
        self.graph.arith(op, a, b, ty)
    }

    /// a + b
    pub fn add(&mut self, a: NodeId, b: NodeId) -> NodeId {
        self.arith(ArithOp::Add, a, b)
    }

    /// a - b
    pub fn sub(&mut self, a: NodeId, b: NodeId) -> NodeId {
        self.arith(ArithOp::Sub, a, b)
    }

    /// a * b
    pub fn mul(&mut self, a: NodeId, b: NodeId) -> NodeId {
        self.arith(ArithOp::Mul, a, b)
    }

    /// Integer comparison.
    pub fn compare(&mut self, op: CmpOp, a: NodeId, b: NodeId) -> NodeId {
        self.graph.compare(op, a, b)
    }

    /// Boolean negation.
    pub fn not(&mut self, value: NodeId) -> NodeId {
        self.graph.not(value)
    }

    /// a && b
    pub fn and(&mut self, a: NodeId, b: NodeId) -> NodeId {
        self.graph.logic(LogicOp::And, a, b)
    }

    /// a || b
    pub fn or(&mut self, a: NodeId, b: NodeId) -> NodeId {
        self.graph.logic(LogicOp::Or, a, b)
    }

    /// Widen to 64 bits.
    pub fn sign_extend(&mut self, value: NodeId) -> NodeId {
        self.graph.sign_extend(value)
    }

    /// Length of an array.
    pub fn array_length(&mut self, array: NodeId) -> NodeId {
        self.graph.add(Operator::ArrayLength, &[array], ValueType::Int32)
    }

    /// Type test.
    pub fn instance_of(&mut self, object: NodeId, class: u32) -> NodeId {
        self.graph
            .add(Operator::InstanceOf(class), &[object], ValueType::Bool)
    }

    // =========================================================================
    // Memory And Calls
    // =========================================================================

    /// `array[index]`.
    pub fn load(&mut self, array: NodeId, index: NodeId) -> NodeId {
        let node = self.fixed(Operator::LoadIndexed, &[array, index], ValueType::Int32);
        self.attach(node)
    }

    /// `array[index] = value`.
    pub fn store(&mut self, array: NodeId, index: NodeId, value: NodeId) -> NodeId {
        let node = self.fixed(
            Operator::StoreIndexed,
            &[array, index, value],
            ValueType::Void,
        );
        self.attach(node)
    }

    /// Call returning an int.
    pub fn invoke(&mut self, target: u32, args: &[NodeId], safepoint: bool) -> NodeId {
        let node = self.fixed(Operator::Invoke { target, safepoint }, args, ValueType::Int32);
        self.attach(node)
    }

    /// Method return.
    pub fn return_value(&mut self, value: Option<NodeId>) -> NodeId {
        let inputs: Vec<NodeId> = value.into_iter().collect();
        let node = self.fixed(Operator::Return, &inputs, ValueType::Void);
        self.attach(node)
    }
}
