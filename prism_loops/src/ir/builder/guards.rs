//! Guards, deopts and frame states.
//!
//! ```text
//!   fixed_guard:  ... ─► FixedGuard(cond) ─► ...          (at a position)
//!   guard:        Guard(cond, anchor)                      (checked on anchor entry)
//!   deopt_if:     ... ─► If(cond) ─┬─► Begin ─► Deoptimize
//!                                  └─► Begin ─► ...
//! ```

use super::GraphBuilder;
use crate::ir::deopt::{DeoptInfo, DeoptimizationAction, DeoptimizationReason};
use crate::ir::node::NodeId;
use crate::ir::operators::{FrameStateInfo, Operator};
use crate::ir::types::ValueType;

/// Builder trait for deoptimization points.
pub trait GuardBuilder {
    fn fixed_guard(
        &mut self,
        condition: NodeId,
        reason: DeoptimizationReason,
        action: DeoptimizationAction,
        negated: bool,
    ) -> NodeId;
    fn guard(
        &mut self,
        condition: NodeId,
        reason: DeoptimizationReason,
        action: DeoptimizationAction,
    ) -> NodeId;
    fn deoptimize(&mut self, reason: DeoptimizationReason, action: DeoptimizationAction) -> NodeId;
    fn deopt_if(
        &mut self,
        condition: NodeId,
        reason: DeoptimizationReason,
        action: DeoptimizationAction,
        probability: f64,
    ) -> NodeId;
    fn frame_state(&mut self, values: &[NodeId]) -> NodeId;
}

impl GraphBuilder {
    /// Frame state at the current bci over `values` as locals.
    pub(crate) fn state_over(&mut self, values: &[NodeId]) -> NodeId {
        let info = FrameStateInfo {
            bci: self.bci,
            locals: values.len() as u16,
            stack: 0,
            locks: 0,
        };
        self.graph.frame_state(info, values, None)
    }
}

impl GuardBuilder for GraphBuilder {
    /// Guard at the open position; passes while `condition != negated`.
    fn fixed_guard(
        &mut self,
        condition: NodeId,
        reason: DeoptimizationReason,
        action: DeoptimizationAction,
        negated: bool,
    ) -> NodeId {
        let info = DeoptInfo::new(reason, action);
        let node = self.fixed(Operator::FixedGuard { info, negated }, &[condition], ValueType::Void);
        self.attach(node)
    }

    /// Floating guard anchored at the begin of the open block.
    fn guard(
        &mut self,
        condition: NodeId,
        reason: DeoptimizationReason,
        action: DeoptimizationAction,
    ) -> NodeId {
        let anchor = self.graph.block_begin(self.open());
        let info = DeoptInfo::new(reason, action);
        let node = self.graph.add(
            Operator::Guard {
                info,
                negated: false,
            },
            &[condition, anchor],
            ValueType::Void,
        );
        self.graph.set_bci(node, self.bci);
        node
    }

    /// Unconditional deopt; closes control.
    fn deoptimize(&mut self, reason: DeoptimizationReason, action: DeoptimizationAction) -> NodeId {
        let node = self.fixed(
            Operator::Deoptimize(DeoptInfo::new(reason, action)),
            &[],
            ValueType::Void,
        );
        if self.frame_states {
            let state = self.state_over(&[]);
            self.graph.set_state(node, Some(state));
        }
        self.attach(node)
    }

    /// Deopt when `condition` holds, continue on the false side. Returns
    /// the `Deoptimize` node.
    fn deopt_if(
        &mut self,
        condition: NodeId,
        reason: DeoptimizationReason,
        action: DeoptimizationAction,
        probability: f64,
    ) -> NodeId {
        let split = self.fixed(
            Operator::If {
                true_probability: probability,
            },
            &[condition],
            ValueType::Void,
        );
        self.attach(split);
        let taken = self.fixed(Operator::Begin, &[], ValueType::Void);
        let fall = self.fixed(Operator::Begin, &[], ValueType::Void);
        self.graph.set_successor(split, 0, taken);
        self.graph.set_successor(split, 1, fall);
        self.current = Some(taken);
        let deopt = self.deoptimize(reason, action);
        self.current = Some(fall);
        deopt
    }

    /// Standalone frame state over `values`.
    fn frame_state(&mut self, values: &[NodeId]) -> NodeId {
        self.state_over(values)
    }
}
