//! Structural verification of a graph.
//!
//! Run between phases when `LoopConfig::verify` is set and throughout the
//! tests. A failure means an engine bug, never bad input.

use rustc_hash::FxHashMap;

use super::graph::Graph;
use super::node::NodeId;
use super::operators::Operator;
use crate::error::{LoopResult, invariant_error};

impl Graph {
    /// Check edge symmetry and the structural rules of every node kind.
    pub fn verify(&self) -> LoopResult<()> {
        for id in self.live_nodes() {
            self.verify_edges(id)?;
            self.verify_control(id)?;
            self.verify_shape(id)?;
        }
        Ok(())
    }

    fn verify_edges(&self, id: NodeId) -> LoopResult<()> {
        let mut expected: FxHashMap<NodeId, usize> = FxHashMap::default();
        for input in self.node(id).all_inputs() {
            if !self.is_live(input) {
                return Err(invariant_error!("{:?} reads dead node {:?}", id, input));
            }
            *expected.entry(input).or_default() += 1;
        }
        for (input, count) in expected {
            let recorded = self.uses(input).iter().filter(|&&u| u == id).count();
            if recorded != count {
                return Err(invariant_error!(
                    "{:?} reads {:?} {} times but {} usages are recorded",
                    id,
                    input,
                    count,
                    recorded
                ));
            }
        }
        for &user in self.uses(id) {
            if !self.is_live(user) {
                return Err(invariant_error!("{:?} is used by dead node {:?}", id, user));
            }
            if !self.node(user).all_inputs().any(|i| i == id) {
                return Err(invariant_error!(
                    "{:?} lists {:?} as user without an edge",
                    id,
                    user
                ));
            }
        }
        Ok(())
    }

    fn verify_control(&self, id: NodeId) -> LoopResult<()> {
        let op = self.op(id);
        if op.is_floating() {
            if self.predecessor(id).is_some() || !self.successors(id).is_empty() {
                return Err(invariant_error!("floating {:?} has control edges", id));
            }
            return Ok(());
        }
        for (index, &succ) in self.successors(id).iter().enumerate() {
            if !succ.is_valid() {
                return Err(invariant_error!(
                    "{} {:?} has no successor in slot {}",
                    op.name(),
                    id,
                    index
                ));
            }
            if !self.is_live(succ) || self.predecessor(succ) != Some(id) {
                return Err(invariant_error!(
                    "successor {:?} of {:?} does not point back",
                    succ,
                    id
                ));
            }
            if op.is_control_split() && !matches!(self.op(succ), Operator::Begin | Operator::LoopExit) {
                return Err(invariant_error!(
                    "split {:?} has non-begin successor {:?}",
                    id,
                    succ
                ));
            }
        }
        match self.predecessor(id) {
            Some(pred) => {
                if !self.is_live(pred) || !self.successors(pred).contains(&id) {
                    return Err(invariant_error!("predecessor of {:?} does not point back", id));
                }
            }
            None => {
                if !matches!(op, Operator::Start | Operator::Merge | Operator::LoopBegin(_)) {
                    return Err(invariant_error!("{} {:?} has no predecessor", op.name(), id));
                }
            }
        }
        if op.is_merge() && self.predecessor(id).is_some() {
            return Err(invariant_error!("merge {:?} has a direct predecessor", id));
        }
        if op.is_end() {
            let merges = self
                .users(id)
                .into_iter()
                .filter(|&u| self.op(u).is_merge())
                .count();
            if merges != 1 {
                return Err(invariant_error!("end {:?} feeds {} merges", id, merges));
            }
        }
        Ok(())
    }

    fn verify_shape(&self, id: NodeId) -> LoopResult<()> {
        let inputs = self.inputs(id);
        match self.op(id) {
            Operator::Merge => {
                if inputs.is_empty() || !inputs.iter().all(|&e| matches!(self.op(e), Operator::End)) {
                    return Err(invariant_error!("merge {:?} must join End nodes", id));
                }
            }
            Operator::LoopBegin(_) => {
                if inputs.is_empty() || !matches!(self.op(inputs[0]), Operator::End) {
                    return Err(invariant_error!("loop {:?} lacks a forward end", id));
                }
                if !inputs[1..]
                    .iter()
                    .all(|&e| matches!(self.op(e), Operator::LoopEnd { .. }))
                {
                    return Err(invariant_error!("loop {:?} has a non-LoopEnd back edge", id));
                }
            }
            Operator::Phi => {
                let merge = inputs[0];
                if !self.op(merge).is_merge() {
                    return Err(invariant_error!("phi {:?} is not attached to a merge", id));
                }
                if inputs.len() != self.inputs(merge).len() + 1 {
                    return Err(invariant_error!(
                        "phi {:?} has {} values for {} merge inputs",
                        id,
                        inputs.len() - 1,
                        self.inputs(merge).len()
                    ));
                }
            }
            Operator::LoopExit => {
                if inputs.len() != 1 || !matches!(self.op(inputs[0]), Operator::LoopBegin(_)) {
                    return Err(invariant_error!("loop exit {:?} without loop begin", id));
                }
            }
            Operator::Proxy => {
                if inputs.len() != 2 || !matches!(self.op(inputs[0]), Operator::LoopExit) {
                    return Err(invariant_error!("proxy {:?} is not attached to an exit", id));
                }
            }
            Operator::Guard { .. } => {
                if inputs.len() != 2 || !self.op(inputs[1]).is_begin() {
                    return Err(invariant_error!("guard {:?} is not anchored at a begin", id));
                }
            }
            Operator::If { .. } | Operator::FixedGuard { .. } => {
                if self.ty(inputs[0]) != crate::ir::types::ValueType::Bool {
                    return Err(invariant_error!("condition of {:?} is not boolean", id));
                }
            }
            _ => {}
        }
        Ok(())
    }
}
