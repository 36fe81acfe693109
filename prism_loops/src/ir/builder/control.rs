//! Structured control flow: branches, switches, merges and loops.
//!
//! ```text
//!   begin_loop ─► LoopBegin ─► exit_unless ─► If ─┬─► Begin ─► body ─► end_loop: LoopEnd
//!                                                  └─► LoopExit ─► (merged exits) ─► ...
//! ```

use super::GraphBuilder;
use crate::ir::node::NodeId;
use crate::ir::operators::{LoopInfo, Operator, SwitchInfo};
use crate::ir::types::ValueType;

/// An `If` under construction.
#[derive(Debug)]
pub struct Branch {
    split: NodeId,
    true_begin: NodeId,
    false_begin: NodeId,
    then_end: Option<NodeId>,
    in_else: bool,
}

impl Branch {
    /// The `If` node.
    pub fn split(&self) -> NodeId {
        self.split
    }

    /// Begin of the true side.
    pub fn true_begin(&self) -> NodeId {
        self.true_begin
    }

    /// Begin of the false side.
    pub fn false_begin(&self) -> NodeId {
        self.false_begin
    }
}

/// A loop under construction.
#[derive(Debug)]
pub struct LoopScope {
    begin: NodeId,
    phis: Vec<NodeId>,
    exits: Vec<NodeId>,
}

impl LoopScope {
    /// The `LoopBegin`.
    pub fn begin(&self) -> NodeId {
        self.begin
    }

    /// Loop phi `index`, in the order of the initial values.
    pub fn phi(&self, index: usize) -> NodeId {
        self.phis[index]
    }

    /// All loop phis.
    pub fn phis(&self) -> &[NodeId] {
        &self.phis
    }

    /// Exits created so far.
    pub fn exits(&self) -> &[NodeId] {
        &self.exits
    }
}

/// Builder trait for control flow.
pub trait ControlBuilder {
    // Branches
    fn begin_if(&mut self, condition: NodeId, true_probability: f64) -> Branch;
    fn begin_else(&mut self, branch: &mut Branch);
    fn end_if(&mut self, branch: Branch, values: &[(NodeId, NodeId)]) -> Vec<NodeId>;
    fn switch(&mut self, value: NodeId, keys: &[i64], probabilities: &[f64]) -> Vec<NodeId>;

    // Merges
    fn close_with_end(&mut self) -> Option<NodeId>;
    fn merge(&mut self, ends: &[NodeId], values: &[Vec<NodeId>]) -> Vec<NodeId>;

    // Loops
    fn begin_loop(&mut self, inits: &[NodeId], frequency: f64) -> LoopScope;
    fn exit_unless(&mut self, scope: &mut LoopScope, condition: NodeId) -> NodeId;
    fn exit_if(&mut self, scope: &mut LoopScope, condition: NodeId) -> NodeId;
    fn continue_loop(&mut self, scope: &mut LoopScope, back_values: &[NodeId]);
    fn end_loop(
        &mut self,
        scope: LoopScope,
        back_values: &[NodeId],
        exit_values: &[NodeId],
    ) -> Vec<NodeId>;
}

impl GraphBuilder {
    fn split_begin(&mut self, split: NodeId, index: usize, op: Operator, inputs: &[NodeId]) -> NodeId {
        let begin = self.fixed(op, inputs, ValueType::Void);
        self.graph.set_successor(split, index, begin);
        begin
    }

    fn loop_test(&mut self, scope: &mut LoopScope, condition: NodeId, exit_on_true: bool) -> NodeId {
        let frequency = self
            .graph
            .loop_info(scope.begin)
            .map(|info| info.frequency)
            .unwrap_or(LoopInfo::DEFAULT_FREQUENCY);
        let stay = 1.0 - 1.0 / frequency;
        let true_probability = if exit_on_true { 1.0 - stay } else { stay };
        let split = self.fixed(Operator::If { true_probability }, &[condition], ValueType::Void);
        self.attach(split);

        let (stay_index, exit_index) = if exit_on_true { (1, 0) } else { (0, 1) };
        let body = self.split_begin(split, stay_index, Operator::Begin, &[]);
        let exit = self.split_begin(split, exit_index, Operator::LoopExit, &[scope.begin]);
        scope.exits.push(exit);
        self.current = Some(body);
        exit
    }

    /// Proxy `values` at `exit` and give the exit its frame state.
    fn proxy_at(&mut self, scope: &LoopScope, exit: NodeId, values: &[NodeId]) -> Vec<NodeId> {
        let proxies: Vec<NodeId> = values
            .iter()
            .map(|&v| {
                let ty = self.graph.ty(v);
                self.graph.add(Operator::Proxy, &[exit, v], ty)
            })
            .collect();
        if self.frame_states {
            let state_values: Vec<NodeId> = scope
                .phis
                .iter()
                .map(|&p| {
                    let ty = self.graph.ty(p);
                    self.graph.add(Operator::Proxy, &[exit, p], ty)
                })
                .collect();
            let state = self.state_over(&state_values);
            self.graph.set_state(exit, Some(state));
        }
        proxies
    }
}

impl ControlBuilder for GraphBuilder {
    /// Open an `If`; building continues on the true side.
    fn begin_if(&mut self, condition: NodeId, true_probability: f64) -> Branch {
        let split = self.fixed(Operator::If { true_probability }, &[condition], ValueType::Void);
        self.attach(split);
        let true_begin = self.split_begin(split, 0, Operator::Begin, &[]);
        let false_begin = self.split_begin(split, 1, Operator::Begin, &[]);
        self.current = Some(true_begin);
        Branch {
            split,
            true_begin,
            false_begin,
            then_end: None,
            in_else: false,
        }
    }

    /// Close the true side and continue on the false side.
    fn begin_else(&mut self, branch: &mut Branch) {
        assert!(!branch.in_else, "else side already started");
        branch.then_end = self.close_with_end();
        branch.in_else = true;
        self.current = Some(branch.false_begin);
    }

    /// Join the open sides; `values` are `(true value, false value)` pairs
    /// turned into phis (or passed through when one side is closed).
    fn end_if(&mut self, mut branch: Branch, values: &[(NodeId, NodeId)]) -> Vec<NodeId> {
        if !branch.in_else {
            self.begin_else(&mut branch);
        }
        let else_end = self.close_with_end();
        let mut ends = Vec::new();
        let mut sides: Vec<Vec<NodeId>> = vec![Vec::new(); values.len()];
        if let Some(end) = branch.then_end {
            ends.push(end);
            for (side, &(t, _)) in sides.iter_mut().zip(values) {
                side.push(t);
            }
        }
        if let Some(end) = else_end {
            ends.push(end);
            for (side, &(_, f)) in sides.iter_mut().zip(values) {
                side.push(f);
            }
        }
        if ends.is_empty() {
            return Vec::new();
        }
        self.merge(&ends, &sides)
    }

    /// Create a switch; returns the begin of each successor (keys, then
    /// default). Control is closed; continue with [`GraphBuilder::position_at`].
    fn switch(&mut self, value: NodeId, keys: &[i64], probabilities: &[f64]) -> Vec<NodeId> {
        assert_eq!(keys.len() + 1, probabilities.len(), "one probability per successor");
        let info = SwitchInfo {
            keys: keys.to_vec(),
            probabilities: probabilities.to_vec(),
        };
        let split = self.fixed(Operator::Switch(info), &[value], ValueType::Void);
        self.attach(split);
        (0..=keys.len())
            .map(|i| self.split_begin(split, i, Operator::Begin, &[]))
            .collect()
    }

    /// End the open position with a forward `End`, if open.
    fn close_with_end(&mut self) -> Option<NodeId> {
        self.current?;
        let end = self.fixed(Operator::End, &[], ValueType::Void);
        Some(self.attach(end))
    }

    /// Join `ends`; each entry of `values` holds one value per end and
    /// becomes a phi.
    fn merge(&mut self, ends: &[NodeId], values: &[Vec<NodeId>]) -> Vec<NodeId> {
        assert!(!ends.is_empty(), "merge without ends");
        let merge = self.fixed(Operator::Merge, ends, ValueType::Void);
        self.current = Some(merge);
        values
            .iter()
            .map(|vals| {
                assert_eq!(vals.len(), ends.len(), "one phi value per end");
                let ty = self.graph.ty(vals[0]);
                let mut inputs = Vec::with_capacity(vals.len() + 1);
                inputs.push(merge);
                inputs.extend_from_slice(vals);
                self.graph.add(Operator::Phi, &inputs, ty)
            })
            .collect()
    }

    /// Enter a loop with one phi per initial value.
    fn begin_loop(&mut self, inits: &[NodeId], frequency: f64) -> LoopScope {
        let forward = self.fixed(Operator::End, &[], ValueType::Void);
        self.attach(forward);
        let begin = self.fixed(
            Operator::LoopBegin(LoopInfo::with_frequency(frequency)),
            &[forward],
            ValueType::Void,
        );
        let phis: Vec<NodeId> = inits
            .iter()
            .map(|&init| {
                let ty = self.graph.ty(init);
                self.graph.add(Operator::Phi, &[begin, init], ty)
            })
            .collect();
        if self.frame_states {
            let state = self.state_over(&phis);
            self.graph.set_state(begin, Some(state));
        }
        self.current = Some(begin);
        LoopScope {
            begin,
            phis,
            exits: Vec::new(),
        }
    }

    /// Leave the loop when `condition` is false.
    fn exit_unless(&mut self, scope: &mut LoopScope, condition: NodeId) -> NodeId {
        self.loop_test(scope, condition, false)
    }

    /// Leave the loop when `condition` is true.
    fn exit_if(&mut self, scope: &mut LoopScope, condition: NodeId) -> NodeId {
        self.loop_test(scope, condition, true)
    }

    /// Back edge from the open position with one value per phi.
    fn continue_loop(&mut self, scope: &mut LoopScope, back_values: &[NodeId]) {
        assert_eq!(back_values.len(), scope.phis.len(), "one back value per phi");
        let end = self.fixed(Operator::LoopEnd { safepoint: true }, &[], ValueType::Void);
        self.attach(end);
        self.graph.push_input(scope.begin, end);
        for (&phi, &value) in scope.phis.iter().zip(back_values) {
            self.graph.push_input(phi, value);
        }
    }

    /// Close the loop and continue after its exits. Returns the values of
    /// `exit_values` as seen after the loop.
    fn end_loop(
        &mut self,
        mut scope: LoopScope,
        back_values: &[NodeId],
        exit_values: &[NodeId],
    ) -> Vec<NodeId> {
        if self.current.is_some() {
            self.continue_loop(&mut scope, back_values);
        }
        let exits = scope.exits.clone();
        match exits.as_slice() {
            [] => Vec::new(),
            [exit] => {
                let values = self.proxy_at(&scope, *exit, exit_values);
                self.current = Some(*exit);
                values
            }
            _ => {
                let mut ends = Vec::with_capacity(exits.len());
                let mut per_value: Vec<Vec<NodeId>> = vec![Vec::new(); exit_values.len()];
                for &exit in &exits {
                    let proxies = self.proxy_at(&scope, exit, exit_values);
                    for (slot, proxy) in per_value.iter_mut().zip(proxies) {
                        slot.push(proxy);
                    }
                    self.current = Some(exit);
                    if let Some(end) = self.close_with_end() {
                        ends.push(end);
                    }
                }
                self.merge(&ends, &per_value)
            }
        }
    }
}
