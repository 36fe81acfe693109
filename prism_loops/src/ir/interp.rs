//! Reference interpreter for loop IR graphs.
//!
//! Executes a graph on concrete inputs so that transformations can be
//! checked differentially: the same graph before and after a rewrite must
//! return the same value, leave the same heap, and make the same calls,
//! unless a guard fires.
//!
//! # Semantics
//!
//! - Control walks fixed nodes from `Start`.
//! - Floating values are evaluated on demand from the current phi and
//!   proxy bindings.
//! - Entering a merge binds all its phis at once from the incoming edge;
//!   entering a loop exit latches all its proxies.
//! - Floating guards are checked when control enters their anchor;
//!   fixed guards when control reaches them.
//! - Integer arithmetic wraps at the node's width.
//! - `Invoke` returns `target + sum(args)` and is recorded.

use rustc_hash::FxHashMap;
use thiserror::Error;

use super::deopt::{DeoptimizationAction, DeoptimizationReason, Speculation};
use super::graph::Graph;
use super::node::NodeId;
use super::operators::{LogicOp, Operator};
use super::types::ValueType;

/// Default bound on executed fixed nodes.
pub const DEFAULT_STEP_LIMIT: usize = 1_000_000;

// =============================================================================
// Values
// =============================================================================

/// Runtime value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Value {
    /// No value.
    Void,
    /// Integer of either width, already wrapped.
    Int(i64),
    /// Boolean.
    Bool(bool),
    /// Index into the heap's arrays.
    Array(usize),
    /// Object of the given class id.
    Object(u32),
}

impl Value {
    fn as_int(self, node: NodeId) -> Result<i64, InterpError> {
        match self {
            Value::Int(v) => Ok(v),
            _ => Err(InterpError::TypeMismatch { node }),
        }
    }

    fn as_bool(self, node: NodeId) -> Result<bool, InterpError> {
        match self {
            Value::Bool(v) => Ok(v),
            _ => Err(InterpError::TypeMismatch { node }),
        }
    }
}

/// How an execution ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Normal return.
    Returned(Value),
    /// A guard or deopt transferred to the interpreter.
    Deoptimized {
        /// Node that deoptimized.
        node: NodeId,
        /// Its reason.
        reason: DeoptimizationReason,
        /// Its action.
        action: DeoptimizationAction,
        /// Its speculation.
        speculation: Speculation,
    },
}

impl Outcome {
    /// Whether a guard fired.
    pub fn is_deopt(&self) -> bool {
        matches!(self, Outcome::Deoptimized { .. })
    }

    /// Equal up to the identity of the deoptimizing node.
    pub fn same_as(&self, other: &Outcome) -> bool {
        match (self, other) {
            (Outcome::Returned(a), Outcome::Returned(b)) => a == b,
            (
                Outcome::Deoptimized {
                    reason: r1,
                    action: a1,
                    ..
                },
                Outcome::Deoptimized {
                    reason: r2,
                    action: a2,
                    ..
                },
            ) => r1 == r2 && a1 == a2,
            _ => false,
        }
    }
}

/// Observable effects of one execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Execution {
    /// How the method ended.
    pub outcome: Outcome,
    /// Arrays after execution.
    pub heap: Vec<Vec<i64>>,
    /// Calls in order: target and integer arguments.
    pub calls: Vec<(u32, Vec<i64>)>,
    /// Fixed nodes executed.
    pub steps: usize,
    /// Back edges taken that polled for a safepoint.
    pub safepoint_polls: usize,
    /// Entries into each loop header, forward and backward.
    pub header_entries: FxHashMap<NodeId, u64>,
}

impl Execution {
    /// Same outcome, heap and calls.
    pub fn same_effects(&self, other: &Execution) -> bool {
        self.outcome.same_as(&other.outcome) && self.heap == other.heap && self.calls == other.calls
    }

    /// Equivalent once deoptimization resumes in the interpreter: both
    /// return with the same effects, or both deoptimize.
    ///
    /// Speculative transformations may deoptimize earlier than the
    /// original, before some of its effects happened.
    pub fn same_after_resume(&self, other: &Execution) -> bool {
        match (&self.outcome, &other.outcome) {
            (Outcome::Deoptimized { .. }, Outcome::Deoptimized { .. }) => true,
            _ => self.same_effects(other),
        }
    }
}

/// Failure of the interpreter itself, as opposed to a guard.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InterpError {
    /// The step budget ran out.
    #[error("step limit of {0} exceeded")]
    StepLimit(usize),
    /// A value had the wrong kind.
    #[error("type mismatch at {node:?}")]
    TypeMismatch {
        /// Offending node.
        node: NodeId,
    },
    /// An array access was out of bounds.
    #[error("index {index} out of bounds for length {length} at {node:?}")]
    OutOfBounds {
        /// Access node.
        node: NodeId,
        /// Index used.
        index: i64,
        /// Length of the array.
        length: usize,
    },
    /// Integer division by zero.
    #[error("division by zero at {node:?}")]
    DivisionByZero {
        /// Division node.
        node: NodeId,
    },
    /// The graph is not executable as built.
    #[error("malformed graph at {node:?}: {message}")]
    Malformed {
        /// Where execution got stuck.
        node: NodeId,
        /// What was wrong.
        message: &'static str,
    },
}

// =============================================================================
// Interpreter
// =============================================================================

/// Executes graphs.
#[derive(Debug)]
pub struct Interpreter<'g> {
    graph: &'g Graph,
    step_limit: usize,
}

struct Frame<'a> {
    args: &'a [Value],
    heap: Vec<Vec<i64>>,
    /// Phi, proxy and fixed node results.
    bound: FxHashMap<NodeId, Value>,
    /// Floating values computed since the last binding change.
    cache: FxHashMap<NodeId, Value>,
    calls: Vec<(u32, Vec<i64>)>,
    safepoint_polls: usize,
    header_entries: FxHashMap<NodeId, u64>,
}

impl<'g> Interpreter<'g> {
    /// Interpreter over `graph`.
    pub fn new(graph: &'g Graph) -> Self {
        Interpreter {
            graph,
            step_limit: DEFAULT_STEP_LIMIT,
        }
    }

    /// Change the step budget.
    pub fn with_step_limit(mut self, limit: usize) -> Self {
        self.step_limit = limit;
        self
    }

    /// Run with the given arguments and initial arrays.
    pub fn run(&self, args: &[Value], heap: Vec<Vec<i64>>) -> Result<Execution, InterpError> {
        let g = self.graph;
        let mut frame = Frame {
            args,
            heap,
            bound: FxHashMap::default(),
            cache: FxHashMap::default(),
            calls: Vec::new(),
            safepoint_polls: 0,
            header_entries: FxHashMap::default(),
        };
        let mut current = g.start();
        let mut steps = 0usize;

        let outcome = loop {
            steps += 1;
            if steps > self.step_limit {
                return Err(InterpError::StepLimit(self.step_limit));
            }
            frame.cache.clear();

            if matches!(g.op(current), Operator::LoopExit) {
                let latched: Vec<(NodeId, Value)> = g
                    .proxies(current)
                    .into_iter()
                    .map(|p| Ok((p, self.eval(&mut frame, g.input(p, 1))?)))
                    .collect::<Result<_, InterpError>>()?;
                frame.bound.extend(latched);
                frame.cache.clear();
            }
            if g.op(current).is_begin() {
                if let Some(outcome) = self.check_anchored(&mut frame, current)? {
                    break outcome;
                }
            }

            let next = match g.op(current) {
                Operator::Start
                | Operator::Begin
                | Operator::Merge
                | Operator::LoopBegin(_)
                | Operator::LoopExit => g.next(current),
                Operator::End | Operator::LoopEnd { .. } => {
                    let merge = g.merge_of(current).ok_or(InterpError::Malformed {
                        node: current,
                        message: "end without merge",
                    })?;
                    let index = g.end_index(merge, current).unwrap_or(0);
                    let values: Vec<(NodeId, Value)> = g
                        .phis(merge)
                        .into_iter()
                        .map(|phi| Ok((phi, self.eval(&mut frame, g.phi_value(phi, index))?)))
                        .collect::<Result<_, InterpError>>()?;
                    frame.bound.extend(values);
                    if let Operator::LoopEnd { safepoint: true } = g.op(current) {
                        frame.safepoint_polls += 1;
                    }
                    if matches!(g.op(merge), Operator::LoopBegin(_)) {
                        *frame.header_entries.entry(merge).or_default() += 1;
                    }
                    Some(merge)
                }
                Operator::If { .. } => {
                    let cond = self.eval(&mut frame, g.input(current, 0))?.as_bool(current)?;
                    g.successor(current, if cond { 0 } else { 1 })
                }
                Operator::Switch(info) => {
                    let value = self.eval(&mut frame, g.input(current, 0))?.as_int(current)?;
                    g.successor(current, info.successor_for(value))
                }
                Operator::FixedGuard { info, negated } => {
                    let cond = self.eval(&mut frame, g.input(current, 0))?.as_bool(current)?;
                    if cond == *negated {
                        break Outcome::Deoptimized {
                            node: current,
                            reason: info.reason,
                            action: info.action,
                            speculation: info.speculation,
                        };
                    }
                    g.next(current)
                }
                Operator::LoadIndexed => {
                    let (array, index) = self.element(&mut frame, current)?;
                    let value = frame.heap[array][index];
                    frame.bound.insert(current, Value::Int(g.ty(current).wrap(value)));
                    g.next(current)
                }
                Operator::StoreIndexed => {
                    let (array, index) = self.element(&mut frame, current)?;
                    let value = self.eval(&mut frame, g.input(current, 2))?.as_int(current)?;
                    frame.heap[array][index] = value;
                    g.next(current)
                }
                Operator::Invoke { target, .. } => {
                    let mut args = Vec::with_capacity(g.inputs(current).len());
                    for &input in g.inputs(current) {
                        args.push(self.eval(&mut frame, input)?.as_int(current)?);
                    }
                    let result = args.iter().fold(*target as i64, |acc, &a| acc.wrapping_add(a));
                    frame.calls.push((*target, args));
                    frame.bound.insert(current, Value::Int(g.ty(current).wrap(result)));
                    g.next(current)
                }
                Operator::Deoptimize(info) => {
                    break Outcome::Deoptimized {
                        node: current,
                        reason: info.reason,
                        action: info.action,
                        speculation: info.speculation,
                    };
                }
                Operator::Return => {
                    let value = match g.inputs(current).first() {
                        Some(&v) => self.eval(&mut frame, v)?,
                        None => Value::Void,
                    };
                    break Outcome::Returned(value);
                }
                _ => {
                    return Err(InterpError::Malformed {
                        node: current,
                        message: "floating node in control flow",
                    })
                }
            };
            current = next.ok_or(InterpError::Malformed {
                node: current,
                message: "missing successor",
            })?;
        };

        Ok(Execution {
            outcome,
            heap: frame.heap,
            calls: frame.calls,
            steps,
            safepoint_polls: frame.safepoint_polls,
            header_entries: frame.header_entries,
        })
    }

    fn check_anchored(&self, frame: &mut Frame<'_>, begin: NodeId) -> Result<Option<Outcome>, InterpError> {
        let g = self.graph;
        for guard in g.anchored_guards(begin) {
            if let Operator::Guard { info, negated } = g.op(guard) {
                let cond = self.eval(frame, g.input(guard, 0))?.as_bool(guard)?;
                if cond == *negated {
                    return Ok(Some(Outcome::Deoptimized {
                        node: guard,
                        reason: info.reason,
                        action: info.action,
                        speculation: info.speculation,
                    }));
                }
            }
        }
        Ok(None)
    }

    fn element(&self, frame: &mut Frame<'_>, node: NodeId) -> Result<(usize, usize), InterpError> {
        let g = self.graph;
        let array = match self.eval(frame, g.input(node, 0))? {
            Value::Array(a) if a < frame.heap.len() => a,
            _ => return Err(InterpError::TypeMismatch { node }),
        };
        let index = self.eval(frame, g.input(node, 1))?.as_int(node)?;
        let length = frame.heap[array].len();
        if index < 0 || index as usize >= length {
            return Err(InterpError::OutOfBounds {
                node,
                index,
                length,
            });
        }
        Ok((array, index as usize))
    }

    fn eval(&self, frame: &mut Frame<'_>, node: NodeId) -> Result<Value, InterpError> {
        if let Some(&v) = frame.bound.get(&node) {
            return Ok(v);
        }
        if let Some(&v) = frame.cache.get(&node) {
            return Ok(v);
        }
        let g = self.graph;
        let ty = g.ty(node);
        let value = match g.op(node) {
            Operator::ConstInt(v) => Value::Int(*v),
            Operator::ConstBool(v) => Value::Bool(*v),
            Operator::Parameter(index) => frame
                .args
                .get(*index as usize)
                .copied()
                .map(|v| match (v, ty) {
                    (Value::Int(i), ValueType::Int32) => Value::Int(ty.wrap(i)),
                    _ => v,
                })
                .ok_or(InterpError::Malformed {
                    node,
                    message: "missing argument",
                })?,
            Operator::IntOp(op) => {
                let a = self.eval(frame, g.input(node, 0))?.as_int(node)?;
                let b = self.eval(frame, g.input(node, 1))?.as_int(node)?;
                Value::Int(op.eval(ty, a, b).ok_or(InterpError::DivisionByZero { node })?)
            }
            Operator::IntCmp(op) => {
                let lhs = g.input(node, 0);
                let bits = g.ty(lhs).bits().unwrap_or(64);
                let a = self.eval(frame, lhs)?.as_int(node)?;
                let b = self.eval(frame, g.input(node, 1))?.as_int(node)?;
                Value::Bool(op.eval(bits, a, b))
            }
            Operator::Logic(op) => {
                let a = self.eval(frame, g.input(node, 0))?.as_bool(node)?;
                let b = self.eval(frame, g.input(node, 1))?.as_bool(node)?;
                Value::Bool(match op {
                    LogicOp::And => a && b,
                    LogicOp::Or => a || b,
                })
            }
            Operator::Not => Value::Bool(!self.eval(frame, g.input(node, 0))?.as_bool(node)?),
            Operator::SignExtend => Value::Int(self.eval(frame, g.input(node, 0))?.as_int(node)?),
            Operator::ArrayLength => match self.eval(frame, g.input(node, 0))? {
                Value::Array(a) if a < frame.heap.len() => Value::Int(frame.heap[a].len() as i64),
                _ => return Err(InterpError::TypeMismatch { node }),
            },
            Operator::InstanceOf(class) => match self.eval(frame, g.input(node, 0))? {
                Value::Object(c) => Value::Bool(c == *class),
                _ => Value::Bool(false),
            },
            Operator::Phi | Operator::Proxy => {
                return Err(InterpError::Malformed {
                    node,
                    message: "value read before its merge or exit executed",
                })
            }
            _ => {
                return Err(InterpError::Malformed {
                    node,
                    message: "node has no value",
                })
            }
        };
        frame.cache.insert(node, value);
        Ok(value)
    }
}
