//! Induction variable detection.
//!
//! An induction variable (IV) is an integer value that advances by a
//! constant stride on every iteration of its loop:
//!
//! - **Basic**: a loop phi whose back-edge values are all the same
//!   `phi ± c` chain, e.g. `i' = (i + 1) + 1`
//! - **Offset**: `iv + inv`, `iv - inv` or `inv - iv` for a loop-invariant
//!   `inv`
//! - **Scaled**: `iv * c` for a constant `c`
//!
//! Derived IVs are found by a fixed point over the in-loop users of the
//! IVs already known. Strides are compile-time constants; arithmetic on the
//! IV values wraps at the width of the IV, so the value at iteration `k` is
//! always `wrap(init + k * stride)`.

use rustc_hash::FxHashMap;

use crate::ir::{ArithOp, Graph, IntegerStamp, NodeId, Operator, ValueType};

/// Longest `phi ± c` chain accepted as a basic IV update.
const MAX_OFFSET_CHAIN: usize = 32;

// =============================================================================
// Types
// =============================================================================

/// Sign of a stride.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Positive stride.
    Up,
    /// Negative stride.
    Down,
}

impl Direction {
    /// Direction of a nonzero stride.
    #[inline]
    pub fn of(stride: i64) -> Self {
        if stride > 0 {
            Direction::Up
        } else {
            Direction::Down
        }
    }
}

/// How an offset IV combines its base with the invariant operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OffsetForm {
    /// `base + offset`
    Add,
    /// `base - offset`
    Sub,
    /// `offset - base`
    SubFrom,
}

/// Shape of an induction variable.
#[derive(Debug, Clone, PartialEq)]
pub enum IvKind {
    /// Loop phi.
    Basic {
        /// The phi.
        phi: NodeId,
    },
    /// Base IV combined with an invariant.
    Offset {
        /// IV the value is derived from.
        base: Box<InductionVariable>,
        /// Loop-invariant operand.
        offset: NodeId,
        /// Operand order and operation.
        form: OffsetForm,
    },
    /// Base IV times a constant.
    Scaled {
        /// IV the value is derived from.
        base: Box<InductionVariable>,
        /// Constant factor.
        scale: i64,
    },
}

/// An induction variable of one loop.
#[derive(Debug, Clone, PartialEq)]
pub struct InductionVariable {
    /// Node holding the IV value inside the loop.
    pub node: NodeId,
    /// Shape.
    pub kind: IvKind,
    /// Change per iteration; never zero.
    pub stride: i64,
    /// Integer type of the value.
    pub ty: ValueType,
}

impl InductionVariable {
    /// Sign of the stride.
    #[inline]
    pub fn direction(&self) -> Direction {
        Direction::of(self.stride)
    }

    /// Whether the IV is a loop phi.
    #[inline]
    pub fn is_basic(&self) -> bool {
        matches!(self.kind, IvKind::Basic { .. })
    }

    /// The basic IV at the root of the derivation.
    pub fn root_phi(&self) -> NodeId {
        match &self.kind {
            IvKind::Basic { phi } => *phi,
            IvKind::Offset { base, .. } | IvKind::Scaled { base, .. } => base.root_phi(),
        }
    }

    /// Node computing the value on entry to the first iteration.
    ///
    /// For derived IVs fresh arithmetic is created outside the loop.
    pub fn init_node(&self, graph: &mut Graph) -> NodeId {
        match &self.kind {
            IvKind::Basic { phi } => graph.phi_value(*phi, 0),
            IvKind::Offset { base, offset, form } => {
                let b = base.init_node(graph);
                match form {
                    OffsetForm::Add => graph.arith(ArithOp::Add, b, *offset, self.ty),
                    OffsetForm::Sub => graph.arith(ArithOp::Sub, b, *offset, self.ty),
                    OffsetForm::SubFrom => graph.arith(ArithOp::Sub, *offset, b, self.ty),
                }
            }
            IvKind::Scaled { base, scale } => {
                let b = base.init_node(graph);
                let c = graph.const_int(*scale, self.ty);
                graph.arith(ArithOp::Mul, b, c, self.ty)
            }
        }
    }

    /// Initial value when it is a compile-time constant.
    pub fn const_init(&self, graph: &Graph) -> Option<i64> {
        match &self.kind {
            IvKind::Basic { phi } => graph.node(graph.phi_value(*phi, 0)).as_int(),
            IvKind::Offset { base, offset, form } => {
                let b = base.const_init(graph)?;
                let o = graph.node(*offset).as_int()?;
                match form {
                    OffsetForm::Add => ArithOp::Add.eval(self.ty, b, o),
                    OffsetForm::Sub => ArithOp::Sub.eval(self.ty, b, o),
                    OffsetForm::SubFrom => ArithOp::Sub.eval(self.ty, o, b),
                }
            }
            IvKind::Scaled { base, scale } => {
                ArithOp::Mul.eval(self.ty, base.const_init(graph)?, *scale)
            }
        }
    }

    /// Range of the initial value.
    pub fn init_stamp(&self, graph: &Graph) -> Option<IntegerStamp> {
        match &self.kind {
            IvKind::Basic { phi } => graph.stamp(graph.phi_value(*phi, 0)),
            IvKind::Offset { base, offset, form } => {
                let b = base.init_stamp(graph)?;
                let o = graph.stamp(*offset)?;
                Some(match form {
                    OffsetForm::Add => b.apply(ArithOp::Add, &o),
                    OffsetForm::Sub => b.apply(ArithOp::Sub, &o),
                    OffsetForm::SubFrom => o.apply(ArithOp::Sub, &b),
                })
            }
            IvKind::Scaled { base, scale } => {
                let bits = self.ty.bits()?;
                let b = base.init_stamp(graph)?;
                Some(b.apply(ArithOp::Mul, &IntegerStamp::constant(bits, *scale)))
            }
        }
    }

    /// Range of the IV over its first `steps + 1` iterations, or `None` when
    /// some value on the way may wrap.
    ///
    /// `counter` gives the range already known for one basic IV phi.
    pub fn value_range(
        &self,
        graph: &Graph,
        counter: Option<(NodeId, i128, i128)>,
        steps: i128,
    ) -> Option<(i128, i128)> {
        let bits = self.ty.bits()?;
        let (lower, upper) = match &self.kind {
            IvKind::Basic { phi } => match counter {
                Some((counter_phi, lower, upper)) if counter_phi == *phi => (lower, upper),
                _ => {
                    let init = graph.stamp(graph.phi_value(*phi, 0))?;
                    let travel = (self.stride as i128).saturating_mul(steps);
                    (init.lower as i128 + travel.min(0), init.upper as i128 + travel.max(0))
                }
            },
            IvKind::Offset { base, offset, form } => {
                let (lo, hi) = base.value_range(graph, counter, steps)?;
                let o = graph.stamp(*offset)?;
                let (olo, ohi) = (o.lower as i128, o.upper as i128);
                match form {
                    OffsetForm::Add => (lo + olo, hi + ohi),
                    OffsetForm::Sub => (lo - ohi, hi - olo),
                    OffsetForm::SubFrom => (olo - hi, ohi - lo),
                }
            }
            IvKind::Scaled { base, scale } => {
                let (lo, hi) = base.value_range(graph, counter, steps)?;
                let s = *scale as i128;
                ((lo * s).min(hi * s), (lo * s).max(hi * s))
            }
        };
        let fits = lower >= IntegerStamp::min_value(bits) as i128
            && upper <= IntegerStamp::max_value(bits) as i128;
        fits.then_some((lower, upper))
    }

    /// 64-bit value in the iteration after `trip - 1` full strides:
    /// `sext(init) + stride * (trip - 1)`.
    ///
    /// `trip` must be an `Int64` node.
    pub fn extremum_node(&self, graph: &mut Graph, trip: NodeId) -> NodeId {
        let init = self.init_node(graph);
        let init = graph.sign_extend(init);
        let one = graph.const_int(1, ValueType::Int64);
        let steps = graph.arith(ArithOp::Sub, trip, one, ValueType::Int64);
        let stride = graph.const_int(self.stride, ValueType::Int64);
        let distance = graph.arith(ArithOp::Mul, stride, steps, ValueType::Int64);
        graph.arith(ArithOp::Add, init, distance, ValueType::Int64)
    }
}

// =============================================================================
// Detection
// =============================================================================

/// Every IV of the loop headed by `begin`, keyed by node.
///
/// `in_loop` selects the nodes computed inside the loop; everything else is
/// treated as invariant.
pub fn detect_induction_variables(
    graph: &Graph,
    begin: NodeId,
    in_loop: impl Fn(NodeId) -> bool,
) -> FxHashMap<NodeId, InductionVariable> {
    let mut ivs = FxHashMap::default();
    let mut worklist = Vec::new();
    for phi in graph.phis(begin) {
        if let Some(iv) = basic_iv(graph, phi) {
            worklist.push(phi);
            ivs.insert(phi, iv);
        }
    }

    while let Some(node) = worklist.pop() {
        let base = ivs[&node].clone();
        for user in graph.users(node) {
            if ivs.contains_key(&user) || !in_loop(user) || graph.ty(user) != base.ty {
                continue;
            }
            if let Some(iv) = derived_iv(graph, user, &base, &in_loop) {
                worklist.push(user);
                ivs.insert(user, iv);
            }
        }
    }
    ivs
}

fn basic_iv(graph: &Graph, phi: NodeId) -> Option<InductionVariable> {
    let ty = graph.ty(phi);
    if !ty.is_int() || graph.inputs(phi).len() < 3 {
        return None;
    }
    let back = graph.phi_value(phi, 1);
    if graph.inputs(phi)[2..].iter().any(|&v| v != back) {
        return None;
    }

    let mut stride = 0i64;
    let mut current = back;
    for _ in 0..MAX_OFFSET_CHAIN {
        if current == phi {
            let stride = ty.wrap(stride);
            return (stride != 0).then_some(InductionVariable {
                node: phi,
                kind: IvKind::Basic { phi },
                stride,
                ty,
            });
        }
        let (x, c) = match graph.op(current) {
            Operator::IntOp(ArithOp::Add) => {
                let (a, b) = (graph.input(current, 0), graph.input(current, 1));
                match (graph.node(a).as_int(), graph.node(b).as_int()) {
                    (_, Some(c)) => (a, c),
                    (Some(c), None) => (b, c),
                    (None, None) => return None,
                }
            }
            Operator::IntOp(ArithOp::Sub) => {
                let c = graph.node(graph.input(current, 1)).as_int()?;
                (graph.input(current, 0), c.wrapping_neg())
            }
            _ => return None,
        };
        stride = stride.wrapping_add(c);
        current = x;
    }
    None
}

fn derived_iv(
    graph: &Graph,
    node: NodeId,
    base: &InductionVariable,
    in_loop: &impl Fn(NodeId) -> bool,
) -> Option<InductionVariable> {
    let (a, b) = match graph.op(node) {
        Operator::IntOp(_) => (graph.input(node, 0), graph.input(node, 1)),
        _ => return None,
    };
    let other = if a == base.node { b } else { a };
    if other == base.node || in_loop(other) {
        return None;
    }
    let boxed = || Box::new(base.clone());
    let (kind, stride) = match graph.op(node) {
        Operator::IntOp(ArithOp::Add) => (
            IvKind::Offset {
                base: boxed(),
                offset: other,
                form: OffsetForm::Add,
            },
            base.stride,
        ),
        Operator::IntOp(ArithOp::Sub) if a == base.node => (
            IvKind::Offset {
                base: boxed(),
                offset: other,
                form: OffsetForm::Sub,
            },
            base.stride,
        ),
        Operator::IntOp(ArithOp::Sub) => (
            IvKind::Offset {
                base: boxed(),
                offset: other,
                form: OffsetForm::SubFrom,
            },
            base.stride.checked_neg()?,
        ),
        Operator::IntOp(ArithOp::Mul) => {
            let scale = graph.node(other).as_int()?;
            let stride = base.stride.checked_mul(scale)?;
            if base.ty.wrap(stride) != stride {
                return None;
            }
            (
                IvKind::Scaled {
                    base: boxed(),
                    scale,
                },
                stride,
            )
        }
        _ => return None,
    };
    (stride != 0 && base.ty.wrap(stride) == stride).then_some(InductionVariable {
        node,
        kind,
        stride,
        ty: base.ty,
    })
}
