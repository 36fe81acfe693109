//! Node kinds of the loop IR.
//!
//! [`Operator`] is a closed sum type. Every transformation matches on it
//! exhaustively, so adding a kind means revisiting the engine on purpose.
//!
//! # Control vs floating
//!
//! *Fixed* nodes have a position in control flow: one predecessor and a
//! statically known number of successors. *Floating* nodes are pure values
//! (plus floating guards and frame states) scheduled by their inputs.
//!
//! ```text
//!   Start ─► ... ─► End ─► LoopBegin ─► If ─┬─► Begin ─► body ─► LoopEnd
//!                                            └─► LoopExit ─► continuation
//! ```

use super::deopt::DeoptInfo;
use super::types::ValueType;

// =============================================================================
// Arithmetic
// =============================================================================

/// Binary integer operation. Wraps at the width of the node's type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ArithOp {
    /// a + b
    Add = 0,
    /// a - b
    Sub = 1,
    /// a * b
    Mul = 2,
    /// Truncating signed division; folding refuses a zero divisor.
    Div = 3,
    /// Signed minimum.
    Min = 4,
    /// Signed maximum.
    Max = 5,
}

impl ArithOp {
    /// Whether operands may be swapped.
    #[inline]
    pub const fn is_commutative(self) -> bool {
        matches!(self, ArithOp::Add | ArithOp::Mul | ArithOp::Min | ArithOp::Max)
    }

    /// Evaluate on concrete operands, wrapping to `ty`.
    ///
    /// Returns `None` for division by zero.
    pub fn eval(self, ty: ValueType, a: i64, b: i64) -> Option<i64> {
        let raw = match self {
            ArithOp::Add => a.wrapping_add(b),
            ArithOp::Sub => a.wrapping_sub(b),
            ArithOp::Mul => a.wrapping_mul(b),
            ArithOp::Div => {
                if b == 0 {
                    return None;
                }
                a.wrapping_div(b)
            }
            ArithOp::Min => a.min(b),
            ArithOp::Max => a.max(b),
        };
        Some(ty.wrap(raw))
    }

    /// Mnemonic.
    pub const fn symbol(self) -> &'static str {
        match self {
            ArithOp::Add => "+",
            ArithOp::Sub => "-",
            ArithOp::Mul => "*",
            ArithOp::Div => "/",
            ArithOp::Min => "min",
            ArithOp::Max => "max",
        }
    }
}

// =============================================================================
// Comparison
// =============================================================================

/// Integer comparison producing a boolean.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CmpOp {
    /// a < b
    Lt = 0,
    /// a <= b
    Le = 1,
    /// a == b
    Eq = 2,
    /// a != b
    Ne = 3,
    /// a > b
    Gt = 4,
    /// a >= b
    Ge = 5,
    /// Unsigned a < b; the shape of a range check `index |<| length`.
    Below = 6,
}

impl CmpOp {
    /// Comparison with the opposite outcome, if expressible.
    #[inline]
    pub const fn negate(self) -> Option<Self> {
        Some(match self {
            CmpOp::Lt => CmpOp::Ge,
            CmpOp::Le => CmpOp::Gt,
            CmpOp::Eq => CmpOp::Ne,
            CmpOp::Ne => CmpOp::Eq,
            CmpOp::Gt => CmpOp::Le,
            CmpOp::Ge => CmpOp::Lt,
            CmpOp::Below => return None,
        })
    }

    /// Comparison with swapped operands, if expressible.
    #[inline]
    pub const fn mirror(self) -> Option<Self> {
        Some(match self {
            CmpOp::Lt => CmpOp::Gt,
            CmpOp::Le => CmpOp::Ge,
            CmpOp::Eq => CmpOp::Eq,
            CmpOp::Ne => CmpOp::Ne,
            CmpOp::Gt => CmpOp::Lt,
            CmpOp::Ge => CmpOp::Le,
            CmpOp::Below => return None,
        })
    }

    /// Evaluate on operands of the given width.
    pub fn eval(self, bits: u32, a: i64, b: i64) -> bool {
        match self {
            CmpOp::Lt => a < b,
            CmpOp::Le => a <= b,
            CmpOp::Eq => a == b,
            CmpOp::Ne => a != b,
            CmpOp::Gt => a > b,
            CmpOp::Ge => a >= b,
            CmpOp::Below => {
                if bits == 32 {
                    (a as u32) < (b as u32)
                } else {
                    (a as u64) < (b as u64)
                }
            }
        }
    }

    /// Mnemonic.
    pub const fn symbol(self) -> &'static str {
        match self {
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
            CmpOp::Below => "|<|",
        }
    }
}

/// Short-circuit-free boolean combination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogicOp {
    /// a && b
    And,
    /// a || b
    Or,
}

// =============================================================================
// Loop Metadata
// =============================================================================

/// Role of a loop produced by the pre/main/post split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LoopKind {
    /// Not split.
    #[default]
    Normal,
    /// Runs at most one iteration ahead of the main loop.
    Pre,
    /// Bulk of the iterations; target of partial unrolling.
    Main,
    /// Remainder iterations after the main loop.
    Post,
}

/// Per-loop data stored on the `LoopBegin` node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoopInfo {
    /// Pre/main/post role.
    pub kind: LoopKind,
    /// Original iterations executed per pass through the body.
    pub unroll_factor: u32,
    /// Expected iterations per entry into the loop.
    pub frequency: f64,
    /// Times this loop was peeled.
    pub peelings: u32,
    /// Times this loop was unswitched.
    pub unswitches: u32,
}

impl LoopInfo {
    /// Default frequency when nothing is known about a loop.
    pub const DEFAULT_FREQUENCY: f64 = 10.0;

    /// Fresh metadata with the given expected iteration count.
    pub fn with_frequency(frequency: f64) -> Self {
        LoopInfo {
            kind: LoopKind::Normal,
            unroll_factor: 1,
            frequency: frequency.max(1.0),
            peelings: 0,
            unswitches: 0,
        }
    }

    /// Loops never split into pre/main/post.
    pub fn is_simple_loop(&self) -> bool {
        self.kind == LoopKind::Normal
    }
}

impl Default for LoopInfo {
    fn default() -> Self {
        Self::with_frequency(Self::DEFAULT_FREQUENCY)
    }
}

/// Interpreter snapshot layout; values are the node's inputs in
/// locals, stack, locks order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameStateInfo {
    /// Bytecode index execution resumes at.
    pub bci: u32,
    /// Number of local slots.
    pub locals: u16,
    /// Number of operand stack slots.
    pub stack: u16,
    /// Number of locked monitors.
    pub locks: u16,
}

/// Keys and successor probabilities of an integer switch.
///
/// Successor `i` handles `keys[i]`; the last successor is the default.
#[derive(Debug, Clone, PartialEq)]
pub struct SwitchInfo {
    /// Case keys.
    pub keys: Vec<i64>,
    /// One probability per successor (keys, then default).
    pub probabilities: Vec<f64>,
}

impl SwitchInfo {
    /// Successor taken for `value`.
    pub fn successor_for(&self, value: i64) -> usize {
        self.keys
            .iter()
            .position(|&k| k == value)
            .unwrap_or(self.keys.len())
    }
}

// =============================================================================
// Operator
// =============================================================================

/// Kind-specific payload of a node.
#[derive(Debug, Clone, PartialEq)]
pub enum Operator {
    // ---- fixed: begin nodes -------------------------------------------------
    /// Graph entry.
    Start,
    /// Block entry after a split, or a leftover straight-line begin.
    Begin,
    /// Join; inputs are `End` nodes.
    Merge,
    /// Loop header; inputs are `[forward End, LoopEnd...]`.
    LoopBegin(LoopInfo),
    /// Exit edge of a loop; input is the `LoopBegin`.
    LoopExit,

    // ---- fixed: ends and splits ---------------------------------------------
    /// Forward edge into a merge.
    End,
    /// Back edge into a loop header.
    LoopEnd {
        /// Whether the back edge polls for safepoints.
        safepoint: bool,
    },
    /// Two-way split on a boolean.
    If {
        /// Probability of the true successor.
        true_probability: f64,
    },
    /// Multi-way split on an integer.
    Switch(SwitchInfo),

    // ---- fixed: straight line ----------------------------------------------
    /// Guard at a fixed position.
    FixedGuard {
        /// Deopt metadata.
        info: DeoptInfo,
        /// Passes when the condition is false instead of true.
        negated: bool,
    },
    /// Reads `array[index]`.
    LoadIndexed,
    /// Writes `array[index] = value`.
    StoreIndexed,
    /// Call; the result is an int.
    Invoke {
        /// Callee identity.
        target: u32,
        /// Whether the callee is known to poll for safepoints.
        safepoint: bool,
    },

    // ---- fixed: terminals ---------------------------------------------------
    /// Unconditional transfer to the interpreter.
    Deoptimize(DeoptInfo),
    /// Method return; optional value input.
    Return,

    // ---- floating -----------------------------------------------------------
    /// Guard anchored at a begin node; inputs are `[condition, anchor]`.
    Guard {
        /// Deopt metadata.
        info: DeoptInfo,
        /// Passes when the condition is false instead of true.
        negated: bool,
    },
    /// Merge value; inputs are `[merge, values...]`.
    Phi,
    /// Value leaving a loop; inputs are `[exit, value]`.
    Proxy,
    /// Interpreter snapshot.
    FrameState(FrameStateInfo),
    /// Integer constant.
    ConstInt(i64),
    /// Boolean constant.
    ConstBool(bool),
    /// Method parameter.
    Parameter(u16),
    /// Binary integer arithmetic.
    IntOp(ArithOp),
    /// Integer comparison.
    IntCmp(CmpOp),
    /// Boolean combination.
    Logic(LogicOp),
    /// Boolean negation.
    Not,
    /// Widens an `Int32` to `Int64`.
    SignExtend,
    /// Length of an array; never negative.
    ArrayLength,
    /// Type test against a class id.
    InstanceOf(u32),
}

impl Operator {
    /// Whether the node has a control-flow position.
    #[inline]
    pub fn is_fixed(&self) -> bool {
        matches!(
            self,
            Operator::Start
                | Operator::Begin
                | Operator::Merge
                | Operator::LoopBegin(_)
                | Operator::LoopExit
                | Operator::End
                | Operator::LoopEnd { .. }
                | Operator::If { .. }
                | Operator::Switch(_)
                | Operator::FixedGuard { .. }
                | Operator::LoadIndexed
                | Operator::StoreIndexed
                | Operator::Invoke { .. }
                | Operator::Deoptimize(_)
                | Operator::Return
        )
    }

    /// Whether the node is floating.
    #[inline]
    pub fn is_floating(&self) -> bool {
        !self.is_fixed()
    }

    /// Nodes that start a block.
    #[inline]
    pub fn is_begin(&self) -> bool {
        matches!(
            self,
            Operator::Start
                | Operator::Begin
                | Operator::Merge
                | Operator::LoopBegin(_)
                | Operator::LoopExit
        )
    }

    /// Join points whose inputs are end nodes.
    #[inline]
    pub fn is_merge(&self) -> bool {
        matches!(self, Operator::Merge | Operator::LoopBegin(_))
    }

    /// Forward or backward ends.
    #[inline]
    pub fn is_end(&self) -> bool {
        matches!(self, Operator::End | Operator::LoopEnd { .. })
    }

    /// Multi-successor nodes.
    #[inline]
    pub fn is_control_split(&self) -> bool {
        matches!(self, Operator::If { .. } | Operator::Switch(_))
    }

    /// Nodes ending a method.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Operator::Return | Operator::Deoptimize(_))
    }

    /// Number of successor slots.
    pub fn successor_count(&self) -> usize {
        match self {
            Operator::If { .. } => 2,
            Operator::Switch(info) => info.keys.len() + 1,
            Operator::End
            | Operator::LoopEnd { .. }
            | Operator::Deoptimize(_)
            | Operator::Return => 0,
            op if op.is_fixed() => 1,
            _ => 0,
        }
    }

    /// Fixed nodes with exactly one `next` successor.
    #[inline]
    pub fn has_next(&self) -> bool {
        self.is_fixed() && !self.is_control_split() && self.successor_count() == 1
    }

    /// Fixed nodes whose effects must stay ordered.
    #[inline]
    pub fn has_side_effect(&self) -> bool {
        matches!(self, Operator::StoreIndexed | Operator::Invoke { .. })
    }

    /// Guards of either flavour.
    #[inline]
    pub fn is_guard(&self) -> bool {
        matches!(self, Operator::Guard { .. } | Operator::FixedGuard { .. })
    }

    /// Deopt metadata of guards and deopts.
    pub fn deopt_info(&self) -> Option<&DeoptInfo> {
        match self {
            Operator::Guard { info, .. }
            | Operator::FixedGuard { info, .. }
            | Operator::Deoptimize(info) => Some(info),
            _ => None,
        }
    }

    /// Mutable deopt metadata.
    pub fn deopt_info_mut(&mut self) -> Option<&mut DeoptInfo> {
        match self {
            Operator::Guard { info, .. }
            | Operator::FixedGuard { info, .. }
            | Operator::Deoptimize(info) => Some(info),
            _ => None,
        }
    }

    /// Short name for dumps and logs.
    pub fn name(&self) -> &'static str {
        match self {
            Operator::Start => "Start",
            Operator::Begin => "Begin",
            Operator::Merge => "Merge",
            Operator::LoopBegin(_) => "LoopBegin",
            Operator::LoopExit => "LoopExit",
            Operator::End => "End",
            Operator::LoopEnd { .. } => "LoopEnd",
            Operator::If { .. } => "If",
            Operator::Switch(_) => "Switch",
            Operator::FixedGuard { .. } => "FixedGuard",
            Operator::LoadIndexed => "LoadIndexed",
            Operator::StoreIndexed => "StoreIndexed",
            Operator::Invoke { .. } => "Invoke",
            Operator::Deoptimize(_) => "Deoptimize",
            Operator::Return => "Return",
            Operator::Guard { .. } => "Guard",
            Operator::Phi => "Phi",
            Operator::Proxy => "Proxy",
            Operator::FrameState(_) => "FrameState",
            Operator::ConstInt(_) => "ConstInt",
            Operator::ConstBool(_) => "ConstBool",
            Operator::Parameter(_) => "Parameter",
            Operator::IntOp(_) => "IntOp",
            Operator::IntCmp(_) => "IntCmp",
            Operator::Logic(_) => "Logic",
            Operator::Not => "Not",
            Operator::SignExtend => "SignExtend",
            Operator::ArrayLength => "ArrayLength",
            Operator::InstanceOf(_) => "InstanceOf",
        }
    }
}
