//! Integer range stamps.
//!
//! A stamp is a conservative `[lower, upper]` interval for an integer node
//! at a given bit width. The loop engine uses stamps to prove that
//! counters cannot overflow, that array bounds are non-negative, and that
//! values fit in 32 bits before rewriting guards in 64-bit arithmetic.

use super::graph::Graph;
use super::node::NodeId;
use super::operators::{ArithOp, Operator};
use super::types::ValueType;

/// Recursion limit when deriving stamps through expression trees.
const MAX_STAMP_DEPTH: u32 = 16;

/// Conservative value range of an integer node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IntegerStamp {
    /// Bit width, 32 or 64.
    pub bits: u32,
    /// Smallest possible value.
    pub lower: i64,
    /// Largest possible value.
    pub upper: i64,
}

impl IntegerStamp {
    /// Full range of a width.
    pub const fn unrestricted(bits: u32) -> Self {
        IntegerStamp {
            bits,
            lower: Self::min_value(bits),
            upper: Self::max_value(bits),
        }
    }

    /// Range `[lower, upper]`.
    ///
    /// # Panics
    ///
    /// If the bounds are inverted or exceed the width.
    pub fn new(bits: u32, lower: i64, upper: i64) -> Self {
        assert!(lower <= upper, "empty stamp [{lower}, {upper}]");
        assert!(
            lower >= Self::min_value(bits) && upper <= Self::max_value(bits),
            "stamp [{lower}, {upper}] exceeds {bits} bits"
        );
        IntegerStamp { bits, lower, upper }
    }

    /// Single value.
    pub fn constant(bits: u32, value: i64) -> Self {
        Self::new(bits, value, value)
    }

    /// Smallest value of a width.
    pub const fn min_value(bits: u32) -> i64 {
        if bits >= 64 {
            i64::MIN
        } else {
            -(1i64 << (bits - 1))
        }
    }

    /// Largest value of a width.
    pub const fn max_value(bits: u32) -> i64 {
        if bits >= 64 {
            i64::MAX
        } else {
            (1i64 << (bits - 1)) - 1
        }
    }

    /// Whether the stamp is a single value.
    pub fn as_constant(&self) -> Option<i64> {
        (self.lower == self.upper).then_some(self.lower)
    }

    /// Whether every value is `>= 0`.
    pub fn is_non_negative(&self) -> bool {
        self.lower >= 0
    }

    /// Whether every value is representable in `bits` bits.
    pub fn fits_in(&self, bits: u32) -> bool {
        self.lower >= Self::min_value(bits) && self.upper <= Self::max_value(bits)
    }

    /// Smallest stamp containing both.
    pub fn meet(&self, other: &IntegerStamp) -> IntegerStamp {
        IntegerStamp {
            bits: self.bits.max(other.bits),
            lower: self.lower.min(other.lower),
            upper: self.upper.max(other.upper),
        }
    }

    /// Same range at a wider width.
    pub fn sign_extend(&self, bits: u32) -> IntegerStamp {
        IntegerStamp { bits, ..*self }
    }

    /// Result range of `self op other`, or the full range if the operation
    /// may wrap.
    pub fn apply(&self, op: ArithOp, other: &IntegerStamp) -> IntegerStamp {
        let bits = self.bits.max(other.bits);
        let (lo, hi) = (self.lower as i128, self.upper as i128);
        let (olo, ohi) = (other.lower as i128, other.upper as i128);
        let (lower, upper) = match op {
            ArithOp::Add => (lo + olo, hi + ohi),
            ArithOp::Sub => (lo - ohi, hi - olo),
            ArithOp::Mul => {
                let products = [lo * olo, lo * ohi, hi * olo, hi * ohi];
                (
                    products.iter().copied().min().unwrap_or(0),
                    products.iter().copied().max().unwrap_or(0),
                )
            }
            ArithOp::Min => (lo.min(olo), hi.min(ohi)),
            ArithOp::Max => (lo.max(olo), hi.max(ohi)),
            ArithOp::Div => return IntegerStamp::unrestricted(bits),
        };
        if lower < Self::min_value(bits) as i128 || upper > Self::max_value(bits) as i128 {
            return IntegerStamp::unrestricted(bits);
        }
        IntegerStamp {
            bits,
            lower: lower as i64,
            upper: upper as i64,
        }
    }
}

impl Graph {
    /// Stamp of an integer node; `None` for non-integers.
    pub fn stamp(&self, id: NodeId) -> Option<IntegerStamp> {
        self.stamp_at_depth(id, 0)
    }

    fn stamp_at_depth(&self, id: NodeId, depth: u32) -> Option<IntegerStamp> {
        let bits = self.ty(id).bits()?;
        if depth > MAX_STAMP_DEPTH {
            return Some(IntegerStamp::unrestricted(bits));
        }
        let stamp = match self.op(id) {
            Operator::ConstInt(v) => IntegerStamp::constant(bits, *v),
            Operator::Parameter(index) => self
                .parameters()
                .get(*index as usize)
                .and_then(|p| p.stamp)
                .unwrap_or_else(|| IntegerStamp::unrestricted(bits)),
            Operator::ArrayLength => IntegerStamp::new(bits, 0, i32::MAX as i64),
            Operator::IntOp(op) => {
                let a = self.stamp_at_depth(self.input(id, 0), depth + 1)?;
                let b = self.stamp_at_depth(self.input(id, 1), depth + 1)?;
                a.apply(*op, &b)
            }
            Operator::SignExtend => self
                .stamp_at_depth(self.input(id, 0), depth + 1)?
                .sign_extend(bits),
            Operator::Proxy => self.stamp_at_depth(self.input(id, 1), depth + 1)?,
            _ => IntegerStamp::unrestricted(bits),
        };
        Some(stamp)
    }

    /// Whether the node is a 32-bit-representable integer.
    pub fn fits_in_int(&self, id: NodeId) -> bool {
        self.ty(id) == ValueType::Int32 || self.stamp(id).is_some_and(|s| s.fits_in(32))
    }
}
