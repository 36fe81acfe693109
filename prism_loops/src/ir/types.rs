//! Value types carried by IR nodes.
//!
//! The loop engine only needs to tell integers of different widths apart
//! (counter overflow is width dependent), booleans produced by
//! comparisons, references, and the non-value kinds used by control and
//! frame-state nodes.

use std::fmt;

/// Result type of a node.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum ValueType {
    /// Produces nothing (control nodes, stores, guards).
    #[default]
    Void = 0,
    /// 32-bit two's complement integer; arithmetic wraps at 32 bits.
    Int32 = 1,
    /// 64-bit two's complement integer.
    Int64 = 2,
    /// Result of a comparison or logic node.
    Bool = 3,
    /// Object reference.
    Object = 4,
    /// Array reference.
    Array = 5,
    /// Deoptimization snapshot.
    State = 6,
}

impl ValueType {
    /// Whether this is one of the integer types.
    #[inline]
    pub const fn is_int(self) -> bool {
        matches!(self, ValueType::Int32 | ValueType::Int64)
    }

    /// Bit width of an integer type.
    #[inline]
    pub const fn bits(self) -> Option<u32> {
        match self {
            ValueType::Int32 => Some(32),
            ValueType::Int64 => Some(64),
            _ => None,
        }
    }

    /// Whether the type denotes a reference.
    #[inline]
    pub const fn is_reference(self) -> bool {
        matches!(self, ValueType::Object | ValueType::Array)
    }

    /// Wrap `value` to the width of this type.
    ///
    /// Non-integer types pass the value through untouched.
    #[inline]
    pub const fn wrap(self, value: i64) -> i64 {
        match self {
            ValueType::Int32 => value as i32 as i64,
            _ => value,
        }
    }

    /// Short name used by `Debug` output.
    pub const fn name(self) -> &'static str {
        match self {
            ValueType::Void => "void",
            ValueType::Int32 => "i32",
            ValueType::Int64 => "i64",
            ValueType::Bool => "bool",
            ValueType::Object => "object",
            ValueType::Array => "array",
            ValueType::State => "state",
        }
    }
}

impl fmt::Debug for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
