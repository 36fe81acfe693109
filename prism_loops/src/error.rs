//! Error types of the loop engine.
//!
//! Two classes exist:
//!
//! - [`LoopError::Bailout`]: a budget was exceeded or a runtime precondition
//!   check failed. Only the current phase attempt is abandoned; the graph
//!   is still correct and the compilation may continue without the
//!   optimization.
//! - [`LoopError::Invariant`]: the graph or a transformation broke an
//!   internal invariant. This is an engine bug and fatal to the
//!   compilation.
//!
//! Precondition violations of the public transformation entry points are
//! caller bugs and panic instead of producing an error.

use std::fmt;

use thiserror::Error;

/// Build a [`LoopError::Invariant`] tagged with the source location.
macro_rules! invariant_error {
    ($msg:expr) => {
        crate::error::LoopError::Invariant {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };
    ($fmt:expr, $($arg:tt)*) => {
        crate::error::LoopError::Invariant {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

pub(crate) use invariant_error;

/// Why a transformation gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BailoutReason {
    /// Full unrolling peeled more often than allowed.
    UnrollIterationLimit {
        /// Peels performed.
        iterations: u32,
        /// Configured maximum.
        limit: u32,
    },
    /// The graph grew past the phase's size budget.
    GraphSizeLimit {
        /// Live nodes now.
        size: usize,
        /// Budget derived from the size before the phase.
        limit: usize,
    },
    /// Multiplying the stride by the unroll factor overflowed.
    StrideOverflow {
        /// Stride of the loop.
        stride: i64,
        /// Factor it was multiplied by.
        factor: u32,
    },
}

impl fmt::Display for BailoutReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BailoutReason::UnrollIterationLimit { iterations, limit } => write!(
                f,
                "full unroll exceeded {} iterations ({} peeled)",
                limit, iterations
            ),
            BailoutReason::GraphSizeLimit { size, limit } => {
                write!(f, "graph grew to {} nodes, budget is {}", size, limit)
            }
            BailoutReason::StrideOverflow { stride, factor } => {
                write!(f, "stride {} times {} overflows", stride, factor)
            }
        }
    }
}

/// Error produced by loop analysis, transformations and phases.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoopError {
    /// Retryable: the optimization was abandoned, the graph is intact.
    #[error("bailout: {0}")]
    Bailout(BailoutReason),

    /// Fatal: an internal consistency check failed.
    #[error("invariant violated - {file}:{line}: {message}")]
    Invariant {
        /// What was violated.
        message: String,
        /// Source file of the check.
        file: &'static str,
        /// Source line of the check.
        line: u32,
    },
}

impl LoopError {
    /// Whether the compilation may go on after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LoopError::Bailout(_))
    }
}

/// Result alias used throughout the crate.
pub type LoopResult<T> = Result<T, LoopError>;
