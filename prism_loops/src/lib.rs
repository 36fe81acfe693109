//! Loop transformation engine for the Prism optimizing JIT.
//!
//! Rewrites a method's sea-of-nodes graph to make its loops cheaper:
//! - Peeling, full unrolling, pre/main/post splitting and partial unrolling
//! - Unswitching on loop-invariant branches
//! - Safepoint elimination for bounded loops
//! - Speculative guard handling: deopt-to-guard conversion, loop
//!   predication and guard hoisting, backed by a per-method speculation log
//!
//! The [`ir`] module holds the graph, its analyses and a reference
//! interpreter; [`opt`] holds loop analysis, transformation primitives,
//! the phase drivers and the pipeline running them.
#![deny(unsafe_op_in_unsafe_fn)]
pub mod error;
pub mod ir;
pub mod opt;
pub mod speculation;

pub use error::{BailoutReason, LoopError, LoopResult};
pub use opt::{LoopConfig, LoopMetrics, LoopPipeline};
