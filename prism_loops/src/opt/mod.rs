//! Loop optimization layer.
//!
//! # Architecture
//!
//! - **Analysis** (`loops/`): loop forest, loop fragments, induction
//!   variables and counted-loop facts, recomputed from the graph on demand
//! - **Primitives** (`transform/`): peel, full unroll, pre/main/post
//!   splitting, partial unroll, unswitch
//! - **Phases** (`phases/`): drivers that pick loops through
//!   [`LoopPolicies`] and apply primitives or speculative guard rewrites
//! - **Pipeline** (`pipeline.rs`): runs the enabled phases in a fixed
//!   order, verifies between them and absorbs bailouts
//!
//! # Algorithm
//!
//! Every phase follows the same shape:
//!
//! 1. Compute [`LoopsData`] for the current graph
//! 2. Ask the policies which loops to touch
//! 3. Rewrite, then canonicalize the touched nodes
//! 4. Discard the analysis; the next step recomputes it
//!
//! Analyses are never kept across a mutation of control flow.

pub mod canonicalize;
pub mod config;
pub mod loops;
pub mod metrics;
pub mod phases;
pub mod pipeline;
pub mod policy;
pub mod profile;
pub mod transform;

pub use canonicalize::{Canonicalizer, SimpleCanonicalizer};
pub use config::LoopConfig;
pub use loops::{
    CountedLoopInfo, Direction, InductionVariable, IvKind, LoopEx, LoopFragment, LoopsData,
};
pub use metrics::LoopMetrics;
pub use pipeline::{optimize_loops, LoopPipeline, PhaseStat, PipelineStats};
pub use policy::{DefaultLoopPolicies, LoopPolicies};
pub use profile::{ProfilingInfo, StaticProfile};

use crate::error::LoopResult;
use crate::ir::Graph;

// =============================================================================
// Phase Interface
// =============================================================================

/// Everything a phase may consult or update besides the graph.
pub struct PhaseContext<'a> {
    /// Thresholds and switches.
    pub config: &'a LoopConfig,
    /// Decides which loops get transformed.
    pub policies: &'a dyn LoopPolicies,
    /// Cleans up after each transformation.
    pub canonicalizer: &'a dyn Canonicalizer,
    /// Deopt history and branch profiles of the method.
    pub profile: &'a dyn ProfilingInfo,
    /// Counters updated by the phases.
    pub metrics: &'a mut LoopMetrics,
}

/// A loop optimization phase.
pub trait LoopPhase {
    /// Name used in logs and statistics.
    fn name(&self) -> &'static str;

    /// Run over `graph`; returns whether anything changed.
    fn run(&mut self, graph: &mut Graph, ctx: &mut PhaseContext<'_>) -> LoopResult<bool>;
}
