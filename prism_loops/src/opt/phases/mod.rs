//! Loop phases.
//!
//! Structural phases pick loops through [`LoopPolicies`](super::LoopPolicies)
//! and apply a primitive from [`transform`](super::transform). Speculative
//! phases rewrite guards and register what they assume in the graph's
//! speculation log. Every phase recomputes [`LoopsData`](super::LoopsData)
//! after each mutation of control flow.

mod convert_deopt;
mod full_unroll;
mod guard_movement;
mod partial_unroll;
mod peeling;
mod predication;
mod safepoint;
mod unswitch;

pub use convert_deopt::ConvertDeoptimizePhase;
pub use full_unroll::FullUnrollPhase;
pub use guard_movement::GuardMovementPhase;
pub use partial_unroll::PartialUnrollPhase;
pub use peeling::PeelingPhase;
pub use predication::LoopPredicationPhase;
pub use safepoint::SafepointEliminationPhase;
pub use unswitch::UnswitchPhase;

use super::PhaseContext;
use crate::error::{BailoutReason, LoopError, LoopResult};
use crate::ir::{Graph, NodeId};

/// Canonicalize from `touched` (everything when empty) and count the
/// changes.
pub(crate) fn canonicalize(graph: &mut Graph, ctx: &mut PhaseContext<'_>, touched: &[NodeId]) {
    let changes = ctx.canonicalizer.canonicalize(graph, touched);
    ctx.metrics.canonicalized += changes as u32;
}

/// Node budget of a growing phase started on a graph of `size` nodes.
pub(crate) fn growth_budget(ctx: &PhaseContext<'_>, size: usize) -> usize {
    (size as f64 * ctx.config.full_unroll_growth(size)) as usize
}

/// Bail out when `graph` outgrew `budget`.
pub(crate) fn check_budget(graph: &Graph, budget: usize) -> LoopResult<()> {
    let size = graph.live_count();
    if size > budget {
        return Err(LoopError::Bailout(BailoutReason::GraphSizeLimit {
            size,
            limit: budget,
        }));
    }
    Ok(())
}
