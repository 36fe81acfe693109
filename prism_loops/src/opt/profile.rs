//! Profiling information consulted by the speculative phases.

use rustc_hash::FxHashMap;

use crate::ir::DeoptimizationReason;

/// Runtime feedback about the method being compiled.
pub trait ProfilingInfo {
    /// How often the method deoptimized for `reason` so far.
    fn deopt_count(&self, reason: DeoptimizationReason) -> u32;

    /// Observed probability that the branch at `bci` went to its true
    /// successor, if it was profiled.
    fn branch_probability(&self, bci: u32) -> Option<f64>;

    /// Whether loop frequencies come from real profiles rather than
    /// static estimates.
    fn is_trusted(&self) -> bool {
        false
    }
}

/// Profile assembled by hand, for tests and for methods compiled without
/// runtime feedback.
#[derive(Debug, Clone, Default)]
pub struct StaticProfile {
    deopts: FxHashMap<DeoptimizationReason, u32>,
    branches: FxHashMap<u32, f64>,
    trusted: bool,
}

impl StaticProfile {
    /// Profile with no feedback at all.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `count` deopts for `reason`.
    pub fn with_deopts(mut self, reason: DeoptimizationReason, count: u32) -> Self {
        self.deopts.insert(reason, count);
        self
    }

    /// Record a branch probability.
    pub fn with_branch(mut self, bci: u32, true_probability: f64) -> Self {
        self.branches.insert(bci, true_probability.clamp(0.0, 1.0));
        self
    }

    /// Mark loop frequencies as measured.
    pub fn trusted(mut self) -> Self {
        self.trusted = true;
        self
    }
}

impl ProfilingInfo for StaticProfile {
    fn deopt_count(&self, reason: DeoptimizationReason) -> u32 {
        self.deopts.get(&reason).copied().unwrap_or(0)
    }

    fn branch_probability(&self, bci: u32) -> Option<f64> {
        self.branches.get(&bci).copied()
    }

    fn is_trusted(&self) -> bool {
        self.trusted
    }
}
