//! Loop Pipeline.
//!
//! Runs the loop phases over one graph in a fixed order and collects
//! per-phase statistics.
//!
//! # Phase Order
//!
//! 1. **convert_deopt**: deopting branches become guards, so later phases
//!    see fewer splits inside loops
//! 2. **safepoint_elimination**: before copies multiply the polls
//! 3. **peeling**, **full_unroll**, **unswitch**, **partial_unroll**:
//!    structural rewrites, cheapest first
//! 4. **predication**, **guard_movement**: speculative guard rewrites on
//!    the final loop shapes
//!
//! # Failures
//!
//! A bailout abandons only the phase that raised it; the pipeline logs it,
//! counts it and goes on with the next phase. Invariant violations stop
//! the pipeline and are returned to the caller.

use std::time::{Duration, Instant};

use log::{debug, warn};

use super::phases::{
    ConvertDeoptimizePhase, FullUnrollPhase, GuardMovementPhase, LoopPredicationPhase,
    PartialUnrollPhase, PeelingPhase, SafepointEliminationPhase, UnswitchPhase,
};
use super::{
    Canonicalizer, DefaultLoopPolicies, LoopConfig, LoopMetrics, LoopPhase, LoopPolicies,
    PhaseContext, ProfilingInfo, SimpleCanonicalizer,
};
use crate::error::{LoopError, LoopResult};
use crate::ir::Graph;

// =============================================================================
// Phase Entry
// =============================================================================

/// A registered phase.
struct PhaseEntry {
    /// The phase (boxed for polymorphism).
    phase: Box<dyn LoopPhase>,
    /// Whether this phase is enabled.
    enabled: bool,
    /// Phase-specific statistics.
    runs: usize,
    changes: usize,
    bailouts: usize,
    time: Duration,
}

impl PhaseEntry {
    fn new<P: LoopPhase + 'static>(phase: P) -> Self {
        Self {
            phase: Box::new(phase),
            enabled: true,
            runs: 0,
            changes: 0,
            bailouts: 0,
            time: Duration::ZERO,
        }
    }
}

// =============================================================================
// Loop Pipeline
// =============================================================================

/// Runs the enabled loop phases in order.
pub struct LoopPipeline {
    /// Configuration shared by every phase.
    config: LoopConfig,

    /// Registered phases in order.
    phases: Vec<PhaseEntry>,

    /// Total time spent in [`run`](Self::run) calls.
    total_time: Duration,
}

impl LoopPipeline {
    /// Create a pipeline with the default configuration.
    pub fn new() -> Self {
        Self::with_config(LoopConfig::default())
    }

    /// Create a pipeline with a custom configuration.
    pub fn with_config(config: LoopConfig) -> Self {
        let mut pipeline = Self {
            config,
            phases: Vec::new(),
            total_time: Duration::ZERO,
        };

        pipeline.register_default_phases();
        pipeline
    }

    /// Register the built-in phases enabled by the configuration.
    fn register_default_phases(&mut self) {
        if self.config.convert_deopt {
            self.register(ConvertDeoptimizePhase::new());
        }
        if self.config.safepoint_elimination {
            self.register(SafepointEliminationPhase::new());
        }

        // Structural
        if self.config.peeling {
            self.register(PeelingPhase::new());
        }
        if self.config.full_unroll {
            self.register(FullUnrollPhase::new());
        }
        if self.config.unswitch {
            self.register(UnswitchPhase::new());
        }
        if self.config.partial_unroll {
            self.register(PartialUnrollPhase::new());
        }

        // Speculative
        if self.config.predication {
            self.register(LoopPredicationPhase::new());
        }
        if self.config.guard_movement {
            self.register(GuardMovementPhase::new());
        }
    }

    /// Append a custom phase.
    pub fn register<P: LoopPhase + 'static>(&mut self, phase: P) {
        self.phases.push(PhaseEntry::new(phase));
    }

    /// Enable or disable the phase called `name`. Returns whether such a
    /// phase is registered.
    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> bool {
        let mut found = false;
        for entry in self.phases.iter_mut().filter(|e| e.phase.name() == name) {
            entry.enabled = enabled;
            found = true;
        }
        found
    }

    /// Configuration in use.
    #[inline]
    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    /// Names of the registered phases, in run order.
    pub fn phase_names(&self) -> Vec<&'static str> {
        self.phases.iter().map(|e| e.phase.name()).collect()
    }

    /// Run every enabled phase with the default policies and canonicalizer.
    pub fn run(&mut self, graph: &mut Graph, profile: &dyn ProfilingInfo) -> LoopResult<PipelineStats> {
        let policies = DefaultLoopPolicies::new(&self.config);
        let canonicalizer = SimpleCanonicalizer::new();
        self.run_with(graph, &policies, &canonicalizer, profile)
    }

    /// Run every enabled phase.
    ///
    /// Fails only on an invariant violation; the graph is then in an
    /// unspecified state.
    pub fn run_with(
        &mut self,
        graph: &mut Graph,
        policies: &dyn LoopPolicies,
        canonicalizer: &dyn Canonicalizer,
        profile: &dyn ProfilingInfo,
    ) -> LoopResult<PipelineStats> {
        let start = Instant::now();
        let mut stats = PipelineStats {
            initial_size: graph.live_count(),
            ..PipelineStats::default()
        };

        if self.config.verify {
            graph.verify()?;
        }

        for entry in &mut self.phases {
            if !entry.enabled {
                continue;
            }
            let name = entry.phase.name();
            let mut ctx = PhaseContext {
                config: &self.config,
                policies,
                canonicalizer,
                profile,
                metrics: &mut stats.metrics,
            };

            let phase_start = Instant::now();
            let result = entry.phase.run(graph, &mut ctx);
            entry.time += phase_start.elapsed();
            entry.runs += 1;
            stats.phases_run += 1;

            match result {
                Ok(true) => {
                    entry.changes += 1;
                    debug!("{name}: changed, {} live nodes", graph.live_count());
                }
                Ok(false) => {}
                Err(LoopError::Bailout(reason)) => {
                    entry.bailouts += 1;
                    stats.metrics.bailouts += 1;
                    warn!("{name} bailed out: {reason}");
                }
                Err(err) => return Err(err),
            }

            if self.config.verify {
                graph.verify()?;
            }
        }

        stats.total_time = start.elapsed();
        stats.final_size = graph.live_count();
        self.total_time += stats.total_time;
        debug!(
            "loop pipeline: {} -> {} nodes in {:?}",
            stats.initial_size, stats.final_size, stats.total_time
        );
        Ok(stats)
    }

    /// Statistics of every registered phase.
    pub fn phase_stats(&self) -> Vec<PhaseStat> {
        self.phases
            .iter()
            .map(|e| PhaseStat {
                name: e.phase.name(),
                enabled: e.enabled,
                runs: e.runs,
                changes: e.changes,
                bailouts: e.bailouts,
                time: e.time,
            })
            .collect()
    }

    /// Get total time spent.
    #[inline]
    pub fn total_time(&self) -> Duration {
        self.total_time
    }
}

impl Default for LoopPipeline {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Statistics of a single phase across runs.
#[derive(Debug, Clone)]
pub struct PhaseStat {
    /// Phase name.
    pub name: &'static str,
    /// Whether the phase is enabled.
    pub enabled: bool,
    /// Number of times run.
    pub runs: usize,
    /// Number of times it made changes.
    pub changes: usize,
    /// Number of runs that bailed out.
    pub bailouts: usize,
    /// Total time spent in this phase.
    pub time: Duration,
}

/// Statistics of one pipeline run.
#[derive(Debug, Clone, Default)]
pub struct PipelineStats {
    /// Number of phases run.
    pub phases_run: usize,
    /// Total time spent.
    pub total_time: Duration,
    /// Live nodes before.
    pub initial_size: usize,
    /// Live nodes after.
    pub final_size: usize,
    /// What the phases did.
    pub metrics: LoopMetrics,
}

impl PipelineStats {
    /// Final over initial size.
    pub fn size_reduction(&self) -> f64 {
        if self.initial_size == 0 {
            1.0
        } else {
            self.final_size as f64 / self.initial_size as f64
        }
    }
}

// =============================================================================
// Quick Optimize Functions
// =============================================================================

/// Run the default pipeline on a graph.
pub fn optimize_loops(graph: &mut Graph, profile: &dyn ProfilingInfo) -> LoopResult<PipelineStats> {
    LoopPipeline::new().run(graph, profile)
}

// =============================================================================
// Tests
// =============================================================================
