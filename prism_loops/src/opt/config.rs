//! Configuration of the loop phases.

/// Thresholds and switches of the loop pipeline.
///
/// Sizes are live node counts. Frequencies are iterations per loop entry
/// as recorded in [`LoopInfo`](crate::ir::LoopInfo).
#[derive(Debug, Clone, PartialEq)]
pub struct LoopConfig {
    // ---- peeling ----------------------------------------------------------
    /// Run the peeling phase.
    pub peeling: bool,

    /// How often a single loop may be peeled.
    pub max_peelings_per_loop: u32,

    /// Largest loop body that is peeled.
    pub peeling_max_size: usize,

    /// Loops entered less often than this per iteration are not peeled.
    pub peeling_min_frequency: f64,

    /// Rounds of the peeling phase.
    pub peeling_iterations: u32,

    // ---- full unrolling ---------------------------------------------------
    /// Run the full unroll phase.
    pub full_unroll: bool,

    /// Largest constant trip count that is fully unrolled.
    pub full_unroll_max_trip: u64,

    /// Largest `trip count * body size` that is fully unrolled.
    pub full_unroll_max_nodes: usize,

    /// Peels one full unroll may perform before bailing out.
    pub full_unroll_max_iterations: u32,

    /// Graphs below this size use the small growth factor.
    pub small_graph_size: usize,

    /// Allowed graph growth of the full unroll phase for small graphs.
    pub small_graph_growth: f64,

    /// Allowed graph growth of the full unroll phase for larger graphs.
    pub large_graph_growth: f64,

    // ---- partial unrolling ------------------------------------------------
    /// Run pre/main/post splitting and partial unrolling.
    pub partial_unroll: bool,

    /// Largest unroll factor of a main loop.
    pub max_unroll_factor: u32,

    /// Largest body that may be doubled.
    pub partial_unroll_max_body: usize,

    /// Main loops running fewer iterations per entry are left alone.
    pub partial_unroll_min_frequency: f64,

    /// Doubling rounds per phase run.
    pub partial_unroll_rounds: u32,

    // ---- unswitching ------------------------------------------------------
    /// Run the unswitch phase.
    pub unswitch: bool,

    /// Largest loop that is unswitched.
    pub unswitch_max_size: usize,

    /// Largest number of nodes one unswitch may add.
    pub unswitch_max_growth: usize,

    /// How often a single loop may be unswitched.
    pub max_unswitches_per_loop: u32,

    /// Rounds of the unswitch phase.
    pub unswitch_iterations: u32,

    // ---- guards and safepoints --------------------------------------------
    /// Drop back-edge safepoints of bounded loops.
    pub safepoint_elimination: bool,

    /// Turn deopting branches inside loops into fixed guards.
    pub convert_deopt: bool,

    /// Replace bounds checks on induction variables by loop-entry checks.
    pub predication: bool,

    /// Hoist floating guards out of loops.
    pub guard_movement: bool,

    /// Rounds of the guard movement phase.
    pub guard_movement_rounds: u32,

    // ---- diagnostics ------------------------------------------------------
    /// Verify the graph after every phase.
    pub verify: bool,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            peeling: true,
            max_peelings_per_loop: 1,
            peeling_max_size: 100,
            peeling_min_frequency: 2.0,
            peeling_iterations: 2,
            full_unroll: true,
            full_unroll_max_trip: 16,
            full_unroll_max_nodes: 400,
            full_unroll_max_iterations: 64,
            small_graph_size: 1000,
            small_graph_growth: 10.0,
            large_graph_growth: 2.0,
            partial_unroll: true,
            max_unroll_factor: 8,
            partial_unroll_max_body: 100,
            partial_unroll_min_frequency: 4.0,
            partial_unroll_rounds: 4,
            unswitch: true,
            unswitch_max_size: 200,
            unswitch_max_growth: 400,
            max_unswitches_per_loop: 3,
            unswitch_iterations: 3,
            safepoint_elimination: true,
            convert_deopt: true,
            predication: true,
            guard_movement: true,
            guard_movement_rounds: 3,
            verify: cfg!(debug_assertions),
        }
    }
}

impl LoopConfig {
    /// Fewer and smaller transformations.
    pub fn conservative() -> Self {
        Self {
            peeling_max_size: 50,
            peeling_iterations: 1,
            full_unroll_max_trip: 8,
            full_unroll_max_nodes: 150,
            full_unroll_max_iterations: 16,
            small_graph_growth: 4.0,
            large_graph_growth: 1.5,
            max_unroll_factor: 4,
            partial_unroll_max_body: 50,
            partial_unroll_rounds: 2,
            unswitch_max_size: 100,
            unswitch_max_growth: 150,
            max_unswitches_per_loop: 1,
            unswitch_iterations: 1,
            ..Self::default()
        }
    }

    /// Larger budgets everywhere.
    pub fn aggressive() -> Self {
        Self {
            max_peelings_per_loop: 2,
            peeling_max_size: 200,
            peeling_min_frequency: 1.0,
            peeling_iterations: 3,
            full_unroll_max_trip: 64,
            full_unroll_max_nodes: 1200,
            full_unroll_max_iterations: 256,
            small_graph_growth: 20.0,
            large_graph_growth: 4.0,
            max_unroll_factor: 16,
            partial_unroll_max_body: 200,
            partial_unroll_min_frequency: 2.0,
            partial_unroll_rounds: 5,
            unswitch_max_size: 400,
            unswitch_max_growth: 1000,
            max_unswitches_per_loop: 4,
            unswitch_iterations: 4,
            ..Self::default()
        }
    }

    /// Fast compilation: only the cheap guard and safepoint rewrites.
    pub fn tier1() -> Self {
        Self {
            peeling: false,
            full_unroll: true,
            full_unroll_max_trip: 4,
            full_unroll_max_nodes: 64,
            full_unroll_max_iterations: 8,
            partial_unroll: false,
            unswitch: false,
            predication: false,
            guard_movement_rounds: 1,
            ..Self::default()
        }
    }

    /// Optimizing tier.
    pub fn tier2() -> Self {
        Self::default()
    }

    /// Everything off; phases may still be run explicitly.
    pub fn disabled() -> Self {
        Self {
            peeling: false,
            full_unroll: false,
            partial_unroll: false,
            unswitch: false,
            safepoint_elimination: false,
            convert_deopt: false,
            predication: false,
            guard_movement: false,
            ..Self::default()
        }
    }

    /// Growth factor of the full unroll phase for a graph of `size` nodes.
    pub fn full_unroll_growth(&self, size: usize) -> f64 {
        if size < self.small_graph_size {
            self.small_graph_growth
        } else {
            self.large_graph_growth
        }
    }
}
