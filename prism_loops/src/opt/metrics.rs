//! Counters kept by the loop phases.

use std::fmt;

/// What the loop phases did to one graph.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopMetrics {
    /// Loops peeled once.
    pub peeled: u32,
    /// Loops removed by full unrolling.
    pub fully_unrolled: u32,
    /// Loops split into pre/main/post.
    pub pre_post_splits: u32,
    /// Main loop doublings.
    pub partially_unrolled: u32,
    /// Loops unswitched.
    pub unswitched: u32,
    /// Back edges whose safepoint poll was removed.
    pub safepoints_removed: u32,
    /// Overflow guards placed in front of counted loops.
    pub overflow_guards: u32,
    /// Deopting branches turned into fixed guards.
    pub deopts_converted: u32,
    /// Bounds checks replaced by loop-entry checks.
    pub guards_predicated: u32,
    /// Guards hoisted out of at least one loop.
    pub guards_moved: u32,
    /// Guard conditions rewritten in terms of an extremum.
    pub compares_rewritten: u32,
    /// Phase attempts abandoned on a bailout.
    pub bailouts: u32,
    /// Nodes changed by canonicalization.
    pub canonicalized: u32,
}

impl LoopMetrics {
    /// Empty counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of structural loop transformations.
    pub fn transformations(&self) -> u32 {
        self.peeled
            + self.fully_unrolled
            + self.pre_post_splits
            + self.partially_unrolled
            + self.unswitched
    }

    /// Number of guard rewrites.
    pub fn guard_rewrites(&self) -> u32 {
        self.deopts_converted + self.guards_predicated + self.guards_moved
    }

    /// Add `other` into `self`.
    pub fn merge(&mut self, other: &LoopMetrics) {
        self.peeled += other.peeled;
        self.fully_unrolled += other.fully_unrolled;
        self.pre_post_splits += other.pre_post_splits;
        self.partially_unrolled += other.partially_unrolled;
        self.unswitched += other.unswitched;
        self.safepoints_removed += other.safepoints_removed;
        self.overflow_guards += other.overflow_guards;
        self.deopts_converted += other.deopts_converted;
        self.guards_predicated += other.guards_predicated;
        self.guards_moved += other.guards_moved;
        self.compares_rewritten += other.compares_rewritten;
        self.bailouts += other.bailouts;
        self.canonicalized += other.canonicalized;
    }
}

impl fmt::Display for LoopMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Loop Metrics:")?;
        writeln!(f, "  peeled:              {}", self.peeled)?;
        writeln!(f, "  fully unrolled:      {}", self.fully_unrolled)?;
        writeln!(f, "  pre/post splits:     {}", self.pre_post_splits)?;
        writeln!(f, "  partially unrolled:  {}", self.partially_unrolled)?;
        writeln!(f, "  unswitched:          {}", self.unswitched)?;
        writeln!(f, "  safepoints removed:  {}", self.safepoints_removed)?;
        writeln!(f, "  overflow guards:     {}", self.overflow_guards)?;
        writeln!(f, "  deopts converted:    {}", self.deopts_converted)?;
        writeln!(f, "  guards predicated:   {}", self.guards_predicated)?;
        writeln!(f, "  guards moved:        {}", self.guards_moved)?;
        writeln!(f, "  compares rewritten:  {}", self.compares_rewritten)?;
        writeln!(f, "  bailouts:            {}", self.bailouts)?;
        write!(f, "  canonicalized:       {}", self.canonicalized)
    }
}
