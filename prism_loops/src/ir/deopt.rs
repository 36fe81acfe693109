//! Deoptimization metadata attached to guards and deopt nodes.
//!
//! A guard that fails transfers execution back to the interpreter. The
//! metadata recorded here tells the runtime *why* that happened
//! ([`DeoptimizationReason`]), *what to do* with the compiled code
//! ([`DeoptimizationAction`]), and which optimistic assumption was
//! responsible ([`Speculation`]), so that the assumption is not made again
//! when the method is recompiled.

use std::fmt;

// =============================================================================
// Method Identity
// =============================================================================

/// Identity of the method a graph was built for.
///
/// Speculations are scoped per method: a failure in one method never
/// disables speculation in another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct MethodId(pub u32);

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "method#{}", self.0)
    }
}

// =============================================================================
// Deoptimization Reason
// =============================================================================

/// Why a guard may fail.
///
/// Reasons are recorded by the runtime per method so that profile-driven
/// heuristics can back off from guards that keep failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum DeoptimizationReason {
    /// No particular reason.
    None = 0,
    /// A value expected to be non-null was null.
    NullCheckException = 1,
    /// An array index was out of range.
    BoundsCheckException = 2,
    /// A type test failed.
    ClassCastException = 3,
    /// An arithmetic check failed (overflow, division by zero).
    ArithmeticException = 4,
    /// Code the profile claimed was never reached was reached.
    UnreachedCode = 5,
    /// A type profile used for inlining was wrong.
    TypeCheckedInliningViolated = 6,
    /// An optimized type check saw an unexpected type.
    OptimizedTypeCheckViolated = 7,
    /// A generic runtime constraint was violated.
    RuntimeConstraint = 8,
    /// A loop counter could overflow.
    LoopLimitCheck = 9,
    /// Explicit transfer to the interpreter.
    TransferToInterpreter = 10,
    /// A symbolic reference was unresolved.
    Unresolved = 11,
}

impl DeoptimizationReason {
    /// Every reason, in discriminant order.
    pub const ALL: [DeoptimizationReason; 12] = [
        DeoptimizationReason::None,
        DeoptimizationReason::NullCheckException,
        DeoptimizationReason::BoundsCheckException,
        DeoptimizationReason::ClassCastException,
        DeoptimizationReason::ArithmeticException,
        DeoptimizationReason::UnreachedCode,
        DeoptimizationReason::TypeCheckedInliningViolated,
        DeoptimizationReason::OptimizedTypeCheckViolated,
        DeoptimizationReason::RuntimeConstraint,
        DeoptimizationReason::LoopLimitCheck,
        DeoptimizationReason::TransferToInterpreter,
        DeoptimizationReason::Unresolved,
    ];

    /// Lower-case name used in logs.
    pub const fn name(self) -> &'static str {
        match self {
            DeoptimizationReason::None => "none",
            DeoptimizationReason::NullCheckException => "null_check",
            DeoptimizationReason::BoundsCheckException => "bounds_check",
            DeoptimizationReason::ClassCastException => "class_cast",
            DeoptimizationReason::ArithmeticException => "arithmetic",
            DeoptimizationReason::UnreachedCode => "unreached_code",
            DeoptimizationReason::TypeCheckedInliningViolated => "type_checked_inlining",
            DeoptimizationReason::OptimizedTypeCheckViolated => "optimized_type_check",
            DeoptimizationReason::RuntimeConstraint => "runtime_constraint",
            DeoptimizationReason::LoopLimitCheck => "loop_limit_check",
            DeoptimizationReason::TransferToInterpreter => "transfer_to_interpreter",
            DeoptimizationReason::Unresolved => "unresolved",
        }
    }
}

impl fmt::Display for DeoptimizationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// Deoptimization Action
// =============================================================================

/// What the runtime does with the compiled code after a deoptimization.
///
/// Ordered from least to most disruptive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum DeoptimizationAction {
    /// Keep the compiled code.
    None = 0,
    /// Recompile only after the deopt count crosses a threshold.
    RecompileIfTooManyDeopts = 1,
    /// Invalidate and gather a fresh profile before recompiling.
    InvalidateReprofile = 2,
    /// Invalidate and recompile immediately.
    InvalidateRecompile = 3,
    /// Invalidate and stop compiling this method.
    InvalidateStopCompiling = 4,
}

impl DeoptimizationAction {
    /// Whether the compiled code is thrown away.
    pub const fn invalidates_compilation(self) -> bool {
        matches!(
            self,
            DeoptimizationAction::InvalidateReprofile
                | DeoptimizationAction::InvalidateRecompile
                | DeoptimizationAction::InvalidateStopCompiling
        )
    }
}

// =============================================================================
// Speculation
// =============================================================================

/// Family of optimistic transformations a speculation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SpeculationGroup {
    /// Range checks replaced by loop-invariant checks.
    LoopPredication,
    /// Guards hoisted out of loops.
    GuardMovement,
    /// Overflow guards synthesized for counted loops.
    LoopLimitCheck,
}

impl SpeculationGroup {
    /// Name used in logs.
    pub const fn name(self) -> &'static str {
        match self {
            SpeculationGroup::LoopPredication => "LoopPredication",
            SpeculationGroup::GuardMovement => "LoopGuardMovement",
            SpeculationGroup::LoopLimitCheck => "LoopLimitCheck",
        }
    }
}

/// Key identifying one speculation: group, method, position, reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpeculationReason {
    /// Transformation family.
    pub group: SpeculationGroup,
    /// Method being compiled.
    pub method: MethodId,
    /// Bytecode position the speculation is attached to.
    pub bci: u32,
    /// Reason of the guard performing the speculation.
    pub reason: DeoptimizationReason,
}

impl SpeculationReason {
    /// Build a key.
    pub const fn new(
        group: SpeculationGroup,
        method: MethodId,
        bci: u32,
        reason: DeoptimizationReason,
    ) -> Self {
        SpeculationReason {
            group,
            method,
            bci,
            reason,
        }
    }
}

impl fmt::Display for SpeculationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}({}, bci {}, {})",
            self.group.name(),
            self.method,
            self.bci,
            self.reason
        )
    }
}

/// Token returned by the speculation log and embedded in a guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpeculationToken {
    /// Sequence number inside the issuing log.
    pub id: u32,
    /// What was speculated.
    pub reason: SpeculationReason,
}

/// Optional speculation carried by a guard; `None` means no speculation.
pub type Speculation = Option<SpeculationToken>;

// =============================================================================
// Deopt Info
// =============================================================================

/// Metadata shared by `Deoptimize`, `FixedGuard` and floating `Guard` nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeoptInfo {
    /// Why the guard fails.
    pub reason: DeoptimizationReason,
    /// What happens to the compiled code on failure.
    pub action: DeoptimizationAction,
    /// Speculation this guard performs.
    pub speculation: Speculation,
}

impl DeoptInfo {
    /// Metadata without a speculation.
    pub const fn new(reason: DeoptimizationReason, action: DeoptimizationAction) -> Self {
        DeoptInfo {
            reason,
            action,
            speculation: None,
        }
    }

    /// Attach a speculation token.
    pub const fn with_speculation(mut self, token: SpeculationToken) -> Self {
        self.speculation = Some(token);
        self
    }

    /// Priority used when two guards compete for the same position.
    pub fn priority(&self) -> GuardPriority {
        if self.speculation.is_some() {
            GuardPriority::Speculation
        } else if self.action != DeoptimizationAction::None {
            GuardPriority::Profile
        } else {
            GuardPriority::None
        }
    }
}

/// Relative importance of a guard.
///
/// A speculative guard must survive over a profile-based one, which in
/// turn outranks a guard that does nothing on failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum GuardPriority {
    /// No action on failure.
    None,
    /// Profile-derived guard.
    Profile,
    /// Guard backed by a speculation token.
    Speculation,
}

impl GuardPriority {
    /// Strictly higher priority than `other`.
    pub fn is_higher_than(self, other: GuardPriority) -> bool {
        self > other
    }
}
