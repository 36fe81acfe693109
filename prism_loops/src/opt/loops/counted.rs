//! Counted loop classification.
//!
//! A loop is *counted* when the `If` directly after its `LoopBegin` leaves
//! the loop on one side and compares an induction variable against a
//! loop-invariant limit. After normalization the loop runs while
//!
//! ```text
//!   Up,   exclusive:  iv <  limit        Down, exclusive:  iv >  limit
//!   Up,   inclusive:  iv <= limit        Down, inclusive:  iv >= limit
//! ```
//!
//! `iv != limit` is accepted for unit strides when stamps prove that the
//! counter starts on the correct side of the limit; it is then the
//! exclusive form.
//!
//! The trip count formulas assume the counter never wraps before the test
//! fails. [`CountedLoopInfo::counter_never_overflows`] proves this from the
//! limit's stamp; otherwise [`CountedLoopInfo::create_overflow_guard`]
//! places a `LoopLimitCheck` guard in front of the loop that deopts for
//! limits too close to the type bounds.

use rustc_hash::FxHashMap;

use super::induction::{Direction, InductionVariable};
use crate::ir::{
    ArithOp, CmpOp, DeoptInfo, DeoptimizationAction, DeoptimizationReason, Graph, IntegerStamp,
    NodeId, Operator, SpeculationGroup, SpeculationReason, ValueType,
};

/// Counted loop descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct CountedLoopInfo {
    begin: NodeId,
    iv: InductionVariable,
    limit: NodeId,
    limit_included: bool,
    direction: Direction,
    if_node: NodeId,
    compare: NodeId,
    iv_on_left: bool,
    stay_on_true: bool,
    exit: NodeId,
    body: NodeId,
}

impl CountedLoopInfo {
    /// Classify the loop headed by `begin`.
    ///
    /// `ivs` are the induction variables of the loop; `in_loop` selects the
    /// nodes computed inside it.
    pub fn detect(
        graph: &Graph,
        begin: NodeId,
        ivs: &FxHashMap<NodeId, InductionVariable>,
        in_loop: impl Fn(NodeId) -> bool,
    ) -> Option<Self> {
        let if_node = graph.next(begin)?;
        if !matches!(graph.op(if_node), Operator::If { .. }) {
            return None;
        }
        let compare = graph.input(if_node, 0);
        let op = match graph.op(compare) {
            Operator::IntCmp(op) if !matches!(op, CmpOp::Eq | CmpOp::Below) => *op,
            _ => return None,
        };

        let (t, f) = (graph.successor(if_node, 0)?, graph.successor(if_node, 1)?);
        let is_own_exit = |n: NodeId| {
            matches!(graph.op(n), Operator::LoopExit) && graph.input(n, 0) == begin
        };
        let (exit, body, stay_on_true) = if is_own_exit(f) && graph.op(t) == &Operator::Begin {
            (f, t, true)
        } else if is_own_exit(t) && graph.op(f) == &Operator::Begin {
            (t, f, false)
        } else {
            return None;
        };

        let (a, b) = (graph.input(compare, 0), graph.input(compare, 1));
        let (iv, limit, iv_on_left) = match (ivs.get(&a), ivs.get(&b)) {
            (Some(iv), _) if !in_loop(b) => (iv, b, true),
            (_, Some(iv)) if !in_loop(a) => (iv, a, false),
            _ => return None,
        };
        if graph.ty(limit) != iv.ty {
            return None;
        }

        let mut normalized = if iv_on_left { op } else { op.mirror()? };
        if !stay_on_true {
            normalized = normalized.negate()?;
        }
        let (direction, limit_included) = match normalized {
            CmpOp::Lt => (Direction::Up, false),
            CmpOp::Le => (Direction::Up, true),
            CmpOp::Gt => (Direction::Down, false),
            CmpOp::Ge => (Direction::Down, true),
            CmpOp::Ne => {
                let init = iv.init_stamp(graph)?;
                let bound = graph.stamp(limit)?;
                match iv.stride {
                    1 if init.upper <= bound.lower => (Direction::Up, false),
                    -1 if init.lower >= bound.upper => (Direction::Down, false),
                    _ => return None,
                }
            }
            CmpOp::Eq | CmpOp::Below => return None,
        };
        if iv.direction() != direction {
            return None;
        }

        Some(CountedLoopInfo {
            begin,
            iv: iv.clone(),
            limit,
            limit_included,
            direction,
            if_node,
            compare,
            iv_on_left,
            stay_on_true,
            exit,
            body,
        })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// The loop's `LoopBegin`.
    #[inline]
    pub fn begin(&self) -> NodeId {
        self.begin
    }

    /// IV tested by the exit condition.
    #[inline]
    pub fn iv(&self) -> &InductionVariable {
        &self.iv
    }

    /// Loop-invariant limit.
    #[inline]
    pub fn limit(&self) -> NodeId {
        self.limit
    }

    /// Whether the loop still runs when the IV equals the limit.
    #[inline]
    pub fn limit_included(&self) -> bool {
        self.limit_included
    }

    /// Counting direction.
    #[inline]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Constant stride of the tested IV.
    #[inline]
    pub fn stride(&self) -> i64 {
        self.iv.stride
    }

    /// The exit test.
    #[inline]
    pub fn if_node(&self) -> NodeId {
        self.if_node
    }

    /// Condition of the exit test.
    #[inline]
    pub fn compare(&self) -> NodeId {
        self.compare
    }

    /// Whether the IV is the left operand of the original comparison.
    #[inline]
    pub fn iv_on_left(&self) -> bool {
        self.iv_on_left
    }

    /// The `LoopExit` of the exit test.
    #[inline]
    pub fn exit(&self) -> NodeId {
        self.exit
    }

    /// Begin of the loop body after the exit test.
    #[inline]
    pub fn body(&self) -> NodeId {
        self.body
    }

    /// Successor index of the body under the exit test.
    #[inline]
    pub fn stay_index(&self) -> usize {
        if self.stay_on_true {
            0
        } else {
            1
        }
    }

    /// Comparison under which the loop keeps running.
    pub fn normalized_op(&self) -> CmpOp {
        match (self.direction, self.limit_included) {
            (Direction::Up, false) => CmpOp::Lt,
            (Direction::Up, true) => CmpOp::Le,
            (Direction::Down, false) => CmpOp::Gt,
            (Direction::Down, true) => CmpOp::Ge,
        }
    }

    // =========================================================================
    // Trip Counts
    // =========================================================================

    /// Whether the counter cannot wrap before the exit test fails.
    pub fn counter_never_overflows(&self, graph: &Graph) -> bool {
        let Some(bits) = self.iv.ty.bits() else {
            return false;
        };
        let Some(bound) = graph.stamp(self.limit) else {
            return false;
        };
        let (min, max) = (
            IntegerStamp::min_value(bits) as i128,
            IntegerStamp::max_value(bits) as i128,
        );
        let s = self.iv.stride as i128;
        let incl = self.limit_included as i128;
        match self.direction {
            Direction::Up => bound.upper as i128 - 1 + incl + s <= max,
            Direction::Down => bound.lower as i128 + 1 - incl + s >= min,
        }
    }

    /// Exact number of iterations when start and limit are constants and
    /// the counter cannot wrap.
    pub fn constant_trip_count(&self, graph: &Graph) -> Option<u64> {
        let init = self.iv.const_init(graph)? as i128;
        let limit = graph.node(self.limit).as_int()? as i128;
        if !self.counter_never_overflows(graph) {
            return None;
        }
        let incl = self.limit_included as i128;
        let range = match self.direction {
            Direction::Up => limit - init + incl,
            Direction::Down => init - limit + incl,
        };
        let abs = (self.iv.stride as i128).abs();
        let trips = if range <= 0 { 0 } else { (range + abs - 1) / abs };
        u64::try_from(trips).ok()
    }

    /// 64-bit node holding an upper bound of the iteration count, exact
    /// when the counter does not wrap.
    pub fn max_trip_count_node(&self, graph: &mut Graph) -> NodeId {
        let ty = ValueType::Int64;
        let init = self.iv.init_node(graph);
        let init = graph.sign_extend(init);
        let limit = graph.sign_extend(self.limit);
        let mut range = match self.direction {
            Direction::Up => graph.arith(ArithOp::Sub, limit, init, ty),
            Direction::Down => graph.arith(ArithOp::Sub, init, limit, ty),
        };
        if self.limit_included {
            let one = graph.const_int(1, ty);
            range = graph.arith(ArithOp::Add, range, one, ty);
        }
        let abs = self.iv.stride.unsigned_abs() as i64;
        if abs != 1 {
            let round = graph.const_int(abs - 1, ty);
            let rounded = graph.arith(ArithOp::Add, range, round, ty);
            let divisor = graph.const_int(abs, ty);
            range = graph.arith(ArithOp::Div, rounded, divisor, ty);
        }
        let zero = graph.const_int(0, ty);
        graph.arith(ArithOp::Max, range, zero, ty)
    }

    /// Whether `iv` stays within its type in every iteration, so that its
    /// first and last values bound all the others.
    ///
    /// The counter relies on [`Self::counter_never_overflows`] or the
    /// overflow guard. Any other IV is bounded through the counter's range
    /// between start and limit.
    pub fn iv_never_wraps(&self, graph: &Graph, iv: &InductionVariable) -> bool {
        if iv.node == self.iv.node {
            return true;
        }
        let (Some(init), Some(limit)) = (self.iv.init_stamp(graph), graph.stamp(self.limit)) else {
            return false;
        };
        let lower = init.lower.min(limit.lower) as i128;
        let upper = init.upper.max(limit.upper) as i128;
        let steps = (upper - lower) / (self.iv.stride as i128).abs();
        let counter = self.iv.is_basic().then(|| (self.iv.root_phi(), lower, upper));
        iv.value_range(graph, counter, steps).is_some()
    }

    /// 64-bit value of `iv` in the last iteration.
    pub fn extremum_node(&self, graph: &mut Graph, iv: &InductionVariable) -> NodeId {
        let trip = self.max_trip_count_node(graph);
        iv.extremum_node(graph, trip)
    }

    /// Condition that holds when the loop runs at least once.
    pub fn entered_condition(&self, graph: &mut Graph) -> NodeId {
        let init = self.iv.init_node(graph);
        graph.compare(self.normalized_op(), init, self.limit)
    }

    /// Exit test condition comparing `iv` against `limit`, with the
    /// polarity expected by the existing `If`.
    pub fn stay_condition(&self, graph: &mut Graph, iv: NodeId, limit: NodeId) -> NodeId {
        let op = self.normalized_op();
        if self.stay_on_true {
            graph.compare(op, iv, limit)
        } else {
            // Every normalized op has a negation.
            let negated = op.negate().unwrap_or(op);
            graph.compare(negated, iv, limit)
        }
    }

    // =========================================================================
    // Overflow Guard
    // =========================================================================

    fn limit_check_key(&self, graph: &Graph) -> SpeculationReason {
        SpeculationReason::new(
            SpeculationGroup::LoopLimitCheck,
            graph.method(),
            graph.node(self.begin).bci(),
            DeoptimizationReason::LoopLimitCheck,
        )
    }

    /// Whether an overflow guard may be placed in front of the loop.
    pub fn can_create_overflow_guard(&self, graph: &Graph) -> bool {
        graph
            .speculation_log()
            .map_or(true, |log| log.may_speculate(&self.limit_check_key(graph)))
    }

    /// Place a guard before the loop that deopts when the limit is so close
    /// to the type bound that the counter could wrap.
    ///
    /// Reuses a guard placed by an earlier call. Returns `None` when the
    /// speculation log forbids the guard.
    pub fn create_overflow_guard(&self, graph: &mut Graph) -> Option<NodeId> {
        let forward = graph.forward_end(self.begin);
        let mut cursor = graph.predecessor(forward);
        while let Some(node) = cursor {
            if let Operator::FixedGuard { info, .. } = graph.op(node) {
                if info.reason == DeoptimizationReason::LoopLimitCheck
                    && graph.inputs(graph.input(node, 0)).contains(&self.limit)
                {
                    return Some(node);
                }
            }
            if graph.op(node).is_begin() {
                break;
            }
            cursor = graph.predecessor(node);
        }
        if !self.can_create_overflow_guard(graph) {
            return None;
        }

        let bits = self.iv.ty.bits()?;
        let s = self.iv.stride as i128;
        let incl = self.limit_included as i128;
        let (op, bound) = match self.direction {
            Direction::Up => (CmpOp::Le, IntegerStamp::max_value(bits) as i128 - s + 1 - incl),
            Direction::Down => (CmpOp::Ge, IntegerStamp::min_value(bits) as i128 - (s + 1) + incl),
        };
        let bound = graph.const_int(i64::try_from(bound).ok()?, self.iv.ty);
        let condition = graph.compare(op, self.limit, bound);

        let key = self.limit_check_key(graph);
        let mut info = DeoptInfo::new(
            DeoptimizationReason::LoopLimitCheck,
            DeoptimizationAction::InvalidateRecompile,
        );
        if let Some(log) = graph.speculation_log() {
            info = info.with_speculation(log.speculate(key));
        }
        let guard = graph.add(
            Operator::FixedGuard {
                info,
                negated: false,
            },
            &[condition],
            ValueType::Void,
        );
        graph.set_bci(guard, key.bci);
        graph.insert_before(forward, guard);
        Some(guard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{ControlBuilder, ControlFlowGraph, GraphBuilder};
    use crate::opt::loops::{detect_induction_variables, LoopFragment};

    fn classify(graph: &Graph) -> Option<CountedLoopInfo> {
        let cfg = ControlFlowGraph::compute(graph);
        let lp = &cfg.loops()[0];
        let whole = LoopFragment::whole(graph, &cfg, lp);
        let ivs = detect_induction_variables(graph, lp.begin, |n| whole.contains(n));
        CountedLoopInfo::detect(graph, lp.begin, &ivs, |n| whole.contains(n))
    }

    /// `for (i = init; i OP limit; i += stride)`, with the IV placed as
    /// given and exiting on the false side unless `exit_on_true`.
    fn counting(
        init: i64,
        limit: Option<i64>,
        op: CmpOp,
        stride: i64,
        iv_left: bool,
        exit_on_true: bool,
    ) -> Graph {
        let mut b = GraphBuilder::new(0);
        let n = match limit {
            Some(c) => b.int(c),
            None => b.parameter(ValueType::Int32),
        };
        let start = b.int(init);
        let step = b.int(stride);
        let mut lp = b.begin_loop(&[start], 10.0);
        let i = lp.phi(0);
        let cond = if iv_left {
            b.compare(op, i, n)
        } else {
            b.compare(op, n, i)
        };
        if exit_on_true {
            b.exit_if(&mut lp, cond);
        } else {
            b.exit_unless(&mut lp, cond);
        }
        let next = b.add(i, step);
        b.end_loop(lp, &[next], &[]);
        b.return_value(None);
        b.finish()
    }

    #[test]
    fn test_upward_exclusive() {
        let g = counting(0, Some(10), CmpOp::Lt, 1, true, false);
        let info = classify(&g).expect("counted");
        assert_eq!(info.direction(), Direction::Up);
        assert!(!info.limit_included());
        assert_eq!(info.constant_trip_count(&g), Some(10));
        assert!(info.counter_never_overflows(&g));
    }

    #[test]
    fn test_mirrored_and_negated_forms() {
        // 10 > i, stay on true.
        let g = counting(0, Some(10), CmpOp::Gt, 2, false, false);
        let info = classify(&g).expect("counted");
        assert_eq!(info.normalized_op(), CmpOp::Lt);
        assert_eq!(info.constant_trip_count(&g), Some(5));

        // exit when i > 9: runs while i <= 9.
        let g = counting(0, Some(9), CmpOp::Gt, 1, true, true);
        let info = classify(&g).expect("counted");
        assert_eq!(info.normalized_op(), CmpOp::Le);
        assert_eq!(info.stay_index(), 1);
        assert_eq!(info.constant_trip_count(&g), Some(10));
    }

    #[test]
    fn test_downward_and_empty_loops() {
        let g = counting(10, Some(0), CmpOp::Ge, -3, true, false);
        let info = classify(&g).expect("counted");
        assert_eq!(info.direction(), Direction::Down);
        // 10, 7, 4, 1
        assert_eq!(info.constant_trip_count(&g), Some(4));

        let g = counting(5, Some(0), CmpOp::Lt, 1, true, false);
        assert_eq!(classify(&g).and_then(|i| i.constant_trip_count(&g)), Some(0));
    }

    #[test]
    fn test_stride_sign_must_match_direction() {
        let g = counting(0, Some(10), CmpOp::Lt, -1, true, false);
        assert!(classify(&g).is_none());
    }

    #[test]
    fn test_not_equal_needs_unit_stride_and_ordering() {
        let g = counting(0, Some(10), CmpOp::Ne, 1, true, false);
        assert_eq!(classify(&g).map(|i| i.normalized_op()), Some(CmpOp::Lt));
        let g = counting(0, Some(10), CmpOp::Ne, 2, true, false);
        assert!(classify(&g).is_none());
        let g = counting(20, Some(10), CmpOp::Ne, 1, true, false);
        assert!(classify(&g).is_none());
    }

    #[test]
    fn test_unknown_limit_may_overflow() {
        let g = counting(0, None, CmpOp::Le, 1, true, false);
        let info = classify(&g).expect("counted");
        assert!(!info.counter_never_overflows(&g));
        assert_eq!(info.constant_trip_count(&g), None);
    }

    #[test]
    fn test_overflow_guard_is_placed_once() {
        let mut g = counting(0, None, CmpOp::Lt, 4, true, false);
        let info = classify(&g).expect("counted");
        let guard = info.create_overflow_guard(&mut g).expect("guard");
        assert_eq!(g.next(guard), Some(g.forward_end(info.begin())));
        let cond = g.input(guard, 0);
        assert_eq!(g.op(cond), &Operator::IntCmp(CmpOp::Le));
        assert_eq!(g.node(g.input(cond, 1)).as_int(), Some(i32::MAX as i64 - 3));

        assert_eq!(info.create_overflow_guard(&mut g), Some(guard));
        g.verify().expect("valid graph");
    }
}
