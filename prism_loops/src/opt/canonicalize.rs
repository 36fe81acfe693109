//! Local simplification run after every loop transformation.
//!
//! # Rules
//!
//! - **Values**: constant folding, `x + c1 + c2` reassociation, algebraic
//!   identities, compares decided by stamps, boolean identities
//! - **Phis and proxies**: phis with a single distinct value, proxies of
//!   constants and parameters
//! - **Control**: splits on constants, guards with constant conditions, merges
//!   with one end, loops without back edges, straight-line `Begin`s
//! - **Dead code**: fixed nodes unreachable from `Start` and every
//!   floating node depending on them, then unused floating nodes
//!
//! The transformations only have to leave a structurally sound graph;
//! folding the copies they create is left to this pass.

use log::trace;

use crate::ir::{
    ArithOp, BitSet, CmpOp, DeoptInfo, Graph, IntegerStamp, LogicOp, NodeId, Operator, ValueType,
};

/// Simplifies a graph after a transformation.
pub trait Canonicalizer {
    /// Simplify the graph, starting from `touched` (all nodes when empty).
    /// Returns the number of changes made.
    fn canonicalize(&self, graph: &mut Graph, touched: &[NodeId]) -> usize;
}

/// Canonicalizer implementing the rules listed in the module docs.
#[derive(Debug, Clone)]
pub struct SimpleCanonicalizer {
    max_rounds: u32,
}

impl Default for SimpleCanonicalizer {
    fn default() -> Self {
        Self { max_rounds: 16 }
    }
}

impl SimpleCanonicalizer {
    /// Canonicalizer with the default round limit.
    pub fn new() -> Self {
        Self::default()
    }

    /// Limit the number of value/control/dead-code rounds.
    pub fn with_max_rounds(max_rounds: u32) -> Self {
        Self {
            max_rounds: max_rounds.max(1),
        }
    }
}

impl Canonicalizer for SimpleCanonicalizer {
    fn canonicalize(&self, graph: &mut Graph, touched: &[NodeId]) -> usize {
        let mut total = 0;
        let mut seeds: Vec<NodeId> = if touched.is_empty() {
            graph.live_nodes().collect()
        } else {
            touched.to_vec()
        };
        for _ in 0..self.max_rounds {
            let mut changes = simplify_values(graph, seeds);
            let control = simplify_control(graph) + remove_unreachable(graph);
            changes += control + remove_unused(graph);
            total += changes;
            if control == 0 {
                break;
            }
            seeds = graph.live_nodes().collect();
        }
        trace!("canonicalization made {} changes", total);
        total
    }
}

// =============================================================================
// Values
// =============================================================================

enum Simplified {
    Keep,
    Replace(NodeId),
    Remove,
}

fn simplify_values(graph: &mut Graph, seeds: Vec<NodeId>) -> usize {
    let mut changes = 0;
    let mut queued = BitSet::with_capacity(graph.capacity());
    let mut worklist = Vec::with_capacity(seeds.len());
    for id in seeds.into_iter().rev() {
        if queued.insert(id.as_usize()) {
            worklist.push(id);
        }
    }
    while let Some(id) = worklist.pop() {
        queued.remove(id.as_usize());
        if !graph.is_live(id) || !graph.op(id).is_floating() {
            continue;
        }
        match simplify(graph, id) {
            Simplified::Keep => {}
            Simplified::Replace(new) => {
                let users = graph.users(id);
                graph.replace_at_usages(id, new);
                graph.kill_with_unused_inputs(id);
                changes += 1;
                for user in users.into_iter().chain(std::iter::once(new)) {
                    if queued.insert(user.as_usize()) {
                        worklist.push(user);
                    }
                }
            }
            Simplified::Remove => {
                graph.kill_with_unused_inputs(id);
                changes += 1;
            }
        }
    }
    changes
}

fn simplify(graph: &mut Graph, id: NodeId) -> Simplified {
    let replaced = match graph.op(id).clone() {
        Operator::IntOp(op) => simplify_arith(graph, id, op),
        Operator::IntCmp(op) => simplify_compare(graph, id, op),
        Operator::Logic(op) => simplify_logic(graph, id, op),
        Operator::Not => simplify_not(graph, id),
        Operator::SignExtend => graph
            .node(graph.input(id, 0))
            .as_int()
            .map(|c| graph.const_int(c, ValueType::Int64)),
        Operator::Phi => simplify_phi(graph, id),
        Operator::Proxy => {
            let value = graph.input(id, 1);
            matches!(graph.op(value), Operator::ConstInt(_) | Operator::ConstBool(_) | Operator::Parameter(_))
                .then_some(value)
        }
        Operator::Guard { negated, .. } => {
            return match graph.node(graph.input(id, 0)).as_bool() {
                Some(c) if c != negated => Simplified::Remove,
                _ => Simplified::Keep,
            };
        }
        _ => None,
    };
    match replaced {
        Some(new) if new != id => Simplified::Replace(new),
        _ => Simplified::Keep,
    }
}

fn simplify_arith(graph: &mut Graph, id: NodeId, op: ArithOp) -> Option<NodeId> {
    let ty = graph.ty(id);
    let (a, b) = (graph.input(id, 0), graph.input(id, 1));
    let (ca, cb) = (graph.node(a).as_int(), graph.node(b).as_int());
    if let (Some(x), Some(y)) = (ca, cb) {
        return op.eval(ty, x, y).map(|v| graph.const_int(v, ty));
    }
    match op {
        ArithOp::Add => {
            if cb == Some(0) {
                return Some(a);
            }
            if ca == Some(0) {
                return Some(b);
            }
            if ca.is_some() {
                return Some(graph.arith(ArithOp::Add, b, a, ty));
            }
            // (x + c1) + c2  =>  x + (c1 + c2)
            let nested = matches!(graph.op(a), Operator::IntOp(ArithOp::Add)) && graph.ty(a) == ty;
            if let (Some(c2), true) = (cb, nested) {
                let (x, inner) = (graph.input(a, 0), graph.input(a, 1));
                if let Some(c1) = graph.node(inner).as_int() {
                    let c = graph.const_int(c1.wrapping_add(c2), ty);
                    return Some(graph.arith(ArithOp::Add, x, c, ty));
                }
            }
            None
        }
        ArithOp::Sub => {
            if a == b {
                return Some(graph.const_int(0, ty));
            }
            cb.map(|c| {
                if c == 0 {
                    a
                } else {
                    let negated = graph.const_int(c.wrapping_neg(), ty);
                    graph.arith(ArithOp::Add, a, negated, ty)
                }
            })
        }
        ArithOp::Mul => match (ca, cb) {
            (_, Some(1)) => Some(a),
            (Some(1), _) => Some(b),
            (_, Some(0)) | (Some(0), _) => Some(graph.const_int(0, ty)),
            _ => None,
        },
        ArithOp::Div => (cb == Some(1)).then_some(a),
        ArithOp::Min | ArithOp::Max => (a == b).then_some(a),
    }
}

fn simplify_compare(graph: &mut Graph, id: NodeId, op: CmpOp) -> Option<NodeId> {
    let (a, b) = (graph.input(id, 0), graph.input(id, 1));
    let bits = graph.ty(a).bits().unwrap_or(64);
    if let (Some(x), Some(y)) = (graph.node(a).as_int(), graph.node(b).as_int()) {
        return Some(graph.const_bool(op.eval(bits, x, y)));
    }
    if a == b {
        let same = matches!(op, CmpOp::Le | CmpOp::Ge | CmpOp::Eq);
        return Some(graph.const_bool(same));
    }
    if op == CmpOp::Below && graph.node(b).as_int() == Some(0) {
        return Some(graph.const_bool(false));
    }
    decide_by_stamps(graph, op, a, b).map(|v| graph.const_bool(v))
}

/// Outcome of `a op b` when the stamps of `a` and `b` settle it.
fn decide_by_stamps(graph: &Graph, op: CmpOp, a: NodeId, b: NodeId) -> Option<bool> {
    let (sa, sb) = (graph.stamp(a)?, graph.stamp(b)?);
    let less = |x: &IntegerStamp, y: &IntegerStamp, or_equal: bool| {
        if (or_equal && x.upper <= y.lower) || (!or_equal && x.upper < y.lower) {
            Some(true)
        } else if (or_equal && x.lower > y.upper) || (!or_equal && x.lower >= y.upper) {
            Some(false)
        } else {
            None
        }
    };
    let disjoint = sa.upper < sb.lower || sb.upper < sa.lower;
    match op {
        CmpOp::Lt => less(&sa, &sb, false),
        CmpOp::Le => less(&sa, &sb, true),
        CmpOp::Gt => less(&sb, &sa, false),
        CmpOp::Ge => less(&sb, &sa, true),
        CmpOp::Eq => disjoint.then_some(false),
        CmpOp::Ne => disjoint.then_some(true),
        CmpOp::Below => None,
    }
}

fn simplify_logic(graph: &mut Graph, id: NodeId, op: LogicOp) -> Option<NodeId> {
    let (a, b) = (graph.input(id, 0), graph.input(id, 1));
    if a == b {
        return Some(a);
    }
    let (ca, cb) = (graph.node(a).as_bool(), graph.node(b).as_bool());
    // The absorbing element of And is false, of Or true.
    let absorbing = op == LogicOp::Or;
    match (ca, cb) {
        (Some(x), _) if x == absorbing => Some(a),
        (_, Some(y)) if y == absorbing => Some(b),
        (Some(_), _) => Some(b),
        (_, Some(_)) => Some(a),
        _ => None,
    }
}

fn simplify_not(graph: &mut Graph, id: NodeId) -> Option<NodeId> {
    let value = graph.input(id, 0);
    if let Some(c) = graph.node(value).as_bool() {
        return Some(graph.const_bool(!c));
    }
    match graph.op(value) {
        Operator::Not => Some(graph.input(value, 0)),
        Operator::IntCmp(op) => {
            let negated = op.negate()?;
            let (a, b) = (graph.input(value, 0), graph.input(value, 1));
            Some(graph.compare(negated, a, b))
        }
        _ => None,
    }
}

fn simplify_phi(graph: &Graph, id: NodeId) -> Option<NodeId> {
    let merge = graph.input(id, 0);
    if !graph.is_live(merge) || !graph.op(merge).is_merge() {
        return None;
    }
    let mut unique = None;
    for &value in &graph.inputs(id)[1..] {
        if value == id || Some(value) == unique {
            continue;
        }
        if unique.is_some() {
            return None;
        }
        unique = Some(value);
    }
    unique
}

// =============================================================================
// Control
// =============================================================================

/// Replace `split` by its successor `taken`.
///
/// The other successors are left without a predecessor; dead code
/// elimination removes them.
pub(crate) fn fold_split(graph: &mut Graph, split: NodeId, taken: usize) {
    let successors = graph.successors(split).to_vec();
    let Some(&keep) = successors.get(taken) else {
        return;
    };
    for index in 0..successors.len() {
        graph.set_successor(split, index, NodeId::INVALID);
    }
    graph.replace_at_predecessor(split, keep);
    graph.kill_with_unused_inputs(split);
}

fn simplify_control(graph: &mut Graph) -> usize {
    let mut changes = 0;
    let nodes: Vec<NodeId> = graph.live_nodes().filter(|&n| graph.op(n).is_fixed()).collect();
    for id in nodes {
        if !graph.is_live(id) {
            continue;
        }
        let changed = match graph.op(id) {
            Operator::If { .. } => match graph.node(graph.input(id, 0)).as_bool() {
                Some(c) => {
                    fold_split(graph, id, if c { 0 } else { 1 });
                    true
                }
                None => false,
            },
            Operator::Switch(info) => match graph.node(graph.input(id, 0)).as_int() {
                Some(v) => {
                    let taken = info.successor_for(v);
                    fold_split(graph, id, taken);
                    true
                }
                None => false,
            },
            Operator::FixedGuard { info, negated } => {
                let (info, negated) = (*info, *negated);
                let cond = graph.input(id, 0);
                match graph.node(cond).as_bool() {
                    Some(c) if c != negated => {
                        graph.remove_fixed(id);
                        collect_if_unused(graph, cond);
                        true
                    }
                    Some(_) => {
                        always_deoptimize(graph, id, info);
                        collect_if_unused(graph, cond);
                        true
                    }
                    None => false,
                }
            }
            Operator::Merge => graph.inputs(id).len() == 1 && collapse_merge(graph, id),
            Operator::LoopBegin(_) => graph.inputs(id).len() == 1 && remove_loop(graph, id),
            Operator::Begin => remove_straight_line_begin(graph, id),
            _ => false,
        };
        if changed {
            changes += 1;
        }
    }
    changes
}

/// Replace a guard that always fails by a deopt; the code after it
/// becomes unreachable.
fn always_deoptimize(graph: &mut Graph, guard: NodeId, info: DeoptInfo) {
    let deopt = graph.add(Operator::Deoptimize(info), &[], ValueType::Void);
    graph.set_bci(deopt, graph.node(guard).bci());
    let state = graph.node(guard).state();
    graph.set_state(deopt, state);
    if graph.next(guard).is_some() {
        graph.set_next(guard, NodeId::INVALID);
    }
    graph.replace_at_predecessor(guard, deopt);
    graph.kill(guard);
}

/// Fold a merge or loop begin with a single forward end into its
/// predecessor block.
fn collapse_merge(graph: &mut Graph, merge: NodeId) -> bool {
    let end = graph.input(merge, 0);
    let Some(pred) = graph.predecessor(end) else {
        return false;
    };
    for phi in graph.phis(merge) {
        let value = graph.phi_value(phi, 0);
        if value != phi {
            graph.replace_at_usages(phi, value);
        }
        graph.kill(phi);
    }
    let anchor = graph.block_begin(pred);
    for guard in graph.anchored_guards(merge) {
        graph.set_input(guard, 1, anchor);
    }
    if let Some(next) = graph.next(merge) {
        graph.set_next(merge, NodeId::INVALID);
        graph.replace_at_predecessor(end, next);
    }
    let state = graph.node(merge).state();
    graph.kill(merge);
    graph.kill(end);
    if let Some(state) = state {
        collect_if_unused(graph, state);
    }
    true
}

/// A loop whose back edges all died: its exits become plain begins and
/// the header is folded into the entry.
fn remove_loop(graph: &mut Graph, begin: NodeId) -> bool {
    if graph.predecessor(graph.forward_end(begin)).is_none() {
        return false;
    }
    for exit in graph.loop_exits(begin) {
        for proxy in graph.proxies(exit) {
            let value = graph.input(proxy, 1);
            graph.replace_at_usages(proxy, value);
            graph.kill(proxy);
        }
        let plain = graph.add(Operator::Begin, &[], ValueType::Void);
        graph.replace_at_predecessor(exit, plain);
        if let Some(next) = graph.next(exit) {
            graph.set_next(exit, NodeId::INVALID);
            graph.set_next(plain, next);
        }
        for guard in graph.anchored_guards(exit) {
            graph.set_input(guard, 1, plain);
        }
        graph.kill_with_unused_inputs(exit);
    }
    collapse_merge(graph, begin)
}

fn remove_straight_line_begin(graph: &mut Graph, begin: NodeId) -> bool {
    let Some(pred) = graph.predecessor(begin) else {
        return false;
    };
    if !graph.op(pred).has_next() {
        return false;
    }
    let anchor = graph.block_begin(pred);
    for guard in graph.anchored_guards(begin) {
        graph.set_input(guard, 1, anchor);
    }
    let state = graph.node(begin).state();
    graph.remove_fixed(begin);
    if let Some(state) = state {
        collect_if_unused(graph, state);
    }
    true
}

fn collect_if_unused(graph: &mut Graph, id: NodeId) {
    if graph.is_live(id) && graph.is_collectable(id) && !graph.has_usages(id) {
        graph.kill_with_unused_inputs(id);
    }
}

// =============================================================================
// Dead Code
// =============================================================================

fn reachable_fixed(graph: &Graph) -> BitSet {
    let mut reached = BitSet::with_capacity(graph.capacity());
    let mut worklist = vec![graph.start()];
    reached.insert(graph.start().as_usize());
    while let Some(id) = worklist.pop() {
        let mut visit = |succ: NodeId, worklist: &mut Vec<NodeId>| {
            if reached.insert(succ.as_usize()) {
                worklist.push(succ);
            }
        };
        for &succ in graph.successors(id) {
            if succ.is_valid() {
                visit(succ, &mut worklist);
            }
        }
        if graph.op(id).is_end() {
            if let Some(merge) = graph.merge_of(id) {
                visit(merge, &mut worklist);
            }
        }
    }
    reached
}

/// Delete fixed nodes unreachable from `Start`, everything floating that
/// depends on them, and the merge inputs they fed.
fn remove_unreachable(graph: &mut Graph) -> usize {
    let reached = reachable_fixed(graph);
    let dead: Vec<NodeId> = graph
        .live_nodes()
        .filter(|&n| graph.op(n).is_fixed() && !reached.contains(n.as_usize()))
        .collect();
    if dead.is_empty() {
        return 0;
    }

    for &end in &dead {
        if !graph.op(end).is_end() {
            continue;
        }
        if let Some(merge) = graph.merge_of(end) {
            if reached.contains(merge.as_usize()) {
                if let Some(index) = graph.end_index(merge, end) {
                    graph.remove_end_at(merge, index);
                }
            }
        }
    }

    let mut doomed = BitSet::with_capacity(graph.capacity());
    let mut floating = Vec::new();
    let mut worklist = dead.clone();
    while let Some(id) = worklist.pop() {
        for user in graph.users(id) {
            if graph.op(user).is_floating() && doomed.insert(user.as_usize()) {
                floating.push(user);
                worklist.push(user);
            }
        }
    }
    for &id in dead.iter().chain(&floating) {
        graph.kill(id);
    }
    trace!(
        "removed {} unreachable fixed and {} dependent floating nodes",
        dead.len(),
        floating.len()
    );
    dead.len() + floating.len()
}

/// Delete floating nodes nothing reads.
fn remove_unused(graph: &mut Graph) -> usize {
    let before = graph.live_count();
    let candidates: Vec<NodeId> = graph
        .live_nodes()
        .filter(|&n| graph.is_collectable(n) && !graph.has_usages(n))
        .collect();
    for id in candidates {
        collect_if_unused(graph, id);
    }
    before - graph.live_count()
}
