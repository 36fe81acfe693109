//! Loop analysis.
//!
//! [`LoopsData`] wraps the control-flow graph of a method with one
//! [`LoopEx`] per natural loop. A `LoopEx` knows its blocks, its whole
//! node fragment, its induction variables and, when the exit test has the
//! right shape, its [`CountedLoopInfo`].
//!
//! The analysis is a snapshot: every transformation invalidates it and the
//! phase drivers recompute it before looking at loops again.

pub mod counted;
pub mod fragment;
pub mod induction;

pub use counted::CountedLoopInfo;
pub use fragment::{prune_unused_copies, DuplicationMap, LoopFragment};
pub use induction::{detect_induction_variables, Direction, InductionVariable, IvKind, OffsetForm};

use rustc_hash::FxHashMap;

use crate::ir::{BitSet, BlockId, ControlFlowGraph, Graph, LoopInfo, NodeId};

// =============================================================================
// LoopEx
// =============================================================================

/// One natural loop with its derived data.
#[derive(Debug, Clone)]
pub struct LoopEx {
    index: usize,
    begin: NodeId,
    header: BlockId,
    parent: Option<usize>,
    children: Vec<usize>,
    depth: u32,
    blocks: Vec<BlockId>,
    block_members: BitSet,
    exits: Vec<NodeId>,
    whole: LoopFragment,
    ivs: FxHashMap<NodeId, InductionVariable>,
    counted: Option<CountedLoopInfo>,
}

impl LoopEx {
    /// Index in [`LoopsData::loops`].
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    /// The `LoopBegin`.
    #[inline]
    pub fn begin(&self) -> NodeId {
        self.begin
    }

    /// Header block.
    #[inline]
    pub fn header(&self) -> BlockId {
        self.header
    }

    /// Enclosing loop.
    #[inline]
    pub fn parent(&self) -> Option<usize> {
        self.parent
    }

    /// Directly nested loops.
    #[inline]
    pub fn children(&self) -> &[usize] {
        &self.children
    }

    /// Nesting depth, 1 for outermost loops.
    #[inline]
    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Whether no loop is nested inside.
    #[inline]
    pub fn is_innermost(&self) -> bool {
        self.children.is_empty()
    }

    /// Member blocks.
    #[inline]
    pub fn blocks(&self) -> &[BlockId] {
        &self.blocks
    }

    /// Whether `block` belongs to the loop.
    #[inline]
    pub fn contains_block(&self, block: BlockId) -> bool {
        self.block_members.contains(block.as_usize())
    }

    /// `LoopExit` nodes, ascending.
    #[inline]
    pub fn exits(&self) -> &[NodeId] {
        &self.exits
    }

    /// Every node of the loop.
    #[inline]
    pub fn whole(&self) -> &LoopFragment {
        &self.whole
    }

    /// Number of nodes in the loop.
    #[inline]
    pub fn size(&self) -> usize {
        self.whole.len()
    }

    /// Whether `node` is computed outside the loop.
    #[inline]
    pub fn is_invariant(&self, node: NodeId) -> bool {
        !self.whole.contains(node)
    }

    /// Induction variables, keyed by node.
    #[inline]
    pub fn induction_variables(&self) -> &FxHashMap<NodeId, InductionVariable> {
        &self.ivs
    }

    /// Induction variable held by `node`.
    #[inline]
    pub fn induction_variable(&self, node: NodeId) -> Option<&InductionVariable> {
        self.ivs.get(&node)
    }

    /// Counted loop descriptor.
    #[inline]
    pub fn counted(&self) -> Option<&CountedLoopInfo> {
        self.counted.as_ref()
    }

    /// Whether the loop is counted.
    #[inline]
    pub fn is_counted(&self) -> bool {
        self.counted.is_some()
    }

    /// Metadata stored on the `LoopBegin`.
    pub fn info(&self, graph: &Graph) -> LoopInfo {
        graph.loop_info(self.begin).copied().unwrap_or_default()
    }

    /// Expected iterations per entry.
    pub fn frequency(&self, graph: &Graph) -> f64 {
        self.info(graph).frequency
    }
}

// =============================================================================
// LoopsData
// =============================================================================

/// Loop analysis of a graph.
#[derive(Debug, Clone)]
pub struct LoopsData {
    cfg: ControlFlowGraph,
    loops: Vec<LoopEx>,
    by_begin: FxHashMap<NodeId, usize>,
}

impl LoopsData {
    /// Analyze every loop of `graph`.
    pub fn compute(graph: &Graph) -> Self {
        let cfg = ControlFlowGraph::compute(graph);
        let mut loops = Vec::with_capacity(cfg.loops().len());
        let mut by_begin = FxHashMap::default();
        for (index, natural) in cfg.loops().iter().enumerate() {
            let whole = LoopFragment::whole(graph, &cfg, natural);
            let in_loop = |n: NodeId| whole.contains(n);
            let ivs = detect_induction_variables(graph, natural.begin, in_loop);
            let counted = CountedLoopInfo::detect(graph, natural.begin, &ivs, in_loop);
            let mut block_members = BitSet::with_capacity(cfg.len());
            for &b in &natural.blocks {
                block_members.insert(b.as_usize());
            }
            by_begin.insert(natural.begin, index);
            loops.push(LoopEx {
                index,
                begin: natural.begin,
                header: natural.header,
                parent: natural.parent,
                children: natural.children.clone(),
                depth: natural.depth,
                blocks: natural.blocks.clone(),
                block_members,
                exits: graph.loop_exits(natural.begin),
                whole,
                ivs,
                counted,
            });
        }
        LoopsData {
            cfg,
            loops,
            by_begin,
        }
    }

    /// Control-flow graph the analysis is based on.
    #[inline]
    pub fn cfg(&self) -> &ControlFlowGraph {
        &self.cfg
    }

    /// Loops, enclosing loops before nested ones.
    #[inline]
    pub fn loops(&self) -> &[LoopEx] {
        &self.loops
    }

    /// Number of loops.
    #[inline]
    pub fn len(&self) -> usize {
        self.loops.len()
    }

    /// Whether the graph has no loops.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    /// Loop headed by `begin`.
    pub fn loop_for(&self, begin: NodeId) -> Option<&LoopEx> {
        self.by_begin.get(&begin).map(|&i| &self.loops[i])
    }

    /// Loop by index.
    #[inline]
    pub fn get(&self, index: usize) -> &LoopEx {
        &self.loops[index]
    }

    /// Loops with nested loops before their parents.
    pub fn inner_first(&self) -> Vec<&LoopEx> {
        let mut order: Vec<&LoopEx> = self.loops.iter().collect();
        order.sort_by(|a, b| b.depth.cmp(&a.depth).then(a.begin.cmp(&b.begin)));
        order
    }

    /// Innermost loop containing the fixed node `node`.
    pub fn innermost_loop_of(&self, node: NodeId) -> Option<&LoopEx> {
        let block = self.cfg.block_for(node)?;
        self.cfg.block(block).innermost_loop.map(|i| &self.loops[i])
    }

    /// Induction variable held by `node` in the deepest loop that has one.
    pub fn induction_variable(&self, node: NodeId) -> Option<(&LoopEx, &InductionVariable)> {
        self.loops
            .iter()
            .filter_map(|lp| lp.induction_variable(node).map(|iv| (lp, iv)))
            .max_by_key(|(lp, _)| lp.depth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{CmpOp, ControlBuilder, GraphBuilder, ValueType};

    #[test]
    fn test_nested_loops() {
        let mut b = GraphBuilder::new(0);
        let n = b.parameter(ValueType::Int32);
        let zero = b.int(0);
        let one = b.int(1);

        let mut outer = b.begin_loop(&[zero], 10.0);
        let i = outer.phi(0);
        let c = b.compare(CmpOp::Lt, i, n);
        b.exit_unless(&mut outer, c);

        let mut inner = b.begin_loop(&[zero], 10.0);
        let j = inner.phi(0);
        let d = b.compare(CmpOp::Lt, j, i);
        b.exit_unless(&mut inner, d);
        let j1 = b.add(j, one);
        let inner_begin = inner.begin();
        b.end_loop(inner, &[j1], &[]);

        let i1 = b.add(i, one);
        let outer_begin = outer.begin();
        b.end_loop(outer, &[i1], &[]);
        b.return_value(None);
        let g = b.finish();

        let data = LoopsData::compute(&g);
        assert_eq!(data.len(), 2);
        let o = data.loop_for(outer_begin).expect("outer loop");
        let inn = data.loop_for(inner_begin).expect("inner loop");
        assert_eq!(o.depth(), 1);
        assert_eq!(inn.depth(), 2);
        assert_eq!(inn.parent(), Some(o.index()));
        assert!(!o.is_innermost());
        assert!(inn.is_innermost());
        assert_eq!(data.inner_first()[0].begin(), inner_begin);

        // The inner limit is the outer IV: invariant for the inner loop only.
        assert!(inn.is_invariant(i));
        assert!(!o.is_invariant(i));
        assert!(o.whole().contains(inner_begin));
        assert!(inn.is_counted());
        assert!(o.is_counted());

        let (owner, iv) = data.induction_variable(j).expect("iv");
        assert_eq!(owner.begin(), inner_begin);
        assert_eq!(iv.stride, 1);
        assert_eq!(data.innermost_loop_of(inner_begin).map(LoopEx::begin), Some(inner_begin));
    }
}
