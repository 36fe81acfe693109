//! Control-flow graph over the fixed nodes of a graph.
//!
//! Blocks are maximal runs of fixed nodes starting at a begin node
//! (`Start`, `Begin`, `Merge`, `LoopBegin`, `LoopExit`). On top of the
//! blocks this module computes:
//!
//! - reverse post-order
//! - the dominator tree (Cooper-Harvey-Kennedy)
//! - natural loops and their nesting, keyed by `LoopBegin`
//! - relative execution frequencies from branch probabilities and
//!   per-loop frequency estimates
//!
//! The CFG is a snapshot. Any mutation of control flow invalidates it.

use std::collections::VecDeque;

use rustc_hash::FxHashMap;

use super::arena::{Arena, BitSet, Id, SecondaryMap};
use super::graph::Graph;
use super::node::NodeId;
use super::operators::Operator;

/// Handle of a block.
pub type BlockId = Id<Block>;

/// Frequencies are clamped to this value to keep nested estimates finite.
const MAX_FREQUENCY: f64 = 1.0e12;

// =============================================================================
// Block
// =============================================================================

/// A basic block.
#[derive(Debug, Clone)]
pub struct Block {
    /// Begin node opening the block.
    pub begin: NodeId,
    /// Fixed nodes in control order, `begin` first.
    pub nodes: Vec<NodeId>,
    /// Predecessor blocks.
    pub predecessors: Vec<BlockId>,
    /// Successor blocks.
    pub successors: Vec<BlockId>,
    /// Executions per method invocation.
    pub frequency: f64,
    /// Innermost loop containing the block.
    pub innermost_loop: Option<usize>,
}

impl Block {
    /// Last fixed node of the block.
    pub fn end(&self) -> NodeId {
        self.nodes.last().copied().unwrap_or(self.begin)
    }
}

/// A natural loop.
#[derive(Debug, Clone)]
pub struct NaturalLoop {
    /// Header block.
    pub header: BlockId,
    /// The `LoopBegin` node.
    pub begin: NodeId,
    /// Blocks ending in a back edge to the header.
    pub back_edges: Vec<BlockId>,
    /// Member blocks, header included.
    pub blocks: Vec<BlockId>,
    /// Membership set over block indices.
    members: BitSet,
    /// Blocks starting with an exit of this loop.
    pub exits: Vec<BlockId>,
    /// Enclosing loop.
    pub parent: Option<usize>,
    /// Directly nested loops.
    pub children: Vec<usize>,
    /// Nesting depth, 1 for outermost loops.
    pub depth: u32,
}

impl NaturalLoop {
    /// Whether `block` belongs to the loop (nested loops included).
    #[inline]
    pub fn contains(&self, block: BlockId) -> bool {
        self.members.contains(block.as_usize())
    }
}

// =============================================================================
// Control Flow Graph
// =============================================================================

/// Blocks, dominators, loops and frequencies of a graph.
#[derive(Debug, Clone)]
pub struct ControlFlowGraph {
    blocks: Arena<Block>,
    block_of: FxHashMap<NodeId, BlockId>,
    entry: BlockId,
    rpo: Vec<BlockId>,
    rpo_index: SecondaryMap<Block, u32>,
    idom: SecondaryMap<Block, BlockId>,
    dom_depth: SecondaryMap<Block, u32>,
    loops: Vec<NaturalLoop>,
    loop_of_header: FxHashMap<BlockId, usize>,
}

impl ControlFlowGraph {
    /// Compute the CFG of `graph`.
    pub fn compute(graph: &Graph) -> Self {
        let mut cfg = ControlFlowGraph {
            blocks: Arena::new(),
            block_of: FxHashMap::default(),
            entry: BlockId::INVALID,
            rpo: Vec::new(),
            rpo_index: SecondaryMap::new(),
            idom: SecondaryMap::new(),
            dom_depth: SecondaryMap::new(),
            loops: Vec::new(),
            loop_of_header: FxHashMap::default(),
        };
        cfg.build_blocks(graph);
        cfg.compute_rpo();
        cfg.compute_dominators();
        cfg.compute_loops(graph);
        cfg.compute_frequencies(graph);
        cfg
    }

    fn block_for_begin(&mut self, begin: NodeId, worklist: &mut VecDeque<BlockId>) -> BlockId {
        if let Some(&block) = self.block_of.get(&begin) {
            return block;
        }
        let block = self.blocks.alloc(Block {
            begin,
            nodes: Vec::new(),
            predecessors: Vec::new(),
            successors: Vec::new(),
            frequency: 0.0,
            innermost_loop: None,
        });
        self.block_of.insert(begin, block);
        worklist.push_back(block);
        block
    }

    fn build_blocks(&mut self, graph: &Graph) {
        let mut worklist = VecDeque::new();
        self.entry = self.block_for_begin(graph.start(), &mut worklist);

        while let Some(block) = worklist.pop_front() {
            let mut current = self.blocks[block].begin;
            let mut nodes = vec![current];
            let mut successors = Vec::new();
            loop {
                let op = graph.op(current);
                if op.has_next() {
                    let Some(next) = graph.next(current) else {
                        break;
                    };
                    if graph.op(next).is_begin() {
                        successors.push(self.block_for_begin(next, &mut worklist));
                        break;
                    }
                    self.block_of.insert(next, block);
                    nodes.push(next);
                    current = next;
                    continue;
                }
                if op.is_control_split() {
                    for &succ in graph.successors(current) {
                        if succ.is_valid() {
                            successors.push(self.block_for_begin(succ, &mut worklist));
                        }
                    }
                } else if op.is_end() {
                    if let Some(merge) = graph.merge_of(current) {
                        successors.push(self.block_for_begin(merge, &mut worklist));
                    }
                }
                break;
            }
            self.blocks[block].nodes = nodes;
            self.blocks[block].successors = successors;
        }

        let edges: Vec<(BlockId, BlockId)> = self
            .blocks
            .iter()
            .flat_map(|(b, block)| block.successors.iter().map(move |&s| (b, s)))
            .collect();
        for (from, to) in edges {
            self.blocks[to].predecessors.push(from);
        }
    }

    fn compute_rpo(&mut self) {
        let mut visited = BitSet::with_capacity(self.blocks.len());
        let mut postorder = Vec::with_capacity(self.blocks.len());
        // Iterative DFS: (block, next successor index).
        let mut stack = vec![(self.entry, 0usize)];
        visited.insert(self.entry.as_usize());
        while let Some(&mut (block, ref mut next)) = stack.last_mut() {
            if let Some(&succ) = self.blocks[block].successors.get(*next) {
                *next += 1;
                if visited.insert(succ.as_usize()) {
                    stack.push((succ, 0));
                }
            } else {
                postorder.push(block);
                stack.pop();
            }
        }
        postorder.reverse();
        self.rpo = postorder;
        self.rpo_index = SecondaryMap::with_len(self.blocks.len());
        for (i, &block) in self.rpo.iter().enumerate() {
            self.rpo_index.set(block, i as u32);
        }
    }

    fn compute_dominators(&mut self) {
        let n = self.blocks.len();
        self.idom = SecondaryMap::with_len(n);
        for b in self.blocks.ids() {
            self.idom.set(b, BlockId::INVALID);
        }
        self.idom.set(self.entry, self.entry);

        let mut changed = true;
        while changed {
            changed = false;
            for i in 1..self.rpo.len() {
                let block = self.rpo[i];
                let mut new_idom = BlockId::INVALID;
                for &pred in &self.blocks[block].predecessors {
                    if !self.idom[pred].is_valid() {
                        continue;
                    }
                    new_idom = if new_idom.is_valid() {
                        self.intersect(pred, new_idom)
                    } else {
                        pred
                    };
                }
                if new_idom.is_valid() && self.idom[block] != new_idom {
                    self.idom.set(block, new_idom);
                    changed = true;
                }
            }
        }

        self.dom_depth = SecondaryMap::with_len(n);
        for i in 1..self.rpo.len() {
            let block = self.rpo[i];
            let parent = self.idom[block];
            if parent.is_valid() {
                let depth = self.dom_depth[parent] + 1;
                self.dom_depth.set(block, depth);
            }
        }
    }

    fn intersect(&self, mut a: BlockId, mut b: BlockId) -> BlockId {
        while a != b {
            while self.rpo_index[a] > self.rpo_index[b] {
                a = self.idom[a];
            }
            while self.rpo_index[b] > self.rpo_index[a] {
                b = self.idom[b];
            }
        }
        a
    }

    fn compute_loops(&mut self, graph: &Graph) {
        for &header in &self.rpo {
            let begin = self.blocks[header].begin;
            if !matches!(graph.op(begin), Operator::LoopBegin(_)) {
                continue;
            }
            let back_edges: Vec<BlockId> = graph
                .loop_ends(begin)
                .iter()
                .filter_map(|end| self.block_of.get(end).copied())
                .collect();

            let exits: Vec<BlockId> = graph
                .loop_exits(begin)
                .iter()
                .filter_map(|exit| self.block_of.get(exit).copied())
                .collect();

            let mut members = BitSet::with_capacity(self.blocks.len());
            members.insert(header.as_usize());
            let mut worklist: Vec<BlockId> = back_edges.clone();
            while let Some(block) = worklist.pop() {
                if members.insert(block.as_usize()) {
                    worklist.extend(self.blocks[block].predecessors.iter().copied());
                }
            }
            // Paths that end in a deopt without passing an exit belong to
            // the loop as well.
            let mut worklist: Vec<BlockId> = members.iter().map(|b| BlockId::new(b as u32)).collect();
            while let Some(block) = worklist.pop() {
                for &succ in &self.blocks[block].successors {
                    if !members.contains(succ.as_usize())
                        && !exits.contains(&succ)
                        && self.dominates(header, succ)
                    {
                        members.insert(succ.as_usize());
                        worklist.push(succ);
                    }
                }
            }
            let blocks: Vec<BlockId> = self
                .rpo
                .iter()
                .copied()
                .filter(|b| members.contains(b.as_usize()))
                .collect();

            self.loop_of_header.insert(header, self.loops.len());
            self.loops.push(NaturalLoop {
                header,
                begin,
                back_edges,
                blocks,
                members,
                exits,
                parent: None,
                children: Vec::new(),
                depth: 1,
            });
        }

        // Loops are in RPO of their headers, so an enclosing loop always
        // comes first; the innermost enclosing one is the last match.
        for i in 0..self.loops.len() {
            let header = self.loops[i].header;
            let parent = (0..i).rev().find(|&j| self.loops[j].contains(header));
            if let Some(parent) = parent {
                self.loops[i].parent = Some(parent);
                self.loops[i].depth = self.loops[parent].depth + 1;
                self.loops[parent].children.push(i);
            }
            for b in self.loops[i].blocks.clone() {
                self.blocks[b].innermost_loop = Some(i);
            }
        }
    }

    fn compute_frequencies(&mut self, graph: &Graph) {
        for i in 0..self.rpo.len() {
            let block = self.rpo[i];
            let begin = self.blocks[block].begin;
            let frequency = if block == self.entry {
                1.0
            } else {
                match graph.op(begin) {
                    Operator::LoopBegin(info) => {
                        let forward = graph.forward_end(begin);
                        let entry = self
                            .block_of
                            .get(&forward)
                            .map(|&b| self.blocks[b].frequency)
                            .unwrap_or(0.0);
                        entry * info.frequency
                    }
                    Operator::Merge => self.blocks[block]
                        .predecessors
                        .iter()
                        .map(|&p| self.blocks[p].frequency)
                        .sum::<f64>(),
                    _ => {
                        let pred_node = graph.predecessor(begin);
                        let pred_block = pred_node.and_then(|p| self.block_of.get(&p).copied());
                        match (pred_node, pred_block) {
                            (Some(p), Some(pb)) => {
                                self.blocks[pb].frequency * successor_probability(graph, p, begin)
                            }
                            _ => 0.0,
                        }
                    }
                }
            };
            self.blocks[block].frequency = frequency.min(MAX_FREQUENCY);
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Entry block.
    #[inline]
    pub fn entry(&self) -> BlockId {
        self.entry
    }

    /// Block by handle.
    #[inline]
    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id]
    }

    /// Number of reachable blocks.
    #[inline]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Whether there are no blocks.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Blocks in reverse post-order.
    #[inline]
    pub fn reverse_post_order(&self) -> &[BlockId] {
        &self.rpo
    }

    /// Block containing a reachable fixed node.
    #[inline]
    pub fn block_for(&self, node: NodeId) -> Option<BlockId> {
        self.block_of.get(&node).copied()
    }

    /// Immediate dominator.
    pub fn idom(&self, block: BlockId) -> Option<BlockId> {
        let idom = self.idom.get(block).copied().unwrap_or(BlockId::INVALID);
        (idom.is_valid() && idom != block).then_some(idom)
    }

    /// Depth in the dominator tree; the entry has depth 0.
    #[inline]
    pub fn dominator_depth(&self, block: BlockId) -> u32 {
        self.dom_depth.get(block).copied().unwrap_or(0)
    }

    /// Whether `a` dominates `b`.
    pub fn dominates(&self, a: BlockId, mut b: BlockId) -> bool {
        let depth = self.dominator_depth(a);
        while self.dominator_depth(b) > depth {
            match self.idom(b) {
                Some(d) => b = d,
                None => return false,
            }
        }
        a == b
    }

    /// Whether `a` dominates `b` and differs from it.
    #[inline]
    pub fn strictly_dominates(&self, a: BlockId, b: BlockId) -> bool {
        a != b && self.dominates(a, b)
    }

    /// Nearest common dominator.
    pub fn common_dominator(&self, mut a: BlockId, mut b: BlockId) -> BlockId {
        while a != b {
            if self.dominator_depth(a) >= self.dominator_depth(b) {
                a = self.idom(a).unwrap_or(self.entry);
            } else {
                b = self.idom(b).unwrap_or(self.entry);
            }
        }
        a
    }

    /// Immediate dominator, skipping over loops that do not contain
    /// `block`.
    pub fn dominator_skip_loops(&self, block: BlockId) -> Option<BlockId> {
        let mut d = self.idom(block)?;
        while let Some(l) = self.blocks[d].innermost_loop {
            if self.loops[l].contains(block) {
                break;
            }
            d = self.idom(self.loops[l].header)?;
        }
        Some(d)
    }

    /// Natural loops in RPO of their headers; parents before children.
    #[inline]
    pub fn loops(&self) -> &[NaturalLoop] {
        &self.loops
    }

    /// Loop headed by `block`.
    pub fn loop_for_header(&self, block: BlockId) -> Option<usize> {
        self.loop_of_header.get(&block).copied()
    }

    /// Whether `block` is a loop header.
    pub fn is_loop_header(&self, block: BlockId) -> bool {
        self.loop_of_header.contains_key(&block)
    }

    /// Loop nesting depth of a block, 0 outside loops.
    pub fn loop_depth(&self, block: BlockId) -> u32 {
        self.blocks[block]
            .innermost_loop
            .map(|l| self.loops[l].depth)
            .unwrap_or(0)
    }
}

/// Probability that control goes from split `split` to its successor `succ`.
fn successor_probability(graph: &Graph, split: NodeId, succ: NodeId) -> f64 {
    match graph.op(split) {
        Operator::If { true_probability } => {
            if graph.successor(split, 0) == Some(succ) {
                *true_probability
            } else {
                1.0 - *true_probability
            }
        }
        Operator::Switch(info) => graph
            .successor_index(split, succ)
            .and_then(|i| info.probabilities.get(i).copied())
            .unwrap_or(0.0),
        _ => 1.0,
    }
}
