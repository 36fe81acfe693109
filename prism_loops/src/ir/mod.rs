//! Graph IR of the loop engine.
//!
//! # Core Components
//!
//! - **Arena** (`arena.rs`): stable handles, side tables, bit sets
//! - **Types** (`types.rs`): value widths and kinds
//! - **Operators** (`operators.rs`): the closed set of node kinds
//! - **Deopt** (`deopt.rs`): reasons, actions, speculation keys
//! - **Node** (`node.rs`) and **Graph** (`graph.rs`): nodes with
//!   symmetric input/usage and predecessor/successor edges
//! - **Stamps** (`stamp.rs`): integer ranges
//! - **Verify** (`verify.rs`): structural checks
//! - **CFG** (`cfg.rs`): blocks, dominators, natural loops, frequencies
//! - **Builder** (`builder/`): structured graph construction
//! - **Interp** (`interp.rs`): reference interpreter

pub mod arena;
pub mod builder;
pub mod cfg;
pub mod deopt;
pub mod graph;
pub mod interp;
pub mod node;
pub mod operators;
pub mod stamp;
pub mod types;
pub mod verify;

pub use arena::{Arena, BitSet, Id, SecondaryMap};
pub use builder::{ControlBuilder, GraphBuilder, GuardBuilder, LoopScope};
pub use cfg::{Block, BlockId, ControlFlowGraph, NaturalLoop};
pub use deopt::{
    DeoptInfo, DeoptimizationAction, DeoptimizationReason, GuardPriority, MethodId, Speculation,
    SpeculationGroup, SpeculationReason, SpeculationToken,
};
pub use graph::{Graph, ParameterInfo};
pub use interp::{Execution, InterpError, Interpreter, Outcome, Value};
pub use node::{Node, NodeFlags, NodeId};
pub use operators::{
    ArithOp, CmpOp, FrameStateInfo, LogicOp, LoopInfo, LoopKind, Operator, SwitchInfo,
};
pub use stamp::IntegerStamp;
pub use types::ValueType;
