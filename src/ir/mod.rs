//! Typed SSA intermediate representation consumed by the pass.
//!
//! # Core Components
//!
//! - **Arena** (`arena.rs`): typed-index arenas, secondary maps, bit sets
//! - **Types** (`types.rs`): address spaces and the closed type lattice
//! - **Instructions** (`instr.rs`): the closed instruction union
//! - **Function** (`func.rs`): value/instruction/block storage and CFG
//! - **Builder** (`builder.rs`): producer-facing construction API
//!
//! # Design Principles
//!
//! - **Arena allocation**: dense ids, cache-friendly traversal
//! - **Opaque pointers**: a pointer is its address space, nothing more
//! - **Closed unions**: every consumer matches exhaustively

pub mod arena;
pub mod builder;
pub mod func;
pub mod instr;
pub mod types;

// Re-export commonly used types
pub use arena::{Arena, BitSet, Id, SecondaryMap};
pub use builder::FunctionBuilder;
pub use func::{
    BlockId, Const, Function, InstId, Module, SymbolId, ValueDef, ValueId,
};
pub use instr::{CallConv, CallInst, Callee, InstKind, Intrinsic, MemTag};
pub use types::{AddrSpace, Ty};
