//! Late GC root placement over a typed SSA IR.
//!
//! The pass runs once per function, after all optimization: it finds
//! every tracked pointer live across a safepoint, packs the live ones
//! into the fewest possible stack slots by chordal graph coloring, and
//! rewrites the function to push, fill, and pop the frame the collector
//! scans. See the `pass` module for the phase breakdown and `ir` for the
//! input contract.
//!
//! ```
//! use gc_lowering::ir::{Callee, FunctionBuilder, Module, Ty};
//! use gc_lowering::LateGcLower;
//!
//! let mut module = Module::new();
//! let helper = module.declare("rt_helper", Ty::TRACKED_PTR);
//!
//! let mut b = FunctionBuilder::new("demo", &[Ty::RAW_PTR]);
//! let out = b.arg(0);
//! b.thread_state();
//! let root = b.call(Callee::Sym(helper), &[], Ty::TRACKED_PTR);
//! b.call(Callee::Sym(helper), &[], Ty::TRACKED_PTR);
//! b.store(root, out);
//! b.ret_void();
//! let mut func = b.finish();
//!
//! let stats = LateGcLower::new().run(&mut module, &mut func);
//! assert_eq!(stats.frame_slots, 1);
//! ```

pub mod ir;
pub mod pass;

pub use pass::{LateGcLower, PassConfig, PassStats};
