//! Late GC root placement.
//!
//! Runs after all optimization, immediately before code generation. For
//! every function it determines which tracked pointers are live across
//! each safepoint, packs them into frame slots the collector scans, and
//! rewrites the IR to maintain that frame:
//!
//! 1. **Local scan** (`scan.rs`): one backward walk per block, numbering
//!    pointers and recording per-block bitsets.
//! 2. **Dataflow** (`dataflow.rs`): liveness and rootedness fixpoint over
//!    the CFG, then per-safepoint live sets and the interference graph.
//! 3. **Coloring** (`color.rs`): perfect-elimination-order greedy coloring
//!    packs identifiers into the minimum number of slots.
//! 4. **Placement** (`frame.rs`): frame alloca, push/pop, root stores.
//! 5. **Cleanup** (`cleanup.rs`): pseudo-intrinsic lowering.
//!
//! Rootedness only matters at safepoints; everything the pass computes is
//! ultimately a property of safepoints, not of arbitrary program points.

pub(crate) mod cleanup;
pub(crate) mod color;
pub(crate) mod dataflow;
pub(crate) mod frame;
pub(crate) mod numbering;
pub(crate) mod scan;

use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::fmt::Write as _;

use crate::ir::func::BlockData;
use crate::ir::{BitSet, Callee, Function, InstId, InstKind, Intrinsic, Module, SecondaryMap, ValueId};

use scan::BlockState;

/// Identifier of a value known to be rooted by the caller (constants,
/// arguments, frame references). Never materialized into a slot.
pub(crate) const CALLER_ROOTED: i32 = -1;

// =============================================================================
// Pass state
// =============================================================================

/// All state accumulated across the phases of one pass invocation.
///
/// This is the single heap object the pass allocates; it is dropped when
/// the invocation returns.
#[derive(Default)]
pub(crate) struct State {
    /// The maximum assigned pointer number (-1 when none).
    pub max_ptr_number: i32,
    /// Cache of numbers for every value touched, including derived ones.
    pub all_ptr_numbering: FxHashMap<ValueId, i32>,
    /// Per-lane numbers for vector-of-pointer values.
    pub all_vector_numbering: FxHashMap<ValueId, Vec<i32>>,
    /// number -> canonical value. Dense; lanes of one vector share the
    /// vector value.
    pub reverse_ptr_numbering: Vec<ValueId>,
    /// Interference neighbors: for each number, all numbers co-live with
    /// it at some safepoint (itself included).
    pub neighbors: Vec<BitSet>,
    /// Per-block scan and dataflow results.
    pub block_states: SecondaryMap<BlockData, BlockState>,
    /// A use of the key is redundant wherever the value (or the caller's
    /// frame, for `CALLER_ROOTED`) is also live.
    pub load_refinements: FxHashMap<i32, i32>,
    /// Safepoint numbers, assigned in scan order.
    pub safepoint_numbering: FxHashMap<InstId, i32>,
    /// safepoint number -> instruction.
    pub reverse_safepoint_numbering: Vec<InstId>,
    /// Calls through which control may re-enter. Values live at these get
    /// private frame slots; their liveness cannot be reasoned about.
    pub returns_twice: Vec<InstId>,
    /// Per-safepoint live sets, indexed by safepoint number.
    pub live_sets: Vec<BitSet>,
    /// Per-safepoint: numbers defined above the safepoint that are live
    /// there iff they are live out of the block.
    pub live_if_live_out: Vec<SmallVec<[i32; 4]>>,
    /// Tracked-pointer stack slots that were never promoted to SSA; each
    /// is sunk into a reserved frame slot.
    pub allocas: Vec<InstId>,
}

impl State {
    pub fn new() -> Self {
        State {
            max_ptr_number: -1,
            ..State::default()
        }
    }

    /// Number of safepoints recorded.
    pub fn safepoint_count(&self) -> usize {
        self.reverse_safepoint_numbering.len()
    }

    /// Debugging utility: render the per-block liveness state.
    #[allow(dead_code)]
    pub fn dump_liveness(&self, func: &Function) -> String {
        let mut out = String::new();
        for b in func.block_ids() {
            let Some(bbs) = self.block_states.get(b) else {
                continue;
            };
            let _ = writeln!(out, "liveness for block {}", b);
            let mut line = |name: &str, set: &BitSet| {
                let ids: Vec<String> = set
                    .iter()
                    .map(|i| format!("{}", func.display_value(self.reverse_ptr_numbering[i])))
                    .collect();
                let _ = writeln!(out, "  {}: {}", name, ids.join(", "));
            };
            line("defs", &bbs.defs);
            line("phi_outs", &bbs.phi_outs);
            line("up_exposed_uses", &bbs.up_exposed_uses);
            line("up_exposed_uses_unrooted", &bbs.up_exposed_uses_unrooted);
            line("down_exposed_unrooted", &bbs.down_exposed_unrooted);
            line("live_in", &bbs.live_in);
            line("live_out", &bbs.live_out);
            line("unrooted_in", &bbs.unrooted_in);
            line("unrooted_out", &bbs.unrooted_out);
        }
        out
    }
}

// =============================================================================
// Configuration and statistics
// =============================================================================

/// Target-dependent constants of the runtime ABI.
#[derive(Debug, Clone)]
pub struct PassConfig {
    /// Word offset of the root-chain head within the thread state.
    pub gc_stack_slot: i64,
    /// Bytes per frame slot.
    pub word_size: u64,
}

impl Default for PassConfig {
    fn default() -> Self {
        PassConfig {
            gc_stack_slot: 0,
            word_size: 8,
        }
    }
}

/// Statistics from one pass invocation.
#[derive(Debug, Clone, Default)]
pub struct PassStats {
    /// Tracked identifiers assigned during numbering.
    pub tracked_ids: usize,
    /// Safepoints recorded during the scan.
    pub safepoints: usize,
    /// Root slots in the emitted frame (0 when no frame was needed).
    pub frame_slots: usize,
    /// Root stores emitted into the frame.
    pub frame_stores: usize,
    /// Unpromoted allocas sunk into the frame.
    pub sunk_allocas: usize,
    /// Pseudo-intrinsic call sites lowered during cleanup.
    pub lowered_calls: usize,
}

// =============================================================================
// Pass entry
// =============================================================================

/// The late GC root placement pass.
#[derive(Debug, Default)]
pub struct LateGcLower {
    config: PassConfig,
}

impl LateGcLower {
    /// Create the pass with the default ABI configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the pass with an explicit ABI configuration.
    pub fn with_config(config: PassConfig) -> Self {
        LateGcLower { config }
    }

    /// The ABI configuration.
    pub fn config(&self) -> &PassConfig {
        &self.config
    }

    /// Run the pass on one function.
    ///
    /// A function whose entry block carries no thread-state getter has no
    /// GC activity; only the cleanup phase runs for it.
    pub fn run(&self, module: &mut Module, func: &mut Function) -> PassStats {
        let mut stats = PassStats::default();

        let Some(thread_state) = find_thread_state(func) else {
            stats.lowered_calls = cleanup::cleanup_ir(self, module, func);
            return stats;
        };

        let mut state = scan::local_scan(func, module);
        dataflow::compute_liveness(func, &mut state);
        dataflow::compute_live_sets(func, &mut state);
        let colors = color::color_roots(&state);
        let frame = frame::place_roots(self, func, &mut state, &colors, thread_state);

        stats.tracked_ids = (state.max_ptr_number + 1) as usize;
        stats.safepoints = state.safepoint_count();
        stats.frame_slots = frame.slots;
        stats.frame_stores = frame.stores;
        stats.sunk_allocas = frame.sunk_allocas;
        stats.lowered_calls = cleanup::cleanup_ir(self, module, func);
        stats
    }
}

/// Find the thread-state getter call in the entry block.
fn find_thread_state(func: &Function) -> Option<InstId> {
    for &inst in func.block_insts(func.entry) {
        if let InstKind::Call(call) = &func.inst(inst).kind {
            if call.callee == Callee::Intrinsic(Intrinsic::ThreadState) {
                return Some(inst);
            }
        }
    }
    None
}

// =============================================================================
// Tests
// =============================================================================
