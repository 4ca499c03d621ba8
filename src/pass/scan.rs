//! Per-block local scan.
//!
//! One backward walk over each block records everything the dataflow
//! needs: defs, upward-exposed uses (split by whether a safepoint already
//! roots them), uses living on incoming phi edges, safepoints, and
//! refinement opportunities. Numbering happens on the fly, so by the end
//! of the scan every pointer of interest has its identifier.
//!
//! Scanning backward means "safepoints so far" are the safepoints *after*
//! the current instruction in program order, which is exactly the set a
//! def could be live at.

use smallvec::SmallVec;

use crate::ir::{
    Callee, Function, InstId, InstKind, Intrinsic, MemTag, Module, SymbolId, Ty, ValueDef, ValueId,
};
use crate::ir::{AddrSpace, BitSet, BlockId};

use super::numbering::{lift_phi, lift_select, number, number_vector};
use super::{State, CALLER_ROOTED};

// =============================================================================
// Block state
// =============================================================================

/// Scan and dataflow bitsets for one block, indexed by identifier.
#[derive(Debug, Clone, Default)]
pub(crate) struct BlockState {
    /// Identifiers first defined in this block.
    pub defs: BitSet,
    /// Uses living on this block's outgoing edges (successor phis).
    pub phi_outs: BitSet,
    /// Used before any def, not yet rooted by a safepoint.
    pub up_exposed_uses_unrooted: BitSet,
    /// Used before any def, already rooted at entry.
    pub up_exposed_uses: BitSet,
    /// Defined without a following safepoint in the block.
    pub down_exposed_unrooted: BitSet,
    /// Dataflow: live at block entry.
    pub live_in: BitSet,
    /// Dataflow: live at block exit.
    pub live_out: BitSet,
    /// Dataflow: entered the block without passing a safepoint since def.
    pub unrooted_in: BitSet,
    /// Dataflow: left the block without passing a safepoint since def.
    pub unrooted_out: BitSet,
    /// Safepoint numbers in this block, in reverse program order.
    pub safepoints: SmallVec<[i32; 4]>,
    /// Whether the block contains any safepoint.
    pub has_safepoint: bool,
}

/// Which use set an operand lands in.
#[derive(Clone, Copy)]
enum UseSink {
    /// `up_exposed_uses` of the instruction's block.
    Rooted,
    /// `up_exposed_uses_unrooted` of the instruction's block.
    Unrooted,
    /// `phi_outs` of a predecessor (the use lives on the edge).
    PhiOut,
}

// =============================================================================
// Recording
// =============================================================================

fn note_use(state: &mut State, func: &mut Function, block: BlockId, v: ValueId, sink: UseSink) {
    // Constants are trivially rooted; skip before any numbering.
    if func.is_const(v) {
        return;
    }
    let mut nums: SmallVec<[i32; 4]> = SmallVec::new();
    if func.value_ty(v).is_gc_ptr_vec() {
        nums.extend(number_vector(state, func, v));
    } else {
        let num = number(state, func, v);
        if num == CALLER_ROOTED {
            return;
        }
        nums.push(num);
    }
    let bbs = state.block_states.get_or_default(block);
    let set = match sink {
        UseSink::Rooted => &mut bbs.up_exposed_uses,
        UseSink::Unrooted => &mut bbs.up_exposed_uses_unrooted,
        UseSink::PhiOut => &mut bbs.phi_outs,
    };
    for num in nums {
        set.insert(num as usize);
    }
}

fn note_operand_uses(
    state: &mut State,
    func: &mut Function,
    block: BlockId,
    inst: InstId,
    sink: UseSink,
) {
    let mut operands: SmallVec<[ValueId; 4]> = SmallVec::new();
    func.inst(inst).kind.for_each_operand(|v| operands.push(v));
    for v in operands {
        let ty = func.value_ty(v);
        if ty.is_gc_ptr() || ty.is_gc_ptr_vec() {
            note_use(state, func, block, v, sink);
        }
    }
}

fn note_def(state: &mut State, func: &Function, block: BlockId, num: i32) {
    debug_assert_ne!(num, CALLER_ROOTED);
    let bbs = state.block_states.get_or_default(block);
    if bbs.defs.contains(num as usize) {
        panic!(
            "SSA violation or misnumbering: second def of {}",
            func.display_value(state.reverse_ptr_numbering[num as usize])
        );
    }
    bbs.defs.insert(num as usize);
    bbs.up_exposed_uses.remove(num as usize);
    bbs.up_exposed_uses_unrooted.remove(num as usize);
    if !bbs.has_safepoint {
        bbs.down_exposed_unrooted.insert(num as usize);
    }
    // The def could be live at any safepoint below it, but only if it
    // escapes the block.
    let safepoints = bbs.safepoints.clone();
    for sp in safepoints {
        state.live_if_live_out[sp as usize].push(num);
    }
}

fn maybe_note_def(
    state: &mut State,
    func: &mut Function,
    block: BlockId,
    def: Option<ValueId>,
    refinement: Option<i32>,
) {
    let Some(def) = def else { return };
    let ty = func.value_ty(def);
    if ty.is_gc_ptr() {
        assert!(
            ty.addr_space() == Some(AddrSpace::Tracked),
            "defined value of GC interest is not tracked: {}",
            func.display_value(def)
        );
    } else if ty.is_gc_ptr_vec() {
        let nums = number_vector(state, func, def);
        for num in nums {
            note_def(state, func, block, num);
            if let Some(refined) = refinement {
                state.load_refinements.insert(num, refined);
            }
        }
        return;
    } else if !ty.is_union_rep() {
        return;
    }
    let num = number(state, func, def);
    note_def(state, func, block, num);
    if let Some(refined) = refinement {
        state.load_refinements.insert(num, refined);
    }
}

fn note_safepoint(state: &mut State, block: BlockId, inst: InstId) -> i32 {
    let num = state.reverse_safepoint_numbering.len() as i32;
    state.safepoint_numbering.insert(inst, num);
    state.reverse_safepoint_numbering.push(inst);
    // Everything upward exposed here is rooted by this safepoint from the
    // perspective of instructions above it.
    let snapshot = {
        let bbs = state.block_states.get_or_default(block);
        let unrooted = std::mem::take(&mut bbs.up_exposed_uses_unrooted);
        bbs.up_exposed_uses.union_with(&unrooted);
        bbs.up_exposed_uses.clone()
    };
    state.live_sets.push(snapshot);
    state.live_if_live_out.push(SmallVec::new());
    num
}

// =============================================================================
// Refinement detection
// =============================================================================

/// A chain of pointer arithmetic bottoming out at an untracked function
/// argument: the callee's own argument area. Loads of tracked pointers
/// from there are rooted by the caller.
fn looks_like_frame_ref(func: &Function, v: ValueId) -> bool {
    if func.value_ty(v).is_gc_ptr() {
        return false;
    }
    match func.value_def(v) {
        ValueDef::Arg(_) => true,
        ValueDef::Inst(inst) => match &func.inst(inst).kind {
            InstKind::Gep { base, .. } => looks_like_frame_ref(func, *base),
            _ => false,
        },
        ValueDef::Const(_) => false,
    }
}

// =============================================================================
// Scan
// =============================================================================

/// Scan every block backward, producing the numbered state.
pub(crate) fn local_scan(func: &mut Function, module: &Module) -> State {
    let memcmp = module.lookup("memcmp");
    let mut state = State::new();
    let blocks: Vec<BlockId> = func.block_ids().collect();
    for &block in &blocks {
        // Walk by predecessor so instructions lifting inserts in front of
        // the cursor are still visited.
        let mut cursor = func.block_insts(block).last().copied();
        while let Some(inst) = cursor {
            scan_inst(&mut state, func, block, inst, memcmp);
            cursor = func.prev_in_block(inst);
        }
        // Seed the dataflow.
        let bbs = state.block_states.get_or_default(block);
        bbs.live_in = bbs.up_exposed_uses.clone();
        bbs.live_in.union_with(&bbs.up_exposed_uses_unrooted);
        bbs.unrooted_out = bbs.down_exposed_unrooted.clone();
    }
    state
}

fn scan_inst(
    state: &mut State,
    func: &mut Function,
    block: BlockId,
    inst: InstId,
    memcmp: Option<SymbolId>,
) {
    let kind = func.inst(inst).kind.clone();
    match kind {
        InstKind::Call(call) => {
            if let Callee::Intrinsic(intrinsic) = call.callee {
                // Memory markers are never GC uses, defs, or safepoints.
                if intrinsic.is_memory_marker() {
                    return;
                }
            }
            maybe_note_def(state, func, block, func.inst_result(inst), None);
            note_operand_uses(state, func, block, inst, UseSink::Rooted);
            for &arg in &call.args {
                if func.value_ty(arg).is_union_rep() {
                    note_use(state, func, block, arg, UseSink::Rooted);
                }
            }
            if call.returns_twice {
                state.returns_twice.push(inst);
            }
            // Known runtime helpers that never stop for a collection.
            let exempt = match call.callee {
                Callee::Intrinsic(Intrinsic::PointerFromTracked) => true,
                Callee::Sym(sym) => Some(sym) == memcmp,
                _ => false,
            };
            if exempt {
                return;
            }
            let num = note_safepoint(state, block, inst);
            let bbs = state.block_states.get_or_default(block);
            bbs.has_safepoint = true;
            bbs.safepoints.push(num);
        }
        InstKind::Load { ptr, tag } => {
            let result = func.inst_result(inst);
            let mut refinement = None;
            if tag == MemTag::ImmutableField && func.value_ty(ptr).is_gc_ptr() {
                // The loaded value stays rooted as long as the object it
                // was loaded from is.
                refinement = Some(number(state, func, ptr));
            } else if result.is_some_and(|r| func.value_ty(r).is_gc_ptr())
                && looks_like_frame_ref(func, ptr)
            {
                refinement = Some(CALLER_ROOTED);
            }
            maybe_note_def(state, func, block, result, refinement);
            note_operand_uses(state, func, block, inst, UseSink::Unrooted);
        }
        InstKind::Select { .. } => {
            let result = func.inst_result(inst).expect("select has a result");
            let ty = func.value_ty(result);
            if !ty.is_gc_ptr() {
                return;
            }
            if ty.addr_space() != Some(AddrSpace::Tracked) {
                // A merge of derived pointers needs a parallel merge of
                // the bases for the root slot.
                if !state.all_ptr_numbering.contains_key(&result) {
                    lift_select(state, func, inst);
                }
            } else {
                maybe_note_def(state, func, block, Some(result), None);
                note_operand_uses(state, func, block, inst, UseSink::Unrooted);
            }
        }
        InstKind::Phi { incomings } => {
            let result = func.inst_result(inst).expect("phi has a result");
            let ty = func.value_ty(result);
            if !ty.is_gc_ptr() {
                return;
            }
            if ty.addr_space() != Some(AddrSpace::Tracked) {
                if !state.all_ptr_numbering.contains_key(&result) {
                    lift_phi(state, func, inst);
                }
            } else {
                maybe_note_def(state, func, block, Some(result), None);
                // Incoming values are uses on the edge from their
                // predecessor, not uses inside this block.
                for (pred, incoming) in incomings {
                    note_use(state, func, pred, incoming, UseSink::PhiOut);
                }
            }
        }
        InstKind::Store { .. } | InstKind::Ret { .. } => {
            note_operand_uses(state, func, block, inst, UseSink::Unrooted);
        }
        InstKind::AddrSpaceCast(_) => {
            let result = func.inst_result(inst);
            if result.is_some_and(|r| func.value_ty(r).addr_space() == Some(AddrSpace::Tracked)) {
                maybe_note_def(state, func, block, result, None);
            }
        }
        InstKind::Alloca { elem, count } => {
            if elem == Ty::TRACKED_PTR && count == 1 {
                state.allocas.push(inst);
            }
        }
        _ => {}
    }
}

// =============================================================================
// Tests
// =============================================================================
