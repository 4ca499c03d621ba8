//! GC frame materialization.
//!
//! The frame is one stack array of canonical tracked pointers:
//!
//! | slot            | contents                                  |
//! |-----------------|-------------------------------------------|
//! | 0               | root count, encoded as `nroots << 1`      |
//! | 1               | saved previous top of the frame chain     |
//! | 2 ..            | one slot per unpromoted alloca            |
//! | 2 + nallocas .. | one slot per color                        |
//!
//! The low bit of the count word is reserved for the runtime. The frame
//! is zeroed in full at entry, published as the new chain top right after
//! the thread-state getter, and unlinked before every return. Root
//! stores sink to the first safepoint that needs them, so paths without
//! safepoints pay nothing.

use rustc_hash::FxHashSet;

use crate::ir::{BitSet, BlockId, Function, InstId, InstKind, Intrinsic, MemTag, Ty, ValueId};

use super::{LateGcLower, State};

/// What frame materialization emitted.
#[derive(Debug, Default)]
pub(crate) struct FrameStats {
    /// Root slots in the frame (excluding the two header slots).
    pub slots: usize,
    /// Root stores emitted.
    pub stores: usize,
    /// Allocas replaced by frame slots.
    pub sunk_allocas: usize,
}

/// Allocate the frame, sink allocas, place root stores, and emit the
/// push/pop protocol. No-op for functions with nothing to root.
pub(crate) fn place_roots(
    pass: &LateGcLower,
    func: &mut Function,
    state: &mut State,
    colors: &[i32],
    thread_state: InstId,
) -> FrameStats {
    let max_color = colors.iter().copied().max().unwrap_or(-1);
    if max_color == -1 && state.allocas.is_empty() {
        return FrameStats::default();
    }
    let nroots = (max_color + 1) as usize + state.allocas.len();

    // The frame itself, zeroed in full.
    let frame_inst = func.prepend(
        func.entry,
        InstKind::Alloca {
            elem: Ty::TRACKED_PTR,
            count: (nroots + 2) as u32,
        },
        Ty::RAW_PTR,
    );
    let frame = func.inst_result(frame_inst).expect("alloca has a result");
    let fill = func.iconst(Ty::Int8, 0);
    let len = func.iconst(Ty::Int64, (pass.config.word_size * (nroots as u64 + 2)) as i64);
    func.insert_after(
        frame_inst,
        Function::intrinsic_kind(Intrinsic::Memset, [frame, fill, len]),
        Ty::Void,
    );

    push_frame(pass, func, frame, nroots, thread_state);

    // Sink unpromoted allocas into their reserved slots.
    let mut slot: i64 = 2;
    let allocas = state.allocas.clone();
    for alloca in &allocas {
        let gep_kind = func.const_gep_kind(frame, slot);
        slot += 1;
        let gep = func.insert_after(frame_inst, gep_kind, Ty::RAW_PTR);
        let gep_v = func.inst_result(gep).expect("gep has a result");
        let alloca_v = func.inst_result(*alloca).expect("alloca has a result");
        // The slot's lifetime is the whole frame's; the alloca's markers
        // no longer apply.
        strip_lifetime_markers(func, alloca_v);
        func.replace_all_uses(alloca_v, gep_v);
        func.erase(*alloca);
    }
    let min_color_root = slot;

    let stores = place_frame_stores(func, state, colors, frame, min_color_root);

    // Unlink before every return. Non-return exits are the runtime's
    // problem, not ours.
    let blocks: Vec<BlockId> = func.block_ids().collect();
    for block in blocks {
        if let Some(term) = func.terminator(block) {
            if matches!(func.inst(term).kind, InstKind::Ret { .. }) {
                pop_frame(pass, func, frame, thread_state, term);
            }
        }
    }

    FrameStats {
        slots: nroots,
        stores,
        sunk_allocas: allocas.len(),
    }
}

// =============================================================================
// Push / pop protocol
// =============================================================================

/// Address of the thread-local frame-chain head.
fn chain_head_addr(
    pass: &LateGcLower,
    func: &mut Function,
    thread_state_v: ValueId,
    before: InstId,
) -> ValueId {
    let kind = func.const_gep_kind(thread_state_v, pass.config.gc_stack_slot);
    let gep = func.insert_before(before, kind, Ty::RAW_PTR);
    func.inst_result(gep).expect("gep has a result")
}

/// Write the count word, save the previous chain top into slot 1, and
/// publish the frame, immediately after the thread-state getter.
fn push_frame(
    pass: &LateGcLower,
    func: &mut Function,
    frame: ValueId,
    nroots: usize,
    thread_state: InstId,
) {
    let thread_state_v = func
        .inst_result(thread_state)
        .expect("thread-state getter has a result");

    // Count word: nroots << 1, low bit reserved for the runtime.
    let slot0 = {
        let kind = func.const_gep_kind(frame, 0);
        func.insert_after(thread_state, kind, Ty::RAW_PTR)
    };
    let slot0_v = func.inst_result(slot0).expect("gep has a result");
    let count = func.iconst(Ty::Int64, (nroots as i64) << 1);
    let store_count = func.insert_after(
        slot0,
        InstKind::Store {
            value: count,
            ptr: slot0_v,
            tag: MemTag::GcFrame,
        },
        Ty::Void,
    );

    // Save the current chain top into slot 1.
    let head = {
        let kind = func.const_gep_kind(thread_state_v, pass.config.gc_stack_slot);
        func.insert_after(store_count, kind, Ty::RAW_PTR)
    };
    let head_v = func.inst_result(head).expect("gep has a result");
    let prev = func.insert_after(
        head,
        InstKind::Load {
            ptr: head_v,
            tag: MemTag::GcFrame,
        },
        Ty::RAW_PTR,
    );
    let prev_v = func.inst_result(prev).expect("load has a result");
    let slot1 = {
        let kind = func.const_gep_kind(frame, 1);
        func.insert_after(prev, kind, Ty::RAW_PTR)
    };
    let slot1_v = func.inst_result(slot1).expect("gep has a result");
    let save = func.insert_after(
        slot1,
        InstKind::Store {
            value: prev_v,
            ptr: slot1_v,
            tag: MemTag::GcFrame,
        },
        Ty::Void,
    );

    // Publish the frame as the new top.
    func.insert_after(
        save,
        InstKind::Store {
            value: frame,
            ptr: head_v,
            tag: MemTag::GcFrame,
        },
        Ty::Void,
    );
}

/// Restore the saved chain top from slot 1, immediately before a return.
fn pop_frame(
    pass: &LateGcLower,
    func: &mut Function,
    frame: ValueId,
    thread_state: InstId,
    before: InstId,
) {
    let thread_state_v = func
        .inst_result(thread_state)
        .expect("thread-state getter has a result");
    let slot1_kind = func.const_gep_kind(frame, 1);
    let slot1 = func.insert_before(before, slot1_kind, Ty::RAW_PTR);
    let slot1_v = func.inst_result(slot1).expect("gep has a result");
    let prev = func.insert_before(
        before,
        InstKind::Load {
            ptr: slot1_v,
            tag: MemTag::GcFrame,
        },
        Ty::RAW_PTR,
    );
    let prev_v = func.inst_result(prev).expect("load has a result");
    let head = chain_head_addr(pass, func, thread_state_v, before);
    func.insert_before(
        before,
        InstKind::Store {
            value: prev_v,
            ptr: head,
            tag: MemTag::GcFrame,
        },
        Ty::Void,
    );
}

// =============================================================================
// Root stores
// =============================================================================

/// Union of live sets at the nearest preceding safepoints over all paths
/// into `block`: union at the frontier, intersection across paths.
fn pred_live_out(func: &Function, state: &State, block: BlockId) -> BitSet {
    let mut live = BitSet::new();
    let mut first = true;
    let mut visited: FxHashSet<BlockId> = FxHashSet::default();
    let mut worklist = vec![block];
    while let Some(b) = worklist.pop() {
        for &pred in func.preds(b) {
            if !visited.insert(pred) {
                continue;
            }
            let bbs = &state.block_states[pred];
            if !bbs.has_safepoint {
                worklist.push(pred);
                continue;
            }
            // Bottom-most safepoint of the predecessor.
            let last = bbs.safepoints[0] as usize;
            if first {
                live.union_with(&state.live_sets[last]);
                first = false;
            } else {
                live.intersect_with(&state.live_sets[last]);
            }
        }
    }
    live
}

/// Store each root in front of the first safepoint that needs it.
fn place_frame_stores(
    func: &mut Function,
    state: &mut State,
    colors: &[i32],
    frame: ValueId,
    min_color_root: i64,
) -> usize {
    let mut emitted = 0;
    let blocks: Vec<BlockId> = func.block_ids().collect();
    for block in blocks {
        if !state.block_states[block].has_safepoint {
            continue;
        }
        let mut last_live = pred_live_out(func, state, block);
        // Safepoints are recorded in reverse program order.
        let safepoints: Vec<i32> = state.block_states[block]
            .safepoints
            .iter()
            .rev()
            .copied()
            .collect();
        for sp in safepoints {
            let now_live = state.live_sets[sp as usize].clone();
            let at = state.reverse_safepoint_numbering[sp as usize];
            for num in now_live.iter() {
                if !last_live.contains(num) {
                    place_frame_store(func, state, num, colors, min_color_root, frame, at);
                    emitted += 1;
                }
            }
            last_live = now_live;
        }
    }
    emitted
}

/// One store of a root's canonical value into its colored slot.
fn place_frame_store(
    func: &mut Function,
    state: &State,
    num: usize,
    colors: &[i32],
    min_color_root: i64,
    frame: ValueId,
    before: InstId,
) {
    let mut value = state.reverse_ptr_numbering[num];

    // A vector lane must be extracted at the store point.
    if func.value_ty(value).is_gc_ptr_vec() {
        let lanes = &state.all_vector_numbering[&value];
        let lane = lanes
            .iter()
            .position(|&l| l == num as i32)
            .expect("lane number belongs to its vector") as u32;
        let extract = func.insert_before(
            before,
            InstKind::ExtractElement { vec: value, lane },
            Ty::TRACKED_PTR,
        );
        value = func.inst_result(extract).expect("extract has a result");
    }

    let slot = colors[num] as i64 + min_color_root;
    let gep_kind = func.const_gep_kind(frame, slot);
    let gep = func.insert_before(before, gep_kind, Ty::RAW_PTR);
    let gep_v = func.inst_result(gep).expect("gep has a result");

    // Union values store their pointer field.
    if func.value_ty(value).is_union_rep() {
        let extract = func.insert_before(
            before,
            InstKind::ExtractValue {
                agg: value,
                field: 0,
            },
            Ty::TRACKED_PTR,
        );
        value = func.inst_result(extract).expect("extract has a result");
    }
    if func.value_ty(value) != Ty::TRACKED_PTR {
        panic!(
            "root store of a value that is not a tracked pointer: {}",
            func.display_value(value)
        );
    }
    func.insert_before(
        before,
        InstKind::Store {
            value,
            ptr: gep_v,
            tag: MemTag::None,
        },
        Ty::Void,
    );
}

// =============================================================================
// Lifetime markers
// =============================================================================

/// Delete lifetime markers reachable from an alloca through pointer
/// rewrites. Other users are left alone; an unexpected user kind means
/// the producer handed us something that is not an alloca use chain.
fn strip_lifetime_markers(func: &mut Function, root: ValueId) {
    let mut to_delete = Vec::new();
    collect_lifetime_markers(func, root, &mut to_delete);
    for inst in to_delete {
        func.erase(inst);
    }
}

fn collect_lifetime_markers(func: &Function, v: ValueId, out: &mut Vec<InstId>) {
    for user in func.users(v) {
        match &func.inst(user).kind {
            InstKind::Call(call) => {
                if let crate::ir::Callee::Intrinsic(intrinsic) = call.callee {
                    if intrinsic.is_lifetime_marker() {
                        out.push(user);
                    }
                }
            }
            InstKind::Load { .. }
            | InstKind::Store { .. }
            | InstKind::Select { .. }
            | InstKind::Phi { .. } => {}
            InstKind::Gep { .. } | InstKind::BitCast(_) | InstKind::AddrSpaceCast(_) => {
                if let Some(result) = func.inst_result(user) {
                    collect_lifetime_markers(func, result, out);
                }
            }
            other => panic!(
                "unexpected user of a sunk alloca: {} of {}",
                other.mnemonic(),
                func.display_value(v)
            ),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Callee, FunctionBuilder, Module};
    use crate::pass::{color, dataflow, scan};

    fn run_to_frame(module: &Module, func: &mut Function) -> (State, Vec<i32>, FrameStats) {
        let thread_state = func
            .block_insts(func.entry)
            .iter()
            .copied()
            .find(|&i| {
                matches!(
                    &func.inst(i).kind,
                    InstKind::Call(c) if c.callee == Callee::Intrinsic(Intrinsic::ThreadState)
                )
            })
            .expect("entry has a thread-state getter");
        let mut state = scan::local_scan(func, module);
        dataflow::compute_liveness(func, &mut state);
        dataflow::compute_live_sets(func, &mut state);
        let colors = color::color_roots(&state);
        let stats = place_roots(&LateGcLower::new(), func, &mut state, &colors, thread_state);
        (state, colors, stats)
    }

    fn count_kind(func: &Function, pred: impl Fn(&InstKind) -> bool) -> usize {
        func.block_ids()
            .flat_map(|b| func.block_insts(b).to_vec())
            .filter(|&i| pred(&func.inst(i).kind))
            .count()
    }

    #[test]
    fn test_no_frame_when_nothing_live() {
        let mut m = Module::new();
        let mut b = FunctionBuilder::new("f", &[]);
        b.thread_state();
        let sym = m.declare("rt_noop", Ty::Void);
        b.call_void(Callee::Sym(sym), &[]);
        b.ret_void();
        let mut f = b.finish();

        let (_, _, stats) = run_to_frame(&m, &mut f);
        assert_eq!(stats.slots, 0);
        assert_eq!(stats.stores, 0);
        assert_eq!(
            count_kind(&f, |k| matches!(k, InstKind::Alloca { .. })),
            0
        );
    }

    #[test]
    fn test_alloca_only_frame() {
        let mut m = Module::new();
        let mut b = FunctionBuilder::new("f", &[]);
        b.thread_state();
        let slot = b.alloca(Ty::TRACKED_PTR, 1);
        b.lifetime_start(slot);
        let v = b.load(slot, Ty::TRACKED_PTR);
        b.store(v, slot);
        b.lifetime_end(slot);
        b.ret_void();
        let mut f = b.finish();

        let (_, _, stats) = run_to_frame(&m, &mut f);
        assert_eq!(stats.slots, 1);
        assert_eq!(stats.sunk_allocas, 1);
        // The original alloca is gone; only the frame alloca remains.
        assert_eq!(
            count_kind(&f, |k| matches!(k, InstKind::Alloca { .. })),
            1
        );
        // Lifetime markers on it were stripped.
        assert_eq!(
            count_kind(&f, |k| matches!(
                k,
                InstKind::Call(c) if matches!(c.callee, Callee::Intrinsic(i) if i.is_lifetime_marker())
            )),
            0
        );
    }

    #[test]
    fn test_straight_line_store_and_pop() {
        // r live across one safepoint: one slot, one store, one pop.
        let mut m = Module::new();
        let mut b = FunctionBuilder::new("f", &[Ty::RAW_PTR]);
        let p = b.arg(0);
        b.thread_state();
        let make = m.declare("rt_make", Ty::TRACKED_PTR);
        let r = b.call(Callee::Sym(make), &[], Ty::TRACKED_PTR);
        let noop = m.declare("rt_noop", Ty::Void);
        b.call_void(Callee::Sym(noop), &[]);
        b.store(r, p);
        b.ret_void();
        let mut f = b.finish();

        let (state, colors, stats) = run_to_frame(&m, &mut f);
        assert_eq!(stats.slots, 1);
        assert_eq!(stats.stores, 1);
        let r_num = state.all_ptr_numbering[&r] as usize;
        assert_eq!(colors[r_num], 0);

        // Exactly one frame-tagged load (the pop's restore of the saved
        // chain top) plus the push's one.
        let frame_loads = count_kind(&f, |k| {
            matches!(k, InstKind::Load { tag: MemTag::GcFrame, .. })
        });
        assert_eq!(frame_loads, 2);
    }
}
