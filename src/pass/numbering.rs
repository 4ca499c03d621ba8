//! Pointer value numbering.
//!
//! Every tracked pointer and every derived view of it folds to a single
//! non-negative number; the rest of the pass reasons only about numbers.
//! Base finding walks backward through the address-space-preserving
//! rewrites (bitcasts, pointer arithmetic, in-space casts, union field
//! extraction) until it reaches a value that actually produces a pointer.
//!
//! Merges of derived pointers cannot be rooted directly, so they are
//! *lifted*: a parallel merge of the base pointers is synthesized next to
//! the original and numbered in its place.

use smallvec::SmallVec;

use crate::ir::{
    AddrSpace, Function, InstId, InstKind, Ty, ValueDef, ValueId,
};

use super::{State, CALLER_ROOTED};

// =============================================================================
// Base finding
// =============================================================================

/// Walk a value back to the base that produces its pointer.
///
/// Stops early at any value the numbering has already seen when
/// `use_cache` is set.
pub(crate) fn find_base(state: &State, func: &Function, v: ValueId, use_cache: bool) -> ValueId {
    let mut current = v;
    loop {
        if use_cache {
            let hit = if func.value_ty(current).is_ptr() {
                state.all_ptr_numbering.contains_key(&current)
            } else {
                state.all_vector_numbering.contains_key(&current)
            };
            if hit {
                return current;
            }
        }
        match func.value_def(current) {
            ValueDef::Inst(inst) => match &func.inst(inst).kind {
                InstKind::BitCast(src) => current = *src,
                InstKind::AddrSpaceCast(src) => {
                    if func.value_ty(*src).addr_space() == Some(AddrSpace::Generic) {
                        break;
                    }
                    current = *src;
                }
                InstKind::Gep { base, .. } => current = *base,
                InstKind::ExtractValue { agg, .. } => {
                    if !func.value_ty(*agg).is_union_rep() {
                        break;
                    }
                    current = *agg;
                }
                _ => break,
            },
            ValueDef::Arg(_) | ValueDef::Const(_) => break,
        }
    }
    assert_base_kind(func, current);
    current
}

/// Bases must be values that genuinely produce a pointer. Anything else
/// means the producer violated the IR contract.
fn assert_base_kind(func: &Function, base: ValueId) {
    let ok = match func.value_def(base) {
        ValueDef::Arg(_) | ValueDef::Const(_) => true,
        ValueDef::Inst(inst) => matches!(
            func.inst(inst).kind,
            InstKind::Load { .. }
                | InstKind::Call(_)
                | InstKind::Select { .. }
                | InstKind::Phi { .. }
                | InstKind::AddrSpaceCast(_)
                | InstKind::Alloca { .. }
                | InstKind::ExtractValue { .. }
                | InstKind::ShuffleVector { .. }
                | InstKind::InsertElement { .. }
        ),
    };
    if !ok {
        panic!(
            "unexpected base while numbering pointers: {}",
            func.display_value(base)
        );
    }
}

// =============================================================================
// Lifting
// =============================================================================

/// If `v` is a union representation, extract its pointer field in front
/// of `point`.
fn maybe_extract_union(func: &mut Function, v: ValueId, point: InstId) -> ValueId {
    if !func.value_ty(v).is_union_rep() {
        return v;
    }
    let extract = func.insert_before(point, InstKind::ExtractValue { agg: v, field: 0 }, Ty::TRACKED_PTR);
    func.inst_result(extract).expect("extract has a result")
}

/// Rewrite a select of derived pointers into a select of their bases.
///
/// Arms whose base is not tracked contribute a null (they are rooted
/// elsewhere); if neither arm has a tracked base there is nothing to
/// root and the select numbers as caller-rooted.
pub(crate) fn lift_select(state: &mut State, func: &mut Function, select: InstId) -> i32 {
    let (cond, if_true, if_false) = match &func.inst(select).kind {
        InstKind::Select {
            cond,
            if_true,
            if_false,
        } => (*cond, *if_true, *if_false),
        _ => unreachable!("lift_select on a non-select"),
    };

    let mut true_base = find_base(state, func, if_true, false);
    let mut false_base = find_base(state, func, if_false, false);
    true_base = maybe_extract_union(func, true_base, select);
    false_base = maybe_extract_union(func, false_base, select);

    let true_tracked = func.value_ty(true_base) == Ty::TRACKED_PTR;
    let false_tracked = func.value_ty(false_base) == Ty::TRACKED_PTR;
    if !true_tracked && !false_tracked {
        return CALLER_ROOTED;
    }
    if !true_tracked {
        true_base = func.null_ptr(AddrSpace::Tracked);
    }
    if !false_tracked {
        false_base = func.null_ptr(AddrSpace::Tracked);
    }

    let lifted = func.insert_before(
        select,
        InstKind::Select {
            cond,
            if_true: true_base,
            if_false: false_base,
        },
        Ty::TRACKED_PTR,
    );
    let lifted_v = func.inst_result(lifted).expect("select has a result");
    let num = fresh_number(state, lifted_v);
    state.all_ptr_numbering.insert(lifted_v, num);
    let select_v = func.inst_result(select).expect("select has a result");
    state.all_ptr_numbering.insert(select_v, num);
    num
}

/// Rewrite a phi of derived pointers into a phi of their bases.
///
/// Incomings with a union-typed base have the pointer field extracted in
/// the predecessor, in front of its terminator; untracked bases become
/// nulls.
pub(crate) fn lift_phi(state: &mut State, func: &mut Function, phi: InstId) -> i32 {
    let incomings = match &func.inst(phi).kind {
        InstKind::Phi { incomings } => incomings.clone(),
        _ => unreachable!("lift_phi on a non-phi"),
    };

    let mut lifted_incomings: SmallVec<[(crate::ir::BlockId, ValueId); 2]> = SmallVec::new();
    for (pred, incoming) in incomings {
        let mut base = find_base(state, func, incoming, false);
        if func.value_ty(base).is_union_rep() {
            let term = func
                .terminator(pred)
                .expect("predecessor of a phi has a terminator");
            base = maybe_extract_union(func, base, term);
        }
        if func.value_ty(base) != Ty::TRACKED_PTR {
            base = func.null_ptr(AddrSpace::Tracked);
        }
        lifted_incomings.push((pred, base));
    }

    let lifted = func.insert_before(
        phi,
        InstKind::Phi {
            incomings: lifted_incomings,
        },
        Ty::TRACKED_PTR,
    );
    let lifted_v = func.inst_result(lifted).expect("phi has a result");
    let num = fresh_number(state, lifted_v);
    state.all_ptr_numbering.insert(lifted_v, num);
    let phi_v = func.inst_result(phi).expect("phi has a result");
    state.all_ptr_numbering.insert(phi_v, num);
    num
}

// =============================================================================
// Numbering
// =============================================================================

fn fresh_number(state: &mut State, canonical: ValueId) -> i32 {
    state.max_ptr_number += 1;
    state.reverse_ptr_numbering.push(canonical);
    debug_assert_eq!(
        state.reverse_ptr_numbering.len() as i32,
        state.max_ptr_number + 1
    );
    state.max_ptr_number
}

enum BaseCase {
    CallerRooted,
    LiftSelect(InstId),
    LiftPhi(InstId),
    BadExtract,
    Fresh,
}

/// The number for a scalar tracked/derived pointer or union value.
pub(crate) fn number(state: &mut State, func: &mut Function, v: ValueId) -> i32 {
    let ty = func.value_ty(v);
    assert!(
        ty.is_gc_ptr() || ty.is_union_rep(),
        "numbering a value of no GC interest: {}",
        func.display_value(v)
    );

    let base = find_base(state, func, v, true);
    if let Some(&num) = state.all_ptr_numbering.get(&base) {
        return num;
    }

    let base_ty = func.value_ty(base);
    let tracked = base_ty.addr_space() == Some(AddrSpace::Tracked);
    let case = match func.value_def(base) {
        ValueDef::Const(_) | ValueDef::Arg(_) => BaseCase::CallerRooted,
        ValueDef::Inst(inst) => match &func.inst(inst).kind {
            InstKind::Alloca { .. } | InstKind::AddrSpaceCast(_) if !tracked => {
                BaseCase::CallerRooted
            }
            InstKind::Select { .. } if !tracked => BaseCase::LiftSelect(inst),
            InstKind::Phi { .. } if !tracked => BaseCase::LiftPhi(inst),
            InstKind::ExtractValue { .. } if !base_ty.is_union_rep() => BaseCase::BadExtract,
            _ => BaseCase::Fresh,
        },
    };

    let num = match case {
        BaseCase::CallerRooted => CALLER_ROOTED,
        BaseCase::LiftSelect(inst) => {
            let num = lift_select(state, func, inst);
            state.all_ptr_numbering.insert(v, num);
            return num;
        }
        BaseCase::LiftPhi(inst) => {
            let num = lift_phi(state, func, inst);
            state.all_ptr_numbering.insert(v, num);
            return num;
        }
        BaseCase::BadExtract => panic!(
            "cannot number an extract from a non-union aggregate: {}",
            func.display_value(base)
        ),
        BaseCase::Fresh => {
            assert!(
                base_ty == Ty::TRACKED_PTR || base_ty.is_union_rep(),
                "pointer base is neither tracked nor a union: {}",
                func.display_value(base)
            );
            fresh_number(state, base)
        }
    };

    state.all_ptr_numbering.insert(base, num);
    state.all_ptr_numbering.insert(v, num);
    num
}

/// Per-lane numbers for a vector-of-pointer value.
///
/// Only vectors produced by loads are numberable; shuffles and lane
/// insertions of tracked vectors have no lifting and abort. Vectors
/// whose base is untracked (or opaque to the numbering) get no lanes.
pub(crate) fn number_vector(state: &mut State, func: &mut Function, v: ValueId) -> Vec<i32> {
    if let Some(nums) = state.all_vector_numbering.get(&v) {
        return nums.clone();
    }
    let base = find_base(state, func, v, true);
    if let Some(nums) = state.all_vector_numbering.get(&base) {
        let nums = nums.clone();
        state.all_vector_numbering.insert(v, nums.clone());
        return nums;
    }

    enum VecCase {
        Empty,
        Unliftable,
        Load(u32),
    }

    let case = match func.value_def(base) {
        ValueDef::Inst(inst) => match &func.inst(inst).kind {
            InstKind::ShuffleVector { .. } | InstKind::InsertElement { .. } => VecCase::Unliftable,
            InstKind::Load { .. } => {
                VecCase::Load(func.value_ty(base).lanes().expect("vector load"))
            }
            _ => VecCase::Empty,
        },
        ValueDef::Arg(_) | ValueDef::Const(_) => VecCase::Empty,
    };

    let nums = match case {
        VecCase::Unliftable => panic!(
            "no lifting for shuffles or lane insertions of tracked vectors: {}",
            func.display_value(base)
        ),
        VecCase::Empty => Vec::new(),
        VecCase::Load(lanes) => (0..lanes).map(|_| fresh_number(state, base)).collect(),
    };
    state.all_vector_numbering.insert(base, nums.clone());
    state.all_vector_numbering.insert(v, nums.clone());
    nums
}

// =============================================================================
// Tests
// =============================================================================
