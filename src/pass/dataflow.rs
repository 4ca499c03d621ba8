//! Liveness and rootedness dataflow.
//!
//! Textbook iterative dataflow over the CFG:
//!
//! ```text
//! LiveOut[B]    = PhiOuts[B] ∪ ⋃_{S ∈ succ(B)} LiveIn[S]
//! LiveIn[B]     = UpExposedUses[B] ∪ UpExposedUsesUnrooted[B] ∪ (LiveOut[B] \ Defs[B])
//! UnrootedIn[B] = ⋃_{P ∈ pred(B)} UnrootedOut[P]
//! UnrootedOut[B] = DownExposedUnrooted[B] ∪ (HasSafepoint[B] ? ∅ : UnrootedIn[B])
//! ```
//!
//! Liveness is the backward problem; the unrooted sets propagate forward.
//! Blocks iterate in reverse postorder to speed convergence of the live
//! ranges, which tend to be longer than the unrooted ranges (those stop
//! at the first safepoint).
//!
//! With the fixpoint in hand, each safepoint's live set is materialized,
//! refined, and folded into the interference graph.

use crate::ir::{BitSet, Function};

use super::{State, CALLER_ROOTED};

/// Run the dataflow to a fixed point.
pub(crate) fn compute_liveness(func: &Function, state: &mut State) {
    let rpo = func.rpo();
    loop {
        let mut changed = false;
        for &block in &rpo {
            let mut new_live_out = state.block_states[block].phi_outs.clone();
            for &succ in func.succs(block) {
                new_live_out.union_with(&state.block_states[succ].live_in);
            }
            if new_live_out != state.block_states[block].live_out {
                changed = true;
                state.block_states[block].live_out = new_live_out;
            }

            let bbs = &state.block_states[block];
            let mut new_live_in = bbs.live_out.clone();
            new_live_in.difference_with(&bbs.defs);
            new_live_in.union_with(&bbs.up_exposed_uses);
            new_live_in.union_with(&bbs.up_exposed_uses_unrooted);
            if new_live_in != bbs.live_in {
                changed = true;
                state.block_states[block].live_in = new_live_in;
            }

            let mut new_unrooted_in = BitSet::new();
            for &pred in func.preds(block) {
                new_unrooted_in.union_with(&state.block_states[pred].unrooted_out);
            }
            if new_unrooted_in != state.block_states[block].unrooted_in {
                changed = true;
                let bbs = &mut state.block_states[block];
                bbs.unrooted_in = new_unrooted_in;
                if !bbs.has_safepoint {
                    bbs.unrooted_out.union_with(&bbs.unrooted_in);
                }
            }
        }
        if !changed {
            break;
        }
    }
}

/// Materialize each safepoint's live set, apply refinements, and build
/// the interference graph.
pub(crate) fn compute_live_sets(func: &Function, state: &mut State) {
    for idx in 0..state.reverse_safepoint_numbering.len() {
        let inst = state.reverse_safepoint_numbering[idx];
        let block = func.inst_block(inst);
        let (live_across, live_out) = {
            let bbs = &state.block_states[block];
            let mut live_across = bbs.live_in.clone();
            live_across.intersect_with(&bbs.live_out);
            (live_across, bbs.live_out.clone())
        };
        // Live across the whole block means live here.
        let live_set = &mut state.live_sets[idx];
        live_set.union_with(&live_across);
        // Defined above this safepoint: live here iff it escapes.
        for &num in &state.live_if_live_out[idx] {
            if live_out.contains(num as usize) {
                live_set.insert(num as usize);
            }
        }
        // Refinement pass: a use is redundant where its refined pointer
        // is also live. Single pass; refinement chains are shallow by
        // construction.
        let members: Vec<usize> = live_set.iter().collect();
        for num in members {
            let Some(&refined) = state.load_refinements.get(&(num as i32)) else {
                continue;
            };
            if refined == CALLER_ROOTED || live_set.contains(refined as usize) {
                live_set.remove(num);
            }
        }
    }

    // Interference: for each identifier, everything co-live with it at
    // some safepoint. An identifier is deliberately its own neighbor, to
    // distinguish "alone at a safepoint" from "never live at one".
    let count = (state.max_ptr_number + 1) as usize;
    state.neighbors = Vec::with_capacity(count);
    for num in 0..count {
        let mut bits = BitSet::new();
        for live_set in &state.live_sets {
            if live_set.contains(num) {
                bits.union_with(live_set);
            }
        }
        state.neighbors.push(bits);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Callee, FunctionBuilder, Module, Ty, ValueId};
    use crate::pass::scan::local_scan;

    fn safepoint(b: &mut FunctionBuilder, m: &mut Module) -> crate::ir::InstId {
        let sym = m.declare("rt_noop", Ty::Void);
        b.call_void(Callee::Sym(sym), &[])
    }

    fn tracked_call(b: &mut FunctionBuilder, m: &mut Module) -> ValueId {
        let sym = m.declare("rt_make", Ty::TRACKED_PTR);
        b.call(Callee::Sym(sym), &[], Ty::TRACKED_PTR)
    }

    #[test]
    fn test_diamond_liveness() {
        // entry defines r, branches; both arms have a safepoint; merge
        // uses r. r must be live through both arms.
        let mut m = Module::new();
        let mut b = FunctionBuilder::new("f", &[Ty::RAW_PTR, Ty::Int1]);
        let p = b.arg(0);
        let cond = b.arg(1);
        let r = tracked_call(&mut b, &mut m);
        let left = b.create_block();
        let right = b.create_block();
        let merge = b.create_block();
        b.cond_br(cond, left, right);

        b.switch_to_block(left);
        let sp_left = safepoint(&mut b, &mut m);
        b.br(merge);

        b.switch_to_block(right);
        let sp_right = safepoint(&mut b, &mut m);
        b.br(merge);

        b.switch_to_block(merge);
        b.store(r, p);
        b.ret_void();
        let mut f = b.finish();

        let mut state = local_scan(&mut f, &m);
        compute_liveness(&f, &mut state);
        compute_live_sets(&f, &mut state);

        let r_num = state.all_ptr_numbering[&r] as usize;
        let entry = f.entry;
        assert!(state.block_states[entry].live_out.contains(r_num));
        assert!(state.block_states[left].live_in.contains(r_num));
        assert!(state.block_states[left].live_out.contains(r_num));
        assert!(state.block_states[merge].live_in.contains(r_num));
        assert!(!state.block_states[merge].live_out.contains(r_num));

        for sp in [sp_left, sp_right] {
            let idx = state.safepoint_numbering[&sp] as usize;
            assert!(state.live_sets[idx].contains(r_num));
        }
    }

    #[test]
    fn test_live_in_subset_invariant() {
        // LiveIn ⊆ UpExposedUses ∪ UpExposedUsesUnrooted ∪ LiveOut.
        let mut m = Module::new();
        let mut b = FunctionBuilder::new("f", &[Ty::RAW_PTR, Ty::Int1]);
        let p = b.arg(0);
        let cond = b.arg(1);
        let r = tracked_call(&mut b, &mut m);
        let body = b.create_block();
        let exit = b.create_block();
        b.br(body);

        b.switch_to_block(body);
        safepoint(&mut b, &mut m);
        b.store(r, p);
        b.cond_br(cond, body, exit);

        b.switch_to_block(exit);
        b.ret_void();
        let mut f = b.finish();

        let mut state = local_scan(&mut f, &m);
        compute_liveness(&f, &mut state);

        for block in f.block_ids() {
            let bbs = &state.block_states[block];
            let mut bound = bbs.up_exposed_uses.clone();
            bound.union_with(&bbs.up_exposed_uses_unrooted);
            bound.union_with(&bbs.live_out);
            for num in bbs.live_in.iter() {
                assert!(bound.contains(num), "live-in exceeds its bound");
            }
        }
    }

    #[test]
    fn test_unrooted_propagates_until_safepoint() {
        // r defined in entry (no safepoint there), flows through a
        // safepoint-free block, then reaches one with a safepoint.
        let mut m = Module::new();
        let mut b = FunctionBuilder::new("f", &[Ty::RAW_PTR]);
        let p = b.arg(0);
        let r = b.load(p, Ty::TRACKED_PTR);
        let mid = b.create_block();
        let last = b.create_block();
        b.br(mid);

        b.switch_to_block(mid);
        b.br(last);

        b.switch_to_block(last);
        safepoint(&mut b, &mut m);
        b.store(r, p);
        b.ret_void();
        let mut f = b.finish();

        let mut state = local_scan(&mut f, &m);
        compute_liveness(&f, &mut state);

        let r_num = state.all_ptr_numbering[&r] as usize;
        let entry = f.entry;
        assert!(state.block_states[entry].unrooted_out.contains(r_num));
        assert!(state.block_states[mid].unrooted_in.contains(r_num));
        assert!(state.block_states[mid].unrooted_out.contains(r_num));
        assert!(state.block_states[last].unrooted_in.contains(r_num));
        // The safepoint stops the forward propagation.
        assert!(!state.block_states[last].unrooted_out.contains(r_num));
    }

    #[test]
    fn test_live_set_refinement_removes_field() {
        // root live at a safepoint together with a field loaded from it
        // through an immutable tag: only root stays.
        let mut m = Module::new();
        let mut b = FunctionBuilder::new("f", &[Ty::RAW_PTR]);
        let p = b.arg(0);
        let root = tracked_call(&mut b, &mut m);
        let derived = b.addr_space_cast(root, crate::ir::AddrSpace::Derived);
        let field = b.load_tagged(derived, Ty::TRACKED_PTR, crate::ir::MemTag::ImmutableField);
        let sp = safepoint(&mut b, &mut m);
        b.store(field, p);
        b.store(root, p);
        b.ret_void();
        let mut f = b.finish();

        let mut state = local_scan(&mut f, &m);
        compute_liveness(&f, &mut state);
        compute_live_sets(&f, &mut state);

        let root_num = state.all_ptr_numbering[&root] as usize;
        let field_num = state.all_ptr_numbering[&field] as usize;
        let idx = state.safepoint_numbering[&sp] as usize;
        assert!(state.live_sets[idx].contains(root_num));
        assert!(!state.live_sets[idx].contains(field_num));
    }

    #[test]
    fn test_interference_self_membership() {
        let mut m = Module::new();
        let mut b = FunctionBuilder::new("f", &[Ty::RAW_PTR]);
        let p = b.arg(0);
        let r = tracked_call(&mut b, &mut m);
        safepoint(&mut b, &mut m);
        b.store(r, p);
        // A second tracked value never live at any safepoint.
        let dead = b.load(p, Ty::TRACKED_PTR);
        b.store(dead, p);
        b.ret_void();
        let mut f = b.finish();

        let mut state = local_scan(&mut f, &m);
        compute_liveness(&f, &mut state);
        compute_live_sets(&f, &mut state);

        let r_num = state.all_ptr_numbering[&r] as usize;
        let dead_num = state.all_ptr_numbering[&dead] as usize;
        assert!(state.neighbors[r_num].contains(r_num));
        assert!(state.neighbors[dead_num].is_empty());
    }
}
