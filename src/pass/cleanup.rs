//! Final IR cleanup: pseudo-intrinsic lowering.
//!
//! The front end leaves a handful of pseudo-intrinsics for this pass to
//! resolve once root placement is done:
//!
//! - the GC-flush marker is erased;
//! - the pointer coercion becomes a plain `ptrtoint`;
//! - object allocation is dispatched to the pool allocator or the
//!   big-object allocator by size class, with the type-tag store emitted
//!   at slot -1 of the new object;
//! - pointer-array dispatch calls are rewritten to pass their arguments
//!   through one shared stack array.
//!
//! This phase also runs alone for functions with no GC activity.

use crate::ir::{
    CallConv, Callee, Function, InstId, InstKind, Intrinsic, MemTag, Module, Ty, ValueId,
};
use crate::ir::{AddrSpace, BlockId};

use super::LateGcLower;

// =============================================================================
// Allocation size classes
// =============================================================================

/// Allocation size classes served by the per-thread pools, in bytes,
/// including the tag word. Anything larger goes to the big-object
/// allocator.
const POOL_CLASSES: &[u64] = &[
    8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384, 448, 512, 640,
    768, 896, 1024, 1536, 2032,
];

/// Classify an object size (tag word excluded) into `(pool index, class
/// size)`, or `None` for the big-object allocator.
pub(crate) fn classify_pool(size: u64, word_size: u64) -> Option<(i64, i64)> {
    let total = size + word_size;
    POOL_CLASSES
        .iter()
        .position(|&class| class >= total)
        .map(|idx| (idx as i64, POOL_CLASSES[idx] as i64))
}

// =============================================================================
// Cleanup
// =============================================================================

/// Lower every pseudo-intrinsic call site. Returns the number of call
/// sites rewritten or erased.
pub(crate) fn cleanup_ir(pass: &LateGcLower, module: &mut Module, func: &mut Function) -> usize {
    let mut lowered = 0;
    // One argument array serves every pointer-array dispatch in the
    // function; it is sized to the largest one at the end.
    let mut arg_array: Option<(InstId, ValueId)> = None;
    let mut max_frame_args: u32 = 0;

    let blocks: Vec<BlockId> = func.block_ids().collect();
    for block in blocks {
        let insts: Vec<InstId> = func.block_insts(block).to_vec();
        for inst in insts {
            let call = match &func.inst(inst).kind {
                InstKind::Call(call) => call.clone(),
                _ => continue,
            };
            match call.callee {
                Callee::Intrinsic(Intrinsic::GcFlush) => {
                    func.erase(inst);
                    lowered += 1;
                }
                Callee::Intrinsic(Intrinsic::PointerFromTracked) => {
                    let result = func.inst_result(inst).expect("coercion has a result");
                    let ty = func.value_ty(result);
                    let coerced = func.insert_before(inst, InstKind::PtrToInt(call.args[0]), ty);
                    let coerced_v = func.inst_result(coerced).expect("ptrtoint has a result");
                    func.replace_all_uses(result, coerced_v);
                    func.erase(inst);
                    lowered += 1;
                }
                Callee::Intrinsic(Intrinsic::AllocObj) => {
                    lower_alloc_obj(pass, module, func, inst, &call.args);
                    lowered += 1;
                }
                _ if call.conv != CallConv::Default => {
                    let array = *arg_array.get_or_insert_with(|| {
                        // Placeholder size; patched once every dispatch
                        // in the function has been seen.
                        let inst = func.prepend(
                            func.entry,
                            InstKind::Alloca {
                                elem: Ty::TRACKED_PTR,
                                count: 0,
                            },
                            Ty::RAW_PTR,
                        );
                        let v = func.inst_result(inst).expect("alloca has a result");
                        (inst, v)
                    });
                    let nframe = lower_ptr_array_call(func, inst, &call, array.1);
                    max_frame_args = max_frame_args.max(nframe);
                    lowered += 1;
                }
                _ => {}
            }
        }
    }

    if let Some((array_inst, _)) = arg_array {
        if max_frame_args == 0 {
            func.erase(array_inst);
        } else if let InstKind::Alloca { count, .. } = &mut func.inst_mut(array_inst).kind {
            *count = max_frame_args;
        }
    }
    lowered
}

/// Lower one allocation site to the right allocator and emit its tag
/// store.
fn lower_alloc_obj(
    pass: &LateGcLower,
    module: &mut Module,
    func: &mut Function,
    inst: InstId,
    args: &[ValueId],
) {
    let (thread_state, size_arg, tag) = (args[0], args[1], args[2]);
    let size = func
        .const_int_value(size_arg)
        .unwrap_or_else(|| {
            panic!(
                "allocation size is not a constant: {}",
                func.display_value(size_arg)
            )
        }) as u64;

    let word = pass.config().word_size;
    let lowered = if let Some((pool, class_size)) = classify_pool(size, word) {
        let sym = module.declare("rt_gc_pool_alloc", Ty::TRACKED_PTR);
        let pool_v = func.iconst(Ty::Int32, pool);
        let class_v = func.iconst(Ty::Int32, class_size);
        func.insert_before(
            inst,
            Function::call_kind(
                Callee::Sym(sym),
                CallConv::Default,
                [thread_state, pool_v, class_v],
            ),
            Ty::TRACKED_PTR,
        )
    } else {
        let sym = module.declare("rt_gc_big_alloc", Ty::TRACKED_PTR);
        let total = func.iconst(Ty::Int64, (size + word) as i64);
        func.insert_before(
            inst,
            Function::call_kind(Callee::Sym(sym), CallConv::Default, [thread_state, total]),
            Ty::TRACKED_PTR,
        )
    };
    let new_v = func.inst_result(lowered).expect("allocator returns a value");

    // The type tag lives one word below the object.
    let derived = func.insert_before(inst, InstKind::AddrSpaceCast(new_v), Ty::Ptr(AddrSpace::Derived));
    let derived_v = func.inst_result(derived).expect("cast has a result");
    let tag_addr_kind = func.const_gep_kind(derived_v, -1);
    let tag_addr = func.insert_before(inst, tag_addr_kind, Ty::Ptr(AddrSpace::Derived));
    let tag_addr_v = func.inst_result(tag_addr).expect("gep has a result");
    func.insert_before(
        inst,
        InstKind::Store {
            value: tag,
            ptr: tag_addr_v,
            tag: MemTag::TypeTag,
        },
        Ty::Void,
    );

    let result = func.inst_result(inst).expect("allocation has a result");
    func.replace_all_uses(result, new_v);
    func.erase(inst);
}

/// Rewrite one pointer-array dispatch: store the arguments into the
/// shared array, then call with `(array, nargs)`.
fn lower_ptr_array_call(
    func: &mut Function,
    inst: InstId,
    call: &crate::ir::CallInst,
    array: ValueId,
) -> u32 {
    let with_func = call.conv == CallConv::PtrArrayWithFunc;
    let frame_args = &call.args[usize::from(with_func)..];
    let nframe = frame_args.len() as u32;

    let mut slot: i64 = 0;
    for &arg in frame_args {
        let gep_kind = func.const_gep_kind(array, slot);
        slot += 1;
        let gep = func.insert_before(inst, gep_kind, Ty::RAW_PTR);
        let gep_v = func.inst_result(gep).expect("gep has a result");
        func.insert_before(
            inst,
            InstKind::Store {
                value: arg,
                ptr: gep_v,
                tag: MemTag::None,
            },
            Ty::Void,
        );
    }

    let array_arg = if nframe == 0 {
        func.null_ptr(AddrSpace::Generic)
    } else {
        array
    };
    let nargs = func.iconst(Ty::Int32, nframe as i64);
    let mut new_args: smallvec::SmallVec<[ValueId; 4]> = smallvec::SmallVec::new();
    if with_func {
        new_args.push(call.args[0]);
    }
    new_args.push(array_arg);
    new_args.push(nargs);

    let result = func.inst_result(inst);
    let ty = result.map_or(Ty::Void, |r| func.value_ty(r));
    let replacement = func.insert_before(
        inst,
        Function::call_kind(call.callee, CallConv::Default, new_args),
        ty,
    );
    if let Some(old) = result {
        let new = func.inst_result(replacement).expect("call has a result");
        func.replace_all_uses(old, new);
    }
    func.erase(inst);
    nframe
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::FunctionBuilder;

    fn run_cleanup(module: &mut Module, func: &mut Function) -> usize {
        cleanup_ir(&LateGcLower::new(), module, func)
    }

    fn kinds(func: &Function) -> Vec<&'static str> {
        func.block_ids()
            .flat_map(|b| func.block_insts(b).to_vec())
            .map(|i| func.inst(i).kind.mnemonic())
            .collect()
    }

    #[test]
    fn test_classify_pool_boundaries() {
        // 8-byte object + 8-byte tag fits the 16-byte class.
        assert_eq!(classify_pool(8, 8), Some((1, 16)));
        assert_eq!(classify_pool(0, 8), Some((0, 8)));
        assert_eq!(classify_pool(2024, 8), Some((25, 2032)));
        // Above the largest class: big-object allocator.
        assert_eq!(classify_pool(2025, 8), None);
        assert_eq!(classify_pool(1 << 20, 8), None);
    }

    #[test]
    fn test_flush_erased() {
        let mut m = Module::new();
        let mut b = FunctionBuilder::new("f", &[]);
        b.call_void(Callee::Intrinsic(Intrinsic::GcFlush), &[]);
        b.ret_void();
        let mut f = b.finish();

        assert_eq!(run_cleanup(&mut m, &mut f), 1);
        assert_eq!(kinds(&f), vec!["ret"]);
    }

    #[test]
    fn test_pointer_coercion_lowered() {
        let mut m = Module::new();
        let mut b = FunctionBuilder::new("f", &[Ty::RAW_PTR]);
        let p = b.arg(0);
        let root = b.load(p, Ty::TRACKED_PTR);
        let raw = b.call(
            Callee::Intrinsic(Intrinsic::PointerFromTracked),
            &[root],
            Ty::Int64,
        );
        b.ret(raw);
        let mut f = b.finish();

        assert_eq!(run_cleanup(&mut m, &mut f), 1);
        assert_eq!(kinds(&f), vec!["load", "ptrtoint", "ret"]);
        // The return now uses the ptrtoint result.
        let ret = f.terminator(f.entry).unwrap();
        let mut ret_operands = Vec::new();
        f.inst(ret).kind.for_each_operand(|v| ret_operands.push(v));
        assert_eq!(ret_operands.len(), 1);
        assert!(matches!(
            f.inst(f.defining_inst(ret_operands[0]).unwrap()).kind,
            InstKind::PtrToInt(_)
        ));
    }

    #[test]
    fn test_alloc_obj_pool_path() {
        let mut m = Module::new();
        let mut b = FunctionBuilder::new("f", &[Ty::RAW_PTR, Ty::TRACKED_PTR]);
        let ts = b.arg(0);
        let tag = b.arg(1);
        let size = b.iconst(Ty::Int64, 24);
        let obj = b.call(
            Callee::Intrinsic(Intrinsic::AllocObj),
            &[ts, size, tag],
            Ty::TRACKED_PTR,
        );
        b.ret(obj);
        let mut f = b.finish();

        assert_eq!(run_cleanup(&mut m, &mut f), 1);
        // call (pool alloc), derived cast, tag gep, tag store, ret.
        assert_eq!(kinds(&f), vec!["call", "addrspacecast", "gep", "store", "ret"]);
        let pool = m.lookup("rt_gc_pool_alloc").expect("pool allocator declared");
        let first = f.block_insts(f.entry)[0];
        match &f.inst(first).kind {
            InstKind::Call(c) => {
                assert_eq!(c.callee, Callee::Sym(pool));
                // 24 bytes + tag word -> the 32-byte class, index 3.
                assert_eq!(f.const_int_value(c.args[1]), Some(3));
                assert_eq!(f.const_int_value(c.args[2]), Some(32));
            }
            other => panic!("expected call, got {}", other.mnemonic()),
        }
    }

    #[test]
    fn test_alloc_obj_big_path() {
        let mut m = Module::new();
        let mut b = FunctionBuilder::new("f", &[Ty::RAW_PTR, Ty::TRACKED_PTR]);
        let ts = b.arg(0);
        let tag = b.arg(1);
        let size = b.iconst(Ty::Int64, 4096);
        let obj = b.call(
            Callee::Intrinsic(Intrinsic::AllocObj),
            &[ts, size, tag],
            Ty::TRACKED_PTR,
        );
        b.ret(obj);
        let mut f = b.finish();

        run_cleanup(&mut m, &mut f);
        let big = m.lookup("rt_gc_big_alloc").expect("big allocator declared");
        let first = f.block_insts(f.entry)[0];
        match &f.inst(first).kind {
            InstKind::Call(c) => {
                assert_eq!(c.callee, Callee::Sym(big));
                assert_eq!(f.const_int_value(c.args[1]), Some(4096 + 8));
            }
            other => panic!("expected call, got {}", other.mnemonic()),
        }
        assert!(m.lookup("rt_gc_pool_alloc").is_none());
    }

    #[test]
    fn test_ptr_array_dispatch() {
        let mut m = Module::new();
        let dispatch = m.declare("rt_apply", Ty::TRACKED_PTR);
        let mut b = FunctionBuilder::new("f", &[Ty::TRACKED_PTR, Ty::TRACKED_PTR]);
        let x = b.arg(0);
        let y = b.arg(1);
        let r = b.call_with_conv(
            Callee::Sym(dispatch),
            CallConv::PtrArray,
            &[x, y],
            Ty::TRACKED_PTR,
        );
        let r_v = b.func().inst_result(r).unwrap();
        b.ret(r_v);
        let mut f = b.finish();

        assert_eq!(run_cleanup(&mut m, &mut f), 1);
        // Shared argument array sized to the dispatch.
        let first = f.block_insts(f.entry)[0];
        match f.inst(first).kind {
            InstKind::Alloca { elem, count } => {
                assert_eq!(elem, Ty::TRACKED_PTR);
                assert_eq!(count, 2);
            }
            ref other => panic!("expected alloca, got {}", other.mnemonic()),
        }
        // Replacement call takes (array, nargs).
        let call = f
            .block_insts(f.entry)
            .iter()
            .copied()
            .find(|&i| matches!(f.inst(i).kind, InstKind::Call(_)))
            .unwrap();
        match &f.inst(call).kind {
            InstKind::Call(c) => {
                assert_eq!(c.conv, CallConv::Default);
                assert_eq!(c.args.len(), 2);
                assert_eq!(f.const_int_value(c.args[1]), Some(2));
            }
            other => panic!("expected call, got {}", other.mnemonic()),
        }
    }

    #[test]
    fn test_ptr_array_with_func_keeps_callee_object() {
        let mut m = Module::new();
        let dispatch = m.declare("rt_apply_f", Ty::TRACKED_PTR);
        let mut b = FunctionBuilder::new("f", &[Ty::TRACKED_PTR, Ty::TRACKED_PTR]);
        let callee_obj = b.arg(0);
        let x = b.arg(1);
        let r = b.call_with_conv(
            Callee::Sym(dispatch),
            CallConv::PtrArrayWithFunc,
            &[callee_obj, x],
            Ty::TRACKED_PTR,
        );
        let r_v = b.func().inst_result(r).unwrap();
        b.ret(r_v);
        let mut f = b.finish();

        run_cleanup(&mut m, &mut f);
        let call = f
            .block_insts(f.entry)
            .iter()
            .copied()
            .find(|&i| matches!(f.inst(i).kind, InstKind::Call(_)))
            .unwrap();
        match &f.inst(call).kind {
            InstKind::Call(c) => {
                assert_eq!(c.args.len(), 3);
                assert_eq!(c.args[0], callee_obj);
                assert_eq!(f.const_int_value(c.args[2]), Some(1));
            }
            other => panic!("expected call, got {}", other.mnemonic()),
        }
    }
}
