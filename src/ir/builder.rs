//! Function construction.
//!
//! `FunctionBuilder` is the producer-facing API: it keeps a current-block
//! cursor and appends typed instructions, wiring CFG edges as terminators
//! are attached. The root-placement pass itself does not use the builder;
//! it splices instructions at exact points via `Function` directly.
//!
//! Producer contract: tracked vectors are only ever produced by loads.
//! `shuffle_vector`/`insert_element` of tracked vectors are accepted here
//! but the pass will refuse to number them.

use super::func::{BlockId, Function, InstId, ValueId};
use super::instr::{CallConv, CallInst, Callee, InstKind, Intrinsic, MemTag};
use super::types::{AddrSpace, Ty};

/// Builds a function one block at a time.
pub struct FunctionBuilder {
    func: Function,
    current: BlockId,
}

impl FunctionBuilder {
    /// Start a function with the given argument types. The cursor starts
    /// at the entry block.
    pub fn new(name: &str, params: &[Ty]) -> Self {
        let func = Function::new(name, params);
        let current = func.entry;
        FunctionBuilder { func, current }
    }

    /// Finish and return the function.
    pub fn finish(self) -> Function {
        self.func
    }

    /// The function under construction.
    pub fn func(&self) -> &Function {
        &self.func
    }

    /// Argument value by index.
    pub fn arg(&self, index: usize) -> ValueId {
        self.func.arg(index)
    }

    /// Create a new block.
    pub fn create_block(&mut self) -> BlockId {
        self.func.add_block()
    }

    /// Move the cursor to a block.
    pub fn switch_to_block(&mut self, b: BlockId) {
        self.current = b;
    }

    /// The block the cursor is in.
    pub fn current_block(&self) -> BlockId {
        self.current
    }

    // -------------------------------------------------------------------------
    // Constants
    // -------------------------------------------------------------------------

    /// Integer constant.
    pub fn iconst(&mut self, ty: Ty, value: i64) -> ValueId {
        self.func.iconst(ty, value)
    }

    /// Null pointer in the given space.
    pub fn null_ptr(&mut self, space: AddrSpace) -> ValueId {
        self.func.null_ptr(space)
    }

    // -------------------------------------------------------------------------
    // Instructions
    // -------------------------------------------------------------------------

    fn push(&mut self, kind: InstKind, ty: Ty) -> InstId {
        self.func.append(self.current, kind, ty)
    }

    fn push_value(&mut self, kind: InstKind, ty: Ty) -> ValueId {
        debug_assert!(ty != Ty::Void);
        let inst = self.push(kind, ty);
        self.func.inst_result(inst).expect("typed instruction")
    }

    /// Call producing a value.
    pub fn call(&mut self, callee: Callee, args: &[ValueId], ty: Ty) -> ValueId {
        self.push_value(Function::call_kind(callee, CallConv::Default, args.iter().copied()), ty)
    }

    /// Call producing no value.
    pub fn call_void(&mut self, callee: Callee, args: &[ValueId]) -> InstId {
        self.push(Function::call_kind(callee, CallConv::Default, args.iter().copied()), Ty::Void)
    }

    /// Call with an explicit calling convention.
    pub fn call_with_conv(
        &mut self,
        callee: Callee,
        conv: CallConv,
        args: &[ValueId],
        ty: Ty,
    ) -> InstId {
        self.push(
            InstKind::Call(CallInst {
                callee,
                args: args.iter().copied().collect(),
                conv,
                returns_twice: false,
            }),
            ty,
        )
    }

    /// Call through which control may re-enter (setjmp-style).
    pub fn call_returns_twice(&mut self, callee: Callee, args: &[ValueId], ty: Ty) -> InstId {
        self.push(
            InstKind::Call(CallInst {
                callee,
                args: args.iter().copied().collect(),
                conv: CallConv::Default,
                returns_twice: true,
            }),
            ty,
        )
    }

    /// The thread-state getter; belongs in the entry block.
    pub fn thread_state(&mut self) -> ValueId {
        self.call(Callee::Intrinsic(Intrinsic::ThreadState), &[], Ty::RAW_PTR)
    }

    /// Load from a pointer.
    pub fn load(&mut self, ptr: ValueId, ty: Ty) -> ValueId {
        self.load_tagged(ptr, ty, MemTag::None)
    }

    /// Load carrying a metadata tag.
    pub fn load_tagged(&mut self, ptr: ValueId, ty: Ty, tag: MemTag) -> ValueId {
        self.push_value(InstKind::Load { ptr, tag }, ty)
    }

    /// Store to a pointer.
    pub fn store(&mut self, value: ValueId, ptr: ValueId) -> InstId {
        self.push(Function::store_kind(value, ptr, MemTag::None), Ty::Void)
    }

    /// SSA merge.
    pub fn phi(&mut self, ty: Ty, incomings: &[(BlockId, ValueId)]) -> ValueId {
        self.push_value(
            InstKind::Phi {
                incomings: incomings.iter().copied().collect(),
            },
            ty,
        )
    }

    /// Two-way select.
    pub fn select(&mut self, cond: ValueId, if_true: ValueId, if_false: ValueId, ty: Ty) -> ValueId {
        self.push_value(
            InstKind::Select {
                cond,
                if_true,
                if_false,
            },
            ty,
        )
    }

    /// Same-space pointer reinterpretation.
    pub fn bitcast(&mut self, value: ValueId, ty: Ty) -> ValueId {
        self.push_value(InstKind::BitCast(value), ty)
    }

    /// Cast a pointer into another address space.
    pub fn addr_space_cast(&mut self, value: ValueId, space: AddrSpace) -> ValueId {
        self.push_value(InstKind::AddrSpaceCast(value), Ty::Ptr(space))
    }

    /// Pointer arithmetic; the result stays in the base's space.
    pub fn gep(&mut self, base: ValueId, indices: &[ValueId]) -> ValueId {
        let ty = self.func.value_ty(base);
        self.push_value(
            InstKind::Gep {
                base,
                indices: indices.iter().copied().collect(),
            },
            ty,
        )
    }

    /// Pointer arithmetic with a single constant word index.
    pub fn gep_const(&mut self, base: ValueId, index: i64) -> ValueId {
        let idx = self.func.iconst(Ty::Int32, index);
        self.gep(base, &[idx])
    }

    /// Extract an aggregate field.
    pub fn extract_value(&mut self, agg: ValueId, field: u32, ty: Ty) -> ValueId {
        self.push_value(InstKind::ExtractValue { agg, field }, ty)
    }

    /// Extract a vector lane.
    pub fn extract_element(&mut self, vec: ValueId, lane: u32, ty: Ty) -> ValueId {
        self.push_value(InstKind::ExtractElement { vec, lane }, ty)
    }

    /// Recombine vector lanes.
    pub fn shuffle_vector(&mut self, a: ValueId, b: ValueId, mask: &[u32], ty: Ty) -> ValueId {
        self.push_value(
            InstKind::ShuffleVector {
                a,
                b,
                mask: mask.iter().copied().collect(),
            },
            ty,
        )
    }

    /// Replace a vector lane.
    pub fn insert_element(&mut self, vec: ValueId, elem: ValueId, lane: u32, ty: Ty) -> ValueId {
        self.push_value(InstKind::InsertElement { vec, elem, lane }, ty)
    }

    /// Stack slot.
    pub fn alloca(&mut self, elem: Ty, count: u32) -> ValueId {
        self.push_value(InstKind::Alloca { elem, count }, Ty::RAW_PTR)
    }

    /// Lifetime-start marker for an alloca.
    pub fn lifetime_start(&mut self, ptr: ValueId) -> InstId {
        self.push(Function::intrinsic_kind(Intrinsic::LifetimeStart, [ptr]), Ty::Void)
    }

    /// Lifetime-end marker for an alloca.
    pub fn lifetime_end(&mut self, ptr: ValueId) -> InstId {
        self.push(Function::intrinsic_kind(Intrinsic::LifetimeEnd, [ptr]), Ty::Void)
    }

    // -------------------------------------------------------------------------
    // Terminators
    // -------------------------------------------------------------------------

    /// Unconditional branch.
    pub fn br(&mut self, dest: BlockId) -> InstId {
        let inst = self.push(InstKind::Br { dest }, Ty::Void);
        self.func.add_edge(self.current, dest);
        inst
    }

    /// Conditional branch.
    pub fn cond_br(&mut self, cond: ValueId, then_dest: BlockId, else_dest: BlockId) -> InstId {
        let inst = self.push(
            InstKind::CondBr {
                cond,
                then_dest,
                else_dest,
            },
            Ty::Void,
        );
        self.func.add_edge(self.current, then_dest);
        self.func.add_edge(self.current, else_dest);
        inst
    }

    /// Return a value.
    pub fn ret(&mut self, value: ValueId) -> InstId {
        self.push(InstKind::Ret { value: Some(value) }, Ty::Void)
    }

    /// Return nothing.
    pub fn ret_void(&mut self) -> InstId {
        self.push(InstKind::Ret { value: None }, Ty::Void)
    }

    /// Non-returning exit.
    pub fn unreachable(&mut self) -> InstId {
        self.push(InstKind::Unreachable, Ty::Void)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_straight_line() {
        let mut b = FunctionBuilder::new("f", &[Ty::RAW_PTR]);
        let p = b.arg(0);
        let v = b.load(p, Ty::TRACKED_PTR);
        b.ret(v);
        let f = b.finish();

        assert_eq!(f.block_count(), 1);
        assert_eq!(f.block_insts(f.entry).len(), 2);
        assert!(f.terminator(f.entry).is_some());
    }

    #[test]
    fn test_diamond_edges() {
        let mut b = FunctionBuilder::new("f", &[Ty::Int1]);
        let cond = b.arg(0);
        let left = b.create_block();
        let right = b.create_block();
        let merge = b.create_block();
        b.cond_br(cond, left, right);
        b.switch_to_block(left);
        b.br(merge);
        b.switch_to_block(right);
        b.br(merge);
        b.switch_to_block(merge);
        b.ret_void();
        let f = b.finish();

        assert_eq!(f.succs(f.entry), &[left, right]);
        assert_eq!(f.preds(merge), &[left, right]);
        assert!(f.succs(merge).is_empty());
    }

    #[test]
    fn test_gep_preserves_space() {
        let mut b = FunctionBuilder::new("f", &[Ty::RAW_PTR]);
        let p = b.arg(0);
        let t = b.load(p, Ty::TRACKED_PTR);
        let d = b.addr_space_cast(t, AddrSpace::Derived);
        let g = b.gep_const(d, 3);
        assert_eq!(b.func().value_ty(g), Ty::Ptr(AddrSpace::Derived));
    }
}
