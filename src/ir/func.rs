//! Function and module storage.
//!
//! A `Function` owns three arenas (values, instructions, blocks) plus the
//! CFG edges between blocks. Instructions live in per-block ordered lists;
//! the pass inserts and erases within those lists but never changes the
//! CFG itself.
//!
//! A `Module` is only the symbol environment: the set of declared runtime
//! functions that calls can target.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::fmt;

use super::arena::{Arena, BitSet, Id};
use super::instr::{CallConv, CallInst, Callee, InstKind, Intrinsic, MemTag};
use super::types::{AddrSpace, Ty};

// =============================================================================
// Ids
// =============================================================================

/// Identifier of a value.
pub type ValueId = Id<ValueData>;
/// Identifier of an instruction.
pub type InstId = Id<InstData>;
/// Identifier of a basic block.
pub type BlockId = Id<BlockData>;
/// Identifier of a declared function symbol.
pub type SymbolId = Id<SymbolData>;

// =============================================================================
// Values
// =============================================================================

/// Constant values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Const {
    /// Integer constant; the value's `Ty` carries the width.
    Int(i64),
    /// Null pointer in the value's address space.
    NullPtr,
}

/// How a value comes into existence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueDef {
    /// Result of an instruction.
    Inst(InstId),
    /// Function argument by index.
    Arg(u32),
    /// Constant.
    Const(Const),
}

/// A value: its type and definition.
#[derive(Debug, Clone)]
pub struct ValueData {
    /// Type of the value.
    pub ty: Ty,
    /// Definition of the value.
    pub def: ValueDef,
}

// =============================================================================
// Instructions and blocks
// =============================================================================

/// An instruction: its kind, result value, and containing block.
#[derive(Debug, Clone)]
pub struct InstData {
    /// The operation.
    pub kind: InstKind,
    /// Result value, if the instruction produces one.
    pub result: Option<ValueId>,
    /// Containing block; invalid after erasure.
    pub block: BlockId,
}

/// A basic block: ordered instructions plus CFG edges.
#[derive(Debug, Clone, Default)]
pub struct BlockData {
    insts: Vec<InstId>,
    preds: SmallVec<[BlockId; 2]>,
    succs: SmallVec<[BlockId; 2]>,
}

// =============================================================================
// Symbols and modules
// =============================================================================

/// A declared function symbol.
#[derive(Debug, Clone)]
pub struct SymbolData {
    /// Link name of the symbol.
    pub name: String,
    /// Return type of the function.
    pub ret: Ty,
}

/// The symbol environment functions are lowered against.
#[derive(Debug, Default)]
pub struct Module {
    symbols: Arena<SymbolData>,
    by_name: FxHashMap<String, SymbolId>,
}

impl Module {
    /// Create an empty module.
    pub fn new() -> Self {
        Module::default()
    }

    /// Declare a symbol, returning the existing id if already declared.
    pub fn declare(&mut self, name: &str, ret: Ty) -> SymbolId {
        if let Some(&id) = self.by_name.get(name) {
            return id;
        }
        let id = self.symbols.alloc(SymbolData {
            name: name.to_string(),
            ret,
        });
        self.by_name.insert(name.to_string(), id);
        id
    }

    /// Look up a symbol by name.
    pub fn lookup(&self, name: &str) -> Option<SymbolId> {
        self.by_name.get(name).copied()
    }

    /// Get a symbol's data.
    pub fn symbol(&self, id: SymbolId) -> &SymbolData {
        &self.symbols[id]
    }
}

// =============================================================================
// Function
// =============================================================================

/// A function in the lowered IR.
pub struct Function {
    /// Function name (diagnostics only).
    pub name: String,
    values: Arena<ValueData>,
    insts: Arena<InstData>,
    blocks: Arena<BlockData>,
    /// The entry block.
    pub entry: BlockId,
    args: Vec<ValueId>,
}

impl Function {
    /// Create a function with the given argument types and an entry block.
    pub fn new(name: &str, params: &[Ty]) -> Self {
        let mut func = Function {
            name: name.to_string(),
            values: Arena::with_capacity(64),
            insts: Arena::with_capacity(64),
            blocks: Arena::new(),
            entry: BlockId::INVALID,
            args: Vec::new(),
        };
        for (i, &ty) in params.iter().enumerate() {
            let v = func.values.alloc(ValueData {
                ty,
                def: ValueDef::Arg(i as u32),
            });
            func.args.push(v);
        }
        func.entry = func.add_block();
        func
    }

    // -------------------------------------------------------------------------
    // Values
    // -------------------------------------------------------------------------

    /// Argument value by index.
    pub fn arg(&self, index: usize) -> ValueId {
        self.args[index]
    }

    /// Number of arguments.
    pub fn arg_count(&self) -> usize {
        self.args.len()
    }

    /// Type of a value.
    #[inline]
    pub fn value_ty(&self, v: ValueId) -> Ty {
        self.values[v].ty
    }

    /// Definition of a value.
    #[inline]
    pub fn value_def(&self, v: ValueId) -> ValueDef {
        self.values[v].def
    }

    /// Whether a value is a constant.
    #[inline]
    pub fn is_const(&self, v: ValueId) -> bool {
        matches!(self.values[v].def, ValueDef::Const(_))
    }

    /// Integer constant value, if `v` is one.
    pub fn const_int_value(&self, v: ValueId) -> Option<i64> {
        match self.values[v].def {
            ValueDef::Const(Const::Int(n)) => Some(n),
            _ => None,
        }
    }

    /// Create an integer constant.
    pub fn iconst(&mut self, ty: Ty, value: i64) -> ValueId {
        self.values.alloc(ValueData {
            ty,
            def: ValueDef::Const(Const::Int(value)),
        })
    }

    /// Create a null pointer constant in the given space.
    pub fn null_ptr(&mut self, space: AddrSpace) -> ValueId {
        self.values.alloc(ValueData {
            ty: Ty::Ptr(space),
            def: ValueDef::Const(Const::NullPtr),
        })
    }

    /// Instruction defining a value, if any.
    pub fn defining_inst(&self, v: ValueId) -> Option<InstId> {
        match self.values[v].def {
            ValueDef::Inst(inst) => Some(inst),
            _ => None,
        }
    }

    // -------------------------------------------------------------------------
    // Blocks
    // -------------------------------------------------------------------------

    /// Add a new empty block.
    pub fn add_block(&mut self) -> BlockId {
        self.blocks.alloc(BlockData::default())
    }

    /// Number of blocks.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Iterate block ids in creation order.
    pub fn block_ids(&self) -> impl Iterator<Item = BlockId> {
        self.blocks.ids()
    }

    /// Ordered instructions of a block.
    #[inline]
    pub fn block_insts(&self, b: BlockId) -> &[InstId] {
        &self.blocks[b].insts
    }

    /// Predecessors of a block.
    #[inline]
    pub fn preds(&self, b: BlockId) -> &[BlockId] {
        &self.blocks[b].preds
    }

    /// Successors of a block.
    #[inline]
    pub fn succs(&self, b: BlockId) -> &[BlockId] {
        &self.blocks[b].succs
    }

    /// Record a CFG edge. Called when terminators are attached.
    pub fn add_edge(&mut self, from: BlockId, to: BlockId) {
        if !self.blocks[from].succs.contains(&to) {
            self.blocks[from].succs.push(to);
        }
        if !self.blocks[to].preds.contains(&from) {
            self.blocks[to].preds.push(from);
        }
    }

    /// Terminator of a block, if the block is non-empty.
    pub fn terminator(&self, b: BlockId) -> Option<InstId> {
        let last = *self.blocks[b].insts.last()?;
        self.insts[last].kind.is_terminator().then_some(last)
    }

    /// Blocks in reverse postorder from the entry.
    pub fn rpo(&self) -> Vec<BlockId> {
        let mut visited = BitSet::with_capacity(self.blocks.len());
        let mut postorder = Vec::with_capacity(self.blocks.len());
        self.dfs_postorder(self.entry, &mut visited, &mut postorder);
        postorder.reverse();
        postorder
    }

    fn dfs_postorder(&self, b: BlockId, visited: &mut BitSet, out: &mut Vec<BlockId>) {
        if visited.contains(b.as_usize()) {
            return;
        }
        visited.insert(b.as_usize());
        for &succ in self.succs(b) {
            self.dfs_postorder(succ, visited, out);
        }
        out.push(b);
    }

    // -------------------------------------------------------------------------
    // Instructions
    // -------------------------------------------------------------------------

    /// Get an instruction.
    #[inline]
    pub fn inst(&self, id: InstId) -> &InstData {
        &self.insts[id]
    }

    /// Get an instruction mutably.
    #[inline]
    pub fn inst_mut(&mut self, id: InstId) -> &mut InstData {
        &mut self.insts[id]
    }

    /// Result value of an instruction.
    #[inline]
    pub fn inst_result(&self, id: InstId) -> Option<ValueId> {
        self.insts[id].result
    }

    /// Block containing an instruction.
    #[inline]
    pub fn inst_block(&self, id: InstId) -> BlockId {
        self.insts[id].block
    }

    fn make_inst(&mut self, kind: InstKind, ty: Ty) -> InstId {
        let id = self.insts.alloc(InstData {
            kind,
            result: None,
            block: BlockId::INVALID,
        });
        if ty != Ty::Void {
            let v = self.values.alloc(ValueData {
                ty,
                def: ValueDef::Inst(id),
            });
            self.insts[id].result = Some(v);
        }
        id
    }

    /// Append an instruction to the end of a block.
    pub fn append(&mut self, b: BlockId, kind: InstKind, ty: Ty) -> InstId {
        let id = self.make_inst(kind, ty);
        self.insts[id].block = b;
        self.blocks[b].insts.push(id);
        id
    }

    /// Insert an instruction immediately before `point`.
    pub fn insert_before(&mut self, point: InstId, kind: InstKind, ty: Ty) -> InstId {
        let b = self.insts[point].block;
        debug_assert!(b.is_valid(), "insertion point was erased");
        let pos = self.position_in_block(point);
        let id = self.make_inst(kind, ty);
        self.insts[id].block = b;
        self.blocks[b].insts.insert(pos, id);
        id
    }

    /// Insert an instruction immediately after `point`.
    pub fn insert_after(&mut self, point: InstId, kind: InstKind, ty: Ty) -> InstId {
        let b = self.insts[point].block;
        debug_assert!(b.is_valid(), "insertion point was erased");
        let pos = self.position_in_block(point);
        let id = self.make_inst(kind, ty);
        self.insts[id].block = b;
        self.blocks[b].insts.insert(pos + 1, id);
        id
    }

    /// Insert an instruction at the start of a block.
    pub fn prepend(&mut self, b: BlockId, kind: InstKind, ty: Ty) -> InstId {
        let id = self.make_inst(kind, ty);
        self.insts[id].block = b;
        self.blocks[b].insts.insert(0, id);
        id
    }

    /// Remove an instruction from its block. The result value, if any,
    /// must already be unused.
    pub fn erase(&mut self, id: InstId) {
        let b = self.insts[id].block;
        if b.is_valid() {
            let pos = self.position_in_block(id);
            self.blocks[b].insts.remove(pos);
            self.insts[id].block = BlockId::INVALID;
        }
    }

    /// The instruction preceding `id` in its block, if any.
    pub fn prev_in_block(&self, id: InstId) -> Option<InstId> {
        let b = self.insts[id].block;
        if !b.is_valid() {
            return None;
        }
        let pos = self.position_in_block(id);
        (pos > 0).then(|| self.blocks[b].insts[pos - 1])
    }

    fn position_in_block(&self, id: InstId) -> usize {
        let b = self.insts[id].block;
        self.blocks[b]
            .insts
            .iter()
            .position(|&i| i == id)
            .expect("instruction not in its block list")
    }

    // -------------------------------------------------------------------------
    // Uses
    // -------------------------------------------------------------------------

    /// Replace every use of `old` with `new` across the function.
    pub fn replace_all_uses(&mut self, old: ValueId, new: ValueId) {
        for (_, inst) in self.insts.iter_mut() {
            if !inst.block.is_valid() {
                continue;
            }
            inst.kind.for_each_operand_mut(|v| {
                if *v == old {
                    *v = new;
                }
            });
        }
    }

    /// Instructions that use `v` as an operand, in block/program order.
    pub fn users(&self, v: ValueId) -> Vec<InstId> {
        let mut out = Vec::new();
        for b in self.blocks.ids() {
            for &inst in &self.blocks[b].insts {
                let mut used = false;
                self.insts[inst].kind.for_each_operand(|op| {
                    if op == v {
                        used = true;
                    }
                });
                if used {
                    out.push(inst);
                }
            }
        }
        out
    }

    // -------------------------------------------------------------------------
    // Diagnostics
    // -------------------------------------------------------------------------

    /// Render a value for error messages.
    pub fn display_value(&self, v: ValueId) -> ValueDisplay<'_> {
        ValueDisplay { func: self, v }
    }
}

/// Formats a value as `v12: tracked* = load` for diagnostics.
pub struct ValueDisplay<'a> {
    func: &'a Function,
    v: ValueId,
}

impl fmt::Display for ValueDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = &self.func.values[self.v];
        write!(f, "v{}: {}", self.v.index(), data.ty)?;
        match data.def {
            ValueDef::Inst(inst) => write!(f, " = {}", self.func.insts[inst].kind.mnemonic()),
            ValueDef::Arg(i) => write!(f, " = arg{}", i),
            ValueDef::Const(Const::Int(n)) => write!(f, " = const {}", n),
            ValueDef::Const(Const::NullPtr) => write!(f, " = null"),
        }
    }
}

// =============================================================================
// Convenience constructors used by the pass when rewriting IR
// =============================================================================

impl Function {
    /// Build a call instruction kind.
    pub fn call_kind(
        callee: Callee,
        conv: CallConv,
        args: impl IntoIterator<Item = ValueId>,
    ) -> InstKind {
        InstKind::Call(CallInst {
            callee,
            args: args.into_iter().collect(),
            conv,
            returns_twice: false,
        })
    }

    /// Build an intrinsic call kind.
    pub fn intrinsic_kind(
        intrinsic: Intrinsic,
        args: impl IntoIterator<Item = ValueId>,
    ) -> InstKind {
        Self::call_kind(Callee::Intrinsic(intrinsic), CallConv::Default, args)
    }

    /// Build a GEP with a single constant word index.
    pub fn const_gep_kind(&mut self, base: ValueId, index: i64) -> InstKind {
        let idx = self.iconst(Ty::Int32, index);
        InstKind::Gep {
            base,
            indices: smallvec::smallvec![idx],
        }
    }

    /// Build a store kind.
    pub fn store_kind(value: ValueId, ptr: ValueId, tag: MemTag) -> InstKind {
        InstKind::Store { value, ptr, tag }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn store(f: &mut Function, b: BlockId, v: ValueId, p: ValueId) -> InstId {
        f.append(b, Function::store_kind(v, p, MemTag::None), Ty::Void)
    }

    #[test]
    fn test_insertion_order() {
        let mut f = Function::new("t", &[Ty::RAW_PTR]);
        let b = f.entry;
        let p = f.arg(0);
        let v = f.iconst(Ty::Int64, 1);

        let s1 = store(&mut f, b, v, p);
        let s3 = store(&mut f, b, v, p);
        let s2 = f.insert_before(s3, Function::store_kind(v, p, MemTag::None), Ty::Void);
        let s0 = f.prepend(b, Function::store_kind(v, p, MemTag::None), Ty::Void);

        assert_eq!(f.block_insts(b), &[s0, s1, s2, s3]);
        assert_eq!(f.prev_in_block(s2), Some(s1));
        assert_eq!(f.prev_in_block(s0), None);

        f.erase(s1);
        assert_eq!(f.block_insts(b), &[s0, s2, s3]);
        assert_eq!(f.prev_in_block(s2), Some(s0));
    }

    #[test]
    fn test_replace_all_uses() {
        let mut f = Function::new("t", &[Ty::RAW_PTR]);
        let b = f.entry;
        let p = f.arg(0);
        let old = f.iconst(Ty::Int64, 1);
        let s = store(&mut f, b, old, p);

        let new = f.iconst(Ty::Int64, 2);
        f.replace_all_uses(old, new);

        let mut seen = Vec::new();
        f.inst(s).kind.for_each_operand(|v| seen.push(v));
        assert_eq!(seen, vec![new, p]);
        assert!(f.users(old).is_empty());
        assert_eq!(f.users(new), vec![s]);
    }

    #[test]
    fn test_rpo_diamond() {
        let mut f = Function::new("t", &[]);
        let entry = f.entry;
        let left = f.add_block();
        let right = f.add_block();
        let merge = f.add_block();
        f.add_edge(entry, left);
        f.add_edge(entry, right);
        f.add_edge(left, merge);
        f.add_edge(right, merge);

        let rpo = f.rpo();
        assert_eq!(rpo.len(), 4);
        assert_eq!(rpo[0], entry);
        assert_eq!(rpo[3], merge);
    }

    #[test]
    fn test_module_symbols() {
        let mut m = Module::new();
        let a = m.declare("rt_pool_alloc", Ty::TRACKED_PTR);
        let b = m.declare("rt_pool_alloc", Ty::TRACKED_PTR);
        assert_eq!(a, b);
        assert_eq!(m.lookup("rt_pool_alloc"), Some(a));
        assert_eq!(m.lookup("missing"), None);
        assert_eq!(m.symbol(a).name, "rt_pool_alloc");
    }

    #[test]
    fn test_result_values() {
        let mut f = Function::new("t", &[Ty::RAW_PTR]);
        let b = f.entry;
        let p = f.arg(0);
        let load = f.append(
            b,
            InstKind::Load {
                ptr: p,
                tag: MemTag::None,
            },
            Ty::TRACKED_PTR,
        );
        let v = f.inst_result(load).unwrap();
        assert_eq!(f.value_ty(v), Ty::TRACKED_PTR);
        assert_eq!(f.defining_inst(v), Some(load));

        let s = store(&mut f, b, v, p);
        assert_eq!(f.inst_result(s), None);
    }
}
