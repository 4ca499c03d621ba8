//! Type lattice for the lowered IR.
//!
//! The pass only reasons about a small closed set of types:
//! - integers of the widths the runtime ABI uses
//! - opaque pointers qualified by an address space
//! - vectors of pointers (one lane per tracked element)
//! - the two-field union representation used for union-typed call returns
//!
//! Pointee types carry no semantics at this stage; a pointer is fully
//! described by its address space.

use std::fmt;

// =============================================================================
// Address Spaces
// =============================================================================

/// Address space of a pointer value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AddrSpace {
    /// Ordinary untracked memory. The collector never inspects these.
    Generic = 0,
    /// Pointers the collector must see; every live one needs a root slot.
    Tracked = 1,
    /// Interior or cast-through pointers whose base is tracked. These can
    /// never be stored to a root slot directly; they are lifted to their
    /// base first.
    Derived = 2,
}

impl AddrSpace {
    /// Whether values in this space are of interest to the collector.
    #[inline]
    pub const fn is_gc(self) -> bool {
        matches!(self, AddrSpace::Tracked | AddrSpace::Derived)
    }
}

// =============================================================================
// Types
// =============================================================================

/// The closed type lattice of the lowered IR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ty {
    /// No value (stores, branches, markers).
    Void,
    /// 1-bit integer (conditions).
    Int1,
    /// 8-bit integer (union selectors, memset fill bytes).
    Int8,
    /// 32-bit integer.
    Int32,
    /// Word-sized integer.
    Int64,
    /// Opaque pointer in an address space.
    Ptr(AddrSpace),
    /// Vector of pointers; all lanes share one address space.
    PtrVec(AddrSpace, u32),
    /// Two-field aggregate of a tracked pointer and an 8-bit selector,
    /// used to return union-typed values from calls.
    Union,
}

impl Ty {
    /// The canonical type every root slot holds.
    pub const TRACKED_PTR: Ty = Ty::Ptr(AddrSpace::Tracked);

    /// Pointer in the untracked generic space (allocas, raw memory).
    pub const RAW_PTR: Ty = Ty::Ptr(AddrSpace::Generic);

    /// Whether this is a scalar pointer the collector cares about.
    #[inline]
    pub const fn is_gc_ptr(self) -> bool {
        matches!(self, Ty::Ptr(space) if space.is_gc())
    }

    /// Whether this is a vector of pointers the collector cares about.
    #[inline]
    pub const fn is_gc_ptr_vec(self) -> bool {
        matches!(self, Ty::PtrVec(space, _) if space.is_gc())
    }

    /// Whether this is the union return representation.
    #[inline]
    pub const fn is_union_rep(self) -> bool {
        matches!(self, Ty::Union)
    }

    /// Address space of a scalar or vector pointer.
    #[inline]
    pub const fn addr_space(self) -> Option<AddrSpace> {
        match self {
            Ty::Ptr(space) | Ty::PtrVec(space, _) => Some(space),
            _ => None,
        }
    }

    /// Lane count of a vector type.
    #[inline]
    pub const fn lanes(self) -> Option<u32> {
        match self {
            Ty::PtrVec(_, n) => Some(n),
            _ => None,
        }
    }

    /// Whether this is any pointer type.
    #[inline]
    pub const fn is_ptr(self) -> bool {
        matches!(self, Ty::Ptr(_))
    }
}

impl fmt::Display for Ty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ty::Void => write!(f, "void"),
            Ty::Int1 => write!(f, "i1"),
            Ty::Int8 => write!(f, "i8"),
            Ty::Int32 => write!(f, "i32"),
            Ty::Int64 => write!(f, "i64"),
            Ty::Ptr(AddrSpace::Generic) => write!(f, "ptr"),
            Ty::Ptr(AddrSpace::Tracked) => write!(f, "tracked*"),
            Ty::Ptr(AddrSpace::Derived) => write!(f, "derived*"),
            Ty::PtrVec(space, n) => write!(f, "<{} x {}>", n, Ty::Ptr(*space)),
            Ty::Union => write!(f, "{{tracked*, i8}}"),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
