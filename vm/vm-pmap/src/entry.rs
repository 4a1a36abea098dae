//! Bit-exact translation records.
//!
//! Three hardware layouts cover every table slot:
//!
//! - [`PointerBits`]: a non-leaf record pointing at the next-level table
//!   (PS **must be 0**).
//! - [`LeafBits`]: a bottom-level record mapping one base page (bit 7 is
//!   **PAT**, not PS).
//! - [`SuperBits`]: a mid-level leaf mapping one superpage (PS **must be 1**,
//!   PAT moves to bit **12**).
//!
//! The `*Bits` types are raw layouts; the [`PointerEntry`], [`LeafEntry`] and
//! [`SuperEntry`] wrappers tag them with the owning architecture so records
//! for different table formats never mix, and translate between the hardware
//! bits and the software [`Attr`] set.

use core::fmt;
use core::marker::PhantomData;

use bitfield_struct::bitfield;
use vm_addr::PageNo;

use crate::level::{Level, PagingArch};
use crate::{Attr, PAGE_SHIFT};

/// Hardware **Present** bit, shared across all record forms (bit 0).
const PRESENT_BIT: u64 = 1 << 0;

/// Hardware **Page Size** bit (bit 7). Zero in pointer records, one in
/// superpage records, and reinterpreted as PAT in bottom-level leaves.
const PS_BIT: u64 = 1 << 7;

/// Every bit a pointer record defines. Bits 6..8 are ignored-or-must-be-zero
/// and bits 59..62 are reserved; a set bit there fails [`PointerEntry::valid`].
const POINTER_DEFINED: u64 = 0x87FF_FFFF_FFFF_FE3F;

/// Every bit a leaf or superpage record defines (all but reserved 59..62).
const LEAF_DEFINED: u64 = 0x87FF_FFFF_FFFF_FFFF;

/// Non-leaf record pointing at the next-level table.
#[bitfield(u64)]
pub struct PointerBits {
    /// Present (bit 0).
    pub present: bool,
    /// Writable (bit 1); intersects with leaf permissions down the walk.
    pub writable: bool,
    /// User/Supervisor (bit 2).
    pub user: bool,
    /// Write-Through (bit 3).
    pub write_through: bool,
    /// Cache Disable (bit 4).
    pub cache_disable: bool,
    /// Accessed (bit 5).
    pub accessed: bool,
    /// Dirty (bit 6): ignored in non-leaf form.
    #[bits(1)]
    __d_ignored: u8,
    /// PS (bit 7): must be 0 in non-leaf form.
    #[bits(1)]
    __ps_must_be_0: u8,
    /// Global (bit 8): ignored in non-leaf form.
    #[bits(1)]
    __g_ignored: u8,
    /// Software bits 9..11; bit 9 marks the pointed-to table non-collectible.
    #[bits(3)]
    pub sw_low: u8,
    /// Next-level table frame, address bits 51:12.
    #[bits(40)]
    frame_51_12: u64,
    /// Software bits 52..58.
    #[bits(7)]
    pub sw_high: u8,
    /// Reserved (bits 59..62): must be 0.
    #[bits(4)]
    __res_59_62: u8,
    /// No-Execute (bit 63).
    pub no_execute: bool,
}

/// Bottom-level leaf mapping one base page.
#[bitfield(u64)]
pub struct LeafBits {
    /// Present (bit 0).
    pub present: bool,
    /// Writable (bit 1).
    pub writable: bool,
    /// User/Supervisor (bit 2).
    pub user: bool,
    /// Write-Through (bit 3).
    pub write_through: bool,
    /// Cache Disable (bit 4).
    pub cache_disable: bool,
    /// Accessed (bit 5): set by the MMU on first access.
    pub accessed: bool,
    /// Dirty (bit 6): set by the MMU on first write.
    pub dirty: bool,
    /// PAT selector (bit 7). This position is PS everywhere else.
    pub pat: bool,
    /// Global (bit 8).
    pub global: bool,
    /// Software bits 9..11.
    #[bits(3)]
    pub sw_low: u8,
    /// Mapped frame, address bits 51:12.
    #[bits(40)]
    frame_51_12: u64,
    /// Software bits 52..58.
    #[bits(7)]
    pub sw_high: u8,
    /// Reserved (bits 59..62): must be 0.
    #[bits(4)]
    __res_59_62: u8,
    /// No-Execute (bit 63).
    pub no_execute: bool,
}

/// Mid-level leaf mapping one superpage.
///
/// The same layout serves every superpage level; the record's span (and
/// therefore how many of the low frame bits must be zero) comes from the
/// [`Level`] passed to the accessors.
#[bitfield(u64)]
pub struct SuperBits {
    /// Present (bit 0).
    pub present: bool,
    /// Writable (bit 1).
    pub writable: bool,
    /// User/Supervisor (bit 2).
    pub user: bool,
    /// Write-Through (bit 3).
    pub write_through: bool,
    /// Cache Disable (bit 4).
    pub cache_disable: bool,
    /// Accessed (bit 5).
    pub accessed: bool,
    /// Dirty (bit 6): set by the MMU on first write to the superpage.
    pub dirty: bool,
    /// PS (bit 7): must be 1 for a superpage leaf.
    #[bits(default = true)]
    pub page_size: bool,
    /// Global (bit 8).
    pub global: bool,
    /// Software bits 9..11.
    #[bits(3)]
    pub sw_low: u8,
    /// PAT selector (bit 12); bit 7 is taken by PS in this form.
    pub pat_large: bool,
    /// Mapped frame, address bits 51:13. The span-alignment requirement
    /// zeroes the low part of this field at every legal level.
    #[bits(39)]
    frame_51_13: u64,
    /// Software bits 52..58.
    #[bits(7)]
    pub sw_high: u8,
    /// Reserved (bits 59..62): must be 0.
    #[bits(4)]
    __res_59_62: u8,
    /// No-Execute (bit 63).
    pub no_execute: bool,
}

/// Software attribute bits that pointer records carry.
const POINTER_ATTRS: Attr = Attr::PRESENT
    .union(Attr::WRITABLE)
    .union(Attr::USER)
    .union(Attr::WRITE_THROUGH)
    .union(Attr::CACHE_DISABLE)
    .union(Attr::ACCESSED)
    .union(Attr::NO_COLLECT)
    .union(Attr::NO_EXECUTE);

/// Software attribute bits that bottom-level leaves carry. `Attr` positions
/// coincide with the hardware positions, PAT included.
const LEAF_ATTRS: Attr = POINTER_ATTRS
    .union(Attr::DIRTY)
    .union(Attr::PAT)
    .union(Attr::GLOBAL);

/// Leaf attributes minus PAT, whose position PS occupies in superpage form.
const SUPER_LOW_ATTRS: Attr = POINTER_ATTRS.union(Attr::DIRTY).union(Attr::GLOBAL);

macro_rules! arch_record {
    ($name:ident, $bits:ty) => {
        impl<A: PagingArch> $name<A> {
            #[inline]
            #[must_use]
            pub const fn from_raw(raw: u64) -> Self {
                Self(<$bits>::from_bits(raw), PhantomData)
            }

            #[inline]
            #[must_use]
            pub const fn raw(self) -> u64 {
                self.0.into_bits()
            }

            #[inline]
            #[must_use]
            pub const fn bits(self) -> $bits {
                self.0
            }
        }

        impl<A: PagingArch> Clone for $name<A> {
            fn clone(&self) -> Self {
                *self
            }
        }

        impl<A: PagingArch> Copy for $name<A> {}

        impl<A: PagingArch> PartialEq for $name<A> {
            fn eq(&self, other: &Self) -> bool {
                self.raw() == other.raw()
            }
        }

        impl<A: PagingArch> Eq for $name<A> {}

        impl<A: PagingArch> fmt::Debug for $name<A> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}<{}>({:#018x})", stringify!($name), A::as_str(), self.raw())
            }
        }
    };
}

/// Non-leaf record tagged with its table format.
pub struct PointerEntry<A: PagingArch>(PointerBits, PhantomData<A>);
arch_record!(PointerEntry, PointerBits);

/// Bottom-level leaf record tagged with its table format.
pub struct LeafEntry<A: PagingArch>(LeafBits, PhantomData<A>);
arch_record!(LeafEntry, LeafBits);

/// Superpage leaf record tagged with its table format.
pub struct SuperEntry<A: PagingArch>(SuperBits, PhantomData<A>);
arch_record!(SuperEntry, SuperBits);

impl<A: PagingArch> PointerEntry<A> {
    /// Builds a present pointer record at `table` carrying the pointer subset
    /// of `attr`.
    #[must_use]
    pub fn new(table: PageNo<A>, attr: Attr) -> Self {
        let raw = (attr & POINTER_ATTRS).bits() | (table.as_u64() << PAGE_SHIFT);
        Self::from_raw(raw)
    }

    /// Frame holding the next-level table.
    #[inline]
    #[must_use]
    pub const fn table(self) -> PageNo<A> {
        PageNo::new_unchecked(self.0.frame_51_12())
    }

    #[must_use]
    pub fn attr(self) -> Attr {
        Attr::from_bits_truncate(self.raw()) & POINTER_ATTRS
    }

    /// The pointed-to table must never be garbage collected.
    #[inline]
    #[must_use]
    pub const fn no_collect(self) -> bool {
        self.0.sw_low() & 1 != 0
    }

    #[inline]
    #[must_use]
    pub const fn with_no_collect(self) -> Self {
        Self(self.0.with_sw_low(self.0.sw_low() | 1), PhantomData)
    }

    /// Whether every set bit is one the hardware defines for this form.
    #[inline]
    #[must_use]
    pub const fn valid(self) -> bool {
        self.raw() & !POINTER_DEFINED == 0
    }
}

impl<A: PagingArch> LeafEntry<A> {
    #[must_use]
    pub fn new(frame: PageNo<A>, attr: Attr) -> Self {
        let raw = (attr & LEAF_ATTRS).bits() | (frame.as_u64() << PAGE_SHIFT);
        Self::from_raw(raw)
    }

    #[inline]
    #[must_use]
    pub const fn frame(self) -> PageNo<A> {
        PageNo::new_unchecked(self.0.frame_51_12())
    }

    #[must_use]
    pub fn attr(self) -> Attr {
        Attr::from_bits_truncate(self.raw()) & LEAF_ATTRS
    }

    #[inline]
    #[must_use]
    pub const fn valid(self) -> bool {
        self.raw() & !LEAF_DEFINED == 0
    }

    /// Rewrites this record as the equivalent superpage record at `level`.
    ///
    /// The PAT bit moves from position 7 to position 12; everything else in
    /// the common flag subset is preserved. The frame must be aligned to the
    /// target level's span.
    #[must_use]
    pub fn to_super(self, level: Level) -> SuperEntry<A> {
        SuperEntry::new(self.frame(), self.attr(), level)
    }
}

impl<A: PagingArch> SuperEntry<A> {
    /// Builds a present superpage record. `frame` must be aligned to the
    /// span of `level`, and `level` must admit leaves on `A`.
    #[must_use]
    pub fn new(frame: PageNo<A>, attr: Attr, level: Level) -> Self {
        debug_assert!(A::leaf_allowed(level) && level > Level::L1);
        debug_assert!(frame.is_aligned_to(level.span_pages()));
        let low = (attr & SUPER_LOW_ATTRS).bits() | PS_BIT;
        let pat = if attr.contains(Attr::PAT) { 1 << 12 } else { 0 };
        Self::from_raw(low | pat | (frame.as_u64() << PAGE_SHIFT))
    }

    /// Base frame of the mapped superpage.
    #[inline]
    #[must_use]
    pub const fn frame(self) -> PageNo<A> {
        PageNo::new_unchecked(self.0.frame_51_13() << 1)
    }

    #[must_use]
    pub fn attr(self) -> Attr {
        let mut attr = Attr::from_bits_truncate(self.raw()) & SUPER_LOW_ATTRS;
        if self.0.pat_large() {
            attr |= Attr::PAT;
        }
        attr
    }

    /// Checks the defined-bit set, the PS bit, and span alignment for `level`.
    #[must_use]
    pub fn valid(self, level: Level) -> bool {
        self.raw() & !LEAF_DEFINED == 0
            && self.0.page_size()
            && self.frame().is_aligned_to(level.span_pages())
    }

    /// Rewrites this record as a bottom-level leaf for its base frame,
    /// moving PAT back from bit 12 to bit 7.
    #[must_use]
    pub fn to_leaf(self) -> LeafEntry<A> {
        LeafEntry::new(self.frame(), self.attr())
    }
}

/// A decoded table slot.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EntryRef<A: PagingArch> {
    /// Slot is not present.
    None,
    /// Pointer to the next-level table.
    Table(PointerEntry<A>),
    /// Bottom-level leaf.
    Leaf(LeafEntry<A>),
    /// Superpage leaf terminating above the bottom level.
    Super(SuperEntry<A>),
}

impl<A: PagingArch> EntryRef<A> {
    /// Interprets a raw slot value read from a table at `level`. Bit 7 is PS
    /// above the bottom level and PAT at it, which is the whole decision.
    #[must_use]
    pub fn decode(raw: u64, level: Level) -> Self {
        if raw & PRESENT_BIT == 0 {
            Self::None
        } else if level == Level::L1 {
            Self::Leaf(LeafEntry::from_raw(raw))
        } else if raw & PS_BIT != 0 {
            Self::Super(SuperEntry::from_raw(raw))
        } else {
            Self::Table(PointerEntry::from_raw(raw))
        }
    }
}
