//! Page-table records and the table walker.
//!
//! Mirrors the translation structures exactly as the MMU reads them, then
//! layers a software walker on top:
//!
//! | Module      | Contents                                                       |
//! | ----------- | -------------------------------------------------------------- |
//! | [`level`]   | Translation levels and the per-architecture layout description |
//! | [`entry`]   | Bit-exact pointer, leaf and superpage records                  |
//! | [`selfmap`] | Recursive self-map address arithmetic                          |
//! | [`pmap`]    | The walker: map, unmap, translate, permission narrowing        |
//! | [`batch`]   | Streaming bulk-mapping builder with superpage promotion        |
//!
//! The crate never touches hardware directly. Physical frames come from a
//! [`FrameAlloc`] and table memory is reached through a [`PhysAccess`], so
//! every code path here runs unmodified in host tests against fake
//! implementations of both traits.

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

pub mod batch;
pub mod entry;
pub mod level;
pub mod pmap;
pub mod selfmap;

use alloc::sync::Arc;

pub use vm_addr::{
    AddrError, MemArch, PAGE_SHIFT, PAGE_SIZE, PageCount, PageNo, PhysAddr, VirtAddr, VirtPageNo,
    X64, X86Pae,
};

pub use crate::batch::MapBatch;
pub use crate::entry::{EntryRef, LeafEntry, PointerEntry, SuperEntry};
pub use crate::level::{Level, PagingArch};
pub use crate::pmap::{AccessDirty, PageInfo, Pmap};

/// Number of record slots in a full translation table.
pub const NR_ENTRIES: usize = 512;

/// `log2(NR_ENTRIES)`: virtual-address bits consumed per level.
pub const NR_ENTRIES_SHIFT: u32 = 9;

/// Top-level slot reserved for the recursive self-map in kernel spaces.
pub const RECURSIVE_IDX: usize = 510;

bitflags::bitflags! {
    /// Software-facing mapping attributes.
    ///
    /// The bit positions coincide with the hardware positions in a bottom-level
    /// leaf record, which keeps the record conversions in [`entry`] to plain
    /// mask work. `PAT` sits at bit 7 in a bottom-level leaf; the superpage
    /// record constructors relocate it to the large-page position.
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct Attr: u64 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const CACHE_DISABLE = 1 << 4;
        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;
        const PAT = 1 << 7;
        const GLOBAL = 1 << 8;
        /// Software bit: the containing table is never garbage collected.
        const NO_COLLECT = 1 << 9;
        const NO_EXECUTE = 1 << 63;

        const PERMISSIONS = Self::WRITABLE.bits() | Self::USER.bits() | Self::NO_EXECUTE.bits();
        const KERNEL_RW = Self::PRESENT.bits() | Self::WRITABLE.bits() | Self::NO_EXECUTE.bits();
        const USER_R = Self::PRESENT.bits() | Self::USER.bits();
        const USER_RW = Self::USER_R.bits() | Self::WRITABLE.bits();
    }
}

impl Attr {
    /// Attributes given to intermediate pointer records. Permissions are
    /// wide-open at the pointer levels; the leaf record decides.
    pub const INTERMEDIATE: Self = Self::PRESENT.union(Self::WRITABLE).union(Self::USER);

    /// Narrows `self` towards `to` without ever widening effective access.
    ///
    /// Grant bits (`WRITABLE`, `USER`) survive only if both sides carry them;
    /// the deny bit (`NO_EXECUTE`) survives if either side carries it. All
    /// non-permission bits pass through untouched.
    #[must_use]
    pub fn reduce(self, to: Self) -> Self {
        let grants = Self::WRITABLE | Self::USER;
        let kept = self & grants & to;
        (self - grants - Self::NO_EXECUTE) | kept | ((self | to) & Self::NO_EXECUTE)
    }
}

/// One page-sized translation table.
///
/// Always a full page even where hardware would accept less (the 3-level
/// top table has four live slots); [`PagingArch::entries_at`] bounds which
/// slots the walker touches.
#[repr(C, align(4096))]
pub struct Table {
    entries: [u64; NR_ENTRIES],
}

static_assertions::assert_eq_size!(Table, [u8; PAGE_SIZE as usize]);

impl Table {
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [0; NR_ENTRIES],
        }
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, index: usize) -> u64 {
        self.entries[index]
    }

    #[inline]
    pub const fn set(&mut self, index: usize, raw: u64) {
        self.entries[index] = raw;
    }

    pub fn zero(&mut self) {
        self.entries = [0; NR_ENTRIES];
    }
}

/// Source of physical frames for both translation tables and, higher up the
/// stack, page contents. `allocate` hands out frames in an unspecified state;
/// the walker zeroes table frames itself.
pub trait FrameAlloc<A: MemArch>: Send + Sync {
    fn allocate(&self) -> Option<PageNo<A>>;
    fn free(&self, page: PageNo<A>);
}

/// Access to physical table memory.
///
/// In a kernel this is the physical-memory window (or the self-map); in host
/// tests it indexes a vector of fake frames.
pub trait PhysAccess<A: MemArch>: Send + Sync {
    /// Returns the table stored in `page`.
    ///
    /// # Safety
    ///
    /// `page` must hold a live translation table owned by the caller, and the
    /// caller must not let two returned references to the same frame overlap.
    unsafe fn table_mut<'a>(&self, page: PageNo<A>) -> &'a mut Table;
}

/// Per-address-space collaborators handed to [`Pmap`](pmap::Pmap) at
/// construction.
pub struct SpaceContext<A: MemArch> {
    kernel: bool,
    access: Arc<dyn PhysAccess<A>>,
    alloc: Arc<dyn FrameAlloc<A>>,
}

impl<A: MemArch> SpaceContext<A> {
    #[must_use]
    pub fn user(access: Arc<dyn PhysAccess<A>>, alloc: Arc<dyn FrameAlloc<A>>) -> Self {
        Self {
            kernel: false,
            access,
            alloc,
        }
    }

    #[must_use]
    pub fn kernel(access: Arc<dyn PhysAccess<A>>, alloc: Arc<dyn FrameAlloc<A>>) -> Self {
        Self {
            kernel: true,
            access,
            alloc,
        }
    }

    #[inline]
    #[must_use]
    pub const fn is_kernel(&self) -> bool {
        self.kernel
    }

    /// Handle to the space's frame allocator, shared with collaborators that
    /// allocate data pages.
    #[must_use]
    pub fn alloc(&self) -> Arc<dyn FrameAlloc<A>> {
        Arc::clone(&self.alloc)
    }
}

impl<A: MemArch> Clone for SpaceContext<A> {
    fn clone(&self) -> Self {
        Self {
            kernel: self.kernel,
            access: Arc::clone(&self.access),
            alloc: Arc::clone(&self.alloc),
        }
    }
}

/// Errors surfaced by the walker.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PmapError {
    #[error(transparent)]
    Addr(#[from] AddrError),

    /// The frame allocator ran dry mid-operation. Tables built so far stay
    /// installed; the caller unwinds via `unmap`.
    #[error("out of physical frames")]
    OutOfMemory,

    /// No translation exists for the requested address.
    #[error("address is not mapped")]
    NotMapped,

    /// The range overlaps the recursive self-map slice of a kernel space.
    #[error("address range is reserved for the self-map")]
    Reserved,
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Fake physical memory shared by the walker tests.

    use std::cell::UnsafeCell;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// A slab of fake frames plus a counting allocator over them.
    ///
    /// Frame numbers index straight into the slab, so the same object serves
    /// as both the allocator and the physical-memory window.
    pub struct TestSpace {
        frames: Vec<UnsafeCell<Table>>,
        free_list: Mutex<Vec<u64>>,
        next: AtomicUsize,
        pub allocs: AtomicUsize,
        pub frees: AtomicUsize,
    }

    // Tests serialize access through the walker under test.
    unsafe impl Sync for TestSpace {}

    impl TestSpace {
        pub fn with_frames(count: usize) -> Arc<Self> {
            let mut frames = Vec::with_capacity(count);
            frames.resize_with(count, || UnsafeCell::new(Table::zeroed()));
            Arc::new(Self {
                frames,
                free_list: Mutex::new(Vec::new()),
                next: AtomicUsize::new(0),
                allocs: AtomicUsize::new(0),
                frees: AtomicUsize::new(0),
            })
        }

        pub fn alloc_count(&self) -> usize {
            self.allocs.load(Ordering::Relaxed)
        }

        pub fn free_count(&self) -> usize {
            self.frees.load(Ordering::Relaxed)
        }
    }

    impl<A: MemArch> PhysAccess<A> for TestSpace {
        unsafe fn table_mut<'a>(&self, page: PageNo<A>) -> &'a mut Table {
            let cell = &self.frames[usize::try_from(page.as_u64()).unwrap()];
            unsafe { &mut *cell.get() }
        }
    }

    impl<A: MemArch> FrameAlloc<A> for TestSpace {
        fn allocate(&self) -> Option<PageNo<A>> {
            let frame = self
                .free_list
                .lock()
                .unwrap()
                .pop()
                .or_else(|| {
                    let n = self.next.fetch_add(1, Ordering::Relaxed);
                    (n < self.frames.len()).then_some(n as u64)
                })?;
            self.allocs.fetch_add(1, Ordering::Relaxed);
            Some(PageNo::new_unchecked(frame))
        }

        fn free(&self, page: PageNo<A>) {
            self.frees.fetch_add(1, Ordering::Relaxed);
            self.free_list.lock().unwrap().push(page.as_u64());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reduce_drops_grants_and_keeps_denies() {
        let full = Attr::PRESENT | Attr::WRITABLE | Attr::USER | Attr::ACCESSED;
        let narrowed = full.reduce(Attr::PRESENT | Attr::USER);
        assert_eq!(narrowed, Attr::PRESENT | Attr::USER | Attr::ACCESSED);

        let nx = full.reduce(Attr::NO_EXECUTE);
        assert!(nx.contains(Attr::NO_EXECUTE));
        assert!(!nx.contains(Attr::WRITABLE));
    }

    #[test]
    fn reduce_never_widens() {
        let ro = Attr::PRESENT | Attr::NO_EXECUTE;
        let widened = ro.reduce(Attr::PRESENT | Attr::WRITABLE | Attr::USER);
        assert_eq!(widened, ro);
    }

    #[test]
    fn table_is_page_sized() {
        assert_eq!(core::mem::align_of::<Table>(), PAGE_SIZE as usize);
    }
}
