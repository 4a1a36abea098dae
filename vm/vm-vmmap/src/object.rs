//! Backing objects.
//!
//! Every mapped range delegates its faults to a [`VmObject`]. The object owns
//! the question of where page contents come from (zero fill, a file cache, a
//! remote pager); the shard only tracks which span of the object a range
//! covers. Fault resolution is the single asynchronous operation in the
//! stack, so the trait methods return futures while everything else stays
//! synchronous.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use async_trait::async_trait;
use bitvec::vec::BitVec;
use vm_addr::{MemArch, PageCount, PageNo};
use vm_pmap::FrameAlloc;

use crate::FaultError;

/// Identifies one fault inside a backing object.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FaultToken {
    /// Page offset into the object.
    pub offset: PageCount,
    /// Whether the faulting access was a write.
    pub write: bool,
}

/// How a mapped range is carried across a fork.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ForkMode {
    /// Parent and child each see their own copy; pages go copy-on-write.
    Copy,
    /// Parent and child keep writing to the same object.
    Share,
}

/// A source of page contents for mapped ranges.
///
/// Implementations are internally synchronized; the shard calls in without
/// holding any of its own locks.
#[async_trait]
pub trait VmObject<A: MemArch>: Send + Sync {
    /// Produces the frame backing `token.offset` for a read access.
    ///
    /// `readahead` is a hint for how many further pages the caller would not
    /// mind having resident; only the frame for the token itself is returned.
    async fn fault_read(
        &self,
        token: FaultToken,
        alloc: &Arc<dyn FrameAlloc<A>>,
        readahead: PageCount,
    ) -> Result<PageNo<A>, FaultError>;

    /// Produces a frame the caller may write through.
    async fn fault_write(
        &self,
        token: FaultToken,
        alloc: &Arc<dyn FrameAlloc<A>>,
    ) -> Result<PageNo<A>, FaultError>;

    /// The object the child of a fork sees for a range carried with `mode`.
    ///
    /// With [`ForkMode::Copy`] the child must observe the parent's contents
    /// as of the fork. An implementation whose pages are reproducible from
    /// scratch may return a fresh object instead of a deep copy only if that
    /// preserves what the child reads; [`AnonObject`] deviates here and
    /// hands the child zeroes even where the parent has written.
    fn fork(self: Arc<Self>, mode: ForkMode) -> Arc<dyn VmObject<A>>;

    /// Splits at `at` pages into the objects backing the two halves of a
    /// divided range.
    ///
    /// Implementations may move resident state into the halves, so the
    /// caller must hold the only mapping of the object. A range whose object
    /// is possibly shared keeps the whole object and addresses it through
    /// its offset instead.
    fn split(self: Arc<Self>, at: PageCount) -> (Arc<dyn VmObject<A>>, Arc<dyn VmObject<A>>);

    /// Residency of `count` pages starting at `offset`, one bit per page.
    fn mincore(&self, offset: PageCount, count: PageCount) -> BitVec;
}

/// Demand-allocated anonymous memory.
///
/// Frames are taken from the space's allocator on first touch and freed when
/// the object goes away. A `Copy` fork hands the child a fresh empty object;
/// a `Share` fork hands it the same one.
pub struct AnonObject<A: MemArch> {
    /// Resident frames by page offset.
    pages: spin::Mutex<BTreeMap<u64, OwnedFrame<A>>>,
}

/// A frame owned by an object, returned to its allocator on drop.
struct OwnedFrame<A: MemArch> {
    page: PageNo<A>,
    alloc: Arc<dyn FrameAlloc<A>>,
}

impl<A: MemArch> Drop for OwnedFrame<A> {
    fn drop(&mut self) {
        self.alloc.free(self.page);
    }
}

impl<A: MemArch> AnonObject<A> {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pages: spin::Mutex::new(BTreeMap::new()),
        })
    }

    fn resident(
        &self,
        offset: PageCount,
        alloc: &Arc<dyn FrameAlloc<A>>,
    ) -> Result<PageNo<A>, FaultError> {
        let mut pages = self.pages.lock();
        if let Some(frame) = pages.get(&offset.get()) {
            return Ok(frame.page);
        }
        let page = alloc.allocate().ok_or(FaultError::OutOfMemory)?;
        pages.insert(
            offset.get(),
            OwnedFrame {
                page,
                alloc: Arc::clone(alloc),
            },
        );
        Ok(page)
    }
}

#[async_trait]
impl<A: MemArch> VmObject<A> for AnonObject<A> {
    async fn fault_read(
        &self,
        token: FaultToken,
        alloc: &Arc<dyn FrameAlloc<A>>,
        _readahead: PageCount,
    ) -> Result<PageNo<A>, FaultError> {
        self.resident(token.offset, alloc)
    }

    async fn fault_write(
        &self,
        token: FaultToken,
        alloc: &Arc<dyn FrameAlloc<A>>,
    ) -> Result<PageNo<A>, FaultError> {
        self.resident(token.offset, alloc)
    }

    fn fork(self: Arc<Self>, mode: ForkMode) -> Arc<dyn VmObject<A>> {
        match mode {
            // Anonymous memory is zero on first touch either way; the child
            // starts with nothing resident and refaults.
            ForkMode::Copy => Self::new(),
            ForkMode::Share => self,
        }
    }

    fn split(self: Arc<Self>, at: PageCount) -> (Arc<dyn VmObject<A>>, Arc<dyn VmObject<A>>) {
        let high = Self::new();
        {
            let mut pages = self.pages.lock();
            let mut moved = pages.split_off(&at.get());
            let mut target = high.pages.lock();
            while let Some((offset, frame)) = moved.pop_first() {
                target.insert(offset - at.get(), frame);
            }
        }
        (self, high)
    }

    fn mincore(&self, offset: PageCount, count: PageCount) -> BitVec {
        let pages = self.pages.lock();
        (0..count.get())
            .map(|i| pages.contains_key(&(offset.get() + i)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use futures::executor::block_on;
    use vm_addr::X64;

    use super::*;

    struct CountingAlloc(core::sync::atomic::AtomicU64);

    impl FrameAlloc<X64> for CountingAlloc {
        fn allocate(&self) -> Option<PageNo<X64>> {
            let n = self.0.fetch_add(1, core::sync::atomic::Ordering::Relaxed);
            Some(PageNo::new_unchecked(0x1000 + n))
        }

        fn free(&self, _page: PageNo<X64>) {}
    }

    fn alloc() -> Arc<dyn FrameAlloc<X64>> {
        Arc::new(CountingAlloc(core::sync::atomic::AtomicU64::new(0)))
    }

    fn token(offset: u64) -> FaultToken {
        FaultToken {
            offset: PageCount::new(offset),
            write: false,
        }
    }

    #[test]
    fn first_touch_allocates_then_sticks() {
        let alloc = alloc();
        let obj = AnonObject::<X64>::new();
        let a = block_on(obj.fault_read(token(3), &alloc, PageCount::ONE)).unwrap();
        let b = block_on(obj.fault_read(token(3), &alloc, PageCount::ONE)).unwrap();
        assert_eq!(a, b);

        let other = block_on(obj.fault_read(token(4), &alloc, PageCount::ONE)).unwrap();
        assert_ne!(a, other);
    }

    #[test]
    fn split_rebases_the_high_half() {
        let alloc = alloc();
        let obj = AnonObject::<X64>::new();
        let low = block_on(obj.fault_read(token(0), &alloc, PageCount::ONE)).unwrap();
        let high = block_on(obj.fault_read(token(5), &alloc, PageCount::ONE)).unwrap();

        let (left, right) = obj.split(PageCount::new(4));
        assert_eq!(
            block_on(left.fault_read(token(0), &alloc, PageCount::ONE)).unwrap(),
            low
        );
        assert_eq!(
            block_on(right.fault_read(token(1), &alloc, PageCount::ONE)).unwrap(),
            high
        );
        assert!(!left.mincore(PageCount::new(5), PageCount::ONE)[0]);
    }

    #[test]
    fn mincore_reports_resident_offsets() {
        let alloc = alloc();
        let obj = AnonObject::<X64>::new();
        block_on(obj.fault_read(token(1), &alloc, PageCount::ONE)).unwrap();

        let bits = obj.mincore(PageCount::new(0), PageCount::new(3));
        assert!(!bits[0] && bits[1] && !bits[2]);
    }
}
