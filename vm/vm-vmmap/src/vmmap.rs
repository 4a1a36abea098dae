//! The whole address space.
//!
//! A [`Vmmap`] composes one [`Pmap`] with a set of independently locked
//! [`VmShard`]s. Layout operations and faults touch exactly one shard plus,
//! briefly, the pmap; only [`Vmmap::reshard`] and [`Vmmap::fork`] serialize
//! the whole space. The shard count is policy: callers grow it when lock
//! contention is observed and shrink it when shards sit idle.

use alloc::sync::Arc;
use alloc::vec::Vec;

use bitvec::vec::BitVec;
use vm_addr::{PageCount, PhysAddr, VirtAddr, VirtPageNo};
use vm_pmap::{Attr, PageInfo, PagingArch, Pmap, PmapError, SpaceContext};

use crate::FaultError;
use crate::object::{ForkMode, VmObject};
use crate::shard::VmShard;

pub struct Vmmap<A: PagingArch> {
    pmap: spin::Mutex<Pmap<A>>,
    shards: spin::RwLock<Vec<Arc<VmShard<A>>>>,
    ctx: SpaceContext<A>,
}

impl<A: PagingArch> Vmmap<A> {
    /// Creates an empty space with a single shard.
    pub fn new(ctx: SpaceContext<A>) -> Result<Self, PmapError> {
        let pmap = Pmap::new(ctx.clone())?;
        let shard = VmShard::new(ctx.alloc());
        Ok(Self {
            pmap: spin::Mutex::new(pmap),
            shards: spin::RwLock::new(alloc::vec![shard]),
            ctx,
        })
    }

    /// Registers `[start, start + count)` as managed free space.
    pub fn manage(&self, start: VirtPageNo<A>, count: PageCount) {
        let shards = self.shards.read();
        let target = shards
            .iter()
            .min_by_key(|shard| shard.free_pages())
            .cloned();
        drop(shards);
        match target {
            Some(shard) => shard.manage(start, count),
            None => unreachable!("a space always has at least one shard"),
        }
    }

    /// Maps `[start, start + count)` to `object`. The translation is
    /// installed lazily, by faults.
    pub fn map(
        &self,
        start: VirtPageNo<A>,
        count: PageCount,
        attr: Attr,
        mode: ForkMode,
        object: Arc<dyn VmObject<A>>,
        object_offset: PageCount,
    ) {
        let shard = match self.shard_for(start) {
            Some(shard) => shard,
            None => panic!("map target is outside the managed range"),
        };
        shard.map(start, count, attr, mode, object, object_offset);
    }

    /// Maps `count` pages wherever they fit, preferring the tightest gap.
    pub fn map_anywhere(
        &self,
        count: PageCount,
        attr: Attr,
        mode: ForkMode,
        object: Arc<dyn VmObject<A>>,
        object_offset: PageCount,
    ) -> Option<VirtPageNo<A>> {
        let shards: Vec<_> = self.shards.read().clone();
        shards.iter().find_map(|shard| {
            shard.map_anywhere(
                count,
                attr,
                mode,
                Arc::clone(&object),
                object_offset,
            )
        })
    }

    /// Drops mappings and translations for `[start, start + count)`.
    pub fn unmap(&self, start: VirtPageNo<A>, count: PageCount) -> Result<(), PmapError> {
        let shards: Vec<_> = self.shards.read().clone();
        for shard in &shards {
            shard.unmap(start, count);
        }
        self.pmap.lock().unmap(start, count)
    }

    /// Resolves a read fault at `va` and installs the result.
    pub async fn fault_read(&self, va: VirtAddr<A>) -> Result<(), FaultError> {
        self.fault(va, false).await
    }

    /// Resolves a write fault at `va` and installs the result.
    pub async fn fault_write(&self, va: VirtAddr<A>) -> Result<(), FaultError> {
        self.fault(va, true).await
    }

    async fn fault(&self, va: VirtAddr<A>, write: bool) -> Result<(), FaultError> {
        let vpn = va.vpage();
        // Hold the shard list only long enough to pick the owner.
        let shard = self.shard_for(vpn).ok_or(FaultError::NoMapping)?;
        // The translation is written while the shard still vouches for the
        // mapping; an unmap racing past the install would otherwise leave it
        // live. Lock order is shard before pmap, everywhere.
        let resolved = shard
            .resolve_fault(vpn, write, |resolved| {
                self.pmap.lock().map(vpn, resolved.page, resolved.attr)
            })
            .await?;
        log::trace!(
            "fault {} at {va:?} -> frame {:#x}",
            if write { "write" } else { "read" },
            resolved.page.as_u64()
        );
        Ok(())
    }

    pub fn virt_to_phys(&self, va: VirtAddr<A>) -> Result<PhysAddr<A>, PmapError> {
        self.pmap.lock().virt_to_phys(va)
    }

    pub fn virt_to_page(&self, va: VirtAddr<A>) -> Result<PageInfo<A>, PmapError> {
        self.pmap.lock().virt_to_page(va)
    }

    /// Narrows translation permissions without touching shard state.
    pub fn reduce_permission(
        &self,
        vpn: VirtPageNo<A>,
        attr: Attr,
        flush_ad: bool,
    ) -> Result<(), PmapError> {
        self.pmap.lock().reduce_permission(vpn, attr, flush_ad)?;
        Ok(())
    }

    /// Per-page residency over `[start, start + count)` across all shards.
    #[must_use]
    pub fn mincore(&self, start: VirtPageNo<A>, count: PageCount) -> BitVec {
        let shards: Vec<_> = self.shards.read().clone();
        let mut bits = BitVec::repeat(false, count.get() as usize);
        for shard in &shards {
            for (i, bit) in shard.mincore(start, count).iter().by_vals().enumerate() {
                if bit {
                    bits.set(i, true);
                }
            }
        }
        bits
    }

    #[must_use]
    pub fn shard_count(&self) -> usize {
        self.shards.read().len()
    }

    /// Redistributes all entries over `ways` shards.
    ///
    /// The one operation that serializes the whole space; everything is
    /// funneled into a single shard and fanned back out at entry edges.
    pub fn reshard(&self, ways: usize) {
        assert!(ways > 0, "a space needs at least one shard");
        let mut shards = self.shards.write();
        let Some(first) = shards.first().cloned() else {
            return;
        };
        for other in shards.iter().skip(1) {
            first.merge(other);
        }
        *shards = first.fanout(ways);
        log::debug!("resharded into {ways} shards");
    }

    /// Clones the space for a child task.
    ///
    /// Shards are forked entry by entry. Writable copy-on-write ranges are
    /// narrowed to read-only in this space's translations so the next parent
    /// write faults and claims a private page; the child starts with empty
    /// translations and faults everything in.
    pub fn fork(&self) -> Result<Self, PmapError> {
        let shards = self.shards.read();

        // Fork the shards before touching the pmap; fault resolution takes
        // the pmap lock while holding a shard lock, so taking them in the
        // other order here would deadlock against a concurrent fault.
        let mut child_shards = Vec::with_capacity(shards.len());
        let mut cow = Vec::new();
        for shard in shards.iter() {
            let (child, ranges) = shard.fork();
            child_shards.push(child);
            cow.extend(ranges);
        }

        let mut pmap = self.pmap.lock();
        for (start, count, attr) in cow {
            let target = attr - Attr::WRITABLE;
            for i in 0..count.get() {
                pmap.reduce_permission(start + PageCount::new(i), target, false)?;
            }
        }
        drop(pmap);

        Ok(Self {
            pmap: spin::Mutex::new(Pmap::new(self.ctx.clone())?),
            shards: spin::RwLock::new(child_shards),
            ctx: self.ctx.clone(),
        })
    }

    fn shard_for(&self, vpn: VirtPageNo<A>) -> Option<Arc<VmShard<A>>> {
        let shards = self.shards.read();
        shards.iter().find(|shard| shard.covers(vpn)).cloned()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::FutureExt;
    use vm_addr::{PageNo, X64};
    use vm_pmap::{FrameAlloc, PhysAccess, Table};

    use super::*;
    use crate::object::AnonObject;

    /// Slab of fake frames doubling as allocator and physical window.
    struct Slab {
        frames: Vec<core::cell::UnsafeCell<Table>>,
        next: AtomicUsize,
    }

    unsafe impl Sync for Slab {}

    impl Slab {
        fn new(count: usize) -> Arc<Self> {
            let mut frames = Vec::with_capacity(count);
            frames.resize_with(count, || core::cell::UnsafeCell::new(Table::zeroed()));
            Arc::new(Self {
                frames,
                next: AtomicUsize::new(0),
            })
        }
    }

    impl PhysAccess<X64> for Slab {
        unsafe fn table_mut<'a>(&self, page: PageNo<X64>) -> &'a mut Table {
            let cell = &self.frames[usize::try_from(page.as_u64()).unwrap()];
            unsafe { &mut *cell.get() }
        }
    }

    impl FrameAlloc<X64> for Slab {
        fn allocate(&self) -> Option<PageNo<X64>> {
            let n = self.next.fetch_add(1, Ordering::Relaxed);
            (n < self.frames.len()).then(|| PageNo::new_unchecked(n as u64))
        }

        fn free(&self, _page: PageNo<X64>) {}
    }

    fn space() -> Vmmap<X64> {
        let slab = Slab::new(512);
        Vmmap::new(SpaceContext::user(slab.clone(), slab)).unwrap()
    }

    fn vpn(va: u64) -> VirtPageNo<X64> {
        VirtAddr::new(va).unwrap().vpage()
    }

    #[test]
    fn fault_installs_the_translation_lazily() {
        let vm = space();
        vm.manage(vpn(0x1000_0000), PageCount::new(64));
        vm.map(
            vpn(0x1000_0000),
            PageCount::new(4),
            Attr::USER_RW,
            ForkMode::Share,
            AnonObject::new(),
            PageCount::new(0),
        );

        let va = VirtAddr::new(0x1000_1000).unwrap();
        assert_eq!(vm.virt_to_phys(va), Err(PmapError::NotMapped));

        vm.fault_read(va).now_or_never().unwrap().unwrap();
        let info = vm.virt_to_page(va).unwrap();
        assert!(info.attr.contains(Attr::USER));
    }

    #[test]
    fn unmap_clears_both_layers() {
        let vm = space();
        vm.manage(vpn(0x2000_0000), PageCount::new(16));
        vm.map(
            vpn(0x2000_0000),
            PageCount::new(16),
            Attr::USER_RW,
            ForkMode::Share,
            AnonObject::new(),
            PageCount::new(0),
        );
        let va = VirtAddr::new(0x2000_0000).unwrap();
        vm.fault_write(va).now_or_never().unwrap().unwrap();
        assert!(vm.virt_to_phys(va).is_ok());

        vm.unmap(vpn(0x2000_0000), PageCount::new(16)).unwrap();
        assert_eq!(vm.virt_to_phys(va), Err(PmapError::NotMapped));
        assert_eq!(
            vm.fault_read(va).now_or_never().unwrap(),
            Err(FaultError::NoMapping)
        );
    }

    #[test]
    fn reshard_preserves_mappings() {
        let vm = space();
        for i in 0..4_u64 {
            vm.manage(vpn(0x3000_0000 + i * 0x10_0000), PageCount::new(16));
        }
        vm.map(
            vpn(0x3000_0000),
            PageCount::new(8),
            Attr::USER_RW,
            ForkMode::Share,
            AnonObject::new(),
            PageCount::new(0),
        );

        vm.reshard(3);
        assert_eq!(vm.shard_count(), 3);

        let va = VirtAddr::new(0x3000_2000).unwrap();
        vm.fault_read(va).now_or_never().unwrap().unwrap();
        assert!(vm.virt_to_phys(va).is_ok());

        vm.reshard(1);
        assert_eq!(vm.shard_count(), 1);
        vm.fault_read(VirtAddr::new(0x3000_3000).unwrap())
            .now_or_never()
            .unwrap()
            .unwrap();
    }

    #[test]
    fn mincore_aggregates_across_shards() {
        let vm = space();
        vm.reshard(2);
        vm.manage(vpn(0x4000_0000), PageCount::new(4));
        vm.manage(vpn(0x5000_0000), PageCount::new(4));
        vm.map(
            vpn(0x4000_0000),
            PageCount::new(4),
            Attr::USER_RW,
            ForkMode::Share,
            AnonObject::new(),
            PageCount::new(0),
        );
        vm.fault_read(VirtAddr::new(0x4000_0000).unwrap())
            .now_or_never()
            .unwrap()
            .unwrap();

        let bits = vm.mincore(vpn(0x4000_0000), PageCount::new(4));
        assert!(bits[0]);
        assert!(!bits[1]);
    }
}
