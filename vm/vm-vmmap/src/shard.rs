//! One contiguous slice of an address space.
//!
//! A [`VmShard`] keeps two views of the same entries: an address-ordered map
//! for fault lookup and a size-ordered index of free remainders for
//! allocation. Each entry is a used span (possibly empty) followed by its
//! free remainder, so together the entries partition the managed range into
//! disjoint used and free spans and the tracked free count is the sum of the
//! remainders.
//!
//! The shard lock covers bookkeeping only. Fault resolution drops it before
//! awaiting the backing object and re-validates the mapping afterwards, so a
//! concurrent unmap turns a fault into "no mapping" instead of corrupting
//! state.

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::sync::Arc;
use alloc::vec::Vec;

use bitvec::vec::BitVec;
use vm_addr::{PageCount, PageNo, VirtPageNo};
use vm_pmap::{Attr, FrameAlloc, PagingArch, PmapError};

use crate::FaultError;
use crate::object::{FaultToken, ForkMode, VmObject};

/// Whether a copy-on-write range has taken a write fault since it was set up.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum EntryState {
    Clean,
    Dirty,
}

/// A used span and the free remainder trailing it.
struct Entry<A: PagingArch> {
    /// Mapped pages at the entry's start.
    used: u64,
    /// Free pages following the used span.
    free: u64,
    attr: Attr,
    mode: ForkMode,
    state: EntryState,
    /// Backing object; `None` for an all-free entry.
    object: Option<Arc<dyn VmObject<A>>>,
    /// Page offset of the used span inside the object.
    object_offset: u64,
}

impl<A: PagingArch> Entry<A> {
    fn all_free(pages: u64) -> Self {
        Self {
            used: 0,
            free: pages,
            attr: Attr::empty(),
            mode: ForkMode::Share,
            state: EntryState::Clean,
            object: None,
            object_offset: 0,
        }
    }

    fn span(&self) -> PageCount {
        PageCount::new(self.used + self.free)
    }
}

struct ShardInner<A: PagingArch> {
    entries: BTreeMap<VirtPageNo<A>, Entry<A>>,
    /// `(free remainder, entry start)` for every entry with a remainder.
    free_index: BTreeSet<(u64, VirtPageNo<A>)>,
    free_pages: u64,
}

impl<A: PagingArch> ShardInner<A> {
    fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            free_index: BTreeSet::new(),
            free_pages: 0,
        }
    }

    fn index_insert(&mut self, start: VirtPageNo<A>, free: u64) {
        if free > 0 {
            self.free_index.insert((free, start));
        }
    }

    fn index_remove(&mut self, start: VirtPageNo<A>, free: u64) {
        if free > 0 {
            let removed = self.free_index.remove(&(free, start));
            assert!(removed, "free index out of sync with entries");
        }
    }

    /// Entry whose used span covers `vpn`.
    fn owning(&self, vpn: VirtPageNo<A>) -> Option<(VirtPageNo<A>, &Entry<A>)> {
        let (&start, entry) = self.entries.range(..=vpn).next_back()?;
        (vpn - start < PageCount::new(entry.used)).then_some((start, entry))
    }

    fn owning_mut(&mut self, vpn: VirtPageNo<A>) -> Option<(VirtPageNo<A>, &mut Entry<A>)> {
        let (&start, entry) = self.entries.range_mut(..=vpn).next_back()?;
        (vpn - start < PageCount::new(entry.used)).then_some((start, entry))
    }

    /// Claims `[start, start + count)` out of the gap trailing the entry at
    /// `gap_entry`. The caller has verified the fit.
    #[allow(clippy::too_many_arguments)]
    fn splice(
        &mut self,
        gap_entry: VirtPageNo<A>,
        start: VirtPageNo<A>,
        count: PageCount,
        attr: Attr,
        mode: ForkMode,
        object: Arc<dyn VmObject<A>>,
        object_offset: PageCount,
    ) {
        let (gap_used, gap_free) = {
            let entry = &self.entries[&gap_entry];
            (entry.used, entry.free)
        };
        let free_start = gap_entry + PageCount::new(gap_used);
        let head = (start - free_start).get();
        let tail = gap_free - head - count.get();
        self.index_remove(gap_entry, gap_free);

        if head == 0 && gap_used == 0 {
            // The gap is a whole free entry: claim it in place.
            let entry = match self.entries.get_mut(&gap_entry) {
                Some(entry) => entry,
                None => panic!("gap entry vanished mid-splice"),
            };
            entry.used = count.get();
            entry.free = tail;
            entry.attr = attr;
            entry.mode = mode;
            entry.state = EntryState::Clean;
            entry.object = Some(object);
            entry.object_offset = object_offset.get();
            self.index_insert(gap_entry, tail);
        } else {
            if let Some(entry) = self.entries.get_mut(&gap_entry) {
                entry.free = head;
            }
            self.index_insert(gap_entry, head);
            self.entries.insert(
                start,
                Entry {
                    used: count.get(),
                    free: tail,
                    attr,
                    mode,
                    state: EntryState::Clean,
                    object: Some(object),
                    object_offset: object_offset.get(),
                },
            );
            self.index_insert(start, tail);
        }
        self.free_pages -= count.get();
    }

    /// Turns the whole entry at `start` back into free space, folding it
    /// into the preceding entry's remainder when adjacent.
    fn release_whole(&mut self, start: VirtPageNo<A>) {
        let Some(entry) = self.entries.get(&start) else {
            return;
        };
        let span = entry.span();
        let freed = entry.used;
        self.index_remove(start, entry.free);

        let merged = self
            .entries
            .range(..start)
            .next_back()
            .map(|(&prev, prev_entry)| (prev, prev_entry.free, prev + prev_entry.span()));
        if let Some((prev, prev_free, prev_end)) = merged {
            if prev_end == start {
                self.entries.remove(&start);
                self.index_remove(prev, prev_free);
                if let Some(prev_entry) = self.entries.get_mut(&prev) {
                    prev_entry.free += span.get();
                }
                self.index_insert(prev, prev_free + span.get());
                self.free_pages += freed;
                return;
            }
        }
        if let Some(entry) = self.entries.get_mut(&start) {
            entry.used = 0;
            entry.free = span.get();
            entry.object = None;
            entry.object_offset = 0;
            entry.attr = Attr::empty();
            entry.state = EntryState::Clean;
        }
        self.index_insert(start, span.get());
        self.free_pages += freed;
    }
}

/// Frame and attributes to install for a resolved fault.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Resolved<A: PagingArch> {
    pub page: PageNo<A>,
    pub attr: Attr,
}

/// One independently locked slice of an address space.
pub struct VmShard<A: PagingArch> {
    inner: spin::Mutex<ShardInner<A>>,
    alloc: Arc<dyn FrameAlloc<A>>,
}

impl<A: PagingArch> VmShard<A> {
    #[must_use]
    pub fn new(alloc: Arc<dyn FrameAlloc<A>>) -> Arc<Self> {
        Arc::new(Self {
            inner: spin::Mutex::new(ShardInner::new()),
            alloc,
        })
    }

    /// Registers `[start, start + count)` as an all-free span.
    ///
    /// The range must not overlap anything already managed here.
    pub fn manage(&self, start: VirtPageNo<A>, count: PageCount) {
        let mut inner = self.inner.lock();
        if let Some((&prev, prev_entry)) = inner.entries.range(..=start).next_back() {
            assert!(
                prev + prev_entry.span() <= start,
                "managed ranges overlap"
            );
        }
        if let Some((&next, _)) = inner.entries.range(start..).next() {
            assert!(start + count <= next, "managed ranges overlap");
        }
        inner.entries.insert(start, Entry::all_free(count.get()));
        inner.index_insert(start, count.get());
        inner.free_pages += count.get();
        log::debug!("manage [{start:?}; {} pages]", count.get());
    }

    /// Maps `[start, start + count)` to `object` at `object_offset`.
    ///
    /// The range must lie entirely inside one free gap; anything else is a
    /// caller bug and fails loudly.
    pub fn map(
        &self,
        start: VirtPageNo<A>,
        count: PageCount,
        attr: Attr,
        mode: ForkMode,
        object: Arc<dyn VmObject<A>>,
        object_offset: PageCount,
    ) {
        let mut inner = self.inner.lock();
        let gap_entry = {
            let Some((&gap, entry)) = inner.entries.range(..=start).next_back() else {
                panic!("map target is outside the managed range");
            };
            let free_start = gap + PageCount::new(entry.used);
            let end = free_start + PageCount::new(entry.free);
            assert!(
                start >= free_start && start + count <= end,
                "map target overlaps an existing mapping"
            );
            gap
        };
        inner.splice(gap_entry, start, count, attr, mode, object, object_offset);
    }

    /// Maps `count` pages into the smallest free gap that fits, returning
    /// where they landed. `None` when no gap is large enough.
    pub fn map_anywhere(
        &self,
        count: PageCount,
        attr: Attr,
        mode: ForkMode,
        object: Arc<dyn VmObject<A>>,
        object_offset: PageCount,
    ) -> Option<VirtPageNo<A>> {
        let mut inner = self.inner.lock();
        let &(_, gap_entry) = inner
            .free_index
            .range((count.get(), VirtPageNo::new_unchecked(0))..)
            .next()?;
        let start = gap_entry + PageCount::new(inner.entries[&gap_entry].used);
        inner.splice(gap_entry, start, count, attr, mode, object, object_offset);
        Some(start)
    }

    /// Returns `[start, start + count)` to free space.
    ///
    /// Free spans inside the range are skipped. Mapped spans straddling an
    /// edge shrink in place; the backing object is never split here, since
    /// other ranges (in this space or a forked one) may address the same
    /// object. A surviving piece keeps the whole object and reaches its
    /// slice through `object_offset`.
    pub fn unmap(&self, start: VirtPageNo<A>, count: PageCount) {
        let mut inner = self.inner.lock();
        let end = start + count;
        let touched: Vec<VirtPageNo<A>> = inner
            .entries
            .range(..end)
            .filter(|&(&es, e)| e.used > 0 && es + PageCount::new(e.used) > start)
            .map(|(&es, _)| es)
            .collect();

        for es in touched {
            let (used, free, attr, mode, state, offset) = {
                let e = &inner.entries[&es];
                (e.used, e.free, e.attr, e.mode, e.state, e.object_offset)
            };
            let ee = es + PageCount::new(used);
            let lo = if start > es { start } else { es };
            let hi = if end < ee { end } else { ee };
            let cut = (hi - lo).get();

            if lo == es && hi == ee {
                inner.release_whole(es);
                continue;
            }

            if lo == es {
                // Head cut: the tail survives as a new entry addressing the
                // object past the cut.
                let object = inner.entries[&es].object.clone();
                inner.index_remove(es, free);
                if let Some(e) = inner.entries.get_mut(&es) {
                    e.used = 0;
                    e.free = cut;
                    e.attr = Attr::empty();
                    e.object = None;
                    e.object_offset = 0;
                }
                inner.index_insert(es, cut);
                inner.entries.insert(
                    hi,
                    Entry {
                        used: (ee - hi).get(),
                        free,
                        attr,
                        mode,
                        state,
                        object,
                        object_offset: offset + cut,
                    },
                );
                inner.index_insert(hi, free);
            } else if hi == ee {
                // Tail cut: the freed pages join this entry's remainder.
                inner.index_remove(es, free);
                if let Some(e) = inner.entries.get_mut(&es) {
                    e.used = (lo - es).get();
                    e.free = free + cut;
                }
                inner.index_insert(es, free + cut);
            } else {
                // Middle cut: two surviving pieces over the same object.
                let object = inner.entries[&es].object.clone();
                inner.index_remove(es, free);
                if let Some(e) = inner.entries.get_mut(&es) {
                    e.used = (lo - es).get();
                    e.free = cut;
                }
                inner.index_insert(es, cut);
                inner.entries.insert(
                    hi,
                    Entry {
                        used: (ee - hi).get(),
                        free,
                        attr,
                        mode,
                        state,
                        object,
                        object_offset: offset + (hi - es).get(),
                    },
                );
                inner.index_insert(hi, free);
            }
            inner.free_pages += cut;
        }
    }

    /// Resolves a fault at `vpn` against the owning entry's backing object.
    ///
    /// The shard lock is dropped across the object's future and the mapping
    /// re-validated afterwards; a range unmapped in between surfaces as
    /// [`FaultError::NoMapping`]. `install` runs under the re-acquired lock
    /// once validation passes, so a translation it writes cannot outlive a
    /// later unmap of the range.
    pub async fn resolve_fault(
        &self,
        vpn: VirtPageNo<A>,
        write: bool,
        install: impl FnOnce(&Resolved<A>) -> Result<(), PmapError>,
    ) -> Result<Resolved<A>, FaultError> {
        let (entry_start, object, token) = {
            let inner = self.inner.lock();
            let (start, entry) = inner.owning(vpn).ok_or(FaultError::NoMapping)?;
            if write && !entry.attr.contains(Attr::WRITABLE) {
                return Err(FaultError::Forbidden);
            }
            let object = entry.object.clone().ok_or(FaultError::NoMapping)?;
            let token = FaultToken {
                offset: PageCount::new(entry.object_offset + (vpn - start).get()),
                write,
            };
            (start, object, token)
        };

        let page = if write {
            object.fault_write(token, &self.alloc).await?
        } else {
            object.fault_read(token, &self.alloc, PageCount::ONE).await?
        };

        let mut inner = self.inner.lock();
        let Some((start, entry)) = inner.owning_mut(vpn) else {
            return Err(FaultError::NoMapping);
        };
        let unchanged = start == entry_start
            && entry
                .object
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, &object));
        if !unchanged {
            log::debug!("mapping at {vpn:?} changed during fault resolution");
            return Err(FaultError::NoMapping);
        }

        let mut attr = entry.attr;
        if !write && entry.mode == ForkMode::Copy && entry.state == EntryState::Clean {
            // Keep copy-on-write ranges read-only until a write fault claims
            // a private page.
            attr -= Attr::WRITABLE;
        }
        let resolved = Resolved { page, attr };
        install(&resolved)?;
        if write {
            entry.state = EntryState::Dirty;
        }
        Ok(resolved)
    }

    /// Per-page residency over `[start, start + count)`, free spans reading
    /// as absent.
    #[must_use]
    pub fn mincore(&self, start: VirtPageNo<A>, count: PageCount) -> BitVec {
        let inner = self.inner.lock();
        let end = start + count;
        let mut bits = BitVec::repeat(false, count.get() as usize);
        for (&es, entry) in inner.entries.range(..end) {
            if entry.used == 0 {
                continue;
            }
            let ee = es + PageCount::new(entry.used);
            if ee <= start {
                continue;
            }
            let lo = if start > es { start } else { es };
            let hi = if end < ee { end } else { ee };
            let Some(object) = &entry.object else {
                continue;
            };
            let resident = object.mincore(
                PageCount::new(entry.object_offset + (lo - es).get()),
                hi - lo,
            );
            let base = (lo - start).get() as usize;
            for (i, bit) in resident.iter().by_vals().enumerate() {
                bits.set(base + i, bit);
            }
        }
        bits
    }

    /// Whether `vpn` falls inside this shard's managed spans.
    #[must_use]
    pub fn covers(&self, vpn: VirtPageNo<A>) -> bool {
        let inner = self.inner.lock();
        match inner.entries.range(..=vpn).next_back() {
            Some((&start, entry)) => vpn - start < entry.span(),
            None => false,
        }
    }

    /// Free pages tracked across all remainders.
    #[must_use]
    pub fn free_pages(&self) -> u64 {
        self.inner.lock().free_pages
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Moves every entry of `other` into `self`. The shards' spans must be
    /// disjoint, which holds by construction for shards of one space.
    pub fn merge(&self, other: &Self) {
        let mut mine = self.inner.lock();
        let mut theirs = other.inner.lock();
        while let Some((start, entry)) = theirs.entries.pop_first() {
            mine.entries.insert(start, entry);
        }
        let index = core::mem::take(&mut theirs.free_index);
        mine.free_index.extend(index);
        mine.free_pages += theirs.free_pages;
        theirs.free_pages = 0;
    }

    /// Splits this shard's entries into `ways` shards of roughly equal entry
    /// counts, snapping at entry edges. `self` is left empty.
    #[must_use]
    pub fn fanout(&self, ways: usize) -> Vec<Arc<Self>> {
        assert!(ways > 0, "cannot fan out into zero shards");
        let mut inner = self.inner.lock();
        let total = inner.entries.len();
        let per_shard = total.div_ceil(ways).max(1);

        let mut out = Vec::with_capacity(ways);
        for _ in 0..ways {
            let shard = Self::new(Arc::clone(&self.alloc));
            {
                let mut target = shard.inner.lock();
                for _ in 0..per_shard {
                    let Some((start, entry)) = inner.entries.pop_first() else {
                        break;
                    };
                    inner.index_remove(start, entry.free);
                    inner.free_pages -= entry.free;
                    target.free_pages += entry.free;
                    target.index_insert(start, entry.free);
                    target.entries.insert(start, entry);
                }
            }
            out.push(shard);
        }
        out
    }

    /// Clones this shard for the child of a fork.
    ///
    /// Backing objects are carried per their fork mode and the child starts
    /// clean. Returns the child plus the used spans the caller must narrow
    /// to read-only in the parent's page tables for copy-on-write to take.
    #[must_use]
    pub fn fork(&self) -> (Arc<Self>, Vec<(VirtPageNo<A>, PageCount, Attr)>) {
        let mut inner = self.inner.lock();
        let child = Self::new(Arc::clone(&self.alloc));
        let mut cow = Vec::new();
        {
            let mut target = child.inner.lock();
            for (&start, entry) in &mut inner.entries {
                target.entries.insert(
                    start,
                    Entry {
                        used: entry.used,
                        free: entry.free,
                        attr: entry.attr,
                        mode: entry.mode,
                        state: EntryState::Clean,
                        object: entry.object.clone().map(|o| o.fork(entry.mode)),
                        object_offset: entry.object_offset,
                    },
                );
                target.index_insert(start, entry.free);
                target.free_pages += entry.free;

                if entry.used > 0
                    && entry.mode == ForkMode::Copy
                    && entry.attr.contains(Attr::WRITABLE)
                {
                    entry.state = EntryState::Clean;
                    cow.push((start, PageCount::new(entry.used), entry.attr));
                }
            }
        }
        (child, cow)
    }

    #[cfg(test)]
    fn assert_consistent(&self) {
        let inner = self.inner.lock();
        let summed: u64 = inner.entries.values().map(|e| e.free).sum();
        assert_eq!(summed, inner.free_pages, "free remainders lost or doubled");
        for (&start, entry) in &inner.entries {
            if entry.free > 0 {
                assert!(inner.free_index.contains(&(entry.free, start)));
            }
        }
        assert_eq!(
            inner.free_index.len(),
            inner.entries.values().filter(|e| e.free > 0).count()
        );
        let mut last_end: Option<VirtPageNo<A>> = None;
        for (&start, entry) in &inner.entries {
            if let Some(end) = last_end {
                assert!(end <= start, "entries overlap");
            }
            last_end = Some(start + entry.span());
        }
    }
}
