//! The table walker.
//!
//! A [`Pmap`] owns the translation tree of one address space: the root table,
//! every intermediate table hanging off it, and per-table bookkeeping for
//! garbage collection. All table memory is reached through the space's
//! [`PhysAccess`] and allocated from its [`FrameAlloc`], so the walker runs
//! identically under a kernel and in host tests.
//!
//! Intermediate tables are reference counted by live (present) slots. When an
//! unmap drops a table's last live slot the table is freed and the count
//! cascades upward, except through tables marked non-collectible, which pin
//! wired kernel translations in place.

use alloc::collections::BTreeMap;

use vm_addr::{PageCount, PageNo, PhysAddr, VirtAddr, VirtPageNo, X64};

use crate::entry::{EntryRef, LeafEntry, PointerEntry, SuperEntry};
use crate::level::{Level, PagingArch, table_index};
use crate::{
    Attr, NR_ENTRIES, PAGE_SHIFT, PmapError, RECURSIVE_IDX, SpaceContext,
};

/// Accessed/dirty state harvested from a terminal record.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct AccessDirty {
    pub accessed: bool,
    pub dirty: bool,
}

/// Result of a structure query: which frame backs an address, at which level
/// the translation terminated, and with which attributes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PageInfo<A: PagingArch> {
    /// Base-page frame containing the queried address.
    pub page: PageNo<A>,
    /// Level of the terminal record; anything above [`Level::L1`] means the
    /// address is covered by a superpage.
    pub level: Level,
    pub attr: Attr,
}

/// Per-table bookkeeping. Keyed by table frame in [`Pmap::tables`].
struct TableMeta {
    /// Level of the records stored in this table.
    level: Level,
    /// Present slots. The table is collectible at zero.
    live: u16,
    /// Never collect this table, even when empty.
    critical: bool,
    /// Owning slot, `None` for the root.
    parent: Option<(u64, usize)>,
}

/// Physical-map layer of one address space.
pub struct Pmap<A: PagingArch> {
    root: PageNo<A>,
    ctx: SpaceContext<A>,
    tables: BTreeMap<u64, TableMeta>,
}

impl<A: PagingArch> Pmap<A> {
    /// Allocates the root table of a fresh, empty space.
    ///
    /// Kernel spaces on a 4-level architecture get the recursive self-map
    /// installed in slot [`RECURSIVE_IDX`]; mapping requests into that slice
    /// are refused from then on.
    pub fn new(ctx: SpaceContext<A>) -> Result<Self, PmapError> {
        let root = ctx.alloc.allocate().ok_or(PmapError::OutOfMemory)?;
        // Safety: freshly allocated, owned by us alone.
        unsafe { ctx.access.table_mut(root) }.zero();

        let mut pmap = Self {
            root,
            ctx,
            tables: BTreeMap::new(),
        };
        pmap.tables.insert(
            root.as_u64(),
            TableMeta {
                level: A::TOP,
                live: 0,
                critical: true,
                parent: None,
            },
        );
        if pmap.ctx.kernel && A::SELF_MAP {
            pmap.install_self_map();
        }
        log::debug!("new {} space, root frame {:#x}", A::as_str(), root.as_u64());
        Ok(pmap)
    }

    /// Frame of the root table, in the form the translation register takes.
    #[inline]
    #[must_use]
    pub const fn root(&self) -> PageNo<A> {
        self.root
    }

    /// Installs one base-page translation, replacing any previous one.
    ///
    /// Missing intermediate tables are allocated and a covering superpage is
    /// split first. On allocation failure the tables built so far stay
    /// installed; a later `unmap` of the range collects them.
    pub fn map(&mut self, vpn: VirtPageNo<A>, page: PageNo<A>, attr: Attr) -> Result<(), PmapError> {
        self.check_reserved(vpn)?;
        let table = self.ensure_chain(vpn, Level::L1)?;
        let idx = table_index::<A>(vpn.base().as_u64(), Level::L1);
        self.write_leaf(table, idx, LeafEntry::new(page, attr | Attr::PRESENT));
        if attr.contains(Attr::NO_COLLECT) {
            self.pin_chain(vpn);
        }
        Ok(())
    }

    /// Installs one superpage translation at `level`.
    ///
    /// `frame` and `vpn` must both be aligned to the level's span. A pointer
    /// table previously covering the slot is freed wholesale.
    pub fn map_super(
        &mut self,
        vpn: VirtPageNo<A>,
        frame: PageNo<A>,
        attr: Attr,
        level: Level,
    ) -> Result<(), PmapError> {
        debug_assert!(A::leaf_allowed(level) && level > Level::L1);
        debug_assert!(vpn.is_aligned_to(level.span_pages()));
        self.check_reserved(vpn)?;

        let table = self.ensure_chain(vpn, level)?;
        let idx = table_index::<A>(vpn.base().as_u64(), level);
        let old = self.slot(table, idx);
        match EntryRef::<A>::decode(old, level) {
            EntryRef::Table(ptr) => self.free_subtree(ptr.table(), self.child_level(level)),
            EntryRef::None => self.meta_mut(table.as_u64()).live += 1,
            EntryRef::Leaf(_) | EntryRef::Super(_) => {}
        }
        self.set_slot(
            table,
            idx,
            SuperEntry::new(frame, attr | Attr::PRESENT, level).raw(),
        );
        if attr.contains(Attr::NO_COLLECT) {
            self.pin_chain(vpn);
        }
        Ok(())
    }

    /// Removes translations for `count` pages starting at `vpn`.
    ///
    /// Holes in the range are skipped; unmapping nothing is a no-op.
    /// Superpages fully inside the range are dropped whole, ones straddling
    /// an edge are split first. Emptied tables are collected.
    pub fn unmap(&mut self, vpn: VirtPageNo<A>, count: PageCount) -> Result<(), PmapError> {
        let mut cur = vpn;
        let mut remaining = count.get();
        while remaining > 0 {
            self.check_reserved(cur)?;
            let stepped = self.unmap_step(cur, remaining)?;
            remaining -= stepped;
            if remaining == 0 {
                break;
            }
            cur = cur
                .checked_add(PageCount::new(stepped))
                .ok_or(PmapError::Addr(vm_addr::AddrError::OutOfRange))?;
        }
        Ok(())
    }

    /// Translates a byte address.
    pub fn virt_to_phys(&self, va: VirtAddr<A>) -> Result<PhysAddr<A>, PmapError> {
        let raw = va.as_u64();
        let (table, idx, level) = self.terminal_slot(raw).ok_or(PmapError::NotMapped)?;
        let base = match EntryRef::<A>::decode(self.slot(table, idx), level) {
            EntryRef::Leaf(leaf) => leaf.frame().base().as_u64() + va.page_offset(),
            EntryRef::Super(sup) => {
                let span_bytes = level.span_pages() << PAGE_SHIFT;
                sup.frame().base().as_u64() + (raw & (span_bytes - 1))
            }
            EntryRef::None | EntryRef::Table(_) => return Err(PmapError::NotMapped),
        };
        Ok(PhysAddr::new_unchecked(base))
    }

    /// Reports the terminal record covering `va`: backing frame, terminating
    /// level and attributes. This is how callers observe superpages.
    pub fn virt_to_page(&self, va: VirtAddr<A>) -> Result<PageInfo<A>, PmapError> {
        let raw = va.as_u64();
        let (table, idx, level) = self.terminal_slot(raw).ok_or(PmapError::NotMapped)?;
        match EntryRef::<A>::decode(self.slot(table, idx), level) {
            EntryRef::Leaf(leaf) => Ok(PageInfo {
                page: leaf.frame(),
                level,
                attr: leaf.attr(),
            }),
            EntryRef::Super(sup) => {
                let within = (raw >> PAGE_SHIFT) & (level.span_pages() - 1);
                Ok(PageInfo {
                    page: PageNo::new_unchecked(sup.frame().as_u64() + within),
                    level,
                    attr: sup.attr(),
                })
            }
            EntryRef::None | EntryRef::Table(_) => Err(PmapError::NotMapped),
        }
    }

    /// Narrows the permissions of the terminal record covering `vpn` towards
    /// `attr`, never widening access. Returns the record's accessed/dirty
    /// state from before the change, or `None` when nothing is mapped there.
    ///
    /// With `flush_ad` set the accessed and dirty bits are cleared in the
    /// same write.
    pub fn reduce_permission(
        &mut self,
        vpn: VirtPageNo<A>,
        attr: Attr,
        flush_ad: bool,
    ) -> Result<Option<AccessDirty>, PmapError> {
        self.check_reserved(vpn)?;
        let raw = vpn.base().as_u64();
        let Some((table, idx, level)) = self.terminal_slot(raw) else {
            return Ok(None);
        };
        let old = match EntryRef::<A>::decode(self.slot(table, idx), level) {
            EntryRef::Leaf(leaf) => leaf.attr(),
            EntryRef::Super(sup) => sup.attr(),
            EntryRef::None | EntryRef::Table(_) => return Ok(None),
        };
        let ad = AccessDirty {
            accessed: old.contains(Attr::ACCESSED),
            dirty: old.contains(Attr::DIRTY),
        };
        let mut new = old.reduce(attr);
        if flush_ad {
            new -= Attr::ACCESSED | Attr::DIRTY;
        }
        self.rewrite_terminal(table, idx, level, new);
        Ok(Some(ad))
    }

    /// Unmaps everything and frees every owned intermediate table.
    ///
    /// The root table survives, emptied; kernel spaces get the self-map
    /// reinstalled. The space is immediately usable again.
    pub fn clear(&mut self) {
        let top = A::TOP;
        for idx in 0..A::entries_at(top) {
            if let EntryRef::<A>::Table(ptr) = EntryRef::decode(self.slot(self.root, idx), top) {
                // The self-map slot points back at the root itself.
                if ptr.table() != self.root {
                    self.free_subtree(ptr.table(), self.child_level(top));
                }
            }
            self.set_slot(self.root, idx, 0);
        }
        self.meta_mut(self.root.as_u64()).live = 0;
        if self.ctx.kernel && A::SELF_MAP {
            self.install_self_map();
        }
        log::debug!("cleared space, root frame {:#x}", self.root.as_u64());
    }

    /// Starts a bulk-mapping pass laying pages down from `start`.
    pub fn batch(&mut self, start: VirtPageNo<A>) -> crate::batch::MapBatch<'_, A> {
        crate::batch::MapBatch::new(self, start)
    }

    /* ─── walk internals ─── */

    fn slot(&self, table: PageNo<A>, idx: usize) -> u64 {
        // Safety: every table frame reached here is owned by this pmap and
        // the borrow ends within the statement.
        unsafe { self.ctx.access.table_mut(table) }.get(idx)
    }

    fn set_slot(&self, table: PageNo<A>, idx: usize, raw: u64) {
        // Safety: as in `slot`.
        unsafe { self.ctx.access.table_mut(table) }.set(idx, raw);
    }

    fn meta_mut(&mut self, table: u64) -> &mut TableMeta {
        match self.tables.get_mut(&table) {
            Some(meta) => meta,
            None => panic!("table {table:#x} has no bookkeeping entry"),
        }
    }

    fn child_level(&self, level: Level) -> Level {
        match level.down() {
            Some(child) => child,
            None => panic!("descended below the bottom level"),
        }
    }

    /// Rejects addresses translated through the reserved self-map slot.
    pub(crate) fn check_reserved(&self, vpn: VirtPageNo<A>) -> Result<(), PmapError> {
        if self.ctx.kernel
            && A::SELF_MAP
            && table_index::<A>(vpn.base().as_u64(), A::TOP) == RECURSIVE_IDX
        {
            return Err(PmapError::Reserved);
        }
        Ok(())
    }

    fn install_self_map(&mut self) {
        let entry = PointerEntry::new(
            self.root,
            Attr::PRESENT | Attr::WRITABLE | Attr::NO_EXECUTE | Attr::NO_COLLECT,
        );
        self.set_slot(self.root, RECURSIVE_IDX, entry.raw());
        self.meta_mut(self.root.as_u64()).live += 1;
    }

    /// Walks down to the table whose records sit at `target`, allocating
    /// pointer tables and splitting superpages on the way.
    pub(crate) fn ensure_chain(
        &mut self,
        vpn: VirtPageNo<A>,
        target: Level,
    ) -> Result<PageNo<A>, PmapError> {
        let raw = vpn.base().as_u64();
        let mut level = A::TOP;
        let mut table = self.root;
        while level > target {
            let idx = table_index::<A>(raw, level);
            table = match EntryRef::<A>::decode(self.slot(table, idx), level) {
                EntryRef::None => self.alloc_table(table, idx, level)?,
                EntryRef::Table(ptr) => ptr.table(),
                EntryRef::Super(sup) => self.split_super(table, idx, level, sup)?,
                EntryRef::Leaf(_) => panic!("bottom-level record above the bottom level"),
            };
            level = self.child_level(level);
        }
        Ok(table)
    }

    /// Installs a bottom-level record, bumping the live count when the slot
    /// was empty.
    pub(crate) fn write_leaf(&mut self, table: PageNo<A>, idx: usize, leaf: LeafEntry<A>) {
        let old = self.slot(table, idx);
        self.set_slot(table, idx, leaf.raw());
        if EntryRef::<A>::decode(old, Level::L1) == EntryRef::None {
            self.meta_mut(table.as_u64()).live += 1;
        }
    }

    /// Allocates and links an empty table under `parent[idx]`.
    fn alloc_table(
        &mut self,
        parent: PageNo<A>,
        idx: usize,
        level: Level,
    ) -> Result<PageNo<A>, PmapError> {
        let frame = self.ctx.alloc.allocate().ok_or(PmapError::OutOfMemory)?;
        // Safety: freshly allocated, not yet linked anywhere.
        unsafe { self.ctx.access.table_mut(frame) }.zero();

        self.set_slot(parent, idx, PointerEntry::new(frame, Attr::INTERMEDIATE).raw());
        self.meta_mut(parent.as_u64()).live += 1;
        self.tables.insert(
            frame.as_u64(),
            TableMeta {
                level: self.child_level(level),
                live: 0,
                critical: false,
                parent: Some((parent.as_u64(), idx)),
            },
        );
        log::trace!("new L{} table at frame {:#x}", self.child_level(level).depth(), frame.as_u64());
        Ok(frame)
    }

    /// Replaces a superpage record with a full child table mapping the same
    /// range, record by record. The parent slot stays present throughout, so
    /// its live count does not move.
    fn split_super(
        &mut self,
        parent: PageNo<A>,
        idx: usize,
        level: Level,
        sup: SuperEntry<A>,
    ) -> Result<PageNo<A>, PmapError> {
        let child_level = self.child_level(level);
        let frame = self.ctx.alloc.allocate().ok_or(PmapError::OutOfMemory)?;

        let base = sup.frame().as_u64();
        let attr = sup.attr();
        let span = child_level.span_pages();
        // Safety: freshly allocated; fully initialized below.
        let child = unsafe { self.ctx.access.table_mut(frame) };
        for i in 0..NR_ENTRIES {
            let piece = PageNo::<A>::new_unchecked(base + i as u64 * span);
            let raw = if child_level == Level::L1 {
                LeafEntry::new(piece, attr).raw()
            } else {
                SuperEntry::new(piece, attr, child_level).raw()
            };
            child.set(i, raw);
        }

        self.set_slot(parent, idx, PointerEntry::new(frame, Attr::INTERMEDIATE).raw());
        self.tables.insert(
            frame.as_u64(),
            TableMeta {
                level: child_level,
                live: NR_ENTRIES as u16,
                critical: false,
                parent: Some((parent.as_u64(), idx)),
            },
        );
        log::trace!(
            "split L{} superpage at frame {base:#x} into table {:#x}",
            level.depth(),
            frame.as_u64()
        );
        Ok(frame)
    }

    /// Unmaps from `vpn` and returns how many pages of the range were
    /// consumed, which is at least one.
    fn unmap_step(&mut self, vpn: VirtPageNo<A>, remaining: u64) -> Result<u64, PmapError> {
        let raw = vpn.base().as_u64();
        let mut level = A::TOP;
        let mut table = self.root;
        loop {
            let idx = table_index::<A>(raw, level);
            let span = level.span_pages();
            let within = (raw >> PAGE_SHIFT) & (span - 1);
            match EntryRef::<A>::decode(self.slot(table, idx), level) {
                EntryRef::None => {
                    // Hole: skip to the record boundary. The containing table
                    // may be an empty remnant of an aborted map; collect it.
                    self.collect(table.as_u64());
                    return Ok((span - within).min(remaining));
                }
                EntryRef::Table(ptr) => {
                    table = ptr.table();
                    level = self.child_level(level);
                }
                EntryRef::Super(sup) => {
                    if within == 0 && remaining >= span {
                        self.clear_slot(table, idx);
                        return Ok(span);
                    }
                    // Partially covered superpage: split and keep walking.
                    table = self.split_super(table, idx, level, sup)?;
                    level = self.child_level(level);
                }
                EntryRef::Leaf(_) => {
                    self.clear_slot(table, idx);
                    return Ok(1);
                }
            }
        }
    }

    /// Clears a present slot and collects the table chain upward.
    fn clear_slot(&mut self, table: PageNo<A>, idx: usize) {
        self.set_slot(table, idx, 0);
        let meta = self.meta_mut(table.as_u64());
        assert!(meta.live > 0, "live-slot count underflow");
        meta.live -= 1;
        self.collect(table.as_u64());
    }

    /// Frees empty, collectible tables from `table` up towards the root.
    fn collect(&mut self, mut table: u64) {
        loop {
            let meta = self.meta_mut(table);
            if meta.live != 0 || meta.critical {
                return;
            }
            let Some((parent, idx)) = meta.parent else {
                return;
            };
            self.tables.remove(&table);
            self.ctx.alloc.free(PageNo::new_unchecked(table));
            self.set_slot(PageNo::new_unchecked(parent), idx, 0);
            let pm = self.meta_mut(parent);
            assert!(pm.live > 0, "live-slot count underflow");
            pm.live -= 1;
            log::trace!("collected empty table at frame {table:#x}");
            table = parent;
        }
    }

    /// Frees `table` and every table below it without touching the parent
    /// slot, which the caller is about to overwrite.
    fn free_subtree(&mut self, table: PageNo<A>, level: Level) {
        if level > Level::L1 {
            for idx in 0..A::entries_at(level) {
                if let EntryRef::<A>::Table(ptr) = EntryRef::decode(self.slot(table, idx), level) {
                    self.free_subtree(ptr.table(), self.child_level(level));
                }
            }
        }
        self.tables.remove(&table.as_u64());
        self.ctx.alloc.free(table);
    }

    /// Marks every pointer record and table on the walk to `vpn` as
    /// non-collectible.
    pub(crate) fn pin_chain(&mut self, vpn: VirtPageNo<A>) {
        let raw = vpn.base().as_u64();
        let mut level = A::TOP;
        let mut table = self.root;
        loop {
            let idx = table_index::<A>(raw, level);
            match EntryRef::<A>::decode(self.slot(table, idx), level) {
                EntryRef::Table(ptr) => {
                    self.set_slot(table, idx, ptr.with_no_collect().raw());
                    let child = ptr.table();
                    self.meta_mut(child.as_u64()).critical = true;
                    table = child;
                    level = self.child_level(level);
                }
                _ => return,
            }
        }
    }

    /// Finds the table, slot and level of the terminal record covering the
    /// raw address, if any.
    fn terminal_slot(&self, raw: u64) -> Option<(PageNo<A>, usize, Level)> {
        let mut level = A::TOP;
        let mut table = self.root;
        loop {
            let idx = table_index::<A>(raw, level);
            match EntryRef::<A>::decode(self.slot(table, idx), level) {
                EntryRef::None => return None,
                EntryRef::Table(ptr) => {
                    table = ptr.table();
                    level = level.down()?;
                }
                EntryRef::Leaf(_) | EntryRef::Super(_) => return Some((table, idx, level)),
            }
        }
    }

    fn rewrite_terminal(&mut self, table: PageNo<A>, idx: usize, level: Level, attr: Attr) {
        match EntryRef::<A>::decode(self.slot(table, idx), level) {
            EntryRef::Leaf(leaf) => {
                self.set_slot(table, idx, LeafEntry::new(leaf.frame(), attr).raw());
            }
            EntryRef::Super(sup) => {
                self.set_slot(table, idx, SuperEntry::new(sup.frame(), attr, level).raw());
            }
            EntryRef::None | EntryRef::Table(_) => {}
        }
    }
}

impl Pmap<X64> {
    /// Harvests and clears the accessed/dirty bits of the terminal record
    /// covering `vpn`. Returns `Ok(None)` when nothing is mapped there; the
    /// self-map slice of a kernel space is refused.
    ///
    /// Only the 4-level format tracks dirty state this way; the 3-level
    /// kernel reads the bits through `reduce_permission` instead.
    pub fn flush_accessed_dirty(
        &mut self,
        vpn: VirtPageNo<X64>,
    ) -> Result<Option<AccessDirty>, PmapError> {
        self.check_reserved(vpn)?;
        let raw = vpn.base().as_u64();
        let Some((table, idx, level)) = self.terminal_slot(raw) else {
            return Ok(None);
        };
        let attr = match EntryRef::<X64>::decode(self.slot(table, idx), level) {
            EntryRef::Leaf(leaf) => leaf.attr(),
            EntryRef::Super(sup) => sup.attr(),
            EntryRef::None | EntryRef::Table(_) => return Ok(None),
        };
        let ad = AccessDirty {
            accessed: attr.contains(Attr::ACCESSED),
            dirty: attr.contains(Attr::DIRTY),
        };
        self.rewrite_terminal(table, idx, level, attr - (Attr::ACCESSED | Attr::DIRTY));
        Ok(Some(ad))
    }
}

impl<A: PagingArch> Drop for Pmap<A> {
    fn drop(&mut self) {
        self.clear();
        self.tables.remove(&self.root.as_u64());
        self.ctx.alloc.free(self.root);
    }
}
