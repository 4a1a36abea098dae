//! Bulk-mapping builder.
//!
//! [`MapBatch`] lays frames down at a moving cursor instead of issuing one
//! [`Pmap::map`] per page. Two things make it worth having:
//!
//! - physically contiguous pushes are merged into runs, and a run that lines
//!   up with a superpage span is installed as one superpage record;
//! - consecutive base-page installs reuse the bottom-level table found for
//!   the previous page instead of walking from the root every time.
//!
//! The builder is single-use: `commit` consumes it and flushes the pending
//! run. Dropping it without committing discards whatever was still pending.

use vm_addr::{PageCount, PageNo, VirtPageNo};

use crate::entry::LeafEntry;
use crate::level::{Level, PagingArch, table_index};
use crate::pmap::Pmap;
use crate::{Attr, NR_ENTRIES_SHIFT, PAGE_SHIFT, PmapError};

/// A pending stretch of physically contiguous, same-attribute pages.
struct Run<A: PagingArch> {
    frame: PageNo<A>,
    attr: Attr,
    count: u64,
}

/// Cached bottom-level table covering the cursor.
struct ChainCache<A: PagingArch> {
    table: PageNo<A>,
    /// Virtual page number shifted down by one level of index bits; all
    /// pages sharing it live in the same bottom-level table.
    tag: u64,
}

/// Streaming bulk-mapping pass over a [`Pmap`].
pub struct MapBatch<'p, A: PagingArch> {
    pmap: &'p mut Pmap<A>,
    /// First page not yet covered by an installed record or the pending run.
    next: VirtPageNo<A>,
    run: Option<Run<A>>,
    cache: Option<ChainCache<A>>,
}

impl<'p, A: PagingArch> MapBatch<'p, A> {
    pub(crate) fn new(pmap: &'p mut Pmap<A>, start: VirtPageNo<A>) -> Self {
        Self {
            pmap,
            next: start,
            run: None,
            cache: None,
        }
    }

    /// Appends `count` pages backed by frames starting at `frame`, to be
    /// placed at the current cursor.
    ///
    /// A push that physically continues the pending run with the same
    /// attributes extends it; anything else flushes the run first. Errors
    /// leave records installed so far in place.
    pub fn push_back(
        &mut self,
        frame: PageNo<A>,
        attr: Attr,
        count: PageCount,
    ) -> Result<(), PmapError> {
        if count.is_zero() {
            return Ok(());
        }
        if let Some(run) = &mut self.run {
            if run.attr == attr && run.frame.as_u64() + run.count == frame.as_u64() {
                run.count += count.get();
                return Ok(());
            }
        }
        self.flush_run()?;
        self.run = Some(Run {
            frame,
            attr,
            count: count.get(),
        });
        Ok(())
    }

    /// Flushes the pending run and finishes the pass.
    pub fn commit(mut self) -> Result<(), PmapError> {
        self.flush_run()
    }

    /// Position the next push will map at.
    #[must_use]
    pub fn cursor(&self) -> VirtPageNo<A> {
        match &self.run {
            Some(run) => self.next + PageCount::new(run.count),
            None => self.next,
        }
    }

    /// Emits the pending run as superpages where span alignment allows and
    /// base pages elsewhere.
    fn flush_run(&mut self) -> Result<(), PmapError> {
        let Some(run) = self.run.take() else {
            return Ok(());
        };
        let span = Level::L2.span_pages();
        let mut vpn = self.next;
        let mut frame = run.frame;
        let mut left = run.count;

        while left > 0 {
            if left >= span && vpn.is_aligned_to(span) && frame.is_aligned_to(span) {
                self.pmap.map_super(vpn, frame, run.attr, Level::L2)?;
                // The superpage may have replaced the cached table.
                self.cache = None;
                self.advance(&mut vpn, &mut frame, span)?;
                left -= span;
            } else {
                self.pmap.check_reserved(vpn)?;
                let table = self.bottom_table(vpn, run.attr)?;
                let idx = table_index::<A>(vpn.base().as_u64(), Level::L1);
                self.pmap
                    .write_leaf(table, idx, LeafEntry::new(frame, run.attr | Attr::PRESENT));
                self.advance(&mut vpn, &mut frame, 1)?;
                left -= 1;
            }
        }
        self.next = vpn;
        Ok(())
    }

    /// Bottom-level table covering `vpn`, reusing the cached one while the
    /// cursor stays inside it.
    fn bottom_table(&mut self, vpn: VirtPageNo<A>, attr: Attr) -> Result<PageNo<A>, PmapError> {
        let tag = (vpn.base().as_u64() >> PAGE_SHIFT) >> NR_ENTRIES_SHIFT;
        if let Some(cache) = &self.cache {
            if cache.tag == tag && !attr.contains(Attr::NO_COLLECT) {
                return Ok(cache.table);
            }
        }
        let table = self.pmap.ensure_chain(vpn, Level::L1)?;
        if attr.contains(Attr::NO_COLLECT) {
            self.pmap.pin_chain(vpn);
        }
        self.cache = Some(ChainCache { table, tag });
        Ok(table)
    }

    fn advance(
        &self,
        vpn: &mut VirtPageNo<A>,
        frame: &mut PageNo<A>,
        pages: u64,
    ) -> Result<(), PmapError> {
        let step = PageCount::new(pages);
        *vpn = vpn
            .checked_add(step)
            .ok_or(PmapError::Addr(vm_addr::AddrError::OutOfRange))?;
        *frame = frame
            .checked_add(step)
            .ok_or(PmapError::Addr(vm_addr::AddrError::OutOfRange))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use vm_addr::{VirtAddr, X64};

    use super::*;
    use crate::SpaceContext;
    use crate::test_support::TestSpace;

    fn user_pmap() -> (Arc<TestSpace>, Pmap<X64>) {
        let space = TestSpace::with_frames(4096);
        let ctx = SpaceContext::user(space.clone(), space.clone());
        let pmap = Pmap::new(ctx).unwrap();
        (space, pmap)
    }

    fn vpn(va: u64) -> VirtPageNo<X64> {
        VirtAddr::new(va).unwrap().vpage()
    }

    #[test]
    fn aligned_run_becomes_one_superpage() {
        let (space, mut pmap) = user_pmap();
        let mut batch = pmap.batch(vpn(0x4000_0000));
        batch
            .push_back(PageNo::new_unchecked(0x1_0000), Attr::USER_RW, PageCount::new(512))
            .unwrap();
        batch.commit().unwrap();

        let info = pmap.virt_to_page(VirtAddr::new(0x4000_0000).unwrap()).unwrap();
        assert_eq!(info.level, Level::L2);
        // Root plus two pointer tables; no bottom-level table was built.
        assert_eq!(space.alloc_count(), 3);
    }

    #[test]
    fn contiguous_pushes_merge_before_promotion() {
        let (_space, mut pmap) = user_pmap();
        let mut batch = pmap.batch(vpn(0x4000_0000));
        for i in 0..4 {
            batch
                .push_back(
                    PageNo::new_unchecked(0x1_0000 + i * 128),
                    Attr::USER_RW,
                    PageCount::new(128),
                )
                .unwrap();
        }
        batch.commit().unwrap();

        let info = pmap.virt_to_page(VirtAddr::new(0x4002_0000).unwrap()).unwrap();
        assert_eq!(info.level, Level::L2);
        assert_eq!(info.page.as_u64(), 0x1_0020);
    }

    #[test]
    fn misaligned_run_falls_back_to_base_pages() {
        let (_space, mut pmap) = user_pmap();
        let mut batch = pmap.batch(vpn(0x4000_1000));
        batch
            .push_back(PageNo::new_unchecked(0x1_0001), Attr::USER_R, PageCount::new(64))
            .unwrap();
        batch.commit().unwrap();

        let head = pmap.virt_to_page(VirtAddr::new(0x4000_1000).unwrap()).unwrap();
        assert_eq!(head.level, Level::L1);
        assert_eq!(head.page.as_u64(), 0x1_0001);
        let tail = pmap.virt_to_page(VirtAddr::new(0x4004_0000).unwrap()).unwrap();
        assert_eq!(tail.page.as_u64(), 0x1_0040);
    }

    #[test]
    fn attribute_change_breaks_the_run() {
        let (_space, mut pmap) = user_pmap();
        let mut batch = pmap.batch(vpn(0x5000_0000));
        batch
            .push_back(PageNo::new_unchecked(0x2000), Attr::USER_RW, PageCount::ONE)
            .unwrap();
        batch
            .push_back(PageNo::new_unchecked(0x2001), Attr::USER_R, PageCount::ONE)
            .unwrap();
        batch.commit().unwrap();

        let first = pmap.virt_to_page(VirtAddr::new(0x5000_0000).unwrap()).unwrap();
        assert!(first.attr.contains(Attr::WRITABLE));
        let second = pmap.virt_to_page(VirtAddr::new(0x5000_1000).unwrap()).unwrap();
        assert!(!second.attr.contains(Attr::WRITABLE));
        assert_eq!(second.page.as_u64(), 0x2001);
    }

    #[test]
    fn discontiguous_frames_land_at_consecutive_pages() {
        let (_space, mut pmap) = user_pmap();
        let mut batch = pmap.batch(vpn(0x6000_0000));
        batch
            .push_back(PageNo::new_unchecked(0x700), Attr::USER_R, PageCount::ONE)
            .unwrap();
        batch
            .push_back(PageNo::new_unchecked(0x95), Attr::USER_R, PageCount::ONE)
            .unwrap();
        assert_eq!(batch.cursor(), vpn(0x6000_0000) + PageCount::new(2));
        batch.commit().unwrap();

        assert_eq!(
            pmap.virt_to_page(VirtAddr::new(0x6000_1000).unwrap()).unwrap().page.as_u64(),
            0x95
        );
    }
}
