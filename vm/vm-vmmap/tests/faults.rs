//! Fault-path behavior across the shard and translation layers, including
//! what happens while a backing object is still working on a fault.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::task::{Context, Poll};

use async_trait::async_trait;
use bitvec::vec::BitVec;
use futures::FutureExt;
use futures::task::noop_waker;
use vm_vmmap::{
    AnonObject, Attr, FaultError, FaultToken, ForkMode, FrameAlloc, PageCount,
    PageNo, PhysAccess, PmapError, SpaceContext, Table, VirtAddr, VirtPageNo,
    VmObject, Vmmap, X64,
};

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
    let slab = Slab::new(1024);
    Vmmap::new(SpaceContext::user(slab.clone(), slab)).unwrap()
}

fn va(raw: u64) -> VirtAddr<X64> {
    VirtAddr::new(raw).unwrap()
}

fn vpn(raw: u64) -> VirtPageNo<X64> {
    va(raw).vpage()
}

/// Backing object whose faults stall until the test opens the gate.
struct GatedObject {
    open: AtomicBool,
    delivered: AtomicUsize,
}

impl GatedObject {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            open: AtomicBool::new(false),
            delivered: AtomicUsize::new(0),
        })
    }

    fn open(&self) {
        self.open.store(true, Ordering::Release);
    }

    fn wait(&self) -> GateWait<'_> {
        GateWait { gate: self }
    }
}

struct GateWait<'a> {
    gate: &'a GatedObject,
}

impl Future for GateWait<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.gate.open.load(Ordering::Acquire) {
            Poll::Ready(())
        } else {
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}

#[async_trait]
impl VmObject<X64> for GatedObject {
    async fn fault_read(
        &self,
        _token: FaultToken,
        alloc: &Arc<dyn FrameAlloc<X64>>,
        _readahead: PageCount,
    ) -> Result<PageNo<X64>, FaultError> {
        self.wait().await;
        self.delivered.fetch_add(1, Ordering::Relaxed);
        alloc.allocate().ok_or(FaultError::OutOfMemory)
    }

    async fn fault_write(
        &self,
        token: FaultToken,
        alloc: &Arc<dyn FrameAlloc<X64>>,
    ) -> Result<PageNo<X64>, FaultError> {
        self.fault_read(token, alloc, PageCount::ONE).await
    }

    fn fork(self: Arc<Self>, _mode: ForkMode) -> Arc<dyn VmObject<X64>> {
        self
    }

    fn split(
        self: Arc<Self>,
        _at: PageCount,
    ) -> (Arc<dyn VmObject<X64>>, Arc<dyn VmObject<X64>>) {
        (self.clone(), self)
    }

    fn mincore(&self, _offset: PageCount, count: PageCount) -> BitVec {
        BitVec::repeat(false, count.get() as usize)
    }
}

#[test]
fn read_fault_populates_the_translation() {
    let vm = space();
    vm.manage(vpn(0x1000_0000), PageCount::new(32));
    vm.map(
        vpn(0x1000_0000),
        PageCount::new(8),
        Attr::USER_RW,
        ForkMode::Share,
        AnonObject::new(),
        PageCount::new(0),
    );

    let target = va(0x1000_3000);
    assert_eq!(vm.virt_to_phys(target), Err(PmapError::NotMapped));
    vm.fault_read(target).now_or_never().unwrap().unwrap();

    let info = vm.virt_to_page(target).unwrap();
    assert!(info.attr.contains(Attr::PRESENT | Attr::USER));

    // The other pages of the range stay lazy.
    assert_eq!(vm.virt_to_phys(va(0x1000_4000)), Err(PmapError::NotMapped));
}

#[test]
fn fault_outside_any_mapping_is_refused() {
    let vm = space();
    vm.manage(vpn(0x1000_0000), PageCount::new(32));

    // Managed but unmapped space.
    assert_eq!(
        vm.fault_read(va(0x1000_0000)).now_or_never().unwrap(),
        Err(FaultError::NoMapping)
    );
    // Entirely unmanaged space.
    assert_eq!(
        vm.fault_read(va(0x7000_0000)).now_or_never().unwrap(),
        Err(FaultError::NoMapping)
    );
}

#[test]
fn write_fault_to_readonly_mapping_is_forbidden() {
    let vm = space();
    vm.manage(vpn(0x1000_0000), PageCount::new(8));
    vm.map(
        vpn(0x1000_0000),
        PageCount::new(8),
        Attr::USER_R,
        ForkMode::Share,
        AnonObject::new(),
        PageCount::new(0),
    );

    assert_eq!(
        vm.fault_write(va(0x1000_0000)).now_or_never().unwrap(),
        Err(FaultError::Forbidden)
    );
    vm.fault_read(va(0x1000_0000)).now_or_never().unwrap().unwrap();
    let info = vm.virt_to_page(va(0x1000_0000)).unwrap();
    assert!(!info.attr.contains(Attr::WRITABLE));
}

#[test]
fn faults_on_other_shards_proceed_while_one_is_stalled() {
    let vm = space();
    vm.reshard(2);
    vm.manage(vpn(0x1000_0000), PageCount::new(8));
    vm.manage(vpn(0x2000_0000), PageCount::new(8));

    let gated = GatedObject::new();
    vm.map(
        vpn(0x1000_0000),
        PageCount::new(8),
        Attr::USER_RW,
        ForkMode::Share,
        gated.clone(),
        PageCount::new(0),
    );
    vm.map(
        vpn(0x2000_0000),
        PageCount::new(8),
        Attr::USER_RW,
        ForkMode::Share,
        AnonObject::new(),
        PageCount::new(0),
    );

    let waker = noop_waker();
    let mut cx = Context::from_waker(&waker);

    let mut stalled = Box::pin(vm.fault_read(va(0x1000_0000)));
    assert!(stalled.as_mut().poll(&mut cx).is_pending());

    // The stalled fault holds no locks, so the other shard resolves.
    vm.fault_read(va(0x2000_0000)).now_or_never().unwrap().unwrap();
    assert!(vm.virt_to_phys(va(0x2000_0000)).is_ok());

    gated.open();
    match stalled.as_mut().poll(&mut cx) {
        Poll::Ready(result) => result.unwrap(),
        Poll::Pending => panic!("opened gate did not complete the fault"),
    }
    assert!(vm.virt_to_phys(va(0x1000_0000)).is_ok());
}

#[test]
fn unmap_during_fault_resolution_is_detected() {
    let vm = space();
    vm.manage(vpn(0x1000_0000), PageCount::new(8));
    let gated = GatedObject::new();
    vm.map(
        vpn(0x1000_0000),
        PageCount::new(8),
        Attr::USER_RW,
        ForkMode::Share,
        gated.clone(),
        PageCount::new(0),
    );

    let waker = noop_waker();
    let mut cx = Context::from_waker(&waker);
    let mut fault = Box::pin(vm.fault_read(va(0x1000_0000)));
    assert!(fault.as_mut().poll(&mut cx).is_pending());

    vm.unmap(vpn(0x1000_0000), PageCount::new(8)).unwrap();

    gated.open();
    match fault.as_mut().poll(&mut cx) {
        Poll::Ready(result) => assert_eq!(result, Err(FaultError::NoMapping)),
        Poll::Pending => panic!("opened gate did not complete the fault"),
    }
    // The stale frame was never installed.
    assert_eq!(vm.virt_to_phys(va(0x1000_0000)), Err(PmapError::NotMapped));
}

#[test]
fn fork_narrows_parent_translations_for_copy_on_write() {
    let vm = space();
    vm.manage(vpn(0x1000_0000), PageCount::new(16));
    vm.map(
        vpn(0x1000_0000),
        PageCount::new(4),
        Attr::USER_RW,
        ForkMode::Copy,
        AnonObject::new(),
        PageCount::new(0),
    );

    // Write before the fork so the parent holds a writable translation.
    vm.fault_write(va(0x1000_0000)).now_or_never().unwrap().unwrap();
    assert!(
        vm.virt_to_page(va(0x1000_0000))
            .unwrap()
            .attr
            .contains(Attr::WRITABLE)
    );

    let child = vm.fork().unwrap();

    // The parent's translation is read-only now; the next write re-faults.
    let narrowed = vm.virt_to_page(va(0x1000_0000)).unwrap();
    assert!(!narrowed.attr.contains(Attr::WRITABLE));
    vm.fault_write(va(0x1000_0000)).now_or_never().unwrap().unwrap();
    assert!(
        vm.virt_to_page(va(0x1000_0000))
            .unwrap()
            .attr
            .contains(Attr::WRITABLE)
    );

    // The child starts with empty translations and faults its own pages.
    assert_eq!(child.virt_to_phys(va(0x1000_0000)), Err(PmapError::NotMapped));
    child
        .fault_read(va(0x1000_0000))
        .now_or_never()
        .unwrap()
        .unwrap();
    let in_child = child.virt_to_page(va(0x1000_0000)).unwrap();
    // Copy-on-write keeps the child read-only until it writes.
    assert!(!in_child.attr.contains(Attr::WRITABLE));
    child
        .fault_write(va(0x1000_0000))
        .now_or_never()
        .unwrap()
        .unwrap();
    assert!(
        child
            .virt_to_page(va(0x1000_0000))
            .unwrap()
            .attr
            .contains(Attr::WRITABLE)
    );
}

#[test]
fn shared_fork_keeps_both_spaces_writable() {
    let vm = space();
    vm.manage(vpn(0x1000_0000), PageCount::new(8));
    vm.map(
        vpn(0x1000_0000),
        PageCount::new(8),
        Attr::USER_RW,
        ForkMode::Share,
        AnonObject::new(),
        PageCount::new(0),
    );
    vm.fault_write(va(0x1000_0000)).now_or_never().unwrap().unwrap();

    let child = vm.fork().unwrap();

    // No narrowing happened in the parent.
    assert!(
        vm.virt_to_page(va(0x1000_0000))
            .unwrap()
            .attr
            .contains(Attr::WRITABLE)
    );
    child
        .fault_write(va(0x1000_0000))
        .now_or_never()
        .unwrap()
        .unwrap();
    assert!(
        child
            .virt_to_page(va(0x1000_0000))
            .unwrap()
            .attr
            .contains(Attr::WRITABLE)
    );
}

#[test]
fn partial_unmap_in_one_space_keeps_shared_pages_resident() {
    let vm = space();
    vm.manage(vpn(0x1000_0000), PageCount::new(8));
    vm.map(
        vpn(0x1000_0000),
        PageCount::new(8),
        Attr::USER_RW,
        ForkMode::Share,
        AnonObject::new(),
        PageCount::new(0),
    );
    vm.fault_write(va(0x1000_4000)).now_or_never().unwrap().unwrap();

    let child = vm.fork().unwrap();
    assert!(child.mincore(vpn(0x1000_0000), PageCount::new(8))[4]);

    // The parent gives up its first two pages; the shared object backing
    // the child's full range must keep everything it had.
    vm.unmap(vpn(0x1000_0000), PageCount::new(2)).unwrap();
    assert!(child.mincore(vpn(0x1000_0000), PageCount::new(8))[4]);

    // Both spaces still resolve the surviving pages.
    vm.fault_read(va(0x1000_4000)).now_or_never().unwrap().unwrap();
    child
        .fault_read(va(0x1000_4000))
        .now_or_never()
        .unwrap()
        .unwrap();
}

#[test]
fn unmap_leaves_no_stale_translation_behind_concurrent_faults() {
    let vm = space();
    vm.manage(vpn(0x1000_0000), PageCount::new(16));
    vm.map(
        vpn(0x1000_0000),
        PageCount::new(16),
        Attr::USER_RW,
        ForkMode::Share,
        AnonObject::new(),
        PageCount::new(0),
    );

    std::thread::scope(|s| {
        let hammer = s.spawn(|| {
            for round in 0..400_u64 {
                // Resolves immediately before the unmap, NoMapping after;
                // either way no translation may survive the unmap below.
                let _ = vm
                    .fault_read(va(0x1000_0000 + (round % 16) * 0x1000))
                    .now_or_never();
            }
        });

        vm.unmap(vpn(0x1000_0000), PageCount::new(16)).unwrap();
        for i in 0..16_u64 {
            assert_eq!(
                vm.virt_to_phys(va(0x1000_0000 + i * 0x1000)),
                Err(PmapError::NotMapped),
                "translation outlived the unmap"
            );
        }
        hammer.join().unwrap();
    });
}

#[test]
fn map_anywhere_lands_in_a_resolvable_gap() {
    let vm = space();
    vm.manage(vpn(0x1000_0000), PageCount::new(64));
    let start = vm
        .map_anywhere(
            PageCount::new(16),
            Attr::USER_RW,
            ForkMode::Share,
            AnonObject::new(),
            PageCount::new(0),
        )
        .unwrap();

    let target = start.base();
    vm.fault_read(target).now_or_never().unwrap().unwrap();
    assert!(vm.virt_to_phys(target).is_ok());

    let bits = vm.mincore(start, PageCount::new(16));
    assert!(bits[0]);
    assert!(!bits[15]);
}
