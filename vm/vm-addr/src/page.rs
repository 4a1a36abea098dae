//! Page-granular value types: frame numbers, virtual page numbers, counts.

use crate::addr::{PhysAddr, VirtAddr};
use crate::{AddrError, MemArch, PAGE_SHIFT};
use core::fmt;
use core::marker::PhantomData;
use core::ops::{Add, AddAssign, Mul, Sub, SubAssign};

/// Physical page frame number, tagged by architecture `A`.
///
/// ### Invariants
/// - The value fits in `A::FRAME_BITS` bits.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PageNo<A: MemArch>(u64, PhantomData<A>);

impl<A: MemArch> PageNo<A> {
    /// Construct from a raw frame number.
    ///
    /// # Errors
    /// [`AddrError::OutOfRange`] if `frame` exceeds the architecture's
    /// frame-number width.
    #[inline]
    pub const fn new(frame: u64) -> Result<Self, AddrError> {
        if frame >> A::FRAME_BITS != 0 {
            return Err(AddrError::OutOfRange);
        }
        Ok(Self(frame, PhantomData))
    }

    /// Construct from a frame number already known to be in range.
    #[inline]
    #[must_use]
    pub const fn new_unchecked(frame: u64) -> Self {
        debug_assert!(frame >> A::FRAME_BITS == 0);
        Self(frame, PhantomData)
    }

    /// Construct from a physical address that must be page-aligned.
    ///
    /// # Errors
    /// [`AddrError::InvalidArgument`] when `addr` is misaligned.
    #[inline]
    pub const fn from_addr(addr: PhysAddr<A>) -> Result<Self, AddrError> {
        if !addr.is_page_aligned() {
            return Err(AddrError::InvalidArgument);
        }
        Ok(addr.frame())
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// The base address of this frame.
    #[inline]
    #[must_use]
    pub const fn base(self) -> PhysAddr<A> {
        PhysAddr::new_unchecked(self.0 << PAGE_SHIFT)
    }

    /// Whether this frame is aligned to a run of `pages` base pages.
    #[inline]
    #[must_use]
    pub const fn is_aligned_to(self, pages: u64) -> bool {
        debug_assert!(pages.is_power_of_two());
        self.0 & (pages - 1) == 0
    }

    #[inline]
    #[must_use]
    pub fn checked_add(self, count: PageCount) -> Option<Self> {
        let frame = self.0.checked_add(count.get())?;
        Self::new(frame).ok()
    }
}

impl<A: MemArch> fmt::Debug for PageNo<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PageNo<{}>({:#x})", A::as_str(), self.0)
    }
}

impl<A: MemArch> fmt::Display for PageNo<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Virtual page number, tagged by architecture `A`.
///
/// The raw value is the full virtual address shifted right by
/// [`PAGE_SHIFT`], so on 64-bit the sign-extended upper bits are retained
/// and the canonical-form rule carries over.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtPageNo<A: MemArch>(u64, PhantomData<A>);

impl<A: MemArch> VirtPageNo<A> {
    /// Construct from a raw virtual page number.
    ///
    /// # Errors
    /// [`AddrError::OutOfRange`] when the corresponding page base address
    /// is not representable (non-canonical, or too wide for PAE).
    #[inline]
    pub fn new(vpn: u64) -> Result<Self, AddrError> {
        if vpn >> (64 - PAGE_SHIFT) != 0 || !A::is_canonical(vpn << PAGE_SHIFT) {
            return Err(AddrError::OutOfRange);
        }
        Ok(Self(vpn, PhantomData))
    }

    /// Construct from a value already known to be representable.
    #[inline]
    #[must_use]
    pub const fn new_unchecked(vpn: u64) -> Self {
        Self(vpn, PhantomData)
    }

    /// Construct from a virtual address that must be page-aligned.
    ///
    /// # Errors
    /// [`AddrError::InvalidArgument`] when `addr` is misaligned.
    #[inline]
    pub fn from_addr(addr: VirtAddr<A>) -> Result<Self, AddrError> {
        if !addr.is_page_aligned() {
            return Err(AddrError::InvalidArgument);
        }
        Ok(addr.vpage())
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// The base address of this virtual page.
    #[inline]
    #[must_use]
    pub fn base(self) -> VirtAddr<A> {
        VirtAddr::new_unchecked(self.0 << PAGE_SHIFT)
    }

    /// Whether this page is aligned to a run of `pages` base pages.
    #[inline]
    #[must_use]
    pub const fn is_aligned_to(self, pages: u64) -> bool {
        debug_assert!(pages.is_power_of_two());
        self.0 & (pages - 1) == 0
    }

    /// Checked advance, staying canonical.
    #[inline]
    #[must_use]
    pub fn checked_add(self, count: PageCount) -> Option<Self> {
        let vpn = self.0.checked_add(count.get())?;
        Self::new(vpn).ok()
    }
}

impl<A: MemArch> fmt::Debug for VirtPageNo<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtPageNo<{}>({:#x})", A::as_str(), self.0)
    }
}

impl<A: MemArch> fmt::Display for VirtPageNo<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A page-granular quantity.
///
/// Untagged: counts are meaningful across architectures and combine with
/// both [`PageNo`] and [`VirtPageNo`].
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PageCount(u64);

impl PageCount {
    pub const ZERO: Self = Self(0);
    pub const ONE: Self = Self(1);

    #[inline]
    #[must_use]
    pub const fn new(pages: u64) -> Self {
        Self(pages)
    }

    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Size in bytes of this many base pages.
    #[inline]
    #[must_use]
    pub const fn bytes(self) -> u64 {
        self.0 << PAGE_SHIFT
    }

    /// Number of base pages covering `bytes` (rounds up).
    #[inline]
    #[must_use]
    pub const fn from_bytes(bytes: u64) -> Self {
        Self(bytes.div_ceil(1 << PAGE_SHIFT))
    }
}

impl fmt::Debug for PageCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PageCount({})", self.0)
    }
}

impl fmt::Display for PageCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Add for PageCount {
    type Output = Self;
    #[inline]
    fn add(self, rhs: Self) -> Self {
        Self(self.0 + rhs.0)
    }
}

impl AddAssign for PageCount {
    #[inline]
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl Sub for PageCount {
    type Output = Self;
    #[inline]
    fn sub(self, rhs: Self) -> Self {
        Self(self.0 - rhs.0)
    }
}

impl SubAssign for PageCount {
    #[inline]
    fn sub_assign(&mut self, rhs: Self) {
        self.0 -= rhs.0;
    }
}

impl Mul<u64> for PageCount {
    type Output = Self;
    #[inline]
    fn mul(self, rhs: u64) -> Self {
        Self(self.0 * rhs)
    }
}

impl<A: MemArch> Add<PageCount> for PageNo<A> {
    type Output = Self;
    #[inline]
    fn add(self, rhs: PageCount) -> Self {
        Self::new_unchecked(self.0 + rhs.get())
    }
}

impl<A: MemArch> Sub<PageCount> for PageNo<A> {
    type Output = Self;
    #[inline]
    fn sub(self, rhs: PageCount) -> Self {
        Self::new_unchecked(self.0 - rhs.get())
    }
}

impl<A: MemArch> Sub<PageNo<A>> for PageNo<A> {
    type Output = PageCount;
    #[inline]
    fn sub(self, rhs: Self) -> PageCount {
        PageCount::new(self.0 - rhs.0)
    }
}

impl<A: MemArch> Add<PageCount> for VirtPageNo<A> {
    type Output = Self;
    #[inline]
    fn add(self, rhs: PageCount) -> Self {
        Self::new_unchecked(self.0 + rhs.get())
    }
}

impl<A: MemArch> AddAssign<PageCount> for VirtPageNo<A> {
    #[inline]
    fn add_assign(&mut self, rhs: PageCount) {
        *self = *self + rhs;
    }
}

impl<A: MemArch> Sub<PageCount> for VirtPageNo<A> {
    type Output = Self;
    #[inline]
    fn sub(self, rhs: PageCount) -> Self {
        Self::new_unchecked(self.0 - rhs.get())
    }
}

impl<A: MemArch> Sub<VirtPageNo<A>> for VirtPageNo<A> {
    type Output = PageCount;
    #[inline]
    fn sub(self, rhs: Self) -> PageCount {
        PageCount::new(self.0 - rhs.0)
    }
}
