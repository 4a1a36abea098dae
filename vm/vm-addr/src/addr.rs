//! Raw byte-address wrappers.

use crate::page::{PageCount, PageNo, VirtPageNo};
use crate::{AddrError, MemArch, PAGE_SHIFT, PAGE_SIZE};
use core::cmp::Ordering;
use core::fmt;
use core::marker::PhantomData;
use core::ops::{Add, AddAssign, Sub};

/// Physical memory address, tagged by architecture `A`.
///
/// ### Invariants
/// - The value fits in `A::FRAME_BITS + PAGE_SHIFT` bits; [`PhysAddr::new`]
///   rejects anything wider.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysAddr<A: MemArch>(u64, PhantomData<A>);

impl<A: MemArch> PhysAddr<A> {
    /// Construct from a raw value, rejecting values beyond the physical
    /// address width.
    ///
    /// # Errors
    /// [`AddrError::OutOfRange`] if `raw` does not fit the architecture's
    /// physical address width.
    #[inline]
    pub const fn new(raw: u64) -> Result<Self, AddrError> {
        if raw >> (A::FRAME_BITS + PAGE_SHIFT) != 0 {
            return Err(AddrError::OutOfRange);
        }
        Ok(Self(raw, PhantomData))
    }

    /// Construct from a value already known to be in range (e.g. decoded
    /// from a hardware table entry, where the field width enforces it).
    #[inline]
    #[must_use]
    pub const fn new_unchecked(raw: u64) -> Self {
        debug_assert!(raw >> (A::FRAME_BITS + PAGE_SHIFT) == 0);
        Self(raw, PhantomData)
    }

    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(0, PhantomData)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// The frame containing this address (aligns down).
    #[inline]
    #[must_use]
    pub const fn frame(self) -> PageNo<A> {
        PageNo::new_unchecked(self.0 >> PAGE_SHIFT)
    }

    /// Byte offset within the containing base page.
    #[inline]
    #[must_use]
    pub const fn page_offset(self) -> u64 {
        self.0 & (PAGE_SIZE - 1)
    }

    #[inline]
    #[must_use]
    pub const fn is_page_aligned(self) -> bool {
        self.page_offset() == 0
    }

    /// Align down to a power-of-two boundary.
    #[inline]
    #[must_use]
    pub const fn align_down(self, align: u64) -> Self {
        debug_assert!(align.is_power_of_two());
        Self(self.0 & !(align - 1), PhantomData)
    }

    #[inline]
    #[must_use]
    pub const fn is_aligned_to(self, align: u64) -> bool {
        debug_assert!(align.is_power_of_two());
        self.0 & (align - 1) == 0
    }
}

impl<A: MemArch> fmt::Debug for PhysAddr<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PA<{}>(0x{:012X})", A::as_str(), self.0)
    }
}

impl<A: MemArch> fmt::Display for PhysAddr<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:012X}", self.0)
    }
}

/// Virtual memory address, tagged by architecture `A`.
///
/// ### Invariants
/// - The value passes [`MemArch::is_canonical`]; [`VirtAddr::new`] rejects
///   everything else.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtAddr<A: MemArch>(u64, PhantomData<A>);

impl<A: MemArch> VirtAddr<A> {
    /// Construct from a raw value, rejecting non-canonical addresses.
    ///
    /// # Errors
    /// [`AddrError::OutOfRange`] for non-canonical (64-bit) or too-wide
    /// (PAE) values.
    #[inline]
    pub fn new(raw: u64) -> Result<Self, AddrError> {
        if !A::is_canonical(raw) {
            return Err(AddrError::OutOfRange);
        }
        Ok(Self(raw, PhantomData))
    }

    /// Construct from a value already known to be canonical.
    #[inline]
    #[must_use]
    pub fn new_unchecked(raw: u64) -> Self {
        debug_assert!(A::is_canonical(raw));
        Self(raw, PhantomData)
    }

    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(0, PhantomData)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// The virtual page containing this address (aligns down).
    #[inline]
    #[must_use]
    pub const fn vpage(self) -> VirtPageNo<A> {
        VirtPageNo::new_unchecked(self.0 >> PAGE_SHIFT)
    }

    /// Byte offset within the containing base page.
    #[inline]
    #[must_use]
    pub const fn page_offset(self) -> u64 {
        self.0 & (PAGE_SIZE - 1)
    }

    #[inline]
    #[must_use]
    pub const fn is_page_aligned(self) -> bool {
        self.page_offset() == 0
    }

    /// Align down to a power-of-two boundary. Aligning down cannot leave
    /// canonical form.
    #[inline]
    #[must_use]
    pub const fn align_down(self, align: u64) -> Self {
        debug_assert!(align.is_power_of_two());
        Self(self.0 & !(align - 1), PhantomData)
    }

    #[inline]
    #[must_use]
    pub const fn is_aligned_to(self, align: u64) -> bool {
        debug_assert!(align.is_power_of_two());
        self.0 & (align - 1) == 0
    }

    /// Checked advance by `bytes`, staying canonical.
    #[inline]
    #[must_use]
    pub fn checked_add(self, bytes: u64) -> Option<Self> {
        let raw = self.0.checked_add(bytes)?;
        A::is_canonical(raw).then(|| Self(raw, PhantomData))
    }
}

impl<A: MemArch> fmt::Debug for VirtAddr<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VA<{}>(0x{:016X})", A::as_str(), self.0)
    }
}

impl<A: MemArch> fmt::Display for VirtAddr<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

impl<A: MemArch> Add<u64> for PhysAddr<A> {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self {
        Self::new_unchecked(self.0 + rhs)
    }
}

impl<A: MemArch> AddAssign<u64> for PhysAddr<A> {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        *self = *self + rhs;
    }
}

impl<A: MemArch> Sub<PhysAddr<A>> for PhysAddr<A> {
    type Output = u64;
    #[inline]
    fn sub(self, rhs: Self) -> u64 {
        self.0 - rhs.0
    }
}

impl<A: MemArch> Add<u64> for VirtAddr<A> {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self {
        Self::new_unchecked(self.0 + rhs)
    }
}

impl<A: MemArch> AddAssign<u64> for VirtAddr<A> {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        *self = *self + rhs;
    }
}

impl<A: MemArch> Sub<VirtAddr<A>> for VirtAddr<A> {
    type Output = u64;
    #[inline]
    fn sub(self, rhs: Self) -> u64 {
        self.0 - rhs.0
    }
}

impl<A: MemArch> Add<PageCount> for VirtAddr<A> {
    type Output = Self;
    #[inline]
    fn add(self, rhs: PageCount) -> Self {
        self + rhs.bytes()
    }
}

// Mixed comparisons convert through the page-aligned form.

impl<A: MemArch> PartialEq<PageNo<A>> for PhysAddr<A> {
    #[inline]
    fn eq(&self, other: &PageNo<A>) -> bool {
        self.frame() == *other
    }
}

impl<A: MemArch> PartialEq<PhysAddr<A>> for PageNo<A> {
    #[inline]
    fn eq(&self, other: &PhysAddr<A>) -> bool {
        other.frame() == *self
    }
}

impl<A: MemArch> PartialOrd<PageNo<A>> for PhysAddr<A> {
    #[inline]
    fn partial_cmp(&self, other: &PageNo<A>) -> Option<Ordering> {
        self.frame().partial_cmp(other)
    }
}

impl<A: MemArch> PartialEq<VirtPageNo<A>> for VirtAddr<A> {
    #[inline]
    fn eq(&self, other: &VirtPageNo<A>) -> bool {
        self.vpage() == *other
    }
}

impl<A: MemArch> PartialEq<VirtAddr<A>> for VirtPageNo<A> {
    #[inline]
    fn eq(&self, other: &VirtAddr<A>) -> bool {
        other.vpage() == *self
    }
}

impl<A: MemArch> PartialOrd<VirtPageNo<A>> for VirtAddr<A> {
    #[inline]
    fn partial_cmp(&self, other: &VirtPageNo<A>) -> Option<Ordering> {
        self.vpage().partial_cmp(other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{X64, X86Pae};

    #[test]
    fn phys_addr_range() {
        assert!(PhysAddr::<X64>::new(0x0000_0010_2000_0042).is_ok());
        // 52-bit physical width: 1 << 52 is one past the end.
        assert_eq!(
            PhysAddr::<X64>::new(1 << 52),
            Err(AddrError::OutOfRange)
        );
    }

    #[test]
    fn virt_addr_canonical() {
        assert!(VirtAddr::<X64>::new(0xFFFF_FFFF_8000_1234).is_ok());
        assert_eq!(
            VirtAddr::<X64>::new(0x0000_8000_0000_0000),
            Err(AddrError::OutOfRange)
        );
        assert!(VirtAddr::<X86Pae>::new(0xC000_0000).is_ok());
        assert_eq!(
            VirtAddr::<X86Pae>::new(0x1_0000_0000),
            Err(AddrError::OutOfRange)
        );
    }

    #[test]
    fn page_alignment_helpers() {
        let pa = PhysAddr::<X64>::new(0x12345).unwrap();
        assert_eq!(pa.page_offset(), 0x345);
        assert!(!pa.is_page_aligned());
        assert_eq!(pa.align_down(0x1000).as_u64(), 0x12000);
        assert_eq!(pa.frame().as_u64(), 0x12);
    }

    #[test]
    fn mixed_comparisons_use_aligned_form() {
        let va = VirtAddr::<X64>::new(0x4000_1234).unwrap();
        let vpn = va.vpage();
        assert_eq!(va, vpn);
        assert_eq!(vpn, va);

        let pa = PhysAddr::<X64>::new(0x30_0000).unwrap();
        assert_eq!(pa, pa.frame());
    }

    #[test]
    fn checked_add_stops_at_canonical_hole() {
        let va = VirtAddr::<X64>::new(0x0000_7FFF_FFFF_F000).unwrap();
        assert!(va.checked_add(0x1000).is_none());
    }
}
