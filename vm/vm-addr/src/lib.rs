//! # Virtual and Physical Memory Value Types
//!
//! Strongly typed, architecture-tagged wrappers for the raw values that flow
//! through paging code: byte addresses, page frame numbers, virtual page
//! numbers, and page counts.
//!
//! ## Overview
//!
//! Every type carries an architecture marker `A` implementing [`MemArch`], so
//! values belonging to different table geometries cannot be mixed at compile
//! time, in the same way a page-size marker keeps 4 KiB and 2 MiB pages
//! apart. All wrappers are `#[repr(transparent)]` around a `u64` and zero
//! cost in release builds.
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`PhysAddr<A>`] | Raw physical byte address. |
//! | [`VirtAddr<A>`] | Raw virtual byte address (canonical on 64-bit). |
//! | [`PageNo<A>`] | Physical page frame number. |
//! | [`VirtPageNo<A>`] | Virtual page number. |
//! | [`PageCount`] | Page-granular quantity, untagged. |
//!
//! ## Validation
//!
//! Constructors **fail rather than truncate**:
//!
//! - building a page number from a misaligned address is
//!   [`AddrError::InvalidArgument`];
//! - a frame number wider than the architecture allows, or a non-canonical
//!   64-bit virtual address, is [`AddrError::OutOfRange`].
//!
//! Mixed comparisons between an address and its page-number type are allowed
//! and go through the page-aligned form of the address.
//!
//! ## Typical Usage
//!
//! ```rust
//! # use vm_addr::*;
//! let va: VirtAddr<X64> = VirtAddr::new(0xFFFF_8000_0000_1000).unwrap();
//! let vpn = VirtPageNo::from_addr(va).unwrap();
//! assert_eq!(vpn.base(), va);
//! assert_eq!((vpn + PageCount::new(2)).base().as_u64(), 0xFFFF_8000_0000_3000);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

mod addr;
mod page;

pub use crate::addr::{PhysAddr, VirtAddr};
pub use crate::page::{PageCount, PageNo, VirtPageNo};

use core::fmt;
use core::hash::Hash;

/// Base page granularity shared by the supported architectures.
pub const PAGE_SHIFT: u32 = 12;
/// Size in bytes of the smallest page.
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

/// Sealed trait pattern to restrict [`MemArch`] impls to our markers.
mod sealed {
    pub trait Sealed {}
}

/// Marker trait for a supported table geometry.
///
/// An implementation fixes the virtual-address width, the frame-number
/// width, and the canonical-form rule for that architecture. The marker is
/// carried as a phantom tag on every value type.
pub trait MemArch:
    sealed::Sealed
    + Clone
    + Copy
    + Eq
    + PartialEq
    + Ord
    + PartialOrd
    + Hash
    + fmt::Debug
    + Send
    + Sync
    + 'static
{
    /// Number of meaningful virtual-address bits.
    const VADDR_BITS: u32;
    /// Width of a physical page frame number.
    const FRAME_BITS: u32;

    /// Whether `raw` is a representable virtual address.
    ///
    /// On 64-bit this is the canonical-form check: bits above the highest
    /// used bit must be sign-extended copies of it.
    #[must_use]
    fn is_canonical(raw: u64) -> bool;

    fn as_str() -> &'static str;
}

/// x86-64 long mode: 48-bit canonical virtual addresses, 4-level tables.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct X64;
impl sealed::Sealed for X64 {}
impl MemArch for X64 {
    const VADDR_BITS: u32 = 48;
    const FRAME_BITS: u32 = 40;

    #[inline]
    fn is_canonical(raw: u64) -> bool {
        // Bits 63..48 must equal bit 47.
        let shift = 64 - Self::VADDR_BITS;
        ((raw as i64) << shift >> shift) as u64 == raw
    }

    fn as_str() -> &'static str {
        "x86-64"
    }
}

/// 32-bit x86 with PAE paging: 32-bit virtual addresses, 3-level tables.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct X86Pae;
impl sealed::Sealed for X86Pae {}
impl MemArch for X86Pae {
    const VADDR_BITS: u32 = 32;
    const FRAME_BITS: u32 = 40;

    #[inline]
    fn is_canonical(raw: u64) -> bool {
        raw <= u64::from(u32::MAX)
    }

    fn as_str() -> &'static str {
        "x86-pae"
    }
}

/// Failure to construct an address or page-number value.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddrError {
    /// The value is misaligned for the requested granularity.
    #[error("misaligned address")]
    InvalidArgument,
    /// The value exceeds the architecture's address or frame-number width,
    /// or a 64-bit virtual address is not in canonical form.
    #[error("address or frame number out of range")]
    OutOfRange,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_form_x64() {
        assert!(X64::is_canonical(0));
        assert!(X64::is_canonical(0x0000_7FFF_FFFF_FFFF));
        assert!(X64::is_canonical(0xFFFF_8000_0000_0000));
        assert!(X64::is_canonical(0xFFFF_FFFF_FFFF_FFFF));
        assert!(!X64::is_canonical(0x0000_8000_0000_0000));
        assert!(!X64::is_canonical(0x0001_0000_0000_0000));
        assert!(!X64::is_canonical(0xFFFF_7FFF_FFFF_FFFF));
    }

    #[test]
    fn canonical_form_pae() {
        assert!(X86Pae::is_canonical(0xFFFF_F000));
        assert!(!X86Pae::is_canonical(0x1_0000_0000));
    }
}
