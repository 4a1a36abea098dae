//! Recursive self-map address arithmetic.
//!
//! A kernel 4-level space points top slot [`RECURSIVE_IDX`] back at its own
//! root table. Walking the tree through that slot lands on the tables
//! themselves, so for every virtual address there is a second virtual address
//! at which the record covering it can be read and written. The functions
//! here compute those addresses; nothing in this module touches memory.
//!
//! Only the 4-level format carries a self-map. The 3-level top table has four
//! slots and none to spare.

use vm_addr::{VirtAddr, VirtPageNo, X64};

use crate::level::Level;
use crate::{NR_ENTRIES_SHIFT, RECURSIVE_IDX};

/// Address bits below the canonical sign extension.
const LOW_MASK: u64 = (1 << 48) - 1;

/// Lowest virtual address owned by the self-map.
#[must_use]
pub fn region_base() -> VirtAddr<X64> {
    VirtAddr::new_unchecked(sign_extend((RECURSIVE_IDX as u64) << 39))
}

/// Whether translating `vpn` would pass through the reserved top slot.
#[must_use]
pub fn in_self_map(vpn: VirtPageNo<X64>) -> bool {
    let low = vpn.base().as_u64() & LOW_MASK;
    (low >> 39) as usize & 0x1FF == RECURSIVE_IDX
}

/// Virtual address of the record at `level` that translates `vpn`.
///
/// Each pass through the recursive slot strips one level off the walk, so
/// the record for level `n` is reached by prepending `n` recursive indices
/// and shifting the original address right by `9 * n` bits.
#[must_use]
pub fn entry_va(level: Level, vpn: VirtPageNo<X64>) -> VirtAddr<X64> {
    let low = vpn.base().as_u64() & LOW_MASK;
    let n = level.depth();

    let mut base = 0_u64;
    for i in 0..n {
        base |= (RECURSIVE_IDX as u64) << (39 - NR_ENTRIES_SHIFT * i);
    }

    // Slot offsets are 8-byte aligned; the bits shifted in below bit 3
    // belong to the next level down and are dropped.
    let offset = (low >> (NR_ENTRIES_SHIFT * n)) & !0x7;
    VirtAddr::new_unchecked(sign_extend(base | offset))
}

/// Virtual address of the whole table at `level` holding the record for
/// `vpn`.
#[must_use]
pub fn table_va(level: Level, vpn: VirtPageNo<X64>) -> VirtAddr<X64> {
    entry_va(level, vpn).align_down(4096)
}

fn sign_extend(low: u64) -> u64 {
    ((low as i64) << 16 >> 16) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vpn(va: u64) -> VirtPageNo<X64> {
        VirtAddr::new(va).unwrap().vpage()
    }

    #[test]
    fn region_starts_at_the_recursive_slot() {
        assert_eq!(region_base().as_u64(), 0xFFFF_FF00_0000_0000);
        assert!(in_self_map(vpn(0xFFFF_FF00_0000_0000)));
        assert!(!in_self_map(vpn(0xFFFF_8000_0000_0000)));
    }

    #[test]
    fn bottom_level_record_address() {
        // One pass through the recursive slot, then the original upper
        // indices select the bottom-level table.
        assert_eq!(
            entry_va(Level::L1, vpn(0)).as_u64(),
            0xFFFF_FF00_0000_0000
        );
        assert_eq!(
            entry_va(Level::L1, vpn(0x1000)).as_u64(),
            0xFFFF_FF00_0000_0008
        );
        assert_eq!(
            entry_va(Level::L1, vpn(0xFFFF_8000_0000_0000)).as_u64(),
            0xFFFF_FF40_0000_0000
        );
    }

    #[test]
    fn top_level_record_address() {
        // Four passes reach the root table itself.
        let root = entry_va(Level::L4, vpn(0)).as_u64();
        assert_eq!(root, 0xFFFF_FF7F_BFDF_E000);
        assert_eq!(
            entry_va(Level::L4, vpn(0xFFFF_8000_0000_0000)).as_u64(),
            root + 256 * 8
        );
        assert_eq!(table_va(Level::L4, vpn(0)).as_u64(), root);
    }
}
