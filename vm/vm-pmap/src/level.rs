//! Translation levels and the per-architecture table layout.

use vm_addr::{MemArch, PAGE_SHIFT, X64, X86Pae};

use crate::{NR_ENTRIES, NR_ENTRIES_SHIFT};

/// One level of the translation hierarchy, counted from the bottom.
///
/// `L1` tables hold bottom-level leaf records; the top level depends on the
/// architecture ([`PagingArch::TOP`]).
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Level {
    L1 = 1,
    L2 = 2,
    L3 = 3,
    L4 = 4,
}

impl Level {
    #[inline]
    #[must_use]
    pub const fn depth(self) -> u32 {
        self as u32
    }

    /// Virtual-address bit where this level's table index starts.
    #[inline]
    #[must_use]
    pub const fn shift(self) -> u32 {
        PAGE_SHIFT + NR_ENTRIES_SHIFT * (self.depth() - 1)
    }

    /// Base pages covered by a single record at this level.
    #[inline]
    #[must_use]
    pub const fn span_pages(self) -> u64 {
        1 << (NR_ENTRIES_SHIFT * (self.depth() - 1))
    }

    #[inline]
    #[must_use]
    pub const fn down(self) -> Option<Self> {
        match self {
            Self::L1 => None,
            Self::L2 => Some(Self::L1),
            Self::L3 => Some(Self::L2),
            Self::L4 => Some(Self::L3),
        }
    }

    #[inline]
    #[must_use]
    pub const fn up(self) -> Option<Self> {
        match self {
            Self::L1 => Some(Self::L2),
            Self::L2 => Some(Self::L3),
            Self::L3 => Some(Self::L4),
            Self::L4 => None,
        }
    }
}

/// Architecture-specific shape of the translation hierarchy.
///
/// Implemented by the [`MemArch`] markers that this crate can walk. The
/// walker itself is generic; everything layout-specific funnels through here.
pub trait PagingArch: MemArch {
    /// Level of the root table.
    const TOP: Level;

    /// Whether kernel spaces install the recursive self-map.
    const SELF_MAP: bool;

    /// Live record slots in a table at `level`. The 3-level top table
    /// exposes only four.
    #[must_use]
    fn entries_at(level: Level) -> usize {
        let _ = level;
        NR_ENTRIES
    }

    /// Whether a mapping may terminate at `level`.
    #[must_use]
    fn leaf_allowed(level: Level) -> bool;
}

impl PagingArch for X64 {
    const TOP: Level = Level::L4;
    const SELF_MAP: bool = true;

    fn leaf_allowed(level: Level) -> bool {
        level <= Level::L3
    }
}

impl PagingArch for X86Pae {
    const TOP: Level = Level::L3;
    const SELF_MAP: bool = false;

    fn entries_at(level: Level) -> usize {
        if level == Level::L3 { 4 } else { NR_ENTRIES }
    }

    fn leaf_allowed(level: Level) -> bool {
        level <= Level::L2
    }
}

/// Index into the table at `level` for the virtual address `raw`.
#[inline]
#[must_use]
pub fn table_index<A: PagingArch>(raw: u64, level: Level) -> usize {
    (raw >> level.shift()) as usize & (A::entries_at(level) - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shifts_match_the_hardware_layout() {
        assert_eq!(Level::L1.shift(), 12);
        assert_eq!(Level::L2.shift(), 21);
        assert_eq!(Level::L3.shift(), 30);
        assert_eq!(Level::L4.shift(), 39);
        assert_eq!(Level::L2.span_pages(), 512);
        assert_eq!(Level::L3.span_pages(), 512 * 512);
    }

    #[test]
    fn index_extraction() {
        let va = 0xFFFF_8000_4020_1000_u64;
        assert_eq!(table_index::<X64>(va, Level::L4), 256);
        assert_eq!(table_index::<X64>(va, Level::L3), 1);
        assert_eq!(table_index::<X64>(va, Level::L2), 1);
        assert_eq!(table_index::<X64>(va, Level::L1), 1);
    }

    #[test]
    fn pae_top_table_is_narrow() {
        assert_eq!(<X86Pae as PagingArch>::entries_at(Level::L3), 4);
        assert_eq!(table_index::<X86Pae>(0xFFE0_0000, Level::L3), 3);
        assert!(!<X86Pae as PagingArch>::leaf_allowed(Level::L3));
    }
}
