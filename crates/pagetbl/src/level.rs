//! Static description of the x86_64 4-level paging hierarchy.

use core::fmt;

use crate::HumanSize;

/// Number of entries in every table (4 KiB table / 8-byte entries).
pub const ENTRY_COUNT: usize = 512;

/// Size of the region mapped by a terminal entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PageSize {
    /// A page-table entry.
    Size4KiB,
    /// A page-directory entry with PS set.
    Size2MiB,
    /// A PDPT entry with PS set.
    Size1GiB,
}

impl PageSize {
    /// Returns the size in bytes.
    pub const fn bytes(self) -> u64 {
        match self {
            Self::Size4KiB => 1 << 12,
            Self::Size2MiB => 1 << 21,
            Self::Size1GiB => 1 << 30,
        }
    }
}

impl fmt::Display for PageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", HumanSize(self.bytes()))
    }
}

/// One level of the hierarchy, from the root (PML4) down to the leaf (PT).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TableLevel {
    Pml4,
    Pdpt,
    Pd,
    Pt,
}

/// Per-level metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelDescriptor {
    pub level: TableLevel,
    /// Lowest virtual-address bit owned by this level.
    pub bit_offset: u32,
    pub label: &'static str,
    pub entry_count: usize,
    /// Whether the PS bit (bit 7) makes an entry at this level map a page directly.
    pub huge_page_eligible: bool,
    /// Size mapped by an entry that terminates the walk at this level.
    pub page_size: Option<PageSize>,
}

/// The hierarchy in walk order.
pub static LEVELS: [LevelDescriptor; 4] = [
    LevelDescriptor {
        level: TableLevel::Pml4,
        bit_offset: 39,
        label: "PML4",
        entry_count: ENTRY_COUNT,
        huge_page_eligible: false,
        page_size: None,
    },
    LevelDescriptor {
        level: TableLevel::Pdpt,
        bit_offset: 30,
        label: "PDPT",
        entry_count: ENTRY_COUNT,
        huge_page_eligible: true,
        page_size: Some(PageSize::Size1GiB),
    },
    LevelDescriptor {
        level: TableLevel::Pd,
        bit_offset: 21,
        label: "PD",
        entry_count: ENTRY_COUNT,
        huge_page_eligible: true,
        page_size: Some(PageSize::Size2MiB),
    },
    LevelDescriptor {
        level: TableLevel::Pt,
        bit_offset: 12,
        label: "PT",
        entry_count: ENTRY_COUNT,
        huge_page_eligible: false,
        page_size: Some(PageSize::Size4KiB),
    },
];

impl TableLevel {
    /// The level CR3 points at.
    pub const ROOT: Self = Self::Pml4;

    /// Position of this level in [`LEVELS`].
    pub const fn depth(self) -> usize {
        match self {
            Self::Pml4 => 0,
            Self::Pdpt => 1,
            Self::Pd => 2,
            Self::Pt => 3,
        }
    }

    pub fn descriptor(self) -> &'static LevelDescriptor {
        &LEVELS[self.depth()]
    }

    /// Returns the level below this one, if any.
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Pml4 => Some(Self::Pdpt),
            Self::Pdpt => Some(Self::Pd),
            Self::Pd => Some(Self::Pt),
            Self::Pt => None,
        }
    }

    pub fn bit_offset(self) -> u32 {
        self.descriptor().bit_offset
    }

    pub fn label(self) -> &'static str {
        self.descriptor().label
    }

    pub const fn is_root(self) -> bool {
        matches!(self, Self::Pml4)
    }
}

impl fmt::Display for TableLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
