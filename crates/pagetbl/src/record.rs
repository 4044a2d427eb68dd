//! Everything a walk emits: range records, anomalies, and the overall status.

use core::fmt;

use crate::address::OverlappingBits;
use crate::config::PreconditionFailure;
use crate::level::{PageSize, TableLevel};
use crate::{PageEntry, PagingConfig, PhysicalAddress, VirtualAddress};

bitflags::bitflags! {
    /// Permission and caching attributes reported for a range.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Permissions: u16 {
        const WRITABLE = 1 << 0;
        const USER = 1 << 1;
        const WRITE_THROUGH = 1 << 2;
        const CACHE_DISABLE = 1 << 3;
        const ACCESSED = 1 << 4;
        /// Only reported for entries that map a page.
        const DIRTY = 1 << 5;
        /// Only reported for entries that map a page.
        const GLOBAL = 1 << 6;
        /// Only reported while EFER.NXE is set; otherwise bit 63 carries no meaning.
        const NO_EXECUTE = 1 << 7;
    }
}

impl Permissions {
    /// Extracts the attributes of `entry`.
    ///
    /// `maps_page` enables the bits that only have meaning in an entry that maps memory
    /// directly rather than referencing another table.
    pub fn from_entry(entry: PageEntry, config: &PagingConfig, maps_page: bool) -> Self {
        let flags = entry.flags();
        let mut permissions = Self::empty();
        permissions.set(Self::WRITABLE, flags.is_writable());
        permissions.set(Self::USER, flags.is_user());
        permissions.set(Self::WRITE_THROUGH, flags.is_write_through());
        permissions.set(Self::CACHE_DISABLE, flags.is_cache_disabled());
        permissions.set(Self::ACCESSED, flags.is_accessed());
        permissions.set(
            Self::NO_EXECUTE,
            config.no_execute_enabled() && flags.is_no_execute(),
        );
        if maps_page {
            permissions.set(Self::DIRTY, flags.is_dirty());
            permissions.set(Self::GLOBAL, flags.is_global());
        }
        permissions
    }
}

impl fmt::Display for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.contains(Self::WRITABLE) { "W" } else { "R" })?;
        f.write_str(if self.contains(Self::USER) { " U" } else { " K" })?;
        for (flag, name) in [
            (Self::WRITE_THROUGH, "PWT"),
            (Self::CACHE_DISABLE, "PCD"),
            (Self::ACCESSED, "A"),
            (Self::DIRTY, "D"),
            (Self::GLOBAL, "G"),
            (Self::NO_EXECUTE, "NX"),
        ] {
            if self.contains(flag) {
                write!(f, " {name}")?;
            }
        }
        Ok(())
    }
}

/// What the walk did with the entry behind a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    /// The entry maps a page of the given size (huge page, or a PT entry).
    Page(PageSize),
    /// The entry references another table and the walk descended into it.
    Table(PhysicalAddress),
    /// The entry references another table, but the configured depth ends here. The tag is
    /// the page size of this level.
    DepthLimit(PageSize),
    /// The entry references a table the resolver could not produce; its subtree is skipped.
    Unresolved(PhysicalAddress),
}

/// One decoded, present entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeRecord {
    pub level: TableLevel,
    /// Slot of the entry within its table.
    pub index: usize,
    /// The entry as read, including any reserved bits.
    pub entry: PageEntry,
    /// Lowest virtual address covered, inclusive.
    pub base: VirtualAddress,
    /// Highest virtual address covered, inclusive.
    pub max: VirtualAddress,
    pub permissions: Permissions,
    /// Protection key, when CR4.PKE is set and the entry maps a page.
    pub protection_key: Option<u8>,
    pub kind: RecordKind,
}

impl RangeRecord {
    pub fn label(&self) -> &'static str {
        self.level.label()
    }

    /// The page-size tag, for records that terminate the walk.
    pub fn page_size(&self) -> Option<PageSize> {
        match self.kind {
            RecordKind::Page(size) | RecordKind::DepthLimit(size) => Some(size),
            RecordKind::Table(_) | RecordKind::Unresolved(_) => None,
        }
    }

    /// Returns true if the walk descended below this record.
    pub fn descended(&self) -> bool {
        matches!(self.kind, RecordKind::Table(_))
    }

    /// Number of bytes of virtual address space covered.
    pub fn len(&self) -> u64 {
        self.max.as_u64() - self.base.as_u64() + 1
    }

    pub fn contains(&self, addr: VirtualAddress) -> bool {
        self.base <= addr && addr <= self.max
    }
}

impl fmt::Display for RangeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let indent = self.level.depth() * 2;
        write!(
            f,
            "{:indent$}{:<4} {} {} {}",
            "",
            self.label(),
            self.base,
            self.max,
            self.permissions,
        )?;
        if let Some(key) = self.protection_key {
            write!(f, " PK{key}")?;
        }
        match self.kind {
            RecordKind::Page(size) => write!(f, " [{size} page]"),
            RecordKind::Table(table) => write!(f, " -> {table}"),
            RecordKind::DepthLimit(size) => write!(f, " [{size}, not descended]"),
            RecordKind::Unresolved(table) => write!(f, " -> {table} (unreadable)"),
        }
    }
}

/// Classification of [`Anomaly`] values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AnomalyKind {
    ReservedBitViolation,
    AnomalousAbsentEntry,
    IllegalHugePage,
    InvariantViolation,
    ResolverFailure,
}

/// A suspicious condition found during a walk. None of these stop the walk; only
/// [`Anomaly::UnresolvableTable`] loses information (the subtree below it).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Anomaly {
    /// A present entry has bits between MAXPHYADDR and bit 51 set. The record is still emitted.
    ReservedBits {
        level: TableLevel,
        index: usize,
        entry: PageEntry,
        base: VirtualAddress,
        bits: u64,
    },
    /// The present bit is clear but the entry is not zero. No record is emitted.
    AbsentNonZero {
        level: TableLevel,
        index: usize,
        entry: PageEntry,
    },
    /// PS is set at a level that cannot map a page. The entry is treated as a table pointer.
    IllegalHugePage {
        level: TableLevel,
        index: usize,
        entry: PageEntry,
        base: VirtualAddress,
    },
    /// Two levels contributed the same address bit. This is a walker bug.
    OverlappingContribution {
        level: TableLevel,
        index: usize,
        overlap: OverlappingBits,
    },
    /// The table referenced by an entry could not be resolved.
    UnresolvableTable {
        level: TableLevel,
        index: usize,
        entry: PageEntry,
        base: VirtualAddress,
        table: PhysicalAddress,
    },
}

impl Anomaly {
    pub fn kind(&self) -> AnomalyKind {
        match self {
            Self::ReservedBits { .. } => AnomalyKind::ReservedBitViolation,
            Self::AbsentNonZero { .. } => AnomalyKind::AnomalousAbsentEntry,
            Self::IllegalHugePage { .. } => AnomalyKind::IllegalHugePage,
            Self::OverlappingContribution { .. } => AnomalyKind::InvariantViolation,
            Self::UnresolvableTable { .. } => AnomalyKind::ResolverFailure,
        }
    }

    pub fn level(&self) -> TableLevel {
        match *self {
            Self::ReservedBits { level, .. }
            | Self::AbsentNonZero { level, .. }
            | Self::IllegalHugePage { level, .. }
            | Self::OverlappingContribution { level, .. }
            | Self::UnresolvableTable { level, .. } => level,
        }
    }

    pub fn index(&self) -> usize {
        match *self {
            Self::ReservedBits { index, .. }
            | Self::AbsentNonZero { index, .. }
            | Self::IllegalHugePage { index, .. }
            | Self::OverlappingContribution { index, .. }
            | Self::UnresolvableTable { index, .. } => index,
        }
    }

    /// Returns true if a branch of the hierarchy was skipped because of this anomaly.
    pub fn is_branch_failure(&self) -> bool {
        matches!(self, Self::UnresolvableTable { .. })
    }
}

impl fmt::Display for Anomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]: ", self.level(), self.index())?;
        match self {
            Self::ReservedBits { entry, base, bits, .. } => write!(
                f,
                "invalid entry {:#018x} at {base}, reserved bits {bits:#x} set",
                entry.as_u64()
            ),
            Self::AbsentNonZero { entry, .. } => {
                write!(f, "strange entry {:#018x} without present bit", entry.as_u64())
            }
            Self::IllegalHugePage { entry, base, .. } => write!(
                f,
                "entry {:#018x} at {base} has the page size bit set, which must be 0",
                entry.as_u64()
            ),
            Self::OverlappingContribution { overlap, .. } => write!(f, "{overlap}"),
            Self::UnresolvableTable { base, table, .. } => {
                write!(f, "table {table} for {base} cannot be read, subtree skipped")
            }
        }
    }
}

/// Overall result of a walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkStatus {
    Ok,
    /// At least one subtree was skipped because its table could not be resolved.
    CompletedWithErrors,
    /// Nothing was walked.
    PreconditionFailed(PreconditionFailure),
}

impl fmt::Display for WalkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::CompletedWithErrors => write!(f, "completed with errors"),
            Self::PreconditionFailed(reason) => write!(f, "precondition failed: {reason}"),
        }
    }
}

/// One item of the lazy sequence produced by a [`Walker`](crate::Walker).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkEvent {
    Record(RangeRecord),
    Anomaly(Anomaly),
}
