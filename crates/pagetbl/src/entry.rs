//! Decoding and validation of raw 64-bit table entries.

use core::fmt;
use core::ops::BitOr;

use x86_64::structures::paging::PageTableFlags;

use crate::{PagingConfig, PhysicalAddress};

/// Architectural flag bits of an entry.
///
/// This wraps the `x86_64` crate's flag definitions and only exposes reads; the auditor never
/// writes tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryFlags(PageTableFlags);

impl EntryFlags {
    pub const PRESENT: Self = Self(PageTableFlags::PRESENT);
    pub const WRITABLE: Self = Self(PageTableFlags::WRITABLE);
    pub const USER: Self = Self(PageTableFlags::USER_ACCESSIBLE);
    pub const WRITE_THROUGH: Self = Self(PageTableFlags::WRITE_THROUGH);
    pub const CACHE_DISABLE: Self = Self(PageTableFlags::NO_CACHE);
    pub const ACCESSED: Self = Self(PageTableFlags::ACCESSED);
    pub const DIRTY: Self = Self(PageTableFlags::DIRTY);
    /// PS at the PDPT/PD levels. At the PT level the same bit is PAT.
    pub const HUGE_PAGE: Self = Self(PageTableFlags::HUGE_PAGE);
    pub const GLOBAL: Self = Self(PageTableFlags::GLOBAL);
    pub const NO_EXECUTE: Self = Self(PageTableFlags::NO_EXECUTE);

    /// Creates empty flags (entry not present).
    pub const fn empty() -> Self {
        Self(PageTableFlags::empty())
    }

    /// Returns the raw bits of these flags.
    pub const fn bits(self) -> u64 {
        self.0.bits()
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0.contains(other.0)
    }

    pub const fn is_present(self) -> bool {
        self.contains(Self::PRESENT)
    }

    pub const fn is_writable(self) -> bool {
        self.contains(Self::WRITABLE)
    }

    pub const fn is_user(self) -> bool {
        self.contains(Self::USER)
    }

    pub const fn is_write_through(self) -> bool {
        self.contains(Self::WRITE_THROUGH)
    }

    pub const fn is_cache_disabled(self) -> bool {
        self.contains(Self::CACHE_DISABLE)
    }

    pub const fn is_accessed(self) -> bool {
        self.contains(Self::ACCESSED)
    }

    pub const fn is_dirty(self) -> bool {
        self.contains(Self::DIRTY)
    }

    pub const fn is_huge(self) -> bool {
        self.contains(Self::HUGE_PAGE)
    }

    pub const fn is_global(self) -> bool {
        self.contains(Self::GLOBAL)
    }

    pub const fn is_no_execute(self) -> bool {
        self.contains(Self::NO_EXECUTE)
    }
}

impl From<u64> for EntryFlags {
    fn from(value: u64) -> Self {
        Self(PageTableFlags::from_bits_truncate(value))
    }
}

impl BitOr for EntryFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl Default for EntryFlags {
    fn default() -> Self {
        Self::empty()
    }
}

/// How an entry's present bit relates to the rest of its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    /// Present bit clear and the whole entry zero.
    Absent,
    /// Present bit clear but other bits set. Not used for translation, but suspicious.
    Anomalous,
    Present,
}

/// Why an entry failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidReason {
    /// Bits between MAXPHYADDR and bit 51 are set; `bits` holds the offending ones.
    ReservedBits { bits: u64 },
}

impl fmt::Display for InvalidReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReservedBits { bits } => write!(f, "reserved bits {bits:#x} set"),
        }
    }
}

/// Outcome of [`PageEntry::validate`]. Validation is advisory: an invalid entry is still
/// decoded and reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validity {
    Valid,
    Invalid(InvalidReason),
}

/// A single raw table entry.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct PageEntry(u64);

impl PageEntry {
    /// Bits 12-51 contain the physical address of the next table or of the mapped page.
    const ADDRESS_MASK: u64 = 0x000F_FFFF_FFFF_F000;

    const PROTECTION_KEY_SHIFT: u32 = 59;
    const PROTECTION_KEY_MASK: u64 = 0xF;

    /// Creates an entry pointing at `address` with the given flags.
    ///
    /// Address bits outside of 12-51 are discarded.
    pub fn new(address: PhysicalAddress, flags: EntryFlags) -> Self {
        debug_assert!(
            address.as_u64() & 0xFFF == 0,
            "physical address must be page-aligned"
        );
        Self((address.as_u64() & Self::ADDRESS_MASK) | (flags.bits() & !Self::ADDRESS_MASK))
    }

    /// Wraps a raw value read from a table. Pure bit extraction happens lazily through the
    /// accessors.
    #[inline]
    pub const fn decode(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw value of this entry.
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    pub fn flags(self) -> EntryFlags {
        EntryFlags::from(self.0)
    }

    pub fn is_present(self) -> bool {
        self.flags().is_present()
    }

    pub fn presence(self) -> Presence {
        if self.is_present() {
            Presence::Present
        } else if self.0 == 0 {
            Presence::Absent
        } else {
            Presence::Anomalous
        }
    }

    /// Returns whether bit 7 is set. Its meaning depends on the level the entry lives in.
    pub fn is_huge(self) -> bool {
        self.flags().is_huge()
    }

    /// Returns the physical address held in bits 12-51.
    ///
    /// Returns None if the entry is not present.
    pub fn address(self) -> Option<PhysicalAddress> {
        if self.is_present() {
            Some(PhysicalAddress::new(self.0 & Self::ADDRESS_MASK))
        } else {
            None
        }
    }

    /// Returns the protection key in bits 62:59. Only meaningful when CR4.PKE is set.
    pub const fn protection_key(self) -> u8 {
        ((self.0 >> Self::PROTECTION_KEY_SHIFT) & Self::PROTECTION_KEY_MASK) as u8
    }

    /// Checks the entry against the reserved-bit mask of `config`.
    pub fn validate(self, config: &PagingConfig) -> Validity {
        let bits = self.0 & config.reserved_mask();
        if bits != 0 {
            Validity::Invalid(InvalidReason::ReservedBits { bits })
        } else {
            Validity::Valid
        }
    }
}

impl From<u64> for PageEntry {
    fn from(value: u64) -> Self {
        Self::decode(value)
    }
}

impl fmt::Debug for PageEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PageEntry({:#018x})", self.0)
    }
}
