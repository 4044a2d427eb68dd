//! Walk configuration.
//!
//! A [`ConfigProvider`] reports what the CPU is doing (physical address width, CR3, which
//! paging features are on) as a plain [`SystemConfig`]. Before a walk starts this is turned
//! into a [`PagingConfig`], which is immutable and handed to every validation call.

use core::fmt;

use crate::PhysicalAddress;
use crate::address::TABLE_SIZE;

/// Highest bit of an entry that may hold a physical address.
const MAX_PHYSICAL_ADDRESS_WIDTH: u8 = 52;

/// Narrowest physical address width accepted. Every 64-bit capable CPU implements at least 36.
const MIN_PHYSICAL_ADDRESS_WIDTH: u8 = 32;

/// Raw facts about the running paging setup, as supplied by a [`ConfigProvider`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemConfig {
    /// MAXPHYADDR.
    pub physical_address_width: u8,
    /// Physical address of the root table.
    pub root_table: PhysicalAddress,
    /// Whether the paging mode is the 4-level mode this crate understands.
    pub paging_mode_recognized: bool,
    pub protection_keys_enabled: bool,
    pub no_execute_enabled: bool,
}

/// Supplies the [`SystemConfig`] a walk runs against.
pub trait ConfigProvider {
    fn system_config(&self) -> SystemConfig;
}

impl ConfigProvider for SystemConfig {
    fn system_config(&self) -> SystemConfig {
        *self
    }
}

impl<T: ConfigProvider + ?Sized> ConfigProvider for &T {
    fn system_config(&self) -> SystemConfig {
        (**self).system_config()
    }
}

/// How far down the hierarchy the walker descends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WalkDepth {
    /// Stop at page-directory entries. Every PD entry is reported with a 2 MiB tag.
    #[default]
    ThreeLevel,
    /// Descend into page tables and report individual 4 KiB pages.
    FourLevel,
}

/// Reasons a walk is refused before any table is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreconditionFailure {
    /// The provider reported a paging mode other than 4-level paging without PCIDs.
    UnrecognizedPagingMode,
    /// MAXPHYADDR is outside of what the entry format can describe.
    UnsupportedAddressWidth(u8),
    /// The root table address is not 4 KiB aligned.
    MisalignedRootTable(PhysicalAddress),
    /// The resolver could not produce a readable root table.
    UnresolvableRootTable(PhysicalAddress),
}

impl fmt::Display for PreconditionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnrecognizedPagingMode => write!(f, "unknown paging setup"),
            Self::UnsupportedAddressWidth(width) => {
                write!(f, "unsupported physical address width of {width} bits")
            }
            Self::MisalignedRootTable(addr) => {
                write!(f, "root table at {addr} is not 4KiB aligned")
            }
            Self::UnresolvableRootTable(addr) => {
                write!(f, "root table at {addr} cannot be read")
            }
        }
    }
}

impl core::error::Error for PreconditionFailure {}

/// Returns the mask of entry bits that must be zero for the given MAXPHYADDR.
///
/// These are bits `width` through 51 inclusive. A width of 52 leaves nothing reserved.
pub const fn reserved_mask(width: u8) -> u64 {
    if width >= MAX_PHYSICAL_ADDRESS_WIDTH {
        return 0;
    }
    let below_52 = (1u64 << MAX_PHYSICAL_ADDRESS_WIDTH) - 1;
    let below_width = (1u64 << width) - 1;
    below_52 & !below_width
}

/// The per-walk configuration, derived once from a [`SystemConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagingConfig {
    physical_address_width: u8,
    reserved_mask: u64,
    root_table: PhysicalAddress,
    protection_keys_enabled: bool,
    no_execute_enabled: bool,
    depth: WalkDepth,
}

impl PagingConfig {
    /// Checks the preconditions of a walk and derives the configuration.
    ///
    /// # Errors
    ///
    /// Returns a [`PreconditionFailure`] if the paging mode is not recognized, the physical
    /// address width is out of range, or the root table is misaligned.
    pub fn derive(system: &SystemConfig) -> Result<Self, PreconditionFailure> {
        if !system.paging_mode_recognized {
            return Err(PreconditionFailure::UnrecognizedPagingMode);
        }

        let width = system.physical_address_width;
        if !(MIN_PHYSICAL_ADDRESS_WIDTH..=MAX_PHYSICAL_ADDRESS_WIDTH).contains(&width) {
            return Err(PreconditionFailure::UnsupportedAddressWidth(width));
        }

        if !system.root_table.is_aligned(TABLE_SIZE) {
            return Err(PreconditionFailure::MisalignedRootTable(system.root_table));
        }

        Ok(Self {
            physical_address_width: width,
            reserved_mask: reserved_mask(width),
            root_table: system.root_table,
            protection_keys_enabled: system.protection_keys_enabled,
            no_execute_enabled: system.no_execute_enabled,
            depth: WalkDepth::default(),
        })
    }

    /// Returns a copy of this configuration that walks to the given depth.
    pub const fn with_depth(mut self, depth: WalkDepth) -> Self {
        self.depth = depth;
        self
    }

    pub const fn physical_address_width(&self) -> u8 {
        self.physical_address_width
    }

    /// Bits that must be zero in every entry.
    pub const fn reserved_mask(&self) -> u64 {
        self.reserved_mask
    }

    pub const fn root_table(&self) -> PhysicalAddress {
        self.root_table
    }

    pub const fn protection_keys_enabled(&self) -> bool {
        self.protection_keys_enabled
    }

    pub const fn no_execute_enabled(&self) -> bool {
        self.no_execute_enabled
    }

    pub const fn depth(&self) -> WalkDepth {
        self.depth
    }
}
