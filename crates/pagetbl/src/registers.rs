//! Deriving a [`SystemConfig`] from raw control-register values.
//!
//! Reading the registers is left to the caller (a kernel module, a hypervisor, a crash dump
//! parser); this module only interprets the values, following the paging mode selection of
//! the Intel SDM, Vol. 3A, table 4-1.

use alloc::vec::Vec;
use core::fmt;

use x86_64::registers::control::{Cr0Flags, Cr3Flags, Cr4Flags};
use x86_64::registers::model_specific::EferFlags;

use crate::{ConfigProvider, PhysicalAddress, SystemConfig};

/// CR3 bits that are ignored by 4-level paging without PCIDs (bits 11:5 and 2:0, sans PWT/PCD).
const CR3_IGNORED_MASK: u64 = 0xFE7;

/// CR3 bits holding the root table address.
const CR3_ADDRESS_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// The paging mode selected by CR0, CR4 and EFER.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingMode {
    /// CR0.PG clear.
    Disabled,
    /// CR0.PG set, CR4.PAE clear.
    ThirtyTwoBit,
    /// CR4.PAE set, EFER.LME clear.
    Pae,
    /// 4-level paging.
    FourLevel { pcid: bool },
    /// 5-level paging (CR4.LA57).
    FiveLevel,
}

impl fmt::Display for PagingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => write!(f, "paging disabled"),
            Self::ThirtyTwoBit => write!(f, "32-bit paging"),
            Self::Pae => write!(f, "PAE paging"),
            Self::FourLevel { pcid: false } => write!(f, "4-level paging"),
            Self::FourLevel { pcid: true } => write!(f, "4-level paging with PCIDs"),
            Self::FiveLevel => write!(f, "5-level paging"),
        }
    }
}

/// Something odd about the register values that does not prevent a walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterWarning {
    /// CR3 has bits set that the CPU ignores.
    Cr3IgnoredBits(u64),
    /// CR3 has address bits set at or above MAXPHYADDR.
    Cr3ReservedBits(u64),
    /// CR3 requests write-through or uncached access to the root table.
    Cr3CacheControl { write_through: bool, cache_disable: bool },
    /// CR4.PKE is clear. This is the normal case and only informational.
    ProtectionKeysDisabled,
}

impl RegisterWarning {
    /// Returns true for warnings that describe the expected state of most machines.
    pub fn is_informational(&self) -> bool {
        matches!(self, Self::ProtectionKeysDisabled)
    }
}

impl fmt::Display for RegisterWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cr3IgnoredBits(bits) => write!(f, "cr3 looks shady: ignored bits {bits:#x} set"),
            Self::Cr3ReservedBits(bits) => {
                write!(f, "cr3 looks shady: reserved bits {bits:#x} set")
            }
            Self::Cr3CacheControl {
                write_through,
                cache_disable,
            } => write!(
                f,
                "unexpected options in cr3 (PWT={}, PCD={})",
                u8::from(*write_through),
                u8::from(*cache_disable)
            ),
            Self::ProtectionKeysDisabled => write!(f, "no protection keys enabled"),
        }
    }
}

/// Raw register values captured from a CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterSnapshot {
    pub cr0: u64,
    pub cr3: u64,
    pub cr4: u64,
    /// IA32_EFER.
    pub efer: u64,
    /// MAXPHYADDR, from CPUID leaf 0x80000008.
    pub physical_address_width: u8,
}

impl RegisterSnapshot {
    fn cr0(&self) -> Cr0Flags {
        Cr0Flags::from_bits_truncate(self.cr0)
    }

    fn cr4(&self) -> Cr4Flags {
        Cr4Flags::from_bits_truncate(self.cr4)
    }

    fn efer(&self) -> EferFlags {
        EferFlags::from_bits_truncate(self.efer)
    }

    pub fn paging_mode(&self) -> PagingMode {
        let (cr0, cr4, efer) = (self.cr0(), self.cr4(), self.efer());
        if !cr0.contains(Cr0Flags::PAGING) {
            PagingMode::Disabled
        } else if !cr4.contains(Cr4Flags::PHYSICAL_ADDRESS_EXTENSION) {
            PagingMode::ThirtyTwoBit
        } else if !efer.contains(EferFlags::LONG_MODE_ENABLE) {
            PagingMode::Pae
        } else if cr4.contains(Cr4Flags::L5_PAGING) {
            PagingMode::FiveLevel
        } else {
            PagingMode::FourLevel {
                pcid: cr4.contains(Cr4Flags::PCID),
            }
        }
    }

    /// Physical address of the root table referenced by CR3.
    pub fn root_table(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.cr3 & CR3_ADDRESS_MASK)
    }

    /// Collects everything unusual about the snapshot.
    pub fn diagnostics(&self) -> Vec<RegisterWarning> {
        let mut warnings = Vec::new();

        let ignored = self.cr3 & CR3_IGNORED_MASK;
        if ignored != 0 {
            warnings.push(RegisterWarning::Cr3IgnoredBits(ignored));
        }

        let width = u32::from(self.physical_address_width);
        let reserved = self.cr3.checked_shr(width).map_or(0, |high| high << width);
        if reserved != 0 {
            warnings.push(RegisterWarning::Cr3ReservedBits(reserved));
        }

        let cr3 = Cr3Flags::from_bits_truncate(self.cr3);
        let write_through = cr3.contains(Cr3Flags::PAGE_LEVEL_WRITETHROUGH);
        let cache_disable = cr3.contains(Cr3Flags::PAGE_LEVEL_CACHE_DISABLE);
        if write_through || cache_disable {
            warnings.push(RegisterWarning::Cr3CacheControl {
                write_through,
                cache_disable,
            });
        }

        if !self.cr4().contains(Cr4Flags::PROTECTION_KEY_USER) {
            warnings.push(RegisterWarning::ProtectionKeysDisabled);
        }

        warnings
    }

    /// Logs the paging mode and every diagnostic.
    pub fn log_diagnostics(&self) {
        log::info!(
            "cr3 {:#x}, MAXPHYADDR {}, {}",
            self.cr3,
            self.physical_address_width,
            self.paging_mode()
        );
        for warning in self.diagnostics() {
            if warning.is_informational() {
                log::info!("{warning}");
            } else {
                log::warn!("{warning}");
            }
        }
    }
}

impl ConfigProvider for RegisterSnapshot {
    fn system_config(&self) -> SystemConfig {
        SystemConfig {
            physical_address_width: self.physical_address_width,
            root_table: self.root_table(),
            paging_mode_recognized: self.paging_mode() == PagingMode::FourLevel { pcid: false },
            protection_keys_enabled: self.cr4().contains(Cr4Flags::PROTECTION_KEY_USER),
            no_execute_enabled: self.efer().contains(EferFlags::NO_EXECUTE_ENABLE),
        }
    }
}
