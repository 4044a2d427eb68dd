//! Address types and the arithmetic that rebuilds virtual addresses from table positions.
//!
//! A translation-table walk never sees a virtual address directly. Every level owns exactly
//! nine consecutive address bits, and the address an entry maps is recovered by OR-ing the
//! slot index of each level on the path into its bit range. The top level additionally
//! sign-extends bit 47 into bits 63:48 so that every reported address is canonical.

use core::fmt;

/// Number of virtual-address bits owned by a single table level (512 slots).
pub const BITS_PER_LEVEL: u32 = 9;

/// Highest implemented bit of a 48-bit virtual address.
pub const CANONICAL_SIGN_BIT: u64 = 1 << 47;

/// Bits 63:48, the sign-extension of [`CANONICAL_SIGN_BIT`].
pub const CANONICAL_EXTENSION: u64 = 0xFFFF << 48;

/// Size of a translation table and the alignment every table must have.
pub const TABLE_SIZE: u64 = 4096;

/// Defines the parts shared by the physical and virtual address types.
macro_rules! impl_address_common {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Creates an address from its raw value.
            #[inline]
            pub const fn new(addr: u64) -> Self {
                Self(addr)
            }

            /// Returns the raw address value.
            #[inline]
            pub const fn as_u64(self) -> u64 {
                self.0
            }

            /// Checks if the address is aligned to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn is_aligned(self, align: u64) -> bool {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                self.0 & (align - 1) == 0
            }

            /// Aligns the address down to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn align_down(self, align: u64) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self(self.0 & !(align - 1))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#x})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", $crate::HumanAddress(self.0))
            }
        }

        impl From<u64> for $name {
            #[inline]
            fn from(addr: u64) -> Self {
                Self::new(addr)
            }
        }

        impl From<$name> for u64 {
            #[inline]
            fn from(addr: $name) -> Self {
                addr.0
            }
        }
    };
}

impl_address_common!(
    PhysicalAddress,
    "A physical memory address, as stored in CR3 or in a table entry.\n\n\
     No width validation happens on construction: the auditor has to be able to hold\n\
     exactly the malformed values it is meant to report."
);

impl_address_common!(
    VirtualAddress,
    "A virtual address reconstructed from a position in the table hierarchy."
);

impl PhysicalAddress {
    /// Returns true if no bit at or above `width` is set.
    #[inline]
    pub const fn fits_width(self, width: u8) -> bool {
        width >= 64 || self.0 >> width == 0
    }
}

impl VirtualAddress {
    /// Returns true if bits 63:48 are copies of bit 47.
    #[inline]
    pub const fn is_canonical(self) -> bool {
        canonicalize(self.0 & !CANONICAL_EXTENSION) == self.0
    }

    /// Returns true if the address belongs to the upper (negative) canonical half.
    #[inline]
    pub const fn is_upper_half(self) -> bool {
        self.0 & CANONICAL_SIGN_BIT != 0
    }
}

/// Two levels claimed the same address bit while composing a base address.
///
/// Levels partition the address by construction, so seeing this means the walker itself is
/// broken rather than the tables it inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverlappingBits {
    pub outer: VirtualAddress,
    pub contribution: u64,
}

impl OverlappingBits {
    /// The bits both operands had set.
    pub const fn shared(&self) -> u64 {
        self.outer.as_u64() & self.contribution
    }
}

impl fmt::Display for OverlappingBits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "contribution {:#x} overlaps outer base {} (shared bits {:#x})",
            self.contribution,
            self.outer,
            self.shared()
        )
    }
}

impl core::error::Error for OverlappingBits {}

/// Shifts a slot index into the nine address bits owned by the level at `bit_offset`.
///
/// Only the low nine bits of `index` are used.
#[inline]
pub const fn contribution(index: usize, bit_offset: u32) -> u64 {
    ((index as u64) & ((1 << BITS_PER_LEVEL) - 1)) << bit_offset
}

/// Combines the base accumulated by the outer levels with one level's contribution.
///
/// The result is always the bitwise OR of the operands. An error is returned when they share
/// a set bit, but the OR is still available through [`OverlappingBits`] for callers that
/// want to continue.
#[inline]
pub const fn compose(outer: VirtualAddress, contribution: u64) -> Result<VirtualAddress, OverlappingBits> {
    if outer.as_u64() & contribution != 0 {
        return Err(OverlappingBits { outer, contribution });
    }
    Ok(VirtualAddress::new(outer.as_u64() | contribution))
}

/// Sign-extends bit 47 into bits 63:48.
///
/// Addresses with bit 47 clear are returned unchanged; this never clears bits.
#[inline]
pub const fn canonicalize(addr: u64) -> u64 {
    if addr & CANONICAL_SIGN_BIT != 0 {
        addr | CANONICAL_EXTENSION
    } else {
        addr
    }
}

/// Returns the highest address covered by an entry whose base is `base` at `bit_offset`.
#[inline]
pub const fn range_max(base: VirtualAddress, bit_offset: u32) -> VirtualAddress {
    VirtualAddress::new(base.as_u64() | ((1u64 << bit_offset) - 1))
}
