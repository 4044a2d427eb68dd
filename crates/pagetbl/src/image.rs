//! An in-memory stand-in for a physical address space.
//!
//! `PhysicalImage` holds a contiguous window of physical memory starting at some base address.
//! It can be loaded from a raw dump (for offline audits) or built up table by table (for
//! tests), and it resolves table addresses that fall inside the window.

use alloc::vec::Vec;
use core::fmt;

use crate::address::TABLE_SIZE;
use crate::level::ENTRY_COUNT;
use crate::resolver::{RawTable, TableHandle, TableResolver};
use crate::{PageEntry, PhysicalAddress};

const WORD_SIZE: usize = core::mem::size_of::<u64>();

/// Errors raised while building or loading a [`PhysicalImage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageError {
    /// The image base is not 4 KiB aligned.
    MisalignedBase(PhysicalAddress),
    /// The dump length is not a whole number of 8-byte words.
    TruncatedWord { len: usize },
    /// An address outside of the image was written.
    OutOfBounds(PhysicalAddress),
    /// A table index of 512 or more was used.
    InvalidIndex(usize),
    /// No space left for another table.
    Exhausted,
    /// A window of `size` bytes at `base` would extend past the top of the physical address
    /// space.
    AddressOverflow { base: PhysicalAddress, size: usize },
}

impl fmt::Display for ImageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MisalignedBase(base) => write!(f, "image base {base} is not 4KiB aligned"),
            Self::TruncatedWord { len } => {
                write!(f, "image length {len} is not a multiple of {WORD_SIZE} bytes")
            }
            Self::OutOfBounds(addr) => write!(f, "address {addr} lies outside of the image"),
            Self::InvalidIndex(index) => {
                write!(f, "table index {index} is out of range (0..{ENTRY_COUNT})")
            }
            Self::Exhausted => write!(f, "no room left in the image for another table"),
            Self::AddressOverflow { base, size } => {
                write!(f, "an image of {size} bytes at {base} overflows the address space")
            }
        }
    }
}

impl core::error::Error for ImageError {}

/// A window of physical memory held as 64-bit words.
pub struct PhysicalImage {
    base: PhysicalAddress,
    words: Vec<u64>,
    /// Byte offset of the next table handed out by [`allocate_table`](Self::allocate_table).
    next_alloc: usize,
}

impl PhysicalImage {
    /// Creates a zeroed image of `size` bytes (rounded up to whole tables) at `base`.
    ///
    /// # Errors
    ///
    /// Returns [`ImageError::MisalignedBase`] if `base` is not 4 KiB aligned, and
    /// [`ImageError::AddressOverflow`] if the image would reach past the last physical address.
    pub fn new(base: PhysicalAddress, size: usize) -> Result<Self, ImageError> {
        let tables = size.div_ceil(TABLE_SIZE as usize);
        let rounded = tables
            .checked_mul(TABLE_SIZE as usize)
            .ok_or(ImageError::AddressOverflow { base, size })?;
        check_window(base, rounded)?;
        Ok(Self {
            base,
            words: alloc::vec![0; tables * ENTRY_COUNT],
            next_alloc: 0,
        })
    }

    /// Loads a little-endian memory dump whose first byte lives at `base`.
    ///
    /// # Errors
    ///
    /// Returns an error if `base` is misaligned, `bytes` does not hold whole words, or the
    /// dump would reach past the last physical address.
    pub fn from_bytes(base: PhysicalAddress, bytes: &[u8]) -> Result<Self, ImageError> {
        check_window(base, bytes.len())?;
        if bytes.len() % WORD_SIZE != 0 {
            return Err(ImageError::TruncatedWord { len: bytes.len() });
        }
        let words = bytes
            .chunks_exact(WORD_SIZE)
            .map(|chunk| {
                let mut word = [0u8; WORD_SIZE];
                word.copy_from_slice(chunk);
                u64::from_le_bytes(word)
            })
            .collect::<Vec<_>>();
        let next_alloc = words.len() * WORD_SIZE;
        Ok(Self {
            base,
            words,
            next_alloc,
        })
    }

    /// Physical address of the first byte.
    pub const fn base(&self) -> PhysicalAddress {
        self.base
    }

    /// Size of the image in bytes.
    pub fn size(&self) -> usize {
        self.words.len() * WORD_SIZE
    }

    /// Physical address one past the last byte.
    pub fn end(&self) -> PhysicalAddress {
        // The window was checked against overflow on construction.
        PhysicalAddress::new(self.base.as_u64().wrapping_add(self.size() as u64))
    }

    /// Hands out the next unused, zeroed, 4 KiB aligned table.
    ///
    /// # Errors
    ///
    /// Returns [`ImageError::Exhausted`] once the image is full.
    pub fn allocate_table(&mut self) -> Result<PhysicalAddress, ImageError> {
        let offset = self.next_alloc.next_multiple_of(TABLE_SIZE as usize);
        let end = offset
            .checked_add(TABLE_SIZE as usize)
            .filter(|&end| end <= self.size())
            .ok_or(ImageError::Exhausted)?;
        let table = self
            .base
            .as_u64()
            .checked_add(offset as u64)
            .ok_or(ImageError::Exhausted)?;
        self.next_alloc = end;
        Ok(PhysicalAddress::new(table))
    }

    /// Stores `entry` in slot `index` of the table at `table`.
    ///
    /// # Errors
    ///
    /// Returns an error if `index` is out of range or the slot lies outside of the image.
    pub fn write_entry(
        &mut self,
        table: PhysicalAddress,
        index: usize,
        entry: PageEntry,
    ) -> Result<(), ImageError> {
        if index >= ENTRY_COUNT {
            return Err(ImageError::InvalidIndex(index));
        }
        let slot = table
            .as_u64()
            .checked_add((index * WORD_SIZE) as u64)
            .map(PhysicalAddress::new)
            .ok_or(ImageError::OutOfBounds(table))?;
        let word = self.word_index(slot).ok_or(ImageError::OutOfBounds(slot))?;
        self.words[word] = entry.as_u64();
        Ok(())
    }

    /// Reads the 64-bit word at `addr`, which must be 8-byte aligned.
    pub fn read_u64(&self, addr: PhysicalAddress) -> Option<u64> {
        self.word_index(addr).map(|word| self.words[word])
    }

    fn word_index(&self, addr: PhysicalAddress) -> Option<usize> {
        if !addr.is_aligned(WORD_SIZE as u64) {
            return None;
        }
        let offset = addr.as_u64().checked_sub(self.base.as_u64())?;
        let word = usize::try_from(offset).ok()? / WORD_SIZE;
        (word < self.words.len()).then_some(word)
    }
}

/// Checks that `size` bytes starting at `base` form an aligned window whose end is still a
/// representable physical address.
fn check_window(base: PhysicalAddress, size: usize) -> Result<(), ImageError> {
    if !base.is_aligned(TABLE_SIZE) {
        return Err(ImageError::MisalignedBase(base));
    }
    u64::try_from(size)
        .ok()
        .and_then(|len| base.as_u64().checked_add(len))
        .map(|_| ())
        .ok_or(ImageError::AddressOverflow { base, size })
}

impl TableResolver for PhysicalImage {
    fn resolve(&self, table: PhysicalAddress) -> Option<TableHandle<'_>> {
        if !table.is_aligned(TABLE_SIZE) {
            return None;
        }
        let first = self.word_index(table)?;
        let slice = self.words.get(first..first + ENTRY_COUNT)?;
        let entries: &RawTable = slice.try_into().ok()?;
        Some(TableHandle::new(entries))
    }
}

impl fmt::Debug for PhysicalImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhysicalImage")
            .field("base", &self.base)
            .field("size", &self.size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EntryFlags;

    #[test]
    fn allocates_consecutive_tables() {
        let mut image = PhysicalImage::new(PhysicalAddress::new(0x10_0000), 3 * 4096).unwrap();
        assert_eq!(image.allocate_table(), Ok(PhysicalAddress::new(0x10_0000)));
        assert_eq!(image.allocate_table(), Ok(PhysicalAddress::new(0x10_1000)));
        assert_eq!(image.allocate_table(), Ok(PhysicalAddress::new(0x10_2000)));
        assert_eq!(image.allocate_table(), Err(ImageError::Exhausted));
    }

    #[test]
    fn size_is_rounded_to_tables() {
        let image = PhysicalImage::new(PhysicalAddress::new(0), 100).unwrap();
        assert_eq!(image.size(), 4096);
        assert_eq!(image.end(), PhysicalAddress::new(4096));
    }

    #[test]
    fn rejects_misaligned_base() {
        assert_eq!(
            PhysicalImage::new(PhysicalAddress::new(0x10), 4096).unwrap_err(),
            ImageError::MisalignedBase(PhysicalAddress::new(0x10))
        );
    }

    #[test]
    fn rejects_windows_past_the_top_of_memory() {
        let top = PhysicalAddress::new(0xFFFF_FFFF_FFFF_F000);
        assert_eq!(
            PhysicalImage::from_bytes(top, &[0u8; 4096]).unwrap_err(),
            ImageError::AddressOverflow { base: top, size: 4096 }
        );
        assert_eq!(
            PhysicalImage::new(top, 8192).unwrap_err(),
            ImageError::AddressOverflow { base: top, size: 8192 }
        );
    }

    #[test]
    fn window_ending_just_below_the_top_is_usable() {
        let base = PhysicalAddress::new(0xFFFF_FFFF_FFFF_D000);
        let mut image = PhysicalImage::new(base, 2 * 4096).unwrap();
        assert_eq!(image.end(), PhysicalAddress::new(0xFFFF_FFFF_FFFF_F000));
        assert_eq!(image.allocate_table(), Ok(base));
        let last = image.allocate_table().unwrap();
        assert_eq!(last, PhysicalAddress::new(0xFFFF_FFFF_FFFF_E000));
        assert_eq!(image.allocate_table(), Err(ImageError::Exhausted));

        image.write_entry(last, 511, PageEntry::decode(0x1003)).unwrap();
        assert_eq!(image.resolve(last).unwrap().read(511).as_u64(), 0x1003);
        let near_top = PhysicalAddress::new(u64::MAX - 7);
        assert_eq!(
            image.write_entry(near_top, 1, PageEntry::default()),
            Err(ImageError::OutOfBounds(near_top))
        );
    }

    #[test]
    fn written_entries_are_resolvable() {
        let mut image = PhysicalImage::new(PhysicalAddress::new(0x2000), 2 * 4096).unwrap();
        let root = image.allocate_table().unwrap();
        let entry = PageEntry::new(PhysicalAddress::new(0x3000), EntryFlags::PRESENT);
        image.write_entry(root, 511, entry).unwrap();

        let handle = image.resolve(root).unwrap();
        assert_eq!(handle.read(511), entry);
        assert_eq!(image.read_u64(PhysicalAddress::new(0x2000 + 511 * 8)), Some(entry.as_u64()));
    }

    #[test]
    fn rejects_bad_writes() {
        let mut image = PhysicalImage::new(PhysicalAddress::new(0), 4096).unwrap();
        assert_eq!(
            image.write_entry(PhysicalAddress::new(0), 512, PageEntry::default()),
            Err(ImageError::InvalidIndex(512))
        );
        assert_eq!(
            image.write_entry(PhysicalAddress::new(0x1000), 0, PageEntry::default()),
            Err(ImageError::OutOfBounds(PhysicalAddress::new(0x1000)))
        );
    }

    #[test]
    fn resolve_rejects_tables_outside_or_misaligned() {
        let image = PhysicalImage::new(PhysicalAddress::new(0x1000), 4096).unwrap();
        assert!(image.resolve(PhysicalAddress::new(0x1000)).is_some());
        assert!(image.resolve(PhysicalAddress::new(0x0)).is_none());
        assert!(image.resolve(PhysicalAddress::new(0x2000)).is_none());
        assert!(image.resolve(PhysicalAddress::new(0x1008)).is_none());
    }

    #[test]
    fn loads_little_endian_dump() {
        let mut bytes = vec![0u8; 4096];
        bytes[8..16].copy_from_slice(&0x0000_0000_0000_5003u64.to_le_bytes());
        let image = PhysicalImage::from_bytes(PhysicalAddress::new(0x8000), &bytes).unwrap();
        let handle = image.resolve(PhysicalAddress::new(0x8000)).unwrap();
        assert_eq!(handle.read(1).as_u64(), 0x5003);
    }

    #[test]
    fn rejects_partial_words() {
        assert_eq!(
            PhysicalImage::from_bytes(PhysicalAddress::new(0), &[0u8; 12]).unwrap_err(),
            ImageError::TruncatedWord { len: 12 }
        );
    }
}
