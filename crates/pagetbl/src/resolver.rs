//! Turning physical table addresses into something the walker can read.

use crate::address::TABLE_SIZE;
use crate::level::ENTRY_COUNT;
use crate::{PageEntry, PhysicalAddress};

/// The in-memory layout of one translation table.
pub type RawTable = [u64; ENTRY_COUNT];

/// A readable view of one table.
///
/// Entries are read with volatile loads because the tables may belong to a live address space
/// that is being modified concurrently. No locking is done; a torn view is accepted.
#[derive(Clone, Copy)]
pub struct TableHandle<'a> {
    entries: &'a RawTable,
}

impl<'a> TableHandle<'a> {
    pub const fn new(entries: &'a RawTable) -> Self {
        Self { entries }
    }

    /// Reads the entry in slot `index`.
    ///
    /// # Panics
    /// Panics if index >= 512.
    #[inline]
    pub fn read(&self, index: usize) -> PageEntry {
        let slot = &self.entries[index];
        // SAFETY: `slot` is a valid, aligned reference for the lifetime of the handle.
        PageEntry::decode(unsafe { core::ptr::read_volatile(slot) })
    }

    /// Returns the number of entries in the table.
    pub const fn len(&self) -> usize {
        ENTRY_COUNT
    }
}

impl core::fmt::Debug for TableHandle<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TableHandle")
            .field("entries", &self.entries.as_ptr())
            .finish()
    }
}

/// Translates a physical table address into a [`TableHandle`].
///
/// Returns None when the address is not 4 KiB aligned or cannot be made readable locally.
pub trait TableResolver {
    fn resolve(&self, table: PhysicalAddress) -> Option<TableHandle<'_>>;
}

impl<T: TableResolver + ?Sized> TableResolver for &T {
    fn resolve(&self, table: PhysicalAddress) -> Option<TableHandle<'_>> {
        (**self).resolve(table)
    }
}

/// Resolves tables through a linear mapping of physical memory at a fixed virtual offset,
/// such as the higher-half direct map a kernel keeps.
#[derive(Debug, Clone, Copy)]
pub struct DirectMap {
    offset: u64,
    limit: PhysicalAddress,
}

impl DirectMap {
    /// Creates a resolver for physical memory `[0, limit)` mapped at `offset`.
    ///
    /// # Safety
    ///
    /// Every address `offset + p` for `p < limit` must be mapped, readable, and stay so for as
    /// long as the resolver or any handle it returns is alive.
    pub const unsafe fn new(offset: u64, limit: PhysicalAddress) -> Self {
        Self { offset, limit }
    }

    /// Returns the virtual address `phys` is reachable at, if it lies inside the mapping.
    pub fn translate(&self, phys: PhysicalAddress) -> Option<u64> {
        let end = phys.as_u64().checked_add(TABLE_SIZE)?;
        if end > self.limit.as_u64() {
            return None;
        }
        Some(phys.as_u64().wrapping_add(self.offset))
    }
}

impl TableResolver for DirectMap {
    fn resolve(&self, table: PhysicalAddress) -> Option<TableHandle<'_>> {
        if !table.is_aligned(TABLE_SIZE) {
            return None;
        }
        let virt = usize::try_from(self.translate(table)?).ok()?;
        let ptr = virt as *const RawTable;
        if ptr.is_null() {
            return None;
        }
        // SAFETY: The constructor's contract guarantees the whole table is mapped and readable
        // and the address is 4 KiB aligned, which satisfies the alignment of `RawTable`.
        Some(TableHandle::new(unsafe { &*ptr }))
    }
}
