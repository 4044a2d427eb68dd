#![cfg_attr(not(any(test, feature = "std")), no_std)]

//! # pagetbl
//!
//! A read-only auditor for x86_64 4-level translation tables. Starting at the root table, it
//! reconstructs every virtual address range the tables describe and reports it together with
//! its permission bits and effective page size. Malformed entries (reserved bits set,
//! non-zero entries without the present bit, misplaced page-size bits) are reported as typed
//! anomalies rather than rejected, since surfacing them is the point of the exercise.
//!
//! The crate never touches hardware by itself:
//!
//! - A [`ConfigProvider`] supplies MAXPHYADDR, the root table and the enabled paging features.
//!   [`RegisterSnapshot`] derives these from raw CR0/CR3/CR4/EFER values.
//! - A [`TableResolver`] turns physical table addresses into readable tables. [`DirectMap`]
//!   does so through a kernel direct map, [`PhysicalImage`] through an in-memory copy.
//!
//! ```
//! use pagetbl::{EntryFlags, PageEntry, PhysicalAddress, PhysicalImage, SystemConfig, walk};
//!
//! let mut image = PhysicalImage::new(PhysicalAddress::new(0), 2 * 4096).unwrap();
//! let root = image.allocate_table().unwrap();
//! let pdpt = image.allocate_table().unwrap();
//! image.write_entry(root, 0, PageEntry::new(pdpt, EntryFlags::PRESENT)).unwrap();
//!
//! let config = SystemConfig {
//!     physical_address_width: 36,
//!     root_table: root,
//!     paging_mode_recognized: true,
//!     protection_keys_enabled: false,
//!     no_execute_enabled: true,
//! };
//! let report = walk(&config, &image);
//! assert_eq!(report.records.len(), 1);
//! assert_eq!(report.records[0].max.as_u64(), 0x7F_FFFF_FFFF);
//! ```

extern crate alloc;

pub mod address;
mod config;
mod entry;
mod human_address;
mod human_size;
mod image;
mod level;
mod record;
mod registers;
mod resolver;
mod walker;

pub use address::{PhysicalAddress, VirtualAddress};
pub use config::{
    ConfigProvider, PagingConfig, PreconditionFailure, SystemConfig, WalkDepth, reserved_mask,
};
pub use entry::{EntryFlags, InvalidReason, PageEntry, Presence, Validity};
pub use human_address::HumanAddress;
pub use human_size::HumanSize;
pub use image::{ImageError, PhysicalImage};
pub use level::{ENTRY_COUNT, LEVELS, LevelDescriptor, PageSize, TableLevel};
pub use record::{
    Anomaly, AnomalyKind, Permissions, RangeRecord, RecordKind, WalkEvent, WalkStatus,
};
pub use registers::{PagingMode, RegisterSnapshot, RegisterWarning};
pub use resolver::{DirectMap, RawTable, TableHandle, TableResolver};
pub use walker::{Reporter, WalkReport, Walker, walk, walk_into};
