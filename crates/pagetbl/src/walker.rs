//! Depth-first traversal of the translation tables.
//!
//! [`Walker`] is an iterator over [`WalkEvent`]s. It keeps one frame per level it has entered
//! (table handle, accumulated base, next slot) and visits slots in ascending order, emitting
//! each present entry before descending into the table it references (pre-order). A frame is
//! dropped as soon as its last slot has been visited, so sibling subtrees never see another
//! subtree's indices or base bits.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use crate::address::{self, OverlappingBits};
use crate::config::{PreconditionFailure, WalkDepth};
use crate::entry::{InvalidReason, Presence, Validity};
use crate::level::{ENTRY_COUNT, PageSize, TableLevel};
use crate::record::{Anomaly, Permissions, RangeRecord, RecordKind, WalkEvent, WalkStatus};
use crate::resolver::{TableHandle, TableResolver};
use crate::{ConfigProvider, PageEntry, PagingConfig, VirtualAddress};

/// Consumes the events of a walk in emission order.
pub trait Reporter {
    fn record(&mut self, record: RangeRecord);
    fn anomaly(&mut self, anomaly: Anomaly);
}

/// The collected result of [`walk`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkReport {
    pub records: Vec<RangeRecord>,
    pub anomalies: Vec<Anomaly>,
    pub status: WalkStatus,
}

impl WalkReport {
    fn new() -> Self {
        Self {
            records: Vec::new(),
            anomalies: Vec::new(),
            status: WalkStatus::Ok,
        }
    }
}

impl Reporter for WalkReport {
    fn record(&mut self, record: RangeRecord) {
        self.records.push(record);
    }

    fn anomaly(&mut self, anomaly: Anomaly) {
        self.anomalies.push(anomaly);
    }
}

/// Walks the tables described by `provider` and collects everything that was found.
pub fn walk<P, R>(provider: &P, resolver: &R) -> WalkReport
where
    P: ConfigProvider + ?Sized,
    R: TableResolver + ?Sized,
{
    let mut report = WalkReport::new();
    let status = walk_into(provider, resolver, WalkDepth::default(), &mut report);
    report.status = status;
    report
}

/// Walks the tables described by `provider` down to `depth`, streaming every event into
/// `reporter` as it is produced.
pub fn walk_into<P, R, S>(provider: &P, resolver: &R, depth: WalkDepth, reporter: &mut S) -> WalkStatus
where
    P: ConfigProvider + ?Sized,
    R: TableResolver + ?Sized,
    S: Reporter + ?Sized,
{
    let mut walker = match Walker::from_provider(provider, resolver, depth) {
        Ok(walker) => walker,
        Err(reason) => return WalkStatus::PreconditionFailed(reason),
    };

    for event in walker.by_ref() {
        match event {
            WalkEvent::Record(record) => reporter.record(record),
            WalkEvent::Anomaly(anomaly) => reporter.anomaly(anomaly),
        }
    }
    walker.status()
}

/// Position of the walk inside one table.
#[derive(Debug, Clone, Copy)]
struct Frame<'r> {
    table: TableHandle<'r>,
    level: TableLevel,
    /// Address bits contributed by all outer levels.
    base: VirtualAddress,
    /// Next slot to visit.
    index: usize,
}

/// Per-walk mutable state: one frame for each level currently entered.
#[derive(Debug)]
struct WalkState<'r> {
    frames: Vec<Frame<'r>>,
}

impl<'r> WalkState<'r> {
    fn new(root: TableHandle<'r>) -> Self {
        let mut frames = Vec::with_capacity(TableLevel::Pt.depth() + 1);
        frames.push(Frame {
            table: root,
            level: TableLevel::ROOT,
            base: VirtualAddress::new(0),
            index: 0,
        });
        Self { frames }
    }

    fn enter(&mut self, table: TableHandle<'r>, level: TableLevel, base: VirtualAddress) {
        debug_assert_eq!(self.frames.len(), level.depth(), "levels must be entered in order");
        self.frames.push(Frame {
            table,
            level,
            base,
            index: 0,
        });
    }

    /// Claims the next slot of the innermost table, leaving every exhausted table first.
    fn next_slot(&mut self) -> Option<(Frame<'r>, usize)> {
        loop {
            let frame = self.frames.last_mut()?;
            if frame.index < ENTRY_COUNT {
                let index = frame.index;
                frame.index += 1;
                return Some((*frame, index));
            }
            self.frames.pop();
        }
    }
}

/// A lazy, restartable walk over one hierarchy.
///
/// Creating a new `Walker` over the same tables replays the same event sequence; no state is
/// shared between walkers.
pub struct Walker<'r, R: TableResolver + ?Sized> {
    config: PagingConfig,
    resolver: &'r R,
    state: WalkState<'r>,
    pending: VecDeque<WalkEvent>,
    failed_branches: usize,
}

impl<'r, R: TableResolver + ?Sized> Walker<'r, R> {
    /// Prepares a walk starting at the root table of `config`.
    ///
    /// # Errors
    ///
    /// Returns [`PreconditionFailure::UnresolvableRootTable`] if the root table cannot be read.
    pub fn new(config: PagingConfig, resolver: &'r R) -> Result<Self, PreconditionFailure> {
        let root = config.root_table();
        let table = resolver
            .resolve(root)
            .ok_or(PreconditionFailure::UnresolvableRootTable(root))?;
        log::debug!(
            "walking tables from {root}, MAXPHYADDR {}, reserved mask {:#x}",
            config.physical_address_width(),
            config.reserved_mask()
        );
        Ok(Self {
            config,
            resolver,
            state: WalkState::new(table),
            pending: VecDeque::new(),
            failed_branches: 0,
        })
    }

    /// Checks the preconditions reported by `provider` and prepares a walk down to `depth`.
    ///
    /// # Errors
    ///
    /// Returns the first failed precondition, after logging it.
    pub fn from_provider<P>(
        provider: &P,
        resolver: &'r R,
        depth: WalkDepth,
    ) -> Result<Self, PreconditionFailure>
    where
        P: ConfigProvider + ?Sized,
    {
        PagingConfig::derive(&provider.system_config())
            .and_then(|config| Self::new(config.with_depth(depth), resolver))
            .inspect_err(|reason| log::warn!("refusing to walk: {reason}"))
    }

    pub fn config(&self) -> &PagingConfig {
        &self.config
    }

    /// Status of the walk so far. Only final once the iterator is exhausted.
    pub fn status(&self) -> WalkStatus {
        if self.failed_branches > 0 {
            WalkStatus::CompletedWithErrors
        } else {
            WalkStatus::Ok
        }
    }

    fn emit_anomaly(&mut self, anomaly: Anomaly) {
        log::warn!("{anomaly}");
        self.pending.push_back(WalkEvent::Anomaly(anomaly));
    }

    /// Processes one slot, queueing its events and entering the table below it if needed.
    fn visit(&mut self, frame: Frame<'r>, index: usize) {
        let level = frame.level;
        let entry = frame.table.read(index);

        match entry.presence() {
            Presence::Absent => return,
            Presence::Anomalous => {
                self.emit_anomaly(Anomaly::AbsentNonZero { level, index, entry });
                return;
            }
            Presence::Present => {}
        }

        let base = self.compose_base(frame, index);
        let max = address::range_max(base, level.bit_offset());

        if let Validity::Invalid(InvalidReason::ReservedBits { bits }) = entry.validate(&self.config) {
            self.emit_anomaly(Anomaly::ReservedBits {
                level,
                index,
                entry,
                base,
                bits,
            });
        }

        let terminal = self.classify(level, index, entry, base);
        let maps_page = matches!(terminal, Terminal::Page(_));
        let protection_key =
            (maps_page && self.config.protection_keys_enabled()).then(|| entry.protection_key());

        let resolver = self.resolver;
        let mut descend = None;
        let kind = match terminal {
            Terminal::Page(size) => RecordKind::Page(size),
            Terminal::DepthLimit(size) => RecordKind::DepthLimit(size),
            Terminal::Descend(next) => {
                // Present entries always carry an address.
                let table = entry.address().unwrap_or_default();
                match resolver.resolve(table) {
                    Some(handle) => {
                        descend = Some((handle, next));
                        RecordKind::Table(table)
                    }
                    None => RecordKind::Unresolved(table),
                }
            }
        };

        self.push_record(RangeRecord {
            level,
            index,
            entry,
            base,
            max,
            permissions: Permissions::from_entry(entry, &self.config, maps_page),
            protection_key,
            kind,
        });

        if let RecordKind::Unresolved(table) = kind {
            self.failed_branches += 1;
            self.emit_anomaly(Anomaly::UnresolvableTable {
                level,
                index,
                entry,
                base,
                table,
            });
        }

        if let Some((handle, next)) = descend {
            self.state.enter(handle, next, base);
        }
    }

    fn push_record(&mut self, record: RangeRecord) {
        log::trace!("{record}");
        self.pending.push_back(WalkEvent::Record(record));
    }

    /// Builds the base address of slot `index` in `frame`.
    fn compose_base(&mut self, frame: Frame<'r>, index: usize) -> VirtualAddress {
        let level = frame.level;
        let contribution = address::contribution(index, level.bit_offset());
        let base = match address::compose(frame.base, contribution) {
            Ok(base) => base,
            Err(overlap) => {
                if cfg!(debug_assertions) {
                    panic!("{level}[{index}]: {overlap}");
                }
                self.emit_anomaly(Anomaly::OverlappingContribution { level, index, overlap });
                overlapping_or(overlap)
            }
        };
        if level.is_root() {
            VirtualAddress::new(address::canonicalize(base.as_u64()))
        } else {
            base
        }
    }

    /// Decides whether a present entry ends the walk or references another table.
    fn classify(
        &mut self,
        level: TableLevel,
        index: usize,
        entry: PageEntry,
        base: VirtualAddress,
    ) -> Terminal {
        let descriptor = level.descriptor();

        if entry.is_huge() && descriptor.huge_page_eligible {
            if let Some(size) = descriptor.page_size {
                return Terminal::Page(size);
            }
        }

        let Some(next) = level.next() else {
            return Terminal::Page(PageSize::Size4KiB);
        };

        if entry.is_huge() {
            self.emit_anomaly(Anomaly::IllegalHugePage {
                level,
                index,
                entry,
                base,
            });
        }

        if next == TableLevel::Pt && self.config.depth() == WalkDepth::ThreeLevel {
            return Terminal::DepthLimit(descriptor.page_size.unwrap_or(PageSize::Size2MiB));
        }

        Terminal::Descend(next)
    }
}

impl<R: TableResolver + ?Sized> Iterator for Walker<'_, R> {
    type Item = WalkEvent;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            let (frame, index) = self.state.next_slot()?;
            self.visit(frame, index);
        }
    }
}

/// What a present entry means for the walk.
enum Terminal {
    Page(PageSize),
    DepthLimit(PageSize),
    Descend(TableLevel),
}

/// Falls back to the plain OR when composition failed, so the walk can go on in release
/// builds.
fn overlapping_or(overlap: OverlappingBits) -> VirtualAddress {
    VirtualAddress::new(overlap.outer.as_u64() | overlap.contribution)
}
