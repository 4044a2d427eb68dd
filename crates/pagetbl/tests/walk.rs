use pagetbl::{
    Anomaly, AnomalyKind, EntryFlags, PageEntry, PageSize, Permissions, PhysicalAddress,
    PhysicalImage, PreconditionFailure, RangeRecord, RecordKind, Reporter, SystemConfig,
    TableLevel, WalkDepth, WalkEvent, WalkStatus, Walker, walk, walk_into,
};

const TABLE: usize = 4096;

fn system(root: PhysicalAddress, width: u8) -> SystemConfig {
    SystemConfig {
        physical_address_width: width,
        root_table: root,
        paging_mode_recognized: true,
        protection_keys_enabled: false,
        no_execute_enabled: true,
    }
}

fn table_entry(table: PhysicalAddress) -> PageEntry {
    PageEntry::new(table, EntryFlags::PRESENT)
}

/// Root table, one PDPT and one PD, with `root[0] -> pdpt` and `pdpt[0] -> pd`.
fn three_tables() -> (PhysicalImage, PhysicalAddress, PhysicalAddress, PhysicalAddress) {
    let mut image = PhysicalImage::new(PhysicalAddress::new(0x10_0000), 8 * TABLE).unwrap();
    let root = image.allocate_table().unwrap();
    let pdpt = image.allocate_table().unwrap();
    let pd = image.allocate_table().unwrap();
    image.write_entry(root, 0, table_entry(pdpt)).unwrap();
    image.write_entry(pdpt, 0, table_entry(pd)).unwrap();
    (image, root, pdpt, pd)
}

fn summary(record: &RangeRecord) -> (TableLevel, u64, u64) {
    (record.level, record.base.as_u64(), record.max.as_u64())
}

#[test]
fn end_to_end_three_levels() {
    let (mut image, root, _, pd) = three_tables();
    image
        .write_entry(
            pd,
            3,
            PageEntry::new(
                PhysicalAddress::new(0x4000_0000),
                EntryFlags::PRESENT | EntryFlags::HUGE_PAGE | EntryFlags::WRITABLE | EntryFlags::USER,
            ),
        )
        .unwrap();

    let report = walk(&system(root, 36), &image);

    assert_eq!(report.status, WalkStatus::Ok);
    assert!(report.anomalies.is_empty());
    assert_eq!(
        report.records.iter().map(summary).collect::<Vec<_>>(),
        vec![
            (TableLevel::Pml4, 0, 0x7F_FFFF_FFFF),
            (TableLevel::Pdpt, 0, 0x3FFF_FFFF),
            (TableLevel::Pd, 0x60_0000, 0x7F_FFFF),
        ]
    );
    let page = &report.records[2];
    assert_eq!(page.label(), "PD");
    assert_eq!(page.kind, RecordKind::Page(PageSize::Size2MiB));
    assert_eq!(page.permissions, Permissions::WRITABLE | Permissions::USER);
    assert!(report.records[0].descended());
    assert!(report.records[1].descended());
}

#[test]
fn absent_zero_entries_are_silent() {
    let (image, root, _, _) = three_tables();
    let report = walk(&system(root, 36), &image);
    assert_eq!(report.records.len(), 2);
    assert!(report.anomalies.is_empty());
}

#[test]
fn absent_non_zero_entries_raise_one_anomaly_and_no_record() {
    let (mut image, root, pdpt, _) = three_tables();
    image.write_entry(pdpt, 7, PageEntry::decode(0xDEAD_B000)).unwrap();

    let report = walk(&system(root, 36), &image);

    assert_eq!(report.records.len(), 2);
    assert_eq!(
        report.anomalies,
        vec![Anomaly::AbsentNonZero {
            level: TableLevel::Pdpt,
            index: 7,
            entry: PageEntry::decode(0xDEAD_B000),
        }]
    );
    assert_eq!(report.status, WalkStatus::Ok);
}

#[test]
fn reserved_bits_raise_one_anomaly_and_keep_the_record() {
    let (mut image, root, _, pd) = three_tables();
    let raw = (1u64 << 40) | 0x20_0000 | (EntryFlags::PRESENT | EntryFlags::HUGE_PAGE).bits();
    image.write_entry(pd, 1, PageEntry::decode(raw)).unwrap();

    let report = walk(&system(root, 36), &image);

    assert_eq!(report.anomalies.len(), 1);
    assert_eq!(report.anomalies[0].kind(), AnomalyKind::ReservedBitViolation);
    assert!(matches!(
        report.anomalies[0],
        Anomaly::ReservedBits { level: TableLevel::Pd, index: 1, bits, .. } if bits == 1 << 40
    ));
    let record = report.records.last().unwrap();
    assert_eq!(record.entry.as_u64(), raw);
    assert_eq!(record.base.as_u64(), 0x20_0000);
}

#[test]
fn full_width_never_reports_reserved_bits() {
    let (mut image, root, _, pd) = three_tables();
    let raw = 0x000F_FFFF_FFE0_0000 | (EntryFlags::PRESENT | EntryFlags::HUGE_PAGE).bits();
    image.write_entry(pd, 9, PageEntry::decode(raw)).unwrap();

    let report = walk(&system(root, 52), &image);

    assert!(
        report
            .anomalies
            .iter()
            .all(|anomaly| anomaly.kind() != AnomalyKind::ReservedBitViolation)
    );
    assert_eq!(report.records.len(), 3);
}

#[test]
fn one_gib_page_ends_its_branch() {
    let (mut image, root, pdpt, pd) = three_tables();
    image
        .write_entry(
            pd,
            0,
            PageEntry::new(
                PhysicalAddress::new(0x20_0000),
                EntryFlags::PRESENT | EntryFlags::HUGE_PAGE,
            ),
        )
        .unwrap();
    // Points at a populated directory, but PS makes it a page.
    image
        .write_entry(
            pdpt,
            1,
            PageEntry::new(pd, EntryFlags::PRESENT | EntryFlags::HUGE_PAGE),
        )
        .unwrap();

    let report = walk(&system(root, 36), &image);

    assert!(report.anomalies.is_empty());
    let huge = report.records.last().unwrap();
    assert_eq!((huge.level, huge.index), (TableLevel::Pdpt, 1));
    assert_eq!(huge.kind, RecordKind::Page(PageSize::Size1GiB));
    assert_eq!(huge.len(), 1 << 30);
    assert_eq!(huge.base.as_u64(), 0x4000_0000);
    let directories = report
        .records
        .iter()
        .filter(|record| record.level == TableLevel::Pd)
        .collect::<Vec<_>>();
    assert_eq!(directories.len(), 1);
    assert!(!huge.contains(directories[0].base));
}

#[test]
fn records_cover_exactly_their_level() {
    let (mut image, root, pdpt, pd) = three_tables();
    image.write_entry(root, 256, table_entry(pdpt)).unwrap();
    image.write_entry(root, 511, table_entry(pdpt)).unwrap();
    image.write_entry(pdpt, 300, table_entry(pd)).unwrap();
    for index in [0, 17, 511] {
        image
            .write_entry(
                pd,
                index,
                PageEntry::new(
                    PhysicalAddress::new(0x20_0000),
                    EntryFlags::PRESENT | EntryFlags::HUGE_PAGE,
                ),
            )
            .unwrap();
    }

    let report = walk(&system(root, 36), &image);

    assert!(!report.records.is_empty());
    for record in &report.records {
        let offset = record.level.bit_offset();
        assert!(record.base <= record.max);
        assert_eq!(record.max.as_u64(), record.base.as_u64() | ((1 << offset) - 1));
        assert!(record.base.is_canonical());
        assert!(record.max.is_canonical());
    }
}

#[test]
fn upper_half_is_sign_extended() {
    let (mut image, root, pdpt, _) = three_tables();
    image.write_entry(root, 255, table_entry(pdpt)).unwrap();
    image.write_entry(root, 256, table_entry(pdpt)).unwrap();

    let report = walk(&system(root, 36), &image);
    let top = report
        .records
        .iter()
        .filter(|record| record.level == TableLevel::Pml4)
        .map(summary)
        .collect::<Vec<_>>();

    assert_eq!(
        top,
        vec![
            (TableLevel::Pml4, 0, 0x0000_007F_FFFF_FFFF),
            (TableLevel::Pml4, 0x0000_7F80_0000_0000, 0x0000_7FFF_FFFF_FFFF),
            (TableLevel::Pml4, 0xFFFF_8000_0000_0000, 0xFFFF_807F_FFFF_FFFF),
        ]
    );

    // Inner levels inherit the sign extension.
    let nested = report
        .records
        .iter()
        .filter(|record| record.level == TableLevel::Pdpt)
        .map(|record| record.base.as_u64())
        .collect::<Vec<_>>();
    assert_eq!(nested, vec![0, 0x0000_7F80_0000_0000, 0xFFFF_8000_0000_0000]);
}

#[test]
fn unresolvable_branch_is_skipped_and_siblings_continue() {
    let (mut image, root, pdpt, pd) = three_tables();
    let missing = PhysicalAddress::new(0x7000_0000);
    image.write_entry(pdpt, 1, table_entry(missing)).unwrap();
    image.write_entry(pdpt, 2, table_entry(pd)).unwrap();

    let report = walk(&system(root, 36), &image);

    assert_eq!(report.status, WalkStatus::CompletedWithErrors);
    assert_eq!(report.anomalies.len(), 1);
    assert!(report.anomalies[0].is_branch_failure());
    assert!(matches!(
        report.anomalies[0],
        Anomaly::UnresolvableTable { level: TableLevel::Pdpt, index: 1, table, .. } if table == missing
    ));

    let pdpt_records = report
        .records
        .iter()
        .filter(|record| record.level == TableLevel::Pdpt)
        .map(|record| (record.index, record.kind))
        .collect::<Vec<_>>();
    assert_eq!(
        pdpt_records,
        vec![
            (0, RecordKind::Table(pd)),
            (1, RecordKind::Unresolved(missing)),
            (2, RecordKind::Table(pd)),
        ]
    );
}

#[test]
fn unrecognized_paging_mode_produces_nothing() {
    let (image, root, _, _) = three_tables();
    let mut system = system(root, 36);
    system.paging_mode_recognized = false;

    let report = walk(&system, &image);

    assert_eq!(
        report.status,
        WalkStatus::PreconditionFailed(PreconditionFailure::UnrecognizedPagingMode)
    );
    assert!(report.records.is_empty());
    assert!(report.anomalies.is_empty());
}

#[test]
fn repeated_walks_are_identical() {
    let (mut image, root, pdpt, pd) = three_tables();
    image.write_entry(pdpt, 4, PageEntry::decode(0x54)).unwrap();
    image
        .write_entry(pd, 8, PageEntry::decode((1 << 45) | 0x1000_0000 | 0x83))
        .unwrap();

    let first = walk(&system(root, 36), &image);
    let second = walk(&system(root, 36), &image);

    assert_eq!(first, second);
    assert_eq!(first.anomalies.len(), 2);
}

#[test]
fn three_level_walk_stops_at_page_directories() {
    let (mut image, root, _, pd) = three_tables();
    let pt = image.allocate_table().unwrap();
    image.write_entry(pd, 2, table_entry(pt)).unwrap();
    image
        .write_entry(pt, 0, PageEntry::new(PhysicalAddress::new(0x5000), EntryFlags::PRESENT))
        .unwrap();

    let report = walk(&system(root, 36), &image);

    let last = report.records.last().unwrap();
    assert_eq!(last.level, TableLevel::Pd);
    assert_eq!(last.kind, RecordKind::DepthLimit(PageSize::Size2MiB));
    assert_eq!(last.page_size(), Some(PageSize::Size2MiB));
    assert!(report.records.iter().all(|record| record.level != TableLevel::Pt));
}

#[test]
fn four_level_walk_reports_small_pages() {
    let (mut image, root, _, pd) = three_tables();
    let pt = image.allocate_table().unwrap();
    image.write_entry(pd, 2, table_entry(pt)).unwrap();
    // Bit 7 is PAT in a page-table entry, not a size bit.
    image
        .write_entry(
            pt,
            5,
            PageEntry::new(
                PhysicalAddress::new(0x5000),
                EntryFlags::PRESENT | EntryFlags::HUGE_PAGE | EntryFlags::DIRTY,
            ),
        )
        .unwrap();

    let mut report = pagetbl::WalkReport {
        records: Vec::new(),
        anomalies: Vec::new(),
        status: WalkStatus::Ok,
    };
    let status = walk_into(&system(root, 36), &image, WalkDepth::FourLevel, &mut report);

    assert_eq!(status, WalkStatus::Ok);
    assert!(report.anomalies.is_empty());
    let leaf = report.records.last().unwrap();
    assert_eq!(leaf.level, TableLevel::Pt);
    assert_eq!(leaf.kind, RecordKind::Page(PageSize::Size4KiB));
    assert_eq!(leaf.base.as_u64(), (2 << 21) | (5 << 12));
    assert_eq!(leaf.len(), 4096);
    assert!(leaf.permissions.contains(Permissions::DIRTY));
}

#[derive(Default)]
struct Ordered(Vec<String>);

impl Reporter for Ordered {
    fn record(&mut self, record: RangeRecord) {
        self.0.push(format!("record {}[{}]", record.level, record.index));
    }

    fn anomaly(&mut self, anomaly: Anomaly) {
        self.0.push(format!("anomaly {}[{}]", anomaly.level(), anomaly.index()));
    }
}

#[test]
fn reporter_sees_events_in_walk_order() {
    let (mut image, root, pdpt, _) = three_tables();
    image.write_entry(pdpt, 3, PageEntry::decode(0x1000)).unwrap();
    // The reserved bit is part of the address field, so the table cannot be found either.
    image
        .write_entry(root, 1, PageEntry::decode((1 << 50) | table_entry(pdpt).as_u64()))
        .unwrap();

    let mut ordered = Ordered::default();
    let status = walk_into(&system(root, 36), &image, WalkDepth::ThreeLevel, &mut ordered);

    assert_eq!(status, WalkStatus::CompletedWithErrors);
    assert_eq!(
        ordered.0,
        vec![
            "record PML4[0]",
            "record PDPT[0]",
            "anomaly PDPT[3]",
            "anomaly PML4[1]",
            "record PML4[1]",
            "anomaly PML4[1]",
        ]
    );
}

#[test]
fn walker_can_be_bounded_by_the_caller() {
    let (mut image, root, pdpt, _) = three_tables();
    for index in 1..512 {
        image.write_entry(root, index, table_entry(pdpt)).unwrap();
    }
    let config = pagetbl::PagingConfig::derive(&system(root, 36)).unwrap();

    let events = Walker::new(config, &image).unwrap().take(10).collect::<Vec<_>>();

    let visited = events
        .iter()
        .map(|event| match event {
            WalkEvent::Record(record) => (record.level, record.index),
            WalkEvent::Anomaly(anomaly) => panic!("unexpected {anomaly}"),
        })
        .collect::<Vec<_>>();
    assert_eq!(visited.len(), 10);
    for (position, pair) in visited.chunks(2).enumerate() {
        assert_eq!(pair, [(TableLevel::Pml4, position), (TableLevel::Pdpt, 0)]);
    }
}
