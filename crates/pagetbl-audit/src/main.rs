use clap::{ArgAction, Parser, Subcommand};
use std::error::Error;
use std::fs;
use std::io::{self, Write};
use std::num::ParseIntError;
use std::path::PathBuf;

use pagetbl::{
    Anomaly, ConfigProvider, HumanSize, PhysicalAddress, PhysicalImage, RangeRecord, RecordKind,
    RegisterSnapshot, Reporter, SystemConfig, WalkDepth, WalkEvent, WalkStatus, Walker,
    walk_into,
};

mod console;

use console::Console;

#[derive(Parser)]
#[command(name = "pagetbl-audit")]
#[command(about = "Dumps and audits x86_64 translation tables from a physical memory image")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args)]
struct Common {
    /// Raw physical memory image
    #[arg(short, long)]
    image: PathBuf,

    /// Physical address of the first byte of the image
    #[arg(short, long, default_value = "0", value_parser = parse_number)]
    base: u64,

    /// Descend into page tables and report 4KiB pages
    #[arg(long)]
    four_level: bool,

    /// Stop after this many records and anomalies
    #[arg(long)]
    limit: Option<usize>,

    /// Increase log verbosity (repeatable)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Command {
    /// Walk the tables below an explicit root table
    Dump {
        #[command(flatten)]
        common: Common,

        /// Physical address of the PML4 table
        #[arg(short, long, value_parser = parse_number)]
        root: u64,

        /// MAXPHYADDR of the machine the image was taken from
        #[arg(long, default_value_t = DEFAULT_PHYS_BITS)]
        phys_bits: u8,

        /// Report the execute-disable bit (EFER.NXE set)
        #[arg(long)]
        nx: bool,

        /// Report protection keys (CR4.PKE set)
        #[arg(long)]
        pke: bool,
    },
    /// Walk the tables selected by captured control registers
    Registers {
        #[command(flatten)]
        common: Common,

        #[arg(long, value_parser = parse_number)]
        cr0: u64,

        #[arg(long, value_parser = parse_number)]
        cr3: u64,

        #[arg(long, value_parser = parse_number)]
        cr4: u64,

        /// IA32_EFER
        #[arg(long, value_parser = parse_number)]
        efer: u64,

        /// MAXPHYADDR, from CPUID leaf 0x80000008
        #[arg(long, default_value_t = DEFAULT_PHYS_BITS)]
        phys_bits: u8,
    },
}

/// MAXPHYADDR of most machines. Narrower than the entry format allows, so that stray high
/// address bits show up as reserved-bit violations unless told otherwise.
const DEFAULT_PHYS_BITS: u8 = 36;

/// How a walk ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Outcome {
    status: WalkStatus,
    /// Set when `--limit` stopped the walk before every table was visited.
    truncated_after: Option<usize>,
}

/// Parses `0x`-prefixed hexadecimal or plain decimal, with optional `_` separators.
fn parse_number(input: &str) -> Result<u64, ParseIntError> {
    let digits = input.replace('_', "");
    match digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => digits.parse::<u64>(),
    }
}

/// Prints records as an indented tree and anomalies as `!` lines.
struct TextReporter<W: Write> {
    out: W,
    records: usize,
    anomalies: usize,
    mapped: u64,
    error: Option<io::Error>,
}

impl<W: Write> TextReporter<W> {
    fn new(out: W) -> Self {
        Self {
            out,
            records: 0,
            anomalies: 0,
            mapped: 0,
            error: None,
        }
    }

    fn line(&mut self, line: core::fmt::Arguments<'_>) {
        if self.error.is_none() {
            if let Err(err) = self.out.write_fmt(line).and_then(|()| self.out.write_all(b"\n")) {
                self.error = Some(err);
            }
        }
    }

    fn event(&mut self, event: WalkEvent) {
        match event {
            WalkEvent::Record(record) => self.record(record),
            WalkEvent::Anomaly(anomaly) => self.anomaly(anomaly),
        }
    }

    /// Prints the summary line and reports the first write error, if any.
    fn finish(mut self, outcome: Outcome) -> io::Result<()> {
        let (records, anomalies, mapped) = (self.records, self.anomalies, HumanSize(self.mapped));
        let status = outcome.status;
        match outcome.truncated_after {
            None => self.line(format_args!(
                "{records} ranges, {anomalies} anomalies, {mapped} mapped: {status}"
            )),
            Some(limit) => self.line(format_args!(
                "{records} ranges, {anomalies} anomalies, {mapped} mapped: \
                 truncated after {limit} events ({status} so far)"
            )),
        }
        match self.error.take() {
            Some(err) => Err(err),
            None => self.out.flush(),
        }
    }
}

impl<W: Write> Reporter for TextReporter<W> {
    fn record(&mut self, record: RangeRecord) {
        self.records += 1;
        if let RecordKind::Page(_) = record.kind {
            self.mapped = self.mapped.saturating_add(record.len());
        }
        self.line(format_args!("{record}"));
    }

    fn anomaly(&mut self, anomaly: Anomaly) {
        self.anomalies += 1;
        self.line(format_args!("! {anomaly}"));
    }
}

fn load_image(common: &Common) -> Result<PhysicalImage, Box<dyn Error>> {
    let bytes = fs::read(&common.image)?;
    let image = PhysicalImage::from_bytes(PhysicalAddress::new(common.base), &bytes)?;
    log::info!(
        "loaded {} of physical memory at {}..{}",
        HumanSize(image.size() as u64),
        image.base(),
        image.end()
    );
    Ok(image)
}

/// Walks `image` into `reporter`, stopping after `limit` events if one is given.
fn run<W: Write>(
    provider: &dyn ConfigProvider,
    image: &PhysicalImage,
    depth: WalkDepth,
    limit: Option<usize>,
    reporter: &mut TextReporter<W>,
) -> Outcome {
    let Some(limit) = limit else {
        return Outcome {
            status: walk_into(provider, image, depth, reporter),
            truncated_after: None,
        };
    };

    let mut walker = match Walker::from_provider(provider, image, depth) {
        Ok(walker) => walker,
        Err(reason) => {
            return Outcome {
                status: WalkStatus::PreconditionFailed(reason),
                truncated_after: None,
            };
        }
    };

    let mut truncated_after = None;
    for (count, event) in walker.by_ref().enumerate() {
        if count == limit {
            truncated_after = Some(limit);
            break;
        }
        reporter.event(event);
    }
    if truncated_after.is_some() {
        log::warn!("output limited to {limit} events, the walk did not finish");
    }
    Outcome {
        status: walker.status(),
        truncated_after,
    }
}

fn audit(provider: &dyn ConfigProvider, common: &Common) -> Result<(), Box<dyn Error>> {
    let image = load_image(common)?;
    let depth = if common.four_level {
        WalkDepth::FourLevel
    } else {
        WalkDepth::ThreeLevel
    };

    let mut reporter = TextReporter::new(io::stdout().lock());
    let outcome = run(provider, &image, depth, common.limit, &mut reporter);
    reporter.finish(outcome)?;

    match outcome.status {
        WalkStatus::PreconditionFailed(reason) => Err(reason.into()),
        WalkStatus::CompletedWithErrors => Err("some tables could not be read".into()),
        WalkStatus::Ok => Ok(()),
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    match cli.command {
        Command::Dump {
            common,
            root,
            phys_bits,
            nx,
            pke,
        } => {
            Console::init(common.verbose)?;
            let system = SystemConfig {
                physical_address_width: phys_bits,
                root_table: PhysicalAddress::new(root),
                paging_mode_recognized: true,
                protection_keys_enabled: pke,
                no_execute_enabled: nx,
            };
            audit(&system, &common)
        }
        Command::Registers {
            common,
            cr0,
            cr3,
            cr4,
            efer,
            phys_bits,
        } => {
            Console::init(common.verbose)?;
            let snapshot = RegisterSnapshot {
                cr0,
                cr3,
                cr4,
                efer,
                physical_address_width: phys_bits,
            };
            snapshot.log_diagnostics();
            audit(&snapshot, &common)
        }
    }
}
