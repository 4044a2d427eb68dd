//! Console logger writing to standard error, so that diagnostics never interleave with the
//! dump on standard output.

use std::io::{self, Stderr, Write};

use log::LevelFilter;
use spin::{Mutex, Once};

pub struct Console {
    level: LevelFilter,
    stderr: Mutex<Stderr>,
}

static DEFAULT: Once<Console> = Once::new();

impl Console {
    /// Installs the console as the global logger. Each `-v` raises the level by one step
    /// above the build's default.
    pub fn init(verbosity: u8) -> Result<&'static Self, log::SetLoggerError> {
        let console = DEFAULT.call_once(|| Console {
            level: level_for(verbosity),
            stderr: Mutex::new(io::stderr()),
        });
        console.install()?;
        Ok(console)
    }

    fn install(&'static self) -> Result<(), log::SetLoggerError> {
        log::set_logger(self)?;
        log::set_max_level(self.level);
        Ok(())
    }
}

fn level_for(verbosity: u8) -> LevelFilter {
    #[cfg(debug_assertions)]
    let default = LevelFilter::Info;
    #[cfg(not(debug_assertions))]
    let default = LevelFilter::Warn;

    match (default as usize).saturating_add(usize::from(verbosity)) {
        0 => LevelFilter::Off,
        1 => LevelFilter::Error,
        2 => LevelFilter::Warn,
        3 => LevelFilter::Info,
        4 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

impl log::Log for Console {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        // Nowhere left to report a failing stderr.
        let _ = write_log_entry_to(&mut *self.stderr.lock(), record);
    }

    fn flush(&self) {
        let _ = self.stderr.lock().flush();
    }
}

fn write_log_entry_to(writer: &mut impl Write, record: &log::Record) -> io::Result<()> {
    if record.level() >= log::Level::Debug {
        writeln!(
            writer,
            "[{} {}:{} {}] {}",
            record.level(),
            record.file().unwrap_or("unknown"),
            record.line().unwrap_or(0),
            record.target(),
            record.args()
        )
    } else {
        writeln!(writer, "[{:5}] {}", record.level(), record.args())
    }
}
