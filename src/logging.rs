//! `log` backend for the demo binary.
//!
//! Lines look like `[ INFO][task 3] message`, coloured by level with ANSI escapes, on stderr.
//! The library itself only uses the `log` macros and never installs a logger.

use std::fmt;

use log::{Level, LevelFilter, Log, Metadata, Record};

use crate::task;

/// Installs the logger. The level comes from the `LOG` environment variable:
/// - "ERROR" -> `LevelFilter::Error`
/// - "WARN" -> `LevelFilter::Warn`
/// - "INFO" -> `LevelFilter::Info`
/// - "DEBUG" -> `LevelFilter::Debug`
/// - "TRACE" -> `LevelFilter::Trace`
/// - unset -> `LevelFilter::Info`, so the demos print their results
/// - anything else -> `LevelFilter::Off`
pub fn init() -> Result<(), String> {
    static LOGGER: SyncLogger = SyncLogger;
    log::set_logger(&LOGGER).map_err(|e| e.to_string())?;
    log::set_max_level(level_from_env(std::env::var("LOG").ok().as_deref()));
    Ok(())
}

fn level_from_env(value: Option<&str>) -> LevelFilter {
    match value {
        Some("ERROR") => LevelFilter::Error,
        Some("WARN") => LevelFilter::Warn,
        Some("INFO") => LevelFilter::Info,
        Some("DEBUG") => LevelFilter::Debug,
        Some("TRACE") => LevelFilter::Trace,
        None => LevelFilter::Info,
        Some(_) => LevelFilter::Off,
    }
}

struct SyncLogger;

impl Log for SyncLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        print_in_color(
            format_args!(
                "[{:>5}][task {}] {}",
                record.level(),
                task::current().id(),
                record.args()
            ),
            level_to_color_code(record.level()),
        );
    }

    fn flush(&self) {}
}

fn print_in_color(args: fmt::Arguments, color_code: u8) {
    eprintln!("\u{1B}[{color_code}m{args}\u{1B}[0m");
}

fn level_to_color_code(level: Level) -> u8 {
    match level {
        Level::Error => 31, // Red
        Level::Warn => 93,  // BrightYellow
        Level::Info => 34,  // Blue
        Level::Debug => 32, // Green
        Level::Trace => 90, // BrightBlack
    }
}
