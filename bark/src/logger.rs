//! Console logging.
//!
//! Verification runs log under scoped targets (`engine`, `verify`, `hook`),
//! with the level taken from `RUST_LOG`. Output goes to standard error so
//! that hook and report output on standard out stays parseable; colors are
//! only used when standard error is a terminal.
use std::io;
use std::io::{IsTerminal as _, Write as _};

use chrono::prelude::*;
use colored::{ColoredString, Colorize as _};
use log::{Level, Log, Metadata, Record, SetLoggerError};

struct Logger {
    level: Level,
    colors: bool,
}

impl Logger {
    fn badge(&self, level: Level) -> ColoredString {
        let badge = match level {
            Level::Error => "error",
            Level::Warn => " warn",
            Level::Info => " info",
            Level::Debug => "debug",
            Level::Trace => "trace",
        };
        if !self.colors {
            return badge.normal();
        }
        match level {
            Level::Error => badge.red().bold(),
            Level::Warn => badge.yellow(),
            Level::Info => badge.green(),
            Level::Debug | Level::Trace => badge.dimmed(),
        }
    }
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let time = Local::now().format("%H:%M:%S%.3f");
        let target = if self.colors {
            record.target().cyan()
        } else {
            record.target().normal()
        };

        writeln!(
            io::stderr().lock(),
            "{time} {} {target} {}",
            self.badge(record.level()),
            record.args()
        )
        .ok();
    }

    fn flush(&self) {}
}

/// Install the logger at the given level.
pub fn init(level: Level) -> Result<(), SetLoggerError> {
    let logger = Logger {
        level,
        colors: io::stderr().is_terminal(),
    };
    log::set_boxed_logger(Box::new(logger))?;
    log::set_max_level(level.to_level_filter());

    Ok(())
}

/// The level requested through the `RUST_LOG` environment variable, if any.
pub fn env_level() -> Option<Level> {
    std::env::var("RUST_LOG").ok()?.parse().ok()
}
