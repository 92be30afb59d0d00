// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Global logger behind the `log` facade.
//!
//! One process-wide logger with a swappable output and a runtime level
//! filter. The daemons drive two signal behaviours through it: `SIGUSR1`
//! reopens the destination and `SIGUSR2` steps the level filter one notch,
//! wrapping.

use super::output::{FileOutput, Output, StderrOutput, SyslogOutput};
use log::LevelFilter;
use parking_lot::RwLock;
use std::io;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

/// Where log lines go, per the environment contract: a path, `-` for
/// stderr, or the empty string for syslog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogDestination {
    Stderr,
    File(PathBuf),
    Syslog,
}

impl LogDestination {
    /// Parse the environment form.
    #[must_use]
    pub fn parse(spec: &str) -> LogDestination {
        match spec {
            "-" => LogDestination::Stderr,
            "" => LogDestination::Syslog,
            path => LogDestination::File(PathBuf::from(path)),
        }
    }
}

struct LoggerState {
    output: Box<dyn Output>,
    level: LevelFilter,
}

struct GlobalLogger {
    state: RwLock<LoggerState>,
}

static LOGGER: OnceLock<GlobalLogger> = OnceLock::new();

impl log::Log for GlobalLogger {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        metadata.level() <= self.state.read().level
    }

    fn log(&self, record: &log::Record<'_>) {
        let state = self.state.read();
        if record.level() > state.level {
            return;
        }
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let line = format!(
            "{}.{:03} {}: {}",
            now.as_secs(),
            now.subsec_millis(),
            record.target(),
            record.args()
        );
        // A failing log write must not take the daemon down with it.
        let _ = state.output.write(record.level(), &line);
    }

    fn flush(&self) {
        let _ = self.state.read().output.flush();
    }
}

fn make_output(dest: &LogDestination, ident: &str) -> io::Result<Box<dyn Output>> {
    Ok(match dest {
        LogDestination::Stderr => Box::new(StderrOutput),
        LogDestination::File(path) => Box::new(FileOutput::new(path)?),
        LogDestination::Syslog => Box::new(SyslogOutput::new(ident)),
    })
}

/// Map a numeric verbosity (0..) onto a level filter.
#[must_use]
pub fn level_for_verbosity(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

/// Initialize the global logger. Later calls rebind the output and level
/// (the first call also registers with the `log` facade).
pub fn init(dest: &LogDestination, ident: &str, level: LevelFilter) -> io::Result<()> {
    let output = make_output(dest, ident)?;
    let logger = LOGGER.get_or_init(|| GlobalLogger {
        state: RwLock::new(LoggerState {
            output: Box::new(StderrOutput),
            level: LevelFilter::Warn,
        }),
    });
    {
        let mut state = logger.state.write();
        state.output = output;
        state.level = level;
    }
    // Only the first registration with the facade can succeed; that is
    // fine, the state swap above already took effect.
    let _ = log::set_logger(logger);
    log::set_max_level(LevelFilter::Trace);
    Ok(())
}

/// Reopen the current destination (log rotation, `SIGUSR1`).
pub fn reopen() -> io::Result<()> {
    if let Some(logger) = LOGGER.get() {
        logger.state.read().output.reopen()?;
    }
    Ok(())
}

/// Step the level filter one notch toward Trace, wrapping back to Warn
/// (`SIGUSR2`).
pub fn step_verbosity() -> LevelFilter {
    let Some(logger) = LOGGER.get() else {
        return LevelFilter::Warn;
    };
    let mut state = logger.state.write();
    state.level = match state.level {
        LevelFilter::Off | LevelFilter::Error | LevelFilter::Warn => LevelFilter::Info,
        LevelFilter::Info => LevelFilter::Debug,
        LevelFilter::Debug => LevelFilter::Trace,
        LevelFilter::Trace => LevelFilter::Warn,
    };
    state.level
}

/// Current level filter.
#[must_use]
pub fn current_level() -> LevelFilter {
    LOGGER
        .get()
        .map_or(LevelFilter::Warn, |l| l.state.read().level)
}
