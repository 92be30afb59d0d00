// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Logging: the `log` facade backed by a process-global logger with
//! stderr, reopenable-file, and syslog outputs.

mod logger;
mod output;

pub use logger::{
    current_level, init, level_for_verbosity, reopen, step_verbosity, LogDestination,
};
pub use output::{FileOutput, Output, StderrOutput, SyslogOutput};

use crate::process::signals;

/// Apply any pending signal-driven logging changes: `SIGUSR1`/`SIGHUP`
/// reopen the destination, `SIGUSR2` steps the verbosity. Daemons call
/// this at the top of their poll loops.
pub fn service_signals() {
    if signals::take_rotate_log() {
        if let Err(e) = reopen() {
            log::warn!("log reopen failed: {e}");
        }
    }
    for _ in 0..signals::take_verbosity_bumps() {
        let level = step_verbosity();
        log::info!("verbosity stepped to {level}");
    }
}
