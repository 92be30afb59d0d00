// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Process configuration: compile-time constants and the environment
//! contract shared by every pipeline program.
//!
//! Command-line flags override environment variables, which override the
//! defaults here; the binaries wire that precedence, this module just
//! reads the environment.

use crate::logging::LogDestination;
use std::path::PathBuf;

/// Default RPC control-plane port.
pub const DEFAULT_PORT: u16 = 3880;

/// Default queue file location.
pub const DEFAULT_QUEUE_PATH: &str = "/var/lib/feedq/product.pq";

/// Default directory for per-subscription session-memory files.
pub const DEFAULT_SESSION_DIR: &str = "/var/lib/feedq/sessions";

/// Default queue capacities for `feedqctl create`.
pub const DEFAULT_BYTE_CAPACITY: u64 = 500 * 1024 * 1024;
pub const DEFAULT_SLOT_CAPACITY: u64 = 200_000;

// Environment variable names.
pub const ENV_QUEUE: &str = "FEEDQ_QUEUE";
pub const ENV_LOG: &str = "FEEDQ_LOG";
pub const ENV_LOG_IDENT: &str = "FEEDQ_LOG_IDENT";
pub const ENV_VERBOSITY: &str = "FEEDQ_VERBOSITY";
pub const ENV_PORT: &str = "FEEDQ_PORT";
pub const ENV_SESSION_DIR: &str = "FEEDQ_SESSION_DIR";

/// Environment-derived configuration.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub queue_path: PathBuf,
    pub log_dest: LogDestination,
    pub log_ident: String,
    pub verbosity: u8,
    pub port: u16,
    pub session_dir: PathBuf,
}

impl EnvConfig {
    /// Read the environment, falling back to the defaults above.
    /// `ident` names the calling program for syslog.
    #[must_use]
    pub fn from_env(ident: &str) -> EnvConfig {
        let queue_path = std::env::var(ENV_QUEUE)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_QUEUE_PATH));
        let log_dest = std::env::var(ENV_LOG)
            .map(|s| LogDestination::parse(&s))
            .unwrap_or(LogDestination::Stderr);
        let log_ident = std::env::var(ENV_LOG_IDENT).unwrap_or_else(|_| ident.to_string());
        let verbosity = std::env::var(ENV_VERBOSITY)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let port = std::env::var(ENV_PORT)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_PORT);
        let session_dir = std::env::var(ENV_SESSION_DIR)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_SESSION_DIR));
        EnvConfig {
            queue_path,
            log_dest,
            log_ident,
            verbosity,
            port,
            session_dir,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_environment() {
        // Avoid mutating the test process environment: the defaults path
        // is exercised by asking for variables that are never set.
        let cfg = EnvConfig::from_env("feedq-test-ident");
        assert_eq!(cfg.log_ident, std::env::var(ENV_LOG_IDENT).unwrap_or_else(|_| "feedq-test-ident".into()));
        assert!(cfg.port >= 1);
    }
}
