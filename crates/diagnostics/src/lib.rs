// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Logging for the ORM runtime crates
//!
//! Usage:
//! - Set ORM_LOG=off (default) - no logs
//! - Set ORM_LOG=info - session, transaction and replay events
//! - Set ORM_LOG=debug - queue drains, cache activity, persist passes

use std::str::FromStr;
use std::sync::Once;

// Re-export emit so macros can use it
pub use emit;

static INIT: Once = Once::new();

/// Environment variable read by [`init_diagnostics`]
pub const LOG_ENV: &str = "ORM_LOG";

/// Minimum level of emitted events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" | "" => Ok(LogLevel::Off),
            "error" => Ok(LogLevel::Error),
            "warn" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            other => Err(format!("unknown log level '{}'", other)),
        }
    }
}

impl LogLevel {
    fn emit_level(self) -> Option<emit::Level> {
        match self {
            LogLevel::Off => None,
            LogLevel::Error => Some(emit::Level::Error),
            LogLevel::Warn => Some(emit::Level::Warn),
            LogLevel::Info => Some(emit::Level::Info),
            LogLevel::Debug => Some(emit::Level::Debug),
        }
    }
}

/// Initialize diagnostics based on the ORM_LOG environment variable
///
/// Safe to call multiple times; only the first call installs an emitter.
/// Unknown values fall back to `info`.
pub fn init_diagnostics() {
    let level = std::env::var(LOG_ENV)
        .ok()
        .map(|value| value.parse().unwrap_or(LogLevel::Info))
        .unwrap_or(LogLevel::Off);
    init_with_level(level);
}

/// Initialize diagnostics with an explicit level, ignoring the environment
pub fn init_with_level(level: LogLevel) {
    INIT.call_once(|| {
        let Some(min) = level.emit_level() else {
            return;
        };
        let rt = emit::setup()
            .emit_to(emit_term::stderr())
            .emit_when(emit::level::min_filter(min))
            .init();

        // The runtime lives for the rest of the process
        std::mem::forget(rt);
    });
}

// Re-exported directly rather than wrapped in `macro_rules!` so that template
// holes like `{id}` resolve against the caller's locals (macro hygiene).

/// Log detailed diagnostics (task counts, cache activity, internal state)
pub use emit::debug;

/// Log basic operations (transactions, replays, node registration)
pub use emit::info;

/// Log conditions that don't prevent operation but should be noted
pub use emit::warn;

/// Log failures
pub use emit::error;

pub use init_diagnostics as init;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_safe_to_call_multiple_times() {
        init_diagnostics();
        init_diagnostics();
        init_with_level(LogLevel::Debug);
    }

    #[test]
    fn test_level_parsing() {
        assert_eq!("DEBUG".parse::<LogLevel>(), Ok(LogLevel::Debug));
        assert_eq!("".parse::<LogLevel>(), Ok(LogLevel::Off));
        assert_eq!(" warn ".parse::<LogLevel>(), Ok(LogLevel::Warn));
        assert!("verbose".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_macros_compile() {
        let tasks = 3;
        debug!("Draining {tasks} tasks");
        info!("Info message");
        warn!("Warning message");
        error!("Error message");
    }
}
