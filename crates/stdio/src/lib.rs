//! # stdio
//!
//! Terminal output for envmux processes.
//!
//! ## Format
//!
//! ```text
//! [action] message
//! ```
//!
//! Everything is written to stderr. Worker processes use stdout as their
//! control channel, so nothing in this crate may ever print to stdout.
//!
//! ## Log Levels
//!
//! Control output with the `LOG_LEVEL` environment variable:
//! - `error` - Errors only
//! - `info` - Default (startup + important messages)
//! - `debug` - Verbose output
//!
//! `RUST_LOG` takes precedence for the `tracing` subscriber installed by
//! [`init_tracing`].

use std::env;
use std::sync::OnceLock;

use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum LogLevel {
    Error = 0,
    Info = 1,
    Debug = 2,
}

impl LogLevel {
    fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "debug" | "trace" => LogLevel::Debug,
            _ => LogLevel::Info,
        }
    }

    fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

static LOG_LEVEL: OnceLock<LogLevel> = OnceLock::new();
static TRACING: OnceLock<()> = OnceLock::new();

fn format_line(action: &str, message: &str) -> String {
    format!("[{}] {}", action, message)
}

fn emit_line(line: &str) {
    eprintln!("{}", line);
}

/// Get the current log level (cached from LOG_LEVEL env var)
pub fn log_level() -> LogLevel {
    *LOG_LEVEL.get_or_init(|| {
        env::var("LOG_LEVEL")
            .map(|s| LogLevel::parse(&s))
            .unwrap_or(LogLevel::Info)
    })
}

/// Install the process-wide `tracing` subscriber.
///
/// Safe to call more than once; only the first call has an effect. The
/// filter comes from `RUST_LOG` when set, otherwise from `LOG_LEVEL`.
pub fn init_tracing() {
    TRACING.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(log_level().as_filter()));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .try_init();
    });
}

/// Log an action with a message
/// Format: `[action] message`
///
/// # Example
/// ```
/// stdio::log("listen", "http://127.0.0.1:8530");
/// // Output: [listen] http://127.0.0.1:8530
/// ```
pub fn log(action: &str, message: &str) {
    if log_level() >= LogLevel::Info {
        emit_line(&format_line(action, message));
    }
}

/// Log an error. Always shown.
pub fn error(action: &str, message: &str) {
    emit_line(&format_line(action, message));
}

/// Print a raw line (no formatting).
pub fn raw(message: &str) {
    emit_line(message);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_level_parsing() {
        assert_eq!(LogLevel::parse("error"), LogLevel::Error);
        assert_eq!(LogLevel::parse("info"), LogLevel::Info);
        assert_eq!(LogLevel::parse("debug"), LogLevel::Debug);
        assert_eq!(LogLevel::parse("TRACE"), LogLevel::Debug);
        assert_eq!(LogLevel::parse("unknown"), LogLevel::Info);
    }

    #[test]
    fn log_level_ordering() {
        assert!(LogLevel::Error < LogLevel::Info);
        assert!(LogLevel::Info < LogLevel::Debug);
    }

    #[test]
    fn filter_names_match_tracing_levels() {
        assert_eq!(LogLevel::Error.as_filter(), "error");
        assert_eq!(LogLevel::Debug.as_filter(), "debug");
    }

    #[test]
    fn lines_carry_the_action_prefix() {
        assert_eq!(
            format_line("listen", "http://127.0.0.1:8530"),
            "[listen] http://127.0.0.1:8530"
        );
    }

    #[test]
    fn init_tracing_is_idempotent() {
        init_tracing();
        init_tracing();
    }
}
