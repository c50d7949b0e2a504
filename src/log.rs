//! Logging setup using `tracing` + `tracing-subscriber`.
//!
//! Level resolution:
//! 1. `--debug` flag or `PHASER_DEBUG=1` turns on `debug`
//! 2. `PHASER_LOG` is read as an `EnvFilter` directive (e.g. "phaser=trace")
//! 3. default to `info`
//!
//! Logs go to stderr so stdout carries only the run report.

use tracing_subscriber::EnvFilter;

pub const DEBUG_ENV: &str = "PHASER_DEBUG";
pub const FILTER_ENV: &str = "PHASER_LOG";

/// Initialize logging at the default level.
pub fn init() {
    init_with_debug(false);
}

/// Initialize logging with explicit debug mode setting.
///
/// Safe to call more than once; later calls are ignored.
pub fn init_with_debug(debug: bool) {
    let filter = resolve_filter(debug, env_debug(), std::env::var(FILTER_ENV).ok());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn env_debug() -> bool {
    std::env::var(DEBUG_ENV)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn resolve_filter(flag: bool, env_debug: bool, directive: Option<String>) -> EnvFilter {
    if flag || env_debug {
        return EnvFilter::new("debug");
    }
    directive
        .and_then(|d| EnvFilter::try_new(d.trim()).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}
