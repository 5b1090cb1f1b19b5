//! ThunderLane CLI library functions for testing

/// Subcommand implementations.
pub mod commands;
/// Bundled and user configuration.
pub mod config;

use tracing::Level;

/// Map a `--log-level` value to a tracing level; unknown values mean info.
#[must_use]
pub fn parse_level(level: &str) -> Level {
    match level.to_ascii_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}
