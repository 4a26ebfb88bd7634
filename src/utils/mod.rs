//! Settings, error types and time helpers shared by the other modules

pub mod config;
pub mod error;

pub use config::{AudioConfig, Config, DecoderConfig, GeneralConfig, RendererConfig, WindowConfig};
pub use error::{AudioError, DecodeError, LoadError, PlayerError, QueryError, Result};

use std::time::Duration;

/// `MM:SS`, growing to `HH:MM:SS` from one hour on
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    match secs / 3600 {
        0 => format!("{:02}:{:02}", secs / 60, secs % 60),
        h => format!("{:02}:{:02}:{:02}", h, secs / 60 % 60, secs % 60),
    }
}

/// Convert a timestamp expressed in `numerator/denominator` units to a Duration
///
/// Negative timestamps and degenerate time bases map to zero.
pub fn timestamp_to_duration(ticks: i64, numerator: i32, denominator: i32) -> Duration {
    if ticks <= 0 || numerator <= 0 || denominator <= 0 {
        return Duration::ZERO;
    }
    let secs = ticks as f64 * f64::from(numerator) / f64::from(denominator);
    Duration::from_secs_f64(secs)
}
