//! Capture timestamps in the `%Y%m%d_%H%M%S` form carried by voice envelopes
//! and used in inbox file names.

use time::macros::format_description;
use time::OffsetDateTime;

/// Format a UTC instant as `YYYYMMDD_HHMMSS`.
pub fn format(at: OffsetDateTime) -> String {
    let fmt = format_description!("[year][month][day]_[hour][minute][second]");
    at.format(fmt).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to format timestamp");
        String::from("00000000_000000")
    })
}

/// Current UTC time as `YYYYMMDD_HHMMSS`.
pub fn now() -> String {
    format(OffsetDateTime::now_utc())
}

/// True for a `YYYYMMDD_HHMMSS` string of digits around one underscore.
pub fn is_well_formed(ts: &str) -> bool {
    let bytes = ts.as_bytes();
    bytes.len() == 15
        && bytes[8] == b'_'
        && bytes[..8].iter().chain(&bytes[9..]).all(u8::is_ascii_digit)
}
