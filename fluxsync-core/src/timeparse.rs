//! Time input parsing for the command line
//!
//! Accepted forms:
//! - integer unix seconds (`1700000000`)
//! - a negative duration relative to now (`-24h`, `-1h 30m`)
//! - RFC 3339 (`2024-01-01T00:00:00Z`)

use chrono::{DateTime, TimeZone, Utc};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum TimeParseError {
    #[error("empty time")]
    Empty,

    #[error("unix time {0} out of range")]
    OutOfRange(i64),

    #[error("invalid relative time '{input}': {reason}")]
    Relative { input: String, reason: String },

    #[error("unrecognized time '{0}', expected unix seconds, -<duration> or RFC 3339")]
    Unrecognized(String),
}

/// Parse a time given on the command line, relative to `now`
pub fn parse_input_time(input: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>, TimeParseError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(TimeParseError::Empty);
    }

    if let Ok(secs) = input.parse::<i64>() {
        return Utc
            .timestamp_opt(secs, 0)
            .single()
            .ok_or(TimeParseError::OutOfRange(secs));
    }

    if let Some(rel) = input.strip_prefix('-') {
        let relative_err = |reason: String| TimeParseError::Relative {
            input: input.to_string(),
            reason,
        };
        let duration = humantime::parse_duration(rel).map_err(|e| relative_err(e.to_string()))?;
        let duration = chrono::Duration::from_std(duration).map_err(|e| relative_err(e.to_string()))?;
        return now
            .checked_sub_signed(duration)
            .ok_or_else(|| relative_err("before the earliest representable time".to_string()));
    }

    DateTime::parse_from_rfc3339(input)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| TimeParseError::Unrecognized(input.to_string()))
}
