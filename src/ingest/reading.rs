//! Sensor readings and payload decoding.

#![allow(missing_docs)]

use chrono::{Local, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};

use crate::core::errors::{Result, TwinError};

/// Text form of a reading timestamp, as stored and exported.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// One numeric observation of a topic, stamped with local wall-clock time at
/// second precision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub topic: String,
    pub timestamp: NaiveDateTime,
    pub value: f64,
}

impl Reading {
    /// Build a reading; sub-second precision is discarded.
    #[must_use]
    pub fn new(topic: impl Into<String>, timestamp: NaiveDateTime, value: f64) -> Self {
        Self {
            topic: topic.into(),
            timestamp: truncate_to_seconds(timestamp),
            value,
        }
    }

    /// Build a reading stamped with the current local time.
    #[must_use]
    pub fn now(topic: impl Into<String>, value: f64) -> Self {
        Self::new(topic, Local::now().naive_local(), value)
    }

    /// Timestamp rendered with [`TIMESTAMP_FORMAT`].
    #[must_use]
    pub fn timestamp_text(&self) -> String {
        self.timestamp.format(TIMESTAMP_FORMAT).to_string()
    }
}

/// Parse a timestamp written with [`TIMESTAMP_FORMAT`].
pub fn parse_timestamp(text: &str) -> Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(text.trim(), TIMESTAMP_FORMAT).map_err(|e| {
        TwinError::Serialization {
            context: "timestamp",
            details: format!("{text:?}: {e}"),
        }
    })
}

fn truncate_to_seconds(timestamp: NaiveDateTime) -> NaiveDateTime {
    timestamp.with_nanosecond(0).unwrap_or(timestamp)
}

/// Decode an MQTT payload into a numeric value.
///
/// The payload must be UTF-8 text that, once trimmed, parses as a finite `f64`.
/// `NaN` and infinities are rejected: SQLite stores them as NULL, which would
/// break the read-back of the row.
pub fn decode_value(topic: &str, payload: &[u8]) -> Result<f64> {
    let text = std::str::from_utf8(payload).map_err(|e| TwinError::Decode {
        topic: topic.to_string(),
        details: format!("payload is not UTF-8: {e}"),
    })?;
    let value: f64 = text.trim().parse().map_err(|e| TwinError::Decode {
        topic: topic.to_string(),
        details: format!("{:?}: {e}", preview(text)),
    })?;
    if !value.is_finite() {
        return Err(TwinError::Decode {
            topic: topic.to_string(),
            details: format!("{value} is not a finite number"),
        });
    }
    Ok(value)
}

/// Decode a payload received at `received_at` into a [`Reading`].
pub fn decode(topic: &str, payload: &[u8], received_at: NaiveDateTime) -> Result<Reading> {
    let value = decode_value(topic, payload)?;
    Ok(Reading::new(topic, received_at, value))
}

/// Payload text safe to put in a log line.
#[must_use]
pub fn payload_text(payload: &[u8]) -> String {
    String::from_utf8_lossy(payload).into_owned()
}

fn preview(text: &str) -> &str {
    match text.char_indices().nth(64) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
