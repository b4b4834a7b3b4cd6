// Encoder line protocol
//
// Newline-terminated ASCII in both directions. Commands are single words,
// optionally followed by one argument. The device answers INFO with a
// `NXE|<firmware>|<date>|<interval>|<calibration>` handshake and MEASURE
// with a decimal reading in mm.

use std::fmt;
use std::str::FromStr;

use crate::channel::{ChannelSource, EncoderMode};
use crate::error::ChannelError;

const HANDSHAKE_PREFIX: &str = "NXE";

/// Command sent to the encoder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderCommand {
    Info,
    Measure,
    Reset,
    Relative,
    Absolute,
    /// Start continuous reporting
    Start,
    Stop,
    /// Continuous reporting interval in ms
    Interval(u32),
}

impl EncoderCommand {
    /// Wire form including the line terminator
    pub fn to_line(&self) -> String {
        format!("{}\n", self)
    }
}

impl fmt::Display for EncoderCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncoderCommand::Info => write!(f, "INFO"),
            EncoderCommand::Measure => write!(f, "MEASURE"),
            EncoderCommand::Reset => write!(f, "RESET"),
            EncoderCommand::Relative => write!(f, "REL"),
            EncoderCommand::Absolute => write!(f, "ABS"),
            EncoderCommand::Start => write!(f, "START"),
            EncoderCommand::Stop => write!(f, "STOP"),
            EncoderCommand::Interval(ms) => write!(f, "INTERVAL {}", ms),
        }
    }
}

impl From<EncoderMode> for EncoderCommand {
    fn from(mode: EncoderMode) -> Self {
        match mode {
            EncoderMode::Relative => EncoderCommand::Relative,
            EncoderMode::Absolute => EncoderCommand::Absolute,
        }
    }
}

/// Identity reported by the encoder in its handshake
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct EncoderInfo {
    pub firmware_version: String,
    pub firmware_date: String,
    pub interval_ms: u32,
    pub calibration: String,
}

impl FromStr for EncoderInfo {
    type Err = ChannelError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let malformed = || ChannelError::Malformed {
            source: ChannelSource::Measurement,
            payload: line.to_string(),
        };

        let fields: Vec<&str> = line.trim().split('|').collect();
        match fields.as_slice() {
            [HANDSHAKE_PREFIX, version, date, interval, calibration] => Ok(EncoderInfo {
                firmware_version: version.to_string(),
                firmware_date: date.to_string(),
                interval_ms: interval.trim().parse().map_err(|_| malformed())?,
                calibration: calibration.to_string(),
            }),
            _ => Err(malformed()),
        }
    }
}

/// One line received from the encoder
#[derive(Debug, Clone, PartialEq)]
pub enum EncoderLine {
    Handshake(EncoderInfo),
    Reading(f64),
}

impl EncoderLine {
    /// Classify a received line; blank lines yield `None`.
    ///
    /// # Errors
    /// `ChannelError::Malformed` when the line is neither a handshake nor a
    /// finite decimal reading.
    pub fn parse(line: &str) -> Result<Option<Self>, ChannelError> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        if line.starts_with(HANDSHAKE_PREFIX) {
            return line.parse().map(|info| Some(EncoderLine::Handshake(info)));
        }
        parse_measurement(line).map(|value| Some(EncoderLine::Reading(value)))
    }
}

/// Parse a measurement reply in mm
pub fn parse_measurement(line: &str) -> Result<f64, ChannelError> {
    match line.trim().parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(value),
        _ => Err(ChannelError::Malformed {
            source: ChannelSource::Measurement,
            payload: line.to_string(),
        }),
    }
}
