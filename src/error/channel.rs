// Channel error types and constants

use crate::channel::ChannelSource;
use crate::error::ErrorCode;
use log::error;
use std::fmt;

/// Channel error code constants
///
/// Error code range: 3001-3005
pub struct ChannelErrorCodes {}

impl ChannelErrorCodes {
    /// Device went away or its link task stopped
    pub const DISCONNECTED: i32 = 3001;

    /// Device did not answer within the channel's response bound
    pub const TIMEOUT: i32 = 3002;

    /// Device sent something that does not parse
    pub const MALFORMED: i32 = 3003;

    /// Reply without a matching outstanding request
    pub const PROTOCOL_VIOLATION: i32 = 3004;

    /// Command could not be handed to the device
    pub const COMMAND_REJECTED: i32 = 3005;
}

/// Log a channel error with structured context
pub fn log_channel_error(err: &ChannelError, context: &str) {
    error!(
        "Channel error in {}: code={}, component=Channel, message={}",
        context,
        err.code(),
        err.message()
    );
}

/// Errors raised by measurement and motion channels
///
/// `ProtocolViolation` is the only variant the engine recovers from locally
/// (the stray reply is discarded); everything else aborts the run.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelError {
    /// Link to the device is gone
    Disconnected { source: ChannelSource, reason: String },

    /// No reply within the response bound
    Timeout { source: ChannelSource, waited_ms: u64 },

    /// Reply could not be parsed
    Malformed { source: ChannelSource, payload: String },

    /// Reply arrived for a request that was never made or out of order
    ProtocolViolation { detail: String },

    /// Command was refused before reaching the device
    CommandRejected { source: ChannelSource, reason: String },
}

impl ChannelError {
    /// Whether the engine may discard this error and keep running
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ChannelError::ProtocolViolation { .. })
    }
}

impl ErrorCode for ChannelError {
    fn code(&self) -> i32 {
        match self {
            ChannelError::Disconnected { .. } => ChannelErrorCodes::DISCONNECTED,
            ChannelError::Timeout { .. } => ChannelErrorCodes::TIMEOUT,
            ChannelError::Malformed { .. } => ChannelErrorCodes::MALFORMED,
            ChannelError::ProtocolViolation { .. } => ChannelErrorCodes::PROTOCOL_VIOLATION,
            ChannelError::CommandRejected { .. } => ChannelErrorCodes::COMMAND_REJECTED,
        }
    }

    fn message(&self) -> String {
        match self {
            ChannelError::Disconnected { source, reason } => {
                format!("{} channel disconnected: {}", source, reason)
            }
            ChannelError::Timeout { source, waited_ms } => {
                format!("{} channel did not respond within {} ms", source, waited_ms)
            }
            ChannelError::Malformed { source, payload } => {
                format!("{} channel sent malformed data: {:?}", source, payload)
            }
            ChannelError::ProtocolViolation { detail } => {
                format!("Protocol violation: {}", detail)
            }
            ChannelError::CommandRejected { source, reason } => {
                format!("{} channel rejected command: {}", source, reason)
            }
        }
    }
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ChannelError::{:?} (code {}): {}",
            self,
            self.code(),
            self.message()
        )
    }
}

impl std::error::Error for ChannelError {}
