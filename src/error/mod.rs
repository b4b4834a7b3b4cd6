// Error types for the extruder calibration engine
//
// This module defines the error taxonomy for calibration runs and for the
// measurement/motion channels they drive. Every error carries a numeric code
// so presentation layers can tell a channel failure from a degenerate
// reading without string matching.

mod calibration;
mod channel;

pub use calibration::{log_calibration_error, CalibrationError, CalibrationErrorCodes};
pub use channel::{log_channel_error, ChannelError, ChannelErrorCodes};

/// Error codes for structured error reporting
///
/// This trait provides a standard way to get error codes and messages
/// from custom error types, enabling consistent error handling across
/// the CLI and event stream boundaries.
pub trait ErrorCode {
    /// Get the numeric error code
    fn code(&self) -> i32;

    /// Get the human-readable error message
    fn message(&self) -> String;
}
