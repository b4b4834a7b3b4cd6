// Calibration error types and constants

use crate::error::{ChannelError, ErrorCode};
use log::error;
use std::fmt;

/// Calibration error code constants
///
/// Single source of truth for the numeric codes carried on terminal
/// `Error` events and printed by the CLI.
///
/// Error code range: 2001-2009
pub struct CalibrationErrorCodes {}

impl CalibrationErrorCodes {
    /// A reduction would divide by zero or by an implausible reading
    pub const DEGENERATE_MEASUREMENT: i32 = 2001;

    /// Measurement or motion channel failed mid-run
    pub const CHANNEL_FAILURE: i32 = 2002;

    /// Another calibration run is active
    pub const ALREADY_IN_PROGRESS: i32 = 2003;

    /// No calibration run is active
    pub const NOT_RUNNING: i32 = 2004;

    /// Configuration rejected by validation
    pub const INVALID_CONFIG: i32 = 2005;

    /// Volumetric search hit its iteration or feedrate ceiling
    pub const SEARCH_EXHAUSTED: i32 = 2006;

    /// Manager state lock was poisoned
    pub const STATE_POISONED: i32 = 2007;

    /// Motion channel does not know the requested tool
    pub const TOOL_UNAVAILABLE: i32 = 2008;

    /// The spawned run task panicked or was cancelled
    pub const TASK_FAILED: i32 = 2009;
}

/// Log a calibration error with structured context
///
/// This function logs calibration errors with structured fields including:
/// - error_code: Numeric error code for programmatic handling
/// - component: The component where the error occurred
/// - message: Human-readable error message
/// - context: Additional contextual information
pub fn log_calibration_error(err: &CalibrationError, context: &str) {
    error!(
        "Calibration error in {}: code={}, component=CalibrationEngine, message={}",
        context,
        err.code(),
        err.message()
    );
}

/// Calibration-related errors
///
/// Every variant is terminal for the run that produced it; the engine never
/// retries an iteration.
///
/// Error code ranges: 2001-2009
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CalibrationError {
    /// Sample mean was zero, negative or not finite where a positive
    /// nominal distance was commanded
    DegenerateMeasurement {
        stage: String,
        value: f64,
        nominal_mm: f64,
    },

    /// A channel reported disconnection, malformed data or timed out
    ChannelFailure { reason: String },

    /// Calibration already in progress
    AlreadyInProgress,

    /// No calibration in progress
    NotRunning,

    /// Configuration failed validation
    InvalidConfig { reason: String },

    /// Volumetric search ran out of iterations or feedrate headroom
    SearchExhausted { iterations: u32, feedrate: f64 },

    /// Manager state lock was poisoned
    StatePoisoned,

    /// Motion channel has no configuration for the tool
    ToolUnavailable { tool: usize },

    /// Run task ended without reporting an outcome
    TaskFailed { reason: String },
}

impl ErrorCode for CalibrationError {
    fn code(&self) -> i32 {
        match self {
            CalibrationError::DegenerateMeasurement { .. } => {
                CalibrationErrorCodes::DEGENERATE_MEASUREMENT
            }
            CalibrationError::ChannelFailure { .. } => CalibrationErrorCodes::CHANNEL_FAILURE,
            CalibrationError::AlreadyInProgress => CalibrationErrorCodes::ALREADY_IN_PROGRESS,
            CalibrationError::NotRunning => CalibrationErrorCodes::NOT_RUNNING,
            CalibrationError::InvalidConfig { .. } => CalibrationErrorCodes::INVALID_CONFIG,
            CalibrationError::SearchExhausted { .. } => CalibrationErrorCodes::SEARCH_EXHAUSTED,
            CalibrationError::StatePoisoned => CalibrationErrorCodes::STATE_POISONED,
            CalibrationError::ToolUnavailable { .. } => CalibrationErrorCodes::TOOL_UNAVAILABLE,
            CalibrationError::TaskFailed { .. } => CalibrationErrorCodes::TASK_FAILED,
        }
    }

    fn message(&self) -> String {
        match self {
            CalibrationError::DegenerateMeasurement {
                stage,
                value,
                nominal_mm,
            } => {
                format!(
                    "Degenerate measurement in {}: value {} against nominal {} mm",
                    stage, value, nominal_mm
                )
            }
            CalibrationError::ChannelFailure { reason } => {
                format!("Channel failure: {}", reason)
            }
            CalibrationError::AlreadyInProgress => "Calibration already in progress".to_string(),
            CalibrationError::NotRunning => "No calibration in progress".to_string(),
            CalibrationError::InvalidConfig { reason } => {
                format!("Invalid configuration: {}", reason)
            }
            CalibrationError::SearchExhausted {
                iterations,
                feedrate,
            } => {
                format!(
                    "Volumetric search exhausted after {} iterations at F{}",
                    iterations, feedrate
                )
            }
            CalibrationError::StatePoisoned => "Calibration state lock poisoned".to_string(),
            CalibrationError::ToolUnavailable { tool } => {
                format!("Tool {} is not configured on the motion channel", tool)
            }
            CalibrationError::TaskFailed { reason } => {
                format!("Calibration task failed: {}", reason)
            }
        }
    }
}

impl fmt::Display for CalibrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CalibrationError::{:?} (code {}): {}",
            self,
            self.code(),
            self.message()
        )
    }
}

impl std::error::Error for CalibrationError {}

impl From<ChannelError> for CalibrationError {
    fn from(err: ChannelError) -> Self {
        CalibrationError::ChannelFailure {
            reason: err.message(),
        }
    }
}
