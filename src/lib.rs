// Extruder Calibration Core - encoder-driven extruder calibration engine
// Timed, adaptive measure-and-correct procedures over async device channels

// Module declarations
pub mod adapters;
pub mod calibration;
pub mod channel;
pub mod config;
pub mod error;
pub mod managers;
pub mod protocol;
pub mod simulator;
pub mod telemetry;

#[cfg(any(test, feature = "scripted_fixtures"))]
pub mod testing;

// Re-exports for convenience
pub use calibration::{
    CalibrationEvent, CalibrationProgress, CalibrationResult, Phase, ProcedureKind, RunOutcome,
};
pub use channel::{ChannelEvent, ChannelSet, EncoderMode, MeasurementChannel, MotionChannel, ToolConfig};
pub use config::AppConfig;
pub use error::{CalibrationError, ChannelError, ErrorCode};
pub use managers::{CalibrationManager, RunHandle};

use tracing_subscriber::filter::LevelFilter;

/// Install the global log subscriber (stderr, so stdout stays machine-readable)
///
/// `log` records from this crate are forwarded into the subscriber. Calling
/// this more than once is harmless.
pub fn init_logging(verbose: bool) {
    let level = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
