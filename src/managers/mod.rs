// Managers Module
//
// CalibrationManager owns the single active calibration run: it spawns the
// procedure, forwards abort requests and fans progress out to subscribers.

pub mod calibration_manager;

pub use calibration_manager::{CalibrationManager, RunHandle};
