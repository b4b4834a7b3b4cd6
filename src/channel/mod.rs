//! Collaborator contracts consumed by the calibration engine.
//!
//! The engine talks to two devices: an encoder that measures filament
//! movement and a motion controller that extrudes it. Both are reached through
//! narrow, object-safe traits whose commands are fire-and-forget; replies and
//! unsolicited traffic come back on a single [`ChannelEvent`] stream so the
//! engine can suspend on exactly one receiver.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::ChannelError;

mod abort;

pub use abort::{abort_pair, AbortHandle, AbortSignal};

/// Default bound on how long the encoder may take to answer `MEASURE`.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Which collaborator an event or error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelSource {
    Measurement,
    Motion,
}

impl fmt::Display for ChannelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelSource::Measurement => write!(f, "measurement"),
            ChannelSource::Motion => write!(f, "motion"),
        }
    }
}

/// Encoder reporting mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncoderMode {
    /// Each reading is the movement since the previous reading or reset
    Relative,
    /// Each reading is the movement since the last reset
    Absolute,
}

/// Snapshot of one extruder as reported by the motion controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolConfig {
    /// Firmware name of the extruder (`extruder`, `extruder1`, `T0`, ...)
    pub name: String,
    pub steps_per_mm: f64,
    #[serde(default)]
    pub rotation_distance: Option<f64>,
    #[serde(default)]
    pub microsteps: Option<u32>,
    #[serde(default)]
    pub max_temp: Option<f64>,
}

/// Full steps per motor revolution assumed for rotation-distance firmwares.
const FULL_STEPS_PER_REV: f64 = 200.0;

impl ToolConfig {
    pub fn new(name: impl Into<String>, steps_per_mm: f64) -> Self {
        Self {
            name: name.into(),
            steps_per_mm,
            rotation_distance: None,
            microsteps: None,
            max_temp: None,
        }
    }

    /// Build from a rotation-distance style config (Klipper).
    pub fn from_rotation_distance(
        name: impl Into<String>,
        microsteps: u32,
        rotation_distance: f64,
    ) -> Self {
        Self {
            name: name.into(),
            steps_per_mm: FULL_STEPS_PER_REV * microsteps as f64 / rotation_distance,
            rotation_distance: Some(rotation_distance),
            microsteps: Some(microsteps),
            max_temp: None,
        }
    }

    pub fn with_max_temp(mut self, max_temp: f64) -> Self {
        self.max_temp = Some(max_temp);
        self
    }

    /// Distance moved per motor step.
    pub fn step_distance(&self) -> f64 {
        1.0 / self.steps_per_mm
    }

    /// Copy of this config with a new steps/mm, keeping derived fields in sync.
    pub fn with_steps_per_mm(&self, steps_per_mm: f64) -> Self {
        let mut next = self.clone();
        next.steps_per_mm = steps_per_mm;
        if let Some(microsteps) = self.microsteps {
            next.rotation_distance = Some(FULL_STEPS_PER_REV * microsteps as f64 / steps_per_mm);
        }
        next
    }
}

/// Unsolicited telemetry from the motion controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Telemetry {
    Temperature { tool: usize, current: f64, target: f64 },
    Homed { homed: bool },
}

/// Everything a channel can deliver back to the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// Reply to `request_measurement(request_id)`
    Measurement { request_id: u64, value: f64 },
    /// The channel is no longer usable
    Failure(ChannelError),
    /// Temperature/homing updates; the engine ignores these
    Telemetry(Telemetry),
}

/// Encoder device contract.
pub trait MeasurementChannel: Send + Sync {
    fn set_mode(&self, mode: EncoderMode) -> Result<(), ChannelError>;

    fn reset_accumulator(&self) -> Result<(), ChannelError>;

    /// Ask for one reading; the answer arrives as
    /// [`ChannelEvent::Measurement`] tagged with `request_id`.
    fn request_measurement(&self, request_id: u64) -> Result<(), ChannelError>;

    /// How long a reading may take before the channel is considered failed.
    fn response_timeout(&self) -> Duration {
        DEFAULT_RESPONSE_TIMEOUT
    }
}

/// Motion controller contract.
pub trait MotionChannel: Send + Sync {
    /// Extrude `distance_mm` at `feedrate_mm_per_min`. Completion is inferred
    /// by the caller's settle wait.
    fn command_extrude(&self, distance_mm: f64, feedrate_mm_per_min: f64)
        -> Result<(), ChannelError>;

    /// Write a new steps/mm. `Ok` means the controller accepted the value.
    fn set_steps_per_mm(&self, tool: usize, value: f64) -> Result<(), ChannelError>;

    fn tool_config(&self, tool: usize) -> Option<ToolConfig>;
}

/// Channel handles plus the shared reply stream, handed to one run.
pub struct ChannelSet {
    pub encoder: Arc<dyn MeasurementChannel>,
    pub motion: Arc<dyn MotionChannel>,
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}

impl ChannelSet {
    pub fn new(
        encoder: Arc<dyn MeasurementChannel>,
        motion: Arc<dyn MotionChannel>,
        events: mpsc::UnboundedReceiver<ChannelEvent>,
    ) -> Self {
        Self {
            encoder,
            motion,
            events,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_distance_config_derives_steps_per_mm() {
        let tool = ToolConfig::from_rotation_distance("extruder", 16, 32.0);
        assert!((tool.steps_per_mm - 100.0).abs() < 1e-9);
        assert!((tool.step_distance() - 0.01).abs() < 1e-12);
    }

    #[test]
    fn with_steps_per_mm_updates_rotation_distance() {
        let tool = ToolConfig::from_rotation_distance("extruder", 16, 32.0);
        let updated = tool.with_steps_per_mm(400.0);
        assert_eq!(updated.steps_per_mm, 400.0);
        assert_eq!(updated.rotation_distance, Some(8.0));
        assert_eq!(updated.microsteps, Some(16));
    }

    #[test]
    fn with_steps_per_mm_leaves_plain_config_alone() {
        let tool = ToolConfig::new("T0", 93.0).with_max_temp(260.0);
        let updated = tool.with_steps_per_mm(95.5);
        assert_eq!(updated.rotation_distance, None);
        assert_eq!(updated.max_temp, Some(260.0));
    }

    #[test]
    fn channel_source_display() {
        assert_eq!(ChannelSource::Measurement.to_string(), "measurement");
        assert_eq!(ChannelSource::Motion.to_string(), "motion");
    }
}
