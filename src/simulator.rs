// SimulatedRig - virtual encoder and printer for dry runs
//
// The virtual extruder moves `commanded * configured / true` mm of
// filament per move, so a wrong steps/mm shows up exactly as it would on
// hardware. Above `max_flow_mm3_per_s` the drive gear slips and delivers
// proportionally less. Readings optionally carry uniform noise.

use std::sync::{Arc, Mutex, MutexGuard};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::channel::{
    ChannelEvent, ChannelSet, ChannelSource, EncoderMode, MeasurementChannel, MotionChannel,
    ToolConfig,
};
use crate::error::ChannelError;

/// Physical parameters of the simulated extruder
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    /// Value the virtual controller starts with
    pub steps_per_mm: f64,
    /// Value that would make the extruder move exactly as commanded
    pub true_steps_per_mm: f64,
    /// Flow above which the drive starts slipping
    pub max_flow_mm3_per_s: f64,
    /// Fraction of filament lost per mm³/s above the limit
    pub slip_per_mm3: f64,
    /// Half-width of uniform measurement noise in mm; 0 is deterministic
    pub noise_mm: f64,
    pub filament_diameter_mm: f64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            steps_per_mm: 93.0,
            true_steps_per_mm: 93.0,
            max_flow_mm3_per_s: 15.0,
            slip_per_mm3: 0.04,
            noise_mm: 0.0,
            filament_diameter_mm: 1.75,
        }
    }
}

struct RigState {
    config: SimulatorConfig,
    mode: EncoderMode,
    accumulated_mm: f64,
    events: Option<mpsc::UnboundedSender<ChannelEvent>>,
}

impl RigState {
    /// Filament that actually passes the encoder for one commanded move
    fn delivered(&self, distance_mm: f64, feedrate_mm_per_min: f64) -> f64 {
        let config = &self.config;
        let ratio = config.steps_per_mm / config.true_steps_per_mm;
        let moved = distance_mm * ratio;

        let radius = config.filament_diameter_mm / 2.0;
        let area = std::f64::consts::PI * radius * radius;
        let flow = (feedrate_mm_per_min / 60.0) * area * ratio.abs();
        let excess = (flow - config.max_flow_mm3_per_s).max(0.0);
        let grip = (1.0 - excess * config.slip_per_mm3).clamp(0.0, 1.0);
        moved * grip
    }
}

struct RigInner {
    state: Mutex<RigState>,
}

impl RigInner {
    fn lock(&self) -> MutexGuard<'_, RigState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Shared handle to one virtual encoder + printer
#[derive(Clone)]
pub struct SimulatedRig {
    inner: Arc<RigInner>,
}

impl SimulatedRig {
    pub fn new(config: SimulatorConfig) -> Self {
        Self {
            inner: Arc::new(RigInner {
                state: Mutex::new(RigState {
                    config,
                    mode: EncoderMode::Absolute,
                    accumulated_mm: 0.0,
                    events: None,
                }),
            }),
        }
    }

    /// Fresh channel set for one run. Replies of earlier sets stop.
    pub fn channels(&self) -> ChannelSet {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        self.inner.lock().events = Some(events_tx);
        ChannelSet::new(
            Arc::clone(&self.inner) as Arc<dyn MeasurementChannel>,
            Arc::clone(&self.inner) as Arc<dyn MotionChannel>,
            events_rx,
        )
    }

    /// Steps/mm currently configured on the virtual controller
    pub fn steps_per_mm(&self) -> f64 {
        self.inner.lock().config.steps_per_mm
    }

    /// Move filament past the encoder without going through the controller
    pub fn push_filament(&self, distance_mm: f64) {
        self.inner.lock().accumulated_mm += distance_mm;
    }
}

impl MeasurementChannel for RigInner {
    fn set_mode(&self, mode: EncoderMode) -> Result<(), ChannelError> {
        self.lock().mode = mode;
        Ok(())
    }

    fn reset_accumulator(&self) -> Result<(), ChannelError> {
        self.lock().accumulated_mm = 0.0;
        Ok(())
    }

    fn request_measurement(&self, request_id: u64) -> Result<(), ChannelError> {
        let mut state = self.lock();
        let mut value = state.accumulated_mm;
        if state.mode == EncoderMode::Relative {
            state.accumulated_mm = 0.0;
        }
        if state.config.noise_mm > 0.0 {
            let noise = state.config.noise_mm;
            value += rand::thread_rng().gen_range(-noise..=noise);
        }

        let events = state.events.as_ref().ok_or_else(|| ChannelError::Disconnected {
            source: ChannelSource::Measurement,
            reason: "simulated encoder has no listener".to_string(),
        })?;
        events
            .send(ChannelEvent::Measurement { request_id, value })
            .map_err(|_| ChannelError::Disconnected {
                source: ChannelSource::Measurement,
                reason: "run is no longer listening".to_string(),
            })
    }
}

impl MotionChannel for RigInner {
    fn command_extrude(&self, distance_mm: f64, feedrate_mm_per_min: f64) -> Result<(), ChannelError> {
        if !(feedrate_mm_per_min.is_finite() && feedrate_mm_per_min > 0.0) {
            return Err(ChannelError::CommandRejected {
                source: ChannelSource::Motion,
                reason: format!("feedrate {}", feedrate_mm_per_min),
            });
        }
        let mut state = self.lock();
        let delivered = state.delivered(distance_mm, feedrate_mm_per_min);
        state.accumulated_mm += delivered;
        log::trace!(
            "[Simulator] G1 E{} F{} delivered {:.4} mm",
            distance_mm,
            feedrate_mm_per_min,
            delivered
        );
        Ok(())
    }

    fn set_steps_per_mm(&self, tool: usize, value: f64) -> Result<(), ChannelError> {
        if tool != 0 || !(value.is_finite() && value > 0.0) {
            return Err(ChannelError::CommandRejected {
                source: ChannelSource::Motion,
                reason: format!("M92 T{} E{}", tool, value),
            });
        }
        self.lock().config.steps_per_mm = value;
        Ok(())
    }

    fn tool_config(&self, tool: usize) -> Option<ToolConfig> {
        (tool == 0).then(|| ToolConfig::new("extruder", self.lock().config.steps_per_mm))
    }
}
