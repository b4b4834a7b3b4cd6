//! Configuration management for calibration tuning
//!
//! This module provides runtime configuration loading from JSON files so the
//! move plans, thresholds and backoff magnitudes of each procedure can be
//! tuned per machine without recompilation. Every section is optional in the
//! file; missing sections and fields take the defaults below.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CalibrationError;

/// Complete application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub esteps: EStepsConfig,
    pub consistency: ConsistencyConfig,
    pub volumetric: VolumetricConfig,
    pub timing: TimingConfig,
}

/// One commanded extrusion and the margin added to its travel time
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MovePlan {
    pub distance_mm: f64,
    pub feedrate_mm_per_min: f64,
    /// Extra wait on top of the computed travel time
    pub settle_margin_ms: u64,
}

impl MovePlan {
    pub const fn new(distance_mm: f64, feedrate_mm_per_min: f64, settle_margin_ms: u64) -> Self {
        Self {
            distance_mm,
            feedrate_mm_per_min,
            settle_margin_ms,
        }
    }

    /// Settle wait for this move, compressed by `scale`
    pub fn settle_duration(&self, scale: f64) -> Duration {
        settle_duration(
            self.distance_mm,
            self.feedrate_mm_per_min,
            self.settle_margin_ms,
            scale,
        )
    }

    fn validate(&self, name: &str) -> Result<(), CalibrationError> {
        if !(self.distance_mm.is_finite() && self.distance_mm > 0.0) {
            return Err(invalid(format!("{name}: distance must be positive")));
        }
        if !(self.feedrate_mm_per_min.is_finite() && self.feedrate_mm_per_min > 0.0) {
            return Err(invalid(format!("{name}: feedrate must be positive")));
        }
        Ok(())
    }
}

/// Time for `distance_mm` at `feedrate_mm_per_min` plus `margin_ms`, scaled.
pub fn settle_duration(
    distance_mm: f64,
    feedrate_mm_per_min: f64,
    margin_ms: u64,
    scale: f64,
) -> Duration {
    let travel_secs = distance_mm.abs() / (feedrate_mm_per_min / 60.0);
    let total_secs = (travel_secs + margin_ms as f64 / 1000.0) * scale;
    Duration::from_secs_f64(total_secs.max(0.0))
}

/// E-steps procedure: coarse pass then fine pass
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EStepsConfig {
    pub coarse_iterations: u32,
    pub coarse: MovePlan,
    pub fine_iterations: u32,
    pub fine: MovePlan,
}

impl Default for EStepsConfig {
    fn default() -> Self {
        Self {
            coarse_iterations: 10,
            // 20mm at 4mm/s: 5s travel + 2.5s margin
            coarse: MovePlan::new(20.0, 240.0, 2500),
            fine_iterations: 10,
            // 50mm at 2mm/s: 25s travel + 5s margin
            fine: MovePlan::new(50.0, 120.0, 5000),
        }
    }
}

/// Consistency procedure: one priming move, then N identical extrusions
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsistencyConfig {
    pub prime: MovePlan,
    pub iterations: u32,
    pub extrude: MovePlan,
}

impl Default for ConsistencyConfig {
    fn default() -> Self {
        Self {
            prime: MovePlan::new(5.0, 600.0, 1500),
            iterations: 20,
            extrude: MovePlan::new(20.0, 120.0, 500),
        }
    }
}

/// Volumetric flow search parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumetricConfig {
    pub prime: MovePlan,
    /// Extrusion length of every search iteration
    pub distance_mm: f64,
    pub settle_margin_ms: u64,
    /// Feedrate before the first step is added
    pub base_feedrate: f64,
    pub coarse_step: f64,
    pub fine_step: f64,
    /// Under-extrusion that ends the coarse pass
    pub transition_threshold_pct: f64,
    /// Under-extrusion that ends the fine pass
    pub termination_threshold_pct: f64,
    /// Feedrate taken back when switching to the fine pass
    pub transition_backoff: f64,
    /// Added to the fine step when backing off at termination
    pub termination_margin: f64,
    /// Under-extrusion below this is reported as zero
    pub noise_floor_pct: f64,
    pub filament_diameter_mm: f64,
    /// Subtracted from the computed flow (mm³/s)
    pub flow_safety_margin: f64,
    pub max_iterations: u32,
    pub max_feedrate: f64,
}

impl Default for VolumetricConfig {
    fn default() -> Self {
        Self {
            prime: MovePlan::new(5.0, 600.0, 1500),
            distance_mm: 60.0,
            settle_margin_ms: 500,
            base_feedrate: 240.0,
            coarse_step: 60.0,
            fine_step: 10.0,
            transition_threshold_pct: 2.0,
            termination_threshold_pct: 3.0,
            transition_backoff: 50.0,
            termination_margin: 5.0,
            noise_floor_pct: 0.25,
            filament_diameter_mm: 1.75,
            flow_safety_margin: 0.5,
            max_iterations: 200,
            max_feedrate: 6000.0,
        }
    }
}

impl VolumetricConfig {
    /// Cross-section of the filament in mm²
    pub fn filament_area_mm2(&self) -> f64 {
        let radius = self.filament_diameter_mm / 2.0;
        std::f64::consts::PI * radius * radius
    }
}

/// Timing knobs shared by all procedures
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Multiplier applied to every settle wait (1.0 = real time)
    pub settle_scale: f64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self { settle_scale: 1.0 }
    }
}

fn invalid(reason: String) -> CalibrationError {
    CalibrationError::InvalidConfig { reason }
}

impl AppConfig {
    /// Load configuration from JSON file
    ///
    /// # Arguments
    /// * `path` - Path to JSON config file
    ///
    /// # Returns
    /// The parsed configuration, or the defaults if the file is missing or
    /// its JSON is invalid
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Self {
        match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(config) => {
                    log::info!("[Config] Loaded configuration from {:?}", path.as_ref());
                    config
                }
                Err(err) => {
                    log::warn!(
                        "[Config] Failed to parse JSON from {:?}: {}. Using defaults.",
                        path.as_ref(),
                        err
                    );
                    Self::default()
                }
            },
            Err(err) => {
                log::warn!(
                    "[Config] Failed to read config file {:?}: {}. Using defaults.",
                    path.as_ref(),
                    err
                );
                Self::default()
            }
        }
    }

    /// Load configuration from the default asset location
    pub fn load() -> Self {
        Self::load_from_file("assets/calibration_config.json")
    }

    /// Reject configurations the procedures cannot run safely
    pub fn validate(&self) -> Result<(), CalibrationError> {
        let esteps = &self.esteps;
        if esteps.coarse_iterations == 0 || esteps.fine_iterations == 0 {
            return Err(invalid("esteps: iteration counts must be non-zero".into()));
        }
        esteps.coarse.validate("esteps.coarse")?;
        esteps.fine.validate("esteps.fine")?;

        let consistency = &self.consistency;
        if consistency.iterations == 0 {
            return Err(invalid("consistency: iterations must be non-zero".into()));
        }
        consistency.prime.validate("consistency.prime")?;
        consistency.extrude.validate("consistency.extrude")?;

        let vol = &self.volumetric;
        vol.prime.validate("volumetric.prime")?;
        if !(vol.distance_mm > 0.0 && vol.base_feedrate > 0.0) {
            return Err(invalid(
                "volumetric: distance and base feedrate must be positive".into(),
            ));
        }
        if !(vol.coarse_step > 0.0 && vol.fine_step > 0.0) {
            return Err(invalid("volumetric: feedrate steps must be positive".into()));
        }
        if vol.fine_step > vol.coarse_step {
            return Err(invalid(
                "volumetric: fine step must not exceed coarse step".into(),
            ));
        }
        if !(vol.transition_threshold_pct > 0.0
            && vol.transition_threshold_pct <= vol.termination_threshold_pct)
        {
            return Err(invalid(
                "volumetric: need 0 < transition threshold <= termination threshold".into(),
            ));
        }
        if vol.transition_backoff < 0.0 || vol.termination_margin < 0.0 {
            return Err(invalid("volumetric: backoffs must not be negative".into()));
        }
        if vol.filament_diameter_mm <= 0.0 {
            return Err(invalid(
                "volumetric: filament diameter must be positive".into(),
            ));
        }
        if vol.max_iterations == 0 || vol.max_feedrate <= vol.base_feedrate {
            return Err(invalid(
                "volumetric: search limits leave no room to search".into(),
            ));
        }

        if !(self.timing.settle_scale.is_finite() && self.timing.settle_scale >= 0.0) {
            return Err(invalid("timing: settle_scale must be >= 0".into()));
        }
        Ok(())
    }
}
