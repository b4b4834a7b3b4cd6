// Result reducer - turns accumulated samples into calibration values
//
// Every formula the procedures use lives here so it can be checked in
// isolation. Reductions that could divide by zero return a
// DegenerateMeasurement error instead of producing inf/NaN.

use serde::{Deserialize, Serialize};

use crate::error::CalibrationError;

/// Final artifact of a completed run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CalibrationResult {
    CorrectedStepsPerMm {
        /// Value written to the tool after the fine pass
        steps_per_mm: f64,
        /// Value the tool had when the run started
        previous_steps_per_mm: f64,
        /// Value written to the tool after the coarse pass
        coarse_steps_per_mm: f64,
        /// Per-iteration `sample / nominal * 100`
        trace: Vec<f64>,
    },
    ConsistencyReport {
        average_deviation_pct: f64,
        /// Per-iteration deviation in %, index = iteration - 1
        samples: Vec<f64>,
    },
    VolumetricLimit {
        max_flow_mm3_per_s: f64,
        ending_feedrate: f64,
        trace: Vec<VolumetricPoint>,
    },
}

/// One volumetric search iteration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VolumetricPoint {
    pub feedrate: f64,
    pub under_extrusion_pct: f64,
}

/// Arithmetic mean, `None` for an empty slice
pub fn mean(samples: &[f64]) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    Some(samples.iter().sum::<f64>() / samples.len() as f64)
}

/// Round half away from zero to `decimals` places
pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// `current / (mean_sample / nominal)`
///
/// # Errors
/// `DegenerateMeasurement` when `mean_sample` is not a finite positive value
/// or `nominal_mm` is not positive.
pub fn corrected_steps_per_mm(
    current: f64,
    mean_sample: f64,
    nominal_mm: f64,
    stage: &str,
) -> Result<f64, CalibrationError> {
    let degenerate = |value: f64| CalibrationError::DegenerateMeasurement {
        stage: stage.to_string(),
        value,
        nominal_mm,
    };

    if !(nominal_mm.is_finite() && nominal_mm > 0.0) {
        return Err(degenerate(nominal_mm));
    }
    if !(mean_sample.is_finite() && mean_sample > 0.0) {
        return Err(degenerate(mean_sample));
    }

    let ratio = mean_sample / nominal_mm;
    let corrected = current / ratio;
    if !(corrected.is_finite() && corrected > 0.0) {
        return Err(degenerate(mean_sample));
    }
    Ok(corrected)
}

pub fn percent_of_nominal(sample: f64, nominal_mm: f64) -> f64 {
    sample / nominal_mm * 100.0
}

/// `((sample / nominal) - 1) * 100`
pub fn deviation_pct(sample: f64, nominal_mm: f64) -> f64 {
    (sample / nominal_mm - 1.0) * 100.0
}

/// Shortfall of `sample` against `distance_mm` in %, zero below `noise_floor_pct`
pub fn under_extrusion_pct(sample: f64, distance_mm: f64, noise_floor_pct: f64) -> f64 {
    let shortfall = 100.0 - (sample / distance_mm) * 100.0;
    if shortfall < noise_floor_pct {
        0.0
    } else {
        shortfall
    }
}

/// `(feedrate / 60) * area - safety_margin`, rounded to 2 decimals
pub fn max_volumetric_flow(feedrate_mm_per_min: f64, area_mm2: f64, safety_margin: f64) -> f64 {
    round_to((feedrate_mm_per_min / 60.0) * area_mm2 - safety_margin, 2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean() {
        assert_eq!(mean(&[]), None);
        assert_eq!(mean(&[19.0, 19.0, 21.0, 20.0]), Some(19.75));
    }

    #[test]
    fn test_documented_correction_example() {
        let mean_sample = mean(&[19.0, 19.0, 21.0, 20.0]).unwrap();
        assert_eq!(mean_sample, 19.75);
        assert!((mean_sample / 20.0 - 0.9875).abs() < 1e-12);

        let corrected = corrected_steps_per_mm(93.0, mean_sample, 20.0, "coarse").unwrap();
        assert!((corrected - 93.0 / 0.9875).abs() < 1e-9);
    }

    #[test]
    fn test_identity_when_mean_equals_nominal() {
        for current in [93.0, 100.0, 415.0, 762.3] {
            for nominal in [20.0, 50.0, 100.0] {
                let corrected = corrected_steps_per_mm(current, nominal, nominal, "fine").unwrap();
                assert!((corrected - current).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn test_correction_is_positive_and_finite() {
        for mean_sample in [0.001, 1.0, 19.5, 20.0, 80.0, 1.0e6] {
            let corrected = corrected_steps_per_mm(100.0, mean_sample, 20.0, "coarse").unwrap();
            assert!(corrected.is_finite());
            assert!(corrected > 0.0);
        }
    }

    #[test]
    fn test_zero_mean_is_degenerate() {
        let err = corrected_steps_per_mm(100.0, 0.0, 20.0, "coarse").unwrap_err();
        match err {
            CalibrationError::DegenerateMeasurement {
                stage,
                value,
                nominal_mm,
            } => {
                assert_eq!(stage, "coarse");
                assert_eq!(value, 0.0);
                assert_eq!(nominal_mm, 20.0);
            }
            other => panic!("Expected DegenerateMeasurement, got {:?}", other),
        }
    }

    #[test]
    fn test_negative_and_nan_means_are_degenerate() {
        assert!(corrected_steps_per_mm(100.0, -3.0, 20.0, "fine").is_err());
        assert!(corrected_steps_per_mm(100.0, f64::NAN, 20.0, "fine").is_err());
        assert!(corrected_steps_per_mm(100.0, f64::INFINITY, 20.0, "fine").is_err());
        assert!(corrected_steps_per_mm(100.0, 20.0, 0.0, "fine").is_err());
    }

    #[test]
    fn test_deviation_pct() {
        assert_eq!(deviation_pct(20.0, 20.0), 0.0);
        assert!((deviation_pct(19.8, 20.0) - -1.0).abs() < 1e-9);
        assert!((deviation_pct(20.4, 20.0) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_under_extrusion_noise_floor() {
        assert_eq!(under_extrusion_pct(60.0, 60.0, 0.25), 0.0);
        // 0.1% short is below the floor
        assert_eq!(under_extrusion_pct(59.94, 60.0, 0.25), 0.0);
        // over-extrusion never reports negative
        assert_eq!(under_extrusion_pct(61.0, 60.0, 0.25), 0.0);
        assert!((under_extrusion_pct(58.8, 60.0, 0.25) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_max_volumetric_flow() {
        // 600 mm/min = 10 mm/s through 2.405 mm², minus 0.5
        assert_eq!(max_volumetric_flow(600.0, 2.405, 0.5), 23.55);
    }

    #[test]
    fn test_round_to() {
        assert_eq!(round_to(1.23456, 2), 1.23);
        assert_eq!(round_to(-0.125, 2), -0.13);
        assert_eq!(round_to(0.0, 2), 0.0);
    }

    #[test]
    fn test_percent_of_nominal() {
        assert_eq!(percent_of_nominal(19.0, 20.0), 95.0);
    }
}
