// VolumetricProcedure - stepped search for the highest sustainable feedrate
//
// State machine over Coarse -> Fine -> Done. The feedrate only rises,
// except for one backoff when the coarse pass ends and one when the fine
// pass ends. Termination is only legal from Fine.

use crate::calibration::context::{Halt, ProcedureContext};
use crate::calibration::progress::{CalibrationEvent, CalibrationProgress};
use crate::calibration::reducer::{self, CalibrationResult, VolumetricPoint};
use crate::calibration::session::{CalibrationSession, Phase, ProcedureKind};
use crate::channel::EncoderMode;
use crate::config::VolumetricConfig;
use crate::error::CalibrationError;

pub struct VolumetricProcedure {
    config: VolumetricConfig,
    session: CalibrationSession,
    step: f64,
    trace: Vec<VolumetricPoint>,
}

impl VolumetricProcedure {
    pub fn new(config: VolumetricConfig) -> Self {
        let session = CalibrationSession::new(
            ProcedureKind::Volumetric,
            config.distance_mm,
            config.base_feedrate,
        );
        let step = config.coarse_step;
        Self {
            config,
            session,
            step,
            trace: Vec::new(),
        }
    }

    pub fn session(&self) -> &CalibrationSession {
        &self.session
    }

    /// Feedrate/under-extrusion pairs measured so far
    pub fn trace(&self) -> &[VolumetricPoint] {
        &self.trace
    }

    pub async fn run(&mut self, ctx: &mut ProcedureContext) -> Result<CalibrationResult, Halt> {
        let result = self.execute(ctx).await;
        self.session.terminate();
        result
    }

    async fn execute(&mut self, ctx: &mut ProcedureContext) -> Result<CalibrationResult, Halt> {
        let distance = self.config.distance_mm;

        ctx.set_mode(EncoderMode::Relative)?;
        ctx.prime(&self.config.prime).await?;
        ctx.reset_accumulator()?;
        self.session.set_move(distance, self.config.base_feedrate);
        self.step = self.config.coarse_step;
        log::info!(
            "[Volumetric] Searching from F{} in steps of {}",
            self.config.base_feedrate,
            self.step
        );

        loop {
            self.check_headroom()?;
            let feedrate = self.session.raise_feedrate(self.step);
            if feedrate > self.config.max_feedrate {
                return Err(self.exhausted().into());
            }

            let iteration = self.session.begin_iteration();
            ctx.reset_accumulator()?;
            ctx.extrude_and_settle(distance, feedrate, self.config.settle_margin_ms)
                .await?;
            let sample = ctx.measure().await?;

            let under = reducer::under_extrusion_pct(sample, distance, self.config.noise_floor_pct);
            if !under.is_finite() {
                return Err(CalibrationError::DegenerateMeasurement {
                    stage: "volumetric".to_string(),
                    value: sample,
                    nominal_mm: distance,
                }
                .into());
            }
            self.session.record(under);
            self.trace.push(VolumetricPoint {
                feedrate,
                under_extrusion_pct: under,
            });

            let phase = self.session.phase();
            tracing::debug!(
                "[Volumetric] {} F{}: {:.3} mm, {:.2}% under",
                phase.display_name(),
                feedrate,
                sample,
                under
            );
            ctx.emit_progress(
                CalibrationProgress::new(ProcedureKind::Volumetric, iteration, feedrate, sample)
                    .with_phase(phase)
                    .with_running_value(Some(under)),
            );

            match phase {
                Phase::Coarse if under >= self.config.transition_threshold_pct => {
                    let resumed = self.session.back_off_feedrate(self.config.transition_backoff);
                    self.step = self.config.fine_step;
                    self.session.enter_fine();
                    log::info!(
                        "[Volumetric] {:.2}% under at F{}, fine search from F{}",
                        under,
                        feedrate,
                        resumed
                    );
                    ctx.emit(CalibrationEvent::PhaseChanged {
                        procedure: ProcedureKind::Volumetric,
                        phase: Phase::Fine,
                        feedrate: resumed,
                    });
                }
                Phase::Fine if under >= self.config.termination_threshold_pct => {
                    let ending = self
                        .session
                        .back_off_feedrate(self.step + self.config.termination_margin);
                    return self.finish(ending);
                }
                _ => {}
            }
        }
    }

    fn check_headroom(&self) -> Result<(), CalibrationError> {
        if self.session.iteration() >= self.config.max_iterations {
            return Err(self.exhausted());
        }
        Ok(())
    }

    fn exhausted(&self) -> CalibrationError {
        log::warn!(
            "[Volumetric] No limit found after {} iterations (F{})",
            self.session.iteration(),
            self.session.feedrate()
        );
        CalibrationError::SearchExhausted {
            iterations: self.session.iteration(),
            feedrate: self.session.feedrate(),
        }
    }

    fn finish(&mut self, ending_feedrate: f64) -> Result<CalibrationResult, Halt> {
        if !(ending_feedrate.is_finite() && ending_feedrate > 0.0) {
            return Err(CalibrationError::DegenerateMeasurement {
                stage: "volumetric".to_string(),
                value: ending_feedrate,
                nominal_mm: self.config.distance_mm,
            }
            .into());
        }

        let max_flow = reducer::max_volumetric_flow(
            ending_feedrate,
            self.config.filament_area_mm2(),
            self.config.flow_safety_margin,
        );
        log::info!(
            "[Volumetric] Limit F{} -> {:.2} mm³/s",
            ending_feedrate,
            max_flow
        );

        Ok(CalibrationResult::VolumetricLimit {
            max_flow_mm3_per_s: max_flow,
            ending_feedrate,
            trace: self.trace.clone(),
        })
    }
}
