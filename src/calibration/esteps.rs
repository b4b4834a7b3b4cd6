// EStepsProcedure - two-pass steps/mm correction
//
// Coarse pass: short fast extrusions, correction written to the tool.
// Fine pass: longer slow extrusions starting from the coarse value, final
// correction written to the tool.

use crate::calibration::context::{Halt, ProcedureContext};
use crate::calibration::progress::{CalibrationEvent, CalibrationProgress};
use crate::calibration::reducer::{self, CalibrationResult};
use crate::calibration::session::{CalibrationSession, Phase, ProcedureKind};
use crate::channel::EncoderMode;
use crate::config::{EStepsConfig, MovePlan};
use crate::error::CalibrationError;

pub struct EStepsProcedure {
    config: EStepsConfig,
    tool: usize,
    session: CalibrationSession,
}

impl EStepsProcedure {
    pub fn new(config: EStepsConfig, tool: usize) -> Self {
        let session = CalibrationSession::new(
            ProcedureKind::ESteps,
            config.coarse.distance_mm,
            config.coarse.feedrate_mm_per_min,
        );
        Self {
            config,
            tool,
            session,
        }
    }

    pub fn session(&self) -> &CalibrationSession {
        &self.session
    }

    /// Run both passes and return the corrected value.
    ///
    /// The session is terminated whatever the outcome.
    pub async fn run(&mut self, ctx: &mut ProcedureContext) -> Result<CalibrationResult, Halt> {
        let result = self.execute(ctx).await;
        self.session.terminate();
        result
    }

    async fn execute(&mut self, ctx: &mut ProcedureContext) -> Result<CalibrationResult, Halt> {
        let tool_config = ctx.tool_config(self.tool)?;
        let previous = tool_config.steps_per_mm;
        if !(previous.is_finite() && previous > 0.0) {
            return Err(CalibrationError::InvalidConfig {
                reason: format!(
                    "tool {} ({}) reports steps/mm {}",
                    self.tool, tool_config.name, previous
                ),
            }
            .into());
        }

        log::info!(
            "[ESteps] Calibrating tool {} ({}) from {:.3} steps/mm",
            self.tool,
            tool_config.name,
            previous
        );
        ctx.set_mode(EncoderMode::Relative)?;

        let coarse_plan = self.config.coarse;
        let coarse = self
            .run_phase(ctx, coarse_plan, self.config.coarse_iterations, previous)
            .await?;
        ctx.apply_steps_per_mm(self.tool, coarse)?;
        log::info!("[ESteps] Coarse pass applied {:.3} steps/mm", coarse);

        let fine_plan = self.config.fine;
        self.session
            .set_move(fine_plan.distance_mm, fine_plan.feedrate_mm_per_min);
        self.session.enter_fine();
        ctx.emit(CalibrationEvent::PhaseChanged {
            procedure: ProcedureKind::ESteps,
            phase: Phase::Fine,
            feedrate: fine_plan.feedrate_mm_per_min,
        });

        let fine = self
            .run_phase(ctx, fine_plan, self.config.fine_iterations, coarse)
            .await?;
        ctx.apply_steps_per_mm(self.tool, fine)?;
        log::info!(
            "[ESteps] Fine pass applied {:.3} steps/mm (was {:.3})",
            fine,
            previous
        );

        let coarse_count = self.config.coarse_iterations as usize;
        let samples = self.session.samples();
        let trace = samples[..coarse_count]
            .iter()
            .map(|s| reducer::percent_of_nominal(*s, coarse_plan.distance_mm))
            .chain(
                samples[coarse_count..]
                    .iter()
                    .map(|s| reducer::percent_of_nominal(*s, fine_plan.distance_mm)),
            )
            .collect();

        Ok(CalibrationResult::CorrectedStepsPerMm {
            steps_per_mm: fine,
            previous_steps_per_mm: previous,
            coarse_steps_per_mm: coarse,
            trace,
        })
    }

    /// One precision pass: `iterations` reset/extrude/settle/measure cycles,
    /// then the correction of `current` from the pass mean.
    async fn run_phase(
        &mut self,
        ctx: &mut ProcedureContext,
        plan: MovePlan,
        iterations: u32,
        current: f64,
    ) -> Result<f64, Halt> {
        let phase = self.session.phase();
        let first_sample = self.session.samples().len();

        for step in 1..=iterations {
            let iteration = self.session.begin_iteration();
            ctx.reset_accumulator()?;
            ctx.extrude_and_settle(
                plan.distance_mm,
                plan.feedrate_mm_per_min,
                plan.settle_margin_ms,
            )
            .await?;
            let sample = ctx.measure().await?;
            self.session.record(sample);

            tracing::debug!(
                "[ESteps] {} {}/{}: {:.3} mm of {} mm",
                phase.display_name(),
                step,
                iterations,
                sample,
                plan.distance_mm
            );

            let running = reducer::mean(self.session.samples_since(first_sample))
                .and_then(|m| {
                    reducer::corrected_steps_per_mm(current, m, plan.distance_mm, phase.display_name())
                        .ok()
                });
            ctx.emit_progress(
                CalibrationProgress::new(
                    ProcedureKind::ESteps,
                    iteration,
                    plan.feedrate_mm_per_min,
                    sample,
                )
                .with_total(self.config.coarse_iterations + self.config.fine_iterations)
                .with_phase(phase)
                .with_running_value(running),
            );
        }

        let phase_mean = reducer::mean(self.session.samples_since(first_sample)).unwrap_or(0.0);
        let corrected = reducer::corrected_steps_per_mm(
            current,
            phase_mean,
            plan.distance_mm,
            phase.display_name(),
        )?;
        Ok(corrected)
    }
}

#[cfg(test)]
#[path = "esteps_tests.rs"]
mod tests;
