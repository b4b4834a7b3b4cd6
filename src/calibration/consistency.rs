// ConsistencyProcedure - repeatability of identical extrusions
//
// One priming move, one reset, then a fixed number of identical moves. The
// encoder stays in relative mode so each reading covers only its own move.

use crate::calibration::context::{Halt, ProcedureContext};
use crate::calibration::progress::CalibrationProgress;
use crate::calibration::reducer::{self, CalibrationResult};
use crate::calibration::session::{CalibrationSession, ProcedureKind};
use crate::channel::EncoderMode;
use crate::config::ConsistencyConfig;
use crate::error::CalibrationError;

pub struct ConsistencyProcedure {
    config: ConsistencyConfig,
    session: CalibrationSession,
}

impl ConsistencyProcedure {
    pub fn new(config: ConsistencyConfig) -> Self {
        let session = CalibrationSession::new(
            ProcedureKind::Consistency,
            config.extrude.distance_mm,
            config.extrude.feedrate_mm_per_min,
        );
        Self { config, session }
    }

    pub fn session(&self) -> &CalibrationSession {
        &self.session
    }

    pub async fn run(&mut self, ctx: &mut ProcedureContext) -> Result<CalibrationResult, Halt> {
        let result = self.execute(ctx).await;
        self.session.terminate();
        result
    }

    async fn execute(&mut self, ctx: &mut ProcedureContext) -> Result<CalibrationResult, Halt> {
        let plan = self.config.extrude;
        let total = self.config.iterations;

        ctx.set_mode(EncoderMode::Relative)?;
        ctx.prime(&self.config.prime).await?;
        ctx.reset_accumulator()?;
        log::info!(
            "[Consistency] Primed, running {} x {} mm @ {} mm/min",
            total,
            plan.distance_mm,
            plan.feedrate_mm_per_min
        );

        for _ in 0..total {
            let iteration = self.session.begin_iteration();
            ctx.extrude_and_settle(
                plan.distance_mm,
                plan.feedrate_mm_per_min,
                plan.settle_margin_ms,
            )
            .await?;
            let sample = ctx.measure().await?;
            if !sample.is_finite() {
                return Err(CalibrationError::DegenerateMeasurement {
                    stage: "consistency".to_string(),
                    value: sample,
                    nominal_mm: plan.distance_mm,
                }
                .into());
            }

            let deviation = reducer::deviation_pct(sample, plan.distance_mm);
            self.session.record(deviation);
            tracing::debug!(
                "[Consistency] {}/{}: {:.3} mm ({:+.2}%)",
                iteration,
                total,
                sample,
                deviation
            );

            ctx.emit_progress(
                CalibrationProgress::new(
                    ProcedureKind::Consistency,
                    iteration,
                    plan.feedrate_mm_per_min,
                    sample,
                )
                .with_total(total)
                .with_running_value(reducer::mean(self.session.samples())),
            );
        }

        let average = reducer::mean(self.session.samples()).unwrap_or(0.0);
        let average_deviation_pct = reducer::round_to(average, 2);
        log::info!(
            "[Consistency] Average deviation {:.2}% over {} extrusions",
            average_deviation_pct,
            total
        );

        Ok(CalibrationResult::ConsistencyReport {
            average_deviation_pct,
            samples: self.session.samples().to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::progress::CalibrationEvent;
    use crate::testing::{Command, EncoderReply, ScriptedRig};

    #[tokio::test(start_paused = true)]
    async fn test_exact_samples_average_zero() {
        let rig = ScriptedRig::with_samples(vec![20.0; 20], 93.0);
        let (mut ctx, _abort, _events) = rig.into_context();

        let mut procedure = ConsistencyProcedure::new(ConsistencyConfig::default());
        let result = procedure.run(&mut ctx).await.unwrap();

        assert_eq!(
            result,
            CalibrationResult::ConsistencyReport {
                average_deviation_pct: 0.0,
                samples: vec![0.0; 20],
            }
        );
        assert_eq!(procedure.session().iteration(), 20);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deviation_trace_keeps_iteration_order() {
        let mut samples = vec![20.0; 20];
        samples[0] = 19.0;
        samples[19] = 20.5;
        let rig = ScriptedRig::with_samples(samples, 93.0);
        let (mut ctx, _abort, _events) = rig.into_context();

        let mut procedure = ConsistencyProcedure::new(ConsistencyConfig::default());
        let result = procedure.run(&mut ctx).await.unwrap();

        match result {
            CalibrationResult::ConsistencyReport {
                average_deviation_pct,
                samples,
            } => {
                assert_eq!(samples.len(), 20);
                assert!((samples[0] + 5.0).abs() < 1e-9);
                assert!((samples[19] - 2.5).abs() < 1e-9);
                // (-5 + 2.5) / 20 = -0.125 -> -0.13
                assert_eq!(average_deviation_pct, -0.13);
            }
            other => panic!("Expected consistency report, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_carries_raw_reading() {
        let rig = ScriptedRig::with_samples(vec![19.0, 20.5], 93.0);
        let (mut ctx, _abort, mut events) = rig.into_context();

        let config = ConsistencyConfig {
            iterations: 2,
            ..ConsistencyConfig::default()
        };
        ConsistencyProcedure::new(config).run(&mut ctx).await.unwrap();

        let mut progress = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let CalibrationEvent::Progress(p) = event {
                progress.push(p);
            }
        }
        assert_eq!(progress.len(), 2);
        assert_eq!(progress[0].latest_sample, 19.0);
        assert_eq!(progress[1].latest_sample, 20.5);
        // Running value is the mean deviation in %: (-5 + 2.5) / 2
        assert!((progress[1].running_value.unwrap() + 1.25).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prime_then_single_reset() {
        let rig = ScriptedRig::with_samples(vec![20.0; 3], 93.0);
        let log = rig.log();
        let (mut ctx, _abort, _events) = rig.into_context();

        let config = ConsistencyConfig {
            iterations: 3,
            ..ConsistencyConfig::default()
        };
        let mut procedure = ConsistencyProcedure::new(config);
        procedure.run(&mut ctx).await.unwrap();

        let commands = log.commands();
        assert_eq!(commands[0], Command::SetMode(EncoderMode::Relative));
        assert_eq!(
            commands[1],
            Command::Extrude {
                distance_mm: 5.0,
                feedrate: 600.0
            }
        );
        assert_eq!(commands[2], Command::Reset);
        assert_eq!(
            commands.iter().filter(|c| **c == Command::Reset).count(),
            1
        );
        assert_eq!(commands.len(), 3 + 3 * 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_reading_does_not_end_run_early() {
        let mut samples = vec![20.0; 20];
        samples[4] = 0.0;
        let rig = ScriptedRig::with_samples(samples, 93.0);
        let (mut ctx, _abort, _events) = rig.into_context();

        let mut procedure = ConsistencyProcedure::new(ConsistencyConfig::default());
        let result = procedure.run(&mut ctx).await.unwrap();

        match result {
            CalibrationResult::ConsistencyReport { samples, .. } => {
                assert_eq!(samples.len(), 20);
                assert_eq!(samples[4], -100.0);
            }
            other => panic!("Expected consistency report, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_channel_failure_mid_run() {
        let mut replies: Vec<_> = (0..5).map(|_| EncoderReply::Value(20.0)).collect();
        replies.push(EncoderReply::Fail(crate::error::ChannelError::Disconnected {
            source: crate::channel::ChannelSource::Measurement,
            reason: "port closed".to_string(),
        }));
        let rig = ScriptedRig::with_replies(replies, 93.0);
        let (mut ctx, _abort, _events) = rig.into_context();

        let mut procedure = ConsistencyProcedure::new(ConsistencyConfig::default());
        let err = procedure.run(&mut ctx).await.unwrap_err();

        match err {
            Halt::Failed(CalibrationError::ChannelFailure { reason }) => {
                assert!(reason.contains("port closed"));
            }
            other => panic!("Expected channel failure, got {:?}", other),
        }
        assert_eq!(procedure.session().samples().len(), 5);
        assert!(procedure.session().is_terminated());
    }
}
