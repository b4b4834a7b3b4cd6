// Run driver - one procedure, one outcome
//
// Validates the configuration, announces the run, dispatches to the chosen
// procedure and converts whatever it returns into exactly one RunOutcome
// and one terminal event.

use crate::calibration::consistency::ConsistencyProcedure;
use crate::calibration::context::{Halt, ProcedureContext};
use crate::calibration::esteps::EStepsProcedure;
use crate::calibration::progress::{CalibrationEvent, RunOutcome};
use crate::calibration::reducer::CalibrationResult;
use crate::calibration::session::{CalibrationSession, ProcedureKind};
use crate::calibration::volumetric::VolumetricProcedure;
use crate::config::AppConfig;
use crate::error::log_calibration_error;
use crate::telemetry;

/// The three calibration procedures behind one dispatch point
pub enum Procedure {
    ESteps(EStepsProcedure),
    Consistency(ConsistencyProcedure),
    Volumetric(VolumetricProcedure),
}

impl Procedure {
    pub fn for_kind(kind: ProcedureKind, tool: usize, config: &AppConfig) -> Self {
        match kind {
            ProcedureKind::ESteps => {
                Procedure::ESteps(EStepsProcedure::new(config.esteps.clone(), tool))
            }
            ProcedureKind::Consistency => {
                Procedure::Consistency(ConsistencyProcedure::new(config.consistency.clone()))
            }
            ProcedureKind::Volumetric => {
                Procedure::Volumetric(VolumetricProcedure::new(config.volumetric.clone()))
            }
        }
    }

    pub async fn run(&mut self, ctx: &mut ProcedureContext) -> Result<CalibrationResult, Halt> {
        match self {
            Procedure::ESteps(p) => p.run(ctx).await,
            Procedure::Consistency(p) => p.run(ctx).await,
            Procedure::Volumetric(p) => p.run(ctx).await,
        }
    }

    pub fn session(&self) -> &CalibrationSession {
        match self {
            Procedure::ESteps(p) => p.session(),
            Procedure::Consistency(p) => p.session(),
            Procedure::Volumetric(p) => p.session(),
        }
    }
}

/// Run one procedure to completion, abort or failure.
///
/// # Arguments
/// * `kind` - Procedure to run
/// * `tool` - Tool index; only ESteps writes to it
/// * `config` - Snapshot of the configuration for this run
/// * `ctx` - Channels, abort signal and progress sender
///
/// # Returns
/// The run's single outcome. The matching terminal event has already been
/// published when this returns.
pub async fn run_procedure(
    kind: ProcedureKind,
    tool: usize,
    config: &AppConfig,
    mut ctx: ProcedureContext,
) -> RunOutcome {
    let outcome = execute_run(kind, tool, config, &mut ctx).await;
    ctx.emit(outcome.terminal_event());
    outcome
}

/// Same as [`run_procedure`] but leaves publishing the terminal event to the
/// caller, so it can release run state first.
pub async fn execute_run(
    kind: ProcedureKind,
    tool: usize,
    config: &AppConfig,
    ctx: &mut ProcedureContext,
) -> RunOutcome {
    let outcome = match config.validate() {
        Ok(()) => {
            ctx.emit(CalibrationEvent::Started {
                procedure: kind,
                tool,
            });
            telemetry::hub().record_run_started(kind, tool);
            log::info!("[Runner] {} started on tool {}", kind.display_name(), tool);

            let mut procedure = Procedure::for_kind(kind, tool, config);
            let result = procedure.run(ctx).await;
            tracing::debug!(
                "[Runner] {} stopped after {} iterations",
                kind.display_name(),
                procedure.session().iteration()
            );
            outcome_from(result)
        }
        Err(err) => RunOutcome::Failed { error: err },
    };

    match &outcome {
        RunOutcome::Finished { .. } => {
            log::info!("[Runner] {} finished", kind.display_name());
        }
        RunOutcome::Aborted { reason } => {
            log::warn!("[Runner] {} aborted: {}", kind.display_name(), reason);
        }
        RunOutcome::Failed { error } => {
            log_calibration_error(error, kind.display_name());
            telemetry::hub().record_error(error, kind.display_name());
        }
    }
    telemetry::hub().record_run_finished(kind, &outcome);
    outcome
}

fn outcome_from(result: Result<CalibrationResult, Halt>) -> RunOutcome {
    match result {
        Ok(result) => RunOutcome::Finished { result },
        Err(Halt::Aborted(reason)) => RunOutcome::Aborted { reason },
        Err(Halt::Failed(error)) => RunOutcome::Failed { error },
    }
}
