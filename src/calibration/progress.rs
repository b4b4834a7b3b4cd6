// Progress tracking and terminal events for calibration runs
//
// This module provides the types a presentation layer consumes: one
// `Progress` event per completed iteration, a `PhaseChanged` marker, and
// exactly one terminal event (`Finished`, `Aborted` or `Error`) per run.

use serde::{Deserialize, Serialize};

use crate::calibration::reducer::CalibrationResult;
use crate::calibration::session::{Phase, ProcedureKind};
use crate::error::{CalibrationError, ErrorCode};

/// Progress information for the iteration that just completed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationProgress {
    pub procedure: ProcedureKind,
    /// 1-based iteration index
    pub iteration: u32,
    /// Planned iteration count, `None` for open-ended searches
    pub total_iterations: Option<u32>,
    pub phase: Option<Phase>,
    /// Feedrate commanded for this iteration (mm/min)
    pub feedrate: f64,
    /// Raw encoder reading for this iteration in mm, before any reduction
    pub latest_sample: f64,
    /// Running estimate: corrected steps/mm, average deviation, or
    /// under-extrusion depending on the procedure
    pub running_value: Option<f64>,
}

impl CalibrationProgress {
    /// Create a new progress instance
    ///
    /// # Arguments
    /// * `procedure` - Procedure reporting progress
    /// * `iteration` - Iteration just completed (1-based)
    /// * `feedrate` - Feedrate commanded for the iteration
    /// * `latest_sample` - Encoder reading in mm for the iteration
    pub fn new(procedure: ProcedureKind, iteration: u32, feedrate: f64, latest_sample: f64) -> Self {
        Self {
            procedure,
            iteration,
            total_iterations: None,
            phase: None,
            feedrate,
            latest_sample,
            running_value: None,
        }
    }

    pub fn with_total(mut self, total_iterations: u32) -> Self {
        self.total_iterations = Some(total_iterations);
        self
    }

    pub fn with_phase(mut self, phase: Phase) -> Self {
        self.phase = Some(phase);
        self
    }

    pub fn with_running_value(mut self, running_value: Option<f64>) -> Self {
        self.running_value = running_value;
        self
    }

    /// Get progress percentage (0-100), `None` when the total is open-ended
    pub fn percentage(&self) -> Option<u8> {
        let total = self.total_iterations?;
        if total == 0 {
            return Some(0);
        }
        let pct = (self.iteration as f64 / total as f64 * 100.0).min(100.0);
        Some(pct as u8)
    }
}

/// Event stream produced by a calibration run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CalibrationEvent {
    Started {
        procedure: ProcedureKind,
        tool: usize,
    },
    PhaseChanged {
        procedure: ProcedureKind,
        phase: Phase,
        feedrate: f64,
    },
    Progress(CalibrationProgress),
    Finished {
        result: CalibrationResult,
    },
    Aborted {
        reason: String,
    },
    Error {
        code: i32,
        message: String,
    },
}

impl CalibrationEvent {
    /// Whether this event ends the run
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CalibrationEvent::Finished { .. }
                | CalibrationEvent::Aborted { .. }
                | CalibrationEvent::Error { .. }
        )
    }
}

/// How a run ended; exactly one per run
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Finished { result: CalibrationResult },
    Aborted { reason: String },
    Failed { error: CalibrationError },
}

impl RunOutcome {
    pub fn is_finished(&self) -> bool {
        matches!(self, RunOutcome::Finished { .. })
    }

    pub fn result(&self) -> Option<&CalibrationResult> {
        match self {
            RunOutcome::Finished { result } => Some(result),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            RunOutcome::Finished { .. } => "finished",
            RunOutcome::Aborted { .. } => "aborted",
            RunOutcome::Failed { .. } => "failed",
        }
    }

    /// Event announcing this outcome to subscribers
    pub fn terminal_event(&self) -> CalibrationEvent {
        match self {
            RunOutcome::Finished { result } => CalibrationEvent::Finished {
                result: result.clone(),
            },
            RunOutcome::Aborted { reason } => CalibrationEvent::Aborted {
                reason: reason.clone(),
            },
            RunOutcome::Failed { error } => CalibrationEvent::Error {
                code: error.code(),
                message: error.message(),
            },
        }
    }
}
