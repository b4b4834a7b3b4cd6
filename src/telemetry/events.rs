//! Telemetry event types describing calibration runs for CLI surfaces and
//! log sinks.

use serde::{Deserialize, Serialize};

use crate::calibration::{ProcedureKind, RunOutcome};

/// Terminal state of a run, without its payload
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Finished,
    Aborted,
    Failed,
}

impl From<&RunOutcome> for OutcomeKind {
    fn from(outcome: &RunOutcome) -> Self {
        match outcome {
            RunOutcome::Finished { .. } => OutcomeKind::Finished,
            RunOutcome::Aborted { .. } => OutcomeKind::Aborted,
            RunOutcome::Failed { .. } => OutcomeKind::Failed,
        }
    }
}

/// Metric events covering run lifecycle, measurement latency and channel noise.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum MetricEvent {
    RunStarted {
        procedure: ProcedureKind,
        tool: usize,
        timestamp_ms: u64,
    },
    IterationCompleted {
        procedure: ProcedureKind,
        iteration: u32,
        sample: f64,
    },
    /// Rolling request-to-reply latency of measurement requests
    MeasurementLatency {
        avg_ms: f32,
        max_ms: f32,
        sample_count: usize,
    },
    ProtocolViolation {
        detail: String,
    },
    RunFinished {
        procedure: ProcedureKind,
        outcome: OutcomeKind,
        timestamp_ms: u64,
    },
    Error {
        code: i32,
        context: String,
    },
}
