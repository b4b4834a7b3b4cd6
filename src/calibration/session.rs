// CalibrationSession - per-run mutable state
//
// A session is created when a procedure starts, owned exclusively by that
// procedure, and discarded once its result (or abort) has been reported.
// Nothing here is shared between runs.

use serde::{Deserialize, Serialize};

/// Which calibration procedure a session belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcedureKind {
    #[serde(rename = "esteps")]
    ESteps,
    Consistency,
    Volumetric,
}

impl ProcedureKind {
    /// Get human-readable name for display and log prefixes
    pub fn display_name(&self) -> &'static str {
        match self {
            ProcedureKind::ESteps => "ESteps",
            ProcedureKind::Consistency => "Consistency",
            ProcedureKind::Volumetric => "Volumetric",
        }
    }
}

/// Precision pass of a two-pass procedure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Coarse,
    Fine,
}

impl Phase {
    pub fn display_name(&self) -> &'static str {
        match self {
            Phase::Coarse => "coarse",
            Phase::Fine => "fine",
        }
    }
}

/// Mutable state of one calibration run
#[derive(Debug, Clone)]
pub struct CalibrationSession {
    kind: ProcedureKind,
    iteration: u32,
    samples: Vec<f64>,
    feedrate: f64,
    distance: f64,
    phase: Phase,
    terminated: bool,
    feedrate_history: Vec<f64>,
    backoffs: u32,
}

impl CalibrationSession {
    pub fn new(kind: ProcedureKind, distance: f64, feedrate: f64) -> Self {
        Self {
            kind,
            iteration: 0,
            samples: Vec::new(),
            feedrate,
            distance,
            phase: Phase::Coarse,
            terminated: false,
            feedrate_history: Vec::new(),
            backoffs: 0,
        }
    }

    /// Start the next move+measure cycle and return its 1-based index.
    ///
    /// The commanded feedrate is recorded so the feedrate sequence of a run
    /// can be reported and checked afterwards.
    pub fn begin_iteration(&mut self) -> u32 {
        debug_assert!(!self.terminated, "iteration started on a terminated session");
        self.iteration += 1;
        self.feedrate_history.push(self.feedrate);
        self.iteration
    }

    /// Append a reduced sample for the current iteration
    pub fn record(&mut self, sample: f64) {
        self.samples.push(sample);
    }

    /// Set the move parameters for the following iterations
    pub fn set_move(&mut self, distance: f64, feedrate: f64) {
        self.distance = distance;
        self.feedrate = feedrate;
    }

    pub fn raise_feedrate(&mut self, step: f64) -> f64 {
        self.feedrate += step.max(0.0);
        self.feedrate
    }

    /// Lower the feedrate. Counted so callers can check how many backoffs
    /// a run performed.
    pub fn back_off_feedrate(&mut self, amount: f64) -> f64 {
        self.feedrate -= amount;
        self.backoffs += 1;
        self.feedrate
    }

    /// Switch Coarse -> Fine. Returns false if already in Fine.
    pub fn enter_fine(&mut self) -> bool {
        if self.phase == Phase::Fine {
            return false;
        }
        self.phase = Phase::Fine;
        true
    }

    /// Mark the session finished. Returns false if it already was.
    pub fn terminate(&mut self) -> bool {
        if self.terminated {
            return false;
        }
        self.terminated = true;
        true
    }

    pub fn kind(&self) -> ProcedureKind {
        self.kind
    }

    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    pub fn samples(&self) -> &[f64] {
        &self.samples
    }

    /// Samples recorded from index `start` onwards
    pub fn samples_since(&self, start: usize) -> &[f64] {
        self.samples.get(start..).unwrap_or(&[])
    }

    pub fn latest_sample(&self) -> Option<f64> {
        self.samples.last().copied()
    }

    pub fn feedrate(&self) -> f64 {
        self.feedrate
    }

    pub fn distance(&self) -> f64 {
        self.distance
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub fn feedrate_history(&self) -> &[f64] {
        &self.feedrate_history
    }

    pub fn backoffs(&self) -> u32 {
        self.backoffs
    }
}
