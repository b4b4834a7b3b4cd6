// Calibration engine - extruder calibration procedures
//
// Three procedures share one run model:
// 1. ESteps: correct steps/mm in a coarse and a fine pass
// 2. Consistency: measure the spread of identical extrusions
// 3. Volumetric: search the highest feedrate before under-extrusion
//
// Each run owns a CalibrationSession and talks to the hardware only
// through a ProcedureContext. Results are reduced by the functions in
// `reducer`, progress is published as CalibrationEvents.

pub mod consistency;
pub mod context;
pub mod esteps;
pub mod progress;
pub mod reducer;
pub mod runner;
pub mod session;
pub mod volumetric;

pub use consistency::ConsistencyProcedure;
pub use context::{Halt, ProcedureContext};
pub use esteps::EStepsProcedure;
pub use progress::{CalibrationEvent, CalibrationProgress, RunOutcome};
pub use reducer::{CalibrationResult, VolumetricPoint};
pub use runner::{execute_run, run_procedure, Procedure};
pub use session::{CalibrationSession, Phase, ProcedureKind};
pub use volumetric::VolumetricProcedure;
