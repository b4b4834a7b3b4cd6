use std::time::Duration;

use tokio::time::Instant;

use super::*;
use crate::testing::{Command, EncoderReply, ScriptedRig};

fn short_config(iterations: u32) -> EStepsConfig {
    EStepsConfig {
        coarse_iterations: iterations,
        fine_iterations: iterations,
        ..EStepsConfig::default()
    }
}

/// Coarse readings from `coarse`, fine readings exactly nominal
fn rig_for(coarse: &[f64], fine_count: usize, steps_per_mm: f64) -> ScriptedRig {
    let mut samples = coarse.to_vec();
    samples.extend(std::iter::repeat(50.0).take(fine_count));
    ScriptedRig::with_samples(samples, steps_per_mm)
}

#[tokio::test(start_paused = true)]
async fn test_documented_correction_formula() {
    let rig = rig_for(&[19.0, 19.0, 21.0, 20.0], 4, 93.0);
    let log = rig.log();
    let (mut ctx, _abort, _events) = rig.into_context();

    let mut procedure = EStepsProcedure::new(short_config(4), 0);
    let result = procedure.run(&mut ctx).await.unwrap();

    // mean 19.75 -> ratio 0.9875 -> 93 / 0.9875
    let expected = 93.0 / 0.9875;
    match result {
        CalibrationResult::CorrectedStepsPerMm {
            steps_per_mm,
            previous_steps_per_mm,
            coarse_steps_per_mm,
            trace,
        } => {
            assert_eq!(previous_steps_per_mm, 93.0);
            assert!((coarse_steps_per_mm - expected).abs() < 1e-9);
            // Fine readings are exact, so the fine pass keeps the coarse value
            assert!((steps_per_mm - expected).abs() < 1e-9);
            assert_eq!(trace, vec![95.0, 95.0, 105.0, 100.0, 100.0, 100.0, 100.0, 100.0]);
        }
        other => panic!("Expected corrected steps, got {:?}", other),
    }

    let writes = log.steps_writes();
    assert_eq!(writes.len(), 2);
    assert!((writes[0] - expected).abs() < 1e-9);
}

#[tokio::test(start_paused = true)]
async fn test_default_plan_runs_ten_plus_ten() {
    let rig = rig_for(&[20.0; 10], 10, 415.0);
    let log = rig.log();
    let (mut ctx, _abort, _events) = rig.into_context();

    let mut procedure = EStepsProcedure::new(EStepsConfig::default(), 0);
    procedure.run(&mut ctx).await.unwrap();

    assert_eq!(procedure.session().samples().len(), 20);
    assert_eq!(procedure.session().iteration(), 20);
    assert_eq!(procedure.session().phase(), Phase::Fine);
    assert!(procedure.session().is_terminated());

    let commands = log.commands();
    assert_eq!(commands[0], Command::SetMode(EncoderMode::Relative));
    let measures = commands
        .iter()
        .filter(|c| matches!(c, Command::Measure(_)))
        .count();
    assert_eq!(measures, 20);

    // Coarse value is confirmed before the first fine extrusion
    let first_write = commands
        .iter()
        .position(|c| matches!(c, Command::SetSteps { .. }))
        .unwrap();
    let first_fine = commands
        .iter()
        .position(|c| matches!(c, Command::Extrude { distance_mm, .. } if *distance_mm == 50.0))
        .unwrap();
    assert!(first_write < first_fine);
    assert!(matches!(commands.last(), Some(Command::SetSteps { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_each_iteration_resets_then_extrudes_then_measures() {
    let rig = rig_for(&[20.0; 2], 2, 100.0);
    let log = rig.log();
    let (mut ctx, _abort, _events) = rig.into_context();

    let mut procedure = EStepsProcedure::new(short_config(2), 0);
    procedure.run(&mut ctx).await.unwrap();

    let timed = log.timed();
    let coarse_settle = EStepsConfig::default().coarse.settle_duration(1.0);
    for window in timed.windows(3) {
        if let [(_, Command::Reset), (extruded_at, Command::Extrude { .. }), (measured_at, Command::Measure(_))] =
            window
        {
            assert!(*measured_at - *extruded_at >= coarse_settle);
        }
    }

    let pattern: Vec<_> = log
        .commands()
        .into_iter()
        .filter(|c| !matches!(c, Command::SetMode(_) | Command::SetSteps { .. }))
        .collect();
    for chunk in pattern.chunks(3) {
        assert_eq!(chunk[0], Command::Reset);
        assert!(chunk[1].is_extrude());
        assert!(matches!(chunk[2], Command::Measure(_)));
    }
}

#[tokio::test(start_paused = true)]
async fn test_zero_samples_are_degenerate() {
    let rig = ScriptedRig::with_samples(vec![0.0; 10], 93.0);
    let log = rig.log();
    let (mut ctx, _abort, _events) = rig.into_context();

    let mut procedure = EStepsProcedure::new(EStepsConfig::default(), 0);
    let err = procedure.run(&mut ctx).await.unwrap_err();

    match err {
        Halt::Failed(CalibrationError::DegenerateMeasurement { stage, value, .. }) => {
            assert_eq!(stage, "coarse");
            assert_eq!(value, 0.0);
        }
        other => panic!("Expected degenerate measurement, got {:?}", other),
    }
    assert!(log.steps_writes().is_empty());
    assert!(procedure.session().is_terminated());
}

#[tokio::test(start_paused = true)]
async fn test_negative_fine_mean_is_degenerate() {
    let mut samples = vec![20.0; 3];
    samples.extend([-1.0, -2.0, 0.5]);
    let rig = ScriptedRig::with_samples(samples, 93.0);
    let log = rig.log();
    let (mut ctx, _abort, _events) = rig.into_context();

    let mut procedure = EStepsProcedure::new(short_config(3), 0);
    let err = procedure.run(&mut ctx).await.unwrap_err();

    assert!(matches!(
        err,
        Halt::Failed(CalibrationError::DegenerateMeasurement { ref stage, .. }) if stage == "fine"
    ));
    // Only the coarse value made it to the tool
    assert_eq!(log.steps_writes().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_abort_mid_settle_stops_commands() {
    let rig = rig_for(&[20.0; 10], 10, 93.0);
    let log = rig.log();
    let (mut ctx, abort, _events) = rig.into_context();

    let started = Instant::now();
    let abort_at = started + Duration::from_secs(26);
    tokio::spawn(async move {
        tokio::time::sleep_until(abort_at).await;
        abort.abort("operator stop");
    });

    let mut procedure = EStepsProcedure::new(EStepsConfig::default(), 0);
    let err = procedure.run(&mut ctx).await.unwrap_err();

    assert_eq!(err, Halt::Aborted("operator stop".to_string()));
    assert!(procedure.session().is_terminated());
    assert!(log.timed().iter().all(|(at, _)| *at <= abort_at));
    assert!(log.steps_writes().is_empty());
    // 7.5 s per coarse iteration: aborted during the fourth settle
    assert_eq!(procedure.session().samples().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_steps_write_fails_before_fine_pass() {
    let rig = rig_for(&[20.0; 2], 2, 93.0).rejecting_steps_write();
    let log = rig.log();
    let (mut ctx, _abort, _events) = rig.into_context();

    let mut procedure = EStepsProcedure::new(short_config(2), 0);
    let err = procedure.run(&mut ctx).await.unwrap_err();

    assert!(matches!(
        err,
        Halt::Failed(CalibrationError::ChannelFailure { .. })
    ));
    assert!(!log
        .commands()
        .iter()
        .any(|c| matches!(c, Command::Extrude { distance_mm, .. } if *distance_mm == 50.0)));
}

#[tokio::test(start_paused = true)]
async fn test_stray_and_duplicate_replies_are_tolerated() {
    let replies = vec![
        EncoderReply::Duplicate(20.0),
        EncoderReply::Stray(20.0),
        EncoderReply::Value(50.0),
        EncoderReply::Duplicate(50.0),
    ];
    let rig = ScriptedRig::with_replies(replies, 100.0);
    let (mut ctx, _abort, _events) = rig.into_context();

    let mut procedure = EStepsProcedure::new(short_config(2), 0);
    let result = procedure.run(&mut ctx).await.unwrap();

    assert_eq!(procedure.session().samples(), &[20.0, 20.0, 50.0, 50.0]);
    assert!(matches!(
        result,
        CalibrationResult::CorrectedStepsPerMm { steps_per_mm, .. } if (steps_per_mm - 100.0).abs() < 1e-9
    ));
}

#[tokio::test(start_paused = true)]
async fn test_unknown_tool_is_reported() {
    let rig = ScriptedRig::with_samples(vec![], 93.0);
    let log = rig.log();
    let (mut ctx, _abort, _events) = rig.into_context();

    let mut procedure = EStepsProcedure::new(EStepsConfig::default(), 3);
    let err = procedure.run(&mut ctx).await.unwrap_err();

    assert_eq!(
        err,
        Halt::Failed(CalibrationError::ToolUnavailable { tool: 3 })
    );
    assert!(log.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_progress_carries_running_estimate() {
    let rig = rig_for(&[19.0, 21.0], 2, 100.0);
    let (mut ctx, _abort, mut events) = rig.into_context();

    let mut procedure = EStepsProcedure::new(short_config(2), 0);
    procedure.run(&mut ctx).await.unwrap();

    let mut progress = Vec::new();
    let mut phase_changes = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            CalibrationEvent::Progress(p) => progress.push(p),
            CalibrationEvent::PhaseChanged { phase, .. } => {
                assert_eq!(phase, Phase::Fine);
                phase_changes += 1;
            }
            _ => {}
        }
    }

    assert_eq!(phase_changes, 1);
    assert_eq!(progress.len(), 4);
    assert_eq!(progress[0].iteration, 1);
    assert_eq!(progress[0].latest_sample, 19.0);
    assert_eq!(progress[0].total_iterations, Some(4));
    // 100 / (19 / 20)
    let first = progress[0].running_value.unwrap();
    assert!((first - 100.0 / 0.95).abs() < 1e-9);
    // Mean of 19 and 21 is nominal
    assert!((progress[1].running_value.unwrap() - 100.0).abs() < 1e-9);
    assert_eq!(progress[2].phase, Some(Phase::Fine));
}
