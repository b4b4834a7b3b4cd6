// ProcedureContext - the suspension points every procedure goes through
//
// A procedure never touches a channel directly. It asks the context to
// reset, extrude, wait, or measure, and the context enforces the ordering
// rules: one outstanding measurement at a time, abort observed before every
// command and inside every wait, unsolicited failures ending the run, and
// stray replies discarded.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

use crate::calibration::progress::{CalibrationEvent, CalibrationProgress};
use crate::channel::{
    AbortSignal, ChannelEvent, ChannelSet, ChannelSource, EncoderMode, MeasurementChannel,
    MotionChannel, ToolConfig,
};
use crate::config::{settle_duration, MovePlan};
use crate::error::{log_channel_error, CalibrationError, ChannelError};
use crate::telemetry;

/// Why a procedure stopped before producing a result
#[derive(Debug, Clone, PartialEq)]
pub enum Halt {
    Aborted(String),
    Failed(CalibrationError),
}

impl From<CalibrationError> for Halt {
    fn from(err: CalibrationError) -> Self {
        Halt::Failed(err)
    }
}

impl From<ChannelError> for Halt {
    fn from(err: ChannelError) -> Self {
        Halt::Failed(err.into())
    }
}

/// Channel handles and run plumbing handed to a procedure
pub struct ProcedureContext {
    encoder: Arc<dyn MeasurementChannel>,
    motion: Arc<dyn MotionChannel>,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
    abort: AbortSignal,
    progress_tx: broadcast::Sender<CalibrationEvent>,
    settle_scale: f64,
    next_request_id: u64,
}

impl ProcedureContext {
    pub fn new(
        channels: ChannelSet,
        abort: AbortSignal,
        progress_tx: broadcast::Sender<CalibrationEvent>,
        settle_scale: f64,
    ) -> Self {
        Self {
            encoder: channels.encoder,
            motion: channels.motion,
            events: channels.events,
            abort,
            progress_tx,
            settle_scale,
            next_request_id: 0,
        }
    }

    /// Fail fast if an abort has been requested
    fn ensure_running(&self) -> Result<(), Halt> {
        match self.abort.reason() {
            Some(reason) => Err(Halt::Aborted(reason)),
            None => Ok(()),
        }
    }

    pub fn tool_config(&self, tool: usize) -> Result<ToolConfig, Halt> {
        self.motion
            .tool_config(tool)
            .ok_or(Halt::Failed(CalibrationError::ToolUnavailable { tool }))
    }

    pub fn set_mode(&self, mode: EncoderMode) -> Result<(), Halt> {
        self.ensure_running()?;
        self.encoder.set_mode(mode)?;
        Ok(())
    }

    pub fn reset_accumulator(&self) -> Result<(), Halt> {
        self.ensure_running()?;
        self.encoder.reset_accumulator()?;
        Ok(())
    }

    /// Write steps/mm to the tool; returns once the controller accepted it
    pub fn apply_steps_per_mm(&self, tool: usize, value: f64) -> Result<(), Halt> {
        self.ensure_running()?;
        self.motion.set_steps_per_mm(tool, value)?;
        Ok(())
    }

    /// Command a move and suspend until its settle time has elapsed.
    ///
    /// Returns the settle duration that was waited.
    pub async fn extrude_and_settle(
        &mut self,
        distance_mm: f64,
        feedrate_mm_per_min: f64,
        settle_margin_ms: u64,
    ) -> Result<Duration, Halt> {
        self.ensure_running()?;
        self.motion
            .command_extrude(distance_mm, feedrate_mm_per_min)?;

        let wait = settle_duration(
            distance_mm,
            feedrate_mm_per_min,
            settle_margin_ms,
            self.settle_scale,
        );
        self.settle(wait).await?;
        Ok(wait)
    }

    /// Priming move: extrude and settle without measuring
    pub async fn prime(&mut self, plan: &MovePlan) -> Result<(), Halt> {
        self.extrude_and_settle(
            plan.distance_mm,
            plan.feedrate_mm_per_min,
            plan.settle_margin_ms,
        )
        .await?;
        Ok(())
    }

    /// Wait out `duration`, still reacting to abort and channel failures.
    async fn settle(&mut self, duration: Duration) -> Result<(), Halt> {
        let deadline = Instant::now() + duration;
        loop {
            let event = tokio::select! {
                reason = self.abort.triggered() => return Err(Halt::Aborted(reason)),
                _ = tokio::time::sleep_until(deadline) => return Ok(()),
                event = self.events.recv() => event,
            };
            // No measurement is outstanding while settling
            self.handle_unsolicited(event, None)?;
        }
    }

    /// Request one reading and suspend until it arrives.
    ///
    /// Only the reply tagged with this request's id is accepted; anything
    /// else is discarded as a protocol violation. The channel's response
    /// timeout bounds the wait.
    pub async fn measure(&mut self) -> Result<f64, Halt> {
        self.ensure_running()?;
        self.next_request_id += 1;
        let request_id = self.next_request_id;
        self.encoder.request_measurement(request_id)?;

        let timeout = self.encoder.response_timeout();
        let requested_at = Instant::now();
        let deadline = requested_at + timeout;
        loop {
            let event = tokio::select! {
                reason = self.abort.triggered() => return Err(Halt::Aborted(reason)),
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(ChannelError::Timeout {
                        source: ChannelSource::Measurement,
                        waited_ms: timeout.as_millis() as u64,
                    }
                    .into());
                }
                event = self.events.recv() => event,
            };

            if let Some(ChannelEvent::Measurement {
                request_id: reply_id,
                value,
            }) = event
            {
                if reply_id == request_id {
                    telemetry::hub().record_measurement_latency(requested_at.elapsed());
                    return Ok(value);
                }
            }
            self.handle_unsolicited(event, Some(request_id))?;
        }
    }

    /// Classify an event that is not the awaited reply.
    fn handle_unsolicited(
        &self,
        event: Option<ChannelEvent>,
        outstanding: Option<u64>,
    ) -> Result<(), Halt> {
        match event {
            None => Err(ChannelError::Disconnected {
                source: ChannelSource::Measurement,
                reason: "channel event stream closed".to_string(),
            }
            .into()),
            Some(ChannelEvent::Measurement { request_id, value }) => {
                let detail = match outstanding {
                    Some(expected) => format!(
                        "reply {} ({} mm) while waiting for request {}",
                        request_id, value, expected
                    ),
                    None => format!(
                        "reply {} ({} mm) with no request outstanding",
                        request_id, value
                    ),
                };
                self.discard(ChannelError::ProtocolViolation { detail });
                Ok(())
            }
            Some(ChannelEvent::Failure(err)) if err.is_recoverable() => {
                self.discard(err);
                Ok(())
            }
            Some(ChannelEvent::Failure(err)) => {
                log_channel_error(&err, "ProcedureContext");
                Err(err.into())
            }
            Some(ChannelEvent::Telemetry(_)) => Ok(()),
        }
    }

    fn discard(&self, err: ChannelError) {
        log::warn!("[ProcedureContext] Discarding stray event: {}", err);
        telemetry::hub().record_protocol_violation(err.to_string());
    }

    /// Publish an event; no subscribers is not an error
    pub fn emit(&self, event: CalibrationEvent) {
        let _ = self.progress_tx.send(event);
    }

    pub fn emit_progress(&self, progress: CalibrationProgress) {
        telemetry::hub().record_iteration(
            progress.procedure,
            progress.iteration,
            progress.latest_sample,
        );
        self.emit(CalibrationEvent::Progress(progress));
    }
}
