//! Scripted channel fakes for procedure tests.
//!
//! Compiled for unit tests or when the `scripted_fixtures` Cargo feature is
//! enabled. A `ScriptedRig` answers measurement requests from a script or a
//! responder closure and records every command it receives together with the
//! (tokio) instant it was issued, so tests can assert ordering and timing.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

use crate::calibration::{CalibrationEvent, ProcedureContext};
use crate::channel::{
    abort_pair, AbortHandle, ChannelEvent, ChannelSet, ChannelSource, EncoderMode,
    MeasurementChannel, MotionChannel, ToolConfig,
};
use crate::error::ChannelError;

/// A command observed by the rig
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    SetMode(EncoderMode),
    Reset,
    Measure(u64),
    Extrude { distance_mm: f64, feedrate: f64 },
    SetSteps { tool: usize, value: f64 },
}

impl Command {
    pub fn is_extrude(&self) -> bool {
        matches!(self, Command::Extrude { .. })
    }
}

/// How the encoder answers one measurement request
#[derive(Debug, Clone, PartialEq)]
pub enum EncoderReply {
    /// Reply with the value
    Value(f64),
    /// Reply with the value twice (hardware echo)
    Duplicate(f64),
    /// Send a reply for an unknown request first, then the value
    Stray(f64),
    /// Never reply
    Silent,
    /// Report a channel failure instead of a value
    Fail(ChannelError),
}

/// Last extrusion commanded before a measurement request
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Extrusion {
    pub distance_mm: f64,
    pub feedrate: f64,
}

type Responder = Box<dyn FnMut(Extrusion) -> EncoderReply + Send>;

/// Shared, timestamped record of rig commands
#[derive(Clone, Default)]
pub struct CommandLog {
    entries: Arc<Mutex<Vec<(Instant, Command)>>>,
}

impl CommandLog {
    fn lock(&self) -> MutexGuard<'_, Vec<(Instant, Command)>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn push(&self, command: Command) {
        self.lock().push((Instant::now(), command));
    }

    pub fn commands(&self) -> Vec<Command> {
        self.lock().iter().map(|(_, c)| c.clone()).collect()
    }

    pub fn timed(&self) -> Vec<(Instant, Command)> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Feedrates of every extrusion, in command order
    pub fn extrude_feedrates(&self) -> Vec<f64> {
        self.lock()
            .iter()
            .filter_map(|(_, c)| match c {
                Command::Extrude { feedrate, .. } => Some(*feedrate),
                _ => None,
            })
            .collect()
    }

    /// Values written through `set_steps_per_mm`, in command order
    pub fn steps_writes(&self) -> Vec<f64> {
        self.lock()
            .iter()
            .filter_map(|(_, c)| match c {
                Command::SetSteps { value, .. } => Some(*value),
                _ => None,
            })
            .collect()
    }
}

struct RigState {
    responder: Responder,
    last_extrusion: Extrusion,
    tool: ToolConfig,
    reject_steps_write: bool,
}

/// Fake encoder + motion controller pair
pub struct ScriptedRig {
    state: Arc<Mutex<RigState>>,
    log: CommandLog,
    events_tx: mpsc::UnboundedSender<ChannelEvent>,
    events_rx: mpsc::UnboundedReceiver<ChannelEvent>,
}

impl ScriptedRig {
    /// Answer each measurement with the next scripted reply; silent once
    /// the script runs out.
    pub fn with_replies(replies: Vec<EncoderReply>, steps_per_mm: f64) -> Self {
        let mut script: VecDeque<EncoderReply> = replies.into();
        Self::with_responder(
            move |_| script.pop_front().unwrap_or(EncoderReply::Silent),
            steps_per_mm,
        )
    }

    pub fn with_samples(samples: Vec<f64>, steps_per_mm: f64) -> Self {
        Self::with_replies(
            samples.into_iter().map(EncoderReply::Value).collect(),
            steps_per_mm,
        )
    }

    /// Answer each measurement by calling `responder` with the last
    /// commanded extrusion.
    pub fn with_responder<F>(responder: F, steps_per_mm: f64) -> Self
    where
        F: FnMut(Extrusion) -> EncoderReply + Send + 'static,
    {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            state: Arc::new(Mutex::new(RigState {
                responder: Box::new(responder),
                last_extrusion: Extrusion::default(),
                tool: ToolConfig::new("extruder", steps_per_mm),
                reject_steps_write: false,
            })),
            log: CommandLog::default(),
            events_tx,
            events_rx,
        }
    }

    /// Make `set_steps_per_mm` fail with `CommandRejected`
    pub fn rejecting_steps_write(self) -> Self {
        lock_state(&self.state).reject_steps_write = true;
        self
    }

    pub fn log(&self) -> CommandLog {
        self.log.clone()
    }

    /// Sender for injecting unsolicited events
    pub fn injector(&self) -> mpsc::UnboundedSender<ChannelEvent> {
        self.events_tx.clone()
    }

    pub fn into_channels(self) -> ChannelSet {
        let encoder = ScriptedEncoder {
            state: self.state.clone(),
            log: self.log.clone(),
            events_tx: self.events_tx,
        };
        let motion = RecordingMotion {
            state: self.state,
            log: self.log,
        };
        ChannelSet::new(Arc::new(encoder), Arc::new(motion), self.events_rx)
    }

    /// Wire the rig into a procedure context with real-time settle waits
    pub fn into_context(
        self,
    ) -> (
        ProcedureContext,
        AbortHandle,
        broadcast::Receiver<CalibrationEvent>,
    ) {
        let (abort, signal) = abort_pair();
        let (progress_tx, progress_rx) = broadcast::channel(256);
        let ctx = ProcedureContext::new(self.into_channels(), signal, progress_tx, 1.0);
        (ctx, abort, progress_rx)
    }
}

fn lock_state(state: &Mutex<RigState>) -> MutexGuard<'_, RigState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct ScriptedEncoder {
    state: Arc<Mutex<RigState>>,
    log: CommandLog,
    events_tx: mpsc::UnboundedSender<ChannelEvent>,
}

impl ScriptedEncoder {
    fn send(&self, event: ChannelEvent) {
        // The receiver only goes away when the run is over
        let _ = self.events_tx.send(event);
    }
}

impl MeasurementChannel for ScriptedEncoder {
    fn set_mode(&self, mode: EncoderMode) -> Result<(), ChannelError> {
        self.log.push(Command::SetMode(mode));
        Ok(())
    }

    fn reset_accumulator(&self) -> Result<(), ChannelError> {
        self.log.push(Command::Reset);
        Ok(())
    }

    fn request_measurement(&self, request_id: u64) -> Result<(), ChannelError> {
        self.log.push(Command::Measure(request_id));
        let reply = {
            let mut state = lock_state(&self.state);
            let last = state.last_extrusion;
            (state.responder)(last)
        };

        match reply {
            EncoderReply::Value(value) => self.send(ChannelEvent::Measurement { request_id, value }),
            EncoderReply::Duplicate(value) => {
                self.send(ChannelEvent::Measurement { request_id, value });
                self.send(ChannelEvent::Measurement { request_id, value });
            }
            EncoderReply::Stray(value) => {
                self.send(ChannelEvent::Measurement {
                    request_id: request_id + 1000,
                    value: -1.0,
                });
                self.send(ChannelEvent::Measurement { request_id, value });
            }
            EncoderReply::Silent => {}
            EncoderReply::Fail(err) => self.send(ChannelEvent::Failure(err)),
        }
        Ok(())
    }
}

struct RecordingMotion {
    state: Arc<Mutex<RigState>>,
    log: CommandLog,
}

impl MotionChannel for RecordingMotion {
    fn command_extrude(&self, distance_mm: f64, feedrate_mm_per_min: f64) -> Result<(), ChannelError> {
        self.log.push(Command::Extrude {
            distance_mm,
            feedrate: feedrate_mm_per_min,
        });
        lock_state(&self.state).last_extrusion = Extrusion {
            distance_mm,
            feedrate: feedrate_mm_per_min,
        };
        Ok(())
    }

    fn set_steps_per_mm(&self, tool: usize, value: f64) -> Result<(), ChannelError> {
        self.log.push(Command::SetSteps { tool, value });
        let mut state = lock_state(&self.state);
        if state.reject_steps_write {
            return Err(ChannelError::CommandRejected {
                source: ChannelSource::Motion,
                reason: format!("M92 rejected for tool {}", tool),
            });
        }
        if tool != 0 {
            return Err(ChannelError::CommandRejected {
                source: ChannelSource::Motion,
                reason: format!("no tool {}", tool),
            });
        }
        state.tool = state.tool.with_steps_per_mm(value);
        Ok(())
    }

    fn tool_config(&self, tool: usize) -> Option<ToolConfig> {
        (tool == 0).then(|| lock_state(&self.state).tool.clone())
    }
}
