// CalibrationManager: owner of the one active calibration run
//
// Single Responsibility: run lifecycle (start, abort, completion) and the
// shared progress broadcast. The procedures themselves live in
// crate::calibration.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use futures::{Stream, StreamExt};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

use crate::calibration::{execute_run, CalibrationEvent, ProcedureContext, ProcedureKind, RunOutcome};
use crate::channel::{abort_pair, AbortHandle, ChannelSet};
use crate::config::AppConfig;
use crate::error::{log_calibration_error, CalibrationError};

const EVENT_BUFFER: usize = 256;

struct ActiveRun {
    run_id: u64,
    kind: ProcedureKind,
    abort: AbortHandle,
}

/// Clears the active slot when the run task ends, panics included
struct ActiveGuard {
    slot: Arc<Mutex<Option<ActiveRun>>>,
    run_id: u64,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        let mut slot = self
            .slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if slot.as_ref().map(|run| run.run_id) == Some(self.run_id) {
            *slot = None;
        }
    }
}

/// Handle to a spawned calibration run
pub struct RunHandle {
    run_id: u64,
    kind: ProcedureKind,
    abort: AbortHandle,
    join: JoinHandle<RunOutcome>,
}

impl RunHandle {
    pub fn run_id(&self) -> u64 {
        self.run_id
    }

    pub fn kind(&self) -> ProcedureKind {
        self.kind
    }

    /// Request an abort of this run. The first reason wins.
    pub fn abort(&self, reason: impl Into<String>) {
        self.abort.abort(reason);
    }

    /// Wait for the run to end.
    ///
    /// A task that panicked or was cancelled is reported as a failed run.
    pub async fn join(self) -> RunOutcome {
        match self.join.await {
            Ok(outcome) => outcome,
            Err(err) => {
                let error = CalibrationError::TaskFailed {
                    reason: err.to_string(),
                };
                log_calibration_error(&error, "join_calibration");
                RunOutcome::Failed { error }
            }
        }
    }
}

/// Manages calibration runs against one encoder/printer pair
///
/// This manager handles:
/// - Starting a procedure on the tokio runtime
/// - Refusing a second concurrent run
/// - Forwarding abort requests to the active run
/// - Broadcasting progress and terminal events to subscribers
/// - Holding the configuration used for new runs
///
/// # Example
/// ```ignore
/// let manager = CalibrationManager::new(AppConfig::load());
/// let mut events = manager.subscribe();
/// let run = manager.start(ProcedureKind::ESteps, 0, channels)?;
/// let outcome = run.join().await;
/// ```
pub struct CalibrationManager {
    config: Arc<RwLock<AppConfig>>,
    active: Arc<Mutex<Option<ActiveRun>>>,
    events_tx: broadcast::Sender<CalibrationEvent>,
    next_run_id: AtomicU64,
}

impl CalibrationManager {
    pub fn new(config: AppConfig) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            config: Arc::new(RwLock::new(config)),
            active: Arc::new(Mutex::new(None)),
            events_tx,
            next_run_id: AtomicU64::new(1),
        }
    }

    /// Start a calibration run
    ///
    /// Must be called from within a tokio runtime. The run works on a
    /// snapshot of the configuration taken here.
    ///
    /// # Arguments
    /// * `kind` - Procedure to run
    /// * `tool` - Tool index for ESteps
    /// * `channels` - Encoder and motion channels plus their event receiver
    ///
    /// # Errors
    /// - Calibration already in progress
    /// - Configuration failed validation
    /// - No tokio runtime available
    /// - Lock poisoning on manager state
    pub fn start(
        &self,
        kind: ProcedureKind,
        tool: usize,
        channels: ChannelSet,
    ) -> Result<RunHandle, CalibrationError> {
        let config = self.config_snapshot()?;
        config.validate().inspect_err(|err| {
            log_calibration_error(err, "start_calibration");
        })?;

        let runtime = tokio::runtime::Handle::try_current().map_err(|err| {
            let err = CalibrationError::TaskFailed {
                reason: err.to_string(),
            };
            log_calibration_error(&err, "start_calibration");
            err
        })?;

        let mut active = self.lock_active()?;
        Self::check_not_in_progress(&active)?;

        let run_id = self.next_run_id.fetch_add(1, Ordering::Relaxed);
        let (abort, signal) = abort_pair();
        *active = Some(ActiveRun {
            run_id,
            kind,
            abort: abort.clone(),
        });
        drop(active);

        let mut ctx = ProcedureContext::new(
            channels,
            signal,
            self.events_tx.clone(),
            config.timing.settle_scale,
        );
        let guard = ActiveGuard {
            slot: Arc::clone(&self.active),
            run_id,
        };
        // Subscribers may start the next run as soon as they see the
        // terminal event, so the slot is released before it goes out.
        let join = runtime.spawn(async move {
            let outcome = execute_run(kind, tool, &config, &mut ctx).await;
            drop(guard);
            ctx.emit(outcome.terminal_event());
            outcome
        });

        log::info!("[CalibrationManager] Run {} ({}) spawned", run_id, kind.display_name());
        Ok(RunHandle {
            run_id,
            kind,
            abort,
            join,
        })
    }

    /// Abort the active run
    ///
    /// # Errors
    /// - No calibration in progress
    /// - Lock poisoning on manager state
    pub fn abort(&self, reason: impl Into<String>) -> Result<(), CalibrationError> {
        let active = self.lock_active()?;
        match active.as_ref() {
            Some(run) => {
                let reason = reason.into();
                log::info!(
                    "[CalibrationManager] Aborting run {} ({}): {}",
                    run.run_id,
                    run.kind.display_name(),
                    reason
                );
                run.abort.abort(reason);
                Ok(())
            }
            None => {
                let err = CalibrationError::NotRunning;
                log_calibration_error(&err, "abort_calibration");
                Err(err)
            }
        }
    }

    /// Kind of the active run, if any
    pub fn active_kind(&self) -> Result<Option<ProcedureKind>, CalibrationError> {
        Ok(self.lock_active()?.as_ref().map(|run| run.kind))
    }

    pub fn is_running(&self) -> bool {
        matches!(self.active_kind(), Ok(Some(_)))
    }

    /// Subscribe to progress and terminal events of all runs
    pub fn subscribe(&self) -> broadcast::Receiver<CalibrationEvent> {
        self.events_tx.subscribe()
    }

    /// Event subscription as a `Stream`; lagged events are skipped
    pub fn event_stream(&self) -> impl Stream<Item = CalibrationEvent> + Send + Unpin {
        BroadcastStream::new(self.events_tx.subscribe()).filter_map(|result| {
            futures::future::ready(match result {
                Ok(event) => Some(event),
                Err(err) => {
                    log::warn!("[CalibrationManager] Event subscriber lagged: {}", err);
                    None
                }
            })
        })
    }

    pub fn config_snapshot(&self) -> Result<AppConfig, CalibrationError> {
        let config = self
            .config
            .read()
            .map_err(|_| CalibrationError::StatePoisoned)
            .inspect_err(|err| log_calibration_error(err, "config_snapshot"))?;
        Ok(config.clone())
    }

    /// Replace the configuration used by future runs
    ///
    /// # Errors
    /// - Configuration failed validation
    /// - Lock poisoning on configuration
    pub fn update_config(&self, config: AppConfig) -> Result<(), CalibrationError> {
        config.validate().inspect_err(|err| {
            log_calibration_error(err, "update_config");
        })?;
        let mut guard = self
            .config
            .write()
            .map_err(|_| CalibrationError::StatePoisoned)?;
        *guard = config;
        Ok(())
    }

    // ========================================================================
    // HELPER METHODS - Lock management and validation
    // ========================================================================

    fn lock_active(&self) -> Result<MutexGuard<'_, Option<ActiveRun>>, CalibrationError> {
        self.active
            .lock()
            .map_err(|_| CalibrationError::StatePoisoned)
    }

    fn check_not_in_progress(active: &Option<ActiveRun>) -> Result<(), CalibrationError> {
        if active.is_some() {
            let err = CalibrationError::AlreadyInProgress;
            log_calibration_error(&err, "start_calibration");
            return Err(err);
        }
        Ok(())
    }
}

impl Default for CalibrationManager {
    fn default() -> Self {
        Self::new(AppConfig::default())
    }
}
