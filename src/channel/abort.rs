//! Cooperative abort signalling for calibration runs.

use std::sync::Arc;

use tokio::sync::watch;

/// Create a connected abort handle/signal pair.
pub fn abort_pair() -> (AbortHandle, AbortSignal) {
    let (tx, rx) = watch::channel(None);
    (AbortHandle { tx: Arc::new(tx) }, AbortSignal { rx })
}

/// Sending half; cloneable so the manager and a `RunHandle` can both abort.
#[derive(Clone)]
pub struct AbortHandle {
    tx: Arc<watch::Sender<Option<String>>>,
}

impl AbortHandle {
    /// Request an abort. Only the first reason is kept.
    pub fn abort(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        });
    }

    pub fn is_aborted(&self) -> bool {
        self.tx.borrow().is_some()
    }
}

/// Receiving half, owned by the running procedure.
pub struct AbortSignal {
    rx: watch::Receiver<Option<String>>,
}

impl AbortSignal {
    /// Abort reason if one has been requested.
    pub fn reason(&self) -> Option<String> {
        self.rx.borrow().clone()
    }

    /// Resolve once an abort is requested. Never resolves if every handle
    /// is dropped without aborting.
    pub async fn triggered(&mut self) -> String {
        loop {
            if let Some(reason) = self.rx.borrow_and_update().clone() {
                return reason;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}
