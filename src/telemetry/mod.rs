//! Calibration telemetry collector and helpers.
//!
//! The collector multiplexes run lifecycle, per-iteration samples,
//! measurement latency and protocol violations into a bounded history plus
//! an async broadcast stream.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use once_cell::sync::Lazy;
use tokio::sync::broadcast;

use crate::calibration::{ProcedureKind, RunOutcome};
use crate::error::{CalibrationError, ErrorCode};

pub mod events;

pub use events::{MetricEvent, OutcomeKind};

/// Global telemetry hub shared across the crate.
static HUB: Lazy<TelemetryHub> = Lazy::new(TelemetryHub::default);

/// Access the global telemetry hub.
pub fn hub() -> &'static TelemetryHub {
    &HUB
}

/// Snapshot of collector state for CLI reporting.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TelemetrySnapshot {
    pub recent: Vec<MetricEvent>,
    pub total_events: u64,
    pub dropped_events: u64,
    pub protocol_violations: u64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Broadcast-based collector retaining a bounded history of metrics.
pub struct TelemetryCollector {
    tx: broadcast::Sender<MetricEvent>,
    history: Mutex<VecDeque<MetricEvent>>,
    history_capacity: usize,
    total_events: AtomicU64,
    dropped_history: AtomicU64,
}

impl TelemetryCollector {
    pub fn new(buffer: usize, history_capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer);
        Self {
            tx,
            history: Mutex::new(VecDeque::with_capacity(history_capacity)),
            history_capacity,
            total_events: AtomicU64::new(0),
            dropped_history: AtomicU64::new(0),
        }
    }

    pub fn publish(&self, event: MetricEvent) {
        self.total_events.fetch_add(1, Ordering::Relaxed);
        {
            let mut history = lock(&self.history);
            if history.len() == self.history_capacity {
                history.pop_front();
                self.dropped_history.fetch_add(1, Ordering::Relaxed);
            }
            history.push_back(event.clone());
        }

        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MetricEvent> {
        self.tx.subscribe()
    }

    fn recent(&self) -> Vec<MetricEvent> {
        lock(&self.history).iter().cloned().collect()
    }
}

impl Default for TelemetryCollector {
    fn default() -> Self {
        Self::new(256, 64)
    }
}

/// Latency tracker maintains a rolling window to compute avg/max latency.
struct LatencyTracker {
    samples: VecDeque<f32>,
    max_samples: usize,
}

impl LatencyTracker {
    fn new(max_samples: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(max_samples),
            max_samples,
        }
    }

    fn observe(&mut self, value: f32) -> (f32, f32, usize) {
        if self.samples.len() == self.max_samples {
            self.samples.pop_front();
        }
        self.samples.push_back(value.abs());

        let count = self.samples.len();
        let sum: f32 = self.samples.iter().copied().sum();
        let max = self
            .samples
            .iter()
            .copied()
            .fold(0.0_f32, |acc, next| acc.max(next));
        let avg = if count == 0 { 0.0 } else { sum / count as f32 };
        (avg, max, count)
    }
}

/// Top-level hub wrapping collector state plus derived gauges.
pub struct TelemetryHub {
    collector: TelemetryCollector,
    latency: Mutex<LatencyTracker>,
    protocol_violations: AtomicU64,
}

impl TelemetryHub {
    pub fn new(channel_capacity: usize, history_capacity: usize, latency_window: usize) -> Self {
        Self {
            collector: TelemetryCollector::new(channel_capacity, history_capacity),
            latency: Mutex::new(LatencyTracker::new(latency_window)),
            protocol_violations: AtomicU64::new(0),
        }
    }

    pub fn collector(&self) -> &TelemetryCollector {
        &self.collector
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MetricEvent> {
        self.collector.subscribe()
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            recent: self.collector.recent(),
            total_events: self.collector.total_events.load(Ordering::Relaxed),
            dropped_events: self.collector.dropped_history.load(Ordering::Relaxed),
            protocol_violations: self.protocol_violations.load(Ordering::Relaxed),
        }
    }

    pub fn record_run_started(&self, procedure: ProcedureKind, tool: usize) {
        self.collector.publish(MetricEvent::RunStarted {
            procedure,
            tool,
            timestamp_ms: now_timestamp_ms(),
        });
    }

    pub fn record_iteration(&self, procedure: ProcedureKind, iteration: u32, sample: f64) {
        self.collector.publish(MetricEvent::IterationCompleted {
            procedure,
            iteration,
            sample,
        });
    }

    pub fn record_measurement_latency(&self, elapsed: Duration) {
        let (avg, max, count) = lock(&self.latency).observe(elapsed.as_secs_f32() * 1000.0);

        self.collector.publish(MetricEvent::MeasurementLatency {
            avg_ms: avg,
            max_ms: max,
            sample_count: count,
        });
    }

    pub fn record_protocol_violation(&self, detail: impl Into<String>) {
        self.protocol_violations.fetch_add(1, Ordering::Relaxed);
        self.collector.publish(MetricEvent::ProtocolViolation {
            detail: detail.into(),
        });
    }

    pub fn record_run_finished(&self, procedure: ProcedureKind, outcome: &RunOutcome) {
        self.collector.publish(MetricEvent::RunFinished {
            procedure,
            outcome: outcome.into(),
            timestamp_ms: now_timestamp_ms(),
        });
    }

    pub fn record_error(&self, err: &CalibrationError, context: impl Into<String>) {
        self.collector.publish(MetricEvent::Error {
            code: err.code(),
            context: context.into(),
        });
    }
}

impl Default for TelemetryHub {
    fn default() -> Self {
        Self::new(256, 64, 32)
    }
}

fn now_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collector_preserves_order_within_history() {
        let collector = TelemetryCollector::new(8, 3);
        collector.publish(MetricEvent::MeasurementLatency {
            avg_ms: 1.0,
            max_ms: 2.0,
            sample_count: 1,
        });
        collector.publish(MetricEvent::ProtocolViolation {
            detail: "stray".to_string(),
        });
        collector.publish(MetricEvent::IterationCompleted {
            procedure: ProcedureKind::ESteps,
            iteration: 1,
            sample: 19.8,
        });

        let recent = collector.recent();
        assert_eq!(recent.len(), 3);
        assert!(
            matches!(recent[0], MetricEvent::MeasurementLatency { avg_ms, .. } if (avg_ms - 1.0).abs() < f32::EPSILON)
        );
        assert!(matches!(recent[2], MetricEvent::IterationCompleted { .. }));
    }

    #[test]
    fn collector_drops_history_when_full() {
        let hub = TelemetryHub::new(8, 2, 4);
        hub.record_iteration(ProcedureKind::Consistency, 1, 20.0);
        hub.record_iteration(ProcedureKind::Consistency, 2, 20.1);
        hub.record_iteration(ProcedureKind::Consistency, 3, 19.9);

        let snapshot = hub.snapshot();
        assert_eq!(snapshot.recent.len(), 2);
        assert_eq!(snapshot.dropped_events, 1);
        assert!(matches!(
            snapshot.recent[0],
            MetricEvent::IterationCompleted { iteration: 2, .. }
        ));
    }

    #[test]
    fn latency_window_tracks_avg_and_max() {
        let hub = TelemetryHub::new(8, 8, 2);
        hub.record_measurement_latency(Duration::from_millis(10));
        hub.record_measurement_latency(Duration::from_millis(30));
        hub.record_measurement_latency(Duration::from_millis(20));

        let snapshot = hub.snapshot();
        match snapshot.recent.last() {
            Some(MetricEvent::MeasurementLatency {
                avg_ms,
                max_ms,
                sample_count,
            }) => {
                // Window of two: 30 and 20
                assert_eq!(*sample_count, 2);
                assert!((avg_ms - 25.0).abs() < 0.01);
                assert!((max_ms - 30.0).abs() < 0.01);
            }
            other => panic!("Expected latency event, got {:?}", other),
        }
    }

    #[test]
    fn protocol_violations_are_counted() {
        let hub = TelemetryHub::new(8, 8, 4);
        hub.record_protocol_violation("reply 7 with no request outstanding");
        hub.record_protocol_violation("reply 8 with no request outstanding");

        assert_eq!(hub.snapshot().protocol_violations, 2);
    }

    #[test]
    fn run_lifecycle_events_are_published() {
        let hub = TelemetryHub::new(8, 8, 4);
        let mut rx = hub.subscribe();

        hub.record_run_started(ProcedureKind::Volumetric, 0);
        hub.record_error(&CalibrationError::NotRunning, "abort");
        hub.record_run_finished(
            ProcedureKind::Volumetric,
            &RunOutcome::Aborted {
                reason: "stop".to_string(),
            },
        );

        assert!(matches!(
            rx.try_recv(),
            Ok(MetricEvent::RunStarted { tool: 0, .. })
        ));
        assert!(matches!(rx.try_recv(), Ok(MetricEvent::Error { code: 2004, .. })));
        assert!(matches!(
            rx.try_recv(),
            Ok(MetricEvent::RunFinished {
                outcome: OutcomeKind::Aborted,
                ..
            })
        ));
    }
}
