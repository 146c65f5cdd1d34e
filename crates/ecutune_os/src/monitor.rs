#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use ecutune_engines::contract::TelemetryReceiver;
use ecutune_engines::safety_rules::SafetyThresholds;
use ecutune_kernel_contracts::safety::{SafetySnapshot, SafetyViolationReport};
use ecutune_kernel_contracts::session::{ApplySessionId, ApplyStatus, VehicleSessionId};
use ecutune_kernel_contracts::MonotonicTimeNs;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::error::OrchestratorError;
use crate::events::{EventBus, OrchestratorEvent};

/// Newest snapshots kept per session. Ten minutes at the default interval.
pub const SNAPSHOT_LOG_CAPACITY: usize = 600;

/// What a monitor task needs from its owner. Held weakly so a dropped orchestrator
/// ends its monitors.
pub trait MonitorTarget: Send + Sync {
    fn session_status(&self, session_id: ApplySessionId) -> Option<ApplyStatus>;
    fn auto_revert(&self, session_id: ApplySessionId) -> Result<(), OrchestratorError>;
    fn now(&self) -> MonotonicTimeNs;
}

#[derive(Debug, Default)]
struct MonitorShared {
    snapshots: Mutex<BTreeMap<ApplySessionId, Vec<SafetySnapshot>>>,
    cancels: Mutex<BTreeMap<ApplySessionId, watch::Sender<bool>>>,
}

impl MonitorShared {
    /// Appends to the session's log and drops the oldest entries beyond `capacity`.
    fn record(&self, snapshot: SafetySnapshot, capacity: usize) {
        let mut logs = self.snapshots.lock();
        let log = logs.entry(snapshot.session_id).or_default();
        log.push(snapshot);
        if log.len() > capacity {
            let excess = log.len() - capacity;
            log.drain(..excess);
        }
    }
}

/// Spawns one periodic watcher per live session.
#[derive(Debug)]
pub struct SafetyMonitor {
    runtime: Handle,
    interval: Duration,
    thresholds: SafetyThresholds,
    events: EventBus,
    snapshot_capacity: usize,
    shared: Arc<MonitorShared>,
}

impl SafetyMonitor {
    pub fn new(
        runtime: Handle,
        interval_ms: u64,
        thresholds: SafetyThresholds,
        events: EventBus,
    ) -> Self {
        Self {
            runtime,
            interval: Duration::from_millis(interval_ms.max(1)),
            thresholds,
            events,
            snapshot_capacity: SNAPSHOT_LOG_CAPACITY,
            shared: Arc::new(MonitorShared::default()),
        }
    }

    pub fn with_snapshot_capacity(mut self, capacity: usize) -> Self {
        self.snapshot_capacity = capacity.max(1);
        self
    }

    /// A second start for the same session is ignored.
    pub fn start(
        &self,
        session_id: ApplySessionId,
        vehicle_session_id: VehicleSessionId,
        telemetry: TelemetryReceiver,
        target: Weak<dyn MonitorTarget>,
    ) {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        {
            let mut cancels = self.shared.cancels.lock();
            if cancels.contains_key(&session_id) {
                return;
            }
            cancels.insert(session_id, cancel_tx);
        }
        let task = MonitorTask {
            session_id,
            vehicle_session_id,
            telemetry,
            cancel: cancel_rx,
            target,
            interval: self.interval,
            thresholds: self.thresholds,
            events: self.events.clone(),
            snapshot_capacity: self.snapshot_capacity,
            shared: self.shared.clone(),
        };
        info!(session_id = %session_id, interval_ms = self.interval.as_millis() as u64, "safety monitor started");
        self.runtime.spawn(task.run());
    }

    pub fn stop(&self, session_id: ApplySessionId) {
        if let Some(cancel) = self.shared.cancels.lock().remove(&session_id) {
            let _ = cancel.send(true);
            debug!(session_id = %session_id, "safety monitor cancelled");
        }
    }

    pub fn is_running(&self, session_id: ApplySessionId) -> bool {
        self.shared.cancels.lock().contains_key(&session_id)
    }

    pub fn snapshots(&self, session_id: ApplySessionId) -> Vec<SafetySnapshot> {
        self.shared
            .snapshots
            .lock()
            .get(&session_id)
            .cloned()
            .unwrap_or_default()
    }
}

struct MonitorTask {
    session_id: ApplySessionId,
    vehicle_session_id: VehicleSessionId,
    telemetry: TelemetryReceiver,
    cancel: watch::Receiver<bool>,
    target: Weak<dyn MonitorTarget>,
    interval: Duration,
    thresholds: SafetyThresholds,
    events: EventBus,
    snapshot_capacity: usize,
    shared: Arc<MonitorShared>,
}

impl MonitorTask {
    async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut missing_reported = false;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = self.cancel.changed() => {
                    if changed.is_err() || *self.cancel.borrow() {
                        break;
                    }
                    continue;
                }
            }

            let Some(target) = self.target.upgrade() else {
                break;
            };
            // The monitor outlives ACTIVE: completed live changes are still on the vehicle.
            match target.session_status(self.session_id) {
                Some(ApplyStatus::Active) | Some(ApplyStatus::Completed) => {}
                _ => break,
            }

            let closed = self.telemetry.has_changed().is_err();
            let latest = *self.telemetry.borrow_and_update();
            let sample = match latest {
                Some(sample) if !closed => sample,
                _ => {
                    if !missing_reported {
                        missing_reported = true;
                        warn!(
                            session_id = %self.session_id,
                            vehicle = %self.vehicle_session_id,
                            closed,
                            "no telemetry for monitored session"
                        );
                        self.events.send(OrchestratorEvent::TelemetryMissing {
                            session_id: self.session_id,
                            vehicle_session_id: self.vehicle_session_id.clone(),
                        });
                    }
                    continue;
                }
            };
            missing_reported = false;

            let snapshot = SafetySnapshot {
                session_id: self.session_id,
                params: sample,
                taken_at: target.now(),
            };
            self.shared
                .record(snapshot.clone(), self.snapshot_capacity);

            let rules = self.thresholds.evaluate(&sample);
            let Some(report) = SafetyViolationReport::from_rules(snapshot, rules) else {
                continue;
            };
            let critical = report.is_critical();
            warn!(
                session_id = %self.session_id,
                severity = report.severity.as_str(),
                rules = ?report.rules,
                boost_psi = sample.boost_psi,
                knock = sample.knock,
                "safety violation"
            );
            self.events.send(OrchestratorEvent::SafetyViolation { report });
            if !critical {
                continue;
            }

            self.events.send(OrchestratorEvent::AutoRevertTriggered {
                session_id: self.session_id,
            });
            let session_id = self.session_id;
            let outcome =
                tokio::task::spawn_blocking(move || target.auto_revert(session_id)).await;
            match outcome {
                Ok(Ok(())) => {
                    info!(session_id = %session_id, "auto revert completed");
                    break;
                }
                Ok(Err(err)) => {
                    error!(session_id = %session_id, error = %err, "auto revert failed; retrying next tick");
                    self.events.send(OrchestratorEvent::AutoRevertFailed {
                        session_id,
                        reason: err.to_string(),
                    });
                }
                Err(join_err) => {
                    error!(session_id = %session_id, error = %join_err, "auto revert task panicked");
                    self.events.send(OrchestratorEvent::AutoRevertFailed {
                        session_id,
                        reason: join_err.to_string(),
                    });
                }
            }
        }

        self.shared.cancels.lock().remove(&self.session_id);
        info!(session_id = %self.session_id, "safety monitor stopped");
    }
}
