#![forbid(unsafe_code)]

use ecutune_kernel_contracts::flash::{FlashJobId, FlashState};
use ecutune_kernel_contracts::safety::SafetyViolationReport;
use ecutune_kernel_contracts::session::{ApplyMode, ApplySessionId, ApplyStatus, VehicleSessionId};
use serde::Serialize;
use tokio::sync::broadcast;

/// Outbound notifications. Consumers subscribe; nothing calls back into the
/// orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    SessionCreated {
        session_id: ApplySessionId,
        mode: ApplyMode,
    },
    SessionArmed {
        session_id: ApplySessionId,
    },
    SessionStatusChanged {
        session_id: ApplySessionId,
        from: ApplyStatus,
        to: ApplyStatus,
    },
    SafetyViolation {
        report: SafetyViolationReport,
    },
    AutoRevertTriggered {
        session_id: ApplySessionId,
    },
    AutoRevertFailed {
        session_id: ApplySessionId,
        reason: String,
    },
    TelemetryMissing {
        session_id: ApplySessionId,
        vehicle_session_id: VehicleSessionId,
    },
    FlashStateChanged {
        job_id: FlashJobId,
        from: FlashState,
        to: FlashState,
    },
    FlashProgress {
        job_id: FlashJobId,
        progress: u8,
    },
    SystemLevelChanged {
        from: ApplyMode,
        to: ApplyMode,
    },
    SystemArmChanged {
        armed: bool,
    },
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<OrchestratorEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Fire and forget. No subscribers is not an error.
    pub fn send(&self, event: OrchestratorEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_events_01_send_without_subscribers_is_silent() {
        let bus = EventBus::new(4);
        bus.send(OrchestratorEvent::SystemArmChanged { armed: true });
        let mut rx = bus.subscribe();
        bus.send(OrchestratorEvent::SessionArmed {
            session_id: ApplySessionId(1),
        });
        assert_eq!(
            rx.try_recv().unwrap(),
            OrchestratorEvent::SessionArmed {
                session_id: ApplySessionId(1)
            }
        );
    }

    #[test]
    fn at_events_02_events_serialize_with_type_tag() {
        let json = serde_json::to_value(OrchestratorEvent::SystemLevelChanged {
            from: ApplyMode::Simulate,
            to: ApplyMode::LiveApply,
        })
        .unwrap();
        assert_eq!(json["type"], "system_level_changed");
        assert_eq!(json["to"], "LIVE_APPLY");
    }
}
