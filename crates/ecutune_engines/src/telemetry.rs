#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use ecutune_kernel_contracts::safety::EngineSample;
use ecutune_kernel_contracts::session::VehicleSessionId;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::contract::TelemetryReceiver;

/// Per-vehicle latest-value channels. Publishing overwrites; slow readers only ever
/// see the freshest sample.
#[derive(Debug, Default)]
pub struct TelemetryFeed {
    channels: Mutex<BTreeMap<VehicleSessionId, watch::Sender<Option<EngineSample>>>>,
}

impl TelemetryFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, vehicle_session_id: &VehicleSessionId) -> TelemetryReceiver {
        let mut channels = self.channels.lock();
        channels
            .entry(vehicle_session_id.clone())
            .or_insert_with(|| watch::channel(None).0)
            .subscribe()
    }

    /// Returns the number of live subscribers that will observe the sample.
    pub fn publish(&self, vehicle_session_id: &VehicleSessionId, sample: EngineSample) -> usize {
        let mut channels = self.channels.lock();
        let sender = channels
            .entry(vehicle_session_id.clone())
            .or_insert_with(|| watch::channel(None).0);
        sender.send_replace(Some(sample));
        sender.receiver_count()
    }

    pub fn latest(&self, vehicle_session_id: &VehicleSessionId) -> Option<EngineSample> {
        self.channels
            .lock()
            .get(vehicle_session_id)
            .and_then(|s| *s.borrow())
    }

    /// Drops the channel; existing receivers observe it as closed.
    pub fn unsubscribe(&self, vehicle_session_id: &VehicleSessionId) {
        self.channels.lock().remove(vehicle_session_id);
    }
}
