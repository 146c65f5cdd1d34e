#![forbid(unsafe_code)]

use std::sync::Arc;

use ecutune_kernel_contracts::calibration::{CalibrationMap, MapCategory, MapId, Profile};
use ecutune_kernel_contracts::capability::{
    EngineCapabilities, EngineConnection, EngineId, EngineStatus,
};
use ecutune_kernel_contracts::changeset::{Changeset, ChangesetId, MapChange};
use ecutune_kernel_contracts::flash::{FlashBlock, FlashImage};
use ecutune_kernel_contracts::session::{ApplyMode, VehicleSessionId};
use ecutune_kernel_contracts::validation::ValidationResult;
use ecutune_kernel_contracts::MonotonicTimeNs;
use parking_lot::Mutex;

use crate::book::CalibrationBook;
use crate::contract::{EngineError, LiveWriteOutcome, TelemetryReceiver, TuningEngine};
use crate::simulation::{SimulationEngine, SimulationReport};
use crate::validator::{CalibrationValidator, CalibrationValidatorConfig};

/// Offline back-end: validation and dry runs against a calibration book, nothing
/// that reaches a vehicle.
#[derive(Debug)]
pub struct SimulationOnlyBackend {
    engine_id: EngineId,
    book: Mutex<CalibrationBook>,
    connected: Mutex<bool>,
    simulator: SimulationEngine,
    validator: CalibrationValidator,
}

impl SimulationOnlyBackend {
    pub fn new(engine_id: EngineId, profile: Profile) -> Self {
        let validator = CalibrationValidator::new(CalibrationValidatorConfig::mvp_v1());
        Self {
            engine_id,
            book: Mutex::new(CalibrationBook::new(profile)),
            connected: Mutex::new(false),
            simulator: SimulationEngine::new(validator.clone()),
            validator,
        }
    }

    fn unsupported<T>(&self, operation: &'static str) -> Result<T, EngineError> {
        Err(EngineError::Unsupported {
            engine_id: self.engine_id.clone(),
            operation,
        })
    }
}

impl TuningEngine for SimulationOnlyBackend {
    fn engine_id(&self) -> &EngineId {
        &self.engine_id
    }

    fn capabilities(&self) -> EngineCapabilities {
        EngineCapabilities {
            supported_modes: vec![ApplyMode::Simulate],
            supports_live_apply: false,
            supports_flash: false,
            supports_simulation: true,
            requires_arming: false,
            supported_map_types: MapCategory::all().to_vec(),
        }
    }

    fn connect(&self) -> Result<EngineStatus, EngineError> {
        *self.connected.lock() = true;
        Ok(self.status())
    }

    fn disconnect(&self) -> Result<(), EngineError> {
        *self.connected.lock() = false;
        Ok(())
    }

    fn status(&self) -> EngineStatus {
        EngineStatus {
            engine_id: self.engine_id.clone(),
            vendor: "offline".to_string(),
            connection: if *self.connected.lock() {
                EngineConnection::Connected
            } else {
                EngineConnection::Disconnected
            },
            firmware: None,
        }
    }

    fn list_maps(&self) -> Result<Vec<CalibrationMap>, EngineError> {
        Ok(self.book.lock().list_maps())
    }

    fn get_map(&self, map_id: &MapId) -> Result<CalibrationMap, EngineError> {
        self.book.lock().get_map(map_id)
    }

    fn update_map(
        &self,
        map_id: &MapId,
        row: Option<usize>,
        col: Option<usize>,
        value: f64,
    ) -> Result<CalibrationMap, EngineError> {
        self.book.lock().update_map(map_id, row, col, value)
    }

    fn create_changeset(
        &self,
        changes: Vec<MapChange>,
        author: &str,
        notes: &str,
        created_at: MonotonicTimeNs,
    ) -> Result<Arc<Changeset>, EngineError> {
        self.book
            .lock()
            .create_changeset(changes, author, notes, created_at)
    }

    fn get_changeset(&self, changeset_id: ChangesetId) -> Result<Arc<Changeset>, EngineError> {
        self.book.lock().get_changeset(changeset_id)
    }

    fn list_changesets(&self) -> Result<Vec<Arc<Changeset>>, EngineError> {
        Ok(self.book.lock().list_changesets())
    }

    fn validate_changes(&self, changeset: &Changeset) -> Result<ValidationResult, EngineError> {
        Ok(self
            .validator
            .validate_changeset(self.book.lock().profile(), changeset))
    }

    fn simulate(&self, changeset: &Changeset) -> Result<SimulationReport, EngineError> {
        let profile = self.book.lock().profile().clone();
        self.simulator.run(&profile, Some(changeset))
    }

    fn start_live_session(
        &self,
        _vehicle_session_id: &VehicleSessionId,
        _mode: ApplyMode,
    ) -> Result<String, EngineError> {
        self.unsupported("start_live_session")
    }

    fn close_live_session(&self, _engine_session_ref: &str) {}

    fn arm_session(&self, _engine_session_ref: &str) -> Result<(), EngineError> {
        self.unsupported("arm_session")
    }

    fn apply_live(
        &self,
        _engine_session_ref: &str,
        _changeset: &Changeset,
    ) -> Result<LiveWriteOutcome, EngineError> {
        self.unsupported("apply_live")
    }

    fn revert_live(&self, _engine_session_ref: &str) -> Result<(), EngineError> {
        self.unsupported("revert_live")
    }

    fn prepare_flash(&self, _image: &FlashImage) -> Result<(), EngineError> {
        self.unsupported("prepare_flash")
    }

    fn write_flash_block(&self, _block: &FlashBlock) -> Result<(), EngineError> {
        self.unsupported("write_flash_block")
    }

    fn read_back_checksum(&self, _image: &FlashImage) -> Result<String, EngineError> {
        self.unsupported("read_back_checksum")
    }

    fn abort_flash(&self) -> Result<(), EngineError> {
        self.unsupported("abort_flash")
    }

    fn subscribe_telemetry(
        &self,
        vehicle_session_id: &VehicleSessionId,
    ) -> Result<TelemetryReceiver, EngineError> {
        Err(EngineError::TelemetryUnavailable(vehicle_session_id.clone()))
    }

    fn unsubscribe_telemetry(&self, _vehicle_session_id: &VehicleSessionId) {}
}
