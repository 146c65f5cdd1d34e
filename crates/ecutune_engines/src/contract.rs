#![forbid(unsafe_code)]

use std::sync::Arc;

use ecutune_kernel_contracts::calibration::{CalibrationMap, MapId};
use ecutune_kernel_contracts::capability::{EngineCapabilities, EngineId, EngineStatus};
use ecutune_kernel_contracts::changeset::{Changeset, ChangesetId, MapChange};
use ecutune_kernel_contracts::flash::{FlashBlock, FlashImage};
use ecutune_kernel_contracts::safety::EngineSample;
use ecutune_kernel_contracts::session::{ApplyMode, VehicleSessionId};
use ecutune_kernel_contracts::validation::ValidationResult;
use ecutune_kernel_contracts::{ContractViolation, MonotonicTimeNs};
use thiserror::Error;
use tokio::sync::watch;

use crate::simulation::SimulationReport;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error("engine {engine_id} is not connected")]
    NotConnected { engine_id: EngineId },
    #[error("engine {engine_id} does not support {operation}")]
    Unsupported {
        engine_id: EngineId,
        operation: &'static str,
    },
    #[error("map not found: {0}")]
    MapNotFound(MapId),
    #[error("changeset not found: {0}")]
    ChangesetNotFound(ChangesetId),
    #[error("engine session not found: {0}")]
    SessionNotFound(String),
    #[error("engine session {0} is not armed")]
    SessionNotArmed(String),
    #[error("value {value} outside [{min}, {max}]")]
    OutOfBounds { value: f64, min: f64, max: f64 },
    #[error("write failed: {0}")]
    WriteFailed(String),
    #[error("revert failed: {0}")]
    RevertFailed(String),
    #[error("flash halted at block {block_index}")]
    FlashHalted { block_index: usize },
    #[error("telemetry unavailable for vehicle session {0}")]
    TelemetryUnavailable(VehicleSessionId),
    #[error(transparent)]
    Contract(#[from] ContractViolation),
}

/// What a live write reports back after the engine reads the cells again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveWriteOutcome {
    pub cells_written: usize,
    pub verified: bool,
}

/// Latest-value telemetry handle. `None` until the first sample arrives.
pub type TelemetryReceiver = watch::Receiver<Option<EngineSample>>;

/// Uniform contract over vendor back-ends. Capability flags are declared data and
/// callers consult them before invoking a mode-specific operation.
pub trait TuningEngine: Send + Sync {
    fn engine_id(&self) -> &EngineId;
    fn capabilities(&self) -> EngineCapabilities;

    fn connect(&self) -> Result<EngineStatus, EngineError>;
    fn disconnect(&self) -> Result<(), EngineError>;
    fn status(&self) -> EngineStatus;

    fn list_maps(&self) -> Result<Vec<CalibrationMap>, EngineError>;
    fn get_map(&self, map_id: &MapId) -> Result<CalibrationMap, EngineError>;
    fn update_map(
        &self,
        map_id: &MapId,
        row: Option<usize>,
        col: Option<usize>,
        value: f64,
    ) -> Result<CalibrationMap, EngineError>;

    fn create_changeset(
        &self,
        changes: Vec<MapChange>,
        author: &str,
        notes: &str,
        created_at: MonotonicTimeNs,
    ) -> Result<Arc<Changeset>, EngineError>;
    fn get_changeset(&self, changeset_id: ChangesetId) -> Result<Arc<Changeset>, EngineError>;
    fn list_changesets(&self) -> Result<Vec<Arc<Changeset>>, EngineError>;

    fn validate_changes(&self, changeset: &Changeset) -> Result<ValidationResult, EngineError>;
    /// Dry run. Never touches vehicle state.
    fn simulate(&self, changeset: &Changeset) -> Result<SimulationReport, EngineError>;

    /// Opens the engine-side session and returns its reference.
    fn start_live_session(
        &self,
        vehicle_session_id: &VehicleSessionId,
        mode: ApplyMode,
    ) -> Result<String, EngineError>;
    /// Drops an engine-side session that never got armed or written through.
    fn close_live_session(&self, engine_session_ref: &str);
    fn arm_session(&self, engine_session_ref: &str) -> Result<(), EngineError>;
    fn apply_live(
        &self,
        engine_session_ref: &str,
        changeset: &Changeset,
    ) -> Result<LiveWriteOutcome, EngineError>;
    fn revert_live(&self, engine_session_ref: &str) -> Result<(), EngineError>;

    fn prepare_flash(&self, image: &FlashImage) -> Result<(), EngineError>;
    /// Writes one block. Block boundaries are the safe points for a halt.
    fn write_flash_block(&self, block: &FlashBlock) -> Result<(), EngineError>;
    /// Reads the written region back and returns its checksum.
    fn read_back_checksum(&self, image: &FlashImage) -> Result<String, EngineError>;
    fn abort_flash(&self) -> Result<(), EngineError>;

    fn subscribe_telemetry(
        &self,
        vehicle_session_id: &VehicleSessionId,
    ) -> Result<TelemetryReceiver, EngineError>;
    fn unsubscribe_telemetry(&self, vehicle_session_id: &VehicleSessionId);
}
