#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use ecutune_kernel_contracts::calibration::{CalibrationMap, MapCategory, MapId, Profile};
use ecutune_kernel_contracts::capability::{
    EngineCapabilities, EngineConnection, EngineId, EngineStatus,
};
use ecutune_kernel_contracts::changeset::{Changeset, ChangesetId, MapChange};
use ecutune_kernel_contracts::flash::{FlashBlock, FlashImage};
use ecutune_kernel_contracts::safety::EngineSample;
use ecutune_kernel_contracts::session::{ApplyMode, VehicleSessionId};
use ecutune_kernel_contracts::validation::ValidationResult;
use ecutune_kernel_contracts::MonotonicTimeNs;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::book::CalibrationBook;
use crate::contract::{EngineError, LiveWriteOutcome, TelemetryReceiver, TuningEngine};
use crate::flash_image::checksum_blocks;
use crate::simulation::{SimulationEngine, SimulationReport};
use crate::telemetry::TelemetryFeed;
use crate::validator::{CalibrationValidator, CalibrationValidatorConfig};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualEcuConfig {
    pub engine_id: EngineId,
    pub vendor: String,
    pub firmware: String,
    pub rom_size: u32,
    /// Pause per flash block, so halts can land mid-write.
    pub flash_block_delay_ms: u64,
}

impl VirtualEcuConfig {
    pub fn mvp_v1(engine_id: EngineId) -> Self {
        Self {
            engine_id,
            vendor: "virtual".to_string(),
            firmware: "vecu-1.0".to_string(),
            rom_size: 0x10_0000,
            flash_block_delay_ms: 0,
        }
    }
}

/// Injectable faults for exercising failure paths.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VirtualFaults {
    pub fail_apply: bool,
    /// The first cell of a live write silently does not stick.
    pub drop_first_cell: bool,
    pub fail_revert: bool,
    pub fail_flash_at_block: Option<usize>,
    pub corrupt_readback: bool,
}

#[derive(Debug)]
struct LiveSession {
    vehicle_session_id: VehicleSessionId,
    armed: bool,
    /// Cells overwritten by the last apply, in write order.
    backup: Vec<(MapId, Option<usize>, Option<usize>, f64)>,
}

#[derive(Debug)]
struct EcuState {
    connected: bool,
    book: CalibrationBook,
    ram: Profile,
    sessions: BTreeMap<String, LiveSession>,
    next_session: u64,
    rom: BTreeMap<u32, Vec<u8>>,
    flash_halt: bool,
    flash_blocks_written: usize,
    faults: VirtualFaults,
}

/// In-process ECU emulator: a RAM overlay for live writes, a flash ROM with
/// readback, and a telemetry feed driven by `publish_sample`.
#[derive(Debug)]
pub struct VirtualEcuBackend {
    config: VirtualEcuConfig,
    state: Mutex<EcuState>,
    telemetry: TelemetryFeed,
    validator: CalibrationValidator,
}

impl VirtualEcuBackend {
    pub fn new(config: VirtualEcuConfig, profile: Profile) -> Self {
        Self {
            config,
            state: Mutex::new(EcuState {
                connected: false,
                book: CalibrationBook::new(profile.clone()),
                ram: profile,
                sessions: BTreeMap::new(),
                next_session: 1,
                rom: BTreeMap::new(),
                flash_halt: false,
                flash_blocks_written: 0,
                faults: VirtualFaults::default(),
            }),
            telemetry: TelemetryFeed::new(),
            validator: CalibrationValidator::new(CalibrationValidatorConfig::mvp_v1()),
        }
    }

    pub fn set_faults(&self, faults: VirtualFaults) {
        self.state.lock().faults = faults;
    }

    pub fn publish_sample(&self, vehicle_session_id: &VehicleSessionId, sample: EngineSample) {
        self.telemetry.publish(vehicle_session_id, sample);
    }

    /// Current RAM value of one cell, as the vehicle sees it.
    pub fn live_cell(&self, map_id: &MapId, row: Option<usize>, col: Option<usize>) -> Option<f64> {
        self.state.lock().ram.map(map_id)?.grid.get(row, col)
    }

    pub fn open_live_sessions(&self) -> usize {
        self.state.lock().sessions.len()
    }

    pub fn rom_bytes(&self, address: u32) -> Option<Vec<u8>> {
        self.state.lock().rom.get(&address).cloned()
    }

    fn ensure_connected(&self, state: &EcuState) -> Result<(), EngineError> {
        if state.connected {
            Ok(())
        } else {
            Err(EngineError::NotConnected {
                engine_id: self.config.engine_id.clone(),
            })
        }
    }

    fn connection_status(&self, connected: bool) -> EngineStatus {
        EngineStatus {
            engine_id: self.config.engine_id.clone(),
            vendor: self.config.vendor.clone(),
            connection: if connected {
                EngineConnection::Connected
            } else {
                EngineConnection::Disconnected
            },
            firmware: Some(self.config.firmware.clone()),
        }
    }
}

fn restore(ram: &mut Profile, backup: &[(MapId, Option<usize>, Option<usize>, f64)]) {
    for (map_id, row, col, old) in backup.iter().rev() {
        if let Some(map) = ram.map_mut(map_id) {
            // Backed-up positions were valid when written.
            let _ = map.set_cell(*row, *col, *old);
        }
    }
}

impl TuningEngine for VirtualEcuBackend {
    fn engine_id(&self) -> &EngineId {
        &self.config.engine_id
    }

    fn capabilities(&self) -> EngineCapabilities {
        EngineCapabilities {
            supported_modes: vec![ApplyMode::Simulate, ApplyMode::LiveApply, ApplyMode::Flash],
            supports_live_apply: true,
            supports_flash: true,
            supports_simulation: true,
            requires_arming: true,
            supported_map_types: MapCategory::all().to_vec(),
        }
    }

    fn connect(&self) -> Result<EngineStatus, EngineError> {
        let mut state = self.state.lock();
        state.connected = true;
        info!(engine_id = %self.config.engine_id, "virtual ecu connected");
        Ok(self.connection_status(true))
    }

    fn disconnect(&self) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        state.connected = false;
        info!(engine_id = %self.config.engine_id, "virtual ecu disconnected");
        Ok(())
    }

    fn status(&self) -> EngineStatus {
        self.connection_status(self.state.lock().connected)
    }

    fn list_maps(&self) -> Result<Vec<CalibrationMap>, EngineError> {
        Ok(self.state.lock().book.list_maps())
    }

    fn get_map(&self, map_id: &MapId) -> Result<CalibrationMap, EngineError> {
        self.state.lock().book.get_map(map_id)
    }

    fn update_map(
        &self,
        map_id: &MapId,
        row: Option<usize>,
        col: Option<usize>,
        value: f64,
    ) -> Result<CalibrationMap, EngineError> {
        self.state.lock().book.update_map(map_id, row, col, value)
    }

    fn create_changeset(
        &self,
        changes: Vec<MapChange>,
        author: &str,
        notes: &str,
        created_at: MonotonicTimeNs,
    ) -> Result<Arc<Changeset>, EngineError> {
        self.state
            .lock()
            .book
            .create_changeset(changes, author, notes, created_at)
    }

    fn get_changeset(&self, changeset_id: ChangesetId) -> Result<Arc<Changeset>, EngineError> {
        self.state.lock().book.get_changeset(changeset_id)
    }

    fn list_changesets(&self) -> Result<Vec<Arc<Changeset>>, EngineError> {
        Ok(self.state.lock().book.list_changesets())
    }

    fn validate_changes(&self, changeset: &Changeset) -> Result<ValidationResult, EngineError> {
        let state = self.state.lock();
        Ok(self.validator.validate_changeset(state.book.profile(), changeset))
    }

    fn simulate(&self, changeset: &Changeset) -> Result<SimulationReport, EngineError> {
        let profile = self.state.lock().book.profile().clone();
        SimulationEngine::new(self.validator.clone()).run(&profile, Some(changeset))
    }

    fn start_live_session(
        &self,
        vehicle_session_id: &VehicleSessionId,
        mode: ApplyMode,
    ) -> Result<String, EngineError> {
        let mut state = self.state.lock();
        self.ensure_connected(&state)?;
        let engine_ref = format!("vecu-{}-{}", mode.as_str().to_ascii_lowercase(), state.next_session);
        state.next_session += 1;
        state.sessions.insert(
            engine_ref.clone(),
            LiveSession {
                vehicle_session_id: vehicle_session_id.clone(),
                armed: false,
                backup: Vec::new(),
            },
        );
        debug!(engine_ref = %engine_ref, vehicle = %vehicle_session_id, "virtual ecu session opened");
        Ok(engine_ref)
    }

    fn close_live_session(&self, engine_session_ref: &str) {
        if self.state.lock().sessions.remove(engine_session_ref).is_some() {
            debug!(engine_ref = %engine_session_ref, "virtual ecu session closed");
        }
    }

    fn arm_session(&self, engine_session_ref: &str) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        self.ensure_connected(&state)?;
        let session = state
            .sessions
            .get_mut(engine_session_ref)
            .ok_or_else(|| EngineError::SessionNotFound(engine_session_ref.to_string()))?;
        session.armed = true;
        Ok(())
    }

    fn apply_live(
        &self,
        engine_session_ref: &str,
        changeset: &Changeset,
    ) -> Result<LiveWriteOutcome, EngineError> {
        let mut guard = self.state.lock();
        self.ensure_connected(&guard)?;
        let state = &mut *guard;
        let session = state
            .sessions
            .get_mut(engine_session_ref)
            .ok_or_else(|| EngineError::SessionNotFound(engine_session_ref.to_string()))?;
        if !session.armed {
            return Err(EngineError::SessionNotArmed(engine_session_ref.to_string()));
        }
        if state.faults.fail_apply {
            return Err(EngineError::WriteFailed("injected apply fault".to_string()));
        }

        let mut backup = Vec::with_capacity(changeset.changes.len());
        for (i, change) in changeset.changes.iter().enumerate() {
            let written = match state.ram.map_mut(&change.map_id) {
                None => Err(EngineError::MapNotFound(change.map_id.clone())),
                Some(_) if i == 0 && state.faults.drop_first_cell => continue,
                Some(map) => map
                    .set_cell(change.row, change.col, change.new_value)
                    .map_err(EngineError::from),
            };
            match written {
                Ok(old) => backup.push((change.map_id.clone(), change.row, change.col, old)),
                Err(err) => {
                    restore(&mut state.ram, &backup);
                    return Err(err);
                }
            }
        }

        let mut expected: BTreeMap<(&MapId, Option<usize>, Option<usize>), f64> = BTreeMap::new();
        for change in &changeset.changes {
            expected.insert((&change.map_id, change.row, change.col), change.new_value);
        }
        let verified = expected.iter().all(|((map_id, row, col), value)| {
            state
                .ram
                .map(map_id)
                .and_then(|m| m.grid.get(*row, *col))
                .is_some_and(|v| v == *value)
        });

        let cells_written = backup.len();
        session.backup.extend(backup);
        info!(
            engine_ref = engine_session_ref,
            vehicle = %session.vehicle_session_id,
            cells_written,
            verified,
            "virtual ecu live write"
        );
        Ok(LiveWriteOutcome {
            cells_written,
            verified,
        })
    }

    fn revert_live(&self, engine_session_ref: &str) -> Result<(), EngineError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.faults.fail_revert {
            return Err(EngineError::RevertFailed("injected revert fault".to_string()));
        }
        let session = state
            .sessions
            .get_mut(engine_session_ref)
            .ok_or_else(|| EngineError::SessionNotFound(engine_session_ref.to_string()))?;
        let backup = std::mem::take(&mut session.backup);
        session.armed = false;
        restore(&mut state.ram, &backup);
        info!(engine_ref = engine_session_ref, cells_restored = backup.len(), "virtual ecu reverted");
        Ok(())
    }

    fn prepare_flash(&self, image: &FlashImage) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        self.ensure_connected(&state)?;
        for block in &image.blocks {
            let end = u64::from(block.address) + u64::from(block.size);
            if end > u64::from(self.config.rom_size) {
                return Err(EngineError::WriteFailed(format!(
                    "block at {:#x} ends past rom size {:#x}",
                    block.address, self.config.rom_size
                )));
            }
        }
        state.flash_halt = false;
        state.flash_blocks_written = 0;
        Ok(())
    }

    fn write_flash_block(&self, block: &FlashBlock) -> Result<(), EngineError> {
        if self.config.flash_block_delay_ms > 0 {
            thread::sleep(Duration::from_millis(self.config.flash_block_delay_ms));
        }
        let mut state = self.state.lock();
        self.ensure_connected(&state)?;
        let index = state.flash_blocks_written;
        if state.flash_halt {
            return Err(EngineError::FlashHalted { block_index: index });
        }
        if state.faults.fail_flash_at_block == Some(index) {
            return Err(EngineError::WriteFailed(format!("injected fault at block {index}")));
        }
        state.rom.insert(block.address, block.payload.clone());
        state.flash_blocks_written += 1;
        Ok(())
    }

    fn read_back_checksum(&self, image: &FlashImage) -> Result<String, EngineError> {
        let state = self.state.lock();
        let mut blocks = Vec::with_capacity(image.blocks.len());
        for block in &image.blocks {
            let mut payload = state.rom.get(&block.address).cloned().ok_or_else(|| {
                EngineError::WriteFailed(format!("block at {:#x} was never written", block.address))
            })?;
            payload.truncate(block.payload.len());
            blocks.push(FlashBlock {
                payload,
                ..block.clone()
            });
        }
        if state.faults.corrupt_readback {
            if let Some(byte) = blocks.first_mut().and_then(|b| b.payload.first_mut()) {
                *byte ^= 0xFF;
            }
        }
        Ok(checksum_blocks(&blocks))
    }

    fn abort_flash(&self) -> Result<(), EngineError> {
        self.state.lock().flash_halt = true;
        warn!(engine_id = %self.config.engine_id, "virtual ecu flash halt requested");
        Ok(())
    }

    fn subscribe_telemetry(
        &self,
        vehicle_session_id: &VehicleSessionId,
    ) -> Result<TelemetryReceiver, EngineError> {
        Ok(self.telemetry.subscribe(vehicle_session_id))
    }

    fn unsubscribe_telemetry(&self, vehicle_session_id: &VehicleSessionId) {
        self.telemetry.unsubscribe(vehicle_session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash_image::assemble_image;
    use ecutune_kernel_contracts::calibration::ProfileId;

    fn map_id(v: &str) -> MapId {
        MapId::new(v).unwrap()
    }

    fn ecu() -> VirtualEcuBackend {
        let boost = CalibrationMap::linear(map_id("boost"), "Boost Target", MapCategory::Boost, vec![14.0, 16.0])
            .unwrap()
            .at_address(0x100);
        let profile = Profile::v1(ProfileId::new("stock").unwrap(), "Stock", "demo", vec![boost]).unwrap();
        let ecu = VirtualEcuBackend::new(VirtualEcuConfig::mvp_v1(EngineId::new("vecu").unwrap()), profile);
        ecu.connect().unwrap();
        ecu
    }

    fn changeset(ecu: &VirtualEcuBackend) -> Arc<Changeset> {
        ecu.create_changeset(
            vec![
                MapChange::v1(map_id("boost"), None, Some(0), 14.0, 18.0, "more").unwrap(),
                MapChange::v1(map_id("boost"), None, Some(1), 16.0, 19.0, "more").unwrap(),
            ],
            "tech",
            "",
            MonotonicTimeNs(1),
        )
        .unwrap()
    }

    fn armed_session(ecu: &VirtualEcuBackend) -> String {
        let r = ecu
            .start_live_session(&VehicleSessionId::new("veh").unwrap(), ApplyMode::LiveApply)
            .unwrap();
        ecu.arm_session(&r).unwrap();
        r
    }

    #[test]
    fn at_virtual_ecu_01_live_write_then_revert_restores_ram() {
        let ecu = ecu();
        let cs = changeset(&ecu);
        let r = armed_session(&ecu);
        let outcome = ecu.apply_live(&r, &cs).unwrap();
        assert_eq!(outcome, LiveWriteOutcome { cells_written: 2, verified: true });
        assert_eq!(ecu.live_cell(&map_id("boost"), None, Some(1)), Some(19.0));
        ecu.revert_live(&r).unwrap();
        ecu.revert_live(&r).unwrap();
        assert_eq!(ecu.live_cell(&map_id("boost"), None, Some(0)), Some(14.0));
        assert_eq!(ecu.live_cell(&map_id("boost"), None, Some(1)), Some(16.0));
    }

    #[test]
    fn at_virtual_ecu_02_unarmed_and_disconnected_writes_refused() {
        let ecu = ecu();
        let cs = changeset(&ecu);
        let r = ecu
            .start_live_session(&VehicleSessionId::new("veh").unwrap(), ApplyMode::LiveApply)
            .unwrap();
        assert!(matches!(ecu.apply_live(&r, &cs), Err(EngineError::SessionNotArmed(_))));
        ecu.disconnect().unwrap();
        assert!(matches!(ecu.arm_session(&r), Err(EngineError::NotConnected { .. })));
    }

    #[test]
    fn at_virtual_ecu_03_dropped_cell_fails_verification() {
        let ecu = ecu();
        let cs = changeset(&ecu);
        let r = armed_session(&ecu);
        ecu.set_faults(VirtualFaults {
            drop_first_cell: true,
            ..VirtualFaults::default()
        });
        let outcome = ecu.apply_live(&r, &cs).unwrap();
        assert!(!outcome.verified);
        assert_eq!(outcome.cells_written, 1);
    }

    #[test]
    fn at_virtual_ecu_04_flash_readback_matches_image() {
        let ecu = ecu();
        let profile = Profile::v1(
            ProfileId::new("stage1").unwrap(),
            "Stage 1",
            "demo",
            ecu.list_maps().unwrap(),
        )
        .unwrap();
        let image = assemble_image(&profile).unwrap();
        ecu.prepare_flash(&image).unwrap();
        for block in &image.blocks {
            ecu.write_flash_block(block).unwrap();
        }
        assert_eq!(ecu.read_back_checksum(&image).unwrap(), image.checksum);
        ecu.set_faults(VirtualFaults {
            corrupt_readback: true,
            ..VirtualFaults::default()
        });
        assert_ne!(ecu.read_back_checksum(&image).unwrap(), image.checksum);
    }

    #[test]
    fn at_virtual_ecu_05_halt_stops_next_block() {
        let ecu = ecu();
        let profile = Profile::v1(ProfileId::new("p").unwrap(), "P", "", ecu.list_maps().unwrap()).unwrap();
        let image = assemble_image(&profile).unwrap();
        ecu.prepare_flash(&image).unwrap();
        ecu.abort_flash().unwrap();
        assert!(matches!(
            ecu.write_flash_block(&image.blocks[0]),
            Err(EngineError::FlashHalted { block_index: 0 })
        ));
    }

    #[test]
    fn at_virtual_ecu_06_closed_session_is_forgotten() {
        let ecu = ecu();
        let r = ecu
            .start_live_session(&VehicleSessionId::new("veh").unwrap(), ApplyMode::LiveApply)
            .unwrap();
        assert_eq!(ecu.open_live_sessions(), 1);
        ecu.close_live_session(&r);
        ecu.close_live_session(&r);
        assert_eq!(ecu.open_live_sessions(), 0);
        assert!(matches!(ecu.arm_session(&r), Err(EngineError::SessionNotFound(_))));
    }
}
