#![forbid(unsafe_code)]

use std::sync::Arc;

use ecutune_engines::contract::TuningEngine;
use ecutune_engines::virtual_ecu::{VirtualEcuBackend, VirtualEcuConfig};
use ecutune_kernel_contracts::calibration::{CalibrationMap, MapCategory, MapId, Profile, ProfileId};
use ecutune_kernel_contracts::capability::EngineId;
use ecutune_kernel_contracts::changeset::{Changeset, MapChange};
use ecutune_kernel_contracts::session::{ApplyMode, ApplySessionId, VehicleSessionId};
use tokio::runtime::Handle;

use crate::clock::{Clock, ManualClock};
use crate::collaborators::{OperatorContext, OperatorMode, StaticOperatorContext};
use crate::config::OrchestratorConfig;
use crate::orchestrator::Orchestrator;

pub const ENGINE: &str = "vecu-1";
pub const VEHICLE: &str = "veh-1";
pub const PROFILE: &str = "stage1";

pub fn engine_id() -> EngineId {
    EngineId::new(ENGINE).unwrap()
}

pub fn vehicle() -> VehicleSessionId {
    VehicleSessionId::new(VEHICLE).unwrap()
}

pub fn profile_id() -> ProfileId {
    ProfileId::new(PROFILE).unwrap()
}

pub fn map_id(id: &str) -> MapId {
    MapId::new(id).unwrap()
}

pub fn profile_with(id: &str, ignition: Vec<f64>) -> Profile {
    let fuel = CalibrationMap::table(
        map_id("fuel"),
        "Fuel",
        MapCategory::Fueling,
        2,
        2,
        vec![10.0, 11.0, 12.0, 13.0],
    )
    .unwrap()
    .with_bounds(Some(0.0), Some(25.0))
    .unwrap()
    .with_unit("ms", 100.0)
    .unwrap()
    .at_address(0x1000);
    let ign = CalibrationMap::linear(map_id("ign"), "Ignition", MapCategory::Ignition, ignition)
        .unwrap()
        .with_bounds(Some(0.0), Some(40.0))
        .unwrap()
        .at_address(0x2000);
    let boost = CalibrationMap::linear(map_id("boost"), "Boost", MapCategory::Boost, vec![8.0, 10.0, 12.0])
        .unwrap()
        .with_bounds(Some(0.0), Some(30.0))
        .unwrap()
        .at_address(0x3000);
    Profile::v1(ProfileId::new(id).unwrap(), "Stage 1", "demo hatch", vec![fuel, ign, boost]).unwrap()
}

pub fn demo_profile() -> Profile {
    profile_with(PROFILE, vec![10.0, 12.0, 14.0, 16.0])
}

pub struct Harness {
    pub orchestrator: Arc<Orchestrator>,
    pub ecu: Arc<VirtualEcuBackend>,
    pub operator: Arc<StaticOperatorContext>,
    pub clock: Arc<ManualClock>,
}

pub fn harness_with(
    config: OrchestratorConfig,
    mode: OperatorMode,
    tweak_ecu: impl FnOnce(&mut VirtualEcuConfig),
) -> Harness {
    let mut ecu_config = VirtualEcuConfig::mvp_v1(engine_id());
    tweak_ecu(&mut ecu_config);
    let ecu = Arc::new(VirtualEcuBackend::new(ecu_config, demo_profile()));
    ecu.connect().unwrap();
    let operator = Arc::new(StaticOperatorContext::new(mode));
    let clock = Arc::new(ManualClock::starting_at_ms(1_000));
    let orchestrator = Orchestrator::new(
        config,
        clock.clone() as Arc<dyn Clock>,
        operator.clone() as Arc<dyn OperatorContext>,
        Handle::current(),
    );
    orchestrator.register_engine(ecu.clone());
    orchestrator.create_profile(demo_profile()).unwrap();
    Harness {
        orchestrator,
        ecu,
        operator,
        clock,
    }
}

pub fn harness() -> Harness {
    harness_with(
        OrchestratorConfig::mvp_v1(),
        OperatorMode::Development,
        |_| {},
    )
}

impl Harness {
    /// Fuel cell (0,0) from 10 to `value`.
    pub fn fuel_changeset(&self, value: f64) -> Arc<Changeset> {
        let change = MapChange::v1(map_id("fuel"), Some(0), Some(0), 10.0, value, "richer").unwrap();
        self.orchestrator
            .create_changeset(Some(profile_id()), vec![change], "tech-7", "")
            .unwrap()
    }

    pub fn arm_level(&self, level: ApplyMode) {
        self.orchestrator.arm_system();
        self.orchestrator.set_level(level).unwrap();
    }

    /// Created and armed, ready to write.
    pub fn armed_session(&self, mode: ApplyMode, changeset: Option<&Changeset>) -> ApplySessionId {
        let ticket = self
            .orchestrator
            .create_session(&engine_id(), vehicle(), changeset.map(|c| c.id), Some(mode))
            .unwrap();
        let id = ticket.session.id;
        self.orchestrator
            .arm_session(id, ticket.apply_token.as_str())
            .unwrap();
        id
    }
}
