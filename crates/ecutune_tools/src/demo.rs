#![forbid(unsafe_code)]

use ecutune_kernel_contracts::calibration::{
    AxisDef, CalibrationMap, MapCategory, MapId, Profile, ProfileId,
};
use ecutune_kernel_contracts::ContractViolation;

pub const STOCK_PROFILE: &str = "stock";
pub const STAGE1_PROFILE: &str = "stage1";
pub const DEMO_ENGINE: &str = "vecu-demo";
pub const DEMO_VEHICLE: &str = "bench-car-1";

fn fuel(cells: Vec<f64>) -> Result<CalibrationMap, ContractViolation> {
    let rpm = AxisDef::new("rpm", "RPM", vec![1000.0, 3000.0, 5000.0])?;
    let load = AxisDef::new("load", "%", vec![20.0, 60.0, 100.0])?;
    Ok(
        CalibrationMap::table(MapId::new("fuel_main")?, "Fuel Main", MapCategory::Fueling, 3, 3, cells)?
            .with_bounds(Some(0.0), Some(25.0))?
            .with_unit("ms", 100.0)?
            .with_axes(Some(rpm), Some(load))?
            .at_address(0x1000),
    )
}

fn ignition(cells: Vec<f64>) -> Result<CalibrationMap, ContractViolation> {
    Ok(
        CalibrationMap::linear(MapId::new("ign_base")?, "Ignition Base", MapCategory::Ignition, cells)?
            .with_bounds(Some(0.0), Some(40.0))?
            .with_unit("deg", 10.0)?
            .at_address(0x2000),
    )
}

fn boost(cells: Vec<f64>) -> Result<CalibrationMap, ContractViolation> {
    Ok(
        CalibrationMap::linear(MapId::new("boost_target")?, "Boost Target", MapCategory::Boost, cells)?
            .with_bounds(Some(0.0), Some(30.0))?
            .with_unit("psi", 10.0)?
            .at_address(0x3000),
    )
}

/// Factory calibration of the bench car.
pub fn stock_profile() -> Result<Profile, ContractViolation> {
    Profile::v1(
        ProfileId::new(STOCK_PROFILE)?,
        "Stock",
        "bench hatchback 2.0T",
        vec![
            fuel(vec![2.0, 3.5, 5.0, 2.5, 4.5, 7.0, 3.0, 6.0, 9.5])?,
            ignition(vec![12.0, 16.0, 20.0, 22.0])?,
            boost(vec![8.0, 12.0, 15.0, 15.0])?,
        ],
    )
}

/// Mild street tune: more fuel at high load, a little timing, more boost.
pub fn stage1_profile() -> Result<Profile, ContractViolation> {
    Profile::v1(
        ProfileId::new(STAGE1_PROFILE)?,
        "Stage 1",
        "bench hatchback 2.0T",
        vec![
            fuel(vec![2.0, 3.5, 5.5, 2.5, 4.8, 7.8, 3.0, 6.5, 10.5])?,
            ignition(vec![12.0, 17.0, 21.0, 23.0])?,
            boost(vec![8.0, 14.0, 18.0, 18.0])?,
        ],
    )
}
