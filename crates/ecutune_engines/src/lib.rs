#![forbid(unsafe_code)]

pub mod book;
pub mod contract;
pub mod flash_image;
pub mod safety_rules;
pub mod simulation;
pub mod simulation_only;
pub mod telemetry;
pub mod validator;
pub mod virtual_ecu;
