#![forbid(unsafe_code)]

pub mod ecu_store;
pub mod repo;
