#![forbid(unsafe_code)]

pub mod common;

pub mod audit;
pub mod calibration;
pub mod capability;
pub mod changeset;
pub mod flash;
pub mod safety;
pub mod session;
pub mod validation;

pub use common::{ContractViolation, MonotonicTimeNs, ReasonCodeId, SchemaVersion, Validate};
