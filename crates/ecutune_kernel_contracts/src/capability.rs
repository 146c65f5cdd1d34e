#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::calibration::MapCategory;
use crate::common::string_id;
use crate::session::ApplyMode;
use crate::{ContractViolation, Validate};

string_id!(EngineId, "engine_id", 64);

/// Declared capability set of a tuning back-end. Flags are explicit data; the
/// orchestrator never infers support from which operations happen to succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineCapabilities {
    pub supported_modes: Vec<ApplyMode>,
    pub supports_live_apply: bool,
    pub supports_flash: bool,
    pub supports_simulation: bool,
    pub requires_arming: bool,
    pub supported_map_types: Vec<MapCategory>,
}

impl EngineCapabilities {
    pub fn supports_mode(&self, mode: ApplyMode) -> bool {
        let flag = match mode {
            ApplyMode::Simulate => self.supports_simulation,
            ApplyMode::LiveApply => self.supports_live_apply,
            ApplyMode::Flash => self.supports_flash,
        };
        flag && self.supported_modes.contains(&mode)
    }

    pub fn supports_category(&self, category: MapCategory) -> bool {
        self.supported_map_types.contains(&category)
    }
}

impl Validate for EngineCapabilities {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.supported_modes.is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "engine_capabilities.supported_modes",
                reason: "must not be empty",
            });
        }
        for mode in &self.supported_modes {
            let declared = match mode {
                ApplyMode::Simulate => self.supports_simulation,
                ApplyMode::LiveApply => self.supports_live_apply,
                ApplyMode::Flash => self.supports_flash,
            };
            if !declared {
                return Err(ContractViolation::InvalidValue {
                    field: "engine_capabilities.supported_modes",
                    reason: "listed mode must have its support flag set",
                });
            }
        }
        if (self.supports_live_apply || self.supports_flash) && !self.requires_arming {
            return Err(ContractViolation::InvalidValue {
                field: "engine_capabilities.requires_arming",
                reason: "write-capable engines must require arming",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngineConnection {
    Disconnected,
    Connected,
    Busy,
}

impl EngineConnection {
    pub fn as_str(self) -> &'static str {
        match self {
            EngineConnection::Disconnected => "DISCONNECTED",
            EngineConnection::Connected => "CONNECTED",
            EngineConnection::Busy => "BUSY",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStatus {
    pub engine_id: EngineId,
    pub vendor: String,
    pub connection: EngineConnection,
    pub firmware: Option<String>,
}
