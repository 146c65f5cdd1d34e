#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::calibration::{MapId, ProfileId};
use crate::capability::EngineId;
use crate::changeset::ChangesetId;
use crate::common::numeric_id;
use crate::session::ApplySessionId;
use crate::{ContractViolation, MonotonicTimeNs, SchemaVersion, Validate};

pub const FLASH_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

numeric_id!(FlashJobId, "flash_job_id");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlashState {
    Prepared,
    Validating,
    Flashing,
    Verifying,
    Completed,
    Failed,
    Aborted,
}

impl FlashState {
    pub fn as_str(self) -> &'static str {
        match self {
            FlashState::Prepared => "PREPARED",
            FlashState::Validating => "VALIDATING",
            FlashState::Flashing => "FLASHING",
            FlashState::Verifying => "VERIFYING",
            FlashState::Completed => "COMPLETED",
            FlashState::Failed => "FAILED",
            FlashState::Aborted => "ABORTED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            FlashState::Completed | FlashState::Failed | FlashState::Aborted
        )
    }
}

pub fn is_allowed_flash_transition(from: FlashState, to: FlashState) -> bool {
    if from.is_terminal() {
        return false;
    }
    match to {
        FlashState::Failed | FlashState::Aborted => true,
        FlashState::Validating => from == FlashState::Prepared,
        FlashState::Flashing => from == FlashState::Validating,
        FlashState::Verifying => from == FlashState::Flashing,
        FlashState::Completed => from == FlashState::Verifying,
        FlashState::Prepared => false,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlashBlock {
    pub map_id: MapId,
    pub address: u32,
    pub size: u32,
    pub payload: Vec<u8>,
}

impl Validate for FlashBlock {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.map_id.validate()?;
        if self.size == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "flash_block.size",
                reason: "must be > 0",
            });
        }
        if u32::try_from(self.payload.len()).ok() != Some(self.size) {
            return Err(ContractViolation::InvalidValue {
                field: "flash_block.payload",
                reason: "length must equal size",
            });
        }
        if self.address.checked_add(self.size).is_none() {
            return Err(ContractViolation::InvalidValue {
                field: "flash_block.address",
                reason: "block must not wrap the address space",
            });
        }
        Ok(())
    }
}

/// Ordered block list plus the checksum recorded at assembly time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlashImage {
    pub profile_id: ProfileId,
    pub blocks: Vec<FlashBlock>,
    pub checksum: String,
}

impl FlashImage {
    pub fn total_bytes(&self) -> u64 {
        self.blocks.iter().map(|b| u64::from(b.size)).sum()
    }
}

impl Validate for FlashImage {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.profile_id.validate()?;
        if self.blocks.is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "flash_image.blocks",
                reason: "must not be empty",
            });
        }
        let mut prev_end: Option<u64> = None;
        for block in &self.blocks {
            block.validate()?;
            let start = u64::from(block.address);
            if prev_end.is_some_and(|end| start < end) {
                return Err(ContractViolation::InvalidValue {
                    field: "flash_image.blocks",
                    reason: "blocks must be address-ordered and non-overlapping",
                });
            }
            prev_end = Some(start + u64::from(block.size));
        }
        if self.checksum.len() != 64 || !self.checksum.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ContractViolation::InvalidValue {
                field: "flash_image.checksum",
                reason: "must be 64 hex chars",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlashJob {
    pub schema_version: SchemaVersion,
    pub id: FlashJobId,
    pub engine_id: EngineId,
    pub source_session_id: Option<ApplySessionId>,
    pub profile_id: ProfileId,
    pub changeset_id: Option<ChangesetId>,
    pub state: FlashState,
    pub progress: u8,
    pub checksum_ok: bool,
    pub validation_ok: bool,
    pub failure_reason: Option<String>,
    pub created_at: MonotonicTimeNs,
    pub updated_at: MonotonicTimeNs,
}

impl FlashJob {
    #[allow(clippy::too_many_arguments)]
    pub fn v1(
        id: FlashJobId,
        engine_id: EngineId,
        source_session_id: Option<ApplySessionId>,
        profile_id: ProfileId,
        changeset_id: Option<ChangesetId>,
        checksum_ok: bool,
        validation_ok: bool,
        created_at: MonotonicTimeNs,
    ) -> Result<Self, ContractViolation> {
        let j = Self {
            schema_version: FLASH_CONTRACT_VERSION,
            id,
            engine_id,
            source_session_id,
            profile_id,
            changeset_id,
            state: FlashState::Prepared,
            progress: 0,
            checksum_ok,
            validation_ok,
            failure_reason: None,
            created_at,
            updated_at: created_at,
        };
        j.validate()?;
        Ok(j)
    }
}

impl Validate for FlashJob {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != FLASH_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "flash_job.schema_version",
                reason: "must match FLASH_CONTRACT_VERSION",
            });
        }
        self.id.validate()?;
        self.engine_id.validate()?;
        self.profile_id.validate()?;
        if self.progress > 100 {
            return Err(ContractViolation::InvalidRange {
                field: "flash_job.progress",
                min: 0.0,
                max: 100.0,
                got: f64::from(self.progress),
            });
        }
        if matches!(
            self.state,
            FlashState::Flashing | FlashState::Verifying | FlashState::Completed
        ) && !(self.checksum_ok && self.validation_ok)
        {
            return Err(ContractViolation::InvalidValue {
                field: "flash_job.state",
                reason: "writing states require checksum_ok and validation_ok",
            });
        }
        Ok(())
    }
}
