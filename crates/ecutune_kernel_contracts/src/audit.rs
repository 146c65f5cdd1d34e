#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::capability::EngineId;
use crate::common::{numeric_id, validate_text};
use crate::flash::FlashJobId;
use crate::session::ApplySessionId;
use crate::{ContractViolation, MonotonicTimeNs, Validate};

numeric_id!(AuditEntryId, "audit_entry_id");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    LiveApply,
    LiveRevert,
    AutoRevert,
    AutoRevertFailed,
    SessionExpired,
    FlashExecute,
    FlashAbort,
    SystemDisarm,
}

impl AuditAction {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditAction::LiveApply => "LIVE_APPLY",
            AuditAction::LiveRevert => "LIVE_REVERT",
            AuditAction::AutoRevert => "AUTO_REVERT",
            AuditAction::AutoRevertFailed => "AUTO_REVERT_FAILED",
            AuditAction::SessionExpired => "SESSION_EXPIRED",
            AuditAction::FlashExecute => "FLASH_EXECUTE",
            AuditAction::FlashAbort => "FLASH_ABORT",
            AuditAction::SystemDisarm => "SYSTEM_DISARM",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntryInput {
    pub at: MonotonicTimeNs,
    pub action: AuditAction,
    pub engine_id: Option<EngineId>,
    pub session_id: Option<ApplySessionId>,
    pub flash_job_id: Option<FlashJobId>,
    pub technician_id: Option<String>,
    pub job_id: Option<String>,
    /// Human-readable attribution line.
    pub summary: String,
}

impl Validate for AuditEntryInput {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.at.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "audit_entry.at",
                reason: "must be > 0",
            });
        }
        if self.summary.trim().is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "audit_entry.summary",
                reason: "must not be empty",
            });
        }
        validate_text("audit_entry.summary", &self.summary, 1024)?;
        if let Some(t) = &self.technician_id {
            validate_text("audit_entry.technician_id", t, 128)?;
        }
        if let Some(j) = &self.job_id {
            validate_text("audit_entry.job_id", j, 128)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: AuditEntryId,
    pub input: AuditEntryInput,
}
