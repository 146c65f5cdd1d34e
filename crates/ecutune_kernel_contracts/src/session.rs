#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::capability::EngineId;
use crate::changeset::ChangesetId;
use crate::common::{numeric_id, string_id};
use crate::{ContractViolation, MonotonicTimeNs, SchemaVersion, Validate};

pub const APPLY_SESSION_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

numeric_id!(ApplySessionId, "apply_session_id");
string_id!(VehicleSessionId, "vehicle_session_id", 128);

/// Safety level and session mode share one ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApplyMode {
    Simulate,
    LiveApply,
    Flash,
}

impl ApplyMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ApplyMode::Simulate => "SIMULATE",
            ApplyMode::LiveApply => "LIVE_APPLY",
            ApplyMode::Flash => "FLASH",
        }
    }

    pub fn policy(self) -> SafetyPolicy {
        match self {
            ApplyMode::Simulate => SafetyPolicy {
                allows_write: false,
                requires_arming: false,
                timeout_minutes: None,
            },
            ApplyMode::LiveApply => SafetyPolicy {
                allows_write: true,
                requires_arming: true,
                timeout_minutes: Some(10),
            },
            // Flash duration is bounded by job progress, not a wall-clock timeout.
            ApplyMode::Flash => SafetyPolicy {
                allows_write: true,
                requires_arming: true,
                timeout_minutes: None,
            },
        }
    }
}

impl std::str::FromStr for ApplyMode {
    type Err = ContractViolation;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "SIMULATE" => Ok(ApplyMode::Simulate),
            "LIVE_APPLY" | "LIVE" => Ok(ApplyMode::LiveApply),
            "FLASH" => Ok(ApplyMode::Flash),
            _ => Err(ContractViolation::InvalidValue {
                field: "apply_mode",
                reason: "must be one of SIMULATE, LIVE_APPLY, FLASH",
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyPolicy {
    pub allows_write: bool,
    pub requires_arming: bool,
    pub timeout_minutes: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApplyStatus {
    Pending,
    Armed,
    Active,
    Completed,
    Reverted,
    Failed,
}

impl ApplyStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ApplyStatus::Pending => "PENDING",
            ApplyStatus::Armed => "ARMED",
            ApplyStatus::Active => "ACTIVE",
            ApplyStatus::Completed => "COMPLETED",
            ApplyStatus::Reverted => "REVERTED",
            ApplyStatus::Failed => "FAILED",
        }
    }

    /// Sessions that count toward the concurrency limit.
    pub fn occupies_slot(self) -> bool {
        matches!(self, ApplyStatus::Active | ApplyStatus::Completed)
    }

    pub fn is_terminal(self, mode: ApplyMode) -> bool {
        match self {
            ApplyStatus::Reverted | ApplyStatus::Failed => true,
            // Completed live changes can still be reverted.
            ApplyStatus::Completed => mode != ApplyMode::LiveApply,
            _ => false,
        }
    }
}

pub fn is_allowed_status_transition(mode: ApplyMode, from: ApplyStatus, to: ApplyStatus) -> bool {
    match (from, to) {
        (ApplyStatus::Pending, ApplyStatus::Armed)
        | (ApplyStatus::Armed, ApplyStatus::Active)
        | (ApplyStatus::Active, ApplyStatus::Completed)
        | (ApplyStatus::Active, ApplyStatus::Failed)
        | (ApplyStatus::Pending, ApplyStatus::Failed)
        | (ApplyStatus::Armed, ApplyStatus::Failed) => true,
        (ApplyStatus::Active, ApplyStatus::Reverted)
        | (ApplyStatus::Completed, ApplyStatus::Reverted) => mode == ApplyMode::LiveApply,
        _ => false,
    }
}

/// Single-use arming secret minted at session creation.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyToken(String);

impl ApplyToken {
    pub fn new(token: impl Into<String>) -> Result<Self, ContractViolation> {
        let t = Self(token.into());
        t.validate()?;
        Ok(t)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Length-independent comparison so a mismatch position is not observable.
    pub fn matches(&self, candidate: &str) -> bool {
        let a = self.0.as_bytes();
        let b = candidate.as_bytes();
        let mut diff = a.len() ^ b.len();
        for i in 0..a.len().max(b.len()) {
            let x = a.get(i).copied().unwrap_or(0);
            let y = b.get(i).copied().unwrap_or(0);
            diff |= usize::from(x ^ y);
        }
        diff == 0
    }
}

impl fmt::Debug for ApplyToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApplyToken(<redacted>)")
    }
}

impl Validate for ApplyToken {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.0.len() < 16 || self.0.len() > 128 {
            return Err(ContractViolation::InvalidValue {
                field: "apply_token",
                reason: "must be 16..=128 chars",
            });
        }
        if !self
            .0
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ContractViolation::InvalidValue {
                field: "apply_token",
                reason: "must be url-safe ascii",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplySession {
    pub schema_version: SchemaVersion,
    pub id: ApplySessionId,
    pub engine_id: EngineId,
    pub vehicle_session_id: VehicleSessionId,
    pub changeset_id: Option<ChangesetId>,
    pub mode: ApplyMode,
    pub status: ApplyStatus,
    pub armed: bool,
    /// Cleared once consumed by a successful arm.
    pub apply_token: Option<ApplyToken>,
    pub engine_session_ref: String,
    pub created_at: MonotonicTimeNs,
    pub updated_at: MonotonicTimeNs,
    pub expires_at: Option<MonotonicTimeNs>,
    pub failure_reason: Option<String>,
}

impl ApplySession {
    #[allow(clippy::too_many_arguments)]
    pub fn v1(
        id: ApplySessionId,
        engine_id: EngineId,
        vehicle_session_id: VehicleSessionId,
        changeset_id: Option<ChangesetId>,
        mode: ApplyMode,
        apply_token: ApplyToken,
        engine_session_ref: String,
        created_at: MonotonicTimeNs,
        expires_at: Option<MonotonicTimeNs>,
    ) -> Result<Self, ContractViolation> {
        let s = Self {
            schema_version: APPLY_SESSION_CONTRACT_VERSION,
            id,
            engine_id,
            vehicle_session_id,
            changeset_id,
            mode,
            status: ApplyStatus::Pending,
            armed: false,
            apply_token: Some(apply_token),
            engine_session_ref,
            created_at,
            updated_at: created_at,
            expires_at,
            failure_reason: None,
        };
        s.validate()?;
        Ok(s)
    }

    pub fn is_expired_at(&self, now: MonotonicTimeNs) -> bool {
        self.expires_at.is_some_and(|exp| now >= exp)
    }
}

impl Validate for ApplySession {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != APPLY_SESSION_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "apply_session.schema_version",
                reason: "must match APPLY_SESSION_CONTRACT_VERSION",
            });
        }
        self.id.validate()?;
        self.engine_id.validate()?;
        self.vehicle_session_id.validate()?;
        if let Some(c) = self.changeset_id {
            c.validate()?;
        }
        if let Some(t) = &self.apply_token {
            t.validate()?;
        }
        if self.engine_session_ref.trim().is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "apply_session.engine_session_ref",
                reason: "must not be empty",
            });
        }
        if self.created_at.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "apply_session.created_at",
                reason: "must be > 0",
            });
        }
        if let Some(exp) = self.expires_at {
            if exp <= self.created_at {
                return Err(ContractViolation::InvalidValue {
                    field: "apply_session.expires_at",
                    reason: "must be after created_at",
                });
            }
        }
        if self.armed && matches!(self.status, ApplyStatus::Pending) {
            return Err(ContractViolation::InvalidValue {
                field: "apply_session.armed",
                reason: "pending sessions are never armed",
            });
        }
        Ok(())
    }
}
