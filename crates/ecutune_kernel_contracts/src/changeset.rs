#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::calibration::{MapId, ProfileId};
use crate::common::{numeric_id, validate_finite, validate_text};
use crate::{ContractViolation, MonotonicTimeNs, SchemaVersion, Validate};

pub const CHANGESET_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

numeric_id!(ChangesetId, "changeset_id");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapChange {
    pub map_id: MapId,
    pub row: Option<usize>,
    pub col: Option<usize>,
    pub old_value: f64,
    pub new_value: f64,
    pub reason: String,
}

impl MapChange {
    pub fn v1(
        map_id: MapId,
        row: Option<usize>,
        col: Option<usize>,
        old_value: f64,
        new_value: f64,
        reason: impl Into<String>,
    ) -> Result<Self, ContractViolation> {
        let c = Self {
            map_id,
            row,
            col,
            old_value,
            new_value,
            reason: reason.into(),
        };
        c.validate()?;
        Ok(c)
    }

    pub fn delta(&self) -> f64 {
        self.new_value - self.old_value
    }
}

impl Validate for MapChange {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.map_id.validate()?;
        validate_finite("map_change.old_value", self.old_value)?;
        validate_finite("map_change.new_value", self.new_value)?;
        validate_text("map_change.reason", &self.reason, 512)?;
        Ok(())
    }
}

/// Ordered, immutable list of proposed cell edits. Registries hand these out behind
/// `Arc` so nothing downstream can mutate a changeset after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Changeset {
    pub schema_version: SchemaVersion,
    pub id: ChangesetId,
    pub profile_id: Option<ProfileId>,
    pub changes: Vec<MapChange>,
    pub author: String,
    pub notes: String,
    pub created_at: MonotonicTimeNs,
}

impl Changeset {
    pub fn v1(
        id: ChangesetId,
        profile_id: Option<ProfileId>,
        changes: Vec<MapChange>,
        author: impl Into<String>,
        notes: impl Into<String>,
        created_at: MonotonicTimeNs,
    ) -> Result<Self, ContractViolation> {
        let c = Self {
            schema_version: CHANGESET_CONTRACT_VERSION,
            id,
            profile_id,
            changes,
            author: author.into(),
            notes: notes.into(),
            created_at,
        };
        c.validate()?;
        Ok(c)
    }

    pub fn touched_maps(&self) -> Vec<&MapId> {
        let mut out: Vec<&MapId> = Vec::new();
        for change in &self.changes {
            if !out.contains(&&change.map_id) {
                out.push(&change.map_id);
            }
        }
        out
    }
}

impl Validate for Changeset {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != CHANGESET_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "changeset.schema_version",
                reason: "must match CHANGESET_CONTRACT_VERSION",
            });
        }
        self.id.validate()?;
        if let Some(p) = &self.profile_id {
            p.validate()?;
        }
        if self.author.trim().is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "changeset.author",
                reason: "must not be empty",
            });
        }
        validate_text("changeset.author", &self.author, 128)?;
        validate_text("changeset.notes", &self.notes, 4096)?;
        if self.changes.len() > 4096 {
            return Err(ContractViolation::InvalidValue {
                field: "changeset.changes",
                reason: "must be <= 4096 entries",
            });
        }
        for change in &self.changes {
            change.validate()?;
        }
        if self.created_at.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "changeset.created_at",
                reason: "must be > 0",
            });
        }
        Ok(())
    }
}
