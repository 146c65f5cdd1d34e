#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use ecutune_kernel_contracts::audit::{AuditEntry, AuditEntryId, AuditEntryInput};
use ecutune_kernel_contracts::calibration::{CalibrationMap, MapId, Profile, ProfileId};
use ecutune_kernel_contracts::changeset::{Changeset, ChangesetId, MapChange};
use ecutune_kernel_contracts::flash::{FlashJob, FlashJobId};
use ecutune_kernel_contracts::session::{ApplySession, ApplySessionId};
use ecutune_kernel_contracts::{ContractViolation, MonotonicTimeNs, Validate};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StorageError {
    #[error("{table}: no row for key {key}")]
    NotFound { table: &'static str, key: String },
    #[error("{table}: duplicate key {key}")]
    DuplicateKey { table: &'static str, key: String },
    #[error("{table}: referenced key {key} does not exist")]
    ForeignKeyViolation { table: &'static str, key: String },
    #[error("{table}: rows are append-only")]
    AppendOnlyViolation { table: &'static str },
    #[error("value {value} outside [{min}, {max}]")]
    OutOfBounds { value: f64, min: f64, max: f64 },
    #[error(transparent)]
    ContractViolation(#[from] ContractViolation),
}

/// In-memory calibration store. Profiles are the only mutable rows; changesets,
/// archived sessions and jobs, and audit entries are append-only.
#[derive(Debug, Clone, Default)]
pub struct EcuStore {
    profiles: BTreeMap<ProfileId, Profile>,
    changesets: BTreeMap<ChangesetId, Arc<Changeset>>,
    next_changeset_id: u64,
    archived_sessions: BTreeMap<ApplySessionId, ApplySession>,
    archived_flash_jobs: BTreeMap<FlashJobId, FlashJob>,
    audit: Vec<AuditEntry>,
}

impl EcuStore {
    pub fn new_in_memory() -> Self {
        Self {
            next_changeset_id: 1,
            ..Self::default()
        }
    }

    pub fn insert_profile(&mut self, profile: Profile) -> Result<(), StorageError> {
        profile.validate()?;
        if self.profiles.contains_key(&profile.id) {
            return Err(StorageError::DuplicateKey {
                table: "profiles",
                key: profile.id.to_string(),
            });
        }
        self.profiles.insert(profile.id.clone(), profile);
        Ok(())
    }

    /// Replaces an existing profile wholesale.
    pub fn replace_profile(&mut self, profile: Profile) -> Result<(), StorageError> {
        profile.validate()?;
        let slot = self
            .profiles
            .get_mut(&profile.id)
            .ok_or_else(|| StorageError::NotFound {
                table: "profiles",
                key: profile.id.to_string(),
            })?;
        *slot = profile;
        Ok(())
    }

    pub fn profile(&self, profile_id: &ProfileId) -> Option<&Profile> {
        self.profiles.get(profile_id)
    }

    pub fn profiles(&self) -> Vec<&Profile> {
        self.profiles.values().collect()
    }

    pub fn delete_profile(&mut self, profile_id: &ProfileId) -> Result<Profile, StorageError> {
        if self
            .changesets
            .values()
            .any(|c| c.profile_id.as_ref() == Some(profile_id))
        {
            return Err(StorageError::ForeignKeyViolation {
                table: "changesets.profile_id",
                key: profile_id.to_string(),
            });
        }
        self.profiles
            .remove(profile_id)
            .ok_or_else(|| StorageError::NotFound {
                table: "profiles",
                key: profile_id.to_string(),
            })
    }

    pub fn map(&self, profile_id: &ProfileId, map_id: &MapId) -> Option<&CalibrationMap> {
        self.profiles.get(profile_id)?.map(map_id)
    }

    /// Writes one cell after checking it against the map's declared bounds.
    pub fn update_map_cell(
        &mut self,
        profile_id: &ProfileId,
        map_id: &MapId,
        row: Option<usize>,
        col: Option<usize>,
        value: f64,
    ) -> Result<CalibrationMap, StorageError> {
        let profile = self
            .profiles
            .get_mut(profile_id)
            .ok_or_else(|| StorageError::NotFound {
                table: "profiles",
                key: profile_id.to_string(),
            })?;
        let map = profile
            .map_mut(map_id)
            .ok_or_else(|| StorageError::NotFound {
                table: "profiles.maps",
                key: map_id.to_string(),
            })?;
        if !map.admits(value) {
            return Err(StorageError::OutOfBounds {
                value,
                min: map.min_value.unwrap_or(f64::NEG_INFINITY),
                max: map.max_value.unwrap_or(f64::INFINITY),
            });
        }
        map.set_cell(row, col, value)?;
        Ok(map.clone())
    }

    /// Assigns the next changeset id. Every change must name a map of the profile
    /// when one is given.
    pub fn insert_changeset(
        &mut self,
        profile_id: Option<ProfileId>,
        changes: Vec<MapChange>,
        author: String,
        notes: String,
        created_at: MonotonicTimeNs,
    ) -> Result<Arc<Changeset>, StorageError> {
        if let Some(pid) = &profile_id {
            let profile = self
                .profiles
                .get(pid)
                .ok_or_else(|| StorageError::ForeignKeyViolation {
                    table: "changesets.profile_id",
                    key: pid.to_string(),
                })?;
            if let Some(missing) = changes.iter().find(|c| profile.map(&c.map_id).is_none()) {
                return Err(StorageError::ForeignKeyViolation {
                    table: "changesets.changes.map_id",
                    key: missing.map_id.to_string(),
                });
            }
        }
        let id = ChangesetId(self.next_changeset_id);
        let changeset = Arc::new(Changeset::v1(
            id, profile_id, changes, author, notes, created_at,
        )?);
        self.next_changeset_id += 1;
        self.changesets.insert(id, changeset.clone());
        Ok(changeset)
    }

    pub fn changeset(&self, changeset_id: ChangesetId) -> Option<Arc<Changeset>> {
        self.changesets.get(&changeset_id).cloned()
    }

    pub fn changesets(&self) -> Vec<Arc<Changeset>> {
        self.changesets.values().cloned().collect()
    }

    pub fn changesets_for_profile(&self, profile_id: &ProfileId) -> Vec<Arc<Changeset>> {
        self.changesets
            .values()
            .filter(|c| c.profile_id.as_ref() == Some(profile_id))
            .cloned()
            .collect()
    }

    pub fn archive_session(&mut self, session: ApplySession) -> Result<(), StorageError> {
        session.validate()?;
        if !session.status.is_terminal(session.mode) {
            return Err(StorageError::ContractViolation(
                ContractViolation::InvalidValue {
                    field: "apply_session.status",
                    reason: "only terminal sessions are archived",
                },
            ));
        }
        if self.archived_sessions.contains_key(&session.id) {
            return Err(StorageError::AppendOnlyViolation {
                table: "archived_sessions",
            });
        }
        self.archived_sessions.insert(session.id, session);
        Ok(())
    }

    pub fn archived_session(&self, session_id: ApplySessionId) -> Option<&ApplySession> {
        self.archived_sessions.get(&session_id)
    }

    pub fn archived_sessions(&self) -> Vec<&ApplySession> {
        self.archived_sessions.values().collect()
    }

    pub fn archive_flash_job(&mut self, job: FlashJob) -> Result<(), StorageError> {
        job.validate()?;
        if !job.state.is_terminal() {
            return Err(StorageError::ContractViolation(
                ContractViolation::InvalidValue {
                    field: "flash_job.state",
                    reason: "only terminal jobs are archived",
                },
            ));
        }
        if self.archived_flash_jobs.contains_key(&job.id) {
            return Err(StorageError::AppendOnlyViolation {
                table: "archived_flash_jobs",
            });
        }
        self.archived_flash_jobs.insert(job.id, job);
        Ok(())
    }

    pub fn archived_flash_job(&self, job_id: FlashJobId) -> Option<&FlashJob> {
        self.archived_flash_jobs.get(&job_id)
    }

    pub fn archived_flash_jobs(&self) -> Vec<&FlashJob> {
        self.archived_flash_jobs.values().collect()
    }

    pub fn append_audit(&mut self, input: AuditEntryInput) -> Result<AuditEntryId, StorageError> {
        input.validate()?;
        let id = AuditEntryId(self.audit.len() as u64 + 1);
        self.audit.push(AuditEntry { id, input });
        Ok(id)
    }

    pub fn audit_entries(&self) -> &[AuditEntry] {
        &self.audit
    }
}
