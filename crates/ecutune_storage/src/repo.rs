#![forbid(unsafe_code)]

use std::sync::Arc;

use ecutune_kernel_contracts::audit::{AuditEntry, AuditEntryId, AuditEntryInput};
use ecutune_kernel_contracts::calibration::{CalibrationMap, MapId, Profile, ProfileId};
use ecutune_kernel_contracts::changeset::{Changeset, ChangesetId, MapChange};
use ecutune_kernel_contracts::flash::{FlashJob, FlashJobId};
use ecutune_kernel_contracts::session::{ApplySession, ApplySessionId};
use ecutune_kernel_contracts::MonotonicTimeNs;

use crate::ecu_store::{EcuStore, StorageError};

/// Typed repository interface for calibration profiles and their maps.
pub trait ProfileRepo {
    fn insert_profile_row(&mut self, profile: Profile) -> Result<(), StorageError>;
    fn replace_profile_row(&mut self, profile: Profile) -> Result<(), StorageError>;
    fn profile_row(&self, profile_id: &ProfileId) -> Option<&Profile>;
    fn profile_rows(&self) -> Vec<&Profile>;
    fn delete_profile_row(&mut self, profile_id: &ProfileId) -> Result<Profile, StorageError>;
    fn map_row(&self, profile_id: &ProfileId, map_id: &MapId) -> Option<&CalibrationMap>;
    fn update_map_cell_row(
        &mut self,
        profile_id: &ProfileId,
        map_id: &MapId,
        row: Option<usize>,
        col: Option<usize>,
        value: f64,
    ) -> Result<CalibrationMap, StorageError>;
}

pub trait ChangesetRepo {
    fn insert_changeset_row(
        &mut self,
        profile_id: Option<ProfileId>,
        changes: Vec<MapChange>,
        author: String,
        notes: String,
        created_at: MonotonicTimeNs,
    ) -> Result<Arc<Changeset>, StorageError>;
    fn changeset_row(&self, changeset_id: ChangesetId) -> Option<Arc<Changeset>>;
    fn changeset_rows(&self) -> Vec<Arc<Changeset>>;
    fn changeset_rows_for_profile(&self, profile_id: &ProfileId) -> Vec<Arc<Changeset>>;
}

/// Terminal sessions and flash jobs. Rows are written once.
pub trait ArchiveRepo {
    fn archive_session_row(&mut self, session: ApplySession) -> Result<(), StorageError>;
    fn archived_session_row(&self, session_id: ApplySessionId) -> Option<&ApplySession>;
    fn archived_session_rows(&self) -> Vec<&ApplySession>;
    fn archive_flash_job_row(&mut self, job: FlashJob) -> Result<(), StorageError>;
    fn archived_flash_job_row(&self, job_id: FlashJobId) -> Option<&FlashJob>;
    fn archived_flash_job_rows(&self) -> Vec<&FlashJob>;
}

pub trait AuditRepo {
    fn append_audit_row(&mut self, input: AuditEntryInput) -> Result<AuditEntryId, StorageError>;
    fn audit_rows(&self) -> &[AuditEntry];
    fn audit_rows_by_session(&self, session_id: ApplySessionId) -> Vec<&AuditEntry>;
}

impl ProfileRepo for EcuStore {
    fn insert_profile_row(&mut self, profile: Profile) -> Result<(), StorageError> {
        self.insert_profile(profile)
    }

    fn replace_profile_row(&mut self, profile: Profile) -> Result<(), StorageError> {
        self.replace_profile(profile)
    }

    fn profile_row(&self, profile_id: &ProfileId) -> Option<&Profile> {
        self.profile(profile_id)
    }

    fn profile_rows(&self) -> Vec<&Profile> {
        self.profiles()
    }

    fn delete_profile_row(&mut self, profile_id: &ProfileId) -> Result<Profile, StorageError> {
        self.delete_profile(profile_id)
    }

    fn map_row(&self, profile_id: &ProfileId, map_id: &MapId) -> Option<&CalibrationMap> {
        self.map(profile_id, map_id)
    }

    fn update_map_cell_row(
        &mut self,
        profile_id: &ProfileId,
        map_id: &MapId,
        row: Option<usize>,
        col: Option<usize>,
        value: f64,
    ) -> Result<CalibrationMap, StorageError> {
        self.update_map_cell(profile_id, map_id, row, col, value)
    }
}

impl ChangesetRepo for EcuStore {
    fn insert_changeset_row(
        &mut self,
        profile_id: Option<ProfileId>,
        changes: Vec<MapChange>,
        author: String,
        notes: String,
        created_at: MonotonicTimeNs,
    ) -> Result<Arc<Changeset>, StorageError> {
        self.insert_changeset(profile_id, changes, author, notes, created_at)
    }

    fn changeset_row(&self, changeset_id: ChangesetId) -> Option<Arc<Changeset>> {
        self.changeset(changeset_id)
    }

    fn changeset_rows(&self) -> Vec<Arc<Changeset>> {
        self.changesets()
    }

    fn changeset_rows_for_profile(&self, profile_id: &ProfileId) -> Vec<Arc<Changeset>> {
        self.changesets_for_profile(profile_id)
    }
}

impl ArchiveRepo for EcuStore {
    fn archive_session_row(&mut self, session: ApplySession) -> Result<(), StorageError> {
        self.archive_session(session)
    }

    fn archived_session_row(&self, session_id: ApplySessionId) -> Option<&ApplySession> {
        self.archived_session(session_id)
    }

    fn archived_session_rows(&self) -> Vec<&ApplySession> {
        self.archived_sessions()
    }

    fn archive_flash_job_row(&mut self, job: FlashJob) -> Result<(), StorageError> {
        self.archive_flash_job(job)
    }

    fn archived_flash_job_row(&self, job_id: FlashJobId) -> Option<&FlashJob> {
        self.archived_flash_job(job_id)
    }

    fn archived_flash_job_rows(&self) -> Vec<&FlashJob> {
        self.archived_flash_jobs()
    }
}

impl AuditRepo for EcuStore {
    fn append_audit_row(&mut self, input: AuditEntryInput) -> Result<AuditEntryId, StorageError> {
        self.append_audit(input)
    }

    fn audit_rows(&self) -> &[AuditEntry] {
        self.audit_entries()
    }

    fn audit_rows_by_session(&self, session_id: ApplySessionId) -> Vec<&AuditEntry> {
        self.audit_entries()
            .iter()
            .filter(|e| e.input.session_id == Some(session_id))
            .collect()
    }
}
