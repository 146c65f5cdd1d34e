#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use ecutune_engines::book::apply_changeset;
use ecutune_engines::contract::{EngineError, TuningEngine};
use ecutune_engines::flash_image::{assemble_image, inspect_image, ImageInspection};
use ecutune_kernel_contracts::audit::{AuditAction, AuditEntryInput};
use ecutune_kernel_contracts::calibration::ProfileId;
use ecutune_kernel_contracts::changeset::ChangesetId;
use ecutune_kernel_contracts::flash::{
    is_allowed_flash_transition, FlashImage, FlashJob, FlashJobId, FlashState,
};
use ecutune_kernel_contracts::session::{ApplyMode, ApplySessionId, ApplyStatus};
use ecutune_storage::repo::ArchiveRepo;
use parking_lot::{Mutex, RwLock};
use tracing::{error, info, warn};

use crate::collaborators::WriteOperation;
use crate::error::{NotFoundKind, OrchestratorError};
use crate::events::OrchestratorEvent;
use crate::orchestrator::{attribution, expired_error, Orchestrator};
use crate::sessions::SessionRecord;

/// Progress reported once every block is written; verification owns the rest.
const WRITE_PROGRESS_CEILING: u32 = 90;

#[derive(Debug)]
pub struct FlashJobRecord {
    job: Mutex<FlashJob>,
    image: FlashImage,
    abort: AtomicBool,
}

impl FlashJobRecord {
    pub fn job(&self) -> FlashJob {
        self.job.lock().clone()
    }

    pub fn image(&self) -> &FlashImage {
        &self.image
    }

    fn abort_requested(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct FlashJobTable {
    rows: RwLock<BTreeMap<FlashJobId, Arc<FlashJobRecord>>>,
    next_id: AtomicU64,
}

impl FlashJobTable {
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> FlashJobId {
        FlashJobId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    pub fn insert(&self, job: FlashJob, image: FlashImage) -> Arc<FlashJobRecord> {
        let id = job.id;
        let record = Arc::new(FlashJobRecord {
            job: Mutex::new(job),
            image,
            abort: AtomicBool::new(false),
        });
        self.rows.write().insert(id, record.clone());
        record
    }

    pub fn get(&self, job_id: FlashJobId) -> Result<Arc<FlashJobRecord>, OrchestratorError> {
        self.rows
            .read()
            .get(&job_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::not_found(NotFoundKind::FlashJob, job_id))
    }

    pub fn snapshot(&self) -> Vec<FlashJob> {
        self.rows.read().values().map(|r| r.job()).collect()
    }
}

impl Default for FlashJobTable {
    fn default() -> Self {
        Self::new()
    }
}

/// How an executing job left the write loop.
enum WriteEnd {
    Written,
    Aborted,
}

impl Orchestrator {
    /// Builds an image from a stored profile with the changeset applied to a copy,
    /// validates it, and hands it to the engine. The job starts PREPARED.
    pub fn prepare_flash(
        &self,
        session_id: ApplySessionId,
        profile_id: &ProfileId,
        changeset_id: Option<ChangesetId>,
    ) -> Result<FlashJob, OrchestratorError> {
        let profile = self.get_profile(profile_id)?;
        let target = match changeset_id {
            Some(id) => apply_changeset(&profile, self.get_changeset(id)?.as_ref())?,
            None => profile,
        };
        let validation = self.validator.validate_profile(&target);
        let image = assemble_image(&target)?;
        self.register_flash_job(session_id, image, changeset_id, validation.valid)
    }

    /// Accepts an externally built image. The stored profile it names is validated.
    pub fn prepare_flash_from_image(
        &self,
        session_id: ApplySessionId,
        image: FlashImage,
        changeset_id: Option<ChangesetId>,
    ) -> Result<FlashJob, OrchestratorError> {
        let profile = self.get_profile(&image.profile_id)?;
        let validation_ok = self.validator.validate_profile(&profile).valid;
        self.register_flash_job(session_id, image, changeset_id, validation_ok)
    }

    fn register_flash_job(
        &self,
        session_id: ApplySessionId,
        image: FlashImage,
        changeset_id: Option<ChangesetId>,
        validation_ok: bool,
    ) -> Result<FlashJob, OrchestratorError> {
        let session = self.flash_session(session_id)?;
        let engine_id = session.lock().engine_id.clone();
        let engine = self.engines.get(&engine_id)?;

        let inspection = inspect_image(&image);
        let checksum_ok = inspection.checksum_ok && inspection.structure_ok;
        for issue in &inspection.issues {
            warn!(session_id = %session_id, issue = %issue, "flash image issue");
        }
        if inspection.structure_ok {
            engine.prepare_flash(&image)?;
        }

        let job = FlashJob::v1(
            self.flash_jobs.next_id(),
            engine_id.clone(),
            Some(session_id),
            image.profile_id.clone(),
            changeset_id,
            checksum_ok,
            validation_ok,
            self.clock.now(),
        )?;
        info!(
            job_id = %job.id,
            engine_id = %engine_id,
            blocks = image.blocks.len(),
            bytes = image.total_bytes(),
            checksum_ok,
            validation_ok,
            "flash job prepared"
        );
        let record = self.flash_jobs.insert(job, image);
        Ok(record.job())
    }

    /// Re-runs the checksum and layout checks on a prepared image without writing.
    pub fn validate_flash_image(&self, job_id: FlashJobId) -> Result<ImageInspection, OrchestratorError> {
        Ok(inspect_image(self.flash_jobs.get(job_id)?.image()))
    }

    pub fn get_flash_job(&self, job_id: FlashJobId) -> Result<FlashJob, OrchestratorError> {
        Ok(self.flash_jobs.get(job_id)?.job())
    }

    pub fn list_flash_jobs(&self) -> Vec<FlashJob> {
        self.flash_jobs.snapshot()
    }

    /// PREPARED through VALIDATING, FLASHING and VERIFYING to COMPLETED. An abort
    /// observed at a block boundary ends the job ABORTED and is not an error.
    pub fn execute_flash(
        &self,
        job_id: FlashJobId,
        technician_id: Option<&str>,
        job_ref: Option<&str>,
    ) -> Result<FlashJob, OrchestratorError> {
        let record = self.flash_jobs.get(job_id)?;
        let job = record.job();
        if job.state != FlashState::Prepared {
            return Err(OrchestratorError::invalid_state(format!(
                "flash job {job_id} is {}, not PREPARED",
                job.state.as_str()
            )));
        }
        let session_id = job
            .source_session_id
            .ok_or_else(|| OrchestratorError::invalid_state("flash job has no owning session"))?;
        let session = self.sessions.get(session_id)?;
        {
            let s = session.lock();
            if !s.armed {
                return Err(OrchestratorError::NotArmed {
                    reason: format!("session {session_id} is not armed"),
                });
            }
            if s.is_expired_at(self.clock.now()) {
                return Err(expired_error(&s));
            }
            if s.status != ApplyStatus::Armed {
                return Err(OrchestratorError::invalid_state(format!(
                    "session {session_id} is {}, not ARMED",
                    s.status.as_str()
                )));
            }
        }
        self.level.check_mode_allowed(ApplyMode::Flash)?;
        self.check_write(WriteOperation::Flash, technician_id)?;
        let engine = self.engines.get(&job.engine_id)?;

        if !self.advance_job(&record, FlashState::Validating)? {
            return self.finish_aborted(&record, &session);
        }
        if !job.checksum_ok {
            self.fail_job(&record, "image checksum does not match its contents");
            return Err(OrchestratorError::ChecksumMismatch { job_id });
        }
        if !job.validation_ok {
            self.fail_job(&record, "calibration failed validation");
            return Err(OrchestratorError::ValidationFailed {
                reason: format!("flash job {job_id} calibration has errors or safety violations"),
            });
        }

        let now = self.clock.now();
        let from = match self.sessions.activate_within_limit(
            session_id,
            self.config.max_concurrent_sessions,
            now,
        ) {
            Ok(from) => from,
            Err(err) => {
                self.fail_job(&record, format!("session not activated: {err}"));
                return Err(err);
            }
        };
        self.events.send(OrchestratorEvent::SessionStatusChanged {
            session_id,
            from,
            to: ApplyStatus::Active,
        });

        if !self.advance_job(&record, FlashState::Flashing)? {
            return self.finish_aborted(&record, &session);
        }
        match self.write_blocks(&record, engine.as_ref()) {
            Ok(WriteEnd::Written) => {}
            Ok(WriteEnd::Aborted) => return self.finish_aborted(&record, &session),
            Err(err) => {
                error!(job_id = %job_id, error = %err, "flash write failed");
                self.fail_job(&record, format!("block write failed: {err}"));
                self.fail_session(&session, format!("flash job {job_id} failed"));
                return Err(err.into());
            }
        }

        if !self.advance_job(&record, FlashState::Verifying)? {
            return self.finish_aborted(&record, &session);
        }
        let readback = match engine.read_back_checksum(record.image()) {
            Ok(sum) => sum,
            Err(err) => {
                self.fail_job(&record, format!("readback failed: {err}"));
                self.fail_session(&session, format!("flash job {job_id} failed"));
                return Err(err.into());
            }
        };
        if readback != record.image().checksum {
            self.fail_job(&record, "readback checksum differs from image");
            self.fail_session(&session, format!("flash job {job_id} failed verification"));
            return Err(OrchestratorError::VerificationFailed { session_id });
        }

        self.set_progress(&record, 100);
        if !self.advance_job(&record, FlashState::Completed)? {
            return self.finish_aborted(&record, &session);
        }
        if let Err(err) = self.complete_session(&session) {
            warn!(session_id = %session_id, error = %err, "flash session not completed");
        }
        let final_job = record.job();
        self.archive_job(&final_job);
        if let Ok(view) = self.get_session(session_id) {
            self.archive_session(&view);
        }
        info!(job_id = %job_id, bytes = record.image().total_bytes(), "flash completed");

        let technician = attribution(technician_id);
        let job_tag = attribution(job_ref);
        if technician.is_some() || job_tag.is_some() {
            self.append_audit(AuditEntryInput {
                at: self.clock.now(),
                action: AuditAction::FlashExecute,
                engine_id: Some(final_job.engine_id.clone()),
                session_id: Some(session_id),
                flash_job_id: Some(job_id),
                summary: format!(
                    "{} flashed profile {} via {}{}",
                    technician.as_deref().unwrap_or("unattributed operator"),
                    final_job.profile_id,
                    final_job.engine_id,
                    job_tag.as_deref().map(|j| format!(" for job {j}")).unwrap_or_default(),
                ),
                technician_id: technician,
                job_id: job_tag,
            });
        }
        Ok(final_job)
    }

    /// Moves any non-terminal job to ABORTED and asks the engine to halt at its next
    /// block boundary. Flash has no automatic revert.
    pub fn abort_flash(&self, job_id: FlashJobId) -> Result<FlashJob, OrchestratorError> {
        let record = self.flash_jobs.get(job_id)?;
        let (from, job) = {
            let mut job = record.job.lock();
            let from = job.state;
            if !is_allowed_flash_transition(from, FlashState::Aborted) {
                return Err(OrchestratorError::invalid_state(format!(
                    "flash job {job_id} is {} and cannot be aborted",
                    from.as_str()
                )));
            }
            job.state = FlashState::Aborted;
            job.updated_at = self.clock.now();
            job.failure_reason = Some("aborted by operator".to_string());
            record.abort.store(true, Ordering::SeqCst);
            (from, job.clone())
        };
        warn!(job_id = %job_id, from = from.as_str(), "flash abort requested");
        self.events.send(OrchestratorEvent::FlashStateChanged {
            job_id,
            from,
            to: FlashState::Aborted,
        });
        if let Ok(engine) = self.engines.get(&job.engine_id) {
            if let Err(err) = engine.abort_flash() {
                error!(job_id = %job_id, error = %err, "engine halt request failed");
            }
        }
        self.append_audit(AuditEntryInput {
            at: self.clock.now(),
            action: AuditAction::FlashAbort,
            engine_id: Some(job.engine_id.clone()),
            session_id: job.source_session_id,
            flash_job_id: Some(job_id),
            technician_id: None,
            job_id: None,
            summary: format!("flash job {job_id} aborted while {}", from.as_str()),
        });
        // The executor archives jobs it is running once it observes the abort.
        if from == FlashState::Prepared {
            self.archive_job(&job);
        }
        Ok(job)
    }

    fn flash_session(&self, session_id: ApplySessionId) -> Result<SessionRecord, OrchestratorError> {
        let session = self.sessions.get(session_id)?;
        let mode = session.lock().mode;
        if mode != ApplyMode::Flash {
            return Err(OrchestratorError::invalid_state(format!(
                "session {session_id} is {}, flash jobs need a FLASH session",
                mode.as_str()
            )));
        }
        Ok(session)
    }

    /// Ok(false) when the job was aborted concurrently.
    fn advance_job(&self, record: &FlashJobRecord, to: FlashState) -> Result<bool, OrchestratorError> {
        let (id, from) = {
            let mut job = record.job.lock();
            if job.state == FlashState::Aborted {
                return Ok(false);
            }
            let from = job.state;
            if !is_allowed_flash_transition(from, to) {
                return Err(OrchestratorError::invalid_state(format!(
                    "flash job {} cannot move from {} to {}",
                    job.id,
                    from.as_str(),
                    to.as_str()
                )));
            }
            job.state = to;
            job.updated_at = self.clock.now();
            (job.id, from)
        };
        info!(job_id = %id, from = from.as_str(), to = to.as_str(), "flash state changed");
        self.events
            .send(OrchestratorEvent::FlashStateChanged { job_id: id, from, to });
        Ok(true)
    }

    fn set_progress(&self, record: &FlashJobRecord, progress: u8) {
        let (id, next, changed) = {
            let mut job = record.job.lock();
            let next = progress.min(100).max(job.progress);
            let changed = next != job.progress;
            job.progress = next;
            (job.id, next, changed)
        };
        if changed {
            self.events.send(OrchestratorEvent::FlashProgress {
                job_id: id,
                progress: next,
            });
        }
    }

    fn write_blocks(
        &self,
        record: &FlashJobRecord,
        engine: &dyn TuningEngine,
    ) -> Result<WriteEnd, EngineError> {
        let total = record.image().blocks.len().max(1);
        for (index, block) in record.image().blocks.iter().enumerate() {
            if record.abort_requested() {
                return Ok(WriteEnd::Aborted);
            }
            match engine.write_flash_block(block) {
                Ok(()) => {}
                Err(EngineError::FlashHalted { .. }) => return Ok(WriteEnd::Aborted),
                Err(_) if record.abort_requested() => return Ok(WriteEnd::Aborted),
                Err(err) => return Err(err),
            }
            let done = u32::try_from(index + 1).unwrap_or(u32::MAX);
            let total = u32::try_from(total).unwrap_or(u32::MAX);
            let pct = (done.saturating_mul(WRITE_PROGRESS_CEILING) / total).min(WRITE_PROGRESS_CEILING);
            self.set_progress(record, u8::try_from(pct).unwrap_or(90));
        }
        Ok(WriteEnd::Written)
    }

    fn fail_job(&self, record: &FlashJobRecord, reason: impl Into<String>) {
        let reason = reason.into();
        let (from, job) = {
            let mut job = record.job.lock();
            let from = job.state;
            if !is_allowed_flash_transition(from, FlashState::Failed) {
                let aborted = (job.state == FlashState::Aborted).then(|| job.clone());
                drop(job);
                if let Some(aborted) = aborted {
                    self.archive_job(&aborted);
                }
                return;
            }
            job.state = FlashState::Failed;
            job.updated_at = self.clock.now();
            job.failure_reason = Some(reason.clone());
            (from, job.clone())
        };
        warn!(job_id = %job.id, from = from.as_str(), reason = %reason, "flash job failed");
        self.events.send(OrchestratorEvent::FlashStateChanged {
            job_id: job.id,
            from,
            to: FlashState::Failed,
        });
        self.archive_job(&job);
    }

    /// The abort already moved the job; close out the owning session.
    fn finish_aborted(
        &self,
        record: &FlashJobRecord,
        session: &SessionRecord,
    ) -> Result<FlashJob, OrchestratorError> {
        let job = record.job();
        info!(job_id = %job.id, progress = job.progress, "flash stopped after abort");
        let active = session.lock().status == ApplyStatus::Active;
        if active {
            self.fail_session(session, format!("flash job {} aborted", job.id));
        }
        self.archive_job(&job);
        Ok(job)
    }

    fn archive_job(&self, job: &FlashJob) {
        if let Err(err) = self.store.write().archive_flash_job_row(job.clone()) {
            warn!(job_id = %job.id, error = %err, "flash job not archived");
        }
    }
}
