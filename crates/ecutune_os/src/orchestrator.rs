#![forbid(unsafe_code)]

use std::sync::{Arc, Weak};
use std::time::Duration;

use ecutune_engines::contract::TuningEngine;
use ecutune_engines::simulation::{SimulationEngine, SimulationReport};
use ecutune_engines::validator::{diff_profiles, CalibrationValidator};
use ecutune_kernel_contracts::audit::{AuditAction, AuditEntry, AuditEntryInput};
use ecutune_kernel_contracts::calibration::{CalibrationMap, MapId, Profile, ProfileId};
use ecutune_kernel_contracts::capability::{EngineId, EngineStatus};
use ecutune_kernel_contracts::changeset::{Changeset, ChangesetId, MapChange};
use ecutune_kernel_contracts::flash::{FlashJob, FlashJobId};
use ecutune_kernel_contracts::safety::SafetySnapshot;
use ecutune_kernel_contracts::session::{
    ApplyMode, ApplySession, ApplySessionId, ApplyStatus, ApplyToken, VehicleSessionId,
};
use ecutune_kernel_contracts::validation::{
    DiffReport, IssueKind, ValidationIssue, ValidationResult,
};
use ecutune_kernel_contracts::MonotonicTimeNs;
use ecutune_storage::ecu_store::{EcuStore, StorageError};
use ecutune_storage::repo::{ArchiveRepo, AuditRepo, ChangesetRepo, ProfileRepo};
use parking_lot::RwLock;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::collaborators::{OperatorContext, OperatorMode, WriteOperation};
use crate::config::OrchestratorConfig;
use crate::error::{NotFoundKind, OrchestratorError};
use crate::events::{EventBus, OrchestratorEvent};
use crate::flash::FlashJobTable;
use crate::monitor::{MonitorTarget, SafetyMonitor};
use crate::registry::EngineRegistry;
use crate::safety_level::{SafetyLevelController, SafetyLevelState};
use crate::sessions::{mint_apply_token, redacted, transition, SessionRecord, SessionTable};

/// Result of `create_session`. The token is shown once and never stored in clear
/// anywhere a reader can reach.
#[derive(Debug, Clone)]
pub struct SessionTicket {
    pub session: ApplySession,
    pub apply_token: ApplyToken,
}

/// Long-lived, shared orchestration service. Construct with `Orchestrator::new`,
/// which returns it behind an `Arc` so monitor tasks can hold a weak handle.
pub struct Orchestrator {
    pub(crate) config: OrchestratorConfig,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) engines: EngineRegistry,
    pub(crate) level: SafetyLevelController,
    pub(crate) sessions: SessionTable,
    pub(crate) flash_jobs: FlashJobTable,
    pub(crate) store: RwLock<EcuStore>,
    pub(crate) operator: Arc<dyn OperatorContext>,
    pub(crate) events: EventBus,
    pub(crate) validator: CalibrationValidator,
    monitor: SafetyMonitor,
    runtime: Handle,
    self_ref: Weak<Orchestrator>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        clock: Arc<dyn Clock>,
        operator: Arc<dyn OperatorContext>,
        runtime: Handle,
    ) -> Arc<Self> {
        let events = EventBus::new(config.event_capacity);
        let monitor = SafetyMonitor::new(
            runtime.clone(),
            config.monitor_interval_ms,
            config.safety,
            events.clone(),
        );
        let orchestrator = Arc::new_cyclic(|self_ref| Self {
            validator: CalibrationValidator::new(config.validator),
            config,
            clock,
            engines: EngineRegistry::new(),
            level: SafetyLevelController::new(),
            sessions: SessionTable::new(),
            flash_jobs: FlashJobTable::new(),
            store: RwLock::new(EcuStore::new_in_memory()),
            operator,
            events,
            monitor,
            runtime,
            self_ref: self_ref.clone(),
        });
        if orchestrator.config.proactive_expiry {
            orchestrator.spawn_expiry_sweeper();
        }
        orchestrator
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.events.subscribe()
    }

    fn spawn_expiry_sweeper(&self) {
        let weak = self.self_ref.clone();
        let period = Duration::from_millis(self.config.monitor_interval_ms);
        self.runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let Some(orchestrator) = weak.upgrade() else {
                    break;
                };
                match tokio::task::spawn_blocking(move || orchestrator.expire_sessions()).await {
                    Ok(expired) if !expired.is_empty() => {
                        info!(count = expired.len(), "expiry sweep closed sessions");
                    }
                    Ok(_) => {}
                    Err(err) => error!(error = %err, "expiry sweep panicked"),
                }
            }
        });
    }

    // ---- engines -------------------------------------------------------------

    pub fn register_engine(&self, engine: Arc<dyn TuningEngine>) {
        self.engines.register(engine);
    }

    pub fn engines(&self) -> Vec<EngineId> {
        self.engines.list()
    }

    pub fn connect_engine(&self, engine_id: &EngineId) -> Result<EngineStatus, OrchestratorError> {
        Ok(self.engines.get(engine_id)?.connect()?)
    }

    pub fn engine_status(&self, engine_id: &EngineId) -> Result<EngineStatus, OrchestratorError> {
        Ok(self.engines.get(engine_id)?.status())
    }

    // ---- profiles, maps, changesets ------------------------------------------

    pub fn create_profile(&self, profile: Profile) -> Result<(), OrchestratorError> {
        let id = profile.id.clone();
        self.store.write().insert_profile_row(profile)?;
        debug!(profile_id = %id, "profile created");
        Ok(())
    }

    pub fn get_profile(&self, profile_id: &ProfileId) -> Result<Profile, OrchestratorError> {
        self.store
            .read()
            .profile_row(profile_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::not_found(NotFoundKind::Profile, profile_id))
    }

    pub fn list_profiles(&self) -> Vec<Profile> {
        self.store.read().profile_rows().into_iter().cloned().collect()
    }

    pub fn delete_profile(&self, profile_id: &ProfileId) -> Result<Profile, OrchestratorError> {
        self.store
            .write()
            .delete_profile_row(profile_id)
            .map_err(|err| match err {
                StorageError::NotFound { .. } => {
                    OrchestratorError::not_found(NotFoundKind::Profile, profile_id)
                }
                other => other.into(),
            })
    }

    pub fn get_map(
        &self,
        profile_id: &ProfileId,
        map_id: &MapId,
    ) -> Result<CalibrationMap, OrchestratorError> {
        self.get_profile(profile_id)?
            .map(map_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::not_found(NotFoundKind::Map, map_id))
    }

    pub fn list_maps(&self, profile_id: &ProfileId) -> Result<Vec<CalibrationMap>, OrchestratorError> {
        Ok(self.get_profile(profile_id)?.maps)
    }

    /// Bounds-checked single cell write to a stored profile.
    pub fn update_map_cell(
        &self,
        profile_id: &ProfileId,
        map_id: &MapId,
        row: Option<usize>,
        col: Option<usize>,
        value: f64,
    ) -> Result<CalibrationMap, OrchestratorError> {
        self.store
            .write()
            .update_map_cell_row(profile_id, map_id, row, col, value)
            .map_err(|err| match err {
                StorageError::NotFound { table: "profiles", .. } => {
                    OrchestratorError::not_found(NotFoundKind::Profile, profile_id)
                }
                StorageError::NotFound { .. } => {
                    OrchestratorError::not_found(NotFoundKind::Map, map_id)
                }
                other => other.into(),
            })
    }

    pub fn create_changeset(
        &self,
        profile_id: Option<ProfileId>,
        changes: Vec<MapChange>,
        author: &str,
        notes: &str,
    ) -> Result<Arc<Changeset>, OrchestratorError> {
        let now = self.clock.now();
        let changeset = self
            .store
            .write()
            .insert_changeset_row(profile_id, changes, author.to_string(), notes.to_string(), now)
            .map_err(|err| match err {
                StorageError::ForeignKeyViolation {
                    table: "changesets.profile_id",
                    key,
                } => OrchestratorError::not_found(NotFoundKind::Profile, key),
                StorageError::ForeignKeyViolation { key, .. } => {
                    OrchestratorError::not_found(NotFoundKind::Map, key)
                }
                other => other.into(),
            })?;
        info!(
            changeset_id = %changeset.id,
            changes = changeset.changes.len(),
            author = %changeset.author,
            "changeset created"
        );
        Ok(changeset)
    }

    pub fn get_changeset(&self, changeset_id: ChangesetId) -> Result<Arc<Changeset>, OrchestratorError> {
        self.store
            .read()
            .changeset_row(changeset_id)
            .ok_or_else(|| OrchestratorError::not_found(NotFoundKind::Changeset, changeset_id))
    }

    pub fn list_changesets(&self, profile_id: Option<&ProfileId>) -> Vec<Arc<Changeset>> {
        let store = self.store.read();
        match profile_id {
            Some(pid) => store.changeset_rows_for_profile(pid),
            None => store.changeset_rows(),
        }
    }

    // ---- analysis --------------------------------------------------------------

    pub fn diff(
        &self,
        source_profile: &ProfileId,
        target_profile: &ProfileId,
        map_ids: Option<&[MapId]>,
    ) -> Result<DiffReport, OrchestratorError> {
        let source = self.get_profile(source_profile)?;
        let target = self.get_profile(target_profile)?;
        Ok(diff_profiles(&source, &target, map_ids))
    }

    pub fn validate(&self, profile_id: &ProfileId) -> Result<ValidationResult, OrchestratorError> {
        let profile = self.get_profile(profile_id)?;
        Ok(self.validator.validate_profile(&profile))
    }

    pub fn simulate(
        &self,
        profile_id: &ProfileId,
        changeset_id: Option<ChangesetId>,
    ) -> Result<SimulationReport, OrchestratorError> {
        let profile = self.get_profile(profile_id)?;
        let changeset = changeset_id.map(|id| self.get_changeset(id)).transpose()?;
        Ok(SimulationEngine::new(self.validator.clone()).run(&profile, changeset.as_deref())?)
    }

    /// Engine validation plus caveats that depend on the current system level.
    pub fn validate_changes(
        &self,
        engine_id: &EngineId,
        changeset: &Changeset,
    ) -> Result<ValidationResult, OrchestratorError> {
        let engine = self.engines.get(engine_id)?;
        let mut result = engine.validate_changes(changeset)?;
        let level = self.level.level();
        if level == ApplyMode::Simulate {
            result = result.with_warning(ValidationIssue::general(
                IssueKind::ModeCaveat,
                "system is in SIMULATE; changes will not reach the vehicle",
            ));
        }
        let floor = match level {
            ApplyMode::Flash => 80,
            ApplyMode::LiveApply => 40,
            ApplyMode::Simulate => 0,
        };
        Ok(result.with_risk_floor(floor))
    }

    // ---- system level ----------------------------------------------------------

    pub fn safety_level(&self) -> SafetyLevelState {
        self.level.snapshot()
    }

    pub fn arm_system(&self) {
        if self.level.arm() {
            info!("system armed");
            self.events
                .send(OrchestratorEvent::SystemArmChanged { armed: true });
        }
    }

    pub fn set_level(&self, level: ApplyMode) -> Result<(), OrchestratorError> {
        let prev = self.level.set_level(level)?;
        if prev != level {
            self.events.send(OrchestratorEvent::SystemLevelChanged {
                from: prev,
                to: level,
            });
        }
        Ok(())
    }

    /// Drops the system to SIMULATE, reverts live changes still on the vehicle and
    /// fails sessions that were waiting to write. Returns the reverted sessions.
    pub fn disarm_system(&self, reason: &str) -> Vec<ApplySessionId> {
        let prev = self.level.disarm();
        warn!(reason, from = prev.as_str(), "system disarmed");
        self.events
            .send(OrchestratorEvent::SystemArmChanged { armed: false });
        if prev != ApplyMode::Simulate {
            self.events.send(OrchestratorEvent::SystemLevelChanged {
                from: prev,
                to: ApplyMode::Simulate,
            });
        }

        let mut reverted = Vec::new();
        for record in self.sessions.records() {
            let (id, mode, status) = {
                let s = record.lock();
                (s.id, s.mode, s.status)
            };
            if mode == ApplyMode::Simulate {
                continue;
            }
            match status {
                ApplyStatus::Active | ApplyStatus::Completed if mode == ApplyMode::LiveApply => {
                    match self.revert_record(&record, AuditAction::SystemDisarm) {
                        Ok(_) => reverted.push(id),
                        Err(err) => {
                            error!(session_id = %id, error = %err, "revert on disarm failed")
                        }
                    }
                }
                ApplyStatus::Pending | ApplyStatus::Armed => {
                    self.fail_session(&record, format!("system disarmed: {reason}"));
                }
                _ => {}
            }
        }

        self.append_audit(AuditEntryInput {
            at: self.clock.now(),
            action: AuditAction::SystemDisarm,
            engine_id: None,
            session_id: None,
            flash_job_id: None,
            technician_id: None,
            job_id: None,
            summary: format!(
                "system disarmed ({reason}); {} live session(s) reverted",
                reverted.len()
            ),
        });
        reverted
    }

    // ---- sessions --------------------------------------------------------------

    pub fn create_session(
        &self,
        engine_id: &EngineId,
        vehicle_session_id: VehicleSessionId,
        changeset_id: Option<ChangesetId>,
        mode: Option<ApplyMode>,
    ) -> Result<SessionTicket, OrchestratorError> {
        let engine = self.engines.get(engine_id)?;
        let mode = mode.unwrap_or_else(|| self.level.level());
        if !engine.capabilities().supports_mode(mode) {
            return Err(OrchestratorError::ModeNotSupportedByEngine {
                engine_id: engine_id.clone(),
                mode,
            });
        }
        self.level.check_mode_allowed(mode)?;
        if let Some(cid) = changeset_id {
            self.get_changeset(cid)?;
        }
        let max = self.config.max_concurrent_sessions;
        self.sessions.check_limit(max)?;

        let id = self.sessions.next_id();
        let engine_session_ref = if mode == ApplyMode::Simulate {
            format!("simulate-{id}")
        } else {
            engine.start_live_session(&vehicle_session_id, mode)?
        };
        let now = self.clock.now();
        let expires_at = mode
            .policy()
            .timeout_minutes
            .map(|_| now.saturating_add_ms(self.config.live_apply_timeout_ms()));
        let registered = mint_apply_token()
            .map_err(OrchestratorError::from)
            .and_then(|token| {
                let session = ApplySession::v1(
                    id,
                    engine_id.clone(),
                    vehicle_session_id,
                    changeset_id,
                    mode,
                    token.clone(),
                    engine_session_ref.clone(),
                    now,
                    expires_at,
                )?;
                let view = redacted(&session);
                self.sessions.insert_with_limit(session, max)?;
                Ok((view, token))
            });
        let (view, token) = match registered {
            Ok(registered) => registered,
            Err(err) => {
                if mode != ApplyMode::Simulate {
                    warn!(
                        session_id = %id,
                        engine_ref = %engine_session_ref,
                        error = %err,
                        "closing engine session after failed registration"
                    );
                    engine.close_live_session(&engine_session_ref);
                }
                return Err(err);
            }
        };

        info!(
            session_id = %id,
            engine_id = %engine_id,
            vehicle = %view.vehicle_session_id,
            mode = mode.as_str(),
            "apply session created"
        );
        self.events
            .send(OrchestratorEvent::SessionCreated { session_id: id, mode });
        Ok(SessionTicket {
            session: view,
            apply_token: token,
        })
    }

    /// Consumes the apply token and arms the session on the engine.
    pub fn arm_session(
        &self,
        session_id: ApplySessionId,
        token: &str,
    ) -> Result<ApplySession, OrchestratorError> {
        let record = self.sessions.get(session_id)?;
        let now = self.clock.now();
        let (engine, mode, engine_ref) = {
            let mut session = record.lock();
            if !session.apply_token.as_ref().is_some_and(|t| t.matches(token)) {
                warn!(session_id = %session_id, "apply token rejected");
                return Err(OrchestratorError::InvalidToken { session_id });
            }
            if session.status != ApplyStatus::Pending {
                return Err(OrchestratorError::invalid_state(format!(
                    "session {session_id} is {}, not PENDING",
                    session.status.as_str()
                )));
            }
            if session.is_expired_at(now) {
                return Err(expired_error(&session));
            }
            self.level.check_mode_allowed(session.mode)?;
            let engine = self.engines.get(&session.engine_id)?;
            session.apply_token = None;
            (engine, session.mode, session.engine_session_ref.clone())
        };

        if mode != ApplyMode::Simulate {
            if let Err(err) = engine.arm_session(&engine_ref) {
                self.fail_session(&record, format!("engine arm failed: {err}"));
                return Err(err.into());
            }
        }

        let view = {
            let mut session = record.lock();
            transition(&mut session, ApplyStatus::Armed, now)?;
            session.armed = true;
            redacted(&session)
        };
        info!(session_id = %session_id, mode = mode.as_str(), "apply session armed");
        self.events
            .send(OrchestratorEvent::SessionArmed { session_id });
        self.events.send(OrchestratorEvent::SessionStatusChanged {
            session_id,
            from: ApplyStatus::Pending,
            to: ApplyStatus::Armed,
        });
        Ok(view)
    }

    /// Writes the session's changeset. Preconditions fail without side effects; once
    /// the write starts, any failure leaves the session FAILED.
    pub fn apply_live(
        &self,
        session_id: ApplySessionId,
        technician_id: Option<&str>,
        job_id: Option<&str>,
    ) -> Result<ApplySession, OrchestratorError> {
        let record = self.sessions.get(session_id)?;
        let now = self.clock.now();
        let (engine_id, vehicle, mode, changeset_id, engine_ref) = {
            let session = record.lock();
            if !session.armed {
                return Err(OrchestratorError::NotArmed {
                    reason: format!("session {session_id} is not armed"),
                });
            }
            if session.is_expired_at(now) {
                return Err(expired_error(&session));
            }
            if session.mode == ApplyMode::Flash {
                return Err(OrchestratorError::invalid_state(
                    "flash sessions write through flash jobs",
                ));
            }
            if session.status != ApplyStatus::Armed {
                return Err(OrchestratorError::invalid_state(format!(
                    "session {session_id} is {}, not ARMED",
                    session.status.as_str()
                )));
            }
            (
                session.engine_id.clone(),
                session.vehicle_session_id.clone(),
                session.mode,
                session.changeset_id,
                session.engine_session_ref.clone(),
            )
        };
        self.level.check_mode_allowed(mode)?;
        self.check_write(WriteOperation::LiveApply, technician_id)?;
        let changeset_id = changeset_id
            .ok_or_else(|| OrchestratorError::invalid_state("session has no changeset"))?;
        let changeset = self.get_changeset(changeset_id)?;
        let engine = self.engines.get(&engine_id)?;

        let from = self
            .sessions
            .activate_within_limit(session_id, self.config.max_concurrent_sessions, now)?;
        self.events.send(OrchestratorEvent::SessionStatusChanged {
            session_id,
            from,
            to: ApplyStatus::Active,
        });

        if mode == ApplyMode::Simulate {
            return match engine.simulate(&changeset) {
                Ok(report) => {
                    debug!(session_id = %session_id, effects = report.effects.len(), "dry run finished");
                    let (view, _) = self.complete_session(&record)?;
                    self.archive_session(&view);
                    Ok(view)
                }
                Err(err) => {
                    self.fail_session(&record, format!("simulation failed: {err}"));
                    Err(err.into())
                }
            };
        }

        let telemetry = match engine.subscribe_telemetry(&vehicle) {
            Ok(rx) => rx,
            Err(err) => {
                self.fail_session(&record, format!("telemetry unavailable: {err}"));
                return Err(OrchestratorError::Telemetry {
                    reason: err.to_string(),
                });
            }
        };
        // Watch the vehicle before the first cell lands.
        self.monitor
            .start(session_id, vehicle.clone(), telemetry, self.monitor_target());

        let outcome = match engine.apply_live(&engine_ref, &changeset) {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(session_id = %session_id, error = %err, "live write failed");
                self.monitor.stop(session_id);
                self.fail_session(&record, format!("live write failed: {err}"));
                self.release_telemetry(&engine, &vehicle, session_id);
                return Err(err.into());
            }
        };

        if !outcome.verified && self.config.require_verification {
            if let Err(err) = engine.revert_live(&engine_ref) {
                error!(session_id = %session_id, error = %err, "revert of unverified write failed");
            }
            self.monitor.stop(session_id);
            self.fail_session(&record, "readback did not match written values");
            self.release_telemetry(&engine, &vehicle, session_id);
            return Err(OrchestratorError::VerificationFailed { session_id });
        }

        let (view, reverted_meanwhile) = self.complete_session(&record)?;
        if reverted_meanwhile {
            // A revert raced the write and ran first; undo what just landed.
            if let Err(err) = engine.revert_live(&engine_ref) {
                error!(session_id = %session_id, error = %err, "late revert after racing write failed");
            }
        }
        info!(
            session_id = %session_id,
            cells_written = outcome.cells_written,
            verified = outcome.verified,
            status = view.status.as_str(),
            "live apply finished"
        );

        let technician = attribution(technician_id);
        let job = attribution(job_id);
        if technician.is_some() || job.is_some() {
            self.append_audit(AuditEntryInput {
                at: self.clock.now(),
                action: AuditAction::LiveApply,
                engine_id: Some(engine_id.clone()),
                session_id: Some(session_id),
                flash_job_id: None,
                summary: format!(
                    "{} applied changeset {changeset_id} ({} cells) to vehicle {vehicle} via {engine_id}{}",
                    technician.as_deref().unwrap_or("unattributed operator"),
                    outcome.cells_written,
                    job.as_deref().map(|j| format!(" for job {j}")).unwrap_or_default(),
                ),
                technician_id: technician,
                job_id: job,
            });
        }
        Ok(view)
    }

    /// Restores the pre-apply values. Reverting a REVERTED session is a no-op.
    pub fn revert_live(&self, session_id: ApplySessionId) -> Result<ApplySession, OrchestratorError> {
        let record = self.sessions.get(session_id)?;
        let (mode, status) = {
            let s = record.lock();
            (s.mode, s.status)
        };
        if mode != ApplyMode::LiveApply {
            return Err(OrchestratorError::invalid_state(format!(
                "only LIVE_APPLY sessions revert; session {session_id} is {}",
                mode.as_str()
            )));
        }
        match status {
            ApplyStatus::Reverted => {
                let view = redacted(&record.lock());
                Ok(view)
            }
            ApplyStatus::Active | ApplyStatus::Completed => {
                let decision = self.operator.validate_write(WriteOperation::Revert);
                if !decision.allowed {
                    return Err(OrchestratorError::WriteRejected {
                        reason: decision.reason.unwrap_or_else(|| "denied".to_string()),
                    });
                }
                self.revert_record(&record, AuditAction::LiveRevert)
            }
            other => Err(OrchestratorError::invalid_state(format!(
                "session {session_id} is {} and has nothing to revert",
                other.as_str()
            ))),
        }
    }

    pub fn get_session(&self, session_id: ApplySessionId) -> Result<ApplySession, OrchestratorError> {
        let record = self.sessions.get(session_id)?;
        let view = redacted(&record.lock());
        Ok(view)
    }

    pub fn list_sessions(&self) -> Vec<ApplySession> {
        self.sessions.snapshot()
    }

    pub fn snapshots(&self, session_id: ApplySessionId) -> Vec<SafetySnapshot> {
        self.monitor.snapshots(session_id)
    }

    pub fn is_monitoring(&self, session_id: ApplySessionId) -> bool {
        self.monitor.is_running(session_id)
    }

    /// Closes every session past `expires_at`: waiting sessions fail, live changes
    /// still on the vehicle are reverted.
    pub fn expire_sessions(&self) -> Vec<ApplySessionId> {
        let now = self.clock.now();
        let mut expired = Vec::new();
        for record in self.sessions.records() {
            let (id, mode, status, expires_at, engine_id) = {
                let s = record.lock();
                (s.id, s.mode, s.status, s.expires_at, s.engine_id.clone())
            };
            let Some(expires_at) = expires_at else {
                continue;
            };
            if now < expires_at {
                continue;
            }
            match status {
                ApplyStatus::Pending | ApplyStatus::Armed => {
                    let reason = format!("session expired at {}", expires_at.0);
                    if self.fail_session(&record, reason.clone()).is_some() {
                        self.append_audit(AuditEntryInput {
                            at: now,
                            action: AuditAction::SessionExpired,
                            engine_id: Some(engine_id),
                            session_id: Some(id),
                            flash_job_id: None,
                            technician_id: None,
                            job_id: None,
                            summary: format!("session {id} {reason} before writing"),
                        });
                        expired.push(id);
                    }
                }
                ApplyStatus::Active | ApplyStatus::Completed if mode == ApplyMode::LiveApply => {
                    match self.revert_record(&record, AuditAction::SessionExpired) {
                        Ok(_) => expired.push(id),
                        Err(err) => warn!(session_id = %id, error = %err, "expiry revert failed"),
                    }
                }
                _ => {}
            }
        }
        expired
    }

    // ---- audit and archive ------------------------------------------------------

    pub fn audit_entries(&self) -> Vec<AuditEntry> {
        self.store.read().audit_rows().to_vec()
    }

    pub fn audit_for_session(&self, session_id: ApplySessionId) -> Vec<AuditEntry> {
        self.store
            .read()
            .audit_rows_by_session(session_id)
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn archived_session(&self, session_id: ApplySessionId) -> Option<ApplySession> {
        self.store.read().archived_session_row(session_id).cloned()
    }

    pub fn archived_flash_job(&self, job_id: FlashJobId) -> Option<FlashJob> {
        self.store.read().archived_flash_job_row(job_id).cloned()
    }

    // ---- internals ---------------------------------------------------------------

    fn monitor_target(&self) -> Weak<dyn MonitorTarget> {
        self.self_ref.clone()
    }

    /// Operator gate shared by every write path.
    pub(crate) fn check_write(
        &self,
        operation: WriteOperation,
        technician_id: Option<&str>,
    ) -> Result<(), OrchestratorError> {
        let decision = self.operator.validate_write(operation);
        if !decision.allowed {
            warn!(operation = operation.as_str(), reason = ?decision.reason, "write rejected");
            return Err(OrchestratorError::WriteRejected {
                reason: decision.reason.unwrap_or_else(|| "denied".to_string()),
            });
        }
        if self.operator.current_mode() != OperatorMode::Development
            && attribution(technician_id).is_none()
        {
            return Err(OrchestratorError::AttributionRequired);
        }
        Ok(())
    }

    /// ACTIVE to COMPLETED. The flag is true when a concurrent revert got there first.
    pub(crate) fn complete_session(
        &self,
        record: &SessionRecord,
    ) -> Result<(ApplySession, bool), OrchestratorError> {
        let now = self.clock.now();
        let mut session = record.lock();
        if session.status == ApplyStatus::Reverted {
            return Ok((redacted(&session), true));
        }
        let from = transition(&mut session, ApplyStatus::Completed, now)?;
        let view = redacted(&session);
        drop(session);
        self.events.send(OrchestratorEvent::SessionStatusChanged {
            session_id: view.id,
            from,
            to: ApplyStatus::Completed,
        });
        Ok((view, false))
    }

    /// Moves a non-terminal session to FAILED and archives it. `None` when the
    /// session was already past the point where it can fail.
    pub(crate) fn fail_session(
        &self,
        record: &SessionRecord,
        reason: impl Into<String>,
    ) -> Option<ApplySession> {
        let reason = reason.into();
        let now = self.clock.now();
        let (from, view) = {
            let mut session = record.lock();
            match transition(&mut session, ApplyStatus::Failed, now) {
                Ok(from) => {
                    session.armed = false;
                    session.apply_token = None;
                    session.failure_reason = Some(reason.clone());
                    (from, redacted(&session))
                }
                Err(err) => {
                    debug!(session_id = %session.id, error = %err, "session not failed");
                    return None;
                }
            }
        };
        warn!(session_id = %view.id, reason = %reason, "apply session failed");
        self.events.send(OrchestratorEvent::SessionStatusChanged {
            session_id: view.id,
            from,
            to: ApplyStatus::Failed,
        });
        self.archive_session(&view);
        Some(view)
    }

    /// Engine revert first; the record only moves once the vehicle is restored.
    fn revert_record(
        &self,
        record: &SessionRecord,
        action: AuditAction,
    ) -> Result<ApplySession, OrchestratorError> {
        let (session_id, engine_id, engine_ref, vehicle) = {
            let s = record.lock();
            if s.status == ApplyStatus::Reverted {
                return Ok(redacted(&s));
            }
            (
                s.id,
                s.engine_id.clone(),
                s.engine_session_ref.clone(),
                s.vehicle_session_id.clone(),
            )
        };
        let engine = self.engines.get(&engine_id)?;
        engine.revert_live(&engine_ref)?;

        let now = self.clock.now();
        let (from, view) = {
            let mut s = record.lock();
            if s.status == ApplyStatus::Reverted {
                return Ok(redacted(&s));
            }
            let from = transition(&mut s, ApplyStatus::Reverted, now)?;
            s.armed = false;
            (from, redacted(&s))
        };
        self.monitor.stop(session_id);
        self.release_telemetry(&engine, &vehicle, session_id);
        info!(session_id = %session_id, cause = action.as_str(), "live session reverted");
        self.events.send(OrchestratorEvent::SessionStatusChanged {
            session_id,
            from,
            to: ApplyStatus::Reverted,
        });
        self.append_audit(AuditEntryInput {
            at: now,
            action,
            engine_id: Some(engine_id.clone()),
            session_id: Some(session_id),
            flash_job_id: None,
            technician_id: None,
            job_id: None,
            summary: format!(
                "session {session_id} on {engine_id} reverted ({})",
                action.as_str()
            ),
        });
        self.archive_session(&view);
        Ok(view)
    }

    /// Drops the engine-side feed unless another live session still watches the
    /// same vehicle.
    fn release_telemetry(
        &self,
        engine: &Arc<dyn TuningEngine>,
        vehicle: &VehicleSessionId,
        session_id: ApplySessionId,
    ) {
        let still_watched = self.sessions.records().iter().any(|r| {
            let s = r.lock();
            s.id != session_id
                && s.mode == ApplyMode::LiveApply
                && s.status.occupies_slot()
                && &s.engine_id == engine.engine_id()
                && &s.vehicle_session_id == vehicle
        });
        if !still_watched {
            engine.unsubscribe_telemetry(vehicle);
        }
    }

    pub(crate) fn archive_session(&self, session: &ApplySession) {
        if let Err(err) = self.store.write().archive_session_row(redacted(session)) {
            warn!(session_id = %session.id, error = %err, "session not archived");
        }
    }

    pub(crate) fn append_audit(&self, input: AuditEntryInput) {
        let action = input.action;
        if let Err(err) = self.store.write().append_audit_row(input) {
            error!(action = action.as_str(), error = %err, "audit append failed");
        }
    }
}

impl MonitorTarget for Orchestrator {
    fn session_status(&self, session_id: ApplySessionId) -> Option<ApplyStatus> {
        self.sessions.get(session_id).ok().map(|r| r.lock().status)
    }

    fn auto_revert(&self, session_id: ApplySessionId) -> Result<(), OrchestratorError> {
        let record = self.sessions.get(session_id)?;
        match self.revert_record(&record, AuditAction::AutoRevert) {
            Ok(_) => Ok(()),
            Err(err) => {
                let engine_id = record.lock().engine_id.clone();
                self.append_audit(AuditEntryInput {
                    at: self.clock.now(),
                    action: AuditAction::AutoRevertFailed,
                    engine_id: Some(engine_id),
                    session_id: Some(session_id),
                    flash_job_id: None,
                    technician_id: None,
                    job_id: None,
                    summary: format!("automatic revert of session {session_id} failed: {err}"),
                });
                Err(err)
            }
        }
    }

    fn now(&self) -> MonotonicTimeNs {
        self.clock.now()
    }
}

pub(crate) fn expired_error(session: &ApplySession) -> OrchestratorError {
    OrchestratorError::SessionExpired {
        session_id: session.id,
        expired_at: session.expires_at.unwrap_or(session.updated_at),
    }
}

/// Trimmed, non-empty attribution value.
pub(crate) fn attribution(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;

    use ecutune_engines::simulation_only::SimulationOnlyBackend;
    use ecutune_engines::virtual_ecu::VirtualFaults;
    use ecutune_kernel_contracts::flash::FlashState;
    use ecutune_kernel_contracts::safety::EngineSample;

    use crate::test_support::{
        demo_profile, engine_id, harness, harness_with, map_id, profile_id, profile_with, vehicle,
    };

    fn fuel_cell(h: &crate::test_support::Harness) -> Option<f64> {
        h.ecu.live_cell(&map_id("fuel"), Some(0), Some(0))
    }

    fn config(tweak: impl FnOnce(&mut OrchestratorConfig)) -> OrchestratorConfig {
        let mut c = OrchestratorConfig::mvp_v1();
        tweak(&mut c);
        c
    }

    #[tokio::test]
    async fn at_orch_01_live_apply_then_revert_restores_vehicle() {
        let h = harness();
        h.arm_level(ApplyMode::LiveApply);
        let cs = h.fuel_changeset(14.0);
        let id = h.armed_session(ApplyMode::LiveApply, Some(&cs));

        let applied = h.orchestrator.apply_live(id, None, None).unwrap();
        assert_eq!(applied.status, ApplyStatus::Completed);
        assert_eq!(fuel_cell(&h), Some(14.0));
        assert!(h.orchestrator.is_monitoring(id));

        let reverted = h.orchestrator.revert_live(id).unwrap();
        assert_eq!(reverted.status, ApplyStatus::Reverted);
        assert!(!reverted.armed);
        assert_eq!(fuel_cell(&h), Some(10.0));
        assert!(!h.orchestrator.is_monitoring(id));

        // Second revert is a no-op.
        let again = h.orchestrator.revert_live(id).unwrap();
        assert_eq!(again.status, ApplyStatus::Reverted);
        let audit = h.orchestrator.audit_for_session(id);
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].input.action, AuditAction::LiveRevert);
        assert_eq!(
            h.orchestrator.archived_session(id).map(|s| s.status),
            Some(ApplyStatus::Reverted)
        );
    }

    #[tokio::test]
    async fn at_orch_02_write_modes_refused_while_disarmed() {
        let h = harness();
        let cs = h.fuel_changeset(14.0);
        for mode in [ApplyMode::LiveApply, ApplyMode::Flash] {
            let err = h
                .orchestrator
                .create_session(&engine_id(), vehicle(), Some(cs.id), Some(mode))
                .unwrap_err();
            assert!(matches!(err, OrchestratorError::NotArmed { .. }), "{mode:?}");
        }
        assert!(h.orchestrator.list_sessions().is_empty());
        assert!(matches!(
            h.orchestrator.set_level(ApplyMode::LiveApply),
            Err(OrchestratorError::NotArmed { .. })
        ));

        let ticket = h
            .orchestrator
            .create_session(&engine_id(), vehicle(), Some(cs.id), None)
            .unwrap();
        assert_eq!(ticket.session.mode, ApplyMode::Simulate);
    }

    #[tokio::test]
    async fn at_orch_03_engine_mode_support_checked_before_session_exists() {
        let h = harness();
        h.arm_level(ApplyMode::LiveApply);
        let offline = EngineId::new("offline-1").unwrap();
        h.orchestrator
            .register_engine(Arc::new(SimulationOnlyBackend::new(offline.clone(), demo_profile())));

        let err = h
            .orchestrator
            .create_session(&offline, vehicle(), None, Some(ApplyMode::LiveApply))
            .unwrap_err();
        assert_eq!(
            err,
            OrchestratorError::ModeNotSupportedByEngine {
                engine_id: offline.clone(),
                mode: ApplyMode::LiveApply
            }
        );
        assert!(h.orchestrator.list_sessions().is_empty());
        assert!(h
            .orchestrator
            .create_session(&offline, vehicle(), None, Some(ApplyMode::Simulate))
            .is_ok());
    }

    #[tokio::test]
    async fn at_orch_04_concurrency_limit_counts_occupying_sessions() {
        let h = harness_with(
            config(|c| c.max_concurrent_sessions = 1),
            OperatorMode::Development,
            |_| {},
        );
        h.arm_level(ApplyMode::LiveApply);
        let cs = h.fuel_changeset(14.0);
        let first = h.armed_session(ApplyMode::LiveApply, Some(&cs));
        h.orchestrator.apply_live(first, None, None).unwrap();

        let err = h
            .orchestrator
            .create_session(&engine_id(), vehicle(), Some(cs.id), Some(ApplyMode::LiveApply))
            .unwrap_err();
        assert_eq!(
            err,
            OrchestratorError::ConcurrencyLimitExceeded { current: 1, max: 1 }
        );

        h.orchestrator.revert_live(first).unwrap();
        assert!(h
            .orchestrator
            .create_session(&engine_id(), vehicle(), Some(cs.id), Some(ApplyMode::LiveApply))
            .is_ok());
    }

    #[tokio::test]
    async fn at_orch_05_racing_activations_never_exceed_limit() {
        let h = harness_with(
            config(|c| c.max_concurrent_sessions = 2),
            OperatorMode::Development,
            |_| {},
        );
        h.arm_level(ApplyMode::LiveApply);
        let cs = h.fuel_changeset(14.0);
        let ids: Vec<_> = (0..4)
            .map(|_| h.armed_session(ApplyMode::LiveApply, Some(&cs)))
            .collect();

        let barrier = Barrier::new(ids.len());
        let results: Vec<_> = thread::scope(|scope| {
            let handles: Vec<_> = ids
                .iter()
                .map(|id| {
                    let orchestrator = h.orchestrator.clone();
                    let barrier = &barrier;
                    scope.spawn(move || {
                        barrier.wait();
                        orchestrator.apply_live(*id, None, None)
                    })
                })
                .collect();
            handles.into_iter().map(|t| t.join().unwrap()).collect()
        });

        let ok = results.iter().filter(|r| r.is_ok()).count();
        let limited = results
            .iter()
            .filter(|r| matches!(r, Err(OrchestratorError::ConcurrencyLimitExceeded { .. })))
            .count();
        assert_eq!(ok, 2);
        assert_eq!(limited, 2);
        let occupying = h
            .orchestrator
            .list_sessions()
            .iter()
            .filter(|s| s.status.occupies_slot())
            .count();
        assert_eq!(occupying, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn at_orch_06_critical_boost_triggers_auto_revert() {
        let h = harness_with(
            config(|c| c.monitor_interval_ms = 20),
            OperatorMode::Development,
            |_| {},
        );
        let mut events = h.orchestrator.subscribe_events();
        h.arm_level(ApplyMode::LiveApply);
        let cs = h.fuel_changeset(14.0);
        let id = h.armed_session(ApplyMode::LiveApply, Some(&cs));
        h.orchestrator.apply_live(id, None, None).unwrap();
        assert_eq!(fuel_cell(&h), Some(14.0));

        let mut sample = EngineSample::idle(h.orchestrator.clock.now());
        sample.boost_psi = 32.0;
        h.ecu.publish_sample(&vehicle(), sample);

        let mut status = ApplyStatus::Completed;
        for _ in 0..100 {
            status = h.orchestrator.get_session(id).unwrap().status;
            if status == ApplyStatus::Reverted {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(status, ApplyStatus::Reverted);
        assert_eq!(fuel_cell(&h), Some(10.0));
        assert!(!h.orchestrator.snapshots(id).is_empty());
        assert!(h
            .orchestrator
            .audit_for_session(id)
            .iter()
            .any(|e| e.input.action == AuditAction::AutoRevert));

        let mut triggered = false;
        while let Ok(event) = events.try_recv() {
            if event == (OrchestratorEvent::AutoRevertTriggered { session_id: id }) {
                triggered = true;
            }
        }
        assert!(triggered);
    }

    #[tokio::test]
    async fn at_orch_07_apply_token_is_checked_and_single_use() {
        let h = harness();
        h.arm_level(ApplyMode::LiveApply);
        let cs = h.fuel_changeset(14.0);
        let ticket = h
            .orchestrator
            .create_session(&engine_id(), vehicle(), Some(cs.id), Some(ApplyMode::LiveApply))
            .unwrap();
        let id = ticket.session.id;
        assert_eq!(ticket.apply_token.as_str().len(), 43);
        assert!(ticket.session.apply_token.is_none());
        assert!(h.orchestrator.get_session(id).unwrap().apply_token.is_none());

        assert_eq!(
            h.orchestrator.arm_session(id, "not-the-token").unwrap_err(),
            OrchestratorError::InvalidToken { session_id: id }
        );
        assert_eq!(h.orchestrator.get_session(id).unwrap().status, ApplyStatus::Pending);

        let armed = h.orchestrator.arm_session(id, ticket.apply_token.as_str()).unwrap();
        assert_eq!(armed.status, ApplyStatus::Armed);
        assert!(armed.armed);
        assert_eq!(
            h.orchestrator
                .arm_session(id, ticket.apply_token.as_str())
                .unwrap_err(),
            OrchestratorError::InvalidToken { session_id: id }
        );
    }

    #[tokio::test]
    async fn at_orch_08_expired_session_refused_without_side_effects() {
        let h = harness();
        h.arm_level(ApplyMode::LiveApply);
        let cs = h.fuel_changeset(14.0);
        let ticket = h
            .orchestrator
            .create_session(&engine_id(), vehicle(), Some(cs.id), Some(ApplyMode::LiveApply))
            .unwrap();
        let id = ticket.session.id;
        assert!(ticket.session.expires_at.is_some());

        h.clock.advance_ms(10 * 60 * 1000);
        assert!(matches!(
            h.orchestrator.arm_session(id, ticket.apply_token.as_str()),
            Err(OrchestratorError::SessionExpired { session_id, .. }) if session_id == id
        ));
        assert_eq!(h.orchestrator.get_session(id).unwrap().status, ApplyStatus::Pending);

        let armed = h.armed_session(ApplyMode::LiveApply, Some(&cs));
        h.clock.advance_ms(10 * 60 * 1000);
        assert!(matches!(
            h.orchestrator.apply_live(armed, None, None),
            Err(OrchestratorError::SessionExpired { .. })
        ));
        assert_eq!(h.orchestrator.get_session(armed).unwrap().status, ApplyStatus::Armed);
        assert_eq!(fuel_cell(&h), Some(10.0));
        assert!(h.orchestrator.audit_entries().is_empty());
    }

    #[tokio::test]
    async fn at_orch_09_unverified_write_is_reverted_and_failed() {
        let h = harness();
        h.arm_level(ApplyMode::LiveApply);
        let changes = vec![
            MapChange::v1(map_id("fuel"), Some(0), Some(0), 10.0, 14.0, "richer").unwrap(),
            MapChange::v1(map_id("ign"), None, Some(0), 10.0, 12.0, "advance").unwrap(),
        ];
        let cs = h
            .orchestrator
            .create_changeset(Some(profile_id()), changes, "tech-7", "")
            .unwrap();
        let id = h.armed_session(ApplyMode::LiveApply, Some(&cs));
        h.ecu.set_faults(VirtualFaults {
            drop_first_cell: true,
            ..VirtualFaults::default()
        });

        assert_eq!(
            h.orchestrator.apply_live(id, None, None).unwrap_err(),
            OrchestratorError::VerificationFailed { session_id: id }
        );
        let session = h.orchestrator.get_session(id).unwrap();
        assert_eq!(session.status, ApplyStatus::Failed);
        assert!(!session.armed);
        assert_eq!(fuel_cell(&h), Some(10.0));
        assert_eq!(h.ecu.live_cell(&map_id("ign"), None, Some(0)), Some(10.0));
        assert!(!h.orchestrator.is_monitoring(id));
        assert_eq!(
            h.orchestrator.archived_session(id).map(|s| s.status),
            Some(ApplyStatus::Failed)
        );
    }

    #[tokio::test]
    async fn at_orch_10_engine_write_error_fails_session() {
        let h = harness();
        h.arm_level(ApplyMode::LiveApply);
        let cs = h.fuel_changeset(14.0);
        let id = h.armed_session(ApplyMode::LiveApply, Some(&cs));
        h.ecu.set_faults(VirtualFaults {
            fail_apply: true,
            ..VirtualFaults::default()
        });

        assert!(matches!(
            h.orchestrator.apply_live(id, None, None),
            Err(OrchestratorError::Engine(_))
        ));
        let session = h.orchestrator.get_session(id).unwrap();
        assert_eq!(session.status, ApplyStatus::Failed);
        assert!(session
            .failure_reason
            .as_deref()
            .is_some_and(|r| r.starts_with("live write failed")));
        assert!(!h.orchestrator.is_monitoring(id));
    }

    #[tokio::test]
    async fn at_orch_11_field_mode_requires_attribution() {
        let h = harness_with(OrchestratorConfig::mvp_v1(), OperatorMode::Field, |_| {});
        h.arm_level(ApplyMode::LiveApply);
        let cs = h.fuel_changeset(14.0);
        let id = h.armed_session(ApplyMode::LiveApply, Some(&cs));

        for technician in [None, Some("   ")] {
            assert_eq!(
                h.orchestrator.apply_live(id, technician, None).unwrap_err(),
                OrchestratorError::AttributionRequired
            );
        }
        assert_eq!(h.orchestrator.get_session(id).unwrap().status, ApplyStatus::Armed);

        h.operator.deny_writes("bay locked");
        assert_eq!(
            h.orchestrator.apply_live(id, Some("tech-7"), None).unwrap_err(),
            OrchestratorError::WriteRejected {
                reason: "bay locked".to_string()
            }
        );
        h.operator.allow_writes();

        h.orchestrator
            .apply_live(id, Some("tech-7"), Some("job-42"))
            .unwrap();
        let audit = h.orchestrator.audit_for_session(id);
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].input.action, AuditAction::LiveApply);
        assert_eq!(audit[0].input.technician_id.as_deref(), Some("tech-7"));
        assert_eq!(audit[0].input.job_id.as_deref(), Some("job-42"));
    }

    #[tokio::test]
    async fn at_orch_12_validate_changes_reflects_system_level() {
        let h = harness();
        let cs = h.fuel_changeset(14.0);

        let dry = h.orchestrator.validate_changes(&engine_id(), &cs).unwrap();
        assert!(dry.valid);
        assert_eq!(dry.warnings.len(), 1);
        assert_eq!(dry.warnings[0].kind, IssueKind::ModeCaveat);
        assert_eq!(dry.risk_score, 3);

        h.arm_level(ApplyMode::LiveApply);
        let live = h.orchestrator.validate_changes(&engine_id(), &cs).unwrap();
        assert!(live.warnings.is_empty());
        assert_eq!(live.risk_score, 40);

        h.orchestrator.set_level(ApplyMode::Flash).unwrap();
        let flash = h.orchestrator.validate_changes(&engine_id(), &cs).unwrap();
        assert_eq!(flash.risk_score, 80);
    }

    #[tokio::test]
    async fn at_orch_13_disarm_reverts_live_and_fails_waiting_sessions() {
        let h = harness();
        h.arm_level(ApplyMode::LiveApply);
        let cs = h.fuel_changeset(14.0);
        let live = h.armed_session(ApplyMode::LiveApply, Some(&cs));
        h.orchestrator.apply_live(live, None, None).unwrap();
        let waiting = h.armed_session(ApplyMode::LiveApply, Some(&cs));
        let dry = h
            .orchestrator
            .create_session(&engine_id(), vehicle(), Some(cs.id), Some(ApplyMode::Simulate))
            .unwrap()
            .session
            .id;

        assert_eq!(h.orchestrator.disarm_system("operator stop"), vec![live]);
        assert_eq!(
            h.orchestrator.safety_level(),
            SafetyLevelState {
                level: ApplyMode::Simulate,
                armed: false
            }
        );
        assert_eq!(h.orchestrator.get_session(live).unwrap().status, ApplyStatus::Reverted);
        assert_eq!(fuel_cell(&h), Some(10.0));
        let failed = h.orchestrator.get_session(waiting).unwrap();
        assert_eq!(failed.status, ApplyStatus::Failed);
        assert!(failed
            .failure_reason
            .as_deref()
            .is_some_and(|r| r.contains("system disarmed")));
        assert_eq!(h.orchestrator.get_session(dry).unwrap().status, ApplyStatus::Pending);
        assert!(matches!(
            h.orchestrator.apply_live(waiting, None, None),
            Err(OrchestratorError::NotArmed { .. })
        ));
        let disarm_entries = h
            .orchestrator
            .audit_entries()
            .iter()
            .filter(|e| e.input.action == AuditAction::SystemDisarm)
            .count();
        assert_eq!(disarm_entries, 2);
    }

    #[tokio::test]
    async fn at_orch_14_expiry_sweep_reverts_and_fails() {
        let h = harness();
        h.arm_level(ApplyMode::LiveApply);
        let cs = h.fuel_changeset(14.0);
        let live = h.armed_session(ApplyMode::LiveApply, Some(&cs));
        h.orchestrator.apply_live(live, None, None).unwrap();
        let pending = h
            .orchestrator
            .create_session(&engine_id(), vehicle(), Some(cs.id), Some(ApplyMode::LiveApply))
            .unwrap()
            .session
            .id;

        assert!(h.orchestrator.expire_sessions().is_empty());
        h.clock.advance_ms(10 * 60 * 1000);
        assert_eq!(h.orchestrator.expire_sessions(), vec![live, pending]);
        assert_eq!(h.orchestrator.get_session(live).unwrap().status, ApplyStatus::Reverted);
        assert_eq!(h.orchestrator.get_session(pending).unwrap().status, ApplyStatus::Failed);
        assert_eq!(fuel_cell(&h), Some(10.0));
        for id in [live, pending] {
            assert!(h
                .orchestrator
                .audit_for_session(id)
                .iter()
                .any(|e| e.input.action == AuditAction::SessionExpired));
        }
        assert!(h.orchestrator.expire_sessions().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn at_orch_15_proactive_expiry_runs_in_background() {
        let h = harness_with(
            config(|c| {
                c.proactive_expiry = true;
                c.monitor_interval_ms = 20;
            }),
            OperatorMode::Development,
            |_| {},
        );
        h.arm_level(ApplyMode::LiveApply);
        let id = h
            .orchestrator
            .create_session(&engine_id(), vehicle(), None, Some(ApplyMode::LiveApply))
            .unwrap()
            .session
            .id;
        h.clock.advance_ms(10 * 60 * 1000);

        let mut status = ApplyStatus::Pending;
        for _ in 0..100 {
            status = h.orchestrator.get_session(id).unwrap().status;
            if status == ApplyStatus::Failed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(status, ApplyStatus::Failed);
    }

    #[tokio::test]
    async fn at_orch_16_map_cell_updates_are_bounds_checked() {
        let h = harness();
        let err = h
            .orchestrator
            .update_map_cell(&profile_id(), &map_id("fuel"), Some(0), Some(1), 30.0)
            .unwrap_err();
        assert_eq!(
            err,
            OrchestratorError::OutOfBounds {
                value: 30.0,
                min: 0.0,
                max: 25.0
            }
        );
        assert!(matches!(
            h.orchestrator
                .update_map_cell(&ProfileId::new("nope").unwrap(), &map_id("fuel"), Some(0), Some(0), 1.0),
            Err(OrchestratorError::NotFound { kind: NotFoundKind::Profile, .. })
        ));
        assert!(matches!(
            h.orchestrator
                .update_map_cell(&profile_id(), &map_id("nope"), Some(0), Some(0), 1.0),
            Err(OrchestratorError::NotFound { kind: NotFoundKind::Map, .. })
        ));

        let map = h
            .orchestrator
            .update_map_cell(&profile_id(), &map_id("fuel"), Some(0), Some(1), 20.0)
            .unwrap();
        assert_eq!(map.grid.get(Some(0), Some(1)), Some(20.0));
        assert_eq!(
            h.orchestrator
                .get_map(&profile_id(), &map_id("fuel"))
                .unwrap()
                .grid
                .get(Some(0), Some(1)),
            Some(20.0)
        );
    }

    #[tokio::test]
    async fn at_orch_17_diff_and_validate_stored_profiles() {
        let h = harness();
        assert_eq!(
            h.orchestrator
                .diff(&profile_id(), &profile_id(), None)
                .unwrap()
                .total_changes,
            0
        );

        let mut rich = profile_with("stage2", vec![10.0, 12.0, 14.0, 16.0]);
        rich.map_mut(&map_id("fuel"))
            .unwrap()
            .set_cell(Some(0), Some(1), 30.0)
            .unwrap();
        h.orchestrator.create_profile(rich).unwrap();
        let stage2 = ProfileId::new("stage2").unwrap();

        let diff = h.orchestrator.diff(&profile_id(), &stage2, None).unwrap();
        assert_eq!(diff.total_changes, 1);
        let only_ign = [map_id("ign")];
        assert_eq!(
            h.orchestrator
                .diff(&profile_id(), &stage2, Some(&only_ign))
                .unwrap()
                .total_changes,
            0
        );

        let result = h.orchestrator.validate(&stage2).unwrap();
        assert!(!result.valid);
        assert!(result.errors.is_empty());
        assert_eq!(result.warnings.len(), 1);
        assert_eq!(result.safety_violations.len(), 1);
        assert_eq!(result.risk_score, 3);
        assert!(h.orchestrator.validate(&profile_id()).unwrap().valid);
    }

    #[tokio::test]
    async fn at_orch_18_simulate_session_never_touches_vehicle() {
        let h = harness();
        let cs = h.fuel_changeset(14.0);
        let ticket = h
            .orchestrator
            .create_session(&engine_id(), vehicle(), Some(cs.id), None)
            .unwrap();
        let id = ticket.session.id;
        assert_eq!(ticket.session.mode, ApplyMode::Simulate);
        assert!(ticket.session.expires_at.is_none());
        assert_eq!(ticket.session.engine_session_ref, format!("simulate-{id}"));

        h.orchestrator.arm_session(id, ticket.apply_token.as_str()).unwrap();
        let done = h.orchestrator.apply_live(id, None, None).unwrap();
        assert_eq!(done.status, ApplyStatus::Completed);
        assert_eq!(fuel_cell(&h), Some(10.0));
        assert!(!h.orchestrator.is_monitoring(id));
        assert_eq!(
            h.orchestrator.archived_session(id).map(|s| s.status),
            Some(ApplyStatus::Completed)
        );
        assert!(matches!(
            h.orchestrator.revert_live(id),
            Err(OrchestratorError::InvalidState { .. })
        ));

        let report = h.orchestrator.simulate(&profile_id(), Some(cs.id)).unwrap();
        assert_eq!(report.effects.len(), 1);
    }

    #[tokio::test]
    async fn at_orch_19_unknown_ids_are_not_found() {
        let h = harness();
        assert!(matches!(
            h.orchestrator.get_session(ApplySessionId(99)),
            Err(OrchestratorError::NotFound { kind: NotFoundKind::Session, .. })
        ));
        assert!(matches!(
            h.orchestrator.get_changeset(ChangesetId(9)),
            Err(OrchestratorError::NotFound { kind: NotFoundKind::Changeset, .. })
        ));
        let ghost = EngineId::new("ghost").unwrap();
        assert_eq!(
            h.orchestrator
                .create_session(&ghost, vehicle(), None, Some(ApplyMode::Simulate))
                .unwrap_err(),
            OrchestratorError::EngineNotFound(ghost)
        );
        assert!(matches!(
            h.orchestrator
                .create_session(&engine_id(), vehicle(), Some(ChangesetId(9)), Some(ApplyMode::Simulate)),
            Err(OrchestratorError::NotFound { kind: NotFoundKind::Changeset, .. })
        ));
        let change = MapChange::v1(map_id("fuel"), Some(0), Some(0), 10.0, 11.0, "").unwrap();
        let err = h
            .orchestrator
            .create_changeset(Some(ProfileId::new("nope").unwrap()), vec![change], "tech-7", "")
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::NotFound { kind: NotFoundKind::Profile, .. }));
        assert_eq!(err.boundary_class().http_status(), 404);
        assert!(h.orchestrator.list_sessions().is_empty());
    }

    #[tokio::test]
    async fn at_orch_20_failed_engine_revert_leaves_session_untouched() {
        let h = harness();
        h.arm_level(ApplyMode::LiveApply);
        let cs = h.fuel_changeset(14.0);
        let id = h.armed_session(ApplyMode::LiveApply, Some(&cs));
        h.orchestrator.apply_live(id, None, None).unwrap();
        h.ecu.set_faults(VirtualFaults {
            fail_revert: true,
            ..VirtualFaults::default()
        });

        assert!(matches!(
            h.orchestrator.revert_live(id),
            Err(OrchestratorError::Engine(_))
        ));
        assert_eq!(h.orchestrator.get_session(id).unwrap().status, ApplyStatus::Completed);
        assert!(h.orchestrator.is_monitoring(id));
        assert_eq!(fuel_cell(&h), Some(14.0));

        h.ecu.set_faults(VirtualFaults::default());
        h.orchestrator.revert_live(id).unwrap();
        assert_eq!(fuel_cell(&h), Some(10.0));
    }

    #[tokio::test]
    async fn at_orch_21_profiles_in_use_cannot_be_deleted() {
        let h = harness();
        assert_eq!(h.orchestrator.list_profiles().len(), 1);
        assert_eq!(h.orchestrator.list_maps(&profile_id()).unwrap().len(), 3);
        h.fuel_changeset(14.0);
        assert_eq!(h.orchestrator.list_changesets(Some(&profile_id())).len(), 1);
        assert!(matches!(
            h.orchestrator.delete_profile(&profile_id()),
            Err(OrchestratorError::Storage(StorageError::ForeignKeyViolation { .. }))
        ));

        h.orchestrator
            .create_profile(profile_with("scratch", vec![1.0, 2.0, 3.0, 4.0]))
            .unwrap();
        let scratch = ProfileId::new("scratch").unwrap();
        h.orchestrator.delete_profile(&scratch).unwrap();
        assert!(matches!(
            h.orchestrator.delete_profile(&scratch),
            Err(OrchestratorError::NotFound { kind: NotFoundKind::Profile, .. })
        ));
        assert_eq!(
            h.orchestrator.engine_status(&engine_id()).unwrap().connection,
            ecutune_kernel_contracts::capability::EngineConnection::Connected
        );
    }

    #[tokio::test]
    async fn at_orch_22_finished_dry_runs_and_flashes_release_their_slot() {
        let h = harness_with(
            config(|c| c.max_concurrent_sessions = 1),
            OperatorMode::Development,
            |_| {},
        );
        let cs = h.fuel_changeset(14.0);
        for _ in 0..3 {
            let id = h.armed_session(ApplyMode::Simulate, Some(&cs));
            let done = h.orchestrator.apply_live(id, None, None).unwrap();
            assert_eq!(done.status, ApplyStatus::Completed);
        }

        h.arm_level(ApplyMode::Flash);
        for _ in 0..2 {
            let session = h.armed_session(ApplyMode::Flash, None);
            let job = h.orchestrator.prepare_flash(session, &profile_id(), None).unwrap();
            let done = h.orchestrator.execute_flash(job.id, None, None).unwrap();
            assert_eq!(done.state, FlashState::Completed);
            assert_eq!(
                h.orchestrator.get_session(session).unwrap().status,
                ApplyStatus::Completed
            );
        }

        h.arm_level(ApplyMode::LiveApply);
        let live = h.armed_session(ApplyMode::LiveApply, Some(&cs));
        let applied = h.orchestrator.apply_live(live, None, None).unwrap();
        assert_eq!(applied.status, ApplyStatus::Completed);
        assert_eq!(
            h.orchestrator
                .create_session(&engine_id(), vehicle(), Some(cs.id), Some(ApplyMode::LiveApply))
                .unwrap_err(),
            OrchestratorError::ConcurrencyLimitExceeded { current: 1, max: 1 }
        );
    }

    #[tokio::test]
    async fn at_orch_23_racing_creates_all_refused_while_limit_is_held() {
        let h = harness_with(
            config(|c| c.max_concurrent_sessions = 1),
            OperatorMode::Development,
            |_| {},
        );
        h.arm_level(ApplyMode::LiveApply);
        let cs = h.fuel_changeset(14.0);
        let first = h.armed_session(ApplyMode::LiveApply, Some(&cs));
        h.orchestrator.apply_live(first, None, None).unwrap();

        let callers = 4;
        let barrier = Barrier::new(callers);
        let results: Vec<_> = thread::scope(|scope| {
            let handles: Vec<_> = (0..callers)
                .map(|_| {
                    let orchestrator = h.orchestrator.clone();
                    let barrier = &barrier;
                    let changeset = cs.id;
                    scope.spawn(move || {
                        barrier.wait();
                        orchestrator.create_session(
                            &engine_id(),
                            vehicle(),
                            Some(changeset),
                            Some(ApplyMode::LiveApply),
                        )
                    })
                })
                .collect();
            handles.into_iter().map(|t| t.join().unwrap()).collect()
        });

        assert!(results.iter().all(|r| matches!(
            r,
            Err(OrchestratorError::ConcurrencyLimitExceeded { current: 1, max: 1 })
        )));
        assert_eq!(h.orchestrator.list_sessions().len(), 1);
        // No engine-side session outlives a refused create.
        assert_eq!(h.ecu.open_live_sessions(), 1);
    }
}
