#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use base64::Engine;
use ecutune_kernel_contracts::session::{
    is_allowed_status_transition, ApplySession, ApplySessionId, ApplyStatus, ApplyToken,
};
use ecutune_kernel_contracts::{ContractViolation, MonotonicTimeNs};
use parking_lot::{Mutex, RwLock};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::{NotFoundKind, OrchestratorError};

pub type SessionRecord = Arc<Mutex<ApplySession>>;

/// Mints a fresh single-use apply token from 32 random bytes.
pub fn mint_apply_token() -> Result<ApplyToken, ContractViolation> {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    ApplyToken::new(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes))
}

/// Copy of a session safe to hand to callers: the token never leaves the table.
pub fn redacted(session: &ApplySession) -> ApplySession {
    ApplySession {
        apply_token: None,
        ..session.clone()
    }
}

/// Moves a locked session to `to`, stamping `updated_at`. Returns the previous status.
pub fn transition(
    session: &mut ApplySession,
    to: ApplyStatus,
    now: MonotonicTimeNs,
) -> Result<ApplyStatus, OrchestratorError> {
    let from = session.status;
    if !is_allowed_status_transition(session.mode, from, to) {
        return Err(OrchestratorError::invalid_state(format!(
            "session {} cannot move from {} to {}",
            session.id,
            from.as_str(),
            to.as_str()
        )));
    }
    session.status = to;
    session.updated_at = now;
    Ok(from)
}

/// Session records keyed by id. Lock order is always table, then record.
#[derive(Debug)]
pub struct SessionTable {
    rows: RwLock<BTreeMap<ApplySessionId, SessionRecord>>,
    next_id: AtomicU64,
}

impl SessionTable {
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> ApplySessionId {
        ApplySessionId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn occupied(
        rows: &BTreeMap<ApplySessionId, SessionRecord>,
        exclude: Option<ApplySessionId>,
    ) -> usize {
        rows.iter()
            .filter(|(id, _)| Some(**id) != exclude)
            .filter(|(_, r)| {
                let s = r.lock();
                s.status.occupies_slot() && !s.status.is_terminal(s.mode)
            })
            .count()
    }

    /// Fast pre-check before any engine call. Not authoritative.
    pub fn check_limit(&self, max: usize) -> Result<(), OrchestratorError> {
        let rows = self.rows.read();
        let current = Self::occupied(&rows, None);
        if current >= max {
            return Err(OrchestratorError::ConcurrencyLimitExceeded { current, max });
        }
        Ok(())
    }

    /// Counts and inserts under one write lock.
    pub fn insert_with_limit(
        &self,
        session: ApplySession,
        max: usize,
    ) -> Result<SessionRecord, OrchestratorError> {
        let mut rows = self.rows.write();
        let current = Self::occupied(&rows, None);
        if current >= max {
            return Err(OrchestratorError::ConcurrencyLimitExceeded { current, max });
        }
        let id = session.id;
        let record = Arc::new(Mutex::new(session));
        rows.insert(id, record.clone());
        Ok(record)
    }

    /// ARMED to ACTIVE under the same write lock that guards the count, so two
    /// activations can never both squeeze under the limit.
    pub fn activate_within_limit(
        &self,
        session_id: ApplySessionId,
        max: usize,
        now: MonotonicTimeNs,
    ) -> Result<ApplyStatus, OrchestratorError> {
        let rows = self.rows.write();
        let record = rows
            .get(&session_id)
            .ok_or_else(|| OrchestratorError::not_found(NotFoundKind::Session, session_id))?;
        let current = Self::occupied(&rows, Some(session_id));
        if current >= max {
            return Err(OrchestratorError::ConcurrencyLimitExceeded { current, max });
        }
        let mut session = record.lock();
        if session.status != ApplyStatus::Armed {
            return Err(OrchestratorError::invalid_state(format!(
                "session {} is {}, not ARMED",
                session_id,
                session.status.as_str()
            )));
        }
        transition(&mut session, ApplyStatus::Active, now)
    }

    pub fn get(&self, session_id: ApplySessionId) -> Result<SessionRecord, OrchestratorError> {
        self.rows
            .read()
            .get(&session_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::not_found(NotFoundKind::Session, session_id))
    }

    pub fn records(&self) -> Vec<SessionRecord> {
        self.rows.read().values().cloned().collect()
    }

    pub fn snapshot(&self) -> Vec<ApplySession> {
        self.records().iter().map(|r| redacted(&r.lock())).collect()
    }
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}
