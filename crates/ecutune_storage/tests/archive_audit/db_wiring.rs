#![forbid(unsafe_code)]

use ecutune_kernel_contracts::audit::{AuditAction, AuditEntryInput};
use ecutune_kernel_contracts::calibration::ProfileId;
use ecutune_kernel_contracts::capability::EngineId;
use ecutune_kernel_contracts::flash::{FlashJob, FlashJobId, FlashState};
use ecutune_kernel_contracts::session::{
    ApplyMode, ApplySession, ApplySessionId, ApplyStatus, ApplyToken, VehicleSessionId,
};
use ecutune_kernel_contracts::MonotonicTimeNs;
use ecutune_storage::ecu_store::{EcuStore, StorageError};
use ecutune_storage::repo::{ArchiveRepo, AuditRepo};

fn session(id: u64, mode: ApplyMode, status: ApplyStatus) -> ApplySession {
    let mut s = ApplySession::v1(
        ApplySessionId(id),
        EngineId::new("vecu").unwrap(),
        VehicleSessionId::new("veh-1").unwrap(),
        None,
        mode,
        ApplyToken::new("0123456789abcdef").unwrap(),
        format!("ref-{id}"),
        MonotonicTimeNs(1),
        None,
    )
    .unwrap();
    s.status = status;
    s.apply_token = None;
    s
}

fn audit(at: u64, action: AuditAction, session_id: Option<ApplySessionId>) -> AuditEntryInput {
    AuditEntryInput {
        at: MonotonicTimeNs(at),
        action,
        engine_id: Some(EngineId::new("vecu").unwrap()),
        session_id,
        flash_job_id: None,
        technician_id: Some("tech-7".to_string()),
        job_id: None,
        summary: format!("{} by tech-7", action.as_str()),
    }
}

#[test]
fn at_archive_db_01_only_terminal_sessions_archived_once() {
    let mut s = EcuStore::new_in_memory();
    assert!(matches!(
        s.archive_session_row(session(1, ApplyMode::LiveApply, ApplyStatus::Completed)),
        Err(StorageError::ContractViolation(_))
    ));
    s.archive_session_row(session(1, ApplyMode::LiveApply, ApplyStatus::Reverted))
        .unwrap();
    s.archive_session_row(session(2, ApplyMode::Simulate, ApplyStatus::Completed))
        .unwrap();
    assert!(matches!(
        s.archive_session_row(session(1, ApplyMode::LiveApply, ApplyStatus::Reverted)),
        Err(StorageError::AppendOnlyViolation { .. })
    ));
    assert_eq!(s.archived_session_rows().len(), 2);
    assert_eq!(
        s.archived_session_row(ApplySessionId(1)).map(|r| r.status),
        Some(ApplyStatus::Reverted)
    );
}

#[test]
fn at_archive_db_02_flash_jobs_need_terminal_state() {
    let mut s = EcuStore::new_in_memory();
    let mut job = FlashJob::v1(
        FlashJobId(3),
        EngineId::new("vecu").unwrap(),
        None,
        ProfileId::new("stage1").unwrap(),
        None,
        true,
        true,
        MonotonicTimeNs(1),
    )
    .unwrap();
    assert!(s.archive_flash_job_row(job.clone()).is_err());
    job.state = FlashState::Aborted;
    s.archive_flash_job_row(job).unwrap();
    assert_eq!(
        s.archived_flash_job_row(FlashJobId(3)).map(|j| j.state),
        Some(FlashState::Aborted)
    );
    assert_eq!(s.archived_flash_job_rows().len(), 1);
}

#[test]
fn at_audit_db_01_entries_append_in_order_and_filter_by_session() {
    let mut s = EcuStore::new_in_memory();
    let a = s
        .append_audit_row(audit(10, AuditAction::LiveApply, Some(ApplySessionId(1))))
        .unwrap();
    let b = s
        .append_audit_row(audit(11, AuditAction::FlashExecute, None))
        .unwrap();
    s.append_audit_row(audit(12, AuditAction::LiveRevert, Some(ApplySessionId(1))))
        .unwrap();
    assert!(a.0 < b.0);
    assert_eq!(s.audit_rows().len(), 3);
    let for_session: Vec<AuditAction> = s
        .audit_rows_by_session(ApplySessionId(1))
        .iter()
        .map(|e| e.input.action)
        .collect();
    assert_eq!(for_session, vec![AuditAction::LiveApply, AuditAction::LiveRevert]);
}

#[test]
fn at_audit_db_02_empty_summary_rejected() {
    let mut s = EcuStore::new_in_memory();
    let mut entry = audit(10, AuditAction::AutoRevert, None);
    entry.summary = "  ".to_string();
    assert!(s.append_audit_row(entry).is_err());
    assert!(s.audit_rows().is_empty());
}
