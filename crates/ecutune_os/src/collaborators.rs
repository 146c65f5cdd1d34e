#![forbid(unsafe_code)]

use parking_lot::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorMode {
    Development,
    Field,
}

impl OperatorMode {
    pub fn as_str(self) -> &'static str {
        match self {
            OperatorMode::Development => "DEVELOPMENT",
            OperatorMode::Field => "FIELD",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOperation {
    LiveApply,
    Revert,
    Flash,
}

impl WriteOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            WriteOperation::LiveApply => "LIVE_APPLY",
            WriteOperation::Revert => "REVERT",
            WriteOperation::Flash => "FLASH",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteDecision {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl WriteDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

/// Authorization seam consulted before every vehicle write.
pub trait OperatorContext: Send + Sync {
    fn current_mode(&self) -> OperatorMode;
    fn validate_write(&self, operation: WriteOperation) -> WriteDecision;
}

/// Fixed-mode context. Writes are allowed unless a denial is set.
#[derive(Debug)]
pub struct StaticOperatorContext {
    mode: OperatorMode,
    deny_reason: RwLock<Option<String>>,
}

impl StaticOperatorContext {
    pub fn new(mode: OperatorMode) -> Self {
        Self {
            mode,
            deny_reason: RwLock::new(None),
        }
    }

    pub fn deny_writes(&self, reason: impl Into<String>) {
        *self.deny_reason.write() = Some(reason.into());
    }

    pub fn allow_writes(&self) {
        *self.deny_reason.write() = None;
    }
}

impl OperatorContext for StaticOperatorContext {
    fn current_mode(&self) -> OperatorMode {
        self.mode
    }

    fn validate_write(&self, _operation: WriteOperation) -> WriteDecision {
        match self.deny_reason.read().as_ref() {
            Some(reason) => WriteDecision::deny(reason.clone()),
            None => WriteDecision::allow(),
        }
    }
}
