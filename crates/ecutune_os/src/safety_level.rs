#![forbid(unsafe_code)]

use ecutune_kernel_contracts::session::{ApplyMode, SafetyPolicy};
use parking_lot::Mutex;
use tracing::info;

use crate::error::OrchestratorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SafetyLevelState {
    pub level: ApplyMode,
    pub armed: bool,
}

impl SafetyLevelState {
    pub fn policy(&self) -> SafetyPolicy {
        self.level.policy()
    }
}

/// System-wide level and arm switch. Starts at SIMULATE, disarmed.
#[derive(Debug)]
pub struct SafetyLevelController {
    state: Mutex<SafetyLevelState>,
}

impl SafetyLevelController {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SafetyLevelState {
                level: ApplyMode::Simulate,
                armed: false,
            }),
        }
    }

    pub fn snapshot(&self) -> SafetyLevelState {
        *self.state.lock()
    }

    pub fn level(&self) -> ApplyMode {
        self.state.lock().level
    }

    pub fn is_armed(&self) -> bool {
        self.state.lock().armed
    }

    /// Returns the previous level.
    pub fn set_level(&self, level: ApplyMode) -> Result<ApplyMode, OrchestratorError> {
        let mut state = self.state.lock();
        if level.policy().requires_arming && !state.armed {
            return Err(OrchestratorError::NotArmed {
                reason: format!("level {} requires the system to be armed", level.as_str()),
            });
        }
        let prev = state.level;
        state.level = level;
        info!(from = prev.as_str(), to = level.as_str(), "safety level changed");
        Ok(prev)
    }

    /// Returns true when the arm flag changed.
    pub fn arm(&self) -> bool {
        let mut state = self.state.lock();
        let changed = !state.armed;
        state.armed = true;
        changed
    }

    /// Clears the arm flag and drops the level to SIMULATE. Returns the level in force
    /// before the call.
    pub fn disarm(&self) -> ApplyMode {
        let mut state = self.state.lock();
        let prev = state.level;
        state.armed = false;
        state.level = ApplyMode::Simulate;
        prev
    }

    /// Fails unless the mode can run under the current arm state.
    pub fn check_mode_allowed(&self, mode: ApplyMode) -> Result<(), OrchestratorError> {
        if mode.policy().requires_arming && !self.is_armed() {
            return Err(OrchestratorError::NotArmed {
                reason: format!("mode {} requires the system to be armed", mode.as_str()),
            });
        }
        Ok(())
    }
}

impl Default for SafetyLevelController {
    fn default() -> Self {
        Self::new()
    }
}
