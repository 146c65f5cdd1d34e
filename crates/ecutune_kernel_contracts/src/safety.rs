#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::common::validate_finite;
use crate::session::ApplySessionId;
use crate::{ContractViolation, MonotonicTimeNs, Validate};

/// One decoded telemetry sample in engineering units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EngineSample {
    pub rpm: f64,
    pub boost_psi: f64,
    pub air_fuel_ratio: f64,
    pub knock: f64,
    pub coolant_temp_c: f64,
    pub intake_air_temp_c: f64,
    pub throttle_pct: f64,
    pub sampled_at: MonotonicTimeNs,
}

impl EngineSample {
    /// A warm idle: nothing near any threshold.
    pub fn idle(sampled_at: MonotonicTimeNs) -> Self {
        Self {
            rpm: 850.0,
            boost_psi: 0.0,
            air_fuel_ratio: 14.7,
            knock: 0.0,
            coolant_temp_c: 88.0,
            intake_air_temp_c: 30.0,
            throttle_pct: 0.0,
            sampled_at,
        }
    }
}

impl Validate for EngineSample {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_finite("engine_sample.rpm", self.rpm)?;
        validate_finite("engine_sample.boost_psi", self.boost_psi)?;
        validate_finite("engine_sample.air_fuel_ratio", self.air_fuel_ratio)?;
        validate_finite("engine_sample.knock", self.knock)?;
        validate_finite("engine_sample.coolant_temp_c", self.coolant_temp_c)?;
        validate_finite("engine_sample.intake_air_temp_c", self.intake_air_temp_c)?;
        validate_finite("engine_sample.throttle_pct", self.throttle_pct)?;
        if self.rpm < 0.0 {
            return Err(ContractViolation::InvalidRange {
                field: "engine_sample.rpm",
                min: 0.0,
                max: f64::MAX,
                got: self.rpm,
            });
        }
        Ok(())
    }
}

/// Sample bound to the session it was taken for. Append-only; readers get clones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetySnapshot {
    pub session_id: ApplySessionId,
    pub params: EngineSample,
    pub taken_at: MonotonicTimeNs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ViolationSeverity {
    Warning,
    Critical,
}

impl ViolationSeverity {
    pub fn as_str(self) -> &'static str {
        match self {
            ViolationSeverity::Warning => "WARNING",
            ViolationSeverity::Critical => "CRITICAL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ViolationRule {
    KnockWarning,
    KnockCritical,
    BoostWarning,
    BoostCritical,
    LeanMixture,
    CoolantOverTemp,
}

impl ViolationRule {
    pub fn as_str(self) -> &'static str {
        match self {
            ViolationRule::KnockWarning => "KNOCK_WARNING",
            ViolationRule::KnockCritical => "KNOCK_CRITICAL",
            ViolationRule::BoostWarning => "BOOST_WARNING",
            ViolationRule::BoostCritical => "BOOST_CRITICAL",
            ViolationRule::LeanMixture => "LEAN_MIXTURE",
            ViolationRule::CoolantOverTemp => "COOLANT_OVER_TEMP",
        }
    }

    pub fn severity(self) -> ViolationSeverity {
        match self {
            ViolationRule::KnockCritical | ViolationRule::BoostCritical => {
                ViolationSeverity::Critical
            }
            _ => ViolationSeverity::Warning,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyViolationReport {
    pub snapshot: SafetySnapshot,
    pub rules: Vec<ViolationRule>,
    pub severity: ViolationSeverity,
}

impl SafetyViolationReport {
    /// `None` when no rule fired.
    pub fn from_rules(snapshot: SafetySnapshot, rules: Vec<ViolationRule>) -> Option<Self> {
        let severity = rules.iter().map(|r| r.severity()).max()?;
        Some(Self {
            snapshot,
            rules,
            severity,
        })
    }

    pub fn is_critical(&self) -> bool {
        self.severity == ViolationSeverity::Critical
    }
}
