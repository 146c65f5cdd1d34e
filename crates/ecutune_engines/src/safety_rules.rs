#![forbid(unsafe_code)]

use ecutune_kernel_contracts::safety::{EngineSample, ViolationRule};

/// Telemetry limits. Each rule is evaluated independently, so one sample can fire
/// several rules at once.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SafetyThresholds {
    pub knock_warning: f64,
    pub knock_critical: f64,
    pub boost_warning_psi: f64,
    pub boost_critical_psi: f64,
    pub afr_lean_below: f64,
    pub coolant_max_c: f64,
}

impl SafetyThresholds {
    pub fn mvp_v1() -> Self {
        Self {
            knock_warning: 10.0,
            knock_critical: 20.0,
            boost_warning_psi: 25.0,
            boost_critical_psi: 30.0,
            afr_lean_below: 12.0,
            coolant_max_c: 110.0,
        }
    }

    pub fn evaluate(&self, sample: &EngineSample) -> Vec<ViolationRule> {
        let mut fired = Vec::new();
        if sample.knock > self.knock_critical {
            fired.push(ViolationRule::KnockCritical);
        } else if sample.knock > self.knock_warning {
            fired.push(ViolationRule::KnockWarning);
        }
        if sample.boost_psi > self.boost_critical_psi {
            fired.push(ViolationRule::BoostCritical);
        } else if sample.boost_psi > self.boost_warning_psi {
            fired.push(ViolationRule::BoostWarning);
        }
        if sample.air_fuel_ratio < self.afr_lean_below {
            fired.push(ViolationRule::LeanMixture);
        }
        if sample.coolant_temp_c > self.coolant_max_c {
            fired.push(ViolationRule::CoolantOverTemp);
        }
        fired
    }
}
