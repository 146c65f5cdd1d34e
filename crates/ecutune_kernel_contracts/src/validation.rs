#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::calibration::{CellPosition, MapId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssueKind {
    BelowMinimum,
    AboveMaximum,
    ExcessiveTiming,
    ExcessiveBoost,
    UnknownMap,
    CellOutOfRange,
    StaleOldValue,
    ModeCaveat,
}

impl IssueKind {
    pub fn as_str(self) -> &'static str {
        match self {
            IssueKind::BelowMinimum => "below minimum",
            IssueKind::AboveMaximum => "above maximum",
            IssueKind::ExcessiveTiming => "excessive timing",
            IssueKind::ExcessiveBoost => "excessive boost",
            IssueKind::UnknownMap => "unknown map",
            IssueKind::CellOutOfRange => "cell out of range",
            IssueKind::StaleOldValue => "stale old value",
            IssueKind::ModeCaveat => "mode caveat",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub kind: IssueKind,
    pub map_id: Option<MapId>,
    pub position: Option<CellPosition>,
    pub value: Option<f64>,
    pub message: String,
}

impl ValidationIssue {
    pub fn cell(
        kind: IssueKind,
        map_id: &MapId,
        position: CellPosition,
        value: f64,
        message: String,
    ) -> Self {
        Self {
            kind,
            map_id: Some(map_id.clone()),
            position: Some(position),
            value: Some(value),
            message,
        }
    }

    pub fn general(kind: IssueKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            map_id: None,
            position: None,
            value: None,
            message: message.into(),
        }
    }
}

pub fn risk_score(errors: usize, warnings: usize) -> u32 {
    let e = u32::try_from(errors).unwrap_or(u32::MAX);
    let w = u32::try_from(warnings).unwrap_or(u32::MAX);
    e.saturating_mul(10).saturating_add(w.saturating_mul(3))
}

/// Derived verdict. Never persisted as authoritative state; callers recompute it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub risk_score: u32,
    pub warnings: Vec<ValidationIssue>,
    pub errors: Vec<ValidationIssue>,
    pub safety_violations: Vec<ValidationIssue>,
}

impl ValidationResult {
    pub fn from_issues(
        errors: Vec<ValidationIssue>,
        warnings: Vec<ValidationIssue>,
        safety_violations: Vec<ValidationIssue>,
    ) -> Self {
        Self {
            valid: errors.is_empty() && safety_violations.is_empty(),
            risk_score: risk_score(errors.len(), warnings.len()),
            warnings,
            errors,
            safety_violations,
        }
    }

    pub fn merge(mut self, other: ValidationResult) -> Self {
        let floor = self.risk_score.max(other.risk_score);
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
        self.safety_violations.extend(other.safety_violations);
        let merged = Self::from_issues(self.errors, self.warnings, self.safety_violations);
        merged.with_risk_floor(floor)
    }

    pub fn with_warning(mut self, warning: ValidationIssue) -> Self {
        self.warnings.push(warning);
        let recomputed = risk_score(self.errors.len(), self.warnings.len());
        self.risk_score = self.risk_score.max(recomputed);
        self
    }

    pub fn with_risk_floor(mut self, floor: u32) -> Self {
        self.risk_score = self.risk_score.max(floor);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellDiff {
    pub map_id: MapId,
    pub map_name: String,
    pub position: CellPosition,
    pub old_value: f64,
    pub new_value: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DiffReport {
    pub diffs: Vec<CellDiff>,
    pub total_changes: usize,
}

impl DiffReport {
    pub fn from_diffs(diffs: Vec<CellDiff>) -> Self {
        let total_changes = diffs.len();
        Self {
            diffs,
            total_changes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_validation_01_risk_score_formula() {
        assert_eq!(risk_score(0, 0), 0);
        assert_eq!(risk_score(0, 1), 3);
        assert_eq!(risk_score(2, 3), 29);
        assert_eq!(risk_score(usize::MAX, 1), u32::MAX);
    }

    #[test]
    fn at_validation_02_merge_keeps_highest_floor() {
        let a = ValidationResult::from_issues(vec![], vec![], vec![]).with_risk_floor(40);
        let b = ValidationResult::from_issues(
            vec![ValidationIssue::general(IssueKind::UnknownMap, "x")],
            vec![],
            vec![],
        );
        let merged = a.merge(b);
        assert!(!merged.valid);
        assert_eq!(merged.errors.len(), 1);
        assert_eq!(merged.risk_score, 40);
    }

    #[test]
    fn at_validation_03_safety_violation_invalidates() {
        let v = ValidationIssue::general(IssueKind::AboveMaximum, "cell above max");
        let r = ValidationResult::from_issues(vec![], vec![v.clone()], vec![v]);
        assert!(!r.valid);
        assert_eq!(r.risk_score, 3);
    }
}
