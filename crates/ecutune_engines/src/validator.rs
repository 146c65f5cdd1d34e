#![forbid(unsafe_code)]

use ecutune_kernel_contracts::calibration::{CalibrationMap, CellPosition, MapCategory, MapId, Profile};
use ecutune_kernel_contracts::changeset::Changeset;
use ecutune_kernel_contracts::validation::{
    CellDiff, DiffReport, IssueKind, ValidationIssue, ValidationResult,
};

/// Category ceilings applied on top of each map's declared bounds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationValidatorConfig {
    /// Degrees of advance above which an IGNITION cell is a hard error.
    pub ignition_max_deg: f64,
    /// PSI above which a BOOST cell is a warning.
    pub boost_warn_psi: f64,
    /// Tolerance when comparing a change's recorded old value with the map.
    pub stale_value_epsilon: f64,
}

impl CalibrationValidatorConfig {
    pub fn mvp_v1() -> Self {
        Self {
            ignition_max_deg: 25.0,
            boost_warn_psi: 22.0,
            stale_value_epsilon: 1e-6,
        }
    }
}

#[derive(Default)]
struct IssueSink {
    errors: Vec<ValidationIssue>,
    warnings: Vec<ValidationIssue>,
    safety_violations: Vec<ValidationIssue>,
}

impl IssueSink {
    fn finish(self) -> ValidationResult {
        ValidationResult::from_issues(self.errors, self.warnings, self.safety_violations)
    }
}

#[derive(Debug, Clone)]
pub struct CalibrationValidator {
    config: CalibrationValidatorConfig,
}

impl CalibrationValidator {
    pub fn new(config: CalibrationValidatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CalibrationValidatorConfig {
        &self.config
    }

    pub fn validate_map(&self, map: &CalibrationMap) -> ValidationResult {
        let mut sink = IssueSink::default();
        self.check_map_cells(map, &mut sink);
        sink.finish()
    }

    pub fn validate_profile(&self, profile: &Profile) -> ValidationResult {
        let mut sink = IssueSink::default();
        for map in &profile.maps {
            self.check_map_cells(map, &mut sink);
        }
        sink.finish()
    }

    /// Checks every proposed cell value against the map it targets in `profile`.
    /// Unresolvable edits are errors; a recorded old value that no longer matches
    /// the map is a warning.
    pub fn validate_changeset(&self, profile: &Profile, changeset: &Changeset) -> ValidationResult {
        let mut sink = IssueSink::default();
        for change in &changeset.changes {
            let Some(map) = profile.map(&change.map_id) else {
                sink.errors.push(ValidationIssue::general(
                    IssueKind::UnknownMap,
                    format!("unknown map: {}", change.map_id),
                ));
                continue;
            };
            let Some(index) = map.grid.index_of(change.row, change.col) else {
                sink.errors.push(ValidationIssue {
                    kind: IssueKind::CellOutOfRange,
                    map_id: Some(map.id.clone()),
                    position: None,
                    value: Some(change.new_value),
                    message: format!(
                        "cell out of range: {} has no cell at row {:?} col {:?}",
                        map.name, change.row, change.col
                    ),
                });
                continue;
            };
            let position = map.grid.position(index);
            let current = map.grid.cells()[index];
            if (current - change.old_value).abs() > self.config.stale_value_epsilon {
                sink.warnings.push(ValidationIssue::cell(
                    IssueKind::StaleOldValue,
                    &map.id,
                    position,
                    current,
                    format!(
                        "stale old value: {} cell {} is {} but change expects {}",
                        map.name,
                        describe_position(position),
                        current,
                        change.old_value
                    ),
                ));
            }
            self.check_cell(map, position, change.new_value, &mut sink);
        }
        sink.finish()
    }

    fn check_map_cells(&self, map: &CalibrationMap, sink: &mut IssueSink) {
        for (index, value) in map.grid.cells().iter().enumerate() {
            self.check_cell(map, map.grid.position(index), *value, sink);
        }
    }

    fn check_cell(
        &self,
        map: &CalibrationMap,
        position: CellPosition,
        value: f64,
        sink: &mut IssueSink,
    ) {
        let at = describe_position(position);
        if let Some(min) = map.min_value {
            if value < min {
                let issue = ValidationIssue::cell(
                    IssueKind::BelowMinimum,
                    &map.id,
                    position,
                    value,
                    format!("below minimum: {} cell {at} is {value} (min {min})", map.name),
                );
                sink.safety_violations.push(issue.clone());
                sink.errors.push(issue);
            }
        }
        if let Some(max) = map.max_value {
            if value > max {
                let issue = ValidationIssue::cell(
                    IssueKind::AboveMaximum,
                    &map.id,
                    position,
                    value,
                    format!("above maximum: {} cell {at} is {value} (max {max})", map.name),
                );
                sink.safety_violations.push(issue.clone());
                sink.warnings.push(issue);
            }
        }
        match map.category {
            MapCategory::Ignition if value > self.config.ignition_max_deg => {
                sink.errors.push(ValidationIssue::cell(
                    IssueKind::ExcessiveTiming,
                    &map.id,
                    position,
                    value,
                    format!(
                        "excessive timing: {} cell {at} advances {value} deg (ceiling {})",
                        map.name, self.config.ignition_max_deg
                    ),
                ));
            }
            MapCategory::Boost if value > self.config.boost_warn_psi => {
                sink.warnings.push(ValidationIssue::cell(
                    IssueKind::ExcessiveBoost,
                    &map.id,
                    position,
                    value,
                    format!(
                        "excessive boost: {} cell {at} requests {value} psi (ceiling {})",
                        map.name, self.config.boost_warn_psi
                    ),
                ));
            }
            _ => {}
        }
    }
}

fn describe_position(position: CellPosition) -> String {
    match (position.row, position.col) {
        (Some(r), Some(c)) => format!("[{r},{c}]"),
        _ => format!("[{}]", position.index),
    }
}

/// Cell-by-cell comparison. Maps whose shapes differ produce no entries.
pub fn diff_maps(source: &CalibrationMap, target: &CalibrationMap) -> Vec<CellDiff> {
    if source.grid.shape() != target.grid.shape() {
        return Vec::new();
    }
    source
        .grid
        .cells()
        .iter()
        .zip(target.grid.cells())
        .enumerate()
        .filter(|(_, (old, new))| old != new)
        .map(|(index, (old, new))| CellDiff {
            map_id: source.id.clone(),
            map_name: source.name.clone(),
            position: source.grid.position(index),
            old_value: *old,
            new_value: *new,
        })
        .collect()
}

/// Pairs maps by name. Source maps without a same-named target are skipped, and
/// `map_ids` (matched against source ids) narrows the comparison when given.
pub fn diff_profiles(source: &Profile, target: &Profile, map_ids: Option<&[MapId]>) -> DiffReport {
    let mut diffs = Vec::new();
    for map in &source.maps {
        if map_ids.is_some_and(|ids| !ids.contains(&map.id)) {
            continue;
        }
        if let Some(counterpart) = target.map_by_name(&map.name) {
            diffs.extend(diff_maps(map, counterpart));
        }
    }
    DiffReport::from_diffs(diffs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ecutune_kernel_contracts::calibration::ProfileId;
    use ecutune_kernel_contracts::changeset::{ChangesetId, MapChange};
    use ecutune_kernel_contracts::MonotonicTimeNs;

    fn validator() -> CalibrationValidator {
        CalibrationValidator::new(CalibrationValidatorConfig::mvp_v1())
    }

    fn map_id(v: &str) -> MapId {
        MapId::new(v).unwrap()
    }

    #[test]
    fn at_validator_01_above_max_is_warning_and_safety_violation() {
        let map = CalibrationMap::linear(
            map_id("inj_trim"),
            "Injector Trim",
            MapCategory::Fueling,
            vec![10.0, 30.0, 20.0],
        )
        .unwrap()
        .with_bounds(Some(0.0), Some(25.0))
        .unwrap();
        let r = validator().validate_map(&map);
        assert!(!r.valid);
        assert!(r.errors.is_empty());
        assert_eq!(r.warnings.len(), 1);
        assert_eq!(r.safety_violations.len(), 1);
        assert_eq!(r.risk_score, 3);
    }

    #[test]
    fn at_validator_02_ignition_over_ceiling_is_error_regardless_of_bounds() {
        let map = CalibrationMap::table(
            map_id("ign_base"),
            "Ignition Base",
            MapCategory::Ignition,
            2,
            2,
            vec![12.0, 18.0, 27.0, 22.0],
        )
        .unwrap();
        let r = validator().validate_map(&map);
        assert!(!r.valid);
        assert_eq!(r.errors.len(), 1);
        assert_eq!(r.errors[0].kind, IssueKind::ExcessiveTiming);
        assert!(r.errors[0].message.starts_with("excessive timing"));
        assert_eq!(r.errors[0].position.and_then(|p| p.row), Some(1));
        assert_eq!(r.risk_score, 10);
    }

    #[test]
    fn at_validator_03_boost_over_ceiling_is_warning_only() {
        let map = CalibrationMap::linear(
            map_id("boost_tgt"),
            "Boost Target",
            MapCategory::Boost,
            vec![18.0, 23.5],
        )
        .unwrap();
        let r = validator().validate_map(&map);
        assert!(r.valid);
        assert_eq!(r.warnings.len(), 1);
        assert_eq!(r.warnings[0].kind, IssueKind::ExcessiveBoost);
    }

    #[test]
    fn at_validator_04_below_min_is_error() {
        let map = CalibrationMap::linear(map_id("afr"), "AFR Target", MapCategory::Fueling, vec![-1.0])
            .unwrap()
            .with_bounds(Some(0.0), None)
            .unwrap();
        let r = validator().validate_map(&map);
        assert_eq!(r.errors.len(), 1);
        assert_eq!(r.risk_score, 10);
        assert!(!r.valid);
    }

    #[test]
    fn at_validator_05_changeset_checks_new_values_and_references() {
        let ign = CalibrationMap::linear(map_id("ign"), "Ignition", MapCategory::Ignition, vec![20.0, 21.0])
            .unwrap();
        let profile = Profile::v1(ProfileId::new("stage1").unwrap(), "Stage 1", "demo", vec![ign]).unwrap();
        let cs = Changeset::v1(
            ChangesetId(1),
            None,
            vec![
                MapChange::v1(map_id("ign"), None, Some(0), 20.0, 26.0, "advance").unwrap(),
                MapChange::v1(map_id("ign"), None, Some(1), 19.0, 22.0, "advance").unwrap(),
                MapChange::v1(map_id("ign"), None, Some(5), 0.0, 1.0, "oops").unwrap(),
                MapChange::v1(map_id("nope"), None, None, 0.0, 1.0, "oops").unwrap(),
            ],
            "tech",
            "",
            MonotonicTimeNs(1),
        )
        .unwrap();
        let r = validator().validate_changeset(&profile, &cs);
        let kinds: Vec<IssueKind> = r.errors.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                IssueKind::ExcessiveTiming,
                IssueKind::CellOutOfRange,
                IssueKind::UnknownMap
            ]
        );
        assert_eq!(r.warnings.len(), 1);
        assert_eq!(r.warnings[0].kind, IssueKind::StaleOldValue);
    }

    #[test]
    fn at_validator_06_diff_of_identical_maps_is_empty() {
        let map = CalibrationMap::table(map_id("fuel"), "Fuel", MapCategory::Fueling, 2, 2, vec![1.0, 2.0, 3.0, 4.0])
            .unwrap();
        assert!(diff_maps(&map, &map).is_empty());
    }

    #[test]
    fn at_validator_07_diff_reports_row_major_positions() {
        let a = CalibrationMap::table(map_id("fuel"), "Fuel", MapCategory::Fueling, 2, 2, vec![1.0, 2.0, 3.0, 4.0])
            .unwrap();
        let b = CalibrationMap::table(map_id("fuel"), "Fuel", MapCategory::Fueling, 2, 2, vec![1.0, 2.0, 3.5, 4.0])
            .unwrap();
        let d = diff_maps(&a, &b);
        assert_eq!(d.len(), 1);
        assert_eq!((d[0].position.row, d[0].position.col), (Some(1), Some(0)));
        assert_eq!((d[0].old_value, d[0].new_value), (3.0, 3.5));
    }

    #[test]
    fn at_validator_08_profile_diff_skips_shape_mismatch_and_missing_names() {
        let fuel_a = CalibrationMap::linear(map_id("fuel"), "Fuel", MapCategory::Fueling, vec![1.0, 2.0]).unwrap();
        let fuel_b = CalibrationMap::linear(map_id("fuel"), "Fuel", MapCategory::Fueling, vec![1.0, 2.0, 3.0])
            .unwrap();
        let ign_a = CalibrationMap::linear(map_id("ign"), "Ignition", MapCategory::Ignition, vec![10.0]).unwrap();
        let ign_b = CalibrationMap::linear(map_id("ign_v2"), "Ignition", MapCategory::Ignition, vec![12.0])
            .unwrap();
        let only_a = CalibrationMap::linear(map_id("lim"), "Limiter", MapCategory::Limiter, vec![7000.0]).unwrap();
        let a = Profile::v1(ProfileId::new("a").unwrap(), "A", "", vec![fuel_a, ign_a, only_a]).unwrap();
        let b = Profile::v1(ProfileId::new("b").unwrap(), "B", "", vec![fuel_b, ign_b]).unwrap();

        let report = diff_profiles(&a, &b, None);
        assert_eq!(report.total_changes, 1);
        assert_eq!(report.diffs[0].map_name, "Ignition");

        let filtered = diff_profiles(&a, &b, Some(&[map_id("fuel")]));
        assert_eq!(filtered.total_changes, 0);
    }
}
