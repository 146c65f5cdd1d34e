#![forbid(unsafe_code)]

use ecutune_kernel_contracts::calibration::{MapCategory, MapId, Profile, ProfileId};
use ecutune_kernel_contracts::changeset::Changeset;
use serde::{Deserialize, Serialize};

use crate::book::apply_changeset;
use crate::contract::EngineError;
use crate::validator::{diff_maps, CalibrationValidator};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeDirection {
    Increase,
    Decrease,
    Mixed,
}

impl ChangeDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeDirection::Increase => "INCREASE",
            ChangeDirection::Decrease => "DECREASE",
            ChangeDirection::Mixed => "MIXED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapEffect {
    pub map_id: MapId,
    pub map_name: String,
    pub category: MapCategory,
    pub direction: ChangeDirection,
    pub cells_changed: usize,
    pub mean_delta: f64,
    pub max_abs_delta: f64,
    pub effect: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationReport {
    pub profile_id: ProfileId,
    pub effects: Vec<MapEffect>,
    pub warnings: Vec<String>,
    pub recommendations: Vec<String>,
}

/// Predicts the effect of a changeset on a profile without touching any vehicle.
#[derive(Debug, Clone)]
pub struct SimulationEngine {
    validator: CalibrationValidator,
}

impl SimulationEngine {
    pub fn new(validator: CalibrationValidator) -> Self {
        Self { validator }
    }

    pub fn run(
        &self,
        profile: &Profile,
        changeset: Option<&Changeset>,
    ) -> Result<SimulationReport, EngineError> {
        let (target, validation) = match changeset {
            Some(cs) => (
                apply_changeset(profile, cs)?,
                self.validator.validate_changeset(profile, cs),
            ),
            None => (profile.clone(), self.validator.validate_profile(profile)),
        };

        let mut effects = Vec::new();
        for (before, after) in profile.maps.iter().zip(&target.maps) {
            let diffs = diff_maps(before, after);
            if diffs.is_empty() {
                continue;
            }
            let deltas: Vec<f64> = diffs.iter().map(|d| d.new_value - d.old_value).collect();
            let direction = if deltas.iter().all(|d| *d > 0.0) {
                ChangeDirection::Increase
            } else if deltas.iter().all(|d| *d < 0.0) {
                ChangeDirection::Decrease
            } else {
                ChangeDirection::Mixed
            };
            let mean_delta = deltas.iter().sum::<f64>() / deltas.len() as f64;
            let max_abs_delta = deltas.iter().fold(0.0_f64, |acc, d| acc.max(d.abs()));
            effects.push(MapEffect {
                map_id: before.id.clone(),
                map_name: before.name.clone(),
                category: before.category,
                direction,
                cells_changed: diffs.len(),
                mean_delta,
                max_abs_delta,
                effect: effect_wording(before.category, direction).to_string(),
            });
        }

        let mut warnings: Vec<String> = validation
            .errors
            .iter()
            .chain(&validation.warnings)
            .map(|issue| issue.message.clone())
            .collect();
        if effects.is_empty() && changeset.is_some() {
            warnings.push("changeset produces no cell changes".to_string());
        }

        let mut recommendations = Vec::new();
        if !validation.valid {
            recommendations.push("Resolve validation errors before any live apply or flash.".to_string());
        }
        for e in &effects {
            if let Some(r) = recommendation(e.category, e.direction) {
                if !recommendations.iter().any(|x| x == r) {
                    recommendations.push(r.to_string());
                }
            }
        }

        Ok(SimulationReport {
            profile_id: profile.id.clone(),
            effects,
            warnings,
            recommendations,
        })
    }
}

fn effect_wording(category: MapCategory, direction: ChangeDirection) -> &'static str {
    match (category, direction) {
        (MapCategory::Fueling, ChangeDirection::Increase) => "richer mixture; lower combustion temperature",
        (MapCategory::Fueling, ChangeDirection::Decrease) => "leaner mixture; watch AFR under load",
        (MapCategory::Ignition, ChangeDirection::Increase) => "more advance; higher torque and knock risk",
        (MapCategory::Ignition, ChangeDirection::Decrease) => "timing retarded; lower knock risk and power",
        (MapCategory::Boost, ChangeDirection::Increase) => "higher manifold pressure and cylinder load",
        (MapCategory::Boost, ChangeDirection::Decrease) => "reduced manifold pressure and torque",
        (MapCategory::CamTiming, _) => "valve overlap shifts; idle and spool behavior change",
        (MapCategory::Limiter, ChangeDirection::Increase) => "protection limit raised",
        (MapCategory::Limiter, ChangeDirection::Decrease) => "protection limit lowered",
        (_, ChangeDirection::Mixed) => "mixed adjustment across the map",
        (MapCategory::Other, _) => "calibration value adjusted",
    }
}

fn recommendation(category: MapCategory, direction: ChangeDirection) -> Option<&'static str> {
    match (category, direction) {
        (MapCategory::Ignition, ChangeDirection::Increase | ChangeDirection::Mixed) => {
            Some("Log knock under load before committing ignition advance.")
        }
        (MapCategory::Boost, ChangeDirection::Increase | ChangeDirection::Mixed) => {
            Some("Confirm fueling headroom and wastegate control for the added boost.")
        }
        (MapCategory::Fueling, ChangeDirection::Decrease | ChangeDirection::Mixed) => {
            Some("Verify wideband AFR stays above the lean limit at full load.")
        }
        (MapCategory::Limiter, ChangeDirection::Increase) => {
            Some("Check mechanical limits before raising a limiter.")
        }
        _ => None,
    }
}
