#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use ecutune_kernel_contracts::calibration::{CalibrationMap, MapId, Profile};
use ecutune_kernel_contracts::changeset::{Changeset, ChangesetId, MapChange};
use ecutune_kernel_contracts::MonotonicTimeNs;

use crate::contract::EngineError;

/// Returns a copy of `profile` with every change written. The input is untouched.
pub fn apply_changeset(profile: &Profile, changeset: &Changeset) -> Result<Profile, EngineError> {
    let mut out = profile.clone();
    for change in &changeset.changes {
        let map = out
            .map_mut(&change.map_id)
            .ok_or_else(|| EngineError::MapNotFound(change.map_id.clone()))?;
        map.set_cell(change.row, change.col, change.new_value)?;
    }
    Ok(out)
}

pub fn bounds_error(map: &CalibrationMap, value: f64) -> EngineError {
    EngineError::OutOfBounds {
        value,
        min: map.min_value.unwrap_or(f64::NEG_INFINITY),
        max: map.max_value.unwrap_or(f64::INFINITY),
    }
}

/// The calibration a back-end holds: its working profile plus the changesets
/// created against it.
#[derive(Debug, Clone)]
pub struct CalibrationBook {
    profile: Profile,
    changesets: BTreeMap<ChangesetId, Arc<Changeset>>,
    next_changeset_id: u64,
}

impl CalibrationBook {
    pub fn new(profile: Profile) -> Self {
        Self {
            profile,
            changesets: BTreeMap::new(),
            next_changeset_id: 1,
        }
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    pub fn list_maps(&self) -> Vec<CalibrationMap> {
        self.profile.maps.clone()
    }

    pub fn get_map(&self, map_id: &MapId) -> Result<CalibrationMap, EngineError> {
        self.profile
            .map(map_id)
            .cloned()
            .ok_or_else(|| EngineError::MapNotFound(map_id.clone()))
    }

    pub fn update_map(
        &mut self,
        map_id: &MapId,
        row: Option<usize>,
        col: Option<usize>,
        value: f64,
    ) -> Result<CalibrationMap, EngineError> {
        let map = self
            .profile
            .map_mut(map_id)
            .ok_or_else(|| EngineError::MapNotFound(map_id.clone()))?;
        if !map.admits(value) {
            return Err(bounds_error(map, value));
        }
        map.set_cell(row, col, value)?;
        Ok(map.clone())
    }

    pub fn create_changeset(
        &mut self,
        changes: Vec<MapChange>,
        author: &str,
        notes: &str,
        created_at: MonotonicTimeNs,
    ) -> Result<Arc<Changeset>, EngineError> {
        for change in &changes {
            if self.profile.map(&change.map_id).is_none() {
                return Err(EngineError::MapNotFound(change.map_id.clone()));
            }
        }
        let id = ChangesetId(self.next_changeset_id);
        let changeset = Arc::new(Changeset::v1(
            id,
            Some(self.profile.id.clone()),
            changes,
            author,
            notes,
            created_at,
        )?);
        self.next_changeset_id += 1;
        self.changesets.insert(id, changeset.clone());
        Ok(changeset)
    }

    pub fn get_changeset(&self, changeset_id: ChangesetId) -> Result<Arc<Changeset>, EngineError> {
        self.changesets
            .get(&changeset_id)
            .cloned()
            .ok_or(EngineError::ChangesetNotFound(changeset_id))
    }

    pub fn list_changesets(&self) -> Vec<Arc<Changeset>> {
        self.changesets.values().cloned().collect()
    }
}
