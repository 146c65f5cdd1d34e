#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::common::{string_id, validate_finite, validate_text};
use crate::{ContractViolation, SchemaVersion, Validate};

pub const CALIBRATION_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

string_id!(ProfileId, "profile_id", 64);
string_id!(MapId, "map_id", 64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MapCategory {
    Fueling,
    Ignition,
    Boost,
    CamTiming,
    Limiter,
    Other,
}

impl MapCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            MapCategory::Fueling => "FUELING",
            MapCategory::Ignition => "IGNITION",
            MapCategory::Boost => "BOOST",
            MapCategory::CamTiming => "CAM_TIMING",
            MapCategory::Limiter => "LIMITER",
            MapCategory::Other => "OTHER",
        }
    }

    pub fn all() -> [MapCategory; 6] {
        [
            MapCategory::Fueling,
            MapCategory::Ignition,
            MapCategory::Boost,
            MapCategory::CamTiming,
            MapCategory::Limiter,
            MapCategory::Other,
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisDef {
    pub name: String,
    pub unit: String,
    pub breakpoints: Vec<f64>,
}

impl AxisDef {
    pub fn new(
        name: impl Into<String>,
        unit: impl Into<String>,
        breakpoints: Vec<f64>,
    ) -> Result<Self, ContractViolation> {
        let axis = Self {
            name: name.into(),
            unit: unit.into(),
            breakpoints,
        };
        axis.validate()?;
        Ok(axis)
    }
}

impl Validate for AxisDef {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.name.trim().is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "axis_def.name",
                reason: "must not be empty",
            });
        }
        validate_text("axis_def.unit", &self.unit, 32)?;
        if self.breakpoints.is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "axis_def.breakpoints",
                reason: "must not be empty",
            });
        }
        for bp in &self.breakpoints {
            validate_finite("axis_def.breakpoints", *bp)?;
        }
        Ok(())
    }
}

/// Position of a single cell. `row`/`col` are set for tables, `index` is always the
/// row-major offset into the cell buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CellPosition {
    pub index: usize,
    pub row: Option<usize>,
    pub col: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GridShape {
    Linear(usize),
    Table { rows: usize, cols: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CellGrid {
    Linear(Vec<f64>),
    Table {
        rows: usize,
        cols: usize,
        cells: Vec<f64>,
    },
}

impl CellGrid {
    pub fn shape(&self) -> GridShape {
        match self {
            CellGrid::Linear(cells) => GridShape::Linear(cells.len()),
            CellGrid::Table { rows, cols, .. } => GridShape::Table {
                rows: *rows,
                cols: *cols,
            },
        }
    }

    pub fn cells(&self) -> &[f64] {
        match self {
            CellGrid::Linear(cells) => cells,
            CellGrid::Table { cells, .. } => cells,
        }
    }

    pub fn len(&self) -> usize {
        self.cells().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells().is_empty()
    }

    pub fn position(&self, index: usize) -> CellPosition {
        match self {
            CellGrid::Linear(_) => CellPosition {
                index,
                row: None,
                col: None,
            },
            CellGrid::Table { cols, .. } => CellPosition {
                index,
                row: Some(index / (*cols).max(1)),
                col: Some(index % (*cols).max(1)),
            },
        }
    }

    /// Resolves an edit address. Linear grids take the index from `col` (or `row`),
    /// tables need both coordinates.
    pub fn index_of(&self, row: Option<usize>, col: Option<usize>) -> Option<usize> {
        match self {
            CellGrid::Linear(cells) => {
                let idx = col.or(row).unwrap_or(0);
                (idx < cells.len()).then_some(idx)
            }
            CellGrid::Table { rows, cols, .. } => {
                let (r, c) = (row?, col?);
                (r < *rows && c < *cols).then_some(r * cols + c)
            }
        }
    }

    pub fn get(&self, row: Option<usize>, col: Option<usize>) -> Option<f64> {
        self.index_of(row, col).map(|idx| self.cells()[idx])
    }

    pub(crate) fn cells_mut(&mut self) -> &mut [f64] {
        match self {
            CellGrid::Linear(cells) => cells,
            CellGrid::Table { cells, .. } => cells,
        }
    }
}

impl Validate for CellGrid {
    fn validate(&self) -> Result<(), ContractViolation> {
        match self {
            CellGrid::Linear(cells) => {
                if cells.is_empty() {
                    return Err(ContractViolation::InvalidValue {
                        field: "cell_grid.cells",
                        reason: "linear grid must not be empty",
                    });
                }
            }
            CellGrid::Table { rows, cols, cells } => {
                if *rows == 0 || *cols == 0 {
                    return Err(ContractViolation::InvalidValue {
                        field: "cell_grid.shape",
                        reason: "table rows and cols must be > 0",
                    });
                }
                if rows.checked_mul(*cols) != Some(cells.len()) {
                    return Err(ContractViolation::InvalidValue {
                        field: "cell_grid.cells",
                        reason: "table must be rectangular (rows * cols cells)",
                    });
                }
            }
        }
        if self.len() > 65_536 {
            return Err(ContractViolation::InvalidValue {
                field: "cell_grid.cells",
                reason: "must be <= 65536 cells",
            });
        }
        for v in self.cells() {
            validate_finite("cell_grid.cells", *v)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationMap {
    pub schema_version: SchemaVersion,
    pub id: MapId,
    pub name: String,
    pub category: MapCategory,
    pub x_axis: Option<AxisDef>,
    pub y_axis: Option<AxisDef>,
    pub grid: CellGrid,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
    pub unit: String,
    /// Raw ROM units per engineering unit.
    pub conversion_factor: f64,
    pub rom_address: u32,
}

impl CalibrationMap {
    pub fn linear(
        id: MapId,
        name: impl Into<String>,
        category: MapCategory,
        cells: Vec<f64>,
    ) -> Result<Self, ContractViolation> {
        Self::from_grid(id, name.into(), category, CellGrid::Linear(cells))
    }

    pub fn table(
        id: MapId,
        name: impl Into<String>,
        category: MapCategory,
        rows: usize,
        cols: usize,
        cells: Vec<f64>,
    ) -> Result<Self, ContractViolation> {
        Self::from_grid(id, name.into(), category, CellGrid::Table { rows, cols, cells })
    }

    fn from_grid(
        id: MapId,
        name: String,
        category: MapCategory,
        grid: CellGrid,
    ) -> Result<Self, ContractViolation> {
        let m = Self {
            schema_version: CALIBRATION_CONTRACT_VERSION,
            id,
            name,
            category,
            x_axis: None,
            y_axis: None,
            grid,
            min_value: None,
            max_value: None,
            unit: String::new(),
            conversion_factor: 1.0,
            rom_address: 0,
        };
        m.validate()?;
        Ok(m)
    }

    pub fn with_bounds(
        mut self,
        min_value: Option<f64>,
        max_value: Option<f64>,
    ) -> Result<Self, ContractViolation> {
        self.min_value = min_value;
        self.max_value = max_value;
        self.validate()?;
        Ok(self)
    }

    pub fn with_unit(
        mut self,
        unit: impl Into<String>,
        conversion_factor: f64,
    ) -> Result<Self, ContractViolation> {
        self.unit = unit.into();
        self.conversion_factor = conversion_factor;
        self.validate()?;
        Ok(self)
    }

    pub fn with_axes(
        mut self,
        x_axis: Option<AxisDef>,
        y_axis: Option<AxisDef>,
    ) -> Result<Self, ContractViolation> {
        self.x_axis = x_axis;
        self.y_axis = y_axis;
        self.validate()?;
        Ok(self)
    }

    pub fn at_address(mut self, rom_address: u32) -> Self {
        self.rom_address = rom_address;
        self
    }

    /// Whether `value` lies within the declared bounds. Unset bounds are open.
    pub fn admits(&self, value: f64) -> bool {
        value.is_finite()
            && self.min_value.map_or(true, |min| value >= min)
            && self.max_value.map_or(true, |max| value <= max)
    }

    pub fn cell_count(&self) -> usize {
        self.grid.len()
    }

    /// Writes one cell and re-validates the grid. Only changeset application and
    /// bounds-checked map updates call this.
    pub fn set_cell(
        &mut self,
        row: Option<usize>,
        col: Option<usize>,
        value: f64,
    ) -> Result<f64, ContractViolation> {
        validate_finite("calibration_map.cell", value)?;
        let idx = self
            .grid
            .index_of(row, col)
            .ok_or(ContractViolation::InvalidValue {
                field: "calibration_map.cell",
                reason: "position outside grid",
            })?;
        let cells = self.grid.cells_mut();
        let old = cells[idx];
        cells[idx] = value;
        Ok(old)
    }
}

impl Validate for CalibrationMap {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != CALIBRATION_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "calibration_map.schema_version",
                reason: "must match CALIBRATION_CONTRACT_VERSION",
            });
        }
        self.id.validate()?;
        if self.name.trim().is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "calibration_map.name",
                reason: "must not be empty",
            });
        }
        validate_text("calibration_map.name", &self.name, 128)?;
        validate_text("calibration_map.unit", &self.unit, 32)?;
        self.grid.validate()?;

        if let Some(min) = self.min_value {
            validate_finite("calibration_map.min_value", min)?;
        }
        if let Some(max) = self.max_value {
            validate_finite("calibration_map.max_value", max)?;
        }
        if let (Some(min), Some(max)) = (self.min_value, self.max_value) {
            if min > max {
                return Err(ContractViolation::InvalidValue {
                    field: "calibration_map.min_value",
                    reason: "must be <= max_value",
                });
            }
        }
        if !self.conversion_factor.is_finite() || self.conversion_factor <= 0.0 {
            return Err(ContractViolation::InvalidValue {
                field: "calibration_map.conversion_factor",
                reason: "must be finite and > 0",
            });
        }

        let (expected_x, expected_y) = match self.grid.shape() {
            GridShape::Linear(len) => (len, None),
            GridShape::Table { rows, cols } => (cols, Some(rows)),
        };
        if let Some(x) = &self.x_axis {
            x.validate()?;
            if x.breakpoints.len() != expected_x {
                return Err(ContractViolation::InvalidValue {
                    field: "calibration_map.x_axis",
                    reason: "breakpoint count must match grid columns",
                });
            }
        }
        if let Some(y) = &self.y_axis {
            y.validate()?;
            if Some(y.breakpoints.len()) != expected_y {
                return Err(ContractViolation::InvalidValue {
                    field: "calibration_map.y_axis",
                    reason: "breakpoint count must match grid rows",
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub schema_version: SchemaVersion,
    pub id: ProfileId,
    pub name: String,
    pub vehicle: String,
    pub maps: Vec<CalibrationMap>,
}

impl Profile {
    pub fn v1(
        id: ProfileId,
        name: impl Into<String>,
        vehicle: impl Into<String>,
        maps: Vec<CalibrationMap>,
    ) -> Result<Self, ContractViolation> {
        let p = Self {
            schema_version: CALIBRATION_CONTRACT_VERSION,
            id,
            name: name.into(),
            vehicle: vehicle.into(),
            maps,
        };
        p.validate()?;
        Ok(p)
    }

    pub fn map(&self, map_id: &MapId) -> Option<&CalibrationMap> {
        self.maps.iter().find(|m| &m.id == map_id)
    }

    pub fn map_mut(&mut self, map_id: &MapId) -> Option<&mut CalibrationMap> {
        self.maps.iter_mut().find(|m| &m.id == map_id)
    }

    pub fn map_by_name(&self, name: &str) -> Option<&CalibrationMap> {
        self.maps.iter().find(|m| m.name == name)
    }
}

impl Validate for Profile {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != CALIBRATION_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "profile.schema_version",
                reason: "must match CALIBRATION_CONTRACT_VERSION",
            });
        }
        self.id.validate()?;
        if self.name.trim().is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "profile.name",
                reason: "must not be empty",
            });
        }
        validate_text("profile.vehicle", &self.vehicle, 256)?;
        if self.maps.len() > 512 {
            return Err(ContractViolation::InvalidValue {
                field: "profile.maps",
                reason: "must be <= 512 entries",
            });
        }
        let mut ids = BTreeSet::new();
        let mut names = BTreeSet::new();
        for m in &self.maps {
            m.validate()?;
            if !ids.insert(m.id.as_str()) {
                return Err(ContractViolation::InvalidValue {
                    field: "profile.maps",
                    reason: "map ids must be unique",
                });
            }
            if !names.insert(m.name.as_str()) {
                return Err(ContractViolation::InvalidValue {
                    field: "profile.maps",
                    reason: "map names must be unique",
                });
            }
        }
        Ok(())
    }
}
