//! Run configuration, passed explicitly to every computation.

use serde::{Deserialize, Serialize};

use crate::error::{Result, ShadeError};

/// Structuring element used to grow shadow masks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Neighborhood {
    /// 8-connected: a margin of k grows a (2k+1)×(2k+1) square.
    #[default]
    Chebyshev,
    /// 4-connected: a margin of k grows a diamond of Manhattan radius k.
    VonNeumann,
    /// 2×2 block: a margin of k grows a (k+1)×(k+1) square extending south
    /// and east of each cell.
    Square2,
}

/// Which shading implementation the controller tries first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyPreference {
    /// Library-backed sweep first, ray tracing on failure.
    #[default]
    LibraryFirst,
    /// Ray tracing only.
    RayTraceOnly,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ShadeConfig {
    /// Fat-shadow margin in cells; 0 disables dilation.
    pub dilation_margin: usize,
    pub neighborhood: Neighborhood,
    /// 3×3 closing of each mask before dilation, filling single-cell holes.
    pub close_gaps: bool,
    /// Treat NoData as sunlit during aggregation instead of propagating it.
    pub ignore_nodata: bool,
    pub strategy: StrategyPreference,
    /// Maximum cell-steps (cells × ray steps) the sweep strategy may take.
    pub sweep_cell_budget: Option<u64>,
    /// Masks of this class also mark every obstacle cell (height > 0) as shadowed.
    pub obstacle_class: Option<u32>,
}

impl Default for ShadeConfig {
    fn default() -> Self {
        Self {
            dilation_margin: 0,
            neighborhood: Neighborhood::Chebyshev,
            close_gaps: false,
            ignore_nodata: false,
            strategy: StrategyPreference::LibraryFirst,
            sweep_cell_budget: None,
            obstacle_class: None,
        }
    }
}

impl ShadeConfig {
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: ShadeConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sweep_cell_budget == Some(0) {
            return Err(ShadeError::InvalidConfig(
                "sweep_cell_budget must be positive when set".into(),
            ));
        }
        if self.obstacle_class == Some(0) {
            return Err(ShadeError::InvalidConfig(
                "obstacle_class must be a positive class".into(),
            ));
        }
        Ok(())
    }
}
