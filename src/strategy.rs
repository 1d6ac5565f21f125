//! Strategy selection with ray-trace fallback.
//!
//! The primary strategy (the sweep by default) is tried first. Any failure,
//! or an output that does not fit the input, falls back to
//! [`RayTraceShading`]. A primary that reports itself unavailable stays
//! disabled for the rest of the controller's life.

use std::sync::atomic::{AtomicBool, Ordering};

use ndarray::Zip;
use tracing::{debug, warn};

use crate::config::{ShadeConfig, StrategyPreference};
use crate::directive::Directive;
use crate::error::{Result, ShadeError, StrategyFailure};
use crate::raster::{HeightRaster, ShadowMask};
use crate::raytrace::RayTraceShading;
use crate::shadowing::{ShadingStrategy, SweepShading};

/// Which strategy produced a mask.
#[derive(Debug, Clone, PartialEq)]
pub enum StrategyUsed {
    Primary,
    /// Ray tracing without a primary attempt: no primary configured, or it
    /// was disabled earlier in the run.
    RayTrace,
    Fallback { reason: StrategyFailure },
}

#[derive(Debug, Clone)]
pub struct ShadeOutcome {
    pub mask: ShadowMask,
    pub used: StrategyUsed,
}

pub struct StrategyController {
    primary: Option<Box<dyn ShadingStrategy>>,
    fallback: RayTraceShading,
    primary_disabled: AtomicBool,
}

impl Default for StrategyController {
    fn default() -> Self {
        Self::with_primary(Box::new(SweepShading::default()))
    }
}

impl StrategyController {
    pub fn from_config(config: &ShadeConfig) -> Self {
        match config.strategy {
            StrategyPreference::LibraryFirst => {
                Self::with_primary(Box::new(SweepShading::new(config.sweep_cell_budget)))
            }
            StrategyPreference::RayTraceOnly => Self::ray_trace_only(),
        }
    }

    pub fn with_primary(primary: Box<dyn ShadingStrategy>) -> Self {
        Self {
            primary: Some(primary),
            fallback: RayTraceShading,
            primary_disabled: AtomicBool::new(false),
        }
    }

    pub fn ray_trace_only() -> Self {
        Self {
            primary: None,
            fallback: RayTraceShading,
            primary_disabled: AtomicBool::new(false),
        }
    }

    pub fn primary_name(&self) -> Option<&'static str> {
        self.primary.as_ref().map(|p| p.name())
    }

    pub fn is_primary_disabled(&self) -> bool {
        self.primary_disabled.load(Ordering::Relaxed)
    }

    /// Computes the mask of one directive, falling back to ray tracing when
    /// the primary strategy fails. Only a failure of the fallback is an error.
    pub fn select_and_run(&self, heights: &HeightRaster, directive: &Directive) -> Result<ShadeOutcome> {
        let reason = match self.primary.as_deref() {
            Some(primary) if !self.is_primary_disabled() => {
                match primary
                    .shade(heights, directive)
                    .and_then(|mask| validate_output(heights, directive, mask))
                {
                    Ok(mask) => {
                        debug!(directive = directive.label(), strategy = primary.name(), "mask computed");
                        return Ok(ShadeOutcome {
                            mask,
                            used: StrategyUsed::Primary,
                        });
                    }
                    Err(failure) => {
                        warn!(
                            directive = directive.label(),
                            strategy = primary.name(),
                            %failure,
                            "primary strategy failed, falling back to ray tracing"
                        );
                        if matches!(failure, StrategyFailure::Unavailable(_)) {
                            self.primary_disabled.store(true, Ordering::Relaxed);
                            warn!(strategy = primary.name(), "primary strategy disabled for this run");
                        }
                        Some(failure)
                    }
                }
            }
            _ => None,
        };

        let mask = self
            .fallback
            .shade(heights, directive)
            .map_err(|failure| ShadeError::Compute {
                label: directive.label().to_string(),
                reason: failure.to_string(),
            })?;

        let used = match reason {
            Some(reason) => StrategyUsed::Fallback { reason },
            None => StrategyUsed::RayTrace,
        };
        Ok(ShadeOutcome { mask, used })
    }
}

/// Checks a primary's mask against the input: same grid, the directive's
/// class, and NoData exactly where the heights are NoData.
fn validate_output(
    heights: &HeightRaster,
    directive: &Directive,
    mask: ShadowMask,
) -> std::result::Result<ShadowMask, StrategyFailure> {
    heights
        .geometry()
        .ensure_matches(mask.geometry())
        .map_err(|e| StrategyFailure::InvalidOutput(e.to_string()))?;

    if mask.severity() != directive.severity_class() {
        return Err(StrategyFailure::InvalidOutput(format!(
            "mask class {} differs from directive class {}",
            mask.severity(),
            directive.severity_class()
        )));
    }

    let class = directive.severity_class() as f32;
    let misplaced = Zip::from(heights.cells())
        .and(mask.raster().cells())
        .fold(0usize, |acc, &h, &m| {
            let ok = if h.is_nan() {
                m.is_nan()
            } else {
                m == 0.0 || m == class
            };
            acc + usize::from(!ok)
        });
    if misplaced > 0 {
        return Err(StrategyFailure::InvalidOutput(format!(
            "{misplaced} cells disagree with the input NoData layout"
        )));
    }
    Ok(mask)
}
