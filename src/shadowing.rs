//! Directional horizon-scan shading.
//!
//! A cell is shadowed for a directive when some cell along the precomputed
//! upwind ray rises to or above the sightline leaving the cell at the
//! directive's altitude:
//!
//! ```text
//! obstacle >= origin + distance * tan(altitude)
//! ```
//!
//! NoData along the ray reads as height 0; a NoData origin yields NoData.
//! [`SweepShading`] evaluates the predicate one ray step at a time over the
//! whole grid with shifted array slices, and [`crate::raytrace::RayTraceShading`]
//! marches each cell independently. Both walk the same [`RayPath`], so they
//! produce identical masks.

use ndarray::{par_azip, s, Array2};

use crate::directive::Directive;
use crate::error::StrategyFailure;
use crate::morphology::shift_range;
use crate::raster::{HeightRaster, ShadowMask};
use crate::raypath::RayPath;

/// A way of computing the shadow mask of one directive.
///
/// Implementations report recoverable problems as [`StrategyFailure`] so the
/// caller can fall back to another strategy.
pub trait ShadingStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn shade(
        &self,
        heights: &HeightRaster,
        directive: &Directive,
    ) -> Result<ShadowMask, StrategyFailure>;
}

/// Obstacle test shared by every strategy. NoData obstacles read as ground.
#[inline(always)]
pub(crate) fn blocks(obstacle: f32, sightline: f64) -> bool {
    let h = if obstacle.is_nan() {
        0.0
    } else {
        f64::from(obstacle)
    };
    h >= sightline
}

/// Per-directive scan parameters.
pub(crate) struct HorizonScan {
    pub tan_altitude: f64,
    /// Upwind ray, cut where no obstacle can reach the sightline.
    pub path: RayPath,
    /// Highest obstacle a ray can meet.
    pub ceiling: f64,
}

impl HorizonScan {
    /// `None` when nothing can be shadowed: vertical sightline or an
    /// all-NoData raster.
    pub fn prepare(
        heights: &HeightRaster,
        directive: &Directive,
    ) -> Result<Option<Self>, StrategyFailure> {
        if directive.is_vertical() {
            return Ok(None);
        }
        let ceiling = f64::from(heights.obstacle_ceiling());
        if ceiling.is_nan() {
            return Ok(None);
        }

        let tan_altitude = directive.altitude_deg().to_radians().tan();
        if !tan_altitude.is_finite() {
            return Err(StrategyFailure::Runtime(format!(
                "tan({}°) is not finite",
                directive.altitude_deg()
            )));
        }

        let (rows, cols) = heights.shape();
        let mut path = RayPath::for_grid(directive.bearing_deg(), heights.cell_size(), rows, cols);
        if let Some(step) = path.steps().iter().find(|s| !s.distance.is_finite()) {
            return Err(StrategyFailure::Runtime(format!(
                "ray distance overflow at offset ({}, {})",
                step.dr, step.dc
            )));
        }

        let rise = ceiling - f64::from(heights.min_height());
        if !rise.is_nan() {
            // slack keeps steps whose sightline ties the ceiling after rounding
            let slack = 4.0 * f64::EPSILON * rise.abs().max(1.0);
            path.truncate_to_reach(tan_altitude, rise + slack);
        }

        Ok(Some(Self {
            tan_altitude,
            path,
            ceiling,
        }))
    }
}

/// Whole-grid sweep: for every ray step, compare the grid against itself
/// shifted by that step.
///
/// Work is `ray steps × cells`. Rejects non-finite heights and, when a cell
/// budget is set, inputs whose work exceeds it.
#[derive(Debug, Clone, Default)]
pub struct SweepShading {
    pub cell_budget: Option<u64>,
}

impl SweepShading {
    pub fn new(cell_budget: Option<u64>) -> Self {
        Self { cell_budget }
    }
}

impl ShadingStrategy for SweepShading {
    fn name(&self) -> &'static str {
        "sweep"
    }

    fn shade(
        &self,
        heights: &HeightRaster,
        directive: &Directive,
    ) -> Result<ShadowMask, StrategyFailure> {
        if heights.infinite_count() > 0 {
            return Err(StrategyFailure::InvalidInput(format!(
                "{} cells hold infinite heights",
                heights.infinite_count()
            )));
        }

        let (rows, cols) = heights.shape();
        let mut flags = Array2::<bool>::from_elem((rows, cols), false);

        let Some(scan) = HorizonScan::prepare(heights, directive)? else {
            return Ok(ShadowMask::from_flags(
                heights,
                &flags,
                directive.severity_class(),
            ));
        };

        if let Some(budget) = self.cell_budget {
            let work = (scan.path.len() as u64).saturating_mul(heights.geometry().cell_count() as u64);
            if work > budget {
                return Err(StrategyFailure::Unsupported(format!(
                    "{work} cell-steps exceed the sweep budget of {budget}"
                )));
            }
        }

        let cells = heights.cells();
        for step in scan.path.steps() {
            let t = step.distance * scan.tan_altitude;
            // origin (r, c) reads its obstacle at (r + dr, c + dc)
            let Some((src_r, dst_r, h)) = shift_range(-step.dr, rows) else {
                break;
            };
            let Some((src_c, dst_c, w)) = shift_range(-step.dc, cols) else {
                break;
            };
            let obstacles = cells.slice(s![src_r..src_r + h, src_c..src_c + w]);
            let origins = cells.slice(s![dst_r..dst_r + h, dst_c..dst_c + w]);
            let mut out = flags.slice_mut(s![dst_r..dst_r + h, dst_c..dst_c + w]);

            par_azip!((f in &mut out, &origin in &origins, &obstacle in &obstacles) {
                if !*f && !origin.is_nan() {
                    *f = blocks(obstacle, f64::from(origin) + t);
                }
            });
        }

        Ok(ShadowMask::from_flags(
            heights,
            &flags,
            directive.severity_class(),
        ))
    }
}

#[cfg(feature = "python")]
pub use self::python::compute_shadow_mask;

#[cfg(feature = "python")]
mod python {
    use numpy::{IntoPyArray, PyArray2, PyReadonlyArray2};
    use pyo3::prelude::*;

    use crate::config::Neighborhood;
    use crate::directive::Directive;
    use crate::morphology::dilate;
    use crate::raster::{GridGeometry, HeightRaster};
    use crate::strategy::StrategyController;

    #[allow(clippy::too_many_arguments)]
    #[pyfunction]
    #[pyo3(signature = (heights, cell_size, bearing_deg, altitude_deg, severity_class=1, nodata=None, dilation_margin=0))]
    /// Shadow mask of a single wind direction (Python wrapper).
    ///
    /// # Arguments
    /// * `heights` - Above-ground obstacle heights (metres), row 0 = north
    /// * `cell_size` - Cell edge length (metres)
    /// * `bearing_deg` - Direction the wind comes from (0=N, 90=E)
    /// * `altitude_deg` - Sightline elevation in (0, 90]
    /// * `severity_class` - Value written to shadowed cells
    /// * `nodata` - Optional NoData sentinel, restored in the output
    /// * `dilation_margin` - Optional fat-shadow margin in cells
    ///
    /// # Returns
    /// * float32 mask: 0 sunlit, `severity_class` shadowed
    pub fn compute_shadow_mask(
        py: Python<'_>,
        heights: PyReadonlyArray2<f32>,
        cell_size: f64,
        bearing_deg: f64,
        altitude_deg: f64,
        severity_class: u32,
        nodata: Option<f32>,
        dilation_margin: usize,
    ) -> PyResult<Py<PyArray2<f32>>> {
        let data = heights.as_array().to_owned();
        let (rows, cols) = data.dim();
        let geometry = GridGeometry::unreferenced(cell_size, rows, cols)?;
        let raster = HeightRaster::new(geometry, data, nodata)?;
        let directive = Directive::new("python", bearing_deg, altitude_deg, severity_class)?;

        let mask = py.allow_threads(|| {
            StrategyController::default()
                .select_and_run(&raster, &directive)
                .map(|outcome| dilate(&outcome.mask, dilation_margin, Neighborhood::Chebyshev))
        })?;

        let out = match nodata {
            Some(sentinel) => mask.raster().to_sentinel_array(sentinel),
            None => mask.into_raster().into_cells(),
        };
        Ok(out.into_pyarray(py).unbind())
    }
}
