//! Grid geometry and the raster types flowing through the engine.
//!
//! Heights and class rasters are `Array2<f32>` indexed `[row, col]` with row 0
//! at the northern edge. NoData is carried as NaN internally; the caller's
//! sentinel is restored by [`ClassRaster::to_sentinel_array`].

use ndarray::{Array2, ArrayView2, Zip};
use ndarray_stats::QuantileExt;

use crate::error::{Result, ShadeError};

/// Georeferencing of a north-up raster with square cells.
#[derive(Debug, Clone, PartialEq)]
pub struct GridGeometry {
    /// X coordinate of the upper-left corner.
    pub origin_x: f64,
    /// Y coordinate of the upper-left corner.
    pub origin_y: f64,
    /// Cell edge length in metres.
    pub cell_size: f64,
    pub rows: usize,
    pub cols: usize,
    /// Coordinate reference identifier, e.g. "EPSG:25832".
    pub crs: String,
}

impl GridGeometry {
    pub fn new(
        origin_x: f64,
        origin_y: f64,
        cell_size: f64,
        rows: usize,
        cols: usize,
        crs: impl Into<String>,
    ) -> Result<Self> {
        if !cell_size.is_finite() || cell_size <= 0.0 {
            return Err(ShadeError::InvalidRaster(format!(
                "cell size must be a positive finite number, got {cell_size}"
            )));
        }
        if rows == 0 || cols == 0 {
            return Err(ShadeError::InvalidRaster(format!(
                "raster must not be empty, got {rows}x{cols}"
            )));
        }
        if !origin_x.is_finite() || !origin_y.is_finite() {
            return Err(ShadeError::InvalidRaster("origin must be finite".into()));
        }
        Ok(Self {
            origin_x,
            origin_y,
            cell_size,
            rows,
            cols,
            crs: crs.into(),
        })
    }

    /// Geometry without georeferencing, for in-memory arrays.
    pub fn unreferenced(cell_size: f64, rows: usize, cols: usize) -> Result<Self> {
        Self::new(0.0, 0.0, cell_size, rows, cols, "")
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn cell_count(&self) -> usize {
        self.rows * self.cols
    }

    /// Fails with [`ShadeError::GeometryMismatch`] describing the first difference.
    pub fn ensure_matches(&self, other: &GridGeometry) -> Result<()> {
        if self.shape() != other.shape() {
            return Err(ShadeError::GeometryMismatch(format!(
                "expected {}x{} cells, got {}x{}",
                self.rows, self.cols, other.rows, other.cols
            )));
        }
        if (self.cell_size - other.cell_size).abs() > 1e-9 * self.cell_size {
            return Err(ShadeError::GeometryMismatch(format!(
                "expected cell size {}, got {}",
                self.cell_size, other.cell_size
            )));
        }
        let tol = 1e-6 * self.cell_size;
        if (self.origin_x - other.origin_x).abs() > tol
            || (self.origin_y - other.origin_y).abs() > tol
        {
            return Err(ShadeError::GeometryMismatch(format!(
                "expected origin ({}, {}), got ({}, {})",
                self.origin_x, self.origin_y, other.origin_x, other.origin_y
            )));
        }
        if self.crs != other.crs {
            return Err(ShadeError::GeometryMismatch(format!(
                "expected CRS '{}', got '{}'",
                self.crs, other.crs
            )));
        }
        Ok(())
    }
}

/// Above-ground obstacle heights on a fixed grid.
#[derive(Debug, Clone)]
pub struct HeightRaster {
    geometry: GridGeometry,
    cells: Array2<f32>,
    nodata: Option<f32>,
    max_height: f32,
    min_height: f32,
    nodata_count: usize,
    infinite_count: usize,
}

impl HeightRaster {
    /// Wraps `data`, converting cells equal to `nodata` (and any NaN) to NoData.
    pub fn new(geometry: GridGeometry, data: Array2<f32>, nodata: Option<f32>) -> Result<Self> {
        if data.dim() != geometry.shape() {
            return Err(ShadeError::InvalidRaster(format!(
                "height array is {:?} but geometry declares {}x{}",
                data.dim(),
                geometry.rows,
                geometry.cols
            )));
        }

        let mut cells = data;
        if let Some(sentinel) = nodata.filter(|s| !s.is_nan()) {
            cells.par_mapv_inplace(|v| if v == sentinel { f32::NAN } else { v });
        }

        let nodata_count = cells.iter().filter(|v| v.is_nan()).count();
        let infinite_count = cells.iter().filter(|v| v.is_infinite()).count();

        let (max_height, min_height) = if nodata_count == cells.len() {
            (f32::NAN, f32::NAN)
        } else {
            (*cells.max_skipnan(), *cells.min_skipnan())
        };

        Ok(Self {
            geometry,
            cells,
            nodata,
            max_height,
            min_height,
            nodata_count,
            infinite_count,
        })
    }

    pub fn geometry(&self) -> &GridGeometry {
        &self.geometry
    }

    pub fn cells(&self) -> ArrayView2<'_, f32> {
        self.cells.view()
    }

    pub fn shape(&self) -> (usize, usize) {
        self.geometry.shape()
    }

    pub fn cell_size(&self) -> f64 {
        self.geometry.cell_size
    }

    /// The caller's NoData sentinel, if one was declared.
    pub fn nodata(&self) -> Option<f32> {
        self.nodata
    }

    /// Height at `(row, col)`, or `None` for NoData.
    pub fn height(&self, row: usize, col: usize) -> Option<f32> {
        self.cells
            .get((row, col))
            .copied()
            .filter(|v| !v.is_nan())
    }

    pub fn nodata_count(&self) -> usize {
        self.nodata_count
    }

    pub fn infinite_count(&self) -> usize {
        self.infinite_count
    }

    /// Largest valid height, NaN when every cell is NoData.
    pub fn max_height(&self) -> f32 {
        self.max_height
    }

    /// Smallest valid height, NaN when every cell is NoData.
    pub fn min_height(&self) -> f32 {
        self.min_height
    }

    /// Highest obstacle a ray can meet. NoData reads as 0 along a ray, so it
    /// counts here when present.
    pub fn obstacle_ceiling(&self) -> f32 {
        if self.nodata_count > 0 {
            self.max_height.max(0.0)
        } else {
            self.max_height
        }
    }

    pub fn ensure_aligned(&self, expected: &GridGeometry) -> Result<()> {
        expected.ensure_matches(&self.geometry)
    }
}

/// Classified raster: 0 = sunlit, positive = protection class, NaN = NoData.
///
/// Used for shadow masks, direction-group maxima and the final protection
/// surface.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassRaster {
    geometry: GridGeometry,
    cells: Array2<f32>,
}

impl ClassRaster {
    pub fn new(geometry: GridGeometry, cells: Array2<f32>) -> Result<Self> {
        if cells.dim() != geometry.shape() {
            return Err(ShadeError::InvalidRaster(format!(
                "class array is {:?} but geometry declares {}x{}",
                cells.dim(),
                geometry.rows,
                geometry.cols
            )));
        }
        Ok(Self { geometry, cells })
    }

    /// Caller guarantees `cells` has the geometry's shape.
    pub(crate) fn from_parts(geometry: GridGeometry, cells: Array2<f32>) -> Self {
        debug_assert_eq!(cells.dim(), geometry.shape());
        Self { geometry, cells }
    }

    pub fn filled(geometry: GridGeometry, value: f32) -> Self {
        let cells = Array2::from_elem(geometry.shape(), value);
        Self { geometry, cells }
    }

    /// All-NoData raster.
    pub fn nodata(geometry: GridGeometry) -> Self {
        Self::filled(geometry, f32::NAN)
    }

    pub fn geometry(&self) -> &GridGeometry {
        &self.geometry
    }

    pub fn cells(&self) -> ArrayView2<'_, f32> {
        self.cells.view()
    }

    pub fn into_cells(self) -> Array2<f32> {
        self.cells
    }

    /// Class at `(row, col)`, or `None` for NoData.
    pub fn value(&self, row: usize, col: usize) -> Option<f32> {
        self.cells
            .get((row, col))
            .copied()
            .filter(|v| !v.is_nan())
    }

    pub fn nodata_count(&self) -> usize {
        self.cells.iter().filter(|v| v.is_nan()).count()
    }

    /// Number of cells whose class is at least `threshold`.
    pub fn count_at_least(&self, threshold: f32) -> usize {
        self.cells.iter().filter(|&&v| v >= threshold).count()
    }

    /// Copy of the cells with NoData written as `sentinel`.
    pub fn to_sentinel_array(&self, sentinel: f32) -> Array2<f32> {
        let mut out = self.cells.clone();
        out.par_mapv_inplace(|v| if v.is_nan() { sentinel } else { v });
        out
    }
}

/// Shadow of a single directive: 0 where sunlit, `severity` where shadowed.
#[derive(Debug, Clone, PartialEq)]
pub struct ShadowMask {
    severity: u32,
    raster: ClassRaster,
}

impl ShadowMask {
    /// Builds a mask from boolean shadow flags. Cells that are NoData in
    /// `heights` stay NoData regardless of their flag.
    pub fn from_flags(heights: &HeightRaster, flags: &Array2<bool>, severity: u32) -> Self {
        let class = severity as f32;
        let mut cells = Array2::<f32>::zeros(heights.shape());
        Zip::from(&mut cells)
            .and(flags)
            .and(heights.cells())
            .par_for_each(|out, &shadowed, &h| {
                *out = if h.is_nan() {
                    f32::NAN
                } else if shadowed {
                    class
                } else {
                    0.0
                };
            });
        Self {
            severity,
            raster: ClassRaster {
                geometry: heights.geometry().clone(),
                cells,
            },
        }
    }

    /// Wraps an already classified raster. Every valid cell must be 0 or `severity`.
    pub fn from_raster(raster: ClassRaster, severity: u32) -> Result<Self> {
        let class = severity as f32;
        if let Some(bad) = raster
            .cells
            .iter()
            .find(|&&v| !v.is_nan() && v != 0.0 && v != class)
        {
            return Err(ShadeError::InvalidRaster(format!(
                "shadow mask of class {severity} contains value {bad}"
            )));
        }
        Ok(Self { severity, raster })
    }

    pub fn severity(&self) -> u32 {
        self.severity
    }

    pub fn raster(&self) -> &ClassRaster {
        &self.raster
    }

    pub fn into_raster(self) -> ClassRaster {
        self.raster
    }

    pub fn geometry(&self) -> &GridGeometry {
        &self.raster.geometry
    }

    pub fn is_shadowed(&self, row: usize, col: usize) -> bool {
        self.raster.value(row, col).is_some_and(|v| v > 0.0)
    }

    pub fn is_nodata(&self, row: usize, col: usize) -> bool {
        self.raster.value(row, col).is_none()
    }

    pub fn shadowed_count(&self) -> usize {
        self.raster.cells.iter().filter(|&&v| v > 0.0).count()
    }

    /// Boolean view of the shadowed cells; NoData reads as not shadowed.
    pub fn flags(&self) -> Array2<bool> {
        self.raster.cells.mapv(|v| v > 0.0)
    }

    /// Same mask with the shadowed set replaced by `flags`; NoData cells stay NoData.
    pub(crate) fn with_flags(&self, flags: &Array2<bool>) -> ShadowMask {
        let class = self.severity as f32;
        let mut cells = self.raster.cells.clone();
        Zip::from(&mut cells).and(flags).par_for_each(|v, &shadowed| {
            if !v.is_nan() {
                *v = if shadowed { class } else { 0.0 };
            }
        });
        ShadowMask {
            severity: self.severity,
            raster: ClassRaster {
                geometry: self.raster.geometry.clone(),
                cells,
            },
        }
    }

    /// NoData cells of the mask.
    pub fn nodata_flags(&self) -> Array2<bool> {
        self.raster.cells.mapv(f32::is_nan)
    }

    /// Fraction of cells on which `self` and `other` agree on shadowed vs not.
    pub fn agreement(&self, other: &ShadowMask) -> f64 {
        let total = self.raster.cells.len();
        if total == 0 || self.raster.cells.dim() != other.raster.cells.dim() {
            return 0.0;
        }
        let same = Zip::from(&self.raster.cells)
            .and(&other.raster.cells)
            .fold(0usize, |acc, &a, &b| acc + usize::from((a > 0.0) == (b > 0.0)));
        same as f64 / total as f64
    }
}
