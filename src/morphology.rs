//! Morphological post-processing of shadow masks.
//!
//! Dilation uses slice-based shift-and-OR: for each offset of the
//! structuring element, shift the whole grid and OR into the result. A margin
//! of k is k passes of the element.

use ndarray::{s, Array2, ArrayView2, Zip};

use crate::config::Neighborhood;
use crate::raster::{HeightRaster, ShadowMask};

const CHEBYSHEV: [(isize, isize); 9] = [
    (-1, -1),
    (-1, 0),
    (-1, 1),
    (0, -1),
    (0, 0),
    (0, 1),
    (1, -1),
    (1, 0),
    (1, 1),
];

const VON_NEUMANN: [(isize, isize); 5] = [(-1, 0), (0, -1), (0, 0), (0, 1), (1, 0)];

const SQUARE_2: [(isize, isize); 4] = [(0, 0), (0, 1), (1, 0), (1, 1)];
const SQUARE_2_REFLECTED: [(isize, isize); 4] = [(0, 0), (0, -1), (-1, 0), (-1, -1)];

fn structure_offsets(neighborhood: Neighborhood) -> &'static [(isize, isize)] {
    match neighborhood {
        Neighborhood::Chebyshev => &CHEBYSHEV,
        Neighborhood::VonNeumann => &VON_NEUMANN,
        Neighborhood::Square2 => &SQUARE_2,
    }
}

// point reflection of the element; only the 2×2 block is asymmetric
fn reflected_offsets(neighborhood: Neighborhood) -> &'static [(isize, isize)] {
    match neighborhood {
        Neighborhood::Square2 => &SQUARE_2_REFLECTED,
        other => structure_offsets(other),
    }
}

/// Source start, destination start and length for moving values by `offset`
/// along an axis of `size` cells. `None` when nothing overlaps.
#[inline]
pub(crate) fn shift_range(offset: isize, size: usize) -> Option<(usize, usize, usize)> {
    let mag = offset.unsigned_abs();
    if mag >= size {
        return None;
    }
    if offset >= 0 {
        Some((0, mag, size - mag))
    } else {
        Some((mag, 0, size - mag))
    }
}

/// Binary dilation, `iterations` passes of the element. Cells outside the
/// grid count as unset.
pub fn binary_dilation(
    input: ArrayView2<bool>,
    neighborhood: Neighborhood,
    iterations: usize,
) -> Array2<bool> {
    shift_or(input, structure_offsets(neighborhood), iterations)
}

fn shift_or(input: ArrayView2<bool>, offsets: &[(isize, isize)], iterations: usize) -> Array2<bool> {
    let (rows, cols) = input.dim();
    let mut current = input.to_owned();

    for _ in 0..iterations {
        let mut next = Array2::<bool>::from_elem((rows, cols), false);
        for &(dr, dc) in offsets {
            let (Some((src_r, dst_r, h)), Some((src_c, dst_c, w))) =
                (shift_range(dr, rows), shift_range(dc, cols))
            else {
                continue;
            };
            Zip::from(next.slice_mut(s![dst_r..dst_r + h, dst_c..dst_c + w]))
                .and(current.slice(s![src_r..src_r + h, src_c..src_c + w]))
                .for_each(|dst, &src| *dst |= src);
        }
        current = next;
    }
    current
}

/// Binary erosion as the complement of the dilated complement; cells outside
/// the grid count as set.
pub fn binary_erosion(
    input: ArrayView2<bool>,
    neighborhood: Neighborhood,
    iterations: usize,
) -> Array2<bool> {
    let inverted = input.mapv(|v| !v);
    let mut out = shift_or(inverted.view(), reflected_offsets(neighborhood), iterations);
    out.mapv_inplace(|v| !v);
    out
}

/// Grows the shadowed region by `margin` cells. `margin == 0` returns the
/// mask unchanged; NoData cells stay NoData.
pub fn dilate(mask: &ShadowMask, margin: usize, neighborhood: Neighborhood) -> ShadowMask {
    if margin == 0 {
        return mask.clone();
    }
    let grown = binary_dilation(mask.flags().view(), neighborhood, margin);
    mask.with_flags(&grown)
}

/// Closing (dilate, then erode): fills lit holes and notches narrower than
/// the element.
pub fn close_gaps(mask: &ShadowMask, neighborhood: Neighborhood) -> ShadowMask {
    let dilated = binary_dilation(mask.flags().view(), neighborhood, 1);
    let closed = binary_erosion(dilated.view(), neighborhood, 1);
    mask.with_flags(&closed)
}

/// Marks every obstacle cell (height > 0) as shadowed.
pub fn stamp_obstacles(mask: &ShadowMask, heights: &HeightRaster) -> ShadowMask {
    let mut flags = mask.flags();
    Zip::from(&mut flags)
        .and(heights.cells())
        .for_each(|f, &h| *f |= h > 0.0);
    mask.with_flags(&flags)
}

#[cfg(feature = "python")]
pub use self::python::dilate_mask;

#[cfg(feature = "python")]
mod python {
    use numpy::{IntoPyArray, PyArray2, PyReadonlyArray2};
    use pyo3::prelude::*;

    use super::dilate;
    use crate::config::Neighborhood;
    use crate::raster::{ClassRaster, GridGeometry, ShadowMask};

    /// Fat-shadow dilation of a single-class mask (PyO3 wrapper).
    ///
    /// Args:
    ///     mask: 2D float32 array, 0 = sunlit, class value = shadowed, NaN = NoData.
    ///     margin: Dilation radius in cells.
    ///     four_connected: Use the 4-connected element instead of 8-connected.
    ///
    /// Returns:
    ///     Dilated mask with the same class value.
    #[pyfunction]
    #[pyo3(signature = (mask, margin, four_connected=false))]
    pub fn dilate_mask(
        py: Python<'_>,
        mask: PyReadonlyArray2<f32>,
        margin: usize,
        four_connected: bool,
    ) -> PyResult<Py<PyArray2<f32>>> {
        let cells = mask.as_array().to_owned();
        let (rows, cols) = cells.dim();
        let severity = cells
            .iter()
            .copied()
            .filter(|v| !v.is_nan())
            .fold(0.0_f32, f32::max)
            .max(1.0) as u32;
        let geometry = GridGeometry::unreferenced(1.0, rows, cols)?;
        let raster = ClassRaster::new(geometry, cells)?;
        let mask = ShadowMask::from_raster(raster, severity)?;
        let neighborhood = if four_connected {
            Neighborhood::VonNeumann
        } else {
            Neighborhood::Chebyshev
        };
        let out = py.allow_threads(|| dilate(&mask, margin, neighborhood));
        Ok(out.into_raster().into_cells().into_pyarray(py).unbind())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::GridGeometry;
    use ndarray::array;

    fn heights(data: Array2<f32>) -> HeightRaster {
        let (rows, cols) = data.dim();
        HeightRaster::new(GridGeometry::unreferenced(1.0, rows, cols).unwrap(), data, None).unwrap()
    }

    fn point_mask(rows: usize, cols: usize, r: usize, c: usize) -> ShadowMask {
        let h = heights(Array2::zeros((rows, cols)));
        let mut flags = Array2::from_elem((rows, cols), false);
        flags[[r, c]] = true;
        ShadowMask::from_flags(&h, &flags, 2)
    }

    #[test]
    fn test_shift_range() {
        assert_eq!(shift_range(0, 5), Some((0, 0, 5)));
        assert_eq!(shift_range(2, 5), Some((0, 2, 3)));
        assert_eq!(shift_range(-2, 5), Some((2, 0, 3)));
        assert_eq!(shift_range(5, 5), None);
        assert_eq!(shift_range(-7, 5), None);
    }

    #[test]
    fn test_dilate_zero_is_identity() {
        let mask = point_mask(5, 5, 2, 2);
        assert_eq!(dilate(&mask, 0, Neighborhood::Chebyshev), mask);
    }

    #[test]
    fn test_dilate_shapes() {
        let mask = point_mask(7, 7, 3, 3);
        let square = dilate(&mask, 2, Neighborhood::Chebyshev);
        assert_eq!(square.shadowed_count(), 25);
        assert!(square.is_shadowed(1, 1));
        assert_eq!(square.raster().value(5, 5), Some(2.0));

        let diamond = dilate(&mask, 2, Neighborhood::VonNeumann);
        assert_eq!(diamond.shadowed_count(), 13);
        assert!(!diamond.is_shadowed(1, 1));
        assert!(diamond.is_shadowed(1, 3));

        let block = dilate(&mask, 2, Neighborhood::Square2);
        assert_eq!(block.shadowed_count(), 9);
        for r in 0..7 {
            for c in 0..7 {
                let expected = (3..=5).contains(&r) && (3..=5).contains(&c);
                assert_eq!(block.is_shadowed(r, c), expected, "cell ({r}, {c})");
            }
        }
    }

    #[test]
    fn test_dilate_is_monotonic() {
        let mask = point_mask(9, 9, 1, 6);
        for nb in [Neighborhood::Chebyshev, Neighborhood::VonNeumann, Neighborhood::Square2] {
            let mut prev = dilate(&mask, 0, nb);
            for k in 1..5 {
                let next = dilate(&mask, k, nb);
                Zip::from(&prev.flags())
                    .and(&next.flags())
                    .for_each(|&a, &b| assert!(!a || b));
                prev = next;
            }
        }
    }

    #[test]
    fn test_dilate_keeps_nodata() {
        let h = heights(array![[0.0, f32::NAN, 0.0], [0.0, 0.0, 0.0]]);
        let flags = array![[true, false, false], [false, false, false]];
        let mask = ShadowMask::from_flags(&h, &flags, 1);
        let grown = dilate(&mask, 1, Neighborhood::Chebyshev);
        assert!(grown.is_nodata(0, 1));
        assert!(grown.is_shadowed(1, 1));
        assert!(!grown.is_shadowed(1, 2));
    }

    #[test]
    fn test_close_gaps_fills_hole() {
        let h = heights(Array2::zeros((5, 5)));
        let mut flags = Array2::from_elem((5, 5), false);
        flags.slice_mut(s![1..4, 1..4]).fill(true);
        flags[[2, 2]] = false;
        let mask = ShadowMask::from_flags(&h, &flags, 1);
        let closed = close_gaps(&mask, Neighborhood::Chebyshev);
        assert!(closed.is_shadowed(2, 2));
        assert_eq!(closed.shadowed_count(), 9);

        // the 2×2 closing fills the hole without shifting the block
        let h = heights(Array2::zeros((7, 7)));
        let mut flags = Array2::from_elem((7, 7), false);
        flags.slice_mut(s![1..4, 1..4]).fill(true);
        flags[[2, 2]] = false;
        let mask = ShadowMask::from_flags(&h, &flags, 1);
        let closed = close_gaps(&mask, Neighborhood::Square2);
        flags[[2, 2]] = true;
        assert_eq!(closed.flags(), flags);
    }

    #[test]
    fn test_stamp_obstacles() {
        let h = heights(array![[0.0, 4.0], [0.0, 0.5]]);
        let mask = ShadowMask::from_flags(&h, &Array2::from_elem((2, 2), false), 5);
        let stamped = stamp_obstacles(&mask, &h);
        assert!(stamped.is_shadowed(0, 1));
        assert!(stamped.is_shadowed(1, 1));
        assert!(!stamped.is_shadowed(0, 0));
    }
}
