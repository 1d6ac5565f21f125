//! Per-cell ray marching, the fallback shading strategy.
//!
//! Each origin cell walks the shared upwind [`RayPath`](crate::raypath::RayPath)
//! until it hits an obstacle, leaves the grid, or its sightline climbs above
//! the tallest obstacle. Cells are independent and processed in parallel.

use ndarray::{Array2, Zip};

use crate::directive::Directive;
use crate::error::StrategyFailure;
use crate::raster::{HeightRaster, ShadowMask};
use crate::shadowing::{blocks, HorizonScan, ShadingStrategy};

/// Ray tracer accepting any finite or infinite heights.
#[derive(Debug, Clone, Copy, Default)]
pub struct RayTraceShading;

impl ShadingStrategy for RayTraceShading {
    fn name(&self) -> &'static str {
        "ray_trace"
    }

    fn shade(
        &self,
        heights: &HeightRaster,
        directive: &Directive,
    ) -> Result<ShadowMask, StrategyFailure> {
        let (rows, cols) = heights.shape();
        let mut flags = Array2::<bool>::from_elem((rows, cols), false);

        if let Some(scan) = HorizonScan::prepare(heights, directive)? {
            let cells = heights.cells();
            Zip::indexed(&mut flags)
                .and(&cells)
                .par_for_each(|(r, c), flag, &origin| {
                    if origin.is_nan() {
                        return;
                    }
                    let base = f64::from(origin);
                    for step in scan.path.steps() {
                        let sightline = base + step.distance * scan.tan_altitude;
                        if sightline > scan.ceiling {
                            break;
                        }
                        let (Some(rr), Some(cc)) = (
                            r.checked_add_signed(step.dr).filter(|&v| v < rows),
                            c.checked_add_signed(step.dc).filter(|&v| v < cols),
                        ) else {
                            break;
                        };
                        if blocks(cells[[rr, cc]], sightline) {
                            *flag = true;
                            break;
                        }
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
