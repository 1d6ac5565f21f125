//! Direction-group maxima and the final protection surface.
//!
//! Masks are reduced by cell-wise maximum, first within each direction group
//! and then across groups. The maximum skips NoData, so a cell stays NoData
//! only when every contributing mask is NoData there. With `ignore_nodata`
//! NoData reads as 0 and never reaches the output.

use std::collections::BTreeMap;

use ndarray::{Array2, ArrayView2, Zip};
use tracing::warn;

use crate::directive::{Directive, GroupKey};
use crate::error::{Result, ShadeError};
use crate::raster::{ClassRaster, GridGeometry, ShadowMask};

/// Artifact stem of the protection surface.
pub const PROTECTION_STEM: &str = "wind_protection";

#[derive(Debug, Clone)]
pub struct Aggregation {
    /// One maximum per direction group, in group-key order.
    pub groups: BTreeMap<GroupKey, ClassRaster>,
    pub protection: ClassRaster,
    /// Groups that had no successful member; their raster is all NoData.
    pub empty_groups: Vec<GroupKey>,
}

/// Incremental max-reduction of shadow masks.
///
/// Partial aggregators built over disjoint directive subsets can be combined
/// with [`merge`](Self::merge) in any order.
#[derive(Debug, Clone)]
pub struct DirectionalAggregator {
    geometry: GridGeometry,
    ignore_nodata: bool,
    groups: BTreeMap<GroupKey, Option<Array2<f32>>>,
}

impl DirectionalAggregator {
    pub fn new(geometry: GridGeometry, ignore_nodata: bool) -> Self {
        Self {
            geometry,
            ignore_nodata,
            groups: BTreeMap::new(),
        }
    }

    /// Declares the directive's group without contributing a mask, so a
    /// group whose members all fail still appears in the output.
    pub fn register(&mut self, directive: &Directive) {
        self.groups
            .entry(directive.group_key().clone())
            .or_insert(None);
    }

    pub fn add(&mut self, directive: &Directive, mask: &ShadowMask) -> Result<()> {
        self.geometry
            .ensure_matches(mask.geometry())
            .map_err(|e| ShadeError::Aggregation(format!("mask '{}': {e}", directive.label())))?;
        let ignore_nodata = self.ignore_nodata;
        let slot = self
            .groups
            .entry(directive.group_key().clone())
            .or_insert(None);
        fold_max(slot, mask.raster().cells(), ignore_nodata);
        Ok(())
    }

    pub fn merge(&mut self, other: DirectionalAggregator) -> Result<()> {
        self.geometry
            .ensure_matches(&other.geometry)
            .map_err(|e| ShadeError::Aggregation(format!("partial aggregate: {e}")))?;
        let ignore_nodata = self.ignore_nodata;
        for (key, acc) in other.groups {
            let slot = self.groups.entry(key).or_insert(None);
            if let Some(acc) = acc {
                fold_max(slot, acc.view(), ignore_nodata);
            }
        }
        Ok(())
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn finish(self) -> Aggregation {
        let mut protection: Option<Array2<f32>> = None;
        let mut groups = BTreeMap::new();
        let mut empty_groups = Vec::new();

        for (key, acc) in self.groups {
            let raster = match acc {
                Some(cells) => {
                    fold_max(&mut protection, cells.view(), self.ignore_nodata);
                    ClassRaster::from_parts(self.geometry.clone(), cells)
                }
                None => {
                    warn!(group = %key, "direction group has no successful member");
                    empty_groups.push(key.clone());
                    ClassRaster::nodata(self.geometry.clone())
                }
            };
            groups.insert(key, raster);
        }

        let protection = match protection {
            Some(cells) => ClassRaster::from_parts(self.geometry, cells),
            None => ClassRaster::nodata(self.geometry),
        };
        Aggregation {
            groups,
            protection,
            empty_groups,
        }
    }
}

/// Cell-wise max of `incoming` into `slot`. `f32::max` returns the non-NaN
/// operand, so NoData survives only where both sides are NoData.
fn fold_max(slot: &mut Option<Array2<f32>>, incoming: ArrayView2<f32>, ignore_nodata: bool) {
    let clean = |v: f32| if ignore_nodata && v.is_nan() { 0.0 } else { v };
    match slot {
        Some(acc) => {
            Zip::from(acc)
                .and(incoming)
                .par_for_each(|a, &m| *a = a.max(clean(m)));
        }
        None => *slot = Some(incoming.mapv(clean)),
    }
}

/// Groups and reduces `masks` in one call.
pub fn aggregate(
    geometry: &GridGeometry,
    masks: &[(Directive, ShadowMask)],
    ignore_nodata: bool,
) -> Result<Aggregation> {
    let mut aggregator = DirectionalAggregator::new(geometry.clone(), ignore_nodata);
    for (directive, mask) in masks {
        aggregator.add(directive, mask)?;
    }
    Ok(aggregator.finish())
}
