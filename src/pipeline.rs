//! Batch runner: shades every directive, post-processes the masks and
//! aggregates them into group maxima and the protection surface.
//!
//! Directives run in parallel. Progress and cancellation work at directive
//! granularity: a running scan always completes, and a cancelled batch
//! returns [`ShadeError::Cancelled`] without partial output.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::aggregate::{Aggregation, DirectionalAggregator, PROTECTION_STEM};
use crate::config::ShadeConfig;
use crate::directive::{infer_sector_count, Directive, GroupKey};
use crate::error::{Result, ShadeError};
use crate::morphology::{close_gaps, dilate, stamp_obstacles};
use crate::raster::{ClassRaster, GridGeometry, HeightRaster, ShadowMask};
use crate::strategy::{StrategyController, StrategyUsed};

/// Bearing spacing tolerance for sector-count inference, degrees.
const SECTOR_TOLERANCE_DEG: f64 = 0.25;
const DEFAULT_SECTORS: usize = 32;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DirectiveIssue {
    pub label: String,
    pub reason: String,
}

/// Summary of one batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunReport {
    pub directives: usize,
    /// Masks produced by the primary strategy.
    pub succeeded: usize,
    /// Masks produced by ray tracing after the primary failed.
    pub fell_back: Vec<DirectiveIssue>,
    /// Masks produced by ray tracing without a primary attempt.
    pub ray_traced: usize,
    pub failed: Vec<DirectiveIssue>,
    pub empty_groups: Vec<GroupKey>,
    pub sector_count: usize,
}

impl RunReport {
    pub fn computed(&self) -> usize {
        self.succeeded + self.fell_back.len() + self.ray_traced
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[derive(Debug, Clone)]
pub struct WindShadeRun {
    /// Post-processed mask of every successful directive, in input order.
    pub masks: Vec<(Directive, ShadowMask)>,
    pub aggregation: Aggregation,
    pub report: RunReport,
}

impl WindShadeRun {
    pub fn protection(&self) -> &ClassRaster {
        &self.aggregation.protection
    }

    /// Every output raster with its file stem: directive masks, group maxima,
    /// then the protection surface.
    pub fn artifacts(&self, prefix: &str, suffix: &str) -> Vec<(String, &ClassRaster)> {
        let masks = self
            .masks
            .iter()
            .map(|(d, m)| (d.artifact_stem(prefix, suffix), m.raster()));
        let groups = self
            .aggregation
            .groups
            .iter()
            .map(|(key, raster)| (key.artifact_stem(), raster));
        masks
            .chain(groups)
            .chain(std::iter::once((
                PROTECTION_STEM.to_string(),
                &self.aggregation.protection,
            )))
            .collect()
    }
}

struct DirectiveOutput {
    mask: ShadowMask,
    used: StrategyUsed,
}

/// Runs batches with pollable progress and cooperative cancellation.
pub struct BatchRunner {
    progress: Arc<AtomicUsize>,
    cancelled: Arc<AtomicBool>,
}

impl Default for BatchRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchRunner {
    pub fn new() -> Self {
        Self {
            progress: Arc::new(AtomicUsize::new(0)),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Directives finished in the current (or last) batch.
    pub fn progress(&self) -> usize {
        self.progress.load(Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Shared cancel flag, for cancelling from another thread.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    pub fn run(
        &self,
        heights: &HeightRaster,
        directives: &[Directive],
        config: &ShadeConfig,
    ) -> Result<WindShadeRun> {
        let controller = StrategyController::from_config(config);
        self.run_with(heights, directives, config, &controller, None)
    }

    /// Runs a batch with an explicit controller. When `expected` is given the
    /// height raster must match that grid, otherwise the run fails before any
    /// directive is shaded.
    pub fn run_with(
        &self,
        heights: &HeightRaster,
        directives: &[Directive],
        config: &ShadeConfig,
        controller: &StrategyController,
        expected: Option<&GridGeometry>,
    ) -> Result<WindShadeRun> {
        config.validate()?;
        if let Some(expected) = expected {
            heights.ensure_aligned(expected)?;
        }
        if directives.is_empty() {
            return Err(ShadeError::InvalidConfig("directive list is empty".into()));
        }

        // reset progress and cancel flag
        self.progress.store(0, Ordering::SeqCst);
        self.cancelled.store(false, Ordering::SeqCst);

        let total = directives.len();
        let bearings: Vec<f64> = directives.iter().map(Directive::bearing_deg).collect();
        let sector_count = infer_sector_count(&bearings, SECTOR_TOLERANCE_DEG, DEFAULT_SECTORS);
        let (rows, cols) = heights.shape();
        info!(
            rows,
            cols,
            cell_size = heights.cell_size(),
            directives = total,
            sector_count,
            strategy = controller.primary_name().unwrap_or("ray_trace"),
            "starting wind-shade batch"
        );

        let outputs: Vec<Option<Result<DirectiveOutput>>> = directives
            .par_iter()
            .map(|directive| {
                if self.cancelled.load(Ordering::SeqCst) {
                    return None;
                }
                let out = shade_directive(heights, directive, config, controller);
                self.progress.fetch_add(1, Ordering::SeqCst);
                Some(out)
            })
            .collect();

        let completed = outputs.iter().filter(|o| o.is_some()).count();
        if completed < total {
            warn!(completed, total, "wind-shade batch cancelled");
            return Err(ShadeError::Cancelled { completed, total });
        }

        let mut report = RunReport {
            directives: total,
            sector_count,
            ..RunReport::default()
        };
        let mut aggregator = DirectionalAggregator::new(heights.geometry().clone(), config.ignore_nodata);
        let mut masks = Vec::with_capacity(total);

        for (directive, output) in directives.iter().zip(outputs) {
            aggregator.register(directive);
            let output = match output {
                Some(Ok(output)) => output,
                Some(Err(err)) => {
                    warn!(directive = directive.label(), error = %err, "directive failed");
                    report.failed.push(DirectiveIssue {
                        label: directive.label().to_string(),
                        reason: err.to_string(),
                    });
                    continue;
                }
                None => continue,
            };

            match output.used {
                StrategyUsed::Primary => report.succeeded += 1,
                StrategyUsed::RayTrace => report.ray_traced += 1,
                StrategyUsed::Fallback { reason } => report.fell_back.push(DirectiveIssue {
                    label: directive.label().to_string(),
                    reason: reason.to_string(),
                }),
            }
            aggregator.add(directive, &output.mask)?;
            masks.push((directive.clone(), output.mask));
        }

        if masks.is_empty() {
            return Err(ShadeError::NothingComputed {
                failed: report.failed.len(),
            });
        }

        let aggregation = aggregator.finish();
        report.empty_groups = aggregation.empty_groups.clone();
        info!(
            succeeded = report.succeeded,
            fell_back = report.fell_back.len(),
            ray_traced = report.ray_traced,
            failed = report.failed.len(),
            groups = aggregation.groups.len(),
            "wind-shade batch finished"
        );

        Ok(WindShadeRun {
            masks,
            aggregation,
            report,
        })
    }
}

/// Shadow mask of one directive with gap closing, dilation and obstacle
/// stamping applied in that order. Obstacle footprints are never dilated.
fn shade_directive(
    heights: &HeightRaster,
    directive: &Directive,
    config: &ShadeConfig,
    controller: &StrategyController,
) -> Result<DirectiveOutput> {
    let outcome = controller.select_and_run(heights, directive)?;
    let mut mask = outcome.mask;

    if config.close_gaps {
        mask = close_gaps(&mask, config.neighborhood);
    }
    mask = dilate(&mask, config.dilation_margin, config.neighborhood);
    if config.obstacle_class == Some(directive.severity_class()) {
        mask = stamp_obstacles(&mask, heights);
    }

    debug!(
        directive = directive.label(),
        used = ?outcome.used,
        shadowed = mask.shadowed_count(),
        "directive shaded"
    );
    Ok(DirectiveOutput {
        mask,
        used: outcome.used,
    })
}

#[cfg(feature = "python")]
pub use self::python::WindShadeRunner;

#[cfg(feature = "python")]
mod python {
    use std::collections::HashMap;

    use numpy::{IntoPyArray, PyArray2, PyReadonlyArray2};
    use pyo3::prelude::*;

    use super::BatchRunner;
    use crate::config::ShadeConfig;
    use crate::directive::Directive;
    use crate::error::Result;
    use crate::raster::{ClassRaster, GridGeometry, HeightRaster};

    type RunOutput = (Py<PyArray2<f32>>, HashMap<String, Py<PyArray2<f32>>>, String);

    /// Python handle on [`BatchRunner`]; `progress()` and `cancel()` may be
    /// called from another thread while `run` executes.
    #[pyclass]
    #[derive(Default)]
    pub struct WindShadeRunner {
        inner: BatchRunner,
    }

    #[pymethods]
    impl WindShadeRunner {
        #[new]
        pub fn new() -> Self {
            Self::default()
        }

        pub fn progress(&self) -> usize {
            self.inner.progress()
        }

        pub fn cancel(&self) {
            self.inner.cancel();
        }

        /// Runs a batch.
        ///
        /// `directives` holds `(label, bearing_deg, altitude_deg, severity_class)`
        /// tuples; `config_json` is an optional JSON object of run settings.
        /// Returns `(protection, {group_key: group_max}, report_json)`.
        #[pyo3(signature = (heights, cell_size, directives, config_json=None, nodata=None))]
        pub fn run(
            &self,
            py: Python<'_>,
            heights: PyReadonlyArray2<f32>,
            cell_size: f64,
            directives: Vec<(String, f64, f64, u32)>,
            config_json: Option<&str>,
            nodata: Option<f32>,
        ) -> PyResult<RunOutput> {
            let config = match config_json {
                Some(text) => ShadeConfig::from_json_str(text)?,
                None => ShadeConfig::default(),
            };
            let directives = directives
                .into_iter()
                .map(|(label, bearing, altitude, class)| Directive::new(label, bearing, altitude, class))
                .collect::<Result<Vec<_>>>()?;

            let data = heights.as_array().to_owned();
            let (rows, cols) = data.dim();
            let raster = HeightRaster::new(GridGeometry::unreferenced(cell_size, rows, cols)?, data, nodata)?;

            // run without the GIL so progress can be polled
            let run = py.allow_threads(|| self.inner.run(&raster, &directives, &config))?;

            let handoff = |r: &ClassRaster| match nodata {
                Some(sentinel) => r.to_sentinel_array(sentinel),
                None => r.cells().to_owned(),
            };
            let groups = run
                .aggregation
                .groups
                .iter()
                .map(|(key, raster)| (key.to_string(), handoff(raster).into_pyarray(py).unbind()))
                .collect();
            let protection = handoff(run.protection()).into_pyarray(py).unbind();
            Ok((protection, groups, run.report.to_json()?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StrategyPreference;
    use crate::error::StrategyFailure;
    use crate::shadowing::ShadingStrategy;
    use ndarray::{s, Array2, Zip};

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn raster(data: Array2<f32>, cell: f64) -> HeightRaster {
        let (rows, cols) = data.dim();
        HeightRaster::new(
            GridGeometry::new(400_000.0, 5_700_000.0, cell, rows, cols, "EPSG:25833").unwrap(),
            data,
            Some(-9999.0),
        )
        .unwrap()
    }

    /// 100×100 field with a 10 m block at rows 40..60, cols 20..30.
    fn block_field() -> HeightRaster {
        let mut data = Array2::<f32>::zeros((100, 100));
        data.slice_mut(s![40..60, 20..30]).fill(10.0);
        raster(data, 1.0)
    }

    fn compass(altitude: f64) -> Vec<Directive> {
        (0..8)
            .map(|i| {
                let bearing = i as f64 * 45.0;
                Directive::new(format!("r{}", i * 45), bearing, altitude, 1 + i % 3).unwrap()
            })
            .collect()
    }

    #[test]
    fn test_flat_raster_end_to_end() {
        init_tracing();
        let h = raster(Array2::zeros((30, 30)), 2.0);
        for altitude in [1.0, 11.3, 36.0, 60.0, 89.9] {
            let run = BatchRunner::new()
                .run(&h, &compass(altitude), &ShadeConfig::default())
                .unwrap();
            assert!(run.masks.iter().all(|(_, m)| m.shadowed_count() == 0));
            assert_eq!(run.protection().count_at_least(f32::MIN_POSITIVE), 0);
            assert_eq!(run.protection().nodata_count(), 0);
            assert_eq!(run.report.sector_count, 8);
        }
    }

    #[test]
    fn test_vertical_directive_never_shadowed() {
        let h = block_field();
        let directives = vec![Directive::new("up0", 0.0, 90.0, 1).unwrap()];
        let run = BatchRunner::new()
            .run(&h, &directives, &ShadeConfig::default())
            .unwrap();
        assert_eq!(run.masks[0].1.shadowed_count(), 0);
    }

    #[test]
    fn test_block_shadow_extent() {
        let h = block_field();
        let d = vec![Directive::new("w270", 270.0, 30.0, 1).unwrap()];
        let run = BatchRunner::new().run(&h, &d, &ShadeConfig::default()).unwrap();
        let mask = &run.masks[0].1;
        // 10 / tan 30° = 17.3 cells east of the block edge at col 29
        for r in 0..100 {
            for c in 0..100 {
                let expected = (40..60).contains(&r) && (30..=46).contains(&c);
                assert_eq!(mask.is_shadowed(r, c), expected, "cell ({r}, {c})");
            }
        }
        assert_eq!(run.report.succeeded, 1);
    }

    #[test]
    fn test_block_strategies_agree() {
        let h = block_field();
        let d = vec![Directive::new("w270", 270.0, 30.0, 1).unwrap()];
        let sweep = BatchRunner::new().run(&h, &d, &ShadeConfig::default()).unwrap();
        let traced = BatchRunner::new()
            .run(
                &h,
                &d,
                &ShadeConfig {
                    strategy: StrategyPreference::RayTraceOnly,
                    ..ShadeConfig::default()
                },
            )
            .unwrap();
        assert_eq!(traced.report.ray_traced, 1);
        assert!(sweep.masks[0].1.agreement(&traced.masks[0].1) >= 0.99);
        assert_eq!(sweep.masks[0].1.flags(), traced.masks[0].1.flags());
    }

    #[test]
    fn test_lower_altitude_never_shrinks_shadow() {
        let mut data = Array2::<f32>::zeros((60, 60));
        data.slice_mut(s![10..14, 30..33]).fill(6.0);
        data.slice_mut(s![35..37, 12..20]).fill(3.5);
        data[[50, 50]] = 12.0;
        let h = raster(data, 1.0);
        for bearing in [0.0, 67.5, 135.0, 222.0, 300.0] {
            let mut previous: Option<Array2<bool>> = None;
            for altitude in [80.0, 45.0, 30.0, 15.0, 5.0] {
                let d = vec![Directive::new("m", bearing, altitude, 1).unwrap()];
                let run = BatchRunner::new().run(&h, &d, &ShadeConfig::default()).unwrap();
                let flags = run.masks[0].1.flags();
                if let Some(prev) = &previous {
                    Zip::from(prev)
                        .and(&flags)
                        .for_each(|&a, &b| assert!(!a || b, "bearing {bearing} altitude {altitude}"));
                }
                previous = Some(flags);
            }
        }
    }

    #[test]
    fn test_postprocessing_options() {
        let h = block_field();
        let d = vec![Directive::new("w270", 270.0, 30.0, 1).unwrap()];
        let plain = BatchRunner::new().run(&h, &d, &ShadeConfig::default()).unwrap();
        assert_eq!(plain.masks[0].1.shadowed_count(), 20 * 17);

        let stamped = BatchRunner::new()
            .run(
                &h,
                &d,
                &ShadeConfig {
                    obstacle_class: Some(1),
                    ..ShadeConfig::default()
                },
            )
            .unwrap();
        assert_eq!(stamped.masks[0].1.shadowed_count(), 20 * 27);

        let fat = BatchRunner::new()
            .run(
                &h,
                &d,
                &ShadeConfig {
                    dilation_margin: 1,
                    close_gaps: true,
                    ..ShadeConfig::default()
                },
            )
            .unwrap();
        assert_eq!(fat.masks[0].1.shadowed_count(), 22 * 19);
    }

    #[test]
    fn test_obstacle_stamp_is_not_dilated() {
        let h = block_field();
        let d = vec![Directive::new("w270", 270.0, 30.0, 5).unwrap()];
        let run = BatchRunner::new()
            .run(
                &h,
                &d,
                &ShadeConfig {
                    obstacle_class: Some(5),
                    dilation_margin: 1,
                    ..ShadeConfig::default()
                },
            )
            .unwrap();
        let mask = &run.masks[0].1;
        // upwind of the block and above its north face stay open
        assert!(!mask.is_shadowed(50, 19));
        assert!(!mask.is_shadowed(39, 25));
        assert!(mask.is_shadowed(50, 20));
        // the shadow itself grows by one cell on every side
        assert!(mask.is_shadowed(39, 29));
        assert!(mask.is_shadowed(60, 47));
        assert_eq!(mask.shadowed_count(), 22 * 19 + 20 * 9);
        assert_eq!(mask.raster().value(50, 25), Some(5.0));
    }

    #[test]
    fn test_expected_geometry_is_enforced() {
        let h = block_field();
        let d = vec![Directive::new("w270", 270.0, 30.0, 1).unwrap()];
        let controller = StrategyController::default();
        let runner = BatchRunner::new();

        let same = h.geometry().clone();
        let run = runner
            .run_with(&h, &d, &ShadeConfig::default(), &controller, Some(&same))
            .unwrap();
        assert_eq!(run.report.succeeded, 1);

        let shifted = GridGeometry::new(400_010.0, 5_700_000.0, 1.0, 100, 100, "EPSG:25833").unwrap();
        let err = runner
            .run_with(&h, &d, &ShadeConfig::default(), &controller, Some(&shifted))
            .unwrap_err();
        assert!(matches!(err, ShadeError::GeometryMismatch(_)));
        assert_eq!(err.kind(), crate::error::ErrorKind::Input);
    }

    #[test]
    fn test_nodata_hole_end_to_end() {
        let mut data = Array2::<f32>::zeros((20, 20));
        data.slice_mut(s![8..10, 8..10]).fill(-9999.0);
        data[[2, 2]] = 4.0;
        let h = raster(data, 1.0);
        let keep = BatchRunner::new()
            .run(&h, &compass(20.0), &ShadeConfig::default())
            .unwrap();
        assert_eq!(keep.protection().nodata_count(), 4);
        assert_eq!(keep.protection().value(8, 8), None);

        let ignore = BatchRunner::new()
            .run(
                &h,
                &compass(20.0),
                &ShadeConfig {
                    ignore_nodata: true,
                    ..ShadeConfig::default()
                },
            )
            .unwrap();
        assert_eq!(ignore.protection().nodata_count(), 0);
        assert_eq!(ignore.protection().value(8, 8), Some(0.0));
        assert_eq!(ignore.protection().to_sentinel_array(-9999.0)[[8, 8]], 0.0);
        assert_eq!(keep.protection().to_sentinel_array(-9999.0)[[8, 8]], -9999.0);
    }

    #[test]
    fn test_failed_directive_is_isolated() {
        // diagonal rays overflow f64 on this cell size, cardinal rays do not
        let h = HeightRaster::new(
            GridGeometry::unreferenced(1.5e308, 1, 1).unwrap(),
            Array2::zeros((1, 1)),
            None,
        )
        .unwrap();
        let directives = vec![
            Directive::new("r90", 90.0, 30.0, 1).unwrap(),
            Directive::new("r45", 45.0, 30.0, 2).unwrap(),
        ];
        let run = BatchRunner::new()
            .run(&h, &directives, &ShadeConfig::default())
            .unwrap();
        assert_eq!(run.report.computed(), 1);
        assert_eq!(run.report.failed.len(), 1);
        assert_eq!(run.report.failed[0].label, "r45");
        assert!(run.report.failed[0].reason.contains("overflow"));
        assert_eq!(run.report.empty_groups, vec![GroupKey::Number(45)]);
        assert_eq!(run.aggregation.groups[&GroupKey::Number(45)].nodata_count(), 1);
        assert_eq!(run.protection().value(0, 0), Some(0.0));

        let err = BatchRunner::new()
            .run(&h, &directives[1..], &ShadeConfig::default())
            .unwrap_err();
        assert!(matches!(err, ShadeError::NothingComputed { failed: 1 }));
    }

    #[test]
    fn test_report_and_artifacts() {
        let h = block_field();
        let directives = vec![
            Directive::new("N45_primary", 45.0, 30.0, 1).unwrap(),
            Directive::new("NE45_b", 45.0, 10.0, 2).unwrap(),
            Directive::new("north", 0.0, 20.0, 1).unwrap(),
        ];
        let runner = BatchRunner::new();
        let run = runner.run(&h, &directives, &ShadeConfig::default()).unwrap();
        assert_eq!(runner.progress(), 3);
        assert_eq!(run.report.succeeded, 3);
        assert_eq!(run.report.sector_count, DEFAULT_SECTORS);
        assert_eq!(run.aggregation.groups.len(), 2);

        let stems: Vec<String> = run.artifacts("", "").into_iter().map(|(s, _)| s).collect();
        assert_eq!(
            stems,
            vec![
                "N45_primary_sm_az45_alt30_c1",
                "NE45_b_sm_az45_alt10_c2",
                "north_sm_az0_alt20_c1",
                "45_max",
                "north_max",
                "wind_protection",
            ]
        );

        let json = run.report.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["succeeded"], 3);
        assert_eq!(value["sector_count"], 32);
    }

    #[test]
    fn test_empty_directive_list_rejected() {
        let h = block_field();
        let err = BatchRunner::new()
            .run(&h, &[], &ShadeConfig::default())
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Input);
    }

    /// Cancels the batch from inside the first scan, then fails so the
    /// controller falls back.
    struct CancelOnFirst(Arc<AtomicBool>);

    impl ShadingStrategy for CancelOnFirst {
        fn name(&self) -> &'static str {
            "cancel_on_first"
        }

        fn shade(&self, _: &HeightRaster, _: &Directive) -> std::result::Result<ShadowMask, StrategyFailure> {
            self.0.store(true, Ordering::SeqCst);
            Err(StrategyFailure::Runtime("cancel requested".into()))
        }
    }

    #[test]
    fn test_cancellation() {
        let h = block_field();
        let runner = BatchRunner::new();
        let controller = StrategyController::with_primary(Box::new(CancelOnFirst(runner.cancel_handle())));
        let directives = compass(30.0);
        // one worker, so the directives after the first see the flag
        let pool = rayon::ThreadPoolBuilder::new().num_threads(1).build().unwrap();
        let err = pool
            .install(|| runner.run_with(&h, &directives, &ShadeConfig::default(), &controller, None))
            .unwrap_err();
        match err {
            ShadeError::Cancelled { completed, total } => {
                assert_eq!(total, 8);
                assert_eq!(completed, 1);
            }
            other => panic!("expected cancellation, got {other}"),
        }
        assert_eq!(runner.progress(), 1);
    }

    #[test]
    fn test_cancel_after_last_directive_keeps_result() {
        let h = block_field();
        let runner = BatchRunner::new();
        let controller = StrategyController::with_primary(Box::new(CancelOnFirst(runner.cancel_handle())));
        let d = vec![Directive::new("w270", 270.0, 30.0, 1).unwrap()];
        let run = runner
            .run_with(&h, &d, &ShadeConfig::default(), &controller, None)
            .unwrap();
        assert_eq!(run.report.fell_back.len(), 1);
        assert_eq!(run.masks[0].1.shadowed_count(), 20 * 17);
    }
}
