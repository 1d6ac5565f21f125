//! Directional horizon-scan wind shelter.
//!
//! Computes, for a raster of above-ground obstacle heights and a set of wind
//! directives, which cells lie in the wind shadow of upwind obstacles, and
//! merges the per-direction masks into direction-group maxima and one
//! protection surface.

pub mod aggregate;
pub mod config;
pub mod directive;
pub mod error;
pub mod morphology;
pub mod pipeline;
pub mod raster;
pub mod raypath;
pub mod raytrace;
pub mod shadowing;
pub mod strategy;
pub mod table;

pub use aggregate::{aggregate, Aggregation, DirectionalAggregator};
pub use config::{Neighborhood, ShadeConfig, StrategyPreference};
pub use directive::{group_key_from_label, Directive, GroupKey};
pub use error::{ErrorKind, Result, ShadeError, StrategyFailure};
pub use morphology::dilate;
pub use pipeline::{BatchRunner, RunReport, WindShadeRun};
pub use raster::{ClassRaster, GridGeometry, HeightRaster, ShadowMask};
pub use raytrace::RayTraceShading;
pub use shadowing::{ShadingStrategy, SweepShading};
pub use strategy::{ShadeOutcome, StrategyController, StrategyUsed};
pub use table::{DirectiveTable, TableColumns};

#[cfg(feature = "python")]
use pyo3::prelude::*;

#[cfg(feature = "python")]
#[pymodule]
fn windshade(py_module: &Bound<'_, PyModule>) -> PyResult<()> {
    register_shadowing_module(py_module)?;
    register_morphology_module(py_module)?;
    register_pipeline_module(py_module)?;

    py_module.add("__doc__", "Directional wind-shadow analysis implemented in Rust.")?;

    Ok(())
}

#[cfg(feature = "python")]
fn register_shadowing_module(py_module: &Bound<'_, PyModule>) -> PyResult<()> {
    let submodule = PyModule::new(py_module.py(), "shadowing")?;
    submodule.add("__doc__", "Single-direction wind shadow masks.")?;
    submodule.add_function(wrap_pyfunction!(shadowing::compute_shadow_mask, &submodule)?)?;
    py_module.add_submodule(&submodule)?;
    Ok(())
}

#[cfg(feature = "python")]
fn register_morphology_module(py_module: &Bound<'_, PyModule>) -> PyResult<()> {
    let submodule = PyModule::new(py_module.py(), "morphology")?;
    submodule.add("__doc__", "Fat-shadow dilation.")?;
    submodule.add_function(wrap_pyfunction!(morphology::dilate_mask, &submodule)?)?;
    py_module.add_submodule(&submodule)?;
    Ok(())
}

#[cfg(feature = "python")]
fn register_pipeline_module(py_module: &Bound<'_, PyModule>) -> PyResult<()> {
    let submodule = PyModule::new(py_module.py(), "pipeline")?;
    submodule.add("__doc__", "Batch runner with progress and cancellation.")?;
    submodule.add_class::<pipeline::WindShadeRunner>()?;
    py_module.add_submodule(&submodule)?;
    Ok(())
}
