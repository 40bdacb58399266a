//! Calibration products for multi-frame detector readout: super bias, dark
//! ramp, charge-coupling kernels, read-noise decomposition and excess variance.
//!
//! Every stage is a pure computation over ramps handed in by a
//! [`detector::RampSource`]; persistence and file formats live elsewhere.

pub mod common;
pub mod detector;
pub mod domain;
pub mod modules;
pub mod numerics;
pub mod pipelines;

pub use domain::{CalibError, CalibErrorCategory, CalibResult, CalibrationStage, Verbosity};
