//! Ready-made trial definitions.

pub mod water_calibration;

pub use water_calibration::{CalibrationParams, WaterCalibration};
