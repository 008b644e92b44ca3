//! # vibroscan
//!
//! Control library for a laser-vibrometer raster scanner: a GRBL-driven XY stage
//! moves the measurement head over a grid, a function generator excites the part
//! under test with tone bursts, and an oscilloscope records the vibrometer response
//! at every grid point.
//!
//! ## Crate Structure
//!
//! - **`config`**: Layered settings (`config/vibroscan.toml` plus `VIBROSCAN_*`
//!   environment overrides) and the validated [`config::ScanParameters`].
//! - **`error`**: The [`error::ScanError`] enum shared by every layer.
//! - **`logging`**: `tracing` subscriber setup.
//! - **`hardware`**: Serial plumbing, the GRBL [`hardware::motion::MotionController`],
//!   instrument drivers and simulators.
//! - **`experiment`**: Grid traversal, the [`experiment::scanner::ScanOrchestrator`]
//!   and the collected [`experiment::dataset::SampleTable`].

pub mod config;
pub mod error;
pub mod experiment;
pub mod hardware;
pub mod logging;

pub use error::{AppResult, ScanError};
