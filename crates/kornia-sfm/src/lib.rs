#![deny(missing_docs)]
#![doc = env!("CARGO_PKG_DESCRIPTION")]

/// Motion averaging: rotations, then camera centres.
pub mod averaging;

/// Levenberg-Marquardt bundle adjustment.
pub mod bundle_adjustment;

/// Feature cache shared by the frontend stages.
pub mod cache;

/// Pinhole camera model and calibration sources.
pub mod camera;

/// Pipeline configuration.
pub mod config;

/// Track building and triangulation.
pub mod data_association;

/// Pipeline and component errors.
pub mod error;

/// Keypoint detection and matching seams.
pub mod frontend;

/// Rotation, linear algebra and triangulation primitives.
pub mod geometry;

/// Reconstruction import and export.
pub mod io;

/// Execution strategies over rayon.
pub mod parallel;

/// The end-to-end reconstruction pipeline.
pub mod pipeline;

/// Epipolar geometry solvers.
pub mod pose;

/// Pairwise geometric verification.
pub mod two_view;

/// Shared data model.
pub mod types;

/// View graph and cycle-consistency filtering.
pub mod view_graph;

pub use config::SfmConfig;
pub use error::SfmError;
pub use pipeline::{SfmInput, SfmOutput, SfmPipeline};
