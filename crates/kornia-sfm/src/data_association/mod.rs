//! # Data association
//!
//! Chains verified correspondences into multi-view tracks and triangulates them
//! from the averaged camera poses.

/// Track triangulation.
pub mod triangulation;

/// Track building from pairwise correspondences.
pub mod tracks;

/// Disjoint sets.
pub mod union_find;

pub use tracks::{build_tracks, FeatureTrack, TrackBuildStats};
pub use triangulation::{
    TrackTriangulator, TriangulationConfig, TriangulationFailure, TriangulationReport,
    TriangulationSamplingMode,
};
