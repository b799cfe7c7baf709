/// Dense linear algebra helpers on top of `faer`.
pub mod linalg;

/// Rotation group helpers.
pub mod so3;

/// Multi-view point triangulation.
pub mod triangulation;
