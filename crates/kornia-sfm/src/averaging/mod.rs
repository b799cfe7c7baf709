//! # Motion averaging
//!
//! Global rotations and camera centres from the relative measurements of a connected
//! view graph component. Rotations always come first: translation averaging rotates
//! the relative directions into the world frame with them.

/// Minimum feedback arc set ordering used by 1DSfM.
pub mod mfas;

/// Rotation averaging.
pub mod rotation;

/// Projection direction samplers.
pub mod sampling;

/// Translation averaging.
pub mod translation;

pub use rotation::{ChordalRotationAveraging, RotationAveraging, RotationAveragingConfig};
pub use sampling::ProjectionSamplingMethod;
pub use translation::{
    TranslationAveraging, TranslationAveraging1dsfm, TranslationAveragingConfig,
    TranslationAveragingInput, TranslationAveragingResult,
};

/// Error types for the averaging stages.
#[derive(thiserror::Error, Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum AveragingError {
    /// The measurements do not connect the cameras.
    #[error("Too few edges: {edges} edges for {cameras} cameras")]
    TooFewEdges {
        /// Number of usable edges.
        edges: usize,
        /// Number of cameras to solve for.
        cameras: usize,
    },

    /// The linear system is singular or produced non-finite values.
    #[error("Degenerate averaging problem: {0}")]
    Degenerate(String),

    /// The robust refinement did not settle.
    #[error("Not converged after {iterations} iterations (last step {step:.3e})")]
    NotConverged {
        /// Iterations performed.
        iterations: usize,
        /// Norm of the last update.
        step: f64,
    },
}

impl From<crate::geometry::linalg::LinalgError> for AveragingError {
    fn from(err: crate::geometry::linalg::LinalgError) -> Self {
        AveragingError::Degenerate(err.to_string())
    }
}
