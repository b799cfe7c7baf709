use serde::{Deserialize, Serialize};

use crate::averaging::AveragingError;
use crate::camera::CameraError;
use crate::io::IoError;
use crate::parallel::ParallelError;
use crate::types::CameraIndex;

/// Errors that abort a pipeline run.
///
/// Per-pair, per-edge and per-track failures never end up here: they are absorbed by
/// their stage and counted in the [`crate::pipeline::PipelineReport`].
#[derive(Debug, thiserror::Error)]
pub enum SfmError {
    /// The input is inconsistent, e.g. calibration and camera counts differ.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A calibration is unusable.
    #[error(transparent)]
    Camera(#[from] CameraError),

    /// The execution strategy could not be set up.
    #[error(transparent)]
    Parallel(#[from] ParallelError),

    /// Reading or writing a file failed.
    #[error("error reading or writing file")]
    FileIo(#[from] std::io::Error),

    /// A JSON document could not be parsed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Import or export of a reconstruction failed.
    #[error(transparent)]
    Io(#[from] IoError),
}

/// Why a connected component produced no reconstruction.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
pub enum ComponentFailureReason {
    /// The component is too small to be reconstructed on its own.
    #[error("camera not connected to any other camera")]
    Disconnected,

    /// Rotation averaging failed.
    #[error("rotation averaging failed: {0}")]
    RotationAveraging(AveragingError),

    /// Translation averaging failed.
    #[error("translation averaging failed: {0}")]
    TranslationAveraging(AveragingError),

    /// No track could be triangulated.
    #[error("no valid tracks")]
    NoValidTracks,
}

/// A component that could not be reconstructed. Other components are unaffected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentFailure {
    /// Cameras of the component.
    pub cameras: Vec<CameraIndex>,
    /// What went wrong.
    pub reason: ComponentFailureReason,
}

impl std::fmt::Display for ComponentFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "component {:?}: {}", self.cameras, self.reason)
    }
}
