/// COLMAP text model reader and writer.
pub mod colmap;

/// JSON reconstruction files.
pub mod json;

/// Error types for the io module.
#[derive(Debug, thiserror::Error)]
pub enum IoError {
    /// Error reading or writing file
    #[error("error reading or writing file")]
    FileIo(#[from] std::io::Error),

    /// Error encoding or decoding JSON
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid number of camera parameters
    #[error("Invalid number of camera parameters for {model}: {actual}")]
    InvalidNumCameraParams {
        /// Camera model name.
        model: String,
        /// Number of parameters found.
        actual: usize,
    },

    /// Parse error
    #[error("Parse error {0}")]
    ParseError(String),
}
