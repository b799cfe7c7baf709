//! # Two-view pose solvers
//!
//! - `fundamental`: eight-point fundamental matrix and Sampson error (pixel space)
//! - `essential`: essential matrix, its decomposition and cheirality-based pose recovery
//! - [`ransac`]: adaptive RANSAC loop shared by the verifiers

mod fundamental;
pub use fundamental::*;

mod essential;
pub use essential::*;

/// Generic adaptive RANSAC.
pub mod ransac;
