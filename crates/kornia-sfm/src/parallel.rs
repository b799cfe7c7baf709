use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during parallel execution.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParallelError {
    /// The thread pool failed to build.
    #[error("failed to build thread pool: {0}")]
    BuildError(String),

    /// The requested thread count is invalid.
    #[error("thread count must be > 0, got {0}")]
    InvalidThreadCount(usize),
}

/// Controls how independent tasks (image pairs, tracks, components) are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
    /// Use the global Rayon thread pool.
    #[default]
    Parallel,

    /// Run sequentially on the current thread.
    ///
    /// Useful for debugging, or when the tasks are too small to amortize scheduling.
    Serial,

    /// Run on a local thread pool with `n` threads.
    ///
    /// # Warning
    /// Creates a new thread pool on every call.
    Fixed(usize),
}

impl ExecutionStrategy {
    /// Check the strategy without running anything.
    pub fn validate(&self) -> Result<(), ParallelError> {
        match self {
            ExecutionStrategy::Fixed(0) => Err(ParallelError::InvalidThreadCount(0)),
            _ => Ok(()),
        }
    }
}

/// Extension trait to map a function over a slice with an [`ExecutionStrategy`].
pub trait ExecuteExt<T> {
    /// Apply `op` to every element and collect the results in input order.
    ///
    /// The output never depends on the strategy, only the scheduling does.
    fn map_with<R, F>(&self, strategy: ExecutionStrategy, op: F) -> Result<Vec<R>, ParallelError>
    where
        R: Send,
        F: Fn(&T) -> R + Sync + Send;
}

impl<T: Sync + Send> ExecuteExt<T> for [T] {
    fn map_with<R, F>(&self, strategy: ExecutionStrategy, op: F) -> Result<Vec<R>, ParallelError>
    where
        R: Send,
        F: Fn(&T) -> R + Sync + Send,
    {
        match strategy {
            ExecutionStrategy::Serial => Ok(self.iter().map(op).collect()),
            ExecutionStrategy::Parallel => Ok(self.par_iter().map(op).collect()),
            ExecutionStrategy::Fixed(n) => {
                if n == 0 {
                    return Err(ParallelError::InvalidThreadCount(n));
                }
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(n)
                    .build()
                    .map_err(|e| ParallelError::BuildError(e.to_string()))?;

                Ok(pool.install(|| self.par_iter().map(op).collect()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_serial() {
        let src = vec![1, 2, 3, 4];
        let dst = src.map_with(ExecutionStrategy::Serial, |s| *s * 2).unwrap();
        assert_eq!(dst, vec![2, 4, 6, 8]);
    }

    #[test]
    fn test_map_parallel_keeps_order() {
        let src: Vec<usize> = (0..1000).collect();
        let dst = src.map_with(ExecutionStrategy::Parallel, |s| s * 3).unwrap();
        assert!(dst.iter().enumerate().all(|(i, v)| *v == 3 * i));
    }

    #[test]
    fn test_map_fixed() {
        let src = vec![1, 2, 3, 4];
        let dst = src.map_with(ExecutionStrategy::Fixed(2), |s| *s + 1).unwrap();
        assert_eq!(dst, vec![2, 3, 4, 5]);
    }

    #[test]
    fn test_map_fixed_error() {
        let src = vec![1];
        let res = src.map_with(ExecutionStrategy::Fixed(0), |s| *s);
        assert_eq!(res, Err(ParallelError::InvalidThreadCount(0)));
        assert!(ExecutionStrategy::Fixed(0).validate().is_err());
    }
}
