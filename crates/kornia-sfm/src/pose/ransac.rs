//! Generic adaptive RANSAC loop.

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

/// Errors returned by the RANSAC loop.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum RansacError {
    /// Not enough data for a minimal sample.
    #[error("Need at least {required} data points, got {actual}")]
    TooFewData {
        /// Minimal sample size.
        required: usize,
        /// Number of data points.
        actual: usize,
    },
    /// No sample produced a model with inliers.
    #[error("RANSAC failed to find a valid model")]
    NoModel,
}

/// Parameters for RANSAC model estimation.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RansacParams {
    /// Maximum number of RANSAC iterations.
    pub max_iterations: usize,
    /// Inlier threshold, in the units of the error function before squaring.
    pub threshold: f64,
    /// Desired probability that at least one sample set is outlier-free.
    pub confidence: f64,
    /// Optional RNG seed for deterministic runs.
    pub random_seed: Option<u64>,
}

impl Default for RansacParams {
    fn default() -> Self {
        Self {
            max_iterations: 2000,
            threshold: 4.0,
            confidence: 0.999,
            random_seed: Some(0),
        }
    }
}

/// Result of a RANSAC model fit.
#[derive(Clone, Debug)]
pub struct RansacResult<M> {
    /// Estimated model.
    pub model: M,
    /// Per-point inlier mask.
    pub inliers: Vec<bool>,
    /// Total inlier count.
    pub inlier_count: usize,
    /// Sum of inlier errors (lower is better).
    pub score: f64,
    /// Number of iterations run.
    pub iterations: usize,
}

impl<M> RansacResult<M> {
    /// Indices of the inliers.
    pub fn inlier_indices(&self) -> Vec<usize> {
        self.inliers
            .iter()
            .enumerate()
            .filter_map(|(i, &b)| b.then_some(i))
            .collect()
    }
}

/// Build the sampler RNG from an optional seed.
pub fn make_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => {
            let mut tr = rand::rng();
            StdRng::from_rng(&mut tr)
        }
    }
}

/// Number of iterations needed to draw one outlier-free sample with `confidence`.
pub fn required_iterations(
    inlier_ratio: f64,
    sample_size: usize,
    confidence: f64,
    max_iterations: usize,
) -> usize {
    if inlier_ratio <= 0.0 {
        return max_iterations;
    }
    let ws = inlier_ratio.powi(sample_size as i32);
    if ws >= 1.0 - 1e-12 {
        return 1;
    }
    let log_conf = (1.0 - confidence).max(1e-12).ln();
    let log_denom = (1.0 - ws).ln();
    if !log_denom.is_finite() || log_denom == 0.0 {
        return max_iterations;
    }
    let est = (log_conf / log_denom).ceil();
    if est.is_finite() && est > 0.0 {
        (est as usize).min(max_iterations)
    } else {
        max_iterations
    }
}

/// Robustly fit a model to `num_data` data points.
///
/// - `fit` estimates a model from a set of data indices (a minimal sample, or all
///   inliers for the final refit).
/// - `error` returns the squared error of one data point under a model.
///
/// The iteration count adapts to the best inlier ratio seen so far. The best model is
/// refit once on all of its inliers and kept if that does not lose inliers.
pub fn ransac<M, F, E>(
    num_data: usize,
    sample_size: usize,
    params: &RansacParams,
    mut fit: F,
    error: E,
) -> Result<RansacResult<M>, RansacError>
where
    F: FnMut(&[usize]) -> Option<M>,
    E: Fn(&M, usize) -> f64,
{
    if num_data < sample_size {
        return Err(RansacError::TooFewData {
            required: sample_size,
            actual: num_data,
        });
    }

    let mut rng = make_rng(params.random_seed);
    let threshold_sq = params.threshold * params.threshold;

    let score_model = |model: &M| {
        let mut inliers = vec![false; num_data];
        let mut count = 0usize;
        let mut score = 0.0f64;
        for (i, inlier) in inliers.iter_mut().enumerate() {
            let d = error(model, i);
            if d <= threshold_sq {
                *inlier = true;
                count += 1;
                score += d;
            }
        }
        (inliers, count, score)
    };

    let mut best: Option<RansacResult<M>> = None;
    let mut required = params.max_iterations;
    let mut iter = 0;
    let mut sample = Vec::with_capacity(sample_size);

    while iter < required {
        iter += 1;
        sample.clear();
        sample.extend(rand::seq::index::sample(&mut rng, num_data, sample_size).iter());
        let Some(model) = fit(&sample) else {
            continue;
        };

        let (inliers, count, score) = score_model(&model);
        let better = match &best {
            None => count > 0,
            Some(b) => count > b.inlier_count || (count == b.inlier_count && score < b.score),
        };
        if better {
            best = Some(RansacResult {
                model,
                inliers,
                inlier_count: count,
                score,
                iterations: iter,
            });
            let ratio = count as f64 / num_data as f64;
            required = required_iterations(
                ratio,
                sample_size,
                params.confidence,
                params.max_iterations,
            );
        }
    }

    let mut best = best.ok_or(RansacError::NoModel)?;
    best.iterations = iter;

    // refit on all inliers
    if best.inlier_count > sample_size {
        let inlier_idx = best.inlier_indices();
        if let Some(model) = fit(&inlier_idx) {
            let (inliers, count, score) = score_model(&model);
            if count >= best.inlier_count {
                best.model = model;
                best.inliers = inliers;
                best.inlier_count = count;
                best.score = score;
            }
        }
    }

    log::debug!(
        "ransac: {} / {} inliers after {} iterations",
        best.inlier_count,
        num_data,
        best.iterations
    );

    Ok(best)
}
