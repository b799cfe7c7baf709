//! # Two-view estimation
//!
//! Geometric verification of the putative correspondences of one image pair, pose
//! recovery by cheirality, inlier post-filtering and an optional two-view bundle
//! adjustment. The result is a [`RelativePoseEdge`] or a [`VerificationFailure`].

use glam::DVec2;
use serde::{Deserialize, Serialize};

use crate::camera::PinholeCamera;
use crate::pose::ransac::RansacParams;
use crate::pose::recover_pose;
use crate::types::{
    Keypoints, PairCorrespondences, PriorStrength, RelativePoseEdge, RelativePosePrior,
};

mod refine;
pub use refine::*;

mod verifier;
pub use verifier::*;

/// Why an image pair did not produce an edge. Never fatal for the reconstruction.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum VerificationFailure {
    /// Not enough putative correspondences for the minimal solver.
    #[error("Too few correspondences: {actual} < {required}")]
    TooFewCorrespondences {
        /// Minimum required.
        required: usize,
        /// Number available.
        actual: usize,
    },
    /// RANSAC found no model.
    #[error("No geometric model found")]
    NoModel,
    /// Inlier count below the configured minimum.
    #[error("Too few inliers: {actual} < {required}")]
    TooFewInliers {
        /// Minimum required.
        required: usize,
        /// Number found.
        actual: usize,
    },
    /// Inlier ratio below the configured minimum.
    #[error("Inlier ratio {ratio:.3} below {min_ratio:.3}")]
    LowInlierRatio {
        /// Observed ratio.
        ratio: f64,
        /// Minimum required.
        min_ratio: f64,
    },
    /// No pose candidate puts points in front of both cameras.
    #[error("Degenerate relative pose (cheirality)")]
    Degenerate,
    /// A correspondence references a keypoint that does not exist.
    #[error("Keypoint index {index} out of range for camera {camera}")]
    InvalidKeypoint {
        /// Camera of the keypoint.
        camera: usize,
        /// Offending keypoint index.
        index: usize,
    },
}

/// Two-view estimation options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TwoViewConfig {
    /// Verifier used for model estimation.
    pub verifier: VerifierType,
    /// RANSAC settings; `threshold` is the Sampson error in pixels.
    pub ransac: RansacParams,
    /// Minimum number of inliers to keep an edge.
    pub min_num_inliers: usize,
    /// Minimum ratio of inliers to putative correspondences.
    pub min_inlier_ratio: f64,
    /// Run a two-view bundle adjustment on the inliers.
    pub bundle_adjust: bool,
    /// Iteration cap of the two-view bundle adjustment.
    pub ba_max_iterations: usize,
}

impl Default for TwoViewConfig {
    fn default() -> Self {
        Self {
            verifier: VerifierType::Essential,
            ransac: RansacParams::default(),
            min_num_inliers: 15,
            min_inlier_ratio: 0.1,
            bundle_adjust: true,
            ba_max_iterations: 10,
        }
    }
}

/// Estimates relative pose edges for image pairs.
pub struct TwoViewEstimator {
    config: TwoViewConfig,
    verifier: Box<dyn Verifier>,
}

impl std::fmt::Debug for TwoViewEstimator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TwoViewEstimator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl TwoViewEstimator {
    /// Create an estimator with the verifier selected in `config`.
    pub fn new(config: TwoViewConfig) -> Self {
        let verifier = config.verifier.build();
        Self { config, verifier }
    }

    /// Create an estimator with a custom verifier.
    pub fn with_verifier(config: TwoViewConfig, verifier: Box<dyn Verifier>) -> Self {
        Self { config, verifier }
    }

    /// The options of this estimator.
    pub fn config(&self) -> &TwoViewConfig {
        &self.config
    }

    /// Estimate the edge of one pair, falling back to or overriding with a prior.
    ///
    /// A `Hard` prior replaces the measured rotation and direction. When verification
    /// fails and any prior exists, the edge is built from the prior alone.
    pub fn estimate_with_prior(
        &self,
        corr: &PairCorrespondences,
        kps1: &Keypoints,
        kps2: &Keypoints,
        cam1: &PinholeCamera,
        cam2: &PinholeCamera,
        prior: Option<&RelativePosePrior>,
    ) -> Result<RelativePoseEdge, VerificationFailure> {
        let measured = self.estimate(corr, kps1, kps2, cam1, cam2);
        let Some(prior) = prior else {
            return measured;
        };
        let prior = prior.ordered();
        match measured {
            Ok(mut edge) => {
                if prior.strength == PriorStrength::Hard {
                    edge.i2_r_i1 = prior.i2_r_i1;
                    edge.i2_u_i1 = prior.direction();
                    edge.from_prior = true;
                }
                Ok(edge)
            }
            Err(err) => {
                log::debug!(
                    "pair ({}, {}) failed verification ({}), using its prior",
                    corr.i1,
                    corr.i2,
                    err
                );
                Ok(RelativePoseEdge {
                    i1: prior.i1,
                    i2: prior.i2,
                    i2_r_i1: prior.i2_r_i1,
                    i2_u_i1: prior.direction(),
                    inliers: Vec::new(),
                    inlier_ratio: 0.0,
                    from_prior: true,
                })
            }
        }
    }

    /// Estimate the edge of one pair from its putative correspondences.
    ///
    /// `corr` must be ordered (`i1 < i2`), `kps1`/`cam1` belong to `i1`.
    pub fn estimate(
        &self,
        corr: &PairCorrespondences,
        kps1: &Keypoints,
        kps2: &Keypoints,
        cam1: &PinholeCamera,
        cam2: &PinholeCamera,
    ) -> Result<RelativePoseEdge, VerificationFailure> {
        let n = corr.matches.len();
        if n < 8 {
            return Err(VerificationFailure::TooFewCorrespondences {
                required: 8,
                actual: n,
            });
        }

        let mut x1 = Vec::with_capacity(n);
        let mut x2 = Vec::with_capacity(n);
        for &[a, b] in corr.matches.iter() {
            x1.push(kps1.point(a).ok_or(VerificationFailure::InvalidKeypoint {
                camera: corr.i1,
                index: a,
            })?);
            x2.push(kps2.point(b).ok_or(VerificationFailure::InvalidKeypoint {
                camera: corr.i2,
                index: b,
            })?);
        }

        let model = self
            .verifier
            .verify(&x1, &x2, cam1, cam2, &self.config.ransac)?;

        let inlier_idx: Vec<usize> = (0..n).filter(|&i| model.inliers[i]).collect();
        let x1n: Vec<DVec2> = inlier_idx
            .iter()
            .map(|&i| cam1.pixel_to_normalized(x1[i]))
            .collect();
        let x2n: Vec<DVec2> = inlier_idx
            .iter()
            .map(|&i| cam2.pixel_to_normalized(x2[i]))
            .collect();
        let pose =
            recover_pose(&model.essential, &x1n, &x2n).ok_or(VerificationFailure::Degenerate)?;

        // keep the inliers that triangulate in front of both cameras
        let mut inliers: Vec<usize> = inlier_idx
            .iter()
            .zip(x1n.iter().zip(x2n.iter()))
            .filter(|(_, (a, b))| {
                crate::pose::count_in_front(
                    &pose.rotation,
                    &pose.translation,
                    std::slice::from_ref(*a),
                    std::slice::from_ref(*b),
                ) == 1
            })
            .map(|(&i, _)| i)
            .collect();
        self.post_filter(inliers.len(), n)?;

        let (mut rotation, mut translation) = (pose.rotation, pose.translation);
        if self.config.bundle_adjust {
            let s1: Vec<DVec2> = inliers.iter().map(|&i| x1[i]).collect();
            let s2: Vec<DVec2> = inliers.iter().map(|&i| x2[i]).collect();
            match refine_two_view(&s1, &s2, cam1, cam2, &rotation, &translation, &self.config) {
                Ok(refined) => {
                    rotation = refined.rotation;
                    translation = refined.translation;
                    inliers = refined.inliers.iter().map(|&k| inliers[k]).collect();
                    self.post_filter(inliers.len(), n)?;
                }
                Err(err) => {
                    log::debug!(
                        "two-view refinement of ({}, {}) failed: {}",
                        corr.i1,
                        corr.i2,
                        err
                    );
                }
            }
        }

        Ok(RelativePoseEdge {
            i1: corr.i1,
            i2: corr.i2,
            i2_r_i1: rotation,
            i2_u_i1: translation.normalize(),
            inlier_ratio: inliers.len() as f64 / n as f64,
            inliers: inliers.iter().map(|&i| corr.matches[i]).collect(),
            from_prior: false,
        })
    }

    fn post_filter(
        &self,
        num_inliers: usize,
        num_matches: usize,
    ) -> Result<(), VerificationFailure> {
        if num_inliers < self.config.min_num_inliers {
            return Err(VerificationFailure::TooFewInliers {
                required: self.config.min_num_inliers,
                actual: num_inliers,
            });
        }
        let ratio = num_inliers as f64 / num_matches as f64;
        if ratio < self.config.min_inlier_ratio {
            return Err(VerificationFailure::LowInlierRatio {
                ratio,
                min_ratio: self.config.min_inlier_ratio,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::so3::{angle_between, from_axis_angle_deg};
    use glam::DVec3;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    type Pair = (PairCorrespondences, Keypoints, Keypoints, PinholeCamera);

    fn pair(n: usize, num_outliers: usize) -> Pair {
        let cam = PinholeCamera::new(600.0, 600.0, 320.0, 240.0);
        let r = from_axis_angle_deg(DVec3::new(0.0, 1.0, 0.1), 10.0);
        let t = DVec3::new(-1.0, 0.05, 0.1).normalize();
        let mut rng = StdRng::seed_from_u64(11);
        let mut k1 = Vec::new();
        let mut k2 = Vec::new();
        for i in 0..n {
            let p = DVec3::new(
                rng.random_range(-2.0..2.0),
                rng.random_range(-1.5..1.5),
                rng.random_range(4.0..8.0),
            );
            let a = cam.project(p).unwrap();
            let mut b = cam.project(r * p + t).unwrap();
            if i < num_outliers {
                b = DVec2::new(rng.random_range(0.0..640.0), rng.random_range(0.0..480.0));
            }
            k1.push([a.x, a.y]);
            k2.push([b.x, b.y]);
        }
        // keypoints of the second image in reverse order
        k2.reverse();
        let matches = (0..n).map(|i| [i, n - 1 - i]).collect();
        (
            PairCorrespondences { i1: 0, i2: 1, matches },
            Keypoints::from_coordinates(k1),
            Keypoints::from_coordinates(k2),
            cam,
        )
    }

    #[test]
    fn test_estimate_edge() -> Result<(), VerificationFailure> {
        let (corr, k1, k2, cam) = pair(80, 8);
        let est = TwoViewEstimator::new(TwoViewConfig::default());
        let edge = est.estimate(&corr, &k1, &k2, &cam, &cam)?;
        let r = from_axis_angle_deg(DVec3::new(0.0, 1.0, 0.1), 10.0);
        assert!(angle_between(&edge.i2_r_i1, &r).to_degrees() < 0.01);
        assert!(edge.i2_u_i1.dot(DVec3::new(-1.0, 0.05, 0.1).normalize()) > 0.9999);
        assert!(edge.num_inliers() >= 70);
        assert!(edge.inliers.iter().all(|m| m[1] == 79 - m[0]));
        assert!(edge.inliers.iter().filter(|m| m[0] >= 8).count() >= 70);
        assert!(!edge.from_prior);
        Ok(())
    }

    #[test]
    fn test_post_filter() {
        let (corr, k1, k2, cam) = pair(30, 0);
        let est = TwoViewEstimator::new(TwoViewConfig {
            min_num_inliers: 40,
            bundle_adjust: false,
            ..Default::default()
        });
        assert_eq!(
            est.estimate(&corr, &k1, &k2, &cam, &cam).unwrap_err(),
            VerificationFailure::TooFewInliers {
                required: 40,
                actual: 30
            }
        );

        let short = PairCorrespondences {
            matches: corr.matches[..7].to_vec(),
            ..corr.clone()
        };
        assert!(matches!(
            est.estimate(&short, &k1, &k2, &cam, &cam),
            Err(VerificationFailure::TooFewCorrespondences { .. })
        ));
    }

    #[test]
    fn test_prior_fallback_and_override() -> Result<(), VerificationFailure> {
        let (corr, k1, k2, cam) = pair(80, 0);
        let est = TwoViewEstimator::new(TwoViewConfig::default());
        let prior_r = from_axis_angle_deg(DVec3::Z, 45.0);
        let mut prior = RelativePosePrior {
            i1: 0,
            i2: 1,
            i2_r_i1: prior_r,
            i2_t_i1: DVec3::new(0.0, 0.0, 2.0),
            rotation_sigma: 0.01,
            translation_sigma: 0.1,
            strength: PriorStrength::Soft,
        };

        // soft prior: measurement kept
        let edge = est.estimate_with_prior(&corr, &k1, &k2, &cam, &cam, Some(&prior))?;
        assert!(!edge.from_prior);

        // hard prior: measurement replaced, inliers kept
        prior.strength = PriorStrength::Hard;
        let edge = est.estimate_with_prior(&corr, &k1, &k2, &cam, &cam, Some(&prior))?;
        assert!(edge.from_prior);
        assert!(angle_between(&edge.i2_r_i1, &prior_r) < 1e-12);
        assert_eq!(edge.i2_u_i1, DVec3::Z);
        assert!(!edge.inliers.is_empty());

        // failed verification falls back to the prior
        let short = PairCorrespondences {
            matches: corr.matches[..4].to_vec(),
            ..corr.clone()
        };
        let edge = est.estimate_with_prior(&short, &k1, &k2, &cam, &cam, Some(&prior))?;
        assert!(edge.from_prior);
        assert!(edge.inliers.is_empty());
        Ok(())
    }
}
