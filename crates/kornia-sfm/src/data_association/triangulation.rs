use std::collections::BTreeMap;

use glam::DVec3;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::camera::PinholeCamera;
use crate::geometry::triangulation::{max_triangulation_angle, triangulate_dlt, NormalizedView};
use crate::parallel::{ExecuteExt, ExecutionStrategy, ParallelError};
use crate::types::{CameraIndex, GlobalPose, Observation, Track};

use super::tracks::FeatureTrack;

/// How the camera pairs of a track are sampled for triangulation hypotheses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriangulationSamplingMode {
    /// A single DLT over all observations.
    NoRansac,
    /// Camera pairs drawn uniformly.
    #[default]
    RansacSampleUniform,
    /// Camera pairs drawn with probability proportional to their baseline.
    RansacSampleBiasedBaseline,
    /// The camera pairs with the widest baselines.
    RansacTopkBaselines,
}

/// Why a track could not be triangulated.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriangulationFailure {
    /// Fewer inlier observations than the minimum track length.
    #[error("Too few inlier observations")]
    TooFewInliers,
    /// The point is behind one of the inlier cameras.
    #[error("Point behind a camera")]
    Cheirality,
    /// The rays are close to parallel.
    #[error("Triangulation angle too small")]
    LowParallax,
    /// The linear system has no finite solution.
    #[error("Singular triangulation system")]
    Singular,
}

/// Track triangulation options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriangulationConfig {
    /// Hypothesis sampling.
    pub mode: TriangulationSamplingMode,
    /// Maximum number of two-view hypotheses per track.
    pub max_num_hypotheses: usize,
    /// Inlier threshold on the pixel reprojection error.
    pub reproj_error_threshold: f64,
    /// Minimum of the largest ray angle, in degrees.
    pub min_triangulation_angle_deg: f64,
    /// Minimum number of inlier observations.
    pub min_track_length: usize,
    /// Seed of the samplers, `None` for a random seed.
    pub random_seed: Option<u64>,
}

impl Default for TriangulationConfig {
    fn default() -> Self {
        Self {
            mode: TriangulationSamplingMode::RansacSampleUniform,
            max_num_hypotheses: 20,
            reproj_error_threshold: 100.0,
            min_triangulation_angle_deg: 1.0,
            min_track_length: 2,
            random_seed: Some(0),
        }
    }
}

/// Per reason counters of a triangulation run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriangulationReport {
    /// Tracks triangulated.
    pub num_valid: usize,
    /// Failures for [`TriangulationFailure::TooFewInliers`].
    pub num_too_few_inliers: usize,
    /// Failures for [`TriangulationFailure::Cheirality`].
    pub num_cheirality: usize,
    /// Failures for [`TriangulationFailure::LowParallax`].
    pub num_low_parallax: usize,
    /// Failures for [`TriangulationFailure::Singular`].
    pub num_singular: usize,
}

impl TriangulationReport {
    fn count(&mut self, res: &Result<Track, TriangulationFailure>) {
        match res {
            Ok(_) => self.num_valid += 1,
            Err(TriangulationFailure::TooFewInliers) => self.num_too_few_inliers += 1,
            Err(TriangulationFailure::Cheirality) => self.num_cheirality += 1,
            Err(TriangulationFailure::LowParallax) => self.num_low_parallax += 1,
            Err(TriangulationFailure::Singular) => self.num_singular += 1,
        }
    }
}

/// Robust multi-view triangulation of feature tracks.
#[derive(Debug, Clone, Default)]
pub struct TrackTriangulator {
    config: TriangulationConfig,
}

struct ViewData {
    observation: Observation,
    view: NormalizedView,
    camera: PinholeCamera,
    pose: GlobalPose,
}

impl TrackTriangulator {
    /// Create a triangulator.
    pub fn new(config: TriangulationConfig) -> Self {
        Self { config }
    }

    /// The options of this triangulator.
    pub fn config(&self) -> &TriangulationConfig {
        &self.config
    }

    /// Triangulate one track; `rng_stream` selects the random stream of the samplers.
    ///
    /// Observations of cameras without a pose or a calibration are ignored.
    pub fn triangulate(
        &self,
        track: &FeatureTrack,
        poses: &BTreeMap<CameraIndex, GlobalPose>,
        calibrations: &BTreeMap<CameraIndex, PinholeCamera>,
        rng_stream: u64,
    ) -> Result<Track, TriangulationFailure> {
        let views: Vec<ViewData> = track
            .observations
            .iter()
            .filter_map(|obs| {
                let pose = *poses.get(&obs.camera)?;
                let camera = *calibrations.get(&obs.camera)?;
                Some(ViewData {
                    observation: *obs,
                    view: NormalizedView {
                        c_r_w: pose.c_r_w(),
                        c_t_w: pose.c_t_w(),
                        point: camera.pixel_to_normalized(obs.pixel),
                    },
                    camera,
                    pose,
                })
            })
            .collect();
        let min_len = self.config.min_track_length.max(2);
        if views.len() < min_len {
            return Err(TriangulationFailure::TooFewInliers);
        }

        // best hypothesis by inlier count, then by summed inlier error
        let mut best: Option<(usize, f64, Vec<bool>)> = None;
        for x in self.hypotheses(&views, rng_stream) {
            let mut mask = Vec::with_capacity(views.len());
            let mut count = 0;
            let mut sum = 0.0;
            for v in views.iter() {
                let err = pixel_error(v, x);
                let inlier = err.is_some_and(|e| e <= self.config.reproj_error_threshold);
                if inlier {
                    count += 1;
                    sum += err.unwrap_or(0.0);
                }
                mask.push(inlier);
            }
            let better = match &best {
                None => true,
                Some((c, s, _)) => count > *c || (count == *c && sum < *s),
            };
            if better {
                best = Some((count, sum, mask));
            }
        }
        let Some((count, _, mask)) = best else {
            return Err(TriangulationFailure::Singular);
        };
        if count < min_len {
            return Err(TriangulationFailure::TooFewInliers);
        }

        let inliers: Vec<&ViewData> = views
            .iter()
            .zip(mask.iter())
            .filter_map(|(v, &m)| m.then_some(v))
            .collect();
        let inlier_views: Vec<NormalizedView> = inliers.iter().map(|v| v.view).collect();
        let point = triangulate_dlt(&inlier_views).ok_or(TriangulationFailure::Singular)?;
        if inlier_views.iter().any(|v| v.depth(point) <= 0.0) {
            return Err(TriangulationFailure::Cheirality);
        }
        let centers: Vec<DVec3> = inlier_views.iter().map(NormalizedView::center).collect();
        let angle_deg = max_triangulation_angle(&centers, point).to_degrees();
        if angle_deg < self.config.min_triangulation_angle_deg {
            return Err(TriangulationFailure::LowParallax);
        }

        Ok(Track {
            observations: inliers.iter().map(|v| v.observation).collect(),
            point,
            valid: true,
        })
    }

    fn hypotheses(&self, views: &[ViewData], rng_stream: u64) -> Vec<DVec3> {
        if self.config.mode == TriangulationSamplingMode::NoRansac {
            let all: Vec<NormalizedView> = views.iter().map(|v| v.view).collect();
            return triangulate_dlt(&all).into_iter().collect();
        }

        let mut pairs = Vec::new();
        for a in 0..views.len() {
            for b in a + 1..views.len() {
                pairs.push((a, b));
            }
        }
        let baseline = |&(a, b): &(usize, usize)| {
            (views[a].view.center() - views[b].view.center()).length()
        };
        let k = self.config.max_num_hypotheses.min(pairs.len());
        let mut rng = match self.config.random_seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(rng_stream)),
            None => crate::pose::ransac::make_rng(None),
        };
        let selected: Vec<(usize, usize)> = match self.config.mode {
            TriangulationSamplingMode::RansacTopkBaselines => {
                let mut sorted = pairs.clone();
                sorted.sort_by(|p, q| baseline(q).total_cmp(&baseline(p)));
                sorted.truncate(k);
                sorted
            }
            TriangulationSamplingMode::RansacSampleBiasedBaseline => {
                let weight = |i: usize| baseline(&pairs[i]) + 1e-9;
                match rand::seq::index::sample_weighted(&mut rng, pairs.len(), weight, k) {
                    Ok(idx) => idx.into_iter().map(|i| pairs[i]).collect(),
                    Err(_) => pairs.iter().take(k).copied().collect(),
                }
            }
            _ => rand::seq::index::sample(&mut rng, pairs.len(), k)
                .into_iter()
                .map(|i| pairs[i])
                .collect(),
        };

        selected
            .into_iter()
            .filter_map(|(a, b)| triangulate_dlt(&[views[a].view, views[b].view]))
            .filter(|x| x.is_finite())
            .collect()
    }

    /// Triangulate every track; failed tracks are returned with `valid == false`.
    pub fn triangulate_all(
        &self,
        tracks: &[FeatureTrack],
        poses: &BTreeMap<CameraIndex, GlobalPose>,
        calibrations: &BTreeMap<CameraIndex, PinholeCamera>,
        strategy: ExecutionStrategy,
    ) -> Result<(Vec<Track>, TriangulationReport), ParallelError> {
        let indexed: Vec<(usize, &FeatureTrack)> = tracks.iter().enumerate().collect();
        let results = indexed.map_with(strategy, |(i, t)| {
            self.triangulate(t, poses, calibrations, *i as u64)
        })?;

        let mut report = TriangulationReport::default();
        let mut out = Vec::with_capacity(tracks.len());
        for (res, track) in results.into_iter().zip(tracks.iter()) {
            report.count(&res);
            out.push(res.unwrap_or_else(|_| Track {
                observations: track.observations.clone(),
                point: DVec3::ZERO,
                valid: false,
            }));
        }
        log::info!(
            "triangulation: {} of {} tracks valid ({} too few inliers, {} cheirality, {} low parallax, {} singular)",
            report.num_valid,
            tracks.len(),
            report.num_too_few_inliers,
            report.num_cheirality,
            report.num_low_parallax,
            report.num_singular
        );
        Ok((out, report))
    }
}

fn pixel_error(v: &ViewData, x: DVec3) -> Option<f64> {
    let px = v.camera.project(v.pose.to_camera(x))?;
    Some((px - v.observation.pixel).length())
}
