use std::collections::{BTreeMap, BTreeSet};

use glam::{DMat3, DVec3};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::bundle_adjustment::losses::{HuberLoss, RobustLoss};
use crate::camera::PinholeCamera;
use crate::data_association::tracks::FeatureTrack;
use crate::data_association::union_find::UnionFind;
use crate::geometry::linalg::LeastSquares;
use crate::geometry::so3::hat;
use crate::pose::ransac::make_rng;
use crate::types::{CameraIndex, PairKey, PosePriors, RelativePoseEdge};

use super::mfas::{outlier_weights, DirectionMeasurement};
use super::sampling::ProjectionSamplingMethod;
use super::AveragingError;

/// Everything translation averaging needs from the previous stages.
#[derive(Debug, Clone, Copy)]
pub struct TranslationAveragingInput<'a> {
    /// Camera-to-world rotations from rotation averaging.
    pub rotations: &'a BTreeMap<CameraIndex, DMat3>,
    /// Relative pose edges; only their directions are used.
    pub edges: &'a [RelativePoseEdge],
    /// Feature tracks for landmark directions, may be empty.
    pub tracks: &'a [FeatureTrack],
    /// Calibrations of the cameras, needed for landmark directions.
    pub calibrations: &'a BTreeMap<CameraIndex, PinholeCamera>,
    /// Absolute and relative pose priors.
    pub priors: &'a PosePriors,
}

/// Camera centres and bookkeeping of a translation averaging run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TranslationAveragingResult {
    /// Camera centre in the world frame of every reconstructed camera.
    pub positions: BTreeMap<CameraIndex, DVec3>,
    /// Camera pairs whose direction was used.
    pub inlier_edges: Vec<PairKey>,
    /// Camera pairs whose direction was rejected.
    pub outlier_edges: Vec<PairKey>,
    /// Camera to landmark directions built from the tracks.
    pub num_landmark_measurements: usize,
    /// Camera to landmark directions that were used.
    pub num_inlier_landmark_measurements: usize,
    /// Cameras with a rotation that received no position.
    pub unreconstructed: Vec<CameraIndex>,
}

impl TranslationAveragingResult {
    /// Number of cameras with an estimated position.
    pub fn num_translations(&self) -> usize {
        self.positions.len()
    }
}

/// Global camera centres from relative directions and global rotations.
pub trait TranslationAveraging: Send + Sync {
    /// Estimate camera centres for the cameras of `input.rotations`.
    fn average(
        &self,
        input: &TranslationAveragingInput<'_>,
    ) -> Result<TranslationAveragingResult, AveragingError>;
}

/// Options of [`TranslationAveraging1dsfm`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranslationAveragingConfig {
    /// Huber IRLS on the direction residuals.
    pub robust_measurement_noise: bool,
    /// Add camera to landmark directions from the longest tracks.
    pub use_tracks_for_averaging: bool,
    /// Reject directions with 1DSfM.
    pub reject_outliers: bool,
    /// How 1DSfM projection directions are drawn.
    pub projection_sampling_method: ProjectionSamplingMethod,
    /// Number of 1DSfM projection directions.
    pub max_projection_directions: usize,
    /// Mean outlier weight from which a direction is rejected.
    pub outlier_weight_threshold: f64,
    /// Maximum number of landmark tracks per camera.
    pub tracks_to_cameras_ratio: f64,
    /// Huber threshold on the whitened residual.
    pub huber_k: f64,
    /// Standard deviation of a direction measurement.
    pub noise_sigma: f64,
    /// Length of the anchor's first edge when no prior fixes the scale.
    pub scale_factor: f64,
    /// Iteration cap of the reweighting.
    pub max_irls_iterations: usize,
    /// Seed of the projection sampler, `None` for a random seed.
    pub random_seed: Option<u64>,
}

impl Default for TranslationAveragingConfig {
    fn default() -> Self {
        Self {
            robust_measurement_noise: true,
            use_tracks_for_averaging: true,
            reject_outliers: true,
            projection_sampling_method: ProjectionSamplingMethod::SampleWithUniformDensity,
            max_projection_directions: 2000,
            outlier_weight_threshold: 0.125,
            tracks_to_cameras_ratio: 20.0,
            huber_k: 1.345,
            noise_sigma: 0.01,
            scale_factor: 1.0,
            max_irls_iterations: 10,
            random_seed: Some(0),
        }
    }
}

/// 1DSfM outlier rejection followed by a linear direction solve.
#[derive(Debug, Clone, Default)]
pub struct TranslationAveraging1dsfm {
    config: TranslationAveragingConfig,
}

// an inhomogeneous linear constraint `x_a - x_b = value` (or `x_a = value` when b is None)
#[derive(Debug, Clone, Copy)]
struct PositionConstraint {
    a: usize,
    b: Option<usize>,
    value: DVec3,
    weight: f64,
}

// unknown layout: 3 per node, the anchor is known
struct Layout {
    var: Vec<Option<usize>>,
    anchor: usize,
    anchor_position: DVec3,
    dim: usize,
}

impl Layout {
    fn new(nodes: &[usize], num_nodes: usize, anchor: usize, anchor_position: DVec3) -> Self {
        let mut var = vec![None; num_nodes];
        let mut dim = 0;
        for &n in nodes {
            if n != anchor {
                var[n] = Some(dim);
                dim += 3;
            }
        }
        Self {
            var,
            anchor,
            anchor_position,
            dim,
        }
    }

    fn position(&self, x: &[f64], node: usize) -> DVec3 {
        match self.var[node] {
            Some(v) => DVec3::new(x[v], x[v + 1], x[v + 2]),
            None if node == self.anchor => self.anchor_position,
            None => DVec3::ZERO,
        }
    }
}

impl TranslationAveraging1dsfm {
    /// Create the averager.
    pub fn new(config: TranslationAveragingConfig) -> Self {
        Self { config }
    }

    fn select_tracks(
        &self,
        tracks: &[FeatureTrack],
        valid: &BTreeSet<CameraIndex>,
        calibrations: &BTreeMap<CameraIndex, PinholeCamera>,
    ) -> Vec<FeatureTrack> {
        let max_tracks = (valid.len() as f64 * self.config.tracks_to_cameras_ratio) as usize;
        let mut selected: Vec<FeatureTrack> = tracks
            .iter()
            .map(|t| t.select_cameras(|c| valid.contains(&c) && calibrations.contains_key(&c)))
            .filter(|t| t.len() >= 3)
            .collect();
        selected.sort_by(|a, b| b.len().cmp(&a.len()));
        selected.truncate(max_tracks);
        selected
    }

    fn inlier_mask(&self, num_nodes: usize, measurements: &[DirectionMeasurement]) -> Vec<bool> {
        if !self.config.reject_outliers || measurements.is_empty() {
            return vec![true; measurements.len()];
        }
        let mut rng = make_rng(self.config.random_seed);
        let dirs: Vec<DVec3> = measurements.iter().map(|m| m.direction).collect();
        let projections = self.config.projection_sampling_method.sample(
            &dirs,
            self.config.max_projection_directions,
            &mut rng,
        );
        if projections.is_empty() {
            return vec![true; measurements.len()];
        }

        let sums = projections
            .par_iter()
            .map(|p| outlier_weights(num_nodes, measurements, *p))
            .reduce(
                || vec![0.0; measurements.len()],
                |mut acc, w| {
                    acc.iter_mut().zip(w).for_each(|(a, b)| *a += b);
                    acc
                },
            );
        let n = projections.len() as f64;
        sums.iter()
            .map(|s| s / n < self.config.outlier_weight_threshold)
            .collect()
    }

    fn build_system(
        &self,
        layout: &Layout,
        measurements: &[DirectionMeasurement],
        weights: &[f64],
        constraints: &[PositionConstraint],
    ) -> LeastSquares {
        let mut ls = LeastSquares::new(layout.dim);
        let mut coeffs = Vec::with_capacity(6);
        for (m, &w) in measurements.iter().zip(weights) {
            // [w]x (x_dst - x_src) = 0
            let h = hat(m.direction);
            for k in 0..3 {
                coeffs.clear();
                let mut rhs = 0.0;
                for j in 0..3 {
                    let hkj = h.col(j)[k];
                    for (node, sign) in [(m.dst, 1.0), (m.src, -1.0)] {
                        match layout.var[node] {
                            Some(v) => coeffs.push((v + j, sign * hkj)),
                            None => rhs -= sign * hkj * layout.anchor_position[j],
                        }
                    }
                }
                if !coeffs.is_empty() {
                    ls.add_row(&coeffs, rhs, w);
                }
            }
        }
        for c in constraints {
            for j in 0..3 {
                coeffs.clear();
                let mut rhs = c.value[j];
                match layout.var[c.a] {
                    Some(v) => coeffs.push((v + j, 1.0)),
                    None => rhs -= layout.anchor_position[j],
                }
                if let Some(b) = c.b {
                    match layout.var[b] {
                        Some(v) => coeffs.push((v + j, -1.0)),
                        None => rhs += layout.anchor_position[j],
                    }
                }
                if !coeffs.is_empty() {
                    ls.add_row(&coeffs, rhs, c.weight);
                }
            }
        }
        ls
    }

    fn reweight(
        &self,
        layout: &Layout,
        x: &[f64],
        measurements: &[DirectionMeasurement],
    ) -> Vec<f64> {
        let sigma2 = self.config.noise_sigma.powi(2);
        let huber = HuberLoss::new(self.config.huber_k);
        measurements
            .iter()
            .map(|m| {
                let d = layout.position(x, m.dst) - layout.position(x, m.src);
                let len = d.length();
                if len < 1e-12 {
                    return 1.0 / sigma2;
                }
                let r = m.direction.cross(d).length() / len;
                huber.weight(r * r / sigma2) / (sigma2 * len * len)
            })
            .collect()
    }

    /// Solve with the anchor fixed. Without constraints the scale comes from `scale_edge`.
    fn solve(
        &self,
        layout: &Layout,
        measurements: &[DirectionMeasurement],
        constraints: &[PositionConstraint],
        scale_edge: Option<usize>,
    ) -> Result<Vec<f64>, AveragingError> {
        let sigma2 = self.config.noise_sigma.powi(2);
        let mut weights = vec![1.0 / sigma2; measurements.len()];
        let iterations = if self.config.robust_measurement_noise {
            self.config.max_irls_iterations.max(1)
        } else {
            1
        };

        let mut x: Vec<f64> = Vec::new();
        for iteration in 0..iterations {
            let ls = self.build_system(layout, measurements, &weights, constraints);
            let next = if constraints.is_empty() {
                let mut v = ls.solve_homogeneous()?;
                self.fix_sign_and_scale(layout, &mut v, measurements, scale_edge)?;
                v
            } else {
                ls.solve()?
            };
            if next.iter().any(|v| !v.is_finite()) {
                return Err(AveragingError::Degenerate("non-finite positions".to_string()));
            }

            let change = if x.is_empty() {
                f64::INFINITY
            } else {
                x.iter()
                    .zip(next.iter())
                    .map(|(a, b)| (a - b).abs())
                    .fold(0.0, f64::max)
            };
            let norm = next.iter().map(|v| v.abs()).fold(0.0, f64::max);
            x = next;
            log::debug!("translation averaging iteration {}: change {:.3e}", iteration, change);
            if change <= 1e-10 * (1.0 + norm) {
                break;
            }
            weights = self.reweight(layout, &x, measurements);
        }
        Ok(x)
    }

    fn fix_sign_and_scale(
        &self,
        layout: &Layout,
        x: &mut [f64],
        measurements: &[DirectionMeasurement],
        scale_edge: Option<usize>,
    ) -> Result<(), AveragingError> {
        let mut votes = 0i64;
        for m in measurements {
            let d = layout.position(x, m.dst) - layout.position(x, m.src);
            let p = m.direction.dot(d);
            if p > 0.0 {
                votes += 1;
            } else if p < 0.0 {
                votes -= 1;
            }
        }
        let sign = if votes < 0 { -1.0 } else { 1.0 };

        let len = scale_edge
            .map(|i| {
                let m = &measurements[i];
                (layout.position(x, m.dst) - layout.position(x, m.src)).length()
            })
            .unwrap_or(1.0);
        if len < 1e-12 || !len.is_finite() {
            return Err(AveragingError::Degenerate(
                "zero length reference edge".to_string(),
            ));
        }
        let s = sign * self.config.scale_factor / len;
        x.iter_mut().for_each(|v| *v *= s);
        Ok(())
    }
}

impl TranslationAveraging for TranslationAveraging1dsfm {
    fn average(
        &self,
        input: &TranslationAveragingInput<'_>,
    ) -> Result<TranslationAveragingResult, AveragingError> {
        let cameras: Vec<CameraIndex> = input.rotations.keys().copied().collect();
        let cam_node: BTreeMap<CameraIndex, usize> =
            cameras.iter().enumerate().map(|(i, &c)| (c, i)).collect();
        let mut result = TranslationAveragingResult::default();
        if cameras.len() == 1 {
            let c = cameras[0];
            let p = input
                .priors
                .absolute_for(c)
                .and_then(|p| p.w_t_c)
                .unwrap_or(DVec3::ZERO);
            result.positions.insert(c, p);
            return Ok(result);
        }

        // camera directions in the world frame: from i2's centre towards i1's
        let mut measurements = Vec::new();
        let mut keys = Vec::new();
        let mut edges: Vec<&RelativePoseEdge> = input.edges.iter().collect();
        edges.sort_by_key(|e| e.key());
        for e in edges {
            let (Some(&n1), Some(&n2)) = (cam_node.get(&e.i1), cam_node.get(&e.i2)) else {
                continue;
            };
            let Some(direction) = (input.rotations[&e.i2] * e.i2_u_i1).try_normalize() else {
                continue;
            };
            measurements.push(DirectionMeasurement {
                src: n2,
                dst: n1,
                direction,
            });
            keys.push(e.key());
        }
        if measurements.is_empty() {
            return Err(AveragingError::TooFewEdges {
                edges: 0,
                cameras: cameras.len(),
            });
        }
        let num_camera_measurements = measurements.len();

        // camera to landmark directions
        let mut num_nodes = cameras.len();
        if self.config.use_tracks_for_averaging && !input.tracks.is_empty() {
            let valid: BTreeSet<CameraIndex> = keys.iter().flat_map(|&(a, b)| [a, b]).collect();
            for track in self.select_tracks(input.tracks, &valid, input.calibrations) {
                let node = num_nodes;
                num_nodes += 1;
                for obs in track.observations.iter() {
                    let bearing = input.calibrations[&obs.camera].bearing(obs.pixel);
                    measurements.push(DirectionMeasurement {
                        src: cam_node[&obs.camera],
                        dst: node,
                        direction: input.rotations[&obs.camera] * bearing,
                    });
                }
            }
        }
        result.num_landmark_measurements = measurements.len() - num_camera_measurements;

        // 1DSfM
        let mut mask = self.inlier_mask(num_nodes, &measurements);
        let inlier_cameras: BTreeSet<usize> = measurements[..num_camera_measurements]
            .iter()
            .zip(mask.iter())
            .filter(|(_, ok)| **ok)
            .flat_map(|(m, _)| [m.src, m.dst])
            .collect();
        for (k, ok) in mask.iter_mut().enumerate().skip(num_camera_measurements) {
            *ok = *ok && inlier_cameras.contains(&measurements[k].src);
        }
        // a landmark needs two directions
        let mut landmark_count = vec![0usize; num_nodes];
        for (m, ok) in measurements.iter().zip(mask.iter()).skip(num_camera_measurements) {
            if *ok {
                landmark_count[m.dst] += 1;
            }
        }
        for (k, ok) in mask.iter_mut().enumerate().skip(num_camera_measurements) {
            *ok = *ok && landmark_count[measurements[k].dst] >= 2;
        }

        // keep the component with the most cameras
        let mut uf = UnionFind::new(num_nodes);
        for (m, ok) in measurements.iter().zip(mask.iter()) {
            if *ok {
                uf.union(m.src, m.dst);
            }
        }
        let mut best: Option<(usize, usize)> = None;
        for group in uf.groups() {
            let num_cams = group.iter().filter(|&&n| n < cameras.len()).count();
            if num_cams < 2 {
                continue;
            }
            // groups come ordered by smallest node, which is the smallest camera
            if best.map_or(true, |(_, c)| num_cams > c) {
                best = Some((group[0], num_cams));
            }
        }
        let Some((root_node, _)) = best else {
            return Err(AveragingError::TooFewEdges {
                edges: 0,
                cameras: cameras.len(),
            });
        };
        let root = uf.find(root_node);
        let in_comp: Vec<bool> = (0..num_nodes).map(|n| uf.find(n) == root).collect();
        let comp_nodes: Vec<usize> = (0..num_nodes).filter(|&n| in_comp[n]).collect();

        let mut used = Vec::new();
        for (k, m) in measurements.iter().enumerate() {
            let ok = mask[k] && in_comp[m.src] && in_comp[m.dst];
            if k < num_camera_measurements {
                if ok {
                    result.inlier_edges.push(keys[k]);
                } else {
                    result.outlier_edges.push(keys[k]);
                }
            } else if ok {
                result.num_inlier_landmark_measurements += 1;
            }
            if ok {
                used.push(*m);
            }
        }

        // gauge and priors
        let position_prior = |n: usize| {
            (n < cameras.len())
                .then(|| input.priors.absolute_for(cameras[n]))
                .flatten()
                .and_then(|p| p.w_t_c)
        };
        let comp_cameras: Vec<usize> =
            comp_nodes.iter().copied().filter(|&n| n < cameras.len()).collect();
        let mut constraints = Vec::new();
        for p in input.priors.relative_ordered().into_values() {
            let (Some(&n1), Some(&n2)) = (cam_node.get(&p.i1), cam_node.get(&p.i2)) else {
                continue;
            };
            if in_comp[n1] && in_comp[n2] {
                // c1 - c2 = R_2 * i2_t_i1
                constraints.push(PositionConstraint {
                    a: n1,
                    b: Some(n2),
                    value: input.rotations[&p.i2] * p.i2_t_i1,
                    weight: 1.0 / p.translation_sigma.max(1e-12).powi(2),
                });
            }
        }

        let prior_cameras: Vec<usize> = comp_cameras
            .iter()
            .copied()
            .filter(|&n| position_prior(n).is_some())
            .collect();
        let anchor = match prior_cameras.as_slice() {
            // a lone position prior is measured from a camera held at the origin
            [_] if constraints.is_empty() => comp_cameras
                .iter()
                .copied()
                .find(|&n| position_prior(n).is_none())
                .unwrap_or(comp_cameras[0]),
            [first, ..] => *first,
            [] => comp_cameras[0],
        };
        let mut anchor_position = position_prior(anchor).unwrap_or(DVec3::ZERO);

        for p in input.priors.absolute.iter() {
            let (Some(&n), Some(t)) = (cam_node.get(&p.camera), p.w_t_c) else {
                continue;
            };
            if n != anchor && in_comp[n] {
                constraints.push(PositionConstraint {
                    a: n,
                    b: None,
                    value: t,
                    weight: 1.0 / p.translation_sigma.max(1e-12).powi(2),
                });
            }
        }

        // priors that coincide with the anchor carry no scale, the solve is then homogeneous
        let scale_fixed = constraints
            .iter()
            .any(|c| c.b.is_some() || (c.value - anchor_position).length() > 1e-9);
        let mut pinned = None;
        if !scale_fixed {
            pinned = Some(
                constraints
                    .first()
                    .map_or((anchor, anchor_position), |c| (c.a, c.value)),
            );
            constraints.clear();
            anchor_position = DVec3::ZERO;
        }
        let layout = Layout::new(&comp_nodes, num_nodes, anchor, anchor_position);
        let scale_edge = used.iter().position(|m| {
            (m.src == anchor || m.dst == anchor) && m.src < cameras.len() && m.dst < cameras.len()
        });
        let x = self.solve(&layout, &used, &constraints, scale_edge)?;
        let offset = pinned.map_or(DVec3::ZERO, |(n, value)| value - layout.position(&x, n));

        for &n in comp_cameras.iter() {
            result.positions.insert(cameras[n], layout.position(&x, n) + offset);
        }
        result.unreconstructed = cameras
            .iter()
            .filter(|c| !result.positions.contains_key(c))
            .copied()
            .collect();

        log::info!(
            "translation averaging: {} of {} cameras, {} inlier / {} outlier edges, {} of {} landmark directions",
            result.positions.len(),
            cameras.len(),
            result.inlier_edges.len(),
            result.outlier_edges.len(),
            result.num_inlier_landmark_measurements,
            result.num_landmark_measurements
        );
        Ok(result)
    }
}
