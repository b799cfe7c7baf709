//! Levenberg-Marquardt bundle adjustment with a Schur complement over points.
//!
//! Residuals are pixel reprojection errors of every track observation. Each free camera
//! carries six pose parameters, a left-multiplicative rotation increment and a translation
//! increment of its world-to-camera transform. Calibration blocks `[fx, fy, k1, k2]` are
//! optionally appended, shared by all cameras or one per camera. Points are eliminated
//! per 3x3 block and the reduced camera system is solved densely.

use std::collections::BTreeMap;

use faer::prelude::SpSolver;
use glam::{DMat3, DVec2, DVec3};
use serde::{Deserialize, Serialize};

use crate::camera::PinholeCamera;
use crate::geometry::so3;
use crate::types::{AbsolutePosePrior, CameraIndex, PosePriors, Reconstruction};

use super::losses::{IdentityLoss, LossFunction, RobustLoss};

/// Errors of the bundle adjustment.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum BundleAdjustmentError {
    /// No observation survived problem construction.
    #[error("No observations to optimize")]
    NoObservations,
    /// The cost became non-finite or ended above its initial value.
    #[error("Bundle adjustment diverged (initial cost {initial_cost}, final cost {final_cost})")]
    Diverged {
        /// Cost before optimization.
        initial_cost: f64,
        /// Cost after optimization.
        final_cost: f64,
    },
    /// Invalid configuration values.
    #[error("Invalid bundle adjustment configuration: {0}")]
    InvalidConfig(String),
}

/// Bundle adjustment options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BundleAdjustmentConfig {
    /// Maximum number of Levenberg-Marquardt iterations.
    pub max_iterations: usize,
    /// Down-weight large residuals with `loss`.
    pub robust_noise: bool,
    /// Robust loss used when `robust_noise` is set.
    pub loss: LossFunction,
    /// Optimize `fx, fy, k1, k2`.
    pub optimize_calibration: bool,
    /// One calibration block for all cameras.
    pub shared_calibration: bool,
    /// Tracks shorter than this are not refined and are dropped.
    pub min_track_length: usize,
    /// Tracks whose mean reprojection error (pixels) ends above this are dropped.
    pub output_reproj_error_threshold: f64,
    /// Initial damping.
    pub lambda_init: f64,
    /// Maximum damping before giving up.
    pub lambda_max: f64,
    /// Damping update factor.
    pub lambda_factor: f64,
    /// Relative cost decrease below which the optimizer stops.
    pub cost_tolerance: f64,
    /// Step norm below which the optimizer stops.
    pub step_tolerance: f64,
}

impl Default for BundleAdjustmentConfig {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            robust_noise: true,
            loss: LossFunction::Huber { delta: 3.0 },
            optimize_calibration: false,
            shared_calibration: false,
            min_track_length: 2,
            output_reproj_error_threshold: 3.0,
            lambda_init: 1e-3,
            lambda_max: 1e10,
            lambda_factor: 10.0,
            cost_tolerance: 1e-10,
            step_tolerance: 1e-12,
        }
    }
}

impl BundleAdjustmentConfig {
    /// Check the configuration values.
    pub fn validate(&self) -> Result<(), BundleAdjustmentError> {
        if !self.loss.is_valid() {
            return Err(BundleAdjustmentError::InvalidConfig(format!(
                "invalid loss {:?}",
                self.loss
            )));
        }
        if self.lambda_factor <= 1.0 || self.lambda_init <= 0.0 {
            return Err(BundleAdjustmentError::InvalidConfig(
                "lambda_init must be positive and lambda_factor greater than one".to_string(),
            ));
        }
        Ok(())
    }
}

/// Reason why the optimizer terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminationReason {
    /// Converged: relative cost change below tolerance
    CostConverged,
    /// Converged: step norm below tolerance
    StepConverged,
    /// Maximum iterations reached
    MaxIterations,
    /// Lambda exceeded maximum
    LambdaMaxExceeded,
}

/// Outcome of a bundle adjustment run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleAdjustmentSummary {
    /// Robust cost before optimization.
    pub initial_cost: f64,
    /// Robust cost after optimization.
    pub final_cost: f64,
    /// Iterations performed (accepted and rejected steps).
    pub iterations: usize,
    /// Why the optimizer stopped.
    pub termination_reason: TerminationReason,
    /// Number of residual blocks.
    pub num_observations: usize,
    /// Number of optimized points.
    pub num_points: usize,
    /// Mean pixel error before optimization.
    pub initial_mean_reprojection_error: f64,
    /// Mean pixel error after optimization.
    pub final_mean_reprojection_error: f64,
    /// Tracks removed by the output filter.
    pub num_filtered_tracks: usize,
}

#[derive(Debug, Clone)]
struct CameraState {
    index: CameraIndex,
    c_r_w: DMat3,
    c_t_w: DVec3,
    calib: PinholeCamera,
    pose_col: Option<usize>,
    calib_col: Option<usize>,
}

impl CameraState {
    fn center(&self) -> DVec3 {
        -(self.c_r_w.transpose() * self.c_t_w)
    }
}

#[derive(Debug, Clone, Copy)]
struct ObservationTerm {
    camera: usize,
    point: usize,
    pixel: DVec2,
}

#[derive(Debug, Clone, Copy)]
struct PositionPrior {
    camera: usize,
    center: DVec3,
    inv_sigma: f64,
}

#[derive(Debug, Clone, Copy)]
struct RotationPrior {
    camera: usize,
    w_r_c: DMat3,
    inv_sigma: f64,
}

struct Projection {
    pixel: DVec2,
    j_pose: [[f64; 6]; 2],
    j_calib: [[f64; 4]; 2],
    j_point: [[f64; 3]; 2],
}

struct Linearization {
    u: faer::Mat<f64>,
    g_c: Vec<f64>,
    v: Vec<DMat3>,
    g_p: Vec<DVec3>,
    w: Vec<BTreeMap<usize, DVec3>>,
}

/// A bundle adjustment problem built from a reconstruction.
#[derive(Debug, Clone)]
pub struct BundleAdjustmentProblem {
    cameras: Vec<CameraState>,
    calib_blocks: Vec<(usize, Vec<usize>)>,
    points: Vec<DVec3>,
    point_tracks: Vec<usize>,
    observations: Vec<ObservationTerm>,
    priors: Vec<PositionPrior>,
    rotation_priors: Vec<RotationPrior>,
    num_params: usize,
}

impl BundleAdjustmentProblem {
    /// Build the problem from the valid tracks of `rec`.
    ///
    /// The lowest camera index is held fixed unless the priors fix the gauge: one camera
    /// with a full pose prior plus a position prior on another camera. In that case every
    /// camera is free and pose priors act as soft residuals on all of them. Observations of cameras without a pose,
    /// or with the point behind the camera, are skipped; tracks left with fewer than
    /// `min_track_length` observations are not part of the problem.
    pub fn new(
        rec: &Reconstruction,
        priors: &PosePriors,
        config: &BundleAdjustmentConfig,
    ) -> Result<Self, BundleAdjustmentError> {
        let anchor = if priors_fix_gauge(rec, priors) {
            None
        } else {
            rec.poses.keys().next().copied()
        };
        let mut slot_of = BTreeMap::new();
        let mut cameras = Vec::with_capacity(rec.poses.len());
        let mut num_params = 0;
        for (&index, pose) in rec.poses.iter() {
            let calib = rec.calibrations.get(&index).copied().unwrap_or_default();
            let pose_col = if Some(index) == anchor {
                None
            } else {
                num_params += 6;
                Some(num_params - 6)
            };
            slot_of.insert(index, cameras.len());
            cameras.push(CameraState {
                index,
                c_r_w: pose.c_r_w(),
                c_t_w: pose.c_t_w(),
                calib,
                pose_col,
                calib_col: None,
            });
        }

        let mut calib_blocks = Vec::new();
        if config.optimize_calibration && !cameras.is_empty() {
            if config.shared_calibration {
                let reference = cameras[0].calib;
                for cam in cameras.iter_mut() {
                    cam.calib.fx = reference.fx;
                    cam.calib.fy = reference.fy;
                    cam.calib.k1 = reference.k1;
                    cam.calib.k2 = reference.k2;
                    cam.calib_col = Some(num_params);
                }
                calib_blocks.push((num_params, (0..cameras.len()).collect()));
                num_params += 4;
            } else {
                for (slot, cam) in cameras.iter_mut().enumerate() {
                    cam.calib_col = Some(num_params);
                    calib_blocks.push((num_params, vec![slot]));
                    num_params += 4;
                }
            }
        }

        let mut points = Vec::new();
        let mut point_tracks = Vec::new();
        let mut observations = Vec::new();
        for (track_idx, track) in rec.tracks.iter().enumerate() {
            if !track.valid {
                continue;
            }
            let terms: Vec<ObservationTerm> = track
                .observations
                .iter()
                .filter_map(|obs| {
                    let slot = *slot_of.get(&obs.camera)?;
                    let cam = &cameras[slot];
                    let depth = (cam.c_r_w * track.point + cam.c_t_w).z;
                    (depth > 0.0).then_some(ObservationTerm {
                        camera: slot,
                        point: points.len(),
                        pixel: obs.pixel,
                    })
                })
                .collect();
            if terms.len() < config.min_track_length.max(2) {
                continue;
            }
            observations.extend(terms);
            points.push(track.point);
            point_tracks.push(track_idx);
        }

        if observations.is_empty() {
            return Err(BundleAdjustmentError::NoObservations);
        }

        let position_priors = priors
            .absolute
            .iter()
            .filter_map(|p| {
                let slot = *slot_of.get(&p.camera)?;
                let center = p.w_t_c?;
                (cameras[slot].pose_col.is_some() && p.translation_sigma > 0.0).then_some(
                    PositionPrior {
                        camera: slot,
                        center,
                        inv_sigma: 1.0 / p.translation_sigma,
                    },
                )
            })
            .collect();
        let rotation_priors = priors
            .absolute
            .iter()
            .filter_map(|p| {
                let slot = *slot_of.get(&p.camera)?;
                let w_r_c = p.w_r_c?;
                (cameras[slot].pose_col.is_some() && p.rotation_sigma > 0.0).then_some(
                    RotationPrior {
                        camera: slot,
                        w_r_c,
                        inv_sigma: 1.0 / p.rotation_sigma,
                    },
                )
            })
            .collect();

        Ok(Self {
            cameras,
            calib_blocks,
            points,
            point_tracks,
            observations,
            priors: position_priors,
            rotation_priors,
            num_params,
        })
    }

    /// Number of residual blocks.
    pub fn num_observations(&self) -> usize {
        self.observations.len()
    }

    /// Number of points.
    pub fn num_points(&self) -> usize {
        self.points.len()
    }

    /// Number of camera-side parameters.
    pub fn num_camera_parameters(&self) -> usize {
        self.num_params
    }

    fn project(cam: &CameraState, x: DVec3) -> Option<Projection> {
        let xr = cam.c_r_w * x;
        let pc = xr + cam.c_t_w;
        if pc.z <= 1e-9 {
            return None;
        }
        let inv_z = 1.0 / pc.z;
        let u = pc.x * inv_z;
        let v = pc.y * inv_z;
        let PinholeCamera {
            fx,
            fy,
            cx,
            cy,
            k1,
            k2,
        } = cam.calib;
        let r2 = u * u + v * v;
        let d = 1.0 + k1 * r2 + k2 * r2 * r2;
        let dd = k1 + 2.0 * k2 * r2;

        // d(pixel)/d(u, v)
        let dpx_dn = [
            [fx * (d + 2.0 * u * u * dd), fx * 2.0 * u * v * dd],
            [fy * 2.0 * u * v * dd, fy * (d + 2.0 * v * v * dd)],
        ];
        // d(u, v)/d(pc)
        let dn_dp = [[inv_z, 0.0, -u * inv_z], [0.0, inv_z, -v * inv_z]];
        let mut a = [[0.0; 3]; 2];
        for i in 0..2 {
            for k in 0..3 {
                a[i][k] = dpx_dn[i][0] * dn_dp[0][k] + dpx_dn[i][1] * dn_dp[1][k];
            }
        }

        let j_point = mul_2x3_mat3(&a, &cam.c_r_w);
        let j_rot = mul_2x3_mat3(&a, &(-so3::hat(xr)));
        let mut j_pose = [[0.0; 6]; 2];
        for i in 0..2 {
            j_pose[i][..3].copy_from_slice(&j_rot[i]);
            j_pose[i][3..].copy_from_slice(&a[i]);
        }
        let j_calib = [
            [u * d, 0.0, fx * u * r2, fx * u * r2 * r2],
            [0.0, v * d, fy * v * r2, fy * v * r2 * r2],
        ];

        Some(Projection {
            pixel: DVec2::new(fx * u * d + cx, fy * v * d + cy),
            j_pose,
            j_calib,
            j_point,
        })
    }

    fn residual(&self, obs: &ObservationTerm) -> Option<DVec2> {
        let cam = &self.cameras[obs.camera];
        let pc = cam.c_r_w * self.points[obs.point] + cam.c_t_w;
        let px = cam.calib.project(pc)?;
        Some(px - obs.pixel)
    }

    /// Robust cost of the current estimate; infinite if a point falls behind a camera.
    pub fn cost(&self, loss: &dyn RobustLoss) -> f64 {
        let mut cost = 0.0;
        for obs in self.observations.iter() {
            match self.residual(obs) {
                Some(r) => cost += loss.cost(r.length_squared()),
                None => return f64::INFINITY,
            }
        }
        for prior in self.priors.iter() {
            let r = (self.cameras[prior.camera].center() - prior.center) * prior.inv_sigma;
            cost += r.length_squared();
        }
        for prior in self.rotation_priors.iter() {
            cost += self.rotation_residual(prior).length_squared();
        }
        cost
    }

    fn rotation_residual(&self, prior: &RotationPrior) -> DVec3 {
        so3::log(&(self.cameras[prior.camera].c_r_w * prior.w_r_c)) * prior.inv_sigma
    }

    /// Mean pixel reprojection error of the current estimate.
    pub fn mean_reprojection_error(&self) -> f64 {
        let mut sum = 0.0;
        for obs in self.observations.iter() {
            match self.residual(obs) {
                Some(r) => sum += r.length(),
                None => return f64::INFINITY,
            }
        }
        sum / self.observations.len() as f64
    }

    fn camera_columns(cam: &CameraState, proj: &Projection) -> Vec<(usize, [f64; 2])> {
        let mut cols = Vec::with_capacity(10);
        if let Some(c) = cam.pose_col {
            for k in 0..6 {
                cols.push((c + k, [proj.j_pose[0][k], proj.j_pose[1][k]]));
            }
        }
        if let Some(c) = cam.calib_col {
            for k in 0..4 {
                cols.push((c + k, [proj.j_calib[0][k], proj.j_calib[1][k]]));
            }
        }
        cols
    }

    fn linearize(&self, loss: &dyn RobustLoss) -> Linearization {
        let n = self.num_params;
        let mut lin = Linearization {
            u: faer::Mat::<f64>::zeros(n, n),
            g_c: vec![0.0; n],
            v: vec![DMat3::ZERO; self.points.len()],
            g_p: vec![DVec3::ZERO; self.points.len()],
            w: vec![BTreeMap::new(); self.points.len()],
        };

        for obs in self.observations.iter() {
            let cam = &self.cameras[obs.camera];
            let x = self.points[obs.point];
            let Some(proj) = Self::project(cam, x) else {
                continue;
            };
            let r = proj.pixel - obs.pixel;
            let weight = loss.weight(r.length_squared());
            let r = [r.x, r.y];

            let jp = &proj.j_point;
            let jp_cols = [
                DVec3::new(jp[0][0], jp[0][1], jp[0][2]),
                DVec3::new(jp[1][0], jp[1][1], jp[1][2]),
            ];
            // J_p^T J_p and J_p^T r
            let mut v = DMat3::ZERO;
            for row in jp_cols.iter() {
                v += outer(*row, *row);
            }
            lin.v[obs.point] += v * weight;
            lin.g_p[obs.point] += (jp_cols[0] * r[0] + jp_cols[1] * r[1]) * weight;

            let cols = Self::camera_columns(cam, &proj);
            for &(a, ja) in cols.iter() {
                lin.g_c[a] += weight * (ja[0] * r[0] + ja[1] * r[1]);
                for &(b, jb) in cols.iter() {
                    let val = lin.u.read(a, b) + weight * (ja[0] * jb[0] + ja[1] * jb[1]);
                    lin.u.write(a, b, val);
                }
                let wa = (jp_cols[0] * ja[0] + jp_cols[1] * ja[1]) * weight;
                *lin.w[obs.point].entry(a).or_insert(DVec3::ZERO) += wa;
            }
        }

        for prior in self.priors.iter() {
            let cam = &self.cameras[prior.camera];
            let Some(col) = cam.pose_col else {
                continue;
            };
            let r = (cam.center() - prior.center) * prior.inv_sigma;
            let r_t = cam.c_r_w.transpose();
            // d(center)/d(rotation) = -R^T [t]x, d(center)/d(translation) = -R^T
            let j_rot = -(r_t * so3::hat(cam.c_t_w)) * prior.inv_sigma;
            let j_trans = -r_t * prior.inv_sigma;
            let jac: Vec<DVec3> = (0..3)
                .map(|k| j_rot.col(k))
                .chain((0..3).map(|k| j_trans.col(k)))
                .collect();
            for a in 0..6 {
                lin.g_c[col + a] += jac[a].dot(r);
                for b in 0..6 {
                    let val = lin.u.read(col + a, col + b) + jac[a].dot(jac[b]);
                    lin.u.write(col + a, col + b, val);
                }
            }
        }

        // the residual moves one to one with the left rotation increment
        for prior in self.rotation_priors.iter() {
            let Some(col) = self.cameras[prior.camera].pose_col else {
                continue;
            };
            let r = self.rotation_residual(prior);
            let w = prior.inv_sigma * prior.inv_sigma;
            for k in 0..3 {
                lin.g_c[col + k] += prior.inv_sigma * r[k];
                let val = lin.u.read(col + k, col + k) + w;
                lin.u.write(col + k, col + k, val);
            }
        }

        lin
    }

    /// Solve the damped system. Returns camera and point increments.
    fn solve_damped(&self, lin: &Linearization, lambda: f64) -> Option<(Vec<f64>, Vec<DVec3>)> {
        let n = self.num_params;
        let mut s = lin.u.clone();
        for i in 0..n {
            let d = s.read(i, i);
            s.write(i, i, d + lambda * d.max(1e-6));
        }
        let mut rhs: Vec<f64> = lin.g_c.iter().map(|g| -g).collect();

        let mut v_inv = Vec::with_capacity(self.points.len());
        for (p, v) in lin.v.iter().enumerate() {
            let mut vd = *v;
            for k in 0..3 {
                let d = vd.col(k)[k];
                vd.col_mut(k)[k] = d + lambda * d.max(1e-6);
            }
            if vd.determinant().abs() < 1e-18 {
                return None;
            }
            let inv = vd.inverse();
            let w = &lin.w[p];
            let inv_g = inv * lin.g_p[p];
            for (&a, wa) in w.iter() {
                rhs[a] += wa.dot(inv_g);
                let inv_wa = inv * *wa;
                for (&b, wb) in w.iter() {
                    let val = s.read(b, a) - wb.dot(inv_wa);
                    s.write(b, a, val);
                }
            }
            v_inv.push(inv);
        }

        let delta_c = if n > 0 {
            let b = faer::Mat::<f64>::from_fn(n, 1, |i, _| rhs[i]);
            let sol = s.partial_piv_lu().solve(&b);
            let delta: Vec<f64> = (0..n).map(|i| sol.read(i, 0)).collect();
            if delta.iter().any(|d| !d.is_finite()) {
                return None;
            }
            delta
        } else {
            Vec::new()
        };

        let delta_p = lin
            .w
            .iter()
            .enumerate()
            .map(|(p, w)| {
                let mut acc = -lin.g_p[p];
                for (&a, wa) in w.iter() {
                    acc -= *wa * delta_c[a];
                }
                v_inv[p] * acc
            })
            .collect::<Vec<_>>();
        if delta_p.iter().any(|d| !d.is_finite()) {
            return None;
        }
        Some((delta_c, delta_p))
    }

    fn apply(&self, delta_c: &[f64], delta_p: &[DVec3]) -> Self {
        let mut next = self.clone();
        for cam in next.cameras.iter_mut() {
            if let Some(c) = cam.pose_col {
                let omega = DVec3::new(delta_c[c], delta_c[c + 1], delta_c[c + 2]);
                let dt = DVec3::new(delta_c[c + 3], delta_c[c + 4], delta_c[c + 5]);
                cam.c_r_w = so3::exp(omega) * cam.c_r_w;
                cam.c_t_w += dt;
            }
        }
        for (col, slots) in next.calib_blocks.iter() {
            for &slot in slots {
                let calib = &mut next.cameras[slot].calib;
                calib.fx = self.cameras[slot].calib.fx + delta_c[*col];
                calib.fy = self.cameras[slot].calib.fy + delta_c[col + 1];
                calib.k1 = self.cameras[slot].calib.k1 + delta_c[col + 2];
                calib.k2 = self.cameras[slot].calib.k2 + delta_c[col + 3];
            }
        }
        for (p, d) in next.points.iter_mut().zip(delta_p.iter()) {
            *p += *d;
        }
        next
    }

    /// Minimize the robust reprojection cost in place.
    pub fn optimize(
        &mut self,
        config: &BundleAdjustmentConfig,
    ) -> Result<BundleAdjustmentSummary, BundleAdjustmentError> {
        config.validate()?;
        let loss: Box<dyn RobustLoss> = if config.robust_noise {
            config.loss.build()
        } else {
            Box::new(IdentityLoss)
        };

        let initial_cost = self.cost(loss.as_ref());
        let initial_mean_reprojection_error = self.mean_reprojection_error();
        if !initial_cost.is_finite() {
            return Err(BundleAdjustmentError::Diverged {
                initial_cost,
                final_cost: initial_cost,
            });
        }

        let mut cost = initial_cost;
        let mut lambda = config.lambda_init;
        let mut termination_reason = TerminationReason::MaxIterations;
        let mut iterations = 0;
        let mut lin = self.linearize(loss.as_ref());

        while iterations < config.max_iterations {
            iterations += 1;

            let Some((delta_c, delta_p)) = self.solve_damped(&lin, lambda) else {
                lambda *= config.lambda_factor;
                if lambda > config.lambda_max {
                    termination_reason = TerminationReason::LambdaMaxExceeded;
                    break;
                }
                continue;
            };

            let step_norm = (delta_c.iter().map(|d| d * d).sum::<f64>()
                + delta_p.iter().map(|d| d.length_squared()).sum::<f64>())
            .sqrt();
            if step_norm < config.step_tolerance {
                termination_reason = TerminationReason::StepConverged;
                break;
            }

            let candidate = self.apply(&delta_c, &delta_p);
            let new_cost = candidate.cost(loss.as_ref());

            if new_cost.is_finite() && new_cost < cost {
                let rel = (cost - new_cost) / cost.max(1e-300);
                log::debug!(
                    "ba iter {}: cost {:.6e} -> {:.6e}, lambda {:.1e}",
                    iterations,
                    cost,
                    new_cost,
                    lambda
                );
                *self = candidate;
                cost = new_cost;
                lambda = (lambda / config.lambda_factor).max(1e-12);
                if rel < config.cost_tolerance {
                    termination_reason = TerminationReason::CostConverged;
                    break;
                }
                lin = self.linearize(loss.as_ref());
            } else {
                lambda *= config.lambda_factor;
                if lambda > config.lambda_max {
                    termination_reason = TerminationReason::LambdaMaxExceeded;
                    break;
                }
            }
        }

        if !cost.is_finite() || cost > initial_cost {
            return Err(BundleAdjustmentError::Diverged {
                initial_cost,
                final_cost: cost,
            });
        }

        let summary = BundleAdjustmentSummary {
            initial_cost,
            final_cost: cost,
            iterations,
            termination_reason,
            num_observations: self.observations.len(),
            num_points: self.points.len(),
            initial_mean_reprojection_error,
            final_mean_reprojection_error: self.mean_reprojection_error(),
            num_filtered_tracks: 0,
        };
        log::debug!("bundle adjustment: {:?}", summary);
        Ok(summary)
    }

    /// Write the optimized poses, calibrations and points back into `rec`.
    ///
    /// Valid tracks that were not part of the problem are invalidated.
    pub fn write_back(&self, rec: &mut Reconstruction) {
        for cam in self.cameras.iter() {
            if let Some(pose) = rec.poses.get_mut(&cam.index) {
                *pose = crate::types::GlobalPose::from_world_to_camera(cam.c_r_w, cam.c_t_w);
            }
            rec.calibrations.insert(cam.index, cam.calib);
        }
        let mut in_problem = vec![false; rec.tracks.len()];
        for (p, &t) in self.point_tracks.iter().enumerate() {
            rec.tracks[t].point = self.points[p];
            in_problem[t] = true;
        }
        for (track, used) in rec.tracks.iter_mut().zip(in_problem) {
            if !used {
                track.valid = false;
            }
        }
    }
}

fn priors_fix_gauge(rec: &Reconstruction, priors: &PosePriors) -> bool {
    let has_pose = |camera: &CameraIndex| rec.poses.contains_key(camera);
    let positioned = |p: &&AbsolutePosePrior| {
        has_pose(&p.camera) && p.w_t_c.is_some() && p.translation_sigma > 0.0
    };
    priors
        .absolute
        .iter()
        .filter(positioned)
        .filter(|p| p.w_r_c.is_some() && p.rotation_sigma > 0.0)
        .any(|full| {
            priors
                .absolute
                .iter()
                .filter(positioned)
                .any(|p| p.camera != full.camera)
        })
}

fn outer(a: DVec3, b: DVec3) -> DMat3 {
    DMat3::from_cols(a * b.x, a * b.y, a * b.z)
}

fn mul_2x3_mat3(a: &[[f64; 3]; 2], m: &DMat3) -> [[f64; 3]; 2] {
    let mut out = [[0.0; 3]; 2];
    for i in 0..2 {
        let row = DVec3::new(a[i][0], a[i][1], a[i][2]);
        for k in 0..3 {
            out[i][k] = row.dot(m.col(k));
        }
    }
    out
}

/// Refine a reconstruction and drop the tracks that end above the output threshold.
#[derive(Debug, Clone, Default)]
pub struct BundleAdjuster {
    /// Options.
    pub config: BundleAdjustmentConfig,
}

impl BundleAdjuster {
    /// Create an adjuster with the given options.
    pub fn new(config: BundleAdjustmentConfig) -> Self {
        Self { config }
    }

    /// Run the refinement and the output track filter.
    ///
    /// The returned reconstruction contains valid tracks only and has `refined = true`.
    pub fn run(
        &self,
        rec: &Reconstruction,
        priors: &PosePriors,
    ) -> Result<(Reconstruction, BundleAdjustmentSummary), BundleAdjustmentError> {
        let mut problem = BundleAdjustmentProblem::new(rec, priors, &self.config)?;
        let mut summary = problem.optimize(&self.config)?;

        let mut out = rec.clone();
        problem.write_back(&mut out);

        let num_before = out.valid_tracks().count();
        let threshold = self.config.output_reproj_error_threshold;
        for track in out.tracks.iter_mut().filter(|t| t.valid) {
            let err = track.mean_reprojection_error(&out.poses, &out.calibrations);
            if err.is_nan() || err > threshold {
                track.valid = false;
            }
        }
        out.retain_valid_tracks();
        out.refined = true;
        summary.num_filtered_tracks = num_before - out.tracks.len();

        log::info!(
            "bundle adjustment: {} iterations ({:?}), mean error {:.3} -> {:.3} px, {} tracks kept, {} filtered",
            summary.iterations,
            summary.termination_reason,
            summary.initial_mean_reprojection_error,
            summary.final_mean_reprojection_error,
            out.tracks.len(),
            summary.num_filtered_tracks
        );
        Ok((out, summary))
    }
}
