use std::collections::BTreeMap;

use glam::{DMat3, DVec3};
use serde::{Deserialize, Serialize};

use crate::bundle_adjustment::losses::{HuberLoss, LossFunction, RobustLoss};
use crate::data_association::union_find::UnionFind;
use crate::geometry::linalg::LeastSquares;
use crate::geometry::so3;
use crate::types::{CameraIndex, PosePriors, RelativePoseEdge};

use super::AveragingError;

/// Global rotation synchronization over one connected component.
pub trait RotationAveraging: Send + Sync {
    /// Estimate the camera-to-world rotation of every camera in `cameras`.
    ///
    /// Edges whose endpoints are not both in `cameras` are ignored.
    fn average(
        &self,
        cameras: &[CameraIndex],
        edges: &[RelativePoseEdge],
        priors: &PosePriors,
    ) -> Result<BTreeMap<CameraIndex, DMat3>, AveragingError>;
}

/// Options of [`ChordalRotationAveraging`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationAveragingConfig {
    /// Robust loss on the angular edge residual (radians). A Cauchy loss is warm started
    /// with a Huber loss of the same scale.
    pub loss: LossFunction,
    /// Iteration cap of the robust refinement.
    pub max_iterations: usize,
    /// Step norm (radians) below which the refinement stops.
    pub tolerance: f64,
    /// Nominal angular noise of a measured edge (radians); priors are weighted against it.
    pub measurement_sigma: f64,
}

impl Default for RotationAveragingConfig {
    fn default() -> Self {
        Self {
            loss: LossFunction::Cauchy {
                scale: 5f64.to_radians(),
            },
            max_iterations: 100,
            tolerance: 1e-7,
            measurement_sigma: 1f64.to_radians(),
        }
    }
}

/// Chordal relaxation followed by a robust Lie-algebraic refinement.
#[derive(Debug, Clone, Default)]
pub struct ChordalRotationAveraging {
    config: RotationAveragingConfig,
}

// a rotation constraint `dst_r = src_r * rel` between two unknowns
#[derive(Debug, Clone, Copy)]
struct Constraint {
    i1: CameraIndex,
    i2: CameraIndex,
    i2_r_i1: DMat3,
    weight: f64,
    robust: bool,
}

#[derive(Debug, Clone, Copy)]
struct AbsoluteConstraint {
    camera: CameraIndex,
    w_r_c: DMat3,
    weight: f64,
}

#[inline]
fn entry(m: &DMat3, r: usize, c: usize) -> f64 {
    m.col(c)[r]
}

impl ChordalRotationAveraging {
    /// Create the averager.
    pub fn new(config: RotationAveragingConfig) -> Self {
        Self { config }
    }

    fn constraints(
        &self,
        cameras: &[CameraIndex],
        edges: &[RelativePoseEdge],
        priors: &PosePriors,
    ) -> (Vec<Constraint>, Vec<AbsoluteConstraint>) {
        let in_set = |c: CameraIndex| cameras.binary_search(&c).is_ok();
        let sigma = self.config.measurement_sigma;

        let mut relative: Vec<Constraint> = edges
            .iter()
            .filter(|e| e.i1 != e.i2 && in_set(e.i1) && in_set(e.i2))
            .map(|e| Constraint {
                i1: e.i1,
                i2: e.i2,
                i2_r_i1: e.i2_r_i1,
                weight: 1.0,
                robust: true,
            })
            .collect();
        relative.extend(
            priors
                .relative_ordered()
                .into_values()
                .filter(|p| p.i1 != p.i2 && in_set(p.i1) && in_set(p.i2))
                .map(|p| Constraint {
                    i1: p.i1,
                    i2: p.i2,
                    i2_r_i1: p.i2_r_i1,
                    weight: (sigma / p.rotation_sigma.max(1e-12)).powi(2),
                    robust: false,
                }),
        );

        let absolute = priors
            .absolute
            .iter()
            .filter(|p| in_set(p.camera))
            .filter_map(|p| {
                p.w_r_c.map(|r| AbsoluteConstraint {
                    camera: p.camera,
                    w_r_c: r,
                    weight: (sigma / p.rotation_sigma.max(1e-12)).powi(2),
                })
            })
            .collect();
        (relative, absolute)
    }

    /// Linear chordal initialization, each block projected back to SO(3).
    fn chordal(
        &self,
        cameras: &[CameraIndex],
        relative: &[Constraint],
        absolute: &[AbsoluteConstraint],
    ) -> Result<BTreeMap<CameraIndex, DMat3>, AveragingError> {
        // without absolute priors the lowest camera is the identity
        let anchor = absolute.is_empty().then_some(cameras[0]);
        let slot: BTreeMap<CameraIndex, usize> = cameras
            .iter()
            .filter(|&&c| Some(c) != anchor)
            .enumerate()
            .map(|(i, &c)| (c, i))
            .collect();
        let mut ls = LeastSquares::new(9 * slot.len());
        let var = |c: CameraIndex, r: usize, k: usize| slot.get(&c).map(|s| 9 * s + 3 * r + k);

        // R_i1 - R_i2 * i2_r_i1 = 0, entry by entry
        let mut coeffs = Vec::with_capacity(4);
        for con in relative {
            for r in 0..3 {
                for c in 0..3 {
                    coeffs.clear();
                    let mut rhs = 0.0;
                    match var(con.i1, r, c) {
                        Some(v) => coeffs.push((v, 1.0)),
                        None => rhs -= if r == c { 1.0 } else { 0.0 },
                    }
                    for k in 0..3 {
                        let q = entry(&con.i2_r_i1, k, c);
                        match var(con.i2, r, k) {
                            Some(v) => coeffs.push((v, -q)),
                            None => rhs += if r == k { q } else { 0.0 },
                        }
                    }
                    if !coeffs.is_empty() {
                        ls.add_row(&coeffs, rhs, con.weight);
                    }
                }
            }
        }
        for con in absolute {
            for r in 0..3 {
                for c in 0..3 {
                    if let Some(v) = var(con.camera, r, c) {
                        ls.add_row(&[(v, 1.0)], entry(&con.w_r_c, r, c), con.weight);
                    }
                }
            }
        }

        let x = if slot.is_empty() {
            Vec::new()
        } else {
            ls.solve()?
        };
        let mut rotations = BTreeMap::new();
        for &cam in cameras {
            let r = match slot.get(&cam) {
                Some(&s) => {
                    let b = &x[9 * s..9 * s + 9];
                    let m = DMat3::from_cols(
                        DVec3::new(b[0], b[3], b[6]),
                        DVec3::new(b[1], b[4], b[7]),
                        DVec3::new(b[2], b[5], b[8]),
                    );
                    so3::project_to_so3(&m)
                }
                None => DMat3::IDENTITY,
            };
            if !r.is_finite() {
                return Err(AveragingError::Degenerate(format!(
                    "non-finite rotation for camera {cam}"
                )));
            }
            rotations.insert(cam, r);
        }
        Ok(rotations)
    }

    /// IRLS on left world-frame increments `R_i <- exp(d_i) R_i`.
    fn refine(
        &self,
        cameras: &[CameraIndex],
        relative: &[Constraint],
        absolute: &[AbsoluteConstraint],
        loss: &dyn RobustLoss,
        rotations: &mut BTreeMap<CameraIndex, DMat3>,
    ) -> Result<usize, AveragingError> {
        let anchor = absolute.is_empty().then_some(cameras[0]);
        let slot: BTreeMap<CameraIndex, usize> = cameras
            .iter()
            .filter(|&&c| Some(c) != anchor)
            .enumerate()
            .map(|(i, &c)| (c, i))
            .collect();
        if slot.is_empty() {
            return Ok(0);
        }

        let mut step = f64::INFINITY;
        for iteration in 0..self.config.max_iterations {
            let mut ls = LeastSquares::new(3 * slot.len());
            for con in relative {
                let (r1, r2) = (rotations[&con.i1], rotations[&con.i2]);
                let err = so3::log(&(con.i2_r_i1.transpose() * r2.transpose() * r1));
                let w = if con.robust {
                    loss.weight(err.length_squared())
                } else {
                    1.0
                };
                // d_i1 - d_i2 = -R_i1 log(E)
                let rhs = -(r1 * err);
                for k in 0..3 {
                    let mut coeffs = Vec::with_capacity(2);
                    if let Some(&s) = slot.get(&con.i1) {
                        coeffs.push((3 * s + k, 1.0));
                    }
                    if let Some(&s) = slot.get(&con.i2) {
                        coeffs.push((3 * s + k, -1.0));
                    }
                    if !coeffs.is_empty() {
                        ls.add_row(&coeffs, rhs[k], w * con.weight);
                    }
                }
            }
            for con in absolute {
                let Some(&s) = slot.get(&con.camera) else {
                    continue;
                };
                let r = rotations[&con.camera];
                let rhs = -(r * so3::log(&(con.w_r_c.transpose() * r)));
                for k in 0..3 {
                    ls.add_row(&[(3 * s + k, 1.0)], rhs[k], con.weight);
                }
            }

            let delta = ls.solve()?;
            step = 0.0;
            for (&cam, &s) in slot.iter() {
                let d = DVec3::new(delta[3 * s], delta[3 * s + 1], delta[3 * s + 2]);
                step = f64::max(step, d.length());
                if let Some(r) = rotations.get_mut(&cam) {
                    *r = so3::project_to_so3(&(so3::exp(d) * *r));
                }
            }
            log::debug!("rotation averaging iteration {}: step {:.3e}", iteration, step);
            if !step.is_finite() {
                return Err(AveragingError::Degenerate("non-finite update".to_string()));
            }
            if step < self.config.tolerance {
                return Ok(iteration + 1);
            }
        }

        // only a large last step counts as non-convergence
        if step > 1e3 * self.config.tolerance.max(1e-9) {
            return Err(AveragingError::NotConverged {
                iterations: self.config.max_iterations,
                step,
            });
        }
        Ok(self.config.max_iterations)
    }
}

impl RotationAveraging for ChordalRotationAveraging {
    fn average(
        &self,
        cameras: &[CameraIndex],
        edges: &[RelativePoseEdge],
        priors: &PosePriors,
    ) -> Result<BTreeMap<CameraIndex, DMat3>, AveragingError> {
        let mut cameras = cameras.to_vec();
        cameras.sort_unstable();
        cameras.dedup();
        if cameras.is_empty() {
            return Ok(BTreeMap::new());
        }

        let (relative, absolute) = self.constraints(&cameras, edges, priors);

        // every camera must be reachable through the constraints
        let mut uf = UnionFind::new(cameras.len());
        for con in relative.iter() {
            let slots = (cameras.binary_search(&con.i1), cameras.binary_search(&con.i2));
            if let (Ok(a), Ok(b)) = slots {
                uf.union(a, b);
            }
        }
        if relative.len() + 1 < cameras.len() || uf.set_size(0) != cameras.len() {
            return Err(AveragingError::TooFewEdges {
                edges: relative.len(),
                cameras: cameras.len(),
            });
        }

        let mut rotations = self.chordal(&cameras, &relative, &absolute)?;
        let mut iterations = 0;
        if let LossFunction::Cauchy { scale } = self.config.loss {
            let huber = HuberLoss::new(scale);
            iterations += self.refine(&cameras, &relative, &absolute, &huber, &mut rotations)?;
        }
        let loss = self.config.loss.build();
        iterations +=
            self.refine(&cameras, &relative, &absolute, loss.as_ref(), &mut rotations)?;
        log::info!(
            "rotation averaging: {} cameras, {} constraints, {} refinement iterations",
            cameras.len(),
            relative.len() + absolute.len(),
            iterations
        );
        Ok(rotations)
    }
}
