#![allow(dead_code)]

use glam::{DMat3, DVec3};
use kornia_sfm::camera::PinholeCamera;
use kornia_sfm::geometry::so3;
use kornia_sfm::types::{
    AbsolutePosePrior, GlobalPose, Keypoints, PairCorrespondences, PosePriors, RelativePoseEdge,
};
use kornia_sfm::SfmInput;
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;

/// Cameras and points of a synthetic scene, in the ground-truth world frame.
pub struct SyntheticScene {
    pub camera: PinholeCamera,
    pub poses: Vec<GlobalPose>,
    pub points: Vec<DVec3>,
}

fn look_at(center: DVec3, target: DVec3) -> DMat3 {
    let z = (target - center).normalize();
    let x = DVec3::Y.cross(z).normalize();
    let y = z.cross(x);
    DMat3::from_cols(x, y, z)
}

/// Four cameras on the corners of a 2 x 2 square, five units in front of twenty points
/// spread over a 3 x 3 x 3 cube.
pub fn square_scene(seed: u64) -> SyntheticScene {
    let corners = [
        DVec3::new(-1.0, -1.0, -5.0),
        DVec3::new(1.0, -1.0, -5.0),
        DVec3::new(1.0, 1.0, -5.0),
        DVec3::new(-1.0, 1.0, -5.0),
    ];
    let poses = corners
        .iter()
        .map(|&c| GlobalPose::new(look_at(c, DVec3::ZERO), c))
        .collect();

    let mut rng = StdRng::seed_from_u64(seed);
    let points = (0..20)
        .map(|_| {
            DVec3::new(
                rng.random_range(-1.5..1.5),
                rng.random_range(-1.5..1.5),
                rng.random_range(-1.5..1.5),
            )
        })
        .collect();

    SyntheticScene {
        camera: PinholeCamera::new(500.0, 500.0, 320.0, 240.0),
        poses,
        points,
    }
}

impl SyntheticScene {
    /// Length of the side of the square.
    pub fn baseline(&self) -> f64 {
        (self.poses[1].w_t_c - self.poses[0].w_t_c).length()
    }

    /// Projections of every point, keypoint `k` observes point `k`.
    ///
    /// Gaussian noise of `sigma` pixels is added, clamped to 0.5 pixels per axis.
    pub fn keypoints(&self, sigma: f64, seed: u64) -> Vec<Keypoints> {
        let mut rng = StdRng::seed_from_u64(seed);
        self.poses
            .iter()
            .map(|pose| {
                let coordinates = self
                    .points
                    .iter()
                    .map(|&x| {
                        let px = self
                            .camera
                            .project(pose.to_camera(x))
                            .expect("synthetic point behind a camera");
                        let nx: f64 = rng.sample(StandardNormal);
                        let ny: f64 = rng.sample(StandardNormal);
                        [
                            px.x + (sigma * nx).clamp(-0.5, 0.5),
                            px.y + (sigma * ny).clamp(-0.5, 0.5),
                        ]
                    })
                    .collect();
                Keypoints::from_coordinates(coordinates)
            })
            .collect()
    }

    /// Identity matches between every pair of cameras.
    pub fn correspondences(&self) -> Vec<PairCorrespondences> {
        let n = self.poses.len();
        let mut out = Vec::new();
        for i1 in 0..n {
            for i2 in i1 + 1..n {
                out.push(PairCorrespondences {
                    i1,
                    i2,
                    matches: (0..self.points.len()).map(|k| [k, k]).collect(),
                });
            }
        }
        out
    }

    /// Ground-truth edges carrying the identity matches as inliers.
    pub fn edges(&self) -> Vec<RelativePoseEdge> {
        self.correspondences()
            .into_iter()
            .map(|c| {
                let mut e = RelativePoseEdge::from_poses(
                    c.i1,
                    c.i2,
                    &self.poses[c.i1],
                    &self.poses[c.i2],
                );
                e.inliers = c.matches;
                e
            })
            .collect()
    }

    /// Full pose prior on camera 0 and a position prior on camera 1, positions scaled by
    /// `scale`. They fix the rotation gauge and the scale of the reconstruction.
    pub fn priors(&self, scale: f64) -> PosePriors {
        PosePriors {
            absolute: vec![
                AbsolutePosePrior {
                    camera: 0,
                    w_r_c: Some(self.poses[0].w_r_c),
                    w_t_c: Some(scale * self.poses[0].w_t_c),
                    rotation_sigma: 1e-3,
                    translation_sigma: 1e-2,
                },
                AbsolutePosePrior {
                    camera: 1,
                    w_r_c: None,
                    w_t_c: Some(scale * self.poses[1].w_t_c),
                    rotation_sigma: 1e-3,
                    translation_sigma: 1e-2,
                },
            ],
            relative: vec![],
        }
    }

    /// Pipeline input with noisy keypoints and priors at scale one.
    pub fn input(&self, sigma: f64, seed: u64) -> SfmInput {
        SfmInput {
            num_cameras: self.poses.len(),
            calibrations: vec![self.camera; self.poses.len()],
            keypoints: self.keypoints(sigma, seed),
            correspondences: self.correspondences(),
            priors: self.priors(1.0),
        }
    }
}

/// Angle between two rotations, in degrees.
pub fn rotation_error_deg(a: &DMat3, b: &DMat3) -> f64 {
    so3::angle_between(a, b).to_degrees()
}
