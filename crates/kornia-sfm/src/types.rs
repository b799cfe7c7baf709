//! Core data model shared by every stage of the reconstruction.

use std::collections::BTreeMap;

use glam::{DMat3, DVec2, DVec3};
use serde::{Deserialize, Serialize};

use crate::camera::PinholeCamera;

/// Stable identity of an image/camera in the reconstruction.
pub type CameraIndex = usize;

/// Ordered camera pair `(i1, i2)` with `i1 < i2`.
pub type PairKey = (CameraIndex, CameraIndex);

/// Order two camera indices into a [`PairKey`]. Returns whether they were swapped.
pub fn pair_key(a: CameraIndex, b: CameraIndex) -> (PairKey, bool) {
    if a <= b {
        ((a, b), false)
    } else {
        ((b, a), true)
    }
}

/// Ordered 2D detections of one image.
#[derive(
    Debug, Clone, Default, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct Keypoints {
    /// Pixel coordinates `[x, y]`.
    pub coordinates: Vec<[f64; 2]>,
    /// Optional detection scale per keypoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scales: Option<Vec<f64>>,
    /// Optional orientation (radians) per keypoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orientations: Option<Vec<f64>>,
}

impl Keypoints {
    /// Keypoints with coordinates only.
    pub fn from_coordinates(coordinates: Vec<[f64; 2]>) -> Self {
        Self {
            coordinates,
            scales: None,
            orientations: None,
        }
    }

    /// Number of keypoints.
    pub fn len(&self) -> usize {
        self.coordinates.len()
    }

    /// Whether there are no keypoints.
    pub fn is_empty(&self) -> bool {
        self.coordinates.is_empty()
    }

    /// Pixel coordinates of keypoint `index`.
    pub fn point(&self, index: usize) -> Option<DVec2> {
        self.coordinates
            .get(index)
            .map(|&[x, y]| DVec2::new(x, y))
    }
}

/// Putative keypoint index pairs `[index in i1, index in i2]` between two images.
#[derive(
    Debug, Clone, Default, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct PairCorrespondences {
    /// First camera.
    pub i1: CameraIndex,
    /// Second camera.
    pub i2: CameraIndex,
    /// Matched keypoint indices.
    pub matches: Vec<[usize; 2]>,
}

impl PairCorrespondences {
    /// Express the correspondences with `i1 < i2`, swapping columns if needed.
    pub fn ordered(mut self) -> Self {
        if self.i1 > self.i2 {
            std::mem::swap(&mut self.i1, &mut self.i2);
            for m in self.matches.iter_mut() {
                m.swap(0, 1);
            }
        }
        self
    }

    /// Pair key of the correspondences.
    pub fn key(&self) -> PairKey {
        pair_key(self.i1, self.i2).0
    }
}

/// A verified two-view measurement between cameras `i1 < i2`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelativePoseEdge {
    /// First camera.
    pub i1: CameraIndex,
    /// Second camera.
    pub i2: CameraIndex,
    /// Rotation taking points from camera `i1`'s frame to camera `i2`'s frame.
    pub i2_r_i1: DMat3,
    /// Unit direction, in camera `i2`'s frame, from camera `i2`'s centre to camera `i1`'s.
    pub i2_u_i1: DVec3,
    /// Inlier correspondences `[keypoint in i1, keypoint in i2]`.
    pub inliers: Vec<[usize; 2]>,
    /// Ratio of inliers to putative correspondences.
    pub inlier_ratio: f64,
    /// Whether the measurement comes (partly) from a pose prior.
    #[serde(default)]
    pub from_prior: bool,
}

impl RelativePoseEdge {
    /// Pair key of the edge.
    pub fn key(&self) -> PairKey {
        (self.i1, self.i2)
    }

    /// Build an edge from world poses, mostly for tests and synthetic data.
    pub fn from_poses(i1: CameraIndex, i2: CameraIndex, p1: &GlobalPose, p2: &GlobalPose) -> Self {
        let i2_r_i1 = p2.w_r_c.transpose() * p1.w_r_c;
        let i2_u_i1 = (p2.w_r_c.transpose() * (p1.w_t_c - p2.w_t_c)).normalize_or_zero();
        Self {
            i1,
            i2,
            i2_r_i1,
            i2_u_i1,
            inliers: Vec::new(),
            inlier_ratio: 1.0,
            from_prior: false,
        }
    }

    /// Number of inlier correspondences.
    pub fn num_inliers(&self) -> usize {
        self.inliers.len()
    }
}

/// How strictly a relative prior constrains the measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorStrength {
    /// The prior replaces the measured relative pose.
    Hard,
    /// The prior is an additional weighted measurement.
    #[default]
    Soft,
}

/// Prior relative pose between two cameras.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelativePosePrior {
    /// First camera.
    pub i1: CameraIndex,
    /// Second camera.
    pub i2: CameraIndex,
    /// Rotation from `i1`'s frame to `i2`'s frame.
    pub i2_r_i1: DMat3,
    /// Translation of the transform `X2 = R X1 + t`, with metric scale.
    pub i2_t_i1: DVec3,
    /// Rotation standard deviation (radians).
    #[serde(default = "default_rotation_sigma")]
    pub rotation_sigma: f64,
    /// Translation standard deviation (scene units).
    #[serde(default = "default_translation_sigma")]
    pub translation_sigma: f64,
    /// Hard or soft constraint.
    #[serde(default)]
    pub strength: PriorStrength,
}

fn default_rotation_sigma() -> f64 {
    1f64.to_radians()
}

fn default_translation_sigma() -> f64 {
    0.1
}

impl RelativePosePrior {
    /// Express the prior for the ordered pair `(min, max)`.
    pub fn ordered(&self) -> Self {
        if self.i1 <= self.i2 {
            return self.clone();
        }
        let i1_r_i2 = self.i2_r_i1.transpose();
        Self {
            i1: self.i2,
            i2: self.i1,
            i2_r_i1: i1_r_i2,
            i2_t_i1: -(i1_r_i2 * self.i2_t_i1),
            ..self.clone()
        }
    }

    /// Unit direction from `i2`'s centre to `i1`'s centre in `i2`'s frame.
    pub fn direction(&self) -> DVec3 {
        self.i2_t_i1.normalize_or_zero()
    }
}

/// Prior on the absolute pose of one camera.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbsolutePosePrior {
    /// Camera index.
    pub camera: CameraIndex,
    /// Camera-to-world rotation, if known.
    #[serde(default)]
    pub w_r_c: Option<DMat3>,
    /// Camera centre in the world frame, if known.
    #[serde(default)]
    pub w_t_c: Option<DVec3>,
    /// Rotation standard deviation (radians).
    #[serde(default = "default_rotation_sigma")]
    pub rotation_sigma: f64,
    /// Position standard deviation (scene units).
    #[serde(default = "default_translation_sigma")]
    pub translation_sigma: f64,
}

/// Optional pose priors keyed by camera or by camera pair.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PosePriors {
    /// Absolute priors, at most one per camera.
    #[serde(default)]
    pub absolute: Vec<AbsolutePosePrior>,
    /// Relative priors, at most one per pair.
    #[serde(default)]
    pub relative: Vec<RelativePosePrior>,
}

impl PosePriors {
    /// Whether no prior is present.
    pub fn is_empty(&self) -> bool {
        self.absolute.is_empty() && self.relative.is_empty()
    }

    /// Absolute prior of a camera.
    pub fn absolute_for(&self, camera: CameraIndex) -> Option<&AbsolutePosePrior> {
        self.absolute.iter().find(|p| p.camera == camera)
    }

    /// Relative prior of an ordered pair, expressed for that order.
    pub fn relative_for(&self, key: PairKey) -> Option<RelativePosePrior> {
        self.relative
            .iter()
            .map(RelativePosePrior::ordered)
            .find(|p| (p.i1, p.i2) == key)
    }

    /// Relative priors expressed for ordered pairs, sorted by pair.
    pub fn relative_ordered(&self) -> BTreeMap<PairKey, RelativePosePrior> {
        self.relative
            .iter()
            .map(|p| {
                let p = p.ordered();
                ((p.i1, p.i2), p)
            })
            .collect()
    }
}

/// Pose of a camera in the world frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GlobalPose {
    /// Camera-to-world rotation.
    pub w_r_c: DMat3,
    /// Camera centre in the world frame.
    pub w_t_c: DVec3,
}

impl Default for GlobalPose {
    fn default() -> Self {
        Self {
            w_r_c: DMat3::IDENTITY,
            w_t_c: DVec3::ZERO,
        }
    }
}

impl GlobalPose {
    /// Create a pose from a camera-to-world rotation and a camera centre.
    pub fn new(w_r_c: DMat3, w_t_c: DVec3) -> Self {
        Self { w_r_c, w_t_c }
    }

    /// World-to-camera rotation.
    pub fn c_r_w(&self) -> DMat3 {
        self.w_r_c.transpose()
    }

    /// World-to-camera translation.
    pub fn c_t_w(&self) -> DVec3 {
        -(self.w_r_c.transpose() * self.w_t_c)
    }

    /// Build a pose from a world-to-camera transform.
    pub fn from_world_to_camera(c_r_w: DMat3, c_t_w: DVec3) -> Self {
        let w_r_c = c_r_w.transpose();
        Self {
            w_r_c,
            w_t_c: -(w_r_c * c_t_w),
        }
    }

    /// Express a world point in the camera frame.
    pub fn to_camera(&self, x: DVec3) -> DVec3 {
        self.w_r_c.transpose() * (x - self.w_t_c)
    }
}

/// One observation of a track: a keypoint of a camera.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// Observing camera.
    pub camera: CameraIndex,
    /// Keypoint index in that camera.
    pub keypoint: usize,
    /// Pixel coordinates of the keypoint.
    pub pixel: DVec2,
}

/// A 3D point and its observations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    /// Observations, one per camera, sorted by camera index.
    pub observations: Vec<Observation>,
    /// Triangulated world point.
    pub point: DVec3,
    /// Whether the point passed triangulation/refinement checks.
    pub valid: bool,
}

impl Track {
    /// Number of observations.
    pub fn len(&self) -> usize {
        self.observations.len()
    }

    /// Whether the track has no observations.
    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    /// Pixel reprojection errors of every observation, `None` for missing cameras or
    /// observations behind the camera.
    pub fn reprojection_errors(
        &self,
        poses: &BTreeMap<CameraIndex, GlobalPose>,
        calibrations: &BTreeMap<CameraIndex, PinholeCamera>,
    ) -> Vec<Option<f64>> {
        self.observations
            .iter()
            .map(|obs| {
                let pose = poses.get(&obs.camera)?;
                let cam = calibrations.get(&obs.camera)?;
                let px = cam.project(pose.to_camera(self.point))?;
                Some((px - obs.pixel).length())
            })
            .collect()
    }

    /// Mean pixel reprojection error, infinite if any observation cannot be projected.
    pub fn mean_reprojection_error(
        &self,
        poses: &BTreeMap<CameraIndex, GlobalPose>,
        calibrations: &BTreeMap<CameraIndex, PinholeCamera>,
    ) -> f64 {
        let errors = self.reprojection_errors(poses, calibrations);
        if errors.is_empty() {
            return f64::INFINITY;
        }
        let mut sum = 0.0;
        for e in errors {
            match e {
                Some(e) => sum += e,
                None => return f64::INFINITY,
            }
        }
        sum / self.observations.len() as f64
    }
}

/// Summary statistics of a reconstruction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ReconstructionStats {
    /// Number of cameras with a pose.
    pub num_cameras: usize,
    /// Number of valid tracks.
    pub num_tracks: usize,
    /// Mean number of observations per valid track.
    pub mean_track_length: f64,
    /// Mean pixel reprojection error over all valid observations.
    pub mean_reprojection_error: f64,
    /// Median pixel reprojection error over all valid observations.
    pub median_reprojection_error: f64,
}

/// Poses, calibrations and valid tracks of one connected component.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Reconstruction {
    /// Global pose per reconstructed camera.
    pub poses: BTreeMap<CameraIndex, GlobalPose>,
    /// Calibration per reconstructed camera.
    pub calibrations: BTreeMap<CameraIndex, PinholeCamera>,
    /// Tracks of the reconstruction.
    pub tracks: Vec<Track>,
    /// Whether bundle adjustment refined the estimate.
    #[serde(default)]
    pub refined: bool,
}

impl Reconstruction {
    /// Cameras of the reconstruction, sorted.
    pub fn cameras(&self) -> Vec<CameraIndex> {
        self.poses.keys().copied().collect()
    }

    /// Iterator over valid tracks.
    pub fn valid_tracks(&self) -> impl Iterator<Item = &Track> {
        self.tracks.iter().filter(|t| t.valid)
    }

    /// Drop invalid tracks.
    pub fn retain_valid_tracks(&mut self) {
        self.tracks.retain(|t| t.valid);
    }

    /// Compute summary statistics over the valid tracks.
    pub fn stats(&self) -> ReconstructionStats {
        let mut errors = Vec::new();
        let mut num_tracks = 0;
        let mut num_obs = 0;
        for track in self.valid_tracks() {
            num_tracks += 1;
            num_obs += track.len();
            errors.extend(
                track
                    .reprojection_errors(&self.poses, &self.calibrations)
                    .into_iter()
                    .flatten(),
            );
        }
        errors.sort_by(|a, b| a.total_cmp(b));

        let mean = |v: &[f64]| {
            if v.is_empty() {
                0.0
            } else {
                v.iter().sum::<f64>() / v.len() as f64
            }
        };
        ReconstructionStats {
            num_cameras: self.poses.len(),
            num_tracks,
            mean_track_length: if num_tracks > 0 {
                num_obs as f64 / num_tracks as f64
            } else {
                0.0
            },
            mean_reprojection_error: mean(&errors),
            median_reprojection_error: if errors.is_empty() {
                0.0
            } else {
                errors[errors.len() / 2]
            },
        }
    }
}
