//! Pinhole camera model with two-coefficient radial distortion.

use glam::{DMat3, DVec2, DVec3};
use serde::{Deserialize, Serialize};

/// Error types for camera operations.
#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum CameraError {
    /// Focal lengths must be strictly positive and finite.
    #[error("Invalid focal length: fx={0}, fy={1}")]
    InvalidFocalLength(f64, f64),
    /// No calibration is available for the requested camera.
    #[error("No calibration for camera {0}")]
    MissingCalibration(usize),
}

/// Intrinsic parameters of a pinhole camera with radial distortion `k1`, `k2`.
///
/// A point `(x, y)` on the normalized image plane is distorted as
/// `(x, y) * (1 + k1 r^2 + k2 r^4)` with `r^2 = x^2 + y^2` and then mapped to pixels
/// with the focal lengths and principal point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PinholeCamera {
    /// Focal length in x direction (pixels).
    pub fx: f64,
    /// Focal length in y direction (pixels).
    pub fy: f64,
    /// Principal point x coordinate (pixels).
    pub cx: f64,
    /// Principal point y coordinate (pixels).
    pub cy: f64,
    /// First radial distortion coefficient.
    #[serde(default)]
    pub k1: f64,
    /// Second radial distortion coefficient.
    #[serde(default)]
    pub k2: f64,
}

impl PinholeCamera {
    /// Create an undistorted camera.
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64) -> Self {
        Self {
            fx,
            fy,
            cx,
            cy,
            k1: 0.0,
            k2: 0.0,
        }
    }

    /// Create a camera with radial distortion.
    pub fn with_distortion(fx: f64, fy: f64, cx: f64, cy: f64, k1: f64, k2: f64) -> Self {
        Self {
            fx,
            fy,
            cx,
            cy,
            k1,
            k2,
        }
    }

    /// Check that the focal lengths are usable.
    pub fn validate(&self) -> Result<(), CameraError> {
        if !(self.fx.is_finite() && self.fy.is_finite() && self.fx > 0.0 && self.fy > 0.0) {
            return Err(CameraError::InvalidFocalLength(self.fx, self.fy));
        }
        Ok(())
    }

    /// Whether any distortion coefficient is non zero.
    pub fn has_distortion(&self) -> bool {
        self.k1 != 0.0 || self.k2 != 0.0
    }

    /// The 3x3 intrinsics matrix `K`.
    pub fn k_matrix(&self) -> DMat3 {
        DMat3::from_cols(
            DVec3::new(self.fx, 0.0, 0.0),
            DVec3::new(0.0, self.fy, 0.0),
            DVec3::new(self.cx, self.cy, 1.0),
        )
    }

    /// Radial distortion factor for a normalized point.
    pub fn distortion_factor(&self, xn: DVec2) -> f64 {
        let r2 = xn.length_squared();
        1.0 + self.k1 * r2 + self.k2 * r2 * r2
    }

    /// Map a normalized image point to pixels.
    pub fn normalized_to_pixel(&self, xn: DVec2) -> DVec2 {
        let d = self.distortion_factor(xn);
        DVec2::new(self.fx * xn.x * d + self.cx, self.fy * xn.y * d + self.cy)
    }

    /// Project a point expressed in the camera frame. Returns `None` behind the camera.
    pub fn project(&self, p_cam: DVec3) -> Option<DVec2> {
        if p_cam.z <= 1e-12 {
            return None;
        }
        Some(self.normalized_to_pixel(DVec2::new(p_cam.x / p_cam.z, p_cam.y / p_cam.z)))
    }

    /// Map a pixel to the undistorted normalized image plane.
    ///
    /// The radial model is inverted with a fixed point iteration.
    pub fn pixel_to_normalized(&self, px: DVec2) -> DVec2 {
        let xd = DVec2::new((px.x - self.cx) / self.fx, (px.y - self.cy) / self.fy);
        if !self.has_distortion() {
            return xd;
        }

        const MAX_ITERATIONS: usize = 20;
        const EPSILON: f64 = 1e-12;

        let mut xu = xd;
        for _ in 0..MAX_ITERATIONS {
            let next = xd / self.distortion_factor(xu);
            let step = (next - xu).length();
            xu = next;
            if step < EPSILON {
                break;
            }
        }
        xu
    }

    /// Unit bearing vector in the camera frame for a pixel.
    pub fn bearing(&self, px: DVec2) -> DVec3 {
        let xn = self.pixel_to_normalized(px);
        DVec3::new(xn.x, xn.y, 1.0).normalize()
    }

    /// Mean focal length, used to convert pixel thresholds to angles.
    pub fn mean_focal(&self) -> f64 {
        0.5 * (self.fx + self.fy)
    }
}

impl Default for PinholeCamera {
    fn default() -> Self {
        Self::new(1000.0, 1000.0, 640.0, 480.0)
    }
}

/// Access to per-camera intrinsics by camera index.
pub trait CalibrationSource {
    /// Intrinsics of camera `index`.
    fn calibration(&self, index: usize) -> Result<PinholeCamera, CameraError>;

    /// Number of cameras this source knows about, if bounded.
    fn num_cameras(&self) -> Option<usize>;
}

impl CalibrationSource for [PinholeCamera] {
    fn calibration(&self, index: usize) -> Result<PinholeCamera, CameraError> {
        self.get(index)
            .copied()
            .ok_or(CameraError::MissingCalibration(index))
    }

    fn num_cameras(&self) -> Option<usize> {
        Some(self.len())
    }
}

impl CalibrationSource for Vec<PinholeCamera> {
    fn calibration(&self, index: usize) -> Result<PinholeCamera, CameraError> {
        self.as_slice().calibration(index)
    }

    fn num_cameras(&self) -> Option<usize> {
        Some(self.len())
    }
}

/// One calibration shared by every camera.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SharedCalibration(pub PinholeCamera);

impl CalibrationSource for SharedCalibration {
    fn calibration(&self, _index: usize) -> Result<PinholeCamera, CameraError> {
        Ok(self.0)
    }

    fn num_cameras(&self) -> Option<usize> {
        None
    }
}

/// Collect `num_cameras` calibrations from a source.
pub fn collect_calibrations<S: CalibrationSource + ?Sized>(
    source: &S,
    num_cameras: usize,
) -> Result<Vec<PinholeCamera>, CameraError> {
    (0..num_cameras).map(|i| source.calibration(i)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_project_unproject() {
        let cam = PinholeCamera::with_distortion(800.0, 820.0, 320.0, 240.0, -0.1, 0.01);
        let p = DVec3::new(0.3, -0.2, 2.0);
        let px = cam.project(p).unwrap();
        let xn = cam.pixel_to_normalized(px);
        assert_relative_eq!(xn.x, 0.15, epsilon = 1e-9);
        assert_relative_eq!(xn.y, -0.1, epsilon = 1e-9);
        let b = cam.bearing(px);
        assert_relative_eq!(b.dot(p.normalize()), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_project_behind() {
        let cam = PinholeCamera::default();
        assert!(cam.project(DVec3::new(0.0, 0.0, -1.0)).is_none());
    }

    #[test]
    fn test_k_matrix() {
        let cam = PinholeCamera::new(500.0, 510.0, 320.0, 240.0);
        let k = cam.k_matrix();
        let x = k * DVec3::new(0.1, 0.2, 1.0);
        assert_relative_eq!(x.x, 370.0);
        assert_relative_eq!(x.y, 342.0);
        assert_relative_eq!(x.z, 1.0);
    }

    #[test]
    fn test_calibration_sources() {
        let cams = vec![PinholeCamera::default(), PinholeCamera::new(1.0, 1.0, 0.0, 0.0)];
        assert_eq!(cams.calibration(1).unwrap().fx, 1.0);
        assert_eq!(
            cams.calibration(2),
            Err(CameraError::MissingCalibration(2))
        );
        let shared = SharedCalibration(PinholeCamera::default());
        assert_eq!(collect_calibrations(&shared, 3).unwrap().len(), 3);
        assert!(PinholeCamera::new(0.0, 1.0, 0.0, 0.0).validate().is_err());
    }
}
