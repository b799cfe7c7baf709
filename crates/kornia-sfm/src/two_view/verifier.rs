use glam::{DMat3, DVec2, DVec3};
use serde::{Deserialize, Serialize};

use crate::camera::PinholeCamera;
use crate::pose::ransac::{ransac, RansacError, RansacParams};
use crate::pose::{
    enforce_essential_constraints, essential_8point, essential_from_fundamental,
    fundamental_8point, sampson_distance,
};

use super::VerificationFailure;

/// Outcome of a geometric verification.
#[derive(Debug, Clone)]
pub struct VerifiedModel {
    /// Essential matrix relating the normalized points, `x2n^T E x1n = 0`.
    pub essential: DMat3,
    /// Per-correspondence inlier mask.
    pub inliers: Vec<bool>,
    /// Number of inliers.
    pub inlier_count: usize,
}

/// Robust two-view model estimation.
pub trait Verifier: Send + Sync {
    /// Estimate the epipolar geometry of pixel correspondences `x1[i] <-> x2[i]`.
    fn verify(
        &self,
        x1: &[DVec2],
        x2: &[DVec2],
        cam1: &PinholeCamera,
        cam2: &PinholeCamera,
        params: &RansacParams,
    ) -> Result<VerifiedModel, VerificationFailure>;
}

/// Selects the verifier implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifierType {
    /// Intrinsics are trusted: essential matrix on calibrated points.
    #[default]
    Essential,
    /// Intrinsics are not trusted: fundamental matrix on raw pixels.
    Fundamental,
}

impl VerifierType {
    /// Build the verifier.
    pub fn build(&self) -> Box<dyn Verifier> {
        match self {
            VerifierType::Essential => Box::new(EssentialVerifier),
            VerifierType::Fundamental => Box::new(FundamentalVerifier),
        }
    }
}

fn map_ransac_error(err: RansacError) -> VerificationFailure {
    match err {
        RansacError::TooFewData { required, actual } => {
            VerificationFailure::TooFewCorrespondences { required, actual }
        }
        RansacError::NoModel => VerificationFailure::NoModel,
    }
}

fn gather(points: &[DVec2], idx: &[usize]) -> Vec<DVec2> {
    idx.iter().map(|&i| points[i]).collect()
}

fn to_pixel(k: &DMat3, xn: DVec2) -> DVec2 {
    let p = *k * DVec3::new(xn.x, xn.y, 1.0);
    DVec2::new(p.x / p.z, p.y / p.z)
}

/// Normalized 8-point essential matrix inside RANSAC.
///
/// Points are undistorted first; hypotheses are scored with the Sampson error of the
/// induced fundamental matrix on the undistorted pixels.
#[derive(Debug, Clone, Copy, Default)]
pub struct EssentialVerifier;

impl Verifier for EssentialVerifier {
    fn verify(
        &self,
        x1: &[DVec2],
        x2: &[DVec2],
        cam1: &PinholeCamera,
        cam2: &PinholeCamera,
        params: &RansacParams,
    ) -> Result<VerifiedModel, VerificationFailure> {
        let x1n: Vec<DVec2> = x1.iter().map(|p| cam1.pixel_to_normalized(*p)).collect();
        let x2n: Vec<DVec2> = x2.iter().map(|p| cam2.pixel_to_normalized(*p)).collect();
        let (k1, k2) = (cam1.k_matrix(), cam2.k_matrix());
        let x1u: Vec<DVec2> = x1n.iter().map(|p| to_pixel(&k1, *p)).collect();
        let x2u: Vec<DVec2> = x2n.iter().map(|p| to_pixel(&k2, *p)).collect();
        let k1_inv = k1.inverse();
        let k2_inv_t = k2.inverse().transpose();

        let res = ransac(
            x1.len(),
            8,
            params,
            |idx| {
                let e = essential_8point(&gather(&x1n, idx), &gather(&x2n, idx)).ok()?;
                Some((e, k2_inv_t * e * k1_inv))
            },
            |model: &(DMat3, DMat3), i: usize| sampson_distance(&model.1, &x1u[i], &x2u[i]),
        )
        .map_err(map_ransac_error)?;

        Ok(VerifiedModel {
            essential: res.model.0,
            inliers: res.inliers,
            inlier_count: res.inlier_count,
        })
    }
}

/// 8-point fundamental matrix on raw pixels inside RANSAC.
///
/// The essential matrix is recovered afterwards as `K2^T F K1`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FundamentalVerifier;

impl Verifier for FundamentalVerifier {
    fn verify(
        &self,
        x1: &[DVec2],
        x2: &[DVec2],
        cam1: &PinholeCamera,
        cam2: &PinholeCamera,
        params: &RansacParams,
    ) -> Result<VerifiedModel, VerificationFailure> {
        let res = ransac(
            x1.len(),
            8,
            params,
            |idx| fundamental_8point(&gather(x1, idx), &gather(x2, idx)).ok(),
            |f: &DMat3, i: usize| sampson_distance(f, &x1[i], &x2[i]),
        )
        .map_err(map_ransac_error)?;

        let e = essential_from_fundamental(&res.model, &cam1.k_matrix(), &cam2.k_matrix());
        Ok(VerifiedModel {
            essential: enforce_essential_constraints(&e),
            inliers: res.inliers,
            inlier_count: res.inlier_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::so3::from_axis_angle_deg;
    use crate::pose::recover_pose;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    // X2 = R X1 + t
    fn pair(num_outliers: usize) -> (Vec<DVec2>, Vec<DVec2>, PinholeCamera, DMat3, DVec3) {
        let cam = PinholeCamera::new(600.0, 600.0, 320.0, 240.0);
        let r = from_axis_angle_deg(DVec3::new(0.0, 1.0, 0.1), 10.0);
        let t = DVec3::new(-1.0, 0.05, 0.1).normalize();
        let mut rng = StdRng::seed_from_u64(7);
        let mut x1 = Vec::new();
        let mut x2 = Vec::new();
        for _ in 0..60 {
            let p = DVec3::new(
                rng.random_range(-2.0..2.0),
                rng.random_range(-1.5..1.5),
                rng.random_range(4.0..8.0),
            );
            x1.push(cam.project(p).unwrap());
            x2.push(cam.project(r * p + t).unwrap());
        }
        for i in 0..num_outliers {
            x2[i] = DVec2::new(rng.random_range(0.0..640.0), rng.random_range(0.0..480.0));
        }
        (x1, x2, cam, r, t)
    }

    #[test]
    fn test_essential_verifier() -> Result<(), VerificationFailure> {
        let (x1, x2, cam, r, t) = pair(10);
        let model = EssentialVerifier.verify(&x1, &x2, &cam, &cam, &RansacParams::default())?;
        assert!(model.inlier_count >= 50);
        assert!(model.inliers[10..].iter().all(|&b| b));

        let x1n: Vec<_> = x1[10..].iter().map(|p| cam.pixel_to_normalized(*p)).collect();
        let x2n: Vec<_> = x2[10..].iter().map(|p| cam.pixel_to_normalized(*p)).collect();
        let pose = recover_pose(&model.essential, &x1n, &x2n).unwrap();
        assert!(crate::geometry::so3::angle_between(&pose.rotation, &r) < 1e-3);
        assert!(pose.translation.dot(t) > 0.999);
        Ok(())
    }

    #[test]
    fn test_fundamental_verifier() -> Result<(), VerificationFailure> {
        let (x1, x2, cam, r, _) = pair(5);
        let model = VerifierType::Fundamental.build().verify(
            &x1,
            &x2,
            &cam,
            &cam,
            &RansacParams::default(),
        )?;
        assert!(model.inlier_count >= 55);
        let x1n: Vec<_> = x1[5..].iter().map(|p| cam.pixel_to_normalized(*p)).collect();
        let x2n: Vec<_> = x2[5..].iter().map(|p| cam.pixel_to_normalized(*p)).collect();
        let pose = recover_pose(&model.essential, &x1n, &x2n).unwrap();
        assert!(crate::geometry::so3::angle_between(&pose.rotation, &r).to_degrees() < 0.1);
        Ok(())
    }

    #[test]
    fn test_verifier_too_few() {
        let (x1, x2, cam, _, _) = pair(0);
        let params = RansacParams::default();
        let res = EssentialVerifier.verify(&x1[..5], &x2[..5], &cam, &cam, &params);
        assert!(matches!(
            res,
            Err(VerificationFailure::TooFewCorrespondences { required: 8, actual: 5 })
        ));
    }
}
