//! Rotation helpers on `glam::DMat3`.
//!
//! The exponential and logarithm maps follow the usual axis-angle convention: `exp(v)` is a
//! rotation of `|v|` radians around `v / |v|`.

use glam::{DMat3, DQuat, DVec3};

use super::linalg::{faer_to_mat3, mat3_to_faer};

/// Vector space -> Lie algebra (skew-symmetric matrix).
pub fn hat(v: DVec3) -> DMat3 {
    DMat3::from_cols(
        DVec3::new(0.0, v.z, -v.y),
        DVec3::new(-v.z, 0.0, v.x),
        DVec3::new(v.y, -v.x, 0.0),
    )
}

/// Lie algebra -> vector space.
pub fn vee(omega: &DMat3) -> DVec3 {
    DVec3::new(omega.y_axis.z, omega.z_axis.x, omega.x_axis.y)
}

/// Lie algebra -> Lie group.
pub fn exp(v: DVec3) -> DMat3 {
    let theta = v.length();
    if theta < 1e-12 {
        return DMat3::IDENTITY + hat(v);
    }
    DMat3::from_axis_angle(v / theta, theta)
}

/// Lie group -> Lie algebra.
///
/// Goes through the quaternion so that angles close to pi stay well conditioned.
pub fn log(r: &DMat3) -> DVec3 {
    let mut q = DQuat::from_mat3(r).normalize();
    if q.w < 0.0 {
        q = -q;
    }
    let xyz = DVec3::new(q.x, q.y, q.z);
    let sin_half = xyz.length();
    if sin_half < 1e-12 {
        // first order: R ~ I + hat(v)
        return xyz * 2.0;
    }
    let theta = 2.0 * sin_half.atan2(q.w);
    xyz * (theta / sin_half)
}

/// Rotation angle in radians, in `[0, pi]`.
pub fn angle(r: &DMat3) -> f64 {
    log(r).length()
}

/// Geodesic distance in radians between two rotations.
pub fn angle_between(a: &DMat3, b: &DMat3) -> f64 {
    angle(&(a.transpose() * *b))
}

/// Closest rotation (Frobenius norm) to an arbitrary 3x3 matrix.
pub fn project_to_so3(m: &DMat3) -> DMat3 {
    let svd = mat3_to_faer(m).svd();
    let u = faer_to_mat3(svd.u());
    let v = faer_to_mat3(svd.v());
    let r = u * v.transpose();
    if r.determinant() < 0.0 {
        // flip the axis of the smallest singular value
        let d = DMat3::from_diagonal(DVec3::new(1.0, 1.0, -1.0));
        return u * d * v.transpose();
    }
    r
}

/// Rotate `v` by `angle_deg` degrees around `axis`. Mostly handy for building test scenes.
pub fn from_axis_angle_deg(axis: DVec3, angle_deg: f64) -> DMat3 {
    DMat3::from_axis_angle(axis.normalize(), angle_deg.to_radians())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_hat_vee() {
        let v = DVec3::new(1.0, 2.0, 3.0);
        let m = hat(v);
        assert_eq!(m.x_axis.y, 3.0);
        assert_eq!(m.y_axis.x, -3.0);
        assert_eq!(m.z_axis.x, 2.0);
        assert_eq!(vee(&m), v);
        // skew-symmetric
        assert_eq!(m.transpose(), -m);
    }

    #[test]
    fn test_exp_log_roundtrip() {
        for v in [
            DVec3::new(0.1, -0.2, 0.3),
            DVec3::new(1e-9, 0.0, 0.0),
            DVec3::new(0.0, 3.0, 0.0),
            DVec3::new(-1.2, 0.4, 2.0),
        ] {
            let r = exp(v);
            assert_relative_eq!(r.determinant(), 1.0, epsilon = 1e-12);
            let w = log(&r);
            assert_relative_eq!((w - v).length(), 0.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_log_near_pi() {
        let v = DVec3::new(0.0, 0.0, std::f64::consts::PI - 1e-6);
        let w = log(&exp(v));
        assert_relative_eq!(w.length(), v.length(), epsilon = 1e-6);
    }

    #[test]
    fn test_angle_between() {
        let a = from_axis_angle_deg(DVec3::X, 10.0);
        let b = from_axis_angle_deg(DVec3::X, 40.0);
        assert_relative_eq!(angle_between(&a, &b).to_degrees(), 30.0, epsilon = 1e-9);
    }

    #[test]
    fn test_project_to_so3() {
        let r = exp(DVec3::new(0.3, -0.1, 0.7));
        let noisy = r + DMat3::from_diagonal(DVec3::splat(0.01));
        let p = project_to_so3(&noisy);
        assert_relative_eq!(p.determinant(), 1.0, epsilon = 1e-9);
        let ptp = p.transpose() * p;
        assert!(ptp.abs_diff_eq(DMat3::IDENTITY, 1e-9));
        assert!(angle_between(&p, &r) < 0.02);

        // reflections are mapped back to proper rotations
        let reflection = DMat3::from_diagonal(DVec3::new(1.0, 1.0, -1.0));
        assert_relative_eq!(project_to_so3(&reflection).determinant(), 1.0, epsilon = 1e-9);
    }
}
