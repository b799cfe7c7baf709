use glam::{DMat3, DVec2, DVec3};

use crate::geometry::linalg::{faer_to_mat3, mat3_to_faer};
use crate::geometry::triangulation::{triangulate_dlt, NormalizedView};

use super::fundamental::{eight_point_unconstrained, FundamentalError};

/// Build an essential matrix from a fundamental matrix and camera intrinsics.
///
/// E = K2^T * F * K1
pub fn essential_from_fundamental(f: &DMat3, k1: &DMat3, k2: &DMat3) -> DMat3 {
    k2.transpose() * *f * *k1
}

/// Enforce the (1,1,0) singular value constraint on an essential matrix.
pub fn enforce_essential_constraints(e: &DMat3) -> DMat3 {
    let svd = mat3_to_faer(e).svd();
    let u = faer_to_mat3(svd.u());
    let v = faer_to_mat3(svd.v());
    u * DMat3::from_diagonal(DVec3::new(1.0, 1.0, 0.0)) * v.transpose()
}

/// Estimate an essential matrix from normalized image points with the 8-point algorithm.
pub fn essential_8point(x1n: &[DVec2], x2n: &[DVec2]) -> Result<DMat3, FundamentalError> {
    let e = eight_point_unconstrained(x1n, x2n)?;
    Ok(enforce_essential_constraints(&e))
}

/// Decompose an essential matrix into four possible (R, t) solutions.
///
/// Every candidate satisfies `X2 = R X1 + t` with `t` a unit vector.
pub fn decompose_essential(e: &DMat3) -> [(DMat3, DVec3); 4] {
    let svd = mat3_to_faer(e).svd();
    let mut u = faer_to_mat3(svd.u());
    let mut v = faer_to_mat3(svd.v());

    if u.determinant() < 0.0 {
        u.z_axis = -u.z_axis;
    }
    if v.determinant() < 0.0 {
        v.z_axis = -v.z_axis;
    }

    let w = DMat3::from_cols(
        DVec3::new(0.0, 1.0, 0.0),
        DVec3::new(-1.0, 0.0, 0.0),
        DVec3::new(0.0, 0.0, 1.0),
    );

    let r1 = u * w * v.transpose();
    let r2 = u * w.transpose() * v.transpose();
    let t = u.z_axis.normalize_or_zero();

    [(r1, t), (r1, -t), (r2, t), (r2, -t)]
}

/// Pose candidate selected by cheirality.
#[derive(Debug, Clone, Copy)]
pub struct RecoveredPose {
    /// Rotation of `X2 = R X1 + t`.
    pub rotation: DMat3,
    /// Unit translation of `X2 = R X1 + t`.
    pub translation: DVec3,
    /// Number of points triangulated in front of both cameras.
    pub num_in_front: usize,
}

/// Pick the decomposition of `e` that puts the most points in front of both cameras.
///
/// `x1n` and `x2n` are normalized image points. Returns `None` when no candidate has a
/// single point with positive depth.
pub fn recover_pose(e: &DMat3, x1n: &[DVec2], x2n: &[DVec2]) -> Option<RecoveredPose> {
    let mut best: Option<RecoveredPose> = None;
    for (r, t) in decompose_essential(e) {
        let num_in_front = count_in_front(&r, &t, x1n, x2n);
        if num_in_front > best.map_or(0, |b| b.num_in_front) {
            best = Some(RecoveredPose {
                rotation: r,
                translation: t,
                num_in_front,
            });
        }
    }
    best
}

/// Count correspondences triangulating with positive depth in both cameras.
pub fn count_in_front(r: &DMat3, t: &DVec3, x1n: &[DVec2], x2n: &[DVec2]) -> usize {
    x1n.iter()
        .zip(x2n.iter())
        .filter(|(a, b)| {
            let v1 = NormalizedView {
                c_r_w: DMat3::IDENTITY,
                c_t_w: DVec3::ZERO,
                point: **a,
            };
            let v2 = NormalizedView {
                c_r_w: *r,
                c_t_w: *t,
                point: **b,
            };
            triangulate_dlt(&[v1, v2]).is_some_and(|x| v1.depth(x) > 0.0 && v2.depth(x) > 0.0)
        })
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::linalg::singular_values3;
    use crate::geometry::so3::{angle_between, from_axis_angle_deg, hat};

    fn scene() -> (DMat3, DVec3, Vec<DVec2>, Vec<DVec2>) {
        let r = from_axis_angle_deg(DVec3::new(0.2, 1.0, -0.1), 12.0);
        let t = DVec3::new(0.8, -0.1, 0.2).normalize();
        let mut x1 = Vec::new();
        let mut x2 = Vec::new();
        for i in 0..30 {
            let fi = i as f64;
            let p = DVec3::new((fi * 1.3).sin(), (fi * 0.7).cos(), 4.0 + (fi * 0.4).sin());
            let q = r * p + t;
            x1.push(DVec2::new(p.x / p.z, p.y / p.z));
            x2.push(DVec2::new(q.x / q.z, q.y / q.z));
        }
        (r, t, x1, x2)
    }

    #[test]
    fn test_decompose_essential_identity_rotation() {
        let r = DMat3::IDENTITY;
        let t = DVec3::new(1.0, 0.0, 0.0);
        let e = hat(t) * r;

        let candidates = decompose_essential(&e);
        let found = candidates.iter().any(|(rc, tc)| {
            (rc.determinant() - 1.0).abs() < 1e-9
                && tc.dot(t) > 0.99
                && angle_between(rc, &r) < 1e-6
        });
        assert!(found);
    }

    #[test]
    fn test_enforce_essential_constraints_rank2() {
        let e = DMat3::from_cols(
            DVec3::new(0.1, 0.2, -0.3),
            DVec3::new(0.4, -0.1, 0.2),
            DVec3::new(-0.2, 0.5, 0.3),
        );
        let s = singular_values3(&enforce_essential_constraints(&e));
        assert!(s.z.abs() < 1e-9);
        assert!((s.x - s.y).abs() < 1e-9);
    }

    #[test]
    fn test_essential_8point_recover_pose() -> Result<(), FundamentalError> {
        let (r, t, x1, x2) = scene();
        let e = essential_8point(&x1, &x2)?;
        let pose = recover_pose(&e, &x1, &x2).expect("a valid pose");
        assert_eq!(pose.num_in_front, x1.len());
        assert!(angle_between(&pose.rotation, &r).to_degrees() < 1e-4);
        assert!(pose.translation.dot(t) > 1.0 - 1e-8);
        Ok(())
    }
}
