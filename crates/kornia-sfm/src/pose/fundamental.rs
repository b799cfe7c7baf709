use glam::{DMat3, DVec2, DVec3};

use crate::geometry::linalg::{faer_to_mat3, mat3_from_rows, mat3_to_faer, null_vector};

/// Errors of the eight-point solvers.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum FundamentalError {
    /// Not enough or mismatched correspondences.
    #[error("Need at least 8 correspondences and equal lengths, got {0} and {1}")]
    InvalidInput(usize, usize),
    /// The design matrix has no usable null vector.
    #[error("Degenerate point configuration")]
    Degenerate,
}

/// Estimate the fundamental matrix using the normalized 8-point algorithm.
///
/// - `x1`: points in image 1 (length >= 8)
/// - `x2`: corresponding points in image 2 (same length)
///
/// The result satisfies `x2^T F x1 = 0` for the homogeneous points and has rank 2.
pub fn fundamental_8point(x1: &[DVec2], x2: &[DVec2]) -> Result<DMat3, FundamentalError> {
    let f = eight_point_unconstrained(x1, x2)?;
    Ok(enforce_rank2(&f))
}

/// Eight-point estimate without the rank constraint, in the original coordinates.
pub(crate) fn eight_point_unconstrained(
    x1: &[DVec2],
    x2: &[DVec2],
) -> Result<DMat3, FundamentalError> {
    if x1.len() != x2.len() || x1.len() < 8 {
        return Err(FundamentalError::InvalidInput(x1.len(), x2.len()));
    }

    // zero mean, mean distance sqrt(2)
    let (x1n, t1) = normalize_points_2d(x1);
    let (x2n, t2) = normalize_points_2d(x2);

    // design matrix for x2' * F * x1 = 0
    let n = x1n.len();
    let mut a = faer::Mat::<f64>::zeros(n, 9);
    for i in 0..n {
        let (x, y) = (x1n[i].x, x1n[i].y);
        let (xp, yp) = (x2n[i].x, x2n[i].y);
        let row = [xp * x, xp * y, xp, yp * x, yp * y, yp, x, y, 1.0];
        for (j, v) in row.iter().enumerate() {
            a.write(i, j, *v);
        }
    }

    let fvec = null_vector(&a).ok_or(FundamentalError::Degenerate)?;
    let f = mat3_from_rows(&fvec);

    // F = T2^T * F * T1
    let f = t2.transpose() * f * t1;
    let norm = frobenius_norm(&f);
    if norm < 1e-15 || !norm.is_finite() {
        return Err(FundamentalError::Degenerate);
    }
    Ok(f * (1.0 / norm))
}

/// Zero the smallest singular value.
pub fn enforce_rank2(f: &DMat3) -> DMat3 {
    let svd = mat3_to_faer(f).svd();
    let u = faer_to_mat3(svd.u());
    let v = faer_to_mat3(svd.v());
    let s = svd.s_diagonal();
    u * DMat3::from_diagonal(DVec3::new(s[0], s[1], 0.0)) * v.transpose()
}

/// Sampson distance (squared, in the units of the points) of a correspondence.
pub fn sampson_distance(f: &DMat3, x1: &DVec2, x2: &DVec2) -> f64 {
    let p1 = DVec3::new(x1.x, x1.y, 1.0);
    let p2 = DVec3::new(x2.x, x2.y, 1.0);
    let fx1 = *f * p1;
    let ftx2 = f.transpose() * p2;
    let num = p2.dot(fx1);
    let den = fx1.x * fx1.x + fx1.y * fx1.y + ftx2.x * ftx2.x + ftx2.y * ftx2.y;
    if den <= 1e-30 {
        return f64::INFINITY;
    }
    num * num / den
}

fn normalize_points_2d(x: &[DVec2]) -> (Vec<DVec2>, DMat3) {
    let n = x.len() as f64;
    let mean = x.iter().fold(DVec2::ZERO, |acc, p| acc + *p) / n;
    let mean_dist = x.iter().map(|p| (*p - mean).length()).sum::<f64>() / n;
    let scale = if mean_dist > 0.0 {
        2f64.sqrt() / mean_dist
    } else {
        1.0
    };

    let xn = x.iter().map(|p| (*p - mean) * scale).collect();

    // T = [[s,0,-s*mx],[0,s,-s*my],[0,0,1]]
    let t = DMat3::from_cols(
        DVec3::new(scale, 0.0, 0.0),
        DVec3::new(0.0, scale, 0.0),
        DVec3::new(-scale * mean.x, -scale * mean.y, 1.0),
    );
    (xn, t)
}

fn frobenius_norm(m: &DMat3) -> f64 {
    m.to_cols_array().iter().map(|v| v * v).sum::<f64>().sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::linalg::singular_values3;
    use crate::geometry::so3::{from_axis_angle_deg, hat};

    fn synthetic_pair() -> (Vec<DVec2>, Vec<DVec2>, DMat3) {
        // X2 = R X1 + t, pixels with f = 500, c = (320, 240)
        let r = from_axis_angle_deg(DVec3::new(0.1, 1.0, 0.2), 8.0);
        let t = DVec3::new(-1.0, 0.1, 0.05);
        let k = mat3_from_rows(&[500.0, 0.0, 320.0, 0.0, 500.0, 240.0, 0.0, 0.0, 1.0]);
        let mut x1 = Vec::new();
        let mut x2 = Vec::new();
        for i in 0..20 {
            let fi = i as f64;
            let p = DVec3::new(
                (fi * 0.37).sin() * 2.0,
                (fi * 0.91).cos() * 1.5,
                6.0 + (fi * 0.53).sin(),
            );
            let q = r * p + t;
            let a = k * (p / p.z);
            let b = k * (q / q.z);
            x1.push(DVec2::new(a.x, a.y));
            x2.push(DVec2::new(b.x, b.y));
        }
        let e = hat(t) * r;
        let k_inv = k.inverse();
        (x1, x2, k_inv.transpose() * e * k_inv)
    }

    // Check x2'^T F x1 ~ 0 for perfect correspondences
    #[test]
    fn test_fundamental_8point_epipolar_constraint() -> Result<(), FundamentalError> {
        let (x1, x2, f_true) = synthetic_pair();
        let f_est = fundamental_8point(&x1, &x2)?;
        for (a, b) in x1.iter().zip(x2.iter()) {
            assert!(sampson_distance(&f_est, a, b) < 1e-8);
        }
        assert!(singular_values3(&f_est).z.abs() < 1e-9);

        // same matrix up to scale and sign
        let scale = |m: &DMat3| *m * (1.0 / frobenius_norm(m));
        let (a, b) = (scale(&f_est), scale(&f_true));
        let diff = (a - b).to_cols_array().iter().map(|v| v.abs()).sum::<f64>();
        let sum = (a + b).to_cols_array().iter().map(|v| v.abs()).sum::<f64>();
        assert!(diff.min(sum) < 1e-6);
        Ok(())
    }

    #[test]
    fn test_fundamental_8point_too_few() {
        let x = vec![DVec2::ZERO; 7];
        assert_eq!(
            fundamental_8point(&x, &x),
            Err(FundamentalError::InvalidInput(7, 7))
        );
    }

    #[test]
    fn test_sampson_distance() {
        // pure translation along x: epipolar lines are horizontal
        let e = hat(DVec3::X) * from_axis_angle_deg(DVec3::Y, 0.0);
        let d0 = sampson_distance(&e, &DVec2::new(0.1, 0.2), &DVec2::new(0.3, 0.2));
        assert!(d0 < 1e-20);
        let d1 = sampson_distance(&e, &DVec2::new(0.1, 0.2), &DVec2::new(0.3, 0.3));
        // half the squared vertical offset in each image
        assert!((d1 - 0.005).abs() < 1e-12);
    }
}
