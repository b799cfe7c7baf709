use glam::{DMat3, DVec2, DVec3};

use super::linalg::null_vector;

/// A single observation used for triangulation.
///
/// `c_r_w` and `c_t_w` map world points to the camera frame, `point` lies on the
/// undistorted normalized image plane.
#[derive(Debug, Clone, Copy)]
pub struct NormalizedView {
    /// World-to-camera rotation.
    pub c_r_w: DMat3,
    /// World-to-camera translation.
    pub c_t_w: DVec3,
    /// Observation on the normalized image plane.
    pub point: DVec2,
}

impl NormalizedView {
    /// Camera centre in the world frame.
    pub fn center(&self) -> DVec3 {
        -(self.c_r_w.transpose() * self.c_t_w)
    }

    /// Depth of a world point along the optical axis.
    pub fn depth(&self, x: DVec3) -> f64 {
        (self.c_r_w * x + self.c_t_w).z
    }
}

/// Linear (DLT) triangulation of a point seen in two or more views.
///
/// Returns `None` when fewer than two views are given or the solution lies at infinity.
pub fn triangulate_dlt(views: &[NormalizedView]) -> Option<DVec3> {
    if views.len() < 2 {
        return None;
    }

    let mut a = faer::Mat::<f64>::zeros(2 * views.len(), 4);
    for (k, view) in views.iter().enumerate() {
        let r = &view.c_r_w;
        let t = view.c_t_w;
        // rows of P = [R | t]
        let p = [
            [r.x_axis.x, r.y_axis.x, r.z_axis.x, t.x],
            [r.x_axis.y, r.y_axis.y, r.z_axis.y, t.y],
            [r.x_axis.z, r.y_axis.z, r.z_axis.z, t.z],
        ];
        write_dlt_row(&mut a, 2 * k, view.point.x, &p[2], &p[0]);
        write_dlt_row(&mut a, 2 * k + 1, view.point.y, &p[2], &p[1]);
    }

    let xh = null_vector(&a)?;
    let w = xh[3];
    if w.abs() < 1e-12 {
        return None;
    }
    let x = DVec3::new(xh[0] / w, xh[1] / w, xh[2] / w);
    x.is_finite().then_some(x)
}

fn write_dlt_row(a: &mut faer::Mat<f64>, row: usize, x: f64, p3: &[f64; 4], p1: &[f64; 4]) {
    for j in 0..4 {
        a.write(row, j, x * p3[j] - p1[j]);
    }
}

/// Angle in radians between the rays from two camera centres to a point.
pub fn triangulation_angle(center_a: DVec3, center_b: DVec3, point: DVec3) -> f64 {
    let ra = point - center_a;
    let rb = point - center_b;
    let na = ra.length();
    let nb = rb.length();
    if na <= 1e-12 || nb <= 1e-12 {
        return 0.0;
    }
    (ra.dot(rb) / (na * nb)).clamp(-1.0, 1.0).acos()
}

/// Largest pairwise ray angle in radians over a set of camera centres.
pub fn max_triangulation_angle(centers: &[DVec3], point: DVec3) -> f64 {
    let mut best = 0.0f64;
    for i in 0..centers.len() {
        for j in (i + 1)..centers.len() {
            best = best.max(triangulation_angle(centers[i], centers[j], point));
        }
    }
    best
}

/// Squared reprojection error on the normalized image plane, `None` behind the camera.
pub fn normalized_reprojection_error_sq(view: &NormalizedView, x: DVec3) -> Option<f64> {
    let pc = view.c_r_w * x + view.c_t_w;
    if pc.z <= 1e-12 {
        return None;
    }
    let proj = DVec2::new(pc.x / pc.z, pc.y / pc.z);
    Some((proj - view.point).length_squared())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::so3;
    use approx::assert_relative_eq;

    fn view(c_r_w: DMat3, center: DVec3, x: DVec3) -> NormalizedView {
        let c_t_w = -(c_r_w * center);
        let pc = c_r_w * x + c_t_w;
        NormalizedView {
            c_r_w,
            c_t_w,
            point: DVec2::new(pc.x / pc.z, pc.y / pc.z),
        }
    }

    #[test]
    fn test_triangulate_two_views() {
        let x = DVec3::new(0.2, -0.3, 5.0);
        let v1 = view(DMat3::IDENTITY, DVec3::ZERO, x);
        let v2 = view(
            so3::from_axis_angle_deg(DVec3::Y, -5.0),
            DVec3::new(1.0, 0.0, 0.0),
            x,
        );
        assert_relative_eq!(v1.center().length(), 0.0);
        let est = triangulate_dlt(&[v1, v2]).unwrap();
        assert_relative_eq!((est - x).length(), 0.0, epsilon = 1e-8);
        assert!(v2.depth(est) > 0.0);
        assert!(normalized_reprojection_error_sq(&v2, est).unwrap() < 1e-16);
    }

    #[test]
    fn test_triangulate_many_views() {
        let x = DVec3::new(-1.0, 0.5, 8.0);
        let views: Vec<_> = (0..5)
            .map(|i| {
                let c = DVec3::new(i as f64 * 0.5, 0.1 * i as f64, 0.0);
                view(so3::from_axis_angle_deg(DVec3::Y, -(i as f64)), c, x)
            })
            .collect();
        let est = triangulate_dlt(&views).unwrap();
        assert_relative_eq!((est - x).length(), 0.0, epsilon = 1e-8);
    }

    #[test]
    fn test_triangulate_single_view() {
        let x = DVec3::new(0.0, 0.0, 1.0);
        assert!(triangulate_dlt(&[view(DMat3::IDENTITY, DVec3::ZERO, x)]).is_none());
    }

    #[test]
    fn test_triangulation_angle() {
        let a = triangulation_angle(
            DVec3::new(-1.0, 0.0, 0.0),
            DVec3::new(1.0, 0.0, 0.0),
            DVec3::new(0.0, 0.0, 1.0),
        );
        assert_relative_eq!(a.to_degrees(), 90.0, epsilon = 1e-9);
        let centers = [DVec3::ZERO, DVec3::new(0.01, 0.0, 0.0), DVec3::new(2.0, 0.0, 0.0)];
        let m = max_triangulation_angle(&centers, DVec3::new(1.0, 0.0, 1.0));
        assert_relative_eq!(m.to_degrees(), 90.0, epsilon = 1e-9);
    }
}
