use glam::{DMat3, DVec2, DVec3};

use crate::bundle_adjustment::losses::LossFunction;
use crate::bundle_adjustment::{
    BundleAdjustmentConfig, BundleAdjustmentError, BundleAdjustmentProblem,
};
use crate::camera::PinholeCamera;
use crate::geometry::triangulation::{triangulate_dlt, NormalizedView};
use crate::types::{GlobalPose, Observation, PosePriors, Reconstruction, Track};

use super::TwoViewConfig;

/// Refined relative pose of a two-view bundle adjustment.
#[derive(Debug, Clone)]
pub struct TwoViewRefinement {
    /// Rotation of `X2 = R X1 + t`.
    pub rotation: DMat3,
    /// Unit translation of `X2 = R X1 + t`.
    pub translation: DVec3,
    /// Positions (into the input slices) of the correspondences kept after refinement.
    pub inliers: Vec<usize>,
    /// Refined points in the first camera's frame, one per kept correspondence.
    pub points: Vec<DVec3>,
}

/// Jointly refine a relative pose and the triangulated inliers of two cameras.
///
/// The first camera is held at the origin. Correspondences that cannot be triangulated
/// in front of both cameras are dropped. After a robust pass, correspondences with a
/// reprojection error above the verifier threshold in either image are dropped and the
/// remaining ones are refined again. Each pass takes at most `ba_max_iterations` steps.
pub fn refine_two_view(
    x1: &[DVec2],
    x2: &[DVec2],
    cam1: &PinholeCamera,
    cam2: &PinholeCamera,
    rotation: &DMat3,
    translation: &DVec3,
    config: &TwoViewConfig,
) -> Result<TwoViewRefinement, BundleAdjustmentError> {
    let threshold = config.ransac.threshold;
    let mut rec = Reconstruction::default();
    rec.poses.insert(0, GlobalPose::default());
    rec.poses
        .insert(1, GlobalPose::from_world_to_camera(*rotation, *translation));
    rec.calibrations.insert(0, *cam1);
    rec.calibrations.insert(1, *cam2);

    let mut positions = Vec::with_capacity(x1.len());
    for (i, (p1, p2)) in x1.iter().zip(x2.iter()).enumerate() {
        let v1 = NormalizedView {
            c_r_w: DMat3::IDENTITY,
            c_t_w: DVec3::ZERO,
            point: cam1.pixel_to_normalized(*p1),
        };
        let v2 = NormalizedView {
            c_r_w: *rotation,
            c_t_w: *translation,
            point: cam2.pixel_to_normalized(*p2),
        };
        let Some(x) = triangulate_dlt(&[v1, v2]) else {
            continue;
        };
        if v1.depth(x) <= 0.0 || v2.depth(x) <= 0.0 {
            continue;
        }
        rec.tracks.push(Track {
            observations: vec![
                Observation {
                    camera: 0,
                    keypoint: i,
                    pixel: *p1,
                },
                Observation {
                    camera: 1,
                    keypoint: i,
                    pixel: *p2,
                },
            ],
            point: x,
            valid: true,
        });
        positions.push(i);
    }

    let config = BundleAdjustmentConfig {
        max_iterations: config.ba_max_iterations,
        loss: LossFunction::Huber { delta: threshold },
        ..Default::default()
    };
    let mut problem = BundleAdjustmentProblem::new(&rec, &PosePriors::default(), &config)?;
    problem.optimize(&config)?;
    problem.write_back(&mut rec);

    let rejected = reject_outliers(&mut rec, threshold);
    if rejected > 0 {
        log::trace!("two-view refinement: {} outliers rejected, refining again", rejected);
        let mut problem = BundleAdjustmentProblem::new(&rec, &PosePriors::default(), &config)?;
        problem.optimize(&config)?;
        problem.write_back(&mut rec);
    }

    let pose = rec.poses[&1];
    let c_t_w = pose.c_t_w();
    let scale = c_t_w.length();
    if scale < 1e-12 || !scale.is_finite() {
        return Err(BundleAdjustmentError::Diverged {
            initial_cost: 0.0,
            final_cost: f64::INFINITY,
        });
    }

    reject_outliers(&mut rec, threshold);
    let mut inliers = Vec::new();
    let mut points = Vec::new();
    for (track, &pos) in rec.tracks.iter().zip(positions.iter()) {
        if track.valid {
            inliers.push(pos);
            points.push(track.point / scale);
        }
    }

    Ok(TwoViewRefinement {
        rotation: pose.c_r_w(),
        translation: c_t_w / scale,
        inliers,
        points,
    })
}

/// Invalidate tracks with an observation above `threshold` pixels, returns their number.
fn reject_outliers(rec: &mut Reconstruction, threshold: f64) -> usize {
    let mut rejected = 0;
    for track in rec.tracks.iter_mut().filter(|t| t.valid) {
        let errors = track.reprojection_errors(&rec.poses, &rec.calibrations);
        if !errors.iter().all(|e| e.is_some_and(|e| e <= threshold)) {
            track.valid = false;
            rejected += 1;
        }
    }
    rejected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::so3::{angle_between, exp, from_axis_angle_deg};
    use rand::{rngs::StdRng, Rng, SeedableRng};

    type Correspondences = (PinholeCamera, DMat3, DVec3, Vec<DVec2>, Vec<DVec2>);

    fn correspondences(seed: u64) -> Correspondences {
        let cam = PinholeCamera::new(600.0, 600.0, 320.0, 240.0);
        let r = from_axis_angle_deg(DVec3::Y, 8.0);
        let t = DVec3::new(-1.0, 0.0, 0.1).normalize();
        let mut rng = StdRng::seed_from_u64(seed);
        let mut x1 = Vec::new();
        let mut x2 = Vec::new();
        for _ in 0..40 {
            let p = DVec3::new(
                rng.random_range(-2.0..2.0),
                rng.random_range(-1.5..1.5),
                rng.random_range(4.0..8.0),
            );
            x1.push(cam.project(p).unwrap());
            x2.push(cam.project(r * p + t).unwrap());
        }
        (cam, r, t, x1, x2)
    }

    #[test]
    fn test_refine_two_view() -> Result<(), BundleAdjustmentError> {
        let (cam, r, t, x1, mut x2) = correspondences(3);
        // one correspondence far off its epipolar line
        x2[0] += DVec2::new(0.0, 40.0);

        let r0 = exp(DVec3::new(0.01, -0.01, 0.005)) * r;
        let t0 = (t + DVec3::new(0.0, 0.05, 0.0)).normalize();
        let refined = refine_two_view(&x1, &x2, &cam, &cam, &r0, &t0, &TwoViewConfig::default())?;
        assert!(angle_between(&refined.rotation, &r) < angle_between(&r0, &r));
        assert!(angle_between(&refined.rotation, &r).to_degrees() < 0.05);
        assert!(refined.translation.dot(t) > 0.9999);
        assert!(!refined.inliers.contains(&0));
        assert!(refined.inliers.len() >= 38);
        assert_eq!(refined.points.len(), refined.inliers.len());
        Ok(())
    }

    #[test]
    fn test_refine_two_view_several_outliers() -> Result<(), BundleAdjustmentError> {
        let (cam, r, t, x1, mut x2) = correspondences(7);
        for (k, i) in [2, 11, 23, 35].into_iter().enumerate() {
            let sign = if k % 2 == 0 { 1.0 } else { -1.0 };
            x2[i] += DVec2::new(5.0, sign * 40.0);
        }

        let r0 = exp(DVec3::new(-0.008, 0.006, 0.01)) * r;
        let refined = refine_two_view(&x1, &x2, &cam, &cam, &r0, &t, &TwoViewConfig::default())?;
        assert!(angle_between(&refined.rotation, &r).to_degrees() < 0.05);
        assert!(refined.translation.dot(t) > 0.9999);
        for i in [2, 11, 23, 35] {
            assert!(!refined.inliers.contains(&i));
        }
        assert!(refined.inliers.len() >= 34);
        Ok(())
    }
}
