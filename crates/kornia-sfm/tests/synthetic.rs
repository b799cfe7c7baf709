mod common;

use std::collections::BTreeMap;
use std::error::Error;

use common::{rotation_error_deg, square_scene, SyntheticScene};
use kornia_sfm::camera::PinholeCamera;
use kornia_sfm::data_association::build_tracks;
use kornia_sfm::geometry::so3;
use kornia_sfm::parallel::ExecutionStrategy;
use kornia_sfm::types::{CameraIndex, Keypoints, Reconstruction};
use kornia_sfm::{SfmConfig, SfmPipeline};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn check_accuracy(scene: &SyntheticScene, rec: &Reconstruction, scale: f64) {
    assert_eq!(rec.cameras(), vec![0, 1, 2, 3]);
    for (i, gt) in scene.poses.iter().enumerate() {
        let pose = rec.poses[&i];
        let rot_err = rotation_error_deg(&pose.w_r_c, &gt.w_r_c);
        assert!(rot_err < 1.0, "camera {} rotation error {} deg", i, rot_err);
        let pos_err = (pose.w_t_c - scale * gt.w_t_c).length();
        assert!(
            pos_err < 0.01 * scale * scene.baseline(),
            "camera {} position error {}",
            i,
            pos_err
        );
    }
}

type CameraMaps = (
    BTreeMap<CameraIndex, PinholeCamera>,
    BTreeMap<CameraIndex, Keypoints>,
);

fn maps(scene: &SyntheticScene, keypoints: Vec<Keypoints>) -> CameraMaps {
    let calibs = (0..scene.poses.len()).map(|i| (i, scene.camera)).collect();
    let kps = keypoints.into_iter().enumerate().collect();
    (calibs, kps)
}

#[test]
fn test_end_to_end_square() -> Result<(), Box<dyn Error>> {
    init_logger();
    let scene = square_scene(0);
    let input = scene.input(0.3, 1);

    let output = SfmPipeline::new(SfmConfig::default())?.run(&input)?;
    assert_eq!(output.report.num_verified_pairs, 6);
    assert!(output.report.view_graph.dropped.is_empty());
    assert!(output.report.failures.is_empty());
    assert!(output.report.unreconstructed.is_empty());
    assert_eq!(output.reconstructions.len(), 1);

    let rec = output.largest().ok_or("no reconstruction")?;
    assert!(rec.refined);
    check_accuracy(&scene, rec, 1.0);

    let stats = rec.stats();
    assert!(stats.num_tracks >= 18, "only {} tracks", stats.num_tracks);
    assert!(stats.mean_reprojection_error < 1.0);
    Ok(())
}

#[test]
fn test_corrupted_edge_is_removed() -> Result<(), Box<dyn Error>> {
    init_logger();
    let scene = square_scene(2);
    let mut edges = scene.edges();
    let corrupted = so3::from_axis_angle_deg(glam::DVec3::new(0.3, 1.0, -0.2), 90.0);
    edges[0].i2_r_i1 = corrupted * edges[0].i2_r_i1;
    assert_eq!(edges[0].key(), (0, 1));

    let (calibs, kps) = maps(&scene, scene.keypoints(0.3, 3));
    let pipeline = SfmPipeline::new(SfmConfig::default())?;
    let output = pipeline.run_from_edges(&calibs, &kps, edges, &scene.priors(1.0))?;

    assert_eq!(output.report.view_graph.dropped, vec![(0, 1)]);
    assert_eq!(output.report.view_graph.kept.len(), 5);
    let rec = output.largest().ok_or("no reconstruction")?;
    check_accuracy(&scene, rec, 1.0);
    Ok(())
}

#[test]
fn test_prior_scale_propagates() -> Result<(), Box<dyn Error>> {
    init_logger();
    let scene = square_scene(4);
    let pipeline = SfmPipeline::new(SfmConfig::default())?;

    let mut input = scene.input(0.2, 5);
    let unit = pipeline.run(&input)?;
    input.priors = scene.priors(3.0);
    let scaled = pipeline.run(&input)?;

    let a = unit.largest().ok_or("no reconstruction")?;
    let b = scaled.largest().ok_or("no reconstruction")?;
    check_accuracy(&scene, b, 3.0);
    for (i, pose) in a.poses.iter() {
        let expected = 3.0 * pose.w_t_c;
        assert!((b.poses[i].w_t_c - expected).length() < 0.01 * expected.length().max(1.0));
    }
    Ok(())
}

#[test]
fn test_bundle_adjustment_does_not_increase_error() -> Result<(), Box<dyn Error>> {
    init_logger();
    let scene = square_scene(6);
    let output = SfmPipeline::new(SfmConfig::default())?.run(&scene.input(0.5, 7))?;
    let summary = output.report.components[0]
        .bundle_adjustment
        .as_ref()
        .ok_or("bundle adjustment did not run")?;
    assert!(summary.final_mean_reprojection_error <= summary.initial_mean_reprojection_error);
    assert!(summary.final_cost <= summary.initial_cost);
    Ok(())
}

#[test]
fn test_tracks_have_distinct_cameras() {
    let scene = square_scene(8);
    let mut edges = scene.edges();
    // a wrong match that merges two tracks through camera 2
    edges[5].inliers.push([3, 4]);
    let (_, kps) = maps(&scene, scene.keypoints(0.0, 0));
    let (tracks, stats) = build_tracks(&edges, &kps, 3);
    assert_eq!(stats.num_inconsistent, 1);
    assert_eq!(tracks.len(), 18);
    for track in tracks.iter() {
        assert!(track.len() >= 3);
        let mut cams: Vec<_> = track.cameras().collect();
        cams.dedup();
        assert_eq!(cams.len(), track.len());
    }
}

#[test]
fn test_execution_strategies_agree() -> Result<(), Box<dyn Error>> {
    let scene = square_scene(10);
    let input = scene.input(0.3, 11);

    let run = |execution| -> Result<Reconstruction, Box<dyn Error>> {
        let config = SfmConfig {
            execution,
            ..Default::default()
        };
        let output = SfmPipeline::new(config)?.run(&input)?;
        Ok(output.largest().ok_or("no reconstruction")?.clone())
    };
    let serial = run(ExecutionStrategy::Serial)?;
    let parallel = run(ExecutionStrategy::Fixed(3))?;
    assert_eq!(serial.tracks.len(), parallel.tracks.len());
    for (i, pose) in serial.poses.iter() {
        assert!((parallel.poses[i].w_t_c - pose.w_t_c).length() < 1e-9);
    }
    Ok(())
}
