use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use glam::{DMat3, DVec2, DVec3};
use kornia_sfm::camera::PinholeCamera;
use kornia_sfm::geometry::so3;
use kornia_sfm::pose::{essential_8point, recover_pose};
use kornia_sfm::two_view::{TwoViewConfig, TwoViewEstimator};
use kornia_sfm::types::{Keypoints, PairCorrespondences};
use rand::{rngs::StdRng, Rng, SeedableRng};

/// Generate `n` points seen by two cameras, with a fraction of shuffled outliers.
fn generate_pair(n: usize, outlier_ratio: f64) -> (PinholeCamera, Keypoints, Keypoints) {
    let camera = PinholeCamera::new(500.0, 500.0, 320.0, 240.0);
    let r = so3::from_axis_angle_deg(DVec3::new(0.1, 1.0, 0.0), 8.0);
    let t = DVec3::new(-1.0, 0.05, 0.1);

    let mut rng = StdRng::seed_from_u64(42);
    let mut x1 = Vec::with_capacity(n);
    let mut x2 = Vec::with_capacity(n);
    while x1.len() < n {
        let p = DVec3::new(
            rng.random_range(-2.0..2.0),
            rng.random_range(-1.5..1.5),
            rng.random_range(4.0..8.0),
        );
        let (Some(a), Some(b)) = (camera.project(p), camera.project(r * p + t)) else {
            continue;
        };
        x1.push([a.x, a.y]);
        x2.push([b.x, b.y]);
    }
    let num_outliers = (n as f64 * outlier_ratio) as usize;
    for px in x2.iter_mut().take(num_outliers) {
        *px = [rng.random_range(0.0..640.0), rng.random_range(0.0..480.0)];
    }
    (
        camera,
        Keypoints::from_coordinates(x1),
        Keypoints::from_coordinates(x2),
    )
}

fn bench_essential_8point(c: &mut Criterion) {
    let mut group = c.benchmark_group("essential_8point");
    for &n in &[8, 50, 200] {
        let (camera, kps1, kps2) = generate_pair(n, 0.0);
        let normalize = |kps: &Keypoints| -> Vec<DVec2> {
            (0..kps.len())
                .filter_map(|i| kps.point(i))
                .map(|px| camera.pixel_to_normalized(px))
                .collect()
        };
        let (x1n, x2n) = (normalize(&kps1), normalize(&kps2));
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, _| {
            b.iter(|| {
                let e = essential_8point(&x1n, &x2n).unwrap_or(DMat3::IDENTITY);
                std::hint::black_box(recover_pose(&e, &x1n, &x2n));
            });
        });
    }
    group.finish();
}

fn bench_two_view_estimate(c: &mut Criterion) {
    let mut group = c.benchmark_group("two_view_estimate");
    let estimator = TwoViewEstimator::new(TwoViewConfig::default());
    for &n in &[100, 500, 2000] {
        let (camera, kps1, kps2) = generate_pair(n, 0.3);
        let corr = PairCorrespondences {
            i1: 0,
            i2: 1,
            matches: (0..n).map(|k| [k, k]).collect(),
        };
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, _| {
            b.iter(|| {
                let edge = estimator.estimate(&corr, &kps1, &kps2, &camera, &camera);
                let _ = std::hint::black_box(edge);
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_essential_8point, bench_two_view_estimate);
criterion_main!(benches);
