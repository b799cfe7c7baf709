//! # Pipeline
//!
//! Runs the global optimization stages in order: two-view estimation over all pairs,
//! cycle-consistency filtering, then per connected component rotation averaging, data
//! association, translation averaging, triangulation and bundle adjustment.
//!
//! Every stage waits for the complete output of the previous one. Pair, edge and track
//! failures are absorbed and counted; a failing component is reported and does not
//! affect the others.

use std::collections::BTreeMap;

use glam::DMat3;
use serde::{Deserialize, Serialize};

use crate::averaging::{
    ChordalRotationAveraging, RotationAveraging, TranslationAveraging, TranslationAveraging1dsfm,
    TranslationAveragingInput,
};
use crate::bundle_adjustment::{BundleAdjuster, BundleAdjustmentSummary};
use crate::camera::{collect_calibrations, CalibrationSource, PinholeCamera};
use crate::config::SfmConfig;
use crate::data_association::{
    build_tracks, TrackBuildStats, TrackTriangulator, TriangulationReport,
};
use crate::error::{ComponentFailure, ComponentFailureReason, SfmError};
use crate::parallel::ExecuteExt;
use crate::two_view::TwoViewEstimator;
use crate::types::{
    CameraIndex, GlobalPose, Keypoints, PairCorrespondences, PairKey, PosePriors, Reconstruction,
    RelativePoseEdge,
};
use crate::view_graph::{ViewGraph, ViewGraphEstimator, ViewGraphReport};

/// Input of a full pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SfmInput {
    /// Number of cameras, indexed `0..num_cameras`.
    pub num_cameras: usize,
    /// One calibration per camera, or a single calibration shared by all.
    pub calibrations: Vec<PinholeCamera>,
    /// Keypoints per camera.
    pub keypoints: Vec<Keypoints>,
    /// Putative correspondences of the candidate pairs.
    pub correspondences: Vec<PairCorrespondences>,
    /// Optional pose priors.
    #[serde(default)]
    pub priors: PosePriors,
}

impl SfmInput {
    /// Build an input with calibrations taken from `source`.
    pub fn from_source<S: CalibrationSource + ?Sized>(
        source: &S,
        keypoints: Vec<Keypoints>,
        correspondences: Vec<PairCorrespondences>,
        priors: PosePriors,
    ) -> Result<Self, SfmError> {
        let num_cameras = keypoints.len();
        Ok(Self {
            num_cameras,
            calibrations: collect_calibrations(source, num_cameras)?,
            keypoints,
            correspondences,
            priors,
        })
    }

    /// Reject inputs whose shapes do not agree, before any stage runs.
    pub fn validate(&self) -> Result<(), SfmError> {
        let invalid = |msg: String| Err(SfmError::InvalidInput(msg));
        let n = self.num_cameras;
        if self.calibrations.len() != n && self.calibrations.len() != 1 {
            return invalid(format!(
                "{} calibrations for {} cameras",
                self.calibrations.len(),
                n
            ));
        }
        for cam in self.calibrations.iter() {
            cam.validate()?;
        }
        if self.keypoints.len() != n {
            return invalid(format!(
                "{} keypoint sets for {} cameras",
                self.keypoints.len(),
                n
            ));
        }
        for corr in self.correspondences.iter() {
            if corr.i1 >= n || corr.i2 >= n || corr.i1 == corr.i2 {
                return invalid(format!("invalid pair ({}, {})", corr.i1, corr.i2));
            }
        }
        for p in self.priors.absolute.iter() {
            if p.camera >= n {
                return invalid(format!("absolute prior for unknown camera {}", p.camera));
            }
        }
        for p in self.priors.relative.iter() {
            if p.i1 >= n || p.i2 >= n || p.i1 == p.i2 {
                return invalid(format!(
                    "relative prior for invalid pair ({}, {})",
                    p.i1, p.i2
                ));
            }
        }
        Ok(())
    }

    /// Calibration of every camera.
    pub fn calibration_map(&self) -> BTreeMap<CameraIndex, PinholeCamera> {
        (0..self.num_cameras)
            .filter_map(|i| {
                let cam = self.calibrations.get(i).or(self.calibrations.first())?;
                Some((i, *cam))
            })
            .collect()
    }
}

/// Report of one reconstructed component.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComponentReport {
    /// Cameras of the component after view-graph filtering.
    pub cameras: Vec<CameraIndex>,
    /// Cameras that received no position.
    pub unreconstructed: Vec<CameraIndex>,
    /// Track building counters.
    pub tracks: TrackBuildStats,
    /// Camera pairs whose direction translation averaging used.
    pub num_inlier_directions: usize,
    /// Camera pairs whose direction translation averaging rejected.
    pub num_outlier_directions: usize,
    /// Triangulation counters.
    pub triangulation: TriangulationReport,
    /// Bundle adjustment outcome, `None` when it failed.
    pub bundle_adjustment: Option<BundleAdjustmentSummary>,
}

/// Counters of a pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineReport {
    /// Pairs given to the two-view estimator.
    pub num_input_pairs: usize,
    /// Pairs that produced an edge.
    pub num_verified_pairs: usize,
    /// Pairs dropped by verification.
    pub num_failed_pairs: usize,
    /// Edges built from relative priors alone.
    pub num_prior_edges: usize,
    /// Cycle-consistency outcome.
    pub view_graph: ViewGraphReport,
    /// One entry per reconstructed component, in output order.
    pub components: Vec<ComponentReport>,
    /// Components that could not be reconstructed.
    pub failures: Vec<ComponentFailure>,
    /// Cameras absent from every output reconstruction.
    pub unreconstructed: Vec<CameraIndex>,
}

/// Result of a pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SfmOutput {
    /// One reconstruction per component, largest first.
    pub reconstructions: Vec<Reconstruction>,
    /// Counters and failures.
    pub report: PipelineReport,
}

impl SfmOutput {
    /// The reconstruction with the most cameras.
    pub fn largest(&self) -> Option<&Reconstruction> {
        self.reconstructions.first()
    }
}

/// The global SfM pipeline with its stage implementations.
pub struct SfmPipeline {
    config: SfmConfig,
    two_view: TwoViewEstimator,
    rotation_averaging: Box<dyn RotationAveraging>,
    translation_averaging: Box<dyn TranslationAveraging>,
}

impl std::fmt::Debug for SfmPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SfmPipeline")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SfmPipeline {
    /// Create a pipeline with the default stage implementations.
    pub fn new(config: SfmConfig) -> Result<Self, SfmError> {
        config.validate()?;
        Ok(Self {
            two_view: TwoViewEstimator::new(config.two_view.clone()),
            rotation_averaging: Box::new(ChordalRotationAveraging::new(
                config.rotation_averaging.clone(),
            )),
            translation_averaging: Box::new(TranslationAveraging1dsfm::new(
                config.translation_averaging.clone(),
            )),
            config,
        })
    }

    /// Replace the rotation averager.
    pub fn with_rotation_averaging(mut self, averager: Box<dyn RotationAveraging>) -> Self {
        self.rotation_averaging = averager;
        self
    }

    /// Replace the translation averager.
    pub fn with_translation_averaging(mut self, averager: Box<dyn TranslationAveraging>) -> Self {
        self.translation_averaging = averager;
        self
    }

    /// Replace the two-view estimator.
    pub fn with_two_view(mut self, estimator: TwoViewEstimator) -> Self {
        self.two_view = estimator;
        self
    }

    /// The configuration of the pipeline.
    pub fn config(&self) -> &SfmConfig {
        &self.config
    }

    /// Run every stage on `input`.
    pub fn run(&self, input: &SfmInput) -> Result<SfmOutput, SfmError> {
        input.validate()?;
        let calibrations = input.calibration_map();
        let keypoints: BTreeMap<CameraIndex, Keypoints> =
            input.keypoints.iter().cloned().enumerate().collect();

        let (edges, mut report) = self.estimate_edges(input, &calibrations)?;
        let mut output = self.run_from_edges(&calibrations, &keypoints, edges, &input.priors)?;

        report.view_graph = std::mem::take(&mut output.report.view_graph);
        report.components = std::mem::take(&mut output.report.components);
        report.failures = std::mem::take(&mut output.report.failures);
        report.unreconstructed = std::mem::take(&mut output.report.unreconstructed);
        output.report = report;
        Ok(output)
    }

    // two-view estimation of every pair, plus edges for priors without correspondences
    fn estimate_edges(
        &self,
        input: &SfmInput,
        calibrations: &BTreeMap<CameraIndex, PinholeCamera>,
    ) -> Result<(Vec<RelativePoseEdge>, PipelineReport), SfmError> {
        let mut pairs: BTreeMap<PairKey, PairCorrespondences> = BTreeMap::new();
        for corr in input.correspondences.iter() {
            let corr = corr.clone().ordered();
            pairs.entry(corr.key()).or_insert(corr);
        }
        let pairs: Vec<PairCorrespondences> = pairs.into_values().collect();

        let results = pairs.map_with(self.config.execution, |corr| {
            let (i1, i2) = corr.key();
            let prior = input.priors.relative_for((i1, i2));
            self.two_view.estimate_with_prior(
                corr,
                &input.keypoints[i1],
                &input.keypoints[i2],
                &calibrations[&i1],
                &calibrations[&i2],
                prior.as_ref(),
            )
        })?;

        let mut report = PipelineReport {
            num_input_pairs: pairs.len(),
            ..Default::default()
        };
        let mut edges = Vec::with_capacity(results.len());
        for (corr, res) in pairs.iter().zip(results) {
            match res {
                Ok(edge) => edges.push(edge),
                Err(e) => {
                    report.num_failed_pairs += 1;
                    log::debug!("pair ({}, {}) dropped: {}", corr.i1, corr.i2, e);
                }
            }
        }
        report.num_verified_pairs = edges.len();

        let measured: Vec<PairKey> = pairs.iter().map(|c| c.key()).collect();
        for (key, prior) in input.priors.relative_ordered() {
            if measured.binary_search(&key).is_ok() {
                continue;
            }
            edges.push(RelativePoseEdge {
                i1: prior.i1,
                i2: prior.i2,
                i2_r_i1: prior.i2_r_i1,
                i2_u_i1: prior.direction(),
                inliers: Vec::new(),
                inlier_ratio: 0.0,
                from_prior: true,
            });
            report.num_prior_edges += 1;
        }
        edges.sort_by_key(|e| e.key());

        if report.num_failed_pairs > 0 {
            log::warn!(
                "two-view estimation: {} of {} pairs failed verification",
                report.num_failed_pairs,
                report.num_input_pairs
            );
        }
        log::info!(
            "two-view estimation: {} edges ({} from priors only)",
            edges.len(),
            report.num_prior_edges
        );
        Ok((edges, report))
    }

    /// Run the stages after two-view estimation on precomputed edges.
    ///
    /// The cameras of the problem are the keys of `calibrations`.
    pub fn run_from_edges(
        &self,
        calibrations: &BTreeMap<CameraIndex, PinholeCamera>,
        keypoints: &BTreeMap<CameraIndex, Keypoints>,
        edges: Vec<RelativePoseEdge>,
        priors: &PosePriors,
    ) -> Result<SfmOutput, SfmError> {
        let cameras: Vec<CameraIndex> = calibrations.keys().copied().collect();
        if let Some(e) = edges
            .iter()
            .find(|e| !calibrations.contains_key(&e.i1) || !calibrations.contains_key(&e.i2))
        {
            return Err(SfmError::InvalidInput(format!(
                "edge ({}, {}) references a camera without calibration",
                e.i1, e.i2
            )));
        }

        let graph = ViewGraph::new(cameras.iter().copied(), edges);
        let (filtered, vg_report) =
            ViewGraphEstimator::new(self.config.view_graph.clone()).filter(&graph);

        let mut report = PipelineReport {
            view_graph: vg_report,
            ..Default::default()
        };
        let mut components = Vec::new();
        for component in filtered.connected_components() {
            if component.len() < self.config.min_component_size {
                report.failures.push(ComponentFailure {
                    cameras: component,
                    reason: ComponentFailureReason::Disconnected,
                });
            } else if self.config.reconstruct_all_components || components.is_empty() {
                components.push(filtered.subgraph(&component));
            } else {
                log::info!("skipping component with {} cameras", component.len());
            }
        }

        let results = components.map_with(self.config.execution, |graph| {
            self.reconstruct_component(graph, calibrations, keypoints, priors)
        })?;

        let mut output = SfmOutput::default();
        for res in results {
            match res {
                Ok((rec, comp)) => {
                    output.reconstructions.push(rec);
                    report.components.push(comp);
                }
                Err(failure) => {
                    log::warn!("{}", failure);
                    report.failures.push(failure);
                }
            }
        }

        let reconstructed: Vec<CameraIndex> = output
            .reconstructions
            .iter()
            .flat_map(|r| r.poses.keys().copied())
            .collect();
        report.unreconstructed = cameras
            .iter()
            .filter(|c| !reconstructed.contains(c))
            .copied()
            .collect();

        log::info!(
            "pipeline: {} reconstructions, {} failed components, {} of {} cameras unreconstructed",
            output.reconstructions.len(),
            report.failures.len(),
            report.unreconstructed.len(),
            cameras.len()
        );
        output.report = report;
        Ok(output)
    }

    fn reconstruct_component(
        &self,
        graph: &ViewGraph,
        calibrations: &BTreeMap<CameraIndex, PinholeCamera>,
        keypoints: &BTreeMap<CameraIndex, Keypoints>,
        priors: &PosePriors,
    ) -> Result<(Reconstruction, ComponentReport), ComponentFailure> {
        let cameras = graph.nodes().to_vec();
        let fail = |reason| ComponentFailure {
            cameras: cameras.clone(),
            reason,
        };
        let mut report = ComponentReport {
            cameras: cameras.clone(),
            ..Default::default()
        };

        let rotations: BTreeMap<CameraIndex, DMat3> = self
            .rotation_averaging
            .average(&cameras, graph.edges(), priors)
            .map_err(|e| fail(ComponentFailureReason::RotationAveraging(e)))?;

        let (feature_tracks, track_stats) =
            build_tracks(graph.edges(), keypoints, self.config.triangulation.min_track_length);
        report.tracks = track_stats;

        let component_calibrations: BTreeMap<CameraIndex, PinholeCamera> = cameras
            .iter()
            .filter_map(|c| Some((*c, *calibrations.get(c)?)))
            .collect();
        let translation = self
            .translation_averaging
            .average(&TranslationAveragingInput {
                rotations: &rotations,
                edges: graph.edges(),
                tracks: &feature_tracks,
                calibrations: &component_calibrations,
                priors,
            })
            .map_err(|e| fail(ComponentFailureReason::TranslationAveraging(e)))?;
        report.num_inlier_directions = translation.inlier_edges.len();
        report.num_outlier_directions = translation.outlier_edges.len();
        report.unreconstructed = translation.unreconstructed.clone();

        let poses: BTreeMap<CameraIndex, GlobalPose> = translation
            .positions
            .iter()
            .filter_map(|(c, p)| Some((*c, GlobalPose::new(*rotations.get(c)?, *p))))
            .collect();

        let triangulator = TrackTriangulator::new(self.config.triangulation.clone());
        let (tracks, tri_report) = triangulator
            .triangulate_all(
                &feature_tracks,
                &poses,
                &component_calibrations,
                self.config.execution,
            )
            .map_err(|e| {
                log::warn!("triangulation could not run: {}", e);
                fail(ComponentFailureReason::NoValidTracks)
            })?;
        report.triangulation = tri_report;

        let mut rec = Reconstruction {
            calibrations: component_calibrations
                .into_iter()
                .filter(|(c, _)| poses.contains_key(c))
                .collect(),
            poses,
            tracks,
            refined: false,
        };
        let min_track_length = self.config.bundle_adjustment.min_track_length;
        rec.tracks.retain(|t| t.valid && t.len() >= min_track_length);
        if rec.tracks.is_empty() {
            return Err(fail(ComponentFailureReason::NoValidTracks));
        }

        let adjuster = BundleAdjuster::new(self.config.bundle_adjustment.clone());
        match adjuster.run(&rec, priors) {
            Ok((refined, summary)) => {
                report.bundle_adjustment = Some(summary);
                rec = refined;
            }
            Err(e) => {
                log::warn!(
                    "bundle adjustment failed on component {:?}, keeping the unrefined estimate: {}",
                    cameras,
                    e
                );
            }
        }
        if rec.tracks.is_empty() {
            return Err(fail(ComponentFailureReason::NoValidTracks));
        }

        let stats = rec.stats();
        log::info!(
            "component {:?}: {} cameras, {} tracks, mean reprojection error {:.3} px",
            cameras,
            stats.num_cameras,
            stats.num_tracks,
            stats.mean_reprojection_error
        );
        Ok((rec, report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AbsolutePosePrior, RelativePosePrior};
    use glam::DVec3;

    fn input() -> SfmInput {
        SfmInput {
            num_cameras: 3,
            calibrations: vec![PinholeCamera::default()],
            keypoints: vec![Keypoints::default(); 3],
            correspondences: vec![PairCorrespondences {
                i1: 2,
                i2: 0,
                matches: vec![],
            }],
            priors: PosePriors::default(),
        }
    }

    #[test]
    fn test_validate_input() {
        assert!(input().validate().is_ok());
        assert_eq!(input().calibration_map().len(), 3);

        let mut bad = input();
        bad.calibrations = vec![PinholeCamera::default(); 2];
        assert!(matches!(bad.validate(), Err(SfmError::InvalidInput(_))));

        let mut bad = input();
        bad.correspondences[0].i2 = 3;
        assert!(bad.validate().is_err());

        let mut bad = input();
        bad.priors.absolute.push(AbsolutePosePrior {
            camera: 5,
            w_r_c: None,
            w_t_c: Some(DVec3::ZERO),
            rotation_sigma: 0.1,
            translation_sigma: 0.1,
        });
        assert!(bad.validate().is_err());

        let mut bad = input();
        bad.calibrations[0].fx = -1.0;
        assert!(matches!(bad.validate(), Err(SfmError::Camera(_))));
    }

    #[test]
    fn test_failed_pairs_and_prior_edges() -> Result<(), SfmError> {
        let mut input = input();
        input.priors.relative.push(RelativePosePrior {
            i1: 1,
            i2: 0,
            i2_r_i1: DMat3::IDENTITY,
            i2_t_i1: DVec3::X,
            rotation_sigma: 0.01,
            translation_sigma: 0.01,
            strength: Default::default(),
        });
        let pipeline = SfmPipeline::new(SfmConfig::default())?;
        let (edges, report) = pipeline.estimate_edges(&input, &input.calibration_map())?;
        assert_eq!(report.num_input_pairs, 1);
        assert_eq!(report.num_failed_pairs, 1);
        assert_eq!(report.num_prior_edges, 1);
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].key(), (0, 1));
        assert!(edges[0].from_prior);
        Ok(())
    }

    #[test]
    fn test_isolated_cameras_are_reported() -> Result<(), SfmError> {
        let pipeline = SfmPipeline::new(SfmConfig::default())?;
        let output = pipeline.run(&input())?;
        assert!(output.reconstructions.is_empty());
        assert_eq!(output.report.failures.len(), 3);
        assert!(output
            .report
            .failures
            .iter()
            .all(|f| f.reason == ComponentFailureReason::Disconnected));
        assert_eq!(output.report.unreconstructed, vec![0, 1, 2]);
        Ok(())
    }
}
