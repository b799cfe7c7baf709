use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::averaging::{RotationAveragingConfig, TranslationAveragingConfig};
use crate::bundle_adjustment::BundleAdjustmentConfig;
use crate::data_association::TriangulationConfig;
use crate::error::SfmError;
use crate::parallel::ExecutionStrategy;
use crate::two_view::TwoViewConfig;
use crate::view_graph::ViewGraphConfig;

/// Options of every pipeline stage.
///
/// All fields have defaults, so a JSON file only needs the values it changes:
///
/// ```json
/// { "view_graph": { "max_cycle_error_deg": 5.0 }, "execution": "serial" }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SfmConfig {
    /// Two-view estimation.
    pub two_view: TwoViewConfig,
    /// Cycle-consistency filtering.
    pub view_graph: ViewGraphConfig,
    /// Rotation averaging.
    pub rotation_averaging: RotationAveragingConfig,
    /// Translation averaging.
    pub translation_averaging: TranslationAveragingConfig,
    /// Track triangulation.
    pub triangulation: TriangulationConfig,
    /// Bundle adjustment.
    pub bundle_adjustment: BundleAdjustmentConfig,
    /// How pairs, components and tracks are scheduled.
    pub execution: ExecutionStrategy,
    /// Components with fewer cameras are reported as disconnected.
    pub min_component_size: usize,
    /// Reconstruct every component, or only the largest one.
    pub reconstruct_all_components: bool,
}

impl Default for SfmConfig {
    fn default() -> Self {
        Self {
            two_view: TwoViewConfig::default(),
            view_graph: ViewGraphConfig::default(),
            rotation_averaging: RotationAveragingConfig::default(),
            translation_averaging: TranslationAveragingConfig::default(),
            triangulation: TriangulationConfig::default(),
            bundle_adjustment: BundleAdjustmentConfig::default(),
            execution: ExecutionStrategy::Parallel,
            min_component_size: 2,
            reconstruct_all_components: true,
        }
    }
}

impl SfmConfig {
    /// Parse a configuration from a JSON string.
    pub fn from_json_str(s: &str) -> Result<Self, SfmError> {
        let config: SfmConfig = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, SfmError> {
        let s = std::fs::read_to_string(path)?;
        Self::from_json_str(&s)
    }

    /// Serialize the configuration to pretty JSON.
    pub fn to_json_string(&self) -> Result<String, SfmError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Check the values that would make a stage fail for every input.
    pub fn validate(&self) -> Result<(), SfmError> {
        let invalid = |msg: String| Err(SfmError::InvalidInput(msg));

        self.execution.validate()?;
        if self.min_component_size < 2 {
            return invalid(format!(
                "min_component_size must be at least 2, got {}",
                self.min_component_size
            ));
        }
        let ransac = &self.two_view.ransac;
        if ransac.threshold <= 0.0 || !(0.0..1.0).contains(&ransac.confidence) {
            return invalid("ransac threshold must be positive and confidence in [0, 1)".into());
        }
        if !(0.0..=1.0).contains(&self.two_view.min_inlier_ratio) {
            return invalid(format!(
                "min_inlier_ratio must be in [0, 1], got {}",
                self.two_view.min_inlier_ratio
            ));
        }
        if self.view_graph.max_cycle_error_deg <= 0.0 {
            return invalid("max_cycle_error_deg must be positive".into());
        }
        let ra = &self.rotation_averaging;
        if !ra.loss.is_valid() || ra.measurement_sigma <= 0.0 {
            return invalid("invalid rotation averaging loss or measurement sigma".into());
        }
        let ta = &self.translation_averaging;
        if ta.noise_sigma <= 0.0 || ta.huber_k <= 0.0 || ta.scale_factor <= 0.0 {
            return invalid(
                "translation averaging sigma, huber_k and scale_factor must be positive".into(),
            );
        }
        if self.triangulation.min_track_length < 2 || self.bundle_adjustment.min_track_length < 2 {
            return invalid("minimum track lengths must be at least 2".into());
        }
        self.bundle_adjustment
            .validate()
            .map_err(|e| SfmError::InvalidInput(e.to_string()))
    }
}
