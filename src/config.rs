use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{ConfigError, ParameterError};
use crate::manager::EnsembleSettings;
use crate::params::{expect_bool, expect_f64, expect_u32, unknown, ParamValue, TunableConfig};

const APP_DIR: &str = "TextRegionEngine";

/// MSER blob detector settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MserConfig {
    /// Grey-level step used by the stability test
    pub delta: u32,
    pub min_area: u32,
    pub max_area: u32,
    pub max_variation: f64,
    pub min_width: u32,
    pub min_height: u32,
    pub min_aspect_ratio: f64,
    pub max_aspect_ratio: f64,
    pub merge_regions: bool,
    pub overlap_threshold: f64,
}

impl Default for MserConfig {
    fn default() -> Self {
        Self {
            delta: 5,
            min_area: 60,
            max_area: 14400,
            max_variation: 0.25,
            min_width: 8,
            min_height: 8,
            min_aspect_ratio: 0.1,
            max_aspect_ratio: 20.0,
            merge_regions: true,
            overlap_threshold: 0.3,
        }
    }
}

impl TunableConfig for MserConfig {
    fn parameter_names(&self) -> &'static [&'static str] {
        &[
            "delta",
            "min_area",
            "max_area",
            "max_variation",
            "min_width",
            "min_height",
            "min_aspect_ratio",
            "max_aspect_ratio",
            "merge_regions",
            "overlap_threshold",
        ]
    }

    fn get(&self, name: &str) -> Option<ParamValue> {
        Some(match name {
            "delta" => self.delta.into(),
            "min_area" => self.min_area.into(),
            "max_area" => self.max_area.into(),
            "max_variation" => self.max_variation.into(),
            "min_width" => self.min_width.into(),
            "min_height" => self.min_height.into(),
            "min_aspect_ratio" => self.min_aspect_ratio.into(),
            "max_aspect_ratio" => self.max_aspect_ratio.into(),
            "merge_regions" => self.merge_regions.into(),
            "overlap_threshold" => self.overlap_threshold.into(),
            _ => return None,
        })
    }

    fn set(&mut self, name: &str, value: ParamValue) -> Result<(), ParameterError> {
        match name {
            "delta" => self.delta = expect_u32(name, value, 1, 64)?,
            "min_area" => self.min_area = expect_u32(name, value, 1, u32::MAX)?,
            "max_area" => self.max_area = expect_u32(name, value, 1, u32::MAX)?,
            "max_variation" => self.max_variation = expect_f64(name, value, 0.0, 10.0)?,
            "min_width" => self.min_width = expect_u32(name, value, 1, 10_000)?,
            "min_height" => self.min_height = expect_u32(name, value, 1, 10_000)?,
            "min_aspect_ratio" => self.min_aspect_ratio = expect_f64(name, value, 0.0, 1000.0)?,
            "max_aspect_ratio" => self.max_aspect_ratio = expect_f64(name, value, 0.0, 1000.0)?,
            "merge_regions" => self.merge_regions = expect_bool(name, value)?,
            "overlap_threshold" => self.overlap_threshold = expect_f64(name, value, 0.0, 1.0)?,
            _ => return Err(unknown(name)),
        }
        Ok(())
    }
}

/// Stroke width transform detector settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwtConfig {
    pub canny_low: f64,
    pub canny_high: f64,
    pub dark_on_light: bool,
    pub max_stroke_width: u32,
    /// Components whose stroke variance / mean exceeds this are rejected
    pub max_variance_ratio: f64,
    pub min_component_area: u32,
    pub min_height: u32,
    pub min_aspect_ratio: f64,
    pub max_aspect_ratio: f64,
    pub group_components: bool,
    /// Maximum gap between grouped components, in multiples of their height
    pub group_distance_factor: f64,
    pub stroke_ratio_threshold: f64,
    pub height_ratio_threshold: f64,
    pub overlap_threshold: f64,
}

impl Default for SwtConfig {
    fn default() -> Self {
        Self {
            canny_low: 50.0,
            canny_high: 150.0,
            dark_on_light: true,
            max_stroke_width: 40,
            max_variance_ratio: 0.5,
            min_component_area: 10,
            min_height: 6,
            min_aspect_ratio: 0.1,
            max_aspect_ratio: 10.0,
            group_components: true,
            group_distance_factor: 1.0,
            stroke_ratio_threshold: 2.0,
            height_ratio_threshold: 2.0,
            overlap_threshold: 0.3,
        }
    }
}

impl TunableConfig for SwtConfig {
    fn parameter_names(&self) -> &'static [&'static str] {
        &[
            "canny_low",
            "canny_high",
            "dark_on_light",
            "max_stroke_width",
            "max_variance_ratio",
            "min_component_area",
            "min_height",
            "min_aspect_ratio",
            "max_aspect_ratio",
            "group_components",
            "group_distance_factor",
            "stroke_ratio_threshold",
            "height_ratio_threshold",
            "overlap_threshold",
        ]
    }

    fn get(&self, name: &str) -> Option<ParamValue> {
        Some(match name {
            "canny_low" => self.canny_low.into(),
            "canny_high" => self.canny_high.into(),
            "dark_on_light" => self.dark_on_light.into(),
            "max_stroke_width" => self.max_stroke_width.into(),
            "max_variance_ratio" => self.max_variance_ratio.into(),
            "min_component_area" => self.min_component_area.into(),
            "min_height" => self.min_height.into(),
            "min_aspect_ratio" => self.min_aspect_ratio.into(),
            "max_aspect_ratio" => self.max_aspect_ratio.into(),
            "group_components" => self.group_components.into(),
            "group_distance_factor" => self.group_distance_factor.into(),
            "stroke_ratio_threshold" => self.stroke_ratio_threshold.into(),
            "height_ratio_threshold" => self.height_ratio_threshold.into(),
            "overlap_threshold" => self.overlap_threshold.into(),
            _ => return None,
        })
    }

    fn set(&mut self, name: &str, value: ParamValue) -> Result<(), ParameterError> {
        match name {
            "canny_low" => self.canny_low = expect_f64(name, value, 0.0, 2000.0)?,
            "canny_high" => self.canny_high = expect_f64(name, value, 0.0, 2000.0)?,
            "dark_on_light" => self.dark_on_light = expect_bool(name, value)?,
            "max_stroke_width" => self.max_stroke_width = expect_u32(name, value, 1, 500)?,
            "max_variance_ratio" => self.max_variance_ratio = expect_f64(name, value, 0.0, 100.0)?,
            "min_component_area" => self.min_component_area = expect_u32(name, value, 1, u32::MAX)?,
            "min_height" => self.min_height = expect_u32(name, value, 1, 10_000)?,
            "min_aspect_ratio" => self.min_aspect_ratio = expect_f64(name, value, 0.0, 1000.0)?,
            "max_aspect_ratio" => self.max_aspect_ratio = expect_f64(name, value, 0.0, 1000.0)?,
            "group_components" => self.group_components = expect_bool(name, value)?,
            "group_distance_factor" => {
                self.group_distance_factor = expect_f64(name, value, 0.0, 100.0)?
            }
            "stroke_ratio_threshold" => {
                self.stroke_ratio_threshold = expect_f64(name, value, 1.0, 100.0)?
            }
            "height_ratio_threshold" => {
                self.height_ratio_threshold = expect_f64(name, value, 1.0, 100.0)?
            }
            "overlap_threshold" => self.overlap_threshold = expect_f64(name, value, 0.0, 1.0)?,
            _ => return Err(unknown(name)),
        }
        Ok(())
    }
}

/// Adaptive (template + proposal + history) detector settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveConfig {
    /// Proposals below `1 - sensitivity` confidence are discarded
    pub sensitivity: f64,
    pub min_region_area: u32,
    /// Candidates below this after history weighting are dropped
    pub min_confidence: f64,
    pub max_regions: u32,
    pub overlap_threshold: f64,
    /// Survivors at or above this confidence are learned as templates
    pub template_confidence_threshold: f64,
    /// Templates below this success rate are evicted
    pub template_min_success_rate: f64,
    pub max_templates: u32,
    pub history_capacity: u32,
    /// Number of recent history entries used for pattern matching and adaptation
    pub history_window: u32,
    pub adaptation_interval_secs: u32,
    pub slow_processing_ms: f64,
    pub low_region_count: f64,
    pub fallback_to_full_image: bool,
    pub fallback_confidence: f64,
    pub min_fallback_size: u32,
    pub min_aspect_ratio: f64,
    pub max_aspect_ratio: f64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            sensitivity: 0.7,
            min_region_area: 100,
            min_confidence: 0.3,
            max_regions: 50,
            overlap_threshold: 0.3,
            template_confidence_threshold: 0.85,
            template_min_success_rate: 0.3,
            max_templates: 200,
            history_capacity: 100,
            history_window: 10,
            adaptation_interval_secs: 30,
            slow_processing_ms: 500.0,
            low_region_count: 3.0,
            fallback_to_full_image: true,
            fallback_confidence: 0.8,
            min_fallback_size: 10,
            min_aspect_ratio: 0.05,
            max_aspect_ratio: 50.0,
        }
    }
}

impl TunableConfig for AdaptiveConfig {
    fn parameter_names(&self) -> &'static [&'static str] {
        &[
            "sensitivity",
            "min_region_area",
            "min_confidence",
            "max_regions",
            "overlap_threshold",
            "template_confidence_threshold",
            "template_min_success_rate",
            "max_templates",
            "history_capacity",
            "history_window",
            "adaptation_interval_secs",
            "slow_processing_ms",
            "low_region_count",
            "fallback_to_full_image",
            "fallback_confidence",
            "min_fallback_size",
            "min_aspect_ratio",
            "max_aspect_ratio",
        ]
    }

    fn get(&self, name: &str) -> Option<ParamValue> {
        Some(match name {
            "sensitivity" => self.sensitivity.into(),
            "min_region_area" => self.min_region_area.into(),
            "min_confidence" => self.min_confidence.into(),
            "max_regions" => self.max_regions.into(),
            "overlap_threshold" => self.overlap_threshold.into(),
            "template_confidence_threshold" => self.template_confidence_threshold.into(),
            "template_min_success_rate" => self.template_min_success_rate.into(),
            "max_templates" => self.max_templates.into(),
            "history_capacity" => self.history_capacity.into(),
            "history_window" => self.history_window.into(),
            "adaptation_interval_secs" => self.adaptation_interval_secs.into(),
            "slow_processing_ms" => self.slow_processing_ms.into(),
            "low_region_count" => self.low_region_count.into(),
            "fallback_to_full_image" => self.fallback_to_full_image.into(),
            "fallback_confidence" => self.fallback_confidence.into(),
            "min_fallback_size" => self.min_fallback_size.into(),
            "min_aspect_ratio" => self.min_aspect_ratio.into(),
            "max_aspect_ratio" => self.max_aspect_ratio.into(),
            _ => return None,
        })
    }

    fn set(&mut self, name: &str, value: ParamValue) -> Result<(), ParameterError> {
        match name {
            "sensitivity" => self.sensitivity = expect_f64(name, value, 0.0, 1.0)?,
            "min_region_area" => self.min_region_area = expect_u32(name, value, 1, u32::MAX)?,
            "min_confidence" => self.min_confidence = expect_f64(name, value, 0.0, 1.0)?,
            "max_regions" => self.max_regions = expect_u32(name, value, 1, 10_000)?,
            "overlap_threshold" => self.overlap_threshold = expect_f64(name, value, 0.0, 1.0)?,
            "template_confidence_threshold" => {
                self.template_confidence_threshold = expect_f64(name, value, 0.0, 1.0)?
            }
            "template_min_success_rate" => {
                self.template_min_success_rate = expect_f64(name, value, 0.0, 1.0)?
            }
            "max_templates" => self.max_templates = expect_u32(name, value, 0, 100_000)?,
            "history_capacity" => self.history_capacity = expect_u32(name, value, 1, 100_000)?,
            "history_window" => self.history_window = expect_u32(name, value, 1, 100_000)?,
            "adaptation_interval_secs" => {
                self.adaptation_interval_secs = expect_u32(name, value, 1, 86_400)?
            }
            "slow_processing_ms" => self.slow_processing_ms = expect_f64(name, value, 0.0, 1e7)?,
            "low_region_count" => self.low_region_count = expect_f64(name, value, 0.0, 1e6)?,
            "fallback_to_full_image" => self.fallback_to_full_image = expect_bool(name, value)?,
            "fallback_confidence" => self.fallback_confidence = expect_f64(name, value, 0.0, 1.0)?,
            "min_fallback_size" => self.min_fallback_size = expect_u32(name, value, 1, 100_000)?,
            "min_aspect_ratio" => self.min_aspect_ratio = expect_f64(name, value, 0.0, 1000.0)?,
            "max_aspect_ratio" => self.max_aspect_ratio = expect_f64(name, value, 0.0, 1000.0)?,
            _ => return Err(unknown(name)),
        }
        Ok(())
    }
}

/// Region aggregator settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    pub overlap_threshold: f64,
    /// Area (px²) at which the size score saturates
    pub ideal_area: f64,
    /// Minimum IoU for a region to continue a previous-frame track
    pub tracking_iou_threshold: f64,
    /// Weight of the current frame when blending tracked confidence
    pub tracking_blend: f64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            overlap_threshold: 0.3,
            ideal_area: 5000.0,
            tracking_iou_threshold: 0.3,
            tracking_blend: 0.7,
        }
    }
}

/// Detector manager settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Detector used until enough executions were recorded to rank
    pub default_detector: String,
    /// Always use this detector when registered
    pub forced_detector: Option<String>,
    pub min_executions_for_ranking: u64,
    /// Fallback candidates need a success rate above this
    pub fallback_min_success_rate: f64,
    pub rerank_interval_secs: u64,
    /// Capacity of the recent-execution log, pruned on every re-ranking pass
    pub ranking_log_capacity: usize,
    pub enable_tracking: bool,
    pub attach_crops: bool,
    pub ensemble: EnsembleSettings,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            default_detector: "Adaptive".to_string(),
            forced_detector: None,
            min_executions_for_ranking: 5,
            fallback_min_success_rate: 0.8,
            rerank_interval_secs: 60,
            ranking_log_capacity: 200,
            enable_tracking: false,
            attach_crops: false,
            ensemble: EnsembleSettings::default(),
        }
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub mser: MserConfig,
    pub swt: SwtConfig,
    pub adaptive: AdaptiveConfig,
    pub aggregator: AggregatorConfig,
    pub manager: ManagerConfig,
}

impl EngineConfig {
    /// Load configuration from the platform-specific config directory.
    /// Creates default config if file doesn't exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::config_path().ok_or(ConfigError::NoConfigDir)?;
        if path.exists() {
            Self::load_from(&path)
        } else {
            let config = Self::default();
            config.save_to(&path)?;
            tracing::info!("Created default engine config at: {}", path.display());
            Ok(config)
        }
    }

    /// Save configuration to the platform-specific config directory
    pub fn save(&self) -> Result<(), ConfigError> {
        let path = Self::config_path().ok_or(ConfigError::NoConfigDir)?;
        self.save_to(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let load_failed = |source: Box<dyn std::error::Error + Send + Sync>| ConfigError::LoadFailed {
            path: path.display().to_string(),
            source,
        };
        let content = fs::read_to_string(path).map_err(|e| load_failed(Box::new(e)))?;
        let config: EngineConfig =
            serde_json::from_str(&content).map_err(|e| load_failed(Box::new(e)))?;
        tracing::info!("Loaded engine config from: {}", path.display());
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let save_failed = |source: Box<dyn std::error::Error + Send + Sync>| ConfigError::SaveFailed {
            path: path.display().to_string(),
            source,
        };

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| save_failed(Box::new(e)))?;
        }

        let json = serde_json::to_string_pretty(self).map_err(|e| save_failed(Box::new(e)))?;
        fs::write(path, json).map_err(|e| save_failed(Box::new(e)))?;
        Ok(())
    }

    /// `<config dir>/TextRegionEngine/engine.json`
    pub fn config_path() -> Option<PathBuf> {
        Self::app_dir().map(|dir| dir.join("engine.json"))
    }

    /// Default directory for detector profiles
    pub fn profiles_dir() -> Option<PathBuf> {
        Self::app_dir().map(|dir| dir.join("profiles"))
    }

    fn app_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_DIR))
    }
}
