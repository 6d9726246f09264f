//! Adaptive detector
//!
//! Three phases run in order on every call:
//!
//! 1. **Templates**: learned positions compatible with the frame shape are
//!    emitted with their success rate as confidence.
//! 2. **Proposals**: the external proposal service (if any) is queried, its
//!    rectangles mapped back to frame space, filtered, merged and capped. When
//!    nothing usable comes back the whole frame becomes one fallback region.
//! 3. **History weighting**: every candidate is weighted by how well it
//!    matches where regions were found recently; weak candidates are dropped
//!    and confident survivors are folded back into the template cache.
//!
//! A background task (see [`AdaptiveDetector::start_adaptation`]) periodically
//! retunes sensitivity and minimum region area from the history.

mod history;
mod template;

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use image::RgbaImage;
use serde::Serialize;

use super::{validate_image, DetectionMethod, TextDetector};
use crate::aggregator::merge_overlapping;
use crate::background::BackgroundTask;
use crate::cancel::CancellationToken;
use crate::config::AdaptiveConfig;
use crate::error::{DetectionError, ParameterError, ProfileError};
use crate::params::{ParamValue, SharedConfig};
use crate::profile::DetectorProfile;
use crate::proposal::RegionProposalService;
use crate::region::{sort_by_confidence, Rect, RegionType, TextRegion, META_TEMPLATE_KEY};

pub use history::DetectionHistoryEntry;
pub use template::{template_key, RegionTemplate, TemplateUpdate};

use history::{history_match_score, DetectionHistory};
use template::{TemplateCache, UpdatePolicy};

/// Method tag of the whole-frame fallback region
pub const FALLBACK_METHOD: &str = "FullScreenFallback";

/// Method tag of regions instantiated from templates
pub const TEMPLATE_METHOD: &str = "Template";

const SENSITIVITY_STEP: f64 = 0.1;
const MIN_SENSITIVITY: f64 = 0.3;
const REGION_AREA_FACTOR: f64 = 0.8;
const MIN_REGION_AREA_FLOOR: u32 = 25;

/// Output of the proposal phase
struct ProposalOutcome {
    regions: Vec<TextRegion>,
    raw_count: usize,
    used_fallback: bool,
}

/// Snapshot of the detector's learning state
#[derive(Debug, Clone, Serialize)]
pub struct AdaptiveStatistics {
    pub total_detections: u64,
    pub fallback_detections: u64,
    pub template_count: usize,
    pub history_len: usize,
    pub average_processing_ms: Option<f64>,
    pub average_region_count: Option<f64>,
    pub sensitivity: f64,
    pub min_region_area: u32,
}

/// Template- and proposal-driven detector that learns from its own output
pub struct AdaptiveDetector {
    config: SharedConfig<AdaptiveConfig>,
    proposals: Option<Arc<dyn RegionProposalService>>,
    templates: TemplateCache,
    history: DetectionHistory,
    total_detections: AtomicU64,
    fallback_detections: AtomicU64,
}

impl AdaptiveDetector {
    pub const NAME: &'static str = "Adaptive";

    pub fn new(config: AdaptiveConfig, proposals: Option<Arc<dyn RegionProposalService>>) -> Self {
        Self {
            config: SharedConfig::new(config),
            proposals,
            templates: TemplateCache::default(),
            history: DetectionHistory::default(),
            total_detections: AtomicU64::new(0),
            fallback_detections: AtomicU64::new(0),
        }
    }

    /// Default config, no proposal service
    pub fn with_defaults() -> Self {
        Self::new(AdaptiveConfig::default(), None)
    }

    pub fn with_proposal_service(
        config: AdaptiveConfig,
        service: Arc<dyn RegionProposalService>,
    ) -> Self {
        Self::new(config, Some(service))
    }

    pub fn config(&self) -> AdaptiveConfig {
        self.config.snapshot()
    }

    /// Learned templates, sorted by key
    pub fn templates(&self) -> Vec<RegionTemplate> {
        self.templates.snapshot()
    }

    /// Up to `n` most recent history entries, oldest first
    pub fn recent_history(&self, n: usize) -> Vec<DetectionHistoryEntry> {
        self.history.recent(n)
    }

    /// Forget templates and history
    pub fn reset_learning(&self) {
        self.templates.clear();
        self.history.clear();
        tracing::info!("Adaptive detector learning state cleared");
    }

    pub fn statistics(&self) -> AdaptiveStatistics {
        let config = self.config.snapshot();
        let averages = self.history.averages(config.history_window as usize);
        AdaptiveStatistics {
            total_detections: self.total_detections.load(Ordering::Relaxed),
            fallback_detections: self.fallback_detections.load(Ordering::Relaxed),
            template_count: self.templates.len(),
            history_len: self.history.len(),
            average_processing_ms: averages.map(|(ms, _)| ms),
            average_region_count: averages.map(|(_, n)| n),
            sensitivity: config.sensitivity,
            min_region_area: config.min_region_area,
        }
    }

    /// Retune from the recent history window
    ///
    /// Lowers sensitivity when calls are slow and lowers the minimum region
    /// area when few regions are found. Returns whether anything changed.
    pub fn adapt_parameters(&self) -> bool {
        let window = self.config.snapshot().history_window as usize;
        let Some((avg_ms, avg_regions)) = self.history.averages(window) else {
            return false;
        };

        self.config.update(|config| {
            let mut changed = false;

            if avg_ms > config.slow_processing_ms && config.sensitivity > MIN_SENSITIVITY {
                let next = (config.sensitivity - SENSITIVITY_STEP).max(MIN_SENSITIVITY);
                tracing::info!(
                    "Adaptive: avg {:.0}ms > {:.0}ms, sensitivity {:.2} -> {:.2}",
                    avg_ms,
                    config.slow_processing_ms,
                    config.sensitivity,
                    next
                );
                config.sensitivity = next;
                changed = true;
            }

            if avg_regions < config.low_region_count && config.min_region_area > MIN_REGION_AREA_FLOOR
            {
                let next = ((config.min_region_area as f64 * REGION_AREA_FACTOR).round() as u32)
                    .max(MIN_REGION_AREA_FLOOR);
                tracing::info!(
                    "Adaptive: avg {:.1} regions < {:.1}, min_region_area {} -> {}",
                    avg_regions,
                    config.low_region_count,
                    config.min_region_area,
                    next
                );
                config.min_region_area = next;
                changed = true;
            }

            changed
        })
    }

    /// Start the periodic retuning task
    ///
    /// The task holds a weak reference and stops on its own once the detector
    /// is dropped; dropping the returned handle stops it earlier.
    pub fn start_adaptation(self: &Arc<Self>) -> std::io::Result<BackgroundTask> {
        let interval = Duration::from_secs(self.config.snapshot().adaptation_interval_secs as u64);
        tracing::info!("Starting adaptive retuning every {:?}", interval);
        BackgroundTask::spawn("adaptive-tuning", interval, self, |detector: &AdaptiveDetector| {
            detector.adapt_parameters();
        })
    }

    fn template_phase(&self, width: u32, height: u32) -> Vec<TextRegion> {
        if self.templates.is_empty() {
            return Vec::new();
        }
        self.templates
            .compatible(width, height)
            .into_iter()
            .filter_map(|t| {
                let bounds = t.instantiate(width, height)?;
                Some(
                    TextRegion::new(bounds, t.success_rate(), TEMPLATE_METHOD)
                        .with_type(RegionType::Template)
                        .with_metadata(META_TEMPLATE_KEY, t.key.clone()),
                )
            })
            .collect()
    }

    fn proposal_phase(
        &self,
        image: &RgbaImage,
        config: &AdaptiveConfig,
        cancel: &CancellationToken,
    ) -> Result<ProposalOutcome, DetectionError> {
        let (width, height) = image.dimensions();
        let mut regions = Vec::new();
        let mut raw_count = 0;

        match self.proposals.as_ref().filter(|s| s.is_available()) {
            Some(service) => {
                let input = service.input_format().convert(image);
                cancel.check()?;

                let batch = service.propose(&input).map_err(DetectionError::Proposal)?;
                let restored = batch.restore(width, height);
                raw_count = restored.len();

                let min_confidence = 1.0 - config.sensitivity;
                regions = restored
                    .into_iter()
                    .filter(|p| p.confidence >= min_confidence)
                    .filter(|p| p.bounds.area() >= config.min_region_area as i64)
                    .filter(|p| {
                        let aspect = p.bounds.aspect_ratio();
                        aspect >= config.min_aspect_ratio && aspect <= config.max_aspect_ratio
                    })
                    .map(|p| {
                        TextRegion::new(p.bounds, p.confidence, Self::NAME)
                            .with_type(RegionType::classify(&p.bounds))
                    })
                    .collect();
                regions = merge_overlapping(regions, config.overlap_threshold);
                regions.truncate(config.max_regions as usize);

                tracing::debug!(
                    "Adaptive: {} proposals from {} -> {} regions",
                    raw_count,
                    service.name(),
                    regions.len()
                );
            }
            None => tracing::debug!("Adaptive: no proposal service available"),
        }

        let mut used_fallback = false;
        if regions.is_empty() && config.fallback_to_full_image {
            if let Some(region) = fallback_region(width, height, config) {
                regions.push(region);
                used_fallback = true;
            }
        }

        Ok(ProposalOutcome {
            regions,
            raw_count,
            used_fallback,
        })
    }

    fn run(
        &self,
        image: &RgbaImage,
        cancel: &CancellationToken,
    ) -> Result<Vec<TextRegion>, DetectionError> {
        validate_image(image)?;
        cancel.check()?;

        let started = Instant::now();
        let config = self.config.snapshot();
        let (width, height) = image.dimensions();

        // Phase 1: templates
        let template_regions = self.template_phase(width, height);
        let template_count = template_regions.len();
        cancel.check()?;

        // Phase 2: proposals
        let proposals = self.proposal_phase(image, &config, cancel)?;
        cancel.check()?;

        // A template succeeds only when a real proposal lands on it
        let instantiated: HashMap<String, bool> = template_regions
            .iter()
            .filter_map(|t| {
                let key = t.metadata_str(META_TEMPLATE_KEY)?;
                let corroborated = proposals.regions.iter().any(|p| {
                    p.detection_method != FALLBACK_METHOD
                        && p.bounds.iou(&t.bounds) >= config.overlap_threshold
                });
                Some((key.to_string(), corroborated))
            })
            .collect();

        // Phase 3: history weighting
        let mut candidates = template_regions;
        candidates.extend(proposals.regions);
        let mut regions = merge_overlapping(candidates, config.overlap_threshold);

        let patterns = self.history.patterns(config.history_window as usize);
        for region in &mut regions {
            let score = history_match_score(&region.bounds, width, height, &patterns);
            region.set_confidence(region.confidence() * score);
        }
        regions.retain(|r| r.confidence() >= config.min_confidence);
        sort_by_confidence(&mut regions);
        regions.truncate(config.max_regions as usize);

        let outcome = self.templates.update(
            &regions,
            &instantiated,
            width,
            height,
            UpdatePolicy {
                confidence_threshold: config.template_confidence_threshold,
                min_success_rate: config.template_min_success_rate,
                max_templates: config.max_templates as usize,
            },
            |r| r.detection_method != FALLBACK_METHOD,
        );

        let elapsed = started.elapsed();
        let mut entry = DetectionHistoryEntry::new(
            width,
            height,
            regions.iter().map(|r| r.bounds).collect(),
        );
        entry.processing_time = elapsed;
        entry.template_count = template_count;
        entry.proposal_count = proposals.raw_count;
        entry.used_fallback = proposals.used_fallback;
        self.history.push(entry, config.history_capacity as usize);

        self.total_detections.fetch_add(1, Ordering::Relaxed);
        if proposals.used_fallback {
            self.fallback_detections.fetch_add(1, Ordering::Relaxed);
        }

        tracing::debug!(
            "Adaptive: {} templates, {} proposals -> {} regions in {:?} (templates +{} ~{} -{} x{})",
            template_count,
            proposals.raw_count,
            regions.len(),
            elapsed,
            outcome.created,
            outcome.reinforced,
            outcome.missed,
            outcome.evicted
        );

        Ok(regions)
    }
}

/// Whole-frame region, or `None` when the frame fails size/aspect validation
fn fallback_region(width: u32, height: u32, config: &AdaptiveConfig) -> Option<TextRegion> {
    if width < config.min_fallback_size || height < config.min_fallback_size {
        return None;
    }
    let bounds = Rect::from_dimensions(width, height);
    let aspect = bounds.aspect_ratio();
    if aspect < config.min_aspect_ratio || aspect > config.max_aspect_ratio {
        return None;
    }
    Some(TextRegion::new(bounds, config.fallback_confidence, FALLBACK_METHOD))
}

impl TextDetector for AdaptiveDetector {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn description(&self) -> &str {
        "Template, proposal and history driven detector that adapts to recurring layouts"
    }

    fn method(&self) -> DetectionMethod {
        DetectionMethod::Adaptive
    }

    /// Never fails except on cancellation; other errors yield no regions
    fn detect(
        &self,
        image: &RgbaImage,
        cancel: &CancellationToken,
    ) -> Result<Vec<TextRegion>, DetectionError> {
        match self.run(image, cancel) {
            Err(DetectionError::Cancelled) => Err(DetectionError::Cancelled),
            Err(e) => {
                tracing::warn!("Adaptive detection failed: {:?}", e);
                Ok(Vec::new())
            }
            ok => ok,
        }
    }

    fn get_parameter(&self, name: &str) -> Option<ParamValue> {
        self.config.get(name)
    }

    fn set_parameter(&self, name: &str, value: ParamValue) -> Result<(), ParameterError> {
        self.config.set(name, value)
    }

    fn parameters(&self) -> BTreeMap<String, ParamValue> {
        self.config.to_map()
    }

    fn apply_parameters(&self, values: &BTreeMap<String, ParamValue>) -> Result<(), ParameterError> {
        self.config.apply_map(values)
    }

    fn export_profile(&self) -> DetectorProfile {
        DetectorProfile::new(Self::NAME, self.parameters()).with_templates(self.templates())
    }

    fn import_profile(&self, profile: &DetectorProfile) -> Result<(), ProfileError> {
        profile.ensure_detector(Self::NAME)?;
        self.apply_parameters(&profile.parameters)?;
        self.templates.replace_all(profile.templates.clone());
        tracing::info!(
            "Adaptive: imported {} parameters, {} templates",
            profile.parameters.len(),
            profile.templates.len()
        );
        Ok(())
    }
}
