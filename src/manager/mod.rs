//! Detector orchestration
//!
//! The manager owns the detector registry and their performance metrics. It
//! picks the best detector for single-shot detection, retries once on a
//! well-performing fallback, runs ensembles with vote fusion and periodically
//! re-ranks detectors from live metrics.
//!
//! Detector failures never leave the manager; they are logged, recorded and
//! turned into an empty result. Only cancellation is returned to the caller.

pub mod ensemble;
pub mod metrics;

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use image::RgbaImage;
use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use serde::Serialize;

use crate::aggregator::RegionAggregator;
use crate::background::BackgroundTask;
use crate::cancel::CancellationToken;
use crate::config::{EngineConfig, ManagerConfig};
use crate::detection::{AdaptiveDetector, MserDetector, SwtDetector, TextDetector};
use crate::error::{Cancelled, DetectionError};
use crate::params::ParamValue;
use crate::primitives::ImagePrimitives;
use crate::profile::ProfileStore;
use crate::proposal::RegionProposalService;
use crate::region::{sort_by_confidence, TextRegion};

pub use ensemble::{fuse_votes, EnsembleSettings, Vote, WeightingMode};
pub use metrics::{overall_score, DetectorMetrics, DetectorPerformanceMetrics};

/// One recorded detector run
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRecord {
    pub detector: String,
    /// Milliseconds since the Unix epoch
    pub timestamp_ms: u64,
    pub duration_ms: f64,
    pub region_count: usize,
    pub success: bool,
}

enum RunOutcome {
    Success(Vec<TextRegion>),
    Failed,
    Cancelled,
}

/// Registry, selection policy and fusion
pub struct DetectorManager {
    config: ManagerConfig,
    detectors: RwLock<HashMap<String, Arc<dyn TextDetector>>>,
    metrics: RwLock<HashMap<String, Arc<DetectorMetrics>>>,
    current_best: RwLock<String>,
    forced: RwLock<Option<String>>,
    aggregator: RegionAggregator,
    executions: Mutex<VecDeque<ExecutionRecord>>,
    profiles: Option<ProfileStore>,
}

impl DetectorManager {
    pub fn new(config: ManagerConfig, aggregator: RegionAggregator) -> Self {
        Self {
            current_best: RwLock::new(config.default_detector.clone()),
            forced: RwLock::new(config.forced_detector.clone()),
            config,
            detectors: RwLock::new(HashMap::new()),
            metrics: RwLock::new(HashMap::new()),
            aggregator,
            executions: Mutex::new(VecDeque::new()),
            profiles: None,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ManagerConfig::default(), RegionAggregator::default())
    }

    /// Manager with the MSER, SWT and adaptive detectors registered
    ///
    /// The adaptive detector is also returned so the caller can start its
    /// retuning task.
    pub fn from_config(
        config: &EngineConfig,
        primitives: Arc<dyn ImagePrimitives>,
        proposals: Option<Arc<dyn RegionProposalService>>,
    ) -> (Self, Arc<AdaptiveDetector>) {
        let manager = Self::new(
            config.manager.clone(),
            RegionAggregator::new(config.aggregator.clone()),
        );
        let adaptive = Arc::new(AdaptiveDetector::new(config.adaptive.clone(), proposals));

        manager.register(Arc::new(MserDetector::new(
            config.mser.clone(),
            primitives.clone(),
        )));
        manager.register(Arc::new(SwtDetector::new(config.swt.clone(), primitives)));
        manager.register(adaptive.clone());

        (manager, adaptive)
    }

    /// Attach a profile directory for `save_detector_profile` / `load_detector_profile`
    pub fn with_profile_store(mut self, store: ProfileStore) -> Self {
        self.profiles = Some(store);
        self
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn aggregator(&self) -> &RegionAggregator {
        &self.aggregator
    }

    /// Add or replace a detector; its metrics survive a replacement
    pub fn register(&self, detector: Arc<dyn TextDetector>) {
        let name = detector.name().to_string();
        let replaced = self
            .detectors
            .write()
            .insert(name.clone(), detector)
            .is_some();
        self.metrics
            .write()
            .entry(name.clone())
            .or_insert_with(|| Arc::new(DetectorMetrics::new()));

        if replaced {
            tracing::info!("Replaced detector {}", name);
        } else {
            tracing::info!("Registered detector {}", name);
        }
    }

    /// Remove a detector and its metrics
    pub fn unregister(&self, name: &str) -> bool {
        let removed = self.detectors.write().remove(name).is_some();
        if removed {
            self.metrics.write().remove(name);
            tracing::info!("Unregistered detector {}", name);
        }
        removed
    }

    /// Registered names, sorted
    pub fn detector_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.detectors.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn detector(&self, name: &str) -> Option<Arc<dyn TextDetector>> {
        self.detectors.read().get(name).cloned()
    }

    pub fn set_forced_detector(&self, name: Option<String>) {
        tracing::info!("Forced detector: {:?}", name);
        *self.forced.write() = name;
    }

    pub fn current_best_detector(&self) -> String {
        self.current_best.read().clone()
    }

    pub fn metrics_for(&self, name: &str) -> Option<DetectorPerformanceMetrics> {
        self.metrics.read().get(name).map(|m| m.snapshot(name))
    }

    /// Metrics of every detector, best overall score first
    pub fn performance_report(&self) -> Vec<DetectorPerformanceMetrics> {
        let mut report: Vec<DetectorPerformanceMetrics> = self
            .metrics
            .read()
            .iter()
            .map(|(name, m)| m.snapshot(name))
            .collect();
        report.sort_by(|a, b| {
            b.overall_score()
                .total_cmp(&a.overall_score())
                .then_with(|| a.detector.cmp(&b.detector))
        });
        report
    }

    /// Up to `n` most recent executions, oldest first
    pub fn recent_executions(&self, n: usize) -> Vec<ExecutionRecord> {
        let log = self.executions.lock();
        let skip = log.len().saturating_sub(n);
        log.iter().skip(skip).cloned().collect()
    }

    /// Detector to use for the next single-shot call
    ///
    /// A registered forced detector wins. Otherwise the best overall score
    /// among detectors with more than the minimum executions is used, and
    /// without any ranked detector the last known best.
    pub fn select_best_detector(&self) -> Option<String> {
        if let Some(forced) = self.forced.read().clone() {
            if self.detectors.read().contains_key(&forced) {
                return Some(forced);
            }
            tracing::warn!("Forced detector {} is not registered", forced);
        }

        let min = self.config.min_executions_for_ranking;
        if let Some((name, _)) = self.ranked(|total| total > min).into_iter().next() {
            return Some(name);
        }

        let current = self.current_best.read().clone();
        let detectors = self.detectors.read();
        if detectors.contains_key(&current) {
            return Some(current);
        }
        let mut names: Vec<&String> = detectors.keys().collect();
        names.sort();
        names.first().map(|s| s.to_string())
    }

    /// Detectors passing `eligible(total_executions)`, best score first
    fn ranked(&self, eligible: impl Fn(u64) -> bool) -> Vec<(String, f64)> {
        let registered = self.detectors.read();
        let mut ranked: Vec<(String, f64)> = self
            .metrics
            .read()
            .iter()
            .filter(|(name, _)| registered.contains_key(*name))
            .map(|(name, m)| m.snapshot(name))
            .filter(|s| eligible(s.total_executions))
            .map(|s| {
                let score = s.overall_score();
                (s.detector, score)
            })
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked
    }

    /// Run the selected detector, retrying once on a fallback when it fails
    pub fn detect_optimal(
        &self,
        image: &RgbaImage,
        cancel: &CancellationToken,
    ) -> Result<Vec<TextRegion>, Cancelled> {
        cancel.check()?;

        let Some(selected) = self.select_best_detector() else {
            tracing::warn!("No detectors registered");
            return Ok(Vec::new());
        };

        match self.execute(&selected, image, cancel) {
            RunOutcome::Success(regions) => Ok(self.finish_tracked(regions, image)),
            RunOutcome::Cancelled => Err(Cancelled),
            RunOutcome::Failed => {
                let Some(fallback) = self.fallback_candidate(&selected) else {
                    tracing::warn!("Detector {} failed and no fallback qualifies", selected);
                    return Ok(Vec::new());
                };
                tracing::info!("Detector {} failed, falling back to {}", selected, fallback);
                match self.execute(&fallback, image, cancel) {
                    RunOutcome::Success(regions) => Ok(self.finish_tracked(regions, image)),
                    RunOutcome::Cancelled => Err(Cancelled),
                    RunOutcome::Failed => {
                        tracing::error!("Fallback detector {} failed as well", fallback);
                        Ok(Vec::new())
                    }
                }
            }
        }
    }

    /// Run one named detector with metrics, without fallback
    pub fn detect_with(
        &self,
        name: &str,
        image: &RgbaImage,
        cancel: &CancellationToken,
    ) -> Result<Vec<TextRegion>, Cancelled> {
        cancel.check()?;
        match self.execute(name, image, cancel) {
            RunOutcome::Success(regions) => Ok(self.finish(regions, image)),
            RunOutcome::Cancelled => Err(Cancelled),
            RunOutcome::Failed => Ok(Vec::new()),
        }
    }

    /// Run detectors concurrently and fuse their outputs by vote
    pub fn detect_ensemble(
        &self,
        image: &RgbaImage,
        names: &[&str],
        settings: &EnsembleSettings,
        cancel: &CancellationToken,
    ) -> Result<Vec<TextRegion>, Cancelled> {
        cancel.check()?;
        let outputs = self.run_concurrently(image, names, cancel)?;

        let votes: Vec<Vote> = outputs
            .into_iter()
            .flat_map(|(name, regions)| {
                let weight = match settings.weighting {
                    WeightingMode::Uniform => 1.0,
                    WeightingMode::PerformanceWeighted => self
                        .metrics_for(&name)
                        .map(|m| m.success_rate())
                        .unwrap_or(0.0),
                };
                regions
                    .into_iter()
                    .map(move |region| Vote::new(name.clone(), region, weight))
                    .collect::<Vec<_>>()
            })
            .collect();

        let vote_count = votes.len();
        let fused = fuse_votes(votes, settings);
        tracing::debug!(
            "Ensemble over {:?}: {} votes -> {} consensus regions",
            names,
            vote_count,
            fused.len()
        );
        Ok(self.finish(fused, image))
    }

    /// Run detectors concurrently, pool their outputs and merge/score them
    ///
    /// Unlike the ensemble vote, every region survives; overlapping ones are
    /// merged with the max-confidence rule (method tags like `"Mser+Swt"`).
    pub fn detect_merged(
        &self,
        image: &RgbaImage,
        names: &[&str],
        cancel: &CancellationToken,
    ) -> Result<Vec<TextRegion>, Cancelled> {
        cancel.check()?;
        let outputs = self.run_concurrently(image, names, cancel)?;
        let merged = self
            .aggregator
            .merge_detector_outputs(outputs.into_iter().map(|(_, r)| r).collect());
        let scored = self.aggregator.score_regions(merged);
        Ok(self.finish(scored, image))
    }

    /// Ensemble settings for the current registry
    ///
    /// Uses the configured threshold and weighting with a simple majority of
    /// registered detectors as the vote requirement.
    pub fn ensemble_settings(&self) -> EnsembleSettings {
        let count = self.detectors.read().len();
        EnsembleSettings {
            min_votes: count.div_ceil(2).max(1),
            ..self.config.ensemble.clone()
        }
    }

    /// Re-evaluate rankings and switch the current best detector
    ///
    /// Returns the new best when it changed. The execution log is pruned on
    /// the same pass.
    pub fn rerank_detectors(&self) -> Option<String> {
        let min = self.config.min_executions_for_ranking;
        let ranked = self.ranked(|total| total >= min);

        let mut switched = None;
        if let Some((best, score)) = ranked.first() {
            let mut current = self.current_best.write();
            if *current != *best {
                tracing::info!(
                    "Detector ranking changed: {} -> {} (score {:.3})",
                    current,
                    best,
                    score
                );
                *current = best.clone();
                switched = Some(best.clone());
            }
        }

        let mut log = self.executions.lock();
        while log.len() > self.config.ranking_log_capacity {
            log.pop_front();
        }

        switched
    }

    /// Start periodic re-ranking on a background thread
    pub fn start_ranking(self: &Arc<Self>) -> std::io::Result<BackgroundTask> {
        let interval = Duration::from_secs(self.config.rerank_interval_secs.max(1));
        tracing::info!("Starting detector re-ranking every {:?}", interval);
        BackgroundTask::spawn("detector-ranking", interval, self, |manager: &DetectorManager| {
            manager.rerank_detectors();
        })
    }

    /// Apply each parameter to the named detector
    ///
    /// Failures are logged and skipped. Returns how many parameters were
    /// applied.
    pub fn tune_detector_parameters(
        &self,
        name: &str,
        params: &BTreeMap<String, ParamValue>,
    ) -> usize {
        let Some(detector) = self.detector(name) else {
            tracing::warn!("Cannot tune unknown detector {}", name);
            return 0;
        };

        let mut applied = 0;
        for (key, value) in params {
            match detector.set_parameter(key, *value) {
                Ok(()) => {
                    tracing::debug!("{}: {} = {}", name, key, value);
                    applied += 1;
                }
                Err(e) => tracing::warn!("{}: failed to set {}: {}", name, key, e),
            }
        }
        applied
    }

    /// Save a detector's profile under `profile_name`
    pub fn save_detector_profile(&self, detector_name: &str, profile_name: &str) -> bool {
        let Some(store) = &self.profiles else {
            tracing::warn!("No profile store configured");
            return false;
        };
        let Some(detector) = self.detector(detector_name) else {
            tracing::warn!("Cannot save profile for unknown detector {}", detector_name);
            return false;
        };
        match store.save(profile_name, &detector.export_profile()) {
            Ok(_) => true,
            Err(e) => {
                tracing::error!("Failed to save profile '{}': {}", profile_name, e);
                false
            }
        }
    }

    /// Load `profile_name` into a detector; state is unchanged on failure
    pub fn load_detector_profile(&self, detector_name: &str, profile_name: &str) -> bool {
        let Some(store) = &self.profiles else {
            tracing::warn!("No profile store configured");
            return false;
        };
        let Some(detector) = self.detector(detector_name) else {
            tracing::warn!("Cannot load profile for unknown detector {}", detector_name);
            return false;
        };
        let result = store
            .load(profile_name)
            .and_then(|profile| detector.import_profile(&profile));
        match result {
            Ok(()) => {
                tracing::info!("Loaded profile '{}' into {}", profile_name, detector_name);
                true
            }
            Err(e) => {
                tracing::error!("Failed to load profile '{}': {}", profile_name, e);
                false
            }
        }
    }

    /// Execute registered detectors in parallel; failed ones contribute nothing
    fn run_concurrently(
        &self,
        image: &RgbaImage,
        names: &[&str],
        cancel: &CancellationToken,
    ) -> Result<Vec<(String, Vec<TextRegion>)>, Cancelled> {
        let mut seen = HashSet::new();
        let selected: Vec<&str> = names
            .iter()
            .copied()
            .filter(|n| seen.insert(*n))
            .filter(|n| {
                let known = self.detectors.read().contains_key(*n);
                if !known {
                    tracing::warn!("Ensemble skips unknown detector {}", n);
                }
                known
            })
            .collect();

        let outcomes: Vec<(String, RunOutcome)> = selected
            .par_iter()
            .map(|name| (name.to_string(), self.execute(name, image, cancel)))
            .collect();

        let mut outputs = Vec::with_capacity(outcomes.len());
        for (name, outcome) in outcomes {
            match outcome {
                RunOutcome::Success(regions) => outputs.push((name, regions)),
                RunOutcome::Failed => {}
                RunOutcome::Cancelled => return Err(Cancelled),
            }
        }
        Ok(outputs)
    }

    /// Run one detector, catching panics and recording metrics
    fn execute(&self, name: &str, image: &RgbaImage, cancel: &CancellationToken) -> RunOutcome {
        let Some(detector) = self.detector(name) else {
            tracing::warn!("Detector {} is not registered", name);
            return RunOutcome::Failed;
        };
        let metrics = self
            .metrics
            .write()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(DetectorMetrics::new()))
            .clone();

        let started = Instant::now();
        let result = panic::catch_unwind(AssertUnwindSafe(|| detector.detect(image, cancel)))
            .unwrap_or_else(|payload| Err(DetectionError::Panicked(panic_message(payload))));
        let elapsed = started.elapsed();

        match result {
            Ok(mut regions) => {
                regions.retain(|r| r.bounds.is_valid());
                metrics.record_success(elapsed, regions.len());
                self.log_execution(name, elapsed, regions.len(), true);
                tracing::debug!("{}: {} regions in {:?}", name, regions.len(), elapsed);
                RunOutcome::Success(regions)
            }
            Err(e) if e.is_cancelled() => {
                tracing::debug!("{} cancelled after {:?}", name, elapsed);
                RunOutcome::Cancelled
            }
            Err(e) => {
                metrics.record_failure(elapsed);
                self.log_execution(name, elapsed, 0, false);
                tracing::warn!("Detector {} failed after {:?}: {:?}", name, elapsed, e);
                RunOutcome::Failed
            }
        }
    }

    /// Best other detector with a success rate above the fallback floor
    fn fallback_candidate(&self, failed: &str) -> Option<String> {
        let registered = self.detectors.read();
        let floor = self.config.fallback_min_success_rate;
        self.metrics
            .read()
            .iter()
            .filter(|(name, _)| name.as_str() != failed && registered.contains_key(*name))
            .map(|(name, m)| (name.clone(), m.snapshot(name).success_rate()))
            .filter(|(_, rate)| *rate > floor)
            .max_by(|a, b| a.1.total_cmp(&b.1).then_with(|| b.0.cmp(&a.0)))
            .map(|(name, _)| name)
    }

    /// `finish` plus temporal tracking
    ///
    /// Only the `detect_optimal` stream feeds the tracker, so ensemble and
    /// one-off calls never become another stream's previous frame.
    fn finish_tracked(&self, regions: Vec<TextRegion>, image: &RgbaImage) -> Vec<TextRegion> {
        let regions = if self.config.enable_tracking {
            self.aggregator.track_regions(regions)
        } else {
            regions
        };
        self.finish(regions, image)
    }

    /// Optional crops, then final ordering
    fn finish(&self, regions: Vec<TextRegion>, image: &RgbaImage) -> Vec<TextRegion> {
        let mut regions = regions;
        if self.config.attach_crops {
            for region in &mut regions {
                region.attach_crop(image);
            }
        }
        sort_by_confidence(&mut regions);
        regions
    }

    fn log_execution(&self, name: &str, elapsed: Duration, region_count: usize, success: bool) {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let mut log = self.executions.lock();
        log.push_back(ExecutionRecord {
            detector: name.to_string(),
            timestamp_ms,
            duration_ms: elapsed.as_secs_f64() * 1000.0,
            region_count,
            success,
        });
        // Hard cap between re-ranking passes
        while log.len() > self.config.ranking_log_capacity.saturating_mul(2).max(1) {
            log.pop_front();
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
