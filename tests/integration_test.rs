// Integration tests for the text region engine
// These drive the public API end to end with synthetic frames

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use image::{DynamicImage, Rgba, RgbaImage};
use text_region_engine::{
    AdaptiveConfig, AdaptiveDetector, CancellationToken, DetectionError, DetectionMethod,
    DetectorManager, EngineConfig, EnsembleSettings, ImageprocPrimitives, ManagerConfig,
    MserDetector, ParamValue, ParameterError, ProfileStore, ProposalBatch, RawProposal, Rect,
    RegionAggregator, RegionProposalService, TextDetector, TextRegion,
};

/// Helper to create a simple test image
fn create_test_image(width: u32, height: u32, color: Rgba<u8>) -> RgbaImage {
    RgbaImage::from_pixel(width, height, color)
}

/// White frame with a row of dark "letters"
fn text_like_frame() -> RgbaImage {
    let mut img = create_test_image(320, 120, Rgba([255, 255, 255, 255]));
    for letter in 0..6 {
        let x0 = 40 + letter * 16;
        for y in 40..58 {
            for x in x0..x0 + 10 {
                img.put_pixel(x, y, Rgba([0, 0, 0, 255]));
            }
        }
    }
    img
}

/// Detector returning fixed rectangles, optionally failing
struct MockDetector {
    name: String,
    regions: Vec<(Rect, f64)>,
    fail: AtomicBool,
    calls: AtomicUsize,
}

impl MockDetector {
    fn new(name: &str, regions: Vec<(Rect, f64)>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            regions,
            fail: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        })
    }
}

impl TextDetector for MockDetector {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "mock"
    }

    fn method(&self) -> DetectionMethod {
        DetectionMethod::Custom
    }

    fn detect(
        &self,
        _image: &RgbaImage,
        cancel: &CancellationToken,
    ) -> Result<Vec<TextRegion>, DetectionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        cancel.check()?;
        if self.fail.load(Ordering::SeqCst) {
            return Err(DetectionError::Primitive(anyhow::anyhow!("mock failure")));
        }
        Ok(self
            .regions
            .iter()
            .map(|(r, c)| TextRegion::new(*r, *c, self.name.clone()))
            .collect())
    }

    fn get_parameter(&self, _name: &str) -> Option<ParamValue> {
        None
    }

    fn set_parameter(&self, name: &str, _value: ParamValue) -> Result<(), ParameterError> {
        Err(ParameterError::Unknown {
            name: name.to_string(),
        })
    }

    fn parameters(&self) -> BTreeMap<String, ParamValue> {
        BTreeMap::new()
    }

    fn apply_parameters(&self, _values: &BTreeMap<String, ParamValue>) -> Result<(), ParameterError> {
        Ok(())
    }
}

/// Proposal service that never finds anything
struct EmptyProposals;

impl RegionProposalService for EmptyProposals {
    fn name(&self) -> &str {
        "empty"
    }

    fn propose(&self, _image: &DynamicImage) -> anyhow::Result<ProposalBatch> {
        Ok(ProposalBatch::unscaled(Vec::new()))
    }
}

/// Proposal service running at half resolution
struct HalfScaleProposals;

impl RegionProposalService for HalfScaleProposals {
    fn name(&self) -> &str {
        "half-scale"
    }

    fn propose(&self, _image: &DynamicImage) -> anyhow::Result<ProposalBatch> {
        Ok(ProposalBatch {
            proposals: vec![RawProposal::new(Rect::new(100, 50, 200, 25), 0.95)],
            scale: 0.5,
        })
    }
}

#[test]
fn test_full_frame_fallback_scenario() {
    let manager = DetectorManager::with_defaults();
    manager.register(Arc::new(AdaptiveDetector::with_proposal_service(
        AdaptiveConfig::default(),
        Arc::new(EmptyProposals),
    )));

    let frame = create_test_image(1920, 1080, Rgba([30, 30, 30, 255]));
    let regions = manager
        .detect_optimal(&frame, &CancellationToken::new())
        .unwrap();

    assert_eq!(regions.len(), 1);
    assert_eq!(regions[0].bounds, Rect::new(0, 0, 1920, 1080));
    assert!((regions[0].confidence() - 0.8).abs() < 1e-12);
    assert_eq!(regions[0].detection_method, "FullScreenFallback");
}

#[test]
fn test_scaled_proposals_map_back_to_frame() {
    let detector = AdaptiveDetector::with_proposal_service(
        AdaptiveConfig::default(),
        Arc::new(HalfScaleProposals),
    );
    let frame = create_test_image(1280, 720, Rgba([255, 255, 255, 255]));
    let regions = detector.detect(&frame, &CancellationToken::new()).unwrap();

    assert_eq!(regions.len(), 1);
    assert_eq!(regions[0].bounds, Rect::new(200, 100, 400, 50));
}

#[test]
fn test_ensemble_consensus() {
    let manager = DetectorManager::with_defaults();
    manager.register(MockDetector::new(
        "A",
        vec![
            (Rect::new(10, 10, 100, 30), 0.9),
            (Rect::new(200, 60, 40, 20), 0.9), // only A sees this
        ],
    ));
    manager.register(MockDetector::new("B", vec![(Rect::new(12, 12, 100, 30), 0.6)]));
    manager.register(MockDetector::new("C", vec![(Rect::new(14, 8, 103, 33), 0.6)]));

    let frame = create_test_image(320, 120, Rgba([255, 255, 255, 255]));
    let regions = manager
        .detect_ensemble(
            &frame,
            &["A", "B", "C"],
            &EnsembleSettings::default(),
            &CancellationToken::new(),
        )
        .unwrap();

    assert_eq!(regions.len(), 1);
    assert_eq!(regions[0].bounds, Rect::new(12, 10, 101, 31));
    assert!((regions[0].confidence() - 0.7).abs() < 1e-9);
    assert_eq!(regions[0].detection_method, "Ensemble(3votes)");
}

#[test]
fn test_ensemble_isolates_failing_detector() {
    let manager = DetectorManager::with_defaults();
    let broken = MockDetector::new("Broken", vec![(Rect::new(10, 10, 100, 30), 0.9)]);
    broken.fail.store(true, Ordering::SeqCst);
    manager.register(broken);
    manager.register(MockDetector::new("A", vec![(Rect::new(10, 10, 100, 30), 0.8)]));
    manager.register(MockDetector::new("B", vec![(Rect::new(11, 10, 100, 30), 0.6)]));

    let frame = create_test_image(320, 120, Rgba([255, 255, 255, 255]));
    let regions = manager
        .detect_ensemble(
            &frame,
            &["Broken", "A", "B"],
            &manager.ensemble_settings(),
            &CancellationToken::new(),
        )
        .unwrap();

    assert_eq!(regions.len(), 1);
    assert_eq!(manager.metrics_for("Broken").unwrap().successful_executions, 0);
    assert_eq!(manager.metrics_for("A").unwrap().successful_executions, 1);
}

#[test]
fn test_fallback_is_attempted_exactly_once() {
    let manager = DetectorManager::with_defaults();
    let primary = MockDetector::new("Primary", vec![(Rect::new(0, 0, 10, 10), 0.9)]);
    let backup = MockDetector::new("Backup", vec![(Rect::new(0, 0, 10, 10), 0.9)]);
    manager.register(primary.clone());
    manager.register(backup.clone());

    let frame = create_test_image(100, 100, Rgba([255, 255, 255, 255]));
    let cancel = CancellationToken::new();

    // Build up a good track record for the backup
    for _ in 0..10 {
        manager.detect_with("Backup", &frame, &cancel).unwrap();
    }

    primary.fail.store(true, Ordering::SeqCst);
    backup.fail.store(true, Ordering::SeqCst);
    manager.set_forced_detector(Some("Primary".to_string()));

    let regions = manager.detect_optimal(&frame, &cancel).unwrap();
    assert!(regions.is_empty());
    assert_eq!(primary.calls.load(Ordering::SeqCst), 1);
    assert_eq!(backup.calls.load(Ordering::SeqCst), 11);

    let backup_metrics = manager.metrics_for("Backup").unwrap();
    assert_eq!(backup_metrics.total_executions, 11);
    assert_eq!(backup_metrics.successful_executions, 10);
}

#[test]
fn test_cancellation_is_not_a_failure() {
    let manager = DetectorManager::with_defaults();
    let detector = MockDetector::new("A", vec![(Rect::new(0, 0, 10, 10), 0.9)]);
    manager.register(detector.clone());
    manager.register(MockDetector::new("B", vec![]));

    let frame = create_test_image(100, 100, Rgba([255, 255, 255, 255]));
    let cancel = CancellationToken::new();
    cancel.cancel();

    assert!(manager.detect_optimal(&frame, &cancel).is_err());
    assert!(manager
        .detect_ensemble(&frame, &["A", "B"], &EnsembleSettings::default(), &cancel)
        .is_err());

    let metrics = manager.metrics_for("A").unwrap();
    assert_eq!(metrics.total_executions, 0);
}

#[test]
fn test_tracking_across_frames() {
    let config = ManagerConfig {
        enable_tracking: true,
        forced_detector: Some("A".to_string()),
        ..ManagerConfig::default()
    };
    let manager = DetectorManager::new(config, RegionAggregator::default());
    manager.register(MockDetector::new("A", vec![(Rect::new(10, 10, 100, 30), 0.5)]));

    let frame = create_test_image(200, 100, Rgba([255, 255, 255, 255]));
    let cancel = CancellationToken::new();

    let first = manager.detect_optimal(&frame, &cancel).unwrap();
    assert_eq!(first[0].metadata_u64("tracking_frame_count"), Some(1));

    let second = manager.detect_optimal(&frame, &cancel).unwrap();
    assert_eq!(second[0].metadata_u64("tracking_frame_count"), Some(2));
    assert!((second[0].confidence() - 0.5).abs() < 1e-9);
}

#[test]
fn test_tracking_follows_only_optimal_stream() {
    let config = ManagerConfig {
        enable_tracking: true,
        forced_detector: Some("A".to_string()),
        ..ManagerConfig::default()
    };
    let manager = DetectorManager::new(config, RegionAggregator::default());
    manager.register(MockDetector::new("A", vec![(Rect::new(10, 10, 100, 30), 0.5)]));
    manager.register(MockDetector::new("B", vec![(Rect::new(12, 10, 100, 30), 0.7)]));

    let frame = create_test_image(200, 100, Rgba([255, 255, 255, 255]));
    let cancel = CancellationToken::new();

    let first = manager.detect_optimal(&frame, &cancel).unwrap();
    assert_eq!(first[0].metadata_u64("tracking_frame_count"), Some(1));

    // Side calls leave the tracker alone
    let single = manager.detect_with("B", &frame, &cancel).unwrap();
    assert_eq!(single[0].metadata_u64("tracking_frame_count"), None);
    let fused = manager
        .detect_ensemble(&frame, &["A", "B"], &EnsembleSettings::default(), &cancel)
        .unwrap();
    assert_eq!(fused.len(), 1);
    assert_eq!(fused[0].metadata_u64("tracking_frame_count"), None);

    let second = manager.detect_optimal(&frame, &cancel).unwrap();
    assert_eq!(second[0].metadata_u64("tracking_frame_count"), Some(2));
    assert!((second[0].confidence() - 0.5).abs() < 1e-9);
}

#[test]
fn test_profile_roundtrip_through_manager() {
    let dir = tempfile::tempdir().unwrap();
    let manager =
        DetectorManager::with_defaults().with_profile_store(ProfileStore::new(dir.path()));
    let mser = Arc::new(MserDetector::with_defaults());
    manager.register(mser.clone());

    mser.set_parameter("delta", ParamValue::Int(11)).unwrap();
    mser.set_parameter("merge_regions", ParamValue::Bool(false))
        .unwrap();
    assert!(manager.save_detector_profile("Mser", "dense-ui"));

    mser.set_parameter("delta", ParamValue::Int(3)).unwrap();
    assert!(manager.load_detector_profile("Mser", "dense-ui"));
    assert_eq!(mser.get_parameter("delta"), Some(ParamValue::Int(11)));
    assert_eq!(mser.get_parameter("merge_regions"), Some(ParamValue::Bool(false)));

    // Missing profile: nothing changes
    assert!(!manager.load_detector_profile("Mser", "missing"));
    assert_eq!(mser.get_parameter("delta"), Some(ParamValue::Int(11)));
}

#[test]
fn test_real_backend_confidences_are_bounded() {
    let config = EngineConfig::default();
    let (manager, _adaptive) =
        DetectorManager::from_config(&config, Arc::new(ImageprocPrimitives::new()), None);
    let frame = text_like_frame();
    let cancel = CancellationToken::new();

    let mser = manager.detect_with("Mser", &frame, &cancel).unwrap();
    assert!(!mser.is_empty());

    let swt = manager.detect_with("Swt", &frame, &cancel).unwrap();
    let adaptive = manager.detect_with("Adaptive", &frame, &cancel).unwrap();
    let ensemble = manager
        .detect_ensemble(
            &frame,
            &["Mser", "Swt", "Adaptive"],
            &manager.ensemble_settings(),
            &cancel,
        )
        .unwrap();

    for region in mser.iter().chain(&swt).chain(&adaptive).chain(&ensemble) {
        assert!((0.0..=1.0).contains(&region.confidence()));
        assert!(region.bounds.is_valid());
        assert!(region.bounds.right() <= frame.width() as i32);
        assert!(region.bounds.bottom() <= frame.height() as i32);
    }
}

#[test]
fn test_background_ranking_switches_best() {
    let config = ManagerConfig {
        rerank_interval_secs: 1,
        ..ManagerConfig::default()
    };
    let manager = Arc::new(DetectorManager::new(config, RegionAggregator::default()));
    manager.register(MockDetector::new("Fast", vec![(Rect::new(0, 0, 20, 10), 0.9)]));
    let frame = create_test_image(100, 100, Rgba([255, 255, 255, 255]));
    let cancel = CancellationToken::new();
    for _ in 0..6 {
        manager.detect_with("Fast", &frame, &cancel).unwrap();
    }

    let mut task = manager.start_ranking().unwrap();
    std::thread::sleep(Duration::from_millis(1500));
    task.stop();

    assert_eq!(manager.current_best_detector(), "Fast");
}
