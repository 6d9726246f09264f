/// MSER detector implementation
///
/// Finds maximally stable extremal regions, keeps the text-shaped ones and
/// merges overlapping hits.
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use image::{GrayImage, RgbaImage};

use super::{band_score, validate_image, DetectionMethod, TextDetector};
use crate::aggregator::merge_overlapping;
use crate::cancel::CancellationToken;
use crate::config::MserConfig;
use crate::error::{DetectionError, ParameterError};
use crate::params::{ParamValue, SharedConfig};
use crate::primitives::{Blob, BlobParams, ImagePrimitives, ImageprocPrimitives};
use crate::region::{sort_by_confidence, Rect, RegionType, TextRegion};

/// MSER-based detector
pub struct MserDetector {
    config: SharedConfig<MserConfig>,
    primitives: Arc<dyn ImagePrimitives>,
}

impl MserDetector {
    pub const NAME: &'static str = "Mser";

    /// Create a detector over the given primitive backend
    pub fn new(config: MserConfig, primitives: Arc<dyn ImagePrimitives>) -> Self {
        Self {
            config: SharedConfig::new(config),
            primitives,
        }
    }

    /// Default config on the `imageproc` backend
    pub fn with_defaults() -> Self {
        Self::new(MserConfig::default(), Arc::new(ImageprocPrimitives::new()))
    }

    /// Current config snapshot
    pub fn config(&self) -> MserConfig {
        self.config.snapshot()
    }

    /// Turn raw blobs into scored, classified regions
    fn regions_from_blobs(
        &self,
        blobs: Vec<Blob>,
        gray: &GrayImage,
        config: &MserConfig,
    ) -> Vec<TextRegion> {
        blobs
            .into_iter()
            .filter_map(|blob| {
                let bounds = blob.bounds.clip_to(gray.width(), gray.height())?;
                if !passes_shape_filter(&bounds, config) {
                    return None;
                }
                let confidence = score_blob(&blob, &bounds, gray);
                Some(
                    TextRegion::new(bounds, confidence, Self::NAME)
                        .with_type(RegionType::classify(&bounds))
                        .with_contour(blob.contour),
                )
            })
            .collect()
    }
}

impl TextDetector for MserDetector {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn description(&self) -> &str {
        "Maximally stable extremal regions filtered by shape and contrast"
    }

    fn method(&self) -> DetectionMethod {
        DetectionMethod::Mser
    }

    fn detect(
        &self,
        image: &RgbaImage,
        cancel: &CancellationToken,
    ) -> Result<Vec<TextRegion>, DetectionError> {
        validate_image(image)?;
        cancel.check()?;

        let started = Instant::now();
        let config = self.config.snapshot();
        let gray = image::imageops::grayscale(image);

        let params = BlobParams {
            delta: config.delta.min(u8::MAX as u32) as u8,
            min_area: config.min_area,
            max_area: config.max_area,
            max_variation: config.max_variation,
        };
        let blobs = self
            .primitives
            .extract_blobs(&gray, &params)
            .map_err(DetectionError::Primitive)?;
        let blob_count = blobs.len();

        cancel.check()?;

        let mut regions = self.regions_from_blobs(blobs, &gray, &config);
        if config.merge_regions {
            regions = merge_overlapping(regions, config.overlap_threshold);
        } else {
            sort_by_confidence(&mut regions);
        }

        tracing::debug!(
            "MSER: {} blobs -> {} regions in {:?}",
            blob_count,
            regions.len(),
            started.elapsed()
        );
        Ok(regions)
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
}

fn passes_shape_filter(bounds: &Rect, config: &MserConfig) -> bool {
    if bounds.width < config.min_width as i32 || bounds.height < config.min_height as i32 {
        return false;
    }
    let aspect = bounds.aspect_ratio();
    aspect >= config.min_aspect_ratio && aspect <= config.max_aspect_ratio
}

/// Confidence from area, aspect, contour complexity and contrast
fn score_blob(blob: &Blob, bounds: &Rect, gray: &GrayImage) -> f64 {
    let area_score = band_score(bounds.area() as f64, 200.0, 8000.0);
    let aspect_score = band_score(bounds.aspect_ratio(), 1.0, 10.0);

    let perimeter = 2.0 * (bounds.width + bounds.height) as f64;
    let complexity_score = if blob.contour.is_empty() || perimeter <= 0.0 {
        0.5
    } else {
        band_score(blob.contour.len() as f64 / perimeter, 0.8, 3.0)
    };

    let contrast_score = (contrast(gray, bounds) / 64.0).min(1.0);

    0.3 * area_score + 0.3 * aspect_score + 0.2 * complexity_score + 0.2 * contrast_score
}

/// Standard deviation of the grey levels inside `bounds`
fn contrast(gray: &GrayImage, bounds: &Rect) -> f64 {
    let mut sum = 0.0;
    let mut sum_sq = 0.0;
    let mut n = 0.0;
    for y in bounds.y..bounds.bottom() {
        for x in bounds.x..bounds.right() {
            let v = gray.get_pixel(x as u32, y as u32)[0] as f64;
            sum += v;
            sum_sq += v * v;
            n += 1.0;
        }
    }
    if n == 0.0 {
        return 0.0;
    }
    let mean = sum / n;
    (sum_sq / n - mean * mean).max(0.0).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::{Component, StrokeParams, StrokeWidthMap};
    use image::Rgba;

    /// Returns a fixed blob list
    struct FixedBlobs(Vec<Rect>);

    impl ImagePrimitives for FixedBlobs {
        fn extract_blobs(&self, _gray: &GrayImage, _p: &BlobParams) -> anyhow::Result<Vec<Blob>> {
            Ok(self
                .0
                .iter()
                .map(|r| Blob {
                    bounds: *r,
                    area: r.area() as u32,
                    contour: Vec::new(),
                })
                .collect())
        }

        fn detect_edges(&self, gray: &GrayImage, _l: f32, _h: f32) -> anyhow::Result<GrayImage> {
            Ok(gray.clone())
        }

        fn stroke_width_transform(
            &self,
            gray: &GrayImage,
            _edges: &GrayImage,
            _p: &StrokeParams,
        ) -> anyhow::Result<StrokeWidthMap> {
            Ok(StrokeWidthMap::new(gray.width(), gray.height()))
        }

        fn connected_components(&self, _s: &StrokeWidthMap) -> anyhow::Result<Vec<Component>> {
            Ok(Vec::new())
        }
    }

    struct Broken;

    impl ImagePrimitives for Broken {
        fn extract_blobs(&self, _g: &GrayImage, _p: &BlobParams) -> anyhow::Result<Vec<Blob>> {
            anyhow::bail!("backend exploded")
        }

        fn detect_edges(&self, _g: &GrayImage, _l: f32, _h: f32) -> anyhow::Result<GrayImage> {
            anyhow::bail!("backend exploded")
        }

        fn stroke_width_transform(
            &self,
            _g: &GrayImage,
            _e: &GrayImage,
            _p: &StrokeParams,
        ) -> anyhow::Result<StrokeWidthMap> {
            anyhow::bail!("backend exploded")
        }

        fn connected_components(&self, _s: &StrokeWidthMap) -> anyhow::Result<Vec<Component>> {
            anyhow::bail!("backend exploded")
        }
    }

    fn striped_frame() -> RgbaImage {
        RgbaImage::from_fn(200, 100, |x, _| {
            if x % 4 < 2 {
                Rgba([0, 0, 0, 255])
            } else {
                Rgba([255, 255, 255, 255])
            }
        })
    }

    fn detector(rects: Vec<Rect>) -> MserDetector {
        MserDetector::new(MserConfig::default(), Arc::new(FixedBlobs(rects)))
    }

    #[test]
    fn test_overlapping_blobs_merge_to_union() {
        let a = Rect::new(10, 10, 100, 30);
        let b = Rect::new(15, 12, 100, 30);
        let frame = striped_frame();
        let cancel = CancellationToken::new();

        let d = detector(vec![a, b]);
        d.set_parameter("merge_regions", ParamValue::Bool(false))
            .unwrap();
        let separate = d.detect(&frame, &cancel).unwrap();
        assert_eq!(separate.len(), 2);
        let max_conf = separate
            .iter()
            .map(|r| r.confidence())
            .fold(0.0_f64, f64::max);

        d.set_parameter("merge_regions", ParamValue::Bool(true))
            .unwrap();
        let merged = d.detect(&frame, &cancel).unwrap();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].bounds, Rect::new(10, 10, 105, 32));
        assert!((merged[0].confidence() - max_conf).abs() < 1e-12);
    }

    #[test]
    fn test_shape_filter_drops_small_and_extreme() {
        let d = detector(vec![
            Rect::new(0, 0, 5, 5),    // too small
            Rect::new(0, 50, 190, 8), // aspect 23.75
            Rect::new(20, 20, 60, 20),
        ]);
        let regions = d
            .detect(&striped_frame(), &CancellationToken::new())
            .unwrap();
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].bounds, Rect::new(20, 20, 60, 20));
        assert_eq!(regions[0].detection_method, "Mser");
    }

    #[test]
    fn test_confidence_in_unit_range() {
        let d = detector(vec![Rect::new(0, 0, 40, 20), Rect::new(100, 50, 90, 40)]);
        for r in d
            .detect(&striped_frame(), &CancellationToken::new())
            .unwrap()
        {
            assert!((0.0..=1.0).contains(&r.confidence()));
        }
    }

    #[test]
    fn test_cancelled_before_start() {
        let d = detector(vec![Rect::new(0, 0, 40, 20)]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = d.detect(&striped_frame(), &cancel).unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_primitive_failure_is_error() {
        let d = MserDetector::new(MserConfig::default(), Arc::new(Broken));
        let err = d
            .detect(&striped_frame(), &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, DetectionError::Primitive(_)));
    }

    #[test]
    fn test_parameters_roundtrip() {
        let d = MserDetector::with_defaults();
        d.set_parameter("delta", ParamValue::Int(8)).unwrap();
        assert_eq!(d.get_parameter("delta"), Some(ParamValue::Int(8)));
        assert!(d.set_parameter("nope", ParamValue::Int(1)).is_err());
        assert_eq!(d.parameters().get("delta"), Some(&ParamValue::Int(8)));
    }
}
