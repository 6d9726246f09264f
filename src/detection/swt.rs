/// Stroke width transform detector
///
/// Text strokes have near-constant width. Components whose stroke widths vary
/// too much are rejected; the rest are optionally chained into words.
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use image::RgbaImage;

use super::{band_score, validate_image, DetectionMethod, TextDetector};
use crate::aggregator::merge_overlapping;
use crate::cancel::CancellationToken;
use crate::config::SwtConfig;
use crate::error::{DetectionError, ParameterError};
use crate::params::{ParamValue, SharedConfig};
use crate::primitives::{Component, ImagePrimitives, ImageprocPrimitives, StrokeParams, StrokeWidthMap};
use crate::region::{sort_by_confidence, Rect, RegionType, TextRegion, META_STROKE_WIDTH};

/// Stroke-consistent component surviving the filters
#[derive(Debug, Clone)]
struct StrokeCandidate {
    bounds: Rect,
    mean_stroke: f64,
    /// 1.0 for perfectly uniform strokes, 0.0 at the variance limit
    consistency: f64,
}

/// SWT-based detector
pub struct SwtDetector {
    config: SharedConfig<SwtConfig>,
    primitives: Arc<dyn ImagePrimitives>,
}

impl SwtDetector {
    pub const NAME: &'static str = "Swt";

    pub fn new(config: SwtConfig, primitives: Arc<dyn ImagePrimitives>) -> Self {
        Self {
            config: SharedConfig::new(config),
            primitives,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(SwtConfig::default(), Arc::new(ImageprocPrimitives::new()))
    }

    pub fn config(&self) -> SwtConfig {
        self.config.snapshot()
    }
}

impl TextDetector for SwtDetector {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn description(&self) -> &str {
        "Stroke width transform with stroke-consistency filtering and word grouping"
    }

    fn method(&self) -> DetectionMethod {
        DetectionMethod::Swt
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

        let edges = self
            .primitives
            .detect_edges(&gray, config.canny_low as f32, config.canny_high as f32)
            .map_err(DetectionError::Primitive)?;
        cancel.check()?;

        let params = StrokeParams {
            dark_on_light: config.dark_on_light,
            max_stroke_width: config.max_stroke_width,
        };
        let strokes = self
            .primitives
            .stroke_width_transform(&gray, &edges, &params)
            .map_err(DetectionError::Primitive)?;
        cancel.check()?;

        let components = self
            .primitives
            .connected_components(&strokes)
            .map_err(DetectionError::Primitive)?;
        let component_count = components.len();

        let candidates: Vec<StrokeCandidate> = components
            .iter()
            .filter_map(|c| candidate_from_component(c, &strokes, &config))
            .collect();

        cancel.check()?;

        let mut regions = if config.group_components {
            group_candidates(&candidates, &config)
                .into_iter()
                .map(|members| region_from_group(&members))
                .collect()
        } else {
            candidates
                .iter()
                .map(|c| region_from_group(&[c]))
                .collect::<Vec<_>>()
        };

        regions = merge_overlapping(regions, config.overlap_threshold);
        sort_by_confidence(&mut regions);

        tracing::debug!(
            "SWT: {} components -> {} candidates -> {} regions in {:?}",
            component_count,
            candidates.len(),
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

/// Stroke statistics and shape filters for one component
fn candidate_from_component(
    component: &Component,
    strokes: &StrokeWidthMap,
    config: &SwtConfig,
) -> Option<StrokeCandidate> {
    if component.points.len() < config.min_component_area as usize {
        return None;
    }
    let bounds = component.bounds;
    if bounds.height < config.min_height as i32 {
        return None;
    }
    let aspect = bounds.aspect_ratio();
    if aspect < config.min_aspect_ratio || aspect > config.max_aspect_ratio {
        return None;
    }

    let widths: Vec<f64> = component
        .points
        .iter()
        .filter(|p| p.x >= 0 && p.y >= 0)
        .filter_map(|p| strokes.get_pixel_checked(p.x as u32, p.y as u32))
        .map(|px| px[0] as f64)
        .filter(|w| *w > 0.0)
        .collect();
    if widths.is_empty() {
        return None;
    }

    let n = widths.len() as f64;
    let mean = widths.iter().sum::<f64>() / n;
    let variance = widths.iter().map(|w| (w - mean).powi(2)).sum::<f64>() / n;
    let ratio = variance / mean;
    if ratio > config.max_variance_ratio {
        return None;
    }

    let consistency = if config.max_variance_ratio > 0.0 {
        1.0 - ratio / config.max_variance_ratio
    } else {
        1.0
    };

    Some(StrokeCandidate {
        bounds,
        mean_stroke: mean,
        consistency,
    })
}

/// Whether two candidates look like letters of the same word
fn compatible(a: &StrokeCandidate, b: &StrokeCandidate, config: &SwtConfig) -> bool {
    let stroke_ratio = a.mean_stroke.max(b.mean_stroke) / a.mean_stroke.min(b.mean_stroke);
    if stroke_ratio > config.stroke_ratio_threshold {
        return false;
    }

    let (ha, hb) = (a.bounds.height as f64, b.bounds.height as f64);
    if ha.max(hb) / ha.min(hb) > config.height_ratio_threshold {
        return false;
    }

    let max_height = ha.max(hb);
    if a.bounds.horizontal_gap(&b.bounds) as f64 > config.group_distance_factor * max_height {
        return false;
    }

    let (_, cy_a) = a.bounds.center();
    let (_, cy_b) = b.bounds.center();
    (cy_a - cy_b).abs() <= 0.5 * max_height
}

/// Union-find over pairwise compatible candidates
fn group_candidates<'a>(
    candidates: &'a [StrokeCandidate],
    config: &SwtConfig,
) -> Vec<Vec<&'a StrokeCandidate>> {
    let mut parent: Vec<usize> = (0..candidates.len()).collect();

    fn find(parent: &mut [usize], mut i: usize) -> usize {
        while parent[i] != i {
            parent[i] = parent[parent[i]];
            i = parent[i];
        }
        i
    }

    for i in 0..candidates.len() {
        for j in (i + 1)..candidates.len() {
            if compatible(&candidates[i], &candidates[j], config) {
                let (ri, rj) = (find(&mut parent, i), find(&mut parent, j));
                if ri != rj {
                    parent[rj] = ri;
                }
            }
        }
    }

    let mut groups: BTreeMap<usize, Vec<&StrokeCandidate>> = BTreeMap::new();
    for (i, candidate) in candidates.iter().enumerate() {
        let root = find(&mut parent, i);
        groups.entry(root).or_default().push(candidate);
    }
    groups.into_values().collect()
}

/// Composite region over a group of candidates
fn region_from_group(members: &[&StrokeCandidate]) -> TextRegion {
    let bounds = members
        .iter()
        .skip(1)
        .fold(members[0].bounds, |acc, c| acc.union(&c.bounds));
    let n = members.len() as f64;
    let consistency = members.iter().map(|c| c.consistency).sum::<f64>() / n;
    let stroke = members.iter().map(|c| c.mean_stroke).sum::<f64>() / n;

    // Saturates at three letters
    let grouping_score = (n / 3.0).min(1.0);
    let confidence = 0.5 * consistency
        + 0.3 * band_score(bounds.aspect_ratio(), 0.2, 10.0)
        + 0.2 * grouping_score;

    TextRegion::new(bounds, confidence, SwtDetector::NAME)
        .with_type(RegionType::classify(&bounds))
        .with_metadata(META_STROKE_WIDTH, stroke)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::{Blob, BlobParams};
    use crate::region::Point;
    use image::{GrayImage, Luma};

    /// Backend returning fixed components with a constant stroke map
    struct FixedComponents {
        components: Vec<(Rect, f32)>,
    }

    impl ImagePrimitives for FixedComponents {
        fn extract_blobs(&self, _g: &GrayImage, _p: &BlobParams) -> anyhow::Result<Vec<Blob>> {
            Ok(Vec::new())
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
            let mut map = StrokeWidthMap::new(gray.width(), gray.height());
            for (rect, width) in &self.components {
                for y in rect.y..rect.bottom() {
                    for x in rect.x..rect.right() {
                        map.put_pixel(x as u32, y as u32, Luma([*width]));
                    }
                }
            }
            Ok(map)
        }

        fn connected_components(&self, _s: &StrokeWidthMap) -> anyhow::Result<Vec<Component>> {
            Ok(self
                .components
                .iter()
                .map(|(rect, _)| {
                    let mut points = Vec::new();
                    for y in rect.y..rect.bottom() {
                        for x in rect.x..rect.right() {
                            points.push(Point::new(x, y));
                        }
                    }
                    Component {
                        bounds: *rect,
                        points,
                    }
                })
                .collect())
        }
    }

    fn detector(components: Vec<(Rect, f32)>) -> SwtDetector {
        SwtDetector::new(
            SwtConfig::default(),
            Arc::new(FixedComponents { components }),
        )
    }

    fn frame() -> RgbaImage {
        RgbaImage::new(300, 120)
    }

    #[test]
    fn test_letters_group_into_word() {
        let d = detector(vec![
            (Rect::new(10, 20, 12, 20), 3.0),
            (Rect::new(26, 20, 12, 20), 3.0),
            (Rect::new(42, 21, 12, 19), 3.0),
        ]);
        let regions = d.detect(&frame(), &CancellationToken::new()).unwrap();
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].bounds, Rect::new(10, 20, 44, 20));
        assert_eq!(regions[0].detection_method, "Swt");
        assert!(regions[0].metadata.contains_key(META_STROKE_WIDTH));
    }

    #[test]
    fn test_stroke_mismatch_prevents_grouping() {
        let d = detector(vec![
            (Rect::new(10, 20, 12, 20), 2.0),
            (Rect::new(26, 20, 12, 20), 9.0),
        ]);
        let regions = d.detect(&frame(), &CancellationToken::new()).unwrap();
        assert_eq!(regions.len(), 2);
    }

    #[test]
    fn test_distant_components_stay_separate() {
        let d = detector(vec![
            (Rect::new(10, 20, 12, 20), 3.0),
            (Rect::new(200, 20, 12, 20), 3.0),
        ]);
        let regions = d.detect(&frame(), &CancellationToken::new()).unwrap();
        assert_eq!(regions.len(), 2);
    }

    #[test]
    fn test_grouping_can_be_disabled() {
        let d = detector(vec![
            (Rect::new(10, 20, 12, 20), 3.0),
            (Rect::new(26, 20, 12, 20), 3.0),
        ]);
        d.set_parameter("group_components", ParamValue::Bool(false))
            .unwrap();
        let regions = d.detect(&frame(), &CancellationToken::new()).unwrap();
        assert_eq!(regions.len(), 2);
    }

    #[test]
    fn test_inconsistent_strokes_rejected() {
        let strokes = StrokeWidthMap::from_fn(20, 20, |x, _| Luma([if x < 10 { 1.0 } else { 12.0 }]));
        let points: Vec<Point> = (0..20)
            .flat_map(|y| (0..20).map(move |x| Point::new(x, y)))
            .collect();
        let component = Component {
            bounds: Rect::new(0, 0, 20, 20),
            points,
        };
        // mean 6.5, variance 30.25 -> ratio ~4.65
        assert!(candidate_from_component(&component, &strokes, &SwtConfig::default()).is_none());
    }

    #[test]
    fn test_cancelled() {
        let d = detector(vec![(Rect::new(10, 20, 12, 20), 3.0)]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(d.detect(&frame(), &cancel).unwrap_err().is_cancelled());
    }
}
