//! Region aggregation
//!
//! Merges duplicate detections, scores regions by text likelihood and keeps
//! region confidence stable across consecutive frames.
//!
//! The overlap merge here keeps the maximum confidence of the merged regions.
//! Ensemble consensus in the manager averages its votes instead; the two rules
//! are separate operations.

use parking_lot::Mutex;

use crate::config::AggregatorConfig;
use crate::region::{sort_by_confidence, TextRegion, META_TRACKING_FRAMES};

/// Merge every pair of regions whose IoU reaches `overlap_threshold`
///
/// Merged bounds are the rectangle union, merged confidence the maximum, and
/// contours are concatenated. Merging repeats until no pair qualifies, so
/// chains of overlapping regions collapse into one. Output is sorted by
/// descending confidence.
pub fn merge_overlapping(regions: Vec<TextRegion>, overlap_threshold: f64) -> Vec<TextRegion> {
    let mut current = regions;
    loop {
        let before = current.len();
        sort_by_confidence(&mut current);

        let mut merged: Vec<TextRegion> = Vec::with_capacity(current.len());
        for region in current {
            match merged
                .iter_mut()
                .find(|m| m.bounds.iou(&region.bounds) >= overlap_threshold)
            {
                Some(existing) => absorb(existing, region),
                None => merged.push(region),
            }
        }

        current = merged;
        if current.len() == before {
            break;
        }
    }
    sort_by_confidence(&mut current);
    current
}

/// Fold `other` into `target` using the max-confidence rule
fn absorb(target: &mut TextRegion, other: TextRegion) {
    target.bounds = target.bounds.union(&other.bounds);
    if other.confidence() > target.confidence() {
        target.set_confidence(other.confidence());
    }
    target.contour.extend(other.contour);

    let methods: Vec<&str> = target.detection_method.split('+').collect();
    let new_methods: Vec<String> = other
        .detection_method
        .split('+')
        .filter(|m| !methods.contains(m))
        .map(str::to_string)
        .collect();
    if !new_methods.is_empty() {
        target.detection_method = format!("{}+{}", target.detection_method, new_methods.join("+"));
    }

    for (key, value) in other.metadata {
        target.metadata.entry(key).or_insert(value);
    }
}

/// Merges, scores and tracks regions
pub struct RegionAggregator {
    config: AggregatorConfig,
    previous_frame: Mutex<Vec<TextRegion>>,
}

impl RegionAggregator {
    pub fn new(config: AggregatorConfig) -> Self {
        Self {
            config,
            previous_frame: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    /// Merge overlapping regions with the configured threshold
    pub fn merge(&self, regions: Vec<TextRegion>) -> Vec<TextRegion> {
        merge_overlapping(regions, self.config.overlap_threshold)
    }

    /// Pool several detectors' outputs and merge duplicates across them
    pub fn merge_detector_outputs(&self, outputs: Vec<Vec<TextRegion>>) -> Vec<TextRegion> {
        let pooled: Vec<TextRegion> = outputs.into_iter().flatten().collect();
        let count = pooled.len();
        let merged = self.merge(pooled);
        tracing::debug!("Merged {} pooled regions into {}", count, merged.len());
        merged
    }

    /// Rescore regions: 0.5 base + 0.3 text features + 0.2 spatial layout
    pub fn score_regions(&self, regions: Vec<TextRegion>) -> Vec<TextRegion> {
        let bounds: Vec<_> = regions.iter().map(|r| r.bounds).collect();

        let mut scored: Vec<TextRegion> = regions
            .into_iter()
            .enumerate()
            .map(|(i, mut region)| {
                let text = self.text_feature_score(&region);
                let spatial = spatial_score(i, &bounds);
                let score = 0.5 * region.confidence() + 0.3 * text + 0.2 * spatial;
                region.set_confidence(score);
                region
            })
            .collect();

        sort_by_confidence(&mut scored);
        scored
    }

    /// 0.4 aspect + 0.3 size + 0.3 contour complexity
    pub fn text_feature_score(&self, region: &TextRegion) -> f64 {
        let aspect = aspect_score(region.bounds.aspect_ratio());
        let size = (region.bounds.area() as f64 / self.config.ideal_area.max(1.0)).min(1.0);
        let complexity = contour_complexity_score(region);
        0.4 * aspect + 0.3 * size + 0.3 * complexity
    }

    /// Blend confidence with the best-matching region of the previous frame
    ///
    /// Matching is a greedy best-IoU lookup per region. Regions without a
    /// match above the tracking threshold start a new track.
    pub fn track_regions(&self, current: Vec<TextRegion>) -> Vec<TextRegion> {
        let mut previous = self.previous_frame.lock();
        let blend = self.config.tracking_blend;

        let tracked: Vec<TextRegion> = current
            .into_iter()
            .map(|mut region| {
                let best = previous
                    .iter()
                    .map(|p| (p, region.bounds.iou(&p.bounds)))
                    .max_by(|a, b| a.1.total_cmp(&b.1));

                match best {
                    Some((prev, iou)) if iou > self.config.tracking_iou_threshold => {
                        let blended = blend * region.confidence() + (1.0 - blend) * prev.confidence();
                        region.set_confidence(blended);
                        let frames = prev.metadata_u64(META_TRACKING_FRAMES).unwrap_or(1) + 1;
                        region.metadata.insert(META_TRACKING_FRAMES.to_string(), frames.into());
                    }
                    _ => {
                        region.metadata.insert(META_TRACKING_FRAMES.to_string(), 1u64.into());
                    }
                }
                region
            })
            .collect();

        *previous = tracked.clone();
        tracked
    }

    /// Forget the previous frame
    pub fn reset_tracking(&self) {
        self.previous_frame.lock().clear();
    }
}

impl Default for RegionAggregator {
    fn default() -> Self {
        Self::new(AggregatorConfig::default())
    }
}

/// Peaks for wide, text-like shapes (aspect 2..=10)
fn aspect_score(aspect: f64) -> f64 {
    if aspect <= 0.0 {
        0.0
    } else if aspect < 1.0 {
        0.7 * aspect
    } else if aspect < 2.0 {
        0.7 + 0.3 * (aspect - 1.0)
    } else if aspect <= 10.0 {
        1.0
    } else {
        (10.0 / aspect).max(0.1)
    }
}

/// Contour length relative to the bounding perimeter; moderate is best
fn contour_complexity_score(region: &TextRegion) -> f64 {
    if region.contour.is_empty() {
        return 0.5;
    }
    let perimeter = 2.0 * (region.bounds.width + region.bounds.height) as f64;
    if perimeter <= 0.0 {
        return 0.0;
    }
    let ratio = region.contour.len() as f64 / perimeter;
    if ratio < 1.0 {
        ratio
    } else if ratio <= 3.0 {
        1.0
    } else {
        3.0 / ratio
    }
}

/// 0.6 alignment + 0.4 proximity against every sibling
fn spatial_score(index: usize, bounds: &[crate::region::Rect]) -> f64 {
    let siblings = bounds.len().saturating_sub(1);
    if siblings == 0 {
        return 0.5;
    }

    let me = bounds[index];
    let (_, cy) = me.center();
    let mut aligned = 0usize;
    let mut near = 0usize;

    for (j, other) in bounds.iter().enumerate() {
        if j == index {
            continue;
        }
        let (_, ocy) = other.center();
        if (ocy - cy).abs() <= 0.1 * me.height as f64 {
            aligned += 1;
        }
        if me.horizontal_gap(other) as f64 <= 0.5 * me.width as f64
            && me.vertical_gap(other) as f64 <= 0.5 * me.height as f64
        {
            near += 1;
        }
    }

    0.6 * aligned as f64 / siblings as f64 + 0.4 * near as f64 / siblings as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::{Point, Rect};

    fn region(x: i32, y: i32, w: i32, h: i32, conf: f64) -> TextRegion {
        TextRegion::new(Rect::new(x, y, w, h), conf, "Mser")
    }

    #[test]
    fn test_merge_overlapping_pair() {
        let regions = vec![region(10, 10, 100, 30, 0.6), region(15, 12, 100, 30, 0.9)];
        let merged = merge_overlapping(regions, 0.3);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].bounds, Rect::new(10, 10, 105, 32));
        assert_eq!(merged[0].confidence(), 0.9);
    }

    #[test]
    fn test_merge_keeps_disjoint() {
        let regions = vec![region(0, 0, 10, 10, 0.5), region(100, 100, 10, 10, 0.7)];
        let merged = merge_overlapping(regions, 0.3);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].confidence(), 0.7);
    }

    #[test]
    fn test_merge_below_threshold_preserved() {
        // IoU = 50 / 150 ≈ 0.33
        let regions = vec![region(0, 0, 10, 10, 0.5), region(5, 0, 10, 10, 0.5)];
        assert_eq!(merge_overlapping(regions.clone(), 0.5).len(), 2);
        assert_eq!(merge_overlapping(regions, 0.3).len(), 1);
    }

    #[test]
    fn test_merge_concatenates_contours_and_methods() {
        let a = region(0, 0, 10, 10, 0.5).with_contour(vec![Point::new(0, 0)]);
        let mut b = region(1, 1, 10, 10, 0.4).with_contour(vec![Point::new(1, 1), Point::new(2, 2)]);
        b.detection_method = "Swt".to_string();

        let merged = merge_overlapping(vec![a, b], 0.3);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].contour.len(), 3);
        assert_eq!(merged[0].detection_method, "Mser+Swt");
    }

    #[test]
    fn test_merge_detector_outputs() {
        let aggregator = RegionAggregator::default();
        let mut swt = region(2, 0, 50, 10, 0.8);
        swt.detection_method = "Swt".to_string();
        let merged = aggregator.merge_detector_outputs(vec![
            vec![region(0, 0, 50, 10, 0.6)],
            vec![swt, region(300, 300, 20, 20, 0.4)],
        ]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].detection_method, "Swt+Mser");
        assert_eq!(merged[0].confidence(), 0.8);
    }

    #[test]
    fn test_single_region_spatial_is_neutral() {
        assert_eq!(spatial_score(0, &[Rect::new(0, 0, 10, 10)]), 0.5);
    }

    #[test]
    fn test_aligned_neighbours_score_higher() {
        let row = [Rect::new(0, 0, 40, 10), Rect::new(45, 0, 40, 10)];
        let scattered = [Rect::new(0, 0, 40, 10), Rect::new(500, 300, 40, 10)];
        assert!(spatial_score(0, &row) > spatial_score(0, &scattered));
        assert_eq!(spatial_score(0, &row), 1.0);
        assert_eq!(spatial_score(0, &scattered), 0.0);
    }

    #[test]
    fn test_aspect_score_shape() {
        assert_eq!(aspect_score(5.0), 1.0);
        assert!(aspect_score(1.0) < aspect_score(3.0));
        assert!(aspect_score(40.0) < aspect_score(8.0));
        assert_eq!(aspect_score(0.0), 0.0);
    }

    #[test]
    fn test_score_regions_bounded_and_sorted() {
        let aggregator = RegionAggregator::default();
        let regions = vec![
            region(0, 0, 200, 20, 1.0),
            region(0, 100, 5, 80, 0.1),
            region(210, 0, 200, 20, 0.9),
        ];
        let scored = aggregator.score_regions(regions);
        assert_eq!(scored.len(), 3);
        for r in &scored {
            assert!((0.0..=1.0).contains(&r.confidence()));
        }
        assert!(scored[0].confidence() >= scored[1].confidence());
        assert!(scored[1].confidence() >= scored[2].confidence());
    }

    #[test]
    fn test_single_region_score_formula() {
        let aggregator = RegionAggregator::default();
        // aspect 10 -> 1.0, area 6250 -> 1.0, no contour -> 0.5
        let scored = aggregator.score_regions(vec![region(0, 0, 250, 25, 0.6)]);
        let text = 0.4 + 0.3 + 0.15;
        let expected = 0.5 * 0.6 + 0.3 * text + 0.2 * 0.5;
        assert!((scored[0].confidence() - expected).abs() < 1e-9);
    }

    #[test]
    fn test_tracking_blends_matched_regions() {
        let aggregator = RegionAggregator::default();
        let first = aggregator.track_regions(vec![region(0, 0, 100, 20, 0.5)]);
        assert_eq!(first[0].metadata_u64(META_TRACKING_FRAMES), Some(1));

        let second = aggregator.track_regions(vec![region(2, 0, 100, 20, 1.0)]);
        assert!((second[0].confidence() - (0.7 * 1.0 + 0.3 * 0.5)).abs() < 1e-9);
        assert_eq!(second[0].metadata_u64(META_TRACKING_FRAMES), Some(2));

        let third = aggregator.track_regions(vec![region(2, 0, 100, 20, 1.0)]);
        assert_eq!(third[0].metadata_u64(META_TRACKING_FRAMES), Some(3));
    }

    #[test]
    fn test_tracking_new_region_resets() {
        let aggregator = RegionAggregator::default();
        aggregator.track_regions(vec![region(0, 0, 100, 20, 0.5)]);
        let moved = aggregator.track_regions(vec![region(500, 500, 100, 20, 0.9)]);
        assert_eq!(moved[0].confidence(), 0.9);
        assert_eq!(moved[0].metadata_u64(META_TRACKING_FRAMES), Some(1));
    }

    #[test]
    fn test_reset_tracking() {
        let aggregator = RegionAggregator::default();
        aggregator.track_regions(vec![region(0, 0, 100, 20, 0.5)]);
        aggregator.reset_tracking();
        let again = aggregator.track_regions(vec![region(0, 0, 100, 20, 0.9)]);
        assert_eq!(again[0].confidence(), 0.9);
    }
}
