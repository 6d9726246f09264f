//! Ensemble vote fusion
//!
//! Regions from several detectors are grouped greedily by IoU. A group is
//! accepted when enough distinct detectors voted for it, and its consensus
//! region is the (weighted) mean of the members. This mean rule is separate
//! from the max-confidence overlap merge in the aggregator.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::region::{sort_by_confidence, Rect, RegionType, TextRegion, META_VOTES};

/// How member votes are weighted in the consensus mean
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WeightingMode {
    #[default]
    Uniform,
    /// Weight each vote by its detector's success rate
    PerformanceWeighted,
}

/// Per-call fusion settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnsembleSettings {
    pub overlap_threshold: f64,
    /// Distinct detectors needed for a consensus region
    pub min_votes: usize,
    pub weighting: WeightingMode,
}

impl Default for EnsembleSettings {
    fn default() -> Self {
        Self {
            overlap_threshold: 0.5,
            min_votes: 2,
            weighting: WeightingMode::Uniform,
        }
    }
}

/// One detector's region entering the vote
#[derive(Debug, Clone)]
pub struct Vote {
    pub detector: String,
    pub region: TextRegion,
    pub weight: f64,
}

impl Vote {
    pub fn new(detector: impl Into<String>, region: TextRegion, weight: f64) -> Self {
        Self {
            detector: detector.into(),
            region,
            weight,
        }
    }
}

/// Fuse pooled votes into consensus regions
///
/// Votes are visited in descending confidence order. Each unassigned vote
/// seeds a group; later votes join when they overlap every member by at least
/// `overlap_threshold` and come from a detector not yet in the group.
pub fn fuse_votes(votes: Vec<Vote>, settings: &EnsembleSettings) -> Vec<TextRegion> {
    let mut votes = votes;
    votes.sort_by(|a, b| b.region.confidence().total_cmp(&a.region.confidence()));

    let mut assigned = vec![false; votes.len()];
    let mut consensus = Vec::new();

    for seed in 0..votes.len() {
        if assigned[seed] {
            continue;
        }
        assigned[seed] = true;
        let mut members = vec![seed];
        let mut detectors: HashSet<&str> = HashSet::new();
        detectors.insert(votes[seed].detector.as_str());

        for candidate in (seed + 1)..votes.len() {
            if assigned[candidate] || detectors.contains(votes[candidate].detector.as_str()) {
                continue;
            }
            let bounds = &votes[candidate].region.bounds;
            let overlaps_all = members
                .iter()
                .all(|&m| votes[m].region.bounds.iou(bounds) >= settings.overlap_threshold);
            if overlaps_all {
                assigned[candidate] = true;
                members.push(candidate);
                detectors.insert(votes[candidate].detector.as_str());
            }
        }

        if members.len() >= settings.min_votes.max(1) {
            let group: Vec<&Vote> = members.iter().map(|&i| &votes[i]).collect();
            consensus.push(consensus_region(&group, settings.weighting));
        }
    }

    sort_by_confidence(&mut consensus);
    consensus
}

/// Mean bounds and confidence of a vote group
fn consensus_region(group: &[&Vote], weighting: WeightingMode) -> TextRegion {
    let weights: Vec<f64> = match weighting {
        WeightingMode::Uniform => vec![1.0; group.len()],
        WeightingMode::PerformanceWeighted => {
            let w: Vec<f64> = group.iter().map(|v| v.weight.max(0.0)).collect();
            if w.iter().sum::<f64>() > f64::EPSILON {
                w
            } else {
                vec![1.0; group.len()]
            }
        }
    };
    let total: f64 = weights.iter().sum();
    let mean = |f: &dyn Fn(&Vote) -> f64| -> f64 {
        group
            .iter()
            .zip(&weights)
            .map(|(v, w)| f(v) * w)
            .sum::<f64>()
            / total
    };

    let bounds = Rect::new(
        mean(&|v| v.region.bounds.x as f64).round() as i32,
        mean(&|v| v.region.bounds.y as f64).round() as i32,
        mean(&|v| v.region.bounds.width as f64).round().max(1.0) as i32,
        mean(&|v| v.region.bounds.height as f64).round().max(1.0) as i32,
    );
    let confidence = mean(&|v| v.region.confidence());

    let mut voters: Vec<&str> = group.iter().map(|v| v.detector.as_str()).collect();
    voters.sort_unstable();

    TextRegion::new(bounds, confidence, format!("Ensemble({}votes)", group.len()))
        .with_type(RegionType::classify(&bounds))
        .with_metadata(META_VOTES, group.len() as u64)
        .with_metadata("voters", voters)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vote(detector: &str, x: i32, y: i32, w: i32, h: i32, conf: f64) -> Vote {
        Vote::new(detector, TextRegion::new(Rect::new(x, y, w, h), conf, detector), 1.0)
    }

    #[test]
    fn test_consensus_is_arithmetic_mean() {
        let votes = vec![
            vote("Mser", 10, 10, 100, 30, 0.9),
            vote("Swt", 12, 12, 100, 30, 0.6),
            vote("Adaptive", 14, 8, 103, 33, 0.6),
        ];
        let fused = fuse_votes(votes, &EnsembleSettings::default());
        assert_eq!(fused.len(), 1);
        assert_eq!(fused[0].bounds, Rect::new(12, 10, 101, 31));
        assert!((fused[0].confidence() - 0.7).abs() < 1e-9);
        assert_eq!(fused[0].detection_method, "Ensemble(3votes)");
        assert_eq!(fused[0].metadata_u64(META_VOTES), Some(3));
    }

    #[test]
    fn test_group_below_min_votes_is_dropped() {
        let votes = vec![
            vote("Mser", 10, 10, 100, 30, 0.9),
            vote("Swt", 400, 400, 50, 20, 0.8),
        ];
        assert!(fuse_votes(votes, &EnsembleSettings::default()).is_empty());
    }

    #[test]
    fn test_same_detector_votes_once_per_group() {
        let votes = vec![
            vote("Mser", 10, 10, 100, 30, 0.9),
            vote("Mser", 11, 10, 100, 30, 0.8),
        ];
        assert!(fuse_votes(votes, &EnsembleSettings::default()).is_empty());
    }

    #[test]
    fn test_fusion_is_order_independent() {
        let a = vec![
            vote("Mser", 10, 10, 100, 30, 0.9),
            vote("Swt", 12, 12, 100, 30, 0.7),
            vote("Swt", 300, 300, 60, 20, 0.5),
            vote("Adaptive", 302, 300, 60, 20, 0.6),
        ];
        let mut b = a.clone();
        b.reverse();
        let fa = fuse_votes(a, &EnsembleSettings::default());
        let fb = fuse_votes(b, &EnsembleSettings::default());
        assert_eq!(fa.len(), 2);
        let bounds_a: Vec<Rect> = fa.iter().map(|r| r.bounds).collect();
        let bounds_b: Vec<Rect> = fb.iter().map(|r| r.bounds).collect();
        assert_eq!(bounds_a, bounds_b);
    }

    #[test]
    fn test_performance_weighting() {
        let votes = vec![
            Vote::new("Fast", TextRegion::new(Rect::new(0, 0, 100, 30), 0.9, "Fast"), 3.0),
            Vote::new("Slow", TextRegion::new(Rect::new(4, 0, 100, 30), 0.5, "Slow"), 1.0),
        ];
        let settings = EnsembleSettings {
            weighting: WeightingMode::PerformanceWeighted,
            ..EnsembleSettings::default()
        };
        let fused = fuse_votes(votes, &settings);
        assert_eq!(fused.len(), 1);
        assert_eq!(fused[0].bounds.x, 1);
        assert!((fused[0].confidence() - 0.8).abs() < 1e-9);
    }
}
