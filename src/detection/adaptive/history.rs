//! Bounded detection history
//!
//! Feeds the history-weighting phase and the background retuning. Oldest
//! entries are evicted first.

use std::collections::VecDeque;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::Serialize;

use crate::region::Rect;

/// One completed adaptive detection call
#[derive(Debug, Clone, Serialize)]
pub struct DetectionHistoryEntry {
    pub image_width: u32,
    pub image_height: u32,
    /// Milliseconds since the Unix epoch
    pub timestamp_ms: u64,
    /// Bounds of the regions returned to the caller
    pub regions: Vec<Rect>,
    pub processing_time: Duration,
    pub template_count: usize,
    pub proposal_count: usize,
    pub used_fallback: bool,
}

impl DetectionHistoryEntry {
    pub fn new(image_width: u32, image_height: u32, regions: Vec<Rect>) -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            image_width,
            image_height,
            timestamp_ms,
            regions,
            processing_time: Duration::ZERO,
            template_count: 0,
            proposal_count: 0,
            used_fallback: false,
        }
    }
}

/// Region position and size relative to its frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct SpatialPattern {
    pub center_x: f64,
    pub center_y: f64,
    pub width: f64,
    pub height: f64,
}

impl SpatialPattern {
    pub fn from_rect(rect: &Rect, width: u32, height: u32) -> Self {
        let (w, h) = (width.max(1) as f64, height.max(1) as f64);
        let (cx, cy) = rect.center();
        Self {
            center_x: cx / w,
            center_y: cy / h,
            width: rect.width as f64 / w,
            height: rect.height as f64 / h,
        }
    }

    /// 0.6 position similarity + 0.4 size similarity, in [0, 1]
    pub fn similarity(&self, other: &SpatialPattern) -> f64 {
        let dx = self.center_x - other.center_x;
        let dy = self.center_y - other.center_y;
        let position = (1.0 - (dx * dx + dy * dy).sqrt() / std::f64::consts::SQRT_2).clamp(0.0, 1.0);
        let size = (1.0
            - ((self.width - other.width).abs() + (self.height - other.height).abs()) / 2.0)
            .clamp(0.0, 1.0);
        0.6 * position + 0.4 * size
    }
}

/// History match score of `rect` against learned patterns
///
/// 1.0 without history; otherwise the best similarity, floored at 0.5.
pub(crate) fn history_match_score(
    rect: &Rect,
    width: u32,
    height: u32,
    patterns: &[SpatialPattern],
) -> f64 {
    if patterns.is_empty() {
        return 1.0;
    }
    let candidate = SpatialPattern::from_rect(rect, width, height);
    patterns
        .iter()
        .map(|p| candidate.similarity(p))
        .fold(0.0_f64, f64::max)
        .max(0.5)
}

/// Fixed-capacity FIFO of history entries
#[derive(Debug, Default)]
pub(crate) struct DetectionHistory {
    entries: Mutex<VecDeque<DetectionHistoryEntry>>,
}

impl DetectionHistory {
    /// Append, evicting the oldest entries beyond `capacity`
    pub fn push(&self, entry: DetectionHistoryEntry, capacity: usize) {
        let mut entries = self.entries.lock();
        entries.push_back(entry);
        while entries.len() > capacity.max(1) {
            entries.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Up to `n` most recent entries, oldest first
    pub fn recent(&self, n: usize) -> Vec<DetectionHistoryEntry> {
        let entries = self.entries.lock();
        let skip = entries.len().saturating_sub(n);
        entries.iter().skip(skip).cloned().collect()
    }

    /// Patterns of every region in the last `window` entries
    pub fn patterns(&self, window: usize) -> Vec<SpatialPattern> {
        let entries = self.entries.lock();
        let skip = entries.len().saturating_sub(window);
        entries
            .iter()
            .skip(skip)
            .flat_map(|e| {
                e.regions
                    .iter()
                    .map(move |r| SpatialPattern::from_rect(r, e.image_width, e.image_height))
            })
            .collect()
    }

    /// Average processing time (ms) and region count over the last `window` entries
    pub fn averages(&self, window: usize) -> Option<(f64, f64)> {
        let entries = self.entries.lock();
        let skip = entries.len().saturating_sub(window);
        let recent: Vec<&DetectionHistoryEntry> = entries.iter().skip(skip).collect();
        if recent.is_empty() {
            return None;
        }
        let n = recent.len() as f64;
        let time = recent
            .iter()
            .map(|e| e.processing_time.as_secs_f64() * 1000.0)
            .sum::<f64>()
            / n;
        let count = recent.iter().map(|e| e.regions.len() as f64).sum::<f64>() / n;
        Some((time, count))
    }
}
