//! Learned region templates
//!
//! A template stores where text appeared, relative to the frame that produced
//! it. Templates are keyed by method and position quantised to a 2% grid, so
//! the same spot found twice reinforces one entry.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::region::{Rect, TextRegion};

/// Grid step for template keys, as a fraction of the frame
const KEY_GRID: f64 = 0.02;

/// Frame aspect ratios within this relative distance can reuse a template
const ASPECT_TOLERANCE: f64 = 0.1;

/// Spatial pattern learned from a confident region
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionTemplate {
    pub key: String,
    pub relative_x: f64,
    pub relative_y: f64,
    pub relative_width: f64,
    pub relative_height: f64,
    pub source_width: u32,
    pub source_height: u32,
    /// Detection method of the region the template was learned from
    pub method: String,
    pub usage_count: u64,
    pub success_count: u64,
}

impl RegionTemplate {
    /// Learn a template from a region found in a `width` x `height` frame
    pub fn from_region(region: &TextRegion, width: u32, height: u32) -> Self {
        let (w, h) = (width.max(1) as f64, height.max(1) as f64);
        let b = region.bounds;
        Self {
            key: template_key(&b, width, height, &region.detection_method),
            relative_x: (b.x as f64 / w).clamp(0.0, 1.0),
            relative_y: (b.y as f64 / h).clamp(0.0, 1.0),
            relative_width: (b.width as f64 / w).clamp(0.0, 1.0),
            relative_height: (b.height as f64 / h).clamp(0.0, 1.0),
            source_width: width,
            source_height: height,
            method: region.detection_method.clone(),
            usage_count: 1,
            success_count: 1,
        }
    }

    /// `success_count / usage_count`, 0 when never used
    pub fn success_rate(&self) -> f64 {
        if self.usage_count == 0 {
            0.0
        } else {
            self.success_count as f64 / self.usage_count as f64
        }
    }

    /// Whether the frame shape is close enough to the source frame
    pub fn is_compatible(&self, width: u32, height: u32) -> bool {
        if width == 0 || height == 0 || self.source_width == 0 || self.source_height == 0 {
            return false;
        }
        let source = self.source_width as f64 / self.source_height as f64;
        let current = width as f64 / height as f64;
        ((current - source) / source).abs() <= ASPECT_TOLERANCE
    }

    /// Absolute rectangle in a `width` x `height` frame
    pub fn instantiate(&self, width: u32, height: u32) -> Option<Rect> {
        let (w, h) = (width as f64, height as f64);
        let rect = Rect::new(
            (self.relative_x * w).round() as i32,
            (self.relative_y * h).round() as i32,
            (self.relative_width * w).round().max(1.0) as i32,
            (self.relative_height * h).round().max(1.0) as i32,
        );
        rect.clip_to(width, height)
    }

    pub fn record_success(&mut self) {
        self.usage_count += 1;
        self.success_count += 1;
    }

    pub fn record_miss(&mut self) {
        self.usage_count += 1;
    }
}

/// Deterministic key from method and quantised relative rectangle
pub fn template_key(bounds: &Rect, width: u32, height: u32, method: &str) -> String {
    let (w, h) = (width.max(1) as f64, height.max(1) as f64);
    let q = |v: f64| (v / KEY_GRID).round() as i64;
    format!(
        "{}:{}:{}:{}:{}",
        method,
        q(bounds.x as f64 / w),
        q(bounds.y as f64 / h),
        q(bounds.width as f64 / w),
        q(bounds.height as f64 / h)
    )
}

/// Outcome of one update pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TemplateUpdate {
    pub created: usize,
    pub reinforced: usize,
    pub missed: usize,
    pub evicted: usize,
}

/// Settings for one update pass
#[derive(Debug, Clone, Copy)]
pub(crate) struct UpdatePolicy {
    pub confidence_threshold: f64,
    pub min_success_rate: f64,
    pub max_templates: usize,
}

/// Thread-safe template cache
///
/// Every update runs under one write lock, so readers see either the state
/// before or after a pass.
#[derive(Debug, Default)]
pub(crate) struct TemplateCache {
    templates: RwLock<HashMap<String, RegionTemplate>>,
}

impl TemplateCache {
    pub fn len(&self) -> usize {
        self.templates.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.read().is_empty()
    }

    /// Templates sorted by key
    pub fn snapshot(&self) -> Vec<RegionTemplate> {
        let mut templates: Vec<RegionTemplate> = self.templates.read().values().cloned().collect();
        templates.sort_by(|a, b| a.key.cmp(&b.key));
        templates
    }

    /// Templates usable on a `width` x `height` frame
    pub fn compatible(&self, width: u32, height: u32) -> Vec<RegionTemplate> {
        self.templates
            .read()
            .values()
            .filter(|t| t.is_compatible(width, height))
            .cloned()
            .collect()
    }

    pub fn replace_all(&self, templates: Vec<RegionTemplate>) {
        let map = templates.into_iter().map(|t| (t.key.clone(), t)).collect();
        *self.templates.write() = map;
    }

    pub fn clear(&self) {
        self.templates.write().clear();
    }

    /// Fold one call's results back into the cache
    ///
    /// `instantiated` maps the key of every template emitted this call to
    /// whether an independent region (a proposal, not the template's own
    /// output) overlapped it. Corroborated templates count a success, the
    /// rest a miss. Confident learnable survivors not produced by a template
    /// become new templates. Templates below the success floor are then
    /// evicted.
    pub fn update(
        &self,
        survivors: &[TextRegion],
        instantiated: &HashMap<String, bool>,
        width: u32,
        height: u32,
        policy: UpdatePolicy,
        is_learnable: impl Fn(&TextRegion) -> bool,
    ) -> TemplateUpdate {
        let mut outcome = TemplateUpdate::default();
        let mut templates = self.templates.write();
        let mut reinforced: HashSet<String> = HashSet::new();

        for (key, corroborated) in instantiated {
            let Some(template) = templates.get_mut(key) else {
                continue;
            };
            if *corroborated {
                template.record_success();
                reinforced.insert(key.clone());
                outcome.reinforced += 1;
            } else {
                template.record_miss();
                outcome.missed += 1;
            }
        }

        for region in survivors {
            // A template's own output never vouches for anything
            if region.metadata_str(crate::region::META_TEMPLATE_KEY).is_some() {
                continue;
            }
            if region.confidence() < policy.confidence_threshold || !is_learnable(region) {
                continue;
            }
            let template = RegionTemplate::from_region(region, width, height);
            match templates.get_mut(&template.key) {
                Some(existing) => {
                    if reinforced.insert(template.key.clone()) {
                        existing.record_success();
                        outcome.reinforced += 1;
                    }
                }
                None => {
                    reinforced.insert(template.key.clone());
                    templates.insert(template.key.clone(), template);
                    outcome.created += 1;
                }
            }
        }

        let before = templates.len();
        templates.retain(|_, t| t.success_rate() >= policy.min_success_rate);

        if templates.len() > policy.max_templates {
            let mut ranked: Vec<(String, f64, u64)> = templates
                .values()
                .map(|t| (t.key.clone(), t.success_rate(), t.usage_count))
                .collect();
            ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(b.2.cmp(&a.2)));
            for (key, _, _) in ranked.into_iter().skip(policy.max_templates) {
                templates.remove(&key);
            }
        }
        outcome.evicted = before.saturating_sub(templates.len());

        outcome
    }
}
