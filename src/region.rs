//! Region types shared by every detector
//!
//! A `TextRegion` is one candidate area of a frame that probably contains
//! text. Bounds are always expressed in the coordinate space of the image that
//! was handed to the detector.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use image::RgbaImage;
use serde::{Deserialize, Serialize};

/// Metadata key holding the temporal tracking counter
pub const META_TRACKING_FRAMES: &str = "tracking_frame_count";
/// Metadata key holding the mean stroke width of an SWT region
pub const META_STROKE_WIDTH: &str = "stroke_width";
/// Metadata key holding the template key a region was instantiated from
pub const META_TEMPLATE_KEY: &str = "template_key";
/// Metadata key holding the number of ensemble votes
pub const META_VOTES: &str = "votes";

/// Integer pixel coordinate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// Axis-aligned integer rectangle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Rectangle covering a whole image
    pub fn from_dimensions(width: u32, height: u32) -> Self {
        Self::new(0, 0, width as i32, height as i32)
    }

    pub fn right(&self) -> i32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> i32 {
        self.y + self.height
    }

    pub fn area(&self) -> i64 {
        if self.is_valid() {
            self.width as i64 * self.height as i64
        } else {
            0
        }
    }

    /// Both sides strictly positive
    pub fn is_valid(&self) -> bool {
        self.width > 0 && self.height > 0
    }

    pub fn center(&self) -> (f64, f64) {
        (
            self.x as f64 + self.width as f64 / 2.0,
            self.y as f64 + self.height as f64 / 2.0,
        )
    }

    /// Width divided by height (0 for degenerate rectangles)
    pub fn aspect_ratio(&self) -> f64 {
        if self.height <= 0 {
            0.0
        } else {
            self.width as f64 / self.height as f64
        }
    }

    pub fn intersection(&self, other: &Rect) -> Option<Rect> {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = self.right().min(other.right());
        let y2 = self.bottom().min(other.bottom());

        if x2 > x1 && y2 > y1 {
            Some(Rect::new(x1, y1, x2 - x1, y2 - y1))
        } else {
            None
        }
    }

    /// Smallest rectangle containing both
    pub fn union(&self, other: &Rect) -> Rect {
        let x1 = self.x.min(other.x);
        let y1 = self.y.min(other.y);
        let x2 = self.right().max(other.right());
        let y2 = self.bottom().max(other.bottom());
        Rect::new(x1, y1, x2 - x1, y2 - y1)
    }

    /// Intersection over union, 0.0 when the rectangles are disjoint
    pub fn iou(&self, other: &Rect) -> f64 {
        let inter = match self.intersection(other) {
            Some(r) => r.area(),
            None => return 0.0,
        };
        let union = self.area() + other.area() - inter;
        if union <= 0 {
            0.0
        } else {
            inter as f64 / union as f64
        }
    }

    /// Clip to the image frame, returning `None` when nothing remains
    pub fn clip_to(&self, width: u32, height: u32) -> Option<Rect> {
        self.intersection(&Rect::from_dimensions(width, height))
    }

    /// Edge-to-edge horizontal gap (0 when the spans overlap)
    pub fn horizontal_gap(&self, other: &Rect) -> i32 {
        (other.x - self.right()).max(self.x - other.right()).max(0)
    }

    /// Edge-to-edge vertical gap (0 when the spans overlap)
    pub fn vertical_gap(&self, other: &Rect) -> i32 {
        (other.y - self.bottom()).max(self.y - other.bottom()).max(0)
    }
}

impl fmt::Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {}x{})", self.x, self.y, self.width, self.height)
    }
}

/// Coarse layout role of a region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum RegionType {
    #[default]
    Unknown,
    Title,
    Heading,
    Paragraph,
    Label,
    Button,
    Template,
}

impl RegionType {
    /// Classify from size and shape alone
    pub fn classify(bounds: &Rect) -> Self {
        let aspect = bounds.aspect_ratio();
        let height = bounds.height;
        let width = bounds.width;

        if height >= 40 && aspect >= 3.0 {
            RegionType::Title
        } else if height >= 24 && aspect >= 2.0 {
            RegionType::Heading
        } else if aspect >= 8.0 && height < 24 {
            RegionType::Paragraph
        } else if (2.0..=6.0).contains(&aspect) && width <= 160 && height <= 40 {
            RegionType::Button
        } else if width <= 120 && height <= 24 {
            RegionType::Label
        } else {
            RegionType::Unknown
        }
    }
}

/// A candidate text region
#[derive(Debug, Clone)]
pub struct TextRegion {
    pub bounds: Rect,
    confidence: f64,
    pub region_type: RegionType,
    /// Provenance tag, e.g. `"Mser"` or `"Ensemble(3votes)"`
    pub detection_method: String,
    pub contour: Vec<Point>,
    pub processed_image: Option<Arc<RgbaImage>>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl TextRegion {
    pub fn new(bounds: Rect, confidence: f64, detection_method: impl Into<String>) -> Self {
        Self {
            bounds,
            confidence: clamp_confidence(confidence),
            region_type: RegionType::Unknown,
            detection_method: detection_method.into(),
            contour: Vec::new(),
            processed_image: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_type(mut self, region_type: RegionType) -> Self {
        self.region_type = region_type;
        self
    }

    pub fn with_contour(mut self, contour: Vec<Point>) -> Self {
        self.contour = contour;
        self
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    /// Set confidence, clamped to [0, 1]
    pub fn set_confidence(&mut self, confidence: f64) {
        self.confidence = clamp_confidence(confidence);
    }

    pub fn metadata_u64(&self, key: &str) -> Option<u64> {
        self.metadata.get(key).and_then(|v| v.as_u64())
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }

    /// Crop the source frame to this region and keep it on the region
    pub fn attach_crop(&mut self, frame: &RgbaImage) {
        if let Some(clipped) = self.bounds.clip_to(frame.width(), frame.height()) {
            let crop = image::imageops::crop_imm(
                frame,
                clipped.x as u32,
                clipped.y as u32,
                clipped.width as u32,
                clipped.height as u32,
            )
            .to_image();
            self.processed_image = Some(Arc::new(crop));
        }
    }
}

/// Confidence values are always finite and inside [0, 1]
pub fn clamp_confidence(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Sort regions by descending confidence
pub fn sort_by_confidence(regions: &mut [TextRegion]) {
    regions.sort_by(|a, b| b.confidence().total_cmp(&a.confidence()));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iou_of_identical_rects() {
        let r = Rect::new(0, 0, 10, 10);
        assert!((r.iou(&r) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_iou_disjoint_is_zero() {
        let a = Rect::new(0, 0, 10, 10);
        let b = Rect::new(20, 20, 10, 10);
        assert_eq!(a.iou(&b), 0.0);
        assert!(a.intersection(&b).is_none());
    }

    #[test]
    fn test_iou_partial_overlap() {
        let a = Rect::new(10, 10, 100, 30);
        let b = Rect::new(15, 12, 100, 30);
        // intersection 95x28 = 2660, union 3340
        let iou = a.iou(&b);
        assert!((iou - 2660.0 / 3340.0).abs() < 1e-9);
    }

    #[test]
    fn test_union_covers_both() {
        let a = Rect::new(10, 10, 100, 30);
        let b = Rect::new(15, 12, 100, 30);
        assert_eq!(a.union(&b), Rect::new(10, 10, 105, 32));
    }

    #[test]
    fn test_clip_to_image() {
        let r = Rect::new(-5, -5, 20, 20);
        assert_eq!(r.clip_to(10, 10), Some(Rect::new(0, 0, 10, 10)));
        assert_eq!(Rect::new(50, 50, 5, 5).clip_to(10, 10), None);
    }

    #[test]
    fn test_gaps() {
        let a = Rect::new(0, 0, 10, 10);
        let b = Rect::new(15, 0, 10, 10);
        assert_eq!(a.horizontal_gap(&b), 5);
        assert_eq!(b.horizontal_gap(&a), 5);
        assert_eq!(a.vertical_gap(&b), 0);
    }

    #[test]
    fn test_confidence_is_clamped() {
        let mut region = TextRegion::new(Rect::new(0, 0, 5, 5), 1.7, "Test");
        assert_eq!(region.confidence(), 1.0);
        region.set_confidence(-0.2);
        assert_eq!(region.confidence(), 0.0);
        region.set_confidence(f64::NAN);
        assert_eq!(region.confidence(), 0.0);
    }

    #[test]
    fn test_classify_region_types() {
        assert_eq!(RegionType::classify(&Rect::new(0, 0, 400, 60)), RegionType::Title);
        assert_eq!(RegionType::classify(&Rect::new(0, 0, 200, 30)), RegionType::Heading);
        assert_eq!(RegionType::classify(&Rect::new(0, 0, 400, 18)), RegionType::Paragraph);
        assert_eq!(RegionType::classify(&Rect::new(0, 0, 80, 20)), RegionType::Button);
        assert_eq!(RegionType::classify(&Rect::new(0, 0, 20, 18)), RegionType::Label);
    }

    #[test]
    fn test_attach_crop() {
        let frame = RgbaImage::from_pixel(50, 40, image::Rgba([1, 2, 3, 255]));
        let mut region = TextRegion::new(Rect::new(40, 30, 20, 20), 0.5, "Test");
        region.attach_crop(&frame);
        let crop = region.processed_image.expect("crop");
        assert_eq!(crop.dimensions(), (10, 10));
    }
}
