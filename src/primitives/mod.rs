//! Low-level image primitives
//!
//! Detectors never touch pixels directly for blob extraction, edge detection,
//! stroke width transform or component labelling; they go through the narrow
//! `ImagePrimitives` interface. Filtering, scoring and grouping built on top
//! of these primitives live in the detectors.
//!
//! `ImageprocPrimitives` is the default backend, built on `imageproc`.

mod imageproc_backend;

use image::{GrayImage, ImageBuffer, Luma};

use crate::region::{Point, Rect};

pub use imageproc_backend::ImageprocPrimitives;

/// Per-pixel stroke width, 0.0 where no stroke was found
pub type StrokeWidthMap = ImageBuffer<Luma<f32>, Vec<f32>>;

/// Knobs for MSER-style blob extraction
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlobParams {
    /// Grey-level step between compared thresholds
    pub delta: u8,
    pub min_area: u32,
    pub max_area: u32,
    /// Maximum relative area growth over `delta` levels for a stable region
    pub max_variation: f64,
}

impl Default for BlobParams {
    fn default() -> Self {
        Self {
            delta: 5,
            min_area: 60,
            max_area: 14400,
            max_variation: 0.25,
        }
    }
}

/// Knobs for the stroke width transform
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StrokeParams {
    /// Dark text on a light background (ray direction follows this)
    pub dark_on_light: bool,
    pub max_stroke_width: u32,
}

impl Default for StrokeParams {
    fn default() -> Self {
        Self {
            dark_on_light: true,
            max_stroke_width: 40,
        }
    }
}

/// Maximally stable region
#[derive(Debug, Clone, PartialEq)]
pub struct Blob {
    pub bounds: Rect,
    /// Pixel count of the region
    pub area: u32,
    /// Boundary pixels
    pub contour: Vec<Point>,
}

/// Connected component of a label image
#[derive(Debug, Clone, PartialEq)]
pub struct Component {
    pub bounds: Rect,
    pub points: Vec<Point>,
}

/// Pixel-level operations the detectors build on
///
/// Implementations are stateless and shared between threads.
pub trait ImagePrimitives: Send + Sync {
    /// MSER-style stable region extraction over both polarities
    fn extract_blobs(&self, gray: &GrayImage, params: &BlobParams) -> anyhow::Result<Vec<Blob>>;

    /// Binary edge map (non-zero = edge)
    fn detect_edges(&self, gray: &GrayImage, low: f32, high: f32) -> anyhow::Result<GrayImage>;

    fn stroke_width_transform(
        &self,
        gray: &GrayImage,
        edges: &GrayImage,
        params: &StrokeParams,
    ) -> anyhow::Result<StrokeWidthMap>;

    /// Eight-connected components of the non-zero stroke pixels
    fn connected_components(&self, strokes: &StrokeWidthMap) -> anyhow::Result<Vec<Component>>;
}

/// Axis-aligned bounding rectangle of a point set
pub fn bounding_rect(points: &[Point]) -> Option<Rect> {
    let first = points.first()?;
    let (mut min_x, mut min_y, mut max_x, mut max_y) = (first.x, first.y, first.x, first.y);
    for p in &points[1..] {
        min_x = min_x.min(p.x);
        min_y = min_y.min(p.y);
        max_x = max_x.max(p.x);
        max_y = max_y.max(p.y);
    }
    Some(Rect::new(min_x, min_y, max_x - min_x + 1, max_y - min_y + 1))
}
