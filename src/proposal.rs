//! External region proposal capability
//!
//! A proposal service (typically a neural text-line detector running in or out
//! of process) returns raw, unranked rectangles. It may resize the frame before
//! inference; it reports the factor it applied so the adaptive detector can
//! map the rectangles back onto the original frame.

use image::{DynamicImage, RgbaImage};

use crate::region::Rect;

/// Pixel layout the service wants as input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProposalFormat {
    #[default]
    Rgba,
    Rgb,
    Luma,
}

impl ProposalFormat {
    /// Convert a captured frame into this layout
    pub fn convert(&self, frame: &RgbaImage) -> DynamicImage {
        let image = DynamicImage::ImageRgba8(frame.clone());
        match self {
            ProposalFormat::Rgba => image,
            ProposalFormat::Rgb => DynamicImage::ImageRgb8(image.to_rgb8()),
            ProposalFormat::Luma => DynamicImage::ImageLuma8(image.to_luma8()),
        }
    }
}

/// One raw proposal
#[derive(Debug, Clone, PartialEq)]
pub struct RawProposal {
    pub bounds: Rect,
    pub confidence: f64,
}

impl RawProposal {
    pub fn new(bounds: Rect, confidence: f64) -> Self {
        Self { bounds, confidence }
    }
}

/// Service output with the scale the service applied to the frame
#[derive(Debug, Clone, PartialEq)]
pub struct ProposalBatch {
    pub proposals: Vec<RawProposal>,
    /// Service coordinates = original coordinates × `scale`
    pub scale: f64,
}

impl ProposalBatch {
    /// Proposals already in frame coordinates
    pub fn unscaled(proposals: Vec<RawProposal>) -> Self {
        Self {
            proposals,
            scale: 1.0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.proposals.is_empty()
    }

    /// Map every proposal back onto a `width`×`height` frame
    ///
    /// Proposals that end up empty after clipping are dropped.
    pub fn restore(&self, width: u32, height: u32) -> Vec<RawProposal> {
        let inv = if self.scale > f64::EPSILON && self.scale.is_finite() {
            1.0 / self.scale
        } else {
            1.0
        };

        // Service coordinates may sit near i32::MAX; corners stay in f64 until clamped
        let (w, h) = (width as f64, height as f64);
        self.proposals
            .iter()
            .filter_map(|p| {
                let b = p.bounds;
                let (ax, bx) = (b.x as f64, b.x as f64 + b.width as f64);
                let (ay, by) = (b.y as f64, b.y as f64 + b.height as f64);
                let x1 = (ax.min(bx) * inv).floor().clamp(0.0, w);
                let y1 = (ay.min(by) * inv).floor().clamp(0.0, h);
                let x2 = (ax.max(bx) * inv).ceil().clamp(0.0, w);
                let y2 = (ay.max(by) * inv).ceil().clamp(0.0, h);
                if x2 <= x1 || y2 <= y1 {
                    return None;
                }
                let bounds = Rect::new(x1 as i32, y1 as i32, (x2 - x1) as i32, (y2 - y1) as i32);
                Some(RawProposal::new(bounds, p.confidence))
            })
            .collect()
    }
}

/// Region proposal capability consumed by the adaptive detector
pub trait RegionProposalService: Send + Sync {
    fn name(&self) -> &str;

    fn input_format(&self) -> ProposalFormat {
        ProposalFormat::Rgba
    }

    /// Whether the service can currently take requests
    fn is_available(&self) -> bool {
        true
    }

    fn propose(&self, image: &DynamicImage) -> anyhow::Result<ProposalBatch>;
}
