//! Default `ImagePrimitives` backend built on `imageproc`

use std::collections::HashMap;

use image::{GrayImage, ImageBuffer, Luma};
use imageproc::region_labelling::{connected_components, Connectivity};
use rayon::prelude::*;

use super::{Blob, BlobParams, Component, ImagePrimitives, StrokeParams, StrokeWidthMap};
use crate::region::{Point, Rect};

/// cos(30°): gradients at both ends of a stroke must be roughly opposite
const OPPOSITE_GRADIENT_COS: f32 = 0.866;

/// Stateless primitive backend
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageprocPrimitives;

impl ImageprocPrimitives {
    pub fn new() -> Self {
        Self
    }
}

/// Running bounds/area of one label
#[derive(Debug, Clone, Copy)]
struct LabelStats {
    area: u32,
    min_x: u32,
    min_y: u32,
    max_x: u32,
    max_y: u32,
    seed: (u32, u32),
}

impl LabelStats {
    fn new(x: u32, y: u32) -> Self {
        Self {
            area: 0,
            min_x: x,
            min_y: y,
            max_x: x,
            max_y: y,
            seed: (x, y),
        }
    }

    fn add(&mut self, x: u32, y: u32) {
        self.area += 1;
        self.min_x = self.min_x.min(x);
        self.min_y = self.min_y.min(y);
        self.max_x = self.max_x.max(x);
        self.max_y = self.max_y.max(y);
    }

    fn bounds(&self) -> Rect {
        Rect::new(
            self.min_x as i32,
            self.min_y as i32,
            (self.max_x - self.min_x + 1) as i32,
            (self.max_y - self.min_y + 1) as i32,
        )
    }
}

fn label_stats(labels: &ImageBuffer<Luma<u32>, Vec<u32>>) -> HashMap<u32, LabelStats> {
    let mut stats: HashMap<u32, LabelStats> = HashMap::new();
    for (x, y, pixel) in labels.enumerate_pixels() {
        let label = pixel[0];
        if label == 0 {
            continue;
        }
        stats
            .entry(label)
            .or_insert_with(|| LabelStats::new(x, y))
            .add(x, y);
    }
    stats
}

/// Boundary pixels (4-neighbourhood) of one label inside its bounds
fn label_contour(labels: &ImageBuffer<Luma<u32>, Vec<u32>>, label: u32, stats: &LabelStats) -> Vec<Point> {
    let (width, height) = labels.dimensions();
    let mut contour = Vec::new();
    for y in stats.min_y..=stats.max_y {
        for x in stats.min_x..=stats.max_x {
            if labels.get_pixel(x, y)[0] != label {
                continue;
            }
            let on_edge = x == 0
                || y == 0
                || x + 1 >= width
                || y + 1 >= height
                || labels.get_pixel(x - 1, y)[0] != label
                || labels.get_pixel(x + 1, y)[0] != label
                || labels.get_pixel(x, y - 1)[0] != label
                || labels.get_pixel(x, y + 1)[0] != label;
            if on_edge {
                contour.push(Point::new(x as i32, y as i32));
            }
        }
    }
    contour
}

fn threshold_labels(gray: &GrayImage, level: u8) -> ImageBuffer<Luma<u32>, Vec<u32>> {
    let mask = GrayImage::from_fn(gray.width(), gray.height(), |x, y| {
        if gray.get_pixel(x, y)[0] <= level {
            Luma([255])
        } else {
            Luma([0])
        }
    });
    connected_components(&mask, Connectivity::Eight, Luma([0u8]))
}

/// Stable dark regions of `gray` (call with the inverted image for bright ones)
fn stable_regions(gray: &GrayImage, params: &BlobParams) -> Vec<Blob> {
    let delta = params.delta.max(1) as usize;
    let levels: Vec<u8> = (0..=255usize).step_by(delta).map(|l| l as u8).collect();
    let mut blobs = Vec::new();

    let mut prev_labels = match levels.first() {
        Some(&level) => threshold_labels(gray, level),
        None => return blobs,
    };
    let mut prev_stats = label_stats(&prev_labels);

    for &level in levels.iter().skip(1) {
        let next_labels = threshold_labels(gray, level);
        let next_stats = label_stats(&next_labels);

        for (&label, stats) in &prev_stats {
            if stats.area < params.min_area || stats.area > params.max_area {
                continue;
            }
            let (sx, sy) = stats.seed;
            let grown_label = next_labels.get_pixel(sx, sy)[0];
            let grown_area = match next_stats.get(&grown_label) {
                Some(s) => s.area,
                None => continue,
            };
            let variation = (grown_area as f64 - stats.area as f64) / stats.area as f64;
            if variation <= params.max_variation {
                blobs.push(Blob {
                    bounds: stats.bounds(),
                    area: stats.area,
                    contour: label_contour(&prev_labels, label, stats),
                });
            }
        }

        prev_labels = next_labels;
        prev_stats = next_stats;
    }

    blobs
}

impl ImagePrimitives for ImageprocPrimitives {
    fn extract_blobs(&self, gray: &GrayImage, params: &BlobParams) -> anyhow::Result<Vec<Blob>> {
        if gray.width() == 0 || gray.height() == 0 {
            return Ok(Vec::new());
        }

        let mut inverted = gray.clone();
        image::imageops::invert(&mut inverted);

        let (dark, bright) = rayon::join(
            || stable_regions(gray, params),
            || stable_regions(&inverted, params),
        );

        // A region stable over several consecutive levels shows up once per level.
        let mut seen = std::collections::HashSet::new();
        let blobs = dark
            .into_iter()
            .chain(bright)
            .filter(|b| seen.insert(b.bounds))
            .collect();
        Ok(blobs)
    }

    fn detect_edges(&self, gray: &GrayImage, low: f32, high: f32) -> anyhow::Result<GrayImage> {
        anyhow::ensure!(low <= high, "canny thresholds inverted: {} > {}", low, high);
        Ok(imageproc::edges::canny(gray, low, high))
    }

    fn stroke_width_transform(
        &self,
        gray: &GrayImage,
        edges: &GrayImage,
        params: &StrokeParams,
    ) -> anyhow::Result<StrokeWidthMap> {
        anyhow::ensure!(
            gray.dimensions() == edges.dimensions(),
            "edge map {:?} does not match image {:?}",
            edges.dimensions(),
            gray.dimensions()
        );

        let (width, height) = gray.dimensions();
        let gx = imageproc::gradients::horizontal_sobel(gray);
        let gy = imageproc::gradients::vertical_sobel(gray);
        let sign = if params.dark_on_light { -1.0f32 } else { 1.0 };
        let max_len = params.max_stroke_width.max(1) as f32;

        let gradient = |x: u32, y: u32| -> Option<(f32, f32)> {
            let dx = gx.get_pixel(x, y)[0] as f32;
            let dy = gy.get_pixel(x, y)[0] as f32;
            let mag = (dx * dx + dy * dy).sqrt();
            if mag <= f32::EPSILON {
                None
            } else {
                Some((dx / mag, dy / mag))
            }
        };

        // First pass: march from each edge pixel across the stroke.
        let rays: Vec<(Vec<(u32, u32)>, f32)> = (0..height)
            .into_par_iter()
            .flat_map_iter(|y| {
                let mut row_rays = Vec::new();
                for x in 0..width {
                    if edges.get_pixel(x, y)[0] == 0 {
                        continue;
                    }
                    let Some((gdx, gdy)) = gradient(x, y) else {
                        continue;
                    };
                    let (dir_x, dir_y) = (gdx * sign, gdy * sign);
                    let (ox, oy) = (x as f32 + 0.5, y as f32 + 0.5);
                    let mut ray = vec![(x, y)];
                    let mut step = 0.0f32;

                    while step < max_len {
                        step += 0.5;
                        let px = (ox + dir_x * step).floor();
                        let py = (oy + dir_y * step).floor();
                        if px < 0.0 || py < 0.0 || px >= width as f32 || py >= height as f32 {
                            break;
                        }
                        let (px, py) = (px as u32, py as u32);
                        if ray.last() == Some(&(px, py)) {
                            continue;
                        }
                        ray.push((px, py));

                        if edges.get_pixel(px, py)[0] != 0 {
                            if let Some((qdx, qdy)) = gradient(px, py) {
                                if gdx * qdx + gdy * qdy < -OPPOSITE_GRADIENT_COS {
                                    let fx = px as f32 - x as f32;
                                    let fy = py as f32 - y as f32;
                                    let stroke = (fx * fx + fy * fy).sqrt().max(1.0);
                                    row_rays.push((std::mem::take(&mut ray), stroke));
                                }
                            }
                            break;
                        }
                    }
                }
                row_rays
            })
            .collect();

        let mut swt: StrokeWidthMap = ImageBuffer::from_pixel(width, height, Luma([f32::INFINITY]));
        for (ray, stroke) in &rays {
            for &(x, y) in ray {
                let current = swt.get_pixel(x, y)[0];
                if *stroke < current {
                    swt.put_pixel(x, y, Luma([*stroke]));
                }
            }
        }

        // Second pass: clamp each ray to its median so corners do not inflate widths.
        for (ray, _) in &rays {
            let mut values: Vec<f32> = ray.iter().map(|&(x, y)| swt.get_pixel(x, y)[0]).collect();
            values.sort_by(|a, b| a.total_cmp(b));
            let median = values[values.len() / 2];
            for &(x, y) in ray {
                if swt.get_pixel(x, y)[0] > median {
                    swt.put_pixel(x, y, Luma([median]));
                }
            }
        }

        for pixel in swt.pixels_mut() {
            if !pixel[0].is_finite() {
                pixel[0] = 0.0;
            }
        }
        Ok(swt)
    }

    fn connected_components(&self, strokes: &StrokeWidthMap) -> anyhow::Result<Vec<Component>> {
        let (width, height) = strokes.dimensions();
        let mask = GrayImage::from_fn(width, height, |x, y| {
            if strokes.get_pixel(x, y)[0] > 0.0 {
                Luma([255])
            } else {
                Luma([0])
            }
        });
        let labels = connected_components(&mask, Connectivity::Eight, Luma([0u8]));

        let mut points: HashMap<u32, Vec<Point>> = HashMap::new();
        for (x, y, pixel) in labels.enumerate_pixels() {
            if pixel[0] != 0 {
                points
                    .entry(pixel[0])
                    .or_default()
                    .push(Point::new(x as i32, y as i32));
            }
        }

        let mut components: Vec<Component> = points
            .into_values()
            .filter_map(|pts| {
                super::bounding_rect(&pts).map(|bounds| Component { bounds, points: pts })
            })
            .collect();
        components.sort_by_key(|c| (c.bounds.y, c.bounds.x));
        Ok(components)
    }
}
