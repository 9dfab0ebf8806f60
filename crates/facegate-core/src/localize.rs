//! Heuristic face localization.
//!
//! Strategies are tried in order and the first region found wins. The chain
//! always ends in a deterministic center crop, so localization never fails.

use image::GrayImage;
use serde::{Deserialize, Serialize};

// --- Named constants ---
const EDGE_WINDOW_DIVISOR: f32 = 2.5;
const EDGE_THRESHOLD: i32 = 15;
const STRONG_EDGE_THRESHOLD: i32 = 30;
const EDGE_ACCEPT_SCORE: f64 = 0.06;
const BRIGHTNESS_WINDOW_DIVISOR: f32 = 3.0;
const BRIGHTNESS_ACCEPT_SCORE: f64 = 0.25;
const SYMMETRY_WINDOW_DIVISOR: f32 = 3.0;
const SYMMETRY_ACCEPT_SCORE: f64 = 0.7;
const CENTER_CROP_FRACTION: f32 = 0.75;
/// Vertical placement of the center crop: the top margin is `slack / 2.8`.
const CENTER_CROP_TOP_DIVISOR: f32 = 2.8;
/// Every region is grown to at least this fraction of the shorter side.
const MIN_REGION_FRACTION: f32 = 0.3;

/// Axis-aligned face region in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// One localization strategy. Returns `None` when nothing clears its threshold.
pub trait FaceLocalizer: Send {
    fn name(&self) -> &'static str;
    fn locate(&self, gray: &GrayImage) -> Option<FaceRegion>;
}

/// Result of running the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Localized {
    pub region: FaceRegion,
    pub strategy: &'static str,
}

/// Ordered list of strategies with a center-crop fallback.
pub struct LocalizerChain {
    strategies: Vec<Box<dyn FaceLocalizer>>,
}

impl Default for LocalizerChain {
    fn default() -> Self {
        Self {
            strategies: vec![
                Box::new(EdgeDensityLocalizer),
                Box::new(BrightnessVarianceLocalizer),
                Box::new(SymmetryLocalizer),
            ],
        }
    }
}

impl LocalizerChain {
    pub fn new(strategies: Vec<Box<dyn FaceLocalizer>>) -> Self {
        Self { strategies }
    }

    /// Locate a face region. Total: falls back to the center crop.
    pub fn locate(&self, gray: &GrayImage) -> Localized {
        let (width, height) = gray.dimensions();
        for strategy in &self.strategies {
            if let Some(region) = strategy.locate(gray) {
                let region = fit_region(region, width, height);
                tracing::debug!(strategy = strategy.name(), ?region, "face localized");
                return Localized {
                    region,
                    strategy: strategy.name(),
                };
            }
        }

        let region = fit_region(center_crop(width, height), width, height);
        tracing::debug!(?region, "no strategy matched; using center crop");
        Localized {
            region,
            strategy: "center_crop",
        }
    }
}

/// Square sliding windows of side `size` stepping by a quarter side.
fn windows(width: u32, height: u32, size: u32) -> impl Iterator<Item = (u32, u32)> {
    let step = (size / 4).max(1);
    let ys = (0..height.saturating_sub(size)).step_by(step as usize);
    ys.flat_map(move |y| {
        (0..width.saturating_sub(size))
            .step_by(step as usize)
            .map(move |x| (x, y))
    })
}

fn window_size(width: u32, height: u32, divisor: f32) -> u32 {
    (width.min(height) as f32 / divisor) as u32
}

/// Scores windows by gradient density, weighting the eye, nose and mouth
/// bands of each window.
pub struct EdgeDensityLocalizer;

impl FaceLocalizer for EdgeDensityLocalizer {
    fn name(&self) -> &'static str {
        "edge_density"
    }

    fn locate(&self, gray: &GrayImage) -> Option<FaceRegion> {
        let (width, height) = gray.dimensions();
        let size = window_size(width, height, EDGE_WINDOW_DIVISOR);
        if size == 0 {
            return None;
        }

        let px = |x: u32, y: u32| gray.get_pixel(x, y)[0] as i32;
        let mut best: Option<(f64, u32, u32)> = None;

        for (x, y) in windows(width, height, size) {
            let mut edges = 0u32;
            let mut strong = 0u32;
            let mut pattern = 0.0f64;
            let mut total = 0u32;

            for ry in y..(y + size).min(height - 1) {
                let rel_y = (ry - y) as f32 / size as f32;
                for rx in x..(x + size).min(width - 1) {
                    let center = px(rx, ry);
                    let gx = (px(rx + 1, ry) - center).abs();
                    let gy = (px(rx, ry + 1) - center).abs();
                    let gradient = ((gx * gx + gy * gy) as f32).sqrt();

                    if gradient > EDGE_THRESHOLD as f32 {
                        edges += 1;
                    }
                    if gradient > STRONG_EDGE_THRESHOLD as f32 {
                        strong += 1;
                    }

                    // eyes band, nose band, mouth band
                    if rel_y < 0.4 {
                        if gradient > 20.0 {
                            pattern += 2.0;
                        }
                    } else if rel_y < 0.7 {
                        if gradient > 15.0 {
                            pattern += 1.5;
                        }
                    } else if gradient > 10.0 {
                        pattern += 1.0;
                    }
                    total += 1;
                }
            }

            if total == 0 {
                continue;
            }
            let total = total as f64;
            let score = edges as f64 / total * 0.4
                + strong as f64 / total * 0.3
                + pattern / total * 0.3;

            if best.map_or(true, |(s, _, _)| score > s) {
                best = Some((score, x, y));
            }
        }

        best.filter(|&(score, _, _)| score > EDGE_ACCEPT_SCORE)
            .map(|(_, x, y)| FaceRegion {
                x,
                y,
                width: size,
                height: size,
            })
    }
}

/// Prefers windows with mid-range brightness and moderate texture.
pub struct BrightnessVarianceLocalizer;

impl FaceLocalizer for BrightnessVarianceLocalizer {
    fn name(&self) -> &'static str {
        "brightness_variance"
    }

    fn locate(&self, gray: &GrayImage) -> Option<FaceRegion> {
        let (width, height) = gray.dimensions();
        let size = window_size(width, height, BRIGHTNESS_WINDOW_DIVISOR);
        if size == 0 {
            return None;
        }

        let mut best_score = 0.0f64;
        let mut best = None;

        for (x, y) in windows(width, height, size) {
            let (mean, variance) = window_moments(gray, x, y, size, size);

            let brightness_score = if mean > 50.0 && mean < 200.0 {
                1.0 - (mean - 125.0).abs() / 125.0
            } else {
                0.0
            };
            let texture_score = if variance > 100.0 && variance < 2000.0 {
                1.0 - (variance - 1000.0).abs() / 1000.0
            } else {
                0.0
            };
            let score = brightness_score * 0.6 + texture_score * 0.4;

            if score > best_score {
                best_score = score;
                best = Some((x, y));
            }
        }

        if best_score > BRIGHTNESS_ACCEPT_SCORE {
            best.map(|(x, y)| FaceRegion {
                x,
                y,
                width: size,
                height: size,
            })
        } else {
            None
        }
    }
}

/// Prefers the most left-right mirror-symmetric window.
pub struct SymmetryLocalizer;

impl FaceLocalizer for SymmetryLocalizer {
    fn name(&self) -> &'static str {
        "symmetry"
    }

    fn locate(&self, gray: &GrayImage) -> Option<FaceRegion> {
        let (width, height) = gray.dimensions();
        let size = window_size(width, height, SYMMETRY_WINDOW_DIVISOR);
        if size < 2 {
            return None;
        }

        let mut best_score = 0.0f64;
        let mut best = None;

        for (x, y) in windows(width, height, size) {
            let mut symmetry = 0.0f64;
            let mut count = 0u32;
            for ry in y..y + size {
                for offset in 0..size / 2 {
                    let left = gray.get_pixel(x + offset, ry)[0] as i32;
                    let right = gray.get_pixel(x + size - 1 - offset, ry)[0] as i32;
                    symmetry += 1.0 - (left - right).abs() as f64 / 255.0;
                    count += 1;
                }
            }

            let average = if count > 0 { symmetry / count as f64 } else { 0.0 };
            if average > best_score {
                best_score = average;
                best = Some((x, y));
            }
        }

        if best_score > SYMMETRY_ACCEPT_SCORE {
            best.map(|(x, y)| FaceRegion {
                x,
                y,
                width: size,
                height: size,
            })
        } else {
            None
        }
    }
}

/// Deterministic fallback: a square of 75% of the shorter side, centered
/// horizontally and placed slightly above center.
pub fn center_crop(width: u32, height: u32) -> FaceRegion {
    let side = width.min(height) as f32 * CENTER_CROP_FRACTION;
    FaceRegion {
        x: ((width as f32 - side) / 2.0).max(0.0) as u32,
        y: ((height as f32 - side) / CENTER_CROP_TOP_DIVISOR).max(0.0) as u32,
        width: side as u32,
        height: side as u32,
    }
}

/// Clamp a region into the image and grow it to the minimum size.
pub fn fit_region(region: FaceRegion, width: u32, height: u32) -> FaceRegion {
    let (w, h) = (width as i64, height as i64);
    let (rx, ry) = (region.x as i64, region.y as i64);
    let (rw, rh) = (region.width as i64, region.height as i64);

    let mut x = rx.min(w - rw).max(0);
    let mut y = ry.min(h - rh).max(0);
    let mut fw = rw.min(w - rx).max(0);
    let mut fh = rh.min(h - ry).max(0);

    let min_side = (width.min(height) as f32 * MIN_REGION_FRACTION) as i64;
    if fw < min_side {
        fw = min_side;
        x = x.min(w - min_side).max(0);
    }
    if fh < min_side {
        fh = min_side;
        y = y.min(h - min_side).max(0);
    }

    fw = fw.min(w - x).max(1);
    fh = fh.min(h - y).max(1);

    FaceRegion {
        x: x as u32,
        y: y as u32,
        width: fw as u32,
        height: fh as u32,
    }
}

/// Mean and population variance of a rectangular window.
pub(crate) fn window_moments(gray: &GrayImage, x: u32, y: u32, w: u32, h: u32) -> (f64, f64) {
    let (width, height) = gray.dimensions();
    let x_end = (x + w).min(width);
    let y_end = (y + h).min(height);

    let mut sum = 0.0f64;
    let mut count = 0u32;
    for ry in y..y_end {
        for rx in x..x_end {
            sum += gray.get_pixel(rx, ry)[0] as f64;
            count += 1;
        }
    }
    if count == 0 {
        return (0.0, 0.0);
    }
    let mean = sum / count as f64;

    let mut variance = 0.0f64;
    for ry in y..y_end {
        for rx in x..x_end {
            let diff = gray.get_pixel(rx, ry)[0] as f64 - mean;
            variance += diff * diff;
        }
    }
    (mean, variance / count as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn inside(region: FaceRegion, width: u32, height: u32) -> bool {
        region.x + region.width <= width && region.y + region.height <= height
    }

    /// Dark frame with a bright, textured, symmetric blob on the right.
    fn blob_frame() -> GrayImage {
        GrayImage::from_fn(300, 200, |x, y| {
            if (180..280).contains(&x) && (40..140).contains(&y) {
                let stripe = if (y / 4) % 2 == 0 { 150 } else { 90 };
                Luma([stripe])
            } else {
                Luma([0])
            }
        })
    }

    #[test]
    fn test_center_crop_geometry() {
        let region = center_crop(400, 300);
        assert_eq!(region.width, 225);
        assert_eq!(region.height, 225);
        assert_eq!(region.x, 87);
        assert_eq!(region.y, 26);
    }

    #[test]
    fn test_fit_region_clamps_overflow() {
        let fitted = fit_region(
            FaceRegion { x: 350, y: 250, width: 100, height: 100 },
            400,
            300,
        );
        assert!(inside(fitted, 400, 300), "{fitted:?}");
    }

    #[test]
    fn test_fit_region_enforces_minimum_size() {
        let fitted = fit_region(FaceRegion { x: 10, y: 10, width: 5, height: 5 }, 400, 300);
        assert_eq!(fitted.width, 90);
        assert_eq!(fitted.height, 90);
        assert!(inside(fitted, 400, 300));
    }

    #[test]
    fn test_chain_falls_back_to_center_crop_on_flat_frame() {
        // A flat black frame has no edges, no mid brightness; symmetry is
        // perfect but the fallback chain without strategies must still answer.
        let gray = GrayImage::from_pixel(200, 200, Luma([0]));
        let chain = LocalizerChain::new(vec![
            Box::new(EdgeDensityLocalizer),
            Box::new(BrightnessVarianceLocalizer),
        ]);
        let localized = chain.locate(&gray);
        assert_eq!(localized.strategy, "center_crop");
        assert!(inside(localized.region, 200, 200));
    }

    #[test]
    fn test_symmetry_accepts_mirror_symmetric_frame() {
        let gray = GrayImage::from_pixel(200, 200, Luma([0]));
        assert!(SymmetryLocalizer.locate(&gray).is_some());
    }

    #[test]
    fn test_brightness_prefers_textured_window() {
        let gray = blob_frame();
        let region = BrightnessVarianceLocalizer.locate(&gray).expect("blob should be found");
        assert!(region.x >= 150, "{region:?}");
    }

    #[test]
    fn test_edge_density_finds_striped_blob() {
        let gray = blob_frame();
        let region = EdgeDensityLocalizer.locate(&gray).expect("stripes are edge dense");
        assert!(region.x + region.width > 180, "{region:?}");
    }

    #[test]
    fn test_tiny_frame_never_fails() {
        let gray = GrayImage::from_pixel(3, 3, Luma([128]));
        let localized = LocalizerChain::default().locate(&gray);
        assert!(inside(localized.region, 3, 3));
        assert!(localized.region.width >= 1);
    }

    #[test]
    fn test_window_moments() {
        let gray = GrayImage::from_fn(4, 1, |x, _| Luma([if x < 2 { 0 } else { 100 }]));
        let (mean, variance) = window_moments(&gray, 0, 0, 4, 1);
        assert!((mean - 50.0).abs() < 1e-9);
        assert!((variance - 2500.0).abs() < 1e-9);
    }
}
