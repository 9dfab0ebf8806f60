//! Handcrafted face descriptor.
//!
//! The face crop is normalized to a 64x64 grayscale patch and summarized by
//! block statistics, multi-scale gradients, local binary patterns, fixed
//! landmark regions and an edge-density grid. The result is a unit-length
//! vector of exactly [`HEURISTIC_DIM`] values. Output is a pure function of
//! the input pixels.

use crate::localize::FaceRegion;
use crate::types::{Embedding, HEURISTIC_DIM};
use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, RgbImage};

// --- Named constants ---
const CROP_SIZE: u32 = 128;
const PATCH_SIZE: usize = 64;
const SHARPEN_SIGMA: f32 = 1.2;
/// Fraction of pixels clipped at each end by the contrast stretch.
const STRETCH_CLIP: f64 = 0.01;
const GRID_STEP: usize = 3;
const LBP_THRESHOLD: i32 = 8;
const EDGE_CELL: usize = 8;
const EDGE_GRADIENT: i32 = 20;

/// Eye, eye, nose and mouth boxes on the 64x64 patch as (x, y, w, h).
const LANDMARK_REGIONS: [(usize, usize, usize, usize); 4] = [
    (16, 20, 12, 8),
    (36, 20, 12, 8),
    (28, 32, 8, 6),
    (24, 44, 16, 8),
];

/// Crop the face region and normalize it into the 64x64 analysis patch.
pub fn prepare_patch(image: &DynamicImage, region: FaceRegion) -> GrayImage {
    let face = image
        .crop_imm(region.x, region.y, region.width.max(1), region.height.max(1))
        .resize_to_fill(CROP_SIZE, CROP_SIZE, FilterType::Lanczos3);

    let stretched = DynamicImage::ImageRgb8(stretch_contrast(face.to_rgb8()));
    stretched
        .unsharpen(SHARPEN_SIGMA, 0)
        .resize_exact(PATCH_SIZE as u32, PATCH_SIZE as u32, FilterType::Lanczos3)
        .to_luma8()
}

/// Linear stretch so the 1st/99th luminance percentiles map to 0/255.
fn stretch_contrast(mut rgb: RgbImage) -> RgbImage {
    let mut hist = [0u64; 256];
    for pixel in rgb.pixels() {
        hist[luma(pixel.0) as usize] += 1;
    }
    let total: u64 = hist.iter().sum();
    if total == 0 {
        return rgb;
    }

    let clip = (total as f64 * STRETCH_CLIP) as u64;
    let low = percentile(&hist, clip);
    let high = percentile(&hist, total.saturating_sub(clip + 1));
    if high <= low {
        return rgb;
    }

    let scale = 255.0 / (high - low) as f32;
    for pixel in rgb.pixels_mut() {
        for c in pixel.0.iter_mut() {
            *c = ((*c as f32 - low as f32) * scale).round().clamp(0.0, 255.0) as u8;
        }
    }
    rgb
}

fn luma([r, g, b]: [u8; 3]) -> u8 {
    ((r as u32 * 299 + g as u32 * 587 + b as u32 * 114) / 1000) as u8
}

/// Smallest level whose cumulative count exceeds `rank`.
fn percentile(hist: &[u64; 256], rank: u64) -> u8 {
    let mut seen = 0u64;
    for (level, &count) in hist.iter().enumerate() {
        seen += count;
        if seen > rank {
            return level as u8;
        }
    }
    255
}

/// Raw (unnormalized) feature list for a prepared 64x64 patch.
pub fn raw_features(patch: &GrayImage) -> Vec<f64> {
    debug_assert_eq!(patch.dimensions(), (PATCH_SIZE as u32, PATCH_SIZE as u32));
    let n = PATCH_SIZE;
    let px = |x: usize, y: usize| patch.as_raw()[y * n + x] as i32;
    let mut features = Vec::with_capacity(8192);

    // block statistics
    for y in (0..n).step_by(GRID_STEP) {
        for x in (0..n).step_by(GRID_STEP) {
            let (mean, variance, skew) = block_moments(patch, x, y, GRID_STEP, GRID_STEP);
            features.push(mean / 255.0);
            features.push(variance.sqrt() / 255.0);
            features.push(skew.abs().cbrt() / 255.0);
        }
    }

    // multi-scale gradients
    for scale in 1..=3usize {
        for y in (scale..n - scale).step_by(2) {
            for x in (scale..n - scale).step_by(2) {
                let center = px(x, y);
                let (xr, yd) = ((x + scale).min(n - 1), (y + scale).min(n - 1));
                features.push((px(xr, y) - center) as f64 / 255.0);
                features.push((px(x, yd) - center) as f64 / 255.0);
                features.push((px(xr, yd) - center) as f64 / 255.0);
            }
        }
    }

    // local binary patterns
    for radius in 2..=4i32 {
        let r = radius as usize;
        let offsets = [
            (-radius, -radius),
            (-radius, 0),
            (-radius, radius),
            (0, radius),
            (radius, radius),
            (radius, 0),
            (radius, -radius),
            (0, -radius),
        ];
        for y in (r..n - r).step_by(4) {
            for x in (r..n - r).step_by(4) {
                let center = px(x, y);
                let mut pattern = 0u32;
                let mut strength = 0i32;
                let mut contrast = 0i32;

                for (bit, &(dy, dx)) in offsets.iter().enumerate() {
                    let ny = (y as i32 + dy) as usize;
                    let nx = (x as i32 + dx) as usize;
                    let diff = px(nx, ny) - center;
                    if diff.abs() > LBP_THRESHOLD {
                        if diff > 0 {
                            pattern |= 1 << bit;
                        }
                        strength += diff.abs();
                    }
                    contrast += diff.abs();
                }

                features.push(pattern as f64 / 255.0);
                features.push(strength as f64 / (255.0 * 8.0));
                features.push(contrast as f64 / (255.0 * 8.0));
            }
        }
    }

    for &(x, y, w, h) in &LANDMARK_REGIONS {
        let (mean, variance, _) = block_moments(patch, x, y, w, h);
        features.push(mean / 255.0);
        features.push(variance.sqrt() / 255.0);
    }

    // edge density grid
    for y in (0..n).step_by(EDGE_CELL) {
        for x in (0..n).step_by(EDGE_CELL) {
            let mut edges = 0u32;
            let mut total = 0u32;
            for ry in y..(y + EDGE_CELL).min(n - 1) {
                for rx in x..(x + EDGE_CELL).min(n - 1) {
                    let p = px(rx, ry);
                    let gradient = (px(rx + 1, ry) - p).abs() + (px(rx, ry + 1) - p).abs();
                    if gradient > EDGE_GRADIENT {
                        edges += 1;
                    }
                    total += 1;
                }
            }
            features.push(if total > 0 { edges as f64 / total as f64 } else { 0.0 });
        }
    }

    features
}

/// Mean, population variance and third central moment of a clipped block.
fn block_moments(patch: &GrayImage, x: usize, y: usize, w: usize, h: usize) -> (f64, f64, f64) {
    let n = PATCH_SIZE;
    let raw = patch.as_raw();
    let rows = y..(y + h).min(n);
    let cols = x..(x + w).min(n);

    let mut sum = 0.0f64;
    let mut count = 0u32;
    for ry in rows.clone() {
        for rx in cols.clone() {
            sum += raw[ry * n + rx] as f64;
            count += 1;
        }
    }
    if count == 0 {
        return (0.0, 0.0, 0.0);
    }
    let mean = sum / count as f64;

    let (mut m2, mut m3) = (0.0f64, 0.0f64);
    for ry in rows {
        for rx in cols.clone() {
            let diff = raw[ry * n + rx] as f64 - mean;
            m2 += diff * diff;
            m3 += diff * diff * diff;
        }
    }
    (mean, m2 / count as f64, m3 / count as f64)
}

/// Normalize, append summary statistics, fit to [`HEURISTIC_DIM`] and
/// re-normalize to unit length.
pub fn finalize(features: &[f64]) -> Embedding {
    let magnitude = features.iter().map(|f| f * f).sum::<f64>().sqrt();
    if magnitude == 0.0 {
        tracing::warn!("zero-magnitude descriptor");
        return Embedding::new(vec![0.0; HEURISTIC_DIM]);
    }

    let mut normalized: Vec<f64> = features.iter().map(|f| f / magnitude).collect();
    let len = normalized.len() as f64;
    let mean = normalized.iter().sum::<f64>() / len;
    let variance = normalized.iter().map(|f| (f - mean).powi(2)).sum::<f64>() / len;
    let skew = normalized.iter().map(|f| (f - mean).powi(3)).sum::<f64>() / len;
    normalized.extend([mean, variance.sqrt(), skew.abs().cbrt()]);

    normalized.resize(HEURISTIC_DIM, 0.0);

    let norm = normalized.iter().map(|f| f * f).sum::<f64>().sqrt();
    if norm == 0.0 {
        return Embedding::new(vec![0.0; HEURISTIC_DIM]);
    }
    Embedding::new(normalized.iter().map(|f| (f / norm) as f32).collect())
}

/// Full descriptor for a face region of a decoded frame.
pub fn describe(image: &DynamicImage, region: FaceRegion) -> Embedding {
    let patch = prepare_patch(image, region);
    let features = raw_features(&patch);
    tracing::trace!(raw = features.len(), "descriptor features computed");
    finalize(&features)
}
