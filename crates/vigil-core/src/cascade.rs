//! Classical face locator: a boosted-style cascade of Haar-like contrast
//! features evaluated over an integral image.
//!
//! Each stage compares the mean luminance of "bright" bands against "dark"
//! bands of a square window, normalised by the window standard deviation.
//! A window is a hit only if it survives every stage. Hits are grouped by
//! similarity and the largest group with enough neighbours wins.

use image::imageops::FilterType;
use image::GrayImage;

use crate::types::{FaceRegion, PixelBuffer};

/// Longest side of the frame the cascade actually scans.
const MAX_SCAN_SIDE: u32 = 320;
/// Flat windows (walls, blank screens) are rejected before any feature.
const MIN_WINDOW_STDDEV: f64 = 10.0;
/// Relative tolerance used when grouping overlapping hits.
const GROUP_EPS: f32 = 0.2;

/// Multi-scale scan parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CascadeParams {
    pub scale_factor: f32,
    pub min_neighbors: usize,
    pub min_size: u32,
}

impl CascadeParams {
    /// Tight first pass.
    pub const STRICT: Self = Self {
        scale_factor: 1.05,
        min_neighbors: 3,
        min_size: 80,
    };

    /// Looser retry when the strict pass finds nothing.
    pub const LOOSE: Self = Self {
        scale_factor: 1.1,
        min_neighbors: 2,
        min_size: 60,
    };
}

/// Rectangle in window-relative coordinates (fractions of the side).
#[derive(Debug, Clone, Copy)]
struct Band {
    x0: f32,
    y0: f32,
    x1: f32,
    y1: f32,
}

const fn band(x0: f32, y0: f32, x1: f32, y1: f32) -> Band {
    Band { x0, y0, x1, y1 }
}

const FOREHEAD: Band = band(0.15, 0.05, 0.85, 0.20);
const EYE_BAND: Band = band(0.10, 0.22, 0.90, 0.42);
const LEFT_EYE: Band = band(0.12, 0.22, 0.40, 0.42);
const RIGHT_EYE: Band = band(0.60, 0.22, 0.88, 0.42);
const NOSE_BRIDGE: Band = band(0.42, 0.22, 0.58, 0.42);
const CHEEKS: Band = band(0.10, 0.48, 0.90, 0.66);
const MOUTH: Band = band(0.28, 0.70, 0.72, 0.84);

struct Stage {
    bright: &'static [Band],
    dark: &'static [Band],
    /// Minimum (mean(bright) - mean(dark)) / window stddev.
    min_contrast: f64,
}

const STAGES: &[Stage] = &[
    Stage {
        bright: &[CHEEKS],
        dark: &[EYE_BAND],
        min_contrast: 0.25,
    },
    Stage {
        bright: &[FOREHEAD],
        dark: &[EYE_BAND],
        min_contrast: 0.20,
    },
    Stage {
        bright: &[NOSE_BRIDGE],
        dark: &[LEFT_EYE, RIGHT_EYE],
        min_contrast: 0.20,
    },
    Stage {
        bright: &[CHEEKS],
        dark: &[MOUTH],
        min_contrast: 0.10,
    },
];

/// Summed-area tables of pixel values and squared values.
struct IntegralImage {
    stride: usize,
    sum: Vec<u64>,
    sq_sum: Vec<u64>,
}

impl IntegralImage {
    fn new(gray: &GrayImage) -> Self {
        let (w, h) = (gray.width() as usize, gray.height() as usize);
        let stride = w + 1;
        let mut sum = vec![0u64; stride * (h + 1)];
        let mut sq_sum = vec![0u64; stride * (h + 1)];
        for y in 0..h {
            let mut row = 0u64;
            let mut row_sq = 0u64;
            for x in 0..w {
                let v = u64::from(gray.get_pixel(x as u32, y as u32)[0]);
                row += v;
                row_sq += v * v;
                let idx = (y + 1) * stride + x + 1;
                sum[idx] = sum[idx - stride] + row;
                sq_sum[idx] = sq_sum[idx - stride] + row_sq;
            }
        }
        Self { stride, sum, sq_sum }
    }

    fn rect(table: &[u64], stride: usize, x: usize, y: usize, w: usize, h: usize) -> u64 {
        let a = table[y * stride + x];
        let b = table[y * stride + x + w];
        let c = table[(y + h) * stride + x];
        let d = table[(y + h) * stride + x + w];
        d + a - b - c
    }

    fn sum(&self, x: usize, y: usize, w: usize, h: usize) -> u64 {
        Self::rect(&self.sum, self.stride, x, y, w, h)
    }

    fn sq_sum(&self, x: usize, y: usize, w: usize, h: usize) -> u64 {
        Self::rect(&self.sq_sum, self.stride, x, y, w, h)
    }
}

/// Haar-feature cascade locator. Stateless; safe to share across threads.
#[derive(Debug, Clone, Default)]
pub struct CascadeLocator;

impl CascadeLocator {
    pub fn new() -> Self {
        Self
    }

    /// Strict pass, then loose pass. Returns the single most prominent face.
    pub fn locate(&self, image: &PixelBuffer) -> Option<FaceRegion> {
        let gray = image.to_gray();
        self.detect(&gray, CascadeParams::STRICT).or_else(|| {
            tracing::debug!("cascade strict pass found nothing, retrying with loose parameters");
            self.detect(&gray, CascadeParams::LOOSE)
        })
    }

    /// Run one multi-scale pass over a grayscale frame.
    pub fn detect(&self, gray: &GrayImage, params: CascadeParams) -> Option<FaceRegion> {
        let longest = gray.width().max(gray.height());
        let (scan, scale_back) = if longest > MAX_SCAN_SIDE {
            let factor = MAX_SCAN_SIDE as f32 / longest as f32;
            let w = ((gray.width() as f32 * factor).round() as u32).max(1);
            let h = ((gray.height() as f32 * factor).round() as u32).max(1);
            (
                image::imageops::resize(gray, w, h, FilterType::Triangle),
                1.0 / factor,
            )
        } else {
            (gray.clone(), 1.0)
        };

        // Minimum size is expressed in original-frame pixels.
        let min_size = ((params.min_size as f32 / scale_back).round() as u32).max(24);
        let hits = scan_windows(&scan, min_size, params.scale_factor);
        let best = group_hits(&hits, params.min_neighbors)?;

        Some(FaceRegion {
            x: best.x * scale_back,
            y: best.y * scale_back,
            width: best.width * scale_back,
            height: best.height * scale_back,
            confidence: best.confidence,
            landmarks: None,
        })
    }
}

fn scan_windows(gray: &GrayImage, min_size: u32, scale_factor: f32) -> Vec<FaceRegion> {
    let (w, h) = (gray.width() as usize, gray.height() as usize);
    let integral = IntegralImage::new(gray);
    let mut hits = Vec::new();

    let mut size_f = min_size as f32;
    while (size_f as usize) <= w.min(h) {
        let size = size_f as usize;
        let step = ((size as f32 * 0.05) as usize).max(2);
        let mut y = 0;
        while y + size <= h {
            let mut x = 0;
            while x + size <= w {
                if window_passes(&integral, x, y, size) {
                    hits.push(FaceRegion {
                        x: x as f32,
                        y: y as f32,
                        width: size as f32,
                        height: size as f32,
                        confidence: 0.0,
                        landmarks: None,
                    });
                }
                x += step;
            }
            y += step;
        }
        size_f *= scale_factor.max(1.01);
    }

    hits
}

fn window_passes(integral: &IntegralImage, x: usize, y: usize, size: usize) -> bool {
    let n = (size * size) as f64;
    let mean = integral.sum(x, y, size, size) as f64 / n;
    let variance = integral.sq_sum(x, y, size, size) as f64 / n - mean * mean;
    let stddev = variance.max(0.0).sqrt();
    if stddev < MIN_WINDOW_STDDEV {
        return false;
    }

    STAGES.iter().all(|stage| {
        let bright = bands_mean(integral, x, y, size, stage.bright);
        let dark = bands_mean(integral, x, y, size, stage.dark);
        (bright - dark) / stddev >= stage.min_contrast
    })
}

fn bands_mean(integral: &IntegralImage, x: usize, y: usize, size: usize, bands: &[Band]) -> f64 {
    let mut total = 0u64;
    let mut area = 0usize;
    for b in bands {
        let bx0 = (b.x0 * size as f32).round() as usize;
        let by0 = (b.y0 * size as f32).round() as usize;
        let bx1 = ((b.x1 * size as f32).round() as usize).max(bx0 + 1).min(size);
        let by1 = ((b.y1 * size as f32).round() as usize).max(by0 + 1).min(size);
        total += integral.sum(x + bx0, y + by0, bx1 - bx0, by1 - by0);
        area += (bx1 - bx0) * (by1 - by0);
    }
    total as f64 / area.max(1) as f64
}

fn similar(a: &FaceRegion, b: &FaceRegion) -> bool {
    let delta = GROUP_EPS * (a.width.min(b.width) + a.height.min(b.height)) * 0.5;
    (a.x - b.x).abs() <= delta
        && (a.y - b.y).abs() <= delta
        && (a.x + a.width - b.x - b.width).abs() <= delta
        && (a.y + a.height - b.y - b.height).abs() <= delta
}

/// Partition hits into similarity classes and return the averaged rectangle
/// of the largest-area class with at least `min_neighbors` members.
fn group_hits(hits: &[FaceRegion], min_neighbors: usize) -> Option<FaceRegion> {
    let mut labels: Vec<usize> = (0..hits.len()).collect();

    fn root(labels: &mut [usize], mut i: usize) -> usize {
        while labels[i] != i {
            labels[i] = labels[labels[i]];
            i = labels[i];
        }
        i
    }

    for i in 0..hits.len() {
        for j in (i + 1)..hits.len() {
            if similar(&hits[i], &hits[j]) {
                let (ri, rj) = (root(&mut labels, i), root(&mut labels, j));
                if ri != rj {
                    labels[rj] = ri;
                }
            }
        }
    }

    let mut groups: std::collections::HashMap<usize, Vec<&FaceRegion>> = Default::default();
    for i in 0..hits.len() {
        let r = root(&mut labels, i);
        groups.entry(r).or_default().push(&hits[i]);
    }

    groups
        .into_values()
        .filter(|members| members.len() >= min_neighbors.max(1))
        .map(|members| {
            let n = members.len() as f32;
            let sum = |f: fn(&FaceRegion) -> f32| members.iter().map(|r| f(r)).sum::<f32>() / n;
            FaceRegion {
                x: sum(|r| r.x),
                y: sum(|r| r.y),
                width: sum(|r| r.width),
                height: sum(|r| r.height),
                confidence: n / (n + min_neighbors.max(1) as f32),
                landmarks: None,
            }
        })
        .max_by(|a, b| {
            a.area()
                .total_cmp(&b.area())
                .then(a.confidence.total_cmp(&b.confidence))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Luma, Rgb, RgbImage};

    /// Paint a schematic face: bright skin square with dark eyes and mouth.
    fn synthetic_face(size: u32, face_x: u32, face_y: u32, face: u32) -> RgbImage {
        let mut img = RgbImage::from_pixel(size, size, Rgb([100, 100, 100]));
        let f = face as f32;
        let paint = |img: &mut RgbImage, x0: f32, y0: f32, x1: f32, y1: f32, v: u8| {
            for y in (face_y + (y0 * f) as u32)..(face_y + (y1 * f) as u32) {
                for x in (face_x + (x0 * f) as u32)..(face_x + (x1 * f) as u32) {
                    img.put_pixel(x, y, Rgb([v, v, v]));
                }
            }
        };
        paint(&mut img, 0.0, 0.0, 1.0, 1.0, 200);
        paint(&mut img, 0.15, 0.25, 0.375, 0.40, 40);
        paint(&mut img, 0.625, 0.25, 0.85, 0.40, 40);
        paint(&mut img, 0.325, 0.725, 0.675, 0.825, 60);
        img
    }

    #[test]
    fn test_finds_synthetic_face() {
        let img = synthetic_face(200, 60, 60, 80);
        let face = CascadeLocator::new()
            .locate(&PixelBuffer::new(img))
            .expect("face should be found");
        let cx = face.x + face.width / 2.0;
        let cy = face.y + face.height / 2.0;
        assert!((cx - 100.0).abs() < 15.0, "cx = {cx}");
        assert!((cy - 100.0).abs() < 15.0, "cy = {cy}");
        assert!(face.width > 60.0 && face.width < 120.0, "width = {}", face.width);
        assert!(face.confidence > 0.0 && face.confidence <= 1.0);
    }

    #[test]
    fn test_flat_frame_has_no_face() {
        let img = RgbImage::from_pixel(240, 180, Rgb([128, 128, 128]));
        assert!(CascadeLocator::new().locate(&PixelBuffer::new(img)).is_none());
    }

    #[test]
    fn test_frame_smaller_than_min_size() {
        let img = RgbImage::from_pixel(40, 40, Rgb([10, 200, 10]));
        assert!(CascadeLocator::new().locate(&PixelBuffer::new(img)).is_none());
    }

    #[test]
    fn test_integral_sums() {
        let gray = GrayImage::from_fn(4, 3, |x, y| Luma([(x + y * 4) as u8]));
        let integral = IntegralImage::new(&gray);
        // Full image: 0..12 summed.
        assert_eq!(integral.sum(0, 0, 4, 3), 66);
        // Bottom-right 2x2: 6 + 7 + 10 + 11
        assert_eq!(integral.sum(2, 1, 2, 2), 34);
        assert_eq!(integral.sq_sum(1, 0, 1, 1), 1);
    }

    #[test]
    fn test_grouping_requires_neighbours() {
        let r = |x: f32| FaceRegion {
            x,
            y: 0.0,
            width: 50.0,
            height: 50.0,
            confidence: 0.0,
            landmarks: None,
        };
        let hits = vec![r(0.0), r(2.0), r(4.0), r(200.0)];
        let best = group_hits(&hits, 3).unwrap();
        assert!((best.x - 2.0).abs() < 1e-4);
        assert!(group_hits(&hits, 4).is_none());
    }
}
