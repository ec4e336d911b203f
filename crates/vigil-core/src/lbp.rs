//! Local Binary Pattern grid histograms for the classical pipeline.
//!
//! The face crop is shrunk 5% inward, resized to 128×128, converted to
//! luminance and histogram-equalized. Each interior pixel gets an 8-bit
//! code (one bit per neighbour at least as bright as the centre). The code
//! image is split into an 8×8 grid and each cell contributes a 16-bin
//! normalized histogram of `code >> 4`.

use image::imageops::FilterType;
use image::GrayImage;
use thiserror::Error;

use crate::types::{FaceEncoding, FaceRegion, PixelBuffer, HISTOGRAM_DIM, LBP_BINS, LBP_GRID};

const FACE_MARGIN: f32 = 0.05;
const FACE_SIDE: u32 = 128;
const CELL_EPSILON: f32 = 1e-7;

#[derive(Error, Debug)]
pub enum LbpError {
    #[error("face region lies outside the image")]
    EmptyRegion,
}

/// Stretch the intensity histogram across the full 0..=255 range.
pub fn equalize_histogram(gray: &GrayImage) -> GrayImage {
    let mut hist = [0u32; 256];
    for p in gray.pixels() {
        hist[p[0] as usize] += 1;
    }

    let total: u32 = hist.iter().sum();
    let cdf_min = hist.iter().copied().find(|&c| c > 0).unwrap_or(0);
    if total == 0 || total == cdf_min {
        // Single intensity: nothing to stretch.
        return gray.clone();
    }

    let mut lut = [0u8; 256];
    let mut cdf = 0u32;
    let scale = 255.0 / (total - cdf_min) as f32;
    for (value, count) in hist.iter().enumerate() {
        cdf += count;
        lut[value] = ((cdf.saturating_sub(cdf_min)) as f32 * scale).round().clamp(0.0, 255.0) as u8;
    }

    let mut out = gray.clone();
    for p in out.pixels_mut() {
        p[0] = lut[p[0] as usize];
    }
    out
}

/// 8-neighbour LBP codes for the interior of `gray`, row-major,
/// `(w - 2) × (h - 2)` entries.
pub fn lbp_codes(gray: &GrayImage) -> (Vec<u8>, u32, u32) {
    let (w, h) = gray.dimensions();
    if w < 3 || h < 3 {
        return (Vec::new(), 0, 0);
    }

    // Clockwise from top-left, most significant bit first.
    const NEIGHBOURS: [(i32, i32); 8] = [
        (-1, -1),
        (0, -1),
        (1, -1),
        (1, 0),
        (1, 1),
        (0, 1),
        (-1, 1),
        (-1, 0),
    ];

    let mut codes = Vec::with_capacity(((w - 2) * (h - 2)) as usize);
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let center = gray.get_pixel(x, y)[0];
            let mut code = 0u8;
            for (bit, (dx, dy)) in NEIGHBOURS.iter().enumerate() {
                let nx = (x as i32 + dx) as u32;
                let ny = (y as i32 + dy) as u32;
                if gray.get_pixel(nx, ny)[0] >= center {
                    code |= 1 << (7 - bit);
                }
            }
            codes.push(code);
        }
    }
    (codes, w - 2, h - 2)
}

/// Normalized 8×8 grid of 16-bin LBP histograms (1024 values).
pub fn grid_histogram(gray: &GrayImage) -> Vec<f32> {
    let (codes, cw, ch) = lbp_codes(gray);
    let mut features = vec![0.0f32; HISTOGRAM_DIM];
    if cw == 0 || ch == 0 {
        return features;
    }

    let grid = LBP_GRID as u32;
    let cell_w = (cw / grid).max(1);
    let cell_h = (ch / grid).max(1);

    for gy in 0..grid {
        for gx in 0..grid {
            let offset = ((gy * grid + gx) as usize) * LBP_BINS;
            let cell = &mut features[offset..offset + LBP_BINS];
            for y in (gy * cell_h)..((gy + 1) * cell_h).min(ch) {
                for x in (gx * cell_w)..((gx + 1) * cell_w).min(cw) {
                    let code = codes[(y * cw + x) as usize];
                    cell[(code >> 4) as usize] += 1.0;
                }
            }
            let total: f32 = cell.iter().sum::<f32>() + CELL_EPSILON;
            for v in cell.iter_mut() {
                *v /= total;
            }
        }
    }
    features
}

/// Compute the 1024-value histogram encoding of the face in `region`.
pub fn extract_histogram(image: &PixelBuffer, region: &FaceRegion) -> Result<FaceEncoding, LbpError> {
    let crop = image
        .crop_gray(region, FACE_MARGIN)
        .ok_or(LbpError::EmptyRegion)?;
    let resized = image::imageops::resize(&crop, FACE_SIDE, FACE_SIDE, FilterType::Triangle);
    let equalized = equalize_histogram(&resized);
    Ok(FaceEncoding::new(grid_histogram(&equalized)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Luma, Rgb, RgbImage};

    fn textured(w: u32, h: u32) -> RgbImage {
        RgbImage::from_fn(w, h, |x, y| {
            let v = ((x * 37 + y * 91) % 251) as u8;
            Rgb([v, v / 2, 255 - v])
        })
    }

    fn whole(w: u32, h: u32) -> FaceRegion {
        FaceRegion {
            x: 0.0,
            y: 0.0,
            width: w as f32,
            height: h as f32,
            confidence: 1.0,
            landmarks: None,
        }
    }

    #[test]
    fn test_histogram_shape_and_cell_mass() {
        let encoding = extract_histogram(&PixelBuffer::new(textured(160, 160)), &whole(160, 160)).unwrap();
        assert_eq!(encoding.len(), HISTOGRAM_DIM);
        for cell in encoding.values().chunks(LBP_BINS) {
            let mass: f32 = cell.iter().sum();
            assert!((mass - 1.0).abs() < 1e-4, "cell mass {mass}");
            assert!(cell.iter().all(|v| *v >= 0.0));
        }
    }

    #[test]
    fn test_same_image_same_histogram() {
        let img = PixelBuffer::new(textured(140, 150));
        let a = extract_histogram(&img, &whole(140, 150)).unwrap();
        let b = extract_histogram(&img, &whole(140, 150)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_region_outside_image() {
        let img = PixelBuffer::new(textured(50, 50));
        let region = FaceRegion {
            x: 100.0,
            ..whole(20, 20)
        };
        assert!(matches!(
            extract_histogram(&img, &region),
            Err(LbpError::EmptyRegion)
        ));
    }

    #[test]
    fn test_flat_patch_codes_all_ones() {
        let gray = GrayImage::from_pixel(5, 5, Luma([90]));
        let (codes, w, h) = lbp_codes(&gray);
        assert_eq!((w, h), (3, 3));
        assert!(codes.iter().all(|&c| c == 0xFF));
    }

    #[test]
    fn test_lbp_bit_order() {
        // Only the top-left neighbour is brighter than the centre.
        let mut gray = GrayImage::from_pixel(3, 3, Luma([10]));
        gray.put_pixel(1, 1, Luma([50]));
        gray.put_pixel(0, 0, Luma([80]));
        let (codes, _, _) = lbp_codes(&gray);
        assert_eq!(codes, vec![0b1000_0000]);
    }

    #[test]
    fn test_equalize_stretches_range() {
        let gray = GrayImage::from_fn(16, 16, |x, _| Luma([100 + (x as u8)]));
        let eq = equalize_histogram(&gray);
        let min = eq.pixels().map(|p| p[0]).min().unwrap();
        let max = eq.pixels().map(|p| p[0]).max().unwrap();
        assert_eq!(min, 0);
        assert_eq!(max, 255);

        let flat = GrayImage::from_pixel(8, 8, Luma([42]));
        assert_eq!(equalize_histogram(&flat), flat);
    }
}
