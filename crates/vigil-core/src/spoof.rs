//! Passive replay detection on a single frame.
//!
//! Six weak signals are measured on the grayscale face crop. Every signal
//! has a hard gate; the frame is accepted only if all gates pass. The
//! weighted confidence is reported for diagnostics and never overrides a
//! failed gate.
//!
//! # Threat Coverage
//!
//! - **Blocks:** blurry re-photographs, washed-out prints, screens with
//!   glare or moiré, heavily compressed replays.
//! - **Does not block:** high-quality 3D masks or sharp, well-lit prints.

use image::imageops::FilterType;
use image::GrayImage;
use serde::Serialize;
use thiserror::Error;

use crate::lbp::lbp_codes;
use crate::spectrum;
use crate::types::{FaceRegion, PixelBuffer};

const MAX_ANALYSIS_SIDE: u32 = 256;
const MIN_ANALYSIS_SIDE: u32 = 16;
const SOBEL_EDGE_MAGNITUDE: f64 = 100.0;
const GLARE_LEVEL: u8 = 240;

#[derive(Error, Debug)]
pub enum SpoofError {
    #[error("face region lies outside the image")]
    EmptyRegion,
    #[error("face crop too small for analysis: {0}x{1}")]
    TooSmall(u32, u32),
}

/// Gate values. A frame fails a gate when its metric is on the wrong side.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpoofThresholds {
    /// Reject if Laplacian variance ≤ this.
    pub min_laplacian_variance: f64,
    /// Reject if luminance standard deviation ≤ this.
    pub min_contrast: f64,
    /// Reject if LBP code entropy (bits) ≤ this.
    pub min_lbp_entropy: f64,
    /// Accepted band for the share of strong Sobel edges.
    pub edge_density_band: (f64, f64),
    /// Reject if the share of near-white pixels exceeds this.
    pub max_glare_ratio: f64,
    /// Reject if the low-frequency energy share is at least this.
    pub max_low_frequency_ratio: f64,
    /// Reject if a spectral peak is at least this many times the mean.
    pub max_peak_to_mean: f64,
}

impl Default for SpoofThresholds {
    fn default() -> Self {
        Self {
            min_laplacian_variance: 90.0,
            min_contrast: 35.0,
            min_lbp_entropy: 4.8,
            edge_density_band: (0.07, 0.22),
            max_glare_ratio: 0.04,
            max_low_frequency_ratio: 0.88,
            max_peak_to_mean: 30.0,
        }
    }
}

/// Raw measurements for one face crop.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SpoofMetrics {
    pub laplacian_variance: f64,
    pub contrast: f64,
    pub lbp_entropy: f64,
    pub edge_density: f64,
    pub glare_ratio: f64,
    pub low_frequency_ratio: f64,
    pub peak_to_mean: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpoofAssessment {
    pub is_real: bool,
    /// Weighted score in [0, 1]; 0 when analysis could not run.
    pub confidence: f32,
    pub metrics: Option<SpoofMetrics>,
    /// Names of the gates that failed.
    pub reasons: Vec<&'static str>,
}

impl SpoofAssessment {
    /// Deny-by-default verdict for frames that could not be analysed.
    pub fn rejected(reason: &'static str) -> Self {
        Self {
            is_real: false,
            confidence: 0.0,
            metrics: None,
            reasons: vec![reason],
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SpoofAnalyzer {
    thresholds: SpoofThresholds,
}

impl SpoofAnalyzer {
    pub fn new(thresholds: SpoofThresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &SpoofThresholds {
        &self.thresholds
    }

    /// Analyse the face in `region`. Any processing failure is a rejection.
    pub fn analyze(&self, image: &PixelBuffer, region: &FaceRegion) -> SpoofAssessment {
        match measure(image, region) {
            Ok(metrics) => {
                let assessment = self.evaluate(&metrics);
                tracing::debug!(
                    is_real = assessment.is_real,
                    confidence = assessment.confidence,
                    laplacian = metrics.laplacian_variance,
                    contrast = metrics.contrast,
                    entropy = metrics.lbp_entropy,
                    edges = metrics.edge_density,
                    glare = metrics.glare_ratio,
                    low_freq = metrics.low_frequency_ratio,
                    peak = metrics.peak_to_mean,
                    "spoof analysis"
                );
                assessment
            }
            Err(e) => {
                tracing::warn!(error = %e, "spoof analysis failed, rejecting frame");
                SpoofAssessment::rejected("analysis_failed")
            }
        }
    }

    /// Apply the gates and weights to precomputed metrics.
    pub fn evaluate(&self, m: &SpoofMetrics) -> SpoofAssessment {
        let t = &self.thresholds;
        let mut reasons = Vec::new();

        if m.laplacian_variance <= t.min_laplacian_variance {
            reasons.push("low_texture");
        }
        if m.contrast <= t.min_contrast {
            reasons.push("low_contrast");
        }
        if m.lbp_entropy <= t.min_lbp_entropy {
            reasons.push("low_entropy");
        }
        let (edge_lo, edge_hi) = t.edge_density_band;
        let edges_ok = m.edge_density >= edge_lo && m.edge_density <= edge_hi;
        if !edges_ok {
            reasons.push("edge_density");
        }
        if m.glare_ratio > t.max_glare_ratio {
            reasons.push("glare");
        }
        if m.low_frequency_ratio >= t.max_low_frequency_ratio {
            reasons.push("low_frequency");
        }
        if m.peak_to_mean >= t.max_peak_to_mean {
            reasons.push("periodic_pattern");
        }

        let texture = (m.laplacian_variance / 300.0).min(1.0);
        let contrast = (m.contrast / 60.0).min(1.0);
        let entropy = (m.lbp_entropy / 8.0).min(1.0);
        let edges = if edges_ok { 1.0 } else { 0.0 };
        let glare = 1.0 - (m.glare_ratio / t.max_glare_ratio).min(1.0);
        let spectrum = (1.0 - m.low_frequency_ratio).clamp(0.0, 1.0);

        let confidence = 0.30 * texture
            + 0.15 * contrast
            + 0.20 * entropy
            + 0.15 * edges
            + 0.10 * glare
            + 0.10 * spectrum;

        SpoofAssessment {
            is_real: reasons.is_empty(),
            confidence: confidence.clamp(0.0, 1.0) as f32,
            metrics: Some(*m),
            reasons,
        }
    }
}

/// Compute all metrics for the face crop.
pub fn measure(image: &PixelBuffer, region: &FaceRegion) -> Result<SpoofMetrics, SpoofError> {
    let crop = image.crop_gray(region, 0.0).ok_or(SpoofError::EmptyRegion)?;
    let gray = shrink_to(&crop, MAX_ANALYSIS_SIDE);
    let (w, h) = gray.dimensions();
    if w < MIN_ANALYSIS_SIDE || h < MIN_ANALYSIS_SIDE {
        return Err(SpoofError::TooSmall(w, h));
    }

    let stats = spectrum::analyze(&gray);
    Ok(SpoofMetrics {
        laplacian_variance: laplacian_variance(&gray),
        contrast: luminance_std(&gray),
        lbp_entropy: lbp_entropy(&gray),
        edge_density: edge_density(&gray),
        glare_ratio: glare_ratio(&gray),
        low_frequency_ratio: stats.low_frequency_ratio,
        peak_to_mean: stats.peak_to_mean,
    })
}

fn shrink_to(gray: &GrayImage, max_side: u32) -> GrayImage {
    let (w, h) = gray.dimensions();
    let longest = w.max(h);
    if longest <= max_side {
        return gray.clone();
    }
    let scale = max_side as f32 / longest as f32;
    let nw = ((w as f32 * scale).round() as u32).max(1);
    let nh = ((h as f32 * scale).round() as u32).max(1);
    image::imageops::resize(gray, nw, nh, FilterType::Triangle)
}

fn px(gray: &GrayImage, x: u32, y: u32) -> f64 {
    f64::from(gray.get_pixel(x, y)[0])
}

fn mean_and_variance(values: impl Iterator<Item = f64>) -> (f64, f64) {
    let mut n = 0usize;
    let mut sum = 0.0;
    let mut sq = 0.0;
    for v in values {
        n += 1;
        sum += v;
        sq += v * v;
    }
    if n == 0 {
        return (0.0, 0.0);
    }
    let mean = sum / n as f64;
    (mean, (sq / n as f64 - mean * mean).max(0.0))
}

/// Variance of the 4-neighbour Laplacian response over interior pixels.
pub fn laplacian_variance(gray: &GrayImage) -> f64 {
    let (w, h) = gray.dimensions();
    let responses = (1..h.saturating_sub(1)).flat_map(|y| {
        (1..w.saturating_sub(1)).map(move |x| {
            px(gray, x, y - 1) + px(gray, x, y + 1) + px(gray, x - 1, y) + px(gray, x + 1, y)
                - 4.0 * px(gray, x, y)
        })
    });
    mean_and_variance(responses).1
}

pub fn luminance_std(gray: &GrayImage) -> f64 {
    mean_and_variance(gray.pixels().map(|p| f64::from(p[0]))).1.sqrt()
}

/// Shannon entropy (bits) of the 256-bin LBP code histogram.
pub fn lbp_entropy(gray: &GrayImage) -> f64 {
    let (codes, _, _) = lbp_codes(gray);
    if codes.is_empty() {
        return 0.0;
    }
    let mut hist = [0u32; 256];
    for c in &codes {
        hist[*c as usize] += 1;
    }
    let total = codes.len() as f64;
    hist.iter()
        .filter(|&&c| c > 0)
        .map(|&c| {
            let p = c as f64 / total;
            -p * p.log2()
        })
        .sum()
}

/// Share of interior pixels whose Sobel gradient magnitude exceeds the edge level.
pub fn edge_density(gray: &GrayImage) -> f64 {
    let (w, h) = gray.dimensions();
    if w < 3 || h < 3 {
        return 0.0;
    }
    let mut strong = 0usize;
    let mut total = 0usize;
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let gx = px(gray, x + 1, y - 1) + 2.0 * px(gray, x + 1, y) + px(gray, x + 1, y + 1)
                - px(gray, x - 1, y - 1)
                - 2.0 * px(gray, x - 1, y)
                - px(gray, x - 1, y + 1);
            let gy = px(gray, x - 1, y + 1) + 2.0 * px(gray, x, y + 1) + px(gray, x + 1, y + 1)
                - px(gray, x - 1, y - 1)
                - 2.0 * px(gray, x, y - 1)
                - px(gray, x + 1, y - 1);
            if (gx * gx + gy * gy).sqrt() > SOBEL_EDGE_MAGNITUDE {
                strong += 1;
            }
            total += 1;
        }
    }
    strong as f64 / total as f64
}

pub fn glare_ratio(gray: &GrayImage) -> f64 {
    let total = (gray.width() * gray.height()) as f64;
    if total == 0.0 {
        return 0.0;
    }
    gray.pixels().filter(|p| p[0] >= GLARE_LEVEL).count() as f64 / total
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Luma, Rgb, RgbImage};

    fn passing_metrics() -> SpoofMetrics {
        SpoofMetrics {
            laplacian_variance: 400.0,
            contrast: 70.0,
            lbp_entropy: 6.5,
            edge_density: 0.12,
            glare_ratio: 0.0,
            low_frequency_ratio: 0.5,
            peak_to_mean: 8.0,
        }
    }

    fn region(w: u32, h: u32) -> FaceRegion {
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
    fn test_all_gates_pass() {
        let a = SpoofAnalyzer::default().evaluate(&passing_metrics());
        assert!(a.is_real);
        assert!(a.reasons.is_empty());
        // 0.30 + 0.15 + 0.20*0.8125 + 0.15 + 0.10 + 0.10*0.5
        assert!((a.confidence - 0.9125).abs() < 1e-4, "{}", a.confidence);
    }

    #[test]
    fn test_single_gate_failure_rejects() {
        let analyzer = SpoofAnalyzer::default();
        let cases: Vec<(SpoofMetrics, &str)> = vec![
            (SpoofMetrics { laplacian_variance: 90.0, ..passing_metrics() }, "low_texture"),
            (SpoofMetrics { contrast: 20.0, ..passing_metrics() }, "low_contrast"),
            (SpoofMetrics { lbp_entropy: 4.8, ..passing_metrics() }, "low_entropy"),
            (SpoofMetrics { edge_density: 0.05, ..passing_metrics() }, "edge_density"),
            (SpoofMetrics { edge_density: 0.30, ..passing_metrics() }, "edge_density"),
            (SpoofMetrics { glare_ratio: 0.05, ..passing_metrics() }, "glare"),
            (SpoofMetrics { low_frequency_ratio: 0.88, ..passing_metrics() }, "low_frequency"),
            (SpoofMetrics { peak_to_mean: 30.0, ..passing_metrics() }, "periodic_pattern"),
        ];
        for (metrics, reason) in cases {
            let a = analyzer.evaluate(&metrics);
            assert!(!a.is_real, "{reason} should reject");
            assert_eq!(a.reasons, vec![reason]);
        }
    }

    #[test]
    fn test_high_confidence_does_not_override_gate() {
        let metrics = SpoofMetrics {
            glare_ratio: 0.041,
            ..passing_metrics()
        };
        let a = SpoofAnalyzer::default().evaluate(&metrics);
        assert!(a.confidence > 0.7);
        assert!(!a.is_real);
    }

    #[test]
    fn test_flat_crop_rejected() {
        let img = PixelBuffer::new(RgbImage::from_pixel(100, 100, Rgb([120, 120, 120])));
        let a = SpoofAnalyzer::default().analyze(&img, &region(100, 100));
        assert!(!a.is_real);
        assert!(a.reasons.contains(&"low_texture"));
        assert!(a.reasons.contains(&"low_contrast"));
    }

    #[test]
    fn test_unanalysable_region_denied() {
        let img = PixelBuffer::new(RgbImage::from_pixel(100, 100, Rgb([120, 120, 120])));
        let outside = FaceRegion {
            x: 500.0,
            ..region(10, 10)
        };
        let a = SpoofAnalyzer::default().analyze(&img, &outside);
        assert!(!a.is_real);
        assert_eq!(a.confidence, 0.0);
        assert!(a.metrics.is_none());

        let tiny = region(8, 8);
        assert!(!SpoofAnalyzer::default().analyze(&img, &tiny).is_real);
    }

    #[test]
    fn test_metric_primitives() {
        let flat = GrayImage::from_pixel(20, 20, Luma([250]));
        assert_eq!(laplacian_variance(&flat), 0.0);
        assert_eq!(luminance_std(&flat), 0.0);
        assert_eq!(edge_density(&flat), 0.0);
        assert_eq!(glare_ratio(&flat), 1.0);
        assert_eq!(lbp_entropy(&flat), 0.0);

        let halves = GrayImage::from_fn(20, 20, |x, _| Luma([if x < 10 { 0 } else { 200 }]));
        assert!((luminance_std(&halves) - 100.0).abs() < 1e-9);
        // Columns 9 and 10 carry the step edge.
        assert!((edge_density(&halves) - 2.0 / 18.0).abs() < 1e-9);
    }
}
