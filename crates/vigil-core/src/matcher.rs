//! Encoding comparison.
//!
//! Embeddings (128 values) are compared with a blend of cosine and
//! Euclidean similarity; LBP histograms (1024 values) with a blend of
//! intersection, chi-square and correlation. Encodings of different
//! lengths are never compared.

use serde::Serialize;
use thiserror::Error;

use crate::types::{EncodingKind, FaceEncoding};

/// Embeddings whose cosine similarity is below this are rejected outright.
pub const COSINE_FLOOR: f32 = 0.35;
pub const DEFAULT_EMBEDDING_DISTANCE_THRESHOLD: f32 = 0.30;
pub const DEFAULT_HISTOGRAM_MIN_SIMILARITY: f32 = 0.90;

#[derive(Error, Debug, PartialEq)]
pub enum MatchError {
    #[error("encoding length mismatch: probe {probe}, reference {reference}; face must be re-registered")]
    LengthMismatch { probe: usize, reference: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    pub is_match: bool,
    /// Lower is closer. `1 - combined similarity`.
    pub distance: f32,
    pub similarity: f32,
    pub message: String,
}

pub trait Matcher: Send + Sync {
    /// Encoding kind this matcher is calibrated for.
    fn kind(&self) -> EncodingKind;

    /// Compare a probe against a stored reference encoding.
    fn compare(&self, probe: &FaceEncoding, reference: &FaceEncoding) -> Result<MatchResult, MatchError>;
}

fn check_lengths(probe: &FaceEncoding, reference: &FaceEncoding) -> Result<(), MatchError> {
    if probe.len() != reference.len() {
        return Err(MatchError::LengthMismatch {
            probe: probe.len(),
            reference: reference.len(),
        });
    }
    Ok(())
}

fn l2_normalize(v: &[f32]) -> Option<Vec<f32>> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm <= f32::EPSILON || !norm.is_finite() {
        return None;
    }
    Some(v.iter().map(|x| x / norm).collect())
}

#[derive(Debug, Clone, Copy)]
pub struct EmbeddingMatcher {
    distance_threshold: f32,
}

impl EmbeddingMatcher {
    pub fn new(distance_threshold: f32) -> Self {
        Self { distance_threshold }
    }
}

impl Default for EmbeddingMatcher {
    fn default() -> Self {
        Self::new(DEFAULT_EMBEDDING_DISTANCE_THRESHOLD)
    }
}

impl Matcher for EmbeddingMatcher {
    fn kind(&self) -> EncodingKind {
        EncodingKind::Embedding
    }

    fn compare(&self, probe: &FaceEncoding, reference: &FaceEncoding) -> Result<MatchResult, MatchError> {
        check_lengths(probe, reference)?;

        let (Some(a), Some(b)) = (l2_normalize(probe.values()), l2_normalize(reference.values())) else {
            return Ok(MatchResult {
                is_match: false,
                distance: 1.0,
                similarity: 0.0,
                message: "degenerate encoding".into(),
            });
        };

        let cosine: f32 = a.iter().zip(&b).map(|(x, y)| x * y).sum::<f32>().clamp(-1.0, 1.0);
        let euclidean = a.iter().zip(&b).map(|(x, y)| (x - y).powi(2)).sum::<f32>().sqrt();
        let l2_similarity = 1.0 - euclidean / 2.0;
        let combined = 0.7 * cosine + 0.3 * l2_similarity;
        let distance = 1.0 - combined;

        let (is_match, message) = if cosine < COSINE_FLOOR {
            (false, format!("cosine similarity {cosine:.3} below floor"))
        } else if distance >= self.distance_threshold {
            (false, format!("distance {distance:.3} not below threshold {:.2}", self.distance_threshold))
        } else {
            (true, "face matched".to_string())
        };

        Ok(MatchResult {
            is_match,
            distance,
            similarity: combined,
            message,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HistogramMatcher {
    min_similarity: f32,
}

impl HistogramMatcher {
    pub fn new(min_similarity: f32) -> Self {
        Self { min_similarity }
    }
}

impl Default for HistogramMatcher {
    fn default() -> Self {
        Self::new(DEFAULT_HISTOGRAM_MIN_SIMILARITY)
    }
}

impl Matcher for HistogramMatcher {
    fn kind(&self) -> EncodingKind {
        EncodingKind::Histogram
    }

    fn compare(&self, probe: &FaceEncoding, reference: &FaceEncoding) -> Result<MatchResult, MatchError> {
        check_lengths(probe, reference)?;
        // Chi-square is asymmetric; the live probe is the denominator side.
        let a = probe.values();
        let b = reference.values();

        let mass_a: f32 = a.iter().sum();
        let mass_b: f32 = b.iter().sum();
        let min_mass = mass_a.min(mass_b);
        let intersection = if min_mass > 0.0 {
            a.iter().zip(b).map(|(x, y)| x.min(*y)).sum::<f32>() / min_mass
        } else {
            0.0
        };

        let chi: f32 = a
            .iter()
            .zip(b)
            .filter(|(x, _)| **x > 0.0)
            .map(|(x, y)| (x - y).powi(2) / x)
            .sum();
        let chi_normalized = (chi / 10.0).min(1.0);

        let correlation = pearson(a, b);
        let similarity = (0.4 * intersection + 0.3 * (1.0 - chi_normalized) + 0.3 * correlation.max(0.0))
            .clamp(0.0, 1.0);
        let is_match = similarity >= self.min_similarity;

        Ok(MatchResult {
            is_match,
            distance: 1.0 - similarity,
            similarity,
            message: if is_match {
                "face matched".into()
            } else {
                format!("histogram similarity {similarity:.3} below {:.2}", self.min_similarity)
            },
        })
    }
}

fn pearson(a: &[f32], b: &[f32]) -> f32 {
    let n = a.len() as f32;
    if n == 0.0 {
        return 0.0;
    }
    let mean_a = a.iter().sum::<f32>() / n;
    let mean_b = b.iter().sum::<f32>() / n;
    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for (x, y) in a.iter().zip(b) {
        let (dx, dy) = (x - mean_a, y - mean_b);
        cov += dx * dy;
        var_a += dx * dx;
        var_b += dy * dy;
    }
    let denom = (var_a * var_b).sqrt();
    if denom <= f32::EPSILON {
        0.0
    } else {
        cov / denom
    }
}

/// One-to-many scan: return the index of the first gallery entry the probe
/// matches under `compare`. Entries of a different length are skipped.
pub fn find_duplicate<'a, I, F>(compare: F, probe: &FaceEncoding, gallery: I) -> Option<usize>
where
    I: IntoIterator<Item = &'a FaceEncoding>,
    F: Fn(&FaceEncoding, &FaceEncoding) -> Result<MatchResult, MatchError>,
{
    gallery.into_iter().enumerate().find_map(|(i, reference)| {
        if reference.len() != probe.len() {
            tracing::debug!(index = i, len = reference.len(), "skipping non-comparable encoding");
            return None;
        }
        match compare(probe, reference) {
            Ok(r) if r.is_match => Some(i),
            _ => None,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EMBEDDING_DIM, HISTOGRAM_DIM};

    fn unit(i: usize) -> Vec<f32> {
        let mut v = vec![0.0; EMBEDDING_DIM];
        v[i] = 1.0;
        v
    }

    /// Unit vector at the given cosine to `unit(0)`.
    fn at_cosine(cos: f32) -> FaceEncoding {
        let mut v = vec![0.0; EMBEDDING_DIM];
        v[0] = cos;
        v[1] = (1.0 - cos * cos).sqrt();
        FaceEncoding::new(v)
    }

    fn histogram(seed: u32) -> FaceEncoding {
        let mut v = Vec::with_capacity(HISTOGRAM_DIM);
        for cell in 0..64u32 {
            let raw: Vec<f32> = (0..16u32)
                .map(|b| (((cell * 31 + b * 7 + seed * 13) % 17) + 1) as f32)
                .collect();
            let total: f32 = raw.iter().sum();
            v.extend(raw.iter().map(|x| x / total));
        }
        FaceEncoding::new(v)
    }

    #[test]
    fn test_identical_embeddings_match() {
        let e = FaceEncoding::new(unit(3));
        let r = EmbeddingMatcher::default().compare(&e, &e).unwrap();
        assert!(r.is_match);
        assert!(r.distance.abs() < 1e-6);
        assert!((r.similarity - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_orthogonal_embeddings_rejected() {
        let r = EmbeddingMatcher::default()
            .compare(&FaceEncoding::new(unit(0)), &FaceEncoding::new(unit(1)))
            .unwrap();
        assert!(!r.is_match);
    }

    #[test]
    fn test_embedding_distance_gate() {
        let reference = FaceEncoding::new(unit(0));
        let m = EmbeddingMatcher::default();

        // cos 0.9: l2 = sqrt(0.2) ≈ 0.447, combined ≈ 0.63 + 0.233 = 0.863
        let close = m.compare(&at_cosine(0.9), &reference).unwrap();
        assert!(close.is_match, "{close:?}");

        // cos 0.5 clears the floor but distance ≈ 0.50 fails the threshold
        let far = m.compare(&at_cosine(0.5), &reference).unwrap();
        assert!(!far.is_match);
        assert!(far.distance > 0.3);
    }

    #[test]
    fn test_embedding_scale_invariant() {
        let a = FaceEncoding::new(unit(5));
        let b = FaceEncoding::new(unit(5).iter().map(|x| x * 40.0).collect());
        assert!(EmbeddingMatcher::default().compare(&a, &b).unwrap().is_match);
    }

    #[test]
    fn test_zero_embedding_never_matches() {
        let zero = FaceEncoding::new(vec![0.0; EMBEDDING_DIM]);
        let r = EmbeddingMatcher::default().compare(&zero, &zero).unwrap();
        assert!(!r.is_match);
    }

    #[test]
    fn test_length_mismatch() {
        let err = EmbeddingMatcher::default()
            .compare(&FaceEncoding::new(unit(0)), &histogram(1))
            .unwrap_err();
        assert_eq!(
            err,
            MatchError::LengthMismatch {
                probe: EMBEDDING_DIM,
                reference: HISTOGRAM_DIM
            }
        );
        assert!(HistogramMatcher::default()
            .compare(&histogram(1), &FaceEncoding::new(unit(0)))
            .is_err());
    }

    #[test]
    fn test_identical_histograms_match() {
        let h = histogram(4);
        let r = HistogramMatcher::default().compare(&h, &h).unwrap();
        assert!(r.is_match);
        assert!((r.similarity - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_different_histograms_rejected() {
        let r = HistogramMatcher::default()
            .compare(&histogram(1), &histogram(9))
            .unwrap();
        assert!(!r.is_match, "{r:?}");
        assert!((r.distance - (1.0 - r.similarity)).abs() < 1e-6);
    }

    #[test]
    fn test_duplicate_scan_skips_other_lengths() {
        let probe = histogram(2);
        let gallery = vec![FaceEncoding::new(unit(0)), histogram(7), histogram(2)];
        let m = HistogramMatcher::default();
        let compare = |p: &FaceEncoding, r: &FaceEncoding| m.compare(p, r);
        assert_eq!(find_duplicate(compare, &probe, &gallery), Some(2));
        assert_eq!(find_duplicate(compare, &probe, &gallery[..2]), None);
    }

    #[test]
    fn test_histogram_chi_square_divides_by_probe() {
        let reference = histogram(3);
        let mut bins = reference.values().to_vec();
        // One reference bin nearly empty, the same probe bin heavy.
        bins[0] = 0.001;
        let reference = FaceEncoding::new(bins.clone());
        bins[0] = 0.06;
        let probe = FaceEncoding::new(bins);

        let m = HistogramMatcher::new(0.0);
        let forward = m.compare(&probe, &reference).unwrap();
        let swapped = m.compare(&reference, &probe).unwrap();
        assert!(
            (forward.similarity - swapped.similarity).abs() > 0.05,
            "{forward:?} vs {swapped:?}"
        );

        // Only bin 0 differs: chi = (0.06 - 0.001)^2 / 0.06 with the probe as denominator.
        let (p, r) = (probe.values(), reference.values());
        let chi = (0.06f32 - 0.001).powi(2) / 0.06;
        let mass = p.iter().sum::<f32>().min(r.iter().sum::<f32>());
        let intersection = p.iter().zip(r).map(|(x, y)| x.min(*y)).sum::<f32>() / mass;
        let expected = (0.4 * intersection + 0.3 * (1.0 - chi / 10.0) + 0.3 * pearson(p, r).max(0.0)).clamp(0.0, 1.0);
        assert!((forward.similarity - expected).abs() < 1e-5, "{} vs {expected}", forward.similarity);
    }
}
