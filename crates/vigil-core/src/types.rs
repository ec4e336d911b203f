use image::{GrayImage, RgbImage};
use serde::{Deserialize, Serialize};

/// Length of an encoding produced by the trained embedding network.
pub const EMBEDDING_DIM: usize = 128;
/// Spatial grid used by the LBP fallback (cells per side).
pub const LBP_GRID: usize = 8;
/// Histogram bins per LBP cell.
pub const LBP_BINS: usize = 16;
/// Length of an encoding produced by the LBP fallback.
pub const HISTOGRAM_DIM: usize = LBP_GRID * LBP_GRID * LBP_BINS;

/// Which pipeline produced an encoding. Only encodings of the same kind are comparable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EncodingKind {
    /// 128-dim vector from the trained embedding network.
    Embedding,
    /// 1024-dim LBP grid histogram.
    Histogram,
}

impl EncodingKind {
    pub fn dims(self) -> usize {
        match self {
            Self::Embedding => EMBEDDING_DIM,
            Self::Histogram => HISTOGRAM_DIM,
        }
    }

    /// Infer the producing pipeline from an encoding length.
    pub fn from_len(len: usize) -> Option<Self> {
        match len {
            EMBEDDING_DIM => Some(Self::Embedding),
            HISTOGRAM_DIM => Some(Self::Histogram),
            _ => None,
        }
    }
}

/// Decoded RGB image, owned by a single registration or verification call.
#[derive(Debug, Clone)]
pub struct PixelBuffer {
    image: RgbImage,
}

impl PixelBuffer {
    pub fn new(image: RgbImage) -> Self {
        Self { image }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn rgb(&self) -> &RgbImage {
        &self.image
    }

    /// Luminance copy of the whole frame.
    pub fn to_gray(&self) -> GrayImage {
        image::imageops::grayscale(&self.image)
    }

    /// Luminance copy of a face region, shrunk inward by `margin` (fraction of
    /// each side). Returns `None` when the clamped region is empty.
    pub fn crop_gray(&self, face: &FaceRegion, margin: f32) -> Option<GrayImage> {
        let (x, y, w, h) = face.crop_rect(self.width(), self.height(), margin)?;
        let crop = image::imageops::crop_imm(&self.image, x, y, w, h).to_image();
        Some(image::imageops::grayscale(&crop))
    }
}

/// Bounding box of a detected face, in frame pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceRegion {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    /// Detection confidence in [0, 1].
    pub confidence: f32,
    /// Left eye, right eye, nose tip, left mouth corner, right mouth corner.
    /// Only the trained detector produces landmarks.
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl FaceRegion {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Intersection over union with another region.
    pub fn iou(&self, other: &FaceRegion) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);
        let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }

    /// Integer crop rectangle `(x, y, w, h)` clamped to a `width` × `height`
    /// frame after shrinking each side inward by `margin` × side length.
    pub fn crop_rect(&self, width: u32, height: u32, margin: f32) -> Option<(u32, u32, u32, u32)> {
        let mx = self.width * margin;
        let my = self.height * margin;
        let x1 = (self.x + mx).max(0.0).floor() as u32;
        let y1 = (self.y + my).max(0.0).floor() as u32;
        let x2 = ((self.x + self.width - mx).ceil().max(0.0) as u32).min(width);
        let y2 = ((self.y + self.height - my).ceil().max(0.0) as u32).min(height);
        if x2 <= x1 || y2 <= y1 {
            return None;
        }
        Some((x1, y1, x2 - x1, y2 - y1))
    }
}

/// Fixed-length numeric face representation.
///
/// Persisted as a JSON array of numbers; the length implicitly tags the
/// producing pipeline (see [`EncodingKind`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FaceEncoding {
    values: Vec<f32>,
}

impl FaceEncoding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn kind(&self) -> Option<EncodingKind> {
        EncodingKind::from_len(self.values.len())
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(x: f32, y: f32, w: f32, h: f32) -> FaceRegion {
        FaceRegion {
            x,
            y,
            width: w,
            height: h,
            confidence: 1.0,
            landmarks: None,
        }
    }

    #[test]
    fn test_encoding_json_roundtrip() {
        let values: Vec<f32> = (0..HISTOGRAM_DIM)
            .map(|i| (i as f32 * 0.7311).sin() / 3.0)
            .collect();
        let encoding = FaceEncoding::new(values.clone());
        let json = encoding.to_json().unwrap();
        assert!(json.starts_with('['));

        let parsed = FaceEncoding::from_json(&json).unwrap();
        assert_eq!(parsed.len(), values.len());
        for (orig, rec) in values.iter().zip(parsed.values()) {
            assert!((orig - rec).abs() <= f32::EPSILON * orig.abs().max(1.0));
        }
    }

    #[test]
    fn test_encoding_json_rejects_garbage() {
        assert!(FaceEncoding::from_json("{\"not\": \"an array\"}").is_err());
        assert!(FaceEncoding::from_json("[1.0, \"x\"]").is_err());
    }

    #[test]
    fn test_kind_from_len() {
        assert_eq!(EncodingKind::from_len(128), Some(EncodingKind::Embedding));
        assert_eq!(EncodingKind::from_len(1024), Some(EncodingKind::Histogram));
        assert_eq!(EncodingKind::from_len(512), None);
        assert_eq!(EncodingKind::Histogram.dims(), 1024);
    }

    #[test]
    fn test_iou() {
        let a = region(0.0, 0.0, 10.0, 10.0);
        let b = region(5.0, 0.0, 10.0, 10.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
        assert!((a.iou(&b) - 50.0 / 150.0).abs() < 1e-6);
        assert_eq!(a.iou(&region(20.0, 20.0, 5.0, 5.0)), 0.0);
    }

    #[test]
    fn test_crop_rect_clamps_and_shrinks() {
        let face = region(-10.0, 10.0, 100.0, 50.0);
        let (x, y, w, h) = face.crop_rect(60, 60, 0.0).unwrap();
        assert_eq!((x, y, w, h), (0, 10, 60, 50));

        let (x, y, w, h) = region(10.0, 10.0, 100.0, 100.0)
            .crop_rect(200, 200, 0.05)
            .unwrap();
        assert_eq!((x, y, w, h), (15, 15, 90, 90));

        assert!(region(300.0, 300.0, 10.0, 10.0).crop_rect(100, 100, 0.0).is_none());
    }
}
