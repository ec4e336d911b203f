//! Five-point face alignment for the embedding network.
//!
//! Landmarks are mapped onto the canonical 112×112 template with a 4-DOF
//! similarity transform (uniform scale, rotation, translation) fitted by
//! least squares, then the frame is resampled bilinearly.

use image::{Rgb, RgbImage};

/// Canonical landmark positions for a 112×112 aligned crop.
pub const TEMPLATE_112: [(f32, f32); 5] = [
    (38.2946, 51.6963),
    (73.5318, 51.5014),
    (56.0252, 71.7366),
    (41.5493, 92.3655),
    (70.7299, 92.2041),
];

pub const ALIGNED_SIDE: u32 = 112;

/// `dst = [a -b; b a] · src + [tx; ty]`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimilarityTransform {
    pub a: f32,
    pub b: f32,
    pub tx: f32,
    pub ty: f32,
}

impl SimilarityTransform {
    /// Least-squares fit mapping `src` points onto `dst`.
    ///
    /// Returns `None` when the landmarks are degenerate (e.g. all coincident).
    pub fn estimate(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Option<Self> {
        // Normal equations of the stacked rows
        //   [sx, -sy, 1, 0] · p = dx
        //   [sy,  sx, 0, 1] · p = dy
        let mut ata = [[0.0f64; 4]; 4];
        let mut atb = [0.0f64; 4];
        for ((sx, sy), (dx, dy)) in src.iter().zip(dst) {
            let (sx, sy, dx, dy) = (f64::from(*sx), f64::from(*sy), f64::from(*dx), f64::from(*dy));
            let r1 = [sx, -sy, 1.0, 0.0];
            let r2 = [sy, sx, 0.0, 1.0];
            for j in 0..4 {
                for k in 0..4 {
                    ata[j][k] += r1[j] * r1[k] + r2[j] * r2[k];
                }
                atb[j] += r1[j] * dx + r2[j] * dy;
            }
        }

        let p = solve4(ata, atb)?;
        Some(Self {
            a: p[0] as f32,
            b: p[1] as f32,
            tx: p[2] as f32,
            ty: p[3] as f32,
        })
    }

    pub fn apply(&self, (x, y): (f32, f32)) -> (f32, f32) {
        (
            self.a * x - self.b * y + self.tx,
            self.b * x + self.a * y + self.ty,
        )
    }

    /// Inverse mapping (destination → source). `None` for a zero-scale transform.
    pub fn invert(&self) -> Option<Self> {
        let det = self.a * self.a + self.b * self.b;
        if det < 1e-12 {
            return None;
        }
        let ia = self.a / det;
        let ib = -self.b / det;
        Some(Self {
            a: ia,
            b: ib,
            tx: -(ia * self.tx - ib * self.ty),
            ty: -(ib * self.tx + ia * self.ty),
        })
    }
}

/// Gaussian elimination with partial pivoting.
#[allow(clippy::needless_range_loop)]
fn solve4(mut m: [[f64; 4]; 4], mut rhs: [f64; 4]) -> Option<[f64; 4]> {
    for col in 0..4 {
        let pivot_row = (col..4).max_by(|&i, &j| m[i][col].abs().total_cmp(&m[j][col].abs()))?;
        m.swap(col, pivot_row);
        rhs.swap(col, pivot_row);

        let pivot = m[col][col];
        if pivot.abs() < 1e-9 {
            return None;
        }
        for row in (col + 1)..4 {
            let factor = m[row][col] / pivot;
            for k in col..4 {
                m[row][k] -= factor * m[col][k];
            }
            rhs[row] -= factor * rhs[col];
        }
    }

    let mut x = [0.0f64; 4];
    for i in (0..4).rev() {
        let tail: f64 = ((i + 1)..4).map(|j| m[i][j] * x[j]).sum();
        x[i] = (rhs[i] - tail) / m[i][i];
    }
    Some(x)
}

/// Resample `frame` into a `side × side` image through `transform`
/// (frame → output). Pixels mapping outside the frame are black.
pub fn warp(frame: &RgbImage, transform: &SimilarityTransform, side: u32) -> Option<RgbImage> {
    let inverse = transform.invert()?;
    let (w, h) = (frame.width() as i64, frame.height() as i64);

    let sample = |x: i64, y: i64, c: usize| -> f32 {
        if x >= 0 && x < w && y >= 0 && y < h {
            f32::from(frame.get_pixel(x as u32, y as u32)[c])
        } else {
            0.0
        }
    };

    Some(RgbImage::from_fn(side, side, |ox, oy| {
        let (sx, sy) = inverse.apply((ox as f32, oy as f32));
        let x0 = sx.floor() as i64;
        let y0 = sy.floor() as i64;
        let fx = sx - x0 as f32;
        let fy = sy - y0 as f32;

        let mut out = [0u8; 3];
        for (c, slot) in out.iter_mut().enumerate() {
            let v = sample(x0, y0, c) * (1.0 - fx) * (1.0 - fy)
                + sample(x0 + 1, y0, c) * fx * (1.0 - fy)
                + sample(x0, y0 + 1, c) * (1.0 - fx) * fy
                + sample(x0 + 1, y0 + 1, c) * fx * fy;
            *slot = v.round().clamp(0.0, 255.0) as u8;
        }
        Rgb(out)
    }))
}

/// Align a face to the 112×112 template. `None` for degenerate landmarks.
pub fn align_face(frame: &RgbImage, landmarks: &[(f32, f32); 5]) -> Option<RgbImage> {
    let transform = SimilarityTransform::estimate(landmarks, &TEMPLATE_112)?;
    warp(frame, &transform, ALIGNED_SIDE)
}
