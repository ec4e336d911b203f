//! Frequency-domain statistics used by the replay detector.
//!
//! Recaptured screens and prints leave periodic patterns (moiré, halftone)
//! that show up as isolated spectral peaks, while heavily smoothed replays
//! concentrate almost all energy at low frequencies.

use image::imageops::FilterType;
use image::GrayImage;

/// Side of the square patch the spectrum is computed on.
pub const SPECTRUM_SIDE: usize = 64;
/// Radius (in frequency bins) considered "low frequency".
const LOW_FREQ_RADIUS: f64 = 8.0;
/// Bins within this radius of DC are ignored when looking for peaks.
const PEAK_EXCLUSION_RADIUS: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Complex {
    pub re: f64,
    pub im: f64,
}

impl Complex {
    pub const ZERO: Self = Self { re: 0.0, im: 0.0 };

    fn add(self, o: Self) -> Self {
        Self {
            re: self.re + o.re,
            im: self.im + o.im,
        }
    }

    fn sub(self, o: Self) -> Self {
        Self {
            re: self.re - o.re,
            im: self.im - o.im,
        }
    }

    fn mul(self, o: Self) -> Self {
        Self {
            re: self.re * o.re - self.im * o.im,
            im: self.re * o.im + self.im * o.re,
        }
    }

    pub fn norm_sqr(self) -> f64 {
        self.re * self.re + self.im * self.im
    }
}

/// In-place iterative radix-2 FFT. `data.len()` must be a power of two.
pub fn fft(data: &mut [Complex]) {
    let n = data.len();
    if n <= 1 {
        return;
    }
    debug_assert!(n.is_power_of_two());

    let mut j = 0;
    for i in 1..n {
        let mut bit = n >> 1;
        while j & bit != 0 {
            j ^= bit;
            bit >>= 1;
        }
        j |= bit;
        if i < j {
            data.swap(i, j);
        }
    }

    let mut len = 2;
    while len <= n {
        let angle = -2.0 * std::f64::consts::PI / len as f64;
        let w_len = Complex {
            re: angle.cos(),
            im: angle.sin(),
        };
        for start in (0..n).step_by(len) {
            let mut w = Complex { re: 1.0, im: 0.0 };
            for k in 0..len / 2 {
                let u = data[start + k];
                let v = data[start + k + len / 2].mul(w);
                data[start + k] = u.add(v);
                data[start + k + len / 2] = u.sub(v);
                w = w.mul(w_len);
            }
        }
        len <<= 1;
    }
}

/// Row-then-column 2-D FFT of a row-major `side × side` grid.
pub fn fft2d(values: &[f64], side: usize) -> Vec<Complex> {
    let mut grid: Vec<Complex> = values.iter().map(|&re| Complex { re, im: 0.0 }).collect();

    for row in grid.chunks_mut(side) {
        fft(row);
    }

    let mut column = vec![Complex::ZERO; side];
    for x in 0..side {
        for y in 0..side {
            column[y] = grid[y * side + x];
        }
        fft(&mut column);
        for y in 0..side {
            grid[y * side + x] = column[y];
        }
    }
    grid
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpectrumStats {
    /// Share of non-DC energy within the low-frequency radius.
    pub low_frequency_ratio: f64,
    /// Strongest mid/high-frequency bin relative to the mean bin magnitude.
    pub peak_to_mean: f64,
}

/// Resample to 64×64, remove the mean, apply a Hann window and summarise
/// the power spectrum.
pub fn analyze(gray: &GrayImage) -> SpectrumStats {
    let n = SPECTRUM_SIDE;
    let patch = image::imageops::resize(gray, n as u32, n as u32, FilterType::Triangle);

    let mut values: Vec<f64> = patch.pixels().map(|p| f64::from(p[0])).collect();
    let mean = values.iter().sum::<f64>() / values.len() as f64;

    let hann: Vec<f64> = (0..n)
        .map(|i| 0.5 - 0.5 * (2.0 * std::f64::consts::PI * i as f64 / (n - 1) as f64).cos())
        .collect();
    for y in 0..n {
        for x in 0..n {
            values[y * n + x] = (values[y * n + x] - mean) * hann[x] * hann[y];
        }
    }

    let spectrum = fft2d(&values, n);

    let mut low = 0.0;
    let mut total = 0.0;
    let mut peak = 0.0f64;
    let mut magnitude_sum = 0.0;
    let mut magnitude_count = 0usize;

    for v in 0..n {
        for u in 0..n {
            if u == 0 && v == 0 {
                continue;
            }
            // Signed frequency of each axis, so the centre sits at DC.
            let fu = if u <= n / 2 { u as f64 } else { u as f64 - n as f64 };
            let fv = if v <= n / 2 { v as f64 } else { v as f64 - n as f64 };
            let radius = (fu * fu + fv * fv).sqrt();

            let c = spectrum[v * n + u];
            let power = c.norm_sqr();
            let magnitude = power.sqrt();

            total += power;
            if radius <= LOW_FREQ_RADIUS {
                low += power;
            }
            magnitude_sum += magnitude;
            magnitude_count += 1;
            if radius > PEAK_EXCLUSION_RADIUS {
                peak = peak.max(magnitude);
            }
        }
    }

    let mean_magnitude = magnitude_sum / magnitude_count.max(1) as f64;
    if total <= f64::EPSILON || mean_magnitude <= f64::EPSILON {
        return SpectrumStats {
            low_frequency_ratio: 1.0,
            peak_to_mean: 0.0,
        };
    }

    SpectrumStats {
        low_frequency_ratio: low / total,
        peak_to_mean: peak / mean_magnitude,
    }
}
