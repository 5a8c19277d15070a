//! Numeric building blocks shared by the image commands.
//!
//! Everything here works on row-major `f32` buffers of a known width and
//! height. Borders are handled by replicating the edge pixel.

use image::{ImageBuffer, Luma};

/// Row-major single-channel float buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct FloatPlane {
    pub width: u32,
    pub height: u32,
    pub data: Vec<f32>,
}

impl FloatPlane {
    #[must_use]
    pub fn new(width: u32, height: u32, data: Vec<f32>) -> Self {
        debug_assert_eq!(data.len(), width as usize * height as usize);
        Self {
            width,
            height,
            data,
        }
    }

    #[must_use]
    pub fn zeros(width: u32, height: u32) -> Self {
        Self::new(width, height, vec![0.0; width as usize * height as usize])
    }

    /// Value at `(x, y)` with coordinates clamped into the plane.
    #[must_use]
    #[allow(clippy::cast_sign_loss, clippy::cast_possible_wrap)]
    pub fn at_clamped(&self, x: i64, y: i64) -> f32 {
        let x = x.clamp(0, i64::from(self.width) - 1) as usize;
        let y = y.clamp(0, i64::from(self.height) - 1) as usize;
        self.data[y * self.width as usize + x]
    }

    /// Element-wise combination of two planes of the same size.
    #[must_use]
    pub fn zip_map(&self, other: &Self, f: impl Fn(f32, f32) -> f32) -> Self {
        let data = self
            .data
            .iter()
            .zip(&other.data)
            .map(|(&a, &b)| f(a, b))
            .collect();
        Self::new(self.width, self.height, data)
    }

    #[must_use]
    pub fn map(&self, f: impl Fn(f32) -> f32) -> Self {
        Self::new(
            self.width,
            self.height,
            self.data.iter().map(|&v| f(v)).collect(),
        )
    }
}

/// Gaussian smoothing.
///
/// Non-positive `sigma` returns the input unchanged, since `imageproc`
/// panics on `sigma <= 0.0`.
#[must_use = "returns the blurred plane"]
pub fn gaussian(plane: &FloatPlane, sigma: f32) -> FloatPlane {
    if sigma <= 0.0 || plane.data.is_empty() {
        return plane.clone();
    }
    let Some(buffer) =
        ImageBuffer::<Luma<f32>, Vec<f32>>::from_raw(plane.width, plane.height, plane.data.clone())
    else {
        return plane.clone();
    };
    let blurred = imageproc::filter::gaussian_blur_f32(&buffer, sigma);
    FloatPlane::new(plane.width, plane.height, blurred.into_raw())
}

/// Sigma matching an odd Gaussian kernel size, as used by `OpenCV` when no
/// explicit sigma is given.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn sigma_for_kernel(kernel_size: u32) -> f32 {
    0.3f32.mul_add((kernel_size as f32 - 1.0).mul_add(0.5, -1.0), 0.8)
}

/// 1D derivative kernel of the given order and odd size.
///
/// Built as `(size - 1 - order)` convolutions with `[1, 1]` followed by
/// `order` convolutions with `[-1, 1]`, which yields the usual Sobel
/// smoothing (`[1, 2, 1]`) and derivative (`[-1, 0, 1]`, `[1, -2, 1]`)
/// kernels for size 3. Returns `None` when `order >= size`.
#[must_use]
pub fn derivative_kernel(order: u32, size: u32) -> Option<Vec<f32>> {
    if size == 0 || order >= size {
        return None;
    }
    let mut kernel = vec![1.0f32];
    for _ in 0..(size - 1 - order) {
        kernel = convolve_1d(&kernel, &[1.0, 1.0]);
    }
    for _ in 0..order {
        kernel = convolve_1d(&kernel, &[-1.0, 1.0]);
    }
    Some(kernel)
}

fn convolve_1d(a: &[f32], b: &[f32]) -> Vec<f32> {
    let mut out = vec![0.0; a.len() + b.len() - 1];
    for (i, &x) in a.iter().enumerate() {
        for (j, &y) in b.iter().enumerate() {
            out[i + j] += x * y;
        }
    }
    out
}

/// Separable correlation with `kx` along rows and `ky` along columns.
///
/// Both kernels are centered; even-length kernels anchor left of center.
#[must_use]
#[allow(clippy::cast_possible_wrap)]
pub fn separable(plane: &FloatPlane, kx: &[f32], ky: &[f32]) -> FloatPlane {
    let (w, h) = (plane.width as usize, plane.height as usize);
    let rx = (kx.len() / 2) as i64;
    let ry = (ky.len() / 2) as i64;
    let mut tmp = vec![0.0f32; w * h];
    for y in 0..h {
        for x in 0..w {
            let mut acc = 0.0;
            for (i, &k) in kx.iter().enumerate() {
                acc += k * plane.at_clamped(x as i64 + i as i64 - rx, y as i64);
            }
            tmp[y * w + x] = acc;
        }
    }
    let tmp = FloatPlane::new(plane.width, plane.height, tmp);
    let mut out = vec![0.0f32; w * h];
    for y in 0..h {
        for x in 0..w {
            let mut acc = 0.0;
            for (i, &k) in ky.iter().enumerate() {
                acc += k * tmp.at_clamped(x as i64, y as i64 + i as i64 - ry);
            }
            out[y * w + x] = acc;
        }
    }
    FloatPlane::new(plane.width, plane.height, out)
}

/// First-order 3×3 Sobel gradients `(gx, gy)`.
#[must_use]
pub fn sobel_gradients(plane: &FloatPlane) -> (FloatPlane, FloatPlane) {
    let smooth = [1.0, 2.0, 1.0];
    let diff = [-1.0, 0.0, 1.0];
    (
        separable(plane, &diff, &smooth),
        separable(plane, &smooth, &diff),
    )
}

/// Histogram of integer-valued samples with `bins` buckets.
///
/// Values are rounded and clamped into `0..bins`.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn histogram(values: &[f32], bins: usize) -> Vec<u64> {
    let mut hist = vec![0u64; bins.max(1)];
    let top = hist.len() - 1;
    for &v in values {
        let bin = (v.round().max(0.0) as usize).min(top);
        hist[bin] += 1;
    }
    hist
}

/// Otsu's between-class-variance threshold over a histogram.
///
/// Returns the bin index `t` such that values `> t` form the foreground.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn otsu_level(hist: &[u64]) -> usize {
    let total: u64 = hist.iter().sum();
    if total == 0 {
        return 0;
    }
    let weighted_total: f64 = hist
        .iter()
        .enumerate()
        .map(|(i, &c)| i as f64 * c as f64)
        .sum();
    let mut best = 0;
    let mut best_var = -1.0;
    let mut w_back = 0u64;
    let mut sum_back = 0.0;
    for (t, &count) in hist.iter().enumerate() {
        w_back += count;
        if w_back == 0 {
            continue;
        }
        let w_fore = total - w_back;
        if w_fore == 0 {
            break;
        }
        sum_back += t as f64 * count as f64;
        let mean_back = sum_back / w_back as f64;
        let mean_fore = (weighted_total - sum_back) / w_fore as f64;
        let var = w_back as f64 * w_fore as f64 * (mean_back - mean_fore).powi(2);
        if var > best_var {
            best_var = var;
            best = t;
        }
    }
    best
}

/// Statistic taken over the window of [`rank`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rank {
    Min,
    Max,
    Mean,
    Median,
    Variance,
}

/// Offsets of a circular window: pixels with `dx² + dy² <= r² + 1`.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
pub fn circle_offsets(radius: f32) -> Vec<(i64, i64)> {
    let r2 = f64::from(radius.max(0.0)).powi(2) + 1.0;
    let reach = r2.sqrt().floor() as i64;
    let mut offsets = Vec::new();
    for dy in -reach..=reach {
        for dx in -reach..=reach {
            if ((dx * dx + dy * dy) as f64) <= r2 {
                offsets.push((dx, dy));
            }
        }
    }
    offsets
}

/// Circular rank filter with replicated borders.
///
/// A radius below `0.5` returns the input unchanged.
#[must_use = "returns the filtered plane"]
#[allow(clippy::cast_precision_loss, clippy::cast_possible_wrap)]
pub fn rank(plane: &FloatPlane, radius: f32, kind: Rank) -> FloatPlane {
    if radius < 0.5 || plane.data.is_empty() {
        return plane.clone();
    }
    let offsets = circle_offsets(radius);
    let n = offsets.len() as f64;
    let mut window = Vec::with_capacity(offsets.len());
    let mut out = FloatPlane::zeros(plane.width, plane.height);
    let width = i64::from(plane.width);
    for y in 0..i64::from(plane.height) {
        for x in 0..width {
            window.clear();
            window.extend(
                offsets
                    .iter()
                    .map(|&(dx, dy)| plane.at_clamped(x + dx, y + dy)),
            );
            let value = match kind {
                Rank::Min => window.iter().copied().fold(f32::INFINITY, f32::min),
                Rank::Max => window.iter().copied().fold(f32::NEG_INFINITY, f32::max),
                Rank::Mean => (window.iter().map(|&v| f64::from(v)).sum::<f64>() / n) as f32,
                Rank::Median => {
                    let mid = window.len() / 2;
                    *window.select_nth_unstable_by(mid, f32::total_cmp).1
                }
                Rank::Variance => {
                    let mean = window.iter().map(|&v| f64::from(v)).sum::<f64>() / n;
                    let var = window
                        .iter()
                        .map(|&v| (f64::from(v) - mean).powi(2))
                        .sum::<f64>()
                        / n;
                    var as f32
                }
            };
            out.data[(y * width + x) as usize] = value;
        }
    }
    out
}

/// Median of a sample; `0` for an empty slice.
#[must_use]
pub fn median(values: &mut [f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    if values.len().is_multiple_of(2) {
        f64::midpoint(values[mid - 1], values[mid])
    } else {
        values[mid]
    }
}
