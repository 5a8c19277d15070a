//! `$edgeDetection`: Sobel gradient images and Canny edge masks.
//!
//! Sobel runs with a variable odd kernel size and independent derivative
//! orders per axis; the two directional responses are combined by
//! [`EdgeWeight`]. Canny is computed here rather than through
//! `imageproc::edges::canny`, whose hysteresis step (as of 0.26) visits
//! only six of the eight neighbors and underflows at the image border
//! (image-rs/imageproc#705).

use serde::{Deserialize, Serialize};

use crate::context::ProcessContext;
use crate::error::CommandError;
use crate::filter::{self, FloatPlane};
use crate::image::{Channels, ImagePlane};

use super::{float_plane, gray_input, rescaled_u16};

/// Lower bound for Canny thresholds; `0` would mark every pixel.
const MIN_THRESHOLD: f32 = 1.0;

/// Sigma of the Gaussian applied before Canny gradients.
const CANNY_SIGMA: f32 = 1.4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EdgeDetectionMode {
    #[default]
    Sobel,
    Canny,
}

/// How Sobel's x and y responses are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EdgeWeight {
    /// `sqrt(gx² + gy²)`
    #[default]
    Magnitude,
    /// `|gx| + |gy|`
    Abs,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EdgeDetectionSettings {
    pub mode: EdgeDetectionMode,
    pub weight: EdgeWeight,
    /// Odd aperture size, 3 to 7.
    pub kernel_size: u32,
    pub derivative_order_x: u32,
    pub derivative_order_y: u32,
    /// Canny hysteresis thresholds on the 8-bit normalized image.
    pub threshold_min: f32,
    pub threshold_max: f32,
}

impl Default for EdgeDetectionSettings {
    fn default() -> Self {
        Self {
            mode: EdgeDetectionMode::default(),
            weight: EdgeWeight::default(),
            kernel_size: 3,
            derivative_order_x: 1,
            derivative_order_y: 1,
            threshold_min: 50.0,
            threshold_max: 150.0,
        }
    }
}

impl EdgeDetectionSettings {
    pub(crate) fn check(&self) -> Result<(), String> {
        if self.kernel_size.is_multiple_of(2) || !(3..=7).contains(&self.kernel_size) {
            return Err(format!(
                "kernelSize must be 3, 5 or 7, got {}",
                self.kernel_size
            ));
        }
        if self.mode == EdgeDetectionMode::Sobel {
            if self.derivative_order_x == 0 && self.derivative_order_y == 0 {
                return Err("at least one derivative order must be positive".to_owned());
            }
            if self.derivative_order_x >= self.kernel_size
                || self.derivative_order_y >= self.kernel_size
            {
                return Err("derivative order must be smaller than kernelSize".to_owned());
            }
        }
        if self.threshold_max < self.threshold_min {
            return Err("thresholdMax must not be below thresholdMin".to_owned());
        }
        Ok(())
    }

    pub(crate) fn execute(&self, ctx: &mut ProcessContext<'_>) -> Result<(), CommandError> {
        self.check().map_err(CommandError::InvalidInput)?;
        let input = gray_input(ctx)?;
        let out = match self.mode {
            EdgeDetectionMode::Sobel => rescaled_u16(self.sobel(&float_plane(&input)))?,
            EdgeDetectionMode::Canny => {
                let edges = canny(
                    &float_plane(&ImagePlane::from_gray8(input.to_gray8_normalized())),
                    self.kernel_size,
                    self.threshold_min,
                    self.threshold_max,
                );
                ImagePlane::from_vec(edges.width, edges.height, Channels::Gray, edges.data)
                    .map_err(|e| CommandError::InvalidInput(e.to_string()))?
            }
        };
        ctx.set_active_image(out);
        Ok(())
    }

    /// Combined Sobel response, unscaled.
    #[must_use]
    pub fn sobel(&self, plane: &FloatPlane) -> FloatPlane {
        let size = self.kernel_size;
        let smooth = filter::derivative_kernel(0, size).unwrap_or_else(|| vec![1.0]);
        let response = |order: u32, along_x: bool| {
            let derivative = filter::derivative_kernel(order, size)?;
            (order > 0).then(|| {
                if along_x {
                    filter::separable(plane, &derivative, &smooth)
                } else {
                    filter::separable(plane, &smooth, &derivative)
                }
            })
        };
        let gx = response(self.derivative_order_x, true);
        let gy = response(self.derivative_order_y, false);
        let combine = |a: f32, b: f32| match self.weight {
            EdgeWeight::Magnitude => a.hypot(b),
            EdgeWeight::Abs => a.abs() + b.abs(),
        };
        match (gx, gy) {
            (Some(gx), Some(gy)) => gx.zip_map(&gy, combine),
            (Some(g), None) | (None, Some(g)) => g.map(|v| combine(v, 0.0)),
            (None, None) => FloatPlane::zeros(plane.width, plane.height),
        }
    }
}

/// Canny edges as a `u8` 0/255 buffer.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss
)]
fn canny(plane: &FloatPlane, kernel_size: u32, low: f32, high: f32) -> Mask {
    let low = low.max(MIN_THRESHOLD);
    let high = high.max(low);
    let (w, h) = (plane.width as usize, plane.height as usize);
    let blurred = filter::gaussian(plane, CANNY_SIGMA);
    let smooth = filter::derivative_kernel(0, kernel_size).unwrap_or_else(|| vec![1.0, 2.0, 1.0]);
    let diff = filter::derivative_kernel(1, kernel_size).unwrap_or_else(|| vec![-1.0, 0.0, 1.0]);
    let gx = filter::separable(&blurred, &diff, &smooth);
    let gy = filter::separable(&blurred, &smooth, &diff);
    let magnitude = gx.zip_map(&gy, f32::hypot);

    // Non-maximum suppression along the quantized gradient direction.
    let mut thin = vec![0.0f32; w * h];
    for y in 0..h as i64 {
        for x in 0..w as i64 {
            let i = y as usize * w + x as usize;
            let mut angle = gy.data[i].atan2(gx.data[i]).to_degrees();
            if angle < 0.0 {
                angle += 180.0;
            }
            let (dx, dy) = if !(22.5..157.5).contains(&angle) {
                (1, 0)
            } else if angle < 67.5 {
                (1, 1)
            } else if angle < 112.5 {
                (0, 1)
            } else {
                (-1, 1)
            };
            let g = magnitude.data[i];
            if g >= magnitude.at_clamped(x + dx, y + dy) && g >= magnitude.at_clamped(x - dx, y - dy)
            {
                thin[i] = g;
            }
        }
    }

    // Hysteresis: grow strong edges through 8-connected weak ones.
    let mut out = vec![0u8; w * h];
    let mut stack = Vec::new();
    for start in 0..w * h {
        if thin[start] < high || out[start] != 0 {
            continue;
        }
        out[start] = 255;
        stack.push(start);
        while let Some(i) = stack.pop() {
            let (x, y) = ((i % w) as i64, (i / w) as i64);
            for (dx, dy) in NEIGHBORS_8 {
                let (nx, ny) = (x + dx, y + dy);
                if nx < 0 || ny < 0 || nx >= w as i64 || ny >= h as i64 {
                    continue;
                }
                let n = ny as usize * w + nx as usize;
                if out[n] == 0 && thin[n] >= low {
                    out[n] = 255;
                    stack.push(n);
                }
            }
        }
    }
    Mask {
        width: plane.width,
        height: plane.height,
        data: out,
    }
}

const NEIGHBORS_8: [(i64, i64); 8] = [
    (-1, -1),
    (0, -1),
    (1, -1),
    (-1, 0),
    (1, 0),
    (-1, 1),
    (0, 1),
    (1, 1),
];

struct Mask {
    width: u32,
    height: u32,
    data: Vec<u8>,
}
