//! `$rollingBall`: background subtraction by grayscale opening with a
//! ball-shaped structuring element.
//!
//! For speed the image is first shrunk by taking block minima (factor 1,
//! 2, 4 or 8 depending on the radius), the ball is rolled over the small
//! image, and the background is bilinearly enlarged back before
//! subtraction. The background never exceeds the original pixel.

use serde::{Deserialize, Serialize};

use crate::context::ProcessContext;
use crate::error::CommandError;
use crate::filter::FloatPlane;
use crate::image::ImagePlane;

use super::{float_plane, gray_input, same_depth_as};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RollingBallSettings {
    /// Ball radius in pixels. Should exceed the radius of the largest
    /// object that is not background.
    pub radius: f32,
    /// Background is brighter than the objects.
    pub light_background: bool,
}

impl Default for RollingBallSettings {
    fn default() -> Self {
        Self {
            radius: 50.0,
            light_background: false,
        }
    }
}

impl RollingBallSettings {
    pub(crate) fn execute(&self, ctx: &mut ProcessContext<'_>) -> Result<(), CommandError> {
        if self.radius.is_nan() || self.radius <= 0.0 {
            return Err(CommandError::InvalidInput(format!(
                "radius must be positive, got {}",
                self.radius
            )));
        }
        let input = gray_input(ctx)?;
        #[allow(clippy::cast_possible_truncation)]
        let max = input.depth().max_value() as f32;
        let mut values = float_plane(&input);
        if self.light_background {
            values = values.map(|v| max - v);
        }
        let background = self.background(&values);
        let mut out = values.zip_map(&background, |v, b| (v - b).max(0.0));
        if self.light_background {
            out = out.map(|v| max - v);
        }
        ctx.set_active_image(same_depth_as(&input, out)?);
        Ok(())
    }

    /// Estimated background of `plane`.
    #[must_use]
    pub fn background(&self, plane: &FloatPlane) -> FloatPlane {
        let factor = shrink_factor(self.radius);
        let small = shrink(plane, factor);
        #[allow(clippy::cast_precision_loss)]
        let ball = Ball::new(self.radius / factor as f32);
        let opened = ball.dilate(&ball.erode(&small));
        enlarge(&opened, plane.width, plane.height, factor).zip_map(plane, f32::min)
    }
}

const fn shrink_factor(radius: f32) -> u32 {
    if radius <= 10.0 {
        1
    } else if radius <= 30.0 {
        2
    } else if radius <= 100.0 {
        4
    } else {
        8
    }
}

/// Block minima.
fn shrink(plane: &FloatPlane, factor: u32) -> FloatPlane {
    if factor == 1 {
        return plane.clone();
    }
    let (sw, sh) = (plane.width.div_ceil(factor), plane.height.div_ceil(factor));
    let mut out = FloatPlane::zeros(sw, sh);
    for sy in 0..sh {
        for sx in 0..sw {
            let mut lo = f32::MAX;
            for y in sy * factor..((sy + 1) * factor).min(plane.height) {
                for x in sx * factor..((sx + 1) * factor).min(plane.width) {
                    lo = lo.min(plane.data[(y * plane.width + x) as usize]);
                }
            }
            out.data[(sy * sw + sx) as usize] = lo;
        }
    }
    out
}

/// Bilinear enlargement back to `width` × `height`.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_possible_wrap
)]
fn enlarge(small: &FloatPlane, width: u32, height: u32, factor: u32) -> FloatPlane {
    if factor == 1 {
        return small.clone();
    }
    let f = factor as f32;
    let mut out = FloatPlane::zeros(width, height);
    for y in 0..height {
        let fy = (y as f32 + 0.5) / f - 0.5;
        let y0 = fy.floor();
        let wy = fy - y0;
        for x in 0..width {
            let fx = (x as f32 + 0.5) / f - 0.5;
            let x0 = fx.floor();
            let wx = fx - x0;
            let (x0, y0) = (x0 as i64, y0 as i64);
            let top = (1.0 - wx).mul_add(
                small.at_clamped(x0, y0),
                wx * small.at_clamped(x0 + 1, y0),
            );
            let bottom = (1.0 - wx).mul_add(
                small.at_clamped(x0, y0 + 1),
                wx * small.at_clamped(x0 + 1, y0 + 1),
            );
            out.data[(y * width + x) as usize] = (1.0 - wy).mul_add(top, wy * bottom);
        }
    }
    out
}

/// Non-flat structuring element: `(dx, dy, height)` over the ball's disk.
struct Ball {
    cells: Vec<(i64, i64, f32)>,
}

impl Ball {
    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    fn new(radius: f32) -> Self {
        let r = radius.max(1.0);
        let reach = r.ceil() as i64;
        let mut cells = Vec::new();
        for dy in -reach..=reach {
            for dx in -reach..=reach {
                let d2 = (dx * dx + dy * dy) as f32;
                if d2 <= r * r {
                    cells.push((dx, dy, (r * r - d2).sqrt()));
                }
            }
        }
        Self { cells }
    }

    fn erode(&self, plane: &FloatPlane) -> FloatPlane {
        self.sweep(plane, f32::MAX, |acc, v, h| acc.min(v - h), 1)
    }

    fn dilate(&self, plane: &FloatPlane) -> FloatPlane {
        self.sweep(plane, f32::MIN, |acc, v, h| acc.max(v + h), -1)
    }

    #[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
    fn sweep(
        &self,
        plane: &FloatPlane,
        init: f32,
        fold: impl Fn(f32, f32, f32) -> f32,
        sign: i64,
    ) -> FloatPlane {
        let (w, h) = (i64::from(plane.width), i64::from(plane.height));
        let mut out = FloatPlane::zeros(plane.width, plane.height);
        for y in 0..h {
            for x in 0..w {
                let mut acc = init;
                for &(dx, dy, height) in &self.cells {
                    let (nx, ny) = (x + sign * dx, y + sign * dy);
                    if nx < 0 || ny < 0 || nx >= w || ny >= h {
                        continue;
                    }
                    acc = fold(acc, plane.data[(ny * w + nx) as usize], height);
                }
                out.data[(y * w + x) as usize] = acc;
            }
        }
        out
    }
}
