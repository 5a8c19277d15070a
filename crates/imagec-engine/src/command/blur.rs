//! `$blur`: median and Gaussian smoothing, unsharp-mask sharpening.
//!
//! Median filtering of 8-bit planes goes through
//! [`imageproc::filter::median_filter`]; other depths use a direct
//! window sort. Gaussian smoothing wraps
//! [`imageproc::filter::gaussian_blur_f32`] via [`filter::gaussian`].

use image::GrayImage;
use serde::{Deserialize, Serialize};

use crate::context::ProcessContext;
use crate::error::CommandError;
use crate::filter::{self, FloatPlane};
use crate::image::{Depth, ImagePlane};

use super::{float_plane, same_depth_as};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlurMode {
    Median,
    #[default]
    Gaussian,
    /// `out = in + amount * (in - gaussian(in))`.
    UnsharpMask,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BlurSettings {
    pub mode: BlurMode,
    /// Odd window size. Default 3.
    pub kernel_size: u32,
    /// Gaussian sigma; `0` derives it from the kernel size.
    pub sigma: f32,
    /// Sharpening strength for `UNSHARP_MASK`. Default 1.
    pub amount: f32,
    /// Number of passes. Default 1.
    pub repeat: u32,
}

impl Default for BlurSettings {
    fn default() -> Self {
        Self {
            mode: BlurMode::default(),
            kernel_size: 3,
            sigma: 0.0,
            amount: 1.0,
            repeat: 1,
        }
    }
}

impl BlurSettings {
    pub(crate) fn check(&self) -> Result<(), String> {
        if self.kernel_size.is_multiple_of(2) {
            return Err(format!("kernelSize must be odd, got {}", self.kernel_size));
        }
        Ok(())
    }

    fn sigma(&self) -> f32 {
        if self.sigma > 0.0 {
            self.sigma
        } else {
            filter::sigma_for_kernel(self.kernel_size)
        }
    }

    pub(crate) fn execute(&self, ctx: &mut ProcessContext<'_>) -> Result<(), CommandError> {
        self.check().map_err(CommandError::InvalidInput)?;
        let mut plane = super::gray_input(ctx)?;
        for _ in 0..self.repeat.max(1) {
            plane = self.apply(&plane)?;
        }
        ctx.set_active_image(plane);
        Ok(())
    }

    /// One pass over `plane`.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::InvalidInput`] if the result cannot be
    /// written back into the plane's depth.
    pub fn apply(&self, plane: &ImagePlane) -> Result<ImagePlane, CommandError> {
        match self.mode {
            BlurMode::Median => Ok(median(plane, self.kernel_size / 2)),
            BlurMode::Gaussian => {
                same_depth_as(plane, filter::gaussian(&float_plane(plane), self.sigma()))
            }
            BlurMode::UnsharpMask => {
                let original = float_plane(plane);
                let blurred = filter::gaussian(&original, self.sigma());
                let amount = self.amount;
                let sharpened =
                    original.zip_map(&blurred, |v, b| amount.mul_add(v - b, v));
                same_depth_as(plane, sharpened)
            }
        }
    }
}

/// Square median filter with the given radius.
#[allow(clippy::cast_possible_wrap)]
fn median(plane: &ImagePlane, radius: u32) -> ImagePlane {
    if radius == 0 {
        return plane.clone();
    }
    if plane.depth() == Depth::U8
        && let Some(raw) = plane.as_slice::<u8>()
        && let Some(gray) = GrayImage::from_raw(plane.width(), plane.height(), raw.to_vec())
    {
        return ImagePlane::from_gray8(imageproc::filter::median_filter(&gray, radius, radius));
    }
    let src = float_plane(plane);
    let r = i64::from(radius);
    let mut window = Vec::with_capacity(((2 * r + 1) * (2 * r + 1)) as usize);
    let mut out = FloatPlane::zeros(plane.width(), plane.height());
    for y in 0..i64::from(plane.height()) {
        for x in 0..i64::from(plane.width()) {
            window.clear();
            for dy in -r..=r {
                for dx in -r..=r {
                    window.push(src.at_clamped(x + dx, y + dy));
                }
            }
            window.sort_by(f32::total_cmp);
            out.data[(y * i64::from(plane.width()) + x) as usize] = window[window.len() / 2];
        }
    }
    plane.with_gray_values(out.data).unwrap_or_else(|_| plane.clone())
}
