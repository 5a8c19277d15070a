//! `$enhanceContrast` and `$intensityTransform`.
//!
//! Contrast enhancement stretches the histogram so that a given
//! percentage of pixels saturates, or equalizes it using square-rooted
//! bin counts for a softer result than plain equalization. The intensity
//! transform is either linear (`y = contrast·x + brightness`) or
//! contrast-limited adaptive histogram equalization (CLAHE) with bilinear
//! interpolation between tile lookup tables.

use serde::{Deserialize, Serialize};

use crate::context::ProcessContext;
use crate::error::CommandError;
use crate::filter::FloatPlane;
use crate::image::ImagePlane;

use super::{float_plane, gray_input, same_depth_as};

/// Histogram resolution of the adaptive equalization.
const CLAHE_BINS: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EnhanceContrastSettings {
    /// Percentage of pixels allowed to saturate, split between both ends.
    pub saturated_pixels: f64,
    /// Equalize instead of stretching.
    pub equalize_histogram: bool,
}

impl Default for EnhanceContrastSettings {
    fn default() -> Self {
        Self {
            saturated_pixels: 0.35,
            equalize_histogram: false,
        }
    }
}

impl EnhanceContrastSettings {
    pub(crate) fn execute(&self, ctx: &mut ProcessContext<'_>) -> Result<(), CommandError> {
        let input = gray_input(ctx)?;
        let out = self.apply(&input)?;
        ctx.set_active_image(out);
        Ok(())
    }

    /// Enhance `plane`, keeping its depth.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::InvalidInput`] if the result cannot be
    /// written back into the plane's depth.
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn apply(&self, plane: &ImagePlane) -> Result<ImagePlane, CommandError> {
        let max = plane.depth().max_value();
        let bins = max as usize + 1;
        let values = float_plane(plane);
        let hist = crate::filter::histogram(&values.data, bins);
        let lut: Vec<f32> = if self.equalize_histogram {
            sqrt_equalization(&hist)
        } else {
            let (lo, hi) = saturation_bounds(&hist, self.saturated_pixels);
            if hi <= lo {
                return Ok(plane.clone());
            }
            let span = (hi - lo) as f64;
            (0..bins)
                .map(|v| (v.saturating_sub(lo) as f64 / span * max).min(max) as f32)
                .collect()
        };
        same_depth_as(
            plane,
            values.map(|v| lut[(v.max(0.0) as usize).min(bins - 1)]),
        )
    }
}

/// Lowest and highest bin after cutting `saturated / 2` percent of the
/// pixels from each end.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn saturation_bounds(hist: &[u64], saturated: f64) -> (usize, usize) {
    let total: u64 = hist.iter().sum();
    let cut = (total as f64 * saturated.clamp(0.0, 100.0) / 200.0) as u64;
    let mut count = 0;
    let lo = hist
        .iter()
        .position(|&c| {
            count += c;
            count > cut
        })
        .unwrap_or(0);
    count = 0;
    let hi = hist
        .iter()
        .rposition(|&c| {
            count += c;
            count > cut
        })
        .unwrap_or(hist.len() - 1);
    (lo, hi)
}

/// Equalization lookup table over square-rooted bin counts.
#[allow(clippy::cast_precision_loss)]
fn sqrt_equalization(hist: &[u64]) -> Vec<f32> {
    let top = hist.len() - 1;
    let weight = |i: usize| (hist[i] as f64).sqrt();
    let mut sum = weight(0) + weight(top);
    for i in 1..top {
        sum += 2.0 * weight(i);
    }
    if sum <= 0.0 {
        return (0..hist.len()).map(|v| v as f32).collect();
    }
    let scale = top as f64 / sum;
    let mut lut = vec![0.0f32; hist.len()];
    let mut acc = 0.0;
    for (i, slot) in lut.iter_mut().enumerate().take(top).skip(1) {
        let delta = weight(i);
        acc += delta;
        *slot = (acc * scale).round() as f32;
        acc += delta;
    }
    lut[top] = top as f32;
    lut
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntensityTransformMode {
    #[default]
    Manual,
    Adaptive,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IntensityTransformSettings {
    pub mode: IntensityTransformMode,
    pub contrast: f32,
    pub brightness: f32,
    /// Edge length of one CLAHE tile in pixels.
    pub tile_size: u32,
    /// CLAHE clip limit as a multiple of the mean bin height.
    pub clip_limit: f32,
}

impl Default for IntensityTransformSettings {
    fn default() -> Self {
        Self {
            mode: IntensityTransformMode::default(),
            contrast: 1.0,
            brightness: 0.0,
            tile_size: 64,
            clip_limit: 2.0,
        }
    }
}

impl IntensityTransformSettings {
    pub(crate) fn execute(&self, ctx: &mut ProcessContext<'_>) -> Result<(), CommandError> {
        let input = gray_input(ctx)?;
        let values = float_plane(&input);
        let out = match self.mode {
            IntensityTransformMode::Manual => {
                let (c, b) = (self.contrast, self.brightness);
                values.map(|v| c.mul_add(v, b))
            }
            IntensityTransformMode::Adaptive => {
                #[allow(clippy::cast_possible_truncation)]
                let max = input.depth().max_value() as f32;
                clahe(&values, max, self.tile_size.max(1), self.clip_limit)
            }
        };
        ctx.set_active_image(same_depth_as(&input, out)?);
        Ok(())
    }
}

/// Contrast-limited adaptive histogram equalization of values in
/// `0..=max`.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn clahe(plane: &FloatPlane, max: f32, tile: u32, clip_limit: f32) -> FloatPlane {
    let (w, h) = (plane.width, plane.height);
    if w == 0 || h == 0 || max <= 0.0 {
        return plane.clone();
    }
    let tiles_x = w.div_ceil(tile);
    let tiles_y = h.div_ceil(tile);
    let bin_of = |v: f32| ((v.clamp(0.0, max) / max) * (CLAHE_BINS - 1) as f32).round() as usize;

    let mut luts = Vec::with_capacity((tiles_x * tiles_y) as usize);
    for ty in 0..tiles_y {
        for tx in 0..tiles_x {
            let mut hist = [0u64; CLAHE_BINS];
            let mut area = 0u64;
            for y in ty * tile..((ty + 1) * tile).min(h) {
                for x in tx * tile..((tx + 1) * tile).min(w) {
                    hist[bin_of(plane.data[(y * w + x) as usize])] += 1;
                    area += 1;
                }
            }
            luts.push(tile_lut(&mut hist, area, clip_limit, max));
        }
    }

    let lut_at = |tx: u32, ty: u32, bin: usize| luts[(ty * tiles_x + tx) as usize][bin];
    let grid = |p: u32, count: u32| {
        let f = ((p as f32 + 0.5) / tile as f32 - 0.5).clamp(0.0, (count - 1) as f32);
        let lo = f.floor() as u32;
        (lo, (lo + 1).min(count - 1), f - lo as f32)
    };
    let mut out = FloatPlane::zeros(w, h);
    for y in 0..h {
        let (y0, y1, wy) = grid(y, tiles_y);
        for x in 0..w {
            let (x0, x1, wx) = grid(x, tiles_x);
            let i = (y * w + x) as usize;
            let bin = bin_of(plane.data[i]);
            let top = (1.0 - wx).mul_add(lut_at(x0, y0, bin), wx * lut_at(x1, y0, bin));
            let bottom = (1.0 - wx).mul_add(lut_at(x0, y1, bin), wx * lut_at(x1, y1, bin));
            out.data[i] = (1.0 - wy).mul_add(top, wy * bottom);
        }
    }
    out
}

/// Clip `hist`, redistribute the excess and build the cumulative mapping.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn tile_lut(hist: &mut [u64; CLAHE_BINS], area: u64, clip_limit: f32, max: f32) -> Vec<f32> {
    if area == 0 {
        return vec![0.0; CLAHE_BINS];
    }
    let limit = ((clip_limit.max(1.0) * area as f32 / CLAHE_BINS as f32) as u64).max(1);
    let mut excess = 0;
    for bin in hist.iter_mut() {
        if *bin > limit {
            excess += *bin - limit;
            *bin = limit;
        }
    }
    let share = excess / CLAHE_BINS as u64;
    let mut rest = excess % CLAHE_BINS as u64;
    for bin in hist.iter_mut() {
        *bin += share;
        if rest > 0 {
            *bin += 1;
            rest -= 1;
        }
    }
    let mut acc = 0u64;
    hist.iter()
        .map(|&c| {
            acc += c;
            acc as f32 / area as f32 * max
        })
        .collect()
}
