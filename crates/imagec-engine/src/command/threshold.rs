//! `$threshold` and `$thresholdAdaptive`: turn an intensity image into a
//! 0/255 mask.
//!
//! `$threshold` uses one pair of bounds for the whole tile and records the
//! lower bound on the context for `$validatorThreshold`. The adaptive
//! variant compares every pixel against statistics of a circular window
//! around it.

use serde::{Deserialize, Serialize};

use crate::context::ProcessContext;
use crate::error::CommandError;
use crate::filter::{self, FloatPlane, Rank};
use crate::image::{Channels, ImagePlane};

use super::{float_plane, gray_input};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ThresholdMode {
    #[default]
    Manual,
    /// Lower bound from Otsu's method; `thresholdMax` still applies.
    Otsu,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ThresholdSettings {
    pub mode: ThresholdMode,
    /// Inclusive lower bound in raw pixel units.
    pub threshold_min: f64,
    /// Inclusive upper bound in raw pixel units.
    pub threshold_max: f64,
}

impl Default for ThresholdSettings {
    fn default() -> Self {
        Self {
            mode: ThresholdMode::default(),
            threshold_min: 1000.0,
            threshold_max: 65535.0,
        }
    }
}

impl ThresholdSettings {
    pub(crate) fn check(&self) -> Result<(), String> {
        if self.threshold_max < self.threshold_min {
            return Err(format!(
                "thresholdMax {} is below thresholdMin {}",
                self.threshold_max, self.threshold_min
            ));
        }
        Ok(())
    }

    pub(crate) fn execute(&self, ctx: &mut ProcessContext<'_>) -> Result<(), CommandError> {
        self.check().map_err(CommandError::InvalidInput)?;
        let input = gray_input(ctx)?;
        let (lo, hi) = self.bounds(&input);
        let mask = mask_between(&input, lo, hi)?;
        ctx.set_active_image(mask);
        ctx.set_applied_threshold(lo);
        Ok(())
    }

    /// Effective inclusive bounds for `plane`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    pub fn bounds(&self, plane: &ImagePlane) -> (f64, f64) {
        match self.mode {
            ThresholdMode::Manual => (self.threshold_min, self.threshold_max),
            ThresholdMode::Otsu => {
                let bins = plane.depth().max_value() as usize + 1;
                let hist = filter::histogram(&plane.to_f32_gray(), bins);
                ((filter::otsu_level(&hist) + 1) as f64, self.threshold_max)
            }
        }
    }

    /// U8 mask with 255 where the pixel lies inside the bounds.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::InvalidInput`] if the mask cannot be built.
    pub fn apply(&self, plane: &ImagePlane) -> Result<ImagePlane, CommandError> {
        let (lo, hi) = self.bounds(plane);
        mask_between(plane, lo, hi)
    }
}

/// U8 mask with 255 where `lo <= v <= hi`.
fn mask_between(plane: &ImagePlane, lo: f64, hi: f64) -> Result<ImagePlane, CommandError> {
    mask_where(plane, plane.to_f32_gray().into_iter().map(|v| {
        let v = f64::from(v);
        v >= lo && v <= hi
    }))
}

fn mask_where(
    like: &ImagePlane,
    foreground: impl Iterator<Item = bool>,
) -> Result<ImagePlane, CommandError> {
    let data: Vec<u8> = foreground.map(|f| if f { 255 } else { 0 }).collect();
    ImagePlane::from_vec(like.width(), like.height(), Channels::Gray, data)
        .map_err(|e| CommandError::InvalidInput(e.to_string()))
}

/// Local rule of `$thresholdAdaptive`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdaptiveMethod {
    /// Foreground when at least the window's mid-range; windows with less
    /// contrast than `contrastThreshold` follow the global mid-gray.
    Bernsen,
    /// Foreground when closer to the window maximum than to its minimum.
    Contrast,
    /// Foreground when above the window mean minus `thresholdOffset`.
    #[default]
    Mean,
    /// Foreground when above the window median minus `thresholdOffset`.
    Median,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AdaptiveThresholdSettings {
    pub method: AdaptiveMethod,
    /// Window radius in pixels. Default 15.
    pub radius: f32,
    /// Minimum window max-min spread for `BERNSEN`. Default 15.
    pub contrast_threshold: f64,
    /// Subtracted from the window statistic for `MEAN` and `MEDIAN`.
    pub threshold_offset: f64,
}

impl Default for AdaptiveThresholdSettings {
    fn default() -> Self {
        Self {
            method: AdaptiveMethod::default(),
            radius: 15.0,
            contrast_threshold: 15.0,
            threshold_offset: 0.0,
        }
    }
}

impl AdaptiveThresholdSettings {
    pub(crate) fn check(&self) -> Result<(), String> {
        if self.radius.is_nan() || self.radius < 1.0 {
            return Err(format!("radius must be at least 1, got {}", self.radius));
        }
        Ok(())
    }

    pub(crate) fn execute(&self, ctx: &mut ProcessContext<'_>) -> Result<(), CommandError> {
        self.check().map_err(CommandError::InvalidInput)?;
        let input = gray_input(ctx)?;
        let mask = self.apply(&input)?;
        ctx.set_active_image(mask);
        Ok(())
    }

    /// U8 mask with 255 where the local rule marks foreground.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::InvalidInput`] if the mask cannot be built.
    pub fn apply(&self, plane: &ImagePlane) -> Result<ImagePlane, CommandError> {
        let src = float_plane(plane);
        let window = |kind| filter::rank(&src, self.radius, kind);
        let values = src.data.iter().map(|&v| f64::from(v));
        match self.method {
            AdaptiveMethod::Bernsen => {
                let (hi, lo) = (window(Rank::Max), window(Rank::Min));
                let mid_gray = plane.depth().max_value() / 2.0;
                mask_where(
                    plane,
                    values.zip(pairs(&hi, &lo)).map(|(v, (max, min))| {
                        let mid = f64::midpoint(max, min);
                        if max - min < self.contrast_threshold {
                            mid >= mid_gray
                        } else {
                            v >= mid
                        }
                    }),
                )
            }
            AdaptiveMethod::Contrast => {
                let (hi, lo) = (window(Rank::Max), window(Rank::Min));
                mask_where(
                    plane,
                    values
                        .zip(pairs(&hi, &lo))
                        .map(|(v, (max, min))| v != 0.0 && (max - v).abs() <= (v - min).abs()),
                )
            }
            AdaptiveMethod::Mean | AdaptiveMethod::Median => {
                let kind = if self.method == AdaptiveMethod::Mean {
                    Rank::Mean
                } else {
                    Rank::Median
                };
                let local = window(kind);
                mask_where(
                    plane,
                    values
                        .zip(&local.data)
                        .map(|(v, &m)| v > f64::from(m) - self.threshold_offset),
                )
            }
        }
    }
}

fn pairs<'a>(a: &'a FloatPlane, b: &'a FloatPlane) -> impl Iterator<Item = (f64, f64)> + 'a {
    a.data
        .iter()
        .zip(&b.data)
        .map(|(&x, &y)| (f64::from(x), f64::from(y)))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::context::testing::Harness;
    use crate::image::Depth;

    fn two_levels() -> ImagePlane {
        ImagePlane::from_fn_u16(10, 10, |x, _| if x < 5 { 200 } else { 3000 })
    }

    #[test]
    fn manual_bounds_are_inclusive() {
        let settings = ThresholdSettings {
            mode: ThresholdMode::Manual,
            threshold_min: 200.0,
            threshold_max: 200.0,
        };
        let mask = settings.apply(&two_levels()).unwrap();
        assert_eq!(mask.depth(), Depth::U8);
        assert!((mask.get(0, 0, 0) - 255.0).abs() < f64::EPSILON);
        assert!(mask.get(9, 0, 0).abs() < f64::EPSILON);
    }

    #[test]
    fn otsu_separates_two_levels() {
        let settings = ThresholdSettings {
            mode: ThresholdMode::Otsu,
            ..ThresholdSettings::default()
        };
        let (lo, _) = settings.bounds(&two_levels());
        assert!(lo > 200.0 && lo <= 3000.0, "otsu level {lo}");
        let mask = settings.apply(&two_levels()).unwrap();
        assert!(mask.get(0, 0, 0).abs() < f64::EPSILON);
        assert!((mask.get(9, 0, 0) - 255.0).abs() < f64::EPSILON);
    }

    #[test]
    fn execute_records_the_lower_bound() {
        let mut harness = Harness::new(two_levels());
        let mut ctx = harness.context();
        assert_eq!(ctx.applied_threshold(), None);
        ThresholdSettings {
            threshold_min: 150.0,
            ..ThresholdSettings::default()
        }
        .execute(&mut ctx)
        .unwrap();
        assert_eq!(ctx.applied_threshold(), Some(150.0));
    }

    #[test]
    fn inverted_bounds_fail_without_touching_image() {
        let mut harness = Harness::new(two_levels());
        let mut ctx = harness.context();
        let settings = ThresholdSettings {
            threshold_min: 10.0,
            threshold_max: 5.0,
            ..ThresholdSettings::default()
        };
        assert!(settings.execute(&mut ctx).is_err());
        assert_eq!(ctx.active_image(), &two_levels());
    }

    // --- adaptive tests ---

    /// Left half dim, right half bright, with a bright dot on each side
    /// that a single global level cannot both catch.
    fn uneven() -> ImagePlane {
        ImagePlane::from_fn_u16(40, 20, |x, y| {
            let base = if x < 20 { 100 } else { 2000 };
            if (x, y) == (10, 10) || (x, y) == (30, 10) {
                base + 500
            } else {
                base
            }
        })
    }

    fn adaptive(method: AdaptiveMethod) -> AdaptiveThresholdSettings {
        AdaptiveThresholdSettings {
            method,
            radius: 3.0,
            ..AdaptiveThresholdSettings::default()
        }
    }

    #[test]
    fn mean_catches_dots_on_both_backgrounds() {
        let mask = adaptive(AdaptiveMethod::Mean).apply(&uneven()).unwrap();
        assert_eq!(mask.depth(), Depth::U8);
        assert!((mask.get(10, 10, 0) - 255.0).abs() < f64::EPSILON);
        assert!((mask.get(30, 10, 0) - 255.0).abs() < f64::EPSILON);
        assert!(mask.get(5, 5, 0).abs() < f64::EPSILON, "flat background");
        assert!(mask.get(35, 5, 0).abs() < f64::EPSILON, "flat background");
    }

    #[test]
    fn offset_lowers_the_local_level() {
        let settings = AdaptiveThresholdSettings {
            threshold_offset: 1.0,
            ..adaptive(AdaptiveMethod::Median)
        };
        let mask = settings.apply(&uneven()).unwrap();
        assert!((mask.get(5, 5, 0) - 255.0).abs() < f64::EPSILON);
        let strict = adaptive(AdaptiveMethod::Median).apply(&uneven()).unwrap();
        assert!(strict.get(5, 5, 0).abs() < f64::EPSILON);
        assert!((strict.get(10, 10, 0) - 255.0).abs() < f64::EPSILON);
    }

    #[test]
    fn bernsen_uses_mid_gray_in_flat_windows() {
        let mask = adaptive(AdaptiveMethod::Bernsen).apply(&uneven()).unwrap();
        assert!((mask.get(10, 10, 0) - 255.0).abs() < f64::EPSILON);
        assert!(mask.get(12, 10, 0).abs() < f64::EPSILON, "below the window mid-range");
        // Flat and below 32768: background.
        assert!(mask.get(2, 2, 0).abs() < f64::EPSILON);
    }

    #[test]
    fn contrast_follows_the_nearer_extreme() {
        let mask = adaptive(AdaptiveMethod::Contrast).apply(&uneven()).unwrap();
        assert!((mask.get(30, 10, 0) - 255.0).abs() < f64::EPSILON);
        assert!(mask.get(31, 10, 0).abs() < f64::EPSILON);
    }

    #[test]
    fn adaptive_radius_below_one_is_rejected() {
        let settings = AdaptiveThresholdSettings {
            radius: 0.0,
            ..AdaptiveThresholdSettings::default()
        };
        assert!(settings.check().is_err());
    }
}
