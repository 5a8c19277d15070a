//! `$validatorThreshold`: flag planes whose threshold hugs the background.
//!
//! The most frequent gray value of the measurement plane is taken as the
//! background level. When the lower bound of the last `$threshold` lies
//! below that level times `histMinThresholdFilterFactor`, the mask most
//! likely contains background, and the plane is flagged
//! `POSSIBLE_WRONG_THRESHOLD`. With `INVALIDATE_IMAGE` the image is also
//! left out of aggregated results. The active image is not touched.

use serde::{Deserialize, Serialize};

use crate::context::ProcessContext;
use crate::error::CommandError;
use crate::filter;
use crate::image::ImagePlane;
use crate::types::ImageValidity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidatorMode {
    /// Flag the plane and exclude the image from aggregation.
    #[default]
    InvalidateImage,
    /// Flag the plane only.
    InvalidateImagePlane,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ThresholdValidatorSettings {
    pub mode: ValidatorMode,
    /// `<= 0` disables the check. Default 1.3.
    pub hist_min_threshold_filter_factor: f64,
}

impl Default for ThresholdValidatorSettings {
    fn default() -> Self {
        Self {
            mode: ValidatorMode::default(),
            hist_min_threshold_filter_factor: 1.3,
        }
    }
}

impl ThresholdValidatorSettings {
    pub(crate) fn execute(&self, ctx: &mut ProcessContext<'_>) -> Result<(), CommandError> {
        if self.hist_min_threshold_filter_factor <= 0.0 {
            return Ok(());
        }
        let Some(applied) = ctx.applied_threshold() else {
            return Err(CommandError::InvalidInput(
                "no $threshold ran before the validator".to_owned(),
            ));
        };
        let limit = self.limit(ctx.measurement_plane());
        tracing::debug!(applied, limit, "threshold validation");
        if applied < limit {
            ctx.invalidate(
                ImageValidity::POSSIBLE_WRONG_THRESHOLD,
                self.mode == ValidatorMode::InvalidateImage,
            );
        }
        Ok(())
    }

    /// Background peak of `plane` scaled by the factor.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    pub fn limit(&self, plane: &ImagePlane) -> f64 {
        let bins = plane.depth().max_value() as usize + 1;
        let hist = filter::histogram(&plane.to_f32_gray(), bins);
        let peak = hist
            .iter()
            .enumerate()
            .fold((0, 0), |best, (i, &n)| if n > best.1 { (i, n) } else { best })
            .0;
        peak as f64 * self.hist_min_threshold_filter_factor
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::command::{StoreToDbSettings, ThresholdSettings};
    use crate::context::testing::Harness;

    /// Background at 1000 with a bright square.
    fn plane() -> ImagePlane {
        ImagePlane::from_fn_u16(32, 32, |x, y| {
            if (8..16).contains(&x) && (8..16).contains(&y) { 5000 } else { 1000 }
        })
    }

    fn threshold(min: f64) -> ThresholdSettings {
        ThresholdSettings {
            threshold_min: min,
            ..ThresholdSettings::default()
        }
    }

    #[test]
    fn limit_is_the_scaled_background_peak() {
        let limit = ThresholdValidatorSettings::default().limit(&plane());
        assert!((limit - 1300.0).abs() < 1e-9, "limit {limit}");
    }

    #[test]
    fn low_threshold_invalidates_the_image() {
        let mut h = Harness::new(plane());
        {
            let mut ctx = h.context();
            threshold(1100.0).execute(&mut ctx).unwrap();
            ThresholdValidatorSettings::default().execute(&mut ctx).unwrap();
            assert!(ctx.validity().contains(ImageValidity::POSSIBLE_WRONG_THRESHOLD));
            StoreToDbSettings::default().execute(&mut ctx).unwrap();
        }
        let stats = h.iteration.take_stats();
        assert!(stats[0].validity.contains(ImageValidity::POSSIBLE_WRONG_THRESHOLD));
        assert!(stats[0].invalidate_all);
    }

    #[test]
    fn plane_mode_keeps_the_image_in_aggregation() {
        let mut h = Harness::new(plane());
        {
            let mut ctx = h.context();
            threshold(1100.0).execute(&mut ctx).unwrap();
            ThresholdValidatorSettings {
                mode: ValidatorMode::InvalidateImagePlane,
                ..ThresholdValidatorSettings::default()
            }
            .execute(&mut ctx)
            .unwrap();
            StoreToDbSettings::default().execute(&mut ctx).unwrap();
        }
        let stats = h.iteration.take_stats();
        assert!(!stats[0].validity.is_valid());
        assert!(!stats[0].invalidate_all);
    }

    #[test]
    fn clear_threshold_passes() {
        let mut h = Harness::new(plane());
        let mut ctx = h.context();
        threshold(2000.0).execute(&mut ctx).unwrap();
        let before = ctx.active_image().clone();
        ThresholdValidatorSettings::default().execute(&mut ctx).unwrap();
        assert!(ctx.validity().is_valid());
        assert!(!ctx.invalidates_image());
        assert_eq!(ctx.active_image(), &before);
    }

    #[test]
    fn validator_needs_a_threshold_first() {
        let mut h = Harness::new(plane());
        let mut ctx = h.context();
        assert!(matches!(
            ThresholdValidatorSettings::default().execute(&mut ctx),
            Err(CommandError::InvalidInput(_))
        ));
        let disabled = ThresholdValidatorSettings {
            hist_min_threshold_filter_factor: 0.0,
            ..ThresholdValidatorSettings::default()
        };
        assert!(disabled.execute(&mut ctx).is_ok());
    }
}
