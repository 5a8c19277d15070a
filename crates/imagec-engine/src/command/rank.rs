//! `$rankFilter`: minimum, maximum, mean, median or variance over a
//! circular window.

use serde::{Deserialize, Serialize};

use crate::context::ProcessContext;
use crate::error::CommandError;
use crate::filter::{self, Rank};
use crate::image::ImagePlane;

use super::{float_plane, gray_input, same_depth_as};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RankMode {
    Min,
    Max,
    Mean,
    #[default]
    Median,
    Variance,
}

impl From<RankMode> for Rank {
    fn from(mode: RankMode) -> Self {
        match mode {
            RankMode::Min => Self::Min,
            RankMode::Max => Self::Max,
            RankMode::Mean => Self::Mean,
            RankMode::Median => Self::Median,
            RankMode::Variance => Self::Variance,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RankFilterSettings {
    pub mode: RankMode,
    /// Window radius in pixels. Default 2.
    pub radius: f32,
}

impl Default for RankFilterSettings {
    fn default() -> Self {
        Self {
            mode: RankMode::default(),
            radius: 2.0,
        }
    }
}

impl RankFilterSettings {
    pub(crate) fn check(&self) -> Result<(), String> {
        if self.radius.is_nan() || self.radius < 0.0 {
            return Err(format!("radius must not be negative, got {}", self.radius));
        }
        Ok(())
    }

    pub(crate) fn execute(&self, ctx: &mut ProcessContext<'_>) -> Result<(), CommandError> {
        self.check().map_err(CommandError::InvalidInput)?;
        let input = gray_input(ctx)?;
        let out = self.apply(&input)?;
        ctx.set_active_image(out);
        Ok(())
    }

    /// Filtered copy of `plane` in its own depth; variance saturates.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::InvalidInput`] if the result cannot be
    /// written back into the plane's depth.
    pub fn apply(&self, plane: &ImagePlane) -> Result<ImagePlane, CommandError> {
        same_depth_as(
            plane,
            filter::rank(&float_plane(plane), self.radius, self.mode.into()),
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::context::testing::Harness;

    fn speckled() -> ImagePlane {
        ImagePlane::from_fn_u16(16, 16, |x, y| if (x, y) == (8, 8) { 5000 } else { 100 })
    }

    #[test]
    fn median_removes_isolated_spike() {
        let out = RankFilterSettings::default().apply(&speckled()).unwrap();
        assert!((out.get(8, 8, 0) - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn max_grows_the_spike_by_the_radius() {
        let settings = RankFilterSettings {
            mode: RankMode::Max,
            radius: 2.0,
        };
        let out = settings.apply(&speckled()).unwrap();
        assert!((out.get(10, 8, 0) - 5000.0).abs() < f64::EPSILON);
        assert!((out.get(11, 8, 0) - 100.0).abs() < f64::EPSILON);
        assert!((out.get(10, 10, 0) - 100.0).abs() < f64::EPSILON, "corner outside the disk");
    }

    #[test]
    fn execute_keeps_depth_and_rejects_negative_radius() {
        let mut harness = Harness::new(speckled());
        let mut ctx = harness.context();
        let bad = RankFilterSettings {
            radius: -1.0,
            ..RankFilterSettings::default()
        };
        assert!(bad.execute(&mut ctx).is_err());
        RankFilterSettings::default().execute(&mut ctx).unwrap();
        assert_eq!(ctx.active_image().depth(), speckled().depth());
    }
}
