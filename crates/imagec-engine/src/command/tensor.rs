//! Local-structure filters: `$structureTensor`, `$hessian` and
//! `$weightedDeviation`.
//!
//! All three compute a float response per pixel and hand it to the next
//! command as a 16-bit image whose maximum maps to 65535.

use serde::{Deserialize, Serialize};

use crate::context::ProcessContext;
use crate::error::CommandError;
use crate::filter::{self, FloatPlane};

use super::{float_plane, gray_input, rescaled_u16};

/// Eigenvalues `(λ1, λ2)`, `λ1 >= λ2`, of the symmetric 2×2 matrix
/// `[[a, b], [b, c]]`.
fn eigenvalues(a: f32, b: f32, c: f32) -> (f32, f32) {
    let mean = (a + c) / 2.0;
    let root = ((a - c) / 2.0).hypot(b);
    (mean + root, mean - root)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StructureTensorMode {
    /// `((λ1 - λ2) / (λ1 + λ2))²`, 0 in flat regions.
    #[default]
    Coherence,
    Lambda1,
    Lambda2,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StructureTensorSettings {
    pub mode: StructureTensorMode,
    /// Integration scale of the tensor components.
    pub sigma: f32,
}

impl Default for StructureTensorSettings {
    fn default() -> Self {
        Self {
            mode: StructureTensorMode::default(),
            sigma: 2.0,
        }
    }
}

impl StructureTensorSettings {
    pub(crate) fn execute(&self, ctx: &mut ProcessContext<'_>) -> Result<(), CommandError> {
        let input = gray_input(ctx)?;
        ctx.set_active_image(rescaled_u16(self.response(&float_plane(&input)))?);
        Ok(())
    }

    #[must_use]
    pub fn response(&self, plane: &FloatPlane) -> FloatPlane {
        let (gx, gy) = filter::sobel_gradients(plane);
        let jxx = filter::gaussian(&gx.zip_map(&gx, |a, b| a * b), self.sigma);
        let jxy = filter::gaussian(&gx.zip_map(&gy, |a, b| a * b), self.sigma);
        let jyy = filter::gaussian(&gy.zip_map(&gy, |a, b| a * b), self.sigma);
        let data = jxx
            .data
            .iter()
            .zip(&jxy.data)
            .zip(&jyy.data)
            .map(|((&a, &b), &c)| {
                let (l1, l2) = eigenvalues(a, b, c);
                match self.mode {
                    StructureTensorMode::Coherence => {
                        let sum = l1 + l2;
                        if sum > f32::EPSILON {
                            ((l1 - l2) / sum).powi(2)
                        } else {
                            0.0
                        }
                    }
                    StructureTensorMode::Lambda1 => l1,
                    StructureTensorMode::Lambda2 => l2,
                }
            })
            .collect();
        FloatPlane::new(plane.width, plane.height, data)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HessianMode {
    /// `Dxx·Dyy - Dxy²`
    #[default]
    Determinant,
    /// Absolute value of the larger eigenvalue.
    Lambda1,
    /// Absolute value of the smaller eigenvalue.
    Lambda2,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HessianSettings {
    pub mode: HessianMode,
    /// Smoothing scale applied before differentiation.
    pub sigma: f32,
}

impl Default for HessianSettings {
    fn default() -> Self {
        Self {
            mode: HessianMode::default(),
            sigma: 1.0,
        }
    }
}

impl HessianSettings {
    pub(crate) fn execute(&self, ctx: &mut ProcessContext<'_>) -> Result<(), CommandError> {
        let input = gray_input(ctx)?;
        ctx.set_active_image(rescaled_u16(self.response(&float_plane(&input)))?);
        Ok(())
    }

    #[must_use]
    pub fn response(&self, plane: &FloatPlane) -> FloatPlane {
        let smoothed = filter::gaussian(plane, self.sigma);
        let first = [-0.5, 0.0, 0.5];
        let second = [1.0, -2.0, 1.0];
        let identity = [1.0];
        let dxx = filter::separable(&smoothed, &second, &identity);
        let dyy = filter::separable(&smoothed, &identity, &second);
        let dxy = filter::separable(&smoothed, &first, &first);
        let data = dxx
            .data
            .iter()
            .zip(&dxy.data)
            .zip(&dyy.data)
            .map(|((&a, &b), &c)| match self.mode {
                HessianMode::Determinant => a.mul_add(c, -(b * b)),
                HessianMode::Lambda1 => eigenvalues(a, b, c).0.abs(),
                HessianMode::Lambda2 => eigenvalues(a, b, c).1.abs(),
            })
            .collect();
        FloatPlane::new(plane.width, plane.height, data)
    }
}

/// Gaussian-weighted local standard deviation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WeightedDeviationSettings {
    pub kernel_size: u32,
    /// `0` derives sigma from the kernel size.
    pub sigma: f32,
}

impl Default for WeightedDeviationSettings {
    fn default() -> Self {
        Self {
            kernel_size: 5,
            sigma: 0.0,
        }
    }
}

impl WeightedDeviationSettings {
    pub(crate) fn execute(&self, ctx: &mut ProcessContext<'_>) -> Result<(), CommandError> {
        let input = gray_input(ctx)?;
        ctx.set_active_image(rescaled_u16(self.response(&float_plane(&input)))?);
        Ok(())
    }

    #[must_use]
    pub fn response(&self, plane: &FloatPlane) -> FloatPlane {
        let sigma = if self.sigma > 0.0 {
            self.sigma
        } else {
            filter::sigma_for_kernel(self.kernel_size.max(3))
        };
        let mean = filter::gaussian(plane, sigma);
        let mean_sq = filter::gaussian(&plane.map(|v| v * v), sigma);
        mean_sq.zip_map(&mean, |m2, m| m.mul_add(-m, m2).max(0.0).sqrt())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::context::testing::Harness;
    use crate::image::{Depth, ImagePlane};

    fn stripes() -> FloatPlane {
        float_plane(&ImagePlane::from_fn_u16(24, 24, |x, _| {
            if (x / 3) % 2 == 0 { 0 } else { 1000 }
        }))
    }

    // --- eigenvalue tests ---

    #[test]
    fn eigenvalues_of_diagonal_matrix() {
        let (l1, l2) = eigenvalues(3.0, 0.0, 1.0);
        assert!((l1 - 3.0).abs() < 1e-6 && (l2 - 1.0).abs() < 1e-6, "{l1} {l2}");
    }

    // --- structure tensor tests ---

    #[test]
    fn stripes_are_coherent() {
        let coherence = StructureTensorSettings::default().response(&stripes());
        let center = coherence.at_clamped(12, 12);
        assert!(center > 0.9, "coherence {center}");
    }

    #[test]
    fn flat_image_has_zero_coherence() {
        let flat = FloatPlane::new(8, 8, vec![500.0; 64]);
        let coherence = StructureTensorSettings::default().response(&flat);
        assert!(coherence.data.iter().all(|&v| v.abs() < f32::EPSILON));
    }

    // --- hessian tests ---

    #[test]
    fn hessian_determinant_peaks_on_blob() {
        let blob = float_plane(&ImagePlane::from_fn_u16(21, 21, |x, y| {
            let d2 = (i64::from(x) - 10).pow(2) + (i64::from(y) - 10).pow(2);
            if d2 <= 9 { 1000 } else { 0 }
        }));
        let det = HessianSettings {
            sigma: 2.0,
            ..HessianSettings::default()
        }
        .response(&blob);
        assert!(det.at_clamped(10, 10) > det.at_clamped(2, 2));
    }

    #[test]
    fn hessian_execute_writes_u16() {
        let mut harness = Harness::new(ImagePlane::from_fn_u16(9, 9, |x, y| {
            if x == 4 && y == 4 { 5000 } else { 0 }
        }));
        let mut ctx = harness.context();
        HessianSettings {
            mode: HessianMode::Lambda2,
            sigma: 1.0,
        }
        .execute(&mut ctx)
        .unwrap();
        assert_eq!(ctx.active_image().depth(), Depth::U16);
    }

    // --- weighted deviation tests ---

    #[test]
    fn deviation_is_zero_on_flat_and_high_on_edges() {
        let settings = WeightedDeviationSettings::default();
        let flat = settings.response(&FloatPlane::new(6, 6, vec![42.0; 36]));
        assert!(flat.data.iter().all(|&v| v < 1.0), "{:?}", flat.data);
        let edges = settings.response(&stripes());
        assert!(edges.at_clamped(12, 12) > 100.0);
    }
}
