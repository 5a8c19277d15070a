//! `$classify`: connected components of a mask become objects of a class.
//!
//! Components are 8-connected. Each one is measured against the
//! pipeline's measurement plane and checked against the size and
//! circularity limits; objects that fail are dropped unless `keepInvalid`
//! is set, in which case they are stored with the matching validity bits.

use image::{GrayImage, Luma};
use imageproc::region_labelling::{Connectivity, connected_components};
use serde::{Deserialize, Serialize};

use crate::context::ProcessContext;
use crate::error::CommandError;
use crate::roi::{NewRoi, Roi, TileOffset};
use crate::types::{ClassIdIn, Rect, Validity};

/// Treatment of objects touching the image border.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EdgeMode {
    #[default]
    Keep,
    /// Keep and set `AT_THE_EDGE`.
    Mark,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClassifySettings {
    pub class_id: ClassIdIn,
    /// Minimum area in physical units (pixel size squared).
    pub min_particle_size: f64,
    pub max_particle_size: f64,
    pub min_circularity: f64,
    pub keep_invalid: bool,
    pub edge_mode: EdgeMode,
}

impl Default for ClassifySettings {
    fn default() -> Self {
        Self {
            class_id: ClassIdIn::Default,
            min_particle_size: 1.0,
            max_particle_size: f64::MAX,
            min_circularity: 0.0,
            keep_invalid: false,
            edge_mode: EdgeMode::default(),
        }
    }
}

impl ClassifySettings {
    pub(crate) fn check(&self) -> Result<(), String> {
        if self.max_particle_size < self.min_particle_size {
            return Err("maxParticleSize is below minParticleSize".to_owned());
        }
        if !(0.0..=1.0).contains(&self.min_circularity) {
            return Err(format!(
                "minCircularity must be within 0..1, got {}",
                self.min_circularity
            ));
        }
        Ok(())
    }

    /// Validity bits for a measured object.
    fn validity_of(&self, roi: &Roi, pixel_area: f64) -> Validity {
        let mut validity = Validity::VALID;
        let area = roi.metrics.area * pixel_area;
        if area < self.min_particle_size {
            validity.insert(Validity::TOO_SMALL);
        }
        if area > self.max_particle_size {
            validity.insert(Validity::TOO_BIG);
        }
        if roi.metrics.circularity < self.min_circularity {
            validity.insert(Validity::TOO_LESS_CIRCULARITY);
        }
        validity
    }

    pub(crate) fn execute(&self, ctx: &mut ProcessContext<'_>) -> Result<(), CommandError> {
        let class_id = ctx.resolve_class(self.class_id)?;
        let mask = ctx.active_image().to_binary_mask();
        let tile = *ctx.tile_info();
        let image_rect = Rect::from_dimensions(ctx.image_size());
        let pixel_area = ctx.pixel_size() * ctx.pixel_size();
        let measurement = ctx.measurement_plane().clone();

        let mut kept = 0usize;
        let mut dropped = 0usize;
        for (bbox, component) in components(&mask) {
            let seed = NewRoi {
                id: ctx.next_object_id(),
                class_id,
                bbox,
                mask: component,
                confidence: 1.0,
                origin: TileOffset {
                    x: tile.origin_x,
                    y: tile.origin_y,
                },
                pipeline: ctx.pipeline_index(),
            };
            let Some(mut roi) = Roi::new(seed, &measurement) else {
                continue;
            };
            roi.validity = self.validity_of(&roi, pixel_area);
            if roi.touches_edge(image_rect) {
                match self.edge_mode {
                    EdgeMode::Keep => {}
                    EdgeMode::Mark => roi.validity.insert(Validity::AT_THE_EDGE),
                    EdgeMode::Remove => {
                        dropped += 1;
                        continue;
                    }
                }
            }
            let filtered = roi.validity.contains(Validity::TOO_SMALL)
                || roi.validity.contains(Validity::TOO_BIG)
                || roi.validity.contains(Validity::TOO_LESS_CIRCULARITY);
            if filtered && !self.keep_invalid {
                dropped += 1;
                continue;
            }
            ctx.objects_mut().push(roi);
            kept += 1;
        }
        tracing::debug!(class = %class_id, kept, dropped, "classified components");
        Ok(())
    }
}

/// Tile-local bounding box and cropped mask of every 8-connected
/// component, in label order.
#[allow(clippy::cast_possible_wrap)]
fn components(mask: &GrayImage) -> Vec<(Rect, GrayImage)> {
    let labels = connected_components(mask, Connectivity::Eight, Luma([0u8]));
    let count = labels.pixels().map(|p| p.0[0]).max().unwrap_or(0) as usize;
    let mut extents = vec![(u32::MAX, u32::MAX, 0u32, 0u32); count];
    for (x, y, p) in labels.enumerate_pixels() {
        let label = p.0[0] as usize;
        if label == 0 {
            continue;
        }
        let e = &mut extents[label - 1];
        *e = (e.0.min(x), e.1.min(y), e.2.max(x), e.3.max(y));
    }
    extents
        .into_iter()
        .enumerate()
        .filter(|(_, (x0, _, x1, _))| x0 <= x1)
        .map(|(index, (x0, y0, x1, y1))| {
            let label = u32::try_from(index + 1).unwrap_or(u32::MAX);
            let (w, h) = (x1 - x0 + 1, y1 - y0 + 1);
            let crop = GrayImage::from_fn(w, h, |x, y| {
                Luma([if labels.get_pixel(x + x0, y + y0).0[0] == label {
                    255
                } else {
                    0
                }])
            });
            (Rect::new(x0 as i32, y0 as i32, w, h), crop)
        })
        .collect()
}
