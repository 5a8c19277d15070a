//! `$ai`: objects from an external detector.
//!
//! The detector is looked up by model path through the context's
//! [`DetectorProvider`](crate::detector::DetectorProvider). Each detection
//! is mapped from the model's label space to a project class through
//! `modelClasses`; unmapped labels are ignored. The detection probability
//! is multiplied by the class handicap before it is compared with the
//! class threshold, and the probability mask is cut at `maskThreshold`.
//! A model that cannot be resolved is a hard failure for the tile.

use image::{GrayImage, Luma};
use serde::{Deserialize, Serialize};

use crate::context::ProcessContext;
use crate::detector::Detection;
use crate::error::{CommandError, FatalCommand};
use crate::roi::{NewRoi, Roi, TileOffset};
use crate::types::{ClassIdIn, Rect};

/// Mapping of one model label to a project class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelClass {
    pub model_class_id: u32,
    pub class_id: ClassIdIn,
    /// Minimum handicapped probability, 0..=1.
    pub probability_threshold: f32,
    /// Multiplier applied to the detector probability before thresholding.
    pub probability_handicap: f32,
}

impl Default for ModelClass {
    fn default() -> Self {
        Self {
            model_class_id: 0,
            class_id: ClassIdIn::Default,
            probability_threshold: 0.5,
            probability_handicap: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AiSettings {
    pub model_path: String,
    /// Mask pixels with probability below this (0..=1) are background.
    pub mask_threshold: f32,
    pub model_classes: Vec<ModelClass>,
}

impl Default for AiSettings {
    fn default() -> Self {
        Self {
            model_path: String::new(),
            mask_threshold: 0.5,
            model_classes: Vec::new(),
        }
    }
}

impl AiSettings {
    pub(crate) fn execute(&self, ctx: &mut ProcessContext<'_>) -> Result<(), CommandError> {
        let detector = ctx.detector(&self.model_path).ok_or_else(|| FatalCommand {
            command: "$ai",
            reason: format!("cannot load model {:?}", self.model_path),
        })?;
        let classes = self
            .model_classes
            .iter()
            .map(|m| Ok((m, ctx.resolve_class(m.class_id)?)))
            .collect::<Result<Vec<_>, CommandError>>()?;

        let detections = detector
            .detect(ctx.active_image())
            .map_err(|e| CommandError::Detector(e.to_string()))?;

        let tile = *ctx.tile_info();
        let tile_rect = Rect::new(0, 0, tile.width, tile.height);
        let measurement = ctx.measurement_plane().clone();
        let total = detections.len();
        let mut accepted = 0usize;
        for detection in detections {
            let Some(&(mapping, class_id)) = classes
                .iter()
                .find(|(m, _)| m.model_class_id == detection.class_id)
            else {
                continue;
            };
            let probability = detection.probability * mapping.probability_handicap;
            if probability < mapping.probability_threshold {
                continue;
            }
            let Some((bbox, mask)) = self.clipped_mask(&detection, tile_rect) else {
                continue;
            };
            let seed = NewRoi {
                id: ctx.next_object_id(),
                class_id,
                bbox,
                mask,
                confidence: probability,
                origin: TileOffset {
                    x: tile.origin_x,
                    y: tile.origin_y,
                },
                pipeline: ctx.pipeline_index(),
            };
            if let Some(roi) = Roi::new(seed, &measurement) {
                ctx.objects_mut().push(roi);
                accepted += 1;
            }
        }
        tracing::debug!(model = %self.model_path, total, accepted, "ai detections");
        Ok(())
    }

    /// Binary mask of `detection` cut at the mask threshold and clipped to
    /// the tile.
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_possible_wrap
    )]
    fn clipped_mask(&self, detection: &Detection, tile: Rect) -> Option<(Rect, GrayImage)> {
        if detection.mask.dimensions() != (detection.bbox.width, detection.bbox.height) {
            return None;
        }
        let bbox = detection.bbox.intersection(tile)?;
        let cut = (self.mask_threshold.clamp(0.0, 1.0) * 255.0).round() as u8;
        let (dx, dy) = (
            (bbox.x - detection.bbox.x) as u32,
            (bbox.y - detection.bbox.y) as u32,
        );
        let mask = GrayImage::from_fn(bbox.width, bbox.height, |x, y| {
            let p = detection.mask.get_pixel(x + dx, y + dy).0[0];
            Luma([if p > 0 && p >= cut { 255 } else { 0 }])
        });
        Some((bbox, mask))
    }
}
