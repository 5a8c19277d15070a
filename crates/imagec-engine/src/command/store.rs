//! `$storeToDb`: mark the pipeline's objects for storage.
//!
//! Rows are not written here. The command registers the pipeline with the
//! iteration, measures cross-channel intensities on the pipeline's objects
//! and records the tile statistics; the scheduler turns the final object
//! list into rows once every pipeline has run on the work unit, so later
//! reclassifications are reflected in what is stored.

use std::path::PathBuf;

use image::{Rgb, RgbImage};
use serde::{Deserialize, Serialize};

use crate::context::ProcessContext;
use crate::error::{CommandError, IoError};
use crate::image::Depth;
use crate::results::{ImageStatsRow, PlaneStats};

/// Contour color burnt into control images.
const CONTOUR: Rgb<u8> = Rgb([255, 64, 64]);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreToDbSettings {
    /// Additional c-stacks whose intensities are measured under each object.
    pub cross_channel_c_stacks: Vec<i32>,
    /// Write a PNG of the measurement plane with object contours.
    pub control_image: bool,
    /// Red, green and blue weights of the control image background.
    pub control_image_color: [f32; 3],
}

impl Default for StoreToDbSettings {
    fn default() -> Self {
        Self {
            cross_channel_c_stacks: Vec::new(),
            control_image: false,
            control_image_color: [1.0; 3],
        }
    }
}

impl StoreToDbSettings {
    pub(crate) fn execute(&self, ctx: &mut ProcessContext<'_>) -> Result<(), CommandError> {
        let pipeline = ctx.pipeline_index();
        let own: Vec<_> = ctx
            .objects()
            .iter()
            .filter(|roi| roi.pipeline == pipeline)
            .map(|roi| roi.id)
            .collect();

        for &c in &self.cross_channel_c_stacks {
            let plane = ctx.channel_plane(c)?;
            for &id in &own {
                ctx.objects_mut().modify(id, |roi| {
                    let stats = roi.measure_intensity(&plane);
                    roi.metrics.cross_channel.insert(c, stats);
                });
            }
        }
        ctx.request_store(self.cross_channel_c_stacks.iter().copied());

        let control_image_path = if self.control_image {
            self.write_control_image(ctx)?
                .map(|p| p.to_string_lossy().into_owned())
        } else {
            None
        };

        let tile = *ctx.tile_info();
        let row = ImageStatsRow {
            image_id: ctx.image_label().image_id,
            channel_id: u32::try_from(pipeline).unwrap_or(u32::MAX),
            tile_idx: tile.index,
            t_stack: tile.t_stack,
            validity: ctx.validity(),
            invalidate_all: ctx.invalidates_image(),
            control_image_path,
            intensity: PlaneStats::measure(ctx.measurement_plane(), tile.valid_rect),
        };
        ctx.push_stats(row);
        tracing::debug!(pipeline, objects = own.len(), "objects marked for storage");
        Ok(())
    }

    /// Measurement plane with this pipeline's contours, written to the
    /// control image folder. `None` when no folder is configured.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn write_control_image(&self, ctx: &ProcessContext<'_>) -> Result<Option<PathBuf>, CommandError> {
        let Some(folder) = ctx.control_image_folder() else {
            return Ok(None);
        };
        let plane = ctx.measurement_plane();
        let (_, max) = plane.convert_depth(Depth::U16).min_max();
        let color = plane
            .to_pseudo_color(self.control_image_color, 0, max.clamp(0.0, 65535.0) as u16)
            .map_err(|e| CommandError::InvalidInput(e.to_string()))?;
        let bgr = color.as_slice::<u8>().unwrap_or_default();
        let mut rgb = RgbImage::from_fn(color.width(), color.height(), |x, y| {
            let i = (y as usize * color.width() as usize + x as usize) * 3;
            bgr.get(i..i + 3).map_or(Rgb([0; 3]), |p| Rgb([p[2], p[1], p[0]]))
        });
        let pipeline = ctx.pipeline_index();
        for roi in ctx.objects().iter().filter(|r| r.pipeline == pipeline) {
            for p in roi.contour() {
                if p.x >= 0.0 && p.y >= 0.0 {
                    let (x, y) = (p.x as u32, p.y as u32);
                    if x < rgb.width() && y < rgb.height() {
                        rgb.put_pixel(x, y, CONTOUR);
                    }
                }
            }
        }

        let tile = ctx.tile_info();
        let path = folder.join(format!(
            "{}_p{}_t{}_tile{}.png",
            ctx.image_label().stem,
            pipeline,
            tile.t_stack,
            tile.index
        ));
        let io = |source| {
            CommandError::Io(IoError::Io {
                path: path.clone(),
                source,
            })
        };
        std::fs::create_dir_all(folder).map_err(io)?;
        rgb.save(&path)
            .map_err(|e| io(std::io::Error::other(e)))?;
        Ok(Some(path))
    }
}
