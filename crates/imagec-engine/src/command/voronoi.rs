//! `$voronoi`: partition the tile into cells around seed objects.
//!
//! Seeds are the centers of mass of the objects in `pointsClasses`. Every
//! valid pixel of the tile belongs to its nearest seed; equidistant pixels
//! go to the seed that comes first in object list order. A cell is then
//! clipped to the disk of `maxRadius` around its seed (when positive) and
//! to the union of the objects in `maskClasses` (when any are given).
//!
//! Each remaining cell becomes one object of `outputClass` whose parent is
//! its seed, subject to the area, edge and point filters.

use std::collections::BTreeSet;

use image::{GrayImage, Luma};
use rstar::RTree;
use rstar::primitives::GeomWithData;
use serde::{Deserialize, Serialize};

use crate::context::ProcessContext;
use crate::error::CommandError;
use crate::roi::{NewRoi, Roi, TileOffset};
use crate::types::{ClassId, ClassIdIn, ObjectId, Rect};

type Seed = GeomWithData<[f64; 2], usize>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VoronoiSettings {
    pub points_classes: Vec<ClassIdIn>,
    pub mask_classes: Vec<ClassIdIn>,
    pub output_class: ClassIdIn,
    /// Maximum distance of a cell pixel from its seed; `<= 0` is unlimited.
    pub max_radius: f64,
    /// Cell area bounds in physical units (pixel size squared).
    pub min_area_size: f64,
    pub max_area_size: f64,
    pub exclude_areas_without_point: bool,
    pub exclude_areas_at_the_edge: bool,
}

impl Default for VoronoiSettings {
    fn default() -> Self {
        Self {
            points_classes: Vec::new(),
            mask_classes: Vec::new(),
            output_class: ClassIdIn::Default,
            max_radius: -1.0,
            min_area_size: 0.0,
            max_area_size: f64::MAX,
            exclude_areas_without_point: false,
            exclude_areas_at_the_edge: false,
        }
    }
}

impl VoronoiSettings {
    pub(crate) fn check(&self) -> Result<(), String> {
        if self.points_classes.is_empty() {
            return Err("needs at least one points class".to_owned());
        }
        if self.max_area_size < self.min_area_size {
            return Err("maxAreaSize is below minAreaSize".to_owned());
        }
        Ok(())
    }

    #[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
    pub(crate) fn execute(&self, ctx: &mut ProcessContext<'_>) -> Result<(), CommandError> {
        self.check().map_err(CommandError::InvalidInput)?;
        let points: BTreeSet<_> = ctx.resolve_classes(&self.points_classes)?.into_iter().collect();
        let masks: BTreeSet<_> = ctx.resolve_classes(&self.mask_classes)?.into_iter().collect();
        let output = ctx.resolve_class(self.output_class)?;
        let tile = *ctx.tile_info();
        let valid = tile.valid_rect;

        let seeds: Vec<(ObjectId, [f64; 2])> = ctx
            .objects()
            .iter()
            .filter(|roi| points.contains(&roi.class_id))
            .map(|roi| {
                let c = roi.metrics.center_of_mass;
                (roi.id, [c.x, c.y])
            })
            .collect();
        if seeds.is_empty() {
            tracing::debug!("voronoi without seeds");
            return Ok(());
        }
        let tree = RTree::bulk_load(
            seeds
                .iter()
                .enumerate()
                .map(|(i, &(_, p))| Seed::new(p, i))
                .collect(),
        );
        let mask_union = (!masks.is_empty()).then(|| union_of(ctx, &masks, valid));

        let radius_2 = (self.max_radius > 0.0).then(|| self.max_radius * self.max_radius);
        let mut owner = vec![None; valid.area() as usize];
        for y in 0..valid.height {
            for x in 0..valid.width {
                let p = [
                    f64::from(valid.x) + f64::from(x),
                    f64::from(valid.y) + f64::from(y),
                ];
                let i = (y * valid.width + x) as usize;
                if mask_union.as_ref().is_some_and(|m| !m[i]) {
                    continue;
                }
                let Some(seed) = nearest_seed(&tree, p) else {
                    continue;
                };
                if radius_2.is_some_and(|r2| distance_2(seeds[seed].1, p) > r2) {
                    continue;
                }
                owner[i] = Some(seed);
            }
        }

        let image_rect = Rect::from_dimensions(ctx.image_size());
        let pixel_area = ctx.pixel_size() * ctx.pixel_size();
        let measurement = ctx.measurement_plane().clone();
        let mut created = 0usize;
        for (seed, &(seed_id, _)) in seeds.iter().enumerate() {
            let Some((bbox, mask)) = cell_mask(&owner, valid, seed) else {
                continue;
            };
            let new = NewRoi {
                id: ctx.next_object_id(),
                class_id: output,
                bbox,
                mask,
                confidence: 1.0,
                origin: TileOffset {
                    x: tile.origin_x,
                    y: tile.origin_y,
                },
                pipeline: ctx.pipeline_index(),
            };
            let Some(mut cell) = Roi::new(new, &measurement) else {
                continue;
            };
            let area = cell.metrics.area * pixel_area;
            if area < self.min_area_size || area > self.max_area_size {
                continue;
            }
            if self.exclude_areas_at_the_edge && cell.touches_edge(image_rect) {
                continue;
            }
            if self.exclude_areas_without_point {
                let objects = ctx.objects();
                let has_point = objects
                    .find_colliding(cell.bbox(), &points)
                    .into_iter()
                    .filter_map(|id| objects.get(id))
                    .any(|p| cell.intersects(p, 0.0, &measurement).is_some());
                if !has_point {
                    continue;
                }
            }
            cell.parent_id = seed_id;
            ctx.objects_mut().push(cell);
            created += 1;
        }
        tracing::debug!(seeds = seeds.len(), created, "voronoi cells");
        Ok(())
    }
}

/// Per-pixel membership of `valid` in any object of `classes`.
#[allow(clippy::cast_sign_loss)]
fn union_of(ctx: &ProcessContext<'_>, classes: &BTreeSet<ClassId>, valid: Rect) -> Vec<bool> {
    let mut union = vec![false; valid.area() as usize];
    for roi in ctx.objects().iter().filter(|r| classes.contains(&r.class_id)) {
        let Some(overlap) = roi.bbox().intersection(valid) else {
            continue;
        };
        for y in overlap.y..overlap.bottom() {
            for x in overlap.x..overlap.right() {
                if roi.contains(x, y) {
                    let i = (y - valid.y) as usize * valid.width as usize + (x - valid.x) as usize;
                    union[i] = true;
                }
            }
        }
    }
    union
}

fn distance_2(a: [f64; 2], b: [f64; 2]) -> f64 {
    let (dx, dy) = (a[0] - b[0], a[1] - b[1]);
    dx.mul_add(dx, dy * dy)
}

/// Index of the nearest seed; ties go to the lowest index.
fn nearest_seed(tree: &RTree<Seed>, p: [f64; 2]) -> Option<usize> {
    let mut candidates = tree.nearest_neighbor_iter_with_distance_2(&p);
    let (first, best) = candidates.next()?;
    let tied = candidates
        .take_while(|&(_, d)| d <= best)
        .map(|(s, _)| s.data);
    Some(tied.fold(first.data, usize::min))
}

/// Tight box and mask of the pixels owned by `seed`.
#[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
fn cell_mask(owner: &[Option<usize>], valid: Rect, seed: usize) -> Option<(Rect, GrayImage)> {
    let (mut x0, mut y0, mut x1, mut y1) = (u32::MAX, u32::MAX, 0u32, 0u32);
    for y in 0..valid.height {
        for x in 0..valid.width {
            if owner[(y * valid.width + x) as usize] == Some(seed) {
                x0 = x0.min(x);
                y0 = y0.min(y);
                x1 = x1.max(x);
                y1 = y1.max(y);
            }
        }
    }
    if x0 > x1 {
        return None;
    }
    let (w, h) = (x1 - x0 + 1, y1 - y0 + 1);
    let mask = GrayImage::from_fn(w, h, |x, y| {
        let i = ((y + y0) * valid.width + x + x0) as usize;
        Luma([if owner[i] == Some(seed) { 255 } else { 0 }])
    });
    Some((Rect::new(valid.x + x0 as i32, valid.y + y0 as i32, w, h), mask))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::context::testing::Harness;
    use crate::image::ImagePlane;
    use crate::roi::tests::disk_seed;

    const SEED: ClassId = ClassId(1);
    const MASK: ClassId = ClassId(2);
    const CELL: ClassId = ClassId(3);

    fn add(ctx: &mut ProcessContext<'_>, id: ObjectId, class: ClassId, cx: i32, cy: i32, r: i32) {
        let mut seed = disk_seed(id, cx, cy, r);
        seed.class_id = class;
        let roi = Roi::new(seed, ctx.measurement_plane()).unwrap();
        ctx.objects_mut().push(roi);
    }

    fn settings() -> VoronoiSettings {
        VoronoiSettings {
            points_classes: vec![ClassIdIn::Id(SEED)],
            output_class: ClassIdIn::Id(CELL),
            ..VoronoiSettings::default()
        }
    }

    #[test]
    fn cells_partition_the_tile() {
        let mut h = Harness::new(ImagePlane::from_fn_u16(100, 60, |_, _| 0));
        let mut ctx = h.context();
        add(&mut ctx, 1, SEED, 20, 30, 2);
        add(&mut ctx, 2, SEED, 80, 30, 2);
        settings().execute(&mut ctx).unwrap();
        let cells: Vec<_> = ctx.objects().iter_class(CELL).collect();
        assert_eq!(cells.len(), 2);
        let total: f64 = cells.iter().map(|c| c.metrics.area).sum();
        assert!((total - 6000.0).abs() < f64::EPSILON, "total area {total}");
        assert_eq!(cells[0].parent_id, 1);
        assert_eq!(cells[1].parent_id, 2);
        // Column 50 is equidistant and goes to the first seed.
        assert!(cells[0].contains(50, 30));
        assert!(!cells[1].contains(50, 30));
    }

    #[test]
    fn max_radius_clips_cells_to_disks() {
        let mut h = Harness::new(ImagePlane::from_fn_u16(200, 200, |_, _| 0));
        let mut ctx = h.context();
        add(&mut ctx, 1, SEED, 50, 50, 2);
        add(&mut ctx, 2, SEED, 150, 150, 2);
        VoronoiSettings {
            max_radius: 20.0,
            ..settings()
        }
        .execute(&mut ctx)
        .unwrap();
        for cell in ctx.objects().iter_class(CELL) {
            let expected = std::f64::consts::PI * 400.0;
            assert!(
                (cell.metrics.area - expected).abs() / expected < 0.05,
                "area {}",
                cell.metrics.area
            );
            assert!(cell.bbox().width <= 41);
        }
    }

    #[test]
    fn overlapping_radius_disks_give_disjoint_cells() {
        let mut h = Harness::new(ImagePlane::from_fn_u16(120, 120, |_, _| 0));
        let mut ctx = h.context();
        add(&mut ctx, 1, SEED, 40, 60, 2);
        add(&mut ctx, 2, SEED, 70, 60, 2);
        add(&mut ctx, 3, SEED, 55, 85, 2);
        VoronoiSettings {
            max_radius: 35.0,
            ..settings()
        }
        .execute(&mut ctx)
        .unwrap();

        let cells: Vec<_> = ctx.objects().iter_class(CELL).collect();
        assert_eq!(cells.len(), 3);
        for (i, a) in cells.iter().enumerate() {
            for b in &cells[i + 1..] {
                let Some(overlap) = a.bbox().intersection(b.bbox()) else {
                    continue;
                };
                for y in overlap.y..overlap.bottom() {
                    for x in overlap.x..overlap.right() {
                        assert!(
                            !(a.contains(x, y) && b.contains(x, y)),
                            "cells {} and {} share ({x}, {y})",
                            a.parent_id,
                            b.parent_id
                        );
                    }
                }
            }
        }
        // Every pixel within reach of some seed is owned exactly once.
        let covered = (0..120)
            .flat_map(|y| (0..120).map(move |x| (x, y)))
            .filter(|&(x, y)| {
                [(40, 60), (70, 60), (55, 85)]
                    .iter()
                    .any(|&(sx, sy)| (x - sx) * (x - sx) + (y - sy) * (y - sy) <= 35 * 35)
            })
            .count();
        let total: f64 = cells.iter().map(|c| c.metrics.area).sum();
        assert!((total - covered as f64).abs() < f64::EPSILON, "{total} vs {covered}");
    }

    #[test]
    fn mask_classes_clip_cells() {
        let mut h = Harness::new(ImagePlane::from_fn_u16(100, 100, |_, _| 0));
        let mut ctx = h.context();
        add(&mut ctx, 1, SEED, 50, 50, 1);
        add(&mut ctx, 2, MASK, 50, 50, 10);
        VoronoiSettings {
            mask_classes: vec![ClassIdIn::Id(MASK)],
            ..settings()
        }
        .execute(&mut ctx)
        .unwrap();
        let cell = ctx.objects().iter_class(CELL).next().unwrap();
        let mask = ctx.objects().get(2).unwrap();
        assert!((cell.metrics.area - mask.metrics.area).abs() < f64::EPSILON);
    }

    #[test]
    fn cells_without_point_are_dropped() {
        let mut h = Harness::new(ImagePlane::from_fn_u16(100, 100, |_, _| 0));
        let mut ctx = h.context();
        // Seed outside the only mask: its cell is the mask but holds no seed.
        add(&mut ctx, 1, SEED, 10, 10, 1);
        add(&mut ctx, 2, MASK, 70, 70, 10);
        VoronoiSettings {
            mask_classes: vec![ClassIdIn::Id(MASK)],
            exclude_areas_without_point: true,
            ..settings()
        }
        .execute(&mut ctx)
        .unwrap();
        assert_eq!(ctx.objects().count(CELL), 0);
    }

    #[test]
    fn edge_and_area_filters() {
        let mut h = Harness::new(ImagePlane::from_fn_u16(100, 100, |_, _| 0));
        let mut ctx = h.context();
        add(&mut ctx, 1, SEED, 50, 50, 1);
        VoronoiSettings {
            exclude_areas_at_the_edge: true,
            ..settings()
        }
        .execute(&mut ctx)
        .unwrap();
        assert_eq!(ctx.objects().count(CELL), 0, "the single cell spans the image");

        VoronoiSettings {
            max_radius: 10.0,
            min_area_size: 1000.0,
            ..settings()
        }
        .execute(&mut ctx)
        .unwrap();
        assert_eq!(ctx.objects().count(CELL), 0, "a radius-10 disk is too small");
    }

    #[test]
    fn no_points_class_is_rejected() {
        assert!(VoronoiSettings::default().check().is_err());
    }
}
