//! Regions of interest: bounded binary masks with contour and metrics.
//!
//! A [`Roi`] stores its bounding box in tile-local coordinates together
//! with the offset of the tile inside the full image, so the global box is
//! always `bbox + origin`. The mask has exactly the size of the box.

use std::collections::BTreeMap;
use std::f64::consts::{PI, SQRT_2};

use image::{GrayImage, Luma};
use imageproc::contours::{BorderType, find_contours};
use serde::{Deserialize, Serialize};

use crate::image::ImagePlane;
use crate::types::{ClassId, ObjectId, Point, Rect, Validity};

/// Factor of the Kulpa perimeter estimator for 8-connected chains.
const KULPA_FACTOR: f64 = PI * (1.0 + SQRT_2) / 8.0;

/// Offset of a tile inside its image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TileOffset {
    pub x: i32,
    pub y: i32,
}

/// Sum, min, max and mean of pixel values under a mask.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct IntensityStats {
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
}

/// Sobel magnitude statistics sampled along the contour.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct GradientStats {
    pub avg: f64,
    pub max: f64,
    pub stddev: f64,
}

/// Numeric measurements of a ROI.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RoiMetrics {
    /// Mask pixel count.
    pub area: f64,
    pub perimeter: f64,
    pub circularity: f64,
    /// Tile-local center of mass.
    pub center_of_mass: Point,
    pub intensity: IntensityStats,
    pub gradient: GradientStats,
    /// Intensities measured in other channels, keyed by c-stack.
    pub cross_channel: BTreeMap<i32, IntensityStats>,
}

/// Everything needed to create a ROI from a mask.
#[derive(Debug, Clone)]
pub struct NewRoi {
    pub id: ObjectId,
    pub class_id: ClassId,
    /// Tile-local box of `mask`.
    pub bbox: Rect,
    /// Binary mask (non-zero = inside) with the size of `bbox`.
    pub mask: GrayImage,
    pub confidence: f32,
    pub origin: TileOffset,
    /// Index of the pipeline that created the object.
    pub pipeline: usize,
}

/// A detected object.
#[derive(Debug, Clone, PartialEq)]
pub struct Roi {
    pub id: ObjectId,
    /// `0` when the object has no parent.
    pub parent_id: ObjectId,
    /// `0` when untracked.
    pub tracking_id: u64,
    pub class_id: ClassId,
    bbox: Rect,
    origin: TileOffset,
    mask: GrayImage,
    contour: Vec<Point>,
    pub metrics: RoiMetrics,
    pub validity: Validity,
    confidence: f32,
    /// Pipeline that created the object.
    pub pipeline: usize,
    /// Objects this one was derived from (intersection inputs).
    pub linked: Vec<ObjectId>,
}

impl Roi {
    /// Build a ROI from a mask, trimming the box to the set pixels and
    /// measuring it against `image`.
    ///
    /// Returns `None` when the mask has no set pixel or does not match the
    /// box size.
    #[must_use]
    pub fn new(seed: NewRoi, image: &ImagePlane) -> Option<Self> {
        if seed.mask.dimensions() != (seed.bbox.width, seed.bbox.height) {
            return None;
        }
        let (bbox, mask) = trim_mask(seed.bbox, &seed.mask)?;
        let mut roi = Self {
            id: seed.id,
            parent_id: 0,
            tracking_id: 0,
            class_id: seed.class_id,
            bbox,
            origin: seed.origin,
            mask,
            contour: Vec::new(),
            metrics: RoiMetrics::default(),
            validity: Validity::VALID,
            confidence: seed.confidence.clamp(0.0, 1.0),
            pipeline: seed.pipeline,
            linked: Vec::new(),
        };
        roi.contour = largest_contour(&roi.mask, roi.bbox);
        roi.compute_metrics(image);
        Some(roi)
    }

    /// Tile-local bounding box.
    #[must_use]
    pub const fn bbox(&self) -> Rect {
        self.bbox
    }

    /// Bounding box in image coordinates.
    #[must_use]
    pub const fn global_bbox(&self) -> Rect {
        self.bbox.offset(self.origin.x, self.origin.y)
    }

    #[must_use]
    pub const fn origin(&self) -> TileOffset {
        self.origin
    }

    #[must_use]
    pub const fn mask(&self) -> &GrayImage {
        &self.mask
    }

    /// Tile-local contour of the largest connected part of the mask.
    #[must_use]
    pub fn contour(&self) -> &[Point] {
        &self.contour
    }

    #[must_use]
    pub const fn confidence(&self) -> f32 {
        self.confidence
    }

    /// Number of set mask pixels.
    #[must_use]
    pub fn pixel_count(&self) -> u64 {
        self.mask.pixels().filter(|p| p.0[0] > 0).count() as u64
    }

    /// `true` when the tile-local pixel `(x, y)` is inside the mask.
    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub fn contains(&self, x: i32, y: i32) -> bool {
        self.bbox.contains(x, y)
            && self
                .mask
                .get_pixel((x - self.bbox.x) as u32, (y - self.bbox.y) as u32)
                .0[0]
                > 0
    }

    /// Center of mass in image coordinates.
    #[must_use]
    pub fn global_center_of_mass(&self) -> Point {
        Point::new(
            self.metrics.center_of_mass.x + f64::from(self.origin.x),
            self.metrics.center_of_mass.y + f64::from(self.origin.y),
        )
    }

    /// Recompute area, perimeter, circularity, center of mass, intensity
    /// and gradient statistics against `image`.
    ///
    /// Cross-channel intensities are kept.
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_wrap)]
    pub fn compute_metrics(&mut self, image: &ImagePlane) {
        let mut area = 0.0;
        let mut sum_x = 0.0;
        let mut sum_y = 0.0;
        for (mx, my, p) in self.mask.enumerate_pixels() {
            if p.0[0] > 0 {
                area += 1.0;
                sum_x += f64::from(mx);
                sum_y += f64::from(my);
            }
        }
        let perimeter = kulpa_perimeter(&self.contour);
        let circularity = if perimeter > 0.0 {
            (4.0 * PI * area / (perimeter * perimeter)).min(1.0)
        } else {
            1.0
        };
        let center_of_mass = if area > 0.0 {
            Point::new(
                sum_x / area + f64::from(self.bbox.x),
                sum_y / area + f64::from(self.bbox.y),
            )
        } else {
            Point::new(f64::from(self.bbox.x), f64::from(self.bbox.y))
        };

        let cross_channel = std::mem::take(&mut self.metrics.cross_channel);
        self.metrics = RoiMetrics {
            area,
            perimeter,
            circularity,
            center_of_mass,
            intensity: self.measure_intensity(image),
            gradient: gradient_stats(image, &self.contour),
            cross_channel,
        };
    }

    /// Intensity statistics of `image` under the mask.
    ///
    /// Mask pixels outside the image are ignored.
    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub fn measure_intensity(&self, image: &ImagePlane) -> IntensityStats {
        let bounds = Rect::from_dimensions(image.dimensions());
        let mut count = 0u64;
        let mut sum = 0.0;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for (mx, my, p) in self.mask.enumerate_pixels() {
            if p.0[0] == 0 {
                continue;
            }
            let (x, y) = (self.bbox.x + mx.cast_signed(), self.bbox.y + my.cast_signed());
            if !bounds.contains(x, y) {
                continue;
            }
            let v = image.get(x as u32, y as u32, 0);
            count += 1;
            sum += v;
            min = min.min(v);
            max = max.max(v);
        }
        if count == 0 {
            return IntensityStats::default();
        }
        #[allow(clippy::cast_precision_loss)]
        let avg = sum / count as f64;
        IntensityStats { sum, min, max, avg }
    }

    /// Intersection with `other`, if large enough.
    ///
    /// The new mask is the AND of both masks over the overlap of their
    /// boxes; its contour is the largest contour of that mask. The result
    /// is returned only when `area(AND) / min(area(self), area(other))` is
    /// at least `min_ratio` and the masks share at least one pixel. The
    /// result has id `0`, the class of `self`, no parent and links to both
    /// inputs; callers assign the final id and class.
    #[must_use]
    #[allow(clippy::cast_sign_loss, clippy::cast_precision_loss)]
    pub fn intersects(&self, other: &Self, min_ratio: f64, image: &ImagePlane) -> Option<Self> {
        let overlap = self.bbox.intersection(other.bbox)?;
        let mut mask = GrayImage::new(overlap.width, overlap.height);
        let mut shared = 0u64;
        for oy in 0..overlap.height {
            for ox in 0..overlap.width {
                let x = overlap.x + ox.cast_signed();
                let y = overlap.y + oy.cast_signed();
                if self.contains(x, y) && other.contains(x, y) {
                    mask.put_pixel(ox, oy, Luma([255]));
                    shared += 1;
                }
            }
        }
        let smaller = self.pixel_count().min(other.pixel_count());
        if shared == 0 || smaller == 0 {
            return None;
        }
        let ratio = shared as f64 / smaller as f64;
        if ratio < min_ratio {
            return None;
        }
        let mut roi = Self::new(
            NewRoi {
                id: 0,
                class_id: self.class_id,
                bbox: overlap,
                mask,
                confidence: self.confidence.min(other.confidence),
                origin: self.origin,
                pipeline: self.pipeline,
            },
            image,
        )?;
        roi.linked = vec![self.id, other.id];
        Some(roi)
    }

    /// Deep copy under a new id and class, keeping parent and tracking ids.
    #[must_use]
    pub fn clone_into_class(&self, class_id: ClassId, id: ObjectId) -> Self {
        let mut copy = self.clone();
        copy.id = id;
        copy.class_id = class_id;
        copy
    }

    /// `true` when the global box touches the border of `image_rect`.
    #[must_use]
    pub const fn touches_edge(&self, image_rect: Rect) -> bool {
        self.global_bbox().touches_edge_of(image_rect)
    }
}

/// Shrink `bbox`/`mask` to the extent of the set pixels.
#[allow(clippy::cast_possible_wrap)]
fn trim_mask(bbox: Rect, mask: &GrayImage) -> Option<(Rect, GrayImage)> {
    let (w, h) = mask.dimensions();
    let (mut x0, mut y0, mut x1, mut y1) = (w, h, 0, 0);
    for (x, y, p) in mask.enumerate_pixels() {
        if p.0[0] > 0 {
            x0 = x0.min(x);
            y0 = y0.min(y);
            x1 = x1.max(x);
            y1 = y1.max(y);
        }
    }
    if x0 > x1 || y0 > y1 {
        return None;
    }
    let trimmed = Rect::new(bbox.x + x0 as i32, bbox.y + y0 as i32, x1 - x0 + 1, y1 - y0 + 1);
    if trimmed.width == w && trimmed.height == h {
        let normalized = GrayImage::from_fn(w, h, |x, y| {
            Luma([if mask.get_pixel(x, y).0[0] > 0 { 255 } else { 0 }])
        });
        return Some((bbox, normalized));
    }
    let cropped = GrayImage::from_fn(trimmed.width, trimmed.height, |x, y| {
        Luma([if mask.get_pixel(x + x0, y + y0).0[0] > 0 {
            255
        } else {
            0
        }])
    });
    Some((trimmed, cropped))
}

/// Outer contour enclosing the largest area, in tile-local coordinates.
fn largest_contour(mask: &GrayImage, bbox: Rect) -> Vec<Point> {
    let contours = find_contours::<i32>(mask);
    contours
        .into_iter()
        .filter(|c| c.border_type == BorderType::Outer)
        .map(|c| {
            c.points
                .into_iter()
                .map(|p| Point::new(f64::from(p.x + bbox.x), f64::from(p.y + bbox.y)))
                .collect::<Vec<_>>()
        })
        .max_by(|a, b| {
            polygon_area(a)
                .total_cmp(&polygon_area(b))
                .then(a.len().cmp(&b.len()))
        })
        .unwrap_or_default()
}

/// Absolute shoelace area of a closed polygon.
#[must_use]
pub fn polygon_area(points: &[Point]) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }
    let mut twice = 0.0;
    for (i, p) in points.iter().enumerate() {
        let q = points[(i + 1) % points.len()];
        twice += p.x.mul_add(q.y, -(q.x * p.y));
    }
    twice.abs() / 2.0
}

/// Kulpa-corrected length of a closed 8-connected chain.
///
/// Axis-aligned steps count 1, diagonal steps count √2, and the sum is
/// scaled by `π(1+√2)/8` to remove the bias of chain codes on digitized
/// curves. A single-point chain has length 0.
#[must_use]
pub fn kulpa_perimeter(contour: &[Point]) -> f64 {
    if contour.len() < 2 {
        return 0.0;
    }
    let mut axis = 0.0;
    let mut diagonal: f64 = 0.0;
    for (i, p) in contour.iter().enumerate() {
        let q = contour[(i + 1) % contour.len()];
        let dx = (q.x - p.x).abs() > f64::EPSILON;
        let dy = (q.y - p.y).abs() > f64::EPSILON;
        match (dx, dy) {
            (true, true) => diagonal += 1.0,
            (true, false) | (false, true) => axis += 1.0,
            (false, false) => {}
        }
    }
    KULPA_FACTOR * diagonal.mul_add(SQRT_2, axis)
}

/// Sobel 3×3 gradient magnitude at `(x, y)` with clamped borders.
#[must_use]
#[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
pub fn sobel_magnitude_at(image: &ImagePlane, x: i32, y: i32) -> f64 {
    let w = image.width() as i32;
    let h = image.height() as i32;
    if w == 0 || h == 0 {
        return 0.0;
    }
    let at = |dx: i32, dy: i32| {
        let px = (x + dx).clamp(0, w - 1) as u32;
        let py = (y + dy).clamp(0, h - 1) as u32;
        image.get(px, py, 0)
    };
    let gx = (at(1, -1) + 2.0 * at(1, 0) + at(1, 1)) - (at(-1, -1) + 2.0 * at(-1, 0) + at(-1, 1));
    let gy = (at(-1, 1) + 2.0 * at(0, 1) + at(1, 1)) - (at(-1, -1) + 2.0 * at(0, -1) + at(1, -1));
    gx.hypot(gy)
}

#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
fn gradient_stats(image: &ImagePlane, contour: &[Point]) -> GradientStats {
    if contour.is_empty() {
        return GradientStats::default();
    }
    let samples: Vec<f64> = contour
        .iter()
        .map(|p| sobel_magnitude_at(image, p.x as i32, p.y as i32))
        .collect();
    let n = samples.len() as f64;
    let avg = samples.iter().sum::<f64>() / n;
    let max = samples.iter().copied().fold(0.0, f64::max);
    let var = samples.iter().map(|v| (v - avg).powi(2)).sum::<f64>() / n;
    GradientStats {
        avg,
        max,
        stddev: var.sqrt(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub(crate) mod tests {
    use super::*;
    use crate::image::{Channels, Depth};
    use imageproc::drawing::draw_filled_circle_mut;

    /// Disk mask of `radius` centered in a `(2r+1)²` box at `(cx - r, cy - r)`.
    #[allow(clippy::cast_sign_loss)]
    pub(crate) fn disk_seed(id: ObjectId, cx: i32, cy: i32, radius: i32) -> NewRoi {
        let side = (2 * radius + 1) as u32;
        let mut mask = GrayImage::new(side, side);
        draw_filled_circle_mut(&mut mask, (radius, radius), radius, Luma([255]));
        NewRoi {
            id,
            class_id: ClassId(1),
            bbox: Rect::new(cx - radius, cy - radius, side, side),
            mask,
            confidence: 1.0,
            origin: TileOffset::default(),
            pipeline: 0,
        }
    }

    fn flat_image(value: u16) -> ImagePlane {
        ImagePlane::from_fn_u16(1024, 1024, |_, _| value)
    }

    // --- metrics tests ---

    #[test]
    fn disk_area_and_circularity() {
        let roi = Roi::new(disk_seed(1, 300, 300, 50), &flat_image(100)).unwrap();
        let expected = PI * 2500.0;
        let area = roi.metrics.area;
        assert!(
            (area - expected).abs() / expected < 0.05,
            "expected area ≈ {expected}, got {area}"
        );
        assert!(
            roi.metrics.circularity >= 0.95,
            "expected circularity >= 0.95, got {}",
            roi.metrics.circularity
        );
    }

    #[test]
    fn mask_matches_bbox_size() {
        let roi = Roi::new(disk_seed(1, 40, 40, 10), &flat_image(0)).unwrap();
        let bbox = roi.bbox();
        assert_eq!(roi.mask().dimensions(), (bbox.width, bbox.height));
    }

    #[test]
    fn single_pixel_has_unit_circularity() {
        let mut mask = GrayImage::new(3, 3);
        mask.put_pixel(1, 1, Luma([255]));
        let seed = NewRoi {
            id: 1,
            class_id: ClassId(0),
            bbox: Rect::new(10, 10, 3, 3),
            mask,
            confidence: 0.5,
            origin: TileOffset::default(),
            pipeline: 0,
        };
        let roi = Roi::new(seed, &flat_image(0)).unwrap();
        assert_eq!(roi.bbox(), Rect::new(11, 11, 1, 1));
        assert!((roi.metrics.circularity - 1.0).abs() < f64::EPSILON);
        assert!((roi.metrics.area - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_mask_yields_no_roi() {
        let seed = NewRoi {
            id: 1,
            class_id: ClassId(0),
            bbox: Rect::new(0, 0, 4, 4),
            mask: GrayImage::new(4, 4),
            confidence: 1.0,
            origin: TileOffset::default(),
            pipeline: 0,
        };
        assert!(Roi::new(seed, &flat_image(0)).is_none());
    }

    #[test]
    fn intensity_stats_under_mask() {
        let image = ImagePlane::from_fn_u16(64, 64, |x, _| if x < 32 { 100 } else { 300 });
        let roi = Roi::new(disk_seed(1, 32, 32, 5), &image).unwrap();
        let stats = roi.metrics.intensity;
        assert!((stats.min - 100.0).abs() < f64::EPSILON);
        assert!((stats.max - 300.0).abs() < f64::EPSILON);
        assert!(stats.avg > 100.0 && stats.avg < 300.0, "got {}", stats.avg);
    }

    #[test]
    fn gradient_is_zero_on_flat_image() {
        let roi = Roi::new(disk_seed(1, 32, 32, 5), &flat_image(500)).unwrap();
        assert!(roi.metrics.gradient.max.abs() < f64::EPSILON);
    }

    #[test]
    fn confidence_is_clamped() {
        let mut seed = disk_seed(1, 32, 32, 5);
        seed.confidence = 1.7;
        let roi = Roi::new(seed, &flat_image(0)).unwrap();
        assert!((roi.confidence() - 1.0).abs() < f32::EPSILON);
    }

    // --- intersection tests ---

    #[test]
    fn intersection_of_half_overlapping_squares() {
        let image = ImagePlane::zeros(100, 100, Depth::U16, Channels::Gray);
        let square = |id, x| NewRoi {
            id,
            class_id: ClassId(1),
            bbox: Rect::new(x, 10, 20, 20),
            mask: GrayImage::from_pixel(20, 20, Luma([255])),
            confidence: 1.0,
            origin: TileOffset::default(),
            pipeline: 0,
        };
        let a = Roi::new(square(1, 10), &image).unwrap();
        let b = Roi::new(square(2, 20), &image).unwrap();
        let i = a.intersects(&b, 0.45, &image).unwrap();
        assert!((i.metrics.area - 200.0).abs() < f64::EPSILON);
        assert_eq!(i.bbox(), Rect::new(20, 10, 10, 20));
        assert_eq!(i.linked, vec![1, 2]);
        assert!(a.intersects(&b, 0.6, &image).is_none());
    }

    #[test]
    fn intersection_ratio_one_requires_containment() {
        let image = flat_image(0);
        let big = Roi::new(disk_seed(1, 100, 100, 30), &image).unwrap();
        let small = Roi::new(disk_seed(2, 100, 100, 10), &image).unwrap();
        let shifted = Roi::new(disk_seed(3, 125, 100, 10), &image).unwrap();
        assert!(big.intersects(&small, 1.0, &image).is_some());
        assert!(big.intersects(&shifted, 1.0, &image).is_none());
    }

    #[test]
    fn zero_ratio_needs_a_shared_pixel() {
        let image = flat_image(0);
        let a = Roi::new(disk_seed(1, 100, 100, 10), &image).unwrap();
        let b = Roi::new(disk_seed(2, 200, 100, 10), &image).unwrap();
        assert!(a.intersects(&b, 0.0, &image).is_none());
        let c = Roi::new(disk_seed(3, 115, 100, 10), &image).unwrap();
        assert!(a.intersects(&c, 0.0, &image).is_some());
    }

    // --- perimeter tests ---

    #[test]
    fn kulpa_perimeter_of_square_chain() {
        let chain: Vec<Point> = [(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0)]
            .iter()
            .map(|&(x, y)| Point::new(x, y))
            .collect();
        let p = kulpa_perimeter(&chain);
        assert!((p - 4.0 * KULPA_FACTOR).abs() < 1e-12);
    }

    #[test]
    fn clone_into_class_keeps_lineage() {
        let image = flat_image(0);
        let mut roi = Roi::new(disk_seed(1, 50, 50, 5), &image).unwrap();
        roi.parent_id = 7;
        roi.tracking_id = 9;
        let copy = roi.clone_into_class(ClassId(4), 2);
        assert_eq!(copy.id, 2);
        assert_eq!(copy.class_id, ClassId(4));
        assert_eq!(copy.parent_id, 7);
        assert_eq!(copy.tracking_id, 9);
        assert_eq!(copy.mask(), roi.mask());
    }

    // --- property tests ---

    proptest::proptest! {
        #[test]
        fn intersection_ratio_and_mask_stay_bounded(
            (ax, ay, ar) in (20i32..200, 20i32..200, 1i32..20),
            (bx, by, br) in (20i32..200, 20i32..200, 1i32..20),
            min_ratio in 0.0f64..1.0,
        ) {
            let image = ImagePlane::from_fn_u16(256, 256, |_, _| 0);
            let a = Roi::new(disk_seed(1, ax, ay, ar), &image).unwrap();
            let b = Roi::new(disk_seed(2, bx, by, br), &image).unwrap();
            proptest::prop_assert_eq!(a.mask().dimensions(), (a.bbox().width, a.bbox().height));
            if let Some(both) = a.intersects(&b, min_ratio, &image) {
                let bbox = both.bbox();
                proptest::prop_assert_eq!(both.mask().dimensions(), (bbox.width, bbox.height));
                let smaller = a.pixel_count().min(b.pixel_count());
                #[allow(clippy::cast_precision_loss)]
                let ratio = both.pixel_count() as f64 / smaller as f64;
                proptest::prop_assert!(ratio <= 1.0, "ratio {}", ratio);
                proptest::prop_assert!(ratio >= min_ratio, "ratio {} < {}", ratio, min_ratio);
                proptest::prop_assert!(a.bbox().intersection(bbox) == Some(bbox));
            }
        }
    }
}
