//! `$watershed`: split touching blobs of a binary mask.
//!
//! The distance map of the mask is flooded downwards from its maxima. Where
//! two basins meet, a one pixel dam is cut into the mask, unless the lower
//! basin's peak rises less than `tolerance` above the meeting level, in
//! which case the basins merge.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use image::{GrayImage, Luma};
use imageproc::distance_transform::euclidean_squared_distance_transform;
use serde::{Deserialize, Serialize};

use crate::context::ProcessContext;
use crate::error::CommandError;
use crate::image::ImagePlane;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WatershedSettings {
    /// Minimum peak height above the meeting level, in pixels, for two
    /// basins to stay apart. Default 0.5.
    pub tolerance: f32,
}

impl Default for WatershedSettings {
    fn default() -> Self {
        Self { tolerance: 0.5 }
    }
}

impl WatershedSettings {
    pub(crate) fn check(&self) -> Result<(), String> {
        if self.tolerance.is_nan() || self.tolerance < 0.0 {
            return Err(format!("tolerance must not be negative, got {}", self.tolerance));
        }
        Ok(())
    }

    pub(crate) fn execute(&self, ctx: &mut ProcessContext<'_>) -> Result<(), CommandError> {
        self.check().map_err(CommandError::InvalidInput)?;
        let out = self.apply(ctx.active_image());
        ctx.set_active_image(out);
        Ok(())
    }

    /// `mask` with dam lines cut between its basins.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn apply(&self, mask: &ImagePlane) -> ImagePlane {
        let binary = mask.to_binary_mask();
        let dams = dams(&binary, self.tolerance);
        if dams.is_empty() {
            return ImagePlane::from_gray8(binary);
        }
        let width = binary.width() as usize;
        let mut out = binary;
        for i in dams {
            out.put_pixel((i % width) as u32, (i / width) as u32, Luma([0]));
        }
        ImagePlane::from_gray8(out)
    }
}

/// Disjoint-set forest over basins, each root carrying its peak height.
struct Basins {
    parent: Vec<usize>,
    peak: Vec<f32>,
}

impl Basins {
    fn add(&mut self, peak: f32) -> usize {
        self.parent.push(self.parent.len());
        self.peak.push(peak);
        self.parent.len() - 1
    }

    fn find(&mut self, mut b: usize) -> usize {
        while self.parent[b] != b {
            self.parent[b] = self.parent[self.parent[b]];
            b = self.parent[b];
        }
        b
    }
}

const UNLABELED: usize = usize::MAX;

/// Row-major indices of the dam pixels.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss
)]
fn dams(mask: &GrayImage, tolerance: f32) -> Vec<usize> {
    let (w, h) = (mask.width() as usize, mask.height() as usize);
    let fg: Vec<bool> = mask.as_raw().iter().map(|&v| v > 0).collect();
    if !fg.contains(&false) || !fg.contains(&true) {
        return Vec::new();
    }
    let background = GrayImage::from_fn(mask.width(), mask.height(), |x, y| {
        Luma([if mask.get_pixel(x, y)[0] > 0 { 0 } else { 255 }])
    });
    let dist: Vec<f32> = euclidean_squared_distance_transform(&background)
        .pixels()
        .map(|p| f64::from(p[0]).sqrt() as f32)
        .collect();

    let neighbours = move |i: usize| {
        let (x, y) = ((i % w) as i64, (i / w) as i64);
        [(-1, -1), (0, -1), (1, -1), (-1, 0), (1, 0), (-1, 1), (0, 1), (1, 1)]
            .into_iter()
            .map(move |(dx, dy)| (x + dx, y + dy))
            .filter(move |&(nx, ny)| nx >= 0 && ny >= 0 && (nx as usize) < w && (ny as usize) < h)
            .map(move |(nx, ny)| ny as usize * w + nx as usize)
    };

    let seed: Vec<bool> = (0..w * h)
        .map(|i| fg[i] && neighbours(i).all(|n| dist[i] >= dist[n]))
        .collect();

    let mut label = vec![UNLABELED; w * h];
    let mut basins = Basins {
        parent: Vec::new(),
        peak: Vec::new(),
    };
    for start in 0..w * h {
        if !seed[start] || label[start] != UNLABELED {
            continue;
        }
        let b = basins.add(dist[start]);
        label[start] = b;
        let mut stack = vec![start];
        while let Some(i) = stack.pop() {
            for n in neighbours(i) {
                if seed[n] && label[n] == UNLABELED {
                    label[n] = b;
                    basins.peak[b] = basins.peak[b].max(dist[n]);
                    stack.push(n);
                }
            }
        }
    }

    let mut queued = vec![false; w * h];
    let mut heap = BinaryHeap::new();
    let enqueue = |i: usize, queued: &mut [bool], heap: &mut BinaryHeap<_>, label: &[usize]| {
        for n in neighbours(i) {
            if fg[n] && label[n] == UNLABELED && !queued[n] {
                queued[n] = true;
                // Non-negative floats order like their bit patterns.
                heap.push((dist[n].to_bits(), Reverse(n)));
            }
        }
    };
    for i in 0..w * h {
        if label[i] != UNLABELED {
            enqueue(i, &mut queued, &mut heap, &label);
        }
    }

    let mut dams = Vec::new();
    while let Some((level, Reverse(i))) = heap.pop() {
        let level = f32::from_bits(level);
        let mut roots: Vec<usize> = neighbours(i)
            .filter(|&n| label[n] != UNLABELED)
            .map(|n| basins.find(label[n]))
            .collect();
        roots.sort_unstable();
        roots.dedup();
        let Some(&best) = roots
            .iter()
            .max_by(|&&a, &&b| basins.peak[a].total_cmp(&basins.peak[b]).then(b.cmp(&a)))
        else {
            continue;
        };
        roots.retain(|&r| {
            if r != best && basins.peak[r] - level <= tolerance {
                basins.parent[r] = best;
                false
            } else {
                r != best
            }
        });
        if roots.is_empty() {
            label[i] = best;
            enqueue(i, &mut queued, &mut heap, &label);
        } else {
            dams.push(i);
        }
    }
    dams
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::context::testing::Harness;
    use imageproc::region_labelling::{Connectivity, connected_components};

    fn disks(width: u32, height: u32, centres: &[(i64, i64)], r: i64) -> ImagePlane {
        ImagePlane::from_fn_u16(width, height, |x, y| {
            let inside = centres.iter().any(|&(cx, cy)| {
                let (dx, dy) = (i64::from(x) - cx, i64::from(y) - cy);
                dx * dx + dy * dy <= r * r
            });
            u16::from(inside)
        })
    }

    fn components(plane: &ImagePlane) -> u32 {
        let labels = connected_components(&plane.to_binary_mask(), Connectivity::Eight, Luma([0]));
        labels.pixels().map(|p| p[0]).max().unwrap_or(0)
    }

    // --- splitting tests ---

    #[test]
    fn touching_disks_are_cut_at_the_neck() {
        let input = disks(72, 50, &[(25, 25), (47, 25)], 12);
        assert_eq!(components(&input), 1);
        let out = WatershedSettings::default().apply(&input);
        assert_eq!(components(&out), 2);
        let before = input.to_binary_mask();
        let after = out.to_binary_mask();
        let mut removed = 0;
        for (x, y, p) in before.enumerate_pixels() {
            if p[0] > 0 && after.get_pixel(x, y)[0] == 0 {
                assert!((34..=38).contains(&x), "cut at ({x}, {y})");
                removed += 1;
            }
        }
        assert!(removed > 0);
    }

    #[test]
    fn single_disk_is_left_whole() {
        let input = disks(40, 40, &[(20, 20)], 12);
        let out = WatershedSettings::default().apply(&input);
        assert_eq!(out.to_binary_mask(), input.to_binary_mask());
    }

    #[test]
    fn high_tolerance_merges_the_basins() {
        let input = disks(72, 50, &[(25, 25), (47, 25)], 12);
        let out = WatershedSettings { tolerance: 20.0 }.apply(&input);
        assert_eq!(components(&out), 1);
    }

    #[test]
    fn full_and_empty_masks_pass_through() {
        let full = ImagePlane::from_fn_u16(8, 8, |_, _| 1);
        let empty = ImagePlane::from_fn_u16(8, 8, |_, _| 0);
        let settings = WatershedSettings::default();
        assert_eq!(settings.apply(&full).to_binary_mask(), full.to_binary_mask());
        assert_eq!(settings.apply(&empty).to_binary_mask(), empty.to_binary_mask());
    }

    #[test]
    fn execute_rejects_negative_tolerance() {
        let mut harness = Harness::new(disks(72, 50, &[(25, 25), (47, 25)], 12));
        let mut ctx = harness.context();
        assert!(WatershedSettings { tolerance: -1.0 }.execute(&mut ctx).is_err());
        WatershedSettings::default().execute(&mut ctx).unwrap();
        assert_eq!(components(ctx.active_image()), 2);
    }
}
