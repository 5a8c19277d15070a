//! Uniform grid index over bounding boxes.
//!
//! Every entry is registered in each cell its box covers. Queries collect
//! the entries of all cells a query box covers and keep those whose box
//! strictly overlaps it. Cells are kept in a [`BTreeMap`] so query results
//! come back in a stable order.

use std::collections::{BTreeMap, BTreeSet};

use crate::types::Rect;

/// Edge length of one grid cell in pixels.
pub const CELL_SIZE: i32 = 100;

/// Grid index mapping entry keys to boxes.
#[derive(Debug, Clone, Default)]
pub struct SpatialIndex {
    cells: BTreeMap<(i32, i32), BTreeSet<usize>>,
    boxes: BTreeMap<usize, Rect>,
}

impl SpatialIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.boxes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }

    /// Register `key` with `bbox`, replacing any previous box for `key`.
    pub fn insert(&mut self, key: usize, bbox: Rect) {
        self.remove(key);
        for cell in cells_of(bbox) {
            self.cells.entry(cell).or_default().insert(key);
        }
        self.boxes.insert(key, bbox);
    }

    /// Unregister `key`. Returns its box if it was present.
    pub fn remove(&mut self, key: usize) -> Option<Rect> {
        let bbox = self.boxes.remove(&key)?;
        for cell in cells_of(bbox) {
            if let Some(entries) = self.cells.get_mut(&cell) {
                entries.remove(&key);
                if entries.is_empty() {
                    self.cells.remove(&cell);
                }
            }
        }
        Some(bbox)
    }

    /// Keys whose box strictly overlaps `query`, in ascending key order.
    #[must_use]
    pub fn query(&self, query: Rect) -> Vec<usize> {
        if query.is_empty() {
            return Vec::new();
        }
        let mut found = BTreeSet::new();
        for cell in cells_of(query) {
            let Some(entries) = self.cells.get(&cell) else {
                continue;
            };
            for &key in entries {
                if self.boxes.get(&key).is_some_and(|b| b.overlaps(query)) {
                    found.insert(key);
                }
            }
        }
        found.into_iter().collect()
    }

    pub fn clear(&mut self) {
        self.cells.clear();
        self.boxes.clear();
    }
}

/// Cells covered by `bbox`, from `min / CELL_SIZE` to `max / CELL_SIZE`
/// inclusive on both axes.
fn cells_of(bbox: Rect) -> impl Iterator<Item = (i32, i32)> {
    let x0 = bbox.x.div_euclid(CELL_SIZE);
    let y0 = bbox.y.div_euclid(CELL_SIZE);
    let x1 = (bbox.right() - 1).max(bbox.x).div_euclid(CELL_SIZE);
    let y1 = (bbox.bottom() - 1).max(bbox.y).div_euclid(CELL_SIZE);
    (y0..=y1).flat_map(move |cy| (x0..=x1).map(move |cx| (cx, cy)))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn query_finds_overlapping_boxes_only() {
        let mut index = SpatialIndex::new();
        index.insert(0, Rect::new(10, 10, 20, 20));
        index.insert(1, Rect::new(30, 10, 20, 20));
        index.insert(2, Rect::new(500, 500, 5, 5));
        assert_eq!(index.query(Rect::new(25, 15, 2, 2)), vec![0]);
        assert_eq!(index.query(Rect::new(25, 15, 10, 2)), vec![0, 1]);
        assert!(index.query(Rect::new(200, 200, 10, 10)).is_empty());
    }

    #[test]
    fn boxes_spanning_cells_are_found_from_each_cell() {
        let mut index = SpatialIndex::new();
        index.insert(7, Rect::new(90, 90, 30, 30));
        assert_eq!(index.query(Rect::new(91, 91, 1, 1)), vec![7]);
        assert_eq!(index.query(Rect::new(115, 115, 1, 1)), vec![7]);
    }

    #[test]
    fn remove_clears_all_cells() {
        let mut index = SpatialIndex::new();
        index.insert(1, Rect::new(0, 0, 250, 250));
        assert_eq!(index.remove(1), Some(Rect::new(0, 0, 250, 250)));
        assert!(index.is_empty());
        assert!(index.query(Rect::new(0, 0, 300, 300)).is_empty());
        assert_eq!(index.remove(1), None);
    }

    #[test]
    fn negative_coordinates_are_indexed() {
        let mut index = SpatialIndex::new();
        index.insert(3, Rect::new(-50, -50, 20, 20));
        assert_eq!(index.query(Rect::new(-40, -40, 5, 5)), vec![3]);
    }

    fn arb_rect() -> impl Strategy<Value = Rect> {
        (-200i32..600, -200i32..600, 1u32..180, 1u32..180)
            .prop_map(|(x, y, w, h)| Rect::new(x, y, w, h))
    }

    proptest! {
        #[test]
        fn query_matches_brute_force(
            boxes in prop::collection::vec(arb_rect(), 0..40),
            query in arb_rect(),
        ) {
            let mut index = SpatialIndex::new();
            for (i, b) in boxes.iter().enumerate() {
                index.insert(i, *b);
            }
            let expected: Vec<usize> = boxes
                .iter()
                .enumerate()
                .filter(|(_, b)| b.overlaps(query))
                .map(|(i, _)| i)
                .collect();
            prop_assert_eq!(index.query(query), expected);
        }
    }
}
