//! Per-tile object store.
//!
//! [`ObjectList`] keeps ROIs in an arena of slots. Each slot index is
//! registered in a per-class member set and in a [`SpatialIndex`] so that
//! class iteration and collision queries never scan the whole list.
//! Iteration order is insertion order.

use std::collections::{BTreeMap, BTreeSet};

use crate::roi::Roi;
use crate::spatial::SpatialIndex;
use crate::types::{ClassId, ObjectId, Rect};

/// All objects detected on one tile, grouped by class.
#[derive(Debug, Clone, Default)]
pub struct ObjectList {
    slots: Vec<Option<Roi>>,
    by_class: BTreeMap<ClassId, BTreeSet<usize>>,
    by_id: BTreeMap<ObjectId, usize>,
    index: SpatialIndex,
}

impl ObjectList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Store `roi`. An object with the same id is replaced.
    pub fn push(&mut self, roi: Roi) {
        self.remove(roi.id);
        let slot = self.slots.len();
        self.by_class.entry(roi.class_id).or_default().insert(slot);
        self.by_id.insert(roi.id, slot);
        self.index.insert(slot, roi.bbox());
        self.slots.push(Some(roi));
    }

    /// Remove and return the object with `id`.
    pub fn remove(&mut self, id: ObjectId) -> Option<Roi> {
        let slot = self.by_id.remove(&id)?;
        let roi = self.slots.get_mut(slot)?.take()?;
        if let Some(members) = self.by_class.get_mut(&roi.class_id) {
            members.remove(&slot);
            if members.is_empty() {
                self.by_class.remove(&roi.class_id);
            }
        }
        self.index.remove(slot);
        Some(roi)
    }

    #[must_use]
    pub fn get(&self, id: ObjectId) -> Option<&Roi> {
        let slot = *self.by_id.get(&id)?;
        self.slots.get(slot)?.as_ref()
    }

    /// Apply `f` to the object with `id`, keeping the class index in sync.
    ///
    /// Returns `false` when no such object exists.
    pub fn modify(&mut self, id: ObjectId, f: impl FnOnce(&mut Roi)) -> bool {
        let Some(&slot) = self.by_id.get(&id) else {
            return false;
        };
        let Some(roi) = self.slots.get_mut(slot).and_then(Option::as_mut) else {
            return false;
        };
        let before = roi.class_id;
        f(roi);
        let after = roi.class_id;
        // Ids are the arena key and must not change through this path.
        roi.id = id;
        if before != after {
            if let Some(members) = self.by_class.get_mut(&before) {
                members.remove(&slot);
                if members.is_empty() {
                    self.by_class.remove(&before);
                }
            }
            self.by_class.entry(after).or_default().insert(slot);
        }
        true
    }

    /// All objects in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Roi> {
        self.slots.iter().filter_map(Option::as_ref)
    }

    /// Objects of `class` in insertion order.
    pub fn iter_class(&self, class: ClassId) -> impl Iterator<Item = &Roi> {
        self.by_class
            .get(&class)
            .into_iter()
            .flatten()
            .filter_map(|&slot| self.slots.get(slot).and_then(Option::as_ref))
    }

    /// Ids of the objects of `class` in insertion order.
    #[must_use]
    pub fn ids_of_class(&self, class: ClassId) -> Vec<ObjectId> {
        self.iter_class(class).map(|r| r.id).collect()
    }

    #[must_use]
    pub fn count(&self, class: ClassId) -> usize {
        self.by_class.get(&class).map_or(0, BTreeSet::len)
    }

    /// Classes that currently hold at least one object.
    pub fn classes(&self) -> impl Iterator<Item = ClassId> + '_ {
        self.by_class.keys().copied()
    }

    /// Ids of objects in any of `classes` whose box strictly overlaps
    /// `bbox`, in insertion order.
    #[must_use]
    pub fn find_colliding(&self, bbox: Rect, classes: &BTreeSet<ClassId>) -> Vec<ObjectId> {
        self.index
            .query(bbox)
            .into_iter()
            .filter_map(|slot| self.slots.get(slot).and_then(Option::as_ref))
            .filter(|roi| classes.contains(&roi.class_id))
            .map(|roi| roi.id)
            .collect()
    }

    /// Largest id currently stored, `0` when empty.
    #[must_use]
    pub fn max_id(&self) -> ObjectId {
        self.by_id.keys().next_back().copied().unwrap_or(0)
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.by_class.clear();
        self.by_id.clear();
        self.index.clear();
    }
}
