//! `$colocalization`: objects present in every one of several classes.
//!
//! The input classes are intersected as a chain: every object of the
//! first class, in list order, starts a candidate that is intersected
//! with a colliding, still unclaimed object of the next class that
//! overlaps enough, and so on. When a partner leads to a dead end further
//! down the chain the next partner is tried. Inputs are claimed only once
//! the whole chain succeeds, so every input object takes part in at most
//! one result and a failed chain blocks nothing.
//!
//! Each surviving candidate becomes a new object of the output class,
//! linked to all its inputs. `RECLASSIFY_MOVE` removes the inputs,
//! `RECLASSIFY_COPY` leaves them in place.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::context::ProcessContext;
use crate::error::CommandError;
use crate::image::ImagePlane;
use crate::objects::ObjectList;
use crate::roi::Roi;
use crate::types::{ClassId, ClassIdIn, ObjectId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReclassifyMode {
    #[serde(rename = "RECLASSIFY_MOVE")]
    Move,
    #[default]
    #[serde(rename = "RECLASSIFY_COPY")]
    Copy,
}

/// How tracking ids are set on a result and its inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrackingMode {
    /// The result's id becomes the tracking id of the result and inputs.
    #[default]
    Override,
    /// The first input tracking id wins; untracked inputs adopt it.
    KeepExisting,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ColocalizationSettings {
    pub input_classes: Vec<ClassIdIn>,
    /// Minimum `area(AND) / min(area)` at every step of the chain.
    pub min_intersection: f64,
    pub output_class: ClassIdIn,
    pub mode: ReclassifyMode,
    pub tracking_mode: TrackingMode,
}

impl Default for ColocalizationSettings {
    fn default() -> Self {
        Self {
            input_classes: Vec::new(),
            min_intersection: 0.1,
            output_class: ClassIdIn::Default,
            mode: ReclassifyMode::default(),
            tracking_mode: TrackingMode::default(),
        }
    }
}

/// A chain in progress: the running intersection and the inputs used.
struct Candidate {
    shape: Roi,
    inputs: Vec<ObjectId>,
}

impl ColocalizationSettings {
    pub(crate) fn check(&self) -> Result<(), String> {
        if self.input_classes.len() < 2 {
            return Err(format!(
                "needs at least two input classes, got {}",
                self.input_classes.len()
            ));
        }
        if !(0.0..=1.0).contains(&self.min_intersection) {
            return Err(format!(
                "minIntersection must be within 0..1, got {}",
                self.min_intersection
            ));
        }
        Ok(())
    }

    pub(crate) fn execute(&self, ctx: &mut ProcessContext<'_>) -> Result<(), CommandError> {
        self.check().map_err(CommandError::InvalidInput)?;
        let classes = ctx.resolve_classes(&self.input_classes)?;
        let output = ctx.resolve_class(self.output_class)?;
        let measurement = ctx.measurement_plane().clone();

        let objects = ctx.objects();
        let mut used: BTreeSet<ObjectId> = BTreeSet::new();
        let mut candidates: Vec<Candidate> = Vec::new();
        for first in objects.iter_class(classes[0]) {
            let start = Candidate {
                shape: first.clone(),
                inputs: vec![first.id],
            };
            if let Some(chain) = self.complete(start, &classes[1..], &used, objects, &measurement) {
                used.extend(chain.inputs.iter().copied());
                candidates.push(chain);
            }
        }

        let consumed: BTreeSet<ObjectId> =
            candidates.iter().flat_map(|c| c.inputs.iter().copied()).collect();

        let created = candidates.len();
        for Candidate { mut shape, inputs } in candidates {
            let id = ctx.next_object_id();
            let tracking = match self.tracking_mode {
                TrackingMode::Override => id,
                TrackingMode::KeepExisting => inputs
                    .iter()
                    .filter_map(|i| ctx.objects().get(*i))
                    .map(|r| r.tracking_id)
                    .find(|&t| t != 0)
                    .unwrap_or(id),
            };
            shape.id = id;
            shape.class_id = output;
            shape.parent_id = 0;
            shape.tracking_id = tracking;
            shape.pipeline = ctx.pipeline_index();
            shape.linked.clone_from(&inputs);
            for input in &inputs {
                match self.mode {
                    ReclassifyMode::Move => {
                        ctx.objects_mut().remove(*input);
                    }
                    ReclassifyMode::Copy => {
                        ctx.objects_mut().modify(*input, |roi| {
                            if self.tracking_mode == TrackingMode::Override || roi.tracking_id == 0 {
                                roi.tracking_id = tracking;
                            }
                        });
                    }
                }
            }
            ctx.objects_mut().push(shape);
        }
        tracing::debug!(
            created,
            consumed = consumed.len(),
            output = %output,
            "colocalization"
        );
        Ok(())
    }

    /// Extend `candidate` through `rest`, or `None` when no combination of
    /// unclaimed partners reaches the last class.
    fn complete(
        &self,
        candidate: Candidate,
        rest: &[ClassId],
        used: &BTreeSet<ObjectId>,
        objects: &ObjectList,
        measurement: &ImagePlane,
    ) -> Option<Candidate> {
        let Some((&class, rest)) = rest.split_first() else {
            return Some(candidate);
        };
        let wanted = BTreeSet::from([class]);
        objects
            .find_colliding(candidate.shape.bbox(), &wanted)
            .into_iter()
            .filter(|id| !used.contains(id))
            .filter_map(|id| objects.get(id))
            .find_map(|other| {
                let shape = candidate
                    .shape
                    .intersects(other, self.min_intersection, measurement)?;
                let mut inputs = candidate.inputs.clone();
                inputs.push(other.id);
                self.complete(Candidate { shape, inputs }, rest, used, objects, measurement)
            })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::context::testing::Harness;
    use crate::image::ImagePlane;
    use crate::roi::tests::disk_seed;

    const RED: ClassId = ClassId(1);
    const GREEN: ClassId = ClassId(2);
    const BLUE: ClassId = ClassId(3);
    const OUT: ClassId = ClassId(4);

    fn harness() -> Harness {
        Harness::new(ImagePlane::from_fn_u16(200, 200, |_, _| 100))
    }

    fn add(ctx: &mut ProcessContext<'_>, id: ObjectId, class: ClassId, cx: i32, cy: i32, r: i32) {
        let mut seed = disk_seed(id, cx, cy, r);
        seed.class_id = class;
        let roi = Roi::new(seed, ctx.measurement_plane()).unwrap();
        ctx.objects_mut().push(roi);
    }

    fn settings(classes: &[ClassId], mode: ReclassifyMode) -> ColocalizationSettings {
        ColocalizationSettings {
            input_classes: classes.iter().map(|&c| ClassIdIn::Id(c)).collect(),
            min_intersection: 0.1,
            output_class: ClassIdIn::Id(OUT),
            mode,
            tracking_mode: TrackingMode::Override,
        }
    }

    #[test]
    fn pairs_emit_one_object_each() {
        let mut h = harness();
        let mut ctx = h.context();
        add(&mut ctx, 1, RED, 50, 50, 10);
        add(&mut ctx, 2, GREEN, 55, 50, 10);
        add(&mut ctx, 3, RED, 150, 150, 10);
        add(&mut ctx, 4, GREEN, 20, 180, 10);
        settings(&[RED, GREEN], ReclassifyMode::Copy)
            .execute(&mut ctx)
            .unwrap();
        let out: Vec<_> = ctx.objects().iter_class(OUT).collect();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].linked, vec![1, 2]);
        assert_eq!(out[0].tracking_id, out[0].id);
        assert_eq!(ctx.objects().get(1).unwrap().tracking_id, out[0].id);
        assert_eq!(ctx.objects().count(RED), 2, "copy keeps inputs");
    }

    #[test]
    fn move_removes_consumed_inputs_only() {
        let mut h = harness();
        let mut ctx = h.context();
        add(&mut ctx, 1, RED, 50, 50, 10);
        add(&mut ctx, 2, GREEN, 55, 50, 10);
        add(&mut ctx, 3, RED, 150, 150, 10);
        settings(&[RED, GREEN], ReclassifyMode::Move)
            .execute(&mut ctx)
            .unwrap();
        assert!(ctx.objects().get(1).is_none());
        assert!(ctx.objects().get(2).is_none());
        assert!(ctx.objects().get(3).is_some());
        assert_eq!(ctx.objects().count(OUT), 1);
    }

    #[test]
    fn each_input_is_used_once() {
        let mut h = harness();
        let mut ctx = h.context();
        // Two reds both overlapping a single green.
        add(&mut ctx, 1, RED, 50, 50, 10);
        add(&mut ctx, 2, RED, 60, 50, 10);
        add(&mut ctx, 3, GREEN, 55, 50, 10);
        settings(&[RED, GREEN], ReclassifyMode::Copy)
            .execute(&mut ctx)
            .unwrap();
        let out: Vec<_> = ctx.objects().iter_class(OUT).collect();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].linked, vec![1, 3], "first red wins");
    }

    #[test]
    fn three_classes_chain() {
        let mut h = harness();
        let mut ctx = h.context();
        add(&mut ctx, 1, RED, 50, 50, 12);
        add(&mut ctx, 2, GREEN, 54, 50, 12);
        add(&mut ctx, 3, BLUE, 52, 54, 12);
        add(&mut ctx, 4, RED, 150, 50, 12);
        add(&mut ctx, 5, GREEN, 152, 50, 12);
        settings(&[RED, GREEN, BLUE], ReclassifyMode::Copy)
            .execute(&mut ctx)
            .unwrap();
        let out: Vec<_> = ctx.objects().iter_class(OUT).collect();
        assert_eq!(out.len(), 1, "the second chain has no blue partner");
        assert_eq!(out[0].linked, vec![1, 2, 3]);
        assert!(out[0].metrics.area < ctx.objects().get(1).unwrap().metrics.area);
    }

    #[test]
    fn failed_chain_leaves_its_partners_to_later_chains() {
        let mut h = harness();
        let mut ctx = h.context();
        // Both reds overlap the green; only the second red's overlap
        // reaches the blue.
        add(&mut ctx, 1, RED, 40, 50, 10);
        add(&mut ctx, 2, RED, 70, 50, 10);
        add(&mut ctx, 3, GREEN, 55, 50, 10);
        add(&mut ctx, 4, BLUE, 63, 50, 3);
        let mut s = settings(&[RED, GREEN, BLUE], ReclassifyMode::Move);
        s.min_intersection = 0.05;
        s.execute(&mut ctx).unwrap();

        let out: Vec<_> = ctx.objects().iter_class(OUT).collect();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].linked, vec![2, 3, 4]);
        assert!(ctx.objects().get(1).is_some(), "the failed chain's red is not moved");
        assert!(ctx.objects().get(3).is_none());
    }

    #[test]
    fn keep_existing_inherits_tracking() {
        let mut h = harness();
        let mut ctx = h.context();
        add(&mut ctx, 1, RED, 50, 50, 10);
        add(&mut ctx, 2, GREEN, 55, 50, 10);
        ctx.objects_mut().modify(2, |r| r.tracking_id = 77);
        let mut s = settings(&[RED, GREEN], ReclassifyMode::Copy);
        s.tracking_mode = TrackingMode::KeepExisting;
        s.execute(&mut ctx).unwrap();
        let out = ctx.objects().iter_class(OUT).next().unwrap();
        assert_eq!(out.tracking_id, 77);
        assert_eq!(ctx.objects().get(1).unwrap().tracking_id, 77);
    }

    #[test]
    fn single_input_class_is_rejected() {
        assert!(settings(&[RED], ReclassifyMode::Copy).check().is_err());
    }

    #[test]
    fn mode_names_match_settings_files() {
        let s: ColocalizationSettings = serde_json::from_str(
            r#"{"inputClasses": ["$1", "$2"], "mode": "RECLASSIFY_MOVE", "trackingMode": "KEEP_EXISTING"}"#,
        )
        .unwrap();
        assert_eq!(s.mode, ReclassifyMode::Move);
        assert_eq!(s.tracking_mode, TrackingMode::KeepExisting);
        assert_eq!(s.input_classes, vec![ClassIdIn::Indexed(1), ClassIdIn::Indexed(2)]);
    }
}
