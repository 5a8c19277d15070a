//! `$reclassify`: change the class of objects by their overlap with others.
//!
//! Objects of `inputClasses` are tested against objects of
//! `intersectingClasses`. With `APPLY_IF_MATCH` the ones that overlap by at
//! least `minIntersection` are moved or copied into `newClass`; with
//! `APPLY_IF_NOT_MATCH` the ones that do not. Without intersecting classes
//! every input object is reclassified.
//!
//! Decisions are taken against the object list as it was when the command
//! started, so an object reclassified early cannot influence a later one.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::colocalization::ReclassifyMode;
use crate::context::ProcessContext;
use crate::error::CommandError;
use crate::types::{ClassIdIn, ObjectId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FilterLogic {
    #[default]
    ApplyIfMatch,
    ApplyIfNotMatch,
}

/// Parent handling for reclassified objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HierarchyMode {
    /// The intersecting object becomes the parent.
    CreateTree,
    #[default]
    KeepExisting,
    /// Clear the parent.
    Remove,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReclassifySettings {
    pub input_classes: Vec<ClassIdIn>,
    pub intersecting_classes: Vec<ClassIdIn>,
    pub min_intersection: f64,
    pub new_class: ClassIdIn,
    pub mode: ReclassifyMode,
    pub filter: FilterLogic,
    pub hierarchy: HierarchyMode,
}

impl Default for ReclassifySettings {
    fn default() -> Self {
        Self {
            input_classes: Vec::new(),
            intersecting_classes: Vec::new(),
            min_intersection: 0.1,
            new_class: ClassIdIn::Default,
            mode: ReclassifyMode::Move,
            filter: FilterLogic::default(),
            hierarchy: HierarchyMode::default(),
        }
    }
}

/// What happens to one input object.
struct Decision {
    id: ObjectId,
    partner: Option<ObjectId>,
}

impl ReclassifySettings {
    pub(crate) fn execute(&self, ctx: &mut ProcessContext<'_>) -> Result<(), CommandError> {
        let inputs: BTreeSet<_> = ctx.resolve_classes(&self.input_classes)?.into_iter().collect();
        let against: BTreeSet<_> = ctx
            .resolve_classes(&self.intersecting_classes)?
            .into_iter()
            .collect();
        let new_class = ctx.resolve_class(self.new_class)?;
        let measurement = ctx.measurement_plane().clone();

        let objects = ctx.objects();
        let decisions: Vec<Decision> = objects
            .iter()
            .filter(|roi| inputs.contains(&roi.class_id))
            .filter_map(|roi| {
                if against.is_empty() {
                    return Some(Decision {
                        id: roi.id,
                        partner: None,
                    });
                }
                let partner = objects
                    .find_colliding(roi.bbox(), &against)
                    .into_iter()
                    .filter(|&id| id != roi.id)
                    .filter_map(|id| objects.get(id))
                    .find(|other| {
                        roi.intersects(other, self.min_intersection, &measurement)
                            .is_some()
                    })
                    .map(|other| other.id);
                let apply = match self.filter {
                    FilterLogic::ApplyIfMatch => partner.is_some(),
                    FilterLogic::ApplyIfNotMatch => partner.is_none(),
                };
                apply.then_some(Decision { id: roi.id, partner })
            })
            .collect();

        let changed = decisions.len();
        for Decision { id, partner } in decisions {
            let hierarchy = self.hierarchy;
            let reparent = move |parent: &mut ObjectId| match hierarchy {
                HierarchyMode::CreateTree => {
                    if let Some(p) = partner {
                        *parent = p;
                    }
                }
                HierarchyMode::KeepExisting => {}
                HierarchyMode::Remove => *parent = 0,
            };
            match self.mode {
                ReclassifyMode::Move => {
                    ctx.objects_mut().modify(id, |roi| {
                        roi.class_id = new_class;
                        reparent(&mut roi.parent_id);
                    });
                }
                ReclassifyMode::Copy => {
                    let new_id = ctx.next_object_id();
                    let pipeline = ctx.pipeline_index();
                    let Some(mut copy) = ctx
                        .objects()
                        .get(id)
                        .map(|roi| roi.clone_into_class(new_class, new_id))
                    else {
                        continue;
                    };
                    reparent(&mut copy.parent_id);
                    copy.pipeline = pipeline;
                    ctx.objects_mut().push(copy);
                }
            }
        }
        tracing::debug!(changed, new_class = %new_class, "reclassified objects");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::context::testing::Harness;
    use crate::image::ImagePlane;
    use crate::roi::Roi;
    use crate::roi::tests::disk_seed;
    use crate::types::ClassId;

    const SPOT: ClassId = ClassId(1);
    const NUCLEUS: ClassId = ClassId(2);
    const INSIDE: ClassId = ClassId(3);

    fn add(ctx: &mut ProcessContext<'_>, id: ObjectId, class: ClassId, cx: i32, cy: i32, r: i32) {
        let mut seed = disk_seed(id, cx, cy, r);
        seed.class_id = class;
        let roi = Roi::new(seed, ctx.measurement_plane()).unwrap();
        ctx.objects_mut().push(roi);
    }

    /// A nucleus with one spot inside and one spot far away.
    fn scene(ctx: &mut ProcessContext<'_>) {
        add(ctx, 10, NUCLEUS, 50, 50, 20);
        add(ctx, 1, SPOT, 50, 50, 3);
        add(ctx, 2, SPOT, 150, 150, 3);
    }

    fn settings(filter: FilterLogic, mode: ReclassifyMode) -> ReclassifySettings {
        ReclassifySettings {
            input_classes: vec![ClassIdIn::Id(SPOT)],
            intersecting_classes: vec![ClassIdIn::Id(NUCLEUS)],
            min_intersection: 0.5,
            new_class: ClassIdIn::Id(INSIDE),
            mode,
            filter,
            hierarchy: HierarchyMode::CreateTree,
        }
    }

    #[test]
    fn move_keeps_total_count() {
        let mut h = Harness::new(ImagePlane::from_fn_u16(200, 200, |_, _| 0));
        let mut ctx = h.context();
        scene(&mut ctx);
        settings(FilterLogic::ApplyIfMatch, ReclassifyMode::Move)
            .execute(&mut ctx)
            .unwrap();
        assert_eq!(ctx.objects().len(), 3);
        let moved = ctx.objects().get(1).unwrap();
        assert_eq!(moved.class_id, INSIDE);
        assert_eq!(moved.parent_id, 10);
        assert_eq!(ctx.objects().get(2).unwrap().class_id, SPOT);
    }

    #[test]
    fn not_match_selects_the_outsiders() {
        let mut h = Harness::new(ImagePlane::from_fn_u16(200, 200, |_, _| 0));
        let mut ctx = h.context();
        scene(&mut ctx);
        settings(FilterLogic::ApplyIfNotMatch, ReclassifyMode::Move)
            .execute(&mut ctx)
            .unwrap();
        assert_eq!(ctx.objects().get(1).unwrap().class_id, SPOT);
        let outsider = ctx.objects().get(2).unwrap();
        assert_eq!(outsider.class_id, INSIDE);
        assert_eq!(outsider.parent_id, 0, "no partner, no parent");
    }

    #[test]
    fn copy_adds_a_new_object() {
        let mut h = Harness::new(ImagePlane::from_fn_u16(200, 200, |_, _| 0));
        let mut ctx = h.context();
        scene(&mut ctx);
        settings(FilterLogic::ApplyIfMatch, ReclassifyMode::Copy)
            .execute(&mut ctx)
            .unwrap();
        assert_eq!(ctx.objects().len(), 4);
        assert_eq!(ctx.objects().count(SPOT), 2);
        let copy = ctx.objects().iter_class(INSIDE).next().unwrap();
        assert_ne!(copy.id, 1);
        assert_eq!(copy.parent_id, 10);
    }

    #[test]
    fn without_intersecting_classes_everything_moves() {
        let mut h = Harness::new(ImagePlane::from_fn_u16(200, 200, |_, _| 0));
        let mut ctx = h.context();
        scene(&mut ctx);
        let mut s = settings(FilterLogic::ApplyIfMatch, ReclassifyMode::Move);
        s.intersecting_classes.clear();
        s.hierarchy = HierarchyMode::Remove;
        s.execute(&mut ctx).unwrap();
        assert_eq!(ctx.objects().count(SPOT), 0);
        assert_eq!(ctx.objects().count(INSIDE), 2);
    }

    #[test]
    fn parses_settings_json() {
        let s: ReclassifySettings = serde_json::from_str(
            r#"{"inputClasses": ["$1"], "filter": "APPLY_IF_NOT_MATCH", "hierarchy": "REMOVE", "mode": "RECLASSIFY_COPY"}"#,
        )
        .unwrap();
        assert_eq!(s.filter, FilterLogic::ApplyIfNotMatch);
        assert_eq!(s.hierarchy, HierarchyMode::Remove);
        assert_eq!(s.mode, ReclassifyMode::Copy);
    }
}
