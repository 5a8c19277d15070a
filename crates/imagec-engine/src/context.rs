//! Per-tile and per-pipeline execution state.
//!
//! [`IterationState`] lives for one work unit (image, t-stack, tile) and is
//! shared by all pipelines that run on it: the `ITERATION` image cache, the
//! object list, the loaded channel planes and the rows waiting to be
//! stored. [`ProcessContext`] wraps it for one pipeline and adds the
//! `PIPELINE` image cache and the active image; dropping the context drops
//! that cache.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::detector::{Detector, DetectorProvider};
use crate::error::{CacheMiss, CommandError};
use crate::image::{Channels, Depth, ImagePlane};
use crate::objects::ObjectList;
use crate::pipeline::{PipelinePlan, PipelineSource, PlaneKey};
use crate::results::ImageStatsRow;
use crate::settings::Classification;
use crate::types::{
    CacheScope, ClassId, ClassIdIn, Dimensions, ImageId, ImageValidity, MemoryId, ObjectId, Rect,
};

/// Shared cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Position of a tile inside its image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileInfo {
    /// Linear tile index, `-1` when the whole image is one tile.
    pub index: i32,
    pub tile_x: i32,
    pub tile_y: i32,
    /// Top-left corner in image coordinates.
    pub origin_x: i32,
    pub origin_y: i32,
    pub width: u32,
    pub height: u32,
    /// Tile-local part that lies inside the image; the rest is zero padding.
    pub valid_rect: Rect,
    pub image_size: Dimensions,
    pub t_stack: i32,
}

impl TileInfo {
    /// The whole image as a single tile.
    #[must_use]
    pub const fn whole(image_size: Dimensions, t_stack: i32) -> Self {
        Self {
            index: -1,
            tile_x: -1,
            tile_y: -1,
            origin_x: 0,
            origin_y: 0,
            width: image_size.width,
            height: image_size.height,
            valid_rect: Rect::from_dimensions(image_size),
            image_size,
            t_stack,
        }
    }

    /// Tile rectangle in image coordinates, including padding.
    #[must_use]
    pub const fn image_rect(&self) -> Rect {
        Rect::new(self.origin_x, self.origin_y, self.width, self.height)
    }
}

/// Image planes stored by memory slot.
#[derive(Debug, Clone, Default)]
pub struct ImageCache {
    entries: HashMap<ImageId, ImagePlane>,
}

impl ImageCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `plane` under `id`, replacing any previous entry.
    pub fn store(&mut self, id: ImageId, plane: ImagePlane) {
        self.entries.insert(id, plane);
    }

    /// Cheap clone of the plane stored under `id`.
    #[must_use]
    pub fn load(&self, id: &ImageId) -> Option<ImagePlane> {
        self.entries.get(id).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Hands out object ids that are unique per job and reproducible per work
/// unit: `((image_seq + 1) << 40) | (unit_seq << 20) | counter`.
#[derive(Debug, Clone)]
pub struct ObjectIdAllocator {
    base: u64,
    counter: u64,
}

impl ObjectIdAllocator {
    const UNIT_SHIFT: u32 = 20;
    const IMAGE_SHIFT: u32 = 40;

    #[must_use]
    pub const fn for_work_unit(image_seq: u64, unit_seq: u64) -> Self {
        Self {
            base: ((image_seq + 1) << Self::IMAGE_SHIFT) | (unit_seq << Self::UNIT_SHIFT),
            counter: 0,
        }
    }

    /// Next id. Never `0`.
    pub const fn next_id(&mut self) -> ObjectId {
        self.counter += 1;
        self.base | self.counter
    }
}

/// Identity of the image a work unit belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageLabel {
    pub image_id: u64,
    /// File stem, used to name control images.
    pub stem: String,
}

/// State shared by every pipeline running on one work unit.
#[derive(Debug)]
pub struct IterationState {
    pub image: ImageLabel,
    pub cache: ImageCache,
    pub objects: ObjectList,
    ids: ObjectIdAllocator,
    planes: BTreeMap<PlaneKey, ImagePlane>,
    /// Pipelines that requested object storage, with cross-channel c-stacks.
    stored: BTreeMap<usize, BTreeSet<i32>>,
    stats: Vec<ImageStatsRow>,
}

impl IterationState {
    #[must_use]
    pub fn new(image: ImageLabel, ids: ObjectIdAllocator) -> Self {
        Self {
            image,
            cache: ImageCache::new(),
            objects: ObjectList::new(),
            ids,
            planes: BTreeMap::new(),
            stored: BTreeMap::new(),
            stats: Vec::new(),
        }
    }

    /// Register a loaded channel plane.
    pub fn insert_plane(&mut self, key: PlaneKey, plane: ImagePlane) {
        self.planes.insert(key, plane);
    }

    #[must_use]
    pub fn plane(&self, key: &PlaneKey) -> Option<&ImagePlane> {
        self.planes.get(key)
    }

    pub const fn next_object_id(&mut self) -> ObjectId {
        self.ids.next_id()
    }

    /// Pipelines whose objects are stored, in pipeline order.
    #[must_use]
    pub const fn stored_pipelines(&self) -> &BTreeMap<usize, BTreeSet<i32>> {
        &self.stored
    }

    /// Take the per-tile statistics rows.
    pub fn take_stats(&mut self) -> Vec<ImageStatsRow> {
        std::mem::take(&mut self.stats)
    }
}

/// Job-wide inputs shared read-only by every context.
#[derive(Clone, Copy)]
pub struct Environment<'a> {
    pub classification: &'a Classification,
    pub detectors: &'a dyn DetectorProvider,
    /// Physical edge length of one pixel.
    pub pixel_size: f64,
    pub control_image_folder: Option<&'a Path>,
}

impl std::fmt::Debug for Environment<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("classification", &self.classification)
            .field("pixel_size", &self.pixel_size)
            .field("control_image_folder", &self.control_image_folder)
            .finish_non_exhaustive()
    }
}

/// Execution state of one pipeline on one work unit.
pub struct ProcessContext<'a> {
    env: Environment<'a>,
    plan: &'a PipelinePlan,
    tile: TileInfo,
    iteration: &'a mut IterationState,
    pipeline_cache: ImageCache,
    active: ImagePlane,
    measurement: ImagePlane,
    /// Lower bound of the last global threshold.
    applied_threshold: Option<f64>,
    validity: ImageValidity,
    invalidate_image: bool,
    cancel: &'a CancellationToken,
}

impl<'a> ProcessContext<'a> {
    /// Build the context and its initial image from the pipeline source.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::CacheMiss`] when a memory source slot is
    /// empty and [`CommandError::InvalidInput`] when the file plane was not
    /// loaded for this work unit.
    pub fn new(
        env: Environment<'a>,
        plan: &'a PipelinePlan,
        tile: TileInfo,
        iteration: &'a mut IterationState,
        cancel: &'a CancellationToken,
    ) -> Result<Self, CommandError> {
        let initial = match plan.setup.source {
            PipelineSource::File => {
                let key = plan.plane_key(tile.t_stack);
                iteration.plane(&key).cloned().ok_or_else(|| {
                    CommandError::InvalidInput(format!("plane {key:?} was not loaded"))
                })?
            }
            PipelineSource::Memory => {
                let id = plan.cache_id(plan.setup.memory_id, None, tile.t_stack);
                iteration.cache.load(&id).ok_or(CacheMiss {
                    scope: CacheScope::Iteration,
                    id,
                })?
            }
            PipelineSource::Blank => {
                ImagePlane::zeros(tile.width, tile.height, Depth::U16, Channels::Gray)
            }
        };
        Ok(Self {
            env,
            plan,
            tile,
            iteration,
            pipeline_cache: ImageCache::new(),
            measurement: initial.clone(),
            active: initial,
            applied_threshold: None,
            validity: ImageValidity::VALID,
            invalidate_image: false,
            cancel,
        })
    }

    #[must_use]
    pub const fn active_image(&self) -> &ImagePlane {
        &self.active
    }

    pub fn set_active_image(&mut self, plane: ImagePlane) {
        self.active = plane;
    }

    /// The pipeline's initial plane; object intensities are measured here.
    #[must_use]
    pub const fn measurement_plane(&self) -> &ImagePlane {
        &self.measurement
    }

    pub const fn set_applied_threshold(&mut self, lower: f64) {
        self.applied_threshold = Some(lower);
    }

    /// Lower bound of the most recent `$threshold` in this pipeline.
    #[must_use]
    pub const fn applied_threshold(&self) -> Option<f64> {
        self.applied_threshold
    }

    /// Flag this pipeline's plane; with `whole_image` the image is also
    /// left out of aggregated results.
    pub const fn invalidate(&mut self, flag: ImageValidity, whole_image: bool) {
        self.validity.insert(flag);
        self.invalidate_image |= whole_image;
    }

    #[must_use]
    pub const fn validity(&self) -> ImageValidity {
        self.validity
    }

    #[must_use]
    pub const fn invalidates_image(&self) -> bool {
        self.invalidate_image
    }

    pub fn store_image_to_cache(&mut self, scope: CacheScope, id: ImageId, plane: ImagePlane) {
        match scope {
            CacheScope::Pipeline => self.pipeline_cache.store(id, plane),
            CacheScope::Iteration => self.iteration.cache.store(id, plane),
        }
    }

    /// # Errors
    ///
    /// Returns [`CacheMiss`] when nothing is stored under `id` in `scope`.
    pub fn load_image_from_cache(
        &self,
        scope: CacheScope,
        id: ImageId,
    ) -> Result<ImagePlane, CacheMiss> {
        let cache = match scope {
            CacheScope::Pipeline => &self.pipeline_cache,
            CacheScope::Iteration => &self.iteration.cache,
        };
        cache.load(&id).ok_or(CacheMiss { scope, id })
    }

    /// Cache key for `memory` in this pipeline's plane coordinates.
    #[must_use]
    pub fn cache_id(&self, memory: MemoryId, c_stack: Option<i32>) -> ImageId {
        self.plan.cache_id(memory, c_stack, self.tile.t_stack)
    }

    #[must_use]
    pub const fn objects(&self) -> &ObjectList {
        &self.iteration.objects
    }

    pub const fn objects_mut(&mut self) -> &mut ObjectList {
        &mut self.iteration.objects
    }

    /// Resolve a class reference; `$` maps to the pipeline default.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::InvalidInput`] for references that are not
    /// in the project classification.
    pub fn resolve_class(&self, reference: ClassIdIn) -> Result<ClassId, CommandError> {
        self.env
            .classification
            .resolve(reference, self.plan.default_class)
            .ok_or_else(|| CommandError::InvalidInput(format!("unknown class {reference}")))
    }

    /// Resolve several class references.
    ///
    /// # Errors
    ///
    /// Fails on the first unknown reference.
    pub fn resolve_classes(&self, references: &[ClassIdIn]) -> Result<Vec<ClassId>, CommandError> {
        references.iter().map(|r| self.resolve_class(*r)).collect()
    }

    #[must_use]
    pub const fn tile_info(&self) -> &TileInfo {
        &self.tile
    }

    #[must_use]
    pub const fn image_size(&self) -> Dimensions {
        self.tile.image_size
    }

    #[must_use]
    pub const fn pipeline_index(&self) -> usize {
        self.plan.index
    }

    #[must_use]
    pub fn pipeline_name(&self) -> &str {
        &self.plan.name
    }

    #[must_use]
    pub const fn pixel_size(&self) -> f64 {
        self.env.pixel_size
    }

    #[must_use]
    pub const fn control_image_folder(&self) -> Option<&Path> {
        self.env.control_image_folder
    }

    #[must_use]
    pub fn image_label(&self) -> &ImageLabel {
        &self.iteration.image
    }

    #[must_use]
    pub fn detector(&self, model: &str) -> Option<Arc<dyn Detector>> {
        self.env.detectors.detector(model)
    }

    pub const fn next_object_id(&mut self) -> ObjectId {
        self.iteration.next_object_id()
    }

    /// Plane of c-stack `c_stack` at this pipeline's z, t and projection.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::InvalidInput`] if the plane was not loaded
    /// for this work unit.
    pub fn channel_plane(&self, c_stack: i32) -> Result<ImagePlane, CommandError> {
        let key = PlaneKey {
            c_stack,
            ..self.plan.plane_key(self.tile.t_stack)
        };
        self.iteration
            .plane(&key)
            .cloned()
            .ok_or_else(|| CommandError::InvalidInput(format!("plane {key:?} was not loaded")))
    }

    /// Mark this pipeline's objects for storage with cross-channel
    /// intensities from `cross_channels`.
    pub fn request_store(&mut self, cross_channels: impl IntoIterator<Item = i32>) {
        self.iteration
            .stored
            .entry(self.plan.index)
            .or_default()
            .extend(cross_channels);
    }

    pub fn push_stats(&mut self, row: ImageStatsRow) {
        self.iteration.stats.push(row);
    }

    /// # Errors
    ///
    /// Returns [`CommandError::Cancelled`] once cancellation was requested.
    pub fn check_cancelled(&self) -> Result<(), CommandError> {
        if self.cancel.is_cancelled() {
            return Err(CommandError::Cancelled);
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub(crate) mod testing {
    //! Fixture that owns everything a [`ProcessContext`] borrows.

    use super::*;
    use crate::detector::DetectorRegistry;
    use crate::pipeline::{Pipeline, PipelineSetup, validate_pipelines};
    use crate::settings::ClassInfo;

    pub(crate) struct Harness {
        pub classification: Classification,
        pub detectors: DetectorRegistry,
        pub plan: PipelinePlan,
        pub iteration: IterationState,
        pub cancel: CancellationToken,
        pub tile: TileInfo,
        pub control_image_folder: Option<std::path::PathBuf>,
    }

    impl Harness {
        /// Harness with classes 1..=5, default class 1 and `plane` loaded
        /// as c-stack 0.
        pub(crate) fn new(plane: ImagePlane) -> Self {
            let classification = Classification {
                classes: (1..=5)
                    .map(|id| ClassInfo {
                        class_id: ClassId(id),
                        name: format!("class {id}"),
                        color: String::new(),
                    })
                    .collect(),
            };
            let pipeline = Pipeline {
                pipeline_setup: PipelineSetup {
                    default_class_id: ClassIdIn::Id(ClassId(1)),
                    ..PipelineSetup::default()
                },
                ..Pipeline::default()
            };
            let plan = validate_pipelines(&[pipeline], &classification)
                .unwrap()
                .remove(0);
            let tile = TileInfo::whole(plane.dimensions(), 0);
            let mut iteration = IterationState::new(
                ImageLabel {
                    image_id: 1,
                    stem: "test".to_owned(),
                },
                ObjectIdAllocator::for_work_unit(0, 0),
            );
            iteration.insert_plane(plan.plane_key(0), plane);
            Self {
                classification,
                detectors: DetectorRegistry::new(),
                plan,
                iteration,
                cancel: CancellationToken::new(),
                tile,
                control_image_folder: None,
            }
        }

        pub(crate) fn context(&mut self) -> ProcessContext<'_> {
            let env = Environment {
                classification: &self.classification,
                detectors: &self.detectors,
                pixel_size: 1.0,
                control_image_folder: self.control_image_folder.as_deref(),
            };
            ProcessContext::new(env, &self.plan, self.tile, &mut self.iteration, &self.cancel)
                .unwrap()
        }
    }
}
