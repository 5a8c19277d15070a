//! Pipelines and their load-time validation.
//!
//! A [`Pipeline`] is what the settings file holds: a name, the initial
//! image selection ([`PipelineSetup`]) and an ordered list of
//! [`Command`]s. [`validate_pipelines`] checks a project's pipelines
//! against its classification and turns each into a [`PipelinePlan`], the
//! immutable form the scheduler executes:
//!
//! 1. every class reference resolves,
//! 2. the I/O kinds of consecutive commands unify,
//! 3. `$storeToDb` is the final step,
//! 4. a `MEMORY` source is filled by an earlier pipeline's `ITERATION`
//!    cache store.
//!
//! The plan also records the planes and cache slots the pipeline reads so
//! the scheduler can preload them.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::command::{CacheMode, Command, IoKind};
use crate::error::ConfigError;
use crate::settings::Classification;
use crate::types::{CacheScope, ClassId, ClassIdIn, ImageId, MemoryId, ZProjection};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineMeta {
    pub name: String,
    pub icon: String,
}

/// Where a pipeline's initial image comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineSource {
    /// A plane read from the image file.
    #[default]
    File,
    /// A plane stored in the `ITERATION` cache by an earlier pipeline.
    Memory,
    /// A zero plane of tile size.
    Blank,
}

/// Initial image selection and default class of a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineSetup {
    /// Class that `$` resolves to inside this pipeline.
    pub default_class_id: ClassIdIn,
    pub c_stack_index: i32,
    pub z_stack_index: i32,
    /// `-1` follows the t-stack of the current iteration.
    pub t_stack_index: i32,
    pub z_projection: ZProjection,
    pub source: PipelineSource,
    /// Slot read when `source` is `MEMORY`.
    pub memory_id: MemoryId,
}

impl Default for PipelineSetup {
    fn default() -> Self {
        Self {
            default_class_id: ClassIdIn::None,
            c_stack_index: 0,
            z_stack_index: 0,
            t_stack_index: -1,
            z_projection: ZProjection::None,
            source: PipelineSource::File,
            memory_id: MemoryId::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Pipeline {
    pub meta: PipelineMeta,
    pub pipeline_setup: PipelineSetup,
    pub pipeline_steps: Vec<Command>,
}

/// Coordinates of one loaded plane of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlaneKey {
    pub c_stack: i32,
    pub z_stack: i32,
    pub t_stack: i32,
    pub z_projection: ZProjection,
}

/// A validated pipeline, ready to run.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelinePlan {
    /// Position in the project; also the result channel id.
    pub index: usize,
    pub name: String,
    pub default_class: ClassId,
    pub setup: PipelineSetup,
    pub steps: Vec<Command>,
    /// Data kind after each step.
    pub kinds: Vec<IoKind>,
    /// Memory slots read by `$imageCache` `LOAD` steps.
    pub memory_loads: BTreeSet<MemoryId>,
    /// Extra c-stacks measured by `$storeToDb`.
    pub cross_channels: BTreeSet<i32>,
}

impl PipelinePlan {
    /// Effective t-stack for iteration `t`.
    #[must_use]
    pub const fn t_stack(&self, t: i32) -> i32 {
        if self.setup.t_stack_index < 0 {
            t
        } else {
            self.setup.t_stack_index
        }
    }

    /// Plane this pipeline starts from at iteration `t`.
    #[must_use]
    pub const fn plane_key(&self, t: i32) -> PlaneKey {
        PlaneKey {
            c_stack: self.setup.c_stack_index,
            z_stack: self.setup.z_stack_index,
            t_stack: self.t_stack(t),
            z_projection: self.setup.z_projection,
        }
    }

    /// Image-cache key for `memory`, optionally overriding the c-stack.
    #[must_use]
    pub fn cache_id(&self, memory: MemoryId, c_stack: Option<i32>, t: i32) -> ImageId {
        ImageId {
            c_stack: c_stack.unwrap_or(self.setup.c_stack_index),
            z_stack: self.setup.z_stack_index,
            t_stack: self.t_stack(t),
            z_projection: self.setup.z_projection,
            memory_id: memory,
        }
    }

    /// Every plane that must be loaded before this pipeline runs at `t`.
    #[must_use]
    pub fn required_planes(&self, t: i32) -> BTreeSet<PlaneKey> {
        let own = self.plane_key(t);
        let mut keys: BTreeSet<PlaneKey> = self
            .cross_channels
            .iter()
            .map(|&c_stack| PlaneKey { c_stack, ..own })
            .collect();
        if self.setup.source == PipelineSource::File {
            keys.insert(own);
        }
        keys
    }

    /// Whether the pipeline ends with `$storeToDb`.
    #[must_use]
    pub fn stores_results(&self) -> bool {
        matches!(self.steps.last(), Some(Command::StoreToDb(_)))
    }

    /// Whether nothing the pipeline computes outlives it: no `$storeToDb`
    /// and no `ITERATION`-scope cache slot for later pipelines.
    #[must_use]
    pub fn discards_results(&self) -> bool {
        !self.stores_results() && self.iteration_stores().next().is_none()
    }

    /// `ITERATION`-scope cache keys written by this pipeline, at `t = 0`.
    fn iteration_stores(&self) -> impl Iterator<Item = ImageId> + '_ {
        self.steps.iter().filter_map(|step| match step {
            Command::ImageCache(s) if s.mode == CacheMode::Store && s.scope == CacheScope::Iteration => {
                Some(self.cache_id(s.memory_id, s.c_stack_index, 0))
            }
            _ => None,
        })
    }
}

/// Validate `pipelines` in declared order and build their plans.
///
/// # Errors
///
/// Returns the first [`ConfigError`] found, naming the pipeline.
pub fn validate_pipelines(
    pipelines: &[Pipeline],
    classification: &Classification,
) -> Result<Vec<PipelinePlan>, ConfigError> {
    let mut plans: Vec<PipelinePlan> = Vec::with_capacity(pipelines.len());
    for (index, pipeline) in pipelines.iter().enumerate() {
        let plan = validate_one(index, pipeline, classification)?;
        if plan.setup.source == PipelineSource::Memory {
            let wanted = plan.cache_id(plan.setup.memory_id, None, 0);
            if !plans
                .iter()
                .any(|earlier| earlier.iteration_stores().any(|id| id == wanted))
            {
                return Err(ConfigError::MissingMemorySource {
                    pipeline: plan.name,
                    slot: format!("{} (c={})", wanted.memory_id, wanted.c_stack),
                });
            }
        }
        if plan.discards_results() {
            tracing::warn!(
                pipeline = %plan.name,
                "pipeline neither ends in $storeToDb nor fills an iteration cache slot, its results are discarded"
            );
        }
        plans.push(plan);
    }
    Ok(plans)
}

fn validate_one(
    index: usize,
    pipeline: &Pipeline,
    classification: &Classification,
) -> Result<PipelinePlan, ConfigError> {
    let name = pipeline.meta.name.clone();
    let unknown = |class: ClassIdIn| ConfigError::UnknownClass {
        pipeline: name.clone(),
        class: class.to_string(),
    };

    let setup = &pipeline.pipeline_setup;
    let default_class = classification
        .resolve(setup.default_class_id, ClassId::NONE)
        .ok_or_else(|| unknown(setup.default_class_id))?;

    let last = pipeline.pipeline_steps.len().saturating_sub(1);
    let mut kind = IoKind::Image;
    let mut kinds = Vec::with_capacity(pipeline.pipeline_steps.len());
    let mut memory_loads = BTreeSet::new();
    let mut cross_channels = BTreeSet::new();

    for (step, command) in pipeline.pipeline_steps.iter().enumerate() {
        for class in command.class_refs() {
            classification
                .resolve(class, default_class)
                .ok_or_else(|| unknown(class))?;
        }
        command.check().map_err(|reason| ConfigError::Invalid {
            field: format!("{name}[{step}] {}", command.name()),
            reason,
        })?;

        let io = command.io();
        if !io.accepts(kind) {
            return Err(ConfigError::TypeMismatch {
                pipeline: name,
                step,
                command: command.name(),
                accepted: command.mismatch_text(),
                found: kind.to_string(),
            });
        }
        kind = io.output_for(kind);
        kinds.push(kind);

        match command {
            Command::StoreToDb(s) => {
                if step != last {
                    return Err(ConfigError::StoreNotLast { pipeline: name });
                }
                cross_channels.extend(s.cross_channel_c_stacks.iter().copied());
            }
            Command::ImageCache(s) if s.mode == CacheMode::Load => {
                memory_loads.insert(s.memory_id);
            }
            _ => {}
        }
    }

    Ok(PipelinePlan {
        index,
        name,
        default_class,
        setup: setup.clone(),
        steps: pipeline.pipeline_steps.clone(),
        kinds,
        memory_loads,
        cross_channels,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::io;
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::settings::ClassInfo;

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn classification() -> Classification {
        Classification {
            classes: [(1, "nucleus"), (2, "cell"), (3, "spot")]
                .into_iter()
                .map(|(id, name)| ClassInfo {
                    class_id: ClassId(id),
                    name: name.to_owned(),
                    color: String::new(),
                })
                .collect(),
        }
    }

    fn pipeline(json: &str) -> Pipeline {
        serde_json::from_str(json).unwrap()
    }

    // --- serde tests ---

    #[test]
    fn setup_defaults_follow_iteration_t() {
        let p = pipeline(r#"{"meta": {"name": "a"}}"#);
        assert_eq!(p.pipeline_setup.t_stack_index, -1);
        assert_eq!(p.pipeline_setup.source, PipelineSource::File);
        assert_eq!(p.pipeline_setup.default_class_id, ClassIdIn::None);
    }

    #[test]
    fn setup_parses_camel_case_keys() {
        let p = pipeline(
            r#"{"pipelineSetup": {"defaultClassId": "$2", "cStackIndex": 1, "zProjection": "MAX_INTENSITY",
                "source": "MEMORY", "memoryId": "M4"}}"#,
        );
        let s = &p.pipeline_setup;
        assert_eq!(s.default_class_id, ClassIdIn::Indexed(2));
        assert_eq!(s.c_stack_index, 1);
        assert_eq!(s.z_projection, ZProjection::MaxIntensity);
        assert_eq!(s.source, PipelineSource::Memory);
        assert_eq!(s.memory_id, MemoryId::new(4).unwrap());
    }

    // --- validation tests ---

    #[test]
    fn valid_pipeline_threads_kinds() {
        let p = pipeline(
            r#"{"meta": {"name": "nuclei"}, "pipelineSetup": {"defaultClassId": 1},
                "pipelineSteps": [
                    {"$blur": {}},
                    {"$threshold": {"mode": "OTSU"}},
                    {"$classify": {"classId": "$"}},
                    {"$storeToDb": {"crossChannelCStacks": [1, 2]}}
                ]}"#,
        );
        let plans = validate_pipelines(&[p], &classification()).unwrap();
        let plan = &plans[0];
        assert_eq!(plan.default_class, ClassId(1));
        assert_eq!(
            plan.kinds,
            vec![IoKind::Image, IoKind::Binary, IoKind::Object, IoKind::Object]
        );
        assert!(plan.stores_results());
        let planes: Vec<_> = plan.required_planes(3).iter().map(|k| k.c_stack).collect();
        assert_eq!(planes, vec![0, 1, 2]);
    }

    #[test]
    fn classify_after_image_is_a_type_mismatch() {
        let p = pipeline(r#"{"pipelineSteps": [{"$classify": {}}]}"#);
        let err = validate_pipelines(&[p], &classification()).unwrap_err();
        assert!(
            matches!(
                &err,
                ConfigError::TypeMismatch { step: 0, command: "$classify", accepted, found, .. }
                    if accepted == "BINARY" && found == "IMAGE"
            ),
            "got {err}"
        );
    }

    #[test]
    fn unknown_class_reference_is_rejected() {
        let p = pipeline(
            r#"{"pipelineSteps": [{"$threshold": {}}, {"$classify": {"classId": "$9"}}]}"#,
        );
        assert!(matches!(
            validate_pipelines(&[p], &classification()),
            Err(ConfigError::UnknownClass { class, .. }) if class == "$9"
        ));
    }

    #[test]
    fn store_must_be_last() {
        let p = pipeline(r#"{"pipelineSteps": [{"$storeToDb": {}}, {"$blur": {}}]}"#);
        assert!(matches!(
            validate_pipelines(&[p], &classification()),
            Err(ConfigError::StoreNotLast { .. })
        ));
    }

    #[test]
    fn memory_source_needs_earlier_iteration_store() {
        let reader = pipeline(
            r#"{"meta": {"name": "reader"},
                "pipelineSetup": {"source": "MEMORY", "memoryId": "M1"}}"#,
        );
        let pipeline_scoped = pipeline(
            r#"{"pipelineSteps": [{"$imageCache": {"mode": "STORE", "memoryId": "M1"}}]}"#,
        );
        let writer = pipeline(
            r#"{"pipelineSteps": [{"$imageCache":
                {"mode": "STORE", "memoryId": "M1", "scope": "ITERATION"}}]}"#,
        );

        let err =
            validate_pipelines(&[pipeline_scoped, reader.clone()], &classification()).unwrap_err();
        assert!(
            matches!(&err, ConfigError::MissingMemorySource { pipeline, .. } if pipeline == "reader"),
            "got {err}"
        );
        assert!(validate_pipelines(&[reader.clone(), writer.clone()], &classification()).is_err());
        assert!(validate_pipelines(&[writer, reader], &classification()).is_ok());
    }

    #[test]
    fn pipeline_without_output_is_flagged() {
        let dead_end = pipeline(r#"{"meta": {"name": "lost"}, "pipelineSteps": [{"$blur": {}}]}"#);
        let stored = pipeline(r#"{"pipelineSteps": [{"$threshold": {}}, {"$storeToDb": {}}]}"#);
        let cached = pipeline(
            r#"{"pipelineSteps": [{"$imageCache":
                {"mode": "STORE", "memoryId": "M2", "scope": "ITERATION"}}]}"#,
        );

        let capture = Capture::default();
        let writer = capture.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        let plans = tracing::subscriber::with_default(subscriber, || {
            validate_pipelines(&[dead_end, stored, cached], &classification()).unwrap()
        });

        let flags: Vec<_> = plans.iter().map(PipelinePlan::discards_results).collect();
        assert_eq!(flags, vec![true, false, false]);
        let out = String::from_utf8(capture.0.lock().unwrap().clone()).unwrap();
        assert_eq!(out.lines().count(), 1, "{out}");
        assert!(out.contains("WARN") && out.contains("lost"), "{out}");
    }

    #[test]
    fn invalid_settings_are_reported_with_step() {
        let p = pipeline(r#"{"meta": {"name": "p"}, "pipelineSteps": [{"$blur": {"kernelSize": 4}}]}"#);
        let err = validate_pipelines(&[p], &classification()).unwrap_err();
        assert!(
            matches!(&err, ConfigError::Invalid { field, .. } if field == "p[0] $blur"),
            "got {err}"
        );
    }

    // --- plan tests ---

    #[test]
    fn fixed_t_stack_overrides_iteration() {
        let mut p = Pipeline::default();
        p.pipeline_setup.t_stack_index = 2;
        let plan = validate_pipelines(&[p], &classification()).unwrap().remove(0);
        assert_eq!(plan.plane_key(7).t_stack, 2);
        let id = plan.cache_id(MemoryId::new(3).unwrap(), Some(5), 7);
        assert_eq!((id.c_stack, id.t_stack), (5, 2));
    }

    #[test]
    fn blank_source_needs_no_own_plane() {
        let mut p = Pipeline::default();
        p.pipeline_setup.source = PipelineSource::Blank;
        let plan = validate_pipelines(&[p], &classification()).unwrap().remove(0);
        assert!(plan.required_planes(0).is_empty());
    }
}
