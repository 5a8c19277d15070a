//! The job scheduler.
//!
//! A job walks every image of every plate. Each image is cut into work
//! units, one per (t-stack, tile), and every pipeline runs on every unit in
//! declared order:
//!
//! ```text
//! image ─┬─ metadata + tile grid
//!        ├─ unit (t, tile) ─ preload planes ─ pipeline 0 ─ pipeline 1 ─ ...
//!        ├─ unit (t, tile) ─ ...
//!        └─ flush: object rows + stats rows ─► ResultSink
//! ```
//!
//! Images are pulled from a work queue by `images` worker threads; each
//! image fans its units out to `tiles` threads, and plane preloads run on
//! a `channels`-wide rayon pool. A unit holds a [`SlotLimiter`] slot while
//! it runs so the tiles in flight never exceed what the memory preflight
//! budgeted.
//!
//! Failure handling:
//!
//! - A [`CommandError`] is logged with the command name and the pipeline
//!   continues with the next step.
//! - A [`CommandError::Fatal`] aborts the unit; the image is written with
//!   [`ImageValidity::PARTIAL`].
//! - An [`IoError`] skips the image; the job continues.
//! - A [`SinkError`](crate::error::SinkError) stops the job, which ends
//!   `FAILED`.
//!
//! Cancellation is polled before every image, unit and pipeline and after
//! every command.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::unbounded;
use parking_lot::Mutex;
use rayon::prelude::*;

use crate::context::{
    CancellationToken, Environment, ImageLabel, IterationState, ObjectIdAllocator, ProcessContext,
    TileInfo,
};
use crate::detector::{Detector, DetectorProvider};
use crate::diagnostics::{Clock, JobSummary, StdClock, Timings};
use crate::error::{CommandError, ConfigError, EngineError, ErrorReport, IoError, SinkError};
use crate::image::ImagePlane;
use crate::pipeline::{PipelinePlan, PlaneKey};
use crate::resources::{self, Concurrency, MemoryProbe, SlotLimiter, SystemMemory};
use crate::results::{
    ImageRecord, ImageStatsRow, JobStart, JobStatus, ObjectRow, PipelineRecord, PlaneStats,
    ResultSink,
};
use crate::settings::{AnalyzeSettings, ProjectSettings};
use crate::source::{FilenameParser, ImageMetadata, ImageReader, ImageRef, ImageSource, TileGrid};
use crate::types::{ImageValidity, Rect};

/// Job progress reported after every finished image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub images_done: u64,
    pub images_total: u64,
}

impl Progress {
    /// Completion in whole percent.
    #[must_use]
    pub fn percent(&self) -> u8 {
        if self.images_total == 0 {
            return 100;
        }
        u8::try_from(self.images_done.min(self.images_total) * 100 / self.images_total)
            .unwrap_or(100)
    }
}

/// Provider used when no detector backend is configured.
struct NoDetectors;

impl DetectorProvider for NoDetectors {
    fn detector(&self, _model: &str) -> Option<std::sync::Arc<dyn Detector>> {
        None
    }
}

/// Runs analysis jobs against an image reader and a result sink.
pub struct Scheduler<'a> {
    reader: &'a dyn ImageReader,
    sink: &'a dyn ResultSink,
    detectors: &'a dyn DetectorProvider,
    clock: Option<&'a dyn Clock>,
    memory: &'a dyn MemoryProbe,
    cores: usize,
    cancel: CancellationToken,
    progress: Option<&'a (dyn Fn(Progress) + Sync)>,
}

impl std::fmt::Debug for Scheduler<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("cores", &self.cores)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl<'a> Scheduler<'a> {
    /// Scheduler with no detectors, the system clock, `sysinfo` memory
    /// probing and all host cores.
    #[must_use]
    pub fn new(reader: &'a dyn ImageReader, sink: &'a dyn ResultSink) -> Self {
        Self {
            reader,
            sink,
            detectors: &NoDetectors,
            clock: None,
            memory: &SystemMemory,
            cores: resources::host_cores(),
            cancel: CancellationToken::new(),
            progress: None,
        }
    }

    #[must_use]
    pub fn with_detectors(mut self, detectors: &'a dyn DetectorProvider) -> Self {
        self.detectors = detectors;
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: &'a dyn Clock) -> Self {
        self.clock = Some(clock);
        self
    }

    #[must_use]
    pub fn with_memory_probe(mut self, memory: &'a dyn MemoryProbe) -> Self {
        self.memory = memory;
        self
    }

    /// Override the core count used to resolve `0` limits.
    #[must_use]
    pub fn with_cores(mut self, cores: usize) -> Self {
        self.cores = cores.max(1);
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    #[must_use]
    pub fn with_progress(mut self, progress: &'a (dyn Fn(Progress) + Sync)) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Token that stops the job when cancelled.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the job described by `settings`.
    ///
    /// # Errors
    ///
    /// - [`EngineError::Config`] when the settings do not validate or a
    ///   plate folder is missing.
    /// - [`EngineError::Io`] when a plate folder cannot be listed.
    /// - [`EngineError::Resource`] when the memory preflight fails.
    /// - [`EngineError::Store`] when the sink rejects a write; the job is
    ///   finished as `FAILED`.
    pub fn run(&self, settings: &AnalyzeSettings) -> Result<JobSummary, EngineError> {
        let fallback_clock = StdClock::new();
        let clock = self.clock.unwrap_or(&fallback_clock);
        let started = clock.now();

        let plans = settings.validate()?;
        let project = &settings.project_settings;
        let (sources, images) = self.discover(project)?;
        let concurrency = Concurrency::resolve(&project.runtime, self.cores);
        resources::preflight(&project.image_setup, &concurrency, plans.len(), self.memory)?;

        let job = JobStart {
            name: project.results.job_name.clone(),
            settings_json: settings.to_json()?,
            classes: settings.classification.records(),
            pipelines: plans
                .iter()
                .map(|p| PipelineRecord {
                    index: channel_id(p.index),
                    name: p.name.clone(),
                    default_class: p.default_class,
                    c_stack: p.setup.c_stack_index,
                })
                .collect(),
            plates: project.plate_records(),
        };
        let job_id = self.sink.begin_job(&job)?;
        let span = tracing::info_span!("job", id = %job_id);
        let _enter = span.enter();
        tracing::info!(
            images = images.len(),
            pipelines = plans.len(),
            image_workers = concurrency.images,
            tile_workers = concurrency.tiles,
            channel_workers = concurrency.channels,
            "job started"
        );

        let channel_pool = if concurrency.channels > 1 {
            rayon::ThreadPoolBuilder::new()
                .num_threads(concurrency.channels)
                .thread_name(|i| format!("imagec-channel-{i}"))
                .build()
                .map_err(|e| tracing::warn!(error = %e, "plane preload runs sequentially"))
                .ok()
        } else {
            None
        };

        let run = JobRun {
            scheduler: self,
            settings,
            plans: &plans,
            sources: &sources,
            job_id: &job_id,
            clock,
            concurrency,
            unit_slots: SlotLimiter::new(concurrency.images * concurrency.tiles),
            channel_pool,
            images_total: images.len() as u64,
            images_done: AtomicU64::new(0),
            state: Mutex::new(RunState::default()),
        };
        run.run_images(images);

        let state = run.state.into_inner();
        let status = if state.sink_error.is_some() {
            JobStatus::Failed
        } else if self.cancel.is_cancelled() {
            JobStatus::Stopped
        } else {
            JobStatus::Finished
        };
        let finished = self.sink.finish_job(&job_id, status);
        if let Some(err) = state.sink_error {
            tracing::error!(error = %err, "job failed");
            if let Err(finish) = finished {
                tracing::error!(error = %finish, "could not record the failed job");
            }
            return Err(err.into());
        }
        finished?;

        let summary = JobSummary {
            job_id: job_id.clone(),
            status,
            images: run.images_total,
            images_written: state.images_written,
            failed_images: state.failed_images,
            tiles: state.tiles,
            failed_tiles: state.failed_tiles,
            objects: state.objects,
            command_errors: state.command_errors,
            commands: state.timings,
            total_duration: clock.now().saturating_sub(started),
            errors: state.errors,
        };
        tracing::info!(
            status = status.as_str(),
            images = summary.images_written,
            objects = summary.objects,
            "job finished"
        );
        Ok(summary)
    }

    /// One [`ImageSource`] per plate and the images of all plates, in plate
    /// order and sorted by path within a plate.
    fn discover(
        &self,
        project: &ProjectSettings,
    ) -> Result<(Vec<ImageSource<'a>>, Vec<QueuedImage>), EngineError> {
        if project.plates.is_empty() {
            return Err(ConfigError::Invalid {
                field: "projectSettings.plates".to_owned(),
                reason: "at least one plate is required".to_owned(),
            }
            .into());
        }
        let setup = &project.image_setup;
        let mut sources = Vec::with_capacity(project.plates.len());
        let mut images = Vec::new();
        for (plate, settings) in project.plates.iter().enumerate() {
            if !settings.image_folder.is_dir() {
                return Err(ConfigError::MissingFile(settings.image_folder.clone()).into());
            }
            let source = ImageSource::new(
                self.reader,
                FilenameParser::new(&settings.filename_regex)?,
                settings.plate_id,
                setup.series,
                setup.resolution,
            );
            for image in source.enumerate(&settings.image_folder)? {
                images.push(QueuedImage {
                    seq: images.len() as u64,
                    plate,
                    image,
                });
            }
            sources.push(source);
        }
        Ok((sources, images))
    }
}

/// `u32` result channel of a pipeline index.
fn channel_id(pipeline: usize) -> u32 {
    u32::try_from(pipeline).unwrap_or(u32::MAX)
}

#[derive(Debug)]
struct QueuedImage {
    /// Position in the job, seeds object ids.
    seq: u64,
    plate: usize,
    image: ImageRef,
}

/// Counters shared by the workers of one job.
#[derive(Debug, Default)]
struct RunState {
    images_written: u64,
    failed_images: u64,
    tiles: u64,
    failed_tiles: u64,
    objects: u64,
    command_errors: u64,
    timings: Timings,
    errors: Vec<ErrorReport>,
    sink_error: Option<SinkError>,
}

/// Rows and bookkeeping of one finished work unit.
#[derive(Debug, Default)]
struct UnitOutcome {
    objects: Vec<ObjectRow>,
    stats: Vec<ImageStatsRow>,
    failed: bool,
    cancelled: bool,
    command_errors: u64,
    timings: Timings,
}

/// Everything the workers of one job share.
struct JobRun<'s, 'a> {
    scheduler: &'s Scheduler<'a>,
    settings: &'s AnalyzeSettings,
    plans: &'s [PipelinePlan],
    sources: &'s [ImageSource<'a>],
    job_id: &'s str,
    clock: &'s dyn Clock,
    concurrency: Concurrency,
    unit_slots: SlotLimiter,
    channel_pool: Option<rayon::ThreadPool>,
    images_total: u64,
    images_done: AtomicU64,
    state: Mutex<RunState>,
}

impl JobRun<'_, '_> {
    fn should_stop(&self) -> bool {
        self.scheduler.cancel.is_cancelled() || self.state.lock().sink_error.is_some()
    }

    fn run_images(&self, images: Vec<QueuedImage>) {
        let (tx, rx) = unbounded();
        for image in images {
            // The receiver lives until the scope below ends.
            let _ = tx.send(image);
        }
        drop(tx);
        let parent = tracing::Span::current();
        std::thread::scope(|s| {
            for _ in 0..self.concurrency.images {
                let rx = rx.clone();
                let parent = parent.clone();
                s.spawn(move || {
                    let _enter = parent.enter();
                    while let Ok(image) = rx.recv() {
                        if self.should_stop() {
                            break;
                        }
                        self.process_image(&image);
                    }
                });
            }
        });
    }

    fn process_image(&self, queued: &QueuedImage) {
        let span = tracing::info_span!("image", path = %queued.image.path.display());
        let _enter = span.enter();
        let source = &self.sources[queued.plate];
        let loaded = source.metadata(&queued.image).and_then(|meta| {
            let size = meta
                .properties
                .size(&queued.image.path, self.settings.project_settings.image_setup.resolution)?;
            Ok((meta, size))
        });
        let (meta, size) = match loaded {
            Ok(loaded) => loaded,
            Err(err) => {
                tracing::error!(error = %err, "image skipped");
                self.image_failed(err);
                return;
            }
        };

        let setup = &self.settings.project_settings.image_setup;
        let grid = TileGrid::new(
            size,
            setup.composite_tile_width,
            setup.composite_tile_height,
        );
        let t_stacks = i32::try_from(meta.properties.t_stacks.max(1)).unwrap_or(i32::MAX);
        let units: Vec<TileInfo> = (0..t_stacks).flat_map(|t| grid.tiles(t)).collect();
        tracing::info!(
            width = size.width,
            height = size.height,
            units = units.len(),
            "image started"
        );

        let results = self.run_units(queued, source, &meta, &units);
        let mut outcomes = Vec::with_capacity(results.len());
        for (_, result) in results {
            match result {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) => {
                    tracing::error!(error = %err, "image skipped");
                    self.image_failed(err);
                    return;
                }
            }
        }
        if outcomes.is_empty() {
            return;
        }

        let mut validity = ImageValidity::VALID;
        if outcomes.iter().any(|o| o.failed) {
            validity.insert(ImageValidity::PARTIAL);
        }
        if outcomes.len() < units.len() || outcomes.iter().any(|o| o.cancelled) {
            validity.insert(ImageValidity::CANCELLED);
        }

        let mut objects = Vec::new();
        let mut stats = Vec::new();
        let mut next_idx: BTreeMap<u32, u64> = BTreeMap::new();
        let mut timings = Timings::default();
        let mut command_errors = 0;
        let failed_units = outcomes.iter().filter(|o| o.failed).count() as u64;
        let unit_count = outcomes.len() as u64;
        for outcome in outcomes {
            for mut row in outcome.objects {
                let idx = next_idx.entry(row.channel_id).or_insert(0);
                row.object_idx = *idx;
                *idx += 1;
                objects.push(row);
            }
            stats.extend(outcome.stats);
            timings.merge(outcome.timings);
            command_errors += outcome.command_errors;
        }

        let well = meta.well;
        let record = ImageRecord {
            image_id: queued.image.image_id(),
            plate_id: queued.image.plate_id,
            group_label: well.group_label,
            plate_row: well.row,
            plate_col: well.col,
            image_idx: well.image_idx,
            file_name: queued.image.file_name(),
            file_path: queued.image.path.to_string_lossy().into_owned(),
            width: size.width,
            height: size.height,
            validity,
        };
        let written = self
            .scheduler
            .sink
            .write_image(self.job_id, &record, &objects, &stats);

        {
            let mut state = self.state.lock();
            state.tiles += unit_count;
            state.failed_tiles += failed_units;
            state.command_errors += command_errors;
            state.timings.merge(timings);
            match written {
                Ok(()) => {
                    state.images_written += 1;
                    state.objects += objects.len() as u64;
                }
                Err(err) => {
                    tracing::error!(error = %err, "result sink rejected the image");
                    state.sink_error.get_or_insert(err);
                    return;
                }
            }
        }
        tracing::info!(objects = objects.len(), validity = validity.0, "image written");
        self.report_progress();
    }

    fn image_failed(&self, err: IoError) {
        {
            let mut state = self.state.lock();
            state.failed_images += 1;
            state.errors.push(ErrorReport::from(&EngineError::Io(err)));
        }
        self.report_progress();
    }

    fn report_progress(&self) {
        let done = self.images_done.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(progress) = self.scheduler.progress {
            progress(Progress {
                images_done: done,
                images_total: self.images_total,
            });
        }
    }

    /// Run `units` on up to `tiles` threads. Results are sorted by unit
    /// index; units skipped after cancellation are missing.
    fn run_units(
        &self,
        queued: &QueuedImage,
        source: &ImageSource<'_>,
        meta: &ImageMetadata,
        units: &[TileInfo],
    ) -> Vec<(usize, Result<UnitOutcome, IoError>)> {
        let (tx, rx) = unbounded();
        for unit in units.iter().enumerate() {
            let _ = tx.send(unit);
        }
        drop(tx);
        let results = Mutex::new(Vec::with_capacity(units.len()));
        let workers = self.concurrency.tiles.clamp(1, units.len().max(1));
        let parent = tracing::Span::current();
        std::thread::scope(|s| {
            for _ in 0..workers {
                let rx = rx.clone();
                let parent = &parent;
                let results = &results;
                s.spawn(move || {
                    while let Ok((seq, tile)) = rx.recv() {
                        if self.should_stop() {
                            break;
                        }
                        let _slot = self.unit_slots.acquire();
                        let span = tracing::debug_span!(
                            parent: parent,
                            "tile",
                            x = tile.tile_x,
                            y = tile.tile_y,
                            t = tile.t_stack
                        );
                        let _enter = span.enter();
                        let outcome = self.run_unit(queued, source, meta, seq, *tile);
                        results.lock().push((seq, outcome));
                    }
                });
            }
        });
        let mut results = results.into_inner();
        results.sort_by_key(|(seq, _)| *seq);
        results
    }

    /// Every pipeline on one (t, tile) unit.
    fn run_unit(
        &self,
        queued: &QueuedImage,
        source: &ImageSource<'_>,
        meta: &ImageMetadata,
        seq: usize,
        tile: TileInfo,
    ) -> Result<UnitOutcome, IoError> {
        let image_id = queued.image.image_id();
        let mut iteration = IterationState::new(
            ImageLabel {
                image_id,
                stem: queued.image.stem(),
            },
            ObjectIdAllocator::for_work_unit(queued.seq, seq as u64),
        );
        let keys: BTreeSet<PlaneKey> = self
            .plans
            .iter()
            .flat_map(|plan| plan.required_planes(tile.t_stack))
            .collect();
        for (key, plane) in self.load_planes(source, meta, &keys, &tile)? {
            iteration.insert_plane(key, plane);
        }

        let project = &self.settings.project_settings;
        let env = Environment {
            classification: &self.settings.classification,
            detectors: self.scheduler.detectors,
            pixel_size: project.image_setup.pixel_size,
            control_image_folder: project.results.control_image_folder.as_deref(),
        };
        let cancel = &self.scheduler.cancel;
        let mut outcome = UnitOutcome::default();

        'pipelines: for plan in self.plans {
            if cancel.is_cancelled() {
                outcome.cancelled = true;
                break;
            }
            let mut ctx = match ProcessContext::new(env, plan, tile, &mut iteration, cancel) {
                Ok(ctx) => ctx,
                Err(err) => {
                    tracing::warn!(pipeline = %plan.name, error = %err, "pipeline skipped");
                    outcome.command_errors += 1;
                    continue;
                }
            };
            for step in &plan.steps {
                let start = self.clock.now();
                let result = step.execute(&mut ctx);
                let elapsed = self.clock.now().saturating_sub(start);
                outcome.timings.record(step.name(), elapsed);
                tracing::debug!(
                    pipeline = %plan.name,
                    command = step.name(),
                    micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX),
                    "command finished"
                );
                match result {
                    Ok(()) => {}
                    Err(CommandError::Fatal(fatal)) => {
                        tracing::error!(
                            pipeline = %plan.name,
                            command = step.name(),
                            error = %fatal,
                            "tile aborted"
                        );
                        outcome.failed = true;
                        break 'pipelines;
                    }
                    Err(CommandError::Cancelled) => {
                        outcome.cancelled = true;
                        break 'pipelines;
                    }
                    Err(CommandError::CacheMiss(miss)) => {
                        tracing::warn!(
                            pipeline = %plan.name,
                            command = step.name(),
                            error = %miss,
                            "cache miss, active image unchanged"
                        );
                        outcome.command_errors += 1;
                    }
                    Err(err) => {
                        tracing::warn!(
                            pipeline = %plan.name,
                            command = step.name(),
                            error = %err,
                            "command failed"
                        );
                        outcome.command_errors += 1;
                    }
                }
                if ctx.check_cancelled().is_err() {
                    outcome.cancelled = true;
                    break 'pipelines;
                }
            }
        }

        outcome.objects = object_rows(&iteration, image_id, &tile);
        outcome.stats = iteration.take_stats();
        if outcome.failed {
            self.mark_partial(&mut outcome.stats, image_id, &tile);
        }
        Ok(outcome)
    }

    /// Flag the statistics of an aborted unit and add a placeholder row for
    /// every storing pipeline that did not get to write one.
    fn mark_partial(&self, stats: &mut Vec<ImageStatsRow>, image_id: u64, tile: &TileInfo) {
        for row in stats.iter_mut() {
            row.validity.insert(ImageValidity::PARTIAL);
        }
        for plan in self.plans.iter().filter(|p| p.stores_results()) {
            let channel = channel_id(plan.index);
            if stats.iter().any(|row| row.channel_id == channel) {
                continue;
            }
            stats.push(ImageStatsRow {
                image_id,
                channel_id: channel,
                tile_idx: tile.index,
                t_stack: tile.t_stack,
                validity: ImageValidity::PARTIAL,
                invalidate_all: false,
                control_image_path: None,
                intensity: PlaneStats::default(),
            });
        }
    }

    /// Read `keys` for `tile`, in parallel on the channel pool when there
    /// is one.
    fn load_planes(
        &self,
        source: &ImageSource<'_>,
        meta: &ImageMetadata,
        keys: &BTreeSet<PlaneKey>,
        tile: &TileInfo,
    ) -> Result<Vec<(PlaneKey, ImagePlane)>, IoError> {
        let read = |key: &PlaneKey| {
            source
                .read_tile(&meta.image, &meta.properties, *key, tile)
                .map(|plane| (*key, plane))
        };
        match &self.channel_pool {
            Some(pool) if keys.len() > 1 => pool.install(|| keys.par_iter().map(read).collect()),
            _ => keys.iter().map(read).collect(),
        }
    }
}

/// Rows for the objects of every pipeline that requested storage.
/// Objects reaching into the zero padding of an edge tile are dropped.
fn object_rows(iteration: &IterationState, image_id: u64, tile: &TileInfo) -> Vec<ObjectRow> {
    let stored = iteration.stored_pipelines();
    let image_rect = Rect::from_dimensions(tile.image_size);
    let mut padding = 0usize;
    let mut rows: Vec<ObjectRow> = iteration
        .objects
        .iter()
        .filter(|roi| stored.contains_key(&roi.pipeline))
        .filter(|roi| {
            let inside = image_rect.contains_rect(roi.global_bbox());
            padding += usize::from(!inside);
            inside
        })
        .map(|roi| {
            ObjectRow::from_roi(
                roi,
                image_id,
                channel_id(roi.pipeline),
                tile.index,
                tile.t_stack,
            )
        })
        .collect();
    if padding > 0 {
        tracing::debug!(padding, "objects in tile padding dropped");
    }
    rows.sort_by_key(|row| (row.channel_id, row.object_id));
    rows
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::path::{Path, PathBuf};
    use std::sync::Arc;

    use super::*;

    use crate::command::{
        AiSettings, ClassifySettings, Command, StoreToDbSettings, ThresholdMode, ThresholdSettings,
    };
    use crate::detector::DetectorRegistry;
    use crate::pipeline::{Pipeline, PipelineMeta, PipelineSetup};
    use crate::resources::FixedMemory;
    use crate::results::MemorySink;
    use crate::settings::{ClassInfo, Classification, PlateSettings};
    use crate::source::MemoryReader;
    use crate::types::{ClassId, ClassIdIn};

    const GIB: u64 = 1 << 30;

    /// A plate folder with empty files named like plate images, and a
    /// reader serving a bright square on each of them.
    fn plate(names: &[&str]) -> (tempfile::TempDir, MemoryReader) {
        let dir = tempfile::tempdir().unwrap();
        let mut reader = MemoryReader::new();
        for name in names {
            let path = dir.path().join(name);
            std::fs::write(&path, b"").unwrap();
            let plane = ImagePlane::from_fn_u16(64, 64, |x, y| {
                if (16..32).contains(&x) && (16..32).contains(&y) { 1000 } else { 0 }
            });
            reader.insert(path, 0, 0, 0, plane);
        }
        (dir, reader)
    }

    fn settings(folder: &Path, steps: Vec<Command>) -> AnalyzeSettings {
        let mut s = AnalyzeSettings::default();
        s.project_settings.plates = vec![PlateSettings {
            image_folder: folder.to_path_buf(),
            ..PlateSettings::default()
        }];
        s.classification = Classification {
            classes: vec![ClassInfo {
                class_id: ClassId(1),
                name: "spot".to_owned(),
                color: String::new(),
            }],
        };
        s.pipelines = vec![Pipeline {
            meta: PipelineMeta {
                name: "spots".to_owned(),
                icon: String::new(),
            },
            pipeline_setup: PipelineSetup {
                default_class_id: ClassIdIn::Id(ClassId(1)),
                ..PipelineSetup::default()
            },
            pipeline_steps: steps,
        }];
        s
    }

    fn detect_and_store() -> Vec<Command> {
        vec![
            Command::Threshold(ThresholdSettings {
                mode: ThresholdMode::Manual,
                threshold_min: 500.0,
                ..ThresholdSettings::default()
            }),
            Command::Classify(ClassifySettings::default()),
            Command::StoreToDb(StoreToDbSettings::default()),
        ]
    }

    // --- job tests ---

    #[test]
    fn runs_every_image_and_stores_objects() {
        let (dir, reader) = plate(&["p_A1_1.tif", "p_B2_1.tif"]);
        let sink = MemorySink::new();
        let seen = Mutex::new(Vec::new());
        let progress = |p: Progress| seen.lock().push(p.percent());
        let summary = Scheduler::new(&reader, &sink)
            .with_memory_probe(&FixedMemory(64 * GIB))
            .with_progress(&progress)
            .run(&settings(dir.path(), detect_and_store()))
            .unwrap();

        assert_eq!(summary.status, JobStatus::Finished);
        assert_eq!(summary.images_written, 2);
        assert_eq!(summary.objects, 2);
        let state = sink.snapshot();
        assert_eq!(state.status, Some(JobStatus::Finished));
        assert_eq!(state.images.len(), 2);
        assert!(state.objects.iter().all(|o| o.class_id == ClassId(1) && o.object_idx == 0));
        assert_eq!(state.stats.len(), 2);
        let wells: BTreeSet<_> = state.images.iter().map(|i| i.group_label.clone()).collect();
        assert_eq!(wells, BTreeSet::from(["A1".to_owned(), "B2".to_owned()]));
        let mut seen = seen.into_inner();
        seen.sort_unstable();
        assert_eq!(seen, vec![50, 100]);
        assert_eq!(summary.commands.get("$classify").unwrap().calls, 2);
    }

    #[test]
    fn unreadable_image_is_skipped() {
        let (dir, reader) = plate(&["p_A1_1.tif"]);
        std::fs::write(dir.path().join("p_A2_1.tif"), b"").unwrap();
        let sink = MemorySink::new();
        let summary = Scheduler::new(&reader, &sink)
            .with_memory_probe(&FixedMemory(64 * GIB))
            .run(&settings(dir.path(), detect_and_store()))
            .unwrap();
        assert_eq!(summary.status, JobStatus::Finished);
        assert_eq!(summary.failed_images, 1);
        assert_eq!(summary.images_written, 1);
        assert_eq!(summary.errors.len(), 1);
    }

    #[test]
    fn sink_failure_fails_the_job() {
        let (dir, reader) = plate(&["p_A1_1.tif"]);
        let sink = MemorySink::rejecting();
        let err = Scheduler::new(&reader, &sink)
            .with_memory_probe(&FixedMemory(64 * GIB))
            .run(&settings(dir.path(), detect_and_store()))
            .unwrap_err();
        assert!(matches!(err, EngineError::Store(_)), "got {err}");
        assert_eq!(sink.snapshot().status, Some(JobStatus::Failed));
    }

    #[test]
    fn preflight_stops_before_the_job_starts() {
        let (dir, reader) = plate(&["p_A1_1.tif"]);
        let sink = MemorySink::new();
        let err = Scheduler::new(&reader, &sink)
            .with_memory_probe(&FixedMemory(1024))
            .run(&settings(dir.path(), detect_and_store()))
            .unwrap_err();
        assert!(matches!(err, EngineError::Resource(_)), "got {err}");
        assert!(sink.snapshot().job.is_none());
    }

    #[test]
    fn missing_plate_folder_is_a_config_error() {
        let reader = MemoryReader::new();
        let sink = MemorySink::new();
        let err = Scheduler::new(&reader, &sink)
            .run(&settings(&PathBuf::from("/no/such/plate"), detect_and_store()))
            .unwrap_err();
        assert!(
            matches!(err, EngineError::Config(ConfigError::MissingFile(_))),
            "got {err}"
        );
    }

    #[test]
    fn cancelled_job_is_stopped() {
        let (dir, reader) = plate(&["p_A1_1.tif", "p_A2_1.tif"]);
        let sink = MemorySink::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let summary = Scheduler::new(&reader, &sink)
            .with_memory_probe(&FixedMemory(64 * GIB))
            .with_cancellation(cancel)
            .run(&settings(dir.path(), detect_and_store()))
            .unwrap();
        assert_eq!(summary.status, JobStatus::Stopped);
        assert_eq!(summary.images_written, 0);
    }

    struct Broken;

    impl Detector for Broken {
        fn detect(
            &self,
            _image: &ImagePlane,
        ) -> Result<Vec<crate::detector::Detection>, crate::detector::DetectorError> {
            Err(crate::detector::DetectorError("out of memory".to_owned()))
        }
    }

    fn ai_and_store(model: &str) -> Vec<Command> {
        vec![
            Command::Ai(AiSettings {
                model_path: model.to_owned(),
                ..AiSettings::default()
            }),
            Command::StoreToDb(StoreToDbSettings::default()),
        ]
    }

    #[test]
    fn failed_command_is_logged_and_skipped() {
        let (dir, reader) = plate(&["p_A1_1.tif"]);
        let sink = MemorySink::new();
        let detectors = DetectorRegistry::new().with("broken", Arc::new(Broken));
        let summary = Scheduler::new(&reader, &sink)
            .with_memory_probe(&FixedMemory(64 * GIB))
            .with_detectors(&detectors)
            .run(&settings(dir.path(), ai_and_store("broken")))
            .unwrap();
        assert_eq!(summary.status, JobStatus::Finished);
        assert_eq!(summary.command_errors, 1);
        let state = sink.snapshot();
        assert_eq!(state.stats.len(), 1, "store still ran");
        assert!(state.images[0].validity.is_valid());
    }

    #[test]
    fn fatal_command_marks_the_image_partial() {
        let (dir, reader) = plate(&["p_A1_1.tif"]);
        let sink = MemorySink::new();
        let summary = Scheduler::new(&reader, &sink)
            .with_memory_probe(&FixedMemory(64 * GIB))
            .run(&settings(dir.path(), ai_and_store("missing.onnx")))
            .unwrap();
        assert_eq!(summary.status, JobStatus::Finished);
        assert_eq!(summary.failed_tiles, 1);
        let state = sink.snapshot();
        assert!(state.images[0].validity.contains(ImageValidity::PARTIAL));
        assert_eq!(state.stats.len(), 1);
        assert!(state.stats[0].validity.contains(ImageValidity::PARTIAL));
    }

    // --- progress tests ---

    #[test]
    fn progress_percent_rounds_down() {
        let p = Progress {
            images_done: 1,
            images_total: 3,
        };
        assert_eq!(p.percent(), 33);
        let empty = Progress {
            images_done: 0,
            images_total: 0,
        };
        assert_eq!(empty.percent(), 100);
    }
}
