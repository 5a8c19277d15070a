//! Result rows and the [`ResultSink`] seam between engine and store.
//!
//! The scheduler converts ROIs into [`ObjectRow`]s and per-tile statistics
//! into [`ImageStatsRow`]s, then hands one image at a time to a sink.
//! Measurements are keyed by [`MeasureKey`], which packs a
//! [`MeasureChannel`] and the c-stack it was measured in.

use std::collections::BTreeMap;
use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::SinkError;
use crate::filter;
use crate::image::ImagePlane;
use crate::roi::Roi;
use crate::types::{ClassId, ImageValidity, ObjectId, Rect, Validity};

/// A measured quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u16)]
pub enum MeasureChannel {
    Confidence = 1,
    AreaSize = 2,
    Perimeter = 3,
    Circularity = 4,
    CenterOfMassX = 5,
    CenterOfMassY = 6,
    BoundingBoxWidth = 7,
    BoundingBoxHeight = 8,
    IntensityAvg = 9,
    IntensityMin = 10,
    IntensityMax = 11,
    IntensitySum = 16,
    GradientAvg = 17,
    GradientMax = 18,
    GradientStdDev = 19,
}

impl MeasureChannel {
    pub const ALL: [Self; 15] = [
        Self::Confidence,
        Self::AreaSize,
        Self::Perimeter,
        Self::Circularity,
        Self::CenterOfMassX,
        Self::CenterOfMassY,
        Self::BoundingBoxWidth,
        Self::BoundingBoxHeight,
        Self::IntensityAvg,
        Self::IntensityMin,
        Self::IntensityMax,
        Self::IntensitySum,
        Self::GradientAvg,
        Self::GradientMax,
        Self::GradientStdDev,
    ];

    /// Intensity channels, which are also measured cross-channel.
    pub const INTENSITY: [Self; 4] = [
        Self::IntensityAvg,
        Self::IntensityMin,
        Self::IntensityMax,
        Self::IntensitySum,
    ];

    #[must_use]
    pub fn from_u16(value: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|c| *c as u16 == value)
    }

    /// Human-readable name used in table headers.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Confidence => "Confidence",
            Self::AreaSize => "Area size",
            Self::Perimeter => "Perimeter",
            Self::Circularity => "Circularity",
            Self::CenterOfMassX => "Center of mass x",
            Self::CenterOfMassY => "Center of mass y",
            Self::BoundingBoxWidth => "Bounding box width",
            Self::BoundingBoxHeight => "Bounding box height",
            Self::IntensityAvg => "Intensity avg",
            Self::IntensityMin => "Intensity min",
            Self::IntensityMax => "Intensity max",
            Self::IntensitySum => "Intensity sum",
            Self::GradientAvg => "Gradient avg",
            Self::GradientMax => "Gradient max",
            Self::GradientStdDev => "Gradient stddev",
        }
    }

    /// Physical unit of the measured value.
    #[must_use]
    pub const fn unit(self) -> &'static str {
        match self {
            Self::Confidence | Self::Circularity => "%",
            Self::AreaSize => "px²",
            Self::Perimeter
            | Self::CenterOfMassX
            | Self::CenterOfMassY
            | Self::BoundingBoxWidth
            | Self::BoundingBoxHeight => "px",
            Self::IntensityAvg
            | Self::IntensityMin
            | Self::IntensityMax
            | Self::IntensitySum
            | Self::GradientAvg
            | Self::GradientMax
            | Self::GradientStdDev => "a.u.",
        }
    }
}

/// `(measure_channel << 16) | channel_index`.
///
/// Channel index `0` is the pipeline's own plane, `c + 1` the plane of
/// c-stack `c` measured cross-channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MeasureKey(pub u32);

impl MeasureKey {
    #[must_use]
    pub const fn new(channel: MeasureChannel, channel_index: u16) -> Self {
        Self(((channel as u32) << 16) | channel_index as u32)
    }

    /// Key for the pipeline's own plane.
    #[must_use]
    pub const fn own(channel: MeasureChannel) -> Self {
        Self::new(channel, 0)
    }

    /// Key for an intensity measured in c-stack `c_stack`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub const fn cross(channel: MeasureChannel, c_stack: i32) -> Self {
        Self::new(channel, (c_stack + 1) as u16)
    }

    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn channel(self) -> Option<MeasureChannel> {
        MeasureChannel::from_u16((self.0 >> 16) as u16)
    }

    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn channel_index(self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }
}

impl fmt::Display for MeasureKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.channel(), self.channel_index()) {
            (Some(c), 0) => f.write_str(c.name()),
            (Some(c), i) => write!(f, "{} (C{})", c.name(), i - 1),
            (None, _) => write!(f, "#{:08x}", self.0),
        }
    }
}

/// One stored object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectRow {
    pub image_id: u64,
    /// Index of the pipeline that stored the object.
    pub channel_id: u32,
    /// Dense per `(image, channel)`, assigned when the image is flushed.
    pub object_idx: u64,
    pub object_id: ObjectId,
    pub tile_idx: i32,
    pub t_stack: i32,
    pub class_id: ClassId,
    pub parent_object_id: ObjectId,
    pub tracking_id: u64,
    pub validity: Validity,
    /// Sorted by key.
    pub measurements: BTreeMap<MeasureKey, f64>,
}

impl ObjectRow {
    /// Row for `roi`. `object_idx` is left at `0` until the image flush.
    #[must_use]
    pub fn from_roi(roi: &Roi, image_id: u64, channel_id: u32, tile_idx: i32, t_stack: i32) -> Self {
        let m = &roi.metrics;
        let com = roi.global_center_of_mass();
        let bbox = roi.bbox();
        let mut measurements = BTreeMap::from([
            (
                MeasureKey::own(MeasureChannel::Confidence),
                f64::from(roi.confidence()),
            ),
            (MeasureKey::own(MeasureChannel::AreaSize), m.area),
            (MeasureKey::own(MeasureChannel::Perimeter), m.perimeter),
            (MeasureKey::own(MeasureChannel::Circularity), m.circularity),
            (MeasureKey::own(MeasureChannel::CenterOfMassX), com.x),
            (MeasureKey::own(MeasureChannel::CenterOfMassY), com.y),
            (
                MeasureKey::own(MeasureChannel::BoundingBoxWidth),
                f64::from(bbox.width),
            ),
            (
                MeasureKey::own(MeasureChannel::BoundingBoxHeight),
                f64::from(bbox.height),
            ),
            (MeasureKey::own(MeasureChannel::IntensityAvg), m.intensity.avg),
            (MeasureKey::own(MeasureChannel::IntensityMin), m.intensity.min),
            (MeasureKey::own(MeasureChannel::IntensityMax), m.intensity.max),
            (MeasureKey::own(MeasureChannel::IntensitySum), m.intensity.sum),
            (MeasureKey::own(MeasureChannel::GradientAvg), m.gradient.avg),
            (MeasureKey::own(MeasureChannel::GradientMax), m.gradient.max),
            (
                MeasureKey::own(MeasureChannel::GradientStdDev),
                m.gradient.stddev,
            ),
        ]);
        for (&c, stats) in &m.cross_channel {
            measurements.insert(MeasureKey::cross(MeasureChannel::IntensityAvg, c), stats.avg);
            measurements.insert(MeasureKey::cross(MeasureChannel::IntensityMin, c), stats.min);
            measurements.insert(MeasureKey::cross(MeasureChannel::IntensityMax, c), stats.max);
            measurements.insert(MeasureKey::cross(MeasureChannel::IntensitySum, c), stats.sum);
        }
        Self {
            image_id,
            channel_id,
            object_idx: 0,
            object_id: roi.id,
            tile_idx,
            t_stack,
            class_id: roi.class_id,
            parent_object_id: roi.parent_id,
            tracking_id: roi.tracking_id,
            validity: roi.validity,
            measurements,
        }
    }
}

/// Intensity statistics of a plane region.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PlaneStats {
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub median: f64,
    pub stddev: f64,
}

impl PlaneStats {
    /// Statistics of channel 0 of `plane` inside `rect`.
    #[must_use]
    #[allow(clippy::cast_sign_loss, clippy::cast_precision_loss)]
    pub fn measure(plane: &ImagePlane, rect: Rect) -> Self {
        let Some(rect) = rect.intersection(Rect::from_dimensions(plane.dimensions())) else {
            return Self::default();
        };
        let mut values = Vec::with_capacity(rect.area() as usize);
        for y in rect.y..rect.bottom() {
            for x in rect.x..rect.right() {
                values.push(plane.get(x as u32, y as u32, 0));
            }
        }
        let n = values.len() as f64;
        let sum: f64 = values.iter().sum();
        let avg = sum / n;
        let var = values.iter().map(|v| (v - avg).powi(2)).sum::<f64>() / n;
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        Self {
            sum,
            min,
            max,
            avg,
            median: filter::median(&mut values),
            stddev: var.sqrt(),
        }
    }
}

/// Per-tile statistics written by `$storeToDb`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageStatsRow {
    pub image_id: u64,
    pub channel_id: u32,
    pub tile_idx: i32,
    pub t_stack: i32,
    pub validity: ImageValidity,
    pub invalidate_all: bool,
    pub control_image_path: Option<String>,
    pub intensity: PlaneStats,
}

/// One processed image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub image_id: u64,
    pub plate_id: u16,
    /// Well label such as `B3`.
    pub group_label: String,
    pub plate_row: u16,
    pub plate_col: u16,
    /// Image number within its well.
    pub image_idx: u32,
    pub file_name: String,
    pub file_path: String,
    pub width: u32,
    pub height: u32,
    pub validity: ImageValidity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassRecord {
    pub class_id: ClassId,
    pub name: String,
    pub color: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineRecord {
    pub index: u32,
    pub name: String,
    pub default_class: ClassId,
    pub c_stack: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlateRecord {
    pub plate_id: u16,
    pub name: String,
    pub rows: u16,
    pub cols: u16,
    /// Layout of image numbers inside a well, row by row.
    pub well_image_order: Vec<Vec<u32>>,
}

/// Everything a sink needs to open a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStart {
    pub name: String,
    /// Snapshot of the analysis settings as JSON.
    pub settings_json: String,
    pub classes: Vec<ClassRecord>,
    pub pipelines: Vec<PipelineRecord>,
    pub plates: Vec<PlateRecord>,
}

/// Job lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Created,
    Running,
    Finished,
    Stopped,
    Failed,
}

impl JobStatus {
    /// `CREATED → RUNNING → FINISHED | STOPPED | FAILED`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Created, Self::Running)
                | (Self::Running, Self::Finished | Self::Stopped | Self::Failed)
        )
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Running => "RUNNING",
            Self::Finished => "FINISHED",
            Self::Stopped => "STOPPED",
            Self::Failed => "FAILED",
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATED" => Ok(Self::Created),
            "RUNNING" => Ok(Self::Running),
            "FINISHED" => Ok(Self::Finished),
            "STOPPED" => Ok(Self::Stopped),
            "FAILED" => Ok(Self::Failed),
            other => Err(format!("unknown job status {other:?}")),
        }
    }
}

/// Destination of job results.
///
/// Implementations serialize their own writes; the scheduler calls
/// [`write_image`](Self::write_image) from several worker threads.
pub trait ResultSink: Send + Sync {
    /// Create the job and move it to `RUNNING`. Returns the job id.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] if the job cannot be recorded.
    fn begin_job(&self, job: &JobStart) -> Result<String, SinkError>;

    /// Append one finished image with its object and statistics rows.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] if the rows cannot be appended.
    fn write_image(
        &self,
        job_id: &str,
        image: &ImageRecord,
        objects: &[ObjectRow],
        stats: &[ImageStatsRow],
    ) -> Result<(), SinkError>;

    /// Record the final job state.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] for illegal transitions or write failures.
    fn finish_job(&self, job_id: &str, status: JobStatus) -> Result<(), SinkError>;
}

/// Rows collected by [`MemorySink`].
#[derive(Debug, Clone, Default)]
pub struct MemorySinkState {
    pub job: Option<JobStart>,
    pub status: Option<JobStatus>,
    pub images: Vec<ImageRecord>,
    pub objects: Vec<ObjectRow>,
    pub stats: Vec<ImageStatsRow>,
}

/// In-process sink that keeps every row in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    state: Mutex<MemorySinkState>,
    reject_writes: bool,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sink whose [`write_image`](ResultSink::write_image) always fails.
    #[must_use]
    pub fn rejecting() -> Self {
        Self {
            state: Mutex::default(),
            reject_writes: true,
        }
    }

    /// Copy of everything written so far.
    #[must_use]
    pub fn snapshot(&self) -> MemorySinkState {
        self.state.lock().clone()
    }
}

impl ResultSink for MemorySink {
    fn begin_job(&self, job: &JobStart) -> Result<String, SinkError> {
        let mut state = self.state.lock();
        state.job = Some(job.clone());
        state.status = Some(JobStatus::Running);
        Ok("memory".to_owned())
    }

    fn write_image(
        &self,
        _job_id: &str,
        image: &ImageRecord,
        objects: &[ObjectRow],
        stats: &[ImageStatsRow],
    ) -> Result<(), SinkError> {
        if self.reject_writes {
            return Err(SinkError("writes are disabled".to_owned()));
        }
        let mut state = self.state.lock();
        state.images.push(image.clone());
        state.objects.extend_from_slice(objects);
        state.stats.extend_from_slice(stats);
        Ok(())
    }

    fn finish_job(&self, _job_id: &str, status: JobStatus) -> Result<(), SinkError> {
        let mut state = self.state.lock();
        let current = state.status.unwrap_or(JobStatus::Created);
        if !current.can_transition_to(status) {
            return Err(SinkError(format!(
                "illegal job transition {} -> {}",
                current.as_str(),
                status.as_str()
            )));
        }
        state.status = Some(status);
        Ok(())
    }
}
