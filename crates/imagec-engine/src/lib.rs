//! imagec-engine: pipeline execution engine for plate-based microscopy.
//!
//! A job reads every image of every plate, cuts it into tiles and runs the
//! project's pipelines on each tile in declared order:
//!
//! source -> planes -> commands (image filters, thresholds, detectors,
//! object classification) -> objects -> result rows.
//!
//! The crate has **no storage dependency**. Rows leave through the
//! [`ResultSink`] trait; the SQLite store lives in `imagec-store`, and
//! image decoding beyond what the `image` crate reads plugs in through
//! [`ImageReader`].
//!
//! ```no_run
//! use imagec_engine::{AnalyzeSettings, FileReader, MemorySink, Scheduler};
//!
//! # fn main() -> Result<(), imagec_engine::EngineError> {
//! let settings = AnalyzeSettings::load("project.json".as_ref())?;
//! let reader = FileReader::default();
//! let sink = MemorySink::new();
//! let summary = Scheduler::new(&reader, &sink).run(&settings)?;
//! println!("{summary}");
//! # Ok(())
//! # }
//! ```

pub mod command;
pub mod context;
pub mod detector;
pub mod diagnostics;
pub mod error;
pub mod filter;
pub mod image;
pub mod objects;
pub mod pipeline;
pub mod resources;
pub mod results;
pub mod roi;
pub mod scheduler;
pub mod settings;
pub mod source;
pub mod spatial;
pub mod types;

pub use command::{Command, IoKind};
pub use context::CancellationToken;
pub use detector::{Detection, Detector, DetectorError, DetectorProvider, DetectorRegistry};
pub use diagnostics::{Clock, JobSummary, StdClock, SteppingClock};
pub use error::{
    CacheMiss, CommandError, ConfigError, EngineError, ErrorKind, ErrorReport, FatalCommand,
    IoError, ResourceError, SinkError,
};
pub use crate::image::{Channels, Depth, ImagePlane};
pub use pipeline::{Pipeline, PipelinePlan};
pub use resources::{FixedMemory, MemoryProbe, SystemMemory};
pub use results::{
    ClassRecord, ImageRecord, ImageStatsRow, JobStart, JobStatus, MeasureChannel, MeasureKey,
    MemorySink, ObjectRow, PipelineRecord, PlaneStats, PlateRecord, ResultSink,
};
pub use roi::Roi;
pub use scheduler::{Progress, Scheduler};
pub use settings::{AnalyzeSettings, Classification, PlateSettings, ProjectSettings};
pub use source::{FileReader, ImageReader, MemoryReader};
pub use types::{ClassId, ClassIdIn, Dimensions, ImageValidity, ObjectId, Rect, Validity};
