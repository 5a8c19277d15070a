//! Error taxonomy of the engine.
//!
//! Errors are scoped by how far they propagate:
//!
//! - [`CommandError`] stays inside the pipeline runner. It is logged with
//!   the command's type name and the pipeline continues, except for
//!   [`CommandError::Fatal`] which aborts the current tile.
//! - [`IoError`] fails a single image; the job continues.
//! - [`ConfigError`] and [`ResourceError`] stop a job before it starts.
//! - [`SinkError`] aborts a running job.
//!
//! [`EngineError`] is the union surfaced to callers of the scheduler.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::types::{CacheScope, ImageId};

/// Settings failed validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Settings file could not be read.
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Settings file is not valid JSON for the expected schema.
    #[error("invalid settings: {0}")]
    Parse(#[from] serde_json::Error),

    /// A class reference does not resolve against the classification map.
    #[error("pipeline {pipeline:?}: unknown class reference {class}")]
    UnknownClass { pipeline: String, class: String },

    /// Two chained commands disagree on the data they exchange.
    #[error(
        "pipeline {pipeline:?} step {step} ({command}) accepts {accepted} but the previous step produces {found}"
    )]
    TypeMismatch {
        pipeline: String,
        step: usize,
        command: &'static str,
        accepted: String,
        found: String,
    },

    /// A pipeline reads its input from a memory slot no earlier pipeline fills.
    #[error("pipeline {pipeline:?} reads memory slot {slot} which no earlier pipeline stores")]
    MissingMemorySource { pipeline: String, slot: String },

    /// `$storeToDb` appears anywhere but at the end of a pipeline.
    #[error("pipeline {pipeline:?}: $storeToDb must be the final step")]
    StoreNotLast { pipeline: String },

    /// A referenced file or folder does not exist.
    #[error("missing file {0}")]
    MissingFile(PathBuf),

    /// The filename regex does not compile.
    #[error("invalid filename regex: {0}")]
    Regex(#[from] regex::Error),

    /// Any other out-of-range or inconsistent setting.
    #[error("invalid setting {field}: {reason}")]
    Invalid { field: String, reason: String },
}

/// Filesystem or image reader failure.
#[derive(Debug, thiserror::Error)]
pub enum IoError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to decode {path}: {source}")]
    Decode {
        path: PathBuf,
        source: image::ImageError,
    },

    /// No reader is available for this file format.
    #[error("no reader for {path}")]
    Unsupported { path: PathBuf },

    /// A plane, series, resolution or tile index outside the image.
    #[error("{path}: {what} index {index} out of range (available: {available})")]
    OutOfRange {
        path: PathBuf,
        what: &'static str,
        index: i64,
        available: u64,
    },
}

/// `LOAD` found no entry stored under the requested key.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cache miss: nothing stored in {scope:?} cache for {id:?}")]
pub struct CacheMiss {
    pub scope: CacheScope,
    pub id: ImageId,
}

/// Explicit hard failure signalled by a command.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{command}: {reason}")]
pub struct FatalCommand {
    pub command: &'static str,
    pub reason: String,
}

/// Failure raised while executing one command.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error(transparent)]
    CacheMiss(#[from] CacheMiss),

    /// The active image or object list cannot be processed by this command.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// An external detector failed on this tile.
    #[error("detector failed: {0}")]
    Detector(String),

    /// Reading an additional channel plane failed.
    #[error(transparent)]
    Io(#[from] IoError),

    /// The command asks the scheduler to abort the tile.
    #[error(transparent)]
    Fatal(#[from] FatalCommand),

    /// Cancellation was requested between two passes.
    #[error("cancelled")]
    Cancelled,
}

/// Pre-flight RAM or thread budget violation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error(
    "estimated working memory {required_bytes} bytes exceeds budget {budget_bytes} bytes (80% of {available_bytes} free)"
)]
pub struct ResourceError {
    pub required_bytes: u64,
    pub budget_bytes: u64,
    pub available_bytes: u64,
}

/// The result sink refused a write.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("result store rejected write: {0}")]
pub struct SinkError(pub String);

/// Errors surfaced by the scheduler to its caller.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Io(#[from] IoError),

    #[error(transparent)]
    CacheMiss(#[from] CacheMiss),

    #[error("command failed: {0}")]
    Command(#[from] CommandError),

    #[error(transparent)]
    FatalCommand(#[from] FatalCommand),

    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error(transparent)]
    Store(#[from] SinkError),
}

impl EngineError {
    /// Coarse classification used in summaries and logs.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Config,
            Self::Io(_) => ErrorKind::Io,
            Self::CacheMiss(_) => ErrorKind::CacheMiss,
            Self::Command(_) => ErrorKind::Command,
            Self::FatalCommand(_) => ErrorKind::FatalCommand,
            Self::Resource(_) => ErrorKind::Resource,
            Self::Store(_) => ErrorKind::Store,
        }
    }
}

/// Error classes of [`EngineError`], without payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Config,
    Io,
    CacheMiss,
    Command,
    FatalCommand,
    Resource,
    Store,
}

/// Serializable record of an error.
///
/// The typed sources (`std::io::Error`, `image::ImageError`, ...) do not
/// implement serde traits, so reports keep the kind and the `Display`
/// string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&EngineError> for ErrorReport {
    fn from(err: &EngineError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}
