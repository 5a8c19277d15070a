use imagec_engine::SinkError;

/// Errors from the result store and the query layer.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("invalid stored JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// The file was written by a different schema version.
    #[error("store schema version {found} does not match the supported version {expected}")]
    SchemaVersion { found: String, expected: u32 },

    #[error("unknown job {0:?}")]
    UnknownJob(String),

    /// The store holds no jobs at all.
    #[error("the store contains no jobs")]
    NoJobs,

    /// `from` cannot move to `to`.
    #[error("job {job_id}: illegal status change {from} -> {to}")]
    Transition {
        job_id: String,
        from: String,
        to: String,
    },

    /// A filter does not match anything in the job.
    #[error("invalid filter: {0}")]
    Filter(String),
}

impl From<StoreError> for SinkError {
    fn from(err: StoreError) -> Self {
        Self(err.to_string())
    }
}
