//! SQLite result store.
//!
//! One [`Store`] wraps one results file. Jobs are appended; nothing is
//! updated after it is written except the job status. Writers go through
//! an [`Appender`], which batches the rows of one image into a single
//! transaction.

use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use imagec_engine::{
    AnalyzeSettings, ImageRecord, ImageStatsRow, JobStart, JobStatus, ObjectRow, ResultSink,
    SinkError,
};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{Connection, OptionalExtension, params};

use crate::error::StoreError;
use crate::schema::{self, from_sql_id, to_sql_id};

/// A job as recorded in the store.
#[derive(Debug, Clone)]
pub struct JobInfo {
    pub job_id: String,
    pub name: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub status: JobStatus,
    pub settings: AnalyzeSettings,
}

impl JobInfo {
    /// Wall time between start and finish, `None` while running.
    #[must_use]
    pub fn duration(&self) -> Option<chrono::Duration> {
        let start = DateTime::parse_from_rfc3339(&self.started_at).ok()?;
        let end = DateTime::parse_from_rfc3339(self.finished_at.as_deref()?).ok()?;
        Some(end - start)
    }
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Handle to a results file.
#[derive(Debug)]
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open or create a results file in WAL mode.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::SchemaVersion`] when the file was written by
    /// another schema version and [`StoreError::Sqlite`] when it cannot be
    /// opened.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        tracing::debug!(path = %path.display(), journal_mode = %mode, "opened result store");
        Self::prepare(conn)
    }

    /// Store that lives only in memory.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] when SQLite cannot allocate it.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::prepare(Connection::open_in_memory()?)
    }

    fn prepare(conn: Connection) -> Result<Self, StoreError> {
        schema::prepare(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    /// Record a new job in state `CREATED` with its classes, pipelines and
    /// plates. Returns the generated job id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] when the rows cannot be inserted.
    pub fn create_job(&self, job: &JobStart) -> Result<String, StoreError> {
        let job_id = uuid::Uuid::new_v4().to_string();
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO jobs (job_id, job_name, started_at, status, settings)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                job_id,
                job.name,
                now(),
                JobStatus::Created.as_str(),
                job.settings_json
            ],
        )?;
        for class in &job.classes {
            tx.execute(
                "INSERT INTO classes (job_id, class_id, name, color) VALUES (?1, ?2, ?3, ?4)",
                params![job_id, class.class_id.0, class.name, class.color],
            )?;
        }
        for pipeline in &job.pipelines {
            tx.execute(
                "INSERT INTO pipelines (job_id, pipeline_idx, name, default_class, c_stack)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    job_id,
                    pipeline.index,
                    pipeline.name,
                    pipeline.default_class.0,
                    pipeline.c_stack
                ],
            )?;
        }
        for plate in &job.plates {
            tx.execute(
                "INSERT INTO plates (job_id, plate_id, name, plate_rows, plate_cols, well_image_order)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    job_id,
                    plate.plate_id,
                    plate.name,
                    plate.rows,
                    plate.cols,
                    serde_json::to_string(&plate.well_image_order)?
                ],
            )?;
        }
        tx.commit()?;
        tracing::info!(job_id = %job_id, name = %job.name, "job created");
        Ok(job_id)
    }

    /// Move a job to `status`. Terminal states also stamp `finished_at`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Transition`] for a change the job lifecycle
    /// does not allow and [`StoreError::UnknownJob`] for a missing job.
    pub fn set_status(&self, job_id: &str, status: JobStatus) -> Result<(), StoreError> {
        let conn = self.conn();
        let current = read_status(&conn, job_id)?;
        if !current.can_transition_to(status) {
            return Err(StoreError::Transition {
                job_id: job_id.to_owned(),
                from: current.as_str().to_owned(),
                to: status.as_str().to_owned(),
            });
        }
        let finished = matches!(
            status,
            JobStatus::Finished | JobStatus::Stopped | JobStatus::Failed
        )
        .then(now);
        conn.execute(
            "UPDATE jobs SET status = ?2, finished_at = COALESCE(?3, finished_at) WHERE job_id = ?1",
            params![job_id, status.as_str(), finished],
        )?;
        tracing::info!(job_id, status = status.as_str(), "job status");
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`StoreError::UnknownJob`] when no such job exists.
    pub fn job(&self, job_id: &str) -> Result<JobInfo, StoreError> {
        let raw = self
            .conn()
            .query_row(
                &format!("{JOB_COLUMNS} WHERE job_id = ?1"),
                [job_id],
                RawJob::from_row,
            )
            .optional()?
            .ok_or_else(|| StoreError::UnknownJob(job_id.to_owned()))?;
        raw.into_info()
    }

    /// The most recently started job.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NoJobs`] for an empty store.
    pub fn latest_job(&self) -> Result<JobInfo, StoreError> {
        let raw = self
            .conn()
            .query_row(
                &format!("{JOB_COLUMNS} ORDER BY started_at DESC, rowid DESC LIMIT 1"),
                [],
                RawJob::from_row,
            )
            .optional()?
            .ok_or(StoreError::NoJobs)?;
        raw.into_info()
    }

    /// Start a batch of rows for one job. Nothing is visible to readers
    /// until [`Appender::close`].
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] when the transaction cannot begin.
    pub fn appender(&self, job_id: &str) -> Result<Appender<'_>, StoreError> {
        let conn = self.conn();
        conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(Appender {
            conn,
            job_id: job_id.to_owned(),
            open: true,
        })
    }
}

const JOB_COLUMNS: &str =
    "SELECT job_id, job_name, started_at, finished_at, status, settings FROM jobs";

/// A `jobs` row before its status and settings are parsed.
struct RawJob {
    job_id: String,
    name: String,
    started_at: String,
    finished_at: Option<String>,
    status: String,
    settings: String,
}

impl RawJob {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            job_id: row.get(0)?,
            name: row.get(1)?,
            started_at: row.get(2)?,
            finished_at: row.get(3)?,
            status: row.get(4)?,
            settings: row.get(5)?,
        })
    }

    fn into_info(self) -> Result<JobInfo, StoreError> {
        Ok(JobInfo {
            status: self.status.parse().map_err(StoreError::Filter)?,
            settings: serde_json::from_str(&self.settings)?,
            job_id: self.job_id,
            name: self.name,
            started_at: self.started_at,
            finished_at: self.finished_at,
        })
    }
}

fn read_status(conn: &Connection, job_id: &str) -> Result<JobStatus, StoreError> {
    let status: String = conn
        .query_row("SELECT status FROM jobs WHERE job_id = ?1", [job_id], |row| {
            row.get(0)
        })
        .optional()?
        .ok_or_else(|| StoreError::UnknownJob(job_id.to_owned()))?;
    status.parse().map_err(StoreError::Filter)
}

/// Batch writer holding the store lock for the duration of one
/// transaction. Dropping it without [`close`](Self::close) rolls back.
pub struct Appender<'a> {
    conn: MutexGuard<'a, Connection>,
    job_id: String,
    open: bool,
}

impl Appender<'_> {
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] when the row is rejected.
    pub fn image(&mut self, image: &ImageRecord) -> Result<(), StoreError> {
        let mut stmt = self.conn.prepare_cached(
            "INSERT INTO images (job_id, image_id, plate_id, group_label, plate_row, plate_col,
                image_idx, file_name, file_path, width, height, validity)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        )?;
        stmt.execute(params![
            self.job_id,
            to_sql_id(image.image_id),
            image.plate_id,
            image.group_label,
            image.plate_row,
            image.plate_col,
            image.image_idx,
            image.file_name,
            image.file_path,
            image.width,
            image.height,
            image.validity.0
        ])?;
        Ok(())
    }

    /// Object rows with their measurements, in ascending key order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] when a row is rejected.
    pub fn objects(&mut self, objects: &[ObjectRow]) -> Result<(), StoreError> {
        let mut object_stmt = self.conn.prepare_cached(
            "INSERT INTO objects (job_id, image_id, channel_id, object_idx, object_id, tile_idx,
                t_stack, class_id, parent_object_id, tracking_id, validity)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        )?;
        let mut measure_stmt = self.conn.prepare_cached(
            "INSERT INTO object_measurements (job_id, image_id, channel_id, object_idx, meas_key, value)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?;
        for o in objects {
            object_stmt.execute(params![
                self.job_id,
                to_sql_id(o.image_id),
                o.channel_id,
                to_sql_id(o.object_idx),
                to_sql_id(o.object_id),
                o.tile_idx,
                o.t_stack,
                o.class_id.0,
                to_sql_id(o.parent_object_id),
                to_sql_id(o.tracking_id),
                o.validity.0
            ])?;
            for (key, value) in &o.measurements {
                measure_stmt.execute(params![
                    self.job_id,
                    to_sql_id(o.image_id),
                    o.channel_id,
                    to_sql_id(o.object_idx),
                    key.0,
                    value
                ])?;
            }
        }
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] when a row is rejected.
    pub fn stats(&mut self, stats: &[ImageStatsRow]) -> Result<(), StoreError> {
        let mut stmt = self.conn.prepare_cached(
            "INSERT INTO image_stats (job_id, image_id, channel_id, tile_idx, t_stack, validity,
                invalidate_all, control_image_path, intensity_sum, intensity_min, intensity_max,
                intensity_avg, intensity_median, intensity_stddev)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        )?;
        for s in stats {
            let i = &s.intensity;
            stmt.execute(params![
                self.job_id,
                to_sql_id(s.image_id),
                s.channel_id,
                s.tile_idx,
                s.t_stack,
                s.validity.0,
                s.invalidate_all,
                s.control_image_path,
                i.sum,
                i.min,
                i.max,
                i.avg,
                i.median,
                i.stddev
            ])?;
        }
        Ok(())
    }

    /// Commit the batch.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] when the commit fails; the batch is
    /// rolled back.
    pub fn close(mut self) -> Result<(), StoreError> {
        self.open = false;
        if let Err(err) = self.conn.execute_batch("COMMIT") {
            let _ = self.conn.execute_batch("ROLLBACK");
            return Err(err.into());
        }
        Ok(())
    }
}

impl Drop for Appender<'_> {
    fn drop(&mut self) {
        if self.open
            && let Err(err) = self.conn.execute_batch("ROLLBACK")
        {
            tracing::warn!(%err, "rollback of an abandoned batch failed");
        }
    }
}

impl ResultSink for Store {
    fn begin_job(&self, job: &JobStart) -> Result<String, SinkError> {
        let job_id = self.create_job(job)?;
        self.set_status(&job_id, JobStatus::Running)?;
        Ok(job_id)
    }

    fn write_image(
        &self,
        job_id: &str,
        image: &ImageRecord,
        objects: &[ObjectRow],
        stats: &[ImageStatsRow],
    ) -> Result<(), SinkError> {
        let mut appender = self.appender(job_id)?;
        appender.image(image)?;
        appender.objects(objects)?;
        appender.stats(stats)?;
        appender.close()?;
        tracing::debug!(
            job_id,
            image_id = image.image_id,
            objects = objects.len(),
            "image rows appended"
        );
        Ok(())
    }

    fn finish_job(&self, job_id: &str, status: JobStatus) -> Result<(), SinkError> {
        Ok(self.set_status(job_id, status)?)
    }
}
