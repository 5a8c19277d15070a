//! Table layout of a results file.
//!
//! 64-bit image and object ids are stored bit-cast into SQLite's signed
//! `INTEGER`; use [`to_sql_id`] and [`from_sql_id`] at the boundary.

use rusqlite::{Connection, OptionalExtension};

use crate::error::StoreError;

/// Bumped whenever a table or column changes.
pub const SCHEMA_VERSION: u32 = 1;

pub const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS metadata (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS jobs (
    job_id      TEXT PRIMARY KEY,
    job_name    TEXT NOT NULL,
    started_at  TEXT NOT NULL,
    finished_at TEXT,
    status      TEXT NOT NULL,
    settings    TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS plates (
    job_id           TEXT NOT NULL,
    plate_id         INTEGER NOT NULL,
    name             TEXT NOT NULL,
    plate_rows       INTEGER NOT NULL,
    plate_cols       INTEGER NOT NULL,
    well_image_order TEXT NOT NULL,
    PRIMARY KEY (job_id, plate_id)
);

CREATE TABLE IF NOT EXISTS images (
    job_id      TEXT NOT NULL,
    image_id    INTEGER NOT NULL,
    plate_id    INTEGER NOT NULL,
    group_label TEXT NOT NULL,
    plate_row   INTEGER NOT NULL,
    plate_col   INTEGER NOT NULL,
    image_idx   INTEGER NOT NULL,
    file_name   TEXT NOT NULL,
    file_path   TEXT NOT NULL,
    width       INTEGER NOT NULL,
    height      INTEGER NOT NULL,
    validity    INTEGER NOT NULL,
    PRIMARY KEY (job_id, image_id)
);

CREATE TABLE IF NOT EXISTS classes (
    job_id   TEXT NOT NULL,
    class_id INTEGER NOT NULL,
    name     TEXT NOT NULL,
    color    TEXT NOT NULL,
    PRIMARY KEY (job_id, class_id)
);

CREATE TABLE IF NOT EXISTS pipelines (
    job_id        TEXT NOT NULL,
    pipeline_idx  INTEGER NOT NULL,
    name          TEXT NOT NULL,
    default_class INTEGER NOT NULL,
    c_stack       INTEGER NOT NULL,
    PRIMARY KEY (job_id, pipeline_idx)
);

CREATE TABLE IF NOT EXISTS objects (
    job_id           TEXT NOT NULL,
    image_id         INTEGER NOT NULL,
    channel_id       INTEGER NOT NULL,
    object_idx       INTEGER NOT NULL,
    object_id        INTEGER NOT NULL,
    tile_idx         INTEGER NOT NULL,
    t_stack          INTEGER NOT NULL,
    class_id         INTEGER NOT NULL,
    parent_object_id INTEGER NOT NULL,
    tracking_id      INTEGER NOT NULL,
    validity         INTEGER NOT NULL,
    PRIMARY KEY (job_id, image_id, channel_id, object_idx)
);

CREATE INDEX IF NOT EXISTS objects_by_class ON objects (job_id, class_id);

CREATE TABLE IF NOT EXISTS object_measurements (
    job_id     TEXT NOT NULL,
    image_id   INTEGER NOT NULL,
    channel_id INTEGER NOT NULL,
    object_idx INTEGER NOT NULL,
    meas_key   INTEGER NOT NULL,
    value      REAL,
    PRIMARY KEY (job_id, image_id, channel_id, object_idx, meas_key)
);

CREATE TABLE IF NOT EXISTS image_stats (
    job_id             TEXT NOT NULL,
    image_id           INTEGER NOT NULL,
    channel_id         INTEGER NOT NULL,
    tile_idx           INTEGER NOT NULL,
    t_stack            INTEGER NOT NULL,
    validity           INTEGER NOT NULL,
    invalidate_all     INTEGER NOT NULL,
    control_image_path TEXT,
    intensity_sum      REAL,
    intensity_min      REAL,
    intensity_max      REAL,
    intensity_avg      REAL,
    intensity_median   REAL,
    intensity_stddev   REAL,
    PRIMARY KEY (job_id, image_id, channel_id, tile_idx, t_stack)
);
";

/// Create the tables of a fresh file, or check the version of an existing one.
pub(crate) fn prepare(conn: &Connection) -> Result<(), StoreError> {
    // The version is checked before any other table is touched.
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS metadata (key TEXT PRIMARY KEY, value TEXT NOT NULL);",
    )?;
    let found: Option<String> = conn
        .query_row(
            "SELECT value FROM metadata WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    match found {
        None => {
            conn.execute_batch(SCHEMA)?;
            conn.execute(
                "INSERT INTO metadata (key, value) VALUES ('schema_version', ?1)",
                [SCHEMA_VERSION.to_string()],
            )?;
            Ok(())
        }
        Some(v) if v == SCHEMA_VERSION.to_string() => Ok(()),
        Some(found) => Err(StoreError::SchemaVersion {
            found,
            expected: SCHEMA_VERSION,
        }),
    }
}

#[must_use]
#[allow(clippy::cast_possible_wrap)]
pub const fn to_sql_id(id: u64) -> i64 {
    id as i64
}

#[must_use]
#[allow(clippy::cast_sign_loss)]
pub const fn from_sql_id(id: i64) -> u64 {
    id as u64
}
