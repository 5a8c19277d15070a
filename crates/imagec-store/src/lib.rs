//! imagec-store: SQLite result store and query layer.
//!
//! [`Store`] implements the engine's [`ResultSink`](imagec_engine::ResultSink)
//! so a scheduler can write straight into a results file. The [`query`]
//! module reads a finished job back as [`Table`]s for export.

pub mod error;
pub mod query;
pub mod schema;
pub mod store;
pub mod table;

pub use error::StoreError;
pub use query::{ColumnSpec, Format, ResultsFilter, ResultsSettings, View, query};
pub use schema::SCHEMA_VERSION;
pub use store::{Appender, JobInfo, Store};
pub use table::{ColumnHeader, RowHeader, Stat, Table, row_label};
