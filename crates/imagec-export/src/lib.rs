//! imagec-export: workbook exports of result tables.
//!
//! The serializers ([`write_xlsx`], [`r_script`]) are sans-IO and work on
//! any writer; [`export`] ties them to files on disk.

pub mod error;
pub mod r;
pub mod workbook;
pub mod xlsx;

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use imagec_store::{JobInfo, Table};

pub use error::ExportError;
pub use r::r_script;
pub use workbook::{Cell, Sheet, Style, Workbook, meta_sheet};
pub use xlsx::write_xlsx;

/// Output flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportKind {
    Xlsx,
    /// The workbook plus an R script next to it.
    R,
}

/// A table with the title its sheet should carry.
#[derive(Debug, Clone)]
pub struct Exportable {
    pub title: String,
    pub table: Table,
}

impl From<Table> for Exportable {
    fn from(table: Table) -> Self {
        Self {
            title: table.title.clone(),
            table,
        }
    }
}

/// Workbook with the job's meta sheet first and one sheet per table.
#[must_use]
pub fn build_workbook(job: &JobInfo, tables: &[Exportable]) -> Workbook {
    let mut sheets = Vec::with_capacity(tables.len() + 1);
    sheets.push(meta_sheet(job));
    for exportable in tables {
        let mut sheet = Sheet::from_table(&exportable.table);
        sheet.name.clone_from(&exportable.title);
        sheets.push(sheet);
    }
    let mut workbook = Workbook { sheets };
    workbook.normalize_names();
    workbook
}

/// Write `tables` to `out`. For [`ExportKind::R`] the script lands next to
/// the workbook with the extension `.R`. Returns the files written.
///
/// # Errors
///
/// Returns [`ExportError::Empty`] without tables and
/// [`ExportError::Io`] / [`ExportError::Zip`] when writing fails.
pub fn export(
    out: &Path,
    kind: ExportKind,
    job: &JobInfo,
    tables: &[Exportable],
) -> Result<Vec<PathBuf>, ExportError> {
    if tables.is_empty() {
        return Err(ExportError::Empty);
    }
    let workbook = build_workbook(job, tables);
    let file = BufWriter::new(File::create(out)?);
    write_xlsx(file, &workbook)?.flush()?;
    let mut written = vec![out.to_path_buf()];
    if kind == ExportKind::R {
        let script_path = out.with_extension("R");
        let file_name = out
            .file_name()
            .map_or_else(|| out.display().to_string(), |n| n.to_string_lossy().into_owned());
        std::fs::write(&script_path, r_script(&file_name, &workbook))?;
        written.push(script_path);
    }
    tracing::info!(path = %out.display(), sheets = workbook.sheets.len(), "export written");
    Ok(written)
}
