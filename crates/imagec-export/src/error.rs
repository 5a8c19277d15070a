/// Failure while writing an export.
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("workbook container: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// An export needs at least one table.
    #[error("nothing to export")]
    Empty,
}
