//! Result tables produced by the query layer.

use serde::{Deserialize, Serialize};

/// Aggregation applied to the values of one column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stat {
    Sum,
    #[default]
    Avg,
    Min,
    Max,
    Count,
    Median,
    #[serde(rename = "STDDEV")]
    StdDev,
}

impl Stat {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Sum => "sum",
            Self::Avg => "avg",
            Self::Min => "min",
            Self::Max => "max",
            Self::Count => "cnt",
            Self::Median => "median",
            Self::StdDev => "stddev",
        }
    }

    /// Aggregate `values`. An empty set counts as zero and is NaN for
    /// every other statistic.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn apply(self, values: &[f64]) -> f64 {
        if values.is_empty() {
            return if self == Self::Count { 0.0 } else { f64::NAN };
        }
        let n = values.len() as f64;
        match self {
            Self::Sum => values.iter().sum(),
            Self::Avg => values.iter().sum::<f64>() / n,
            Self::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
            Self::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            Self::Count => n,
            Self::Median => {
                let mut sorted = values.to_vec();
                sorted.sort_by(f64::total_cmp);
                let mid = sorted.len() / 2;
                if sorted.len() % 2 == 0 {
                    f64::midpoint(sorted[mid - 1], sorted[mid])
                } else {
                    sorted[mid]
                }
            }
            Self::StdDev => {
                let mean = values.iter().sum::<f64>() / n;
                (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt()
            }
        }
    }
}

/// Header of one value column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnHeader {
    pub title: String,
    /// Physical unit such as `px²` or `a.u.`.
    pub unit: String,
}

impl ColumnHeader {
    /// `title [unit]`.
    #[must_use]
    pub fn label(&self) -> String {
        if self.unit.is_empty() {
            self.title.clone()
        } else {
            format!("{} [{}]", self.title, self.unit)
        }
    }
}

/// Header of one row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowHeader {
    pub label: String,
    /// `false` when an image behind the row was only partly processed.
    pub valid: bool,
}

impl RowHeader {
    #[must_use]
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            valid: true,
        }
    }
}

/// A titled grid of numbers. Missing values are NaN.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub title: String,
    /// Caption of the row header column (`Well`, `Image`, ...).
    pub row_caption: String,
    pub columns: Vec<ColumnHeader>,
    pub rows: Vec<RowHeader>,
    /// `rows.len()` rows of `columns.len()` values.
    pub cells: Vec<Vec<f64>>,
}

impl Table {
    /// Table with all cells NaN.
    #[must_use]
    pub fn new(
        title: impl Into<String>,
        row_caption: impl Into<String>,
        columns: Vec<ColumnHeader>,
        rows: Vec<RowHeader>,
    ) -> Self {
        let cells = vec![vec![f64::NAN; columns.len()]; rows.len()];
        Self {
            title: title.into(),
            row_caption: row_caption.into(),
            columns,
            rows,
            cells,
        }
    }

    #[must_use]
    pub fn get(&self, row: usize, col: usize) -> Option<f64> {
        self.cells.get(row)?.get(col).copied()
    }

    pub fn set(&mut self, row: usize, col: usize, value: f64) {
        if let Some(cell) = self.cells.get_mut(row).and_then(|r| r.get_mut(col)) {
            *cell = value;
        }
    }

    /// Number of cells holding a number.
    #[must_use]
    pub fn filled(&self) -> usize {
        self.cells.iter().flatten().filter(|v| !v.is_nan()).count()
    }
}

/// Spreadsheet-style row label: 1 = `A`, 26 = `Z`, 27 = `AA`.
#[must_use]
pub fn row_label(mut n: u32) -> String {
    let mut letters = Vec::new();
    while n > 0 {
        n -= 1;
        letters.push(char::from(b'A' + u8::try_from(n % 26).unwrap_or(0)));
        n /= 26;
    }
    letters.iter().rev().collect()
}
