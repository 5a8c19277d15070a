//! Format-independent workbook model.
//!
//! A [`Workbook`] is a list of [`Sheet`]s of styled cells. Result tables
//! become sheets through [`Sheet::from_table`]; the job description sheet
//! comes from [`meta_sheet`].

use imagec_engine::AnalyzeSettings;
use imagec_store::{JobInfo, Table};

/// Longest sheet name spreadsheet applications accept.
pub const MAX_SHEET_NAME: usize = 31;

/// Cell formatting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Style {
    Normal,
    /// Bold text on a grey fill.
    Header,
    /// Header of a row whose data is not fully valid.
    InvalidHeader,
    /// Bold text without fill.
    Title,
    /// Number with three decimals.
    Number,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Empty,
    Text(String, Style),
    Number(f64),
}

impl Cell {
    fn text(s: impl Into<String>, style: Style) -> Self {
        Self::Text(s.into(), style)
    }

    /// NaN and infinities stay empty.
    fn number(v: f64) -> Self {
        if v.is_finite() {
            Self::Number(v)
        } else {
            Self::Empty
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sheet {
    pub name: String,
    pub rows: Vec<Vec<Cell>>,
    /// Width of the first column in characters.
    pub first_column_width: f64,
}

impl Sheet {
    /// Title in the first row, column headers in the second, then one row
    /// per table row led by its header.
    #[must_use]
    pub fn from_table(table: &Table) -> Self {
        let mut rows = Vec::with_capacity(table.rows.len() + 2);
        rows.push(vec![Cell::text(&table.title, Style::Title)]);
        let mut header = vec![Cell::text(&table.row_caption, Style::Header)];
        header.extend(
            table
                .columns
                .iter()
                .map(|c| Cell::text(c.label(), Style::Header)),
        );
        rows.push(header);
        for (row, values) in table.rows.iter().zip(&table.cells) {
            let style = if row.valid {
                Style::Header
            } else {
                Style::InvalidHeader
            };
            let mut line = vec![Cell::text(&row.label, style)];
            line.extend(values.iter().map(|v| Cell::number(*v)));
            rows.push(line);
        }
        Self {
            name: table.title.clone(),
            rows,
            first_column_width: 24.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Workbook {
    pub sheets: Vec<Sheet>,
}

impl Workbook {
    /// Make sheet names valid and unique: forbidden characters become
    /// `_`, names are cut to [`MAX_SHEET_NAME`] characters and repeated
    /// names get a ` (n)` suffix.
    pub fn normalize_names(&mut self) {
        let mut taken: Vec<String> = Vec::with_capacity(self.sheets.len());
        for sheet in &mut self.sheets {
            let base: String = sheet
                .name
                .chars()
                .map(|c| if "[]:*?/\\".contains(c) { '_' } else { c })
                .collect();
            let base = if base.trim().is_empty() {
                "Sheet".to_owned()
            } else {
                base
            };
            let mut name: String = base.chars().take(MAX_SHEET_NAME).collect();
            let mut n = 2;
            while taken.iter().any(|t| t.eq_ignore_ascii_case(&name)) {
                let suffix = format!(" ({n})");
                let keep = MAX_SHEET_NAME - suffix.chars().count();
                name = base.chars().take(keep).collect::<String>() + &suffix;
                n += 1;
            }
            taken.push(name.clone());
            sheet.name = name;
        }
    }
}

/// Job description: dates, software, classes, pipelines, project and
/// plate settings as key/value pairs under section titles.
#[must_use]
pub fn meta_sheet(job: &JobInfo) -> Sheet {
    let mut meta = MetaBuilder::default();
    let s: &AnalyzeSettings = &job.settings;

    meta.title("Date");
    meta.element("Started at", &job.started_at);
    meta.element("Finished at", job.finished_at.as_deref().unwrap_or("-"));
    meta.element("Duration", &job.duration().map_or_else(|| "-".to_owned(), format_duration));
    meta.element("Status", job.status.as_str());

    meta.title("ImageC");
    meta.element("Version", &s.imagec_meta.sw_version);
    meta.element("Build", &s.imagec_meta.build_time);

    meta.title("Classes");
    for class in &s.classification.classes {
        meta.element(&class.class_id.to_string(), &class.name);
    }

    meta.title("Pipelines");
    for pipeline in &s.pipelines {
        meta.element("Name", &pipeline.meta.name);
        meta.element(
            "Default class",
            &pipeline.pipeline_setup.default_class_id.to_string(),
        );
    }

    let experiment = &s.project_settings.experiment;
    meta.title("Project settings");
    meta.element("Scientist", &experiment.scientists.join(", "));
    meta.element("Experiment ID", &experiment.experiment_id);
    meta.element("Experiment name", &experiment.name);
    meta.element("Job name", &job.name);
    meta.element("Job ID", &job.job_id);
    meta.element("Notes", &experiment.notes);

    for plate in &s.project_settings.plates {
        meta.title(&format!("Plate {}", plate.plate_id));
        meta.element("Name", &plate.name);
        meta.element("Filename regex", &plate.filename_regex);
        meta.element("Image folder", &plate.image_folder.display().to_string());
        meta.element("Well order", &format!("{:?}", plate.well_image_order));
    }

    Sheet {
        name: "Meta".to_owned(),
        rows: meta.rows,
        first_column_width: 24.0,
    }
}

fn format_duration(d: chrono::Duration) -> String {
    let total = d.num_milliseconds().max(0);
    let (h, rest) = (total / 3_600_000, total % 3_600_000);
    let (m, rest) = (rest / 60_000, rest % 60_000);
    format!("{h:02}:{m:02}:{:02}.{:03}", rest / 1000, rest % 1000)
}

#[derive(Default)]
struct MetaBuilder {
    rows: Vec<Vec<Cell>>,
}

impl MetaBuilder {
    fn title(&mut self, title: &str) {
        self.rows.push(Vec::new());
        self.rows.push(vec![Cell::text(title, Style::Title)]);
    }

    fn element(&mut self, key: &str, value: &str) {
        self.rows
            .push(vec![Cell::text(key, Style::Header), Cell::text(value, Style::Normal)]);
    }
}
