//! imagec: run analysis jobs and export their results.
//!
//! # Usage
//!
//! ```text
//! imagec run settings.json --images plate1/ --output results.icdb
//! imagec export results.icdb columns.json --format heatmap --view well --filter "1 B3" -o b3.xlsx
//! ```
//!
//! Argument and configuration errors exit with 1, runtime failures with 2.

#![allow(clippy::print_stdout, clippy::print_stderr)]

mod logging;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use imagec_engine::{
    AnalyzeSettings, ConfigError, EngineError, ErrorKind, FileReader, JobStatus, Progress,
    Scheduler,
};
use imagec_export::{ExportError, ExportKind, Exportable};
use imagec_store::{ResultsFilter, ResultsSettings, Store, StoreError};

/// Batch image analysis for plate-based microscopy.
#[derive(Parser)]
#[command(name = "imagec", version)]
struct Cli {
    /// Log filter directive (`info`, `debug`, `imagec_engine=trace`, ...).
    /// Overrides `RUST_LOG`.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyze every image of the configured plates.
    Run(RunArgs),
    /// Export results of a finished job to a workbook.
    Export(ExportArgs),
}

#[derive(clap::Args)]
struct RunArgs {
    /// Analysis settings (JSON).
    settings: PathBuf,

    /// Image folder used for every plate instead of the configured ones.
    #[arg(long)]
    images: Option<PathBuf>,

    /// Results database instead of the configured output file.
    #[arg(long)]
    output: Option<PathBuf>,

    /// Core count used to resolve unlimited parallelism settings.
    #[arg(long, value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..))]
    threads: Option<usize>,

    /// Print the job summary as JSON instead of text.
    #[arg(long)]
    json: bool,
}

#[derive(clap::Args)]
struct ExportArgs {
    /// Results database.
    database: PathBuf,

    /// Column selection and layout (JSON).
    columns: PathBuf,

    /// Output file type.
    #[arg(long = "type", value_enum, default_value_t = FileType::Xlsx)]
    file_type: FileType,

    #[arg(long, value_enum, default_value_t = Layout::List)]
    format: Layout,

    #[arg(long, value_enum, default_value_t = Level::Plate)]
    view: Level,

    /// `<plate> <group> [<t>] [<image>]`, replaces the filter of the
    /// column file.
    #[arg(long)]
    filter: Option<String>,

    /// Job to export instead of the latest one.
    #[arg(long)]
    job: Option<String>,

    /// Workbook to write.
    #[arg(short, long)]
    output: PathBuf,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum FileType {
    Xlsx,
    /// Workbook plus an R script loading it.
    R,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Layout {
    /// One row per well, image or object.
    List,
    /// Values laid out like the plate, the well or the image.
    Heatmap,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Level {
    Plate,
    Well,
    Image,
}

impl From<FileType> for ExportKind {
    fn from(t: FileType) -> Self {
        match t {
            FileType::Xlsx => Self::Xlsx,
            FileType::R => Self::R,
        }
    }
}

impl From<Layout> for imagec_store::Format {
    fn from(l: Layout) -> Self {
        match l {
            Layout::List => Self::List,
            Layout::Heatmap => Self::Heatmap,
        }
    }
}

impl From<Level> for imagec_store::View {
    fn from(l: Level) -> Self {
        match l {
            Level::Plate => Self::Plate,
            Level::Well => Self::Well,
            Level::Image => Self::Image,
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("{0}")]
    Logging(String),

    #[error(transparent)]
    Settings(#[from] ConfigError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    /// The column file could not be read or parsed.
    #[error("{path}: {reason}")]
    Columns { path: PathBuf, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Export(#[from] ExportError),

    /// The job ran but did not finish.
    #[error("job {job_id} ended {status}")]
    Unfinished { job_id: String, status: String },
}

impl CliError {
    const fn exit_code(&self) -> u8 {
        match self {
            Self::Logging(_)
            | Self::Settings(_)
            | Self::Columns { .. }
            | Self::Store(StoreError::Filter(_)) => 1,
            Self::Engine(e) if matches!(e.kind(), ErrorKind::Config) => 1,
            Self::Engine(_)
            | Self::Store(_)
            | Self::Export(_)
            | Self::Unfinished { .. } => 2,
        }
    }
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            // Help and version go to stdout and are not failures.
            let code = if err.use_stderr() { 1 } else { 0 };
            if let Err(e) = err.print() {
                eprintln!("{e}");
            }
            return ExitCode::from(code);
        }
    };

    match dispatch(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            if matches!(err, CliError::Logging(_)) {
                eprintln!("Error: {err}");
            } else {
                tracing::error!("{err}");
            }
            ExitCode::from(err.exit_code())
        }
    }
}

fn dispatch(cli: Cli) -> Result<(), CliError> {
    logging::init(cli.log_level.as_deref()).map_err(CliError::Logging)?;
    match cli.command {
        Commands::Run(args) => run(&args),
        Commands::Export(args) => export(&args),
    }
}

/// Apply the command-line overrides to loaded settings.
fn apply_overrides(settings: &mut AnalyzeSettings, args: &RunArgs) {
    if let Some(ref images) = args.images {
        for plate in &mut settings.project_settings.plates {
            plate.image_folder.clone_from(images);
        }
    }
    if let Some(ref output) = args.output {
        settings.project_settings.results.output_file.clone_from(output);
    }
}

fn run(args: &RunArgs) -> Result<(), CliError> {
    let mut settings = AnalyzeSettings::load(&args.settings)?;
    apply_overrides(&mut settings, args);

    let output = &settings.project_settings.results.output_file;
    let store = Store::open(output)?;
    tracing::info!(path = %output.display(), "writing results");

    let reader = FileReader::default();
    // Progress goes to stdout unless stdout carries the JSON summary.
    let json = args.json;
    let report = move |p: Progress| {
        let line = format!("[{}%] {}/{} images", p.percent(), p.images_done, p.images_total);
        if json {
            eprintln!("{line}");
        } else {
            println!("{line}");
        }
    };
    let mut scheduler = Scheduler::new(&reader, &store).with_progress(&report);
    if let Some(threads) = args.threads {
        scheduler = scheduler.with_cores(threads);
    }
    let summary = scheduler.run(&settings)?;

    if args.json {
        match serde_json::to_string_pretty(&summary) {
            Ok(json) => println!("{json}"),
            Err(e) => eprintln!("Error serializing summary: {e}"),
        }
    } else {
        println!("{summary}");
    }

    if summary.status == JobStatus::Finished {
        Ok(())
    } else {
        Err(CliError::Unfinished {
            job_id: summary.job_id,
            status: summary.status.as_str().to_owned(),
        })
    }
}

fn load_columns(path: &Path, filter: Option<&str>) -> Result<ResultsSettings, CliError> {
    let columns_error = |reason: String| CliError::Columns {
        path: path.to_path_buf(),
        reason,
    };
    let json = std::fs::read_to_string(path).map_err(|e| columns_error(e.to_string()))?;
    let mut settings =
        ResultsSettings::from_json(&json).map_err(|e| columns_error(e.to_string()))?;
    if let Some(filter) = filter {
        settings.filter = filter.parse::<ResultsFilter>()?;
    }
    Ok(settings)
}

fn export(args: &ExportArgs) -> Result<(), CliError> {
    let settings = load_columns(&args.columns, args.filter.as_deref())?;
    let store = Store::open(&args.database)?;
    let job = match args.job {
        Some(ref id) => store.job(id)?,
        None => store.latest_job()?,
    };
    tracing::info!(job_id = %job.job_id, name = %job.name, "exporting");

    let tables = imagec_store::query(
        &store,
        &job,
        &settings,
        args.view.into(),
        args.format.into(),
    )?;
    let exportables: Vec<Exportable> = tables.into_iter().map(Exportable::from).collect();
    for path in imagec_export::export(&args.output, args.file_type.into(), &job, &exportables)? {
        println!("{}", path.display());
    }
    Ok(())
}
