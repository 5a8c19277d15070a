//! Analysis settings: the JSON document a job is started from.
//!
//! ```json
//! {
//!   "imagecMeta": { "swVersion": "1.0.0", "buildTime": "..." },
//!   "projectSettings": { "experiment": {}, "plates": [], "imageSetup": {}, "runtime": {}, "results": {} },
//!   "classification": { "classes": [ { "classId": 1, "name": "nucleus", "color": "#1f77b4" } ] },
//!   "pipelines": [ ... ]
//! }
//! ```
//!
//! Keys are camelCase, unknown keys are ignored and missing keys take the
//! defaults documented on each field.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::command::Command;
use crate::error::ConfigError;
use crate::pipeline::{Pipeline, PipelineMeta, PipelinePlan, PipelineSetup, validate_pipelines};
use crate::results::{ClassRecord, PlateRecord};
use crate::types::{ClassId, ClassIdIn};

/// Default filename pattern: `..._B3_12...` is well B3, image 12.
pub const DEFAULT_FILENAME_REGEX: &str = "_((.)([0-9]+))_([0-9]+)";

/// Extension of pipeline template files.
pub const TEMPLATE_EXTENSION: &str = "ictempl";

/// Top-level settings document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AnalyzeSettings {
    pub imagec_meta: ImagecMeta,
    pub project_settings: ProjectSettings,
    pub classification: Classification,
    pub pipelines: Vec<Pipeline>,
}

impl AnalyzeSettings {
    /// Parse settings from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed JSON or wrong types.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read and parse a settings file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] when the file cannot be read and
    /// [`ConfigError::Parse`] when it is not valid settings JSON.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&json)
    }

    /// Serialize back to pretty JSON (the job's settings snapshot).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] if serialization fails.
    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Validate the whole document and resolve the pipelines into
    /// executable plans.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found: invalid plate or runtime
    /// settings, duplicate class ids, or any pipeline validation error.
    pub fn validate(&self) -> Result<Vec<PipelinePlan>, ConfigError> {
        self.project_settings.validate()?;
        self.classification.validate()?;
        validate_pipelines(&self.pipelines, &self.classification)
    }
}

/// Software version stamp written by the producer of the file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ImagecMeta {
    pub sw_version: String,
    pub build_time: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProjectSettings {
    pub experiment: Experiment,
    pub plates: Vec<PlateSettings>,
    pub image_setup: ImageSetup,
    pub runtime: RuntimeSettings,
    pub results: ResultsOutput,
}

impl ProjectSettings {
    fn validate(&self) -> Result<(), ConfigError> {
        for plate in &self.plates {
            if plate.rows == 0 || plate.cols == 0 {
                return Err(ConfigError::Invalid {
                    field: format!("plates[{}]", plate.plate_id),
                    reason: "rows and cols must be at least 1".to_owned(),
                });
            }
            regex::Regex::new(&plate.filename_regex)?;
        }
        if self.image_setup.composite_tile_width == 0 || self.image_setup.composite_tile_height == 0
        {
            return Err(ConfigError::Invalid {
                field: "imageSetup.compositeTileWidth/Height".to_owned(),
                reason: "tile size must be positive".to_owned(),
            });
        }
        let pixel_size = self.image_setup.pixel_size;
        if pixel_size.is_nan() || pixel_size <= 0.0 {
            return Err(ConfigError::Invalid {
                field: "imageSetup.pixelSize".to_owned(),
                reason: "pixel size must be positive".to_owned(),
            });
        }
        Ok(())
    }

    /// Plates as stored with the job.
    #[must_use]
    pub fn plate_records(&self) -> Vec<PlateRecord> {
        self.plates
            .iter()
            .map(|p| PlateRecord {
                plate_id: p.plate_id,
                name: p.name.clone(),
                rows: p.rows,
                cols: p.cols,
                well_image_order: p.well_image_order.clone(),
            })
            .collect()
    }
}

/// Descriptive experiment metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Experiment {
    pub experiment_id: String,
    pub name: String,
    pub scientists: Vec<String>,
    pub notes: String,
}

/// One plate and where its images live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlateSettings {
    pub plate_id: u16,
    pub name: String,
    /// Default 8 (96-well plate).
    pub rows: u16,
    /// Default 12.
    pub cols: u16,
    pub image_folder: PathBuf,
    /// Four groups: well label, row letter, column number, image index.
    pub filename_regex: String,
    /// Layout of image numbers inside one well, row by row.
    pub well_image_order: Vec<Vec<u32>>,
}

impl Default for PlateSettings {
    fn default() -> Self {
        Self {
            plate_id: 1,
            name: String::new(),
            rows: 8,
            cols: 12,
            image_folder: PathBuf::new(),
            filename_regex: DEFAULT_FILENAME_REGEX.to_owned(),
            well_image_order: vec![vec![1, 2], vec![3, 4]],
        }
    }
}

/// How images are read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ImageSetup {
    /// Default 4096.
    pub composite_tile_width: u32,
    /// Default 4096.
    pub composite_tile_height: u32,
    pub series: u32,
    pub resolution: u32,
    /// Physical size of one pixel edge. Default 1.
    pub pixel_size: f64,
    /// Default `px`.
    pub pixel_size_unit: String,
}

impl Default for ImageSetup {
    fn default() -> Self {
        Self {
            composite_tile_width: 4096,
            composite_tile_height: 4096,
            series: 0,
            resolution: 0,
            pixel_size: 1.0,
            pixel_size_unit: "px".to_owned(),
        }
    }
}

/// Concurrency limits. `0` means "number of host cores".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuntimeSettings {
    pub max_image_parallel: usize,
    pub max_tile_parallel: usize,
    pub max_channel_parallel: usize,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            max_image_parallel: 1,
            max_tile_parallel: 0,
            max_channel_parallel: 0,
        }
    }
}

/// Where results go.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResultsOutput {
    pub job_name: String,
    /// Default `results.icdb`.
    pub output_file: PathBuf,
    /// Folder for control images; none are written when unset.
    pub control_image_folder: Option<PathBuf>,
}

impl Default for ResultsOutput {
    fn default() -> Self {
        Self {
            job_name: String::new(),
            output_file: PathBuf::from("results.icdb"),
            control_image_folder: None,
        }
    }
}

/// Project-wide class list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Classification {
    pub classes: Vec<ClassInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassInfo {
    pub class_id: ClassId,
    pub name: String,
    #[serde(default)]
    pub color: String,
}

impl Classification {
    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::BTreeSet::new();
        for class in &self.classes {
            if class.class_id == ClassId::NONE || !seen.insert(class.class_id) {
                return Err(ConfigError::Invalid {
                    field: "classification.classes".to_owned(),
                    reason: format!("class id {} is reserved or duplicated", class.class_id.0),
                });
            }
        }
        Ok(())
    }

    /// Resolve a class reference.
    ///
    /// `$` maps to `default`, `$N` to the N-th listed class, `None` to
    /// [`ClassId::NONE`] and a numeric id to itself if it is listed.
    #[must_use]
    pub fn resolve(&self, reference: ClassIdIn, default: ClassId) -> Option<ClassId> {
        match reference {
            ClassIdIn::Default => Some(default),
            ClassIdIn::Indexed(n) => self
                .classes
                .get(usize::from(n).checked_sub(1)?)
                .map(|c| c.class_id),
            ClassIdIn::Id(id) => self.contains(id).then_some(id),
            ClassIdIn::None => Some(ClassId::NONE),
        }
    }

    #[must_use]
    pub fn contains(&self, id: ClassId) -> bool {
        self.classes.iter().any(|c| c.class_id == id)
    }

    #[must_use]
    pub fn name_of(&self, id: ClassId) -> Option<&str> {
        self.classes
            .iter()
            .find(|c| c.class_id == id)
            .map(|c| c.name.as_str())
    }

    #[must_use]
    pub fn records(&self) -> Vec<ClassRecord> {
        self.classes
            .iter()
            .map(|c| ClassRecord {
                class_id: c.class_id,
                name: c.name.clone(),
                color: c.color.clone(),
            })
            .collect()
    }
}

/// A reusable pipeline stored as `.ictempl`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineTemplate {
    pub meta: PipelineMeta,
    pub pipeline_setup: PipelineSetup,
    pub pipeline_steps: Vec<Command>,
    /// Schema of the template's user-facing parameters, opaque here.
    pub config_schema: String,
}

impl PipelineTemplate {
    /// Read a template file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for a wrong extension,
    /// [`ConfigError::Read`] or [`ConfigError::Parse`] otherwise.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if path.extension().and_then(|e| e.to_str()) != Some(TEMPLATE_EXTENSION) {
            return Err(ConfigError::Invalid {
                field: path.display().to_string(),
                reason: format!("templates use the .{TEMPLATE_EXTENSION} extension"),
            });
        }
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Instantiate the template as a pipeline.
    #[must_use]
    pub fn into_pipeline(self) -> Pipeline {
        Pipeline {
            meta: self.meta,
            pipeline_setup: self.pipeline_setup,
            pipeline_steps: self.pipeline_steps,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn classification() -> Classification {
        Classification {
            classes: vec![
                ClassInfo {
                    class_id: ClassId(10),
                    name: "nucleus".to_owned(),
                    color: String::new(),
                },
                ClassInfo {
                    class_id: ClassId(20),
                    name: "cell".to_owned(),
                    color: String::new(),
                },
            ],
        }
    }

    // --- parsing tests ---

    #[test]
    fn empty_document_takes_defaults() {
        let settings = AnalyzeSettings::from_json("{}").unwrap();
        assert!(settings.pipelines.is_empty());
        assert_eq!(settings.project_settings.image_setup.composite_tile_width, 4096);
        assert_eq!(settings.project_settings.runtime.max_image_parallel, 1);
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let settings =
            AnalyzeSettings::from_json(r#"{"futureKey": 1, "imagecMeta": {"swVersion": "2"}}"#)
                .unwrap();
        assert_eq!(settings.imagec_meta.sw_version, "2");
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        assert!(matches!(
            AnalyzeSettings::from_json("{"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn plate_with_zero_rows_is_rejected() {
        let mut settings = AnalyzeSettings::default();
        settings.project_settings.plates.push(PlateSettings {
            rows: 0,
            ..PlateSettings::default()
        });
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::Invalid { .. })
        ));
    }

    // --- classification tests ---

    #[test]
    fn resolves_all_reference_forms() {
        let c = classification();
        let default = ClassId(10);
        assert_eq!(c.resolve(ClassIdIn::Default, default), Some(ClassId(10)));
        assert_eq!(c.resolve(ClassIdIn::Indexed(2), default), Some(ClassId(20)));
        assert_eq!(c.resolve(ClassIdIn::Indexed(3), default), None);
        assert_eq!(c.resolve(ClassIdIn::Id(ClassId(20)), default), Some(ClassId(20)));
        assert_eq!(c.resolve(ClassIdIn::Id(ClassId(5)), default), None);
        assert_eq!(c.resolve(ClassIdIn::None, default), Some(ClassId::NONE));
    }

    #[test]
    fn duplicate_class_ids_are_rejected() {
        let mut c = classification();
        c.classes[1].class_id = ClassId(10);
        assert!(c.validate().is_err());
    }

    // --- template tests ---

    #[test]
    fn template_requires_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cells.json");
        std::fs::write(&path, "{}").unwrap();
        assert!(matches!(
            PipelineTemplate::load(&path),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn template_loads_into_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cells.ictempl");
        std::fs::write(
            &path,
            r#"{"meta": {"name": "Cells"}, "configSchema": "{}",
                "pipelineSteps": [{"$blur": {"mode": "GAUSSIAN", "kernelSize": 5}}]}"#,
        )
        .unwrap();
        let pipeline = PipelineTemplate::load(&path).unwrap().into_pipeline();
        assert_eq!(pipeline.meta.name, "Cells");
        assert_eq!(pipeline.pipeline_steps.len(), 1);
    }
}
