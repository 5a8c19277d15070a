//! The command catalog.
//!
//! A pipeline step is a [`Command`]: a tagged union with one variant per
//! command family, each owning its settings struct. In settings files a
//! command is a single-key object whose key names the family:
//!
//! ```json
//! { "$blur": { "mode": "GAUSSIAN", "kernelSize": 5 } }
//! ```
//!
//! Every command advertises the [`IoKind`]s it accepts and the kind it
//! produces ([`IoSpec`]); pipeline validation threads these through the
//! step list. Execution is a single exhaustive `match` in
//! [`Command::execute`].

pub mod ai;
pub mod blur;
pub mod cache;
pub mod classify;
pub mod colocalization;
pub mod contrast;
pub mod edge;
pub mod rank;
pub mod reclassify;
pub mod rolling_ball;
pub mod store;
pub mod tensor;
pub mod threshold;
pub mod validator;
pub mod voronoi;
pub mod watershed;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::context::ProcessContext;
use crate::error::CommandError;
use crate::filter::FloatPlane;
use crate::image::{Channels, Depth, ImagePlane};
use crate::types::ClassIdIn;

pub use ai::{AiSettings, ModelClass};
pub use blur::{BlurMode, BlurSettings};
pub use cache::{CacheMode, ImageCacheSettings};
pub use classify::{ClassifySettings, EdgeMode};
pub use colocalization::{ColocalizationSettings, ReclassifyMode, TrackingMode};
pub use contrast::{EnhanceContrastSettings, IntensityTransformMode, IntensityTransformSettings};
pub use edge::{EdgeDetectionMode, EdgeDetectionSettings, EdgeWeight};
pub use rank::{RankFilterSettings, RankMode};
pub use reclassify::{FilterLogic, HierarchyMode, ReclassifySettings};
pub use rolling_ball::RollingBallSettings;
pub use store::StoreToDbSettings;
pub use tensor::{
    HessianMode, HessianSettings, StructureTensorMode, StructureTensorSettings,
    WeightedDeviationSettings,
};
pub use threshold::{AdaptiveMethod, AdaptiveThresholdSettings, ThresholdMode, ThresholdSettings};
pub use validator::{ThresholdValidatorSettings, ValidatorMode};
pub use voronoi::VoronoiSettings;
pub use watershed::WatershedSettings;

/// Kind of data flowing between two commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IoKind {
    /// Grayscale intensity image.
    Image,
    /// 0/255 mask image.
    Binary,
    /// The object list.
    Object,
    /// Output kind equals the kind the command received.
    OutputEqualToInput,
}

impl fmt::Display for IoKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Image => "IMAGE",
            Self::Binary => "BINARY",
            Self::Object => "OBJECT",
            Self::OutputEqualToInput => "OUTPUT_EQUAL_TO_INPUT",
        })
    }
}

/// Input/output contract of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoSpec {
    pub accepts: &'static [IoKind],
    pub produces: IoKind,
}

const IMAGE: &[IoKind] = &[IoKind::Image];
const BINARY: &[IoKind] = &[IoKind::Binary];
const IMAGE_OR_BINARY: &[IoKind] = &[IoKind::Image, IoKind::Binary];
const ANY: &[IoKind] = &[IoKind::Image, IoKind::Binary, IoKind::Object];

impl IoSpec {
    #[must_use]
    pub fn accepts(&self, kind: IoKind) -> bool {
        self.accepts.contains(&kind)
    }

    /// Kind after this command given the kind it received.
    #[must_use]
    pub const fn output_for(&self, input: IoKind) -> IoKind {
        match self.produces {
            IoKind::OutputEqualToInput => input,
            other => other,
        }
    }

    fn accepted_names(&self) -> String {
        self.accepts
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("|")
    }
}

/// One pipeline step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    #[serde(rename = "$blur")]
    Blur(BlurSettings),
    #[serde(rename = "$edgeDetection")]
    EdgeDetection(EdgeDetectionSettings),
    #[serde(rename = "$enhanceContrast")]
    EnhanceContrast(EnhanceContrastSettings),
    #[serde(rename = "$intensityTransform")]
    IntensityTransform(IntensityTransformSettings),
    #[serde(rename = "$rollingBall")]
    RollingBall(RollingBallSettings),
    #[serde(rename = "$rankFilter")]
    RankFilter(RankFilterSettings),
    #[serde(rename = "$structureTensor")]
    StructureTensor(StructureTensorSettings),
    #[serde(rename = "$hessian")]
    Hessian(HessianSettings),
    #[serde(rename = "$weightedDeviation")]
    WeightedDeviation(WeightedDeviationSettings),
    #[serde(rename = "$imageCache")]
    ImageCache(ImageCacheSettings),
    #[serde(rename = "$threshold")]
    Threshold(ThresholdSettings),
    #[serde(rename = "$thresholdAdaptive")]
    ThresholdAdaptive(AdaptiveThresholdSettings),
    #[serde(rename = "$validatorThreshold")]
    ValidatorThreshold(ThresholdValidatorSettings),
    #[serde(rename = "$watershed")]
    Watershed(WatershedSettings),
    #[serde(rename = "$classify")]
    Classify(ClassifySettings),
    #[serde(rename = "$ai")]
    Ai(AiSettings),
    #[serde(rename = "$colocalization")]
    Colocalization(ColocalizationSettings),
    #[serde(rename = "$reclassify")]
    Reclassify(ReclassifySettings),
    #[serde(rename = "$voronoi")]
    Voronoi(VoronoiSettings),
    #[serde(rename = "$storeToDb")]
    StoreToDb(StoreToDbSettings),
}

impl Command {
    /// Settings key of the command family, e.g. `$blur`.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Blur(_) => "$blur",
            Self::EdgeDetection(_) => "$edgeDetection",
            Self::EnhanceContrast(_) => "$enhanceContrast",
            Self::IntensityTransform(_) => "$intensityTransform",
            Self::RollingBall(_) => "$rollingBall",
            Self::RankFilter(_) => "$rankFilter",
            Self::StructureTensor(_) => "$structureTensor",
            Self::Hessian(_) => "$hessian",
            Self::WeightedDeviation(_) => "$weightedDeviation",
            Self::ImageCache(_) => "$imageCache",
            Self::Threshold(_) => "$threshold",
            Self::ThresholdAdaptive(_) => "$thresholdAdaptive",
            Self::ValidatorThreshold(_) => "$validatorThreshold",
            Self::Watershed(_) => "$watershed",
            Self::Classify(_) => "$classify",
            Self::Ai(_) => "$ai",
            Self::Colocalization(_) => "$colocalization",
            Self::Reclassify(_) => "$reclassify",
            Self::Voronoi(_) => "$voronoi",
            Self::StoreToDb(_) => "$storeToDb",
        }
    }

    /// Accepted input kinds and produced output kind.
    #[must_use]
    pub const fn io(&self) -> IoSpec {
        let (accepts, produces) = match self {
            Self::Blur(_) => (IMAGE_OR_BINARY, IoKind::OutputEqualToInput),
            Self::EdgeDetection(s) => (
                IMAGE,
                match s.mode {
                    EdgeDetectionMode::Canny => IoKind::Binary,
                    EdgeDetectionMode::Sobel => IoKind::Image,
                },
            ),
            Self::EnhanceContrast(_)
            | Self::IntensityTransform(_)
            | Self::RollingBall(_)
            | Self::RankFilter(_)
            | Self::StructureTensor(_)
            | Self::Hessian(_)
            | Self::WeightedDeviation(_) => (IMAGE, IoKind::Image),
            Self::ImageCache(s) => match s.mode {
                CacheMode::Store => (IMAGE_OR_BINARY, IoKind::OutputEqualToInput),
                CacheMode::Load => (ANY, IoKind::Image),
            },
            Self::Threshold(_) | Self::ThresholdAdaptive(_) => (IMAGE, IoKind::Binary),
            Self::ValidatorThreshold(_) | Self::Watershed(_) => (BINARY, IoKind::Binary),
            Self::Classify(_) => (BINARY, IoKind::Object),
            Self::Ai(_) => (IMAGE, IoKind::Object),
            Self::Colocalization(_) | Self::Reclassify(_) | Self::StoreToDb(_) => {
                (ANY, IoKind::OutputEqualToInput)
            }
            Self::Voronoi(_) => (ANY, IoKind::Object),
        };
        IoSpec { accepts, produces }
    }

    /// Every class reference in the settings, for validation.
    #[must_use]
    pub fn class_refs(&self) -> Vec<ClassIdIn> {
        match self {
            Self::Classify(s) => vec![s.class_id],
            Self::Ai(s) => s.model_classes.iter().map(|m| m.class_id).collect(),
            Self::Colocalization(s) => {
                let mut refs = s.input_classes.clone();
                refs.push(s.output_class);
                refs
            }
            Self::Reclassify(s) => {
                let mut refs = s.input_classes.clone();
                refs.extend(&s.intersecting_classes);
                refs.push(s.new_class);
                refs
            }
            Self::Voronoi(s) => {
                let mut refs = s.points_classes.clone();
                refs.extend(&s.mask_classes);
                refs.push(s.output_class);
                refs
            }
            _ => Vec::new(),
        }
    }

    /// Settings-level consistency checks that do not need a context.
    ///
    /// # Errors
    ///
    /// Returns a human-readable reason for the first invalid field.
    pub fn check(&self) -> Result<(), String> {
        match self {
            Self::Blur(s) => s.check(),
            Self::EdgeDetection(s) => s.check(),
            Self::Colocalization(s) => s.check(),
            Self::Voronoi(s) => s.check(),
            Self::Threshold(s) => s.check(),
            Self::ThresholdAdaptive(s) => s.check(),
            Self::RankFilter(s) => s.check(),
            Self::Watershed(s) => s.check(),
            Self::Classify(s) => s.check(),
            _ => Ok(()),
        }
    }

    /// Run the command against `ctx`.
    ///
    /// On error the context is left as it was before the call, except for
    /// objects already committed by multi-step object commands.
    ///
    /// # Errors
    ///
    /// Returns the command's [`CommandError`]; the pipeline runner decides
    /// whether it is logged or aborts the tile.
    pub fn execute(&self, ctx: &mut ProcessContext<'_>) -> Result<(), CommandError> {
        match self {
            Self::Blur(s) => s.execute(ctx),
            Self::EdgeDetection(s) => s.execute(ctx),
            Self::EnhanceContrast(s) => s.execute(ctx),
            Self::IntensityTransform(s) => s.execute(ctx),
            Self::RollingBall(s) => s.execute(ctx),
            Self::RankFilter(s) => s.execute(ctx),
            Self::StructureTensor(s) => s.execute(ctx),
            Self::Hessian(s) => s.execute(ctx),
            Self::WeightedDeviation(s) => s.execute(ctx),
            Self::ImageCache(s) => s.execute(ctx),
            Self::Threshold(s) => s.execute(ctx),
            Self::ThresholdAdaptive(s) => s.execute(ctx),
            Self::ValidatorThreshold(s) => s.execute(ctx),
            Self::Watershed(s) => s.execute(ctx),
            Self::Classify(s) => s.execute(ctx),
            Self::Ai(s) => s.execute(ctx),
            Self::Colocalization(s) => s.execute(ctx),
            Self::Reclassify(s) => s.execute(ctx),
            Self::Voronoi(s) => s.execute(ctx),
            Self::StoreToDb(s) => s.execute(ctx),
        }
    }

    pub(crate) fn mismatch_text(&self) -> String {
        self.io().accepted_names()
    }
}

/// Active image as a single-channel integer plane.
fn gray_input(ctx: &ProcessContext<'_>) -> Result<ImagePlane, CommandError> {
    let plane = ctx.active_image();
    if plane.channels() != Channels::Gray {
        return Err(CommandError::InvalidInput(
            "expected a single-channel image".to_owned(),
        ));
    }
    if plane.depth() == Depth::F32 {
        return Err(CommandError::InvalidInput(
            "expected an integer-depth image".to_owned(),
        ));
    }
    Ok(plane.clone())
}

fn float_plane(plane: &ImagePlane) -> FloatPlane {
    FloatPlane::new(plane.width(), plane.height(), plane.to_f32_gray())
}

/// `values` in the depth of `like`, saturating.
fn same_depth_as(like: &ImagePlane, values: FloatPlane) -> Result<ImagePlane, CommandError> {
    like.with_gray_values(values.data)
        .map_err(|e| CommandError::InvalidInput(e.to_string()))
}

/// Float result rescaled into 16 bits: negative values clamp to zero and
/// the observed maximum maps to 65535.
fn rescaled_u16(values: FloatPlane) -> Result<ImagePlane, CommandError> {
    ImagePlane::from_vec(values.width, values.height, Channels::Gray, values.data)
        .map(|p| p.convert_depth(Depth::U16))
        .map_err(|e| CommandError::InvalidInput(e.to_string()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    // --- serde tests ---

    #[test]
    fn commands_are_single_key_objects() {
        let json = r#"[
            {"$blur": {"mode": "MEDIAN", "kernelSize": 3}},
            {"$threshold": {"mode": "MANUAL", "thresholdMin": 100}},
            {"$classify": {"classId": "$"}},
            {"$storeToDb": {}}
        ]"#;
        let steps: Vec<Command> = serde_json::from_str(json).unwrap();
        let names: Vec<_> = steps.iter().map(Command::name).collect();
        assert_eq!(names, vec!["$blur", "$threshold", "$classify", "$storeToDb"]);
        let back = serde_json::to_string(&steps).unwrap();
        let again: Vec<Command> = serde_json::from_str(&back).unwrap();
        assert_eq!(again, steps);
    }

    #[test]
    fn segmentation_helpers_parse_with_defaults() {
        let json = r#"[
            {"$rankFilter": {"mode": "MAX", "radius": 3}},
            {"$thresholdAdaptive": {"method": "BERNSEN"}},
            {"$watershed": {}},
            {"$validatorThreshold": {"mode": "INVALIDATE_IMAGE_PLANE"}}
        ]"#;
        let steps: Vec<Command> = serde_json::from_str(json).unwrap();
        let names: Vec<_> = steps.iter().map(Command::name).collect();
        assert_eq!(
            names,
            vec!["$rankFilter", "$thresholdAdaptive", "$watershed", "$validatorThreshold"]
        );
        assert!(matches!(
            &steps[1],
            Command::ThresholdAdaptive(a)
                if a.method == AdaptiveMethod::Bernsen && (a.radius - 15.0).abs() < f32::EPSILON
        ));
        assert!(matches!(
            &steps[2],
            Command::Watershed(w) if (w.tolerance - 0.5).abs() < f32::EPSILON
        ));
        assert!(matches!(
            &steps[3],
            Command::ValidatorThreshold(v)
                if v.mode == ValidatorMode::InvalidateImagePlane
                    && (v.hist_min_threshold_filter_factor - 1.3).abs() < f64::EPSILON
        ));
    }

    #[test]
    fn unknown_command_is_rejected() {
        assert!(serde_json::from_str::<Command>(r#"{"$teleport": {}}"#).is_err());
    }

    // --- io tests ---

    #[test]
    fn canny_produces_binary_and_sobel_image() {
        let canny: Command =
            serde_json::from_str(r#"{"$edgeDetection": {"mode": "CANNY"}}"#).unwrap();
        let sobel: Command =
            serde_json::from_str(r#"{"$edgeDetection": {"mode": "SOBEL"}}"#).unwrap();
        assert_eq!(canny.io().produces, IoKind::Binary);
        assert_eq!(sobel.io().produces, IoKind::Image);
    }

    #[test]
    fn output_equal_to_input_threads_kind() {
        let store: Command = serde_json::from_str(r#"{"$storeToDb": {}}"#).unwrap();
        assert_eq!(store.io().output_for(IoKind::Object), IoKind::Object);
        assert_eq!(store.io().output_for(IoKind::Binary), IoKind::Binary);
        let load: Command = serde_json::from_str(
            r#"{"$imageCache": {"mode": "LOAD", "memoryId": "M1"}}"#,
        )
        .unwrap();
        assert_eq!(load.io().output_for(IoKind::Object), IoKind::Image);
    }

    #[test]
    fn mask_commands_keep_the_binary_kind() {
        for json in [r#"{"$watershed": {}}"#, r#"{"$validatorThreshold": {}}"#] {
            let cmd: Command = serde_json::from_str(json).unwrap();
            assert!(cmd.io().accepts(IoKind::Binary), "{json}");
            assert!(!cmd.io().accepts(IoKind::Image), "{json}");
            assert_eq!(cmd.io().produces, IoKind::Binary);
        }
        let adaptive: Command = serde_json::from_str(r#"{"$thresholdAdaptive": {}}"#).unwrap();
        assert_eq!(adaptive.io().output_for(IoKind::Image), IoKind::Binary);
        let rank: Command = serde_json::from_str(r#"{"$rankFilter": {}}"#).unwrap();
        assert_eq!(rank.io().output_for(IoKind::Image), IoKind::Image);
    }

    #[test]
    fn negative_radius_fails_the_check() {
        let rank: Command = serde_json::from_str(r#"{"$rankFilter": {"radius": -2}}"#).unwrap();
        assert!(rank.check().is_err());
        let adaptive: Command =
            serde_json::from_str(r#"{"$thresholdAdaptive": {"radius": 0.5}}"#).unwrap();
        assert!(adaptive.check().is_err());
    }

    #[test]
    fn classify_requires_binary() {
        let classify: Command = serde_json::from_str(r#"{"$classify": {}}"#).unwrap();
        assert!(classify.io().accepts(IoKind::Binary));
        assert!(!classify.io().accepts(IoKind::Image));
        assert_eq!(classify.mismatch_text(), "BINARY");
    }
}
