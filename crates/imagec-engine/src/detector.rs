//! Seam for opaque object detectors (AI model runtimes).
//!
//! The engine never runs inference itself. A [`DetectorProvider`] hands out
//! a [`Detector`] per model path, and the `$ai` command maps the returned
//! [`Detection`]s into ROIs.

use std::collections::BTreeMap;
use std::sync::Arc;

use image::GrayImage;

use crate::image::ImagePlane;
use crate::types::{Point, Rect};

/// One object reported by a detector, in tile-local coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub bbox: Rect,
    /// Per-pixel mask probability (0..=255) with the size of `bbox`.
    pub mask: GrayImage,
    /// Outline as reported by the model. The engine re-traces contours from
    /// the thresholded mask, so this is informational.
    pub contour: Vec<Point>,
    /// Class index in the model's own label space.
    pub class_id: u32,
    pub probability: f32,
}

/// Detector failure on one tile.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct DetectorError(pub String);

/// An inference backend bound to one model.
pub trait Detector: Send + Sync {
    /// Run the model on a single-channel plane.
    ///
    /// # Errors
    ///
    /// Returns [`DetectorError`] when inference fails on this input.
    fn detect(&self, image: &ImagePlane) -> Result<Vec<Detection>, DetectorError>;
}

/// Resolves model paths to detectors.
pub trait DetectorProvider: Send + Sync {
    /// Detector for `model`, `None` when the model cannot be loaded.
    fn detector(&self, model: &str) -> Option<Arc<dyn Detector>>;
}

/// Provider backed by a fixed map of model names.
#[derive(Default, Clone)]
pub struct DetectorRegistry {
    models: BTreeMap<String, Arc<dyn Detector>>,
}

impl DetectorRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `detector` under `model`, replacing any previous entry.
    #[must_use]
    pub fn with(mut self, model: impl Into<String>, detector: Arc<dyn Detector>) -> Self {
        self.models.insert(model.into(), detector);
        self
    }
}

impl std::fmt::Debug for DetectorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetectorRegistry")
            .field("models", &self.models.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl DetectorProvider for DetectorRegistry {
    fn detector(&self, model: &str) -> Option<Arc<dyn Detector>> {
        self.models.get(model).cloned()
    }
}
