//! Detection results and the detector capability trait.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::descriptor::{DetectionMethod, ElementDescriptor};
use crate::error::{ErrorCategory, Result};
use crate::frame::Frame;
use crate::geometry::{Point, Rect, CLICKABLE_PADDING};

/// A located candidate element, in screen coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Match {
    pub method: DetectionMethod,
    /// Match confidence (0.0 - 1.0).
    pub confidence: f32,
    pub bounding_box: Rect,
    pub center: Point,
    /// Bounding box padded on every side; the area that accepts a click.
    pub clickable_region: Rect,
    /// Template scale the match was found at.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_factor: Option<f32>,
    /// Recognized text or template name.
    pub label: String,
    /// Set when hybrid consensus boosted this match.
    #[serde(default)]
    pub corroborated: bool,
}

impl Match {
    pub fn new(
        method: DetectionMethod,
        confidence: f32,
        bounding_box: Rect,
        label: impl Into<String>,
    ) -> Self {
        Self {
            method,
            confidence: confidence.clamp(0.0, 1.0),
            bounding_box,
            center: bounding_box.center(),
            clickable_region: bounding_box.padded(CLICKABLE_PADDING),
            scale_factor: None,
            label: label.into(),
            corroborated: false,
        }
    }

    #[must_use]
    pub fn with_scale(mut self, scale: f32) -> Self {
        self.scale_factor = Some(scale);
        self
    }

    /// Copy with confidence multiplied by `factor` (capped at 1.0) and the
    /// corroborated flag set.
    #[must_use]
    pub fn corroborate(&self, factor: f32) -> Self {
        Self {
            confidence: (self.confidence * factor).min(1.0),
            corroborated: true,
            ..self.clone()
        }
    }
}

/// Sort matches by descending confidence. Stable, so ties keep input order.
pub fn rank(matches: &mut [Match]) {
    matches.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
}

/// Outcome of one detection call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub success: bool,
    /// Highest confidence first.
    pub matches: Vec<Match>,
    pub methods_tried: Vec<DetectionMethod>,
    #[serde(with = "crate::config::duration_secs")]
    pub total_time: Duration,
    pub from_cache: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_category: Option<ErrorCategory>,
}

impl DetectionResult {
    pub fn found(
        matches: Vec<Match>,
        methods_tried: Vec<DetectionMethod>,
        total_time: Duration,
    ) -> Self {
        Self {
            success: !matches.is_empty(),
            matches,
            methods_tried,
            total_time,
            from_cache: false,
            error_message: None,
            error_category: None,
        }
    }

    pub fn cached(hit: Match, total_time: Duration) -> Self {
        Self {
            success: true,
            methods_tried: vec![hit.method],
            matches: vec![hit],
            total_time,
            from_cache: true,
            error_message: None,
            error_category: None,
        }
    }

    pub fn failure(
        category: ErrorCategory,
        message: impl Into<String>,
        methods_tried: Vec<DetectionMethod>,
        total_time: Duration,
    ) -> Self {
        Self {
            success: false,
            matches: Vec::new(),
            methods_tried,
            total_time,
            from_cache: false,
            error_message: Some(message.into()),
            error_category: Some(category),
        }
    }

    pub fn best(&self) -> Option<&Match> {
        self.matches.first()
    }
}

/// A detection method over a frame.
///
/// Detectors return every candidate they consider plausible; the element
/// detector applies the descriptor's threshold, ranking and caching.
///
/// Detection runs on a blocking thread. Implementations poll `cancel`
/// between units of work and bail out once it fires, so a timed-out action
/// leaves nothing running behind it.
pub trait Detector: Send + Sync {
    fn method(&self) -> DetectionMethod;

    fn detect(
        &self,
        frame: &Frame,
        descriptor: &ElementDescriptor,
        cancel: &CancellationToken,
    ) -> Result<Vec<Match>>;
}
