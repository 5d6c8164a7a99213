//! Automation actions and their results.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::descriptor::{
    DetectionMethod, ElementDescriptor, MethodPreference, DEFAULT_CONFIDENCE_THRESHOLD,
};
use crate::detection::Match;
use crate::error::{EngineError, ErrorCategory, Result};
use crate::geometry::{Point, Rect};
use crate::recovery::AppliedStrategy;
use crate::wait::Deadline;

/// Per-attempt timeout when the caller gives none.
pub const DEFAULT_ACTION_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Click,
    DoubleClick,
    RightClick,
    Type,
    Read,
    Wait,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Click => "click",
            ActionType::DoubleClick => "double_click",
            ActionType::RightClick => "right_click",
            ActionType::Type => "type",
            ActionType::Read => "read",
            ActionType::Wait => "wait",
        }
    }

    /// Actions that synthesize input at a location.
    pub fn is_positional(&self) -> bool {
        matches!(
            self,
            ActionType::Click | ActionType::DoubleClick | ActionType::RightClick | ActionType::Type
        )
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_timeout() -> Duration {
    DEFAULT_ACTION_TIMEOUT
}

fn default_threshold() -> f32 {
    DEFAULT_CONFIDENCE_THRESHOLD
}

/// One requested UI action.
///
/// Targets may be combined: a text, a template and literal coordinates are
/// tried in method-priority order until one resolves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomationAction {
    pub action_type: ActionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_template: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinates: Option<Point>,
    /// Frame-local search area.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<Rect>,
    #[serde(default)]
    pub click_offset: Point,
    /// Text to type; supports `\n`, `\t` and `\\` escapes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_text: Option<String>,
    /// Bound on each attempt's detection, and the total for `wait`.
    #[serde(default = "default_timeout", with = "crate::config::duration_secs")]
    pub timeout: Duration,
    #[serde(default = "default_threshold")]
    pub confidence_threshold: f32,
    /// Overrides the configured maximum number of attempts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method_order: Option<Vec<DetectionMethod>>,
    /// Fail unless the frame changes after the input.
    #[serde(default)]
    pub verify_change: bool,
    /// Seconds from submission until the action gives up, retries and
    /// recovery included. Resolved into `deadline` on submission.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_secs: Option<f64>,
    /// Absolute cut-off for every wait this action performs.
    #[serde(skip)]
    pub deadline: Option<Instant>,
}

impl AutomationAction {
    pub fn new(action_type: ActionType) -> Self {
        Self {
            action_type,
            target_text: None,
            target_template: None,
            coordinates: None,
            region: None,
            click_offset: Point::default(),
            input_text: None,
            timeout: DEFAULT_ACTION_TIMEOUT,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            retry_count: None,
            method_order: None,
            verify_change: false,
            deadline_secs: None,
            deadline: None,
        }
    }

    #[must_use]
    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.target_text = Some(text.into());
        self
    }

    #[must_use]
    pub fn template(mut self, name: impl Into<String>) -> Self {
        self.target_template = Some(name.into());
        self
    }

    #[must_use]
    pub fn at(mut self, point: Point) -> Self {
        self.coordinates = Some(point);
        self
    }

    #[must_use]
    pub fn within(mut self, region: Rect) -> Self {
        self.region = Some(region);
        self
    }

    #[must_use]
    pub fn offset(mut self, offset: Point) -> Self {
        self.click_offset = offset;
        self
    }

    #[must_use]
    pub fn input(mut self, text: impl Into<String>) -> Self {
        self.input_text = Some(text.into());
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn threshold(mut self, threshold: f32) -> Self {
        self.confidence_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    #[must_use]
    pub fn retries(mut self, attempts: u32) -> Self {
        self.retry_count = Some(attempts);
        self
    }

    #[must_use]
    pub fn methods(mut self, order: Vec<DetectionMethod>) -> Self {
        self.method_order = Some(order);
        self
    }

    #[must_use]
    pub fn verify_change(mut self) -> Self {
        self.verify_change = true;
        self
    }

    #[must_use]
    pub fn deadline(mut self, at: Instant) -> Self {
        self.deadline = Some(at);
        self
    }

    /// Give up `after` the action is submitted.
    #[must_use]
    pub fn deadline_after(mut self, after: Duration) -> Self {
        self.deadline_secs = Some(after.as_secs_f64());
        self
    }

    /// Resolve `deadline_secs` against the current time. An absolute
    /// deadline set earlier wins, so anchoring twice is a no-op.
    #[must_use]
    pub fn anchored(mut self) -> Self {
        if self.deadline.is_none() {
            self.deadline = self
                .deadline_secs
                .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
                .and_then(|after| Instant::now().checked_add(after));
        }
        self
    }

    /// Human-readable name of what this action targets.
    pub fn target_name(&self) -> String {
        if let Some(text) = &self.target_text {
            text.clone()
        } else if let Some(template) = &self.target_template {
            template.clone()
        } else if let Some(point) = self.coordinates {
            point.to_string()
        } else {
            self.action_type.to_string()
        }
    }

    /// True when some method can resolve a location.
    pub fn has_target(&self) -> bool {
        self.has_detection_target() || self.coordinates.is_some()
    }

    /// True when text or template detection can run.
    pub fn has_detection_target(&self) -> bool {
        self.target_text.is_some() || self.target_template.is_some()
    }

    /// Whether this action declares a target for `method`.
    pub fn targets(&self, method: DetectionMethod) -> bool {
        match method {
            DetectionMethod::Text => self.target_text.is_some(),
            DetectionMethod::Template => self.target_template.is_some(),
            DetectionMethod::Coordinates => self.coordinates.is_some(),
        }
    }

    /// Descriptor covering every detection target of this action.
    pub fn descriptor(&self) -> ElementDescriptor {
        let mut descriptor = ElementDescriptor::new(self.target_name())
            .threshold(self.confidence_threshold)
            .click_offset(self.click_offset);
        if let Some(text) = &self.target_text {
            descriptor = descriptor.text(text.clone());
        }
        if let Some(template) = &self.target_template {
            descriptor = descriptor.template(template.clone());
        }
        if let Some(region) = self.region {
            descriptor = descriptor.region(region);
        }
        descriptor
    }

    /// Descriptor restricted to one detection method, if the action has a
    /// target for it.
    pub fn descriptor_for(&self, method: DetectionMethod) -> Option<ElementDescriptor> {
        let preference = match method {
            DetectionMethod::Text => MethodPreference::Text,
            DetectionMethod::Template => MethodPreference::Template,
            DetectionMethod::Coordinates => return None,
        };
        if !self.targets(method) {
            return None;
        }
        Some(self.descriptor().prefer(preference))
    }

    /// Location cache key for this action.
    pub fn cache_key(&self) -> String {
        self.descriptor().cache_key(self.action_type.as_str())
    }

    pub fn wait_deadline(&self) -> Deadline {
        self.deadline.map_or_else(Deadline::none, Deadline::at)
    }

    /// Reject actions that cannot run no matter how often they are retried.
    pub fn validate(&self) -> Result<()> {
        if self.action_type.is_positional() && !self.has_target() {
            return Err(EngineError::Config(format!(
                "{} action needs a target text, template or coordinates",
                self.action_type
            )));
        }
        if self.action_type == ActionType::Type && self.input_text.is_none() {
            return Err(EngineError::Config(
                "type action needs input_text".to_string(),
            ));
        }
        if self.timeout.is_zero() {
            return Err(EngineError::Config("action timeout must be positive".into()));
        }
        if self.retry_count == Some(0) {
            return Err(EngineError::Config("retry_count must be at least 1".into()));
        }
        if let Some(secs) = self.deadline_secs {
            if Duration::try_from_secs_f64(secs).is_err() {
                return Err(EngineError::Config(format!(
                    "deadline_secs must be a non-negative number of seconds, got {}",
                    secs
                )));
            }
        }
        Ok(())
    }
}

/// Outcome of an action, after any retries and recovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomationResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method_used: Option<DetectionMethod>,
    #[serde(with = "crate::config::duration_secs")]
    pub execution_time: Duration,
    pub confidence: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Match>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_category: Option<ErrorCategory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot_path: Option<PathBuf>,
    pub attempts: u32,
    #[serde(default)]
    pub recovery: Vec<AppliedStrategy>,
    #[serde(default)]
    pub requires_manual_intervention: bool,
}

impl AutomationResult {
    pub fn succeeded(method: DetectionMethod, confidence: f32, location: Option<Match>) -> Self {
        Self {
            success: true,
            method_used: Some(method),
            execution_time: Duration::ZERO,
            confidence,
            location,
            text: None,
            error_message: None,
            error_category: None,
            screenshot_path: None,
            attempts: 1,
            recovery: Vec::new(),
            requires_manual_intervention: false,
        }
    }

    pub fn failed(error: &EngineError) -> Self {
        Self {
            success: false,
            method_used: None,
            execution_time: Duration::ZERO,
            confidence: 0.0,
            location: None,
            text: None,
            error_message: Some(error.to_string()),
            error_category: Some(error.category()),
            screenshot_path: None,
            attempts: 1,
            recovery: Vec::new(),
            requires_manual_intervention: error.category().requires_manual_intervention(),
        }
    }

    /// Category of a failed result; `unknown` if none was recorded.
    pub fn category(&self) -> ErrorCategory {
        self.error_category.unwrap_or(ErrorCategory::Unknown)
    }
}
