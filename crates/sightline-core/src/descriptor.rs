//! Element descriptors: what to look for and how.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::geometry::{Point, Rect};

/// Default minimum confidence for a match to count.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.7;

/// Prefix marking a text pattern as a regular expression.
pub const REGEX_PREFIX: &str = "re:";

/// How a location was (or should be) found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    Text,
    Template,
    /// Literal coordinates; only meaningful for actions.
    Coordinates,
}

impl DetectionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionMethod::Text => "text",
            DetectionMethod::Template => "template",
            DetectionMethod::Coordinates => "coordinates",
        }
    }
}

impl fmt::Display for DetectionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Explicit detection strategy for a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MethodPreference {
    Text,
    Template,
    /// Both detectors, with spatial consensus boosting.
    Hybrid,
}

/// Describes a UI element to locate.
///
/// Built with [`ElementDescriptor::new`] and the chained setters; there are
/// no setters on a finished descriptor.
///
/// ```ignore
/// let ok = ElementDescriptor::new("ok_button")
///     .text("OK")
///     .template("ok_button")
///     .prefer(MethodPreference::Hybrid);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementDescriptor {
    name: String,
    #[serde(default)]
    text_patterns: Vec<String>,
    #[serde(default)]
    template_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    region: Option<Rect>,
    #[serde(default = "default_threshold")]
    confidence_threshold: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    method_preference: Option<MethodPreference>,
    #[serde(default)]
    click_offset: Point,
    #[serde(default)]
    case_sensitive: bool,
}

fn default_threshold() -> f32 {
    DEFAULT_CONFIDENCE_THRESHOLD
}

impl ElementDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            text_patterns: Vec::new(),
            template_names: Vec::new(),
            region: None,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            method_preference: None,
            click_offset: Point::default(),
            case_sensitive: false,
        }
    }

    #[must_use]
    pub fn text(mut self, pattern: impl Into<String>) -> Self {
        self.text_patterns.push(pattern.into());
        self
    }

    #[must_use]
    pub fn template(mut self, name: impl Into<String>) -> Self {
        self.template_names.push(name.into());
        self
    }

    #[must_use]
    pub fn region(mut self, region: Rect) -> Self {
        self.region = Some(region);
        self
    }

    /// Minimum confidence, clamped to `[0, 1]`.
    #[must_use]
    pub fn threshold(mut self, threshold: f32) -> Self {
        self.confidence_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    #[must_use]
    pub fn prefer(mut self, preference: MethodPreference) -> Self {
        self.method_preference = Some(preference);
        self
    }

    #[must_use]
    pub fn click_offset(mut self, offset: Point) -> Self {
        self.click_offset = offset;
        self
    }

    #[must_use]
    pub fn case_sensitive(mut self, yes: bool) -> Self {
        self.case_sensitive = yes;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn text_patterns(&self) -> &[String] {
        &self.text_patterns
    }

    pub fn template_names(&self) -> &[String] {
        &self.template_names
    }

    pub fn search_region(&self) -> Option<Rect> {
        self.region
    }

    pub fn confidence_threshold(&self) -> f32 {
        self.confidence_threshold
    }

    pub fn method_preference(&self) -> Option<MethodPreference> {
        self.method_preference
    }

    pub fn offset(&self) -> Point {
        self.click_offset
    }

    pub fn is_case_sensitive(&self) -> bool {
        self.case_sensitive
    }

    /// Detection methods to run, in order.
    ///
    /// An explicit preference wins. Otherwise the methods follow from the
    /// declared targets. Empty when the descriptor names nothing to find.
    pub fn methods(&self) -> Vec<DetectionMethod> {
        match self.method_preference {
            Some(MethodPreference::Text) => vec![DetectionMethod::Text],
            Some(MethodPreference::Template) => vec![DetectionMethod::Template],
            Some(MethodPreference::Hybrid) => {
                vec![DetectionMethod::Text, DetectionMethod::Template]
            }
            None => {
                let mut methods = Vec::with_capacity(2);
                if !self.text_patterns.is_empty() {
                    methods.push(DetectionMethod::Text);
                }
                if !self.template_names.is_empty() {
                    methods.push(DetectionMethod::Template);
                }
                methods
            }
        }
    }

    /// True when both detectors run and their results are fused.
    pub fn is_hybrid(&self) -> bool {
        self.methods().len() == 2
    }

    /// Deterministic cache key for this descriptor and action kind.
    pub fn cache_key(&self, action_kind: &str) -> String {
        let region = self
            .region
            .map(|r| format!("{},{},{},{}", r.x, r.y, r.width, r.height))
            .unwrap_or_default();
        format!(
            "text={};tpl={};region={};action={}",
            self.text_patterns.join("|"),
            self.template_names.join("|"),
            region,
            action_kind
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn methods_follow_targets() {
        let text_only = ElementDescriptor::new("ok").text("OK");
        assert_eq!(text_only.methods(), vec![DetectionMethod::Text]);

        let both = ElementDescriptor::new("ok").text("OK").template("ok_button");
        assert_eq!(
            both.methods(),
            vec![DetectionMethod::Text, DetectionMethod::Template]
        );
        assert!(both.is_hybrid());

        let nothing = ElementDescriptor::new("empty");
        assert!(nothing.methods().is_empty());
    }

    #[test]
    fn explicit_preference_wins() {
        let d = ElementDescriptor::new("ok")
            .text("OK")
            .template("ok_button")
            .prefer(MethodPreference::Template);
        assert_eq!(d.methods(), vec![DetectionMethod::Template]);

        let hybrid = ElementDescriptor::new("ok")
            .text("OK")
            .prefer(MethodPreference::Hybrid);
        assert!(hybrid.is_hybrid());
    }

    #[test]
    fn threshold_is_clamped() {
        assert_eq!(ElementDescriptor::new("x").threshold(1.7).confidence_threshold(), 1.0);
        assert_eq!(ElementDescriptor::new("x").threshold(-0.2).confidence_threshold(), 0.0);
    }

    #[test]
    fn cache_key_is_deterministic_and_action_scoped() {
        let d = ElementDescriptor::new("save")
            .text("Save")
            .text("Save As")
            .template("save_icon")
            .region(Rect::new(0, 0, 200, 100));
        assert_eq!(
            d.cache_key("click"),
            "text=Save|Save As;tpl=save_icon;region=0,0,200,100;action=click"
        );
        assert_ne!(d.cache_key("click"), d.cache_key("type"));
        // The display name does not participate
        let renamed = ElementDescriptor::new("other")
            .text("Save")
            .text("Save As")
            .template("save_icon")
            .region(Rect::new(0, 0, 200, 100));
        assert_eq!(d.cache_key("detect"), renamed.cache_key("detect"));
    }

    #[test]
    fn deserialize_applies_defaults() {
        let d: ElementDescriptor =
            serde_json::from_str(r#"{"name":"ok","text_patterns":["OK"]}"#).unwrap();
        assert_eq!(d.confidence_threshold(), DEFAULT_CONFIDENCE_THRESHOLD);
        assert_eq!(d.offset(), Point::default());
        assert!(!d.is_case_sensitive());
        assert!(d.template_names().is_empty());
    }
}
