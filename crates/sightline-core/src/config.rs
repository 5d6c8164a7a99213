//! Engine configuration.
//!
//! Loaded from a JSON file with five sections. Every field has a default,
//! so `{}` is a valid configuration. Durations are written as seconds
//! (floats). Unknown keys are rejected so typos surface as
//! `configuration_error` instead of silently using defaults.
//!
//! | Section | Controls |
//! |---------|----------|
//! | `ocr` | OCR backend, language, page segmentation, preprocessing |
//! | `template` | template directory, scales, thresholds, NMS |
//! | `automation` | method order, retries, delays, cache |
//! | `recovery` | recovery engine, threshold floor, log directory |
//! | `debugging` | debug image output |

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::{debug, info};

use crate::descriptor::DetectionMethod;
use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub ocr: OcrConfig,
    pub template: TemplateConfig,
    pub automation: AutomationConfig,
    pub recovery: RecoveryConfig,
    pub debugging: DebugConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OcrConfig {
    pub language: String,
    /// Recognized words below this confidence are dropped.
    pub confidence_threshold: f32,
    pub page_segmentation_mode: u8,
    pub fallback_page_segmentation_mode: u8,
    pub enable_fallback: bool,
    /// Master switch for [`PreprocessSteps`].
    pub preprocess: bool,
    pub preprocessing: PreprocessSteps,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            language: "eng".to_string(),
            confidence_threshold: 0.5,
            page_segmentation_mode: 6,
            fallback_page_segmentation_mode: 11,
            enable_fallback: true,
            preprocess: true,
            preprocessing: PreprocessSteps::default(),
        }
    }
}

/// Individual preprocessing steps, applied in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PreprocessSteps {
    pub contrast: bool,
    pub sharpen: bool,
    pub threshold: bool,
    /// Closing of the thresholded image; ignored when `threshold` is off.
    pub morphology: bool,
}

impl Default for PreprocessSteps {
    fn default() -> Self {
        Self {
            contrast: true,
            sharpen: true,
            threshold: true,
            morphology: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TemplateConfig {
    /// Threshold for templates without a sidecar.
    pub confidence_threshold: f32,
    pub template_directory: PathBuf,
    pub default_scale_factors: Vec<f32>,
    /// IoU above which overlapping matches are suppressed.
    pub nms_threshold: f64,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.8,
            template_directory: PathBuf::from("templates"),
            default_scale_factors: vec![0.8, 0.9, 1.0, 1.1, 1.2],
            nms_threshold: 0.3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AutomationConfig {
    pub method_priority: Vec<DetectionMethod>,
    pub max_retries: u32,
    #[serde(with = "duration_secs")]
    pub retry_delay: Duration,
    pub exponential_backoff: bool,
    /// Pause before every synthesized input.
    #[serde(with = "duration_secs")]
    pub action_delay: Duration,
    #[serde(with = "duration_secs")]
    pub cache_ttl: Duration,
    pub screenshot_on_failure: bool,
    pub verify_cached_locations: bool,
    pub adaptive_method_order: bool,
    /// How long to wait for the UI to react before comparing frames.
    #[serde(with = "duration_secs")]
    pub change_settle_delay: Duration,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            method_priority: vec![
                DetectionMethod::Text,
                DetectionMethod::Template,
                DetectionMethod::Coordinates,
            ],
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            exponential_backoff: true,
            action_delay: Duration::from_millis(500),
            cache_ttl: Duration::from_secs(300),
            screenshot_on_failure: true,
            verify_cached_locations: true,
            adaptive_method_order: true,
            change_settle_delay: Duration::from_millis(300),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RecoveryConfig {
    pub enabled: bool,
    /// `relax_threshold` never goes below this.
    pub min_confidence_threshold: f32,
    /// `extend_timeout` never goes above this.
    #[serde(with = "duration_secs")]
    pub max_timeout: Duration,
    pub log_directory: PathBuf,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_confidence_threshold: 0.3,
            max_timeout: Duration::from_secs(60),
            log_directory: PathBuf::from("logs"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DebugConfig {
    pub save_debug_images: bool,
    pub debug_image_path: PathBuf,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            save_debug_images: false,
            debug_image_path: PathBuf::from("debug"),
        }
    }
}

impl Config {
    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Config =
            serde_json::from_str(json).map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: Config = serde_json::from_str(&text)
            .map_err(|e| EngineError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        debug!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Check value ranges and cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        fn unit(name: &str, value: f32) -> Result<()> {
            if (0.0..=1.0).contains(&value) {
                Ok(())
            } else {
                Err(EngineError::Config(format!(
                    "{} must be between 0 and 1, got {}",
                    name, value
                )))
            }
        }

        unit("ocr.confidence_threshold", self.ocr.confidence_threshold)?;
        unit("template.confidence_threshold", self.template.confidence_threshold)?;
        unit(
            "recovery.min_confidence_threshold",
            self.recovery.min_confidence_threshold,
        )?;

        for (name, psm) in [
            ("ocr.page_segmentation_mode", self.ocr.page_segmentation_mode),
            (
                "ocr.fallback_page_segmentation_mode",
                self.ocr.fallback_page_segmentation_mode,
            ),
        ] {
            if psm > 13 {
                return Err(EngineError::Config(format!(
                    "{} must be 0-13, got {}",
                    name, psm
                )));
            }
        }
        if self.ocr.language.trim().is_empty() {
            return Err(EngineError::Config("ocr.language must not be empty".into()));
        }

        if self.template.default_scale_factors.is_empty() {
            return Err(EngineError::Config(
                "template.default_scale_factors must not be empty".into(),
            ));
        }
        if let Some(bad) = self
            .template
            .default_scale_factors
            .iter()
            .find(|s| !s.is_finite() || **s <= 0.0)
        {
            return Err(EngineError::Config(format!(
                "template.default_scale_factors contains invalid scale {}",
                bad
            )));
        }
        if !(self.template.nms_threshold > 0.0 && self.template.nms_threshold <= 1.0) {
            return Err(EngineError::Config(format!(
                "template.nms_threshold must be in (0, 1], got {}",
                self.template.nms_threshold
            )));
        }

        if self.automation.max_retries == 0 {
            return Err(EngineError::Config(
                "automation.max_retries must be at least 1".into(),
            ));
        }
        if self.automation.method_priority.is_empty() {
            return Err(EngineError::Config(
                "automation.method_priority must not be empty".into(),
            ));
        }
        let mut seen = HashSet::new();
        for method in &self.automation.method_priority {
            if !seen.insert(method) {
                return Err(EngineError::Config(format!(
                    "automation.method_priority lists '{}' twice",
                    method
                )));
            }
        }

        Ok(())
    }
}

/// A configuration bound to the file it came from.
///
/// [`ConfigHandle::reload_if_changed`] re-reads the file when its
/// modification time moved.
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    path: Option<PathBuf>,
    config: Config,
    modified: Option<SystemTime>,
}

impl ConfigHandle {
    /// Defaults with no backing file.
    pub fn defaults() -> Self {
        Self {
            path: None,
            config: Config::default(),
            modified: None,
        }
    }

    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let config = Config::load(&path)?;
        let modified = modified_time(&path);
        info!(path = %path.display(), "configuration loaded");
        Ok(Self {
            path: Some(path),
            config,
            modified,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Reload when the file's modification time changed.
    ///
    /// Returns the new configuration if a reload happened. An invalid file
    /// is an error and leaves the current configuration in place.
    pub fn reload_if_changed(&mut self) -> Result<Option<Config>> {
        let Some(path) = self.path.clone() else {
            return Ok(None);
        };
        let current = modified_time(&path);
        if current.is_none() || current == self.modified {
            return Ok(None);
        }

        let config = Config::load(&path)?;
        self.config = config.clone();
        self.modified = current;
        info!(path = %path.display(), "configuration reloaded");
        Ok(Some(config))
    }
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Serde adapter: `Duration` as float seconds.
pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(|_| {
            serde::de::Error::custom(format!("invalid duration {} (seconds)", secs))
        })
    }
}

/// Serde adapter: `Option<Duration>` as float seconds.
pub(crate) mod option_duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&d.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let secs = Option::<f64>::deserialize(deserializer)?;
        secs.map(|s| {
            Duration::try_from_secs_f64(s)
                .map_err(|_| serde::de::Error::custom(format!("invalid duration {} (seconds)", s)))
        })
        .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;

    #[test]
    fn empty_document_gives_defaults() {
        let config = Config::from_json_str("{}").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.automation.max_retries, 3);
        assert_eq!(config.automation.cache_ttl, Duration::from_secs(300));
        assert_eq!(config.ocr.page_segmentation_mode, 6);
        assert_eq!(config.template.default_scale_factors.len(), 5);
    }

    #[test]
    fn durations_are_float_seconds() {
        let config =
            Config::from_json_str(r#"{"automation": {"retry_delay": 0.25, "action_delay": 0}}"#)
                .unwrap();
        assert_eq!(config.automation.retry_delay, Duration::from_millis(250));
        assert_eq!(config.automation.action_delay, Duration::ZERO);

        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["automation"]["retry_delay"], 0.25);
    }

    #[test]
    fn negative_duration_is_configuration_error() {
        let err = Config::from_json_str(r#"{"automation": {"retry_delay": -1}}"#).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::ConfigurationError);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = Config::from_json_str(r#"{"ocr": {"langauge": "deu"}}"#).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::ConfigurationError);
        assert!(err.to_string().contains("langauge"));
    }

    #[test]
    fn validation_catches_bad_values() {
        let cases = [
            r#"{"ocr": {"confidence_threshold": 1.5}}"#,
            r#"{"template": {"default_scale_factors": []}}"#,
            r#"{"template": {"default_scale_factors": [1.0, 0.0]}}"#,
            r#"{"template": {"nms_threshold": 0}}"#,
            r#"{"automation": {"max_retries": 0}}"#,
            r#"{"automation": {"method_priority": ["text", "text"]}}"#,
            r#"{"ocr": {"page_segmentation_mode": 42}}"#,
        ];
        for json in cases {
            let err = Config::from_json_str(json).unwrap_err();
            assert_eq!(
                err.category(),
                ErrorCategory::ConfigurationError,
                "{} should be rejected",
                json
            );
        }
    }

    #[test]
    fn method_priority_uses_snake_case_names() {
        let config = Config::from_json_str(
            r#"{"automation": {"method_priority": ["template", "coordinates"]}}"#,
        )
        .unwrap();
        assert_eq!(
            config.automation.method_priority,
            vec![DetectionMethod::Template, DetectionMethod::Coordinates]
        );
    }

    #[test]
    fn handle_reloads_only_when_modified() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"automation": {"max_retries": 2}}"#).unwrap();

        let mut handle = ConfigHandle::load(&path).unwrap();
        assert_eq!(handle.config().automation.max_retries, 2);
        assert!(handle.reload_if_changed().unwrap().is_none());

        std::fs::write(&path, r#"{"automation": {"max_retries": 5}}"#).unwrap();
        let later = SystemTime::now() + Duration::from_secs(10);
        std::fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(later)
            .unwrap();

        let reloaded = handle.reload_if_changed().unwrap().unwrap();
        assert_eq!(reloaded.automation.max_retries, 5);
        assert_eq!(handle.config().automation.max_retries, 5);
    }

    #[test]
    fn invalid_reload_keeps_previous_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{}").unwrap();
        let mut handle = ConfigHandle::load(&path).unwrap();

        std::fs::write(&path, r#"{"automation": {"max_retries": 0}}"#).unwrap();
        std::fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(SystemTime::now() + Duration::from_secs(10))
            .unwrap();

        assert!(handle.reload_if_changed().is_err());
        assert_eq!(handle.config().automation.max_retries, 3);
    }

    #[test]
    fn defaults_handle_never_reloads() {
        let mut handle = ConfigHandle::defaults();
        assert!(handle.path().is_none());
        assert!(handle.reload_if_changed().unwrap().is_none());
    }
}
