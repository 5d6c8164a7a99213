//! Failure artifacts: screenshots, error reports, manual-intervention
//! reports.
//!
//! Everything lands in the configured log directory. Writers return the
//! path they wrote; callers treat a failed write as a warning, never as the
//! action's error.

use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::action::{AutomationAction, AutomationResult};
use crate::descriptor::DetectionMethod;
use crate::error::{ErrorCategory, Result};
use crate::frame::Frame;
use crate::recovery::AppliedStrategy;
use crate::telemetry::TelemetrySnapshot;

const MAX_TARGET_LEN: usize = 40;

/// Host and engine state at the time of a failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemSnapshot {
    pub os: String,
    pub arch: String,
    pub process_id: u32,
    pub uptime_secs: f64,
    pub cache_size: usize,
    pub total_operations: u64,
    pub successful_operations: u64,
    pub total_errors: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorContext {
    pub timestamp: DateTime<Utc>,
    pub error_category: ErrorCategory,
    pub error_message: String,
    pub method_used: Option<DetectionMethod>,
    pub target_element: String,
    pub confidence_score: f32,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemSnapshot>,
}

impl ErrorContext {
    /// Context for a failed action result, stamped now.
    pub fn from_result(action: &AutomationAction, result: &AutomationResult) -> Self {
        Self {
            timestamp: Utc::now(),
            error_category: result.category(),
            error_message: result.error_message.clone().unwrap_or_default(),
            method_used: result.method_used,
            target_element: action.target_name(),
            confidence_score: result.confidence,
            retry_count: result.attempts,
            screenshot_path: result.screenshot_path.clone(),
            system: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualInterventionReport {
    pub context: ErrorContext,
    pub suggestion: String,
    pub recovery_trail: Vec<AppliedStrategy>,
}

impl ManualInterventionReport {
    pub fn new(context: ErrorContext, recovery_trail: Vec<AppliedStrategy>) -> Self {
        Self {
            suggestion: context.error_category.suggestion().to_string(),
            context,
            recovery_trail,
        }
    }
}

/// Writes diagnostic artifacts under one directory.
#[derive(Debug, Clone)]
pub struct Diagnostics {
    log_directory: PathBuf,
    started: Instant,
}

impl Diagnostics {
    pub fn new(log_directory: impl Into<PathBuf>) -> Self {
        Self {
            log_directory: log_directory.into(),
            started: Instant::now(),
        }
    }

    pub fn log_directory(&self) -> &Path {
        &self.log_directory
    }

    /// Same start time, different directory.
    #[must_use]
    pub fn with_directory(&self, log_directory: impl Into<PathBuf>) -> Self {
        Self {
            log_directory: log_directory.into(),
            started: self.started,
        }
    }

    pub fn system_snapshot(
        &self,
        cache_size: usize,
        telemetry: &TelemetrySnapshot,
    ) -> SystemSnapshot {
        SystemSnapshot {
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            process_id: std::process::id(),
            uptime_secs: self.started.elapsed().as_secs_f64(),
            cache_size,
            total_operations: telemetry.performance.total_operations,
            successful_operations: telemetry.performance.successful_operations,
            total_errors: telemetry.total_errors(),
        }
    }

    /// `screenshot_<timestamp>_<target>.png`
    pub fn save_screenshot(&self, frame: &Frame, target: &str) -> Result<PathBuf> {
        let path = self.log_directory.join(format!(
            "screenshot_{}_{}.png",
            file_timestamp(Utc::now()),
            sanitize(target)
        ));
        self.ensure_dir()?;
        frame.image().save(&path)?;
        info!(path = %path.display(), "saved failure screenshot");
        Ok(path)
    }

    /// `error_<timestamp>.json`
    pub fn write_error_report(&self, context: &ErrorContext) -> Result<PathBuf> {
        let path = self
            .log_directory
            .join(format!("error_{}.json", file_timestamp(context.timestamp)));
        self.write_json(&path, context)?;
        info!(path = %path.display(), category = %context.error_category, "wrote error report");
        Ok(path)
    }

    /// `manual_intervention_<timestamp>.json`
    pub fn write_manual_report(&self, report: &ManualInterventionReport) -> Result<PathBuf> {
        let path = self.log_directory.join(format!(
            "manual_intervention_{}.json",
            file_timestamp(report.context.timestamp)
        ));
        self.write_json(&path, report)?;
        info!(
            path = %path.display(),
            element = %report.context.target_element,
            "manual intervention required"
        );
        Ok(path)
    }

    fn ensure_dir(&self) -> Result<()> {
        std::fs::create_dir_all(&self.log_directory)?;
        Ok(())
    }

    fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        self.ensure_dir()?;
        let json = serde_json::to_string_pretty(value)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

fn file_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y%m%d_%H%M%S_%3f").to_string()
}

/// Make a target name safe for a file name.
fn sanitize(target: &str) -> String {
    let cleaned: String = target
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .take(MAX_TARGET_LEN)
        .collect();
    if cleaned.is_empty() {
        "unnamed".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::{RecoveryStrategy, StrategyOutcome};
    use image::RgbaImage;

    fn context(at: DateTime<Utc>) -> ErrorContext {
        ErrorContext {
            timestamp: at,
            error_category: ErrorCategory::ElementNotFound,
            error_message: "element 'OK' not found".into(),
            method_used: Some(DetectionMethod::Text),
            target_element: "OK".into(),
            confidence_score: 0.0,
            retry_count: 3,
            screenshot_path: None,
            system: None,
        }
    }

    #[test]
    fn sanitize_keeps_file_names_flat() {
        assert_eq!(sanitize("Save As..."), "Save_As___");
        assert_eq!(sanitize("../../etc"), "______etc");
        assert_eq!(sanitize(""), "unnamed");
        assert_eq!(sanitize(&"x".repeat(100)).len(), MAX_TARGET_LEN);
    }

    #[test]
    fn screenshot_file_name() {
        let dir = tempfile::tempdir().unwrap();
        let diagnostics = Diagnostics::new(dir.path().join("logs"));
        let frame = Frame::from_image(RgbaImage::new(4, 4));

        let path = diagnostics.save_screenshot(&frame, "Save As").unwrap();
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("screenshot_"));
        assert!(name.ends_with("_Save_As.png"));
        assert!(path.exists());
    }

    #[test]
    fn error_report_is_json_with_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let diagnostics = Diagnostics::new(dir.path());
        let mut ctx = context(Utc::now());
        ctx.system = Some(diagnostics.system_snapshot(2, &TelemetrySnapshot::default()));

        let path = diagnostics.write_error_report(&ctx).unwrap();
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("error_"));
        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["error_category"], "element_not_found");
        assert_eq!(json["retry_count"], 3);
        assert_eq!(json["system"]["cache_size"], 2);
        assert_eq!(json["system"]["os"], std::env::consts::OS);
    }

    #[test]
    fn manual_report_carries_trail_and_suggestion() {
        let dir = tempfile::tempdir().unwrap();
        let diagnostics = Diagnostics::new(dir.path());
        let trail = vec![AppliedStrategy {
            category: ErrorCategory::ElementNotFound,
            strategy: RecoveryStrategy::RelaxThreshold,
            outcome: StrategyOutcome::Succeeded,
            note: "threshold 0.70 -> 0.60".into(),
        }];
        let report = ManualInterventionReport::new(context(Utc::now()), trail);
        let path = diagnostics.write_manual_report(&report).unwrap();

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["recovery_trail"][0]["strategy"], "relax_threshold");
        assert_eq!(
            json["suggestion"],
            ErrorCategory::ElementNotFound.suggestion()
        );
    }
}
