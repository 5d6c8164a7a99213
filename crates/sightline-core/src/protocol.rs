//! Request/response types for JSON-lines automation scripts.
//!
//! A script is one [`Request`] per line; the runner answers each with one
//! [`Response`] line.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::action::{AutomationAction, AutomationResult};
use crate::descriptor::ElementDescriptor;
use crate::detection::DetectionResult;
use crate::error::{ApiError, ErrorCategory};
use crate::telemetry::TelemetrySnapshot;

/// One script step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    pub command: Command,
}

/// Commands a script can issue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Command {
    /// Locate an element in a fresh frame.
    Detect { descriptor: ElementDescriptor },
    /// Run an action with retry and recovery.
    Execute { step: AutomationAction },
    /// Telemetry snapshot.
    Stats,
    /// Drop every cached element location.
    ClearCache,
    /// Zero all telemetry.
    ResetStats,
    /// Re-read the configuration, from `path` if given.
    ReloadConfig {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<ResponseData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

impl Response {
    pub fn success(id: impl Into<String>, data: ResponseData) -> Self {
        Self {
            id: id.into(),
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: impl Into<String>, error: ApiError) -> Self {
        Self {
            id: id.into(),
            success: false,
            data: None,
            error: Some(error),
        }
    }

    /// A detection outcome; a failed detection keeps its result as data.
    pub fn detection(id: impl Into<String>, result: DetectionResult) -> Self {
        let error = (!result.success).then(|| {
            ApiError::new(
                result.error_category.unwrap_or(ErrorCategory::Unknown),
                result.error_message.clone().unwrap_or_default(),
            )
        });
        Self {
            id: id.into(),
            success: result.success,
            data: Some(ResponseData::Detection(result)),
            error,
        }
    }

    /// An action outcome; a failed action keeps its result as data.
    pub fn action(id: impl Into<String>, result: AutomationResult) -> Self {
        let error = (!result.success).then(|| {
            ApiError::new(
                result.category(),
                result.error_message.clone().unwrap_or_default(),
            )
        });
        Self {
            id: id.into(),
            success: result.success,
            data: Some(ResponseData::Action(result)),
            error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseData {
    Detection(DetectionResult),
    Action(AutomationResult),
    Stats(TelemetrySnapshot),
    /// Generic success message.
    Ok { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionType;
    use crate::descriptor::DetectionMethod;
    use crate::error::EngineError;
    use std::time::Duration;

    #[test]
    fn execute_request_parses_with_defaults() {
        let line = r#"{"id":"3","command":{"action":"execute","step":{"action_type":"type","target_text":"Name","input_text":"Ada\n","timeout":2.5}}}"#;
        let request: Request = serde_json::from_str(line).unwrap();
        assert_eq!(request.id, "3");
        match request.command {
            Command::Execute { step: action } => {
                assert_eq!(action.action_type, ActionType::Type);
                assert_eq!(action.target_text.as_deref(), Some("Name"));
                assert_eq!(action.timeout, Duration::from_millis(2500));
                assert!((action.confidence_threshold - 0.7).abs() < f32::EPSILON);
            }
            other => panic!("expected execute, got {:?}", other),
        }
    }

    #[test]
    fn unit_commands_are_bare_tags() {
        let request: Request =
            serde_json::from_str(r#"{"id":"s","command":{"action":"clear_cache"}}"#).unwrap();
        assert_eq!(request.command, Command::ClearCache);

        let reload: Request =
            serde_json::from_str(r#"{"id":"r","command":{"action":"reload_config"}}"#).unwrap();
        assert_eq!(reload.command, Command::ReloadConfig { path: None });
    }

    #[test]
    fn failed_action_keeps_data_and_error() {
        let result = AutomationResult::failed(&EngineError::not_found("Save"));
        let json = serde_json::to_value(Response::action("7", result)).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["data"]["type"], "action");
        assert_eq!(json["error"]["code"], "element_not_found");
        assert!(json["error"]["suggestion"].is_string());
    }

    #[test]
    fn empty_detection_is_a_failure() {
        let result =
            DetectionResult::found(Vec::new(), vec![DetectionMethod::Text], Duration::ZERO);
        let response = Response::detection("d", result);
        // No matches means no success
        assert!(!response.success);
        assert_eq!(
            response.error.map(|e| e.code),
            Some(ErrorCategory::Unknown)
        );

        let ok = Response::success("o", ResponseData::Ok { message: "done".into() });
        let json = serde_json::to_value(ok).unwrap();
        assert!(json.get("error").is_none());
        assert_eq!(json["data"]["type"], "ok");
    }
}
