//! Error taxonomy with operator-facing suggestions.
//!
//! Every failure the engine can produce maps to exactly one
//! [`ErrorCategory`]. The category drives recovery-strategy selection, so
//! errors are categorized by where they came from whenever the raising code
//! knows the cause. [`categorize_message`] is the fallback for opaque
//! failures (foreign error strings, backend stderr, and so on).

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::geometry::Point;

/// Closed set of failure categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    ElementNotFound,
    LowConfidence,
    CaptureFailure,
    Timeout,
    CoordinateError,
    TextDetectorError,
    TemplateDetectorError,
    SystemError,
    ConfigurationError,
    Unknown,
}

impl ErrorCategory {
    /// Every category, in declaration order.
    pub const ALL: [ErrorCategory; 10] = [
        ErrorCategory::ElementNotFound,
        ErrorCategory::LowConfidence,
        ErrorCategory::CaptureFailure,
        ErrorCategory::Timeout,
        ErrorCategory::CoordinateError,
        ErrorCategory::TextDetectorError,
        ErrorCategory::TemplateDetectorError,
        ErrorCategory::SystemError,
        ErrorCategory::ConfigurationError,
        ErrorCategory::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::ElementNotFound => "element_not_found",
            ErrorCategory::LowConfidence => "low_confidence",
            ErrorCategory::CaptureFailure => "capture_failure",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::CoordinateError => "coordinate_error",
            ErrorCategory::TextDetectorError => "text_detector_error",
            ErrorCategory::TemplateDetectorError => "template_detector_error",
            ErrorCategory::SystemError => "system_error",
            ErrorCategory::ConfigurationError => "configuration_error",
            ErrorCategory::Unknown => "unknown",
        }
    }

    /// What an operator should look at when this category shows up.
    pub fn suggestion(&self) -> &'static str {
        match self {
            ErrorCategory::ElementNotFound => {
                "Check that the target window is visible and on the expected screen; \
                 the text or template may have changed"
            }
            ErrorCategory::LowConfidence => {
                "Lower the confidence threshold or refresh the template image"
            }
            ErrorCategory::CaptureFailure => {
                "Make sure the target window is not minimized and the session is unlocked"
            }
            ErrorCategory::Timeout => {
                "The application responded slowly; increase the action timeout"
            }
            ErrorCategory::CoordinateError => {
                "The computed position falls outside the captured window; check click offsets and regions"
            }
            ErrorCategory::TextDetectorError => {
                "Check that the OCR program is installed and the language data is available"
            }
            ErrorCategory::TemplateDetectorError => {
                "Check the template directory and that the template image exists"
            }
            ErrorCategory::SystemError => {
                "A system resource failed; check disk space, permissions and the display session"
            }
            ErrorCategory::ConfigurationError => {
                "Fix the configuration file; this cannot be recovered automatically"
            }
            ErrorCategory::Unknown => {
                "Inspect the error report and screenshot in the log directory"
            }
        }
    }

    /// Categories that can never be recovered without an operator.
    pub fn requires_manual_intervention(&self) -> bool {
        matches!(self, ErrorCategory::ConfigurationError)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by the engine and its collaborators.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("element '{target}' not found")]
    ElementNotFound { target: String },

    #[error(
        "element '{target}' matched with confidence {best:.2}, below threshold {threshold:.2}"
    )]
    LowConfidence {
        target: String,
        best: f32,
        threshold: f32,
    },

    #[error("frame capture failed: {0}")]
    Capture(String),

    #[error("{operation} timed out after {elapsed_ms}ms")]
    Timeout { operation: String, elapsed_ms: u64 },

    /// Blocking work abandoned because its caller gave up waiting.
    #[error("{0} was cancelled")]
    Cancelled(String),

    #[error("coordinate {point} is invalid: {reason}")]
    Coordinate { point: Point, reason: String },

    #[error("text detector failed: {0}")]
    TextDetector(String),

    #[error("template detector failed: {0}")]
    TemplateDetector(String),

    #[error("input synthesis failed: {0}")]
    Input(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A detection that failed and was already categorized where it ran.
    #[error("{message}")]
    Detection {
        category: ErrorCategory,
        message: String,
    },

    /// A failure whose origin is unknown; categorized by message.
    #[error("{0}")]
    Other(String),
}

impl EngineError {
    pub fn not_found(target: impl Into<String>) -> Self {
        EngineError::ElementNotFound {
            target: target.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, elapsed: std::time::Duration) -> Self {
        EngineError::Timeout {
            operation: operation.into(),
            elapsed_ms: elapsed.as_millis().min(u128::from(u64::MAX)) as u64,
        }
    }

    /// Category of this error, decided by its origin.
    pub fn category(&self) -> ErrorCategory {
        match self {
            EngineError::ElementNotFound { .. } => ErrorCategory::ElementNotFound,
            EngineError::LowConfidence { .. } => ErrorCategory::LowConfidence,
            EngineError::Capture(_) => ErrorCategory::CaptureFailure,
            EngineError::Timeout { .. } | EngineError::Cancelled(_) => ErrorCategory::Timeout,
            EngineError::Coordinate { .. } => ErrorCategory::CoordinateError,
            EngineError::TextDetector(_) => ErrorCategory::TextDetectorError,
            EngineError::TemplateDetector(_) => ErrorCategory::TemplateDetectorError,
            EngineError::Input(_) | EngineError::Io(_) => ErrorCategory::SystemError,
            EngineError::Config(_) => ErrorCategory::ConfigurationError,
            EngineError::Image(_) | EngineError::Json(_) => ErrorCategory::SystemError,
            EngineError::Detection { category, .. } => *category,
            EngineError::Other(message) => categorize_message(message),
        }
    }

    pub fn suggestion(&self) -> &'static str {
        self.category().suggestion()
    }
}

/// Best-effort categorization of an opaque error message.
///
/// Rules are checked in order; the first keyword hit wins. This is a
/// heuristic and only used when the origin of an error is unknown.
pub fn categorize_message(message: &str) -> ErrorCategory {
    const RULES: &[(&[&str], ErrorCategory)] = &[
        (&["config", "setting", "missing key"], ErrorCategory::ConfigurationError),
        (&["timeout", "timed out", "deadline"], ErrorCategory::Timeout),
        (&["not found", "no match", "could not find"], ErrorCategory::ElementNotFound),
        (&["confidence", "threshold"], ErrorCategory::LowConfidence),
        (&["screenshot", "capture", "grab"], ErrorCategory::CaptureFailure),
        (
            &["coordinate", "out of bounds", "offscreen", "off-screen"],
            ErrorCategory::CoordinateError,
        ),
        (&["ocr", "tesseract", "text detector"], ErrorCategory::TextDetectorError),
        (&["template"], ErrorCategory::TemplateDetectorError),
        (&["permission", "memory", "disk", "i/o", "os error"], ErrorCategory::SystemError),
    ];

    let lower = message.to_lowercase();
    RULES
        .iter()
        .find(|(keywords, _)| keywords.iter().any(|k| lower.contains(k)))
        .map_or(ErrorCategory::Unknown, |(_, category)| *category)
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;

/// A serializable error with operator-facing context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    pub code: ErrorCategory,
    pub message: String,
    pub suggestion: Option<String>,
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(suggestion) = &self.suggestion {
            write!(f, " (hint: {})", suggestion)?;
        }
        Ok(())
    }
}

impl std::error::Error for ApiError {}

impl ApiError {
    pub fn new(code: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            suggestion: Some(code.suggestion().to_string()),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCategory::ConfigurationError,
            message: message.into(),
            suggestion: Some("Check the request syntax against the script format".into()),
        }
    }
}

impl From<&EngineError> for ApiError {
    fn from(err: &EngineError) -> Self {
        ApiError::new(err.category(), err.to_string())
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        ApiError::from(&err)
    }
}
