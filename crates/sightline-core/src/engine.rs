//! One automation session.
//!
//! [`Engine`] owns the detectors, the location cache, telemetry and the
//! recovery-wrapped executor. Detections and actions take the session lock,
//! so they run one at a time in submission order. Cache and telemetry
//! queries don't; monitoring code can read them while an action runs.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::action::{AutomationAction, AutomationResult, DEFAULT_ACTION_TIMEOUT};
use crate::config::Config;
use crate::descriptor::ElementDescriptor;
use crate::detection::{DetectionResult, Detector};
use crate::diagnostics::Diagnostics;
use crate::element::{ElementDetector, DETECT_ACTION};
use crate::error::Result;
use crate::executor::{run_blocking, ActionExecutor, ExecutorSettings};
use crate::frame::{Frame, FrameSource};
use crate::geometry::Rect;
use crate::input::InputDriver;
use crate::recovery::RecoveryEngine;
use crate::telemetry::{TelemetrySnapshot, TelemetryTracker};
use crate::template::library::TemplateInfo;
use crate::template::TemplateDetector;
use crate::text::TextDetector;
use crate::wait::Deadline;

/// Collaborators an engine is assembled from.
pub struct EngineParts {
    pub text: Arc<TextDetector>,
    pub templates: Arc<TemplateDetector>,
    pub frames: Arc<dyn FrameSource>,
    pub input: Arc<dyn InputDriver>,
}

struct Session {
    config: Config,
    recovery: RecoveryEngine,
}

pub struct Engine {
    session: Mutex<Session>,
    elements: Arc<ElementDetector>,
    templates: Arc<TemplateDetector>,
    frames: Arc<dyn FrameSource>,
    telemetry: Arc<TelemetryTracker>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("frames", &self.frames.describe())
            .field("elements", &self.elements)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Tesseract OCR and the on-disk template library, as configured.
    pub fn new(
        config: Config,
        frames: Arc<dyn FrameSource>,
        input: Arc<dyn InputDriver>,
    ) -> Result<Self> {
        config.validate()?;
        let text = Arc::new(TextDetector::new(&config.ocr, &config.debugging));
        let templates = Arc::new(TemplateDetector::load(&config.template)?);
        Ok(Self::with_parts(
            config,
            EngineParts {
                text,
                templates,
                frames,
                input,
            },
        ))
    }

    pub fn with_parts(config: Config, parts: EngineParts) -> Self {
        let telemetry = Arc::new(TelemetryTracker::new());
        let detectors = vec![
            parts.text.clone() as Arc<dyn Detector>,
            parts.templates.clone() as Arc<dyn Detector>,
        ];
        let elements = Arc::new(ElementDetector::new(
            detectors,
            config.automation.cache_ttl,
            telemetry.clone(),
        ));

        info!(
            frames = %parts.frames.describe(),
            input = parts.input.name(),
            templates = parts.templates.len(),
            "engine ready"
        );

        let executor = Arc::new(ActionExecutor::new(
            elements.clone(),
            parts.text,
            parts.frames.clone(),
            parts.input,
            telemetry.clone(),
            Diagnostics::new(&config.recovery.log_directory),
            ExecutorSettings::from(&config.automation),
        ));
        let recovery = RecoveryEngine::new(executor, config.recovery.clone());

        Self {
            session: Mutex::new(Session { config, recovery }),
            elements,
            templates: parts.templates,
            frames: parts.frames,
            telemetry,
        }
    }

    /// Locate an element in a fresh frame. Serves and fills the cache.
    pub async fn detect(&self, descriptor: ElementDescriptor) -> DetectionResult {
        let _session = self.session.lock().await;
        let start = Instant::now();
        let name = descriptor.name().to_string();

        let frame = match self.capture().await {
            Ok(frame) => frame,
            Err(e) => {
                self.telemetry.record_error(e.category());
                return DetectionResult::failure(
                    e.category(),
                    e.to_string(),
                    Vec::new(),
                    start.elapsed(),
                );
            }
        };

        let elements = self.elements.clone();
        let detected = run_blocking(
            "element detection",
            DEFAULT_ACTION_TIMEOUT,
            Deadline::none(),
            move |cancel| elements.detect_for(&descriptor, &frame, DETECT_ACTION, &cancel),
        )
        .await;

        let result = match detected {
            Ok(result) => result,
            Err(e) => {
                DetectionResult::failure(e.category(), e.to_string(), Vec::new(), start.elapsed())
            }
        };
        match result.error_category {
            Some(category) => {
                self.telemetry.record_error(category);
                warn!(element = %name, %category, "detection failed");
            }
            None => info!(
                element = %name,
                matches = result.matches.len(),
                cached = result.from_cache,
                "detected"
            ),
        }
        result
    }

    /// Run an action with retries and recovery.
    ///
    /// A relative `deadline_secs` starts counting here, before the action
    /// queues for the session.
    pub async fn execute_with_retry(&self, action: AutomationAction) -> AutomationResult {
        let action = action.anchored();
        let session = self.session.lock().await;
        session.recovery.execute_with_retry(action).await
    }

    /// Apply a new configuration.
    ///
    /// Automation and recovery settings, the cache TTL and the template
    /// library take effect immediately. OCR settings and the template
    /// directory are fixed for the engine's lifetime.
    pub async fn reload_config(&self, config: Config) -> Result<()> {
        config.validate()?;
        let mut session = self.session.lock().await;

        if config.ocr != session.config.ocr
            || config.template.template_directory != session.config.template.template_directory
        {
            warn!("OCR and template directory changes take effect after a restart");
        }

        self.templates.reload()?;
        self.elements.set_cache_ttl(config.automation.cache_ttl);

        let current = session.recovery.executor().clone();
        let diagnostics = current
            .diagnostics()
            .with_directory(&config.recovery.log_directory);
        let settings = ExecutorSettings::from(&config.automation);
        let executor = Arc::new(current.reconfigured(settings, diagnostics));
        session.recovery = RecoveryEngine::new(executor, config.recovery.clone());
        session.config = config;

        info!(templates = self.templates.len(), "configuration applied");
        Ok(())
    }

    /// The configuration in effect.
    pub async fn config(&self) -> Config {
        self.session.lock().await.config.clone()
    }

    pub fn clear_cache(&self) {
        self.elements.clear_cache();
        info!("location cache cleared");
    }

    pub fn cache_len(&self) -> usize {
        self.elements.cache_len()
    }

    pub fn telemetry(&self) -> TelemetrySnapshot {
        self.telemetry.snapshot()
    }

    pub fn reset_telemetry(&self) {
        self.telemetry.reset();
        info!("telemetry reset");
    }

    pub fn templates(&self) -> Vec<TemplateInfo> {
        self.templates.list()
    }

    /// Capture a frame and store `region` (frame-local) as a template.
    pub async fn capture_template(
        &self,
        name: &str,
        region: Rect,
        description: &str,
    ) -> Result<TemplateInfo> {
        let _session = self.session.lock().await;
        let frame = self.capture().await?;
        let info = self
            .templates
            .capture_template(name, &frame, &region, description)?;
        info!(
            template = %info.name,
            width = info.width,
            height = info.height,
            "template captured"
        );
        Ok(info)
    }

    async fn capture(&self) -> Result<Frame> {
        let frames = self.frames.clone();
        run_blocking("frame capture", DEFAULT_ACTION_TIMEOUT, Deadline::none(), move |_| {
            frames.capture()
        })
        .await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionType;
    use crate::descriptor::DetectionMethod;
    use crate::error::ErrorCategory;
    use crate::frame::StaticFrameSource;
    use crate::input::DryRunDriver;
    use crate::text::backend::testing::{word, ScriptedOcr};
    use image::{Rgba, RgbaImage};
    use std::time::Duration;

    struct Fixture {
        engine: Engine,
        input: Arc<DryRunDriver>,
        dir: tempfile::TempDir,
    }

    fn config(dir: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.template.template_directory = dir.join("templates");
        config.recovery.log_directory = dir.join("logs");
        config.automation.action_delay = Duration::ZERO;
        config.automation.retry_delay = Duration::ZERO;
        config.automation.screenshot_on_failure = false;
        config.automation.adaptive_method_order = false;
        config
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let words = vec![word("OK", 93.0, Rect::new(100, 100, 30, 20), 1)];
        let text = Arc::new(TextDetector::with_backends(
            &config.ocr,
            &config.debugging,
            Box::new(ScriptedOcr::new(words)),
            None,
        ));
        let templates = Arc::new(TemplateDetector::load(&config.template).unwrap());
        let input = Arc::new(DryRunDriver::new());
        let image = RgbaImage::from_fn(400, 300, |x, y| {
            let v = ((x * 7 + y * 3) % 256) as u8;
            Rgba([v, v, v, 255])
        });
        let engine = Engine::with_parts(
            config,
            EngineParts {
                text,
                templates,
                frames: Arc::new(StaticFrameSource::new(Frame::from_image(image))),
                input: input.clone(),
            },
        );
        Fixture { engine, input, dir }
    }

    #[tokio::test]
    async fn detect_fills_and_serves_the_cache() {
        let f = fixture();
        let descriptor = ElementDescriptor::new("ok").text("OK");

        let first = f.engine.detect(descriptor.clone()).await;
        assert!(first.success);
        assert_eq!(first.matches[0].method, DetectionMethod::Text);
        assert!(!first.from_cache);
        assert_eq!(f.engine.cache_len(), 1);

        let second = f.engine.detect(descriptor).await;
        assert!(second.from_cache);

        f.engine.clear_cache();
        assert_eq!(f.engine.cache_len(), 0);
    }

    #[tokio::test]
    async fn click_goes_through_the_input_driver() {
        let f = fixture();
        let action = AutomationAction::new(ActionType::Click).text("OK");

        let result = f.engine.execute_with_retry(action).await;
        assert!(result.success, "{:?}", result.error_message);
        assert_eq!(result.method_used, Some(DetectionMethod::Text));
        assert_eq!(f.input.events().len(), 2);

        let stats = f.engine.telemetry();
        assert_eq!(stats.performance.total_operations, 1);
        f.engine.reset_telemetry();
        assert_eq!(f.engine.telemetry(), TelemetrySnapshot::default());
    }

    #[tokio::test(start_paused = true)]
    async fn unrecoverable_action_writes_reports() {
        let f = fixture();
        let action = AutomationAction::new(ActionType::Click).text("Missing");

        let result = f.engine.execute_with_retry(action).await;
        assert!(!result.success);
        assert!(!result.recovery.is_empty());
        assert!(f.input.events().is_empty());

        let reports = std::fs::read_dir(f.dir.path().join("logs"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("error_"))
            .count();
        assert_eq!(reports, 1);
    }

    #[tokio::test]
    async fn missing_element_is_categorized() {
        let f = fixture();
        let result = f.engine.detect(ElementDescriptor::new("gone").text("Gone")).await;
        assert!(!result.success);
        assert_eq!(result.error_category, Some(ErrorCategory::ElementNotFound));
        assert_eq!(f.engine.telemetry().errors[&ErrorCategory::ElementNotFound], 1);
    }

    #[tokio::test]
    async fn reload_applies_valid_config_only() {
        let f = fixture();
        let mut next = f.engine.config().await;
        next.recovery.enabled = false;
        next.automation.max_retries = 1;
        f.engine.reload_config(next).await.unwrap();
        assert!(!f.engine.config().await.recovery.enabled);

        let mut bad = f.engine.config().await;
        bad.ocr.confidence_threshold = 2.0;
        let err = f.engine.reload_config(bad).await.unwrap_err();
        assert_eq!(err.category(), ErrorCategory::ConfigurationError);
        assert_eq!(f.engine.config().await.automation.max_retries, 1);
    }

    #[tokio::test]
    async fn captured_template_is_listed_and_detectable() {
        let f = fixture();
        assert!(f.engine.templates().is_empty());

        let info = f
            .engine
            .capture_template("gradient", Rect::new(40, 30, 24, 16), "test patch")
            .await
            .unwrap();
        assert_eq!((info.width, info.height), (24, 16));
        assert_eq!(f.engine.templates().len(), 1);

        let result = f
            .engine
            .detect(ElementDescriptor::new("patch").template("gradient"))
            .await;
        assert!(result.success);
        assert_eq!(result.matches[0].method, DetectionMethod::Template);
    }
}
