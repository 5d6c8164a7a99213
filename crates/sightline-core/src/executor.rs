//! Action execution.
//!
//! One attempt of an [`AutomationAction`]: capture a frame, resolve the
//! target through the method priority order (or a verified cache entry),
//! synthesize the input and optionally confirm the UI reacted. Capture,
//! detection and OCR are blocking and run on the blocking pool under the
//! action's timeout; every sleep honours the action's deadline.
//!
//! [`ActionExecutor::execute_with_retry`] is the plain retry loop. The
//! recovery-driven loop lives in [`crate::recovery::RecoveryEngine`].

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::action::{ActionType, AutomationAction, AutomationResult};
use crate::config::AutomationConfig;
use crate::descriptor::{DetectionMethod, ElementDescriptor};
use crate::detection::{DetectionResult, Match};
use crate::diagnostics::{Diagnostics, ErrorContext};
use crate::element::{local_region, ElementDetector};
use crate::error::{EngineError, ErrorCategory, Result};
use crate::frame::{Frame, FrameSource};
use crate::geometry::{Point, Rect};
use crate::input::{parse_typed_text, InputDriver, InputEvent, MouseButton};
use crate::telemetry::TelemetryTracker;
use crate::text::TextDetector;
use crate::wait::{backoff_delay, Deadline};

/// Poll interval while waiting for an element to appear.
pub const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// How long a timed-out worker gets to notice its cancellation.
pub const CANCEL_GRACE: Duration = Duration::from_secs(5);

/// The slice of configuration the executor acts on.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorSettings {
    pub method_priority: Vec<DetectionMethod>,
    pub adaptive_method_order: bool,
    pub verify_cached_locations: bool,
    pub action_delay: Duration,
    pub change_settle_delay: Duration,
    pub screenshot_on_failure: bool,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub exponential_backoff: bool,
}

impl From<&AutomationConfig> for ExecutorSettings {
    fn from(config: &AutomationConfig) -> Self {
        Self {
            method_priority: config.method_priority.clone(),
            adaptive_method_order: config.adaptive_method_order,
            verify_cached_locations: config.verify_cached_locations,
            action_delay: config.action_delay,
            change_settle_delay: config.change_settle_delay,
            screenshot_on_failure: config.screenshot_on_failure,
            max_retries: config.max_retries,
            retry_delay: config.retry_delay,
            exponential_backoff: config.exponential_backoff,
        }
    }
}

/// A resolved target.
#[derive(Debug, Clone)]
struct Located {
    method: DetectionMethod,
    location: Option<Match>,
    point: Point,
    confidence: f32,
}

impl Located {
    fn into_result(self) -> AutomationResult {
        AutomationResult::succeeded(self.method, self.confidence, self.location)
    }
}

pub struct ActionExecutor {
    elements: Arc<ElementDetector>,
    text: Arc<TextDetector>,
    frames: Arc<dyn FrameSource>,
    input: Arc<dyn InputDriver>,
    telemetry: Arc<TelemetryTracker>,
    diagnostics: Diagnostics,
    settings: ExecutorSettings,
    last_bounds: Mutex<Option<Rect>>,
}

impl std::fmt::Debug for ActionExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionExecutor")
            .field("frames", &self.frames.describe())
            .field("input", &self.input.name())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl ActionExecutor {
    pub fn new(
        elements: Arc<ElementDetector>,
        text: Arc<TextDetector>,
        frames: Arc<dyn FrameSource>,
        input: Arc<dyn InputDriver>,
        telemetry: Arc<TelemetryTracker>,
        diagnostics: Diagnostics,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            elements,
            text,
            frames,
            input,
            telemetry,
            diagnostics,
            settings,
            last_bounds: Mutex::new(None),
        }
    }

    /// Same collaborators, new settings and log directory.
    pub fn reconfigured(&self, settings: ExecutorSettings, diagnostics: Diagnostics) -> Self {
        Self {
            elements: self.elements.clone(),
            text: self.text.clone(),
            frames: self.frames.clone(),
            input: self.input.clone(),
            telemetry: self.telemetry.clone(),
            diagnostics,
            settings,
            last_bounds: Mutex::new(self.last_frame_bounds()),
        }
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    pub fn telemetry(&self) -> &Arc<TelemetryTracker> {
        &self.telemetry
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub fn elements(&self) -> &Arc<ElementDetector> {
        &self.elements
    }

    pub fn frames(&self) -> &Arc<dyn FrameSource> {
        &self.frames
    }

    /// Attempts allowed for `action`.
    pub fn max_attempts(&self, action: &AutomationAction) -> u32 {
        action.retry_count.unwrap_or(self.settings.max_retries).max(1)
    }

    /// Method order for `action`: its own override, else the configured
    /// priority, reordered by telemetry when adaptive ordering is on.
    pub fn method_order(&self, action: &AutomationAction) -> Vec<DetectionMethod> {
        if let Some(order) = &action.method_order {
            return order.clone();
        }
        if self.settings.adaptive_method_order {
            self.telemetry
                .snapshot()
                .adaptive_method_order(&self.settings.method_priority)
        } else {
            self.settings.method_priority.clone()
        }
    }

    /// Screen bounds of the most recent capture.
    pub fn last_frame_bounds(&self) -> Option<Rect> {
        *self.last_bounds.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop the cached location for `action`.
    pub fn forget(&self, action: &AutomationAction) -> bool {
        self.elements.invalidate(&action.cache_key())
    }

    /// One attempt. Never panics; failures come back as a failed result.
    pub async fn execute(&self, action: &AutomationAction) -> AutomationResult {
        let start = Instant::now();
        let outcome = match action.validate() {
            Ok(()) => self.run(action).await,
            Err(e) => Err(e),
        };
        let mut result = match outcome {
            Ok(result) => result,
            Err(e) => {
                debug!(
                    element = %action.target_name(),
                    category = %e.category(),
                    error = %e,
                    "attempt failed"
                );
                self.telemetry.record_error(e.category());
                AutomationResult::failed(&e)
            }
        };
        result.execution_time = start.elapsed();
        result
    }

    /// Up to the retry budget of attempts with backoff between them. No
    /// recovery; see [`crate::recovery::RecoveryEngine`] for that.
    pub async fn execute_with_retry(&self, action: &AutomationAction) -> AutomationResult {
        let start = Instant::now();
        let anchored = action.clone().anchored();
        let action = &anchored;
        let max_attempts = self.max_attempts(action);
        let deadline = action.wait_deadline();

        let mut attempt = 1;
        let mut result = loop {
            let mut result = self.execute(action).await;
            result.attempts = attempt;
            if result.success || attempt >= max_attempts {
                break result;
            }
            let delay = backoff_delay(
                self.settings.retry_delay,
                attempt,
                self.settings.exponential_backoff,
            );
            if let Err(e) = deadline.sleep(delay, "retry backoff").await {
                let mut expired = AutomationResult::failed(&e);
                expired.attempts = attempt;
                break expired;
            }
            attempt += 1;
        };

        result.execution_time = start.elapsed();
        self.telemetry
            .record_operation(result.success, result.execution_time);
        if !result.success {
            self.report_failure(action, &mut result).await;
        }
        result
    }

    /// Persist diagnostics for a final failure: an optional screenshot and
    /// the JSON error report. Returns the report's context.
    pub async fn report_failure(
        &self,
        action: &AutomationAction,
        result: &mut AutomationResult,
    ) -> ErrorContext {
        warn!(
            element = %action.target_name(),
            category = %result.category(),
            attempts = result.attempts,
            error = result.error_message.as_deref().unwrap_or(""),
            "action failed"
        );

        if self.settings.screenshot_on_failure {
            match self.capture(action, Deadline::none()).await {
                Ok(frame) => {
                    match self.diagnostics.save_screenshot(&frame, &action.target_name()) {
                        Ok(path) => result.screenshot_path = Some(path),
                        Err(e) => warn!(error = %e, "failed to save failure screenshot"),
                    }
                }
                Err(e) => warn!(error = %e, "no screenshot: capture failed"),
            }
        }

        let mut context = ErrorContext::from_result(action, result);
        context.system = Some(
            self.diagnostics
                .system_snapshot(self.elements.cache_len(), &self.telemetry.snapshot()),
        );
        if let Err(e) = self.diagnostics.write_error_report(&context) {
            warn!(error = %e, "failed to write error report");
        }
        context
    }

    async fn run(&self, action: &AutomationAction) -> Result<AutomationResult> {
        let deadline = action.wait_deadline();
        match action.action_type {
            ActionType::Wait => self.wait(action, deadline).await,
            ActionType::Read => self.read(action, deadline).await,
            ActionType::Click
            | ActionType::DoubleClick
            | ActionType::RightClick
            | ActionType::Type => self.act(action, deadline).await,
        }
    }

    async fn act(
        &self,
        action: &AutomationAction,
        deadline: Deadline,
    ) -> Result<AutomationResult> {
        let key = action.cache_key();
        let frame = self.capture(action, deadline).await?;

        let located = match self.cached_location(action, &key, &frame, deadline).await? {
            Some(hit) => hit,
            None => self.locate(action, &frame, deadline, true).await?,
        };

        self.perform(action, located.point, &frame, deadline).await?;

        if let Some(location) = &located.location {
            self.elements.remember(&key, location.clone());
        }
        info!(
            action = %action.action_type,
            element = %action.target_name(),
            method = %located.method,
            point = %located.point,
            "action performed"
        );
        Ok(located.into_result())
    }

    /// A live cache entry that still shows the element.
    async fn cached_location(
        &self,
        action: &AutomationAction,
        key: &str,
        frame: &Arc<Frame>,
        deadline: Deadline,
    ) -> Result<Option<Located>> {
        if !action.has_detection_target() {
            return Ok(None);
        }
        let Some(hit) = self.elements.cached(key) else {
            return Ok(None);
        };

        if self.settings.verify_cached_locations {
            let elements = self.elements.clone();
            let descriptor = action.descriptor();
            let snapshot = frame.clone();
            let cached = hit.clone();
            let still_there =
                run_blocking("cache verification", action.timeout, deadline, move |cancel| {
                    elements.reverify(&descriptor, &snapshot, &cached, &cancel)
                })
                .await?;
            if !still_there {
                debug!(%key, "cached location is stale");
                self.elements.invalidate(key);
                return Ok(None);
            }
        }

        let point = hit.center.offset(action.click_offset);
        if inside(point, frame).is_err() {
            self.elements.invalidate(key);
            return Ok(None);
        }
        Ok(Some(Located {
            method: hit.method,
            confidence: hit.confidence,
            point,
            location: Some(hit),
        }))
    }

    /// Resolve the target through the method order.
    async fn locate(
        &self,
        action: &AutomationAction,
        frame: &Arc<Frame>,
        deadline: Deadline,
        allow_coordinates: bool,
    ) -> Result<Located> {
        let mut last_error = None;

        for method in self.method_order(action) {
            if method == DetectionMethod::Coordinates {
                let Some(point) = action.coordinates.filter(|_| allow_coordinates) else {
                    continue;
                };
                match inside(point, frame) {
                    Ok(()) => {
                        return Ok(Located {
                            method,
                            location: None,
                            point,
                            confidence: 1.0,
                        })
                    }
                    Err(e) => {
                        last_error = Some(e);
                        continue;
                    }
                }
            }

            let Some(descriptor) = action.descriptor_for(method) else {
                continue;
            };
            let result = match self.detect(descriptor, frame, action.timeout, deadline).await {
                Ok(result) => result,
                Err(e) => {
                    last_error = Some(e);
                    continue;
                }
            };

            let Some(best) = result.best().cloned() else {
                last_error = Some(detection_error(&result, action));
                continue;
            };
            let point = best.center.offset(action.click_offset);
            if let Err(e) = inside(point, frame) {
                last_error = Some(e);
                continue;
            }
            return Ok(Located {
                method,
                confidence: best.confidence,
                location: Some(best),
                point,
            });
        }

        Err(last_error.unwrap_or_else(|| EngineError::not_found(action.target_name())))
    }

    async fn detect(
        &self,
        descriptor: ElementDescriptor,
        frame: &Arc<Frame>,
        timeout: Duration,
        deadline: Deadline,
    ) -> Result<DetectionResult> {
        let elements = self.elements.clone();
        let frame = frame.clone();
        run_blocking("element detection", timeout, deadline, move |cancel| {
            elements.detect_uncached(&descriptor, &frame, &cancel)
        })
        .await
    }

    async fn capture(&self, action: &AutomationAction, deadline: Deadline) -> Result<Arc<Frame>> {
        let frames = self.frames.clone();
        let frame = run_blocking("frame capture", action.timeout, deadline, move |_| {
            frames.capture()
        })
        .await??;
        *self.last_bounds.lock().unwrap_or_else(PoisonError::into_inner) = Some(frame.bounds());
        Ok(Arc::new(frame))
    }

    async fn perform(
        &self,
        action: &AutomationAction,
        point: Point,
        frame: &Frame,
        deadline: Deadline,
    ) -> Result<()> {
        let before = action.verify_change.then(|| frame.content_hash());
        let focus = |button| {
            vec![
                InputEvent::MoveTo { point },
                InputEvent::Click { button },
            ]
        };

        match action.action_type {
            ActionType::Click => self.send(focus(MouseButton::Left), deadline).await?,
            ActionType::RightClick => self.send(focus(MouseButton::Right), deadline).await?,
            ActionType::DoubleClick => {
                let events = vec![
                    InputEvent::MoveTo { point },
                    InputEvent::DoubleClick {
                        button: MouseButton::Left,
                    },
                ];
                self.send(events, deadline).await?
            }
            ActionType::Type => {
                self.send(focus(MouseButton::Left), deadline).await?;
                let text = action.input_text.as_deref().unwrap_or_default();
                self.send(parse_typed_text(text), deadline).await?
            }
            ActionType::Read | ActionType::Wait => {}
        }

        if let Some(before) = before {
            self.confirm_change(action, before, deadline).await?;
        }
        Ok(())
    }

    /// Send a batch of events after the configured input delay.
    async fn send(&self, events: Vec<InputEvent>, deadline: Deadline) -> Result<()> {
        deadline.sleep(self.settings.action_delay, "input delay").await?;
        let input = self.input.clone();
        tokio::task::spawn_blocking(move || events.iter().try_for_each(|e| input.send(e)))
            .await
            .map_err(|e| EngineError::Input(format!("input task failed: {}", e)))?
    }

    async fn confirm_change(
        &self,
        action: &AutomationAction,
        before: u64,
        deadline: Deadline,
    ) -> Result<()> {
        let settle = self.settings.change_settle_delay;
        deadline.sleep(settle, "waiting for the UI to change").await?;
        let after = self.capture(action, deadline).await?;
        if after.content_hash() == before {
            return Err(EngineError::timeout("waiting for the UI to change", settle));
        }
        Ok(())
    }

    async fn read(
        &self,
        action: &AutomationAction,
        deadline: Deadline,
    ) -> Result<AutomationResult> {
        let frame = self.capture(action, deadline).await?;

        let (region, located) = if action.has_detection_target() {
            let located = self.locate(action, &frame, deadline, false).await?;
            let region = located
                .location
                .as_ref()
                .map(|m| local_region(&frame, m.bounding_box));
            (region, Some(located))
        } else {
            (action.region, None)
        };

        let text = self.text.clone();
        let snapshot = frame.clone();
        let read = run_blocking("text recognition", action.timeout, deadline, move |cancel| {
            text.read_text(&snapshot, region, &cancel)
        })
        .await??;

        let mut result = match located {
            Some(located) => located.into_result(),
            None => AutomationResult::succeeded(DetectionMethod::Text, 1.0, None),
        };
        debug!(element = %action.target_name(), chars = read.len(), "read text");
        result.text = Some(read);
        Ok(result)
    }

    async fn wait(
        &self,
        action: &AutomationAction,
        deadline: Deadline,
    ) -> Result<AutomationResult> {
        if !action.has_detection_target() {
            deadline.sleep(action.timeout, "wait").await?;
            let mut result = AutomationResult::succeeded(DetectionMethod::Coordinates, 1.0, None);
            result.method_used = None;
            return Ok(result);
        }

        let start = Instant::now();
        let bound = Deadline::after(action.timeout).earliest(deadline);
        loop {
            let attempt = match self.capture(action, bound).await {
                Ok(frame) => self.locate(action, &frame, bound, false).await,
                Err(e) => Err(e),
            };
            match attempt {
                Ok(located) => {
                    debug!(
                        element = %action.target_name(),
                        waited_ms = start.elapsed().as_millis() as u64,
                        "element appeared"
                    );
                    return Ok(located.into_result());
                }
                Err(e) => debug!(error = %e, "still waiting"),
            }
            if bound.expired() {
                break;
            }
            tokio::time::sleep(bound.clamp(WAIT_POLL_INTERVAL)).await;
            if bound.expired() {
                break;
            }
        }
        Err(EngineError::timeout(
            format!("waiting for '{}'", action.target_name()),
            start.elapsed(),
        ))
    }
}

/// Run blocking work under a timeout bounded by `deadline`.
///
/// `work` receives a token that is cancelled when the timeout fires (or
/// when this future is dropped). A timed-out worker is awaited for up to
/// [`CANCEL_GRACE`] before the timeout is reported, so cancellable work has
/// stopped by the time the caller retries.
pub(crate) async fn run_blocking<T, F>(
    operation: &str,
    limit: Duration,
    deadline: Deadline,
    work: F,
) -> Result<T>
where
    F: FnOnce(CancellationToken) -> T + Send + 'static,
    T: Send + 'static,
{
    let bound = deadline.clamp(limit);
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    let worker_cancel = cancel.clone();
    let mut task = tokio::task::spawn_blocking(move || work(worker_cancel));
    match tokio::time::timeout(bound, &mut task).await {
        Ok(joined) => {
            joined.map_err(|e| EngineError::Other(format!("{} task failed: {}", operation, e)))
        }
        Err(_) => {
            cancel.cancel();
            if tokio::time::timeout(CANCEL_GRACE, task).await.is_err() {
                warn!(operation, "blocking work ignored cancellation");
            }
            Err(EngineError::timeout(operation, bound))
        }
    }
}

fn inside(point: Point, frame: &Frame) -> Result<()> {
    let bounds = frame.bounds();
    if bounds.contains(point) {
        Ok(())
    } else {
        Err(EngineError::Coordinate {
            point,
            reason: format!("outside the captured frame {}", bounds),
        })
    }
}

fn detection_error(result: &DetectionResult, action: &AutomationAction) -> EngineError {
    EngineError::Detection {
        category: result.error_category.unwrap_or(ErrorCategory::ElementNotFound),
        message: result
            .error_message
            .clone()
            .unwrap_or_else(|| format!("element '{}' not found", action.target_name())),
    }
}
