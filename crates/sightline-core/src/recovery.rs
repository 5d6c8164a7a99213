//! Failure recovery.
//!
//! After a failed attempt the [`RecoverySession`] looks up the plan for the
//! failure's [`ErrorCategory`] and applies strategies in priority order
//! until one succeeds. The successful strategy's [`ActionAdjustments`] are
//! folded into the next attempt. Each category keeps its own cursor, so a
//! repeated failure resumes the plan where the last one stopped.
//!
//! ```text
//! Detecting -> Failed -> Classifying -> SelectingStrategy -> ApplyingStrategy
//!                                                              |-> Recovered -> Detecting
//!                                                              |-> NextStrategy -> ApplyingStrategy
//!                                                              '-> Exhausted
//! ```
//!
//! Plans are static tables, so identical failure histories always produce
//! identical strategy sequences.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::action::{AutomationAction, AutomationResult};
use crate::config::RecoveryConfig;
use crate::descriptor::DetectionMethod;
use crate::diagnostics::ManualInterventionReport;
use crate::error::ErrorCategory;
use crate::executor::ActionExecutor;
use crate::geometry::{clamp_point, Point, Rect};
use crate::telemetry::{TelemetrySnapshot, TelemetryTracker};
use crate::wait::{backoff_delay, Deadline};

/// Threshold decrease applied by `relax_threshold`.
pub const RELAX_STEP: f32 = 0.1;

/// Timeout multiplier applied by `extend_timeout`.
pub const TIMEOUT_FACTOR: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    RelaxThreshold,
    SwitchMethod,
    WaitAndRetry,
    FallbackCoordinates,
    RecaptureFrame,
    ExtendTimeout,
    ClampCoordinates,
    EscalateManual,
}

impl RecoveryStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryStrategy::RelaxThreshold => "relax_threshold",
            RecoveryStrategy::SwitchMethod => "switch_method",
            RecoveryStrategy::WaitAndRetry => "wait_and_retry",
            RecoveryStrategy::FallbackCoordinates => "fallback_coordinates",
            RecoveryStrategy::RecaptureFrame => "recapture_frame",
            RecoveryStrategy::ExtendTimeout => "extend_timeout",
            RecoveryStrategy::ClampCoordinates => "clamp_coordinates",
            RecoveryStrategy::EscalateManual => "escalate_manual",
        }
    }
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A strategy together with its parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum StrategyParams {
    RelaxThreshold {
        step: f32,
    },
    SwitchMethod,
    WaitAndRetry {
        #[serde(with = "crate::config::duration_secs")]
        delay: Duration,
    },
    FallbackCoordinates,
    RecaptureFrame,
    ExtendTimeout {
        factor: u32,
    },
    ClampCoordinates,
    EscalateManual,
}

impl StrategyParams {
    pub fn strategy(&self) -> RecoveryStrategy {
        match self {
            StrategyParams::RelaxThreshold { .. } => RecoveryStrategy::RelaxThreshold,
            StrategyParams::SwitchMethod => RecoveryStrategy::SwitchMethod,
            StrategyParams::WaitAndRetry { .. } => RecoveryStrategy::WaitAndRetry,
            StrategyParams::FallbackCoordinates => RecoveryStrategy::FallbackCoordinates,
            StrategyParams::RecaptureFrame => RecoveryStrategy::RecaptureFrame,
            StrategyParams::ExtendTimeout { .. } => RecoveryStrategy::ExtendTimeout,
            StrategyParams::ClampCoordinates => RecoveryStrategy::ClampCoordinates,
            StrategyParams::EscalateManual => RecoveryStrategy::EscalateManual,
        }
    }
}

const fn relax() -> StrategyParams {
    StrategyParams::RelaxThreshold { step: RELAX_STEP }
}

const fn wait(secs: u64) -> StrategyParams {
    StrategyParams::WaitAndRetry {
        delay: Duration::from_secs(secs),
    }
}

/// Strategies for a category, highest priority first.
pub fn plan_for(category: ErrorCategory) -> Vec<StrategyParams> {
    use StrategyParams::*;
    match category {
        ErrorCategory::ElementNotFound => vec![relax(), SwitchMethod, wait(2), FallbackCoordinates],
        ErrorCategory::LowConfidence => vec![relax(), SwitchMethod, wait(1)],
        ErrorCategory::CaptureFailure => vec![wait(1), RecaptureFrame],
        ErrorCategory::Timeout => vec![
            ExtendTimeout {
                factor: TIMEOUT_FACTOR,
            },
            wait(2),
        ],
        ErrorCategory::CoordinateError => vec![ClampCoordinates, SwitchMethod],
        ErrorCategory::TextDetectorError => vec![SwitchMethod, wait(1)],
        ErrorCategory::TemplateDetectorError => vec![SwitchMethod, relax()],
        ErrorCategory::SystemError => vec![wait(3), RecaptureFrame],
        ErrorCategory::ConfigurationError => vec![EscalateManual],
        ErrorCategory::Unknown => vec![wait(1), relax(), SwitchMethod],
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryAction {
    pub strategy: RecoveryStrategy,
    pub parameters: StrategyParams,
    /// Lower runs first.
    pub priority: u32,
    pub estimated_success_rate: f64,
}

/// The plan for `category` with success estimates from telemetry.
pub fn recovery_actions(
    category: ErrorCategory,
    telemetry: &TelemetrySnapshot,
) -> Vec<RecoveryAction> {
    plan_for(category)
        .into_iter()
        .zip(1u32..)
        .map(|(parameters, priority)| RecoveryAction {
            strategy: parameters.strategy(),
            parameters,
            priority,
            estimated_success_rate: telemetry.estimated_success_rate(parameters.strategy()),
        })
        .collect()
}

/// Parameter changes for the next attempt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionAdjustments {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence_threshold: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method_order: Option<Vec<DetectionMethod>>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "crate::config::option_duration_secs"
    )]
    pub timeout: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinates: Option<Point>,
    /// Drop the cached location and capture a fresh frame.
    #[serde(default)]
    pub recapture: bool,
}

impl ActionAdjustments {
    pub fn is_empty(&self) -> bool {
        *self == ActionAdjustments::default()
    }

    /// Fold `other` in; its values win.
    pub fn merge(&mut self, other: ActionAdjustments) {
        if other.confidence_threshold.is_some() {
            self.confidence_threshold = other.confidence_threshold;
        }
        if other.method_order.is_some() {
            self.method_order = other.method_order;
        }
        if other.timeout.is_some() {
            self.timeout = other.timeout;
        }
        if other.coordinates.is_some() {
            self.coordinates = other.coordinates;
        }
        self.recapture |= other.recapture;
    }

    /// Write the adjustments into an action. `recapture` is the executor's
    /// concern and is not reflected in the action.
    pub fn apply(&self, action: &mut AutomationAction) {
        if let Some(threshold) = self.confidence_threshold {
            action.confidence_threshold = threshold;
        }
        if let Some(order) = &self.method_order {
            action.method_order = Some(order.clone());
        }
        if let Some(timeout) = self.timeout {
            action.timeout = timeout;
        }
        if let Some(point) = self.coordinates {
            action.coordinates = Some(point);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyOutcome {
    Succeeded,
    Failed,
    Skipped,
    Escalated,
}

/// One entry of the recovery trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedStrategy {
    pub category: ErrorCategory,
    pub strategy: RecoveryStrategy,
    pub outcome: StrategyOutcome,
    pub note: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecoveryState {
    #[default]
    Detecting,
    Failed,
    Classifying,
    SelectingStrategy,
    ApplyingStrategy,
    Recovered,
    NextStrategy,
    Exhausted,
}

/// What the caller needs to know to decide about another attempt.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecoveryOutcome {
    pub should_retry: bool,
    pub manual_intervention: bool,
    pub adjustments: ActionAdjustments,
}

/// Inputs a strategy may consult.
#[derive(Debug, Clone, Copy)]
pub struct RecoveryContext<'a> {
    pub action: &'a AutomationAction,
    /// Method order the failed attempt used.
    pub method_order: &'a [DetectionMethod],
    pub attempts_remaining: u32,
    /// Screen bounds of the last captured frame.
    pub frame_bounds: Option<Rect>,
    pub deadline: Deadline,
    pub config: &'a RecoveryConfig,
    pub telemetry: &'a TelemetryTracker,
}

enum Application {
    Applied(ActionAdjustments, String),
    Skipped(String),
    Failed(String),
    Escalated(String),
}

async fn apply_strategy(params: StrategyParams, ctx: &RecoveryContext<'_>) -> Application {
    let action = ctx.action;
    match params {
        StrategyParams::RelaxThreshold { step } => {
            let floor = ctx.config.min_confidence_threshold;
            let current = action.confidence_threshold;
            if current <= floor + f32::EPSILON {
                return Application::Skipped(format!("threshold already at floor {:.2}", floor));
            }
            let relaxed = (current - step).max(floor);
            Application::Applied(
                ActionAdjustments {
                    confidence_threshold: Some(relaxed),
                    ..Default::default()
                },
                format!("threshold {:.2} -> {:.2}", current, relaxed),
            )
        }
        StrategyParams::SwitchMethod => {
            let usable: Vec<DetectionMethod> = ctx
                .method_order
                .iter()
                .copied()
                .filter(|m| action.targets(*m))
                .collect();
            if usable.len() < 2 {
                return Application::Skipped("fewer than two usable methods".into());
            }
            let mut rotated = usable;
            rotated.rotate_left(1);
            let note = format!("method order now starts with {}", rotated[0]);
            Application::Applied(
                ActionAdjustments {
                    method_order: Some(rotated),
                    ..Default::default()
                },
                note,
            )
        }
        StrategyParams::WaitAndRetry { delay } => {
            if ctx.attempts_remaining == 0 {
                return Application::Skipped("no attempt left to retry".into());
            }
            match ctx.deadline.sleep(delay, "recovery wait").await {
                Ok(()) => Application::Applied(
                    ActionAdjustments::default(),
                    format!("waited {:.1}s", delay.as_secs_f64()),
                ),
                Err(e) => Application::Failed(e.to_string()),
            }
        }
        StrategyParams::FallbackCoordinates => {
            if action.coordinates.is_none() {
                return Application::Skipped("no fallback coordinates declared".into());
            }
            if ctx.method_order == [DetectionMethod::Coordinates] {
                return Application::Skipped("already using coordinates".into());
            }
            Application::Applied(
                ActionAdjustments {
                    method_order: Some(vec![DetectionMethod::Coordinates]),
                    ..Default::default()
                },
                "falling back to declared coordinates".into(),
            )
        }
        StrategyParams::RecaptureFrame => Application::Applied(
            ActionAdjustments {
                recapture: true,
                ..Default::default()
            },
            "cached location dropped, next attempt captures a fresh frame".into(),
        ),
        StrategyParams::ExtendTimeout { factor } => {
            let max = ctx.config.max_timeout;
            if action.timeout >= max {
                return Application::Skipped(format!(
                    "timeout already at maximum {:.1}s",
                    max.as_secs_f64()
                ));
            }
            let extended = action.timeout.saturating_mul(factor).min(max);
            Application::Applied(
                ActionAdjustments {
                    timeout: Some(extended),
                    ..Default::default()
                },
                format!(
                    "timeout {:.1}s -> {:.1}s",
                    action.timeout.as_secs_f64(),
                    extended.as_secs_f64()
                ),
            )
        }
        StrategyParams::ClampCoordinates => {
            let (Some(point), Some(bounds)) = (action.coordinates, ctx.frame_bounds) else {
                return Application::Skipped("no coordinates or frame bounds to clamp".into());
            };
            match clamp_point(point, &bounds) {
                Some(clamped) if clamped != point => Application::Applied(
                    ActionAdjustments {
                        coordinates: Some(clamped),
                        ..Default::default()
                    },
                    format!("coordinates {} -> {}", point, clamped),
                ),
                _ => Application::Skipped(format!("coordinates {} need no clamping", point)),
            }
        }
        StrategyParams::EscalateManual => {
            Application::Escalated("operator attention required".into())
        }
    }
}

/// Recovery state for one logical action.
#[derive(Debug, Default)]
pub struct RecoverySession {
    cursors: HashMap<ErrorCategory, usize>,
    trail: Vec<AppliedStrategy>,
    pending: Option<RecoveryStrategy>,
    state: RecoveryState,
}

impl RecoverySession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> RecoveryState {
        self.state
    }

    pub fn trail(&self) -> &[AppliedStrategy] {
        &self.trail
    }

    pub fn into_trail(self) -> Vec<AppliedStrategy> {
        self.trail
    }

    fn transition(&mut self, next: RecoveryState) {
        debug!(from = ?self.state, to = ?next, "recovery state");
        self.state = next;
    }

    fn record(
        &mut self,
        category: ErrorCategory,
        strategy: RecoveryStrategy,
        outcome: StrategyOutcome,
        note: String,
    ) {
        debug!(%category, %strategy, ?outcome, %note, "recovery strategy");
        self.trail.push(AppliedStrategy {
            category,
            strategy,
            outcome,
            note,
        });
    }

    /// Start an attempt.
    pub fn begin_attempt(&mut self) {
        self.transition(RecoveryState::Detecting);
    }

    /// Credit the strategy that enabled the attempt that just finished.
    pub fn settle(&mut self, success: bool, telemetry: &TelemetryTracker) {
        if let Some(strategy) = self.pending.take() {
            telemetry.record_recovery(strategy, success);
        }
    }

    /// Walk the plan for `category` from its cursor.
    pub async fn recover(
        &mut self,
        category: ErrorCategory,
        ctx: &RecoveryContext<'_>,
    ) -> RecoveryOutcome {
        self.transition(RecoveryState::Failed);
        self.transition(RecoveryState::Classifying);
        debug!(%category, "classified failure");
        self.transition(RecoveryState::SelectingStrategy);

        let plan = recovery_actions(category, &ctx.telemetry.snapshot());
        loop {
            let index = {
                let cursor = self.cursors.entry(category).or_insert(0);
                let index = *cursor;
                *cursor += 1;
                index
            };
            let Some(step) = plan.get(index) else {
                self.transition(RecoveryState::Exhausted);
                return RecoveryOutcome {
                    should_retry: false,
                    manual_intervention: true,
                    adjustments: ActionAdjustments::default(),
                };
            };

            self.transition(RecoveryState::ApplyingStrategy);
            match apply_strategy(step.parameters, ctx).await {
                Application::Applied(adjustments, note) => {
                    self.record(category, step.strategy, StrategyOutcome::Succeeded, note);
                    self.pending = Some(step.strategy);
                    self.transition(RecoveryState::Recovered);
                    return RecoveryOutcome {
                        should_retry: true,
                        manual_intervention: false,
                        adjustments,
                    };
                }
                Application::Skipped(note) => {
                    self.record(category, step.strategy, StrategyOutcome::Skipped, note);
                }
                Application::Failed(note) => {
                    ctx.telemetry.record_recovery(step.strategy, false);
                    self.record(category, step.strategy, StrategyOutcome::Failed, note);
                }
                Application::Escalated(note) => {
                    self.record(category, step.strategy, StrategyOutcome::Escalated, note);
                    self.transition(RecoveryState::Exhausted);
                    return RecoveryOutcome {
                        should_retry: false,
                        manual_intervention: true,
                        adjustments: ActionAdjustments::default(),
                    };
                }
            }
            self.transition(RecoveryState::NextStrategy);
        }
    }
}

/// Retry loop with recovery between attempts.
#[derive(Debug, Clone)]
pub struct RecoveryEngine {
    executor: Arc<ActionExecutor>,
    config: RecoveryConfig,
}

impl RecoveryEngine {
    pub fn new(executor: Arc<ActionExecutor>, config: RecoveryConfig) -> Self {
        Self { executor, config }
    }

    pub fn executor(&self) -> &Arc<ActionExecutor> {
        &self.executor
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    /// Run `action` with up to the retry budget of attempts, recovering
    /// between them.
    ///
    /// With recovery disabled this is the executor's plain retry loop.
    pub async fn execute_with_retry(&self, action: AutomationAction) -> AutomationResult {
        let action = action.anchored();
        if !self.config.enabled {
            return self.executor.execute_with_retry(&action).await;
        }

        let start = tokio::time::Instant::now();
        let max_attempts = self.executor.max_attempts(&action);
        let deadline = action.wait_deadline();
        let telemetry = self.executor.telemetry().clone();
        let settings = self.executor.settings();

        let mut working = action;
        let mut session = RecoverySession::new();
        let mut attempt = 0;
        let mut manual = false;

        let mut result = loop {
            attempt += 1;
            session.begin_attempt();
            let mut result = self.executor.execute(&working).await;
            result.attempts = attempt;
            session.settle(result.success, &telemetry);
            if result.success {
                break result;
            }

            let category = result.category();
            let order = self.executor.method_order(&working);
            let ctx = RecoveryContext {
                action: &working,
                method_order: &order,
                attempts_remaining: max_attempts - attempt,
                frame_bounds: self.executor.last_frame_bounds(),
                deadline,
                config: &self.config,
                telemetry: &telemetry,
            };
            let outcome = session.recover(category, &ctx).await;

            if outcome.manual_intervention {
                manual = true;
                break result;
            }
            if !outcome.should_retry || attempt >= max_attempts {
                break result;
            }

            if outcome.adjustments.recapture {
                self.executor.forget(&working);
            }
            outcome.adjustments.apply(&mut working);

            let delay = backoff_delay(settings.retry_delay, attempt, settings.exponential_backoff);
            if let Err(e) = deadline.sleep(delay, "retry backoff").await {
                warn!(error = %e, "deadline reached before the next attempt");
                let mut expired = AutomationResult::failed(&e);
                expired.attempts = attempt;
                break expired;
            }
            info!(
                attempt = attempt + 1,
                max_attempts,
                element = %working.target_name(),
                "retrying action"
            );
        };

        result.recovery = session.into_trail();
        result.execution_time = start.elapsed();
        result.requires_manual_intervention = manual;
        telemetry.record_operation(result.success, result.execution_time);

        if !result.success {
            let context = self.executor.report_failure(&working, &mut result).await;
            if manual {
                let report = ManualInterventionReport::new(context, result.recovery.clone());
                if let Err(e) = self.executor.diagnostics().write_manual_report(&report) {
                    warn!(error = %e, "failed to write manual intervention report");
                }
            }
        }
        result
    }
}
