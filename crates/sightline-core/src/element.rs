//! Element detection orchestration.
//!
//! The [`ElementDetector`] turns an [`ElementDescriptor`] into a ranked
//! [`DetectionResult`]:
//!
//! 1. serve a live cache entry if there is one
//! 2. pick methods (explicit preference, else from the declared targets)
//! 3. run each [`Detector`] on the (optionally cropped) frame; hybrid
//!    detections run both detectors on scoped threads
//! 4. boost text/template pairs that agree spatially
//! 5. filter by the descriptor's threshold and rank
//! 6. cache the best match
//!
//! Failures are classified where they happen: detector errors keep their
//! own category, no candidates at all is `element_not_found`, candidates
//! that only exist below threshold are `low_confidence`. A cancelled
//! detection reports `timeout`.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::cache::LocationCache;
use crate::descriptor::{DetectionMethod, ElementDescriptor};
use crate::detection::{rank, DetectionResult, Detector, Match};
use crate::error::{EngineError, ErrorCategory, Result};
use crate::frame::Frame;
use crate::geometry::Rect;
use crate::telemetry::TelemetryTracker;

/// Maximum center distance (px) for text and template matches to agree.
pub const CONSENSUS_DISTANCE: f64 = 20.0;

/// Confidence multiplier for agreeing matches.
pub const CONSENSUS_BOOST: f32 = 1.2;

/// Growth (px) of a cached clickable region when re-verifying it.
pub const REVERIFY_MARGIN: i32 = 20;

/// Cache key action kind for direct detections.
pub const DETECT_ACTION: &str = "detect";

struct MethodOutcome {
    method: DetectionMethod,
    result: Result<Vec<Match>>,
    elapsed: Duration,
}

pub struct ElementDetector {
    detectors: Vec<Arc<dyn Detector>>,
    cache: Mutex<LocationCache>,
    telemetry: Arc<TelemetryTracker>,
}

impl std::fmt::Debug for ElementDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let methods: Vec<_> = self.detectors.iter().map(|d| d.method()).collect();
        f.debug_struct("ElementDetector")
            .field("methods", &methods)
            .field("cached", &self.cache_len())
            .finish()
    }
}

impl ElementDetector {
    pub fn new(
        detectors: Vec<Arc<dyn Detector>>,
        cache_ttl: Duration,
        telemetry: Arc<TelemetryTracker>,
    ) -> Self {
        Self {
            detectors,
            cache: Mutex::new(LocationCache::new(cache_ttl)),
            telemetry,
        }
    }

    fn detector(&self, method: DetectionMethod) -> Option<&Arc<dyn Detector>> {
        self.detectors.iter().find(|d| d.method() == method)
    }

    /// Detect with cache key action kind `detect`, without cancellation.
    pub fn detect(&self, descriptor: &ElementDescriptor, frame: &Frame) -> DetectionResult {
        self.detect_for(descriptor, frame, DETECT_ACTION, &CancellationToken::new())
    }

    /// Detect, serving and populating the cache under `action_kind`.
    pub fn detect_for(
        &self,
        descriptor: &ElementDescriptor,
        frame: &Frame,
        action_kind: &str,
        cancel: &CancellationToken,
    ) -> DetectionResult {
        let start = Instant::now();
        let key = descriptor.cache_key(action_kind);

        if let Some(hit) = self.cached(&key) {
            debug!(element = descriptor.name(), %key, "cache hit");
            return DetectionResult::cached(hit, start.elapsed());
        }

        let result = self.detect_uncached(descriptor, frame, cancel);
        if let Some(best) = result.best() {
            self.remember(&key, best.clone());
        }
        result
    }

    /// Cache lookup; counts a hit or a miss.
    pub fn cached(&self, key: &str) -> Option<Match> {
        let hit = self
            .cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key, Instant::now());
        if hit.is_some() {
            self.telemetry.record_cache_hit();
        } else {
            self.telemetry.record_cache_miss();
        }
        hit
    }

    pub fn remember(&self, key: &str, location: Match) {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, location, Instant::now());
    }

    pub fn invalidate(&self, key: &str) -> bool {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .invalidate(key)
    }

    pub fn clear_cache(&self) {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn cache_len(&self) -> usize {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn set_cache_ttl(&self, ttl: Duration) {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .set_ttl(ttl);
    }

    /// Check that a cached location still shows the element, searching only
    /// the cached clickable region grown by [`REVERIFY_MARGIN`].
    pub fn reverify(
        &self,
        descriptor: &ElementDescriptor,
        frame: &Frame,
        cached: &Match,
        cancel: &CancellationToken,
    ) -> bool {
        let local = local_region(frame, cached.clickable_region.padded(REVERIFY_MARGIN));
        let narrowed = descriptor.clone().region(local);
        let result = self.detect_uncached(&narrowed, frame, cancel);
        trace!(
            element = descriptor.name(),
            still_there = result.success,
            "re-verified cached location"
        );
        result.success
    }

    /// Full detection, bypassing the cache.
    pub fn detect_uncached(
        &self,
        descriptor: &ElementDescriptor,
        frame: &Frame,
        cancel: &CancellationToken,
    ) -> DetectionResult {
        let start = Instant::now();
        let methods = descriptor.methods();
        if methods.is_empty() {
            return DetectionResult::failure(
                ErrorCategory::ConfigurationError,
                format!(
                    "element '{}' has no text patterns or template names",
                    descriptor.name()
                ),
                methods,
                start.elapsed(),
            );
        }

        let cropped;
        let search = match descriptor.search_region() {
            Some(region) => match frame.crop(&region) {
                Ok(c) => {
                    cropped = c;
                    &cropped
                }
                Err(e) => {
                    return DetectionResult::failure(
                        e.category(),
                        e.to_string(),
                        methods,
                        start.elapsed(),
                    )
                }
            },
            None => frame,
        };

        let outcomes = if methods.len() > 1 {
            self.run_parallel(&methods, descriptor, search, cancel)
        } else {
            methods
                .iter()
                .map(|m| self.run_method(*m, descriptor, search, cancel))
                .collect()
        };

        if cancel.is_cancelled() {
            debug!(element = descriptor.name(), "detection cancelled");
            let error = EngineError::Cancelled(format!("detection of '{}'", descriptor.name()));
            return DetectionResult::failure(
                error.category(),
                error.to_string(),
                methods,
                start.elapsed(),
            );
        }

        let threshold = descriptor.confidence_threshold();
        let mut first_error: Option<EngineError> = None;
        let mut text_matches = Vec::new();
        let mut template_matches = Vec::new();

        for outcome in outcomes {
            let success = outcome
                .result
                .as_ref()
                .is_ok_and(|ms| ms.iter().any(|m| m.confidence >= threshold));
            self.telemetry
                .record_detection(outcome.method, success, outcome.elapsed);

            match outcome.result {
                Ok(found) => match outcome.method {
                    DetectionMethod::Template => template_matches.extend(found),
                    _ => text_matches.extend(found),
                },
                Err(e) => {
                    debug!(method = %outcome.method, error = %e, "detector failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        let candidates = if methods.len() > 1 {
            apply_consensus(text_matches, template_matches)
        } else {
            text_matches.into_iter().chain(template_matches).collect()
        };

        let best_candidate = candidates
            .iter()
            .map(|m| m.confidence)
            .fold(None, |acc: Option<f32>, c| Some(acc.map_or(c, |a| a.max(c))));

        let mut matches: Vec<Match> = candidates
            .into_iter()
            .filter(|m| m.confidence >= threshold)
            .collect();
        rank(&mut matches);

        let elapsed = start.elapsed();
        if !matches.is_empty() {
            debug!(
                element = descriptor.name(),
                matches = matches.len(),
                best = matches[0].confidence,
                "element found"
            );
            return DetectionResult::found(matches, methods, elapsed);
        }

        let error = match (best_candidate, first_error) {
            (Some(best), _) => EngineError::LowConfidence {
                target: descriptor.name().to_string(),
                best,
                threshold,
            },
            (None, Some(e)) => e,
            (None, None) => EngineError::not_found(descriptor.name()),
        };
        debug!(
            element = descriptor.name(),
            category = %error.category(),
            "element not detected"
        );
        DetectionResult::failure(error.category(), error.to_string(), methods, elapsed)
    }

    fn run_method(
        &self,
        method: DetectionMethod,
        descriptor: &ElementDescriptor,
        frame: &Frame,
        cancel: &CancellationToken,
    ) -> MethodOutcome {
        let start = Instant::now();
        let result = match self.detector(method) {
            Some(detector) => detector.detect(frame, descriptor, cancel),
            None => Err(EngineError::Config(format!(
                "no {} detector is configured",
                method
            ))),
        };
        MethodOutcome {
            method,
            result,
            elapsed: start.elapsed(),
        }
    }

    fn run_parallel(
        &self,
        methods: &[DetectionMethod],
        descriptor: &ElementDescriptor,
        frame: &Frame,
        cancel: &CancellationToken,
    ) -> Vec<MethodOutcome> {
        std::thread::scope(|scope| {
            let handles: Vec<_> = methods
                .iter()
                .map(|&method| {
                    (
                        method,
                        scope.spawn(move || self.run_method(method, descriptor, frame, cancel)),
                    )
                })
                .collect();

            handles
                .into_iter()
                .map(|(method, handle)| {
                    handle.join().unwrap_or_else(|_| MethodOutcome {
                        method,
                        result: Err(EngineError::Other(format!("{} detector panicked", method))),
                        elapsed: Duration::ZERO,
                    })
                })
                .collect()
        })
    }
}

/// Boost text and template matches whose centers are within
/// [`CONSENSUS_DISTANCE`] of a match from the other method.
pub fn apply_consensus(text: Vec<Match>, template: Vec<Match>) -> Vec<Match> {
    let agrees = |m: &Match, others: &[Match]| {
        others
            .iter()
            .any(|o| m.center.distance(o.center) <= CONSENSUS_DISTANCE)
    };

    let boosted_text: Vec<Match> = text
        .iter()
        .map(|m| {
            if agrees(m, &template) {
                m.corroborate(CONSENSUS_BOOST)
            } else {
                m.clone()
            }
        })
        .collect();
    let boosted_template: Vec<Match> = template
        .iter()
        .map(|m| {
            if agrees(m, &text) {
                m.corroborate(CONSENSUS_BOOST)
            } else {
                m.clone()
            }
        })
        .collect();

    boosted_text.into_iter().chain(boosted_template).collect()
}

/// Frame-local search region around a screen-space rectangle.
pub fn local_region(frame: &Frame, screen: Rect) -> Rect {
    let origin = frame.origin();
    screen.translate(-origin.x, -origin.y)
}
