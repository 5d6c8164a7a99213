//! Optical text detection.
//!
//! Frames are preprocessed (see [`preprocess`]), handed to an
//! [`OcrBackend`], and the recognized words are normalized:
//!
//! - percent confidences become 0.0 - 1.0; negative rows are dropped
//! - words below the configured OCR floor are dropped
//! - empty and whitespace-only words are dropped
//!
//! When the primary backend fails or its average confidence is below
//! [`FALLBACK_TRIGGER`], the fallback backend runs on the un-thresholded
//! grayscale image. Its words replace the primary's only if there are
//! strictly more of them.
//!
//! Patterns are substrings (case-insensitive unless asked otherwise) or,
//! with a `re:` prefix, regular expressions. Patterns are matched against
//! whole OCR lines, so `"Save changes"` finds two adjacent words and
//! reports the union of their boxes.

pub mod backend;
pub mod preprocess;

use std::borrow::Cow;
use std::collections::BTreeMap;

use regex::{Regex, RegexBuilder};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{DebugConfig, OcrConfig};
use crate::descriptor::{DetectionMethod, ElementDescriptor, REGEX_PREFIX};
use crate::detection::{Detector, Match};
use crate::error::{EngineError, Result};
use crate::frame::Frame;
use crate::geometry::Rect;
use crate::wait::ensure_active;

use self::backend::{LineId, OcrBackend, OcrWord, Tesseract};
use self::preprocess::preprocess;

/// Average confidence below which the fallback recognizer runs.
pub const FALLBACK_TRIGGER: f32 = 0.6;

/// A normalized word in frame-local coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct RecognizedWord {
    pub text: String,
    /// 0.0 - 1.0
    pub confidence: f32,
    pub bbox: Rect,
    pub line: LineId,
}

/// A compiled text pattern.
#[derive(Debug, Clone)]
pub enum TextPattern {
    Literal { needle: String, case_sensitive: bool },
    Regex(Regex),
}

impl TextPattern {
    pub fn parse(pattern: &str, case_sensitive: bool) -> Result<Self> {
        if let Some(expr) = pattern.strip_prefix(REGEX_PREFIX) {
            let regex = RegexBuilder::new(expr)
                .case_insensitive(!case_sensitive)
                .build()
                .map_err(|e| {
                    EngineError::Config(format!("invalid text pattern '{}': {}", pattern, e))
                })?;
            return Ok(TextPattern::Regex(regex));
        }
        let needle = if case_sensitive {
            pattern.to_string()
        } else {
            pattern.to_lowercase()
        };
        Ok(TextPattern::Literal {
            needle,
            case_sensitive,
        })
    }

    /// Text as the pattern compares it.
    fn fold<'a>(&self, text: &'a str) -> Cow<'a, str> {
        match self {
            TextPattern::Literal {
                case_sensitive: false,
                ..
            } => Cow::Owned(text.to_lowercase()),
            _ => Cow::Borrowed(text),
        }
    }

    /// Byte ranges of every match in `haystack` (already folded).
    fn ranges(&self, haystack: &str) -> Vec<(usize, usize)> {
        match self {
            TextPattern::Literal { needle, .. } => {
                if needle.trim().is_empty() {
                    return Vec::new();
                }
                haystack
                    .match_indices(needle.as_str())
                    .map(|(start, m)| (start, start + m.len()))
                    .collect()
            }
            TextPattern::Regex(regex) => regex
                .find_iter(haystack)
                .filter(|m| !m.is_empty())
                .map(|m| (m.start(), m.end()))
                .collect(),
        }
    }
}

/// OCR-based detector.
pub struct TextDetector {
    config: OcrConfig,
    debug: DebugConfig,
    primary: Box<dyn OcrBackend>,
    fallback: Option<Box<dyn OcrBackend>>,
}

impl std::fmt::Debug for TextDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextDetector")
            .field("primary", &self.primary.name())
            .field("fallback", &self.fallback.as_ref().map(|b| b.name().to_string()))
            .finish()
    }
}

impl TextDetector {
    /// Tesseract-backed detector built from configuration.
    pub fn new(config: &OcrConfig, debug: &DebugConfig) -> Self {
        let primary = Tesseract::new(&config.language, config.page_segmentation_mode);
        let fallback = config.enable_fallback.then(|| {
            Box::new(Tesseract::new(
                &config.language,
                config.fallback_page_segmentation_mode,
            )) as Box<dyn OcrBackend>
        });
        Self::with_backends(config, debug, Box::new(primary), fallback)
    }

    pub fn with_backends(
        config: &OcrConfig,
        debug: &DebugConfig,
        primary: Box<dyn OcrBackend>,
        fallback: Option<Box<dyn OcrBackend>>,
    ) -> Self {
        Self {
            config: config.clone(),
            debug: debug.clone(),
            primary,
            fallback,
        }
    }

    fn normalize(&self, words: Vec<OcrWord>) -> Vec<RecognizedWord> {
        words
            .into_iter()
            .filter(|w| w.confidence >= 0.0 && !w.text.trim().is_empty())
            .map(|w| RecognizedWord {
                text: w.text.trim().to_string(),
                confidence: (w.confidence / 100.0).clamp(0.0, 1.0),
                bbox: w.bbox,
                line: w.line,
            })
            .filter(|w| w.confidence >= self.config.confidence_threshold)
            .collect()
    }

    /// Recognize every word in the frame (frame-local boxes).
    pub fn recognize(&self, frame: &Frame) -> Result<Vec<RecognizedWord>> {
        self.recognize_cancellable(frame, &CancellationToken::new())
    }

    /// [`recognize`](Self::recognize), giving up between OCR passes once
    /// `cancel` fires.
    pub fn recognize_cancellable(
        &self,
        frame: &Frame,
        cancel: &CancellationToken,
    ) -> Result<Vec<RecognizedWord>> {
        ensure_active(cancel, "text recognition")?;
        let prepared = preprocess(
            frame.image(),
            self.config.preprocess,
            &self.config.preprocessing,
        );
        if self.debug.save_debug_images {
            self.save_debug_image(&prepared.binary);
        }

        let primary = self
            .primary
            .recognize(&prepared.binary)
            .map(|words| self.normalize(words));

        let needs_fallback = match &primary {
            Err(e) => {
                warn!(backend = self.primary.name(), error = %e, "primary OCR failed");
                true
            }
            Ok(words) => average_confidence(words) < FALLBACK_TRIGGER,
        };

        if let (true, Some(fallback)) = (needs_fallback, &self.fallback) {
            ensure_active(cancel, "text recognition")?;
            let primary_count = primary.as_ref().map_or(0, Vec::len);
            match fallback.recognize(&prepared.grayscale) {
                Ok(words) => {
                    let words = self.normalize(words);
                    if words.len() > primary_count {
                        debug!(
                            backend = fallback.name(),
                            primary = primary_count,
                            fallback = words.len(),
                            "using fallback OCR result"
                        );
                        return Ok(words);
                    }
                }
                Err(e) => warn!(backend = fallback.name(), error = %e, "fallback OCR failed"),
            }
        }

        primary
    }

    fn save_debug_image(&self, image: &image::GrayImage) {
        let dir = &self.debug.debug_image_path;
        let path = dir.join(format!(
            "ocr_{}.png",
            chrono::Local::now().format("%Y%m%d_%H%M%S_%3f")
        ));
        let result = std::fs::create_dir_all(dir)
            .map_err(EngineError::from)
            .and_then(|_| image.save(&path).map_err(EngineError::from));
        if let Err(e) = result {
            warn!(path = %path.display(), error = %e, "failed to save debug image");
        }
    }

    /// Find `pattern` in the frame. Boxes are in screen coordinates.
    pub fn find_text(
        &self,
        frame: &Frame,
        pattern: &str,
        case_sensitive: bool,
    ) -> Result<Vec<Match>> {
        let words = self.recognize(frame)?;
        let pattern = TextPattern::parse(pattern, case_sensitive)?;
        Ok(match_words(&words, &pattern, frame))
    }

    /// Recognized text in reading order, one line per OCR line.
    pub fn read_text(
        &self,
        frame: &Frame,
        region: Option<Rect>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let cropped;
        let frame = match region {
            Some(r) => {
                cropped = frame.crop(&r)?;
                &cropped
            }
            None => frame,
        };
        let words = self.recognize_cancellable(frame, cancel)?;
        Ok(lines(&words)
            .into_values()
            .map(|line| {
                line.iter()
                    .map(|w| w.text.as_str())
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .collect::<Vec<_>>()
            .join("\n"))
    }
}

impl Detector for TextDetector {
    fn method(&self) -> DetectionMethod {
        DetectionMethod::Text
    }

    fn detect(
        &self,
        frame: &Frame,
        descriptor: &ElementDescriptor,
        cancel: &CancellationToken,
    ) -> Result<Vec<Match>> {
        let patterns = descriptor
            .text_patterns()
            .iter()
            .map(|p| TextPattern::parse(p, descriptor.is_case_sensitive()))
            .collect::<Result<Vec<_>>>()?;

        let words = self.recognize_cancellable(frame, cancel)?;
        let mut matches = Vec::new();
        for pattern in &patterns {
            for m in match_words(&words, pattern, frame) {
                if !matches.iter().any(|e: &Match| e.bounding_box == m.bounding_box) {
                    matches.push(m);
                }
            }
        }
        Ok(matches)
    }
}

fn average_confidence(words: &[RecognizedWord]) -> f32 {
    if words.is_empty() {
        return 0.0;
    }
    words.iter().map(|w| w.confidence).sum::<f32>() / words.len() as f32
}

/// Words grouped by line, each line sorted left to right.
fn lines(words: &[RecognizedWord]) -> BTreeMap<LineId, Vec<&RecognizedWord>> {
    let mut lines: BTreeMap<LineId, Vec<&RecognizedWord>> = BTreeMap::new();
    for word in words {
        lines.entry(word.line).or_default().push(word);
    }
    for line in lines.values_mut() {
        line.sort_by_key(|w| w.bbox.x);
    }
    lines
}

fn match_words(words: &[RecognizedWord], pattern: &TextPattern, frame: &Frame) -> Vec<Match> {
    let mut matches: Vec<Match> = Vec::new();

    for line in lines(words).values() {
        let mut text = String::new();
        let mut spans = Vec::with_capacity(line.len());
        for word in line {
            if !text.is_empty() {
                text.push(' ');
            }
            let folded = pattern.fold(&word.text);
            spans.push((text.len(), text.len() + folded.len()));
            text.push_str(&folded);
        }

        for (start, end) in pattern.ranges(&text) {
            let hit: Vec<&RecognizedWord> = line
                .iter()
                .zip(&spans)
                .filter(|(_, (s, e))| *s < end && *e > start)
                .map(|(w, _)| *w)
                .collect();
            let Some(first) = hit.first() else {
                continue;
            };

            let bbox = hit.iter().fold(first.bbox, |acc, w| acc.union(&w.bbox));
            let confidence = hit.iter().map(|w| w.confidence).sum::<f32>() / hit.len() as f32;
            let label = hit
                .iter()
                .map(|w| w.text.as_str())
                .collect::<Vec<_>>()
                .join(" ");

            let screen_box = frame.to_screen(bbox);
            if matches.iter().any(|m| m.bounding_box == screen_box) {
                continue;
            }
            matches.push(Match::new(DetectionMethod::Text, confidence, screen_box, label));
        }
    }

    matches
}
