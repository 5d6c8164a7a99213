//! OCR backends.
//!
//! Backends report word boxes and confidences the way Tesseract does:
//! confidence in percent, with negative values marking rows that carry no
//! text. Normalization happens in [`super::TextDetector`].

use image::{GrayImage, ImageFormat};
use rusty_tesseract::{Args, Data, Image};
use tracing::{debug, trace};

use crate::error::{EngineError, Result};
use crate::geometry::Rect;

/// Position of a word's line in reading order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LineId {
    pub block: u32,
    pub paragraph: u32,
    pub line: u32,
}

/// One raw word from a backend.
#[derive(Debug, Clone, PartialEq)]
pub struct OcrWord {
    pub text: String,
    /// Percent (0 - 100); negative means "not text".
    pub confidence: f32,
    /// Image-local box.
    pub bbox: Rect,
    pub line: LineId,
}

pub trait OcrBackend: Send + Sync {
    fn name(&self) -> &str;

    fn recognize(&self, image: &GrayImage) -> Result<Vec<OcrWord>>;
}

/// Tesseract word-level recognition through `rusty_tesseract`.
#[derive(Debug, Clone)]
pub struct Tesseract {
    language: String,
    psm: u8,
    name: String,
}

impl Tesseract {
    pub fn new(language: impl Into<String>, psm: u8) -> Self {
        Self {
            language: language.into(),
            psm,
            name: format!("tesseract(psm {})", psm),
        }
    }

    fn args(&self) -> Args {
        Args {
            lang: self.language.clone(),
            psm: Some(i32::from(self.psm)),
            ..Args::default()
        }
    }
}

impl OcrBackend for Tesseract {
    fn name(&self) -> &str {
        &self.name
    }

    fn recognize(&self, image: &GrayImage) -> Result<Vec<OcrWord>> {
        // Removed when dropped
        let input = tempfile::Builder::new()
            .prefix("sightline-ocr-")
            .suffix(".png")
            .tempfile()?;
        image.save_with_format(input.path(), ImageFormat::Png)?;
        let source = Image::from_path(input.path())
            .map_err(|e| EngineError::TextDetector(format!("cannot load OCR input: {}", e)))?;

        trace!(language = %self.language, psm = self.psm, "running OCR");
        let output = rusty_tesseract::image_to_data(&source, &self.args())
            .map_err(|e| EngineError::TextDetector(format!("{} failed: {}", self.name, e)))?;

        let words: Vec<OcrWord> = output.data.iter().filter_map(word_from_row).collect();
        debug!(backend = %self.name, words = words.len(), "OCR finished");
        Ok(words)
    }
}

/// Word rows (level 5) of Tesseract's data output.
fn word_from_row(row: &Data) -> Option<OcrWord> {
    if row.level != 5 {
        return None;
    }
    let extent = |v: i32| u32::try_from(v).ok();
    let index = |v: i32| u32::try_from(v).unwrap_or_default();
    Some(OcrWord {
        text: row.text.clone(),
        confidence: row.conf,
        bbox: Rect::new(row.left, row.top, extent(row.width)?, extent(row.height)?),
        line: LineId {
            block: index(row.block_num),
            paragraph: index(row.par_num),
            line: index(row.line_num),
        },
    })
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Canned OCR output, optionally failing.
    pub(crate) struct ScriptedOcr {
        words: Vec<OcrWord>,
        fail: bool,
        calls: AtomicUsize,
    }

    impl ScriptedOcr {
        pub(crate) fn new(words: Vec<OcrWord>) -> Self {
            Self {
                words,
                fail: false,
                calls: AtomicUsize::new(0),
            }
        }

        pub(crate) fn failing() -> Self {
            Self {
                words: Vec::new(),
                fail: true,
                calls: AtomicUsize::new(0),
            }
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl OcrBackend for ScriptedOcr {
        fn name(&self) -> &str {
            "scripted"
        }

        fn recognize(&self, _image: &GrayImage) -> Result<Vec<OcrWord>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(EngineError::TextDetector("scripted OCR failure".into()));
            }
            Ok(self.words.clone())
        }
    }

    impl OcrBackend for std::sync::Arc<ScriptedOcr> {
        fn name(&self) -> &str {
            "scripted"
        }

        fn recognize(&self, image: &GrayImage) -> Result<Vec<OcrWord>> {
            self.as_ref().recognize(image)
        }
    }

    /// A word on line `line` of block 1.
    pub(crate) fn word(text: &str, confidence: f32, bbox: Rect, line: u32) -> OcrWord {
        OcrWord {
            text: text.to_string(),
            confidence,
            bbox,
            line: LineId {
                block: 1,
                paragraph: 1,
                line,
            },
        }
    }
}
