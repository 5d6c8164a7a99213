//! Multi-scale template matching.
//!
//! For every configured scale the template is resized (bilinear) and
//! correlated against the grayscale frame with three metrics (see
//! [`correlate`]). Peaks from every metric and scale are merged and
//! deduplicated with non-maximum suppression.
//!
//! | Stage | Output |
//! |-------|--------|
//! | resize | one template per scale; scales that don't fit are skipped |
//! | coarse | correlation of 2×/4×/8× downscaled frame and template |
//! | refine | full-resolution scores around the best coarse peaks |
//! | peaks | ≤ 64 local maxima per metric and scale above the floor |
//! | NMS | one match per overlapping cluster |
//!
//! Templates too small to survive downscaling skip the coarse stage and
//! are correlated against the whole frame at full resolution.

pub mod correlate;
pub mod library;
pub mod nms;

use std::cell::OnceCell;
use std::collections::HashSet;
use std::sync::{PoisonError, RwLock};

use image::imageops::FilterType;
use image::GrayImage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::TemplateConfig;
use crate::descriptor::{DetectionMethod, ElementDescriptor};
use crate::detection::{Detector, Match};
use crate::error::{EngineError, Result};
use crate::frame::Frame;
use crate::geometry::Rect;
use crate::wait::ensure_active;

use self::correlate::{correlate, Peak, MAX_PEAKS};
use self::library::{TemplateInfo, TemplateLibrary};
use self::nms::non_max_suppression;

/// Downscale factors tried for the coarse stage, largest first.
const PYRAMID_FACTORS: [u32; 3] = [8, 4, 2];

/// Smallest template side (px) worth correlating after downscaling.
const COARSE_MIN_SIDE: u32 = 6;

/// Coarse peaks refined per metric and scale.
const COARSE_CANDIDATES: usize = 16;

/// Coarse scores run below full-resolution ones; the coarse floor is
/// relaxed by this much.
const COARSE_SLACK: f32 = 0.25;

/// Template detector backed by a [`TemplateLibrary`].
#[derive(Debug)]
pub struct TemplateDetector {
    library: RwLock<TemplateLibrary>,
    nms_threshold: f64,
}

/// A grayscale frame plus its downscaled copies, shared across templates.
struct PreparedFrame<'a> {
    frame: &'a Frame,
    gray: GrayImage,
    coarse: [OnceCell<GrayImage>; PYRAMID_FACTORS.len()],
}

impl<'a> PreparedFrame<'a> {
    fn new(frame: &'a Frame) -> Self {
        Self {
            frame,
            gray: frame.to_luma(),
            coarse: Default::default(),
        }
    }

    /// The frame shrunk by `factor`, built on first use.
    fn coarse(&self, factor: u32) -> &GrayImage {
        let slot = PYRAMID_FACTORS
            .iter()
            .position(|&f| f == factor)
            .unwrap_or(PYRAMID_FACTORS.len() - 1);
        self.coarse[slot].get_or_init(|| downscale(&self.gray, factor))
    }
}

/// Largest pyramid factor that keeps the template's smaller side at
/// [`COARSE_MIN_SIDE`] or more; 1 means no coarse stage.
fn pyramid_factor(width: u32, height: u32) -> u32 {
    PYRAMID_FACTORS
        .into_iter()
        .find(|f| width.min(height) / f >= COARSE_MIN_SIDE)
        .unwrap_or(1)
}

fn downscale(image: &GrayImage, factor: u32) -> GrayImage {
    let width = (image.width() / factor).max(1);
    let height = (image.height() / factor).max(1);
    image::imageops::resize(image, width, height, FilterType::Triangle)
}

/// Peaks of every metric over the whole of `frame`, at most
/// [`MAX_PEAKS`] per metric.
fn full_search(frame: &GrayImage, template: &GrayImage, floor: f32) -> Vec<Peak> {
    correlate(frame, template)
        .map(|maps| {
            maps.iter()
                .flat_map(|map| map.peaks(floor, MAX_PEAKS))
                .collect()
        })
        .unwrap_or_default()
}

/// Peaks of every metric for one scaled template, in frame coordinates.
///
/// The template must fit inside the frame.
fn search(
    prepared: &PreparedFrame<'_>,
    template: &GrayImage,
    floor: f32,
    cancel: &CancellationToken,
) -> Result<Vec<Peak>> {
    let factor = pyramid_factor(template.width(), template.height());
    if factor == 1 {
        return Ok(full_search(&prepared.gray, template, floor));
    }

    let coarse_template = downscale(template, factor);
    let Some(coarse_maps) = correlate(prepared.coarse(factor), &coarse_template) else {
        return Ok(full_search(&prepared.gray, template, floor));
    };
    let coarse_floor = (floor - COARSE_SLACK).max(0.0);
    let mut seeds: Vec<(u32, u32)> = coarse_maps
        .iter()
        .flat_map(|map| map.peaks(coarse_floor, COARSE_CANDIDATES))
        .map(|p| (p.x * factor, p.y * factor))
        .collect();
    seeds.sort_unstable();
    seeds.dedup();
    trace!(factor, seeds = seeds.len(), "coarse template pass");

    let (tw, th) = template.dimensions();
    let max_x = prepared.gray.width() - tw;
    let max_y = prepared.gray.height() - th;
    let radius = 2 * factor;

    let mut per_metric: [Vec<Peak>; 3] = Default::default();
    for (sx, sy) in seeds {
        ensure_active(cancel, "template search")?;
        let x0 = sx.saturating_sub(radius).min(max_x);
        let y0 = sy.saturating_sub(radius).min(max_y);
        let x1 = (sx + radius).min(max_x);
        let y1 = (sy + radius).min(max_y);
        let window =
            image::imageops::crop_imm(&prepared.gray, x0, y0, x1 - x0 + tw, y1 - y0 + th)
                .to_image();
        let Some(maps) = correlate(&window, template) else {
            continue;
        };
        for (found, map) in per_metric.iter_mut().zip(&maps) {
            found.extend(map.peaks(floor, MAX_PEAKS).into_iter().map(|p| Peak {
                x: p.x + x0,
                y: p.y + y0,
                score: p.score,
            }));
        }
    }

    // Overlapping windows report the same placement more than once
    Ok(per_metric
        .into_iter()
        .flat_map(|mut found| {
            found.sort_by(|a, b| b.score.total_cmp(&a.score));
            let mut seen = HashSet::new();
            found.retain(|p| seen.insert((p.x, p.y)));
            found.truncate(MAX_PEAKS);
            found
        })
        .collect())
}

impl TemplateDetector {
    pub fn new(library: TemplateLibrary, config: &TemplateConfig) -> Self {
        Self {
            library: RwLock::new(library),
            nms_threshold: config.nms_threshold,
        }
    }

    pub fn load(config: &TemplateConfig) -> Result<Self> {
        Ok(Self::new(TemplateLibrary::load(config)?, config))
    }

    /// Find `name` in `frame`, keeping candidates at or above `floor`
    /// (the template's own threshold when `None`).
    pub fn find_template(
        &self,
        frame: &Frame,
        name: &str,
        floor: Option<f32>,
    ) -> Result<Vec<Match>> {
        let prepared = PreparedFrame::new(frame);
        self.find_prepared(&prepared, name, floor, &CancellationToken::new())
    }

    fn find_prepared(
        &self,
        prepared: &PreparedFrame<'_>,
        name: &str,
        floor: Option<f32>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Match>> {
        let matches = {
            let library = self.library.read().unwrap_or_else(PoisonError::into_inner);
            let template = library.get(name).ok_or_else(|| {
                EngineError::TemplateDetector(format!(
                    "template '{}' is not in the library",
                    name
                ))
            })?;
            let floor = floor.unwrap_or(template.confidence_threshold);

            let mut candidates = Vec::new();
            for &scale in &template.scale_factors {
                ensure_active(cancel, "template search")?;
                let width = (template.image.width() as f32 * scale).round() as u32;
                let height = (template.image.height() as f32 * scale).round() as u32;
                if width == 0
                    || height == 0
                    || width > prepared.gray.width()
                    || height > prepared.gray.height()
                {
                    trace!(template = name, scale, "scaled template does not fit, skipping");
                    continue;
                }

                let scaled = if (scale - 1.0).abs() < f32::EPSILON {
                    template.image.clone()
                } else {
                    image::imageops::resize(&template.image, width, height, FilterType::Triangle)
                };

                for peak in search(prepared, &scaled, floor, cancel)? {
                    let local = Rect::new(peak.x as i32, peak.y as i32, width, height);
                    candidates.push(
                        Match::new(
                            DetectionMethod::Template,
                            peak.score,
                            prepared.frame.to_screen(local),
                            name,
                        )
                        .with_scale(scale),
                    );
                }
            }
            non_max_suppression(candidates, self.nms_threshold)
        };

        debug!(template = name, matches = matches.len(), "template search finished");
        self.library
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .record_usage(name, !matches.is_empty());
        Ok(matches)
    }

    pub fn list(&self) -> Vec<TemplateInfo> {
        self.library
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .list()
    }

    pub fn len(&self) -> usize {
        self.library
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Store a frame region as a new template.
    pub fn capture_template(
        &self,
        name: &str,
        frame: &Frame,
        region: &Rect,
        description: &str,
    ) -> Result<TemplateInfo> {
        self.library
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .capture(name, frame, region, description)
    }

    pub fn reload(&self) -> Result<()> {
        self.library
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .reload()
    }
}

impl Detector for TemplateDetector {
    fn method(&self) -> DetectionMethod {
        DetectionMethod::Template
    }

    /// Candidates for every template the descriptor names.
    ///
    /// The floor is the lower of the template's and the descriptor's
    /// threshold, so a relaxed descriptor also relaxes template search.
    fn detect(
        &self,
        frame: &Frame,
        descriptor: &ElementDescriptor,
        cancel: &CancellationToken,
    ) -> Result<Vec<Match>> {
        let prepared = PreparedFrame::new(frame);
        let mut all = Vec::new();
        for name in descriptor.template_names() {
            let own = {
                let library = self.library.read().unwrap_or_else(PoisonError::into_inner);
                library.get(name).map(|t| t.confidence_threshold)
            };
            let floor = own.map(|t| t.min(descriptor.confidence_threshold()));
            all.extend(self.find_prepared(&prepared, name, floor, cancel)?);
        }
        Ok(non_max_suppression(all, self.nms_threshold))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;
    use crate::geometry::Point;
    use image::{Luma, Rgba, RgbaImage};
    use std::path::Path;

    fn pattern() -> GrayImage {
        GrayImage::from_fn(10, 8, |x, y| {
            Luma([if (x / 2 + y / 2) % 2 == 0 { 240 } else { 30 }])
        })
    }

    /// Frame with `pattern()` pasted at `at`, on a soft gradient.
    fn frame_with_pattern(at: (u32, u32)) -> Frame {
        let tpl = pattern();
        let mut image = RgbaImage::from_fn(60, 40, |x, y| {
            let v = (100 + (x + y) % 40) as u8;
            Rgba([v, v, v, 255])
        });
        for y in 0..tpl.height() {
            for x in 0..tpl.width() {
                let v = tpl.get_pixel(x, y)[0];
                image.put_pixel(at.0 + x, at.1 + y, Rgba([v, v, v, 255]));
            }
        }
        Frame::new(image, Point::new(1000, 500))
    }

    fn detector_in(dir: &Path) -> TemplateDetector {
        pattern().save(dir.join("checker.png")).unwrap();
        let config = TemplateConfig {
            template_directory: dir.to_path_buf(),
            ..TemplateConfig::default()
        };
        TemplateDetector::load(&config).unwrap()
    }

    #[test]
    fn finds_template_in_screen_coordinates() {
        let dir = tempfile::tempdir().unwrap();
        let detector = detector_in(dir.path());
        let frame = frame_with_pattern((25, 12));

        let matches = detector.find_template(&frame, "checker", None).unwrap();
        let best = &matches[0];
        assert_eq!(best.bounding_box, Rect::new(1025, 512, 10, 8));
        assert_eq!(best.scale_factor, Some(1.0));
        assert!(best.confidence > 0.99);
        assert_eq!(best.label, "checker");
    }

    #[test]
    fn overlapping_candidates_are_suppressed() {
        let dir = tempfile::tempdir().unwrap();
        let detector = detector_in(dir.path());
        let frame = frame_with_pattern((25, 12));

        let matches = detector.find_template(&frame, "checker", Some(0.6)).unwrap();
        for (i, a) in matches.iter().enumerate() {
            for b in &matches[i + 1..] {
                assert!(a.bounding_box.iou(&b.bounding_box) <= 0.3);
            }
        }
    }

    #[test]
    fn unknown_template_is_detector_error() {
        let dir = tempfile::tempdir().unwrap();
        let detector = detector_in(dir.path());
        let frame = frame_with_pattern((0, 0));
        let err = detector.find_template(&frame, "missing", None).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::TemplateDetectorError);
    }

    #[test]
    fn oversized_scales_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let detector = detector_in(dir.path());
        // Frame exactly template-sized: only scales <= 1.0 fit
        let frame = Frame::from_image(
            image::DynamicImage::ImageLuma8(pattern()).to_rgba8(),
        );
        let matches = detector.find_template(&frame, "checker", None).unwrap();
        assert!(matches.iter().all(|m| m.scale_factor.unwrap_or(0.0) <= 1.0));
        assert!(!matches.is_empty());
    }

    /// 48×24 two-tone checker with 12px cells.
    fn button() -> GrayImage {
        GrayImage::from_fn(48, 24, |x, y| {
            Luma([if (x / 12 + y / 12) % 2 == 0 { 230 } else { 25 }])
        })
    }

    /// 1280×720 noisy desktop with `button()` pasted at `at`.
    fn desktop_with_button(at: (u32, u32)) -> Frame {
        let tpl = button();
        let mut image = RgbaImage::from_fn(1280, 720, |x, y| {
            let h = x.wrapping_mul(2_654_435_761) ^ y.wrapping_mul(40_503);
            let v = (60 + (h >> 7) % 140) as u8;
            Rgba([v, v, v, 255])
        });
        for y in 0..tpl.height() {
            for x in 0..tpl.width() {
                let v = tpl.get_pixel(x, y)[0];
                image.put_pixel(at.0 + x, at.1 + y, Rgba([v, v, v, 255]));
            }
        }
        Frame::from_image(image)
    }

    #[test]
    fn pyramid_factor_keeps_templates_legible() {
        assert_eq!(pyramid_factor(10, 8), 1);
        assert_eq!(pyramid_factor(48, 24), 4);
        assert_eq!(pyramid_factor(38, 19), 2);
        assert_eq!(pyramid_factor(200, 120), 8);
    }

    #[test]
    fn large_frame_search_finishes_well_inside_action_timeout() {
        let dir = tempfile::tempdir().unwrap();
        button().save(dir.path().join("button.png")).unwrap();
        let config = TemplateConfig {
            template_directory: dir.path().to_path_buf(),
            ..TemplateConfig::default()
        };
        let detector = TemplateDetector::load(&config).unwrap();
        let frame = desktop_with_button((702, 413));

        let start = std::time::Instant::now();
        let matches = detector.find_template(&frame, "button", None).unwrap();
        let elapsed = start.elapsed();

        assert!(
            elapsed < crate::action::DEFAULT_ACTION_TIMEOUT / 2,
            "five-scale search on 1280x720 took {:?}",
            elapsed
        );
        let best = &matches[0];
        assert_eq!(best.bounding_box, Rect::new(702, 413, 48, 24));
        assert_eq!(best.scale_factor, Some(1.0));
        assert!(best.confidence > 0.99);
    }

    #[test]
    fn cancelled_search_is_a_timeout_and_records_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let detector = detector_in(dir.path());
        let frame = frame_with_pattern((5, 5));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let descriptor = ElementDescriptor::new("checker").template("checker");
        let err = detector.detect(&frame, &descriptor, &cancel).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Timeout);
        assert_eq!(detector.list()[0].usage_count, 0);
    }

    #[test]
    fn detection_updates_usage_statistics() {
        let dir = tempfile::tempdir().unwrap();
        let detector = detector_in(dir.path());
        let frame = frame_with_pattern((5, 5));

        let descriptor = ElementDescriptor::new("checker").template("checker");
        detector
            .detect(&frame, &descriptor, &CancellationToken::new())
            .unwrap();

        let info = detector.list().into_iter().next().unwrap();
        assert_eq!(info.usage_count, 1);
        assert_eq!(info.success_rate, 1.0);
    }
}
