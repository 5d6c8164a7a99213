//! Captured frames and the sources that produce them.
//!
//! A [`Frame`] is an RGBA raster plus the screen position of its top-left
//! pixel. Detectors work in frame-local pixels; results are translated to
//! screen coordinates through [`Frame::to_screen`] so input lands on the
//! right spot even when the frame is a crop of a window.
//!
//! # Change Detection
//!
//! [`Frame::content_hash`] is an FNV-1a hash over the raw pixels. Comparing
//! hashes before and after an input is how the executor decides whether
//! the UI reacted:
//!
//! ```ignore
//! if after.content_hash() == before.content_hash() {
//!     // nothing changed on screen
//! }
//! ```

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use image::{GrayImage, RgbaImage};

use crate::error::{EngineError, Result};
use crate::geometry::{Point, Rect};

/// A captured image of (part of) the screen.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    image: RgbaImage,
    origin: Point,
}

impl Frame {
    pub fn new(image: RgbaImage, origin: Point) -> Self {
        Self { image, origin }
    }

    /// A frame whose top-left pixel is the screen origin.
    pub fn from_image(image: RgbaImage) -> Self {
        Self::new(image, Point::default())
    }

    pub fn image(&self) -> &RgbaImage {
        &self.image
    }

    pub fn origin(&self) -> Point {
        self.origin
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Frame extent in frame-local pixels.
    pub fn local_bounds(&self) -> Rect {
        Rect::new(0, 0, self.width(), self.height())
    }

    /// Frame extent in screen coordinates.
    pub fn bounds(&self) -> Rect {
        Rect::new(self.origin.x, self.origin.y, self.width(), self.height())
    }

    /// Translate a frame-local rectangle to screen coordinates.
    pub fn to_screen(&self, local: Rect) -> Rect {
        local.translate(self.origin.x, self.origin.y)
    }

    /// Crop to a frame-local region.
    ///
    /// The region is clamped to the frame. The resulting frame's origin is
    /// moved so screen coordinates stay correct.
    pub fn crop(&self, region: &Rect) -> Result<Frame> {
        let clamped = region
            .clamp_to(&self.local_bounds())
            .ok_or_else(|| EngineError::Coordinate {
                point: Point::new(region.x, region.y),
                reason: format!(
                    "region {} lies outside the {}x{} frame",
                    region,
                    self.width(),
                    self.height()
                ),
            })?;

        let cropped = image::imageops::crop_imm(
            &self.image,
            clamped.x as u32,
            clamped.y as u32,
            clamped.width,
            clamped.height,
        )
        .to_image();

        Ok(Frame {
            image: cropped,
            origin: self.origin.offset(Point::new(clamped.x, clamped.y)),
        })
    }

    pub fn to_luma(&self) -> GrayImage {
        image::imageops::grayscale(&self.image)
    }

    /// FNV-1a hash over the raw pixel bytes and dimensions.
    pub fn content_hash(&self) -> u64 {
        const FNV_OFFSET: u64 = 0xcbf29ce484222325;
        const FNV_PRIME: u64 = 0x00000100000001B3;

        let mut hash = FNV_OFFSET;
        let dims = [self.width().to_le_bytes(), self.height().to_le_bytes()];
        for byte in dims.iter().flatten().chain(self.image.as_raw().iter()) {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(FNV_PRIME);
        }
        hash
    }
}

/// Supplies frames on demand.
///
/// Implementations are blocking; the executor calls them from a blocking
/// task.
pub trait FrameSource: Send + Sync {
    fn capture(&self) -> Result<Frame>;

    /// Short human-readable description for logs.
    fn describe(&self) -> String;
}

/// In-memory frames, served in order.
///
/// The last frame repeats forever once the queue drains. Optionally fails
/// the first `n` captures, which is useful for exercising capture recovery.
#[derive(Debug)]
pub struct StaticFrameSource {
    frames: Mutex<VecDeque<Frame>>,
    failures_remaining: AtomicUsize,
}

impl StaticFrameSource {
    pub fn new(frame: Frame) -> Self {
        Self::sequence(vec![frame])
    }

    pub fn sequence(frames: Vec<Frame>) -> Self {
        Self {
            frames: Mutex::new(frames.into()),
            failures_remaining: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn with_failures(self, count: usize) -> Self {
        self.failures_remaining.store(count, Ordering::SeqCst);
        self
    }
}

impl FrameSource for StaticFrameSource {
    fn capture(&self) -> Result<Frame> {
        let failing = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(EngineError::Capture("simulated capture failure".into()));
        }

        let mut frames = self.frames.lock().unwrap_or_else(PoisonError::into_inner);
        if frames.len() > 1 {
            if let Some(frame) = frames.pop_front() {
                return Ok(frame);
            }
        }
        frames
            .front()
            .cloned()
            .ok_or_else(|| EngineError::Capture("no frames queued".into()))
    }

    fn describe(&self) -> String {
        "static frames".to_string()
    }
}

/// Re-reads an image file on every capture.
#[derive(Debug, Clone)]
pub struct ImageFileSource {
    path: PathBuf,
    origin: Point,
}

impl ImageFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            origin: Point::default(),
        }
    }

    /// Screen position of the image's top-left pixel.
    #[must_use]
    pub fn with_origin(mut self, origin: Point) -> Self {
        self.origin = origin;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl FrameSource for ImageFileSource {
    fn capture(&self) -> Result<Frame> {
        let image = image::open(&self.path).map_err(|e| {
            EngineError::Capture(format!("failed to read {}: {}", self.path.display(), e))
        })?;
        Ok(Frame::new(image.to_rgba8(), self.origin))
    }

    fn describe(&self) -> String {
        format!("file {}", self.path.display())
    }
}

#[cfg(feature = "capture")]
pub use live::ScreenCapture;

#[cfg(feature = "capture")]
mod live {
    use super::*;

    /// Live capture of the primary monitor or of one window.
    #[derive(Debug, Clone, Default)]
    pub struct ScreenCapture {
        window_title: Option<String>,
    }

    impl ScreenCapture {
        pub fn primary_monitor() -> Self {
            Self { window_title: None }
        }

        /// Capture the first visible window whose title contains `title`
        /// (case-insensitive).
        pub fn window(title: impl Into<String>) -> Self {
            Self {
                window_title: Some(title.into()),
            }
        }

        fn capture_window(title: &str) -> Result<Frame> {
            let wanted = title.to_lowercase();
            let windows = xcap::Window::all().map_err(|e| EngineError::Capture(e.to_string()))?;

            for window in windows {
                let Ok(window_title) = window.title() else {
                    continue;
                };
                if !window_title.to_lowercase().contains(&wanted) {
                    continue;
                }
                if window.is_minimized().unwrap_or(false) {
                    return Err(EngineError::Capture(format!(
                        "window '{}' is minimized",
                        window_title
                    )));
                }
                let origin = Point::new(
                    window.x().map_err(|e| EngineError::Capture(e.to_string()))?,
                    window.y().map_err(|e| EngineError::Capture(e.to_string()))?,
                );
                let captured = window
                    .capture_image()
                    .map_err(|e| EngineError::Capture(e.to_string()))?;
                return into_frame(captured.width(), captured.height(), captured.into_raw(), origin);
            }

            Err(EngineError::Capture(format!(
                "no window with title containing '{}'",
                title
            )))
        }

        fn capture_primary() -> Result<Frame> {
            let monitors = xcap::Monitor::all().map_err(|e| EngineError::Capture(e.to_string()))?;
            let monitor = monitors
                .into_iter()
                .find(|m| m.is_primary().unwrap_or(false))
                .ok_or_else(|| EngineError::Capture("no primary monitor".into()))?;
            let origin = Point::new(
                monitor.x().map_err(|e| EngineError::Capture(e.to_string()))?,
                monitor.y().map_err(|e| EngineError::Capture(e.to_string()))?,
            );
            let captured = monitor
                .capture_image()
                .map_err(|e| EngineError::Capture(e.to_string()))?;
            into_frame(captured.width(), captured.height(), captured.into_raw(), origin)
        }
    }

    // xcap re-exports its own `image` version; go through raw bytes.
    fn into_frame(width: u32, height: u32, raw: Vec<u8>, origin: Point) -> Result<Frame> {
        if width == 0 || height == 0 {
            return Err(EngineError::Capture("captured an empty image".into()));
        }
        let image = RgbaImage::from_raw(width, height, raw)
            .ok_or_else(|| EngineError::Capture("capture buffer has the wrong size".into()))?;
        Ok(Frame::new(image, origin))
    }

    impl FrameSource for ScreenCapture {
        fn capture(&self) -> Result<Frame> {
            match &self.window_title {
                Some(title) => Self::capture_window(title),
                None => Self::capture_primary(),
            }
        }

        fn describe(&self) -> String {
            match &self.window_title {
                Some(title) => format!("window '{}'", title),
                None => "primary monitor".to_string(),
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::Rgba;

    /// Solid white frame with a black rectangle drawn at `rect`.
    pub(crate) fn frame_with_box(width: u32, height: u32, rect: Rect) -> Frame {
        let mut image = RgbaImage::from_pixel(width, height, Rgba([255, 255, 255, 255]));
        for y in rect.y..rect.bottom() as i32 {
            for x in rect.x..rect.right() as i32 {
                if x >= 0 && y >= 0 && (x as u32) < width && (y as u32) < height {
                    image.put_pixel(x as u32, y as u32, Rgba([0, 0, 0, 255]));
                }
            }
        }
        Frame::from_image(image)
    }

    #[test]
    fn crop_moves_origin() {
        let frame = Frame::new(
            RgbaImage::new(100, 80),
            Point::new(1000, 500),
        );
        let cropped = frame.crop(&Rect::new(10, 20, 30, 40)).unwrap();
        assert_eq!(cropped.origin(), Point::new(1010, 520));
        assert_eq!((cropped.width(), cropped.height()), (30, 40));
        assert_eq!(
            cropped.to_screen(Rect::new(0, 0, 5, 5)),
            Rect::new(1010, 520, 5, 5)
        );
    }

    #[test]
    fn crop_clamps_to_frame() {
        let frame = Frame::from_image(RgbaImage::new(50, 50));
        let cropped = frame.crop(&Rect::new(40, 40, 30, 30)).unwrap();
        assert_eq!((cropped.width(), cropped.height()), (10, 10));
    }

    #[test]
    fn crop_outside_frame_is_coordinate_error() {
        let frame = Frame::from_image(RgbaImage::new(50, 50));
        let err = frame.crop(&Rect::new(60, 0, 10, 10)).unwrap_err();
        assert_eq!(
            err.category(),
            crate::error::ErrorCategory::CoordinateError
        );
    }

    #[test]
    fn content_hash_tracks_pixels() {
        let a = frame_with_box(40, 40, Rect::new(5, 5, 10, 10));
        let b = frame_with_box(40, 40, Rect::new(5, 5, 10, 10));
        let c = frame_with_box(40, 40, Rect::new(6, 5, 10, 10));
        assert_eq!(a.content_hash(), b.content_hash());
        assert_ne!(a.content_hash(), c.content_hash());
    }

    #[test]
    fn content_hash_includes_dimensions() {
        // Same byte count, different shape
        let wide = Frame::from_image(RgbaImage::new(4, 1));
        let tall = Frame::from_image(RgbaImage::new(1, 4));
        assert_ne!(wide.content_hash(), tall.content_hash());
    }

    #[test]
    fn static_source_serves_sequence_then_repeats_last() {
        let first = frame_with_box(10, 10, Rect::new(0, 0, 1, 1));
        let second = frame_with_box(10, 10, Rect::new(5, 5, 1, 1));
        let source = StaticFrameSource::sequence(vec![first.clone(), second.clone()]);

        assert_eq!(source.capture().unwrap(), first);
        assert_eq!(source.capture().unwrap(), second);
        assert_eq!(source.capture().unwrap(), second);
    }

    #[test]
    fn static_source_simulated_failures() {
        let source = StaticFrameSource::new(Frame::from_image(RgbaImage::new(2, 2)))
            .with_failures(2);
        assert!(source.capture().is_err());
        assert!(source.capture().is_err());
        assert!(source.capture().is_ok());
    }

    #[test]
    fn image_file_source_reads_png() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.png");
        RgbaImage::from_pixel(7, 3, Rgba([1, 2, 3, 255]))
            .save(&path)
            .unwrap();

        let source = ImageFileSource::new(&path).with_origin(Point::new(10, 10));
        let frame = source.capture().unwrap();
        assert_eq!((frame.width(), frame.height()), (7, 3));
        assert_eq!(frame.origin(), Point::new(10, 10));
    }

    #[test]
    fn image_file_source_missing_file_is_capture_failure() {
        let source = ImageFileSource::new("/nonexistent/frame.png");
        let err = source.capture().unwrap_err();
        assert_eq!(err.category(), crate::error::ErrorCategory::CaptureFailure);
    }
}
