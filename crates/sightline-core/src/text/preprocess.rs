//! Image cleanup ahead of OCR.

use image::{GrayImage, RgbaImage};
use imageproc::contrast::adaptive_threshold;
use imageproc::distance_transform::Norm;
use imageproc::morphology::close;

use crate::config::PreprocessSteps;

const CONTRAST: f32 = 30.0;
const SHARPEN_SIGMA: f32 = 1.0;
const SHARPEN_THRESHOLD: i32 = 5;
/// Half-size of the adaptive-threshold neighbourhood (15×15 window).
const THRESHOLD_RADIUS: u32 = 7;
/// Chebyshev radius of the closing element (3×3).
const CLOSE_RADIUS: u8 = 1;

/// Both stages of preprocessing: the primary recognizer reads `binary`,
/// the fallback reads `grayscale`.
#[derive(Debug, Clone)]
pub struct Preprocessed {
    pub grayscale: GrayImage,
    pub binary: GrayImage,
}

pub fn preprocess(image: &RgbaImage, enabled: bool, steps: &PreprocessSteps) -> Preprocessed {
    if !enabled {
        let gray = image::imageops::grayscale(image);
        return Preprocessed {
            binary: gray.clone(),
            grayscale: gray,
        };
    }

    let mut working = image.clone();
    if steps.contrast {
        working = image::imageops::contrast(&working, CONTRAST);
    }
    if steps.sharpen {
        working = image::imageops::unsharpen(&working, SHARPEN_SIGMA, SHARPEN_THRESHOLD);
    }
    let grayscale = image::imageops::grayscale(&working);

    let binary = if steps.threshold {
        // Dark text at or below the local mean becomes 0, the rest 255
        let binary = adaptive_threshold(&grayscale, THRESHOLD_RADIUS);
        if steps.morphology {
            close(&binary, Norm::LInf, CLOSE_RADIUS)
        } else {
            binary
        }
    } else {
        grayscale.clone()
    };

    Preprocessed { grayscale, binary }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Luma, Rgba};

    #[test]
    fn threshold_separates_dark_strokes() {
        let mut gray = GrayImage::from_pixel(30, 30, Luma([220]));
        for y in 10..20 {
            gray.put_pixel(15, y, Luma([40]));
        }
        let binary = adaptive_threshold(&gray, THRESHOLD_RADIUS);
        assert_eq!(binary.get_pixel(15, 12)[0], 0);
        assert_eq!(binary.get_pixel(3, 3)[0], 255);
    }

    #[test]
    fn close_fills_single_pixel_holes() {
        let mut image = GrayImage::from_pixel(7, 7, Luma([255]));
        image.put_pixel(3, 3, Luma([0]));
        let closed = close(&image, Norm::LInf, CLOSE_RADIUS);
        assert_eq!(closed.get_pixel(3, 3)[0], 255);
    }

    #[test]
    fn disabled_preprocessing_is_plain_grayscale() {
        let image = RgbaImage::from_pixel(4, 4, Rgba([90, 90, 90, 255]));
        let out = preprocess(&image, false, &PreprocessSteps::default());
        assert_eq!(out.binary, out.grayscale);
        assert_eq!(out.grayscale.get_pixel(0, 0)[0], 90);
    }

    #[test]
    fn morphology_needs_a_thresholded_image() {
        let image = RgbaImage::from_fn(6, 6, |x, _| {
            let v = (x * 40) as u8;
            Rgba([v, v, v, 255])
        });
        let steps = PreprocessSteps {
            contrast: false,
            sharpen: false,
            threshold: false,
            morphology: true,
        };
        let out = preprocess(&image, true, &steps);
        // Gray levels survive untouched
        assert_eq!(out.binary, out.grayscale);
        assert_eq!(out.binary.get_pixel(2, 0)[0], 80);
    }

    #[test]
    fn full_pipeline_yields_binary_image() {
        let mut image = RgbaImage::from_pixel(20, 20, Rgba([230, 230, 230, 255]));
        for x in 5..15 {
            image.put_pixel(x, 10, Rgba([20, 20, 20, 255]));
        }
        let out = preprocess(&image, true, &PreprocessSteps::default());
        assert!(out.binary.pixels().all(|p| p[0] == 0 || p[0] == 255));
        assert_eq!(out.grayscale.dimensions(), (20, 20));
    }
}
