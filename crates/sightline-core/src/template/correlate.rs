//! Normalized template correlation.
//!
//! Three metrics are derived for every template placement:
//!
//! | Metric | Formula | Reported as |
//! |--------|---------|-------------|
//! | `ccoeff_normed` | Σ(T−T̄)(I−Ī) / √(Σ(T−T̄)² · Σ(I−Ī)²) | clamped to 0..1 |
//! | `ccorr_normed` | ΣTI / √(ΣT² · ΣI²) | as is |
//! | `sqdiff_normed` | Σ(T−I)² / √(ΣT² · ΣI²) | `1 − d`, clamped |
//!
//! The cross term ΣTI is the only per-placement sum over the template; it
//! comes from `imageproc`'s cross-correlation. Window sums of I and I² come
//! from integral images, and every metric expands into those three sums:
//! Σ(T−T̄)I = ΣTI − T̄·ΣI and Σ(T−I)² = ΣT² − 2ΣTI + ΣI².

use image::{GrayImage, ImageBuffer, Luma};
use imageproc::definitions::Image;
use imageproc::integral_image::{integral_image, integral_squared_image};
use imageproc::template_matching::{find_extremes, match_template_parallel, MatchTemplateMethod};

/// Maximum candidates reported per metric and scale.
pub const MAX_PEAKS: usize = 64;

const EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Metric {
    CcoeffNormed,
    CcorrNormed,
    SqdiffNormed,
}

impl Metric {
    pub const ALL: [Metric; 3] = [
        Metric::CcoeffNormed,
        Metric::CcorrNormed,
        Metric::SqdiffNormed,
    ];
}

/// Similarity (0.0 - 1.0) for every placement of the template's top-left
/// corner.
#[derive(Debug, Clone)]
pub struct ScoreMap(Image<Luma<f32>>);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Peak {
    pub x: u32,
    pub y: u32,
    pub score: f32,
}

impl ScoreMap {
    fn new(width: u32, height: u32) -> Self {
        Self(ImageBuffer::new(width, height))
    }

    pub fn width(&self) -> u32 {
        self.0.width()
    }

    pub fn height(&self) -> u32 {
        self.0.height()
    }

    pub fn get(&self, x: u32, y: u32) -> f32 {
        self.0.get_pixel(x, y)[0]
    }

    fn set(&mut self, x: u32, y: u32, score: f32) {
        self.0.put_pixel(x, y, Luma([score]));
    }

    /// Best score and where it is.
    pub fn best(&self) -> Peak {
        let extremes = find_extremes(&self.0);
        let (x, y) = extremes.max_value_location;
        Peak {
            x,
            y,
            score: extremes.max_value,
        }
    }

    /// Local maxima at or above `threshold`, best first, at most `limit`.
    ///
    /// A plateau yields one peak: a placement must beat the neighbors
    /// before it in raster order and tie-or-beat those after it.
    pub fn peaks(&self, threshold: f32, limit: usize) -> Vec<Peak> {
        let mut peaks = Vec::new();
        if self.best().score < threshold {
            return peaks;
        }
        for y in 0..self.height() {
            for x in 0..self.width() {
                let score = self.get(x, y);
                if score < threshold {
                    continue;
                }
                if self.is_local_max(x, y, score) {
                    peaks.push(Peak { x, y, score });
                }
            }
        }
        peaks.sort_by(|a, b| b.score.total_cmp(&a.score));
        peaks.truncate(limit);
        peaks
    }

    fn is_local_max(&self, x: u32, y: u32, score: f32) -> bool {
        for dy in -1i64..=1 {
            for dx in -1i64..=1 {
                if dx == 0 && dy == 0 {
                    continue;
                }
                let nx = i64::from(x) + dx;
                let ny = i64::from(y) + dy;
                if nx < 0
                    || ny < 0
                    || nx >= i64::from(self.width())
                    || ny >= i64::from(self.height())
                {
                    continue;
                }
                let neighbor = self.get(nx as u32, ny as u32);
                let before = dy < 0 || (dy == 0 && dx < 0);
                if neighbor > score || (before && neighbor >= score) {
                    return false;
                }
            }
        }
        true
    }
}

/// Sums of a template's pixels.
struct TemplateStats {
    n: f64,
    sum: f64,
    sum_sq: f64,
    zero_mean_sq: f64,
}

impl TemplateStats {
    fn new(template: &GrayImage) -> Self {
        let n = f64::from(template.width()) * f64::from(template.height());
        let (sum, sum_sq) = template.pixels().fold((0.0, 0.0), |(s, sq), p| {
            let v = f64::from(p[0]);
            (s + v, sq + v * v)
        });
        Self {
            n,
            sum,
            sum_sq,
            zero_mean_sq: (sum_sq - sum * sum / n).max(0.0),
        }
    }

    fn mean(&self) -> f64 {
        self.sum / self.n
    }
}

/// Summed-area tables of a frame's pixels and squared pixels.
struct WindowSums {
    sum: Image<Luma<u64>>,
    sum_sq: Image<Luma<u64>>,
}

impl WindowSums {
    fn new(frame: &GrayImage) -> Self {
        Self {
            sum: integral_image::<_, u64>(frame),
            sum_sq: integral_squared_image::<_, u64>(frame),
        }
    }

    /// Sum over the `w`×`h` window at (x, y). Tables carry a leading zero
    /// row and column.
    fn window(table: &Image<Luma<u64>>, x: u32, y: u32, w: u32, h: u32) -> f64 {
        let at = |x, y| table.get_pixel(x, y)[0];
        let total = at(x + w, y + h) + at(x, y) - at(x, y + h) - at(x + w, y);
        total as f64
    }
}

/// Score every placement of `template` inside `frame` with all three
/// metrics, in [`Metric::ALL`] order.
///
/// Returns `None` when the template is empty or larger than the frame.
pub fn correlate(frame: &GrayImage, template: &GrayImage) -> Option<[ScoreMap; 3]> {
    let (fw, fh) = frame.dimensions();
    let (tw, th) = template.dimensions();
    if tw == 0 || th == 0 || tw > fw || th > fh {
        return None;
    }

    let stats = TemplateStats::new(template);
    let sums = WindowSums::new(frame);
    let cross_map = match_template_parallel(frame, template, MatchTemplateMethod::CrossCorrelation);

    let (out_w, out_h) = (fw - tw + 1, fh - th + 1);
    let mut ccoeff = ScoreMap::new(out_w, out_h);
    let mut ccorr = ScoreMap::new(out_w, out_h);
    let mut sqdiff = ScoreMap::new(out_w, out_h);

    for oy in 0..out_h {
        for ox in 0..out_w {
            let cross = f64::from(cross_map.get_pixel(ox, oy)[0]);
            let sum_i = WindowSums::window(&sums.sum, ox, oy, tw, th);
            let sum_i2 = WindowSums::window(&sums.sum_sq, ox, oy, tw, th);
            let norm = (stats.sum_sq * sum_i2).sqrt();
            let both_black = stats.sum_sq <= EPSILON && sum_i2 <= EPSILON;

            let ccorr_score = if norm > EPSILON {
                cross / norm
            } else if both_black {
                1.0
            } else {
                0.0
            };

            let var_i = (sum_i2 - sum_i * sum_i / stats.n).max(0.0);
            let zm_norm = (stats.zero_mean_sq * var_i).sqrt();
            let ccoeff_score = if zm_norm > EPSILON {
                (cross - stats.mean() * sum_i) / zm_norm
            } else {
                0.0
            };

            let sqdiff_score = if norm > EPSILON {
                1.0 - (stats.sum_sq - 2.0 * cross + sum_i2) / norm
            } else if both_black {
                1.0
            } else {
                0.0
            };

            ccoeff.set(ox, oy, clamp_score(ccoeff_score));
            ccorr.set(ox, oy, clamp_score(ccorr_score));
            sqdiff.set(ox, oy, clamp_score(sqdiff_score));
        }
    }

    Some([ccoeff, ccorr, sqdiff])
}

fn clamp_score(score: f64) -> f32 {
    if score.is_finite() {
        score.clamp(0.0, 1.0) as f32
    } else {
        0.0
    }
}
