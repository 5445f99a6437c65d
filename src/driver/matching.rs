// Template search over rendered screens

use std::path::Path;

use image::RgbImage;

use crate::driver::DriverError;

/// Load a template image from disk as RGB
pub fn load_template(path: &Path) -> Result<RgbImage, DriverError> {
    image::open(path)
        .map(|img| img.to_rgb8())
        .map_err(|e| DriverError::Template {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
}

/// Similarity of `template` placed at (`ox`, `oy`) in `haystack`, in [0, 1].
/// Stops early once the score can no longer reach `floor`.
fn score_at(haystack: &RgbImage, template: &RgbImage, ox: u32, oy: u32, floor: f64) -> f64 {
    let total = f64::from(template.width() * template.height() * 3) * 255.0;
    let budget = (1.0 - floor) * total;
    let mut diff = 0.0;
    for ty in 0..template.height() {
        for tx in 0..template.width() {
            let a = haystack.get_pixel(ox + tx, oy + ty).0;
            let b = template.get_pixel(tx, ty).0;
            diff += a
                .iter()
                .zip(b.iter())
                .map(|(x, y)| f64::from(x.abs_diff(*y)))
                .sum::<f64>();
        }
        if diff > budget {
            return 0.0;
        }
    }
    1.0 - diff / total
}

/// Best placement of `template` scoring at least `confidence`, as the centre
/// of the matched region.
pub fn find_template(haystack: &RgbImage, template: &RgbImage, confidence: f64) -> Option<(i32, i32)> {
    let (tw, th) = template.dimensions();
    if tw == 0 || th == 0 || tw > haystack.width() || th > haystack.height() {
        return None;
    }

    let mut best: Option<(f64, u32, u32)> = None;
    for oy in 0..=haystack.height() - th {
        for ox in 0..=haystack.width() - tw {
            let floor = best.map_or(confidence, |(s, _, _)| s.max(confidence));
            let score = score_at(haystack, template, ox, oy, floor);
            if score >= floor && best.is_none_or(|(s, _, _)| score > s) {
                best = Some((score, ox, oy));
                if score >= 1.0 {
                    break;
                }
            }
        }
        if matches!(best, Some((s, _, _)) if s >= 1.0) {
            break;
        }
    }

    best.map(|(_, x, y)| ((x + tw / 2) as i32, (y + th / 2) as i32))
}
