//! Non-maximum suppression over candidate matches.

use crate::detection::{rank, Match};

/// Keep the highest-confidence match of every overlapping cluster.
///
/// Matches are ranked by confidence (stable), then each one is kept only if
/// its IoU with every already-kept match is at most `iou_threshold`. The
/// output is ranked, and running it again returns it unchanged.
pub fn non_max_suppression(mut matches: Vec<Match>, iou_threshold: f64) -> Vec<Match> {
    if matches.len() <= 1 {
        return matches;
    }

    rank(&mut matches);

    let mut kept: Vec<Match> = Vec::with_capacity(matches.len());
    for candidate in matches {
        let suppressed = kept
            .iter()
            .any(|k| k.bounding_box.iou(&candidate.bounding_box) > iou_threshold);
        if !suppressed {
            kept.push(candidate);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::DetectionMethod;
    use crate::geometry::Rect;

    fn tpl(confidence: f32, rect: Rect, scale: f32) -> Match {
        Match::new(DetectionMethod::Template, confidence, rect, "ok_button").with_scale(scale)
    }

    #[test]
    fn overlapping_scales_keep_the_strongest() {
        // Same button found at two scales, boxes overlapping well above 30%
        let at_1_0 = tpl(0.9, Rect::new(100, 100, 100, 40), 1.0);
        let at_1_1 = tpl(0.82, Rect::new(95, 98, 110, 44), 1.1);
        assert!(at_1_0.bounding_box.iou(&at_1_1.bounding_box) > 0.3);

        let kept = non_max_suppression(vec![at_1_1, at_1_0.clone()], 0.3);
        assert_eq!(kept, vec![at_1_0]);
    }

    #[test]
    fn disjoint_matches_all_survive_in_rank_order() {
        let a = tpl(0.85, Rect::new(0, 0, 20, 20), 1.0);
        let b = tpl(0.95, Rect::new(100, 0, 20, 20), 1.0);
        let c = tpl(0.9, Rect::new(0, 100, 20, 20), 1.0);
        let kept = non_max_suppression(vec![a, b, c], 0.3);
        let confidences: Vec<f32> = kept.iter().map(|m| m.confidence).collect();
        assert_eq!(confidences, vec![0.95, 0.9, 0.85]);
    }

    #[test]
    fn suppression_is_idempotent() {
        let input: Vec<Match> = (0..12)
            .map(|i| {
                tpl(
                    0.5 + (i % 5) as f32 * 0.1,
                    Rect::new(i * 7, (i % 3) * 9, 20, 20),
                    1.0,
                )
            })
            .collect();
        let once = non_max_suppression(input, 0.3);
        let twice = non_max_suppression(once.clone(), 0.3);
        assert_eq!(once, twice);
    }

    #[test]
    fn boundary_iou_is_kept() {
        // IoU exactly at the threshold does not suppress
        let a = tpl(0.9, Rect::new(0, 0, 10, 10), 1.0);
        let b = tpl(0.8, Rect::new(5, 0, 10, 10), 1.0);
        let iou = a.bounding_box.iou(&b.bounding_box);
        let kept = non_max_suppression(vec![a, b], iou);
        assert_eq!(kept.len(), 2);
    }
}
