//! Frame overlays.

use image::{Rgb, RgbImage};
use imageproc::drawing::{
    draw_filled_circle_mut, draw_filled_rect_mut, draw_hollow_rect_mut, draw_line_segment_mut,
};
use imageproc::rect::Rect;

use crate::detect::{Detection, ObjectClass};
use crate::geometry::BBox;
use crate::rules::{RuleKind, RuleOutcome};
use crate::worker::WorkerState;
use crate::zones::Zone;

const RED: Rgb<u8> = Rgb([230, 40, 40]);
const GREEN: Rgb<u8> = Rgb([40, 200, 80]);
const YELLOW: Rgb<u8> = Rgb([240, 200, 40]);
const CYAN: Rgb<u8> = Rgb([40, 200, 220]);
const ORANGE: Rgb<u8> = Rgb([250, 140, 20]);
const GREY: Rgb<u8> = Rgb([128, 128, 128]);

const STATUS_BAR_HEIGHT: u32 = 6;

fn state_color(state: WorkerState) -> Rgb<u8> {
    match state {
        WorkerState::Streaming => GREEN,
        WorkerState::Connecting | WorkerState::Reconnecting => ORANGE,
        WorkerState::Disconnected | WorkerState::Stopped => GREY,
    }
}

/// Integer rect clipped to the image, or `None` if nothing is visible.
fn clip(bbox: &BBox, image: &RgbImage) -> Option<Rect> {
    let clipped = bbox.padded_within(0.0, image.width(), image.height());
    let w = clipped.w.round() as u32;
    let h = clipped.h.round() as u32;
    if w == 0 || h == 0 {
        return None;
    }
    Some(Rect::at(clipped.x.round() as i32, clipped.y.round() as i32).of_size(w, h))
}

fn draw_box(image: &mut RgbImage, bbox: &BBox, color: Rgb<u8>) {
    if let Some(rect) = clip(bbox, image) {
        draw_hollow_rect_mut(image, rect, color);
        if rect.width() > 2 && rect.height() > 2 {
            let inner = Rect::at(rect.left() + 1, rect.top() + 1)
                .of_size(rect.width() - 2, rect.height() - 2);
            draw_hollow_rect_mut(image, inner, color);
        }
    }
}

/// Draw zones, detections, verdicts and a state bar onto `image`.
///
/// Persons are red when violating any rule and green otherwise. Detections
/// without a track id are drawn in grey.
pub fn annotate(
    image: &mut RgbImage,
    zones: &[Zone],
    detections: &[Detection],
    outcomes: &[RuleOutcome],
    state: WorkerState,
) {
    for zone in zones {
        for (a, b) in zone.polygon.edges() {
            draw_line_segment_mut(image, (a.x, a.y), (b.x, b.y), YELLOW);
        }
    }

    for det in detections {
        let color = match (det.class, det.track_id) {
            (ObjectClass::Person, Some(track)) => {
                let violating = outcomes.iter().any(|o| o.track_id == track && o.violating);
                if violating {
                    RED
                } else {
                    GREEN
                }
            }
            (ObjectClass::Head, _) => CYAN,
            (ObjectClass::Helmet, _) => YELLOW,
            _ => GREY,
        };
        draw_box(image, &det.bbox, color);
    }

    for outcome in outcomes.iter().filter(|o| o.violating) {
        match outcome.rule {
            RuleKind::DangerZone => {
                if let Some(point) = outcome.evidence.point {
                    let center = (point.x.round() as i32, point.y.round() as i32);
                    draw_filled_circle_mut(image, center, 4, RED);
                }
            }
            RuleKind::NoHelmet => {
                if let Some(head) = &outcome.evidence.head {
                    draw_box(image, head, RED);
                }
            }
        }
    }

    let bar = STATUS_BAR_HEIGHT.min(image.height());
    if bar > 0 && image.width() > 0 {
        draw_filled_rect_mut(image, Rect::at(0, 0).of_size(image.width(), bar), state_color(state));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::Evidence;

    #[test]
    fn violators_are_drawn_red() {
        let mut image = RgbImage::new(64, 64);
        let person =
            Detection::new(BBox::new(10.0, 10.0, 20.0, 40.0), ObjectClass::Person, 0.9, Some(1));
        let outcome = RuleOutcome {
            track_id: 1,
            rule: RuleKind::DangerZone,
            violating: true,
            evidence: Evidence::default(),
        };
        annotate(&mut image, &[], &[person], &[outcome], WorkerState::Streaming);
        assert_eq!(*image.get_pixel(10, 30), RED);
        assert_eq!(*image.get_pixel(0, 0), GREEN);
    }

    #[test]
    fn boxes_outside_the_frame_are_skipped() {
        let mut image = RgbImage::new(16, 16);
        let far = Detection::new(BBox::new(100.0, 100.0, 5.0, 5.0), ObjectClass::Helmet, 0.9, None);
        annotate(&mut image, &[], &[far], &[], WorkerState::Reconnecting);
        assert_eq!(*image.get_pixel(8, 12), Rgb([0, 0, 0]));
    }
}
