use anyhow::Result;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{Detection, ObjectClass};
use crate::frame::Frame;
use crate::geometry::BBox;

/// Frames per synthetic walk across the image.
const DEFAULT_WALK_FRAMES: u64 = 120;

/// Stub backend for demos and smoke tests.
///
/// Simulates one worker walking left to right across the frame, over and
/// over. Each walk is a new physical object with a fresh track id. The worker
/// wears a helmet on even-numbered walks only, so both rules fire.
pub struct StubBackend {
    walk_frames: u64,
}

impl StubBackend {
    pub fn new() -> Self {
        Self {
            walk_frames: DEFAULT_WALK_FRAMES,
        }
    }

    pub fn with_walk_frames(mut self, frames: u64) -> Self {
        self.walk_frames = frames.max(2);
        self
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect_and_track(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let width = frame.width() as f32;
        let height = frame.height() as f32;
        let walk = frame.seq / self.walk_frames;
        let step = frame.seq % self.walk_frames;

        let person_w = (width * 0.1).max(4.0);
        let person_h = (height * 0.35).max(8.0);
        let travel = (width - person_w).max(0.0);
        let x = travel * step as f32 / (self.walk_frames - 1) as f32;
        let y = height * 0.85 - person_h;
        let person = BBox::new(x, y, person_w, person_h);
        let track_id = walk + 1;

        let head = BBox::new(
            x + person_w * 0.3,
            y,
            person_w * 0.4,
            person_h * 0.18,
        );

        let mut detections = vec![
            Detection::new(person, ObjectClass::Person, 0.91, Some(track_id)),
            Detection::new(head, ObjectClass::Head, 0.83, Some(track_id + 10_000)),
        ];
        if walk % 2 == 0 {
            let helmet = BBox::new(head.x - 1.0, head.y - 2.0, head.w + 2.0, head.h * 0.7);
            detections.push(Detection::new(
                helmet,
                ObjectClass::Helmet,
                0.87,
                Some(track_id + 20_000),
            ));
        }
        Ok(detections)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_alternates_helmet_between_walks() {
        let mut backend = StubBackend::new().with_walk_frames(10);
        let first = backend.detect_and_track(&Frame::blank(0, 0, 640, 480, 0)).unwrap();
        let second = backend.detect_and_track(&Frame::blank(0, 10, 640, 480, 0)).unwrap();

        assert!(first.iter().any(|d| d.class == ObjectClass::Helmet));
        assert!(!second.iter().any(|d| d.class == ObjectClass::Helmet));

        let first_person = first.iter().find(|d| d.class == ObjectClass::Person).unwrap();
        let second_person = second.iter().find(|d| d.class == ObjectClass::Person).unwrap();
        assert_ne!(first_person.track_id, second_person.track_id);
    }

    #[test]
    fn stub_person_stays_inside_frame() {
        let mut backend = StubBackend::new().with_walk_frames(10);
        for seq in 0..10 {
            let frame = Frame::blank(0, seq, 320, 240, 0);
            for det in backend.detect_and_track(&frame).unwrap() {
                assert!(det.validate().is_ok());
                assert!(det.bbox.right() <= 320.0 + 1.0);
            }
        }
    }
}
