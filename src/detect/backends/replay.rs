//! Replay backend: serves detections recorded by an external
//! detection/tracking process.
//!
//! The file is JSON lines, one frame per line:
//!
//! ```text
//! {"camera_id": 0, "frame": 12, "detections": [
//!     {"bbox": [x, y, w, h], "label": "person", "confidence": 0.91, "track_id": 4}
//! ]}
//! ```
//!
//! Lines without `camera_id` apply to every camera. Frames with no line
//! yield no detections.

use std::collections::HashMap;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{ClassMap, Detection};
use crate::error::PipelineError;
use crate::frame::Frame;
use crate::geometry::BBox;
use crate::{CameraId, TrackId};

#[derive(Debug, Deserialize)]
struct ReplayLine {
    camera_id: Option<CameraId>,
    frame: u64,
    #[serde(default)]
    detections: Vec<ReplayDetection>,
}

#[derive(Debug, Deserialize)]
struct ReplayDetection {
    bbox: [f32; 4],
    label: String,
    confidence: f32,
    track_id: Option<TrackId>,
}

pub struct ReplayBackend {
    frames: HashMap<u64, Vec<Detection>>,
}

impl ReplayBackend {
    pub fn open(path: impl AsRef<Path>, camera_id: CameraId, classes: &ClassMap) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path).map_err(|e| {
            PipelineError::config(format!(
                "failed to open replay file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_reader(BufReader::new(file), camera_id, classes)
            .with_context(|| format!("replay file {}", path.display()))
    }

    pub fn from_reader<R: BufRead>(
        reader: R,
        camera_id: CameraId,
        classes: &ClassMap,
    ) -> Result<Self> {
        let mut frames: HashMap<u64, Vec<Detection>> = HashMap::new();
        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let parsed: ReplayLine = serde_json::from_str(trimmed).map_err(|e| {
                PipelineError::config(format!("line {}: invalid replay record: {}", idx + 1, e))
            })?;
            if parsed.camera_id.is_some_and(|id| id != camera_id) {
                continue;
            }
            let entry = frames.entry(parsed.frame).or_default();
            for det in parsed.detections {
                let [x, y, w, h] = det.bbox;
                entry.push(Detection {
                    bbox: BBox::new(x, y, w, h),
                    class: classes.classify(&det.label),
                    label: det.label,
                    confidence: det.confidence,
                    track_id: det.track_id,
                });
            }
        }
        log::debug!(
            "replay backend loaded {} frames for camera {}",
            frames.len(),
            camera_id
        );
        Ok(Self { frames })
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }
}

impl DetectorBackend for ReplayBackend {
    fn name(&self) -> &'static str {
        "replay"
    }

    fn detect_and_track(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let detections = self.frames.remove(&frame.seq).unwrap_or_default();
        if detections.iter().any(|d| !d.confidence.is_finite()) {
            return Err(anyhow!("replay frame {} has a non-finite confidence", frame.seq));
        }
        Ok(detections)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::result::ObjectClass;
    use std::io::Cursor;

    const LINES: &str = r#"
{"camera_id": 0, "frame": 1, "detections": [{"bbox": [1, 2, 30, 60], "label": "person", "confidence": 0.9, "track_id": 7}]}
{"camera_id": 1, "frame": 1, "detections": [{"bbox": [5, 5, 5, 5], "label": "helmet", "confidence": 0.8, "track_id": null}]}
{"frame": 2, "detections": [{"bbox": [0, 0, 4, 4], "label": "hardhat", "confidence": 0.7, "track_id": 3}]}
"#;

    #[test]
    fn replay_filters_by_camera_and_maps_labels() {
        let mut backend =
            ReplayBackend::from_reader(Cursor::new(LINES), 0, &ClassMap::default()).unwrap();
        assert_eq!(backend.frame_count(), 2);

        let f1 = backend.detect_and_track(&Frame::blank(0, 1, 64, 64, 0)).unwrap();
        assert_eq!(f1.len(), 1);
        assert_eq!(f1[0].class, ObjectClass::Person);
        assert_eq!(f1[0].track_id, Some(7));

        let f2 = backend.detect_and_track(&Frame::blank(0, 2, 64, 64, 0)).unwrap();
        assert_eq!(f2[0].class, ObjectClass::Helmet);

        let f3 = backend.detect_and_track(&Frame::blank(0, 3, 64, 64, 0)).unwrap();
        assert!(f3.is_empty());
    }

    #[test]
    fn malformed_line_is_a_configuration_error() {
        let err = ReplayBackend::from_reader(
            Cursor::new("{\"frame\": \"one\"}\n"),
            0,
            &ClassMap::default(),
        )
        .err()
        .unwrap();
        assert!(format!("{:#}", err).contains("line 1"));
    }
}
