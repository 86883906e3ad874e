//! Alert events.
//!
//! An `AlertEvent` is created by a camera worker when the debouncer lets a
//! violation start through, then handed to the alert sink. It is never
//! mutated after that point.

use serde::{Deserialize, Serialize};

use crate::geometry::{BBox, Point};
use crate::rules::{RuleKind, RuleOutcome};
use crate::{CameraId, TrackId};

/// Boxes and measurements backing an alert, persisted as JSON.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AlertDetail {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub person: Option<BBox>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub head: Option<BBox>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub helmet: Option<BBox>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anchor: Option<Point>,
    /// Names of the zones the anchor point fell in.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub zones: Vec<String>,
    pub confidence: f32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub camera_id: CameraId,
    pub rule: RuleKind,
    pub track_id: TrackId,
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
    /// Relative path of the snapshot image, when one is taken.
    pub snapshot_ref: Option<String>,
    pub detail: AlertDetail,
}

impl AlertEvent {
    /// Build the event for a violating outcome. `zone_names` resolves the
    /// outcome's zone indices.
    pub fn from_outcome(
        camera_id: CameraId,
        outcome: &RuleOutcome,
        timestamp_ms: u64,
        zone_names: &[String],
        with_snapshot: bool,
    ) -> Self {
        let evidence = &outcome.evidence;
        let zones: Vec<String> = evidence
            .zones
            .iter()
            .filter_map(|idx| zone_names.get(*idx).cloned())
            .collect();
        let message = match outcome.rule {
            RuleKind::DangerZone => format!(
                "camera {}: track {} entered danger zone {}",
                camera_id,
                outcome.track_id,
                zones.join(",")
            ),
            RuleKind::NoHelmet => format!(
                "camera {}: track {} without helmet",
                camera_id, outcome.track_id
            ),
        };
        Self {
            camera_id,
            rule: outcome.rule,
            track_id: outcome.track_id,
            timestamp_ms,
            snapshot_ref: with_snapshot.then(|| {
                snapshot_name(camera_id, outcome.rule, outcome.track_id, timestamp_ms)
            }),
            detail: AlertDetail {
                message,
                person: evidence.person,
                head: evidence.head,
                helmet: evidence.helmet.map(|(bbox, _)| bbox),
                anchor: evidence.point,
                zones,
                confidence: evidence.person_confidence,
            },
        }
    }
}

/// Snapshot file name derived from the alert's identity.
pub fn snapshot_name(
    camera_id: CameraId,
    rule: RuleKind,
    track_id: TrackId,
    timestamp_ms: u64,
) -> String {
    format!(
        "cam{}_{}_track{}_{}.jpg",
        camera_id,
        rule.as_str(),
        track_id,
        timestamp_ms
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::Evidence;

    #[test]
    fn snapshot_names_are_unique_per_identity() {
        assert_eq!(
            snapshot_name(2, RuleKind::NoHelmet, 17, 1_700_000_000_123),
            "cam2_no_helmet_track17_1700000000123.jpg"
        );
        assert_ne!(
            snapshot_name(2, RuleKind::NoHelmet, 17, 1),
            snapshot_name(2, RuleKind::DangerZone, 17, 1)
        );
    }

    #[test]
    fn event_from_zone_outcome_names_zones() {
        let outcome = RuleOutcome {
            track_id: 4,
            rule: RuleKind::DangerZone,
            violating: true,
            evidence: Evidence {
                person: Some(BBox::new(0.0, 0.0, 4.0, 8.0)),
                person_confidence: 0.8,
                point: Some(Point::new(2.0, 8.0)),
                zones: vec![1],
                ..Evidence::default()
            },
        };
        let names = vec!["pit".to_string(), "press".to_string()];
        let event = AlertEvent::from_outcome(0, &outcome, 42, &names, true);
        assert_eq!(event.detail.zones, vec!["press".to_string()]);
        assert!(event.detail.message.contains("press"));
        assert_eq!(event.snapshot_ref.as_deref(), Some("cam0_danger_zone_track4_42.jpg"));

        let json = serde_json::to_string(&event.detail).unwrap();
        assert!(!json.contains("helmet"));

        let bare = AlertEvent::from_outcome(0, &outcome, 42, &names, false);
        assert!(bare.snapshot_ref.is_none());
    }
}
