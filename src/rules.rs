//! Per-frame violation rules.
//!
//! Rules are pure functions of one frame's detections and the camera's
//! configuration. They report a verdict for every tracked person they
//! evaluated, violating or not, so the track store can see both entries
//! into and exits from a violation.

use std::collections::BTreeMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::detect::{Detection, ObjectClass};
use crate::error::PipelineError;
use crate::geometry::{BBox, Point};
use crate::zones::Zone;
use crate::TrackId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    DangerZone,
    NoHelmet,
}

impl RuleKind {
    pub const ALL: [RuleKind; 2] = [RuleKind::DangerZone, RuleKind::NoHelmet];

    pub fn as_str(&self) -> &'static str {
        match self {
            RuleKind::DangerZone => "danger_zone",
            RuleKind::NoHelmet => "no_helmet",
        }
    }

    pub fn parse(name: &str) -> Result<Self> {
        match name.trim().to_lowercase().as_str() {
            "danger_zone" => Ok(RuleKind::DangerZone),
            "no_helmet" => Ok(RuleKind::NoHelmet),
            other => Err(PipelineError::config(format!(
                "unknown rule '{}' (expected danger_zone or no_helmet)",
                other
            ))),
        }
    }
}

impl std::fmt::Display for RuleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which point of a person box stands for the person's position.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnchorPoint {
    /// Bottom-center of the box, approximating the feet.
    #[default]
    BottomCenter,
    Center,
}

impl AnchorPoint {
    pub fn of(&self, bbox: &BBox) -> Point {
        match self {
            AnchorPoint::BottomCenter => bbox.bottom_center(),
            AnchorPoint::Center => bbox.center(),
        }
    }
}

/// Tunable thresholds shared by both rules.
#[derive(Clone, Debug, PartialEq)]
pub struct RuleThresholds {
    pub person_min_confidence: f32,
    pub head_min_confidence: f32,
    pub helmet_min_confidence: f32,
    /// Fraction of the smaller of (helmet, head) covered by their overlap
    /// for the helmet to count as worn.
    pub helmet_overlap_min: f32,
    /// Top fraction of a person box treated as the head band.
    pub head_region_ratio: f32,
    /// When set, a person without an associated head detection is not
    /// evaluated by the helmet rule instead of falling back to the head band.
    pub require_head: bool,
    pub anchor: AnchorPoint,
}

impl Default for RuleThresholds {
    fn default() -> Self {
        Self {
            person_min_confidence: 0.4,
            head_min_confidence: 0.3,
            helmet_min_confidence: 0.5,
            helmet_overlap_min: 0.3,
            head_region_ratio: 0.3,
            require_head: false,
            anchor: AnchorPoint::BottomCenter,
        }
    }
}

impl RuleThresholds {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("person_min_confidence", self.person_min_confidence),
            ("head_min_confidence", self.head_min_confidence),
            ("helmet_min_confidence", self.helmet_min_confidence),
            ("helmet_overlap_min", self.helmet_overlap_min),
            ("head_region_ratio", self.head_region_ratio),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(PipelineError::config(format!(
                    "{} must be within [0, 1], got {}",
                    name, value
                )));
            }
        }
        if self.head_region_ratio == 0.0 {
            return Err(PipelineError::config("head_region_ratio must be > 0"));
        }
        Ok(())
    }
}

/// What a rule saw when it reached its verdict.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    pub person: Option<BBox>,
    pub person_confidence: f32,
    /// Anchor point tested against zones.
    pub point: Option<Point>,
    /// Indices (into the camera's zone list) containing the anchor point.
    pub zones: Vec<usize>,
    /// Head region used by the helmet rule.
    pub head: Option<BBox>,
    /// Best helmet candidate and its confidence, if any.
    pub helmet: Option<(BBox, f32)>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RuleOutcome {
    pub track_id: TrackId,
    pub rule: RuleKind,
    pub violating: bool,
    pub evidence: Evidence,
}

/// Tracked people above the person threshold.
fn tracked_people<'a>(
    detections: &'a [Detection],
    thresholds: &'a RuleThresholds,
) -> impl Iterator<Item = (TrackId, &'a Detection)> + 'a {
    detections.iter().filter_map(move |d| {
        if d.class != ObjectClass::Person || d.confidence < thresholds.person_min_confidence {
            return None;
        }
        d.track_id.map(|id| (id, d))
    })
}

/// Person is violating when its anchor point lies inside any zone.
pub fn danger_zone(
    detections: &[Detection],
    zones: &[Zone],
    thresholds: &RuleThresholds,
) -> Vec<RuleOutcome> {
    tracked_people(detections, thresholds)
        .map(|(track_id, person)| {
            let point = thresholds.anchor.of(&person.bbox);
            let hits: Vec<usize> = zones
                .iter()
                .enumerate()
                .filter(|(_, zone)| zone.contains(point))
                .map(|(idx, _)| idx)
                .collect();
            RuleOutcome {
                track_id,
                rule: RuleKind::DangerZone,
                violating: !hits.is_empty(),
                evidence: Evidence {
                    person: Some(person.bbox),
                    person_confidence: person.confidence,
                    point: Some(point),
                    zones: hits,
                    ..Evidence::default()
                },
            }
        })
        .collect()
}

/// Person is violating when its head region has no worn helmet.
///
/// The head region is the head detection overlapping the person's head band
/// most, or the band itself when no head was detected. Among helmets
/// covering the head region the most confident one wins. Helmets that cover
/// no person's head are never attributed to anyone.
pub fn no_helmet(detections: &[Detection], thresholds: &RuleThresholds) -> Vec<RuleOutcome> {
    let heads: Vec<&Detection> = detections
        .iter()
        .filter(|d| d.class == ObjectClass::Head && d.confidence >= thresholds.head_min_confidence)
        .collect();
    let helmets: Vec<&Detection> = detections
        .iter()
        .filter(|d| {
            d.class == ObjectClass::Helmet && d.confidence >= thresholds.helmet_min_confidence
        })
        .collect();

    let mut outcomes = Vec::new();
    for (track_id, person) in tracked_people(detections, thresholds) {
        let band = person.bbox.upper_region(thresholds.head_region_ratio);
        let head = heads
            .iter()
            .filter(|h| person.bbox.contains_point(h.bbox.center()))
            .map(|h| (h.bbox, h.bbox.intersection_area(&band)))
            .filter(|(_, overlap)| *overlap > 0.0)
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(bbox, _)| bbox);

        let head_region = match head {
            Some(bbox) => bbox,
            None if thresholds.require_head => continue,
            None => band,
        };

        let helmet = helmets
            .iter()
            .filter(|h| covers(&h.bbox, &head_region, thresholds.helmet_overlap_min))
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
            .map(|h| (h.bbox, h.confidence));

        outcomes.push(RuleOutcome {
            track_id,
            rule: RuleKind::NoHelmet,
            violating: helmet.is_none(),
            evidence: Evidence {
                person: Some(person.bbox),
                person_confidence: person.confidence,
                head: Some(head_region),
                helmet,
                ..Evidence::default()
            },
        });
    }
    outcomes
}

fn covers(helmet: &BBox, head: &BBox, min_fraction: f32) -> bool {
    let overlap = helmet.intersection_area(head);
    if overlap <= 0.0 {
        return false;
    }
    let smaller = helmet.area().min(head.area());
    smaller > 0.0 && overlap / smaller >= min_fraction
}

/// Rules enabled for one camera, with that camera's zones and thresholds.
#[derive(Clone, Debug)]
pub struct RuleSet {
    pub enabled: Vec<RuleKind>,
    pub zones: Vec<Zone>,
    pub thresholds: RuleThresholds,
}

impl RuleSet {
    pub fn new(enabled: Vec<RuleKind>, zones: Vec<Zone>, thresholds: RuleThresholds) -> Self {
        Self {
            enabled,
            zones,
            thresholds,
        }
    }

    pub fn is_enabled(&self, rule: RuleKind) -> bool {
        self.enabled.contains(&rule)
    }

    /// Run every enabled rule. At most one outcome per (track, rule); if a
    /// tracker reports the same id twice, a violating verdict wins.
    pub fn evaluate(&self, detections: &[Detection]) -> Vec<RuleOutcome> {
        let mut merged: BTreeMap<(TrackId, RuleKind), RuleOutcome> = BTreeMap::new();
        let mut outcomes = Vec::new();
        if self.is_enabled(RuleKind::DangerZone) {
            outcomes.extend(danger_zone(detections, &self.zones, &self.thresholds));
        }
        if self.is_enabled(RuleKind::NoHelmet) {
            outcomes.extend(no_helmet(detections, &self.thresholds));
        }
        for outcome in outcomes {
            let key = (outcome.track_id, outcome.rule);
            match merged.get(&key) {
                Some(existing) if existing.violating || !outcome.violating => {}
                _ => {
                    merged.insert(key, outcome);
                }
            }
        }
        merged.into_values().collect()
    }
}
