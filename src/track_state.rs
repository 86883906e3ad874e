//! Per-camera memory of which tracks are currently violating which rule.
//!
//! One store per camera worker, never shared. Records are keyed by
//! `(track_id, rule)` and evicted once their track has not been observed
//! for longer than the grace period, so the store stays bounded even
//! when the tracker churns through ids. A record whose last alert is still
//! inside the cooldown outlives the grace period with its violation closed.

use std::collections::HashMap;

use crate::rules::RuleKind;
use crate::TrackId;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrackRecord {
    pub track_id: TrackId,
    pub rule: RuleKind,
    /// Start of the current (or most recent) violation episode.
    pub first_violation_at: u64,
    pub last_seen: u64,
    pub violation_open: bool,
    /// Time the last alert for this pair was emitted, if any.
    pub last_alert_at: Option<u64>,
}

/// What an observation did to a `(track, rule)` pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    /// Not violating before, violating now.
    Started,
    Continuing,
    Ended,
    None,
}

#[derive(Debug, Default)]
pub struct TrackStateStore {
    records: HashMap<(TrackId, RuleKind), TrackRecord>,
}

impl TrackStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one verdict for `(track_id, rule)` at time `now` (ms).
    pub fn observe(
        &mut self,
        track_id: TrackId,
        rule: RuleKind,
        violating: bool,
        now: u64,
    ) -> Transition {
        let key = (track_id, rule);
        let Some(record) = self.records.get_mut(&key) else {
            if !violating {
                return Transition::None;
            }
            self.records.insert(
                key,
                TrackRecord {
                    track_id,
                    rule,
                    first_violation_at: now,
                    last_seen: now,
                    violation_open: true,
                    last_alert_at: None,
                },
            );
            return Transition::Started;
        };

        record.last_seen = record.last_seen.max(now);
        match (record.violation_open, violating) {
            (true, true) => Transition::Continuing,
            (true, false) => {
                record.violation_open = false;
                Transition::Ended
            }
            (false, true) => {
                record.violation_open = true;
                record.first_violation_at = now;
                Transition::Started
            }
            (false, false) => Transition::None,
        }
    }

    /// Drop every record whose track has not been seen within `grace_ms`,
    /// unless it alerted less than `cooldown_ms` ago. Returns the number
    /// evicted.
    pub fn sweep(&mut self, now: u64, grace_ms: u64, cooldown_ms: u64) -> usize {
        let before = self.records.len();
        self.records.retain(|_, record| {
            if now.saturating_sub(record.last_seen) <= grace_ms {
                return true;
            }
            record.violation_open = false;
            record
                .last_alert_at
                .is_some_and(|at| now.saturating_sub(at) < cooldown_ms)
        });
        before - self.records.len()
    }

    pub fn get(&self, track_id: TrackId, rule: RuleKind) -> Option<&TrackRecord> {
        self.records.get(&(track_id, rule))
    }

    pub fn get_mut(&mut self, track_id: TrackId, rule: RuleKind) -> Option<&mut TrackRecord> {
        self.records.get_mut(&(track_id, rule))
    }

    /// Tracks with at least one open violation.
    pub fn open_violations(&self) -> usize {
        let mut tracks: Vec<TrackId> = self
            .records
            .values()
            .filter(|r| r.violation_open)
            .map(|r| r.track_id)
            .collect();
        tracks.sort_unstable();
        tracks.dedup();
        tracks.len()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const R: RuleKind = RuleKind::DangerZone;

    #[test]
    fn transitions_follow_verdicts() {
        let mut store = TrackStateStore::new();
        assert_eq!(store.observe(7, R, false, 0), Transition::None);
        assert!(store.is_empty());
        assert_eq!(store.observe(7, R, true, 100), Transition::Started);
        assert_eq!(store.observe(7, R, true, 200), Transition::Continuing);
        assert_eq!(store.observe(7, R, false, 300), Transition::Ended);
        assert_eq!(store.observe(7, R, false, 400), Transition::None);
        assert_eq!(store.observe(7, R, true, 500), Transition::Started);

        let record = store.get(7, R).unwrap();
        assert_eq!(record.first_violation_at, 500);
        assert_eq!(record.last_seen, 500);
        assert!(record.violation_open);
    }

    #[test]
    fn rules_are_tracked_independently() {
        let mut store = TrackStateStore::new();
        assert_eq!(store.observe(1, RuleKind::DangerZone, true, 0), Transition::Started);
        assert_eq!(store.observe(1, RuleKind::NoHelmet, true, 0), Transition::Started);
        assert_eq!(store.len(), 2);
        assert_eq!(store.open_violations(), 1);
    }

    #[test]
    fn sweep_evicts_stale_tracks_only() {
        let mut store = TrackStateStore::new();
        store.observe(1, R, true, 0);
        store.observe(2, R, true, 0);
        store.observe(2, R, true, 4_000);
        assert_eq!(store.sweep(5_000, 2_000, 0), 1);
        assert!(store.get(1, R).is_none());
        assert!(store.get(2, R).is_some());
    }

    #[test]
    fn sweep_holds_stale_records_inside_cooldown() {
        let mut store = TrackStateStore::new();
        store.observe(4, R, true, 0);
        store.get_mut(4, R).unwrap().last_alert_at = Some(0);
        store.observe(5, R, true, 0);

        assert_eq!(store.sweep(6_000, 5_000, 10_000), 1);
        let held = store.get(4, R).unwrap();
        assert!(!held.violation_open);
        assert_eq!(store.open_violations(), 0);

        assert_eq!(store.sweep(10_000, 5_000, 10_000), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn store_stays_bounded_under_id_churn() {
        let mut store = TrackStateStore::new();
        for i in 0..10_000u64 {
            let now = i * 100;
            store.observe(i, R, true, now);
            store.sweep(now, 1_000, 0);
            assert!(store.len() <= 12, "len {} at step {}", store.len(), i);
        }
    }
}
