//! Alert debouncing.
//!
//! An alert fires on the transition into a violation, not on every
//! violating frame. A per-pair cooldown additionally suppresses a second
//! alert when a track flickers out of and back into violation quickly.
//! A suppressed start still opens the episode; no alert is issued later
//! for that same episode.

use crate::rules::RuleKind;
use crate::track_state::{TrackStateStore, Transition};
use crate::TrackId;

#[derive(Clone, Debug)]
pub struct AlertDebouncer {
    cooldown_ms: u64,
    suppressed: u64,
}

impl AlertDebouncer {
    pub fn new(cooldown_ms: u64) -> Self {
        Self {
            cooldown_ms,
            suppressed: 0,
        }
    }

    pub fn cooldown_ms(&self) -> u64 {
        self.cooldown_ms
    }

    /// Starts suppressed by the cooldown so far.
    pub fn suppressed(&self) -> u64 {
        self.suppressed
    }

    /// Decide whether `transition` for `(track_id, rule)` produces an alert.
    /// On `true` the record's alert time is updated to `now`.
    pub fn should_alert(
        &mut self,
        store: &mut TrackStateStore,
        track_id: TrackId,
        rule: RuleKind,
        transition: Transition,
        now: u64,
    ) -> bool {
        if transition != Transition::Started {
            return false;
        }
        let Some(record) = store.get_mut(track_id, rule) else {
            return false;
        };
        if let Some(last) = record.last_alert_at {
            if now.saturating_sub(last) < self.cooldown_ms {
                self.suppressed += 1;
                log::debug!(
                    "track {} {} alert suppressed ({} ms since last)",
                    track_id,
                    rule,
                    now.saturating_sub(last)
                );
                return false;
            }
        }
        record.last_alert_at = Some(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(cooldown: u64, verdicts: &[(bool, u64)]) -> usize {
        let mut store = TrackStateStore::new();
        let mut debouncer = AlertDebouncer::new(cooldown);
        verdicts
            .iter()
            .filter(|(violating, now)| {
                let t = store.observe(3, RuleKind::NoHelmet, *violating, *now);
                debouncer.should_alert(&mut store, 3, RuleKind::NoHelmet, t, *now)
            })
            .count()
    }

    #[test]
    fn one_alert_per_violation_episode() {
        let seq = [(false, 0), (true, 10_000), (true, 20_000), (false, 30_000), (true, 40_000)];
        assert_eq!(run(5_000, &seq), 2);
    }

    #[test]
    fn cooldown_suppresses_quick_reentry() {
        let seq = [(false, 0), (true, 100), (true, 200), (false, 300), (true, 400)];
        assert_eq!(run(5_000, &seq), 1);
    }

    #[test]
    fn zero_cooldown_alerts_every_start() {
        let seq = [(true, 0), (false, 1), (true, 2), (false, 3), (true, 4)];
        assert_eq!(run(0, &seq), 3);
    }

    #[test]
    fn continuing_never_alerts() {
        let mut store = TrackStateStore::new();
        let mut debouncer = AlertDebouncer::new(0);
        store.observe(1, RuleKind::DangerZone, true, 0);
        let rule = RuleKind::DangerZone;
        assert!(!debouncer.should_alert(&mut store, 1, rule, Transition::Continuing, 5));
        assert!(!debouncer.should_alert(&mut store, 1, rule, Transition::Ended, 5));
    }

    #[test]
    fn cooldown_survives_eviction_of_a_lost_track() {
        let mut store = TrackStateStore::new();
        let mut debouncer = AlertDebouncer::new(10_000);
        let rule = RuleKind::NoHelmet;

        let t = store.observe(8, rule, true, 0);
        assert!(debouncer.should_alert(&mut store, 8, rule, t, 0));

        // Track lost for longer than the grace period, back before the cooldown ends.
        store.sweep(6_000, 5_000, debouncer.cooldown_ms());
        let t = store.observe(8, rule, true, 7_000);
        assert_eq!(t, Transition::Started);
        assert!(!debouncer.should_alert(&mut store, 8, rule, t, 7_000));
        assert_eq!(debouncer.suppressed(), 1);

        store.observe(8, rule, false, 8_000);
        store.sweep(16_000, 5_000, debouncer.cooldown_ms());
        assert!(store.is_empty());
        let t = store.observe(8, rule, true, 17_000);
        assert!(debouncer.should_alert(&mut store, 8, rule, t, 17_000));
    }
}
