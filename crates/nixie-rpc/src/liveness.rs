//! Liveness round state machine
//!
//! Pure state, driven by the service's timers: every method takes the
//! current time instead of reading a clock, so rounds can be unit tested
//! without sleeping.
//!
//! Any instance whose ticker fires may originate a round; there is no leader
//! election. Concurrent rounds are tolerated: each is keyed by its ping id,
//! each produces a snapshot, and adopting either is fine since both describe
//! roughly the same moment. The responder throttle keeps the steady state at
//! about one round per ping delay cluster-wide.

use nixie_core::envelope::{LivenessMap, PingId, WorkerReport};
use std::collections::HashSet;

#[derive(Debug)]
struct PingRound {
    ping_id: PingId,
    started_at_ms: u64,
    /// Keys from the previous snapshot that have not answered yet. Empty
    /// when the round started without a valid snapshot; such rounds only
    /// finish by timeout.
    awaiting: HashSet<String>,
    collected: LivenessMap,
}

/// Tracks the adopted snapshot, the origination gate, and at most one
/// round in flight
#[derive(Debug)]
pub struct LivenessTracker {
    snapshot: LivenessMap,
    valid_until_ms: u64,
    next_ping_at_ms: u64,
    round: Option<PingRound>,
    validity_ms: u64,
    throttle_ms: u64,
}

impl LivenessTracker {
    /// Create a tracker with no snapshot and the gate open
    pub fn new(validity_ms: u64, throttle_ms: u64) -> Self {
        Self {
            snapshot: LivenessMap::new(),
            valid_until_ms: 0,
            next_ping_at_ms: 0,
            round: None,
            validity_ms,
            throttle_ms,
        }
    }

    /// Whether the adopted snapshot is still current
    pub fn is_valid(&self, now_ms: u64) -> bool {
        now_ms < self.valid_until_ms
    }

    /// Whether the snapshot lists a `name@worker` key
    pub fn contains(&self, key: &str) -> bool {
        self.snapshot.contains_key(key)
    }

    /// The adopted snapshot
    pub fn snapshot(&self) -> &LivenessMap {
        &self.snapshot
    }

    /// Whether this instance's ticker should start a round now
    pub fn should_originate(&self, now_ms: u64) -> bool {
        self.round.is_none() && now_ms >= self.next_ping_at_ms
    }

    /// Push the origination gate forward after answering a ping
    ///
    /// The throttle is sized so that one instance answering another's ping
    /// skips its own next tick, keeping the cluster near one round per
    /// delay.
    pub fn throttle(&mut self, now_ms: u64) {
        self.next_ping_at_ms = now_ms + self.throttle_ms;
    }

    /// Open a round
    ///
    /// The set of awaited responders is the current snapshot's keys when it
    /// is still valid, and empty otherwise. Returns false if a round is
    /// already open.
    pub fn begin_round(&mut self, ping_id: PingId, now_ms: u64) -> bool {
        if self.round.is_some() {
            return false;
        }

        let awaiting = if self.is_valid(now_ms) {
            self.snapshot.keys().cloned().collect()
        } else {
            HashSet::new()
        };

        self.round = Some(PingRound {
            ping_id,
            started_at_ms: now_ms,
            awaiting,
            collected: LivenessMap::new(),
        });
        true
    }

    /// Record a pong for the open round
    ///
    /// Pongs from workers outside the awaited set are collected too; that is
    /// how new workers get discovered. Returns true when this pong was the
    /// last awaited one, meaning the round should finalize early.
    pub fn record_pong(
        &mut self,
        ping_id: &PingId,
        key: &str,
        success: u64,
        errors: u64,
        now_ms: u64,
    ) -> bool {
        let Some(round) = self.round.as_mut() else {
            return false;
        };
        if round.ping_id != *ping_id {
            return false;
        }

        round.collected.insert(
            key.to_string(),
            WorkerReport {
                ping: now_ms.saturating_sub(round.started_at_ms),
                success,
                errors,
            },
        );

        let was_awaited = round.awaiting.remove(key);
        was_awaited && round.awaiting.is_empty()
    }

    /// Close a round and adopt what it collected
    ///
    /// Called on the last awaited pong and again on the round's timeout;
    /// whichever comes second finds the round gone and gets `None`.
    pub fn finalize_round(&mut self, ping_id: &PingId, now_ms: u64) -> Option<LivenessMap> {
        if self.round.as_ref().map(|r| &r.ping_id) != Some(ping_id) {
            return None;
        }

        let round = self.round.take()?;
        self.adopt(round.collected.clone(), now_ms);
        Some(round.collected)
    }

    /// Replace the snapshot and restart its validity window
    pub fn adopt(&mut self, map: LivenessMap, now_ms: u64) {
        self.snapshot = map;
        self.valid_until_ms = now_ms + self.validity_ms;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> LivenessTracker {
        // validity 400, throttle 150
        LivenessTracker::new(400, 150)
    }

    fn report(ping: u64) -> WorkerReport {
        WorkerReport {
            ping,
            success: 0,
            errors: 0,
        }
    }

    #[test]
    fn test_fresh_tracker_originates_immediately() {
        let tracker = tracker();
        assert!(!tracker.is_valid(0));
        assert!(tracker.should_originate(0));
    }

    #[test]
    fn test_throttle_gates_origination() {
        let mut tracker = tracker();
        tracker.throttle(100);
        assert!(!tracker.should_originate(200));
        assert!(tracker.should_originate(250));
    }

    #[test]
    fn test_round_completes_on_last_awaited_pong() {
        let mut tracker = tracker();
        let mut snapshot = LivenessMap::new();
        snapshot.insert("auth@0".into(), report(1));
        snapshot.insert("auth@1".into(), report(1));
        tracker.adopt(snapshot, 1000);

        let id = PingId::new("p1");
        assert!(tracker.begin_round(id.clone(), 1100));
        assert!(!tracker.begin_round(PingId::new("p2"), 1100));

        assert!(!tracker.record_pong(&id, "auth@0", 5, 0, 1103));
        assert!(tracker.record_pong(&id, "auth@1", 7, 1, 1110));

        let map = tracker.finalize_round(&id, 1110).unwrap();
        assert_eq!(map["auth@0"].ping, 3);
        assert_eq!(map["auth@1"].ping, 10);
        assert_eq!(map["auth@1"].errors, 1);

        // Snapshot adopted, validity restarted.
        assert!(tracker.is_valid(1400));
        assert!(!tracker.is_valid(1510));
    }

    #[test]
    fn test_unknown_worker_is_collected_but_never_completes() {
        let mut tracker = tracker();
        let mut snapshot = LivenessMap::new();
        snapshot.insert("auth@0".into(), report(1));
        tracker.adopt(snapshot, 0);

        let id = PingId::new("p1");
        tracker.begin_round(id.clone(), 10);

        // A brand new worker answers first.
        assert!(!tracker.record_pong(&id, "auth@9", 0, 0, 12));
        // The awaited one completes the round.
        assert!(tracker.record_pong(&id, "auth@0", 0, 0, 15));

        let map = tracker.finalize_round(&id, 15).unwrap();
        assert!(map.contains_key("auth@9"));
    }

    #[test]
    fn test_invalid_snapshot_round_only_times_out() {
        let mut tracker = tracker();
        let id = PingId::new("p1");
        tracker.begin_round(id.clone(), 0);

        // No pong can complete an empty awaited set.
        assert!(!tracker.record_pong(&id, "auth@0", 0, 0, 3));

        let map = tracker.finalize_round(&id, 50).unwrap();
        assert!(map.contains_key("auth@0"));
    }

    #[test]
    fn test_finalize_is_one_shot() {
        let mut tracker = tracker();
        let id = PingId::new("p1");
        tracker.begin_round(id.clone(), 0);

        assert!(tracker.finalize_round(&id, 50).is_some());
        assert!(tracker.finalize_round(&id, 60).is_none());
    }

    #[test]
    fn test_stale_pong_is_ignored() {
        let mut tracker = tracker();
        let id = PingId::new("p1");
        tracker.begin_round(id.clone(), 0);
        tracker.finalize_round(&id, 50);

        assert!(!tracker.record_pong(&id, "auth@0", 0, 0, 60));
        assert!(!tracker.record_pong(&PingId::new("p2"), "auth@0", 0, 0, 60));
    }
}
