use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for the submission path, safe to read from any thread.
#[derive(Debug, Default)]
pub struct DeviceStats {
    enqueues: AtomicU64,
    blocked_enqueues: AtomicU64,
    deferred_replays: AtomicU64,
    deferred_aborts: AtomicU64,
    compute_flushes: AtomicU64,
    copy_flushes: AtomicU64,
    aux_translations: AtomicU64,
    marker_observations: AtomicU64,
    stalling_barriers: AtomicU64,
    waits: AtomicU64,
    hangs_detected: AtomicU64,
    callbacks_fired: AtomicU64,
    poller_wakes: AtomicU64,
}

impl DeviceStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_enqueues(&self) {
        self.enqueues.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_blocked_enqueues(&self) {
        self.blocked_enqueues.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_deferred_replays(&self) {
        self.deferred_replays.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_deferred_aborts(&self) {
        self.deferred_aborts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_compute_flushes(&self) {
        self.compute_flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_copy_flushes(&self) {
        self.copy_flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_aux_translations(&self) {
        self.aux_translations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_marker_observations(&self) {
        self.marker_observations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_stalling_barriers(&self) {
        self.stalling_barriers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_waits(&self) {
        self.waits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_hangs_detected(&self) {
        self.hangs_detected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_callbacks_fired(&self, n: u64) {
        self.callbacks_fired.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_poller_wakes(&self) {
        self.poller_wakes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DeviceStatsSnapshot {
        DeviceStatsSnapshot {
            enqueues: self.enqueues.load(Ordering::Relaxed),
            blocked_enqueues: self.blocked_enqueues.load(Ordering::Relaxed),
            deferred_replays: self.deferred_replays.load(Ordering::Relaxed),
            deferred_aborts: self.deferred_aborts.load(Ordering::Relaxed),
            compute_flushes: self.compute_flushes.load(Ordering::Relaxed),
            copy_flushes: self.copy_flushes.load(Ordering::Relaxed),
            aux_translations: self.aux_translations.load(Ordering::Relaxed),
            marker_observations: self.marker_observations.load(Ordering::Relaxed),
            stalling_barriers: self.stalling_barriers.load(Ordering::Relaxed),
            waits: self.waits.load(Ordering::Relaxed),
            hangs_detected: self.hangs_detected.load(Ordering::Relaxed),
            callbacks_fired: self.callbacks_fired.load(Ordering::Relaxed),
            poller_wakes: self.poller_wakes.load(Ordering::Relaxed),
        }
    }

    /// Returns a JSON object as a string.
    pub fn to_json(&self) -> String {
        self.snapshot().to_json()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeviceStatsSnapshot {
    pub enqueues: u64,
    pub blocked_enqueues: u64,
    pub deferred_replays: u64,
    pub deferred_aborts: u64,
    pub compute_flushes: u64,
    pub copy_flushes: u64,
    pub aux_translations: u64,
    pub marker_observations: u64,
    pub stalling_barriers: u64,
    pub waits: u64,
    pub hangs_detected: u64,
    pub callbacks_fired: u64,
    pub poller_wakes: u64,
}

impl DeviceStatsSnapshot {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_and_json() {
        let stats = DeviceStats::new();
        stats.inc_enqueues();
        stats.inc_enqueues();
        stats.inc_blocked_enqueues();
        stats.add_callbacks_fired(3);

        let snap = stats.snapshot();
        assert_eq!(snap.enqueues, 2);
        assert_eq!(snap.blocked_enqueues, 1);
        assert_eq!(snap.callbacks_fired, 3);

        let json: serde_json::Value = serde_json::from_str(&stats.to_json()).unwrap();
        assert_eq!(json["enqueues"], 2);
        assert_eq!(json["hangs_detected"], 0);
    }
}
