//! Per-camera counters. Written by the camera loop and the dispatcher, read by
//! health logging. Nothing in the pipeline depends on their values.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::quality::DropReason;

#[derive(Debug, Default)]
pub struct PipelineStats {
    pub frames_read: AtomicU64,
    pub read_errors: AtomicU64,
    pub reconnects: AtomicU64,
    pub dropped_motion: AtomicU64,
    pub dropped_quality: AtomicU64,
    pub dropped_duplicate: AtomicU64,
    pub dropped_roi: AtomicU64,
    pub zone_triggers: AtomicU64,
    pub recognizer_errors: AtomicU64,
    pub candidates: AtomicU64,
    pub finalized: AtomicU64,
    pub skipped_dedup: AtomicU64,
    pub skipped_recapture: AtomicU64,
    pub enqueued: AtomicU64,
    pub persist_errors: AtomicU64,
    pub dispatch_stalls: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub frames_read: u64,
    pub read_errors: u64,
    pub reconnects: u64,
    pub dropped_motion: u64,
    pub dropped_quality: u64,
    pub dropped_duplicate: u64,
    pub dropped_roi: u64,
    pub zone_triggers: u64,
    pub recognizer_errors: u64,
    pub candidates: u64,
    pub finalized: u64,
    pub skipped_dedup: u64,
    pub skipped_recapture: u64,
    pub enqueued: u64,
    pub persist_errors: u64,
    pub dispatch_stalls: u64,
}

impl PipelineStats {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_drop(&self, reason: DropReason) {
        let counter = match reason {
            DropReason::NoMotion => &self.dropped_motion,
            DropReason::LowQuality => &self.dropped_quality,
            DropReason::Duplicate => &self.dropped_duplicate,
        };
        Self::incr(counter);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            frames_read: get(&self.frames_read),
            read_errors: get(&self.read_errors),
            reconnects: get(&self.reconnects),
            dropped_motion: get(&self.dropped_motion),
            dropped_quality: get(&self.dropped_quality),
            dropped_duplicate: get(&self.dropped_duplicate),
            dropped_roi: get(&self.dropped_roi),
            zone_triggers: get(&self.zone_triggers),
            recognizer_errors: get(&self.recognizer_errors),
            candidates: get(&self.candidates),
            finalized: get(&self.finalized),
            skipped_dedup: get(&self.skipped_dedup),
            skipped_recapture: get(&self.skipped_recapture),
            enqueued: get(&self.enqueued),
            persist_errors: get(&self.persist_errors),
            dispatch_stalls: get(&self.dispatch_stalls),
        }
    }
}

impl StatsSnapshot {
    pub fn dropped_total(&self) -> u64 {
        self.dropped_motion + self.dropped_quality + self.dropped_duplicate
    }

    /// One-line summary for the periodic health log.
    pub fn summary(&self) -> String {
        format!(
            "frames={} drops(motion={} quality={} dup={} roi={}) triggers={} finalized={} enqueued={} dedup_skips={} reconnects={}",
            self.frames_read,
            self.dropped_motion,
            self.dropped_quality,
            self.dropped_duplicate,
            self.dropped_roi,
            self.zone_triggers,
            self.finalized,
            self.enqueued,
            self.skipped_dedup,
            self.reconnects
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drops_land_in_matching_counter() {
        let stats = PipelineStats::default();
        stats.record_drop(DropReason::NoMotion);
        stats.record_drop(DropReason::NoMotion);
        stats.record_drop(DropReason::Duplicate);
        PipelineStats::incr(&stats.frames_read);
        let snap = stats.snapshot();
        assert_eq!(snap.dropped_motion, 2);
        assert_eq!(snap.dropped_quality, 0);
        assert_eq!(snap.dropped_duplicate, 1);
        assert_eq!(snap.dropped_total(), 3);
        assert!(snap.summary().starts_with("frames=1 "));
    }
}
