//! Bridge counters
//!
//! Process-local atomics for the periodic stats line, mirrored into the
//! `metrics` facade for whichever exporter the embedding binary installs.

use std::sync::atomic::{AtomicU64, Ordering};

use metrics::{counter, increment_counter};

#[derive(Debug, Default)]
pub struct BridgeStats {
    pub frames_tx: AtomicU64,
    pub frames_rx: AtomicU64,
    pub bytes_tx: AtomicU64,
    pub bytes_rx: AtomicU64,
    pub frames_rejected: AtomicU64,
    pub sessions_opened: AtomicU64,
    pub sessions_closed: AtomicU64,
    pub policy_rejections: AtomicU64,
    pub threats_detected: AtomicU64,
    pub sequence_anomalies: AtomicU64,
}

impl BridgeStats {
    pub fn record_tx(&self, bytes: usize) {
        self.frames_tx.fetch_add(1, Ordering::Relaxed);
        self.bytes_tx.fetch_add(bytes as u64, Ordering::Relaxed);
        increment_counter!("gapbridge_frames_sent_total");
        counter!("gapbridge_bytes_sent_total", bytes as u64);
    }

    pub fn record_rx(&self, bytes: usize) {
        self.frames_rx.fetch_add(1, Ordering::Relaxed);
        self.bytes_rx.fetch_add(bytes as u64, Ordering::Relaxed);
        increment_counter!("gapbridge_frames_received_total");
        counter!("gapbridge_bytes_received_total", bytes as u64);
    }

    pub fn record_frame_rejected(&self) {
        self.frames_rejected.fetch_add(1, Ordering::Relaxed);
        increment_counter!("gapbridge_frames_rejected_total");
    }

    pub fn record_session_opened(&self) {
        self.sessions_opened.fetch_add(1, Ordering::Relaxed);
        increment_counter!("gapbridge_sessions_opened_total");
    }

    pub fn record_session_closed(&self) {
        self.sessions_closed.fetch_add(1, Ordering::Relaxed);
        increment_counter!("gapbridge_sessions_closed_total");
    }

    pub fn record_policy_rejection(&self) {
        self.policy_rejections.fetch_add(1, Ordering::Relaxed);
        increment_counter!("gapbridge_policy_rejections_total");
    }

    pub fn record_threat(&self) {
        self.threats_detected.fetch_add(1, Ordering::Relaxed);
        increment_counter!("gapbridge_threats_detected_total");
    }

    pub fn record_sequence_anomaly(&self) {
        self.sequence_anomalies.fetch_add(1, Ordering::Relaxed);
        increment_counter!("gapbridge_sequence_anomalies_total");
    }

    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_tx: self.frames_tx.load(Ordering::Relaxed),
            frames_rx: self.frames_rx.load(Ordering::Relaxed),
            bytes_tx: self.bytes_tx.load(Ordering::Relaxed),
            bytes_rx: self.bytes_rx.load(Ordering::Relaxed),
            frames_rejected: self.frames_rejected.load(Ordering::Relaxed),
            sessions_opened: self.sessions_opened.load(Ordering::Relaxed),
            sessions_closed: self.sessions_closed.load(Ordering::Relaxed),
            policy_rejections: self.policy_rejections.load(Ordering::Relaxed),
            threats_detected: self.threats_detected.load(Ordering::Relaxed),
            sequence_anomalies: self.sequence_anomalies.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub frames_tx: u64,
    pub frames_rx: u64,
    pub bytes_tx: u64,
    pub bytes_rx: u64,
    pub frames_rejected: u64,
    pub sessions_opened: u64,
    pub sessions_closed: u64,
    pub policy_rejections: u64,
    pub threats_detected: u64,
    pub sequence_anomalies: u64,
}

impl StatsSnapshot {
    pub fn active_sessions(&self) -> u64 {
        self.sessions_opened.saturating_sub(self.sessions_closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stats = BridgeStats::default();
        stats.record_tx(100);
        stats.record_tx(50);
        stats.record_rx(10);
        stats.record_session_opened();
        stats.record_session_opened();
        stats.record_session_closed();
        stats.record_frame_rejected();

        let snap = stats.snapshot();
        assert_eq!(snap.frames_tx, 2);
        assert_eq!(snap.bytes_tx, 150);
        assert_eq!(snap.bytes_rx, 10);
        assert_eq!(snap.frames_rejected, 1);
        assert_eq!(snap.active_sessions(), 1);
    }
}
