//! Health tracking for the failure-analysis pipeline
//!
//! This module tracks event-source connectivity, the recent error rate of
//! analysis and notification delivery, and a handful of cumulative counters.
//! All updates are lock-free so workers never wait on it.

use crate::events::Timestamp;
use chrono::{TimeZone, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, AtomicUsize, Ordering};

const SLOT_EMPTY: u8 = 0;
const SLOT_OK: u8 = 1;
const SLOT_ERROR: u8 = 2;

/// Read-only view handed to the health endpoint
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HealthSnapshot {
    pub event_source_connected: bool,
    /// Share of failed operations among the most recent ones, 0.0 to 1.0
    pub recent_error_rate: f64,
    pub last_successful_notification_at: Option<Timestamp>,
    pub events_received: u64,
    pub duplicates_skipped: u64,
    pub diagnoses: u64,
    pub fallbacks: u64,
    pub dispatch_failures: u64,
    pub offsets_committed: u64,
    pub timestamp: Timestamp,
}

/// Shared health counters for the pipeline
#[derive(Debug)]
pub struct HealthMonitor {
    connected: AtomicBool,
    /// Ring of recent operation results
    outcomes: Box<[AtomicU8]>,
    cursor: AtomicUsize,
    /// Milliseconds since the epoch; 0 means never
    last_notification_ms: AtomicI64,
    events_received: AtomicU64,
    duplicates_skipped: AtomicU64,
    diagnoses: AtomicU64,
    fallbacks: AtomicU64,
    dispatch_failures: AtomicU64,
    offsets_committed: AtomicU64,
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new(100)
    }
}

impl HealthMonitor {
    /// Create a monitor computing the error rate over the last `window` operations
    pub fn new(window: usize) -> Self {
        let outcomes = (0..window.max(1))
            .map(|_| AtomicU8::new(SLOT_EMPTY))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            connected: AtomicBool::new(false),
            outcomes,
            cursor: AtomicUsize::new(0),
            last_notification_ms: AtomicI64::new(0),
            events_received: AtomicU64::new(0),
            duplicates_skipped: AtomicU64::new(0),
            diagnoses: AtomicU64::new(0),
            fallbacks: AtomicU64::new(0),
            dispatch_failures: AtomicU64::new(0),
            offsets_committed: AtomicU64::new(0),
        }
    }

    pub fn set_event_source_connected(&self, connected: bool) {
        let previous = self.connected.swap(connected, Ordering::Relaxed);
        if previous != connected {
            info!("Event source connectivity changed: connected={}", connected);
        }
    }

    pub fn record_event_received(&self) {
        self.events_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.duplicates_skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the result of one analysis attempt
    pub fn record_analysis(&self, success: bool) {
        self.push_outcome(success);
    }

    pub fn record_diagnosis(&self) {
        self.diagnoses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fallback(&self) {
        self.fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the final result of delivering one notification
    pub fn record_dispatch(&self, success: bool) {
        debug!("Recording notification result: success={}", success);
        if success {
            self.last_notification_ms
                .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
        } else {
            self.dispatch_failures.fetch_add(1, Ordering::Relaxed);
        }
        self.push_outcome(success);
    }

    pub fn record_commit(&self) {
        self.offsets_committed.fetch_add(1, Ordering::Relaxed);
    }

    fn push_outcome(&self, success: bool) {
        let slot = self.cursor.fetch_add(1, Ordering::Relaxed) % self.outcomes.len();
        let value = if success { SLOT_OK } else { SLOT_ERROR };
        self.outcomes[slot].store(value, Ordering::Relaxed);
    }

    /// Failed share of the recorded operations in the window
    pub fn recent_error_rate(&self) -> f64 {
        let (mut total, mut errors) = (0u32, 0u32);
        for slot in self.outcomes.iter() {
            match slot.load(Ordering::Relaxed) {
                SLOT_OK => total += 1,
                SLOT_ERROR => {
                    total += 1;
                    errors += 1;
                }
                _ => {}
            }
        }

        if total == 0 {
            0.0
        } else {
            f64::from(errors) / f64::from(total)
        }
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let last_ms = self.last_notification_ms.load(Ordering::Relaxed);
        let last_successful_notification_at = if last_ms == 0 {
            None
        } else {
            Utc.timestamp_millis_opt(last_ms).single()
        };

        HealthSnapshot {
            event_source_connected: self.connected.load(Ordering::Relaxed),
            recent_error_rate: self.recent_error_rate(),
            last_successful_notification_at,
            events_received: self.events_received.load(Ordering::Relaxed),
            duplicates_skipped: self.duplicates_skipped.load(Ordering::Relaxed),
            diagnoses: self.diagnoses.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            dispatch_failures: self.dispatch_failures.load(Ordering::Relaxed),
            offsets_committed: self.offsets_committed.load(Ordering::Relaxed),
            timestamp: Utc::now(),
        }
    }

    /// Log the current snapshot and warn about degraded conditions
    pub fn report(&self) -> HealthSnapshot {
        let snapshot = self.snapshot();

        info!(
            "Health: connected={}, error_rate={:.1}%, received={}, duplicates={}, diagnoses={}, fallbacks={}, dispatch_failures={}, committed={}",
            snapshot.event_source_connected,
            snapshot.recent_error_rate * 100.0,
            snapshot.events_received,
            snapshot.duplicates_skipped,
            snapshot.diagnoses,
            snapshot.fallbacks,
            snapshot.dispatch_failures,
            snapshot.offsets_committed
        );

        if !snapshot.event_source_connected {
            warn!("Event source is disconnected");
        }
        if snapshot.recent_error_rate > 0.5 {
            warn!(
                "High error rate detected: {:.1}%",
                snapshot.recent_error_rate * 100.0
            );
        }

        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_initial_snapshot() {
        let monitor = HealthMonitor::new(10);
        let snapshot = monitor.snapshot();

        assert!(!snapshot.event_source_connected);
        assert_eq!(snapshot.recent_error_rate, 0.0);
        assert!(snapshot.last_successful_notification_at.is_none());
        assert_eq!(snapshot.events_received, 0);
    }

    #[test]
    fn test_error_rate_tracks_failures() {
        let monitor = HealthMonitor::new(10);
        monitor.record_analysis(true);
        monitor.record_analysis(true);
        monitor.record_analysis(false);
        monitor.record_dispatch(false);

        assert!((monitor.recent_error_rate() - 0.5).abs() < f64::EPSILON);
        assert_eq!(monitor.snapshot().dispatch_failures, 1);
    }

    #[test]
    fn test_error_rate_window_rolls_over() {
        let monitor = HealthMonitor::new(4);
        for _ in 0..4 {
            monitor.record_analysis(false);
        }
        assert_eq!(monitor.recent_error_rate(), 1.0);

        for _ in 0..4 {
            monitor.record_analysis(true);
        }
        assert_eq!(monitor.recent_error_rate(), 0.0);
    }

    #[test]
    fn test_successful_dispatch_sets_timestamp() {
        let monitor = HealthMonitor::new(10);
        let before = Utc::now().timestamp_millis();
        monitor.record_dispatch(true);

        let at = monitor.snapshot().last_successful_notification_at.unwrap();
        assert!(at.timestamp_millis() >= before);
    }

    #[test]
    fn test_connectivity_flag() {
        let monitor = HealthMonitor::new(10);
        monitor.set_event_source_connected(true);
        assert!(monitor.snapshot().event_source_connected);
        monitor.set_event_source_connected(false);
        assert!(!monitor.report().event_source_connected);
    }

    #[test]
    fn test_counters() {
        let monitor = HealthMonitor::new(10);
        monitor.record_event_received();
        monitor.record_event_received();
        monitor.record_duplicate();
        monitor.record_diagnosis();
        monitor.record_fallback();
        monitor.record_commit();

        let snapshot = monitor.snapshot();
        assert_eq!(snapshot.events_received, 2);
        assert_eq!(snapshot.duplicates_skipped, 1);
        assert_eq!(snapshot.diagnoses, 1);
        assert_eq!(snapshot.fallbacks, 1);
        assert_eq!(snapshot.offsets_committed, 1);
    }

    #[test]
    fn test_concurrent_updates() {
        let monitor = Arc::new(HealthMonitor::new(1000));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let monitor = Arc::clone(&monitor);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        monitor.record_event_received();
                        monitor.record_analysis(i % 2 == 0);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(monitor.snapshot().events_received, 400);
        assert!((monitor.recent_error_rate() - 0.5).abs() < f64::EPSILON);
    }
}
