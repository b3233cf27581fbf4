//! Job statistics.
//!
//! Counters are fed from the same [`JobNotification`]s the event manager publishes, so the
//! numbers always agree with what observers saw. `queued` and `active` are gauges; every
//! other field only grows.

use crate::{
    events::{JobNotification, NotificationKind},
    job::JobState,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::{
    Arc,
    atomic::{AtomicI64, AtomicU64, Ordering},
};

/// Point-in-time copy of a [`Statistics`] instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatisticsSnapshot {
    pub queued: u64,
    pub active: u64,
    pub added: u64,
    pub started: u64,
    pub finished: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub stopped: u64,
    pub removed: u64,
    /// Jobs that reached a terminal state: finished, cancelled or stopped
    pub processed: u64,
    pub avg_processing_time_ms: f64,
    pub last_activated_at: Option<DateTime<Utc>>,
    pub last_finished_at: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
}

/// Lock-free statistics for one scope (the whole instance or a single queue).
#[derive(Debug)]
pub struct Statistics {
    queued: AtomicI64,
    active: AtomicI64,
    added: AtomicU64,
    started: AtomicU64,
    finished: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    stopped: AtomicU64,
    removed: AtomicU64,
    processing_time_total_ms: AtomicU64,
    processing_time_samples: AtomicU64,
    last_activated_ms: AtomicI64,
    last_finished_ms: AtomicI64,
    started_at: DateTime<Utc>,
}

impl Default for Statistics {
    fn default() -> Self {
        Self::new()
    }
}

impl Statistics {
    pub fn new() -> Self {
        Self {
            queued: AtomicI64::new(0),
            active: AtomicI64::new(0),
            added: AtomicU64::new(0),
            started: AtomicU64::new(0),
            finished: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
            stopped: AtomicU64::new(0),
            removed: AtomicU64::new(0),
            processing_time_total_ms: AtomicU64::new(0),
            processing_time_samples: AtomicU64::new(0),
            last_activated_ms: AtomicI64::new(0),
            last_finished_ms: AtomicI64::new(0),
            started_at: Utc::now(),
        }
    }

    pub fn record(&self, notification: &JobNotification) {
        match notification.previous_state {
            Some(JobState::Queued) => self.queued.fetch_sub(1, Ordering::AcqRel),
            Some(JobState::Running) => self.active.fetch_sub(1, Ordering::AcqRel),
            _ => 0,
        };

        let now_ms = notification.timestamp.timestamp_millis();
        match notification.kind {
            NotificationKind::Added => {
                self.added.fetch_add(1, Ordering::AcqRel);
                self.queued.fetch_add(1, Ordering::AcqRel);
            }
            NotificationKind::Started => {
                self.started.fetch_add(1, Ordering::AcqRel);
                self.active.fetch_add(1, Ordering::AcqRel);
                self.last_activated_ms.store(now_ms, Ordering::Release);
            }
            NotificationKind::Failed => {
                self.failed.fetch_add(1, Ordering::AcqRel);
                self.queued.fetch_add(1, Ordering::AcqRel);
            }
            NotificationKind::Finished => {
                self.finished.fetch_add(1, Ordering::AcqRel);
                self.last_finished_ms.store(now_ms, Ordering::Release);
            }
            NotificationKind::Cancelled => {
                self.cancelled.fetch_add(1, Ordering::AcqRel);
                self.last_finished_ms.store(now_ms, Ordering::Release);
            }
            NotificationKind::Stopped => {
                self.stopped.fetch_add(1, Ordering::AcqRel);
            }
            NotificationKind::Removed => {
                self.removed.fetch_add(1, Ordering::AcqRel);
            }
            NotificationKind::Retried => {
                self.queued.fetch_add(1, Ordering::AcqRel);
            }
        }

        if let Some(elapsed) = notification.processing_time_ms {
            self.processing_time_total_ms
                .fetch_add(elapsed, Ordering::AcqRel);
            self.processing_time_samples.fetch_add(1, Ordering::AcqRel);
        }
    }

    pub fn queued(&self) -> u64 {
        self.queued.load(Ordering::Acquire).max(0) as u64
    }

    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Acquire).max(0) as u64
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        let finished = self.finished.load(Ordering::Acquire);
        let cancelled = self.cancelled.load(Ordering::Acquire);
        let stopped = self.stopped.load(Ordering::Acquire);
        let samples = self.processing_time_samples.load(Ordering::Acquire);
        let total = self.processing_time_total_ms.load(Ordering::Acquire);

        StatisticsSnapshot {
            queued: self.queued(),
            active: self.active(),
            added: self.added.load(Ordering::Acquire),
            started: self.started.load(Ordering::Acquire),
            finished,
            failed: self.failed.load(Ordering::Acquire),
            cancelled,
            stopped,
            removed: self.removed.load(Ordering::Acquire),
            processed: finished + cancelled + stopped,
            avg_processing_time_ms: if samples == 0 {
                0.0
            } else {
                total as f64 / samples as f64
            },
            last_activated_at: millis_to_time(self.last_activated_ms.load(Ordering::Acquire)),
            last_finished_at: millis_to_time(self.last_finished_ms.load(Ordering::Acquire)),
            started_at: self.started_at,
        }
    }
}

fn millis_to_time(millis: i64) -> Option<DateTime<Utc>> {
    if millis == 0 {
        return None;
    }
    DateTime::from_timestamp_millis(millis)
}

/// Instance-wide statistics plus one [`Statistics`] per queue.
#[derive(Debug, Default)]
pub struct StatisticsRegistry {
    global: Arc<Statistics>,
    queues: DashMap<String, Arc<Statistics>>,
}

impl StatisticsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, notification: &JobNotification) {
        self.global.record(notification);
        self.queues
            .entry(notification.queue.clone())
            .or_default()
            .record(notification);
    }

    pub fn global(&self) -> Arc<Statistics> {
        Arc::clone(&self.global)
    }

    pub fn queue(&self, name: &str) -> Option<Arc<Statistics>> {
        self.queues.get(name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notification(kind: NotificationKind, queue: &str) -> JobNotification {
        JobNotification::new(kind, "1", "topic", "type", queue)
    }

    #[test]
    fn test_successful_lifecycle() {
        let stats = Statistics::new();
        stats.record(&notification(NotificationKind::Added, "q"));
        assert_eq!(stats.queued(), 1);

        stats.record(&notification(NotificationKind::Started, "q"));
        assert_eq!(stats.queued(), 0);
        assert_eq!(stats.active(), 1);

        stats.record(&notification(NotificationKind::Finished, "q").with_processing_time_ms(40));
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.active, 0);
        assert_eq!(snapshot.finished, 1);
        assert_eq!(snapshot.processed, 1);
        assert_eq!(snapshot.avg_processing_time_ms, 40.0);
        assert!(snapshot.last_finished_at.is_some());
    }

    #[test]
    fn test_failed_attempt_requeues() {
        let stats = Statistics::new();
        stats.record(&notification(NotificationKind::Added, "q"));
        stats.record(&notification(NotificationKind::Started, "q"));
        stats.record(&notification(NotificationKind::Failed, "q"));

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.queued, 1);
        assert_eq!(snapshot.active, 0);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.processed, 0);
    }

    #[test]
    fn test_cancel_from_queue() {
        let stats = Statistics::new();
        stats.record(&notification(NotificationKind::Added, "q"));
        stats.record(
            &notification(NotificationKind::Cancelled, "q").with_previous_state(Some(JobState::Queued)),
        );

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.queued, 0);
        assert_eq!(snapshot.active, 0);
        assert_eq!(snapshot.cancelled, 1);
    }

    #[test]
    fn test_manual_retry_of_running_job() {
        let stats = Statistics::new();
        stats.record(&notification(NotificationKind::Added, "q"));
        stats.record(&notification(NotificationKind::Started, "q"));
        stats.record(
            &notification(NotificationKind::Retried, "q").with_previous_state(Some(JobState::Running)),
        );

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.queued, 1);
        assert_eq!(snapshot.active, 0);
        assert_eq!(snapshot.failed, 0);
    }

    #[test]
    fn test_registry_tracks_queues() {
        let registry = StatisticsRegistry::new();
        registry.record(&notification(NotificationKind::Added, "a"));
        registry.record(&notification(NotificationKind::Added, "b"));
        registry.record(&notification(NotificationKind::Added, "b"));

        assert_eq!(registry.global().queued(), 3);
        assert_eq!(registry.queue("b").map(|s| s.queued()), Some(2));
        assert!(registry.queue("c").is_none());
        assert_eq!(registry.queue_names(), vec!["a".to_string(), "b".to_string()]);
    }
}
