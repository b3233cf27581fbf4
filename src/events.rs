//! Job lifecycle notifications.
//!
//! Every observable step in a job's life is published as a [`JobNotification`] through the
//! [`EventManager`], a thin layer over a tokio broadcast channel. Subscribers pick what they
//! care about with an [`EventFilter`].
//!
//! | kind        | published when                                                  |
//! |-------------|-----------------------------------------------------------------|
//! | `Added`     | a job was stored and its START_JOB sent                         |
//! | `Started`   | a consumer accepted the job and began executing it              |
//! | `Finished`  | the job succeeded                                               |
//! | `Failed`    | an attempt failed and the job will be redelivered               |
//! | `Cancelled` | the job failed for good (retries exhausted, cancel, no consumer)|
//! | `Stopped`   | the job was stopped or aborted                                  |
//! | `Removed`   | the job was removed by id                                       |
//! | `Retried`   | the job was put back into its queue by a manual retry           |
//!
//! ```rust
//! use jobmesh::events::{EventFilter, EventManager, JobNotification, NotificationKind};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let manager = EventManager::new_default();
//! let mut subscription =
//!     manager.subscribe(EventFilter::new().with_kinds(vec![NotificationKind::Finished]));
//!
//! manager.publish(JobNotification::new(
//!     NotificationKind::Finished,
//!     "42",
//!     "reports/daily",
//!     "reports/render",
//!     "reports",
//! ));
//!
//! let notification = subscription.recv().await.unwrap();
//! assert_eq!(notification.job_id, "42");
//! # }
//! ```

use crate::job::{Job, JobId, JobState};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc};
use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Added,
    Started,
    Finished,
    Failed,
    Cancelled,
    Stopped,
    Removed,
    Retried,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Added => "added",
            NotificationKind::Started => "started",
            NotificationKind::Finished => "finished",
            NotificationKind::Failed => "failed",
            NotificationKind::Cancelled => "cancelled",
            NotificationKind::Stopped => "stopped",
            NotificationKind::Removed => "removed",
            NotificationKind::Retried => "retried",
        }
    }

    /// Terminal kinds are emitted exactly once per job.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NotificationKind::Finished | NotificationKind::Cancelled | NotificationKind::Stopped
        )
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single lifecycle event for one job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobNotification {
    pub event_id: Uuid,
    pub kind: NotificationKind,
    pub job_id: JobId,
    pub topic: String,
    pub job_type: String,
    pub queue: String,
    pub retry_count: u32,
    /// State the job left with this event, if it was queued or running. Statistics use it
    /// to release the right gauge.
    pub previous_state: Option<JobState>,
    pub processing_time_ms: Option<u64>,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl JobNotification {
    pub fn new(
        kind: NotificationKind,
        job_id: impl Into<JobId>,
        topic: impl Into<String>,
        job_type: impl Into<String>,
        queue: impl Into<String>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            kind,
            job_id: job_id.into(),
            topic: topic.into(),
            job_type: job_type.into(),
            queue: queue.into(),
            retry_count: 0,
            previous_state: match kind {
                NotificationKind::Started => Some(JobState::Queued),
                NotificationKind::Finished
                | NotificationKind::Failed
                | NotificationKind::Cancelled
                | NotificationKind::Stopped => Some(JobState::Running),
                NotificationKind::Added
                | NotificationKind::Removed
                | NotificationKind::Retried => None,
            },
            processing_time_ms: None,
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn for_job(kind: NotificationKind, job: &Job) -> Self {
        Self::new(kind, job.id(), job.topic(), job.job_type(), job.queue())
            .with_retry_count(job.retry_count())
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn with_previous_state(mut self, previous_state: Option<JobState>) -> Self {
        self.previous_state = previous_state;
        self
    }

    pub fn with_processing_time_ms(mut self, processing_time_ms: u64) -> Self {
        self.processing_time_ms = Some(processing_time_ms);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Selects notifications by kind, queue, topic and job type. Empty lists match all.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EventFilter {
    pub kinds: Vec<NotificationKind>,
    pub queues: Vec<String>,
    pub topics: Vec<String>,
    pub job_types: Vec<String>,
    pub job_ids: Vec<JobId>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_kinds(mut self, kinds: Vec<NotificationKind>) -> Self {
        self.kinds = kinds;
        self
    }

    pub fn with_queues(mut self, queues: Vec<String>) -> Self {
        self.queues = queues;
        self
    }

    pub fn with_topics(mut self, topics: Vec<String>) -> Self {
        self.topics = topics;
        self
    }

    pub fn with_job_types(mut self, job_types: Vec<String>) -> Self {
        self.job_types = job_types;
        self
    }

    pub fn with_job_ids(mut self, job_ids: Vec<JobId>) -> Self {
        self.job_ids = job_ids;
        self
    }

    pub fn matches(&self, notification: &JobNotification) -> bool {
        (self.kinds.is_empty() || self.kinds.contains(&notification.kind))
            && (self.queues.is_empty() || self.queues.contains(&notification.queue))
            && (self.topics.is_empty() || self.topics.contains(&notification.topic))
            && (self.job_types.is_empty() || self.job_types.contains(&notification.job_type))
            && (self.job_ids.is_empty() || self.job_ids.contains(&notification.job_id))
    }
}

/// Receives notifications matching its filter.
///
/// Dropping the subscription unregisters it.
#[derive(Debug)]
pub struct EventSubscription {
    pub id: Uuid,
    pub filter: EventFilter,
    receiver: broadcast::Receiver<JobNotification>,
    registry: Arc<DashMap<Uuid, EventFilter>>,
}

impl EventSubscription {
    /// Waits for the next matching notification.
    ///
    /// Returns `None` once the manager is gone. Lagging receivers skip what they missed.
    pub async fn recv(&mut self) -> Option<JobNotification> {
        loop {
            match self.receiver.recv().await {
                Ok(notification) if self.filter.matches(&notification) => {
                    return Some(notification);
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(subscription = %self.id, skipped, "Notification subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Returns an already buffered matching notification without waiting.
    pub fn try_recv(&mut self) -> Option<JobNotification> {
        loop {
            match self.receiver.try_recv() {
                Ok(notification) if self.filter.matches(&notification) => {
                    return Some(notification);
                }
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        self.registry.remove(&self.id);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventConfig {
    /// Capacity of the broadcast channel
    pub max_buffer_size: usize,
    /// Log every published notification at debug level
    pub log_events: bool,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            max_buffer_size: 10_000,
            log_events: false,
        }
    }
}

/// Fan-out hub for job notifications.
pub struct EventManager {
    sender: broadcast::Sender<JobNotification>,
    subscriptions: Arc<DashMap<Uuid, EventFilter>>,
    config: EventConfig,
}

impl EventManager {
    pub fn new(config: EventConfig) -> Self {
        let (sender, _) = broadcast::channel(config.max_buffer_size.max(1));

        Self {
            sender,
            subscriptions: Arc::new(DashMap::new()),
            config,
        }
    }

    pub fn new_default() -> Self {
        Self::new(EventConfig::default())
    }

    /// Publishes a notification to every subscriber. Having no subscribers is not an error.
    pub fn publish(&self, notification: JobNotification) {
        if self.config.log_events {
            tracing::debug!(
                kind = %notification.kind,
                job_id = %notification.job_id,
                queue = %notification.queue,
                "Publishing job notification"
            );
        }
        let _ = self.sender.send(notification);
    }

    pub fn subscribe(&self, filter: EventFilter) -> EventSubscription {
        let id = Uuid::new_v4();
        self.subscriptions.insert(id, filter.clone());

        EventSubscription {
            id,
            filter,
            receiver: self.sender.subscribe(),
            registry: Arc::clone(&self.subscriptions),
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }
}

impl Default for EventManager {
    fn default() -> Self {
        Self::new_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn notification(kind: NotificationKind, id: &str) -> JobNotification {
        JobNotification::new(kind, id, "mail/outbound", "mail/send", "mail")
    }

    #[test]
    fn test_event_filter_matching() {
        let finished = notification(NotificationKind::Finished, "1");
        assert!(EventFilter::new().matches(&finished));
        assert!(
            EventFilter::new()
                .with_kinds(vec![NotificationKind::Finished])
                .with_queues(vec!["mail".to_string()])
                .matches(&finished)
        );
        assert!(
            !EventFilter::new()
                .with_kinds(vec![NotificationKind::Failed])
                .matches(&finished)
        );
        assert!(
            !EventFilter::new()
                .with_job_types(vec!["other".to_string()])
                .matches(&finished)
        );
    }

    #[test]
    fn test_previous_state_defaults() {
        assert_eq!(
            notification(NotificationKind::Finished, "1").previous_state,
            Some(JobState::Running)
        );
        assert_eq!(notification(NotificationKind::Added, "1").previous_state, None);
        assert_eq!(
            notification(NotificationKind::Cancelled, "1")
                .with_previous_state(Some(JobState::Queued))
                .previous_state,
            Some(JobState::Queued)
        );
    }

    #[tokio::test]
    async fn test_filtered_subscription() {
        let manager = EventManager::new_default();
        let mut subscription =
            manager.subscribe(EventFilter::new().with_kinds(vec![NotificationKind::Finished]));

        manager.publish(notification(NotificationKind::Failed, "1"));
        manager.publish(notification(NotificationKind::Finished, "2"));

        let received = timeout(Duration::from_millis(100), subscription.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.job_id, "2");
        assert!(subscription.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_subscription_drop_unregisters() {
        let manager = EventManager::new_default();
        let subscription = manager.subscribe(EventFilter::new());
        assert_eq!(manager.subscription_count(), 1);

        drop(subscription);
        assert_eq!(manager.subscription_count(), 0);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let manager = EventManager::new_default();
        manager.publish(notification(NotificationKind::Added, "1"));
    }
}
