//! What a consumer sees while it executes a job.

use crate::{
    job::Job,
    properties::{Properties, PropertyValue},
    update::{JobUpdate, JobUpdateCommand},
    Result,
};
use async_trait::async_trait;
use std::{
    sync::{Mutex, MutexGuard},
    time::Duration,
};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Outcome reported by a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult {
    /// The job succeeded.
    Ok,
    /// The attempt failed; the queue retries while retries remain.
    Failed(String),
    /// The job failed for good and must not be retried.
    Cancel(String),
}

impl JobResult {
    pub fn failed(reason: impl Into<String>) -> Self {
        JobResult::Failed(reason.into())
    }

    pub fn cancel(reason: impl Into<String>) -> Self {
        JobResult::Cancel(reason.into())
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, JobResult::Ok)
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            JobResult::Ok => None,
            JobResult::Failed(reason) | JobResult::Cancel(reason) => Some(reason),
        }
    }
}

/// Receives updates a running job publishes about itself.
#[async_trait]
pub trait JobUpdateListener: Send + Sync {
    async fn on_update(&self, update: JobUpdate) -> Result<()>;
}

/// Everything the queue needs once an execution ended.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    /// The job with every property change the consumer made
    pub job: Job,
    pub result: JobResult,
    pub processing_time: Duration,
    /// The execution's token was cancelled before it returned
    pub cancelled: bool,
}

/// Called exactly once per execution with its outcome.
#[async_trait]
pub trait JobCallback: Send + Sync {
    async fn on_complete(&self, outcome: JobOutcome);
}

#[derive(Default)]
struct PropertyChanges {
    set: Properties,
    removed: Vec<String>,
}

/// Execution context handed to [`JobConsumer::execute`](crate::subsystem::JobConsumer::execute).
///
/// Property changes are collected locally. [`update`](Self::update) publishes the changes
/// made since the last call as an `UPDATE_JOB`; whatever is left unpublished goes out with
/// the final result.
pub struct JobExecutionContext {
    job: Job,
    token: CancellationToken,
    listener: std::sync::Arc<dyn JobUpdateListener>,
    current: Mutex<Properties>,
    unpublished: Mutex<PropertyChanges>,
}

impl JobExecutionContext {
    pub fn new(
        job: Job,
        token: CancellationToken,
        listener: std::sync::Arc<dyn JobUpdateListener>,
    ) -> Self {
        let current = job.properties().clone();
        Self {
            job,
            token,
            listener,
            current: Mutex::new(current),
            unpublished: Mutex::new(PropertyChanges::default()),
        }
    }

    /// The job as it was delivered.
    pub fn job(&self) -> &Job {
        &self.job
    }

    /// Current value of `key`, including changes made during this execution.
    pub fn property(&self, key: &str) -> Option<PropertyValue> {
        lock(&self.current).get(key).cloned()
    }

    pub fn set_property(&self, key: impl Into<String>, value: impl Into<PropertyValue>) {
        let key = key.into();
        let value = value.into();
        lock(&self.current).insert(key.clone(), value.clone());

        let mut changes = lock(&self.unpublished);
        changes.removed.retain(|removed| removed != &key);
        changes.set.insert(key, value);
    }

    pub fn remove_property(&self, key: &str) {
        lock(&self.current).remove(key);

        let mut changes = lock(&self.unpublished);
        changes.set.remove(key);
        if !changes.removed.iter().any(|removed| removed == key) {
            changes.removed.push(key.to_string());
        }
    }

    /// Publishes pending property changes as an `UPDATE_JOB`.
    pub async fn update(&self) -> Result<()> {
        let changes = std::mem::take(&mut *lock(&self.unpublished));
        if changes.set.is_empty() && changes.removed.is_empty() {
            return Ok(());
        }

        let mut builder = JobUpdate::builder(self.job.id(), JobUpdateCommand::UpdateJob)
            .queue(self.job.queue())
            .properties(changes.set);
        for key in changes.removed {
            builder = builder.remove(key);
        }
        self.listener.on_update(builder.build()).await
    }

    /// Sends an arbitrary update through the listener. Only updates for this job with the
    /// `UPDATE_JOB` command are accepted.
    pub async fn send_update(&self, update: JobUpdate) -> Result<()> {
        self.listener.on_update(update).await
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves when the job was stopped or aborted.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// The delivered job with all property changes of this execution applied.
    pub fn final_job(&self) -> Job {
        let mut job = self.job.clone();
        let current = lock(&self.current).clone();
        let removed: Vec<String> = job
            .properties()
            .keys()
            .filter(|key| !current.contains_key(*key))
            .cloned()
            .collect();
        job.remove_properties(&removed);
        job.merge_properties(&current);
        job
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Default)]
    struct Collect {
        updates: tokio::sync::Mutex<Vec<JobUpdate>>,
    }

    #[async_trait]
    impl JobUpdateListener for Collect {
        async fn on_update(&self, update: JobUpdate) -> Result<()> {
            self.updates.lock().await.push(update);
            Ok(())
        }
    }

    fn context(listener: Arc<Collect>) -> JobExecutionContext {
        let mut props = Properties::new();
        props.insert("keep".to_string(), 1.into());
        props.insert("drop".to_string(), 2.into());
        JobExecutionContext::new(
            Job::new("9", "t", "type", "main", props),
            CancellationToken::new(),
            listener,
        )
    }

    #[tokio::test]
    async fn test_update_publishes_pending_changes_once() {
        let listener = Arc::new(Collect::default());
        let ctx = context(Arc::clone(&listener));

        ctx.set_property("progress", 50);
        ctx.remove_property("drop");
        ctx.update().await.unwrap();
        ctx.update().await.unwrap();

        let updates = listener.updates.lock().await;
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].command(), JobUpdateCommand::UpdateJob);
        assert_eq!(updates[0].properties()["progress"].as_i64(), Some(50));
        assert_eq!(updates[0].removed(), ["drop".to_string()]);
    }

    #[test]
    fn test_final_job_reflects_changes() {
        let ctx = context(Arc::new(Collect::default()));
        ctx.set_property("result", "done");
        ctx.remove_property("drop");

        let job = ctx.final_job();
        assert_eq!(job.property("result").and_then(|v| v.as_str()), Some("done"));
        assert!(job.property("drop").is_none());
        assert!(job.property("keep").is_some());
        assert_eq!(ctx.property("result"), Some("done".into()));
    }

    #[tokio::test]
    async fn test_cancellation() {
        let ctx = context(Arc::new(Collect::default()));
        assert!(!ctx.is_cancelled());
        ctx.cancellation_token().cancel();
        ctx.cancelled().await;
        assert!(ctx.is_cancelled());
    }

    #[test]
    fn test_job_result_helpers() {
        assert!(JobResult::Ok.is_ok());
        assert_eq!(JobResult::failed("boom").error(), Some("boom"));
        assert_eq!(JobResult::cancel("no").error(), Some("no"));
    }
}
