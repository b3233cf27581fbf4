//! The job manager: job creation, lookup, control commands and the single point where
//! updates are applied to storage.
//!
//! Every state change reaches the manager as a [`JobUpdate`]. Lifecycle notifications are
//! derived here by comparing the stored job before and after the update, so each accepted
//! transition is reported exactly once no matter which component caused it.

use crate::{
    config::{QueueConfiguration, QueueConfigurations},
    context::JobUpdateListener,
    error::JobMeshError,
    events::{EventFilter, EventManager, EventSubscription, JobNotification, NotificationKind},
    job::{Job, JobId, JobState, keys, new_job_id},
    metrics::PrometheusMetricsCollector,
    properties::{Properties, PropertyValue},
    queue::queue_topic,
    scheduler::{ScheduleOptions, Scheduler, task},
    stats::{StatisticsRegistry, StatisticsSnapshot},
    storage::JobStorage,
    transport::{MessageHandler, SubscriptionId, Transport, TransportMessage},
    update::{JOB_UPDATE_TOPIC, JobUpdate, JobUpdateCommand},
    Result,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::{
    cmp::Ordering,
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard, OnceLock, RwLock, Weak},
};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

/// How long a removed or blindly aborted job id keeps swallowing late updates.
const TOMBSTONE_TTL_SECS: i64 = 3600;

/// Starts queues on demand for the topics jobs are added to.
pub trait QueueDirectory: Send + Sync {
    fn ensure_queue(&self, configuration: &QueueConfiguration) -> Result<()>;
}

/// Which jobs [`JobManager::find_jobs`] looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryType {
    /// Every unfinished job, queued or running
    All,
    Active,
    Queued,
    /// Every finished job still in the history
    History,
    Succeeded,
    /// Finished without success: failed, stopped or aborted
    Cancelled,
    Failed,
    Stopped,
    Aborted,
}

impl QueryType {
    fn searches_history(&self) -> bool {
        !matches!(self, QueryType::All | QueryType::Active | QueryType::Queued)
    }

    fn accepts(&self, state: JobState) -> bool {
        match self {
            QueryType::All => !state.is_terminal(),
            QueryType::Active => state == JobState::Running,
            QueryType::Queued => state == JobState::Queued,
            QueryType::History => true,
            QueryType::Succeeded => state == JobState::Succeeded,
            QueryType::Cancelled => matches!(
                state,
                JobState::Failed | JobState::Stopped | JobState::Aborted
            ),
            QueryType::Failed => state == JobState::Failed,
            QueryType::Stopped => state == JobState::Stopped,
            QueryType::Aborted => state == JobState::Aborted,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Comparison {
    Equal,
    Less,
    LessOrEqual,
    Greater,
    GreaterOrEqual,
}

impl Comparison {
    /// Splits a template key such as `">=priority"` into operator and property name.
    fn parse(key: &str) -> (Self, &str) {
        const PREFIXES: [(&str, Comparison); 5] = [
            ("<=", Comparison::LessOrEqual),
            (">=", Comparison::GreaterOrEqual),
            ("<", Comparison::Less),
            (">", Comparison::Greater),
            ("=", Comparison::Equal),
        ];
        for (prefix, comparison) in PREFIXES {
            if let Some(name) = key.strip_prefix(prefix) {
                return (comparison, name);
            }
        }
        (Comparison::Equal, key)
    }

    fn holds(&self, ordering: Ordering) -> bool {
        match self {
            Comparison::Equal => ordering == Ordering::Equal,
            Comparison::Less => ordering == Ordering::Less,
            Comparison::LessOrEqual => ordering != Ordering::Greater,
            Comparison::Greater => ordering == Ordering::Greater,
            Comparison::GreaterOrEqual => ordering != Ordering::Less,
        }
    }
}

fn matches_template(job: &Job, template: &Properties) -> bool {
    template.iter().all(|(key, expected)| {
        let (comparison, name) = Comparison::parse(key);
        job.property(name)
            .and_then(|actual| actual.compare(expected))
            .is_some_and(|ordering| comparison.holds(ordering))
    })
}

pub struct JobManager {
    instance_id: String,
    configurations: QueueConfigurations,
    storage: Arc<dyn JobStorage>,
    transport: Arc<dyn Transport>,
    events: Arc<EventManager>,
    statistics: Arc<StatisticsRegistry>,
    history: Mutex<VecDeque<Job>>,
    history_size: usize,
    tombstones: DashMap<JobId, DateTime<Utc>>,
    live: DashMap<JobId, Arc<dyn JobUpdateListener>>,
    directory: RwLock<Option<Weak<dyn QueueDirectory>>>,
    scheduler: OnceLock<Arc<Scheduler>>,
    metrics: OnceLock<Arc<PrometheusMetricsCollector>>,
    subscription: Mutex<Option<SubscriptionId>>,
    job_locks: DashMap<JobId, Arc<tokio::sync::Mutex<()>>>,
}

impl JobManager {
    pub fn new(
        instance_id: impl Into<String>,
        configurations: QueueConfigurations,
        storage: Arc<dyn JobStorage>,
        transport: Arc<dyn Transport>,
        events: Arc<EventManager>,
        history_size: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            instance_id: instance_id.into(),
            configurations,
            storage,
            transport,
            events,
            statistics: Arc::new(StatisticsRegistry::new()),
            history: Mutex::new(VecDeque::new()),
            history_size,
            tombstones: DashMap::new(),
            live: DashMap::new(),
            directory: RwLock::new(None),
            scheduler: OnceLock::new(),
            metrics: OnceLock::new(),
            subscription: Mutex::new(None),
            job_locks: DashMap::new(),
        })
    }

    /// Subscribes the manager to the update topic.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut subscription = lock(&self.subscription);
        if subscription.is_none() {
            let handler = Arc::new(UpdateHandler {
                manager: Arc::downgrade(self),
            });
            *subscription = Some(self.transport.subscribe(JOB_UPDATE_TOPIC, handler)?);
            info!(instance_id = %self.instance_id, "Job manager started");
        }
        Ok(())
    }

    pub fn shutdown(&self) {
        if let Some(id) = lock(&self.subscription).take() {
            self.transport.unsubscribe(id);
        }
        info!(instance_id = %self.instance_id, "Job manager stopped");
    }

    pub fn set_queue_directory(&self, directory: Weak<dyn QueueDirectory>) {
        let mut slot = self
            .directory
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Some(directory);
    }

    pub fn set_scheduler(&self, scheduler: Arc<Scheduler>) {
        if self.scheduler.set(scheduler).is_err() {
            warn!("Job manager already has a scheduler");
        }
    }

    pub fn set_metrics(&self, metrics: Arc<PrometheusMetricsCollector>) {
        if self.metrics.set(metrics).is_err() {
            warn!("Job manager already has a metrics collector");
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn configurations(&self) -> &QueueConfigurations {
        &self.configurations
    }

    pub fn new_job_builder(
        self: &Arc<Self>,
        topic: impl Into<String>,
        job_type: impl Into<String>,
    ) -> JobBuilder {
        JobBuilder {
            manager: Arc::clone(self),
            topic: topic.into(),
            job_type: job_type.into(),
            id: None,
            properties: Properties::new(),
        }
    }

    /// The current snapshot of a job, active or finished.
    pub async fn get_job_by_id(&self, id: &str) -> Option<Job> {
        match self.storage.get(id).await {
            Ok(Some(job)) => return Some(job),
            Ok(None) => {}
            Err(e) => warn!(job_id = %id, error = %e, "Could not read job from storage"),
        }
        self.history_entry(id)
    }

    pub async fn stop_job_by_id(&self, id: &str) -> bool {
        self.control(id, JobUpdateCommand::StopJob).await
    }

    /// Aborts a job. The abort is published even for unknown ids, since another instance
    /// may still run the job or a producer may still send it, but only a known job reports
    /// success. An unknown id is refused from then on.
    pub async fn abort_job(&self, id: &str) -> bool {
        let known = self.get_job_by_id(id).await.is_some();
        if !known {
            debug!(job_id = %id, "Aborting unknown job");
            self.tombstone(id);
        }
        let update = JobUpdate::builder(id, JobUpdateCommand::AbortJob).build();
        match self.publish_update(&update).await {
            Ok(()) => known,
            Err(e) => {
                warn!(job_id = %id, error = %e, "Failed to publish abort");
                false
            }
        }
    }

    pub async fn retry_job_by_id(&self, id: &str) -> bool {
        self.control(id, JobUpdateCommand::RetryJob).await
    }

    async fn control(&self, id: &str, command: JobUpdateCommand) -> bool {
        let Some(job) = self.get_job_by_id(id).await else {
            debug!(job_id = %id, command = %command, "Control command for unknown job");
            return false;
        };
        let update = JobUpdate::builder(id, command).queue(job.queue()).build();
        match self.publish_update(&update).await {
            Ok(()) => true,
            Err(e) => {
                warn!(job_id = %id, command = %command, error = %e, "Failed to publish control command");
                false
            }
        }
    }

    /// Removes a job for good. A running execution is cancelled and its result discarded;
    /// the job stays visible in the history.
    pub async fn remove_job_by_id(&self, id: &str) -> bool {
        let _guard = self.lock_job(id).await;
        let Some(mut job) = self.get_job_by_id(id).await else {
            return false;
        };
        self.tombstone(id);

        if let Some((_, listener)) = self.live.remove(id) {
            let stop = JobUpdate::builder(id, JobUpdateCommand::StopJob).build();
            if let Err(e) = listener.on_update(stop).await {
                warn!(job_id = %id, error = %e, "Could not cancel removed job");
            }
        }

        let previous = job.state();
        if !previous.is_terminal() {
            job.set_error(Some("removed".to_string()));
            if let Err(e) = job.transition(JobState::Stopped) {
                warn!(job_id = %id, error = %e, "Could not stop removed job");
            }
        }
        if let Err(e) = self.storage.remove(id).await {
            warn!(job_id = %id, error = %e, "Could not remove job from storage");
        }
        self.push_history(job.clone());

        info!(job_id = %id, "Job removed");
        self.notify(
            JobNotification::for_job(NotificationKind::Removed, &job)
                .with_previous_state(gauge_state(previous)),
        );
        true
    }

    /// Looks jobs up by state, topic and property templates, oldest first.
    ///
    /// Templates are alternatives: a job matches if it satisfies every comparison of any
    /// one non-empty template. A template key may carry a `=`, `<`, `<=`, `>` or `>=`
    /// prefix; a bare key compares for equality. `limit` of 0 returns every match.
    pub async fn find_jobs(
        &self,
        query: QueryType,
        topic: Option<&str>,
        limit: usize,
        templates: &[Properties],
    ) -> Vec<Job> {
        let candidates = if query.searches_history() {
            lock(&self.history).iter().cloned().collect()
        } else {
            match self.storage.list().await {
                Ok(jobs) => jobs,
                Err(e) => {
                    warn!(error = %e, "Could not list active jobs");
                    Vec::new()
                }
            }
        };

        let templates: Vec<&Properties> = templates.iter().filter(|t| !t.is_empty()).collect();
        let mut jobs: Vec<Job> = candidates
            .into_iter()
            .filter(|job| query.accepts(job.state()))
            .filter(|job| topic.is_none_or(|topic| job.topic() == topic))
            .filter(|job| {
                templates.is_empty() || templates.iter().any(|t| matches_template(job, t))
            })
            .collect();
        jobs.sort_by_key(|job| job.created_at());
        if limit > 0 {
            jobs.truncate(limit);
        }
        jobs
    }

    pub fn statistics(&self) -> StatisticsSnapshot {
        self.statistics.global().snapshot()
    }

    pub fn queue_statistics(&self, queue: &str) -> Option<StatisticsSnapshot> {
        self.statistics.queue(queue).map(|stats| stats.snapshot())
    }

    pub fn statistics_registry(&self) -> &Arc<StatisticsRegistry> {
        &self.statistics
    }

    pub fn subscribe(&self, filter: EventFilter) -> EventSubscription {
        self.events.subscribe(filter)
    }

    /// Applies an inbound update.
    ///
    /// Control commands for a job running on this instance go to its execution. Everything
    /// else is applied to the stored snapshot; an update for an unknown id creates a record.
    pub async fn update(&self, update: JobUpdate) -> Result<()> {
        let id = update.job_id().to_string();
        if self.is_removed(&id) {
            debug!(job_id = %id, command = %update.command(), "Dropping update for removed job");
            return Ok(());
        }

        let command = update.command();
        if command.is_control() {
            let listener = self.live.get(&id).map(|entry| Arc::clone(entry.value()));
            if let Some(listener) = listener {
                debug!(job_id = %id, command = %command, "Delivering control command to running job");
                return listener.on_update(update).await;
            }
        }

        let _guard = self.lock_job(&id).await;
        if self.is_removed(&id) {
            debug!(job_id = %id, command = %command, "Dropping update for removed job");
            return Ok(());
        }
        let current = self.get_job_by_id(&id).await;
        match command {
            JobUpdateCommand::StopJob => self.stop_queued(current, JobState::Stopped).await,
            JobUpdateCommand::AbortJob if current.is_none() => {
                debug!(job_id = %id, "Abort for unknown job; refusing the id from now on");
                self.tombstone(&id);
                Ok(())
            }
            JobUpdateCommand::AbortJob => self.stop_queued(current, JobState::Aborted).await,
            JobUpdateCommand::RetryJob => self.requeue(current).await,
            JobUpdateCommand::StartJob | JobUpdateCommand::UpdateJob => {
                self.apply(current, &update).await
            }
        }
    }

    async fn stop_queued(&self, current: Option<Job>, target: JobState) -> Result<()> {
        let Some(mut job) = current else {
            return Ok(());
        };
        match job.state() {
            JobState::Queued => {
                let before = job.clone();
                job.transition(target)?;
                self.store(&job).await?;
                info!(job_id = %job.id(), state = %target, "Queued job stopped");
                self.notify_transition(&before, &job);
            }
            JobState::Running => {
                debug!(job_id = %job.id(), "Job runs on another instance; ignoring control command");
            }
            state => debug!(job_id = %job.id(), state = %state, "Job already finished"),
        }
        Ok(())
    }

    async fn requeue(&self, current: Option<Job>) -> Result<()> {
        let Some(mut job) = current else {
            return Ok(());
        };
        if job.state() == JobState::Running {
            debug!(job_id = %job.id(), "Job runs on another instance; ignoring retry");
            return Ok(());
        }

        let previous = job.state();
        job.set_retry_count(0);
        job.set_error(None);
        job.transition(JobState::Queued)?;
        self.store(&job).await?;
        info!(job_id = %job.id(), "Job requeued");
        self.notify(
            JobNotification::for_job(NotificationKind::Retried, &job)
                .with_previous_state(gauge_state(previous)),
        );

        let resolved = self.configurations.resolve(job.topic());
        self.ensure_queue(resolved.configuration());
        self.transport
            .publish(
                &queue_topic(job.queue()),
                JobUpdateCommand::StartJob,
                job.to_message(),
            )
            .await
    }

    async fn apply(&self, current: Option<Job>, update: &JobUpdate) -> Result<()> {
        let mut job = match current {
            Some(job) => job,
            None => {
                debug!(job_id = %update.job_id(), "Update for unknown job; creating a record");
                self.materialize(update)
            }
        };
        let before = job.clone();
        update.apply_to(&mut job)?;
        self.store(&job).await?;
        self.notify_transition(&before, &job);
        Ok(())
    }

    fn materialize(&self, update: &JobUpdate) -> Job {
        let text = |key: &str| {
            update
                .properties()
                .get(key)
                .and_then(PropertyValue::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let queue = update
            .queue()
            .unwrap_or(self.configurations.main().name.as_str())
            .to_string();
        Job::new(
            update.job_id(),
            text(keys::TOPIC),
            text(keys::TYPE),
            queue,
            Properties::new(),
        )
    }

    /// Writes a snapshot: unfinished jobs live in storage, finished ones in the history.
    async fn store(&self, job: &Job) -> Result<()> {
        if !job.is_terminal() {
            self.storage.put(job.clone()).await?;
            self.remove_history(job.id());
            return Ok(());
        }

        self.storage.remove(job.id()).await?;
        let keep = job.state() != JobState::Succeeded
            || self
                .configurations
                .resolve(job.topic())
                .configuration()
                .keep_finished_jobs;
        if keep {
            self.push_history(job.clone());
        } else {
            self.remove_history(job.id());
        }
        Ok(())
    }

    fn notify_transition(&self, before: &Job, after: &Job) {
        if let Some(notification) = transition_notification(before, after) {
            self.notify(notification);
        }
    }

    /// Records and publishes a notification.
    pub fn notify(&self, notification: JobNotification) {
        self.statistics.record(&notification);
        if let Some(metrics) = self.metrics.get() {
            metrics.record(&notification);
        }
        self.events.publish(notification);
    }

    fn ensure_queue(&self, configuration: &QueueConfiguration) {
        let directory = self
            .directory
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .and_then(Weak::upgrade);
        match directory {
            Some(directory) => {
                if let Err(e) = directory.ensure_queue(configuration) {
                    warn!(queue = %configuration.name, error = %e, "Could not start queue");
                }
            }
            None => debug!(queue = %configuration.name, "No queue directory; queue not started"),
        }
    }

    async fn publish_update(&self, update: &JobUpdate) -> Result<()> {
        self.transport
            .publish(JOB_UPDATE_TOPIC, update.command(), update.to_message())
            .await
    }

    pub(crate) fn is_removed(&self, id: &str) -> bool {
        self.tombstones.contains_key(id)
    }

    /// Serializes changes to one job id. Other ids are not blocked.
    async fn lock_job(&self, id: &str) -> JobLock<'_> {
        let mutex = Arc::clone(&self.job_locks.entry(id.to_string()).or_default());
        JobLock {
            locks: &self.job_locks,
            id: id.to_string(),
            guard: Some(mutex.lock_owned().await),
        }
    }

    /// Registers the execution lease of a job running on this instance.
    pub(crate) fn register_live(&self, id: &str, listener: Arc<dyn JobUpdateListener>) {
        self.live.insert(id.to_string(), listener);
    }

    pub(crate) fn unregister_live(&self, id: &str) {
        self.live.remove(id);
    }

    fn tombstone(&self, id: &str) {
        let now = Utc::now();
        let horizon = now - ChronoDuration::seconds(TOMBSTONE_TTL_SECS);
        self.tombstones.retain(|_, removed_at| *removed_at > horizon);
        self.tombstones.insert(id.to_string(), now);
    }

    fn history_entry(&self, id: &str) -> Option<Job> {
        lock(&self.history).iter().find(|job| job.id() == id).cloned()
    }

    fn push_history(&self, job: Job) {
        let mut history = lock(&self.history);
        history.retain(|entry| entry.id() != job.id());
        if self.history_size == 0 {
            return;
        }
        history.push_back(job);
        while history.len() > self.history_size {
            history.pop_front();
        }
    }

    fn remove_history(&self, id: &str) {
        lock(&self.history).retain(|entry| entry.id() != id);
    }
}

/// The notification describing the step from `before` to `after`, if any.
fn transition_notification(before: &Job, after: &Job) -> Option<JobNotification> {
    let previous = gauge_state(before.state());
    let kind = match (before.state(), after.state()) {
        (from, to) if from == to => return None,
        (_, JobState::Running) => NotificationKind::Started,
        (_, JobState::Succeeded) => NotificationKind::Finished,
        (_, JobState::Failed) => NotificationKind::Cancelled,
        (_, JobState::Stopped | JobState::Aborted) => NotificationKind::Stopped,
        (JobState::Running, JobState::Queued) if after.retry_count() > before.retry_count() => {
            NotificationKind::Failed
        }
        (_, JobState::Queued) => NotificationKind::Retried,
    };

    let mut notification =
        JobNotification::for_job(kind, after).with_previous_state(previous);
    if let Some(error) = after.error() {
        if matches!(kind, NotificationKind::Failed | NotificationKind::Cancelled) {
            notification = notification.with_error(error);
        }
    }
    if kind == NotificationKind::Finished {
        if let (Some(started), Some(finished)) = (after.started_at(), after.finished_at()) {
            let elapsed = (finished - started).num_milliseconds().max(0) as u64;
            notification = notification.with_processing_time_ms(elapsed);
        }
    }
    Some(notification)
}

/// The state a notification releases from the queued or active gauge.
fn gauge_state(state: JobState) -> Option<JobState> {
    matches!(state, JobState::Queued | JobState::Running).then_some(state)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Held while one job id is changed. The id's lock entry is dropped with its last holder.
struct JobLock<'a> {
    locks: &'a DashMap<JobId, Arc<tokio::sync::Mutex<()>>>,
    id: JobId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for JobLock<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .remove_if(&self.id, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

/// Feeds updates from the transport into the manager.
struct UpdateHandler {
    manager: Weak<JobManager>,
}

#[async_trait]
impl MessageHandler for UpdateHandler {
    async fn on_message(&self, topic: &str, message: &TransportMessage) -> bool {
        let Some(manager) = self.manager.upgrade() else {
            return false;
        };
        match JobUpdate::from_message(&message.body) {
            Ok(update) => {
                let id = update.job_id().to_string();
                if let Err(e) = manager.update(update).await {
                    warn!(job_id = %id, error = %e, "Rejected job update");
                }
            }
            Err(e) => warn!(topic = %topic, error = %e, "Dropping malformed job update"),
        }
        false
    }
}

/// Collects the data of a new job. Created by [`JobManager::new_job_builder`].
pub struct JobBuilder {
    manager: Arc<JobManager>,
    topic: String,
    job_type: String,
    id: Option<JobId>,
    properties: Properties,
}

impl JobBuilder {
    /// Uses a producer supplied id instead of a generated one.
    pub fn id(mut self, id: impl Into<JobId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn property(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn properties(mut self, properties: Properties) -> Self {
        self.properties.extend(properties);
        self
    }

    /// Stores the job as QUEUED and sends it to its queue.
    pub async fn add(self) -> Result<Job> {
        let manager = self.manager;
        if let Some(key) = self
            .properties
            .keys()
            .find(|key| keys::RESERVED.contains(&key.as_str()))
        {
            return Err(JobMeshError::IllegalArgument {
                message: format!("property '{}' is reserved", key),
            });
        }

        let id = match self.id {
            Some(id) if id.is_empty() => {
                return Err(JobMeshError::IllegalArgument {
                    message: "job id must not be empty".to_string(),
                });
            }
            Some(id) => id,
            None => new_job_id(),
        };

        // the id check and the first write happen under the id's lock
        let guard = manager.lock_job(&id).await;
        if manager.is_removed(&id) || manager.get_job_by_id(&id).await.is_some() {
            return Err(JobMeshError::IllegalArgument {
                message: format!("job id {} is already in use", id),
            });
        }

        let resolved = manager.configurations.resolve(&self.topic);
        let job = Job::new(
            id,
            self.topic,
            self.job_type,
            resolved.name(),
            self.properties,
        );
        manager.storage.put(job.clone()).await?;
        drop(guard);
        manager.ensure_queue(resolved.configuration());
        manager.notify(JobNotification::for_job(NotificationKind::Added, &job));

        if let Err(e) = manager
            .transport
            .publish(
                &queue_topic(job.queue()),
                JobUpdateCommand::StartJob,
                job.to_message(),
            )
            .await
        {
            let _guard = manager.lock_job(job.id()).await;
            let mut failed = job.clone();
            failed.set_error(Some(e.to_string()));
            if failed.transition(JobState::Failed).is_ok() {
                manager.store(&failed).await?;
                manager.notify_transition(&job, &failed);
            }
            return Err(e);
        }

        debug!(
            job_id = %job.id(),
            topic = %job.topic(),
            job_type = %job.job_type(),
            queue = %job.queue(),
            "Job added"
        );
        Ok(job)
    }

    /// Registers a trigger that adds a fresh job with these properties on every fire.
    pub fn schedule(self, options: ScheduleOptions) -> Result<String> {
        if self.id.is_some() {
            return Err(JobMeshError::IllegalArgument {
                message: "scheduled jobs get a fresh id on every fire".to_string(),
            });
        }
        let scheduler = self
            .manager
            .scheduler
            .get()
            .cloned()
            .ok_or_else(|| JobMeshError::Scheduler {
                message: "no scheduler is configured".to_string(),
            })?;

        let manager = Arc::downgrade(&self.manager);
        let topic = self.topic;
        let job_type = self.job_type;
        let properties = self.properties;
        scheduler.schedule(
            task(move || {
                let manager = manager.clone();
                let topic = topic.clone();
                let job_type = job_type.clone();
                let properties = properties.clone();
                async move {
                    let Some(manager) = manager.upgrade() else {
                        return Ok(());
                    };
                    manager
                        .new_job_builder(topic, job_type)
                        .properties(properties)
                        .add()
                        .await
                        .map(|_| ())
                }
            }),
            options,
        )
    }
}
