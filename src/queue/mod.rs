//! Job queues.
//!
//! Every queue listens on its own transport topic (see [`queue_topic`]) and runs one
//! dispatch task. The task sleeps on a [`Notify`] until a job arrives, a running job
//! completes or a retry delay elapses, and then hands as many jobs as the queue allows to
//! the [`JobSubsystem`]:
//!
//! - `ORDERED` queues run at most one job per topic. A failed job blocks its topic until
//!   its retry delay elapsed and it ran again, so same-topic jobs finish in enqueue order.
//! - `UNORDERED` queues run up to `max_parallel` jobs and never two with the same id.
//! - `TOPIC_ROUND_ROBIN` queues run like `UNORDERED` ones but serve queued topics in turn.
//! - `IGNORE` queues drop deliveries; the jobs stay queued for another instance.
//!
//! A queue can be suspended. A suspended queue keeps accepting jobs but starts none until
//! it is resumed, or until it was suspended for an hour.
//!
//! The queue never touches job storage. It publishes `UPDATE_JOB`s describing what
//! happened and the [`JobManager`] applies them.

pub mod bridge;

use crate::{
    config::{QueueConfiguration, QueueType},
    context::{JobCallback, JobOutcome, JobResult, JobUpdateListener},
    error::JobMeshError,
    job::{Job, JobId, JobState},
    manager::{JobManager, QueueDirectory},
    retry::RetryStrategy,
    subsystem::{ExecutionHandle, ExecutionOptions, JobSubsystem},
    transport::{SubscriptionId, Transport},
    update::{JobUpdate, JobUpdateCommand},
    Result,
};
use async_trait::async_trait;
use bridge::{BridgeUpdateListener, QueueBridge, final_update, publish_update};
use dashmap::DashMap;
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::{sync::Notify, task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Transport topic carrying the START_JOB messages of queue `name`.
pub fn queue_topic(name: &str) -> String {
    format!("jobmesh/queue/{}", name)
}

/// A suspended queue resumes on its own after this long.
const MAX_SUSPEND: Duration = Duration::from_secs(60 * 60);

/// Point-in-time queue counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueSnapshot {
    pub pending: usize,
    pub waiting: usize,
    pub active: usize,
    pub suspended: bool,
}

struct WaitingJob {
    job: Job,
    ready_at: Instant,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Job>,
    /// Failed jobs sitting out their retry delay
    waiting: Vec<WaitingJob>,
    /// Running job ids and their topics
    active: HashMap<JobId, String>,
    suspended_since: Option<Instant>,
    /// Topic a round robin queue served last
    last_topic: Option<String>,
}

impl QueueState {
    fn contains(&self, id: &str) -> bool {
        self.active.contains_key(id)
            || self.pending.iter().any(|job| job.id() == id)
            || self.waiting.iter().any(|waiting| waiting.job.id() == id)
    }

    /// Moves every job whose delay elapsed to the front of the pending queue, earliest first.
    fn promote_due(&mut self, now: Instant) {
        let mut due = Vec::new();
        let mut index = 0;
        while index < self.waiting.len() {
            if self.waiting[index].ready_at <= now {
                due.push(self.waiting.swap_remove(index));
            } else {
                index += 1;
            }
        }
        due.sort_by_key(|waiting| std::cmp::Reverse(waiting.ready_at));
        for waiting in due {
            self.pending.push_front(waiting.job);
        }
    }

    /// Takes up to `capacity` jobs, one topic at a time, continuing after the topic
    /// served last.
    fn take_round_robin(&mut self, capacity: usize) -> Vec<Job> {
        let mut ready = Vec::new();
        while ready.len() < capacity {
            let mut topics: Vec<&str> = Vec::new();
            for job in &self.pending {
                if !self.active.contains_key(job.id()) && !topics.contains(&job.topic()) {
                    topics.push(job.topic());
                }
            }
            if topics.is_empty() {
                break;
            }
            if let Some(last) = self.last_topic.as_deref() {
                if let Some(position) = topics.iter().position(|topic| *topic == last) {
                    topics.rotate_left(position + 1);
                }
            }
            let topic = topics[0].to_string();
            let index = self
                .pending
                .iter()
                .position(|job| job.topic() == topic && !self.active.contains_key(job.id()));
            let Some(job) = index.and_then(|index| self.pending.remove(index)) else {
                break;
            };
            self.active.insert(job.id().to_string(), topic.clone());
            self.last_topic = Some(topic);
            ready.push(job);
        }
        ready
    }

    fn next_wakeup(&self) -> Option<Instant> {
        self.waiting.iter().map(|waiting| waiting.ready_at).min()
    }
}

pub struct JobQueue {
    name: String,
    configuration: QueueConfiguration,
    retry_strategy: RetryStrategy,
    manager: Arc<JobManager>,
    subsystem: Arc<JobSubsystem>,
    transport: Arc<dyn Transport>,
    state: Mutex<QueueState>,
    notify: Notify,
    shutdown: CancellationToken,
}

impl JobQueue {
    fn new(
        configuration: QueueConfiguration,
        manager: Arc<JobManager>,
        subsystem: Arc<JobSubsystem>,
        transport: Arc<dyn Transport>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: configuration.name.clone(),
            retry_strategy: configuration.retry_strategy(),
            configuration,
            manager,
            subsystem,
            transport,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            shutdown,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn configuration(&self) -> &QueueConfiguration {
        &self.configuration
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let state = self.lock_state();
        QueueSnapshot {
            pending: state.pending.len(),
            waiting: state.waiting.len(),
            active: state.active.len(),
            suspended: state.suspended_since.is_some(),
        }
    }

    /// Stops starting jobs. Running jobs finish and new deliveries are still accepted.
    pub fn suspend(&self) {
        let mut state = self.lock_state();
        if state.suspended_since.is_none() {
            state.suspended_since = Some(Instant::now());
            info!(queue = %self.name, "Queue suspended");
        }
    }

    pub fn resume(&self) {
        if self.lock_state().suspended_since.take().is_some() {
            info!(queue = %self.name, "Queue resumed");
        }
        self.notify.notify_one();
    }

    pub fn is_suspended(&self) -> bool {
        self.lock_state().suspended_since.is_some()
    }

    /// Drops every job this queue holds but has not started and returns how many.
    ///
    /// The jobs stay QUEUED in storage; [`JobManager::retry_job_by_id`] delivers one again.
    pub fn clear(&self) -> usize {
        let cleared = {
            let mut state = self.lock_state();
            let cleared = state.pending.len() + state.waiting.len();
            state.pending.clear();
            state.waiting.clear();
            cleared
        };
        info!(queue = %self.name, cleared, "Queue cleared");
        cleared
    }

    /// Removes every job this queue holds but has not started, like
    /// [`JobManager::remove_job_by_id`] would. Running jobs are left alone.
    pub async fn remove_all(&self) -> usize {
        let was_suspended = self.is_suspended();
        self.suspend();
        let ids: Vec<JobId> = {
            let mut state = self.lock_state();
            let waiting = std::mem::take(&mut state.waiting);
            let ids = state
                .pending
                .drain(..)
                .chain(waiting.into_iter().map(|waiting| waiting.job))
                .map(|job| job.id().to_string())
                .collect();
            ids
        };

        let mut removed = 0;
        for id in &ids {
            if self.manager.remove_job_by_id(id).await {
                removed += 1;
            }
        }
        info!(queue = %self.name, removed, "Removed all queued jobs");
        if !was_suspended {
            self.resume();
        }
        removed
    }

    fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Accepts a delivered job.
    ///
    /// A job already waiting out a retry delay is replaced and made ready at once, which is
    /// how a manual retry resets the backoff. Duplicates of pending or running jobs are
    /// ignored.
    pub fn enqueue(&self, job: Job) {
        if self.configuration.queue_type == QueueType::Ignore {
            debug!(queue = %self.name, job_id = %job.id(), "Queue ignores jobs; leaving it queued");
            return;
        }
        {
            let mut state = self.lock_state();
            if let Some(index) = state.waiting.iter().position(|w| w.job.id() == job.id()) {
                state.waiting.swap_remove(index);
                debug!(queue = %self.name, job_id = %job.id(), "Retry delay reset");
                state.pending.push_front(job);
            } else if state.contains(job.id()) {
                debug!(queue = %self.name, job_id = %job.id(), "Ignoring duplicate job delivery");
                return;
            } else {
                debug!(queue = %self.name, job_id = %job.id(), "Job enqueued");
                state.pending.push_back(job);
            }
        }
        self.notify.notify_one();
    }

    /// Takes the jobs that may start now and marks them active.
    fn take_ready(&self) -> (Vec<Job>, Option<Instant>) {
        let mut state = self.lock_state();
        let now = Instant::now();
        if let Some(since) = state.suspended_since {
            if now.duration_since(since) < MAX_SUSPEND {
                return (Vec::new(), Some(since + MAX_SUSPEND));
            }
            warn!(queue = %self.name, "Queue was suspended too long; resuming");
            state.suspended_since = None;
        }
        state.promote_due(now);

        let capacity = self
            .configuration
            .max_parallel
            .saturating_sub(state.active.len());
        let ready = match self.configuration.queue_type {
            QueueType::Ordered => {
                let mut busy_topics: HashSet<String> = state
                    .active
                    .values()
                    .cloned()
                    .chain(state.waiting.iter().map(|w| w.job.topic().to_string()))
                    .collect();
                take_matching(&mut state, capacity, |job| {
                    busy_topics.insert(job.topic().to_string())
                })
            }
            QueueType::Unordered => take_matching(&mut state, capacity, |_| true),
            QueueType::TopicRoundRobin => state.take_round_robin(capacity),
            QueueType::Ignore => Vec::new(),
        };
        (ready, state.next_wakeup())
    }

    async fn run(self: Arc<Self>) {
        debug!(queue = %self.name, "Queue dispatcher started");
        loop {
            let (ready, next_wakeup) = self.take_ready();
            let started_any = !ready.is_empty();
            for job in ready {
                self.start(job).await;
            }
            if started_any {
                continue;
            }

            let sleep = async {
                match next_wakeup {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.notify.notified() => {}
                _ = sleep => {}
            }
        }
        debug!(queue = %self.name, "Queue dispatcher stopped");
    }

    async fn start(self: &Arc<Self>, job: Job) {
        let id = job.id().to_string();

        if self.manager.is_removed(&id) {
            debug!(queue = %self.name, job_id = %id, "Skipping removed job");
            self.release(&id, None);
            return;
        }
        if let Some(stored) = self.manager.get_job_by_id(&id).await {
            if stored.is_terminal() {
                debug!(queue = %self.name, job_id = %id, state = %stored.state(), "Skipping finished job");
                self.release(&id, None);
                return;
            }
        }

        if !self.subsystem.can_execute(&job) {
            self.reject(job).await;
            return;
        }

        let mut running = job.clone();
        if let Err(e) = running.transition(JobState::Running) {
            warn!(queue = %self.name, job_id = %id, error = %e, "Dropping job that cannot run");
            self.release(&id, None);
            return;
        }

        let control = Arc::new(RunControl::default());
        self.manager.register_live(&id, Arc::clone(&control) as Arc<dyn JobUpdateListener>);

        let started = JobUpdate::builder(&id, JobUpdateCommand::UpdateJob)
            .queue(&self.name)
            .state(JobState::Running)
            .retry_count(running.retry_count())
            .build();
        if let Err(e) = publish_update(self.transport.as_ref(), &started).await {
            error!(queue = %self.name, job_id = %id, error = %e, "Failed to publish job start");
        }

        let listener = Arc::new(BridgeUpdateListener::new(&id, Arc::clone(&self.transport)));
        let callback = Arc::new(QueueCallback {
            queue: Arc::clone(self),
            control: Arc::clone(&control),
            delivered: job,
        });
        let options = ExecutionOptions {
            priority: self.configuration.priority,
            thread_pool: self.configuration.thread_pool.clone(),
        };

        match self
            .subsystem
            .execute_with(running.clone(), listener, callback.clone(), options)
            .await
        {
            Ok(handle) => control.attach(handle),
            Err(e) => {
                warn!(queue = %self.name, job_id = %id, error = %e, "Job could not be dispatched");
                let result = match e {
                    JobMeshError::NoConsumer { .. } => JobResult::Cancel(e.to_string()),
                    other => JobResult::Failed(other.to_string()),
                };
                callback
                    .on_complete(JobOutcome {
                        job: running,
                        result,
                        processing_time: Duration::ZERO,
                        cancelled: false,
                    })
                    .await;
            }
        }
    }

    /// Fails a job no consumer accepts without ever starting it.
    async fn reject(&self, mut job: Job) {
        let id = job.id().to_string();
        warn!(queue = %self.name, job_id = %id, job_type = %job.job_type(), "No consumer for job");
        job.set_error(Some(format!("no consumer for job type '{}'", job.job_type())));
        if job.transition(JobState::Failed).is_ok() {
            let update = JobUpdate::snapshot(&job);
            if let Err(e) = publish_update(self.transport.as_ref(), &update).await {
                error!(queue = %self.name, job_id = %id, error = %e, "Failed to publish job update");
            }
        }
        self.release(&id, None);
    }

    async fn complete(&self, delivered: Job, control: &RunControl, outcome: JobOutcome) {
        let id = delivered.id().to_string();
        self.manager.unregister_live(&id);

        if self.manager.is_removed(&id) {
            debug!(queue = %self.name, job_id = %id, "Discarding result of removed job");
            self.release(&id, None);
            return;
        }

        let mut job = outcome.job;
        let mut requeue: Option<Duration> = None;
        let next = if let Some(stopped) = control.stop_state() {
            debug!(queue = %self.name, job_id = %id, state = %stopped, "Discarding result of stopped job");
            stopped
        } else if control.retry_requested() {
            job.set_retry_count(0);
            job.set_error(None);
            requeue = Some(Duration::ZERO);
            JobState::Queued
        } else {
            match outcome.result {
                JobResult::Ok => JobState::Succeeded,
                JobResult::Failed(reason) => {
                    let attempts = job.retry_count() + 1;
                    job.set_error(Some(reason));
                    if self.configuration.can_retry(attempts) {
                        job.set_retry_count(attempts);
                        requeue = Some(self.retry_strategy.calculate_delay(attempts));
                        JobState::Queued
                    } else {
                        info!(queue = %self.name, job_id = %id, attempts, "Job retries exhausted");
                        JobState::Failed
                    }
                }
                JobResult::Cancel(reason) => {
                    job.set_error(Some(reason));
                    JobState::Failed
                }
            }
        };

        if let Err(e) = job.transition(next) {
            error!(queue = %self.name, job_id = %id, error = %e, "Invalid job outcome");
            self.release(&id, None);
            return;
        }
        debug!(
            queue = %self.name,
            job_id = %id,
            state = %job.state(),
            elapsed_ms = outcome.processing_time.as_millis() as u64,
            "Job execution completed"
        );

        let update = final_update(&delivered, &job);
        if let Err(e) = publish_update(self.transport.as_ref(), &update).await {
            error!(queue = %self.name, job_id = %id, error = %e, "Failed to publish job result");
        }
        self.release(&id, requeue.map(|delay| (job, delay)));
    }

    /// Frees the active slot of `id`, optionally parking the job for redelivery.
    fn release(&self, id: &str, requeue: Option<(Job, Duration)>) {
        {
            let mut state = self.lock_state();
            state.active.remove(id);
            match requeue {
                Some((job, delay)) if delay.is_zero() => state.pending.push_front(job),
                Some((job, delay)) => state.waiting.push(WaitingJob {
                    job,
                    ready_at: Instant::now() + delay,
                }),
                None => {}
            }
        }
        self.notify.notify_one();
    }
}

/// Control commands addressed to a running job on this instance.
#[derive(Default)]
struct RunControl {
    handle: Mutex<Option<ExecutionHandle>>,
    stop: Mutex<Option<JobState>>,
    retry: AtomicBool,
    cancelled: AtomicBool,
}

impl RunControl {
    fn attach(&self, handle: ExecutionHandle) {
        if self.cancelled.load(Ordering::Acquire) {
            handle.cancel();
        }
        *lock(&self.handle) = Some(handle);
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        if let Some(handle) = lock(&self.handle).as_ref() {
            handle.cancel();
        }
    }

    fn stop_state(&self) -> Option<JobState> {
        *lock(&self.stop)
    }

    fn retry_requested(&self) -> bool {
        self.retry.load(Ordering::Acquire)
    }
}

#[async_trait]
impl JobUpdateListener for RunControl {
    async fn on_update(&self, update: JobUpdate) -> Result<()> {
        match update.command() {
            JobUpdateCommand::StopJob => {
                lock(&self.stop).get_or_insert(JobState::Stopped);
            }
            JobUpdateCommand::AbortJob => {
                *lock(&self.stop) = Some(JobState::Aborted);
            }
            JobUpdateCommand::RetryJob => {
                if let Some(stopped) = self.stop_state() {
                    warn!(job_id = %update.job_id(), state = %stopped, "Retry of a job that is being stopped");
                    return Err(JobMeshError::IllegalArgument {
                        message: format!(
                            "job {} is already being moved to {}",
                            update.job_id(),
                            stopped
                        ),
                    });
                }
                self.retry.store(true, Ordering::Release);
            }
            other => {
                return Err(JobMeshError::IllegalArgument {
                    message: format!("{} is not a control command", other),
                });
            }
        }
        debug!(job_id = %update.job_id(), command = %update.command(), "Cancelling running job");
        self.cancel();
        Ok(())
    }
}

struct QueueCallback {
    queue: Arc<JobQueue>,
    control: Arc<RunControl>,
    delivered: Job,
}

#[async_trait]
impl JobCallback for QueueCallback {
    async fn on_complete(&self, outcome: JobOutcome) {
        self.queue
            .complete(self.delivered.clone(), &self.control, outcome)
            .await;
    }
}

/// Takes pending jobs in order while `admit` accepts them, skipping running ids.
fn take_matching(
    state: &mut QueueState,
    capacity: usize,
    mut admit: impl FnMut(&Job) -> bool,
) -> Vec<Job> {
    let mut ready = Vec::new();
    let mut index = 0;
    while ready.len() < capacity && index < state.pending.len() {
        let job = &state.pending[index];
        if state.active.contains_key(job.id()) || !admit(job) {
            index += 1;
            continue;
        }
        if let Some(job) = state.pending.remove(index) {
            state.active.insert(job.id().to_string(), job.topic().to_string());
            ready.push(job);
        }
    }
    ready
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct QueueEntry {
    queue: Arc<JobQueue>,
    subscription: SubscriptionId,
    task: JoinHandle<()>,
}

/// Owns the running queues, creating them on first use.
pub struct QueueManager {
    queues: DashMap<String, QueueEntry>,
    manager: Arc<JobManager>,
    subsystem: Arc<JobSubsystem>,
    transport: Arc<dyn Transport>,
    shutdown: CancellationToken,
}

impl QueueManager {
    pub fn new(
        manager: Arc<JobManager>,
        subsystem: Arc<JobSubsystem>,
        transport: Arc<dyn Transport>,
    ) -> Arc<Self> {
        Arc::new(Self {
            queues: DashMap::new(),
            manager,
            subsystem,
            transport,
            shutdown: CancellationToken::new(),
        })
    }

    /// Starts the queue described by `configuration` unless it already runs.
    pub fn start_queue(&self, configuration: &QueueConfiguration) -> Result<Arc<JobQueue>> {
        if self.shutdown.is_cancelled() {
            return Err(JobMeshError::Queue {
                message: format!("cannot start queue '{}' after shutdown", configuration.name),
            });
        }
        if let Some(entry) = self.queues.get(&configuration.name) {
            return Ok(Arc::clone(&entry.queue));
        }

        match self.queues.entry(configuration.name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(entry) => Ok(Arc::clone(&entry.get().queue)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                configuration.validate()?;
                let queue = JobQueue::new(
                    configuration.clone(),
                    Arc::clone(&self.manager),
                    Arc::clone(&self.subsystem),
                    Arc::clone(&self.transport),
                    self.shutdown.child_token(),
                );
                let subscription = self.transport.subscribe(
                    &queue_topic(&configuration.name),
                    Arc::new(QueueBridge::new(&queue)),
                )?;
                let task = tokio::spawn(Arc::clone(&queue).run());
                info!(
                    queue = %configuration.name,
                    queue_type = ?configuration.queue_type,
                    max_parallel = configuration.max_parallel,
                    "Queue started"
                );
                slot.insert(QueueEntry {
                    queue: Arc::clone(&queue),
                    subscription,
                    task,
                });
                Ok(queue)
            }
        }
    }

    pub fn queue(&self, name: &str) -> Option<Arc<JobQueue>> {
        self.queues.get(name).map(|entry| Arc::clone(&entry.queue))
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Stops every dispatcher. Jobs already handed to a pool keep running.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let names: Vec<String> = self.queues.iter().map(|e| e.key().clone()).collect();
        for name in names {
            if let Some((_, entry)) = self.queues.remove(&name) {
                self.transport.unsubscribe(entry.subscription);
                if let Err(e) = entry.task.await {
                    warn!(queue = %name, error = %e, "Queue dispatcher ended abnormally");
                }
            }
        }
        info!("Queues stopped");
    }
}

impl QueueDirectory for QueueManager {
    fn ensure_queue(&self, configuration: &QueueConfiguration) -> Result<()> {
        self.start_queue(configuration).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::properties::Properties;

    fn job(id: &str, topic: &str) -> Job {
        Job::new(id, topic, "type", "q", Properties::new())
    }

    #[test]
    fn test_promote_due_keeps_earliest_first() {
        let now = Instant::now();
        let mut state = QueueState::default();
        state.pending.push_back(job("fresh", "t"));
        state.waiting.push(WaitingJob {
            job: job("late", "t"),
            ready_at: now,
        });
        state.waiting.push(WaitingJob {
            job: job("early", "t"),
            ready_at: now - Duration::from_millis(5),
        });
        state.waiting.push(WaitingJob {
            job: job("future", "t"),
            ready_at: now + Duration::from_secs(60),
        });

        state.promote_due(now);
        let order: Vec<&str> = state.pending.iter().map(|j| j.id()).collect();
        assert_eq!(order, vec!["early", "late", "fresh"]);
        assert_eq!(state.waiting.len(), 1);
        assert_eq!(state.next_wakeup(), Some(now + Duration::from_secs(60)));
    }

    #[test]
    fn test_round_robin_takes_topics_in_turn() {
        let mut state = QueueState::default();
        for (id, topic) in [("a1", "a"), ("a2", "a"), ("b1", "b"), ("c1", "c"), ("b2", "b")] {
            state.pending.push_back(job(id, topic));
        }

        let first: Vec<String> = state
            .take_round_robin(2)
            .iter()
            .map(|j| j.id().to_string())
            .collect();
        assert_eq!(first, vec!["a1", "b1"]);

        let rest: Vec<String> = state
            .take_round_robin(10)
            .iter()
            .map(|j| j.id().to_string())
            .collect();
        assert_eq!(rest, vec!["a2", "c1", "b2"]);
        assert!(state.pending.is_empty());
        assert_eq!(state.active.len(), 5);
    }

    #[test]
    fn test_round_robin_skips_running_ids() {
        let mut state = QueueState::default();
        state.active.insert("a1".to_string(), "a".to_string());
        state.pending.push_back(job("a1", "a"));
        state.pending.push_back(job("b1", "b"));

        let ready = state.take_round_robin(5);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id(), "b1");
        assert_eq!(state.pending.len(), 1);
    }

    #[test]
    fn test_contains_checks_every_stage() {
        let mut state = QueueState::default();
        state.pending.push_back(job("p", "t"));
        state.active.insert("a".to_string(), "t".to_string());
        state.waiting.push(WaitingJob {
            job: job("w", "t"),
            ready_at: Instant::now(),
        });
        assert!(state.contains("p"));
        assert!(state.contains("a"));
        assert!(state.contains("w"));
        assert!(!state.contains("x"));
    }

    #[tokio::test]
    async fn test_run_control_stop_and_retry() {
        let control = RunControl::default();
        control
            .on_update(JobUpdate::builder("1", JobUpdateCommand::StopJob).build())
            .await
            .unwrap();
        assert_eq!(control.stop_state(), Some(JobState::Stopped));
        assert!(control.cancelled.load(Ordering::Acquire));

        control
            .on_update(JobUpdate::builder("1", JobUpdateCommand::AbortJob).build())
            .await
            .unwrap();
        assert_eq!(control.stop_state(), Some(JobState::Aborted));

        let retry = RunControl::default();
        retry
            .on_update(JobUpdate::builder("1", JobUpdateCommand::RetryJob).build())
            .await
            .unwrap();
        assert!(retry.retry_requested());
        assert!(matches!(
            retry
                .on_update(JobUpdate::builder("1", JobUpdateCommand::UpdateJob).build())
                .await,
            Err(JobMeshError::IllegalArgument { .. })
        ));
    }

    #[tokio::test]
    async fn test_retry_after_stop_is_rejected() {
        let control = RunControl::default();
        control
            .on_update(JobUpdate::builder("1", JobUpdateCommand::StopJob).build())
            .await
            .unwrap();
        assert!(matches!(
            control
                .on_update(JobUpdate::builder("1", JobUpdateCommand::RetryJob).build())
                .await,
            Err(JobMeshError::IllegalArgument { .. })
        ));
        assert!(!control.retry_requested());
        assert_eq!(control.stop_state(), Some(JobState::Stopped));
    }
}
