//! Consumer registry and dispatch.
//!
//! Consumers register for a set of job types and the [`JobSubsystem`] routes each job to the
//! first one that accepts it, ordered by ranking (highest first) and then registration
//! order. Job bodies run on a [`ThreadPool`](crate::threadpool::ThreadPool); the caller only
//! waits until the body was handed to the pool.
//!
//! # Examples
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use jobmesh::{JobConsumer, JobExecutionContext, JobResult};
//!
//! struct ThumbnailConsumer;
//!
//! #[async_trait]
//! impl JobConsumer for ThumbnailConsumer {
//!     fn job_types(&self) -> Vec<String> {
//!         vec!["image/thumbnail".to_string(), "image/resize/*".to_string()]
//!     }
//!
//!     async fn execute(&self, ctx: &JobExecutionContext) -> JobResult {
//!         if ctx.job().property("path").is_none() {
//!             return JobResult::cancel("no path given");
//!         }
//!         JobResult::Ok
//!     }
//! }
//! ```

use crate::{
    context::{JobCallback, JobExecutionContext, JobOutcome, JobResult, JobUpdateListener},
    error::JobMeshError,
    job::Job,
    priority::JobPriority,
    threadpool::ThreadPoolManager,
    Result,
};
use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::FutureExt;
use std::{
    any::Any,
    panic::AssertUnwindSafe,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub type HandlerId = u64;

#[async_trait]
pub trait JobConsumer: Send + Sync {
    /// Job types this consumer handles. An entry is an exact type, `prefix/*` for the
    /// direct children of `prefix`, `prefix/**` for everything below it, or `*`.
    fn job_types(&self) -> Vec<String>;

    /// Dynamic filter; the default matches [`job_types`](Self::job_types).
    fn accepts(&self, job: &Job) -> bool {
        self.job_types()
            .iter()
            .any(|pattern| job_type_matches(pattern, job.job_type()))
    }

    async fn execute(&self, ctx: &JobExecutionContext) -> JobResult;

    /// Called once when the consumer is unregistered.
    async fn close(&self) {}
}

/// Whether `job_type` matches a consumer pattern.
pub fn job_type_matches(pattern: &str, job_type: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix("/**") {
        return job_type
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix('/'))
            .is_some_and(|rest| !rest.is_empty());
    }
    if let Some(prefix) = pattern.strip_suffix("/*") {
        return job_type
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix('/'))
            .is_some_and(|rest| !rest.is_empty() && !rest.contains('/'));
    }
    pattern == job_type
}

/// Registration options.
#[derive(Debug, Clone, Default)]
pub struct ConsumerOptions {
    pub ranking: i32,
    /// Pool for this consumer's bodies; falls back to the queue's pool, then the default
    pub thread_pool: Option<String>,
}

impl ConsumerOptions {
    pub fn with_ranking(mut self, ranking: i32) -> Self {
        self.ranking = ranking;
        self
    }

    pub fn with_thread_pool(mut self, pool: impl Into<String>) -> Self {
        self.thread_pool = Some(pool.into());
        self
    }
}

/// How the queue wants a job executed.
#[derive(Debug, Clone, Default)]
pub struct ExecutionOptions {
    pub priority: JobPriority,
    pub thread_pool: Option<String>,
}

/// Handle on a submitted execution.
#[derive(Debug, Clone)]
pub struct ExecutionHandle {
    pub handler_id: HandlerId,
    token: CancellationToken,
}

impl ExecutionHandle {
    /// Signals the execution to stop. The consumer decides whether to honour it.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

struct ConsumerEntry {
    id: HandlerId,
    consumer: Arc<dyn JobConsumer>,
    options: ConsumerOptions,
    closing: AtomicBool,
}

pub struct JobSubsystem {
    consumers: DashMap<HandlerId, Arc<ConsumerEntry>>,
    next_id: AtomicU64,
    pools: Arc<ThreadPoolManager>,
}

impl JobSubsystem {
    pub fn new(pools: Arc<ThreadPoolManager>) -> Self {
        Self {
            consumers: DashMap::new(),
            next_id: AtomicU64::new(1),
            pools,
        }
    }

    pub fn register(&self, consumer: Arc<dyn JobConsumer>) -> HandlerId {
        self.register_with(consumer, ConsumerOptions::default())
    }

    pub fn register_with(&self, consumer: Arc<dyn JobConsumer>, options: ConsumerOptions) -> HandlerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        info!(
            handler_id = id,
            ranking = options.ranking,
            job_types = ?consumer.job_types(),
            "Registered job consumer"
        );
        self.consumers.insert(
            id,
            Arc::new(ConsumerEntry {
                id,
                consumer,
                options,
                closing: AtomicBool::new(false),
            }),
        );
        id
    }

    /// Removes a consumer once its `close()` returned. Returns false for unknown ids.
    pub async fn unregister(&self, id: HandlerId) -> bool {
        let entry = match self.consumers.get(&id) {
            Some(entry) => Arc::clone(entry.value()),
            None => return false,
        };
        if entry.closing.swap(true, Ordering::AcqRel) {
            return false;
        }
        entry.consumer.close().await;
        self.consumers.remove(&id);
        info!(handler_id = id, "Unregistered job consumer");
        true
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers
            .iter()
            .filter(|entry| !entry.closing.load(Ordering::Acquire))
            .count()
    }

    /// Whether any open consumer accepts `job`.
    pub fn can_execute(&self, job: &Job) -> bool {
        self.select(job).is_some()
    }

    fn select(&self, job: &Job) -> Option<Arc<ConsumerEntry>> {
        let mut candidates: Vec<Arc<ConsumerEntry>> = self
            .consumers
            .iter()
            .filter(|entry| !entry.closing.load(Ordering::Acquire))
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        candidates.sort_by(|a, b| {
            b.options
                .ranking
                .cmp(&a.options.ranking)
                .then(a.id.cmp(&b.id))
        });
        candidates.into_iter().find(|entry| entry.consumer.accepts(job))
    }

    pub async fn execute(
        &self,
        job: Job,
        listener: Arc<dyn JobUpdateListener>,
        callback: Arc<dyn JobCallback>,
    ) -> Result<ExecutionHandle> {
        self.execute_with(job, listener, callback, ExecutionOptions::default())
            .await
    }

    /// Dispatches `job` to the first accepting consumer.
    ///
    /// Fails with [`JobMeshError::NoConsumer`] before anything runs when no consumer accepts
    /// the job. Otherwise `callback` is invoked exactly once, also when the body panicked or
    /// the pool discarded it.
    pub async fn execute_with(
        &self,
        job: Job,
        listener: Arc<dyn JobUpdateListener>,
        callback: Arc<dyn JobCallback>,
        options: ExecutionOptions,
    ) -> Result<ExecutionHandle> {
        let entry = self.select(&job).ok_or_else(|| JobMeshError::NoConsumer {
            job_id: job.id().to_string(),
            job_type: job.job_type().to_string(),
        })?;

        let pool_name = entry
            .options
            .thread_pool
            .as_deref()
            .or(options.thread_pool.as_deref());
        let pool = self.pools.get_or_default(pool_name);
        let token = CancellationToken::new();

        debug!(
            job_id = %job.id(),
            job_type = %job.job_type(),
            handler_id = entry.id,
            pool = %pool.name(),
            "Dispatching job"
        );

        let ctx = JobExecutionContext::new(job.clone(), token.clone(), listener);
        let completion = Arc::new(Mutex::new(Completion {
            callback: Some(callback),
            accepted: false,
            dropped: false,
        }));
        let mut guard = CompletionGuard {
            completion: Arc::clone(&completion),
            job: job.clone(),
        };
        let consumer = Arc::clone(&entry.consumer);
        let task_token = token.clone();
        let task = async move {
            let started = Instant::now();
            let result = AssertUnwindSafe(consumer.execute(&ctx))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    let message = panic_message(panic.as_ref());
                    error!(job_id = %ctx.job().id(), panic = %message, "Job consumer panicked");
                    JobResult::Failed(format!("consumer panicked: {}", message))
                });
            guard
                .complete(JobOutcome {
                    job: ctx.final_job(),
                    result,
                    processing_time: started.elapsed(),
                    cancelled: task_token.is_cancelled(),
                })
                .await;
        };

        let submitted = pool.execute(options.priority, task).await;
        let discarded = {
            let mut completion = lock(&completion);
            match submitted {
                // the caller reports the error; no callback for a rejected job
                Err(e) => {
                    completion.callback = None;
                    return Err(e);
                }
                Ok(()) => {
                    completion.accepted = true;
                    if completion.dropped {
                        completion.callback.take()
                    } else {
                        None
                    }
                }
            }
        };
        if let Some(callback) = discarded {
            tokio::spawn(async move { callback.on_complete(discarded_outcome(job)).await });
        }

        Ok(ExecutionHandle {
            handler_id: entry.id,
            token,
        })
    }
}

struct Completion {
    callback: Option<Arc<dyn JobCallback>>,
    /// The pool took the task
    accepted: bool,
    /// The task was dropped without running to the end
    dropped: bool,
}

/// Reports an execution that an accepted pool task dropped before it finished, so the
/// queue never waits on a callback that cannot come.
struct CompletionGuard {
    completion: Arc<Mutex<Completion>>,
    job: Job,
}

impl CompletionGuard {
    async fn complete(&mut self, outcome: JobOutcome) {
        let callback = lock(&self.completion).callback.take();
        if let Some(callback) = callback {
            callback.on_complete(outcome).await;
        }
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        let callback = {
            let mut completion = lock(&self.completion);
            completion.dropped = true;
            if !completion.accepted {
                return;
            }
            completion.callback.take()
        };
        let Some(callback) = callback else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        warn!(job_id = %self.job.id(), "Job execution was discarded before it finished");
        let outcome = discarded_outcome(self.job.clone());
        runtime.spawn(async move { callback.on_complete(outcome).await });
    }
}

fn discarded_outcome(job: Job) -> JobOutcome {
    JobOutcome {
        job,
        result: JobResult::Failed("execution discarded by thread pool".to_string()),
        processing_time: Duration::ZERO,
        cancelled: false,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::ThreadPoolConfig, properties::Properties, update::JobUpdate};
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    struct Named {
        name: &'static str,
        types: Vec<String>,
        calls: AtomicUsize,
        closed: AtomicBool,
    }

    impl Named {
        fn new(name: &'static str, types: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                name,
                types: types.iter().map(|t| t.to_string()).collect(),
                calls: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl JobConsumer for Named {
        fn job_types(&self) -> Vec<String> {
            self.types.clone()
        }

        async fn execute(&self, ctx: &JobExecutionContext) -> JobResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            ctx.set_property("handled_by", self.name);
            JobResult::Ok
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    struct Panics;

    #[async_trait]
    impl JobConsumer for Panics {
        fn job_types(&self) -> Vec<String> {
            vec!["boom".to_string()]
        }

        async fn execute(&self, _ctx: &JobExecutionContext) -> JobResult {
            panic!("kaboom");
        }
    }

    struct NoUpdates;

    #[async_trait]
    impl JobUpdateListener for NoUpdates {
        async fn on_update(&self, _update: JobUpdate) -> Result<()> {
            Ok(())
        }
    }

    struct Forward(mpsc::UnboundedSender<JobOutcome>);

    #[async_trait]
    impl JobCallback for Forward {
        async fn on_complete(&self, outcome: JobOutcome) {
            let _ = self.0.send(outcome);
        }
    }

    fn subsystem() -> JobSubsystem {
        JobSubsystem::new(Arc::new(ThreadPoolManager::new(ThreadPoolConfig::default())))
    }

    fn job(job_type: &str) -> Job {
        Job::new("1", "topic", job_type, "main", Properties::new())
    }

    async fn run(subsystem: &JobSubsystem, job_type: &str) -> Result<JobOutcome> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        subsystem
            .execute(job(job_type), Arc::new(NoUpdates), Arc::new(Forward(tx)))
            .await?;
        Ok(timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap())
    }

    #[test]
    fn test_job_type_matching() {
        assert!(job_type_matches("*", "anything/at/all"));
        assert!(job_type_matches("a/b", "a/b"));
        assert!(!job_type_matches("a/b", "a/b/c"));
        assert!(job_type_matches("a/*", "a/b"));
        assert!(!job_type_matches("a/*", "a/b/c"));
        assert!(!job_type_matches("a/*", "a"));
        assert!(job_type_matches("a/**", "a/b/c"));
        assert!(!job_type_matches("a/**", "ab/c"));
    }

    #[tokio::test]
    async fn test_no_consumer_fails_before_dispatch() {
        let subsystem = subsystem();
        subsystem.register(Named::new("other", &["other"]));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let result = subsystem
            .execute(job("missing"), Arc::new(NoUpdates), Arc::new(Forward(tx)))
            .await;
        assert!(matches!(result, Err(JobMeshError::NoConsumer { .. })));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_ranking_then_registration_order() {
        let subsystem = subsystem();
        let first = Named::new("first", &["t"]);
        let second = Named::new("second", &["t"]);
        let ranked = Named::new("ranked", &["t"]);
        subsystem.register(first.clone());
        subsystem.register(second.clone());

        let outcome = run(&subsystem, "t").await.unwrap();
        assert_eq!(
            outcome.job.property("handled_by").and_then(|v| v.as_str()),
            Some("first")
        );

        subsystem.register_with(ranked.clone(), ConsumerOptions::default().with_ranking(5));
        let outcome = run(&subsystem, "t").await.unwrap();
        assert_eq!(
            outcome.job.property("handled_by").and_then(|v| v.as_str()),
            Some("ranked")
        );
        assert_eq!(second.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unregister_closes_and_stops_selection() {
        let subsystem = subsystem();
        let consumer = Named::new("only", &["t"]);
        let id = subsystem.register(consumer.clone());
        assert_eq!(subsystem.consumer_count(), 1);

        assert!(subsystem.unregister(id).await);
        assert!(consumer.closed.load(Ordering::SeqCst));
        assert!(!subsystem.unregister(id).await);
        assert!(matches!(
            run(&subsystem, "t").await,
            Err(JobMeshError::NoConsumer { .. })
        ));
    }

    #[tokio::test]
    async fn test_panic_is_reported_as_failure() {
        let subsystem = subsystem();
        subsystem.register(Arc::new(Panics));
        let outcome = run(&subsystem, "boom").await.unwrap();
        match outcome.result {
            JobResult::Failed(reason) => assert!(reason.contains("kaboom")),
            other => panic!("unexpected result {:?}", other),
        }
    }
}
