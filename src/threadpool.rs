//! Named worker pools that run job bodies off the dispatch tasks.
//!
//! A [`ThreadPool`] is a bounded set of tokio worker tasks fed from a pending queue with one
//! lane per [`JobPriority`]. Workers are spawned on demand up to `max_pool_size`; workers
//! above `min_pool_size` exit after `keep_alive` without work. When every worker is busy
//! and the pending queue is full the pool's [`SaturationPolicy`] decides what happens.
//!
//! [`ThreadPoolManager`] owns the pools by name. Its default pool always exists and cannot
//! be released.

use crate::{
    config::{DEFAULT_THREAD_POOL, SaturationPolicy, ThreadPoolConfig},
    error::JobMeshError,
    priority::JobPriority,
    Result,
};
use dashmap::DashMap;
use futures_util::FutureExt;
use std::{
    collections::VecDeque,
    future::Future,
    panic::AssertUnwindSafe,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use tokio::{sync::Notify, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub type PoolTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

struct PoolState {
    lanes: [VecDeque<PoolTask>; 3],
    workers: usize,
    idle: usize,
    disposed: bool,
}

impl PoolState {
    fn pending(&self) -> usize {
        self.lanes.iter().map(VecDeque::len).sum()
    }

    fn pop(&mut self) -> Option<PoolTask> {
        self.lanes.iter_mut().find_map(VecDeque::pop_front)
    }

    /// Drops the head of the least important non-empty lane.
    fn discard_oldest(&mut self) -> bool {
        self.lanes
            .iter_mut()
            .rev()
            .find(|lane| !lane.is_empty())
            .and_then(VecDeque::pop_front)
            .is_some()
    }
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadPoolStats {
    pub workers: usize,
    pub active: usize,
    pub pending: usize,
}

pub struct ThreadPool {
    name: String,
    config: ThreadPoolConfig,
    state: Mutex<PoolState>,
    notify: Notify,
    handles: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl ThreadPool {
    pub fn new(config: ThreadPoolConfig) -> Arc<Self> {
        Arc::new(Self {
            name: config.name.clone(),
            config,
            state: Mutex::new(PoolState {
                lanes: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
                workers: 0,
                idle: 0,
                disposed: false,
            }),
            notify: Notify::new(),
            handles: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ThreadPoolConfig {
        &self.config
    }

    pub fn is_disposed(&self) -> bool {
        self.lock_state().disposed
    }

    pub fn stats(&self) -> ThreadPoolStats {
        let state = self.lock_state();
        ThreadPoolStats {
            workers: state.workers,
            active: state.workers.saturating_sub(state.idle),
            pending: state.pending(),
        }
    }

    // Poisoning only happens if a holder panicked; the counters are still usable.
    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Submits `task` at `priority`.
    ///
    /// With [`SaturationPolicy::RunOnCaller`] a saturated pool runs the task on the calling
    /// task, so this only returns once it finished.
    pub async fn execute<F>(self: &Arc<Self>, priority: JobPriority, task: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let task: PoolTask = Box::pin(task);
        let run_inline = {
            let mut state = self.lock_state();
            if state.disposed {
                return Err(JobMeshError::PoolDisposed {
                    pool: self.name.clone(),
                });
            }

            let pending = state.pending();
            if pending < state.idle {
                state.lanes[priority.lane()].push_back(task);
                drop(state);
                self.notify.notify_one();
                return Ok(());
            }
            if state.workers < self.config.max_pool_size {
                state.lanes[priority.lane()].push_back(task);
                state.workers += 1;
                drop(state);
                self.spawn_worker();
                return Ok(());
            }
            if self.config.queue_size.is_none_or(|capacity| pending < capacity) {
                state.lanes[priority.lane()].push_back(task);
                return Ok(());
            }

            match self.config.saturation_policy {
                SaturationPolicy::Reject => {
                    return Err(JobMeshError::PoolSaturated {
                        pool: self.name.clone(),
                    });
                }
                SaturationPolicy::DiscardOldest => {
                    if state.discard_oldest() {
                        warn!(pool = %self.name, "Pool saturated, discarded oldest pending task");
                    }
                    state.lanes[priority.lane()].push_back(task);
                    return Ok(());
                }
                SaturationPolicy::RunOnCaller => task,
            }
        };

        debug!(pool = %self.name, "Pool saturated, running task on caller");
        if AssertUnwindSafe(run_inline).catch_unwind().await.is_err() {
            warn!(pool = %self.name, "Task panicked on caller");
        }
        Ok(())
    }

    fn spawn_worker(self: &Arc<Self>) {
        let pool = Arc::clone(self);
        let handle = tokio::spawn(async move { pool.worker_loop().await });

        let mut handles = self
            .handles
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    async fn worker_loop(self: Arc<Self>) {
        loop {
            let next = {
                let mut state = self.lock_state();
                match state.pop() {
                    Some(task) => Some(task),
                    None if state.disposed => {
                        state.workers -= 1;
                        return;
                    }
                    None => {
                        state.idle += 1;
                        None
                    }
                }
            };

            if let Some(task) = next {
                if AssertUnwindSafe(task).catch_unwind().await.is_err() {
                    warn!(pool = %self.name, "Pool task panicked");
                }
                continue;
            }

            let can_expire = {
                let state = self.lock_state();
                state.workers > self.config.min_pool_size
            };
            let timed_out = tokio::select! {
                _ = self.notify.notified() => false,
                _ = self.cancel.cancelled() => false,
                _ = tokio::time::sleep(self.config.keep_alive), if can_expire => true,
            };

            let mut state = self.lock_state();
            state.idle -= 1;
            if timed_out && state.pending() == 0 && state.workers > self.config.min_pool_size {
                state.workers -= 1;
                debug!(pool = %self.name, workers = state.workers, "Idle worker expired");
                return;
            }
        }
    }

    /// Stops accepting work and lets workers drain the pending queue for at most `grace`
    /// (the configured `shutdown_grace` when `None`). Workers still running afterwards are
    /// aborted and their pending tasks dropped.
    pub async fn shutdown(&self, grace: Option<Duration>) {
        {
            let mut state = self.lock_state();
            if state.disposed {
                return;
            }
            state.disposed = true;
        }
        self.notify.notify_waiters();
        self.cancel.cancel();

        let handles: Vec<JoinHandle<()>> = {
            let mut handles = self
                .handles
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            handles.drain(..).collect()
        };
        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();

        let grace = grace.unwrap_or(self.config.shutdown_grace);
        if tokio::time::timeout(grace, futures_util::future::join_all(handles))
            .await
            .is_err()
        {
            warn!(pool = %self.name, "Grace period elapsed, aborting remaining workers");
            for abort in aborts {
                abort.abort();
            }
            let mut state = self.lock_state();
            for lane in state.lanes.iter_mut() {
                lane.clear();
            }
            state.workers = 0;
            state.idle = 0;
        }
        info!(pool = %self.name, "Thread pool shut down");
    }
}

/// Registry of named pools.
pub struct ThreadPoolManager {
    pools: DashMap<String, Arc<ThreadPool>>,
    default_pool: Arc<ThreadPool>,
}

impl ThreadPoolManager {
    pub fn new(default_config: ThreadPoolConfig) -> Self {
        let default_pool = ThreadPool::new(ThreadPoolConfig {
            name: DEFAULT_THREAD_POOL.to_string(),
            ..default_config
        });
        Self {
            pools: DashMap::new(),
            default_pool,
        }
    }

    pub fn default_pool(&self) -> Arc<ThreadPool> {
        Arc::clone(&self.default_pool)
    }

    /// Creates a pool, or returns the existing pool of that name.
    pub fn create(&self, config: ThreadPoolConfig) -> Result<Arc<ThreadPool>> {
        if config.name == DEFAULT_THREAD_POOL {
            return Ok(self.default_pool());
        }
        config.validate()?;
        let pool = self
            .pools
            .entry(config.name.clone())
            .or_insert_with(|| ThreadPool::new(config))
            .clone();
        Ok(pool)
    }

    pub fn get(&self, name: &str) -> Option<Arc<ThreadPool>> {
        if name == DEFAULT_THREAD_POOL {
            return Some(self.default_pool());
        }
        self.pools.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Pool `name`, or the default pool when none is named or the name is unknown.
    pub fn get_or_default(&self, name: Option<&str>) -> Arc<ThreadPool> {
        name.and_then(|name| self.get(name))
            .unwrap_or_else(|| self.default_pool())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pools.iter().map(|e| e.key().clone()).collect();
        names.push(DEFAULT_THREAD_POOL.to_string());
        names.sort();
        names
    }

    /// Shuts down and forgets a named pool.
    pub async fn release(&self, name: &str) -> Result<()> {
        if name == DEFAULT_THREAD_POOL {
            return Err(JobMeshError::IllegalArgument {
                message: "the default thread pool cannot be released".to_string(),
            });
        }
        let (_, pool) = self
            .pools
            .remove(name)
            .ok_or_else(|| JobMeshError::ThreadPool {
                message: format!("unknown thread pool '{}'", name),
            })?;
        pool.shutdown(None).await;
        Ok(())
    }

    pub async fn shutdown(&self, grace: Option<Duration>) {
        let pools: Vec<Arc<ThreadPool>> = self.pools.iter().map(|e| Arc::clone(e.value())).collect();
        self.pools.clear();
        futures_util::future::join_all(pools.iter().map(|pool| pool.shutdown(grace))).await;
        self.default_pool.shutdown(grace).await;
    }
}
