//! Time based triggers with cluster placement.
//!
//! A trigger is registered under a name. Registering the same name again replaces the
//! previous trigger, so schedules can be declared idempotently at startup. Before every
//! fire the trigger's [`Placement`] is checked against the [`Topology`]; without a topology
//! placement is ignored and every instance fires.
//!
//! ```rust,no_run
//! use jobmesh::cron::CronSchedule;
//! use jobmesh::scheduler::{ScheduleOptions, Scheduler, task};
//!
//! # async fn example(scheduler: std::sync::Arc<Scheduler>) -> jobmesh::Result<()> {
//! scheduler.schedule(
//!     task(|| async {
//!         tracing::info!("nightly cleanup");
//!         Ok(())
//!     }),
//!     ScheduleOptions::cron(CronSchedule::daily(3, 0)?)
//!         .name("nightly-cleanup")
//!         .on_leader_only(),
//! )?;
//! # Ok(())
//! # }
//! ```

use crate::{
    config::SchedulerConfig,
    cron::CronSchedule,
    error::JobMeshError,
    topology::Topology,
    Result,
};
use chrono::{DateTime, Utc};
use dashmap::{DashMap, mapref::entry::Entry};
use futures_util::future::BoxFuture;
use std::{
    future::Future,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Work run on every fire.
pub type ScheduledTask = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Wraps an async closure as a [`ScheduledTask`].
pub fn task<F, Fut>(f: F) -> ScheduledTask
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move || Box::pin(f()))
}

#[derive(Debug, Clone, PartialEq)]
pub enum Trigger {
    ImmediateOnce,
    /// `count` of `None` repeats until unscheduled
    ImmediateRepeating {
        count: Option<u32>,
        period: Duration,
    },
    DateOnce(DateTime<Utc>),
    DateRepeating {
        at: DateTime<Utc>,
        count: Option<u32>,
        period: Duration,
    },
    Cron(CronSchedule),
}

impl Trigger {
    fn validate(&self) -> Result<()> {
        let (count, period) = match self {
            Trigger::ImmediateRepeating { count, period }
            | Trigger::DateRepeating { count, period, .. } => (*count, *period),
            _ => return Ok(()),
        };
        if period.is_zero() {
            return Err(JobMeshError::IllegalArgument {
                message: "repeating triggers need a period above zero".to_string(),
            });
        }
        if count == Some(0) {
            return Err(JobMeshError::IllegalArgument {
                message: "repeating triggers need a count of at least one".to_string(),
            });
        }
        Ok(())
    }
}

/// Where a trigger may fire.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Placement {
    #[default]
    Anywhere,
    LeaderOnly,
    /// Only on the lowest ordered eligible instance
    SingleInstance,
    Instances(Vec<String>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleOptions {
    pub trigger: Trigger,
    pub placement: Placement,
    pub name: Option<String>,
    pub can_run_concurrently: bool,
}

impl ScheduleOptions {
    fn with_trigger(trigger: Trigger) -> Self {
        Self {
            trigger,
            placement: Placement::Anywhere,
            name: None,
            can_run_concurrently: false,
        }
    }

    /// Fires once, right away.
    pub fn now() -> Self {
        Self::with_trigger(Trigger::ImmediateOnce)
    }

    /// Fires right away and then every `period`, `count` times in total.
    pub fn now_repeating(count: Option<u32>, period: Duration) -> Self {
        Self::with_trigger(Trigger::ImmediateRepeating { count, period })
    }

    /// Fires once at `at`, or right away if `at` already passed.
    pub fn at(at: DateTime<Utc>) -> Self {
        Self::with_trigger(Trigger::DateOnce(at))
    }

    pub fn at_repeating(at: DateTime<Utc>, count: Option<u32>, period: Duration) -> Self {
        Self::with_trigger(Trigger::DateRepeating { at, count, period })
    }

    pub fn cron(schedule: CronSchedule) -> Self {
        Self::with_trigger(Trigger::Cron(schedule))
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn on_leader_only(mut self) -> Self {
        self.placement = Placement::LeaderOnly;
        self
    }

    pub fn on_single_instance_only(mut self) -> Self {
        self.placement = Placement::SingleInstance;
        self
    }

    pub fn on_instances_only(mut self, instances: Vec<String>) -> Self {
        self.placement = Placement::Instances(instances);
        self
    }

    pub fn can_run_concurrently(mut self, concurrent: bool) -> Self {
        self.can_run_concurrently = concurrent;
        self
    }
}

/// A registered trigger as reported by [`Scheduler::scheduled_jobs`].
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledJobInfo {
    pub name: String,
    pub trigger: Trigger,
    pub placement: Placement,
    pub can_run_concurrently: bool,
    pub registered_at: DateTime<Utc>,
}

struct TriggerEntry {
    generation: u64,
    token: CancellationToken,
    /// Set while a fire runs; shared by every generation registered under the name
    running: Arc<AtomicBool>,
    info: ScheduledJobInfo,
}

pub struct Scheduler {
    config: SchedulerConfig,
    topology: Option<Arc<dyn Topology>>,
    triggers: DashMap<String, TriggerEntry>,
    generation: AtomicU64,
    shutdown: CancellationToken,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, topology: Option<Arc<dyn Topology>>) -> Arc<Self> {
        if topology.is_none() {
            warn!("Scheduler runs without topology; placement restrictions are ignored");
        }
        Arc::new(Self {
            config,
            topology,
            triggers: DashMap::new(),
            generation: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        })
    }

    /// Parses a cron expression in the scheduler's default timezone.
    pub fn cron_schedule(&self, expression: &str) -> Result<CronSchedule> {
        Ok(CronSchedule::with_timezone(
            expression,
            &self.config.default_timezone,
        )?)
    }

    /// Registers `task` and returns the trigger name.
    ///
    /// An existing trigger with the same name is cancelled and replaced.
    pub fn schedule(self: &Arc<Self>, task: ScheduledTask, options: ScheduleOptions) -> Result<String> {
        if !self.config.enabled {
            return Err(JobMeshError::Scheduler {
                message: "the scheduler is disabled".to_string(),
            });
        }
        if self.shutdown.is_cancelled() {
            return Err(JobMeshError::Scheduler {
                message: "the scheduler is shut down".to_string(),
            });
        }
        options.trigger.validate()?;

        let name = options
            .name
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let token = self.shutdown.child_token();
        let info = ScheduledJobInfo {
            name: name.clone(),
            trigger: options.trigger.clone(),
            placement: options.placement.clone(),
            can_run_concurrently: options.can_run_concurrently,
            registered_at: Utc::now(),
        };

        let running = match self.triggers.entry(name.clone()) {
            Entry::Occupied(mut occupied) => {
                let previous = occupied.get();
                previous.token.cancel();
                let running = Arc::clone(&previous.running);
                occupied.insert(TriggerEntry {
                    generation,
                    token: token.clone(),
                    running: Arc::clone(&running),
                    info,
                });
                info!(name = %name, "Replaced scheduled job");
                running
            }
            Entry::Vacant(vacant) => {
                let running = Arc::new(AtomicBool::new(false));
                vacant.insert(TriggerEntry {
                    generation,
                    token: token.clone(),
                    running: Arc::clone(&running),
                    info,
                });
                info!(name = %name, "Scheduled job");
                running
            }
        };

        tokio::spawn(run_trigger(
            Arc::downgrade(self),
            TriggerRun {
                name: name.clone(),
                generation,
                token,
                running,
            },
            task,
            options,
        ));
        Ok(name)
    }

    /// Removes a trigger. Runs already in progress finish.
    pub fn unschedule(&self, name: &str) -> bool {
        match self.triggers.remove(name) {
            Some((_, entry)) => {
                entry.token.cancel();
                info!(name = %name, "Unscheduled job");
                true
            }
            None => false,
        }
    }

    pub fn scheduled_jobs(&self) -> Vec<ScheduledJobInfo> {
        let mut jobs: Vec<ScheduledJobInfo> =
            self.triggers.iter().map(|entry| entry.info.clone()).collect();
        jobs.sort_by(|a, b| a.name.cmp(&b.name));
        jobs
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.triggers.clear();
        info!("Scheduler shut down");
    }

    /// Whether `placement` allows this instance to fire now.
    pub fn placement_allows(&self, placement: &Placement) -> bool {
        if *placement == Placement::Anywhere {
            return true;
        }
        let Some(topology) = &self.topology else {
            debug!(?placement, "No topology; ignoring placement");
            return true;
        };
        match placement {
            Placement::Anywhere => true,
            Placement::LeaderOnly => topology.is_leader(),
            Placement::SingleInstance => {
                let local = topology.local_instance_id();
                topology
                    .eligible_instances()
                    .iter()
                    .min()
                    .is_some_and(|elected| *elected == local)
            }
            Placement::Instances(instances) => instances.contains(&topology.local_instance_id()),
        }
    }

    fn finished(&self, name: &str, generation: u64) {
        if self
            .triggers
            .remove_if(name, |_, entry| entry.generation == generation)
            .is_some()
        {
            debug!(name = %name, "Scheduled job finished");
        }
    }
}

/// Identity and shared state of one registered generation of a trigger.
struct TriggerRun {
    name: String,
    generation: u64,
    token: CancellationToken,
    running: Arc<AtomicBool>,
}

async fn run_trigger(
    scheduler: Weak<Scheduler>,
    run: TriggerRun,
    task: ScheduledTask,
    options: ScheduleOptions,
) {
    let TriggerRun {
        name,
        generation,
        token,
        running,
    } = run;
    let mut fired: u32 = 0;

    loop {
        let delay = match next_delay(&options.trigger, fired) {
            Some(delay) => delay,
            None => break,
        };
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }

        let Some(scheduler) = scheduler.upgrade() else {
            return;
        };
        if token.is_cancelled() {
            return;
        }
        fired = fired.saturating_add(1);
        if !scheduler.placement_allows(&options.placement) {
            debug!(name = %name, "Placement excludes this instance");
            continue;
        }
        if !options.can_run_concurrently && running.swap(true, Ordering::AcqRel) {
            debug!(name = %name, "Previous run still in progress; skipping");
            continue;
        }

        let run = task();
        let running = Arc::clone(&running);
        let concurrent = options.can_run_concurrently;
        let task_name = name.clone();
        tokio::spawn(async move {
            if let Err(e) = run.await {
                error!(name = %task_name, error = %e, "Scheduled job failed");
            }
            if !concurrent {
                running.store(false, Ordering::Release);
            }
        });
    }

    if let Some(scheduler) = scheduler.upgrade() {
        scheduler.finished(&name, generation);
    }
}

/// Time until the next fire after `fired` fires, or `None` when the trigger is done.
fn next_delay(trigger: &Trigger, fired: u32) -> Option<Duration> {
    match trigger {
        Trigger::ImmediateOnce => (fired == 0).then_some(Duration::ZERO),
        Trigger::ImmediateRepeating { count, period } => {
            if count.is_some_and(|count| fired >= count) {
                None
            } else if fired == 0 {
                Some(Duration::ZERO)
            } else {
                Some(*period)
            }
        }
        Trigger::DateOnce(at) => (fired == 0).then(|| until(*at)),
        Trigger::DateRepeating { at, count, period } => {
            if count.is_some_and(|count| fired >= count) {
                None
            } else if fired == 0 {
                Some(until(*at))
            } else {
                Some(*period)
            }
        }
        Trigger::Cron(schedule) => schedule.next_execution_from_now().map(until),
    }
}

fn until(at: DateTime<Utc>) -> Duration {
    (at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}
