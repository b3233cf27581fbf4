//! # jobmesh
//!
//! Distributed job scheduling and execution on Tokio.
//!
//! ## Features
//!
//! - **Queues**: topic-routed queues, ordered or parallel, with bounded retry and backoff
//! - **Consumers**: typed handler registry with job-type wildcards and ranking
//! - **Updates**: every state change travels as a message and is applied in one place
//! - **Scheduling**: immediate, periodic, date and cron triggers with cluster placement
//! - **Thread pools**: named bounded pools with saturation policies
//! - **Monitoring**: lifecycle notifications, statistics and Prometheus metrics (default)
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use jobmesh::{
//!     JobConsumer, JobExecutionContext, JobMeshConfig, JobResult, JobService,
//!     events::{EventFilter, NotificationKind},
//! };
//! use std::sync::Arc;
//!
//! struct MailSender;
//!
//! #[async_trait]
//! impl JobConsumer for MailSender {
//!     fn job_types(&self) -> Vec<String> {
//!         vec!["mail/send".to_string()]
//!     }
//!
//!     async fn execute(&self, ctx: &JobExecutionContext) -> JobResult {
//!         match ctx.property("to") {
//!             Some(_) => JobResult::Ok,
//!             None => JobResult::cancel("no recipient"),
//!         }
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> jobmesh::Result<()> {
//!     let service = JobService::start(JobMeshConfig::development())?;
//!     service.subsystem().register(Arc::new(MailSender));
//!
//!     let mut finished = service
//!         .manager()
//!         .subscribe(EventFilter::new().with_kinds(vec![NotificationKind::Finished]));
//!
//!     service
//!         .manager()
//!         .new_job_builder("mail/outbound", "mail/send")
//!         .property("to", "ops@example.com")
//!         .add()
//!         .await?;
//!
//!     finished.recv().await;
//!     service.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Core Concepts
//!
//! ### Jobs
//!
//! A job has a fixed identity (id, topic, job type, queue) and mutable lifecycle data
//! (state, retry count, properties). Jobs only change through [`JobUpdate`] messages,
//! which the [`JobManager`] applies.
//!
//! ### Queues
//!
//! A job's topic selects its queue. Queues hand jobs to the [`JobSubsystem`], which runs
//! the first accepting [`JobConsumer`] on a thread pool. Failed attempts are redelivered
//! until the queue's retry limit is reached.
//!
//! ## Feature Flags
//!
//! - `metrics` - Enable Prometheus metrics collection (default)

pub mod config;
pub mod context;
pub mod cron;
pub mod error;
pub mod events;
pub mod job;
pub mod logging;
pub mod manager;
pub mod metrics;
pub mod priority;
pub mod properties;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod service;
pub mod stats;
pub mod storage;
pub mod subsystem;
pub mod threadpool;
pub mod topology;
pub mod transport;
pub mod update;

pub use config::{
    JobMeshConfig, QueueConfiguration, QueueType, SaturationPolicy, ThreadPoolConfig,
};
pub use context::{JobExecutionContext, JobResult};
pub use cron::{CronError, CronSchedule};
pub use error::JobMeshError;
pub use events::{EventFilter, JobNotification, NotificationKind};
pub use job::{Job, JobId, JobState};
pub use manager::{JobBuilder, JobManager, QueryType};
pub use metrics::{MetricsConfig, PrometheusMetricsCollector};
pub use priority::JobPriority;
pub use properties::{Properties, PropertyValue};
pub use scheduler::{Placement, ScheduleOptions, Scheduler, Trigger};
pub use service::JobService;
pub use stats::StatisticsSnapshot;
pub use storage::{InMemoryJobStorage, JobStorage};
pub use subsystem::{JobConsumer, JobSubsystem};
pub use topology::{StaticTopology, Topology};
pub use transport::{InMemoryTransport, Transport};
pub use update::{JobUpdate, JobUpdateCommand};

/// Convenient type alias for Results with [`JobMeshError`] as the error type.
pub type Result<T> = std::result::Result<T, JobMeshError>;
