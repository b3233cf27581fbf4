//! Wiring of a complete jobmesh instance.
//!
//! [`JobService`] validates a [`JobMeshConfig`] and starts every component in dependency
//! order: thread pools, transport, storage, the job manager, the consumer registry, the
//! queues and the scheduler. [`JobService::shutdown`] stops them in reverse.
//!
//! ```rust,no_run
//! use jobmesh::{JobMeshConfig, JobService};
//!
//! # async fn example() -> jobmesh::Result<()> {
//! let service = JobService::start(JobMeshConfig::development())?;
//! let job = service
//!     .manager()
//!     .new_job_builder("mail/outbound", "mail/send")
//!     .property("to", "ops@example.com")
//!     .add()
//!     .await?;
//! tracing::info!(job_id = %job.id(), "queued");
//! service.shutdown().await;
//! # Ok(())
//! # }
//! ```

use crate::{
    config::JobMeshConfig,
    events::EventManager,
    manager::JobManager,
    metrics::PrometheusMetricsCollector,
    queue::QueueManager,
    scheduler::Scheduler,
    storage::{InMemoryJobStorage, JobStorage},
    subsystem::JobSubsystem,
    threadpool::ThreadPoolManager,
    topology::Topology,
    transport::{InMemoryTransport, Transport},
    Result,
};
use std::sync::{
    Arc, Weak,
    atomic::{AtomicBool, Ordering},
};
use tracing::info;

/// Collaborators that replace the in-memory defaults.
pub struct JobServiceBuilder {
    config: JobMeshConfig,
    transport: Option<Arc<dyn Transport>>,
    storage: Option<Arc<dyn JobStorage>>,
    topology: Option<Arc<dyn Topology>>,
}

impl JobServiceBuilder {
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_storage(mut self, storage: Arc<dyn JobStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_topology(mut self, topology: Arc<dyn Topology>) -> Self {
        self.topology = Some(topology);
        self
    }

    /// Validates the configuration and starts the service. Must run inside a tokio runtime.
    pub fn start(self) -> Result<JobService> {
        let config = self.config;
        config.validate()?;

        let pools = Arc::new(ThreadPoolManager::new(config.default_thread_pool.clone()));
        for pool in &config.thread_pools {
            pools.create(pool.clone())?;
        }

        let transport = self
            .transport
            .unwrap_or_else(|| {
                Arc::new(InMemoryTransport::from_config(&config.transport)) as Arc<dyn Transport>
            });
        let storage = self
            .storage
            .unwrap_or_else(|| Arc::new(InMemoryJobStorage::new()) as Arc<dyn JobStorage>);
        let events = Arc::new(EventManager::new(config.events.clone()));

        let manager = JobManager::new(
            config.instance_id.clone(),
            config.queue_configurations(),
            Arc::clone(&storage),
            Arc::clone(&transport),
            Arc::clone(&events),
            config.history_size,
        );

        #[cfg(feature = "metrics")]
        let metrics = {
            let collector = Arc::new(PrometheusMetricsCollector::new(config.metrics.clone())?);
            manager.set_metrics(Arc::clone(&collector));
            Some(collector)
        };
        #[cfg(not(feature = "metrics"))]
        let metrics: Option<Arc<PrometheusMetricsCollector>> = None;

        let subsystem = Arc::new(JobSubsystem::new(Arc::clone(&pools)));
        let queues = QueueManager::new(
            Arc::clone(&manager),
            Arc::clone(&subsystem),
            Arc::clone(&transport),
        );
        let directory: Weak<QueueManager> = Arc::downgrade(&queues);
        manager.set_queue_directory(directory);

        let scheduler = Scheduler::new(config.scheduler.clone(), self.topology);
        manager.set_scheduler(Arc::clone(&scheduler));

        manager.start()?;
        for queue in config.queue_configurations().all() {
            // templated names are only known once a topic resolves to them
            if !queue.name.contains("{0}") {
                queues.start_queue(queue)?;
            }
        }

        info!(
            instance_id = %config.instance_id,
            queues = queues.queue_names().len(),
            thread_pools = pools.names().len(),
            "Job service started"
        );

        Ok(JobService {
            config,
            transport,
            storage,
            pools,
            events,
            manager,
            subsystem,
            queues,
            scheduler,
            metrics,
            stopped: AtomicBool::new(false),
        })
    }
}

/// A running jobmesh instance.
pub struct JobService {
    config: JobMeshConfig,
    transport: Arc<dyn Transport>,
    storage: Arc<dyn JobStorage>,
    pools: Arc<ThreadPoolManager>,
    events: Arc<EventManager>,
    manager: Arc<JobManager>,
    subsystem: Arc<JobSubsystem>,
    queues: Arc<QueueManager>,
    scheduler: Arc<Scheduler>,
    metrics: Option<Arc<PrometheusMetricsCollector>>,
    stopped: AtomicBool,
}

impl JobService {
    /// Starts a service with in-memory transport and storage.
    pub fn start(config: JobMeshConfig) -> Result<Self> {
        Self::builder(config).start()
    }

    pub fn builder(config: JobMeshConfig) -> JobServiceBuilder {
        JobServiceBuilder {
            config,
            transport: None,
            storage: None,
            topology: None,
        }
    }

    pub fn config(&self) -> &JobMeshConfig {
        &self.config
    }

    pub fn manager(&self) -> &Arc<JobManager> {
        &self.manager
    }

    pub fn subsystem(&self) -> &Arc<JobSubsystem> {
        &self.subsystem
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn queues(&self) -> &Arc<QueueManager> {
        &self.queues
    }

    pub fn thread_pools(&self) -> &Arc<ThreadPoolManager> {
        &self.pools
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn storage(&self) -> &Arc<dyn JobStorage> {
        &self.storage
    }

    pub fn events(&self) -> &Arc<EventManager> {
        &self.events
    }

    /// The Prometheus collector, when the `metrics` feature is enabled.
    pub fn metrics(&self) -> Option<&Arc<PrometheusMetricsCollector>> {
        self.metrics.as_ref()
    }

    /// Stops triggers, queues, the manager, the pools and the transport, in that order.
    /// Later calls do nothing.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(instance_id = %self.config.instance_id, "Shutting down job service");
        self.scheduler.shutdown();
        self.queues.shutdown().await;
        self.manager.shutdown();
        self.pools.shutdown(None).await;
        self.transport.close().await;
        info!(instance_id = %self.config.instance_id, "Job service stopped");
    }
}
