//! The boundary where transport messages become jobs and job results become updates.

use super::JobQueue;
use crate::{
    context::JobUpdateListener,
    error::JobMeshError,
    job::{Job, JobId},
    transport::{MessageHandler, Transport, TransportMessage},
    update::{JOB_UPDATE_TOPIC, JobUpdate, JobUpdateCommand},
    Result,
};
use async_trait::async_trait;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// Delivers START_JOB messages of one queue topic to its [`JobQueue`].
pub struct QueueBridge {
    queue: Weak<JobQueue>,
}

impl QueueBridge {
    pub fn new(queue: &Arc<JobQueue>) -> Self {
        Self {
            queue: Arc::downgrade(queue),
        }
    }

    /// Turns a transport message into a job.
    pub fn accept(message: &TransportMessage) -> Result<Job> {
        if message.command != JobUpdateCommand::StartJob {
            return Err(JobMeshError::InvalidMessage {
                message: format!("queue topic '{}' only carries START_JOB, got {}", message.topic, message.command),
            });
        }
        Job::from_message(&message.body)
    }
}

#[async_trait]
impl MessageHandler for QueueBridge {
    async fn on_message(&self, topic: &str, message: &TransportMessage) -> bool {
        let Some(queue) = self.queue.upgrade() else {
            return false;
        };
        match Self::accept(message) {
            Ok(job) => queue.enqueue(job),
            // a malformed message never becomes valid by delivering it again
            Err(e) => warn!(topic = %topic, error = %e, "Dropping malformed job message"),
        }
        false
    }
}

/// Update listener handed to a running job.
///
/// Only `UPDATE_JOB`s addressed to the job itself are accepted; they are republished on the
/// update topic for the job manager to apply.
pub struct BridgeUpdateListener {
    job_id: JobId,
    transport: Arc<dyn Transport>,
}

impl BridgeUpdateListener {
    pub fn new(job_id: impl Into<JobId>, transport: Arc<dyn Transport>) -> Self {
        Self {
            job_id: job_id.into(),
            transport,
        }
    }
}

#[async_trait]
impl JobUpdateListener for BridgeUpdateListener {
    async fn on_update(&self, update: JobUpdate) -> Result<()> {
        if update.job_id() != self.job_id {
            return Err(JobMeshError::IllegalArgument {
                message: format!(
                    "job {} cannot publish an update for job {}",
                    self.job_id,
                    update.job_id()
                ),
            });
        }
        if update.command() != JobUpdateCommand::UpdateJob {
            return Err(JobMeshError::IllegalArgument {
                message: format!(
                    "job {} may only publish UPDATE_JOB, got {}",
                    self.job_id,
                    update.command()
                ),
            });
        }
        publish_update(self.transport.as_ref(), &update).await
    }
}

/// Publishes `update` on the update topic.
pub async fn publish_update(transport: &dyn Transport, update: &JobUpdate) -> Result<()> {
    debug!(
        job_id = %update.job_id(),
        command = %update.command(),
        state = ?update.state(),
        "Publishing job update"
    );
    transport
        .publish(JOB_UPDATE_TOPIC, update.command(), update.to_message())
        .await
}

/// The final `UPDATE_JOB` of an execution: the complete snapshot of `job`, plus removals of
/// the properties the job had when it was delivered but no longer has.
pub fn final_update(delivered: &Job, job: &Job) -> JobUpdate {
    let mut builder = JobUpdate::builder(job.id(), JobUpdateCommand::UpdateJob)
        .queue(job.queue())
        .properties(job.properties().clone())
        .state(job.state())
        .retry_count(job.retry_count())
        .error(job.error().map(str::to_string));
    for key in delivered.properties().keys() {
        if job.property(key).is_none() {
            builder = builder.remove(key.clone());
        }
    }
    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        job::JobState,
        properties::Properties,
        transport::InMemoryTransport,
    };
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Capture(mpsc::UnboundedSender<TransportMessage>);

    #[async_trait]
    impl MessageHandler for Capture {
        async fn on_message(&self, _topic: &str, message: &TransportMessage) -> bool {
            let _ = self.0.send(message.clone());
            false
        }
    }

    fn job() -> Job {
        let mut props = Properties::new();
        props.insert("gone".to_string(), true.into());
        Job::new("j1", "topic", "type", "main", props)
    }

    #[tokio::test]
    async fn test_listener_rejects_foreign_and_control_updates() {
        let transport: Arc<dyn Transport> = Arc::new(InMemoryTransport::default());
        let listener = BridgeUpdateListener::new("j1", Arc::clone(&transport));

        let foreign = JobUpdate::builder("j2", JobUpdateCommand::UpdateJob).build();
        assert!(matches!(
            listener.on_update(foreign).await,
            Err(JobMeshError::IllegalArgument { .. })
        ));

        let stop = JobUpdate::builder("j1", JobUpdateCommand::StopJob).build();
        assert!(matches!(
            listener.on_update(stop).await,
            Err(JobMeshError::IllegalArgument { .. })
        ));
    }

    #[tokio::test]
    async fn test_listener_republishes_accepted_updates() {
        let transport: Arc<dyn Transport> = Arc::new(InMemoryTransport::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport
            .subscribe(JOB_UPDATE_TOPIC, Arc::new(Capture(tx)))
            .unwrap();

        let listener = BridgeUpdateListener::new("j1", Arc::clone(&transport));
        listener
            .on_update(
                JobUpdate::builder("j1", JobUpdateCommand::UpdateJob)
                    .property("progress", 10)
                    .build(),
            )
            .await
            .unwrap();

        let message = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let update = JobUpdate::from_message(&message.body).unwrap();
        assert_eq!(update.job_id(), "j1");
        assert_eq!(update.properties()["progress"].as_i64(), Some(10));
    }

    #[test]
    fn test_accept_rejects_other_commands_and_garbage() {
        let good = TransportMessage {
            topic: "q".to_string(),
            command: JobUpdateCommand::StartJob,
            body: job().to_message(),
            delivery_count: 1,
        };
        assert_eq!(QueueBridge::accept(&good).unwrap().id(), "j1");

        let wrong_command = TransportMessage {
            command: JobUpdateCommand::StopJob,
            ..good.clone()
        };
        assert!(matches!(
            QueueBridge::accept(&wrong_command),
            Err(JobMeshError::InvalidMessage { .. })
        ));

        let garbage = TransportMessage {
            body: Properties::new(),
            ..good
        };
        assert!(matches!(
            QueueBridge::accept(&garbage),
            Err(JobMeshError::InvalidMessage { .. })
        ));
    }

    #[test]
    fn test_final_update_carries_removals() {
        let delivered = job();
        let mut finished = delivered.clone();
        finished.remove_properties(&["gone".to_string()]);
        finished.merge_properties(&Properties::from([("result".to_string(), "ok".into())]));
        finished.transition(JobState::Running).unwrap();
        finished.transition(JobState::Succeeded).unwrap();

        let update = final_update(&delivered, &finished);
        assert_eq!(update.state(), Some(JobState::Succeeded));
        assert_eq!(update.removed(), ["gone".to_string()]);
        assert!(update.properties().contains_key("result"));
    }
}
