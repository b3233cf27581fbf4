use crate::job::JobState;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum JobMeshError {
    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    #[error("No consumer accepts job type '{job_type}' (job {job_id})")]
    NoConsumer { job_id: String, job_type: String },

    #[error("Illegal argument: {message}")]
    IllegalArgument { message: String },

    #[error("Invalid transition for job {job_id}: {from:?} -> {to:?}")]
    InvalidTransition {
        job_id: String,
        from: JobState,
        to: JobState,
    },

    #[error("Invalid message: {message}")]
    InvalidMessage { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Transport error: {message}")]
    Transport { message: String },

    #[error("Queue error: {message}")]
    Queue { message: String },

    #[error("Thread pool '{pool}' is disposed")]
    PoolDisposed { pool: String },

    #[error("Thread pool '{pool}' rejected the task: queue is full")]
    PoolSaturated { pool: String },

    #[error("Thread pool error: {message}")]
    ThreadPool { message: String },

    #[error("Scheduler error: {message}")]
    Scheduler { message: String },

    #[error("Cron error: {0}")]
    Cron(#[from] crate::cron::CronError),

    #[error("Metrics error: {message}")]
    Metrics { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<toml::de::Error> for JobMeshError {
    fn from(err: toml::de::Error) -> Self {
        JobMeshError::Config(format!("TOML deserialization error: {}", err))
    }
}

impl From<toml::ser::Error> for JobMeshError {
    fn from(err: toml::ser::Error) -> Self {
        JobMeshError::Config(format!("TOML serialization error: {}", err))
    }
}

impl JobMeshError {
    /// Routing and identity errors never succeed on redelivery.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            JobMeshError::NoConsumer { .. }
                | JobMeshError::IllegalArgument { .. }
                | JobMeshError::InvalidMessage { .. }
                | JobMeshError::InvalidTransition { .. }
        )
    }
}
