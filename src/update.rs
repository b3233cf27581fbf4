//! Update messages, the only vehicle for mutating a [`Job`].

use crate::{
    error::JobMeshError,
    job::{Job, JobId, JobState},
    properties::{Properties, PropertyValue},
    Result,
};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Topic on which every job update is published and consumed by the manager.
pub const JOB_UPDATE_TOPIC: &str = "jobmesh/job/update";

/// Wire keys of an update message.
pub mod keys {
    pub const JOB_ID: &str = "jobId";
    pub const QUEUE: &str = "queue";
    pub const COMMAND: &str = "command";
    pub const STATE: &str = "state";
    pub const RETRY_COUNT: &str = "retryCount";
    pub const PROPERTIES: &str = "properties";
    pub const REMOVED: &str = "removed";
    pub const ERROR: &str = "error";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobUpdateCommand {
    StartJob,
    StopJob,
    AbortJob,
    RetryJob,
    UpdateJob,
}

impl JobUpdateCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobUpdateCommand::StartJob => "START_JOB",
            JobUpdateCommand::StopJob => "STOP_JOB",
            JobUpdateCommand::AbortJob => "ABORT_JOB",
            JobUpdateCommand::RetryJob => "RETRY_JOB",
            JobUpdateCommand::UpdateJob => "UPDATE_JOB",
        }
    }

    /// STOP, ABORT and RETRY are control commands owned by whoever runs the job.
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            JobUpdateCommand::StopJob | JobUpdateCommand::AbortJob | JobUpdateCommand::RetryJob
        )
    }
}

impl fmt::Display for JobUpdateCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobUpdateCommand {
    type Err = JobMeshError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "START_JOB" => Ok(JobUpdateCommand::StartJob),
            "STOP_JOB" => Ok(JobUpdateCommand::StopJob),
            "ABORT_JOB" => Ok(JobUpdateCommand::AbortJob),
            "RETRY_JOB" => Ok(JobUpdateCommand::RetryJob),
            "UPDATE_JOB" => Ok(JobUpdateCommand::UpdateJob),
            other => Err(JobMeshError::InvalidMessage {
                message: format!("unknown update command '{}'", other),
            }),
        }
    }
}

/// An immutable change request for a single job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobUpdate {
    job_id: JobId,
    queue: Option<String>,
    command: JobUpdateCommand,
    properties: Properties,
    state: Option<JobState>,
    retry_count: Option<u32>,
    removed: Vec<String>,
    error: Option<String>,
}

impl JobUpdate {
    pub fn builder(job_id: impl Into<JobId>, command: JobUpdateCommand) -> JobUpdateBuilder {
        JobUpdateBuilder {
            update: JobUpdate {
                job_id: job_id.into(),
                queue: None,
                command,
                properties: Properties::new(),
                state: None,
                retry_count: None,
                removed: Vec::new(),
                error: None,
            },
        }
    }

    /// Full snapshot of `job` carried as an UPDATE_JOB.
    pub fn snapshot(job: &Job) -> Self {
        Self::builder(job.id(), JobUpdateCommand::UpdateJob)
            .queue(job.queue())
            .properties(job.properties().clone())
            .state(job.state())
            .retry_count(job.retry_count())
            .error(job.error().map(str::to_string))
            .build()
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn queue(&self) -> Option<&str> {
        self.queue.as_deref()
    }

    pub fn command(&self) -> JobUpdateCommand {
        self.command
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn state(&self) -> Option<JobState> {
        self.state
    }

    pub fn retry_count(&self) -> Option<u32> {
        self.retry_count
    }

    pub fn removed(&self) -> &[String] {
        &self.removed
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Applies property deltas, removals and an optional state change to `job`.
    ///
    /// The update is rejected as a whole when it targets another job or carries a state
    /// that is not reachable from the job's current state.
    pub fn apply_to(&self, job: &mut Job) -> Result<()> {
        if job.id() != self.job_id {
            return Err(JobMeshError::IllegalArgument {
                message: format!(
                    "update for job {} cannot be applied to job {}",
                    self.job_id,
                    job.id()
                ),
            });
        }
        if let Some(next) = self.state {
            if !job.state().can_transition_to(next) {
                return Err(JobMeshError::InvalidTransition {
                    job_id: self.job_id.clone(),
                    from: job.state(),
                    to: next,
                });
            }
        }

        job.merge_properties(&self.properties);
        job.remove_properties(&self.removed);
        if let Some(retry_count) = self.retry_count {
            job.set_retry_count(retry_count);
        }
        if self.error.is_some() || self.state == Some(JobState::Queued) {
            job.set_error(self.error.clone());
        }
        if let Some(next) = self.state {
            job.transition(next)?;
        }
        Ok(())
    }

    pub fn to_message(&self) -> Properties {
        let mut message = Properties::new();
        message.insert(keys::JOB_ID.to_string(), self.job_id.clone().into());
        message.insert(keys::COMMAND.to_string(), self.command.as_str().into());
        if let Some(queue) = &self.queue {
            message.insert(keys::QUEUE.to_string(), queue.clone().into());
        }
        if let Some(state) = self.state {
            message.insert(keys::STATE.to_string(), state.as_str().into());
        }
        if let Some(retry_count) = self.retry_count {
            message.insert(keys::RETRY_COUNT.to_string(), retry_count.into());
        }
        if !self.properties.is_empty() {
            message.insert(
                keys::PROPERTIES.to_string(),
                PropertyValue::Map(self.properties.clone()),
            );
        }
        if !self.removed.is_empty() {
            message.insert(keys::REMOVED.to_string(), self.removed.clone().into());
        }
        if let Some(error) = &self.error {
            message.insert(keys::ERROR.to_string(), error.clone().into());
        }
        message
    }

    pub fn from_message(message: &Properties) -> Result<Self> {
        let job_id = message
            .get(keys::JOB_ID)
            .and_then(|value| value.as_str())
            .filter(|id| !id.is_empty())
            .ok_or_else(|| JobMeshError::InvalidMessage {
                message: format!("update without '{}'", keys::JOB_ID),
            })?;
        let command: JobUpdateCommand = message
            .get(keys::COMMAND)
            .and_then(|value| value.as_str())
            .ok_or_else(|| JobMeshError::InvalidMessage {
                message: format!("update for {} without '{}'", job_id, keys::COMMAND),
            })?
            .parse()?;

        let mut builder = JobUpdate::builder(job_id, command);
        if let Some(queue) = message.get(keys::QUEUE).and_then(|value| value.as_str()) {
            builder = builder.queue(queue);
        }
        if let Some(state) = message.get(keys::STATE).and_then(|value| value.as_str()) {
            builder = builder.state(state.parse()?);
        }
        if let Some(value) = message.get(keys::RETRY_COUNT) {
            let count = value
                .as_i64()
                .and_then(|count| u32::try_from(count).ok())
                .ok_or_else(|| JobMeshError::InvalidMessage {
                    message: format!("update for {}: invalid '{}'", job_id, keys::RETRY_COUNT),
                })?;
            builder = builder.retry_count(count);
        }
        if let Some(properties) = message.get(keys::PROPERTIES).and_then(|v| v.as_map()) {
            builder = builder.properties(properties.clone());
        }
        if let Some(removed) = message.get(keys::REMOVED).and_then(|v| v.as_list()) {
            for key in removed.iter().filter_map(|key| key.as_str()) {
                builder = builder.remove(key);
            }
        }
        let error = message
            .get(keys::ERROR)
            .and_then(|value| value.as_str())
            .map(str::to_string);
        Ok(builder.error(error).build())
    }
}

pub struct JobUpdateBuilder {
    update: JobUpdate,
}

impl JobUpdateBuilder {
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.update.queue = Some(queue.into());
        self
    }

    pub fn property(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.update.properties.insert(key.into(), value.into());
        self
    }

    pub fn properties(mut self, properties: Properties) -> Self {
        self.update.properties.extend(properties);
        self
    }

    pub fn state(mut self, state: JobState) -> Self {
        self.update.state = Some(state);
        self
    }

    pub fn retry_count(mut self, retry_count: u32) -> Self {
        self.update.retry_count = Some(retry_count);
        self
    }

    pub fn remove(mut self, key: impl Into<String>) -> Self {
        self.update.removed.push(key.into());
        self
    }

    pub fn error(mut self, error: Option<String>) -> Self {
        self.update.error = error;
        self
    }

    pub fn build(self) -> JobUpdate {
        self.update
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queued_job() -> Job {
        let mut props = Properties::new();
        props.insert("a".to_string(), 1.into());
        props.insert("b".to_string(), "x".into());
        Job::new("7", "topic/a", "type/a", "main", props)
    }

    #[test]
    fn test_merge_and_remove_properties() {
        let mut job = queued_job();
        let update = JobUpdate::builder("7", JobUpdateCommand::UpdateJob)
            .property("a", 2)
            .property("c", true)
            .remove("b")
            .build();

        update.apply_to(&mut job).unwrap();
        assert_eq!(job.state(), JobState::Queued);
        assert_eq!(job.property("a").and_then(|v| v.as_i64()), Some(2));
        assert_eq!(job.property("c").and_then(|v| v.as_bool()), Some(true));
        assert!(job.property("b").is_none());
    }

    #[test]
    fn test_rejects_invalid_transition() {
        let mut job = queued_job();
        let update = JobUpdate::builder("7", JobUpdateCommand::UpdateJob)
            .property("a", 99)
            .state(JobState::Succeeded)
            .build();

        let err = update.apply_to(&mut job).unwrap_err();
        assert!(matches!(err, JobMeshError::InvalidTransition { .. }));
        // rejected updates leave the job untouched
        assert_eq!(job.property("a").and_then(|v| v.as_i64()), Some(1));
    }

    #[test]
    fn test_rejects_foreign_job() {
        let mut job = queued_job();
        let update = JobUpdate::builder("8", JobUpdateCommand::UpdateJob).build();
        assert!(matches!(
            update.apply_to(&mut job),
            Err(JobMeshError::IllegalArgument { .. })
        ));
    }

    #[test]
    fn test_wire_message() {
        let update = JobUpdate::builder("7", JobUpdateCommand::RetryJob)
            .queue("main")
            .state(JobState::Queued)
            .retry_count(0)
            .property("k", "v")
            .remove("gone")
            .build();

        let message = update.to_message();
        assert_eq!(message["command"].as_str(), Some("RETRY_JOB"));
        assert_eq!(message["jobId"].as_str(), Some("7"));

        let parsed = JobUpdate::from_message(&message).unwrap();
        assert_eq!(parsed, update);
    }

    #[test]
    fn test_unknown_command_is_invalid() {
        let mut message = Properties::new();
        message.insert("jobId".to_string(), "1".into());
        message.insert("command".to_string(), "PAUSE_JOB".into());
        assert!(matches!(
            JobUpdate::from_message(&message),
            Err(JobMeshError::InvalidMessage { .. })
        ));
    }

    #[test]
    fn test_retry_count_out_of_range_is_invalid() {
        for count in [-1, i64::from(u32::MAX) + 1] {
            let mut message = Properties::new();
            message.insert("jobId".to_string(), "1".into());
            message.insert("command".to_string(), "UPDATE_JOB".into());
            message.insert("retryCount".to_string(), count.into());
            assert!(matches!(
                JobUpdate::from_message(&message),
                Err(JobMeshError::InvalidMessage { .. })
            ));
        }
    }
}
