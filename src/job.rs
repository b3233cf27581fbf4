use crate::{
    error::JobMeshError,
    properties::{Properties, PropertyValue},
    Result,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use uuid::Uuid;

pub type JobId = String;

/// Wire keys reserved for job identity and lifecycle data.
pub mod keys {
    pub const ID: &str = "id";
    pub const TOPIC: &str = "topic";
    pub const TYPE: &str = "type";
    pub const QUEUE: &str = "queue";
    pub const STATE: &str = "state";
    pub const RETRY_COUNT: &str = "retryCount";
    pub const CREATED_AT: &str = "createdAt";
    pub const STARTED_AT: &str = "startedAt";
    pub const FINISHED_AT: &str = "finishedAt";
    pub const ERROR: &str = "error";

    pub const RESERVED: [&str; 10] = [
        ID,
        TOPIC,
        TYPE,
        QUEUE,
        STATE,
        RETRY_COUNT,
        CREATED_AT,
        STARTED_AT,
        FINISHED_AT,
        ERROR,
    ];
}

pub fn new_job_id() -> JobId {
    Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Stopped,
    Aborted,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "QUEUED",
            JobState::Running => "RUNNING",
            JobState::Succeeded => "SUCCEEDED",
            JobState::Failed => "FAILED",
            JobState::Stopped => "STOPPED",
            JobState::Aborted => "ABORTED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Stopped | JobState::Aborted
        )
    }

    /// Whether the lifecycle permits moving from `self` to `next`.
    ///
    /// Re-queueing is allowed from every state. A queued job may fail without running
    /// when no consumer accepts it.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        if *self == next || next == JobState::Queued {
            return true;
        }
        match self {
            JobState::Queued => matches!(
                next,
                JobState::Running | JobState::Failed | JobState::Stopped | JobState::Aborted
            ),
            JobState::Running => matches!(
                next,
                JobState::Succeeded | JobState::Failed | JobState::Stopped | JobState::Aborted
            ),
            _ => false,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = JobMeshError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "QUEUED" => Ok(JobState::Queued),
            "RUNNING" | "ACTIVE" => Ok(JobState::Running),
            "SUCCEEDED" => Ok(JobState::Succeeded),
            "FAILED" => Ok(JobState::Failed),
            "STOPPED" => Ok(JobState::Stopped),
            "ABORTED" => Ok(JobState::Aborted),
            other => Err(JobMeshError::InvalidMessage {
                message: format!("unknown job state '{}'", other),
            }),
        }
    }
}

/// A unit of work.
///
/// Identity (`id`, `topic`, `job_type`, `queue`) is fixed at creation. Lifecycle data only
/// changes through accepted [`JobUpdate`](crate::update::JobUpdate)s, which is why the
/// mutators are crate-private.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    id: JobId,
    topic: String,
    job_type: String,
    queue: String,
    state: JobState,
    retry_count: u32,
    properties: Properties,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    error: Option<String>,
}

impl Job {
    pub fn new(
        id: impl Into<JobId>,
        topic: impl Into<String>,
        job_type: impl Into<String>,
        queue: impl Into<String>,
        properties: Properties,
    ) -> Self {
        Self {
            id: id.into(),
            topic: topic.into(),
            job_type: job_type.into(),
            queue: queue.into(),
            state: JobState::Queued,
            retry_count: 0,
            properties,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn property(&self, key: &str) -> Option<&PropertyValue> {
        self.properties.get(key)
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub(crate) fn transition(&mut self, next: JobState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(JobMeshError::InvalidTransition {
                job_id: self.id.clone(),
                from: self.state,
                to: next,
            });
        }
        if self.state == next {
            return Ok(());
        }
        let now = Utc::now();
        match next {
            JobState::Running => {
                self.started_at = Some(now);
                self.finished_at = None;
            }
            JobState::Queued => {
                self.finished_at = None;
            }
            _ => {
                self.finished_at = Some(now);
            }
        }
        self.state = next;
        Ok(())
    }

    pub(crate) fn set_retry_count(&mut self, retry_count: u32) {
        self.retry_count = retry_count;
    }

    pub(crate) fn set_error(&mut self, error: Option<String>) {
        self.error = error;
    }

    pub(crate) fn merge_properties(&mut self, deltas: &Properties) {
        for (key, value) in deltas {
            self.properties.insert(key.clone(), value.clone());
        }
    }

    pub(crate) fn remove_properties(&mut self, keys: &[String]) {
        for key in keys {
            self.properties.remove(key);
        }
    }

    /// Serializes the job to its wire shape: `{id, topic, type, queue, state, retryCount, ...properties}`.
    pub fn to_message(&self) -> Properties {
        let mut message = self.properties.clone();
        message.insert(keys::ID.to_string(), self.id.clone().into());
        message.insert(keys::TOPIC.to_string(), self.topic.clone().into());
        message.insert(keys::TYPE.to_string(), self.job_type.clone().into());
        message.insert(keys::QUEUE.to_string(), self.queue.clone().into());
        message.insert(keys::STATE.to_string(), self.state.as_str().into());
        message.insert(keys::RETRY_COUNT.to_string(), self.retry_count.into());
        message.insert(
            keys::CREATED_AT.to_string(),
            self.created_at.to_rfc3339().into(),
        );
        if let Some(started_at) = self.started_at {
            message.insert(keys::STARTED_AT.to_string(), started_at.to_rfc3339().into());
        }
        if let Some(finished_at) = self.finished_at {
            message.insert(
                keys::FINISHED_AT.to_string(),
                finished_at.to_rfc3339().into(),
            );
        }
        if let Some(error) = &self.error {
            message.insert(keys::ERROR.to_string(), error.clone().into());
        }
        message
    }

    /// Rebuilds a job from its wire shape. Identity keys are mandatory.
    pub fn from_message(message: &Properties) -> Result<Self> {
        let id = required_str(message, keys::ID)?;
        let topic = required_str(message, keys::TOPIC)?;
        let job_type = required_str(message, keys::TYPE)?;
        let queue = required_str(message, keys::QUEUE)?;

        let state = match message.get(keys::STATE) {
            Some(value) => value
                .as_str()
                .ok_or_else(|| JobMeshError::InvalidMessage {
                    message: format!("job {}: '{}' must be a string", id, keys::STATE),
                })?
                .parse()?,
            None => JobState::Queued,
        };
        let retry_count = match message.get(keys::RETRY_COUNT) {
            Some(value) => value
                .as_i64()
                .and_then(|count| u32::try_from(count).ok())
                .ok_or_else(|| JobMeshError::InvalidMessage {
                    message: format!("job {}: invalid '{}'", id, keys::RETRY_COUNT),
                })?,
            None => 0,
        };

        let properties = message
            .iter()
            .filter(|(key, _)| !keys::RESERVED.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        Ok(Self {
            id,
            topic,
            job_type,
            queue,
            state,
            retry_count,
            properties,
            created_at: optional_time(message, keys::CREATED_AT).unwrap_or_else(Utc::now),
            started_at: optional_time(message, keys::STARTED_AT),
            finished_at: optional_time(message, keys::FINISHED_AT),
            error: message
                .get(keys::ERROR)
                .and_then(|value| value.as_str())
                .map(str::to_string),
        })
    }
}

fn required_str(message: &Properties, key: &str) -> Result<String> {
    match message.get(key).and_then(|value| value.as_str()) {
        Some(value) if !value.is_empty() => Ok(value.to_string()),
        _ => Err(JobMeshError::InvalidMessage {
            message: format!("missing or empty '{}'", key),
        }),
    }
}

fn optional_time(message: &Properties, key: &str) -> Option<DateTime<Utc>> {
    message
        .get(key)
        .and_then(|value| value.as_str())
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|time| time.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_job() -> Job {
        let mut props = Properties::new();
        props.insert("path".to_string(), "/content/a".into());
        Job::new("job-1", "mail/outbound", "mail/send", "mail", props)
    }

    #[test]
    fn test_new_job_is_queued() {
        let job = sample_job();
        assert_eq!(job.state(), JobState::Queued);
        assert_eq!(job.retry_count(), 0);
        assert!(job.started_at().is_none());
        assert_eq!(job.property("path").and_then(|v| v.as_str()), Some("/content/a"));
    }

    #[test]
    fn test_state_machine() {
        assert!(JobState::Queued.can_transition_to(JobState::Running));
        assert!(JobState::Running.can_transition_to(JobState::Succeeded));
        assert!(JobState::Running.can_transition_to(JobState::Queued));
        assert!(JobState::Succeeded.can_transition_to(JobState::Queued));
        assert!(!JobState::Succeeded.can_transition_to(JobState::Running));
        assert!(!JobState::Stopped.can_transition_to(JobState::Succeeded));
        assert!(!JobState::Queued.can_transition_to(JobState::Succeeded));
    }

    #[test]
    fn test_transition_sets_timestamps() {
        let mut job = sample_job();
        job.transition(JobState::Running).unwrap();
        assert!(job.started_at().is_some());
        assert!(job.finished_at().is_none());

        job.transition(JobState::Succeeded).unwrap();
        assert!(job.finished_at().is_some());
        assert!(job.is_terminal());

        let err = job.transition(JobState::Running).unwrap_err();
        assert!(matches!(err, JobMeshError::InvalidTransition { .. }));
    }

    #[test]
    fn test_message_shape() {
        let mut job = sample_job();
        job.set_retry_count(2);
        let message = job.to_message();

        assert_eq!(message["id"].as_str(), Some("job-1"));
        assert_eq!(message["type"].as_str(), Some("mail/send"));
        assert_eq!(message["state"].as_str(), Some("QUEUED"));
        assert_eq!(message["retryCount"].as_i64(), Some(2));
        assert_eq!(message["path"].as_str(), Some("/content/a"));

        let parsed = Job::from_message(&message).unwrap();
        assert_eq!(parsed.id(), "job-1");
        assert_eq!(parsed.retry_count(), 2);
        assert_eq!(parsed.properties().len(), 1);
        assert!(!parsed.properties().contains_key("createdAt"));
    }

    #[test]
    fn test_from_message_requires_identity() {
        let mut message = sample_job().to_message();
        message.remove("queue");
        let err = Job::from_message(&message).unwrap_err();
        assert!(matches!(err, JobMeshError::InvalidMessage { .. }));

        let mut message = sample_job().to_message();
        message.insert("retryCount".to_string(), (-1).into());
        assert!(Job::from_message(&message).is_err());

        message.insert("retryCount".to_string(), (i64::from(u32::MAX) + 1).into());
        assert!(matches!(
            Job::from_message(&message),
            Err(JobMeshError::InvalidMessage { .. })
        ));
    }
}
