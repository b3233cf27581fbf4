//! Authoritative job snapshots.
//!
//! [`JobStorage`] maps job ids to the most recently accepted [`Job`] snapshot of the active
//! set. Only the job manager writes to it. Two implementations ship with the crate:
//!
//! - [`InMemoryJobStorage`]: a sharded `DashMap`, so writers of different ids never
//!   contend on a global lock
//! - [`StoreBackedJobStorage`]: JSON snapshots kept in any [`KeyValueStore`]

use crate::{
    error::JobMeshError,
    job::{Job, JobId},
    Result,
};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

#[async_trait]
pub trait JobStorage: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<Job>>;

    /// Upserts `job` and returns the stored snapshot.
    async fn put(&self, job: Job) -> Result<Job>;

    async fn remove(&self, id: &str) -> Result<Option<Job>>;

    async fn list(&self) -> Result<Vec<Job>>;

    async fn len(&self) -> Result<usize> {
        Ok(self.list().await?.len())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryJobStorage {
    jobs: DashMap<JobId, Job>,
}

impl InMemoryJobStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStorage for InMemoryJobStorage {
    async fn get(&self, id: &str) -> Result<Option<Job>> {
        Ok(self.jobs.get(id).map(|entry| entry.value().clone()))
    }

    async fn put(&self, job: Job) -> Result<Job> {
        self.jobs.insert(job.id().to_string(), job.clone());
        Ok(job)
    }

    async fn remove(&self, id: &str) -> Result<Option<Job>> {
        Ok(self.jobs.remove(id).map(|(_, job)| job))
    }

    async fn list(&self) -> Result<Vec<Job>> {
        Ok(self.jobs.iter().map(|entry| entry.value().clone()).collect())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.jobs.len())
    }
}

/// Minimal durable store: string values addressed by string keys.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn put(&self, key: &str, value: String) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<Option<String>>;
    async fn keys(&self) -> Result<Vec<String>>;
}

#[derive(Debug, Default)]
pub struct InMemoryKeyValueStore {
    entries: DashMap<String, String>,
}

impl InMemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    async fn put(&self, key: &str, value: String) -> Result<()> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.remove(key).map(|(_, value)| value))
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.entries.iter().map(|entry| entry.key().clone()).collect())
    }
}

/// Stores each job as a JSON document under `<prefix><id>`.
pub struct StoreBackedJobStorage {
    store: Arc<dyn KeyValueStore>,
    prefix: String,
}

impl StoreBackedJobStorage {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self::with_prefix(store, "jobs/")
    }

    pub fn with_prefix(store: Arc<dyn KeyValueStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    fn key(&self, id: &str) -> String {
        format!("{}{}", self.prefix, id)
    }

    fn decode(&self, key: &str, raw: &str) -> Result<Job> {
        serde_json::from_str(raw).map_err(|e| JobMeshError::Storage {
            message: format!("corrupt job document '{}': {}", key, e),
        })
    }
}

#[async_trait]
impl JobStorage for StoreBackedJobStorage {
    async fn get(&self, id: &str) -> Result<Option<Job>> {
        let key = self.key(id);
        match self.store.get(&key).await? {
            Some(raw) => Ok(Some(self.decode(&key, &raw)?)),
            None => Ok(None),
        }
    }

    async fn put(&self, job: Job) -> Result<Job> {
        let raw = serde_json::to_string(&job)?;
        self.store.put(&self.key(job.id()), raw).await?;
        Ok(job)
    }

    async fn remove(&self, id: &str) -> Result<Option<Job>> {
        let key = self.key(id);
        match self.store.delete(&key).await? {
            Some(raw) => Ok(Some(self.decode(&key, &raw)?)),
            None => Ok(None),
        }
    }

    async fn list(&self) -> Result<Vec<Job>> {
        let mut jobs = Vec::new();
        for key in self.store.keys().await? {
            if !key.starts_with(&self.prefix) {
                continue;
            }
            // a key deleted between keys() and get() is simply skipped
            if let Some(raw) = self.store.get(&key).await? {
                jobs.push(self.decode(&key, &raw)?);
            }
        }
        Ok(jobs)
    }
}
