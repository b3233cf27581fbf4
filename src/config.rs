//! Configuration for a jobmesh instance.
//!
//! Everything an instance needs at start-up lives in [`JobMeshConfig`]: queue
//! configurations, thread pools, transport, scheduler, notifications, logging and metrics.
//! Configurations load from TOML files or `JOBMESH_*` environment variables and are checked
//! by [`JobMeshConfig::validate`] before the service starts.
//!
//! ```rust
//! use jobmesh::config::{JobMeshConfig, QueueConfiguration, QueueType};
//!
//! let config = JobMeshConfig::new()
//!     .with_instance_id("node-a")
//!     .with_queue(
//!         QueueConfiguration::new("mail")
//!             .with_topics(vec!["mail/*".to_string()])
//!             .with_queue_type(QueueType::Ordered)
//!             .with_retries(3),
//!     );
//!
//! assert!(config.validate().is_ok());
//! let resolved = config.queue_configurations().resolve("mail/outbound");
//! assert_eq!(resolved.name(), "mail");
//! ```

use crate::{
    error::JobMeshError, events::EventConfig, priority::JobPriority,
    retry::{JitterType, RetryStrategy},
};

#[cfg(feature = "metrics")]
use crate::metrics::MetricsConfig;

use serde::{Deserialize, Serialize};
use std::{collections::HashSet, path::Path, time::Duration};

/// Name of the thread pool that always exists.
pub const DEFAULT_THREAD_POOL: &str = "default";

/// Name of the queue that catches every topic no other configuration matches.
pub const MAIN_QUEUE: &str = "main";

/// Serializes `Duration` as human strings such as "250ms", "30s", "5m" or "1h".
pub(crate) mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format(*duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;

        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(D::Error::custom)
    }

    pub fn format(duration: Duration) -> String {
        let millis = duration.as_millis();
        if millis == 0 {
            "0s".to_string()
        } else if millis % 1000 != 0 {
            format!("{}ms", millis)
        } else {
            let secs = duration.as_secs();
            if secs % 3600 == 0 {
                format!("{}h", secs / 3600)
            } else if secs % 60 == 0 {
                format!("{}m", secs / 60)
            } else {
                format!("{}s", secs)
            }
        }
    }

    /// Parses "90" (seconds), "250ms", "30s", "5m", "1h" or "1d".
    pub fn parse(s: &str) -> Result<Duration, String> {
        let s = s.trim();

        if let Ok(secs) = s.parse::<u64>() {
            return Ok(Duration::from_secs(secs));
        }

        let split = s
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| format!("Invalid duration format: {}", s))?;
        let (num_str, suffix) = s.split_at(split);
        let num: u64 = num_str
            .parse()
            .map_err(|_| format!("Invalid number in duration: {}", s))?;

        match suffix {
            "ms" => Ok(Duration::from_millis(num)),
            "s" => Ok(Duration::from_secs(num)),
            "m" => Ok(Duration::from_secs(num * 60)),
            "h" => Ok(Duration::from_secs(num * 3600)),
            "d" => Ok(Duration::from_secs(num * 86400)),
            _ => Err(format!(
                "Invalid duration suffix: {}. Use ms, s, m, h, or d",
                suffix
            )),
        }
    }
}

/// How a queue delivers jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum QueueType {
    /// Same-topic jobs are processed one at a time in enqueue order.
    Ordered,
    /// Up to `max_parallel` jobs run at once.
    #[default]
    Unordered,
    /// Like `Unordered`, but jobs are taken from the queued topics in turn.
    #[serde(rename = "TOPIC_ROUND_ROBIN", alias = "TOPICROUNDROBIN")]
    TopicRoundRobin,
    /// Jobs routed here are left queued and never processed by this instance.
    Ignore,
}

/// A pattern from `matched_topics`.
///
/// * `a/b` matches exactly `a/b`
/// * `a/b/.` matches direct children such as `a/b/c`
/// * `a/b/*` matches every descendant; `*` alone matches every topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicMatcher {
    Exact(String),
    Children(String),
    Subtree(String),
}

impl TopicMatcher {
    pub fn parse(pattern: &str) -> Self {
        let pattern = pattern.trim();
        if pattern == "*" {
            TopicMatcher::Subtree(String::new())
        } else if let Some(prefix) = pattern.strip_suffix("/*") {
            TopicMatcher::Subtree(format!("{}/", prefix))
        } else if let Some(prefix) = pattern.strip_suffix("/.") {
            TopicMatcher::Children(format!("{}/", prefix))
        } else {
            TopicMatcher::Exact(pattern.to_string())
        }
    }

    /// Returns the part of `topic` covered by the wildcard, or `None` when it does not match.
    /// Exact matches yield the whole topic.
    pub fn matches(&self, topic: &str) -> Option<String> {
        match self {
            TopicMatcher::Exact(exact) => (exact == topic).then(|| topic.to_string()),
            TopicMatcher::Children(prefix) => topic
                .strip_prefix(prefix.as_str())
                .filter(|rest| !rest.is_empty() && !rest.contains('/'))
                .map(str::to_string),
            TopicMatcher::Subtree(prefix) => topic
                .strip_prefix(prefix.as_str())
                .filter(|rest| !rest.is_empty())
                .map(str::to_string),
        }
    }
}

fn default_retries() -> i32 {
    10
}

fn default_retry_delay_ms() -> u64 {
    2000
}

fn default_max_parallel() -> usize {
    15
}

fn default_true() -> bool {
    true
}

/// Routing, ordering and retry policy for one queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfiguration {
    /// Queue name; `{0}` is replaced by the matched part of the topic.
    pub name: String,

    #[serde(default)]
    pub matched_topics: Vec<String>,

    #[serde(rename = "type", default)]
    pub queue_type: QueueType,

    /// Redeliveries after the first attempt; `-1` retries forever.
    #[serde(default = "default_retries")]
    pub retries: i32,

    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    #[serde(default)]
    pub priority: JobPriority,

    /// Keep succeeded jobs in the history.
    #[serde(default = "default_true")]
    pub keep_finished_jobs: bool,

    /// Concurrent executions for unordered queues.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,

    #[serde(default)]
    pub thread_pool: Option<String>,

    /// Turns the retry delay into an exponential backoff.
    #[serde(default)]
    pub retry_backoff_multiplier: Option<f64>,

    #[serde(default)]
    pub max_retry_delay_ms: Option<u64>,

    /// Spreads each retry delay by up to this fraction (0.0 to 1.0) either way.
    #[serde(default)]
    pub retry_jitter: Option<f64>,

    /// Spreads each retry delay by up to this many milliseconds either way.
    #[serde(default)]
    pub retry_jitter_ms: Option<u64>,

    /// Highest ranking wins when several configurations match a topic.
    #[serde(default)]
    pub ranking: i32,
}

impl QueueConfiguration {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            matched_topics: Vec::new(),
            queue_type: QueueType::default(),
            retries: default_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            priority: JobPriority::default(),
            keep_finished_jobs: true,
            max_parallel: default_max_parallel(),
            thread_pool: None,
            retry_backoff_multiplier: None,
            max_retry_delay_ms: None,
            retry_jitter: None,
            retry_jitter_ms: None,
            ranking: 0,
        }
    }

    pub fn with_topics(mut self, topics: Vec<String>) -> Self {
        self.matched_topics = topics;
        self
    }

    pub fn with_queue_type(mut self, queue_type: QueueType) -> Self {
        self.queue_type = queue_type;
        self
    }

    pub fn with_retries(mut self, retries: i32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_retry_delay_ms(mut self, retry_delay_ms: u64) -> Self {
        self.retry_delay_ms = retry_delay_ms;
        self
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_keep_finished_jobs(mut self, keep: bool) -> Self {
        self.keep_finished_jobs = keep;
        self
    }

    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel;
        self
    }

    pub fn with_thread_pool(mut self, pool: impl Into<String>) -> Self {
        self.thread_pool = Some(pool.into());
        self
    }

    pub fn with_backoff(mut self, multiplier: f64, max_retry_delay_ms: Option<u64>) -> Self {
        self.retry_backoff_multiplier = Some(multiplier);
        self.max_retry_delay_ms = max_retry_delay_ms;
        self
    }

    /// Multiplicative jitter: a `factor` of 0.2 keeps delays within 80% to 120%.
    pub fn with_retry_jitter(mut self, factor: f64) -> Self {
        self.retry_jitter = Some(factor);
        self.retry_jitter_ms = None;
        self
    }

    pub fn with_retry_jitter_ms(mut self, jitter_ms: u64) -> Self {
        self.retry_jitter_ms = Some(jitter_ms);
        self.retry_jitter = None;
        self
    }

    pub fn with_ranking(mut self, ranking: i32) -> Self {
        self.ranking = ranking;
        self
    }

    /// Whether a job that already failed `retry_count` times may be redelivered.
    pub fn can_retry(&self, retry_count: u32) -> bool {
        self.retries < 0 || retry_count <= self.retries as u32
    }

    pub fn retry_strategy(&self) -> RetryStrategy {
        let base = Duration::from_millis(self.retry_delay_ms);
        let max = self.max_retry_delay_ms.map(Duration::from_millis);
        let jitter = match (self.retry_jitter, self.retry_jitter_ms) {
            (Some(factor), _) => Some(JitterType::Multiplicative(factor)),
            (None, Some(ms)) => Some(JitterType::Additive(Duration::from_millis(ms))),
            (None, None) => None,
        };
        let multiplier = self
            .retry_backoff_multiplier
            .filter(|multiplier| *multiplier > 1.0);
        match (multiplier, jitter) {
            (Some(multiplier), None) => RetryStrategy::exponential(base, multiplier, max),
            (multiplier, Some(jitter)) => RetryStrategy::exponential_with_jitter(
                base,
                multiplier.unwrap_or(1.0),
                max,
                jitter,
            ),
            (None, None) => RetryStrategy::fixed(base),
        }
    }

    /// Queue name for `topic` if this configuration matches it.
    pub fn match_topic(&self, topic: &str) -> Option<String> {
        self.matched_topics
            .iter()
            .map(|pattern| TopicMatcher::parse(pattern))
            .find_map(|matcher| matcher.matches(topic))
            .map(|matched| self.name.replace("{0}", &matched))
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.name.trim().is_empty() {
            return Err(JobMeshError::Config("queue name must not be empty".to_string()));
        }
        if self.retries < -1 {
            return Err(JobMeshError::Config(format!(
                "queue '{}': retries must be -1 or greater, got {}",
                self.name, self.retries
            )));
        }
        if self.max_parallel == 0 {
            return Err(JobMeshError::Config(format!(
                "queue '{}': max_parallel must be at least 1",
                self.name
            )));
        }
        if let Some(multiplier) = self.retry_backoff_multiplier {
            if !multiplier.is_finite() || multiplier < 1.0 {
                return Err(JobMeshError::Config(format!(
                    "queue '{}': retry_backoff_multiplier must be >= 1.0",
                    self.name
                )));
            }
        }
        if let Some(factor) = self.retry_jitter {
            if !(0.0..=1.0).contains(&factor) {
                return Err(JobMeshError::Config(format!(
                    "queue '{}': retry_jitter must be within 0.0..=1.0",
                    self.name
                )));
            }
            if self.retry_jitter_ms.is_some() {
                return Err(JobMeshError::Config(format!(
                    "queue '{}': set either retry_jitter or retry_jitter_ms",
                    self.name
                )));
            }
        }
        if self.matched_topics.iter().any(|t| t.trim().is_empty()) {
            return Err(JobMeshError::Config(format!(
                "queue '{}': matched topics must not be empty",
                self.name
            )));
        }
        Ok(())
    }
}

/// A queue configuration resolved for a concrete topic.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedQueue {
    configuration: QueueConfiguration,
}

impl ResolvedQueue {
    /// The concrete queue name, with `{0}` already substituted.
    pub fn name(&self) -> &str {
        &self.configuration.name
    }

    pub fn configuration(&self) -> &QueueConfiguration {
        &self.configuration
    }

    pub fn into_configuration(self) -> QueueConfiguration {
        self.configuration
    }
}

/// Topic-to-queue resolution over all configured queues plus the main queue.
#[derive(Debug, Clone)]
pub struct QueueConfigurations {
    main: QueueConfiguration,
    ranked: Vec<QueueConfiguration>,
}

impl QueueConfigurations {
    pub fn new(main: QueueConfiguration, queues: Vec<QueueConfiguration>) -> Self {
        let mut ranked = queues;
        // stable: equal rankings keep their declaration order
        ranked.sort_by(|a, b| b.ranking.cmp(&a.ranking));
        Self { main, ranked }
    }

    pub fn resolve(&self, topic: &str) -> ResolvedQueue {
        for configuration in &self.ranked {
            if let Some(name) = configuration.match_topic(topic) {
                let mut resolved = configuration.clone();
                resolved.name = name;
                return ResolvedQueue {
                    configuration: resolved,
                };
            }
        }
        ResolvedQueue {
            configuration: self.main.clone(),
        }
    }

    /// Looks up a queue by concrete name.
    ///
    /// Dynamic queue names are not known here until a topic resolves to them.
    pub fn by_name(&self, name: &str) -> Option<&QueueConfiguration> {
        if self.main.name == name {
            return Some(&self.main);
        }
        self.ranked.iter().find(|c| c.name == name)
    }

    pub fn main(&self) -> &QueueConfiguration {
        &self.main
    }

    pub fn all(&self) -> impl Iterator<Item = &QueueConfiguration> {
        std::iter::once(&self.main).chain(self.ranked.iter())
    }
}

/// What a pool does when its pending queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SaturationPolicy {
    #[default]
    Reject,
    RunOnCaller,
    DiscardOldest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadPoolConfig {
    pub name: String,
    pub min_pool_size: usize,
    pub max_pool_size: usize,
    /// Pending-task capacity; `None` is unbounded.
    pub queue_size: Option<usize>,
    #[serde(with = "duration_str")]
    pub keep_alive: Duration,
    pub saturation_policy: SaturationPolicy,
    #[serde(with = "duration_str")]
    pub shutdown_grace: Duration,
}

impl ThreadPoolConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_pool_size(mut self, min: usize, max: usize) -> Self {
        self.min_pool_size = min;
        self.max_pool_size = max;
        self
    }

    pub fn with_queue_size(mut self, queue_size: Option<usize>) -> Self {
        self.queue_size = queue_size;
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn with_saturation_policy(mut self, policy: SaturationPolicy) -> Self {
        self.saturation_policy = policy;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.name.trim().is_empty() {
            return Err(JobMeshError::Config(
                "thread pool name must not be empty".to_string(),
            ));
        }
        if self.max_pool_size == 0 || self.min_pool_size > self.max_pool_size {
            return Err(JobMeshError::Config(format!(
                "thread pool '{}': need 0 <= min ({}) <= max ({}) and max >= 1",
                self.name, self.min_pool_size, self.max_pool_size
            )));
        }
        if self.queue_size == Some(0) && self.saturation_policy == SaturationPolicy::DiscardOldest
        {
            return Err(JobMeshError::Config(format!(
                "thread pool '{}': discard_oldest needs a queue size of at least 1",
                self.name
            )));
        }
        Ok(())
    }
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_THREAD_POOL.to_string(),
            min_pool_size: 1,
            max_pool_size: 10,
            queue_size: None,
            keep_alive: Duration::from_secs(60),
            saturation_policy: SaturationPolicy::default(),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Delay before a message whose handler asked for a requeue is delivered again
    #[serde(with = "duration_str")]
    pub redelivery_delay: Duration,
    /// Requeue limit per message; `None` requeues forever
    pub max_redeliveries: Option<u32>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            redelivery_delay: Duration::from_millis(500),
            max_redeliveries: Some(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub enabled: bool,
    /// Timezone for cron triggers that do not name one
    pub default_timezone: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_timezone: "UTC".to_string(),
        }
    }
}

/// Logging configuration consumed by [`crate::logging::init_logging`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive, e.g. "info" or "jobmesh=debug,warn"
    pub level: String,
    pub json_format: bool,
    pub include_location: bool,
    pub service_name: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            include_location: false,
            service_name: "jobmesh".to_string(),
        }
    }
}

/// Main configuration for a jobmesh instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobMeshConfig {
    /// Identity of this instance in the cluster topology
    pub instance_id: String,

    /// Finished jobs kept for inspection
    pub history_size: usize,

    /// Catch-all queue for topics no other configuration matches
    pub default_queue: QueueConfiguration,

    pub queues: Vec<QueueConfiguration>,

    /// Pool used by queues and consumers that do not name one
    pub default_thread_pool: ThreadPoolConfig,

    pub thread_pools: Vec<ThreadPoolConfig>,

    pub transport: TransportConfig,

    pub scheduler: SchedulerConfig,

    pub events: EventConfig,

    pub logging: LoggingConfig,

    #[cfg(feature = "metrics")]
    pub metrics: MetricsConfig,
}

impl Default for JobMeshConfig {
    fn default() -> Self {
        Self {
            instance_id: uuid::Uuid::new_v4().to_string(),
            history_size: 1000,
            default_queue: QueueConfiguration::new(MAIN_QUEUE),
            queues: Vec::new(),
            default_thread_pool: ThreadPoolConfig::default(),
            thread_pools: Vec::new(),
            transport: TransportConfig::default(),
            scheduler: SchedulerConfig::default(),
            events: EventConfig::default(),
            logging: LoggingConfig::default(),
            #[cfg(feature = "metrics")]
            metrics: MetricsConfig::default(),
        }
    }
}

impl JobMeshConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = instance_id.into();
        self
    }

    pub fn with_history_size(mut self, history_size: usize) -> Self {
        self.history_size = history_size;
        self
    }

    pub fn with_default_queue(mut self, queue: QueueConfiguration) -> Self {
        self.default_queue = queue;
        self
    }

    pub fn with_queue(mut self, queue: QueueConfiguration) -> Self {
        self.queues.push(queue);
        self
    }

    pub fn with_default_thread_pool(mut self, pool: ThreadPoolConfig) -> Self {
        self.default_thread_pool = ThreadPoolConfig {
            name: DEFAULT_THREAD_POOL.to_string(),
            ..pool
        };
        self
    }

    pub fn with_thread_pool(mut self, pool: ThreadPoolConfig) -> Self {
        self.thread_pools.push(pool);
        self
    }

    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_logging(mut self, logging: LoggingConfig) -> Self {
        self.logging = logging;
        self
    }

    pub fn queue_configurations(&self) -> QueueConfigurations {
        QueueConfigurations::new(self.default_queue.clone(), self.queues.clone())
    }

    pub fn from_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> crate::Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Defaults overridden by `JOBMESH_*` environment variables.
    ///
    /// Malformed numeric values are configuration errors rather than silently ignored.
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Self::default();

        if let Ok(instance_id) = std::env::var("JOBMESH_INSTANCE_ID") {
            config.instance_id = instance_id;
        }
        if let Some(size) = env_parse::<usize>("JOBMESH_HISTORY_SIZE")? {
            config.history_size = size;
        }
        if let Some(retries) = env_parse::<i32>("JOBMESH_DEFAULT_RETRIES")? {
            config.default_queue.retries = retries;
        }
        if let Some(delay) = env_parse::<u64>("JOBMESH_DEFAULT_RETRY_DELAY_MS")? {
            config.default_queue.retry_delay_ms = delay;
        }
        if let Some(max_parallel) = env_parse::<usize>("JOBMESH_DEFAULT_MAX_PARALLEL")? {
            config.default_queue.max_parallel = max_parallel;
        }
        if let Some(max) = env_parse::<usize>("JOBMESH_THREAD_POOL_MAX")? {
            config.default_thread_pool.max_pool_size = max;
        }
        if let Ok(delay) = std::env::var("JOBMESH_REDELIVERY_DELAY") {
            config.transport.redelivery_delay =
                duration_str::parse(&delay).map_err(JobMeshError::Config)?;
        }
        if let Some(size) = env_parse::<usize>("JOBMESH_EVENT_BUFFER_SIZE")? {
            config.events.max_buffer_size = size;
        }
        if let Ok(level) = std::env::var("JOBMESH_LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Some(json) = env_parse::<bool>("JOBMESH_LOG_JSON")? {
            config.logging.json_format = json;
        }

        Ok(config)
    }

    /// Rejects configurations the service could not run with.
    pub fn validate(&self) -> crate::Result<()> {
        if self.instance_id.trim().is_empty() {
            return Err(JobMeshError::Config("instance_id must not be empty".to_string()));
        }

        self.default_thread_pool.validate()?;
        let mut pools = HashSet::new();
        pools.insert(DEFAULT_THREAD_POOL.to_string());
        for pool in &self.thread_pools {
            pool.validate()?;
            if !pools.insert(pool.name.clone()) {
                return Err(JobMeshError::Config(format!(
                    "duplicate thread pool '{}'",
                    pool.name
                )));
            }
        }

        let mut names = HashSet::new();
        for queue in std::iter::once(&self.default_queue).chain(self.queues.iter()) {
            queue.validate()?;
            if !names.insert(queue.name.clone()) {
                return Err(JobMeshError::Config(format!(
                    "duplicate queue '{}'",
                    queue.name
                )));
            }
            if let Some(pool) = &queue.thread_pool {
                if !pools.contains(pool) {
                    return Err(JobMeshError::Config(format!(
                        "queue '{}' refers to unknown thread pool '{}'",
                        queue.name, pool
                    )));
                }
            }
        }

        if self.events.max_buffer_size == 0 {
            return Err(JobMeshError::Config(
                "events.max_buffer_size must be at least 1".to_string(),
            ));
        }
        if self.scheduler.default_timezone.parse::<chrono_tz::Tz>().is_err() {
            return Err(JobMeshError::Config(format!(
                "unknown scheduler timezone '{}'",
                self.scheduler.default_timezone
            )));
        }
        Ok(())
    }

    /// Small pools, verbose logging and fast retries.
    pub fn development() -> Self {
        Self {
            default_queue: QueueConfiguration::new(MAIN_QUEUE)
                .with_retries(3)
                .with_retry_delay_ms(100),
            default_thread_pool: ThreadPoolConfig::default().with_pool_size(1, 4),
            events: EventConfig {
                log_events: true,
                ..Default::default()
            },
            logging: LoggingConfig {
                level: "debug".to_string(),
                include_location: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> crate::Result<Option<T>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| JobMeshError::Config(format!("{} has an invalid value '{}'", key, raw))),
        Err(_) => Ok(None),
    }
}
