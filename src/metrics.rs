use crate::{events::JobNotification, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[cfg(feature = "metrics")]
use crate::{error::JobMeshError, events::NotificationKind};
#[cfg(feature = "metrics")]
use prometheus::{CounterVec, Encoder, GaugeVec, HistogramVec, Registry, TextEncoder};

/// Configuration for metrics collection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Prefix of every metric name
    pub namespace: String,
    /// Constant labels added to every metric
    pub custom_labels: HashMap<String, String>,
    /// Whether to collect processing time histograms
    pub collect_histograms: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            namespace: "jobmesh".to_string(),
            custom_labels: HashMap::new(),
            collect_histograms: true,
        }
    }
}

impl MetricsConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Add custom labels to all metrics
    pub fn with_labels(mut self, labels: HashMap<String, String>) -> Self {
        self.custom_labels = labels;
        self
    }

    pub fn with_histograms(mut self, enabled: bool) -> Self {
        self.collect_histograms = enabled;
        self
    }
}

/// Prometheus metrics fed from job notifications.
#[cfg(feature = "metrics")]
pub struct PrometheusMetricsCollector {
    config: MetricsConfig,
    registry: Registry,
    notifications_total: CounterVec,
    jobs_queued: GaugeVec,
    jobs_active: GaugeVec,
    processing_seconds: HistogramVec,
}

#[cfg(feature = "metrics")]
impl PrometheusMetricsCollector {
    pub fn new(config: MetricsConfig) -> Result<Self> {
        let labels = (!config.custom_labels.is_empty()).then(|| config.custom_labels.clone());
        let registry = Registry::new_custom(Some(config.namespace.clone()), labels)
            .map_err(|e| metrics_error("create registry", e))?;

        let notifications_total = CounterVec::new(
            prometheus::Opts::new("job_notifications_total", "Job lifecycle notifications by kind"),
            &["queue", "kind"],
        )
        .map_err(|e| metrics_error("create job_notifications_total", e))?;

        let jobs_queued = GaugeVec::new(
            prometheus::Opts::new("jobs_queued", "Jobs waiting in a queue"),
            &["queue"],
        )
        .map_err(|e| metrics_error("create jobs_queued", e))?;

        let jobs_active = GaugeVec::new(
            prometheus::Opts::new("jobs_active", "Jobs currently executing"),
            &["queue"],
        )
        .map_err(|e| metrics_error("create jobs_active", e))?;

        let processing_seconds = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "job_processing_seconds",
                "Processing time of finished jobs in seconds",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
            &["queue"],
        )
        .map_err(|e| metrics_error("create job_processing_seconds", e))?;

        registry
            .register(Box::new(notifications_total.clone()))
            .map_err(|e| metrics_error("register job_notifications_total", e))?;
        registry
            .register(Box::new(jobs_queued.clone()))
            .map_err(|e| metrics_error("register jobs_queued", e))?;
        registry
            .register(Box::new(jobs_active.clone()))
            .map_err(|e| metrics_error("register jobs_active", e))?;
        registry
            .register(Box::new(processing_seconds.clone()))
            .map_err(|e| metrics_error("register job_processing_seconds", e))?;

        Ok(Self {
            config,
            registry,
            notifications_total,
            jobs_queued,
            jobs_active,
            processing_seconds,
        })
    }

    /// Record a job notification as metrics
    pub fn record(&self, notification: &JobNotification) {
        let queue = notification.queue.as_str();
        self.notifications_total
            .with_label_values(&[queue, notification.kind.as_str()])
            .inc();

        match notification.previous_state {
            Some(crate::job::JobState::Queued) => self.jobs_queued.with_label_values(&[queue]).dec(),
            Some(crate::job::JobState::Running) => self.jobs_active.with_label_values(&[queue]).dec(),
            _ => {}
        }
        match notification.kind {
            NotificationKind::Added | NotificationKind::Failed | NotificationKind::Retried => {
                self.jobs_queued.with_label_values(&[queue]).inc()
            }
            NotificationKind::Started => self.jobs_active.with_label_values(&[queue]).inc(),
            _ => {}
        }

        if self.config.collect_histograms && notification.kind == NotificationKind::Finished {
            if let Some(elapsed_ms) = notification.processing_time_ms {
                self.processing_seconds
                    .with_label_values(&[queue])
                    .observe(elapsed_ms as f64 / 1000.0);
            }
        }
    }

    /// Get metrics as Prometheus text format
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| metrics_error("encode metrics", e))?;

        String::from_utf8(buffer).map_err(|e| JobMeshError::Metrics {
            message: format!("Failed to convert metrics to string: {}", e),
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

#[cfg(feature = "metrics")]
fn metrics_error(action: &str, error: impl std::fmt::Display) -> JobMeshError {
    JobMeshError::Metrics {
        message: format!("Failed to {}: {}", action, error),
    }
}

/// No-op metrics collector when metrics feature is disabled
#[cfg(not(feature = "metrics"))]
pub struct PrometheusMetricsCollector {
    _config: MetricsConfig,
}

#[cfg(not(feature = "metrics"))]
impl PrometheusMetricsCollector {
    pub fn new(config: MetricsConfig) -> Result<Self> {
        Ok(Self { _config: config })
    }

    pub fn record(&self, _notification: &JobNotification) {}

    pub fn render(&self) -> Result<String> {
        Ok("# Metrics collection disabled\n".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NotificationKind;

    #[test]
    fn test_metrics_config_defaults() {
        let config = MetricsConfig::default();
        assert_eq!(config.namespace, "jobmesh");
        assert!(config.collect_histograms);
        assert!(config.custom_labels.is_empty());
    }

    #[test]
    fn test_metrics_config_labels() {
        let mut labels = HashMap::new();
        labels.insert("service".to_string(), "render-farm".to_string());

        let config = MetricsConfig::new()
            .with_namespace("farm")
            .with_labels(labels.clone());
        assert_eq!(config.custom_labels, labels);
        assert_eq!(config.namespace, "farm");
    }

    #[cfg(feature = "metrics")]
    #[test]
    fn test_records_notifications() {
        let collector = PrometheusMetricsCollector::new(MetricsConfig::new()).unwrap();
        collector.record(&JobNotification::new(NotificationKind::Added, "1", "t", "type", "q"));
        collector.record(&JobNotification::new(NotificationKind::Started, "1", "t", "type", "q"));
        collector.record(
            &JobNotification::new(NotificationKind::Finished, "1", "t", "type", "q")
                .with_processing_time_ms(1500),
        );

        let text = collector.render().unwrap();
        assert!(text.contains("jobmesh_job_notifications_total"));
        assert!(text.contains("kind=\"finished\""));
        assert!(text.contains("jobmesh_job_processing_seconds"));
        assert!(text.contains("jobmesh_jobs_active"));
    }

    #[cfg(not(feature = "metrics"))]
    #[test]
    fn test_noop_collector() {
        let collector = PrometheusMetricsCollector::new(MetricsConfig::new()).unwrap();
        collector.record(&JobNotification::new(NotificationKind::Added, "1", "t", "type", "q"));
        assert!(collector.render().unwrap().contains("disabled"));
    }
}
