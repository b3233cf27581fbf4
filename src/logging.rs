//! Tracing subscriber set-up.

use crate::{config::LoggingConfig, error::JobMeshError};
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

/// Builds the filter from `RUST_LOG` when set, otherwise from the configured level.
pub fn build_env_filter(config: &LoggingConfig) -> crate::Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.level).map_err(|e| {
            JobMeshError::Config(format!("invalid log level '{}': {}", config.level, e))
        }),
    }
}

/// Installs the global subscriber.
///
/// Returns `Ok(false)` when a subscriber was already installed, which makes repeated
/// calls from tests harmless.
pub fn init_logging(config: &LoggingConfig) -> crate::Result<bool> {
    let filter = build_env_filter(config)?;

    let layer = if config.json_format {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_thread_names(true)
            .with_file(config.include_location)
            .with_line_number(config.include_location)
            .with_filter(filter)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_file(config.include_location)
            .with_line_number(config.include_location)
            .with_filter(filter)
            .boxed()
    };

    let installed = tracing_subscriber::registry().with(layer).try_init().is_ok();
    if installed {
        tracing::debug!(
            service = %config.service_name,
            level = %config.level,
            json = config.json_format,
            "Logging initialized"
        );
    }
    Ok(installed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_level_is_config_error() {
        if std::env::var("RUST_LOG").is_ok() {
            return;
        }
        let config = LoggingConfig {
            level: "jobmesh=loud".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            build_env_filter(&config),
            Err(JobMeshError::Config(_))
        ));
    }

    #[test]
    fn test_init_is_idempotent() {
        let config = LoggingConfig::default();
        let _ = init_logging(&config).unwrap();
        assert!(!init_logging(&config).unwrap());
    }
}
