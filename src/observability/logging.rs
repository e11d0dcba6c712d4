//! # Structured Logging
//!
//! Installs the global `tracing` subscriber. Output is JSON or human-readable text,
//! selected by `observability.log_format`. `RUST_LOG` takes precedence over the
//! configured level when set.

use crate::core::config::ObservabilityConfig;
use crate::core::error::{GatewayError, GatewayResult};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Build the filter: `RUST_LOG` if present, otherwise `<level>` for the gateway and
/// `tower_http` at the same level
pub fn build_env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives(level)))
}

fn default_directives(level: &str) -> String {
    format!(
        "{level},kerya_gateway={level},tower_http={level}",
        level = level.to_lowercase()
    )
}

/// Initialize the tracing subscriber
///
/// Fails if a global subscriber has already been installed.
pub fn init_logging(config: &ObservabilityConfig) -> GatewayResult<()> {
    let env_filter = build_env_filter(&config.log_level);

    let result = match config.log_format.to_lowercase().as_str() {
        "text" => Registry::default()
            .with(env_filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .try_init(),
        _ => Registry::default()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_target(true)
                    .with_thread_ids(true),
            )
            .try_init(),
    };

    result.map_err(|e| GatewayError::internal(format!("Failed to initialize logging: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directives() {
        assert_eq!(
            default_directives("DEBUG"),
            "debug,kerya_gateway=debug,tower_http=debug"
        );
    }
}
