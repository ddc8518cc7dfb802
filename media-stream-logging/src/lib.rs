//! Structured logging setup for media stream services

use tracing_subscriber::{
    fmt,
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Initialize structured logging
///
/// This sets up:
/// - JSON formatted logs (for production)
/// - Environment-based log level filtering
/// - Service name tagging
///
/// Returns `false` when a global subscriber was already installed.
pub fn init_logging(service_name: &str, default_level: &str) -> bool {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    let installed = tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .json()
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .with_current_span(false)
                .with_span_list(false),
        )
        .try_init()
        .is_ok();

    if installed {
        tracing::info!(
            service = service_name,
            "Logging initialized"
        );
    }
    installed
}

/// Initialize simple console logging (for development and tests)
///
/// Returns `false` when a global subscriber was already installed.
pub fn init_console_logging(service_name: &str, default_level: &str) -> bool {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    let installed = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_test_writer()
        .try_init()
        .is_ok();

    if installed {
        tracing::info!(
            service = service_name,
            "Console logging initialized"
        );
    }
    installed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_noop() {
        let _ = init_console_logging("logging-test", "debug");
        assert!(!init_console_logging("logging-test", "debug"));
        assert!(!init_logging("logging-test", "info"));
    }
}
