//! Observability utilities.

use std::sync::OnceLock;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::types::ObservabilityConfig;

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Initialize tracing once for the process from the environment.
///
/// Log format defaults to compact text and can be switched to JSON via
/// `MODELSERVE_LOG_FORMAT=json`. `RUST_LOG` takes precedence over
/// `MODELSERVE_LOG_LEVEL`, which defaults to `info`.
pub fn init_tracing() {
    init_tracing_with(&ObservabilityConfig::from_env());
}

/// Initialize tracing once for the process with an explicit config.
///
/// Output goes to stderr: worker processes use stdout for nothing, and the
/// supervisor forwards worker stderr into its own log.
pub fn init_tracing_with(config: &ObservabilityConfig) {
    TRACING_INIT.get_or_init(|| {
        let env_filter = env_filter(config);

        let result = if config.json_logs {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .try_init()
        } else {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().compact().with_writer(std::io::stderr))
                .try_init()
        };

        if let Err(err) = result {
            eprintln!("tracing init skipped: {err}");
        }
    });
}

fn env_filter(config: &ObservabilityConfig) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

// Installing the global subscriber is left to the integration tests, which
// run in their own process.
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_level_falls_back_to_info() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let filter = env_filter(&ObservabilityConfig {
            log_level: "modelserve=loud".into(),
            json_logs: false,
        });
        assert_eq!(filter.to_string(), "info");
    }
}
