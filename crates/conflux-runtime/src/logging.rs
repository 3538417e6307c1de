//! Tracing subscriber setup driven by [`LoggingConfig`].

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{fmt, EnvFilter, Layer};

use crate::config::LoggingConfig;

/// Install a global subscriber. `RUST_LOG` overrides the configured level.
///
/// Fails if a global subscriber is already installed.
pub fn init(config: &LoggingConfig) -> Result<(), TryInitError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let layer = match (config.format.as_str(), config.timestamps) {
        ("json", true) => fmt::layer().json().boxed(),
        ("json", false) => fmt::layer().json().without_time().boxed(),
        (_, true) => fmt::layer().boxed(),
        (_, false) => fmt::layer().without_time().boxed(),
    };

    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .try_init()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_fails() {
        let config = LoggingConfig {
            level: "debug".to_string(),
            format: "json".to_string(),
            timestamps: false,
        };
        let _ = init(&config);
        assert!(init(&LoggingConfig::default()).is_err());
    }
}
