//! Process-wide tracing setup.
//!
//! The filter comes from `HOSTFLEET_LOG` when set, otherwise from the
//! configured level. Output goes to stderr so command output on stdout stays
//! clean.

use std::io;

use serde::{Deserialize, Serialize};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::error::{FleetError, Result};

/// Environment variable that overrides the configured filter.
pub const LOG_ENV: &str = "HOSTFLEET_LOG";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogConfig {
    /// Default filter directive, e.g. `info` or `hostfleet_core=debug`.
    #[serde(default = "default_level")]
    pub level: String,
    /// Emit one JSON object per line instead of human-readable text.
    #[serde(default)]
    pub json: bool,
    #[serde(default)]
    pub display_target: bool,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: default_level(),
            json: false,
            display_target: false,
        }
    }
}

impl LogConfig {
    /// Raise the level to `debug` unless something more specific was set.
    pub fn verbose(mut self, verbose: bool) -> Self {
        if verbose && self.level == default_level() {
            self.level = "debug".to_string();
        }
        self
    }
}

/// Build the filter: `HOSTFLEET_LOG` wins over the configured level.
pub fn build_filter(config: &LogConfig) -> Result<EnvFilter> {
    let directive = std::env::var(LOG_ENV).unwrap_or_else(|_| config.level.clone());
    EnvFilter::try_new(&directive)
        .map_err(|e| FleetError::Configuration(format!("invalid log filter '{}': {}", directive, e)))
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(config: &LogConfig) -> Result<()> {
    let filter = build_filter(config)?;
    let registry = tracing_subscriber::registry().with(filter);
    let installed = if config.json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_target(config.display_target)
                    .with_writer(io::stderr),
            )
            .try_init()
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .compact()
                    .with_target(config.display_target)
                    .with_writer(io::stderr),
            )
            .try_init()
    };
    installed.map_err(|e| FleetError::Configuration(format!("failed to initialize logging: {}", e)))
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_level_is_info() {
        let config = LogConfig::default();
        assert_eq!(config.level, "info");
        assert!(!config.json);
    }

    #[test]
    fn verbose_raises_default_only() {
        assert_eq!(LogConfig::default().verbose(true).level, "debug");
        let custom = LogConfig {
            level: "warn".into(),
            ..LogConfig::default()
        };
        assert_eq!(custom.verbose(true).level, "warn");
        assert_eq!(LogConfig::default().verbose(false).level, "info");
    }

    #[test]
    fn invalid_directive_is_configuration_error() {
        if std::env::var(LOG_ENV).is_ok() {
            return;
        }
        let config = LogConfig {
            level: "hostfleet=notalevel".into(),
            ..LogConfig::default()
        };
        assert!(matches!(build_filter(&config), Err(FleetError::Configuration(_))));
    }

    #[test]
    fn yaml_section_parses() {
        let config: LogConfig = serde_yaml::from_str("level: debug\njson: true\n").unwrap();
        assert_eq!(config.level, "debug");
        assert!(config.json);
    }
}
