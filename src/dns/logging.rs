//! Log output setup
//!
//! The library logs through the `log` facade. The binary installs a
//! `tracing-subscriber` formatter, which also captures `log` records.

use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Default)]
pub struct LoggerConfig {
    /// Log at debug level unless `RUST_LOG` says otherwise
    pub verbose: bool,
    /// Emit one JSON object per line
    pub json_format: bool,
}

impl LoggerConfig {
    fn default_level(&self) -> &'static str {
        if self.verbose {
            "debug"
        } else {
            "info"
        }
    }
}

/// Build the filter: `RUST_LOG` when set, the configured level otherwise
pub fn build_filter(config: &LoggerConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.default_level()))
}

/// Install the global subscriber. Returns false if one was already
/// installed.
pub fn init_logging(config: &LoggerConfig) -> bool {
    let filter = build_filter(config);

    let result = if config.json_format {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .try_init()
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).try_init()
    };

    match result {
        Ok(()) => true,
        Err(e) => {
            eprintln!("Warning: log subscriber already initialized: {}", e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_level() {
        assert_eq!("info", LoggerConfig::default().default_level());

        let verbose = LoggerConfig {
            verbose: true,
            json_format: false,
        };
        assert_eq!("debug", verbose.default_level());
    }
}
