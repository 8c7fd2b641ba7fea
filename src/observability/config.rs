//! Logging Configuration
//!
//! All settings are loaded from environment variables for 12-factor compliance.

/// Output format of the log layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human readable, one event per line
    Pretty,
    /// One JSON object per event
    Json,
}

/// Tracing configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Filter directive used when `RUST_LOG` is unset (default: info)
    pub default_directive: String,
    /// Output format (FR_LOG_FORMAT: pretty | json)
    pub format: LogFormat,
    /// Include the emitting module path (FR_LOG_TARGETS, default: true)
    pub with_targets: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        TracingConfig {
            default_directive: "info".to_string(),
            format: LogFormat::Pretty,
            with_targets: true,
        }
    }
}

impl TracingConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        TracingConfig {
            default_directive: std::env::var("FR_LOG_LEVEL").unwrap_or(defaults.default_directive),
            format: std::env::var("FR_LOG_FORMAT")
                .map(|v| Self::parse_format(&v))
                .unwrap_or(defaults.format),
            with_targets: std::env::var("FR_LOG_TARGETS")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(defaults.with_targets),
        }
    }

    fn parse_format(value: &str) -> LogFormat {
        match value.to_ascii_lowercase().as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Pretty,
        }
    }
}
