//! Configuration for the Flight Recorder
//!
//! Defines configuration structs for rotation, row formatting, bundling,
//! upload draining, the remote sink and location pings. Every struct has a
//! production `Default` and a `test()` constructor with small intervals.

use crate::recording::bundle::Compression;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration for a recorder instance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// Root of the per-session working directories
    pub root_dir: PathBuf,
    /// Directory receiving iteration bundles and session exports
    pub export_dir: PathBuf,
    /// Rotation settings
    pub rotation: RotationConfig,
    /// Row formatting settings
    pub writer: WriterConfig,
    /// Bundle settings
    pub bundle: BundleConfig,
    /// Upload drain settings
    pub upload: UploadConfig,
    /// Remote sink settings
    pub sink: SinkConfig,
    /// Location pings (disabled when absent)
    pub ping: Option<PingConfig>,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        RecorderConfig {
            root_dir: PathBuf::from("recordings/work"),
            export_dir: PathBuf::from("recordings/export"),
            rotation: RotationConfig::default(),
            writer: WriterConfig::default(),
            bundle: BundleConfig::default(),
            upload: UploadConfig::default(),
            sink: SinkConfig::default(),
            ping: None,
        }
    }
}

impl RecorderConfig {
    /// Create config rooted at a local directory
    pub fn local(base: &Path) -> Self {
        RecorderConfig {
            root_dir: base.join("work"),
            export_dir: base.join("export"),
            ..Default::default()
        }
    }

    /// Create config for testing: manual rotation, fast drains
    pub fn test(base: &Path) -> Self {
        RecorderConfig {
            root_dir: base.join("work"),
            export_dir: base.join("export"),
            rotation: RotationConfig::test(),
            writer: WriterConfig::default(),
            bundle: BundleConfig::test(),
            upload: UploadConfig::test(),
            sink: SinkConfig::default(),
            ping: None,
        }
    }

    /// Parse a TOML document. Missing keys fall back to defaults.
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let config: RecorderConfig =
            toml::from_str(input).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file, then apply environment overrides
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml_str(&text)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Build from defaults plus environment overrides
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Overlay `FR_*` environment variables.
    ///
    /// | Variable | Field |
    /// |----------|-------|
    /// | FR_ROOT_DIR | root_dir |
    /// | FR_EXPORT_DIR | export_dir |
    /// | FR_ROTATION_INTERVAL_MS | rotation.interval |
    /// | FR_DRAIN_INTERVAL_MS | upload.drain_interval |
    /// | FR_UPLOAD_ENABLED | upload.enabled |
    /// | FR_SINK_URL | sink.base_url |
    /// | FR_SINK_USERNAME | sink.username |
    /// | FR_SINK_PASSWORD | sink.password |
    /// | FR_PING_URL_TEMPLATE | ping.url_template |
    /// | FR_PING_STREAM | ping.stream |
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("FR_ROOT_DIR") {
            self.root_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("FR_EXPORT_DIR") {
            self.export_dir = PathBuf::from(v);
        }
        if let Some(ms) = lookup("FR_ROTATION_INTERVAL_MS").and_then(|v| v.parse().ok()) {
            self.rotation.interval = Duration::from_millis(ms);
        }
        if let Some(ms) = lookup("FR_DRAIN_INTERVAL_MS").and_then(|v| v.parse().ok()) {
            self.upload.drain_interval = Duration::from_millis(ms);
        }
        if let Some(v) = lookup("FR_UPLOAD_ENABLED") {
            self.upload.enabled = v == "true" || v == "1";
        }
        if let Some(v) = lookup("FR_SINK_URL") {
            self.sink.base_url = Some(v);
        }
        if let Some(v) = lookup("FR_SINK_USERNAME") {
            self.sink.username = Some(v);
        }
        if let Some(v) = lookup("FR_SINK_PASSWORD") {
            self.sink.password = Some(v);
        }
        if let Some(template) = lookup("FR_PING_URL_TEMPLATE") {
            let stream = lookup("FR_PING_STREAM").unwrap_or_else(|| "location".to_string());
            let min_interval = self
                .ping
                .as_ref()
                .map(|p| p.min_interval)
                .unwrap_or_else(|| PingConfig::default().min_interval);
            self.ping = Some(PingConfig {
                url_template: template,
                stream,
                min_interval,
            });
        }
    }

    /// Reject settings the runtime cannot honour
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rotation.mode == RotationMode::Timer && self.rotation.interval.is_zero() {
            return Err(ConfigError::Invalid(
                "rotation.interval must be non-zero in timer mode".to_string(),
            ));
        }
        if self.upload.enabled && self.upload.drain_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "upload.drain_interval must be non-zero".to_string(),
            ));
        }
        if self.writer.delimiter == '\n' {
            return Err(ConfigError::Invalid(
                "writer.delimiter cannot be a newline".to_string(),
            ));
        }
        if self.bundle.extension.is_empty() || self.bundle.extension.contains('/') {
            return Err(ConfigError::Invalid(format!(
                "bundle.extension is not a valid extension: {:?}",
                self.bundle.extension
            )));
        }
        Ok(())
    }
}

/// How the rotation ticker is driven
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RotationMode {
    /// Periodic timer owned by the iteration manager
    Timer,
    /// Ticks are issued by the caller (tests, external schedulers)
    Manual,
    /// No iterations; only the live mirror and session export
    Disabled,
}

/// Rotation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationConfig {
    pub mode: RotationMode,
    /// Time between rotations (default: 5s)
    #[serde(with = "duration_millis")]
    pub interval: Duration,
}

impl Default for RotationConfig {
    fn default() -> Self {
        RotationConfig {
            mode: RotationMode::Timer,
            interval: Duration::from_millis(5000),
        }
    }
}

impl RotationConfig {
    /// Manual ticks, short nominal interval
    pub fn test() -> Self {
        RotationConfig {
            mode: RotationMode::Manual,
            interval: Duration::from_millis(50),
        }
    }
}

/// Row formatting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Field delimiter for headers and rows
    pub delimiter: char,
    /// Decimal places for time fields
    pub time_precision: usize,
    /// Per-file write buffer (bytes)
    pub buffer_capacity: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        WriterConfig {
            delimiter: ';',
            time_precision: 3,
            buffer_capacity: 8 * 1024,
        }
    }
}

/// Bundle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BundleConfig {
    /// File extension of bundles, without the dot
    pub extension: String,
    /// Compress bundle bodies with zstd
    pub compression_enabled: bool,
    /// Zstd level
    pub compression_level: i32,
}

impl Default for BundleConfig {
    fn default() -> Self {
        BundleConfig {
            extension: "bundle".to_string(),
            compression_enabled: true,
            compression_level: 3,
        }
    }
}

impl BundleConfig {
    pub fn compression(&self) -> Compression {
        if self.compression_enabled {
            Compression::Zstd {
                level: self.compression_level,
            }
        } else {
            Compression::None
        }
    }

    pub fn test() -> Self {
        BundleConfig {
            extension: "bundle".to_string(),
            compression_enabled: true,
            compression_level: 1,
        }
    }
}

/// Upload queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Route archived iterations to the upload queue
    pub enabled: bool,
    /// Time between drain attempts (default: 1s)
    #[serde(with = "duration_millis")]
    pub drain_interval: Duration,
}

impl Default for UploadConfig {
    fn default() -> Self {
        UploadConfig {
            enabled: true,
            drain_interval: Duration::from_millis(1000),
        }
    }
}

impl UploadConfig {
    pub fn test() -> Self {
        UploadConfig {
            enabled: true,
            drain_interval: Duration::from_millis(20),
        }
    }
}

/// Remote sink configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    /// Base URL bundles are uploaded below
    pub base_url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Per-request timeout (default: 30s)
    #[serde(with = "duration_millis")]
    pub request_timeout: Duration,
    /// Connect timeout of the reachability probe (default: 2s)
    #[serde(with = "duration_millis")]
    pub probe_timeout: Duration,
}

impl Default for SinkConfig {
    fn default() -> Self {
        SinkConfig {
            base_url: None,
            username: None,
            password: None,
            request_timeout: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(2),
        }
    }
}

impl SinkConfig {
    /// `host:port` of the base URL, for the reachability probe
    pub fn probe_addr(&self) -> Option<String> {
        let url = self.base_url.as_deref()?;
        let (scheme, rest) = url.split_once("://")?;
        let authority = rest.split('/').next()?;
        let host_port = authority.rsplit('@').next()?;
        if host_port.is_empty() {
            return None;
        }
        if host_port.rsplit_once(':').is_some_and(|(_, p)| p.parse::<u16>().is_ok()) {
            return Some(host_port.to_string());
        }
        let port = match scheme {
            "https" => 443,
            _ => 80,
        };
        Some(format!("{}:{}", host_port, port))
    }
}

/// Location ping configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PingConfig {
    /// URL with `{lat}`, `{lon}`, `{alt}`, `{time}` and `{session}` placeholders
    pub url_template: String,
    /// Stream whose values carry the position
    pub stream: String,
    /// Minimum spacing between pings (default: 10s)
    #[serde(with = "duration_millis")]
    pub min_interval: Duration,
}

impl Default for PingConfig {
    fn default() -> Self {
        PingConfig {
            url_template: String::new(),
            stream: "location".to_string(),
            min_interval: Duration::from_secs(10),
        }
    }
}

/// Configuration errors
#[derive(Debug)]
pub enum ConfigError {
    /// Reading the file failed
    Io(std::io::Error),
    /// TOML syntax or type error
    Parse(String),
    /// Semantically invalid value
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Config I/O error: {}", e),
            ConfigError::Parse(msg) => write!(f, "Config parse error: {}", msg),
            ConfigError::Invalid(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

/// Serde helper for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
