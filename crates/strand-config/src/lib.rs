//! Configuration for strand connections, adapters and logging.
//!
//! A config file is TOML:
//!
//! ```toml
//! [connection]
//! message_size_max = 1048576
//! timeout_ms = 60000
//! compression_level = 1
//!
//! [acm.client]
//! timeout_secs = 60
//! heartbeat = "on_invocation"
//! close = "on_invocation_and_idle"
//!
//! [adapter.public]
//! max_connections = 128
//!
//! [logging]
//! level = "info"
//! ```
//!
//! Every field has a default, so an empty file is a valid config.

mod diagnostics;
mod validation;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Once;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use diagnostics::{ConfigDiagnostics, ConfigWarning};

/// Smallest message the wire protocol can carry (a bare header).
const MIN_MESSAGE_SIZE: usize = 14;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StrandConfig {
    #[serde(default)]
    pub connection: ConnectionConfig,

    #[serde(default)]
    pub acm: AcmSection,

    /// Per-adapter settings keyed by adapter name.
    #[serde(default)]
    pub adapter: BTreeMap<String, AdapterConfig>,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl StrandConfig {
    /// Settings for the named adapter, falling back to defaults.
    pub fn adapter(&self, name: &str) -> AdapterConfig {
        self.adapter.get(name).cloned().unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Largest accepted message, header included.
    #[serde(default = "ConnectionConfig::default_message_size_max")]
    pub message_size_max: usize,

    /// Read/write timeout while a message is partially transferred. `0` disables it.
    #[serde(default = "ConnectionConfig::default_timeout_ms")]
    pub timeout_ms: u64,

    /// Timeout for establishing and validating a connection; defaults to `timeout_ms`.
    #[serde(default)]
    pub connect_timeout_ms: Option<u64>,

    /// Timeout for the graceful close handshake; defaults to `timeout_ms`.
    #[serde(default)]
    pub close_timeout_ms: Option<u64>,

    /// Compression level, clamped to `1..=9`.
    #[serde(default = "ConnectionConfig::default_compression_level")]
    pub compression_level: i32,

    /// Flush queued batch requests once they exceed this many bytes. `0` disables it.
    #[serde(default = "ConnectionConfig::default_batch_auto_flush_size")]
    pub batch_auto_flush_size: usize,

    /// Log rejected accepts and connection failures at `warn`.
    #[serde(default)]
    pub warn_connections: bool,

    /// Log dropped datagrams at `warn`.
    #[serde(default)]
    pub warn_datagrams: bool,
}

impl ConnectionConfig {
    fn default_message_size_max() -> usize {
        1024 * 1024
    }

    fn default_timeout_ms() -> u64 {
        60_000
    }

    fn default_compression_level() -> i32 {
        1
    }

    fn default_batch_auto_flush_size() -> usize {
        1024 * 1024
    }

    fn millis(value: u64) -> Option<Duration> {
        (value > 0).then(|| Duration::from_millis(value))
    }

    pub fn timeout(&self) -> Option<Duration> {
        Self::millis(self.timeout_ms)
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        Self::millis(self.connect_timeout_ms.unwrap_or(self.timeout_ms))
    }

    pub fn close_timeout(&self) -> Option<Duration> {
        Self::millis(self.close_timeout_ms.unwrap_or(self.timeout_ms))
    }

    /// The configured level clamped into the supported range.
    pub fn effective_compression_level(&self) -> i32 {
        self.compression_level.clamp(1, 9)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            message_size_max: Self::default_message_size_max(),
            timeout_ms: Self::default_timeout_ms(),
            connect_timeout_ms: None,
            close_timeout_ms: None,
            compression_level: Self::default_compression_level(),
            batch_auto_flush_size: Self::default_batch_auto_flush_size(),
            warn_connections: false,
            warn_datagrams: false,
        }
    }
}

/// When the activity monitor sends heartbeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcmHeartbeat {
    Off,
    /// Only while the connection is otherwise idle.
    OnIdle,
    /// Only while a dispatch is in progress.
    OnInvocation,
    /// On every tick.
    Always,
}

/// When the activity monitor closes an inactive connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcmClose {
    Off,
    /// Gracefully, once nothing is in flight.
    OnIdle,
    /// Forcefully, when requests are outstanding past the timeout.
    OnInvocation,
    /// `on_invocation`, plus a graceful close when nothing is in flight.
    OnInvocationAndIdle,
    /// Forcefully, regardless of what is in flight.
    OnIdleForceful,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcmSettings {
    #[serde(default = "AcmSettings::default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "AcmSettings::default_heartbeat")]
    pub heartbeat: AcmHeartbeat,

    #[serde(default = "AcmSettings::default_close")]
    pub close: AcmClose,
}

impl AcmSettings {
    fn default_timeout_secs() -> u64 {
        60
    }

    fn default_heartbeat() -> AcmHeartbeat {
        AcmHeartbeat::OnInvocation
    }

    fn default_close() -> AcmClose {
        AcmClose::OnInvocationAndIdle
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Whether the monitor has anything to do for connections using these settings.
    pub fn is_enabled(&self) -> bool {
        self.timeout_secs > 0
            && (self.heartbeat != AcmHeartbeat::Off || self.close != AcmClose::Off)
    }
}

impl Default for AcmSettings {
    fn default() -> Self {
        Self {
            timeout_secs: Self::default_timeout_secs(),
            heartbeat: Self::default_heartbeat(),
            close: Self::default_close(),
        }
    }
}

/// Activity monitoring for outgoing (`client`) and incoming (`server`) connections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcmSection {
    #[serde(default)]
    pub client: AcmSettings,

    #[serde(default)]
    pub server: AcmSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterConfig {
    /// Upper bound on live incoming connections. `0` means unbounded.
    #[serde(default)]
    pub max_connections: usize,

    /// Delay between attempts to (re)start listening after a failure.
    #[serde(default = "AdapterConfig::default_retry_interval_ms")]
    pub retry_interval_ms: u64,
}

impl AdapterConfig {
    fn default_retry_interval_ms() -> u64 {
        1_000
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            max_connections: 0,
            retry_interval_ms: Self::default_retry_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// A simple level (`info`, `debug`, ...) or a full `EnvFilter` directive string.
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,

    /// Emit logs as JSON lines.
    #[serde(default)]
    pub json: bool,

    /// Write to stderr instead of stdout.
    #[serde(default = "LoggingConfig::default_stderr")]
    pub stderr: bool,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_owned()
    }

    fn default_stderr() -> bool {
        true
    }

    pub(crate) fn normalize_level_directives(input: &str) -> String {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Self::default_level();
        }

        match trimmed.to_ascii_lowercase().as_str() {
            "trace" => "trace".to_owned(),
            "debug" => "debug".to_owned(),
            "info" => "info".to_owned(),
            "warn" | "warning" => "warn".to_owned(),
            "error" => "error".to_owned(),
            _ => trimmed.to_owned(),
        }
    }

    fn config_env_filter(&self) -> tracing_subscriber::EnvFilter {
        let directives = Self::normalize_level_directives(&self.level);
        tracing_subscriber::EnvFilter::try_new(directives).unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::default()
                .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
        })
    }

    /// The effective filter: the configured directives, merged with `RUST_LOG` when set.
    pub fn env_filter(&self) -> tracing_subscriber::EnvFilter {
        let env_directives = std::env::var("RUST_LOG")
            .ok()
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty());

        let config_directives = Self::normalize_level_directives(&self.level);

        match env_directives {
            Some(env_directives) => {
                let combined = format!("{config_directives},{env_directives}");
                tracing_subscriber::EnvFilter::try_new(combined)
                    .or_else(|_| tracing_subscriber::EnvFilter::try_new(env_directives))
                    .unwrap_or_else(|_| self.config_env_filter())
            }
            None => self.config_env_filter(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            json: false,
            stderr: Self::default_stderr(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse toml config: {0}")]
    Toml(String),
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        // The default `Display` includes a snippet of the input; keep only the message.
        ConfigError::Toml(err.message().to_owned())
    }
}

impl StrandConfig {
    /// Load a config file from TOML.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::load_from_str(&text)
    }

    pub fn load_from_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Load a config file and report unknown keys and questionable values.
    pub fn load_from_path_with_diagnostics(
        path: impl AsRef<Path>,
    ) -> Result<(Self, ConfigDiagnostics), ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::load_from_str_with_diagnostics(&text)
    }

    pub fn load_from_str_with_diagnostics(
        text: &str,
    ) -> Result<(Self, ConfigDiagnostics), ConfigError> {
        let (config, unknown_keys) =
            diagnostics::deserialize_toml_with_unknown_keys::<StrandConfig>(text)?;
        let diagnostics = ConfigDiagnostics {
            unknown_keys,
            warnings: config.validate(),
        };
        Ok((config, diagnostics))
    }
}

static TRACING_INIT: Once = Once::new();

/// Install the global `tracing` subscriber.
///
/// Safe to call more than once; only the first call has any effect.
pub fn init_tracing(config: &LoggingConfig) {
    TRACING_INIT.call_once(|| {
        use tracing_subscriber::fmt::writer::BoxMakeWriter;
        use tracing_subscriber::layer::SubscriberExt;
        use tracing_subscriber::util::SubscriberInitExt;
        use tracing_subscriber::Layer;

        let writer = if config.stderr {
            // Goes through the test harness' capture in debug builds.
            if cfg!(debug_assertions) {
                BoxMakeWriter::new(tracing_subscriber::fmt::writer::TestWriter::with_stderr)
            } else {
                BoxMakeWriter::new(std::io::stderr)
            }
        } else {
            BoxMakeWriter::new(std::io::stdout)
        };

        let layer: Box<dyn Layer<_> + Send + Sync> = if config.json {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer)
                .with_ansi(false)
                .boxed()
        } else {
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .boxed()
        };

        // Another subscriber may already be installed (e.g. by a host application).
        let _ = tracing_subscriber::registry()
            .with(config.env_filter())
            .with(layer)
            .try_init();
    });
}
