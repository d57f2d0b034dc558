use crate::diagnostics::ConfigWarning;
use crate::{AcmClose, AcmHeartbeat, AcmSettings, LoggingConfig, StrandConfig, MIN_MESSAGE_SIZE};

impl StrandConfig {
    /// Check semantic constraints that deserialization cannot express.
    ///
    /// Nothing here is fatal: every reported value has a well-defined effective behavior.
    #[must_use]
    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut out = Vec::new();

        validate_connection(self, &mut out);
        validate_acm("acm.client", &self.acm.client, &mut out);
        validate_acm("acm.server", &self.acm.server, &mut out);
        validate_adapters(self, &mut out);
        validate_logging(&self.logging, &mut out);

        out
    }
}

fn validate_connection(config: &StrandConfig, out: &mut Vec<ConfigWarning>) {
    let connection = &config.connection;

    if connection.message_size_max < MIN_MESSAGE_SIZE {
        out.push(ConfigWarning::InvalidValue {
            toml_path: "connection.message_size_max".to_string(),
            message: format!("must be >= {MIN_MESSAGE_SIZE} (the header size)"),
        });
    }

    let effective = connection.effective_compression_level();
    if effective != connection.compression_level {
        out.push(ConfigWarning::CompressionLevelClamped {
            configured: connection.compression_level,
            effective,
        });
    }
}

fn validate_acm(path: &str, settings: &AcmSettings, out: &mut Vec<ConfigWarning>) {
    if settings.timeout_secs == 0
        && (settings.heartbeat != AcmHeartbeat::Off || settings.close != AcmClose::Off)
    {
        out.push(ConfigWarning::InvalidValue {
            toml_path: format!("{path}.timeout_secs"),
            message: "0 disables activity monitoring; heartbeat and close modes are ignored"
                .to_string(),
        });
    }
}

fn validate_adapters(config: &StrandConfig, out: &mut Vec<ConfigWarning>) {
    for (name, adapter) in &config.adapter {
        if adapter.retry_interval_ms == 0 {
            out.push(ConfigWarning::InvalidValue {
                toml_path: format!("adapter.{name}.retry_interval_ms"),
                message: "must be >= 1".to_string(),
            });
        }
    }
}

fn validate_logging(logging: &LoggingConfig, out: &mut Vec<ConfigWarning>) {
    let normalized = LoggingConfig::normalize_level_directives(&logging.level);
    if !logging.level.trim().is_empty()
        && tracing_subscriber::EnvFilter::try_new(normalized.clone()).is_err()
    {
        out.push(ConfigWarning::LoggingLevelInvalid {
            value: logging.level.clone(),
            normalized,
        });
    }
}
