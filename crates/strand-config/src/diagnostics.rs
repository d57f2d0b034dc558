use serde::de::DeserializeOwned;

/// Diagnostics produced while loading a strand config.
///
/// Loading is best effort: callers get a `StrandConfig` whenever deserialization succeeds, plus
/// whatever was found to be suspicious along the way.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigDiagnostics {
    /// Keys present in the input that the schema does not know about, as dotted paths
    /// (`adapter.public.max_conections`).
    pub unknown_keys: Vec<String>,
    /// Values that were accepted but adjusted or are likely mistakes.
    pub warnings: Vec<ConfigWarning>,
}

impl ConfigDiagnostics {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.unknown_keys.is_empty() && self.warnings.is_empty()
    }
}

#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    InvalidValue {
        toml_path: String,
        message: String,
    },
    CompressionLevelClamped {
        configured: i32,
        effective: i32,
    },
    LoggingLevelInvalid {
        value: String,
        normalized: String,
    },
}

pub(crate) fn deserialize_toml_with_unknown_keys<T: DeserializeOwned>(
    text: &str,
) -> Result<(T, Vec<String>), toml::de::Error> {
    let mut unknown = Vec::<String>::new();
    let deserializer = toml::de::Deserializer::new(text);
    let value = serde_ignored::deserialize(deserializer, |path| {
        unknown.push(path.to_string().trim_start_matches('.').to_owned());
    })?;
    unknown.sort();
    unknown.dedup();
    Ok((value, unknown))
}
