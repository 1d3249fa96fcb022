use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use toml::Value;

pub const DEFAULT_CONFIG_FILE_NAME: &str = "gearwire.toml";
pub const CONFIG_PATH_ARG: &str = "--config";

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub server: ServerConfig,
    pub wire: WireConfig,
    pub submit: SubmitConfig,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: String,
    pub human_friendly: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            human_friendly: false,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: 4730,
            connect_timeout_ms: 5_000,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct WireConfig {
    pub max_packet_body_bytes: usize,
    pub read_chunk_bytes: usize,
    pub poll_interval_ms: u64,
}

impl Default for WireConfig {
    fn default() -> Self {
        Self {
            max_packet_body_bytes: 8 * 1024 * 1024,
            read_chunk_bytes: 64 * 1024,
            poll_interval_ms: 10,
        }
    }
}

/// The task the command-line submitter sends. `unique` follows the Gearman
/// convention: empty means no de-duplication, `-` derives the key from the
/// payload, anything else is used as the key itself.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct SubmitConfig {
    pub function: String,
    pub payload: String,
    pub priority: String,
    pub background: bool,
    pub retries: u32,
    pub unique: String,
    pub timeout_ms: u64,
}

impl Default for SubmitConfig {
    fn default() -> Self {
        Self {
            function: String::new(),
            payload: String::new(),
            priority: "normal".to_owned(),
            background: false,
            retries: 0,
            unique: String::new(),
            timeout_ms: 60_000,
        }
    }
}

impl AppConfig {
    /// Resolves the config source from argv: an explicit `--config <path>`,
    /// then `./gearwire.toml`, then built-in defaults. Remaining arguments are
    /// applied as `--section.key value` overrides.
    pub fn load_with_discovery(args: impl IntoIterator<Item = String>) -> Result<Self, ConfigError> {
        let mut args: Vec<String> = args.into_iter().collect();

        let explicit_path = match args.iter().position(|arg| arg == CONFIG_PATH_ARG) {
            Some(index) => {
                if index + 1 >= args.len() {
                    return Err(ConfigError::MissingValueForArg {
                        key: "config".to_owned(),
                    });
                }
                let path = args.remove(index + 1);
                args.remove(index);
                Some(PathBuf::from(path))
            }
            None => None,
        };

        if let Some(path) = explicit_path {
            return Self::load_from_toml_with_args(path, args);
        }

        let local = PathBuf::from(DEFAULT_CONFIG_FILE_NAME);
        if local.is_file() {
            return Self::load_from_toml_with_args(local, args);
        }

        Self::load_defaults_with_args(args)
    }

    pub fn load_from_toml_with_args(
        path: impl AsRef<Path>,
        args: impl IntoIterator<Item = String>,
    ) -> Result<Self, ConfigError> {
        let toml_content = fs::read_to_string(path.as_ref()).map_err(|source| ConfigError::Io {
            path: path.as_ref().to_string_lossy().to_string(),
            source,
        })?;

        let file_value: Value = toml_content
            .parse()
            .map_err(|source| ConfigError::TomlParse {
                path: path.as_ref().to_string_lossy().to_string(),
                source,
            })?;

        let mut root_value = defaults_value()?;
        merge_values(&mut root_value, file_value);
        Self::finish(root_value, args)
    }

    pub fn load_defaults_with_args(args: impl IntoIterator<Item = String>) -> Result<Self, ConfigError> {
        Self::finish(defaults_value()?, args)
    }

    fn finish(mut root_value: Value, args: impl IntoIterator<Item = String>) -> Result<Self, ConfigError> {
        let overrides = parse_cli_overrides(args)?;
        for (key_path, raw_value) in overrides {
            apply_override(&mut root_value, &key_path, &raw_value)?;
        }

        root_value.try_into().map_err(ConfigError::Deserialize)
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io {
        path: String,
        source: std::io::Error,
    },
    TomlParse {
        path: String,
        source: toml::de::Error,
    },
    SerializeDefaults(toml::ser::Error),
    Deserialize(toml::de::Error),
    MissingValueForArg {
        key: String,
    },
    InvalidArgFormat {
        arg: String,
    },
    InvalidPath {
        key: String,
    },
    UnknownPath {
        key: String,
    },
    UnsupportedOverrideType {
        key: String,
    },
    InvalidValueForType {
        key: String,
        expected: &'static str,
        value: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "failed to read config file '{path}': {source}")
            }
            Self::TomlParse { path, source } => {
                write!(f, "failed to parse TOML config '{path}': {source}")
            }
            Self::SerializeDefaults(source) => {
                write!(f, "failed to build default config: {source}")
            }
            Self::Deserialize(source) => write!(f, "failed to deserialize config: {source}"),
            Self::MissingValueForArg { key } => {
                write!(f, "missing value for CLI override '--{key}'")
            }
            Self::InvalidArgFormat { arg } => write!(
                f,
                "invalid CLI argument format '{arg}', expected '--section.key value'"
            ),
            Self::InvalidPath { key } => write!(f, "invalid override key path '{key}'"),
            Self::UnknownPath { key } => write!(f, "unknown override key path '{key}'"),
            Self::UnsupportedOverrideType { key } => {
                write!(f, "override not supported for complex TOML type at '{key}'")
            }
            Self::InvalidValueForType {
                key,
                expected,
                value,
            } => write!(
                f,
                "invalid value '{value}' for '{key}', expected type {expected}"
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

fn defaults_value() -> Result<Value, ConfigError> {
    Value::try_from(AppConfig::default()).map_err(ConfigError::SerializeDefaults)
}

// File values win over defaults; tables merge key by key so a file may set
// only the sections it cares about.
fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Table(base_table), Value::Table(overlay_table)) => {
            for (key, value) in overlay_table {
                match base_table.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base_table.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

fn parse_cli_overrides(args: impl IntoIterator<Item = String>) -> Result<Vec<(String, String)>, ConfigError> {
    let mut parsed = Vec::new();
    let mut iter = args.into_iter();

    while let Some(arg) = iter.next() {
        let Some(stripped) = arg.strip_prefix("--") else {
            return Err(ConfigError::InvalidArgFormat { arg });
        };

        if stripped.is_empty() {
            return Err(ConfigError::InvalidArgFormat { arg });
        }

        let value = iter.next().ok_or_else(|| ConfigError::MissingValueForArg {
            key: stripped.to_owned(),
        })?;

        parsed.push((stripped.to_owned(), value));
    }

    Ok(parsed)
}

fn apply_override(root: &mut Value, key_path: &str, raw_value: &str) -> Result<(), ConfigError> {
    let parts: Vec<&str> = key_path.split('.').collect();
    if parts.iter().any(|part| part.is_empty()) {
        return Err(ConfigError::InvalidPath {
            key: key_path.to_owned(),
        });
    }

    let unknown = || ConfigError::UnknownPath {
        key: key_path.to_owned(),
    };

    let mut current = root;
    for section in &parts[..parts.len() - 1] {
        current = current
            .as_table_mut()
            .ok_or_else(unknown)?
            .get_mut(*section)
            .ok_or_else(unknown)?;
    }

    let final_key = parts[parts.len() - 1];
    let current_value = current
        .as_table_mut()
        .ok_or_else(unknown)?
        .get_mut(final_key)
        .ok_or_else(unknown)?;

    *current_value = parse_value_using_current_type(key_path, raw_value, current_value)?;
    Ok(())
}

fn parse_value_using_current_type(
    key_path: &str,
    raw_value: &str,
    current_value: &Value,
) -> Result<Value, ConfigError> {
    let invalid = |expected: &'static str| ConfigError::InvalidValueForType {
        key: key_path.to_owned(),
        expected,
        value: raw_value.to_owned(),
    };

    match current_value {
        Value::String(_) => Ok(Value::String(raw_value.to_owned())),
        Value::Integer(_) => raw_value
            .parse::<i64>()
            .map(Value::Integer)
            .map_err(|_| invalid("integer")),
        Value::Float(_) => raw_value
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|_| invalid("float")),
        Value::Boolean(_) => raw_value
            .parse::<bool>()
            .map(Value::Boolean)
            .map_err(|_| invalid("boolean")),
        Value::Datetime(_) | Value::Array(_) | Value::Table(_) => {
            Err(ConfigError::UnsupportedOverrideType {
                key: key_path.to_owned(),
            })
        }
    }
}
