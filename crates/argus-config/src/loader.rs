//! Layered configuration loading.
//!
//! Layers are merged as JSON trees, so a file that names one field of a
//! section keeps the defaults of every other field.

use std::env;
use std::fs;
use std::path::Path;

use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{ConfigError, ConfigResult};
use crate::schema::ArgusConfig;

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "ARGUS";

/// Configuration loader with layered approach.
///
/// Later layers override earlier ones:
/// 1. default values
/// 2. a TOML or JSON file
/// 3. environment variables `ARGUS__SECTION__KEY`
///
/// ```no_run
/// use argus_config::ConfigLoader;
///
/// # fn main() -> Result<(), argus_config::ConfigError> {
/// let config = ConfigLoader::new()
///     .with_dotenv()
///     .with_optional_file("argus.toml")?
///     .with_env_prefix("ARGUS")
///     .load()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct ConfigLoader {
    tree: Value,
    env_prefix: Option<String>,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    /// Create a loader holding the default configuration.
    pub fn new() -> Self {
        Self {
            tree: serde_json::to_value(ArgusConfig::default()).unwrap_or_else(|_| Value::Object(Map::new())),
            env_prefix: None,
        }
    }

    /// Merge a configuration file. The format follows the extension,
    /// `.toml` or `.json`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file is missing, unreadable or not valid
    /// TOML/JSON.
    pub fn with_file<P: AsRef<Path>>(self, path: P) -> ConfigResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::file_not_found(path));
        }
        let content = fs::read_to_string(path).map_err(|e| ConfigError::read_error(path, e))?;

        let format = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase)
            .ok_or_else(|| {
                ConfigError::validation_error(format!(
                    "unsupported configuration file format: {}",
                    path.display()
                ))
            })?;
        debug!(path = %path.display(), "configuration file loaded");
        self.with_string(&content, &format)
    }

    /// Merge a configuration file if it exists.
    ///
    /// # Errors
    ///
    /// Same as [`with_file`](Self::with_file) for an existing file.
    pub fn with_optional_file<P: AsRef<Path>>(self, path: P) -> ConfigResult<Self> {
        if path.as_ref().exists() {
            self.with_file(path)
        } else {
            Ok(self)
        }
    }

    /// Merge configuration text in `format` (`toml` or `json`).
    ///
    /// ```
    /// use argus_config::ConfigLoader;
    ///
    /// let config = ConfigLoader::new()
    ///     .with_string("[server]\nbind = \"127.0.0.1:3000\"", "toml")
    ///     .unwrap()
    ///     .load()
    ///     .unwrap();
    ///
    /// assert_eq!(config.server.bind, "127.0.0.1:3000");
    /// assert_eq!(config.server.ws_path, "/api/ws");
    /// ```
    pub fn with_string(mut self, content: &str, format: &str) -> ConfigResult<Self> {
        let layer = match format.to_lowercase().as_str() {
            "toml" => serde_json::to_value(toml::from_str::<toml::Value>(content)?)?,
            "json" => serde_json::from_str(content)?,
            _ => {
                return Err(ConfigError::validation_error(format!(
                    "unsupported configuration format: {format}"
                )))
            }
        };
        if !layer.is_object() {
            return Err(ConfigError::validation_error("configuration root must be a table"));
        }
        merge(&mut self.tree, layer);
        Ok(self)
    }

    /// Read overrides from variables named `PREFIX__SECTION__KEY` when
    /// [`load`](Self::load) runs.
    pub fn with_env_prefix(mut self, prefix: &str) -> Self {
        self.env_prefix = Some(prefix.to_uppercase());
        self
    }

    /// Load a `.env` file into the process environment, if there is one.
    pub fn with_dotenv(self) -> Self {
        match dotenvy::dotenv() {
            Ok(path) => debug!(path = %path.display(), ".env loaded"),
            Err(e) if e.not_found() => {}
            Err(e) => tracing::warn!(error = %e, ".env not loaded"),
        }
        self
    }

    /// Apply overrides from an explicit list of variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::EnvParseError` for a malformed key or value.
    pub fn with_env_vars<I, K, V>(mut self, prefix: &str, vars: I) -> ConfigResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let marker = format!("{}__", prefix.to_uppercase());
        for (key, value) in vars {
            let key = key.as_ref();
            let Some(rest) = key.strip_prefix(&marker) else {
                continue;
            };
            self.apply_override(key, rest, value.as_ref())?;
        }
        Ok(self)
    }

    /// Apply environment overrides and validate.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` for a bad override, an unknown or mistyped
    /// field, or a failed validation.
    pub fn load(self) -> ConfigResult<ArgusConfig> {
        let config = self.load_unvalidated()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides without validating.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` for a bad override or an unknown or mistyped
    /// field.
    pub fn load_unvalidated(mut self) -> ConfigResult<ArgusConfig> {
        if let Some(prefix) = self.env_prefix.take() {
            self = self.with_env_vars(&prefix, env::vars())?;
        }
        Ok(serde_json::from_value(self.tree)?)
    }

    fn apply_override(&mut self, var: &str, key: &str, raw: &str) -> ConfigResult<()> {
        let path: Vec<String> = key.split("__").map(str::to_lowercase).collect();
        if path.iter().any(String::is_empty) {
            return Err(ConfigError::env_parse_error(var, "empty key segment"));
        }

        let (leaf, parents) = path
            .split_last()
            .ok_or_else(|| ConfigError::env_parse_error(var, "missing key"))?;
        let mut node = &mut self.tree;
        for segment in parents {
            let Value::Object(map) = node else {
                return Err(ConfigError::env_parse_error(var, format!("'{segment}' is not a section")));
            };
            node = map
                .entry(segment.clone())
                .or_insert_with(|| Value::Object(Map::new()));
        }
        let Value::Object(map) = node else {
            return Err(ConfigError::env_parse_error(var, "parent is not a section"));
        };

        let value = typed_value(map.get(leaf.as_str()), raw)
            .ok_or_else(|| ConfigError::env_parse_error(var, format!("cannot parse '{raw}'")))?;
        debug!(var, "environment override applied");
        map.insert(leaf.clone(), value);
        Ok(())
    }
}

/// Interprets `raw` with the type of the value it replaces.
fn typed_value(current: Option<&Value>, raw: &str) -> Option<Value> {
    match current {
        Some(Value::String(_)) => Some(Value::String(raw.to_string())),
        Some(Value::Array(_)) => serde_json::from_str::<Value>(raw)
            .ok()
            .filter(Value::is_array)
            .or_else(|| {
                Some(Value::Array(
                    raw.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(|s| Value::String(s.to_string()))
                        .collect(),
                ))
            }),
        Some(Value::Bool(_) | Value::Number(_) | Value::Object(_)) => serde_json::from_str(raw).ok(),
        Some(Value::Null) | None => {
            Some(serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string())))
        }
    }
}

/// Deep-merges `layer` into `base`. Tables merge key by key; anything else
/// replaces.
fn merge(base: &mut Value, layer: Value) {
    match (base, layer) {
        (Value::Object(base), Value::Object(layer)) => {
            for (key, value) in layer {
                match base.get_mut(&key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, layer) => *base = layer,
    }
}
