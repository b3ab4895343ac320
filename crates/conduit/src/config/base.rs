use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use etcetera::{choose_app_strategy, AppStrategy, AppStrategyArgs};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

const APP_NAME: &str = "conduit";
const ENV_PREFIX: &str = "CONDUIT";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration value not found: {0}")]
    NotFound(String),
    #[error("Failed to deserialize value: {0}")]
    DeserializeError(String),
    #[error("Failed to read config file: {0}")]
    FileError(#[from] std::io::Error),
    #[error("Failed to locate config directory: {0}")]
    DirectoryError(String),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        ConfigError::DeserializeError(err.to_string())
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        ConfigError::DeserializeError(err.to_string())
    }
}

fn app_strategy() -> AppStrategyArgs {
    AppStrategyArgs {
        top_level_domain: "dev".to_string(),
        author: "conduit".to_string(),
        app_name: APP_NAME.to_string(),
    }
}

/// Platform config directory, e.g. `~/.config/conduit` on Linux.
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    choose_app_strategy(app_strategy())
        .map(|strategy| strategy.config_dir())
        .map_err(|e| ConfigError::DirectoryError(e.to_string()))
}

/// Platform data directory, e.g. `~/.local/share/conduit` on Linux.
pub fn data_dir() -> Result<PathBuf, ConfigError> {
    choose_app_strategy(app_strategy())
        .map(|strategy| strategy.data_dir())
        .map_err(|e| ConfigError::DirectoryError(e.to_string()))
}

/// Layered configuration: built-in defaults, then `config.yaml`, then
/// `CONDUIT_*` environment variables.
///
/// Every leaf key can be overridden from the environment. The variable name is
/// the dotted key upper-cased with dots turned into underscores, so
/// `limits.max_turns` is read from `CONDUIT_LIMITS_MAX_TURNS`. Values are
/// parsed as JSON first and fall back to plain strings.
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    pub fn new(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
        }
    }

    /// Uses `config.yaml` in the platform config directory.
    pub fn from_default_location() -> Result<Self, ConfigError> {
        Ok(Self::new(config_dir()?.join("config.yaml")))
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Reads the YAML file as JSON. A missing file is an empty document.
    pub fn read_document(&self) -> Result<Value, ConfigError> {
        if !self.config_path.exists() {
            return Ok(Value::Object(Map::new()));
        }
        let content = fs::read_to_string(&self.config_path)?;
        if content.trim().is_empty() {
            return Ok(Value::Object(Map::new()));
        }
        let yaml: serde_yaml::Value = serde_yaml::from_str(&content)?;
        let json = serde_json::to_value(yaml)?;
        match json {
            Value::Object(_) => Ok(json),
            _ => Err(ConfigError::DeserializeError(format!(
                "{} must contain a mapping at the top level",
                self.config_path.display()
            ))),
        }
    }

    /// Resolves `T` from `defaults`, the file and the environment, in that
    /// order of increasing precedence.
    pub fn load<T>(&self, defaults: &T) -> Result<T, ConfigError>
    where
        T: Serialize + DeserializeOwned,
    {
        let mut merged = serde_json::to_value(defaults)?;
        merge(&mut merged, self.read_document()?);
        apply_env_overrides(&mut merged, &mut Vec::new());
        Ok(serde_json::from_value(merged)?)
    }

    /// Looks up one dotted key, environment first.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T, ConfigError> {
        if let Some(value) = env_value(&env_key(key.split('.'))) {
            return Ok(serde_json::from_value(value)?);
        }
        let document = self.read_document()?;
        let value = key
            .split('.')
            .try_fold(&document, |node, part| node.get(part))
            .ok_or_else(|| ConfigError::NotFound(key.to_string()))?;
        Ok(serde_json::from_value(value.clone())?)
    }
}

fn merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(slot) => merge(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

fn apply_env_overrides(node: &mut Value, path: &mut Vec<String>) {
    if let Value::Object(map) = node {
        for (key, child) in map.iter_mut() {
            path.push(key.clone());
            apply_env_overrides(child, path);
            path.pop();
        }
        return;
    }
    let key = env_key(path.iter().map(String::as_str));
    if let Ok(raw) = env::var(&key) {
        // String-typed and unset optional keys keep the raw text so `"0123"`
        // stays a string.
        *node = if node.is_string() || node.is_null() {
            Value::String(raw)
        } else {
            parse_env(raw)
        };
    }
}

fn env_key<'a>(parts: impl Iterator<Item = &'a str>) -> String {
    let mut key = ENV_PREFIX.to_string();
    for part in parts {
        key.push('_');
        key.push_str(&part.to_uppercase());
    }
    key
}

fn env_value(key: &str) -> Option<Value> {
    env::var(key).ok().map(parse_env)
}

fn parse_env(raw: String) -> Value {
    serde_json::from_str(&raw).unwrap_or(Value::String(raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serial_test::serial;
    use tempfile::TempDir;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sample {
        name: String,
        nested: Nested,
    }

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Nested {
        count: u32,
        flag: bool,
    }

    fn defaults() -> Sample {
        Sample {
            name: "default".to_string(),
            nested: Nested {
                count: 1,
                flag: false,
            },
        }
    }

    #[test]
    #[serial]
    fn test_missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let manager = ConfigManager::new(dir.path().join("config.yaml"));
        assert_eq!(manager.load(&defaults()).unwrap(), defaults());
    }

    #[test]
    #[serial]
    fn test_file_values_merge_over_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "nested:\n  count: 7\n").unwrap();

        let loaded = ConfigManager::new(&path).load(&defaults()).unwrap();
        assert_eq!(loaded.name, "default");
        assert_eq!(loaded.nested.count, 7);
        assert!(!loaded.nested.flag);
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "name: from-file\nnested:\n  count: 7\n").unwrap();

        temp_env::with_vars(
            [
                ("CONDUIT_NAME", Some("from-env")),
                ("CONDUIT_NESTED_FLAG", Some("true")),
            ],
            || {
                let loaded = ConfigManager::new(&path).load(&defaults()).unwrap();
                assert_eq!(loaded.name, "from-env");
                assert_eq!(loaded.nested.count, 7);
                assert!(loaded.nested.flag);
            },
        );
    }

    #[test]
    #[serial]
    fn test_get_reads_dotted_keys() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "nested:\n  count: 3\n").unwrap();
        let manager = ConfigManager::new(&path);

        let count: u32 = manager.get("nested.count").unwrap();
        assert_eq!(count, 3);
        assert!(matches!(
            manager.get::<u32>("nested.missing"),
            Err(ConfigError::NotFound(_))
        ));
    }

    #[test]
    #[serial]
    fn test_non_mapping_document_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "- just\n- a list\n").unwrap();
        assert!(ConfigManager::new(&path).read_document().is_err());
    }
}
