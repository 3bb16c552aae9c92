//! Configuration loading.
//!
//! Values are layered: type defaults, then `<config_dir>/<name>.json`, then
//! environment variables named `<PREFIX>_<NAME>_<FIELD>`. Environment values
//! are parsed as JSON when possible and taken as plain strings otherwise.

use crate::{HdError, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Configuration manager for handling multiple configuration sources
pub struct ConfigManager {
    config_dir: PathBuf,
    environment_prefix: String,
}

impl ConfigManager {
    pub fn new(config_dir: PathBuf, environment_prefix: &str) -> Self {
        Self {
            config_dir,
            environment_prefix: environment_prefix.to_uppercase(),
        }
    }

    /// Load configuration from defaults, file, and environment, in that order
    pub fn load_config<T>(&self, config_name: &str) -> Result<T>
    where
        T: DeserializeOwned + Serialize + Default,
    {
        let mut config_value = serde_json::to_value(T::default())?;

        let config_file_path = self.config_path(config_name);
        if config_file_path.exists() {
            log::debug!("Loading configuration file {:?}", config_file_path);
            merge_values(&mut config_value, self.load_from_file(&config_file_path)?);
        }

        merge_values(&mut config_value, self.load_from_environment(config_name));

        serde_json::from_value(config_value)
            .map_err(|e| HdError::Config(format!("Invalid '{}' configuration: {}", config_name, e)))
    }

    pub fn save_config<T: Serialize>(&self, config_name: &str, config: &T) -> Result<()> {
        if !self.config_dir.exists() {
            fs::create_dir_all(&self.config_dir)?;
        }

        let config_file_path = self.config_path(config_name);
        fs::write(&config_file_path, serde_json::to_string_pretty(config)?)?;

        log::info!("Configuration '{}' saved to {:?}", config_name, config_file_path);
        Ok(())
    }

    pub fn config_exists(&self, config_name: &str) -> bool {
        self.config_path(config_name).exists()
    }

    pub fn delete_config(&self, config_name: &str) -> Result<()> {
        let config_file_path = self.config_path(config_name);
        if config_file_path.exists() {
            fs::remove_file(&config_file_path)?;
            log::info!("Configuration '{}' deleted", config_name);
        }
        Ok(())
    }

    fn config_path(&self, config_name: &str) -> PathBuf {
        self.config_dir.join(format!("{}.json", config_name))
    }

    fn load_from_file(&self, file_path: &Path) -> Result<serde_json::Value> {
        let content = fs::read_to_string(file_path)?;
        serde_json::from_str(&content)
            .map_err(|e| HdError::Config(format!("Failed to parse {:?}: {}", file_path, e)))
    }

    fn load_from_environment(&self, config_name: &str) -> serde_json::Value {
        let prefix = format!("{}_{}_", self.environment_prefix, config_name.to_uppercase());
        let mut env_config = serde_json::Map::new();

        for (key, value) in env::vars() {
            if let Some(field) = key.strip_prefix(&prefix) {
                let parsed_value = serde_json::from_str(&value)
                    .unwrap_or(serde_json::Value::String(value));
                env_config.insert(field.to_lowercase(), parsed_value);
            }
        }

        serde_json::Value::Object(env_config)
    }
}

fn merge_values(base: &mut serde_json::Value, overlay: serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                base_map.insert(key, value);
            }
        }
        (base, overlay) => *base = overlay,
    }
}
