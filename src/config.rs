//! Configuration management for craftrack.
//!
//! This module defines the structure of the `craftrack.toml` configuration file
//! and provides functionality to load and parse it.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

pub const DEFAULT_CONFIG_FILE: &str = "craftrack.toml";
pub const DEFAULT_DATA_DIR: &str = ".craftrack";
pub const DEFAULT_MEMORY_MB: u32 = 2048;
const RULES_FILE: &str = "logs.dict";
const INSTANCES_FILE: &str = "servers.json";

/// Top-level configuration structure corresponding to `craftrack.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Directory holding the rule file and the instance store.
    pub data_dir: Option<String>,
    /// Default Java runtime for instances without their own.
    pub java_path: Option<String>,
    /// Heap size in MB for newly added instances.
    pub default_memory: Option<u32>,
    /// Translation rule file (default: `<data_dir>/logs.dict`).
    pub rules_file: Option<String>,
    /// Instance store (default: `<data_dir>/servers.json`).
    pub instances_file: Option<String>,
    /// Whether to strip ANSI escapes before translating (default: false).
    pub strip_ansi: Option<bool>,
    /// Whether to prepend elapsed time to output lines (default: false).
    pub timestamp: Option<bool>,
    /// Whether to reload rules when the rule file changes (default: true).
    pub watch_rules: Option<bool>,
    /// Milliseconds to wait after an interrupt before killing (default: 0, never).
    pub stop_grace_ms: Option<u64>,
    /// Editor command for `rules edit`.
    pub editor: Option<String>,
}

impl Config {
    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(self.data_dir.as_deref().unwrap_or(DEFAULT_DATA_DIR))
    }

    pub fn rules_path(&self) -> PathBuf {
        self.rules_file
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.data_dir().join(RULES_FILE))
    }

    pub fn instances_path(&self) -> PathBuf {
        self.instances_file
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.data_dir().join(INSTANCES_FILE))
    }

    pub fn default_runtime(&self) -> Option<PathBuf> {
        self.java_path
            .as_deref()
            .map(str::trim)
            .filter(|path| !path.is_empty())
            .map(PathBuf::from)
    }

    pub fn default_memory(&self) -> u32 {
        self.default_memory.unwrap_or(DEFAULT_MEMORY_MB)
    }
}

/// Loads and parses the configuration from a file path.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: Config = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_optional_fields() {
        let raw = r#"
data_dir = "/var/lib/craftrack"
java_path = "/usr/lib/jvm/java-17/bin/java"
default_memory = 4096
strip_ansi = false
timestamp = true
watch_rules = false
stop_grace_ms = 30000
editor = "vim"
"#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.data_dir(), PathBuf::from("/var/lib/craftrack"));
        assert_eq!(
            config.default_runtime(),
            Some(PathBuf::from("/usr/lib/jvm/java-17/bin/java"))
        );
        assert_eq!(config.default_memory(), 4096);
        assert_eq!(config.strip_ansi, Some(false));
        assert_eq!(config.timestamp, Some(true));
        assert_eq!(config.watch_rules, Some(false));
        assert_eq!(config.stop_grace_ms, Some(30000));
        assert_eq!(config.editor.as_deref(), Some("vim"));
        assert_eq!(
            config.rules_path(),
            PathBuf::from("/var/lib/craftrack/logs.dict")
        );
        assert_eq!(
            config.instances_path(),
            PathBuf::from("/var/lib/craftrack/servers.json")
        );
    }

    #[test]
    fn defaults_apply_to_empty_file() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.data_dir(), PathBuf::from(".craftrack"));
        assert_eq!(config.rules_path(), PathBuf::from(".craftrack/logs.dict"));
        assert_eq!(config.default_memory(), DEFAULT_MEMORY_MB);
        assert_eq!(config.default_runtime(), None);
    }

    #[test]
    fn explicit_files_override_data_dir_and_blank_java_is_unset() {
        let raw = r#"
rules_file = "rules.txt"
instances_file = "servers.json"
java_path = "  "
"#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.rules_path(), PathBuf::from("rules.txt"));
        assert_eq!(config.instances_path(), PathBuf::from("servers.json"));
        assert_eq!(config.default_runtime(), None);
    }
}
