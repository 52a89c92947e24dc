//! Configuration management for the command layer.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use vmmd_hypervisor::{platform_arch, ParserOptions};

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Command dispatch configuration
    pub commands: CommandsConfig,
    /// Descriptor parsing defaults
    pub descriptor: DescriptorConfig,
    /// Node polling configuration
    pub nodes: NodesConfig,
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_yaml_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content)?;
        Ok(config)
    }

    /// Defaults handed to the descriptor parser.
    pub fn parser_options(&self) -> ParserOptions {
        let arch = self
            .descriptor
            .default_arch
            .clone()
            .unwrap_or_else(platform_arch);
        let keymap = self
            .descriptor
            .keymap
            .clone()
            .unwrap_or_else(vmmd_common::default_keymap);
        ParserOptions::new(arch, keymap)
    }

    /// Per-command time bound, `None` when disabled.
    pub fn command_timeout(&self) -> Option<Duration> {
        match self.commands.timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

/// Command dispatch configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CommandsConfig {
    /// Upper bound for one command in seconds; 0 disables it
    pub timeout_secs: u64,
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self { timeout_secs: 30 }
    }
}

/// Descriptor parsing defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DescriptorConfig {
    /// Architecture for descriptors without `os/type@arch`
    pub default_arch: Option<String>,
    /// Keymap for graphics devices without `@keymap`
    pub keymap: Option<String>,
}

/// Node polling configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodesConfig {
    /// Initial polling interval of newly added nodes
    pub poll_interval_ms: u64,
}

impl Default for NodesConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 15_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.command_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.nodes.poll_interval_ms, 15_000);

        let options = config.parser_options();
        assert_eq!(options.default_arch, platform_arch());
        assert!(!options.default_keymap.is_empty());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = Config::from_yaml_str(
            r#"
descriptor:
  keymap: fr
"#,
        )
        .unwrap();

        assert_eq!(config.commands.timeout_secs, 30);
        assert_eq!(config.parser_options().default_keymap, "fr");
    }

    #[test]
    fn test_zero_timeout_disables_bound() {
        let config = Config::from_yaml_str("commands:\n  timeout_secs: 0\n").unwrap();
        assert_eq!(config.command_timeout(), None);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "commands:\n  timeout_secs: 5\ndescriptor:\n  default_arch: aarch64\n  keymap: de\nnodes:\n  poll_interval_ms: 2500"
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.command_timeout(), Some(Duration::from_secs(5)));
        assert_eq!(config.parser_options(), ParserOptions::new("aarch64", "de"));
        assert_eq!(config.nodes.poll_interval_ms, 2500);
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load("/nonexistent/vmmd.yaml").unwrap_err();
        assert!(err.to_string().contains("Config file not found"));
    }

    #[test]
    fn test_load_invalid_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "commands: [not, a, map]").unwrap();
        assert!(Config::load(file.path()).is_err());
    }
}
