//! Configuration for the bulk-usb tool

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use transport::UsbSettings;

/// Tool configuration, read from TOML
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CliConfig {
    #[serde(default)]
    pub logging: LoggingSettings,
    #[serde(default)]
    pub usb: UsbSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "LoggingSettings::default_level")]
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
        }
    }
}

impl LoggingSettings {
    fn default_level() -> String {
        "warn".to_string()
    }
}

/// Machine-wide settings, consulted when the user has no file of their own
const SYSTEM_CONFIG: &str = "/etc/bulk-usb/config.toml";

impl CliConfig {
    /// Read and validate the TOML file at `path`
    ///
    /// Without a path, the per-user file wins over the machine-wide one.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let path = match path {
            Some(path) => path,
            None => Self::discover().ok_or_else(|| {
                anyhow!("neither {} nor {} exists", Self::default_path().display(), SYSTEM_CONFIG)
            })?,
        };

        let text = fs::read_to_string(&path)
            .with_context(|| format!("Cannot read {}", path.display()))?;
        let config: CliConfig =
            toml::from_str(&text).with_context(|| format!("Invalid TOML in {}", path.display()))?;
        config.validate()?;

        tracing::debug!("Using settings from {}", path.display());
        Ok(config)
    }

    /// First existing file among the per-user and machine-wide locations
    fn discover() -> Option<PathBuf> {
        let user = Self::default_path();
        if user.is_file() {
            return Some(user);
        }

        let system = PathBuf::from(SYSTEM_CONFIG);
        if system.is_file() {
            tracing::debug!("No per-user settings, falling back to {}", SYSTEM_CONFIG);
            return Some(system);
        }
        None
    }

    /// Like [`CliConfig::load`], but a missing or broken file yields built-in settings
    pub fn load_or_default() -> Self {
        Self::load(None).unwrap_or_else(|e| {
            tracing::debug!("Built-in settings in effect ({:#})", e);
            Self::default()
        })
    }

    /// Write these settings as TOML, creating parent directories as needed
    pub fn save(&self, path: &Path) -> Result<()> {
        let text = toml::to_string_pretty(self).context("Cannot encode settings as TOML")?;

        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(dir).with_context(|| format!("Cannot create {}", dir.display()))?;
        }
        fs::write(path, text).with_context(|| format!("Cannot write {}", path.display()))?;

        tracing::info!("Settings written to {}", path.display());
        Ok(())
    }

    /// Per-user settings file, `bulk-usb/config.toml` under the platform config dir
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join("bulk-usb")
            .join("config.toml")
    }

    /// Add allow-list entries given on the command line, skipping duplicates
    pub fn merge_allowed(&mut self, extra: &[String]) -> Result<()> {
        for entry in extra {
            let id: transport::UsbId = entry.parse()?;
            let already = self
                .usb
                .allowed_devices
                .iter()
                .filter_map(|existing| existing.parse::<transport::UsbId>().ok())
                .any(|existing| existing == id);
            if !already {
                self.usb.allowed_devices.push(id.to_string());
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        common::validate_log_level(&self.logging.level)?;
        self.usb.validate()?;
        Ok(())
    }
}

/// Expand `~` and environment variables in a user-supplied path
pub fn expand_path(path: &Path) -> Result<PathBuf> {
    let raw = path.to_string_lossy();
    let expanded = shellexpand::full(&raw)
        .with_context(|| format!("Failed to expand path: {}", raw))?;
    Ok(PathBuf::from(expanded.as_ref()))
}
