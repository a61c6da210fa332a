//! Configuration
//!
//! Optional JSON file; every key has a default. CLI flags override it.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::assets::DEFAULT_TEMPLATE_NAME;
use crate::pipeline::{ExportOptions, DEFAULT_ARCHIVE_NAME};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Invalid config {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },

    #[error("Invalid log level: {0}")]
    LogLevel(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ForgeConfig {
    #[serde(default = "default_assets_dir")]
    pub assets_dir: PathBuf,
    #[serde(default = "default_template_name")]
    pub template_name: String,
    #[serde(default = "default_openscad_binary")]
    pub openscad_binary: PathBuf,
    #[serde(default = "default_archive_name")]
    pub archive_name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_assets_dir() -> PathBuf { PathBuf::from("assets") }
fn default_template_name() -> String { DEFAULT_TEMPLATE_NAME.to_string() }
fn default_openscad_binary() -> PathBuf { PathBuf::from("openscad") }
fn default_archive_name() -> String { DEFAULT_ARCHIVE_NAME.to_string() }
fn default_log_level() -> String { "info".to_string() }

impl Default for ForgeConfig {
    fn default() -> Self {
        Self {
            assets_dir: default_assets_dir(),
            template_name: default_template_name(),
            openscad_binary: default_openscad_binary(),
            archive_name: default_archive_name(),
            log_level: default_log_level(),
        }
    }
}

impl ForgeConfig {
    /// Load from `path`; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let display = path.display().to_string();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: display.clone(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse { path: display, source })
    }

    pub fn export_options(&self) -> ExportOptions {
        ExportOptions {
            template_name: self.template_name.clone(),
            archive_name: self.archive_name.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ForgeConfig::load(&dir.path().join("none.json")).unwrap();
        assert_eq!(config, ForgeConfig::default());
        assert_eq!(config.template_name, "Keycap.scad");
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keycap-forge.json");
        fs::write(&path, r#"{"openscadBinary": "/opt/openscad/bin/openscad", "archiveName": "set.zip"}"#).unwrap();

        let config = ForgeConfig::load(&path).unwrap();
        assert_eq!(config.openscad_binary, PathBuf::from("/opt/openscad/bin/openscad"));
        assert_eq!(config.export_options().archive_name, "set.zip");
        assert_eq!(config.assets_dir, PathBuf::from("assets"));
    }

    #[test]
    fn test_bad_json_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        fs::write(&path, "{").unwrap();

        let err = ForgeConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("broken.json"));
    }
}
