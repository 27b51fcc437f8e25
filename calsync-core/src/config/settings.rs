//! Global settings at ~/.config/calsync/config.toml

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, File};
use serde::{Deserialize, Serialize};

use crate::error::{CalSyncError, CalSyncResult};

static DEFAULT_DATA_DIR: &str = "~/.local/share/calsync";
const DEFAULT_STAGE_TIMEOUT_SECS: u64 = 60;

fn default_data_dir() -> PathBuf {
    PathBuf::from(DEFAULT_DATA_DIR)
}

fn default_log_level() -> String {
    "warn".to_string()
}

fn default_stage_timeout_secs() -> u64 {
    DEFAULT_STAGE_TIMEOUT_SECS
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Where collection configs and ledgers live
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Default tracing filter, overridden by RUST_LOG
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Deadline per remote stage; 0 disables it
    #[serde(default = "default_stage_timeout_secs")]
    pub stage_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            data_dir: default_data_dir(),
            log_level: default_log_level(),
            stage_timeout_secs: DEFAULT_STAGE_TIMEOUT_SECS,
        }
    }
}

impl Settings {
    pub fn config_path() -> CalSyncResult<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| CalSyncError::Config("Could not determine config directory".into()))?
            .join("calsync");

        Ok(config_dir.join("config.toml"))
    }

    /// Load the global settings, writing a commented default file first if
    /// there is none.
    pub fn load() -> CalSyncResult<Self> {
        let path = Self::config_path()?;

        if !path.exists() {
            Self::create_default_config(&path)?;
        }

        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> CalSyncResult<Self> {
        Config::builder()
            .add_source(File::from(path.to_path_buf()).required(false))
            .build()
            .map_err(|e| CalSyncError::Config(e.to_string()))?
            .try_deserialize()
            .map_err(|e| CalSyncError::Config(e.to_string()))
    }

    pub fn data_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.data_dir.to_string_lossy()).into_owned())
    }

    pub fn stage_timeout(&self) -> Option<Duration> {
        (self.stage_timeout_secs > 0).then(|| Duration::from_secs(self.stage_timeout_secs))
    }

    fn create_default_config(path: &Path) -> CalSyncResult<()> {
        let contents = format!(
            "\
# calsync configuration

# Where collection configs and edit ledgers live:
# data_dir = \"{}\"

# Log filter when RUST_LOG is not set:
# log_level = \"warn\"

# Seconds before a remote request is abandoned (0 = never):
# stage_timeout_secs = {}
",
            DEFAULT_DATA_DIR, DEFAULT_STAGE_TIMEOUT_SECS
        );

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                CalSyncError::Config(format!("Could not create config directory: {e}"))
            })?;
        }

        std::fs::write(path, contents)
            .map_err(|e| CalSyncError::Config(format!("Could not write config file: {e}")))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calsync").join("config.toml");
        Settings::create_default_config(&path).unwrap();

        let settings = Settings::load_from(&path).unwrap();
        assert_eq!(settings.data_dir, PathBuf::from(DEFAULT_DATA_DIR));
        assert_eq!(settings.log_level, "warn");
        assert_eq!(settings.stage_timeout(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_overrides_and_disabled_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "data_dir = \"/srv/calsync\"\nlog_level = \"debug\"\nstage_timeout_secs = 0\n",
        )
        .unwrap();

        let settings = Settings::load_from(&path).unwrap();
        assert_eq!(settings.data_path(), PathBuf::from("/srv/calsync"));
        assert_eq!(settings.log_level, "debug");
        assert_eq!(settings.stage_timeout(), None);
    }
}
