//! Per-collection backend configuration, stored at `<dir>/<collection_id>.toml`.
//!
//! ```toml
//! id = "home"
//! name = "Home"
//!
//! [[backends]]
//! type = "local"
//! priority = 1
//! sync_on_open = false
//! root_path = "~/calendars/home"
//!
//! [[backends]]
//! type = "caldav"
//! priority = 2
//! sync_on_open = true
//! server_url = "https://dav.example.com/alice/"
//! username = "alice"
//! password = "..."
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CalSyncError, CalSyncResult};
use crate::utils::write_atomic;

/// Connection parameters of one backend, tagged by backend type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendDetails {
    Local {
        root_path: PathBuf,
    },
    Caldav {
        server_url: String,
        username: String,
        password: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendEntry {
    pub priority: i32,
    #[serde(default)]
    pub sync_on_open: bool,
    #[serde(flatten)]
    pub details: BackendDetails,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionConfig {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub backends: Vec<BackendEntry>,
}

pub fn config_path(collection_id: &str, dir: &Path) -> PathBuf {
    dir.join(format!("{}.toml", collection_id))
}

/// Write the attachment list of a collection, replacing any previous one.
pub fn save_backend_config(
    collection_id: &str,
    name: &str,
    backends: &[BackendEntry],
    dir: &Path,
) -> CalSyncResult<PathBuf> {
    let config = CollectionConfig {
        id: collection_id.to_string(),
        name: name.to_string(),
        backends: backends.to_vec(),
    };
    let content =
        toml::to_string_pretty(&config).map_err(|e| CalSyncError::Config(e.to_string()))?;

    let path = config_path(collection_id, dir);
    write_atomic(&path, &content)
        .map_err(|e| CalSyncError::Config(format!("Could not write {}: {e}", path.display())))?;

    debug!(path = %path.display(), backends = backends.len(), "Saved collection config");
    Ok(path)
}

pub fn load_config(collection_id: &str, dir: &Path) -> CalSyncResult<CollectionConfig> {
    let path = config_path(collection_id, dir);
    let content = std::fs::read_to_string(&path)
        .map_err(|e| CalSyncError::Config(format!("Could not read {}: {e}", path.display())))?;

    let config: CollectionConfig = toml::from_str(&content)
        .map_err(|e| CalSyncError::Config(format!("{}: {e}", path.display())))?;

    if config.id != collection_id {
        return Err(CalSyncError::Config(format!(
            "{} describes collection '{}'",
            path.display(),
            config.id
        )));
    }

    Ok(config)
}
