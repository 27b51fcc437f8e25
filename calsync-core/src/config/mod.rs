//! Configuration: per-collection backend attachments and global settings.

mod collection_config;
mod settings;

pub use collection_config::{
    BackendDetails, BackendEntry, CollectionConfig, config_path, load_config, save_backend_config,
};
pub use settings::Settings;
