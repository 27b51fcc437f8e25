pub mod attach;
pub mod edit;
pub mod log;
pub mod push;
pub mod status;
pub mod undo;

use anyhow::{Context, Result};
use calsync_core::config::{Settings, config_path};
use calsync_core::ledger::{Session, ledger_path};
use calsync_core::orchestrator::Orchestrator;

/// Open a collection from its saved attachment list.
pub fn open_collection(settings: &Settings, collection_id: &str) -> Result<Orchestrator> {
    let data_dir = settings.data_path();
    if !config_path(collection_id, &data_dir).exists() {
        anyhow::bail!(
            "Collection '{}' not found.\n\n\
            Attach a backend first, e.g.:\n  \
            calsync attach {} local --root ~/calendars/{}",
            collection_id,
            collection_id,
            collection_id
        );
    }

    let mut orchestrator = Orchestrator::new()
        .with_settings(settings.clone())
        .with_config_dir(&data_dir);
    orchestrator
        .open_collection(collection_id, &data_dir)
        .with_context(|| format!("Could not open collection '{collection_id}'"))?;
    Ok(orchestrator)
}

pub fn open_session(settings: &Settings, collection_id: &str) -> Session {
    Session::open(ledger_path(&settings.data_path(), collection_id))
}

pub fn pluralize(word: &str, count: usize) -> String {
    if count == 1 {
        word.to_string()
    } else {
        format!("{}s", word)
    }
}
