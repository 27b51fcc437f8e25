use std::path::PathBuf;

use anyhow::{Context, Result};
use calsync_core::backend::build_backend;
use calsync_core::config::{BackendDetails, Settings, config_path};
use calsync_core::orchestrator::Orchestrator;
use clap::Subcommand;
use owo_colors::OwoColorize;

#[derive(Subcommand)]
pub enum Target {
    /// A directory of .ics files
    Local {
        #[arg(long)]
        root: PathBuf,
    },
    /// A CalDAV calendar home
    Caldav {
        #[arg(long)]
        url: String,

        #[arg(short, long)]
        username: String,

        /// Prompted for when omitted
        #[arg(long)]
        password: Option<String>,
    },
}

impl Target {
    fn into_details(self) -> Result<BackendDetails> {
        Ok(match self {
            Target::Local { root } => BackendDetails::Local { root_path: root },
            Target::Caldav {
                url,
                username,
                password,
            } => {
                let password = match password {
                    Some(password) => password,
                    None => prompt_password(&format!("Password for {username}"))?,
                };
                BackendDetails::Caldav {
                    server_url: url,
                    username,
                    password,
                }
            }
        })
    }
}

pub async fn run(
    settings: &Settings,
    collection_id: &str,
    name: Option<&str>,
    priority: i32,
    sync_on_open: bool,
    target: Target,
) -> Result<()> {
    let data_dir = settings.data_path();
    let details = target.into_details()?;

    let mut orchestrator = Orchestrator::new()
        .with_settings(settings.clone())
        .with_config_dir(&data_dir);

    if config_path(collection_id, &data_dir).exists() {
        orchestrator.open_collection(collection_id, &data_dir)?;
    } else {
        orchestrator.create_collection(collection_id, name.unwrap_or(collection_id));
    }

    let backend = build_backend(&details, orchestrator.sink(), settings)?;
    let backend_id = backend.id().to_string();
    orchestrator
        .attach(collection_id, backend, priority, sync_on_open)
        .with_context(|| format!("Could not attach {backend_id}"))?;

    println!(
        "Attached {} to {} (priority {})",
        backend_id.bold(),
        collection_id,
        priority
    );
    Ok(())
}

/// Prompt the user for password input (hidden).
fn prompt_password(label: &str) -> Result<String> {
    let prompt = format!("{}: ", label);
    rpassword::prompt_password(&prompt).context("Failed to read password")
}
