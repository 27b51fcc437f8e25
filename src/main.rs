mod commands;
mod render;

use std::path::PathBuf;

use anyhow::{Context, Result};
use calsync_core::config::Settings;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use commands::attach::Target;

#[derive(Parser)]
#[command(name = "calsync")]
#[command(about = "Sync calendar collections across local and CalDAV backends")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Attach a backend to a collection (created if it doesn't exist)
    Attach {
        collection: String,

        /// Display name for a new collection
        #[arg(long)]
        name: Option<String>,

        /// Lower loads first and wins conflicts
        #[arg(short, long, default_value_t = 1)]
        priority: i32,

        /// Query this backend whenever the collection is loaded
        #[arg(long)]
        sync_on_open: bool,

        #[command(subcommand)]
        target: Target,
    },
    /// Load a collection from its backends and show what it holds
    Status { collection: String },
    /// Record an edit from an .ics file containing one event or to-do
    Edit {
        collection: String,

        /// Calendar id the item belongs to
        calendar: String,

        file: PathBuf,

        /// What the edit is for, shown in the log
        #[arg(short, long, default_value = "edit")]
        intent: String,
    },
    /// List recorded edits that have not been pushed
    Log { collection: String },
    /// Drop the most recent commit
    Undo { collection: String },
    /// Store recorded edits into a backend
    Push {
        collection: String,

        /// Backend id (defaults to the highest priority attachment)
        #[arg(short, long)]
        backend: Option<String>,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load().context("Failed to load settings")?;
    init_tracing(&settings);

    match cli.command {
        Commands::Attach {
            collection,
            name,
            priority,
            sync_on_open,
            target,
        } => {
            commands::attach::run(
                &settings,
                &collection,
                name.as_deref(),
                priority,
                sync_on_open,
                target,
            )
            .await
        }
        Commands::Status { collection } => commands::status::run(&settings, &collection).await,
        Commands::Edit {
            collection,
            calendar,
            file,
            intent,
        } => commands::edit::run(&settings, &collection, &calendar, &file, &intent),
        Commands::Log { collection } => commands::log::run(&settings, &collection),
        Commands::Undo { collection } => commands::undo::run(&settings, &collection),
        Commands::Push {
            collection,
            backend,
        } => commands::push::run(&settings, &collection, backend.as_deref()).await,
    }
}

/// Log to stderr. `RUST_LOG` takes precedence over the configured level.
fn init_tracing(settings: &Settings) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.log_level))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
