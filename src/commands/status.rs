use anyhow::Result;
use calsync_core::config::Settings;
use owo_colors::OwoColorize;

use super::{open_collection, open_session, pluralize};
use crate::render::{COMPACT_THRESHOLD, Render, create_spinner};

pub async fn run(settings: &Settings, collection_id: &str) -> Result<()> {
    let mut orchestrator = open_collection(settings, collection_id)?;

    println!("{}", "Backends".bold());
    for attachment in orchestrator.attachments(collection_id)? {
        println!("   {}", attachment.render());
    }
    println!();

    let spinner = create_spinner(format!("Loading {}", collection_id));
    let result = orchestrator.run_until_synced(collection_id).await;
    spinner.finish_and_clear();
    result?;

    let Some(collection) = orchestrator.collection(collection_id) else {
        anyhow::bail!("Collection '{}' disappeared while loading", collection_id);
    };

    if collection.calendars().is_empty() {
        println!("{}", "No calendars".dimmed());
    }

    for (i, calendar) in collection.calendars().iter().enumerate() {
        println!("{}", calendar.render());
        if calendar.len() <= COMPACT_THRESHOLD {
            for item in calendar.items() {
                println!("   {}", item.render());
            }
        }

        if i < collection.calendars().len() - 1 {
            println!();
        }
    }

    let session = open_session(settings, collection_id);
    let unpushed: usize = session.history().iter().map(|c| c.entries.len()).sum();
    if unpushed > 0 {
        println!(
            "\n{}",
            format!(
                "{} unpushed {} (see `calsync log {}`)",
                unpushed,
                pluralize("edit", unpushed),
                collection_id
            )
            .yellow()
        );
    }

    if let Some(state) = orchestrator.state(collection_id) {
        println!("\n{}", state.render());
    }

    Ok(())
}
