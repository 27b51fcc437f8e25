use anyhow::Result;
use calsync_core::config::Settings;
use owo_colors::OwoColorize;

use super::open_session;
use crate::render::Render;

pub fn run(settings: &Settings, collection_id: &str) -> Result<()> {
    let session = open_session(settings, collection_id);

    if session.history().is_empty() {
        println!("{}", "No unpushed edits".dimmed());
        return Ok(());
    }

    // Newest first
    for commit in session.history().iter().rev() {
        println!("{}", commit.render());
        for entry in &commit.entries {
            println!(
                "   {} {}",
                entry.calendar_id.dimmed(),
                entry.item_id
            );
        }
    }

    Ok(())
}
