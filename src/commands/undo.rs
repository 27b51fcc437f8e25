use anyhow::Result;
use calsync_core::config::Settings;
use owo_colors::OwoColorize;

use super::open_session;
use crate::render::Render;

pub fn run(settings: &Settings, collection_id: &str) -> Result<()> {
    let mut session = open_session(settings, collection_id);

    match session.undo() {
        Some(commit) => println!("Undid {}", commit.render()),
        None => println!("{}", "Nothing to undo".dimmed()),
    }

    Ok(())
}
