use std::path::Path;

use anyhow::{Context, Result};
use calsync_core::config::Settings;
use calsync_core::ics::parse_item;

use super::open_session;
use crate::render::Render;

pub fn run(
    settings: &Settings,
    collection_id: &str,
    calendar_id: &str,
    file: &Path,
    intent: &str,
) -> Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Could not read {}", file.display()))?;
    let Some(mut item) = parse_item(&content) else {
        anyhow::bail!(
            "{} does not contain a usable VEVENT or VTODO",
            file.display()
        );
    };
    item.touch();

    let mut session = open_session(settings, collection_id);
    session.stage(calendar_id, &item, intent)?;
    let Some(commit) = session.commit() else {
        anyhow::bail!("Nothing was staged");
    };

    println!("Recorded {}", item.render());
    println!("   {}", commit.render());
    Ok(())
}
