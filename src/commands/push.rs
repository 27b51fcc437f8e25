use anyhow::Result;
use calsync_core::config::Settings;
use owo_colors::OwoColorize;
use tracing::debug;

use super::{open_collection, open_session, pluralize};
use crate::render::create_spinner;

pub async fn run(settings: &Settings, collection_id: &str, backend_id: Option<&str>) -> Result<()> {
    let mut session = open_session(settings, collection_id);
    let total: usize = session.history().iter().map(|c| c.entries.len()).sum();
    if total == 0 {
        println!("{}", "Nothing to push".dimmed());
        return Ok(());
    }

    let mut orchestrator = open_collection(settings, collection_id)?;
    let backend = match backend_id {
        Some(id) => orchestrator.backend(collection_id, id)?,
        None => match orchestrator.attachments(collection_id)?.first() {
            Some(attachment) => attachment.backend.clone(),
            None => anyhow::bail!("Collection '{}' has no backends", collection_id),
        },
    };

    debug!(backend = %backend.id(), edits = total, "Pushing ledger");

    // Remote stores need the calendar locations; discovery runs ahead of
    // them in the backend's queue.
    backend.load_calendars(collection_id);
    let mut report = session.apply_to_backend(backend.as_ref());

    let spinner = create_spinner(format!("Pushing to {}", backend.id()));
    while session.awaiting() > 0 {
        let Some(event) = orchestrator.next_event().await else {
            break;
        };
        let outcome = session.acknowledge(&event);
        report.applied += outcome.applied;
        report.failed += outcome.failed;
    }
    let result = orchestrator.run_until_idle(collection_id).await;
    spinner.finish_and_clear();
    result?;

    let unconfirmed = session.awaiting();
    println!(
        "Pushed {} {} to {}",
        report.applied,
        pluralize("edit", report.applied),
        backend.id().bold()
    );
    if report.failed + unconfirmed > 0 {
        println!(
            "{}",
            format!(
                "{} {} failed and will be retried on the next push",
                report.failed + unconfirmed,
                pluralize("edit", report.failed + unconfirmed)
            )
            .red()
        );
    }

    Ok(())
}
