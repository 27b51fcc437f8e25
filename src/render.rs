//! Terminal rendering for calsync types.

use calsync_core::ledger::Commit;
use calsync_core::model::{Calendar, CalendarItem, ItemKind};
use calsync_core::orchestrator::{Attachment, LoadState};
use indicatif::{ProgressBar, ProgressStyle};
use owo_colors::OwoColorize;

use crate::commands::pluralize;

/// Extension trait for TUI rendering with colors.
pub trait Render {
    fn render(&self) -> String;
}

impl Render for Calendar {
    fn render(&self) -> String {
        format!(
            "📅 {} {}",
            self.name(),
            format!("({}, {} {})", self.id(), self.len(), pluralize("item", self.len())).dimmed()
        )
    }
}

impl Render for CalendarItem {
    fn render(&self) -> String {
        let symbol = match self.kind {
            ItemKind::Event => "•",
            ItemKind::Todo => "☐",
        };
        let time = self
            .schedule
            .start
            .as_ref()
            .or(self.schedule.end.as_ref())
            .map(|t| t.to_string())
            .unwrap_or_default();

        format!("{} {} {}", symbol, self.schedule.summary, time.dimmed())
    }
}

impl Render for Attachment {
    fn render(&self) -> String {
        let mut line = format!("{} {}", self.priority.to_string().dimmed(), self.backend.id());
        if self.sync_on_open {
            line.push_str(&format!(" {}", "(sync on open)".dimmed()));
        }
        line
    }
}

impl Render for LoadState {
    fn render(&self) -> String {
        match self {
            LoadState::SyncComplete => self.to_string().green().to_string(),
            LoadState::Idle => self.to_string().dimmed().to_string(),
            _ => self.to_string().yellow().to_string(),
        }
    }
}

impl Render for Commit {
    fn render(&self) -> String {
        let short_id: String = self.id.chars().take(8).collect();
        let recovered = if self.entries.iter().any(|e| e.crash_flag) {
            format!(" {}", "(from an earlier session)".dimmed())
        } else {
            String::new()
        };

        format!(
            "{} {} {} {}{}",
            short_id.yellow(),
            self.timestamp.format("%Y-%m-%d %H:%M").to_string().dimmed(),
            self.summary(),
            format!("[{} {}]", self.entries.len(), pluralize("item", self.entries.len())).dimmed(),
            recovered
        )
    }
}

/// Threshold for compact view (show a count instead of individual items)
pub const COMPACT_THRESHOLD: usize = 5;

pub fn create_spinner(message: String) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner()
        .tick_strings(&["-", "\\", "|", "/"])
        .template("{msg} {spinner}")
    {
        spinner.set_style(style);
    }
    spinner.set_message(message);
    spinner.enable_steady_tick(std::time::Duration::from_millis(80));
    spinner
}
