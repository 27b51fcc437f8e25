//! Ledger records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One recorded edit: the full iCalendar payload of the item after the edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaEntry {
    pub action_id: String,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    /// Recorded by an earlier session and never pushed
    #[serde(default)]
    pub crash_flag: bool,
    pub user_intent: String,
    pub calendar_id: String,
    pub item_id: String,
    /// Assigned when the entry is committed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_id: Option<String>,
    pub ical_data: String,
}

impl DeltaEntry {
    pub(crate) fn new(
        session_id: &str,
        calendar_id: &str,
        item_id: &str,
        user_intent: &str,
        ical_data: String,
    ) -> Self {
        DeltaEntry {
            action_id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            timestamp: Utc::now(),
            crash_flag: false,
            user_intent: user_intent.to_string(),
            calendar_id: calendar_id.to_string(),
            item_id: item_id.to_string(),
            commit_id: None,
            ical_data,
        }
    }
}

/// Entries committed together; undone and redone as a unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub entries: Vec<DeltaEntry>,
}

impl Commit {
    pub(crate) fn new(mut entries: Vec<DeltaEntry>) -> Self {
        let id = Uuid::new_v4().to_string();
        for entry in &mut entries {
            entry.commit_id = Some(id.clone());
        }
        Commit {
            id,
            timestamp: Utc::now(),
            entries,
        }
    }

    /// Distinct intents in entry order, joined for display.
    pub fn summary(&self) -> String {
        let mut intents: Vec<&str> = Vec::new();
        for entry in &self.entries {
            if !intents.contains(&entry.user_intent.as_str()) {
                intents.push(&entry.user_intent);
            }
        }
        intents.join("; ")
    }
}

/// Rebuild commits from a flat, commit-ordered entry list. Consecutive
/// entries sharing a commit id form one commit.
pub(crate) fn group_commits(entries: Vec<DeltaEntry>) -> Vec<Commit> {
    let mut commits: Vec<Commit> = Vec::new();

    for mut entry in entries {
        let commit_id = entry
            .commit_id
            .get_or_insert_with(|| Uuid::new_v4().to_string())
            .clone();

        match commits.last_mut() {
            Some(last) if last.id == commit_id => last.entries.push(entry),
            _ => commits.push(Commit {
                id: commit_id,
                timestamp: entry.timestamp,
                entries: vec![entry],
            }),
        }
    }

    commits
}
