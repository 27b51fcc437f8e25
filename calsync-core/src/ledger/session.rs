//! Edit session over one collection's ledger file.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{Backend, BackendEvent, BackendKind, ErrorScope};
use crate::error::{CalSyncError, CalSyncResult};
use crate::ics::{generate_ics, parse_item};
use crate::ledger::entry::{Commit, DeltaEntry, group_commits};
use crate::model::{Calendar, CalendarItem};
use crate::utils::write_atomic;

/// Ledger file of a collection: `<dir>/<collection_id>.delta`
pub fn ledger_path(dir: &Path, collection_id: &str) -> PathBuf {
    dir.join(format!("{}.delta", collection_id))
}

/// Outcome of replaying the history into a backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub applied: usize,
    pub failed: usize,
    /// Accepted by a remote backend; settled by [`Session::acknowledge`]
    pub submitted: usize,
}

/// An entry handed to a remote backend whose outcome has not arrived yet.
#[derive(Debug)]
struct Submission {
    backend_id: String,
    calendar_id: String,
    item_id: String,
    action_id: String,
}

pub struct Session {
    id: String,
    collection_id: String,
    path: PathBuf,
    history: Vec<Commit>,
    undone: Vec<Commit>,
    pending: Vec<DeltaEntry>,
    /// Oldest first; a remote backend reports stores in submission order
    submitted: VecDeque<Submission>,
}

impl Session {
    /// Start a session on a ledger file. A missing file is an empty ledger;
    /// an unreadable one is logged and treated as empty.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let id = Uuid::new_v4().to_string();
        let collection_id = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut entries = match read_entries(&path) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring unreadable ledger");
                Vec::new()
            }
        };
        for entry in &mut entries {
            if entry.session_id != id {
                entry.crash_flag = true;
            }
        }

        let history = group_commits(entries);
        if !history.is_empty() {
            info!(
                path = %path.display(),
                commits = history.len(),
                "Recovered unpushed edits"
            );
        }

        Session {
            id,
            collection_id,
            path,
            history,
            undone: Vec::new(),
            pending: Vec::new(),
            submitted: VecDeque::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Committed edits, oldest first.
    pub fn history(&self) -> &[Commit] {
        &self.history
    }

    pub fn pending(&self) -> &[DeltaEntry] {
        &self.pending
    }

    /// Remote stores still waiting for their outcome.
    pub fn awaiting(&self) -> usize {
        self.submitted.len()
    }

    pub fn can_undo(&self) -> bool {
        !self.history.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.undone.is_empty()
    }

    /// Record an edit of `item` in the pending buffer. No backend is touched.
    pub fn stage(
        &mut self,
        calendar_id: &str,
        item: &CalendarItem,
        user_intent: &str,
    ) -> CalSyncResult<&DeltaEntry> {
        let payload = generate_ics(item)?;
        let entry = DeltaEntry::new(&self.id, calendar_id, &item.id, user_intent, payload);
        debug!(calendar = %calendar_id, item = %item.id, intent = %user_intent, "Staged edit");

        self.pending.push(entry);
        self.pending
            .last()
            .ok_or_else(|| CalSyncError::Ledger("pending buffer is empty".into()))
    }

    /// Group pending edits into a commit. Redo history is discarded.
    pub fn commit(&mut self) -> Option<&Commit> {
        if self.pending.is_empty() {
            return None;
        }

        let commit = Commit::new(std::mem::take(&mut self.pending));
        info!(commit = %commit.id, entries = commit.entries.len(), "Committed edits");
        self.history.push(commit);
        self.undone.clear();
        self.persist();
        self.history.last()
    }

    /// Move the newest commit to the undo stack and return it so the caller
    /// can revert its effects.
    pub fn undo(&mut self) -> Option<&Commit> {
        let commit = self.history.pop()?;
        debug!(commit = %commit.id, "Undid commit");
        self.undone.push(commit);
        self.persist();
        self.undone.last()
    }

    pub fn redo(&mut self) -> Option<&Commit> {
        let commit = self.undone.pop()?;
        debug!(commit = %commit.id, "Redid commit");
        self.history.push(commit);
        self.persist();
        self.history.last()
    }

    /// Drop uncommitted edits. Returns how many were dropped.
    pub fn discard(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }

    pub fn clear(&mut self) {
        self.history.clear();
        self.undone.clear();
        self.pending.clear();
        self.submitted.clear();
        self.persist();
    }

    /// Store every committed edit into `backend`, oldest first.
    ///
    /// A local store is final once it returns. A remote one only means the
    /// request was queued: the entry stays in the ledger until
    /// [`acknowledge`](Self::acknowledge) sees the backend confirm it.
    /// Entries that fail stay for a later attempt unless a newer edit of the
    /// same item was stored, since replaying them would roll that item back.
    pub fn apply_to_backend(&mut self, backend: &dyn Backend) -> ApplyReport {
        let mut report = ApplyReport::default();
        let mut applied = HashSet::new();
        let mut submitted = Vec::new();

        for entry in self.history.iter().flat_map(|commit| commit.entries.iter()) {
            match self.apply_entry(backend, entry) {
                Ok(()) if backend.kind() == BackendKind::Remote => {
                    report.submitted += 1;
                    submitted.push(Submission {
                        backend_id: backend.id().to_string(),
                        calendar_id: entry.calendar_id.clone(),
                        item_id: entry.item_id.clone(),
                        action_id: entry.action_id.clone(),
                    });
                }
                Ok(()) => {
                    report.applied += 1;
                    applied.insert(entry.action_id.clone());
                }
                Err(e) => {
                    warn!(
                        backend = %backend.id(),
                        item = %entry.item_id,
                        error = %e,
                        "Could not apply edit"
                    );
                    report.failed += 1;
                }
            }
        }

        self.submitted.extend(submitted);
        self.settle(&applied);
        info!(
            backend = %backend.id(),
            applied = report.applied,
            failed = report.failed,
            submitted = report.submitted,
            "Applied ledger"
        );
        report
    }

    /// Settle submitted entries from a backend's store outcome. Events that
    /// are not store outcomes are ignored.
    pub fn acknowledge(&mut self, event: &BackendEvent) -> ApplyReport {
        let (backend_id, calendar_id, item_ids, stored) = match event {
            BackendEvent::ItemsStored {
                backend_id,
                calendar_id,
                item_ids,
            } => (backend_id, calendar_id, item_ids, true),
            BackendEvent::ErrorOccurred {
                backend_id,
                scope:
                    ErrorScope::Store {
                        calendar_id,
                        item_ids,
                    },
                ..
            } => (backend_id, calendar_id, item_ids, false),
            _ => return ApplyReport::default(),
        };

        let mut report = ApplyReport::default();
        let mut applied = HashSet::new();
        for item_id in item_ids {
            let Some(position) = self.submitted.iter().position(|s| {
                s.backend_id == *backend_id && s.calendar_id == *calendar_id && s.item_id == *item_id
            }) else {
                continue;
            };
            let Some(submission) = self.submitted.remove(position) else {
                continue;
            };
            if stored {
                report.applied += 1;
                applied.insert(submission.action_id);
            } else {
                debug!(backend = %backend_id, item = %item_id, "Remote store failed, keeping edit");
                report.failed += 1;
            }
        }

        self.settle(&applied);
        report
    }

    /// Drop applied entries and every older entry for the same item, then
    /// persist.
    fn settle(&mut self, applied: &HashSet<String>) {
        let mut newest: HashMap<(String, String), usize> = HashMap::new();
        for (position, entry) in self
            .history
            .iter()
            .flat_map(|commit| commit.entries.iter())
            .enumerate()
        {
            if applied.contains(&entry.action_id) {
                newest.insert((entry.calendar_id.clone(), entry.item_id.clone()), position);
            }
        }

        let mut position = 0;
        for commit in &mut self.history {
            commit.entries.retain(|entry| {
                let key = (entry.calendar_id.clone(), entry.item_id.clone());
                let superseded = newest.get(&key).is_some_and(|&last| position <= last);
                position += 1;
                !superseded
            });
        }
        self.history.retain(|commit| !commit.entries.is_empty());
        self.persist();
    }

    fn apply_entry(&self, backend: &dyn Backend, entry: &DeltaEntry) -> CalSyncResult<()> {
        let item = parse_item(&entry.ical_data).ok_or_else(|| {
            CalSyncError::IcsParse(format!("entry {} has no usable item", entry.action_id))
        })?;

        let mut calendar = Calendar::new(&entry.calendar_id, &entry.calendar_id);
        calendar.add_item(item);
        backend.store_items(&calendar.reference(&self.collection_id), calendar.items())
    }

    /// Rewrite the ledger file from history. Failures are logged; the
    /// in-memory state stays authoritative.
    fn persist(&self) {
        if let Err(e) = self.write() {
            warn!(path = %self.path.display(), error = %e, "Could not write ledger");
        }
    }

    fn write(&self) -> CalSyncResult<()> {
        let entries: Vec<&DeltaEntry> = self
            .history
            .iter()
            .flat_map(|commit| commit.entries.iter())
            .collect();
        let json = serde_json::to_string_pretty(&entries)?;
        write_atomic(&self.path, &json)
    }
}

fn read_entries(path: &Path) -> CalSyncResult<Vec<DeltaEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(path)?;
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(&content).map_err(|e| CalSyncError::Ledger(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use tokio::sync::mpsc;

    use crate::backend::RemoteOptions;
    use crate::backend::remote::tests::{MockDav, discover, spawn_mock};
    use crate::config::BackendDetails;
    use crate::model::{CalendarMetadata, CalendarRef};

    /// Records stores and rejects the listed item ids or call numbers.
    #[derive(Default)]
    struct RecordingBackend {
        reject: Vec<String>,
        /// 1-based `store_items` calls to fail
        reject_calls: Vec<usize>,
        calls: Mutex<usize>,
        stored: Mutex<Vec<(String, String)>>,
        summaries: Mutex<HashMap<String, String>>,
    }

    impl RecordingBackend {
        fn summary(&self, item_id: &str) -> Option<String> {
            self.summaries.lock().unwrap().get(item_id).cloned()
        }
    }

    impl Backend for RecordingBackend {
        fn id(&self) -> &str {
            "recording"
        }

        fn kind(&self) -> BackendKind {
            BackendKind::Local
        }

        fn details(&self) -> BackendDetails {
            BackendDetails::Local {
                root_path: PathBuf::from("/dev/null"),
            }
        }

        fn load_calendars(&self, _collection_id: &str) {}

        fn load_items(&self, _calendar: &CalendarRef) {}

        fn store_calendars(&self, _: &str, _: &[CalendarMetadata]) -> CalSyncResult<()> {
            Ok(())
        }

        fn store_items(&self, calendar: &CalendarRef, items: &[CalendarItem]) -> CalSyncResult<()> {
            let call = {
                let mut calls = self.calls.lock().unwrap();
                *calls += 1;
                *calls
            };
            if self.reject_calls.contains(&call) {
                return Err(CalSyncError::Transport("HTTP 503".into()));
            }
            for item in items {
                if self.reject.contains(&item.id) {
                    return Err(CalSyncError::Transport("HTTP 412".into()));
                }
                self.stored
                    .lock()
                    .unwrap()
                    .push((calendar.calendar_id.clone(), item.id.clone()));
                self.summaries
                    .lock()
                    .unwrap()
                    .insert(item.id.clone(), item.schedule.summary.clone());
            }
            Ok(())
        }

        fn update_item(&self, _: &str, _: &str, _: &str) -> CalSyncResult<()> {
            Ok(())
        }
    }

    fn commit_one(session: &mut Session, id: &str) -> String {
        session
            .stage("home_work", &CalendarItem::event(id, id), "edit")
            .unwrap();
        session.commit().unwrap().id.clone()
    }

    #[test]
    fn test_commit_with_nothing_pending() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = Session::open(ledger_path(dir.path(), "home"));
        assert!(session.commit().is_none());
        assert!(!dir.path().join("home.delta").exists());
    }

    #[test]
    fn test_undo_redo_is_linear() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = Session::open(ledger_path(dir.path(), "home"));

        let a = commit_one(&mut session, "a");
        let b = commit_one(&mut session, "b");

        assert_eq!(session.undo().unwrap().id, b);
        assert_eq!(session.redo().unwrap().id, b);
        assert!(session.redo().is_none());

        session.undo();
        let c = commit_one(&mut session, "c");
        assert!(!session.can_redo());
        assert!(session.redo().is_none());

        let ids: Vec<&str> = session.history().iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec![a.as_str(), c.as_str()]);

        session.undo();
        session.undo();
        assert!(session.undo().is_none());
        assert!(!session.can_undo());
    }

    #[test]
    fn test_discard_drops_pending_only() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = Session::open(ledger_path(dir.path(), "home"));
        commit_one(&mut session, "a");
        session
            .stage("home_work", &CalendarItem::todo("t1", "Later"), "add")
            .unwrap();

        assert_eq!(session.discard(), 1);
        assert!(session.pending().is_empty());
        assert_eq!(session.history().len(), 1);
    }

    #[test]
    fn test_reload_marks_previous_session() {
        let dir = tempfile::tempdir().unwrap();
        let path = ledger_path(dir.path(), "home");

        let first_id = {
            let mut session = Session::open(&path);
            session
                .stage("home_work", &CalendarItem::event("e1", "One"), "create")
                .unwrap();
            session
                .stage("home_work", &CalendarItem::event("e2", "Two"), "create")
                .unwrap();
            session.commit();
            commit_one(&mut session, "e3");
            assert!(session.history()[0].entries.iter().all(|e| !e.crash_flag));
            session.id().to_string()
        };

        let session = Session::open(&path);
        assert_ne!(session.id(), first_id);
        assert_eq!(session.history().len(), 2);
        assert_eq!(session.history()[0].entries.len(), 2);
        assert!(
            session
                .history()
                .iter()
                .flat_map(|c| c.entries.iter())
                .all(|e| e.crash_flag && e.session_id == first_id)
        );
    }

    #[test]
    fn test_corrupt_ledger_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = ledger_path(dir.path(), "home");
        std::fs::write(&path, "{ not json").unwrap();

        let session = Session::open(&path);
        assert!(session.history().is_empty());
    }

    #[test]
    fn test_apply_keeps_failed_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = ledger_path(dir.path(), "home");
        let mut session = Session::open(&path);
        for id in ["e1", "e2", "e3"] {
            session
                .stage("home_work", &CalendarItem::event(id, id), "bulk edit")
                .unwrap();
        }
        session.commit();

        let backend = RecordingBackend {
            reject: vec!["e2".into()],
            ..RecordingBackend::default()
        };
        let report = session.apply_to_backend(&backend);

        assert_eq!(
            report,
            ApplyReport {
                applied: 2,
                failed: 1,
                submitted: 0
            }
        );
        assert_eq!(
            *backend.stored.lock().unwrap(),
            vec![
                ("home_work".to_string(), "e1".to_string()),
                ("home_work".to_string(), "e3".to_string()),
            ]
        );
        assert_eq!(session.history().len(), 1);
        assert_eq!(session.history()[0].entries.len(), 1);
        assert_eq!(session.history()[0].entries[0].item_id, "e2");

        let reloaded = Session::open(&path);
        assert_eq!(reloaded.history()[0].entries[0].item_id, "e2");
    }

    #[test]
    fn test_full_apply_and_clear_empty_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = ledger_path(dir.path(), "home");
        let mut session = Session::open(&path);
        commit_one(&mut session, "e1");

        let report = session.apply_to_backend(&RecordingBackend::default());
        assert_eq!(
            report,
            ApplyReport {
                applied: 1,
                ..ApplyReport::default()
            }
        );
        assert!(Session::open(&path).history().is_empty());

        commit_one(&mut session, "e2");
        session.clear();
        assert!(Session::open(&path).history().is_empty());
    }

    fn stage_versions(session: &mut Session, versions: &[&str]) {
        for version in versions {
            session
                .stage("home_work", &CalendarItem::event("i1", *version), "reschedule")
                .unwrap();
        }
        session.commit();
    }

    #[test]
    fn test_failed_edit_is_dropped_once_a_newer_edit_lands() {
        let dir = tempfile::tempdir().unwrap();
        let path = ledger_path(dir.path(), "home");
        let mut session = Session::open(&path);
        stage_versions(&mut session, &["v1", "v2", "v3"]);

        let backend = RecordingBackend {
            reject_calls: vec![2],
            ..RecordingBackend::default()
        };
        let report = session.apply_to_backend(&backend);
        assert_eq!(
            report,
            ApplyReport {
                applied: 2,
                failed: 1,
                submitted: 0
            }
        );
        assert!(session.history().is_empty());
        assert_eq!(backend.summary("i1").as_deref(), Some("v3"));

        assert_eq!(session.apply_to_backend(&backend), ApplyReport::default());
        assert_eq!(backend.summary("i1").as_deref(), Some("v3"));
        assert!(Session::open(&path).history().is_empty());
    }

    #[test]
    fn test_failed_newest_edit_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = Session::open(ledger_path(dir.path(), "home"));
        stage_versions(&mut session, &["v1", "v2", "v3"]);

        let backend = RecordingBackend {
            reject_calls: vec![3],
            ..RecordingBackend::default()
        };
        session.apply_to_backend(&backend);

        assert_eq!(backend.summary("i1").as_deref(), Some("v2"));
        let kept: Vec<&DeltaEntry> = session
            .history()
            .iter()
            .flat_map(|c| c.entries.iter())
            .collect();
        assert_eq!(kept.len(), 1);
        assert_eq!(parse_item(&kept[0].ical_data).unwrap().schedule.summary, "v3");
    }

    #[tokio::test]
    async fn test_remote_store_waits_for_confirmation() {
        let dir = tempfile::tempdir().unwrap();
        let path = ledger_path(dir.path(), "home");
        let mut session = Session::open(&path);
        for id in ["e1", "e2"] {
            session
                .stage("home_work", &CalendarItem::event(id, id), "create")
                .unwrap();
        }
        session.commit();

        let dav = MockDav {
            fail_puts: vec!["/dav/work/e2.ics".into()],
            ..MockDav::default()
        }
        .with_calendar("/dav/work/", "Work");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let backend = spawn_mock(dav, tx, RemoteOptions::default());
        discover(&backend, &mut rx).await;

        let report = session.apply_to_backend(&backend);
        assert_eq!(
            report,
            ApplyReport {
                submitted: 2,
                ..ApplyReport::default()
            }
        );
        assert_eq!(session.history()[0].entries.len(), 2);
        assert_eq!(session.awaiting(), 2);

        let mut settled = ApplyReport::default();
        while session.awaiting() > 0 {
            let event = rx.recv().await.unwrap();
            let outcome = session.acknowledge(&event);
            settled.applied += outcome.applied;
            settled.failed += outcome.failed;
        }
        assert_eq!(settled.applied, 1);
        assert_eq!(settled.failed, 1);

        let kept: Vec<&str> = session
            .history()
            .iter()
            .flat_map(|c| c.entries.iter())
            .map(|e| e.item_id.as_str())
            .collect();
        assert_eq!(kept, vec!["e2"]);
        assert_eq!(Session::open(&path).history()[0].entries[0].item_id, "e2");
    }

    #[test]
    fn test_acknowledge_ignores_other_events() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = Session::open(ledger_path(dir.path(), "home"));
        commit_one(&mut session, "e1");

        let event = BackendEvent::ItemsStored {
            backend_id: "recording".into(),
            calendar_id: "home_work".into(),
            item_ids: vec!["e1".into()],
        };
        assert_eq!(session.acknowledge(&event), ApplyReport::default());
        assert_eq!(session.history().len(), 1);
    }
}
