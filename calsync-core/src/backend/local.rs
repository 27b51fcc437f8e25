//! Local directory backend.
//!
//! Layout under the root directory:
//!
//! ```text
//! <root>/<calendar-slug>/.calendar.toml   id + display name
//! <root>/<calendar-slug>/<item-slug>.ics  one item per file
//! ```
//!
//! Every operation completes before returning, but results are still
//! published as events so the orchestrator handles this backend exactly like
//! a remote one.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::backend::{Backend, BackendEvent, BackendKind, ErrorScope, EventSink};
use crate::config::BackendDetails;
use crate::error::{CalSyncError, CalSyncResult};
use crate::ics::{generate_ics, parse_item};
use crate::model::{CalendarItem, CalendarMetadata, CalendarRef};
use crate::utils::{file_slug, write_atomic};

const METADATA_FILE: &str = ".calendar.toml";

#[derive(Debug, Serialize, Deserialize)]
struct CalendarFile {
    id: String,
    name: String,
}

pub struct LocalBackend {
    id: String,
    root: PathBuf,
    events: EventSink,
}

impl LocalBackend {
    pub fn new(root: impl Into<PathBuf>, events: EventSink) -> Self {
        let root = root.into();
        LocalBackend {
            id: format!("local:{}", root.display()),
            root,
            events,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn calendar_dir(&self, calendar_id: &str) -> PathBuf {
        self.root.join(file_slug(calendar_id))
    }

    fn emit(&self, event: BackendEvent) {
        if self.events.send(event).is_err() {
            debug!(backend = %self.id, "Event receiver dropped");
        }
    }

    fn emit_error(&self, scope: ErrorScope, error: &CalSyncError) {
        warn!(backend = %self.id, error = %error, "Local backend operation failed");
        self.emit(BackendEvent::ErrorOccurred {
            backend_id: self.id.clone(),
            scope,
            message: error.to_string(),
        });
    }

    /// Scan the root for calendar directories, sorted by id.
    fn read_calendars(&self) -> CalSyncResult<Vec<CalendarMetadata>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }

        let mut calendars: Vec<CalendarMetadata> = std::fs::read_dir(&self.root)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .filter_map(|path| {
                let file = path.join(METADATA_FILE);
                let content = std::fs::read_to_string(&file).ok()?;
                match toml::from_str::<CalendarFile>(&content) {
                    Ok(meta) => Some(CalendarMetadata::new(meta.id, meta.name)),
                    Err(e) => {
                        warn!(path = %file.display(), error = %e, "Skipping unreadable calendar metadata");
                        None
                    }
                }
            })
            .collect();

        calendars.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(calendars)
    }

    /// Read every `.ics` file of a calendar, in file name order. Unparsable
    /// files are skipped.
    fn read_items(&self, calendar_id: &str) -> CalSyncResult<Vec<CalendarItem>> {
        let dir = self.calendar_dir(calendar_id);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut paths: Vec<PathBuf> = std::fs::read_dir(&dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|e| e == "ics"))
            .collect();
        paths.sort();

        let items = paths
            .into_iter()
            .filter_map(|path| {
                let content = match std::fs::read_to_string(&path) {
                    Ok(content) => content,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Skipping unreadable item");
                        return None;
                    }
                };
                let item = parse_item(&content);
                if item.is_none() {
                    warn!(path = %path.display(), "Skipping unparsable item");
                }
                item
            })
            .collect();

        Ok(items)
    }

    fn write_calendar(&self, metadata: &CalendarMetadata) -> CalSyncResult<()> {
        let file = CalendarFile {
            id: metadata.id.clone(),
            name: metadata.name.clone(),
        };
        let content =
            toml::to_string_pretty(&file).map_err(|e| CalSyncError::Serialization(e.to_string()))?;
        write_atomic(&self.calendar_dir(&metadata.id).join(METADATA_FILE), &content)
    }

    fn write_item(&self, calendar_id: &str, item_id: &str, payload: &str) -> CalSyncResult<()> {
        let path = self
            .calendar_dir(calendar_id)
            .join(format!("{}.ics", file_slug(item_id)));
        write_atomic(&path, payload)
    }
}

impl Backend for LocalBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn details(&self) -> BackendDetails {
        BackendDetails::Local {
            root_path: self.root.clone(),
        }
    }

    fn load_calendars(&self, collection_id: &str) {
        match self.read_calendars() {
            Ok(calendars) => {
                debug!(backend = %self.id, count = calendars.len(), "Local calendars read");
                self.emit(BackendEvent::CalendarsLoaded {
                    backend_id: self.id.clone(),
                    collection_id: collection_id.to_string(),
                    calendars,
                });
            }
            Err(e) => self.emit_error(
                ErrorScope::Discovery {
                    collection_id: collection_id.to_string(),
                },
                &e,
            ),
        }
    }

    fn load_items(&self, calendar: &CalendarRef) {
        match self.read_items(&calendar.calendar_id) {
            Ok(items) => {
                if !items.is_empty() {
                    self.emit(BackendEvent::ItemsLoaded {
                        backend_id: self.id.clone(),
                        calendar: calendar.clone(),
                        items,
                    });
                }
                self.emit(BackendEvent::DataLoaded {
                    backend_id: self.id.clone(),
                    calendar: calendar.clone(),
                });
            }
            Err(e) => self.emit_error(ErrorScope::Load(calendar.clone()), &e),
        }
    }

    fn store_calendars(
        &self,
        _collection_id: &str,
        calendars: &[CalendarMetadata],
    ) -> CalSyncResult<()> {
        for metadata in calendars {
            self.write_calendar(metadata)?;
        }
        Ok(())
    }

    fn store_items(&self, calendar: &CalendarRef, items: &[CalendarItem]) -> CalSyncResult<()> {
        let metadata_path = self.calendar_dir(&calendar.calendar_id).join(METADATA_FILE);
        if !metadata_path.exists() {
            self.write_calendar(&CalendarMetadata::new(&calendar.calendar_id, &calendar.name))?;
        }

        let mut item_ids = Vec::with_capacity(items.len());
        for item in items {
            let payload = generate_ics(item)?;
            self.write_item(&calendar.calendar_id, &item.id, &payload)?;
            item_ids.push(item.id.clone());
        }

        self.emit(BackendEvent::ItemsStored {
            backend_id: self.id.clone(),
            calendar_id: calendar.calendar_id.clone(),
            item_ids,
        });
        Ok(())
    }

    fn update_item(&self, calendar_id: &str, item_id: &str, payload: &str) -> CalSyncResult<()> {
        if !self.calendar_dir(calendar_id).join(METADATA_FILE).exists() {
            return Err(CalSyncError::CalendarNotFound(calendar_id.to_string()));
        }

        self.write_item(calendar_id, item_id, payload)?;
        self.emit(BackendEvent::ItemsStored {
            backend_id: self.id.clone(),
            calendar_id: calendar_id.to_string(),
            item_ids: vec![item_id.to_string()],
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn calendar_ref(id: &str, name: &str) -> CalendarRef {
        CalendarRef {
            collection_id: "home".into(),
            calendar_id: id.into(),
            name: name.into(),
        }
    }

    #[test]
    fn test_store_then_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let backend = LocalBackend::new(dir.path(), tx);
        let work = calendar_ref("home_work", "Work");

        backend
            .store_calendars("home", &[CalendarMetadata::new("home_work", "Work")])
            .unwrap();
        backend
            .store_items(
                &work,
                &[CalendarItem::event("e1", "One"), CalendarItem::todo("t1", "Two")],
            )
            .unwrap();
        assert!(matches!(rx.try_recv(), Ok(BackendEvent::ItemsStored { item_ids, .. }) if item_ids.len() == 2));

        backend.load_calendars("home");
        match rx.try_recv().unwrap() {
            BackendEvent::CalendarsLoaded { calendars, .. } => {
                assert_eq!(calendars, vec![CalendarMetadata::new("home_work", "Work")]);
            }
            other => panic!("Expected CalendarsLoaded, got {:?}", other),
        }

        backend.load_items(&work);
        match rx.try_recv().unwrap() {
            BackendEvent::ItemsLoaded { items, .. } => {
                let mut ids: Vec<_> = items.iter().map(|i| i.id.clone()).collect();
                ids.sort();
                assert_eq!(ids, vec!["e1", "t1"]);
            }
            other => panic!("Expected ItemsLoaded, got {:?}", other),
        }
        assert!(matches!(rx.try_recv(), Ok(BackendEvent::DataLoaded { .. })));
    }

    #[test]
    fn test_missing_root_yields_no_calendars() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let backend = LocalBackend::new(dir.path().join("does-not-exist"), tx);

        backend.load_calendars("home");
        match rx.try_recv().unwrap() {
            BackendEvent::CalendarsLoaded { calendars, .. } => assert!(calendars.is_empty()),
            other => panic!("Expected CalendarsLoaded, got {:?}", other),
        }
    }

    #[test]
    fn test_unparsable_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let backend = LocalBackend::new(dir.path(), tx);
        let work = calendar_ref("home_work", "Work");

        backend
            .store_items(&work, &[CalendarItem::event("e1", "Good")])
            .unwrap();
        let _ = rx.try_recv();
        std::fs::write(backend.calendar_dir("home_work").join("broken.ics"), "garbage").unwrap();

        backend.load_items(&work);
        match rx.try_recv().unwrap() {
            BackendEvent::ItemsLoaded { items, .. } => {
                assert_eq!(items.len(), 1);
                assert_eq!(items[0].id, "e1");
            }
            other => panic!("Expected ItemsLoaded, got {:?}", other),
        }
    }

    #[test]
    fn test_update_item_requires_known_calendar() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let backend = LocalBackend::new(dir.path(), tx);

        let result = backend.update_item("nope", "e1", "BEGIN:VCALENDAR\r\nEND:VCALENDAR\r\n");
        assert!(matches!(result, Err(CalSyncError::CalendarNotFound(_))));
    }
}
