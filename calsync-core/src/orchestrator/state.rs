//! Per-collection bookkeeping of the orchestrator.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::backend::{Backend, BackendKind};
use crate::config::BackendEntry;
use crate::error::CalSyncResult;
use crate::model::{Calendar, CalendarItem, CalendarMetadata, Collection};

/// Progress of a collection load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    Idle,
    CalendarsRequested,
    CalendarsDiscovered,
    ItemsRequested,
    SyncComplete,
}

impl fmt::Display for LoadState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let label = match self {
            LoadState::Idle => "idle",
            LoadState::CalendarsRequested => "calendars requested",
            LoadState::CalendarsDiscovered => "calendars discovered",
            LoadState::ItemsRequested => "items requested",
            LoadState::SyncComplete => "synced",
        };
        write!(f, "{}", label)
    }
}

/// A backend attached to a collection.
#[derive(Clone)]
pub struct Attachment {
    pub backend: Arc<dyn Backend>,
    /// Lower loads first and wins merge conflicts
    pub priority: i32,
    pub sync_on_open: bool,
}

impl Attachment {
    /// Whether `load` queries this backend.
    pub fn is_eligible(&self) -> bool {
        self.backend.kind() == BackendKind::Local || self.sync_on_open
    }

    pub(crate) fn entry(&self) -> BackendEntry {
        BackendEntry {
            priority: self.priority,
            sync_on_open: self.sync_on_open,
            details: self.backend.details(),
        }
    }
}

impl fmt::Debug for Attachment {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Attachment")
            .field("backend", &self.backend.id())
            .field("priority", &self.priority)
            .field("sync_on_open", &self.sync_on_open)
            .finish()
    }
}

pub(crate) struct CollectionEntry {
    pub collection: Collection,
    /// Sorted ascending by priority; ties keep attach order
    pub attachments: Vec<Attachment>,
    pub state: LoadState,
    /// Backends asked for calendars that have not answered yet
    pub pending_discovery: HashSet<String>,
    /// (backend id, calendar id) item loads not yet finished
    pub pending_items: HashSet<(String, String)>,
    /// Where the attachment list is persisted, if anywhere
    pub config_dir: Option<PathBuf>,
    /// Priority of the backend each calendar's metadata came from
    calendar_sources: HashMap<String, i32>,
    /// Priority of the backend each (calendar id, item id) came from
    item_sources: HashMap<(String, String), i32>,
}

/// Whether an answer at `priority` takes `key` over its recorded source.
/// Entries added outside a load have no source and are never replaced.
fn outranks<K: std::hash::Hash + Eq>(sources: &HashMap<K, i32>, key: &K, priority: i32) -> bool {
    sources.get(key).is_some_and(|&current| priority < current)
}

impl CollectionEntry {
    pub fn new(collection: Collection, config_dir: Option<PathBuf>) -> Self {
        CollectionEntry {
            collection,
            attachments: Vec::new(),
            state: LoadState::Idle,
            pending_discovery: HashSet::new(),
            pending_items: HashSet::new(),
            config_dir,
            calendar_sources: HashMap::new(),
            item_sources: HashMap::new(),
        }
    }

    /// Insert, replacing an attachment of the same backend.
    pub fn insert(&mut self, attachment: Attachment) {
        let id = attachment.backend.id().to_string();
        self.attachments.retain(|a| a.backend.id() != id);
        self.attachments.push(attachment);
        self.attachments.sort_by_key(|a| a.priority);
    }

    /// Priority of an attached backend. Answers from backends that are no
    /// longer attached rank below every attachment.
    pub fn priority_of(&self, backend_id: &str) -> i32 {
        self.attachments
            .iter()
            .find(|a| a.backend.id() == backend_id)
            .map_or(i32::MAX, |a| a.priority)
    }

    /// Add unknown calendars and rename those last reported by a backend
    /// ranked below `priority`. Returns (added, renamed).
    pub fn merge_calendars(&mut self, priority: i32, calendars: &[CalendarMetadata]) -> (usize, usize) {
        let (mut added, mut renamed) = (0, 0);
        for meta in calendars {
            if self.collection.add_calendar(Calendar::from_metadata(meta)) {
                self.calendar_sources.insert(meta.id.clone(), priority);
                added += 1;
            } else if outranks(&self.calendar_sources, &meta.id, priority) {
                if let Ok(true) = self.collection.rename_calendar(&meta.id, &meta.name) {
                    renamed += 1;
                }
                self.calendar_sources.insert(meta.id.clone(), priority);
            }
        }
        (added, renamed)
    }

    /// Add unknown items and replace those last reported by a backend
    /// ranked below `priority`. Returns (added, replaced).
    pub fn merge_items(
        &mut self,
        priority: i32,
        calendar_id: &str,
        items: &[CalendarItem],
    ) -> CalSyncResult<(usize, usize)> {
        let (mut added, mut replaced) = (0, 0);
        for item in items {
            let key = (calendar_id.to_string(), item.id.clone());
            if self.collection.add_item(calendar_id, item.clone())? {
                self.item_sources.insert(key, priority);
                added += 1;
            } else if outranks(&self.item_sources, &key, priority) {
                self.collection.update_item(calendar_id, item.clone())?;
                self.item_sources.insert(key, priority);
                replaced += 1;
            }
        }
        Ok((added, replaced))
    }

    pub fn is_loading(&self) -> bool {
        matches!(
            self.state,
            LoadState::CalendarsRequested | LoadState::CalendarsDiscovered | LoadState::ItemsRequested
        )
    }

    pub fn eligible(&self) -> Vec<Arc<dyn Backend>> {
        self.attachments
            .iter()
            .filter(|a| a.is_eligible())
            .map(|a| Arc::clone(&a.backend))
            .collect()
    }

    pub fn backends_idle(&self) -> bool {
        self.attachments.iter().all(|a| a.backend.active_jobs() == 0)
    }

    /// Advance to `SyncComplete` once nothing is outstanding. Returns true on
    /// the transition.
    pub fn settle(&mut self) -> bool {
        if self.is_loading()
            && self.pending_discovery.is_empty()
            && self.pending_items.is_empty()
            && self.backends_idle()
        {
            self.state = LoadState::SyncComplete;
            return true;
        }
        false
    }
}
