//! Backend orchestration.
//!
//! The [`Orchestrator`] owns every open collection and the receiving end of
//! the backend event channel. Backends are queried in priority order and
//! their results merged by precedence: a calendar or item keeps the version
//! reported by the backend with the lowest priority value, regardless of
//! which backend answered first. A backend ranked lower never overwrites
//! what a higher one reported, and entries added outside a load are never
//! overwritten.

mod state;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::backend::{Backend, BackendEvent, BackendKind, ErrorScope, EventSink, build_backend};
use crate::config::{BackendEntry, Settings, load_config, save_backend_config};
use crate::error::{CalSyncError, CalSyncResult};
use crate::model::{Calendar, CalendarItem, CalendarMetadata, CalendarRef, Collection};

pub use state::{Attachment, LoadState};

use state::CollectionEntry;

/// How long the drive loops wait for an event before re-checking job
/// counters. Some jobs finish without publishing anything.
const IDLE_POLL: Duration = Duration::from_millis(50);

pub struct Orchestrator {
    collections: HashMap<String, CollectionEntry>,
    events: mpsc::UnboundedReceiver<BackendEvent>,
    sink: EventSink,
    config_dir: Option<PathBuf>,
    settings: Settings,
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl Orchestrator {
    pub fn new() -> Self {
        let (sink, events) = mpsc::unbounded_channel();
        Orchestrator {
            collections: HashMap::new(),
            events,
            sink,
            config_dir: None,
            settings: Settings::default(),
        }
    }

    /// Persist attachment lists of created collections under `dir`.
    pub fn with_config_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config_dir = Some(dir.into());
        self
    }

    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// Channel backends must publish on to reach this orchestrator.
    pub fn sink(&self) -> EventSink {
        self.sink.clone()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Create an empty collection, or return the existing one with that id.
    pub fn create_collection(&mut self, id: &str, name: &str) -> &mut Collection {
        let config_dir = self.config_dir.clone();
        &mut self
            .collections
            .entry(id.to_string())
            .or_insert_with(|| CollectionEntry::new(Collection::new(id, name), config_dir))
            .collection
    }

    pub fn collection(&self, id: &str) -> Option<&Collection> {
        self.collections.get(id).map(|entry| &entry.collection)
    }

    pub fn collection_mut(&mut self, id: &str) -> Option<&mut Collection> {
        self.collections.get_mut(id).map(|entry| &mut entry.collection)
    }

    pub fn collection_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.collections.keys().map(String::as_str).collect();
        ids.sort();
        ids
    }

    pub fn state(&self, collection_id: &str) -> Option<LoadState> {
        self.collections.get(collection_id).map(|entry| entry.state)
    }

    pub fn attachments(&self, collection_id: &str) -> CalSyncResult<&[Attachment]> {
        Ok(&self.entry(collection_id)?.attachments)
    }

    /// Look up an attached backend by id.
    pub fn backend(&self, collection_id: &str, backend_id: &str) -> CalSyncResult<Arc<dyn Backend>> {
        self.entry(collection_id)?
            .attachments
            .iter()
            .find(|a| a.backend.id() == backend_id)
            .map(|a| Arc::clone(&a.backend))
            .ok_or_else(|| CalSyncError::BackendNotFound(backend_id.to_string()))
    }

    fn entry(&self, collection_id: &str) -> CalSyncResult<&CollectionEntry> {
        self.collections
            .get(collection_id)
            .ok_or_else(|| CalSyncError::CollectionNotFound(collection_id.to_string()))
    }

    fn entry_mut(&mut self, collection_id: &str) -> CalSyncResult<&mut CollectionEntry> {
        self.collections
            .get_mut(collection_id)
            .ok_or_else(|| CalSyncError::CollectionNotFound(collection_id.to_string()))
    }

    /// Attach a backend. The attachment list is persisted when the
    /// collection has a config directory, and a local backend is seeded
    /// with everything the collection already holds.
    pub fn attach(
        &mut self,
        collection_id: &str,
        backend: Arc<dyn Backend>,
        priority: i32,
        sync_on_open: bool,
    ) -> CalSyncResult<()> {
        let entry = self.entry_mut(collection_id)?;
        entry.insert(Attachment {
            backend: Arc::clone(&backend),
            priority,
            sync_on_open,
        });
        info!(
            collection = %collection_id,
            backend = %backend.id(),
            priority,
            "Backend attached"
        );

        persist(entry)?;

        if backend.kind() == BackendKind::Local {
            seed(backend.as_ref(), &entry.collection)?;
        }
        Ok(())
    }

    pub fn detach(&mut self, collection_id: &str, backend_id: &str) -> CalSyncResult<Arc<dyn Backend>> {
        let entry = self.entry_mut(collection_id)?;
        let position = entry
            .attachments
            .iter()
            .position(|a| a.backend.id() == backend_id)
            .ok_or_else(|| CalSyncError::BackendNotFound(backend_id.to_string()))?;
        let removed = entry.attachments.remove(position);

        entry.pending_discovery.remove(backend_id);
        entry.pending_items.retain(|(backend, _)| backend != backend_id);
        entry.settle();

        persist(entry)?;
        info!(collection = %collection_id, backend = %backend_id, "Backend detached");
        Ok(removed.backend)
    }

    /// Ask every eligible backend for the collection's calendars. Items are
    /// requested as calendars are discovered.
    pub fn load(&mut self, collection_id: &str) -> CalSyncResult<()> {
        let entry = self.entry_mut(collection_id)?;
        let backends = entry.eligible();
        if backends.is_empty() {
            return Err(CalSyncError::NoEligibleBackend(collection_id.to_string()));
        }

        entry.state = LoadState::CalendarsRequested;
        entry.pending_discovery = backends.iter().map(|b| b.id().to_string()).collect();
        info!(collection = %collection_id, backends = backends.len(), "Loading collection");

        for backend in backends {
            backend.load_calendars(collection_id);
        }
        Ok(())
    }

    /// Read the collection's attachment list from `<dir>/<collection_id>.toml`,
    /// build its backends and attach them. Nothing is created if the config
    /// or any backend is unusable.
    pub fn open_collection(&mut self, collection_id: &str, dir: &Path) -> CalSyncResult<&mut Collection> {
        let config = load_config(collection_id, dir)?;

        let mut attachments = Vec::with_capacity(config.backends.len());
        for BackendEntry {
            priority,
            sync_on_open,
            details,
        } in &config.backends
        {
            let backend = build_backend(details, self.sink.clone(), &self.settings)?;
            attachments.push(Attachment {
                backend,
                priority: *priority,
                sync_on_open: *sync_on_open,
            });
        }

        let mut entry = CollectionEntry::new(
            Collection::new(&config.id, &config.name),
            Some(dir.to_path_buf()),
        );
        for attachment in attachments {
            entry.insert(attachment);
        }
        info!(
            collection = %collection_id,
            backends = entry.attachments.len(),
            "Collection opened"
        );

        self.collections.insert(collection_id.to_string(), entry);
        self.collection_mut(collection_id)
            .ok_or_else(|| CalSyncError::CollectionNotFound(collection_id.to_string()))
    }

    /// Apply one backend event to the collection it concerns.
    pub fn handle_event(&mut self, event: &BackendEvent) {
        match event {
            BackendEvent::CalendarsLoaded {
                backend_id,
                collection_id,
                calendars,
            } => self.on_calendars_loaded(backend_id, collection_id, calendars),
            BackendEvent::ItemsLoaded {
                backend_id,
                calendar,
                items,
            } => self.on_items_loaded(backend_id, calendar, items),
            BackendEvent::DataLoaded {
                backend_id,
                calendar,
            } => {
                debug!(backend = %backend_id, calendar = %calendar.calendar_id, "Calendar data loaded");
                self.clear_pending_items(backend_id, calendar);
            }
            BackendEvent::ItemsStored {
                backend_id,
                calendar_id,
                item_ids,
            } => {
                debug!(
                    backend = %backend_id,
                    calendar = %calendar_id,
                    count = item_ids.len(),
                    "Items stored"
                );
            }
            BackendEvent::ErrorOccurred {
                backend_id,
                scope,
                message,
            } => {
                warn!(backend = %backend_id, ?scope, "{}", message);
                match scope {
                    ErrorScope::Discovery { collection_id } => {
                        if let Some(entry) = self.collections.get_mut(collection_id) {
                            entry.pending_discovery.remove(backend_id);
                        }
                    }
                    ErrorScope::Load(calendar) => self.clear_pending_items(backend_id, calendar),
                    ErrorScope::Store { .. } => {}
                }
            }
        }

        self.settle_all();
    }

    fn on_calendars_loaded(
        &mut self,
        backend_id: &str,
        collection_id: &str,
        calendars: &[CalendarMetadata],
    ) {
        let Some(entry) = self.collections.get_mut(collection_id) else {
            debug!(backend = %backend_id, collection = %collection_id, "Calendars for unknown collection");
            return;
        };
        entry.pending_discovery.remove(backend_id);

        let priority = entry.priority_of(backend_id);
        let (added, renamed) = entry.merge_calendars(priority, calendars);
        debug!(
            backend = %backend_id,
            collection = %collection_id,
            received = calendars.len(),
            added,
            renamed,
            "Calendars merged"
        );

        // Discovery run for a store does not pull items
        if !entry.is_loading() {
            return;
        }
        if entry.state == LoadState::CalendarsRequested {
            entry.state = LoadState::CalendarsDiscovered;
        }

        let empty: Vec<CalendarRef> = entry
            .collection
            .calendars()
            .iter()
            .filter(|calendar| calendar.is_empty())
            .map(|calendar| calendar.reference(collection_id))
            .collect();

        let mut requests = Vec::new();
        for backend in entry.eligible() {
            for calendar in &empty {
                let key = (backend.id().to_string(), calendar.calendar_id.clone());
                if entry.pending_items.insert(key) {
                    requests.push((Arc::clone(&backend), calendar.clone()));
                }
            }
        }

        if !requests.is_empty() {
            entry.state = LoadState::ItemsRequested;
        }
        for (backend, calendar) in requests {
            backend.load_items(&calendar);
        }
    }

    fn on_items_loaded(&mut self, backend_id: &str, calendar: &CalendarRef, items: &[CalendarItem]) {
        let Some(entry) = self.collections.get_mut(&calendar.collection_id) else {
            debug!(backend = %backend_id, collection = %calendar.collection_id, "Items for unknown collection");
            return;
        };

        let priority = entry.priority_of(backend_id);
        match entry.merge_items(priority, &calendar.calendar_id, items) {
            Ok((added, replaced)) => debug!(
                backend = %backend_id,
                calendar = %calendar.calendar_id,
                received = items.len(),
                added,
                replaced,
                "Items merged"
            ),
            Err(e) => warn!(backend = %backend_id, error = %e, "Dropping items"),
        }
    }

    fn clear_pending_items(&mut self, backend_id: &str, calendar: &CalendarRef) {
        if let Some(entry) = self.collections.get_mut(&calendar.collection_id) {
            entry
                .pending_items
                .remove(&(backend_id.to_string(), calendar.calendar_id.clone()));
        }
    }

    fn settle_all(&mut self) {
        for (id, entry) in &mut self.collections {
            if entry.settle() {
                info!(
                    collection = %id,
                    calendars = entry.collection.calendars().len(),
                    items = entry.collection.item_count(),
                    "Collection synced"
                );
            }
        }
    }

    /// Wait for the next backend event and apply it.
    pub async fn next_event(&mut self) -> Option<BackendEvent> {
        let event = self.events.recv().await?;
        self.handle_event(&event);
        Some(event)
    }

    /// Apply every event already queued. Returns how many were applied.
    pub fn drain(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(event) = self.events.try_recv() {
            self.handle_event(&event);
            applied += 1;
        }
        applied
    }

    /// Apply the next event, or give up after a short wait and re-check the
    /// job counters.
    async fn step(&mut self) {
        match tokio::time::timeout(IDLE_POLL, self.events.recv()).await {
            Ok(Some(event)) => self.handle_event(&event),
            Ok(None) => {}
            Err(_) => self.settle_all(),
        }
    }

    /// Drive the event loop until the collection is synced, starting a load
    /// first if none is running.
    pub async fn run_until_synced(&mut self, collection_id: &str) -> CalSyncResult<()> {
        if self.entry(collection_id)?.state == LoadState::Idle {
            self.load(collection_id)?;
        }

        loop {
            self.drain();
            if self.entry(collection_id)?.state == LoadState::SyncComplete {
                return Ok(());
            }
            self.step().await;
        }
    }

    /// Drive the event loop until no attached backend has work left.
    pub async fn run_until_idle(&mut self, collection_id: &str) -> CalSyncResult<()> {
        loop {
            self.drain();
            if self.entry(collection_id)?.backends_idle() {
                return Ok(());
            }
            self.step().await;
        }
    }
}

fn persist(entry: &CollectionEntry) -> CalSyncResult<()> {
    let Some(dir) = &entry.config_dir else {
        return Ok(());
    };
    let backends: Vec<BackendEntry> = entry.attachments.iter().map(Attachment::entry).collect();
    save_backend_config(entry.collection.id(), entry.collection.name(), &backends, dir)?;
    Ok(())
}

/// Copy the collection's current calendars and items into a backend.
fn seed(backend: &dyn Backend, collection: &Collection) -> CalSyncResult<()> {
    let calendars = collection.calendars();
    if calendars.is_empty() {
        return Ok(());
    }

    let metadata: Vec<CalendarMetadata> = calendars.iter().map(Calendar::metadata).collect();
    backend.store_calendars(collection.id(), &metadata)?;

    for calendar in calendars.iter().filter(|c| !c.is_empty()) {
        backend.store_items(&calendar.reference(collection.id()), calendar.items())?;
    }

    debug!(
        backend = %backend.id(),
        calendars = calendars.len(),
        items = collection.item_count(),
        "Seeded backend"
    );
    Ok(())
}
