//! Backends: pluggable providers of calendar metadata and items.
//!
//! Every backend reports results on the orchestrator's event channel rather
//! than through return values, so an immediate local store and an
//! asynchronous remote one look the same to the caller.

pub mod local;
pub mod remote;

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::{BackendDetails, Settings};
use crate::error::CalSyncResult;
use crate::model::{CalendarItem, CalendarMetadata, CalendarRef};

pub use local::LocalBackend;
pub use remote::{CalDavClient, DavTransport, RemoteBackend, RemoteOptions};

/// Sending half of the channel every backend publishes its events on.
pub type EventSink = mpsc::UnboundedSender<BackendEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Local,
    Remote,
}

/// What a failed operation was doing, so the receiver can settle its
/// bookkeeping for exactly that operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorScope {
    Discovery { collection_id: String },
    Load(CalendarRef),
    /// `item_ids` is empty when the failure concerns the calendar itself
    Store {
        calendar_id: String,
        item_ids: Vec<String>,
    },
}

#[derive(Debug, Clone)]
pub enum BackendEvent {
    CalendarsLoaded {
        backend_id: String,
        collection_id: String,
        calendars: Vec<CalendarMetadata>,
    },
    ItemsLoaded {
        backend_id: String,
        calendar: CalendarRef,
        items: Vec<CalendarItem>,
    },
    /// A calendar finished loading; always follows its `ItemsLoaded`.
    DataLoaded {
        backend_id: String,
        calendar: CalendarRef,
    },
    ItemsStored {
        backend_id: String,
        calendar_id: String,
        item_ids: Vec<String>,
    },
    ErrorOccurred {
        backend_id: String,
        scope: ErrorScope,
        message: String,
    },
}

impl BackendEvent {
    pub fn backend_id(&self) -> &str {
        match self {
            BackendEvent::CalendarsLoaded { backend_id, .. }
            | BackendEvent::ItemsLoaded { backend_id, .. }
            | BackendEvent::DataLoaded { backend_id, .. }
            | BackendEvent::ItemsStored { backend_id, .. }
            | BackendEvent::ErrorOccurred { backend_id, .. } => backend_id,
        }
    }
}

/// The capability contract shared by every backend.
///
/// `load_*` never report through their return value: results and failures
/// arrive later as [`BackendEvent`]s. `store_*` and `update_item` return an
/// error only when the request could not be accepted at all.
pub trait Backend: Send + Sync {
    fn id(&self) -> &str;

    fn kind(&self) -> BackendKind;

    /// Connection parameters, used when persisting attachments.
    fn details(&self) -> BackendDetails;

    fn load_calendars(&self, collection_id: &str);

    fn load_items(&self, calendar: &CalendarRef);

    fn store_calendars(
        &self,
        collection_id: &str,
        calendars: &[CalendarMetadata],
    ) -> CalSyncResult<()>;

    fn store_items(&self, calendar: &CalendarRef, items: &[CalendarItem]) -> CalSyncResult<()>;

    fn update_item(&self, calendar_id: &str, item_id: &str, payload: &str) -> CalSyncResult<()>;

    /// Jobs accepted but not yet finished.
    fn active_jobs(&self) -> usize {
        0
    }
}

/// Build a backend from its persisted connection parameters.
///
/// Remote backends spawn their worker task, so this must run inside a tokio
/// runtime.
pub fn build_backend(
    details: &BackendDetails,
    events: EventSink,
    settings: &Settings,
) -> CalSyncResult<Arc<dyn Backend>> {
    match details {
        BackendDetails::Local { root_path } => {
            let root = shellexpand::tilde(&root_path.to_string_lossy()).into_owned();
            Ok(Arc::new(LocalBackend::new(root, events)))
        }
        BackendDetails::Caldav {
            server_url,
            username,
            password,
        } => {
            let client = CalDavClient::new(server_url, username, password)?;
            let options = RemoteOptions {
                stage_timeout: settings.stage_timeout(),
            };
            Ok(Arc::new(RemoteBackend::spawn(
                details.clone(),
                client,
                events,
                options,
            )?))
        }
    }
}
