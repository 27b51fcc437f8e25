//! Core of calsync.
//!
//! - `model`: collections, calendars and items held in memory
//! - `backend`: local directory and CalDAV providers behind one trait
//! - `orchestrator`: attaches backends to collections and merges what they load
//! - `ledger`: durable edit history with undo/redo and replay into a backend

pub mod backend;
pub mod config;
pub mod error;
pub mod ics;
pub mod ledger;
pub mod model;
pub mod orchestrator;
pub mod utils;

pub use backend::{Backend, BackendEvent, BackendKind, ErrorScope, EventSink, build_backend};
pub use config::{BackendDetails, BackendEntry, CollectionConfig, Settings};
pub use error::{CalSyncError, CalSyncResult};
pub use ledger::{ApplyReport, Commit, DeltaEntry, Session};
pub use model::{Calendar, CalendarItem, CalendarMetadata, CalendarRef, Collection, ItemKind};
pub use orchestrator::{Attachment, LoadState, Orchestrator};
