//! Delta ledger: a durable log of local edits with linear undo/redo.
//!
//! Edits are staged into a pending buffer, grouped into commits, and
//! persisted as a JSON array in `<collection_id>.delta`. Pushing replays the
//! history into a backend; entries that fail stay for the next push.

mod entry;
mod session;

pub use entry::{Commit, DeltaEntry};
pub use session::{ApplyReport, Session, ledger_path};
