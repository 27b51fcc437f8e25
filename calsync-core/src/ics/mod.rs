//! iCalendar (RFC 5545) codec for calendar items.
//!
//! This is the canonical payload format: remote fetch results, local `.ics`
//! files and ledger entries all carry one VEVENT or VTODO per document.

mod generate;
mod parse;

pub use generate::generate_ics;
pub use parse::parse_item;
