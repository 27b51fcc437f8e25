//! In-memory calendar data: collections own calendars, calendars own items.

mod calendar;
mod collection;
mod item;

pub use calendar::{Calendar, CalendarMetadata, CalendarRef};
pub use collection::{Collection, CollectionChange};
pub use item::{CalendarItem, ItemKind, ItemTime, Schedule};
