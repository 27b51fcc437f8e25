//! Calendar entries (events and to-dos).
//!
//! These types are backend-neutral. Backends convert whatever they store or
//! fetch into a [`CalendarItem`] through the iCalendar codec, and the ledger
//! serializes items back into the same canonical payload.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Event,
    Todo,
}

impl ItemKind {
    /// The iCalendar component name carrying this kind.
    pub fn component_name(&self) -> &'static str {
        match self {
            ItemKind::Event => "VEVENT",
            ItemKind::Todo => "VTODO",
        }
    }
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ItemKind::Event => write!(f, "event"),
            ItemKind::Todo => write!(f, "todo"),
        }
    }
}

/// A point in time as written in an iCalendar property, preserving its form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemTime {
    /// All-day value (VALUE=DATE)
    Date(NaiveDate),
    DateTimeUtc(DateTime<Utc>),
    DateTimeFloating(NaiveDateTime),
    DateTimeZoned {
        datetime: NaiveDateTime,
        tzid: String,
    },
}

impl ItemTime {
    pub fn is_date(&self) -> bool {
        matches!(self, ItemTime::Date(_))
    }

    /// Best-effort UTC instant, used for ordering only.
    pub fn to_utc(&self) -> Option<DateTime<Utc>> {
        match self {
            ItemTime::Date(d) => d.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc()),
            ItemTime::DateTimeUtc(dt) => Some(*dt),
            ItemTime::DateTimeFloating(dt) => Some(dt.and_utc()),
            ItemTime::DateTimeZoned { datetime, .. } => Some(datetime.and_utc()),
        }
    }
}

impl fmt::Display for ItemTime {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ItemTime::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            ItemTime::DateTimeUtc(dt) => write!(f, "{}", dt.format("%Y-%m-%d %H:%M UTC")),
            ItemTime::DateTimeFloating(dt) => write!(f, "{}", dt.format("%Y-%m-%d %H:%M")),
            ItemTime::DateTimeZoned { datetime, tzid } => {
                write!(f, "{} {}", datetime.format("%Y-%m-%d %H:%M"), tzid)
            }
        }
    }
}

/// Scheduling payload shared by events and to-dos.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Schedule {
    pub summary: String,
    pub description: Option<String>,
    pub categories: Vec<String>,
    pub start: Option<ItemTime>,
    /// DTEND for events, DUE for to-dos
    pub end: Option<ItemTime>,
}

impl Schedule {
    pub fn is_all_day(&self) -> bool {
        self.start.as_ref().is_some_and(ItemTime::is_date)
    }
}

/// A calendar entry owned by exactly one [`Calendar`](super::Calendar).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarItem {
    /// iCalendar UID; identical across backends for the same entry
    pub id: String,
    pub kind: ItemKind,
    pub schedule: Schedule,
    /// Opaque version tag supplied by the backend (e.g. an HTTP entity tag)
    pub etag: Option<String>,
    pub last_modified: DateTime<Utc>,
    /// Locally modified but not yet stored by any backend
    pub dirty: bool,
}

impl CalendarItem {
    pub fn new(id: impl Into<String>, kind: ItemKind, schedule: Schedule) -> Self {
        CalendarItem {
            id: id.into(),
            kind,
            schedule,
            etag: None,
            last_modified: Utc::now(),
            dirty: false,
        }
    }

    /// An event starting now, truncated to whole seconds.
    pub fn event(id: impl Into<String>, summary: impl Into<String>) -> Self {
        let now = Utc::now();
        let start = DateTime::from_timestamp(now.timestamp(), 0).unwrap_or(now);
        Self::new(
            id,
            ItemKind::Event,
            Schedule {
                summary: summary.into(),
                start: Some(ItemTime::DateTimeUtc(start)),
                ..Schedule::default()
            },
        )
    }

    pub fn todo(id: impl Into<String>, summary: impl Into<String>) -> Self {
        Self::new(
            id,
            ItemKind::Todo,
            Schedule {
                summary: summary.into(),
                ..Schedule::default()
            },
        )
    }

    pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = Some(etag.into());
        self
    }

    /// Record a local edit: bump the modification time and flag as dirty.
    pub fn touch(&mut self) {
        self.last_modified = Utc::now();
        self.dirty = true;
    }

    /// Mark as persisted, optionally adopting the backend's new version tag.
    pub fn mark_stored(&mut self, etag: Option<String>) {
        self.dirty = false;
        if etag.is_some() {
            self.etag = etag;
        }
    }
}

impl fmt::Display for CalendarItem {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({})", self.schedule.summary, self.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_day_follows_start_form() {
        let mut item = CalendarItem::event("e1", "Holiday");
        assert!(!item.schedule.is_all_day());
        assert!(item.schedule.start.is_some());

        item.schedule.start = Some(ItemTime::Date(
            NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
        ));
        assert!(item.schedule.is_all_day());
    }

    #[test]
    fn test_touch_and_mark_stored() {
        let mut item = CalendarItem::todo("t1", "Pay rent").with_etag("\"1\"");
        item.touch();
        assert!(item.dirty);

        item.mark_stored(None);
        assert!(!item.dirty);
        assert_eq!(item.etag.as_deref(), Some("\"1\""));

        item.mark_stored(Some("\"2\"".into()));
        assert_eq!(item.etag.as_deref(), Some("\"2\""));
    }

    #[test]
    fn test_clone_is_independent() {
        let original = CalendarItem::event("e1", "Standup");
        let mut copy = original.clone();
        copy.schedule.summary = "Retro".into();

        assert_eq!(original.schedule.summary, "Standup");
        assert_eq!(copy.id, original.id);
    }
}
