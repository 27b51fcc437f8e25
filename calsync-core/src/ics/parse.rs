//! ICS parsing using the icalendar crate's parser.

use chrono::{NaiveDateTime, Utc};
use icalendar::{
    DatePerhapsTime,
    parser::{Component, read_calendar, unfold},
};

use crate::model::{CalendarItem, ItemKind, ItemTime, Schedule};

/// Parse ICS content into a CalendarItem.
///
/// Returns `None` for empty content, malformed documents, documents without a
/// VEVENT or VTODO, and components missing a UID.
pub fn parse_item(content: &str) -> Option<CalendarItem> {
    if content.trim().is_empty() {
        return None;
    }

    let unfolded = unfold(content);
    let calendar = read_calendar(&unfolded).ok()?;
    let (kind, component) = calendar.components.iter().find_map(|c| {
        if c.name == "VEVENT" {
            Some((ItemKind::Event, c))
        } else if c.name == "VTODO" {
            Some((ItemKind::Todo, c))
        } else {
            None
        }
    })?;

    let uid = component.find_prop("UID")?.val.to_string();
    if uid.is_empty() {
        return None;
    }

    let summary = component
        .find_prop("SUMMARY")
        .map(|p| p.val.to_string())
        .unwrap_or_else(|| "(No title)".to_string());
    let description = component.find_prop("DESCRIPTION").map(|p| p.val.to_string());

    let categories: Vec<String> = component
        .properties
        .iter()
        .filter(|p| p.name == "CATEGORIES")
        .flat_map(|p| {
            p.val
                .as_ref()
                .split(',')
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect::<Vec<_>>()
        })
        .collect();

    let end_property = match kind {
        ItemKind::Event => "DTEND",
        ItemKind::Todo => "DUE",
    };

    let start = time_prop(component, "DTSTART");
    let end = time_prop(component, end_property);

    // Events need a start; to-dos may be undated
    if kind == ItemKind::Event && start.is_none() {
        return None;
    }

    let last_modified = component
        .find_prop("LAST-MODIFIED")
        .and_then(|p| parse_utc_stamp(p.val.as_ref()))
        .unwrap_or_else(Utc::now);

    Some(CalendarItem {
        id: uid,
        kind,
        schedule: Schedule {
            summary,
            description,
            categories,
            start,
            end,
        },
        etag: None,
        last_modified,
        dirty: false,
    })
}

fn time_prop(component: &Component<'_>, name: &str) -> Option<ItemTime> {
    component
        .find_prop(name)
        .and_then(|p| DatePerhapsTime::try_from(p).ok())
        .map(to_item_time)
}

/// Convert icalendar's DatePerhapsTime to our ItemTime, preserving timezone info
fn to_item_time(dpt: DatePerhapsTime) -> ItemTime {
    match dpt {
        DatePerhapsTime::Date(d) => ItemTime::Date(d),
        DatePerhapsTime::DateTime(cal_dt) => match cal_dt {
            icalendar::CalendarDateTime::Utc(dt) => ItemTime::DateTimeUtc(dt),
            icalendar::CalendarDateTime::Floating(naive) => ItemTime::DateTimeFloating(naive),
            icalendar::CalendarDateTime::WithTimezone { date_time, tzid } => {
                ItemTime::DateTimeZoned {
                    datetime: date_time,
                    tzid,
                }
            }
        },
    }
}

/// Parse `YYYYMMDDTHHMMSSZ`
fn parse_utc_stamp(value: &str) -> Option<chrono::DateTime<Utc>> {
    let trimmed = value.trim().trim_end_matches('Z');
    NaiveDateTime::parse_from_str(trimmed, "%Y%m%dT%H%M%S")
        .ok()
        .map(|dt| dt.and_utc())
}
