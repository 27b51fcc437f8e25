//! ICS file generation.

use icalendar::{Calendar, Component, Property, ValueType};

use crate::error::CalSyncResult;
use crate::model::{CalendarItem, ItemKind, ItemTime};

/// Generate .ics content holding a single VEVENT or VTODO.
pub fn generate_ics(item: &CalendarItem) -> CalSyncResult<String> {
    let mut cal = Calendar::new();

    match item.kind {
        ItemKind::Event => {
            let mut event = icalendar::Event::new();
            fill_component(&mut event, item, "DTEND");
            cal.push(event.done());
        }
        ItemKind::Todo => {
            let mut todo = icalendar::Todo::new();
            fill_component(&mut todo, item, "DUE");
            cal.push(todo.done());
        }
    }

    let cal = cal.done();
    Ok(strip_ics_bloat(&cal.to_string()))
}

fn fill_component<C: Component>(component: &mut C, item: &CalendarItem, end_property: &str) {
    let stamp = item.last_modified.format("%Y%m%dT%H%M%SZ").to_string();

    component.add_property("UID", &item.id);
    component.add_property("SUMMARY", &item.schedule.summary);
    component.add_property("DTSTAMP", &stamp);
    component.add_property("LAST-MODIFIED", &stamp);

    if let Some(ref description) = item.schedule.description {
        component.add_property("DESCRIPTION", description);
    }

    if let Some(ref start) = item.schedule.start {
        add_time_property(component, "DTSTART", start);
    }
    if let Some(ref end) = item.schedule.end {
        add_time_property(component, end_property, end);
    }

    for category in &item.schedule.categories {
        component.append_multi_property(Property::new("CATEGORIES", category));
    }
}

/// Add a datetime property with proper formatting based on ItemTime variant
fn add_time_property<C: Component>(component: &mut C, name: &str, time: &ItemTime) {
    match time {
        ItemTime::Date(d) => {
            let mut prop = Property::new(name, d.format("%Y%m%d").to_string());
            prop.append_parameter(ValueType::Date);
            component.append_property(prop);
        }
        ItemTime::DateTimeUtc(dt) => {
            component.add_property(name, dt.format("%Y%m%dT%H%M%SZ").to_string());
        }
        ItemTime::DateTimeFloating(dt) => {
            component.add_property(name, dt.format("%Y%m%dT%H%M%S").to_string());
        }
        ItemTime::DateTimeZoned { datetime, tzid } => {
            let mut prop = Property::new(name, datetime.format("%Y%m%dT%H%M%S").to_string());
            prop.add_parameter("TZID", tzid);
            component.append_property(prop);
        }
    }
}

/// Clean up ICS output from the icalendar crate
/// - Replace PRODID with CALSYNC
/// - Remove CALSCALE:GREGORIAN (it's the default)
fn strip_ics_bloat(ics: &str) -> String {
    let mut result = String::with_capacity(ics.len());

    for line in ics.lines() {
        if line.starts_with("PRODID:") {
            result.push_str("PRODID:CALSYNC\r\n");
            continue;
        }
        if line == "CALSCALE:GREGORIAN" {
            continue;
        }
        result.push_str(line);
        result.push_str("\r\n");
    }

    result
}
