//! A named group of calendars and the change notifications it publishes.

use std::collections::{HashMap, HashSet};

use tokio::sync::broadcast;

use crate::error::{CalSyncError, CalSyncResult};
use crate::model::calendar::Calendar;
use crate::model::item::CalendarItem;

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Emitted on every mutation of a collection or one of its calendars.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectionChange {
    CalendarAdded { calendar_id: String },
    CalendarRenamed { calendar_id: String },
    CalendarRemoved { calendar_id: String },
    ItemAdded { calendar_id: String, item_id: String },
    ItemUpdated { calendar_id: String, item_id: String },
    ItemRemoved { calendar_id: String, item_id: String },
}

#[derive(Debug)]
pub struct Collection {
    id: String,
    name: String,
    calendars: Vec<Calendar>,
    index: HashMap<String, usize>,
    changes: broadcast::Sender<CollectionChange>,
}

impl Collection {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Collection {
            id: id.into(),
            name: name.into(),
            calendars: Vec::new(),
            index: HashMap::new(),
            changes,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Receive every change made from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<CollectionChange> {
        self.changes.subscribe()
    }

    fn notify(&self, change: CollectionChange) {
        // No subscribers is fine
        let _ = self.changes.send(change);
    }

    pub fn calendars(&self) -> &[Calendar] {
        &self.calendars
    }

    pub fn calendar(&self, id: &str) -> Option<&Calendar> {
        self.index.get(id).map(|&i| &self.calendars[i])
    }

    fn calendar_mut(&mut self, id: &str) -> CalSyncResult<&mut Calendar> {
        let i = *self
            .index
            .get(id)
            .ok_or_else(|| CalSyncError::CalendarNotFound(id.to_string()))?;
        Ok(&mut self.calendars[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn calendar_ids(&self) -> HashSet<&str> {
        self.index.keys().map(String::as_str).collect()
    }

    pub fn item_count(&self) -> usize {
        self.calendars.iter().map(Calendar::len).sum()
    }

    /// Add a calendar unless one with the same id exists. First writer wins.
    pub fn add_calendar(&mut self, calendar: Calendar) -> bool {
        if self.index.contains_key(calendar.id()) {
            return false;
        }
        let calendar_id = calendar.id().to_string();
        self.index.insert(calendar_id.clone(), self.calendars.len());
        self.calendars.push(calendar);
        self.notify(CollectionChange::CalendarAdded { calendar_id });
        true
    }

    /// Returns false if the calendar already has that name.
    pub fn rename_calendar(&mut self, id: &str, name: &str) -> CalSyncResult<bool> {
        let calendar = self.calendar_mut(id)?;
        if calendar.name() == name {
            return Ok(false);
        }
        calendar.set_name(name);
        self.notify(CollectionChange::CalendarRenamed {
            calendar_id: id.to_string(),
        });
        Ok(true)
    }

    pub fn remove_calendar(&mut self, id: &str) -> Option<Calendar> {
        let position = self.index.remove(id)?;
        let removed = self.calendars.remove(position);
        for calendar in &self.calendars[position..] {
            if let Some(slot) = self.index.get_mut(calendar.id()) {
                *slot -= 1;
            }
        }
        self.notify(CollectionChange::CalendarRemoved {
            calendar_id: id.to_string(),
        });
        Some(removed)
    }

    pub fn add_item(&mut self, calendar_id: &str, item: CalendarItem) -> CalSyncResult<bool> {
        let item_id = item.id.clone();
        let added = self.calendar_mut(calendar_id)?.add_item(item);
        if added {
            self.notify(CollectionChange::ItemAdded {
                calendar_id: calendar_id.to_string(),
                item_id,
            });
        }
        Ok(added)
    }

    pub fn update_item(&mut self, calendar_id: &str, item: CalendarItem) -> CalSyncResult<bool> {
        let item_id = item.id.clone();
        let updated = self.calendar_mut(calendar_id)?.update_item(item);
        if updated {
            self.notify(CollectionChange::ItemUpdated {
                calendar_id: calendar_id.to_string(),
                item_id,
            });
        }
        Ok(updated)
    }

    pub fn remove_item(
        &mut self,
        calendar_id: &str,
        item_id: &str,
    ) -> CalSyncResult<Option<CalendarItem>> {
        let removed = self.calendar_mut(calendar_id)?.remove_item(item_id);
        if removed.is_some() {
            self.notify(CollectionChange::ItemRemoved {
                calendar_id: calendar_id.to_string(),
                item_id: item_id.to_string(),
            });
        }
        Ok(removed)
    }

    /// Append the items whose ids are new to the calendar; returns how many
    /// were added.
    pub fn merge_items(
        &mut self,
        calendar_id: &str,
        items: impl IntoIterator<Item = CalendarItem>,
    ) -> CalSyncResult<usize> {
        let added = self.calendar_mut(calendar_id)?.merge_items(items);
        let count = added.len();
        for item_id in added {
            self.notify(CollectionChange::ItemAdded {
                calendar_id: calendar_id.to_string(),
                item_id,
            });
        }
        Ok(count)
    }
}
