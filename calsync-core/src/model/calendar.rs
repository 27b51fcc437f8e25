//! A single logical calendar and the items it owns.

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::model::item::CalendarItem;

/// Identifier + display name, as reported by a backend during discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarMetadata {
    pub id: String,
    pub name: String,
}

impl CalendarMetadata {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        CalendarMetadata {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// Enough to address a calendar from a backend without borrowing the collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CalendarRef {
    pub collection_id: String,
    pub calendar_id: String,
    pub name: String,
}

/// Ordered items, unique by id. Iteration order is insertion order.
#[derive(Debug, Clone, Default)]
pub struct Calendar {
    id: String,
    name: String,
    items: Vec<CalendarItem>,
    index: HashMap<String, usize>,
}

impl Calendar {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Calendar {
            id: id.into(),
            name: name.into(),
            items: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn from_metadata(metadata: &CalendarMetadata) -> Self {
        Self::new(&metadata.id, &metadata.name)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn metadata(&self) -> CalendarMetadata {
        CalendarMetadata::new(&self.id, &self.name)
    }

    pub fn reference(&self, collection_id: &str) -> CalendarRef {
        CalendarRef {
            collection_id: collection_id.to_string(),
            calendar_id: self.id.clone(),
            name: self.name.clone(),
        }
    }

    pub fn items(&self) -> &[CalendarItem] {
        &self.items
    }

    pub fn item(&self, id: &str) -> Option<&CalendarItem> {
        self.index.get(id).map(|&i| &self.items[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn item_ids(&self) -> HashSet<&str> {
        self.index.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Append an item. Returns false (and leaves the calendar untouched) if
    /// an item with the same id is already present.
    pub fn add_item(&mut self, item: CalendarItem) -> bool {
        if self.index.contains_key(&item.id) {
            return false;
        }
        self.index.insert(item.id.clone(), self.items.len());
        self.items.push(item);
        true
    }

    /// Replace an existing item in place. Returns false if the id is unknown.
    pub fn update_item(&mut self, item: CalendarItem) -> bool {
        match self.index.get(&item.id) {
            Some(&i) => {
                self.items[i] = item;
                true
            }
            None => false,
        }
    }

    pub fn remove_item(&mut self, id: &str) -> Option<CalendarItem> {
        let position = self.index.remove(id)?;
        let removed = self.items.remove(position);

        // Items after the removed one shifted left by one
        for item in &self.items[position..] {
            if let Some(slot) = self.index.get_mut(&item.id) {
                *slot -= 1;
            }
        }

        Some(removed)
    }

    /// Append every item whose id is not yet present. Returns the ids added,
    /// in order. Merging the same items twice adds nothing the second time.
    pub fn merge_items(&mut self, items: impl IntoIterator<Item = CalendarItem>) -> Vec<String> {
        let mut added = Vec::new();
        for item in items {
            let id = item.id.clone();
            if self.add_item(item) {
                added.push(id);
            }
        }
        added
    }
}

impl fmt::Display for Calendar {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}
