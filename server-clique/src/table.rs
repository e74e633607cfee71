//! In-memory command table shared by the worker pool.
//!
//! Entries live in one growable vector in slot order, with a side map from key
//! to slot for constant-time lookups. Both structures sit behind a single
//! `RwLock`, so readers never see the map and the vector disagree.

use std::{
    collections::HashMap,
    sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::SystemTime,
};

use clap::ValueEnum;

use crate::command::{TableEntry, unix_nanos};

/// Ordering used by [`CommandTable::list_all`].
///
/// Fixed when the table is built, so every observer in a run sees the same
/// order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum ListOrder {
    /// Slot order: first insertion of each key, unaffected by overwrites.
    #[default]
    Slot,
    /// Ascending by the timestamp of the latest write, ties in slot order.
    Timestamp,
}

#[derive(Debug, Default)]
struct Slots {
    entries: Vec<TableEntry>,
    index: HashMap<String, usize>,
}

/// Thread-safe key/value table with deterministic enumeration.
///
/// `add` and `remove` take the write lock, `get` and `list_all` take the read
/// lock, so any number of lookups may run in parallel while mutations are
/// exclusive.
#[derive(Debug, Default)]
pub struct CommandTable {
    order: ListOrder,
    slots: RwLock<Slots>,
}

impl CommandTable {
    /// Creates an empty table listing entries in slot order.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty table with the given listing order.
    pub fn with_order(order: ListOrder) -> Self {
        Self {
            order,
            slots: RwLock::default(),
        }
    }

    pub fn order(&self) -> ListOrder {
        self.order
    }

    /// Inserts `key`, or overwrites its value and timestamp in place.
    ///
    /// An overwrite keeps the entry's slot.
    pub fn add(&self, key: impl Into<String>, value: impl Into<String>, timestamp: SystemTime) {
        let entry = TableEntry {
            key: key.into(),
            value: value.into(),
            timestamp: unix_nanos(timestamp),
        };

        let mut guard = self.write();
        let Slots { entries, index } = &mut *guard;
        match index.get(&entry.key) {
            Some(&slot) => entries[slot] = entry,
            None => {
                index.insert(entry.key.clone(), entries.len());
                entries.push(entry);
            }
        }
    }

    /// Removes `key` and returns whether it was present.
    ///
    /// Every entry after the removed slot shifts down by one and its index is
    /// repaired before the write lock is released.
    pub fn remove(&self, key: &str) -> bool {
        let mut guard = self.write();
        let Slots { entries, index } = &mut *guard;

        let Some(slot) = index.remove(key) else {
            return false;
        };
        entries.remove(slot);
        for (position, entry) in entries.iter().enumerate().skip(slot) {
            if let Some(recorded) = index.get_mut(&entry.key) {
                *recorded = position;
            }
        }
        true
    }

    /// Returns the current value for `key`, if any.
    pub fn get(&self, key: &str) -> Option<String> {
        let guard = self.read();
        guard
            .index
            .get(key)
            .map(|&slot| guard.entries[slot].value.clone())
    }

    /// Returns an independent copy of every entry in the table's order.
    pub fn list_all(&self) -> Vec<TableEntry> {
        let mut snapshot = self.read().entries.clone();
        if self.order == ListOrder::Timestamp {
            snapshot.sort_by_key(|entry| entry.timestamp);
        }
        snapshot
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Mutations never unwind between the vector and index updates, so a
    // poisoned lock still guards consistent slots.
    fn read(&self) -> RwLockReadGuard<'_, Slots> {
        self.slots.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Slots> {
        self.slots.write().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    fn assert_consistent(&self) {
        let guard = self.read();
        assert_eq!(guard.entries.len(), guard.index.len());
        for (slot, entry) in guard.entries.iter().enumerate() {
            assert_eq!(guard.index.get(&entry.key), Some(&slot), "{}", entry.key);
        }
    }
}
