use std::collections::HashMap;

use crate::message::Message;

#[derive(Debug, Clone, PartialEq)]
enum Slot {
    Live(Message),
    /// Dismissed locally; the key is kept so re-delivery stays a no-op.
    Tombstone,
}

/// Time-ordered view of the live messages plus the unread count.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub messages: Vec<Message>,
    pub unread: u64,
}

impl Snapshot {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn uuids(&self) -> Vec<&str> {
        self.messages.iter().map(|m| m.uuid.as_str()).collect()
    }
}

/// Identity-keyed message cache. Only the channel mutates it.
#[derive(Debug, Default)]
pub struct MessageStore {
    entries: HashMap<String, Slot>,
    unread: u64,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unread(&self) -> u64 {
        self.unread
    }

    /// True when the identity is known, live or tombstoned.
    pub fn contains(&self, uuid: &str) -> bool {
        self.entries.contains_key(uuid)
    }

    pub fn get(&self, uuid: &str) -> Option<&Message> {
        match self.entries.get(uuid) {
            Some(Slot::Live(message)) => Some(message),
            _ => None,
        }
    }

    pub fn is_tombstoned(&self, uuid: &str) -> bool {
        matches!(self.entries.get(uuid), Some(Slot::Tombstone))
    }

    /// Total number of keys, tombstones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn snapshot(&self) -> Snapshot {
        let mut messages: Vec<Message> = self
            .entries
            .values()
            .filter_map(|slot| match slot {
                Slot::Live(message) => Some(message.clone()),
                Slot::Tombstone => None,
            })
            .collect();
        messages.sort_by(|a, b| a.time.cmp(&b.time).then_with(|| a.uuid.cmp(&b.uuid)));
        Snapshot {
            messages,
            unread: self.unread,
        }
    }

    /// Inserts the message unless its identity is already known.
    /// Returns the stored message when it was new.
    pub(crate) fn insert_if_new(&mut self, message: Message) -> Option<&Message> {
        use std::collections::hash_map::Entry;

        match self.entries.entry(message.uuid.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => match slot.insert(Slot::Live(message)) {
                Slot::Live(stored) => Some(&*stored),
                Slot::Tombstone => None,
            },
        }
    }

    /// Turns a live message into a tombstone. Returns false if it was not live.
    pub(crate) fn tombstone(&mut self, uuid: &str) -> bool {
        match self.entries.get_mut(uuid) {
            Some(slot @ Slot::Live(_)) => {
                *slot = Slot::Tombstone;
                true
            }
            _ => false,
        }
    }

    /// Drops the key entirely, live or tombstoned.
    pub(crate) fn remove(&mut self, uuid: &str) -> bool {
        self.entries.remove(uuid).is_some()
    }

    pub(crate) fn set_unread(&mut self, unread: u64) {
        self.unread = unread;
    }

    pub(crate) fn decrement_unread(&mut self) {
        self.unread = self.unread.saturating_sub(1);
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
        self.unread = 0;
    }
}
