//! Live connections and their display names.
//!
//! Owned by the dispatcher and mutated nowhere else. Keys are connection ids,
//! so two connections may carry the same name.

use std::collections::HashMap;

use trackspace_core::ConnectionId;

use super::connection::ConnectionHandle;

struct Entry {
    handle: ConnectionHandle,
    /// Empty until the connection names itself.
    name: String,
}

#[derive(Default)]
pub struct Registry {
    entries: HashMap<ConnectionId, Entry>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection in the unnamed state. Returns `false` if the id is
    /// already present, leaving the existing entry untouched.
    pub fn insert(&mut self, handle: ConnectionHandle) -> bool {
        if self.entries.contains_key(handle.id()) {
            return false;
        }
        let _ = self.entries.insert(
            handle.id().clone(),
            Entry {
                handle,
                name: String::new(),
            },
        );
        true
    }

    /// Overwrite the name of a registered connection. Returns `false` if the
    /// connection is not registered.
    pub fn set_name(&mut self, id: &ConnectionId, name: &str) -> bool {
        match self.entries.get_mut(id) {
            Some(entry) => {
                name.clone_into(&mut entry.name);
                true
            }
            None => false,
        }
    }

    /// Remove a connection. Removing an absent id is a no-op returning `None`.
    pub fn remove(&mut self, id: &ConnectionId) -> Option<ConnectionHandle> {
        self.entries.remove(id).map(|entry| entry.handle)
    }

    pub fn get(&self, id: &ConnectionId) -> Option<&ConnectionHandle> {
        self.entries.get(id).map(|entry| &entry.handle)
    }

    pub fn name(&self, id: &ConnectionId) -> Option<&str> {
        self.entries.get(id).map(|entry| entry.name.as_str())
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every non-empty name, one per connection, sorted.
    pub fn connected_users(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .entries
            .values()
            .filter(|entry| !entry.name.is_empty())
            .map(|entry| entry.name.clone())
            .collect();
        names.sort_unstable();
        names
    }

    pub fn handles(&self) -> impl Iterator<Item = &ConnectionHandle> {
        self.entries.values().map(|entry| &entry.handle)
    }

    /// Remove every connection.
    pub fn drain(&mut self) -> Vec<ConnectionHandle> {
        self.entries.drain().map(|(_, entry)| entry.handle).collect()
    }
}
