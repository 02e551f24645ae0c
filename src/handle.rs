//! Handle table: small integer handles naming closable resources.

use std::collections::HashMap;

use crate::error::{Error, Result};

/// Opaque identifier for an open coroutine.
///
/// Unique among currently-open handles; never reused while its resource is
/// live, eligible for reuse after close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(pub(crate) u32);

/// Id 0 names the bootstrap context and is never handed to callers.
pub(crate) const ROOT_ID: u32 = 0;

/// Id-to-resource map with a wrapping next-id allocator.
pub(crate) struct HandleTable<T> {
    slots: HashMap<u32, T>,
    next: u32,
    limit: usize,
}

impl<T> HandleTable<T> {
    /// `limit` caps the number of simultaneously open slots (the bootstrap
    /// slot counts toward it).
    pub(crate) fn new(limit: usize) -> Self {
        HandleTable {
            slots: HashMap::new(),
            next: ROOT_ID + 1,
            limit: limit.min(u32::MAX as usize),
        }
    }

    /// Register the bootstrap context at its reserved id.
    pub(crate) fn insert_root(&mut self, value: T) {
        let prev = self.slots.insert(ROOT_ID, value);
        debug_assert!(prev.is_none(), "bootstrap slot registered twice");
    }

    /// Store `value` under the next id not currently in use.
    pub(crate) fn insert(&mut self, value: T) -> Result<u32> {
        if self.slots.len() >= self.limit {
            return Err(Error::ResourceExhausted);
        }
        // The occupancy check above guarantees a free id exists, so the scan
        // terminates.
        while self.next == ROOT_ID || self.slots.contains_key(&self.next) {
            self.next = self.next.wrapping_add(1);
        }
        let id = self.next;
        self.next = self.next.wrapping_add(1);
        self.slots.insert(id, value);
        Ok(id)
    }

    pub(crate) fn get_mut(&mut self, id: u32) -> Option<&mut T> {
        self.slots.get_mut(&id)
    }

    /// Remove the mapping; the id becomes eligible for reuse.
    pub(crate) fn remove(&mut self, id: u32) -> Option<T> {
        self.slots.remove(&id)
    }

    /// Number of open user handles; the bootstrap slot doesn't count.
    pub(crate) fn open_handles(&self) -> usize {
        self.slots.len() - usize::from(self.slots.contains_key(&ROOT_ID))
    }
}
