//! Page-scoped service cache.
//!
//! Blocks publish their request state here under their schema uid so that
//! other parts of the page (action bars, detail drawers) can read the latest
//! result without issuing a request of their own. Last write wins.

use super::RequestState;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;

struct CacheEntry {
    state: RequestState,
    /// Write counter at the time of the write.
    version: u64,
}

#[derive(Default)]
pub struct ServiceCache {
    entries: RefCell<HashMap<String, CacheEntry>>,
    writes: Cell<u64>,
}

impl fmt::Debug for ServiceCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceCache")
            .field("entries", &self.len())
            .field("writes", &self.writes.get())
            .finish()
    }
}

impl ServiceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, uid: &str) -> Option<RequestState> {
        self.entries.borrow().get(uid).map(|e| e.state.clone())
    }

    /// Version of the entry under `uid`; grows with every write to the cache.
    pub fn version(&self, uid: &str) -> Option<u64> {
        self.entries.borrow().get(uid).map(|e| e.version)
    }

    pub fn set(&self, uid: impl Into<String>, state: RequestState) {
        let version = self.writes.get() + 1;
        self.writes.set(version);
        self.entries
            .borrow_mut()
            .insert(uid.into(), CacheEntry { state, version });
    }

    pub fn remove(&self, uid: &str) -> Option<RequestState> {
        self.entries.borrow_mut().remove(uid).map(|e| e.state)
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }
}
