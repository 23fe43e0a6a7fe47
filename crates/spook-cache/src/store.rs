#![forbid(unsafe_code)]

//! The shared key-value store abstraction and an in-memory multi-instance
//! implementation.
//!
//! The cache coordinates instances (browser tabs, frames, processes)
//! through a shared string store with change events. [`SharedStore`] is
//! that seam; [`MemoryHub`] provides the test/simulation implementation:
//! one hub is the shared backing, and each [`MemoryStore`] obtained from
//! [`join`](MemoryHub::join) acts as one instance. Change events are
//! delivered to every instance **except the writer**, matching cross-tab
//! storage-event semantics.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::{Rc, Weak};

use thiserror::Error;

/// A storage backend failed.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage backend failure: {0}")]
    Backend(String),
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// A key change observed from a peer instance. `new_value` is `None` for a
/// deletion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEvent {
    pub key: String,
    pub new_value: Option<String>,
}

/// Unsubscribes its observer when dropped.
pub struct StoreWatch {
    cancel: Option<Box<dyn FnOnce()>>,
}

impl StoreWatch {
    pub fn new(cancel: impl FnOnce() + 'static) -> StoreWatch {
        StoreWatch {
            cancel: Some(Box::new(cancel)),
        }
    }
}

impl Drop for StoreWatch {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for StoreWatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreWatch").finish_non_exhaustive()
    }
}

/// A shared string-keyed store with change events, as seen by one instance.
pub trait SharedStore {
    fn get(&self, key: &str) -> StoreResult<Option<String>>;

    fn set(&self, key: &str, value: &str) -> StoreResult<()>;

    fn remove(&self, key: &str) -> StoreResult<()>;

    /// Observe changes made by *peer* instances. The observer must treat
    /// events idempotently: delivery is best-effort.
    fn watch(&self, observer: Rc<dyn Fn(&StoreEvent)>) -> StoreWatch;
}

struct HubWatcher {
    id: u64,
    instance: u64,
    observer: Rc<dyn Fn(&StoreEvent)>,
}

#[derive(Default)]
struct HubState {
    entries: BTreeMap<String, String>,
    watchers: Vec<HubWatcher>,
    next_instance: u64,
    next_watcher: u64,
}

impl HubState {
    fn observers_except(&self, writer: u64) -> Vec<Rc<dyn Fn(&StoreEvent)>> {
        self.watchers
            .iter()
            .filter(|watcher| watcher.instance != writer)
            .map(|watcher| Rc::clone(&watcher.observer))
            .collect()
    }
}

/// The shared backing behind a set of [`MemoryStore`] instances.
#[derive(Clone, Default)]
pub struct MemoryHub {
    state: Rc<RefCell<HubState>>,
}

impl MemoryHub {
    #[must_use]
    pub fn new() -> MemoryHub {
        MemoryHub::default()
    }

    /// Join the hub as a new instance.
    #[must_use]
    pub fn join(&self) -> MemoryStore {
        let instance = {
            let mut state = self.state.borrow_mut();
            let instance = state.next_instance;
            state.next_instance += 1;
            instance
        };
        MemoryStore {
            state: Rc::clone(&self.state),
            instance,
        }
    }

    /// Number of stored keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.borrow().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.borrow().entries.is_empty()
    }

    /// Direct read, bypassing any instance (for assertions).
    #[must_use]
    pub fn peek(&self, key: &str) -> Option<String> {
        self.state.borrow().entries.get(key).cloned()
    }
}

/// One instance's handle onto a [`MemoryHub`].
pub struct MemoryStore {
    state: Rc<RefCell<HubState>>,
    instance: u64,
}

impl MemoryStore {
    fn broadcast(&self, key: &str, new_value: Option<String>) {
        let observers = self.state.borrow().observers_except(self.instance);
        if observers.is_empty() {
            return;
        }
        let event = StoreEvent {
            key: key.to_owned(),
            new_value,
        };
        for observer in observers {
            observer(&event);
        }
    }
}

impl SharedStore for MemoryStore {
    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.state.borrow().entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        let changed = {
            let mut state = self.state.borrow_mut();
            state.entries.insert(key.to_owned(), value.to_owned()) != Some(value.to_owned())
        };
        if changed {
            self.broadcast(key, Some(value.to_owned()));
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> StoreResult<()> {
        let existed = self.state.borrow_mut().entries.remove(key).is_some();
        if existed {
            self.broadcast(key, None);
        }
        Ok(())
    }

    fn watch(&self, observer: Rc<dyn Fn(&StoreEvent)>) -> StoreWatch {
        let id = {
            let mut state = self.state.borrow_mut();
            let id = state.next_watcher;
            state.next_watcher += 1;
            state.watchers.push(HubWatcher {
                id,
                instance: self.instance,
                observer,
            });
            id
        };
        let weak: Weak<RefCell<HubState>> = Rc::downgrade(&self.state);
        StoreWatch::new(move || {
            if let Some(state) = weak.upgrade() {
                state.borrow_mut().watchers.retain(|w| w.id != id);
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
