#![forbid(unsafe_code)]

//! One-owner-per-UUID coordination over a shared store.
//!
//! # Design
//!
//! Cells that share a UUID are *mirrors* of one logical value. Within an
//! instance, at most one of them (the **primary**) actually drives
//! computation; the rest passively mirror. Across instances, at most one
//! instance (the **owner**) runs a primary at all: ownership is claimed by
//! writing the instance's session id under `owner.<uuid>`, claim-if-absent.
//! Everyone else follows `value.<uuid>` through storage change events.
//!
//! UUIDs under the configured *defer prefix* are not owned locally at all:
//! their computation is delegated to a parent frame through a
//! [`ParentLink`], and values flow back via
//! [`parent_update`](SharedCache::parent_update).
//!
//! # Storage layout
//!
//! - `value.<uuid>`: the serialised last-known value (per-UUID codec);
//! - `owner.<uuid>`: the 8-hex-char session id of the owning instance.
//!
//! # Failure Modes
//!
//! - **Double owner**: claim-if-absent admits a brief window where two
//!   instances both believe they own a UUID. Storage events resolve it: a
//!   foreign claim demotes, an owner-key deletion re-elects. Consumers must
//!   treat mirrored updates idempotently.
//! - **Accounting drift** (owned without primary and the like) is logged
//!   and repaired through [`ensure_active`](SharedCache::ensure_active).

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use spook::{CacheBridge, CacheLink, Cell, Codec, Value};

use crate::store::{SharedStore, StoreEvent, StoreWatch};

fn value_key(uuid: &str) -> String {
    format!("value.{uuid}")
}

fn owner_key(uuid: &str) -> String {
    format!("owner.{uuid}")
}

/// The edge to a parent frame for deferred UUIDs.
pub trait ParentLink {
    fn use_uuid(&self, uuid: &str);
    fn drop_uuid(&self, uuid: &str);
}

/// Tunables for a cache instance.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// UUIDs with this prefix are delegated to the parent frame instead of
    /// being owned locally (once a parent link is attached).
    pub defer_prefix: Option<String>,
    /// Keep a primary's driver warm after its last user leaves, so a quick
    /// reactivation does not tear down and reopen its resources. See
    /// [`SharedCache::purge_cold`].
    pub retain_cold: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            defer_prefix: None,
            retain_cold: true,
        }
    }
}

struct Registration {
    primary: Option<Cell>,
    users: Vec<Cell>,
    owned: bool,
    deferred: bool,
    codec: Rc<dyn Codec>,
}

impl Registration {
    fn is_primary(&self, cell: &Cell) -> bool {
        self.primary.as_ref().is_some_and(|p| p.ptr_eq(cell))
    }

    fn removable(&self) -> bool {
        self.primary.is_none() && !self.deferred && self.users.is_empty()
    }
}

/// One instance's shared-cache coordinator.
///
/// Constructed as `Rc<SharedCache>`; cells join through
/// [`identify`](SharedCache::identify), which hands out the [`CacheLink`]
/// their constructor takes.
pub struct SharedCache {
    session: String,
    store: Rc<dyn SharedStore>,
    config: RefCell<CacheConfig>,
    regs: RefCell<BTreeMap<String, Registration>>,
    parent: RefCell<Option<Rc<dyn ParentLink>>>,
    // Held for its Drop; the subscription dies with the cache.
    _watch: RefCell<Option<StoreWatch>>,
}

enum Activation {
    Nothing,
    Defer,
    Elect,
}

impl SharedCache {
    /// Join the shared store with a fresh random session identity.
    #[must_use]
    pub fn new(store: Rc<dyn SharedStore>, config: CacheConfig) -> Rc<SharedCache> {
        let session = format!("{:08x}", rand::random::<u32>());
        let cache = Rc::new(SharedCache {
            session,
            store: Rc::clone(&store),
            config: RefCell::new(config),
            regs: RefCell::new(BTreeMap::new()),
            parent: RefCell::new(None),
            _watch: RefCell::new(None),
        });
        let weak = Rc::downgrade(&cache);
        let watch = store.watch(Rc::new(move |event: &StoreEvent| {
            if let Some(cache) = weak.upgrade() {
                cache.on_store_event(event);
            }
        }));
        *cache._watch.borrow_mut() = Some(watch);
        cache
    }

    /// This instance's 8-hex-char session identifier.
    #[must_use]
    pub fn session(&self) -> &str {
        &self.session
    }

    /// Build the [`CacheLink`] a cell constructor takes to join this cache.
    #[must_use]
    pub fn identify(self: &Rc<Self>, uuid: impl Into<String>, codec: Rc<dyn Codec>) -> CacheLink {
        let dyn_self: Rc<dyn CacheBridge> = self.clone();
        let bridge: std::rc::Weak<dyn CacheBridge> = Rc::downgrade(&dyn_self);
        CacheLink {
            uuid: uuid.into(),
            codec,
            bridge,
        }
    }

    /// Attach the parent-frame edge used for deferred UUIDs.
    pub fn set_parent(&self, parent: Rc<dyn ParentLink>) {
        *self.parent.borrow_mut() = Some(parent);
    }

    /// Record the defer prefix learned from the parent's handshake.
    pub fn set_defer_prefix(&self, prefix: Option<String>) {
        self.config.borrow_mut().defer_prefix = prefix;
    }

    /// Whether this instance currently drives `uuid`.
    #[must_use]
    pub fn is_owned(&self, uuid: &str) -> bool {
        self.regs.borrow().get(uuid).is_some_and(|reg| reg.owned)
    }

    /// Whether `uuid` is delegated to the parent frame.
    #[must_use]
    pub fn is_deferred(&self, uuid: &str) -> bool {
        self.regs.borrow().get(uuid).is_some_and(|reg| reg.deferred)
    }

    /// Make sure `uuid` is being driven by someone: repair a stale primary,
    /// defer to the parent, or claim ownership and elect a primary.
    pub fn ensure_active(&self, uuid: &str) {
        // A primary that lost its owned flag is stale: tear it down first.
        let stale = {
            let mut regs = self.regs.borrow_mut();
            let Some(reg) = regs.get_mut(uuid) else { return };
            if !reg.users.is_empty() && !reg.owned && reg.primary.is_some() {
                tracing::warn!(uuid, "primary without ownership; repairing");
                reg.primary.take()
            } else {
                None
            }
        };
        if let Some(primary) = stale {
            primary.finalise();
        }

        let activation = {
            let regs = self.regs.borrow();
            let Some(reg) = regs.get(uuid) else { return };
            if reg.users.is_empty() || reg.primary.is_some() || reg.deferred {
                Activation::Nothing
            } else if self.should_defer(uuid) {
                Activation::Defer
            } else {
                Activation::Elect
            }
        };
        match activation {
            Activation::Nothing => {}
            Activation::Defer => {
                let parent = self.parent.borrow().clone();
                if let Some(parent) = parent {
                    if let Some(reg) = self.regs.borrow_mut().get_mut(uuid) {
                        reg.deferred = true;
                    }
                    parent.use_uuid(uuid);
                } else {
                    tracing::warn!(uuid, "defer prefix matched but no parent link; owning locally");
                    self.elect(uuid);
                }
            }
            Activation::Elect => self.elect(uuid),
        }
    }

    fn should_defer(&self, uuid: &str) -> bool {
        let config = self.config.borrow();
        config
            .defer_prefix
            .as_deref()
            .is_some_and(|prefix| uuid.starts_with(prefix))
    }

    fn elect(&self, uuid: &str) {
        let key = owner_key(uuid);
        let current = match self.store.get(&key) {
            Ok(current) => current,
            Err(error) => {
                tracing::warn!(uuid, %error, "owner lookup failed; staying passive");
                return;
            }
        };
        match current {
            None => {
                // Claim-if-absent. A peer may claim concurrently; the
                // storage events sort the duplicate out.
                if let Err(error) = self.store.set(&key, &self.session) {
                    tracing::warn!(uuid, %error, "owner claim failed; staying passive");
                    return;
                }
            }
            Some(ref owner) if *owner == self.session => {}
            Some(owner) => {
                tracing::debug!(uuid, %owner, "owned by a peer instance; mirroring");
                return;
            }
        }

        let promoted = {
            let mut regs = self.regs.borrow_mut();
            let Some(reg) = regs.get_mut(uuid) else { return };
            if reg.primary.is_some() || reg.users.is_empty() {
                None
            } else {
                let cell = reg.users.remove(0);
                reg.primary = Some(cell.clone());
                reg.owned = true;
                Some(cell)
            }
        };
        if let Some(cell) = promoted {
            tracing::debug!(uuid, session = %self.session, "promoted primary");
            cell.initialise();
        }
    }

    /// Feed a parent-frame update into the local mirrors of `uuid`.
    pub fn parent_update(&self, uuid: &str, value: Option<Value>, value_string: Option<String>) {
        let Some((codec, users)) = self.snapshot_users(uuid) else {
            tracing::debug!(uuid, "parent update for an unregistered uuid; ignoring");
            return;
        };
        let resolved = match (value, value_string) {
            (Some(value), _) => Some(value),
            (None, Some(text)) => match codec.decode(&text) {
                Some(value) => Some(value),
                None => {
                    tracing::warn!(uuid, "undecodable parent value; ignoring");
                    return;
                }
            },
            (None, None) => None,
        };
        for user in users {
            user.mirror(resolved.clone());
        }
    }

    /// Finalise primaries that have gone cold (no users) under the
    /// retain-cold policy, releasing their resources and, where no users
    /// remain, the owner key.
    pub fn purge_cold(&self) {
        let cold: Vec<(String, Cell)> = {
            let mut regs = self.regs.borrow_mut();
            regs.iter_mut()
                .filter(|(_, reg)| !reg.owned && reg.users.is_empty())
                .filter_map(|(uuid, reg)| reg.primary.take().map(|primary| (uuid.clone(), primary)))
                .collect()
        };
        for (uuid, primary) in cold {
            tracing::debug!(uuid = %uuid, "purging cold primary");
            primary.finalise();
            self.release_owner_key(&uuid);
            self.cleanup(&uuid);
        }
    }

    /// Release everything this instance holds in the shared store so peers
    /// can adopt: deferred UUIDs are dropped at the parent, owned UUIDs get
    /// their owner key deleted.
    pub fn unload(&self) {
        let entries: Vec<(String, bool)> = self
            .regs
            .borrow()
            .iter()
            .map(|(uuid, reg)| (uuid.clone(), reg.deferred))
            .collect();
        let parent = self.parent.borrow().clone();
        for (uuid, deferred) in entries {
            if deferred {
                if let Some(parent) = &parent {
                    parent.drop_uuid(&uuid);
                }
            } else {
                self.release_owner_key(&uuid);
            }
        }
    }

    fn release_owner_key(&self, uuid: &str) {
        let key = owner_key(uuid);
        match self.store.get(&key) {
            Ok(Some(owner)) if owner == self.session => {
                if let Err(error) = self.store.remove(&key) {
                    tracing::warn!(uuid, %error, "failed to release owner key");
                }
            }
            Ok(_) => {}
            Err(error) => tracing::warn!(uuid, %error, "owner lookup failed during release"),
        }
    }

    fn cleanup(&self, uuid: &str) {
        let mut regs = self.regs.borrow_mut();
        if regs.get(uuid).is_some_and(Registration::removable) {
            regs.remove(uuid);
        }
    }

    fn snapshot_users(&self, uuid: &str) -> Option<(Rc<dyn Codec>, Vec<Cell>)> {
        let regs = self.regs.borrow();
        let reg = regs.get(uuid)?;
        Some((Rc::clone(&reg.codec), reg.users.clone()))
    }

    fn on_store_event(&self, event: &StoreEvent) {
        if let Some(uuid) = event.key.strip_prefix("value.") {
            let Some((codec, users)) = self.snapshot_users(uuid) else {
                return;
            };
            match &event.new_value {
                None => {
                    for user in users {
                        user.mirror(None);
                    }
                }
                Some(text) => match codec.decode(text) {
                    Some(value) => {
                        for user in users {
                            user.mirror(Some(value.clone()));
                        }
                    }
                    None => tracing::warn!(uuid, "undecodable peer value; ignoring"),
                },
            }
        } else if let Some(uuid) = event.key.strip_prefix("owner.") {
            match &event.new_value {
                // The owner went away: adopt if we have interest.
                None => self.ensure_active(uuid),
                Some(owner) if *owner != self.session => {
                    // A peer holds the key now. If we believed we owned this
                    // uuid, the claim race went against us: demote.
                    let demoted = {
                        let mut regs = self.regs.borrow_mut();
                        regs.get_mut(uuid)
                            .filter(|reg| reg.owned)
                            .map(|reg| {
                                reg.owned = false;
                                tracing::warn!(
                                    uuid,
                                    %owner,
                                    "lost ownership race; demoting to mirror"
                                );
                            })
                            .is_some()
                    };
                    if demoted {
                        self.ensure_active(uuid);
                    }
                }
                Some(_) => {}
            }
        }
    }
}

impl CacheBridge for SharedCache {
    fn initialise(&self, uuid: &str, cell: &Cell, codec: &Rc<dyn Codec>) {
        enum Joined {
            Fresh(Option<Value>),
            Reactivated,
            Mirror(Option<Value>),
        }

        let joined = {
            let mut regs = self.regs.borrow_mut();
            match regs.get_mut(uuid) {
                None => {
                    regs.insert(
                        uuid.to_owned(),
                        Registration {
                            primary: None,
                            users: vec![cell.clone()],
                            owned: false,
                            deferred: false,
                            codec: Rc::clone(codec),
                        },
                    );
                    let stored = match self.store.get(&value_key(uuid)) {
                        Ok(stored) => stored.and_then(|text| codec.decode(&text)),
                        Err(error) => {
                            tracing::warn!(uuid, %error, "stored value lookup failed");
                            None
                        }
                    };
                    Joined::Fresh(stored)
                }
                Some(reg) if reg.is_primary(cell) => {
                    // A cold primary coming back into use.
                    reg.owned = true;
                    Joined::Reactivated
                }
                Some(reg) => {
                    reg.users.push(cell.clone());
                    let current = reg
                        .primary
                        .as_ref()
                        .and_then(Cell::value)
                        .or_else(|| reg.users.first().and_then(Cell::value));
                    Joined::Mirror(current)
                }
            }
        };

        match joined {
            Joined::Fresh(stored) => {
                if let Some(value) = stored {
                    cell.mirror(Some(value));
                }
                self.ensure_active(uuid);
            }
            Joined::Reactivated => {
                tracing::debug!(uuid, "cold primary reactivated");
            }
            Joined::Mirror(current) => {
                if let Some(value) = current {
                    cell.mirror(Some(value));
                }
            }
        }
    }

    fn finalise(&self, uuid: &str, cell: &Cell) {
        enum Departed {
            ColdPrimary,
            FinalPrimary { had_users: bool },
            User { tell_parent: bool },
        }

        let retain = self.config.borrow().retain_cold;
        let departed = {
            let mut regs = self.regs.borrow_mut();
            let Some(reg) = regs.get_mut(uuid) else {
                tracing::warn!(uuid, "finalise for an unregistered uuid");
                return;
            };
            if reg.is_primary(cell) {
                reg.owned = false;
                if retain {
                    Departed::ColdPrimary
                } else {
                    reg.primary = None;
                    Departed::FinalPrimary {
                        had_users: !reg.users.is_empty(),
                    }
                }
            } else {
                let before = reg.users.len();
                reg.users.retain(|user| !user.ptr_eq(cell));
                if reg.users.len() == before {
                    tracing::warn!(uuid, "finalise for a cell not registered here");
                }
                let tell_parent = reg.users.is_empty() && reg.deferred;
                if tell_parent {
                    reg.deferred = false;
                }
                Departed::User { tell_parent }
            }
        };

        match departed {
            Departed::ColdPrimary => {
                tracing::debug!(uuid, "primary retained cold for reuse");
            }
            Departed::FinalPrimary { had_users } => {
                cell.finalise();
                if had_users {
                    self.ensure_active(uuid);
                } else {
                    self.release_owner_key(uuid);
                }
            }
            Departed::User { tell_parent } => {
                if tell_parent {
                    let parent = self.parent.borrow().clone();
                    if let Some(parent) = parent {
                        parent.drop_uuid(uuid);
                    }
                }
            }
        }
        self.cleanup(uuid);
    }

    fn publish(&self, uuid: &str, value: Option<&Value>) {
        let owner = match self.store.get(&owner_key(uuid)) {
            Ok(owner) => owner,
            Err(error) => {
                tracing::warn!(uuid, %error, "owner lookup failed; publish dropped");
                return;
            }
        };
        if owner.as_deref() != Some(self.session.as_str()) {
            let believed_owned = self.is_owned(uuid);
            if believed_owned {
                tracing::warn!(uuid, "owned flag without the owner key; repairing");
                if let Some(reg) = self.regs.borrow_mut().get_mut(uuid) {
                    reg.owned = false;
                }
                self.ensure_active(uuid);
            } else {
                tracing::debug!(uuid, "publish from non-owner ignored");
            }
            return;
        }

        let Some((codec, users)) = self.snapshot_users(uuid) else {
            return;
        };
        match value {
            Some(value) => {
                if let Err(error) = self.store.set(&value_key(uuid), &codec.encode(value)) {
                    tracing::warn!(uuid, %error, "value write failed");
                }
                for user in users {
                    user.mirror(Some(value.clone()));
                }
            }
            None => {
                if let Err(error) = self.store.remove(&value_key(uuid)) {
                    tracing::warn!(uuid, %error, "value delete failed");
                }
                for user in users {
                    user.mirror(None);
                }
            }
        }
    }
}

impl fmt::Debug for SharedCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedCache")
            .field("session", &self.session)
            .field("registrations", &self.regs.borrow().len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
