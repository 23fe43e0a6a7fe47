#![forbid(unsafe_code)]

//! The parent-side frame proxy: own cells on behalf of children.
//!
//! Children that cannot own certain UUIDs (sandboxed frames, embedded
//! runtimes) delegate them here. Per UUID the proxy resolves one producer
//! cell through the injected [`UuidResolver`], holds it while any child is
//! subscribed, and fans every readiness change out as a
//! `spookCacheUpdate`: serialised through the resolver's codec for object
//! values, raw otherwise, with both fields omitted for not-ready.
//!
//! Messages from windows that are not direct children are ignored (with a
//! warning); a UUID the resolver cannot produce is answered with
//! `spookUnknown`.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use spook::{Cell, Codec, Token};

use crate::port::{FromChildEnvelope, ParentPort, PeerId, PortWatch};
use crate::wire::{CacheUpdate, FromChild, ProxyInfo, ToChild, Unknown};

/// Resolves a UUID to the producer cell (and codec) that backs it.
pub trait UuidResolver {
    fn resolve(&self, uuid: &str) -> Option<ResolvedCell>;
}

/// A resolver result: the producing cell plus its serialisation codec, if
/// object values should travel in serialised form.
pub struct ResolvedCell {
    pub cell: Cell,
    pub codec: Option<Rc<dyn Codec>>,
}

struct Entry {
    cell: Cell,
    codec: Option<Rc<dyn Codec>>,
    sources: Vec<PeerId>,
    token: Token,
}

/// The parent-side multiplexer. See the module docs.
pub struct FrameProxy {
    port: Rc<dyn ParentPort>,
    resolver: Rc<dyn UuidResolver>,
    defer_prefix: String,
    entries: RefCell<BTreeMap<String, Entry>>,
    // Held for its Drop; the message subscription dies with the proxy.
    _watch: RefCell<Option<PortWatch>>,
}

impl FrameProxy {
    /// Start serving children on `port`. `defer_prefix` is what children
    /// are told to delegate in the handshake reply.
    #[must_use]
    pub fn connect(
        port: Rc<dyn ParentPort>,
        resolver: Rc<dyn UuidResolver>,
        defer_prefix: impl Into<String>,
    ) -> Rc<FrameProxy> {
        let proxy = Rc::new(FrameProxy {
            port: Rc::clone(&port),
            resolver,
            defer_prefix: defer_prefix.into(),
            entries: RefCell::new(BTreeMap::new()),
            _watch: RefCell::new(None),
        });
        let weak = Rc::downgrade(&proxy);
        let watch = port.on_message(Rc::new(move |envelope: &FromChildEnvelope| {
            if let Some(proxy) = weak.upgrade() {
                proxy.handle(envelope);
            }
        }));
        *proxy._watch.borrow_mut() = Some(watch);
        proxy
    }

    /// Number of UUIDs currently tracked for children.
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.entries.borrow().len()
    }

    fn handle(self: &Rc<Self>, envelope: &FromChildEnvelope) {
        if !self.port.is_direct_child(&envelope.from) {
            tracing::warn!(peer = %envelope.from, "message from a non-child window ignored");
            return;
        }
        match &envelope.message {
            FromChild::Hello(_) => {
                self.port.reply(
                    &envelope.from,
                    &ToChild::Info(ProxyInfo {
                        defer_parent_prefix: self.defer_prefix.clone(),
                    }),
                );
            }
            FromChild::Use(uuid) => self.handle_use(&envelope.from, uuid),
            FromChild::Drop(uuid) => self.handle_drop(&envelope.from, uuid),
        }
    }

    fn handle_use(self: &Rc<Self>, from: &PeerId, uuid: &str) {
        let known = self.entries.borrow().contains_key(uuid);
        if !known {
            let Some(resolved) = self.resolver.resolve(uuid) else {
                tracing::warn!(uuid, "child asked for a uuid the resolver cannot produce");
                self.port.reply(
                    from,
                    &ToChild::Unknown(Unknown {
                        uuid: uuid.to_owned(),
                    }),
                );
                return;
            };
            // The entry goes in before the notifier registers, so a
            // fan-out fired during producer start-up finds it.
            self.entries.borrow_mut().insert(
                uuid.to_owned(),
                Entry {
                    cell: resolved.cell.clone(),
                    codec: resolved.codec,
                    sources: Vec::new(),
                    token: 0,
                },
            );
            let weak = Rc::downgrade(self);
            let tracked = uuid.to_owned();
            let token = resolved.cell.notify(move || {
                if let Some(proxy) = weak.upgrade() {
                    proxy.broadcast(&tracked);
                }
            });
            if let Some(entry) = self.entries.borrow_mut().get_mut(uuid) {
                entry.token = token;
            }
        }

        let update = {
            let mut entries = self.entries.borrow_mut();
            let Some(entry) = entries.get_mut(uuid) else { return };
            if !entry.sources.contains(from) {
                entry.sources.push(from.clone());
            }
            make_update(uuid, &entry.cell, entry.codec.as_ref())
        };
        // The current state goes straight back, ready or not.
        self.port.reply(from, &ToChild::CacheUpdate(update));
    }

    fn handle_drop(&self, from: &PeerId, uuid: &str) {
        let released = {
            let mut entries = self.entries.borrow_mut();
            let Some(entry) = entries.get_mut(uuid) else {
                tracing::warn!(uuid, "drop for a uuid this proxy is not tracking");
                return;
            };
            entry.sources.retain(|source| source != from);
            if entry.sources.is_empty() {
                entries.remove(uuid)
            } else {
                None
            }
        };
        if let Some(entry) = released {
            // Last subscriber gone: stop observing and let the producer
            // wind down.
            entry.cell.unnotify(entry.token);
        }
    }

    fn broadcast(&self, uuid: &str) {
        let (update, sources) = {
            let entries = self.entries.borrow();
            let Some(entry) = entries.get(uuid) else { return };
            (
                make_update(uuid, &entry.cell, entry.codec.as_ref()),
                entry.sources.clone(),
            )
        };
        for source in sources {
            self.port.reply(&source, &ToChild::CacheUpdate(update.clone()));
        }
    }
}

fn make_update(uuid: &str, cell: &Cell, codec: Option<&Rc<dyn Codec>>) -> CacheUpdate {
    match cell.value() {
        Some(value) => match codec {
            // Object values travel in serialised form when a codec exists.
            Some(codec) if value.is_object() => CacheUpdate {
                uuid: uuid.to_owned(),
                value: None,
                value_string: Some(codec.encode(&value)),
            },
            _ => CacheUpdate {
                uuid: uuid.to_owned(),
                value: Some(value),
                value_string: None,
            },
        },
        None => CacheUpdate {
            uuid: uuid.to_owned(),
            value: None,
            value_string: None,
        },
    }
}

impl fmt::Debug for FrameProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameProxy")
            .field("defer_prefix", &self.defer_prefix)
            .field("tracked", &self.tracked())
            .finish()
    }
}
