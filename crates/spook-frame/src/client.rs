#![forbid(unsafe_code)]

//! The child-side frame client: delegate deferred UUIDs to the parent.
//!
//! On connect the client sends the `helloSpookProxy` handshake; the
//! parent's `spookProxyInfo` reply tells the cache which UUID prefix to
//! defer. From then on the client is the cache's [`ParentLink`]: interest
//! in a deferred UUID becomes `useSpook`/`dropSpook` posts, and inbound
//! `spookCacheUpdate` messages are mirrored into the cache's registered
//! users.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use spook_cache::{ParentLink, SharedCache};

use crate::port::{ChildPort, PortWatch};
use crate::wire::{FromChild, ToChild};

/// The child runtime's connection to its parent frame.
pub struct FrameClient {
    port: Rc<dyn ChildPort>,
    cache: Weak<SharedCache>,
    // Held for its Drop; the message subscription dies with the client.
    _watch: RefCell<Option<PortWatch>>,
}

impl FrameClient {
    /// Wire `cache` to the parent reachable through `port` and perform the
    /// handshake. The client installs itself as the cache's parent link.
    #[must_use]
    pub fn connect(port: Rc<dyn ChildPort>, cache: &Rc<SharedCache>) -> Rc<FrameClient> {
        let client = Rc::new(FrameClient {
            port: Rc::clone(&port),
            cache: Rc::downgrade(cache),
            _watch: RefCell::new(None),
        });
        let weak = Rc::downgrade(&client);
        let watch = port.on_message(Rc::new(move |message: &ToChild| {
            if let Some(client) = weak.upgrade() {
                client.handle(message);
            }
        }));
        *client._watch.borrow_mut() = Some(watch);

        cache.set_parent(Rc::clone(&client) as Rc<dyn ParentLink>);
        client.port.post(&FromChild::Hello(true));
        client
    }

    fn handle(&self, message: &ToChild) {
        let Some(cache) = self.cache.upgrade() else {
            return;
        };
        match message {
            ToChild::Info(info) => {
                tracing::debug!(prefix = %info.defer_parent_prefix, "parent proxy handshake");
                cache.set_defer_prefix(Some(info.defer_parent_prefix.clone()));
            }
            ToChild::CacheUpdate(update) => {
                cache.parent_update(
                    &update.uuid,
                    update.value.clone(),
                    update.value_string.clone(),
                );
            }
            ToChild::Unknown(unknown) => {
                tracing::warn!(uuid = %unknown.uuid, "parent cannot produce this uuid");
            }
        }
    }
}

impl ParentLink for FrameClient {
    fn use_uuid(&self, uuid: &str) {
        self.port.post(&FromChild::Use(uuid.to_owned()));
    }

    fn drop_uuid(&self, uuid: &str) {
        self.port.post(&FromChild::Drop(uuid.to_owned()));
    }
}

impl fmt::Debug for FrameClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameClient").finish_non_exhaustive()
    }
}
