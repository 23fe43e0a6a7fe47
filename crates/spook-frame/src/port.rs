#![forbid(unsafe_code)]

//! Message ports between a parent and its child frames.
//!
//! [`ParentPort`] and [`ChildPort`] abstract the host's message channel
//! (postMessage-style): fire-and-forget object posts plus a sender identity
//! the parent can use to tell its *direct* children from strangers.
//!
//! [`MemoryFrames`] is the in-process implementation used in tests: one
//! parent endpoint and any number of child endpoints, with messages passed
//! through their serialised text form so the wire shapes stay honest.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use crate::wire::{FromChild, ToChild};

/// Identifies a peer frame on a port.
pub type PeerId = String;

/// A child→parent message with its sender.
#[derive(Debug, Clone, PartialEq)]
pub struct FromChildEnvelope {
    pub from: PeerId,
    pub message: FromChild,
}

/// Unregisters its message handler when dropped.
pub struct PortWatch {
    cancel: Option<Box<dyn FnOnce()>>,
}

impl PortWatch {
    pub fn new(cancel: impl FnOnce() + 'static) -> PortWatch {
        PortWatch {
            cancel: Some(Box::new(cancel)),
        }
    }
}

impl Drop for PortWatch {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for PortWatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortWatch").finish_non_exhaustive()
    }
}

/// The parent's side of the frame channel.
pub trait ParentPort {
    /// Post a message to one child.
    fn reply(&self, to: &PeerId, message: &ToChild);

    /// Whether `peer` is a direct child of this frame.
    fn is_direct_child(&self, peer: &PeerId) -> bool;

    /// Observe inbound child messages.
    fn on_message(&self, handler: Rc<dyn Fn(&FromChildEnvelope)>) -> PortWatch;
}

/// A child's side of the frame channel.
pub trait ChildPort {
    /// Post a message to the parent.
    fn post(&self, message: &FromChild);

    /// Observe inbound parent messages.
    fn on_message(&self, handler: Rc<dyn Fn(&ToChild)>) -> PortWatch;
}

struct ChildSlot {
    name: PeerId,
    direct: bool,
    handlers: Vec<(u64, Rc<dyn Fn(&ToChild)>)>,
}

#[derive(Default)]
struct FramesState {
    parent_handlers: Vec<(u64, Rc<dyn Fn(&FromChildEnvelope)>)>,
    children: Vec<ChildSlot>,
    next_handler: u64,
}

/// An in-process parent/children frame tree.
#[derive(Clone, Default)]
pub struct MemoryFrames {
    state: Rc<RefCell<FramesState>>,
}

impl MemoryFrames {
    #[must_use]
    pub fn new() -> MemoryFrames {
        MemoryFrames::default()
    }

    /// The parent endpoint.
    #[must_use]
    pub fn parent(&self) -> Rc<MemoryParentPort> {
        Rc::new(MemoryParentPort {
            state: Rc::clone(&self.state),
        })
    }

    /// A direct-child endpoint named `name`.
    #[must_use]
    pub fn child(&self, name: &str) -> Rc<MemoryChildPort> {
        self.attach(name, true)
    }

    /// An endpoint that can post but is *not* a direct child, for
    /// exercising the origin filter.
    #[must_use]
    pub fn stranger(&self, name: &str) -> Rc<MemoryChildPort> {
        self.attach(name, false)
    }

    fn attach(&self, name: &str, direct: bool) -> Rc<MemoryChildPort> {
        self.state.borrow_mut().children.push(ChildSlot {
            name: name.to_owned(),
            direct,
            handlers: Vec::new(),
        });
        Rc::new(MemoryChildPort {
            state: Rc::clone(&self.state),
            name: name.to_owned(),
        })
    }
}

/// Parent endpoint of a [`MemoryFrames`] tree.
pub struct MemoryParentPort {
    state: Rc<RefCell<FramesState>>,
}

impl ParentPort for MemoryParentPort {
    fn reply(&self, to: &PeerId, message: &ToChild) {
        // Round-trip through text so only the wire shape crosses the port.
        let Ok(text) = serde_json::to_string(message) else {
            return;
        };
        let Ok(parsed) = serde_json::from_str::<ToChild>(&text) else {
            return;
        };
        let handlers: Vec<Rc<dyn Fn(&ToChild)>> = {
            let state = self.state.borrow();
            state
                .children
                .iter()
                .filter(|child| child.name == *to)
                .flat_map(|child| child.handlers.iter().map(|(_, h)| Rc::clone(h)))
                .collect()
        };
        for handler in handlers {
            handler(&parsed);
        }
    }

    fn is_direct_child(&self, peer: &PeerId) -> bool {
        self.state
            .borrow()
            .children
            .iter()
            .any(|child| child.name == *peer && child.direct)
    }

    fn on_message(&self, handler: Rc<dyn Fn(&FromChildEnvelope)>) -> PortWatch {
        let id = {
            let mut state = self.state.borrow_mut();
            let id = state.next_handler;
            state.next_handler += 1;
            state.parent_handlers.push((id, handler));
            id
        };
        let weak: Weak<RefCell<FramesState>> = Rc::downgrade(&self.state);
        PortWatch::new(move || {
            if let Some(state) = weak.upgrade() {
                state
                    .borrow_mut()
                    .parent_handlers
                    .retain(|(handler_id, _)| *handler_id != id);
            }
        })
    }
}

/// Child endpoint of a [`MemoryFrames`] tree.
pub struct MemoryChildPort {
    state: Rc<RefCell<FramesState>>,
    name: PeerId,
}

impl ChildPort for MemoryChildPort {
    fn post(&self, message: &FromChild) {
        let Ok(text) = serde_json::to_string(message) else {
            return;
        };
        let Ok(parsed) = serde_json::from_str::<FromChild>(&text) else {
            return;
        };
        let envelope = FromChildEnvelope {
            from: self.name.clone(),
            message: parsed,
        };
        let handlers: Vec<Rc<dyn Fn(&FromChildEnvelope)>> = {
            let state = self.state.borrow();
            state
                .parent_handlers
                .iter()
                .map(|(_, h)| Rc::clone(h))
                .collect()
        };
        for handler in handlers {
            handler(&envelope);
        }
    }

    fn on_message(&self, handler: Rc<dyn Fn(&ToChild)>) -> PortWatch {
        let id = {
            let mut state = self.state.borrow_mut();
            let id = state.next_handler;
            state.next_handler += 1;
            if let Some(child) = state
                .children
                .iter_mut()
                .find(|child| child.name == self.name)
            {
                child.handlers.push((id, handler));
            }
            id
        };
        let name = self.name.clone();
        let weak: Weak<RefCell<FramesState>> = Rc::downgrade(&self.state);
        PortWatch::new(move || {
            if let Some(state) = weak.upgrade() {
                if let Some(child) = state
                    .borrow_mut()
                    .children
                    .iter_mut()
                    .find(|child| child.name == name)
                {
                    child.handlers.retain(|(handler_id, _)| *handler_id != id);
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_posts_reach_the_parent_with_identity() {
        let frames = MemoryFrames::new();
        let parent = frames.parent();
        let child = frames.child("kid");

        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = Rc::clone(&seen);
        let _watch = parent.on_message(Rc::new(move |envelope: &FromChildEnvelope| {
            s.borrow_mut().push(envelope.clone());
        }));

        child.post(&FromChild::Use("u".to_owned()));
        assert_eq!(
            *seen.borrow(),
            vec![FromChildEnvelope {
                from: "kid".to_owned(),
                message: FromChild::Use("u".to_owned()),
            }]
        );
    }

    #[test]
    fn replies_reach_only_the_addressed_child() {
        let frames = MemoryFrames::new();
        let parent = frames.parent();
        let one = frames.child("one");
        let two = frames.child("two");

        let one_seen = Rc::new(RefCell::new(0u32));
        let c = Rc::clone(&one_seen);
        let _w1 = one.on_message(Rc::new(move |_: &ToChild| *c.borrow_mut() += 1));
        let two_seen = Rc::new(RefCell::new(0u32));
        let c = Rc::clone(&two_seen);
        let _w2 = two.on_message(Rc::new(move |_: &ToChild| *c.borrow_mut() += 1));

        parent.reply(
            &"one".to_owned(),
            &ToChild::Unknown(crate::wire::Unknown {
                uuid: "u".to_owned(),
            }),
        );
        assert_eq!((*one_seen.borrow(), *two_seen.borrow()), (1, 0));
    }

    #[test]
    fn direct_child_identity_is_tracked() {
        let frames = MemoryFrames::new();
        let parent = frames.parent();
        let _kid = frames.child("kid");
        let _odd = frames.stranger("odd");

        assert!(parent.is_direct_child(&"kid".to_owned()));
        assert!(!parent.is_direct_child(&"odd".to_owned()));
        assert!(!parent.is_direct_child(&"ghost".to_owned()));
    }
}
