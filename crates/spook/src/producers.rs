#![forbid(unsafe_code)]

//! Producer cells backed by push subscriptions.
//!
//! A [`PushSource`] is the injected seam to whatever long-lived feed the
//! host speaks (an RPC subscription, a socket, an event stream). The
//! subscription cell opens it on the 0→1 user transition, relays every
//! pushed value through `trigger`, and closes it again on 1→0, so the
//! remote resource is held exactly while someone is watching.

use std::cell::RefCell;
use std::rc::Rc;

use crate::cell::{Cell, CellOptions, Driver};
use crate::value::Value;

/// Closes its subscription when dropped.
pub struct PushGuard {
    close: Option<Box<dyn FnOnce()>>,
}

impl PushGuard {
    pub fn new(close: impl FnOnce() + 'static) -> PushGuard {
        PushGuard {
            close: Some(Box::new(close)),
        }
    }

    /// A guard with nothing to close.
    #[must_use]
    pub fn noop() -> PushGuard {
        PushGuard { close: None }
    }
}

impl Drop for PushGuard {
    fn drop(&mut self) {
        if let Some(close) = self.close.take() {
            close();
        }
    }
}

impl std::fmt::Debug for PushGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushGuard").finish_non_exhaustive()
    }
}

/// A long-lived external feed of values.
pub trait PushSource {
    /// Open the feed; pushed values go to `sink` until the guard drops.
    fn open(&self, sink: Rc<dyn Fn(Value)>) -> PushGuard;
}

struct SubscriptionDriver {
    source: Rc<dyn PushSource>,
    guard: RefCell<Option<PushGuard>>,
}

impl Driver for SubscriptionDriver {
    fn init(&self, cell: &Cell) {
        let weak = cell.downgrade();
        let sink: Rc<dyn Fn(Value)> = Rc::new(move |value| {
            if let Some(cell) = weak.upgrade() {
                cell.trigger(value);
            }
        });
        *self.guard.borrow_mut() = Some(self.source.open(sink));
    }

    fn fin(&self, _cell: &Cell) {
        self.guard.borrow_mut().take();
    }
}

impl Cell {
    /// A producer relaying a push feed, held open only while in use.
    #[must_use]
    pub fn subscription(source: Rc<dyn PushSource>) -> Cell {
        Cell::subscription_in(CellOptions::default(), source)
    }

    /// [`subscription`](Cell::subscription) with explicit cell options
    /// (nullable policy, cache identity).
    #[must_use]
    pub fn subscription_in(options: CellOptions, source: Rc<dyn PushSource>) -> Cell {
        Cell::with_driver(
            options,
            Rc::new(SubscriptionDriver {
                source,
                guard: RefCell::new(None),
            }),
        )
    }
}

/// A scripted feed for tests: counts opens/closes and lets the test push
/// values into every open subscription.
#[derive(Clone, Default)]
pub struct MockFeed {
    state: Rc<RefCell<MockFeedState>>,
}

#[derive(Default)]
struct MockFeedState {
    opens: u32,
    closes: u32,
    next_id: u64,
    sinks: Vec<(u64, Rc<dyn Fn(Value)>)>,
}

impl MockFeed {
    #[must_use]
    pub fn new() -> MockFeed {
        MockFeed::default()
    }

    /// Push a value into every open subscription.
    pub fn push(&self, value: Value) {
        let sinks: Vec<Rc<dyn Fn(Value)>> = self
            .state
            .borrow()
            .sinks
            .iter()
            .map(|(_, sink)| Rc::clone(sink))
            .collect();
        for sink in sinks {
            sink(value.clone());
        }
    }

    #[must_use]
    pub fn opens(&self) -> u32 {
        self.state.borrow().opens
    }

    #[must_use]
    pub fn closes(&self) -> u32 {
        self.state.borrow().closes
    }

    /// Number of currently open subscriptions.
    #[must_use]
    pub fn active(&self) -> usize {
        self.state.borrow().sinks.len()
    }
}

impl PushSource for MockFeed {
    fn open(&self, sink: Rc<dyn Fn(Value)>) -> PushGuard {
        let id = {
            let mut state = self.state.borrow_mut();
            state.opens += 1;
            let id = state.next_id;
            state.next_id += 1;
            state.sinks.push((id, sink));
            id
        };
        let weak = Rc::downgrade(&self.state);
        PushGuard::new(move || {
            if let Some(state) = weak.upgrade() {
                let mut state = state.borrow_mut();
                state.closes += 1;
                state.sinks.retain(|(sink_id, _)| *sink_id != id);
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
    use serde_json::json;

    #[test]
    fn subscription_opens_on_first_user_and_closes_on_last() {
        let feed = MockFeed::new();
        let cell = Cell::subscription(Rc::new(feed.clone()));

        assert_eq!((feed.opens(), feed.closes()), (0, 0));
        let first = cell.tie(|_| {});
        let second = cell.tie(|_| {});
        assert_eq!((feed.opens(), feed.closes()), (1, 0));

        cell.untie(first);
        assert_eq!((feed.opens(), feed.closes()), (1, 0));
        cell.untie(second);
        assert_eq!((feed.opens(), feed.closes()), (1, 1));
        assert_eq!(feed.active(), 0);
    }

    #[test]
    fn pushed_values_relay_through_trigger() {
        let feed = MockFeed::new();
        let cell = Cell::subscription(Rc::new(feed.clone()));
        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = Rc::clone(&seen);
        let _t = cell.tie(move |v| s.borrow_mut().push(v.clone()));

        feed.push(json!({"height": 1}));
        feed.push(json!({"height": 2}));
        assert_eq!(
            *seen.borrow(),
            vec![json!({"height": 1}), json!({"height": 2})]
        );
    }

    #[test]
    fn reuse_reopens_the_feed() {
        let feed = MockFeed::new();
        let cell = Cell::subscription(Rc::new(feed.clone()));

        let token = cell.tie(|_| {});
        cell.untie(token);
        let token = cell.tie(|_| {});
        cell.untie(token);
        assert_eq!((feed.opens(), feed.closes()), (2, 2));
    }

    #[test]
    fn pushes_after_close_are_not_observed() {
        let feed = MockFeed::new();
        let cell = Cell::subscription(Rc::new(feed.clone()));
        let count = Rc::new(RefCell::new(0u32));
        let c = Rc::clone(&count);
        let token = cell.tie(move |_| *c.borrow_mut() += 1);

        feed.push(json!(1));
        cell.untie(token);
        feed.push(json!(2));
        assert_eq!(*count.borrow(), 1);
    }
}
