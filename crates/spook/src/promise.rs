#![forbid(unsafe_code)]

//! One-shot shared promises and the cell-to-future bridge.
//!
//! [`Promise`] is the single-threaded suspension primitive of the graph: a
//! shared slot that settles exactly once, either with a value or with a
//! [`Rejection`]. Structured inputs ([`Term`](crate::Term)) may embed
//! promises; the reactive machinery attaches completion handlers and re-polls
//! when they settle.
//!
//! A `Promise` is also a real [`std::future::Future`], so bridge results can
//! be awaited by whatever executor the host embeds.
//!
//! # Invariants
//!
//! 1. A promise settles at most once; later settle attempts are ignored
//!    (logged at debug level).
//! 2. Completion handlers registered after settlement run synchronously.
//! 3. Handlers run in registration order.

use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use thiserror::Error;

use crate::value::Value;

/// Why a promise failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("promise rejected: {0}")]
pub struct Rejection(pub String);

impl Rejection {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// Outcome of a settled promise.
pub type Settled = Result<Value, Rejection>;

type SettleHandler = Box<dyn FnOnce(&Settled)>;

enum PromiseState {
    Pending {
        handlers: Vec<SettleHandler>,
        wakers: Vec<Waker>,
    },
    Settled(Settled),
}

/// A shared, one-shot asynchronous value.
///
/// Cloning a `Promise` clones the handle, not the slot: all clones observe
/// the same settlement.
#[derive(Clone)]
pub struct Promise {
    inner: Rc<RefCell<PromiseState>>,
}

/// The settle side of a pending promise.
pub struct Resolver {
    inner: Rc<RefCell<PromiseState>>,
}

impl Promise {
    /// Create a pending promise and the handle that settles it.
    #[must_use]
    pub fn pending() -> (Promise, Resolver) {
        let inner = Rc::new(RefCell::new(PromiseState::Pending {
            handlers: Vec::new(),
            wakers: Vec::new(),
        }));
        (
            Promise {
                inner: Rc::clone(&inner),
            },
            Resolver { inner },
        )
    }

    /// A promise already settled with `value`.
    #[must_use]
    pub fn resolved(value: Value) -> Promise {
        Promise {
            inner: Rc::new(RefCell::new(PromiseState::Settled(Ok(value)))),
        }
    }

    /// A promise already settled with a rejection.
    #[must_use]
    pub fn rejected(rejection: Rejection) -> Promise {
        Promise {
            inner: Rc::new(RefCell::new(PromiseState::Settled(Err(rejection)))),
        }
    }

    /// Whether the promise has settled (either way).
    #[must_use]
    pub fn is_settled(&self) -> bool {
        matches!(&*self.inner.borrow(), PromiseState::Settled(_))
    }

    /// The settled outcome, if any.
    #[must_use]
    pub fn result(&self) -> Option<Settled> {
        match &*self.inner.borrow() {
            PromiseState::Settled(outcome) => Some(outcome.clone()),
            PromiseState::Pending { .. } => None,
        }
    }

    /// The resolved value, if settled successfully.
    #[must_use]
    pub fn value(&self) -> Option<Value> {
        match self.result() {
            Some(Ok(value)) => Some(value),
            _ => None,
        }
    }

    /// Run `handler` when the promise settles.
    ///
    /// If already settled, `handler` runs synchronously before this returns.
    pub fn on_settle(&self, handler: impl FnOnce(&Settled) + 'static) {
        let mut pending = Some(Box::new(handler) as SettleHandler);
        let settled = {
            let mut state = self.inner.borrow_mut();
            match &mut *state {
                PromiseState::Pending { handlers, .. } => {
                    if let Some(handler) = pending.take() {
                        handlers.push(handler);
                    }
                    None
                }
                PromiseState::Settled(outcome) => Some(outcome.clone()),
            }
        };
        if let (Some(outcome), Some(handler)) = (settled, pending.take()) {
            handler_isolated(handler, &outcome);
        }
    }

    /// Two handles to the same slot?
    #[must_use]
    pub fn ptr_eq(&self, other: &Promise) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Resolver {
    /// Settle with a value. A second settlement attempt is ignored.
    pub fn resolve(self, value: Value) {
        settle(&self.inner, Ok(value));
    }

    /// Settle with a rejection. A second settlement attempt is ignored.
    pub fn reject(self, rejection: Rejection) {
        settle(&self.inner, Err(rejection));
    }
}

fn settle(inner: &Rc<RefCell<PromiseState>>, outcome: Settled) {
    let handlers = {
        let mut state = inner.borrow_mut();
        match &mut *state {
            PromiseState::Settled(_) => {
                tracing::debug!("promise already settled; ignoring late settlement");
                return;
            }
            PromiseState::Pending { handlers, wakers } => {
                let handlers = std::mem::take(handlers);
                let wakers = std::mem::take(wakers);
                *state = PromiseState::Settled(outcome.clone());
                for waker in wakers {
                    waker.wake();
                }
                handlers
            }
        }
    };
    for handler in handlers {
        handler_isolated(handler, &outcome);
    }
}

fn handler_isolated(handler: SettleHandler, outcome: &Settled) {
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(outcome)));
    if result.is_err() {
        tracing::error!("promise completion handler panicked; continuing");
    }
}

impl Future for Promise {
    type Output = Settled;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.inner.borrow_mut();
        match &mut *state {
            PromiseState::Settled(outcome) => Poll::Ready(outcome.clone()),
            PromiseState::Pending { wakers, .. } => {
                wakers.push(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

impl fmt::Debug for Promise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.inner.borrow() {
            PromiseState::Pending { handlers, .. } => format!("pending({})", handlers.len()),
            PromiseState::Settled(Ok(_)) => String::from("resolved"),
            PromiseState::Settled(Err(_)) => String::from("rejected"),
        };
        f.debug_struct("Promise").field("state", &state).finish()
    }
}
