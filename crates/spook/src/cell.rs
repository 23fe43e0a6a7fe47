#![forbid(unsafe_code)]

//! The base cell: an observable value slot with readiness and a
//! reference-counted lifecycle.
//!
//! # Design
//!
//! A [`Cell`] is a cheap clonable handle (`Rc` interior) onto shared state.
//! The state tracks a *readiness* flag, the current value (meaningful only
//! while ready), and three observer collections:
//!
//! - *change-subscribers* ([`tie`](Cell::tie)): called with the new value on
//!   every ready transition to a different value;
//! - *readiness-notifiers* ([`notify`](Cell::notify)): called (no value) on
//!   every transition, including ready → new-ready;
//! - *one-shots* ([`then`](Cell::then)): drained on the first ready
//!   transition after registration.
//!
//! Interest is reference-counted: [`acquire`](Cell::acquire) /
//! [`release`](Cell::release) move the user-count, and the 0→1 / 1→0 edges
//! run the attached [`Driver`]'s `init`/`fin` hooks so external resources are
//! held only while someone is watching. `tie`, `notify` and `then` do their
//! own acquire/release bookkeeping, so most callers never touch the count
//! directly.
//!
//! # Invariants
//!
//! 1. Observers in each collection fire in registration order; within one
//!    transition, notifiers fire before subscribers before one-shots.
//! 2. A proposal equal (canonically) to the current ready value is not a
//!    transition.
//! 3. Re-entrant transitions on the same cell are rejected with a warning and
//!    no state change.
//! 4. A panicking observer is isolated and logged; the remaining observers
//!    still run and the cell state stays consistent.
//!
//! # Failure Modes
//!
//! - **`release` underflow**: releasing a cell with no users is a caller bug
//!   and panics.
//! - **`done` without a predicate**: [`done`](Cell::done) requires a driver
//!   whose `is_done` is meaningful; calling it on a plain cell panics.

use std::cell::Cell as StdCell;
use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::value::{canonical_eq, Codec, Value};

/// Opaque registration token returned by `tie`/`notify`.
pub type Token = u64;

static NEXT_CELL_ID: AtomicU64 = AtomicU64::new(1);
static TRIGGERS_TOTAL: AtomicU64 = AtomicU64::new(0);

/// Total value transitions applied across all cells (monotonic counter).
#[must_use]
pub fn triggers_total() -> u64 {
    TRIGGERS_TOTAL.load(Ordering::Relaxed)
}

/// Depth at which a trigger cascade is reported as a possible runaway.
const CASCADE_WARN_DEPTH: u32 = 64;

thread_local! {
    static CASCADE_DEPTH: StdCell<u32> = const { StdCell::new(0) };
}

struct CascadeGuard;

impl CascadeGuard {
    fn enter(cell_id: u64) -> Self {
        CASCADE_DEPTH.with(|depth| {
            let d = depth.get() + 1;
            depth.set(d);
            if d == CASCADE_WARN_DEPTH {
                tracing::warn!(
                    cell = cell_id,
                    depth = d,
                    "deep trigger cascade; check for cyclic observers"
                );
            }
        });
        CascadeGuard
    }
}

impl Drop for CascadeGuard {
    fn drop(&mut self) {
        CASCADE_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

/// Lifecycle hooks attached to a cell at construction.
///
/// The driver is what makes a cell a *producer* or a *derived* cell: `init`
/// runs when the user-count goes 0→1 (subscribe upstream, open a feed, start
/// a timer) and `fin` when it returns to 0 (symmetric teardown).
pub trait Driver {
    /// Called on the 0→1 user transition.
    fn init(&self, cell: &Cell) {
        let _ = cell;
    }

    /// Called on the 1→0 user transition.
    fn fin(&self, cell: &Cell) {
        let _ = cell;
    }

    /// Whether this driver has a meaningful completion predicate.
    fn supports_done(&self) -> bool {
        false
    }

    /// Completion predicate used by [`Cell::done`]. Defaults to never done.
    fn is_done(&self, value: &Value) -> bool {
        let _ = value;
        false
    }
}

/// Integration point for a shared cache.
///
/// A cell constructed with a [`CacheLink`] delegates its 0→1/1→0 lifecycle
/// edges to the bridge (which decides whether this cell drives computation or
/// mirrors a peer) and publishes every transition.
pub trait CacheBridge {
    /// A cache-identified cell gained its first user.
    fn initialise(&self, uuid: &str, cell: &Cell, codec: &Rc<dyn Codec>);

    /// A cache-identified cell lost its last user.
    fn finalise(&self, uuid: &str, cell: &Cell);

    /// A cache-identified cell transitioned; `None` means reset.
    fn publish(&self, uuid: &str, value: Option<&Value>);
}

/// Cache identity of a cell: a stable UUID plus the codec used to persist
/// and transport its value.
#[derive(Clone)]
pub struct CacheLink {
    pub uuid: String,
    pub codec: Rc<dyn Codec>,
    pub bridge: Weak<dyn CacheBridge>,
}

impl fmt::Debug for CacheLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheLink")
            .field("uuid", &self.uuid)
            .finish_non_exhaustive()
    }
}

/// Construction options for [`Cell::with_options`] / [`Cell::with_driver`].
#[derive(Debug, Default, Clone)]
pub struct CellOptions {
    /// When `false` (the default), a `null` proposal is indistinguishable
    /// from "no value" and resets the cell.
    pub may_be_null: bool,
    /// Optional shared-cache identity.
    pub cache: Option<CacheLink>,
}

struct CellState {
    id: u64,
    ready: bool,
    value: Option<Value>,
    may_be_null: bool,
    users: usize,
    subscribers: Vec<(Token, Rc<dyn Fn(&Value)>)>,
    notifiers: Vec<(Token, Rc<dyn Fn()>)>,
    thens: Vec<Box<dyn FnOnce(&Value)>>,
    default: Option<Value>,
    triggering: bool,
    next_token: Token,
}

struct CellInner {
    state: RefCell<CellState>,
    driver: RefCell<Option<Rc<dyn Driver>>>,
    cache: RefCell<Option<CacheLink>>,
}

/// An observable value slot. See the module docs.
#[derive(Clone)]
pub struct Cell {
    inner: Rc<CellInner>,
}

/// A non-owning handle to a cell, used inside observer closures to avoid
/// reference cycles between cells.
#[derive(Clone)]
pub struct WeakCell {
    inner: Weak<CellInner>,
}

impl WeakCell {
    #[must_use]
    pub fn upgrade(&self) -> Option<Cell> {
        self.inner.upgrade().map(|inner| Cell { inner })
    }
}

impl Cell {
    /// A plain cell that treats `null` as "no value".
    #[must_use]
    pub fn new() -> Cell {
        Cell::with_options(CellOptions::default())
    }

    /// A cell for which `null` is a legal ready value.
    #[must_use]
    pub fn nullable() -> Cell {
        Cell::with_options(CellOptions {
            may_be_null: true,
            ..CellOptions::default()
        })
    }

    /// A cell with explicit options and no driver.
    #[must_use]
    pub fn with_options(options: CellOptions) -> Cell {
        Cell {
            inner: Rc::new(CellInner {
                state: RefCell::new(CellState {
                    id: NEXT_CELL_ID.fetch_add(1, Ordering::Relaxed),
                    ready: false,
                    value: None,
                    may_be_null: options.may_be_null,
                    users: 0,
                    subscribers: Vec::new(),
                    notifiers: Vec::new(),
                    thens: Vec::new(),
                    default: None,
                    triggering: false,
                    next_token: 1,
                }),
                driver: RefCell::new(None),
                cache: RefCell::new(options.cache),
            }),
        }
    }

    /// A cell with lifecycle hooks (a producer or derived cell).
    #[must_use]
    pub fn with_driver(options: CellOptions, driver: Rc<dyn Driver>) -> Cell {
        let cell = Cell::with_options(options);
        *cell.inner.driver.borrow_mut() = Some(driver);
        cell
    }

    /// Monotonic identifier, for diagnostics only.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.state.borrow().id
    }

    /// Whether the cell currently has a definite value.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.inner.state.borrow().ready
    }

    /// The current value, if ready.
    #[must_use]
    pub fn value(&self) -> Option<Value> {
        let state = self.inner.state.borrow();
        if state.ready { state.value.clone() } else { None }
    }

    /// Number of live interest-holders.
    #[must_use]
    pub fn users(&self) -> usize {
        self.inner.state.borrow().users
    }

    /// Two handles to the same cell?
    #[must_use]
    pub fn ptr_eq(&self, other: &Cell) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    #[must_use]
    pub fn downgrade(&self) -> WeakCell {
        WeakCell {
            inner: Rc::downgrade(&self.inner),
        }
    }

    /// Completion predicate of the attached driver (defaults to `false`).
    #[must_use]
    pub fn is_done(&self, value: &Value) -> bool {
        let driver = self.inner.driver.borrow().clone();
        driver.is_some_and(|d| d.is_done(value))
    }

    // -- lifecycle ----------------------------------------------------------

    /// Register interest. On the 0→1 transition the cell is initialised:
    /// through its cache bridge when cache-identified, otherwise directly.
    pub fn acquire(&self) {
        let first = {
            let mut state = self.inner.state.borrow_mut();
            state.users += 1;
            state.users == 1
        };
        if first {
            match self.cache_bridge() {
                Some((link, bridge)) => bridge.initialise(&link.uuid, self, &link.codec),
                None => self.initialise(),
            }
        }
    }

    /// Release interest. Symmetric with [`acquire`](Cell::acquire).
    ///
    /// # Panics
    ///
    /// Panics if the user-count is already zero.
    pub fn release(&self) {
        let last = {
            let mut state = self.inner.state.borrow_mut();
            assert!(
                state.users > 0,
                "release() on cell #{} with zero users",
                state.id
            );
            state.users -= 1;
            state.users == 0
        };
        if last {
            match self.cache_bridge() {
                Some((link, bridge)) => bridge.finalise(&link.uuid, self),
                None => self.finalise(),
            }
        }
    }

    /// Run the driver's `init` hook directly.
    ///
    /// Normally invoked by [`acquire`](Cell::acquire); exposed so a cache
    /// that owns activation policy can start the one primary cell it elects.
    pub fn initialise(&self) {
        let driver = self.inner.driver.borrow().clone();
        if let Some(driver) = driver {
            driver.init(self);
        }
    }

    /// Run the driver's `fin` hook directly. Counterpart of
    /// [`initialise`](Cell::initialise).
    pub fn finalise(&self) {
        let driver = self.inner.driver.borrow().clone();
        if let Some(driver) = driver {
            driver.fin(self);
        }
    }

    fn cache_bridge(&self) -> Option<(CacheLink, Rc<dyn CacheBridge>)> {
        let link = self.inner.cache.borrow().clone()?;
        let bridge = link.bridge.upgrade()?;
        Some((link, bridge))
    }

    // -- mutation -----------------------------------------------------------

    /// Propose a new value.
    ///
    /// `None` means "no value at all" and is ignored with a warning (distinct
    /// from `Value::Null`, which is a value, though for a non-nullable cell
    /// a `null` proposal resets instead). A proposal canonically equal to the
    /// current ready value is not a transition.
    pub fn changed(&self, value: Option<Value>) {
        let Some(value) = value else {
            tracing::warn!(cell = self.id(), "changed() without a value; ignoring");
            return;
        };
        self.apply(value, true);
    }

    /// Apply a cache- or parent-sourced update without re-publishing it.
    ///
    /// Same policy as [`changed`](Cell::changed), except `None` resets (an
    /// absent upstream value means "not ready") and nothing is written back
    /// through the cache bridge, so mirrored updates cannot echo.
    pub fn mirror(&self, value: Option<Value>) {
        match value {
            Some(value) => self.apply(value, false),
            None => self.reset_inner(false),
        }
    }

    fn apply(&self, value: Value, publish: bool) {
        let (may_be_null, transition) = {
            let state = self.inner.state.borrow();
            let transition = !state.ready
                || state
                    .value
                    .as_ref()
                    .is_none_or(|current| !canonical_eq(current, &value));
            (state.may_be_null, transition)
        };
        if value.is_null() && !may_be_null {
            self.reset_inner(publish);
            return;
        }
        if transition {
            self.trigger_inner(value, publish);
        }
    }

    /// Force a transition to `value`, bypassing the equality gate.
    pub fn trigger(&self, value: Value) {
        self.trigger_inner(value, true);
    }

    fn trigger_inner(&self, value: Value, publish: bool) {
        let id = {
            let mut state = self.inner.state.borrow_mut();
            if state.triggering {
                tracing::warn!(cell = state.id, "re-entrant trigger rejected");
                return;
            }
            state.triggering = true;
            state.ready = true;
            state.value = Some(value.clone());
            state.id
        };
        TRIGGERS_TOTAL.fetch_add(1, Ordering::Relaxed);
        let _cascade = CascadeGuard::enter(id);

        // Snapshots keep the state borrow released while observers run, so
        // observers may tie/untie/acquire on this same cell.
        let notifiers: Vec<Rc<dyn Fn()>> = {
            let state = self.inner.state.borrow();
            state.notifiers.iter().map(|(_, f)| Rc::clone(f)).collect()
        };
        for notifier in notifiers {
            run_isolated(|| notifier());
        }

        let subscribers: Vec<Rc<dyn Fn(&Value)>> = {
            let state = self.inner.state.borrow();
            state.subscribers.iter().map(|(_, f)| Rc::clone(f)).collect()
        };
        for subscriber in subscribers {
            run_isolated(|| subscriber(&value));
        }

        let one_shots = {
            let mut state = self.inner.state.borrow_mut();
            std::mem::take(&mut state.thens)
        };
        for one_shot in one_shots {
            run_isolated_once(one_shot, &value);
            // Balances the implicit acquire done at `then` registration.
            self.release();
        }

        self.inner.state.borrow_mut().triggering = false;
        if publish {
            self.publish(Some(&value));
        }
    }

    /// Return to not-ready, or to the configured default.
    ///
    /// Fires readiness-notifiers (not change-subscribers). A no-op while
    /// already not ready.
    pub fn reset(&self) {
        self.reset_inner(true);
    }

    fn reset_inner(&self, publish: bool) {
        let default = self.inner.state.borrow().default.clone();
        if let Some(default) = default {
            // A reset is replaced by the default; equal-value redundancy is
            // gated the same way as `changed`.
            self.apply(default, publish);
            return;
        }

        let id = {
            let mut state = self.inner.state.borrow_mut();
            if state.triggering {
                tracing::warn!(cell = state.id, "re-entrant reset rejected");
                return;
            }
            if !state.ready {
                return;
            }
            state.triggering = true;
            state.ready = false;
            state.value = None;
            state.id
        };
        let _cascade = CascadeGuard::enter(id);

        let notifiers: Vec<Rc<dyn Fn()>> = {
            let state = self.inner.state.borrow();
            state.notifiers.iter().map(|(_, f)| Rc::clone(f)).collect()
        };
        for notifier in notifiers {
            run_isolated(|| notifier());
        }

        self.inner.state.borrow_mut().triggering = false;
        if publish {
            self.publish(None);
        }
    }

    /// Configure a default value. If the cell is currently not ready it
    /// adopts the default immediately, and every future reset lands on the
    /// default instead of not-ready.
    ///
    /// A `null` default on a non-nullable cell is ignored with a warning: a
    /// value the cell cannot hold cannot stand in for "not ready" either.
    pub fn default_to(&self, value: Value) {
        let adopt = {
            let mut state = self.inner.state.borrow_mut();
            if value.is_null() && !state.may_be_null {
                tracing::warn!(cell = state.id, "null default on a non-nullable cell; ignoring");
                return;
            }
            state.default = Some(value.clone());
            !state.ready
        };
        if adopt {
            self.trigger_inner(value, true);
        }
    }

    fn publish(&self, value: Option<&Value>) {
        if let Some((link, bridge)) = self.cache_bridge() {
            bridge.publish(&link.uuid, value);
        }
    }

    // -- observation --------------------------------------------------------

    /// Register a change-subscriber; implicit [`acquire`](Cell::acquire).
    ///
    /// If the cell is already ready, `f` is invoked synchronously with the
    /// current value before this returns.
    pub fn tie(&self, f: impl Fn(&Value) + 'static) -> Token {
        self.acquire();
        let callback: Rc<dyn Fn(&Value)> = Rc::new(f);
        let (token, current) = {
            let mut state = self.inner.state.borrow_mut();
            let token = state.next_token;
            state.next_token += 1;
            state.subscribers.push((token, Rc::clone(&callback)));
            let current = if state.ready { state.value.clone() } else { None };
            (token, current)
        };
        if let Some(value) = current {
            run_isolated(|| callback(&value));
        }
        token
    }

    /// Remove a change-subscriber; implicit [`release`](Cell::release).
    ///
    /// An unknown token is logged and otherwise ignored (the release is
    /// skipped so the user-count stays balanced).
    pub fn untie(&self, token: Token) {
        let found = {
            let mut state = self.inner.state.borrow_mut();
            let before = state.subscribers.len();
            state.subscribers.retain(|(t, _)| *t != token);
            state.subscribers.len() != before
        };
        if found {
            self.release();
        } else {
            tracing::warn!(cell = self.id(), token, "untie() of unknown subscriber");
        }
    }

    /// Register a readiness-notifier; implicit acquire. Notifiers fire on
    /// every transition (ready↔not-ready and ready→new-ready), before
    /// change-subscribers, and receive no value.
    pub fn notify(&self, f: impl Fn() + 'static) -> Token {
        self.acquire();
        let mut state = self.inner.state.borrow_mut();
        let token = state.next_token;
        state.next_token += 1;
        state.notifiers.push((token, Rc::new(f)));
        token
    }

    /// Remove a readiness-notifier; implicit release.
    pub fn unnotify(&self, token: Token) {
        let found = {
            let mut state = self.inner.state.borrow_mut();
            let before = state.notifiers.len();
            state.notifiers.retain(|(t, _)| *t != token);
            state.notifiers.len() != before
        };
        if found {
            self.release();
        } else {
            tracing::warn!(cell = self.id(), token, "unnotify() of unknown notifier");
        }
    }

    /// Run `f` once with the next ready value (immediately if already ready).
    pub fn then(&self, f: impl FnOnce(&Value) + 'static) {
        self.acquire();
        let current = {
            let state = self.inner.state.borrow();
            if state.ready { state.value.clone() } else { None }
        };
        match current {
            Some(value) => {
                run_isolated_once(Box::new(f), &value);
                self.release();
            }
            None => {
                self.inner.state.borrow_mut().thens.push(Box::new(f));
            }
        }
    }

    /// Like [`tie`](Cell::tie), but detaches itself after the first value for
    /// which the driver's completion predicate holds.
    ///
    /// # Panics
    ///
    /// Panics if the cell's driver does not supply a completion predicate.
    pub fn done(&self, f: impl Fn(&Value) + 'static) -> Token {
        let driver = self
            .inner
            .driver
            .borrow()
            .clone()
            .filter(|d| d.supports_done());
        let Some(driver) = driver else {
            panic!(
                "done() on cell #{} whose driver has no completion predicate",
                self.id()
            );
        };

        let slot: Rc<RefCell<Option<Token>>> = Rc::new(RefCell::new(None));
        let completed_early = Rc::new(StdCell::new(false));
        let weak = self.downgrade();
        let slot_in = Rc::clone(&slot);
        let completed_in = Rc::clone(&completed_early);
        let token = self.tie(move |value| {
            f(value);
            if driver.is_done(value) {
                match (weak.upgrade(), slot_in.borrow_mut().take()) {
                    (Some(cell), Some(token)) => cell.untie(token),
                    // Completion during the synchronous registration call:
                    // the token is not known yet, so flag it for below.
                    _ => completed_in.set(true),
                }
            }
        });
        if completed_early.get() {
            self.untie(token);
        } else {
            *slot.borrow_mut() = Some(token);
        }
        token
    }

    /// Tie a tracing logger to this cell; returns the token for `untie`.
    pub fn log(&self) -> Token {
        let id = self.id();
        self.tie(move |value| tracing::info!(cell = id, %value, "cell value"))
    }
}

impl Default for Cell {
    fn default() -> Self {
        Cell::new()
    }
}

impl fmt::Debug for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.borrow();
        f.debug_struct("Cell")
            .field("id", &state.id)
            .field("ready", &state.ready)
            .field("users", &state.users)
            .field("subscribers", &state.subscribers.len())
            .field("notifiers", &state.notifiers.len())
            .finish()
    }
}

/// Run an observer callback, isolating panics so the remaining observers and
/// the cell's own bookkeeping are unaffected.
pub(crate) fn run_isolated(f: impl FnOnce()) {
    if std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)).is_err() {
        tracing::error!("observer callback panicked; continuing");
    }
}

fn run_isolated_once(f: Box<dyn FnOnce(&Value)>, value: &Value) {
    if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| f(value))).is_err() {
        tracing::error!("one-shot observer panicked; continuing");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::Cell as Counter;

    #[test]
    fn starts_not_ready() {
        let cell = Cell::new();
        assert!(!cell.is_ready());
        assert_eq!(cell.value(), None);
        assert_eq!(cell.users(), 0);
    }

    #[test]
    fn trigger_then_dedup_then_new_value() {
        let cell = Cell::new();
        let calls = Rc::new(RefCell::new(Vec::new()));
        let calls_clone = Rc::clone(&calls);
        let _t = cell.tie(move |v| calls_clone.borrow_mut().push(v.clone()));

        cell.trigger(json!(69));
        assert_eq!(*calls.borrow(), vec![json!(69)]);

        // Equal serialisation is not a transition through `changed`.
        cell.changed(Some(json!(69)));
        assert_eq!(calls.borrow().len(), 1);

        cell.changed(Some(json!(70)));
        assert_eq!(*calls.borrow(), vec![json!(69), json!(70)]);
    }

    #[test]
    fn changed_without_value_is_ignored() {
        let cell = Cell::new();
        cell.changed(None);
        assert!(!cell.is_ready());
    }

    #[test]
    fn null_resets_unless_nullable() {
        let strict = Cell::new();
        strict.trigger(json!(1));
        assert!(strict.is_ready());
        strict.changed(Some(Value::Null));
        assert!(!strict.is_ready(), "null must reset a non-nullable cell");

        let lax = Cell::nullable();
        lax.changed(Some(Value::Null));
        assert!(lax.is_ready());
        assert_eq!(lax.value(), Some(Value::Null));
    }

    #[test]
    fn tie_fires_immediately_when_ready() {
        let cell = Cell::new();
        cell.trigger(json!("warm"));
        let seen = Rc::new(RefCell::new(None));
        let seen_clone = Rc::clone(&seen);
        let _t = cell.tie(move |v| *seen_clone.borrow_mut() = Some(v.clone()));
        assert_eq!(*seen.borrow(), Some(json!("warm")));
    }

    #[test]
    fn untie_stops_delivery_and_balances_users() {
        let cell = Cell::new();
        let count = Rc::new(Counter::new(0u32));
        let count_clone = Rc::clone(&count);
        let token = cell.tie(move |_| count_clone.set(count_clone.get() + 1));
        assert_eq!(cell.users(), 1);

        cell.trigger(json!(1));
        assert_eq!(count.get(), 1);

        cell.untie(token);
        assert_eq!(cell.users(), 0);
        cell.trigger(json!(2));
        assert_eq!(count.get(), 1, "untied subscriber must not fire");
    }

    #[test]
    fn untie_unknown_token_is_soft() {
        let cell = Cell::new();
        let token = cell.tie(|_| {});
        cell.untie(9999); // unknown: warn, no user-count change
        assert_eq!(cell.users(), 1);
        cell.untie(token);
        assert_eq!(cell.users(), 0);
    }

    #[test]
    fn notifiers_fire_before_subscribers_in_registration_order() {
        let cell = Cell::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        let l = Rc::clone(&log);
        let _s1 = cell.tie(move |_| l.borrow_mut().push("sub1"));
        let l = Rc::clone(&log);
        let _n1 = cell.notify(move || l.borrow_mut().push("note1"));
        let l = Rc::clone(&log);
        let _n2 = cell.notify(move || l.borrow_mut().push("note2"));
        let l = Rc::clone(&log);
        let _s2 = cell.tie(move |_| l.borrow_mut().push("sub2"));

        cell.trigger(json!(0));
        assert_eq!(*log.borrow(), vec!["note1", "note2", "sub1", "sub2"]);
    }

    #[test]
    fn notify_fires_on_reset_and_on_new_ready_value() {
        let cell = Cell::new();
        let notes = Rc::new(Counter::new(0u32));
        let ties = Rc::new(Counter::new(0u32));
        let n = Rc::clone(&notes);
        let _nt = cell.notify(move || n.set(n.get() + 1));
        let t = Rc::clone(&ties);
        let _tt = cell.tie(move |_| t.set(t.get() + 1));

        cell.trigger(json!(1)); // not-ready -> ready
        cell.trigger(json!(2)); // ready -> new ready
        cell.reset(); // ready -> not-ready
        assert_eq!(notes.get(), 3);
        assert_eq!(ties.get(), 2, "reset must not reach change-subscribers");
    }

    #[test]
    fn then_runs_once() {
        let cell = Cell::new();
        let count = Rc::new(Counter::new(0u32));
        let c = Rc::clone(&count);
        cell.then(move |_| c.set(c.get() + 1));
        assert_eq!(cell.users(), 1, "then holds interest until drained");

        cell.trigger(json!(1));
        assert_eq!(count.get(), 1);
        assert_eq!(cell.users(), 0, "drain releases the implicit acquire");

        cell.trigger(json!(2));
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn then_on_ready_cell_is_synchronous() {
        let cell = Cell::new();
        cell.trigger(json!(5));
        let seen = Rc::new(Counter::new(false));
        let s = Rc::clone(&seen);
        cell.then(move |v| {
            assert_eq!(v, &json!(5));
            s.set(true);
        });
        assert!(seen.get());
        assert_eq!(cell.users(), 0);
    }

    #[test]
    fn reentrant_trigger_is_rejected() {
        let cell = Cell::new();
        let inner = cell.clone();
        let _t = cell.tie(move |_| {
            // Attempted mutation of the cell being notified: rejected.
            inner.trigger(json!("loop"));
        });
        cell.trigger(json!("first"));
        assert_eq!(cell.value(), Some(json!("first")));
    }

    #[test]
    fn observers_may_trigger_other_cells() {
        let a = Cell::new();
        let b = Cell::new();
        let b_in = b.clone();
        let _t = a.tie(move |v| b_in.trigger(v.clone()));
        let seen = Rc::new(RefCell::new(None));
        let s = Rc::clone(&seen);
        let _u = b.tie(move |v| *s.borrow_mut() = Some(v.clone()));

        a.trigger(json!(3));
        assert_eq!(*seen.borrow(), Some(json!(3)));
    }

    #[test]
    fn default_to_makes_cell_ready_and_replaces_reset() {
        let cell = Cell::new();
        let values = Rc::new(RefCell::new(Vec::new()));
        let v = Rc::clone(&values);
        let _t = cell.tie(move |val| v.borrow_mut().push(val.clone()));

        cell.default_to(json!(5));
        assert_eq!(*values.borrow(), vec![json!(5)]);

        cell.trigger(json!(9));
        cell.reset();
        assert_eq!(*values.borrow(), vec![json!(5), json!(9), json!(5)]);

        // Reset while already showing the default: no extra transition.
        cell.reset();
        assert_eq!(values.borrow().len(), 3);
    }

    #[test]
    fn acquire_release_balance_is_observably_neutral() {
        let cell = Cell::new();
        cell.trigger(json!(1));
        cell.acquire();
        cell.release();
        assert!(cell.is_ready());
        assert_eq!(cell.value(), Some(json!(1)));
        assert_eq!(cell.users(), 0);
    }

    #[test]
    #[should_panic(expected = "zero users")]
    fn release_underflow_panics() {
        Cell::new().release();
    }

    struct CountingDriver {
        inits: Rc<Counter<u32>>,
        fins: Rc<Counter<u32>>,
    }

    impl Driver for CountingDriver {
        fn init(&self, _cell: &Cell) {
            self.inits.set(self.inits.get() + 1);
        }
        fn fin(&self, _cell: &Cell) {
            self.fins.set(self.fins.get() + 1);
        }
    }

    #[test]
    fn driver_hooks_run_on_lifecycle_edges_only() {
        let inits = Rc::new(Counter::new(0));
        let fins = Rc::new(Counter::new(0));
        let cell = Cell::with_driver(
            CellOptions::default(),
            Rc::new(CountingDriver {
                inits: Rc::clone(&inits),
                fins: Rc::clone(&fins),
            }),
        );

        cell.acquire();
        cell.acquire();
        assert_eq!((inits.get(), fins.get()), (1, 0));

        cell.release();
        assert_eq!((inits.get(), fins.get()), (1, 0));
        cell.release();
        assert_eq!((inits.get(), fins.get()), (1, 1));

        cell.acquire();
        assert_eq!((inits.get(), fins.get()), (2, 1));
        cell.release();
    }

    struct DoneAtTen;

    impl Driver for DoneAtTen {
        fn supports_done(&self) -> bool {
            true
        }
        fn is_done(&self, value: &Value) -> bool {
            value.as_i64().is_some_and(|n| n >= 10)
        }
    }

    #[test]
    fn done_unties_after_predicate_holds() {
        let cell = Cell::with_driver(CellOptions::default(), Rc::new(DoneAtTen));
        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = Rc::clone(&seen);
        let _token = cell.done(move |v| s.borrow_mut().push(v.clone()));

        cell.trigger(json!(3));
        cell.trigger(json!(10));
        cell.trigger(json!(11));
        assert_eq!(*seen.borrow(), vec![json!(3), json!(10)]);
        assert_eq!(cell.users(), 0, "done must untie itself after completion");
    }

    #[test]
    #[should_panic(expected = "completion predicate")]
    fn done_without_predicate_panics() {
        Cell::new().done(|_| {});
    }

    #[test]
    fn panicking_subscriber_does_not_stop_the_rest() {
        let cell = Cell::new();
        let reached = Rc::new(Counter::new(false));
        let _bad = cell.tie(|_| panic!("boom"));
        let r = Rc::clone(&reached);
        let _good = cell.tie(move |_| r.set(true));

        cell.trigger(json!(1));
        assert!(reached.get());
        assert!(cell.is_ready(), "cell state must survive observer panics");

        cell.trigger(json!(2));
        assert_eq!(cell.value(), Some(json!(2)));
    }

    #[test]
    fn trigger_counter_is_monotonic() {
        let before = triggers_total();
        let cell = Cell::new();
        cell.trigger(json!(1));
        cell.trigger(json!(2));
        assert!(triggers_total() >= before + 2);
    }
}
