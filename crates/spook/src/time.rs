#![forbid(unsafe_code)]

//! Clock and timer hosts, and the interval producer cell.
//!
//! The graph itself never reads the wall clock or spins threads; it asks a
//! [`Clock`] for the time and a [`Timers`] host for periodic callbacks. The
//! deterministic [`ManualTimers`] implementation drives both in tests: time
//! only moves when [`advance`](ManualTimers::advance) is called.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};

use web_time::{Duration, SystemTime, UNIX_EPOCH};

use crate::cell::{Cell, CellOptions, Driver};
use crate::value::Value;

/// Wall-clock seconds source.
pub trait Clock {
    /// Seconds since the Unix epoch.
    fn now_seconds(&self) -> u64;
}

/// The host's real clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_seconds(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or(0)
    }
}

/// Cancels its timer when dropped.
pub struct TimerGuard {
    cancel: Option<Box<dyn FnOnce()>>,
}

impl TimerGuard {
    pub fn new(cancel: impl FnOnce() + 'static) -> TimerGuard {
        TimerGuard {
            cancel: Some(Box::new(cancel)),
        }
    }
}

impl Drop for TimerGuard {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for TimerGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerGuard").finish_non_exhaustive()
    }
}

/// Periodic callback facility supplied by the host.
pub trait Timers {
    /// Call `tick` every `period` until the guard is dropped.
    fn every(&self, period: Duration, tick: Rc<dyn Fn()>) -> TimerGuard;
}

struct ManualTimer {
    period: Duration,
    due: Duration,
    tick: Rc<dyn Fn()>,
}

#[derive(Default)]
struct ManualState {
    now: Duration,
    timers: BTreeMap<u64, ManualTimer>,
    next_id: u64,
}

/// A deterministic timer host + clock for tests and simulations.
///
/// Ticks fire, in due order, only inside [`advance`](ManualTimers::advance).
#[derive(Clone, Default)]
pub struct ManualTimers {
    state: Rc<RefCell<ManualState>>,
}

impl ManualTimers {
    #[must_use]
    pub fn new() -> ManualTimers {
        ManualTimers::default()
    }

    /// Number of live timers.
    #[must_use]
    pub fn active(&self) -> usize {
        self.state.borrow().timers.len()
    }

    /// Current virtual time.
    #[must_use]
    pub fn now(&self) -> Duration {
        self.state.borrow().now
    }

    /// Move virtual time forward, firing every tick that falls due, in due
    /// order. Ticks scheduled by other ticks during the advance also fire if
    /// they fall within the window.
    pub fn advance(&self, delta: Duration) {
        let target = self.state.borrow().now + delta;
        loop {
            let next = {
                let state = self.state.borrow();
                state
                    .timers
                    .iter()
                    .filter(|(_, timer)| timer.due <= target)
                    .min_by_key(|(id, timer)| (timer.due, **id))
                    .map(|(id, timer)| (*id, timer.due, Rc::clone(&timer.tick)))
            };
            let Some((id, due, tick)) = next else { break };
            {
                let mut state = self.state.borrow_mut();
                state.now = due;
                if let Some(timer) = state.timers.get_mut(&id) {
                    timer.due = due + timer.period;
                }
            }
            // Fire outside the borrow: a tick may add or cancel timers.
            tick();
        }
        self.state.borrow_mut().now = target;
    }
}

impl Timers for ManualTimers {
    fn every(&self, period: Duration, tick: Rc<dyn Fn()>) -> TimerGuard {
        let id = {
            let mut state = self.state.borrow_mut();
            let id = state.next_id;
            state.next_id += 1;
            let due = state.now + period;
            state.timers.insert(id, ManualTimer { period, due, tick });
            id
        };
        let weak: Weak<RefCell<ManualState>> = Rc::downgrade(&self.state);
        TimerGuard::new(move || {
            if let Some(state) = weak.upgrade() {
                state.borrow_mut().timers.remove(&id);
            }
        })
    }
}

impl Clock for ManualTimers {
    fn now_seconds(&self) -> u64 {
        self.state.borrow().now.as_secs()
    }
}

/// Interval producer: emits the current wall-clock second, once at
/// activation and then at a one-second cadence while in use.
struct IntervalDriver {
    timers: Rc<dyn Timers>,
    clock: Rc<dyn Clock>,
    guard: RefCell<Option<TimerGuard>>,
}

impl Driver for IntervalDriver {
    fn init(&self, cell: &Cell) {
        let weak = cell.downgrade();
        let clock = Rc::clone(&self.clock);
        let tick: Rc<dyn Fn()> = Rc::new(move || {
            if let Some(cell) = weak.upgrade() {
                cell.trigger(Value::from(clock.now_seconds()));
            }
        });
        *self.guard.borrow_mut() = Some(self.timers.every(Duration::from_secs(1), tick));
        cell.trigger(Value::from(self.clock.now_seconds()));
    }

    fn fin(&self, _cell: &Cell) {
        self.guard.borrow_mut().take();
    }
}

impl Cell {
    /// A cell showing the current time in whole seconds, updated every
    /// second while in use. The timer is held only between the first
    /// acquire and the last release.
    #[must_use]
    pub fn interval(timers: Rc<dyn Timers>, clock: Rc<dyn Clock>) -> Cell {
        Cell::with_driver(
            CellOptions::default(),
            Rc::new(IntervalDriver {
                timers,
                clock,
                guard: RefCell::new(None),
            }),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn hosts() -> (Rc<ManualTimers>, Rc<dyn Timers>, Rc<dyn Clock>) {
        let manual = Rc::new(ManualTimers::new());
        (
            Rc::clone(&manual),
            Rc::clone(&manual) as Rc<dyn Timers>,
            manual as Rc<dyn Clock>,
        )
    }

    #[test]
    fn manual_timers_fire_in_due_order() {
        let timers = ManualTimers::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        let l = Rc::clone(&log);
        let _slow = timers.every(Duration::from_secs(3), Rc::new(move || l.borrow_mut().push(3)));
        let l = Rc::clone(&log);
        let _fast = timers.every(Duration::from_secs(2), Rc::new(move || l.borrow_mut().push(2)));

        timers.advance(Duration::from_secs(6));
        assert_eq!(*log.borrow(), vec![2, 3, 2, 2, 3]);
    }

    #[test]
    fn dropping_the_guard_cancels() {
        let timers = ManualTimers::new();
        let count = Rc::new(RefCell::new(0u32));
        let c = Rc::clone(&count);
        let guard = timers.every(Duration::from_secs(1), Rc::new(move || *c.borrow_mut() += 1));

        timers.advance(Duration::from_secs(2));
        assert_eq!(*count.borrow(), 2);
        assert_eq!(timers.active(), 1);

        drop(guard);
        assert_eq!(timers.active(), 0);
        timers.advance(Duration::from_secs(5));
        assert_eq!(*count.borrow(), 2);
    }

    #[test]
    fn interval_cell_emits_each_second_while_in_use() {
        let (manual, timers, clock) = hosts();
        manual.advance(Duration::from_secs(100));

        let ticker = Cell::interval(timers, clock);
        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = Rc::clone(&seen);
        let token = ticker.tie(move |v| s.borrow_mut().push(v.clone()));

        assert_eq!(*seen.borrow(), vec![json!(100)], "emits once at activation");
        manual.advance(Duration::from_secs(2));
        assert_eq!(*seen.borrow(), vec![json!(100), json!(101), json!(102)]);

        ticker.untie(token);
        manual.advance(Duration::from_secs(2));
        assert_eq!(seen.borrow().len(), 3, "released interval must stop");
    }

    #[test]
    fn interval_cell_releases_its_timer() {
        let (manual, timers, clock) = hosts();
        let ticker = Cell::interval(timers, clock);

        assert_eq!(manual.active(), 0);
        let token = ticker.tie(|_| {});
        assert_eq!(manual.active(), 1);
        ticker.untie(token);
        assert_eq!(manual.active(), 0);
    }

    #[test]
    fn system_clock_is_sane() {
        // 2020-01-01 as a lower bound.
        assert!(SystemClock.now_seconds() > 1_577_836_800);
    }
}
