#![forbid(unsafe_code)]

//! Reactive cells: re-run a callback whenever structured inputs change.
//!
//! # How it works
//!
//! 1. On activation, the cell walks each input [`Term`] to the configured
//!    resolution depth, registering a readiness-notifier on every live cell
//!    and a completion handler on every pending promise, and registers a
//!    notifier on each *pure dependency* (a cell whose changes re-run the
//!    callback without contributing a value).
//! 2. Every notification lands in the same trampoline: when all inputs are
//!    ready the inputs are deep-substituted and the callback runs with the
//!    resolved argument list; otherwise the callback observes "not ready".
//! 3. The trampoline also runs once at activation, so inputs that are
//!    already ready produce a value without waiting for a change.
//! 4. On deactivation every notifier is unregistered in reverse registration
//!    order.

use std::cell::RefCell;
use std::rc::Rc;

use crate::cell::{Cell, CellOptions, Driver, Token, WeakCell};
use crate::term::{Live, Term};
use crate::value::Value;

/// The recomputation engine shared by reactive and transform cells.
///
/// The callback receives `Some(args)` when every input is ready and `None`
/// when at least one is not; the wrapping cell decides what "not ready"
/// means (reset, or keep the latched value).
pub(crate) struct ReactiveCore {
    inputs: Vec<Term>,
    depends: Vec<Cell>,
    depth: usize,
    callback: Box<dyn Fn(&Cell, Option<&[Value]>)>,
    registered: RefCell<Vec<(Cell, Token)>>,
}

impl ReactiveCore {
    pub(crate) fn new(
        inputs: Vec<Term>,
        depends: Vec<Cell>,
        depth: usize,
        callback: impl Fn(&Cell, Option<&[Value]>) + 'static,
    ) -> Rc<ReactiveCore> {
        Rc::new(ReactiveCore {
            inputs,
            depends,
            depth,
            callback: Box::new(callback),
            registered: RefCell::new(Vec::new()),
        })
    }

    pub(crate) fn init(self: &Rc<Self>, cell: &Cell) {
        let trampoline = self.trampoline(cell.downgrade());
        let mut registered = Vec::new();

        for dependency in &self.depends {
            let hop = Rc::clone(&trampoline);
            let token = dependency.notify(move || hop());
            registered.push((dependency.clone(), token));
        }

        for input in &self.inputs {
            input.for_each_live(self.depth, &mut |live| match live {
                Live::Cell(input_cell) => {
                    let hop = Rc::clone(&trampoline);
                    let token = input_cell.notify(move || hop());
                    registered.push((input_cell.clone(), token));
                }
                Live::Promise(promise) => {
                    // The promise keeps its own resolved value; settlement
                    // just re-enters the trampoline. Already-settled
                    // promises are picked up by the activation poll below.
                    if !promise.is_settled() {
                        let hop = Rc::clone(&trampoline);
                        promise.on_settle(move |_| hop());
                    }
                }
            });
        }

        *self.registered.borrow_mut() = registered;
        self.poll(cell);
    }

    pub(crate) fn fin(&self) {
        let mut registered = std::mem::take(&mut *self.registered.borrow_mut());
        while let Some((cell, token)) = registered.pop() {
            cell.unnotify(token);
        }
    }

    pub(crate) fn poll(&self, cell: &Cell) {
        if self.inputs.iter().all(|input| input.ready(self.depth)) {
            let args: Vec<Value> = self
                .inputs
                .iter()
                .map(|input| input.resolve(self.depth))
                .collect();
            (self.callback)(cell, Some(&args));
        } else {
            (self.callback)(cell, None);
        }
    }

    fn trampoline(self: &Rc<Self>, weak: WeakCell) -> Rc<dyn Fn()> {
        let core = Rc::clone(self);
        Rc::new(move || {
            if let Some(cell) = weak.upgrade() {
                core.poll(&cell);
            }
        })
    }
}

pub(crate) struct ReactiveDriver {
    pub(crate) core: Rc<ReactiveCore>,
}

impl Driver for ReactiveDriver {
    fn init(&self, cell: &Cell) {
        self.core.init(cell);
    }

    fn fin(&self, _cell: &Cell) {
        self.core.fin();
    }
}

impl Cell {
    /// A cell that re-runs `callback` with the resolved inputs whenever any
    /// input cell/promise (to `depth`) or pure dependency changes, and
    /// resets while any input is not ready.
    ///
    /// The callback receives the cell itself and is responsible for moving
    /// it, usually via [`Cell::changed`] or [`Cell::trigger`].
    #[must_use]
    pub fn reactive(
        inputs: Vec<Term>,
        depends: Vec<Cell>,
        depth: usize,
        callback: impl Fn(&Cell, &[Value]) + 'static,
    ) -> Cell {
        let core = ReactiveCore::new(inputs, depends, depth, move |cell, args| match args {
            Some(args) => callback(cell, args),
            None => cell.reset(),
        });
        Cell::with_driver(CellOptions::default(), Rc::new(ReactiveDriver { core }))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
