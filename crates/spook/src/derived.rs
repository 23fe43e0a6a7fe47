#![forbid(unsafe_code)]

//! Small fixed cell specializations: latch, default, readiness probes.
//!
//! These are thin drivers over a single input cell. They register exactly
//! one readiness-notifier while active and tear it down symmetrically (the
//! latch even earlier, the moment it adopts its value).

use std::cell::Cell as StdCell;
use std::cell::RefCell;
use std::rc::Rc;

use crate::cell::{Cell, CellOptions, Driver, Token};
use crate::value::Value;

struct LatchShared {
    token: RefCell<Option<Token>>,
    latched: StdCell<bool>,
}

/// Latch: adopt the input's first ready value, then detach for good.
struct LatchDriver {
    input: Cell,
    default: Option<Value>,
    shared: Rc<LatchShared>,
}

impl Driver for LatchDriver {
    fn init(&self, cell: &Cell) {
        if self.shared.latched.get() {
            // Permanently detached; the adopted value persists in the cell.
            return;
        }
        if let Some(value) = self.input.value() {
            self.shared.latched.set(true);
            cell.changed(Some(value));
            return;
        }
        if let Some(default) = &self.default {
            cell.changed(Some(default.clone()));
        }

        let weak = cell.downgrade();
        let weak_input = self.input.downgrade();
        let shared = Rc::clone(&self.shared);
        let token = self.input.notify(move || {
            let (Some(cell), Some(input)) = (weak.upgrade(), weak_input.upgrade()) else {
                return;
            };
            let Some(value) = input.value() else { return };
            shared.latched.set(true);
            if let Some(token) = shared.token.borrow_mut().take() {
                input.unnotify(token);
            }
            cell.changed(Some(value));
        });
        *self.shared.token.borrow_mut() = Some(token);
    }

    fn fin(&self, _cell: &Cell) {
        if let Some(token) = self.shared.token.borrow_mut().take() {
            self.input.unnotify(token);
        }
    }
}

/// Default: always ready; the input's value when ready, `default` otherwise.
struct DefaultDriver {
    input: Cell,
    default: Value,
    token: RefCell<Option<Token>>,
}

impl DefaultDriver {
    fn current(input: &Cell, default: &Value) -> Value {
        input.value().unwrap_or_else(|| default.clone())
    }
}

impl Driver for DefaultDriver {
    fn init(&self, cell: &Cell) {
        let weak = cell.downgrade();
        let weak_input = self.input.downgrade();
        let default = self.default.clone();
        let token = self.input.notify(move || {
            let (Some(cell), Some(input)) = (weak.upgrade(), weak_input.upgrade()) else {
                return;
            };
            cell.changed(Some(Self::current(&input, &default)));
        });
        *self.token.borrow_mut() = Some(token);
        cell.changed(Some(Self::current(&self.input, &self.default)));
    }

    fn fin(&self, _cell: &Cell) {
        if let Some(token) = self.token.borrow_mut().take() {
            self.input.unnotify(token);
        }
    }
}

/// Readiness probe: always ready; a boolean mirroring the input's readiness.
struct ProbeDriver {
    input: Cell,
    negate: bool,
    token: RefCell<Option<Token>>,
}

impl Driver for ProbeDriver {
    fn init(&self, cell: &Cell) {
        let weak = cell.downgrade();
        let weak_input = self.input.downgrade();
        let negate = self.negate;
        let token = self.input.notify(move || {
            let (Some(cell), Some(input)) = (weak.upgrade(), weak_input.upgrade()) else {
                return;
            };
            cell.changed(Some(Value::Bool(input.is_ready() != negate)));
        });
        *self.token.borrow_mut() = Some(token);
        cell.changed(Some(Value::Bool(self.input.is_ready() != negate)));
    }

    fn fin(&self, _cell: &Cell) {
        if let Some(token) = self.token.borrow_mut().take() {
            self.input.unnotify(token);
        }
    }
}

impl Cell {
    /// Adopt this cell's first ready value and then stop following it.
    ///
    /// Not ready until the input first becomes ready; use
    /// [`latched_or`](Cell::latched_or) to present a stand-in meanwhile.
    #[must_use]
    pub fn latched(&self) -> Cell {
        self.latch_cell(None)
    }

    /// Like [`latched`](Cell::latched), but shows `default` until the input
    /// first becomes ready.
    #[must_use]
    pub fn latched_or(&self, default: Value) -> Cell {
        self.latch_cell(Some(default))
    }

    fn latch_cell(&self, default: Option<Value>) -> Cell {
        Cell::with_driver(
            CellOptions {
                may_be_null: true,
                ..CellOptions::default()
            },
            Rc::new(LatchDriver {
                input: self.clone(),
                default,
                shared: Rc::new(LatchShared {
                    token: RefCell::new(None),
                    latched: StdCell::new(false),
                }),
            }),
        )
    }

    /// Always ready: this cell's value while ready, `default` otherwise.
    #[must_use]
    pub fn or_default(&self, default: Value) -> Cell {
        Cell::with_driver(
            CellOptions {
                may_be_null: true,
                ..CellOptions::default()
            },
            Rc::new(DefaultDriver {
                input: self.clone(),
                default,
                token: RefCell::new(None),
            }),
        )
    }

    /// Always ready: `true` while this cell is ready.
    #[must_use]
    pub fn ready(&self) -> Cell {
        self.probe(false)
    }

    /// Always ready: `true` while this cell is **not** ready.
    #[must_use]
    pub fn not_ready(&self) -> Cell {
        self.probe(true)
    }

    fn probe(&self, negate: bool) -> Cell {
        Cell::with_driver(
            CellOptions::default(),
            Rc::new(ProbeDriver {
                input: self.clone(),
                negate,
                token: RefCell::new(None),
            }),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
