#![forbid(unsafe_code)]

//! Transform cells: map input cells through a function, with an output
//! policy for results that are themselves asynchronous or structured.
//!
//! # Output policy
//!
//! When the transform runs, its [`Outcome`] decides what happens:
//!
//! - [`Outcome::None`]: the transform had nothing to say. Reset and warn.
//! - [`Outcome::Value`]: propose the value (equality-gated).
//! - [`Outcome::Promise`]: adopt the promise's eventual value; a
//!   non-latched cell resets while waiting.
//! - [`Outcome::Term`]: a structure that may itself contain cells or
//!   promises: a transient inner reactive cell resolves it (to the output
//!   depth) and feeds the fully resolved structure back in. The inner cell
//!   is owned for exactly one recomputation; the next run (or deactivation)
//!   releases it.
//!
//! # Latching
//!
//! A latched transform (the default) keeps showing its last ready value
//! while a new computation is in flight; a non-latched one resets first, so
//! observers see the gap.

use std::cell::RefCell;
use std::rc::Rc;

use crate::cell::{Cell, CellOptions, Driver};
use crate::reactive::ReactiveCore;
use crate::term::{Term, DEFAULT_DEPTH};
use crate::value::Value;

/// What a transform produced.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// Nothing: reset the cell.
    None,
    /// A definite value.
    Value(Value),
    /// An eventual value.
    Promise(crate::promise::Promise),
    /// A structure that may contain cells/promises to resolve.
    Term(Term),
}

/// Options for [`Cell::transform`].
#[derive(Debug, Clone)]
pub struct TransformOptions {
    /// Keep the last ready value while recomputing (see module docs).
    pub latched: bool,
    /// Resolution depth applied to the inputs.
    pub depth: usize,
    /// Resolution depth applied to a structured output.
    pub out_depth: usize,
}

impl Default for TransformOptions {
    fn default() -> Self {
        Self {
            latched: true,
            depth: DEFAULT_DEPTH,
            out_depth: DEFAULT_DEPTH,
        }
    }
}

/// Holder for the transient inner cell resolving a structured output.
#[derive(Default)]
struct Seat {
    inner: RefCell<Option<Cell>>,
}

impl Seat {
    fn clear(&self) {
        if let Some(previous) = self.inner.borrow_mut().take() {
            previous.release();
        }
    }

    fn put(&self, cell: Cell) {
        self.clear();
        cell.acquire();
        *self.inner.borrow_mut() = Some(cell);
    }
}

struct TransformDriver {
    core: Rc<ReactiveCore>,
    seat: Rc<Seat>,
}

impl Driver for TransformDriver {
    fn init(&self, cell: &Cell) {
        self.core.init(cell);
    }

    fn fin(&self, _cell: &Cell) {
        self.core.fin();
        self.seat.clear();
    }
}

impl Cell {
    /// A transform cell over `inputs` with explicit cell options (nullable
    /// policy, cache identity).
    #[must_use]
    pub fn transform_in(
        cell_options: CellOptions,
        inputs: Vec<Term>,
        options: TransformOptions,
        f: impl Fn(&[Value]) -> Outcome + 'static,
    ) -> Cell {
        let seat = Rc::new(Seat::default());
        let latched = options.latched;
        let out_depth = options.out_depth;
        let seat_in = Rc::clone(&seat);

        let core = ReactiveCore::new(inputs, vec![], options.depth, move |cell, args| {
            let Some(args) = args else {
                // An input went away mid-stream: a stale structured output
                // must not keep feeding us.
                seat_in.clear();
                if !latched {
                    cell.reset();
                }
                return;
            };
            seat_in.clear();
            match f(args) {
                Outcome::None => {
                    tracing::warn!(cell = cell.id(), "transform produced no value; resetting");
                    cell.reset();
                }
                Outcome::Value(value) => cell.changed(Some(value)),
                Outcome::Promise(promise) => {
                    if !latched {
                        cell.reset();
                    }
                    let weak = cell.downgrade();
                    promise.on_settle(move |outcome| {
                        let Some(cell) = weak.upgrade() else { return };
                        match outcome {
                            Ok(value) => cell.changed(Some(value.clone())),
                            Err(rejection) => {
                                tracing::warn!(
                                    cell = cell.id(),
                                    error = %rejection,
                                    "transform promise rejected"
                                );
                                cell.reset();
                            }
                        }
                    });
                }
                Outcome::Term(term) => {
                    if term.has_live(out_depth) {
                        if !latched {
                            cell.reset();
                        }
                        let weak = cell.downgrade();
                        let inner =
                            Cell::reactive(vec![term], vec![], out_depth, move |_inner, resolved| {
                                if let Some(cell) = weak.upgrade() {
                                    cell.changed(Some(resolved[0].clone()));
                                }
                            });
                        seat_in.put(inner);
                    } else {
                        cell.changed(Some(term.resolve(out_depth)));
                    }
                }
            }
        });

        Cell::with_driver(cell_options, Rc::new(TransformDriver { core, seat }))
    }

    /// A transform cell with default cell options.
    #[must_use]
    pub fn transform(
        inputs: Vec<Term>,
        options: TransformOptions,
        f: impl Fn(&[Value]) -> Outcome + 'static,
    ) -> Cell {
        Cell::transform_in(CellOptions::default(), inputs, options, f)
    }

    /// Map this cell's value through a pure function.
    #[must_use]
    pub fn map(&self, f: impl Fn(&Value) -> Value + 'static) -> Cell {
        Cell::transform(
            vec![Term::from(self)],
            TransformOptions::default(),
            move |args| Outcome::Value(f(&args[0])),
        )
    }

    /// Map this cell's value through a function returning a full
    /// [`Outcome`] (promise, structure, or nothing).
    #[must_use]
    pub fn map_outcome(&self, f: impl Fn(&Value) -> Outcome + 'static) -> Cell {
        Cell::transform(
            vec![Term::from(self)],
            TransformOptions::default(),
            move |args| f(&args[0]),
        )
    }

    /// Map every element of this cell's sequence value through `f`; element
    /// results may be cells or promises and are resolved before the mapped
    /// sequence is shown.
    #[must_use]
    pub fn map_each(&self, f: impl Fn(&Value) -> Term + 'static) -> Cell {
        Cell::transform(
            vec![Term::from(self)],
            TransformOptions::default(),
            move |args| match &args[0] {
                Value::Array(items) => Outcome::Term(Term::List(items.iter().map(&f).collect())),
                other => {
                    tracing::warn!(value = %other, "map_each over a non-sequence value");
                    Outcome::None
                }
            },
        )
    }

    /// Combine several cells through `f`.
    #[must_use]
    pub fn map_all(cells: Vec<Cell>, f: impl Fn(&[Value]) -> Value + 'static) -> Cell {
        Cell::transform(
            cells.into_iter().map(Term::from).collect(),
            TransformOptions::default(),
            move |args| Outcome::Value(f(args)),
        )
    }

    /// A cell holding the ordered list of all input values.
    #[must_use]
    pub fn all(cells: Vec<Cell>) -> Cell {
        Cell::map_all(cells, |args| Value::Array(args.to_vec()))
    }

    /// Index into this cell's value by `key`, a literal string/number or
    /// another cell. Missing members reset the result.
    #[must_use]
    pub fn sub(&self, key: impl Into<Term>) -> Cell {
        Cell::transform(
            vec![Term::from(self), key.into()],
            TransformOptions::default(),
            |args| index_value(&args[0], &args[1]),
        )
    }

    /// Nested [`sub`](Cell::sub) access: `cell.sub_path(vec!["a".into(),
    /// 0u64.into()])` is `cell.sub("a").sub(0u64)`.
    #[must_use]
    pub fn sub_path(&self, keys: Vec<Term>) -> Cell {
        keys.into_iter().fold(self.clone(), |cell, key| cell.sub(key))
    }

    /// Fold this cell's sequence value.
    #[must_use]
    pub fn reduce(&self, init: Value, f: impl Fn(Value, &Value) -> Value + 'static) -> Cell {
        self.map_outcome(move |value| match value {
            Value::Array(items) => {
                Outcome::Value(items.iter().fold(init.clone(), |acc, item| f(acc, item)))
            }
            other => {
                tracing::warn!(value = %other, "reduce over a non-sequence value");
                Outcome::None
            }
        })
    }
}

fn index_value(container: &Value, key: &Value) -> Outcome {
    let member = match (container, key) {
        (Value::Object(entries), Value::String(name)) => entries.get(name).cloned(),
        (Value::Array(items), Value::Number(index)) => index
            .as_u64()
            .and_then(|i| usize::try_from(i).ok())
            .and_then(|i| items.get(i))
            .cloned(),
        _ => None,
    };
    match member {
        Some(value) => Outcome::Value(value),
        None => Outcome::None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
