#![forbid(unsafe_code)]

//! Structured terms: input trees that may embed cells and promises.
//!
//! Reactive and transform cells take their inputs as [`Term`] trees:
//! ordered sequences and keyed mappings with plain values, cells, or
//! promises at the leaves. Readiness and resolution honour a *resolution
//! depth*: a cell or promise is *live* when the number of structure levels
//! above it (within the term) does not exceed the depth. A direct cell or
//! promise at the root is therefore always live.
//!
//! Beyond the depth limit a contained cell or promise is opaque: it does not
//! block readiness and resolves to `null`. (The dynamic original passes the
//! handle itself through; a canonical value cannot carry a handle, so `null`
//! is the defined substitution.)

use std::collections::BTreeMap;

use crate::cell::Cell;
use crate::promise::Promise;
use crate::value::Value;

/// The default resolution depth: cells and promises one structure level deep
/// are resolved.
pub const DEFAULT_DEPTH: usize = 1;

/// One node of a structured input tree.
#[derive(Debug, Clone)]
pub enum Term {
    /// A plain value, passed through as-is.
    Value(Value),
    /// A cell whose readiness and value participate in resolution.
    Cell(Cell),
    /// A promise whose settlement participates in resolution.
    Promise(Promise),
    /// An ordered sequence.
    List(Vec<Term>),
    /// A keyed mapping (ordered, to keep resolution canonical).
    Map(BTreeMap<String, Term>),
}

/// A live (within-depth) leaf found while walking a term.
pub enum Live<'a> {
    Cell(&'a Cell),
    Promise(&'a Promise),
}

impl Term {
    /// Visit every live cell/promise within `depth` structure levels, in
    /// deterministic (depth-first, ordered) traversal order.
    pub fn for_each_live<'a>(&'a self, depth: usize, f: &mut dyn FnMut(Live<'a>)) {
        self.walk(0, depth, f);
    }

    fn walk<'a>(&'a self, level: usize, depth: usize, f: &mut dyn FnMut(Live<'a>)) {
        match self {
            Term::Value(_) => {}
            Term::Cell(cell) => {
                if level <= depth {
                    f(Live::Cell(cell));
                }
            }
            Term::Promise(promise) => {
                if level <= depth {
                    f(Live::Promise(promise));
                }
            }
            Term::List(items) => {
                // No live leaf can sit below an exhausted depth budget.
                if level < depth {
                    for item in items {
                        item.walk(level + 1, depth, f);
                    }
                }
            }
            Term::Map(entries) => {
                if level < depth {
                    for item in entries.values() {
                        item.walk(level + 1, depth, f);
                    }
                }
            }
        }
    }

    /// Whether every live part is ready: cells ready, promises resolved.
    ///
    /// A rejected promise is never ready.
    #[must_use]
    pub fn ready(&self, depth: usize) -> bool {
        let mut all = true;
        self.for_each_live(depth, &mut |live| match live {
            Live::Cell(cell) => all &= cell.is_ready(),
            Live::Promise(promise) => all &= matches!(promise.result(), Some(Ok(_))),
        });
        all
    }

    /// Whether the term contains any live cell or promise at all.
    #[must_use]
    pub fn has_live(&self, depth: usize) -> bool {
        let mut found = false;
        self.for_each_live(depth, &mut |_| found = true);
        found
    }

    /// Deep-substitute live parts by their resolved values.
    ///
    /// Copies the spine; callers should have checked [`ready`](Term::ready)
    /// first; an unready live part (and any opaque part) substitutes as
    /// `null`.
    #[must_use]
    pub fn resolve(&self, depth: usize) -> Value {
        self.resolve_at(0, depth)
    }

    fn resolve_at(&self, level: usize, depth: usize) -> Value {
        match self {
            Term::Value(value) => value.clone(),
            Term::Cell(cell) => {
                if level <= depth {
                    cell.value().unwrap_or(Value::Null)
                } else {
                    Value::Null
                }
            }
            Term::Promise(promise) => {
                if level <= depth {
                    promise.value().unwrap_or(Value::Null)
                } else {
                    Value::Null
                }
            }
            Term::List(items) => Value::Array(
                items
                    .iter()
                    .map(|item| item.resolve_at(level + 1, depth))
                    .collect(),
            ),
            Term::Map(entries) => Value::Object(
                entries
                    .iter()
                    .map(|(key, item)| (key.clone(), item.resolve_at(level + 1, depth)))
                    .collect(),
            ),
        }
    }
}

impl From<Value> for Term {
    fn from(value: Value) -> Self {
        Term::Value(value)
    }
}

impl From<Cell> for Term {
    fn from(cell: Cell) -> Self {
        Term::Cell(cell)
    }
}

impl From<&Cell> for Term {
    fn from(cell: &Cell) -> Self {
        Term::Cell(cell.clone())
    }
}

impl From<Promise> for Term {
    fn from(promise: Promise) -> Self {
        Term::Promise(promise)
    }
}

impl From<&str> for Term {
    fn from(text: &str) -> Self {
        Term::Value(Value::String(text.to_owned()))
    }
}

impl From<String> for Term {
    fn from(text: String) -> Self {
        Term::Value(Value::String(text))
    }
}

impl From<u64> for Term {
    fn from(n: u64) -> Self {
        Term::Value(Value::from(n))
    }
}

impl From<i64> for Term {
    fn from(n: i64) -> Self {
        Term::Value(Value::from(n))
    }
}

impl From<usize> for Term {
    fn from(n: usize) -> Self {
        Term::Value(Value::from(n as u64))
    }
}

impl From<bool> for Term {
    fn from(b: bool) -> Self {
        Term::Value(Value::Bool(b))
    }
}

impl From<Vec<Term>> for Term {
    fn from(items: Vec<Term>) -> Self {
        Term::List(items)
    }
}

impl From<BTreeMap<String, Term>> for Term {
    fn from(entries: BTreeMap<String, Term>) -> Self {
        Term::Map(entries)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
