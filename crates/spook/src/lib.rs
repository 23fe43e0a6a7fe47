#![forbid(unsafe_code)]

//! Spook: a dependency-tracked reactive value graph.
//!
//! A [`Cell`] holds a possibly-not-yet-known value. Cells are composed into
//! a directed graph: transform cells recompute exactly when their inputs
//! change, producer cells hold external resources (timers, push feeds) only
//! while at least one observer is interested, and every transition flows to
//! observers in a fixed order (readiness-notifiers, change-subscribers,
//! one-shots).
//!
//! # Key Components
//!
//! - [`Cell`] - The observable value slot with a reference-counted lifecycle
//! - [`Term`] - Structured inputs that may embed cells and promises
//! - [`Cell::transform`] / [`Cell::map`] / [`Cell::sub`] - Derived cells
//! - [`Cell::interval`] / [`Cell::subscription`] - Producer cells
//! - [`Promise`] / [`Cell::promise`] - The one-shot future bridge
//! - [`Driver`] - The lifecycle seam for custom producers
//! - [`CacheBridge`] - The seam a shared cache plugs into
//!
//! # Model
//!
//! The graph is single-threaded and cooperative: transitions, observer
//! callbacks, and bookkeeping all run on one logical thread, and observers
//! must not mutate the cell they are being notified about (such re-entry is
//! rejected with a warning). Observers are free to move *other* cells;
//! cascade depth is tracked and reported when it looks runaway.

pub mod bridge;
pub mod cell;
pub mod derived;
pub mod producers;
pub mod promise;
pub mod reactive;
pub mod term;
pub mod time;
pub mod transform;
pub mod value;

pub use cell::{
    triggers_total, CacheBridge, CacheLink, Cell, CellOptions, Driver, Token, WeakCell,
};
pub use producers::{MockFeed, PushGuard, PushSource};
pub use promise::{Promise, Rejection, Resolver, Settled};
pub use term::{Live, Term, DEFAULT_DEPTH};
pub use time::{Clock, ManualTimers, SystemClock, TimerGuard, Timers};
pub use transform::{Outcome, TransformOptions};
pub use value::{canonical_eq, canonical_string, Codec, JsonCodec, Value};
