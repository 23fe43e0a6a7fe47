#![forbid(unsafe_code)]

//! Spook shared cache: cross-instance deduplication of cell work.
//!
//! Cells identified by a stable UUID can be mirrored across concurrent
//! runtime instances (tabs, frames, processes) sharing one key-value store.
//! This crate elects exactly one owning instance per UUID, persists
//! last-known values opportunistically, propagates changes through storage
//! events, and migrates ownership when an instance goes away.
//!
//! # Key Components
//!
//! - [`SharedCache`] - Per-instance coordinator implementing the cell
//!   [`CacheBridge`](spook::CacheBridge) seam
//! - [`SharedStore`] - The shared key-value store abstraction
//! - [`MemoryHub`] / [`MemoryStore`] - In-memory multi-instance store for
//!   tests and simulations
//! - [`ParentLink`] - The edge to a parent frame for deferred UUIDs

pub mod cache;
pub mod store;

pub use cache::{CacheConfig, ParentLink, SharedCache};
pub use store::{MemoryHub, MemoryStore, SharedStore, StoreError, StoreEvent, StoreResult, StoreWatch};
