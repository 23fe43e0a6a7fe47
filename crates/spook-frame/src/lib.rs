#![forbid(unsafe_code)]

//! Spook frame proxy: parent↔child delegation of cell ownership.
//!
//! A child runtime that cannot own certain UUIDs (a sandboxed frame, an
//! embedded view) defers them across the trust boundary: the parent
//! resolves and owns the producing cell, the child mirrors its value. This
//! crate carries the message vocabulary, the port abstraction over the
//! host's channel, and both endpoints.
//!
//! # Key Components
//!
//! - [`FrameProxy`] - Parent-side multiplexer serving child subscriptions
//! - [`FrameClient`] - Child-side handshake + cache parent link
//! - [`FromChild`] / [`ToChild`] - The bit-exact wire messages
//! - [`MemoryFrames`] - In-process frame tree for tests

pub mod client;
pub mod port;
pub mod proxy;
pub mod wire;

pub use client::FrameClient;
pub use port::{
    ChildPort, FromChildEnvelope, MemoryChildPort, MemoryFrames, MemoryParentPort, ParentPort,
    PeerId, PortWatch,
};
pub use proxy::{FrameProxy, ResolvedCell, UuidResolver};
pub use wire::{CacheUpdate, FromChild, ProxyInfo, ToChild, Unknown};
