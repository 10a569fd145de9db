//! Common control-plane abstractions for the Thread Border Router.
//!
//! This crate provides the table and timer primitives shared by the
//! border routing components:
//!
//! - [`SyncMap`]: map wrapper that never creates entries implicitly
//! - [`TimerQueue`]: deadline queue keyed by entry identity
//!
//! # Timer model
//!
//! Components never own threads or callbacks. Each component keeps a
//! [`TimerQueue`] keyed by the identity of the entry a timer belongs to.
//! The single event loop asks every component for its earliest deadline,
//! sleeps until then and injects the expirations back in order, so timer
//! handling is serialized with every other event. Cancelling a key (or
//! every key matching a predicate on teardown) removes the timer for good:
//! there is no callback left behind to fire later.

mod sync_map;
mod timer;

pub use sync_map::{SyncMap, SyncMapError};
pub use timer::TimerQueue;
