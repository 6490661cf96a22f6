//! Core traits and types for the Eventide event-sourcing library.
//!
//! - [`aggregate`] - Aggregate protocol (`Aggregate`, `Apply`, `Root`, `Transitions`)
//! - [`event`] - Event marker traits and the versioned envelope
//! - [`store`] - The backing-log seam (`Backend`), `EventStore` and `EventStream`
//! - [`concurrency`] - Append-time concurrency checks (`Optimistic`, `Unchecked`)
//! - [`snapshot`] - Snapshot values and `SnapshotStrategy`
//! - [`repository`] - Load/save orchestration (`Repository`)
//! - [`config`] - Startup configuration (`Config`, `ConfigBuilder`)
//! - [`guard`] - Business-rule guards for command methods
//! - [`codec`] - Payload serialization (`Codec`, `JsonCodec`)
//!
//! # Example
//!
//! ```
//! use eventide_core::{repository::Repository, store::{EventStore, inmemory}};
//!
//! let repository = Repository::new(EventStore::new(inmemory::Store::new()));
//! ```
//!
//! Most users should depend on the `eventide` crate, which re-exports these
//! types together with the `Aggregate` derive macro.

pub mod aggregate;
pub mod codec;
pub mod concurrency;
pub mod config;
pub mod event;
pub mod guard;
pub mod repository;
pub mod snapshot;
pub mod store;

// Test utilities module: public when feature enabled, internal for crate tests
#[cfg(feature = "test-util")]
pub mod test;

#[cfg(all(test, not(feature = "test-util")))]
pub(crate) mod test;

#[cfg(test)]
mod testing;
