#![doc = include_str!("../README.md")]

#[cfg(feature = "test-util")]
pub use eventide_core::test;
pub use eventide_core::{
    aggregate,
    aggregate::{Aggregate, Apply, Root, Snapshotting, Transitions},
    codec, concurrency,
    concurrency::{ConcurrencyConflict, Optimistic, Unchecked},
    config,
    config::{Config, ConfigBuilder, ConfigError},
    event,
    event::{DomainEvent, EventKind, Replayed, Versioned},
    guard,
    guard::GuardError,
    repository,
    repository::Repository,
    snapshot,
    snapshot::{Snapshot, SnapshotStrategy},
};
// Re-export the proc macro derive so consumers only depend on `eventide`.
pub use eventide_macros::Aggregate;

pub mod store {
    pub use eventide_core::store::{
        Backend, CancellationToken, EventRecord, EventStore, EventStream, Headers, NotFound,
        SnapshotRecord, StoreError, StreamKey, TypeNameStrategy,
    };

    // Re-export low-level append types for backend implementors only.
    // Most users should interact with the Repository API instead.
    #[doc(hidden)]
    pub use eventide_core::store::{AppendError, NonEmpty, RecordStream};

    #[cfg(feature = "postgres")]
    #[cfg_attr(docsrs, doc(cfg(feature = "postgres")))]
    pub mod postgres {
        pub use eventide_postgres::{Error, Store};
    }

    pub use eventide_core::store::inmemory;
}
