//! Pluggable optimistic concurrency check.
//!
//! [`EventStream::append`](crate::store::EventStream::append) computes the
//! version the writer believed current before its batch (the *original
//! version*) and hands it to the store's [`ConcurrencyCheck`] before anything
//! is written.
//!
//! - [`Unchecked`] - the no-op hook
//! - [`Optimistic`] - explicit tail read and compare, followed by a conditional
//!   append carrying the same expectation
//!
//! # Example
//!
//! ```ignore
//! // Default: optimistic concurrency (safe)
//! let store = EventStore::new(inmemory::Store::new());
//!
//! // Opt-out for single-writer scenarios
//! let store = EventStore::new(inmemory::Store::new()).without_concurrency_checking();
//! ```

use std::future::Future;

use thiserror::Error;

use crate::{
    aggregate::INITIAL_VERSION,
    store::{AppendError, Backend, StreamKey},
};

/// Hook run before a batch is appended to a stream.
///
/// Implementations either verify the tail explicitly
/// ([`verify`](Self::verify)), ask the backend for a conditional append
/// ([`expected_tail`](Self::expected_tail)), or both.
pub trait ConcurrencyCheck: Send + Sync {
    /// Compare `original_version` against the stream tail.
    ///
    /// # Errors
    ///
    /// Returns [`AppendError::Conflict`] on mismatch, or
    /// [`AppendError::Store`] if the tail cannot be read.
    fn verify<'a, B: Backend>(
        &'a self,
        backend: &'a B,
        key: &'a StreamKey,
        original_version: i64,
    ) -> impl Future<Output = Result<(), AppendError<B::Error>>> + Send + 'a;

    /// Tail version the backend must atomically confirm when appending, if
    /// any.
    fn expected_tail(&self, original_version: i64) -> Option<i64>;
}

/// No version checking.
///
/// Suitable for single-writer deployments or backends that are known to
/// serialize writers per stream by other means. What happens to a stale
/// batch is up to the backend: the in-memory store appends it anyway (last
/// writer wins), while the Postgres store keeps versions unique per stream
/// and reports the overlap as a [`ConcurrencyConflict`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Unchecked;

impl ConcurrencyCheck for Unchecked {
    async fn verify<'a, B: Backend>(
        &'a self,
        _backend: &'a B,
        _key: &'a StreamKey,
        _original_version: i64,
    ) -> Result<(), AppendError<B::Error>> {
        Ok(())
    }

    fn expected_tail(&self, _original_version: i64) -> Option<i64> {
        None
    }
}

/// Optimistic concurrency control - version checked on every write.
///
/// This is the default check for [`EventStore`](crate::store::EventStore).
/// The tail is read and compared before writing, and the same expectation is
/// passed to the backend append so backends with compare-and-append close the
/// window between the read and the write.
#[derive(Debug, Clone, Copy, Default)]
pub struct Optimistic;

impl ConcurrencyCheck for Optimistic {
    async fn verify<'a, B: Backend>(
        &'a self,
        backend: &'a B,
        key: &'a StreamKey,
        original_version: i64,
    ) -> Result<(), AppendError<B::Error>> {
        let actual = backend.tail_version(key).await.map_err(AppendError::Store)?;
        if actual.unwrap_or(INITIAL_VERSION) == original_version {
            Ok(())
        } else {
            Err(ConcurrencyConflict::new(key, original_version, actual).into())
        }
    }

    fn expected_tail(&self, original_version: i64) -> Option<i64> {
        Some(original_version)
    }
}

/// Error indicating a concurrency conflict during append.
///
/// Another writer appended to the stream after this writer loaded the
/// aggregate. Recover by reloading, re-applying the command, and saving again.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}", format_conflict(self))]
pub struct ConcurrencyConflict {
    pub aggregate_kind: String,
    pub aggregate_id: String,
    /// The tail version the writer expected. `-1` means a new stream.
    pub expected: i64,
    /// The actual tail version. `None` means the stream is empty.
    pub actual: Option<i64>,
}

impl ConcurrencyConflict {
    #[must_use]
    pub fn new(key: &StreamKey, expected: i64, actual: Option<i64>) -> Self {
        Self {
            aggregate_kind: key.aggregate_kind().to_string(),
            aggregate_id: key.aggregate_id().to_string(),
            expected,
            actual,
        }
    }
}

/// Build a human-readable message for a [`ConcurrencyConflict`], including an
/// actionable hint for the caller.
fn format_conflict(conflict: &ConcurrencyConflict) -> String {
    let ConcurrencyConflict {
        aggregate_kind,
        aggregate_id,
        expected,
        actual,
    } = conflict;
    match (*expected, actual) {
        (INITIAL_VERSION, Some(actual)) => format!(
            "concurrency conflict on {aggregate_kind} {aggregate_id}: expected new stream, found \
             version {actual} (hint: another process created this aggregate; reload and retry)"
        ),
        (expected, Some(actual)) => format!(
            "concurrency conflict on {aggregate_kind} {aggregate_id}: expected version \
             {expected}, found {actual} (hint: stream was modified; reload and retry)"
        ),
        (expected, None) => format!(
            "concurrency conflict on {aggregate_kind} {aggregate_id}: expected version \
             {expected}, found empty stream"
        ),
    }
}
