//! In-memory backing log for tests and examples.
//!
//! This module provides [`Store`], a thread-safe list-backed implementation of
//! [`Backend`](super::Backend).
//!
//! # Example
//!
//! ```
//! use eventide_core::store::{EventStore, inmemory};
//!
//! let store = EventStore::new(inmemory::Store::new());
//! ```

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use nonempty::NonEmpty;

use crate::{
    aggregate::INITIAL_VERSION,
    concurrency::ConcurrencyConflict,
    store::{AppendError, Backend, EventRecord, RecordStream, SnapshotRecord, StreamKey},
};

/// In-memory backing log.
///
/// All events live in one list in append order, which doubles as the global
/// order for [`read_all`](Backend::read_all). Each stream keeps the indices of
/// its events. Appends honour an expected tail when one is given, so the
/// store also exercises conflict handling in tests.
///
/// Clones share the same log.
#[derive(Clone, Default)]
pub struct Store {
    inner: Arc<RwLock<Inner>>,
}

#[derive(Default)]
struct Inner {
    log: Vec<EventRecord>,
    streams: HashMap<StreamKey, Vec<usize>>,
    snapshots: HashMap<StreamKey, Vec<SnapshotRecord>>,
}

impl Inner {
    fn tail_version(&self, key: &StreamKey) -> Option<i64> {
        self.streams
            .get(key)
            .and_then(|indices| indices.last())
            .map(|&index| self.log[index].version)
    }
}

impl Store {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of events across all streams.
    ///
    /// # Errors
    ///
    /// Returns [`InMemoryError::Poisoned`] if a writer panicked while holding
    /// the lock.
    pub fn len(&self) -> Result<usize, InMemoryError> {
        Ok(self.inner.read().map_err(|_| InMemoryError::Poisoned)?.log.len())
    }

    /// # Errors
    ///
    /// Returns [`InMemoryError::Poisoned`] if a writer panicked while holding
    /// the lock.
    pub fn is_empty(&self) -> Result<bool, InMemoryError> {
        self.len().map(|len| len == 0)
    }

    /// Append a record without any checks, as a backend-internal writer
    /// would. Used to inject system records in tests.
    ///
    /// # Errors
    ///
    /// Returns [`InMemoryError::Poisoned`] if a writer panicked while holding
    /// the lock.
    pub fn push_raw(&self, record: EventRecord) -> Result<(), InMemoryError> {
        let mut inner = self.inner.write().map_err(|_| InMemoryError::Poisoned)?;
        let index = inner.log.len();
        let key = record.stream_key();
        inner.log.push(record);
        inner.streams.entry(key).or_default().push(index);
        Ok(())
    }

    /// Record at `cursor` of the selected sequence, cloned out under a short
    /// read lock so readers never hold the lock across an await point.
    fn record_at(
        &self,
        key: Option<&StreamKey>,
        cursor: usize,
    ) -> Result<Option<EventRecord>, InMemoryError> {
        let inner = self.inner.read().map_err(|_| InMemoryError::Poisoned)?;
        let index = match key {
            Some(key) => inner
                .streams
                .get(key)
                .and_then(|indices| indices.get(cursor).copied()),
            None => (cursor < inner.log.len()).then_some(cursor),
        };
        Ok(index.map(|index| inner.log[index].clone()))
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("inmemory::Store").finish_non_exhaustive()
    }
}

/// Error type for the in-memory store.
#[derive(Debug, thiserror::Error)]
pub enum InMemoryError {
    #[error("in-memory store lock poisoned")]
    Poisoned,
}

impl Backend for Store {
    type Error = InMemoryError;

    async fn tail_version<'a>(&'a self, key: &'a StreamKey) -> Result<Option<i64>, Self::Error> {
        let inner = self.inner.read().map_err(|_| InMemoryError::Poisoned)?;
        Ok(inner.tail_version(key))
    }

    async fn append<'a>(
        &'a self,
        key: &'a StreamKey,
        events: NonEmpty<EventRecord>,
        expected_tail: Option<i64>,
    ) -> Result<(), AppendError<Self::Error>> {
        let mut inner = self
            .inner
            .write()
            .map_err(|_| AppendError::Store(InMemoryError::Poisoned))?;

        let actual = inner.tail_version(key);
        if let Some(expected) = expected_tail
            && actual.unwrap_or(INITIAL_VERSION) != expected
        {
            return Err(ConcurrencyConflict::new(key, expected, actual).into());
        }

        let start = inner.log.len();
        let count = events.len();
        inner.log.extend(events);
        inner
            .streams
            .entry(key.clone())
            .or_default()
            .extend(start..start + count);
        drop(inner);

        tracing::trace!(stream = %key, count, "events stored in memory");
        Ok(())
    }

    fn read<'a>(&'a self, key: &'a StreamKey, from_version: i64) -> RecordStream<'a, Self::Error> {
        Box::pin(async_stream::stream! {
            let mut cursor = 0;
            loop {
                match self.record_at(Some(key), cursor) {
                    Ok(Some(record)) => {
                        cursor += 1;
                        if record.version >= from_version {
                            yield Ok(record);
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        yield Err(err);
                        break;
                    }
                }
            }
        })
    }

    fn read_all(&self) -> RecordStream<'_, Self::Error> {
        Box::pin(async_stream::stream! {
            let mut cursor = 0;
            loop {
                match self.record_at(None, cursor) {
                    Ok(Some(record)) => {
                        cursor += 1;
                        yield Ok(record);
                    }
                    Ok(None) => break,
                    Err(err) => {
                        yield Err(err);
                        break;
                    }
                }
            }
        })
    }

    async fn save_snapshot(&self, snapshot: SnapshotRecord) -> Result<(), Self::Error> {
        let mut inner = self.inner.write().map_err(|_| InMemoryError::Poisoned)?;
        let key = StreamKey::new(&snapshot.aggregate_kind, &snapshot.aggregate_id);
        inner.snapshots.entry(key).or_default().push(snapshot);
        Ok(())
    }

    async fn has_snapshot<'a>(&'a self, key: &'a StreamKey) -> Result<bool, Self::Error> {
        let inner = self.inner.read().map_err(|_| InMemoryError::Poisoned)?;
        Ok(inner.snapshots.get(key).is_some_and(|s| !s.is_empty()))
    }

    async fn latest_snapshot<'a>(
        &'a self,
        key: &'a StreamKey,
    ) -> Result<Option<SnapshotRecord>, Self::Error> {
        let inner = self.inner.read().map_err(|_| InMemoryError::Poisoned)?;
        Ok(inner
            .snapshots
            .get(key)
            .and_then(|snapshots| snapshots.iter().max_by_key(|s| s.version))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use tokio_stream::StreamExt;

    use super::*;
    use crate::store::Headers;

    fn record(kind: &str, id: &str, version: i64) -> EventRecord {
        EventRecord {
            aggregate_kind: kind.into(),
            aggregate_id: id.into(),
            version,
            timestamp: Utc::now(),
            event_kind: "value-changed".into(),
            data: b"{}".to_vec(),
            headers: Headers::new(),
        }
    }

    fn batch(
        kind: &str,
        id: &str,
        versions: std::ops::RangeInclusive<i64>,
    ) -> NonEmpty<EventRecord> {
        NonEmpty::from_vec(versions.map(|v| record(kind, id, v)).collect()).unwrap()
    }

    async fn versions(stream: RecordStream<'_, InMemoryError>) -> Vec<(String, i64)> {
        stream
            .map(|r| {
                let r = r.unwrap();
                (r.aggregate_id, r.version)
            })
            .collect()
            .await
    }

    #[tokio::test]
    async fn empty_store_has_no_tail() {
        let store = Store::new();
        let key = StreamKey::new("account", "1");
        assert_eq!(store.tail_version(&key).await.unwrap(), None);
        assert!(store.is_empty().unwrap());
    }

    #[tokio::test]
    async fn append_then_read_from_version() {
        let store = Store::new();
        let key = StreamKey::new("account", "1");
        store.append(&key, batch("account", "1", 0..=3), Some(-1)).await.unwrap();

        assert_eq!(store.tail_version(&key).await.unwrap(), Some(3));
        let read = versions(store.read(&key, 2)).await;
        assert_eq!(read, vec![("1".into(), 2), ("1".into(), 3)]);
    }

    #[tokio::test]
    async fn conditional_append_rejects_wrong_tail() {
        let store = Store::new();
        let key = StreamKey::new("account", "1");
        store.append(&key, batch("account", "1", 0..=1), Some(-1)).await.unwrap();

        let err = store
            .append(&key, batch("account", "1", 1..=1), Some(0))
            .await
            .unwrap_err();
        let AppendError::Conflict(conflict) = err else {
            panic!("expected conflict");
        };
        assert_eq!(conflict.expected, 0);
        assert_eq!(conflict.actual, Some(1));
        assert_eq!(store.len().unwrap(), 2);
    }

    #[tokio::test]
    async fn read_all_interleaves_streams_in_append_order() {
        let store = Store::new();
        let a = StreamKey::new("account", "a");
        let b = StreamKey::new("account", "b");
        store.append(&a, batch("account", "a", 0..=0), None).await.unwrap();
        store.append(&b, batch("account", "b", 0..=1), None).await.unwrap();
        store.append(&a, batch("account", "a", 1..=1), None).await.unwrap();

        let all = versions(store.read_all()).await;
        assert_eq!(
            all,
            vec![
                ("a".into(), 0),
                ("b".into(), 0),
                ("b".into(), 1),
                ("a".into(), 1)
            ]
        );
    }

    #[tokio::test]
    async fn read_sees_events_appended_while_reading() {
        let store = Store::new();
        let key = StreamKey::new("account", "1");
        store.append(&key, batch("account", "1", 0..=0), None).await.unwrap();

        let mut stream = store.read(&key, 0);
        assert_eq!(stream.next().await.unwrap().unwrap().version, 0);
        store.append(&key, batch("account", "1", 1..=1), None).await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap().version, 1);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn snapshots_are_keyed_per_stream() {
        let store = Store::new();
        let key = StreamKey::new("account", "1");
        let other = StreamKey::new("account", "2");
        store
            .save_snapshot(SnapshotRecord {
                aggregate_kind: "account".into(),
                aggregate_id: "1".into(),
                version: 4,
                timestamp: Utc::now(),
                snapshot_type: "State".into(),
                data: b"{}".to_vec(),
            })
            .await
            .unwrap();

        assert!(store.has_snapshot(&key).await.unwrap());
        assert!(!store.has_snapshot(&other).await.unwrap());
        assert_eq!(store.latest_snapshot(&key).await.unwrap().unwrap().version, 4);
        assert!(store.latest_snapshot(&other).await.unwrap().is_none());
    }
}
