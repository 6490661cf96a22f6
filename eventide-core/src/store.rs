//! Persistence layer abstractions.
//!
//! This module describes the backing log contract ([`Backend`]), the durable
//! record formats ([`EventRecord`], [`SnapshotRecord`]), the per-aggregate
//! stream handle ([`EventStream`]) and the stream factory with whole-log
//! replay ([`EventStore`]). A reference in-memory backend lives in
//! [`inmemory`].
use std::{collections::BTreeMap, fmt, future::Future, pin::Pin};

use chrono::{DateTime, Utc};
use futures_core::Stream;
pub use nonempty::NonEmpty;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;
use tokio_stream::StreamExt;
pub use tokio_util::sync::CancellationToken;

use crate::{
    codec::{Codec, JsonCodec},
    concurrency::{ConcurrencyCheck, ConcurrencyConflict, Optimistic, Unchecked},
    event::{DecodeEvent, EncodeEvent, Replayed, Versioned},
    snapshot::Snapshot,
};

pub mod inmemory;

/// Free-form metadata recorded with every event of an append.
pub type Headers = BTreeMap<String, serde_json::Value>;

/// Lazily consumed, ordered sequence of records read from a backend.
pub type RecordStream<'a, E> = Pin<Box<dyn Stream<Item = Result<EventRecord, E>> + Send + 'a>>;

/// Identifies one aggregate stream: `(aggregate kind, aggregate id)`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamKey {
    aggregate_kind: String,
    aggregate_id: String,
}

impl StreamKey {
    #[must_use]
    pub fn new(aggregate_kind: impl Into<String>, aggregate_id: impl Into<String>) -> Self {
        Self {
            aggregate_kind: aggregate_kind.into(),
            aggregate_id: aggregate_id.into(),
        }
    }

    pub fn aggregate_kind(&self) -> &str {
        &self.aggregate_kind
    }

    pub fn aggregate_id(&self) -> &str {
        &self.aggregate_id
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.aggregate_kind, self.aggregate_id)
    }
}

/// Durable form of one appended event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub aggregate_kind: String,
    pub aggregate_id: String,
    pub version: i64,
    pub timestamp: DateTime<Utc>,
    pub event_kind: String,
    pub data: Vec<u8>,
    pub headers: Headers,
}

impl EventRecord {
    /// Records written by the backend itself rather than by an aggregate.
    ///
    /// Their kind starts with `$`. They are skipped by whole-log replay.
    #[must_use]
    pub fn is_system(&self) -> bool {
        self.event_kind.starts_with('$')
    }

    pub fn stream_key(&self) -> StreamKey {
        StreamKey::new(&self.aggregate_kind, &self.aggregate_id)
    }

    /// Decode the payload into an event sum type.
    ///
    /// # Errors
    ///
    /// Returns the codec error if the kind is known but the payload does not
    /// decode.
    pub fn decode<E: DecodeEvent, C: Codec>(&self, codec: &C) -> Result<Replayed<E>, C::Error> {
        Ok(match E::decode(&self.event_kind, &self.data, codec)? {
            Some(event) => Replayed::Known(event),
            None => Replayed::Unknown {
                kind: self.event_kind.clone(),
            },
        })
    }
}

/// Durable form of one snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub aggregate_kind: String,
    pub aggregate_id: String,
    pub version: i64,
    pub timestamp: DateTime<Utc>,
    /// Type name of the snapshot state, resolved on read through
    /// [`TypeNameStrategy`].
    pub snapshot_type: String,
    pub data: Vec<u8>,
}

/// How a recorded snapshot type name is matched against the expected type.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TypeNameStrategy {
    /// The full module path must match.
    #[default]
    Strict,
    /// Only the final path segment must match, so state types can move
    /// between modules.
    Loose,
}

impl TypeNameStrategy {
    #[must_use]
    pub fn matches(self, recorded: &str, expected: &str) -> bool {
        match self {
            Self::Strict => recorded == expected,
            Self::Loose => short_name(recorded) == short_name(expected),
        }
    }
}

fn short_name(type_name: &str) -> &str {
    let base = type_name.split('<').next().unwrap_or(type_name);
    base.rsplit("::").next().unwrap_or(base)
}

/// Error returned when a stream has neither events nor a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("an aggregate of type {aggregate_kind} with id {aggregate_id} could not be found")]
pub struct NotFound {
    pub aggregate_kind: String,
    pub aggregate_id: String,
}

impl From<&StreamKey> for NotFound {
    fn from(key: &StreamKey) -> Self {
        Self {
            aggregate_kind: key.aggregate_kind.clone(),
            aggregate_id: key.aggregate_id.clone(),
        }
    }
}

/// Error from backend append operations.
#[derive(Debug, Error)]
pub enum AppendError<E>
where
    E: std::error::Error,
{
    /// Concurrency conflict - another writer modified the stream.
    #[error(transparent)]
    Conflict(#[from] ConcurrencyConflict),
    /// Underlying store error.
    #[error("store error: {0}")]
    Store(#[source] E),
}

/// Error surfaced by streams, the store and the repository.
#[derive(Debug, Error)]
pub enum StoreError<E>
where
    E: std::error::Error,
{
    #[error(transparent)]
    NotFound(#[from] NotFound),
    #[error(transparent)]
    Conflict(#[from] ConcurrencyConflict),
    /// An event or snapshot failed to encode or decode.
    #[error("codec error: {0}")]
    Codec(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
    /// A batch was not numbered contiguously after the expected version.
    #[error("event at position {index} of the batch has version {found}, expected {expected}")]
    VersionGap { index: usize, expected: i64, found: i64 },
    #[error("operation cancelled")]
    Cancelled,
    /// Underlying store error.
    #[error("store error: {0}")]
    Backend(#[source] E),
}

impl<E: std::error::Error> StoreError<E> {
    pub fn codec(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Codec(Box::new(err))
    }

    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl<E: std::error::Error> From<AppendError<E>> for StoreError<E> {
    fn from(err: AppendError<E>) -> Self {
        match err {
            AppendError::Conflict(conflict) => Self::Conflict(conflict),
            AppendError::Store(err) => Self::Backend(err),
        }
    }
}

/// Abstraction over the backing log.
///
/// Versions are per stream, contiguous and zero-based. Implementations must
/// also keep a single global append order across all streams for
/// [`read_all`](Self::read_all).
pub trait Backend: Send + Sync {
    /// Store-specific error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Version of the last persisted event of a stream, `None` if the stream
    /// has no events.
    ///
    /// # Errors
    ///
    /// Returns a store-specific error when the operation fails.
    fn tail_version<'a>(
        &'a self,
        key: &'a StreamKey,
    ) -> impl Future<Output = Result<Option<i64>, Self::Error>> + Send + 'a;

    /// Append a batch in order, atomically.
    ///
    /// When `expected_tail` is `Some`, the backend must confirm the current
    /// tail (`-1` for an empty stream) equals it and write nothing otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`AppendError::Conflict`] if the tail doesn't match, or
    /// [`AppendError::Store`] if persistence fails.
    fn append<'a>(
        &'a self,
        key: &'a StreamKey,
        events: NonEmpty<EventRecord>,
        expected_tail: Option<i64>,
    ) -> impl Future<Output = Result<(), AppendError<Self::Error>>> + Send + 'a;

    /// Events of one stream with `version >= from_version`, version ascending.
    fn read<'a>(&'a self, key: &'a StreamKey, from_version: i64) -> RecordStream<'a, Self::Error>;

    /// Every event of every stream in global append order.
    fn read_all(&self) -> RecordStream<'_, Self::Error>;

    /// # Errors
    ///
    /// Returns a store-specific error when persistence fails.
    fn save_snapshot(
        &self,
        snapshot: SnapshotRecord,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

    /// # Errors
    ///
    /// Returns a store-specific error when the operation fails.
    fn has_snapshot<'a>(
        &'a self,
        key: &'a StreamKey,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send + 'a;

    /// The snapshot with the highest version for a stream.
    ///
    /// # Errors
    ///
    /// Returns a store-specific error when the operation fails.
    fn latest_snapshot<'a>(
        &'a self,
        key: &'a StreamKey,
    ) -> impl Future<Output = Result<Option<SnapshotRecord>, Self::Error>> + Send + 'a;
}

fn len_i64(len: usize) -> i64 {
    i64::try_from(len).unwrap_or(i64::MAX)
}

/// Run a read against the backend, giving up as soon as `cancel` fires.
async fn cancellable<T, E, F>(cancel: &CancellationToken, op: F) -> Result<T, StoreError<E>>
where
    E: std::error::Error,
    F: Future<Output = Result<T, E>>,
{
    match cancel.run_until_cancelled(op).await {
        Some(result) => result.map_err(StoreError::Backend),
        None => Err(StoreError::Cancelled),
    }
}

fn ensure_live<E: std::error::Error>(cancel: &CancellationToken) -> Result<(), StoreError<E>> {
    if cancel.is_cancelled() {
        Err(StoreError::Cancelled)
    } else {
        Ok(())
    }
}

/// Factory of per-aggregate streams plus whole-log replay.
///
/// Generic over:
/// - `B`: the backing log
/// - `C`: the [`ConcurrencyCheck`] run before every append
///   ([`Optimistic`] by default)
/// - `K`: the [`Codec`] used for payloads and snapshot state
///
/// ```
/// use eventide_core::store::{EventStore, inmemory};
///
/// let store = EventStore::new(inmemory::Store::new());
/// let stream = store.open_stream("giftcard", "card-1");
/// assert_eq!(stream.key().to_string(), "giftcard-card-1");
/// ```
pub struct EventStore<B, C = Optimistic, K = JsonCodec> {
    backend: B,
    check: C,
    codec: K,
    type_names: TypeNameStrategy,
}

impl<B: Backend> EventStore<B> {
    #[must_use]
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            check: Optimistic,
            codec: JsonCodec,
            type_names: TypeNameStrategy::default(),
        }
    }
}

impl<B, C, K> EventStore<B, C, K> {
    /// Replace the concurrency check run before every append.
    #[must_use]
    pub fn with_concurrency_check<C2: ConcurrencyCheck>(self, check: C2) -> EventStore<B, C2, K> {
        EventStore {
            backend: self.backend,
            check,
            codec: self.codec,
            type_names: self.type_names,
        }
    }

    /// Disable version checking; see [`Unchecked`] for how backends treat
    /// stale batches.
    #[must_use]
    pub fn without_concurrency_checking(self) -> EventStore<B, Unchecked, K> {
        self.with_concurrency_check(Unchecked)
    }

    #[must_use]
    pub fn with_codec<K2: Codec>(self, codec: K2) -> EventStore<B, C, K2> {
        EventStore {
            backend: self.backend,
            check: self.check,
            codec,
            type_names: self.type_names,
        }
    }

    #[must_use]
    pub const fn with_type_names(mut self, type_names: TypeNameStrategy) -> Self {
        self.type_names = type_names;
        self
    }

    pub const fn backend(&self) -> &B {
        &self.backend
    }

    pub const fn codec(&self) -> &K {
        &self.codec
    }
}

impl<B, C, K> EventStore<B, C, K>
where
    B: Backend,
    C: ConcurrencyCheck,
    K: Codec,
{
    /// Handle on one aggregate stream. Performs no I/O.
    pub fn open_stream(
        &self,
        aggregate_kind: impl Into<String>,
        aggregate_id: impl Into<String>,
    ) -> EventStream<'_, B, C, K> {
        let key = StreamKey::new(aggregate_kind, aggregate_id);
        tracing::trace!(stream = %key, "stream opened");
        EventStream { store: self, key }
    }

    /// Publish every event of the log in global append order.
    ///
    /// Snapshot and system records are skipped. Cancellation is checked
    /// before each publish. Returns the number of events published.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Cancelled`] once `cancel` fires, or the first
    /// backend error encountered.
    #[tracing::instrument(skip_all)]
    pub async fn replay_all<F, Fut>(
        &self,
        mut publish: F,
        cancel: &CancellationToken,
    ) -> Result<u64, StoreError<B::Error>>
    where
        F: FnMut(EventRecord) -> Fut,
        Fut: Future<Output = ()>,
    {
        let mut records = self.backend.read_all();
        let mut published = 0_u64;
        loop {
            let next = async { Ok::<_, B::Error>(records.next().await) };
            let Some(record) = cancellable(cancel, next).await? else {
                break;
            };
            let record = record.map_err(StoreError::Backend)?;
            if record.is_system() {
                tracing::trace!(event_kind = %record.event_kind, "system record skipped");
                continue;
            }
            ensure_live(cancel)?;
            publish(record).await;
            published += 1;
        }
        tracing::debug!(published, "log replayed");
        Ok(published)
    }
}

/// Handle on the log of one aggregate.
///
/// Borrowed from an [`EventStore`]; backend resources acquired by an
/// operation are released when that operation completes or its future or
/// stream is dropped.
pub struct EventStream<'a, B, C = Optimistic, K = JsonCodec> {
    store: &'a EventStore<B, C, K>,
    key: StreamKey,
}

impl<'a, B, C, K> EventStream<'a, B, C, K>
where
    B: Backend,
    C: ConcurrencyCheck,
    K: Codec,
{
    pub const fn key(&self) -> &StreamKey {
        &self.key
    }

    /// Append a batch ending at `expected_version`.
    ///
    /// The batch must be numbered contiguously after `expected_version -
    /// events.len()`, the version the writer believed current. The store's
    /// concurrency check runs before anything is written; on failure nothing
    /// is written. An empty batch is a no-op.
    ///
    /// # Errors
    ///
    /// - [`StoreError::Conflict`] if another writer moved the tail
    /// - [`StoreError::VersionGap`] if the batch is not contiguous
    /// - [`StoreError::Codec`] if an event fails to encode
    /// - [`StoreError::Cancelled`] if `cancel` fired before the write began
    /// - [`StoreError::Backend`] if persistence fails
    #[tracing::instrument(
        skip_all,
        fields(stream = %self.key, expected_version = expected_version, events_len = events.len())
    )]
    pub async fn append<E: EncodeEvent>(
        &self,
        events: &[Versioned<E>],
        expected_version: i64,
        headers: &Headers,
        cancel: &CancellationToken,
    ) -> Result<(), StoreError<B::Error>> {
        let Some(batch) = NonEmpty::from_vec(self.encode_batch(events, expected_version, headers)?)
        else {
            return Ok(());
        };
        let original_version = expected_version - len_i64(batch.len());

        ensure_live(cancel)?;
        self.store
            .check
            .verify(&self.store.backend, &self.key, original_version)
            .await?;

        ensure_live(cancel)?;
        self.store
            .backend
            .append(
                &self.key,
                batch,
                self.store.check.expected_tail(original_version),
            )
            .await?;

        tracing::debug!(original_version, "events appended");
        Ok(())
    }

    fn encode_batch<E: EncodeEvent>(
        &self,
        events: &[Versioned<E>],
        expected_version: i64,
        headers: &Headers,
    ) -> Result<Vec<EventRecord>, StoreError<B::Error>> {
        let first_version = expected_version - len_i64(events.len()) + 1;
        events
            .iter()
            .enumerate()
            .map(|(index, versioned)| {
                let expected = first_version + len_i64(index);
                if versioned.version != expected {
                    return Err(StoreError::VersionGap {
                        index,
                        expected,
                        found: versioned.version,
                    });
                }
                Ok(EventRecord {
                    aggregate_kind: self.key.aggregate_kind.clone(),
                    aggregate_id: self.key.aggregate_id.clone(),
                    version: versioned.version,
                    timestamp: versioned.timestamp,
                    event_kind: versioned.event.kind().to_string(),
                    data: versioned
                        .event
                        .encode(&self.store.codec)
                        .map_err(StoreError::codec)?,
                    headers: headers.clone(),
                })
            })
            .collect()
    }

    /// Raw records with `version >= from_version`, headers included.
    ///
    /// The sequence ends early with [`StoreError::Cancelled`] if `cancel`
    /// fires between records.
    pub fn read_records<'s>(
        &'s self,
        from_version: i64,
        cancel: &CancellationToken,
    ) -> impl Stream<Item = Result<EventRecord, StoreError<B::Error>>>
    + Send
    + use<'s, 'a, B, C, K> {
        let cancel = cancel.clone();
        async_stream::stream! {
            let mut records = self.store.backend.read(&self.key, from_version);
            while let Some(record) = records.next().await {
                if cancel.is_cancelled() {
                    yield Err(StoreError::Cancelled);
                    return;
                }
                match record {
                    Ok(record) => yield Ok(record),
                    Err(err) => {
                        yield Err(StoreError::Backend(err));
                        return;
                    }
                }
            }
        }
    }

    fn replay_from<'s, E>(
        &'s self,
        from_version: i64,
        cancel: &CancellationToken,
    ) -> impl Stream<Item = Result<Replayed<E>, StoreError<B::Error>>>
    + Send
    + use<'s, 'a, B, C, K, E>
    where
        E: DecodeEvent + Send,
    {
        let codec = &self.store.codec;
        self.read_records(from_version, cancel).map(move |record| {
            record?.decode(codec).map_err(StoreError::codec)
        })
    }

    /// The whole history, version ascending from 0.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if nothing was ever appended to the
    /// stream.
    #[tracing::instrument(skip_all, fields(stream = %self.key))]
    pub async fn replay<E>(
        &self,
        cancel: &CancellationToken,
    ) -> Result<
        impl Stream<Item = Result<Replayed<E>, StoreError<B::Error>>> + Send + '_,
        StoreError<B::Error>,
    >
    where
        E: DecodeEvent + Send + 'static,
    {
        let tail = cancellable(cancel, self.store.backend.tail_version(&self.key)).await?;
        if tail.is_none() {
            return Err(NotFound::from(&self.key).into());
        }
        Ok(self.replay_from(0, cancel))
    }

    /// The events newer than `snapshot`, version ascending.
    ///
    /// The returned sequence does not borrow `snapshot`, so the snapshot can
    /// be moved into the aggregate before replaying.
    pub fn replay_from_snapshot<'s, E, S>(
        &'s self,
        snapshot: &Snapshot<S>,
        cancel: &CancellationToken,
    ) -> impl Stream<Item = Result<Replayed<E>, StoreError<B::Error>>>
    + Send
    + use<'s, 'a, B, C, K, E, S>
    where
        E: DecodeEvent + Send,
    {
        tracing::trace!(
            stream = %self.key,
            from = snapshot.next_version(),
            "replaying from snapshot"
        );
        self.replay_from(snapshot.next_version(), cancel)
    }

    /// # Errors
    ///
    /// Returns [`StoreError::Codec`] if the state fails to encode, or a
    /// backend error.
    #[tracing::instrument(skip_all, fields(stream = %self.key, version = snapshot.version))]
    pub async fn save_snapshot<S: Serialize>(
        &self,
        snapshot: &Snapshot<S>,
        cancel: &CancellationToken,
    ) -> Result<(), StoreError<B::Error>> {
        let record = SnapshotRecord {
            aggregate_kind: self.key.aggregate_kind.clone(),
            aggregate_id: self.key.aggregate_id.clone(),
            version: snapshot.version,
            timestamp: snapshot.timestamp,
            snapshot_type: std::any::type_name::<S>().to_string(),
            data: self
                .store
                .codec
                .serialize(&snapshot.state)
                .map_err(StoreError::codec)?,
        };
        ensure_live(cancel)?;
        self.store
            .backend
            .save_snapshot(record)
            .await
            .map_err(StoreError::Backend)?;
        tracing::debug!("snapshot saved");
        Ok(())
    }

    /// # Errors
    ///
    /// Returns a backend error, or [`StoreError::Cancelled`].
    pub async fn has_snapshot(
        &self,
        cancel: &CancellationToken,
    ) -> Result<bool, StoreError<B::Error>> {
        cancellable(cancel, self.store.backend.has_snapshot(&self.key)).await
    }

    /// The snapshot with the highest version, decoded as `S`.
    ///
    /// A stored snapshot whose recorded type does not resolve to `S` under the
    /// store's [`TypeNameStrategy`] is ignored.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Codec`] if the state does not decode, or a
    /// backend error.
    #[tracing::instrument(skip_all, fields(stream = %self.key))]
    pub async fn latest_snapshot<S: DeserializeOwned>(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<Snapshot<S>>, StoreError<B::Error>> {
        let Some(record) =
            cancellable(cancel, self.store.backend.latest_snapshot(&self.key)).await?
        else {
            return Ok(None);
        };

        let expected = std::any::type_name::<S>();
        if !self.store.type_names.matches(&record.snapshot_type, expected) {
            tracing::warn!(
                recorded = %record.snapshot_type,
                expected,
                "snapshot type does not match; ignoring snapshot"
            );
            return Ok(None);
        }

        let state = self
            .store
            .codec
            .deserialize(&record.data)
            .map_err(StoreError::codec)?;
        Ok(Some(Snapshot {
            version: record.version,
            timestamp: record.timestamp,
            state,
        }))
    }
}

impl<B, C, K> Drop for EventStream<'_, B, C, K> {
    fn drop(&mut self) {
        tracing::trace!(stream = %self.key, "stream released");
    }
}

impl<B, C, K> fmt::Debug for EventStream<'_, B, C, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}
