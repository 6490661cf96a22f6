//! Application service orchestration.
//!
//! `Repository` loads aggregates (snapshot plus newer events, or full replay)
//! and saves them (append with concurrency check, publish, commit the buffer,
//! snapshot when due).
//!
//! There is no automatic retry on [`ConcurrencyConflict`]: the caller reloads,
//! re-applies its command and saves again.
//!
//! [`ConcurrencyConflict`]: crate::concurrency::ConcurrencyConflict

use std::future::{Future, Ready, ready};

use crate::{
    aggregate::Aggregate,
    codec::{Codec, JsonCodec},
    concurrency::{ConcurrencyCheck, Optimistic},
    config::Config,
    event::{DecodeEvent, EncodeEvent},
    snapshot::Snapshot,
    store::{Backend, CancellationToken, EventStore, EventStream, Headers, StoreError},
};

/// Loads and saves aggregates through an [`EventStore`].
///
/// ```
/// use eventide_core::{config::Config, repository::Repository, store::{EventStore, inmemory}};
///
/// let config = Config::builder().snapshot_threshold(50).build()?;
/// let repository = Repository::new(EventStore::new(inmemory::Store::new())).with_config(config);
/// # Ok::<(), eventide_core::config::ConfigError>(())
/// ```
pub struct Repository<B, C = Optimistic, K = JsonCodec> {
    store: EventStore<B, C, K>,
    config: Config,
}

impl<B, C, K> Repository<B, C, K> {
    /// Repository with the default configuration (global snapshot threshold
    /// of 100).
    #[must_use]
    pub fn new(store: EventStore<B, C, K>) -> Self {
        Self {
            store,
            config: Config::default(),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub const fn store(&self) -> &EventStore<B, C, K> {
        &self.store
    }

    pub const fn config(&self) -> &Config {
        &self.config
    }
}

impl<B, C, K> Repository<B, C, K>
where
    B: Backend,
    C: ConcurrencyCheck,
    K: Codec,
{
    /// Load an aggregate by id.
    ///
    /// # Errors
    ///
    /// See [`load_with`](Self::load_with).
    pub async fn load<A>(&self, id: &str) -> Result<A, StoreError<B::Error>>
    where
        A: Aggregate,
        A::Event: DecodeEvent,
    {
        self.load_with(id, &CancellationToken::new()).await
    }

    /// Load an aggregate by id, restoring the latest snapshot when one exists
    /// and replaying only the events after it.
    ///
    /// A snapshot that cannot be read is logged and ignored; the aggregate is
    /// then rebuilt from its full history.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the aggregate has neither events
    /// nor a snapshot, [`StoreError::Cancelled`] if `cancel` fires, or the
    /// first backend or decode error met during replay.
    #[tracing::instrument(skip(self, cancel), fields(aggregate_kind = A::KIND))]
    pub async fn load_with<A>(
        &self,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<A, StoreError<B::Error>>
    where
        A: Aggregate,
        A::Event: DecodeEvent,
    {
        let stream = self.store.open_stream(A::KIND, id);
        let mut aggregate = A::empty(id.to_string());

        match self.latest_snapshot::<A>(&stream, cancel).await? {
            Some(snapshot) => {
                let history = stream.replay_from_snapshot(&snapshot, cancel);
                aggregate.restore(snapshot);
                aggregate.load_from_history(history).await?;
            }
            None => {
                let history = stream.replay(cancel).await?;
                aggregate.load_from_history(history).await?;
            }
        }

        tracing::debug!(version = aggregate.version(), "aggregate loaded");
        Ok(aggregate)
    }

    async fn latest_snapshot<A: Aggregate>(
        &self,
        stream: &EventStream<'_, B, C, K>,
        cancel: &CancellationToken,
    ) -> Result<Option<Snapshot<A::Snapshot>>, StoreError<B::Error>> {
        match stream.latest_snapshot::<A::Snapshot>(cancel).await {
            Ok(snapshot) => Ok(snapshot),
            Err(StoreError::Cancelled) => Err(StoreError::Cancelled),
            Err(error) => {
                tracing::warn!(
                    %error,
                    "failed to load snapshot, falling back to full replay"
                );
                Ok(None)
            }
        }
    }

    /// Save with empty headers and no publisher.
    ///
    /// # Errors
    ///
    /// See [`save_with`](Self::save_with).
    pub async fn save<A>(&self, aggregate: &mut A) -> Result<(), StoreError<B::Error>>
    where
        A: Aggregate,
        A::Event: EncodeEvent,
    {
        self.save_with(aggregate, &Headers::new(), no_publish, &CancellationToken::new())
            .await
    }

    /// Save with headers and no publisher.
    ///
    /// # Errors
    ///
    /// See [`save_with`](Self::save_with).
    pub async fn save_with_headers<A>(
        &self,
        aggregate: &mut A,
        headers: &Headers,
    ) -> Result<(), StoreError<B::Error>>
    where
        A: Aggregate,
        A::Event: EncodeEvent,
    {
        self.save_with(aggregate, headers, no_publish, &CancellationToken::new())
            .await
    }

    /// Save with empty headers, publishing each appended event.
    ///
    /// # Errors
    ///
    /// See [`save_with`](Self::save_with).
    pub async fn save_and_publish<A, P, Fut>(
        &self,
        aggregate: &mut A,
        publish: P,
    ) -> Result<(), StoreError<B::Error>>
    where
        A: Aggregate,
        A::Event: EncodeEvent,
        P: FnMut(A::Event) -> Fut,
        Fut: Future<Output = ()>,
    {
        self.save_with(aggregate, &Headers::new(), publish, &CancellationToken::new())
            .await
    }

    /// Persist the aggregate's uncommitted events.
    ///
    /// The buffer is appended with `expected_version = aggregate.version()`.
    /// After a successful append each event is handed to `publish` in append
    /// order, the buffer is cleared, and a snapshot is written if the
    /// configured strategy says one is due. Saving an aggregate with an empty
    /// buffer does nothing.
    ///
    /// Publishing is at-least-once from the caller's point of view: the
    /// append is not rolled back whatever `publish` does.
    ///
    /// # Errors
    ///
    /// - [`StoreError::Conflict`] if another writer appended first; nothing
    ///   was written and the buffer is intact
    /// - [`StoreError::Cancelled`] if `cancel` fired before the append; once
    ///   the append succeeds, cancellation only skips the snapshot write
    /// - a backend or codec error from the append or the snapshot write
    #[tracing::instrument(
        skip_all,
        fields(aggregate_kind = A::KIND, aggregate_id = %aggregate.id(), version = aggregate.version())
    )]
    pub async fn save_with<A, P, Fut>(
        &self,
        aggregate: &mut A,
        headers: &Headers,
        mut publish: P,
        cancel: &CancellationToken,
    ) -> Result<(), StoreError<B::Error>>
    where
        A: Aggregate,
        A::Event: EncodeEvent,
        P: FnMut(A::Event) -> Fut,
        Fut: Future<Output = ()>,
    {
        if aggregate.uncommitted_events().is_empty() {
            tracing::trace!("no uncommitted events; nothing to save");
            return Ok(());
        }

        let stream = self.store.open_stream(A::KIND, aggregate.id());
        stream
            .append(
                aggregate.uncommitted_events(),
                aggregate.version(),
                headers,
                cancel,
            )
            .await?;

        for versioned in aggregate.uncommitted_events() {
            publish(versioned.event.clone()).await;
        }

        let committed = aggregate.uncommitted_events().len();
        aggregate.commit_events();
        tracing::debug!(committed, "events committed");

        if self.config.snapshot_strategy(A::KIND).needs_snapshot(aggregate) {
            match aggregate.snapshot() {
                Some(snapshot) => match stream.save_snapshot(&snapshot, cancel).await {
                    // The events are durable; only the snapshot is skipped.
                    Err(StoreError::Cancelled) => {
                        tracing::debug!("cancelled after append; snapshot skipped");
                    }
                    result => result?,
                },
                None => tracing::trace!("snapshot due but aggregate does not snapshot"),
            }
        }

        Ok(())
    }
}

fn no_publish<E>(_event: E) -> Ready<()> {
    ready(())
}
