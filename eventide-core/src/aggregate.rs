//! Aggregate event-application protocol.
//!
//! This module defines the building blocks for aggregates: the per-instance
//! bookkeeping ([`Root`]), the explicit type-to-handler registry
//! ([`Transitions`]) that state changes are routed through, and the
//! [`Aggregate`] trait whose provided methods implement versioning, dispatch
//! and buffering of not-yet-persisted events.

use std::{collections::HashMap, fmt, future::Future, sync::Arc};

use futures_core::Stream;
use serde::{Serialize, de::DeserializeOwned};
use tokio_stream::StreamExt;

use crate::{
    event::{DomainEvent, EventKind, Replayed, Variant, Versioned},
    snapshot::Snapshot,
};

/// Version of an aggregate that has not applied any event yet.
pub const INITIAL_VERSION: i64 = -1;

/// Entities whose state derives solely from their own event history.
///
/// Implementors supply storage for a [`Root`] plus the (usually empty) domain
/// state. Versioning, dispatch through the handler registry, buffering of new
/// events and replay are provided. `#[derive(Aggregate)]` generates the
/// implementation together with the event enum.
///
/// Business methods validate first, then call [`apply_change`]:
///
/// ```ignore
/// impl Giftcard {
///     pub fn redeem(&mut self, amount: i64) -> Result<(), GuardError> {
///         guard::argument(amount > 0, "amount", "Negative amount")?;
///         guard::state(self.balance >= amount, "Insufficient balance")?;
///         self.apply_change(GiftcardRedeemed { card_id: self.card_id, amount });
///         Ok(())
///     }
/// }
/// ```
///
/// [`apply_change`]: Aggregate::apply_change
pub trait Aggregate: Sized + Send {
    /// Aggregate type identifier used by the event store.
    ///
    /// Combined with the aggregate id to key streams and snapshots. Use
    /// lowercase, kebab-case for consistency: `"giftcard"`, `"user-account"`.
    const KIND: &'static str;

    type Event: EventKind + Clone + Send + Sync + 'static;

    /// Materialized state captured by snapshots. `()` for aggregates that do
    /// not snapshot.
    type Snapshot: Serialize + DeserializeOwned + Send + Sync + 'static;

    /// A fresh instance at version -1, with its handler registry built.
    fn empty(id: String) -> Self;

    fn root(&self) -> &Root<Self>;

    fn root_mut(&mut self) -> &mut Root<Self>;

    /// Capture the state needed to restore this aggregate.
    ///
    /// Returns `None` by default, which disables snapshots for the aggregate
    /// regardless of the configured strategy.
    fn create_snapshot(&self) -> Option<Self::Snapshot> {
        None
    }

    /// Restore state captured by [`create_snapshot`](Self::create_snapshot).
    fn load_from_snapshot(&mut self, _state: Self::Snapshot) {}

    fn id(&self) -> &str {
        self.root().id()
    }

    fn version(&self) -> i64 {
        self.root().version()
    }

    /// Events applied since the last successful save, oldest first.
    fn uncommitted_events(&self) -> &[Versioned<Self::Event>] {
        self.root().uncommitted()
    }

    /// Apply a new event and buffer it for persistence.
    fn apply_change(&mut self, event: impl Into<Self::Event>) {
        self.apply_event(event.into(), true);
    }

    /// Advance the version and route `event` to its registered transition.
    ///
    /// When `is_new` is set the event is wrapped with the resulting version
    /// and the current time and appended to the uncommitted buffer. Events
    /// with no registered transition still advance the version.
    fn apply_event(&mut self, event: Self::Event, is_new: bool) {
        let transitions = Arc::clone(&self.root().transitions);
        let root = self.root_mut();
        root.version += 1;
        let version = root.version;

        if !transitions.dispatch(self, &event) {
            tracing::trace!(
                aggregate_kind = Self::KIND,
                event_kind = event.kind(),
                version,
                "no transition registered; event ignored"
            );
        }

        if is_new {
            self.root_mut()
                .uncommitted
                .push(Versioned::new(event, version));
        }
    }

    /// Apply one event read back from the log. Nothing is buffered.
    fn apply_historic(&mut self, event: Replayed<Self::Event>) {
        match event {
            Replayed::Known(event) => self.apply_event(event, false),
            Replayed::Unknown { kind } => {
                let root = self.root_mut();
                root.version += 1;
                tracing::trace!(
                    aggregate_kind = Self::KIND,
                    event_kind = %kind,
                    version = root.version,
                    "unknown event kind replayed"
                );
            }
        }
    }

    /// Replay a history in its original order.
    ///
    /// # Errors
    ///
    /// Stops at and returns the first error yielded by `history`. Events
    /// applied before the error remain applied.
    fn load_from_history<S, E>(&mut self, history: S) -> impl Future<Output = Result<(), E>> + Send
    where
        S: Stream<Item = Result<Replayed<Self::Event>, E>> + Send,
        E: Send,
    {
        async move {
            let mut history = std::pin::pin!(history);
            while let Some(event) = history.next().await {
                self.apply_historic(event?);
            }
            Ok(())
        }
    }

    /// Clear the uncommitted buffer. The version is unchanged.
    fn commit_events(&mut self) {
        self.root_mut().uncommitted.clear();
    }

    /// Snapshot of the current state at the current version.
    fn snapshot(&self) -> Option<Snapshot<Self::Snapshot>> {
        self.create_snapshot()
            .map(|state| Snapshot::new(self.version(), state))
    }

    /// Restore state and version from a snapshot.
    fn restore(&mut self, snapshot: Snapshot<Self::Snapshot>) {
        self.root_mut().version = snapshot.version;
        self.load_from_snapshot(snapshot.state);
    }
}

/// Mutate an aggregate with a domain event.
///
/// `#[derive(Aggregate)]` registers one transition per listed event, each
/// routed to the matching `Apply<E>` implementation.
///
/// ```ignore
/// impl Apply<GiftcardLoaded> for Giftcard {
///     fn apply(&mut self, event: &GiftcardLoaded) {
///         self.balance += event.amount;
///     }
/// }
/// ```
pub trait Apply<E> {
    fn apply(&mut self, event: &E);
}

/// Opt-in snapshot support used by `#[aggregate(snapshot = T)]`.
pub trait Snapshotting: Aggregate {
    fn snapshot_state(&self) -> Self::Snapshot;

    fn restore_state(&mut self, state: Self::Snapshot);
}

type Transition<A> = Box<dyn Fn(&mut A, &<A as Aggregate>::Event) + Send + Sync>;

/// Explicit event-kind to handler registry.
///
/// Built once when an aggregate instance is constructed and shared between
/// clones. Dispatch looks the handler up by [`EventKind::kind`]; kinds with no
/// handler are ignored.
pub struct Transitions<A: Aggregate> {
    handlers: HashMap<&'static str, Transition<A>>,
}

impl<A: Aggregate> Transitions<A> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register the transition for event `E`, replacing any earlier one.
    #[must_use]
    pub fn on<E>(mut self, transition: fn(&mut A, &E)) -> Self
    where
        A: 'static,
        E: DomainEvent + 'static,
        A::Event: Variant<E>,
    {
        self.handlers.insert(
            E::KIND,
            Box::new(move |aggregate, event| {
                if let Some(event) = <A::Event as Variant<E>>::variant(event) {
                    transition(aggregate, event);
                }
            }),
        );
        self
    }

    pub fn handles(&self, kind: &str) -> bool {
        self.handlers.contains_key(kind)
    }

    /// Route `event` to its transition. Returns whether one was registered.
    pub fn dispatch(&self, aggregate: &mut A, event: &A::Event) -> bool {
        match self.handlers.get(event.kind()) {
            Some(transition) => {
                transition(aggregate, event);
                true
            }
            None => false,
        }
    }
}

impl<A: Aggregate> Default for Transitions<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Aggregate> fmt::Debug for Transitions<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.handlers.keys().collect();
        kinds.sort_unstable();
        f.debug_struct("Transitions").field("kinds", &kinds).finish()
    }
}

/// Identity, version and uncommitted buffer of one aggregate instance.
pub struct Root<A: Aggregate> {
    id: String,
    version: i64,
    uncommitted: Vec<Versioned<A::Event>>,
    transitions: Arc<Transitions<A>>,
}

impl<A: Aggregate> Root<A> {
    #[must_use]
    pub fn new(id: impl Into<String>, transitions: Transitions<A>) -> Self {
        Self {
            id: id.into(),
            version: INITIAL_VERSION,
            uncommitted: Vec::new(),
            transitions: Arc::new(transitions),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub const fn version(&self) -> i64 {
        self.version
    }

    pub fn uncommitted(&self) -> &[Versioned<A::Event>] {
        &self.uncommitted
    }

    pub fn transitions(&self) -> &Transitions<A> {
        &self.transitions
    }
}

impl<A: Aggregate> Default for Root<A> {
    fn default() -> Self {
        Self::new(String::new(), Transitions::new())
    }
}

impl<A: Aggregate> Clone for Root<A> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            version: self.version,
            uncommitted: self.uncommitted.clone(),
            transitions: Arc::clone(&self.transitions),
        }
    }
}

impl<A> fmt::Debug for Root<A>
where
    A: Aggregate,
    A::Event: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Root")
            .field("id", &self.id)
            .field("version", &self.version)
            .field("uncommitted", &self.uncommitted)
            .finish_non_exhaustive()
    }
}
