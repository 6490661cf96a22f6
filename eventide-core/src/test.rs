//! Test utilities for event-sourced aggregates.
//!
//! - [`TestFramework`]: given-when-then testing of aggregate command methods
//!   in isolation, without a store
//! - [`RepositoryTestExt`]: seeding and concurrent-writer simulation against a
//!   real [`Repository`]
//!
//! ```ignore
//! use eventide::test::TestFramework;
//!
//! #[test]
//! fn cannot_redeem_more_than_balance() {
//!     TestFramework::<Giftcard>::given(&[GiftcardCreated { number: 1, balance: 10 }.into()])
//!         .when(|card| card.redeem(20))
//!         .then_expect_error_message("Insufficient balance");
//! }
//! ```

use std::{fmt, future::Future};

use crate::{
    aggregate::{Aggregate, INITIAL_VERSION},
    codec::Codec,
    concurrency::ConcurrencyCheck,
    event::{EncodeEvent, Replayed, Versioned},
    repository::Repository,
    store::{Backend, CancellationToken, Headers, StoreError, StreamKey},
};

/// Given-when-then executor for aggregate command methods.
pub struct TestFramework<A: Aggregate> {
    aggregate: A,
}

impl<A: Aggregate> TestFramework<A> {
    /// Start a scenario with `events` already in the aggregate's history.
    ///
    /// Pass `&[]` to start from a new aggregate.
    #[must_use]
    pub fn given(events: &[A::Event]) -> Self {
        Self {
            aggregate: A::empty("test".to_string()),
        }
        .and(events.to_vec())
    }

    /// Apply more historic events before the command runs.
    #[must_use]
    pub fn and(mut self, events: Vec<A::Event>) -> Self {
        for event in events {
            self.aggregate.apply_historic(Replayed::Known(event));
        }
        self
    }

    /// Run a command method against the aggregate.
    ///
    /// Only events raised by `command` are reported; the given history is
    /// not.
    #[must_use]
    pub fn when<F, Err>(mut self, command: F) -> TestResult<A, Err>
    where
        F: FnOnce(&mut A) -> Result<(), Err>,
    {
        let result = command(&mut self.aggregate).map(|()| {
            self.aggregate
                .uncommitted_events()
                .iter()
                .map(|versioned| versioned.event.clone())
                .collect()
        });
        TestResult {
            aggregate: self.aggregate,
            result,
        }
    }
}

/// Outcome of a command, ready for assertions.
pub struct TestResult<A: Aggregate, Err> {
    aggregate: A,
    result: Result<Vec<A::Event>, Err>,
}

impl<A: Aggregate, Err> TestResult<A, Err> {
    /// # Panics
    ///
    /// Panics if the command failed or raised different events.
    #[track_caller]
    pub fn then_expect_events(self, expected: &[A::Event])
    where
        A::Event: PartialEq + fmt::Debug,
        Err: fmt::Debug,
    {
        match self.result {
            Ok(events) => assert_eq!(events, expected, "raised events did not match"),
            Err(error) => panic!("expected events but got error: {error:?}"),
        }
    }

    /// # Panics
    ///
    /// Panics if the command failed or raised any event.
    #[track_caller]
    pub fn then_expect_no_events(self)
    where
        A::Event: fmt::Debug,
        Err: fmt::Debug,
    {
        match self.result {
            Ok(events) => assert!(events.is_empty(), "expected no events but got: {events:?}"),
            Err(error) => panic!("expected no events but got error: {error:?}"),
        }
    }

    /// # Panics
    ///
    /// Panics if the command succeeded.
    #[track_caller]
    pub fn then_expect_error(self)
    where
        A::Event: fmt::Debug,
    {
        if let Ok(events) = self.result {
            panic!("expected error but got events: {events:?}");
        }
    }

    /// # Panics
    ///
    /// Panics if the command succeeded or failed with a different error.
    #[track_caller]
    pub fn then_expect_error_eq(self, expected: &Err)
    where
        A::Event: fmt::Debug,
        Err: PartialEq + fmt::Debug,
    {
        match self.result {
            Ok(events) => panic!("expected error but got events: {events:?}"),
            Err(error) => assert_eq!(&error, expected, "error did not match"),
        }
    }

    /// # Panics
    ///
    /// Panics if the command succeeded or its error message does not contain
    /// `expected`.
    #[track_caller]
    pub fn then_expect_error_message(self, expected: &str)
    where
        A::Event: fmt::Debug,
        Err: fmt::Display,
    {
        match self.result {
            Ok(events) => panic!("expected error but got events: {events:?}"),
            Err(error) => {
                let message = error.to_string();
                assert!(
                    message.contains(expected),
                    "expected error message to contain '{expected}' but got: {message}"
                );
            }
        }
    }

    /// The aggregate after the command, for state assertions.
    pub fn aggregate(&self) -> &A {
        &self.aggregate
    }

    /// The raw outcome for custom assertions.
    ///
    /// # Errors
    ///
    /// Returns the command's error.
    pub fn inspect_result(self) -> Result<Vec<A::Event>, Err> {
        self.result
    }
}

/// Fixture helpers for [`Repository`] integration tests.
///
/// Both methods bypass aggregate command methods and append straight to the
/// aggregate's stream, after whatever it already holds.
pub trait RepositoryTestExt {
    type Error: std::error::Error;

    /// Append `events` to the stream of aggregate `A` with id `id`.
    fn seed_events<A>(
        &self,
        id: &str,
        events: Vec<A::Event>,
    ) -> impl Future<Output = Result<(), StoreError<Self::Error>>> + Send
    where
        A: Aggregate,
        A::Event: EncodeEvent;

    /// Append one event as another writer would, so that a previously loaded
    /// aggregate becomes stale.
    fn inject_concurrent_event<A>(
        &self,
        id: &str,
        event: A::Event,
    ) -> impl Future<Output = Result<(), StoreError<Self::Error>>> + Send
    where
        A: Aggregate,
        A::Event: EncodeEvent,
    {
        self.seed_events::<A>(id, vec![event])
    }
}

impl<B, C, K> RepositoryTestExt for Repository<B, C, K>
where
    B: Backend,
    C: ConcurrencyCheck,
    K: Codec,
{
    type Error = B::Error;

    async fn seed_events<A>(
        &self,
        id: &str,
        events: Vec<A::Event>,
    ) -> Result<(), StoreError<B::Error>>
    where
        A: Aggregate,
        A::Event: EncodeEvent,
    {
        let key = StreamKey::new(A::KIND, id);
        let tail = self
            .store()
            .backend()
            .tail_version(&key)
            .await
            .map_err(StoreError::Backend)?
            .unwrap_or(INITIAL_VERSION);

        let versioned: Vec<_> = (tail + 1..)
            .zip(events)
            .map(|(version, event)| Versioned::new(event, version))
            .collect();
        let Some(last) = versioned.last().map(|v| v.version) else {
            return Ok(());
        };

        self.store()
            .open_stream(A::KIND, id)
            .append(&versioned, last, &Headers::new(), &CancellationToken::new())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        guard::{self, GuardError},
        store::{EventStore, inmemory},
        testing::{Added, Counter, CounterEvent, Reset},
    };

    impl Counter {
        fn add(&mut self, amount: i64) -> Result<(), GuardError> {
            guard::argument(amount > 0, "amount", "amount must be positive")?;
            self.apply_change(Added { amount });
            Ok(())
        }

        fn reset(&mut self) -> Result<(), GuardError> {
            guard::state(self.value != 0, "already at zero")?;
            self.apply_change(Reset);
            Ok(())
        }
    }

    type CounterTest = TestFramework<Counter>;

    #[test]
    fn given_no_events_when_add_then_raises_event() {
        CounterTest::given(&[])
            .when(|counter| counter.add(10))
            .then_expect_events(&[Added { amount: 10 }.into()]);
    }

    #[test]
    fn given_history_is_not_reported() {
        let result = CounterTest::given(&[Added { amount: 5 }.into()])
            .and(vec![Added { amount: 5 }.into()])
            .when(Counter::reset);
        assert_eq!(result.aggregate().value, 0);
        assert_eq!(result.aggregate().version(), 2);
        result.then_expect_events(&[CounterEvent::Reset(Reset)]);
    }

    #[test]
    fn guard_failure_is_reported() {
        CounterTest::given(&[])
            .when(Counter::reset)
            .then_expect_error_eq(&GuardError::InvalidState {
                message: "already at zero".into(),
            });
    }

    #[test]
    fn guard_failure_message_is_matched() {
        CounterTest::given(&[])
            .when(|counter| counter.add(-5))
            .then_expect_error_message("amount must be positive");
    }

    #[test]
    fn command_without_events() {
        CounterTest::given(&[])
            .when(|_| Ok::<_, GuardError>(()))
            .then_expect_no_events();
    }

    #[test]
    fn failing_command_expects_error() {
        let result = CounterTest::given(&[]).when(|counter| counter.add(0));
        assert!(result.inspect_result().is_err());
    }

    #[tokio::test]
    async fn seeded_events_extend_the_stream() {
        let repository = Repository::new(EventStore::new(inmemory::Store::new()));
        repository
            .seed_events::<Counter>(
                "c-1",
                vec![Added { amount: 1 }.into(), Added { amount: 2 }.into()],
            )
            .await
            .unwrap();
        repository
            .seed_events::<Counter>("c-1", vec![Added { amount: 3 }.into()])
            .await
            .unwrap();

        let loaded: Counter = repository.load("c-1").await.unwrap();
        assert_eq!(loaded.version(), 2);
        assert_eq!(loaded.value, 6);
    }

    #[tokio::test]
    async fn injected_event_makes_loaded_aggregate_stale() {
        let repository = Repository::new(EventStore::new(inmemory::Store::new()));
        repository
            .seed_events::<Counter>("c-1", vec![Added { amount: 1 }.into()])
            .await
            .unwrap();

        let mut counter: Counter = repository.load("c-1").await.unwrap();
        repository
            .inject_concurrent_event::<Counter>("c-1", Reset.into())
            .await
            .unwrap();

        counter.add(4).unwrap();
        let err = repository.save(&mut counter).await.unwrap_err();
        assert!(err.is_conflict());
    }
}
