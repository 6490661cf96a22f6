//! Snapshots and the rule deciding when one is due.
//!
//! Snapshots persist aggregate state at a version, bounding the number of
//! events that need to be replayed when loading an aggregate. This module
//! provides:
//!
//! - [`Snapshot`] - Point-in-time aggregate state
//! - [`SnapshotStrategy`] - Pure threshold rule, either global or scoped to
//!   one aggregate kind
//!
//! Strategies are registered on [`Config`](crate::config::Config), which
//! resolves the single strategy consulted for each save.

use std::num::NonZeroU32;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::aggregate::Aggregate;

/// Point-in-time snapshot of aggregate state.
///
/// `version` is the version of the last event folded into `state`. Loading
/// from a snapshot replays only events with a strictly greater version.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot<S> {
    pub version: i64,
    pub timestamp: DateTime<Utc>,
    pub state: S,
}

impl<S> Snapshot<S> {
    #[must_use]
    pub fn new(version: i64, state: S) -> Self {
        Self {
            version,
            timestamp: Utc::now(),
            state,
        }
    }

    /// First event version not covered by this snapshot.
    #[must_use]
    pub const fn next_version(&self) -> i64 {
        self.version + 1
    }
}

/// Decide whether a snapshot is due after a save.
///
/// A snapshot is due when the strategy applies to the aggregate kind and the
/// aggregate version is a positive multiple of the threshold.
///
/// | Threshold | Snapshot at versions |
/// |-----------|----------------------|
/// | 10        | 10, 20, 30, ...      |
/// | 100       | 100, 200, ...        |
///
/// Start with the default of 100 and tune per aggregate kind from replay
/// cost. Long-lived aggregates with many small events benefit from lower
/// thresholds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotStrategy {
    threshold: NonZeroU32,
    aggregate_kind: Option<String>,
}

impl SnapshotStrategy {
    pub const DEFAULT_THRESHOLD: NonZeroU32 = NonZeroU32::new(100).unwrap();

    /// Strategy used for every aggregate without a more specific rule.
    #[must_use]
    pub const fn global(threshold: NonZeroU32) -> Self {
        Self {
            threshold,
            aggregate_kind: None,
        }
    }

    /// Strategy scoped to one aggregate kind.
    #[must_use]
    pub fn for_kind(aggregate_kind: impl Into<String>, threshold: NonZeroU32) -> Self {
        Self {
            threshold,
            aggregate_kind: Some(aggregate_kind.into()),
        }
    }

    /// Strategy scoped to aggregate type `A`.
    #[must_use]
    pub fn for_aggregate<A: Aggregate>(threshold: NonZeroU32) -> Self {
        Self::for_kind(A::KIND, threshold)
    }

    #[must_use]
    pub const fn threshold(&self) -> NonZeroU32 {
        self.threshold
    }

    /// Aggregate kind this strategy is scoped to, `None` for the global one.
    #[must_use]
    pub fn aggregate_kind(&self) -> Option<&str> {
        self.aggregate_kind.as_deref()
    }

    #[must_use]
    pub fn applies_to(&self, aggregate_kind: &str) -> bool {
        self.aggregate_kind
            .as_deref()
            .is_none_or(|kind| kind == aggregate_kind)
    }

    #[must_use]
    pub fn is_due(&self, aggregate_kind: &str, version: i64) -> bool {
        self.applies_to(aggregate_kind)
            && version > 0
            && version % i64::from(self.threshold.get()) == 0
    }

    /// Whether `aggregate` is due for a snapshot at its current version.
    #[must_use]
    pub fn needs_snapshot<A: Aggregate>(&self, aggregate: &A) -> bool {
        self.is_due(A::KIND, aggregate.version())
    }
}

impl Default for SnapshotStrategy {
    fn default() -> Self {
        Self::global(Self::DEFAULT_THRESHOLD)
    }
}
