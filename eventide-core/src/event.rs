//! Domain events and the envelopes that carry them.
//!
//! `DomainEvent` is the lightweight trait every concrete event struct
//! implements. Aggregates group their events into a sum type (usually generated
//! by `#[derive(Aggregate)]`) which implements [`EventKind`], [`Variant`] and
//! the codec traits [`EncodeEvent`] / [`DecodeEvent`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::codec::Codec;

/// Marker trait for events that can be persisted by the event store.
///
/// Each event carries a unique [`Self::KIND`] identifier that is recorded next
/// to the encoded payload, so replay can route stored bytes back to the
/// correct type.
pub trait DomainEvent {
    const KIND: &'static str;
}

/// Extension trait for getting the event kind from an event instance.
///
/// Blanket-implemented for every [`DomainEvent`]. Event enums implement it by
/// forwarding to the wrapped variant.
pub trait EventKind {
    fn kind(&self) -> &'static str;
}

impl<T: DomainEvent> EventKind for T {
    fn kind(&self) -> &'static str {
        T::KIND
    }
}

/// Borrow a concrete event out of an event sum type.
///
/// The handler registry uses this to hand each registered handler the event
/// struct it was written for.
pub trait Variant<E> {
    fn variant(&self) -> Option<&E>;
}

/// Events that can encode themselves as a kind tag plus payload bytes.
///
/// Blanket-implemented for any serializable [`EventKind`].
pub trait EncodeEvent: EventKind {
    /// # Errors
    ///
    /// Returns the codec error if the payload cannot be serialized.
    fn encode<C: Codec>(&self, codec: &C) -> Result<Vec<u8>, C::Error>;
}

impl<T> EncodeEvent for T
where
    T: EventKind + Serialize,
{
    fn encode<C: Codec>(&self, codec: &C) -> Result<Vec<u8>, C::Error> {
        codec.serialize(self)
    }
}

/// Event sum types that can rebuild themselves from a stored kind and payload.
pub trait DecodeEvent: Sized {
    /// Decode a stored payload.
    ///
    /// Returns `Ok(None)` for kinds this type does not know about, so that
    /// histories written by newer code still replay.
    ///
    /// # Errors
    ///
    /// Returns the codec error when the kind is known but the payload does not
    /// decode.
    fn decode<C: Codec>(kind: &str, data: &[u8], codec: &C) -> Result<Option<Self>, C::Error>;
}

/// An event wrapped with the version it produced and the time it was applied.
///
/// This is the durable unit appended to an event stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Versioned<E> {
    pub event: E,
    pub version: i64,
    pub timestamp: DateTime<Utc>,
}

impl<E> Versioned<E> {
    #[must_use]
    pub fn new(event: E, version: i64) -> Self {
        Self {
            event,
            version,
            timestamp: Utc::now(),
        }
    }

    /// Unwrap the inner domain event.
    pub fn into_inner(self) -> E {
        self.event
    }
}

/// A historic event as seen by replay.
///
/// Events whose kind the current code does not recognise still occupy a
/// version slot in the stream; they are replayed as [`Replayed::Unknown`] so
/// the aggregate version stays aligned with the log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Replayed<E> {
    Known(E),
    Unknown { kind: String },
}

impl<E> Replayed<E> {
    /// The decoded event, if its kind was recognised.
    pub fn known(self) -> Option<E> {
        match self {
            Self::Known(event) => Some(event),
            Self::Unknown { .. } => None,
        }
    }
}

impl<E> From<E> for Replayed<E> {
    fn from(event: E) -> Self {
        Self::Known(event)
    }
}
