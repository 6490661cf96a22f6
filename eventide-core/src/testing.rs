//! Hand-written aggregate shared by the unit tests.

use serde::{Deserialize, Serialize};

use crate::{
    aggregate::{Aggregate, Apply, Root, Transitions},
    codec::Codec,
    event::{DecodeEvent, DomainEvent, EventKind, Variant},
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Added {
    pub amount: i64,
}

impl DomainEvent for Added {
    const KIND: &'static str = "counter-added";
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reset;

impl DomainEvent for Reset {
    const KIND: &'static str = "counter-reset";
}

/// Known to the event enum but without a registered transition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Retired;

impl DomainEvent for Retired {
    const KIND: &'static str = "counter-retired";
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CounterEvent {
    Added(Added),
    Reset(Reset),
    Retired(Retired),
}

impl EventKind for CounterEvent {
    fn kind(&self) -> &'static str {
        match self {
            Self::Added(e) => e.kind(),
            Self::Reset(e) => e.kind(),
            Self::Retired(e) => e.kind(),
        }
    }
}

impl Serialize for CounterEvent {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Added(e) => e.serialize(serializer),
            Self::Reset(e) => e.serialize(serializer),
            Self::Retired(e) => e.serialize(serializer),
        }
    }
}

impl DecodeEvent for CounterEvent {
    fn decode<C: Codec>(kind: &str, data: &[u8], codec: &C) -> Result<Option<Self>, C::Error> {
        Ok(Some(match kind {
            Added::KIND => Self::Added(codec.deserialize(data)?),
            Reset::KIND => Self::Reset(codec.deserialize(data)?),
            Retired::KIND => Self::Retired(codec.deserialize(data)?),
            _ => return Ok(None),
        }))
    }
}

macro_rules! counter_variant {
    ($($event:ident),*) => {$(
        impl From<$event> for CounterEvent {
            fn from(event: $event) -> Self {
                Self::$event(event)
            }
        }

        impl Variant<$event> for CounterEvent {
            fn variant(&self) -> Option<&$event> {
                match self {
                    Self::$event(e) => Some(e),
                    #[allow(unreachable_patterns)]
                    _ => None,
                }
            }
        }
    )*};
}

counter_variant!(Added, Reset, Retired);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterState {
    pub value: i64,
}

#[derive(Debug, Default)]
pub struct Counter {
    root: Root<Self>,
    pub value: i64,
}

impl Aggregate for Counter {
    const KIND: &'static str = "counter";
    type Event = CounterEvent;
    type Snapshot = CounterState;

    fn empty(id: String) -> Self {
        Self {
            root: Root::new(
                id,
                Transitions::new()
                    .on::<Added>(<Self as Apply<Added>>::apply)
                    .on::<Reset>(<Self as Apply<Reset>>::apply),
            ),
            value: 0,
        }
    }

    fn root(&self) -> &Root<Self> {
        &self.root
    }

    fn root_mut(&mut self) -> &mut Root<Self> {
        &mut self.root
    }

    fn create_snapshot(&self) -> Option<Self::Snapshot> {
        Some(CounterState { value: self.value })
    }

    fn load_from_snapshot(&mut self, state: Self::Snapshot) {
        self.value = state.value;
    }
}

impl Apply<Added> for Counter {
    fn apply(&mut self, event: &Added) {
        self.value += event.amount;
    }
}

impl Apply<Reset> for Counter {
    fn apply(&mut self, _event: &Reset) {
        self.value = 0;
    }
}

/// Aggregate that never snapshots.
#[derive(Debug, Default)]
pub struct Ledger {
    root: Root<Self>,
    pub total: i64,
}

impl Aggregate for Ledger {
    const KIND: &'static str = "ledger";
    type Event = CounterEvent;
    type Snapshot = ();

    fn empty(id: String) -> Self {
        Self {
            root: Root::new(
                id,
                Transitions::new().on::<Added>(|ledger: &mut Self, event: &Added| {
                    ledger.total += event.amount;
                }),
            ),
            total: 0,
        }
    }

    fn root(&self) -> &Root<Self> {
        &self.root
    }

    fn root_mut(&mut self) -> &mut Root<Self> {
        &mut self.root
    }
}
