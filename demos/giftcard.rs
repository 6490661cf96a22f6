//! Giftcard Example
//!
//! A giftcard aggregate with guarded commands, saved through a repository
//! that publishes each event to a read model.
//!
//! This example shows:
//! - **Guards**: commands validate arguments and state before raising events
//! - **Publishing**: a read model kept up to date from `save_and_publish`
//! - **Snapshots**: a per-aggregate threshold from `Config`
//! - **Conflicts**: a stale writer is rejected and retries after reloading
//! - **Rebuilding**: a fresh read model built with `replay_all`
//!
//! Run with: `cargo run --example giftcard`

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use chrono::{Days, NaiveDate, Utc};
use eventide::{
    Aggregate, Apply, Config, DomainEvent, Repository, Snapshotting,
    aggregate::Root,
    guard::{self, GuardError},
    store::{CancellationToken, EventStore, inmemory},
};
use serde::{Deserialize, Serialize};

// =============================================================================
// Domain Events
// =============================================================================

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GiftcardCreated {
    pub card_number: u32,
    pub balance: i64,
    pub valid_until: NaiveDate,
}

impl DomainEvent for GiftcardCreated {
    const KIND: &'static str = "giftcard.created";
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GiftcardActivated {
    pub card_id: String,
}

impl DomainEvent for GiftcardActivated {
    const KIND: &'static str = "giftcard.activated";
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GiftcardLoaded {
    pub card_id: String,
    pub amount: i64,
}

impl DomainEvent for GiftcardLoaded {
    const KIND: &'static str = "giftcard.loaded";
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GiftcardRedeemed {
    pub card_id: String,
    pub amount: i64,
}

impl DomainEvent for GiftcardRedeemed {
    const KIND: &'static str = "giftcard.redeemed";
}

// =============================================================================
// Giftcard Aggregate
// =============================================================================

#[derive(Serialize, Deserialize)]
pub struct GiftcardState {
    balance: i64,
    is_active: bool,
    valid_until: NaiveDate,
}

/// Balances are in cents.
#[derive(Default, Aggregate)]
#[aggregate(
    events(GiftcardCreated, GiftcardActivated, GiftcardLoaded, GiftcardRedeemed),
    derives(Debug),
    snapshot = GiftcardState
)]
pub struct Giftcard {
    #[aggregate(root)]
    root: Root<Self>,
    balance: i64,
    is_active: bool,
    valid_until: NaiveDate,
}

impl Giftcard {
    pub fn create(
        card_number: u32,
        valid_until: NaiveDate,
        balance: i64,
    ) -> Result<Self, GuardError> {
        guard::argument(valid_until >= today(), "valid_until", "Already expired")?;
        guard::argument(balance >= 0, "balance", "Negative initial balance")?;

        let mut card = Self::empty(card_number.to_string());
        card.apply_change(GiftcardCreated {
            card_number,
            balance,
            valid_until,
        });
        Ok(card)
    }

    pub fn activate(&mut self) -> Result<(), GuardError> {
        guard::state(self.valid_until >= today(), "Already expired")?;
        guard::state(!self.is_active, "Already active")?;

        self.apply_change(GiftcardActivated {
            card_id: self.id().to_string(),
        });
        Ok(())
    }

    pub fn load(&mut self, amount: i64) -> Result<(), GuardError> {
        guard::argument(amount > 0, "amount", "Negative amount")?;
        guard::state(self.is_active, "Not active")?;
        guard::state(self.valid_until >= today(), "Already expired")?;

        self.apply_change(GiftcardLoaded {
            card_id: self.id().to_string(),
            amount,
        });
        Ok(())
    }

    pub fn redeem(&mut self, amount: i64) -> Result<(), GuardError> {
        guard::argument(amount > 0, "amount", "Negative amount")?;
        guard::state(self.is_active, "Not active")?;
        guard::state(self.valid_until >= today(), "Already expired")?;
        guard::state(amount <= self.balance, "Insufficient balance")?;

        self.apply_change(GiftcardRedeemed {
            card_id: self.id().to_string(),
            amount,
        });
        Ok(())
    }
}

fn today() -> NaiveDate {
    Utc::now().date_naive()
}

impl Apply<GiftcardCreated> for Giftcard {
    fn apply(&mut self, event: &GiftcardCreated) {
        self.balance = event.balance;
        self.valid_until = event.valid_until;
        self.is_active = false;
    }
}

impl Apply<GiftcardActivated> for Giftcard {
    fn apply(&mut self, _event: &GiftcardActivated) {
        self.is_active = true;
    }
}

impl Apply<GiftcardLoaded> for Giftcard {
    fn apply(&mut self, event: &GiftcardLoaded) {
        self.balance += event.amount;
    }
}

impl Apply<GiftcardRedeemed> for Giftcard {
    fn apply(&mut self, event: &GiftcardRedeemed) {
        self.balance -= event.amount;
    }
}

impl Snapshotting for Giftcard {
    fn snapshot_state(&self) -> GiftcardState {
        GiftcardState {
            balance: self.balance,
            is_active: self.is_active,
            valid_until: self.valid_until,
        }
    }

    fn restore_state(&mut self, state: GiftcardState) {
        self.balance = state.balance;
        self.is_active = state.is_active;
        self.valid_until = state.valid_until;
    }
}

// =============================================================================
// Read Model
// =============================================================================

/// Balances by card id, fed by published events.
#[derive(Clone, Default)]
struct Balances(Arc<Mutex<BTreeMap<String, i64>>>);

impl Balances {
    fn publish(&self, event: GiftcardEvent) -> std::future::Ready<()> {
        if let Ok(mut balances) = self.0.lock() {
            match event {
                GiftcardEvent::GiftcardCreated(e) => {
                    balances.insert(e.card_number.to_string(), e.balance);
                }
                GiftcardEvent::GiftcardActivated(_) => {}
                GiftcardEvent::GiftcardLoaded(e) => {
                    *balances.entry(e.card_id).or_default() += e.amount;
                }
                GiftcardEvent::GiftcardRedeemed(e) => {
                    *balances.entry(e.card_id).or_default() -= e.amount;
                }
            }
        }
        std::future::ready(())
    }

    fn get(&self, card_id: &str) -> Option<i64> {
        self.0.lock().ok()?.get(card_id).copied()
    }
}

// =============================================================================
// Example
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    println!("=== Giftcard Example ===\n");

    let config = Config::builder()
        .snapshot_threshold_for::<Giftcard>(3)
        .build()?;
    let repository = Repository::new(EventStore::new(inmemory::Store::new())).with_config(config);
    let balances = Balances::default();

    // Create and activate a card.
    let valid_until = today()
        .checked_add_days(Days::new(365))
        .ok_or("date out of range")?;
    let mut card = Giftcard::create(1001, valid_until, 50_00)?;
    card.activate()?;
    repository
        .save_and_publish(&mut card, |e| balances.publish(e))
        .await?;
    println!("Created card {} at version {}", card.id(), card.version());

    // Guards reject invalid commands before any event is raised.
    let mut card: Giftcard = repository.load("1001").await?;
    if let Err(err) = card.redeem(80_00) {
        println!("Rejected redemption: {err}");
    }
    card.redeem(20_00)?;
    card.load(5_00)?;
    repository
        .save_and_publish(&mut card, |e| balances.publish(e))
        .await?;
    println!(
        "Card {} at version {}, read model balance {:?}",
        card.id(),
        card.version(),
        balances.get("1001")
    );

    // Version 3 was a snapshot point, so this load starts from the snapshot.
    let stream = repository.store().open_stream(Giftcard::KIND, "1001");
    println!(
        "Snapshot stored: {}",
        stream.has_snapshot(&CancellationToken::new()).await?
    );

    // Two writers load the same version; the second save conflicts.
    let mut first: Giftcard = repository.load("1001").await?;
    let mut second: Giftcard = repository.load("1001").await?;
    first.redeem(10_00)?;
    second.redeem(1_00)?;
    repository
        .save_and_publish(&mut first, |e| balances.publish(e))
        .await?;
    match repository.save(&mut second).await {
        Err(err) if err.is_conflict() => {
            println!("Second writer rejected: {err}");
            let mut retry: Giftcard = repository.load("1001").await?;
            retry.redeem(1_00)?;
            repository
                .save_and_publish(&mut retry, |e| balances.publish(e))
                .await?;
            println!("Retried at version {}", retry.version());
        }
        other => other?,
    }

    // Rebuild a read model from the whole log.
    let rebuilt = Balances::default();
    let replayed = repository
        .store()
        .replay_all(
            |record| {
                let event = record
                    .decode::<GiftcardEvent, _>(repository.store().codec())
                    .ok()
                    .and_then(eventide::Replayed::known);
                if let Some(event) = event {
                    let _ = rebuilt.publish(event);
                }
                std::future::ready(())
            },
            &CancellationToken::new(),
        )
        .await?;
    println!(
        "Replayed {replayed} events; rebuilt balance {:?} matches {:?}",
        rebuilt.get("1001"),
        balances.get("1001")
    );

    Ok(())
}
