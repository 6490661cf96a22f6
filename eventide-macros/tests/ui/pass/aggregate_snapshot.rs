use eventide::{Aggregate, Apply, DomainEvent, Snapshotting, aggregate::Root};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FundsDeposited {
    pub amount: i64,
}

impl DomainEvent for FundsDeposited {
    const KIND: &'static str = "funds-deposited";
}

#[derive(Serialize, Deserialize)]
pub struct AccountState {
    balance: i64,
}

#[derive(Default, Aggregate)]
#[aggregate(kind = "account", events(FundsDeposited), derives(Debug, PartialEq), snapshot = AccountState)]
pub struct Account {
    #[aggregate(root)]
    root: Root<Self>,
    balance: i64,
}

impl Apply<FundsDeposited> for Account {
    fn apply(&mut self, event: &FundsDeposited) {
        self.balance += event.amount;
    }
}

impl Snapshotting for Account {
    fn snapshot_state(&self) -> AccountState {
        AccountState {
            balance: self.balance,
        }
    }

    fn restore_state(&mut self, state: AccountState) {
        self.balance = state.balance;
    }
}

fn main() {
    let mut account = Account::empty("a-1".to_string());
    account.apply_change(FundsDeposited { amount: 5 });
    assert_eq!(
        account.uncommitted_events()[0].event,
        AccountEvent::FundsDeposited(FundsDeposited { amount: 5 })
    );

    let snapshot = account.snapshot().expect("snapshots enabled");
    let mut restored = Account::empty("a-1".to_string());
    restored.restore(snapshot);
    assert_eq!(restored.balance, 5);
    assert_eq!(restored.version(), 0);
    assert_eq!(Account::KIND, "account");
}
