use std::marker::PhantomData;

use eventide::{Aggregate, Apply, DomainEvent, aggregate::Root};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FundsDeposited {
    pub amount: i64,
}

impl DomainEvent for FundsDeposited {
    const KIND: &'static str = "funds-deposited";
}

#[derive(Aggregate)]
#[aggregate(events(FundsDeposited))]
pub struct Account<T: Send + Sync + 'static> {
    #[aggregate(root)]
    root: Root<Self>,
    marker: PhantomData<fn() -> T>,
}

impl<T: Send + Sync + 'static> Default for Account<T> {
    fn default() -> Self {
        Self {
            root: Root::default(),
            marker: PhantomData,
        }
    }
}

impl<T: Send + Sync + 'static> Apply<FundsDeposited> for Account<T> {
    fn apply(&mut self, _event: &FundsDeposited) {}
}

fn main() {
    let account = Account::<u8>::empty("a-1".to_string());
    assert_eq!(account.version(), -1);
}
