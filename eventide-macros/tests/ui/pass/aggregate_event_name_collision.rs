use eventide::{Aggregate, Apply, DomainEvent, aggregate::Root};
use serde::{Deserialize, Serialize};

mod foo {
    use super::{Deserialize, DomainEvent, Serialize};

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    pub struct Event;

    impl DomainEvent for Event {
        const KIND: &'static str = "foo-event";
    }
}

mod bar {
    use super::{Deserialize, DomainEvent, Serialize};

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    pub struct Event;

    impl DomainEvent for Event {
        const KIND: &'static str = "bar-event";
    }
}

#[derive(Default, Aggregate)]
#[aggregate(events(foo::Event, bar::Event))]
pub struct Account {
    #[aggregate(root)]
    root: Root<Self>,
}

impl Apply<foo::Event> for Account {
    fn apply(&mut self, _event: &foo::Event) {}
}

impl Apply<bar::Event> for Account {
    fn apply(&mut self, _event: &bar::Event) {}
}

fn main() {
    let _ = AccountEvent::FooEvent(foo::Event);
    let _ = AccountEvent::BarEvent(bar::Event);

    let mut account = Account::empty("a-1".to_string());
    account.apply_change(foo::Event);
    account.apply_change(bar::Event);
    assert_eq!(account.version(), 1);
}
