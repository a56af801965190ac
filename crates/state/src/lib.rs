pub mod dedup;
pub mod notify;
pub mod observer;
pub mod slice;
pub mod store;

pub use dedup::DedupSet;
pub use notify::{EventKind, Notifier, StateEvent, SubscriptionId};
pub use observer::{Outcome, RouteRule, RouteTable, SliceTag, TrafficObserver};
pub use slice::StateSlice;
pub use store::StateStore;
