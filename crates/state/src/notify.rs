//! Typed publish/subscribe for state-change notifications.
//!
//! Delivery is synchronous on the publishing thread, in subscription
//! order, exactly once per change for every subscriber registered at the
//! time of publishing. Listeners must not block.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tether_core::{Account, Catalog, Error, Session};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    SessionUpdated,
    CatalogUpdated,
    AccountUpdated,
    HistoryUpdated,
}

impl EventKind {
    pub const ALL: [EventKind; 4] = [
        EventKind::SessionUpdated,
        EventKind::CatalogUpdated,
        EventKind::AccountUpdated,
        EventKind::HistoryUpdated,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::SessionUpdated => "session-updated",
            EventKind::CatalogUpdated => "catalog-updated",
            EventKind::AccountUpdated => "account-updated",
            EventKind::HistoryUpdated => "history-updated",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| Error::NotFound(format!("unknown event kind '{}'", s)))
    }
}

/// A change notification carrying the updated slice value.
#[derive(Debug, Clone)]
pub enum StateEvent {
    Session(Arc<Session>),
    Catalog(Arc<Catalog>),
    Account(Arc<Account>),
    History { inserted: usize, total: usize },
}

impl StateEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            StateEvent::Session(_) => EventKind::SessionUpdated,
            StateEvent::Catalog(_) => EventKind::CatalogUpdated,
            StateEvent::Account(_) => EventKind::AccountUpdated,
            StateEvent::History { .. } => EventKind::HistoryUpdated,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Listener = Arc<dyn Fn(&StateEvent) + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    kind: EventKind,
    listener: Listener,
}

pub struct Notifier {
    next_id: AtomicU64,
    subscriptions: RwLock<Vec<Subscription>>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            subscriptions: RwLock::new(Vec::new()),
        }
    }

    pub fn subscribe<F>(&self, kind: EventKind, listener: F) -> SubscriptionId
    where
        F: Fn(&StateEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscription {
                id,
                kind,
                listener: Arc::new(listener),
            });
        id
    }

    /// Forward every event of `kind` into an unbounded channel, for async
    /// consumers. Sends to a dropped receiver are discarded.
    pub fn subscribe_channel(
        &self,
        kind: EventKind,
    ) -> (SubscriptionId, mpsc::UnboundedReceiver<StateEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.subscribe(kind, move |event| {
            let _ = tx.send(event.clone());
        });
        (id, rx)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self
            .subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = subs.len();
        subs.retain(|s| s.id != id);
        subs.len() != before
    }

    /// Deliver `event` to every matching subscriber. Returns how many were
    /// called.
    pub fn publish(&self, event: &StateEvent) -> usize {
        let kind = event.kind();
        // Listeners run outside the lock so they may (un)subscribe.
        let listeners: Vec<Listener> = self
            .subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|s| s.kind == kind)
            .map(|s| s.listener.clone())
            .collect();
        for listener in &listeners {
            listener(event);
        }
        listeners.len()
    }
}
