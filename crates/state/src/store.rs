use std::sync::{Arc, PoisonError, RwLock};
use tether_core::{Account, Catalog, HistoryItem, Result, Session};
use tracing::debug;

use crate::dedup::DedupSet;
use crate::notify::{EventKind, Notifier, StateEvent, SubscriptionId};
use crate::slice::StateSlice;

/// The reconstructed remote state: three single-value slices plus the
/// deduplicated history list.
///
/// Every setter replaces the whole value, then raises exactly one
/// notification and hands that same event back to the caller.
pub struct StateStore {
    session: RwLock<StateSlice<Session>>,
    catalog: RwLock<StateSlice<Catalog>>,
    account: RwLock<StateSlice<Account>>,
    history: RwLock<DedupSet<HistoryItem>>,
    notifier: Notifier,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore {
    pub fn new() -> Self {
        Self {
            session: RwLock::new(StateSlice::new("session")),
            catalog: RwLock::new(StateSlice::new("catalog")),
            account: RwLock::new(StateSlice::new("account")),
            history: RwLock::new(DedupSet::new()),
            notifier: Notifier::new(),
        }
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub fn subscribe<F>(&self, kind: EventKind, listener: F) -> SubscriptionId
    where
        F: Fn(&StateEvent) + Send + Sync + 'static,
    {
        self.notifier.subscribe(kind, listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.notifier.unsubscribe(id)
    }

    pub fn set_session(&self, session: Session) -> StateEvent {
        let value = write(&self.session).replace(session);
        self.raise(StateEvent::Session(value))
    }

    pub fn get_session(&self) -> Result<Arc<Session>> {
        read(&self.session).get()
    }

    pub fn set_catalog(&self, catalog: Catalog) -> StateEvent {
        let value = write(&self.catalog).replace(catalog);
        self.raise(StateEvent::Catalog(value))
    }

    pub fn get_catalog(&self) -> Result<Arc<Catalog>> {
        read(&self.catalog).get()
    }

    pub fn set_account(&self, account: Account) -> StateEvent {
        let value = write(&self.account).replace(account);
        self.raise(StateEvent::Account(value))
    }

    pub fn get_account(&self) -> Result<Arc<Account>> {
        read(&self.account).get()
    }

    /// Add a batch of history items. Raises one `history-updated` for the
    /// whole batch if anything new was stored; a batch of known ids is
    /// silent and returns `None`.
    pub fn ingest_history(&self, items: Vec<HistoryItem>) -> Option<StateEvent> {
        let batch = items.len();
        let (inserted, total) = {
            let mut history = write(&self.history);
            let inserted = history.add_all(items);
            (inserted, history.len())
        };
        debug!(batch, inserted, total, "Ingested history batch");
        if inserted == 0 {
            return None;
        }
        Some(self.raise(StateEvent::History { inserted, total }))
    }

    pub fn get_history(&self) -> Vec<HistoryItem> {
        read(&self.history).snapshot()
    }

    pub fn history_item(&self, id: &str) -> Option<HistoryItem> {
        read(&self.history).get(id).cloned()
    }

    pub fn history_len(&self) -> usize {
        read(&self.history).len()
    }

    // Called with no slice lock held.
    fn raise(&self, event: StateEvent) -> StateEvent {
        let delivered = self.notifier.publish(&event);
        debug!(event = %event.kind(), delivered, "State notification raised");
        event
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tether_core::Error;

    fn counter(store: &StateStore, kind: EventKind) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        store.subscribe(kind, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        count
    }

    fn session(token: &str) -> Session {
        Session {
            access_token: Some(token.to_string()),
            ..Session::default()
        }
    }

    #[test]
    fn test_get_before_set_is_uninitialized() {
        let store = StateStore::new();
        assert!(matches!(store.get_session(), Err(Error::UninitializedState("session"))));
        assert!(matches!(store.get_catalog(), Err(Error::UninitializedState("catalog"))));
        assert!(matches!(store.get_account(), Err(Error::UninitializedState("account"))));
    }

    #[test]
    fn test_set_then_get_session() {
        let store = StateStore::new();
        let fired = counter(&store, EventKind::SessionUpdated);
        let event = store.set_session(session("s1"));
        assert_eq!(event.kind(), EventKind::SessionUpdated);
        assert_eq!(store.get_session().unwrap().access_token.as_deref(), Some("s1"));
        store.set_session(session("s2"));
        assert_eq!(store.get_session().unwrap().access_token.as_deref(), Some("s2"));
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_setters_only_notify_their_own_slice() {
        let store = StateStore::new();
        let session_count = counter(&store, EventKind::SessionUpdated);
        let catalog_count = counter(&store, EventKind::CatalogUpdated);
        let account_count = counter(&store, EventKind::AccountUpdated);
        store.set_catalog(Catalog::default());
        store.set_account(Account::default());
        store.set_account(Account::default());
        assert_eq!(session_count.load(Ordering::SeqCst), 0);
        assert_eq!(catalog_count.load(Ordering::SeqCst), 1);
        assert_eq!(account_count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_history_batches_notify_once() {
        let store = StateStore::new();
        let fired = counter(&store, EventKind::HistoryUpdated);

        store.ingest_history(vec![HistoryItem::new("a"), HistoryItem::new("b")]);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        match store.ingest_history(vec![HistoryItem::new("b"), HistoryItem::new("c")]) {
            Some(StateEvent::History { inserted, total }) => {
                assert_eq!(inserted, 1);
                assert_eq!(total, 3);
            }
            other => panic!("expected history event, got {:?}", other),
        }
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        assert_eq!(store.get_history().len(), 3);

        assert!(store.ingest_history(vec![HistoryItem::new("a")]).is_none());
        assert!(store.ingest_history(Vec::new()).is_none());
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_history_is_never_overwritten_by_ingestion() {
        let store = StateStore::new();
        store.ingest_history(vec![HistoryItem::new("a").with("title", json!("original"))]);
        store.ingest_history(vec![HistoryItem::new("a").with("title", json!("renamed"))]);
        assert_eq!(store.history_item("a").unwrap().payload["title"], json!("original"));
    }

    #[test]
    fn test_listener_can_read_store_during_delivery() {
        let store = Arc::new(StateStore::new());
        let seen = Arc::new(std::sync::Mutex::new(None));
        let (s, inner) = (seen.clone(), Arc::downgrade(&store));
        store.subscribe(EventKind::SessionUpdated, move |_| {
            if let Some(store) = inner.upgrade() {
                *s.lock().unwrap() = store.get_session().ok();
            }
        });
        store.set_session(session("visible"));
        let got = seen.lock().unwrap().clone().unwrap();
        assert_eq!(got.access_token.as_deref(), Some("visible"));
    }
}
