//! Identity-keyed, first-write-wins collection.
//!
//! `add` never overwrites: replacing an entry takes an explicit `remove`
//! followed by `add`.

use std::collections::HashMap;
use tether_core::Identified;

#[derive(Debug, Clone)]
pub struct DedupSet<T> {
    items: HashMap<String, T>,
}

impl<T> Default for DedupSet<T> {
    fn default() -> Self {
        Self {
            items: HashMap::new(),
        }
    }
}

impl<T: Identified + Clone> DedupSet<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.items.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&T> {
        self.items.get(id)
    }

    /// Insert `item` unless its id is already present. Returns whether it
    /// was inserted.
    pub fn add(&mut self, item: T) -> bool {
        if self.items.contains_key(item.id()) {
            return false;
        }
        self.items.insert(item.id().to_string(), item);
        true
    }

    /// Returns how many items were newly inserted. Duplicates inside the
    /// batch itself are resolved the same way: the first one wins.
    pub fn add_all<I: IntoIterator<Item = T>>(&mut self, items: I) -> usize {
        let mut inserted = 0;
        for item in items {
            if self.add(item) {
                inserted += 1;
            }
        }
        inserted
    }

    pub fn remove(&mut self, id: &str) -> bool {
        self.items.remove(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Owned copy of every stored item. Order is unspecified.
    pub fn snapshot(&self) -> Vec<T> {
        self.items.values().cloned().collect()
    }
}
