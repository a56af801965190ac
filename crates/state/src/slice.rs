use std::sync::Arc;
use tether_core::{Error, Result};

/// A single current value that starts unset. Reading before the first
/// write is an error, never a default.
#[derive(Debug)]
pub struct StateSlice<T> {
    name: &'static str,
    value: Option<Arc<T>>,
}

impl<T> StateSlice<T> {
    pub fn new(name: &'static str) -> Self {
        Self { name, value: None }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_set(&self) -> bool {
        self.value.is_some()
    }

    pub fn get(&self) -> Result<Arc<T>> {
        self.value
            .clone()
            .ok_or(Error::UninitializedState(self.name))
    }

    /// Whole-value replace. Returns the stored value.
    pub fn replace(&mut self, value: T) -> Arc<T> {
        let value = Arc::new(value);
        self.value = Some(value.clone());
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_before_write_fails() {
        let slice: StateSlice<u32> = StateSlice::new("counter");
        assert!(!slice.is_set());
        match slice.get() {
            Err(Error::UninitializedState(name)) => assert_eq!(name, "counter"),
            other => panic!("expected uninitialized error, got {:?}", other),
        }
    }

    #[test]
    fn test_replace_overwrites() {
        let mut slice = StateSlice::new("counter");
        slice.replace(1u32);
        let old = slice.get().unwrap();
        slice.replace(2u32);
        assert_eq!(*old, 1);
        assert_eq!(*slice.get().unwrap(), 2);
    }
}
