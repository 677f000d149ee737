//! In-memory [`Storage`] backend.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::{Storage, StoreError};

/// A [`Storage`] backend over a mutex-guarded map.
///
/// The mutex is held for the whole of `update`, which gives it the required
/// CAS semantics.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>>, StoreError> {
        self.entries
            .lock()
            .map_err(|_| StoreError::Backend("storage mutex poisoned".to_owned()))
    }
}

impl Storage for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn get_many(&self, keys: &[&str]) -> Result<Vec<Option<Vec<u8>>>, StoreError> {
        let entries = self.lock()?;
        Ok(keys.iter().map(|key| entries.get(*key).cloned()).collect())
    }

    fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        let _ = self.lock()?.insert(key.to_owned(), value);
        Ok(())
    }

    fn set_many(&self, entries: Vec<(String, Vec<u8>)>) -> Result<(), StoreError> {
        let mut guard = self.lock()?;
        for (key, value) in entries {
            let _ = guard.insert(key, value);
        }
        Ok(())
    }

    fn update(
        &self,
        key: &str,
        f: &mut dyn FnMut(Option<Vec<u8>>) -> Result<Vec<u8>, StoreError>,
    ) -> Result<(), StoreError> {
        let mut guard = self.lock()?;
        let current = guard.get(key).cloned();
        let next = f(current)?;
        let _ = guard.insert(key.to_owned(), next);
        Ok(())
    }

    fn del(&self, key: &str) -> Result<(), StoreError> {
        let _ = self.lock()?.remove(key);
        Ok(())
    }
}
