//! Key/value storage abstraction.
//!
//! Hosts provide a flat byte-valued store; this crate layers JSON typing on
//! top and ships an in-memory backend used by the server instance, the client
//! replica in tests, and anything else that needs a store without a host.

use std::sync::Arc;

pub mod memory;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error as ThisError;

pub use memory::MemoryStore;

/// Errors surfaced by the storage layer.
#[derive(Debug, ThisError)]
#[non_exhaustive]
pub enum StoreError {
    #[error("serialization error for key {key}: {source}")]
    Serialization {
        key: String,
        source: serde_json::Error,
    },

    #[error("backend error: {0}")]
    Backend(String),
}

/// Raw byte-valued storage as required from the host.
///
/// `update` is a CAS: the backend must not let any concurrent caller
/// interleave between the read and the write of one `update` call.
pub trait Storage: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    fn get_many(&self, keys: &[&str]) -> Result<Vec<Option<Vec<u8>>>, StoreError>;

    fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError>;

    fn set_many(&self, entries: Vec<(String, Vec<u8>)>) -> Result<(), StoreError>;

    /// Read-modify-write without interleaving. The write is abandoned when
    /// the closure fails.
    fn update(
        &self,
        key: &str,
        f: &mut dyn FnMut(Option<Vec<u8>>) -> Result<Vec<u8>, StoreError>,
    ) -> Result<(), StoreError>;

    fn del(&self, key: &str) -> Result<(), StoreError>;
}

/// JSON-typed handle over a [`Storage`] backend.
pub struct Store {
    backend: Arc<dyn Storage>,
}

impl Clone for Store {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
        }
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

impl Store {
    pub fn new(backend: Arc<dyn Storage>) -> Self {
        Self { backend }
    }

    /// A store over a fresh in-memory backend.
    pub fn memory() -> Self {
        Self::new(Arc::new(MemoryStore::default()))
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        let Some(raw) = self.backend.get(key)? else {
            return Ok(None);
        };

        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|source| StoreError::Serialization {
                key: key.to_owned(),
                source,
            })
    }

    pub fn get_many<T: DeserializeOwned>(&self, keys: &[&str]) -> Result<Vec<Option<T>>, StoreError> {
        let raws = self.backend.get_many(keys)?;

        keys.iter()
            .zip(raws)
            .map(|(key, raw)| match raw {
                None => Ok(None),
                Some(raw) => serde_json::from_slice(&raw).map(Some).map_err(|source| {
                    StoreError::Serialization {
                        key: (*key).to_owned(),
                        source,
                    }
                }),
            })
            .collect()
    }

    pub fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let raw = serde_json::to_vec(value).map_err(|source| StoreError::Serialization {
            key: key.to_owned(),
            source,
        })?;

        self.backend.set(key, raw)
    }

    pub fn set_many<T: Serialize>(&self, entries: &[(String, T)]) -> Result<(), StoreError> {
        let raw = entries
            .iter()
            .map(|(key, value)| {
                serde_json::to_vec(value)
                    .map(|bytes| (key.clone(), bytes))
                    .map_err(|source| StoreError::Serialization {
                        key: key.clone(),
                        source,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        self.backend.set_many(raw)
    }

    /// Atomically transform the value under `key` and return the new value.
    pub fn update<T, F>(&self, key: &str, mut f: F) -> Result<T, StoreError>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut(Option<T>) -> T,
    {
        let mut updated = None;

        self.backend.update(key, &mut |raw| {
            let current = match raw {
                None => None,
                Some(raw) => Some(serde_json::from_slice(&raw).map_err(|source| {
                    StoreError::Serialization {
                        key: key.to_owned(),
                        source,
                    }
                })?),
            };

            let next = f(current);
            let encoded =
                serde_json::to_vec(&next).map_err(|source| StoreError::Serialization {
                    key: key.to_owned(),
                    source,
                })?;

            updated = Some(next);
            Ok(encoded)
        })?;

        updated.ok_or_else(|| StoreError::Backend("update closure did not run".to_owned()))
    }

    pub fn del(&self, key: &str) -> Result<(), StoreError> {
        self.backend.del(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_round_trip() {
        let store = Store::memory();

        store.set("answer", &42_u32).unwrap();
        assert_eq!(store.get::<u32>("answer").unwrap(), Some(42));

        store.del("answer").unwrap();
        assert_eq!(store.get::<u32>("answer").unwrap(), None);
    }

    #[test]
    fn update_sees_current_value() {
        let store = Store::memory();

        let first = store
            .update("counter", |v: Option<u32>| v.unwrap_or(0) + 1)
            .unwrap();
        let second = store
            .update("counter", |v: Option<u32>| v.unwrap_or(0) + 1)
            .unwrap();

        assert_eq!(first, 1);
        assert_eq!(second, 2);
        assert_eq!(store.get::<u32>("counter").unwrap(), Some(2));
    }

    #[test]
    fn get_many_preserves_order() {
        let store = Store::memory();
        store.set("a", &"one").unwrap();
        store.set("c", &"three").unwrap();

        let values = store.get_many::<String>(&["a", "b", "c"]).unwrap();
        assert_eq!(
            values,
            vec![Some("one".to_owned()), None, Some("three".to_owned())]
        );
    }
}
