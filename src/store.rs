use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;

/// Full owned copy of the keystore contents, keyed by client then by key.
/// Used for snapshotting, restore at startup, and persistence.
pub type KeystoreImage = HashMap<String, HashMap<String, String>>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The error text doubles as the HTTP 404 body for reads.
    #[error("{key} doesn't exist for {client}")]
    NotFound { client: String, key: String },
    /// A write with an empty client, an empty key, or no value field.
    #[error("invalid request")]
    InvalidRequest,
}

/// Per-client partitioned key/value mapping. A client entry exists only
/// while it holds at least one key.
#[derive(Debug, Default)]
pub struct Keystore {
    clients: KeystoreImage,
}

impl Keystore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_image(image: KeystoreImage) -> Self {
        Self { clients: image }
    }

    pub fn get(&self, client: &str, key: &str) -> Result<&str, StoreError> {
        self.clients
            .get(client)
            .and_then(|keys| keys.get(key))
            .map(String::as_str)
            .ok_or_else(|| StoreError::NotFound {
                client: client.to_string(),
                key: key.to_string(),
            })
    }

    /// Stores `value` under `(client, key)`, creating the client namespace
    /// on demand. An empty value is a delete request: the wire protocol
    /// removes a key by posting an empty form value.
    pub fn set(&mut self, client: &str, key: &str, value: &str) -> Result<(), StoreError> {
        if client.is_empty() || key.is_empty() {
            return Err(StoreError::InvalidRequest);
        }
        if value.is_empty() {
            self.delete(client, key);
            return Ok(());
        }
        self.clients
            .entry(client.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    /// Removes `(client, key)`. Deleting a missing key is a no-op, and a
    /// client whose last key is removed disappears from the outer map.
    pub fn delete(&mut self, client: &str, key: &str) {
        if let Some(keys) = self.clients.get_mut(client) {
            keys.remove(key);
            if keys.is_empty() {
                self.clients.remove(client);
            }
        }
    }

    pub fn snapshot(&self) -> KeystoreImage {
        self.clients.clone()
    }

    /// Replaces the entire mapping. Used once at startup with the loaded
    /// image.
    pub fn restore(&mut self, image: KeystoreImage) {
        self.clients = image;
    }

    pub fn clients_len(&self) -> usize {
        self.clients.len()
    }

    pub fn keys_len(&self) -> usize {
        self.clients.values().map(HashMap::len).sum()
    }
}

/// Cloneable handle shared between request handlers and the persistence
/// loop. Every operation takes the lock for exactly one mapping operation,
/// so logically concurrent requests can never observe a half-applied
/// mutation, and `snapshot` copies the mapping without blocking on file I/O.
#[derive(Debug, Clone, Default)]
pub struct SharedKeystore {
    inner: Arc<Mutex<Keystore>>,
}

impl SharedKeystore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_image(image: KeystoreImage) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Keystore::from_image(image))),
        }
    }

    /// Returns an owned copy of the stored value, so callers never alias
    /// the store's internals outside the critical section.
    pub fn get(&self, client: &str, key: &str) -> Result<String, StoreError> {
        self.lock().get(client, key).map(str::to_string)
    }

    pub fn set(&self, client: &str, key: &str, value: &str) -> Result<(), StoreError> {
        self.lock().set(client, key, value)
    }

    pub fn delete(&self, client: &str, key: &str) {
        self.lock().delete(client, key)
    }

    pub fn snapshot(&self) -> KeystoreImage {
        self.lock().snapshot()
    }

    pub fn restore(&self, image: KeystoreImage) {
        self.lock().restore(image)
    }

    pub fn clients_len(&self) -> usize {
        self.lock().clients_len()
    }

    fn lock(&self) -> MutexGuard<'_, Keystore> {
        // Every operation is a single all-or-nothing map call, so the data
        // under a poisoned lock is still consistent.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
