//! Rendezvous key-value store for small metadata blobs.
//!
//! Every key owns a watch slot. A `get` on a missing key parks on the slot
//! until a `put` fills it or the caller's timeout runs out.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;

use crate::error::{CoordinationError, Result};

type Slot = watch::Sender<Option<Vec<u8>>>;

#[derive(Default)]
pub struct KeyValueStore {
    slots: Mutex<HashMap<String, Slot>>,
}

impl KeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` under `key`, replacing any previous value and waking
    /// blocked readers.
    pub async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        check_key(key)?;
        let mut slots = self.lock_slots();
        match slots.get(key) {
            Some(slot) => {
                slot.send_replace(Some(value));
            }
            None => {
                let (slot, _) = watch::channel(Some(value));
                slots.insert(key.to_string(), slot);
            }
        }
        tracing::debug!("KV put {}", key);
        Ok(())
    }

    /// Read `key`, waiting up to `timeout` for it to be written.
    ///
    /// A zero timeout does not wait. Dropping the returned future only
    /// drops this reader; an empty slot it created is released.
    pub async fn get(&self, key: &str, timeout: Duration) -> Result<Vec<u8>> {
        check_key(key)?;

        // Dropped after `rx`, so an expired or cancelled wait leaves no empty slot
        let _release = ReleaseEmpty { store: self, key };
        let mut rx = {
            let mut slots = self.lock_slots();
            let slot = slots
                .entry(key.to_string())
                .or_insert_with(|| watch::channel(None).0);
            if let Some(value) = slot.borrow().as_ref() {
                return Ok(value.clone());
            }
            slot.subscribe()
        };

        if timeout.is_zero() {
            return Err(missing(key));
        }

        let outcome = tokio::time::timeout(timeout, async {
            rx.wait_for(Option::is_some)
                .await
                .map(|value| value.clone())
        })
        .await;
        match outcome {
            Ok(Ok(Some(value))) => Ok(value),
            Ok(Ok(None)) | Err(_) => {
                tracing::debug!("KV get {} timed out after {:?}", key, timeout);
                Err(missing(key))
            }
            Ok(Err(_)) => Err(CoordinationError::aborted(format!(
                "key {} was purged while waiting",
                key
            ))),
        }
    }

    /// Remove `key`. Deleting a missing key is not an error.
    pub async fn delete(&self, key: &str) -> Result<()> {
        check_key(key)?;
        let mut slots = self.lock_slots();
        if let Some(slot) = slots.get(key) {
            if slot.receiver_count() == 0 {
                slots.remove(key);
            } else {
                // Readers are parked on this slot, keep it for the next put
                slot.send_replace(None);
            }
            tracing::debug!("KV delete {}", key);
        }
        Ok(())
    }

    /// All entries whose key starts with `prefix`, sorted by key.
    pub async fn get_directory(&self, prefix: &str) -> Vec<(String, Vec<u8>)> {
        let slots = self.lock_slots();
        let mut entries: Vec<(String, Vec<u8>)> = slots
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .filter_map(|(key, slot)| slot.borrow().clone().map(|value| (key.clone(), value)))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    pub async fn len(&self) -> usize {
        let slots = self.lock_slots();
        slots.values().filter(|slot| slot.borrow().is_some()).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drop every entry. Readers still waiting get `Aborted`.
    pub async fn clear(&self) {
        let mut slots = self.lock_slots();
        let purged = slots.len();
        slots.clear();
        tracing::info!("Purged {} KV slots", purged);
    }

    fn lock_slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        // The map is never left half-updated, a poisoned lock is still usable
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn release_empty(&self, key: &str) {
        let mut slots = self.lock_slots();
        let unused = slots
            .get(key)
            .map_or(false, |slot| slot.borrow().is_none() && slot.receiver_count() == 0);
        if unused {
            slots.remove(key);
        }
    }
}

/// Releases the slot of a `get` once its reader is gone, however the
/// read ends.
struct ReleaseEmpty<'a> {
    store: &'a KeyValueStore,
    key: &'a str,
}

impl Drop for ReleaseEmpty<'_> {
    fn drop(&mut self) {
        self.store.release_empty(self.key);
    }
}

fn check_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(CoordinationError::invalid_argument("key must not be empty"));
    }
    Ok(())
}

fn missing(key: &str) -> CoordinationError {
    CoordinationError::not_found(format!("key {} not found", key))
}
