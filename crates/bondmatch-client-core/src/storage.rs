//! Injectable persisted key/value storage with change notifications.
//!
//! The browser's origin-wide `localStorage` is the model: every tab sees the same
//! values, and each write is announced to every tab except the writer.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::broadcast;

use crate::error::StorageError;

pub const ACCESS_TOKEN_KEY: &str = "access_token";
pub const REFRESH_TOKEN_KEY: &str = "refresh_token";
pub const SEARCH_HISTORY_KEY: &str = "bondSearchHistory";
pub const LAST_USERNAME_KEY: &str = "lastUsername";

const CHANGE_CHANNEL_CAPACITY: usize = 64;

static NEXT_TAB_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one client instance (a browser tab, a CLI process).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TabId(u64);

impl TabId {
    /// Origin assigned to changes that arrive from outside this process.
    pub const FOREIGN: Self = Self(0);

    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_TAB_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

/// One observed write. `key == None` means the whole area was cleared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageChange {
    pub key: Option<String>,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub origin: TabId,
}

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Applies every entry as one write; `None` removes the key. A failed batch
    /// restores the keys it had already written before returning the error.
    fn write_batch(&self, entries: &[(&str, Option<&str>)]) -> Result<(), StorageError>;

    /// Changes made by other tabs. Writes made through this handle are not echoed back.
    fn subscribe(&self) -> BoxStream<'static, StorageChange>;

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.write_batch(&[(key, Some(value))])
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.write_batch(&[(key, None)])
    }
}

/// Shared storage area; hand out one [`MemoryStore`] per simulated tab.
#[derive(Debug)]
struct MemoryArea {
    values: Mutex<BTreeMap<String, String>>,
    changes: broadcast::Sender<StorageChange>,
}

/// In-memory [`KeyValueStore`]. Handles created with [`MemoryStore::open_tab`]
/// share values and see each other's writes as change events.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    area: Arc<MemoryArea>,
    tab: TabId,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            area: Arc::new(MemoryArea {
                values: Mutex::new(BTreeMap::new()),
                changes,
            }),
            tab: TabId::next(),
        }
    }

    /// Another tab over the same storage area.
    #[must_use]
    pub fn open_tab(&self) -> Self {
        Self {
            area: Arc::clone(&self.area),
            tab: TabId::next(),
        }
    }

    #[must_use]
    pub fn tab(&self) -> TabId {
        self.tab
    }

    /// Removes every key, announcing a single area-wide change.
    pub fn clear_all(&self) {
        {
            let mut values = self
                .area
                .values
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            values.clear();
        }
        let _ = self.area.changes.send(StorageChange {
            key: None,
            old_value: None,
            new_value: None,
            origin: self.tab,
        });
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let values = self
            .area
            .values
            .lock()
            .map_err(|_| StorageError::Unavailable("memory storage lock poisoned".to_string()))?;
        Ok(values.get(key).cloned())
    }

    fn write_batch(&self, entries: &[(&str, Option<&str>)]) -> Result<(), StorageError> {
        let mut applied = Vec::with_capacity(entries.len());
        {
            let mut values = self
                .area
                .values
                .lock()
                .map_err(|_| StorageError::Write("memory storage lock poisoned".to_string()))?;
            for (key, value) in entries {
                let old_value = match value {
                    Some(value) => values.insert((*key).to_string(), (*value).to_string()),
                    None => values.remove(*key),
                };
                let new_value = value.map(str::to_string);
                if old_value != new_value {
                    applied.push(StorageChange {
                        key: Some((*key).to_string()),
                        old_value,
                        new_value,
                        origin: self.tab,
                    });
                }
            }
        }

        for change in applied {
            // No receivers simply means no other tab is listening.
            let _ = self.area.changes.send(change);
        }
        Ok(())
    }

    fn subscribe(&self) -> BoxStream<'static, StorageChange> {
        foreign_changes(self.area.changes.subscribe(), self.tab)
    }
}

/// Turns a broadcast receiver into a stream of changes not written by `own_tab`.
///
/// A lagging receiver yields one area-wide change so the listener re-reads
/// everything instead of silently missing writes.
pub fn foreign_changes(
    receiver: broadcast::Receiver<StorageChange>,
    own_tab: TabId,
) -> BoxStream<'static, StorageChange> {
    stream::unfold(receiver, move |mut receiver| async move {
        loop {
            match receiver.recv().await {
                Ok(change) if change.origin == own_tab => {}
                Ok(change) => return Some((change, receiver)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "storage change listener lagged; forcing resync");
                    let resync = StorageChange {
                        key: None,
                        old_value: None,
                        new_value: None,
                        origin: TabId::FOREIGN,
                    };
                    return Some((resync, receiver));
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .boxed()
}
