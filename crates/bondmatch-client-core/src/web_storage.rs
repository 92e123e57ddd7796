//! `window.localStorage` as a [`KeyValueStore`] for browser builds.

use std::cell::RefCell;

use futures::stream::BoxStream;
use tokio::sync::broadcast;
use wasm_bindgen::JsCast;
use wasm_bindgen::prelude::Closure;

use crate::error::StorageError;
use crate::storage::{KeyValueStore, StorageChange, TabId, foreign_changes};

const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// The single `storage` listener registered on `window` and the channel it
/// feeds. Kept for the life of the page so the callback is never freed while
/// the browser can still call it.
struct StorageListener {
    changes: broadcast::Sender<StorageChange>,
    _callback: Closure<dyn FnMut(web_sys::StorageEvent)>,
}

thread_local! {
    static STORAGE_LISTENER: RefCell<Option<StorageListener>> = const { RefCell::new(None) };
}

/// Browsers deliver `storage` events only to other tabs, so every event seen
/// here is foreign.
pub struct WebLocalStorage {
    changes: broadcast::Sender<StorageChange>,
    tab: TabId,
}

impl WebLocalStorage {
    /// Every handle shares one `window` listener; attaching again reuses it.
    pub fn attach() -> Result<Self, StorageError> {
        local_storage()?;
        let changes = match STORAGE_LISTENER.with(|slot| {
            slot.borrow()
                .as_ref()
                .map(|listener| listener.changes.clone())
        }) {
            Some(changes) => changes,
            None => register_listener()?,
        };
        Ok(Self {
            changes,
            tab: TabId::next(),
        })
    }
}

fn register_listener() -> Result<broadcast::Sender<StorageChange>, StorageError> {
    let window = web_sys::window()
        .ok_or_else(|| StorageError::Unavailable("window is unavailable".to_string()))?;
    let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
    let sender = changes.clone();
    let callback = Closure::<dyn FnMut(web_sys::StorageEvent)>::new(
        move |event: web_sys::StorageEvent| {
            let _ = sender.send(StorageChange {
                key: event.key(),
                old_value: event.old_value(),
                new_value: event.new_value(),
                origin: TabId::FOREIGN,
            });
        },
    );
    window
        .add_event_listener_with_callback("storage", callback.as_ref().unchecked_ref())
        .map_err(|_| {
            StorageError::Unavailable("failed to listen for storage events".to_string())
        })?;
    STORAGE_LISTENER.with(|slot| {
        *slot.borrow_mut() = Some(StorageListener {
            changes: changes.clone(),
            _callback: callback,
        });
    });
    Ok(changes)
}

fn local_storage() -> Result<web_sys::Storage, StorageError> {
    let window = web_sys::window()
        .ok_or_else(|| StorageError::Unavailable("window is unavailable".to_string()))?;
    window
        .local_storage()
        .map_err(|_| StorageError::Unavailable("local storage access denied".to_string()))?
        .ok_or_else(|| StorageError::Unavailable("local storage is disabled".to_string()))
}

impl KeyValueStore for WebLocalStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        local_storage()?
            .get_item(key)
            .map_err(|_| StorageError::Unavailable(format!("failed to read {key}")))
    }

    fn write_batch(&self, entries: &[(&str, Option<&str>)]) -> Result<(), StorageError> {
        let storage = local_storage()?;
        let mut written: Vec<(&str, Option<String>)> = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            let previous = storage
                .get_item(key)
                .map_err(|_| StorageError::Unavailable(format!("failed to read {key}")))?;
            let result = match value {
                Some(value) => storage.set_item(key, value),
                None => storage.remove_item(key),
            };
            if result.is_err() {
                restore(&storage, &written);
                return Err(StorageError::Write(format!("failed to write {key}")));
            }
            written.push((*key, previous));
        }
        Ok(())
    }

    fn subscribe(&self) -> BoxStream<'static, StorageChange> {
        foreign_changes(self.changes.subscribe(), self.tab)
    }
}

/// Best effort: undoes a partially applied batch, newest write first.
fn restore(storage: &web_sys::Storage, written: &[(&str, Option<String>)]) {
    for (key, previous) in written.iter().rev() {
        let restored = match previous {
            Some(value) => storage.set_item(key, value),
            None => storage.remove_item(key),
        };
        if restored.is_err() {
            tracing::warn!(key, "failed to roll back partial storage write");
        }
    }
}
