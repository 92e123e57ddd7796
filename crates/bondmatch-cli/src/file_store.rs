use std::collections::BTreeMap;
use std::fs;
use std::io::{ErrorKind, Write as _};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use bondmatch_client_core::StorageError;
use bondmatch_client_core::storage::{KeyValueStore, StorageChange, TabId, foreign_changes};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tokio::sync::broadcast;

const STORE_SCHEMA_VERSION: u32 = 1;
pub const STORE_FILE_NAME: &str = "storage.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct StoreDocument {
    version: u32,
    values: BTreeMap<String, String>,
}

/// [`KeyValueStore`] persisted as one JSON document shared by every process
/// using the same path. Reads go to disk; a batch re-reads the document,
/// applies only its own keys and renames a uniquely named temp file into place.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    write_lock: Mutex<()>,
    changes: broadcast::Sender<StorageChange>,
    tab: TabId,
}

impl FileStore {
    pub fn open(path: PathBuf) -> Self {
        let (changes, _) = broadcast::channel(16);
        Self {
            path,
            write_lock: Mutex::new(()),
            changes,
            tab: TabId::next(),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing, unreadable or unsupported documents read as empty.
    fn load_values(&self) -> BTreeMap<String, String> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == ErrorKind::NotFound => return BTreeMap::new(),
            Err(error) => {
                tracing::warn!(error = %error, path = %self.path.display(), "ignoring unreadable storage file");
                return BTreeMap::new();
            }
        };
        match serde_json::from_str::<StoreDocument>(raw.as_str()) {
            Ok(document) if document.version == STORE_SCHEMA_VERSION => document.values,
            Ok(document) => {
                tracing::warn!(version = document.version, path = %self.path.display(), "ignoring unsupported storage version");
                BTreeMap::new()
            }
            Err(error) => {
                tracing::warn!(error = %error, path = %self.path.display(), "ignoring malformed storage file");
                BTreeMap::new()
            }
        }
    }

    fn flush(&self, values: BTreeMap<String, String>) -> Result<(), StorageError> {
        let directory = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(directory)
            .map_err(|error| StorageError::Write(format!("storage mkdir failed: {error}")))?;
        let encoded = serde_json::to_string_pretty(&StoreDocument {
            version: STORE_SCHEMA_VERSION,
            values,
        })
        .map_err(|error| StorageError::Serialize(error.to_string()))?;

        let mut staging = NamedTempFile::new_in(directory)
            .map_err(|error| StorageError::Write(format!("storage staging failed: {error}")))?;
        staging
            .write_all(encoded.as_bytes())
            .map_err(|error| StorageError::Write(format!("storage write failed: {error}")))?;
        staging
            .persist(&self.path)
            .map(|_| ())
            .map_err(|error| StorageError::Write(format!("storage rename failed: {}", error.error)))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.load_values().remove(key))
    }

    fn write_batch(&self, entries: &[(&str, Option<&str>)]) -> Result<(), StorageError> {
        let guard = self
            .write_lock
            .lock()
            .map_err(|_| StorageError::Write("storage lock poisoned".to_string()))?;
        let mut values = self.load_values();
        let mut applied = Vec::new();
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
        if applied.is_empty() {
            return Ok(());
        }

        self.flush(values)?;
        drop(guard);

        for change in applied {
            let _ = self.changes.send(change);
        }
        Ok(())
    }

    fn subscribe(&self) -> BoxStream<'static, StorageChange> {
        foreign_changes(self.changes.subscribe(), self.tab)
    }
}

#[must_use]
pub fn default_store_path() -> PathBuf {
    if let Some(mut config_dir) = dirs::config_dir() {
        config_dir.push("bondmatch");
        config_dir.push(STORE_FILE_NAME);
        return config_dir;
    }

    if let Some(mut home_dir) = dirs::home_dir() {
        home_dir.push(".bondmatch");
        home_dir.push(STORE_FILE_NAME);
        return home_dir;
    }

    PathBuf::from(STORE_FILE_NAME)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use bondmatch_client_core::storage::{ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY, SEARCH_HISTORY_KEY};
    use bondmatch_client_core::{Credential, TokenStore};

    #[test]
    fn values_survive_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join(STORE_FILE_NAME);

        let store = FileStore::open(path.clone());
        store
            .write_batch(&[
                (ACCESS_TOKEN_KEY, Some("access")),
                (REFRESH_TOKEN_KEY, Some("refresh")),
            ])
            .expect("write");

        let reopened = FileStore::open(path);
        assert_eq!(
            reopened.get(ACCESS_TOKEN_KEY).expect("read"),
            Some("access".to_string())
        );
        assert_eq!(
            reopened.get(REFRESH_TOKEN_KEY).expect("read"),
            Some("refresh".to_string())
        );
    }

    #[test]
    fn removal_is_persisted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(STORE_FILE_NAME);
        let store = FileStore::open(path.clone());
        store.set(ACCESS_TOKEN_KEY, "access").expect("write");
        store.remove(ACCESS_TOKEN_KEY).expect("remove");
        assert_eq!(FileStore::open(path).get(ACCESS_TOKEN_KEY).expect("read"), None);
    }

    #[test]
    fn corrupt_file_opens_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(STORE_FILE_NAME);
        fs::write(&path, "{broken").expect("seed");
        let store = FileStore::open(path);
        assert_eq!(store.get(ACCESS_TOKEN_KEY).expect("read"), None);
        store.set(ACCESS_TOKEN_KEY, "fresh").expect("write over corrupt file");
    }

    #[test]
    fn failed_flush_leaves_values_unchanged() {
        let dir = tempfile::tempdir().expect("tempdir");
        // A directory where the file should be makes the rename fail.
        let path = dir.path().join(STORE_FILE_NAME);
        fs::create_dir_all(&path).expect("blocker");
        let store = FileStore::open(path);
        assert!(store.set(ACCESS_TOKEN_KEY, "access").is_err());
        assert_eq!(store.get(ACCESS_TOKEN_KEY).expect("read"), None);
    }

    #[test]
    fn logout_by_one_handle_survives_unrelated_write_by_another() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(STORE_FILE_NAME);
        let credential = Credential {
            access_token: "old-access".to_string(),
            refresh_token: "old-refresh".to_string(),
        };
        TokenStore::new(Arc::new(FileStore::open(path.clone())))
            .save(&credential)
            .expect("seed");

        let first = Arc::new(FileStore::open(path.clone()));
        let second = Arc::new(FileStore::open(path.clone()));
        assert_eq!(
            TokenStore::new(first.clone()).read().expect("read"),
            Some(credential)
        );

        TokenStore::new(second).clear().expect("logout");
        assert_eq!(TokenStore::new(first.clone()).read().expect("read"), None);

        first.set(SEARCH_HISTORY_KEY, "[]").expect("history write");
        let reopened = Arc::new(FileStore::open(path));
        assert_eq!(TokenStore::new(reopened.clone()).read().expect("read"), None);
        assert_eq!(
            reopened.get(SEARCH_HISTORY_KEY).expect("read"),
            Some("[]".to_string())
        );
    }

    #[test]
    fn handles_on_one_path_see_each_other_immediately() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(STORE_FILE_NAME);
        let first = FileStore::open(path.clone());
        let second = FileStore::open(path);

        first.set(ACCESS_TOKEN_KEY, "from-first").expect("write");
        second.set(REFRESH_TOKEN_KEY, "from-second").expect("write");

        assert_eq!(
            first.get(REFRESH_TOKEN_KEY).expect("read"),
            Some("from-second".to_string())
        );
        assert_eq!(
            second.get(ACCESS_TOKEN_KEY).expect("read"),
            Some("from-first".to_string())
        );
    }

    #[test]
    fn writes_leave_no_staging_files_behind() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(STORE_FILE_NAME);
        let store = FileStore::open(path);
        store.set(ACCESS_TOKEN_KEY, "one").expect("write");
        store.set(ACCESS_TOKEN_KEY, "two").expect("write");

        let names: Vec<_> = fs::read_dir(dir.path())
            .expect("list")
            .map(|entry| entry.expect("entry").file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from(STORE_FILE_NAME)]);
    }
}
