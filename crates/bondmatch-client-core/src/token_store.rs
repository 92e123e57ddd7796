use std::sync::Arc;

use crate::credential::Credential;
use crate::error::StorageError;
use crate::storage::{ACCESS_TOKEN_KEY, KeyValueStore, LAST_USERNAME_KEY, REFRESH_TOKEN_KEY};

/// The only writer of credential keys in persisted storage.
#[derive(Clone)]
pub struct TokenStore {
    store: Arc<dyn KeyValueStore>,
}

impl TokenStore {
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    #[must_use]
    pub fn backing(&self) -> Arc<dyn KeyValueStore> {
        Arc::clone(&self.store)
    }

    pub fn save(&self, credential: &Credential) -> Result<(), StorageError> {
        self.store.write_batch(&[
            (ACCESS_TOKEN_KEY, Some(credential.access_token.as_str())),
            (REFRESH_TOKEN_KEY, Some(credential.refresh_token.as_str())),
        ])
    }

    /// A half-present pair (one key missing or empty) reads as absent.
    pub fn read(&self) -> Result<Option<Credential>, StorageError> {
        let access_token = non_empty(self.store.get(ACCESS_TOKEN_KEY)?);
        let refresh_token = non_empty(self.store.get(REFRESH_TOKEN_KEY)?);
        Ok(match (access_token, refresh_token) {
            (Some(access_token), Some(refresh_token)) => Some(Credential {
                access_token,
                refresh_token,
            }),
            _ => None,
        })
    }

    pub fn clear(&self) -> Result<(), StorageError> {
        self.store
            .write_batch(&[(ACCESS_TOKEN_KEY, None), (REFRESH_TOKEN_KEY, None)])
    }

    pub fn update_access_only(&self, access_token: &str) -> Result<(), StorageError> {
        self.store.set(ACCESS_TOKEN_KEY, access_token)
    }

    pub fn remember_username(&self, username: &str) -> Result<(), StorageError> {
        self.store.set(LAST_USERNAME_KEY, username)
    }

    #[must_use]
    pub fn last_username(&self) -> Option<String> {
        match self.store.get(LAST_USERNAME_KEY) {
            Ok(value) => non_empty(value),
            Err(error) => {
                tracing::warn!(error = %error, "failed to read last username");
                None
            }
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}
